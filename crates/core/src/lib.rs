pub mod arc;
pub mod strng;
pub mod telemetry;

pub use strng::Strng;
