//! Cheaply cloneable, immutable strings.
//!
//! Endpoint names, environment names, and scope entries are copied onto every
//! request path; `ArcStr` makes those clones a refcount bump.

use std::fmt::Display;

pub use arcstr::{ArcStr, literal};

pub type Strng = ArcStr;

pub fn new<T: AsRef<str>>(s: T) -> Strng {
	ArcStr::from(s.as_ref())
}

pub fn format(args: std::fmt::Arguments) -> Strng {
	match args.as_str() {
		Some(s) => ArcStr::from(s),
		None => ArcStr::from(args.to_string()),
	}
}

#[macro_export]
macro_rules! strng {
	($($arg:tt)*) => {
		$crate::strng::format(format_args!($($arg)*))
	};
}

pub fn display<T: Display>(d: T) -> Strng {
	new(d.to_string())
}
