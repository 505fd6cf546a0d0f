//! Token records and verification.
//!
//! Plaintext tokens are never persisted. The stored hash is a
//! PBKDF2-HMAC-SHA256 derivation over a per-record salt, and comparison is
//! constant time. `token_prefix` (first bytes of an HMAC keyed by a
//! store-wide server key) lets the gateway fetch only the candidate records
//! instead of re-deriving every active token per request.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::*;

#[cfg(test)]
#[path = "token_tests.rs"]
mod tests;

pub const MIN_ITERATIONS: u32 = 10_000;
pub const HASH_LEN: usize = 32;
/// Bytes of the lookup HMAC kept as the indexable prefix.
pub const PREFIX_BYTES: usize = 8;

#[derive(Clone)]
pub struct TokenRecord {
	pub id: i64,
	pub username: String,
	pub token_hash: Vec<u8>,
	pub token_salt: Vec<u8>,
	pub iterations: u32,
	/// Hex lookup prefix; records issued before the prefix key existed have
	/// none and are found by the fallback scan.
	pub token_prefix: Option<String>,
	pub created_at: DateTime<Utc>,
	pub expires_at: Option<DateTime<Utc>>,
	pub revoked_at: Option<DateTime<Utc>>,
	pub allowed_scopes: String,
	pub allowed_environments: String,
	pub description: String,
}

impl TokenRecord {
	pub fn is_active(&self, now: DateTime<Utc>) -> bool {
		self.revoked_at.is_none() && self.expires_at.is_none_or(|exp| exp > now)
	}

	/// Constant-time verification of a presented plaintext.
	pub fn verify(&self, plaintext: &str) -> bool {
		let iterations = self.iterations.max(MIN_ITERATIONS);
		let derived = derive_hash(plaintext, &self.token_salt, iterations);
		derived.ct_eq(self.token_hash.as_slice()).into()
	}
}

impl std::fmt::Debug for TokenRecord {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("TokenRecord")
			.field("id", &self.id)
			.field("username", &self.username)
			// hash and salt intentionally omitted
			.field("token_prefix", &self.token_prefix)
			.field("created_at", &self.created_at)
			.field("expires_at", &self.expires_at)
			.field("revoked_at", &self.revoked_at)
			.field("allowed_scopes", &self.allowed_scopes)
			.field("allowed_environments", &self.allowed_environments)
			.finish()
	}
}

pub fn derive_hash(plaintext: &str, salt: &[u8], iterations: u32) -> [u8; HASH_LEN] {
	let mut out = [0u8; HASH_LEN];
	pbkdf2::pbkdf2_hmac::<Sha256>(plaintext.as_bytes(), salt, iterations, &mut out);
	out
}

/// Non-reversible lookup prefix: hex of the first [`PREFIX_BYTES`] bytes of
/// HMAC-SHA256(server_key, plaintext). The admin tool computes the same value
/// at issue time.
pub fn lookup_prefix(server_key: &[u8], plaintext: &str) -> String {
	let mut mac = Hmac::<Sha256>::new_from_slice(server_key)
		.expect("hmac accepts keys of any length");
	mac.update(plaintext.as_bytes());
	let digest = mac.finalize().into_bytes();
	hex::encode(&digest[..PREFIX_BYTES])
}
