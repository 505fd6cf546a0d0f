use chrono::{Duration as ChronoDuration, Utc};

use super::*;

fn record_for(plaintext: &str) -> TokenRecord {
	let salt = b"0123456789abcdef".to_vec();
	let hash = derive_hash(plaintext, &salt, MIN_ITERATIONS);
	TokenRecord {
		id: 1,
		username: "svc-integration".to_string(),
		token_hash: hash.to_vec(),
		token_salt: salt,
		iterations: MIN_ITERATIONS,
		token_prefix: None,
		created_at: Utc::now(),
		expires_at: None,
		revoked_at: None,
		allowed_scopes: "*".to_string(),
		allowed_environments: "*".to_string(),
		description: String::new(),
	}
}

#[test]
fn verify_accepts_matching_plaintext() {
	let rec = record_for("s3cret-token");
	assert!(rec.verify("s3cret-token"));
}

#[test]
fn verify_rejects_wrong_plaintext() {
	let rec = record_for("s3cret-token");
	assert!(!rec.verify("s3cret-tokem"));
	assert!(!rec.verify(""));
}

#[test]
fn derivation_is_deterministic_and_salt_sensitive() {
	let a = derive_hash("tok", b"salt-a", MIN_ITERATIONS);
	let b = derive_hash("tok", b"salt-a", MIN_ITERATIONS);
	let c = derive_hash("tok", b"salt-b", MIN_ITERATIONS);
	assert_eq!(a, b);
	assert_ne!(a, c);
	assert_eq!(a.len(), HASH_LEN);
}

#[test]
fn iteration_floor_is_enforced() {
	// A record claiming fewer iterations is still derived at the floor, so a
	// tampered count cannot cheapen verification.
	let salt = b"salty".to_vec();
	let hash = derive_hash("tok", &salt, MIN_ITERATIONS);
	let mut rec = record_for("tok");
	rec.token_salt = salt;
	rec.token_hash = hash.to_vec();
	rec.iterations = 1;
	assert!(rec.verify("tok"));
}

#[test]
fn active_window() {
	let now = Utc::now();
	let mut rec = record_for("tok");
	assert!(rec.is_active(now));

	rec.expires_at = Some(now + ChronoDuration::hours(1));
	assert!(rec.is_active(now));

	rec.expires_at = Some(now - ChronoDuration::seconds(1));
	assert!(!rec.is_active(now));

	rec.expires_at = None;
	rec.revoked_at = Some(now);
	assert!(!rec.is_active(now));
}

#[test]
fn lookup_prefix_is_stable_and_key_dependent() {
	let a = lookup_prefix(b"server-key", "token-1");
	let b = lookup_prefix(b"server-key", "token-1");
	let c = lookup_prefix(b"other-key", "token-1");
	let d = lookup_prefix(b"server-key", "token-2");
	assert_eq!(a, b);
	assert_ne!(a, c);
	assert_ne!(a, d);
	assert_eq!(a.len(), PREFIX_BYTES * 2);
}

#[test]
fn debug_never_leaks_hash_material() {
	let rec = record_for("tok");
	let dbg = format!("{rec:?}");
	assert!(!dbg.contains("token_hash"));
	assert!(!dbg.contains("token_salt"));
	assert!(!dbg.contains(&hex::encode(&rec.token_hash)));
}
