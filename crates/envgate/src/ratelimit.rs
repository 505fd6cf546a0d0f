//! Token-bucket rate limiting, keyed independently by client IP and by
//! bearer identity.
//!
//! Buckets refill linearly across the window. A key that stays quiet for 10
//! windows is forgotten by the background sweep, so the maps track active
//! clients rather than everyone ever seen.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Instant;

use sha2::{Digest, Sha256};

use crate::config::RateLimiting;
use crate::*;

#[derive(Debug, Clone, PartialEq)]
pub enum RateDecision {
	Allowed,
	Limited { retry_after_secs: u64 },
}

struct Bucket {
	tokens: f64,
	last_refill: Instant,
	last_seen: Instant,
}

struct KeyedBuckets {
	limit: u32,
	window: Duration,
	buckets: parking_lot::Mutex<HashMap<String, Bucket>>,
}

impl KeyedBuckets {
	fn new(limit: u32, window: Duration) -> Self {
		Self {
			limit,
			window,
			buckets: parking_lot::Mutex::new(HashMap::new()),
		}
	}

	fn check_at(&self, key: &str, now: Instant) -> RateDecision {
		let refill_per_sec = self.limit as f64 / self.window.as_secs_f64();
		let mut buckets = self.buckets.lock();
		let bucket = buckets.entry(key.to_string()).or_insert_with(|| Bucket {
			tokens: self.limit as f64,
			last_refill: now,
			last_seen: now,
		});

		let elapsed = now.saturating_duration_since(bucket.last_refill);
		bucket.tokens =
			(bucket.tokens + elapsed.as_secs_f64() * refill_per_sec).min(self.limit as f64);
		bucket.last_refill = now;
		bucket.last_seen = now;

		if bucket.tokens >= 1.0 {
			bucket.tokens -= 1.0;
			RateDecision::Allowed
		} else {
			let deficit = 1.0 - bucket.tokens;
			RateDecision::Limited {
				retry_after_secs: (deficit / refill_per_sec).ceil() as u64,
			}
		}
	}

	fn evict_idle(&self, now: Instant) {
		let horizon = self.window * 10;
		let mut buckets = self.buckets.lock();
		buckets.retain(|_, b| now.saturating_duration_since(b.last_seen) < horizon);
	}

	fn len(&self) -> usize {
		self.buckets.lock().len()
	}
}

pub struct RateLimiter {
	enabled: bool,
	ip: KeyedBuckets,
	token: KeyedBuckets,
}

impl RateLimiter {
	pub fn new(cfg: &RateLimiting) -> Arc<Self> {
		Arc::new(Self {
			enabled: cfg.enabled,
			ip: KeyedBuckets::new(
				cfg.ip_limit,
				Duration::from_secs(cfg.ip_window_seconds.max(1)),
			),
			token: KeyedBuckets::new(
				cfg.token_limit,
				Duration::from_secs(cfg.token_window_seconds.max(1)),
			),
		})
	}

	/// Both limiters must admit the request.
	pub fn check(&self, ip: Option<IpAddr>, bearer: Option<&str>) -> RateDecision {
		self.check_at(ip, bearer, Instant::now())
	}

	pub fn check_at(
		&self,
		ip: Option<IpAddr>,
		bearer: Option<&str>,
		now: Instant,
	) -> RateDecision {
		if !self.enabled {
			return RateDecision::Allowed;
		}
		if let Some(ip) = ip {
			if let RateDecision::Limited { retry_after_secs } =
				self.ip.check_at(&ip.to_string(), now)
			{
				return RateDecision::Limited { retry_after_secs };
			}
		}
		if let Some(bearer) = bearer {
			// Key on a digest so the plaintext token is not retained in the map.
			let key = token_key(bearer);
			if let RateDecision::Limited { retry_after_secs } = self.token.check_at(&key, now) {
				return RateDecision::Limited { retry_after_secs };
			}
		}
		RateDecision::Allowed
	}

	pub fn spawn_sweeper(self: &Arc<Self>) {
		let limiter = self.clone();
		let interval = limiter.ip.window.max(limiter.token.window);
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(interval);
			ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
			loop {
				ticker.tick().await;
				let now = Instant::now();
				limiter.ip.evict_idle(now);
				limiter.token.evict_idle(now);
				trace!(
					ip_buckets = limiter.ip.len(),
					token_buckets = limiter.token.len(),
					"rate limit buckets swept"
				);
			}
		});
	}

	pub fn stats(&self) -> serde_json::Value {
		serde_json::json!({
			"enabled": self.enabled,
			"ipBuckets": self.ip.len(),
			"tokenBuckets": self.token.len(),
		})
	}
}

fn token_key(bearer: &str) -> String {
	let digest = Sha256::digest(bearer.as_bytes());
	hex::encode(&digest[..16])
}

#[cfg(test)]
mod tests {
	use super::*;

	fn limiter(ip_limit: u32, token_limit: u32, window: u64) -> Arc<RateLimiter> {
		RateLimiter::new(&RateLimiting {
			enabled: true,
			ip_limit,
			ip_window_seconds: window,
			token_limit,
			token_window_seconds: window,
		})
	}

	const IP: Option<IpAddr> = Some(IpAddr::V4(std::net::Ipv4Addr::new(10, 0, 0, 1)));

	#[test]
	fn third_request_in_window_is_limited() {
		// S5: IpLimit=2 over 60s — 200, 200, 429.
		let rl = limiter(2, 1000, 60);
		let now = Instant::now();
		assert_eq!(rl.check_at(IP, None, now), RateDecision::Allowed);
		assert_eq!(rl.check_at(IP, None, now), RateDecision::Allowed);
		match rl.check_at(IP, None, now) {
			RateDecision::Limited { retry_after_secs } => assert!(retry_after_secs >= 1),
			RateDecision::Allowed => panic!("third request must be limited"),
		}
	}

	#[test]
	fn buckets_refill_linearly() {
		let rl = limiter(2, 1000, 60);
		let now = Instant::now();
		rl.check_at(IP, None, now);
		rl.check_at(IP, None, now);
		assert!(matches!(
			rl.check_at(IP, None, now),
			RateDecision::Limited { .. }
		));
		// Half a window refills one token at limit 2.
		let later = now + Duration::from_secs(31);
		assert_eq!(rl.check_at(IP, None, later), RateDecision::Allowed);
		assert!(matches!(
			rl.check_at(IP, None, later),
			RateDecision::Limited { .. }
		));
	}

	#[test]
	fn ips_are_independent() {
		let rl = limiter(1, 1000, 60);
		let now = Instant::now();
		let other: Option<IpAddr> = Some(IpAddr::V4(std::net::Ipv4Addr::new(10, 0, 0, 2)));
		assert_eq!(rl.check_at(IP, None, now), RateDecision::Allowed);
		assert_eq!(rl.check_at(other, None, now), RateDecision::Allowed);
		assert!(matches!(
			rl.check_at(IP, None, now),
			RateDecision::Limited { .. }
		));
	}

	#[test]
	fn token_bucket_is_separate_from_ip() {
		let rl = limiter(1000, 1, 60);
		let now = Instant::now();
		assert_eq!(rl.check_at(IP, Some("tok-a"), now), RateDecision::Allowed);
		assert!(matches!(
			rl.check_at(IP, Some("tok-a"), now),
			RateDecision::Limited { .. }
		));
		// A different identity from the same IP still goes through.
		assert_eq!(rl.check_at(IP, Some("tok-b"), now), RateDecision::Allowed);
	}

	#[test]
	fn disabled_limiter_admits_everything() {
		let rl = RateLimiter::new(&RateLimiting {
			enabled: false,
			ip_limit: 0,
			ip_window_seconds: 60,
			token_limit: 0,
			token_window_seconds: 60,
		});
		for _ in 0..100 {
			assert_eq!(rl.check(IP, Some("tok")), RateDecision::Allowed);
		}
	}

	#[test]
	fn idle_buckets_are_evicted_after_ten_windows() {
		let rl = limiter(2, 2, 1);
		let now = Instant::now();
		rl.check_at(IP, Some("tok"), now);
		assert_eq!(rl.ip.len(), 1);
		assert_eq!(rl.token.len(), 1);

		rl.ip.evict_idle(now + Duration::from_secs(5));
		assert_eq!(rl.ip.len(), 1);

		rl.ip.evict_idle(now + Duration::from_secs(11));
		rl.token.evict_idle(now + Duration::from_secs(11));
		assert_eq!(rl.ip.len(), 0);
		assert_eq!(rl.token.len(), 0);
	}

	#[test]
	fn token_keys_do_not_store_plaintext() {
		let key = token_key("super-secret-token");
		assert!(!key.contains("super"));
		assert_eq!(key.len(), 32);
	}
}
