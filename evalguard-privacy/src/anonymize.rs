use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use chrono::{DateTime, Timelike, Utc};
use rand::{rngs::OsRng, Rng, RngCore};
use sha2::{Digest, Sha256, Sha512};

/// Length of the receipt handed back to a submitter.
pub const RECEIPT_LEN: usize = 16;

/// SHA-512 over (SHA-256 of the enrollment id, nanosecond timestamp, 256
/// random bits), hex encoded. The random component makes every call unique
/// and the token useless for recovering the enrollment.
pub fn generate_anonymous_token(enrollment_id: &str) -> String {
    let enrollment_digest = Sha256::digest(enrollment_id.as_bytes());
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let mut entropy = [0u8; 32];
    OsRng.fill_bytes(&mut entropy);

    let mut hasher = Sha512::new();
    hasher.update(enrollment_digest);
    hasher.update(nanos.to_le_bytes());
    hasher.update(entropy);
    hex::encode(hasher.finalize())
}

/// Zeroes the host part of an address: the last octet for IPv4, everything
/// after the third group for IPv6. Anything unparseable yields `None` so an
/// unrecognized address is never stored.
pub fn anonymize_ip_address(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let mapped = raw
        .strip_prefix("::ffff:")
        .or_else(|| raw.strip_prefix("::FFFF:"))
        .unwrap_or(raw);
    if let Ok(v4) = mapped.parse::<Ipv4Addr>() {
        let [a, b, c, _] = v4.octets();
        return Some(Ipv4Addr::new(a, b, c, 0).to_string());
    }
    if raw.contains(':') {
        if let Ok(v6) = raw.parse::<Ipv6Addr>() {
            let groups = v6.segments();
            return Some(
                Ipv6Addr::new(groups[0], groups[1], groups[2], 0, 0, 0, 0, 0).to_string(),
            );
        }
    }
    None
}

/// Rounds down to the top of the hour.
pub fn get_safe_submission_timestamp(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(ts)
}

/// Opaque id shared by every submission in the same `window_minutes` bucket.
pub fn get_mixing_pool_id(ts: DateTime<Utc>, window_minutes: u32) -> String {
    let window_secs = i64::from(window_minutes.max(1)) * 60;
    let bucket_start = ts.timestamp().div_euclid(window_secs) * window_secs;
    let digest = Sha256::digest(format!("mixing-pool:{bucket_start}").as_bytes());
    hex::encode(&digest[..8])
}

/// Uniform delay in `[min_secs, max_secs]` with millisecond resolution.
pub fn calculate_submission_delay(min_secs: u64, max_secs: u64) -> Duration {
    let (lo, hi) = if min_secs <= max_secs {
        (min_secs, max_secs)
    } else {
        (max_secs, min_secs)
    };
    let millis = rand::thread_rng().gen_range(lo.saturating_mul(1_000)..=hi.saturating_mul(1_000));
    Duration::from_millis(millis)
}

/// Short one-way digest of token and time. Lets a submitter prove they
/// submitted without the system keeping a link back to them.
pub fn generate_receipt_hash(anonymous_token: &str, timestamp: DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(anonymous_token.as_bytes());
    hasher.update(b":");
    hasher.update(timestamp.to_rfc3339().as_bytes());
    let mut receipt = hex::encode_upper(hasher.finalize());
    receipt.truncate(RECEIPT_LEN);
    receipt
}
