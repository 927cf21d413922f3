//! Collision resistant, roughly time ordered identifiers.
//!
//! Layout: `TTTTTTT SSS RRR CC`
//! * `T` – millisecond timestamp, base-62, zero padded
//! * `S` – process local sequence, wraps at 62³
//! * `R` – random base-62 characters
//! * `C` – checksum over the preceding parts (blake3, base-62, truncated)

use std::sync::atomic::{AtomicU32, Ordering};

use chrono::Utc;
use rand::Rng;

// ASCII order, so ids compare lexically the same way they compare numerically
const ALPHABET: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
const TIMESTAMP_LEN: usize = 7;
const SEQUENCE_LEN: usize = 3;
const RANDOM_LEN: usize = 3;
const CHECKSUM_LEN: usize = 2;
const SEQUENCE_SPACE: u32 = 62 * 62 * 62;

pub const ID_LEN: usize = TIMESTAMP_LEN + SEQUENCE_LEN + RANDOM_LEN + CHECKSUM_LEN;

static SEQUENCE: AtomicU32 = AtomicU32::new(0);

pub fn base62(mut num: u128) -> String {
    if num == 0 {
        return "0".to_string();
    }
    let mut out = Vec::new();
    while num > 0 {
        out.push(ALPHABET[(num % 62) as usize]);
        num /= 62;
    }
    out.reverse();
    String::from_utf8(out).unwrap_or_default()
}

fn padded(num: u128, width: usize) -> String {
    format!("{:0>width$}", base62(num), width = width)
}

fn checksum(body: &str) -> String {
    let hash = blake3::hash(body.as_bytes());
    let mut head = [0u8; 16];
    head.copy_from_slice(&hash.as_bytes()[..16]);
    base62(u128::from_be_bytes(head)).chars().take(CHECKSUM_LEN).collect()
}

/// Fresh identifier, unique among concurrent callers of this process.
pub fn new_id() -> String {
    let millis = Utc::now().timestamp_millis().max(0) as u128;
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed) % SEQUENCE_SPACE;

    let mut rng = rand::rng();
    let random: String = (0..RANDOM_LEN)
        .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
        .collect();

    let body = format!(
        "{}{}{}",
        padded(millis, TIMESTAMP_LEN),
        padded(seq as u128, SEQUENCE_LEN),
        random
    );
    let sum = checksum(&body);
    format!("{body}{sum}")
}

/// `true` when the trailing checksum matches the body.
pub fn verify_checksum(id: &str) -> bool {
    if id.len() < CHECKSUM_LEN + 1 || !id.is_ascii() {
        return false;
    }
    let (body, sum) = id.split_at(id.len() - CHECKSUM_LEN);
    checksum(body) == sum
}

/// Identifier for a protocol instance: the script reference made file-name
/// safe, followed by a fresh id.
pub fn worker_id(script_reference: &str) -> String {
    let stem: String = script_reference
        .trim_start_matches(['.', '/'])
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    if stem.is_empty() {
        new_id()
    } else {
        format!("{stem}_{}", new_id())
    }
}
