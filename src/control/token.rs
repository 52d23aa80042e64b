//! Correlation token generation.
//!
//! Tokens pair a control request with its eventual callbacks, so they only
//! need to be unique among in-flight calls on one link. The format is a
//! composite of a time/pid entropy mix, a process-local counter, and a
//! millisecond timestamp, each base-62/36 encoded.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

const CHARS: &[u8; 62] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Produces unique correlation tokens.
pub struct TokenGenerator {
    counter: AtomicU64,
}

impl TokenGenerator {
    /// Create a generator starting its counter at zero.
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
        }
    }

    /// Generate the next token.
    pub fn next_token(&self) -> String {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);

        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);

        // Cheap entropy: nanosecond clock mixed with the pid, the same
        // trick used for unique pipe paths.
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let entropy =
            nanos.wrapping_mul(0x517cc1b727220a95) ^ u64::from(std::process::id()) ^ (seq << 32);

        format!(
            "{}{}{}",
            encode_radix(entropy & 0xFFFF_FFFF, 62),
            encode_radix(seq, 36),
            encode_radix(millis, 62)
        )
    }
}

impl Default for TokenGenerator {
    fn default() -> Self {
        Self::new()
    }
}

fn encode_radix(mut num: u64, base: u64) -> String {
    if num == 0 {
        return "0".to_string();
    }

    let mut digits = Vec::new();
    while num > 0 {
        digits.push(CHARS[(num % base) as usize]);
        num /= base;
    }
    digits.reverse();

    String::from_utf8(digits).unwrap_or_default()
}
