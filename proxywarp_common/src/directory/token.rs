//! Token generation and shape validation.

use once_cell::sync::Lazy;
use rand::RngCore;
use regex::Regex;

/// Alphabet every token is drawn from.
pub const ALPHABET: &[u8; 36] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Conventional base-36 digits, used for the collision-breaking suffix.
const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

pub static TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]+$").expect("valid token regex"));

pub static DOMAIN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([a-z0-9]([a-z0-9-]*[a-z0-9])?\.)+[a-z0-9]([a-z0-9-]*[a-z0-9])?$")
        .expect("valid domain regex")
});

/// Generate a token of `length` characters that is not currently `taken`.
///
/// Up to 10 random draws; if all collide, the 11th draw gets the last
/// four base-36 digits of the wall clock in ms appended, which breaks
/// the collision deterministically.
pub fn generate(length: usize, now_ms: u64, taken: impl Fn(&str) -> bool) -> String {
    for _ in 0..10 {
        let candidate = random_token(length);
        if !taken(&candidate) {
            return candidate;
        }
    }
    let mut candidate = random_token(length);
    candidate.push_str(&ms_suffix(now_ms));
    candidate
}

fn random_token(length: usize) -> String {
    let mut bytes = vec![0u8; length];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
        .iter()
        .map(|b| ALPHABET[(b % 36) as usize] as char)
        .collect()
}

fn ms_suffix(mut ms: u64) -> String {
    let mut out = [b'0'; 4];
    for slot in out.iter_mut().rev() {
        *slot = BASE36[(ms % 36) as usize];
        ms /= 36;
    }
    String::from_utf8_lossy(&out).into_owned()
}
