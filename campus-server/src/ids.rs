//! ULID document identifiers.
//!
//! Every stored document (user, post, comment, conversation, message,
//! notification, AI task, upload) gets a 26-character Crockford base32 id:
//! 48 bits of milliseconds since the epoch followed by 80 random bits, so ids
//! sort by creation time.

use rand::Rng;

const CROCKFORD: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

/// Generate an id for the current instant.
pub fn generate() -> String {
    generate_at(now_ms())
}

/// Generate an id stamped with the given millisecond timestamp.
pub fn generate_at(ms: u64) -> String {
    let mut rng = rand::thread_rng();
    let rand_hi: u16 = rng.r#gen();
    let rand_lo: u64 = rng.r#gen();

    let mut out = [0u8; 26];

    let mut ts = ms;
    for slot in out[..10].iter_mut().rev() {
        *slot = CROCKFORD[(ts & 0x1F) as usize];
        ts >>= 5;
    }

    let mut r = rand_hi as u128 | ((rand_lo as u128) << 16);
    for slot in out[10..].iter_mut().rev() {
        *slot = CROCKFORD[(r & 0x1F) as usize];
        r >>= 5;
    }

    out.iter().map(|&b| b as char).collect()
}

/// Current time in milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
