//! Server-assigned identifiers.
//!
//! Connections, groups and messages all use ULIDs: 26 Crockford base32
//! characters, a 48-bit millisecond timestamp followed by 80 random bits.
//! Lexicographic order matches creation order at millisecond granularity.

use rand::Rng;

const ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";
const LEN: usize = 26;

pub fn generate() -> String {
    let millis = chrono::Utc::now().timestamp_millis().max(0) as u128;
    let entropy: u128 = rand::thread_rng().r#gen::<u128>() >> 48;
    encode((millis << 80) | entropy)
}

fn encode(mut value: u128) -> String {
    let mut out = [0u8; LEN];
    for slot in out.iter_mut().rev() {
        *slot = ALPHABET[(value & 0x1F) as usize];
        value >>= 5;
    }
    out.iter().map(|&b| b as char).collect()
}
