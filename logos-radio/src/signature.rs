//! Content-generation signatures.
//!
//! A signature names one generation of a room's log. It is derived from a
//! seed (the room name for a new room, the previous signature on reset)
//! mixed with fresh random bytes, so a client holding stale offsets can tell
//! that they no longer apply. Signatures are URL-safe and usable as file
//! names.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use rand::Rng;
use sha2::{Digest, Sha256};

/// Random bytes mixed into every signature.
const SALT_BYTES: usize = 16;

/// Digest bytes kept in the encoded signature.
const SIGNATURE_BYTES: usize = 16;

/// Derive a new unguessable signature from `seed`.
pub fn derive_signature(seed: &str) -> String {
    let mut salt = [0u8; SALT_BYTES];
    rand::thread_rng().fill(&mut salt[..]);

    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    hasher.update(salt);
    let digest = hasher.finalize();

    URL_SAFE_NO_PAD.encode(&digest[..SIGNATURE_BYTES])
}
