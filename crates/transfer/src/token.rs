//! Session identifiers.

use rand::Rng;

/// Identifier length in bytes (produces 32 hex characters).
const SESSION_ID_BYTES: usize = 16;

/// Generates an unguessable session id as a 32-character lowercase hex string.
pub fn generate_session_id() -> String {
    let mut bytes = [0u8; SESSION_ID_BYTES];
    rand::thread_rng().fill(&mut bytes);
    hex::encode(bytes)
}
