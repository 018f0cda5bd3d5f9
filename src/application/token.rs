//! Opaque token generation for lock holders and task ids.

use rand::RngCore;
use rand::rngs::OsRng;

/// Source of unguessable tokens, injected so tests can make them deterministic.
pub trait TokenSource: Send + Sync {
    fn token(&self) -> String;
}

/// Hex-encoded 128-bit tokens from the operating system's CSPRNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsTokenSource;

impl TokenSource for OsTokenSource {
    fn token(&self) -> String {
        let mut bytes = [0u8; 16];
        OsRng.fill_bytes(&mut bytes);
        hex::encode(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_unique_hex() {
        let source = OsTokenSource;
        let first = source.token();
        let second = source.token();
        assert_eq!(first.len(), 32);
        assert!(first.chars().all(|ch| ch.is_ascii_hexdigit()));
        assert_ne!(first, second);
    }
}
