//! Readiness tokens for poller registration and shard routing.
//!
//! A token identifies one registered connection. The low 32 bits of the
//! poller handle carry the socket descriptor (the registry key), the high
//! 32 bits carry a generation so that a descriptor reused after close never
//! resolves to the connection that replaced it.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU32, Ordering};

/// Handle shared by the poller, the ready queues and the shard registries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token {
    fd: RawFd,
    generation: u32,
}

impl Token {
    /// Build a token from a descriptor and its generation.
    pub fn new(fd: RawFd, generation: u32) -> Self {
        Self { fd, generation }
    }

    /// Socket descriptor, used as the registry key.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Generation tag distinguishing reuses of the same descriptor.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Index of the shard owning this token.
    ///
    /// Pure function of the descriptor, so a token always maps to the
    /// same shard for the lifetime of its registration.
    pub fn shard(&self, shard_count: usize) -> usize {
        debug_assert!(shard_count > 0, "shard count must be positive");
        (self.fd as u32 as usize) % shard_count
    }
}

impl From<Token> for mio::Token {
    fn from(token: Token) -> Self {
        let packed = ((token.generation as u64) << 32) | (token.fd as u32 as u64);
        mio::Token(packed as usize)
    }
}

impl From<mio::Token> for Token {
    fn from(token: mio::Token) -> Self {
        let packed = token.0 as u64;
        Self {
            fd: (packed & 0xFFFF_FFFF) as u32 as RawFd,
            generation: (packed >> 32) as u32,
        }
    }
}

/// Hands out generations for newly accepted connections.
#[derive(Debug, Default)]
pub struct GenerationCounter {
    next: AtomicU32,
}

impl GenerationCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next generation; wraps after `u32::MAX` connections.
    pub fn next(&self) -> u32 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_packing() {
        let token = Token::new(17, 3);
        let handle: mio::Token = token.into();

        let back = Token::from(handle);
        assert_eq!(back, token);
        assert_eq!(back.fd(), 17);
        assert_eq!(back.generation(), 3);
    }

    #[test]
    fn test_shard_is_stable() {
        let a = Token::new(10, 1);
        let b = Token::new(10, 2);

        // Same descriptor, different generation: same shard
        assert_eq!(a.shard(4), b.shard(4));
        assert_eq!(a.shard(4), 2);
        assert_eq!(Token::new(11, 0).shard(4), 3);
        assert_eq!(a.shard(1), 0);
    }

    #[test]
    fn test_generation_counter() {
        let counter = GenerationCounter::new();
        let first = counter.next();
        let second = counter.next();
        assert_eq!(second, first + 1);
    }
}
