//! Object and voucher keys.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque 64-bit key naming an object or voucher.
///
/// To clients a token is an opaque byte string; the zero value is reserved
/// and never names anything. Tokens are used directly as hash-map keys
/// because the generating sequence already randomizes them.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Token(u64);

impl Token {
    /// The reserved invalid token.
    pub const NULL: Token = Token(0);

    #[inline]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({:016x})", self.0)
    }
}

impl fmt::Display for Token {
    /// Renders the token as a proquint, the form used in log output.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&crate::proquint::encode_u64(self.0))
    }
}

/// Generator for the daemon-lifetime key sequence.
///
/// Within the lifetime of a daemon instance, keys are unique and never
/// reused; for DEFAULT policy objects, a key uniquely identifies shared
/// object content. (There are enough unique 64-bit numbers that we will
/// never loop around.) The null (zero) token is not emitted.
///
/// Keys come from a xorshift sequence that visits all 2^64 - 1 distinct
/// non-zero values before repeating. Sequential numbers would also work,
/// but we don't want to tempt clients into assumptions about token values,
/// and the pseudorandom tokens double as good hash-table keys.
#[derive(Debug)]
pub struct KeySequence {
    prev: u64,
}

impl KeySequence {
    pub fn new() -> Self {
        Self::with_seed(u64::MAX)
    }

    /// Seeds the sequence. A zero seed would emit only zeros, so it is
    /// replaced with the default seed.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            prev: if seed == 0 { u64::MAX } else { seed },
        }
    }

    pub fn generate(&mut self) -> Token {
        let mut t = self.prev;
        debug_assert!(t != 0);

        // See https://en.wikipedia.org/wiki/Xorshift
        t ^= t << 13;
        t ^= t >> 7;
        t ^= t << 17;

        self.prev = t;
        Token(t)
    }
}

impl Default for KeySequence {
    fn default() -> Self {
        Self::new()
    }
}
