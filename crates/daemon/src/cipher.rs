//! Single-byte XOR stream cipher keyed from the handshake secret.
//!
//! Kept only for wire compatibility with existing servers. It offers no
//! confidentiality.

/// Fold the four bytes of `secret` into one key byte.
pub fn derive_key(secret: u32) -> u8 {
    (0..4).fold(0u8, |acc, i| acc ^ ((secret >> (8 * i)) & 0xFF) as u8)
}

/// XOR `buf[offset..offset + len]` with `key`.
///
/// Applying it twice with the same key restores the input. Ranges that run
/// past the end of `buf` are truncated to the buffer.
pub fn crypt_in_place(buf: &mut [u8], offset: usize, len: usize, key: u8) {
    let end = offset.saturating_add(len).min(buf.len());
    if offset >= end {
        return;
    }
    for byte in &mut buf[offset..end] {
        *byte ^= key;
    }
}

/// Key material for one session.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct XorCipher {
    key: u8,
}

impl XorCipher {
    pub fn from_secret(secret: u32) -> Self {
        Self {
            key: derive_key(secret),
        }
    }

    pub fn key(&self) -> u8 {
        self.key
    }

    pub fn apply(&self, buf: &mut [u8], offset: usize, len: usize) {
        crypt_in_place(buf, offset, len, self.key);
    }
}

impl std::fmt::Debug for XorCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XorCipher").finish_non_exhaustive()
    }
}
