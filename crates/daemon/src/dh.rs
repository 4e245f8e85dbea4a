//! Toy Diffie-Hellman key agreement used by the handshake.
//!
//! The parameters are deliberately tiny (7-bit prime) and must not be
//! changed: servers compute the same values and the derived key has to
//! match byte for byte. This provides no security.

use rand::Rng;
use std::ops::RangeInclusive;

/// Shared prime modulus.
pub const P: u32 = 127;

/// Shared generator.
pub const G: u32 = 9;

/// Range the client draws its private exponent from.
pub const PRIVATE_EXPONENT_RANGE: RangeInclusive<u32> = 1000..=5000;

/// `base^exp mod modulus` by repeated squaring with 64-bit intermediates.
///
/// A modulus of 0 or 1 yields 0.
pub fn mod_exp(base: u32, exp: u32, modulus: u32) -> u32 {
    if modulus <= 1 {
        return 0;
    }
    let m = modulus as u64;
    let mut result: u64 = 1;
    let mut b = base as u64 % m;
    let mut e = exp;
    while e > 0 {
        if e & 1 == 1 {
            result = result * b % m;
        }
        b = b * b % m;
        e >>= 1;
    }
    result as u32
}

/// Public value to send to the peer.
pub fn public_value(generator: u32, private_exponent: u32, modulus: u32) -> u32 {
    mod_exp(generator, private_exponent, modulus)
}

/// Shared secret from the peer's public value.
pub fn shared_secret(peer_public: u32, private_exponent: u32, modulus: u32) -> u32 {
    mod_exp(peer_public, private_exponent, modulus)
}

/// One side of the exchange with the fixed protocol parameters.
#[derive(Debug, Clone, Copy)]
pub struct KeyPair {
    private: u32,
    public: u32,
}

impl KeyPair {
    pub fn generate() -> Self {
        let private = rand::thread_rng().gen_range(PRIVATE_EXPONENT_RANGE);
        Self::from_private(private)
    }

    pub fn from_private(private: u32) -> Self {
        Self {
            private,
            public: public_value(G, private, P),
        }
    }

    pub fn private_exponent(&self) -> u32 {
        self.private
    }

    pub fn public(&self) -> u32 {
        self.public
    }

    pub fn agree(&self, peer_public: u32) -> u32 {
        shared_secret(peer_public, self.private, P)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mod_exp_small_values() {
        assert_eq!(mod_exp(2, 10, 1000), 24);
        assert_eq!(mod_exp(9, 0, 127), 1);
        assert_eq!(mod_exp(5, 3, 1), 0);
        assert_eq!(mod_exp(3, 4, 127), 81);
    }

    #[test]
    fn test_mod_exp_degenerate_modulus() {
        assert_eq!(mod_exp(9, 1234, 0), 0);
        assert_eq!(mod_exp(0, 0, 0), 0);
        assert_eq!(public_value(G, 1234, 0), 0);
    }

    #[test]
    fn test_mod_exp_no_overflow() {
        // Intermediate products exceed u32 for a large modulus.
        let m = 4_294_967_291; // largest 32-bit prime
        let r = mod_exp(m - 1, 2, m);
        assert_eq!(r, 1);
    }

    #[test]
    fn test_symmetry_over_exponent_range() {
        for a in (1000..=5000).step_by(97) {
            for b in (1000..=5000).step_by(89) {
                let ya = public_value(G, a, P);
                let yb = public_value(G, b, P);
                assert_eq!(shared_secret(yb, a, P), shared_secret(ya, b, P));
            }
        }
    }

    #[test]
    fn test_values_stay_below_modulus() {
        for a in [1000, 1234, 4321, 5000] {
            assert!(public_value(G, a, P) < P);
        }
    }

    #[test]
    fn test_generated_exponent_in_range() {
        for _ in 0..64 {
            let kp = KeyPair::generate();
            assert!(PRIVATE_EXPONENT_RANGE.contains(&kp.private_exponent()));
        }
    }
}
