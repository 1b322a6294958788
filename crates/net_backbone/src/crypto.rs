//! Diffie-Hellman key agreement and the Blowfish session cipher.
//!
//! Both ends share a 1024-bit prime and the generator 2. Each side draws an
//! ephemeral private exponent, exchanges its public value as upper-case hex,
//! and renders the agreed secret as a fixed 128-byte big-endian buffer. The
//! first [`SESSION_KEY_SIZE`] bytes of that buffer key the session cipher.

use crate::error::ProtocolError;
use blowfish::cipher::generic_array::GenericArray;
use blowfish::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use blowfish::Blowfish;
use num_bigint::{BigUint, RandBigInt};
use std::fmt;

/// Width of the shared secret in bytes.
pub const DH_SHARED_DATA_SIZE: usize = 128;

/// Number of hex digits in a prime of the expected size.
pub const DH_PRIME_HEX_LEN: usize = DH_SHARED_DATA_SIZE * 2;

pub const DH_GENERATOR: u32 = 2;

/// Cipher block size; every encrypted payload is a multiple of this.
pub const BLOCK_SIZE: usize = 8;

/// Number of shared-secret bytes used as the Blowfish key.
pub const SESSION_KEY_SIZE: usize = 8;

/// 1024-bit MODP group prime (RFC 2409, group 2).
pub const DEFAULT_DH_PRIME: &str = concat!(
    "FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1",
    "29024E088A67CC74020BBEA63B139B22514A08798E3404DD",
    "EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245",
    "E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED",
    "EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE65381",
    "FFFFFFFFFFFFFFFF",
);

/// Rounds `len` up to a whole number of cipher blocks.
pub fn padded_len(len: usize) -> usize {
    len.div_ceil(BLOCK_SIZE) * BLOCK_SIZE
}

/// Group parameters shared by both ends of a handshake.
#[derive(Clone, PartialEq, Eq)]
pub struct DhParameters {
    prime: BigUint,
    generator: BigUint,
}

impl DhParameters {
    /// Parses a prime given as exactly [`DH_PRIME_HEX_LEN`] hex digits.
    pub fn from_hex(prime_hex: &str) -> Result<Self, ProtocolError> {
        Self::with_generator(prime_hex, DH_GENERATOR)
    }

    /// Parses the prime and generator as sent in a handshake challenge.
    ///
    /// # Arguments
    ///
    /// * `prime_hex` - The prime as exactly [`DH_PRIME_HEX_LEN`] hex digits,
    ///   leading zeros included
    /// * `generator` - The group generator
    ///
    /// # Returns
    ///
    /// The parameters, or [`ProtocolError::InvalidKey`] when the prime is not
    /// an odd number of exactly `DH_SHARED_DATA_SIZE * 8` bits or the
    /// generator does not lie in `2..prime`. Zero-padded small values are
    /// refused here so that key generation always has a non-empty range.
    pub fn with_generator(prime_hex: &str, generator: u32) -> Result<Self, ProtocolError> {
        if prime_hex.len() != DH_PRIME_HEX_LEN {
            return Err(ProtocolError::InvalidKey(format!(
                "prime has {} hex digits, expected {}",
                prime_hex.len(),
                DH_PRIME_HEX_LEN
            )));
        }

        let prime = parse_hex(prime_hex)?;
        let bits = prime.bits();
        if bits != (DH_SHARED_DATA_SIZE * 8) as u64 {
            return Err(ProtocolError::InvalidKey(format!(
                "prime has {bits} significant bits, expected {}",
                DH_SHARED_DATA_SIZE * 8
            )));
        }
        if !prime.bit(0) {
            return Err(ProtocolError::InvalidKey("prime must be odd".to_string()));
        }

        let generator = BigUint::from(generator);
        if generator < BigUint::from(2u32) || generator >= prime {
            return Err(ProtocolError::InvalidKey(
                "generator must lie in 2..prime".to_string(),
            ));
        }

        Ok(Self { prime, generator })
    }

    /// The prime as exactly [`DH_PRIME_HEX_LEN`] hex digits.
    pub fn prime_hex(&self) -> String {
        format!("{:0>width$}", to_hex(&self.prime), width = DH_PRIME_HEX_LEN)
    }

    /// The generator as sent in a challenge.
    pub fn generator(&self) -> u32 {
        // Constructors only accept a u32 generator.
        self.generator.to_u32_digits().first().copied().unwrap_or(DH_GENERATOR)
    }

    /// Draws a fresh ephemeral keypair with a private exponent in `2..p-2`.
    ///
    /// Constructors guarantee a full-width prime, so the range is never empty.
    pub fn generate_keypair(&self) -> DhKeyPair {
        let mut rng = rand::thread_rng();
        let two = BigUint::from(2u32);
        let upper = &self.prime - 2u32;
        let private = rng.gen_biguint_range(&two, &upper);
        let public = self.generator.modpow(&private, &self.prime);

        DhKeyPair {
            params: self.clone(),
            private,
            public,
        }
    }

    /// Rejects peer values outside `2..=p-2`, which would force a trivial secret.
    fn check_public(&self, value: &BigUint) -> Result<(), ProtocolError> {
        let one = BigUint::from(1u32);
        let upper = &self.prime - 1u32;
        if *value <= one || *value >= upper {
            return Err(ProtocolError::InvalidKey(
                "public value out of range".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for DhParameters {
    fn default() -> Self {
        Self {
            prime: BigUint::parse_bytes(DEFAULT_DH_PRIME.as_bytes(), 16).unwrap_or_default(),
            generator: BigUint::from(DH_GENERATOR),
        }
    }
}

impl fmt::Debug for DhParameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DhParameters")
            .field("bits", &self.prime.bits())
            .field("generator", &self.generator)
            .finish()
    }
}

/// One side's ephemeral keypair.
pub struct DhKeyPair {
    params: DhParameters,
    private: BigUint,
    public: BigUint,
}

impl DhKeyPair {
    /// Our public value as upper-case hex, without leading zeros.
    pub fn public_hex(&self) -> String {
        to_hex(&self.public)
    }

    /// Computes the shared secret from the peer's public value.
    pub fn shared_secret(&self, peer_public_hex: &str) -> Result<SharedSecret, ProtocolError> {
        let peer = parse_hex(peer_public_hex)?;
        self.params.check_public(&peer)?;

        let secret = peer.modpow(&self.private, &self.params.prime);
        let raw = secret.to_bytes_be();

        let mut data = [0u8; DH_SHARED_DATA_SIZE];
        data[DH_SHARED_DATA_SIZE - raw.len()..].copy_from_slice(&raw);
        Ok(SharedSecret(data))
    }
}

/// Agreed secret, left-padded to [`DH_SHARED_DATA_SIZE`] bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct SharedSecret([u8; DH_SHARED_DATA_SIZE]);

impl SharedSecret {
    /// The full big-endian secret.
    pub fn as_bytes(&self) -> &[u8; DH_SHARED_DATA_SIZE] {
        &self.0
    }

    /// Keys a [`SessionCipher`] with the first [`SESSION_KEY_SIZE`] bytes.
    pub fn session_cipher(&self) -> Result<SessionCipher, ProtocolError> {
        SessionCipher::new(&self.0[..SESSION_KEY_SIZE])
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}

/// Blowfish in ECB mode over whole 8-byte blocks.
#[derive(Clone)]
pub struct SessionCipher {
    cipher: Blowfish,
}

impl SessionCipher {
    /// Creates a cipher from a raw Blowfish key of 4 to 56 bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::InvalidKey`] for any other key length.
    pub fn new(key: &[u8]) -> Result<Self, ProtocolError> {
        let cipher = <Blowfish as KeyInit>::new_from_slice(key)
            .map_err(|_| ProtocolError::InvalidKey(format!("bad session key length {}", key.len())))?;
        Ok(Self { cipher })
    }

    /// Encrypts `data` in place. Its length must be a non-zero multiple of
    /// [`BLOCK_SIZE`].
    pub fn encrypt(&self, data: &mut [u8]) -> Result<(), ProtocolError> {
        check_blocks(data.len())?;
        for block in data.chunks_exact_mut(BLOCK_SIZE) {
            self.cipher.encrypt_block(GenericArray::from_mut_slice(block));
        }
        Ok(())
    }

    pub fn decrypt(&self, data: &mut [u8]) -> Result<(), ProtocolError> {
        check_blocks(data.len())?;
        for block in data.chunks_exact_mut(BLOCK_SIZE) {
            self.cipher.decrypt_block(GenericArray::from_mut_slice(block));
        }
        Ok(())
    }

    /// Encrypts a fixed label; peers compare these to prove they hold the same key.
    pub fn check_block(&self, label: &[u8; BLOCK_SIZE]) -> [u8; BLOCK_SIZE] {
        let mut block = *label;
        self.cipher.encrypt_block(GenericArray::from_mut_slice(&mut block));
        block
    }
}

impl fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionCipher(..)")
    }
}

fn check_blocks(len: usize) -> Result<(), ProtocolError> {
    if len == 0 || len % BLOCK_SIZE != 0 {
        return Err(ProtocolError::BadPadding(len));
    }
    Ok(())
}

fn parse_hex(hex: &str) -> Result<BigUint, ProtocolError> {
    if hex.is_empty() || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(ProtocolError::InvalidKey("value is not hex".to_string()));
    }
    BigUint::parse_bytes(hex.as_bytes(), 16)
        .ok_or_else(|| ProtocolError::InvalidKey("value is not hex".to_string()))
}

fn to_hex(value: &BigUint) -> String {
    value.to_str_radix(16).to_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_prime_has_expected_width() {
        assert_eq!(DEFAULT_DH_PRIME.len(), DH_PRIME_HEX_LEN);
        let params = DhParameters::from_hex(DEFAULT_DH_PRIME).unwrap();
        assert_eq!(params, DhParameters::default());
        assert_eq!(params.prime_hex(), DEFAULT_DH_PRIME);
        assert_eq!(params.generator(), 2);
    }

    #[test]
    fn both_sides_derive_the_same_key() {
        let params = DhParameters::default();
        let server = params.generate_keypair();
        let client = params.generate_keypair();

        let server_secret = server.shared_secret(&client.public_hex()).unwrap();
        let client_secret = client.shared_secret(&server.public_hex()).unwrap();
        assert_eq!(server_secret, client_secret);

        let sender = server_secret.session_cipher().unwrap();
        let receiver = client_secret.session_cipher().unwrap();

        let plain = b"sixteen byte msg".to_vec();
        let mut data = plain.clone();
        sender.encrypt(&mut data).unwrap();
        assert_ne!(data, plain);
        receiver.decrypt(&mut data).unwrap();
        assert_eq!(data, plain);
    }

    #[test]
    fn different_keys_disagree_on_check_block() {
        let a = SessionCipher::new(b"key-one!").unwrap();
        let b = SessionCipher::new(b"key-two!").unwrap();
        assert_ne!(a.check_block(b"SRVCHECK"), b.check_block(b"SRVCHECK"));
        assert_ne!(a.check_block(b"SRVCHECK"), a.check_block(b"CLTCHECK"));
    }

    #[test]
    fn trivial_public_values_are_rejected() {
        let params = DhParameters::default();
        let pair = params.generate_keypair();
        let p_minus_one = to_hex(&(&params.prime - 1u32));

        for value in ["0", "1", p_minus_one.as_str(), DEFAULT_DH_PRIME, "not-hex", ""] {
            assert!(pair.shared_secret(value).is_err(), "accepted {value:?}");
        }
    }

    #[test]
    fn short_or_garbage_primes_are_rejected() {
        assert!(DhParameters::from_hex("FFFF").is_err());
        assert!(DhParameters::from_hex(&"Z".repeat(DH_PRIME_HEX_LEN)).is_err());
        // Even numbers are never prime here.
        assert!(DhParameters::from_hex(&"E".repeat(DH_PRIME_HEX_LEN)).is_err());
    }

    #[test]
    fn zero_padded_small_primes_are_rejected() {
        for tail in ["3", "1", "FFFFFFFFFFFFFFFF"] {
            let padded = format!("{}{tail}", "0".repeat(DH_PRIME_HEX_LEN - tail.len()));
            assert!(
                matches!(DhParameters::from_hex(&padded), Err(ProtocolError::InvalidKey(_))),
                "accepted a prime ending in {tail}"
            );
        }

        // One bit short of full width.
        let short = format!("7{}", "F".repeat(DH_PRIME_HEX_LEN - 1));
        assert!(DhParameters::from_hex(&short).is_err());
    }

    #[test]
    fn generator_must_be_below_the_prime() {
        assert!(DhParameters::with_generator(DEFAULT_DH_PRIME, 0).is_err());
        assert!(DhParameters::with_generator(DEFAULT_DH_PRIME, 1).is_err());
        assert!(DhParameters::with_generator(DEFAULT_DH_PRIME, 5).is_ok());
    }

    #[test]
    fn accepted_parameters_always_yield_a_keypair() {
        // Smallest odd full-width value: 2^1023 + 1.
        let smallest = format!("8{}1", "0".repeat(DH_PRIME_HEX_LEN - 2));
        let params = DhParameters::with_generator(&smallest, 2).unwrap();
        let pair = params.generate_keypair();
        assert!(!pair.public_hex().is_empty());
    }

    #[test]
    fn partial_blocks_are_refused() {
        let cipher = SessionCipher::new(b"12345678").unwrap();
        assert_eq!(cipher.encrypt(&mut [0u8; 7]), Err(ProtocolError::BadPadding(7)));
        assert_eq!(cipher.decrypt(&mut []), Err(ProtocolError::BadPadding(0)));
        assert_eq!(padded_len(0), 0);
        assert_eq!(padded_len(1), 8);
        assert_eq!(padded_len(16), 16);
    }
}
