//! # Session cryptography
//!
//! Key exchange and framing cipher for per-peer sessions:
//!
//! - **Key exchange**: classic Diffie-Hellman over a fixed 56-byte prime
//!   with generator 5. Both parameters are embedded constants; peers must
//!   use byte-identical values to interoperate.
//! - **Framing cipher**: the 56-byte shared secret keys Blowfish in CBC
//!   mode. Frames are already padded to the 8-byte block size by the wire
//!   layer, so no cipher-level padding is applied. A fresh random IV is
//!   prepended to every encrypted frame.
//! - **Authentication**: Ed25519 signature over
//!   `SHA-1(shared_secret || timestamp_ms_be)`, binding the long-term key
//!   to the freshly derived session.
//!
//! Handshake datagrams (the DH public values) are size-jittered with
//! random trailing bytes so their length does not fingerprint the
//! protocol; the receiver only reads the leading 56 bytes.

use blowfish::Blowfish;
use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use num_bigint::BigUint;
use rand::Rng;
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};
use crate::wire::FRAME_ALIGN;

/// Length of the DH prime, public values, and the derived shared secret.
pub const DH_LEN: usize = 56;

/// CBC IV length (one cipher block).
pub const IV_LEN: usize = 8;

/// Maximum random trailing bytes appended to a handshake datagram.
const HANDSHAKE_JITTER_MAX: usize = 16;

/// The fixed 448-bit prime: 2^448 - 2^224 - 1.
pub const DH_PRIME: [u8; DH_LEN] = [
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, //
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, //
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, //
    0xff, 0xff, 0xff, 0xfe, 0xff, 0xff, 0xff, 0xff, //
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, //
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, //
    0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
];

/// The fixed generator.
pub const DH_GENERATOR: u32 = 5;

fn prime() -> BigUint {
    BigUint::from_bytes_be(&DH_PRIME)
}

/// Left-pad a big-endian value to exactly `DH_LEN` bytes.
fn to_fixed_bytes(value: &BigUint) -> [u8; DH_LEN] {
    let bytes = value.to_bytes_be();
    debug_assert!(bytes.len() <= DH_LEN);
    let mut out = [0u8; DH_LEN];
    out[DH_LEN - bytes.len()..].copy_from_slice(&bytes);
    out
}

/// One side of a Diffie-Hellman exchange. Created when a connection
/// starts handshaking, dropped as soon as the shared secret is derived.
pub struct DhExchange {
    secret: BigUint,
    public: [u8; DH_LEN],
}

impl DhExchange {
    pub fn generate() -> Self {
        let mut exponent = [0u8; DH_LEN];
        rand::thread_rng().fill(&mut exponent[..]);
        let secret = BigUint::from_bytes_be(&exponent);
        let public = BigUint::from(DH_GENERATOR).modpow(&secret, &prime());
        Self {
            secret,
            public: to_fixed_bytes(&public),
        }
    }

    pub fn public_value(&self) -> [u8; DH_LEN] {
        self.public
    }

    /// Derive the 56-byte shared secret from the peer's public value.
    ///
    /// Degenerate peer values (0 and 1, which would force a constant
    /// secret) are rejected as a protocol error.
    pub fn shared_secret(&self, peer_public: &[u8; DH_LEN]) -> Result<[u8; DH_LEN]> {
        let peer = BigUint::from_bytes_be(peer_public) % prime();
        if peer <= BigUint::from(1u8) {
            return Err(Error::Frame);
        }
        let shared = peer.modpow(&self.secret, &prime());
        Ok(to_fixed_bytes(&shared))
    }

    /// Encode the public value for the wire, with size jitter.
    pub fn handshake_datagram(&self) -> Vec<u8> {
        let mut rng = rand::thread_rng();
        let jitter = rng.gen_range(0..=HANDSHAKE_JITTER_MAX);
        let mut out = Vec::with_capacity(DH_LEN + jitter);
        out.extend_from_slice(&self.public);
        for _ in 0..jitter {
            out.push(rng.gen());
        }
        out
    }
}

/// Extract a peer's DH public value from a handshake datagram. Returns
/// `None` for datagrams too short to carry one (e.g. NAT punch packets).
pub fn parse_handshake_datagram(datagram: &[u8]) -> Option<[u8; DH_LEN]> {
    if datagram.len() < DH_LEN {
        return None;
    }
    let mut value = [0u8; DH_LEN];
    value.copy_from_slice(&datagram[..DH_LEN]);
    Some(value)
}

type CbcEnc = cbc::Encryptor<Blowfish>;
type CbcDec = cbc::Decryptor<Blowfish>;

/// Symmetric framing cipher for one keyed session.
#[derive(Clone)]
pub struct FrameCipher {
    key: [u8; DH_LEN],
}

impl FrameCipher {
    pub fn new(shared_secret: [u8; DH_LEN]) -> Self {
        Self { key: shared_secret }
    }

    /// Encrypt a block-aligned plaintext frame. Output is `IV || ciphertext`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        if plaintext.is_empty() || plaintext.len() % FRAME_ALIGN != 0 {
            return Err(Error::Frame);
        }
        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill(&mut iv[..]);
        let enc = CbcEnc::new_from_slices(&self.key, &iv).map_err(|_| Error::Frame)?;
        let ciphertext = enc.encrypt_padded_vec_mut::<NoPadding>(plaintext);

        let mut out = Vec::with_capacity(IV_LEN + ciphertext.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt an `IV || ciphertext` datagram back into a plaintext frame.
    pub fn decrypt(&self, datagram: &[u8]) -> Result<Vec<u8>> {
        if datagram.len() < IV_LEN + FRAME_ALIGN || (datagram.len() - IV_LEN) % FRAME_ALIGN != 0 {
            return Err(Error::Frame);
        }
        let (iv, ciphertext) = datagram.split_at(IV_LEN);
        let dec = CbcDec::new_from_slices(&self.key, iv).map_err(|_| Error::Frame)?;
        dec.decrypt_padded_vec_mut::<NoPadding>(ciphertext)
            .map_err(|_| Error::Frame)
    }
}

impl std::fmt::Debug for FrameCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameCipher").finish_non_exhaustive()
    }
}

/// Digest signed during authentication: `SHA-1(shared_secret || timestamp)`.
pub fn auth_digest(shared_secret: &[u8; DH_LEN], timestamp_ms: u64) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(shared_secret);
    hasher.update(timestamp_ms.to_be_bytes());
    let digest = hasher.finalize();
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{decode_frame, encode_frame, MsgType};

    #[test]
    fn both_sides_derive_identical_secret() {
        let a = DhExchange::generate();
        let b = DhExchange::generate();
        let secret_a = a.shared_secret(&b.public_value()).unwrap();
        let secret_b = b.shared_secret(&a.public_value()).unwrap();
        assert_eq!(secret_a, secret_b);
        assert_eq!(secret_a.len(), DH_LEN);
    }

    #[test]
    fn degenerate_peer_values_rejected() {
        let a = DhExchange::generate();
        let zero = [0u8; DH_LEN];
        assert!(a.shared_secret(&zero).is_err());
        let mut one = [0u8; DH_LEN];
        one[DH_LEN - 1] = 1;
        assert!(a.shared_secret(&one).is_err());
        // p itself is 0 mod p.
        assert!(a.shared_secret(&DH_PRIME).is_err());
    }

    #[test]
    fn handshake_datagram_jitter_stays_parseable() {
        let a = DhExchange::generate();
        for _ in 0..32 {
            let datagram = a.handshake_datagram();
            assert!(datagram.len() >= DH_LEN);
            assert!(datagram.len() <= DH_LEN + HANDSHAKE_JITTER_MAX);
            assert_eq!(parse_handshake_datagram(&datagram), Some(a.public_value()));
        }
    }

    #[test]
    fn short_datagram_is_not_a_handshake() {
        assert_eq!(parse_handshake_datagram(&[0u8; 1]), None);
        assert_eq!(parse_handshake_datagram(&[0u8; DH_LEN - 1]), None);
    }

    #[test]
    fn keyed_peers_decrypt_each_others_frames() {
        let a = DhExchange::generate();
        let b = DhExchange::generate();
        let cipher_a = FrameCipher::new(a.shared_secret(&b.public_value()).unwrap());
        let cipher_b = FrameCipher::new(b.shared_secret(&a.public_value()).unwrap());

        let frame = encode_frame(MsgType::Data, b"first authenticated frame");
        let sealed = cipher_a.encrypt(&frame).unwrap();
        let opened = cipher_b.decrypt(&sealed).unwrap();
        let (msg_type, payload) = decode_frame(&opened).unwrap();
        assert_eq!(msg_type, MsgType::Data);
        assert_eq!(payload, b"first authenticated frame");
    }

    #[test]
    fn fresh_iv_per_frame() {
        let cipher = FrameCipher::new([7u8; DH_LEN]);
        let frame = encode_frame(MsgType::Close, &[]);
        let one = cipher.encrypt(&frame).unwrap();
        let two = cipher.encrypt(&frame).unwrap();
        assert_ne!(one, two);
    }

    #[test]
    fn wrong_key_fails_frame_validation() {
        let good = FrameCipher::new([1u8; DH_LEN]);
        let bad = FrameCipher::new([2u8; DH_LEN]);
        let frame = encode_frame(MsgType::Data, b"payload");
        let sealed = good.encrypt(&frame).unwrap();
        // Decryption itself cannot fail, but the checksum catches it.
        let garbage = bad.decrypt(&sealed).unwrap();
        assert!(decode_frame(&garbage).is_err());
    }

    #[test]
    fn unaligned_ciphertext_rejected() {
        let cipher = FrameCipher::new([3u8; DH_LEN]);
        assert!(cipher.decrypt(&[0u8; IV_LEN + 7]).is_err());
        assert!(cipher.decrypt(&[0u8; 5]).is_err());
    }

    #[test]
    fn auth_digest_binds_secret_and_timestamp() {
        let secret = [9u8; DH_LEN];
        let d1 = auth_digest(&secret, 1000);
        let d2 = auth_digest(&secret, 1001);
        let d3 = auth_digest(&[8u8; DH_LEN], 1000);
        assert_ne!(d1, d2);
        assert_ne!(d1, d3);
        assert_eq!(d1, auth_digest(&secret, 1000));
    }
}
