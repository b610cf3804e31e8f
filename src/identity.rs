//! # Node identity
//!
//! A node's long-term identity is an Ed25519 keypair plus a proof-of-work
//! nonce pair. The 160-bit node id is the SHA-1 of the public key, and all
//! overlay routing distances are XOR over that id space.
//!
//! ## Rank
//!
//! `rank = 161 - floor(log2(SHA-1(nonce[0] || nonce[1] || public_key)))`
//!
//! A hashcash-style score: the smaller the hash, the higher the rank, and
//! finding a nonce pair for a higher rank takes exponentially more search.
//! Rank is an ordering/priority signal only; it never proves identity.
//! The background search that improves it lives outside this crate; the
//! identity merely accepts a better nonce pair when one is found.
//!
//! ## Persistence
//!
//! The secret key and nonce pair are written to disk once at creation and
//! loaded thereafter. Rank is recomputed on load, never trusted from disk.

use std::fmt;
use std::path::Path;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};

/// Bits in the id space.
pub const ID_BITS: usize = 160;

/// Bytes in a node id.
pub const ID_LEN: usize = 20;

/// Highest valid bucket index and rank (adjacent ids, distance 1).
pub const MAX_BUCKET_INDEX: usize = 161;

/// A 160-bit overlay identifier: SHA-1 of an Ed25519 public key for nodes,
/// or an arbitrary 160-bit key for lookup targets.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId([u8; ID_LEN]);

impl NodeId {
    #[inline]
    pub fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Derive the id of a public key.
    pub fn of_public_key(public_key: &[u8; 32]) -> Self {
        let digest = Sha1::digest(public_key);
        let mut out = [0u8; ID_LEN];
        out.copy_from_slice(&digest);
        Self(out)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    #[inline]
    pub fn xor_distance(&self, other: &NodeId) -> [u8; ID_LEN] {
        let mut out = [0u8; ID_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> std::result::Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != ID_LEN {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; ID_LEN];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Total order over XOR distances, closest first.
pub fn distance_cmp(a: &[u8; ID_LEN], b: &[u8; ID_LEN]) -> std::cmp::Ordering {
    a.cmp(b)
}

/// Number of leading zero bits in a 160-bit value; `ID_BITS` for zero.
fn leading_zero_bits(bytes: &[u8; ID_LEN]) -> usize {
    for (byte_idx, byte) in bytes.iter().enumerate() {
        if *byte != 0 {
            return byte_idx * 8 + byte.leading_zeros() as usize;
        }
    }
    ID_BITS
}

/// Distance bucket index: `161 - floor(log2(a XOR b))`.
///
/// Yields 2..=161 for distinct ids (higher = closer). Undefined for equal
/// ids, which callers must exclude before indexing.
pub fn bucket_index(a: &NodeId, b: &NodeId) -> Option<usize> {
    let dist = a.xor_distance(b);
    let lz = leading_zero_bits(&dist);
    if lz == ID_BITS {
        return None;
    }
    // floor(log2(dist)) = 159 - lz
    Some(161 - (ID_BITS - 1 - lz))
}

/// Compute the rank a nonce pair supports for a given public key.
///
/// Mirrors the bucket formula over the PoW hash: smaller hash, higher
/// rank. An all-zero hash caps at `MAX_BUCKET_INDEX`.
pub fn rank_of(nonce: [u64; 2], public_key: &[u8; 32]) -> u32 {
    let mut hasher = Sha1::new();
    hasher.update(nonce[0].to_be_bytes());
    hasher.update(nonce[1].to_be_bytes());
    hasher.update(public_key);
    let digest = hasher.finalize();
    let mut h = [0u8; ID_LEN];
    h.copy_from_slice(&digest);
    let lz = leading_zero_bits(&h);
    if lz == ID_BITS {
        return MAX_BUCKET_INDEX as u32;
    }
    (161 - (ID_BITS - 1 - lz)) as u32
}

/// On-disk identity file: key material and nonce pair only. Rank is
/// derived state and is recomputed on load.
#[derive(Serialize, Deserialize)]
struct IdentityFile {
    secret_key: [u8; 32],
    nonce: [u64; 2],
}

/// A node's long-term identity: signing keypair, proof-of-work nonce pair
/// and the rank that pair supports.
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
    nonce: [u64; 2],
    rank: u32,
}

impl Identity {
    /// Generate a fresh identity with a random nonce pair.
    ///
    /// The initial rank is whatever the random pair happens to score;
    /// improving it is the rank search task's job, via
    /// [`adopt_nonce`](Identity::adopt_nonce).
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let mut rng = rand::thread_rng();
        let nonce = [rng.gen::<u64>(), rng.gen::<u64>()];
        let rank = rank_of(nonce, &signing_key.verifying_key().to_bytes());
        Self {
            signing_key,
            nonce,
            rank,
        }
    }

    pub fn from_secret_key(bytes: &[u8; 32], nonce: [u64; 2]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        let rank = rank_of(nonce, &signing_key.verifying_key().to_bytes());
        Self {
            signing_key,
            nonce,
            rank,
        }
    }

    /// Load from `path`, or generate and persist a new identity if the
    /// file does not exist yet.
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            let identity = Self::generate();
            identity.save(path)?;
            Ok(identity)
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let file: IdentityFile = bincode::deserialize(&bytes)
            .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
        Ok(Self::from_secret_key(&file.secret_key, file.nonce))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = IdentityFile {
            secret_key: self.signing_key.to_bytes(),
            nonce: self.nonce,
        };
        let bytes = bincode::serialize(&file)
            .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    pub fn id(&self) -> NodeId {
        NodeId::of_public_key(&self.public_key_bytes())
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn nonce(&self) -> [u64; 2] {
        self.nonce
    }

    pub fn rank(&self) -> u32 {
        self.rank
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }

    /// Adopt a nonce pair found by the external rank search. Ignored
    /// unless it strictly improves the current rank.
    pub fn adopt_nonce(&mut self, nonce: [u64; 2]) -> bool {
        let rank = rank_of(nonce, &self.public_key_bytes());
        if rank > self.rank {
            self.nonce = nonce;
            self.rank = rank;
            true
        } else {
            false
        }
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("id", &self.id())
            .field("rank", &self.rank)
            .finish_non_exhaustive()
    }
}

/// Verify a signature against a raw public key.
pub fn verify_signature(public_key: &[u8; 32], message: &[u8], signature: &Signature) -> bool {
    match VerifyingKey::from_bytes(public_key) {
        Ok(key) => key.verify(message, signature).is_ok(),
        Err(_) => false,
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;

    /// Deterministic identity from an index: the index seeds the signing
    /// key, so ids are stable across runs.
    pub fn make_identity(index: u32) -> Identity {
        let mut seed = [0u8; 32];
        seed[..4].copy_from_slice(&index.to_be_bytes());
        Identity::from_secret_key(&seed, [u64::from(index), 0])
    }
}
