//! Key material and the AEAD boundary
//!
//! - [`Identity`]: long-term X25519 key pair taken from a 32-byte seed
//! - [`FrameCipher`]: AEAD capability used by the handshake and sealed frames
//! - [`ChaChaPolyCipher`]: default ChaCha20-Poly1305 implementation
//!
//! Nonces are `0u32 ‖ counter(u64, big endian)`; every key is used with a
//! strictly increasing counter, so a nonce never repeats under one key.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Nonce,
};
use rand_core::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::error::{Result, TunnelError};
use crate::KEY_SIZE;

/// X25519 public key size
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Seed size accepted by [`Identity::from_seed`]
pub const SEED_SIZE: usize = 32;

/// AEAD nonce size
pub const NONCE_SIZE: usize = 12;

/// Authenticated encryption with associated data
///
/// Implementations must be deterministic for a given key, nonce and input.
pub trait FrameCipher: Send {
    /// Returns ciphertext followed by the authentication tag.
    fn seal(&self, key: &[u8; KEY_SIZE], nonce: u64, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>>;

    /// Fails with [`TunnelError::Crypto`] when the tag does not verify.
    fn open(&self, key: &[u8; KEY_SIZE], nonce: u64, aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>>;
}

fn nonce_bytes(counter: u64) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[4..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

/// ChaCha20-Poly1305 with a 16-byte tag
#[derive(Debug, Default, Clone, Copy)]
pub struct ChaChaPolyCipher;

impl FrameCipher for ChaChaPolyCipher {
    fn seal(&self, key: &[u8; KEY_SIZE], nonce: u64, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher = ChaCha20Poly1305::new_from_slice(key)
            .map_err(|_| TunnelError::Crypto("invalid key length".into()))?;
        let nonce = nonce_bytes(nonce);
        cipher
            .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad })
            .map_err(|e| TunnelError::Crypto(format!("seal failed: {}", e)))
    }

    fn open(&self, key: &[u8; KEY_SIZE], nonce: u64, aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let cipher = ChaCha20Poly1305::new_from_slice(key)
            .map_err(|_| TunnelError::Crypto("invalid key length".into()))?;
        let nonce = nonce_bytes(nonce);
        cipher
            .decrypt(Nonce::from_slice(&nonce), Payload { msg: ciphertext, aad })
            .map_err(|_| TunnelError::Crypto("authentication failed".into()))
    }
}

/// Long-term X25519 key pair
pub struct Identity {
    secret: StaticSecret,
    public: PublicKey,
}

impl Identity {
    /// Same seed, same key pair. The seed must be exactly 32 bytes.
    pub fn from_seed(seed: &[u8]) -> Result<Self> {
        let bytes: Zeroizing<[u8; SEED_SIZE]> = Zeroizing::new(seed.try_into().map_err(|_| {
            TunnelError::Key(format!("seed must be {} bytes, got {}", SEED_SIZE, seed.len()))
        })?);
        let secret = StaticSecret::from(*bytes);
        let public = PublicKey::from(&secret);
        Ok(Self { secret, public })
    }

    pub fn public_key_bytes(&self) -> [u8; PUBLIC_KEY_SIZE] {
        *self.public.as_bytes()
    }

    pub(crate) fn secret(&self) -> &StaticSecret {
        &self.secret
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("public", self.public.as_bytes())
            .finish_non_exhaustive()
    }
}

/// Public key for a seed, without keeping the secret around.
pub fn derive_public_key(seed: &[u8]) -> Result<[u8; PUBLIC_KEY_SIZE]> {
    Ok(Identity::from_seed(seed)?.public_key_bytes())
}

/// Validate a peer public key supplied by the caller.
pub fn parse_peer_key(key: &[u8]) -> Result<[u8; PUBLIC_KEY_SIZE]> {
    key.try_into().map_err(|_| {
        TunnelError::Key(format!(
            "peer key must be {} bytes, got {}",
            PUBLIC_KEY_SIZE,
            key.len()
        ))
    })
}

/// Fresh ephemeral key pair for one handshake
pub(crate) fn generate_ephemeral() -> (StaticSecret, PublicKey) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    (secret, public)
}

/// Directional session keys, wiped on drop
pub struct TrafficKeys {
    pub send: Zeroizing<[u8; KEY_SIZE]>,
    pub recv: Zeroizing<[u8; KEY_SIZE]>,
}

impl std::fmt::Debug for TrafficKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TrafficKeys(..)")
    }
}
