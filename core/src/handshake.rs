//! Mutual authenticated key agreement
//!
//! Two messages in the Noise KK shape, both static keys known in advance:
//!
//! ```text
//! -> e, es, ss
//! <- e, ee, se
//! ```
//!
//! The transcript hash is SHA-256 and the chaining key is stepped with
//! HKDF-SHA256. Each message is `ephemeral public (32) ‖ tag (16)`, the tag
//! being an AEAD seal of the empty string under the current handshake key
//! with the transcript hash as associated data. A peer that does not hold the
//! expected static key cannot produce or verify the tag.

use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

use crate::crypto::{generate_ephemeral, FrameCipher, Identity, TrafficKeys, PUBLIC_KEY_SIZE};
use crate::error::{Result, TunnelError};
use crate::{KEY_SIZE, TAG_SIZE};

/// Wire size of either handshake message
pub const HANDSHAKE_MESSAGE_LEN: usize = PUBLIC_KEY_SIZE + TAG_SIZE;

const PROTOCOL_NAME: &[u8] = b"ToneLink_KK_25519_ChaChaPoly_SHA256";

/// Chaining key, transcript hash and the current handshake key
struct SymmetricState {
    ck: Zeroizing<[u8; 32]>,
    h: [u8; 32],
    k: Option<Zeroizing<[u8; KEY_SIZE]>>,
    n: u64,
}

impl SymmetricState {
    fn new(prologue: &[u8]) -> Self {
        let h: [u8; 32] = Sha256::digest(PROTOCOL_NAME).into();
        let mut state = Self {
            ck: Zeroizing::new(h),
            h,
            k: None,
            n: 0,
        };
        state.mix_hash(prologue);
        state
    }

    fn mix_hash(&mut self, data: &[u8]) {
        let mut hasher = Sha256::new();
        hasher.update(self.h);
        hasher.update(data);
        self.h = hasher.finalize().into();
    }

    fn expand(&self, ikm: &[u8]) -> Result<Zeroizing<[u8; 64]>> {
        let hk = Hkdf::<Sha256>::new(Some(&self.ck[..]), ikm);
        let mut okm = Zeroizing::new([0u8; 64]);
        hk.expand(&[], &mut okm[..])
            .map_err(|_| TunnelError::Crypto("HKDF expand failed".into()))?;
        Ok(okm)
    }

    fn mix_key(&mut self, ikm: &[u8]) -> Result<()> {
        let okm = self.expand(ikm)?;
        let mut ck = Zeroizing::new([0u8; 32]);
        let mut k = Zeroizing::new([0u8; KEY_SIZE]);
        ck.copy_from_slice(&okm[..32]);
        k.copy_from_slice(&okm[32..]);
        self.ck = ck;
        self.k = Some(k);
        self.n = 0;
        Ok(())
    }

    fn encrypt_and_hash(&mut self, cipher: &dyn FrameCipher, plaintext: &[u8]) -> Result<Vec<u8>> {
        let key = self
            .k
            .as_ref()
            .ok_or_else(|| TunnelError::Handshake("no handshake key".into()))?;
        let ciphertext = cipher.seal(key, self.n, &self.h, plaintext)?;
        self.n += 1;
        self.mix_hash(&ciphertext);
        Ok(ciphertext)
    }

    fn decrypt_and_hash(&mut self, cipher: &dyn FrameCipher, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let key = self
            .k
            .as_ref()
            .ok_or_else(|| TunnelError::Handshake("no handshake key".into()))?;
        let plaintext = cipher
            .open(key, self.n, &self.h, ciphertext)
            .map_err(|_| TunnelError::Handshake("peer authentication failed".into()))?;
        self.n += 1;
        self.mix_hash(ciphertext);
        Ok(plaintext)
    }

    /// Initiator-to-responder key first.
    fn split(&self) -> Result<(Zeroizing<[u8; KEY_SIZE]>, Zeroizing<[u8; KEY_SIZE]>)> {
        let okm = self.expand(&[])?;
        let mut first = Zeroizing::new([0u8; KEY_SIZE]);
        let mut second = Zeroizing::new([0u8; KEY_SIZE]);
        first.copy_from_slice(&okm[..32]);
        second.copy_from_slice(&okm[32..]);
        Ok((first, second))
    }
}

fn dh(secret: &StaticSecret, public: &[u8; PUBLIC_KEY_SIZE]) -> Result<Zeroizing<[u8; 32]>> {
    let shared = secret.diffie_hellman(&PublicKey::from(*public));
    if !shared.was_contributory() {
        return Err(TunnelError::Handshake("non-contributory key exchange".into()));
    }
    Ok(Zeroizing::new(*shared.as_bytes()))
}

fn split_message(message: &[u8]) -> Result<([u8; PUBLIC_KEY_SIZE], &[u8])> {
    if message.len() != HANDSHAKE_MESSAGE_LEN {
        return Err(TunnelError::Handshake(format!(
            "message must be {} bytes, got {}",
            HANDSHAKE_MESSAGE_LEN,
            message.len()
        )));
    }
    let mut ephemeral = [0u8; PUBLIC_KEY_SIZE];
    ephemeral.copy_from_slice(&message[..PUBLIC_KEY_SIZE]);
    Ok((ephemeral, &message[PUBLIC_KEY_SIZE..]))
}

fn prologue(client: &[u8; PUBLIC_KEY_SIZE], server: &[u8; PUBLIC_KEY_SIZE]) -> [u8; 2 * PUBLIC_KEY_SIZE] {
    let mut prologue = [0u8; 2 * PUBLIC_KEY_SIZE];
    prologue[..PUBLIC_KEY_SIZE].copy_from_slice(client);
    prologue[PUBLIC_KEY_SIZE..].copy_from_slice(server);
    prologue
}

/// Client side: writes message 1, reads message 2
pub struct Initiator {
    state: SymmetricState,
    ephemeral: StaticSecret,
    message: Vec<u8>,
}

impl Initiator {
    /// Build message 1 for `server_key`. The message is kept for retransmission.
    pub fn new(identity: &Identity, server_key: &[u8; PUBLIC_KEY_SIZE], cipher: &dyn FrameCipher) -> Result<Self> {
        let mut state = SymmetricState::new(&prologue(&identity.public_key_bytes(), server_key));
        let (ephemeral, ephemeral_public) = generate_ephemeral();

        state.mix_hash(ephemeral_public.as_bytes());
        state.mix_key(&dh(&ephemeral, server_key)?[..])?;
        state.mix_key(&dh(identity.secret(), server_key)?[..])?;
        let tag = state.encrypt_and_hash(cipher, &[])?;

        let mut message = Vec::with_capacity(HANDSHAKE_MESSAGE_LEN);
        message.extend_from_slice(ephemeral_public.as_bytes());
        message.extend_from_slice(&tag);

        Ok(Self {
            state,
            ephemeral,
            message,
        })
    }

    pub fn message(&self) -> &[u8] {
        &self.message
    }

    /// Consume message 2 and derive the traffic keys.
    pub fn finish(mut self, identity: &Identity, message: &[u8], cipher: &dyn FrameCipher) -> Result<TrafficKeys> {
        let (remote_ephemeral, tag) = split_message(message)?;

        self.state.mix_hash(&remote_ephemeral);
        self.state.mix_key(&dh(&self.ephemeral, &remote_ephemeral)?[..])?;
        self.state.mix_key(&dh(identity.secret(), &remote_ephemeral)?[..])?;
        self.state.decrypt_and_hash(cipher, tag)?;

        let (c2s, s2c) = self.state.split()?;
        Ok(TrafficKeys { send: c2s, recv: s2c })
    }
}

/// Server side: reads message 1, writes message 2
pub struct Responder {
    client_key: [u8; PUBLIC_KEY_SIZE],
}

/// Outcome of a successful responder step
pub struct Accepted {
    pub reply: Vec<u8>,
    pub keys: TrafficKeys,
}

impl Responder {
    pub fn new(client_key: [u8; PUBLIC_KEY_SIZE]) -> Self {
        Self { client_key }
    }

    /// Verify message 1 and produce message 2 with the traffic keys.
    pub fn accept(&self, identity: &Identity, message: &[u8], cipher: &dyn FrameCipher) -> Result<Accepted> {
        let (remote_ephemeral, tag) = split_message(message)?;
        let mut state = SymmetricState::new(&prologue(&self.client_key, &identity.public_key_bytes()));

        state.mix_hash(&remote_ephemeral);
        state.mix_key(&dh(identity.secret(), &remote_ephemeral)?[..])?;
        state.mix_key(&dh(identity.secret(), &self.client_key)?[..])?;
        state.decrypt_and_hash(cipher, tag)?;

        let (ephemeral, ephemeral_public) = generate_ephemeral();
        state.mix_hash(ephemeral_public.as_bytes());
        state.mix_key(&dh(&ephemeral, &remote_ephemeral)?[..])?;
        state.mix_key(&dh(&ephemeral, &self.client_key)?[..])?;
        let reply_tag = state.encrypt_and_hash(cipher, &[])?;

        let mut reply = Vec::with_capacity(HANDSHAKE_MESSAGE_LEN);
        reply.extend_from_slice(ephemeral_public.as_bytes());
        reply.extend_from_slice(&reply_tag);

        let (c2s, s2c) = state.split()?;
        Ok(Accepted {
            reply,
            keys: TrafficKeys { send: s2c, recv: c2s },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::ChaChaPolyCipher;

    fn identities() -> (Identity, Identity) {
        (
            Identity::from_seed(&[0x11; 32]).unwrap(),
            Identity::from_seed(&[0x22; 32]).unwrap(),
        )
    }

    #[test]
    fn test_handshake_agrees_on_keys() {
        let (client, server) = identities();
        let cipher = ChaChaPolyCipher;

        let initiator = Initiator::new(&client, &server.public_key_bytes(), &cipher).unwrap();
        assert_eq!(initiator.message().len(), HANDSHAKE_MESSAGE_LEN);

        let responder = Responder::new(client.public_key_bytes());
        let accepted = responder.accept(&server, initiator.message(), &cipher).unwrap();
        let client_keys = initiator.finish(&client, &accepted.reply, &cipher).unwrap();

        assert_eq!(*client_keys.send, *accepted.keys.recv);
        assert_eq!(*client_keys.recv, *accepted.keys.send);
        assert_ne!(*client_keys.send, *client_keys.recv);
    }

    #[test]
    fn test_fresh_ephemerals_each_run() {
        let (client, server) = identities();
        let cipher = ChaChaPolyCipher;
        let a = Initiator::new(&client, &server.public_key_bytes(), &cipher).unwrap();
        let b = Initiator::new(&client, &server.public_key_bytes(), &cipher).unwrap();
        assert_ne!(a.message(), b.message());
    }

    #[test]
    fn test_wrong_server_key_rejected() {
        let (client, server) = identities();
        let stranger = Identity::from_seed(&[0x33; 32]).unwrap();
        let cipher = ChaChaPolyCipher;

        let initiator = Initiator::new(&client, &stranger.public_key_bytes(), &cipher).unwrap();
        let responder = Responder::new(client.public_key_bytes());
        assert!(matches!(
            responder.accept(&server, initiator.message(), &cipher),
            Err(TunnelError::Handshake(_))
        ));
    }

    #[test]
    fn test_wrong_client_key_rejected() {
        let (client, server) = identities();
        let stranger = Identity::from_seed(&[0x44; 32]).unwrap();
        let cipher = ChaChaPolyCipher;

        let initiator = Initiator::new(&client, &server.public_key_bytes(), &cipher).unwrap();
        let responder = Responder::new(stranger.public_key_bytes());
        assert!(responder.accept(&server, initiator.message(), &cipher).is_err());
    }

    #[test]
    fn test_tampered_reply_rejected() {
        let (client, server) = identities();
        let cipher = ChaChaPolyCipher;

        let initiator = Initiator::new(&client, &server.public_key_bytes(), &cipher).unwrap();
        let responder = Responder::new(client.public_key_bytes());
        let mut accepted = responder.accept(&server, initiator.message(), &cipher).unwrap();
        accepted.reply[40] ^= 0x80;
        assert!(initiator.finish(&client, &accepted.reply, &cipher).is_err());
    }

    #[test]
    fn test_malformed_length_rejected() {
        let (client, server) = identities();
        let responder = Responder::new(client.public_key_bytes());
        assert!(matches!(
            responder.accept(&server, &[0u8; 20], &ChaChaPolyCipher),
            Err(TunnelError::Handshake(_))
        ));
    }

    #[test]
    fn test_low_order_ephemeral_rejected() {
        let (client, server) = identities();
        let responder = Responder::new(client.public_key_bytes());
        // All-zero point yields an all-zero shared secret
        let message = [0u8; HANDSHAKE_MESSAGE_LEN];
        assert!(responder.accept(&server, &message, &ChaChaPolyCipher).is_err());
    }
}
