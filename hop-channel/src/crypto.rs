//! Datagram encryption
//!
//! Every datagram sent by a datagram channel is sealed with AES-256-GCM:
//!
//! ```text
//! +------------------+------------------+---------------------------+
//! | session id (u64) | position (u64)   | ciphertext || tag (16)    |
//! +------------------+------------------+---------------------------+
//! ```
//!
//! Both header fields are big-endian and authenticated as associated data.
//! The nonce is the sender's direction byte, three zero bytes and the
//! position, so the two directions of a session never share a nonce even
//! though they share a key.
//!
//! One [`DatagramCryptor`] is shared by all datagram channels of a session:
//! the position counter and the replay window are per session, not per
//! channel.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};

use crate::error::{Error, Result};
use crate::session::{PeerRole, SessionId};

pub const KEY_LEN: usize = 32;
pub const TAG_LEN: usize = 16;
pub const DATAGRAM_HEADER_LEN: usize = 16;
/// Number of positions behind the highest one that are still accepted
pub const REPLAY_WINDOW: u64 = 1024;

const WINDOW_WORDS: usize = (REPLAY_WINDOW / 64) as usize;

/// 256-bit session key
#[derive(Clone)]
pub struct SessionKey([u8; KEY_LEN]);

impl SessionKey {
    pub fn new(key: [u8; KEY_LEN]) -> Self {
        Self(key)
    }

    pub fn random() -> Self {
        Self(rand::random())
    }

    /// Derive a key from a pre-shared secret
    ///
    /// The secret is truncated or padded to 32 bytes using PKCS5 padding.
    pub fn from_secret(secret: &[u8]) -> Self {
        let mut key = [0u8; KEY_LEN];
        let len = secret.len().min(KEY_LEN);
        key[..len].copy_from_slice(&secret[..len]);
        if len < KEY_LEN {
            let pad = (KEY_LEN - len) as u8;
            key[len..].fill(pad);
        }
        Self(key)
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// Read the session id of a datagram without decrypting it
pub fn peek_session_id(datagram: &[u8]) -> Option<SessionId> {
    let bytes: [u8; 8] = datagram.get(..8)?.try_into().ok()?;
    Some(SessionId::from_bytes(bytes))
}

/// Per-session datagram sealer and opener
pub struct DatagramCryptor {
    session_id: SessionId,
    role: PeerRole,
    cipher: Aes256Gcm,
    next_position: AtomicU64,
    replay: Mutex<ReplayWindow>,
}

impl DatagramCryptor {
    pub fn new(session_id: SessionId, key: &SessionKey, role: PeerRole) -> Self {
        Self {
            session_id,
            role,
            cipher: Aes256Gcm::new((&key.0).into()),
            next_position: AtomicU64::new(0),
            replay: Mutex::new(ReplayWindow::default()),
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    /// Seal a payload into a complete datagram
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let position = self.next_position.fetch_add(1, Ordering::Relaxed);
        let header = self.header(position);
        let nonce = nonce(self.role, position);

        let sealed = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad: &header,
                },
            )
            .map_err(|_| Error::Encryption("AES-GCM seal failed".into()))?;

        let mut datagram = Vec::with_capacity(DATAGRAM_HEADER_LEN + sealed.len());
        datagram.extend_from_slice(&header);
        datagram.extend_from_slice(&sealed);
        Ok(datagram)
    }

    /// Open a datagram sent by the peer, returning its position and payload
    pub fn decrypt(&self, datagram: &[u8]) -> Result<(u64, Vec<u8>)> {
        if datagram.len() < DATAGRAM_HEADER_LEN + TAG_LEN {
            return Err(Error::PacketTooShort {
                expected: DATAGRAM_HEADER_LEN + TAG_LEN,
                actual: datagram.len(),
            });
        }

        let (header, sealed) = datagram.split_at(DATAGRAM_HEADER_LEN);
        if peek_session_id(header) != Some(self.session_id) {
            return Err(Error::Decryption("session id mismatch".into()));
        }

        let mut position_bytes = [0u8; 8];
        position_bytes.copy_from_slice(&header[8..16]);
        let position = u64::from_be_bytes(position_bytes);

        if !self.lock_replay().is_fresh(position) {
            return Err(Error::Replay { position });
        }

        let nonce = nonce(self.role.peer(), position);
        let plaintext = self
            .cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: sealed,
                    aad: header,
                },
            )
            .map_err(|_| Error::Decryption("authentication failed".into()))?;

        // checked again: a concurrent copy may have been accepted meanwhile
        if !self.lock_replay().accept(position) {
            return Err(Error::Replay { position });
        }
        Ok((position, plaintext))
    }

    fn header(&self, position: u64) -> [u8; DATAGRAM_HEADER_LEN] {
        let mut header = [0u8; DATAGRAM_HEADER_LEN];
        header[..8].copy_from_slice(&self.session_id.to_bytes());
        header[8..].copy_from_slice(&position.to_be_bytes());
        header
    }

    fn lock_replay(&self) -> std::sync::MutexGuard<'_, ReplayWindow> {
        self.replay.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl fmt::Debug for DatagramCryptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatagramCryptor")
            .field("session_id", &self.session_id)
            .field("role", &self.role)
            .field("next_position", &self.next_position.load(Ordering::Relaxed))
            .finish()
    }
}

fn nonce(sender: PeerRole, position: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[0] = sender.direction();
    nonce[4..].copy_from_slice(&position.to_be_bytes());
    nonce
}

/// Sliding bitmap of recently accepted positions
#[derive(Debug, Default)]
struct ReplayWindow {
    highest: Option<u64>,
    // bit (p % REPLAY_WINDOW) is set when position p was accepted
    seen: [u64; WINDOW_WORDS],
}

impl ReplayWindow {
    fn is_fresh(&self, position: u64) -> bool {
        match self.highest {
            None => true,
            Some(highest) if position > highest => true,
            Some(highest) => highest - position < REPLAY_WINDOW && !self.is_set(position),
        }
    }

    fn accept(&mut self, position: u64) -> bool {
        if !self.is_fresh(position) {
            return false;
        }

        match self.highest {
            Some(highest) if position > highest => {
                if position - highest >= REPLAY_WINDOW {
                    self.seen = [0; WINDOW_WORDS];
                } else {
                    for stale in highest + 1..position {
                        self.clear(stale);
                    }
                }
                self.highest = Some(position);
            }
            Some(_) => {}
            None => self.highest = Some(position),
        }
        self.set(position);
        true
    }

    fn slot(position: u64) -> (usize, u64) {
        let bit = position % REPLAY_WINDOW;
        ((bit / 64) as usize, 1u64 << (bit % 64))
    }

    fn is_set(&self, position: u64) -> bool {
        let (word, mask) = Self::slot(position);
        self.seen[word] & mask != 0
    }

    fn set(&mut self, position: u64) {
        let (word, mask) = Self::slot(position);
        self.seen[word] |= mask;
    }

    fn clear(&mut self, position: u64) {
        let (word, mask) = Self::slot(position);
        self.seen[word] &= !mask;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (DatagramCryptor, DatagramCryptor) {
        let sid = SessionId::new(0xABCD);
        let key = SessionKey::from_secret(b"datagram-test-key");
        (
            DatagramCryptor::new(sid, &key, PeerRole::Client),
            DatagramCryptor::new(sid, &key, PeerRole::Server),
        )
    }

    #[test]
    fn test_from_secret_pads_key() {
        let key = SessionKey::from_secret(b"hello");
        assert_eq!(&key.0[..5], b"hello");
        assert!(key.0[5..].iter().all(|&b| b == 27));
    }

    #[test]
    fn test_seal_and_open() {
        let (client, server) = pair();
        let datagram = client.encrypt(b"packet").unwrap();

        assert_eq!(peek_session_id(&datagram), Some(SessionId::new(0xABCD)));
        assert_eq!(datagram.len(), DATAGRAM_HEADER_LEN + 6 + TAG_LEN);

        let (position, plaintext) = server.decrypt(&datagram).unwrap();
        assert_eq!(position, 0);
        assert_eq!(plaintext, b"packet");
    }

    #[test]
    fn test_own_datagrams_do_not_open() {
        // the direction byte differs, so a reflected datagram fails authentication
        let (client, _) = pair();
        let datagram = client.encrypt(b"echo").unwrap();
        assert!(matches!(client.decrypt(&datagram), Err(Error::Decryption(_))));
    }

    #[test]
    fn test_tampered_header_rejected() {
        let (client, server) = pair();
        let mut datagram = client.encrypt(b"data").unwrap();
        datagram[15] ^= 0x01;
        assert!(server.decrypt(&datagram).unwrap_err().is_drop_silently());
    }

    #[test]
    fn test_replay_rejected() {
        let (client, server) = pair();
        let datagram = client.encrypt(b"once").unwrap();

        server.decrypt(&datagram).unwrap();
        assert!(matches!(
            server.decrypt(&datagram),
            Err(Error::Replay { position: 0 })
        ));
    }

    #[test]
    fn test_reordering_within_window_accepted() {
        let (client, server) = pair();
        let datagrams: Vec<Vec<u8>> = (0..10).map(|i| client.encrypt(&[i]).unwrap()).collect();

        for index in [9usize, 3, 0, 5, 1] {
            let (position, payload) = server.decrypt(&datagrams[index]).unwrap();
            assert_eq!(position, index as u64);
            assert_eq!(payload, vec![index as u8]);
        }
        assert!(server.decrypt(&datagrams[3]).is_err());
    }

    #[test]
    fn test_window_slides() {
        let mut window = ReplayWindow::default();
        assert!(window.accept(5));
        assert!(window.accept(REPLAY_WINDOW + 10));

        // fell out of the window
        assert!(!window.is_fresh(5));
        assert!(!window.is_fresh(9));
        // inside the window, never seen
        assert!(window.is_fresh(REPLAY_WINDOW + 9));
        assert!(window.accept(11));
        assert!(!window.accept(11));
    }
}
