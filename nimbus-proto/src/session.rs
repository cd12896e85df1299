//! Session establishment, resumption, and payload protection
//!
//! The handshake is a nonce exchange authenticated by HMAC-SHA256 under a
//! pre-shared link secret derived from the device and server key material.
//! Session keys (one AES-256-GCM key and base IV per direction) come from
//! HKDF-SHA256 over both nonces. Per-message nonces fold the transport
//! message id into the base IV, which is why every non-empty payload rides on
//! a freshly allocated id, including responses.
//!
//! Key material never leaves this module except as the opaque session blob
//! handed to the host's [`KeyStore`](crate::platform::KeyStore), and is never
//! logged.

use bytes::{Buf, BufMut};
use rand::RngCore;
use ring::{aead, constant_time, hkdf, hmac};
use tracing::{debug, trace};

use crate::{
    coding::{BufExt, BufMutExt},
    error::ProtocolError,
    HMAC_LEN, KEY_LEN, NONCE_LEN, SESSION_ID_LEN,
};

/// AES-GCM base IV length
const IV_LEN: usize = 12;
/// Session blob format version
const BLOB_VERSION: u8 = 1;
/// Ids skipped ahead on resume to cover sends after the last blob save
pub(crate) const ID_RESUME_SKIP: u16 = 256;

/// Lifecycle state of the secure channel
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SessionState {
    /// No connection attempt has been made
    Unestablished,
    /// Key exchange is in progress
    Handshaking,
    /// A full handshake completed
    Established,
    /// A saved session blob was restored and accepted by the peer
    Resumed,
    /// An authentication, decryption, or keepalive failure occurred; a fresh
    /// handshake will be attempted after backoff
    Failed,
}

impl SessionState {
    /// Whether application messages may be encoded/decoded in this state
    pub fn is_active(self) -> bool {
        matches!(self, Self::Established | Self::Resumed)
    }
}

struct OutLen(usize);

impl hkdf::KeyType for OutLen {
    fn len(&self) -> usize {
        self.0
    }
}

fn hkdf_expand(prk: &hkdf::Prk, label: &[u8], out: &mut [u8]) {
    // Infallible for outputs <= 255 * 32 bytes
    prk.expand(&[label], OutLen(out.len()))
        .and_then(|okm| okm.fill(out))
        .unwrap_or_else(|_| unreachable!("hkdf output length is fixed"))
}

/// Derive the pre-shared link secret from persisted key material
pub(crate) fn derive_link_secret(device_secret: &[u8], server_public: &[u8]) -> [u8; KEY_LEN] {
    let mut ikm = Vec::with_capacity(device_secret.len() + server_public.len());
    ikm.extend_from_slice(device_secret);
    ikm.extend_from_slice(server_public);
    let prk = hkdf::Salt::new(hkdf::HKDF_SHA256, b"nimbus-link-v1").extract(&ikm);
    let mut out = [0; KEY_LEN];
    hkdf_expand(&prk, b"link", &mut out);
    out
}

/// Key confirmation MAC over a nonce pair
pub(crate) fn handshake_hmac(
    link: &[u8; KEY_LEN],
    first: &[u8; NONCE_LEN],
    second: &[u8; NONCE_LEN],
) -> [u8; HMAC_LEN] {
    let key = hmac::Key::new(hmac::HMAC_SHA256, link);
    let mut data = [0; NONCE_LEN * 2];
    data[..NONCE_LEN].copy_from_slice(first);
    data[NONCE_LEN..].copy_from_slice(second);
    let tag = hmac::sign(&key, &data);
    let mut out = [0; HMAC_LEN];
    out.copy_from_slice(tag.as_ref());
    out
}

/// Raw per-session key material, persisted inside the session blob
#[derive(Clone)]
pub(crate) struct RawKeys {
    d2c_key: [u8; KEY_LEN],
    c2d_key: [u8; KEY_LEN],
    d2c_iv: [u8; IV_LEN],
    c2d_iv: [u8; IV_LEN],
}

impl RawKeys {
    fn encode<B: BufMut>(&self, buf: &mut B) {
        buf.put_slice(&self.d2c_key);
        buf.put_slice(&self.c2d_key);
        buf.put_slice(&self.d2c_iv);
        buf.put_slice(&self.c2d_iv);
    }

    fn decode<B: Buf>(buf: &mut B) -> Option<Self> {
        Some(Self {
            d2c_key: buf.get_array().ok()?,
            c2d_key: buf.get_array().ok()?,
            d2c_iv: buf.get_array().ok()?,
            c2d_iv: buf.get_array().ok()?,
        })
    }
}

/// One direction's AEAD state
pub(crate) struct DirectionKey {
    key: aead::LessSafeKey,
    iv: [u8; IV_LEN],
}

impl DirectionKey {
    fn new(key: &[u8; KEY_LEN], iv: [u8; IV_LEN]) -> Result<Self, ProtocolError> {
        let key = aead::UnboundKey::new(&aead::AES_256_GCM, key)
            .map_err(|_| ProtocolError::Encryption)?;
        Ok(Self {
            key: aead::LessSafeKey::new(key),
            iv,
        })
    }

    fn nonce(&self, ctr: u16) -> aead::Nonce {
        let mut bytes = self.iv;
        let ctr = ctr.to_be_bytes();
        bytes[IV_LEN - 2] ^= ctr[0];
        bytes[IV_LEN - 1] ^= ctr[1];
        aead::Nonce::assume_unique_for_key(bytes)
    }

    /// Encrypt `data` in place, appending the tag
    pub fn seal(&self, ctr: u16, aad: &[u8], data: &mut Vec<u8>) -> Result<(), ProtocolError> {
        self.key
            .seal_in_place_append_tag(self.nonce(ctr), aead::Aad::from(aad), data)
            .map_err(|_| ProtocolError::Encryption)
    }

    /// Decrypt `data`, returning the plaintext
    pub fn open(&self, ctr: u16, aad: &[u8], data: &mut [u8]) -> Result<Vec<u8>, ProtocolError> {
        let plain = self
            .key
            .open_in_place(self.nonce(ctr), aead::Aad::from(aad), data)
            .map_err(|_| ProtocolError::Decryption)?;
        Ok(plain.to_vec())
    }
}

/// Both directions' AEAD state plus the raw material to persist it
pub(crate) struct SessionKeys {
    raw: RawKeys,
    pub d2c: DirectionKey,
    pub c2d: DirectionKey,
}

impl SessionKeys {
    fn from_raw(raw: RawKeys) -> Result<Self, ProtocolError> {
        Ok(Self {
            d2c: DirectionKey::new(&raw.d2c_key, raw.d2c_iv)?,
            c2d: DirectionKey::new(&raw.c2d_key, raw.c2d_iv)?,
            raw,
        })
    }
}

/// Derive fresh session keys from the link secret and handshake nonces
pub(crate) fn derive_session_keys(
    link: &[u8; KEY_LEN],
    device_nonce: &[u8; NONCE_LEN],
    cloud_nonce: &[u8; NONCE_LEN],
) -> Result<SessionKeys, ProtocolError> {
    let mut salt = [0; NONCE_LEN * 2];
    salt[..NONCE_LEN].copy_from_slice(device_nonce);
    salt[NONCE_LEN..].copy_from_slice(cloud_nonce);
    let prk = hkdf::Salt::new(hkdf::HKDF_SHA256, &salt).extract(link);
    let mut raw = RawKeys {
        d2c_key: [0; KEY_LEN],
        c2d_key: [0; KEY_LEN],
        d2c_iv: [0; IV_LEN],
        c2d_iv: [0; IV_LEN],
    };
    hkdf_expand(&prk, b"d2c key", &mut raw.d2c_key);
    hkdf_expand(&prk, b"c2d key", &mut raw.c2d_key);
    hkdf_expand(&prk, b"d2c iv", &mut raw.d2c_iv);
    hkdf_expand(&prk, b"c2d iv", &mut raw.c2d_iv);
    SessionKeys::from_raw(raw)
}

/// Deserialized resumable session state
pub(crate) struct ResumeBlob {
    pub session_id: [u8; SESSION_ID_LEN],
    raw: RawKeys,
    pub next_id: u16,
}

impl ResumeBlob {
    pub fn decode(blob: &[u8]) -> Option<Self> {
        let buf = &mut &blob[..];
        if buf.get::<u8>().ok()? != BLOB_VERSION {
            return None;
        }
        let out = Self {
            session_id: buf.get_array().ok()?,
            raw: RawKeys::decode(buf)?,
            next_id: buf.get::<u16>().ok()?,
        };
        if buf.has_remaining() {
            return None;
        }
        Some(out)
    }
}

/// Result of processing the cloud's hello
pub(crate) enum HandshakeStep {
    /// Continue the full handshake by sending our key-confirmation MAC
    SendFinish { hmac: [u8; HMAC_LEN] },
    /// The peer accepted resumption; the session is live immediately
    Resumed { next_id: u16 },
}

/// The secure channel state machine
pub(crate) struct Session {
    state: SessionState,
    session_id: [u8; SESSION_ID_LEN],
    link: Option<[u8; KEY_LEN]>,
    device_nonce: [u8; NONCE_LEN],
    keys: Option<SessionKeys>,
    offered_resume: Option<ResumeBlob>,
    expected_finish: Option<[u8; HMAC_LEN]>,
    time_synced: bool,
}

impl Session {
    pub fn new() -> Self {
        Self {
            state: SessionState::Unestablished,
            session_id: [0; SESSION_ID_LEN],
            link: None,
            device_nonce: [0; NONCE_LEN],
            keys: None,
            offered_resume: None,
            expected_finish: None,
            time_synced: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Start a handshake, optionally offering to resume a saved session
    ///
    /// Returns the fields of the device hello: our fresh nonce and the
    /// offered resume id (all zeroes when no blob is available).
    pub fn begin_handshake(
        &mut self,
        link: [u8; KEY_LEN],
        resume: Option<ResumeBlob>,
    ) -> ([u8; NONCE_LEN], [u8; SESSION_ID_LEN]) {
        let mut nonce = [0; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let resume_id = resume
            .as_ref()
            .map(|blob| blob.session_id)
            .unwrap_or([0; SESSION_ID_LEN]);
        debug!(
            resume = resume.is_some(),
            "starting handshake from {:?}", self.state
        );
        self.state = SessionState::Handshaking;
        self.link = Some(link);
        self.device_nonce = nonce;
        self.keys = None;
        self.offered_resume = resume;
        self.expected_finish = None;
        self.time_synced = false;
        (nonce, resume_id)
    }

    /// Process the cloud's hello
    pub fn on_hello_cloud(
        &mut self,
        cloud_nonce: [u8; NONCE_LEN],
        resume_ok: bool,
    ) -> Result<HandshakeStep, ProtocolError> {
        if self.state != SessionState::Handshaking {
            return Err(ProtocolError::InvalidState);
        }
        let link = self.link.ok_or(ProtocolError::Authentication)?;
        if resume_ok {
            if let Some(blob) = self.offered_resume.take() {
                self.session_id = blob.session_id;
                self.keys = Some(SessionKeys::from_raw(blob.raw)?);
                self.state = SessionState::Resumed;
                debug!("session resumed");
                trace!(informational = %ProtocolError::SessionResumed, "skipped full handshake");
                return Ok(HandshakeStep::Resumed {
                    next_id: blob.next_id.wrapping_add(ID_RESUME_SKIP),
                });
            }
            // resume_ok without an offer is a confused peer; fall through to
            // the full handshake it must also be able to complete
        }
        self.offered_resume = None;
        self.keys = Some(derive_session_keys(&link, &self.device_nonce, &cloud_nonce)?);
        rand::thread_rng().fill_bytes(&mut self.session_id);
        self.expected_finish = Some(handshake_hmac(&link, &cloud_nonce, &self.device_nonce));
        Ok(HandshakeStep::SendFinish {
            hmac: handshake_hmac(&link, &self.device_nonce, &cloud_nonce),
        })
    }

    /// Process the cloud's key-confirmation MAC, completing the handshake
    pub fn on_handshake_finish(&mut self, hmac: &[u8; HMAC_LEN]) -> Result<(), ProtocolError> {
        if self.state != SessionState::Handshaking {
            return Err(ProtocolError::InvalidState);
        }
        let expected = self
            .expected_finish
            .take()
            .ok_or(ProtocolError::Authentication)?;
        constant_time::verify_slices_are_equal(&expected, hmac)
            .map_err(|_| ProtocolError::Authentication)?;
        self.state = SessionState::Established;
        debug!("session established");
        Ok(())
    }

    /// Encrypt an outbound application payload in place
    pub fn seal(&self, id: u16, aad: &[u8], data: &mut Vec<u8>) -> Result<(), ProtocolError> {
        if !self.state.is_active() {
            return Err(ProtocolError::InvalidState);
        }
        let keys = self.keys.as_ref().ok_or(ProtocolError::Encryption)?;
        keys.d2c.seal(id, aad, data)
    }

    /// Decrypt an inbound application payload
    pub fn open(&self, id: u16, aad: &[u8], data: &mut [u8]) -> Result<Vec<u8>, ProtocolError> {
        if !self.state.is_active() {
            return Err(ProtocolError::InvalidState);
        }
        let keys = self.keys.as_ref().ok_or(ProtocolError::Decryption)?;
        keys.c2d.open(id, aad, data)
    }

    /// Serialize the resumable session blob, or `None` when no keys are live
    pub fn make_blob(&self, next_id: u16) -> Option<Vec<u8>> {
        let keys = self.keys.as_ref()?;
        if !self.state.is_active() {
            return None;
        }
        let mut blob = Vec::with_capacity(1 + SESSION_ID_LEN + 2 * KEY_LEN + 2 * IV_LEN + 2);
        blob.write(BLOB_VERSION);
        blob.put_slice(&self.session_id);
        keys.raw.encode(&mut blob);
        blob.write(next_id);
        Some(blob)
    }

    /// Whether the once-per-session time sync has already happened
    pub fn take_time_sync(&mut self) -> bool {
        !std::mem::replace(&mut self.time_synced, true)
    }

    /// Force the session to `Failed`, discarding key state
    pub fn fail(&mut self) {
        debug!("session failed from {:?}", self.state);
        self.state = SessionState::Failed;
        self.keys = None;
        self.offered_resume = None;
        self.expected_finish = None;
    }

    /// Return to `Unestablished`, discarding key state
    pub fn reset(&mut self) {
        self.state = SessionState::Unestablished;
        self.keys = None;
        self.offered_resume = None;
        self.expected_finish = None;
        self.time_synced = false;
    }
}
