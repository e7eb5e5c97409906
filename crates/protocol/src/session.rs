//! Per-device protocol state.
//!
//! A [`DeviceSession`] turns commands into packets and packets back into
//! device messages for a single device. It owns the sequence counter, the
//! negotiated session key (3.4 and 3.5) and the GCM nonce counter, so every
//! state change goes through `&mut self`.
//!
//! Session key negotiation is driven by the caller. Once a handshake has
//! produced a key, [`DeviceSession::install_session_key`] switches the
//! session over to it.

use std::time::Duration;

use md5::{Digest, Md5};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::cipher::{Cipher, CipherOptions, LocalKey, GCM_NONCE_LENGTH};
use crate::command::Command;
use crate::error::{ProtocolError, Result};
use crate::framing::{Frame, FrameCodec, FrameReader, Integrity};
use crate::payload::{parse_device_message, CommandData, DeviceMessage, DeviceType, PayloadCodec};
use crate::version::{PayloadEncryption, Version, VERSION_HEADER_LEN};

/// Idle timeout used when none is configured.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// First sequence number of a fresh session.
pub const INITIAL_SEQUENCE: u32 = 1;

/// Length of the MD5 excerpt in 3.1 CONTROL payloads.
const V31_DIGEST_LEN: usize = 16;

/// Who a session talks to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub local_key: LocalKey,
    pub version: Version,
}

impl DeviceIdentity {
    pub fn new(device_id: impl Into<String>, local_key: LocalKey, version: Version) -> Self {
        Self {
            device_id: device_id.into(),
            local_key,
            version,
        }
    }
}

/// How a received packet relates to the request awaiting an answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceOrder {
    /// Answers the outstanding request.
    InOrder,
    /// Carries a different sequence number than the outstanding request.
    OutOfOrder { expected: u32, got: u32 },
    /// Nothing was outstanding, or the device pushed it on its own.
    Unsolicited,
}

/// Advisory idle timeout for the transport holding the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdlePolicy {
    timeout: Duration,
}

impl Default for IdlePolicy {
    fn default() -> Self {
        Self::new(DEFAULT_IDLE_TIMEOUT)
    }
}

impl IdlePolicy {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether a connection idle for `idle_for` should be dropped.
    pub fn is_expired(&self, idle_for: Duration) -> bool {
        idle_for >= self.timeout
    }
}

/// A packet ready to be written to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundPacket {
    pub sequence: u32,
    /// Command on the wire, after version specific substitution.
    pub command: Command,
    pub bytes: Vec<u8>,
}

/// A decoded packet.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    /// Packet fields. The payload is the decrypted body.
    pub frame: Frame,
    pub command: Command,
    /// JSON message, absent for empty bodies and handshake material.
    pub message: Option<DeviceMessage>,
    pub order: SequenceOrder,
}

/// Protocol state for one device.
#[derive(Debug)]
pub struct DeviceSession {
    identity: DeviceIdentity,
    payload: PayloadCodec,
    frames: FrameCodec,
    idle: IdlePolicy,
    next_sequence: Option<u32>,
    outstanding: Option<u32>,
    session_key: Option<LocalKey>,
    nonce_salt: [u8; 4],
    nonce_counter: u64,
}

impl DeviceSession {
    pub fn new(identity: DeviceIdentity) -> Self {
        let payload = PayloadCodec::new(
            identity.device_id.clone(),
            identity.version,
            DeviceType::Default,
        );
        Self {
            identity,
            payload,
            frames: FrameCodec::new(),
            idle: IdlePolicy::default(),
            next_sequence: Some(INITIAL_SEQUENCE),
            outstanding: None,
            session_key: None,
            nonce_salt: random_salt(),
            nonce_counter: 0,
        }
    }

    pub fn with_device_type(mut self, device_type: DeviceType) -> Self {
        self.payload = PayloadCodec::new(
            self.identity.device_id.clone(),
            self.identity.version,
            device_type,
        );
        self
    }

    pub fn with_payload_codec(mut self, payload: PayloadCodec) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_frame_codec(mut self, frames: FrameCodec) -> Self {
        self.frames = frames;
        self
    }

    pub fn with_idle_policy(mut self, idle: IdlePolicy) -> Self {
        self.idle = idle;
        self
    }

    /// Continues a connection at `sequence` instead of starting at 1.
    pub fn with_initial_sequence(mut self, sequence: u32) -> Self {
        self.next_sequence = Some(sequence.max(INITIAL_SEQUENCE));
        self
    }

    /// Fixes the GCM nonce salt and counter. The next sealed packet uses
    /// `salt || counter` as its nonce.
    pub fn with_nonce_seed(mut self, salt: [u8; 4], counter: u64) -> Self {
        self.nonce_salt = salt;
        self.nonce_counter = counter;
        self
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn version(&self) -> Version {
        self.identity.version
    }

    pub fn device_type(&self) -> DeviceType {
        self.payload.device_type()
    }

    pub fn idle_policy(&self) -> IdlePolicy {
        self.idle
    }

    /// Sequence number the next packet will carry, `None` once every
    /// number up to `u32::MAX` has been used.
    pub fn next_sequence(&self) -> Option<u32> {
        self.next_sequence
    }

    /// Sequence number of the request awaiting an answer.
    pub fn outstanding(&self) -> Option<u32> {
        self.outstanding
    }

    /// Switches to a freshly negotiated session key.
    pub fn install_session_key(&mut self, key: LocalKey) {
        tracing::debug!(
            device_id = %self.identity.device_id,
            version = %self.identity.version,
            "installing session key"
        );
        self.session_key = Some(key);
        self.nonce_salt = random_salt();
        self.nonce_counter = 0;
    }

    /// Falls back to the local key, e.g. after the device dropped the session.
    pub fn clear_session_key(&mut self) {
        self.session_key = None;
    }

    pub fn has_session_key(&self) -> bool {
        self.session_key.is_some()
    }

    /// Key currently used for payloads and packet integrity.
    pub fn active_key(&self) -> LocalKey {
        self.session_key.unwrap_or(self.identity.local_key)
    }

    /// Integrity scheme of packets exchanged right now.
    pub fn integrity(&self) -> Integrity {
        Integrity::for_version(self.identity.version, self.active_key())
    }

    /// A stream reader using this session's framing settings.
    pub fn frame_reader(&self) -> FrameReader {
        FrameReader::new(self.frames.clone())
    }

    /// Builds, encrypts and frames `command`.
    ///
    /// `now` is the Unix time in seconds placed in the body's `t` field.
    /// The sequence number is only consumed when a packet is produced.
    /// Numbers are never reused: after `u32::MAX` the session refuses to
    /// encode with [`ProtocolError::SequenceExhausted`].
    pub fn encode(&mut self, command: Command, data: &CommandData, now: u64) -> Result<OutboundPacket> {
        let sequence = self.next_sequence.ok_or(ProtocolError::SequenceExhausted)?;
        let body = self.payload.build(command, data, now)?;
        let payload = self.seal_payload(body.command, &body.body)?;

        let mut frame = Frame::new(sequence, body.command.id(), payload);
        if matches!(self.integrity(), Integrity::Gcm(_)) {
            frame = frame.with_nonce(self.take_nonce());
        }
        let bytes = self.frames.wrap(&frame, &self.integrity())?;

        self.next_sequence = sequence.checked_add(1);
        self.outstanding = Some(sequence);

        tracing::debug!(
            device_id = %self.identity.device_id,
            sequence,
            command = %body.command,
            len = bytes.len(),
            "encoded packet"
        );
        Ok(OutboundPacket {
            sequence,
            command: body.command,
            bytes,
        })
    }

    /// Unframes, decrypts and parses one packet at the start of `bytes`.
    pub fn decode(&mut self, bytes: &[u8]) -> Result<InboundMessage> {
        let (frame, _) = self.frames.unwrap(bytes, &self.integrity())?;
        self.decode_frame(frame)
    }

    /// Decrypts and parses a frame taken from a [`FrameReader`].
    pub fn decode_frame(&mut self, mut frame: Frame) -> Result<InboundMessage> {
        let command = Command::from_id(frame.command)?;
        let body = self.open_payload(&frame.payload)?;
        let message = if body.is_empty() || command.is_handshake() {
            None
        } else {
            Some(parse_device_message(&body)?)
        };
        frame.payload = body;

        let order = self.track_order(frame.sequence);
        tracing::debug!(
            device_id = %self.identity.device_id,
            sequence = frame.sequence,
            command = %command,
            retcode = ?frame.retcode,
            order = ?order,
            "decoded packet"
        );
        Ok(InboundMessage {
            frame,
            command,
            message,
            order,
        })
    }

    fn track_order(&mut self, got: u32) -> SequenceOrder {
        match self.outstanding {
            Some(expected) if expected == got => {
                self.outstanding = None;
                SequenceOrder::InOrder
            }
            Some(expected) if got != 0 => {
                tracing::warn!(
                    device_id = %self.identity.device_id,
                    expected,
                    got,
                    "response out of order"
                );
                SequenceOrder::OutOfOrder { expected, got }
            }
            _ => SequenceOrder::Unsolicited,
        }
    }

    fn take_nonce(&mut self) -> [u8; GCM_NONCE_LENGTH] {
        let mut nonce = [0u8; GCM_NONCE_LENGTH];
        nonce[..4].copy_from_slice(&self.nonce_salt);
        nonce[4..].copy_from_slice(&self.nonce_counter.to_be_bytes());
        self.nonce_counter = self.nonce_counter.wrapping_add(1);
        nonce
    }

    /// Applies the version's payload encryption to a serialized body.
    fn seal_payload(&self, command: Command, body: &[u8]) -> Result<Vec<u8>> {
        let version = self.identity.version;
        let marked = command.has_version_header();
        let cipher = Cipher::from_key(self.active_key());

        let payload = match version.rule().encryption {
            PayloadEncryption::Base64Signed if command == Command::Control => {
                let encoded = cipher.encrypt(body, &CipherOptions::ecb().with_base64(true))?;
                let mut payload = version.as_bytes().to_vec();
                payload.extend_from_slice(self.v31_digest(&encoded).as_bytes());
                payload.extend_from_slice(&encoded);
                payload
            }
            PayloadEncryption::Base64Signed => body.to_vec(),
            PayloadEncryption::EncryptThenMark => {
                let encrypted = cipher.encrypt(body, &CipherOptions::ecb())?;
                if marked {
                    [&version.header()[..], &encrypted[..]].concat()
                } else {
                    encrypted
                }
            }
            PayloadEncryption::MarkThenEncrypt => {
                cipher.encrypt(&self.mark(body, marked), &CipherOptions::ecb())?
            }
            PayloadEncryption::MarkThenSeal => self.mark(body, marked),
        };
        Ok(payload)
    }

    /// Reverses [`seal_payload`](Self::seal_payload) on a received payload.
    fn open_payload(&self, payload: &[u8]) -> Result<Vec<u8>> {
        if payload.is_empty() {
            return Ok(Vec::new());
        }
        let version = self.identity.version;
        let cipher = Cipher::from_key(self.active_key());

        match version.rule().encryption {
            PayloadEncryption::Base64Signed => {
                if payload.starts_with(version.as_bytes()) {
                    let digest_end = version.as_bytes().len() + V31_DIGEST_LEN;
                    let encoded = payload.get(digest_end..).ok_or_else(|| {
                        ProtocolError::MalformedPayload("truncated 3.1 payload".to_string())
                    })?;
                    cipher.decrypt(encoded, &CipherOptions::ecb().with_base64(true))
                } else {
                    Ok(payload.to_vec())
                }
            }
            PayloadEncryption::EncryptThenMark => {
                let encrypted = strip_marker(payload);
                match cipher.decrypt(encrypted, &CipherOptions::ecb()) {
                    Ok(body) => Ok(body),
                    // Some firmware answers queries in plaintext.
                    Err(_) if encrypted.first() == Some(&b'{') => Ok(encrypted.to_vec()),
                    Err(e) => Err(e),
                }
            }
            PayloadEncryption::MarkThenEncrypt => {
                let decrypted = cipher.decrypt(payload, &CipherOptions::ecb())?;
                Ok(strip_marker(&decrypted).to_vec())
            }
            PayloadEncryption::MarkThenSeal => Ok(strip_marker(payload).to_vec()),
        }
    }

    fn mark(&self, body: &[u8], marked: bool) -> Vec<u8> {
        if marked {
            [&self.identity.version.header()[..], body].concat()
        } else {
            body.to_vec()
        }
    }

    /// Middle 16 hex digits of the MD5 tag on 3.1 CONTROL payloads.
    fn v31_digest(&self, encoded: &[u8]) -> String {
        let mut hasher = Md5::new();
        hasher.update(b"data=");
        hasher.update(encoded);
        hasher.update(b"||lpv=");
        hasher.update(self.identity.version.as_bytes());
        hasher.update(b"||");
        hasher.update(self.identity.local_key.as_bytes());
        let digest = hex::encode(hasher.finalize());
        digest[8..8 + V31_DIGEST_LEN].to_string()
    }
}

/// Drops a leading version marker, if there is one.
fn strip_marker(payload: &[u8]) -> &[u8] {
    let marked = payload.len() >= VERSION_HEADER_LEN
        && Version::ALL
            .iter()
            .any(|version| payload.starts_with(version.as_bytes()));
    if marked {
        &payload[VERSION_HEADER_LEN..]
    } else {
        payload
    }
}

fn random_salt() -> [u8; 4] {
    let mut salt = [0u8; 4];
    OsRng.fill_bytes(&mut salt);
    salt
}
