//! Packet framing for the local protocol.
//!
//! # Classic packets (3.1 - 3.4)
//!
//! ```text
//! 000055AA | seq u32 | cmd u32 | len u32 | [retcode u32] | payload | checksum | 0000AA55
//! ```
//!
//! `len` counts everything after the header: optional return code, payload,
//! checksum and suffix. The checksum is a CRC32 (4 bytes) up to 3.3 and an
//! HMAC-SHA256 (32 bytes) keyed with the session key on 3.4. Both cover the
//! header and the payload.
//!
//! # Sealed packets (3.5)
//!
//! ```text
//! 00006699 | 0000 | seq u32 | cmd u32 | len u32 | nonce(12) | ciphertext | tag(16) | 00009966
//! ```
//!
//! The payload (with an optional leading return code) is sealed with
//! AES-GCM; the header bytes after the prefix are the associated data.
//!
//! # Stream recovery
//!
//! A wrong prefix or suffix is a [`ProtocolError::Framing`] error. It is the
//! only decode failure that can be handled locally: [`FrameReader`] skips
//! ahead to the next prefix and keeps going. Checksum failures are reported
//! as [`ProtocolError::CorruptPacket`] and always reach the caller.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::cipher::{Cipher, CipherOptions, LocalKey, GCM_NONCE_LENGTH, GCM_TAG_LENGTH};
use crate::error::{ProtocolError, Result};
use crate::version::{Checksum, FrameFormat, Version};

type HmacSha256 = Hmac<Sha256>;

/// Prefix of classic packets.
pub const PREFIX_55AA: u32 = 0x0000_55AA;

/// Suffix of classic packets.
pub const SUFFIX_55AA: u32 = 0x0000_AA55;

/// Prefix of sealed packets.
pub const PREFIX_6699: u32 = 0x0000_6699;

/// Suffix of sealed packets.
pub const SUFFIX_6699: u32 = 0x0000_9966;

/// Classic header: prefix, sequence, command, length.
pub const CLASSIC_HEADER_LEN: usize = 16;

/// Sealed header: prefix, reserved u16, sequence, command, length.
pub const SEALED_HEADER_LEN: usize = 18;

/// Largest payload length a header may claim. Devices never send more.
pub const MAX_PAYLOAD_LEN: usize = 1000;

const SUFFIX_LEN: usize = 4;
const RETCODE_LEN: usize = 4;
const CRC_LEN: usize = 4;
const HMAC_LEN: usize = 32;

/// How the first four payload bytes are treated on decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetcodeMode {
    /// Every packet carries a return code (device responses).
    Present,
    /// No packet carries a return code (packets built by a client).
    Absent,
    /// Treat the first four bytes as a return code when they read as a
    /// small integer.
    #[default]
    Detect,
}

/// Integrity protection of a packet, selected by protocol version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Integrity {
    Crc32,
    HmacSha256(LocalKey),
    Gcm(LocalKey),
}

impl Integrity {
    /// Integrity used by `version` with the currently active `key`.
    pub fn for_version(version: Version, key: LocalKey) -> Self {
        match version.rule().checksum {
            Checksum::Crc32 => Integrity::Crc32,
            Checksum::HmacSha256 => Integrity::HmacSha256(key),
            Checksum::GcmTag => Integrity::Gcm(key),
        }
    }

    /// Packet layout implied by this integrity scheme.
    pub fn format(&self) -> FrameFormat {
        match self {
            Integrity::Gcm(_) => FrameFormat::Sealed,
            _ => FrameFormat::Classic,
        }
    }
}

/// Trailing checksum of a classic packet.
#[derive(Clone, Copy)]
enum ClassicCheck<'a> {
    Crc32,
    Hmac(&'a LocalKey),
}

impl ClassicCheck<'_> {
    fn len(&self) -> usize {
        match self {
            ClassicCheck::Crc32 => CRC_LEN,
            ClassicCheck::Hmac(_) => HMAC_LEN,
        }
    }
}

/// A decoded (or to be encoded) packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub sequence: u32,
    pub command: u32,
    pub retcode: Option<u32>,
    /// Payload bytes: ciphertext for classic packets, plaintext for sealed
    /// packets (the framer seals and opens those itself).
    pub payload: Vec<u8>,
    /// GCM nonce of a sealed packet. Random when `None` on encode.
    pub nonce: Option<[u8; GCM_NONCE_LENGTH]>,
}

impl Frame {
    pub fn new(sequence: u32, command: u32, payload: Vec<u8>) -> Self {
        Self {
            sequence,
            command,
            retcode: None,
            payload,
            nonce: None,
        }
    }

    pub fn with_retcode(mut self, retcode: u32) -> Self {
        self.retcode = Some(retcode);
        self
    }

    pub fn with_nonce(mut self, nonce: [u8; GCM_NONCE_LENGTH]) -> Self {
        self.nonce = Some(nonce);
        self
    }
}

/// Fixed header fields of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub format: FrameFormat,
    pub sequence: u32,
    pub command: u32,
    /// Value of the length field.
    pub length: usize,
    /// Size of the whole packet including prefix and suffix.
    pub total_len: usize,
}

/// Encoder and decoder for packets.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_payload_len: usize,
    retcode: RetcodeMode,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            max_payload_len: MAX_PAYLOAD_LEN,
            retcode: RetcodeMode::Detect,
        }
    }

    pub fn with_retcode(mut self, retcode: RetcodeMode) -> Self {
        self.retcode = retcode;
        self
    }

    pub fn with_max_payload_len(mut self, max_payload_len: usize) -> Self {
        self.max_payload_len = max_payload_len;
        self
    }

    pub fn retcode_mode(&self) -> RetcodeMode {
        self.retcode
    }

    /// Encodes a frame into packet bytes.
    pub fn wrap(&self, frame: &Frame, integrity: &Integrity) -> Result<Vec<u8>> {
        match integrity {
            Integrity::Crc32 => self.wrap_classic(frame, ClassicCheck::Crc32),
            Integrity::HmacSha256(key) => self.wrap_classic(frame, ClassicCheck::Hmac(key)),
            Integrity::Gcm(key) => self.wrap_sealed(frame, key),
        }
    }

    fn wrap_classic(&self, frame: &Frame, check: ClassicCheck<'_>) -> Result<Vec<u8>> {
        let retcode_len = if frame.retcode.is_some() { RETCODE_LEN } else { 0 };
        let length = retcode_len + frame.payload.len() + check.len() + SUFFIX_LEN;
        self.check_length(length)?;

        let mut out = Vec::with_capacity(CLASSIC_HEADER_LEN + length);
        out.extend_from_slice(&PREFIX_55AA.to_be_bytes());
        out.extend_from_slice(&frame.sequence.to_be_bytes());
        out.extend_from_slice(&frame.command.to_be_bytes());
        out.extend_from_slice(&(length as u32).to_be_bytes());
        if let Some(retcode) = frame.retcode {
            out.extend_from_slice(&retcode.to_be_bytes());
        }
        out.extend_from_slice(&frame.payload);

        match check {
            ClassicCheck::Crc32 => {
                let crc = crc32fast::hash(&out);
                out.extend_from_slice(&crc.to_be_bytes());
            }
            ClassicCheck::Hmac(key) => {
                let mac = hmac_sha256(key)?.chain_update(&out).finalize();
                out.extend_from_slice(&mac.into_bytes());
            }
        }
        out.extend_from_slice(&SUFFIX_55AA.to_be_bytes());
        Ok(out)
    }

    fn wrap_sealed(&self, frame: &Frame, key: &LocalKey) -> Result<Vec<u8>> {
        let mut plaintext = Vec::with_capacity(RETCODE_LEN + frame.payload.len());
        if let Some(retcode) = frame.retcode {
            plaintext.extend_from_slice(&retcode.to_be_bytes());
        }
        plaintext.extend_from_slice(&frame.payload);

        let length = GCM_NONCE_LENGTH + plaintext.len() + GCM_TAG_LENGTH;
        self.check_length(length)?;

        let mut out = Vec::with_capacity(SEALED_HEADER_LEN + length + SUFFIX_LEN);
        out.extend_from_slice(&PREFIX_6699.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        out.extend_from_slice(&frame.sequence.to_be_bytes());
        out.extend_from_slice(&frame.command.to_be_bytes());
        out.extend_from_slice(&(length as u32).to_be_bytes());

        let options = CipherOptions::gcm(frame.nonce).with_aad(&out[4..SEALED_HEADER_LEN]);
        let sealed = Cipher::from_key(*key).encrypt(&plaintext, &options)?;
        out.extend_from_slice(&sealed);
        out.extend_from_slice(&SUFFIX_6699.to_be_bytes());
        Ok(out)
    }

    /// Reads the fixed header at the start of `data`.
    pub fn parse_header(&self, data: &[u8]) -> Result<PacketHeader> {
        let prefix = read_u32(data, 0)?;
        let (format, header_len) = match prefix {
            PREFIX_55AA => (FrameFormat::Classic, CLASSIC_HEADER_LEN),
            PREFIX_6699 => (FrameFormat::Sealed, SEALED_HEADER_LEN),
            got => {
                return Err(ProtocolError::Framing {
                    expected: PREFIX_55AA,
                    got,
                })
            }
        };
        if data.len() < header_len {
            return Err(ProtocolError::Incomplete {
                needed: header_len,
                have: data.len(),
            });
        }

        let (sequence, command, length, total_len) = match format {
            FrameFormat::Classic => {
                let length = read_u32(data, 12)? as usize;
                (read_u32(data, 4)?, read_u32(data, 8)?, length, header_len + length)
            }
            FrameFormat::Sealed => {
                let length = read_u32(data, 14)? as usize;
                (
                    read_u32(data, 6)?,
                    read_u32(data, 10)?,
                    length,
                    header_len + length + SUFFIX_LEN,
                )
            }
        };

        if length > self.max_payload_len {
            return Err(ProtocolError::FrameTooLarge {
                size: length,
                max: self.max_payload_len,
            });
        }

        Ok(PacketHeader {
            format,
            sequence,
            command,
            length,
            total_len,
        })
    }

    /// Decodes one packet from the start of `data`.
    ///
    /// Returns the frame and the number of bytes consumed.
    ///
    /// A damaged length field shows up as [`ProtocolError::Framing`] (the
    /// suffix is not where the length says), [`ProtocolError::Incomplete`]
    /// (the length points past the buffer) or `FrameTooLarge`, and as
    /// `CorruptPacket` when it leaves no room for the checksum. When the bytes already hold the
    /// end of this packet followed by the start of the next one, an inflated
    /// length is reported as `Framing` instead of waiting for bytes that
    /// belong to the next packet.
    pub fn unwrap(&self, data: &[u8], integrity: &Integrity) -> Result<(Frame, usize)> {
        let header = self.parse_header(data)?;
        if header.format != integrity.format() {
            let (expected, got) = match integrity.format() {
                FrameFormat::Classic => (PREFIX_55AA, PREFIX_6699),
                FrameFormat::Sealed => (PREFIX_6699, PREFIX_55AA),
            };
            return Err(ProtocolError::Framing { expected, got });
        }
        if data.len() < header.total_len {
            let (suffix, prefix) = boundary_markers(header.format);
            if contains_boundary(data, header.format) {
                return Err(ProtocolError::Framing {
                    expected: suffix,
                    got: prefix,
                });
            }
            return Err(ProtocolError::Incomplete {
                needed: header.total_len,
                have: data.len(),
            });
        }
        let packet = &data[..header.total_len];

        let expected_suffix = match header.format {
            FrameFormat::Classic => SUFFIX_55AA,
            FrameFormat::Sealed => SUFFIX_6699,
        };
        let suffix = read_u32(packet, header.total_len - SUFFIX_LEN)?;
        if suffix != expected_suffix {
            return Err(ProtocolError::Framing {
                expected: expected_suffix,
                got: suffix,
            });
        }

        let (body, nonce) = match integrity {
            Integrity::Crc32 => (self.verify_classic(packet, ClassicCheck::Crc32)?, None),
            Integrity::HmacSha256(key) => {
                (self.verify_classic(packet, ClassicCheck::Hmac(key))?, None)
            }
            Integrity::Gcm(key) => {
                let (body, nonce) = self.open_sealed(packet, &header, key)?;
                (body, Some(nonce))
            }
        };
        let (retcode, payload) = self.split_retcode(body)?;

        tracing::debug!(
            sequence = header.sequence,
            command = header.command,
            payload_len = payload.len(),
            retcode = ?retcode,
            "unwrapped packet"
        );

        let frame = Frame {
            sequence: header.sequence,
            command: header.command,
            retcode,
            payload,
            nonce,
        };
        Ok((frame, header.total_len))
    }

    /// Like [`unwrap`](Self::unwrap), but returns `None` while more bytes
    /// are needed.
    pub fn try_unwrap(&self, data: &[u8], integrity: &Integrity) -> Result<Option<(Frame, usize)>> {
        match self.unwrap(data, integrity) {
            Ok(decoded) => Ok(Some(decoded)),
            Err(ProtocolError::Incomplete { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Verifies the checksum and returns the bytes between header and checksum.
    fn verify_classic(&self, packet: &[u8], check: ClassicCheck<'_>) -> Result<Vec<u8>> {
        let trailer = check.len() + SUFFIX_LEN;
        if packet.len() < CLASSIC_HEADER_LEN + trailer {
            return Err(ProtocolError::CorruptPacket(format!(
                "length field too small for a {} byte checksum",
                check.len()
            )));
        }
        let covered_end = packet.len() - trailer;
        let covered = &packet[..covered_end];
        let checksum = &packet[covered_end..packet.len() - SUFFIX_LEN];

        match check {
            ClassicCheck::Crc32 => {
                let expected = crc32fast::hash(covered);
                let got = read_u32(checksum, 0)?;
                if expected != got {
                    return Err(ProtocolError::CorruptPacket(format!(
                        "CRC mismatch: computed {:#010x}, packet has {:#010x}",
                        expected, got
                    )));
                }
            }
            ClassicCheck::Hmac(key) => {
                hmac_sha256(key)?
                    .chain_update(covered)
                    .verify_slice(checksum)
                    .map_err(|_| ProtocolError::CorruptPacket("HMAC mismatch".to_string()))?;
            }
        }

        Ok(covered[CLASSIC_HEADER_LEN..].to_vec())
    }

    fn open_sealed(
        &self,
        packet: &[u8],
        header: &PacketHeader,
        key: &LocalKey,
    ) -> Result<(Vec<u8>, [u8; GCM_NONCE_LENGTH])> {
        if header.length < GCM_NONCE_LENGTH + GCM_TAG_LENGTH {
            return Err(ProtocolError::CorruptPacket(format!(
                "sealed length {} shorter than nonce and tag",
                header.length
            )));
        }
        let sealed = &packet[SEALED_HEADER_LEN..SEALED_HEADER_LEN + header.length];
        let mut nonce = [0u8; GCM_NONCE_LENGTH];
        nonce.copy_from_slice(&sealed[..GCM_NONCE_LENGTH]);

        let options = CipherOptions::gcm(None).with_aad(&packet[4..SEALED_HEADER_LEN]);
        let body = Cipher::from_key(*key)
            .decrypt(sealed, &options)
            .map_err(|e| match e {
                ProtocolError::Authentication(reason) => {
                    ProtocolError::CorruptPacket(format!("GCM {}", reason))
                }
                other => other,
            })?;
        Ok((body, nonce))
    }

    fn split_retcode(&self, body: Vec<u8>) -> Result<(Option<u32>, Vec<u8>)> {
        let has_retcode = match self.retcode {
            RetcodeMode::Absent => false,
            RetcodeMode::Present => {
                if body.len() < RETCODE_LEN {
                    return Err(ProtocolError::CorruptPacket(
                        "packet too short for a return code".to_string(),
                    ));
                }
                true
            }
            RetcodeMode::Detect => body.len() >= RETCODE_LEN && body[..3] == [0, 0, 0],
        };

        if has_retcode {
            let retcode = read_u32(&body, 0)?;
            Ok((Some(retcode), body[RETCODE_LEN..].to_vec()))
        } else {
            Ok((None, body))
        }
    }

    fn check_length(&self, length: usize) -> Result<()> {
        if length > self.max_payload_len {
            return Err(ProtocolError::FrameTooLarge {
                size: length,
                max: self.max_payload_len,
            });
        }
        Ok(())
    }
}

/// Position of the first packet prefix in `data`.
pub fn find_prefix(data: &[u8]) -> Option<usize> {
    const PREFIXES: [[u8; 4]; 2] = [PREFIX_55AA.to_be_bytes(), PREFIX_6699.to_be_bytes()];
    data.windows(4)
        .position(|window| PREFIXES.iter().any(|prefix| window == prefix))
}

fn boundary_markers(format: FrameFormat) -> (u32, u32) {
    match format {
        FrameFormat::Classic => (SUFFIX_55AA, PREFIX_55AA),
        FrameFormat::Sealed => (SUFFIX_6699, PREFIX_6699),
    }
}

/// Whether `data` holds a suffix immediately followed by a prefix, i.e. one
/// packet ends and the next begins.
fn contains_boundary(data: &[u8], format: FrameFormat) -> bool {
    let (suffix, prefix) = boundary_markers(format);
    let mut marker = [0u8; 8];
    marker[..4].copy_from_slice(&suffix.to_be_bytes());
    marker[4..].copy_from_slice(&prefix.to_be_bytes());
    data.get(4..)
        .map_or(false, |rest| rest.windows(marker.len()).any(|window| window == marker))
}

/// Incremental packet reader over a byte stream.
///
/// Bytes are pushed as they arrive from the transport. Garbage between
/// packets and packets with a broken prefix or suffix are skipped; every
/// other decode error is returned after the offending packet has been
/// consumed, so the next call continues with the following packet.
#[derive(Debug)]
pub struct FrameReader {
    codec: FrameCodec,
    buffer: Vec<u8>,
    discarded: u64,
}

impl FrameReader {
    pub fn new(codec: FrameCodec) -> Self {
        Self {
            codec,
            buffer: Vec::new(),
            discarded: 0,
        }
    }

    /// Appends received bytes.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Bytes waiting for more data.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Total bytes skipped while resynchronizing.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Returns the next complete packet, or `None` if more bytes are needed.
    pub fn next_frame(&mut self, integrity: &Integrity) -> Result<Option<Frame>> {
        loop {
            match find_prefix(&self.buffer) {
                Some(0) => {}
                Some(offset) => self.discard(offset),
                None => {
                    // Keep a possible partial prefix at the end.
                    let keep = self.buffer.len().min(3);
                    self.discard(self.buffer.len() - keep);
                    return Ok(None);
                }
            }

            match self.codec.try_unwrap(&self.buffer, integrity) {
                Ok(Some((frame, consumed))) => {
                    self.buffer.drain(..consumed);
                    return Ok(Some(frame));
                }
                Ok(None) => return Ok(None),
                Err(e @ (ProtocolError::Framing { .. } | ProtocolError::FrameTooLarge { .. })) => {
                    tracing::warn!(error = %e, "resynchronizing packet stream");
                    self.discard(1);
                }
                Err(e) => {
                    let skip = self
                        .codec
                        .parse_header(&self.buffer)
                        .map(|header| header.total_len)
                        .unwrap_or(1)
                        .min(self.buffer.len());
                    self.buffer.drain(..skip);
                    return Err(e);
                }
            }
        }
    }

    fn discard(&mut self, count: usize) {
        if count == 0 {
            return;
        }
        tracing::warn!(bytes = count, "discarding bytes before packet prefix");
        self.buffer.drain(..count);
        self.discarded += count as u64;
    }
}

fn hmac_sha256(key: &LocalKey) -> Result<HmacSha256> {
    HmacSha256::new_from_slice(key.as_bytes()).map_err(|_| ProtocolError::InvalidKeyLength {
        expected: HMAC_LEN,
        got: key.as_bytes().len(),
    })
}

fn read_u32(data: &[u8], offset: usize) -> Result<u32> {
    data.get(offset..offset + 4)
        .and_then(|bytes| bytes.try_into().ok())
        .map(u32::from_be_bytes)
        .ok_or(ProtocolError::Incomplete {
            needed: offset + 4,
            have: data.len(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> LocalKey {
        LocalKey::from_material(b"0123456789abcdef")
    }

    fn all_integrities() -> [Integrity; 3] {
        [
            Integrity::Crc32,
            Integrity::HmacSha256(key()),
            Integrity::Gcm(key()),
        ]
    }

    #[test]
    fn test_classic_header_format() {
        let codec = FrameCodec::new().with_retcode(RetcodeMode::Absent);
        let frame = Frame::new(1, 7, vec![0xDE, 0xAD, 0xBE, 0xEF]);
        let encoded = codec.wrap(&frame, &Integrity::Crc32).unwrap();

        assert_eq!(&encoded[0..4], &[0x00, 0x00, 0x55, 0xAA]);
        assert_eq!(&encoded[4..8], &1u32.to_be_bytes());
        assert_eq!(&encoded[8..12], &7u32.to_be_bytes());
        // payload + crc + suffix
        assert_eq!(&encoded[12..16], &12u32.to_be_bytes());
        assert_eq!(&encoded[16..20], &[0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(&encoded[encoded.len() - 4..], &[0x00, 0x00, 0xAA, 0x55]);
        assert_eq!(encoded.len(), 28);
    }

    #[test]
    fn test_sealed_header_format() {
        let codec = FrameCodec::new();
        let frame = Frame::new(4, 13, b"{}".to_vec()).with_nonce([0u8; 12]);
        let encoded = codec.wrap(&frame, &Integrity::Gcm(key())).unwrap();

        assert_eq!(&encoded[0..4], &[0x00, 0x00, 0x66, 0x99]);
        assert_eq!(&encoded[4..6], &[0, 0]);
        assert_eq!(&encoded[6..10], &4u32.to_be_bytes());
        assert_eq!(&encoded[10..14], &13u32.to_be_bytes());
        assert_eq!(&encoded[14..18], &(12u32 + 2 + 16).to_be_bytes());
        assert_eq!(&encoded[18..30], &[0u8; 12]);
        assert_eq!(&encoded[encoded.len() - 4..], &[0x00, 0x00, 0x99, 0x66]);
    }

    #[test]
    fn test_wrap_unwrap_each_integrity() {
        let codec = FrameCodec::new().with_retcode(RetcodeMode::Absent);
        for integrity in all_integrities() {
            let frame = Frame::new(42, 8, b"3.3 and then some bytes".to_vec());
            let encoded = codec.wrap(&frame, &integrity).unwrap();
            let (decoded, consumed) = codec.unwrap(&encoded, &integrity).unwrap();

            assert_eq!(consumed, encoded.len());
            assert_eq!(decoded.sequence, 42);
            assert_eq!(decoded.command, 8);
            assert_eq!(decoded.payload, frame.payload);
            assert_eq!(decoded.retcode, None);
        }
    }

    #[test]
    fn test_retcode_roundtrip() {
        let codec = FrameCodec::new().with_retcode(RetcodeMode::Present);
        for integrity in all_integrities() {
            let frame = Frame::new(3, 10, b"{\"dps\":{}}".to_vec()).with_retcode(0);
            let encoded = codec.wrap(&frame, &integrity).unwrap();
            let (decoded, _) = codec.unwrap(&encoded, &integrity).unwrap();
            assert_eq!(decoded.retcode, Some(0));
            assert_eq!(decoded.payload, frame.payload);
        }
    }

    #[test]
    fn test_retcode_detection() {
        let codec = FrameCodec::new();
        let with = Frame::new(1, 8, b"{}".to_vec()).with_retcode(1);
        let without = Frame::new(1, 8, b"3.3xxxxxxxxxxxx".to_vec());

        let (decoded, _) = codec
            .unwrap(&codec.wrap(&with, &Integrity::Crc32).unwrap(), &Integrity::Crc32)
            .unwrap();
        assert_eq!(decoded.retcode, Some(1));
        assert_eq!(decoded.payload, b"{}");

        let (decoded, _) = codec
            .unwrap(&codec.wrap(&without, &Integrity::Crc32).unwrap(), &Integrity::Crc32)
            .unwrap();
        assert_eq!(decoded.retcode, None);
    }

    #[test]
    fn test_crc_mismatch_is_corrupt() {
        let codec = FrameCodec::new();
        let mut encoded = codec
            .wrap(&Frame::new(1, 9, vec![1, 2, 3, 4]), &Integrity::Crc32)
            .unwrap();
        encoded[17] ^= 0x01;
        let err = codec.unwrap(&encoded, &Integrity::Crc32).unwrap_err();
        assert!(matches!(err, ProtocolError::CorruptPacket(_)));
    }

    #[test]
    fn test_hmac_with_wrong_key_is_corrupt() {
        let codec = FrameCodec::new();
        let encoded = codec
            .wrap(&Frame::new(1, 9, vec![1, 2, 3]), &Integrity::HmacSha256(key()))
            .unwrap();
        let other = Integrity::HmacSha256(LocalKey::from_material(b"another key"));
        let err = codec.unwrap(&encoded, &other).unwrap_err();
        assert!(matches!(err, ProtocolError::CorruptPacket(_)));
    }

    #[test]
    fn test_bad_prefix_is_framing_error() {
        let codec = FrameCodec::new();
        let mut encoded = codec
            .wrap(&Frame::new(1, 9, vec![1]), &Integrity::Crc32)
            .unwrap();
        encoded[2] = 0x12;
        let err = codec.unwrap(&encoded, &Integrity::Crc32).unwrap_err();
        assert!(matches!(err, ProtocolError::Framing { .. }));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_bad_suffix_is_framing_error() {
        let codec = FrameCodec::new();
        let mut encoded = codec
            .wrap(&Frame::new(1, 9, vec![1]), &Integrity::Crc32)
            .unwrap();
        let last = encoded.len() - 1;
        encoded[last] = 0x00;
        let err = codec.unwrap(&encoded, &Integrity::Crc32).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::Framing {
                expected: SUFFIX_55AA,
                ..
            }
        ));
    }

    #[test]
    fn test_format_mismatch_is_framing_error() {
        let codec = FrameCodec::new();
        let encoded = codec
            .wrap(&Frame::new(1, 9, vec![1]), &Integrity::Crc32)
            .unwrap();
        let err = codec.unwrap(&encoded, &Integrity::Gcm(key())).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::Framing {
                expected: PREFIX_6699,
                got: PREFIX_55AA
            }
        ));
    }

    #[test]
    fn test_oversized_header_rejected() {
        let codec = FrameCodec::new();
        let mut data = Vec::new();
        data.extend_from_slice(&PREFIX_55AA.to_be_bytes());
        data.extend_from_slice(&1u32.to_be_bytes());
        data.extend_from_slice(&7u32.to_be_bytes());
        data.extend_from_slice(&5000u32.to_be_bytes());
        let err = codec.parse_header(&data).unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { size: 5000, .. }));
    }

    #[test]
    fn test_oversized_payload_not_wrapped() {
        let codec = FrameCodec::new().with_max_payload_len(64);
        let err = codec
            .wrap(&Frame::new(1, 7, vec![0u8; 100]), &Integrity::Crc32)
            .unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { .. }));
    }

    #[test]
    fn test_try_unwrap_partial_data() {
        let codec = FrameCodec::new();
        for integrity in all_integrities() {
            let encoded = codec
                .wrap(&Frame::new(5, 9, vec![9; 20]), &integrity)
                .unwrap();
            for i in 0..encoded.len() {
                assert!(
                    codec.try_unwrap(&encoded[..i], &integrity).unwrap().is_none(),
                    "should need more data at len={}",
                    i
                );
            }
            assert!(codec.try_unwrap(&encoded, &integrity).unwrap().is_some());
        }
    }

    #[test]
    fn test_find_prefix() {
        assert_eq!(find_prefix(&[1, 2, 0, 0, 0x55, 0xAA, 9]), Some(2));
        assert_eq!(find_prefix(&[0, 0, 0x66, 0x99]), Some(0));
        assert_eq!(find_prefix(&[0, 0, 0x55]), None);
    }

    #[test]
    fn test_reader_skips_garbage() {
        let codec = FrameCodec::new().with_retcode(RetcodeMode::Absent);
        let first = codec.wrap(&Frame::new(1, 9, vec![1]), &Integrity::Crc32).unwrap();
        let second = codec.wrap(&Frame::new(2, 9, vec![2]), &Integrity::Crc32).unwrap();

        let mut stream = vec![0xFF, 0x00, 0x13];
        stream.extend_from_slice(&first);
        stream.extend_from_slice(&[0x42; 5]);
        stream.extend_from_slice(&second);

        let mut reader = FrameReader::new(codec);
        reader.push(&stream);
        assert_eq!(reader.next_frame(&Integrity::Crc32).unwrap().unwrap().sequence, 1);
        assert_eq!(reader.next_frame(&Integrity::Crc32).unwrap().unwrap().sequence, 2);
        assert!(reader.next_frame(&Integrity::Crc32).unwrap().is_none());
        assert_eq!(reader.discarded(), 8);
        assert_eq!(reader.buffered(), 0);
    }

    #[test]
    fn test_reader_recovers_from_broken_suffix() {
        let codec = FrameCodec::new().with_retcode(RetcodeMode::Absent);
        let mut broken = codec.wrap(&Frame::new(1, 9, vec![1]), &Integrity::Crc32).unwrap();
        let last = broken.len() - 1;
        broken[last] = 0;
        let good = codec.wrap(&Frame::new(2, 9, vec![2]), &Integrity::Crc32).unwrap();

        let mut reader = FrameReader::new(codec);
        reader.push(&broken);
        reader.push(&good);
        let frame = reader.next_frame(&Integrity::Crc32).unwrap().unwrap();
        assert_eq!(frame.sequence, 2);
        assert_eq!(reader.discarded() as usize, broken.len());
    }

    #[test]
    fn test_reader_reports_corruption_and_continues() {
        let codec = FrameCodec::new().with_retcode(RetcodeMode::Absent);
        let mut corrupt = codec.wrap(&Frame::new(1, 9, vec![1, 2]), &Integrity::Crc32).unwrap();
        corrupt[16] ^= 0xFF;
        let good = codec.wrap(&Frame::new(2, 9, vec![3]), &Integrity::Crc32).unwrap();

        let mut reader = FrameReader::new(codec);
        reader.push(&corrupt);
        reader.push(&good);
        assert!(matches!(
            reader.next_frame(&Integrity::Crc32),
            Err(ProtocolError::CorruptPacket(_))
        ));
        assert_eq!(reader.next_frame(&Integrity::Crc32).unwrap().unwrap().sequence, 2);
    }

    #[test]
    fn test_damaged_length_field() {
        let codec = FrameCodec::new().with_retcode(RetcodeMode::Absent);
        let packet = codec.wrap(&Frame::new(1, 9, vec![1, 2, 3, 4]), &Integrity::Crc32).unwrap();
        let good = codec.wrap(&Frame::new(2, 9, vec![5]), &Integrity::Crc32).unwrap();
        assert_eq!(packet.len(), 28);

        // On its own an inflated packet just looks unfinished.
        let mut inflated = packet.clone();
        inflated[15] ^= 0x01;
        assert!(matches!(
            codec.unwrap(&inflated, &Integrity::Crc32),
            Err(ProtocolError::Incomplete { needed: 29, have: 28 })
        ));

        let mut far = packet.clone();
        far[14] ^= 0x01;
        assert!(matches!(
            codec.unwrap(&far, &Integrity::Crc32),
            Err(ProtocolError::Incomplete { needed: 284, have: 28 })
        ));

        // Followed by the next packet, the boundary gives it away.
        far.extend_from_slice(&good);
        assert!(matches!(
            codec.unwrap(&far, &Integrity::Crc32),
            Err(ProtocolError::Framing { expected: SUFFIX_55AA, got: PREFIX_55AA })
        ));

        // Shrunk: the suffix is not where the length says.
        let mut shrunk = packet.clone();
        shrunk[15] ^= 0x04;
        assert!(matches!(
            codec.unwrap(&shrunk, &Integrity::Crc32),
            Err(ProtocolError::Framing { .. })
        ));
    }

    #[test]
    fn test_reader_recovers_from_damaged_length() {
        let codec = FrameCodec::new().with_retcode(RetcodeMode::Absent);
        let good = codec.wrap(&Frame::new(2, 9, vec![5]), &Integrity::Crc32).unwrap();

        for (byte, flip) in [(15, 0x01), (14, 0x01), (15, 0x04)] {
            let mut damaged = codec
                .wrap(&Frame::new(1, 9, vec![1, 2, 3, 4]), &Integrity::Crc32)
                .unwrap();
            damaged[byte] ^= flip;

            let mut reader = FrameReader::new(codec.clone());
            reader.push(&damaged);
            reader.push(&good);
            let frame = reader.next_frame(&Integrity::Crc32).unwrap().unwrap();
            assert_eq!(frame.sequence, 2, "byte {} flip {:#04x}", byte, flip);
            assert_eq!(reader.buffered(), 0);
        }
    }

    #[test]
    fn test_reader_waits_for_split_packet() {
        let codec = FrameCodec::new();
        let encoded = codec.wrap(&Frame::new(7, 9, vec![5; 10]), &Integrity::Crc32).unwrap();
        let (head, tail) = encoded.split_at(10);

        let mut reader = FrameReader::new(codec);
        reader.push(head);
        assert!(reader.next_frame(&Integrity::Crc32).unwrap().is_none());
        reader.push(tail);
        assert_eq!(reader.next_frame(&Integrity::Crc32).unwrap().unwrap().sequence, 7);
        assert_eq!(reader.discarded(), 0);
    }
}
