//! Protocol versions and their framing rules.
//!
//! Every supported version maps to exactly one [`FramingRule`] in a static
//! table. The rule decides which packet layout is used, how the payload is
//! encrypted, where the 15-byte version marker goes and which checksum
//! closes the packet.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{ProtocolError, Result};

/// Length of the version marker: 3 ASCII bytes followed by 12 zero bytes.
pub const VERSION_HEADER_LEN: usize = 15;

/// Tolerance when matching a numeric version against the supported set.
const VERSION_EPSILON: f64 = 1e-6;

/// Local protocol version spoken by a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Version {
    /// 3.1: plaintext queries, base64 control payloads with an MD5 tag.
    V31,
    /// 3.2: like 3.3.
    V32,
    /// 3.3: ECB for every payload, CRC32 checksum.
    V33,
    /// 3.4: session key, ECB, HMAC-SHA256 checksum.
    V34,
    /// 3.5: session key, AES-GCM, 6699 packets.
    V35,
}

/// Packet layout on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFormat {
    /// `000055AA` ... `0000AA55`
    Classic,
    /// `00006699` ... `00009966`, AES-GCM sealed.
    Sealed,
}

/// Integrity check closing a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Checksum {
    /// CRC32 over header and payload (4 bytes).
    Crc32,
    /// HMAC-SHA256 keyed with the session key (32 bytes).
    HmacSha256,
    /// AES-GCM tag (16 bytes) with the header as associated data.
    GcmTag,
}

/// How the JSON body becomes the packet payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadEncryption {
    /// Only CONTROL is encrypted (ECB + base64) and tagged with an MD5 digest.
    Base64Signed,
    /// ECB encrypt, then prepend the version marker.
    EncryptThenMark,
    /// Prepend the version marker, then ECB encrypt.
    MarkThenEncrypt,
    /// Prepend the version marker; the framer seals with AES-GCM.
    MarkThenSeal,
}

/// Shape of the JSON envelope around data points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadLayout {
    /// `devId`/`uid`/`t` fields with a top level `dps` object.
    Legacy,
    /// `protocol: 5` with `data.dps` and an integer timestamp.
    Nested,
}

/// Version dependent framing rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramingRule {
    pub version: Version,
    pub format: FrameFormat,
    pub checksum: Checksum,
    pub encryption: PayloadEncryption,
    pub layout: PayloadLayout,
    /// Whether the version negotiates a session key before use.
    pub negotiated: bool,
}

static FRAMING_RULES: [FramingRule; 5] = [
    FramingRule {
        version: Version::V31,
        format: FrameFormat::Classic,
        checksum: Checksum::Crc32,
        encryption: PayloadEncryption::Base64Signed,
        layout: PayloadLayout::Legacy,
        negotiated: false,
    },
    FramingRule {
        version: Version::V32,
        format: FrameFormat::Classic,
        checksum: Checksum::Crc32,
        encryption: PayloadEncryption::EncryptThenMark,
        layout: PayloadLayout::Legacy,
        negotiated: false,
    },
    FramingRule {
        version: Version::V33,
        format: FrameFormat::Classic,
        checksum: Checksum::Crc32,
        encryption: PayloadEncryption::EncryptThenMark,
        layout: PayloadLayout::Legacy,
        negotiated: false,
    },
    FramingRule {
        version: Version::V34,
        format: FrameFormat::Classic,
        checksum: Checksum::HmacSha256,
        encryption: PayloadEncryption::MarkThenEncrypt,
        layout: PayloadLayout::Nested,
        negotiated: true,
    },
    FramingRule {
        version: Version::V35,
        format: FrameFormat::Sealed,
        checksum: Checksum::GcmTag,
        encryption: PayloadEncryption::MarkThenSeal,
        layout: PayloadLayout::Nested,
        negotiated: true,
    },
];

impl Version {
    /// All supported versions, oldest first.
    pub const ALL: [Version; 5] = [
        Version::V31,
        Version::V32,
        Version::V33,
        Version::V34,
        Version::V35,
    ];

    /// The version as it appears on the wire, e.g. `"3.3"`.
    pub fn as_str(self) -> &'static str {
        match self {
            Version::V31 => "3.1",
            Version::V32 => "3.2",
            Version::V33 => "3.3",
            Version::V34 => "3.4",
            Version::V35 => "3.5",
        }
    }

    /// The three ASCII bytes of the version.
    pub fn as_bytes(self) -> &'static [u8] {
        self.as_str().as_bytes()
    }

    /// The 15-byte version marker (`"3.x"` followed by 12 zero bytes).
    pub fn header(self) -> [u8; VERSION_HEADER_LEN] {
        let mut header = [0u8; VERSION_HEADER_LEN];
        header[..3].copy_from_slice(self.as_bytes());
        header
    }

    /// Framing rule for this version.
    pub fn rule(self) -> &'static FramingRule {
        // The table is ordered like `Version::ALL`.
        &FRAMING_RULES[self as usize]
    }

    /// Whether the version runs on a negotiated session key.
    pub fn is_negotiated(self) -> bool {
        self.rule().negotiated
    }

    /// The version as a number, e.g. `3.3`.
    pub fn as_number(self) -> f64 {
        match self {
            Version::V31 => 3.1,
            Version::V32 => 3.2,
            Version::V33 => 3.3,
            Version::V34 => 3.4,
            Version::V35 => 3.5,
        }
    }

    /// Parses a numeric version such as `3.3`.
    ///
    /// Only the five exact values are accepted; `3.34` is not `3.3`.
    pub fn from_number(value: f64) -> Result<Self> {
        Version::ALL
            .into_iter()
            .find(|version| (version.as_number() - value).abs() < VERSION_EPSILON)
            .ok_or_else(|| ProtocolError::UnsupportedVersion(value.to_string()))
    }
}

impl FromStr for Version {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "3.1" => Ok(Version::V31),
            "3.2" => Ok(Version::V32),
            "3.3" => Ok(Version::V33),
            "3.4" => Ok(Version::V34),
            "3.5" => Ok(Version::V35),
            other => Err(ProtocolError::UnsupportedVersion(other.to_string())),
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        // Device inventories write the version both as "3.3" and 3.3.
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(f64),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
            Raw::Number(n) => Version::from_number(n).map_err(serde::de::Error::custom),
        }
    }
}
