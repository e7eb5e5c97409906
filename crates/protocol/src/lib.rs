//! # tuyawire Protocol Library
//!
//! This crate implements the Tuya local protocol core: turning logical
//! device commands into encrypted, framed packets and back, plus signing
//! of cloud API requests.
//!
//! ## Overview
//!
//! - **Cipher**: AES-128 in ECB (3.1 - 3.4) and GCM (3.5) modes
//! - **Payload Codec**: command specific JSON bodies for every protocol version
//! - **Framing**: `55AA` packets with CRC32 or HMAC-SHA256, `6699` packets sealed with AES-GCM
//! - **Device Session**: sequence numbers, session keys and nonces for one device
//! - **Cloud Signer**: HMAC-SHA256 signatures for cloud API requests
//! - **Color**: hex colour values for bulb data points (`rgb8`, `hsv16`)
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │         Command + CommandData           │
//! ├─────────────────────────────────────────┤
//! │            Payload Codec                │  JSON, version specific envelope
//! ├─────────────────────────────────────────┤
//! │               Cipher                    │  AES-128 ECB / version marker
//! ├─────────────────────────────────────────┤
//! │               Framing                   │  55AA (CRC32/HMAC) or 6699 (GCM)
//! ├─────────────────────────────────────────┤
//! │          Transport (external)           │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use tuyawire_protocol::{
//!     CloudRequest, Command, CommandData, DeviceIdentity, DeviceSession, LocalKey, Version,
//! };
//!
//! // Encode a command for a 3.3 device
//! let identity = DeviceIdentity::new(
//!     "bf0123456789abcdef",
//!     LocalKey::from_material(b"0123456789abcdef"),
//!     Version::V33,
//! );
//! let mut session = DeviceSession::new(identity);
//! let packet = session
//!     .encode(Command::Control, &CommandData::set_value(1, true), 1_700_000_000)
//!     .unwrap();
//! assert_eq!(packet.sequence, 1);
//! assert_eq!(&packet.bytes[..4], &[0x00, 0x00, 0x55, 0xAA]);
//!
//! // Sign a cloud request
//! let request = CloudRequest::builder()
//!     .api_key("test_key_12345")
//!     .api_secret("test_secret_abcde")
//!     .timestamp(1_234_567_890_000)
//!     .method("GET")
//!     .url_path("/v1.0/token")
//!     .build()
//!     .unwrap();
//! assert_eq!(request.sign().unwrap().len(), 64);
//! ```
//!
//! ## Modules
//!
//! - [`cipher`]: AES-128 ECB/GCM encryption and keys
//! - [`command`]: Command table
//! - [`payload`]: Command body construction and parsing
//! - [`framing`]: Packet codec and stream reader
//! - [`session`]: Per-device protocol state
//! - [`cloud`]: Cloud API request signing
//! - [`config`]: TOML configuration
//! - [`version`]: Protocol versions and their framing rules
//! - [`error`]: Error types

pub mod cipher;
pub mod cloud;
pub mod color;
pub mod command;
pub mod config;
pub mod error;
pub mod framing;
pub mod payload;
pub mod session;
pub mod version;

pub use cipher::{Cipher, CipherOptions, LocalKey, Mode, BLOCK_SIZE, KEY_LENGTH};
pub use cloud::{CloudRequest, CloudRequestBuilder};
pub use color::ColorFormat;
pub use command::{Command, CommandFamily};
pub use config::{ConfigError, ProtocolConfig};
pub use error::{ProtocolError, Result};
pub use framing::{
    Frame, FrameCodec, FrameReader, Integrity, RetcodeMode, MAX_PAYLOAD_LEN, PREFIX_55AA,
    PREFIX_6699, SUFFIX_55AA, SUFFIX_6699,
};
pub use payload::{CommandData, DeviceMessage, DeviceType, DpMap, DpValue, PayloadBody, PayloadCodec};
pub use session::{
    DeviceIdentity, DeviceSession, IdlePolicy, InboundMessage, OutboundPacket, SequenceOrder,
};
pub use version::{FramingRule, Version, VERSION_HEADER_LEN};
