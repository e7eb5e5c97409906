//! Command ids of the local protocol.
//!
//! The id-to-command mapping is a closed static table. Ids outside of it
//! are rejected with [`ProtocolError::UnknownCommand`].

use std::fmt;

use crate::error::{ProtocolError, Result};

/// Logical operation carried by a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Command {
    /// Session key negotiation, client nonce.
    SessKeyNegStart = 0x03,
    /// Session key negotiation, device nonce and HMAC.
    SessKeyNegResp = 0x04,
    /// Session key negotiation, client HMAC.
    SessKeyNegFinish = 0x05,
    /// Set data points.
    Control = 0x07,
    /// Status push or query.
    Status = 0x08,
    /// Keepalive.
    HeartBeat = 0x09,
    /// Query data points.
    DpQuery = 0x0a,
    /// Set data points (3.4+ and device22).
    ControlNew = 0x0d,
    /// Query data points (3.4+).
    DpQueryNew = 0x10,
    /// Ask the device to refresh the listed data points.
    UpdateDps = 0x12,
    /// Gateway extension stream (sub-device discovery and control).
    LanExtStream = 0x40,
}

/// Wire shape of the data carried by a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandFamily {
    /// Binary handshake material, never JSON.
    Handshake,
    /// Data point map (`dps`).
    Control,
    /// Query that may carry a data point map.
    Query,
    /// Keepalive, no data.
    Empty,
    /// Ordered list of data point indices (`dpId`).
    IndexList,
}

struct CommandEntry {
    command: Command,
    name: &'static str,
    family: CommandFamily,
    /// Whether the payload carries the 15-byte version marker.
    version_header: bool,
}

static COMMAND_TABLE: [CommandEntry; 11] = [
    CommandEntry {
        command: Command::SessKeyNegStart,
        name: "SESS_KEY_NEG_START",
        family: CommandFamily::Handshake,
        version_header: false,
    },
    CommandEntry {
        command: Command::SessKeyNegResp,
        name: "SESS_KEY_NEG_RESP",
        family: CommandFamily::Handshake,
        version_header: false,
    },
    CommandEntry {
        command: Command::SessKeyNegFinish,
        name: "SESS_KEY_NEG_FINISH",
        family: CommandFamily::Handshake,
        version_header: false,
    },
    CommandEntry {
        command: Command::Control,
        name: "CONTROL",
        family: CommandFamily::Control,
        version_header: true,
    },
    CommandEntry {
        command: Command::Status,
        name: "STATUS",
        family: CommandFamily::Query,
        version_header: true,
    },
    CommandEntry {
        command: Command::HeartBeat,
        name: "HEART_BEAT",
        family: CommandFamily::Empty,
        version_header: false,
    },
    CommandEntry {
        command: Command::DpQuery,
        name: "DP_QUERY",
        family: CommandFamily::Query,
        version_header: false,
    },
    CommandEntry {
        command: Command::ControlNew,
        name: "CONTROL_NEW",
        family: CommandFamily::Control,
        version_header: true,
    },
    CommandEntry {
        command: Command::DpQueryNew,
        name: "DP_QUERY_NEW",
        family: CommandFamily::Query,
        version_header: false,
    },
    CommandEntry {
        command: Command::UpdateDps,
        name: "UPDATEDPS",
        family: CommandFamily::IndexList,
        version_header: false,
    },
    CommandEntry {
        command: Command::LanExtStream,
        name: "LAN_EXT_STREAM",
        family: CommandFamily::Control,
        version_header: false,
    },
];

impl Command {
    /// Looks a command up by its wire id.
    pub fn from_id(id: u32) -> Result<Self> {
        COMMAND_TABLE
            .iter()
            .find(|entry| entry.command as u32 == id)
            .map(|entry| entry.command)
            .ok_or(ProtocolError::UnknownCommand(id))
    }

    /// The wire id.
    pub fn id(self) -> u32 {
        self as u32
    }

    /// The protocol name, e.g. `DP_QUERY`.
    pub fn name(self) -> &'static str {
        self.entry().name
    }

    pub fn family(self) -> CommandFamily {
        self.entry().family
    }

    /// Whether payloads of this command carry the version marker.
    pub fn has_version_header(self) -> bool {
        self.entry().version_header
    }

    /// Whether the command only appears during session key negotiation.
    pub fn is_handshake(self) -> bool {
        self.family() == CommandFamily::Handshake
    }

    fn entry(self) -> &'static CommandEntry {
        let index = match self {
            Command::SessKeyNegStart => 0,
            Command::SessKeyNegResp => 1,
            Command::SessKeyNegFinish => 2,
            Command::Control => 3,
            Command::Status => 4,
            Command::HeartBeat => 5,
            Command::DpQuery => 6,
            Command::ControlNew => 7,
            Command::DpQueryNew => 8,
            Command::UpdateDps => 9,
            Command::LanExtStream => 10,
        };
        &COMMAND_TABLE[index]
    }
}

impl TryFrom<u32> for Command {
    type Error = ProtocolError;

    fn try_from(id: u32) -> Result<Self> {
        Command::from_id(id)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:#04x})", self.name(), self.id())
    }
}
