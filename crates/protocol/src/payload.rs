//! JSON payload bodies for local protocol commands.
//!
//! The body shape depends on the command family and the protocol version:
//!
//! ```text
//! legacy CONTROL   {"devId":..,"uid":..,"t":"1700000000","dps":{"1":true}}
//! 3.4+ CONTROL_NEW {"protocol":5,"t":1700000000,"data":{"dps":{"1":true}}}
//! HEART_BEAT       {"gwId":..,"devId":..}
//! UPDATEDPS        {"dpId":[18,19,20]}
//! handshake        raw bytes
//! ```
//!
//! Command data is a tagged [`CommandData`] value with one case per wire
//! shape, so a data point map can never be sent where an index list is
//! expected.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::command::{Command, CommandFamily};
use crate::error::{ProtocolError, Result};
use crate::version::{PayloadLayout, Version};

/// Value of a single data point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DpValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl From<bool> for DpValue {
    fn from(v: bool) -> Self {
        DpValue::Bool(v)
    }
}

impl From<i64> for DpValue {
    fn from(v: i64) -> Self {
        DpValue::Int(v)
    }
}

impl From<i32> for DpValue {
    fn from(v: i32) -> Self {
        DpValue::Int(v.into())
    }
}

impl From<u32> for DpValue {
    fn from(v: u32) -> Self {
        DpValue::Int(v.into())
    }
}

impl From<f64> for DpValue {
    fn from(v: f64) -> Self {
        DpValue::Float(v)
    }
}

impl From<&str> for DpValue {
    fn from(v: &str) -> Self {
        DpValue::Str(v.to_string())
    }
}

impl From<String> for DpValue {
    fn from(v: String) -> Self {
        DpValue::Str(v)
    }
}

/// Data point index (as a decimal string key) to value, in insertion order.
pub type DpMap = IndexMap<String, DpValue>;

/// Data carried by a command, one case per wire shape.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum CommandData {
    /// No data.
    #[default]
    Empty,
    /// Data point map, sent as a JSON object.
    Control(DpMap),
    /// Data point indices, sent as a JSON array.
    Indices(Vec<u32>),
    /// Handshake material, sent as raw bytes.
    Raw(Vec<u8>),
}

impl CommandData {
    /// Builds a data point map from `(index, value)` pairs.
    pub fn control<I, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (u32, V)>,
        V: Into<DpValue>,
    {
        CommandData::Control(
            entries
                .into_iter()
                .map(|(index, value)| (index.to_string(), value.into()))
                .collect(),
        )
    }

    /// Sets a single data point.
    pub fn set_value(index: u32, value: impl Into<DpValue>) -> Self {
        Self::control([(index, value)])
    }

    pub fn indices(indices: impl IntoIterator<Item = u32>) -> Self {
        CommandData::Indices(indices.into_iter().collect())
    }

    fn kind(&self) -> &'static str {
        match self {
            CommandData::Empty => "empty",
            CommandData::Control(_) => "data point map",
            CommandData::Indices(_) => "index list",
            CommandData::Raw(_) => "raw bytes",
        }
    }
}

/// Device flavour that changes which query command is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    #[default]
    Default,
    /// 3.3 devices that only answer CONTROL_NEW with an explicit DP list.
    Device22,
}

/// A serialized command body, before encryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadBody {
    /// Command actually sent, after version overrides.
    pub command: Command,
    pub body: Vec<u8>,
}

/// JSON message received from a device.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceMessage {
    /// The full decoded document.
    pub document: Value,
    /// Data points found at `dps` or `data.dps`.
    pub dps: Option<DpMap>,
}

/// Envelope fields in emission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    GwId,
    DevId,
    Uid,
    TimeText,
    TimeInt,
    Protocol,
    ReqType,
}

/// Where command data lands inside the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DataSlot {
    /// Top level `dps`.
    Dps,
    /// `data: {"dps": ...}`, `data: {}` when empty.
    NestedDps,
    /// `dpId: [...]`
    DpId,
    /// Raw bytes, no JSON.
    Raw,
}

#[derive(Debug, Clone, Copy)]
struct Template {
    fields: &'static [Field],
    slot: DataSlot,
}

const LEGACY_CONTROL: Template = Template {
    fields: &[Field::DevId, Field::Uid, Field::TimeText],
    slot: DataSlot::Dps,
};
const GATEWAY_QUERY: Template = Template {
    fields: &[Field::GwId, Field::DevId],
    slot: DataSlot::Dps,
};
const LEGACY_DP_QUERY: Template = Template {
    fields: &[Field::GwId, Field::DevId, Field::Uid, Field::TimeText],
    slot: DataSlot::Dps,
};
const NESTED_CONTROL: Template = Template {
    fields: &[Field::Protocol, Field::TimeInt],
    slot: DataSlot::NestedDps,
};
const NESTED_QUERY: Template = Template {
    fields: &[],
    slot: DataSlot::Dps,
};
const UPDATE_DPS: Template = Template {
    fields: &[],
    slot: DataSlot::DpId,
};
const LAN_EXT_STREAM: Template = Template {
    fields: &[Field::ReqType],
    slot: DataSlot::NestedDps,
};
const HANDSHAKE: Template = Template {
    fields: &[],
    slot: DataSlot::Raw,
};

/// Envelope template for an already resolved command.
fn template(layout: PayloadLayout, command: Command) -> Template {
    match (layout, command) {
        (_, Command::SessKeyNegStart | Command::SessKeyNegResp | Command::SessKeyNegFinish) => {
            HANDSHAKE
        }
        (PayloadLayout::Nested, Command::ControlNew) => NESTED_CONTROL,
        (PayloadLayout::Nested, Command::DpQueryNew) => NESTED_QUERY,
        (_, Command::Control | Command::ControlNew | Command::DpQueryNew) => LEGACY_CONTROL,
        (_, Command::Status | Command::HeartBeat) => GATEWAY_QUERY,
        (_, Command::DpQuery) => LEGACY_DP_QUERY,
        (_, Command::UpdateDps) => UPDATE_DPS,
        (_, Command::LanExtStream) => LAN_EXT_STREAM,
    }
}

/// Builds and parses command bodies for one device.
#[derive(Debug, Clone)]
pub struct PayloadCodec {
    device_id: String,
    version: Version,
    device_type: DeviceType,
    req_type: String,
}

impl PayloadCodec {
    pub fn new(device_id: impl Into<String>, version: Version, device_type: DeviceType) -> Self {
        Self {
            device_id: device_id.into(),
            version,
            device_type,
            req_type: String::new(),
        }
    }

    /// Sets the `reqType` sent with LAN_EXT_STREAM commands.
    pub fn with_req_type(mut self, req_type: impl Into<String>) -> Self {
        self.req_type = req_type.into();
        self
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    /// The command actually sent for `command` on this device.
    pub fn resolve(&self, command: Command) -> Command {
        match (self.version.rule().layout, self.device_type, command) {
            (PayloadLayout::Nested, _, Command::Control) => Command::ControlNew,
            (PayloadLayout::Nested, _, Command::DpQuery) => Command::DpQueryNew,
            (_, DeviceType::Device22, Command::DpQuery) => Command::ControlNew,
            _ => command,
        }
    }

    /// Serializes `data` for `command` using `timestamp` (seconds since the
    /// epoch) wherever the envelope carries a `t` field.
    pub fn build(&self, command: Command, data: &CommandData, timestamp: u64) -> Result<PayloadBody> {
        check_family(command, data)?;

        let resolved = self.resolve(command);
        let template = template(self.version.rule().layout, resolved);

        if template.slot == DataSlot::Raw {
            let body = match data {
                CommandData::Raw(bytes) => bytes.clone(),
                _ => Vec::new(),
            };
            return Ok(PayloadBody {
                command: resolved,
                body,
            });
        }

        let mut envelope = Map::new();
        for field in template.fields {
            let (key, value) = match field {
                Field::GwId => ("gwId", json!(self.device_id)),
                Field::DevId => ("devId", json!(self.device_id)),
                Field::Uid => ("uid", json!(self.device_id)),
                Field::TimeText => ("t", json!(timestamp.to_string())),
                Field::TimeInt => ("t", json!(timestamp)),
                Field::Protocol => ("protocol", json!(5)),
                Field::ReqType => ("reqType", json!(self.req_type)),
            };
            envelope.insert(key.to_string(), value);
        }

        let data = self.query_fallback(command, data);
        match (template.slot, &*data) {
            (DataSlot::DpId, CommandData::Indices(indices)) => {
                envelope.insert("dpId".to_string(), json!(indices));
            }
            (DataSlot::Dps, CommandData::Control(dps)) => {
                envelope.insert("dps".to_string(), serde_json::to_value(dps)?);
            }
            (DataSlot::NestedDps, CommandData::Control(dps)) => {
                let mut inner = Map::new();
                inner.insert("dps".to_string(), serde_json::to_value(dps)?);
                envelope.insert("data".to_string(), Value::Object(inner));
            }
            (DataSlot::NestedDps, _) => {
                envelope.insert("data".to_string(), Value::Object(Map::new()));
            }
            _ => {}
        }

        let body = serde_json::to_vec(&Value::Object(envelope))?;
        tracing::debug!(
            command = %resolved,
            requested = %command,
            body_len = body.len(),
            "built payload"
        );
        Ok(PayloadBody {
            command: resolved,
            body,
        })
    }

    /// Like [`build`](Self::build), but validates a raw command id first.
    pub fn build_id(&self, command_id: u32, data: &CommandData, timestamp: u64) -> Result<PayloadBody> {
        self.build(Command::from_id(command_id)?, data, timestamp)
    }

    /// Extracts the command data from a body built for `command`.
    ///
    /// `command` may be either the requested or the resolved command.
    pub fn parse(&self, command: Command, body: &[u8]) -> Result<CommandData> {
        if command.is_handshake() {
            return Ok(if body.is_empty() {
                CommandData::Empty
            } else {
                CommandData::Raw(body.to_vec())
            });
        }
        if body.is_empty() {
            return Ok(CommandData::Empty);
        }

        let document: Value = serde_json::from_slice(body)?;
        let object = document.as_object().ok_or_else(|| {
            ProtocolError::MalformedPayload("payload is not a JSON object".to_string())
        })?;

        if command.family() == CommandFamily::IndexList {
            let indices = object.get("dpId").ok_or_else(|| {
                ProtocolError::MalformedPayload("missing dpId list".to_string())
            })?;
            let indices: Vec<u32> = serde_json::from_value(indices.clone())?;
            return Ok(CommandData::Indices(indices));
        }

        match extract_dps(object)? {
            Some(dps) => Ok(CommandData::Control(dps)),
            None => Ok(CommandData::Empty),
        }
    }

    /// Like [`parse`](Self::parse), but validates a raw command id first.
    pub fn parse_id(&self, command_id: u32, body: &[u8]) -> Result<CommandData> {
        self.parse(Command::from_id(command_id)?, body)
    }

    /// Device22 queries must name the data points they want.
    fn query_fallback<'a>(
        &self,
        command: Command,
        data: &'a CommandData,
    ) -> std::borrow::Cow<'a, CommandData> {
        use std::borrow::Cow;

        if self.device_type == DeviceType::Device22
            && command == Command::DpQuery
            && *data == CommandData::Empty
        {
            Cow::Owned(CommandData::control([(1, DpValue::Null)]))
        } else {
            Cow::Borrowed(data)
        }
    }
}

/// Parses a decrypted JSON message sent by a device.
pub fn parse_device_message(body: &[u8]) -> Result<DeviceMessage> {
    let document: Value = serde_json::from_slice(body)?;
    let dps = match document.as_object() {
        Some(object) => extract_dps(object)?,
        None => None,
    };
    Ok(DeviceMessage { document, dps })
}

fn extract_dps(object: &Map<String, Value>) -> Result<Option<DpMap>> {
    let dps = object.get("dps").or_else(|| {
        object
            .get("data")
            .and_then(Value::as_object)
            .and_then(|data| data.get("dps"))
    });
    match dps {
        Some(dps) => Ok(Some(serde_json::from_value(dps.clone())?)),
        None => Ok(None),
    }
}

fn check_family(command: Command, data: &CommandData) -> Result<()> {
    let accepted = match (command.family(), data) {
        (CommandFamily::Handshake, CommandData::Raw(_) | CommandData::Empty) => true,
        (CommandFamily::Control | CommandFamily::Query, CommandData::Control(_) | CommandData::Empty) => true,
        (CommandFamily::Empty, CommandData::Empty) => true,
        (CommandFamily::IndexList, CommandData::Indices(_)) => true,
        _ => false,
    };
    if accepted {
        Ok(())
    } else {
        Err(ProtocolError::MalformedPayload(format!(
            "{} does not take {}",
            command.name(),
            data.kind()
        )))
    }
}
