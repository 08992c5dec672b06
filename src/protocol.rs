use arrayvec::ArrayString;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::schema::{SchemaError, SchemaKey, SchemaRegistry};

pub const MAX_MESSAGE_SIZE: usize = 1024;

pub type MessageBuffer = ArrayString<MAX_MESSAGE_SIZE>;

/// Wire keys shared by every command payload.
pub const KEY_ID: &str = "id";
pub const KEY_SEQUENCE_ID: &str = "sequence_id";
pub const KEY_VALUE: &str = "value";
pub const KEY_PRESSURE: &str = "pressure";

/// Prefix the control system puts in front of every command name.
pub const COMMAND_PREFIX: &str = "cmd_";

macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident { $($variant:ident = $value:expr),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(into = "i64", try_from = "i64")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const VALUES: &'static [i64] = &[$($value),+];
        }

        impl From<$name> for i64 {
            fn from(value: $name) -> i64 {
                match value {
                    $($name::$variant => $value),+
                }
            }
        }

        impl TryFrom<i64> for $name {
            type Error = ProtocolError;

            fn try_from(value: i64) -> Result<Self, Self::Error> {
                match value {
                    $(v if v == $value => Ok($name::$variant),)+
                    other => Err(ProtocolError::InvalidEnumValue {
                        name: stringify!($name),
                        value: other,
                    }),
                }
            }
        }
    };
}

wire_enum! {
    /// State of one of the air valves.
    pub enum AirValveState {
        Invalid = 1,
        Opened = 2,
        Closed = 3,
    }
}

wire_enum! {
    pub enum CellVentState {
        Invalid = 1,
        Opened = 2,
        Closed = 3,
        InMotion = 4,
    }
}

wire_enum! {
    pub enum MirrorCoverState {
        Invalid = 1,
        Opened = 2,
        Closed = 3,
        InMotion = 4,
    }
}

wire_enum! {
    pub enum VentsPosition {
        Opened = 0,
        Closed = 1,
        PartiallyOpened = 2,
    }
}

/// Inbound commands, tagged by their wire `id`.
///
/// Extra keys (`sequence_id`, `value`) are ignored here; they are checked by
/// the schema registry before decoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "id")]
pub enum Command {
    #[serde(rename = "cmd_closeInstrumentAirValve")]
    CloseInstrumentAirValve,
    #[serde(rename = "cmd_closeM1CellVents")]
    CloseM1CellVents,
    #[serde(rename = "cmd_closeM1Cover")]
    CloseM1Cover,
    #[serde(rename = "cmd_closeMasterAirSupply")]
    CloseMasterAirSupply,
    #[serde(rename = "cmd_m1CloseAirValve")]
    M1CloseAirValve,
    #[serde(rename = "cmd_m1OpenAirValve")]
    M1OpenAirValve,
    #[serde(rename = "cmd_m1SetPressure")]
    M1SetPressure { pressure: f64 },
    #[serde(rename = "cmd_m2CloseAirValve")]
    M2CloseAirValve,
    #[serde(rename = "cmd_m2OpenAirValve")]
    M2OpenAirValve,
    #[serde(rename = "cmd_m2SetPressure")]
    M2SetPressure { pressure: f64 },
    #[serde(rename = "cmd_openInstrumentAirValve")]
    OpenInstrumentAirValve,
    #[serde(rename = "cmd_openM1CellVents")]
    OpenM1CellVents,
    #[serde(rename = "cmd_openM1Cover")]
    OpenM1Cover,
    #[serde(rename = "cmd_openMasterAirSupply")]
    OpenMasterAirSupply,

    // Lifecycle commands shared by every simulated controller
    #[serde(rename = "cmd_start")]
    Start,
    #[serde(rename = "cmd_enable")]
    Enable,
    #[serde(rename = "cmd_disable")]
    Disable,
    #[serde(rename = "cmd_standby")]
    Standby,
    #[serde(rename = "cmd_exitControl")]
    ExitControl,
}

impl Command {
    /// Every command name (without the `cmd_` prefix) the simulator accepts.
    pub const NAMES: &'static [&'static str] = &[
        "closeInstrumentAirValve",
        "closeM1CellVents",
        "closeM1Cover",
        "closeMasterAirSupply",
        "m1CloseAirValve",
        "m1OpenAirValve",
        "m1SetPressure",
        "m2CloseAirValve",
        "m2OpenAirValve",
        "m2SetPressure",
        "openInstrumentAirValve",
        "openM1CellVents",
        "openM1Cover",
        "openMasterAirSupply",
        "start",
        "enable",
        "disable",
        "standby",
        "exitControl",
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Command::CloseInstrumentAirValve => "closeInstrumentAirValve",
            Command::CloseM1CellVents => "closeM1CellVents",
            Command::CloseM1Cover => "closeM1Cover",
            Command::CloseMasterAirSupply => "closeMasterAirSupply",
            Command::M1CloseAirValve => "m1CloseAirValve",
            Command::M1OpenAirValve => "m1OpenAirValve",
            Command::M1SetPressure { .. } => "m1SetPressure",
            Command::M2CloseAirValve => "m2CloseAirValve",
            Command::M2OpenAirValve => "m2OpenAirValve",
            Command::M2SetPressure { .. } => "m2SetPressure",
            Command::OpenInstrumentAirValve => "openInstrumentAirValve",
            Command::OpenM1CellVents => "openM1CellVents",
            Command::OpenM1Cover => "openM1Cover",
            Command::OpenMasterAirSupply => "openMasterAirSupply",
            Command::Start => "start",
            Command::Enable => "enable",
            Command::Disable => "disable",
            Command::Standby => "standby",
            Command::ExitControl => "exitControl",
        }
    }

    pub fn wire_id(&self) -> String {
        format!("{}{}", COMMAND_PREFIX, self.name())
    }

    /// Commands whose SUCCESS waits on an actuator timer.
    pub fn is_timed(&self) -> bool {
        matches!(
            self,
            Command::CloseM1CellVents
                | Command::OpenM1CellVents
                | Command::CloseM1Cover
                | Command::OpenM1Cover
        )
    }
}

/// Command acknowledgement kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ack {
    /// Accepted for processing, not yet complete.
    Ack,
    /// Processed and failed.
    Fail,
    /// Rejected before any processing.
    Noack,
    Success,
}

impl Ack {
    pub const NAMES: &'static [&'static str] = &["ack", "fail", "noack", "success"];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub id: Ack,
    pub sequence_id: i64,
}

impl CommandResponse {
    pub fn new(id: Ack, sequence_id: i64) -> Self {
        Self { id, sequence_id }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct M1CoverLimitSwitches {
    #[serde(rename = "cover1ClosedActive")]
    pub cover1_closed_active: bool,
    #[serde(rename = "cover2ClosedActive")]
    pub cover2_closed_active: bool,
    #[serde(rename = "cover3ClosedActive")]
    pub cover3_closed_active: bool,
    #[serde(rename = "cover4ClosedActive")]
    pub cover4_closed_active: bool,
    #[serde(rename = "cover1OpenedActive")]
    pub cover1_opened_active: bool,
    #[serde(rename = "cover2OpenedActive")]
    pub cover2_opened_active: bool,
    #[serde(rename = "cover3OpenedActive")]
    pub cover3_opened_active: bool,
    #[serde(rename = "cover4OpenedActive")]
    pub cover4_opened_active: bool,
}

impl M1CoverLimitSwitches {
    /// All four petals report the same switch pair.
    pub fn uniform(closed: bool, opened: bool) -> Self {
        Self {
            cover1_closed_active: closed,
            cover2_closed_active: closed,
            cover3_closed_active: closed,
            cover4_closed_active: closed,
            cover1_opened_active: opened,
            cover2_opened_active: opened,
            cover3_opened_active: opened,
            cover4_opened_active: opened,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct M1VentsLimitSwitches {
    #[serde(rename = "ventsClosedActive")]
    pub vents_closed_active: bool,
    #[serde(rename = "ventsOpenedActive")]
    pub vents_opened_active: bool,
}

/// Circuit breaker states of the three mount power lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PowerStatus {
    #[serde(rename = "powerOnL1")]
    pub power_on_l1: bool,
    #[serde(rename = "powerOnL2")]
    pub power_on_l2: bool,
    #[serde(rename = "powerOnL3")]
    pub power_on_l3: bool,
}

/// Change-driven events, tagged by their wire `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "id")]
pub enum Event {
    #[serde(rename = "cellVentsState")]
    CellVentsState { state: CellVentState },
    #[serde(rename = "eStop")]
    EStop { triggered: bool },
    #[serde(rename = "instrumentState")]
    InstrumentState { state: AirValveState },
    #[serde(rename = "m1CoverLimitSwitches")]
    M1CoverLimitSwitches(M1CoverLimitSwitches),
    #[serde(rename = "m1CoverState")]
    M1CoverState { state: MirrorCoverState },
    #[serde(rename = "m1SetPressure")]
    M1SetPressure { pressure: f64 },
    #[serde(rename = "m1State")]
    M1State { state: AirValveState },
    #[serde(rename = "m1VentsLimitSwitches")]
    M1VentsLimitSwitches(M1VentsLimitSwitches),
    #[serde(rename = "m1VentsPosition")]
    M1VentsPosition { position: VentsPosition },
    #[serde(rename = "m2SetPressure")]
    M2SetPressure { pressure: f64 },
    #[serde(rename = "m2State")]
    M2State { state: AirValveState },
    #[serde(rename = "mainValveState")]
    MainValveState { state: AirValveState },
    #[serde(rename = "powerStatus")]
    PowerStatus(PowerStatus),
}

impl Event {
    pub const NAMES: &'static [&'static str] = &[
        "cellVentsState",
        "eStop",
        "instrumentState",
        "m1CoverLimitSwitches",
        "m1CoverState",
        "m1SetPressure",
        "m1State",
        "m1VentsLimitSwitches",
        "m1VentsPosition",
        "m2SetPressure",
        "m2State",
        "mainValveState",
        "powerStatus",
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Event::CellVentsState { .. } => "cellVentsState",
            Event::EStop { .. } => "eStop",
            Event::InstrumentState { .. } => "instrumentState",
            Event::M1CoverLimitSwitches(_) => "m1CoverLimitSwitches",
            Event::M1CoverState { .. } => "m1CoverState",
            Event::M1SetPressure { .. } => "m1SetPressure",
            Event::M1State { .. } => "m1State",
            Event::M1VentsLimitSwitches(_) => "m1VentsLimitSwitches",
            Event::M1VentsPosition { .. } => "m1VentsPosition",
            Event::M2SetPressure { .. } => "m2SetPressure",
            Event::M2State { .. } => "m2State",
            Event::MainValveState { .. } => "mainValveState",
            Event::PowerStatus(_) => "powerStatus",
        }
    }
}

/// Periodic telemetry samples, tagged by their wire `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "id")]
pub enum Telemetry {
    #[serde(rename = "m1AirPressure")]
    M1AirPressure { pressure: f64 },
    #[serde(rename = "m2AirPressure")]
    M2AirPressure { pressure: f64 },
    #[serde(rename = "mainAirSourcePressure")]
    MainAirSourcePressure { pressure: f64 },
    #[serde(rename = "loadCell")]
    LoadCell {
        #[serde(rename = "cellLoad")]
        cell_load: f64,
    },
}

impl Telemetry {
    pub const NAMES: &'static [&'static str] =
        &["m1AirPressure", "m2AirPressure", "mainAirSourcePressure", "loadCell"];

    pub fn name(&self) -> &'static str {
        match self {
            Telemetry::M1AirPressure { .. } => "m1AirPressure",
            Telemetry::M2AirPressure { .. } => "m2AirPressure",
            Telemetry::MainAirSourcePressure { .. } => "mainAirSourcePressure",
            Telemetry::LoadCell { .. } => "loadCell",
        }
    }
}

/// A command that made it through schema validation.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedCommand {
    pub sequence_id: i64,
    pub command: Command,
    /// Remaining command-specific arguments, for logging.
    pub args: Map<String, Value>,
}

/// Result of looking at an inbound line before it is decoded.
#[derive(Debug, Clone, PartialEq)]
pub struct RawCommand {
    pub id: Option<String>,
    pub sequence_id: Option<i64>,
    pub payload: Value,
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("message exceeds the maximum frame size")]
    MessageTooLarge,
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("unknown command `{0}`")]
    UnknownCommand(String),
    #[error("invalid {name} value {value}")]
    InvalidEnumValue { name: &'static str, value: i64 },
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

/// Encodes and decodes wire messages, validating each one against the
/// schema registered under its normalized name.
#[derive(Debug)]
pub struct MessageCodec {
    registry: SchemaRegistry,
}

impl MessageCodec {
    pub fn new() -> Self {
        Self::with_registry(SchemaRegistry::standard())
    }

    pub fn with_registry(registry: SchemaRegistry) -> Self {
        Self { registry }
    }

    /// Parse a line and pull out the identifier and sequence id, if present.
    pub fn parse(&self, line: &str) -> Result<RawCommand, ProtocolError> {
        if line.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge);
        }
        let payload: Value = serde_json::from_str(line)?;
        let object = payload.as_object().ok_or(ProtocolError::NotAnObject)?;

        let id = object.get(KEY_ID).and_then(Value::as_str).map(str::to_owned);
        let sequence_id = object.get(KEY_SEQUENCE_ID).and_then(Value::as_i64);

        Ok(RawCommand {
            id,
            sequence_id,
            payload,
        })
    }

    /// Validate a parsed command against its schema and decode it.
    pub fn decode(&self, raw: &RawCommand) -> Result<DecodedCommand, ProtocolError> {
        let id = raw.id.as_deref().ok_or(ProtocolError::MissingField(KEY_ID))?;
        let sequence_id = raw
            .sequence_id
            .ok_or(ProtocolError::MissingField(KEY_SEQUENCE_ID))?;

        let key = SchemaKey::for_command(id)
            .ok_or_else(|| ProtocolError::UnknownCommand(id.to_owned()))?;
        if !self.registry.contains(&key) {
            return Err(ProtocolError::UnknownCommand(id.to_owned()));
        }
        self.registry.validate(&key, &raw.payload)?;

        let command: Command = serde_json::from_value(raw.payload.clone())?;

        let mut args = raw.payload.as_object().cloned().unwrap_or_default();
        for key in [KEY_ID, KEY_SEQUENCE_ID, KEY_VALUE] {
            args.remove(key);
        }

        Ok(DecodedCommand {
            sequence_id,
            command,
            args,
        })
    }

    pub fn encode_event(&self, event: &Event) -> Result<Value, ProtocolError> {
        let value = serde_json::to_value(event)?;
        self.registry.validate(&SchemaKey::for_event(event.name()), &value)?;
        Ok(value)
    }

    pub fn encode_telemetry(&self, telemetry: &Telemetry) -> Result<Value, ProtocolError> {
        let value = serde_json::to_value(telemetry)?;
        self.registry
            .validate(&SchemaKey::for_telemetry(telemetry.name()), &value)?;
        Ok(value)
    }

    pub fn encode_response(&self, response: &CommandResponse) -> Result<Value, ProtocolError> {
        let value = serde_json::to_value(response)?;
        self.registry.validate(&SchemaKey::response(), &value)?;
        Ok(value)
    }
}

/// Write `message` as compact JSON into `buffer`, without the trailing
/// newline.
pub fn frame_message(message: &Value, buffer: &mut MessageBuffer) -> Result<(), ProtocolError> {
    buffer.clear();

    let json_str = serde_json::to_string(message)?;
    if json_str.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge);
    }
    buffer.push_str(&json_str);

    Ok(())
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}
