//! Message schemas and the naming convention that maps a wire identifier
//! onto its schema.
//!
//! Every schema is closed: keys that are not declared are rejected.

use core::fmt;
use std::collections::BTreeMap;

use heapless::Vec;
use serde_json::Value;
use thiserror::Error;
use tracing::error;

use crate::protocol::{
    Ack, AirValveState, CellVentState, Command, Event, MirrorCoverState, Telemetry, VentsPosition,
    COMMAND_PREFIX, KEY_ID, KEY_PRESSURE, KEY_SEQUENCE_ID, KEY_VALUE,
};

/// The widest message (m1CoverLimitSwitches) has nine keys.
pub const MAX_SCHEMA_FIELDS: usize = 12;

const COMMAND_SCHEMA_PREFIX: &str = "command_";
const EVENT_SCHEMA_PREFIX: &str = "logevent_";
const TELEMETRY_SCHEMA_PREFIX: &str = "tel_";
const RESPONSE_SCHEMA: &str = "response";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SchemaKey(String);

impl SchemaKey {
    /// `cmd_openM1Cover` → `command_openM1Cover`. Identifiers without the
    /// command prefix have no schema.
    pub fn for_command(id: &str) -> Option<Self> {
        id.strip_prefix(COMMAND_PREFIX)
            .filter(|name| !name.is_empty())
            .map(|name| Self(format!("{COMMAND_SCHEMA_PREFIX}{name}")))
    }

    pub fn for_event(name: &str) -> Self {
        Self(format!("{EVENT_SCHEMA_PREFIX}{name}"))
    }

    pub fn for_telemetry(name: &str) -> Self {
        Self(format!("{TELEMETRY_SCHEMA_PREFIX}{name}"))
    }

    pub fn response() -> Self {
        Self(RESPONSE_SCHEMA.to_owned())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SchemaKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    Bool,
    Number,
    Integer,
    String,
    /// A string that must match exactly.
    Literal(String),
    /// A string drawn from a fixed set.
    OneOf(&'static [&'static str]),
    /// An integer drawn from a fixed set (wire enums).
    IntEnum(&'static [i64]),
}

impl FieldKind {
    fn accepts(&self, value: &Value) -> bool {
        match self {
            FieldKind::Bool => value.is_boolean(),
            FieldKind::Number => value.is_number(),
            FieldKind::Integer => value.is_i64() || value.is_u64(),
            FieldKind::String => value.is_string(),
            FieldKind::Literal(expected) => value.as_str() == Some(expected.as_str()),
            FieldKind::OneOf(options) => value.as_str().is_some_and(|s| options.contains(&s)),
            FieldKind::IntEnum(options) => value.as_i64().is_some_and(|v| options.contains(&v)),
        }
    }

    fn describe(&self) -> String {
        match self {
            FieldKind::Bool => "boolean".to_owned(),
            FieldKind::Number => "number".to_owned(),
            FieldKind::Integer => "integer".to_owned(),
            FieldKind::String => "string".to_owned(),
            FieldKind::Literal(expected) => format!("\"{expected}\""),
            FieldKind::OneOf(options) => format!("one of {options:?}"),
            FieldKind::IntEnum(options) => format!("one of {options:?}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required: bool,
}

impl FieldSpec {
    pub fn required(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            required: true,
        }
    }

    pub fn optional(name: &'static str, kind: FieldKind) -> Self {
        Self {
            name,
            kind,
            required: false,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum SchemaError {
    #[error("no schema registered for `{0}`")]
    UnknownSchema(SchemaKey),
    #[error("payload for `{0}` is not a JSON object")]
    NotAnObject(SchemaKey),
    #[error("`{schema}` requires field `{field}`")]
    MissingField { schema: SchemaKey, field: &'static str },
    #[error("`{schema}` does not allow field `{field}`")]
    UnexpectedField { schema: SchemaKey, field: String },
    #[error("`{schema}` field `{field}` must be {expected}")]
    WrongType {
        schema: SchemaKey,
        field: &'static str,
        expected: String,
    },
    #[error("schema `{0}` declares more than {} fields", MAX_SCHEMA_FIELDS)]
    TooManyFields(SchemaKey),
}

#[derive(Debug, Clone)]
pub struct Schema {
    key: SchemaKey,
    fields: Vec<FieldSpec, MAX_SCHEMA_FIELDS>,
    overflowed: bool,
}

impl Schema {
    pub fn new(key: SchemaKey) -> Self {
        Self {
            key,
            fields: Vec::new(),
            overflowed: false,
        }
    }

    pub fn field(mut self, spec: FieldSpec) -> Self {
        if self.fields.push(spec).is_err() {
            self.overflowed = true;
        }
        self
    }

    pub fn validate(&self, payload: &Value) -> Result<(), SchemaError> {
        let object = payload
            .as_object()
            .ok_or_else(|| SchemaError::NotAnObject(self.key.clone()))?;

        for spec in &self.fields {
            match object.get(spec.name) {
                Some(value) if !spec.kind.accepts(value) => {
                    return Err(SchemaError::WrongType {
                        schema: self.key.clone(),
                        field: spec.name,
                        expected: spec.kind.describe(),
                    });
                }
                None if spec.required => {
                    return Err(SchemaError::MissingField {
                        schema: self.key.clone(),
                        field: spec.name,
                    });
                }
                _ => {}
            }
        }

        if let Some(extra) = object
            .keys()
            .find(|key| !self.fields.iter().any(|spec| spec.name == key.as_str()))
        {
            return Err(SchemaError::UnexpectedField {
                schema: self.key.clone(),
                field: extra.clone(),
            });
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: BTreeMap<SchemaKey, Schema>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with a schema for every command, event, telemetry topic and
    /// acknowledgement the simulator speaks.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        for schema in standard_schemas() {
            if let Err(e) = registry.register(schema) {
                error!("Dropping invalid built-in schema: {}", e);
            }
        }
        registry
    }

    pub fn register(&mut self, schema: Schema) -> Result<(), SchemaError> {
        if schema.overflowed {
            return Err(SchemaError::TooManyFields(schema.key));
        }
        self.schemas.insert(schema.key.clone(), schema);
        Ok(())
    }

    pub fn contains(&self, key: &SchemaKey) -> bool {
        self.schemas.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    pub fn validate(&self, key: &SchemaKey, payload: &Value) -> Result<(), SchemaError> {
        self.schemas
            .get(key)
            .ok_or_else(|| SchemaError::UnknownSchema(key.clone()))?
            .validate(payload)
    }
}

fn id_field(id: &str) -> FieldSpec {
    FieldSpec::required(KEY_ID, FieldKind::Literal(id.to_owned()))
}

fn standard_schemas() -> impl Iterator<Item = Schema> {
    let commands = Command::NAMES.iter().map(|name| {
        let wire_id = format!("{COMMAND_PREFIX}{name}");
        let key = SchemaKey(format!("{COMMAND_SCHEMA_PREFIX}{name}"));
        let schema = Schema::new(key)
            .field(id_field(&wire_id))
            .field(FieldSpec::required(KEY_SEQUENCE_ID, FieldKind::Integer))
            .field(FieldSpec::optional(KEY_VALUE, FieldKind::Bool));
        if name.ends_with("SetPressure") {
            schema.field(FieldSpec::required(KEY_PRESSURE, FieldKind::Number))
        } else {
            schema
        }
    });

    let events = Event::NAMES.iter().map(|name| {
        let schema = Schema::new(SchemaKey::for_event(name)).field(id_field(name));
        event_fields(name)
            .into_iter()
            .fold(schema, |schema, (field, kind)| {
                schema.field(FieldSpec::required(field, kind))
            })
    });

    let telemetry = Telemetry::NAMES.iter().map(|name| {
        let field = if *name == "loadCell" { "cellLoad" } else { KEY_PRESSURE };
        Schema::new(SchemaKey::for_telemetry(name))
            .field(id_field(name))
            .field(FieldSpec::required(field, FieldKind::Number))
    });

    let response = Schema::new(SchemaKey::response())
        .field(FieldSpec::required(KEY_ID, FieldKind::OneOf(Ack::NAMES)))
        .field(FieldSpec::required(KEY_SEQUENCE_ID, FieldKind::Integer));

    commands
        .chain(events)
        .chain(telemetry)
        .chain(core::iter::once(response))
}

fn event_fields(name: &str) -> std::vec::Vec<(&'static str, FieldKind)> {
    let valve = || vec![("state", FieldKind::IntEnum(AirValveState::VALUES))];
    match name {
        "cellVentsState" => vec![("state", FieldKind::IntEnum(CellVentState::VALUES))],
        "eStop" => vec![("triggered", FieldKind::Bool)],
        "instrumentState" | "m1State" | "m2State" | "mainValveState" => valve(),
        "m1CoverLimitSwitches" => [
            "cover1ClosedActive",
            "cover2ClosedActive",
            "cover3ClosedActive",
            "cover4ClosedActive",
            "cover1OpenedActive",
            "cover2OpenedActive",
            "cover3OpenedActive",
            "cover4OpenedActive",
        ]
        .into_iter()
        .map(|field| (field, FieldKind::Bool))
        .collect(),
        "m1CoverState" => vec![("state", FieldKind::IntEnum(MirrorCoverState::VALUES))],
        "m1SetPressure" | "m2SetPressure" => vec![(KEY_PRESSURE, FieldKind::Number)],
        "m1VentsLimitSwitches" => vec![
            ("ventsClosedActive", FieldKind::Bool),
            ("ventsOpenedActive", FieldKind::Bool),
        ],
        "m1VentsPosition" => vec![("position", FieldKind::IntEnum(VentsPosition::VALUES))],
        "powerStatus" => vec![
            ("powerOnL1", FieldKind::Bool),
            ("powerOnL2", FieldKind::Bool),
            ("powerOnL3", FieldKind::Bool),
        ],
        _ => vec![],
    }
}
