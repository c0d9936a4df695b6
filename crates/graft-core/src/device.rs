//! Device descriptors and their resolution to a concrete target
//!
//! A descriptor is either symbolic (`"gpu:1"`, `"cuda:1"`, `"dla:0"`) or a set of explicit
//! ids. Both normalize to one [`ConcreteTarget`]. Secondary cores (DLA) are managed by a
//! primary device, which defaults to id 0 when not given.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

use crate::error::CompileError;

/// Id value meaning "not set" in a [`ConcreteTarget`].
pub const UNSET_ID: i32 = -1;

/// Primary device that manages secondary cores unless told otherwise.
pub const DEFAULT_MANAGING_PRIMARY: i32 = 0;

static DEVICE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(gpu|cuda|dla):([0-9]+)$").expect("device pattern is a valid regex")
});

/// Kind of execution target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceKind {
    Gpu,
    Dla,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceKind::Gpu => f.write_str("GPU"),
            DeviceKind::Dla => f.write_str("DLA"),
        }
    }
}

/// Fully resolved device target handed to the accelerator compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConcreteTarget {
    pub kind: DeviceKind,
    pub primary_id: i32,
    /// Secondary core id, [`UNSET_ID`] for plain GPU targets.
    pub secondary_id: i32,
    pub allow_fallback: bool,
}

impl ConcreteTarget {
    pub fn is_secondary_core(&self) -> bool {
        self.kind == DeviceKind::Dla
    }
}

impl fmt::Display for ConcreteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            DeviceKind::Gpu => write!(f, "Device(type=GPU, gpu_id={})", self.primary_id),
            DeviceKind::Dla => write!(
                f,
                "Device(type=DLA, gpu_id={}, dla_core={}, allow_gpu_fallback={})",
                self.primary_id, self.secondary_id, self.allow_fallback
            ),
        }
    }
}

/// A device descriptor as supplied by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum DeviceSpec {
    /// `"<kind>:<id>"` with an optional fallback flag.
    Symbolic {
        spec: String,
        allow_fallback: Option<bool>,
    },
    /// Field-based form; at least one id must be present.
    Explicit {
        primary_id: Option<u32>,
        secondary_id: Option<u32>,
        allow_fallback: Option<bool>,
    },
}

impl Default for DeviceSpec {
    fn default() -> Self {
        DeviceSpec::gpu(0)
    }
}

impl DeviceSpec {
    pub fn gpu(id: u32) -> Self {
        DeviceSpec::Explicit {
            primary_id: Some(id),
            secondary_id: None,
            allow_fallback: None,
        }
    }

    pub fn dla(core: u32, allow_fallback: bool) -> Self {
        DeviceSpec::Explicit {
            primary_id: None,
            secondary_id: Some(core),
            allow_fallback: Some(allow_fallback),
        }
    }

    /// Symbolic descriptor, validated eagerly.
    pub fn symbolic(spec: &str, allow_fallback: Option<bool>) -> Result<Self, CompileError> {
        parse_symbolic(spec)?;
        Ok(DeviceSpec::Symbolic {
            spec: spec.to_string(),
            allow_fallback,
        })
    }

    /// Build a descriptor from loosely typed configuration input.
    ///
    /// Accepts a string, a one-element positional list, or a table with `spec`,
    /// `primary_id` (`gpu_id`), `secondary_id` (`dla_core`) and `allow_fallback`
    /// (`allow_gpu_fallback`).
    pub fn from_value(value: &Value) -> Result<Self, CompileError> {
        match value {
            Value::String(spec) => DeviceSpec::symbolic(spec, None),
            Value::Array(args) => DeviceSpec::symbolic(single_positional(args)?, None),
            Value::Object(fields) => DeviceSpec::from_fields(fields),
            other => Err(invalid(format!(
                "positional device argument must be a string, got {other}"
            ))),
        }
    }

    fn from_fields(fields: &Map<String, Value>) -> Result<Self, CompileError> {
        let mut spec = None;
        let mut primary_id = None;
        let mut secondary_id = None;
        let mut allow_fallback = None;

        for (key, value) in fields {
            match key.as_str() {
                "spec" => {
                    spec = Some(match value {
                        Value::String(s) => s.as_str(),
                        Value::Array(args) => single_positional(args)?,
                        other => {
                            return Err(invalid(format!(
                                "positional device argument must be a string, got {other}"
                            )));
                        }
                    })
                }
                "primary_id" | "gpu_id" => primary_id = Some(parse_id(key, value)?),
                "secondary_id" | "dla_core" => secondary_id = Some(parse_id(key, value)?),
                "allow_fallback" | "allow_gpu_fallback" => match value {
                    Value::Bool(flag) => allow_fallback = Some(*flag),
                    other => {
                        return Err(invalid(format!("{key} must be a bool, got {other}")));
                    }
                },
                unknown => return Err(invalid(format!("unknown device field '{unknown}'"))),
            }
        }

        match spec {
            Some(_) if primary_id.is_some() || secondary_id.is_some() => Err(invalid(
                "ids cannot be combined with a positional device string".to_string(),
            )),
            Some(spec) => DeviceSpec::symbolic(spec, allow_fallback),
            None if primary_id.is_none() && secondary_id.is_none() => Err(invalid(
                "either primary_id or secondary_id (or both) must be given \
                 when no device string is provided"
                    .to_string(),
            )),
            None => Ok(DeviceSpec::Explicit {
                primary_id,
                secondary_id,
                allow_fallback,
            }),
        }
    }

    /// Normalize to exactly one concrete target.
    ///
    /// Resolution is deterministic: resolving the same descriptor twice yields equal
    /// targets.
    pub fn resolve(&self) -> Result<ConcreteTarget, CompileError> {
        match self {
            DeviceSpec::Symbolic {
                spec,
                allow_fallback,
            } => {
                let (kind, id) = parse_symbolic(spec)?;
                let allow_fallback = allow_fallback.unwrap_or(false);
                Ok(match kind {
                    DeviceKind::Gpu => ConcreteTarget {
                        kind,
                        primary_id: id,
                        secondary_id: UNSET_ID,
                        allow_fallback,
                    },
                    DeviceKind::Dla => ConcreteTarget {
                        kind,
                        primary_id: default_managing_primary(id),
                        secondary_id: id,
                        allow_fallback,
                    },
                })
            }
            DeviceSpec::Explicit {
                primary_id,
                secondary_id,
                allow_fallback,
            } => {
                let allow_fallback = allow_fallback.unwrap_or(false);
                match (primary_id, secondary_id) {
                    (None, None) => Err(invalid(
                        "either primary_id or secondary_id (or both) must be given".to_string(),
                    )),
                    (primary, Some(core)) => {
                        let core = to_i32(*core)?;
                        let primary_id = match primary {
                            Some(id) => to_i32(*id)?,
                            None => default_managing_primary(core),
                        };
                        Ok(ConcreteTarget {
                            kind: DeviceKind::Dla,
                            primary_id,
                            secondary_id: core,
                            allow_fallback,
                        })
                    }
                    (Some(id), None) => Ok(ConcreteTarget {
                        kind: DeviceKind::Gpu,
                        primary_id: to_i32(*id)?,
                        secondary_id: UNSET_ID,
                        allow_fallback,
                    }),
                }
            }
        }
    }
}

impl FromStr for DeviceSpec {
    type Err = CompileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DeviceSpec::symbolic(s, None)
    }
}

impl TryFrom<Value> for DeviceSpec {
    type Error = CompileError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        DeviceSpec::from_value(&value)
    }
}

impl From<DeviceSpec> for Value {
    fn from(spec: DeviceSpec) -> Self {
        let mut fields = Map::new();
        match spec {
            DeviceSpec::Symbolic {
                spec,
                allow_fallback: None,
            } => return Value::String(spec),
            DeviceSpec::Symbolic {
                spec,
                allow_fallback: Some(flag),
            } => {
                fields.insert("spec".into(), Value::String(spec));
                fields.insert("allow_fallback".into(), Value::Bool(flag));
            }
            DeviceSpec::Explicit {
                primary_id,
                secondary_id,
                allow_fallback,
            } => {
                if let Some(id) = primary_id {
                    fields.insert("primary_id".into(), id.into());
                }
                if let Some(id) = secondary_id {
                    fields.insert("secondary_id".into(), id.into());
                }
                if let Some(flag) = allow_fallback {
                    fields.insert("allow_fallback".into(), Value::Bool(flag));
                }
            }
        }
        Value::Object(fields)
    }
}

fn default_managing_primary(core: i32) -> i32 {
    info!(
        dla_core = core,
        gpu_id = DEFAULT_MANAGING_PRIMARY,
        "Setting primary device id to {} because it manages the secondary core",
        DEFAULT_MANAGING_PRIMARY
    );
    DEFAULT_MANAGING_PRIMARY
}

fn parse_symbolic(spec: &str) -> Result<(DeviceKind, i32), CompileError> {
    let Some(captures) = DEVICE_PATTERN.captures(spec) else {
        return Err(match spec.split_once(':') {
            Some((prefix, _)) if !is_known_prefix(prefix) => {
                invalid(format!("unknown device type '{prefix}'"))
            }
            Some((_, id)) => invalid(format!("device id '{id}' is not a nonnegative integer")),
            None => invalid(format!("expected '<gpu|cuda|dla>:<id>', got '{spec}'")),
        });
    };

    let kind = match captures[1].to_ascii_lowercase().as_str() {
        "dla" => DeviceKind::Dla,
        _ => DeviceKind::Gpu,
    };
    let id = captures[2]
        .parse::<i32>()
        .map_err(|_| invalid(format!("device id '{}' is out of range", &captures[2])))?;
    Ok((kind, id))
}

fn is_known_prefix(prefix: &str) -> bool {
    matches!(
        prefix.to_ascii_lowercase().as_str(),
        "gpu" | "cuda" | "dla"
    )
}

fn single_positional(args: &[Value]) -> Result<&str, CompileError> {
    match args {
        [] => Err(invalid(
            "either primary_id or secondary_id (or both) must be given \
             when no device string is provided"
                .to_string(),
        )),
        [Value::String(spec)] => Ok(spec),
        [other] => Err(invalid(format!(
            "positional device argument must be a string, got {other}"
        ))),
        many => Err(invalid(format!(
            "expected at most one positional device argument, found {}",
            many.len()
        ))),
    }
}

fn parse_id(key: &str, value: &Value) -> Result<u32, CompileError> {
    value
        .as_u64()
        .and_then(|id| u32::try_from(id).ok())
        .ok_or_else(|| invalid(format!("{key} must be a nonnegative integer, got {value}")))
}

fn to_i32(id: u32) -> Result<i32, CompileError> {
    i32::try_from(id).map_err(|_| invalid(format!("device id {id} is out of range")))
}

fn invalid(reason: String) -> CompileError {
    CompileError::InvalidDeviceSpec(reason)
}
