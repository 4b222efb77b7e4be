use std::num::{ParseFloatError, ParseIntError};

use serde::ser::{Serialize, SerializeStruct, Serializer};
use strum_macros::EnumString;
use thiserror::Error;

use super::ScriptValue;
use crate::color::{ColorParseError, ColorRgb, ColorRgbExt};

#[derive(Debug, Error)]
pub enum ParameterError {
    #[error("invalid integer: {0}")]
    Integer(#[from] ParseIntError),
    #[error("invalid number: {0}")]
    Float(#[from] ParseFloatError),
    #[error(transparent)]
    Color(#[from] ColorParseError),
    #[error("unsupported parameter type: {0}")]
    Unsupported(String),
}

/// Declared type of a script parameter
#[derive(Debug, Clone, PartialEq, Eq, EnumString)]
#[strum(ascii_case_insensitive)]
pub enum ParameterKind {
    #[strum(serialize = "int", serialize = "integer")]
    Integer,
    #[strum(serialize = "double", serialize = "float")]
    Float,
    #[strum(serialize = "color", serialize = "colorrgb")]
    Color,
    /// Recognized but not exposed: bound to its default value
    #[strum(disabled)]
    Unsupported(String),
}

impl ParameterKind {
    pub fn from_name(name: &str) -> Self {
        name.parse()
            .unwrap_or_else(|_| Self::Unsupported(name.to_owned()))
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Integer => "int",
            Self::Float => "double",
            Self::Color => "color",
            Self::Unsupported(name) => name,
        }
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, Self::Unsupported(_))
    }
}

#[derive(Debug, Clone)]
pub enum ParameterValue {
    Integer(i64),
    Float(f64),
    Color(ColorRgb),
    /// Default of an unsupported parameter, kept as the script provided it
    Opaque(ScriptValue),
}

impl ParameterValue {
    /// Parse caller-supplied text as a value of type `kind`
    pub fn parse(kind: &ParameterKind, text: &str) -> Result<Self, ParameterError> {
        Ok(match kind {
            ParameterKind::Integer => Self::Integer(text.parse()?),
            ParameterKind::Float => Self::Float(text.parse()?),
            ParameterKind::Color => Self::Color(ColorRgb::parse_hex(text)?),
            ParameterKind::Unsupported(name) => {
                return Err(ParameterError::Unsupported(name.clone()))
            }
        })
    }
}

impl PartialEq for ParameterValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Integer(a), Self::Integer(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::Color(a), Self::Color(b)) => a == b,
            (Self::Opaque(a), Self::Opaque(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl Serialize for ParameterValue {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Integer(value) => s.serialize_i64(*value),
            Self::Float(value) => s.serialize_f64(*value),
            Self::Color(color) => crate::serde::serialize_color_as_hex(color, s),
            Self::Opaque(_) => s.serialize_unit(),
        }
    }
}

/// Parameter declared by a script
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptParameter {
    name: String,
    kind: ParameterKind,
    default: ParameterValue,
    current: Option<ParameterValue>,
}

impl ScriptParameter {
    pub fn new(name: impl Into<String>, kind: ParameterKind, default: ParameterValue) -> Self {
        Self {
            name: name.into(),
            kind,
            default,
            current: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &ParameterKind {
        &self.kind
    }

    pub fn default_value(&self) -> &ParameterValue {
        &self.default
    }

    pub fn current(&self) -> Option<&ParameterValue> {
        self.current.as_ref()
    }

    pub fn is_supported(&self) -> bool {
        self.kind.is_supported()
    }

    /// Bind the value for the next activation. Missing or invalid input falls back to the default.
    pub fn bind(&mut self, text: Option<&str>) {
        let value = match text.map(|text| ParameterValue::parse(&self.kind, text)) {
            Some(Ok(value)) => value,
            Some(Err(error)) => {
                debug!(name = %self.name, error = %error, "using default parameter value");
                self.default.clone()
            }
            None => self.default.clone(),
        };

        self.current = Some(value);
    }

    /// Value the script sees: the bound value, or the default
    pub fn value(&self) -> &ParameterValue {
        self.current.as_ref().unwrap_or(&self.default)
    }
}

impl Serialize for ScriptParameter {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        let len = if self.current.is_some() { 4 } else { 3 };
        let mut state = s.serialize_struct("ScriptParameter", len)?;
        state.serialize_field("name", &self.name)?;
        state.serialize_field("type", self.kind.name())?;
        state.serialize_field("default", &self.default)?;
        if let Some(current) = &self.current {
            state.serialize_field("current", current)?;
        } else {
            state.skip_field("current")?;
        }
        state.end()
    }
}
