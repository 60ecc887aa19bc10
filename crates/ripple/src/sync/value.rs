use std::fmt;

use rkyv::{Archive, Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub enum VariableValue {
    Int(i32),
    Float(f32),
    Bool(bool),
    String(String),
    Char(char),
    Double(f64),
}

impl VariableValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Bool(_) => "bool",
            Self::String(_) => "string",
            Self::Char(_) => "char",
            Self::Double(_) => "double",
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Self::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f32> {
        match self {
            Self::Float(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value),
            _ => None,
        }
    }
}

impl fmt::Display for VariableValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(value) => write!(f, "{}", value),
            Self::Float(value) => write!(f, "{}", value),
            Self::Bool(value) => write!(f, "{}", value),
            Self::String(value) => write!(f, "\"{}\"", value),
            Self::Char(value) => write!(f, "'{}'", value),
            Self::Double(value) => write!(f, "{}", value),
        }
    }
}

impl From<i32> for VariableValue {
    fn from(value: i32) -> Self {
        Self::Int(value)
    }
}

impl From<f32> for VariableValue {
    fn from(value: f32) -> Self {
        Self::Float(value)
    }
}

impl From<f64> for VariableValue {
    fn from(value: f64) -> Self {
        Self::Double(value)
    }
}

impl From<bool> for VariableValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<char> for VariableValue {
    fn from(value: char) -> Self {
        Self::Char(value)
    }
}

impl From<&str> for VariableValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for VariableValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct NamedVariable {
    pub name: String,
    pub value: VariableValue,
}

impl NamedVariable {
    pub fn new(name: impl Into<String>, value: impl Into<VariableValue>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A replicated variable. Only `pass_to_clients` values leave the host.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncedValue {
    pub variable: NamedVariable,
    pub pass_to_clients: bool,
    pub allow_events: bool,
}

impl SyncedValue {
    pub fn new(name: impl Into<String>, value: impl Into<VariableValue>) -> Self {
        Self {
            variable: NamedVariable::new(name, value),
            pass_to_clients: true,
            allow_events: true,
        }
    }

    pub fn host_only(mut self) -> Self {
        self.pass_to_clients = false;
        self
    }

    pub fn without_events(mut self) -> Self {
        self.allow_events = false;
        self
    }

    pub fn name(&self) -> &str {
        &self.variable.name
    }

    pub fn value(&self) -> &VariableValue {
        &self.variable.value
    }
}
