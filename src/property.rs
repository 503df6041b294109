//! Typed behavioural properties and the registry describing them
//!
//! Each property kind has a stable name, a short code for compact
//! listings, a value type and a rule resolving a value into a status.
//! The registry is built once and handed to test cases by reference.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PropertyKind {
    Ip4Listener,
    Ip6Listener,
    Ip4Connection,
    Ip6Connection,
    #[serde(rename = "ip6-preferred-delay")]
    V6PreferredDelay,
    ConnectionCleanup,
    ParallelConnect,
    Errors,
}

impl PropertyKind {
    /// Every kind, in registration order
    pub const ALL: [PropertyKind; 8] = [
        Self::Ip4Listener,
        Self::Ip6Listener,
        Self::Ip4Connection,
        Self::Ip6Connection,
        Self::V6PreferredDelay,
        Self::ConnectionCleanup,
        Self::ParallelConnect,
        Self::Errors,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Ip4Listener => "ip4-listener",
            Self::Ip6Listener => "ip6-listener",
            Self::Ip4Connection => "ip4-connection",
            Self::Ip6Connection => "ip6-connection",
            Self::V6PreferredDelay => "ip6-preferred-delay",
            Self::ConnectionCleanup => "connection-cleanup",
            Self::ParallelConnect => "parallel-connect",
            Self::Errors => "errors",
        }
    }

    pub fn short(self) -> &'static str {
        match self {
            Self::Ip4Listener => "L4",
            Self::Ip6Listener => "L6",
            Self::Ip4Connection => "C4",
            Self::Ip6Connection => "C6",
            Self::V6PreferredDelay => "D6",
            Self::ConnectionCleanup => "CC",
            Self::ParallelConnect => "PC",
            Self::Errors => "Err",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::Ip4Listener => "Listens on IPv4",
            Self::Ip6Listener => "Listens on IPv6",
            Self::Ip4Connection => "Attempts IPv4 connection",
            Self::Ip6Connection => "Attempts IPv6 connection",
            Self::V6PreferredDelay => "Delay that ensures IPv6 preference",
            Self::ConnectionCleanup => "Connection was shut down and closed",
            Self::ParallelConnect => "Connection method is parallel",
            Self::Errors => "Number of errors",
        }
    }

    pub fn value_type(self) -> ValueType {
        match self {
            Self::V6PreferredDelay => ValueType::Float,
            Self::Errors => ValueType::Int,
            _ => ValueType::Bool,
        }
    }

    pub fn rule(self) -> StatusRule {
        match self {
            Self::ConnectionCleanup | Self::ParallelConnect => StatusRule::Informational,
            Self::Errors => StatusRule::ZeroIsPass,
            _ => StatusRule::Truthy,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }
}

impl fmt::Display for PropertyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Bool,
    Int,
    Float,
}

/// How a property value resolves into a status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusRule {
    /// Pass when the value is truthy, fail otherwise (absent fails)
    Truthy,
    /// Never affects the verdict
    Informational,
    /// Pass when the count is zero
    ZeroIsPass,
}

/// Property measurement; `None` is an absent value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(u64),
    Float(f64),
    None,
}

impl Value {
    pub fn is_truthy(&self) -> bool {
        match *self {
            Self::Bool(value) => value,
            Self::Int(value) => value != 0,
            Self::Float(value) => value != 0.0,
            Self::None => false,
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<Option<f64>> for Value {
    fn from(value: Option<f64>) -> Self {
        value.map_or(Self::None, Self::Float)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Pass,
    Fail,
    Info,
}

impl Status {
    pub fn from_result(passed: bool) -> Self {
        if passed {
            Self::Pass
        } else {
            Self::Fail
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
            Self::Info => "INFO",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registration record of one property kind
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PropertyDescriptor {
    #[serde(skip)]
    pub kind: PropertyKind,
    pub name: &'static str,
    pub short: &'static str,
    pub description: &'static str,
    #[serde(rename = "type")]
    pub value_type: ValueType,
    #[serde(skip)]
    pub rule: StatusRule,
}

impl PropertyDescriptor {
    pub fn new(kind: PropertyKind) -> Self {
        Self {
            kind,
            name: kind.name(),
            short: kind.short(),
            description: kind.description(),
            value_type: kind.value_type(),
            rule: kind.rule(),
        }
    }

    pub fn status(&self, value: &Value) -> Status {
        match self.rule {
            StatusRule::Truthy => Status::from_result(value.is_truthy()),
            StatusRule::Informational => Status::Info,
            StatusRule::ZeroIsPass => Status::from_result(!value.is_truthy()),
        }
    }
}

/// Ordered set of known property kinds
#[derive(Debug, Clone)]
pub struct PropertyRegistry {
    descriptors: Vec<PropertyDescriptor>,
}

impl PropertyRegistry {
    /// Registry with every built-in property kind
    pub fn standard() -> Self {
        Self {
            descriptors: PropertyKind::ALL.into_iter().map(PropertyDescriptor::new).collect(),
        }
    }

    pub fn descriptors(&self) -> &[PropertyDescriptor] {
        &self.descriptors
    }

    pub fn descriptor(&self, kind: PropertyKind) -> Option<&PropertyDescriptor> {
        self.descriptors.iter().find(|descriptor| descriptor.kind == kind)
    }

    /// Status of a property; unregistered kinds are informational
    pub fn status(&self, property: &Property) -> Status {
        self.descriptor(property.kind)
            .map_or(Status::Info, |descriptor| descriptor.status(&property.value))
    }
}

/// One measured property
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Property {
    pub kind: PropertyKind,
    pub value: Value,
}

impl Property {
    pub fn new(kind: PropertyKind, value: impl Into<Value>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }

    pub fn errors(count: usize) -> Self {
        Self::new(PropertyKind::Errors, Value::Int(count as u64))
    }

    /// Human-readable finding
    pub fn describe(&self) -> String {
        match (self.kind, self.value) {
            (PropertyKind::V6PreferredDelay, Value::Float(delay)) => format!(
                "IPv6 is preferred and fallback to IPv4 takes {:.3} seconds.",
                delay
            ),
            (PropertyKind::V6PreferredDelay, _) => {
                "IPv6 isn't preferred or fallback to IPv4 doesn't work.".to_string()
            }
            (PropertyKind::ParallelConnect, value) if value.is_truthy() => {
                "This is a happy eyeballs style dual-stack connection method resulting in fast \
                 fallback when the preferred address family fails silently."
                    .to_string()
            }
            (PropertyKind::ParallelConnect, _) => {
                "This is a classic dual-stack connection method resulting in a significant \
                 timeout when the preferred address family fails silently."
                    .to_string()
            }
            (PropertyKind::Errors, Value::Int(count)) => {
                format!("{}: {}", self.kind.description(), count)
            }
            (kind, value) => format!(
                "{}: {}",
                kind.description(),
                if value.is_truthy() { "yes" } else { "no" }
            ),
        }
    }
}

/// Serialized form: `{"value": .., "status": ..}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyRecord {
    pub value: Value,
    pub status: Status,
}
