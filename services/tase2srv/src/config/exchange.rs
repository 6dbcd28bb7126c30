//! Exchanged data point definitions
//!
//! Every definition is indexed twice: by label (the name readings are
//! ingested under) and by protocol reference (`domain:name`, the key the
//! peer reports values with). Both indices share the same `Arc`.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::{Result, Tase2Error};

/// Semantic point type. The discriminant order defines the family layout:
/// four monitoring families of four variants each, then the control types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PointType {
    Real = 0,
    RealQ,
    RealQTime,
    RealQTimeExt,
    State,
    StateQ,
    StateQTime,
    StateQTimeExt,
    Discrete,
    DiscreteQ,
    DiscreteQTime,
    DiscreteQTimeExt,
    StateSup,
    StateSupQ,
    StateSupQTime,
    StateSupQTimeExt,
    Command,
    SetPointReal,
    SetPointDiscrete,
}

/// Representation of `do_value` in readings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueRepr {
    Integer,
    Float,
}

impl PointType {
    pub const ALL: [PointType; 19] = [
        PointType::Real,
        PointType::RealQ,
        PointType::RealQTime,
        PointType::RealQTimeExt,
        PointType::State,
        PointType::StateQ,
        PointType::StateQTime,
        PointType::StateQTimeExt,
        PointType::Discrete,
        PointType::DiscreteQ,
        PointType::DiscreteQTime,
        PointType::DiscreteQTimeExt,
        PointType::StateSup,
        PointType::StateSupQ,
        PointType::StateSupQTime,
        PointType::StateSupQTimeExt,
        PointType::Command,
        PointType::SetPointReal,
        PointType::SetPointDiscrete,
    ];

    pub fn index(self) -> u8 {
        self as u8
    }

    /// Monitoring types are polled or reported; control types are only written.
    pub fn is_monitoring(self) -> bool {
        self.index() < PointType::Command.index()
    }

    pub fn has_quality(self) -> bool {
        self.is_monitoring() && self.index() % 4 != 0
    }

    pub fn has_timestamp(self) -> bool {
        self.is_monitoring() && self.index() % 4 >= 2
    }

    pub fn value_repr(self) -> ValueRepr {
        match self {
            PointType::Real
            | PointType::RealQ
            | PointType::RealQTime
            | PointType::RealQTimeExt
            | PointType::SetPointReal => ValueRepr::Float,
            _ => ValueRepr::Integer,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PointType::Real => "Real",
            PointType::RealQ => "RealQ",
            PointType::RealQTime => "RealQTime",
            PointType::RealQTimeExt => "RealQTimeExt",
            PointType::State => "State",
            PointType::StateQ => "StateQ",
            PointType::StateQTime => "StateQTime",
            PointType::StateQTimeExt => "StateQTimeExt",
            PointType::Discrete => "Discrete",
            PointType::DiscreteQ => "DiscreteQ",
            PointType::DiscreteQTime => "DiscreteQTime",
            PointType::DiscreteQTimeExt => "DiscreteQTimeExt",
            PointType::StateSup => "StateSup",
            PointType::StateSupQ => "StateSupQ",
            PointType::StateSupQTime => "StateSupQTime",
            PointType::StateSupQTimeExt => "StateSupQTimeExt",
            PointType::Command => "Command",
            PointType::SetPointReal => "SetPointReal",
            PointType::SetPointDiscrete => "SetPointDiscrete",
        }
    }
}

impl fmt::Display for PointType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PointType {
    type Err = Tase2Error;

    fn from_str(s: &str) -> Result<Self> {
        PointType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Tase2Error::config(format!("unknown point type '{}'", s)))
    }
}

/// Static description of one exchanged point
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeDefinition {
    pub reference: String,
    pub label: String,
    pub point_type: PointType,
}

impl ExchangeDefinition {
    pub fn new(
        reference: impl Into<String>,
        label: impl Into<String>,
        point_type: PointType,
    ) -> Result<Self> {
        let reference = reference.into();
        if !reference.contains(':') {
            return Err(Tase2Error::config(format!("invalid ref '{}'", reference)));
        }
        Ok(Self {
            reference,
            label: label.into(),
            point_type,
        })
    }

    pub fn domain(&self) -> &str {
        split_reference(&self.reference).map_or("", |(d, _)| d)
    }

    pub fn name(&self) -> &str {
        split_reference(&self.reference).map_or("", |(_, n)| n)
    }
}

/// Split `domain:name` at the first colon.
pub fn split_reference(reference: &str) -> Option<(&str, &str)> {
    reference.split_once(':')
}

/// Label and reference indices over the same definitions
#[derive(Debug, Clone, Default)]
pub struct ExchangeTable {
    by_label: HashMap<String, Arc<ExchangeDefinition>>,
    by_ref: BTreeMap<String, Arc<ExchangeDefinition>>,
}

impl ExchangeTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a definition into both indices. A definition previously
    /// registered under the same label or reference is removed from both.
    pub fn insert(&mut self, def: ExchangeDefinition) -> Arc<ExchangeDefinition> {
        if let Some(old) = self.by_label.remove(&def.label) {
            self.by_ref.remove(&old.reference);
        }
        if let Some(old) = self.by_ref.remove(&def.reference) {
            self.by_label.remove(&old.label);
        }

        let def = Arc::new(def);
        self.by_label.insert(def.label.clone(), Arc::clone(&def));
        self.by_ref.insert(def.reference.clone(), Arc::clone(&def));
        def
    }

    pub fn by_label(&self, label: &str) -> Option<&Arc<ExchangeDefinition>> {
        self.by_label.get(label)
    }

    pub fn by_ref(&self, reference: &str) -> Option<&Arc<ExchangeDefinition>> {
        self.by_ref.get(reference)
    }

    /// Definitions in reference order
    pub fn iter(&self) -> impl Iterator<Item = &Arc<ExchangeDefinition>> {
        self.by_ref.values()
    }

    pub fn len(&self) -> usize {
        self.by_ref.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_ref.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_label.clear();
        self.by_ref.clear();
    }
}
