//! Generic labeled records handed to the ingestion sink

use serde::Serialize;

/// Origin of a reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueSource {
    Report,
    Poll,
    /// Local echo of a successful command or setpoint
    Acknowledgement,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DatapointValue {
    Integer(i64),
    Float(f64),
    String(String),
    Object(Vec<Datapoint>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Datapoint {
    pub name: String,
    pub value: DatapointValue,
}

impl Datapoint {
    pub fn new(name: impl Into<String>, value: DatapointValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }

    pub fn integer(name: impl Into<String>, value: i64) -> Self {
        Self::new(name, DatapointValue::Integer(value))
    }

    pub fn float(name: impl Into<String>, value: f64) -> Self {
        Self::new(name, DatapointValue::Float(value))
    }

    pub fn string(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(name, DatapointValue::String(value.into()))
    }

    /// Direct child of an object datapoint
    pub fn child(&self, name: &str) -> Option<&Datapoint> {
        match &self.value {
            DatapointValue::Object(children) => children.iter().find(|c| c.name == name),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self.value {
            DatapointValue::Integer(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self.value {
            DatapointValue::Float(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.value {
            DatapointValue::String(v) => Some(v),
            _ => None,
        }
    }
}

/// One record: asset label plus its datapoints
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub asset: String,
    pub source: ValueSource,
    pub datapoints: Vec<Datapoint>,
}

impl Reading {
    pub fn datapoint(&self, name: &str) -> Option<&Datapoint> {
        self.datapoints.iter().find(|d| d.name == name)
    }

    /// Field of the `data_object` datapoint
    pub fn field(&self, name: &str) -> Option<&Datapoint> {
        self.datapoint(crate::dispatch::DATA_OBJECT)?.child(name)
    }

    pub fn to_json(&self) -> serde_json::Value {
        fn value_json(value: &DatapointValue) -> serde_json::Value {
            match value {
                DatapointValue::Integer(v) => serde_json::json!(v),
                DatapointValue::Float(v) => serde_json::json!(v),
                DatapointValue::String(v) => serde_json::json!(v),
                DatapointValue::Object(children) => serde_json::Value::Object(
                    children
                        .iter()
                        .map(|c| (c.name.clone(), value_json(&c.value)))
                        .collect(),
                ),
            }
        }

        let points: serde_json::Map<String, serde_json::Value> = self
            .datapoints
            .iter()
            .map(|d| (d.name.clone(), value_json(&d.value)))
            .collect();
        serde_json::json!({
            "asset": self.asset,
            "source": self.source,
            "readings": points,
        })
    }
}
