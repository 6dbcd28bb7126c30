//! Value mapping and ingestion
//!
//! Turns a raw point value plus its exchange definition into a labeled
//! reading and hands it to the ingestion sink. The dispatcher is also the
//! report handler installed on every endpoint, and runs the polling pass.

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::config::{ClientConfig, ExchangeDefinition, ValueRepr};
use crate::connection::Connection;
use crate::endpoint::{PointValue, ReportHandler};
use crate::reading::{Datapoint, DatapointValue, Reading, ValueSource};

pub const DATA_OBJECT: &str = "data_object";

/// Receiver of readings produced by the bridge
pub trait IngestSink: Send + Sync {
    fn ingest(&self, reading: Reading);
}

impl<F> IngestSink for F
where
    F: Fn(Reading) + Send + Sync,
{
    fn ingest(&self, reading: Reading) {
        self(reading)
    }
}

/// Milliseconds since the epoch, wall clock
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub struct Dispatcher {
    config: Arc<ClientConfig>,
    sink: Arc<dyn IngestSink>,
}

impl Dispatcher {
    pub fn new(config: Arc<ClientConfig>, sink: Arc<dyn IngestSink>) -> Self {
        Self { config, sink }
    }

    pub fn config(&self) -> &Arc<ClientConfig> {
        &self.config
    }

    /// Map and emit one value. Returns false when the reference is unknown.
    pub fn handle_value(
        &self,
        reference: &str,
        value: PointValue,
        received_ms: i64,
        source: ValueSource,
    ) -> bool {
        let Some(def) = self.config.definition_by_ref(reference) else {
            error!("No exchange definition for {}, value dropped", reference);
            return false;
        };

        let reading = build_reading(def, &value, received_ms, source);
        debug!("Ingest {} ({:?}) for {}", def.label, source, reference);
        self.sink.ingest(reading);
        true
    }

    /// Read every polled point through `connection`, one reading per point.
    /// Read failures are logged and skipped until the next pass.
    pub async fn poll(&self, connection: &Connection) -> usize {
        let mut emitted = 0;

        for def in self.config.polled_points() {
            match connection.read_value(def.domain(), def.name()).await {
                Ok(value) => {
                    if self.handle_value(&def.reference, value, now_ms(), ValueSource::Poll) {
                        emitted += 1;
                    }
                },
                Err(e) => warn!("{} read {} failed: {}", connection, def.reference, e),
            }
        }

        debug!("{} poll pass emitted {} readings", connection, emitted);
        emitted
    }
}

impl ReportHandler for Dispatcher {
    fn on_report_lifecycle(&self, transfer_set: &str, finished: bool, sequence: u32) {
        if finished {
            debug!("Report {} #{} finished", transfer_set, sequence);
        } else {
            debug!("Report {} #{} received", transfer_set, sequence);
        }
    }

    fn on_point_value(&self, domain: &str, name: &str, value: PointValue) {
        let reference = format!("{}:{}", domain, name);
        self.handle_value(&reference, value, now_ms(), ValueSource::Report);
    }
}

/// Build the `data_object` reading for one value.
pub fn build_reading(
    def: &ExchangeDefinition,
    value: &PointValue,
    received_ms: i64,
    source: ValueSource,
) -> Reading {
    let point_type = def.point_type;

    let mut fields = vec![
        Datapoint::string("do_type", point_type.as_str()),
        Datapoint::string("do_domain", def.domain()),
        Datapoint::string("do_name", def.name()),
        match point_type.value_repr() {
            ValueRepr::Integer => Datapoint::integer("do_value", value.as_i64()),
            ValueRepr::Float => Datapoint::float("do_value", value.as_f64()),
        },
    ];

    if point_type.has_quality() {
        let flags = value.flags;
        fields.push(Datapoint::string("do_validity", flags.validity().as_str()));
        fields.push(Datapoint::string("do_cs", flags.current_source().as_str()));
        fields.push(Datapoint::string(
            "do_quality_normal_value",
            if flags.is_normal() { "normal" } else { "abnormal" },
        ));
    }

    if point_type.has_timestamp() {
        fields.push(Datapoint::integer(
            "do_ts",
            value.timestamp_ms.unwrap_or(received_ms),
        ));
        fields.push(Datapoint::string("do_ts_validity", "valid"));
    }

    Reading {
        asset: def.label.clone(),
        source,
        datapoints: vec![Datapoint::new(DATA_OBJECT, DatapointValue::Object(fields))],
    }
}
