use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};

/// Bounded per-driver telemetry history.
///
/// Newest entries sit at the front; inserting at capacity evicts from the
/// back. A depth of zero disables recording entirely and the `history`
/// action with it.
#[derive(Default)]
pub struct HistoryBuffer {
    depth: usize,
    buffers: HashMap<String, VecDeque<(f64, BTreeMap<String, Vec<u8>>)>>,
}

impl HistoryBuffer {
    pub fn new(depth: usize) -> Self {
        Self {
            depth,
            buffers: HashMap::new(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.depth > 0
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Records one event for a driver, timestamped with reactor time.
    pub fn record(&mut self, driver: &str, timestamp: f64, fields: &BTreeMap<String, Vec<u8>>) {
        if !self.enabled() {
            return;
        }

        let buffer = self.buffers.entry(driver.to_string()).or_default();
        buffer.push_front((timestamp, fields.clone()));
        buffer.truncate(self.depth);
    }

    /// Returns up to `depth` most recent events for a driver, newest
    /// first, or `None` for a driver without history.
    pub fn query(&self, driver: &str, depth: usize) -> Option<Value> {
        let buffer = self.buffers.get(driver)?;

        let entries: Vec<Value> = buffer
            .iter()
            .take(depth)
            .map(|(timestamp, fields)| {
                let event: Value = fields
                    .iter()
                    .map(|(field, blob)| {
                        (
                            field.clone(),
                            Value::String(String::from_utf8_lossy(blob).into_owned()),
                        )
                    })
                    .collect::<serde_json::Map<_, _>>()
                    .into();

                json!({
                    "event": event,
                    "timestamp": timestamp,
                })
            })
            .collect();

        Some(Value::Array(entries))
    }

    pub fn clear(&mut self) {
        self.buffers.clear();
    }
}
