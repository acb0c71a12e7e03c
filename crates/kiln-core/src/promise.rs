use serde_json::{Map, Value};
use std::collections::HashMap;
use uuid::Uuid;

use kiln_metrics::{CountGuard, REQUESTS};

/// An in-flight composite response.
///
/// Accumulates one named part per fan-out target until the expected count
/// is reached, then seals: the accumulator is serialized and sent down the
/// reply route. A promise with an empty route belongs to recovery and its
/// seal is discarded instead.
pub struct Promise {
    id: String,
    route: Vec<Vec<u8>>,
    expected: usize,
    parts: Map<String, Value>,
    meta: HashMap<String, String>,
    _count: CountGuard,
}

impl Promise {
    pub fn new(route: Vec<Vec<u8>>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            route,
            expected: 1,
            parts: Map::new(),
            meta: HashMap::new(),
            _count: REQUESTS.acquire(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Sets the number of parts the response is waiting for.
    pub fn await_parts(&mut self, expected: usize) {
        self.expected = expected;
    }

    pub fn set_meta(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.meta.insert(key.into(), value.into());
    }

    pub fn meta(&self, key: &str) -> Option<&str> {
        self.meta.get(key).map(String::as_str)
    }

    /// Inserts one part. Duplicate names overwrite, so the accumulator
    /// never outgrows the expected count. Returns true once the promise is
    /// ready to seal.
    fn fulfill(&mut self, name: impl Into<String>, value: Value) -> bool {
        self.parts.insert(name.into(), value);
        self.parts.len() >= self.expected
    }
}

/// A sealed composite response, ready for the wire.
#[derive(Debug)]
pub struct SealedResponse {
    pub route: Vec<Vec<u8>>,
    pub body: Value,
}

/// The outcome of one fulfillment.
#[derive(Debug)]
pub enum FulfillOutcome {
    /// More parts are still outstanding.
    Pending,
    /// The last part arrived; the promise was removed from the registry.
    Sealed(SealedResponse),
    /// No such promise. Reload legitimately drops promises out from under
    /// in-flight engines, so this is logged by the caller, never fatal.
    Orphan,
}

/// Registry of in-flight promises, keyed by id and owned by the reactor.
#[derive(Default)]
pub struct PromiseRegistry {
    promises: HashMap<String, Promise>,
}

impl PromiseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, promise: Promise) {
        self.promises.insert(promise.id().to_string(), promise);
    }

    pub fn len(&self) -> usize {
        self.promises.len()
    }

    pub fn is_empty(&self) -> bool {
        self.promises.is_empty()
    }

    pub fn await_parts(&mut self, id: &str, expected: usize) {
        if let Some(promise) = self.promises.get_mut(id) {
            promise.await_parts(expected);
        }
    }

    pub fn set_meta(&mut self, id: &str, key: &str, value: &str) {
        if let Some(promise) = self.promises.get_mut(id) {
            promise.set_meta(key, value);
        }
    }

    /// Fulfills one part, sealing and removing the promise when it was the
    /// last one outstanding.
    pub fn fulfill(&mut self, id: &str, name: &str, value: Value) -> FulfillOutcome {
        let Some(promise) = self.promises.get_mut(id) else {
            return FulfillOutcome::Orphan;
        };

        if !promise.fulfill(name, value) {
            return FulfillOutcome::Pending;
        }

        let promise = self
            .promises
            .remove(id)
            .expect("promise fetched above");

        tracing::debug!(
            future = %promise.id,
            token = promise.meta("token").unwrap_or(""),
            "sealing response"
        );

        FulfillOutcome::Sealed(SealedResponse {
            route: promise.route,
            body: Value::Object(promise.parts),
        })
    }

    /// Drops every in-flight promise. Late fulfillments become orphans.
    pub fn clear(&mut self) {
        self.promises.clear();
    }
}
