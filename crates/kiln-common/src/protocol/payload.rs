use serde_json::{Map, Value};

use crate::error::{KilnError, Result};

/// Defaulted accessor view over a parsed client request.
///
/// The request body must be a JSON object; everything inside it is
/// optional. Accessors apply the protocol defaults so dispatch code never
/// touches raw `Value` plumbing.
///
/// # Schema
///
/// - `version` (int, default 1)
/// - `token` (string, default empty; an empty token is rejected later by
///   the core)
/// - `action` (string, default `"push"`)
/// - `targets` (object, required by `push`/`drop`/`history`): application
///   name → per-target argument object
#[derive(Debug, Clone)]
pub struct ClientPayload {
    root: Map<String, Value>,
}

impl ClientPayload {
    /// Parses a request body. Fails when the body is not valid JSON or the
    /// top-level value is not an object.
    pub fn parse(body: &[u8]) -> Result<Self> {
        let root: Value = serde_json::from_slice(body)?;

        match root {
            Value::Object(root) => Ok(Self { root }),
            _ => Err(KilnError::InvalidRequest("object expected".to_string())),
        }
    }

    pub fn version(&self) -> u32 {
        self.root
            .get("version")
            .and_then(Value::as_u64)
            .unwrap_or(1) as u32
    }

    pub fn token(&self) -> &str {
        self.root
            .get("token")
            .and_then(Value::as_str)
            .unwrap_or("")
    }

    pub fn action(&self) -> &str {
        self.root
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or("push")
    }

    /// The `targets` sub-object, if present and an object.
    pub fn targets(&self) -> Option<&Map<String, Value>> {
        self.root.get("targets").and_then(Value::as_object)
    }
}
