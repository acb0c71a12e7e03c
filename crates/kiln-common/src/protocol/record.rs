use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A persisted task descriptor.
///
/// The persistence collaborator returns these during recovery; each record
/// is re-pushed to its application without replying to any client.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRecord {
    pub token: String,
    pub url: String,
    pub args: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_round_trip() {
        let record = TaskRecord {
            token: "T".to_string(),
            url: "app".to_string(),
            args: json!({"event": "emit", "timeout": 5.0}),
        };

        let raw = serde_json::to_string(&record).unwrap();
        let parsed: TaskRecord = serde_json::from_str(&raw).unwrap();
        assert_eq!(record, parsed);
    }
}
