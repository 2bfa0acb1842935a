//! Classification request types.

use serde::{Deserialize, Serialize};

/// Priority class for a classification request.
///
/// Higher priorities are dispatched first, subject to the starvation
/// escalation applied by the dispatch policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
}

impl Priority {
    /// All priority variants for iteration.
    pub const ALL: [Priority; 3] = [Priority::Low, Priority::Normal, Priority::High];

    /// Parse a priority from a string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "low" => Some(Self::Low),
            "normal" => Some(Self::Normal),
            "high" => Some(Self::High),
            _ => None,
        }
    }

    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A classification request as submitted by a caller.
///
/// The pipeline assigns the request id and submission timestamp at admission;
/// callers only describe the work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifyRequest {
    /// Identifier of the submitting client, used for per-client limits.
    pub client_id: String,
    /// Target model identifier (e.g., "resnet50").
    pub model_id: String,
    /// Priority class (default: normal).
    #[serde(default)]
    pub priority: Priority,
    /// Raw image bytes.
    pub payload: Vec<u8>,
    /// Declared content type of the payload (e.g., "image/jpeg").
    pub content_type: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
    }

    #[test]
    fn test_priority_from_str() {
        assert_eq!(Priority::from_str("high"), Some(Priority::High));
        assert_eq!(Priority::from_str("Normal"), Some(Priority::Normal));
        assert_eq!(Priority::from_str("LOW"), Some(Priority::Low));
        assert_eq!(Priority::from_str("urgent"), None);
    }

    #[test]
    fn test_priority_serde_roundtrip() {
        for priority in Priority::ALL {
            let json = serde_json::to_string(&priority).unwrap();
            let parsed: Priority = serde_json::from_str(&json).unwrap();
            assert_eq!(priority, parsed);
        }
    }

    #[test]
    fn test_request_default_priority() {
        let json = r#"{
            "client_id": "client-1",
            "model_id": "resnet50",
            "payload": [1, 2, 3],
            "content_type": "image/jpeg"
        }"#;

        let request: ClassifyRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.priority, Priority::Normal);
        assert_eq!(request.payload, vec![1, 2, 3]);
    }
}
