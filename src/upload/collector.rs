//! Trait abstraction for the remote collector to enable testing
//!
//! Batches are posted as JSON:
//!
//! ```json
//! {"segment": "seg-000001", "first_index": 8,
//!  "records": [{"timestamp": 1735689600, "temperatures": [21.5, ...]}]}
//! ```
//!
//! and acknowledged with `{"highest_index": 15}`, the index of the last record
//! the collector has durably stored.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::TransportError;
use crate::storage::ArchivedRecord;

/// One record as sent to the collector
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadRecord {
    /// Unix seconds
    pub timestamp: i64,
    /// Row-major matrix values (°C)
    pub temperatures: Vec<f32>,
}

impl From<&ArchivedRecord> for UploadRecord {
    fn from(record: &ArchivedRecord) -> Self {
        Self {
            timestamp: record.sample.timestamp().timestamp(),
            temperatures: record.sample.values().to_vec(),
        }
    }
}

/// Consecutive records of one archive segment
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordBatch {
    pub segment: String,
    pub first_index: u32,
    pub records: Vec<UploadRecord>,
}

impl RecordBatch {
    /// Index one past the last record of the batch
    pub fn end_index(&self) -> u32 {
        self.first_index + self.records.len() as u32
    }
}

/// Collector's positive acknowledgment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct CollectorAck {
    /// Highest record index stored by the collector (inclusive)
    pub highest_index: u32,
}

/// Remote collector
#[async_trait]
pub trait Collector: Send + Sync {
    /// Deliver a batch; success means the collector stored it
    async fn send(&self, batch: &RecordBatch) -> Result<CollectorAck, TransportError>;
}

/// JSON-over-HTTP collector
pub struct HttpCollector {
    url: String,
    agent: ureq::Agent,
}

impl HttpCollector {
    /// Create a collector posting to `url`
    pub fn new(url: &str, timeout: Duration) -> Self {
        Self {
            url: url.to_string(),
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
        }
    }

    /// Endpoint receiving batches
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Collector for HttpCollector {
    async fn send(&self, batch: &RecordBatch) -> Result<CollectorAck, TransportError> {
        let body = serde_json::to_value(batch).map_err(|e| TransportError::Malformed(e.to_string()))?;
        let agent = self.agent.clone();
        let url = self.url.clone();

        // ureq is blocking
        let response = tokio::task::spawn_blocking(move || agent.post(&url).send_json(body))
            .await
            .map_err(|e| TransportError::Unreachable(e.to_string()))?;

        match response {
            Ok(resp) => resp
                .into_json::<CollectorAck>()
                .map_err(|e| TransportError::Malformed(e.to_string())),
            Err(ureq::Error::Status(status, _)) => Err(TransportError::Rejected { status }),
            Err(ureq::Error::Transport(t)) => Err(TransportError::Unreachable(t.to_string())),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_json_shape() {
        let batch = RecordBatch {
            segment: "seg-000002".to_string(),
            first_index: 8,
            records: vec![UploadRecord {
                timestamp: 1_735_689_600,
                temperatures: vec![21.5, 22.25],
            }],
        };
        let json = serde_json::to_value(&batch).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "segment": "seg-000002",
                "first_index": 8,
                "records": [{"timestamp": 1_735_689_600i64, "temperatures": [21.5, 22.25]}]
            })
        );
        assert_eq!(batch.end_index(), 9);
    }

    #[test]
    fn test_ack_parsing() {
        let ack: CollectorAck = serde_json::from_str(r#"{"highest_index": 15, "status": "ok"}"#).unwrap();
        assert_eq!(ack.highest_index, 15);
        assert!(serde_json::from_str::<CollectorAck>(r#"{"ok": true}"#).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_collector() {
        // Nothing listens on port 9 of localhost in the test environment
        let collector = HttpCollector::new("http://127.0.0.1:9/upload", Duration::from_millis(500));
        let batch = RecordBatch {
            segment: "seg-000001".to_string(),
            first_index: 0,
            records: Vec::new(),
        };
        let result = collector.send(&batch).await;
        assert!(matches!(result, Err(TransportError::Unreachable(_))));
    }
}
