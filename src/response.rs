//! # Wire Responses
//!
//! The reply to every request is the JSON form of a [`Response`], tagged by
//! `type`. Structured values only: no stack traces or debug formatting ever
//! cross the wire; an error reply carries a single human-readable message.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::types::{DatasetId, IndexType, IteratorId, TaskSpec};

// =============================================================================
// Query Statistics
// =============================================================================

/// Counters reported alongside query results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueryCounters {
    /// Datasets visited by the scan.
    pub datasets_scanned: u64,
    /// Files whose contents were examined.
    pub files_scanned: u64,
    /// Files that matched the query.
    pub files_matched: u64,
}

// =============================================================================
// Topology Entries
// =============================================================================

/// One index of a dataset, as reported by `topology`.
#[derive(Debug, Clone, Serialize)]
pub struct IndexEntry {
    #[serde(rename = "type")]
    pub index_type: IndexType,
    pub size: u64,
}

/// One dataset, as reported by `topology`.
///
/// `size` is the sum of the contained index sizes.
#[derive(Debug, Clone, Serialize)]
pub struct DatasetEntry {
    pub id: DatasetId,
    pub size: u64,
    pub file_count: u64,
    pub taints: Vec<String>,
    pub indexes: Vec<IndexEntry>,
}

// =============================================================================
// Response
// =============================================================================

/// Every reply this server can produce.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// The command succeeded and has nothing further to report.
    Ok,
    /// A recoverable failure, with its message.
    Error { error: String },
    /// Reply to `ping`.
    Ping { connection_id: String },
    /// In-memory query results.
    Select {
        files: Vec<String>,
        counters: QueryCounters,
    },
    /// Query results materialized into a durable iterator.
    SelectIterator {
        iterator_id: IteratorId,
        file_count: u64,
        counters: QueryCounters,
    },
    /// Entries popped off an iterator.
    IteratorPop {
        files: Vec<String>,
        iterator_position: u64,
        total_files: u64,
    },
    /// Active tasks.
    Status { tasks: Vec<TaskSpec> },
    /// Every published dataset with its indexes.
    Topology { datasets: Vec<DatasetEntry> },
    /// Config keys and their current values.
    Config { keys: BTreeMap<String, u64> },
}

impl Response {
    pub fn ok() -> Self {
        Response::Ok
    }

    pub fn error(message: impl Into<String>) -> Self {
        Response::Error {
            error: message.into(),
        }
    }

    pub fn ping(connection_id: impl Into<String>) -> Self {
        Response::Ping {
            connection_id: connection_id.into(),
        }
    }

    pub fn select(files: Vec<String>, counters: QueryCounters) -> Self {
        Response::Select { files, counters }
    }

    pub fn select_iterator(
        iterator_id: IteratorId,
        file_count: u64,
        counters: QueryCounters,
    ) -> Self {
        Response::SelectIterator {
            iterator_id,
            file_count,
            counters,
        }
    }

    pub fn iterator_pop(files: Vec<String>, iterator_position: u64, total_files: u64) -> Self {
        Response::IteratorPop {
            files,
            iterator_position,
            total_files,
        }
    }

    pub fn status(tasks: Vec<TaskSpec>) -> Self {
        Response::Status { tasks }
    }

    pub fn topology(datasets: Vec<DatasetEntry>) -> Self {
        Response::Topology { datasets }
    }

    pub fn config(keys: BTreeMap<String, u64>) -> Self {
        Response::Config { keys }
    }

    /// Serializes the response to its wire string.
    ///
    /// Serialization of these types cannot fail in practice; if it ever
    /// does, the client still gets a well-formed error reply.
    pub fn to_wire(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!("{{\"type\":\"error\",\"error\":\"response serialization failed: {}\"}}", e)
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TaskId;

    #[test]
    fn test_ping_wire_shape() {
        let wire = Response::ping("c0ffee01").to_wire();
        assert_eq!(wire, r#"{"type":"ping","connection_id":"c0ffee01"}"#);
    }

    #[test]
    fn test_ok_and_error_wire_shape() {
        assert_eq!(Response::ok().to_wire(), r#"{"type":"ok"}"#);
        assert_eq!(
            Response::error("Value specified is out of range").to_wire(),
            r#"{"type":"error","error":"Value specified is out of range"}"#
        );
    }

    #[test]
    fn test_select_iterator_wire_shape() {
        let wire = Response::select_iterator(IteratorId::new("ab12"), 3, QueryCounters::default())
            .to_wire();
        let parsed: serde_json::Value = serde_json::from_str(&wire).unwrap();
        assert_eq!(parsed["type"], "select_iterator");
        assert_eq!(parsed["iterator_id"], "ab12");
        assert_eq!(parsed["file_count"], 3);
    }

    #[test]
    fn test_topology_sums_are_callers_job() {
        // The entry carries whatever size the executor computed; topology
        // serialization itself adds nothing.
        let entry = DatasetEntry {
            id: DatasetId::new("set_1"),
            size: 30,
            file_count: 2,
            taints: vec!["evil".to_string()],
            indexes: vec![
                IndexEntry {
                    index_type: IndexType::Gram3,
                    size: 10,
                },
                IndexEntry {
                    index_type: IndexType::Text4,
                    size: 20,
                },
            ],
        };
        let parsed: serde_json::Value =
            serde_json::from_str(&Response::topology(vec![entry]).to_wire()).unwrap();
        assert_eq!(parsed["datasets"][0]["indexes"][0]["type"], "gram3");
        assert_eq!(parsed["datasets"][0]["size"], 30);
    }

    #[test]
    fn test_status_wire_shape() {
        let tasks = vec![TaskSpec {
            id: TaskId::from_raw(7),
            connection: "00ff".to_string(),
            request: "status;".to_string(),
        }];
        let parsed: serde_json::Value =
            serde_json::from_str(&Response::status(tasks).to_wire()).unwrap();
        assert_eq!(parsed["tasks"][0]["id"], 7);
        assert_eq!(parsed["tasks"][0]["request"], "status;");
    }
}
