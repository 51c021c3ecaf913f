//! Typed content payloads for the controller's channels.
//!
//! The envelope's `content` frame is JSON; these types give each message kind
//! a concrete shape. Reply content always carries a `status` field, `"ok"` or
//! `"error"`, with error replies embedding an [`ErrorKind`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::dependency::DepSpec;
use crate::error::ErrorKind;

/// Engine-facing connection addresses, returned on registration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineAddrs {
    pub mux: String,
    pub task: String,
    pub control: String,
    pub iopub: String,
    /// Beacon PUB and echo ROUTER endpoints.
    pub heartbeat: (String, String),
}

/// Client-facing connection addresses, returned on connection_request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientAddrs {
    pub mux: String,
    pub task: String,
    pub control: String,
    pub iopub: String,
    pub query: String,
    pub notification: String,
    pub registration: String,
}

/// `registration_request` content: the engine's self-chosen queue identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationRequest {
    pub queue: String,
}

/// Successful `registration_reply` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationReply {
    pub engine_id: u32,
    pub addrs: EngineAddrs,
    /// Current roster: engine_id → queue identity.
    pub engines: BTreeMap<u32, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnregistrationRequest {
    pub engine_id: u32,
}

/// Successful `connection_reply` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionReply {
    pub addrs: ClientAddrs,
    pub engines: BTreeMap<u32, String>,
}

/// `queue_request` content.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueRequest {
    #[serde(default)]
    pub targets: Option<Vec<u32>>,
    #[serde(default)]
    pub verbose: bool,
}

/// Per-engine queue accounting, counts or full id lists depending on
/// `verbose`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EngineStatus {
    Counts {
        queue: usize,
        completed: usize,
        tasks: usize,
    },
    Ids {
        queue: Vec<Uuid>,
        completed: Vec<Uuid>,
        tasks: Vec<Uuid>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueReply {
    pub engines: BTreeMap<u32, EngineStatus>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PurgeRequest {
    #[serde(default)]
    pub msg_ids: Vec<Uuid>,
    #[serde(default)]
    pub targets: Vec<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultRequest {
    pub msg_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResubmitRequest {
    pub msg_ids: Vec<Uuid>,
}

/// Original id → freshly assigned id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResubmitReply {
    pub resubmitted: BTreeMap<Uuid, Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryReply {
    pub history: Vec<Uuid>,
}

/// `db_request` content: a flat equality selector, optionally restricted to
/// named record fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbRequest {
    pub selector: Value,
    #[serde(default)]
    pub keys: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbortRequest {
    pub msg_ids: Vec<Uuid>,
}

/// Scheduler → hub binding record, published on the monitor bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDestination {
    pub msg_id: Uuid,
    pub engine_id: u32,
}

/// Roster change events on the notification bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationNotification {
    pub engine_id: u32,
    pub queue: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnregistrationNotification {
    pub engine_id: u32,
    pub queue: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AbortNotification {
    pub msg_ids: Vec<Uuid>,
}

/// The dependency subheader of a task submission, read from `metadata`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TaskSubHeader {
    #[serde(default)]
    pub after: DepSpec,
    #[serde(default)]
    pub follow: DepSpec,
    /// Fractional seconds, measured from scheduler receipt.
    #[serde(default)]
    pub timeout: Option<f64>,
    /// Engine id filter; empty means unrestricted.
    #[serde(default)]
    pub targets: Vec<u32>,
}

impl TaskSubHeader {
    /// Canonicalize the subheader out of a metadata frame.
    ///
    /// Missing fields default to empty; malformed dependency descriptors are
    /// a `bad_dependency` error, anything else malformed is
    /// `bad_serialization`.
    pub fn from_metadata(metadata: &Value) -> Result<Self, ErrorKind> {
        let obj = match metadata {
            Value::Null => return Ok(Self::default()),
            Value::Object(map) => map,
            other => {
                return Err(ErrorKind::bad_serialization(format!(
                    "metadata must be an object, got {}",
                    other
                )))
            }
        };
        let after = DepSpec::parse(obj.get("after").unwrap_or(&Value::Null))?;
        let follow = DepSpec::parse(obj.get("follow").unwrap_or(&Value::Null))?;
        let timeout = match obj.get("timeout") {
            None | Some(Value::Null) => None,
            Some(v) => Some(v.as_f64().ok_or_else(|| {
                ErrorKind::bad_serialization(format!("timeout must be a number, got {}", v))
            })?),
        };
        let targets = match obj.get("targets") {
            None | Some(Value::Null) => Vec::new(),
            Some(v) => serde_json::from_value(v.clone()).map_err(|_| {
                ErrorKind::bad_serialization(format!(
                    "targets must be a list of engine ids, got {}",
                    v
                ))
            })?,
        };
        Ok(Self {
            after,
            follow,
            timeout,
            targets,
        })
    }

    pub fn has_dependencies(&self) -> bool {
        !self.after.is_empty() || !self.follow.is_empty() || !self.targets.is_empty()
    }
}

/// Wrap a serializable body as `{"status": "ok", ...body}`.
pub fn ok_content<T: Serialize>(body: &T) -> Value {
    let mut value = serde_json::to_value(body).unwrap_or_else(|_| Value::Object(Default::default()));
    if let Value::Object(map) = &mut value {
        map.insert("status".into(), Value::String("ok".into()));
    }
    value
}

/// Build error reply content from an [`ErrorKind`].
pub fn error_content(kind: &ErrorKind) -> Value {
    serde_json::json!({
        "status": "error",
        "ename": kind.code(),
        "evalue": kind.message(),
        "error": kind,
    })
}

/// The `status` field of reply content, if present.
pub fn status_of(content: &Value) -> Option<&str> {
    content.get("status").and_then(Value::as_str)
}

pub fn is_ok(content: &Value) -> bool {
    status_of(content) == Some("ok")
}

/// Recover a typed error from reply content.
///
/// Structured errors round-trip through the `error` field; engine-raised
/// errors that only carry `ename`/`evalue`/`traceback` become `RemoteError`.
pub fn error_of(content: &Value) -> Option<ErrorKind> {
    if status_of(content)? != "error" {
        return None;
    }
    if let Some(err) = content.get("error") {
        if let Ok(kind) = serde_json::from_value::<ErrorKind>(err.clone()) {
            return Some(kind);
        }
    }
    let ename = content.get("ename").and_then(Value::as_str).unwrap_or("Error");
    let evalue = content.get("evalue").and_then(Value::as_str).unwrap_or("");
    let traceback = content
        .get("traceback")
        .and_then(|t| serde_json::from_value(t.clone()).ok())
        .unwrap_or_default();
    Some(ErrorKind::remote_error(ename, evalue, traceback))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn subheader_defaults_are_empty() {
        let sub = TaskSubHeader::from_metadata(&json!({})).unwrap();
        assert!(!sub.has_dependencies());
        assert!(sub.timeout.is_none());
    }

    #[test]
    fn subheader_parses_mixed_forms() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let sub = TaskSubHeader::from_metadata(&json!({
            "after": [a],
            "follow": {"msg_ids": [b], "all": false, "success_only": false},
            "timeout": 0.5,
            "targets": [1, 3],
        }))
        .unwrap();
        assert!(sub.after.msg_ids.contains(&a));
        assert!(sub.after.all);
        assert!(!sub.follow.all);
        assert!(!sub.follow.success_only);
        assert_eq!(sub.timeout, Some(0.5));
        assert_eq!(sub.targets, vec![1, 3]);
        assert!(sub.has_dependencies());
    }

    #[test]
    fn subheader_rejects_malformed_dependency() {
        let err = TaskSubHeader::from_metadata(&json!({"after": {"nope": 1}})).unwrap_err();
        assert_eq!(err.code(), "bad_dependency");
    }

    #[test]
    fn subheader_rejects_malformed_targets() {
        let err =
            TaskSubHeader::from_metadata(&json!({"targets": ["engine-one"]})).unwrap_err();
        assert_eq!(err.code(), "bad_serialization");
    }

    #[test]
    fn ok_and_error_content_shapes() {
        let ok = ok_content(&json!({"engine_id": 2}));
        assert!(is_ok(&ok));
        assert_eq!(ok["engine_id"], 2);

        let err = error_content(&ErrorKind::engine_gone(4));
        assert_eq!(status_of(&err), Some("error"));
        assert_eq!(
            error_of(&err),
            Some(ErrorKind::engine_gone(4)),
        );
    }

    #[test]
    fn engine_raised_error_becomes_remote() {
        let content = json!({
            "status": "error",
            "ename": "ValueError",
            "evalue": "bad input",
            "traceback": ["frame one"],
        });
        let kind = error_of(&content).unwrap();
        assert_eq!(
            kind,
            ErrorKind::remote_error("ValueError", "bad input", vec!["frame one".into()])
        );
    }

    #[test]
    fn queue_status_counts_and_ids_roundtrip() {
        let counts = EngineStatus::Counts {
            queue: 1,
            completed: 2,
            tasks: 0,
        };
        let v = serde_json::to_value(&counts).unwrap();
        assert_eq!(serde_json::from_value::<EngineStatus>(v).unwrap(), counts);

        let ids = EngineStatus::Ids {
            queue: vec![Uuid::new_v4()],
            completed: vec![],
            tasks: vec![],
        };
        let v = serde_json::to_value(&ids).unwrap();
        assert_eq!(serde_json::from_value::<EngineStatus>(v).unwrap(), ids);
    }
}
