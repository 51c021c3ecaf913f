//! Typed error kinds carried in reply content.
//!
//! Every failure a client can observe is one of these variants. Envelope
//! errors (bad signature, bad serialization) are dropped at the boundary and
//! never reach a reply; they exist here so synthesized replies and logs share
//! one vocabulary.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Outcome of one target in a multi-target dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetOutcome {
    pub engine_id: u32,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Box<ErrorKind>>,
}

/// Errors carried in reply content, tagged by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ErrorKind {
    /// A follow/after constraint was violated, or referred to a failed id
    /// while `success_only` was set.
    UnmetDependency { message: String },

    /// Dependencies were not satisfied within the task's timeout.
    DependencyTimeout { msg_id: Uuid, waited_ms: u64 },

    /// No candidate engine can ever satisfy follow ∩ targets.
    ImpossibleDependency { message: String },

    /// The engine pinned to this request died mid-flight.
    EngineGone { engine_id: u32 },

    /// The engine executed the work and raised.
    RemoteError {
        ename: String,
        evalue: String,
        traceback: Vec<String>,
    },

    /// A multi-target dispatch produced at least one remote error.
    CompositeError { outcomes: Vec<TargetOutcome> },

    /// Registration with an identity that is already alive.
    AlreadyRegistered { identity: String },

    /// A target or query referenced an engine id not in the registry.
    UnknownEngine { engine_id: String },

    /// A query referenced a request id not in the ledger.
    UnknownRequest { msg_id: String },

    /// Envelope HMAC did not verify.
    BadSignature,

    /// Envelope section failed to parse.
    BadSerialization { message: String },

    /// after/follow descriptor was neither an id list nor the structured form.
    BadDependency { message: String },
}

impl ErrorKind {
    pub fn unmet_dependency(message: impl Into<String>) -> Self {
        Self::UnmetDependency {
            message: message.into(),
        }
    }

    pub fn dependency_timeout(msg_id: Uuid, waited_ms: u64) -> Self {
        Self::DependencyTimeout { msg_id, waited_ms }
    }

    pub fn impossible_dependency(message: impl Into<String>) -> Self {
        Self::ImpossibleDependency {
            message: message.into(),
        }
    }

    pub fn engine_gone(engine_id: u32) -> Self {
        Self::EngineGone { engine_id }
    }

    pub fn remote_error(
        ename: impl Into<String>,
        evalue: impl Into<String>,
        traceback: Vec<String>,
    ) -> Self {
        Self::RemoteError {
            ename: ename.into(),
            evalue: evalue.into(),
            traceback,
        }
    }

    pub fn already_registered(identity: impl Into<String>) -> Self {
        Self::AlreadyRegistered {
            identity: identity.into(),
        }
    }

    pub fn unknown_engine(engine_id: impl ToString) -> Self {
        Self::UnknownEngine {
            engine_id: engine_id.to_string(),
        }
    }

    pub fn unknown_request(msg_id: impl ToString) -> Self {
        Self::UnknownRequest {
            msg_id: msg_id.to_string(),
        }
    }

    pub fn bad_serialization(message: impl Into<String>) -> Self {
        Self::BadSerialization {
            message: message.into(),
        }
    }

    pub fn bad_dependency(message: impl Into<String>) -> Self {
        Self::BadDependency {
            message: message.into(),
        }
    }

    /// Stable code for programmatic handling.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnmetDependency { .. } => "unmet_dependency",
            Self::DependencyTimeout { .. } => "dependency_timeout",
            Self::ImpossibleDependency { .. } => "impossible_dependency",
            Self::EngineGone { .. } => "engine_gone",
            Self::RemoteError { .. } => "remote_error",
            Self::CompositeError { .. } => "composite_error",
            Self::AlreadyRegistered { .. } => "already_registered",
            Self::UnknownEngine { .. } => "unknown_engine",
            Self::UnknownRequest { .. } => "unknown_request",
            Self::BadSignature => "bad_signature",
            Self::BadSerialization { .. } => "bad_serialization",
            Self::BadDependency { .. } => "bad_dependency",
        }
    }

    /// Human-readable description.
    pub fn message(&self) -> String {
        match self {
            Self::UnmetDependency { message } => message.clone(),
            Self::DependencyTimeout { msg_id, waited_ms } => {
                format!("dependencies for {} unmet after {}ms", msg_id, waited_ms)
            }
            Self::ImpossibleDependency { message } => message.clone(),
            Self::EngineGone { engine_id } => {
                format!("engine {} died with the request outstanding", engine_id)
            }
            Self::RemoteError { ename, evalue, .. } => format!("{}: {}", ename, evalue),
            Self::CompositeError { outcomes } => {
                let failed = outcomes.iter().filter(|o| !o.ok).count();
                format!("{} of {} targets raised", failed, outcomes.len())
            }
            Self::AlreadyRegistered { identity } => {
                format!("identity {} is already registered", identity)
            }
            Self::UnknownEngine { engine_id } => format!("unknown engine: {}", engine_id),
            Self::UnknownRequest { msg_id } => format!("unknown request: {}", msg_id),
            Self::BadSignature => "message signature did not verify".to_string(),
            Self::BadSerialization { message } => message.clone(),
            Self::BadDependency { message } => message.clone(),
        }
    }
}
