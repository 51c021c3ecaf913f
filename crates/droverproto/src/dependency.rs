//! Canonical dependency descriptors for task submissions.
//!
//! Submissions may spell `after`/`follow` as a bare list of message ids or as
//! the structured `{msg_ids, all, success_only}` form. Everything reaching the
//! scheduler is canonicalized into [`DepSpec`]; any other shape is rejected at
//! the boundary with `bad_dependency`.

use std::collections::HashSet;

use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::error::ErrorKind;

/// A canonicalized dependency set.
///
/// `all` selects all-of semantics (the default); `success_only` counts only
/// successful completions toward satisfaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DepSpec {
    pub msg_ids: HashSet<Uuid>,
    pub all: bool,
    pub success_only: bool,
}

impl Default for DepSpec {
    fn default() -> Self {
        Self {
            msg_ids: HashSet::new(),
            all: true,
            success_only: true,
        }
    }
}

/// Accepted submission shapes, prior to canonicalization.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawDep {
    Ids(Vec<Uuid>),
    Structured {
        msg_ids: Vec<Uuid>,
        #[serde(default = "default_true")]
        all: bool,
        #[serde(default = "default_true")]
        success_only: bool,
    },
}

fn default_true() -> bool {
    true
}

impl<'de> Deserialize<'de> for DepSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = RawDep::deserialize(deserializer)?;
        Ok(match raw {
            RawDep::Ids(ids) => DepSpec {
                msg_ids: ids.into_iter().collect(),
                ..DepSpec::default()
            },
            RawDep::Structured {
                msg_ids,
                all,
                success_only,
            } => DepSpec {
                msg_ids: msg_ids.into_iter().collect(),
                all,
                success_only,
            },
        })
    }
}

impl DepSpec {
    pub fn from_ids(ids: impl IntoIterator<Item = Uuid>) -> Self {
        Self {
            msg_ids: ids.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Parse a submission value, mapping malformed shapes to `bad_dependency`.
    pub fn parse(value: &serde_json::Value) -> Result<Self, ErrorKind> {
        if value.is_null() {
            return Ok(Self::default());
        }
        serde_json::from_value(value.clone())
            .map_err(|e| ErrorKind::bad_dependency(format!("unrecognized dependency form: {}", e)))
    }

    pub fn is_empty(&self) -> bool {
        self.msg_ids.is_empty()
    }

    /// Whether the dependency is satisfied against the given completion sets.
    pub fn satisfied(&self, completed: &HashSet<Uuid>, failed: &HashSet<Uuid>) -> bool {
        if self.msg_ids.is_empty() {
            return true;
        }
        let met = |id: &Uuid| {
            completed.contains(id) || (!self.success_only && failed.contains(id))
        };
        if self.all {
            self.msg_ids.iter().all(met)
        } else {
            self.msg_ids.iter().any(met)
        }
    }

    /// Whether the dependency can never be satisfied, given what has failed.
    ///
    /// Only `success_only` specs become unreachable: a failed id will never
    /// enter the completed set.
    pub fn unreachable(&self, failed: &HashSet<Uuid>) -> bool {
        if self.msg_ids.is_empty() || !self.success_only {
            return false;
        }
        if self.all {
            self.msg_ids.iter().any(|id| failed.contains(id))
        } else {
            self.msg_ids.iter().all(|id| failed.contains(id))
        }
    }
}
