//! Request record storage behind a narrow backend trait.
//!
//! The hub worker is the only owner; no locking, no transactions. Selectors
//! are flat JSON objects matched by field equality, with `{"$in": [...]}`
//! accepted per field. Two implementations: a HashMap store and a
//! one-document-per-record directory store that survives restarts.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::Value;
use uuid::Uuid;

use crate::records::RequestRecord;

/// Capability set required of a record store.
pub trait DbBackend: Send {
    fn upsert(&mut self, record: &RequestRecord) -> Result<()>;
    fn get(&self, msg_id: Uuid) -> Result<Option<RequestRecord>>;
    fn get_many(&self, msg_ids: &[Uuid]) -> Result<Vec<RequestRecord>>;
    fn find(&self, selector: &Value) -> Result<Vec<RequestRecord>>;
    fn drop_ids(&mut self, msg_ids: &[Uuid]) -> Result<usize>;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read-modify-write helper; returns false when the id is unknown.
    fn update(&mut self, msg_id: Uuid, apply: &mut dyn FnMut(&mut RequestRecord)) -> Result<bool> {
        match self.get(msg_id)? {
            Some(mut record) => {
                apply(&mut record);
                self.upsert(&record)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Whether a record document matches a flat equality selector.
fn matches(doc: &Value, selector: &Value) -> bool {
    let Some(fields) = selector.as_object() else {
        return false;
    };
    fields.iter().all(|(key, want)| {
        let got = doc.get(key).unwrap_or(&Value::Null);
        match want.get("$in").and_then(Value::as_array) {
            Some(choices) => choices.contains(got),
            None => got == want,
        }
    })
}

/// In-memory store; insertion order is preserved for scans.
#[derive(Default)]
pub struct MemBackend {
    records: HashMap<Uuid, RequestRecord>,
    order: Vec<Uuid>,
}

impl MemBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DbBackend for MemBackend {
    fn upsert(&mut self, record: &RequestRecord) -> Result<()> {
        if self.records.insert(record.msg_id, record.clone()).is_none() {
            self.order.push(record.msg_id);
        }
        Ok(())
    }

    fn get(&self, msg_id: Uuid) -> Result<Option<RequestRecord>> {
        Ok(self.records.get(&msg_id).cloned())
    }

    fn get_many(&self, msg_ids: &[Uuid]) -> Result<Vec<RequestRecord>> {
        Ok(msg_ids
            .iter()
            .filter_map(|id| self.records.get(id).cloned())
            .collect())
    }

    fn find(&self, selector: &Value) -> Result<Vec<RequestRecord>> {
        let mut out = Vec::new();
        for id in &self.order {
            let Some(record) = self.records.get(id) else {
                continue;
            };
            let doc = serde_json::to_value(record)?;
            if matches(&doc, selector) {
                out.push(record.clone());
            }
        }
        Ok(out)
    }

    fn drop_ids(&mut self, msg_ids: &[Uuid]) -> Result<usize> {
        let mut dropped = 0;
        for id in msg_ids {
            if self.records.remove(id).is_some() {
                dropped += 1;
            }
        }
        self.order.retain(|id| self.records.contains_key(id));
        Ok(dropped)
    }

    fn len(&self) -> usize {
        self.records.len()
    }
}

/// Directory-backed store: one pretty-printed JSON document per record.
pub struct DocBackend {
    dir: PathBuf,
    /// msg_id in insertion order; rebuilt from the directory on open.
    index: Vec<Uuid>,
}

impl DocBackend {
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create db directory {}", dir.display()))?;
        let mut index = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().is_some_and(|e| e == "json") {
                if let Some(id) = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .and_then(|s| s.parse::<Uuid>().ok())
                {
                    index.push(id);
                }
            }
        }
        index.sort();
        Ok(Self {
            dir: dir.to_path_buf(),
            index,
        })
    }

    fn path_for(&self, msg_id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.json", msg_id))
    }

    fn read(&self, msg_id: Uuid) -> Result<Option<RequestRecord>> {
        let path = self.path_for(msg_id);
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read(&path)
            .with_context(|| format!("failed to read record {}", path.display()))?;
        let record = serde_json::from_slice(&raw)
            .with_context(|| format!("corrupt record document {}", path.display()))?;
        Ok(Some(record))
    }
}

impl DbBackend for DocBackend {
    fn upsert(&mut self, record: &RequestRecord) -> Result<()> {
        let path = self.path_for(record.msg_id);
        let fresh = !path.exists();
        let raw = serde_json::to_vec_pretty(record)?;
        std::fs::write(&path, raw)
            .with_context(|| format!("failed to write record {}", path.display()))?;
        if fresh {
            self.index.push(record.msg_id);
        }
        Ok(())
    }

    fn get(&self, msg_id: Uuid) -> Result<Option<RequestRecord>> {
        self.read(msg_id)
    }

    fn get_many(&self, msg_ids: &[Uuid]) -> Result<Vec<RequestRecord>> {
        let mut out = Vec::new();
        for id in msg_ids {
            if let Some(record) = self.read(*id)? {
                out.push(record);
            }
        }
        Ok(out)
    }

    fn find(&self, selector: &Value) -> Result<Vec<RequestRecord>> {
        let mut out = Vec::new();
        for id in &self.index {
            if let Some(record) = self.read(*id)? {
                let doc = serde_json::to_value(&record)?;
                if matches(&doc, selector) {
                    out.push(record);
                }
            }
        }
        Ok(out)
    }

    fn drop_ids(&mut self, msg_ids: &[Uuid]) -> Result<usize> {
        let mut dropped = 0;
        for id in msg_ids {
            let path = self.path_for(*id);
            if path.exists() {
                std::fs::remove_file(&path)
                    .with_context(|| format!("failed to remove record {}", path.display()))?;
                dropped += 1;
            }
        }
        self.index.retain(|id| !msg_ids.contains(id));
        Ok(dropped)
    }

    fn len(&self) -> usize {
        self.index.len()
    }
}
