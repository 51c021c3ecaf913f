//! Engine roster and client bookkeeping, owned by the hub worker.
//!
//! Engines move through `registered -> alive -> dead`. Registration assigns
//! the engine id and records the queue identity; the first heartbeat echo
//! makes the engine alive; the heart monitor alone drives `alive -> dead`.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use droverproto::ErrorKind;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Registered, waiting for its first heartbeat echo.
    Registered,
    Alive,
}

/// One connected engine.
#[derive(Debug, Clone)]
pub struct EngineRecord {
    pub engine_id: u32,
    /// Routing identity on the mux/task/heartbeat channels.
    pub ident: Bytes,
    /// The identity as registered, for display and notifications.
    pub queue_name: String,
    pub state: EngineState,
    /// Direct requests dispatched and not yet answered, in dispatch order.
    pub queue: VecDeque<Uuid>,
    /// Successfully returned request ids.
    pub completed: HashSet<Uuid>,
    /// Load-balanced request ids currently dispatched here.
    pub tasks: HashSet<Uuid>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl EngineRecord {
    fn new(engine_id: u32, queue_name: String) -> Self {
        Self {
            engine_id,
            ident: Bytes::from(queue_name.clone().into_bytes()),
            queue_name,
            state: EngineState::Registered,
            queue: VecDeque::new(),
            completed: HashSet::new(),
            tasks: HashSet::new(),
            registered_at: Utc::now(),
            last_heartbeat: None,
        }
    }
}

/// The authoritative engine table.
#[derive(Debug, Default)]
pub struct EngineRegistry {
    engines: HashMap<u32, EngineRecord>,
    by_ident: HashMap<Bytes, u32>,
    next_id: u32,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh identity and assign the next engine id.
    pub fn register(&mut self, queue_name: &str) -> Result<u32, ErrorKind> {
        let ident = Bytes::from(queue_name.as_bytes().to_vec());
        if self.by_ident.contains_key(&ident) {
            return Err(ErrorKind::already_registered(queue_name));
        }
        let engine_id = self.next_id;
        self.next_id += 1;
        self.by_ident.insert(ident, engine_id);
        self.engines
            .insert(engine_id, EngineRecord::new(engine_id, queue_name.to_string()));
        Ok(engine_id)
    }

    /// First heartbeat echo observed: `registered -> alive`.
    /// Returns the engine id when this actually activated a pending engine.
    pub fn activate(&mut self, ident: &Bytes) -> Option<u32> {
        let id = *self.by_ident.get(ident)?;
        let engine = self.engines.get_mut(&id)?;
        engine.last_heartbeat = Some(Utc::now());
        if engine.state == EngineState::Registered {
            engine.state = EngineState::Alive;
            Some(id)
        } else {
            None
        }
    }

    /// Remove an engine (death or graceful unregistration). The caller drains
    /// the returned record's queue and task sets.
    pub fn remove_by_ident(&mut self, ident: &Bytes) -> Option<EngineRecord> {
        let id = self.by_ident.remove(ident)?;
        self.engines.remove(&id)
    }

    pub fn remove(&mut self, engine_id: u32) -> Option<EngineRecord> {
        let record = self.engines.remove(&engine_id)?;
        self.by_ident.remove(&record.ident);
        Some(record)
    }

    pub fn get(&self, engine_id: u32) -> Option<&EngineRecord> {
        self.engines.get(&engine_id)
    }

    pub fn get_mut(&mut self, engine_id: u32) -> Option<&mut EngineRecord> {
        self.engines.get_mut(&engine_id)
    }

    pub fn id_of(&self, ident: &Bytes) -> Option<u32> {
        self.by_ident.get(ident).copied()
    }

    pub fn by_ident_mut(&mut self, ident: &Bytes) -> Option<&mut EngineRecord> {
        let id = *self.by_ident.get(ident)?;
        self.engines.get_mut(&id)
    }

    pub fn contains(&self, engine_id: u32) -> bool {
        self.engines.contains_key(&engine_id)
    }

    pub fn len(&self) -> usize {
        self.engines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EngineRecord> {
        self.engines.values()
    }

    /// engine_id → queue identity, for registration/connection replies.
    pub fn roster(&self) -> BTreeMap<u32, String> {
        self.engines
            .values()
            .map(|e| (e.engine_id, e.queue_name.clone()))
            .collect()
    }

    /// Drop registered-but-silent engines older than the cutoff.
    pub fn purge_stale_pending(&mut self, older_than: chrono::Duration) -> Vec<EngineRecord> {
        let cutoff = Utc::now() - older_than;
        let stale: Vec<u32> = self
            .engines
            .values()
            .filter(|e| e.state == EngineState::Registered && e.registered_at < cutoff)
            .map(|e| e.engine_id)
            .collect();
        stale.into_iter().filter_map(|id| self.remove(id)).collect()
    }
}

/// One known client; created on first contact, never collected.
#[derive(Debug, Clone)]
pub struct ClientRecord {
    pub ident: Bytes,
    pub session: String,
    /// Every request id this client submitted, in order.
    pub history: Vec<Uuid>,
    pub outstanding: HashSet<Uuid>,
}

impl ClientRecord {
    pub fn new(ident: Bytes, session: String) -> Self {
        Self {
            ident,
            session,
            history: Vec::new(),
            outstanding: HashSet::new(),
        }
    }
}

/// Format a routing identity for logging.
pub fn hex_ident(ident: &Bytes) -> String {
    if ident.len() <= 12 {
        match std::str::from_utf8(ident) {
            Ok(s) if s.chars().all(|c| c.is_ascii_graphic()) => s.to_string(),
            _ => hex::encode(ident),
        }
    } else {
        format!("{}...", hex::encode(&ident[..8]))
    }
}
