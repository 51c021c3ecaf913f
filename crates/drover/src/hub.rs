//! The hub: authoritative engine registry and request ledger.
//!
//! The hub never forwards work itself - the monitored queues and the
//! scheduler do. It watches the monitor bus to keep the ledger current,
//! answers registration and client queries over its request/reply sockets,
//! and publishes roster changes on the notification bus. Engine death is
//! driven exclusively by the heart monitor's events.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use droverproto::content::{
    AbortNotification, AbortRequest, ClientAddrs, ConnectionReply, DbRequest, EngineAddrs,
    EngineStatus, HistoryReply, PurgeRequest, QueueReply, QueueRequest, RegistrationNotification,
    RegistrationReply, ResubmitReply, ResubmitRequest, ResultRequest, TaskDestination,
    UnregistrationNotification, UnregistrationRequest,
};
use droverproto::socket::{
    to_frames, to_multipart, DealerSocket, PublisherSocket, RouterSocket, SubscriberSocket,
};
use droverproto::{
    error_content, is_ok, ok_content, ErrorKind, Header, Message, MsgType, Session,
};

use crate::db::DbBackend;
use crate::heartmonitor::HeartEvent;
use crate::records::{decode_buffers, encode_buffers, Channel, RequestRecord, RequestStatus};
use crate::registry::{hex_ident, ClientRecord, EngineRegistry};

/// Frames to put on the wire, produced by the core.
#[derive(Debug)]
pub enum Outbound {
    /// Registration router reply.
    Registration(Vec<Bytes>),
    /// Client query router reply.
    Query(Vec<Bytes>),
    /// Notification publisher broadcast.
    Notify(Vec<Bytes>),
    /// Resubmission onto the task client channel, via the hub's dealer.
    Resubmit(Vec<Bytes>),
    /// Ripple shutdown to every worker.
    Shutdown,
}

/// Hub state machine, free of sockets.
pub struct HubCore {
    session: Session,
    db: Box<dyn DbBackend>,
    engines: EngineRegistry,
    clients: HashMap<Bytes, ClientRecord>,
    engine_addrs: EngineAddrs,
    client_addrs: ClientAddrs,
    /// Identity of the hub's own task dealer; its submissions skip client
    /// bookkeeping.
    resubmit_ident: Bytes,
}

impl HubCore {
    pub fn new(
        session: Session,
        db: Box<dyn DbBackend>,
        engine_addrs: EngineAddrs,
        client_addrs: ClientAddrs,
        resubmit_ident: Bytes,
    ) -> Self {
        Self {
            session,
            db,
            engines: EngineRegistry::new(),
            clients: HashMap::new(),
            engine_addrs,
            client_addrs,
            resubmit_ident,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    fn reply_frames(
        &self,
        msg_type: MsgType,
        parent: &Header,
        idents: &[Bytes],
        content: Value,
    ) -> Option<Vec<Bytes>> {
        let reply = self
            .session
            .reply(msg_type, parent, content)
            .with_idents(idents.to_vec());
        match self.session.serialize(&reply) {
            Ok(frames) => Some(frames),
            Err(e) => {
                warn!("failed to serialize reply: {}", e);
                None
            }
        }
    }

    fn notify_frames(&self, msg_type: MsgType, content: Value) -> Option<Vec<Bytes>> {
        let msg = self.session.msg(msg_type, content);
        match self.session.serialize(&msg) {
            Ok(frames) => Some(frames),
            Err(e) => {
                warn!("failed to serialize notification: {}", e);
                None
            }
        }
    }

    fn ensure_client(&mut self, ident: &Bytes, session: &str) -> &mut ClientRecord {
        self.clients
            .entry(ident.clone())
            .or_insert_with(|| ClientRecord::new(ident.clone(), session.to_string()))
    }

    fn client_mut_by_hex(&mut self, hexid: &str) -> Option<&mut ClientRecord> {
        self.clients
            .values_mut()
            .find(|c| hex::encode(&c.ident) == hexid)
    }

    /// Registration socket traffic.
    pub fn handle_registration(&mut self, frames: Vec<Bytes>) -> Vec<Outbound> {
        let msg = match self.session.deserialize(&frames) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("dropping bad frame on registration socket: {}", e);
                return Vec::new();
            }
        };
        let idents = msg.idents.clone();
        let respond = |frames: Option<Vec<Bytes>>| frames.into_iter().map(Outbound::Registration);

        match msg.msg_type() {
            MsgType::RegistrationRequest => {
                let queue = match msg.content.get("queue").and_then(Value::as_str) {
                    Some(queue) => queue.to_string(),
                    None => {
                        let kind =
                            ErrorKind::bad_serialization("registration_request missing queue");
                        return respond(self.reply_frames(
                            MsgType::RegistrationReply,
                            &msg.header,
                            &idents,
                            error_content(&kind),
                        ))
                        .collect();
                    }
                };
                let content = match self.engines.register(&queue) {
                    Ok(engine_id) => {
                        info!(engine_id, queue = %queue, "engine registered");
                        ok_content(&RegistrationReply {
                            engine_id,
                            addrs: self.engine_addrs.clone(),
                            engines: self.engines.roster(),
                        })
                    }
                    Err(kind) => {
                        warn!(queue = %queue, "duplicate registration rejected");
                        error_content(&kind)
                    }
                };
                respond(self.reply_frames(
                    MsgType::RegistrationReply,
                    &msg.header,
                    &idents,
                    content,
                ))
                .collect()
            }
            MsgType::UnregistrationRequest => {
                let mut out = Vec::new();
                let content =
                    match serde_json::from_value::<UnregistrationRequest>(msg.content.clone()) {
                        Ok(req) => match self.engines.remove(req.engine_id) {
                            Some(record) => {
                                info!(engine_id = req.engine_id, "engine unregistered");
                                out.extend(self.engine_departed(record));
                                ok_content(&json!({"engine_id": req.engine_id}))
                            }
                            None => error_content(&ErrorKind::unknown_engine(req.engine_id)),
                        },
                        Err(e) => error_content(&ErrorKind::bad_serialization(e.to_string())),
                    };
                out.extend(respond(self.reply_frames(
                    MsgType::UnregistrationReply,
                    &msg.header,
                    &idents,
                    content,
                )));
                out
            }
            MsgType::ConnectionRequest => {
                if let Some(ident) = idents.first() {
                    let session = msg.header.session.clone();
                    self.ensure_client(ident, &session);
                }
                let content = ok_content(&ConnectionReply {
                    addrs: self.client_addrs.clone(),
                    engines: self.engines.roster(),
                });
                respond(self.reply_frames(
                    MsgType::ConnectionReply,
                    &msg.header,
                    &idents,
                    content,
                ))
                .collect()
            }
            MsgType::ShutdownRequest => self.shutdown_requested(
                MsgType::ShutdownReply,
                &msg.header,
                &idents,
                Outbound::Registration,
            ),
            other => {
                let kind =
                    ErrorKind::bad_serialization(format!("unsupported on registration: {:?}", other));
                respond(self.reply_frames(
                    MsgType::RegistrationReply,
                    &msg.header,
                    &idents,
                    error_content(&kind),
                ))
                .collect()
            }
        }
    }

    fn shutdown_requested(
        &mut self,
        reply_type: MsgType,
        parent: &Header,
        idents: &[Bytes],
        wrap: fn(Vec<Bytes>) -> Outbound,
    ) -> Vec<Outbound> {
        info!("shutdown requested");
        let mut out = Vec::new();
        if let Some(frames) = self.reply_frames(reply_type, parent, idents, ok_content(&json!({})))
        {
            out.push(wrap(frames));
        }
        if let Some(frames) = self.notify_frames(MsgType::ShutdownNotification, json!({})) {
            out.push(Outbound::Notify(frames));
        }
        out.push(Outbound::Shutdown);
        out
    }

    /// Client query socket traffic.
    pub fn handle_query(&mut self, frames: Vec<Bytes>) -> Vec<Outbound> {
        let msg = match self.session.deserialize(&frames) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("dropping bad frame on query socket: {}", e);
                return Vec::new();
            }
        };
        let idents = msg.idents.clone();
        if let Some(ident) = idents.first() {
            let session = msg.header.session.clone();
            self.ensure_client(ident, &session);
        }

        let reply_type = msg.msg_type().reply_type().unwrap_or(MsgType::DbReply);
        let content = match msg.msg_type() {
            MsgType::QueueRequest => self.queue_status(&msg.content),
            MsgType::ResultRequest => self.get_results(&msg.content),
            MsgType::PurgeRequest => self.purge_results(&msg.content),
            MsgType::HistoryRequest => {
                let history = idents
                    .first()
                    .and_then(|ident| self.clients.get(ident))
                    .map(|c| c.history.clone())
                    .unwrap_or_default();
                ok_content(&HistoryReply { history })
            }
            MsgType::DbRequest => self.db_query(&msg.content),
            MsgType::ConnectionRequest => ok_content(&ConnectionReply {
                addrs: self.client_addrs.clone(),
                engines: self.engines.roster(),
            }),
            MsgType::ResubmitRequest => {
                let mut out = Vec::new();
                let content = self.resubmit(&msg.content, &mut out);
                if let Some(frames) =
                    self.reply_frames(MsgType::ResubmitReply, &msg.header, &idents, content)
                {
                    out.push(Outbound::Query(frames));
                }
                return out;
            }
            MsgType::ShutdownRequest => {
                return self.shutdown_requested(
                    MsgType::ShutdownReply,
                    &msg.header,
                    &idents,
                    Outbound::Query,
                )
            }
            other => error_content(&ErrorKind::bad_serialization(format!(
                "unsupported on query socket: {:?}",
                other
            ))),
        };

        self.reply_frames(reply_type, &msg.header, &idents, content)
            .into_iter()
            .map(Outbound::Query)
            .collect()
    }

    fn queue_status(&self, content: &Value) -> Value {
        let req: QueueRequest = match serde_json::from_value(content.clone()) {
            Ok(req) => req,
            Err(e) => return error_content(&ErrorKind::bad_serialization(e.to_string())),
        };
        let ids: Vec<u32> = match &req.targets {
            Some(targets) => {
                if let Some(unknown) = targets.iter().find(|t| !self.engines.contains(**t)) {
                    return error_content(&ErrorKind::unknown_engine(unknown));
                }
                targets.clone()
            }
            None => {
                let mut all: Vec<u32> = self.engines.iter().map(|e| e.engine_id).collect();
                all.sort_unstable();
                all
            }
        };
        let mut engines = BTreeMap::new();
        for id in ids {
            let Some(engine) = self.engines.get(id) else {
                continue;
            };
            let status = if req.verbose {
                let mut completed: Vec<Uuid> = engine.completed.iter().copied().collect();
                completed.sort();
                let mut tasks: Vec<Uuid> = engine.tasks.iter().copied().collect();
                tasks.sort();
                EngineStatus::Ids {
                    queue: engine.queue.iter().copied().collect(),
                    completed,
                    tasks,
                }
            } else {
                EngineStatus::Counts {
                    queue: engine.queue.len(),
                    completed: engine.completed.len(),
                    tasks: engine.tasks.len(),
                }
            };
            engines.insert(id, status);
        }
        ok_content(&QueueReply { engines })
    }

    fn get_results(&self, content: &Value) -> Value {
        let req: ResultRequest = match serde_json::from_value(content.clone()) {
            Ok(req) => req,
            Err(e) => return error_content(&ErrorKind::bad_serialization(e.to_string())),
        };
        let mut records = Vec::new();
        for msg_id in &req.msg_ids {
            match self.db.get(*msg_id) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => return error_content(&ErrorKind::unknown_request(msg_id)),
                Err(e) => return error_content(&ErrorKind::bad_serialization(e.to_string())),
            }
        }
        ok_content(&json!({ "records": records }))
    }

    fn purge_results(&mut self, content: &Value) -> Value {
        let req: PurgeRequest = match serde_json::from_value(content.clone()) {
            Ok(req) => req,
            Err(e) => return error_content(&ErrorKind::bad_serialization(e.to_string())),
        };
        // validate before any side effect
        let mut to_drop = Vec::new();
        for msg_id in &req.msg_ids {
            match self.db.get(*msg_id) {
                Ok(Some(record)) => {
                    if record.is_outstanding() {
                        return error_content(&ErrorKind::bad_serialization(format!(
                            "cannot purge outstanding request {}",
                            msg_id
                        )));
                    }
                    to_drop.push(*msg_id);
                }
                Ok(None) => return error_content(&ErrorKind::unknown_request(msg_id)),
                Err(e) => return error_content(&ErrorKind::bad_serialization(e.to_string())),
            }
        }
        for engine_id in &req.targets {
            let Some(engine) = self.engines.get_mut(*engine_id) else {
                return error_content(&ErrorKind::unknown_engine(engine_id));
            };
            to_drop.extend(engine.completed.drain());
        }
        let ids: Vec<u32> = self.engines.iter().map(|e| e.engine_id).collect();
        for id in ids {
            if let Some(engine) = self.engines.get_mut(id) {
                engine.completed.retain(|x| !to_drop.contains(x));
            }
        }
        match self.db.drop_ids(&to_drop) {
            Ok(purged) => ok_content(&json!({ "purged": purged })),
            Err(e) => error_content(&ErrorKind::bad_serialization(e.to_string())),
        }
    }

    fn db_query(&self, content: &Value) -> Value {
        let req: DbRequest = match serde_json::from_value(content.clone()) {
            Ok(req) => req,
            Err(e) => return error_content(&ErrorKind::bad_serialization(e.to_string())),
        };
        let records = match self.db.find(&req.selector) {
            Ok(records) => records,
            Err(e) => return error_content(&ErrorKind::bad_serialization(e.to_string())),
        };
        let docs: Vec<Value> = records
            .iter()
            .filter_map(|r| serde_json::to_value(r).ok())
            .map(|doc| match &req.keys {
                None => doc,
                Some(keys) => {
                    let Value::Object(map) = doc else { return doc };
                    let filtered: serde_json::Map<String, Value> = map
                        .into_iter()
                        .filter(|(k, _)| k == "msg_id" || keys.contains(k))
                        .collect();
                    Value::Object(filtered)
                }
            })
            .collect();
        ok_content(&json!({ "records": docs }))
    }

    /// Copy stored submission envelopes back onto the task channel under
    /// fresh ids.
    fn resubmit(&mut self, content: &Value, out: &mut Vec<Outbound>) -> Value {
        let req: ResubmitRequest = match serde_json::from_value(content.clone()) {
            Ok(req) => req,
            Err(e) => return error_content(&ErrorKind::bad_serialization(e.to_string())),
        };
        // validate everything before any side effect
        let mut records = Vec::new();
        for msg_id in &req.msg_ids {
            match self.db.get(*msg_id) {
                Ok(Some(record)) => {
                    if record.is_outstanding() {
                        return error_content(&ErrorKind::remote_error(
                            "RuntimeError",
                            format!("cannot resubmit outstanding request {}", msg_id),
                            vec![],
                        ));
                    }
                    records.push(record);
                }
                Ok(None) => return error_content(&ErrorKind::unknown_request(msg_id)),
                Err(e) => return error_content(&ErrorKind::bad_serialization(e.to_string())),
            }
        }

        let mut resubmitted = BTreeMap::new();
        for record in records {
            let original: Header = match serde_json::from_value(record.header.clone()) {
                Ok(header) => header,
                Err(e) => {
                    return error_content(&ErrorKind::bad_serialization(format!(
                        "stored header for {} unreadable: {}",
                        record.msg_id, e
                    )))
                }
            };
            let mut header = self.session.header(original.msg_type);
            let mut metadata = record.metadata.clone();
            if metadata.is_null() {
                metadata = json!({});
            }
            if let Some(map) = metadata.as_object_mut() {
                map.insert("resubmitted".into(), json!(record.msg_id.to_string()));
            }
            header.username = original.username.clone();
            let msg = Message {
                idents: Vec::new(),
                header,
                parent: None,
                metadata,
                content: record.content.clone(),
                buffers: decode_buffers(&record.buffers),
            };
            match self.session.serialize(&msg) {
                Ok(frames) => {
                    info!(original = %record.msg_id, fresh = %msg.msg_id(), "resubmitting");
                    out.push(Outbound::Resubmit(frames));
                }
                Err(e) => {
                    return error_content(&ErrorKind::bad_serialization(e.to_string()));
                }
            }
            let _ = self.db.update(record.msg_id, &mut |r| {
                let _ = r.transition(RequestStatus::Resubmitted);
            });
            resubmitted.insert(record.msg_id, msg.msg_id());
        }
        ok_content(&ResubmitReply { resubmitted })
    }

    /// Monitor bus traffic, dispatched by channel prefix.
    pub fn handle_monitor(&mut self, frames: Vec<Bytes>) -> Vec<Outbound> {
        if frames.len() < 2 {
            trace!("short monitor frame dropped");
            return Vec::new();
        }
        let channel = frames[0].clone();
        let rest = frames[1..].to_vec();
        match channel.as_ref() {
            b"in" => self.save_queue_request(rest),
            b"out" => self.save_queue_result(rest),
            b"intask" => self.save_task_request(rest),
            b"outtask" => self.save_task_result(rest),
            b"task_destination" => self.save_task_destination(rest),
            b"incontrol" => self.save_control_request(rest),
            b"outcontrol" => Vec::new(),
            b"iopub" => self.save_iopub(rest),
            other => {
                trace!(channel = %String::from_utf8_lossy(other), "unknown monitor channel");
                Vec::new()
            }
        }
    }

    /// MUX client→engine: the request is now running on a specific engine.
    fn save_queue_request(&mut self, frames: Vec<Bytes>) -> Vec<Outbound> {
        let msg = match self.session.deserialize(&frames) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("undecodable mux request on monitor: {}", e);
                return Vec::new();
            }
        };
        if msg.idents.len() < 2 {
            warn!("mux request missing identities");
            return Vec::new();
        }
        let (engine_ident, client_ident) = (msg.idents[0].clone(), msg.idents[1].clone());
        let msg_id = msg.msg_id();
        let engine_id = self.engines.id_of(&engine_ident);
        if engine_id.is_none() {
            warn!(
                ident = %hex_ident(&engine_ident),
                "direct request addressed to unknown engine"
            );
        }

        let mut record = RequestRecord::new(
            msg_id,
            hex::encode(&client_ident),
            Channel::Direct,
            RequestStatus::Submitted,
        );
        record.engine_id = engine_id;
        record.header = serde_json::to_value(&msg.header).unwrap_or(Value::Null);
        record.metadata = msg.metadata.clone();
        record.content = msg.content.clone();
        record.buffers = encode_buffers(&msg.buffers);
        let _ = record.transition(RequestStatus::Running);
        if let Err(e) = self.db.upsert(&record) {
            warn!(%msg_id, "failed to persist request record: {}", e);
        }

        if let Some(engine) = self.engines.by_ident_mut(&engine_ident) {
            engine.queue.push_back(msg_id);
        }
        let session = msg.header.session.clone();
        let client = self.ensure_client(&client_ident, &session);
        client.history.push(msg_id);
        client.outstanding.insert(msg_id);
        Vec::new()
    }

    /// MUX engine→client: terminal transition with results.
    fn save_queue_result(&mut self, frames: Vec<Bytes>) -> Vec<Outbound> {
        let msg = match self.session.deserialize(&frames) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("undecodable mux reply on monitor: {}", e);
                return Vec::new();
            }
        };
        if !msg.msg_type().is_result() {
            trace!(msg_type = ?msg.msg_type(), "non-result mux reply ignored");
            return Vec::new();
        }
        let Some(parent) = msg.parent.as_ref() else {
            warn!("mux reply without parent header");
            return Vec::new();
        };
        let msg_id = parent.msg_id;
        let success = is_ok(&msg.content);
        self.finish_record(&msg, msg_id, success);

        if msg.idents.len() >= 2 {
            let engine_ident = msg.idents[1].clone();
            if let Some(engine) = self.engines.by_ident_mut(&engine_ident) {
                engine.queue.retain(|id| *id != msg_id);
                if success {
                    engine.completed.insert(msg_id);
                }
            }
        }
        if let Some(client_ident) = msg.idents.first().cloned() {
            if let Some(client) = self.clients.get_mut(&client_ident) {
                client.outstanding.remove(&msg_id);
            }
        }
        Vec::new()
    }

    fn finish_record(&mut self, msg: &Message, msg_id: Uuid, success: bool) {
        let status = if success {
            RequestStatus::Completed
        } else {
            RequestStatus::Failed
        };
        let header = serde_json::to_value(&msg.header).unwrap_or(Value::Null);
        let content = msg.content.clone();
        let buffers = encode_buffers(&msg.buffers);
        let updated = self.db.update(msg_id, &mut |record| {
            record.result_header = Some(header.clone());
            record.result_content = Some(content.clone());
            record.result_buffers = buffers.clone();
            if let Err(e) = record.transition(status) {
                debug!(%msg_id, "result for settled request: {}", e);
            }
        });
        match updated {
            Ok(true) => {}
            Ok(false) => debug!(%msg_id, "result for request not in ledger"),
            Err(e) => warn!(%msg_id, "failed to update record: {}", e),
        }
    }

    /// Task submission observed (scheduler tee). The ledger learns of the
    /// request before any engine is chosen.
    fn save_task_request(&mut self, frames: Vec<Bytes>) -> Vec<Outbound> {
        let msg = match self.session.deserialize(&frames) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("undecodable task submission on monitor: {}", e);
                return Vec::new();
            }
        };
        let Some(client_ident) = msg.idents.first().cloned() else {
            warn!("task submission without identity");
            return Vec::new();
        };
        let msg_id = msg.msg_id();

        let mut record = RequestRecord::new(
            msg_id,
            hex::encode(&client_ident),
            Channel::Task,
            RequestStatus::Submitted,
        );
        record.header = serde_json::to_value(&msg.header).unwrap_or(Value::Null);
        record.metadata = msg.metadata.clone();
        record.content = msg.content.clone();
        record.buffers = encode_buffers(&msg.buffers);
        let _ = record.transition(RequestStatus::Unassigned);

        // a reinjected or hub-resubmitted task links back to its original
        if let Some(original) = msg
            .metadata
            .get("resubmitted")
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<Uuid>().ok())
        {
            record.resubmitted_from = Some(original);
            let _ = self.db.update(original, &mut |r| {
                let _ = r.transition(RequestStatus::Resubmitted);
            });
        }
        if let Err(e) = self.db.upsert(&record) {
            warn!(%msg_id, "failed to persist task record: {}", e);
        }

        if client_ident != self.resubmit_ident {
            let session = msg.header.session.clone();
            let client = self.ensure_client(&client_ident, &session);
            client.history.push(msg_id);
            client.outstanding.insert(msg_id);
        }
        Vec::new()
    }

    /// Scheduler's binding record: request → engine.
    fn save_task_destination(&mut self, frames: Vec<Bytes>) -> Vec<Outbound> {
        let msg = match self.session.deserialize(&frames) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("undecodable task destination: {}", e);
                return Vec::new();
            }
        };
        let Ok(dest) = serde_json::from_value::<TaskDestination>(msg.content.clone()) else {
            warn!("malformed task destination content");
            return Vec::new();
        };
        let _ = self.db.update(dest.msg_id, &mut |record| {
            record.engine_id = Some(dest.engine_id);
            let _ = record.transition(RequestStatus::Assigned);
        });
        if let Some(engine) = self.engines.get_mut(dest.engine_id) {
            engine.tasks.insert(dest.msg_id);
        }
        Vec::new()
    }

    /// Task reply (engine or scheduler-synthesized): terminal transition.
    fn save_task_result(&mut self, frames: Vec<Bytes>) -> Vec<Outbound> {
        let msg = match self.session.deserialize(&frames) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("undecodable task reply on monitor: {}", e);
                return Vec::new();
            }
        };
        let Some(parent) = msg.parent.as_ref() else {
            warn!("task reply without parent header");
            return Vec::new();
        };
        let msg_id = parent.msg_id;
        let success = is_ok(&msg.content);
        self.finish_record(&msg, msg_id, success);

        if msg.idents.len() >= 2 {
            let engine_ident = msg.idents[1].clone();
            if let Some(engine) = self.engines.by_ident_mut(&engine_ident) {
                engine.tasks.remove(&msg_id);
                if success {
                    engine.completed.insert(msg_id);
                }
            }
        }
        if let Some(client_ident) = msg.idents.first().cloned() {
            if let Some(client) = self.clients.get_mut(&client_ident) {
                client.outstanding.remove(&msg_id);
            }
        }
        Vec::new()
    }

    /// Abort seen on the control channel: settle queued requests, tell the
    /// scheduler to drop what has not been dispatched.
    fn save_control_request(&mut self, frames: Vec<Bytes>) -> Vec<Outbound> {
        let msg = match self.session.deserialize(&frames) {
            Ok(msg) => msg,
            Err(e) => {
                trace!("undecodable control frame on monitor: {}", e);
                return Vec::new();
            }
        };
        if msg.msg_type() != MsgType::AbortRequest {
            return Vec::new();
        }
        let Ok(abort) = serde_json::from_value::<AbortRequest>(msg.content.clone()) else {
            warn!("malformed abort request content");
            return Vec::new();
        };
        for msg_id in &abort.msg_ids {
            let _ = self.db.update(*msg_id, &mut |record| {
                if matches!(
                    record.status,
                    RequestStatus::Submitted | RequestStatus::Unassigned | RequestStatus::Assigned
                ) {
                    let _ = record.transition(RequestStatus::Aborted);
                }
            });
        }
        self.notify_frames(
            MsgType::AbortNotification,
            serde_json::to_value(AbortNotification {
                msg_ids: abort.msg_ids,
            })
            .unwrap_or(Value::Null),
        )
        .into_iter()
        .map(Outbound::Notify)
        .collect()
    }

    /// Stream output tee'd from the iopub relay.
    fn save_iopub(&mut self, frames: Vec<Bytes>) -> Vec<Outbound> {
        let msg = match self.session.deserialize(&frames) {
            Ok(msg) => msg,
            Err(e) => {
                trace!("undecodable iopub frame: {}", e);
                return Vec::new();
            }
        };
        if msg.msg_type() != MsgType::Stream {
            return Vec::new();
        }
        let Some(parent) = msg.parent.as_ref() else {
            return Vec::new();
        };
        let name = msg.content.get("name").and_then(Value::as_str).unwrap_or("");
        let text = msg.content.get("text").and_then(Value::as_str).unwrap_or("");
        if text.is_empty() {
            return Vec::new();
        }
        let _ = self.db.update(parent.msg_id, &mut |record| match name {
            "stdout" => record.stdout.push_str(text),
            "stderr" => record.stderr.push_str(text),
            _ => {}
        });
        Vec::new()
    }

    /// Heart monitor events drive the engine state machine.
    pub fn handle_heart_event(&mut self, event: HeartEvent) -> Vec<Outbound> {
        match event {
            HeartEvent::New(ident) => match self.engines.activate(&ident) {
                Some(engine_id) => {
                    let queue = self
                        .engines
                        .get(engine_id)
                        .map(|e| e.queue_name.clone())
                        .unwrap_or_default();
                    info!(engine_id, queue = %queue, "engine alive");
                    self.notify_frames(
                        MsgType::RegistrationNotification,
                        serde_json::to_value(RegistrationNotification { engine_id, queue })
                            .unwrap_or(Value::Null),
                    )
                    .into_iter()
                    .map(Outbound::Notify)
                    .collect()
                }
                None => {
                    if self.engines.id_of(&ident).is_none() {
                        warn!(ident = %hex_ident(&ident), "heartbeat from unregistered identity");
                    }
                    Vec::new()
                }
            },
            HeartEvent::Failure(ident) => match self.engines.remove_by_ident(&ident) {
                Some(record) => {
                    warn!(
                        engine_id = record.engine_id,
                        queue = %record.queue_name,
                        "engine died"
                    );
                    self.engine_departed(record)
                }
                None => Vec::new(),
            },
        }
    }

    /// Common teardown for death and graceful unregistration: publish the
    /// roster change and resolve outstanding direct requests. Load-balanced
    /// tasks are the scheduler's to reinject or fail; its synthesized replies
    /// come back over the monitor and settle the ledger there.
    fn engine_departed(&mut self, record: crate::registry::EngineRecord) -> Vec<Outbound> {
        let mut out: Vec<Outbound> = self
            .notify_frames(
                MsgType::UnregistrationNotification,
                serde_json::to_value(UnregistrationNotification {
                    engine_id: record.engine_id,
                    queue: record.queue_name.clone(),
                })
                .unwrap_or(Value::Null),
            )
            .into_iter()
            .map(Outbound::Notify)
            .collect();

        let kind = ErrorKind::engine_gone(record.engine_id);
        for msg_id in &record.queue {
            let content = error_content(&kind);
            let _ = self.db.update(*msg_id, &mut |r| {
                r.result_content = Some(content.clone());
                let _ = r.transition(RequestStatus::Failed);
            });
            if let Ok(Some(settled)) = self.db.get(*msg_id) {
                let client_hex = settled.client.clone();
                if let Some(client) = self.client_mut_by_hex(&client_hex) {
                    client.outstanding.remove(msg_id);
                }
            }
        }
        out
    }

    /// Periodic upkeep: purge engines that registered but never beat.
    pub fn tick(&mut self, registration_timeout: Duration) -> Vec<Outbound> {
        let timeout = chrono::Duration::from_std(registration_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(10));
        for purged in self.engines.purge_stale_pending(timeout) {
            warn!(
                engine_id = purged.engine_id,
                queue = %purged.queue_name,
                "purging registration that never sent a heartbeat"
            );
        }
        Vec::new()
    }

    pub fn engine_count(&self) -> usize {
        self.engines.len()
    }
}

/// Run the hub loop until shutdown.
#[allow(clippy::too_many_arguments)]
pub async fn run<RS, QS, NP, MS, RD>(
    mut core: HubCore,
    mut registration: RS,
    mut query: QS,
    mut notify: NP,
    mut monitor: MS,
    mut resubmit: RD,
    mut heart_rx: mpsc::UnboundedReceiver<HeartEvent>,
    shutdown_tx: broadcast::Sender<()>,
    registration_timeout: Duration,
) -> Result<()>
where
    RS: RouterSocket,
    QS: RouterSocket,
    NP: PublisherSocket,
    MS: SubscriberSocket,
    RD: DealerSocket,
{
    info!("hub started");
    let mut shutdown = shutdown_tx.subscribe();
    let mut ticker = tokio::time::interval(registration_timeout.max(Duration::from_millis(250)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        let outbound = tokio::select! {
            Some(result) = registration.next() => match result {
                Ok(mp) => core.handle_registration(to_frames(mp)),
                Err(e) => {
                    warn!("registration recv error: {}", e);
                    Vec::new()
                }
            },
            Some(result) = query.next() => match result {
                Ok(mp) => core.handle_query(to_frames(mp)),
                Err(e) => {
                    warn!("query recv error: {}", e);
                    Vec::new()
                }
            },
            Some(result) = monitor.next() => match result {
                Ok(mp) => core.handle_monitor(to_frames(mp)),
                Err(e) => {
                    warn!("monitor recv error: {}", e);
                    Vec::new()
                }
            },
            Some(event) = heart_rx.recv() => core.handle_heart_event(event),
            _ = ticker.tick() => core.tick(registration_timeout),
            _ = shutdown.recv() => {
                info!("hub shutting down");
                break;
            }
        };

        for item in outbound {
            let result = match item {
                Outbound::Registration(frames) => registration.send(to_multipart(frames)).await,
                Outbound::Query(frames) => query.send(to_multipart(frames)).await,
                Outbound::Notify(frames) => notify.send(to_multipart(frames)).await,
                Outbound::Resubmit(frames) => resubmit.send(to_multipart(frames)).await,
                Outbound::Shutdown => {
                    let _ = shutdown_tx.send(());
                    Ok(())
                }
            };
            if let Err(e) = result {
                warn!("hub send failed: {}", e);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemBackend;
    use pretty_assertions::assert_eq;

    const ENGINE: &[u8] = b"engine-a";
    const CLIENT: &[u8] = b"client-1";

    fn core() -> HubCore {
        HubCore::new(
            Session::new("hub", None),
            Box::new(MemBackend::new()),
            EngineAddrs::default(),
            ClientAddrs::default(),
            Bytes::from_static(b"hub-resubmit"),
        )
    }

    fn reply_content(session: &Session, out: &[Outbound]) -> Value {
        out.iter()
            .find_map(|o| match o {
                Outbound::Registration(frames) | Outbound::Query(frames) => {
                    Some(session.deserialize(frames).unwrap().content)
                }
                _ => None,
            })
            .expect("a reply was produced")
    }

    fn notified_type(session: &Session, out: &[Outbound]) -> Option<MsgType> {
        out.iter().find_map(|o| match o {
            Outbound::Notify(frames) => Some(session.deserialize(frames).unwrap().msg_type()),
            _ => None,
        })
    }

    fn register_engine(core: &mut HubCore, client: &Session, queue: &str) -> u32 {
        let mut msg = client.msg(MsgType::RegistrationRequest, json!({"queue": queue}));
        msg.idents = vec![Bytes::from_static(b"reg-chan-ident")];
        let out = core.handle_registration(client.serialize(&msg).unwrap());
        let content = reply_content(client, &out);
        assert_eq!(content["status"], "ok", "registration failed: {}", content);
        content["engine_id"].as_u64().unwrap() as u32
    }

    fn activate(core: &mut HubCore, ident: &'static [u8]) -> Vec<Outbound> {
        core.handle_heart_event(HeartEvent::New(Bytes::from_static(ident)))
    }

    /// Monitor frames for a mux request, post identity swap: [engine, client,
    /// envelope].
    fn mux_request(client: &Session) -> (Uuid, Vec<Bytes>) {
        let msg = client.msg(MsgType::ApplyRequest, json!({"f": "sum", "args": [1, 2]}));
        let mut frames = vec![
            Bytes::from_static(b"in"),
            Bytes::from_static(ENGINE),
            Bytes::from_static(CLIENT),
        ];
        frames.extend(client.serialize(&msg).unwrap());
        (msg.msg_id(), frames)
    }

    fn mux_reply(engine: &Session, request_frames: &[Bytes], ok: bool) -> Vec<Bytes> {
        let hub = Session::new("parse", None);
        let request = hub.deserialize(&request_frames[3..]).unwrap();
        let content = if ok {
            json!({"status": "ok", "result": 3})
        } else {
            json!({"status": "error", "ename": "ValueError", "evalue": "nope"})
        };
        let reply = engine.reply(MsgType::ApplyReply, &request.header, content);
        let mut frames = vec![
            Bytes::from_static(b"out"),
            Bytes::from_static(CLIENT),
            Bytes::from_static(ENGINE),
        ];
        frames.extend(engine.serialize(&reply).unwrap());
        frames
    }

    fn query(core: &mut HubCore, client: &Session, msg_type: MsgType, content: Value) -> Value {
        let mut msg = client.msg(msg_type, content);
        msg.idents = vec![Bytes::from_static(CLIENT)];
        let out = core.handle_query(client.serialize(&msg).unwrap());
        reply_content(client, &out)
    }

    #[test]
    fn registration_assigns_ids_and_rejects_duplicates() {
        let mut core = core();
        let client = Session::new("engine", None);
        assert_eq!(register_engine(&mut core, &client, "engine-a"), 0);
        assert_eq!(register_engine(&mut core, &client, "engine-b"), 1);

        let mut msg = client.msg(MsgType::RegistrationRequest, json!({"queue": "engine-a"}));
        msg.idents = vec![Bytes::from_static(b"reg-chan-ident")];
        let out = core.handle_registration(client.serialize(&msg).unwrap());
        let content = reply_content(&client, &out);
        assert_eq!(content["status"], "error");
        assert_eq!(content["ename"], "already_registered");
    }

    #[test]
    fn first_heartbeat_publishes_registration() {
        let mut core = core();
        let session = Session::new("engine", None);
        register_engine(&mut core, &session, "engine-a");

        let out = activate(&mut core, ENGINE);
        assert_eq!(
            notified_type(core.session(), &out),
            Some(MsgType::RegistrationNotification)
        );
        // second echo does not re-announce
        let out = activate(&mut core, ENGINE);
        assert_eq!(notified_type(core.session(), &out), None);
    }

    #[test]
    fn connection_reply_carries_roster() {
        let mut core = core();
        let engine = Session::new("engine", None);
        register_engine(&mut core, &engine, "engine-a");

        let client = Session::new("client", None);
        let content = query(&mut core, &client, MsgType::ConnectionRequest, json!({}));
        assert_eq!(content["status"], "ok");
        assert_eq!(content["engines"]["0"], "engine-a");
    }

    #[test]
    fn mux_traffic_drives_the_ledger() {
        let mut core = core();
        let engine_session = Session::new("engine", None);
        register_engine(&mut core, &engine_session, "engine-a");
        activate(&mut core, ENGINE);

        let client = Session::new("client", None);
        let (msg_id, request) = mux_request(&client);
        core.handle_monitor(request.clone());

        let content = query(&mut core, &client, MsgType::QueueRequest, json!({}));
        assert_eq!(content["engines"]["0"]["queue"], 1);
        assert_eq!(content["engines"]["0"]["completed"], 0);

        core.handle_monitor(mux_reply(&engine_session, &request, true));
        let content = query(&mut core, &client, MsgType::QueueRequest, json!({}));
        assert_eq!(content["engines"]["0"]["queue"], 0);
        assert_eq!(content["engines"]["0"]["completed"], 1);

        let content = query(
            &mut core,
            &client,
            MsgType::QueueRequest,
            json!({"verbose": true}),
        );
        assert_eq!(content["engines"]["0"]["completed"][0], msg_id.to_string());

        let content = query(
            &mut core,
            &client,
            MsgType::ResultRequest,
            json!({"msg_ids": [msg_id]}),
        );
        assert_eq!(content["records"][0]["status"], "completed");
        assert_eq!(content["records"][0]["result_content"]["result"], 3);
    }

    #[test]
    fn failed_reply_is_failed_not_completed() {
        let mut core = core();
        let engine_session = Session::new("engine", None);
        register_engine(&mut core, &engine_session, "engine-a");
        activate(&mut core, ENGINE);

        let client = Session::new("client", None);
        let (msg_id, request) = mux_request(&client);
        core.handle_monitor(request.clone());
        core.handle_monitor(mux_reply(&engine_session, &request, false));

        let content = query(
            &mut core,
            &client,
            MsgType::ResultRequest,
            json!({"msg_ids": [msg_id]}),
        );
        assert_eq!(content["records"][0]["status"], "failed");
        // failed ids never join the engine's completed set
        let content = query(&mut core, &client, MsgType::QueueRequest, json!({}));
        assert_eq!(content["engines"]["0"]["completed"], 0);
        assert_eq!(content["engines"]["0"]["queue"], 0);
    }

    #[test]
    fn engine_death_fails_outstanding_direct_requests() {
        let mut core = core();
        let engine_session = Session::new("engine", None);
        register_engine(&mut core, &engine_session, "engine-a");
        activate(&mut core, ENGINE);

        let client = Session::new("client", None);
        let (msg_id, request) = mux_request(&client);
        core.handle_monitor(request);

        let out = core.handle_heart_event(HeartEvent::Failure(Bytes::from_static(ENGINE)));
        assert_eq!(
            notified_type(core.session(), &out),
            Some(MsgType::UnregistrationNotification)
        );
        assert_eq!(core.engine_count(), 0);

        let content = query(
            &mut core,
            &client,
            MsgType::ResultRequest,
            json!({"msg_ids": [msg_id]}),
        );
        assert_eq!(content["records"][0]["status"], "failed");
        assert_eq!(
            content["records"][0]["result_content"]["ename"],
            "engine_gone"
        );
    }

    fn task_submission(client: &Session) -> (Uuid, Vec<Bytes>) {
        let msg = client.msg(MsgType::ApplyRequest, json!({"f": "sum"}));
        let mut frames = vec![Bytes::from_static(b"intask"), Bytes::from_static(CLIENT)];
        frames.extend(client.serialize(&msg).unwrap());
        (msg.msg_id(), frames)
    }

    fn task_result(core: &HubCore, msg_id: Uuid, ok: bool) -> Vec<Bytes> {
        // reconstruct a parent header the way the scheduler would
        let record_header = core.db.get(msg_id).unwrap().unwrap().header;
        let parent: Header = serde_json::from_value(record_header).unwrap();
        let engine = Session::new("engine", None);
        let content = if ok {
            json!({"status": "ok", "result": 3})
        } else {
            json!({"status": "error", "ename": "ValueError", "evalue": "nope"})
        };
        let reply = engine.reply(MsgType::ApplyReply, &parent, content);
        let mut frames = vec![
            Bytes::from_static(b"outtask"),
            Bytes::from_static(CLIENT),
            Bytes::from_static(ENGINE),
        ];
        frames.extend(engine.serialize(&reply).unwrap());
        frames
    }

    #[test]
    fn task_lifecycle_submitted_assigned_completed() {
        let mut core = core();
        let engine_session = Session::new("engine", None);
        let engine_id = register_engine(&mut core, &engine_session, "engine-a");
        activate(&mut core, ENGINE);

        let client = Session::new("client", None);
        let (msg_id, frames) = task_submission(&client);
        core.handle_monitor(frames);

        let content = query(
            &mut core,
            &client,
            MsgType::ResultRequest,
            json!({"msg_ids": [msg_id]}),
        );
        assert_eq!(content["records"][0]["status"], "unassigned");

        let dest = core.session.msg(
            MsgType::TaskDestination,
            serde_json::to_value(TaskDestination { msg_id, engine_id }).unwrap(),
        );
        let mut dest_frames = vec![Bytes::from_static(b"task_destination")];
        dest_frames.extend(core.session.serialize(&dest).unwrap());
        core.handle_monitor(dest_frames);

        let content = query(&mut core, &client, MsgType::QueueRequest, json!({}));
        assert_eq!(content["engines"]["0"]["tasks"], 1);

        let result = task_result(&core, msg_id, true);
        core.handle_monitor(result);

        let content = query(&mut core, &client, MsgType::QueueRequest, json!({}));
        assert_eq!(content["engines"]["0"]["tasks"], 0);
        assert_eq!(content["engines"]["0"]["completed"], 1);

        let content = query(
            &mut core,
            &client,
            MsgType::HistoryRequest,
            json!({}),
        );
        assert_eq!(content["history"][0], msg_id.to_string());
    }

    #[test]
    fn purge_refuses_outstanding_then_removes_completed() {
        let mut core = core();
        let engine_session = Session::new("engine", None);
        let engine_id = register_engine(&mut core, &engine_session, "engine-a");
        activate(&mut core, ENGINE);

        let client = Session::new("client", None);
        let (msg_id, frames) = task_submission(&client);
        core.handle_monitor(frames);
        let dest = core.session.msg(
            MsgType::TaskDestination,
            serde_json::to_value(TaskDestination { msg_id, engine_id }).unwrap(),
        );
        let mut dest_frames = vec![Bytes::from_static(b"task_destination")];
        dest_frames.extend(core.session.serialize(&dest).unwrap());
        core.handle_monitor(dest_frames);

        // still outstanding: refused, no side effect
        let content = query(
            &mut core,
            &client,
            MsgType::PurgeRequest,
            json!({"msg_ids": [msg_id]}),
        );
        assert_eq!(content["status"], "error");
        let content = query(
            &mut core,
            &client,
            MsgType::ResultRequest,
            json!({"msg_ids": [msg_id]}),
        );
        assert_eq!(content["status"], "ok");

        core.handle_monitor(task_result(&core, msg_id, true));
        let content = query(
            &mut core,
            &client,
            MsgType::PurgeRequest,
            json!({"msg_ids": [msg_id]}),
        );
        assert_eq!(content["purged"], 1);

        let content = query(
            &mut core,
            &client,
            MsgType::ResultRequest,
            json!({"msg_ids": [msg_id]}),
        );
        assert_eq!(content["ename"], "unknown_request");
        // the engine's completed set no longer references the purged id
        let content = query(
            &mut core,
            &client,
            MsgType::QueueRequest,
            json!({"verbose": true}),
        );
        assert_eq!(content["engines"]["0"]["completed"], json!([]));
    }

    #[test]
    fn purge_of_unknown_id_errors() {
        let mut core = core();
        let client = Session::new("client", None);
        let content = query(
            &mut core,
            &client,
            MsgType::PurgeRequest,
            json!({"msg_ids": [Uuid::new_v4()]}),
        );
        assert_eq!(content["ename"], "unknown_request");
    }

    #[test]
    fn resubmit_copies_envelope_under_fresh_id() {
        let mut core = core();
        let engine_session = Session::new("engine", None);
        register_engine(&mut core, &engine_session, "engine-a");
        activate(&mut core, ENGINE);

        let client = Session::new("client", None);
        let (msg_id, frames) = task_submission(&client);
        core.handle_monitor(frames);
        core.handle_monitor(task_result(&core, msg_id, true));

        let mut msg = client.msg(MsgType::ResubmitRequest, json!({"msg_ids": [msg_id]}));
        msg.idents = vec![Bytes::from_static(CLIENT)];
        let out = core.handle_query(client.serialize(&msg).unwrap());

        let submitted = out
            .iter()
            .find_map(|o| match o {
                Outbound::Resubmit(frames) => Some(core.session.deserialize(frames).unwrap()),
                _ => None,
            })
            .expect("resubmission emitted");
        assert_ne!(submitted.msg_id(), msg_id);
        assert_eq!(
            submitted.metadata["resubmitted"],
            json!(msg_id.to_string())
        );
        assert_eq!(submitted.content["f"], "sum");

        let content = reply_content(&client, &out);
        assert_eq!(
            content["resubmitted"][msg_id.to_string()],
            json!(submitted.msg_id().to_string())
        );

        // original record is now resubmitted
        let content = query(
            &mut core,
            &client,
            MsgType::ResultRequest,
            json!({"msg_ids": [msg_id]}),
        );
        assert_eq!(content["records"][0]["status"], "resubmitted");
        assert_eq!(content["records"][0]["resubmit_count"], 1);
    }

    #[test]
    fn resubmit_of_outstanding_or_unknown_fails() {
        let mut core = core();
        let engine_session = Session::new("engine", None);
        register_engine(&mut core, &engine_session, "engine-a");
        activate(&mut core, ENGINE);

        let client = Session::new("client", None);
        let content = query(
            &mut core,
            &client,
            MsgType::ResubmitRequest,
            json!({"msg_ids": [Uuid::new_v4()]}),
        );
        assert_eq!(content["ename"], "unknown_request");

        let (msg_id, frames) = task_submission(&client);
        core.handle_monitor(frames);
        let content = query(
            &mut core,
            &client,
            MsgType::ResubmitRequest,
            json!({"msg_ids": [msg_id]}),
        );
        assert_eq!(content["status"], "error");
        assert_eq!(content["ename"], "remote_error");
    }

    #[test]
    fn abort_marks_queued_and_notifies_scheduler() {
        let mut core = core();
        let client = Session::new("client", None);
        let (msg_id, frames) = task_submission(&client);
        core.handle_monitor(frames);

        let abort = client.msg(MsgType::AbortRequest, json!({"msg_ids": [msg_id]}));
        let mut abort_frames = vec![
            Bytes::from_static(b"incontrol"),
            Bytes::from_static(ENGINE),
            Bytes::from_static(CLIENT),
        ];
        abort_frames.extend(client.serialize(&abort).unwrap());
        let out = core.handle_monitor(abort_frames);

        assert_eq!(
            notified_type(core.session(), &out),
            Some(MsgType::AbortNotification)
        );
        let content = query(
            &mut core,
            &client,
            MsgType::ResultRequest,
            json!({"msg_ids": [msg_id]}),
        );
        assert_eq!(content["records"][0]["status"], "aborted");
    }

    #[test]
    fn iopub_streams_accumulate_on_the_record() {
        let mut core = core();
        let client = Session::new("client", None);
        let (msg_id, frames) = task_submission(&client);
        core.handle_monitor(frames);

        let parent: Header =
            serde_json::from_value(core.db.get(msg_id).unwrap().unwrap().header).unwrap();
        let engine = Session::new("engine", None);
        let stream = engine.reply(
            MsgType::Stream,
            &parent,
            json!({"name": "stdout", "text": "partial "}),
        );
        let mut stream_frames = vec![Bytes::from_static(b"iopub")];
        stream_frames.extend(engine.serialize(&stream).unwrap());
        core.handle_monitor(stream_frames.clone());
        core.handle_monitor(stream_frames);

        let record = core.db.get(msg_id).unwrap().unwrap();
        assert_eq!(record.stdout, "partial partial ");
        assert_eq!(record.stderr, "");
    }

    #[test]
    fn db_query_filters_by_selector_and_keys() {
        let mut core = core();
        let client = Session::new("client", None);
        let (msg_id, frames) = task_submission(&client);
        core.handle_monitor(frames);

        let content = query(
            &mut core,
            &client,
            MsgType::DbRequest,
            json!({"selector": {"status": "unassigned"}, "keys": ["status"]}),
        );
        assert_eq!(content["records"][0]["msg_id"], msg_id.to_string());
        assert_eq!(content["records"][0]["status"], "unassigned");
        assert!(content["records"][0].get("content").is_none());
    }

    #[test]
    fn shutdown_request_ripples() {
        let mut core = core();
        let client = Session::new("client", None);
        let mut msg = client.msg(MsgType::ShutdownRequest, json!({}));
        msg.idents = vec![Bytes::from_static(CLIENT)];
        let out = core.handle_query(client.serialize(&msg).unwrap());
        assert!(out.iter().any(|o| matches!(o, Outbound::Shutdown)));
        assert_eq!(
            notified_type(core.session(), &out),
            Some(MsgType::ShutdownNotification)
        );
    }
}
