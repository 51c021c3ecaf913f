//! The dependency-aware task scheduler.
//!
//! Sits between the client task socket and the engine task socket. Incoming
//! submissions carry an `{after, follow, timeout, targets}` subheader; the
//! scheduler holds each task until its time dependencies are met, narrows the
//! candidate engines by location constraints, and hands the envelope to the
//! configured assignment policy. Engine membership is reconciled from the
//! hub's notification bus; completions come from the scheduler's own reply
//! stream.
//!
//! All decisions live in [`SchedulerCore`], which owns no sockets and returns
//! [`Outbound`] effects; the socket loops in [`run`] and [`run_pure`] only
//! move frames.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use anyhow::Result;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use rand::seq::SliceRandom;
use rand::Rng;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use droverconf::Scheme;
use droverproto::content::{
    AbortNotification, RegistrationNotification, TaskDestination, UnregistrationNotification,
};
use droverproto::socket::{
    to_frames, to_multipart, PublisherSocket, RouterSocket, SubscriberSocket,
};
use droverproto::{error_content, is_ok, ErrorKind, Message, MsgType, Session, TaskSubHeader};

use crate::registry::hex_ident;

/// Per-engine load and latency accounting.
#[derive(Debug, Default, Clone)]
struct EngineStats {
    load: usize,
    completions: u64,
    latency_total: Duration,
    last_completion: Option<Instant>,
}

impl EngineStats {
    fn avg_latency_ms(&self) -> f64 {
        if self.completions == 0 {
            0.0
        } else {
            self.latency_total.as_secs_f64() * 1000.0 / self.completions as f64
        }
    }
}

/// A task waiting for dispatch.
#[derive(Debug, Clone)]
pub struct Job {
    msg: Message,
    client: Bytes,
    subheader: TaskSubHeader,
    deadline: Option<Instant>,
}

impl Job {
    fn msg_id(&self) -> Uuid {
        self.msg.msg_id()
    }
}

/// Where a ready task can go.
enum Placement {
    Dispatch(u32),
    /// No engines at all; hold until the next registration.
    Park,
    Fail(ErrorKind),
}

/// Frames to put on the wire, produced by the core.
#[derive(Debug)]
pub enum Outbound {
    /// Engine task socket; engine routing identity leads.
    Engine(Vec<Bytes>),
    /// Client task socket; client routing identity leads.
    Client(Vec<Bytes>),
    /// Monitor publisher; channel prefix leads.
    Monitor(Vec<Bytes>),
}

fn tee(prefix: &'static [u8], frames: &[Bytes]) -> Vec<Bytes> {
    let mut out = Vec::with_capacity(frames.len() + 1);
    out.push(Bytes::from_static(prefix));
    out.extend(frames.iter().cloned());
    out
}

/// Scheduler state machine, free of sockets.
pub struct SchedulerCore {
    session: Session,
    scheme: Scheme,
    default_timeout: Option<Duration>,

    idents: HashMap<u32, Bytes>,
    ids_by_ident: HashMap<Bytes, u32>,
    stats: HashMap<u32, EngineStats>,

    /// Dispatched, awaiting reply: engine → msg_id → (job, dispatch time).
    pending: HashMap<u32, HashMap<Uuid, (Job, Instant)>>,
    /// Waiting on dependencies or candidates, submission order preserved.
    queued: VecDeque<Job>,

    completed: HashMap<u32, HashSet<Uuid>>,
    failed: HashMap<u32, HashSet<Uuid>>,
    all_completed: HashSet<Uuid>,
    all_failed: HashSet<Uuid>,

    /// Fresh id → original id, from engine-death reinjection. Completion of
    /// the fresh id also credits the original so dependents still release.
    aliases: HashMap<Uuid, Uuid>,

    rng: rand::rngs::StdRng,
}

impl SchedulerCore {
    pub fn new(session: Session, scheme: Scheme, default_timeout: Option<Duration>) -> Self {
        use rand::SeedableRng;
        Self {
            session,
            scheme,
            default_timeout,
            idents: HashMap::new(),
            ids_by_ident: HashMap::new(),
            stats: HashMap::new(),
            pending: HashMap::new(),
            queued: VecDeque::new(),
            completed: HashMap::new(),
            failed: HashMap::new(),
            all_completed: HashSet::new(),
            all_failed: HashSet::new(),
            aliases: HashMap::new(),
            rng: rand::rngs::StdRng::from_entropy(),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    fn alive(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.idents.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// An engine became alive (registration notification).
    pub fn add_engine(&mut self, engine_id: u32, ident: Bytes, now: Instant) -> Vec<Outbound> {
        debug!(engine_id, ident = %hex_ident(&ident), "scheduler adding engine");
        self.idents.insert(engine_id, ident.clone());
        self.ids_by_ident.insert(ident, engine_id);
        self.stats.entry(engine_id).or_default();
        self.pending.entry(engine_id).or_default();
        self.completed.entry(engine_id).or_default();
        self.failed.entry(engine_id).or_default();
        // parked tasks get their dependencies re-evaluated
        self.release(now)
    }

    /// An engine left (unregistration notification). Outstanding tasks are
    /// reinjected where their follow sets allow, failed with `engine_gone`
    /// where they were pinned.
    pub fn remove_engine(&mut self, engine_id: u32, now: Instant) -> Vec<Outbound> {
        let Some(ident) = self.idents.remove(&engine_id) else {
            return Vec::new();
        };
        debug!(engine_id, ident = %hex_ident(&ident), "scheduler removing engine");
        self.ids_by_ident.remove(&ident);
        self.stats.remove(&engine_id);
        self.completed.remove(&engine_id);
        self.failed.remove(&engine_id);
        let stranded = self.pending.remove(&engine_id).unwrap_or_default();

        let mut out = Vec::new();
        let mut jobs: Vec<(Job, Instant)> = stranded.into_values().collect();
        jobs.sort_by_key(|(_, at)| *at);
        for (job, _) in jobs {
            let satisfiable_elsewhere = job.subheader.follow.is_empty()
                || self.alive().iter().any(|e| {
                    job.subheader
                        .follow
                        .satisfied(&self.completed[e], &self.failed[e])
                });
            let pinned_to_targets = !job.subheader.targets.is_empty()
                && job
                    .subheader
                    .targets
                    .iter()
                    .all(|t| !self.idents.contains_key(t));
            if satisfiable_elsewhere && !pinned_to_targets {
                out.extend(self.reinject(job, now));
            } else {
                out.extend(self.fail_job(job, ErrorKind::engine_gone(engine_id)));
            }
        }
        out.extend(self.release(now));
        out
    }

    /// Resubmit a stranded job under a fresh id, preserving the submission
    /// envelope and client identity.
    fn reinject(&mut self, job: Job, now: Instant) -> Vec<Outbound> {
        let original_id = job.msg_id();
        let mut header = self.session.header(job.msg.header.msg_type);
        header.session = job.msg.header.session.clone();
        header.username = job.msg.header.username.clone();

        let mut metadata = job.msg.metadata.clone();
        if let Some(map) = metadata.as_object_mut() {
            map.insert(
                "resubmitted".into(),
                serde_json::json!(original_id.to_string()),
            );
        }

        let msg = Message {
            idents: vec![job.client.clone()],
            header,
            parent: job.msg.parent.clone(),
            metadata,
            content: job.msg.content.clone(),
            buffers: job.msg.buffers.clone(),
        };
        let fresh_id = msg.msg_id();
        // alias to the root id so repeated reinjection still credits the
        // submission dependents actually wait on
        let root_id = self.aliases.get(&original_id).copied().unwrap_or(original_id);
        self.aliases.insert(fresh_id, root_id);
        info!(%original_id, %fresh_id, "reinjecting task from dead engine");

        // timeout restarts from reinjection
        let deadline = job
            .subheader_timeout()
            .map(|t| now + t)
            .or_else(|| self.default_timeout.map(|t| now + t));
        let job = Job {
            client: job.client,
            subheader: job.subheader,
            deadline,
            msg,
        };

        let mut out = Vec::new();
        match self.session.serialize(&job.msg) {
            Ok(frames) => out.push(Outbound::Monitor(tee(b"intask", &frames))),
            Err(e) => warn!("failed to serialize reinjected task: {}", e),
        }
        out.extend(self.place(job, now));
        out
    }

    /// A submission arrived on the client socket.
    pub fn submit(&mut self, frames: Vec<Bytes>, now: Instant) -> Vec<Outbound> {
        let msg = match self.session.deserialize(&frames) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("dropping undecodable task submission: {}", e);
                return Vec::new();
            }
        };
        let Some(client) = msg.idents.first().cloned() else {
            warn!("task submission without routing identity dropped");
            return Vec::new();
        };

        // tee the raw submission so the hub's ledger sees it first
        let mut out = vec![Outbound::Monitor(tee(b"intask", &frames))];

        let subheader = match TaskSubHeader::from_metadata(&msg.metadata) {
            Ok(sub) => sub,
            Err(kind) => {
                let job = Job {
                    client,
                    subheader: TaskSubHeader::default(),
                    deadline: None,
                    msg,
                };
                out.extend(self.fail_job(job, kind));
                return out;
            }
        };

        let job = Job {
            client,
            deadline: subheader
                .timeout
                .map(|secs| now + Duration::from_secs_f64(secs.max(0.0)))
                .or_else(|| self.default_timeout.map(|t| now + t)),
            subheader,
            msg,
        };

        // targets must name known engines
        if let Some(unknown) = job
            .subheader
            .targets
            .iter()
            .find(|t| !self.idents.contains_key(*t))
        {
            let kind = ErrorKind::unknown_engine(unknown);
            out.extend(self.fail_job(job, kind));
            return out;
        }

        out.extend(self.place(job, now));
        out
    }

    /// Queue or dispatch one job whose envelope is already validated.
    fn place(&mut self, job: Job, now: Instant) -> Vec<Outbound> {
        if job.subheader.after.unreachable(&self.all_failed)
            || job.subheader.follow.unreachable(&self.all_failed)
        {
            return self.fail_job(
                job,
                ErrorKind::unmet_dependency("dependency failed with success_only set"),
            );
        }
        if !job
            .subheader
            .after
            .satisfied(&self.all_completed, &self.all_failed)
        {
            trace!(msg_id = %job.msg_id(), "task waiting on after dependencies");
            self.queued.push_back(job);
            return Vec::new();
        }
        match self.placement(&job) {
            Placement::Dispatch(engine_id) => self.dispatch(job, engine_id, now),
            Placement::Park => {
                trace!(msg_id = %job.msg_id(), "no engines; parking task");
                self.queued.push_back(job);
                Vec::new()
            }
            Placement::Fail(kind) => self.fail_job(job, kind),
        }
    }

    /// Candidate narrowing: alive ∩ targets ∩ follow-satisfying.
    fn placement(&mut self, job: &Job) -> Placement {
        let alive = self.alive();
        if alive.is_empty() {
            return Placement::Park;
        }
        let candidates: Vec<u32> = alive
            .iter()
            .copied()
            .filter(|e| {
                job.subheader.targets.is_empty() || job.subheader.targets.contains(e)
            })
            .filter(|e| {
                job.subheader
                    .follow
                    .satisfied(&self.completed[e], &self.failed[e])
            })
            .collect();
        if candidates.is_empty() {
            return Placement::Fail(ErrorKind::impossible_dependency(
                "no alive engine can satisfy the follow and target constraints",
            ));
        }
        Placement::Dispatch(self.select(&candidates))
    }

    /// Apply the configured assignment policy to a non-empty candidate set.
    fn select(&mut self, candidates: &[u32]) -> u32 {
        match self.scheme {
            Scheme::Leastload => *candidates
                .iter()
                .min_by(|a, b| {
                    let sa = &self.stats[a];
                    let sb = &self.stats[b];
                    sa.load
                        .cmp(&sb.load)
                        .then(sa.avg_latency_ms().total_cmp(&sb.avg_latency_ms()))
                        .then(a.cmp(b))
                })
                .expect("candidates not empty"),
            Scheme::Weighted => {
                let weights: Vec<f64> = candidates
                    .iter()
                    .map(|e| {
                        let s = &self.stats[e];
                        1.0 / ((s.load as f64 + 1.0) * (s.avg_latency_ms() + 1.0))
                    })
                    .collect();
                let total: f64 = weights.iter().sum();
                let mut roll = self.rng.gen_range(0.0..total);
                for (engine, weight) in candidates.iter().zip(&weights) {
                    if roll < *weight {
                        return *engine;
                    }
                    roll -= weight;
                }
                *candidates.last().expect("candidates not empty")
            }
            Scheme::Lru => *candidates
                .iter()
                .min_by(|a, b| {
                    let la = self.stats[a].last_completion;
                    let lb = self.stats[b].last_completion;
                    match (la, lb) {
                        (None, None) => a.cmp(b),
                        (None, Some(_)) => std::cmp::Ordering::Less,
                        (Some(_), None) => std::cmp::Ordering::Greater,
                        (Some(ta), Some(tb)) => ta.cmp(&tb).then(a.cmp(b)),
                    }
                })
                .expect("candidates not empty"),
            Scheme::Twobin => {
                let first = *candidates.choose(&mut self.rng).expect("not empty");
                let second = *candidates.choose(&mut self.rng).expect("not empty");
                let (a, b) = (first.min(second), first.max(second));
                if self.stats[&b].load < self.stats[&a].load {
                    b
                } else {
                    a
                }
            }
            Scheme::Plainrandom => *candidates.choose(&mut self.rng).expect("not empty"),
            // pure and none never construct a SchedulerCore
            Scheme::Pure | Scheme::None => candidates[0],
        }
    }

    fn dispatch(&mut self, job: Job, engine_id: u32, now: Instant) -> Vec<Outbound> {
        let msg_id = job.msg_id();
        let ident = self.idents[&engine_id].clone();
        debug!(%msg_id, engine_id, "dispatching task");

        let mut out = Vec::new();
        match self.session.serialize(&job.msg) {
            Ok(envelope) => {
                let mut frames = vec![ident];
                frames.extend(envelope);
                out.push(Outbound::Engine(frames));
            }
            Err(e) => {
                warn!(%msg_id, "failed to serialize dispatch: {}", e);
                return self.fail_job(job, ErrorKind::bad_serialization(e.to_string()));
            }
        }

        let dest = self.session.msg(
            MsgType::TaskDestination,
            serde_json::to_value(TaskDestination { msg_id, engine_id })
                .unwrap_or(serde_json::Value::Null),
        );
        if let Ok(frames) = self.session.serialize(&dest) {
            out.push(Outbound::Monitor(tee(b"task_destination", &frames)));
        }

        self.stats.entry(engine_id).or_default().load += 1;
        self.pending
            .entry(engine_id)
            .or_default()
            .insert(msg_id, (job, now));
        out
    }

    /// Synthesize a failure reply back to the submitting client.
    fn fail_job(&mut self, job: Job, kind: ErrorKind) -> Vec<Outbound> {
        let msg_id = job.msg_id();
        info!(%msg_id, code = kind.code(), "task failed in scheduler");
        self.all_failed.insert(msg_id);
        if let Some(original) = self.aliases.get(&msg_id).copied() {
            self.all_failed.insert(original);
        }

        let reply_type = job
            .msg
            .header
            .msg_type
            .reply_type()
            .unwrap_or(MsgType::ApplyReply);
        let reply = self
            .session
            .reply(reply_type, &job.msg.header, error_content(&kind))
            .with_idents(vec![job.client.clone()]);
        match self.session.serialize(&reply) {
            Ok(frames) => vec![
                Outbound::Client(frames.clone()),
                Outbound::Monitor(tee(b"outtask", &frames)),
            ],
            Err(e) => {
                warn!(%msg_id, "failed to serialize failure reply: {}", e);
                Vec::new()
            }
        }
    }

    /// A reply arrived from an engine: account it, forward to the client,
    /// and release any tasks this completion unblocks.
    pub fn on_engine_message(&mut self, frames: Vec<Bytes>, now: Instant) -> Vec<Outbound> {
        if frames.len() < 2 {
            warn!("short engine frame dropped");
            return Vec::new();
        }
        let engine_ident = frames[0].clone();
        let client_frames: Vec<Bytes> = frames[1..].to_vec();

        let mut out = Vec::new();
        // forward regardless; accounting failures must not eat replies
        out.push(Outbound::Client(client_frames.clone()));

        let mut mon = vec![client_frames[0].clone(), engine_ident.clone()];
        mon.extend(client_frames[1..].iter().cloned());
        out.push(Outbound::Monitor(tee(b"outtask", &mon)));

        let Some(&engine_id) = self.ids_by_ident.get(&engine_ident) else {
            warn!(ident = %hex_ident(&engine_ident), "reply from unknown engine");
            return out;
        };
        let msg = match self.session.deserialize(&client_frames) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(engine_id, "undecodable engine reply: {}", e);
                return out;
            }
        };
        let Some(parent) = msg.parent.as_ref() else {
            warn!(engine_id, "engine reply without parent header");
            return out;
        };
        let msg_id = parent.msg_id;

        if let Some((_job, dispatched_at)) = self
            .pending
            .get_mut(&engine_id)
            .and_then(|p| p.remove(&msg_id))
        {
            let stats = self.stats.entry(engine_id).or_default();
            stats.load = stats.load.saturating_sub(1);
            stats.completions += 1;
            stats.latency_total += now.saturating_duration_since(dispatched_at);
            stats.last_completion = Some(now);
        } else {
            debug!(%msg_id, engine_id, "reply for task not in pending set");
        }

        let success = is_ok(&msg.content);
        self.record_outcome(engine_id, msg_id, success);
        out.extend(self.release(now));
        out
    }

    fn record_outcome(&mut self, engine_id: u32, msg_id: Uuid, success: bool) {
        let ids: Vec<Uuid> = std::iter::once(msg_id)
            .chain(self.aliases.get(&msg_id).copied())
            .collect();
        for id in ids {
            if success {
                self.completed.entry(engine_id).or_default().insert(id);
                self.all_completed.insert(id);
            } else {
                self.failed.entry(engine_id).or_default().insert(id);
                self.all_failed.insert(id);
            }
        }
    }

    /// Re-examine queued tasks in submission order. Repeats while failures
    /// cascade into newly-unreachable dependents.
    fn release(&mut self, now: Instant) -> Vec<Outbound> {
        let mut out = Vec::new();
        loop {
            let mut changed = false;
            let mut still_queued = VecDeque::new();
            let queued = std::mem::take(&mut self.queued);
            for job in queued {
                if job.subheader.after.unreachable(&self.all_failed)
                    || job.subheader.follow.unreachable(&self.all_failed)
                {
                    out.extend(self.fail_job(
                        job,
                        ErrorKind::unmet_dependency("dependency failed with success_only set"),
                    ));
                    changed = true;
                    continue;
                }
                if !job
                    .subheader
                    .after
                    .satisfied(&self.all_completed, &self.all_failed)
                {
                    still_queued.push_back(job);
                    continue;
                }
                match self.placement(&job) {
                    Placement::Dispatch(engine_id) => {
                        out.extend(self.dispatch(job, engine_id, now));
                    }
                    Placement::Park => still_queued.push_back(job),
                    Placement::Fail(kind) => {
                        out.extend(self.fail_job(job, kind));
                        changed = true;
                    }
                }
            }
            // keep any tasks queued by a nested call (none today, but cheap)
            self.queued = still_queued;
            if !changed {
                break;
            }
        }
        out
    }

    /// Expire queued tasks whose timeout elapsed with dependencies unmet.
    pub fn tick(&mut self, now: Instant) -> Vec<Outbound> {
        let mut out = Vec::new();
        let queued = std::mem::take(&mut self.queued);
        for job in queued {
            match job.deadline {
                Some(deadline) if now >= deadline => {
                    let timeout_ms = job
                        .subheader
                        .timeout
                        .map(|s| (s * 1000.0) as u64)
                        .or(self.default_timeout.map(|d| d.as_millis() as u64))
                        .unwrap_or(0);
                    let kind = ErrorKind::dependency_timeout(job.msg_id(), timeout_ms);
                    out.extend(self.fail_job(job, kind));
                }
                _ => self.queued.push_back(job),
            }
        }
        out
    }

    /// Drop queued tasks named by an abort notification.
    pub fn abort(&mut self, msg_ids: &[Uuid]) -> usize {
        let before = self.queued.len();
        self.queued.retain(|job| !msg_ids.contains(&job.msg_id()));
        let dropped = before - self.queued.len();
        if dropped > 0 {
            info!(dropped, "aborted queued tasks");
        }
        dropped
    }

    /// Handle a notification-bus envelope.
    pub fn handle_notification(&mut self, frames: Vec<Bytes>, now: Instant) -> Vec<Outbound> {
        let msg = match self.session.deserialize(&frames) {
            Ok(msg) => msg,
            Err(e) => {
                trace!("undecodable notification: {}", e);
                return Vec::new();
            }
        };
        match msg.msg_type() {
            MsgType::RegistrationNotification => {
                match serde_json::from_value::<RegistrationNotification>(msg.content.clone()) {
                    Ok(reg) => self.add_engine(
                        reg.engine_id,
                        Bytes::from(reg.queue.into_bytes()),
                        now,
                    ),
                    Err(e) => {
                        warn!("malformed registration notification: {}", e);
                        Vec::new()
                    }
                }
            }
            MsgType::UnregistrationNotification => {
                match serde_json::from_value::<UnregistrationNotification>(msg.content.clone()) {
                    Ok(unreg) => self.remove_engine(unreg.engine_id, now),
                    Err(e) => {
                        warn!("malformed unregistration notification: {}", e);
                        Vec::new()
                    }
                }
            }
            MsgType::AbortNotification => {
                if let Ok(abort) =
                    serde_json::from_value::<AbortNotification>(msg.content.clone())
                {
                    self.abort(&abort.msg_ids);
                }
                Vec::new()
            }
            _ => Vec::new(),
        }
    }

    pub fn queued_len(&self) -> usize {
        self.queued.len()
    }

    pub fn pending_len(&self, engine_id: u32) -> usize {
        self.pending.get(&engine_id).map_or(0, HashMap::len)
    }
}

impl Job {
    fn subheader_timeout(&self) -> Option<Duration> {
        self.subheader
            .timeout
            .map(|secs| Duration::from_secs_f64(secs.max(0.0)))
    }
}

/// Run the scheduler loop until shutdown.
pub async fn run<CS, ES, MP, NS>(
    mut core: SchedulerCore,
    mut client_sock: CS,
    mut engine_sock: ES,
    mut mon_pub: MP,
    mut notif_sub: NS,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()>
where
    CS: RouterSocket,
    ES: RouterSocket,
    MP: PublisherSocket,
    NS: SubscriberSocket,
{
    info!("task scheduler started");
    let mut ticker = tokio::time::interval(Duration::from_millis(25));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        let outbound = tokio::select! {
            Some(result) = client_sock.next() => match result {
                Ok(mp) => core.submit(to_frames(mp), Instant::now()),
                Err(e) => {
                    warn!("scheduler client recv error: {}", e);
                    Vec::new()
                }
            },
            Some(result) = engine_sock.next() => match result {
                Ok(mp) => core.on_engine_message(to_frames(mp), Instant::now()),
                Err(e) => {
                    warn!("scheduler engine recv error: {}", e);
                    Vec::new()
                }
            },
            Some(result) = notif_sub.next() => match result {
                Ok(mp) => core.handle_notification(to_frames(mp), Instant::now()),
                Err(e) => {
                    warn!("scheduler notification recv error: {}", e);
                    Vec::new()
                }
            },
            _ = ticker.tick() => core.tick(Instant::now()),
            _ = shutdown.recv() => {
                info!("task scheduler shutting down");
                break;
            }
        };
        flush(&mut client_sock, &mut engine_sock, &mut mon_pub, outbound).await;
    }
    Ok(())
}

async fn flush<CS, ES, MP>(
    client_sock: &mut CS,
    engine_sock: &mut ES,
    mon_pub: &mut MP,
    outbound: Vec<Outbound>,
) where
    CS: RouterSocket,
    ES: RouterSocket,
    MP: PublisherSocket,
{
    for item in outbound {
        let result = match item {
            Outbound::Engine(frames) => engine_sock.send(to_multipart(frames)).await,
            Outbound::Client(frames) => client_sock.send(to_multipart(frames)).await,
            Outbound::Monitor(frames) => mon_pub.send(to_multipart(frames)).await,
        };
        if let Err(e) = result {
            warn!("scheduler send failed: {}", e);
        }
    }
}

/// The `pure` bypass: a dependency-blind relay between the client router and
/// an engine-side dealer. Submissions that carry a dependency subheader are
/// answered immediately with a synthesized RuntimeError; nothing is queued.
pub async fn run_pure<CS, ED, MP>(
    session: Session,
    mut client_sock: CS,
    mut engine_sock: ED,
    mut mon_pub: MP,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()>
where
    CS: RouterSocket,
    ED: RouterSocket,
    MP: PublisherSocket,
{
    info!("pure task relay started");
    loop {
        tokio::select! {
            Some(result) = client_sock.next() => {
                let frames = match result {
                    Ok(mp) => to_frames(mp),
                    Err(e) => {
                        warn!("pure relay client recv error: {}", e);
                        continue;
                    }
                };
                // reject dependency-carrying submissions; pure has no queue
                if let Ok(msg) = session.deserialize(&frames) {
                    match TaskSubHeader::from_metadata(&msg.metadata) {
                        Ok(sub) if sub.has_dependencies() => {
                            let kind = ErrorKind::remote_error(
                                "RuntimeError",
                                "pure scheduling does not support dependencies",
                                vec![],
                            );
                            let reply = session
                                .reply(MsgType::ApplyReply, &msg.header, error_content(&kind))
                                .with_idents(msg.idents.clone());
                            if let Ok(reply_frames) = session.serialize(&reply) {
                                if let Err(e) =
                                    client_sock.send(to_multipart(reply_frames.clone())).await
                                {
                                    warn!("pure relay reply failed: {}", e);
                                }
                                let _ = mon_pub
                                    .send(to_multipart(tee(b"outtask", &reply_frames)))
                                    .await;
                            }
                            continue;
                        }
                        _ => {}
                    }
                }
                if let Err(e) = engine_sock.send(to_multipart(frames.clone())).await {
                    warn!("pure relay forward failed: {}", e);
                }
                let _ = mon_pub.send(to_multipart(tee(b"intask", &frames))).await;
            }
            Some(result) = engine_sock.next() => {
                match result {
                    Ok(mp) => {
                        let frames = to_frames(mp);
                        if let Err(e) = client_sock.send(to_multipart(frames.clone())).await {
                            warn!("pure relay reply forward failed: {}", e);
                        }
                        let _ = mon_pub.send(to_multipart(tee(b"outtask", &frames))).await;
                    }
                    Err(e) => warn!("pure relay engine recv error: {}", e),
                }
            }
            _ = shutdown.recv() => {
                info!("pure task relay shutting down");
                break;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn core(scheme: Scheme) -> SchedulerCore {
        SchedulerCore::new(Session::new("scheduler", None), scheme, None)
    }

    fn engine(core: &mut SchedulerCore, id: u32, now: Instant) {
        core.add_engine(id, Bytes::from(format!("engine-{}", id).into_bytes()), now);
    }

    /// Build submission frames the way a client DEALER + ROUTER would.
    fn submission(
        client: &Session,
        metadata: serde_json::Value,
    ) -> (Uuid, Vec<Bytes>) {
        let mut msg = client.msg(MsgType::ApplyRequest, json!({"f": "sum"}));
        msg.metadata = metadata;
        msg.idents = vec![Bytes::from_static(b"client-1")];
        (msg.msg_id(), client.serialize(&msg).unwrap())
    }

    /// Build the reply frames the engine router would deliver.
    fn reply_frames(
        engine_session: &Session,
        engine_ident: &[u8],
        parent_frames: &[Bytes],
        ok: bool,
    ) -> Vec<Bytes> {
        let parent = engine_session.deserialize(parent_frames).unwrap();
        let content = if ok {
            json!({"status": "ok", "result": 3})
        } else {
            json!({"status": "error", "ename": "ValueError", "evalue": "boom"})
        };
        let reply = engine_session
            .reply(MsgType::ApplyReply, &parent.header, content)
            .with_idents(vec![Bytes::from_static(b"client-1")]);
        let mut frames = vec![Bytes::copy_from_slice(engine_ident)];
        frames.extend(engine_session.serialize(&reply).unwrap());
        frames
    }

    fn dispatched_engine(out: &[Outbound]) -> Option<Bytes> {
        out.iter().find_map(|o| match o {
            Outbound::Engine(frames) => Some(frames[0].clone()),
            _ => None,
        })
    }

    fn client_error_codes(session: &Session, out: &[Outbound]) -> Vec<String> {
        out.iter()
            .filter_map(|o| match o {
                Outbound::Client(frames) => {
                    let msg = session.deserialize(frames).ok()?;
                    msg.content
                        .get("ename")
                        .and_then(|v| v.as_str())
                        .map(str::to_string)
                }
                _ => None,
            })
            .collect()
    }

    fn client_error_code(session: &Session, out: &[Outbound]) -> Option<String> {
        client_error_codes(session, out).into_iter().next()
    }

    #[test]
    fn leastload_breaks_ties_by_engine_id() {
        let now = Instant::now();
        let mut core = core(Scheme::Leastload);
        engine(&mut core, 0, now);
        engine(&mut core, 1, now);

        let client = Session::new("client", None);
        let (_, frames) = submission(&client, json!({}));
        let out = core.submit(frames, now);
        assert_eq!(dispatched_engine(&out), Some(Bytes::from_static(b"engine-0")));
        assert_eq!(core.pending_len(0), 1);
        assert_eq!(core.pending_len(1), 0);
    }

    #[test]
    fn leastload_prefers_lower_load() {
        let now = Instant::now();
        let mut core = core(Scheme::Leastload);
        engine(&mut core, 0, now);
        engine(&mut core, 1, now);

        let client = Session::new("client", None);
        let (_, frames) = submission(&client, json!({}));
        core.submit(frames, now);

        let (_, frames) = submission(&client, json!({}));
        let out = core.submit(frames, now);
        assert_eq!(dispatched_engine(&out), Some(Bytes::from_static(b"engine-1")));
    }

    #[test]
    fn after_holds_until_completion() {
        let now = Instant::now();
        let mut core = core(Scheme::Leastload);
        engine(&mut core, 0, now);

        let client = Session::new("client", None);
        let (a_id, a_frames) = submission(&client, json!({}));
        let out = core.submit(a_frames, now);
        let dispatch = out
            .iter()
            .find_map(|o| match o {
                Outbound::Engine(frames) => Some(frames[1..].to_vec()),
                _ => None,
            })
            .unwrap();

        let (_, b_frames) = submission(&client, json!({"after": [a_id]}));
        let out = core.submit(b_frames, now);
        assert!(dispatched_engine(&out).is_none());
        assert_eq!(core.queued_len(), 1);

        // A completes; B releases
        let engine_session = Session::new("engine", None);
        let reply = reply_frames(&engine_session, b"engine-0", &dispatch, true);
        let out = core.on_engine_message(reply, now);
        assert!(dispatched_engine(&out).is_some());
        assert_eq!(core.queued_len(), 0);
    }

    #[test]
    fn follow_pins_to_completion_engine() {
        let now = Instant::now();
        let mut core = core(Scheme::Leastload);
        engine(&mut core, 0, now);
        engine(&mut core, 1, now);

        let client = Session::new("client", None);
        // A targeted at engine 1
        let (a_id, a_frames) = submission(&client, json!({"targets": [1]}));
        let out = core.submit(a_frames, now);
        assert_eq!(dispatched_engine(&out), Some(Bytes::from_static(b"engine-1")));
        let dispatch = out
            .iter()
            .find_map(|o| match o {
                Outbound::Engine(frames) => Some(frames[1..].to_vec()),
                _ => None,
            })
            .unwrap();

        let engine_session = Session::new("engine", None);
        let reply = reply_frames(&engine_session, b"engine-1", &dispatch, true);
        core.on_engine_message(reply, now);

        // C follows A: engine 1 only, even though engine 0 is idle
        let (_, c_frames) = submission(&client, json!({"follow": [a_id]}));
        let out = core.submit(c_frames, now);
        assert_eq!(dispatched_engine(&out), Some(Bytes::from_static(b"engine-1")));
    }

    #[test]
    fn impossible_follow_fails_when_engines_alive() {
        let now = Instant::now();
        let mut core = core(Scheme::Leastload);
        engine(&mut core, 0, now);

        let client = Session::new("client", None);
        // follow an id that completed nowhere, with one engine alive
        let ghost = Uuid::new_v4();
        core.all_completed.insert(ghost);
        let (_, frames) = submission(&client, json!({"follow": [ghost]}));
        let out = core.submit(frames, now);
        assert_eq!(
            client_error_code(&client, &out).as_deref(),
            Some("impossible_dependency")
        );
    }

    #[test]
    fn no_engines_parks_until_registration() {
        let now = Instant::now();
        let mut core = core(Scheme::Leastload);

        let client = Session::new("client", None);
        let (_, frames) = submission(&client, json!({}));
        let out = core.submit(frames, now);
        assert!(dispatched_engine(&out).is_none());
        assert_eq!(core.queued_len(), 1);

        let out = core.add_engine(3, Bytes::from_static(b"engine-3"), now);
        assert_eq!(dispatched_engine(&out), Some(Bytes::from_static(b"engine-3")));
        assert_eq!(core.queued_len(), 0);
    }

    #[test]
    fn unknown_target_rejected() {
        let now = Instant::now();
        let mut core = core(Scheme::Leastload);
        engine(&mut core, 0, now);

        let client = Session::new("client", None);
        let (_, frames) = submission(&client, json!({"targets": [42]}));
        let out = core.submit(frames, now);
        assert_eq!(
            client_error_code(&client, &out).as_deref(),
            Some("unknown_engine")
        );
    }

    #[test]
    fn bad_dependency_rejected() {
        let now = Instant::now();
        let mut core = core(Scheme::Leastload);
        engine(&mut core, 0, now);

        let client = Session::new("client", None);
        let (_, frames) = submission(&client, json!({"after": {"bogus": true}}));
        let out = core.submit(frames, now);
        assert_eq!(
            client_error_code(&client, &out).as_deref(),
            Some("bad_dependency")
        );
    }

    #[test]
    fn timeout_expires_queued_task() {
        let now = Instant::now();
        let mut core = core(Scheme::Leastload);
        engine(&mut core, 0, now);

        let client = Session::new("client", None);
        let ghost = Uuid::new_v4();
        let (_, frames) = submission(&client, json!({"after": [ghost], "timeout": 0.2}));
        core.submit(frames, now);
        assert_eq!(core.queued_len(), 1);

        assert!(core.tick(now + Duration::from_millis(100)).is_empty());
        let out = core.tick(now + Duration::from_millis(250));
        assert_eq!(
            client_error_code(&client, &out).as_deref(),
            Some("dependency_timeout")
        );
        assert_eq!(core.queued_len(), 0);
    }

    #[test]
    fn failed_success_only_dependency_is_unmet() {
        let now = Instant::now();
        let mut core = core(Scheme::Leastload);
        engine(&mut core, 0, now);

        let client = Session::new("client", None);
        let (a_id, a_frames) = submission(&client, json!({}));
        let out = core.submit(a_frames, now);
        let dispatch = out
            .iter()
            .find_map(|o| match o {
                Outbound::Engine(frames) => Some(frames[1..].to_vec()),
                _ => None,
            })
            .unwrap();

        let (_, b_frames) = submission(&client, json!({"after": [a_id]}));
        core.submit(b_frames, now);

        // A fails; B's success_only after can never be met
        let engine_session = Session::new("engine", None);
        let reply = reply_frames(&engine_session, b"engine-0", &dispatch, false);
        let out = core.on_engine_message(reply, now);
        // the forwarded engine failure plus B's synthesized reply
        let codes = client_error_codes(&client, &out);
        assert!(codes.contains(&"unmet_dependency".to_string()), "{:?}", codes);
        assert_eq!(core.queued_len(), 0);
    }

    #[test]
    fn engine_death_reinjects_unpinned_work() {
        let now = Instant::now();
        let mut core = core(Scheme::Leastload);
        engine(&mut core, 0, now);
        engine(&mut core, 1, now);

        let client = Session::new("client", None);
        let (a_id, frames) = submission(&client, json!({"targets": [0]}));
        let out = core.submit(frames, now);
        assert_eq!(dispatched_engine(&out), Some(Bytes::from_static(b"engine-0")));

        // engine 0 dies; task was pinned by targets, so it fails
        let out = core.remove_engine(0, now);
        assert_eq!(
            client_error_code(&client, &out).as_deref(),
            Some("engine_gone")
        );
        assert!(core.all_failed.contains(&a_id));

        // unpinned task reinjects to the survivor under a fresh id
        let (b_id, frames) = submission(&client, json!({}));
        let out = core.submit(frames, now);
        assert_eq!(dispatched_engine(&out), Some(Bytes::from_static(b"engine-1")));
        let out = core.remove_engine(1, now);
        // no engines left: reinjected and parked, no failure reply
        assert!(client_error_code(&client, &out).is_none());
        assert_eq!(core.queued_len(), 1);
        assert!(!core.all_failed.contains(&b_id));
    }

    #[test]
    fn reinjection_alias_credits_original_id() {
        let now = Instant::now();
        let mut core = core(Scheme::Leastload);
        engine(&mut core, 0, now);
        engine(&mut core, 1, now);

        let client = Session::new("client", None);
        let (a_id, frames) = submission(&client, json!({}));
        core.submit(frames, now);
        // force the dispatch onto engine 0's pending set, then kill it
        assert_eq!(core.pending_len(0), 1);

        // B waits on A's original id
        let (_, b_frames) = submission(&client, json!({"after": [a_id]}));
        core.submit(b_frames, now);
        assert_eq!(core.queued_len(), 1);

        let out = core.remove_engine(0, now);
        let redispatch = out
            .iter()
            .find_map(|o| match o {
                Outbound::Engine(frames) => Some(frames[1..].to_vec()),
                _ => None,
            })
            .expect("reinjected to engine 1");

        let engine_session = Session::new("engine", None);
        let reply = reply_frames(&engine_session, b"engine-1", &redispatch, true);
        let out = core.on_engine_message(reply, now);
        // completion of the fresh id releases B via the alias
        assert!(dispatched_engine(&out).is_some());
        assert!(core.all_completed.contains(&a_id));
        assert_eq!(core.queued_len(), 0);
    }

    #[test]
    fn plainrandom_spreads_work() {
        let now = Instant::now();
        let mut core = core(Scheme::Plainrandom);
        for id in 0..4 {
            engine(&mut core, id, now);
        }
        let client = Session::new("client", None);
        let mut hits = HashMap::new();
        for _ in 0..100 {
            let (_, frames) = submission(&client, json!({}));
            let out = core.submit(frames, now);
            let ident = dispatched_engine(&out).unwrap();
            *hits.entry(ident).or_insert(0usize) += 1;
        }
        // no task lost, every engine saw some work
        assert_eq!(hits.values().sum::<usize>(), 100);
        assert_eq!(hits.len(), 4);
    }

    #[test]
    fn abort_drops_queued_tasks() {
        let now = Instant::now();
        let mut core = core(Scheme::Leastload);
        engine(&mut core, 0, now);

        let client = Session::new("client", None);
        let ghost = Uuid::new_v4();
        let (id, frames) = submission(&client, json!({"after": [ghost]}));
        core.submit(frames, now);
        assert_eq!(core.queued_len(), 1);
        assert_eq!(core.abort(&[id]), 1);
        assert_eq!(core.queued_len(), 0);
    }
}
