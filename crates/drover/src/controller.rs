//! The controller factory: binds every port, wires the monitor star, and
//! supervises the workers.
//!
//! Startup order: monitor bus, queues, heart monitor, hub, scheduler; the
//! registration socket is part of the hub, opened last. All sockets are
//! created here so bind failures surface before anything runs. Shutdown is a
//! broadcast every worker loop selects on, rippled in reverse by each loop
//! exiting on its own.

use std::net::TcpListener;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use droverconf::{DbBackendKind, DroverConfig, NetConfig, Scheme};
use droverproto::content::{ClientAddrs, EngineAddrs};
use droverproto::socket::{
    dealer_bind, dealer_connect, publisher_bind, publisher_connect, router_bind, subscriber_bind,
    subscriber_connect, ZmqContext,
};
use droverproto::{Session, SigningKey};

use crate::db::{DbBackend, DocBackend, MemBackend};
use crate::hub::{self, HubCore};
use crate::queue;
use crate::scheduler::{self, SchedulerCore};
use crate::heartmonitor;

/// Identity of the hub's own dealer on the task client channel.
const RESUBMIT_IDENT: &[u8] = b"drover-hub";

/// Every endpoint the controller binds, fully resolved.
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub registration: String,
    pub notification: String,
    pub query: String,
    pub monitor: String,
    /// Beacon PUB, echo ROUTER.
    pub heartbeat: (String, String),
    /// Client side, engine side.
    pub mux: (String, String),
    pub task: (String, String),
    pub control: (String, String),
    pub iopub: (String, String),
}

/// Picks OS-assigned ports for every channel configured as 0, holding the
/// probe listeners open until the whole set is chosen so no port repeats.
struct PortPicker<'a> {
    net: &'a NetConfig,
    held: Vec<TcpListener>,
}

impl<'a> PortPicker<'a> {
    fn new(net: &'a NetConfig) -> Self {
        Self {
            net,
            held: Vec::new(),
        }
    }

    fn pick(&mut self, port: u16) -> Result<String> {
        let port = if port != 0 {
            port
        } else {
            let listener = TcpListener::bind((self.net.bind_ip.as_str(), 0))
                .with_context(|| format!("failed to probe a free port on {}", self.net.bind_ip))?;
            let port = listener.local_addr()?.port();
            self.held.push(listener);
            port
        };
        Ok(format!(
            "{}://{}:{}",
            self.net.transport, self.net.bind_ip, port
        ))
    }
}

impl Endpoints {
    pub fn resolve(net: &NetConfig) -> Result<Self> {
        let mut picker = PortPicker::new(net);
        Ok(Self {
            registration: picker.pick(net.registration_port)?,
            notification: picker.pick(net.notification_port)?,
            query: picker.pick(net.query_port)?,
            monitor: picker.pick(net.monitor_port)?,
            heartbeat: (
                picker.pick(net.heartbeat_ports[0])?,
                picker.pick(net.heartbeat_ports[1])?,
            ),
            mux: (picker.pick(net.mux_ports[0])?, picker.pick(net.mux_ports[1])?),
            task: (
                picker.pick(net.task_ports[0])?,
                picker.pick(net.task_ports[1])?,
            ),
            control: (
                picker.pick(net.control_ports[0])?,
                picker.pick(net.control_ports[1])?,
            ),
            iopub: (
                picker.pick(net.iopub_ports[0])?,
                picker.pick(net.iopub_ports[1])?,
            ),
        })
    }

    /// Addresses handed to engines on registration.
    pub fn engine_addrs(&self) -> EngineAddrs {
        EngineAddrs {
            mux: self.mux.1.clone(),
            task: self.task.1.clone(),
            control: self.control.1.clone(),
            iopub: self.iopub.1.clone(),
            heartbeat: (self.heartbeat.0.clone(), self.heartbeat.1.clone()),
        }
    }

    /// Addresses handed to clients on connection.
    pub fn client_addrs(&self) -> ClientAddrs {
        ClientAddrs {
            mux: self.mux.0.clone(),
            task: self.task.0.clone(),
            control: self.control.0.clone(),
            iopub: self.iopub.0.clone(),
            query: self.query.clone(),
            notification: self.notification.clone(),
            registration: self.registration.clone(),
        }
    }
}

/// A spawned worker: a task on the shared runtime, or a dedicated thread
/// running its own single-threaded runtime.
pub enum WorkerHandle {
    Task(tokio::task::JoinHandle<()>),
    Thread(std::thread::JoinHandle<()>),
}

fn spawn_worker<F>(name: &'static str, use_threads: bool, fut: F) -> WorkerHandle
where
    F: std::future::Future<Output = Result<()>> + Send + 'static,
{
    if use_threads {
        WorkerHandle::Thread(
            std::thread::Builder::new()
                .name(name.to_string())
                .spawn(move || {
                    let runtime = tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                        .expect("worker runtime");
                    if let Err(e) = runtime.block_on(fut) {
                        warn!(worker = name, "worker exited with error: {:#}", e);
                    }
                })
                .expect("spawn worker thread"),
        )
    } else {
        WorkerHandle::Task(tokio::spawn(async move {
            if let Err(e) = fut.await {
                warn!(worker = name, "worker exited with error: {:#}", e);
            }
        }))
    }
}

/// A running controller.
pub struct Controller {
    endpoints: Endpoints,
    shutdown_tx: broadcast::Sender<()>,
    handles: Vec<(&'static str, WorkerHandle)>,
}

impl Controller {
    /// Bind everything and launch the workers.
    pub async fn start(config: DroverConfig) -> Result<Controller> {
        let endpoints = Endpoints::resolve(&config.net)?;
        let ctrl = &config.controller;

        let key = if config.signing_enabled() {
            let path = &ctrl.exec_key;
            let key = if path.exists() {
                SigningKey::from_file(path)?
            } else {
                info!(path = %path.display(), "generating exec key");
                SigningKey::generate_to(path)?
            };
            Some(key)
        } else {
            None
        };

        let db: Box<dyn DbBackend> = match ctrl.db_backend {
            DbBackendKind::Memory => Box::new(MemBackend::new()),
            DbBackendKind::Documents => {
                let dir = if ctrl.db_path.as_os_str().is_empty() {
                    std::path::PathBuf::from("drover-db")
                } else {
                    ctrl.db_path.clone()
                };
                Box::new(DocBackend::open(&dir)?)
            }
        };

        let period = Duration::from_millis(ctrl.heartbeat_period_ms.max(1));
        let registration_timeout = period * ctrl.registration_timeout_periods.max(1);
        let default_task_timeout = match ctrl.task_timeout_default_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };

        let ctx = ZmqContext::new();
        let (shutdown_tx, _) = broadcast::channel(16);
        let (heart_tx, heart_rx) = mpsc::unbounded_channel();

        // bind everything up front, in startup order, so failures are loud
        let hub_monitor = subscriber_bind(&ctx, &endpoints.monitor)?;

        let iopub_in = subscriber_bind(&ctx, &endpoints.iopub.1)?;
        let iopub_out = publisher_bind(&ctx, &endpoints.iopub.0)?;
        let iopub_mon = publisher_connect(&ctx, &endpoints.monitor)?;

        let mux_in = router_bind(&ctx, &endpoints.mux.0)?;
        let mux_out = router_bind(&ctx, &endpoints.mux.1)?;
        let mux_mon = publisher_connect(&ctx, &endpoints.monitor)?;

        let control_in = router_bind(&ctx, &endpoints.control.0)?;
        let control_out = router_bind(&ctx, &endpoints.control.1)?;
        let control_mon = publisher_connect(&ctx, &endpoints.monitor)?;

        let hb_ping = publisher_bind(&ctx, &endpoints.heartbeat.0)?;
        let hb_pong = router_bind(&ctx, &endpoints.heartbeat.1)?;

        let registration = router_bind(&ctx, &endpoints.registration)?;
        let query = router_bind(&ctx, &endpoints.query)?;
        let notify = publisher_bind(&ctx, &endpoints.notification)?;
        let resubmit = dealer_connect(&ctx, &endpoints.task.0, RESUBMIT_IDENT)?;

        let use_threads = ctrl.use_threads;
        let mut handles = Vec::new();

        handles.push((
            "iopub-queue",
            spawn_worker(
                "iopub-queue",
                use_threads,
                queue::run_relay_queue(
                    "iopub",
                    iopub_in,
                    iopub_out,
                    iopub_mon,
                    b"iopub",
                    shutdown_tx.subscribe(),
                ),
            ),
        ));
        handles.push((
            "mux-queue",
            spawn_worker(
                "mux-queue",
                use_threads,
                queue::run_router_queue(
                    "mux",
                    mux_in,
                    mux_out,
                    mux_mon,
                    b"in",
                    b"out",
                    shutdown_tx.subscribe(),
                ),
            ),
        ));
        handles.push((
            "control-queue",
            spawn_worker(
                "control-queue",
                use_threads,
                queue::run_router_queue(
                    "control",
                    control_in,
                    control_out,
                    control_mon,
                    b"incontrol",
                    b"outcontrol",
                    shutdown_tx.subscribe(),
                ),
            ),
        ));
        handles.push((
            "heart-monitor",
            spawn_worker(
                "heart-monitor",
                use_threads,
                heartmonitor::run(hb_ping, hb_pong, period, heart_tx, shutdown_tx.subscribe()),
            ),
        ));

        let hub_core = HubCore::new(
            Session::new("drover-hub", key.clone()),
            db,
            endpoints.engine_addrs(),
            endpoints.client_addrs(),
            Bytes::from_static(RESUBMIT_IDENT),
        );
        handles.push((
            "hub",
            spawn_worker(
                "hub",
                use_threads,
                hub::run(
                    hub_core,
                    registration,
                    query,
                    notify,
                    hub_monitor,
                    resubmit,
                    heart_rx,
                    shutdown_tx.clone(),
                    registration_timeout,
                ),
            ),
        ));

        match ctrl.scheme {
            Scheme::None => {
                info!("no task scheduler configured");
            }
            Scheme::Pure => {
                let client_sock = router_bind(&ctx, &endpoints.task.0)?;
                let engine_sock = dealer_bind(&ctx, &endpoints.task.1)?;
                let mon = publisher_connect(&ctx, &endpoints.monitor)?;
                let session = Session::new("drover-scheduler", key.clone());
                handles.push((
                    "task-relay",
                    spawn_worker(
                        "task-relay",
                        use_threads,
                        scheduler::run_pure(
                            session,
                            client_sock,
                            engine_sock,
                            mon,
                            shutdown_tx.subscribe(),
                        ),
                    ),
                ));
            }
            scheme => {
                let client_sock = router_bind(&ctx, &endpoints.task.0)?;
                let engine_sock = router_bind(&ctx, &endpoints.task.1)?;
                let mon = publisher_connect(&ctx, &endpoints.monitor)?;
                let notif = subscriber_connect(&ctx, &endpoints.notification)?;
                let core = SchedulerCore::new(
                    Session::new("drover-scheduler", key.clone()),
                    scheme,
                    default_task_timeout,
                );
                handles.push((
                    "task-scheduler",
                    spawn_worker(
                        "task-scheduler",
                        use_threads,
                        scheduler::run(
                            core,
                            client_sock,
                            engine_sock,
                            mon,
                            notif,
                            shutdown_tx.subscribe(),
                        ),
                    ),
                ));
            }
        }

        info!(
            scheme = ctrl.scheme.as_str(),
            registration = %endpoints.registration,
            query = %endpoints.query,
            "controller started"
        );
        Ok(Controller {
            endpoints,
            shutdown_tx,
            handles,
        })
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    /// Signal every worker to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Wait for every worker to exit.
    pub async fn join(self) {
        for (name, handle) in self.handles {
            match handle {
                WorkerHandle::Task(task) => {
                    if let Err(e) = task.await {
                        warn!(worker = name, "worker task panicked: {}", e);
                    }
                }
                WorkerHandle::Thread(thread) => {
                    let joined = tokio::task::spawn_blocking(move || thread.join()).await;
                    if !matches!(joined, Ok(Ok(()))) {
                        warn!(worker = name, "worker thread panicked");
                    }
                }
            }
        }
    }
}
