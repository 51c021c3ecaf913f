//! The failure detector: beacon publisher plus echo collector.
//!
//! Every period the monitor publishes a monotonic beacon id; alive engines
//! echo it with their queue identity. One missed beacon marks an engine dead
//! - aggressive failover is preferred over slow flapping. Lifecycle events
//! flow to the hub, which owns the engine state machine.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, trace, warn};

use droverproto::socket::{to_frames, to_multipart, PublisherSocket, RouterSocket};

use crate::registry::hex_ident;

/// Engine lifecycle events emitted toward the hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartEvent {
    /// An identity echoed for the first time.
    New(Bytes),
    /// A previously-alive identity missed a beacon.
    Failure(Bytes),
}

/// The per-period set arithmetic, separated from the sockets.
#[derive(Debug, Default)]
pub struct HeartState {
    pub alive: HashSet<Bytes>,
    responded: HashSet<Bytes>,
    new_seen: HashSet<Bytes>,
    pub beacon: u64,
}

impl HeartState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an echo; stale beacon ids are ignored.
    pub fn on_echo(&mut self, ident: Bytes, beacon: u64) -> bool {
        if beacon != self.beacon {
            trace!(
                ident = %hex_ident(&ident),
                got = beacon,
                want = self.beacon,
                "stale heartbeat echo"
            );
            return false;
        }
        if self.alive.contains(&ident) {
            self.responded.insert(ident);
        } else {
            self.new_seen.insert(ident);
        }
        true
    }

    /// Close the period: compute newly-seen and dead sets, advance the
    /// beacon.
    ///
    /// `alive_next = (alive ∩ responded) ∪ new_seen`,
    /// `dead = alive − responded`.
    pub fn tick(&mut self) -> (Vec<Bytes>, Vec<Bytes>) {
        let dead: Vec<Bytes> = self
            .alive
            .iter()
            .filter(|id| !self.responded.contains(*id))
            .cloned()
            .collect();
        let new: Vec<Bytes> = self.new_seen.iter().cloned().collect();

        self.alive = self
            .responded
            .drain()
            .chain(self.new_seen.drain())
            .collect();
        self.beacon += 1;
        (new, dead)
    }
}

/// Run the heart monitor loop until shutdown.
pub async fn run<P, R>(
    mut ping: P,
    mut pong: R,
    period: Duration,
    events: mpsc::UnboundedSender<HeartEvent>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()>
where
    P: PublisherSocket,
    R: RouterSocket,
{
    let mut state = HeartState::new();
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    info!(period_ms = period.as_millis() as u64, "heart monitor started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let (new, dead) = state.tick();
                for ident in new {
                    debug!(ident = %hex_ident(&ident), "new heart");
                    let _ = events.send(HeartEvent::New(ident));
                }
                for ident in dead {
                    warn!(ident = %hex_ident(&ident), "heart failure");
                    let _ = events.send(HeartEvent::Failure(ident));
                }
                let beacon = state.beacon.to_string().into_bytes();
                if let Err(e) = ping.send(to_multipart(vec![Bytes::from(beacon)])).await {
                    warn!("failed to publish beacon: {}", e);
                }
            }
            Some(result) = pong.next() => {
                match result {
                    Ok(multipart) => {
                        let frames = to_frames(multipart);
                        if frames.len() < 2 {
                            trace!("short heartbeat echo dropped");
                            continue;
                        }
                        let ident = frames[0].clone();
                        match std::str::from_utf8(&frames[1])
                            .ok()
                            .and_then(|s| s.parse::<u64>().ok())
                        {
                            Some(beacon) => {
                                state.on_echo(ident, beacon);
                            }
                            None => trace!(
                                ident = %hex_ident(&ident),
                                "unparseable heartbeat echo dropped"
                            ),
                        }
                    }
                    Err(e) => warn!("heartbeat recv error: {}", e),
                }
            }
            _ = shutdown.recv() => {
                info!("heart monitor shutting down");
                break;
            }
        }
    }
    Ok(())
}
