//! Monitored queues: fixed-function forwarders for the MUX, CONTROL, and
//! IOPUB channels.
//!
//! A queue owns a pair of sockets plus a monitor publisher. Every frame
//! received on one side is forwarded to the other and also published on the
//! monitor with a channel prefix. The queue has no message-level knowledge;
//! the hub only observes the monitor stream and never routes through it.
//!
//! For router/router pairs the two leading identity frames are swapped on
//! forward: a client submits `[engine, ...]`, the ROUTER prepends the client
//! identity giving `[client, engine, ...]`, and the engine-side ROUTER needs
//! the engine identity first. The monitor copy is the post-swap frame list,
//! so the hub always sees `[destination, source, ...]`.

use anyhow::Result;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use droverproto::socket::{
    to_frames, to_multipart, PublisherSocket, RouterSocket, SubscriberSocket,
};

/// Swap the two leading identity frames in place.
fn swap_idents(frames: &mut [Bytes]) {
    if frames.len() >= 2 {
        frames.swap(0, 1);
    }
}

/// Prefix frames with the monitor channel name.
fn tee(prefix: &[u8], frames: &[Bytes]) -> Vec<Bytes> {
    let mut out = Vec::with_capacity(frames.len() + 1);
    out.push(Bytes::copy_from_slice(prefix));
    out.extend(frames.iter().cloned());
    out
}

/// Run a router/router monitored queue until shutdown.
///
/// `in_sock` faces clients, `out_sock` faces engines. Traffic forwarded
/// in → out is published under `in_prefix`, the reverse under `out_prefix`.
pub async fn run_router_queue<I, O, M>(
    name: &'static str,
    mut in_sock: I,
    mut out_sock: O,
    mut monitor: M,
    in_prefix: &'static [u8],
    out_prefix: &'static [u8],
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()>
where
    I: RouterSocket,
    O: RouterSocket,
    M: PublisherSocket,
{
    info!(queue = name, "monitored queue started");
    loop {
        tokio::select! {
            Some(result) = in_sock.next() => {
                match result {
                    Ok(multipart) => {
                        let mut frames = to_frames(multipart);
                        swap_idents(&mut frames);
                        if let Err(e) = out_sock.send(to_multipart(frames.clone())).await {
                            // keep the monitor copy flowing so the hub sees
                            // the attempted dispatch
                            warn!(queue = name, "forward to engine side failed: {}", e);
                        }
                        if let Err(e) = monitor.send(to_multipart(tee(in_prefix, &frames))).await {
                            debug!(queue = name, "monitor publish failed: {}", e);
                        }
                    }
                    Err(e) => warn!(queue = name, "recv error on client side: {}", e),
                }
            }
            Some(result) = out_sock.next() => {
                match result {
                    Ok(multipart) => {
                        let mut frames = to_frames(multipart);
                        swap_idents(&mut frames);
                        if let Err(e) = in_sock.send(to_multipart(frames.clone())).await {
                            warn!(queue = name, "forward to client side failed: {}", e);
                        }
                        if let Err(e) = monitor.send(to_multipart(tee(out_prefix, &frames))).await {
                            debug!(queue = name, "monitor publish failed: {}", e);
                        }
                    }
                    Err(e) => warn!(queue = name, "recv error on engine side: {}", e),
                }
            }
            _ = shutdown.recv() => {
                info!(queue = name, "monitored queue shutting down");
                break;
            }
        }
    }
    Ok(())
}

/// Run the iopub relay: engine-side SUB in, client-side PUB out, tee'd to the
/// monitor under `iopub`. No identity handling.
pub async fn run_relay_queue<I, O, M>(
    name: &'static str,
    mut in_sock: I,
    mut out_sock: O,
    mut monitor: M,
    prefix: &'static [u8],
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()>
where
    I: SubscriberSocket,
    O: PublisherSocket,
    M: PublisherSocket,
{
    info!(queue = name, "relay queue started");
    loop {
        tokio::select! {
            Some(result) = in_sock.next() => {
                match result {
                    Ok(multipart) => {
                        let frames = to_frames(multipart);
                        if let Err(e) = out_sock.send(to_multipart(frames.clone())).await {
                            warn!(queue = name, "relay forward failed: {}", e);
                        }
                        if let Err(e) = monitor.send(to_multipart(tee(prefix, &frames))).await {
                            debug!(queue = name, "monitor publish failed: {}", e);
                        }
                    }
                    Err(e) => warn!(queue = name, "relay recv error: {}", e),
                }
            }
            _ = shutdown.recv() => {
                info!(queue = name, "relay queue shutting down");
                break;
            }
        }
    }
    Ok(())
}
