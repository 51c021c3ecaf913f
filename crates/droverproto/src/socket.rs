//! Centralized ZMQ socket construction for all Drover workers.
//!
//! Every socket in the controller goes through these helpers so options are
//! applied uniformly: linger 0 for clean shutdown, reconnect backoff capped
//! at 60s. tmq does not export concrete socket types, so stored sockets use
//! the trait bounds below.

use anyhow::{Context, Result};
use bytes::Bytes;
use futures::{Sink, Stream};
use tmq::{dealer, publish, router, subscribe, TmqError};

pub use tmq::Context as ZmqContext;
pub use tmq::Multipart;

/// Reconnect interval in milliseconds.
pub const RECONNECT_IVL_MS: i32 = 1000;

/// Cap on reconnect backoff in milliseconds.
pub const RECONNECT_IVL_MAX_MS: i32 = 60_000;

/// Trait bound for DEALER sockets (send and receive).
pub trait DealerSocket:
    Stream<Item = Result<Multipart, TmqError>> + Sink<Multipart, Error = TmqError> + Unpin + Send
{
}
impl<T> DealerSocket for T where
    T: Stream<Item = Result<Multipart, TmqError>> + Sink<Multipart, Error = TmqError> + Unpin + Send
{
}

/// Trait bound for ROUTER sockets (send and receive with identities).
pub trait RouterSocket:
    Stream<Item = Result<Multipart, TmqError>> + Sink<Multipart, Error = TmqError> + Unpin + Send
{
}
impl<T> RouterSocket for T where
    T: Stream<Item = Result<Multipart, TmqError>> + Sink<Multipart, Error = TmqError> + Unpin + Send
{
}

/// Trait bound for SUB sockets (receive only).
pub trait SubscriberSocket: Stream<Item = Result<Multipart, TmqError>> + Unpin + Send {}
impl<T> SubscriberSocket for T where T: Stream<Item = Result<Multipart, TmqError>> + Unpin + Send {}

/// Trait bound for PUB sockets (send only).
pub trait PublisherSocket: Sink<Multipart, Error = TmqError> + Unpin + Send {}
impl<T> PublisherSocket for T where T: Sink<Multipart, Error = TmqError> + Unpin + Send {}

/// DEALER with an explicit identity, connected to `endpoint`.
pub fn dealer_connect(
    ctx: &ZmqContext,
    endpoint: &str,
    identity: &[u8],
) -> Result<impl DealerSocket> {
    dealer(ctx)
        .set_linger(0)
        .set_reconnect_ivl(RECONNECT_IVL_MS)
        .set_reconnect_ivl_max(RECONNECT_IVL_MAX_MS)
        .set_identity(identity)
        .connect(endpoint)
        .with_context(|| format!("failed to connect DEALER to {}", endpoint))
}

/// DEALER bound to `endpoint`; connected peers are served round-robin.
pub fn dealer_bind(ctx: &ZmqContext, endpoint: &str) -> Result<impl DealerSocket> {
    dealer(ctx)
        .set_linger(0)
        .bind(endpoint)
        .with_context(|| format!("failed to bind DEALER to {}", endpoint))
}

/// ROUTER bound to `endpoint`.
pub fn router_bind(ctx: &ZmqContext, endpoint: &str) -> Result<impl RouterSocket> {
    router(ctx)
        .set_linger(0)
        .set_reconnect_ivl(RECONNECT_IVL_MS)
        .set_reconnect_ivl_max(RECONNECT_IVL_MAX_MS)
        .bind(endpoint)
        .with_context(|| format!("failed to bind ROUTER to {}", endpoint))
}

/// SUB bound to `endpoint`, subscribed to everything. The monitor bus binds
/// the subscriber side; queue publishers connect in.
pub fn subscriber_bind(ctx: &ZmqContext, endpoint: &str) -> Result<impl SubscriberSocket> {
    subscribe(ctx)
        .set_linger(0)
        .bind(endpoint)
        .with_context(|| format!("failed to bind SUB to {}", endpoint))?
        .subscribe(b"")
        .context("failed to subscribe to all messages")
}

/// SUB connected to `endpoint`, subscribed to everything.
pub fn subscriber_connect(ctx: &ZmqContext, endpoint: &str) -> Result<impl SubscriberSocket> {
    subscribe(ctx)
        .set_linger(0)
        .set_reconnect_ivl(RECONNECT_IVL_MS)
        .set_reconnect_ivl_max(RECONNECT_IVL_MAX_MS)
        .connect(endpoint)
        .with_context(|| format!("failed to connect SUB to {}", endpoint))?
        .subscribe(b"")
        .context("failed to subscribe to all messages")
}

/// PUB bound to `endpoint`.
pub fn publisher_bind(ctx: &ZmqContext, endpoint: &str) -> Result<impl PublisherSocket> {
    publish(ctx)
        .set_linger(0)
        .bind(endpoint)
        .with_context(|| format!("failed to bind PUB to {}", endpoint))
}

/// PUB connected to `endpoint` (queue monitor tees fan in to the hub's SUB).
pub fn publisher_connect(ctx: &ZmqContext, endpoint: &str) -> Result<impl PublisherSocket> {
    publish(ctx)
        .set_linger(0)
        .set_reconnect_ivl(RECONNECT_IVL_MS)
        .set_reconnect_ivl_max(RECONNECT_IVL_MAX_MS)
        .connect(endpoint)
        .with_context(|| format!("failed to connect PUB to {}", endpoint))
}

/// Convert owned frames into a tmq multipart for sending.
pub fn to_multipart(frames: Vec<Bytes>) -> Multipart {
    frames
        .iter()
        .map(|f| f.to_vec())
        .collect::<Vec<_>>()
        .into()
}

/// Copy a received multipart out into owned frames.
pub fn to_frames(multipart: Multipart) -> Vec<Bytes> {
    multipart
        .into_iter()
        .map(|m| Bytes::from(m.to_vec()))
        .collect()
}
