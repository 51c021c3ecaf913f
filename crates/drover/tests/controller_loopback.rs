//! Full-controller integration tests over loopback tcp.
//!
//! Each test boots a controller on random ports, speaks the wire protocol
//! through real DEALER/SUB sockets, and tears everything down. Heartbeat
//! periods are generous so scheduler hiccups on busy CI machines do not
//! read as engine death.

use std::time::Duration;

use bytes::Bytes;
use drover::Controller;
use droverconf::DroverConfig;
use droverproto::socket::{
    dealer_connect, subscriber_connect, to_frames, to_multipart, DealerSocket, SubscriberSocket,
    ZmqContext,
};
use droverproto::{Message, MsgType, Session};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::watch;

const HB_PERIOD_MS: u64 = 200;

fn test_config() -> DroverConfig {
    let mut config = DroverConfig::default();
    config.controller.heartbeat_period_ms = HB_PERIOD_MS;
    config
}

/// Send a request on a dealer and wait for the matching reply.
async fn request_reply<S: DealerSocket>(
    sock: &mut S,
    session: &Session,
    msg: &Message,
    timeout: Duration,
) -> Message {
    sock.send(to_multipart(session.serialize(msg).unwrap()))
        .await
        .unwrap();
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let received = tokio::time::timeout(remaining, sock.next())
            .await
            .expect("timed out waiting for reply")
            .expect("socket closed")
            .expect("recv error");
        let reply = session.deserialize(&to_frames(received)).unwrap();
        if reply.parent.as_ref().map(|p| p.msg_id) == Some(msg.msg_id()) {
            return reply;
        }
    }
}

/// Wait for a notification of the given type, discarding others.
async fn await_notification<S: SubscriberSocket>(
    sub: &mut S,
    session: &Session,
    wanted: MsgType,
    timeout: Duration,
) -> Value {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let received = tokio::time::timeout(remaining, sub.next())
            .await
            .unwrap_or_else(|_| panic!("timed out waiting for {:?}", wanted))
            .expect("notification socket closed")
            .expect("notification recv error");
        if let Ok(msg) = session.deserialize(&to_frames(received)) {
            if msg.msg_type() == wanted {
                return msg.content;
            }
        }
    }
}

/// Echo heartbeat beacons under the given identity until told to stop.
fn spawn_heartbeats(
    ctx: &ZmqContext,
    ping_endpoint: &str,
    pong_endpoint: &str,
    identity: &'static [u8],
) -> watch::Sender<bool> {
    let mut beacon_sub = subscriber_connect(ctx, ping_endpoint).unwrap();
    let mut echo = dealer_connect(ctx, pong_endpoint, identity).unwrap();
    let (stop_tx, mut stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(Ok(beacon)) = beacon_sub.next() => {
                    let frames = to_frames(beacon);
                    if *stop_rx.borrow() {
                        break;
                    }
                    let _ = echo.send(to_multipart(frames)).await;
                }
                _ = stop_rx.changed() => {
                    if *stop_rx.borrow() {
                        break;
                    }
                }
            }
        }
    });
    stop_tx
}

async fn register_engine<S: DealerSocket>(
    reg: &mut S,
    session: &Session,
    queue: &str,
) -> (u32, Value) {
    let msg = session.msg(MsgType::RegistrationRequest, json!({ "queue": queue }));
    let reply = request_reply(reg, session, &msg, Duration::from_secs(5)).await;
    assert_eq!(reply.msg_type(), MsgType::RegistrationReply);
    assert_eq!(reply.content["status"], "ok", "{}", reply.content);
    (
        reply.content["engine_id"].as_u64().unwrap() as u32,
        reply.content.clone(),
    )
}

#[tokio::test]
async fn engine_lifecycle_registration_to_death() {
    let controller = Controller::start(test_config()).await.unwrap();
    let endpoints = controller.endpoints().clone();
    let ctx = ZmqContext::new();
    let session = Session::new("itest", None);

    // subscribe to roster notifications before anything can fire
    let mut notifications = subscriber_connect(&ctx, &endpoints.notification).unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut reg = dealer_connect(&ctx, &endpoints.registration, b"itest-reg-1").unwrap();
    let (engine_id, content) = register_engine(&mut reg, &session, "engine-itest-1").await;
    assert_eq!(engine_id, 0);
    assert_eq!(content["addrs"]["mux"], endpoints.mux.1);
    assert_eq!(content["engines"]["0"], "engine-itest-1");

    // the engine is announced once it starts beating
    let stop = spawn_heartbeats(
        &ctx,
        &endpoints.heartbeat.0,
        &endpoints.heartbeat.1,
        b"engine-itest-1",
    );
    let announced = await_notification(
        &mut notifications,
        &session,
        MsgType::RegistrationNotification,
        Duration::from_secs(5),
    )
    .await;
    assert_eq!(announced["engine_id"], 0);
    assert_eq!(announced["queue"], "engine-itest-1");

    // the roster shows up in connection and queue replies
    let mut query = dealer_connect(&ctx, &endpoints.query, b"itest-client-1").unwrap();
    let msg = session.msg(MsgType::ConnectionRequest, json!({}));
    let reply = request_reply(&mut query, &session, &msg, Duration::from_secs(5)).await;
    assert_eq!(reply.content["engines"]["0"], "engine-itest-1");
    assert_eq!(reply.content["addrs"]["query"], endpoints.query);

    let msg = session.msg(MsgType::QueueRequest, json!({}));
    let reply = request_reply(&mut query, &session, &msg, Duration::from_secs(5)).await;
    assert_eq!(reply.content["engines"]["0"]["queue"], 0);

    // silence the heart: one missed beacon is death
    stop.send(true).unwrap();
    let departed = await_notification(
        &mut notifications,
        &session,
        MsgType::UnregistrationNotification,
        Duration::from_secs(5),
    )
    .await;
    assert_eq!(departed["engine_id"], 0);

    let msg = session.msg(MsgType::QueueRequest, json!({}));
    let reply = request_reply(&mut query, &session, &msg, Duration::from_secs(5)).await;
    assert_eq!(reply.content["engines"], json!({}));

    // re-registration of the same identity now yields a fresh id
    let (engine_id, _) = register_engine(&mut reg, &session, "engine-itest-1").await;
    assert_eq!(engine_id, 1);

    let msg = session.msg(MsgType::ShutdownRequest, json!({}));
    let reply = request_reply(&mut query, &session, &msg, Duration::from_secs(5)).await;
    assert_eq!(reply.content["status"], "ok");
    controller.join().await;
}

#[tokio::test]
async fn direct_requests_flow_and_settle_the_ledger() {
    let controller = Controller::start(test_config()).await.unwrap();
    let endpoints = controller.endpoints().clone();
    let ctx = ZmqContext::new();
    let session = Session::new("itest", None);

    let mut notifications = subscriber_connect(&ctx, &endpoints.notification).unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let mut reg = dealer_connect(&ctx, &endpoints.registration, b"itest-reg-2").unwrap();
    register_engine(&mut reg, &session, "engine-itest-2").await;
    let stop = spawn_heartbeats(
        &ctx,
        &endpoints.heartbeat.0,
        &endpoints.heartbeat.1,
        b"engine-itest-2",
    );
    await_notification(
        &mut notifications,
        &session,
        MsgType::RegistrationNotification,
        Duration::from_secs(5),
    )
    .await;

    // a fake engine serving the mux channel
    let engine_session = Session::new("engine-itest-2", None);
    let mut engine_mux =
        dealer_connect(&ctx, &endpoints.mux.1, b"engine-itest-2").unwrap();
    tokio::spawn(async move {
        while let Some(Ok(received)) = engine_mux.next().await {
            let request = match engine_session.deserialize(&to_frames(received)) {
                Ok(msg) => msg,
                Err(_) => continue,
            };
            let args: Vec<i64> = request.content["args"]
                .as_array()
                .map(|a| a.iter().filter_map(Value::as_i64).collect())
                .unwrap_or_default();
            let reply = engine_session
                .reply(
                    MsgType::ApplyReply,
                    &request.header,
                    json!({"status": "ok", "result": args.iter().sum::<i64>()}),
                )
                .with_idents(request.idents.clone());
            let _ = engine_mux
                .send(to_multipart(engine_session.serialize(&reply).unwrap()))
                .await;
        }
    });
    tokio::time::sleep(Duration::from_millis(300)).await;

    // client sends apply(sum, [1, 2]) addressed at the engine
    let mut client_mux = dealer_connect(&ctx, &endpoints.mux.0, b"itest-client-2").unwrap();
    let mut request = session.msg(MsgType::ApplyRequest, json!({"f": "sum", "args": [1, 2]}));
    request.idents = vec![Bytes::from_static(b"engine-itest-2")];
    let reply = request_reply(&mut client_mux, &session, &request, Duration::from_secs(5)).await;
    assert_eq!(reply.content["status"], "ok");
    assert_eq!(reply.content["result"], 3);

    // the hub observed both directions on the monitor and settled the ledger
    let mut query = dealer_connect(&ctx, &endpoints.query, b"itest-client-2q").unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let msg = session.msg(MsgType::QueueRequest, json!({}));
        let reply = request_reply(&mut query, &session, &msg, Duration::from_secs(5)).await;
        if reply.content["engines"]["0"]["completed"] == json!(1) {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "ledger never completed: {}",
            reply.content
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let msg = session.msg(
        MsgType::ResultRequest,
        json!({"msg_ids": [request.msg_id()]}),
    );
    let reply = request_reply(&mut query, &session, &msg, Duration::from_secs(5)).await;
    assert_eq!(reply.content["records"][0]["status"], "completed");
    assert_eq!(reply.content["records"][0]["result_content"]["result"], 3);

    // purge removes it from subsequent lookups
    let msg = session.msg(
        MsgType::PurgeRequest,
        json!({"msg_ids": [request.msg_id()]}),
    );
    let reply = request_reply(&mut query, &session, &msg, Duration::from_secs(5)).await;
    assert_eq!(reply.content["purged"], 1);

    let msg = session.msg(
        MsgType::ResultRequest,
        json!({"msg_ids": [request.msg_id()]}),
    );
    let reply = request_reply(&mut query, &session, &msg, Duration::from_secs(5)).await;
    assert_eq!(reply.content["ename"], "unknown_request");

    stop.send(true).unwrap();
    controller.shutdown();
    controller.join().await;
}
