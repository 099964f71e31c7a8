//! Multiplexing of calls over one transport.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use nfs_mamont_client::protocol::rpc::{Connection, ConnectionRegistry, Transport};
use nfs_mamont_client::Error;

mod support;

use support::{message, pipe};

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn replies_reach_their_callers_out_of_order() {
    support::init_tracing();
    let (transport, mut peer) = pipe();
    let conn = Connection::new(transport, Duration::from_secs(30));

    let first = tokio::spawn({
        let conn = conn.clone();
        async move { conn.send(1, &message(1, b"first"), WAIT).await }
    });
    assert_eq!(peer.next_xid().await, 1);
    let second = tokio::spawn({
        let conn = conn.clone();
        async move { conn.send(2, &message(2, b"second"), WAIT).await }
    });
    assert_eq!(peer.next_xid().await, 2);

    peer.reply(2, b"reply to second");
    peer.reply(1, b"reply to first");

    let second = second.await.expect("join").expect("second call");
    let first = first.await.expect("join").expect("first call");
    assert_eq!(first, message(1, b"reply to first"));
    assert_eq!(second, message(2, b"reply to second"));
    assert_eq!(conn.waiting(), 0);
}

#[tokio::test]
async fn unknown_xids_are_dropped() {
    let (transport, mut peer) = pipe();
    let conn = Connection::new(transport, Duration::from_secs(30));

    let call = tokio::spawn({
        let conn = conn.clone();
        async move { conn.send(7, &message(7, b"call"), WAIT).await }
    });
    assert_eq!(peer.next_xid().await, 7);
    peer.reply(99, b"stray");
    peer.reply(7, b"answer");

    let reply = call.await.expect("join").expect("call");
    assert_eq!(reply, message(7, b"answer"));
    assert!(!conn.is_failed());
}

#[tokio::test]
async fn timeout_unregisters_the_caller() {
    let (transport, mut peer) = pipe();
    let conn = Connection::new(transport, Duration::from_secs(30));

    let err = conn
        .send(5, &message(5, b"lost"), Duration::from_millis(50))
        .await
        .expect_err("nobody answers");
    assert!(matches!(err, Error::Timeout { attempts: 1, .. }), "{err:?}");
    assert!(!conn.is_waiting(5));
    assert_eq!(peer.next_xid().await, 5);

    // The late reply is discarded and the connection keeps working.
    peer.reply(5, b"late");
    let call = tokio::spawn({
        let conn = conn.clone();
        async move { conn.send(6, &message(6, b"next"), WAIT).await }
    });
    assert_eq!(peer.next_xid().await, 6);
    peer.reply(6, b"on time");
    assert_eq!(call.await.expect("join").expect("call"), message(6, b"on time"));
}

#[tokio::test]
async fn listener_failure_is_broadcast() {
    let (transport, mut peer) = pipe();
    let endpoint = transport.endpoint().clone();
    let registry =
        ConnectionRegistry::with_factory(Duration::from_secs(30), |_| -> Arc<dyn Transport> {
            pipe().0
        });
    let conn = registry.insert(transport);

    let pending: Vec<_> = (1..=3)
        .map(|xid| {
            let conn = conn.clone();
            tokio::spawn(async move { conn.send(xid, &message(xid, b"call"), WAIT).await })
        })
        .collect();
    for _ in 0..3 {
        peer.next_xid().await;
    }

    // Closing the reply side makes the transport report a dead connection.
    drop(peer);
    for call in pending {
        let err = call.await.expect("join").expect_err("listener died");
        assert!(matches!(err, Error::ConnectionFailed { .. }), "{err:?}");
    }
    assert!(conn.is_failed());

    let err = conn.send(4, &message(4, b"after"), WAIT).await.expect_err("connection is dead");
    assert!(matches!(err, Error::ConnectionFailed { .. }), "{err:?}");

    let replacement = registry.get(&endpoint);
    assert!(!Arc::ptr_eq(&conn, &replacement));
    assert!(!replacement.is_failed());
    assert_eq!(registry.len(), 1);
}

#[tokio::test]
async fn idle_connection_is_dropped_and_reopened() {
    let (transport, mut peer) = pipe();
    let conn = Connection::new(transport.clone(), Duration::from_millis(50));

    let call = tokio::spawn({
        let conn = conn.clone();
        async move { conn.send(1, &message(1, b"one"), WAIT).await }
    });
    peer.next_xid().await;
    peer.reply(1, b"one");
    call.await.expect("join").expect("first call");

    assert!(support::eventually(|| !conn.is_connected()).await);
    assert_eq!(transport.disconnects.load(Ordering::SeqCst), 1);

    let call = tokio::spawn({
        let conn = conn.clone();
        async move { conn.send(2, &message(2, b"two"), WAIT).await }
    });
    assert_eq!(peer.next_xid().await, 2);
    peer.reply(2, b"two");
    assert_eq!(call.await.expect("join").expect("second call"), message(2, b"two"));
    assert!(!conn.is_failed());
}
