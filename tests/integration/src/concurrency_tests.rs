//! Concurrency Tests - many calls in flight on one connection
//!
//! These tests exercise the pending-call table:
//! - Slow calls do not hold up fast ones
//! - Invalidation fails every pending call
//! - Timeouts leave nothing behind

mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;

use common::*;
use distobj::{Argument, Connection, ConnectionConfig, DoError};
use do_coder::Value;

fn sleep_args(millis: u32, value: i32) -> Vec<Argument> {
    vec![Value::UInt(millis).into(), Value::Int(value).into()]
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_slow_call_does_not_block_fast_calls() {
    let (_client, _server, proxy) = connected(bench(7)).await;

    let slow = tokio::spawn({
        let proxy = proxy.clone();
        async move { proxy.forward("sleep:thenReturn:", sleep_args(600, 99)).await }
    });

    let start = Instant::now();
    for _ in 0..10 {
        let count = proxy.forward("count", vec![]).await.unwrap();
        assert_eq!(count.as_i64(), Some(7));
    }
    assert!(start.elapsed() < Duration::from_millis(600));
    assert!(!slow.is_finished());

    let slow = slow.await.unwrap().unwrap();
    assert_eq!(slow.as_i64(), Some(99));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_concurrent_calls() {
    let root = bench(0);
    let (client, _server, proxy) = connected(root.clone()).await;

    let calls = (0..50).map(|_| {
        let proxy = proxy.clone();
        async move { proxy.forward("add:", vec![Value::Int(1).into()]).await }
    });
    let totals: HashSet<i64> = join_all(calls)
        .await
        .into_iter()
        .map(|result| result.unwrap().as_i64().unwrap())
        .collect();

    assert_eq!(totals, (1..=50).collect::<HashSet<i64>>());
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_invalidate_fails_all_pending() {
    let (client, _server, proxy) = connected(bench(0)).await;
    // Warm the signature cache so every call is a single request.
    proxy.forward("sleep:thenReturn:", sleep_args(0, 0)).await.unwrap();

    let calls: Vec<_> = (0..5)
        .map(|i| {
            let proxy = proxy.clone();
            tokio::spawn(async move { proxy.forward("sleep:thenReturn:", sleep_args(800, i)).await })
        })
        .collect();

    let all_pending = wait_until(Duration::from_secs(2), || {
        let client = client.clone();
        async move { client.pending_requests() == 5 }
    })
    .await;
    assert!(all_pending);

    client.invalidate();
    for call in calls {
        assert!(matches!(call.await.unwrap(), Err(DoError::ConnectionInvalid)));
    }
    assert_eq!(client.pending_requests(), 0);
    assert!(!proxy.is_valid());
    assert!(matches!(
        proxy.forward("count", vec![]).await,
        Err(DoError::ConnectionInvalid)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_timeout_leaves_no_pending_entry() {
    init_tracing();
    let config = ConnectionConfig::builder()
        .reply_timeout(Duration::from_millis(100))
        .build();
    let (client, server) = Connection::local_pair(config);
    server.set_root_object(bench(1));
    let proxy = client.root_proxy().await.unwrap();

    let err = proxy
        .forward("sleep:thenReturn:", sleep_args(400, 0))
        .await
        .unwrap_err();
    assert!(matches!(err, DoError::Timeout));
    assert_eq!(client.pending_requests(), 0);
    assert_eq!(client.stats().timeouts, 1);

    // The late reply is dropped and the connection keeps working.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(client.is_valid());
    assert_eq!(proxy.forward("count", vec![]).await.unwrap().as_i64(), Some(1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_per_call_timeout() {
    let (client, _server, _proxy) = connected(bench(0)).await;
    let result = client
        .send_invocation("anything", bytes::Bytes::new(), Some(Duration::from_millis(50)))
        .await;
    // The peer answers garbage requests with an exception reply, so either
    // outcome is fine as long as nothing is left pending.
    assert!(matches!(result, Ok(_) | Err(DoError::Timeout)));
    assert_eq!(client.pending_requests(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_peer_close_fails_pending() {
    let (client, server, proxy) = connected(bench(0)).await;
    proxy.forward("sleep:thenReturn:", sleep_args(0, 0)).await.unwrap();

    let call = tokio::spawn({
        let proxy = Arc::clone(&proxy);
        async move { proxy.forward("sleep:thenReturn:", sleep_args(500, 1)).await }
    });
    let pending = wait_until(Duration::from_secs(2), || {
        let client = client.clone();
        async move { client.pending_requests() == 1 }
    })
    .await;
    assert!(pending);

    server.close().await;
    assert!(matches!(call.await.unwrap(), Err(DoError::ConnectionInvalid)));
    tokio::time::timeout(Duration::from_secs(1), client.closed())
        .await
        .unwrap();
}
