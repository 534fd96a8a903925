//! Proxy Tests - identity, reference counting and lifetime
//!
//! These tests cover objects passed by reference:
//! - One proxy per remote target
//! - References given back on release and on drop
//! - Objects coming home resolve to the original
//! - Relaying calls through a proxy of a proxy (A -> B -> C)

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use distobj::{Argument, Connection, ConnectionConfig, DoError, DoObject, ObjectBuilder, ObjectHandle};
use do_coder::Value;

fn client_object(count: i32) -> Arc<dyn DoObject> {
    ObjectBuilder::new("ClientObject")
        .method("count", "i@:", move |_: &(), inv| inv.set_return_value(Value::Int(count)))
        .unwrap()
        .build(())
}

#[tokio::test]
async fn test_same_target_returns_same_proxy() {
    let root = bench(0);
    let root_object: Arc<dyn DoObject> = root.clone();
    let (_client, server, first) = connected(root).await;
    let client = first.connection().unwrap();

    let second = client.root_proxy().await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.remote_references(), 2);
    assert_eq!(client.proxy_count(), 1);
    assert_eq!(server.exported_refs(&root_object), Some(2));
}

#[tokio::test]
async fn test_release_returns_references() {
    let root = bench(0);
    let root_object: Arc<dyn DoObject> = root.clone();
    let (client, server, proxy) = connected(root).await;
    client.root_proxy().await.unwrap();
    assert_eq!(server.exported_refs(&root_object), Some(2));

    proxy.release().await.unwrap();
    let released = wait_until(Duration::from_secs(2), || {
        let server = server.clone();
        let root_object = root_object.clone();
        async move { server.exported_refs(&root_object) == Some(0) }
    })
    .await;
    assert!(released);
    // The root stays exported for later requests.
    assert_eq!(server.exported_count(), 1);
    assert_eq!(client.proxy_count(), 0);
    assert!(matches!(
        proxy.forward("count", vec![]).await,
        Err(DoError::ProxyReleased(_))
    ));

    let fresh = client.root_proxy().await.unwrap();
    assert!(!Arc::ptr_eq(&fresh, &proxy));
    assert_eq!(fresh.forward("count", vec![]).await.unwrap().as_i64(), Some(0));
}

#[tokio::test]
async fn test_dropped_proxy_releases() {
    let root = bench(0);
    let root_object: Arc<dyn DoObject> = root.clone();
    let (client, server, proxy) = connected(root).await;
    assert_eq!(server.exported_refs(&root_object), Some(1));

    drop(proxy);
    assert_eq!(client.proxy_count(), 0);
    let released = wait_until(Duration::from_secs(2), || {
        let server = server.clone();
        let root_object = root_object.clone();
        async move { server.exported_refs(&root_object) == Some(0) }
    })
    .await;
    assert!(released);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_callback_releases_client_object() {
    let (client, _server, proxy) = connected(bench(0)).await;
    let local = client_object(9);

    let answer = proxy
        .forward("callBack:", vec![Argument::object(ObjectHandle::Local(local.clone()))])
        .await
        .unwrap();
    assert_eq!(answer.as_i64(), Some(10));

    let released = wait_until(Duration::from_secs(2), || {
        let client = client.clone();
        async move { client.exported_count() == 0 }
    })
    .await;
    assert!(released);
}

#[tokio::test]
async fn test_object_comes_home_as_original() {
    let (_client, _server, proxy) = connected(bench(0)).await;
    let local = client_object(1);

    // Not copyable, so `bycopy` falls back to a reference.
    let echoed = proxy
        .forward("echo:", vec![Argument::object(ObjectHandle::Local(local.clone()))])
        .await
        .unwrap();
    let handle = echoed.handle().unwrap();
    assert!(!handle.is_proxy());
    assert!(handle.same_object(&ObjectHandle::Local(local)));
}

#[tokio::test]
async fn test_server_sees_one_proxy_per_object() {
    let root = bench(0);
    let (_client, server, proxy) = connected(root.clone()).await;
    let kept = client_object(1);
    let other = client_object(2);

    proxy
        .forward("keep:", vec![Argument::object(ObjectHandle::Local(kept.clone()))])
        .await
        .unwrap();
    let same = proxy
        .forward("isKept:", vec![Argument::object(ObjectHandle::Local(kept))])
        .await
        .unwrap();
    assert_eq!(same.value(), Some(&Value::Bool(true)));
    let same = proxy
        .forward("isKept:", vec![Argument::object(ObjectHandle::Local(other))])
        .await
        .unwrap();
    assert_eq!(same.value(), Some(&Value::Bool(false)));
    assert!(server.proxy_count() >= 1);
}

#[tokio::test]
async fn test_dropping_connection_kills_proxies() {
    let (client, server, proxy) = connected(bench(0)).await;
    assert!(proxy.is_valid());

    drop(client);
    assert!(!proxy.is_valid());
    assert!(proxy.connection().is_none());
    assert!(matches!(
        proxy.forward("count", vec![]).await,
        Err(DoError::ConnectionInvalid)
    ));
    tokio::time::timeout(Duration::from_secs(1), server.closed())
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_relay_through_proxy() {
    init_tracing();
    let config = ConnectionConfig::default();

    // C vends the bench; B vends its proxy for C's root; A talks to B.
    let (b_to_c, c) = Connection::local_pair(config.clone());
    c.set_root_object(bench(21));
    let c_root = b_to_c.root_proxy().await.unwrap();

    let (a, b) = Connection::local_pair(config);
    b.set_root_object(c_root.clone());
    let relay = a.root_proxy().await.unwrap();

    assert_eq!(relay.forward("count", vec![]).await.unwrap().as_i64(), Some(21));
    let total = relay.forward("add:", vec![Value::Int(21).into()]).await.unwrap();
    assert_eq!(total.as_i64(), Some(42));
    let err = relay.forward("fail:", vec![Argument::string("relayed")]).await.unwrap_err();
    match err {
        DoError::RemoteException { name, reason } => {
            assert_eq!(name, BENCH_FAILURE);
            assert_eq!(reason, "relayed");
        }
        other => panic!("unexpected error {:?}", other),
    }
}
