//! Transport Tests - distributed objects over real sockets
//!
//! These tests run the same calls over:
//! - TCP through `DoServer`
//! - UDP, one frame per datagram

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::oneshot;

use common::*;
use distobj::{
    Argument, Connection, ConnectionConfig, DoServer, ObjectBuilder, ObjectCopy, ObjectHandle, ServerConfig,
};
use do_coder::Value;
use do_port::{PortConfig, UdpPort};

async fn start_server(config: ServerConfig) -> (SocketAddr, Arc<DoServer>, oneshot::Sender<()>) {
    init_tracing();
    let listener = DoServer::listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(DoServer::with_config(bench(3), config));
    let (stop, stopped) = oneshot::channel::<()>();
    tokio::spawn({
        let server = server.clone();
        async move {
            server
                .serve_until(listener, async {
                    let _ = stopped.await;
                })
                .await
        }
    });
    (addr, server, stop)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_tcp_round_trip() {
    let (addr, server, stop) = start_server(ServerConfig::default()).await;

    let client = Connection::connect_tcp(addr, ConnectionConfig::default()).await.unwrap();
    let proxy = client.root_proxy().await.unwrap();

    assert_eq!(proxy.forward("count", vec![]).await.unwrap().as_i64(), Some(3));
    let greeting = proxy.forward("greet:", vec![Argument::string("tcp")]).await.unwrap();
    assert_eq!(greeting.as_str(), Some("hello, tcp"));
    let echoed = proxy
        .forward("echo:", vec![Argument::object(ObjectHandle::Copy(ObjectCopy::string("over the wire")))])
        .await
        .unwrap();
    assert_eq!(echoed.handle().and_then(ObjectHandle::as_copy).and_then(ObjectCopy::as_str), Some("over the wire"));

    assert_eq!(server.stats().snapshot().connections_accepted, 1);

    let _ = stop.send(());
    tokio::time::timeout(Duration::from_secs(2), client.closed())
        .await
        .unwrap();
    assert!(!proxy.is_valid());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_tcp_callback_to_client_object() {
    let (addr, _server, _stop) = start_server(ServerConfig::default()).await;
    let client = Connection::connect_tcp(addr, ConnectionConfig::default()).await.unwrap();
    let proxy = client.root_proxy().await.unwrap();

    let local = ObjectBuilder::new("ClientCounter")
        .method("count", "i@:", |_: &(), inv| inv.set_return_value(Value::Int(41)))
        .unwrap()
        .build(());
    let answer = proxy
        .forward("callBack:", vec![Argument::object(ObjectHandle::local(local))])
        .await
        .unwrap();
    assert_eq!(answer.as_i64(), Some(42));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_tcp_connection_limit() {
    let (addr, server, _stop) = start_server(ServerConfig::default().with_max_connections(1)).await;

    let first = Connection::connect_tcp(addr, ConnectionConfig::default()).await.unwrap();
    let proxy = first.root_proxy().await.unwrap();
    assert_eq!(proxy.forward("count", vec![]).await.unwrap().as_i64(), Some(3));

    // The second socket is accepted by the OS and then closed by the server.
    if let Ok(second) = Connection::connect_tcp(addr, ConnectionConfig::default()).await {
        assert!(second.root_proxy().await.is_err());
    }
    let rejected = wait_until(Duration::from_secs(2), || {
        let server = server.clone();
        async move { server.stats().snapshot().connections_rejected == 1 }
    })
    .await;
    assert!(rejected);
    assert!(first.is_valid());
}

async fn udp_pair(config: &PortConfig) -> (UdpPort, UdpPort) {
    let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let (a_addr, b_addr) = (a.local_addr().unwrap(), b.local_addr().unwrap());
    (
        UdpPort::from_socket(a, b_addr, config).await.unwrap(),
        UdpPort::from_socket(b, a_addr, config).await.unwrap(),
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_udp_round_trip() {
    init_tracing();
    let config = ConnectionConfig::default();
    let (a, b) = udp_pair(&config.port_config()).await;
    let client = Connection::with_port(Arc::new(a), config.clone());
    let server = Connection::with_port(Arc::new(b), config);
    server.set_root_object(bench(5));

    let proxy = client.root_proxy().await.unwrap();
    assert_eq!(proxy.forward("count", vec![]).await.unwrap().as_i64(), Some(5));
    let total = proxy.forward("add:", vec![Value::Int(10).into()]).await.unwrap();
    assert_eq!(total.as_i64(), Some(15));
    let length = proxy.forward("length:", vec![Argument::string("datagram")]).await.unwrap();
    assert_eq!(length.as_i64(), Some(8));

    client.close().await;
    tokio::time::timeout(Duration::from_secs(1), server.closed())
        .await
        .unwrap();
}
