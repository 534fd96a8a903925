//! Invocation Tests - method calls through a root proxy
//!
//! These tests cover every kind of argument a call can carry:
//! - Scalars, C strings and structs
//! - Objects by copy
//! - Out and inout pointers
//! - Remote exceptions and unknown selectors
//! - Oneway methods
//! - Native method implementations

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use distobj::{Argument, DoError, DoObject, ObjectBuilder, ObjectCopy, ObjectHandle};
use do_coder::{ClassRef, Value};

#[tokio::test]
async fn test_count_returns_value() {
    let (_client, _server, proxy) = connected(bench(3)).await;
    let count = proxy.forward("count", vec![]).await.unwrap();
    assert_eq!(count.value(), Some(&Value::UInt(3)));
}

#[tokio::test]
async fn test_add_updates_remote_state() {
    let root = bench(10);
    let (_client, _server, proxy) = connected(root.clone()).await;

    let total = proxy.forward("add:", vec![Value::Int(5).into()]).await.unwrap();
    assert_eq!(total.as_i64(), Some(15));
    let total = proxy.forward("add:", vec![Value::Int(-20).into()]).await.unwrap();
    assert_eq!(total.as_i64(), Some(-5));
    assert_eq!(root.state().count.load(Ordering::SeqCst), -5);
}

#[tokio::test]
async fn test_c_strings() {
    let (_client, _server, proxy) = connected(bench(0)).await;

    let greeting = proxy.forward("greet:", vec![Argument::string("world")]).await.unwrap();
    assert_eq!(greeting.as_str(), Some("hello, world"));

    let greeting = proxy
        .forward("greet:", vec![Value::CString(None).into()])
        .await
        .unwrap();
    assert_eq!(greeting.as_str(), Some("hello"));

    let length = proxy.forward("length:", vec![Argument::string("distributed")]).await.unwrap();
    assert_eq!(length.as_i64(), Some(11));
}

#[tokio::test]
async fn test_bycopy_string_arrives_as_copy() {
    let (_client, _server, proxy) = connected(bench(0)).await;
    let hello = ObjectHandle::Copy(ObjectCopy::string("hello"));

    let class = proxy.forward("className:", vec![Argument::object(hello.clone())]).await.unwrap();
    assert_eq!(class.as_str(), Some("String"));

    let echoed = proxy.forward("echo:", vec![Argument::object(hello)]).await.unwrap();
    let copy = echoed.handle().and_then(ObjectHandle::as_copy).unwrap();
    assert_eq!(copy.as_str(), Some("hello"));
    assert!(copy.is_isomorphic(&ObjectCopy::string("hello")));
}

/// A local object that knows how to write itself by value
fn copyable_counter(count: u32) -> Arc<dyn DoObject> {
    ObjectBuilder::new("Counter")
        .method("count", "I@:", |count: &u32, inv| inv.set_return_value(Value::UInt(*count)))
        .unwrap()
        .copy_with(|count, graph| graph.add_object(ClassRef::new("Counter"), vec![Value::UInt(*count)]))
        .build(count)
}

#[tokio::test]
async fn test_bycopy_parameter_copies_local_object() {
    let (_client, _server, proxy) = connected(bench(0)).await;
    let counter = copyable_counter(5);

    let arrival = proxy
        .forward("arrivalOfCopy:", vec![Argument::object(ObjectHandle::Local(counter.clone()))])
        .await
        .unwrap();
    assert_eq!(arrival.as_str(), Some("copy:Counter"));

    let echoed = proxy
        .forward("echo:", vec![Argument::object(ObjectHandle::Local(counter))])
        .await
        .unwrap();
    let copy = echoed.handle().and_then(ObjectHandle::as_copy).unwrap();
    assert_eq!(copy.node().unwrap().fields, vec![Value::UInt(5)]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_plain_parameter_passes_local_object_by_reference() {
    let (client, _server, proxy) = connected(bench(0)).await;
    let counter = copyable_counter(5);

    let arrival = proxy
        .forward("arrivalOf:", vec![Argument::object(ObjectHandle::Local(counter.clone()))])
        .await
        .unwrap();
    assert_eq!(arrival.as_str(), Some("proxy"));

    // Calls through the peer's proxy land on the original.
    let answer = proxy
        .forward("callBack:", vec![Argument::object(ObjectHandle::Local(counter))])
        .await
        .unwrap();
    assert_eq!(answer.as_i64(), Some(6));
    let released = wait_until(Duration::from_secs(2), || {
        let client = client.clone();
        async move { client.exported_count() == 0 }
    })
    .await;
    assert!(released);
}

#[tokio::test]
async fn test_nil_object() {
    let (_client, _server, proxy) = connected(bench(0)).await;
    let class = proxy.forward("className:", vec![Argument::nil()]).await.unwrap();
    assert!(matches!(class, Argument::Scalar(Value::CString(None))));
    let echoed = proxy.forward("echo:", vec![Argument::nil()]).await.unwrap();
    assert!(matches!(echoed, Argument::Object(None)));
}

#[tokio::test]
async fn test_inout_pointer() {
    let (_client, _server, proxy) = connected(bench(0)).await;
    let outcome = proxy
        .forward_with_outputs(
            "divide:by:remainder:",
            vec![
                Value::Int(17).into(),
                Value::Int(5).into(),
                Argument::Pointer(Some(Value::Int(0))),
            ],
        )
        .await
        .unwrap();
    assert_eq!(outcome.return_value.as_i64(), Some(3));
    assert_eq!(outcome.arguments[2].as_i64(), Some(2));
}

#[tokio::test]
async fn test_null_inout_pointer_stays_null() {
    let (_client, _server, proxy) = connected(bench(0)).await;
    let outcome = proxy
        .forward_with_outputs(
            "divide:by:remainder:",
            vec![Value::Int(9).into(), Value::Int(2).into(), Argument::Pointer(None)],
        )
        .await
        .unwrap();
    assert_eq!(outcome.return_value.as_i64(), Some(4));
    assert!(matches!(outcome.arguments[2], Argument::Pointer(None)));
}

#[tokio::test]
async fn test_out_pointer() {
    let (_client, _server, proxy) = connected(bench(0)).await;
    let outcome = proxy
        .forward_with_outputs("fill:", vec![Argument::Pointer(Some(Value::Double(0.0)))])
        .await
        .unwrap();
    assert!(matches!(outcome.return_value, Argument::Void));
    assert_eq!(outcome.arguments[0].as_f64(), Some(2.5));
}

#[tokio::test]
async fn test_struct_by_value() {
    let (_client, _server, proxy) = connected(bench(0)).await;
    let a = Value::Struct(vec![Value::Int(2), Value::Int(10)]);
    let b = Value::Struct(vec![Value::Int(8), Value::Int(-4)]);
    let mid = proxy.forward("midpoint:and:", vec![a.into(), b.into()]).await.unwrap();
    assert_eq!(
        mid.value(),
        Some(&Value::Struct(vec![Value::Int(5), Value::Int(3)]))
    );
}

#[tokio::test]
async fn test_remote_exception() {
    let (client, _server, proxy) = connected(bench(0)).await;
    let err = proxy
        .forward("fail:", vec![Argument::string("disk on fire")])
        .await
        .unwrap_err();
    match err {
        DoError::RemoteException { name, reason } => {
            assert_eq!(name, BENCH_FAILURE);
            assert_eq!(reason, "disk on fire");
        }
        other => panic!("unexpected error {:?}", other),
    }
    // The connection survives an exception.
    assert!(client.is_valid());
    assert_eq!(proxy.forward("count", vec![]).await.unwrap().as_i64(), Some(0));
}

#[tokio::test]
async fn test_unknown_selector() {
    let (_client, _server, proxy) = connected(bench(0)).await;
    let err = proxy.forward("launchRockets", vec![]).await.unwrap_err();
    assert!(matches!(err, DoError::UnknownSelector { .. }), "{:?}", err);
}

#[tokio::test]
async fn test_argument_checks() {
    let (_client, _server, proxy) = connected(bench(0)).await;
    assert!(matches!(
        proxy.forward("add:", vec![]).await,
        Err(DoError::Protocol(_))
    ));
    assert!(matches!(
        proxy.forward("add:", vec![Argument::string("five")]).await,
        Err(DoError::Signature(_))
    ));
}

#[tokio::test]
async fn test_declared_signature_mismatch_is_rejected() {
    let (_client, _server, proxy) = connected(bench(0)).await;
    proxy.declare_method("count", "d@:").unwrap();
    let err = proxy.forward("count", vec![]).await.unwrap_err();
    match err {
        DoError::RemoteException { name, .. } => assert_eq!(name, "ProtocolError"),
        other => panic!("unexpected error {:?}", other),
    }
}

#[tokio::test]
async fn test_oneway_does_not_wait() {
    let root = bench(0);
    let (client, _server, proxy) = connected(root.clone()).await;

    for note in ["one", "two", "three"] {
        let result = proxy.forward("note:", vec![Argument::string(note)]).await.unwrap();
        assert!(matches!(result, Argument::Void));
    }
    assert_eq!(client.pending_requests(), 0);

    let delivered = wait_until(Duration::from_secs(2), || {
        let root = root.clone();
        async move { root.state().notes.lock().len() == 3 }
    })
    .await;
    assert!(delivered);
    let count = proxy.forward("noteCount", vec![]).await.unwrap();
    assert_eq!(count.as_i64(), Some(3));
}

#[cfg(all(target_endian = "little", any(all(target_arch = "x86_64", unix), target_arch = "aarch64")))]
mod native {
    use super::*;
    use distobj::{ConnectionConfig, Connection, ObjectBuilder};
    use std::ffi::{c_char, CStr};

    extern "C" fn triple(_receiver: usize, _cmd: *const c_char, value: i32) -> i32 {
        value * 3
    }

    extern "C" fn selector_length(_receiver: usize, cmd: *const c_char) -> u64 {
        // SAFETY: _cmd is the selector as a C string.
        unsafe { CStr::from_ptr(cmd) }.to_bytes().len() as u64
    }

    #[tokio::test]
    async fn test_native_implementation() {
        init_tracing();
        let object = unsafe {
            ObjectBuilder::<()>::new("Native")
                .native_method("triple:", "i@:i", triple as *const ())
                .unwrap()
                .native_method("selectorLength", "Q@:", selector_length as *const ())
                .unwrap()
        }
        .build(());

        let (client, server) = Connection::local_pair(ConnectionConfig::default());
        server.set_root_object(object);
        let proxy = client.root_proxy().await.unwrap();

        let tripled = proxy.forward("triple:", vec![Value::Int(14).into()]).await.unwrap();
        assert_eq!(tripled.as_i64(), Some(42));
        let length = proxy.forward("selectorLength", vec![]).await.unwrap();
        assert_eq!(length.as_i64(), Some("selectorLength".len() as i64));
    }
}
