//! Common test utilities for integration tests

#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

use distobj::{
    Argument, Connection, ConnectionConfig, DistantObject, DoError, Invocation, ObjectBuilder,
    ObjectHandle, TableObject,
};
use do_coder::Value;
use parking_lot::Mutex;
use tracing::info;

static INIT: Once = Once::new();

/// Initialize tracing once per test binary; honours RUST_LOG
pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Error name raised by `fail:`
pub const BENCH_FAILURE: &str = "BenchFailure";

/// State behind the bench object every test talks to
#[derive(Default)]
pub struct Bench {
    pub count: AtomicI32,
    pub calls: AtomicU64,
    pub notes: Mutex<Vec<String>>,
    pub kept: Mutex<Option<ObjectHandle>>,
}

impl Bench {
    pub fn with_count(count: i32) -> Self {
        Self {
            count: AtomicI32::new(count),
            ..Default::default()
        }
    }
}

fn point(x: i32, y: i32) -> Value {
    Value::Struct(vec![Value::Int(x), Value::Int(y)])
}

fn point_coords(value: Option<&Value>) -> Option<(i64, i64)> {
    match value {
        Some(Value::Struct(fields)) if fields.len() == 2 => Some((fields[0].as_i64()?, fields[1].as_i64()?)),
        _ => None,
    }
}

/// A root object exercising every argument kind
pub fn bench(count: i32) -> Arc<TableObject<Bench>> {
    build_bench()
        .expect("bench method types parse")
        .build(Bench::with_count(count))
}

/// How object argument 0 arrived: "nil", "proxy", "local" or "copy:<class>"
fn arrival(inv: &Invocation) -> distobj::Result<Value> {
    let arrival = match inv.object(0)? {
        None => "nil".to_string(),
        Some(ObjectHandle::Proxy(_)) => "proxy".to_string(),
        Some(ObjectHandle::Local(_)) => "local".to_string(),
        Some(ObjectHandle::Copy(copy)) => format!("copy:{}", copy.class_name().unwrap_or_default()),
    };
    Ok(Value::string(arrival))
}

fn build_bench() -> distobj::Result<ObjectBuilder<Bench>> {
    ObjectBuilder::new("Bench")
        .method("count", "I@:", |bench: &Bench, inv| {
            bench.calls.fetch_add(1, Ordering::SeqCst);
            inv.set_return_value(Value::UInt(bench.count.load(Ordering::SeqCst) as u32))
        })?
        .method("add:", "i@:i", |bench: &Bench, inv| {
            let amount = inv.integer(0)? as i32;
            let total = bench.count.fetch_add(amount, Ordering::SeqCst) + amount;
            inv.set_return_value(Value::Int(total))
        })?
        .method("sleep:thenReturn:", "i@:Ii", |_: &Bench, inv| {
            std::thread::sleep(Duration::from_millis(inv.integer(0)? as u64));
            let value = inv.integer(1)? as i32;
            inv.set_return_value(Value::Int(value))
        })?
        .method("length:", "I@:r*", |_: &Bench, inv| {
            let length = inv.string(0)?.map_or(0, str::len);
            inv.set_return_value(Value::UInt(length as u32))
        })?
        .method("greet:", "*@:*", |_: &Bench, inv| {
            let greeting = match inv.string(0)? {
                Some(name) => format!("hello, {}", name),
                None => "hello".to_string(),
            };
            inv.set_return_value(Value::string(greeting))
        })?
        .method("echo:", "O@@:O@", |_: &Bench, inv| {
            let handle = inv.object(0)?.cloned();
            inv.set_return_value(Argument::Object(handle))
        })?
        .method("className:", "*@:@", |_: &Bench, inv| {
            let name = match inv.object(0)? {
                None => None,
                Some(ObjectHandle::Copy(copy)) => copy.class_name().map(str::to_string),
                Some(ObjectHandle::Proxy(_)) => Some("proxy".to_string()),
                Some(ObjectHandle::Local(object)) => Some(object.class_name().to_string()),
            };
            inv.set_return_value(Value::CString(name))
        })?
        .method("divide:by:remainder:", "i@:ii^i", |_: &Bench, inv| {
            let (a, b) = (inv.integer(0)? as i32, inv.integer(1)? as i32);
            if b == 0 {
                return Err(DoError::exception("DivideByZero", "division by zero"));
            }
            inv.set_argument(2, Argument::Pointer(Some(Value::Int(a % b))))?;
            inv.set_return_value(Value::Int(a / b))
        })?
        .method("fill:", "v@:o^d", |_: &Bench, inv| {
            inv.set_argument(0, Argument::Pointer(Some(Value::Double(2.5))))
        })?
        .method("midpoint:and:", "{Point=ii}@:{Point=ii}{Point=ii}", |_: &Bench, inv| {
            let a = point_coords(inv.argument(0)?.value());
            let b = point_coords(inv.argument(1)?.value());
            let (Some((ax, ay)), Some((bx, by))) = (a, b) else {
                return Err(DoError::exception("BadPoint", "expected two points"));
            };
            inv.set_return_value(point(((ax + bx) / 2) as i32, ((ay + by) / 2) as i32))
        })?
        .method("fail:", "v@:*", |_: &Bench, inv| {
            let reason = inv.string(0)?.unwrap_or("no reason").to_string();
            Err(DoError::exception(BENCH_FAILURE, reason))
        })?
        .method("note:", "Vv@:*", |bench: &Bench, inv| {
            let note = inv.string(0)?.unwrap_or_default().to_string();
            bench.notes.lock().push(note);
            Ok(())
        })?
        .method("noteCount", "I@:", |bench: &Bench, inv| {
            let count = bench.notes.lock().len();
            inv.set_return_value(Value::UInt(count as u32))
        })?
        .method("callBack:", "i@:@", |_: &Bench, inv| {
            let Some(ObjectHandle::Proxy(proxy)) = inv.object(0)?.cloned() else {
                return Err(DoError::exception("NotAProxy", "expected an object by reference"));
            };
            let count = proxy.forward_blocking("count", vec![])?;
            let count = count.as_i64().unwrap_or_default() as i32;
            inv.set_return_value(Value::Int(count + 1))
        })?
        .method("arrivalOf:", "*@:@", |_: &Bench, inv| {
            let arrival = arrival(inv)?;
            inv.set_return_value(arrival)
        })?
        .method("arrivalOfCopy:", "*@:O@", |_: &Bench, inv| {
            let arrival = arrival(inv)?;
            inv.set_return_value(arrival)
        })?
        .method("keep:", "v@:@", |bench: &Bench, inv| {
            *bench.kept.lock() = inv.object(0)?.cloned();
            Ok(())
        })?
        .method("isKept:", "B@:@", |bench: &Bench, inv| {
            let same = match (inv.object(0)?, bench.kept.lock().as_ref()) {
                (Some(a), Some(b)) => a.same_object(b),
                _ => false,
            };
            inv.set_return_value(Value::Bool(same))
        })
}

/// A connected pair whose server side vends `root`
pub async fn connected(root: Arc<TableObject<Bench>>) -> (Connection, Connection, Arc<DistantObject>) {
    init_tracing();
    let (client, server) = Connection::local_pair(ConnectionConfig::default());
    server.set_root_object(root);
    let proxy = client.root_proxy().await.expect("root proxy");
    info!("Connected {:?} to root target {}", client, proxy.target());
    (client, server, proxy)
}

/// Poll `condition` until it holds or `timeout` passes
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

/// Deterministic xorshift generator
pub struct XorShift(u64);

impl XorShift {
    pub fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }

    pub fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    pub fn below(&mut self, n: u64) -> u64 {
        self.next() % n
    }
}
