//! Counter Server
//!
//! Vends a shared counter as the root object of every connection.
//!
//! Run with: cargo run --bin counter-server -- --port 5100

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, Ordering};

use clap::Parser;
use distobj::{DoError, DoServer, ObjectBuilder, ObjectHandle, ServerConfig};
use do_coder::Value;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "counter-server")]
#[command(about = "Distributed Objects Counter Server")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "5100")]
    port: u16,

    /// Host to bind to
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Maximum concurrent connections
    #[arg(long, default_value = "64")]
    max_connections: usize,

    /// Initial counter value
    #[arg(long, default_value = "0")]
    start: i32,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Set up logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = Args::parse();
    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;

    let counter = ObjectBuilder::new("Counter")
        .method("count", "i@:", |count: &AtomicI32, inv| {
            inv.set_return_value(Value::Int(count.load(Ordering::SeqCst)))
        })?
        .method("add:", "i@:i", |count: &AtomicI32, inv| {
            let amount = inv.integer(0)? as i32;
            let total = count.fetch_add(amount, Ordering::SeqCst) + amount;
            info!("add({}) = {}", amount, total);
            inv.set_return_value(Value::Int(total))
        })?
        .method("reset", "Vv@:", |count: &AtomicI32, _inv| {
            count.store(0, Ordering::SeqCst);
            info!("counter reset");
            Ok(())
        })?
        .method("addFrom:", "i@:@", |count: &AtomicI32, inv| {
            // Ask the caller's object for the amount.
            let Some(ObjectHandle::Proxy(source)) = inv.object(0)?.cloned() else {
                return Err(DoError::exception("NotAProxy", "addFrom: expects an object by reference"));
            };
            let amount = source.forward_blocking("amount", vec![])?;
            let amount = amount.as_i64().unwrap_or_default() as i32;
            let total = count.fetch_add(amount, Ordering::SeqCst) + amount;
            info!("addFrom({}) = {}", amount, total);
            inv.set_return_value(Value::Int(total))
        })?
        .build(AtomicI32::new(args.start));

    let config = ServerConfig::default().with_max_connections(args.max_connections);
    let server = DoServer::with_config(counter, config);

    info!("Starting Counter Server on {}", addr);
    server
        .run_until(addr, async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await?;

    let stats = server.stats().snapshot();
    info!(
        "Served {} connections ({} rejected)",
        stats.connections_accepted, stats.connections_rejected
    );
    Ok(())
}
