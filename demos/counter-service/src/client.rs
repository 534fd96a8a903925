//! Counter Client
//!
//! Run with: cargo run --bin counter-client -- --host 127.0.0.1 --port 5100

use std::net::SocketAddr;

use clap::Parser;
use distobj::{Argument, Connection, ConnectionConfig, ObjectBuilder, ObjectHandle};
use do_coder::Value;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "counter-client")]
#[command(about = "Distributed Objects Counter Client")]
struct Args {
    /// Server host
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Server port
    #[arg(short, long, default_value = "5100")]
    port: u16,

    /// Amount to add
    #[arg(short, long, default_value = "5")]
    amount: i32,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Set up logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = Args::parse();
    let addr: SocketAddr = format!("{}:{}", args.host, args.port).parse()?;

    info!("Connecting to Counter server at {}", addr);
    let connection = Connection::connect_tcp(addr, ConnectionConfig::default()).await?;
    let counter = connection.root_proxy().await?;

    let count = counter.forward("count", vec![]).await?;
    info!("count = {:?}", count.as_i64());

    let total = counter.forward("add:", vec![Value::Int(args.amount).into()]).await?;
    info!("add({}) = {:?}", args.amount, total.as_i64());

    // The server calls back into this object to learn the amount.
    let amount = args.amount;
    let source = ObjectBuilder::new("AmountSource")
        .method("amount", "i@:", move |_: &(), inv| inv.set_return_value(Value::Int(amount)))?
        .build(());
    let total = counter
        .forward("addFrom:", vec![Argument::object(ObjectHandle::local(source))])
        .await?;
    info!("addFrom({}) = {:?}", amount, total.as_i64());

    counter.forward("reset", vec![]).await?;
    info!("reset sent");

    let stats = connection.stats();
    info!(
        "Sent {} requests, received {} replies",
        stats.requests_sent, stats.replies_received
    );
    connection.close().await;
    Ok(())
}
