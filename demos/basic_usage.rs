use std::time::Duration;
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::{info, Level};
use framewire::client::TcpClient;
use framewire::config::{ClientConfig, ServerConfig, TransportKind};
use framewire::events::ConnectionEvent;
use framewire::server::TcpServer;

#[derive(Parser)]
#[command(name = "basic usage")]
#[command(about = "A server and a client exchanging raw and typed frames", long_about = None)]
struct Cli {
    #[arg(long, default_value_t = format!("127.0.0.1"))]
    address: String,
    #[arg(long, default_value_t = 43434)]
    port: u16,
    /// use the generic stream transport instead of the socket transport
    #[arg(long)]
    stream: bool,
    #[arg(short, long)]
    debug: bool,
}

#[derive(Serialize, Deserialize, Debug)]
struct Test {
    a: String,
}

fn init_logging(debug: bool) {
    tracing_subscriber::fmt()
        .with_max_level(if debug { Level::DEBUG } else { Level::INFO })
        .with_thread_ids(true)
        .try_init()
        .ok();
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let transport_kind = if cli.stream { TransportKind::Stream } else { TransportKind::Auto };

    let mut server_config = ServerConfig::new(cli.address.clone(), cli.port);
    server_config.transport_kind = transport_kind;
    let server = TcpServer::new(server_config)?;

    server.on("test-bytes", |payload, _| {
        info!("length: {}", payload.len());
    })?;
    server.on_value("test-bytes", |message: Test, connection| {
        info!("A: {}", message.a);
        let _ = connection.send_value("test-bytes", &Test { a: format!("{} received", message.a) });
    })?;

    server.start()?;
    server.stop().await;
    server.start()?;

    let mut client_config = ClientConfig::new(cli.address, cli.port);
    client_config.transport_kind = transport_kind;
    let client = TcpClient::new(client_config)?;
    client.on_value("test-bytes", |message: Test, _| {
        info!("reply: {}", message.a);
    })?;

    let mut events = client.subscribe();
    client.connect();
    while let Ok(event) = events.recv().await {
        if let ConnectionEvent::Connected(_) = event {
            info!("connected client");
            break;
        }
    }

    client.send("test-bytes", vec![0u8, 2, 3, 5])?;
    client.send_value("test-bytes", &Test { a: "hello".to_string() })?;
    tokio::time::sleep(Duration::from_millis(500)).await;

    client.disconnect().await;
    server.stop().await;
    Ok(())
}
