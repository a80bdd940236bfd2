//! Reference demo: runs a `Hub` on a plain HTTP listener, logs connects,
//! disconnects, and inbound frames, and optionally publishes a timestamped
//! text message to a fixed set of channels on a fixed interval.
//!
//! Not part of the library — a thin illustration of wiring a `Hub` up, not an
//! API surface embedders depend on.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use wshub::{HubConfig, Message};

#[derive(Parser)]
#[command(name = "wshub-demo", about = "Reference demo for the wshub publish/subscribe hub")]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:8080")]
    addr: SocketAddr,

    /// HTTP path the WebSocket endpoint is served at.
    #[arg(long, default_value = "/ws")]
    path: String,

    /// Seconds between demo publishes. Omit to disable the publisher.
    #[arg(long)]
    publish: Option<u64>,

    /// Comma-separated channel names the demo publisher targets. Empty means
    /// every connected client.
    #[arg(long, value_delimiter = ',', default_value = "")]
    channels: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let args = Args::parse();
    let channels: Vec<wshub::ChannelName> = args.channels.into_iter().filter(|c| !c.is_empty()).map(Into::into).collect();

    let hub = wshub::Hub::new(HubConfig::from_env(), args.path.clone());

    hub.on_connect(std::sync::Arc::new(|id| {
        tracing::info!(%id, "client connected");
    }));
    hub.on_disconnect(std::sync::Arc::new(|id| {
        tracing::info!(%id, "client disconnected");
    }));
    hub.on_receive(std::sync::Arc::new(|id, message| {
        tracing::info!(%id, kind = ?message.kind(), len = message.len(), "message received");
    }));
    hub.on_error(std::sync::Arc::new(|id, err| {
        tracing::warn!(%id, %err, "client error");
    }));

    if let Some(interval_secs) = args.publish {
        let hub = hub.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
            let mut tick = 0u64;
            loop {
                ticker.tick().await;
                tick += 1;
                let delivered = hub.publish(Message::text(format!("tick {tick}")), &channels);
                tracing::debug!(tick, delivered, "published demo message");
            }
        });
    }

    let shutdown_hub = hub.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutting down");
        shutdown_hub.close().await;
        std::process::exit(0);
    });

    hub.listen_and_serve(args.addr).await
}
