//! # collab-relay
//!
//! Standalone relay: accepts WebSocket connections from `WsPubSub` clients
//! and fans broadcasts and membership out per topic.
//!
//! ```text
//! collab-relay --bind 0.0.0.0:9091
//! COLLAB_RELAY_BIND=0.0.0.0:9091 RUST_LOG=info collab-relay
//! ```

use clap::Parser;
use collab_sync::{RelayConfig, RelayServer};
use log::{error, info};

#[derive(Parser, Debug)]
#[command(name = "collab-relay")]
#[command(about = "Topic pub/sub relay for realtime document sync")]
#[command(version)]
struct Args {
    /// Address to listen on
    #[arg(long, env = "COLLAB_RELAY_BIND", default_value = "127.0.0.1:9091")]
    bind: String,

    /// Per-topic broadcast buffer; slower subscribers skip ahead
    #[arg(long, env = "COLLAB_RELAY_CAPACITY", default_value_t = 256)]
    capacity: usize,

    /// Subscriptions a single connection may hold
    #[arg(long, env = "COLLAB_RELAY_MAX_SUBSCRIPTIONS", default_value_t = 64)]
    max_subscriptions: usize,
}

impl Args {
    fn relay_config(&self) -> RelayConfig {
        RelayConfig::default()
            .with_bind_addr(self.bind.clone())
            .with_topic_capacity(self.capacity)
            .with_max_subscriptions_per_connection(self.max_subscriptions)
    }
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let args = Args::parse();

    info!("Starting collab-relay on {}", args.bind);
    let server = RelayServer::new(args.relay_config());

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Relay stopped: {e}");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            let stats = server.stats();
            info!(
                "Shutting down ({} connections served, {} frames relayed)",
                stats.total_connections, stats.total_frames
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["collab-relay"]);
        let config = args.relay_config();
        assert_eq!(config.topic_capacity, 256);
        assert_eq!(config.max_subscriptions_per_connection, 64);
    }

    #[test]
    fn test_flags_override() {
        let args = Args::parse_from([
            "collab-relay",
            "--bind",
            "0.0.0.0:7000",
            "--capacity",
            "32",
            "--max-subscriptions",
            "4",
        ]);
        let config = args.relay_config();
        assert_eq!(config.bind_addr, "0.0.0.0:7000");
        assert_eq!(config.topic_capacity, 32);
        assert_eq!(config.max_subscriptions_per_connection, 4);
    }
}
