use std::{net::SocketAddr, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::config::{
    DEFAULT_CLIENT_CAPACITY, DEFAULT_EVENT_CAPACITY, DEFAULT_MAX_BATCH, HubConfig, OverflowPolicy,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the broadcast hub, accepting TCP connections.
    Serve(ServeArgs),
    /// Connect to a hub and chat from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Socket address the hub should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:1234")]
    pub listen: SocketAddr,

    #[command(flatten)]
    pub hub: HubArgs,
}

#[derive(Args, Debug, Clone)]
pub struct HubArgs {
    /// Events that may wait for the broadcaster before Join and Send stall.
    #[arg(long, default_value_t = DEFAULT_EVENT_CAPACITY)]
    pub event_capacity: usize,

    /// Messages buffered per client between polls.
    #[arg(long, default_value_t = DEFAULT_CLIENT_CAPACITY)]
    pub client_capacity: usize,

    /// Most messages returned by a single poll.
    #[arg(long, default_value_t = DEFAULT_MAX_BATCH)]
    pub max_batch: usize,

    /// Poll timeout used when a caller passes zero or a negative value.
    #[arg(long, default_value_t = 25_000)]
    pub default_poll_timeout_ms: u64,

    /// What to do when a client's queue is full.
    #[arg(long, value_enum, default_value_t = OverflowPolicy::DropNewest)]
    pub overflow: OverflowPolicy,
}

impl From<HubArgs> for HubConfig {
    fn from(args: HubArgs) -> Self {
        Self {
            event_capacity: args.event_capacity,
            client_capacity: args.client_capacity,
            max_batch: args.max_batch,
            default_poll_timeout: Duration::from_millis(args.default_poll_timeout_ms),
            overflow: args.overflow,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Identity to join with. Prompted for on stdin when omitted.
    #[arg(long)]
    pub id: Option<String>,

    /// Address of the hub to connect to.
    #[arg(long, default_value = "127.0.0.1:1234")]
    pub server: SocketAddr,

    /// How long each long-poll may wait on the hub.
    #[arg(long, default_value_t = 25_000)]
    pub poll_timeout_ms: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_defaults_build_the_default_config() {
        let cli = Cli::try_parse_from(["long-poll-hub", "serve"]).expect("parse");
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(HubConfig::from(args.hub), HubConfig::default());
    }

    #[test]
    fn overflow_policy_is_selectable() {
        let cli = Cli::try_parse_from([
            "long-poll-hub",
            "serve",
            "--listen",
            "127.0.0.1:0",
            "--overflow",
            "drop-oldest",
        ])
        .expect("parse");
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(args.hub.overflow, OverflowPolicy::DropOldest);
    }
}
