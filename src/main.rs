use clap::Parser;
use hot_potato_lock::{
    log,
    message::PeerId,
    peer::{Peer, PeerConfig},
};
use rand::Rng;
use std::{error::Error, time::Duration};

/// One peer of a token-passing distributed lock.
#[derive(Debug, Parser)]
#[command(name = "hot-potato-lock", version, about)]
struct Cli {
    /// Identity of this peer; the lowest id of the group starts with the token.
    #[arg(long)]
    id: PeerId,

    /// Address to accept remote calls on.
    #[arg(long)]
    listen: String,

    /// Another member of the group, as ID=HOST:PORT. Repeat for each member.
    #[arg(long = "peer", value_parser = parse_member)]
    peers: Vec<(PeerId, String)>,

    /// Seconds to wait for the other members at startup.
    #[arg(long, default_value_t = 10)]
    rendezvous_secs: u64,

    /// Critical sections per second.
    #[arg(long, default_value_t = hot_potato_lock::RATE)]
    rate: f64,

    /// Milliseconds spent inside each critical section.
    #[arg(long, default_value_t = 200)]
    hold_ms: u64,

    /// Critical sections to run before leaving, 0 to run until Ctrl-C.
    #[arg(long, default_value_t = 0)]
    rounds: usize,

    /// Seed of the workload generator.
    #[arg(long)]
    seed: Option<u64>,

    #[arg(short, long)]
    verbose: bool,
}

fn parse_member(s: &str) -> Result<(PeerId, String), String> {
    let (id, address) = s
        .split_once('=')
        .ok_or_else(|| format!("expected ID=HOST:PORT, got '{s}'"))?;
    let id = id
        .trim()
        .parse::<PeerId>()
        .map_err(|e| format!("invalid peer id '{id}': {e}"))?;
    Ok((id, address.trim().to_string()))
}

impl Cli {
    fn into_config(self) -> PeerConfig {
        let mut config = PeerConfig::new(self.id, self.listen);
        config.members = self.peers.into_iter().collect();
        config.rendezvous_timeout = Duration::from_secs(self.rendezvous_secs);
        config.rate = self.rate;
        config.hold_time = Duration::from_millis(self.hold_ms);
        config.rounds = self.rounds;
        config.seed = self.seed.unwrap_or_else(|| rand::rng().random());
        config
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let cli = Cli::parse();
    log::set_verbose(cli.verbose);

    let peer = Peer::new(cli.into_config());
    peer.run(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error(&format!("{e}"));
        }
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn members_are_parsed() {
        assert_eq!(
            parse_member("3=127.0.0.1:7003").unwrap(),
            (3, "127.0.0.1:7003".to_string())
        );
        assert!(parse_member("127.0.0.1:7003").is_err());
        assert!(parse_member("three=127.0.0.1:7003").is_err());
    }

    #[test]
    fn command_line_builds_config() {
        let cli = Cli::parse_from([
            "hot-potato-lock",
            "--id",
            "2",
            "--listen",
            "127.0.0.1:7002",
            "--peer",
            "1=127.0.0.1:7001",
            "--peer",
            "3=127.0.0.1:7003",
            "--seed",
            "9",
        ]);
        let config = cli.into_config();

        assert_eq!(config.id, 2);
        assert_eq!(config.members.len(), 2);
        assert_eq!(config.members[&3], "127.0.0.1:7003");
        assert_eq!(config.seed, 9);
        assert_eq!(config.rounds, 0);
    }
}
