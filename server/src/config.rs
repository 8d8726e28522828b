//! Process configuration.
//!
//! The binary takes no positional arguments; every knob is an environment
//! variable with a flag alias and a default, so `GC_PORT=27020 ./server`
//! and `./server --port 27020` behave identically.

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[clap(author, version, about = "Game coordinator server")]
pub struct Args {
    /// IP address both coordinator endpoints bind to
    #[clap(long, env = "GC_BIND_IP", default_value = "0.0.0.0")]
    pub bind_ip: String,

    /// Port shared by the client datagram endpoint and the game-server
    /// TCP endpoint
    #[clap(long, env = "GC_PORT", default_value = "27016")]
    pub port: u16,

    /// MySQL connection string; when unset the coordinator runs on the
    /// in-memory repository
    #[clap(long, env = "GC_DATABASE_URL")]
    pub database_url: Option<String>,

    /// Webhook URL for moderation notifications; unset disables the fan-out
    #[clap(long, env = "GC_WEBHOOK_URL")]
    pub webhook_url: Option<String>,

    /// Role id to mention in moderation notifications
    #[clap(long, env = "GC_MODERATOR_ROLE_ID")]
    pub moderator_role_id: Option<String>,
}

impl Args {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_ip, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_environment() {
        let args = Args::parse_from(["server"]);
        assert_eq!(args.bind_ip, "0.0.0.0");
        assert_eq!(args.port, 27016);
        assert!(args.database_url.is_none());
        assert!(args.webhook_url.is_none());
        assert_eq!(args.bind_addr(), "0.0.0.0:27016");
    }

    #[test]
    fn flags_override_defaults() {
        let args = Args::parse_from(["server", "--bind-ip", "127.0.0.1", "--port", "27020"]);
        assert_eq!(args.bind_addr(), "127.0.0.1:27020");
    }
}
