//! Server configuration (command line with environment fallbacks).

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "marketwire-server", about = "Real-time messaging and notification router")]
pub struct ServerConfig {
    /// HTTP/WebSocket listen address.
    #[arg(long, env = "MARKETWIRE_LISTEN", default_value = "127.0.0.1:8080")]
    pub listen_addr: String,

    /// SQLite database path. In-memory when absent.
    #[arg(long, env = "MARKETWIRE_DB")]
    pub db_path: Option<String>,

    /// Secret for verifying bearer tokens. A random one is generated when absent.
    #[arg(long, env = "MARKETWIRE_TOKEN_SECRET", hide_env_values = true)]
    pub token_secret: Option<String>,

    /// Seconds a new connection may stay unauthenticated.
    #[arg(long, default_value_t = 10)]
    pub auth_timeout_secs: u64,

    /// Seconds between WebSocket pings.
    #[arg(long, default_value_t = 30)]
    pub ping_interval_secs: u64,

    /// Maximum message length in characters.
    #[arg(long, default_value_t = 4000)]
    pub max_message_len: usize,

    /// Outbound frames buffered per connection before it is dropped as a slow consumer.
    /// At least 2, so a resume can always fit one message and its `resumed` marker.
    #[arg(long, default_value_t = 256, value_parser = parse_outbound_queue)]
    pub outbound_queue: usize,

    /// Origins allowed by CORS (repeatable or comma separated).
    #[arg(long = "cors-origin", env = "MARKETWIRE_CORS_ORIGINS", value_delimiter = ',')]
    pub cors_origins: Vec<String>,
}

fn parse_outbound_queue(value: &str) -> Result<usize, String> {
    let n: usize = value.parse().map_err(|e| format!("{e}"))?;
    if n < 2 {
        return Err(format!("outbound queue must hold at least 2 frames, got {n}"));
    }
    Ok(n)
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            db_path: None,
            token_secret: None,
            auth_timeout_secs: 10,
            ping_interval_secs: 30,
            max_message_len: 4000,
            outbound_queue: 256,
            cors_origins: Vec::new(),
        }
    }
}
