//! Server configuration.

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "hubline-server", about = "Real-time presence and group messaging hub")]
pub struct ServerConfig {
    /// Address for the HTTP/WebSocket listener.
    #[arg(long, env = "HUBLINE_LISTEN", default_value = "127.0.0.1:8080")]
    pub listen_addr: String,

    /// Path to the SQLite database. Groups and messages are kept in memory
    /// (and lost on exit) when unset.
    #[arg(long, env = "HUBLINE_DB")]
    pub db_path: Option<String>,

    /// Capacity of each connection's outbound push queue. Pushes to a full
    /// queue are dropped for that connection.
    #[arg(long, env = "HUBLINE_OUTBOUND_BUFFER", default_value_t = 256)]
    pub outbound_buffer: usize,

    /// Maximum group message length in characters.
    #[arg(long, env = "HUBLINE_MAX_MESSAGE_LEN", default_value_t = 4000)]
    pub max_message_len: usize,

    /// Default page size for the message history endpoint.
    #[arg(long, env = "HUBLINE_HISTORY_LIMIT", default_value_t = 50)]
    pub history_limit: usize,

    /// Origins allowed by CORS on the REST API. Repeatable. Any origin is
    /// allowed when none are given.
    #[arg(long = "cors-origin", env = "HUBLINE_CORS_ORIGINS", value_delimiter = ',')]
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            db_path: None,
            outbound_buffer: 256,
            max_message_len: 4000,
            history_limit: 50,
            cors_origins: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_cli_defaults() {
        let parsed = ServerConfig::parse_from(["hubline-server"]);
        let default = ServerConfig::default();
        assert_eq!(parsed.listen_addr, default.listen_addr);
        assert_eq!(parsed.outbound_buffer, default.outbound_buffer);
        assert_eq!(parsed.max_message_len, default.max_message_len);
        assert_eq!(parsed.history_limit, default.history_limit);
    }

    #[test]
    fn cors_origins_split_on_comma() {
        let parsed = ServerConfig::parse_from([
            "hubline-server",
            "--cors-origin",
            "http://localhost:5173,https://app.example.com",
        ]);
        assert_eq!(parsed.cors_origins.len(), 2);
    }
}
