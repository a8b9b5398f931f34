use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    /// Backend addresses (host:port) connections are routed to
    #[serde(default)]
    pub backends: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
}

fn default_listen_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    6000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            listen_port: default_listen_port(),
        }
    }
}

// ============================================================================
// Per-connection proxy behaviour
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Version string announced in the greeting
    #[serde(default = "default_server_version")]
    pub server_version: String,
    /// Timeout for opening a backend connection (milliseconds)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Timeout for connecting and re-authenticating during a redirect (milliseconds)
    #[serde(default = "default_redirect_timeout_ms")]
    pub redirect_timeout_ms: u64,
    /// Fixed token for re-authentication; derived per session when unset
    #[serde(default)]
    pub session_token: Option<String>,
}

fn default_server_version() -> String {
    "8.0.36-ferry".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    3000
}

fn default_redirect_timeout_ms() -> u64 {
    5000
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            server_version: default_server_version(),
            connect_timeout_ms: default_connect_timeout_ms(),
            redirect_timeout_ms: default_redirect_timeout_ms(),
            session_token: None,
        }
    }
}

impl Config {
    /// Listener address (host:port)
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.listen_addr, self.server.listen_port)
    }
}
