//! Configuration & identity (component I, SPEC_FULL.md §4.I).
//!
//! A typed `clap` CLI surface, overridable by environment variables, with
//! an optional TOML file layered underneath as defaults — the same
//! file-then-env-then-CLI precedence the teacher's own `config.rs`
//! implements, trimmed to the knobs this endpoint actually needs.

use std::path::Path;

use clap::Parser;
use serde::{Deserialize, Serialize};

/// openDAQ streaming protocol endpoint: binary signal transport over
/// WebSocket or raw TCP, with a JSON-RPC subscribe/unsubscribe channel and
/// mDNS discovery.
#[derive(Parser, Debug, Clone)]
#[command(version, about)]
pub struct Config {
    /// Maximum number of signals the registry can hold.
    #[arg(long, env = "STREAMING_MAX_SIGNALS", default_value_t = 12)]
    pub max_signals: usize,

    /// Maximum number of signal tables the registry can hold.
    #[arg(long, env = "STREAMING_MAX_TABLES", default_value_t = 4)]
    pub max_tables: usize,

    /// Maximum signal name length; longer names are rejected at
    /// registration (advisory cap, not a fixed-size buffer in this build).
    #[arg(long, env = "STREAMING_SIGNAL_NAME_LENGTH", default_value_t = 32)]
    pub signal_name_length: usize,

    /// Advisory capacity hint for the outgoing MessagePack buffer.
    #[arg(long, env = "MSGPACK_BUF_SIZE", default_value_t = 256)]
    pub msgpack_buf_size: usize,

    /// Advisory capacity hint for the JSON-RPC request body reader.
    #[arg(long, env = "JSONRPC_BUF_SIZE", default_value_t = 256)]
    pub jsonrpc_buf_size: usize,

    /// Whether the `init` meta advertises the JSON-RPC control channel.
    #[arg(long, env = "STREAMING_INCLUDE_CONFIG_CHANNEL", default_value_t = true)]
    pub include_config_channel: bool,

    /// URI the WebSocket upgrade hook listens on.
    #[arg(long, env = "STREAMING_WEBSOCKET_URI", default_value = "/stream")]
    pub websocket_uri: String,

    /// Use WebSocket framing; when false, falls back to the raw-TCP
    /// transport alternative (a build-time toggle in the original, a
    /// runtime flag here).
    #[arg(long, env = "STREAMING_USE_WEBSOCKET", default_value_t = true)]
    pub use_websocket: bool,

    /// TCP port for the raw-TCP transport alternative.
    #[arg(long, env = "STREAMING_TCP_PORT", default_value_t = 7412)]
    pub tcp_port: u16,

    /// JSON-RPC control channel HTTP path.
    #[arg(long, env = "JSONRPC_PATH", default_value = "/streaming_jsonrpc")]
    pub jsonrpc_path: String,

    /// JSON-RPC HTTP method, as advertised in the `init` meta.
    #[arg(long, env = "JSONRPC_METHOD", default_value = "POST")]
    pub jsonrpc_http_method: String,

    /// JSON-RPC HTTP version, as advertised in the `init` meta.
    #[arg(long, env = "JSONRPC_HTTPVERSION", default_value = "1.1")]
    pub jsonrpc_http_version: String,

    /// Port the HTTP server (WS upgrade + JSON-RPC) binds to.
    #[arg(long, env = "STREAMING_LISTEN_PORT", default_value_t = 80)]
    pub listen_port: u16,

    /// Device name, used as the mDNS instance name and in TXT records.
    #[arg(long, env = "DEVICE_NAME", default_value = "testdevice")]
    pub device_name: String,

    /// Device model name, advertised in the mDNS TXT record.
    #[arg(long, env = "MODEL_NAME", default_value = "openDAQdevice")]
    pub model_name: String,

    /// Device serial number, advertised in the mDNS TXT record.
    #[arg(long, env = "SERIAL_NUMBER", default_value = "12345")]
    pub serial_number: String,

    /// Device IP address advertised in the mDNS A record (auto-detected if
    /// omitted).
    #[arg(long, env = "DEVICE_IP")]
    pub device_ip: Option<String>,

    /// Disabled-disconnect-detection poll interval; kept for documentation
    /// parity with §4.D, unused by this build's EOF-driven teardown.
    #[arg(long, env = "STREAMING_DISCONNECT_POLL_INTERVAL_MS", default_value_t = 10)]
    pub disconnect_poll_interval_ms: u64,

    /// Whether to advertise the endpoint over mDNS at startup.
    #[arg(long, env = "STREAMING_ENABLE_MDNS", default_value_t = true)]
    pub enable_mdns: bool,

    /// Whether to run the demo sample producer (linear ramp on every
    /// registered demo signal). Disable to run the registry with only
    /// externally-driven signals.
    #[arg(long, env = "STREAMING_DEMO_PRODUCER", default_value_t = true)]
    pub demo_producer: bool,

    /// Demo producer tick interval in milliseconds.
    #[arg(long, env = "STREAMING_DEMO_INTERVAL_MS", default_value_t = 200)]
    pub demo_interval_ms: u64,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "STREAMING_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Output logs as JSON.
    #[arg(long, env = "STREAMING_LOG_JSON", default_value_t = false)]
    pub log_json: bool,
}

impl Config {
    /// Reject a nonsensical capacity configuration before startup. Per-name
    /// length enforcement (`SIGNAL_NAME_LENGTH`) is a registry-level
    /// invariant applied by `SignalRegistry::add_signal`/`add_table`, not
    /// here.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_signals == 0 {
            anyhow::bail!("max_signals must be at least 1");
        }
        if self.max_tables == 0 {
            anyhow::bail!("max_tables must be at least 1");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// TOML config file support
// ---------------------------------------------------------------------------

/// Serializable config for TOML file persistence. All fields are optional —
/// only populated values are written, and loading only injects the values
/// present, so CLI/env always take precedence over the file.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_signals: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tables: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal_name_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msgpack_buf_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jsonrpc_buf_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub include_config_channel: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub websocket_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_websocket: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jsonrpc_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jsonrpc_http_method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jsonrpc_http_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listen_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disconnect_poll_interval_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_mdns: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub demo_producer: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub demo_interval_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_json: Option<bool>,
}

impl ConfigFile {
    /// Load from a TOML file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Save to a TOML file.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Inject values as environment variables so clap picks them up. Only
    /// sets variables that are **not** already present, preserving the
    /// precedence CLI > env > config file.
    pub fn inject_env(&self) {
        macro_rules! set {
            ($env:expr, $val:expr) => {
                if let Some(ref v) = $val {
                    if std::env::var($env).is_err() {
                        std::env::set_var($env, v.to_string());
                    }
                }
            };
        }
        set!("STREAMING_MAX_SIGNALS", self.max_signals);
        set!("STREAMING_MAX_TABLES", self.max_tables);
        set!("STREAMING_SIGNAL_NAME_LENGTH", self.signal_name_length);
        set!("MSGPACK_BUF_SIZE", self.msgpack_buf_size);
        set!("JSONRPC_BUF_SIZE", self.jsonrpc_buf_size);
        set!(
            "STREAMING_INCLUDE_CONFIG_CHANNEL",
            self.include_config_channel
        );
        set!("STREAMING_WEBSOCKET_URI", self.websocket_uri);
        set!("STREAMING_USE_WEBSOCKET", self.use_websocket);
        set!("STREAMING_TCP_PORT", self.tcp_port);
        set!("JSONRPC_PATH", self.jsonrpc_path);
        set!("JSONRPC_METHOD", self.jsonrpc_http_method);
        set!("JSONRPC_HTTPVERSION", self.jsonrpc_http_version);
        set!("STREAMING_LISTEN_PORT", self.listen_port);
        set!("DEVICE_NAME", self.device_name);
        set!("MODEL_NAME", self.model_name);
        set!("SERIAL_NUMBER", self.serial_number);
        set!("DEVICE_IP", self.device_ip);
        set!(
            "STREAMING_DISCONNECT_POLL_INTERVAL_MS",
            self.disconnect_poll_interval_ms
        );
        set!("STREAMING_ENABLE_MDNS", self.enable_mdns);
        set!("STREAMING_DEMO_PRODUCER", self.demo_producer);
        set!("STREAMING_DEMO_INTERVAL_MS", self.demo_interval_ms);
        set!("STREAMING_LOG_LEVEL", self.log_level);
        set!("STREAMING_LOG_JSON", self.log_json);
    }
}
