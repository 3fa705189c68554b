use std::time::Duration;

/// Telnet port of the BrightScript debug console.
pub const DEBUG_CONSOLE_PORT: u16 = 8085;

#[derive(Debug, Clone)]
pub struct DebugConfig {
    /// Device address, host or host:port. Port defaults to `debug_port`.
    pub host: String,
    /// Console port used when `host` carries none.
    pub debug_port: u16,
    /// Deadline for a single command's reply.
    pub command_timeout: Duration,
    /// Deadline for the TCP connect itself.
    pub connect_timeout: Duration,
    /// Suppress the synthetic stop the adapter injects at the app's
    /// entry point from surfacing as a breakpoint hit.
    pub suppress_hidden_stops: bool,
    /// Keep the staging directory around after the session ends.
    pub retain_staging_dir: bool,
    /// Consult on-disk source maps during line translation.
    pub enable_source_maps: bool,
    /// Fold rendezvous log pairs into histogram events.
    pub rendezvous_tracking: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            host: "192.168.1.100".to_string(),
            debug_port: DEBUG_CONSOLE_PORT,
            command_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            suppress_hidden_stops: true,
            retain_staging_dir: false,
            enable_source_maps: false,
            rendezvous_tracking: true,
        }
    }
}

impl DebugConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Self::default()
        }
    }

    pub fn from_env() -> Self {
        let defaults = Self::default();

        let host = std::env::var("ROKU_HOST").unwrap_or(defaults.host);

        let debug_port = std::env::var("ROKU_DEBUG_PORT")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(defaults.debug_port);

        let command_timeout = std::env::var("ROKU_COMMAND_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.command_timeout);

        let retain_staging_dir = std::env::var("ROKU_RETAIN_STAGING")
            .ok()
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(defaults.retain_staging_dir);

        Self {
            host,
            debug_port,
            command_timeout,
            retain_staging_dir,
            ..defaults
        }
    }

    /// Address to dial, appending the console port when the host does
    /// not already carry one.
    pub fn console_addr(&self) -> String {
        if self.host.contains(':') {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.debug_port)
        }
    }
}
