//! Command-line interface.

use std::path::PathBuf;

use clap::Parser;

/// Multi-tenant MCP client gateway for browser MCP clients.
#[derive(Debug, Parser)]
#[command(name = "hoot-gateway", version, about)]
pub struct Cli {
    /// Configuration file (YAML)
    #[arg(short, long, env = "HOOT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Bind host (overrides config)
    #[arg(long)]
    pub host: Option<String>,

    /// Bind port (overrides config)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "HOOT_LOG_LEVEL")]
    pub log_level: String,

    /// Log format (text or json)
    #[arg(long, env = "HOOT_LOG_FORMAT")]
    pub log_format: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse() {
        let cli = Cli::parse_from(["hoot-gateway"]);
        assert!(cli.config.is_none());
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn overrides_parse() {
        let cli = Cli::parse_from(["hoot-gateway", "--port", "8080", "--host", "0.0.0.0"]);
        assert_eq!(cli.port, Some(8080));
        assert_eq!(cli.host.as_deref(), Some("0.0.0.0"));
    }
}
