//! Clap argument types.

use clap::Parser;
use std::path::PathBuf;

/// HTTP gateway for the Zeo++ porous-materials analysis tool.
#[derive(Parser, Debug)]
#[command(
    name = "zeo-gateway",
    version = zeo_gateway::constants::VERSION,
    about = "Rate-limited, cached HTTP gateway for Zeo++ analyses"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(clap::Subcommand, Debug)]
pub enum Command {
    /// Run the HTTP server.
    Serve(ServeArgs),

    /// Load and validate the configuration, then resolve the tool executable.
    Check(CheckArgs),

    /// Print version information.
    Version,
}

/// Arguments for the `serve` subcommand.
#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Path to a TOML config file (default: config/config.toml if present).
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Address to bind, overriding config and environment.
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind, overriding config and environment.
    #[arg(long, short)]
    pub port: Option<u16>,
}

/// Arguments for the `check` subcommand.
#[derive(Parser, Debug)]
pub struct CheckArgs {
    /// Path to a TOML config file (default: config/config.toml if present).
    #[arg(long, short)]
    pub config: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_serve_with_overrides() {
        let cli = Cli::parse_from([
            "zeo-gateway",
            "serve",
            "--config",
            "conf.toml",
            "--host",
            "127.0.0.1",
            "-p",
            "9000",
        ]);
        match cli.command {
            Command::Serve(args) => {
                assert_eq!(args.config, Some(PathBuf::from("conf.toml")));
                assert_eq!(args.host.as_deref(), Some("127.0.0.1"));
                assert_eq!(args.port, Some(9000));
            }
            other => panic!("expected serve, got {other:?}"),
        }
    }

    #[test]
    fn parse_check_and_version() {
        let cli = Cli::parse_from(["zeo-gateway", "check"]);
        assert!(matches!(cli.command, Command::Check(CheckArgs { config: None })));

        let cli = Cli::parse_from(["zeo-gateway", "version"]);
        assert!(matches!(cli.command, Command::Version));
    }

    #[test]
    fn rejects_bad_port() {
        assert!(Cli::try_parse_from(["zeo-gateway", "serve", "--port", "http"]).is_err());
    }
}
