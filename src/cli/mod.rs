//! CLI command definitions and argument parsing.
//!
//! Uses clap derive macros for ergonomic argument definitions.

pub mod args;

use zeo_gateway::config::Config;

use args::ServeArgs;

/// Apply `serve` flags on top of the loaded config. Flags win over both
/// the config file and the environment.
pub fn apply_serve_overrides(config: &mut Config, args: &ServeArgs) {
    if let Some(ref host) = args.host {
        config.server.host = host.clone();
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config() {
        let mut config = Config::default();
        let args = ServeArgs {
            config: None,
            host: Some("127.0.0.1".into()),
            port: Some(9999),
        };
        apply_serve_overrides(&mut config, &args);
        assert_eq!(config.server.bind_addr(), "127.0.0.1:9999");
    }

    #[test]
    fn absent_flags_keep_config() {
        let mut config = Config::default();
        let before = config.server.bind_addr();
        let args = ServeArgs {
            config: None,
            host: None,
            port: None,
        };
        apply_serve_overrides(&mut config, &args);
        assert_eq!(config.server.bind_addr(), before);
    }
}
