use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

pub mod config;
pub mod devices;
pub mod link_device;
pub mod refresh_keys;
pub mod version;

use config::{BridgeConfig, LoggingConfig};

#[derive(Parser)]
#[command(name = "bridgehead")]
#[command(author = "Bridgehead Project")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Operator CLI for the Bridgehead Signal bridge", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Link the bridge as a secondary device of a Signal account
    LinkDevice {
        /// Path to config file (default: adjacent to store at ~/.local/share/bridgehead/config.toml)
        #[arg(long)]
        config: Option<String>,

        /// Path to the device store (optional, uses default if not specified)
        #[arg(long)]
        store_path: Option<String>,

        /// Replace an already linked device
        #[arg(long)]
        force: bool,
    },

    /// Upload a fresh batch of pre-keys for the linked device
    RefreshKeys {
        #[arg(long)]
        config: Option<String>,

        #[arg(long)]
        store_path: Option<String>,
    },

    /// List linked devices (no secrets are printed)
    Devices {
        #[arg(long)]
        config: Option<String>,

        #[arg(long)]
        store_path: Option<String>,
    },

    /// Display version information
    Version,
}

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
pub fn init_logging(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    // A subscriber may already be installed (tests); keep it.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

pub async fn execute(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Commands::LinkDevice {
            config,
            store_path,
            force,
        } => {
            let config = BridgeConfig::resolve(config, store_path)?;
            init_logging(&config.logging);
            link_device::execute(&config, force).await
        }
        Commands::RefreshKeys { config, store_path } => {
            let config = BridgeConfig::resolve(config, store_path)?;
            init_logging(&config.logging);
            refresh_keys::execute(&config).await
        }
        Commands::Devices { config, store_path } => {
            let config = BridgeConfig::resolve(config, store_path)?;
            init_logging(&config.logging);
            devices::execute(&config).await
        }
        Commands::Version => {
            version::execute();
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_link_device() {
        let cli = Cli::parse_from([
            "bridgehead",
            "link-device",
            "--store-path",
            "/tmp/store",
            "--force",
        ]);

        match cli.command {
            Commands::LinkDevice {
                config,
                store_path,
                force,
            } => {
                assert_eq!(config, None);
                assert_eq!(store_path, Some("/tmp/store".to_string()));
                assert!(force);
            }
            _ => panic!("Expected LinkDevice command"),
        }
    }

    #[test]
    fn test_cli_parse_link_device_defaults() {
        let cli = Cli::parse_from(["bridgehead", "link-device"]);

        match cli.command {
            Commands::LinkDevice {
                config,
                store_path,
                force,
            } => {
                assert_eq!(config, None);
                assert_eq!(store_path, None);
                assert!(!force);
            }
            _ => panic!("Expected LinkDevice command"),
        }
    }

    #[test]
    fn test_cli_parse_refresh_keys() {
        let cli = Cli::parse_from([
            "bridgehead",
            "refresh-keys",
            "--config",
            "/etc/bridgehead/config.toml",
        ]);

        match cli.command {
            Commands::RefreshKeys { config, store_path } => {
                assert_eq!(config, Some("/etc/bridgehead/config.toml".to_string()));
                assert_eq!(store_path, None);
            }
            _ => panic!("Expected RefreshKeys command"),
        }
    }

    #[test]
    fn test_cli_parse_devices() {
        let cli = Cli::parse_from(["bridgehead", "devices", "--store-path", "/custom/store"]);

        match cli.command {
            Commands::Devices { config, store_path } => {
                assert_eq!(config, None);
                assert_eq!(store_path, Some("/custom/store".to_string()));
            }
            _ => panic!("Expected Devices command"),
        }
    }

    #[test]
    fn test_cli_parse_version() {
        let cli = Cli::parse_from(["bridgehead", "version"]);
        assert!(matches!(cli.command, Commands::Version));
    }

    #[test]
    fn test_cli_rejects_unknown_command() {
        assert!(Cli::try_parse_from(["bridgehead", "register"]).is_err());
    }

    #[test]
    fn test_init_logging_twice_is_harmless() {
        let logging = LoggingConfig {
            level: "not a level[".to_string(),
        };
        init_logging(&logging);
        init_logging(&LoggingConfig::default());
    }
}
