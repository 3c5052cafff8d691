//! Command line arguments. Flags override the config file, which
//! overrides the built-in defaults.

use std::path::PathBuf;

use anyhow::Context;
use argh::FromArgs;
use common::config::NodeConfig;

/// Run the satchel node.
#[derive(Clone, Debug, PartialEq, FromArgs)]
pub struct Args {
    /// path to a JSON config file
    #[argh(option)]
    pub config: Option<PathBuf>,

    /// TCP listen port for the p2p transport
    #[argh(option)]
    pub port: Option<u16>,

    /// loopback port for the HTTP control plane
    #[argh(option)]
    pub http_port: Option<u16>,

    /// directory holding keys and the channel store
    #[argh(option)]
    pub data_dir: Option<PathBuf>,

    /// multiaddr of the circuit relay to keep a reservation with
    #[argh(option)]
    pub relay: Option<String>,

    /// bootstrap peer multiaddr; may be given multiple times
    #[argh(option)]
    pub bootstrap: Vec<String>,

    /// enable local-network peer discovery
    #[argh(switch)]
    pub mdns: bool,
}

impl Args {
    /// Resolve the final [`NodeConfig`]: defaults, then the config file,
    /// then flag overrides.
    pub fn load_config(&self) -> anyhow::Result<NodeConfig> {
        // A .env file may set e.g. RUST_LOG; absence is fine.
        let _ = dotenvy::dotenv();

        let mut config = match &self.config {
            Some(path) => {
                let contents = std::fs::read_to_string(path).with_context(
                    || format!("Failed to read config {}", path.display()),
                )?;
                serde_json::from_str(&contents).with_context(|| {
                    format!("Failed to parse config {}", path.display())
                })?
            }
            None => NodeConfig::default(),
        };

        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(http_port) = self.http_port {
            config.http_port = http_port;
        }
        if let Some(data_dir) = &self.data_dir {
            config.data_dir = data_dir.clone();
        }
        if let Some(relay) = &self.relay {
            config.relay_addr = Some(relay.clone());
        }
        if !self.bootstrap.is_empty() {
            config.bootstrap_peers = self.bootstrap.clone();
        }
        if self.mdns {
            config.enable_mdns = true;
        }

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn base_args() -> Args {
        Args {
            config: None,
            port: None,
            http_port: None,
            data_dir: None,
            relay: None,
            bootstrap: Vec::new(),
            mdns: false,
        }
    }

    #[test]
    fn defaults_resolve() {
        let config = base_args().load_config().unwrap();
        assert_eq!(config, NodeConfig::default());
    }

    #[test]
    fn flags_override_defaults() {
        let args = Args {
            port: Some(4321),
            relay: Some("/ip4/1.2.3.4/tcp/4001/p2p/x".to_owned()),
            mdns: true,
            ..base_args()
        };
        let config = args.load_config().unwrap();
        assert_eq!(config.port, 4321);
        assert!(config.enable_mdns);
        assert!(config.relay_addr.is_some());
    }

    #[test]
    fn config_file_is_parsed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{ "port": 1234, "auto_accept_channels": "all" }"#,
        )
        .unwrap();

        let config = Args {
            config: Some(path),
            ..base_args()
        }
        .load_config()
        .unwrap();
        assert_eq!(config.port, 1234);
        assert!(config.auto_accept_channels.accepts(u64::MAX));
    }

    #[test]
    fn malformed_config_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = Args {
            config: Some(path),
            ..base_args()
        }
        .load_config();
        assert!(err.is_err());
    }
}
