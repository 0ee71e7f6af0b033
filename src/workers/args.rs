//! Command-line argument parsing and configuration.
//!
//! Supports:
//! - CLI arguments via clap (with `PORT` / `ALLOWED_ORIGINS` from the environment)
//! - TOML configuration file (`roomdrop.toml` or `--config`)
//! - Merging CLI with file config (CLI takes precedence)

use std::fs;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;

use crate::core::config::{DEFAULT_CONFIG_FILE, DEFAULT_RELAY_PORT, DEFAULT_RELAY_URL, DEFAULT_STUN_SERVER};
use crate::core::relay::RoomId;
use crate::core::transfer::frame::ChunkFraming;

/// Roomdrop - browser-compatible peer-to-peer file drop over a room relay.
#[derive(Parser, Clone, Debug)]
#[command(author, version, about)]
#[command(propagate_version = true)]
pub struct Args {
    /// Verbosity level (-v, -vv, -vvv).
    #[clap(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// TOML config file. Defaults to ./roomdrop.toml when present.
    #[clap(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Command {
    /// Run the signaling relay.
    Relay {
        /// TCP port to listen on.
        #[clap(short, long, env = "PORT")]
        port: Option<u16>,

        /// Comma-separated origins allowed to connect. Empty allows any.
        #[clap(long, env = "ALLOWED_ORIGINS", value_delimiter = ',')]
        allowed_origins: Vec<String>,

        /// Address to bind on.
        #[clap(long)]
        bind: Option<IpAddr>,
    },

    /// Offer a file to the room.
    Send {
        file: PathBuf,

        #[clap(long)]
        room: RoomId,

        /// Relay WebSocket URL.
        #[clap(long)]
        relay: Option<String>,

        /// Send untagged chunks, as browsers do.
        #[clap(long)]
        raw_chunks: bool,
    },

    /// Wait in the room for a file.
    Receive {
        #[clap(long)]
        room: RoomId,

        /// Relay WebSocket URL.
        #[clap(long)]
        relay: Option<String>,

        /// Directory received files are written to.
        #[clap(short, long)]
        out: Option<PathBuf>,

        /// Keep receiving after the first file.
        #[clap(long)]
        stay_open: bool,
    },
}

// ── File config ──────────────────────────────────────────────────────────────

#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct FileConfig {
    pub verbose: Option<u8>,
    pub relay: RelayFileConfig,
    pub client: ClientFileConfig,
}

#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct RelayFileConfig {
    pub port: Option<u16>,
    pub bind: Option<IpAddr>,
    pub allowed_origins: Vec<String>,
}

#[derive(Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct ClientFileConfig {
    pub relay_url: Option<String>,
    pub stun_servers: Vec<String>,
    pub out_dir: Option<PathBuf>,
    pub raw_chunks: Option<bool>,
    pub stay_open: Option<bool>,
}

// ── Resolved settings ────────────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq)]
pub struct Settings {
    pub verbose: u8,
    pub mode: Mode,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Mode {
    Relay(RelaySettings),
    Send(SendSettings),
    Receive(ReceiveSettings),
}

#[derive(Clone, Debug, PartialEq)]
pub struct RelaySettings {
    pub addr: SocketAddr,
    pub allowed_origins: Vec<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct SendSettings {
    pub file: PathBuf,
    pub room: RoomId,
    pub relay_url: String,
    pub stun_servers: Vec<String>,
    pub framing: ChunkFraming,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ReceiveSettings {
    pub room: RoomId,
    pub relay_url: String,
    pub stun_servers: Vec<String>,
    pub out_dir: PathBuf,
    pub stay_open: bool,
}

impl Args {
    /// Load settings from CLI + TOML file (if it exists).
    /// CLI values override those from the file.
    pub fn load() -> Result<Settings> {
        let cli = Args::parse();
        let file = match &cli.config {
            Some(path) => Self::from_file(path)?,
            None => {
                let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    Self::from_file(&default_path)?
                } else {
                    FileConfig::default()
                }
            }
        };
        Ok(cli.resolve(file))
    }

    fn from_file(path: &Path) -> Result<FileConfig> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Invalid config {}", path.display()))
    }

    /// Merge file config underneath CLI args (CLI takes precedence).
    pub fn resolve(self, file: FileConfig) -> Settings {
        let verbose = if self.verbose > 0 {
            self.verbose
        } else {
            file.verbose.unwrap_or(0)
        };

        let stun_servers = if file.client.stun_servers.is_empty() {
            vec![DEFAULT_STUN_SERVER.to_string()]
        } else {
            file.client.stun_servers.clone()
        };
        let relay_url = |cli: Option<String>| {
            cli.or_else(|| file.client.relay_url.clone())
                .unwrap_or_else(|| DEFAULT_RELAY_URL.to_string())
        };

        let mode = match self.command {
            Command::Relay {
                port,
                allowed_origins,
                bind,
            } => {
                let port = port.or(file.relay.port).unwrap_or(DEFAULT_RELAY_PORT);
                let ip = bind
                    .or(file.relay.bind)
                    .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
                let allowed_origins = if allowed_origins.is_empty() {
                    file.relay.allowed_origins.clone()
                } else {
                    allowed_origins
                };
                Mode::Relay(RelaySettings {
                    addr: SocketAddr::new(ip, port),
                    allowed_origins,
                })
            }
            Command::Send {
                file: path,
                room,
                relay,
                raw_chunks,
            } => {
                let raw = raw_chunks || file.client.raw_chunks.unwrap_or(false);
                Mode::Send(SendSettings {
                    file: path,
                    room,
                    relay_url: relay_url(relay),
                    stun_servers,
                    framing: if raw {
                        ChunkFraming::Raw
                    } else {
                        ChunkFraming::Tagged
                    },
                })
            }
            Command::Receive {
                room,
                relay,
                out,
                stay_open,
            } => Mode::Receive(ReceiveSettings {
                room,
                relay_url: relay_url(relay),
                stun_servers,
                out_dir: out
                    .or_else(|| file.client.out_dir.clone())
                    .unwrap_or_else(|| PathBuf::from(".")),
                stay_open: stay_open || file.client.stay_open.unwrap_or(false),
            }),
        };

        Settings { verbose, mode }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> Args {
        Args::try_parse_from(argv).unwrap()
    }

    fn file(toml_text: &str) -> FileConfig {
        toml::from_str(toml_text).unwrap()
    }

    #[test]
    fn send_defaults_to_tagged_chunks() {
        let settings = parse(&["roomdrop", "send", "a.txt", "--room", "42"]).resolve(FileConfig::default());
        let Mode::Send(send) = settings.mode else {
            panic!("expected send mode");
        };
        assert_eq!(send.room.as_str(), "42");
        assert_eq!(send.framing, ChunkFraming::Tagged);
        assert_eq!(send.relay_url, DEFAULT_RELAY_URL);
        assert_eq!(send.stun_servers, vec![DEFAULT_STUN_SERVER.to_string()]);
    }

    #[test]
    fn raw_chunks_flag_switches_framing() {
        let settings =
            parse(&["roomdrop", "send", "a.txt", "--room", "42", "--raw-chunks"]).resolve(FileConfig::default());
        let Mode::Send(send) = settings.mode else {
            panic!("expected send mode");
        };
        assert_eq!(send.framing, ChunkFraming::Raw);
    }

    #[test]
    fn blank_room_is_rejected() {
        assert!(Args::try_parse_from(["roomdrop", "receive", "--room", "  "]).is_err());
    }

    #[test]
    fn cli_wins_over_file() {
        let config = file(
            r#"
            verbose = 2

            [client]
            relay_url = "ws://relay.example:3000/"
            out_dir = "/tmp/from-file"
            stay_open = true
            "#,
        );
        let settings = parse(&[
            "roomdrop",
            "-v",
            "receive",
            "--room",
            "7",
            "--relay",
            "ws://cli.example/",
        ])
        .resolve(config);

        assert_eq!(settings.verbose, 1);
        let Mode::Receive(receive) = settings.mode else {
            panic!("expected receive mode");
        };
        assert_eq!(receive.relay_url, "ws://cli.example/");
        assert_eq!(receive.out_dir, PathBuf::from("/tmp/from-file"));
        assert!(receive.stay_open);
    }

    #[test]
    fn relay_settings_fall_back_to_file_then_defaults() {
        let config = file(
            r#"
            [relay]
            allowed_origins = ["https://drop.example"]
            "#,
        );
        let settings = parse(&["roomdrop", "relay", "--port", "4000"]).resolve(config);
        let Mode::Relay(relay) = settings.mode else {
            panic!("expected relay mode");
        };
        assert_eq!(relay.addr, "0.0.0.0:4000".parse().unwrap());
        assert_eq!(relay.allowed_origins, vec!["https://drop.example".to_string()]);

        let settings = parse(&["roomdrop", "relay", "--allowed-origins", "https://a,https://b"])
            .resolve(FileConfig::default());
        let Mode::Relay(relay) = settings.mode else {
            panic!("expected relay mode");
        };
        assert_eq!(relay.allowed_origins.len(), 2);
    }

    #[test]
    fn missing_config_file_is_an_error() {
        assert!(Args::from_file(Path::new("/definitely/not/here.toml")).is_err());
    }
}
