//! Parley CLI
//!
//! Offline tooling around the client core: inspecting wire payloads,
//! provisioning local keys and managing configuration.

use std::io::Read;
use std::path::PathBuf;

use anyhow::{Context, Result};
use base64::Engine;
use clap::{Parser, Subcommand};
use parley::config::{default_config_path, Config};
use parley::signal::LocalIdentity;
use parley::store::{FileStore, SignalStore};
use protocol::{BinaryNode, NodeCodec};

/// Parley - multi-device end-to-end encrypted messaging client.
#[derive(Parser, Debug)]
#[command(name = "parley")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Decode a frame payload (flags byte followed by a node)
    Decode {
        /// Payload text; read from stdin when omitted
        input: Option<String>,

        /// Input is base64 instead of hex
        #[arg(long)]
        base64: bool,

        /// Print the node as JSON
        #[arg(long)]
        json: bool,
    },

    /// Encode a JSON node into a frame payload, printed as hex
    Encode {
        /// JSON file holding the node
        file: PathBuf,

        /// Compress the payload whenever that makes it smaller
        #[arg(long)]
        compress: bool,
    },

    /// Manage the local identity and prekeys
    #[command(subcommand)]
    Keys(KeysCommands),

    /// Manage configuration
    #[command(subcommand)]
    Config(ConfigCommands),
}

/// Subcommands for key management.
#[derive(Subcommand, Debug, Clone)]
pub enum KeysCommands {
    /// Generate a local identity and one-time prekeys
    Init {
        /// Number of one-time prekeys to generate
        #[arg(long, default_value = "100")]
        one_time: u32,

        /// Device id of this client
        #[arg(long, default_value = "0")]
        device: u16,

        /// Replace an existing identity
        #[arg(long)]
        force: bool,
    },

    /// Print the local public prekey bundle as JSON
    Bundle,
}

/// Subcommands for configuration management.
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,

    /// Write the default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Check the configuration for errors
    Validate,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let mut config = Config::load(&config_path)?;
    config.apply_env_overrides();

    // Initialize tracing
    let mut logging = config.logging.clone();
    if cli.verbose {
        logging.level = "debug".to_string();
    }
    let _guard = parley::logging::init(&logging)?;
    tracing::debug!("Using config file: {:?}", config_path);

    match cli.command {
        Commands::Decode {
            input,
            base64,
            json,
        } => {
            config.validate()?;
            let text = match input {
                Some(text) => text,
                None => {
                    let mut text = String::new();
                    std::io::stdin()
                        .read_to_string(&mut text)
                        .context("Failed to read stdin")?;
                    text
                }
            };
            let payload = parse_payload(text.trim(), base64)?;
            let node = config
                .codec
                .node_codec()
                .decode_payload(&payload)
                .context("Failed to decode payload")?;
            if json {
                println!("{}", serde_json::to_string_pretty(&node)?);
            } else {
                println!("{}", node);
            }
        }
        Commands::Encode { file, compress } => {
            config.validate()?;
            let contents = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read node file: {}", file.display()))?;
            let node: BinaryNode =
                serde_json::from_str(&contents).context("Failed to parse node JSON")?;
            let codec = if compress {
                NodeCodec::new().with_compression_threshold(0)
            } else {
                config.codec.node_codec()
            };
            let payload = codec.encode_payload(&node)?;
            println!("{}", hex::encode(payload));
        }
        Commands::Keys(cmd) => {
            config.validate()?;
            let store = FileStore::open(&config.session.store_path).with_context(|| {
                format!(
                    "Failed to open session store: {}",
                    config.session.store_path.display()
                )
            })?;

            match cmd {
                KeysCommands::Init {
                    one_time,
                    device,
                    force,
                } => {
                    if store.local_identity()?.is_some() && !force {
                        anyhow::bail!(
                            "An identity already exists in {}; use --force to replace it",
                            config.session.store_path.display()
                        );
                    }
                    let local = LocalIdentity::provision(
                        &store,
                        LocalIdentity::random_registration_id(),
                        device,
                        one_time,
                    )?;
                    println!("Registration id: {}", local.registration_id);
                    println!("Fingerprint:     {}", local.identity.public().fingerprint());
                    println!("One-time keys:   {}", store.one_time_prekey_count()?);
                }
                KeysCommands::Bundle => {
                    let Some(local) = store.local_identity()? else {
                        anyhow::bail!("No identity found; run `parley keys init` first");
                    };
                    let one_time = store.first_one_time_prekey()?;
                    let bundle = local.bundle(one_time.as_ref());
                    println!("{}", serde_json::to_string_pretty(&bundle)?);
                }
            }
        }
        Commands::Config(cmd) => match cmd {
            ConfigCommands::Show => {
                print!("{}", config.to_toml()?);
            }
            ConfigCommands::Init { force } => {
                if config_path.exists() && !force {
                    anyhow::bail!(
                        "Config file already exists at {}; use --force to overwrite",
                        config_path.display()
                    );
                }
                Config::default().save(&config_path)?;
                println!("Wrote default configuration to {}", config_path.display());
            }
            ConfigCommands::Validate => {
                config.validate()?;
                println!("Configuration is valid");
            }
        },
    }

    Ok(())
}

/// Parses hex or base64 payload text.
fn parse_payload(text: &str, base64: bool) -> Result<Vec<u8>> {
    if base64 {
        base64::engine::general_purpose::STANDARD
            .decode(text)
            .context("Invalid base64 input")
    } else {
        let compact: String = text.split_whitespace().collect();
        hex::decode(compact).context("Invalid hex input")
    }
}
