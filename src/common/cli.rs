//! CLI argument parsing for the orca-digitizers tools
//!
//! # Design Principles (KISS)
//! - Use clap's derive macro for declarative argument definition
//! - Common arguments shared via composition, not inheritance
//! - Command-line values override the configuration file

use clap::Parser;

use crate::data_source_emulator::{EmulatorConfig, Model};

/// Common arguments shared across tools
#[derive(Parser, Debug, Clone)]
pub struct CommonArgs {
    /// Path to configuration file
    #[arg(short = 'f', long = "config", default_value = "emulator.toml")]
    pub config_file: String,
}

/// Arguments for the emulator: generate packets, decode them, summarize
#[derive(Parser, Debug, Clone)]
#[command(name = "emulator", about = "Generate and decode synthetic ORCA digitizer packets")]
pub struct EmulatorArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// Hardware model to emulate
    #[arg(short, long, value_enum)]
    pub model: Option<Model>,

    /// Number of packets to generate
    #[arg(short = 'n', long, default_value_t = 1000)]
    pub events: usize,

    /// Number of enabled channels
    #[arg(long)]
    pub channels: Option<u32>,

    /// RNG seed
    #[arg(long, env = "ORCA_EMULATOR_SEED")]
    pub seed: Option<u64>,

    /// Gretina4M presummed sample count (0 = multisampling off)
    #[arg(long)]
    pub ft_len: Option<usize>,

    /// Object info file (JSON or TOML) replacing the emulator's own card description
    #[arg(long)]
    pub object_info: Option<String>,

    /// Write the decoded tables here (`.msgpack` for MessagePack, JSON otherwise)
    #[arg(short, long)]
    pub output: Option<String>,
}

impl EmulatorArgs {
    /// Apply command-line overrides on top of a loaded configuration
    pub fn apply(&self, mut config: EmulatorConfig) -> EmulatorConfig {
        if let Some(model) = self.model {
            config.model = model;
        }
        if let Some(channels) = self.channels {
            config.n_channels = channels;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if let Some(ft_len) = self.ft_len {
            config.ft_len = ft_len;
        }
        config
    }
}
