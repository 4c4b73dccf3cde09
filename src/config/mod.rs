//! Hardware configuration ("object info") for the decoders
//!
//! Supports loading the per-card descriptors from:
//! - JSON files (an ORCA header dump: a top-level array of card dictionaries)
//! - TOML files (`[[card]]` tables, handy for hand-written test setups)
//!
//! # Example
//! ```ignore
//! let info = ObjectInfo::load("gretina_cards.json")?;
//! decoder.set_object_info(&info)?;
//! ```

pub mod digitizer;

pub use digitizer::CardInfo;

use serde::Deserialize;
use std::path::Path;
use thiserror::Error;

use crate::decoder::ChannelKey;

/// Configuration errors
///
/// All of these are fatal for the run: a decoder configured from a corrupt
/// object info would mis-size every waveform it writes.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Failed to parse TOML: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("{decoder}: invalid trace length {length} for channel {channel}")]
    InvalidTraceLength {
        decoder: &'static str,
        channel: ChannelKey,
        length: i64,
    },

    #[error("{field} index {index} out of range (table has {len} entries)")]
    InvalidIndex {
        field: &'static str,
        index: usize,
        len: usize,
    },

    #[error("Invalid multisampling setup for channel {channel}: {reason}")]
    InvalidMultisampling { channel: ChannelKey, reason: String },
}

/// Object info: the sequence of card descriptors for one decoder model
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(from = "ObjectInfoRepr")]
pub struct ObjectInfo {
    pub cards: Vec<CardInfo>,
}

/// Accepted on-disk shapes
#[derive(Deserialize)]
#[serde(untagged)]
enum ObjectInfoRepr {
    Cards(Vec<CardInfo>),
    Table {
        #[serde(rename = "card", default)]
        cards: Vec<CardInfo>,
    },
}

impl From<ObjectInfoRepr> for ObjectInfo {
    fn from(repr: ObjectInfoRepr) -> Self {
        match repr {
            ObjectInfoRepr::Cards(cards) | ObjectInfoRepr::Table { cards } => Self { cards },
        }
    }
}

impl ObjectInfo {
    /// Wrap an already-built card list
    pub fn new(cards: Vec<CardInfo>) -> Self {
        Self { cards }
    }

    /// Load object info from a file; `.toml` is parsed as TOML, anything else as JSON
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Self::from_toml(&content),
            _ => Self::from_json(&content),
        }
    }

    /// Parse object info from a JSON string
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(content)?)
    }

    /// Parse object info from a TOML string (useful for testing)
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Iterate over the card descriptors
    pub fn iter(&self) -> impl Iterator<Item = &CardInfo> {
        self.cards.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.cards.is_empty()
    }
}

/// Validate a trace length reported by firmware: must lie in `(0, 65536]`
pub fn check_trace_length(
    decoder: &'static str,
    channel: ChannelKey,
    length: i64,
) -> Result<usize, ConfigError> {
    if length <= 0 || length > 1 << 16 {
        return Err(ConfigError::InvalidTraceLength {
            decoder,
            channel,
            length,
        });
    }
    Ok(length as usize)
}
