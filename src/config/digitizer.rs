//! Per-card hardware descriptors from the ORCA run header
//!
//! ORCA writes one dictionary per digitizer card into the file header. The
//! key names are kept exactly as ORCA spells them (`Crate`, `FtCnt`,
//! `sampleLengths`, ...) so a header dump deserializes without translation.
//!
//! Every model-specific key is optional here; the decoder that needs a key
//! asks for it through an accessor and gets a `ConfigError::MissingField`
//! when the card does not carry it.

use serde::{Deserialize, Deserializer};
use std::collections::HashMap;

use super::ConfigError;

/// One digitizer card as described by ORCA
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CardInfo {
    /// VME crate number
    #[serde(rename = "Crate")]
    pub crate_id: u32,

    /// Slot / card number within the crate
    #[serde(rename = "Card")]
    pub card: u32,

    /// SIS3302: channels with the internal trigger enabled
    #[serde(rename = "internalTriggerEnabledMask", default)]
    pub internal_trigger_enabled_mask: Option<u32>,

    /// SIS3302: channels with the external trigger enabled
    #[serde(rename = "externalTriggerEnabledMask", default)]
    pub external_trigger_enabled_mask: Option<u32>,

    /// SIS3302: trace length per channel pair
    #[serde(rename = "sampleLengths", default)]
    pub sample_lengths: Option<Vec<i64>>,

    /// Gretina4M: per-channel enable flags (ORCA writes 0/1 or true/false)
    #[serde(rename = "Enabled", default, deserialize_with = "deserialize_flags")]
    pub enabled: Option<Vec<bool>>,

    /// Gretina4M: number of presummed samples per channel (0 = multisampling off)
    #[serde(rename = "FtCnt", default)]
    pub ft_cnt: Option<Vec<i64>>,

    /// Gretina4M: index into the presum rate table per channel
    #[serde(rename = "Mrpsrt", default)]
    pub mrpsrt: Option<Vec<usize>>,

    /// Gretina4M: index into the divider table per channel
    #[serde(rename = "Mrpsdv", default)]
    pub mrpsdv: Option<Vec<usize>>,

    /// SIS3316: raw data buffer length (trace length)
    #[serde(rename = "rawDataBufferLen", default)]
    pub raw_data_buffer_len: Option<i64>,

    /// Everything else ORCA recorded for this card
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl CardInfo {
    /// Create a bare descriptor (mostly for tests and the emulator)
    pub fn new(crate_id: u32, card: u32) -> Self {
        Self {
            crate_id,
            card,
            ..Self::default()
        }
    }

    fn missing(&self, field: &str) -> ConfigError {
        ConfigError::MissingField(format!(
            "crate {} card {}: {}",
            self.crate_id, self.card, field
        ))
    }

    /// SIS3302 enabled channels: internal | external trigger mask
    pub fn trigger_enabled_mask(&self) -> Result<u32, ConfigError> {
        match (
            self.internal_trigger_enabled_mask,
            self.external_trigger_enabled_mask,
        ) {
            (None, None) => Err(self.missing("internalTriggerEnabledMask")),
            (int, ext) => Ok(int.unwrap_or(0) | ext.unwrap_or(0)),
        }
    }

    /// SIS3302 trace length for a channel (one entry per channel pair)
    pub fn sample_length(&self, channel: u32) -> Result<i64, ConfigError> {
        let index = (channel / 2) as usize;
        self.sample_lengths
            .as_ref()
            .and_then(|lengths| lengths.get(index).copied())
            .ok_or_else(|| self.missing(&format!("sampleLengths[{}]", index)))
    }

    /// Gretina4M enable flag for a channel
    pub fn is_enabled(&self, channel: u32) -> Result<bool, ConfigError> {
        self.enabled
            .as_ref()
            .ok_or_else(|| self.missing("Enabled"))
            .map(|flags| flags.get(channel as usize).copied().unwrap_or(false))
    }

    /// Gretina4M presummed sample count for a channel
    pub fn ft_count(&self, channel: u32) -> Result<i64, ConfigError> {
        per_channel(&self.ft_cnt, channel).ok_or_else(|| self.missing(&format!("FtCnt[{}]", channel)))
    }

    /// Gretina4M presum rate index for a channel
    pub fn presum_rate_index(&self, channel: u32) -> Result<usize, ConfigError> {
        per_channel(&self.mrpsrt, channel)
            .ok_or_else(|| self.missing(&format!("Mrpsrt[{}]", channel)))
    }

    /// Gretina4M divider index for a channel
    pub fn divider_index(&self, channel: u32) -> Result<usize, ConfigError> {
        per_channel(&self.mrpsdv, channel)
            .ok_or_else(|| self.missing(&format!("Mrpsdv[{}]", channel)))
    }

    /// SIS3316 trace length
    pub fn raw_data_buffer_len(&self) -> Result<i64, ConfigError> {
        self.raw_data_buffer_len
            .ok_or_else(|| self.missing("rawDataBufferLen"))
    }
}

fn per_channel<T: Copy>(values: &Option<Vec<T>>, channel: u32) -> Option<T> {
    values
        .as_ref()
        .and_then(|values| values.get(channel as usize).copied())
}

/// ORCA flag arrays come out of plists as either booleans or integers
#[derive(Deserialize)]
#[serde(untagged)]
enum Flag {
    Bool(bool),
    Int(i64),
}

fn deserialize_flags<'de, D>(deserializer: D) -> Result<Option<Vec<bool>>, D::Error>
where
    D: Deserializer<'de>,
{
    let flags: Option<Vec<Flag>> = Option::deserialize(deserializer)?;
    Ok(flags.map(|flags| {
        flags
            .into_iter()
            .map(|flag| match flag {
                Flag::Bool(b) => b,
                Flag::Int(i) => i != 0,
            })
            .collect()
    }))
}
