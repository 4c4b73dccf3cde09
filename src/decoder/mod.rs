//! Decoder module for ORCA digitizer packets
//!
//! Converts one raw ORCA record into one row of a per-channel output table.
//! Every hardware model implements [`OrcaDecoder`]; [`DecoderRegistry`] builds
//! the right decoder from the model names found in the ORCA header.

pub mod ami286;
pub mod common;
pub mod gretina4m;
pub mod multisampling;
pub mod schema;
pub mod sis3302;
pub mod sis3316;

pub use ami286::{Ami286Config, Ami286Decoder};
pub use common::{
    ChannelKey, DecodeResult, DecoderState, GeometryCheck, HeaderDict, PacketView, SkipCounter,
};
pub use gretina4m::{Gretina4mConfig, Gretina4mDecoder};
pub use multisampling::{MultisamplingParams, Reconstructor, ScratchBuffer};
pub use schema::{DecodedSchema, FieldSpec, NumericType, SamplePeriod, WAVEFORM};
pub use sis3302::{Sis3302Config, Sis3302Decoder};
pub use sis3316::{Sis3316Config, Sis3316Decoder};

use std::collections::BTreeMap;

use tracing::{debug, error, warn};

use crate::common::error::DecodeError;
use crate::config::{ConfigError, ObjectInfo};
use crate::table::{ChannelTables, OutputTable};

/// Where a decoder writes its rows
pub enum TableSet<'a> {
    /// Every packet goes to the same table
    Single(&'a mut dyn OutputTable),
    /// One table per channel; packets for channels without a table are skipped
    PerChannel(&'a mut dyn ChannelTables),
}

impl<'a> TableSet<'a> {
    /// Find the table for `key`, counting a skip when there is none
    pub fn route(
        &mut self,
        key: ChannelKey,
        decoder: &'static str,
        skipped: &mut SkipCounter,
    ) -> Option<&mut dyn OutputTable> {
        match self {
            TableSet::Single(table) => {
                let table: &mut dyn OutputTable = &mut **table;
                Some(table)
            }
            TableSet::PerChannel(tables) => match tables.table_mut(key) {
                Some(table) => Some(table),
                None => {
                    let count = skipped.record(key);
                    if count == 1 {
                        warn!(decoder, channel = %key, "No table for channel, skipping its packets");
                    } else {
                        debug!(decoder, channel = %key, count, "Skipped packet");
                    }
                    None
                }
            },
        }
    }
}

/// Shared contract of all ORCA packet decoders
pub trait OrcaDecoder: Send {
    /// ORCA decoder name, e.g. `ORSIS3302DecoderForEnergy`
    fn decoder_name(&self) -> &'static str;

    /// ORCA model class name, e.g. `ORSIS3302Model`
    fn orca_class_name(&self) -> &'static str;

    /// Per-channel schemas built by the last `set_object_info`
    fn schemas(&self) -> &BTreeMap<ChannelKey, DecodedSchema>;

    /// Schema for a channel, or the first built schema when `channel` is `None`
    fn get_decoded_values(&self, channel: Option<ChannelKey>) -> Result<&DecodedSchema, DecodeError> {
        let schemas = self.schemas();
        match channel {
            None => schemas.values().next().ok_or_else(|| {
                error!(decoder = self.orca_class_name(), "Decoded values not built yet");
                DecodeError::NotBuilt {
                    decoder: self.orca_class_name(),
                }
            }),
            Some(key) => schemas.get(&key).ok_or_else(|| {
                error!(decoder = self.orca_class_name(), channel = %key, "No decoded values for channel");
                DecodeError::NoSchema {
                    decoder: self.orca_class_name(),
                    channel: key,
                }
            }),
        }
    }

    /// Rebuild all per-channel state from the card descriptors
    fn set_object_info(&mut self, info: &ObjectInfo) -> Result<(), ConfigError>;

    fn max_n_rows_per_packet(&self) -> usize {
        1
    }

    /// Decode one packet into one row
    fn decode_packet(
        &mut self,
        packet: &PacketView<'_>,
        tables: &mut TableSet<'_>,
        packet_id: u32,
        header: Option<&HeaderDict>,
    ) -> Result<DecodeResult, DecodeError>;

    /// Event counter and skip accounting
    fn state(&self) -> &DecoderState;

    fn skipped_channels(&self) -> &SkipCounter {
        &self.state().skipped
    }

    /// Rows written so far
    fn events_decoded(&self) -> u32 {
        self.state().ievt
    }
}

/// The (decoder name, ORCA class name) pair identifying a model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DecoderId {
    pub decoder_name: &'static str,
    pub orca_class_name: &'static str,
}

type DecoderFactory = fn() -> Box<dyn OrcaDecoder>;

/// Builds decoders from ORCA model names
pub struct DecoderRegistry {
    entries: Vec<(DecoderId, DecoderFactory)>,
}

impl Default for DecoderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DecoderRegistry {
    /// Registry with every supported model, each with its default config
    pub fn new() -> Self {
        let mut registry = Self {
            entries: Vec::new(),
        };
        registry.register(sis3302::DECODER_ID, || Box::new(Sis3302Decoder::with_defaults()));
        registry.register(gretina4m::DECODER_ID, || Box::new(Gretina4mDecoder::with_defaults()));
        registry.register(sis3316::DECODER_ID, || Box::new(Sis3316Decoder::with_defaults()));
        registry.register(ami286::DECODER_ID, || Box::new(Ami286Decoder::with_defaults()));
        registry
    }

    /// Add or replace the factory for a model
    pub fn register(&mut self, id: DecoderId, factory: DecoderFactory) {
        self.entries.retain(|(existing, _)| *existing != id);
        self.entries.push((id, factory));
    }

    /// Build the decoder registered under exactly this pair
    pub fn create(&self, decoder_name: &str, orca_class_name: &str) -> Option<Box<dyn OrcaDecoder>> {
        self.entries
            .iter()
            .find(|(id, _)| id.decoder_name == decoder_name && id.orca_class_name == orca_class_name)
            .map(|(_, factory)| factory())
    }

    /// Build a decoder from its decoder name alone
    pub fn create_by_decoder_name(&self, decoder_name: &str) -> Option<Box<dyn OrcaDecoder>> {
        self.entries
            .iter()
            .find(|(id, _)| id.decoder_name == decoder_name)
            .map(|(_, factory)| factory())
    }

    /// Build a decoder from its ORCA class name alone
    pub fn create_by_class_name(&self, orca_class_name: &str) -> Option<Box<dyn OrcaDecoder>> {
        self.entries
            .iter()
            .find(|(id, _)| id.orca_class_name == orca_class_name)
            .map(|(_, factory)| factory())
    }

    pub fn ids(&self) -> impl Iterator<Item = DecoderId> + '_ {
        self.entries.iter().map(|(id, _)| *id)
    }
}

/// Require at least `words` 32-bit words in the packet
pub(crate) fn require_words32(
    decoder: &'static str,
    packet: &PacketView<'_>,
    words: usize,
) -> Result<(), DecodeError> {
    if packet.len32() < words {
        return Err(DecodeError::truncated(decoder, words * 4, packet.len_bytes()));
    }
    Ok(())
}
