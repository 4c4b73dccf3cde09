//! Struck SIS3316 waveform decoder
//!
//! Only part of the Struck header is understood so far: the location word
//! used for routing, crate and card copies, the channel and timestamp words.
//! The waveform is whatever follows the 52-word header.

use std::collections::BTreeMap;

use serde::Deserialize;
use tracing::{debug, error, warn};

use super::common::{
    ChannelKey, DecodeResult, DecoderState, GeometryCheck, HeaderDict, PacketView,
};
use super::schema::{digitizer_header, DecodedSchema, FieldSpec, NumericType, WAVEFORM};
use super::sis3302::location_key;
use super::{require_words32, DecoderId, OrcaDecoder, TableSet};
use crate::common::error::DecodeError;
use crate::config::{check_trace_length, ConfigError, ObjectInfo};

pub const DECODER_ID: DecoderId = DecoderId {
    decoder_name: "ORSIS3316WaveformDecoder",
    orca_class_name: "ORSIS3316Model",
};

mod constants {
    pub const NAME: &str = "SIS3316";
    pub const N_CHANNELS: u32 = 16;
    pub const MAX_TRACE_LENGTH: usize = 65532;

    pub const CRATE_WORD: usize = 3;
    pub const CARD_WORD: usize = 4;
    pub const CHANNEL_WORD: usize = 9;
    pub const CHANNEL_MASK: u32 = 0xFFF0;
    pub const CHANNEL_SHIFT: u32 = 4;
    pub const TIMESTAMP_LOW_WORD: usize = 10;
    pub const TIMESTAMP_HIGH_MASK: u32 = 0xFFFF_0000;

    /// Written when the channel word is missing
    pub const CHANNEL_FALLBACK: u64 = 33;

    pub const HEADER_LENGTH16: usize = 52;
}

/// SIS3316 decoder configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Sis3316Config {
    /// ADC sample period in nanoseconds (125 MHz clock)
    pub sample_period_ns: f64,
    /// Reaction to records whose geometry does not add up
    pub geometry: GeometryCheck,
}

impl Default for Sis3316Config {
    fn default() -> Self {
        Self {
            sample_period_ns: 8.0,
            geometry: GeometryCheck::BestEffort,
        }
    }
}

/// Decoder for `ORSIS3316WaveformDecoder` records
#[derive(Debug, Clone)]
pub struct Sis3316Decoder {
    config: Sis3316Config,
    template: DecodedSchema,
    schemas: BTreeMap<ChannelKey, DecodedSchema>,
    state: DecoderState,
}

impl Sis3316Decoder {
    pub fn new(config: Sis3316Config) -> Self {
        let mut fields = digitizer_header(NumericType::Uint64, true);
        fields.push(FieldSpec::waveform(
            WAVEFORM,
            NumericType::Uint16,
            constants::MAX_TRACE_LENGTH,
            config.sample_period_ns,
        ));
        Self {
            config,
            template: DecodedSchema::new(fields),
            schemas: BTreeMap::new(),
            state: DecoderState::default(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(Sis3316Config::default())
    }

    pub fn config(&self) -> &Sis3316Config {
        &self.config
    }

    fn geometry_problem(&self, err: DecodeError) -> Result<(), DecodeError> {
        if self.config.geometry.is_strict() {
            error!(decoder = constants::NAME, "{}", err);
            Err(err)
        } else {
            warn!(decoder = constants::NAME, "{}, writing best-effort row", err);
            Ok(())
        }
    }
}

impl OrcaDecoder for Sis3316Decoder {
    fn decoder_name(&self) -> &'static str {
        DECODER_ID.decoder_name
    }

    fn orca_class_name(&self) -> &'static str {
        DECODER_ID.orca_class_name
    }

    fn schemas(&self) -> &BTreeMap<ChannelKey, DecodedSchema> {
        &self.schemas
    }

    fn set_object_info(&mut self, info: &ObjectInfo) -> Result<(), ConfigError> {
        let mut schemas = BTreeMap::new();
        for card in info.iter() {
            let trace_length = card.raw_data_buffer_len()?;
            // no per-channel enable information yet: every channel gets a schema
            for channel in 0..constants::N_CHANNELS {
                let key = ChannelKey::resolve(card.crate_id, card.card, channel);
                let length = check_trace_length(constants::NAME, key, trace_length)?;
                schemas.insert(key, self.template.with_waveform_length(length));
            }
        }
        debug!(decoder = constants::NAME, channels = schemas.len(), "Built decoded values");
        self.schemas = schemas;
        Ok(())
    }

    fn decode_packet(
        &mut self,
        packet: &PacketView<'_>,
        tables: &mut TableSet<'_>,
        packet_id: u32,
        _header: Option<&HeaderDict>,
    ) -> Result<DecodeResult, DecodeError> {
        require_words32(constants::NAME, packet, 1)?;
        let (crate_id, card, channel) = location_key(packet.u32(0).unwrap_or(0));
        let key = ChannelKey::resolve(crate_id, card, channel);

        let Some(table) = tables.route(key, constants::NAME, &mut self.state.skipped) else {
            return Ok(DecodeResult::Skipped(key));
        };

        if packet.len16() < constants::HEADER_LENGTH16 {
            self.geometry_problem(DecodeError::truncated(
                constants::NAME,
                constants::HEADER_LENGTH16 * 2,
                packet.len_bytes(),
            ))?;
        }
        let row_crate = packet.u32(constants::CRATE_WORD).unwrap_or(0);
        let row_card = packet.u32(constants::CARD_WORD).unwrap_or(0);
        let row_channel = packet
            .u32(constants::CHANNEL_WORD)
            .map(|w| ((w & constants::CHANNEL_MASK) >> constants::CHANNEL_SHIFT) as u64)
            .unwrap_or(constants::CHANNEL_FALLBACK);
        let timestamp = match (
            packet.u32(constants::CHANNEL_WORD),
            packet.u32(constants::TIMESTAMP_LOW_WORD),
        ) {
            (Some(high), Some(low)) => {
                low as u64 + (((high & constants::TIMESTAMP_HIGH_MASK) as u64) << 16)
            }
            _ => 0,
        };

        let available = packet.len16().saturating_sub(constants::HEADER_LENGTH16);
        let out = table.waveform_u16_mut(WAVEFORM)?;
        if available != out.len() {
            self.geometry_problem(DecodeError::waveform_length(
                constants::NAME,
                out.len(),
                available,
            ))?;
        }
        let mut written = 0;
        for (dst, sample) in out
            .iter_mut()
            .zip(packet.u16_range(constants::HEADER_LENGTH16, packet.len16()))
        {
            *dst = sample;
            written += 1;
        }
        out[written..].fill(0);

        debug!(decoder = constants::NAME, channel = %key, samples = written, "Decoded record");

        table.set_scalar("packet_id", packet_id as u64)?;
        table.set_scalar("ievt", self.state.ievt as u64)?;
        table.set_scalar("timestamp", timestamp)?;
        table.set_scalar("crate", row_crate as u64)?;
        table.set_scalar("card", row_card as u64)?;
        table.set_scalar("channel", row_channel)?;
        table.push_row();
        self.state.next_event();

        Ok(DecodeResult::Written)
    }

    fn state(&self) -> &DecoderState {
        &self.state
    }
}
