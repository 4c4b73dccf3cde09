//! AMI286 cryogen level sensor decoder
//!
//! A level record is three 32-bit words: the geographic address (with the
//! usual crate/card location bits), the channel 0 level and its timestamp.

use std::collections::BTreeMap;

use serde::Deserialize;
use tracing::{debug, error, warn};

use super::common::{
    ChannelKey, DecodeResult, DecoderState, GeometryCheck, HeaderDict, PacketView,
};
use super::schema::{DecodedSchema, FieldSpec, NumericType};
use super::{DecoderId, OrcaDecoder, TableSet};
use crate::common::error::DecodeError;
use crate::config::{ConfigError, ObjectInfo};

pub const DECODER_ID: DecoderId = DecoderId {
    decoder_name: "ORAmi286DecoderForLevel",
    orca_class_name: "LevelSensorDecoders",
};

mod constants {
    pub const NAME: &str = "AMI286";
    pub const RECORD_WORDS: usize = 3;

    pub const CRATE_SHIFT: u32 = 21;
    pub const CRATE_MASK: u32 = 0xF;
    pub const CARD_SHIFT: u32 = 16;
    pub const CARD_MASK: u32 = 0x1F;
}

/// AMI286 decoder configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Ami286Config {
    /// Reaction to short records
    pub geometry: GeometryCheck,
}

impl Default for Ami286Config {
    fn default() -> Self {
        Self {
            geometry: GeometryCheck::BestEffort,
        }
    }
}

/// Decoder for `ORAmi286DecoderForLevel` records
#[derive(Debug, Clone)]
pub struct Ami286Decoder {
    config: Ami286Config,
    schema: DecodedSchema,
    /// One entry per configured sensor, all sharing the fixed schema
    schemas: BTreeMap<ChannelKey, DecodedSchema>,
    state: DecoderState,
}

impl Ami286Decoder {
    pub fn new(config: Ami286Config) -> Self {
        Self {
            config,
            schema: DecodedSchema::new(vec![
                FieldSpec::scalar("geoaddress", NumericType::Uint32),
                FieldSpec::scalar("ievt", NumericType::Uint32),
                FieldSpec::scalar("ch0_ls", NumericType::Uint32),
                FieldSpec::scalar("ch0_timestamp", NumericType::Uint32),
            ]),
            schemas: BTreeMap::new(),
            state: DecoderState::default(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(Ami286Config::default())
    }

    pub fn config(&self) -> &Ami286Config {
        &self.config
    }

    /// Routing key of a geographic address word
    pub fn channel_key(geoaddress: u32) -> ChannelKey {
        ChannelKey::resolve(
            (geoaddress >> constants::CRATE_SHIFT) & constants::CRATE_MASK,
            (geoaddress >> constants::CARD_SHIFT) & constants::CARD_MASK,
            0,
        )
    }
}

impl OrcaDecoder for Ami286Decoder {
    fn decoder_name(&self) -> &'static str {
        DECODER_ID.decoder_name
    }

    fn orca_class_name(&self) -> &'static str {
        DECODER_ID.orca_class_name
    }

    fn schemas(&self) -> &BTreeMap<ChannelKey, DecodedSchema> {
        &self.schemas
    }

    /// The schema is the same for every sensor and available before configuration
    fn get_decoded_values(&self, _channel: Option<ChannelKey>) -> Result<&DecodedSchema, DecodeError> {
        Ok(&self.schema)
    }

    fn set_object_info(&mut self, info: &ObjectInfo) -> Result<(), ConfigError> {
        self.schemas = info
            .iter()
            .map(|card| {
                (
                    ChannelKey::resolve(card.crate_id, card.card, 0),
                    self.schema.clone(),
                )
            })
            .collect();
        debug!(decoder = constants::NAME, sensors = self.schemas.len(), "Built decoded values");
        Ok(())
    }

    fn decode_packet(
        &mut self,
        packet: &PacketView<'_>,
        tables: &mut TableSet<'_>,
        _packet_id: u32,
        _header: Option<&HeaderDict>,
    ) -> Result<DecodeResult, DecodeError> {
        if packet.len32() < constants::RECORD_WORDS {
            let err = DecodeError::truncated(
                constants::NAME,
                constants::RECORD_WORDS * 4,
                packet.len_bytes(),
            );
            if self.config.geometry.is_strict() {
                error!(decoder = constants::NAME, "{}", err);
                return Err(err);
            }
            warn!(decoder = constants::NAME, "{}, missing words written as 0", err);
        }
        let geoaddress = packet.u32(0).unwrap_or(0);
        let key = Self::channel_key(geoaddress);

        let Some(table) = tables.route(key, constants::NAME, &mut self.state.skipped) else {
            return Ok(DecodeResult::Skipped(key));
        };

        table.set_scalar("geoaddress", geoaddress as u64)?;
        table.set_scalar("ievt", self.state.ievt as u64)?;
        table.set_scalar("ch0_ls", packet.u32(1).unwrap_or(0) as u64)?;
        table.set_scalar("ch0_timestamp", packet.u32(2).unwrap_or(0) as u64)?;
        table.push_row();
        self.state.next_event();

        Ok(DecodeResult::Written)
    }

    fn state(&self) -> &DecoderState {
        &self.state
    }
}
