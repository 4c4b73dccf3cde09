//! Gretina4M waveform decoder
//!
//! Record layout (native-endian 16-bit words):
//!
//! ```text
//!  u16[1]      crate(5..8) | card(0..4)
//!  u16[4]      board id(4..15) | channel(0..3)
//!  u16[6..9]   48-bit timestamp, low word first
//!  u16[9]      energy low 16 bits
//!  u16[10]     energy high 9 bits (0..8)
//!  u16[18..]   2018 signed samples
//! ```
//!
//! Channels with `FtCnt > 0` run in multisampling mode and are expanded by
//! [`Reconstructor`]; the others keep samples `16..2016`.

use std::collections::BTreeMap;

use serde::Deserialize;
use tracing::debug;

use super::common::{ChannelKey, DecodeResult, DecoderState, HeaderDict, PacketView};
use super::multisampling::{MultisamplingParams, Reconstructor, RAW_LEN, WF_SKIP};
use super::schema::{digitizer_header, DecodedSchema, FieldSpec, NumericType, WAVEFORM};
use super::{DecoderId, OrcaDecoder, TableSet};
use crate::common::error::DecodeError;
use crate::config::{ConfigError, ObjectInfo};

pub const DECODER_ID: DecoderId = DecoderId {
    decoder_name: "ORGretina4MWaveformDecoder",
    orca_class_name: "ORGretina4MModel",
};

mod constants {
    pub const NAME: &str = "Gretina4M";
    pub const N_CHANNELS: u32 = 10;

    pub const LOCATION_WORD: usize = 1;
    pub const CRATE_SHIFT: u16 = 5;
    pub const CRATE_MASK: u16 = 0xF;
    pub const CARD_MASK: u16 = 0x1F;

    pub const CHANNEL_WORD: usize = 4;
    pub const CHANNEL_MASK: u16 = 0xF;
    pub const BOARD_ID_MASK: u16 = 0xFFF0;
    pub const BOARD_ID_SHIFT: u16 = 4;

    pub const TIMESTAMP_WORD: usize = 6;
    pub const ENERGY_WORD: usize = 9;
    pub const ENERGY_HIGH_MASK: u16 = 0x1FF;

    pub const WAVEFORM_WORD: usize = 18;
    /// First word of a waveform that is not multisampled; it is counted from
    /// the end of the 16-word card header, not from `WAVEFORM_WORD`
    pub const FULL_RATE_WORD: usize = 16 + super::WF_SKIP;
}

/// Length of a waveform that is not multisampled
pub const FULL_RATE_LEN: usize = RAW_LEN - 2 - WF_SKIP;

/// Index into the raw samples where a full-rate waveform starts
const FULL_RATE_OFFSET: usize = constants::FULL_RATE_WORD - constants::WAVEFORM_WORD;

/// Gretina4M decoder configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Gretina4mConfig {
    /// ADC sample period in nanoseconds (100 MHz clock)
    pub sample_period_ns: f64,
}

impl Default for Gretina4mConfig {
    fn default() -> Self {
        Self {
            sample_period_ns: 10.0,
        }
    }
}

/// Decoder for `ORGretina4MWaveformDecoder` records
#[derive(Debug, Clone)]
pub struct Gretina4mDecoder {
    config: Gretina4mConfig,
    template: DecodedSchema,
    schemas: BTreeMap<ChannelKey, DecodedSchema>,
    /// Present only for multisampled channels
    multisampling: BTreeMap<ChannelKey, MultisamplingParams>,
    reconstructor: Reconstructor,
    /// Raw samples of the packet being decoded
    raw: Vec<i16>,
    state: DecoderState,
}

impl Gretina4mDecoder {
    pub fn new(config: Gretina4mConfig) -> Self {
        let mut fields = digitizer_header(NumericType::Uint64, false);
        fields.push(FieldSpec::scalar("board_id", NumericType::Uint32));
        fields.push(FieldSpec::waveform(
            WAVEFORM,
            NumericType::Int16,
            FULL_RATE_LEN,
            config.sample_period_ns,
        ));
        Self {
            config,
            template: DecodedSchema::new(fields),
            schemas: BTreeMap::new(),
            multisampling: BTreeMap::new(),
            reconstructor: Reconstructor::new(),
            raw: Vec::with_capacity(RAW_LEN),
            state: DecoderState::default(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(Gretina4mConfig::default())
    }

    pub fn config(&self) -> &Gretina4mConfig {
        &self.config
    }

    /// Multisampling parameters of a channel, `None` when it runs at full rate
    pub fn multisampling(&self, key: ChannelKey) -> Option<&MultisamplingParams> {
        self.multisampling.get(&key)
    }

    pub fn is_multisampled(&self, key: ChannelKey) -> bool {
        self.multisampling.contains_key(&key)
    }
}

impl OrcaDecoder for Gretina4mDecoder {
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
        let mut multisampling = BTreeMap::new();
        for card in info.iter() {
            for channel in 0..constants::N_CHANNELS {
                if !card.is_enabled(channel)? {
                    continue;
                }
                let key = ChannelKey::resolve(card.crate_id, card.card, channel);
                // pre-rising-edge multisampling is not used; FtCnt > 0 means
                // the tail of the trace is presummed
                let ft_len = card.ft_count(channel)?;
                let length = if ft_len > 0 {
                    let params = MultisamplingParams::from_registers(
                        key,
                        ft_len as usize,
                        card.presum_rate_index(channel)?,
                        card.divider_index(channel)?,
                    )?;
                    multisampling.insert(key, params);
                    params.output_len()
                } else {
                    FULL_RATE_LEN
                };
                schemas.insert(key, self.template.with_waveform_length(length));
            }
        }

        if let Some(longest) = multisampling.values().map(|p| p.output_len()).max() {
            self.reconstructor.reserve(longest);
        }
        debug!(
            decoder = constants::NAME,
            channels = schemas.len(),
            multisampled = multisampling.len(),
            "Built decoded values"
        );
        self.schemas = schemas;
        self.multisampling = multisampling;
        Ok(())
    }

    fn decode_packet(
        &mut self,
        packet: &PacketView<'_>,
        tables: &mut TableSet<'_>,
        packet_id: u32,
        _header: Option<&HeaderDict>,
    ) -> Result<DecodeResult, DecodeError> {
        let (location, channel_word) = match (
            packet.u16(constants::LOCATION_WORD),
            packet.u16(constants::CHANNEL_WORD),
        ) {
            (Some(location), Some(channel_word)) => (location, channel_word),
            _ => {
                return Err(DecodeError::truncated(
                    constants::NAME,
                    (constants::CHANNEL_WORD + 1) * 2,
                    packet.len_bytes(),
                ))
            }
        };
        let crate_id = (location >> constants::CRATE_SHIFT) & constants::CRATE_MASK;
        let card = location & constants::CARD_MASK;
        let channel = channel_word & constants::CHANNEL_MASK;
        let key = ChannelKey::resolve(crate_id as u32, card as u32, channel as u32);

        let Some(table) = tables.route(key, constants::NAME, &mut self.state.skipped) else {
            return Ok(DecodeResult::Skipped(key));
        };

        let record_len16 = constants::WAVEFORM_WORD + RAW_LEN;
        if packet.len16() < record_len16 {
            return Err(DecodeError::truncated(
                constants::NAME,
                record_len16 * 2,
                packet.len_bytes(),
            ));
        }
        let word = |i: usize| packet.u16(i).unwrap_or(0) as u64;
        let energy = word(constants::ENERGY_WORD)
            + ((word(constants::ENERGY_WORD + 1) & constants::ENERGY_HIGH_MASK as u64) << 16);
        let timestamp = word(constants::TIMESTAMP_WORD)
            + (word(constants::TIMESTAMP_WORD + 1) << 16)
            + (word(constants::TIMESTAMP_WORD + 2) << 32);
        let board_id = (channel_word & constants::BOARD_ID_MASK) >> constants::BOARD_ID_SHIFT;

        self.raw.clear();
        self.raw.extend(packet.i16_range(constants::WAVEFORM_WORD, record_len16));

        let out = table.waveform_i16_mut(WAVEFORM)?;
        match self.multisampling.get(&key) {
            Some(params) => {
                if out.len() != params.output_len() {
                    return Err(DecodeError::waveform_length(
                        constants::NAME,
                        params.output_len(),
                        out.len(),
                    ));
                }
                let splice = self.reconstructor.reconstruct(&self.raw, params, out);
                debug!(
                    decoder = constants::NAME,
                    channel = %key,
                    splice = splice.raw,
                    nominal = params.nominal_splice(),
                    "Reconstructed multisampled waveform"
                );
            }
            None => {
                if out.len() != FULL_RATE_LEN {
                    return Err(DecodeError::waveform_length(
                        constants::NAME,
                        FULL_RATE_LEN,
                        out.len(),
                    ));
                }
                out.copy_from_slice(&self.raw[FULL_RATE_OFFSET..FULL_RATE_OFFSET + FULL_RATE_LEN]);
            }
        }

        table.set_scalar("packet_id", packet_id as u64)?;
        table.set_scalar("ievt", self.state.ievt as u64)?;
        table.set_scalar("energy", energy)?;
        table.set_scalar("timestamp", timestamp)?;
        table.set_scalar("crate", crate_id as u64)?;
        table.set_scalar("card", card as u64)?;
        table.set_scalar("channel", channel as u64)?;
        table.set_scalar("board_id", board_id as u64)?;
        table.push_row();
        self.state.next_event();

        Ok(DecodeResult::Written)
    }

    fn state(&self) -> &DecoderState {
        &self.state
    }
}
