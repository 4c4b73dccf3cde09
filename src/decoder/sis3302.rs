//! Struck SIS3302 energy/waveform decoder
//!
//! Record layout (native-endian 32-bit words, ORCA length word stripped):
//!
//! ```text
//!  p32[0]  lost msb(25..31) | crate(21..24) | card(16..20) | channel(8..15) | lost lsb(2..8) | wrap(0)
//!  p32[1]  waveform length (32-bit words)
//!  p32[2]  energy waveform length (32-bit words)
//!  p32[3]  timestamp high 16 bits (16..31) | event header id (0..7)
//!  p32[4]  timestamp low 32 bits
//!  p32[5..7]  extra SIS header words, present only when the buffer wrapped;
//!             p32[6] is the wrap offset
//!  ...     waveform (16-bit samples), energy waveform
//!  p32[-4] energy, p32[-3] energy_first, p32[-2] flags, p32[-1] 0xDEADBEEF
//! ```

use std::collections::BTreeMap;

use serde::Deserialize;
use tracing::{debug, error, warn};

use super::common::{
    ChannelKey, DecodeResult, DecoderState, GeometryCheck, HeaderDict, PacketView,
};
use super::schema::{digitizer_header, DecodedSchema, FieldSpec, NumericType, WAVEFORM};
use super::{require_words32, DecoderId, OrcaDecoder, TableSet};
use crate::common::error::DecodeError;
use crate::config::{check_trace_length, ConfigError, ObjectInfo};

pub const DECODER_ID: DecoderId = DecoderId {
    decoder_name: "ORSIS3302DecoderForEnergy",
    orca_class_name: "ORSIS3302Model",
};

mod constants {
    pub const NAME: &str = "SIS3302";
    pub const N_CHANNELS: u32 = 10;
    pub const MAX_TRACE_LENGTH: usize = 65532;

    pub const CRATE_SHIFT: u32 = 21;
    pub const CRATE_MASK: u32 = 0xF;
    pub const CARD_SHIFT: u32 = 16;
    pub const CARD_MASK: u32 = 0x1F;
    pub const CHANNEL_SHIFT: u32 = 8;
    pub const CHANNEL_MASK: u32 = 0xFF;
    pub const LOST_MSB_SHIFT: u32 = 25;
    pub const LOST_LSB_SHIFT: u32 = 2;
    pub const LOST_MASK: u32 = 0x7F;
    pub const WRAP_MASK: u32 = 0x1;
    pub const EVENT_HEADER_ID_MASK: u32 = 0xFF;
    pub const TIMESTAMP_HIGH_MASK: u32 = 0xFFFF_0000;

    // Geometry in 16-bit words
    pub const ORCA_HELPER_LENGTH16: usize = 2;
    pub const SIS_HEADER_LENGTH16: usize = 8;
    pub const SIS_HEADER_WRAPPED_LENGTH16: usize = 12;
    pub const FOOTER_LENGTH16: usize = 8;
    pub const FOOTER_LENGTH32: usize = FOOTER_LENGTH16 / 2;

    pub const WRAP_OFFSET_WORD: usize = 6;
    pub const SENTINEL: u32 = 0xDEAD_BEEF;
}

/// Location bits shared by the Struck record headers
pub(crate) fn location_key(word0: u32) -> (u32, u32, u32) {
    (
        (word0 >> constants::CRATE_SHIFT) & constants::CRATE_MASK,
        (word0 >> constants::CARD_SHIFT) & constants::CARD_MASK,
        (word0 >> constants::CHANNEL_SHIFT) & constants::CHANNEL_MASK,
    )
}

/// SIS3302 decoder configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Sis3302Config {
    /// ADC sample period in nanoseconds (100 MHz clock)
    pub sample_period_ns: f64,
    /// Reaction to records whose geometry does not add up
    pub geometry: GeometryCheck,
}

impl Default for Sis3302Config {
    fn default() -> Self {
        Self {
            sample_period_ns: 10.0,
            geometry: GeometryCheck::Strict,
        }
    }
}

/// Parsed fixed part of one record
#[derive(Debug, Clone, PartialEq, Eq)]
struct Header {
    crate_id: u32,
    card: u32,
    channel: u32,
    n_lost_records: u32,
    buffer_wrap: bool,
    wf_length16: usize,
    ene_wf_length16: usize,
    event_header_id: u32,
    timestamp: u64,
}

impl Header {
    fn parse(packet: &PacketView<'_>) -> Option<Self> {
        let w0 = packet.u32(0)?;
        let (crate_id, card, channel) = location_key(w0);
        let w3 = packet.u32(3)?;
        let lost_msb = (w0 >> constants::LOST_MSB_SHIFT) & constants::LOST_MASK;
        let lost_lsb = (w0 >> constants::LOST_LSB_SHIFT) & constants::LOST_MASK;
        Some(Self {
            crate_id,
            card,
            channel,
            n_lost_records: (lost_msb << 7) + lost_lsb,
            buffer_wrap: w0 & constants::WRAP_MASK != 0,
            wf_length16: 2 * packet.u32(1)? as usize,
            ene_wf_length16: 2 * packet.u32(2)? as usize,
            event_header_id: w3 & constants::EVENT_HEADER_ID_MASK,
            timestamp: packet.u32(4)? as u64
                + (((w3 & constants::TIMESTAMP_HIGH_MASK) as u64) << 16),
        })
    }

    fn header_length16(&self) -> usize {
        constants::ORCA_HELPER_LENGTH16
            + if self.buffer_wrap {
                constants::SIS_HEADER_WRAPPED_LENGTH16
            } else {
                constants::SIS_HEADER_LENGTH16
            }
    }
}

/// Footer words
#[derive(Debug, Clone, Copy)]
struct Footer {
    energy: u32,
    energy_first: u32,
    flags: u32,
    last_word: u32,
}

impl Footer {
    fn parse(packet: &PacketView<'_>) -> Option<Self> {
        Some(Self {
            energy: packet.u32_from_end(4)?,
            energy_first: packet.u32_from_end(3)?,
            flags: packet.u32_from_end(2)?,
            last_word: packet.u32_from_end(1)?,
        })
    }
}

/// Decoder for `ORSIS3302DecoderForEnergy` records
#[derive(Debug, Clone)]
pub struct Sis3302Decoder {
    config: Sis3302Config,
    template: DecodedSchema,
    schemas: BTreeMap<ChannelKey, DecodedSchema>,
    state: DecoderState,
}

impl Sis3302Decoder {
    pub fn new(config: Sis3302Config) -> Self {
        let mut fields = digitizer_header(NumericType::Uint64, true);
        fields.push(FieldSpec::scalar("n_lost_records", NumericType::Uint16));
        fields.push(FieldSpec::scalar("flags", NumericType::Uint32));
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
        Self::new(Sis3302Config::default())
    }

    pub fn config(&self) -> &Sis3302Config {
        &self.config
    }

    /// Strict mode fails with `err`; best effort logs it and carries on
    fn geometry_problem(&self, err: DecodeError) -> Result<(), DecodeError> {
        if self.config.geometry.is_strict() {
            error!(decoder = constants::NAME, "{}", err);
            Err(err)
        } else {
            warn!(decoder = constants::NAME, "{}, writing best-effort row", err);
            Ok(())
        }
    }

    /// Source ranges (in 16-bit words) of the time-ordered waveform
    fn waveform_ranges(
        &self,
        packet: &PacketView<'_>,
        header: &Header,
        expected: usize,
    ) -> Result<[(usize, usize); 2], DecodeError> {
        let wf_start = header.header_length16();
        let wf_stop = (wf_start + header.wf_length16.min(expected)).min(packet.len16());
        if !header.buffer_wrap {
            return Ok([(wf_start, wf_stop), (wf_stop, wf_stop)]);
        }
        let offset = packet
            .u32(constants::WRAP_OFFSET_WORD)
            .ok_or_else(|| DecodeError::truncated(constants::NAME, 28, packet.len_bytes()))?;
        let start1 = offset as usize + wf_start + 1;
        if start1 > wf_stop {
            let err = DecodeError::BufferWrap {
                decoder: constants::NAME,
                start: start1,
                begin: wf_start,
                end: wf_stop,
            };
            self.geometry_problem(err)?;
            return Ok([(wf_start, wf_stop), (wf_stop, wf_stop)]);
        }
        // wrapped tail first, then the head up to the wrap point
        Ok([(start1, wf_stop), (wf_start, start1)])
    }
}

impl OrcaDecoder for Sis3302Decoder {
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
            let enabled_mask = card.trigger_enabled_mask()?;
            for channel in 0..constants::N_CHANNELS {
                if (enabled_mask >> channel) & 0x1 == 0 {
                    continue;
                }
                let key = ChannelKey::resolve(card.crate_id, card.card, channel);
                // one trace length per channel pair until multi-buffer mode exists
                let length = check_trace_length(constants::NAME, key, card.sample_length(channel)?)?;
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

        // Take the table first: unknown channels are skipped without looking further
        let Some(table) = tables.route(key, constants::NAME, &mut self.state.skipped) else {
            return Ok(DecodeResult::Skipped(key));
        };

        let header = Header::parse(packet)
            .ok_or_else(|| DecodeError::truncated(constants::NAME, 20, packet.len_bytes()))?;
        let header16 = header.header_length16();
        let min_words = header16 / 2 + constants::FOOTER_LENGTH32;
        require_words32(constants::NAME, packet, min_words)?;
        let footer = Footer::parse(packet)
            .ok_or_else(|| DecodeError::truncated(constants::NAME, min_words * 4, packet.len_bytes()))?;

        let expected = packet
            .len16()
            .saturating_sub(header16 + constants::FOOTER_LENGTH16 + header.ene_wf_length16);
        if header.wf_length16 != expected {
            debug!(
                decoder = constants::NAME,
                len16 = packet.len16(),
                header16,
                ene_wf_length16 = header.ene_wf_length16,
                last_word = %format!("0x{:08x}", footer.last_word),
                "Record geometry"
            );
            self.geometry_problem(DecodeError::waveform_length(
                constants::NAME,
                expected,
                header.wf_length16,
            ))?;
        }
        if footer.last_word != constants::SENTINEL {
            self.geometry_problem(DecodeError::FooterSentinel {
                decoder: constants::NAME,
                expected: constants::SENTINEL,
                found: footer.last_word,
            })?;
        }

        let ranges = self.waveform_ranges(packet, &header, expected)?;
        let n_samples: usize = ranges.iter().map(|(start, stop)| stop - start).sum();

        let out = table.waveform_u16_mut(WAVEFORM)?;
        if n_samples > out.len() {
            let err = DecodeError::waveform_length(constants::NAME, out.len(), n_samples);
            self.geometry_problem(err)?;
        }
        let mut written = 0;
        for (start, stop) in ranges {
            for (dst, sample) in out[written..].iter_mut().zip(packet.u16_range(start, stop)) {
                *dst = sample;
                written += 1;
            }
        }
        out[written..].fill(0);

        debug!(
            decoder = constants::NAME,
            channel = %key,
            event_header_id = header.event_header_id,
            samples = written,
            wrapped = header.buffer_wrap,
            "Decoded record"
        );

        table.set_scalar("packet_id", packet_id as u64)?;
        table.set_scalar("ievt", self.state.ievt as u64)?;
        table.set_scalar("energy", footer.energy as u64)?;
        table.set_scalar("energy_first", footer.energy_first as u64)?;
        table.set_scalar("timestamp", header.timestamp)?;
        table.set_scalar("crate", header.crate_id as u64)?;
        table.set_scalar("card", header.card as u64)?;
        table.set_scalar("channel", header.channel as u64)?;
        table.set_scalar("n_lost_records", header.n_lost_records as u64)?;
        table.set_scalar("flags", footer.flags as u64)?;
        table.push_row();
        self.state.next_event();

        Ok(DecodeResult::Written)
    }

    fn state(&self) -> &DecoderState {
        &self.state
    }
}
