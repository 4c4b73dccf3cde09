//! Packet builders: the inverse of the decoders' bit layouts
//!
//! Every builder writes native-endian words, matching what ORCA hands to the
//! decoders once the record length word has been stripped.

use crate::decoder::multisampling::{MultisamplingParams, RAW_LEN};

fn push_u32(bytes: &mut Vec<u8>, word: u32) {
    bytes.extend_from_slice(&word.to_ne_bytes());
}

fn push_u16(bytes: &mut Vec<u8>, word: u16) {
    bytes.extend_from_slice(&word.to_ne_bytes());
}

/// Struck location word: crate, card and channel bits
fn location_word(crate_id: u32, card: u32, channel: u32) -> u32 {
    ((crate_id & 0xF) << 21) | ((card & 0x1F) << 16) | ((channel & 0xFF) << 8)
}

/// One SIS3302 energy record
#[derive(Debug, Clone, PartialEq)]
pub struct Sis3302Record {
    pub crate_id: u32,
    pub card: u32,
    pub channel: u32,
    /// 14-bit lost-record count; the low field shares bit 8 with the channel
    pub n_lost_records: u32,
    pub event_header_id: u32,
    /// 48-bit timestamp
    pub timestamp: u64,
    pub energy: u32,
    pub energy_first: u32,
    pub flags: u32,
    /// Time-ordered samples; padded to an even count when encoded
    pub waveform: Vec<u16>,
    pub energy_waveform: Vec<u32>,
    /// Wrap offset stored in the extra header word; `None` for an unwrapped buffer
    pub wrap_offset: Option<u32>,
}

impl Sis3302Record {
    pub fn new(crate_id: u32, card: u32, channel: u32, waveform: Vec<u16>) -> Self {
        Self {
            crate_id,
            card,
            channel,
            n_lost_records: 0,
            event_header_id: 0,
            timestamp: 0,
            energy: 0,
            energy_first: 0,
            flags: 0,
            waveform,
            energy_waveform: Vec::new(),
            wrap_offset: None,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut samples = self.waveform.clone();
        if samples.len() % 2 == 1 {
            samples.push(0);
        }
        if let Some(offset) = self.wrap_offset {
            // the card keeps writing from offset + 1 and wraps to the start
            let split = (offset as usize + 1).min(samples.len());
            samples.rotate_right(split);
        }

        let lost_msb = (self.n_lost_records >> 7) & 0x7F;
        let lost_lsb = self.n_lost_records & 0x7F;
        let word0 = (lost_msb << 25)
            | location_word(self.crate_id, self.card, self.channel)
            | (lost_lsb << 2)
            | self.wrap_offset.is_some() as u32;

        let mut bytes = Vec::with_capacity(4 * (11 + self.energy_waveform.len()) + 2 * samples.len());
        push_u32(&mut bytes, word0);
        push_u32(&mut bytes, (samples.len() / 2) as u32);
        push_u32(&mut bytes, self.energy_waveform.len() as u32);
        push_u32(
            &mut bytes,
            ((((self.timestamp >> 32) & 0xFFFF) as u32) << 16) | (self.event_header_id & 0xFF),
        );
        push_u32(&mut bytes, self.timestamp as u32);
        if let Some(offset) = self.wrap_offset {
            push_u32(&mut bytes, 0);
            push_u32(&mut bytes, offset);
        }
        for &sample in &samples {
            push_u16(&mut bytes, sample);
        }
        for &word in &self.energy_waveform {
            push_u32(&mut bytes, word);
        }
        push_u32(&mut bytes, self.energy);
        push_u32(&mut bytes, self.energy_first);
        push_u32(&mut bytes, self.flags);
        push_u32(&mut bytes, 0xDEAD_BEEF);
        bytes
    }
}

/// One Gretina4M waveform record
#[derive(Debug, Clone, PartialEq)]
pub struct Gretina4mRecord {
    pub crate_id: u32,
    pub card: u32,
    pub channel: u32,
    /// 12-bit board id
    pub board_id: u16,
    /// 25-bit energy
    pub energy: u32,
    /// 48-bit timestamp
    pub timestamp: u64,
    /// Raw samples as the card delivers them (presummed tail included);
    /// padded or cut to 2018 when encoded
    pub waveform: Vec<i16>,
}

impl Gretina4mRecord {
    pub fn new(crate_id: u32, card: u32, channel: u32, waveform: Vec<i16>) -> Self {
        Self {
            crate_id,
            card,
            channel,
            board_id: 0,
            energy: 0,
            timestamp: 0,
            waveform,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut header = [0u16; 18];
        header[1] = (((self.crate_id & 0xF) << 5) | (self.card & 0x1F)) as u16;
        header[4] = ((self.board_id & 0xFFF) << 4) | (self.channel & 0xF) as u16;
        header[6] = self.timestamp as u16;
        header[7] = (self.timestamp >> 16) as u16;
        header[8] = (self.timestamp >> 32) as u16;
        header[9] = self.energy as u16;
        header[10] = ((self.energy >> 16) & 0x1FF) as u16;

        let mut bytes = Vec::with_capacity(2 * (header.len() + RAW_LEN));
        for word in header {
            push_u16(&mut bytes, word);
        }
        for i in 0..RAW_LEN {
            push_u16(&mut bytes, self.waveform.get(i).copied().unwrap_or(0) as u16);
        }
        bytes
    }
}

/// One SIS3316 waveform record
#[derive(Debug, Clone, PartialEq)]
pub struct Sis3316Record {
    pub crate_id: u32,
    pub card: u32,
    pub channel: u32,
    /// 48-bit timestamp
    pub timestamp: u64,
    pub waveform: Vec<u16>,
}

impl Sis3316Record {
    pub fn new(crate_id: u32, card: u32, channel: u32, waveform: Vec<u16>) -> Self {
        Self {
            crate_id,
            card,
            channel,
            timestamp: 0,
            waveform,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut header = [0u32; 26];
        header[0] = location_word(self.crate_id, self.card, self.channel);
        header[3] = self.crate_id;
        header[4] = self.card;
        header[9] = ((((self.timestamp >> 32) & 0xFFFF) as u32) << 16) | ((self.channel & 0xFFF) << 4);
        header[10] = self.timestamp as u32;

        let mut bytes = Vec::with_capacity(4 * header.len() + 2 * self.waveform.len());
        for word in header {
            push_u32(&mut bytes, word);
        }
        for &sample in &self.waveform {
            push_u16(&mut bytes, sample);
        }
        bytes
    }
}

/// One AMI286 level reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ami286Record {
    pub crate_id: u32,
    pub card: u32,
    pub level: u32,
    pub timestamp: u32,
}

impl Ami286Record {
    pub fn new(crate_id: u32, card: u32) -> Self {
        Self {
            crate_id,
            card,
            level: 0,
            timestamp: 0,
        }
    }

    pub fn geoaddress(&self) -> u32 {
        location_word(self.crate_id, self.card, 0)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(12);
        push_u32(&mut bytes, self.geoaddress());
        push_u32(&mut bytes, self.level);
        push_u32(&mut bytes, self.timestamp);
        bytes
    }
}

/// Presum a full-rate trace the way the Gretina4M firmware does
///
/// Samples before `splice` are copied; from `splice` on, every `ps`
/// consecutive full-rate samples become one coarse sample `sum / div`.
/// The result always holds 2018 samples; a short `full` trace is extended
/// with its last value.
pub fn presum(full: &[i16], params: &MultisamplingParams, splice: usize) -> Vec<i16> {
    let sample = |i: usize| full.get(i).or(full.last()).copied().unwrap_or(0) as i64;
    let mut raw: Vec<i16> = (0..splice.min(RAW_LEN)).map(|i| sample(i) as i16).collect();
    for j in 0..RAW_LEN.saturating_sub(splice) {
        let start = splice + j * params.ps;
        let sum: i64 = (start..start + params.ps).map(sample).sum();
        let coarse = sum.div_euclid(params.div as i64);
        raw.push(coarse.clamp(i16::MIN as i64, i16::MAX as i64) as i16);
    }
    raw
}
