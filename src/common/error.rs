//! Error types for packet decoding
//!
//! # Design Principles (KISS)
//! - Fatal geometry conditions are errors; the acquisition loop stops on them
//! - A packet for a channel with no table is NOT an error (see `DecodeResult::Skipped`)
//! - Use thiserror for ergonomic error handling

use thiserror::Error;

use crate::decoder::ChannelKey;
use crate::table::TableError;

/// Errors raised while decoding a packet or looking up decoded values
#[derive(Error, Debug)]
pub enum DecodeError {
    /// Packet is too short to hold the fields the layout requires
    #[error("{decoder}: packet too short: need {needed} bytes, got {actual}")]
    Truncated {
        decoder: &'static str,
        needed: usize,
        actual: usize,
    },

    /// Waveform size in the header disagrees with the record geometry
    #[error("{decoder}: waveform size {actual} doesn't match expected size {expected}")]
    WaveformLength {
        decoder: &'static str,
        expected: usize,
        actual: usize,
    },

    /// Trailing word is not the fixed end-of-record marker
    #[error("{decoder}: last word is 0x{found:08x} (should be 0x{expected:08x})")]
    FooterSentinel {
        decoder: &'static str,
        expected: u32,
        found: u32,
    },

    /// Buffer-wrap start index lies outside the waveform record
    #[error("{decoder}: buffer wrap start {start} outside waveform record [{begin}, {end}]")]
    BufferWrap {
        decoder: &'static str,
        start: usize,
        begin: usize,
        end: usize,
    },

    /// `set_object_info` has not produced any schema yet
    #[error("{decoder}: decoded values not built yet")]
    NotBuilt { decoder: &'static str },

    /// No schema was built for the requested channel
    #[error("{decoder}: no decoded values for channel {channel}")]
    NoSchema {
        decoder: &'static str,
        channel: ChannelKey,
    },

    /// Output table rejected a write
    #[error("Table error: {0}")]
    Table(#[from] TableError),
}

impl DecodeError {
    /// Create a truncated-packet error
    pub fn truncated(decoder: &'static str, needed: usize, actual: usize) -> Self {
        Self::Truncated {
            decoder,
            needed,
            actual,
        }
    }

    /// Create a waveform length mismatch error
    pub fn waveform_length(decoder: &'static str, expected: usize, actual: usize) -> Self {
        Self::WaveformLength {
            decoder,
            expected,
            actual,
        }
    }

    /// True for conditions that signal stream desynchronization
    pub fn is_geometry(&self) -> bool {
        matches!(
            self,
            Self::Truncated { .. }
                | Self::WaveformLength { .. }
                | Self::FooterSentinel { .. }
                | Self::BufferWrap { .. }
        )
    }
}
