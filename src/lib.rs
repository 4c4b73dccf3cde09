//! ORCA-DIGITIZERS: packet decoders for ORCA digitizer data
//!
//! Decodes raw ORCA records from Struck SIS3302, Gretina4M (including
//! multisampled waveforms), Struck SIS3316 and AMI286 level sensors into
//! per-channel output tables.

pub mod common;
pub mod config;
pub mod data_source_emulator;
pub mod decoder;
pub mod table;
