//! Emulator data source - generates synthetic ORCA records for testing
//!
//! Produces packets for one hardware model, together with the object info a
//! real run header would carry for the same setup, so that a decoder can be
//! configured and fed without hardware or data files.
//!
//! Pulses are a baseline, a linear rise and an exponential decay with
//! Gaussian noise. Gretina4M traces are presummed in software exactly as the
//! firmware does when multisampling is on.

pub mod records;

pub use records::{presum, Ami286Record, Gretina4mRecord, Sis3302Record, Sis3316Record};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{check_trace_length, CardInfo, ConfigError, ObjectInfo};
use crate::decoder::multisampling::{MultisamplingParams, RAW_LEN, WF_SKIP};
use crate::decoder::{ami286, gretina4m, sis3302, sis3316, ChannelKey, DecoderId};

/// Hardware model to emulate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Model {
    #[default]
    Sis3302,
    Gretina4m,
    Sis3316,
    Ami286,
}

impl Model {
    pub fn decoder_id(self) -> DecoderId {
        match self {
            Model::Sis3302 => sis3302::DECODER_ID,
            Model::Gretina4m => gretina4m::DECODER_ID,
            Model::Sis3316 => sis3316::DECODER_ID,
            Model::Ami286 => ami286::DECODER_ID,
        }
    }

    /// Channels per card
    pub fn max_channels(self) -> u32 {
        match self {
            Model::Sis3302 | Model::Gretina4m => 10,
            Model::Sis3316 => 16,
            Model::Ami286 => 1,
        }
    }
}

/// Pulse shape parameters (in samples and ADC counts)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PulseConfig {
    pub baseline: f64,
    pub amplitude_min: f64,
    pub amplitude_max: f64,
    /// Linear rise length in samples
    pub rise_samples: usize,
    /// Exponential decay constant in samples
    pub decay_tau: f64,
    /// Gaussian noise sigma; 0 disables noise
    pub noise_sigma: f64,
    /// Trigger position as a fraction of the trace
    pub trigger_fraction: f64,
}

impl Default for PulseConfig {
    fn default() -> Self {
        Self {
            baseline: 1000.0,
            amplitude_min: 500.0,
            amplitude_max: 8000.0,
            rise_samples: 20,
            decay_tau: 5000.0,
            noise_sigma: 3.0,
            trigger_fraction: 0.4,
        }
    }
}

/// Emulator configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EmulatorConfig {
    pub model: Model,
    pub crate_id: u32,
    pub card: u32,
    /// The first `n_channels` channels of the card are enabled
    pub n_channels: u32,
    /// RNG seed; equal seeds give identical packet streams
    pub seed: u64,
    /// SIS3302/SIS3316 trace length in samples
    pub trace_length: usize,
    /// Gretina4M presummed sample count (0 = multisampling off)
    pub ft_len: usize,
    /// Gretina4M presum rate index (`Mrpsrt`)
    pub presum_index: usize,
    /// Gretina4M divider index (`Mrpsdv`)
    pub divider_index: usize,
    /// Gretina4M: largest shift of the real splice past the nominal one
    pub splice_jitter: usize,
    /// SIS3302: fraction of records with a wrapped buffer
    pub wrap_probability: f64,
    /// Mean clock ticks between events
    pub mean_interval_ticks: f64,
    pub pulse: PulseConfig,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            model: Model::Sis3302,
            crate_id: 0,
            card: 1,
            n_channels: 4,
            seed: 0,
            trace_length: 1024,
            ft_len: 0,
            presum_index: 1,
            divider_index: 1,
            splice_jitter: 0,
            wrap_probability: 0.0,
            mean_interval_ticks: 1000.0,
            pulse: PulseConfig::default(),
        }
    }
}

/// Emulator errors
#[derive(Error, Debug)]
pub enum EmulatorError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("{model:?} has {max} channels per card, {requested} requested")]
    TooManyChannels {
        model: Model,
        max: u32,
        requested: u32,
    },

    #[error("SIS3302 trace length must be even, got {0}")]
    OddTraceLength(usize),

    #[error("Invalid pulse parameters: {0}")]
    Pulse(String),
}

/// Random pulse source
#[derive(Debug, Clone)]
pub struct PulseGenerator {
    config: PulseConfig,
    noise: Option<Normal<f64>>,
}

impl PulseGenerator {
    pub fn new(config: PulseConfig) -> Result<Self, EmulatorError> {
        if config.amplitude_min > config.amplitude_max {
            return Err(EmulatorError::Pulse(format!(
                "amplitude range [{}, {}] is empty",
                config.amplitude_min, config.amplitude_max
            )));
        }
        if !(0.0..=1.0).contains(&config.trigger_fraction) {
            return Err(EmulatorError::Pulse(format!(
                "trigger fraction {} outside [0, 1]",
                config.trigger_fraction
            )));
        }
        let noise = if config.noise_sigma > 0.0 {
            Some(Normal::new(0.0, config.noise_sigma).map_err(|e| EmulatorError::Pulse(e.to_string()))?)
        } else {
            None
        };
        Ok(Self { config, noise })
    }

    /// Draw an amplitude from the configured range
    pub fn amplitude<R: Rng>(&self, rng: &mut R) -> f64 {
        if self.config.amplitude_min == self.config.amplitude_max {
            self.config.amplitude_min
        } else {
            rng.gen_range(self.config.amplitude_min..self.config.amplitude_max)
        }
    }

    /// Noisy pulse of `len` samples
    pub fn pulse<R: Rng>(&self, rng: &mut R, len: usize, amplitude: f64) -> Vec<f64> {
        let start = (len as f64 * self.config.trigger_fraction) as usize;
        let rise = self.config.rise_samples.max(1);
        (0..len)
            .map(|i| {
                let signal = if i < start {
                    0.0
                } else if i < start + rise {
                    amplitude * (i - start) as f64 / rise as f64
                } else {
                    let t = (i - start - rise) as f64;
                    amplitude * (-t / self.config.decay_tau).exp()
                };
                let noise = self.noise.map(|n| n.sample(rng)).unwrap_or(0.0);
                self.config.baseline + signal + noise
            })
            .collect()
    }
}

fn to_u16(samples: &[f64]) -> Vec<u16> {
    samples
        .iter()
        .map(|&s| s.round().clamp(0.0, u16::MAX as f64) as u16)
        .collect()
}

fn to_i16(samples: &[f64]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| s.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16)
        .collect()
}

/// Infinite stream of encoded packets for one card
pub struct Emulator {
    config: EmulatorConfig,
    generator: PulseGenerator,
    multisampling: Option<MultisamplingParams>,
    rng: StdRng,
    timestamp: u64,
    n_generated: u64,
    last_splice: Option<usize>,
}

impl Emulator {
    pub fn new(config: EmulatorConfig) -> Result<Self, EmulatorError> {
        let max = config.model.max_channels();
        if config.n_channels == 0 || config.n_channels > max {
            return Err(EmulatorError::TooManyChannels {
                model: config.model,
                max,
                requested: config.n_channels,
            });
        }
        let key = ChannelKey::resolve(config.crate_id, config.card, 0);
        if matches!(config.model, Model::Sis3302 | Model::Sis3316) {
            check_trace_length(config.model.decoder_id().decoder_name, key, config.trace_length as i64)?;
        }
        // SIS3302 records carry the trace in 32-bit words
        if config.model == Model::Sis3302 && config.trace_length % 2 == 1 {
            return Err(EmulatorError::OddTraceLength(config.trace_length));
        }
        let multisampling = if config.model == Model::Gretina4m && config.ft_len > 0 {
            Some(MultisamplingParams::from_registers(
                key,
                config.ft_len,
                config.presum_index,
                config.divider_index,
            )?)
        } else {
            None
        };
        let generator = PulseGenerator::new(config.pulse.clone())?;

        info!(
            model = ?config.model,
            crate_id = config.crate_id,
            card = config.card,
            channels = config.n_channels,
            seed = config.seed,
            "Emulator configured"
        );

        Ok(Self {
            rng: StdRng::seed_from_u64(config.seed),
            config,
            generator,
            multisampling,
            timestamp: 0,
            n_generated: 0,
            last_splice: None,
        })
    }

    pub fn config(&self) -> &EmulatorConfig {
        &self.config
    }

    pub fn n_generated(&self) -> u64 {
        self.n_generated
    }

    /// Raw index where presumming started in the last multisampled Gretina4M packet
    pub fn last_splice(&self) -> Option<usize> {
        self.last_splice
    }

    /// Object info describing the emulated card, as a run header would
    pub fn object_info(&self) -> ObjectInfo {
        let c = &self.config;
        let n = c.model.max_channels() as usize;
        let enabled: Vec<bool> = (0..n).map(|ch| (ch as u32) < c.n_channels).collect();
        let card = match c.model {
            Model::Sis3302 => CardInfo {
                internal_trigger_enabled_mask: Some((1u32 << c.n_channels) - 1),
                external_trigger_enabled_mask: Some(0),
                sample_lengths: Some(vec![c.trace_length as i64; n / 2]),
                ..CardInfo::new(c.crate_id, c.card)
            },
            Model::Gretina4m => CardInfo {
                enabled: Some(enabled),
                ft_cnt: Some(vec![c.ft_len as i64; n]),
                mrpsrt: Some(vec![c.presum_index; n]),
                mrpsdv: Some(vec![c.divider_index; n]),
                ..CardInfo::new(c.crate_id, c.card)
            },
            Model::Sis3316 => CardInfo {
                raw_data_buffer_len: Some(c.trace_length as i64),
                ..CardInfo::new(c.crate_id, c.card)
            },
            Model::Ami286 => CardInfo::new(c.crate_id, c.card),
        };
        ObjectInfo::new(vec![card])
    }

    /// Keys of the channels this emulator writes to
    pub fn channel_keys(&self) -> Vec<ChannelKey> {
        (0..self.config.n_channels)
            .map(|ch| ChannelKey::resolve(self.config.crate_id, self.config.card, ch))
            .collect()
    }

    /// Generate the next encoded packet
    pub fn next_packet(&mut self) -> Vec<u8> {
        let c = &self.config;
        let channel = self.rng.gen_range(0..c.n_channels);
        let step = self.rng.gen_range(0.0..2.0 * c.mean_interval_ticks.max(1.0));
        self.timestamp = self.timestamp.wrapping_add(step as u64 + 1) & 0xFFFF_FFFF_FFFF;
        let amplitude = self.generator.amplitude(&mut self.rng);

        let packet = match c.model {
            Model::Sis3302 => {
                let pulse = self.generator.pulse(&mut self.rng, c.trace_length, amplitude);
                let waveform = to_u16(&pulse);
                let wrap_offset = if self.rng.gen_bool(c.wrap_probability.clamp(0.0, 1.0)) {
                    Some(self.rng.gen_range(0..waveform.len()) as u32)
                } else {
                    None
                };
                Sis3302Record {
                    timestamp: self.timestamp,
                    energy: amplitude as u32,
                    energy_first: (amplitude * 0.98) as u32,
                    wrap_offset,
                    ..Sis3302Record::new(c.crate_id, c.card, channel, waveform)
                }
                .encode()
            }
            Model::Gretina4m => {
                let raw = match self.multisampling {
                    Some(params) => {
                        let jitter = self.rng.gen_range(0..=c.splice_jitter.min(WF_SKIP));
                        let splice = params.nominal_splice() + jitter;
                        self.last_splice = Some(splice);
                        let len = splice + (RAW_LEN - splice) * params.ps;
                        let full = to_i16(&self.generator.pulse(&mut self.rng, len, amplitude));
                        presum(&full, &params, splice)
                    }
                    None => to_i16(&self.generator.pulse(&mut self.rng, RAW_LEN, amplitude)),
                };
                Gretina4mRecord {
                    board_id: c.card as u16,
                    energy: amplitude as u32,
                    timestamp: self.timestamp,
                    ..Gretina4mRecord::new(c.crate_id, c.card, channel, raw)
                }
                .encode()
            }
            Model::Sis3316 => {
                let pulse = self.generator.pulse(&mut self.rng, c.trace_length, amplitude);
                Sis3316Record {
                    timestamp: self.timestamp,
                    ..Sis3316Record::new(c.crate_id, c.card, channel, to_u16(&pulse))
                }
                .encode()
            }
            Model::Ami286 => Ami286Record {
                level: amplitude as u32,
                timestamp: (self.timestamp & 0xFFFF_FFFF) as u32,
                ..Ami286Record::new(c.crate_id, c.card)
            }
            .encode(),
        };

        self.n_generated += 1;
        debug!(
            packet = self.n_generated,
            channel,
            bytes = packet.len(),
            "Generated packet"
        );
        packet
    }
}

impl Iterator for Emulator {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.next_packet())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = EmulatorConfig::default();
        assert_eq!(config.model, Model::Sis3302);
        assert_eq!(config.n_channels, 4);
        assert_eq!(config.trace_length, 1024);
        assert_eq!(config.ft_len, 0);
        assert_eq!(config.wrap_probability, 0.0);
    }

    #[test]
    fn test_config_from_toml() {
        let config: EmulatorConfig = toml::from_str(
            r#"
model = "gretina4m"
n_channels = 2
ft_len = 200

[pulse]
noise_sigma = 0.0
"#,
        )
        .unwrap();
        assert_eq!(config.model, Model::Gretina4m);
        assert_eq!(config.ft_len, 200);
        assert_eq!(config.pulse.noise_sigma, 0.0);
        assert_eq!(config.pulse.baseline, 1000.0);
    }

    #[test]
    fn test_too_many_channels() {
        let config = EmulatorConfig {
            model: Model::Ami286,
            n_channels: 2,
            ..Default::default()
        };
        assert!(matches!(
            Emulator::new(config),
            Err(EmulatorError::TooManyChannels { max: 1, .. })
        ));
    }

    #[test]
    fn test_invalid_trace_length() {
        let config = EmulatorConfig {
            trace_length: 0,
            ..Default::default()
        };
        assert!(matches!(Emulator::new(config), Err(EmulatorError::Config(_))));
    }

    #[test]
    fn test_invalid_pulse() {
        let pulse = PulseConfig {
            amplitude_min: 10.0,
            amplitude_max: 5.0,
            ..Default::default()
        };
        assert!(PulseGenerator::new(pulse).is_err());
    }

    #[test]
    fn test_pulse_shape_without_noise() {
        let generator = PulseGenerator::new(PulseConfig {
            baseline: 100.0,
            rise_samples: 10,
            decay_tau: 1e9,
            noise_sigma: 0.0,
            trigger_fraction: 0.5,
            ..Default::default()
        })
        .unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let pulse = generator.pulse(&mut rng, 100, 50.0);
        assert_eq!(pulse[0], 100.0);
        assert_eq!(pulse[49], 100.0);
        assert_eq!(pulse[55], 125.0);
        assert!((pulse[99] - 150.0).abs() < 1e-3);
    }

    #[test]
    fn test_same_seed_same_stream() {
        let config = EmulatorConfig {
            seed: 42,
            wrap_probability: 0.5,
            ..Default::default()
        };
        let a: Vec<Vec<u8>> = Emulator::new(config.clone()).unwrap().take(5).collect();
        let b: Vec<Vec<u8>> = Emulator::new(config).unwrap().take(5).collect();
        assert_eq!(a, b);
    }

    #[test]
    fn test_last_splice_tracks_jitter() {
        let mut emulator = Emulator::new(EmulatorConfig {
            model: Model::Gretina4m,
            ft_len: 200,
            splice_jitter: 4,
            seed: 3,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(emulator.last_splice(), None);
        let nominal = RAW_LEN - 200 - 2;
        for _ in 0..20 {
            emulator.next_packet();
            let splice = emulator.last_splice().unwrap();
            assert!((nominal..=nominal + 4).contains(&splice));
        }
    }

    #[test]
    fn test_object_info_matches_model() {
        let emulator = Emulator::new(EmulatorConfig {
            n_channels: 3,
            ..Default::default()
        })
        .unwrap();
        let info = emulator.object_info();
        assert_eq!(info.cards[0].trigger_enabled_mask().unwrap(), 0b111);
        assert_eq!(emulator.channel_keys().len(), 3);
    }
}
