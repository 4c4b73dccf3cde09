//! Multisampled waveform reconstruction for Gretina4M
//!
//! In multisampling mode the card records the leading part of the trace at
//! full rate and the trailing `ft_len` samples presummed: each coarse sample
//! is the sum of `ps` consecutive full-rate samples divided by `div`.
//!
//! ```text
//!  raw:  [ junk (16) | full-rate ............ | coarse coarse coarse ... ]
//!                                             ^ splice (ift)
//!  out:  [ full-rate ......................... | p0 p1 p2 p3 | p0 p1 ... ]
//!                                             ^ ift - 16
//! ```
//!
//! Every coarse sample is expanded back into `ps` full-rate samples (one per
//! phase) using the slope into its window, then rounded so that the integers
//! of one window add up to exactly `div` times the coarse sample.

use crate::config::ConfigError;

use super::ChannelKey;

/// Raw samples per Gretina4M record, multisampled or not
pub const RAW_LEN: usize = 2018;

/// Leading samples that are always discarded
pub const WF_SKIP: usize = 16;

/// Presum rates selected by `Mrpsrt`
pub const PRESUM_RATES: [usize; 4] = [2, 4, 8, 10];

/// Dividers selected by `Mrpsdv`
pub const DIVIDERS: [usize; 4] = [1, 2, 4, 8];

/// Growable f64 work area; grows on demand and never shrinks
#[derive(Debug, Clone, Default)]
pub struct ScratchBuffer {
    buf: Vec<f64>,
}

impl ScratchBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(n: usize) -> Self {
        Self { buf: vec![0.0; n] }
    }

    /// Make sure at least `n` elements are available
    pub fn ensure_capacity(&mut self, n: usize) {
        if self.buf.len() < n {
            self.buf.resize(n, 0.0);
        }
    }

    /// First `n` elements as a mutable slice, growing first if needed
    pub fn view(&mut self, n: usize) -> &mut [f64] {
        self.ensure_capacity(n);
        &mut self.buf[..n]
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }
}

/// Per-channel multisampling parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MultisamplingParams {
    /// Number of presummed samples at the end of the trace
    pub ft_len: usize,
    /// Full-rate samples per coarse sample
    pub ps: usize,
    /// Divider applied by the card after summing
    pub div: usize,
}

impl MultisamplingParams {
    /// Build parameters from the ORCA register indices
    ///
    /// Rejects setups whose nominal splice point would leave fewer than
    /// `WF_SKIP + ps` full-rate samples, or whose output length is not in
    /// `(0, 65536]`.
    pub fn from_registers(
        channel: ChannelKey,
        ft_len: usize,
        presum_index: usize,
        divider_index: usize,
    ) -> Result<Self, ConfigError> {
        let ps = *PRESUM_RATES
            .get(presum_index)
            .ok_or(ConfigError::InvalidIndex {
                field: "Mrpsrt",
                index: presum_index,
                len: PRESUM_RATES.len(),
            })?;
        let div = *DIVIDERS.get(divider_index).ok_or(ConfigError::InvalidIndex {
            field: "Mrpsdv",
            index: divider_index,
            len: DIVIDERS.len(),
        })?;
        let params = Self { ft_len, ps, div };

        if ft_len == 0 || ft_len + 2 + WF_SKIP + ps > RAW_LEN {
            return Err(ConfigError::InvalidMultisampling {
                channel,
                reason: format!(
                    "FtCnt {} leaves no room for {} full-rate samples",
                    ft_len,
                    WF_SKIP + ps
                ),
            });
        }
        let length = params.output_len_signed();
        if length <= 0 || length > 1 << 16 {
            return Err(ConfigError::InvalidMultisampling {
                channel,
                reason: format!("reconstructed length {} outside (0, 65536]", length),
            });
        }
        Ok(params)
    }

    /// `div / ps`: converts a coarse sample to the mean of its window
    pub fn ratio(&self) -> f64 {
        self.div as f64 / self.ps as f64
    }

    /// Splice index the firmware nominally uses
    pub fn nominal_splice(&self) -> usize {
        RAW_LEN - self.ft_len - 2
    }

    fn output_len_signed(&self) -> i64 {
        // the last 3 coarse samples are dropped: 2 are bad, 1 is kept for slopes
        let ft_len = self.ft_len as i64;
        (RAW_LEN as i64) - ft_len - (WF_SKIP as i64) + (self.ps as i64 - 1) * (ft_len - 3)
    }

    /// Length of the reconstructed waveform
    pub fn output_len(&self) -> usize {
        self.output_len_signed().max(0) as usize
    }
}

/// Where the reconstruction spliced the trace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Splice {
    /// Index of the first coarse sample in the raw trace
    pub raw: usize,
    /// Index of the first expanded sample in the output
    pub out: usize,
    /// Windows whose `ps` phases were all written
    pub complete_windows: usize,
}

/// Locate the first coarse sample
///
/// Firmware does not always start presumming exactly at the nominal index,
/// so the `WF_SKIP + 1` candidates from the nominal index onward are tried
/// and the one where `coarse * ratio` best matches the preceding full-rate
/// sample wins. Ties keep the earliest candidate.
pub fn find_splice(raw: &[i16], params: &MultisamplingParams) -> usize {
    let ratio = params.ratio();
    let nominal = params.nominal_splice();
    let mut min_diff = f64::INFINITY;
    let mut best = nominal;
    for ift in (nominal..=nominal + WF_SKIP).take_while(|&i| i < raw.len()) {
        let diff = (raw[ift] as f64 * ratio - raw[ift - 1] as f64).abs();
        if diff < min_diff {
            min_diff = diff;
            best = ift;
        }
    }
    best
}

/// Reusable reconstruction engine; owns the slope and remainder scratch
#[derive(Debug, Clone, Default)]
pub struct Reconstructor {
    rises: ScratchBuffer,
    remainders: ScratchBuffer,
}

impl Reconstructor {
    pub fn new() -> Self {
        Self {
            rises: ScratchBuffer::with_capacity(RAW_LEN - 1),
            remainders: ScratchBuffer::new(),
        }
    }

    /// Pre-size the remainder scratch for the longest configured output
    pub fn reserve(&mut self, output_len: usize) {
        self.remainders.ensure_capacity(output_len);
    }

    pub fn scratch_capacity(&self) -> (usize, usize) {
        (self.rises.capacity(), self.remainders.capacity())
    }

    /// Expand `raw` into `out`
    ///
    /// `raw` must hold the full record (at least `nominal_splice + 1`
    /// samples); `out` is the row's waveform storage. Output samples past the
    /// last coarse sample that can be expanded are zeroed.
    pub fn reconstruct(
        &mut self,
        raw: &[i16],
        params: &MultisamplingParams,
        out: &mut [i16],
    ) -> Splice {
        let ps = params.ps;
        let ratio = params.ratio();
        let ift = find_splice(raw, params);
        let ift_out = ift - WF_SKIP;

        // full-rate prefix
        let n_prefix = ift_out.min(out.len());
        out[..n_prefix].copy_from_slice(&raw[WF_SKIP..WF_SKIP + n_prefix]);
        if ift_out >= out.len() {
            return Splice {
                raw: ift,
                out: ift_out,
                complete_windows: 0,
            };
        }

        // rises[i] is the slope following raw[i]; the one into the splice is
        // taken against the presum of the last full-rate window
        let n_rises = raw.len() - 1;
        let rises = self.rises.view(n_rises);
        for (rise, pair) in rises.iter_mut().zip(raw.windows(2)) {
            *rise = pair[1] as f64 - pair[0] as f64;
        }
        let last_window: f64 = raw[ift - ps..ift].iter().map(|&s| s as f64).sum();
        rises[ift - 1] = raw[ift] as f64 - last_window / params.div as f64;

        // floating-point estimate of every expanded sample, phase by phase
        let rem_len = out.len() - ift_out;
        let coarse_available = raw.len() - ift;
        let remainders = self.remainders.view(rem_len);
        for ips in 0..ps {
            let slope_fraction = (2 * ips + 1) as f64 / (2 * ps) as f64 - 0.5;
            for (j, k) in (ips..rem_len).step_by(ps).enumerate() {
                if j >= coarse_available {
                    break;
                }
                remainders[k] = (raw[ift + j] as f64 + slope_fraction * rises[ift - 1 + j]) * ratio;
            }
        }

        // round window by window, carrying each phase's rounding error into
        // the next phase of the same window; the last phase keeps its own
        let tail = &mut out[ift_out..];
        tail.fill(0);
        let n_windows = rem_len.div_ceil(ps).min(coarse_available);
        let mut complete_windows = 0;
        for j in 0..n_windows {
            let start = j * ps;
            let stop = (start + ps).min(rem_len);
            let mut carry = 0.0;
            for k in start..stop {
                let estimate = remainders[k] + carry;
                let rounded = estimate.round_ties_even();
                tail[k] = rounded as i16;
                carry = estimate - rounded;
            }
            if stop - start == ps {
                complete_windows += 1;
            }
        }

        Splice {
            raw: ift,
            out: ift_out,
            complete_windows,
        }
    }
}
