//! Common types for decoder module

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Free-form header dictionary handed through by the acquisition loop
pub type HeaderDict = serde_json::Map<String, serde_json::Value>;

/// Read-only view of one packet as 16-bit and 32-bit words
///
/// Both views alias the same borrowed bytes; words are assembled on demand in
/// native byte order, so nothing is copied up front. Negative indices are not
/// supported; use [`PacketView::u32_from_end`] for footer fields.
#[derive(Debug, Clone, Copy)]
pub struct PacketView<'a> {
    bytes: &'a [u8],
}

impl<'a> PacketView<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    /// Size in bytes
    pub fn len_bytes(&self) -> usize {
        self.bytes.len()
    }

    /// Number of complete 16-bit words
    pub fn len16(&self) -> usize {
        self.bytes.len() / 2
    }

    /// Number of complete 32-bit words
    pub fn len32(&self) -> usize {
        self.bytes.len() / 4
    }

    #[inline]
    pub fn u16(&self, index: usize) -> Option<u16> {
        let offset = index * 2;
        let word = self.bytes.get(offset..offset + 2)?;
        Some(u16::from_ne_bytes([word[0], word[1]]))
    }

    #[inline]
    pub fn i16(&self, index: usize) -> Option<i16> {
        self.u16(index).map(|w| w as i16)
    }

    #[inline]
    pub fn u32(&self, index: usize) -> Option<u32> {
        let offset = index * 4;
        let word = self.bytes.get(offset..offset + 4)?;
        Some(u32::from_ne_bytes([word[0], word[1], word[2], word[3]]))
    }

    /// 32-bit word counted from the end (`1` is the last word)
    #[inline]
    pub fn u32_from_end(&self, back: usize) -> Option<u32> {
        self.len32().checked_sub(back).and_then(|i| self.u32(i))
    }

    /// Iterate the 16-bit words in `[start, stop)`, clipped to the packet
    pub fn u16_range(&self, start: usize, stop: usize) -> impl Iterator<Item = u16> + 'a {
        let view = *self;
        let stop = stop.min(view.len16());
        (start.min(stop)..stop).filter_map(move |i| view.u16(i))
    }

    /// Iterate the 16-bit words in `[start, stop)` as signed samples
    pub fn i16_range(&self, start: usize, stop: usize) -> impl Iterator<Item = i16> + 'a {
        self.u16_range(start, stop).map(|w| w as i16)
    }
}

/// Composite channel identifier derived from (crate, card, channel)
///
/// Layout: `crate << 9 | (card & 0x1F) << 4 | (channel & 0xF)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelKey(u32);

impl ChannelKey {
    const CARD_SHIFT: u32 = 4;
    const CARD_MASK: u32 = 0x1F;
    const CRATE_SHIFT: u32 = 9;
    const CHANNEL_MASK: u32 = 0xF;

    /// Resolve the key for a (crate, card, channel) triple
    pub fn resolve(crate_id: u32, card: u32, channel: u32) -> Self {
        Self(
            (crate_id << Self::CRATE_SHIFT)
                + ((card & Self::CARD_MASK) << Self::CARD_SHIFT)
                + (channel & Self::CHANNEL_MASK),
        )
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn crate_id(self) -> u32 {
        self.0 >> Self::CRATE_SHIFT
    }

    pub fn card(self) -> u32 {
        (self.0 >> Self::CARD_SHIFT) & Self::CARD_MASK
    }

    pub fn channel(self) -> u32 {
        self.0 & Self::CHANNEL_MASK
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (crate {} card {} ch {})",
            self.0,
            self.crate_id(),
            self.card(),
            self.channel()
        )
    }
}

/// How a decoder reacts to a record whose geometry does not add up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeometryCheck {
    /// Abort: a mismatch means the stream is desynchronized
    #[default]
    Strict,
    /// Write what can be recovered, log a warning, carry on
    BestEffort,
}

impl GeometryCheck {
    pub fn is_strict(self) -> bool {
        self == Self::Strict
    }
}

/// Outcome of a successful `decode_packet` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeResult {
    /// One row written and committed
    Written,
    /// No table for this channel; packet counted and dropped
    Skipped(ChannelKey),
}

/// Per-channel count of packets dropped because no table was supplied
#[derive(Debug, Clone, Default)]
pub struct SkipCounter {
    counts: BTreeMap<ChannelKey, u64>,
}

impl SkipCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one skipped packet; returns the new count for that key
    pub fn record(&mut self, key: ChannelKey) -> u64 {
        let count = self.counts.entry(key).or_insert(0);
        *count += 1;
        *count
    }

    pub fn get(&self, key: ChannelKey) -> u64 {
        self.counts.get(&key).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.counts.values().sum()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ChannelKey, u64)> + '_ {
        self.counts.iter().map(|(k, v)| (*k, *v))
    }
}

/// Bookkeeping every decoder carries
#[derive(Debug, Clone, Default)]
pub struct DecoderState {
    /// Event counter, stored in each row's `ievt` then incremented
    pub ievt: u32,
    pub skipped: SkipCounter,
}

impl DecoderState {
    /// Return the current event number and advance the counter
    pub fn next_event(&mut self) -> u32 {
        let ievt = self.ievt;
        self.ievt = self.ievt.wrapping_add(1);
        ievt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn words32(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_ne_bytes()).collect()
    }

    #[test]
    fn test_packet_view_dual_views_alias() {
        let bytes = words32(&[0x1234_5678, 0xDEAD_BEEF]);
        let view = PacketView::new(&bytes);
        assert_eq!(view.len32(), 2);
        assert_eq!(view.len16(), 4);
        assert_eq!(view.u32(0), Some(0x1234_5678));
        let lo = view.u16(0).unwrap() as u32;
        let hi = view.u16(1).unwrap() as u32;
        if cfg!(target_endian = "little") {
            assert_eq!((hi << 16) | lo, 0x1234_5678);
        } else {
            assert_eq!((lo << 16) | hi, 0x1234_5678);
        }
        assert_eq!(view.u32_from_end(1), Some(0xDEAD_BEEF));
        assert_eq!(view.u32(2), None);
        assert_eq!(view.u32_from_end(3), None);
    }

    #[test]
    fn test_packet_view_ranges_clip() {
        let bytes: Vec<u8> = [1u16, 2, 0xFFFF, 4]
            .iter()
            .flat_map(|w| w.to_ne_bytes())
            .collect();
        let view = PacketView::new(&bytes);
        assert_eq!(view.u16_range(1, 10).collect::<Vec<_>>(), vec![2, 0xFFFF, 4]);
        assert_eq!(view.i16_range(2, 3).collect::<Vec<_>>(), vec![-1]);
        assert_eq!(view.u16_range(5, 3).count(), 0);
    }

    #[test]
    fn test_channel_key_layout() {
        let key = ChannelKey::resolve(2, 7, 9);
        assert_eq!(key.raw(), (2 << 9) + (7 << 4) + 9);
        assert_eq!(key.crate_id(), 2);
        assert_eq!(key.card(), 7);
        assert_eq!(key.channel(), 9);
        assert_eq!(key, ChannelKey::resolve(2, 7, 9));
    }

    #[test]
    fn test_channel_key_injective() {
        let mut seen = std::collections::HashSet::new();
        for crate_id in 0..16 {
            for card in 0..32 {
                for channel in 0..16 {
                    assert!(seen.insert(ChannelKey::resolve(crate_id, card, channel)));
                }
            }
        }
        assert_eq!(seen.len(), 16 * 32 * 16);
    }

    #[test]
    fn test_skip_counter() {
        let mut skipped = SkipCounter::new();
        let a = ChannelKey::resolve(0, 1, 2);
        let b = ChannelKey::resolve(0, 1, 3);
        assert!(skipped.is_empty());
        assert_eq!(skipped.record(a), 1);
        assert_eq!(skipped.record(a), 2);
        assert_eq!(skipped.record(b), 1);
        assert_eq!(skipped.get(a), 2);
        assert_eq!(skipped.get(ChannelKey::resolve(3, 3, 3)), 0);
        assert_eq!(skipped.total(), 3);
    }

    #[test]
    fn test_decoder_state_event_counter() {
        let mut state = DecoderState::default();
        assert_eq!(state.next_event(), 0);
        assert_eq!(state.next_event(), 1);
        assert_eq!(state.ievt, 2);
    }

    #[test]
    fn test_geometry_check_deserialize() {
        let check: GeometryCheck = serde_json::from_str("\"best_effort\"").unwrap();
        assert_eq!(check, GeometryCheck::BestEffort);
        assert!(GeometryCheck::default().is_strict());
    }
}
