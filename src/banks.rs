//! Channel-to-bank layout and relay pattern table
//!
//! Banks and channels are 1-based throughout, matching how they are labelled
//! on the pack. Bank `0` in a relay lookup means "no bank".

use crate::config::{BanksConfig, RelayPatternEntry};
use crate::error::{BmsError, Result};
use std::collections::BTreeMap;
use std::ops::RangeInclusive;

/// Immutable channel-to-bank mapping built from contiguous ranges
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BankLayout {
    ranges: Vec<RangeInclusive<usize>>,
}

impl BankLayout {
    /// Build a layout; ranges must cover `1..=channels` contiguously, in order
    pub fn from_ranges(ranges: &[[usize; 2]], channels: usize) -> Result<Self> {
        if ranges.is_empty() {
            return Err(BmsError::validation("banks.ranges", "At least one bank is required"));
        }
        let mut next = 1;
        for (i, [start, end]) in ranges.iter().copied().enumerate() {
            if start != next || end < start {
                return Err(BmsError::validation(
                    "banks.ranges",
                    format!(
                        "Bank {} range {}-{} is not contiguous (expected start {})",
                        i + 1,
                        start,
                        end,
                        next
                    ),
                ));
            }
            next = end + 1;
        }
        if next != channels + 1 {
            return Err(BmsError::validation(
                "banks.ranges",
                format!("Ranges cover {} channels, expected {}", next - 1, channels),
            ));
        }
        Ok(Self {
            ranges: ranges.iter().map(|[s, e]| *s..=*e).collect(),
        })
    }

    /// Build a layout from configuration
    pub fn from_config(banks: &BanksConfig, channels: u16) -> Result<Self> {
        Self::from_ranges(&banks.ranges, usize::from(channels))
    }

    pub fn bank_count(&self) -> usize {
        self.ranges.len()
    }

    pub fn channel_count(&self) -> usize {
        self.ranges.last().map_or(0, |r| *r.end())
    }

    /// Bank owning a 1-based channel
    pub fn bank_for_channel(&self, channel: usize) -> Option<usize> {
        self.ranges
            .iter()
            .position(|r| r.contains(&channel))
            .map(|i| i + 1)
    }

    /// Channels of a 1-based bank
    pub fn channels(&self, bank: usize) -> RangeInclusive<usize> {
        bank.checked_sub(1)
            .and_then(|i| self.ranges.get(i))
            .cloned()
            .unwrap_or(1..=0)
    }

    /// Per-bank slices of a per-channel vector
    pub fn split<'a, T>(&self, values: &'a [T]) -> Vec<&'a [T]> {
        self.ranges
            .iter()
            .map(|r| {
                let start = (*r.start() - 1).min(values.len());
                let end = (*r.end()).min(values.len());
                &values[start..end]
            })
            .collect()
    }
}

/// Ordered bank pair to relay bitmask
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayTable {
    bank_count: usize,
    patterns: BTreeMap<(usize, usize), u8>,
}

impl RelayTable {
    /// Wiring of the original three-bank relay board
    pub fn three_bank_default() -> Self {
        let entries = [
            ((1, 2), 0b1011),
            ((1, 3), 0b1110),
            ((2, 1), 0b1101),
            ((2, 3), 0b0111),
            ((3, 1), 0b0111),
            ((3, 2), 0b1011),
        ];
        Self {
            bank_count: 3,
            patterns: entries.into_iter().collect(),
        }
    }

    /// Source-select / dest-select wiring: one relay per bank on each side
    ///
    /// Bit `source-1` routes the source bank to the converter input and bit
    /// `count+dest-1` routes the converter output to the destination bank.
    pub fn source_dest_select(bank_count: usize) -> Result<Self> {
        if bank_count == 0 || bank_count * 2 > 8 {
            return Err(BmsError::validation(
                "banks.count",
                format!("Cannot generate relay patterns for {} banks", bank_count),
            ));
        }
        let mut patterns = BTreeMap::new();
        for s in 1..=bank_count {
            for d in 1..=bank_count {
                if s != d {
                    let mask = (1u8 << (s - 1)) | (1u8 << (bank_count + d - 1));
                    patterns.insert((s, d), mask);
                }
            }
        }
        Ok(Self {
            bank_count,
            patterns,
        })
    }

    /// Build a table from explicit entries, rejecting gaps and duplicates
    pub fn from_entries(bank_count: usize, entries: &[RelayPatternEntry]) -> Result<Self> {
        let mut patterns = BTreeMap::new();
        for e in entries {
            if e.source == e.dest || e.source == 0 || e.dest == 0 {
                return Err(BmsError::validation(
                    "banks.relay_patterns",
                    format!("Invalid pair ({}, {})", e.source, e.dest),
                ));
            }
            if e.source > bank_count || e.dest > bank_count {
                return Err(BmsError::validation(
                    "banks.relay_patterns",
                    format!("Pair ({}, {}) exceeds bank count {}", e.source, e.dest, bank_count),
                ));
            }
            if e.mask == 0 {
                return Err(BmsError::validation(
                    "banks.relay_patterns",
                    format!("Pair ({}, {}) has an empty mask", e.source, e.dest),
                ));
            }
            if patterns.insert((e.source, e.dest), e.mask).is_some() {
                return Err(BmsError::validation(
                    "banks.relay_patterns",
                    format!("Duplicate pair ({}, {})", e.source, e.dest),
                ));
            }
        }
        let table = Self {
            bank_count,
            patterns,
        };
        table.check_complete()?;
        Ok(table)
    }

    /// Table for the configured bank count
    pub fn from_config(banks: &BanksConfig) -> Result<Self> {
        match &banks.relay_patterns {
            Some(entries) => Self::from_entries(banks.count, entries),
            None if banks.count == 3 => Ok(Self::three_bank_default()),
            None => Self::source_dest_select(banks.count),
        }
    }

    fn check_complete(&self) -> Result<()> {
        for s in 1..=self.bank_count {
            for d in 1..=self.bank_count {
                if s != d && !self.patterns.contains_key(&(s, d)) {
                    return Err(BmsError::validation(
                        "banks.relay_patterns",
                        format!("Missing pattern for pair ({}, {})", s, d),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Bitmask for an ordered pair; `0` (all open) for self-pairs and unset banks
    pub fn pattern(&self, source: usize, dest: usize) -> u8 {
        if source == dest || source == 0 || dest == 0 {
            return 0;
        }
        self.patterns.get(&(source, dest)).copied().unwrap_or(0)
    }

    pub const fn bank_count(&self) -> usize {
        self.bank_count
    }

    /// All ordered pairs and their masks
    pub fn entries(&self) -> impl Iterator<Item = (usize, usize, u8)> + '_ {
        self.patterns.iter().map(|(&(s, d), &m)| (s, d, m))
    }
}
