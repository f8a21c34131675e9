//! Coverage bitmaps built from collected runs.
//!
//! A [`CoverageBitmap`] holds 8-bit saturating hit counts, AFL-style.
//! Counters-mode results map one-to-one (slot = edge index); trace-mode
//! results are folded into a fixed-size map by hashing consecutive PC
//! pairs, so the ordered trace becomes edge coverage too.
//!
//! [`CoverageAccumulator`] keeps the union over many runs and says which
//! runs found something new.

use crate::reader::{CounterBuffer, TraceBuffer};
use crate::verified::{afl_edge, saturating_hit};
use log::info;
use serde::{Deserialize, Serialize};

/// Default bitmap size for trace-derived coverage (64 KB, same as AFL).
pub const MAP_SIZE: usize = 65536;

/// Hit counts per coverage slot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CoverageBitmap {
    map: Vec<u8>,
}

impl CoverageBitmap {
    /// An empty bitmap with `len` slots.
    pub fn new(len: usize) -> Self {
        Self { map: vec![0; len] }
    }

    /// Snapshot a counters buffer: slot `i` is the hit count of edge `i`.
    pub fn from_counters(counters: &CounterBuffer<'_>) -> Self {
        Self {
            map: counters.counter_hits().map(|(_, hits)| hits).collect(),
        }
    }

    /// Fold a trace into a `map_size` bitmap of PC transitions.
    pub fn from_trace(trace: &TraceBuffer<'_>, map_size: usize) -> Self {
        let mut bitmap = Self::new(map_size);
        if map_size == 0 {
            return bitmap;
        }
        let mut prev = 0u64;
        for pc in trace.entries() {
            let (index, next) = afl_edge(prev, pc, map_size);
            bitmap.record_hit(index);
            prev = next;
        }
        bitmap
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Reset all counts to zero.
    pub fn clear(&mut self) {
        self.map.fill(0);
    }

    /// Count one hit at `index`.  Out-of-range indices are ignored.
    pub fn record_hit(&mut self, index: usize) {
        if let Some(count) = self.map.get_mut(index) {
            *count = saturating_hit(*count);
        }
    }

    /// Union with `other`, keeping the larger count per slot.
    pub fn merge(&mut self, other: &CoverageBitmap) {
        debug_assert_eq!(self.len(), other.len());
        for (mine, &theirs) in self.map.iter_mut().zip(&other.map) {
            *mine = (*mine).max(theirs);
        }
    }

    /// Number of slots hit at least once.
    pub fn count_bits(&self) -> usize {
        self.map.iter().filter(|&&c| c > 0).count()
    }

    /// Number of slots hit here but never in `global`.
    pub fn has_new_coverage(&self, global: &CoverageBitmap) -> usize {
        self.map
            .iter()
            .zip(&global.map)
            .filter(|(&mine, &theirs)| mine > 0 && theirs == 0)
            .count()
    }

    /// Bucket hit counts: 1, 2, 3, 4-7, 8-15, 16-31, 32-127, 128+.
    pub fn classify(&mut self) {
        for count in &mut self.map {
            *count = match *count {
                0..=3 => *count,
                4..=7 => 4,
                8..=15 => 8,
                16..=31 => 16,
                32..=127 => 32,
                _ => 128,
            };
        }
    }

    pub fn stats(&self) -> CoverageStats {
        CoverageStats {
            edges_hit: self.count_bits(),
            total_hits: self.map.iter().map(|&c| u64::from(c)).sum(),
            max_hits: self.map.iter().copied().max().unwrap_or(0),
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.map
    }
}

/// Summary of one bitmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageStats {
    pub edges_hit: usize,
    /// Sum of (saturated) counts.
    pub total_hits: u64,
    pub max_hits: u8,
}

/// Union of coverage over many runs.
#[derive(Debug, Clone)]
pub struct CoverageAccumulator {
    global: CoverageBitmap,
    total_runs: u64,
}

impl CoverageAccumulator {
    /// Accumulate into bitmaps of `len` slots.
    pub fn new(len: usize) -> Self {
        Self {
            global: CoverageBitmap::new(len),
            total_runs: 0,
        }
    }

    /// Whether `bitmap` hits anything not seen before.
    pub fn is_interesting(&self, bitmap: &CoverageBitmap) -> bool {
        bitmap.has_new_coverage(&self.global) > 0
    }

    /// Merge one run.  Returns the number of newly covered slots.
    pub fn absorb(&mut self, bitmap: &CoverageBitmap) -> usize {
        let before = self.global.count_bits();
        self.global.merge(bitmap);
        self.total_runs += 1;
        let after = self.global.count_bits();
        let new_edges = after.saturating_sub(before);
        if new_edges > 0 {
            info!("New coverage: {new_edges} edges (total: {after})");
        }
        new_edges
    }

    pub fn total_runs(&self) -> u64 {
        self.total_runs
    }

    pub fn global(&self) -> &CoverageBitmap {
        &self.global
    }
}
