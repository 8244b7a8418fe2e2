//! Weighted random selection over a dynamic population of keys.
//!
//! Entries are grouped into bins by the binary exponent of their weight, so
//! every weight in bin `e` lies in `[2^e, 2^(e+1))`. A draw first picks a bin
//! proportionally to its aggregate weight, then rejection-samples a member
//! inside it against the bin's upper bound. Acceptance is at least one half,
//! so both updates and draws cost expected O(1) regardless of how many orders
//! of magnitude separate the weights.
//!
//! Sums are kept with Neumaier compensation and recomputed from scratch every
//! `recompute_period` updates to bound drift.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

use rand::Rng;
use thiserror::Error;

/// Number of updates between two from-scratch recomputations of the sums.
pub const DEFAULT_RECOMPUTE_PERIOD: u64 = 1 << 16;

/// Subnormal weights all share the lowest bin.
const SUBNORMAL_BIN: i32 = -1023;

#[derive(Debug, Error, Clone, Copy, PartialEq)]
pub enum SelectorError {
    #[error("nothing to select: total weight is zero")]
    Empty,
    #[error("weight {0} is not a finite non-negative number")]
    InvalidWeight(f64),
}

#[derive(Clone, Copy, Debug, Default)]
struct CompensatedSum {
    sum: f64,
    carry: f64,
}

impl CompensatedSum {
    #[inline]
    fn add(&mut self, value: f64) {
        let next = self.sum + value;
        if self.sum.abs() >= value.abs() {
            self.carry += (self.sum - next) + value;
        } else {
            self.carry += (value - next) + self.sum;
        }
        self.sum = next;
    }

    #[inline]
    fn value(&self) -> f64 {
        self.sum + self.carry
    }
}

#[derive(Clone, Debug)]
struct Entry<K> {
    key: K,
    weight: f64,
    bin: Option<i32>,
    pos: usize,
}

#[derive(Clone, Debug, Default)]
struct Bin {
    members: Vec<usize>,
    sum: CompensatedSum,
}

#[inline]
fn bin_of(weight: f64) -> i32 {
    let exponent = ((weight.to_bits() >> 52) & 0x7ff) as i32;
    if exponent == 0 {
        SUBNORMAL_BIN
    } else {
        exponent - 1023
    }
}

#[inline]
fn bin_ceiling(bin: i32) -> f64 {
    2f64.powi(bin + 1)
}

#[derive(Clone, Debug)]
pub struct WeightedSelector<K> {
    entries: Vec<Entry<K>>,
    index: HashMap<K, usize>,
    bins: BTreeMap<i32, Bin>,
    total: CompensatedSum,
    updates: u64,
    recompute_period: u64,
}

impl<K: Clone + Eq + Hash> Default for WeightedSelector<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Clone + Eq + Hash> WeightedSelector<K> {
    pub fn new() -> Self {
        Self::with_recompute_period(DEFAULT_RECOMPUTE_PERIOD)
    }

    /// A period of zero disables the periodic recomputation.
    pub fn with_recompute_period(recompute_period: u64) -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::new(),
            bins: BTreeMap::new(),
            total: CompensatedSum::default(),
            updates: 0,
            recompute_period,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    pub fn weight(&self, key: &K) -> Option<f64> {
        self.index.get(key).map(|&slot| self.entries[slot].weight)
    }

    pub fn recompute_period(&self) -> u64 {
        self.recompute_period
    }

    pub fn set_recompute_period(&mut self, period: u64) {
        self.recompute_period = period;
    }

    /// Live sum of all weights.
    ///
    /// Exactly zero whenever no entry carries a positive weight, whatever
    /// rounding the incremental updates accumulated.
    pub fn total_weight(&self) -> f64 {
        if self.bins.is_empty() {
            0.0
        } else {
            self.total.value().max(0.0)
        }
    }

    /// Sum of the weights recomputed from the entries, ignoring the
    /// incrementally maintained aggregates.
    pub fn exact_total(&self) -> f64 {
        let mut acc = CompensatedSum::default();
        for entry in &self.entries {
            acc.add(entry.weight);
        }
        acc.value()
    }

    /// Sets the weight of `key`, inserting it when absent. Zero is a valid
    /// weight: the key stays a member but is never drawn.
    pub fn insert_or_update(&mut self, key: K, weight: f64) -> Result<(), SelectorError> {
        if !weight.is_finite() || weight < 0.0 {
            return Err(SelectorError::InvalidWeight(weight));
        }
        // folds -0.0 into 0.0
        let weight = weight + 0.0;
        match self.index.get(&key) {
            Some(&slot) => {
                let old = self.entries[slot].weight;
                if old == weight {
                    return Ok(());
                }
                self.detach(slot);
                self.total.add(-old);
                self.entries[slot].weight = weight;
                self.attach(slot);
                self.total.add(weight);
            }
            None => {
                let slot = self.entries.len();
                self.entries.push(Entry {
                    key: key.clone(),
                    weight,
                    bin: None,
                    pos: 0,
                });
                self.index.insert(key, slot);
                self.attach(slot);
                self.total.add(weight);
            }
        }
        self.note_update();
        Ok(())
    }

    /// Deletes `key`, returning its last weight.
    pub fn remove(&mut self, key: &K) -> Option<f64> {
        let slot = self.index.remove(key)?;
        self.detach(slot);
        let removed = self.entries.swap_remove(slot);
        self.total.add(-removed.weight);
        if slot < self.entries.len() {
            let moved = &self.entries[slot];
            self.index.insert(moved.key.clone(), slot);
            if let Some(bin) = moved.bin {
                let pos = moved.pos;
                if let Some(bin) = self.bins.get_mut(&bin) {
                    bin.members[pos] = slot;
                }
            }
        }
        self.note_update();
        Some(removed.weight)
    }

    /// Draws a key with probability `weight / total_weight()`.
    ///
    /// The first uniform picks the bin, each following one picks a member and
    /// decides its acceptance. The result is a pure function of the uniform
    /// stream and of the update history.
    pub fn draw<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<K, SelectorError> {
        if self.bins.is_empty() {
            return Err(SelectorError::Empty);
        }
        let live_total: f64 = self.bins.values().map(|bin| bin.sum.value()).sum();
        if live_total <= 0.0 {
            return Err(SelectorError::Empty);
        }
        let mut target = rng.r#gen::<f64>() * live_total;
        let mut chosen = None;
        for (&exponent, bin) in self.bins.iter().rev() {
            chosen = Some((exponent, bin));
            let sum = bin.sum.value();
            if target < sum {
                break;
            }
            target -= sum;
        }
        // rounding may walk past the last bin; the smallest one absorbs it
        let (exponent, bin) = chosen.ok_or(SelectorError::Empty)?;
        let ceiling = bin_ceiling(exponent);
        let count = bin.members.len();
        loop {
            let scaled = rng.r#gen::<f64>() * count as f64;
            let pick = (scaled as usize).min(count - 1);
            let acceptance = scaled - pick as f64;
            let entry = &self.entries[bin.members[pick]];
            if acceptance * ceiling < entry.weight {
                return Ok(entry.key.clone());
            }
        }
    }

    /// Rebuilds every aggregate from the individual weights.
    pub fn recompute(&mut self) {
        let mut total = CompensatedSum::default();
        for bin in self.bins.values_mut() {
            let mut sum = CompensatedSum::default();
            for &slot in &bin.members {
                sum.add(self.entries[slot].weight);
            }
            bin.sum = sum;
            total.add(sum.value());
        }
        self.total = total;
    }

    fn note_update(&mut self) {
        self.updates = self.updates.wrapping_add(1);
        if self.recompute_period > 0 && self.updates % self.recompute_period == 0 {
            self.recompute();
        }
    }

    fn attach(&mut self, slot: usize) {
        let weight = self.entries[slot].weight;
        if weight <= 0.0 {
            self.entries[slot].bin = None;
            return;
        }
        let exponent = bin_of(weight);
        let bin = self.bins.entry(exponent).or_default();
        self.entries[slot].pos = bin.members.len();
        self.entries[slot].bin = Some(exponent);
        bin.members.push(slot);
        bin.sum.add(weight);
    }

    fn detach(&mut self, slot: usize) {
        let Some(exponent) = self.entries[slot].bin.take() else {
            return;
        };
        let pos = self.entries[slot].pos;
        let weight = self.entries[slot].weight;
        let now_empty = match self.bins.get_mut(&exponent) {
            Some(bin) => {
                bin.members.swap_remove(pos);
                if let Some(&moved) = bin.members.get(pos) {
                    self.entries[moved].pos = pos;
                }
                bin.sum.add(-weight);
                bin.members.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.bins.remove(&exponent);
        }
        if self.bins.is_empty() {
            // all remaining entries weigh zero: drop the accumulated residue so
            // that the caller's subtraction of `weight` lands on exactly zero
            self.total = CompensatedSum::default();
            self.total.add(weight);
        }
    }
}
