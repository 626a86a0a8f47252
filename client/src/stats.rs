//! Statistics roll-up
//!
//! Every write to a data value updates the statistics of its entry and of
//! the three roll-up levels above it (function, file, application).
//!
//! Count, sum and sum of squares are maintained exactly. Max and min follow
//! writes only while they move in their own direction; when the current
//! owner of a max drops (or of a min rises) the extremum becomes
//! [`Extremum::NeedsRebuild`] and the next query rescans the raw values.
//!
//! Roll-up nodes keep one [`Accumulator`] per entry-level statistic (sum,
//! mean, max, min) updated by exact deltas from each child entry, plus a
//! single tagged cache for everything else (counts, standard deviations)
//! that any write below clears and the next query recomputes by walking the
//! node's children.

use crate::metrics::STATS_REBUILDS;
use std::collections::{BTreeMap, HashMap};
use toolgear_shared::types::program::StatKind;

/// Function index and entry index within that function.
pub type EntryKey = (usize, usize);

/// Where a value sits in the roll-up tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub file: usize,
    pub function: usize,
    pub entry: usize,
}

impl Placement {
    pub fn key(&self) -> EntryKey {
        (self.function, self.entry)
    }
}

/// Raw values for rescans: `(pt pair index, value)` of every set element.
pub trait ValueSource {
    fn values(&self, entry: EntryKey, attr: usize) -> Vec<(usize, f64)>;
}

/// A running max or min and who holds it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Extremum<O> {
    Empty,
    Known { value: f64, owner: O },
    NeedsRebuild,
}

impl<O: Copy + PartialEq> Extremum<O> {
    pub fn value(&self) -> Option<f64> {
        match self {
            Extremum::Known { value, .. } => Some(*value),
            _ => None,
        }
    }

    pub fn owner(&self) -> Option<O> {
        match self {
            Extremum::Known { owner, .. } => Some(*owner),
            _ => None,
        }
    }

    pub fn needs_rebuild(&self) -> bool {
        matches!(self, Extremum::NeedsRebuild)
    }

    /// Fold in a candidate during a from-scratch scan. Ties keep the first owner.
    fn consider(&mut self, owner: O, value: f64, better: fn(f64, f64) -> bool) {
        match self {
            Extremum::Known { value: cur, .. } if !better(value, *cur) => {}
            _ => *self = Extremum::Known { value, owner },
        }
    }

    /// Follow a write by `owner`. Only ever improves or gives up.
    fn update(&mut self, owner: O, value: f64, better: fn(f64, f64) -> bool) {
        match *self {
            Extremum::Empty => *self = Extremum::Known { value, owner },
            Extremum::Known { value: cur, owner: holder } => {
                if better(value, cur) {
                    *self = Extremum::Known { value, owner };
                } else if holder == owner && better(cur, value) {
                    *self = Extremum::NeedsRebuild;
                }
            }
            Extremum::NeedsRebuild => {}
        }
    }
}

fn greater(a: f64, b: f64) -> bool {
    a > b
}

fn less(a: f64, b: f64) -> bool {
    a < b
}

/// Population standard deviation. Exactly 0.0 for a single sample.
pub fn population_stddev(count: u64, sum: f64, sum_sq: f64) -> Option<f64> {
    match count {
        0 => None,
        1 => Some(0.0),
        n => {
            let n = n as f64;
            let mean = sum / n;
            Some((sum_sq / n - mean * mean).max(0.0).sqrt())
        }
    }
}

/// Statistics of one (entry, attr) over its (task, thread) pairs.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryStats {
    count: u64,
    sum: f64,
    sum_sq: f64,
    max: Extremum<usize>,
    min: Extremum<usize>,
}

impl Default for EntryStats {
    fn default() -> Self {
        Self {
            count: 0,
            sum: 0.0,
            sum_sq: 0.0,
            max: Extremum::Empty,
            min: Extremum::Empty,
        }
    }
}

impl EntryStats {
    /// Compute from scratch.
    pub fn from_values(values: impl IntoIterator<Item = (usize, f64)>) -> Self {
        let mut stats = Self::default();
        for (pt, v) in values {
            stats.count += 1;
            stats.sum += v;
            stats.sum_sq += v * v;
            stats.max.consider(pt, v, greater);
            stats.min.consider(pt, v, less);
        }
        stats
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn sum_of_squares(&self) -> f64 {
        self.sum_sq
    }

    pub fn max(&self) -> Extremum<usize> {
        self.max
    }

    pub fn min(&self) -> Extremum<usize> {
        self.min
    }

    pub fn needs_rebuild(&self) -> bool {
        self.max.needs_rebuild() || self.min.needs_rebuild()
    }

    /// `old` is the previous value of the element at `pt`, if it was set.
    fn record(&mut self, pt: usize, old: Option<f64>, new: f64) {
        match old {
            None => {
                self.count += 1;
                self.sum += new;
                self.sum_sq += new * new;
            }
            Some(old) => {
                self.sum += new - old;
                self.sum_sq += new * new - old * old;
            }
        }
        self.max.update(pt, new, greater);
        self.min.update(pt, new, less);
    }

    /// `None` for an empty entry or an invalidated max/min.
    pub fn stat(&self, kind: StatKind) -> Option<f64> {
        if self.count == 0 {
            return None;
        }
        match kind {
            StatKind::Sum => Some(self.sum),
            StatKind::Mean => Some(self.sum / self.count as f64),
            StatKind::Max => self.max.value(),
            StatKind::Min => self.min.value(),
            StatKind::Count => Some(self.count as f64),
            StatKind::StdDev => population_stddev(self.count, self.sum, self.sum_sq),
        }
    }
}

/// Entry-level statistics with a dedicated accumulator in every roll-up node.
const ACCUMULATED: [StatKind; 4] = [StatKind::Sum, StatKind::Mean, StatKind::Max, StatKind::Min];

fn slot(kind: StatKind) -> Option<usize> {
    ACCUMULATED.iter().position(|k| *k == kind)
}

fn snapshot(stats: &EntryStats) -> [Option<f64>; 4] {
    ACCUMULATED.map(|k| stats.stat(k))
}

/// Sum, max and min of one entry-level statistic across a node's children.
#[derive(Debug, Clone, PartialEq)]
pub struct Accumulator<K> {
    sum: Option<f64>,
    max: Extremum<K>,
    min: Extremum<K>,
}

impl<K> Default for Accumulator<K> {
    fn default() -> Self {
        Self {
            sum: Some(0.0),
            max: Extremum::Empty,
            min: Extremum::Empty,
        }
    }
}

impl<K: Copy + PartialEq> Accumulator<K> {
    fn invalidate(&mut self) {
        self.sum = None;
        self.max = Extremum::NeedsRebuild;
        self.min = Extremum::NeedsRebuild;
    }

    fn stale(&self, rollup: StatKind) -> bool {
        match rollup {
            StatKind::Max => self.max.needs_rebuild(),
            StatKind::Min => self.min.needs_rebuild(),
            _ => self.sum.is_none(),
        }
    }

    fn apply(&mut self, child: K, was_live: bool, before: Option<f64>, after: Option<f64>) {
        if self.sum.is_none() {
            return;
        }
        let Some(after) = after else {
            self.invalidate();
            return;
        };
        let delta = match (was_live, before) {
            (false, _) => after,
            (true, Some(before)) => after - before,
            (true, None) => {
                self.invalidate();
                return;
            }
        };
        if let Some(sum) = self.sum.as_mut() {
            *sum += delta;
        }
        self.max.update(child, after, greater);
        self.min.update(child, after, less);
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct MiscCache {
    per_entry: StatKind,
    rollup: StatKind,
    value: Option<f64>,
}

/// One function, file or the whole application, for one attribute.
#[derive(Debug, Clone)]
pub struct RollupNode<K> {
    /// Live children, each pointing at the entry it stands for.
    children: BTreeMap<K, EntryKey>,
    acc: [Accumulator<K>; 4],
    misc: Option<MiscCache>,
}

impl<K> Default for RollupNode<K> {
    fn default() -> Self {
        Self {
            children: BTreeMap::new(),
            acc: std::array::from_fn(|_| Accumulator::default()),
            misc: None,
        }
    }
}

impl<K: Ord + Copy> RollupNode<K> {
    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    fn apply(
        &mut self,
        child: K,
        entry: EntryKey,
        was_live: bool,
        before: &[Option<f64>; 4],
        after: &[Option<f64>; 4],
    ) {
        for (i, acc) in self.acc.iter_mut().enumerate() {
            acc.apply(child, was_live, before[i], after[i]);
        }
        self.children.insert(child, entry);
        self.misc = None;
    }
}

/// Entry statistics plus the function, file and application roll-ups.
#[derive(Debug, Default)]
pub struct StatsRollup {
    entries: HashMap<(EntryKey, usize), EntryStats>,
    functions: HashMap<(usize, usize), RollupNode<usize>>,
    files: HashMap<(usize, usize), RollupNode<EntryKey>>,
    app: HashMap<usize, RollupNode<EntryKey>>,
    rebuilds: u64,
}

impl StatsRollup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one write into every level. `old` is the element's previous value.
    pub fn record(&mut self, at: Placement, attr: usize, pt: usize, old: Option<f64>, new: f64) {
        let key = at.key();
        let stats = self.entries.entry((key, attr)).or_default();
        let was_live = stats.count > 0;
        let before = snapshot(stats);
        stats.record(pt, old, new);
        let after = snapshot(stats);

        self.functions
            .entry((at.function, attr))
            .or_default()
            .apply(at.entry, key, was_live, &before, &after);
        self.files
            .entry((at.file, attr))
            .or_default()
            .apply(key, key, was_live, &before, &after);
        self.app
            .entry(attr)
            .or_default()
            .apply(key, key, was_live, &before, &after);
    }

    /// Full rescans performed so far, at any level.
    pub fn rebuilds(&self) -> u64 {
        self.rebuilds
    }

    /// Cached statistics, possibly with an invalidated max or min.
    pub fn entry_stats(&self, entry: EntryKey, attr: usize) -> Option<&EntryStats> {
        self.entries.get(&(entry, attr))
    }

    /// Recompute one entry's statistics from its raw values.
    pub fn rebuild_entry_stats(
        &mut self,
        entry: EntryKey,
        attr: usize,
        src: &dyn ValueSource,
    ) -> Option<&EntryStats> {
        rebuild_entry(&mut self.entries, &mut self.rebuilds, entry, attr, src);
        self.entries.get(&(entry, attr))
    }

    pub fn entry_stat(
        &mut self,
        entry: EntryKey,
        attr: usize,
        kind: StatKind,
        src: &dyn ValueSource,
    ) -> Option<f64> {
        entry_value(&mut self.entries, &mut self.rebuilds, entry, attr, kind, src)
    }

    pub fn function_stat(
        &mut self,
        function: usize,
        attr: usize,
        per_entry: StatKind,
        rollup: StatKind,
        src: &dyn ValueSource,
    ) -> Option<f64> {
        let node = self.functions.get_mut(&(function, attr))?;
        node_stat(node, &mut self.entries, &mut self.rebuilds, attr, per_entry, rollup, src)
    }

    pub fn file_stat(
        &mut self,
        file: usize,
        attr: usize,
        per_entry: StatKind,
        rollup: StatKind,
        src: &dyn ValueSource,
    ) -> Option<f64> {
        let node = self.files.get_mut(&(file, attr))?;
        node_stat(node, &mut self.entries, &mut self.rebuilds, attr, per_entry, rollup, src)
    }

    pub fn app_stat(
        &mut self,
        attr: usize,
        per_entry: StatKind,
        rollup: StatKind,
        src: &dyn ValueSource,
    ) -> Option<f64> {
        let node = self.app.get_mut(&attr)?;
        node_stat(node, &mut self.entries, &mut self.rebuilds, attr, per_entry, rollup, src)
    }
}

fn count_rebuild(rebuilds: &mut u64) {
    *rebuilds += 1;
    STATS_REBUILDS.inc();
}

fn rebuild_entry(
    entries: &mut HashMap<(EntryKey, usize), EntryStats>,
    rebuilds: &mut u64,
    entry: EntryKey,
    attr: usize,
    src: &dyn ValueSource,
) {
    let fresh = EntryStats::from_values(src.values(entry, attr));
    count_rebuild(rebuilds);
    entries.insert((entry, attr), fresh);
}

fn entry_value(
    entries: &mut HashMap<(EntryKey, usize), EntryStats>,
    rebuilds: &mut u64,
    entry: EntryKey,
    attr: usize,
    kind: StatKind,
    src: &dyn ValueSource,
) -> Option<f64> {
    let stale = match (entries.get(&(entry, attr)), kind) {
        (None, _) => return None,
        (Some(s), StatKind::Max) => s.max.needs_rebuild(),
        (Some(s), StatKind::Min) => s.min.needs_rebuild(),
        _ => false,
    };
    if stale {
        rebuild_entry(entries, rebuilds, entry, attr, src);
    }
    entries.get(&(entry, attr))?.stat(kind)
}

/// `values` folded by `kind`.
fn fold(values: &[f64], kind: StatKind) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let n = values.len() as f64;
    let sum: f64 = values.iter().sum();
    Some(match kind {
        StatKind::Sum => sum,
        StatKind::Mean => sum / n,
        StatKind::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        StatKind::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
        StatKind::Count => n,
        StatKind::StdDev => {
            let sum_sq: f64 = values.iter().map(|v| v * v).sum();
            return population_stddev(values.len() as u64, sum, sum_sq);
        }
    })
}

fn node_stat<K: Ord + Copy>(
    node: &mut RollupNode<K>,
    entries: &mut HashMap<(EntryKey, usize), EntryStats>,
    rebuilds: &mut u64,
    attr: usize,
    per_entry: StatKind,
    rollup: StatKind,
    src: &dyn ValueSource,
) -> Option<f64> {
    if node.children.is_empty() {
        return None;
    }

    if let (Some(i), StatKind::Sum | StatKind::Mean | StatKind::Max | StatKind::Min) =
        (slot(per_entry), rollup)
    {
        if node.acc[i].stale(rollup) {
            let mut acc = Accumulator::default();
            for (&child, &entry) in &node.children {
                if let Some(v) = entry_value(entries, rebuilds, entry, attr, per_entry, src) {
                    if let Some(sum) = acc.sum.as_mut() {
                        *sum += v;
                    }
                    acc.max.consider(child, v, greater);
                    acc.min.consider(child, v, less);
                }
            }
            count_rebuild(rebuilds);
            node.acc[i] = acc;
        }
        let acc = &node.acc[i];
        return match rollup {
            StatKind::Sum => acc.sum,
            StatKind::Mean => acc.sum.map(|s| s / node.children.len() as f64),
            StatKind::Max => acc.max.value(),
            _ => acc.min.value(),
        };
    }

    if let Some(cache) = node.misc {
        if cache.per_entry == per_entry && cache.rollup == rollup {
            return cache.value;
        }
    }
    let values: Vec<f64> = node
        .children
        .values()
        .filter_map(|&entry| entry_value(entries, rebuilds, entry, attr, per_entry, src))
        .collect();
    let value = fold(&values, rollup);
    node.misc = Some(MiscCache {
        per_entry,
        rollup,
        value,
    });
    value
}
