//! Rows of the program database

use std::collections::{BTreeMap, BTreeSet, HashMap};
use toolgear_shared::md::SparseField;
use toolgear_shared::types::program::{DataType, PointKind, PointLocation, SuggestedStat, Traceback};

/// Index into a [`super::ProgramDatabase`] table.
pub type Index = usize;

#[derive(Debug, Clone, PartialEq)]
pub struct File {
    pub name: String,
    pub full_path: Option<String>,
    pub parsed: bool,
    /// Functions in insertion order.
    pub functions: Vec<Index>,
    /// Line number to function.
    pub(crate) line_map: LineMap,
}

impl File {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            full_path: None,
            parsed: false,
            functions: Vec::new(),
            line_map: LineMap::default(),
        }
    }

    pub fn function_at(&self, line: i32) -> Option<Index> {
        self.line_map.function_at(line)
    }
}

/// Disjoint line spans of one file, keyed by first line.
///
/// Memory grows with the number of spans, never with line numbers.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct LineMap {
    spans: BTreeMap<i32, (i32, Index)>,
}

impl LineMap {
    pub(crate) fn function_at(&self, line: i32) -> Option<Index> {
        let (_, &(end, function)) = self.spans.range(..=line).next_back()?;
        (line <= end).then_some(function)
    }

    /// Parts of `start..=end` already mapped, in line order, as
    /// `(first, last, function)`.
    pub(crate) fn overlaps(&self, start: i32, end: i32) -> Vec<(i32, i32, Index)> {
        let mut out = Vec::new();
        if let Some((_, &(e, f))) = self.spans.range(..start).next_back() {
            if e >= start {
                out.push((start, e.min(end), f));
            }
        }
        for (&s, &(e, f)) in self.spans.range(start..=end) {
            out.push((s, e.min(end), f));
        }
        out
    }

    /// Map every line of `start..=end` to `function`, trimming what was there.
    pub(crate) fn assign(&mut self, start: i32, end: i32, function: Index) {
        if let Some((&s, &(e, f))) = self.spans.range(..start).next_back() {
            if e >= start {
                self.spans.insert(s, (start - 1, f));
                if e > end {
                    self.spans.insert(end + 1, (e, f));
                }
            }
        }
        let inside: Vec<i32> = self.spans.range(start..=end).map(|(&s, _)| s).collect();
        for s in inside {
            if let Some((e, f)) = self.spans.remove(&s) {
                if e > end {
                    self.spans.insert(end + 1, (e, f));
                }
            }
        }
        self.spans.insert(start, (end, function));
    }

    /// Map the lines of `start..=end` that nothing covers yet.
    pub(crate) fn fill(&mut self, start: i32, end: i32, function: Index) {
        let mut next = i64::from(start);
        for (first, last, _) in self.overlaps(start, end) {
            if i64::from(first) > next {
                self.spans.insert(next as i32, (first - 1, function));
            }
            next = i64::from(last) + 1;
        }
        if next <= i64::from(end) {
            self.spans.insert(next as i32, (end, function));
        }
    }

    pub(crate) fn span_count(&self) -> usize {
        self.spans.len()
    }
}

/// Instrumentation point details of an entry.
#[derive(Debug, Clone, PartialEq)]
pub struct PointInfo {
    pub kind: PointKind,
    pub location: PointLocation,
    pub callee: String,
    pub call_index: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub name: String,
    pub line: i32,
    pub index_in_line: i32,
    pub tooltip: String,
    pub point: Option<PointInfo>,
    /// Actions enabled here.
    pub enabled: BTreeSet<Index>,
    /// Current state per (action, task); `None` covers every task.
    pub(crate) states: BTreeMap<(Index, Option<i32>), String>,
}

impl Entry {
    pub(crate) fn new(name: &str, line: i32, index_in_line: i32, tooltip: &str) -> Self {
        Self {
            name: name.to_string(),
            line,
            index_in_line,
            tooltip: tooltip.to_string(),
            point: None,
            enabled: BTreeSet::new(),
            states: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub name: String,
    pub file: Index,
    /// Position among the file's functions.
    pub index_in_file: usize,
    /// `-1` when unknown.
    pub start_line: i32,
    pub end_line: i32,
    pub parsed: bool,
    pub entries: Vec<Entry>,
    pub(crate) entry_by_name: HashMap<String, Index>,
}

impl Function {
    pub fn entry(&self, name: &str) -> Option<&Entry> {
        self.entry_by_name.get(name).map(|&i| &self.entries[i])
    }

    pub fn entry_index(&self, name: &str) -> Option<Index> {
        self.entry_by_name.get(name).copied()
    }
}

/// A declared data column.
#[derive(Debug, Clone, PartialEq)]
pub struct DataAttr {
    pub tag: String,
    pub description: String,
    pub data_type: DataType,
    pub suggested: SuggestedStat,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ActionStateDecl {
    pub pixmap: String,
    pub menu_text: String,
    pub tooltip: String,
}

/// A declared action and its state machine.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionDecl {
    pub tag: String,
    pub menu_text: String,
    pub tooltip: String,
    pub initial_state: String,
    pub states: BTreeMap<String, ActionStateDecl>,
    pub transitions: BTreeSet<(String, String)>,
}

impl ActionDecl {
    pub fn allows(&self, from: &str, to: &str) -> bool {
        self.transitions
            .contains(&(from.to_string(), to.to_string()))
    }
}

/// One execution unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PtPair {
    pub task: i32,
    pub thread: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub number: usize,
    /// One element per line of text.
    pub lines: Vec<String>,
    pub tracebacks: Vec<Traceback>,
}

impl Message {
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageFolder {
    pub tag: String,
    pub title: String,
    pub messages: Vec<Message>,
}

/// The values of one (entry, attr), indexed by pt pair.
#[derive(Debug, Clone, PartialEq)]
pub enum Values {
    Int(SparseField<i32>),
    Double(SparseField<f64>),
}

impl Values {
    pub fn empty(data_type: DataType) -> Self {
        match data_type {
            DataType::Int => Values::Int(SparseField::new()),
            DataType::Double => Values::Double(SparseField::new()),
        }
    }

    pub fn data_type(&self) -> DataType {
        match self {
            Values::Int(_) => DataType::Int,
            Values::Double(_) => DataType::Double,
        }
    }

    pub fn get(&self, pt: Index) -> Option<f64> {
        match self {
            Values::Int(f) => f.get(pt).map(|&v| f64::from(v)),
            Values::Double(f) => f.get(pt).copied(),
        }
    }

    /// Every set element as `(pt, value)`.
    pub fn iter(&self) -> Vec<(Index, f64)> {
        match self {
            Values::Int(f) => f.iter().map(|(pt, &v)| (pt, f64::from(v))).collect(),
            Values::Double(f) => f.iter().map(|(pt, &v)| (pt, v)).collect(),
        }
    }
}
