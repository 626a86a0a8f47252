//! The program database
//!
//! Files, functions and their entries, declared data attributes with one
//! value per (entry, attr, pt pair), declared actions and their per-entry
//! states, and message folders. Every data write feeds [`StatsRollup`].
//!
//! The database is owned by a single dispatch thread. Observers subscribe
//! to [`DbEvent`]s instead of sharing it.

pub mod model;
pub mod snapshot;

pub use model::{
    ActionDecl, ActionStateDecl, DataAttr, Entry, File, Function, Index, Message, MessageFolder,
    PointInfo, PtPair, Values,
};
pub use snapshot::MergeReport;

use crate::config::OverlapPolicy;
use crate::diagnostics::Diagnostics;
use crate::metrics::DROPPED_VALUES;
use crate::stats::{EntryKey, EntryStats, Placement, StatsRollup, ValueSource};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use toolgear_shared::md::MdError;
use toolgear_shared::protocol::messages::ALL_TASKS;
use toolgear_shared::types::program::{DataType, StatKind, SuggestedStat, Traceback};
use toolgear_shared::utils::split_lines;
use tracing::debug;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("{what} '{name}' declared twice")]
    Redeclared { what: &'static str, name: String },

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("function '{function}' has no entry '{entry}'")]
    UnknownEntry { function: String, entry: String },

    #[error("unknown file '{0}'")]
    UnknownFile(String),

    #[error("unknown data attribute '{0}'")]
    UnknownAttr(String),

    #[error("data attribute '{attr}' is {declared}, not {requested}")]
    TypeMismatch {
        attr: String,
        declared: DataType,
        requested: DataType,
    },

    #[error("unknown action '{0}'")]
    UnknownAction(String),

    #[error("action '{action}' has no state '{state}'")]
    UnknownActionState { action: String, state: String },

    #[error("action '{action}' is not enabled at {function}/{entry}")]
    ActionNotEnabled {
        function: String,
        entry: String,
        action: String,
    },

    #[error("unknown message folder '{0}'")]
    UnknownFolder(String),

    #[error("{file}:{line} of '{function}' already belongs to '{existing}'")]
    OverlappingFunction {
        function: String,
        file: String,
        line: i32,
        existing: String,
    },

    #[error("snapshot must be for the same tool/code version: {0}")]
    Incompatible(String),

    #[error(transparent)]
    Md(#[from] MdError),
}

pub type Result<T> = std::result::Result<T, DbError>;

/// Result of an idempotent insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(Index),
    /// Nothing changed; the existing row keeps its index.
    AlreadyExists(Index),
}

impl InsertOutcome {
    pub fn index(self) -> Index {
        match self {
            InsertOutcome::Inserted(i) | InsertOutcome::AlreadyExists(i) => i,
        }
    }
}

/// Change notifications for observers.
#[derive(Debug, Clone, PartialEq)]
pub enum DbEvent {
    FileInserted { file: Index },
    FileParsed { file: Index },
    FunctionInserted { function: Index },
    FunctionParsed { function: Index },
    EntryInserted { function: Index, entry: Index },
    DataChanged {
        function: Index,
        entry: Index,
        attr: Index,
        pt: Index,
    },
    ActionStateChanged {
        function: Index,
        entry: Index,
        action: Index,
        state: String,
    },
    MessageAdded { folder: Index, number: usize },
}

/// Raw values keyed by (entry, attr).
#[derive(Debug, Default)]
pub(crate) struct DataStore {
    values: HashMap<(EntryKey, Index), Values>,
}

impl DataStore {
    fn get(&self, entry: EntryKey, attr: Index) -> Option<&Values> {
        self.values.get(&(entry, attr))
    }
}

impl ValueSource for DataStore {
    fn values(&self, entry: EntryKey, attr: usize) -> Vec<(usize, f64)> {
        self.get(entry, attr).map(Values::iter).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy)]
enum Write {
    Set,
    Add,
}

/// A number headed for an int or double column.
#[derive(Debug, Clone, Copy)]
enum Number {
    Int(i32),
    Double(f64),
}

#[derive(Debug, Default)]
pub struct ProgramDatabase {
    overlap: OverlapPolicy,
    files: Vec<File>,
    file_by_name: HashMap<String, Index>,
    functions: Vec<Function>,
    function_by_name: HashMap<String, Index>,
    attrs: Vec<DataAttr>,
    attr_by_tag: HashMap<String, Index>,
    actions: Vec<ActionDecl>,
    action_by_tag: HashMap<String, Index>,
    pt_pairs: Vec<PtPair>,
    pt_by_pair: HashMap<PtPair, Index>,
    folders: Vec<MessageFolder>,
    folder_by_tag: HashMap<String, Index>,
    store: DataStore,
    stats: StatsRollup,
    diag: Diagnostics,
    subscribers: Vec<mpsc::UnboundedSender<DbEvent>>,
}

/// `(-1, -1)` unless both lines are positive and ordered.
pub fn normalize_lines(start: i32, end: i32) -> (i32, i32) {
    if start < 1 || end < 1 || end < start {
        (-1, -1)
    } else {
        (start, end)
    }
}

impl ProgramDatabase {
    pub fn new(overlap: OverlapPolicy) -> Self {
        Self {
            overlap,
            ..Self::default()
        }
    }

    /// Receive every change from now on.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<DbEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    fn notify(&mut self, event: DbEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diag
    }

    // ── Schema ──────────────────────────────────────────────────────────────

    pub fn declare_data_attr(
        &mut self,
        tag: &str,
        description: &str,
        data_type: DataType,
        suggested: SuggestedStat,
    ) -> Result<Index> {
        if self.attr_by_tag.contains_key(tag) {
            return Err(DbError::Redeclared {
                what: "data attribute",
                name: tag.to_string(),
            });
        }
        let idx = self.attrs.len();
        self.attrs.push(DataAttr {
            tag: tag.to_string(),
            description: description.to_string(),
            data_type,
            suggested,
        });
        self.attr_by_tag.insert(tag.to_string(), idx);
        Ok(idx)
    }

    pub fn data_attr(&self, tag: &str) -> Option<&DataAttr> {
        self.attr_by_tag.get(tag).map(|&i| &self.attrs[i])
    }

    pub fn data_attrs(&self) -> &[DataAttr] {
        &self.attrs
    }

    fn attr_index(&self, tag: &str) -> Result<Index> {
        self.attr_by_tag
            .get(tag)
            .copied()
            .ok_or_else(|| DbError::UnknownAttr(tag.to_string()))
    }

    // ── Files and functions ─────────────────────────────────────────────────

    /// Idempotent. Subscribers hear about the first insertion only.
    pub fn insert_file(&mut self, name: &str) -> Index {
        if let Some(&idx) = self.file_by_name.get(name) {
            return idx;
        }
        let idx = self.files.len();
        self.files.push(File::new(name));
        self.file_by_name.insert(name.to_string(), idx);
        self.notify(DbEvent::FileInserted { file: idx });
        idx
    }

    pub fn file(&self, name: &str) -> Option<&File> {
        self.file_by_name.get(name).map(|&i| &self.files[i])
    }

    pub fn files(&self) -> &[File] {
        &self.files
    }

    fn file_index(&self, name: &str) -> Result<Index> {
        self.file_by_name
            .get(name)
            .copied()
            .ok_or_else(|| DbError::UnknownFile(name.to_string()))
    }

    pub fn set_file_full_path(&mut self, file: &str, path: &str) -> Result<()> {
        let idx = self.file_index(file)?;
        self.files[idx].full_path = Some(path.to_string());
        Ok(())
    }

    pub fn mark_file_parsed(&mut self, file: &str) -> Result<()> {
        let idx = self.file_index(file)?;
        if !self.files[idx].parsed {
            self.files[idx].parsed = true;
            self.notify(DbEvent::FileParsed { file: idx });
        }
        Ok(())
    }

    /// Insert a function, creating its file on demand.
    ///
    /// A known name is left untouched and reported as
    /// [`InsertOutcome::AlreadyExists`]. Line ranges that are not positive
    /// and ordered are stored as `(-1, -1)` and map no lines.
    pub fn insert_function(
        &mut self,
        name: &str,
        file: &str,
        start_line: i32,
        end_line: i32,
    ) -> Result<InsertOutcome> {
        if let Some(&idx) = self.function_by_name.get(name) {
            self.diag.duplicate("function", name);
            return Ok(InsertOutcome::AlreadyExists(idx));
        }
        let (start, end) = normalize_lines(start_line, end_line);
        if start > 0 && self.overlap == OverlapPolicy::Reject {
            if let Some(&file_idx) = self.file_by_name.get(file) {
                let overlaps = self.files[file_idx].line_map.overlaps(start, end);
                if let Some(&(line, _, existing)) = overlaps.first() {
                    return Err(DbError::OverlappingFunction {
                        function: name.to_string(),
                        file: file.to_string(),
                        line,
                        existing: self.functions[existing].name.clone(),
                    });
                }
            }
        }
        let file_idx = self.insert_file(file);
        let idx = self.functions.len();

        if start > 0 {
            let overlaps = self.files[file_idx].line_map.overlaps(start, end);
            for &(line, _, existing) in &overlaps {
                self.diag
                    .line_conflict(file, line, &self.functions[existing].name, name);
            }
            let map = &mut self.files[file_idx].line_map;
            match self.overlap {
                OverlapPolicy::LastWins => map.assign(start, end, idx),
                OverlapPolicy::FirstWins | OverlapPolicy::Reject => map.fill(start, end, idx),
            }
        }

        let f = &mut self.files[file_idx];
        let index_in_file = f.functions.len();
        f.functions.push(idx);
        self.functions.push(Function {
            name: name.to_string(),
            file: file_idx,
            index_in_file,
            start_line: start,
            end_line: end,
            parsed: false,
            entries: Vec::new(),
            entry_by_name: HashMap::new(),
        });
        self.function_by_name.insert(name.to_string(), idx);
        self.notify(DbEvent::FunctionInserted { function: idx });
        Ok(InsertOutcome::Inserted(idx))
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.function_by_name.get(name).map(|&i| &self.functions[i])
    }

    pub fn functions(&self) -> &[Function] {
        &self.functions
    }

    /// The function covering `line` of `file`.
    pub fn function_at_line(&self, file: &str, line: i32) -> Option<&Function> {
        let idx = self.file(file)?.function_at(line)?;
        self.functions.get(idx)
    }

    fn function_index(&self, name: &str) -> Result<Index> {
        self.function_by_name
            .get(name)
            .copied()
            .ok_or_else(|| DbError::UnknownFunction(name.to_string()))
    }

    pub fn mark_function_parsed(&mut self, function: &str) -> Result<()> {
        let idx = self.function_index(function)?;
        if !self.functions[idx].parsed {
            self.functions[idx].parsed = true;
            self.notify(DbEvent::FunctionParsed { function: idx });
        }
        Ok(())
    }

    // ── Entries ─────────────────────────────────────────────────────────────

    /// Add a plain code-location entry to a function.
    pub fn insert_entry(
        &mut self,
        function: &str,
        entry: &str,
        line: i32,
        index_in_line: i32,
        tooltip: &str,
    ) -> Result<InsertOutcome> {
        self.add_entry(function, Entry::new(entry, line, index_in_line, tooltip))
    }

    /// Add an entry for an instrumentation point.
    pub fn insert_inst_point(
        &mut self,
        function: &str,
        entry: &str,
        line: i32,
        index_in_line: i32,
        tooltip: &str,
        point: PointInfo,
    ) -> Result<InsertOutcome> {
        let mut row = Entry::new(entry, line, index_in_line, tooltip);
        row.point = Some(point);
        self.add_entry(function, row)
    }

    fn add_entry(&mut self, function: &str, row: Entry) -> Result<InsertOutcome> {
        let f_idx = self.function_index(function)?;
        let f = &mut self.functions[f_idx];
        if let Some(&e_idx) = f.entry_by_name.get(&row.name) {
            debug!("entry {}/{} already present", function, row.name);
            return Ok(InsertOutcome::AlreadyExists(e_idx));
        }
        let e_idx = f.entries.len();
        f.entry_by_name.insert(row.name.clone(), e_idx);
        f.entries.push(row);
        self.notify(DbEvent::EntryInserted {
            function: f_idx,
            entry: e_idx,
        });
        Ok(InsertOutcome::Inserted(e_idx))
    }

    pub fn entry(&self, function: &str, entry: &str) -> Option<&Entry> {
        self.function(function)?.entry(entry)
    }

    fn placement(&self, function: &str, entry: &str) -> Result<Placement> {
        let f_idx = self.function_index(function)?;
        let f = &self.functions[f_idx];
        let e_idx = f.entry_index(entry).ok_or_else(|| DbError::UnknownEntry {
            function: function.to_string(),
            entry: entry.to_string(),
        })?;
        Ok(Placement {
            file: f.file,
            function: f_idx,
            entry: e_idx,
        })
    }

    // ── PT pairs ────────────────────────────────────────────────────────────

    /// Register a (task, thread) pair; repeats return the existing index.
    pub fn insert_pt_pair(&mut self, task: i32, thread: i32) -> Index {
        let pair = PtPair { task, thread };
        if let Some(&idx) = self.pt_by_pair.get(&pair) {
            return idx;
        }
        let idx = self.pt_pairs.len();
        self.pt_pairs.push(pair);
        self.pt_by_pair.insert(pair, idx);
        idx
    }

    pub fn pt_pair_count(&self) -> usize {
        self.pt_pairs.len()
    }

    pub fn pt_pairs(&self) -> &[PtPair] {
        &self.pt_pairs
    }

    fn pt_index(&self, task: i32, thread: i32) -> Option<Index> {
        self.pt_by_pair.get(&PtPair { task, thread }).copied()
    }

    // ── Data ────────────────────────────────────────────────────────────────

    pub fn set_int(
        &mut self,
        function: &str,
        entry: &str,
        attr: &str,
        task: i32,
        thread: i32,
        value: i32,
    ) -> Result<()> {
        self.write(function, entry, attr, task, thread, Number::Int(value), Write::Set)
    }

    pub fn add_int(
        &mut self,
        function: &str,
        entry: &str,
        attr: &str,
        task: i32,
        thread: i32,
        value: i32,
    ) -> Result<()> {
        self.write(function, entry, attr, task, thread, Number::Int(value), Write::Add)
    }

    /// NaN and infinite values are dropped with a warning.
    pub fn set_double(
        &mut self,
        function: &str,
        entry: &str,
        attr: &str,
        task: i32,
        thread: i32,
        value: f64,
    ) -> Result<()> {
        self.write(function, entry, attr, task, thread, Number::Double(value), Write::Set)
    }

    /// NaN and infinite values are dropped with a warning.
    pub fn add_double(
        &mut self,
        function: &str,
        entry: &str,
        attr: &str,
        task: i32,
        thread: i32,
        value: f64,
    ) -> Result<()> {
        self.write(function, entry, attr, task, thread, Number::Double(value), Write::Add)
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        function: &str,
        entry: &str,
        attr: &str,
        task: i32,
        thread: i32,
        value: Number,
        mode: Write,
    ) -> Result<()> {
        let at = self.placement(function, entry)?;
        let a = self.attr_index(attr)?;
        let declared = self.attrs[a].data_type;
        let requested = match value {
            Number::Int(_) => DataType::Int,
            Number::Double(_) => DataType::Double,
        };
        if declared != requested {
            return Err(DbError::TypeMismatch {
                attr: attr.to_string(),
                declared,
                requested,
            });
        }
        if let Number::Double(v) = value {
            if !v.is_finite() {
                self.diag.nonfinite_value(function, entry, attr, v);
                DROPPED_VALUES.inc();
                return Ok(());
            }
        }

        let pt = self.insert_pt_pair(task, thread);
        let values = self
            .store
            .values
            .entry((at.key(), a))
            .or_insert_with(|| Values::empty(declared));
        let (old, new) = match (values, value) {
            (Values::Int(field), Number::Int(v)) => {
                let old = field.get(pt).copied();
                let new = match mode {
                    Write::Set => v,
                    Write::Add => old.unwrap_or(0).wrapping_add(v),
                };
                field.set(pt, new);
                (old.map(f64::from), f64::from(new))
            }
            (Values::Double(field), Number::Double(v)) => {
                let old = field.get(pt).copied();
                let new = match mode {
                    Write::Set => v,
                    Write::Add => old.unwrap_or(0.0) + v,
                };
                if !new.is_finite() {
                    self.diag.nonfinite_value(function, entry, attr, new);
                    DROPPED_VALUES.inc();
                    return Ok(());
                }
                field.set(pt, new);
                (old, new)
            }
            (values, _) => {
                return Err(DbError::TypeMismatch {
                    attr: attr.to_string(),
                    declared: values.data_type(),
                    requested,
                })
            }
        };

        self.stats.record(at, a, pt, old, new);
        self.notify(DbEvent::DataChanged {
            function: at.function,
            entry: at.entry,
            attr: a,
            pt,
        });
        Ok(())
    }

    fn lookup(
        &self,
        function: &str,
        entry: &str,
        attr: &str,
        task: i32,
        thread: i32,
    ) -> Option<(&Values, Index)> {
        let at = self.placement(function, entry).ok()?;
        let a = self.attr_by_tag.get(attr)?;
        let pt = self.pt_index(task, thread)?;
        Some((self.store.get(at.key(), *a)?, pt))
    }

    /// `None` when never written.
    pub fn get_int(
        &self,
        function: &str,
        entry: &str,
        attr: &str,
        task: i32,
        thread: i32,
    ) -> Option<i32> {
        match self.lookup(function, entry, attr, task, thread)? {
            (Values::Int(field), pt) => field.get(pt).copied(),
            (Values::Double(_), _) => None,
        }
    }

    /// `None` when never written.
    pub fn get_double(
        &self,
        function: &str,
        entry: &str,
        attr: &str,
        task: i32,
        thread: i32,
    ) -> Option<f64> {
        match self.lookup(function, entry, attr, task, thread)? {
            (Values::Double(field), pt) => field.get(pt).copied(),
            (Values::Int(_), _) => None,
        }
    }

    // ── Statistics ──────────────────────────────────────────────────────────

    /// One entry's values folded across pt pairs.
    pub fn entry_data_stat(
        &mut self,
        function: &str,
        entry: &str,
        attr: &str,
        per_entry: StatKind,
    ) -> Result<Option<f64>> {
        let at = self.placement(function, entry)?;
        let a = self.attr_index(attr)?;
        Ok(self.stats.entry_stat(at.key(), a, per_entry, &self.store))
    }

    /// Per-entry statistic folded across the function's entries.
    pub fn function_data_stat(
        &mut self,
        function: &str,
        attr: &str,
        per_entry: StatKind,
        rollup: StatKind,
    ) -> Result<Option<f64>> {
        let f = self.function_index(function)?;
        let a = self.attr_index(attr)?;
        Ok(self.stats.function_stat(f, a, per_entry, rollup, &self.store))
    }

    /// Per-entry statistic folded across every entry in the file.
    pub fn file_data_stat(
        &mut self,
        file: &str,
        attr: &str,
        per_entry: StatKind,
        rollup: StatKind,
    ) -> Result<Option<f64>> {
        let f = self.file_index(file)?;
        let a = self.attr_index(attr)?;
        Ok(self.stats.file_stat(f, a, per_entry, rollup, &self.store))
    }

    /// Per-entry statistic folded across every entry of the program.
    pub fn app_data_stat(
        &mut self,
        attr: &str,
        per_entry: StatKind,
        rollup: StatKind,
    ) -> Result<Option<f64>> {
        let a = self.attr_index(attr)?;
        Ok(self.stats.app_stat(a, per_entry, rollup, &self.store))
    }

    /// Rescan one entry's values, replacing its cached statistics.
    pub fn rebuild_entry_stats(
        &mut self,
        function: &str,
        entry: &str,
        attr: &str,
    ) -> Result<Option<EntryStats>> {
        let at = self.placement(function, entry)?;
        let a = self.attr_index(attr)?;
        Ok(self
            .stats
            .rebuild_entry_stats(at.key(), a, &self.store)
            .cloned())
    }

    pub fn cached_entry_stats(
        &self,
        function: &str,
        entry: &str,
        attr: &str,
    ) -> Option<&EntryStats> {
        let at = self.placement(function, entry).ok()?;
        let a = self.attr_by_tag.get(attr)?;
        self.stats.entry_stats(at.key(), *a)
    }

    pub fn stats_rebuilds(&self) -> u64 {
        self.stats.rebuilds()
    }

    // ── Actions ─────────────────────────────────────────────────────────────

    pub fn declare_action(
        &mut self,
        tag: &str,
        menu_text: &str,
        tooltip: &str,
        initial_state: &str,
    ) -> Result<Index> {
        if self.action_by_tag.contains_key(tag) {
            return Err(DbError::Redeclared {
                what: "action",
                name: tag.to_string(),
            });
        }
        let idx = self.actions.len();
        self.actions.push(ActionDecl {
            tag: tag.to_string(),
            menu_text: menu_text.to_string(),
            tooltip: tooltip.to_string(),
            initial_state: initial_state.to_string(),
            states: Default::default(),
            transitions: Default::default(),
        });
        self.action_by_tag.insert(tag.to_string(), idx);
        Ok(idx)
    }

    pub fn action(&self, tag: &str) -> Option<&ActionDecl> {
        self.action_by_tag.get(tag).map(|&i| &self.actions[i])
    }

    pub fn actions(&self) -> &[ActionDecl] {
        &self.actions
    }

    fn action_index(&self, tag: &str) -> Result<Index> {
        self.action_by_tag
            .get(tag)
            .copied()
            .ok_or_else(|| DbError::UnknownAction(tag.to_string()))
    }

    pub fn declare_action_state(
        &mut self,
        action: &str,
        state: &str,
        decl: ActionStateDecl,
    ) -> Result<()> {
        let a = self.action_index(action)?;
        let states = &mut self.actions[a].states;
        if states.contains_key(state) {
            return Err(DbError::Redeclared {
                what: "action state",
                name: format!("{}.{}", action, state),
            });
        }
        states.insert(state.to_string(), decl);
        Ok(())
    }

    pub fn enable_transition(&mut self, action: &str, from: &str, to: &str) -> Result<()> {
        let a = self.action_index(action)?;
        let decl = &mut self.actions[a];
        for state in [from, to] {
            if !decl.states.contains_key(state) {
                return Err(DbError::UnknownActionState {
                    action: action.to_string(),
                    state: state.to_string(),
                });
            }
        }
        if !decl.transitions.insert((from.to_string(), to.to_string())) {
            self.diag
                .duplicate("transition", &format!("{}:{}->{}", action, from, to));
        }
        Ok(())
    }

    /// Make an action available at an entry. Repeats are ignored.
    pub fn enable_action(&mut self, function: &str, entry: &str, action: &str) -> Result<()> {
        let at = self.placement(function, entry)?;
        let a = self.action_index(action)?;
        let row = &mut self.functions[at.function].entries[at.entry];
        if !row.enabled.insert(a) {
            self.diag
                .duplicate("enabled action", &format!("{}/{}:{}", function, entry, action));
        }
        Ok(())
    }

    /// Current state of an action at an entry for one pt pair.
    /// Current state of `action` at an entry for the process `task`.
    pub fn action_state(
        &self,
        function: &str,
        entry: &str,
        action: &str,
        task: i32,
    ) -> Option<&str> {
        let at = self.placement(function, entry).ok()?;
        let a = *self.action_by_tag.get(action)?;
        let row = &self.functions[at.function].entries[at.entry];
        if !row.enabled.contains(&a) {
            return None;
        }
        row.states
            .get(&(a, Some(task)))
            .or_else(|| row.states.get(&(a, None)))
            .map(String::as_str)
            .or(Some(self.actions[a].initial_state.as_str()))
    }

    /// Move an action to `state` for process `task`; `ALL_TASKS` addresses
    /// every process. Actions are scoped to whole processes, so no pt pair
    /// is registered.
    ///
    /// Transitions outside the declared graph are reported and ignored.
    pub fn set_action_state(
        &mut self,
        function: &str,
        entry: &str,
        action: &str,
        task: i32,
        state: &str,
    ) -> Result<()> {
        let at = self.placement(function, entry)?;
        let a = self.action_index(action)?;
        if !self.actions[a].states.contains_key(state) {
            return Err(DbError::UnknownActionState {
                action: action.to_string(),
                state: state.to_string(),
            });
        }
        if !self.functions[at.function].entries[at.entry].enabled.contains(&a) {
            return Err(DbError::ActionNotEnabled {
                function: function.to_string(),
                entry: entry.to_string(),
                action: action.to_string(),
            });
        }

        let scope = (task != ALL_TASKS).then_some(task);

        // A blanket change moves every process, so each current state must allow it.
        let row = &self.functions[at.function].entries[at.entry];
        let initial = &self.actions[a].initial_state;
        let mut current: Vec<String> = match scope {
            Some(task) => vec![row
                .states
                .get(&(a, Some(task)))
                .or_else(|| row.states.get(&(a, None)))
                .unwrap_or(initial)
                .clone()],
            None => {
                let blanket = row.states.get(&(a, None)).unwrap_or(initial).clone();
                let per_task = row
                    .states
                    .iter()
                    .filter(|((act, task), _)| *act == a && task.is_some())
                    .map(|(_, s)| s.clone());
                std::iter::once(blanket).chain(per_task).collect()
            }
        };
        current.sort();
        current.dedup();
        current.retain(|from| from != state);
        if current.is_empty() {
            return Ok(());
        }
        if let Some(from) = current.iter().find(|from| !self.actions[a].allows(from, state)) {
            let from = from.clone();
            self.diag.illegal_transition(action, &from, state);
            return Ok(());
        }

        let row = &mut self.functions[at.function].entries[at.entry];
        if scope.is_none() {
            // A blanket change overrides per-process states.
            row.states.retain(|(act, _), _| *act != a);
        }
        row.states.insert((a, scope), state.to_string());
        self.notify(DbEvent::ActionStateChanged {
            function: at.function,
            entry: at.entry,
            action: a,
            state: state.to_string(),
        });
        Ok(())
    }

    // ── Messages ────────────────────────────────────────────────────────────

    pub fn declare_message_folder(&mut self, tag: &str, title: &str) -> Result<Index> {
        if self.folder_by_tag.contains_key(tag) {
            return Err(DbError::Redeclared {
                what: "message folder",
                name: tag.to_string(),
            });
        }
        let idx = self.folders.len();
        self.folders.push(MessageFolder {
            tag: tag.to_string(),
            title: title.to_string(),
            messages: Vec::new(),
        });
        self.folder_by_tag.insert(tag.to_string(), idx);
        Ok(idx)
    }

    pub fn folder(&self, tag: &str) -> Option<&MessageFolder> {
        self.folder_by_tag.get(tag).map(|&i| &self.folders[i])
    }

    pub fn folders(&self) -> &[MessageFolder] {
        &self.folders
    }

    /// Append a message; returns its number within the folder.
    pub fn add_message(
        &mut self,
        folder: &str,
        text: &str,
        tracebacks: Vec<Traceback>,
    ) -> Result<usize> {
        let f = self
            .folder_by_tag
            .get(folder)
            .copied()
            .ok_or_else(|| DbError::UnknownFolder(folder.to_string()))?;
        let messages = &mut self.folders[f].messages;
        let number = messages.len();
        messages.push(Message {
            number,
            lines: split_lines(text),
            tracebacks,
        });
        self.notify(DbEvent::MessageAdded { folder: f, number });
        Ok(number)
    }

    pub(crate) fn values_at(&self, entry: EntryKey, attr: Index) -> Option<&Values> {
        self.store.get(entry, attr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use toolgear_shared::types::program::{PointKind, PointLocation};

    fn calls_db() -> ProgramDatabase {
        let mut db = ProgramDatabase::default();
        db.declare_data_attr("calls", "Number of calls", DataType::Int, SuggestedStat::default())
            .unwrap();
        db.insert_function("foo", "a.c", 10, 20).unwrap();
        db.insert_entry("foo", "E1", 15, 0, "tip").unwrap();
        db
    }

    #[test]
    fn test_calls_scenario() {
        let mut db = calls_db();
        for _ in 0..3 {
            db.add_int("foo", "E1", "calls", 0, 0, 1).unwrap();
        }
        assert_eq!(db.get_int("foo", "E1", "calls", 0, 0), Some(3));
        assert_eq!(
            db.function_data_stat("foo", "calls", StatKind::Sum, StatKind::Sum)
                .unwrap(),
            Some(3.0)
        );
    }

    #[test]
    fn test_pt_pairs_deduplicate() {
        let mut db = ProgramDatabase::default();
        for task in [0, 1] {
            db.insert_pt_pair(task, task);
            db.insert_pt_pair(1 - task, 7);
            db.insert_pt_pair(task, task);
        }
        assert_eq!(db.pt_pair_count(), 4);
    }

    #[test]
    fn test_line_ranges_normalize() {
        let mut db = ProgramDatabase::default();
        db.insert_function("inverted", "a.c", 20, 10).unwrap();
        db.insert_function("zero", "a.c", 0, 5).unwrap();
        db.insert_function("ok", "a.c", 3, 4).unwrap();

        let inverted = db.function("inverted").unwrap();
        assert_eq!((inverted.start_line, inverted.end_line), (-1, -1));
        let zero = db.function("zero").unwrap();
        assert_eq!((zero.start_line, zero.end_line), (-1, -1));
        assert_eq!(db.function_at_line("a.c", 4).unwrap().name, "ok");
        assert!(db.function_at_line("a.c", 15).is_none());
    }

    #[test]
    fn test_duplicate_function_is_not_an_error() {
        let mut db = ProgramDatabase::default();
        let first = db.insert_function("f", "a.c", 1, 5).unwrap();
        let again = db.insert_function("f", "b.c", 7, 9).unwrap();
        assert_eq!(first, InsertOutcome::Inserted(0));
        assert_eq!(again, InsertOutcome::AlreadyExists(0));
        assert_eq!(db.function("f").unwrap().start_line, 1);
        assert!(db.file("b.c").is_none());
    }

    #[test]
    fn test_overlap_policies() {
        for (policy, owner) in [
            (OverlapPolicy::LastWins, Some("second")),
            (OverlapPolicy::FirstWins, Some("first")),
        ] {
            let mut db = ProgramDatabase::new(policy);
            db.insert_function("first", "a.c", 1, 10).unwrap();
            db.insert_function("second", "a.c", 8, 12).unwrap();
            assert_eq!(
                db.function_at_line("a.c", 9).map(|f| f.name.as_str()),
                owner
            );
            assert_eq!(db.function_at_line("a.c", 12).unwrap().name, "second");
        }

        let mut db = ProgramDatabase::new(OverlapPolicy::Reject);
        db.insert_function("first", "a.c", 1, 10).unwrap();
        assert!(matches!(
            db.insert_function("second", "a.c", 8, 12),
            Err(DbError::OverlappingFunction { line: 8, .. })
        ));
        assert!(db.function("second").is_none());

        db.insert_function("third", "b.c", 8, 12).unwrap();
        assert!(matches!(
            db.insert_function("fourth", "c.c", 1, 2),
            Ok(InsertOutcome::Inserted(_))
        ));
        assert!(matches!(
            db.insert_function("late", "c.c", 2, 3),
            Err(DbError::OverlappingFunction { .. })
        ));
        assert_eq!(db.files().len(), 3);
    }

    #[test]
    fn test_overlap_inside_and_around_existing_ranges() {
        let mut db = ProgramDatabase::new(OverlapPolicy::LastWins);
        db.insert_function("outer", "a.c", 1, 100).unwrap();
        db.insert_function("inner", "a.c", 40, 60).unwrap();
        let owner = |db: &ProgramDatabase, line| {
            db.function_at_line("a.c", line).map(|f| f.name.clone())
        };
        assert_eq!(owner(&db, 39).as_deref(), Some("outer"));
        assert_eq!(owner(&db, 50).as_deref(), Some("inner"));
        assert_eq!(owner(&db, 61).as_deref(), Some("outer"));
        assert_eq!(owner(&db, 101), None);
        assert_eq!(db.diagnostics().occurrences("line:a.c:40"), 1);

        let mut db = ProgramDatabase::new(OverlapPolicy::FirstWins);
        db.insert_function("mid", "a.c", 40, 60).unwrap();
        db.insert_function("wide", "a.c", 1, 100).unwrap();
        assert_eq!(db.function_at_line("a.c", 1).unwrap().name, "wide");
        assert_eq!(db.function_at_line("a.c", 50).unwrap().name, "mid");
        assert_eq!(db.function_at_line("a.c", 100).unwrap().name, "wide");
    }

    #[test]
    fn test_huge_line_range_stays_small() {
        let mut db = ProgramDatabase::default();
        db.insert_function("f", "a.c", 1, 20_000_000).unwrap();
        db.insert_function("g", "a.c", 5, i32::MAX).unwrap();
        assert!(db.file("a.c").unwrap().line_map.span_count() < 8);
        assert_eq!(db.function_at_line("a.c", 4).unwrap().name, "f");
        assert_eq!(db.function_at_line("a.c", 19_999_999).unwrap().name, "g");
        assert_eq!(db.function_at_line("a.c", i32::MAX).unwrap().name, "g");
    }

    #[test]
    fn test_file_insert_notifies_once() {
        let mut db = ProgramDatabase::default();
        let mut events = db.subscribe();
        assert_eq!(db.insert_file("a.c"), 0);
        assert_eq!(db.insert_file("a.c"), 0);
        assert_eq!(events.try_recv().unwrap(), DbEvent::FileInserted { file: 0 });
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn test_nonfinite_doubles_are_dropped() {
        let mut db = ProgramDatabase::default();
        db.declare_data_attr("time", "t", DataType::Double, SuggestedStat::default())
            .unwrap();
        db.insert_function("foo", "a.c", 1, 2).unwrap();
        db.insert_entry("foo", "E", 1, 0, "").unwrap();
        let mut events = db.subscribe();

        db.add_double("foo", "E", "time", 0, 0, 1.5).unwrap();
        db.add_double("foo", "E", "time", 0, 0, f64::NAN).unwrap();
        db.set_double("foo", "E", "time", 0, 0, f64::INFINITY).unwrap();

        assert_eq!(db.get_double("foo", "E", "time", 0, 0), Some(1.5));
        assert!(matches!(events.try_recv(), Ok(DbEvent::DataChanged { .. })));
        assert!(events.try_recv().is_err());
        assert_eq!(db.diagnostics().occurrences("nonfinite:foo:E:time"), 2);
    }

    #[test]
    fn test_schema_errors() {
        let mut db = calls_db();
        assert!(matches!(
            db.declare_data_attr("calls", "again", DataType::Int, SuggestedStat::default()),
            Err(DbError::Redeclared { .. })
        ));
        assert!(matches!(
            db.add_double("foo", "E1", "calls", 0, 0, 1.0),
            Err(DbError::TypeMismatch { .. })
        ));
        assert!(matches!(
            db.add_int("bar", "E1", "calls", 0, 0, 1),
            Err(DbError::UnknownFunction(_))
        ));
        assert!(matches!(
            db.add_int("foo", "E9", "calls", 0, 0, 1),
            Err(DbError::UnknownEntry { .. })
        ));
        assert!(matches!(
            db.add_int("foo", "E1", "size", 0, 0, 1),
            Err(DbError::UnknownAttr(_))
        ));
        assert!(matches!(
            db.add_message("nowhere", "text", vec![]),
            Err(DbError::UnknownFolder(_))
        ));
    }

    #[test]
    fn test_messages_number_and_split() {
        let mut db = ProgramDatabase::default();
        db.declare_message_folder("errors", "Errors").unwrap();
        assert_eq!(db.add_message("errors", "one", vec![]).unwrap(), 0);
        assert_eq!(db.add_message("errors", "a\nb\nc", vec![]).unwrap(), 1);
        let folder = db.folder("errors").unwrap();
        assert_eq!(folder.messages[1].lines, vec!["a", "b", "c"]);
        assert_eq!(folder.messages[1].text(), "a\nb\nc");
    }

    #[test]
    fn test_action_states_follow_transitions() {
        let mut db = calls_db();
        db.insert_inst_point(
            "foo",
            "foo:entry",
            10,
            0,
            "before entry of foo",
            PointInfo {
                kind: PointKind::FuncEntry,
                location: PointLocation::Before,
                callee: String::new(),
                call_index: 0,
            },
        )
        .unwrap();
        db.declare_action("count", "Count", "", "off").unwrap();
        for state in ["off", "on"] {
            db.declare_action_state("count", state, ActionStateDecl::default())
                .unwrap();
        }
        db.enable_transition("count", "off", "on").unwrap();

        assert!(matches!(
            db.set_action_state("foo", "foo:entry", "count", -1, "on"),
            Err(DbError::ActionNotEnabled { .. })
        ));
        db.enable_action("foo", "foo:entry", "count").unwrap();
        assert_eq!(
            db.action_state("foo", "foo:entry", "count", 0),
            Some("off")
        );

        db.set_action_state("foo", "foo:entry", "count", -1, "on")
            .unwrap();
        assert_eq!(db.action_state("foo", "foo:entry", "count", 3), Some("on"));

        // on -> off was never enabled
        db.set_action_state("foo", "foo:entry", "count", 2, "off")
            .unwrap();
        assert_eq!(db.action_state("foo", "foo:entry", "count", 2), Some("on"));
        assert!(matches!(
            db.set_action_state("foo", "foo:entry", "count", 2, "paused"),
            Err(DbError::UnknownActionState { .. })
        ));
    }

    #[test]
    fn test_process_scoped_state_registers_no_pt_pair() {
        let mut db = calls_db();
        db.insert_entry("foo", "foo:entry", 10, 0, "").unwrap();
        db.declare_action("count", "Count", "", "off").unwrap();
        for state in ["off", "on"] {
            db.declare_action_state("count", state, ActionStateDecl::default())
                .unwrap();
        }
        db.enable_transition("count", "off", "on").unwrap();
        db.enable_action("foo", "foo:entry", "count").unwrap();
        let pairs = db.pt_pair_count();

        db.set_action_state("foo", "foo:entry", "count", 4, "on")
            .unwrap();
        assert_eq!(db.pt_pair_count(), pairs);
        assert!(db.pt_pairs().iter().all(|p| p.thread >= 0));
        assert_eq!(db.action_state("foo", "foo:entry", "count", 4), Some("on"));
        assert_eq!(db.action_state("foo", "foo:entry", "count", 5), Some("off"));
    }
}
