//! Snapshot persistence and merge
//!
//! A snapshot is one MD document. Sections are declared so that every link
//! points backwards: pt pairs and data attributes first, then files,
//! functions, entries, and finally the data, action and message sections
//! that refer to them.
//!
//! Merging reads the whole document into a scratch database, checks it
//! against this one, and only then adds anything. Values go through the
//! normal add path so statistics and subscribers see every change.

use super::model::LineMap;
use super::{
    ActionStateDecl, DbError, Index, PointInfo, ProgramDatabase, PtPair, Result, Values,
};
use crate::config::OverlapPolicy;
use crate::metrics::SNAPSHOT_MERGES;
use std::collections::HashMap;
use std::fmt::Display;
use std::path::Path;
use std::str::FromStr;
use toolgear_shared::md::{
    read_document, write_document, FieldDecl, FieldType, MdDocument, MdEntry, MdError, Scalar,
    Section, SectionSchema,
};
use toolgear_shared::types::program::Traceback;
use tracing::{debug, info};

const PT_PAIR: &str = "pt_pair";
const DATA_ATTR: &str = "data_attr";
const FILE: &str = "file";
const FUNCTION: &str = "function";
const ENTRY: &str = "entry";
const DATA: &str = "data";
const ACTION: &str = "action";
const ACTION_STATE: &str = "action_state";
const TRANSITION: &str = "transition";
const ENABLED_ACTION: &str = "enabled_action";
const MESSAGE_FOLDER: &str = "message_folder";
const MESSAGE: &str = "message";

fn int(name: &str) -> FieldDecl {
    FieldDecl::new(name, FieldType::Int)
}

fn double(name: &str) -> FieldDecl {
    FieldDecl::new(name, FieldType::Double)
}

fn string(name: &str) -> FieldDecl {
    FieldDecl::new(name, FieldType::String)
}

fn link(name: &str, section: &str) -> FieldDecl {
    FieldDecl::new(name, FieldType::Link(section.to_string())).required()
}

fn schemas() -> Vec<SectionSchema> {
    vec![
        SectionSchema::new(PT_PAIR)
            .indexed()
            .field(int("task").required())
            .field(int("thread").required()),
        SectionSchema::new(DATA_ATTR)
            .field(string("description"))
            .field(string("data_type").required())
            .field(string("suggested")),
        SectionSchema::new(FILE)
            .field(string("full_path"))
            .field(int("parsed")),
        SectionSchema::new(FUNCTION)
            .field(link("file", FILE))
            .field(int("start_line"))
            .field(int("end_line"))
            .field(int("parsed")),
        SectionSchema::new(ENTRY)
            .field(link("function", FUNCTION))
            .field(string("entry").required())
            .field(int("line"))
            .field(int("index_in_line"))
            .field(string("tooltip"))
            .field(string("point_kind"))
            .field(string("point_location"))
            .field(string("callee"))
            .field(int("call_index")),
        SectionSchema::new(DATA)
            .field(link("entry", ENTRY))
            .field(link("attr", DATA_ATTR))
            .field(int("int_values").repeated())
            .field(double("double_values").repeated()),
        SectionSchema::new(ACTION)
            .field(string("menu_text"))
            .field(string("tooltip"))
            .field(string("initial_state").required()),
        SectionSchema::new(ACTION_STATE)
            .field(link("action", ACTION))
            .field(string("state").required())
            .field(string("pixmap"))
            .field(string("menu_text"))
            .field(string("tooltip")),
        SectionSchema::new(TRANSITION)
            .field(link("action", ACTION))
            .field(string("from").required())
            .field(string("to").required()),
        SectionSchema::new(ENABLED_ACTION)
            .field(link("entry", ENTRY))
            .field(link("action", ACTION))
            .field(string("state"))
            .field(int("state_tasks").repeated())
            .field(string("task_states").repeated()),
        SectionSchema::new(MESSAGE_FOLDER).field(string("title")),
        SectionSchema::new(MESSAGE)
            .field(link("folder", MESSAGE_FOLDER))
            .field(int("number").required())
            .field(string("lines").repeated())
            .field(string("tracebacks").repeated()),
    ]
}

fn entry_name(function: &str, entry: &str) -> String {
    format!("{}\t{}", function, entry)
}

fn section<'a>(doc: &'a MdDocument, name: &str) -> Result<&'a Section> {
    doc.section(name)
        .ok_or_else(|| MdError::UnknownSection(name.to_string()).into())
}

fn text(e: &MdEntry, field: &str) -> String {
    e.get_str(field).unwrap_or_default().to_string()
}

fn parse<T>(what: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    value
        .parse()
        .map_err(|err| DbError::Incompatible(format!("bad {} {:?}: {}", what, value, err)))
}

/// What a merge added.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub values: usize,
    pub messages: usize,
    pub skipped_messages: usize,
}

impl ProgramDatabase {
    /// Dump the whole database as an MD document.
    pub fn to_document(&self) -> Result<MdDocument> {
        let mut doc = MdDocument::new();
        for schema in schemas() {
            doc.declare_section(schema)?;
        }

        for pair in &self.pt_pairs {
            let name = format!("{}:{}", pair.task, pair.thread);
            doc.insert_entry(PT_PAIR, &name)?;
            doc.set(PT_PAIR, &name, "task", Scalar::Int(pair.task))?;
            doc.set(PT_PAIR, &name, "thread", Scalar::Int(pair.thread))?;
        }

        for attr in &self.attrs {
            doc.insert_entry(DATA_ATTR, &attr.tag)?;
            doc.set(DATA_ATTR, &attr.tag, "description", Scalar::Str(attr.description.clone()))?;
            doc.set(DATA_ATTR, &attr.tag, "data_type", Scalar::Str(attr.data_type.to_string()))?;
            doc.set(DATA_ATTR, &attr.tag, "suggested", Scalar::Str(attr.suggested.to_string()))?;
        }

        for file in &self.files {
            doc.insert_entry(FILE, &file.name)?;
            if let Some(path) = &file.full_path {
                doc.set(FILE, &file.name, "full_path", Scalar::Str(path.clone()))?;
            }
            doc.set(FILE, &file.name, "parsed", Scalar::Int(file.parsed as i32))?;
        }

        for function in &self.functions {
            let name = &function.name;
            let file = &self.files[function.file].name;
            doc.insert_entry(FUNCTION, name)?;
            doc.set(FUNCTION, name, "file", Scalar::Link(file.clone()))?;
            doc.set(FUNCTION, name, "start_line", Scalar::Int(function.start_line))?;
            doc.set(FUNCTION, name, "end_line", Scalar::Int(function.end_line))?;
            doc.set(FUNCTION, name, "parsed", Scalar::Int(function.parsed as i32))?;

            for entry in &function.entries {
                let row = entry_name(name, &entry.name);
                doc.insert_entry(ENTRY, &row)?;
                doc.set(ENTRY, &row, "function", Scalar::Link(name.clone()))?;
                doc.set(ENTRY, &row, "entry", Scalar::Str(entry.name.clone()))?;
                doc.set(ENTRY, &row, "line", Scalar::Int(entry.line))?;
                doc.set(ENTRY, &row, "index_in_line", Scalar::Int(entry.index_in_line))?;
                doc.set(ENTRY, &row, "tooltip", Scalar::Str(entry.tooltip.clone()))?;
                if let Some(point) = &entry.point {
                    doc.set(ENTRY, &row, "point_kind", Scalar::Str(point.kind.to_string()))?;
                    doc.set(
                        ENTRY,
                        &row,
                        "point_location",
                        Scalar::Str(point.location.to_string()),
                    )?;
                    doc.set(ENTRY, &row, "callee", Scalar::Str(point.callee.clone()))?;
                    doc.set(ENTRY, &row, "call_index", Scalar::Int(point.call_index))?;
                }
            }
        }

        // Sorted so identical databases write identical documents.
        let mut keys: Vec<_> = self.store.values.keys().copied().collect();
        keys.sort_unstable();
        for key @ ((f, e), a) in keys {
            let Some(values) = self.store.values.get(&key) else {
                continue;
            };
            let function = &self.functions[f];
            let entry = entry_name(&function.name, &function.entries[e].name);
            let tag = &self.attrs[a].tag;
            let row = format!("{}\t{}", entry, tag);
            doc.insert_entry(DATA, &row)?;
            doc.set(DATA, &row, "entry", Scalar::Link(entry.clone()))?;
            doc.set(DATA, &row, "attr", Scalar::Link(tag.clone()))?;
            match values {
                Values::Int(field) => {
                    doc.reserve(DATA, &row, "int_values", field.len())?;
                    for (pt, &v) in field.iter() {
                        doc.set_at(DATA, &row, "int_values", pt, Scalar::Int(v))?;
                    }
                }
                Values::Double(field) => {
                    doc.reserve(DATA, &row, "double_values", field.len())?;
                    for (pt, &v) in field.iter() {
                        doc.set_at(DATA, &row, "double_values", pt, Scalar::Double(v))?;
                    }
                }
            }
        }

        for action in &self.actions {
            let tag = &action.tag;
            doc.insert_entry(ACTION, tag)?;
            doc.set(ACTION, tag, "menu_text", Scalar::Str(action.menu_text.clone()))?;
            doc.set(ACTION, tag, "tooltip", Scalar::Str(action.tooltip.clone()))?;
            doc.set(ACTION, tag, "initial_state", Scalar::Str(action.initial_state.clone()))?;
            for (state, decl) in &action.states {
                let row = format!("{}\t{}", tag, state);
                doc.insert_entry(ACTION_STATE, &row)?;
                doc.set(ACTION_STATE, &row, "action", Scalar::Link(tag.clone()))?;
                doc.set(ACTION_STATE, &row, "state", Scalar::Str(state.clone()))?;
                doc.set(ACTION_STATE, &row, "pixmap", Scalar::Str(decl.pixmap.clone()))?;
                doc.set(ACTION_STATE, &row, "menu_text", Scalar::Str(decl.menu_text.clone()))?;
                doc.set(ACTION_STATE, &row, "tooltip", Scalar::Str(decl.tooltip.clone()))?;
            }
            for (from, to) in &action.transitions {
                let row = format!("{}\t{}\t{}", tag, from, to);
                doc.insert_entry(TRANSITION, &row)?;
                doc.set(TRANSITION, &row, "action", Scalar::Link(tag.clone()))?;
                doc.set(TRANSITION, &row, "from", Scalar::Str(from.clone()))?;
                doc.set(TRANSITION, &row, "to", Scalar::Str(to.clone()))?;
            }
        }

        for function in &self.functions {
            for entry in &function.entries {
                let at = entry_name(&function.name, &entry.name);
                for &a in &entry.enabled {
                    let tag = &self.actions[a].tag;
                    let row = format!("{}\t{}", at, tag);
                    doc.insert_entry(ENABLED_ACTION, &row)?;
                    doc.set(ENABLED_ACTION, &row, "entry", Scalar::Link(at.clone()))?;
                    doc.set(ENABLED_ACTION, &row, "action", Scalar::Link(tag.clone()))?;
                    let per_task = entry
                        .states
                        .iter()
                        .filter(|((act, _), _)| *act == a)
                        .filter_map(|((_, scope), state)| scope.map(|task| (task, state)));
                    for (i, (task, state)) in per_task.enumerate() {
                        doc.set_at(ENABLED_ACTION, &row, "state_tasks", i, Scalar::Int(task))?;
                        doc.set_at(ENABLED_ACTION, &row, "task_states", i, Scalar::Str(state.clone()))?;
                    }
                    if let Some(state) = entry.states.get(&(a, None)) {
                        doc.set(ENABLED_ACTION, &row, "state", Scalar::Str(state.clone()))?;
                    }
                }
            }
        }

        for folder in &self.folders {
            doc.insert_entry(MESSAGE_FOLDER, &folder.tag)?;
            doc.set(MESSAGE_FOLDER, &folder.tag, "title", Scalar::Str(folder.title.clone()))?;
            for message in &folder.messages {
                let row = format!("{}\t{}", folder.tag, message.number);
                doc.insert_entry(MESSAGE, &row)?;
                doc.set(MESSAGE, &row, "folder", Scalar::Link(folder.tag.clone()))?;
                doc.set(MESSAGE, &row, "number", Scalar::Int(message.number as i32))?;
                doc.reserve(MESSAGE, &row, "lines", message.lines.len())?;
                for (i, line) in message.lines.iter().enumerate() {
                    doc.set_at(MESSAGE, &row, "lines", i, Scalar::Str(line.clone()))?;
                }
                for (i, tb) in message.tracebacks.iter().enumerate() {
                    doc.set_at(MESSAGE, &row, "tracebacks", i, Scalar::Str(tb.to_wire()))?;
                }
            }
        }

        Ok(doc)
    }

    /// Rebuild a database from an MD document.
    pub fn from_document(doc: &MdDocument) -> Result<Self> {
        let mut db = ProgramDatabase::default();

        let mut pts: HashMap<usize, PtPair> = HashMap::new();
        for (pos, e) in section(doc, PT_PAIR)?.entries().iter().enumerate() {
            let pair = PtPair {
                task: e.get_int("task").unwrap_or_default(),
                thread: e.get_int("thread").unwrap_or_default(),
            };
            db.insert_pt_pair(pair.task, pair.thread);
            let index = e.index.map_or(pos, |i| i as usize);
            pts.insert(index, pair);
        }
        let pair_at = |pt: usize| {
            pts.get(&pt).copied().ok_or_else(|| {
                DbError::Incompatible(format!("value for unknown pt pair {}", pt))
            })
        };

        for e in section(doc, DATA_ATTR)?.entries() {
            let suggested = match e.get_str("suggested") {
                Some(s) => parse("statistic", s)?,
                None => Default::default(),
            };
            db.declare_data_attr(
                &e.name,
                &text(e, "description"),
                parse("data type", &text(e, "data_type"))?,
                suggested,
            )?;
        }

        for e in section(doc, FILE)?.entries() {
            db.insert_file(&e.name);
            if let Some(path) = e.get_str("full_path") {
                db.set_file_full_path(&e.name, path)?;
            }
            if e.get_int("parsed") == Some(1) {
                db.mark_file_parsed(&e.name)?;
            }
        }

        for e in section(doc, FUNCTION)?.entries() {
            db.insert_function(
                &e.name,
                &text(e, "file"),
                e.get_int("start_line").unwrap_or(-1),
                e.get_int("end_line").unwrap_or(-1),
            )?;
            if e.get_int("parsed") == Some(1) {
                db.mark_function_parsed(&e.name)?;
            }
        }

        for e in section(doc, ENTRY)?.entries() {
            let function = text(e, "function");
            let name = text(e, "entry");
            let line = e.get_int("line").unwrap_or(-1);
            let index_in_line = e.get_int("index_in_line").unwrap_or(0);
            let tooltip = text(e, "tooltip");
            match e.get_str("point_kind") {
                Some(kind) => {
                    let point = PointInfo {
                        kind: parse("point type", kind)?,
                        location: parse("point location", &text(e, "point_location"))?,
                        callee: text(e, "callee"),
                        call_index: e.get_int("call_index").unwrap_or(0),
                    };
                    db.insert_inst_point(&function, &name, line, index_in_line, &tooltip, point)?;
                }
                None => {
                    db.insert_entry(&function, &name, line, index_in_line, &tooltip)?;
                }
            }
        }

        for e in section(doc, DATA)?.entries() {
            let target = doc
                .entry(ENTRY, &text(e, "entry"))
                .ok_or_else(|| DbError::Incompatible(format!("data row {:?}", e.name)))?;
            let function = text(target, "function");
            let entry = text(target, "entry");
            let attr = text(e, "attr");
            if let Some(values) = e.repeated("int_values") {
                for (pt, v) in values.iter() {
                    let pair = pair_at(pt)?;
                    let v = v.as_int().unwrap_or_default();
                    db.set_int(&function, &entry, &attr, pair.task, pair.thread, v)?;
                }
            }
            if let Some(values) = e.repeated("double_values") {
                for (pt, v) in values.iter() {
                    let pair = pair_at(pt)?;
                    let v = v.as_double().unwrap_or_default();
                    db.set_double(&function, &entry, &attr, pair.task, pair.thread, v)?;
                }
            }
        }

        for e in section(doc, ACTION)?.entries() {
            db.declare_action(
                &e.name,
                &text(e, "menu_text"),
                &text(e, "tooltip"),
                &text(e, "initial_state"),
            )?;
        }
        for e in section(doc, ACTION_STATE)?.entries() {
            let decl = ActionStateDecl {
                pixmap: text(e, "pixmap"),
                menu_text: text(e, "menu_text"),
                tooltip: text(e, "tooltip"),
            };
            db.declare_action_state(&text(e, "action"), &text(e, "state"), decl)?;
        }
        for e in section(doc, TRANSITION)?.entries() {
            db.enable_transition(&text(e, "action"), &text(e, "from"), &text(e, "to"))?;
        }

        for e in section(doc, ENABLED_ACTION)?.entries() {
            let target = doc
                .entry(ENTRY, &text(e, "entry"))
                .ok_or_else(|| DbError::Incompatible(format!("enabled action {:?}", e.name)))?;
            let function = text(target, "function");
            let entry = text(target, "entry");
            let action = text(e, "action");
            db.enable_action(&function, &entry, &action)?;

            // Restored as saved; transitions were checked when they happened.
            let at = db.placement(&function, &entry)?;
            let a = db.action_index(&action)?;
            let mut states: Vec<(Option<i32>, String)> = Vec::new();
            if let Some(state) = e.get_str("state") {
                states.push((None, state.to_string()));
            }
            if let (Some(tasks), Some(per_task)) =
                (e.repeated("state_tasks"), e.repeated("task_states"))
            {
                for (i, state) in per_task.iter() {
                    let task = tasks.get(i).and_then(Scalar::as_int).ok_or_else(|| {
                        DbError::Incompatible(format!("action state {} of {:?}", i, e.name))
                    })?;
                    states.push((Some(task), state.as_str().unwrap_or_default().to_string()));
                }
            }
            let row = &mut db.functions[at.function].entries[at.entry];
            for (scope, state) in states {
                row.states.insert((a, scope), state);
            }
        }

        for e in section(doc, MESSAGE_FOLDER)?.entries() {
            db.declare_message_folder(&e.name, &text(e, "title"))?;
        }
        for e in section(doc, MESSAGE)?.entries() {
            let lines: Vec<&str> = e
                .repeated("lines")
                .map(|l| l.iter().filter_map(|(_, s)| s.as_str()).collect())
                .unwrap_or_default();
            let mut tracebacks = Vec::new();
            if let Some(wire) = e.repeated("tracebacks") {
                for (_, tb) in wire.iter() {
                    let tb = Traceback::from_wire(tb.as_str().unwrap_or_default())
                        .map_err(|err| DbError::Incompatible(format!("{}: {}", e.name, err)))?;
                    tracebacks.push(tb);
                }
            }
            db.add_message(&text(e, "folder"), &lines.join("\n"), tracebacks)?;
        }

        Ok(db)
    }

    pub fn write_snapshot(&self, path: &Path) -> Result<()> {
        let doc = self.to_document()?;
        write_document(&doc, path)?;
        info!(
            "Wrote snapshot {} ({} functions, {} pt pairs)",
            path.display(),
            self.functions.len(),
            self.pt_pairs.len()
        );
        Ok(())
    }

    /// Add every value of the snapshot at `path`, scaled by `multiplier`.
    ///
    /// Nothing is changed if the snapshot disagrees with this database
    /// about a data type, a function's file or lines, or an entry's line,
    /// or if one of its new functions would be refused for overlapping.
    /// Messages are merged only when `multiplier == 1`.
    pub fn add_snapshot(&mut self, path: &Path, multiplier: i32) -> Result<MergeReport> {
        let doc = read_document(path)?;
        let scratch = ProgramDatabase::from_document(&doc)?;
        self.check_compatible(&scratch)?;
        let report = self.merge(&scratch, multiplier)?;
        SNAPSHOT_MERGES.inc();
        info!(
            "Merged snapshot {} x{}: {} values, {} messages",
            path.display(),
            multiplier,
            report.values,
            report.messages
        );
        Ok(report)
    }

    fn check_compatible(&self, other: &ProgramDatabase) -> Result<()> {
        for attr in &other.attrs {
            if let Some(mine) = self.data_attr(&attr.tag) {
                if mine.data_type != attr.data_type {
                    return Err(DbError::Incompatible(format!(
                        "data attribute '{}' is {} here, {} in the snapshot",
                        attr.tag, mine.data_type, attr.data_type
                    )));
                }
            }
        }

        for theirs in &other.functions {
            let Some(mine) = self.function(&theirs.name) else {
                continue;
            };
            let my_file = &self.files[mine.file].name;
            let their_file = &other.files[theirs.file].name;
            if my_file != their_file {
                return Err(DbError::Incompatible(format!(
                    "function '{}' is in {} here, {} in the snapshot",
                    theirs.name, my_file, their_file
                )));
            }
            if (mine.start_line, mine.end_line) != (theirs.start_line, theirs.end_line) {
                return Err(DbError::Incompatible(format!(
                    "function '{}' spans {}-{} here, {}-{} in the snapshot",
                    theirs.name, mine.start_line, mine.end_line, theirs.start_line, theirs.end_line
                )));
            }
            for entry in &theirs.entries {
                if let Some(e) = mine.entry(&entry.name) {
                    if e.line != entry.line {
                        return Err(DbError::Incompatible(format!(
                            "entry {}/{} is on line {} here, {} in the snapshot",
                            theirs.name, entry.name, e.line, entry.line
                        )));
                    }
                }
            }
        }
        if self.overlap == OverlapPolicy::Reject {
            self.check_new_function_lines(other)?;
        }
        Ok(())
    }

    /// Replay the snapshot's new functions on copies of the affected line
    /// maps, in the order `merge` will insert them.
    fn check_new_function_lines(&self, other: &ProgramDatabase) -> Result<()> {
        let mut staged: HashMap<&str, LineMap> = HashMap::new();
        let mut owners: Vec<&str> = self.functions.iter().map(|f| f.name.as_str()).collect();
        for theirs in &other.functions {
            if self.function(&theirs.name).is_some() || theirs.start_line < 1 {
                continue;
            }
            let file = other.files[theirs.file].name.as_str();
            let map = staged.entry(file).or_insert_with(|| {
                self.file(file)
                    .map(|f| f.line_map.clone())
                    .unwrap_or_default()
            });
            let overlaps = map.overlaps(theirs.start_line, theirs.end_line);
            if let Some(&(line, _, existing)) = overlaps.first() {
                return Err(DbError::OverlappingFunction {
                    function: theirs.name.clone(),
                    file: file.to_string(),
                    line,
                    existing: owners.get(existing).map(|s| s.to_string()).unwrap_or_default(),
                });
            }
            map.fill(theirs.start_line, theirs.end_line, owners.len());
            owners.push(&theirs.name);
        }
        Ok(())
    }

    fn merge(&mut self, other: &ProgramDatabase, multiplier: i32) -> Result<MergeReport> {
        let mut report = MergeReport::default();

        for pair in &other.pt_pairs {
            self.insert_pt_pair(pair.task, pair.thread);
        }
        for attr in &other.attrs {
            if self.data_attr(&attr.tag).is_none() {
                self.declare_data_attr(&attr.tag, &attr.description, attr.data_type, attr.suggested)?;
            }
        }
        for file in &other.files {
            self.insert_file(&file.name);
            if let Some(path) = &file.full_path {
                if self.file(&file.name).is_some_and(|f| f.full_path.is_none()) {
                    self.set_file_full_path(&file.name, path)?;
                }
            }
            if file.parsed {
                self.mark_file_parsed(&file.name)?;
            }
        }

        for function in &other.functions {
            let file = &other.files[function.file].name;
            if self.function(&function.name).is_none() {
                self.insert_function(&function.name, file, function.start_line, function.end_line)?;
            }
            for entry in &function.entries {
                if self.entry(&function.name, &entry.name).is_some() {
                    continue;
                }
                match &entry.point {
                    Some(point) => self.insert_inst_point(
                        &function.name,
                        &entry.name,
                        entry.line,
                        entry.index_in_line,
                        &entry.tooltip,
                        point.clone(),
                    )?,
                    None => self.insert_entry(
                        &function.name,
                        &entry.name,
                        entry.line,
                        entry.index_in_line,
                        &entry.tooltip,
                    )?,
                };
            }
            if function.parsed {
                self.mark_function_parsed(&function.name)?;
            }
        }

        for action in &other.actions {
            if self.action(&action.tag).is_none() {
                self.declare_action(
                    &action.tag,
                    &action.menu_text,
                    &action.tooltip,
                    &action.initial_state,
                )?;
            }
            for (state, decl) in &action.states {
                if !self.action(&action.tag).is_some_and(|a| a.states.contains_key(state)) {
                    self.declare_action_state(&action.tag, state, decl.clone())?;
                }
            }
            for (from, to) in &action.transitions {
                if !self.action(&action.tag).is_some_and(|a| a.allows(from, to)) {
                    self.enable_transition(&action.tag, from, to)?;
                }
            }
        }
        for function in &other.functions {
            for entry in &function.entries {
                for &a in &entry.enabled {
                    let tag = &other.actions[a].tag;
                    let here = self.action_by_tag.get(tag).copied();
                    let enabled = self
                        .entry(&function.name, &entry.name)
                        .zip(here)
                        .is_some_and(|(e, a)| e.enabled.contains(&a));
                    if !enabled {
                        self.enable_action(&function.name, &entry.name, tag)?;
                    }
                }
            }
        }

        for (&((f, e), a), values) in &other.store.values {
            let function = &other.functions[f];
            let entry = &function.entries[e].name;
            let attr = &other.attrs[a].tag;
            match values {
                Values::Int(field) => {
                    for (pt, &v) in field.iter() {
                        let pair = other.pt_pairs[pt];
                        let v = v.wrapping_mul(multiplier);
                        self.add_int(&function.name, entry, attr, pair.task, pair.thread, v)?;
                        report.values += 1;
                    }
                }
                Values::Double(field) => {
                    for (pt, &v) in field.iter() {
                        let pair = other.pt_pairs[pt];
                        let v = v * f64::from(multiplier);
                        self.add_double(&function.name, entry, attr, pair.task, pair.thread, v)?;
                        report.values += 1;
                    }
                }
            }
        }

        for folder in &other.folders {
            if self.folder(&folder.tag).is_none() {
                self.declare_message_folder(&folder.tag, &folder.title)?;
            }
            if multiplier != 1 {
                report.skipped_messages += folder.messages.len();
                continue;
            }
            for message in &folder.messages {
                self.add_message(&folder.tag, &message.text(), message.tracebacks.clone())?;
                report.messages += 1;
            }
        }
        if report.skipped_messages > 0 {
            debug!(
                "skipped {} messages merging with multiplier {}",
                report.skipped_messages, multiplier
            );
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OverlapPolicy;
    use tempfile::TempDir;
    use toolgear_shared::types::program::{
        DataType, PointKind, PointLocation, StatKind, SuggestedStat, TracebackFrame,
    };

    fn sample() -> ProgramDatabase {
        let mut db = ProgramDatabase::new(OverlapPolicy::LastWins);
        db.declare_data_attr("calls", "Calls", DataType::Int, SuggestedStat::default())
            .unwrap();
        db.declare_data_attr("time", "Seconds", DataType::Double, "max/sum".parse().unwrap())
            .unwrap();
        db.insert_function("main", "main.c", 1, 30).unwrap();
        db.insert_inst_point(
            "main",
            "main:entry",
            1,
            0,
            "before entry of main",
            PointInfo {
                kind: PointKind::FuncEntry,
                location: PointLocation::Before,
                callee: String::new(),
                call_index: 0,
            },
        )
        .unwrap();
        db.insert_entry("main", "loop", 12, 0, "").unwrap();
        db.set_file_full_path("main.c", "/src/main.c").unwrap();
        db.mark_file_parsed("main.c").unwrap();

        db.add_int("main", "main:entry", "calls", 0, 0, 4).unwrap();
        db.add_int("main", "main:entry", "calls", 1, 0, 6).unwrap();
        db.add_double("main", "loop", "time", 0, 0, 0.5).unwrap();

        db.declare_action("count", "Count", "", "off").unwrap();
        for state in ["off", "on"] {
            db.declare_action_state("count", state, ActionStateDecl::default())
                .unwrap();
        }
        db.enable_transition("count", "off", "on").unwrap();
        db.enable_action("main", "main:entry", "count").unwrap();
        db.set_action_state("main", "main:entry", "count", -1, "on")
            .unwrap();

        db.declare_message_folder("warnings", "Warnings").unwrap();
        let tb = Traceback {
            frames: vec![TracebackFrame {
                file: "main.c".into(),
                line: 12,
                function: "main".into(),
            }],
        };
        db.add_message("warnings", "slow loop\nconsider unrolling", vec![tb])
            .unwrap();
        db
    }

    #[test]
    fn test_document_restores_database() {
        let db = sample();
        let restored = ProgramDatabase::from_document(&db.to_document().unwrap()).unwrap();

        assert_eq!(restored.get_int("main", "main:entry", "calls", 1, 0), Some(6));
        assert_eq!(restored.get_double("main", "loop", "time", 0, 0), Some(0.5));
        assert_eq!(restored.file("main.c").unwrap().full_path.as_deref(), Some("/src/main.c"));
        assert_eq!(restored.function_at_line("main.c", 12).unwrap().name, "main");
        assert_eq!(
            restored.data_attr("time").unwrap().suggested.per_entry,
            StatKind::Max
        );
        assert_eq!(
            restored.action_state("main", "main:entry", "count", 5),
            Some("on")
        );
        let message = &restored.folder("warnings").unwrap().messages[0];
        assert_eq!(message.lines, vec!["slow loop", "consider unrolling"]);
        assert_eq!(message.tracebacks[0].frames[0].line, 12);
    }

    #[test]
    fn test_task_action_state_is_restored_without_pt_pairs() {
        let mut db = ProgramDatabase::default();
        db.insert_function("main", "main.c", 1, 30).unwrap();
        db.insert_entry("main", "main:entry", 1, 0, "").unwrap();
        db.declare_action("count", "Count", "", "off").unwrap();
        for state in ["off", "on"] {
            db.declare_action_state("count", state, ActionStateDecl::default())
                .unwrap();
        }
        db.enable_transition("count", "off", "on").unwrap();
        db.enable_action("main", "main:entry", "count").unwrap();
        db.set_action_state("main", "main:entry", "count", 70_000, "on")
            .unwrap();

        let restored = ProgramDatabase::from_document(&db.to_document().unwrap()).unwrap();
        assert_eq!(restored.pt_pair_count(), 0);
        assert_eq!(
            restored.action_state("main", "main:entry", "count", 70_000),
            Some("on")
        );
        assert_eq!(
            restored.action_state("main", "main:entry", "count", 1),
            Some("off")
        );
    }

    #[test]
    fn test_merge_then_unmerge_restores_values() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("b.json");
        sample().write_snapshot(&path).unwrap();

        let mut a = ProgramDatabase::default();
        a.declare_data_attr("calls", "Calls", DataType::Int, SuggestedStat::default())
            .unwrap();
        a.insert_function("main", "main.c", 1, 30).unwrap();
        a.insert_entry("main", "main:entry", 1, 0, "").unwrap();
        a.add_int("main", "main:entry", "calls", 0, 0, 10).unwrap();

        let report = a.add_snapshot(&path, 1).unwrap();
        assert_eq!(report.values, 3);
        assert_eq!(a.get_int("main", "main:entry", "calls", 0, 0), Some(14));
        assert_eq!(a.folder("warnings").unwrap().messages.len(), 1);

        let report = a.add_snapshot(&path, -1).unwrap();
        assert_eq!(report.skipped_messages, 1);
        assert_eq!(a.get_int("main", "main:entry", "calls", 0, 0), Some(10));
        assert_eq!(a.get_int("main", "main:entry", "calls", 1, 0), Some(0));
        assert_eq!(a.get_double("main", "loop", "time", 0, 0), Some(0.0));
        assert_eq!(a.folder("warnings").unwrap().messages.len(), 1);
        assert_eq!(
            a.entry_data_stat("main", "main:entry", "calls", StatKind::Max)
                .unwrap(),
            Some(10.0)
        );
    }

    #[test]
    fn test_incompatible_snapshot_changes_nothing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("b.mdb");
        sample().write_snapshot(&path).unwrap();

        let mut a = ProgramDatabase::default();
        a.declare_data_attr("calls", "Calls", DataType::Int, SuggestedStat::default())
            .unwrap();
        a.insert_function("main", "main.c", 1, 25).unwrap();

        let err = a.add_snapshot(&path, 1).unwrap_err();
        assert!(err.to_string().contains("same tool/code version"));
        assert!(a.data_attr("time").is_none());
        assert_eq!(a.pt_pair_count(), 0);
    }

    fn names(db: &ProgramDatabase) -> (Vec<String>, Vec<String>, Vec<(String, String)>) {
        let functions = db.functions().iter().map(|f| f.name.clone()).collect();
        let files = db.files().iter().map(|f| f.name.clone()).collect();
        let entries = db
            .functions()
            .iter()
            .flat_map(|f| f.entries.iter().map(move |e| (f.name.clone(), e.name.clone())))
            .collect();
        (functions, files, entries)
    }

    #[test]
    fn test_merge_and_unmerge_adds_only_what_the_snapshot_holds() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("b.json");
        let mut b = sample();
        b.insert_function("helper", "util.c", 3, 9).unwrap();
        b.insert_entry("helper", "helper:entry", 3, 0, "").unwrap();
        b.add_int("helper", "helper:entry", "calls", 0, 0, 2).unwrap();
        b.write_snapshot(&path).unwrap();

        // What merging b into an empty database creates.
        let mut alone = ProgramDatabase::default();
        alone.add_snapshot(&path, 1).unwrap();
        let (b_functions, b_files, b_entries) = names(&alone);

        let mut a = ProgramDatabase::default();
        a.declare_data_attr("calls", "Calls", DataType::Int, SuggestedStat::default())
            .unwrap();
        a.insert_function("main", "main.c", 1, 30).unwrap();
        a.insert_function("other", "other.c", 1, 5).unwrap();
        a.insert_entry("other", "o", 2, 0, "").unwrap();
        a.add_int("other", "o", "calls", 0, 0, 7).unwrap();
        let (mut functions, mut files, mut entries) = names(&a);

        a.add_snapshot(&path, 1).unwrap();
        a.add_snapshot(&path, -1).unwrap();

        for f in &b_functions {
            if !functions.contains(f) {
                functions.push(f.clone());
            }
        }
        for f in &b_files {
            if !files.contains(f) {
                files.push(f.clone());
            }
        }
        for e in &b_entries {
            if !entries.contains(e) {
                entries.push(e.clone());
            }
        }
        let (mut got_functions, mut got_files, mut got_entries) = names(&a);
        for v in [&mut functions, &mut files, &mut got_functions, &mut got_files] {
            v.sort();
        }
        entries.sort();
        got_entries.sort();
        assert_eq!(got_functions, functions);
        assert_eq!(got_files, files);
        assert_eq!(got_entries, entries);

        assert_eq!(a.get_int("other", "o", "calls", 0, 0), Some(7));
        assert_eq!(a.get_int("helper", "helper:entry", "calls", 0, 0), Some(0));

        // A second round trip creates nothing further.
        let before = names(&a);
        a.add_snapshot(&path, 1).unwrap();
        a.add_snapshot(&path, -1).unwrap();
        assert_eq!(names(&a), before);
    }

    #[test]
    fn test_rejected_overlap_leaves_database_untouched() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("b.json");
        let mut b = ProgramDatabase::default();
        b.declare_data_attr("calls", "Calls", DataType::Int, SuggestedStat::default())
            .unwrap();
        b.insert_function("early", "new.c", 1, 4).unwrap();
        b.insert_function("clash", "main.c", 25, 40).unwrap();
        b.write_snapshot(&path).unwrap();

        let mut a = ProgramDatabase::new(OverlapPolicy::Reject);
        a.insert_function("main", "main.c", 1, 30).unwrap();

        let err = a.add_snapshot(&path, 1).unwrap_err();
        assert!(matches!(
            err,
            DbError::OverlappingFunction { line: 25, ref existing, .. } if existing == "main"
        ));
        assert!(a.file("new.c").is_none());
        assert!(a.function("early").is_none());
        assert!(a.data_attr("calls").is_none());
        assert_eq!(a.files().len(), 1);
    }
}
