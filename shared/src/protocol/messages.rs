//! Typed messages for each tag.
//!
//! [`DbCommand`] covers everything a collector sends to the client,
//! [`CollectorCommand`] everything the client sends to a collector. Both
//! encode through the codec using exactly the layout registered for their
//! tag in [`Tag::format`].

use crate::protocol::codec::{CodecError, Packer, Unpacker};
use crate::protocol::tags::{Direction, Tag};
use crate::protocol::transport::Frame;
use crate::types::program::{
    DataType, PointKind, PointLocation, SuggestedStat, Traceback,
};
use thiserror::Error;

/// Task value meaning "every process" in an activation scope.
pub const ALL_TASKS: i32 = -1;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("unknown message tag {0}")]
    UnknownTag(i32),

    #[error("{0} is not valid in this direction")]
    WrongDirection(Tag),

    #[error("{tag}: bad {field} {value:?}")]
    BadField {
        tag: Tag,
        field: &'static str,
        value: String,
    },

    #[error("{tag}: parallel arrays differ in length")]
    RaggedArrays { tag: Tag },
}

/// Address of one data value.
#[derive(Debug, Clone, PartialEq)]
pub struct DataTarget {
    pub function: String,
    pub entry: String,
    pub attr: String,
    pub task: i32,
    pub thread: i32,
}

/// Collector to client.
#[derive(Debug, Clone, PartialEq)]
pub enum DbCommand {
    InsertFile {
        name: String,
    },
    InsertFunction {
        name: String,
        file: String,
        start_line: i32,
        end_line: i32,
    },
    InsertEntry {
        function: String,
        entry: String,
        line: i32,
        index_in_line: i32,
        tooltip: String,
    },
    InsertInstPoint {
        function: String,
        entry: String,
        line: i32,
        index_in_line: i32,
        tooltip: String,
        kind: PointKind,
        location: PointLocation,
        callee: String,
        call_index: i32,
    },
    DeclareDataAttr {
        tag: String,
        description: String,
        data_type: DataType,
        suggested: SuggestedStat,
    },
    SetInt(DataTarget, i32),
    AddInt(DataTarget, i32),
    SetDouble(DataTarget, f64),
    AddDouble(DataTarget, f64),
    DeclareAction {
        tag: String,
        menu_text: String,
        tooltip: String,
        initial_state: String,
    },
    DeclareActionState {
        action: String,
        state: String,
        pixmap: String,
        menu_text: String,
        tooltip: String,
    },
    EnableTransition {
        action: String,
        from: String,
        to: String,
    },
    EnableAction {
        function: String,
        entry: String,
        action: String,
    },
    SetActionState {
        function: String,
        entry: String,
        action: String,
        task: i32,
        /// Kept on the wire; action states are scoped to a whole task.
        thread: i32,
        state: String,
    },
    InsertPtPair {
        task: i32,
        thread: i32,
    },
    DeclareMessageFolder {
        tag: String,
        title: String,
    },
    AddMessage {
        folder: String,
        text: String,
        tracebacks: Vec<Traceback>,
    },
    FunctionParsed {
        function: String,
    },
    FileParsed {
        file: String,
    },
    FileContents {
        file: String,
        text: String,
    },
    FileFullPath {
        file: String,
        path: String,
    },
    FileNotFound {
        file: String,
    },
    DirectoryListing {
        path: String,
        subdirs: Vec<String>,
    },
    CollectorHello {
        program: String,
        pid: i32,
    },
    Status {
        text: String,
    },
    InstrumentationDone {
        points: i32,
        actions: i32,
        failures: i32,
    },
    CollectorQuit {
        reason: String,
    },
}

/// Which processes an activation applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessScope {
    All,
    Task(i32),
}

impl ProcessScope {
    pub fn from_wire(task: i32) -> Self {
        if task == ALL_TASKS {
            ProcessScope::All
        } else {
            ProcessScope::Task(task)
        }
    }

    pub fn to_wire(self) -> i32 {
        match self {
            ProcessScope::All => ALL_TASKS,
            ProcessScope::Task(t) => t,
        }
    }
}

/// One row of an instrument-locations request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationSpec {
    pub pattern: String,
    pub kind: PointKind,
    pub location: PointLocation,
    pub action_type: String,
}

/// Client to collector.
#[derive(Debug, Clone, PartialEq)]
pub enum CollectorCommand {
    ActivateAction {
        point: String,
        action_type: String,
        scope: ProcessScope,
    },
    DeactivateAction {
        point: String,
        action_type: String,
    },
    InstrumentLocations {
        specs: Vec<LocationSpec>,
    },
    RequestFile {
        file: String,
    },
    CancelFileRequest {
        file: String,
    },
    RequestDirectory {
        path: String,
    },
    Heartbeat,
    Quit {
        reason: String,
    },
}

fn check_frame(frame: &Frame, want: Direction) -> Result<Tag, ProtocolError> {
    let tag = frame.tag().map_err(ProtocolError::UnknownTag)?;
    if tag.direction() != want {
        return Err(ProtocolError::WrongDirection(tag));
    }
    Ok(tag)
}

fn parse_field<T: std::str::FromStr>(
    tag: Tag,
    field: &'static str,
    value: String,
) -> Result<T, ProtocolError> {
    value
        .parse()
        .map_err(|_| ProtocolError::BadField { tag, field, value })
}

fn finish_frame(tag: Tag, id: i32, packer: Packer) -> Result<Frame, ProtocolError> {
    debug_assert_eq!(packer.format(), tag.format(), "layout drift for {tag}");
    Ok(Frame::new(tag, id, packer.finish()?))
}

fn pack_target(p: Packer, t: &DataTarget) -> Packer {
    p.string(&t.function)
        .string(&t.entry)
        .string(&t.attr)
        .int(t.task)
        .int(t.thread)
}

fn read_target(u: &mut Unpacker<'_>) -> Result<DataTarget, CodecError> {
    Ok(DataTarget {
        function: u.string()?,
        entry: u.string()?,
        attr: u.string()?,
        task: u.int()?,
        thread: u.int()?,
    })
}

impl DbCommand {
    pub fn tag(&self) -> Tag {
        match self {
            DbCommand::InsertFile { .. } => Tag::DbInsertFile,
            DbCommand::InsertFunction { .. } => Tag::DbInsertFunction,
            DbCommand::InsertEntry { .. } => Tag::DbInsertEntry,
            DbCommand::InsertInstPoint { .. } => Tag::DbInsertInstPoint,
            DbCommand::DeclareDataAttr { .. } => Tag::DbDeclareDataAttr,
            DbCommand::SetInt(..) => Tag::DbSetInt,
            DbCommand::AddInt(..) => Tag::DbAddInt,
            DbCommand::SetDouble(..) => Tag::DbSetDouble,
            DbCommand::AddDouble(..) => Tag::DbAddDouble,
            DbCommand::DeclareAction { .. } => Tag::DbDeclareAction,
            DbCommand::DeclareActionState { .. } => Tag::DbDeclareActionState,
            DbCommand::EnableTransition { .. } => Tag::DbEnableTransition,
            DbCommand::EnableAction { .. } => Tag::DbEnableAction,
            DbCommand::SetActionState { .. } => Tag::DbSetActionState,
            DbCommand::InsertPtPair { .. } => Tag::DbInsertPtPair,
            DbCommand::DeclareMessageFolder { .. } => Tag::DbDeclareMessageFolder,
            DbCommand::AddMessage { .. } => Tag::DbAddMessage,
            DbCommand::FunctionParsed { .. } => Tag::DbFunctionParsed,
            DbCommand::FileParsed { .. } => Tag::DbFileParsed,
            DbCommand::FileContents { .. } => Tag::DbFileContents,
            DbCommand::FileFullPath { .. } => Tag::DbFileFullPath,
            DbCommand::FileNotFound { .. } => Tag::DbFileNotFound,
            DbCommand::DirectoryListing { .. } => Tag::DbDirectoryListing,
            DbCommand::CollectorHello { .. } => Tag::DbCollectorHello,
            DbCommand::Status { .. } => Tag::DbStatus,
            DbCommand::InstrumentationDone { .. } => Tag::DbInstrumentationDone,
            DbCommand::CollectorQuit { .. } => Tag::DbCollectorQuit,
        }
    }

    /// Encode into a frame. `id` is 0 unless this answers a request.
    pub fn to_frame(&self, id: i32) -> Result<Frame, ProtocolError> {
        let p = Packer::new();
        let p = match self {
            DbCommand::InsertFile { name } => p.string(name),
            DbCommand::InsertFunction {
                name,
                file,
                start_line,
                end_line,
            } => p.string(name).string(file).int(*start_line).int(*end_line),
            DbCommand::InsertEntry {
                function,
                entry,
                line,
                index_in_line,
                tooltip,
            } => p
                .string(function)
                .string(entry)
                .int(*line)
                .int(*index_in_line)
                .string(tooltip),
            DbCommand::InsertInstPoint {
                function,
                entry,
                line,
                index_in_line,
                tooltip,
                kind,
                location,
                callee,
                call_index,
            } => p
                .string(function)
                .string(entry)
                .int(*line)
                .int(*index_in_line)
                .string(tooltip)
                .string(kind.as_str())
                .string(location.as_str())
                .string(callee)
                .int(*call_index),
            DbCommand::DeclareDataAttr {
                tag,
                description,
                data_type,
                suggested,
            } => p
                .string(tag)
                .string(description)
                .string(data_type.as_str())
                .string(&suggested.to_string()),
            DbCommand::SetInt(t, v) | DbCommand::AddInt(t, v) => pack_target(p, t).int(*v),
            DbCommand::SetDouble(t, v) | DbCommand::AddDouble(t, v) => {
                pack_target(p, t).double(*v)
            }
            DbCommand::DeclareAction {
                tag,
                menu_text,
                tooltip,
                initial_state,
            } => p
                .string(tag)
                .string(menu_text)
                .string(tooltip)
                .string(initial_state),
            DbCommand::DeclareActionState {
                action,
                state,
                pixmap,
                menu_text,
                tooltip,
            } => p
                .string(action)
                .string(state)
                .string(pixmap)
                .string(menu_text)
                .string(tooltip),
            DbCommand::EnableTransition { action, from, to } => {
                p.string(action).string(from).string(to)
            }
            DbCommand::EnableAction {
                function,
                entry,
                action,
            } => p.string(function).string(entry).string(action),
            DbCommand::SetActionState {
                function,
                entry,
                action,
                task,
                thread,
                state,
            } => p
                .string(function)
                .string(entry)
                .string(action)
                .int(*task)
                .int(*thread)
                .string(state),
            DbCommand::InsertPtPair { task, thread } => p.int(*task).int(*thread),
            DbCommand::DeclareMessageFolder { tag, title } => p.string(tag).string(title),
            DbCommand::AddMessage {
                folder,
                text,
                tracebacks,
            } => {
                let wire: Vec<String> = tracebacks.iter().map(Traceback::to_wire).collect();
                p.string(folder).string(text).array(&wire)
            }
            DbCommand::FunctionParsed { function } => p.string(function),
            DbCommand::FileParsed { file } => p.string(file),
            DbCommand::FileContents { file, text } => p.string(file).string(text),
            DbCommand::FileFullPath { file, path } => p.string(file).string(path),
            DbCommand::FileNotFound { file } => p.string(file),
            DbCommand::DirectoryListing { path, subdirs } => p.string(path).array(subdirs),
            DbCommand::CollectorHello { program, pid } => p.string(program).int(*pid),
            DbCommand::Status { text } => p.string(text),
            DbCommand::InstrumentationDone {
                points,
                actions,
                failures,
            } => p.int(*points).int(*actions).int(*failures),
            DbCommand::CollectorQuit { reason } => p.string(reason),
        };
        finish_frame(self.tag(), id, p)
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, ProtocolError> {
        let tag = check_frame(frame, Direction::ToClient)?;
        let mut u = Unpacker::new(&frame.payload);
        let cmd = match tag {
            Tag::DbInsertFile => DbCommand::InsertFile { name: u.string()? },
            Tag::DbInsertFunction => DbCommand::InsertFunction {
                name: u.string()?,
                file: u.string()?,
                start_line: u.int()?,
                end_line: u.int()?,
            },
            Tag::DbInsertEntry => DbCommand::InsertEntry {
                function: u.string()?,
                entry: u.string()?,
                line: u.int()?,
                index_in_line: u.int()?,
                tooltip: u.string()?,
            },
            Tag::DbInsertInstPoint => DbCommand::InsertInstPoint {
                function: u.string()?,
                entry: u.string()?,
                line: u.int()?,
                index_in_line: u.int()?,
                tooltip: u.string()?,
                kind: parse_field(tag, "point type", u.string()?)?,
                location: parse_field(tag, "point location", u.string()?)?,
                callee: u.string()?,
                call_index: u.int()?,
            },
            Tag::DbDeclareDataAttr => DbCommand::DeclareDataAttr {
                tag: u.string()?,
                description: u.string()?,
                data_type: parse_field(tag, "data type", u.string()?)?,
                suggested: parse_field(tag, "statistic", u.string()?)?,
            },
            Tag::DbSetInt => DbCommand::SetInt(read_target(&mut u)?, u.int()?),
            Tag::DbAddInt => DbCommand::AddInt(read_target(&mut u)?, u.int()?),
            Tag::DbSetDouble => DbCommand::SetDouble(read_target(&mut u)?, u.double()?),
            Tag::DbAddDouble => DbCommand::AddDouble(read_target(&mut u)?, u.double()?),
            Tag::DbDeclareAction => DbCommand::DeclareAction {
                tag: u.string()?,
                menu_text: u.string()?,
                tooltip: u.string()?,
                initial_state: u.string()?,
            },
            Tag::DbDeclareActionState => DbCommand::DeclareActionState {
                action: u.string()?,
                state: u.string()?,
                pixmap: u.string()?,
                menu_text: u.string()?,
                tooltip: u.string()?,
            },
            Tag::DbEnableTransition => DbCommand::EnableTransition {
                action: u.string()?,
                from: u.string()?,
                to: u.string()?,
            },
            Tag::DbEnableAction => DbCommand::EnableAction {
                function: u.string()?,
                entry: u.string()?,
                action: u.string()?,
            },
            Tag::DbSetActionState => DbCommand::SetActionState {
                function: u.string()?,
                entry: u.string()?,
                action: u.string()?,
                task: u.int()?,
                thread: u.int()?,
                state: u.string()?,
            },
            Tag::DbInsertPtPair => DbCommand::InsertPtPair {
                task: u.int()?,
                thread: u.int()?,
            },
            Tag::DbDeclareMessageFolder => DbCommand::DeclareMessageFolder {
                tag: u.string()?,
                title: u.string()?,
            },
            Tag::DbAddMessage => {
                let folder = u.string()?;
                let text = u.string()?;
                let mut tracebacks = Vec::new();
                for raw in u.array()? {
                    let tb = Traceback::from_wire(&raw).map_err(|_| ProtocolError::BadField {
                        tag,
                        field: "traceback",
                        value: raw.clone(),
                    })?;
                    tracebacks.push(tb);
                }
                DbCommand::AddMessage {
                    folder,
                    text,
                    tracebacks,
                }
            }
            Tag::DbFunctionParsed => DbCommand::FunctionParsed {
                function: u.string()?,
            },
            Tag::DbFileParsed => DbCommand::FileParsed { file: u.string()? },
            Tag::DbFileContents => DbCommand::FileContents {
                file: u.string()?,
                text: u.string()?,
            },
            Tag::DbFileFullPath => DbCommand::FileFullPath {
                file: u.string()?,
                path: u.string()?,
            },
            Tag::DbFileNotFound => DbCommand::FileNotFound { file: u.string()? },
            Tag::DbDirectoryListing => DbCommand::DirectoryListing {
                path: u.string()?,
                subdirs: u.array()?,
            },
            Tag::DbCollectorHello => DbCommand::CollectorHello {
                program: u.string()?,
                pid: u.int()?,
            },
            Tag::DbStatus => DbCommand::Status { text: u.string()? },
            Tag::DbInstrumentationDone => DbCommand::InstrumentationDone {
                points: u.int()?,
                actions: u.int()?,
                failures: u.int()?,
            },
            Tag::DbCollectorQuit => DbCommand::CollectorQuit {
                reason: u.string()?,
            },
            other => return Err(ProtocolError::WrongDirection(other)),
        };
        u.finish()?;
        Ok(cmd)
    }
}

impl CollectorCommand {
    pub fn tag(&self) -> Tag {
        match self {
            CollectorCommand::ActivateAction { .. } => Tag::CollectorActivateAction,
            CollectorCommand::DeactivateAction { .. } => Tag::CollectorDeactivateAction,
            CollectorCommand::InstrumentLocations { .. } => Tag::CollectorInstrumentLocations,
            CollectorCommand::RequestFile { .. } => Tag::CollectorRequestFile,
            CollectorCommand::CancelFileRequest { .. } => Tag::CollectorCancelFileRequest,
            CollectorCommand::RequestDirectory { .. } => Tag::CollectorRequestDirectory,
            CollectorCommand::Heartbeat => Tag::GuiHeartbeat,
            CollectorCommand::Quit { .. } => Tag::GuiQuit,
        }
    }

    pub fn to_frame(&self, id: i32) -> Result<Frame, ProtocolError> {
        let p = Packer::new();
        let p = match self {
            CollectorCommand::ActivateAction {
                point,
                action_type,
                scope,
            } => p.string(point).string(action_type).int(scope.to_wire()),
            CollectorCommand::DeactivateAction { point, action_type } => {
                p.string(point).string(action_type)
            }
            CollectorCommand::InstrumentLocations { specs } => {
                let patterns: Vec<&str> = specs.iter().map(|s| s.pattern.as_str()).collect();
                let kinds: Vec<&str> = specs.iter().map(|s| s.kind.as_str()).collect();
                let locations: Vec<&str> = specs.iter().map(|s| s.location.as_str()).collect();
                let types: Vec<&str> = specs.iter().map(|s| s.action_type.as_str()).collect();
                p.array(&patterns)
                    .array(&kinds)
                    .array(&locations)
                    .array(&types)
            }
            CollectorCommand::RequestFile { file } => p.string(file),
            CollectorCommand::CancelFileRequest { file } => p.string(file),
            CollectorCommand::RequestDirectory { path } => p.string(path),
            CollectorCommand::Heartbeat => p,
            CollectorCommand::Quit { reason } => p.string(reason),
        };
        finish_frame(self.tag(), id, p)
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, ProtocolError> {
        let tag = check_frame(frame, Direction::ToCollector)?;
        let mut u = Unpacker::new(&frame.payload);
        let cmd = match tag {
            Tag::CollectorActivateAction => CollectorCommand::ActivateAction {
                point: u.string()?,
                action_type: u.string()?,
                scope: ProcessScope::from_wire(u.int()?),
            },
            Tag::CollectorDeactivateAction => CollectorCommand::DeactivateAction {
                point: u.string()?,
                action_type: u.string()?,
            },
            Tag::CollectorInstrumentLocations => {
                let patterns = u.array()?;
                let kinds = u.array()?;
                let locations = u.array()?;
                let types = u.array()?;
                let n = patterns.len();
                if kinds.len() != n || locations.len() != n || types.len() != n {
                    return Err(ProtocolError::RaggedArrays { tag });
                }
                let mut specs = Vec::with_capacity(n);
                for (((pattern, kind), location), action_type) in
                    patterns.into_iter().zip(kinds).zip(locations).zip(types)
                {
                    specs.push(LocationSpec {
                        pattern,
                        kind: parse_field(tag, "point type", kind)?,
                        location: parse_field(tag, "point location", location)?,
                        action_type,
                    });
                }
                CollectorCommand::InstrumentLocations { specs }
            }
            Tag::CollectorRequestFile => CollectorCommand::RequestFile { file: u.string()? },
            Tag::CollectorCancelFileRequest => {
                CollectorCommand::CancelFileRequest { file: u.string()? }
            }
            Tag::CollectorRequestDirectory => {
                CollectorCommand::RequestDirectory { path: u.string()? }
            }
            Tag::GuiHeartbeat => CollectorCommand::Heartbeat,
            Tag::GuiQuit => CollectorCommand::Quit {
                reason: u.string()?,
            },
            other => return Err(ProtocolError::WrongDirection(other)),
        };
        u.finish()?;
        Ok(cmd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::program::{StatKind, TracebackFrame};

    fn target() -> DataTarget {
        DataTarget {
            function: "main".into(),
            entry: "main:entry".into(),
            attr: "calls".into(),
            task: 0,
            thread: 1,
        }
    }

    fn sample_db_commands() -> Vec<DbCommand> {
        vec![
            DbCommand::InsertFile {
                name: "a.c".into(),
            },
            DbCommand::InsertFunction {
                name: "foo".into(),
                file: "a.c".into(),
                start_line: 10,
                end_line: 20,
            },
            DbCommand::InsertInstPoint {
                function: "foo".into(),
                entry: "foo:call:1".into(),
                line: 12,
                index_in_line: 0,
                tooltip: "call to bar".into(),
                kind: PointKind::FuncCall,
                location: PointLocation::Before,
                callee: "bar".into(),
                call_index: 1,
            },
            DbCommand::DeclareDataAttr {
                tag: "time".into(),
                description: "Wall time".into(),
                data_type: DataType::Double,
                suggested: SuggestedStat {
                    per_entry: StatKind::Sum,
                    rollup: StatKind::Max,
                },
            },
            DbCommand::AddInt(target(), 1),
            DbCommand::SetDouble(target(), 2.5),
            DbCommand::AddMessage {
                folder: "errors".into(),
                text: "line one\nline two".into(),
                tracebacks: vec![Traceback {
                    frames: vec![TracebackFrame {
                        file: "a.c".into(),
                        line: 12,
                        function: "foo".into(),
                    }],
                }],
            },
            DbCommand::DirectoryListing {
                path: "/src".into(),
                subdirs: vec![],
            },
            DbCommand::InstrumentationDone {
                points: 3,
                actions: 2,
                failures: 1,
            },
        ]
    }

    #[test]
    fn test_db_commands_decode_to_themselves() {
        for (i, cmd) in sample_db_commands().into_iter().enumerate() {
            let frame = cmd.to_frame(i as i32).unwrap();
            assert_eq!(frame.tag, cmd.tag() as i32);
            assert_eq!(frame.id, i as i32);
            assert_eq!(DbCommand::from_frame(&frame).unwrap(), cmd);
        }
    }

    #[test]
    fn test_heartbeat_is_empty_payload() {
        let frame = CollectorCommand::Heartbeat.to_frame(0).unwrap();
        assert!(frame.payload.is_empty());
        assert_eq!(
            CollectorCommand::from_frame(&frame).unwrap(),
            CollectorCommand::Heartbeat
        );
    }

    #[test]
    fn test_instrument_locations_parallel_arrays() {
        let cmd = CollectorCommand::InstrumentLocations {
            specs: vec![
                LocationSpec {
                    pattern: "^foo$".into(),
                    kind: PointKind::FuncEntry,
                    location: PointLocation::Before,
                    action_type: "count".into(),
                },
                LocationSpec {
                    pattern: "ba.*".into(),
                    kind: PointKind::Any,
                    location: PointLocation::Any,
                    action_type: "time".into(),
                },
            ],
        };
        let frame = cmd.to_frame(0).unwrap();
        assert_eq!(CollectorCommand::from_frame(&frame).unwrap(), cmd);
    }

    #[test]
    fn test_ragged_arrays_rejected() {
        let payload = Packer::new()
            .array(&["a", "b"])
            .array(&["entry"])
            .array(&["before", "after"])
            .array(&["t", "t"])
            .finish()
            .unwrap();
        let frame = Frame::new(Tag::CollectorInstrumentLocations, 0, payload);
        assert!(matches!(
            CollectorCommand::from_frame(&frame),
            Err(ProtocolError::RaggedArrays { .. })
        ));
    }

    #[test]
    fn test_activation_scope_all_is_minus_one() {
        let cmd = CollectorCommand::ActivateAction {
            point: "foo:entry".into(),
            action_type: "count".into(),
            scope: ProcessScope::All,
        };
        let frame = cmd.to_frame(0).unwrap();
        let mut u = Unpacker::new(&frame.payload);
        u.string().unwrap();
        u.string().unwrap();
        assert_eq!(u.int().unwrap(), ALL_TASKS);
    }

    #[test]
    fn test_direction_and_unknown_tags() {
        let frame = CollectorCommand::Heartbeat.to_frame(0).unwrap();
        assert!(matches!(
            DbCommand::from_frame(&frame),
            Err(ProtocolError::WrongDirection(Tag::GuiHeartbeat))
        ));

        let unknown = Frame {
            tag: 4242,
            id: 0,
            payload: vec![],
        };
        assert!(matches!(
            DbCommand::from_frame(&unknown),
            Err(ProtocolError::UnknownTag(4242))
        ));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut frame = DbCommand::Status { text: "ok".into() }
            .to_frame(0)
            .unwrap();
        frame.payload.push(0);
        assert!(matches!(
            DbCommand::from_frame(&frame),
            Err(ProtocolError::Codec(CodecError::TrailingBytes(1)))
        ));
    }

    #[test]
    fn test_bad_enum_field_reported() {
        let payload = Packer::new()
            .string("t")
            .string("desc")
            .string("complex")
            .string("sum")
            .finish()
            .unwrap();
        let frame = Frame::new(Tag::DbDeclareDataAttr, 0, payload);
        match DbCommand::from_frame(&frame) {
            Err(ProtocolError::BadField { field, value, .. }) => {
                assert_eq!(field, "data type");
                assert_eq!(value, "complex");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
