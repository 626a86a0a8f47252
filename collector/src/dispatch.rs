//! Collector event loop
//!
//! A [`Collector`] owns the channel to the client, the target program's
//! structure, the probe registry and the source provider. Each step waits
//! briefly for one client frame, dispatches it by tag, forwards any probe
//! hits as database commands and checks the heartbeat watchdog.

use crate::instrument::{InstPoint, Program, ProbeBackend, SourceProvider};
use crate::registry::{
    Activation, ActionPointRegistry, ActionTypes, HitContext, InstrumentReport, RegistryError,
};
use crate::schema::{self, FOLDER_COLLECTOR, STATE_OFF, STATE_ON};
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::time::Duration;
use toolgear_shared::protocol::heartbeat::Watchdog;
use toolgear_shared::protocol::{
    CollectorCommand, DbCommand, Frame, LocationSpec, MessageChannel, ProcessScope,
    ProtocolError, Received,
};
use toolgear_shared::types::program::{Traceback, TracebackFrame};
use tracing::{debug, error, info, warn};

/// Pause after the final quit notice so it can reach the peer.
const QUIT_GRACE: Duration = Duration::from_millis(200);

/// Whether the loop should keep going.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit(String),
}

pub struct Collector {
    channel: Box<dyn MessageChannel>,
    program: Box<dyn Program>,
    sources: Box<dyn SourceProvider>,
    registry: ActionPointRegistry<Box<dyn ProbeBackend>>,
    action_types: ActionTypes,
    watchdog: Option<Watchdog>,
    poll_interval: Duration,
    announced_files: HashSet<String>,
    reported_points: HashSet<String>,
    parsed_functions: HashSet<String>,
    unknown_tags: HashSet<i32>,
}

impl Collector {
    pub fn new(
        channel: Box<dyn MessageChannel>,
        program: Box<dyn Program>,
        sources: Box<dyn SourceProvider>,
        backend: Box<dyn ProbeBackend>,
        action_types: ActionTypes,
    ) -> Self {
        Self {
            channel,
            program,
            sources,
            registry: ActionPointRegistry::new(backend),
            action_types,
            watchdog: None,
            poll_interval: Duration::from_millis(50),
            announced_files: HashSet::new(),
            reported_points: HashSet::new(),
            parsed_functions: HashSet::new(),
            unknown_tags: HashSet::new(),
        }
    }

    /// Quit when no heartbeat arrives within `timeout`.
    pub fn with_heartbeat_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.watchdog = timeout.map(Watchdog::new);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn registry(&self) -> &ActionPointRegistry<Box<dyn ProbeBackend>> {
        &self.registry
    }

    fn send(&mut self, cmd: DbCommand) -> Result<()> {
        self.reply(cmd, 0)
    }

    fn reply(&mut self, cmd: DbCommand, id: i32) -> Result<()> {
        let frame = cmd
            .to_frame(id)
            .with_context(|| format!("Failed to encode {}", cmd.tag()))?;
        self.channel.send(frame).context("Failed to send to client")?;
        Ok(())
    }

    fn message(&mut self, text: String, point: Option<&InstPoint>) -> Result<()> {
        let tracebacks = match point.and_then(|p| self.program.locate(&p.tag)) {
            Some((function, point)) => vec![Traceback {
                frames: vec![TracebackFrame {
                    file: function.file,
                    line: point.line,
                    function: function.name,
                }],
            }],
            None => Vec::new(),
        };
        self.send(DbCommand::AddMessage {
            folder: FOLDER_COLLECTOR.to_string(),
            text,
            tracebacks,
        })
    }

    /// Greet the client and declare the schema.
    pub fn announce(&mut self) -> Result<()> {
        let hello = DbCommand::CollectorHello {
            program: self.program.name().to_string(),
            pid: std::process::id() as i32,
        };
        self.send(hello)?;
        for cmd in schema::announcements() {
            self.send(cmd)?;
        }
        self.channel.flush()?;
        info!("announced schema for {}", self.program.name());
        Ok(())
    }

    /// Report functions and points the client has not seen yet.
    fn report_structure(&mut self, report: &InstrumentReport) -> Result<()> {
        for function in &report.functions {
            if self.announced_files.insert(function.file.clone()) {
                self.send(DbCommand::InsertFile {
                    name: function.file.clone(),
                })?;
            }
            if !self.parsed_functions.contains(&function.name) {
                self.send(DbCommand::InsertFunction {
                    name: function.name.clone(),
                    file: function.file.clone(),
                    start_line: function.start_line,
                    end_line: function.end_line,
                })?;
            }
            let points: Vec<&InstPoint> = report
                .points
                .iter()
                .filter(|p| p.function == function.name)
                .collect();
            for point in points {
                if !self.reported_points.insert(point.tag.clone()) {
                    continue;
                }
                self.send(DbCommand::InsertInstPoint {
                    function: point.function.clone(),
                    entry: point.tag.clone(),
                    line: point.line,
                    index_in_line: point.index_in_line,
                    tooltip: point.tooltip(),
                    kind: point.kind,
                    location: point.location,
                    callee: point.callee.clone().unwrap_or_default(),
                    call_index: point.call_index,
                })?;
            }
            if self.parsed_functions.insert(function.name.clone()) {
                self.send(DbCommand::FunctionParsed {
                    function: function.name.clone(),
                })?;
                if self.file_complete(&function.file) {
                    self.send(DbCommand::FileParsed {
                        file: function.file.clone(),
                    })?;
                }
            }
        }
        Ok(())
    }

    fn file_complete(&self, file: &str) -> bool {
        self.program.modules().iter().all(|module| {
            self.program
                .functions(module)
                .iter()
                .filter(|f| f.file == file)
                .all(|f| self.parsed_functions.contains(&f.name))
        })
    }

    fn send_action_state(
        &mut self,
        function: &str,
        point: &str,
        action: &str,
        scope: ProcessScope,
        state: &str,
    ) -> Result<()> {
        self.send(DbCommand::SetActionState {
            function: function.to_string(),
            entry: point.to_string(),
            action: action.to_string(),
            task: scope.to_wire(),
            thread: -1,
            state: state.to_string(),
        })
    }

    /// Bulk instrumentation followed by the structure and enable reports.
    pub fn instrument(&mut self, specs: &[LocationSpec]) -> Result<()> {
        let report = match self.registry.instrument_locations(
            &self.program,
            &self.action_types,
            specs,
        ) {
            Ok(report) => report,
            Err(e @ (RegistryError::BadPattern { .. } | RegistryError::UnknownActionType(_))) => {
                warn!("instrumentation request rejected: {}", e);
                self.message(format!("Instrumentation request rejected: {}", e), None)?;
                return self.send(DbCommand::InstrumentationDone {
                    points: 0,
                    actions: 0,
                    failures: 1,
                });
            }
            Err(e) => return Err(e.into()),
        };

        self.report_structure(&report)?;
        for (point_tag, action) in &report.enabled {
            let function = report
                .points
                .iter()
                .find(|p| &p.tag == point_tag)
                .map(|p| p.function.clone())
                .unwrap_or_default();
            self.send(DbCommand::EnableAction {
                function: function.clone(),
                entry: point_tag.clone(),
                action: action.clone(),
            })?;
            self.send_action_state(&function, point_tag, action, ProcessScope::All, STATE_ON)?;
        }
        for (point_tag, action, reason) in &report.failures {
            let point = report.points.iter().find(|p| &p.tag == point_tag).cloned();
            self.message(
                format!("Could not activate {} at {}\n{}", action, point_tag, reason),
                point.as_ref(),
            )?;
        }
        self.send(DbCommand::InstrumentationDone {
            points: report.points.len() as i32,
            actions: (report.activated + report.already_active) as i32,
            failures: report.failures.len() as i32,
        })?;
        self.channel.flush()?;
        Ok(())
    }

    fn activate(&mut self, point_tag: &str, type_tag: &str, scope: ProcessScope) -> Result<()> {
        let Some(action) = self.action_types.get(type_tag) else {
            warn!("activation of unknown action type {}", type_tag);
            return self.message(format!("Unknown action type '{}'", type_tag), None);
        };
        match self
            .registry
            .activate_one(&self.program, point_tag, &action, scope)
        {
            Ok(Activation::Activated(_)) => {
                let Some((function, point)) = self.program.locate(point_tag) else {
                    return Ok(());
                };
                let report = InstrumentReport {
                    functions: vec![function.clone()],
                    points: vec![point],
                    ..InstrumentReport::default()
                };
                self.report_structure(&report)?;
                self.send(DbCommand::EnableAction {
                    function: function.name.clone(),
                    entry: point_tag.to_string(),
                    action: type_tag.to_string(),
                })?;
                self.send_action_state(&function.name, point_tag, type_tag, scope, STATE_ON)
            }
            Ok(Activation::AlreadyActive(_)) => self.send(DbCommand::Status {
                text: format!("{} already active at {}", type_tag, point_tag),
            }),
            Err(e) => {
                warn!("activate {} at {} failed: {}", type_tag, point_tag, e);
                let point = self.program.locate(point_tag).map(|(_, p)| p);
                self.message(
                    format!("Could not activate {} at {}\n{}", type_tag, point_tag, e),
                    point.as_ref(),
                )
            }
        }
    }

    fn deactivate(&mut self, point_tag: &str, type_tag: &str) -> Result<()> {
        let function = self
            .registry
            .point(point_tag)
            .map(|ap| ap.function.name.clone());
        match self.registry.deactivate_one(point_tag, type_tag) {
            Ok(Some(_)) => self.send_action_state(
                function.as_deref().unwrap_or_default(),
                point_tag,
                type_tag,
                ProcessScope::All,
                STATE_OFF,
            ),
            Ok(None) => Ok(()),
            Err(e) => {
                warn!("deactivate {} at {} failed: {}", type_tag, point_tag, e);
                self.message(
                    format!("Could not deactivate {} at {}\n{}", type_tag, point_tag, e),
                    None,
                )
            }
        }
    }

    fn serve_file(&mut self, file: &str, id: i32) -> Result<()> {
        match self.sources.read_file(file) {
            Some(found) => {
                // The full path has to reach the client before the contents.
                if found.full_path != file {
                    self.reply(
                        DbCommand::FileFullPath {
                            file: file.to_string(),
                            path: found.full_path,
                        },
                        id,
                    )?;
                }
                self.reply(
                    DbCommand::FileContents {
                        file: file.to_string(),
                        text: found.text,
                    },
                    id,
                )
            }
            None => {
                debug!("source file {} not found", file);
                self.reply(
                    DbCommand::FileNotFound {
                        file: file.to_string(),
                    },
                    id,
                )
            }
        }
    }

    /// Handle one frame from the client.
    pub fn handle_frame(&mut self, frame: Frame) -> Result<Flow> {
        let cmd = match CollectorCommand::from_frame(&frame) {
            Ok(cmd) => cmd,
            Err(ProtocolError::UnknownTag(tag)) => {
                if self.unknown_tags.insert(tag) {
                    warn!("ignoring unknown message tag {}", tag);
                }
                return Ok(Flow::Continue);
            }
            Err(ProtocolError::WrongDirection(tag)) => {
                warn!("ignoring {} sent to a collector", tag);
                return Ok(Flow::Continue);
            }
            Err(e) => return Err(e).context("Malformed message from client"),
        };
        debug!("received {}", cmd.tag());

        match cmd {
            CollectorCommand::ActivateAction {
                point,
                action_type,
                scope,
            } => self.activate(&point, &action_type, scope)?,
            CollectorCommand::DeactivateAction { point, action_type } => {
                self.deactivate(&point, &action_type)?
            }
            CollectorCommand::InstrumentLocations { specs } => self.instrument(&specs)?,
            CollectorCommand::RequestFile { file } => self.serve_file(&file, frame.id)?,
            CollectorCommand::CancelFileRequest { file } => {
                debug!("cancel for {}: replies are already sent synchronously", file);
            }
            CollectorCommand::RequestDirectory { path } => {
                let subdirs = self.sources.list_subdirs(&path).unwrap_or_else(|| {
                    debug!("cannot list {}", path);
                    Vec::new()
                });
                self.reply(DbCommand::DirectoryListing { path, subdirs }, frame.id)?;
            }
            CollectorCommand::Heartbeat => {
                if let Some(w) = self.watchdog.as_mut() {
                    w.feed();
                }
            }
            CollectorCommand::Quit { reason } => return Ok(Flow::Quit(reason)),
        }
        self.channel.flush()?;
        Ok(Flow::Continue)
    }

    /// Turn pending probe hits into database commands.
    pub fn deliver_hits(&mut self) -> Result<usize> {
        let hits = self.registry.poll_hits();
        if hits.is_empty() {
            return Ok(0);
        }
        let mut commands = Vec::with_capacity(hits.len());
        for hit in &hits {
            let Some((ap, action)) = self.registry.resolve_probe(hit.handle) else {
                debug!("hit for removed probe {:?}", hit.handle);
                continue;
            };
            let Some(action_type) = self.action_types.get(&action.type_tag) else {
                continue;
            };
            if let Some(callback) = action_type.callback() {
                let ctx = HitContext {
                    function: &ap.function,
                    point: &ap.point,
                    hit,
                };
                commands.extend(callback(&ctx));
            }
        }
        let n = commands.len();
        for cmd in commands {
            self.send(cmd)?;
        }
        self.channel.flush()?;
        Ok(n)
    }

    /// Wait up to one poll interval for client traffic and process it.
    pub fn step(&mut self) -> Result<Flow> {
        let flow = match self.channel.recv_timeout(self.poll_interval)? {
            Received::Frame(frame) => self.handle_frame(frame)?,
            Received::Empty => Flow::Continue,
            Received::Closed => Flow::Quit("client closed the connection".to_string()),
        };
        self.deliver_hits()?;
        if flow == Flow::Continue && self.watchdog.as_ref().is_some_and(Watchdog::expired) {
            return Ok(Flow::Quit("no heartbeat from client".to_string()));
        }
        Ok(flow)
    }

    fn run_inner(&mut self, startup: &[LocationSpec]) -> Result<String> {
        self.announce()?;
        if !startup.is_empty() {
            self.instrument(startup)?;
        }
        loop {
            if let Flow::Quit(reason) = self.step()? {
                return Ok(reason);
            }
        }
    }

    /// Run until the client quits, the channel closes or the watchdog fires.
    ///
    /// On a fatal error the client is told twice, the channel flushed, and
    /// the error returned after a short grace period.
    pub fn run(&mut self, startup: &[LocationSpec]) -> Result<String> {
        match self.run_inner(startup) {
            Ok(reason) => {
                info!("collector stopping: {}", reason);
                let _ = self.send(DbCommand::CollectorQuit {
                    reason: reason.clone(),
                });
                let _ = self.channel.flush();
                Ok(reason)
            }
            Err(e) => {
                error!("collector failed: {:#}", e);
                let reason = format!("collector error: {:#}", e);
                for _ in 0..2 {
                    let _ = self.send(DbCommand::CollectorQuit {
                        reason: reason.clone(),
                    });
                }
                let _ = self.channel.flush();
                std::thread::sleep(QUIT_GRACE);
                Err(e)
            }
        }
    }
}
