//! Client event loop
//!
//! A [`ClientSession`] owns the channel to one collector and the program
//! database. It runs on a blocking thread: each step drains UI requests,
//! sends a heartbeat when one is due, then waits briefly for a collector
//! frame and applies it. Async callers talk to it through a
//! [`SessionHandle`].

use crate::db::{ActionStateDecl, PointInfo, ProgramDatabase};
use crate::diagnostics::Diagnostics;
use crate::fetch::{FileFetcher, FileReply, Outgoing};
use crate::metrics::{FATAL_ERRORS, FRAMES_DISPATCHED};
use anyhow::{anyhow, Context, Result};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use toolgear_shared::protocol::heartbeat::HeartbeatTimer;
use toolgear_shared::protocol::{
    CollectorCommand, DbCommand, Frame, LocationSpec, MessageChannel, ProcessScope,
    ProtocolError, Received,
};
use tracing::{debug, error, info, warn};

/// Pause after the final quit notice so it can reach the peer.
const QUIT_GRACE: Duration = Duration::from_millis(200);

/// Longest wait for a frame before looking at UI requests again.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Whether the loop should keep going.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit(String),
}

type DbTask = Box<dyn FnOnce(&mut ProgramDatabase) + Send>;

/// Requests from the UI side.
pub enum UiEvent {
    FetchFile {
        file: String,
        reply: oneshot::Sender<FileReply>,
    },
    CancelFetch {
        file: String,
    },
    ListDirectory {
        path: String,
        reply: oneshot::Sender<Vec<String>>,
    },
    Activate {
        point: String,
        action_type: String,
        scope: ProcessScope,
    },
    Deactivate {
        point: String,
        action_type: String,
    },
    Instrument {
        specs: Vec<LocationSpec>,
    },
    /// Run a closure against the database on the session thread.
    WithDatabase(DbTask),
    Quit {
        reason: String,
    },
}

/// Who is on the other end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectorInfo {
    pub program: String,
    pub pid: i32,
}

/// Counts from the last `InstrumentationDone`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstrumentSummary {
    pub points: i32,
    pub actions: i32,
    pub failures: i32,
}

/// How a session ended.
#[derive(Debug)]
pub struct SessionOutcome {
    pub reason: String,
    pub collector: Option<CollectorInfo>,
    pub instrumented: Option<InstrumentSummary>,
    pub db: ProgramDatabase,
}

pub struct ClientSession {
    channel: Box<dyn MessageChannel>,
    db: ProgramDatabase,
    fetcher: FileFetcher,
    heartbeat: Option<HeartbeatTimer>,
    diag: Diagnostics,
    events: mpsc::UnboundedReceiver<UiEvent>,
    sender: mpsc::UnboundedSender<UiEvent>,
    collector: Option<CollectorInfo>,
    instrumented: Option<InstrumentSummary>,
}

impl ClientSession {
    pub fn new(channel: Box<dyn MessageChannel>, db: ProgramDatabase) -> Self {
        let (sender, events) = mpsc::unbounded_channel();
        Self {
            channel,
            db,
            fetcher: FileFetcher::new(),
            heartbeat: None,
            diag: Diagnostics::new(),
            events,
            sender,
            collector: None,
            instrumented: None,
        }
    }

    /// Send `GUI_HEARTBEAT` every `interval`; zero disables it.
    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat = (!interval.is_zero()).then(|| HeartbeatTimer::new(interval));
        self
    }

    /// A handle for async callers. `progress_delay` is how long a fetch
    /// waits before logging that it is still pending.
    pub fn handle(&self, progress_delay: Duration) -> SessionHandle {
        SessionHandle {
            sender: self.sender.clone(),
            progress_delay,
        }
    }

    pub fn db(&self) -> &ProgramDatabase {
        &self.db
    }

    pub fn db_mut(&mut self) -> &mut ProgramDatabase {
        &mut self.db
    }

    fn send(&mut self, cmd: CollectorCommand, id: i32) -> Result<()> {
        let frame = cmd
            .to_frame(id)
            .with_context(|| format!("Failed to encode {}", cmd.tag()))?;
        self.channel
            .send(frame)
            .context("Failed to send to collector")?;
        Ok(())
    }

    fn send_outgoing(&mut self, outgoing: Option<Outgoing>) -> Result<()> {
        match outgoing {
            Some((id, cmd)) => self.send(cmd, id),
            None => Ok(()),
        }
    }

    fn handle_ui(&mut self, event: UiEvent) -> Result<Flow> {
        match event {
            UiEvent::FetchFile { file, reply } => {
                let out = self.fetcher.request_file(&file, reply)?;
                self.send_outgoing(out)?;
            }
            UiEvent::CancelFetch { file } => {
                let out = self.fetcher.cancel(&file);
                self.send_outgoing(out)?;
            }
            UiEvent::ListDirectory { path, reply } => {
                let out = self.fetcher.request_directory(&path, reply)?;
                self.send_outgoing(out)?;
            }
            UiEvent::Activate {
                point,
                action_type,
                scope,
            } => self.send(
                CollectorCommand::ActivateAction {
                    point,
                    action_type,
                    scope,
                },
                0,
            )?,
            UiEvent::Deactivate { point, action_type } => self.send(
                CollectorCommand::DeactivateAction { point, action_type },
                0,
            )?,
            UiEvent::Instrument { specs } => {
                self.send(CollectorCommand::InstrumentLocations { specs }, 0)?
            }
            UiEvent::WithDatabase(task) => task(&mut self.db),
            UiEvent::Quit { reason } => return Ok(Flow::Quit(reason)),
        }
        Ok(Flow::Continue)
    }

    /// Apply one collector frame.
    pub fn handle_frame(&mut self, frame: Frame) -> Result<Flow> {
        let cmd = match DbCommand::from_frame(&frame) {
            Ok(cmd) => cmd,
            Err(ProtocolError::UnknownTag(tag)) => {
                self.diag.unknown_tag(tag);
                return Ok(Flow::Continue);
            }
            Err(ProtocolError::WrongDirection(tag)) => {
                warn!("ignoring {} sent to a client", tag);
                return Ok(Flow::Continue);
            }
            Err(e) => return Err(e).context("Malformed message from collector"),
        };
        let tag = cmd.tag();
        FRAMES_DISPATCHED.with_label_values(&[tag.name()]).inc();
        debug!("received {} (id {})", tag, frame.id);
        self.apply(cmd, frame.id)
            .with_context(|| format!("Failed to apply {}", tag))
    }

    fn apply(&mut self, cmd: DbCommand, id: i32) -> Result<Flow> {
        let db = &mut self.db;
        match cmd {
            DbCommand::InsertFile { name } => {
                db.insert_file(&name);
            }
            DbCommand::InsertFunction {
                name,
                file,
                start_line,
                end_line,
            } => {
                db.insert_function(&name, &file, start_line, end_line)?;
            }
            DbCommand::InsertEntry {
                function,
                entry,
                line,
                index_in_line,
                tooltip,
            } => {
                db.insert_entry(&function, &entry, line, index_in_line, &tooltip)?;
            }
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
            } => {
                let point = PointInfo {
                    kind,
                    location,
                    callee,
                    call_index,
                };
                db.insert_inst_point(&function, &entry, line, index_in_line, &tooltip, point)?;
            }
            DbCommand::DeclareDataAttr {
                tag,
                description,
                data_type,
                suggested,
            } => {
                db.declare_data_attr(&tag, &description, data_type, suggested)?;
            }
            DbCommand::SetInt(t, v) => {
                db.set_int(&t.function, &t.entry, &t.attr, t.task, t.thread, v)?
            }
            DbCommand::AddInt(t, v) => {
                db.add_int(&t.function, &t.entry, &t.attr, t.task, t.thread, v)?
            }
            DbCommand::SetDouble(t, v) => {
                db.set_double(&t.function, &t.entry, &t.attr, t.task, t.thread, v)?
            }
            DbCommand::AddDouble(t, v) => {
                db.add_double(&t.function, &t.entry, &t.attr, t.task, t.thread, v)?
            }
            DbCommand::DeclareAction {
                tag,
                menu_text,
                tooltip,
                initial_state,
            } => {
                db.declare_action(&tag, &menu_text, &tooltip, &initial_state)?;
            }
            DbCommand::DeclareActionState {
                action,
                state,
                pixmap,
                menu_text,
                tooltip,
            } => {
                let decl = ActionStateDecl {
                    pixmap,
                    menu_text,
                    tooltip,
                };
                db.declare_action_state(&action, &state, decl)?;
            }
            DbCommand::EnableTransition { action, from, to } => {
                db.enable_transition(&action, &from, &to)?
            }
            DbCommand::EnableAction {
                function,
                entry,
                action,
            } => db.enable_action(&function, &entry, &action)?,
            DbCommand::SetActionState {
                function,
                entry,
                action,
                task,
                state,
                ..
            } => db.set_action_state(&function, &entry, &action, task, &state)?,
            DbCommand::InsertPtPair { task, thread } => {
                db.insert_pt_pair(task, thread);
            }
            DbCommand::DeclareMessageFolder { tag, title } => {
                db.declare_message_folder(&tag, &title)?;
            }
            DbCommand::AddMessage {
                folder,
                text,
                tracebacks,
            } => {
                db.add_message(&folder, &text, tracebacks)?;
            }
            DbCommand::FunctionParsed { function } => db.mark_function_parsed(&function)?,
            DbCommand::FileParsed { file } => db.mark_file_parsed(&file)?,
            DbCommand::FileFullPath { file, path } => {
                if db.file(&file).is_some() {
                    db.set_file_full_path(&file, &path)?;
                }
                if !self.fetcher.on_full_path(id, path) {
                    debug!("unsolicited full path for {}", file);
                }
            }
            DbCommand::FileContents { file, text } => {
                if !self.fetcher.on_contents(id, text) {
                    debug!("unsolicited contents of {}", file);
                }
            }
            DbCommand::FileNotFound { file } => {
                if !self.fetcher.on_not_found(id) {
                    debug!("unsolicited not-found for {}", file);
                }
            }
            DbCommand::DirectoryListing { path, subdirs } => {
                if !self.fetcher.on_directory(id, subdirs) {
                    debug!("unsolicited listing of {}", path);
                }
            }
            DbCommand::CollectorHello { program, pid } => {
                info!("Collector for {} (pid {}) connected", program, pid);
                self.collector = Some(CollectorInfo { program, pid });
            }
            DbCommand::Status { text } => info!("collector: {}", text),
            DbCommand::InstrumentationDone {
                points,
                actions,
                failures,
            } => {
                info!(
                    "Instrumented {} points, {} actions, {} failures",
                    points, actions, failures
                );
                self.instrumented = Some(InstrumentSummary {
                    points,
                    actions,
                    failures,
                });
            }
            DbCommand::CollectorQuit { reason } => return Ok(Flow::Quit(reason)),
        }
        Ok(Flow::Continue)
    }

    /// Drain UI requests, heartbeat if due, then wait briefly for a frame.
    pub fn step(&mut self) -> Result<Flow> {
        while let Ok(event) = self.events.try_recv() {
            if let Flow::Quit(reason) = self.handle_ui(event)? {
                return Ok(Flow::Quit(reason));
            }
        }
        if self.heartbeat.as_mut().is_some_and(HeartbeatTimer::due) {
            self.send(CollectorCommand::Heartbeat, 0)?;
        }
        self.channel.flush()?;

        let wait = self
            .heartbeat
            .as_ref()
            .map_or(POLL_INTERVAL, |h| h.until_next().min(POLL_INTERVAL));
        let flow = match self.channel.recv_timeout(wait)? {
            Received::Frame(frame) => self.handle_frame(frame)?,
            Received::Empty => Flow::Continue,
            Received::Closed => Flow::Quit("collector closed the connection".to_string()),
        };
        self.channel.flush()?;
        Ok(flow)
    }

    fn run_inner(&mut self) -> Result<String> {
        loop {
            if let Flow::Quit(reason) = self.step()? {
                return Ok(reason);
            }
        }
    }

    fn notify_quit(&mut self, reason: &str, times: usize) {
        for _ in 0..times {
            let _ = self.send(
                CollectorCommand::Quit {
                    reason: reason.to_string(),
                },
                0,
            );
        }
        let _ = self.channel.flush();
    }

    /// Run until the collector quits, the channel closes or the UI asks to stop.
    ///
    /// On a fatal error the collector is told twice, the channel flushed,
    /// and the error returned after a short grace period.
    pub fn run(mut self) -> Result<SessionOutcome> {
        let result = self.run_inner();
        self.fetcher.abandon_all();
        match result {
            Ok(reason) => {
                info!("session ended: {}", reason);
                self.notify_quit(&reason, 1);
                Ok(SessionOutcome {
                    reason,
                    collector: self.collector,
                    instrumented: self.instrumented,
                    db: self.db,
                })
            }
            Err(e) => {
                FATAL_ERRORS.inc();
                error!("session failed: {:#}", e);
                self.notify_quit(&format!("client error: {:#}", e), 2);
                std::thread::sleep(QUIT_GRACE);
                Err(e)
            }
        }
    }
}

/// Async front for a running [`ClientSession`].
#[derive(Clone)]
pub struct SessionHandle {
    sender: mpsc::UnboundedSender<UiEvent>,
    progress_delay: Duration,
}

impl SessionHandle {
    fn post(&self, event: UiEvent) -> Result<()> {
        self.sender
            .send(event)
            .map_err(|_| anyhow!("client session has ended"))
    }

    /// Fetch a source file through the collector.
    pub async fn fetch_file(&self, file: &str) -> Result<FileReply> {
        let (reply, mut rx) = oneshot::channel();
        self.post(UiEvent::FetchFile {
            file: file.to_string(),
            reply,
        })?;
        let reply = match tokio::time::timeout(self.progress_delay, &mut rx).await {
            Ok(reply) => reply,
            Err(_) => {
                info!("Still fetching {}...", file);
                rx.await
            }
        };
        reply.map_err(|_| anyhow!("session ended before {} arrived", file))
    }

    pub fn cancel_fetch(&self, file: &str) -> Result<()> {
        self.post(UiEvent::CancelFetch {
            file: file.to_string(),
        })
    }

    pub async fn list_directory(&self, path: &str) -> Result<Vec<String>> {
        let (reply, rx) = oneshot::channel();
        self.post(UiEvent::ListDirectory {
            path: path.to_string(),
            reply,
        })?;
        rx.await
            .map_err(|_| anyhow!("session ended before listing {}", path))
    }

    pub fn activate(&self, point: &str, action_type: &str, scope: ProcessScope) -> Result<()> {
        self.post(UiEvent::Activate {
            point: point.to_string(),
            action_type: action_type.to_string(),
            scope,
        })
    }

    pub fn deactivate(&self, point: &str, action_type: &str) -> Result<()> {
        self.post(UiEvent::Deactivate {
            point: point.to_string(),
            action_type: action_type.to_string(),
        })
    }

    pub fn instrument(&self, specs: Vec<LocationSpec>) -> Result<()> {
        self.post(UiEvent::Instrument { specs })
    }

    /// Run `f` on the session thread and return its result.
    pub async fn with_database<R, F>(&self, f: F) -> Result<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut ProgramDatabase) -> R + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.post(UiEvent::WithDatabase(Box::new(move |db| {
            let _ = tx.send(f(db));
        })))?;
        rx.await.map_err(|_| anyhow!("client session has ended"))
    }

    pub fn quit(&self, reason: &str) -> Result<()> {
        self.post(UiEvent::Quit {
            reason: reason.to_string(),
        })
    }
}
