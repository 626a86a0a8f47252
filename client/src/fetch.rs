//! Source file and directory requests to the collector
//!
//! Each request gets a correlator id; the collector echoes it on every
//! reply frame. A second request for a file already in flight joins the
//! first instead of going out again. A full-path notice may precede the
//! contents and is folded into the final [`FileReply`].

use crate::metrics::PENDING_FETCHES;
use std::collections::HashMap;
use tokio::sync::oneshot;
use toolgear_shared::protocol::{CollectorCommand, Correlator, CorrelatorError};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileReply {
    Contents {
        /// Set when the collector resolved the name to a different path.
        full_path: Option<String>,
        text: String,
    },
    NotFound,
}

enum Pending {
    File {
        file: String,
        full_path: Option<String>,
        cancelled: bool,
        waiters: Vec<oneshot::Sender<FileReply>>,
    },
    Directory {
        path: String,
        waiters: Vec<oneshot::Sender<Vec<String>>>,
    },
}

/// A request frame to send: correlator id plus command.
pub type Outgoing = (i32, CollectorCommand);

#[derive(Default)]
pub struct FileFetcher {
    pending: Correlator<Pending>,
    files: HashMap<String, i32>,
    dirs: HashMap<String, i32>,
}

impl FileFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.pending_len()
    }

    fn update_gauge(&self) {
        PENDING_FETCHES.set(self.pending.pending_len() as f64);
    }

    /// Ask for `file`. Returns the frame to send, or `None` when joining a
    /// request already in flight.
    pub fn request_file(
        &mut self,
        file: &str,
        reply: oneshot::Sender<FileReply>,
    ) -> Result<Option<Outgoing>, CorrelatorError> {
        if let Some(&id) = self.files.get(file) {
            if let Some(Pending::File { waiters, .. }) = self.pending.get_mut(id) {
                debug!("joining request {} for {}", id, file);
                waiters.push(reply);
                return Ok(None);
            }
        }
        let id = self.pending.register(Pending::File {
            file: file.to_string(),
            full_path: None,
            cancelled: false,
            waiters: vec![reply],
        })?;
        self.files.insert(file.to_string(), id);
        self.update_gauge();
        Ok(Some((
            id,
            CollectorCommand::RequestFile {
                file: file.to_string(),
            },
        )))
    }

    /// Tell the collector to stop working on `file`. Waiters keep waiting
    /// for whatever reply is already under way.
    pub fn cancel(&mut self, file: &str) -> Option<Outgoing> {
        let id = *self.files.get(file)?;
        match self.pending.get_mut(id) {
            Some(Pending::File { cancelled, .. }) if !*cancelled => {
                *cancelled = true;
                Some((
                    id,
                    CollectorCommand::CancelFileRequest {
                        file: file.to_string(),
                    },
                ))
            }
            _ => None,
        }
    }

    pub fn request_directory(
        &mut self,
        path: &str,
        reply: oneshot::Sender<Vec<String>>,
    ) -> Result<Option<Outgoing>, CorrelatorError> {
        if let Some(&id) = self.dirs.get(path) {
            if let Some(Pending::Directory { waiters, .. }) = self.pending.get_mut(id) {
                waiters.push(reply);
                return Ok(None);
            }
        }
        let id = self.pending.register(Pending::Directory {
            path: path.to_string(),
            waiters: vec![reply],
        })?;
        self.dirs.insert(path.to_string(), id);
        self.update_gauge();
        Ok(Some((
            id,
            CollectorCommand::RequestDirectory {
                path: path.to_string(),
            },
        )))
    }

    /// Record the resolved path for request `id`. False if `id` is not a
    /// pending file request.
    pub fn on_full_path(&mut self, id: i32, path: String) -> bool {
        match self.pending.get_mut(id) {
            Some(Pending::File { full_path, .. }) => {
                *full_path = Some(path);
                true
            }
            _ => false,
        }
    }

    pub fn on_contents(&mut self, id: i32, text: String) -> bool {
        self.finish_file(id, |full_path| FileReply::Contents { full_path, text })
    }

    pub fn on_not_found(&mut self, id: i32) -> bool {
        self.finish_file(id, |_| FileReply::NotFound)
    }

    fn finish_file(&mut self, id: i32, reply: impl FnOnce(Option<String>) -> FileReply) -> bool {
        if !matches!(self.pending.get_mut(id), Some(Pending::File { .. })) {
            return false;
        }
        let Some(Pending::File {
            file,
            full_path,
            waiters,
            ..
        }) = self.pending.complete(id)
        else {
            return false;
        };
        self.files.remove(&file);
        self.update_gauge();
        let reply = reply(full_path);
        debug!("request {} for {} answered ({} waiters)", id, file, waiters.len());
        for waiter in waiters {
            // A waiter that gave up is fine.
            let _ = waiter.send(reply.clone());
        }
        true
    }

    pub fn on_directory(&mut self, id: i32, subdirs: Vec<String>) -> bool {
        if !matches!(self.pending.get_mut(id), Some(Pending::Directory { .. })) {
            return false;
        }
        let Some(Pending::Directory { path, waiters }) = self.pending.complete(id) else {
            return false;
        };
        self.dirs.remove(&path);
        self.update_gauge();
        for waiter in waiters {
            let _ = waiter.send(subdirs.clone());
        }
        true
    }

    /// Drop every waiter; their receivers see the session end.
    pub fn abandon_all(&mut self) {
        let n = self.pending.drain().count();
        if n > 0 {
            debug!("abandoned {} pending requests", n);
        }
        self.files.clear();
        self.dirs.clear();
        self.update_gauge();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeat_request_joins_the_first() {
        let mut fetcher = FileFetcher::new();
        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();

        let (id, cmd) = fetcher.request_file("a.c", tx1).unwrap().unwrap();
        assert_eq!(
            cmd,
            CollectorCommand::RequestFile {
                file: "a.c".to_string()
            }
        );
        assert!(fetcher.request_file("a.c", tx2).unwrap().is_none());
        assert_eq!(fetcher.pending_len(), 1);

        assert!(fetcher.on_full_path(id, "/src/a.c".to_string()));
        assert!(fetcher.on_contents(id, "int x;".to_string()));
        let expected = FileReply::Contents {
            full_path: Some("/src/a.c".to_string()),
            text: "int x;".to_string(),
        };
        assert_eq!(rx1.try_recv().unwrap(), expected);
        assert_eq!(rx2.try_recv().unwrap(), expected);
        assert_eq!(fetcher.pending_len(), 0);

        // Completed ids do not match again.
        assert!(!fetcher.on_contents(id, String::new()));
    }

    #[test]
    fn test_not_found_and_cancel() {
        let mut fetcher = FileFetcher::new();
        let (tx, mut rx) = oneshot::channel();
        let (id, _) = fetcher.request_file("gone.c", tx).unwrap().unwrap();

        let (cancel_id, cmd) = fetcher.cancel("gone.c").unwrap();
        assert_eq!(cancel_id, id);
        assert!(matches!(cmd, CollectorCommand::CancelFileRequest { .. }));
        assert!(fetcher.cancel("gone.c").is_none());

        assert!(fetcher.on_not_found(id));
        assert_eq!(rx.try_recv().unwrap(), FileReply::NotFound);
        assert!(fetcher.cancel("gone.c").is_none());
    }

    #[test]
    fn test_directory_reply_does_not_complete_a_file() {
        let mut fetcher = FileFetcher::new();
        let (ftx, _frx) = oneshot::channel();
        let (dtx, mut drx) = oneshot::channel();
        let (file_id, _) = fetcher.request_file("a.c", ftx).unwrap().unwrap();
        let (dir_id, _) = fetcher.request_directory("/src", dtx).unwrap().unwrap();
        assert_ne!(file_id, dir_id);

        assert!(!fetcher.on_directory(file_id, vec![]));
        assert!(fetcher.on_directory(dir_id, vec!["lib".to_string()]));
        assert_eq!(drx.try_recv().unwrap(), vec!["lib".to_string()]);
        assert_eq!(fetcher.pending_len(), 1);

        fetcher.abandon_all();
        assert_eq!(fetcher.pending_len(), 0);
    }
}
