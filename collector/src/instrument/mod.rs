//! Collaborators the collector drives but does not implement itself
//!
//! The registry only needs four capabilities from the outside world:
//! enumerate program structure, resolve a point tag to its location,
//! install/activate/remove probes, and read source files. Each is a trait so
//! a real instrumentation library can be plugged in; this crate ships a
//! TOML-described [`StaticProgram`], a [`RecordingBackend`] and a filesystem
//! [`FsSourceProvider`].

pub mod backend;
pub mod manifest;
pub mod source;

pub use backend::{ProbeHit, RecordingBackend, ScriptedHit};
pub use manifest::StaticProgram;
pub use source::FsSourceProvider;

use crate::registry::ActionType;
use toolgear_shared::protocol::ProcessScope;
use toolgear_shared::types::program::{PointKind, PointLocation};
use thiserror::Error;

/// A function as reported by program structure enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionInfo {
    pub module: String,
    pub name: String,
    pub file: String,
    pub start_line: i32,
    pub end_line: i32,
}

/// One instrumentable point inside a function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstPoint {
    /// Unique point tag, also the client's entry key.
    pub tag: String,
    pub function: String,
    pub kind: PointKind,
    pub location: PointLocation,
    /// Called function, for call points.
    pub callee: Option<String>,
    pub line: i32,
    pub index_in_line: i32,
    pub call_index: i32,
}

impl InstPoint {
    /// The name an instrumentation pattern is matched against: the callee
    /// for call points, the containing function otherwise.
    pub fn match_name(&self) -> &str {
        match (&self.kind, &self.callee) {
            (PointKind::FuncCall, Some(callee)) => callee,
            _ => &self.function,
        }
    }

    pub fn tooltip(&self) -> String {
        match &self.callee {
            Some(callee) => format!("{} call to {} in {}", self.location, callee, self.function),
            None => format!("{} {} of {}", self.location, self.kind, self.function),
        }
    }
}

/// Modules, their functions, and each function's points, in discovery order.
pub trait ProgramStructure {
    fn modules(&self) -> Vec<String>;
    fn functions(&self, module: &str) -> Vec<FunctionInfo>;
    fn points(&self, module: &str, function: &str) -> Vec<InstPoint>;
}

/// Point tag to location.
pub trait LocationLookup {
    fn locate(&self, point_tag: &str) -> Option<(FunctionInfo, InstPoint)>;
}

/// Both views of the target program.
pub trait Program: ProgramStructure + LocationLookup + Send {
    fn name(&self) -> &str;
}

impl<P: Program + ?Sized> ProgramStructure for Box<P> {
    fn modules(&self) -> Vec<String> {
        (**self).modules()
    }

    fn functions(&self, module: &str) -> Vec<FunctionInfo> {
        (**self).functions(module)
    }

    fn points(&self, module: &str, function: &str) -> Vec<InstPoint> {
        (**self).points(module, function)
    }
}

impl<P: Program + ?Sized> LocationLookup for Box<P> {
    fn locate(&self, point_tag: &str) -> Option<(FunctionInfo, InstPoint)> {
        (**self).locate(point_tag)
    }
}

/// Opaque handle to an installed probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProbeHandle(pub u64);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProbeError {
    #[error("cannot install probe at {point}: {reason}")]
    Install { point: String, reason: String },

    #[error("cannot activate probe {0:?}")]
    Activate(ProbeHandle),

    #[error("unknown probe {0:?}")]
    UnknownProbe(ProbeHandle),
}

/// Probe lifecycle in the target program.
pub trait ProbeBackend: Send {
    fn install(
        &mut self,
        point: &InstPoint,
        action: &ActionType,
        scope: ProcessScope,
    ) -> Result<ProbeHandle, ProbeError>;

    fn activate(&mut self, handle: ProbeHandle) -> Result<(), ProbeError>;

    fn remove(&mut self, handle: ProbeHandle) -> Result<(), ProbeError>;

    /// Hits observed since the last call.
    fn poll_hits(&mut self) -> Vec<ProbeHit> {
        Vec::new()
    }
}

impl<B: ProbeBackend + ?Sized> ProbeBackend for Box<B> {
    fn install(
        &mut self,
        point: &InstPoint,
        action: &ActionType,
        scope: ProcessScope,
    ) -> Result<ProbeHandle, ProbeError> {
        (**self).install(point, action, scope)
    }

    fn activate(&mut self, handle: ProbeHandle) -> Result<(), ProbeError> {
        (**self).activate(handle)
    }

    fn remove(&mut self, handle: ProbeHandle) -> Result<(), ProbeError> {
        (**self).remove(handle)
    }

    fn poll_hits(&mut self) -> Vec<ProbeHit> {
        (**self).poll_hits()
    }
}

/// A source file as found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub full_path: String,
    pub text: String,
}

/// File contents and directory listings, or nothing.
pub trait SourceProvider: Send {
    fn read_file(&self, name: &str) -> Option<SourceFile>;
    fn list_subdirs(&self, path: &str) -> Option<Vec<String>>;
}
