//! In-process probe backend
//!
//! Keeps installed probes in a table instead of patching a live process.
//! Activation can replay scripted hits so a collector run produces data
//! without a real target.

use super::{InstPoint, ProbeBackend, ProbeError, ProbeHandle};
use crate::registry::ActionType;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use toolgear_shared::protocol::ProcessScope;
use tracing::debug;

/// One observed probe firing.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeHit {
    pub handle: ProbeHandle,
    pub task: i32,
    pub thread: i32,
    /// Measurement carried by the hit (e.g. elapsed seconds).
    pub value: f64,
}

fn one() -> u32 {
    1
}

fn unit_value() -> f64 {
    1.0
}

/// Hits to replay whenever a probe at `point` is activated.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ScriptedHit {
    pub point: String,
    #[serde(default)]
    pub task: i32,
    #[serde(default)]
    pub thread: i32,
    #[serde(default = "one")]
    pub count: u32,
    #[serde(default = "unit_value")]
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledProbe {
    pub point: String,
    pub action_type: String,
    pub scope: ProcessScope,
    pub active: bool,
}

impl InstalledProbe {
    fn covers(&self, task: i32) -> bool {
        match self.scope {
            ProcessScope::All => true,
            ProcessScope::Task(t) => t == task,
        }
    }
}

#[derive(Debug, Default)]
pub struct RecordingBackend {
    next_handle: u64,
    probes: BTreeMap<ProbeHandle, InstalledProbe>,
    script: Vec<ScriptedHit>,
    failing_points: HashSet<String>,
    pending: Vec<ProbeHit>,
    removed: Vec<ProbeHandle>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(script: Vec<ScriptedHit>) -> Self {
        Self {
            script,
            ..Self::default()
        }
    }

    /// Make every install at `point` fail.
    pub fn fail_installs_at(&mut self, point: &str) {
        self.failing_points.insert(point.to_string());
    }

    pub fn probe(&self, handle: ProbeHandle) -> Option<&InstalledProbe> {
        self.probes.get(&handle)
    }

    pub fn installed(&self) -> impl Iterator<Item = (ProbeHandle, &InstalledProbe)> {
        self.probes.iter().map(|(h, p)| (*h, p))
    }

    pub fn removed(&self) -> &[ProbeHandle] {
        &self.removed
    }

    /// Fire every active probe at `point` that covers `task`.
    pub fn fire(&mut self, point: &str, task: i32, thread: i32, value: f64) -> usize {
        let hits: Vec<ProbeHit> = self
            .probes
            .iter()
            .filter(|(_, p)| p.active && p.point == point && p.covers(task))
            .map(|(handle, _)| ProbeHit {
                handle: *handle,
                task,
                thread,
                value,
            })
            .collect();
        let n = hits.len();
        self.pending.extend(hits);
        n
    }
}

impl ProbeBackend for RecordingBackend {
    fn install(
        &mut self,
        point: &InstPoint,
        action: &ActionType,
        scope: ProcessScope,
    ) -> Result<ProbeHandle, ProbeError> {
        if self.failing_points.contains(&point.tag) {
            return Err(ProbeError::Install {
                point: point.tag.clone(),
                reason: "instrumentation refused".to_string(),
            });
        }
        self.next_handle += 1;
        let handle = ProbeHandle(self.next_handle);
        self.probes.insert(
            handle,
            InstalledProbe {
                point: point.tag.clone(),
                action_type: action.tag.clone(),
                scope,
                active: false,
            },
        );
        debug!("installed probe {:?} at {} ({})", handle, point.tag, action.tag);
        Ok(handle)
    }

    fn activate(&mut self, handle: ProbeHandle) -> Result<(), ProbeError> {
        let probe = self
            .probes
            .get_mut(&handle)
            .ok_or(ProbeError::UnknownProbe(handle))?;
        probe.active = true;
        let probe = probe.clone();

        for scripted in self.script.iter().filter(|s| s.point == probe.point) {
            if !probe.covers(scripted.task) {
                continue;
            }
            for _ in 0..scripted.count {
                self.pending.push(ProbeHit {
                    handle,
                    task: scripted.task,
                    thread: scripted.thread,
                    value: scripted.value,
                });
            }
        }
        Ok(())
    }

    fn remove(&mut self, handle: ProbeHandle) -> Result<(), ProbeError> {
        self.probes
            .remove(&handle)
            .ok_or(ProbeError::UnknownProbe(handle))?;
        self.pending.retain(|hit| hit.handle != handle);
        self.removed.push(handle);
        Ok(())
    }

    fn poll_hits(&mut self) -> Vec<ProbeHit> {
        std::mem::take(&mut self.pending)
    }
}
