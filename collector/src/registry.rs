//! Action points and their actions
//!
//! For every (point, action type) pair the registry is in one of two
//! states: absent, or installed and active. An [`ActionPoint`] is created
//! the first time an action is activated at its location and destroyed when
//! its last action is removed. Action ids within a point are stable and
//! never reused; [`ActionPoint::num_actions`] is the high-water mark of ids
//! handed out, not the live count.

use crate::instrument::{
    FunctionInfo, InstPoint, LocationLookup, ProbeBackend, ProbeError, ProbeHandle, ProbeHit,
    ProgramStructure,
};
use regex::Regex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use toolgear_shared::protocol::{DbCommand, LocationSpec, ProcessScope};
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown action point '{0}'")]
    UnknownPoint(String),

    #[error("unknown action type '{0}'")]
    UnknownActionType(String),

    #[error("action type '{0}' registered twice")]
    DuplicateActionType(String),

    #[error("invalid location pattern '{pattern}': {source}")]
    BadPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error(transparent)]
    Probe(#[from] ProbeError),
}

/// What a probe callback gets to see when its probe fires.
pub struct HitContext<'a> {
    pub function: &'a FunctionInfo,
    pub point: &'a InstPoint,
    pub hit: &'a ProbeHit,
}

pub type ProbeCallback = Arc<dyn Fn(&HitContext<'_>) -> Option<DbCommand> + Send + Sync>;

/// A kind of instrumentation, immutable once registered.
#[derive(Clone)]
pub struct ActionType {
    pub tag: String,
    pub module: String,
    pub function: String,
    callback: Option<ProbeCallback>,
}

impl ActionType {
    pub fn new(tag: &str, module: &str, function: &str) -> Self {
        Self {
            tag: tag.to_string(),
            module: module.to_string(),
            function: function.to_string(),
            callback: None,
        }
    }

    pub fn with_callback(
        mut self,
        callback: impl Fn(&HitContext<'_>) -> Option<DbCommand> + Send + Sync + 'static,
    ) -> Self {
        self.callback = Some(Arc::new(callback));
        self
    }

    pub fn callback(&self) -> Option<&ProbeCallback> {
        self.callback.as_ref()
    }
}

impl fmt::Debug for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionType")
            .field("tag", &self.tag)
            .field("module", &self.module)
            .field("function", &self.function)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

/// Registered action types by tag.
#[derive(Debug, Default)]
pub struct ActionTypes {
    types: BTreeMap<String, Arc<ActionType>>,
}

impl ActionTypes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, action: ActionType) -> Result<(), RegistryError> {
        if self.types.contains_key(&action.tag) {
            return Err(RegistryError::DuplicateActionType(action.tag));
        }
        self.types.insert(action.tag.clone(), Arc::new(action));
        Ok(())
    }

    pub fn get(&self, tag: &str) -> Option<Arc<ActionType>> {
        self.types.get(tag).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ActionType>> {
        self.types.values()
    }
}

/// Stable id of an action within its point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActionId(pub u32);

#[derive(Debug, Clone)]
pub struct Action {
    pub type_tag: String,
    pub text: String,
    pub scope: ProcessScope,
    pub probe: ProbeHandle,
}

#[derive(Debug)]
pub struct ActionPoint {
    pub function: FunctionInfo,
    pub point: InstPoint,
    actions: BTreeMap<ActionId, Action>,
    high_water: u32,
}

impl ActionPoint {
    fn new(function: FunctionInfo, point: InstPoint) -> Self {
        Self {
            function,
            point,
            actions: BTreeMap::new(),
            high_water: 0,
        }
    }

    pub fn tag(&self) -> &str {
        &self.point.tag
    }

    /// Number of action ids ever handed out at this point.
    pub fn num_actions(&self) -> u32 {
        self.high_water
    }

    pub fn live_actions(&self) -> usize {
        self.actions.len()
    }

    pub fn action(&self, id: ActionId) -> Option<&Action> {
        self.actions.get(&id)
    }

    pub fn actions(&self) -> impl Iterator<Item = (ActionId, &Action)> {
        self.actions.iter().map(|(id, a)| (*id, a))
    }

    pub fn find_type(&self, type_tag: &str) -> Option<ActionId> {
        self.actions
            .iter()
            .find(|(_, a)| a.type_tag == type_tag)
            .map(|(id, _)| *id)
    }

    fn push(&mut self, action: Action) -> ActionId {
        let id = ActionId(self.high_water);
        self.high_water += 1;
        self.actions.insert(id, action);
        id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Activated(ActionId),
    AlreadyActive(ActionId),
}

/// Outcome of a bulk instrumentation request, in program parse order.
#[derive(Debug, Default)]
pub struct InstrumentReport {
    /// Functions with at least one matching point.
    pub functions: Vec<FunctionInfo>,
    pub points: Vec<InstPoint>,
    /// (point tag, action type) pairs active after the request.
    pub enabled: Vec<(String, String)>,
    pub activated: usize,
    pub already_active: usize,
    /// (point tag, action type, reason) for each failed activation.
    pub failures: Vec<(String, String, String)>,
}

pub struct ActionPointRegistry<B> {
    backend: B,
    points: HashMap<String, ActionPoint>,
    failures: u64,
}

impl<B: ProbeBackend> ActionPointRegistry<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            points: HashMap::new(),
            failures: 0,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn point(&self, tag: &str) -> Option<&ActionPoint> {
        self.points.get(tag)
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Activation failures seen so far.
    pub fn failures(&self) -> u64 {
        self.failures
    }

    /// Activate one action type at a point, creating the point on demand.
    pub fn activate_one(
        &mut self,
        lookup: &dyn LocationLookup,
        point_tag: &str,
        action_type: &ActionType,
        scope: ProcessScope,
    ) -> Result<Activation, RegistryError> {
        if !self.points.contains_key(point_tag) {
            let (function, point) = lookup
                .locate(point_tag)
                .ok_or_else(|| RegistryError::UnknownPoint(point_tag.to_string()))?;
            self.points
                .insert(point_tag.to_string(), ActionPoint::new(function, point));
        }
        self.activate_existing(point_tag, action_type, scope)
    }

    fn activate_at(
        &mut self,
        function: &FunctionInfo,
        point: &InstPoint,
        action_type: &ActionType,
        scope: ProcessScope,
    ) -> Result<Activation, RegistryError> {
        if !self.points.contains_key(&point.tag) {
            self.points.insert(
                point.tag.clone(),
                ActionPoint::new(function.clone(), point.clone()),
            );
        }
        self.activate_existing(&point.tag, action_type, scope)
    }

    fn activate_existing(
        &mut self,
        point_tag: &str,
        action_type: &ActionType,
        scope: ProcessScope,
    ) -> Result<Activation, RegistryError> {
        let ap = self
            .points
            .get_mut(point_tag)
            .ok_or_else(|| RegistryError::UnknownPoint(point_tag.to_string()))?;

        if let Some(id) = ap.find_type(&action_type.tag) {
            info!(
                "{} already active at {}, skipping",
                action_type.tag, point_tag
            );
            return Ok(Activation::AlreadyActive(id));
        }

        let installed = self
            .backend
            .install(&ap.point, action_type, scope)
            .and_then(|probe| match self.backend.activate(probe) {
                Ok(()) => Ok(probe),
                Err(e) => {
                    if let Err(cleanup) = self.backend.remove(probe) {
                        warn!("failed to remove half-installed probe: {}", cleanup);
                    }
                    Err(e)
                }
            });

        match installed {
            Ok(probe) => {
                let id = ap.push(Action {
                    type_tag: action_type.tag.clone(),
                    text: format!("{} at {}", action_type.tag, point_tag),
                    scope,
                    probe,
                });
                debug!("activated {} at {} as {:?}", action_type.tag, point_tag, id);
                Ok(Activation::Activated(id))
            }
            Err(e) => {
                self.failures += 1;
                if ap.live_actions() == 0 {
                    self.points.remove(point_tag);
                }
                Err(e.into())
            }
        }
    }

    /// Remove the action of `type_tag` at a point. Returns the removed id,
    /// or `None` if that type was not active there.
    pub fn deactivate_one(
        &mut self,
        point_tag: &str,
        type_tag: &str,
    ) -> Result<Option<ActionId>, RegistryError> {
        let ap = self
            .points
            .get_mut(point_tag)
            .ok_or_else(|| RegistryError::UnknownPoint(point_tag.to_string()))?;

        let Some(id) = ap.find_type(type_tag) else {
            debug!("{} not active at {}", type_tag, point_tag);
            return Ok(None);
        };
        let removed = ap.actions.remove(&id);
        if ap.actions.is_empty() {
            debug!("dropping action point {}", point_tag);
            self.points.remove(point_tag);
        }
        if let Some(action) = removed {
            self.backend.remove(action.probe)?;
        }
        Ok(Some(id))
    }

    /// Match `specs` against the whole program and activate every hit.
    ///
    /// All patterns are compiled before anything is touched. Individual
    /// activation failures are logged and counted; the loop carries on.
    pub fn instrument_locations(
        &mut self,
        program: &dyn ProgramStructure,
        types: &ActionTypes,
        specs: &[LocationSpec],
    ) -> Result<InstrumentReport, RegistryError> {
        let mut compiled = Vec::with_capacity(specs.len());
        for spec in specs {
            let regex = Regex::new(&spec.pattern).map_err(|source| RegistryError::BadPattern {
                pattern: spec.pattern.clone(),
                source,
            })?;
            let action = types
                .get(&spec.action_type)
                .ok_or_else(|| RegistryError::UnknownActionType(spec.action_type.clone()))?;
            compiled.push((spec, regex, action));
        }

        // point tag -> (function, point, matching spec indices), in parse order
        let mut matched: Vec<(FunctionInfo, InstPoint, Vec<usize>)> = Vec::new();
        let mut position: HashMap<String, usize> = HashMap::new();
        let mut report = InstrumentReport::default();
        let mut reported_functions: HashSet<(String, String)> = HashSet::new();

        for module in program.modules() {
            for function in program.functions(&module) {
                for point in program.points(&module, &function.name) {
                    for (i, (spec, regex, _)) in compiled.iter().enumerate() {
                        if !spec.kind.matches(point.kind)
                            || !spec.location.matches(point.location)
                            || !regex.is_match(point.match_name())
                        {
                            continue;
                        }
                        let pos = match position.get(&point.tag) {
                            Some(&pos) => pos,
                            None => {
                                let key = (function.module.clone(), function.name.clone());
                                if reported_functions.insert(key) {
                                    report.functions.push(function.clone());
                                }
                                report.points.push(point.clone());
                                position.insert(point.tag.clone(), matched.len());
                                matched.push((function.clone(), point.clone(), Vec::new()));
                                matched.len() - 1
                            }
                        };
                        matched[pos].2.push(i);
                    }
                }
            }
        }

        for (function, point, spec_indices) in &matched {
            for &i in spec_indices {
                let action = &compiled[i].2;
                match self.activate_at(function, point, action, ProcessScope::All) {
                    Ok(Activation::Activated(_)) => {
                        report.activated += 1;
                        report.enabled.push((point.tag.clone(), action.tag.clone()));
                    }
                    Ok(Activation::AlreadyActive(_)) => {
                        report.already_active += 1;
                        report.enabled.push((point.tag.clone(), action.tag.clone()));
                    }
                    Err(e) => {
                        warn!("could not instrument {} with {}: {}", point.tag, action.tag, e);
                        report
                            .failures
                            .push((point.tag.clone(), action.tag.clone(), e.to_string()));
                    }
                }
            }
        }

        info!(
            "instrumented {} points ({} activated, {} already active, {} failed)",
            report.points.len(),
            report.activated,
            report.already_active,
            report.failures.len()
        );
        Ok(report)
    }

    /// Drain probe hits from the backend.
    pub fn poll_hits(&mut self) -> Vec<ProbeHit> {
        self.backend.poll_hits()
    }

    /// Find the point and action a probe belongs to.
    pub fn resolve_probe(&self, probe: ProbeHandle) -> Option<(&ActionPoint, &Action)> {
        self.points.values().find_map(|ap| {
            ap.actions
                .values()
                .find(|a| a.probe == probe)
                .map(|a| (ap, a))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::{RecordingBackend, StaticProgram};
    use toolgear_shared::types::program::{PointKind, PointLocation};

    const PROGRAM: &str = r#"
program = "demo"

[[module]]
name = "demo"

[[module.function]]
name = "main"
file = "main.c"
start_line = 1
end_line = 30

[[module.function.point]]
kind = "entry"
line = 1

[[module.function.point]]
kind = "call"
callee = "work"
line = 10

[[module.function.point]]
kind = "exit"
line = 30

[[module.function]]
name = "work"
file = "work.c"
start_line = 1
end_line = 9

[[module.function.point]]
kind = "entry"
line = 1

[[module.function.point]]
kind = "exit"
line = 9
"#;

    fn setup() -> (StaticProgram, ActionTypes, ActionPointRegistry<RecordingBackend>) {
        let program = StaticProgram::from_toml_str(PROGRAM).unwrap();
        let mut types = ActionTypes::new();
        types
            .register(ActionType::new("count", "toolgear", "count_calls"))
            .unwrap();
        types
            .register(ActionType::new("time", "toolgear", "time_calls"))
            .unwrap();
        (program, types, ActionPointRegistry::new(RecordingBackend::new()))
    }

    fn spec(pattern: &str, kind: PointKind, location: PointLocation, action: &str) -> LocationSpec {
        LocationSpec {
            pattern: pattern.to_string(),
            kind,
            location,
            action_type: action.to_string(),
        }
    }

    #[test]
    fn test_action_ids_stable_and_high_water() {
        let (program, types, mut reg) = setup();
        let count = types.get("count").unwrap();
        let time = types.get("time").unwrap();

        let a = reg
            .activate_one(&program, "main:entry", &count, ProcessScope::All)
            .unwrap();
        let b = reg
            .activate_one(&program, "main:entry", &time, ProcessScope::All)
            .unwrap();
        assert_eq!(a, Activation::Activated(ActionId(0)));
        assert_eq!(b, Activation::Activated(ActionId(1)));

        assert_eq!(reg.deactivate_one("main:entry", "count").unwrap(), Some(ActionId(0)));
        let again = reg
            .activate_one(&program, "main:entry", &count, ProcessScope::All)
            .unwrap();
        assert_eq!(again, Activation::Activated(ActionId(2)));

        let ap = reg.point("main:entry").unwrap();
        assert_eq!(ap.num_actions(), 3);
        assert_eq!(ap.live_actions(), 2);
        assert_eq!(ap.action(ActionId(1)).unwrap().type_tag, "time");
    }

    #[test]
    fn test_duplicate_activation_is_idempotent() {
        let (program, types, mut reg) = setup();
        let count = types.get("count").unwrap();
        reg.activate_one(&program, "work:entry", &count, ProcessScope::All)
            .unwrap();
        let second = reg
            .activate_one(&program, "work:entry", &count, ProcessScope::Task(3))
            .unwrap();
        assert_eq!(second, Activation::AlreadyActive(ActionId(0)));
        assert_eq!(reg.backend().installed().count(), 1);
        assert_eq!(reg.point("work:entry").unwrap().num_actions(), 1);
    }

    #[test]
    fn test_point_dropped_with_last_action() {
        let (program, types, mut reg) = setup();
        let count = types.get("count").unwrap();
        reg.activate_one(&program, "main:exit", &count, ProcessScope::All)
            .unwrap();
        assert_eq!(reg.deactivate_one("main:exit", "time").unwrap(), None);
        assert_eq!(reg.deactivate_one("main:exit", "count").unwrap(), Some(ActionId(0)));
        assert!(reg.point("main:exit").is_none());
        assert_eq!(reg.backend().removed().len(), 1);
        assert!(matches!(
            reg.deactivate_one("main:exit", "count"),
            Err(RegistryError::UnknownPoint(_))
        ));
    }

    #[test]
    fn test_unknown_point_activation() {
        let (program, types, mut reg) = setup();
        let count = types.get("count").unwrap();
        assert!(matches!(
            reg.activate_one(&program, "ghost:entry", &count, ProcessScope::All),
            Err(RegistryError::UnknownPoint(_))
        ));
        assert!(reg.is_empty());
    }

    #[test]
    fn test_failed_install_leaves_no_point() {
        let (program, types, mut reg) = setup();
        reg.backend_mut().fail_installs_at("main:entry");
        let count = types.get("count").unwrap();
        assert!(reg
            .activate_one(&program, "main:entry", &count, ProcessScope::All)
            .is_err());
        assert!(reg.point("main:entry").is_none());
        assert_eq!(reg.failures(), 1);
    }

    #[test]
    fn test_bad_pattern_aborts_before_instrumenting() {
        let (program, types, mut reg) = setup();
        let specs = vec![
            spec("main", PointKind::Any, PointLocation::Any, "count"),
            spec("(", PointKind::Any, PointLocation::Any, "count"),
        ];
        assert!(matches!(
            reg.instrument_locations(&program, &types, &specs),
            Err(RegistryError::BadPattern { .. })
        ));
        assert!(reg.is_empty());
        assert_eq!(reg.backend().installed().count(), 0);
    }

    #[test]
    fn test_call_points_match_on_callee() {
        let (program, types, mut reg) = setup();
        let specs = vec![spec("^work$", PointKind::Any, PointLocation::Any, "count")];
        let report = reg.instrument_locations(&program, &types, &specs).unwrap();

        let tags: Vec<&str> = report.points.iter().map(|p| p.tag.as_str()).collect();
        // main's call to work matches on the callee; work's own points on the function
        assert_eq!(tags, vec!["main:call:work:1", "work:entry", "work:exit"]);
        let funcs: Vec<&str> = report.functions.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(funcs, vec!["main", "work"]);
        assert_eq!(report.activated, 3);
    }

    #[test]
    fn test_union_of_specs_and_failures_counted() {
        let (program, types, mut reg) = setup();
        reg.backend_mut().fail_installs_at("work:exit");
        let specs = vec![
            spec(".*", PointKind::FuncEntry, PointLocation::Any, "count"),
            spec("work", PointKind::Any, PointLocation::After, "time"),
            spec("main", PointKind::FuncEntry, PointLocation::Before, "count"),
        ];
        let report = reg.instrument_locations(&program, &types, &specs).unwrap();

        let tags: Vec<&str> = report.points.iter().map(|p| p.tag.as_str()).collect();
        assert_eq!(tags, vec!["main:entry", "work:entry", "work:exit"]);
        // main:entry matched twice for "count": once activated, once skipped
        assert_eq!(report.activated, 2);
        assert_eq!(report.already_active, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, "work:exit");
        assert!(reg.point("work:exit").is_none());
    }

    #[test]
    fn test_resolve_probe() {
        let (program, types, mut reg) = setup();
        let count = types.get("count").unwrap();
        reg.activate_one(&program, "main:entry", &count, ProcessScope::All)
            .unwrap();
        let (handle, _) = reg.backend().installed().next().unwrap();
        let (ap, action) = reg.resolve_probe(handle).unwrap();
        assert_eq!(ap.tag(), "main:entry");
        assert_eq!(action.type_tag, "count");
    }
}
