//! What this collector announces to the client on startup
//!
//! Data attributes, action declarations with their state machines, and
//! message folders are declared exactly once per connection. The built-in
//! action types produce values for the declared attributes.

use crate::registry::{ActionType, ActionTypes, HitContext, RegistryError};
use toolgear_shared::protocol::{DataTarget, DbCommand};
use toolgear_shared::types::program::{DataType, StatKind, SuggestedStat};

pub const ATTR_CALLS: &str = "calls";
pub const ATTR_TIME: &str = "time";

pub const ACTION_COUNT: &str = "count";
pub const ACTION_TIME: &str = "time";

pub const STATE_OFF: &str = "off";
pub const STATE_ON: &str = "on";

/// Folder for instrumentation diagnostics.
pub const FOLDER_COLLECTOR: &str = "collector";

fn target(ctx: &HitContext<'_>, attr: &str) -> DataTarget {
    DataTarget {
        function: ctx.function.name.clone(),
        entry: ctx.point.tag.clone(),
        attr: attr.to_string(),
        task: ctx.hit.task,
        thread: ctx.hit.thread,
    }
}

/// The action types this collector can install.
pub fn builtin_action_types() -> Result<ActionTypes, RegistryError> {
    let mut types = ActionTypes::new();
    types.register(
        ActionType::new(ACTION_COUNT, "toolgear", "count_calls")
            .with_callback(|ctx| Some(DbCommand::AddInt(target(ctx, ATTR_CALLS), 1))),
    )?;
    types.register(
        ActionType::new(ACTION_TIME, "toolgear", "time_calls")
            .with_callback(|ctx| Some(DbCommand::AddDouble(target(ctx, ATTR_TIME), ctx.hit.value))),
    )?;
    Ok(types)
}

fn declare_toggle(out: &mut Vec<DbCommand>, action: &str, menu: &str, tooltip: &str) {
    out.push(DbCommand::DeclareAction {
        tag: action.to_string(),
        menu_text: menu.to_string(),
        tooltip: tooltip.to_string(),
        initial_state: STATE_OFF.to_string(),
    });
    for (state, verb) in [(STATE_OFF, "Enable"), (STATE_ON, "Disable")] {
        out.push(DbCommand::DeclareActionState {
            action: action.to_string(),
            state: state.to_string(),
            pixmap: format!("{}-{}", action, state),
            menu_text: format!("{} {}", verb, menu.to_lowercase()),
            tooltip: tooltip.to_string(),
        });
    }
    for (from, to) in [(STATE_OFF, STATE_ON), (STATE_ON, STATE_OFF)] {
        out.push(DbCommand::EnableTransition {
            action: action.to_string(),
            from: from.to_string(),
            to: to.to_string(),
        });
    }
}

/// Schema declarations, in the order they must be sent.
pub fn announcements() -> Vec<DbCommand> {
    let mut out = vec![
        DbCommand::DeclareDataAttr {
            tag: ATTR_CALLS.to_string(),
            description: "Number of calls".to_string(),
            data_type: DataType::Int,
            suggested: SuggestedStat {
                per_entry: StatKind::Sum,
                rollup: StatKind::Sum,
            },
        },
        DbCommand::DeclareDataAttr {
            tag: ATTR_TIME.to_string(),
            description: "Time spent (seconds)".to_string(),
            data_type: DataType::Double,
            suggested: SuggestedStat {
                per_entry: StatKind::Sum,
                rollup: StatKind::Max,
            },
        },
    ];
    declare_toggle(&mut out, ACTION_COUNT, "Count calls", "Count how often this point runs");
    declare_toggle(&mut out, ACTION_TIME, "Time calls", "Accumulate time spent at this point");
    out.push(DbCommand::DeclareMessageFolder {
        tag: FOLDER_COLLECTOR.to_string(),
        title: "Collector messages".to_string(),
    });
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::{FunctionInfo, InstPoint, ProbeHandle, ProbeHit};
    use toolgear_shared::types::program::{PointKind, PointLocation};

    #[test]
    fn test_every_builtin_action_is_declared() {
        let types = builtin_action_types().unwrap();
        let declared: Vec<String> = announcements()
            .into_iter()
            .filter_map(|c| match c {
                DbCommand::DeclareAction { tag, .. } => Some(tag),
                _ => None,
            })
            .collect();
        for t in types.iter() {
            assert!(declared.contains(&t.tag), "{} not declared", t.tag);
        }
    }

    #[test]
    fn test_count_callback_adds_one_call() {
        let types = builtin_action_types().unwrap();
        let count = types.get(ACTION_COUNT).unwrap();
        let function = FunctionInfo {
            module: "demo".into(),
            name: "main".into(),
            file: "main.c".into(),
            start_line: 1,
            end_line: 10,
        };
        let point = InstPoint {
            tag: "main:entry".into(),
            function: "main".into(),
            kind: PointKind::FuncEntry,
            location: PointLocation::Before,
            callee: None,
            line: 1,
            index_in_line: 0,
            call_index: 0,
        };
        let hit = ProbeHit {
            handle: ProbeHandle(1),
            task: 2,
            thread: 5,
            value: 0.5,
        };
        let cmd = (count.callback().unwrap())(&HitContext {
            function: &function,
            point: &point,
            hit: &hit,
        });
        match cmd {
            Some(DbCommand::AddInt(t, 1)) => {
                assert_eq!(t.entry, "main:entry");
                assert_eq!(t.attr, ATTR_CALLS);
                assert_eq!((t.task, t.thread), (2, 5));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
