//! Client session against a real collector over a socket pair.

use std::os::unix::net::UnixStream;
use std::thread;
use std::time::{Duration, Instant};
use toolgear_client::fetch::FileReply;
use toolgear_client::{ClientSession, ProgramDatabase};
use toolgear_collector::instrument::{FsSourceProvider, RecordingBackend, StaticProgram};
use toolgear_collector::schema::{builtin_action_types, ACTION_COUNT, ATTR_CALLS};
use toolgear_collector::Collector;
use toolgear_shared::protocol::{
    open_channel, ChannelMode, LocationSpec, ProcessScope, DEFAULT_MAX_FRAME_BYTES,
};
use toolgear_shared::types::program::{PointKind, PointLocation, StatKind};

const MANIFEST: &str = r#"
program = "demo"

[[module]]
name = "demo"

[[module.function]]
name = "main"
file = "main.c"
start_line = 1
end_line = 20

[[module.function.point]]
kind = "entry"
line = 1

[[module.function]]
name = "work"
file = "work.c"
start_line = 3
end_line = 9

[[module.function.point]]
kind = "entry"
line = 3

[[hit]]
point = "main:entry"
count = 3
"#;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_collector_data_lands_in_the_database() {
    let sources = tempfile::tempdir().unwrap();
    std::fs::write(sources.path().join("main.c"), "int main() { work(); }\n").unwrap();

    let (ours, theirs) = UnixStream::pair().unwrap();
    let client = open_channel(ours, ChannelMode::Threaded, DEFAULT_MAX_FRAME_BYTES).unwrap();
    let collector_side =
        open_channel(theirs, ChannelMode::Cooperative, DEFAULT_MAX_FRAME_BYTES).unwrap();

    let program = StaticProgram::from_toml_str(MANIFEST).unwrap();
    let backend = RecordingBackend::with_script(program.script().to_vec());
    let mut collector = Collector::new(
        collector_side,
        Box::new(program),
        Box::new(FsSourceProvider::new(vec![sources.path().to_path_buf()])),
        Box::new(backend),
        builtin_action_types().unwrap(),
    )
    .with_poll_interval(Duration::from_millis(5));
    let startup = vec![LocationSpec {
        pattern: "^main$".into(),
        kind: PointKind::FuncEntry,
        location: PointLocation::Any,
        action_type: ACTION_COUNT.into(),
    }];
    let collector_thread = thread::spawn(move || collector.run(&startup));

    let session = ClientSession::new(client, ProgramDatabase::default())
        .with_heartbeat(Duration::from_millis(20));
    let handle = session.handle(Duration::from_secs(1));
    let session_thread = thread::spawn(move || session.run());

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let total = handle
            .with_database(|db| db.app_data_stat(ATTR_CALLS, StatKind::Sum, StatKind::Sum))
            .await
            .unwrap()
            // The schema may not have arrived yet.
            .ok()
            .flatten();
        if total == Some(3.0) {
            break;
        }
        assert!(Instant::now() < deadline, "calls never reached 3: {:?}", total);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    handle
        .activate("work:entry", ACTION_COUNT, ProcessScope::Task(4))
        .unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let state = handle
            .with_database(|db| {
                db.action_state("work", "work:entry", ACTION_COUNT, 4)
                    .map(str::to_string)
            })
            .await
            .unwrap();
        if state.as_deref() == Some("on") {
            break;
        }
        assert!(Instant::now() < deadline, "work:entry never switched on");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let pairs = handle
        .with_database(|db| db.pt_pairs().to_vec())
        .await
        .unwrap();
    assert!(pairs.iter().all(|p| p.thread >= 0), "pairs: {:?}", pairs);

    match handle.fetch_file("main.c").await.unwrap() {
        FileReply::Contents { full_path, text } => {
            assert!(full_path.unwrap().ends_with("main.c"));
            assert!(text.starts_with("int main"));
        }
        FileReply::NotFound => panic!("main.c should be found"),
    }

    handle.quit("done").unwrap();
    let mut outcome = tokio::task::spawn_blocking(move || session_thread.join().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome.reason, "done");
    assert_eq!(outcome.collector.as_ref().unwrap().program, "demo");
    let summary = outcome.instrumented.unwrap();
    assert_eq!((summary.points, summary.actions, summary.failures), (1, 1, 0));
    assert!(outcome.db.file("main.c").unwrap().parsed);
    assert_eq!(
        outcome
            .db
            .entry_data_stat("main", "main:entry", ATTR_CALLS, StatKind::Sum)
            .unwrap(),
        Some(3.0)
    );

    let reason = tokio::task::spawn_blocking(move || collector_thread.join().unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reason, "done");
}
