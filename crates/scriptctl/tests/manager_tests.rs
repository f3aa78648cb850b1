#![cfg(unix)]

use scriptctl::{
    ManagerConfig, ManagerConfigBuilder, OutputEvent, OutputStream, OutputSubscription, RunState,
    ScriptError, ScriptManager, StopResult,
};
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_file(true)
        .with_thread_ids(false)
        .with_target(false)
        .with_line_number(true)
        .with_test_writer()
        .try_init();
}

fn write_script(dir: &Path, name: &str, body: &str) {
    std::fs::write(dir.join(name), body).unwrap();
}

/// `.sh` files run through `/bin/sh`, so nothing needs the executable bit
fn base_config(dir: &Path) -> ManagerConfigBuilder {
    let mut builder = ManagerConfig::builder();
    builder
        .scripts_dir(dir)
        .allowed_extensions(["sh"])
        .interpreter("sh", "/bin/sh")
        .termination_grace_ms(2000u64);
    builder
}

fn manager_for(dir: &TempDir) -> ScriptManager {
    init_tracing();
    ScriptManager::new(base_config(dir.path()).build().unwrap()).unwrap()
}

async fn next_event(events: &mut OutputSubscription, script: &str) -> OutputEvent {
    loop {
        let event = tokio::time::timeout(EVENT_TIMEOUT, events.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("event bus closed");
        if event.script_name == script {
            return event;
        }
    }
}

async fn wait_for_line(events: &mut OutputSubscription, script: &str, line: &str) {
    loop {
        let event = next_event(events, script).await;
        assert!(!event.is_terminal(), "{script} ended before printing {line:?}");
        if event.message == line {
            return;
        }
    }
}

/// Every event of one instance up to and including its terminal event
async fn until_terminal(events: &mut OutputSubscription, script: &str) -> Vec<OutputEvent> {
    let mut collected = Vec::new();
    loop {
        let event = next_event(events, script).await;
        let terminal = event.is_terminal();
        collected.push(event);
        if terminal {
            return collected;
        }
    }
}

#[tokio::test]
async fn test_list_available_filters_extensions() {
    let dir = tempfile::tempdir().unwrap();
    for name in ["a.sh", "b.sh", "c.SH"] {
        write_script(dir.path(), name, "exit 0\n");
    }
    write_script(dir.path(), "notes.txt", "not a script");
    std::fs::create_dir(dir.path().join("nested.sh")).unwrap();

    let manager = manager_for(&dir);
    let mut names: Vec<String> = manager
        .list_available()
        .into_iter()
        .map(|script| script.name)
        .collect();
    names.sort();
    assert_eq!(names, vec!["a.sh", "b.sh", "c.SH"]);
}

#[tokio::test]
async fn test_missing_directory_lists_nothing_and_start_fails() {
    let root = tempfile::tempdir().unwrap();
    let missing = root.path().join("gone");
    init_tracing();
    let manager = ScriptManager::new(base_config(&missing).build().unwrap()).unwrap();

    assert!(manager.list_available().is_empty());
    let error = manager.start("a.sh").await.unwrap_err();
    assert!(matches!(error, ScriptError::NotFound(_)));
    assert!(!missing.exists());
}

#[tokio::test]
async fn test_start_unknown_script_reports_failure() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager_for(&dir);
    let mut events = manager.subscribe();

    let error = manager.start("nope.sh").await.unwrap_err();
    assert!(matches!(error, ScriptError::NotFound(_)));
    assert_eq!(manager.status("nope.sh"), RunState::NotRunning);
    assert!(manager.running().is_empty());

    let event = next_event(&mut events, "nope.sh").await;
    assert_eq!(event.stream, OutputStream::System);
    assert!(event.message.starts_with("Failed to run script:"));
    assert!(!event.is_terminal());
}

#[tokio::test]
async fn test_start_rejects_names_outside_directory() {
    let root = tempfile::tempdir().unwrap();
    let scripts = root.path().join("scripts");
    std::fs::create_dir(&scripts).unwrap();
    write_script(root.path(), "outside.sh", "echo escaped\n");
    init_tracing();
    let manager = ScriptManager::new(base_config(&scripts).build().unwrap()).unwrap();

    let absolute = root.path().join("outside.sh");
    for name in [
        "../outside.sh".to_string(),
        absolute.to_string_lossy().into_owned(),
        "./../outside.sh".to_string(),
    ] {
        let error = manager.start(&name).await.unwrap_err();
        assert!(matches!(error, ScriptError::NotFound(_)), "{name} was accepted");
    }
    assert!(manager.running().is_empty());
}

#[tokio::test]
async fn test_output_is_delivered_in_order_before_exit() {
    let dir = tempfile::tempdir().unwrap();
    write_script(dir.path(), "abc.sh", "echo A\necho B\necho C\n");
    let manager = manager_for(&dir);
    let mut events = manager.subscribe();

    let handle = manager.start("abc.sh").await.unwrap();
    assert_eq!(handle.script_name, "abc.sh");
    assert!(handle.pid.is_some());

    let events = until_terminal(&mut events, "abc.sh").await;
    let lines: Vec<&str> = events
        .iter()
        .filter(|event| event.stream == OutputStream::Stdout)
        .map(|event| event.message.as_str())
        .collect();
    assert_eq!(lines, vec!["A", "B", "C"]);

    let terminal = events.last().unwrap();
    assert_eq!(terminal.stream, OutputStream::System);
    assert_eq!(terminal.message, "Script exited with code 0");
    let exit = terminal.exit.unwrap();
    assert_eq!(exit.code, Some(0));
    assert!(!exit.requested);
    assert_eq!(manager.status("abc.sh"), RunState::NotRunning);
}

#[tokio::test]
async fn test_nonzero_exit_and_stderr() {
    let dir = tempfile::tempdir().unwrap();
    write_script(dir.path(), "fail.sh", "echo oops >&2\nexit 3\n");
    let manager = manager_for(&dir);
    let mut events = manager.subscribe();

    manager.start("fail.sh").await.unwrap();
    let events = until_terminal(&mut events, "fail.sh").await;

    assert!(
        events
            .iter()
            .any(|event| event.stream == OutputStream::Stderr && event.message == "oops")
    );
    let terminal = events.last().unwrap();
    assert_eq!(terminal.message, "Script exited with code 3");
    assert_eq!(terminal.exit.unwrap().code, Some(3));
    assert_eq!(manager.status("fail.sh"), RunState::NotRunning);
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    write_script(dir.path(), "long.sh", "echo ready\nexec sleep 30\n");
    let manager = manager_for(&dir);
    let mut events = manager.subscribe();

    manager.start("long.sh").await.unwrap();
    wait_for_line(&mut events, "long.sh", "ready").await;
    assert_eq!(manager.status("long.sh"), RunState::Running);

    let result = manager.stop("long.sh").await;
    assert!(matches!(result, StopResult::Stopped { forced: false, .. }));
    assert_eq!(manager.status("long.sh"), RunState::NotRunning);

    let terminal = until_terminal(&mut events, "long.sh").await.pop().unwrap();
    assert_eq!(terminal.message, "Stopped script: long.sh");
    let exit = terminal.exit.unwrap();
    assert!(exit.requested);
    assert_eq!(exit.signal, Some(15));

    assert_eq!(manager.stop("long.sh").await, StopResult::NotRunning);
    assert_eq!(manager.stop("never-started.sh").await, StopResult::NotRunning);
}

#[tokio::test]
async fn test_second_start_replaces_first_instance() {
    let dir = tempfile::tempdir().unwrap();
    write_script(
        dir.path(),
        "loop.sh",
        "echo \"started $$\"\nwhile true; do sleep 1; done\n",
    );
    let manager = manager_for(&dir);
    let mut events = manager.subscribe();

    let first = manager.start("loop.sh").await.unwrap();
    let second = manager.start("loop.sh").await.unwrap();
    assert_ne!(first.instance_id, second.instance_id);
    assert_ne!(first.pid, second.pid);

    let running = manager.running();
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].pid, second.pid);

    // The first instance's terminal event precedes anything from the second
    let mut seen_terminal = false;
    loop {
        let event = next_event(&mut events, "loop.sh").await;
        if event.is_terminal() {
            assert!(event.exit.unwrap().requested);
            seen_terminal = true;
            continue;
        }
        if let Some(pid) = event.message.strip_prefix("started ") {
            let pid: u32 = pid.parse().unwrap();
            if Some(pid) == second.pid {
                assert!(seen_terminal, "second instance printed before the first ended");
                break;
            }
            assert_eq!(Some(pid), first.pid);
        }
    }

    assert!(matches!(manager.stop("loop.sh").await, StopResult::Stopped { .. }));
    assert!(manager.running().is_empty());
}

#[tokio::test]
async fn test_stop_all_clears_registry() {
    let dir = tempfile::tempdir().unwrap();
    write_script(dir.path(), "one.sh", "exec sleep 30\n");
    write_script(dir.path(), "two.sh", "exec sleep 30\n");
    write_script(dir.path(), "quick.sh", "exit 0\n");
    let manager = manager_for(&dir);
    let mut events = manager.subscribe();

    manager.start("one.sh").await.unwrap();
    manager.start("two.sh").await.unwrap();
    manager.start("quick.sh").await.unwrap();
    until_terminal(&mut events, "quick.sh").await;
    assert_eq!(manager.running().len(), 2);

    manager.stop_all().await;
    assert!(manager.running().is_empty());
    for name in ["one.sh", "two.sh", "quick.sh"] {
        assert_eq!(manager.status(name), RunState::NotRunning);
    }

    // Nothing registered is fine too
    manager.stop_all().await;
}

#[tokio::test]
async fn test_output_is_appended_to_log_file() {
    let dir = tempfile::tempdir().unwrap();
    let logs = tempfile::tempdir().unwrap();
    write_script(dir.path(), "log.sh", "echo out\necho err >&2\n");
    init_tracing();
    let config = base_config(dir.path())
        .logs_dir(logs.path().join("logs"))
        .build()
        .unwrap();
    let manager = ScriptManager::new(config).unwrap();
    let mut events = manager.subscribe();

    for _ in 0..2 {
        manager.start("log.sh").await.unwrap();
        until_terminal(&mut events, "log.sh").await;
    }

    let content = std::fs::read_to_string(logs.path().join("logs").join("log.sh.log")).unwrap();
    assert_eq!(content.lines().filter(|line| *line == "out").count(), 2);
    assert_eq!(content.lines().filter(|line| *line == "err").count(), 2);
    assert!(!content.contains("Script exited"));
}

#[tokio::test]
async fn test_spawn_failure_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    write_script(dir.path(), "a.sh", "echo never\n");
    init_tracing();
    let config = base_config(dir.path())
        .interpreter("sh", "/definitely/not/an/interpreter")
        .build()
        .unwrap();
    let manager = ScriptManager::new(config).unwrap();
    let mut events = manager.subscribe();

    let error = manager.start("a.sh").await.unwrap_err();
    assert!(error.is_spawn_failure());
    assert!(matches!(error, ScriptError::SpawnFailed { .. }));
    assert_eq!(manager.status("a.sh"), RunState::NotRunning);

    let event = next_event(&mut events, "a.sh").await;
    assert_eq!(event.stream, OutputStream::System);
    assert!(event.message.starts_with("Failed to run script:"));
}

#[tokio::test]
async fn test_stop_escalates_after_grace_period() {
    let dir = tempfile::tempdir().unwrap();
    write_script(
        dir.path(),
        "stubborn.sh",
        "trap '' TERM\necho ready\nwhile true; do sleep 1; done\n",
    );
    init_tracing();
    let config = base_config(dir.path())
        .termination_grace_ms(300u64)
        .build()
        .unwrap();
    let manager = ScriptManager::new(config).unwrap();
    let mut events = manager.subscribe();

    manager.start("stubborn.sh").await.unwrap();
    wait_for_line(&mut events, "stubborn.sh", "ready").await;

    let result = manager.stop("stubborn.sh").await;
    assert!(matches!(result, StopResult::Stopped { forced: true, .. }));

    let events = until_terminal(&mut events, "stubborn.sh").await;
    assert!(
        events
            .iter()
            .any(|event| event.message.contains("did not exit within 300 ms"))
    );
    let exit = events.last().unwrap().exit.unwrap();
    assert!(exit.requested);
    assert_eq!(exit.signal, Some(9));
    assert_eq!(manager.status("stubborn.sh"), RunState::NotRunning);
}

#[tokio::test]
async fn test_concurrent_starts_keep_one_instance() {
    let dir = tempfile::tempdir().unwrap();
    write_script(dir.path(), "race.sh", "exec sleep 30\n");
    let manager = std::sync::Arc::new(manager_for(&dir));

    let mut starts = tokio::task::JoinSet::new();
    for _ in 0..4 {
        let manager = manager.clone();
        starts.spawn(async move { manager.start("race.sh").await.map(|handle| handle.pid) });
    }
    while let Some(result) = starts.join_next().await {
        assert!(result.unwrap().is_ok());
    }

    assert_eq!(manager.running().len(), 1);
    assert!(matches!(manager.stop("race.sh").await, StopResult::Stopped { .. }));
}

fn process_alive(pid: u32) -> bool {
    std::process::Command::new("/bin/sh")
        .args(["-c", &format!("kill -0 {pid} 2>/dev/null")])
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

#[tokio::test]
async fn test_dropping_manager_kills_running_scripts() {
    let dir = tempfile::tempdir().unwrap();
    write_script(dir.path(), "orphan.sh", "echo ready\nexec sleep 30\n");
    let manager = manager_for(&dir);
    let mut events = manager.subscribe();

    let pid = manager.start("orphan.sh").await.unwrap().pid.unwrap();
    wait_for_line(&mut events, "orphan.sh", "ready").await;
    assert!(process_alive(pid));

    drop(manager);

    let deadline = tokio::time::Instant::now() + EVENT_TIMEOUT;
    while process_alive(pid) {
        assert!(
            tokio::time::Instant::now() < deadline,
            "pid {pid} survived the manager"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn test_stop_with_image_sweep_emits_one_terminal_event() {
    let dir = tempfile::tempdir().unwrap();
    write_script(dir.path(), "swept.sh", "echo ready\nexec sleep 30\n");
    init_tracing();
    let config = base_config(dir.path())
        .image_name_sweep(true)
        .build()
        .unwrap();
    let manager = ScriptManager::new(config).unwrap();
    let mut events = manager.subscribe();

    manager.start("swept.sh").await.unwrap();
    wait_for_line(&mut events, "swept.sh", "ready").await;

    let result = manager.stop("swept.sh").await;
    assert!(matches!(result, StopResult::Stopped { forced: false, .. }));

    let collected = until_terminal(&mut events, "swept.sh").await;
    // The sweep is unsupported here and stays silent
    assert!(
        collected
            .iter()
            .all(|event| event.is_terminal() || event.stream != OutputStream::System)
    );
    assert!(collected.last().unwrap().exit.unwrap().requested);

    tokio::time::sleep(Duration::from_millis(200)).await;
    while let Some(event) = events.try_recv() {
        assert!(!event.is_terminal(), "second terminal event for {}", event.script_name);
    }
    assert_eq!(manager.status("swept.sh"), RunState::NotRunning);
}
