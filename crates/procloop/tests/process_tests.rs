use procloop::message::decode;
use procloop::{
    EventLoop, ExecOutcome, LoopMode, Process, ProcessConfig, ProcessState, ProcloopError,
    QuitMessage, RETURN_KILLED, RETURN_UNSET, TerminationResult,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

const NO_ARGS: &[&str] = &[];

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_file(true)
        .with_thread_ids(false)
        .with_target(false)
        .with_line_number(true)
        .with_test_writer()
        .try_init();
}

/// A private loop bound to the calling test thread
fn event_loop() -> EventLoop {
    init_tracing();
    let event_loop = EventLoop::new().unwrap();
    event_loop.init(LoopMode::Secondary).unwrap();
    event_loop
}

fn run_until_finished(event_loop: &EventLoop, process: &Process, budget: Duration) {
    let deadline = Instant::now() + budget;
    while !process.is_finished() && Instant::now() < deadline {
        event_loop.exec(Some(Duration::from_millis(20))).unwrap();
    }
    assert!(process.is_finished(), "{process:?} did not finish in {budget:?}");
}

/// Test that stdout only becomes visible once the loop has serviced the pipe
#[test]
fn test_stdout_ping_is_read_by_the_loop() {
    let event_loop = event_loop();
    let process = Process::new();

    process.start("/bin/sh", &["-c", "echo ping; sleep 0.05"]).unwrap();
    assert_eq!(process.state(), ProcessState::Running);
    assert!(process.pid().is_some());
    assert!(process.read_all_stdout().is_empty());
    assert!(!process.is_finished());
    assert_eq!(process.return_code(), RETURN_UNSET);

    run_until_finished(&event_loop, &process, Duration::from_secs(5));
    assert_eq!(process.read_all_stdout(), b"ping\n");
    assert!(process.read_all_stdout().is_empty());
    assert_eq!(process.state(), ProcessState::Finished);
    assert_eq!(process.return_code(), 0);
}

#[test]
fn test_stderr_is_buffered_separately() {
    let event_loop = event_loop();
    let process = Process::new();

    process.start("/bin/sh", &["-c", "echo out; echo err >&2"]).unwrap();
    run_until_finished(&event_loop, &process, Duration::from_secs(5));

    assert_eq!(process.read_all_stdout(), b"out\n");
    assert_eq!(process.read_all_stderr(), b"err\n");
    assert!(process.read_all_stderr().is_empty());
}

#[test]
fn test_non_zero_exit_is_finished() {
    let event_loop = event_loop();
    let process = Process::new();

    process.start("/bin/sh", &["-c", "exit 12"]).unwrap();
    run_until_finished(&event_loop, &process, Duration::from_secs(5));

    assert_eq!(process.state(), ProcessState::Finished);
    assert_eq!(process.return_code(), 12);
    assert!(process.error_string().is_empty());
}

#[test]
fn test_signal_termination_is_crashed() {
    let event_loop = event_loop();
    let process = Process::new();

    process.start("/bin/sh", &["-c", "kill -SEGV $$"]).unwrap();
    run_until_finished(&event_loop, &process, Duration::from_secs(5));

    assert_eq!(process.state(), ProcessState::Crashed);
    assert_eq!(process.return_code(), 128 + 11);
}

#[test]
fn test_exec_timeout_kills_the_child() {
    init_tracing();
    let process = Process::new();
    let started = Instant::now();

    let outcome = process
        .exec(
            "/bin/sh",
            &["-c", "exec sleep 10"],
            Some(Duration::from_millis(200)),
        )
        .unwrap();

    assert_eq!(outcome, ExecOutcome::TimedOut);
    assert_eq!(process.state(), ProcessState::TimedOut);
    assert_eq!(process.return_code(), RETURN_KILLED);
    assert_eq!(process.error_string(), "Timed out");
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn test_exec_exit_before_timeout_is_done() {
    init_tracing();
    let process = Process::new();

    let outcome = process
        .exec("/bin/sh", &["-c", "echo done"], Some(Duration::from_secs(5)))
        .unwrap();

    assert_eq!(outcome, ExecOutcome::Done);
    assert_eq!(process.state(), ProcessState::Finished);
    assert_eq!(process.return_code(), 0);
    assert_eq!(process.read_all_stdout(), b"done\n");
}

#[test]
fn test_explicit_environment_is_exact() {
    let event_loop = event_loop();
    let process = Process::new();

    process
        .start_with_env("/usr/bin/env", NO_ARGS, &["KEY=value", "EMPTY"])
        .unwrap();
    run_until_finished(&event_loop, &process, Duration::from_secs(5));

    let output = String::from_utf8(process.read_all_stdout()).unwrap();
    let mut vars: Vec<&str> = output.lines().collect();
    vars.sort_unstable();
    assert_eq!(vars, vec!["EMPTY=", "KEY=value"]);
}

#[test]
fn test_large_write_round_trips_through_cat() {
    let event_loop = event_loop();
    let process = Process::new();
    let data: Vec<u8> = (0..1_000_000u32).map(|i| (i % 251) as u8).collect();

    process.start("/bin/cat", NO_ARGS).unwrap();
    for chunk in data.chunks(100_000) {
        process.write(chunk);
    }
    process.close_stdin();

    let mut received = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(10);
    while !process.is_finished() && Instant::now() < deadline {
        event_loop.exec(Some(Duration::from_millis(20))).unwrap();
        received.extend(process.read_all_stdout());
    }
    received.extend(process.read_all_stdout());

    assert_eq!(process.state(), ProcessState::Finished);
    assert_eq!(received.len(), data.len());
    assert!(received == data, "output differs from input");
}

#[test]
fn test_writes_after_finish_are_ignored() {
    let event_loop = event_loop();
    let process = Process::new();

    process.start("/bin/sh", &["-c", "exit 0"]).unwrap();
    run_until_finished(&event_loop, &process, Duration::from_secs(5));

    process.write(b"too late");
    event_loop.exec(Some(Duration::from_millis(20))).unwrap();
    assert_eq!(process.state(), ProcessState::Finished);
}

#[test]
fn test_listeners_receive_the_emitting_process() {
    let event_loop = event_loop();
    let first = Process::new();
    let second = Process::new();

    let finished_ids = Arc::new(Mutex::new(Vec::new()));
    let outputs = Arc::new(Mutex::new(Vec::new()));
    for process in [&first, &second] {
        let ids = finished_ids.clone();
        process.finished().connect(move |p: &Process| {
            ids.lock().unwrap().push(p.id());
        });
        let outputs = outputs.clone();
        process.ready_read_stdout().connect(move |p: &Process| {
            outputs.lock().unwrap().push((p.id(), p.read_all_stdout()));
        });
    }

    first.start("/bin/sh", &["-c", "echo one"]).unwrap();
    second.start("/bin/sh", &["-c", "echo two"]).unwrap();
    run_until_finished(&event_loop, &first, Duration::from_secs(5));
    run_until_finished(&event_loop, &second, Duration::from_secs(5));

    let mut ids = finished_ids.lock().unwrap().clone();
    ids.sort_unstable();
    let mut expected = vec![first.id(), second.id()];
    expected.sort_unstable();
    assert_eq!(ids, expected);

    let outputs = outputs.lock().unwrap();
    let collect = |id: u64| -> Vec<u8> {
        outputs
            .iter()
            .filter(|(owner, _)| *owner == id)
            .flat_map(|(_, bytes)| bytes.clone())
            .collect()
    };
    assert_eq!(collect(first.id()), b"one\n");
    assert_eq!(collect(second.id()), b"two\n");
}

#[test]
fn test_finished_transition_happens_once() {
    let event_loop = event_loop();
    let process = Process::new();
    let finished = Arc::new(AtomicUsize::new(0));
    let count = finished.clone();
    process.finished().connect(move |_: &Process| {
        count.fetch_add(1, Ordering::SeqCst);
    });

    process.start("/bin/sh", &["-c", "sleep 0.05"]).unwrap();
    let mut observations = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        observations.push(process.is_finished());
        if process.is_finished() {
            break;
        }
        event_loop.exec(Some(Duration::from_millis(10))).unwrap();
    }
    event_loop.exec(Some(Duration::from_millis(50))).unwrap();
    observations.push(process.is_finished());

    let first_true = observations.iter().position(|f| *f).unwrap();
    assert!(first_true > 0);
    assert!(observations[..first_true].iter().all(|f| !f));
    assert!(observations[first_true..].iter().all(|f| *f));
    assert_eq!(finished.load(Ordering::SeqCst), 1);
}

#[test]
fn test_missing_command_is_a_spawn_failure() {
    let _event_loop = event_loop();
    let process = Process::new();

    let err = process
        .start("procloop-command-that-does-not-exist", NO_ARGS)
        .unwrap_err();
    assert!(matches!(err, ProcloopError::CommandNotFound(_)));
    assert!(err.is_spawn_failure());
    assert_eq!(process.state(), ProcessState::NotStarted);
    assert!(!process.error_string().is_empty());
    assert!(!process.is_finished());
}

#[test]
fn test_start_twice_is_rejected() {
    let event_loop = event_loop();
    let process = Process::new();

    process.start("/bin/sh", &["-c", "exit 0"]).unwrap();
    let err = process.start("/bin/sh", &["-c", "exit 0"]).unwrap_err();
    assert!(err.is_permanent());
    run_until_finished(&event_loop, &process, Duration::from_secs(5));
}

#[test]
fn test_quit_message_reaches_the_child() {
    let event_loop = event_loop();
    let process = Process::new();

    process.start("/bin/cat", NO_ARGS).unwrap();
    process.write_message(&QuitMessage::new(3));
    process.close_stdin();
    run_until_finished(&event_loop, &process, Duration::from_secs(5));

    let echoed = process.read_all_stdout();
    let (message, used) = decode::<QuitMessage>(&echoed).unwrap();
    assert_eq!(message.exit_code, 3);
    assert_eq!(used, echoed.len());
}

#[test]
fn test_kill_finishes_with_killed_sentinel() {
    let event_loop = event_loop();
    let process = Process::new();

    process.start("/bin/sh", &["-c", "exec sleep 10"]).unwrap();
    event_loop.exec(Some(Duration::from_millis(20))).unwrap();
    assert_eq!(process.kill(), TerminationResult::Success);
    run_until_finished(&event_loop, &process, Duration::from_secs(5));

    assert_eq!(process.state(), ProcessState::Finished);
    assert_eq!(process.return_code(), RETURN_KILLED);
    assert_eq!(process.error_string(), "Killed");
}

#[test]
fn test_working_directory() {
    let event_loop = event_loop();
    let process = Process::new();
    let config = ProcessConfig::builder()
        .command("/bin/sh")
        .args(["-c", "pwd"])
        .working_directory("/")
        .build()
        .unwrap();

    process.start_config(&config).unwrap();
    run_until_finished(&event_loop, &process, Duration::from_secs(5));
    assert_eq!(process.read_all_stdout(), b"/\n");
}

#[test]
fn test_exec_config_from_json() {
    init_tracing();
    let json = serde_json::json!({
        "command": "sh",
        "args": ["-c", "echo $GREETING"],
        "env": ["PATH=/bin:/usr/bin", "GREETING=json"],
        "timeoutMs": 5000,
    })
    .to_string();
    let config = ProcessConfig::from_json_str(&json).unwrap();

    let process = Process::new();
    assert_eq!(process.exec_config(&config).unwrap(), ExecOutcome::Done);
    assert_eq!(process.read_all_stdout(), b"json\n");
    assert_eq!(process.timeout(), Some(Duration::from_secs(5)));
}

#[test]
fn test_exec_on_worker_thread() {
    init_tracing();
    let process = Process::new();
    let worker = process.clone();

    let handle = std::thread::spawn(move || {
        worker
            .exec("/bin/sh", &["-c", "echo from-worker"], None)
            .unwrap()
    });
    assert_eq!(handle.join().unwrap(), ExecOutcome::Done);
    assert_eq!(process.read_all_stdout(), b"from-worker\n");
}

fn wait_for_state(process: &Process, state: ProcessState) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while process.state() != state && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(process.state(), state);
}

/// Test that a write from another thread wakes the blocked loop and reaches the child
#[test]
fn test_write_from_other_thread() {
    init_tracing();
    let process = Process::new();
    let worker = process.clone();

    let handle = std::thread::spawn(move || {
        worker
            .exec(
                "/bin/sh",
                &["-c", "read line; echo \"got $line\""],
                Some(Duration::from_secs(5)),
            )
            .unwrap()
    });
    wait_for_state(&process, ProcessState::Running);
    process.write(b"hello\n");

    assert_eq!(handle.join().unwrap(), ExecOutcome::Done);
    assert_eq!(process.read_all_stdout(), b"got hello\n");
    assert_eq!(process.return_code(), 0);
}

/// Test that output can be drained from another thread while the loop runs
#[test]
fn test_read_from_other_thread_while_running() {
    init_tracing();
    let process = Process::new();
    let worker = process.clone();

    let handle = std::thread::spawn(move || {
        worker
            .exec(
                "/bin/sh",
                &["-c", "sleep 0.2; echo hi; sleep 0.3"],
                Some(Duration::from_secs(5)),
            )
            .unwrap()
    });
    wait_for_state(&process, ProcessState::Running);
    assert!(process.read_all_stdout().is_empty());

    let deadline = Instant::now() + Duration::from_secs(4);
    let mut output = Vec::new();
    while output.is_empty() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
        output = process.read_all_stdout();
    }
    assert_eq!(output, b"hi\n");
    assert!(process.read_all_stdout().is_empty());

    assert_eq!(handle.join().unwrap(), ExecOutcome::Done);
    assert!(process.read_all_stdout().is_empty());
}

#[cfg(target_os = "linux")]
#[test]
fn test_drop_while_running_kills_child() {
    let event_loop = event_loop();
    let process = Process::new();
    process.start("/bin/sh", &["-c", "exec sleep 10"]).unwrap();
    let pid = process.pid().unwrap();
    drop(process);

    // The reaper still reports the exit to the loop; nothing is left to notify.
    event_loop.exec(Some(Duration::from_millis(100))).unwrap();
    let alive = std::path::Path::new(&format!("/proc/{pid}")).exists();
    assert!(!alive, "child {pid} survived its supervisor");
}
