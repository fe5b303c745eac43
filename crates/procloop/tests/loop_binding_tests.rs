//! Tests touching the process-wide main loop registry live in their own
//! binary so no other test observes it.

use procloop::{EventLoop, LoopError, LoopMode, Process, ProcessState, ProcloopError};
use std::time::{Duration, Instant};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_target(false)
        .with_line_number(true)
        .with_test_writer()
        .try_init();
}

#[test]
fn test_process_binding() {
    init_tracing();

    // No explicit, current or main loop: nothing can drive the child.
    let orphan = std::thread::spawn(|| {
        let process = Process::new();
        let err = process.start("/bin/sh", &["-c", "exit 0"]).unwrap_err();
        assert!(matches!(err, ProcloopError::NoEventLoop));
        assert_eq!(process.state(), ProcessState::NotStarted);
        assert!(!process.error_string().is_empty());
    });
    orphan.join().unwrap();

    let main_loop = EventLoop::new().unwrap();
    main_loop.init(LoopMode::Main).unwrap();
    assert!(main_loop.is_main());

    let other = EventLoop::new().unwrap();
    assert!(matches!(
        other.init(LoopMode::Main),
        Err(LoopError::MainLoopAlreadySet)
    ));

    // A thread without its own loop falls back to the main loop.
    let process = std::thread::spawn(|| {
        let process = Process::new();
        process.start("/bin/sh", &["-c", "echo main"]).unwrap();
        process
    })
    .join()
    .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while !process.is_finished() && Instant::now() < deadline {
        main_loop.exec(Some(Duration::from_millis(20))).unwrap();
    }
    assert_eq!(process.state(), ProcessState::Finished);
    assert_eq!(process.read_all_stdout(), b"main\n");

    EventLoop::clear_main();
    assert!(EventLoop::main().is_none());
    other.init(LoopMode::Main).unwrap();
    assert!(other.is_main());
    EventLoop::clear_main();
}
