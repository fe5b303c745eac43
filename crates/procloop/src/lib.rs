//! procloop - process supervision driven by a single-threaded event loop
//!
//! A [`Process`] spawns one child, watches its pipes from an [`EventLoop`]
//! and reports output and termination through [`Signal`]s.
//!
//! ```no_run
//! use procloop::{EventLoop, LoopMode, Process};
//!
//! let event_loop = EventLoop::new()?;
//! event_loop.init(LoopMode::Secondary)?;
//!
//! let process = Process::new();
//! process.finished().connect(|p: &Process| {
//!     println!("exit code {}", p.return_code());
//! });
//! process.start("/bin/sh", &["-c", "echo hello"])?;
//! event_loop.exec(Some(std::time::Duration::from_secs(1)))?;
//! print!("{}", String::from_utf8_lossy(&process.read_all_stdout()));
//! # Ok::<(), procloop::ProcloopError>(())
//! ```

#[cfg(not(unix))]
compile_error!("Unsupported platform: only Unix is currently supported");

mod factory;

pub use factory::{PlatformSpawner, PlatformSpawnerFactory};

// Re-export core functionality
pub use procloop_core::*;

/// Supervisor bound to this platform's spawn backend
pub type Process = Supervisor<PlatformSpawner>;
