//! procloop core - platform-independent event loop, signals and process supervision
//!
//! This crate provides the reactor, the notification channel, the supervisor
//! state machine and the traits a platform backend implements to spawn
//! children.

mod config;
mod env;
mod error;
mod event_loop;
pub mod message;
mod process;
mod signal;
mod state;
mod supervisor;

pub use config::*;
pub use env::{find_executable, parse_environment};
pub use error::*;
pub use event_loop::{
    Descriptor, EventLoop, Interest, LoopMode, Readiness, TimerId, WeakEventLoop,
};
pub use message::{Message, MessageError, QuitMessage};
pub use process::*;
pub use signal::{Connection, Signal};
pub use state::*;
pub use supervisor::Supervisor;
