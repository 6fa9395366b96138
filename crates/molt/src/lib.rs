//! # molt
//!
//! Zero-downtime restart and graceful shutdown for long-running tokio TCP
//! servers on Unix.
//!
//! ## Overview
//!
//! A running [`App`] can shed its skin: on `SIGUSR2` it spawns a successor
//! process that inherits the already-bound listening sockets over an
//! exec(), negotiates the takeover on an inherited control socket, and
//! lets the old process drain and exit. The listening sockets are never
//! closed, so clients never see a refused connection.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! # async fn example(my_server: Arc<dyn molt::Server>) -> molt::Result<()> {
//! let app = molt::App::new(vec![my_server]);
//! app.listen_and_serve().await
//! # }
//! ```
//!
//! ## Signal conventions
//!
//! - `SIGINT` / `SIGTERM` — graceful shutdown: drain every server, exit.
//! - `SIGUSR2` — zero-downtime restart: hand the listeners to a successor.
//!
//! ## Handoff flavors
//!
//! With [`App::wait_parent_shutdown_timeout`] at zero (the default) the
//! successor starts accepting immediately and old and new process may
//! briefly both serve. With a non-zero wait the successor holds off until
//! the old process finished draining (or the wait expires, at which point
//! a hung predecessor is SIGKILLed). Both sides use the larger of the two
//! configured waits, so neither binary can weaken the other's guarantee.
//!
//! ## Environment variables
//!
//! - `LISTEN_FDS` — number of inherited descriptors, starting at fd 3.
//! - `LISTEN_PID` — intended recipient pid, 0 for "any".
//!
//! The last inherited descriptor, when it is a Unix stream socket, is the
//! handoff control channel rather than a listener.
//!
//! ## Platform
//!
//! Unix only (Linux / macOS).

#[cfg(not(unix))]
compile_error!("molt requires a Unix platform (Linux or macOS)");

mod activation;
mod app;
mod error;
mod exchange;
mod fd;
mod handoff;
mod messenger;
mod notify;
mod server;
mod sync;

pub use app::App;
pub use error::{Error, Result};
pub use messenger::Messenger;
pub use notify::NotifyListener;
pub use server::Server;
