//! Application lifecycle: serving, signals, restart, shutdown.

use std::os::fd::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::activation;
use crate::error::{Error, Result};
use crate::exchange::Exchange;
use crate::fd;
use crate::handoff::{self, ChildConfig, ParentConfig};
use crate::messenger::Messenger;
use crate::notify::NotifyListener;
use crate::server::Server;
use crate::sync::{Countdown, ServedToken};

/// Override for the default child-startup wait, in seconds.
const ENV_WAIT_CHILD_TIMEOUT: &str = "MOLT_WAIT_CHILD_TIMEOUT_SECS";
/// Override for the default parent-shutdown wait, in seconds.
const ENV_WAIT_PARENT_SHUTDOWN_TIMEOUT: &str = "MOLT_WAIT_PARENT_SHUTDOWN_TIMEOUT_SECS";

const DEFAULT_WAIT_CHILD_TIMEOUT: Duration = Duration::from_secs(60);

// Captured once so a successor is launched from the directory the process
// started in, even if the application chdirs later.
static ORIGINAL_CWD: OnceLock<Option<PathBuf>> = OnceLock::new();

/// Release state of the start gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gate {
    /// Listeners acquired, serving not yet allowed.
    Hold,
    /// Handoff and pre-serve hook succeeded; begin serving.
    Open,
    /// Startup failed; exit without ever accepting.
    Abort,
}

type PreServeFn = Box<dyn Fn(bool) -> Result<()> + Send + Sync>;
type HookFn = Box<dyn Fn() + Send + Sync>;

/// Orchestrates embedded servers with zero-downtime restart on SIGUSR2 and
/// graceful shutdown on SIGINT/SIGTERM.
pub struct App {
    servers: Vec<Arc<dyn Server>>,
    pre_serve: Option<PreServeFn>,
    complete_shutdown: Option<HookFn>,
    pre_parent_exit: Option<HookFn>,
    wait_child_timeout: Duration,
    wait_parent_shutdown_timeout: Duration,
}

impl App {
    pub fn new(servers: Vec<Arc<dyn Server>>) -> Self {
        ORIGINAL_CWD.get_or_init(|| std::env::current_dir().ok());
        Self {
            servers,
            pre_serve: None,
            complete_shutdown: None,
            pre_parent_exit: None,
            wait_child_timeout: env_duration(ENV_WAIT_CHILD_TIMEOUT)
                .unwrap_or(DEFAULT_WAIT_CHILD_TIMEOUT),
            wait_parent_shutdown_timeout: env_duration(ENV_WAIT_PARENT_SHUTDOWN_TIMEOUT)
                .unwrap_or(Duration::ZERO),
        }
    }

    /// Hook invoked after listeners are bound and (for a child) the handoff
    /// succeeded, just before serving starts. Receives whether any
    /// listeners were inherited. An error aborts startup.
    pub fn pre_serve(mut self, f: impl Fn(bool) -> Result<()> + Send + Sync + 'static) -> Self {
        self.pre_serve = Some(Box::new(f));
        self
    }

    /// Hook invoked once graceful shutdown of every server has finished.
    pub fn complete_shutdown(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.complete_shutdown = Some(Box::new(f));
        self
    }

    /// Hook invoked by a child just before it tells the parent to go away.
    pub fn pre_parent_exit(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.pre_parent_exit = Some(Box::new(f));
        self
    }

    /// How long a restarting parent waits for its child to come up.
    pub fn wait_child_timeout(mut self, d: Duration) -> Self {
        self.wait_child_timeout = d;
        self
    }

    /// How long a child waits for the parent to finish shutting down before
    /// it starts accepting. Zero (the default) makes handoffs stateless:
    /// the child accepts immediately and old and new process may briefly
    /// both be serving. Non-zero makes them stateful: single-writer
    /// deployments set this to cover their worst-case drain.
    pub fn wait_parent_shutdown_timeout(mut self, d: Duration) -> Self {
        self.wait_parent_shutdown_timeout = d;
        self
    }

    /// Runs every server until shutdown, a terminal serve error, or a
    /// completed handoff to a successor.
    ///
    /// Returns the first non-expected error from any server, or the fatal
    /// adoption error if the activation environment was unusable.
    pub async fn listen_and_serve(self) -> Result<()> {
        let (pairs, control) = fd::inherit()?;
        let exchange = Exchange::new(pairs);
        let inherited = exchange.did_inherit();
        info!(
            pid = std::process::id(),
            inherited = ?exchange.inherited_addrs(),
            "starting"
        );

        let count = self.servers.len();
        let shared = Arc::new(Shared {
            servers: self.servers,
            exchange,
            served_gate: Arc::new(Countdown::new(count)),
            shutdown: tokio::sync::Mutex::new(false),
            complete_shutdown: self.complete_shutdown,
            pre_parent_exit: self.pre_parent_exit,
            wait_child_timeout: self.wait_child_timeout,
            wait_parent_shutdown_timeout: self.wait_parent_shutdown_timeout,
            handoffs: TaskTracker::new(),
        });

        let cancel = CancellationToken::new();
        let signal_task = tokio::spawn(intercept_signals(shared.clone(), cancel.clone()));

        let bound_gate = Arc::new(Countdown::new(count));
        let (gate_tx, gate_rx) = watch::channel(Gate::Hold);
        let (finish_tx, mut finish_rx) = mpsc::channel::<Result<()>>(count.max(1));

        for server in shared.servers.clone() {
            tokio::spawn(serve_one(
                shared.clone(),
                server,
                bound_gate.clone(),
                gate_rx.clone(),
                finish_tx.clone(),
            ));
        }
        drop(finish_tx);

        // Every server has acquired its listener (or failed trying).
        bound_gate.wait().await;

        // A child runs its side of the handoff before anything is served.
        let mut startup_err = None;
        if let Some(mut messenger) = control {
            let config = ChildConfig {
                wait_child_timeout: shared.wait_child_timeout,
                wait_parent_shutdown_timeout: shared.wait_parent_shutdown_timeout,
                parent_pid: unsafe { libc::getppid() },
            };
            let hook = &shared.pre_parent_exit;
            if let Err(e) = handoff::run_child(&mut messenger, config, || {
                if let Some(f) = hook {
                    f();
                }
            })
            .await
            {
                error!(error = %e, "handoff with parent failed");
                startup_err = Some(e);
            }
        }
        if startup_err.is_none() {
            if let Some(f) = &self.pre_serve {
                if let Err(e) = f(inherited) {
                    error!(error = %e, "pre-serve hook failed");
                    startup_err = Some(e);
                }
            }
        }

        if let Some(e) = startup_err {
            let _ = gate_tx.send(Gate::Abort);
            while finish_rx.recv().await.is_some() {}
            cancel.cancel();
            let _ = signal_task.await;
            shared.handoffs.close();
            shared.handoffs.wait().await;
            return Err(e);
        }
        let _ = gate_tx.send(Gate::Open);

        // Wait for every server; remember the first real failure.
        let mut first_err = None;
        while let Some(finished) = finish_rx.recv().await {
            if let Err(e) = finished {
                if first_err.is_none() {
                    first_err = Some(e);
                    // Tear the rest down; the signal task shuts down on
                    // cancellation and shutdown is idempotent.
                    cancel.cancel();
                }
            }
        }
        cancel.cancel();
        let _ = signal_task.await;

        // A handoff in flight still owes the child a shutdown confirmation;
        // do not exit underneath it.
        shared.handoffs.close();
        shared.handoffs.wait().await;

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// State shared between the serve tasks, the signal task and handoffs.
struct Shared {
    servers: Vec<Arc<dyn Server>>,
    exchange: Exchange,
    served_gate: Arc<Countdown>,
    /// At-most-once guard. Holding the lock across the whole drain means a
    /// second caller blocks until the first completes and never observes a
    /// false "already done".
    shutdown: tokio::sync::Mutex<bool>,
    complete_shutdown: Option<HookFn>,
    pre_parent_exit: Option<HookFn>,
    wait_child_timeout: Duration,
    wait_parent_shutdown_timeout: Duration,
    /// Parent-side handoff runs; the main routine waits these out before
    /// the process exits.
    handoffs: TaskTracker,
}

impl Shared {
    /// Drains and stops every server, then runs the complete-shutdown hook.
    /// Safe to call from any task, any number of times.
    async fn shutdown(&self) {
        let mut done = self.shutdown.lock().await;
        if *done {
            return;
        }

        // Never shut a server down before it started accepting (or declared
        // it never will); a too-early shutdown is silently lost.
        self.served_gate.wait().await;

        info!("shutting down servers");
        let mut tasks = tokio::task::JoinSet::new();
        for server in &self.servers {
            let server = server.clone();
            tasks.spawn(async move {
                let addr = server.addr();
                match server.shutdown().await {
                    Ok(()) => info!(%addr, "server shut down"),
                    Err(e) => warn!(%addr, error = %e, "server shutdown failed"),
                }
            });
        }
        while tasks.join_next().await.is_some() {}

        if let Some(f) = &self.complete_shutdown {
            f();
        }
        *done = true;
    }
}

/// One task per embedded server: acquire, gate, serve, report.
async fn serve_one(
    shared: Arc<Shared>,
    server: Arc<dyn Server>,
    bound_gate: Arc<Countdown>,
    mut start_gate: watch::Receiver<Gate>,
    finish: mpsc::Sender<Result<()>>,
) {
    // Dropping the token on any exit path releases the served gate.
    let served = Arc::new(ServedToken::new(shared.served_gate.clone()));

    let addr = server.addr();
    let listener = match shared.exchange.acquire_or_create_listener(&addr) {
        Ok(listener) => {
            bound_gate.arrive();
            listener
        }
        Err(e) => {
            bound_gate.arrive();
            error!(%addr, error = %e, "failed to listen");
            let _ = finish.send(Err(e)).await;
            return;
        }
    };

    let released = match start_gate.wait_for(|g| *g != Gate::Hold).await {
        Ok(gate) => *gate,
        Err(_) => Gate::Abort,
    };
    if released != Gate::Open {
        let _ = finish.send(Ok(())).await;
        return;
    }

    let listener = match TcpListener::from_std(listener) {
        Ok(listener) => listener,
        Err(e) => {
            let _ = finish.send(Err(Error::Io(e))).await;
            return;
        }
    };

    info!(%addr, "serving");
    let result = server
        .serve(NotifyListener::new(listener, served.clone()))
        .await;
    match result {
        Ok(()) | Err(Error::ServerClosed) => {
            info!(%addr, "server finished");
            let _ = finish.send(Ok(())).await;
        }
        Err(e) => {
            error!(%addr, error = %e, "server failed");
            let _ = finish.send(Err(e)).await;
        }
    }
}

/// The signal loop: SIGINT/SIGTERM drain, SIGUSR2 hands off to a successor.
async fn intercept_signals(shared: Arc<Shared>, cancel: CancellationToken) {
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to register SIGINT handler");
            return;
        }
    };
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to register SIGTERM handler");
            return;
        }
    };
    let mut sigusr2 = match signal(SignalKind::user_defined2()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to register SIGUSR2 handler");
            return;
        }
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                shared.shutdown().await;
                return;
            }
            _ = sigint.recv() => {
                info!("termination signal, draining servers");
                shared.shutdown().await;
            }
            _ = sigterm.recv() => {
                info!("termination signal, draining servers");
                shared.shutdown().await;
            }
            _ = sigusr2.recv() => {
                info!("restart signal, starting successor");
                // Spawned so a slow handoff never blocks SIGTERM handling;
                // errors are logged and the loop survives for another try.
                start_handoff(shared.clone());
            }
        }
    }
}

/// Spawns a successor and drives the parent side of the handoff.
fn start_handoff(shared: Arc<Shared>) {
    let tracker = shared.handoffs.clone();
    tracker.spawn(async move {
        let (pid, mut messenger, mut child) = match spawn_successor(&shared) {
            Ok(spawned) => spawned,
            Err(e) => {
                error!(error = %e, "failed to start successor");
                return;
            }
        };
        info!(child_pid = pid, "successor started");

        // Reap the child whichever way the handoff ends.
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => info!(child_pid = pid, %status, "successor exited"),
                Err(e) => warn!(child_pid = pid, error = %e, "failed to wait for successor"),
            }
        });

        let config = ParentConfig {
            wait_child_timeout: shared.wait_child_timeout,
            wait_parent_shutdown_timeout: shared.wait_parent_shutdown_timeout,
        };
        let drain = &shared;
        match handoff::run_parent(&mut messenger, config, || async move {
            drain.shutdown().await;
        })
        .await
        {
            Ok(()) => info!(child_pid = pid, "handoff complete"),
            Err(e) => error!(child_pid = pid, error = %e, "handoff failed"),
        }
    });
}

/// Forks and execs the current executable with the active listeners at fds
/// 3..3+K and a fresh control socket at fd 3+K.
fn spawn_successor(
    shared: &Shared,
) -> Result<(u32, Messenger, tokio::process::Child)> {
    let exe = std::env::current_exe()?;
    // Launch whatever the symlink points to now, not what it pointed to at
    // startup.
    let exe = std::fs::canonicalize(exe)?;

    let (parent_sock, child_sock) = std::os::unix::net::UnixStream::pair()?;

    let mut sources: Vec<RawFd> = shared.exchange.active_files();
    sources.push(child_sock.as_raw_fd());
    let mut relocated: Vec<RawFd> = vec![-1; sources.len()];

    let mut command = tokio::process::Command::new(&exe);
    command.args(std::env::args_os().skip(1));
    if let Some(dir) = ORIGINAL_CWD.get().and_then(|d| d.as_ref()) {
        command.current_dir(dir);
    }
    for (key, value) in activation::child_env(sources.len()) {
        command.env(key, value);
    }
    unsafe {
        command.pre_exec(move || relocate_fds(&sources, &mut relocated));
    }

    let child = command.spawn()?;
    let pid = child.id().unwrap_or_default();
    // The child owns its end now; drop ours.
    drop(child_sock);
    let messenger = Messenger::from_std(parent_sock)?;
    Ok((pid, messenger, child))
}

/// First descriptor safely above the activation range.
const RELOCATE_BASE: libc::c_int = 100;

/// Runs between fork and exec: moves `sources` onto the contiguous range
/// 3..3+N. Two phases so a source that already sits inside the target range
/// is never clobbered before it has been copied out. No allocation here;
/// `relocated` is scratch space reserved by the parent.
fn relocate_fds(sources: &[RawFd], relocated: &mut [RawFd]) -> std::io::Result<()> {
    for (i, &fd) in sources.iter().enumerate() {
        let temp = unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, RELOCATE_BASE) };
        if temp < 0 {
            return Err(std::io::Error::last_os_error());
        }
        relocated[i] = temp;
    }
    for (i, &temp) in relocated.iter().enumerate() {
        let target = activation::LISTEN_FDS_START + i as RawFd;
        // dup2 clears CLOEXEC on the target, which is exactly what the
        // child needs to inherit it across exec.
        if unsafe { libc::dup2(temp, target) } < 0 {
            return Err(std::io::Error::last_os_error());
        }
        unsafe { libc::close(temp) };
    }
    Ok(())
}

fn env_duration(var: &str) -> Option<Duration> {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}
