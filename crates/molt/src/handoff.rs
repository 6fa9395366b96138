//! The parent/child handoff protocol.
//!
//! Runs over the inherited control channel. Four messages, in order:
//!
//! 1. child -> parent: `Ready` ("my listeners are bound"), carrying the
//!    parent-shutdown wait the child wants.
//! 2. parent -> child: `ReadyConfirmation`, carrying the *effective* wait:
//!    the max of what the child proposed and what the parent is configured
//!    to tolerate. Either side can raise the wait, neither can lower it.
//! 3. child -> parent: `Accepted` ("my servers are un-gated; shut down").
//! 4. parent -> child: `ShutdownConfirmation`, only in stateful handoffs
//!    (effective wait > 0), after the parent finished draining.
//!
//! The parent is committed once step 2 succeeds: from then on it drains
//! and exits no matter what else fails. A child that never receives step 4
//! by the effective deadline SIGKILLs the hung parent, unless the parent
//! is pid 1 (the service manager stays alive).

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::error::Result;
use crate::messenger::Messenger;

/// Deadline for the short unconditional sends (Ready, Accepted,
/// ShutdownConfirmation). The peer is local; a second is generous.
const SEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Child -> parent: listeners are bound, ready to take over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Ready {
    /// How long this child is willing to wait for the parent to finish
    /// shutting down before it starts accepting. Zero requests a
    /// stateless handoff.
    #[serde(rename = "WaitParentShutdownTimeout", with = "duration_nanos")]
    pub wait_parent_shutdown_timeout: Duration,
}

/// Parent -> child: readiness acknowledged; both sides now use the
/// returned effective wait.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct ReadyConfirmation {
    #[serde(
        rename = "FixedWaitParentShutdownTimeout",
        with = "duration_nanos"
    )]
    pub fixed_wait_parent_shutdown_timeout: Duration,
}

/// Child -> parent: serving is un-gated, the parent may drain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Accepted {}

/// Parent -> child: graceful shutdown is complete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct ShutdownConfirmation {}

/// Durations travel as integer nanoseconds.
mod duration_nanos {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_nanos(u64::deserialize(d)?))
    }
}

pub(crate) struct ParentConfig {
    /// How long the parent waits for the child to come up.
    pub wait_child_timeout: Duration,
    /// The parent-shutdown wait the parent itself insists on.
    pub wait_parent_shutdown_timeout: Duration,
}

/// Drives the parent side of the handoff.
///
/// `shutdown` drains the embedded servers; it is invoked exactly once and
/// unconditionally once the confirmation has been sent.
pub(crate) async fn run_parent<F, Fut>(
    messenger: &mut Messenger,
    config: ParentConfig,
    shutdown: F,
) -> Result<()>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = ()>,
{
    // Phase 1: wait for the child to report in. Failures here abandon the
    // handoff; the child self-terminates on its own deadline.
    messenger.set_deadline(Instant::now() + config.wait_child_timeout);
    let ready: Ready = messenger.recv().await?;
    let effective = std::cmp::max(
        ready.wait_parent_shutdown_timeout,
        config.wait_parent_shutdown_timeout,
    );
    info!(
        proposed_ms = ready.wait_parent_shutdown_timeout.as_millis() as u64,
        effective_ms = effective.as_millis() as u64,
        "child is ready"
    );
    messenger
        .send(&ReadyConfirmation {
            fixed_wait_parent_shutdown_timeout: effective,
        })
        .await?;

    // Committed. Everything past this point is best-effort: responsibility
    // for the sockets now rests with the child.
    messenger.set_deadline(Instant::now() + config.wait_child_timeout);
    match messenger.recv::<Accepted>().await {
        Ok(_) => info!("child accepted the handoff"),
        Err(e) => warn!(error = %e, "child never confirmed acceptance"),
    }

    shutdown().await;

    if !effective.is_zero() {
        messenger.set_deadline(Instant::now() + SEND_TIMEOUT);
        if let Err(e) = messenger.send(&ShutdownConfirmation {}).await {
            warn!(error = %e, "failed to confirm shutdown to child");
        }
    }
    Ok(())
}

pub(crate) struct ChildConfig {
    pub wait_child_timeout: Duration,
    /// The parent-shutdown wait this process proposes.
    pub wait_parent_shutdown_timeout: Duration,
    /// Pid of the process that spawned us. Parameterized so the pid 1
    /// exception and the kill path are testable.
    pub parent_pid: libc::pid_t,
}

/// Drives the child side of the handoff.
///
/// `notify_parent_exit` runs between the confirmation and `Accepted`, i.e.
/// just before the parent is told it may go away. On success the caller
/// may un-gate its servers; on error they must never start.
pub(crate) async fn run_child<F>(
    messenger: &mut Messenger,
    config: ChildConfig,
    notify_parent_exit: F,
) -> Result<()>
where
    F: FnOnce(),
{
    messenger.set_deadline(Instant::now() + SEND_TIMEOUT);
    messenger
        .send(&Ready {
            wait_parent_shutdown_timeout: config.wait_parent_shutdown_timeout,
        })
        .await?;

    // The parent may legitimately take the larger of the two waits to
    // respond when it is busy; do not give up before it could.
    let confirmation_wait = std::cmp::max(
        config.wait_child_timeout,
        config.wait_parent_shutdown_timeout,
    );
    messenger.set_deadline(Instant::now() + confirmation_wait);
    let confirmation: ReadyConfirmation = messenger.recv().await?;
    let effective = confirmation.fixed_wait_parent_shutdown_timeout;
    info!(
        effective_ms = effective.as_millis() as u64,
        "parent confirmed readiness"
    );

    notify_parent_exit();

    messenger.set_deadline(Instant::now() + SEND_TIMEOUT);
    if let Err(e) = messenger.send(&Accepted {}).await {
        // The parent committed when it confirmed; it drains regardless.
        warn!(error = %e, "failed to send acceptance to parent");
    }

    if effective.is_zero() {
        // Stateless: start accepting immediately, a brief window of dual
        // acceptance is fine.
        return Ok(());
    }

    messenger.set_deadline(Instant::now() + effective);
    match messenger.recv::<ShutdownConfirmation>().await {
        Ok(_) => {
            info!("parent completed graceful shutdown");
            Ok(())
        }
        Err(e) if e.is_timeout() => {
            if config.parent_pid == 1 {
                // Socket activation: the service manager is not a
                // predecessor to get rid of.
                warn!("parent shutdown wait expired, parent is the service manager, not killing");
                return Ok(());
            }
            warn!(
                parent_pid = config.parent_pid,
                "parent failed to confirm shutdown in time, sending SIGKILL"
            );
            if unsafe { libc::kill(config.parent_pid, libc::SIGKILL) } != 0 {
                let err = std::io::Error::last_os_error();
                warn!(parent_pid = config.parent_pid, error = %err, "kill failed");
            }
            Ok(())
        }
        Err(e) => {
            // Most likely the parent exited without the final message.
            // Responsibility transferred at Accepted; keep serving.
            warn!(error = %e, "parent connection failed while waiting for shutdown confirmation");
            Ok(())
        }
    }
}
