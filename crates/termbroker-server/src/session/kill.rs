//! Graceful-then-forceful process termination.

use std::time::Duration;

use termbroker_core::BrokerResult;
use tracing::{debug, info, warn};

use crate::process::{Delivery, ProcessOps, Signal};

/// Timing for [`terminate`].
#[derive(Debug, Clone, Copy)]
pub struct KillPolicy {
    /// How long the first signal gets before SIGKILL.
    pub grace: Duration,
    pub poll: Duration,
}

impl Default for KillPolicy {
    fn default() -> Self {
        Self {
            grace: Duration::from_millis(3000),
            poll: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillOutcome {
    /// Nothing to signal.
    AlreadyExited,
    /// Exited after the first signal.
    Exited,
    /// Needed SIGKILL.
    Escalated,
    /// Still alive after SIGKILL, as far as we can tell.
    Unconfirmed,
}

/// Send `signal` to `pid`, poll until `alive()` turns false, and escalate to
/// SIGKILL once `policy.grace` has passed.
pub async fn terminate<F>(
    ops: &dyn ProcessOps,
    pid: u32,
    signal: Signal,
    policy: KillPolicy,
    alive: F,
) -> BrokerResult<KillOutcome>
where
    F: Fn() -> bool,
{
    if ops.send_signal(pid, signal)? == Delivery::NoSuchProcess {
        debug!(pid, "process already gone");
        return Ok(KillOutcome::AlreadyExited);
    }
    debug!(pid, ?signal, "signal sent");
    confirm(ops, pid, signal, policy, alive).await
}

/// Wait for a process that was already sent `signal` (possibly by another
/// process) to die, escalating to SIGKILL once `policy.grace` has passed.
pub async fn confirm<F>(
    ops: &dyn ProcessOps,
    pid: u32,
    signal: Signal,
    policy: KillPolicy,
    alive: F,
) -> BrokerResult<KillOutcome>
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + policy.grace;
    loop {
        tokio::time::sleep(policy.poll).await;
        if !alive() {
            return Ok(KillOutcome::Exited);
        }
        if tokio::time::Instant::now() >= deadline {
            break;
        }
    }

    if signal == Signal::Kill {
        warn!(pid, "process survived SIGKILL");
        return Ok(KillOutcome::Unconfirmed);
    }

    info!(pid, grace_ms = policy.grace.as_millis() as u64, "escalating to SIGKILL");
    if ops.send_signal(pid, Signal::Kill)? == Delivery::NoSuchProcess {
        return Ok(KillOutcome::Escalated);
    }
    tokio::time::sleep(policy.poll).await;
    if alive() {
        warn!(pid, "process still alive after SIGKILL");
        return Ok(KillOutcome::Unconfirmed);
    }
    Ok(KillOutcome::Escalated)
}
