//! Foreground job tracking and terminal multiplexer detection.
//!
//! The orchestrator samples the PTY's foreground process group on a timer and
//! feeds it to [`ForegroundTracker`], which turns samples into
//! started/finished transitions.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForegroundJob {
    pub pgid: u32,
    pub command: String,
    pub started: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForegroundChange {
    Started { command: String },
    Finished { command: String, duration: Duration },
}

#[derive(Debug, Default)]
pub struct ForegroundTracker {
    current: Option<ForegroundJob>,
}

impl ForegroundTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<&ForegroundJob> {
        self.current.as_ref()
    }

    /// Record one sample. `pgid` is the terminal's foreground group, `None`
    /// when it could not be read; `lookup` resolves a pid to its command line.
    pub fn observe<F>(
        &mut self,
        shell_pid: u32,
        pgid: Option<u32>,
        now: Instant,
        lookup: F,
    ) -> Vec<ForegroundChange>
    where
        F: FnOnce(u32) -> Option<String>,
    {
        let mut changes = Vec::new();
        let job_pgid = pgid.filter(|&p| p != shell_pid);
        if self.current.as_ref().map(|j| j.pgid) == job_pgid {
            return changes;
        }

        if let Some(prev) = self.current.take() {
            changes.push(ForegroundChange::Finished {
                command: prev.command,
                duration: now.saturating_duration_since(prev.started),
            });
        }
        if let Some(pgid) = job_pgid {
            let command = lookup(pgid).unwrap_or_else(|| format!("pid {pgid}"));
            changes.push(ForegroundChange::Started {
                command: command.clone(),
            });
            self.current = Some(ForegroundJob {
                pgid,
                command,
                started: now,
            });
        }
        changes
    }
}

/// The keystrokes that detach from a multiplexer, if `command` runs one.
pub fn multiplexer_detach_keys(command: &str) -> Option<&'static [u8]> {
    let program = command.split_whitespace().next()?;
    match program.rsplit('/').next()? {
        "tmux" => Some(b"\x02d"),
        "screen" => Some(b"\x01d"),
        "zellij" => Some(b"\x0fd"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions() {
        let t0 = Instant::now();
        let mut tracker = ForegroundTracker::new();

        assert!(tracker.observe(100, Some(100), t0, |_| None).is_empty());

        let started = tracker.observe(100, Some(200), t0, |pid| {
            assert_eq!(pid, 200);
            Some("vim notes.txt".into())
        });
        assert_eq!(
            started,
            vec![ForegroundChange::Started {
                command: "vim notes.txt".into()
            }]
        );

        // Same job: no change, and no lookup.
        assert!(tracker
            .observe(100, Some(200), t0, |_| panic!("unexpected lookup"))
            .is_empty());

        let t1 = t0 + Duration::from_secs(4);
        let finished = tracker.observe(100, Some(100), t1, |_| None);
        assert_eq!(
            finished,
            vec![ForegroundChange::Finished {
                command: "vim notes.txt".into(),
                duration: Duration::from_secs(4)
            }]
        );
        assert!(tracker.current().is_none());
    }

    #[test]
    fn job_switch_finishes_then_starts() {
        let t0 = Instant::now();
        let mut tracker = ForegroundTracker::new();
        tracker.observe(1, Some(2), t0, |_| Some("make".into()));
        let changes = tracker.observe(1, Some(3), t0, |_| None);
        assert_eq!(changes.len(), 2);
        assert!(matches!(&changes[0], ForegroundChange::Finished { command, .. } if command == "make"));
        assert_eq!(
            changes[1],
            ForegroundChange::Started {
                command: "pid 3".into()
            }
        );
    }

    #[test]
    fn detects_multiplexers() {
        assert_eq!(multiplexer_detach_keys("tmux attach -t 0"), Some(&b"\x02d"[..]));
        assert_eq!(multiplexer_detach_keys("/usr/bin/screen -r"), Some(&b"\x01d"[..]));
        assert_eq!(multiplexer_detach_keys("zellij"), Some(&b"\x0fd"[..]));
        assert_eq!(multiplexer_detach_keys("vim"), None);
        assert_eq!(multiplexer_detach_keys(""), None);
    }
}
