//! Periodic liveness report: runtime task counts, process memory and
//! per-session counters.

use std::time::Duration;

use podlink_forward::{SessionHandle, StatsSnapshot};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessMemory {
    pub resident_bytes: u64,
    pub virtual_bytes: u64,
}

pub struct Reporter {
    sessions: Vec<SessionHandle>,
    system: System,
    pid: Option<Pid>,
}

impl Reporter {
    pub fn new(sessions: Vec<SessionHandle>) -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                debug!(%e, "process memory unavailable");
                None
            }
        };
        Self {
            sessions,
            system: System::new(),
            pid,
        }
    }

    pub fn process_memory(&mut self) -> Option<ProcessMemory> {
        let pid = self.pid?;
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::new().with_memory(),
        );
        self.system.process(pid).map(|process| ProcessMemory {
            resident_bytes: process.memory(),
            virtual_bytes: process.virtual_memory(),
        })
    }

    pub fn totals(&self) -> StatsSnapshot {
        self.sessions
            .iter()
            .map(|s| s.stats().snapshot())
            .fold(StatsSnapshot::default(), |acc, s| acc + s)
    }

    /// Emit one report.
    pub fn report(&mut self) {
        let metrics = tokio::runtime::Handle::current().metrics();
        let memory = self.process_memory();
        let totals = self.totals();

        info!(
            alive_tasks = metrics.num_alive_tasks(),
            workers = metrics.num_workers(),
            resident_mib = memory.map(|m| m.resident_bytes / (1024 * 1024)),
            virtual_mib = memory.map(|m| m.virtual_bytes / (1024 * 1024)),
            sessions = self.sessions.len(),
            accepted = totals.accepted,
            active_pumps = totals.active_pumps,
            failed = totals.pumps_failed,
            reconnects = totals.reconnects,
            "diagnostics"
        );

        for session in &self.sessions {
            let stats = session.stats().snapshot();
            debug!(
                mapping = %session.mapping(),
                state = %session.state(),
                accepted = stats.accepted,
                active_pumps = stats.active_pumps,
                succeeded = stats.pumps_succeeded,
                failed = stats.pumps_failed,
                protocol_errors = stats.protocol_errors,
                reconnects = stats.reconnects,
                "session counters"
            );
        }
    }

    /// Report every `interval` until `cancel` fires. The first report is
    /// emitted after one full interval.
    pub async fn run(mut self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => self.report(),
            }
        }
        debug!("diagnostics stopped");
    }
}

pub fn spawn(
    sessions: Vec<SessionHandle>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(Reporter::new(sessions).run(interval, cancel))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_process_has_memory() {
        let mut reporter = Reporter::new(Vec::new());
        let memory = reporter.process_memory().expect("own process is visible");
        assert!(memory.resident_bytes > 0);
    }

    #[test]
    fn totals_of_no_sessions_are_zero() {
        let reporter = Reporter::new(Vec::new());
        assert_eq!(reporter.totals(), StatsSnapshot::default());
    }

    #[tokio::test]
    async fn report_runs_inside_runtime() {
        Reporter::new(Vec::new()).report();
    }

    #[tokio::test]
    async fn stops_on_cancel() {
        let cancel = CancellationToken::new();
        let task = spawn(Vec::new(), Duration::from_millis(10), cancel.clone());
        tokio::time::sleep(Duration::from_millis(35)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("reporter did not stop")
            .unwrap();
    }
}
