use std::collections::HashMap;

use tokio::task::{Id, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::mapping::{validate_all, PortMapping};
use crate::session::{Session, SessionDeps, SessionExit, SessionHandle};
use crate::stats::StatsSnapshot;

/// Final report for one mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub mapping: PortMapping,
    /// `None` if the session task panicked or was aborted.
    pub exit: Option<SessionExit>,
}

/// Runs one independent [`Session`] per mapping.
///
/// Sessions share nothing but their collaborators; a failing session never
/// stops its siblings.
pub struct Fleet {
    sessions: Vec<SessionHandle>,
    tasks: JoinSet<SessionExit>,
    task_mappings: HashMap<Id, PortMapping>,
    shutdown: CancellationToken,
}

impl Fleet {
    /// Validate `mappings` and start a session for each. Nothing is started
    /// if any mapping is invalid.
    pub fn spawn(
        mappings: Vec<PortMapping>,
        deps: SessionDeps,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        validate_all(&mappings)?;

        let mut sessions = Vec::with_capacity(mappings.len());
        let mut tasks = JoinSet::new();
        let mut task_mappings = HashMap::with_capacity(mappings.len());

        for mapping in mappings {
            let (session, handle) = Session::new(mapping.clone(), deps.clone());
            let abort = tasks.spawn(session.run(shutdown.clone()));
            task_mappings.insert(abort.id(), mapping);
            sessions.push(handle);
        }

        info!(sessions = sessions.len(), "fleet started");
        Ok(Self {
            sessions,
            tasks,
            task_mappings,
            shutdown,
        })
    }

    pub fn sessions(&self) -> &[SessionHandle] {
        &self.sessions
    }

    /// Counters summed across every session.
    pub fn totals(&self) -> StatsSnapshot {
        self.sessions
            .iter()
            .map(|s| s.stats().snapshot())
            .fold(StatsSnapshot::default(), |acc, s| acc + s)
    }

    /// Token that stops every session when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Ask every session to stop. Returns immediately; use [`Fleet::wait`]
    /// to observe completion.
    pub fn shutdown(&self) {
        info!("shutting down all sessions");
        self.shutdown.cancel();
    }

    /// Wait for every session to end.
    pub async fn wait(mut self) -> Vec<SessionReport> {
        let mut reports = Vec::with_capacity(self.task_mappings.len());

        while let Some(joined) = self.tasks.join_next_with_id().await {
            match joined {
                Ok((id, exit)) => {
                    let Some(mapping) = self.task_mappings.remove(&id) else {
                        continue;
                    };
                    match &exit {
                        SessionExit::Terminated => info!(%mapping, "session stopped"),
                        SessionExit::Exhausted {
                            retries,
                            last_error,
                        } => warn!(%mapping, retries, %last_error, "session gave up"),
                    }
                    reports.push(SessionReport {
                        mapping,
                        exit: Some(exit),
                    });
                }
                Err(e) => {
                    let Some(mapping) = self.task_mappings.remove(&e.id()) else {
                        continue;
                    };
                    error!(%mapping, %e, "session task failed");
                    reports.push(SessionReport {
                        mapping,
                        exit: None,
                    });
                }
            }
        }

        reports
    }
}
