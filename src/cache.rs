use std::future::Future;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::error;

use crate::error::PortalError;
use crate::report::AbsenceReport;

/// Single-entry cache for the absence report.
///
/// A report older than the refresh interval triggers a refresh on the next
/// read, but only one refresh runs at a time; concurrent readers get the
/// stale report (or nothing) instead of waiting. After a failed refresh the
/// portal is left alone for the backoff window.
pub struct ReportCache {
    refresh_interval: Duration,
    error_backoff: Duration,
    state: Mutex<CacheState>,
    refresh_gate: Mutex<()>,
}

#[derive(Default)]
struct CacheState {
    report: Option<AbsenceReport>,
    last_fetch: Option<Instant>,
    last_error: Option<Instant>,
}

#[derive(Debug)]
pub enum ReportOutcome {
    /// A report is available (possibly stale).
    Ready(AbsenceReport),
    /// Refreshes are failing, and no report has ever succeeded.
    Backoff,
    /// No report yet and this request produced none.
    Empty,
}

impl ReportCache {
    pub fn new(refresh_interval: Duration, error_backoff: Duration) -> Self {
        Self {
            refresh_interval,
            error_backoff,
            state: Mutex::new(CacheState::default()),
            refresh_gate: Mutex::new(()),
        }
    }

    /// Serves the cached report, refreshing it via `refresh` when stale.
    pub async fn get_or_refresh<F, Fut>(&self, refresh: F) -> ReportOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<AbsenceReport, PortalError>>,
    {
        let now = Instant::now();

        {
            let state = self.state.lock().await;
            if let Some(failed_at) = state.last_error {
                if now.duration_since(failed_at) < self.error_backoff {
                    return match &state.report {
                        Some(report) => ReportOutcome::Ready(report.clone()),
                        None => ReportOutcome::Backoff,
                    };
                }
            }
        }

        let stale = {
            let state = self.state.lock().await;
            match state.last_fetch {
                Some(fetched_at) if state.report.is_some() => {
                    now.duration_since(fetched_at) > self.refresh_interval
                }
                _ => true,
            }
        };

        if stale {
            // Non-blocking: whoever loses the gate serves what's cached.
            if let Ok(_guard) = self.refresh_gate.try_lock() {
                match refresh().await {
                    Ok(report) => {
                        let mut state = self.state.lock().await;
                        state.report = Some(report);
                        state.last_fetch = Some(Instant::now());
                        state.last_error = None;
                    }
                    Err(err) => {
                        error!("Refreshing the absence report failed: {}", err);
                        let mut state = self.state.lock().await;
                        state.last_error = Some(Instant::now());
                    }
                }
            }
        }

        let state = self.state.lock().await;
        match &state.report {
            Some(report) => ReportOutcome::Ready(report.clone()),
            None => ReportOutcome::Empty,
        }
    }
}
