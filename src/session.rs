//! Lifecycle of a scan handle: validation, background run, progress publication.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use time::{format_description::well_known, OffsetDateTime};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::prober::{Prober, TcpProber};
use crate::scanner;
use crate::types::{
    ProbeResult, ScanOptions, ScanOutcome, ScanReport, SessionState, SessionUpdate, Target,
};
use crate::validate::{validate, ValidationError};

type Subscriber = Arc<dyn Fn(&SessionUpdate) + Send + Sync>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("a scan is already running on this session")]
    AlreadyRunning,
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("no tokio runtime available to run the scan")]
    NoRuntime,
}

/// Cloneable handle to one scan session. Clones share the same state.
///
/// A handle runs at most one scan at a time. Once a run is terminal the handle can be
/// started again.
#[derive(Clone)]
pub struct ScanSession {
    inner: Arc<Inner>,
}

struct Inner {
    options: ScanOptions,
    prober: Arc<dyn Prober>,
    run: Mutex<RunState>,
    subscribers: Mutex<Vec<Subscriber>>,
    finished: watch::Sender<Option<ScanReport>>,
}

#[derive(Default)]
struct RunState {
    // Bumped on every launch; a finishing task only settles its own run.
    generation: u64,
    state: SessionState,
    target: Option<Target>,
    cancel: Option<CancellationToken>,
    scanned: usize,
    report: Option<ScanReport>,
}

impl ScanSession {
    pub fn new(options: ScanOptions) -> Self {
        Self::with_prober(options, Arc::new(TcpProber))
    }

    /// Session driven by a custom prober.
    pub fn with_prober(options: ScanOptions, prober: Arc<dyn Prober>) -> Self {
        let (finished, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                options,
                prober,
                run: Mutex::new(RunState::default()),
                subscribers: Mutex::new(Vec::new()),
                finished,
            }),
        }
    }

    pub fn options(&self) -> ScanOptions {
        self.inner.options
    }

    /// Validate raw input and start scanning in the background.
    ///
    /// On a validation error the session moves to `Failed` before returning, and
    /// subscribers receive the terminal update. Must be called from within a tokio runtime.
    pub fn start(
        &self,
        host: &str,
        port_start: &str,
        port_end: &str,
    ) -> Result<Target, SessionError> {
        let run = self.inner.lock_run();
        if run.state == SessionState::Running {
            return Err(SessionError::AlreadyRunning);
        }
        match validate(host, port_start, port_end) {
            Ok(target) => self.launch(run, target),
            Err(e) => {
                warn!(host, port_start, port_end, error = %e, "scan input rejected");
                self.inner.fail(run, &e);
                Err(SessionError::Validation(e))
            }
        }
    }

    /// Start scanning an already validated target.
    pub fn start_target(&self, target: Target) -> Result<Target, SessionError> {
        let run = self.inner.lock_run();
        if run.state == SessionState::Running {
            return Err(SessionError::AlreadyRunning);
        }
        self.launch(run, target)
    }

    fn launch(
        &self,
        mut run: MutexGuard<'_, RunState>,
        target: Target,
    ) -> Result<Target, SessionError> {
        let rt = Handle::try_current().map_err(|_| SessionError::NoRuntime)?;
        let cancel = CancellationToken::new();
        let generation = run.generation + 1;
        *run = RunState {
            generation,
            state: SessionState::Running,
            target: Some(target),
            cancel: Some(cancel.clone()),
            scanned: 0,
            report: None,
        };
        self.inner.finished.send_replace(None);
        drop(run);

        let inner = self.inner.clone();
        let started_at = now_rfc3339();
        let task = rt.spawn({
            let started_at = started_at.clone();
            async move {
                let progress = inner.clone();
                let outcome = scanner::scan_with(
                    target,
                    &inner.options,
                    inner.prober.clone(),
                    move |result| progress.record_progress(result),
                    cancel,
                )
                .await;
                inner.complete(generation, target, outcome, started_at);
            }
        });

        let supervisor = self.inner.clone();
        rt.spawn(async move {
            if let Err(e) = task.await {
                error!(error = %e, "scan task died");
                supervisor.abort(generation, target, started_at, e.to_string());
            }
        });
        Ok(target)
    }

    /// Request cooperative cancellation of the running scan. No effect otherwise.
    pub fn cancel(&self) {
        let run = self.inner.lock_run();
        if run.state != SessionState::Running {
            return;
        }
        if let Some(token) = run.cancel.as_ref() {
            if !token.is_cancelled() {
                info!("scan cancellation requested");
                token.cancel();
            }
        }
    }

    /// Register a listener for every progress and terminal update.
    pub fn subscribe<F>(&self, on_update: F)
    where
        F: Fn(&SessionUpdate) + Send + Sync + 'static,
    {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(on_update));
    }

    /// Listener invoked once per resolved port.
    pub fn on_progress<F>(&self, callback: F)
    where
        F: Fn(&ProbeResult) + Send + Sync + 'static,
    {
        self.subscribe(move |update| {
            if let SessionUpdate::Progress(result) = update {
                callback(result);
            }
        });
    }

    /// Listener invoked with the terminal state and port-ordered results.
    pub fn on_complete<F>(&self, callback: F)
    where
        F: Fn(SessionState, &[ProbeResult]) + Send + Sync + 'static,
    {
        self.subscribe(move |update| {
            if let SessionUpdate::Finished(report) = update {
                callback(report.state, &report.results);
            }
        });
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock_run().state
    }

    pub fn target(&self) -> Option<Target> {
        self.inner.lock_run().target
    }

    /// `(scanned, total)` for the current or last run.
    pub fn progress(&self) -> (usize, usize) {
        let run = self.inner.lock_run();
        (run.scanned, run.target.map_or(0, |t| t.len()))
    }

    /// Terminal report of the last finished run.
    pub fn report(&self) -> Option<ScanReport> {
        self.inner.lock_run().report.clone()
    }

    /// Wait for the current run to finish. Returns `None` if nothing was ever started.
    pub async fn wait(&self) -> Option<ScanReport> {
        let mut rx = self.inner.finished.subscribe();
        if self.state() == SessionState::Idle {
            return None;
        }
        let report = rx.wait_for(Option::is_some).await.ok()?;
        report.clone()
    }
}

impl Inner {
    fn lock_run(&self) -> MutexGuard<'_, RunState> {
        self.run.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, update: &SessionUpdate) {
        let subscribers: Vec<Subscriber> = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for subscriber in subscribers {
            if panic::catch_unwind(AssertUnwindSafe(|| subscriber(update))).is_err() {
                warn!("session subscriber panicked");
            }
        }
    }

    fn record_progress(&self, result: &ProbeResult) {
        self.lock_run().scanned += 1;
        self.publish(&SessionUpdate::Progress(result.clone()));
    }

    fn fail(&self, mut run: MutexGuard<'_, RunState>, error: &ValidationError) {
        let now = now_rfc3339();
        let report = ScanReport {
            target: None,
            state: SessionState::Failed,
            results: Vec::new(),
            error: Some(error.to_string()),
            started_at: now.clone(),
            finished_at: now,
        };
        *run = RunState {
            generation: run.generation,
            state: SessionState::Failed,
            report: Some(report.clone()),
            ..RunState::default()
        };
        self.finished.send_replace(Some(report.clone()));
        drop(run);
        self.publish(&SessionUpdate::Finished(report));
    }

    fn complete(&self, generation: u64, target: Target, outcome: ScanOutcome, started_at: String) {
        let state = if outcome.cancelled {
            SessionState::Cancelled
        } else {
            SessionState::Completed
        };
        let report = ScanReport {
            target: Some(target),
            state,
            results: outcome.results,
            error: None,
            started_at,
            finished_at: now_rfc3339(),
        };
        info!(host = %target.host(), ?state, open = report.open_count(), "scan session finished");
        self.settle(generation, report);
    }

    /// Terminal path for a scan task that panicked or was aborted.
    fn abort(&self, generation: u64, target: Target, started_at: String, reason: String) {
        let report = ScanReport {
            target: Some(target),
            state: SessionState::Failed,
            results: Vec::new(),
            error: Some(reason),
            started_at,
            finished_at: now_rfc3339(),
        };
        self.settle(generation, report);
    }

    /// Make `report` the outcome of run `generation`, unless a newer run has started.
    ///
    /// State and the completion channel change under the run lock, so a restart from a
    /// subscriber callback always sees a consistent terminal session.
    fn settle(&self, generation: u64, report: ScanReport) {
        {
            let mut run = self.lock_run();
            if run.generation != generation || run.state != SessionState::Running {
                return;
            }
            run.state = report.state;
            run.cancel = None;
            run.report = Some(report.clone());
            self.finished.send_replace(Some(report.clone()));
        }
        self.publish(&SessionUpdate::Finished(report));
    }
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}
