use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::{Id, JoinError, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::prober::{ProbeInfrastructureError, Prober, TcpProber};
use crate::types::{PortStatus, ProbeResult, ScanOptions, ScanOutcome, Target};

type ProbeTaskOutput = (u16, u64, Result<ProbeResult, ProbeInfrastructureError>);

/// Scan `target` with real TCP connects. See [`scan_with`].
pub async fn scan<F>(
    target: Target,
    options: &ScanOptions,
    on_progress: F,
    cancel: CancellationToken,
) -> ScanOutcome
where
    F: FnMut(&ProbeResult),
{
    scan_with(target, options, Arc::new(TcpProber), on_progress, cancel).await
}

/// Probe every port of `target` with at most `options.effective_concurrency()` probes in flight.
///
/// - Dispatch is gated by a `Semaphore`; each task owns its permit until its probe resolves.
/// - `on_progress` runs once per resolved port, in completion order.
/// - Cancellation stops dispatch; probes already in flight are awaited and reported.
/// - Probe failures are recorded as `filtered` for that port and never end the scan.
///
/// The returned results are sorted by port.
pub async fn scan_with<P, F>(
    target: Target,
    options: &ScanOptions,
    prober: Arc<P>,
    mut on_progress: F,
    cancel: CancellationToken,
) -> ScanOutcome
where
    P: Prober + ?Sized,
    F: FnMut(&ProbeResult),
{
    let concurrency = options.effective_concurrency();
    let timeout = options.timeout();
    let host = target.host();
    info!(
        %host,
        port_start = target.port_start(),
        port_end = target.port_end(),
        concurrency,
        timeout_ms = timeout.as_millis() as u64,
        "scan starting"
    );

    let sem = Arc::new(Semaphore::new(concurrency));
    let mut set: JoinSet<ProbeTaskOutput> = JoinSet::new();
    let mut in_flight: HashMap<Id, u16> = HashMap::new();
    let mut results: Vec<ProbeResult> = Vec::with_capacity(target.len());
    let mut cancelled = false;

    let mut ports = target.ports();
    let mut next_port = ports.next();

    while let Some(port) = next_port {
        if cancel.is_cancelled() {
            cancelled = true;
            break;
        }

        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                cancelled = true;
                break;
            }
            Some(joined) = set.join_next_with_id(), if !set.is_empty() => {
                let result = settle(joined, &mut in_flight);
                on_progress(&result);
                results.push(result);
            }
            permit = sem.clone().acquire_owned() => {
                let Ok(permit) = permit else {
                    // The semaphore is never closed while we hold it.
                    break;
                };
                let prober = prober.clone();
                let handle = set.spawn(async move {
                    let _permit = permit;
                    let start = Instant::now();
                    let res = prober.probe(host, port, timeout).await;
                    (port, start.elapsed().as_millis() as u64, res)
                });
                in_flight.insert(handle.id(), port);
                next_port = ports.next();
            }
        }
    }

    if cancelled {
        debug!(in_flight = set.len(), "scan cancelled, draining in-flight probes");
    }

    while let Some(joined) = set.join_next_with_id().await {
        let result = settle(joined, &mut in_flight);
        on_progress(&result);
        results.push(result);
    }

    results.sort_by_key(|r| r.port);
    info!(
        %host,
        resolved = results.len(),
        total = target.len(),
        cancelled,
        "scan finished"
    );
    ScanOutcome { results, cancelled }
}

/// Turn a joined task into exactly one result for its port.
fn settle(
    joined: Result<(Id, ProbeTaskOutput), JoinError>,
    in_flight: &mut HashMap<Id, u16>,
) -> ProbeResult {
    match joined {
        Ok((id, (port, elapsed_ms, res))) => {
            in_flight.remove(&id);
            match res {
                Ok(result) => result,
                Err(e) => {
                    warn!(port, error = %e, "probe failed, recording as filtered");
                    ProbeResult {
                        port,
                        status: PortStatus::Filtered,
                        latency_ms: elapsed_ms,
                    }
                }
            }
        }
        Err(e) => {
            let port = in_flight.remove(&e.id()).unwrap_or_default();
            warn!(port, error = %e, "probe task aborted, recording as filtered");
            ProbeResult {
                port,
                status: PortStatus::Filtered,
                latency_ms: 0,
            }
        }
    }
}
