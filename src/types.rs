use std::fmt;
use std::net::Ipv4Addr;
use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};

use crate::validate::{self, ValidationError};

/// Default number of probes allowed in flight at once.
pub const DEFAULT_CONCURRENCY: usize = 50;
/// Default per-probe connect timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 1000;
/// Upper bound applied to the requested concurrency.
pub const MAX_CONCURRENCY: usize = 1000;

/// A validated scan target: one IPv4 host and an inclusive port range.
///
/// Fields are private so a `Target` can only exist with a valid range.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    host: Ipv4Addr,
    port_start: u16,
    port_end: u16,
}

impl Target {
    /// Build a target from already-typed parts, applying the range checks.
    pub fn new(host: Ipv4Addr, port_start: u16, port_end: u16) -> Result<Self, ValidationError> {
        validate::check_range(port_start, port_end)?;
        Ok(Self {
            host,
            port_start,
            port_end,
        })
    }

    pub fn host(&self) -> Ipv4Addr {
        self.host
    }

    pub fn port_start(&self) -> u16 {
        self.port_start
    }

    pub fn port_end(&self) -> u16 {
        self.port_end
    }

    /// Ports in ascending order, both ends included.
    pub fn ports(&self) -> RangeInclusive<u16> {
        self.port_start..=self.port_end
    }

    /// Number of ports covered by the range (never zero).
    pub fn len(&self) -> usize {
        usize::from(self.port_end - self.port_start) + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

/// Classification of a single TCP connect attempt.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PortStatus {
    Open,
    Closed,
    Filtered,
}

impl PortStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PortStatus::Open => "open",
            PortStatus::Closed => "closed",
            PortStatus::Filtered => "filtered",
        }
    }
}

impl fmt::Display for PortStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// One resolved port.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub port: u16,
    pub status: PortStatus,
    pub latency_ms: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Idle,
    Running,
    Cancelled,
    Completed,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Cancelled | SessionState::Completed | SessionState::Failed
        )
    }
}

/// Tunables for one scan run.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanOptions {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

impl ScanOptions {
    /// Concurrency actually used by the scheduler.
    pub fn effective_concurrency(&self) -> usize {
        self.concurrency.clamp(1, MAX_CONCURRENCY)
    }

    /// Per-probe timeout actually used by the prober.
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.timeout_ms.max(1))
    }
}

/// What the scheduler hands back: port-ordered results and whether it stopped early.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanOutcome {
    pub results: Vec<ProbeResult>,
    pub cancelled: bool,
}

/// Terminal record of one session run.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct ScanReport {
    pub target: Option<Target>,
    pub state: SessionState,
    pub results: Vec<ProbeResult>,
    pub error: Option<String>,
    pub started_at: String,
    pub finished_at: String,
}

impl ScanReport {
    pub fn open_count(&self) -> usize {
        self.count(PortStatus::Open)
    }

    pub fn closed_count(&self) -> usize {
        self.count(PortStatus::Closed)
    }

    pub fn filtered_count(&self) -> usize {
        self.count(PortStatus::Filtered)
    }

    fn count(&self, status: PortStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }
}

/// Event published to session subscribers.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionUpdate {
    Progress(ProbeResult),
    Finished(ScanReport),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_ports_are_inclusive() {
        let t = Target::new(Ipv4Addr::LOCALHOST, 20, 25).unwrap();
        assert_eq!(t.len(), 6);
        assert_eq!(t.ports().collect::<Vec<_>>(), vec![20, 21, 22, 23, 24, 25]);
    }

    #[test]
    fn target_new_rejects_bad_ranges() {
        assert_eq!(
            Target::new(Ipv4Addr::LOCALHOST, 10, 9),
            Err(ValidationError::RangeInverted { start: 10, end: 9 })
        );
        assert!(matches!(
            Target::new(Ipv4Addr::LOCALHOST, 1, 1002),
            Err(ValidationError::RangeTooLarge { .. })
        ));
        assert!(matches!(
            Target::new(Ipv4Addr::LOCALHOST, 0, 10),
            Err(ValidationError::InvalidPortStart(_))
        ));
    }

    #[test]
    fn terminal_states() {
        assert!(!SessionState::Idle.is_terminal());
        assert!(!SessionState::Running.is_terminal());
        assert!(SessionState::Cancelled.is_terminal());
        assert!(SessionState::Completed.is_terminal());
        assert!(SessionState::Failed.is_terminal());
    }

    #[test]
    fn options_default_and_clamp() {
        let o = ScanOptions::default();
        assert_eq!(o.concurrency, 50);
        assert_eq!(o.timeout_ms, 1000);

        let o = ScanOptions {
            concurrency: 0,
            timeout_ms: 0,
        };
        assert_eq!(o.effective_concurrency(), 1);
        assert_eq!(o.timeout(), std::time::Duration::from_millis(1));

        let o = ScanOptions {
            concurrency: 100_000,
            timeout_ms: 5,
        };
        assert_eq!(o.effective_concurrency(), MAX_CONCURRENCY);
    }

    #[test]
    fn options_deserialize_with_defaults() {
        let o: ScanOptions = serde_json::from_str(r#"{"timeout_ms": 250}"#).unwrap();
        assert_eq!(
            o,
            ScanOptions {
                concurrency: 50,
                timeout_ms: 250
            }
        );
    }

    #[test]
    fn update_serializes_with_type_tag() {
        let u = SessionUpdate::Progress(ProbeResult {
            port: 22,
            status: PortStatus::Filtered,
            latency_ms: 1000,
        });
        let v = serde_json::to_value(&u).unwrap();
        assert_eq!(v["type"], "progress");
        assert_eq!(v["port"], 22);
        assert_eq!(v["status"], "filtered");
    }
}
