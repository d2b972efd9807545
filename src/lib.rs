//! Library crate for port-scan-rs: validation, probing, bounded scheduling and scan sessions.
pub mod prober;
pub mod scanner;
pub mod server;
pub mod session;
pub mod types;
pub mod validate;

pub use prober::{probe, ProbeInfrastructureError, Prober, TcpProber};
pub use scanner::{scan, scan_with};
pub use session::{ScanSession, SessionError};
pub use types::{
    PortStatus, ProbeResult, ScanOptions, ScanOutcome, ScanReport, SessionState, SessionUpdate,
    Target,
};
pub use validate::{validate, ValidationError};
