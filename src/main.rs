use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use port_scan_rs::types::{ScanReport, DEFAULT_CONCURRENCY, DEFAULT_TIMEOUT_MS};
use port_scan_rs::{server, ScanOptions, ScanSession};

/// port-scan-rs — bounded-concurrency async TCP connect scanner for one host and a port range.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "port-scan-rs",
    version,
    about = "Bounded-concurrency async TCP connect scanner for one IPv4 host and a port range.",
    long_about = None
)]
struct Cli {
    /// IPv4 address to scan (e.g., 192.168.1.1).
    #[arg(long, required_unless_present = "serve")]
    host: Option<String>,

    /// First port of the range (1-65535).
    #[arg(long = "start-port", required_unless_present = "serve")]
    start_port: Option<String>,

    /// Last port of the range; at most 1000 above the start port.
    #[arg(long = "end-port", required_unless_present = "serve")]
    end_port: Option<String>,

    /// Max concurrent TCP connect attempts.
    #[arg(long, default_value_t = DEFAULT_CONCURRENCY)]
    concurrency: usize,

    /// Socket connect timeout in milliseconds.
    #[arg(long = "timeout-ms", default_value_t = DEFAULT_TIMEOUT_MS)]
    timeout_ms: u64,

    /// Write the final report as pretty JSON to this path (optional).
    #[arg(long)]
    output: Option<PathBuf>,

    /// Serve the HTTP scan API instead of running a single scan.
    #[arg(long, default_value_t = false)]
    serve: bool,

    /// Address for the HTTP API.
    #[arg(long, default_value = "127.0.0.1:8080")]
    bind: String,

    /// Static directory served next to the API (e.g., a built front end).
    #[arg(long = "ui-dir")]
    ui_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG=debug shows every probe.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if cli.serve {
        tokio::select! {
            res = server::spawn_server(&cli.bind, cli.ui_dir.clone()) => res?,
            _ = tokio::signal::ctrl_c() => info!("shutting down"),
        }
        return Ok(());
    }

    let options = ScanOptions {
        concurrency: cli.concurrency,
        timeout_ms: cli.timeout_ms,
    };
    let session = ScanSession::new(options);
    session.on_progress(|r| {
        println!("  {:>5}  {:<8}  {} ms", r.port, r.status, r.latency_ms);
    });

    let target = session
        .start(
            cli.host.as_deref().unwrap_or_default(),
            cli.start_port.as_deref().unwrap_or_default(),
            cli.end_port.as_deref().unwrap_or_default(),
        )
        .context("cannot start scan")?;
    println!(
        "Scanning {} ports {}-{} ({} ports, concurrency {}, timeout {} ms)",
        target.host(),
        target.port_start(),
        target.port_end(),
        target.len(),
        options.effective_concurrency(),
        options.timeout().as_millis()
    );

    // Ctrl-C cancels the scan; results gathered so far are still reported.
    let cancel_session = session.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel_session.cancel();
        }
    });

    let report = session
        .wait()
        .await
        .context("scan session ended without a report")?;
    print_results_table(&report);

    if let Some(path) = cli.output.as_deref() {
        write_results_json(path, &report)
            .with_context(|| format!("failed to write JSON to {}", path.display()))?;
        println!("Wrote JSON results to {}", path.display());
    }

    Ok(())
}

fn print_results_table(report: &ScanReport) {
    let port_w = 5usize;
    let status_w = "filtered".len();
    let lat_w = "latency_ms".len();

    println!(
        "\nState: {:?}  open: {}  closed: {}  filtered: {}  (resolved {})",
        report.state,
        report.open_count(),
        report.closed_count(),
        report.filtered_count(),
        report.results.len()
    );
    println!("{:>port_w$}  {:<status_w$}  {:>lat_w$}", "port", "status", "latency_ms");
    println!("{:-<port_w$}  {:-<status_w$}  {:-<lat_w$}", "", "", "");
    for r in &report.results {
        println!("{:>port_w$}  {:<status_w$}  {:>lat_w$}", r.port, r.status, r.latency_ms);
    }
}

fn write_results_json(path: &Path, report: &ScanReport) -> Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, report)?;
    Ok(())
}
