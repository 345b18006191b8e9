use std::{future::Future, sync::Arc, time::Duration};

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;
use kiosk_core::{
    monitor::DEFAULT_POLL_TIMEOUT, CaptureDeviceAdapter, HttpDeviceStatusSource,
    HttpVerifierClient, HttpVoteClient, OrchestratorError, ScannerConnectivityMonitor,
    SessionEvent, VerificationOrchestrator,
};
use shared::domain::{DeviceKind, FactorKind, PollingStationId, VoterId};
use tokio::sync::broadcast;
use tracing::{info, warn};

mod config;
mod devices;

use devices::FileCaptureDevice;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = "kiosk.toml")]
    config: String,
    #[arg(long)]
    voter_id: String,
    #[arg(long)]
    polling_station: String,
    /// Factors to verify, in order.
    #[arg(long, value_delimiter = ',', default_value = "identity,face,fingerprint")]
    factors: Vec<String>,
    /// Overrides `station_url` from the config file.
    #[arg(long)]
    station_url: Option<String>,
    /// Automatic attempts per step before giving up.
    #[arg(long, default_value_t = 3)]
    attempts: u32,
    #[arg(long, default_value_t = 1000)]
    retry_delay_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let args = Args::parse();

    let mut settings = config::load_settings(&args.config);
    if let Some(url) = args.station_url.clone() {
        settings.station_url = url;
    }
    settings.validate()?;
    let factors = parse_factors(&args.factors)?;
    if args.attempts == 0 {
        bail!("--attempts must be at least 1");
    }

    let devices = Arc::new(
        CaptureDeviceAdapter::new(settings.capture_timeout())
            .with_device(Arc::new(FileCaptureDevice::new(
                DeviceKind::Camera,
                settings.face_sample_path.clone(),
            )))
            .with_device(Arc::new(FileCaptureDevice::new(
                DeviceKind::FingerprintScanner,
                settings.fingerprint_sample_path.clone(),
            ))),
    );

    let monitor = ScannerConnectivityMonitor::spawn(
        Arc::new(HttpDeviceStatusSource::new(settings.station_url.clone())),
        settings.scanner_poll_interval(),
        DEFAULT_POLL_TIMEOUT,
    );
    let mut first_poll = monitor.view();
    let _ = tokio::time::timeout(DEFAULT_POLL_TIMEOUT, first_poll.changed()).await;
    info!(status = ?monitor.last_status(), station = %settings.station_url, "fingerprint scanner status");

    let orchestrator = VerificationOrchestrator::new_with_dependencies(
        devices,
        Arc::new(HttpVerifierClient::new(settings.station_url.clone())),
        Arc::new(HttpVoteClient::new(settings.station_url.clone())),
        monitor.view(),
        settings.policy(),
    );
    let printer = tokio::spawn(print_events(orchestrator.subscribe_events()));

    let finished = tokio::select! {
        result = run_session(&orchestrator, &args, factors) => Some(result),
        _ = tokio::signal::ctrl_c() => None,
    };
    let outcome = match finished {
        Some(result) => result,
        None => {
            warn!("interrupted; cancelling session");
            orchestrator.cancel().await.context("cancel session")?;
            Err(anyhow!("session cancelled by operator"))
        }
    };

    if let Some(session) = orchestrator.snapshot().await {
        println!("{}", serde_json::to_string_pretty(&session)?);
    }
    monitor.shutdown();
    printer.abort();
    outcome.map(|transaction_ref| println!("Vote recorded: {transaction_ref}"))
}

fn parse_factors(raw: &[String]) -> Result<Vec<FactorKind>> {
    raw.iter()
        .map(|segment| {
            FactorKind::from_path_segment(segment.trim())
                .ok_or_else(|| anyhow!("unknown factor '{segment}' (use identity, face, fingerprint)"))
        })
        .collect()
}

async fn run_session(
    orchestrator: &VerificationOrchestrator,
    args: &Args,
    factors: Vec<FactorKind>,
) -> Result<String> {
    let session = orchestrator
        .start_session(
            VoterId::new(args.voter_id.as_str()),
            PollingStationId::new(args.polling_station.as_str()),
            factors.clone(),
        )
        .await
        .context("start session")?;
    info!(session_id = %session.session_id, voter_id = %session.voter_id, "session started");

    let delay = Duration::from_millis(args.retry_delay_ms);
    for factor in factors {
        with_retries(args.attempts, delay, &factor.to_string(), move || async move {
            orchestrator.begin_capture(factor).await?;
            orchestrator.capture_and_submit().await.map(|_| ())
        })
        .await?;
    }

    with_retries(args.attempts, delay, "vote", move || orchestrator.request_vote()).await
}

async fn with_retries<T, F, Fut>(attempts: u32, delay: Duration, step: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, OrchestratorError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_retryable() && attempt < attempts => {
                warn!(step, attempt, %error, "step failed; retrying");
                attempt += 1;
                tokio::time::sleep(delay).await;
            }
            Err(error) => {
                return Err(anyhow::Error::new(error)
                    .context(format!("{step} failed after {attempt} attempt(s)")))
            }
        }
    }
}

async fn print_events(mut events: broadcast::Receiver<SessionEvent>) {
    loop {
        match events.recv().await {
            Ok(SessionEvent::StateChanged { to, .. }) => println!("  [{to}]"),
            Ok(SessionEvent::Notice { message, .. }) => println!("  {message}"),
            Ok(SessionEvent::FactorRecorded { outcome, .. }) => println!(
                "  {} attempt {}: confidence {:.2}",
                outcome.factor_kind, outcome.attempt_count, outcome.confidence
            ),
            Ok(SessionEvent::VoteRecorded {
                transaction_ref, ..
            }) => println!("  ledger transaction {transaction_ref}"),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "event printer fell behind")
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
