//! Background reconciliation of shares.
//!
//! The verifier checks every shared item of every active share against the
//! external resources and records its health. The reapplier moves unhealthy
//! items to `PendingReApply` and retries them together with failed items.
//! Neither sweep stops on a failing share: errors are collected, reported
//! once at the end through an admin digest, and the share is retried on the
//! next schedule.

use crate::config::SharingConfig;
use crate::notification::ShareNotification;
use crate::service::ShareService;
use metafuse_share_core::Result;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const VERIFIER_PROCESS: &str = "share-verifier";
pub const REAPPLIER_PROCESS: &str = "share-reapplier";

/// Outcome of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Shares handled without error
    pub processed: usize,
    /// One entry per failing share
    pub errors: Vec<String>,
}

impl SweepReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

pub struct ShareVerifier {
    service: Arc<ShareService>,
}

impl ShareVerifier {
    pub fn new(service: Arc<ShareService>) -> Self {
        Self { service }
    }

    /// Verify every active share once.
    pub async fn run_once(&self) -> Result<SweepReport> {
        let shares = self.service.repository().list_active_shares(None).await?;
        info!(shares = shares.len(), "Starting share verification sweep");

        let mut report = SweepReport::default();
        for share in shares {
            match self.service.verify_share(&share.share_uri, None).await {
                Ok(result) => {
                    debug!(
                        share_uri = %share.share_uri,
                        healthy = result.healthy.len(),
                        unhealthy = result.unhealthy.len(),
                        "Share verified"
                    );
                    report.processed += 1;
                }
                Err(e) => {
                    warn!(
                        share_uri = %share.share_uri,
                        retryable = e.is_retryable(),
                        error = %e,
                        "Share verification failed"
                    );
                    report.errors.push(format!("{}: {}", share.share_uri, e));
                }
            }
        }

        finish_sweep(&self.service, VERIFIER_PROCESS, &report).await;
        Ok(report)
    }
}

pub struct ShareReapplier {
    service: Arc<ShareService>,
}

impl ShareReapplier {
    pub fn new(service: Arc<ShareService>) -> Self {
        Self { service }
    }

    /// Reapply unhealthy and failed items of active shares, optionally only
    /// for one dataset.
    pub async fn run_once(&self, dataset_uri: Option<&str>) -> Result<SweepReport> {
        let shares = self
            .service
            .repository()
            .list_active_shares(dataset_uri)
            .await?;
        info!(
            shares = shares.len(),
            dataset_uri = dataset_uri.unwrap_or("*"),
            "Starting share reapply sweep"
        );

        let mut report = SweepReport::default();
        for share in shares {
            match self.service.reapply_share(&share.share_uri, None).await {
                Ok(reapplied) => {
                    if !reapplied.is_empty() {
                        info!(
                            share_uri = %share.share_uri,
                            succeeded = reapplied.succeeded.len(),
                            failed = reapplied.failed.len(),
                            "Share items reapplied"
                        );
                    }
                    report.processed += 1;
                }
                Err(e) => {
                    warn!(
                        share_uri = %share.share_uri,
                        retryable = e.is_retryable(),
                        error = %e,
                        "Share reapply failed"
                    );
                    report.errors.push(format!("{}: {}", share.share_uri, e));
                }
            }
        }

        finish_sweep(&self.service, REAPPLIER_PROCESS, &report).await;
        Ok(report)
    }
}

async fn finish_sweep(service: &ShareService, process_name: &str, report: &SweepReport) {
    info!(
        process = process_name,
        processed = report.processed,
        errors = report.errors.len(),
        "Sweep finished"
    );
    if report.is_clean() {
        return;
    }

    #[cfg(feature = "metrics")]
    crate::metrics::record_sweep_errors(process_name, report.errors.len());

    service
        .notify(ShareNotification::AdminErrorDigest {
            process_name: process_name.to_string(),
            errors: report.errors.clone(),
        })
        .await;
}

/// Background task running the verifier on its interval, followed by a
/// reapplier sweep when `reapply_after_verify` is set.
pub async fn verifier_task(service: Arc<ShareService>, config: SharingConfig) {
    let verifier = ShareVerifier::new(service.clone());
    let reapplier = ShareReapplier::new(service);
    let interval = config.verifier_interval;

    info!(
        interval_secs = interval.as_secs(),
        reapply_after_verify = config.reapply_after_verify,
        "Share verifier task started"
    );

    loop {
        tokio::time::sleep(interval).await;

        if let Err(e) = verifier.run_once().await {
            error!(error = %e, "Share verification sweep failed");
            continue;
        }

        if config.reapply_after_verify {
            if let Err(e) = reapplier.run_once(None).await {
                error!(error = %e, "Share reapply sweep failed");
            }
        }
    }
}

/// Background task running the reapplier on its own interval.
pub async fn reapplier_task(service: Arc<ShareService>, interval: Duration) {
    let reapplier = ShareReapplier::new(service);
    info!(interval_secs = interval.as_secs(), "Share reapplier task started");

    loop {
        tokio::time::sleep(interval).await;

        if let Err(e) = reapplier.run_once(None).await {
            error!(error = %e, "Share reapply sweep failed");
        }
    }
}
