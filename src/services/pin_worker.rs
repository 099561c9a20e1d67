//! src/services/pin_worker.rs
//!
//! Pin worker. Drains finish signals and pushes every uploaded-but-unpinned
//! asset through reassemble → archive → remote upload.
//!
//! Signals are only wake-ups: each one triggers a sweep over *all* pending
//! assets, so an asset whose signal was lost (or whose previous attempt
//! failed) is picked up by the next sweep. A ticker injects a synthetic
//! signal on a fixed interval to bound that staleness.

use crate::{
    config::PinConfig,
    errors::GatewayResult,
    models::{
        asset::Asset,
        usage::UsageKind,
    },
    services::{
        archiver,
        asset_repository::{AssetRepository, PendingFilter},
        chunk_store::ChunkStore,
        reassembler::Reassembler,
        remote::RemoteStore,
        usage::{self, UsageService},
    },
};
use futures::{StreamExt, stream};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{
    sync::{
        mpsc::{self, error::TrySendError},
        watch,
    },
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

/// Wake-up sent to the pin worker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FinishSignal {
    /// A client finished uploading this asset.
    Asset(String),
    /// Periodic sweep from the ticker.
    Sweep,
}

/// Producer side of the bounded finish-signal queue.
#[derive(Clone, Debug)]
pub struct FinishQueue {
    tx: mpsc::Sender<FinishSignal>,
}

impl FinishQueue {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<FinishSignal>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Enqueue without waiting. A full or closed queue drops the signal;
    /// the next tick sweeps anyway.
    pub fn notify(&self, signal: FinishSignal) -> bool {
        match self.tx.try_send(signal) {
            Ok(()) => true,
            Err(TrySendError::Full(signal)) => {
                warn!(?signal, "finish queue full, dropping signal");
                false
            }
            Err(TrySendError::Closed(signal)) => {
                warn!(?signal, "pin worker stopped, dropping signal");
                false
            }
        }
    }
}

/// Counts from one sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub found: usize,
    pub pinned: usize,
    pub failed: usize,
    /// Claimed by a concurrent sweep before this one got to it.
    pub skipped: usize,
}

enum PinOutcome {
    Pinned,
    Failed,
    Skipped,
}

pub struct PinWorker {
    assets: AssetRepository,
    chunks: ChunkStore,
    reassembler: Reassembler,
    remote: RemoteStore,
    usage: UsageService,
    batch_token: String,
    config: PinConfig,
}

impl PinWorker {
    pub fn new(
        assets: AssetRepository,
        chunks: ChunkStore,
        remote: RemoteStore,
        usage: UsageService,
        batch_token: impl Into<String>,
        config: PinConfig,
    ) -> Self {
        Self {
            assets,
            reassembler: Reassembler::new(chunks.clone()),
            chunks,
            remote,
            usage,
            batch_token: batch_token.into(),
            config,
        }
    }

    pub fn spawn(
        self: Arc<Self>,
        rx: mpsc::Receiver<FinishSignal>,
        cancel: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(rx, cancel).await })
    }

    /// Consume finish signals until cancelled or every producer is gone.
    ///
    /// On cancellation the in-flight sweep completes, signals still queued
    /// get one final sweep, then the loop exits.
    pub async fn run(
        &self,
        mut rx: mpsc::Receiver<FinishSignal>,
        mut cancel: watch::Receiver<bool>,
    ) {
        info!(
            concurrency = self.config.concurrency,
            retry_backoff_secs = self.config.retry_backoff.as_secs(),
            max_attempts = self.config.max_attempts,
            "Pin worker started"
        );

        match self.assets.release_stale_claims().await {
            Ok(0) => {}
            Ok(released) => warn!(released, "released pin claims left by a previous run"),
            Err(err) => error!(error = %err, "failed to release stale pin claims"),
        }

        loop {
            tokio::select! {
                biased;
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        info!("Pin worker received shutdown signal");
                        break;
                    }
                }
                signal = rx.recv() => match signal {
                    Some(signal) => {
                        let coalesced = drain(&mut rx);
                        debug!(?signal, coalesced, "finish signal received");
                        self.sweep_logged().await;
                    }
                    None => {
                        info!("Finish queue closed, pin worker stopping");
                        return;
                    }
                },
            }
        }

        if drain(&mut rx) > 0 {
            info!("Running final sweep for queued finish signals");
            self.sweep_logged().await;
        }
        info!("Pin worker shut down complete");
    }

    async fn sweep_logged(&self) {
        let started = Instant::now();
        match self.sweep().await {
            Ok(report) if report.found == 0 => {
                debug!(elapsed_ms = elapsed_ms(started), "sweep found nothing to pin")
            }
            Ok(report) => info!(
                found = report.found,
                pinned = report.pinned,
                failed = report.failed,
                skipped = report.skipped,
                elapsed_ms = elapsed_ms(started),
                "sweep finished"
            ),
            Err(err) => error!(error = %err, "sweep failed"),
        }

        match self.assets.count_exhausted(self.config.max_attempts).await {
            Ok(0) => {}
            Ok(exhausted) => warn!(
                exhausted,
                max_attempts = self.config.max_attempts,
                "assets exhausted their pin attempts and are no longer retried"
            ),
            Err(err) => error!(error = %err, "failed to count exhausted assets"),
        }
    }

    /// One pass over every asset waiting to be pinned.
    pub async fn sweep(&self) -> GatewayResult<SweepReport> {
        let filter = PendingFilter {
            retry_backoff: self.config.retry_backoff,
            max_attempts: self.config.max_attempts,
        };
        let pending = self.assets.list_pending(&filter).await?;

        let mut report = SweepReport {
            found: pending.len(),
            ..SweepReport::default()
        };
        let outcomes: Vec<PinOutcome> = stream::iter(pending)
            .map(|asset| self.pin_asset(asset))
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;
        for outcome in outcomes {
            match outcome {
                PinOutcome::Pinned => report.pinned += 1,
                PinOutcome::Failed => report.failed += 1,
                PinOutcome::Skipped => report.skipped += 1,
            }
        }
        Ok(report)
    }

    async fn pin_asset(&self, asset: Asset) -> PinOutcome {
        let asset_id = asset.asset_id;
        let claimed = match self.assets.claim(&asset_id).await {
            Ok(Some(claimed)) => claimed,
            Ok(None) => {
                debug!(asset_id = %asset_id, "asset already claimed, skipping");
                return PinOutcome::Skipped;
            }
            Err(err) => {
                error!(asset_id = %asset_id, error = %err, "failed to claim asset");
                return PinOutcome::Failed;
            }
        };

        let started = Instant::now();
        match self.run_pipeline(&claimed).await {
            Ok(pinned) => {
                info!(
                    asset_id = %asset_id,
                    cid = %pinned.cid,
                    size = pinned.size,
                    attempt = claimed.attempt_count,
                    elapsed_ms = elapsed_ms(started),
                    "asset pinned"
                );
                self.after_pin(&pinned).await;
                PinOutcome::Pinned
            }
            Err(err) => {
                error!(
                    asset_id = %asset_id,
                    attempt = claimed.attempt_count,
                    elapsed_ms = elapsed_ms(started),
                    error = %err,
                    "pin failed, asset left for the next sweep"
                );
                if let Err(err) = self.assets.release(&asset_id).await {
                    error!(asset_id = %asset_id, error = %err, "failed to release pin claim");
                }
                PinOutcome::Failed
            }
        }
    }

    async fn run_pipeline(&self, asset: &Asset) -> GatewayResult<Asset> {
        let root = self.reassembler.reassemble(&asset.asset_id).await?;
        let archive =
            archiver::build_archive(root, self.chunks.archive_path(&asset.asset_id)).await?;
        let uploaded = self.remote.upload(&archive, &self.batch_token).await;
        if let Err(err) = archive.remove().await {
            warn!(asset_id = %asset.asset_id, error = %err, "failed to remove archive");
        }
        let cid = uploaded?;
        self.assets.complete_pin(&asset.asset_id, &cid).await
    }

    /// Best-effort follow-ups once an asset is pinned.
    async fn after_pin(&self, asset: &Asset) {
        if let Err(err) = self.chunks.remove_asset(&asset.asset_id).await {
            warn!(asset_id = %asset.asset_id, error = %err, "failed to remove staging directory");
        }
        if let Err(err) = self
            .usage
            .record_usage(UsageKind::Storage, asset.user_id, usage::today(), asset.size)
            .await
        {
            warn!(
                asset_id = %asset.asset_id,
                user_id = asset.user_id,
                error = %err,
                "storage usage not recorded"
            );
        }
    }
}

/// Periodically inject a synthetic sweep signal. The first tick fires
/// immediately so assets stuck from a previous run are retried on startup.
pub fn spawn_ticker(
    queue: FinishQueue,
    interval: Duration,
    mut cancel: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval.max(Duration::from_millis(10)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        debug!("sweep ticker stopped");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    debug!("sweep tick");
                    queue.notify(FinishSignal::Sweep);
                }
            }
        }
    })
}

/// Discard queued signals; one sweep covers them all.
fn drain(rx: &mut mpsc::Receiver<FinishSignal>) -> usize {
    let mut drained = 0;
    while rx.try_recv().is_ok() {
        drained += 1;
    }
    drained
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}
