use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::pipeline::IngestionPipeline;
use crate::config::ChainConfig;
use crate::error::IndexerError;

const INITIAL_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct WatcherSettings {
    /// First block to ingest when nothing has been indexed yet.
    pub start_block: u64,
    pub batch_size: u64,
    pub poll_interval: Duration,
    pub confirmations: u64,
    pub max_backoff: Duration,
}

impl From<&ChainConfig> for WatcherSettings {
    fn from(config: &ChainConfig) -> Self {
        Self {
            start_block: config.start_block,
            batch_size: config.batch_size,
            poll_interval: config.poll_interval(),
            confirmations: config.confirmations,
            max_backoff: config.max_backoff(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum WatcherStatus {
    Stopped,
    Running,
    /// The loop exited on a fatal error and needs an operator.
    Halted { reason: String },
}

struct RunningWatcher {
    shutdown: CancellationToken,
    handle: JoinHandle<Result<(), IndexerError>>,
    halt_reason: Arc<std::sync::Mutex<Option<String>>>,
}

/// Follows the chain head in a background task, one range at a time.
pub struct LiveWatcher {
    pipeline: Arc<IngestionPipeline>,
    settings: WatcherSettings,
    task: Mutex<Option<RunningWatcher>>,
}

impl LiveWatcher {
    pub fn new(pipeline: Arc<IngestionPipeline>, settings: WatcherSettings) -> Self {
        Self {
            pipeline,
            settings,
            task: Mutex::new(None),
        }
    }

    /// Spawn the watch loop. Returns `false` if it is already running.
    /// A halted loop is replaced.
    pub async fn start(&self) -> bool {
        let mut task = self.task.lock().await;
        if let Some(running) = task.as_ref() {
            if !running.handle.is_finished() {
                return false;
            }
        }

        let shutdown = CancellationToken::new();
        let halt_reason = Arc::new(std::sync::Mutex::new(None));
        let handle = tokio::spawn(run_watch_loop(
            self.pipeline.clone(),
            self.settings.clone(),
            shutdown.clone(),
            halt_reason.clone(),
        ));

        *task = Some(RunningWatcher {
            shutdown,
            handle,
            halt_reason,
        });
        true
    }

    /// Cancel the loop and wait for any in-flight range to finish.
    ///
    /// Returns the fatal error the loop halted on, if any.
    pub async fn stop(&self) -> Result<(), IndexerError> {
        let Some(running) = self.task.lock().await.take() else {
            return Ok(());
        };

        running.shutdown.cancel();
        match running.handle.await {
            Ok(result) => result,
            Err(e) => Err(IndexerError::WatcherTask(e.to_string())),
        }
    }

    pub async fn status(&self) -> WatcherStatus {
        let task = self.task.lock().await;
        match task.as_ref() {
            None => WatcherStatus::Stopped,
            Some(running) if !running.handle.is_finished() => WatcherStatus::Running,
            Some(running) => match running.halt_reason.lock() {
                Ok(reason) => match reason.as_ref() {
                    Some(reason) => WatcherStatus::Halted {
                        reason: reason.clone(),
                    },
                    None => WatcherStatus::Stopped,
                },
                Err(_) => WatcherStatus::Halted {
                    reason: "watcher state poisoned".into(),
                },
            },
        }
    }

    pub async fn is_running(&self) -> bool {
        self.status().await == WatcherStatus::Running
    }

    pub async fn current_watermark(&self) -> Result<Option<u64>, IndexerError> {
        self.pipeline.current_watermark().await
    }
}

enum Progress {
    CaughtUp,
    Behind,
}

async fn run_watch_loop(
    pipeline: Arc<IngestionPipeline>,
    settings: WatcherSettings,
    shutdown: CancellationToken,
    halt_reason: Arc<std::sync::Mutex<Option<String>>>,
) -> Result<(), IndexerError> {
    let initial_backoff = INITIAL_BACKOFF.min(settings.max_backoff);
    let mut backoff = initial_backoff;

    tracing::info!(
        batch_size = settings.batch_size,
        confirmations = settings.confirmations,
        poll_interval_ms = settings.poll_interval.as_millis() as u64,
        "Live watcher started"
    );

    while !shutdown.is_cancelled() {
        let pause = match poll_once(&pipeline, &settings).await {
            Ok(Progress::Behind) => {
                backoff = initial_backoff;
                continue;
            }
            Ok(Progress::CaughtUp) => {
                backoff = initial_backoff;
                settings.poll_interval
            }
            Err(e) if e.is_transient() => {
                tracing::warn!(
                    error = %e,
                    delay_ms = backoff.as_millis() as u64,
                    "Transient failure, retrying"
                );
                let delay = backoff;
                backoff = (backoff * 2).min(settings.max_backoff);
                delay
            }
            Err(e) => {
                tracing::error!(error = %e, "Live watcher halted on fatal error");
                if let Ok(mut reason) = halt_reason.lock() {
                    *reason = Some(e.to_string());
                }
                return Err(e);
            }
        };

        tokio::select! {
            _ = tokio::time::sleep(pause) => {}
            _ = shutdown.cancelled() => {
                tracing::info!("Shutdown received, stopping live watcher");
            }
        }
    }

    tracing::info!("Live watcher stopped");
    Ok(())
}

async fn poll_once(
    pipeline: &IngestionPipeline,
    settings: &WatcherSettings,
) -> Result<Progress, IndexerError> {
    let head = pipeline.source().chain_head().await?;
    let safe_head = head.saturating_sub(settings.confirmations);

    let next = match pipeline.current_watermark().await? {
        Some(watermark) => watermark + 1,
        None => settings.start_block,
    };
    if next > safe_head {
        return Ok(Progress::CaughtUp);
    }

    let to = next
        .saturating_add(settings.batch_size.max(1) - 1)
        .min(safe_head);
    let report = pipeline.ingest_range(next, to).await?;

    if report.to >= safe_head {
        Ok(Progress::CaughtUp)
    } else {
        Ok(Progress::Behind)
    }
}
