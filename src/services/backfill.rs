use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::constants::BACKFILL_HTTP_TIMEOUT_SECS;
use crate::db::Database;
use crate::error::{AppError, Result};
use crate::models::RoundRecord;
use crate::transport::wire::HistoryRoundData;

/// Where finished rounds the watcher missed can be fetched from.
#[async_trait::async_trait]
pub trait RoundSource: Send + Sync {
    async fn fetch_round(&self, id: i64) -> Result<RoundRecord>;
}

/// Store side of a backfill.
#[async_trait::async_trait]
pub trait RoundArchive: Send + Sync {
    async fn missing_rounds(&self, beg: i64, end: i64) -> Result<Vec<i64>>;
    async fn put_round(&self, record: &RoundRecord) -> Result<()>;
}

#[async_trait::async_trait]
impl RoundArchive for Database {
    async fn missing_rounds(&self, beg: i64, end: i64) -> Result<Vec<i64>> {
        Database::missing_rounds(self, beg, end).await
    }

    async fn put_round(&self, record: &RoundRecord) -> Result<()> {
        Database::put_round(self, record).await
    }
}

/// Public round archive served as `{web}/game/{id}.json`.
pub struct WebRoundSource {
    client: reqwest::Client,
    base_url: String,
}

impl WebRoundSource {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(BACKFILL_HTTP_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn round_url(&self, id: i64) -> String {
        format!("{}/game/{}.json", self.base_url, id)
    }
}

#[async_trait::async_trait]
impl RoundSource for WebRoundSource {
    async fn fetch_round(&self, id: i64) -> Result<RoundRecord> {
        let url = self.round_url(id);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(AppError::ExternalAPI(format!(
                "GET {} returned {}",
                url,
                response.status()
            )));
        }
        let round: HistoryRoundData = response.json().await?;
        if round.game_id != id {
            return Err(AppError::ExternalAPI(format!(
                "GET {} returned round {}",
                url, round.game_id
            )));
        }
        Ok(round.into_record())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackfillSettings {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub throttle: Duration,
    pub max_span: i64,
}

impl BackfillSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_retries: config.backfill_max_retries,
            retry_delay: Duration::from_millis(config.backfill_retry_delay_ms),
            throttle: Duration::from_millis(config.backfill_throttle_ms),
            max_span: config.backfill_max_span.max(1),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillReport {
    pub missing: usize,
    pub imported: Vec<i64>,
    pub failed: Vec<i64>,
}

/// Imports rounds that ended while the watcher was away. At most one pass runs
/// at a time.
pub struct Backfiller {
    source: Arc<dyn RoundSource>,
    archive: Arc<dyn RoundArchive>,
    settings: BackfillSettings,
    running: AtomicBool,
}

// Internal helper that releases the running flag however the pass ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Backfiller {
    pub fn new(
        source: Arc<dyn RoundSource>,
        archive: Arc<dyn RoundArchive>,
        settings: BackfillSettings,
    ) -> Self {
        Self {
            source,
            archive,
            settings,
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Ids below `current_round` that are worth checking.
    pub fn span(&self, current_round: i64) -> Option<(i64, i64)> {
        let end = current_round - 1;
        let beg = (current_round - self.settings.max_span).max(1);
        (beg <= end).then_some((beg, end))
    }

    /// Returns `None` when a pass is already in flight.
    pub async fn run(&self, current_round: i64) -> Result<Option<BackfillReport>> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("Backfill already running; skipping round {}", current_round);
            return Ok(None);
        }
        let _guard = RunningGuard(&self.running);

        let mut report = BackfillReport::default();
        let Some((beg, end)) = self.span(current_round) else {
            return Ok(Some(report));
        };

        let missing = self.archive.missing_rounds(beg, end).await?;
        report.missing = missing.len();
        if missing.is_empty() {
            tracing::debug!("No rounds missing in {}..={}", beg, end);
            return Ok(Some(report));
        }
        tracing::info!(
            "Backfilling {} missing rounds in {}..={}",
            missing.len(),
            beg,
            end
        );

        for (i, id) in missing.into_iter().enumerate() {
            if i > 0 && !self.settings.throttle.is_zero() {
                tokio::time::sleep(self.settings.throttle).await;
            }
            match self.import(id).await {
                Ok(()) => report.imported.push(id),
                Err(e) => {
                    tracing::error!("Giving up on round {}: {}", id, e);
                    report.failed.push(id);
                }
            }
        }

        tracing::info!(
            "Backfill done: {} imported, {} failed",
            report.imported.len(),
            report.failed.len()
        );
        Ok(Some(report))
    }

    async fn import(&self, id: i64) -> Result<()> {
        let mut attempt = 0;
        loop {
            let result = match self.source.fetch_round(id).await {
                Ok(record) => self.archive.put_round(&record).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(()) => {
                    tracing::debug!("Imported round {}", id);
                    return Ok(());
                }
                Err(e) if attempt < self.settings.max_retries => {
                    attempt += 1;
                    tracing::warn!(
                        "Importing round {} failed ({}), retry {}/{}",
                        id,
                        e,
                        attempt,
                        self.settings.max_retries
                    );
                    tokio::time::sleep(self.settings.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
