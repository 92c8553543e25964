pub mod cache;
pub mod retry;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use sqlx::{postgres::PgPoolOptions, Connection, FromRow, PgConnection, PgPool};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

use crate::{
    config::Config,
    constants::ROUNDS_PRIMARY_KEY,
    error::{AppError, Result},
    models::{identity::is_valid_username, *},
};
use cache::TtlCache;
use retry::{retrying, RetryPolicy};

static TX_SEQ: AtomicU64 = AtomicU64::new(0);

/// Pooled Postgres gateway: retrying transactions plus a read-through
/// identity cache.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
    retry: RetryPolicy,
    identities: Arc<Mutex<TtlCache<String, Identity>>>,
}

#[derive(FromRow)]
struct RoundRow {
    id: i64,
    crash_point: i64,
    secret: String,
    created: DateTime<Utc>,
    started: DateTime<Utc>,
    forced: bool,
}

#[derive(FromRow)]
struct WagerRow {
    round_id: i64,
    username: String,
    bet: Option<i64>,
    stopped_at: Option<i64>,
    bonus: Option<i64>,
    joined: Option<DateTime<Utc>>,
}

#[derive(FromRow)]
struct SayRow {
    created: DateTime<Utc>,
    username: String,
    message: String,
    channel: String,
    is_bot: bool,
}

#[derive(FromRow)]
struct MuteRow {
    created: DateTime<Utc>,
    username: String,
    moderator: String,
    timespec: String,
    shadow: bool,
}

#[derive(FromRow)]
struct UnmuteRow {
    created: DateTime<Utc>,
    username: String,
    moderator: String,
    shadow: bool,
}

impl Database {
    pub async fn new(config: &Config) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .acquire_timeout(config.acquire_timeout())
            .connect(&config.database_url)
            .await?;

        Ok(Self {
            pool,
            retry: RetryPolicy::from_config(config),
            identities: Arc::new(Mutex::new(TtlCache::new(
                config.identity_cache_ttl(),
                config.identity_cache_max,
            ))),
        })
    }

    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        // Path is relative to the crate root.
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Pool that only connects on first use.
    #[cfg(test)]
    pub(crate) fn lazy(config: &Config) -> Self {
        Self {
            pool: PgPoolOptions::new()
                .max_connections(1)
                .acquire_timeout(config.acquire_timeout())
                .connect_lazy(&config.database_url)
                .expect("valid database url"),
            retry: RetryPolicy::from_config(config),
            identities: Arc::new(Mutex::new(TtlCache::new(
                config.identity_cache_ttl(),
                config.identity_cache_max,
            ))),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Waits for checked-out connections to return, then closes the pool.
    pub async fn close(&self) {
        self.identities.lock().await.clear();
        self.pool.close().await;
        tracing::info!("Database pool closed");
    }
}

// ==================== TRANSACTIONS ====================
impl Database {
    /// Runs `work` between BEGIN and COMMIT on one pooled connection. On a
    /// deadlock or serialization failure the whole unit is re-run on a fresh
    /// connection, up to the configured attempts.
    pub async fn transaction<T, F>(&self, label: &str, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: for<'c> FnMut(&'c mut PgConnection) -> BoxFuture<'c, Result<T>> + Send,
    {
        let mut state = (self.clone(), work);
        retrying(self.retry, label, &mut state, |(db, work), attempt| {
            Box::pin(db.run_transaction_once(work, attempt))
        })
        .await
    }

    // Internal helper that runs a single transaction attempt.
    async fn run_transaction_once<T, F>(&self, work: &mut F, attempt: u32) -> Result<T>
    where
        T: Send + 'static,
        F: for<'c> FnMut(&'c mut PgConnection) -> BoxFuture<'c, Result<T>> + Send,
    {
        let txid = TX_SEQ.fetch_add(1, Ordering::Relaxed);
        let mut conn = self.pool.acquire().await?;

        tracing::trace!("[{}] Starting transaction (attempt {})", txid, attempt);
        sqlx::query("BEGIN").execute(&mut *conn).await?;

        match work(&mut *conn).await {
            Ok(value) => {
                sqlx::query("COMMIT").execute(&mut *conn).await?;
                tracing::trace!("[{}] Committed transaction", txid);
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = sqlx::query("ROLLBACK").execute(&mut *conn).await {
                    tracing::error!(
                        "[{}] Rollback failed, removing connection from pool: {}",
                        txid,
                        rollback_err
                    );
                    if let Err(close_err) = conn.detach().close().await {
                        tracing::debug!("[{}] Closing broken connection: {}", txid, close_err);
                    }
                }
                Err(err)
            }
        }
    }
}

// ==================== IDENTITY QUERIES ====================
impl Database {
    /// Resolves a display name to its identity, creating it on first sight.
    pub async fn identity(&self, username: &str) -> Result<Identity> {
        if !is_valid_username(username) {
            return Err(AppError::BadRequest(format!("Invalid username: {username:?}")));
        }
        let key = username.to_lowercase();
        if let Some(found) = self.identities.lock().await.get(&key, Instant::now()) {
            return Ok(found);
        }

        let name = username.to_string();
        let identity = self
            .transaction("get_or_create_identity", move |conn| {
                let name = name.clone();
                Box::pin(async move { get_or_create_identity(conn, &name).await })
            })
            .await?;

        self.identities
            .lock()
            .await
            .insert(key, identity.clone(), Instant::now());
        Ok(identity)
    }

    // Internal helper that resolves every name of a round before its transaction.
    async fn identities_for<'a, I>(&self, usernames: I) -> Result<HashMap<String, i64>>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let mut ids = HashMap::new();
        for username in usernames {
            let identity = self.identity(username).await?;
            ids.insert(username.clone(), identity.id);
        }
        Ok(ids)
    }
}

// Internal helper that selects, then inserts, then re-selects if a concurrent
// first sighting won the race.
async fn get_or_create_identity(conn: &mut PgConnection, username: &str) -> Result<Identity> {
    let select = "SELECT id, username FROM identities WHERE lower(username) = lower($1)";

    if let Some(existing) = sqlx::query_as::<_, Identity>(select)
        .bind(username)
        .fetch_optional(&mut *conn)
        .await?
    {
        return Ok(existing);
    }

    let inserted = sqlx::query_as::<_, Identity>(
        "INSERT INTO identities (username) VALUES ($1)
         ON CONFLICT DO NOTHING
         RETURNING id, username",
    )
    .bind(username)
    .fetch_optional(&mut *conn)
    .await?;

    match inserted {
        Some(identity) => {
            tracing::debug!("Created identity #{} for {}", identity.id, username);
            Ok(identity)
        }
        None => Ok(sqlx::query_as::<_, Identity>(select)
            .bind(username)
            .fetch_one(&mut *conn)
            .await?),
    }
}

// ==================== ROUND QUERIES ====================
impl Database {
    /// Records a finalized round and its wagers once. A second insert of the
    /// same round id is a no-op.
    pub async fn put_round(&self, record: &RoundRecord) -> Result<()> {
        let ids = Arc::new(self.identities_for(record.players.keys()).await?);
        let record = Arc::new(record.clone());
        let round_id = record.id;

        let result = self
            .transaction("put_round", move |conn| {
                let record = Arc::clone(&record);
                let ids = Arc::clone(&ids);
                Box::pin(async move { insert_round(conn, &record, &ids).await })
            })
            .await;

        match result {
            Ok(()) => {
                tracing::debug!("Recorded round #{}", round_id);
                Ok(())
            }
            Err(err) if err.violates(ROUNDS_PRIMARY_KEY) => {
                tracing::debug!("Round #{} already recorded", round_id);
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// The `limit` most recent rounds in ascending id order.
    pub async fn last_rounds(&self, limit: i64) -> Result<Vec<RoundRecord>> {
        let rows = sqlx::query_as::<_, RoundRow>(
            "SELECT * FROM (
                SELECT id, crash_point, secret, created, started, forced
                FROM rounds ORDER BY id DESC LIMIT $1) t
             ORDER BY id",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
        let wagers = sqlx::query_as::<_, WagerRow>(
            "SELECT w.round_id, i.username, w.bet, w.stopped_at, w.bonus, w.joined
             FROM wagers w JOIN identities i ON w.identity_id = i.id
             WHERE w.round_id = ANY($1)",
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let mut players: HashMap<i64, BTreeMap<String, Wager>> = HashMap::new();
        for row in wagers {
            let wager = Wager {
                identity: row.username.clone(),
                bet: row.bet,
                stopped_at: row.stopped_at,
                bonus: row.bonus,
                joined_at: row.joined,
            };
            players
                .entry(row.round_id)
                .or_default()
                .insert(row.username, wager);
        }

        Ok(rows
            .into_iter()
            .map(|row| RoundRecord {
                players: players.remove(&row.id).unwrap_or_default(),
                id: row.id,
                crash_point: row.crash_point,
                secret: row.secret,
                created: row.created,
                started: row.started,
                forced: row.forced,
                verified: None,
            })
            .collect())
    }

    /// Ids in `[beg, end]` that have no recorded round.
    pub async fn missing_rounds(&self, beg: i64, end: i64) -> Result<Vec<i64>> {
        let ids = sqlx::query_scalar::<_, i64>(
            "SELECT s.id
             FROM generate_series($1::BIGINT, $2::BIGINT) AS s(id)
             LEFT JOIN rounds r ON r.id = s.id
             WHERE r.id IS NULL
             ORDER BY s.id",
        )
        .bind(beg)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }
}

// Internal helper that writes a round row and its wager rows.
async fn insert_round(
    conn: &mut PgConnection,
    record: &RoundRecord,
    ids: &HashMap<String, i64>,
) -> Result<()> {
    let totals = record.totals();
    sqlx::query(
        "INSERT INTO rounds
            (id, crash_point, secret, created, started, forced,
             wagered, cashed_out, bonused, participants)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
    )
    .bind(record.id)
    .bind(record.crash_point)
    .bind(&record.secret)
    .bind(record.created)
    .bind(record.started)
    .bind(record.forced)
    .bind(totals.wagered)
    .bind(totals.cashed_out)
    .bind(totals.bonused)
    .bind(totals.participants)
    .execute(&mut *conn)
    .await?;

    for (username, wager) in &record.players {
        let identity_id = ids.get(username).copied().ok_or_else(|| {
            AppError::Internal(format!("Identity for {username} was not resolved"))
        })?;
        tracing::trace!("Inserting wager of {} in round #{}", username, record.id);
        sqlx::query(
            "INSERT INTO wagers
                (round_id, identity_id, bet, stopped_at, cash_out, bonus, joined)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(record.id)
        .bind(identity_id)
        .bind(wager.bet)
        .bind(wager.stopped_at)
        .bind(wager.cash_out_amount())
        .bind(wager.bonus)
        .bind(wager.joined_at)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

// ==================== CHAT QUERIES ====================
impl Database {
    /// Stores say/mute/unmute events. Info and error lines are local only.
    pub async fn put_chat_event(&self, event: &ChatEvent) -> Result<()> {
        match &event.kind {
            ChatKind::Say {
                message,
                channel,
                bot,
            } => {
                let user = self.identity(&event.username).await?;
                sqlx::query(
                    "INSERT INTO chats (identity_id, channel, message, is_bot, created)
                     VALUES ($1, $2, $3, $4, $5)",
                )
                .bind(user.id)
                .bind(channel)
                .bind(message)
                .bind(bot)
                .bind(event.created)
                .execute(&self.pool)
                .await?;
            }
            ChatKind::Mute {
                moderator,
                timespec,
                shadow,
            } => {
                let user = self.identity(&event.username).await?;
                let moderator = self.identity(moderator).await?;
                sqlx::query(
                    "INSERT INTO mutes (identity_id, moderator_id, timespec, shadow, created)
                     VALUES ($1, $2, $3, $4, $5)",
                )
                .bind(user.id)
                .bind(moderator.id)
                .bind(timespec)
                .bind(shadow)
                .bind(event.created)
                .execute(&self.pool)
                .await?;
            }
            ChatKind::Unmute { moderator, shadow } => {
                let user = self.identity(&event.username).await?;
                let moderator = self.identity(moderator).await?;
                sqlx::query(
                    "INSERT INTO unmutes (identity_id, moderator_id, shadow, created)
                     VALUES ($1, $2, $3, $4)",
                )
                .bind(user.id)
                .bind(moderator.id)
                .bind(shadow)
                .bind(event.created)
                .execute(&self.pool)
                .await?;
            }
            ChatKind::Info { .. } | ChatKind::Error { .. } => {}
        }
        Ok(())
    }

    /// Up to `limit` of each chat/mute/unmute, merged in ascending time.
    pub async fn last_chat(&self, limit: i64) -> Result<Vec<ChatEvent>> {
        let says = sqlx::query_as::<_, SayRow>(
            "SELECT c.created, i.username, c.message, c.channel, c.is_bot
             FROM chats c JOIN identities i ON c.identity_id = i.id
             ORDER BY c.created DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mutes = sqlx::query_as::<_, MuteRow>(
            "SELECT m.created, u.username, o.username AS moderator, m.timespec, m.shadow
             FROM mutes m
               JOIN identities u ON m.identity_id = u.id
               JOIN identities o ON m.moderator_id = o.id
             ORDER BY m.created DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let unmutes = sqlx::query_as::<_, UnmuteRow>(
            "SELECT m.created, u.username, o.username AS moderator, m.shadow
             FROM unmutes m
               JOIN identities u ON m.identity_id = u.id
               JOIN identities o ON m.moderator_id = o.id
             ORDER BY m.created DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut events: Vec<ChatEvent> = says
            .into_iter()
            .map(|row| ChatEvent {
                username: row.username,
                created: row.created,
                kind: ChatKind::Say {
                    message: row.message,
                    channel: row.channel,
                    bot: row.is_bot,
                },
            })
            .chain(mutes.into_iter().map(|row| ChatEvent {
                username: row.username,
                created: row.created,
                kind: ChatKind::Mute {
                    moderator: row.moderator,
                    timespec: row.timespec,
                    shadow: row.shadow,
                },
            }))
            .chain(unmutes.into_iter().map(|row| ChatEvent {
                username: row.username,
                created: row.created,
                kind: ChatKind::Unmute {
                    moderator: row.moderator,
                    shadow: row.shadow,
                },
            }))
            .collect();
        events.sort_by_key(|event| event.created);
        Ok(events)
    }
}

// ==================== BLOCK QUERIES ====================
impl Database {
    /// Returns false when the height was already recorded.
    pub async fn put_block(&self, height: i64, hash: &str) -> Result<bool> {
        let result = sqlx::query("INSERT INTO blocks (height, hash) VALUES ($1, $2)")
            .bind(height)
            .bind(hash)
            .execute(&self.pool)
            .await
            .map_err(AppError::from);

        match result {
            Ok(_) => Ok(true),
            Err(err) if err.is_unique_violation() => {
                tracing::debug!("Block {} already recorded", height);
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    pub async fn latest_block(&self) -> Result<Option<Block>> {
        let block = sqlx::query_as::<_, Block>(
            "SELECT height, hash, confirmed, notified FROM blocks ORDER BY height DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(block)
    }

    /// Returns false when the identity was already waiting on that channel.
    pub async fn put_block_notification(&self, username: &str, channel: &str) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO block_notifications (username, channel) VALUES ($1, $2)",
        )
        .bind(username)
        .bind(channel)
        .execute(&self.pool)
        .await
        .map_err(AppError::from);

        match result {
            Ok(_) => Ok(true),
            Err(err) if err.is_unique_violation() => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub async fn clear_block_notifications(&self) -> Result<()> {
        sqlx::query("DELETE FROM block_notifications")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Waiting identities grouped by channel.
    pub async fn block_notifications(&self) -> Result<HashMap<String, Vec<String>>> {
        let rows = sqlx::query_as::<_, (String, Vec<String>)>(
            "SELECT channel, array_agg(username ORDER BY created) AS users
             FROM block_notifications GROUP BY channel",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }
}
