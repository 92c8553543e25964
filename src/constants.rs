/// Application constants

// Fairness
pub const DEFAULT_PUBLIC_SEED: &str =
    "000000000000000007a9a31ff7f07463d91af6b5454241d5faf282e5e0fe1b3a";
pub const INSTANT_BUST_MODULUS: u32 = 101; // 1 in 101 rounds busts at 0x
pub const HASH_SIGNIFICANT_BITS: u32 = 52;
pub const HIGH_OUTCOME_THRESHOLD: f64 = 1_000_000.0; // x100 scale
pub const HIGH_OUTCOME_TOLERANCE: f64 = 0.08;

// Round timing
pub const GROWTH_RATE_PER_MS: f64 = 0.00006;
pub const ROUND_START_DELAY_MS: i64 = 5_000;
pub const DEFAULT_TICK_WINDOW: usize = 50;
pub const FALLBACK_MICROS_PER_MS: f64 = 1_000.0;

// History windows
pub const DEFAULT_GAME_HISTORY: usize = 200;
pub const DEFAULT_CHAT_HISTORY: usize = 2_000;

// Database
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 3;
pub const DEFAULT_DATABASE_ACQUIRE_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_TX_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_TX_RETRY_BASE_MS: u64 = 50;
pub const TX_RETRY_MAX_DELAY_MS: u64 = 2_000;
pub const PG_DEADLOCK_DETECTED: &str = "40P01";
pub const PG_SERIALIZATION_FAILURE: &str = "40001";
pub const PG_UNIQUE_VIOLATION: &str = "23505";
pub const ROUNDS_PRIMARY_KEY: &str = "rounds_pkey";

// Identity cache
pub const DEFAULT_IDENTITY_CACHE_TTL_SECS: u64 = 60 * 60 * 24;
pub const DEFAULT_IDENTITY_CACHE_MAX: usize = 10_000;

// Backfill
pub const DEFAULT_BACKFILL_MAX_RETRIES: u32 = 3;
pub const DEFAULT_BACKFILL_RETRY_DELAY_MS: u64 = 2_000;
pub const DEFAULT_BACKFILL_THROTTLE_MS: u64 = 1_000;
pub const DEFAULT_BACKFILL_MAX_SPAN: i64 = 1_000;
pub const BACKFILL_HTTP_TIMEOUT_SECS: u64 = 15;

// Notification fan-out
pub const NOTIFICATION_CHANNEL_CAPACITY: usize = 256;
pub const COMMAND_CHANNEL_CAPACITY: usize = 16;

// API version
pub const API_VERSION: &str = "v1";

// WebSocket configuration
pub const WS_HEARTBEAT_INTERVAL_SECS: u64 = 30;
pub const WS_CLIENT_TIMEOUT_SECS: u64 = 60;
