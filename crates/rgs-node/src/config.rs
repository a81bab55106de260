//! Process-wide configuration (§6 "Configuration surface"), loaded once
//! from environment variables at startup. Deliberately not a layered
//! config/figment loader — one flat struct, one place that reads `env::var`.

use std::path::PathBuf;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use rgs_changecontrol::ChangeControlConfig;
use rgs_guard::GuardConfig;
use rgs_identity::IdentityConfig;
use rgs_ingestion::IngestionConfig;
use rgs_keyset::KeysetSourceConfig;
use rgs_ledger::LedgerConfig;

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env_string(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match env_string(key) {
        Some(v) => matches!(v.as_str(), "1" | "true" | "TRUE" | "yes"),
        None => default,
    }
}

fn env_csv(key: &str) -> Vec<String> {
    env_string(key).map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect()).unwrap_or_default()
}

/// Everything startup needs to build the subsystem services and transports.
pub struct RgsConfig {
    pub strict_production: bool,
    pub data_dir: PathBuf,
    pub rest_addr: std::net::SocketAddr,
    pub rpc_addr: std::net::SocketAddr,
    pub trusted_cidrs: Vec<String>,
    pub keyset: KeysetSourceConfig,
    pub keyset_reload_interval: Duration,
    pub identity: IdentityConfig,
    pub ledger: LedgerConfig,
    pub guard: GuardConfig,
    pub changecontrol: ChangeControlConfig,
    pub ingestion: IngestionConfig,
}

impl RgsConfig {
    /// Load from the process environment, falling back to development
    /// defaults everywhere `strict_production` permits it.
    pub fn from_env() -> Self {
        let strict_production = env_bool("RGS_STRICT_PRODUCTION", false);

        let keyset = KeysetSourceConfig {
            file: env_string("RGS_KEYSET_FILE").map(PathBuf::from),
            command: env_string("RGS_KEYSET_COMMAND"),
            inline: env_string("RGS_KEYSET_INLINE"),
        };

        let mut identity = IdentityConfig::default();
        identity.lockout_threshold = env_parse("RGS_LOGIN_LOCKOUT_THRESHOLD", identity.lockout_threshold);
        identity.lockout_ttl = ChronoDuration::seconds(env_parse("RGS_LOGIN_LOCKOUT_TTL_SECS", identity.lockout_ttl.num_seconds()));
        identity.rate_limit_max = env_parse("RGS_LOGIN_RATE_LIMIT_MAX", identity.rate_limit_max);
        identity.rate_limit_window =
            ChronoDuration::seconds(env_parse("RGS_LOGIN_RATE_LIMIT_WINDOW_SECS", identity.rate_limit_window.num_seconds()));
        identity.access_token_ttl = ChronoDuration::seconds(env_parse("RGS_ACCESS_TTL_SECS", identity.access_token_ttl.num_seconds()));
        identity.refresh_token_ttl = ChronoDuration::seconds(env_parse("RGS_REFRESH_TTL_SECS", identity.refresh_token_ttl.num_seconds()));
        identity.session_sweep_interval =
            Duration::from_secs(env_parse("RGS_SESSION_CLEANUP_INTERVAL_SECS", identity.session_sweep_interval.as_secs()));
        identity.session_sweep_batch = env_parse("RGS_SESSION_CLEANUP_BATCH", identity.session_sweep_batch);

        let mut ledger = LedgerConfig::default();
        ledger.eft_lockout_threshold = env_parse("RGS_EFT_FRAUD_THRESHOLD", ledger.eft_lockout_threshold);
        ledger.eft_lockout_ttl = ChronoDuration::seconds(env_parse("RGS_EFT_FRAUD_TTL_SECS", ledger.eft_lockout_ttl.num_seconds()));
        ledger.idempotency_envelope_ttl =
            ChronoDuration::seconds(env_parse("RGS_IDEMPOTENCY_TTL_SECS", ledger.idempotency_envelope_ttl.num_seconds()));
        ledger.idempotency_cleanup_interval =
            Duration::from_secs(env_parse("RGS_IDEMPOTENCY_CLEANUP_INTERVAL_SECS", ledger.idempotency_cleanup_interval.as_secs()));
        ledger.idempotency_cleanup_batch = env_parse("RGS_IDEMPOTENCY_CLEANUP_BATCH", ledger.idempotency_cleanup_batch);

        let mut guard = GuardConfig::default();
        guard.max_memory_activity_entries = if strict_production { None } else { guard.max_memory_activity_entries };

        let changecontrol =
            ChangeControlConfig { require_separation_of_duties: env_bool("RGS_REQUIRE_SEPARATION_OF_DUTIES", true) };

        let ingestion =
            IngestionConfig { buffer_capacity: env_parse("RGS_INGESTION_BUFFER_CAPACITY", IngestionConfig::default().buffer_capacity) };

        Self {
            strict_production,
            data_dir: env_string("RGS_DATA_DIR").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("./rgs-data")),
            rest_addr: env_parse("RGS_REST_ADDR", "127.0.0.1:8080".parse().unwrap()),
            rpc_addr: env_parse("RGS_RPC_ADDR", "127.0.0.1:8645".parse().unwrap()),
            trusted_cidrs: env_csv("RGS_TRUSTED_CIDRS"),
            keyset,
            keyset_reload_interval: Duration::from_secs(env_parse("RGS_KEYSET_RELOAD_INTERVAL_SECS", 60)),
            identity,
            ledger,
            guard,
            changecontrol,
            ingestion,
        }
    }
}
