#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use relaybot_platform::SecretString;
use serde::Deserialize;
use tracing::{info, warn};

/// Default config path: `~/.relaybot/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".relaybot").join("config.toml"))
}

/// Load the runtime config from TOML and env overrides.
pub fn load_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);
	sanity_fixups(&mut cfg);

	Ok(cfg)
}

/// Runtime configuration.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub store: StoreSettings,
	pub backend: BackendSettings,
	pub server: ServerSettings,
	pub sync: SyncSettings,
	pub outbox: OutboxSettings,
	pub limits: LimitSettings,
	pub bots: BotSettings,
	pub sessions: SessionSettings,
	/// Per-platform websocket endpoint overrides (platform name -> wss url).
	pub platform_ws_urls: BTreeMap<String, String>,
	pub rewards_ack_template: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct StoreSettings {
	/// Postgres URL; required unless `memory_mode`.
	pub database_url: Option<String>,
	/// Run without a database (in-memory repository, local development).
	pub memory_mode: bool,
}

#[derive(Debug, Clone)]
pub struct BackendSettings {
	/// Base URL of the main backend (token service, credits callback).
	pub base_url: String,
	/// Internal service auth header value.
	pub internal_auth: Option<SecretString>,
}

impl Default for BackendSettings {
	fn default() -> Self {
		Self {
			base_url: "http://127.0.0.1:8080".to_string(),
			internal_auth: None,
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
	/// Default reconciliation interval.
	pub interval: Duration,
	/// Per-platform interval overrides (platform name -> seconds).
	pub per_platform: BTreeMap<String, u64>,
}

impl Default for SyncSettings {
	fn default() -> Self {
		Self {
			interval: Duration::from_secs(30),
			per_platform: BTreeMap::new(),
		}
	}
}

#[derive(Debug, Clone)]
pub struct OutboxSettings {
	/// Queue-worker mode instead of the polling loop.
	pub queue_mode: bool,
	pub poll_interval: Duration,
	pub batch_size: i64,
	pub concurrency: usize,
	pub max_attempts: i32,
}

impl Default for OutboxSettings {
	fn default() -> Self {
		Self {
			queue_mode: false,
			poll_interval: Duration::from_millis(500),
			batch_size: 32,
			concurrency: 4,
			max_attempts: 5,
		}
	}
}

#[derive(Debug, Clone)]
pub struct LimitSettings {
	pub global_max: u32,
	pub global_window: Duration,
	pub channel_max: u32,
	pub channel_window: Duration,
	pub dedup_window: Duration,
	pub lock_ttl: Duration,
	pub lock_retry_delay: Duration,
}

impl Default for LimitSettings {
	fn default() -> Self {
		Self {
			global_max: 50,
			global_window: Duration::from_secs(30),
			channel_max: 5,
			channel_window: Duration::from_secs(10),
			dedup_window: Duration::from_secs(30),
			lock_ttl: Duration::from_secs(10),
			lock_retry_delay: Duration::from_millis(250),
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct BotSettings {
	/// Static access token for the shared default bot.
	pub default_access_token: Option<SecretString>,
	/// Legacy default-bot login, used when no global record exists.
	pub default_login: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
	pub reconnect_min_delay: Duration,
	pub reconnect_max_delay: Duration,
	pub command_cache_ttl: Duration,
	pub send_queue_capacity: usize,
}

impl Default for SessionSettings {
	fn default() -> Self {
		Self {
			reconnect_min_delay: Duration::from_millis(500),
			reconnect_max_delay: Duration::from_secs(30),
			command_cache_ttl: Duration::from_secs(60),
			send_queue_capacity: 64,
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	store: FileStoreSettings,

	#[serde(default)]
	backend: FileBackendSettings,

	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	sync: FileSyncSettings,

	#[serde(default)]
	outbox: FileOutboxSettings,

	#[serde(default)]
	limits: FileLimitSettings,

	#[serde(default)]
	bots: FileBotSettings,

	#[serde(default)]
	sessions: FileSessionSettings,

	#[serde(default)]
	platform_ws_urls: BTreeMap<String, String>,

	rewards_ack_template: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileStoreSettings {
	database_url: Option<String>,
	memory_mode: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileBackendSettings {
	base_url: Option<String>,
	internal_auth: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	metrics_bind: Option<String>,
	health_bind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileSyncSettings {
	interval_secs: Option<u64>,
	#[serde(default)]
	per_platform_secs: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileOutboxSettings {
	queue_mode: Option<bool>,
	poll_interval_ms: Option<u64>,
	batch_size: Option<i64>,
	concurrency: Option<usize>,
	max_attempts: Option<i32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileLimitSettings {
	global_max: Option<u32>,
	global_window_secs: Option<u64>,
	channel_max: Option<u32>,
	channel_window_secs: Option<u64>,
	dedup_window_secs: Option<u64>,
	lock_ttl_ms: Option<u64>,
	lock_retry_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileBotSettings {
	default_access_token: Option<String>,
	default_login: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileSessionSettings {
	reconnect_min_delay_ms: Option<u64>,
	reconnect_max_delay_ms: Option<u64>,
	command_cache_ttl_secs: Option<u64>,
	send_queue_capacity: Option<usize>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let defaults = ServerConfig::default();

		Self {
			store: StoreSettings {
				database_url: file.store.database_url.filter(|s| !s.trim().is_empty()),
				memory_mode: file.store.memory_mode.unwrap_or(false),
			},
			backend: BackendSettings {
				base_url: file
					.backend
					.base_url
					.filter(|s| !s.trim().is_empty())
					.unwrap_or(defaults.backend.base_url),
				internal_auth: file
					.backend
					.internal_auth
					.filter(|s| !s.trim().is_empty())
					.map(SecretString::new),
			},
			server: ServerSettings {
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				health_bind: file.server.health_bind.filter(|s| !s.trim().is_empty()),
			},
			sync: SyncSettings {
				interval: file
					.sync
					.interval_secs
					.map(Duration::from_secs)
					.unwrap_or(defaults.sync.interval),
				per_platform: file.sync.per_platform_secs,
			},
			outbox: OutboxSettings {
				queue_mode: file.outbox.queue_mode.unwrap_or(false),
				poll_interval: file
					.outbox
					.poll_interval_ms
					.map(Duration::from_millis)
					.unwrap_or(defaults.outbox.poll_interval),
				batch_size: file.outbox.batch_size.unwrap_or(defaults.outbox.batch_size),
				concurrency: file.outbox.concurrency.unwrap_or(defaults.outbox.concurrency),
				max_attempts: file.outbox.max_attempts.unwrap_or(defaults.outbox.max_attempts),
			},
			limits: LimitSettings {
				global_max: file.limits.global_max.unwrap_or(defaults.limits.global_max),
				global_window: file
					.limits
					.global_window_secs
					.map(Duration::from_secs)
					.unwrap_or(defaults.limits.global_window),
				channel_max: file.limits.channel_max.unwrap_or(defaults.limits.channel_max),
				channel_window: file
					.limits
					.channel_window_secs
					.map(Duration::from_secs)
					.unwrap_or(defaults.limits.channel_window),
				dedup_window: file
					.limits
					.dedup_window_secs
					.map(Duration::from_secs)
					.unwrap_or(defaults.limits.dedup_window),
				lock_ttl: file
					.limits
					.lock_ttl_ms
					.map(Duration::from_millis)
					.unwrap_or(defaults.limits.lock_ttl),
				lock_retry_delay: file
					.limits
					.lock_retry_delay_ms
					.map(Duration::from_millis)
					.unwrap_or(defaults.limits.lock_retry_delay),
			},
			bots: BotSettings {
				default_access_token: file
					.bots
					.default_access_token
					.filter(|s| !s.trim().is_empty())
					.map(SecretString::new),
				default_login: file.bots.default_login.filter(|s| !s.trim().is_empty()),
			},
			sessions: SessionSettings {
				reconnect_min_delay: file
					.sessions
					.reconnect_min_delay_ms
					.map(Duration::from_millis)
					.unwrap_or(defaults.sessions.reconnect_min_delay),
				reconnect_max_delay: file
					.sessions
					.reconnect_max_delay_ms
					.map(Duration::from_millis)
					.unwrap_or(defaults.sessions.reconnect_max_delay),
				command_cache_ttl: file
					.sessions
					.command_cache_ttl_secs
					.map(Duration::from_secs)
					.unwrap_or(defaults.sessions.command_cache_ttl),
				send_queue_capacity: file
					.sessions
					.send_queue_capacity
					.unwrap_or(defaults.sessions.send_queue_capacity),
			},
			platform_ws_urls: file.platform_ws_urls,
			rewards_ack_template: file.rewards_ack_template.filter(|s| !s.trim().is_empty()),
		}
	}

	/// Sync interval for one platform, honoring per-platform overrides.
	pub fn sync_interval_for(&self, platform: relaybot_domain::Platform) -> Duration {
		self.sync
			.per_platform
			.get(platform.as_str())
			.map(|secs| Duration::from_secs(*secs))
			.unwrap_or(self.sync.interval)
	}
}

fn parse_env_bool(v: &str) -> Option<bool> {
	match v.trim().to_ascii_lowercase().as_str() {
		"1" | "true" | "yes" | "on" => Some(true),
		"0" | "false" | "no" | "off" => Some(false),
		_ => None,
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Ok(v) = std::env::var("RELAYBOT_DATABASE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.store.database_url = Some(v);
			info!("store config: database_url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("RELAYBOT_MEMORY_MODE")
		&& let Some(memory) = parse_env_bool(&v)
	{
		cfg.store.memory_mode = memory;
		info!(memory_mode = memory, "store config: memory_mode overridden by env");
	}

	if let Ok(v) = std::env::var("RELAYBOT_BACKEND_BASE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.backend.base_url = v;
			info!("backend config: base_url overridden by env");
		}
	}

	if let Ok(v) = std::env::var("RELAYBOT_INTERNAL_AUTH") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.backend.internal_auth = Some(SecretString::new(v));
			info!("backend config: internal_auth overridden by env");
		}
	}

	if let Ok(v) = std::env::var("RELAYBOT_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("RELAYBOT_HEALTH_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.health_bind = Some(v);
			info!("server config: health_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("RELAYBOT_SYNC_INTERVAL_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
	{
		cfg.sync.interval = Duration::from_secs(secs);
		info!(secs, "sync config: interval overridden by env");
	}

	if let Ok(v) = std::env::var("RELAYBOT_OUTBOX_QUEUE_MODE")
		&& let Some(queue) = parse_env_bool(&v)
	{
		cfg.outbox.queue_mode = queue;
		info!(queue_mode = queue, "outbox config: queue_mode overridden by env");
	}

	if let Ok(v) = std::env::var("RELAYBOT_OUTBOX_POLL_INTERVAL_MS")
		&& let Ok(ms) = v.trim().parse::<u64>()
	{
		cfg.outbox.poll_interval = Duration::from_millis(ms);
		info!(ms, "outbox config: poll_interval overridden by env");
	}

	if let Ok(v) = std::env::var("RELAYBOT_OUTBOX_CONCURRENCY")
		&& let Ok(workers) = v.trim().parse::<usize>()
	{
		cfg.outbox.concurrency = workers;
		info!(workers, "outbox config: concurrency overridden by env");
	}

	if let Ok(v) = std::env::var("RELAYBOT_OUTBOX_MAX_ATTEMPTS")
		&& let Ok(attempts) = v.trim().parse::<i32>()
	{
		cfg.outbox.max_attempts = attempts;
		info!(attempts, "outbox config: max_attempts overridden by env");
	}

	if let Ok(v) = std::env::var("RELAYBOT_RATE_GLOBAL_MAX")
		&& let Ok(max) = v.trim().parse::<u32>()
	{
		cfg.limits.global_max = max;
		info!(max, "limit config: global_max overridden by env");
	}

	if let Ok(v) = std::env::var("RELAYBOT_RATE_GLOBAL_WINDOW_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
	{
		cfg.limits.global_window = Duration::from_secs(secs);
		info!(secs, "limit config: global_window overridden by env");
	}

	if let Ok(v) = std::env::var("RELAYBOT_RATE_CHANNEL_MAX")
		&& let Ok(max) = v.trim().parse::<u32>()
	{
		cfg.limits.channel_max = max;
		info!(max, "limit config: channel_max overridden by env");
	}

	if let Ok(v) = std::env::var("RELAYBOT_RATE_CHANNEL_WINDOW_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
	{
		cfg.limits.channel_window = Duration::from_secs(secs);
		info!(secs, "limit config: channel_window overridden by env");
	}

	if let Ok(v) = std::env::var("RELAYBOT_DEDUP_WINDOW_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
	{
		cfg.limits.dedup_window = Duration::from_secs(secs);
		info!(secs, "limit config: dedup_window overridden by env");
	}

	if let Ok(v) = std::env::var("RELAYBOT_LOCK_TTL_MS")
		&& let Ok(ms) = v.trim().parse::<u64>()
	{
		cfg.limits.lock_ttl = Duration::from_millis(ms);
		info!(ms, "limit config: lock_ttl overridden by env");
	}

	if let Ok(v) = std::env::var("RELAYBOT_LOCK_RETRY_DELAY_MS")
		&& let Ok(ms) = v.trim().parse::<u64>()
	{
		cfg.limits.lock_retry_delay = Duration::from_millis(ms);
		info!(ms, "limit config: lock_retry_delay overridden by env");
	}

	if let Ok(v) = std::env::var("RELAYBOT_DEFAULT_BOT_TOKEN") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.bots.default_access_token = Some(SecretString::new(v));
			info!("bot config: default_access_token overridden by env");
		}
	}

	if let Ok(v) = std::env::var("RELAYBOT_DEFAULT_BOT_LOGIN") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.bots.default_login = Some(v);
			info!("bot config: default_login overridden by env");
		}
	}

	if let Ok(v) = std::env::var("RELAYBOT_RECONNECT_MIN_DELAY_MS")
		&& let Ok(ms) = v.trim().parse::<u64>()
	{
		cfg.sessions.reconnect_min_delay = Duration::from_millis(ms);
		info!(ms, "session config: reconnect_min_delay overridden by env");
	}

	if let Ok(v) = std::env::var("RELAYBOT_RECONNECT_MAX_DELAY_MS")
		&& let Ok(ms) = v.trim().parse::<u64>()
	{
		cfg.sessions.reconnect_max_delay = Duration::from_millis(ms);
		info!(ms, "session config: reconnect_max_delay overridden by env");
	}
}

fn sanity_fixups(cfg: &mut ServerConfig) {
	if cfg.sessions.reconnect_min_delay > cfg.sessions.reconnect_max_delay {
		warn!(
			min_ms = cfg.sessions.reconnect_min_delay.as_millis() as u64,
			max_ms = cfg.sessions.reconnect_max_delay.as_millis() as u64,
			"session config: reconnect_min_delay > reconnect_max_delay; swapping"
		);
		std::mem::swap(
			&mut cfg.sessions.reconnect_min_delay,
			&mut cfg.sessions.reconnect_max_delay,
		);
	}

	if cfg.outbox.batch_size <= 0 {
		warn!("outbox config: batch_size must be positive; using default");
		cfg.outbox.batch_size = OutboxSettings::default().batch_size;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn from_file_picks_up_sections() {
		let raw = r#"
			rewards_ack_template = "Thanks {user}!"

			[store]
			database_url = "postgres://localhost/relaybot"

			[sync]
			interval_secs = 15

			[sync.per_platform_secs]
			trovo = 5

			[outbox]
			queue_mode = true
			concurrency = 8

			[limits]
			channel_max = 3
			channel_window_secs = 20

			[platform_ws_urls]
			trovo = "wss://example.test/chat"
		"#;
		let file: FileConfig = toml::from_str(raw).unwrap();
		let cfg = ServerConfig::from_file(file);

		assert_eq!(cfg.store.database_url.as_deref(), Some("postgres://localhost/relaybot"));
		assert_eq!(cfg.sync.interval, Duration::from_secs(15));
		assert_eq!(
			cfg.sync_interval_for(relaybot_domain::Platform::Trovo),
			Duration::from_secs(5)
		);
		assert_eq!(
			cfg.sync_interval_for(relaybot_domain::Platform::Twitch),
			Duration::from_secs(15)
		);
		assert!(cfg.outbox.queue_mode);
		assert_eq!(cfg.outbox.concurrency, 8);
		assert_eq!(cfg.limits.channel_max, 3);
		assert_eq!(cfg.limits.channel_window, Duration::from_secs(20));
		assert_eq!(
			cfg.platform_ws_urls.get("trovo").map(String::as_str),
			Some("wss://example.test/chat")
		);
		assert_eq!(cfg.rewards_ack_template.as_deref(), Some("Thanks {user}!"));
	}

	#[test]
	fn swapped_reconnect_delays_are_fixed() {
		let mut cfg = ServerConfig::default();
		cfg.sessions.reconnect_min_delay = Duration::from_secs(60);
		cfg.sessions.reconnect_max_delay = Duration::from_secs(1);
		sanity_fixups(&mut cfg);
		assert!(cfg.sessions.reconnect_min_delay <= cfg.sessions.reconnect_max_delay);
	}

	#[test]
	fn env_bool_parsing() {
		assert_eq!(parse_env_bool("1"), Some(true));
		assert_eq!(parse_env_bool("Off"), Some(false));
		assert_eq!(parse_env_bool("maybe"), None);
	}
}
