#![forbid(unsafe_code)]

//! Access-token resolution for the shared default bot and per-channel
//! override bots.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use relaybot_domain::BotAccountId;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::SecretString;

/// Token issued by the OAuth service.
#[derive(Debug, Clone)]
pub struct IssuedToken {
	pub access_token: SecretString,
	pub expires_in: Option<Duration>,
}

/// OAuth token service interface (issuance and storage live elsewhere).
#[async_trait]
pub trait TokenService: Send + Sync {
	/// Current access token for a bot account.
	async fn fetch_token(&self, account: &BotAccountId) -> anyhow::Result<IssuedToken>;

	/// Force-refresh the access token for a bot account.
	async fn refresh_token(&self, account: &BotAccountId) -> anyhow::Result<IssuedToken>;

	/// Globally stored default-bot record, if one exists.
	async fn fetch_default_bot(&self) -> anyhow::Result<Option<IssuedToken>>;

	/// Legacy path: resolve a bot by login when no global record exists.
	async fn fetch_by_login(&self, login: &str) -> anyhow::Result<IssuedToken>;
}

/// HTTP implementation talking to the backend OAuth service.
pub struct HttpTokenService {
	base_url: String,
	internal_auth: SecretString,
	client: reqwest::Client,
}

#[derive(Debug, serde::Deserialize)]
struct TokenResponse {
	access_token: String,
	#[serde(default)]
	expires_in: Option<u64>,
}

impl HttpTokenService {
	pub fn new(base_url: impl Into<String>, internal_auth: SecretString) -> anyhow::Result<Self> {
		let client = reqwest::Client::builder()
			.user_agent("relaybot/0.x (token-resolver)")
			.timeout(Duration::from_secs(10))
			.build()
			.context("build reqwest client")?;

		Ok(Self {
			base_url: base_url.into(),
			internal_auth,
			client,
		})
	}

	async fn request_token(&self, path: &str, refresh: bool) -> anyhow::Result<TokenResponse> {
		let url = format!("{}{}", self.base_url.trim_end_matches('/'), path);
		let builder = if refresh {
			self.client.post(url)
		} else {
			self.client.get(url)
		};

		let resp = builder
			.header("X-Internal-Auth", self.internal_auth.expose())
			.send()
			.await
			.with_context(|| format!("token request {path}"))?;

		let status = resp.status();
		let body = resp.text().await.context("token response read body")?;

		if !status.is_success() {
			anyhow::bail!("token request {path} failed: status={status} body={body}");
		}

		serde_json::from_str(&body).context("token response parse json")
	}
}

fn issued_from(resp: TokenResponse) -> IssuedToken {
	IssuedToken {
		access_token: SecretString::new(resp.access_token),
		expires_in: resp.expires_in.map(Duration::from_secs),
	}
}

#[async_trait]
impl TokenService for HttpTokenService {
	async fn fetch_token(&self, account: &BotAccountId) -> anyhow::Result<IssuedToken> {
		let resp = self
			.request_token(&format!("/internal/bots/{}/token", account.as_str()), false)
			.await?;
		Ok(issued_from(resp))
	}

	async fn refresh_token(&self, account: &BotAccountId) -> anyhow::Result<IssuedToken> {
		let resp = self
			.request_token(&format!("/internal/bots/{}/token/refresh", account.as_str()), true)
			.await?;
		Ok(issued_from(resp))
	}

	async fn fetch_default_bot(&self) -> anyhow::Result<Option<IssuedToken>> {
		match self.request_token("/internal/bots/default/token", false).await {
			Ok(resp) => Ok(Some(issued_from(resp))),
			Err(e) if e.to_string().contains("status=404") => Ok(None),
			Err(e) => Err(e),
		}
	}

	async fn fetch_by_login(&self, login: &str) -> anyhow::Result<IssuedToken> {
		let resp = self
			.request_token(&format!("/internal/bots/by-login/{login}/token"), false)
			.await?;
		Ok(issued_from(resp))
	}
}

#[derive(Debug, Clone)]
struct CachedToken {
	access_token: SecretString,
	expires_at: Option<SystemTime>,
}

impl CachedToken {
	fn from_issued(token: IssuedToken) -> Self {
		Self {
			access_token: token.access_token,
			expires_at: token.expires_in.and_then(|d| SystemTime::now().checked_add(d)),
		}
	}

	fn is_fresh(&self, buffer: Duration) -> bool {
		match self.expires_at {
			Some(deadline) => match SystemTime::now().checked_add(buffer) {
				Some(next) => next < deadline,
				None => false,
			},
			None => true,
		}
	}
}

/// Cache key for the shared default bot.
const DEFAULT_SCOPE: &str = "\u{0}default";

/// Minimum spacing between refresh attempts for one account.
const REFRESH_RETRY_FLOOR: Duration = Duration::from_secs(30);

/// Resolves the correct access token per channel, refreshing on auth errors.
pub struct TokenResolver {
	service: Arc<dyn TokenService>,

	/// Static default-bot credentials from configuration, if provided.
	static_default: Option<SecretString>,

	/// Legacy default-bot login used when no global record exists.
	default_bot_login: Option<String>,

	refresh_buffer: Duration,

	cache: Mutex<HashMap<String, CachedToken>>,
	last_refresh_attempt: Mutex<HashMap<String, Instant>>,
}

impl TokenResolver {
	pub fn new(service: Arc<dyn TokenService>) -> Self {
		Self {
			service,
			static_default: None,
			default_bot_login: None,
			refresh_buffer: Duration::from_secs(60),
			cache: Mutex::new(HashMap::new()),
			last_refresh_attempt: Mutex::new(HashMap::new()),
		}
	}

	/// Use configured credentials for the shared default bot.
	pub fn with_static_default(mut self, access_token: SecretString) -> Self {
		self.static_default = Some(access_token);
		self
	}

	/// Legacy fallback login for the default bot.
	pub fn with_default_bot_login(mut self, login: impl Into<String>) -> Self {
		self.default_bot_login = Some(login.into());
		self
	}

	pub fn with_refresh_buffer(mut self, buffer: Duration) -> Self {
		self.refresh_buffer = buffer;
		self
	}

	fn scope_key(override_bot: Option<&BotAccountId>) -> String {
		match override_bot {
			Some(account) => account.as_str().to_string(),
			None => DEFAULT_SCOPE.to_string(),
		}
	}

	/// Resolve a currently valid access token for a channel's bot identity.
	///
	/// `None` means the shared default bot.
	pub async fn resolve(&self, override_bot: Option<&BotAccountId>) -> anyhow::Result<SecretString> {
		let key = Self::scope_key(override_bot);

		{
			let cache = self.cache.lock().await;
			if let Some(cached) = cache.get(&key)
				&& cached.is_fresh(self.refresh_buffer)
			{
				return Ok(cached.access_token.clone());
			}
		}

		let issued = match override_bot {
			Some(account) => self.service.fetch_token(account).await?,
			None => self.resolve_default().await?,
		};

		let cached = CachedToken::from_issued(issued);
		let token = cached.access_token.clone();
		self.cache.lock().await.insert(key, cached);
		Ok(token)
	}

	async fn resolve_default(&self) -> anyhow::Result<IssuedToken> {
		if let Some(token) = &self.static_default {
			return Ok(IssuedToken {
				access_token: token.clone(),
				expires_in: None,
			});
		}

		if let Some(token) = self.service.fetch_default_bot().await? {
			return Ok(token);
		}

		let Some(login) = self.default_bot_login.as_deref() else {
			return Err(anyhow!("no default bot credentials and no legacy bot login configured"));
		};

		debug!(login, "no global default bot record; using legacy login resolution");
		self.service.fetch_by_login(login).await
	}

	/// React to an auth rejection: attempt exactly one refresh before the
	/// next reconnect. Returns whether a refresh succeeded; either way the
	/// reconnect stays scheduled.
	pub async fn handle_auth_error(&self, override_bot: Option<&BotAccountId>) -> bool {
		let key = Self::scope_key(override_bot);

		{
			let mut attempts = self.last_refresh_attempt.lock().await;
			if let Some(last) = attempts.get(&key)
				&& last.elapsed() < REFRESH_RETRY_FLOOR
			{
				return false;
			}
			attempts.insert(key.clone(), Instant::now());
		}

		self.cache.lock().await.remove(&key);

		let refreshed = match override_bot {
			Some(account) => self.service.refresh_token(account).await,
			None => self.refresh_default().await,
		};

		match refreshed {
			Ok(issued) => {
				metrics::counter!("relaybot_token_refresh_success_total").increment(1);
				self.cache.lock().await.insert(key, CachedToken::from_issued(issued));
				true
			}
			Err(e) => {
				metrics::counter!("relaybot_token_refresh_errors_total").increment(1);
				warn!(error = %e, "token refresh failed; reconnect stays scheduled");
				false
			}
		}
	}

	async fn refresh_default(&self) -> anyhow::Result<IssuedToken> {
		// A statically configured token cannot be refreshed here; fall back
		// to whatever the service holds.
		if let Some(token) = self.service.fetch_default_bot().await? {
			return Ok(token);
		}
		if let Some(login) = self.default_bot_login.as_deref() {
			return self.service.fetch_by_login(login).await;
		}
		if let Some(token) = &self.static_default {
			return Ok(IssuedToken {
				access_token: token.clone(),
				expires_in: None,
			});
		}
		Err(anyhow!("no refreshable default bot credentials"))
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicUsize, Ordering};

	use super::*;

	#[derive(Default)]
	struct CountingService {
		fetches: AtomicUsize,
		refreshes: AtomicUsize,
		default_fetches: AtomicUsize,
		by_login_fetches: AtomicUsize,
		has_global_default: bool,
	}

	#[async_trait]
	impl TokenService for CountingService {
		async fn fetch_token(&self, account: &BotAccountId) -> anyhow::Result<IssuedToken> {
			self.fetches.fetch_add(1, Ordering::SeqCst);
			Ok(IssuedToken {
				access_token: SecretString::new(format!("tok-{}", account.as_str())),
				expires_in: Some(Duration::from_secs(3600)),
			})
		}

		async fn refresh_token(&self, account: &BotAccountId) -> anyhow::Result<IssuedToken> {
			self.refreshes.fetch_add(1, Ordering::SeqCst);
			Ok(IssuedToken {
				access_token: SecretString::new(format!("fresh-{}", account.as_str())),
				expires_in: Some(Duration::from_secs(3600)),
			})
		}

		async fn fetch_default_bot(&self) -> anyhow::Result<Option<IssuedToken>> {
			self.default_fetches.fetch_add(1, Ordering::SeqCst);
			if self.has_global_default {
				Ok(Some(IssuedToken {
					access_token: SecretString::new("default-tok"),
					expires_in: Some(Duration::from_secs(3600)),
				}))
			} else {
				Ok(None)
			}
		}

		async fn fetch_by_login(&self, login: &str) -> anyhow::Result<IssuedToken> {
			self.by_login_fetches.fetch_add(1, Ordering::SeqCst);
			Ok(IssuedToken {
				access_token: SecretString::new(format!("legacy-{login}")),
				expires_in: Some(Duration::from_secs(3600)),
			})
		}
	}

	#[tokio::test]
	async fn override_tokens_are_cached() {
		let service = Arc::new(CountingService::default());
		let resolver = TokenResolver::new(service.clone());
		let account = BotAccountId::new("bot-9").unwrap();

		let first = resolver.resolve(Some(&account)).await.unwrap();
		let second = resolver.resolve(Some(&account)).await.unwrap();
		assert_eq!(first.expose(), "tok-bot-9");
		assert_eq!(second.expose(), "tok-bot-9");
		assert_eq!(service.fetches.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn default_prefers_global_record_over_legacy_login() {
		let service = Arc::new(CountingService {
			has_global_default: true,
			..CountingService::default()
		});
		let resolver = TokenResolver::new(service.clone()).with_default_bot_login("relaybot");

		let token = resolver.resolve(None).await.unwrap();
		assert_eq!(token.expose(), "default-tok");
		assert_eq!(service.by_login_fetches.load(Ordering::SeqCst), 0);
	}

	#[tokio::test]
	async fn default_falls_back_to_legacy_login() {
		let service = Arc::new(CountingService::default());
		let resolver = TokenResolver::new(service.clone()).with_default_bot_login("relaybot");

		let token = resolver.resolve(None).await.unwrap();
		assert_eq!(token.expose(), "legacy-relaybot");
		assert_eq!(service.default_fetches.load(Ordering::SeqCst), 1);
		assert_eq!(service.by_login_fetches.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn static_default_short_circuits_the_service() {
		let service = Arc::new(CountingService::default());
		let resolver = TokenResolver::new(service.clone()).with_static_default(SecretString::new("env-tok"));

		let token = resolver.resolve(None).await.unwrap();
		assert_eq!(token.expose(), "env-tok");
		assert_eq!(service.default_fetches.load(Ordering::SeqCst), 0);
	}

	#[tokio::test]
	async fn auth_error_refreshes_exactly_once_within_floor() {
		let service = Arc::new(CountingService::default());
		let resolver = TokenResolver::new(service.clone());
		let account = BotAccountId::new("bot-1").unwrap();

		assert!(resolver.handle_auth_error(Some(&account)).await);
		// Second rejection inside the retry floor must not refresh again.
		assert!(!resolver.handle_auth_error(Some(&account)).await);
		assert_eq!(service.refreshes.load(Ordering::SeqCst), 1);

		// The refreshed token replaced the cached one.
		let token = resolver.resolve(Some(&account)).await.unwrap();
		assert_eq!(token.expose(), "fresh-bot-1");
		assert_eq!(service.fetches.load(Ordering::SeqCst), 0);
	}
}
