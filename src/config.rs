use std::str::FromStr;
use std::time::Duration;

use url::Url;

use crate::error::Error;
use crate::storage::DEFAULT_USER_KEY;
use crate::token::DEFAULT_TOKEN_COOKIE;

/// When a failed token validation may fall back to the cached user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StaleCachePolicy {
    /// Always downgrade to unauthenticated.
    Never,
    /// Only for network failures, timeouts, `429` and `5xx`. An explicit
    /// `401`/`403` always ends the session.
    #[default]
    TransientErrors,
    /// Trust the cache on any validation error.
    AnyError,
}

impl StaleCachePolicy {
    #[must_use]
    pub fn allows(self, error: &Error) -> bool {
        match self {
            Self::Never => false,
            Self::TransientErrors => error.is_transient(),
            Self::AnyError => true,
        }
    }
}

impl FromStr for StaleCachePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "never" => Ok(Self::Never),
            "transient" | "transient_errors" => Ok(Self::TransientErrors),
            "always" | "any" => Ok(Self::AnyError),
            other => Err(Error::Config(format!(
                "unknown stale cache policy '{other}' (expected never, transient or always)"
            ))),
        }
    }
}

/// Back-office API location and endpoint paths.
///
/// Paths are resolved against `base_url`; override them with the `with_*`
/// methods when a deployment mounts the API differently.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct ApiConfig {
    pub(crate) base_url: Url,
    pub(crate) login_path: String,
    pub(crate) validate_path: String,
    pub(crate) permissions_path: String,
    pub(crate) me_path: String,
    pub(crate) change_password_path: String,
    pub(crate) timeout: Duration,
}

impl ApiConfig {
    #[must_use]
    pub fn new(mut base_url: Url) -> Self {
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        Self {
            base_url,
            login_path: "auth/login/".into(),
            validate_path: "tokens/".into(),
            permissions_path: "auth/permissions/".into(),
            me_path: "auth/me/".into(),
            change_password_path: "auth/change-password/".into(),
            timeout: Duration::from_secs(30),
        }
    }

    /// Create config from environment variables.
    ///
    /// # Required env vars
    /// - `POS_API_URL`: API base URL
    ///
    /// # Optional env vars
    /// - `POS_API_TIMEOUT_SECS`: request timeout in seconds
    /// - `POS_PERMISSIONS_PATH`: override the permissions endpoint path
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if `POS_API_URL` is missing or any value is invalid.
    pub fn from_env() -> Result<Self, Error> {
        let base = std::env::var("POS_API_URL")
            .map_err(|_| Error::Config("POS_API_URL is required".into()))?;
        let base_url: Url = base
            .parse()
            .map_err(|e| Error::Config(format!("POS_API_URL: {e}")))?;

        let mut config = Self::new(base_url);

        if let Ok(secs) = std::env::var("POS_API_TIMEOUT_SECS") {
            let secs: u64 = secs
                .parse()
                .map_err(|e| Error::Config(format!("POS_API_TIMEOUT_SECS: {e}")))?;
            config = config.with_timeout(Duration::from_secs(secs));
        }
        if let Ok(path) = std::env::var("POS_PERMISSIONS_PATH") {
            config = config.with_permissions_path(path);
        }
        Ok(config)
    }

    #[must_use]
    pub fn with_login_path(mut self, path: impl Into<String>) -> Self {
        self.login_path = path.into();
        self
    }

    #[must_use]
    pub fn with_validate_path(mut self, path: impl Into<String>) -> Self {
        self.validate_path = path.into();
        self
    }

    /// Some deployments serve this at `user/permissions/`.
    #[must_use]
    pub fn with_permissions_path(mut self, path: impl Into<String>) -> Self {
        self.permissions_path = path.into();
        self
    }

    #[must_use]
    pub fn with_me_path(mut self, path: impl Into<String>) -> Self {
        self.me_path = path.into();
        self
    }

    #[must_use]
    pub fn with_change_password_path(mut self, path: impl Into<String>) -> Self {
        self.change_password_path = path.into();
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Resolve an endpoint path against the base URL.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the path does not form a valid URL.
    pub fn endpoint(&self, path: &str) -> Result<Url, Error> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|e| Error::Config(format!("endpoint '{path}': {e}")))
    }
}

/// Client-side session settings.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct SessionConfig {
    pub(crate) token_cookie: String,
    pub(crate) user_key: String,
    pub(crate) token_ttl: time::Duration,
    pub(crate) login_path: String,
    pub(crate) secure_cookies: bool,
    pub(crate) stale_cache_policy: StaleCachePolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            token_cookie: DEFAULT_TOKEN_COOKIE.into(),
            user_key: DEFAULT_USER_KEY.into(),
            token_ttl: time::Duration::hours(24),
            login_path: "/login".into(),
            secure_cookies: true,
            stale_cache_policy: StaleCachePolicy::default(),
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create config from environment variables.
    ///
    /// # Optional env vars
    /// - `POS_LOGIN_PATH`: where unauthenticated visitors are sent
    /// - `POS_STALE_CACHE_POLICY`: `never`, `transient` or `always`
    /// - `POS_TOKEN_TTL_HOURS`: token lifetime when the backend sends no expiry
    /// - `DEV_AUTH`: set to `"1"` or `"true"` to drop the `Secure` cookie attribute
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a value is present but invalid.
    pub fn from_env() -> Result<Self, Error> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("POS_LOGIN_PATH") {
            config = config.with_login_path(path);
        }
        if let Ok(policy) = std::env::var("POS_STALE_CACHE_POLICY") {
            config = config.with_stale_cache_policy(policy.parse()?);
        }
        if let Ok(hours) = std::env::var("POS_TOKEN_TTL_HOURS") {
            let hours: i64 = hours
                .parse()
                .map_err(|e| Error::Config(format!("POS_TOKEN_TTL_HOURS: {e}")))?;
            if hours <= 0 {
                return Err(Error::Config("POS_TOKEN_TTL_HOURS must be positive".into()));
            }
            config = config.with_token_ttl(time::Duration::hours(hours));
        }

        let dev_auth = matches!(std::env::var("DEV_AUTH").as_deref(), Ok("1") | Ok("true"));

        Ok(config.with_secure_cookies(!dev_auth))
    }

    #[must_use]
    pub fn with_token_cookie(mut self, name: impl Into<String>) -> Self {
        self.token_cookie = name.into();
        self
    }

    #[must_use]
    pub fn with_user_key(mut self, key: impl Into<String>) -> Self {
        self.user_key = key.into();
        self
    }

    #[must_use]
    pub fn with_token_ttl(mut self, ttl: time::Duration) -> Self {
        self.token_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_login_path(mut self, path: impl Into<String>) -> Self {
        self.login_path = path.into();
        self
    }

    #[must_use]
    pub fn with_secure_cookies(mut self, secure: bool) -> Self {
        self.secure_cookies = secure;
        self
    }

    #[must_use]
    pub fn with_stale_cache_policy(mut self, policy: StaleCachePolicy) -> Self {
        self.stale_cache_policy = policy;
        self
    }

    #[must_use]
    pub fn token_cookie(&self) -> &str {
        &self.token_cookie
    }

    #[must_use]
    pub fn user_key(&self) -> &str {
        &self.user_key
    }

    #[must_use]
    pub fn token_ttl(&self) -> time::Duration {
        self.token_ttl
    }

    #[must_use]
    pub fn login_path(&self) -> &str {
        &self.login_path
    }

    #[must_use]
    pub fn secure_cookies(&self) -> bool {
        self.secure_cookies
    }

    #[must_use]
    pub fn stale_cache_policy(&self) -> StaleCachePolicy {
        self.stale_cache_policy
    }

    /// Cookie token store configured from these settings.
    #[must_use]
    pub fn token_store(&self) -> crate::token::CookieTokenStore {
        crate::token::CookieTokenStore::with_name(self.token_cookie.clone())
            .with_secure(self.secure_cookies)
    }
}
