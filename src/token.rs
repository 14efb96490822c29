use cookie::{Cookie, CookieJar, SameSite};
use parking_lot::Mutex;
use time::OffsetDateTime;

use crate::types::AuthToken;

/// Default name of the cookie carrying the bearer token.
pub const DEFAULT_TOKEN_COOKIE: &str = "authToken";

/// Persistence for the bearer token.
///
/// None of these operations fail: a missing token is `None`, and writes to a
/// store that is not available are ignored.
pub trait TokenStore: Send + Sync {
    /// Persist `token` until `expires_at`.
    fn set_token(&self, token: &AuthToken, expires_at: OffsetDateTime);

    /// The current token, if one is present and not expired.
    fn get_token(&self) -> Option<AuthToken>;

    /// Drop the token.
    fn remove_token(&self);

    /// Whether this store is backed by real storage. A store without backing
    /// (server-side rendering, tests without a jar) reads as empty.
    fn is_available(&self) -> bool {
        true
    }
}

/// Token store backed by a cookie jar.
///
/// The cookie is written with `Path=/`, `SameSite=Strict`, `Secure` (unless
/// disabled for local development) and an explicit expiry.
pub struct CookieTokenStore {
    name: String,
    secure: bool,
    jar: Option<Mutex<CookieJar>>,
}

impl CookieTokenStore {
    #[must_use]
    pub fn new() -> Self {
        Self::with_name(DEFAULT_TOKEN_COOKIE)
    }

    #[must_use]
    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            secure: true,
            jar: Some(Mutex::new(CookieJar::new())),
        }
    }

    /// A store with no jar behind it.
    #[must_use]
    pub fn detached() -> Self {
        Self {
            name: DEFAULT_TOKEN_COOKIE.into(),
            secure: true,
            jar: None,
        }
    }

    #[must_use]
    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Load cookies from a `Cookie:` request header.
    ///
    /// Pairs that fail to parse are skipped.
    pub fn load_cookie_header(&self, header: &str) {
        let Some(jar) = &self.jar else {
            return;
        };
        let mut jar = jar.lock();
        for parsed in Cookie::split_parse(header) {
            match parsed {
                Ok(c) => {
                    let value = urlencoding::decode(c.value())
                        .map(|v| v.into_owned())
                        .unwrap_or_else(|_| c.value().to_owned());
                    jar.add(Cookie::new(c.name().to_owned(), value));
                }
                Err(e) => tracing::debug!(error = %e, "Skipping malformed cookie pair"),
            }
        }
    }

    /// Render live cookies as a `Cookie:` header value.
    #[must_use]
    pub fn cookie_header(&self) -> Option<String> {
        let jar = self.jar.as_ref()?.lock();
        let now = OffsetDateTime::now_utc();
        let pairs: Vec<String> = jar
            .iter()
            .filter(|c| is_live(c, now))
            .map(|c| format!("{}={}", c.name(), urlencoding::encode(c.value())))
            .collect();
        (!pairs.is_empty()).then(|| pairs.join("; "))
    }

    /// Render the token cookie, including its attributes, as a `Set-Cookie` value.
    ///
    /// After [`remove_token`](TokenStore::remove_token) this is the removal cookie.
    #[must_use]
    pub fn set_cookie_header(&self) -> Option<String> {
        let jar = self.jar.as_ref()?.lock();
        let current = jar.get(&self.name)?;
        let mut rendered = current.clone();
        rendered.set_value(urlencoding::encode(current.value()).into_owned());
        Some(rendered.to_string())
    }

    fn token_cookie(&self, value: String, expires_at: OffsetDateTime) -> Cookie<'static> {
        Cookie::build((self.name.clone(), value))
            .path("/")
            .secure(self.secure)
            .same_site(SameSite::Strict)
            .expires(expires_at)
            .build()
    }
}

impl Default for CookieTokenStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenStore for CookieTokenStore {
    fn set_token(&self, token: &AuthToken, expires_at: OffsetDateTime) {
        let Some(jar) = &self.jar else {
            return;
        };
        jar.lock()
            .add(self.token_cookie(token.as_str().to_owned(), expires_at));
    }

    fn get_token(&self) -> Option<AuthToken> {
        let jar = self.jar.as_ref()?.lock();
        jar.get(&self.name)
            .filter(|c| is_live(c, OffsetDateTime::now_utc()))
            .filter(|c| !c.value().is_empty())
            .map(|c| AuthToken::new(c.value()))
    }

    fn remove_token(&self) {
        let Some(jar) = &self.jar else {
            return;
        };
        jar.lock()
            .add(self.token_cookie(String::new(), OffsetDateTime::UNIX_EPOCH));
    }

    fn is_available(&self) -> bool {
        self.jar.is_some()
    }
}

fn is_live(cookie: &Cookie<'_>, now: OffsetDateTime) -> bool {
    cookie.expires_datetime().is_none_or(|at| at > now)
}
