use serde::de::DeserializeOwned;

use crate::config::ApiConfig;
use crate::error::Error;
use crate::traits::{AuthBackend, PermissionBackend, ProfileBackend};
use crate::types::{
    AuthToken, Credentials, GroupedPermissions, LoginResponse, PasswordChange, ProfileUpdate,
    UserSummary,
};

/// HTTP client for the back-office REST API.
pub struct ApiClient {
    config: ApiConfig,
    http: reqwest::Client,
}

impl ApiClient {
    /// Create a client with its own connection pool.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Http`] if the TLS backend cannot be initialized.
    pub fn new(config: ApiConfig) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self { config, http })
    }

    /// Use a custom HTTP client (for connection pool reuse or testing).
    #[must_use]
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    #[must_use]
    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        token: &AuthToken,
        operation: &'static str,
    ) -> Result<T, Error> {
        let response = self
            .http
            .get(self.config.endpoint(path)?)
            .bearer_auth(token.as_str())
            .send()
            .await?;

        let response = Self::ensure_success(response, operation).await?;
        response.json::<T>().await.map_err(Into::into)
    }

    /// Checks HTTP response status; returns the response on success or an error with details.
    async fn ensure_success(
        response: reqwest::Response,
        operation: &'static str,
    ) -> Result<reqwest::Response, Error> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let detail = response.text().await.unwrap_or_default();
        tracing::debug!(operation, status, "API request rejected");
        Err(Error::Api {
            operation,
            status,
            detail,
        })
    }
}

impl AuthBackend for ApiClient {
    async fn login(&self, credentials: &Credentials) -> Result<LoginResponse, Error> {
        let response = self
            .http
            .post(self.config.endpoint(&self.config.login_path)?)
            .json(credentials)
            .send()
            .await?;

        let response = Self::ensure_success(response, "login").await?;
        response.json::<LoginResponse>().await.map_err(Into::into)
    }

    async fn validate_token(&self, token: &AuthToken) -> Result<UserSummary, Error> {
        self.get_json(&self.config.validate_path, token, "token validation")
            .await
    }
}

impl PermissionBackend for ApiClient {
    async fn my_permissions(&self, token: &AuthToken) -> Result<GroupedPermissions, Error> {
        self.get_json(&self.config.permissions_path, token, "permission fetch")
            .await
    }
}

impl ProfileBackend for ApiClient {
    async fn me(&self, token: &AuthToken) -> Result<UserSummary, Error> {
        self.get_json(&self.config.me_path, token, "profile fetch")
            .await
    }

    async fn update_me(
        &self,
        token: &AuthToken,
        update: &ProfileUpdate,
    ) -> Result<UserSummary, Error> {
        let response = self
            .http
            .patch(self.config.endpoint(&self.config.me_path)?)
            .bearer_auth(token.as_str())
            .json(update)
            .send()
            .await?;

        let response = Self::ensure_success(response, "profile update").await?;
        response.json::<UserSummary>().await.map_err(Into::into)
    }

    async fn change_password(
        &self,
        token: &AuthToken,
        change: &PasswordChange,
    ) -> Result<(), Error> {
        let response = self
            .http
            .post(self.config.endpoint(&self.config.change_password_path)?)
            .bearer_auth(token.as_str())
            .json(change)
            .send()
            .await?;

        Self::ensure_success(response, "password change").await?;
        Ok(())
    }
}
