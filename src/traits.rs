use std::future::Future;

use crate::error::Error;
use crate::types::{
    AuthToken, Credentials, GroupedPermissions, LoginResponse, PasswordChange, ProfileUpdate,
    UserSummary,
};

/// Authentication endpoints of the back-office API.
///
/// [`ApiClient`](crate::api::ApiClient) is the HTTP implementation; tests and
/// offline tills provide their own.
///
/// # Example
///
/// ```rust,ignore
/// impl AuthBackend for OfflineTill {
///     async fn login(&self, credentials: &Credentials) -> Result<LoginResponse, Error> {
///         self.local_accounts.verify(credentials).await
///     }
///
///     async fn validate_token(&self, token: &AuthToken) -> Result<UserSummary, Error> {
///         self.local_accounts.user_for(token).await
///     }
/// }
/// ```
pub trait AuthBackend: Send + Sync + 'static {
    /// Exchange credentials for a token and the user it belongs to.
    fn login(
        &self,
        credentials: &Credentials,
    ) -> impl Future<Output = Result<LoginResponse, Error>> + Send;

    /// Check a stored token and return fresh user data for it.
    fn validate_token(
        &self,
        token: &AuthToken,
    ) -> impl Future<Output = Result<UserSummary, Error>> + Send;
}

/// The "my permissions" endpoint.
pub trait PermissionBackend: Send + Sync + 'static {
    fn my_permissions(
        &self,
        token: &AuthToken,
    ) -> impl Future<Output = Result<GroupedPermissions, Error>> + Send;
}

/// Profile management for the signed-in user.
pub trait ProfileBackend: Send + Sync + 'static {
    fn me(&self, token: &AuthToken) -> impl Future<Output = Result<UserSummary, Error>> + Send;

    fn update_me(
        &self,
        token: &AuthToken,
        update: &ProfileUpdate,
    ) -> impl Future<Output = Result<UserSummary, Error>> + Send;

    fn change_password(
        &self,
        token: &AuthToken,
        change: &PasswordChange,
    ) -> impl Future<Output = Result<(), Error>> + Send;
}
