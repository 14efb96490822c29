use std::collections::BTreeMap;

use derive_more::{Display, From, Into};
use serde::{Deserialize, Deserializer, Serialize};

/// Backend user identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, From,
    Into,
)]
#[serde(transparent)]
pub struct UserId(pub i64);

/// Opaque bearer credential issued by the backend.
///
/// `Debug` never prints the value.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, From, Into)]
#[serde(transparent)]
pub struct AuthToken(String);

impl AuthToken {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AuthToken(<redacted>)")
    }
}

impl From<&str> for AuthToken {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// Username and password posted to the login endpoint.
#[derive(Clone, Serialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Role reference as the backend sends it: a bare id or an expanded object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RoleRef {
    Id(i64),
    Detailed {
        id: i64,
        #[serde(default)]
        name: Option<String>,
    },
}

impl RoleRef {
    #[must_use]
    pub fn id(&self) -> i64 {
        match self {
            Self::Id(id) | Self::Detailed { id, .. } => *id,
        }
    }

    #[must_use]
    pub fn name(&self) -> Option<&str> {
        match self {
            Self::Id(_) => None,
            Self::Detailed { name, .. } => name.as_deref(),
        }
    }
}

/// Permission embedded in a user payload: a bare codename or an object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PermissionRef {
    Codename(String),
    Detailed { codename: String },
}

impl PermissionRef {
    #[must_use]
    pub fn codename(&self) -> &str {
        match self {
            Self::Codename(c) | Self::Detailed { codename: c } => c,
        }
    }
}

/// Identity and profile projection of the signed-in user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct UserSummary {
    pub id: UserId,
    pub username: String,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub role: Option<RoleRef>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub permissions: Vec<PermissionRef>,
}

fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

impl UserSummary {
    #[must_use]
    pub fn new(id: i64, username: impl Into<String>) -> Self {
        Self {
            id: UserId(id),
            username: username.into(),
            first_name: None,
            last_name: None,
            full_name: None,
            email: None,
            role: None,
            permissions: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_names(mut self, first: impl Into<String>, last: impl Into<String>) -> Self {
        self.first_name = Some(first.into());
        self.last_name = Some(last.into());
        self
    }

    #[must_use]
    pub fn with_full_name(mut self, full_name: impl Into<String>) -> Self {
        self.full_name = Some(full_name.into());
        self
    }

    #[must_use]
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    #[must_use]
    pub fn with_role(mut self, role: RoleRef) -> Self {
        self.role = Some(role);
        self
    }

    #[must_use]
    pub fn with_permissions<I, S>(mut self, codenames: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.permissions = codenames
            .into_iter()
            .map(|c| PermissionRef::Codename(c.into()))
            .collect();
        self
    }

    /// Name to show for this user.
    ///
    /// Precedence: `full_name`, then `first_name last_name`, then
    /// `first_name`, then `username`. Blank values are skipped.
    #[must_use]
    pub fn display_name(&self) -> String {
        let non_blank = |v: &Option<String>| {
            v.as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
        };

        if let Some(full) = non_blank(&self.full_name) {
            return full;
        }
        match (non_blank(&self.first_name), non_blank(&self.last_name)) {
            (Some(first), Some(last)) => format!("{first} {last}"),
            (Some(first), None) => first,
            _ => self.username.clone(),
        }
    }

    /// Whether the permission list embedded in the user payload names `codename`.
    #[must_use]
    pub fn has_embedded_permission(&self, codename: &str) -> bool {
        self.permissions.iter().any(|p| p.codename() == codename)
    }
}

/// A single grantable capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Permission {
    #[serde(default)]
    pub id: Option<i64>,
    pub codename: String,
    #[serde(default)]
    pub name: Option<String>,
}

impl Permission {
    #[must_use]
    pub fn new(codename: impl Into<String>) -> Self {
        Self {
            id: None,
            codename: codename.into(),
            name: None,
        }
    }
}

/// Response of the "my permissions" endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupedPermissions {
    #[serde(default)]
    pub permissions_by_category: BTreeMap<String, Vec<Permission>>,
}

impl GroupedPermissions {
    /// All permissions across categories, in category order.
    #[must_use]
    pub fn flatten(self) -> Vec<Permission> {
        self.permissions_by_category
            .into_values()
            .flatten()
            .collect()
    }
}

/// Response of the login endpoint.
#[derive(Debug, Clone, Deserialize)]
#[non_exhaustive]
pub struct LoginResponse {
    pub token: AuthToken,
    #[serde(default, alias = "expiry", with = "time::serde::rfc3339::option")]
    pub expires: Option<time::OffsetDateTime>,
    pub user: UserSummary,
}

impl LoginResponse {
    #[must_use]
    pub fn new(token: impl Into<AuthToken>, user: UserSummary) -> Self {
        Self {
            token: token.into(),
            expires: None,
            user,
        }
    }

    #[must_use]
    pub fn with_expires(mut self, expires: time::OffsetDateTime) -> Self {
        self.expires = Some(expires);
        self
    }
}

/// Partial profile update sent to `PATCH auth/me/`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProfileUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// Body of `POST auth/change-password/`.
#[derive(Clone, Serialize)]
pub struct PasswordChange {
    pub old_password: String,
    pub new_password: String,
}

impl std::fmt::Debug for PasswordChange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PasswordChange(<redacted>)")
    }
}
