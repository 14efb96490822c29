//! Permission set of the signed-in user.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::Error;
use crate::state::AuthState;
use crate::token::TokenStore;
use crate::traits::PermissionBackend;
use crate::types::{GroupedPermissions, Permission, UserId, UserSummary};

/// Codenames granted to a user.
///
/// An empty list of codenames satisfies [`has_all`](Self::has_all) and never
/// satisfies [`has_any`](Self::has_any).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionSet {
    codenames: HashSet<String>,
}

impl PermissionSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_permissions(permissions: &[Permission]) -> Self {
        permissions.iter().map(|p| p.codename.clone()).collect()
    }

    #[must_use]
    pub fn contains(&self, codename: &str) -> bool {
        self.codenames.contains(codename)
    }

    #[must_use]
    pub fn has_any<S: AsRef<str>>(&self, codenames: &[S]) -> bool {
        codenames.iter().any(|c| self.contains(c.as_ref()))
    }

    #[must_use]
    pub fn has_all<S: AsRef<str>>(&self, codenames: &[S]) -> bool {
        codenames.iter().all(|c| self.contains(c.as_ref()))
    }

    /// Codenames from `codenames` that are not granted, in input order.
    #[must_use]
    pub fn missing<S: AsRef<str>>(&self, codenames: &[S]) -> Vec<String> {
        codenames
            .iter()
            .map(AsRef::as_ref)
            .filter(|c| !self.contains(c))
            .map(str::to_owned)
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.codenames.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.codenames.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.codenames.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for PermissionSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self {
            codenames: iter.into_iter().map(Into::into).collect(),
        }
    }
}

/// Published permission state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionSnapshot {
    pub permissions: Vec<Permission>,
    pub set: PermissionSet,
    pub loading: bool,
    /// User whose fetch last finished, successfully or not.
    pub settled_for: Option<UserId>,
}

#[derive(Debug, Default)]
struct Tracker {
    current: Option<UserId>,
    loaded_for: Option<UserId>,
    loading_for: Option<UserId>,
    /// Bumped by every load and reset; only the latest load may publish.
    generation: u64,
}

impl Tracker {
    fn begin(&mut self, id: UserId) -> u64 {
        self.loading_for = Some(id);
        self.generation += 1;
        self.generation
    }

    fn switch_to(&mut self, current: Option<UserId>) {
        *self = Self {
            current,
            generation: self.generation + 1,
            ..Self::default()
        };
    }
}

/// Keeps the permission set of the current user, fetched once per identity.
///
/// A fetch that fails leaves an empty set and is retried on the next
/// [`sync_user`](Self::sync_user) for the same user. Only the latest load
/// publishes: responses that arrive after the identity changed or after a
/// [`refresh`](Self::refresh) are dropped.
pub struct PermissionService<B> {
    backend: Arc<B>,
    tokens: Arc<dyn TokenStore>,
    snapshot: watch::Sender<PermissionSnapshot>,
    tracker: Mutex<Tracker>,
}

impl<B: PermissionBackend> PermissionService<B> {
    #[must_use]
    pub fn new(backend: Arc<B>, tokens: Arc<dyn TokenStore>) -> Self {
        Self {
            backend,
            tokens,
            snapshot: watch::Sender::new(PermissionSnapshot::default()),
            tracker: Mutex::new(Tracker::default()),
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> PermissionSnapshot {
        self.snapshot.borrow().clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<PermissionSnapshot> {
        self.snapshot.subscribe()
    }

    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.snapshot.borrow().loading
    }

    #[must_use]
    pub fn has_permission(&self, codename: &str) -> bool {
        self.snapshot.borrow().set.contains(codename)
    }

    #[must_use]
    pub fn has_any_permission<S: AsRef<str>>(&self, codenames: &[S]) -> bool {
        self.snapshot.borrow().set.has_any(codenames)
    }

    #[must_use]
    pub fn has_all_permissions<S: AsRef<str>>(&self, codenames: &[S]) -> bool {
        self.snapshot.borrow().set.has_all(codenames)
    }

    /// React to the signed-in user changing.
    pub async fn sync_user(&self, user: Option<&UserSummary>) {
        let Some(user) = user else {
            self.reset();
            return;
        };
        let id = user.id;

        let generation = {
            let mut tracker = self.tracker.lock();
            if tracker.current != Some(id) {
                tracker.switch_to(Some(id));
                self.snapshot.send_replace(PermissionSnapshot::default());
            }
            if tracker.loaded_for == Some(id) || tracker.loading_for == Some(id) {
                return;
            }
            self.begin(&mut tracker, id)
        };
        self.load(id, generation).await;
    }

    /// Drop the cached set and fetch it again for the current user.
    ///
    /// A load already in flight is superseded and its response dropped.
    pub async fn refresh(&self) {
        let claimed = {
            let mut tracker = self.tracker.lock();
            tracker.loaded_for = None;
            let current = tracker.current;
            current.map(|id| (id, self.begin(&mut tracker, id)))
        };
        match claimed {
            Some((id, generation)) => self.load(id, generation).await,
            None => tracing::debug!("No user, nothing to refresh"),
        }
    }

    /// Follow the signed-in user published by an auth state channel.
    ///
    /// Returns when the sending side is dropped.
    pub async fn follow(&self, mut auth: watch::Receiver<AuthState>) {
        loop {
            let user = auth.borrow_and_update().user.clone();
            self.sync_user(user.as_ref()).await;
            if auth.changed().await.is_err() {
                break;
            }
        }
    }

    fn reset(&self) {
        let mut tracker = self.tracker.lock();
        tracker.switch_to(None);
        self.snapshot.send_replace(PermissionSnapshot::default());
    }

    fn begin(&self, tracker: &mut Tracker, id: UserId) -> u64 {
        let generation = tracker.begin(id);
        self.snapshot.send_modify(|s| s.loading = true);
        generation
    }

    async fn load(&self, id: UserId, generation: u64) {
        let result = match self.tokens.get_token() {
            Some(token) => self.backend.my_permissions(&token).await,
            None => Err(Error::Unauthenticated),
        };
        self.publish(id, generation, result);
    }

    fn publish(&self, id: UserId, generation: u64, result: Result<GroupedPermissions, Error>) {
        let mut tracker = self.tracker.lock();
        if tracker.generation != generation {
            tracing::debug!(user_id = %id, "Dropping superseded permission response");
            return;
        }
        tracker.loading_for = None;

        let snapshot = match result {
            Ok(grouped) => {
                tracker.loaded_for = Some(id);
                let permissions = grouped.flatten();
                let set = PermissionSet::from_permissions(&permissions);
                tracing::info!(user_id = %id, count = set.len(), "Permissions loaded");
                PermissionSnapshot {
                    permissions,
                    set,
                    loading: false,
                    settled_for: Some(id),
                }
            }
            Err(e) => {
                tracing::error!(error = %e, user_id = %id, "Failed to load permissions");
                PermissionSnapshot {
                    settled_for: Some(id),
                    ..PermissionSnapshot::default()
                }
            }
        };
        self.snapshot.send_replace(snapshot);
    }
}
