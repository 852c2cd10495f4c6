//! Platform client pool.
//!
//! Keeps at most one live client per user, created lazily from the user's
//! vault credentials. Users without a session fall back to a shared client
//! for sources that do not need one. An authentication failure evicts the
//! client and puts the user on hold until they log in again.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};

use crate::clock::Clock;
use crate::error::{ErrorClass, PlatformError, VaultError};
use crate::platform::{DownloadStream, ItemMetadata, PlatformClient, PlatformConnector};
use crate::queue::task::SourceRef;
use crate::vault::{CredentialVault, Credentials};

/// Creation-lock key for the shared client. Telegram user ids are positive.
const SHARED_KEY: i64 = 0;

pub struct ClientPool {
    connector: Arc<dyn PlatformConnector>,
    vault: CredentialVault,
    /// Credentials of the shared client, if any.
    fallback: Option<Credentials>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
    clients: RwLock<HashMap<i64, Arc<dyn PlatformClient>>>,
    shared: RwLock<Option<Arc<dyn PlatformClient>>>,
    creation_locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
    /// Users whose session failed, with the time it first failed.
    holds: RwLock<HashMap<i64, DateTime<Utc>>>,
}

impl ClientPool {
    pub fn new(
        connector: Arc<dyn PlatformConnector>,
        vault: CredentialVault,
        fallback: Option<Credentials>,
        clock: Arc<dyn Clock>,
        timeout: Duration,
    ) -> Self {
        Self {
            connector,
            vault,
            fallback,
            clock,
            timeout,
            clients: RwLock::new(HashMap::new()),
            shared: RwLock::new(None),
            creation_locks: Mutex::new(HashMap::new()),
            holds: RwLock::new(HashMap::new()),
        }
    }

    /// Look up a source with the client appropriate for `user_id`.
    pub async fn fetch_item(
        &self,
        user_id: i64,
        source: &SourceRef,
    ) -> Result<ItemMetadata, PlatformError> {
        let client = self.client_for(user_id, source).await?;
        let result = match tokio::time::timeout(self.timeout, client.fetch(source)).await {
            Ok(result) => result,
            Err(_) => Err(PlatformError::Timeout {
                operation: "fetch",
                timeout: self.timeout,
            }),
        };
        self.observe(user_id, result).await
    }

    /// Start downloading a fetched item.
    pub async fn download(
        &self,
        user_id: i64,
        item: &ItemMetadata,
    ) -> Result<DownloadStream, PlatformError> {
        let client = self.client_for(user_id, &item.source).await?;
        let result = match tokio::time::timeout(self.timeout, client.download(item)).await {
            Ok(result) => result,
            Err(_) => Err(PlatformError::Timeout {
                operation: "download",
                timeout: self.timeout,
            }),
        };
        self.observe(user_id, result).await
    }

    /// Drop the cached client of `user_id` (logout, auth failure).
    pub async fn invalidate(&self, user_id: i64) {
        if self.clients.write().await.remove(&user_id).is_some() {
            tracing::debug!(user_id, "Platform client evicted");
        }
    }

    /// Mark `user_id` as waiting for re-login. Keeps the earliest timestamp.
    pub async fn hold(&self, user_id: i64) {
        let now = self.clock.now();
        let mut holds = self.holds.write().await;
        if !holds.contains_key(&user_id) {
            tracing::warn!(user_id, "Session expired; holding user's tasks until re-login");
            holds.insert(user_id, now);
        }
    }

    /// Clear a hold after a successful login. Returns whether one existed.
    pub async fn release_hold(&self, user_id: i64) -> bool {
        self.invalidate(user_id).await;
        self.holds.write().await.remove(&user_id).is_some()
    }

    pub async fn is_held(&self, user_id: i64) -> bool {
        self.holds.read().await.contains_key(&user_id)
    }

    pub async fn held_users(&self) -> Vec<(i64, DateTime<Utc>)> {
        self.holds
            .read()
            .await
            .iter()
            .map(|(user, since)| (*user, *since))
            .collect()
    }

    /// Number of live per-user clients.
    pub async fn live_clients(&self) -> usize {
        self.clients.read().await.len()
    }

    async fn client_for(
        &self,
        user_id: i64,
        source: &SourceRef,
    ) -> Result<Arc<dyn PlatformClient>, PlatformError> {
        if let Some(client) = self.clients.read().await.get(&user_id) {
            return Ok(Arc::clone(client));
        }

        let lock = self.creation_lock(user_id).await;
        let _guard = lock.lock().await;
        if let Some(client) = self.clients.read().await.get(&user_id) {
            return Ok(Arc::clone(client));
        }

        match self.vault.credentials(user_id).await {
            Ok(credentials) => {
                let client = self.connect(user_id, &credentials).await?;
                self.clients
                    .write()
                    .await
                    .insert(user_id, Arc::clone(&client));
                tracing::info!(user_id, "Platform client connected");
                Ok(client)
            }
            Err(VaultError::NotFound { .. } | VaultError::Locked)
                if !source.needs_user_session() && self.fallback.is_some() =>
            {
                self.shared_client().await
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn shared_client(&self) -> Result<Arc<dyn PlatformClient>, PlatformError> {
        if let Some(client) = self.shared.read().await.as_ref() {
            return Ok(Arc::clone(client));
        }
        let lock = self.creation_lock(SHARED_KEY).await;
        let _guard = lock.lock().await;
        if let Some(client) = self.shared.read().await.as_ref() {
            return Ok(Arc::clone(client));
        }

        let credentials = self
            .fallback
            .as_ref()
            .ok_or_else(|| PlatformError::Internal("no shared client configured".into()))?;
        let client = self.authenticate(credentials).await.map_err(|e| match e {
            // A broken shared login is an operator problem, not a user session.
            PlatformError::Auth { reason } => {
                PlatformError::Internal(format!("shared client login failed: {reason}"))
            }
            other => other,
        })?;
        *self.shared.write().await = Some(Arc::clone(&client));
        Ok(client)
    }

    async fn connect(
        &self,
        user_id: i64,
        credentials: &Credentials,
    ) -> Result<Arc<dyn PlatformClient>, PlatformError> {
        match self.authenticate(credentials).await {
            Ok(client) => Ok(client),
            Err(PlatformError::Auth { reason }) => {
                tracing::warn!(user_id, %reason, "Platform authentication failed");
                self.hold(user_id).await;
                Err(PlatformError::SessionExpired { user_id })
            }
            Err(e) => Err(e),
        }
    }

    async fn authenticate(
        &self,
        credentials: &Credentials,
    ) -> Result<Arc<dyn PlatformClient>, PlatformError> {
        match tokio::time::timeout(self.timeout, self.connector.authenticate(credentials)).await {
            Ok(result) => result,
            Err(_) => Err(PlatformError::Timeout {
                operation: "authenticate",
                timeout: self.timeout,
            }),
        }
    }

    async fn creation_lock(&self, key: i64) -> Arc<Mutex<()>> {
        let mut locks = self.creation_locks.lock().await;
        Arc::clone(locks.entry(key).or_default())
    }

    /// Evict and hold on session failures so the next attempt re-authenticates.
    async fn observe<T>(
        &self,
        user_id: i64,
        result: Result<T, PlatformError>,
    ) -> Result<T, PlatformError> {
        match result {
            Err(e) if e.class() == ErrorClass::SessionExpired => {
                self.invalidate(user_id).await;
                self.hold(user_id).await;
                Err(PlatformError::SessionExpired { user_id })
            }
            other => other,
        }
    }
}
