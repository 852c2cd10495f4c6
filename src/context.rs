//! Service context: every long-lived component, wired once and passed
//! explicitly to the chat front end, the admin API and the binary.

use std::sync::Arc;

use secrecy::ExposeSecret;

use crate::backup::BackupManager;
use crate::clock::Clock;
use crate::config::BotConfig;
use crate::error::Error;
use crate::platform::{ClientPool, Deliverer, PlatformConnector};
use crate::queue::QueueEngine;
use crate::store::{LibSqlBackend, SessionStore, SettingsStore, TaskStore};
use crate::vault::{AesGcmSealer, CredentialVault, Credentials, Sealer};

pub struct ServiceContext {
    pub config: BotConfig,
    pub store: Arc<dyn TaskStore>,
    pub vault: CredentialVault,
    pub pool: Arc<ClientPool>,
    pub engine: Arc<QueueEngine>,
    pub backups: Arc<BackupManager>,
    pub clock: Arc<dyn Clock>,
}

impl ServiceContext {
    /// Wire everything on top of `backend`. The vault is locked when no
    /// encryption key is configured.
    pub fn build(
        config: BotConfig,
        backend: Arc<LibSqlBackend>,
        connector: Arc<dyn PlatformConnector>,
        deliverer: Arc<dyn Deliverer>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, Error> {
        let sealer: Option<Arc<dyn Sealer>> = match &config.encryption_key {
            Some(key) => Some(Arc::new(AesGcmSealer::new(key.clone())?)),
            None => {
                tracing::warn!("ENCRYPTION_KEY not set; /login is disabled");
                None
            }
        };
        let sessions: Arc<dyn SessionStore> = backend.clone();
        let vault = CredentialVault::new(sessions, sealer);
        Ok(Self::from_parts(
            config, backend, vault, connector, deliverer, clock,
        ))
    }

    /// Wire everything around an existing vault.
    pub fn from_parts(
        config: BotConfig,
        backend: Arc<LibSqlBackend>,
        vault: CredentialVault,
        connector: Arc<dyn PlatformConnector>,
        deliverer: Arc<dyn Deliverer>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let settings: Arc<dyn SettingsStore> = backend.clone();
        let store: Arc<dyn TaskStore> = backend;
        // Public sources fall back to the bot's own identity.
        let fallback = Credentials::new(config.telegram.bot_token.expose_secret());
        let pool = Arc::new(ClientPool::new(
            connector,
            vault.clone(),
            Some(fallback),
            Arc::clone(&clock),
            config.queue.platform_timeout,
        ));
        let engine = Arc::new(QueueEngine::new(
            Arc::clone(&store),
            settings,
            vault.clone(),
            Arc::clone(&pool),
            deliverer,
            Arc::clone(&clock),
            config.queue.clone(),
        ));
        let backups = Arc::new(BackupManager::new(
            Arc::clone(&store),
            Arc::clone(&clock),
            config.backup.clone(),
        ));
        Self {
            config,
            store,
            vault,
            pool,
            engine,
            backups,
            clock,
        }
    }

    pub fn is_admin(&self, user_id: i64) -> bool {
        self.config.is_admin(user_id)
    }
}
