//! Process-local session store with optional persistence.
//!
//! The store is the single owner of the live session. All mutation goes
//! through it, every mutation bumps a generation counter, and readers see
//! either the pre- or post-mutation session, never a torn intermediate.
//! The generation counter is what lets the gateway deduplicate concurrent
//! renewals: a caller that saw generation N only renews if the store is
//! still at generation N.

use crate::error::SessionStoreError;
use crate::session::Session;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::RwLock;

/// The credential pair persisted across process restarts.
///
/// Only the raw credentials are stored; claims and tenant binding are
/// re-derived on load so persisted state can never smuggle in a tenant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedCredentials {
    pub access_credential: String,
    pub refresh_credential: String,
}

/// Trait for persisting the session credential pair.
#[async_trait]
pub trait SessionPersistence: Send + Sync {
    /// Loads the persisted credential pair, if any.
    async fn load(&self) -> Result<Option<PersistedCredentials>, SessionStoreError>;

    /// Persists the credential pair.
    async fn save(&self, credentials: &PersistedCredentials) -> Result<(), SessionStoreError>;

    /// Removes any persisted credential pair. Must be idempotent.
    async fn clear(&self) -> Result<(), SessionStoreError>;
}

/// JSON-file persistence, keyed per profile by its path.
pub struct FilePersistence {
    path: PathBuf,
}

impl FilePersistence {
    /// Creates file persistence rooted at the given path.
    #[must_use]
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl SessionPersistence for FilePersistence {
    async fn load(&self) -> Result<Option<PersistedCredentials>, SessionStoreError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(SessionStoreError::Persistence {
                    reason: e.to_string(),
                });
            }
        };

        let credentials =
            serde_json::from_slice(&bytes).map_err(|e| SessionStoreError::Persistence {
                reason: format!("corrupt session file: {e}"),
            })?;
        Ok(Some(credentials))
    }

    async fn save(&self, credentials: &PersistedCredentials) -> Result<(), SessionStoreError> {
        let bytes =
            serde_json::to_vec(credentials).map_err(|e| SessionStoreError::Persistence {
                reason: e.to_string(),
            })?;
        tokio::fs::write(&self.path, bytes)
            .await
            .map_err(|e| SessionStoreError::Persistence {
                reason: e.to_string(),
            })
    }

    async fn clear(&self) -> Result<(), SessionStoreError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SessionStoreError::Persistence {
                reason: e.to_string(),
            }),
        }
    }
}

struct Slot {
    session: Option<Session>,
    generation: u64,
}

/// Process-local store owning the single live session.
pub struct SessionStore {
    slot: RwLock<Slot>,
    persistence: Option<Box<dyn SessionPersistence>>,
}

impl SessionStore {
    /// Creates an in-memory store with no persistence.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slot: RwLock::new(Slot {
                session: None,
                generation: 0,
            }),
            persistence: None,
        }
    }

    /// Creates a store backed by the given persistence.
    #[must_use]
    pub fn with_persistence(persistence: Box<dyn SessionPersistence>) -> Self {
        Self {
            slot: RwLock::new(Slot {
                session: None,
                generation: 0,
            }),
            persistence: Some(persistence),
        }
    }

    /// Restores a persisted session, if one exists and still decodes.
    ///
    /// A persisted credential that no longer decodes is discarded rather
    /// than surfaced: the caller simply starts unauthenticated.
    ///
    /// # Errors
    ///
    /// Returns an error only when the persistence backend itself fails.
    pub async fn restore(&self) -> Result<bool, SessionStoreError> {
        let Some(persistence) = &self.persistence else {
            return Ok(false);
        };

        let Some(credentials) = persistence.load().await? else {
            return Ok(false);
        };

        match Session::from_credentials(
            credentials.access_credential,
            credentials.refresh_credential,
        ) {
            Ok(session) => {
                let mut slot = self.slot.write().await;
                slot.session = Some(session);
                slot.generation += 1;
                Ok(true)
            }
            Err(e) => {
                tracing::warn!(error = %e, "discarding persisted session with undecodable credential");
                persistence.clear().await?;
                Ok(false)
            }
        }
    }

    /// Returns a clone of the current session, if any.
    pub async fn get(&self) -> Option<Session> {
        self.slot.read().await.session.clone()
    }

    /// Returns the current session together with the store generation.
    ///
    /// The pair is read atomically so the gateway can tie a renewal
    /// decision to the exact session it dispatched with.
    pub async fn snapshot(&self) -> Option<(Session, u64)> {
        let slot = self.slot.read().await;
        slot.session.clone().map(|s| (s, slot.generation))
    }

    /// Returns the store generation. Bumped on every mutation, including
    /// [`clear`](Self::clear).
    pub async fn generation(&self) -> u64 {
        self.slot.read().await.generation
    }

    /// Installs a new session from a credential pair.
    ///
    /// Claims and tenant binding are re-derived from the access credential;
    /// callers cannot supply them.
    ///
    /// # Errors
    ///
    /// Returns an error when the access credential does not decode or the
    /// persistence backend fails.
    pub async fn set(
        &self,
        access_credential: String,
        refresh_credential: String,
    ) -> Result<Session, SessionStoreError> {
        let session = Session::from_credentials(access_credential, refresh_credential)
            .map_err(|source| SessionStoreError::InvalidCredential { source })?;

        let mut slot = self.slot.write().await;
        if let Some(persistence) = &self.persistence {
            persistence
                .save(&PersistedCredentials {
                    access_credential: session.access_credential().to_string(),
                    refresh_credential: session.refresh_credential().to_string(),
                })
                .await?;
        }
        slot.session = Some(session.clone());
        slot.generation += 1;
        Ok(session)
    }

    /// Destroys the live session. Idempotent.
    pub async fn clear(&self) {
        let mut slot = self.slot.write().await;
        if let Some(persistence) = &self.persistence {
            if let Err(e) = persistence.clear().await {
                tracing::warn!(error = %e, "failed to clear persisted session");
            }
        }
        slot.session = None;
        slot.generation += 1;
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}
