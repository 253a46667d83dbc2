//! Current login session, shared by the engine and the app.

use std::sync::Arc;

use tokio::sync::RwLock;

use super::NetworkClient;
use crate::db::{SettingsRepository, SharedDatabase, SqliteSettingsRepository};
use crate::error::{Error, Result};
use crate::models::Session;

/// Holds the active session and, when backed by a database, persists it in
/// local settings so it survives restarts.
#[derive(Clone, Default)]
pub struct SessionContext {
    current: Arc<RwLock<Option<Session>>>,
    db: Option<SharedDatabase>,
}

impl SessionContext {
    /// A context that keeps the session in memory only.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// A context persisted in local settings, restoring any saved session.
    pub async fn persistent(db: SharedDatabase) -> Result<Self> {
        let restored = {
            let guard = db.lock().await;
            SqliteSettingsRepository::new(guard.connection())
                .load()?
                .session
                .filter(Session::is_valid)
        };
        if let Some(session) = &restored {
            tracing::debug!(user = %session.user_id, "Restored saved session");
        }
        Ok(Self {
            current: Arc::new(RwLock::new(restored)),
            db: Some(db),
        })
    }

    pub async fn current(&self) -> Option<Session> {
        self.current.read().await.clone()
    }

    pub async fn is_active(&self) -> bool {
        self.current.read().await.is_some()
    }

    /// Authenticate against the remote service and keep the session.
    pub async fn login(
        &self,
        client: &dyn NetworkClient,
        identity: &str,
        password: &str,
    ) -> Result<Session> {
        let identity = identity.trim();
        if identity.is_empty() || password.is_empty() {
            return Err(Error::InvalidInput(
                "Email and password are required".to_string(),
            ));
        }
        let session = client.login(identity, password).await?;
        self.set(session.clone()).await?;
        tracing::info!(user = %session.user_id, "Logged in");
        Ok(session)
    }

    pub async fn set(&self, session: Session) -> Result<()> {
        if !session.is_valid() {
            return Err(Error::Session("session is missing token or user".to_string()));
        }
        self.persist(Some(&session)).await?;
        *self.current.write().await = Some(session);
        Ok(())
    }

    pub async fn logout(&self) -> Result<()> {
        self.persist(None).await?;
        *self.current.write().await = None;
        tracing::info!("Logged out");
        Ok(())
    }

    /// Drop a session the server rejected. Queued work waits for a new login.
    pub async fn invalidate(&self) {
        let previous = self.current.write().await.take();
        if previous.is_none() {
            return;
        }
        tracing::warn!("Session rejected by server; login required");
        if let Err(error) = self.persist(None).await {
            tracing::warn!("Failed to clear persisted session: {}", error);
        }
    }

    async fn persist(&self, session: Option<&Session>) -> Result<()> {
        let Some(db) = &self.db else {
            return Ok(());
        };
        let guard = db.lock().await;
        let repo = SqliteSettingsRepository::new(guard.connection());
        let mut settings = repo.load()?;
        settings.session = session.cloned();
        repo.save(&settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::net::MemoryBackend;
    use pretty_assertions::assert_eq;

    fn session() -> Session {
        Session {
            token: "tok".to_string(),
            user_id: "u1".to_string(),
            full_name: "Ana Cruz".to_string(),
            responder_id: Some("resp00000000001".to_string()),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn persistent_context_survives_restart() {
        let db = Database::open_in_memory().unwrap().into_shared();

        let context = SessionContext::persistent(db.clone()).await.unwrap();
        context.set(session()).await.unwrap();

        let restored = SessionContext::persistent(db.clone()).await.unwrap();
        assert_eq!(restored.current().await, Some(session()));

        restored.invalidate().await;
        let after_invalidate = SessionContext::persistent(db).await.unwrap();
        assert!(!after_invalidate.is_active().await);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn login_uses_backend_accounts() {
        let backend = MemoryBackend::new();
        backend.add_account("ana@example.com", "hunter22", session()).await;
        let context = SessionContext::in_memory();

        let err = context
            .login(&backend, "ana@example.com", "wrong")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Api(_)));

        let logged_in = context
            .login(&backend, " ana@example.com ", "hunter22")
            .await
            .unwrap();
        assert_eq!(logged_in.user_id, "u1");
        assert!(context.is_active().await);

        context.logout().await.unwrap();
        assert_eq!(context.current().await, None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn login_requires_credentials() {
        let context = SessionContext::in_memory();
        let err = context
            .login(&MemoryBackend::new(), "  ", "x")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }
}
