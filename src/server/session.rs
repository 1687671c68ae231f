//! Per-connection bookkeeping for the control server.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

/// One client connection.
#[derive(Debug, Clone)]
pub struct Session {
    /// Session identifier, also used as the tracing span field.
    pub id: Uuid,
    /// Remote address.
    pub peer: SocketAddr,
    /// Connection time.
    pub created_at: DateTime<Utc>,
    /// Last request seen.
    pub last_activity: DateTime<Utc>,
    /// Requests answered so far.
    pub requests: u64,
    /// Idle time after which the session is dropped.
    pub idle_timeout: Duration,
}

impl Session {
    /// Fresh session for `peer`.
    #[must_use]
    pub fn new(peer: SocketAddr, idle_timeout: Duration) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            peer,
            created_at: now,
            last_activity: now,
            requests: 0,
            idle_timeout,
        }
    }

    /// Returns `false` once the session has been idle too long.
    #[must_use]
    pub fn is_active(&self) -> bool {
        let idle = Utc::now() - self.last_activity;
        match ChronoDuration::from_std(self.idle_timeout) {
            Ok(limit) => idle < limit,
            Err(_) => true,
        }
    }

    /// Records one request.
    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
        self.requests += 1;
    }
}

/// Shared table of open sessions.
#[derive(Debug, Clone, Default)]
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<Uuid, Session>>>,
}

impl SessionManager {
    /// Empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new connection.
    pub async fn create_session(&self, peer: SocketAddr, idle_timeout: Duration) -> Session {
        let session = Session::new(peer, idle_timeout);
        self.sessions
            .write()
            .await
            .insert(session.id, session.clone());
        session
    }

    /// Looks up a session.
    pub async fn get_session(&self, id: &Uuid) -> Option<Session> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Records a request on `id`; `false` if the session is gone.
    pub async fn touch(&self, id: &Uuid) -> bool {
        match self.sessions.write().await.get_mut(id) {
            Some(session) => {
                session.touch();
                true
            }
            None => false,
        }
    }

    /// Forgets a session; `false` if it was already gone.
    pub async fn remove_session(&self, id: &Uuid) -> bool {
        self.sessions.write().await.remove(id).is_some()
    }

    /// Drops idle sessions and returns how many were removed.
    ///
    /// The connection task notices on its next request and closes.
    pub async fn cleanup_expired_sessions(&self) -> usize {
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|_, session| session.is_active());
        before - sessions.len()
    }

    /// Number of open sessions.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Snapshot of all open sessions.
    pub async fn sessions(&self) -> Vec<Session> {
        self.sessions.read().await.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_session_creation() {
        let manager = SessionManager::new();
        let session = manager
            .create_session(peer(), Duration::from_secs(6))
            .await;

        assert_eq!(session.peer, peer());
        assert_eq!(session.requests, 0);
        assert!(session.is_active());
        assert_eq!(manager.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_touch_counts_requests() {
        let manager = SessionManager::new();
        let session = manager
            .create_session(peer(), Duration::from_secs(6))
            .await;

        assert!(manager.touch(&session.id).await);
        assert!(manager.touch(&session.id).await);
        let session = manager.get_session(&session.id).await.unwrap();
        assert_eq!(session.requests, 2);
        assert!(!manager.touch(&Uuid::new_v4()).await);
    }

    #[tokio::test]
    async fn test_session_removal() {
        let manager = SessionManager::new();
        let session = manager
            .create_session(peer(), Duration::from_secs(6))
            .await;

        assert!(manager.remove_session(&session.id).await);
        assert!(!manager.remove_session(&session.id).await);
        assert!(manager.get_session(&session.id).await.is_none());
    }

    #[tokio::test]
    async fn test_idle_sessions_expire() {
        let manager = SessionManager::new();
        manager.create_session(peer(), Duration::ZERO).await;
        manager
            .create_session(peer(), Duration::from_secs(60))
            .await;

        assert_eq!(manager.cleanup_expired_sessions().await, 1);
        assert_eq!(manager.session_count().await, 1);
    }
}
