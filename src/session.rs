use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::RwLock};
use thiserror::Error;

/// Persisted record for one authenticated browser session.
///
/// The `ticket` column holds the protected envelope produced by
/// [`crate::ticket::serialize_ticket`]; the store never looks inside it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserSession {
    /// Opaque unique identifier, primary lookup key.
    pub key: String,
    pub subject_id: String,
    /// Correlates to an upstream identity-provider session, when known.
    pub session_id: Option<String>,
    /// Multi-tenant partition key.
    pub application_name: Option<String>,
    pub created: DateTime<Utc>,
    pub renewed: DateTime<Utc>,
    /// None means no expiry is tracked at this layer.
    pub expires: Option<DateTime<Utc>>,
    pub ticket: String,
}

/// Fields applied onto a stored [`UserSession`] by
/// [`SessionStore::update_user_session`]. Copy semantics: every field
/// overwrites the stored one, including the `Option`s.
#[derive(Clone, Debug)]
pub struct UserSessionUpdate {
    pub subject_id: String,
    pub session_id: Option<String>,
    pub created: DateTime<Utc>,
    pub renewed: DateTime<Utc>,
    pub expires: Option<DateTime<Utc>>,
    pub ticket: String,
}

impl UserSessionUpdate {
    pub(crate) fn apply_to(&self, session: &mut UserSession) {
        session.subject_id = self.subject_id.clone();
        session.session_id = self.session_id.clone();
        session.created = self.created;
        session.renewed = self.renewed;
        session.expires = self.expires;
        session.ticket = self.ticket.clone();
    }
}

/// Query/delete filter over subject and upstream session id. Semantics are
/// AND across the two fields; at least one must be set.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserSessionsFilter {
    pub subject_id: Option<String>,
    pub session_id: Option<String>,
}

impl UserSessionsFilter {
    pub fn for_subject(subject_id: impl Into<String>) -> Self {
        Self {
            subject_id: Some(subject_id.into()),
            session_id: None,
        }
    }

    pub fn for_session(session_id: impl Into<String>) -> Self {
        Self {
            subject_id: None,
            session_id: Some(session_id.into()),
        }
    }

    pub fn new(subject_id: Option<String>, session_id: Option<String>) -> Self {
        Self {
            subject_id,
            session_id,
        }
    }

    /// Must pass before any query or bulk delete touches storage.
    pub fn validate(&self) -> Result<(), SessionStoreError> {
        if self.subject_id.is_none() && self.session_id.is_none() {
            return Err(SessionStoreError::InvalidFilter);
        }
        Ok(())
    }

    pub(crate) fn matches(&self, session: &UserSession) -> bool {
        if let Some(subject_id) = &self.subject_id {
            if session.subject_id != *subject_id {
                return false;
            }
        }
        if let Some(session_id) = &self.session_id {
            if session.session_id.as_deref() != Some(session_id.as_str()) {
                return false;
            }
        }
        true
    }
}

#[derive(Error, Debug)]
pub enum SessionStoreError {
    #[error("Filter must have subject id and/or session id set.")]
    InvalidFilter,
    #[error("Issue when getting lock: {0}")]
    Lock(String),
    #[error("Session store failure: {0}")]
    Backend(String),
}

/// Storage contract for session records.
///
/// Every mutating operation treats "record already gone" as a normal
/// outcome: sessions are deleted from several independent triggers (user
/// logout, backchannel logout, expiry sweep) that race harmlessly.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Single lookup by primary key. A miss returns `Ok(None)`.
    async fn get_user_session(&self, key: &str) -> Result<Option<UserSession>, SessionStoreError>;

    /// Insert. A duplicate-key collision under concurrent creation is
    /// swallowed with a debug log; the ticket store layer above already
    /// performs pre-emptive conflict cleanup.
    async fn create_user_session(&self, session: UserSession) -> Result<(), SessionStoreError>;

    /// Apply `update` onto the stored record. A missing key is a debug
    /// logged no-op; update-after-concurrent-delete is expected.
    async fn update_user_session(
        &self,
        key: &str,
        update: UserSessionUpdate,
    ) -> Result<(), SessionStoreError>;

    /// Idempotent delete. Absence is not an error.
    async fn delete_user_session(&self, key: &str) -> Result<(), SessionStoreError>;

    /// Query by filter. The filter is validated before touching storage.
    async fn get_user_sessions(
        &self,
        filter: &UserSessionsFilter,
    ) -> Result<Vec<UserSession>, SessionStoreError>;

    /// Bulk delete by filter. Entries removed by a concurrent delete are
    /// simply skipped.
    async fn delete_user_sessions(
        &self,
        filter: &UserSessionsFilter,
    ) -> Result<(), SessionStoreError>;
}

/// Bounded-batch removal of expired records, driven by the periodic sweep
/// in [`crate::sweep`]. Conflicting concurrent deletes must not surface as
/// errors; an entry already gone simply does not count towards the batch.
#[async_trait]
pub trait SessionStoreCleanup: Send + Sync {
    /// Delete at most `batch_size` expired sessions, returning how many
    /// were removed.
    async fn delete_expired_sessions(&self, batch_size: usize)
        -> Result<usize, SessionStoreError>;
}

/// In-process [`SessionStore`], partitioned per application discriminator
/// at construction. Suited for tests and single-node hosts; anything else
/// should implement the trait against real storage.
pub struct InMemorySessionStore {
    application_name: Option<String>,
    sessions: RwLock<HashMap<String, UserSession>>,
}

impl InMemorySessionStore {
    pub fn new(application_name: Option<String>) -> Self {
        Self {
            application_name,
            sessions: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new(None)
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get_user_session(&self, key: &str) -> Result<Option<UserSession>, SessionStoreError> {
        let sessions = self
            .sessions
            .read()
            .map_err(|e| SessionStoreError::Lock(e.to_string()))?;
        Ok(sessions.get(key).cloned())
    }

    async fn create_user_session(&self, mut session: UserSession) -> Result<(), SessionStoreError> {
        session.application_name = self.application_name.clone();

        let mut sessions = self
            .sessions
            .write()
            .map_err(|e| SessionStoreError::Lock(e.to_string()))?;

        if sessions.contains_key(&session.key) {
            log::debug!(
                "duplicate session key {} on create, keeping existing record.",
                session.key
            );
            return Ok(());
        }
        if session.session_id.is_some() {
            let duplicate = sessions.values().any(|s| {
                s.subject_id == session.subject_id && s.session_id == session.session_id
            });
            if duplicate {
                log::debug!(
                    "duplicate subject/session id pair on create for subject {}, keeping existing record.",
                    session.subject_id
                );
                return Ok(());
            }
        }

        sessions.insert(session.key.clone(), session);
        Ok(())
    }

    async fn update_user_session(
        &self,
        key: &str,
        update: UserSessionUpdate,
    ) -> Result<(), SessionStoreError> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|e| SessionStoreError::Lock(e.to_string()))?;

        match sessions.get_mut(key) {
            Some(session) => update.apply_to(session),
            None => log::debug!("no session {} to update, likely deleted concurrently.", key),
        }
        Ok(())
    }

    async fn delete_user_session(&self, key: &str) -> Result<(), SessionStoreError> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|e| SessionStoreError::Lock(e.to_string()))?;

        if sessions.remove(key).is_none() {
            log::debug!("no session {} to delete, likely deleted concurrently.", key);
        }
        Ok(())
    }

    async fn get_user_sessions(
        &self,
        filter: &UserSessionsFilter,
    ) -> Result<Vec<UserSession>, SessionStoreError> {
        filter.validate()?;

        let sessions = self
            .sessions
            .read()
            .map_err(|e| SessionStoreError::Lock(e.to_string()))?;
        Ok(sessions
            .values()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect())
    }

    async fn delete_user_sessions(
        &self,
        filter: &UserSessionsFilter,
    ) -> Result<(), SessionStoreError> {
        filter.validate()?;

        let mut sessions = self
            .sessions
            .write()
            .map_err(|e| SessionStoreError::Lock(e.to_string()))?;
        sessions.retain(|_, s| !filter.matches(s));
        Ok(())
    }
}

#[async_trait]
impl SessionStoreCleanup for InMemorySessionStore {
    async fn delete_expired_sessions(
        &self,
        batch_size: usize,
    ) -> Result<usize, SessionStoreError> {
        let now = Utc::now();
        let mut sessions = self
            .sessions
            .write()
            .map_err(|e| SessionStoreError::Lock(e.to_string()))?;

        let expired: Vec<String> = sessions
            .values()
            .filter(|s| s.expires.map(|e| e <= now).unwrap_or(false))
            .map(|s| s.key.clone())
            .take(batch_size)
            .collect();

        for key in &expired {
            sessions.remove(key);
        }
        Ok(expired.len())
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use chrono::Duration;

    pub(crate) fn make_session(key: &str, subject_id: &str, session_id: Option<&str>) -> UserSession {
        let now = Utc::now();
        UserSession {
            key: key.to_string(),
            subject_id: subject_id.to_string(),
            session_id: session_id.map(|s| s.to_string()),
            application_name: None,
            created: now,
            renewed: now,
            expires: Some(now + Duration::hours(8)),
            ticket: "ticket".to_string(),
        }
    }

    #[actix_web::test]
    async fn test_create_and_get_round_trips() {
        // Arrange
        let store = InMemorySessionStore::new(Some("app".to_string()));

        // Act
        store
            .create_user_session(make_session("k1", "alice", Some("s1")))
            .await
            .unwrap();
        let found = store.get_user_session("k1").await.unwrap();

        // Assert
        let session = found.expect("session should exist");
        assert_eq!(session.subject_id, "alice");
        assert_eq!(session.session_id, Some("s1".to_string()));
        assert_eq!(session.application_name, Some("app".to_string()));
    }

    #[actix_web::test]
    async fn test_get_missing_session_returns_none() {
        // Arrange
        let store = InMemorySessionStore::default();

        // Act
        let found = store.get_user_session("missing").await.unwrap();

        // Assert
        assert!(found.is_none());
    }

    #[actix_web::test]
    async fn test_given_duplicate_key_when_create_then_first_record_kept() {
        // Arrange
        let store = InMemorySessionStore::default();
        store
            .create_user_session(make_session("k1", "alice", Some("s1")))
            .await
            .unwrap();

        // Act
        let result = store
            .create_user_session(make_session("k1", "bob", Some("s2")))
            .await;

        // Assert
        assert!(result.is_ok());
        let session = store.get_user_session("k1").await.unwrap().unwrap();
        assert_eq!(session.subject_id, "alice");
    }

    #[actix_web::test]
    async fn test_given_duplicate_subject_session_pair_when_create_then_swallowed() {
        // Arrange
        let store = InMemorySessionStore::default();
        store
            .create_user_session(make_session("k1", "alice", Some("s1")))
            .await
            .unwrap();

        // Act
        let result = store
            .create_user_session(make_session("k2", "alice", Some("s1")))
            .await;

        // Assert
        assert!(result.is_ok());
        assert!(store.get_user_session("k2").await.unwrap().is_none());
    }

    #[actix_web::test]
    async fn test_update_missing_session_is_noop() {
        // Arrange
        let store = InMemorySessionStore::default();
        let session = make_session("k1", "alice", Some("s1"));
        let update = UserSessionUpdate {
            subject_id: session.subject_id,
            session_id: session.session_id,
            created: session.created,
            renewed: session.renewed,
            expires: session.expires,
            ticket: "new".to_string(),
        };

        // Act
        let result = store.update_user_session("k1", update).await;

        // Assert
        assert!(result.is_ok());
        assert!(store.get_user_session("k1").await.unwrap().is_none());
    }

    #[actix_web::test]
    async fn test_update_applies_copy_semantics() {
        // Arrange
        let store = InMemorySessionStore::default();
        store
            .create_user_session(make_session("k1", "alice", Some("s1")))
            .await
            .unwrap();
        let update = UserSessionUpdate {
            subject_id: "alice".to_string(),
            session_id: Some("s1".to_string()),
            created: Utc::now(),
            renewed: Utc::now(),
            expires: None,
            ticket: "updated".to_string(),
        };

        // Act
        store.update_user_session("k1", update).await.unwrap();

        // Assert
        let session = store.get_user_session("k1").await.unwrap().unwrap();
        assert_eq!(session.ticket, "updated");
        // None overwrites the stored expiry; copy, not merge-by-null.
        assert!(session.expires.is_none());
    }

    #[actix_web::test]
    async fn test_delete_is_idempotent() {
        // Arrange
        let store = InMemorySessionStore::default();
        store
            .create_user_session(make_session("k1", "alice", Some("s1")))
            .await
            .unwrap();

        // Act
        store.delete_user_session("k1").await.unwrap();
        let second = store.delete_user_session("k1").await;

        // Assert
        assert!(second.is_ok());
    }

    #[actix_web::test]
    async fn test_given_empty_filter_then_query_fails_validation() {
        // Arrange
        let store = InMemorySessionStore::default();
        let filter = UserSessionsFilter::default();

        // Act
        let query = store.get_user_sessions(&filter).await;
        let delete = store.delete_user_sessions(&filter).await;

        // Assert
        assert!(matches!(query, Err(SessionStoreError::InvalidFilter)));
        assert!(matches!(delete, Err(SessionStoreError::InvalidFilter)));
    }

    #[actix_web::test]
    async fn test_filter_is_and_across_fields() {
        // Arrange
        let store = InMemorySessionStore::default();
        store
            .create_user_session(make_session("k1", "alice", Some("s1")))
            .await
            .unwrap();
        store
            .create_user_session(make_session("k2", "alice", Some("s2")))
            .await
            .unwrap();
        store
            .create_user_session(make_session("k3", "bob", Some("s1")))
            .await
            .unwrap();

        // Act
        let by_subject = store
            .get_user_sessions(&UserSessionsFilter::for_subject("alice"))
            .await
            .unwrap();
        let by_both = store
            .get_user_sessions(&UserSessionsFilter::new(
                Some("alice".to_string()),
                Some("s1".to_string()),
            ))
            .await
            .unwrap();

        // Assert
        assert_eq!(by_subject.len(), 2);
        assert_eq!(by_both.len(), 1);
        assert_eq!(by_both[0].key, "k1");
    }

    #[actix_web::test]
    async fn test_overlapping_concurrent_bulk_deletes_both_complete() {
        // Arrange
        let store = InMemorySessionStore::default();
        store
            .create_user_session(make_session("k1", "alice", Some("s1")))
            .await
            .unwrap();
        store
            .create_user_session(make_session("k2", "alice", Some("s2")))
            .await
            .unwrap();
        let by_subject = UserSessionsFilter::for_subject("alice");
        let by_session = UserSessionsFilter::new(Some("alice".to_string()), Some("s1".to_string()));

        // Act
        let (first, second) = futures_util::future::join(
            store.delete_user_sessions(&by_subject),
            store.delete_user_sessions(&by_session),
        )
        .await;

        // Assert
        assert!(first.is_ok());
        assert!(second.is_ok());
        let remaining = store.get_user_sessions(&by_subject).await.unwrap();
        assert!(remaining.is_empty());
    }

    #[actix_web::test]
    async fn test_delete_expired_sessions_respects_batch_size() {
        // Arrange
        let store = InMemorySessionStore::default();
        for i in 0..3 {
            let mut session = make_session(&format!("k{}", i), "alice", Some(&format!("s{}", i)));
            session.expires = Some(Utc::now() - Duration::minutes(1));
            store.create_user_session(session).await.unwrap();
        }
        let mut live = make_session("live", "alice", Some("s-live"));
        live.expires = Some(Utc::now() + Duration::hours(1));
        store.create_user_session(live).await.unwrap();

        // Act
        let first = store.delete_expired_sessions(2).await.unwrap();
        let second = store.delete_expired_sessions(2).await.unwrap();

        // Assert
        assert_eq!(first, 2);
        assert_eq!(second, 1);
        assert!(store.get_user_session("live").await.unwrap().is_some());
    }

    #[actix_web::test]
    async fn test_session_without_expiry_is_never_swept() {
        // Arrange
        let store = InMemorySessionStore::default();
        let mut session = make_session("k1", "alice", Some("s1"));
        session.expires = None;
        store.create_user_session(session).await.unwrap();

        // Act
        let deleted = store.delete_expired_sessions(10).await.unwrap();

        // Assert
        assert_eq!(deleted, 0);
        assert!(store.get_user_session("k1").await.unwrap().is_some());
    }
}
