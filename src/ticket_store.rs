use crate::{
    session::{SessionStore, SessionStoreError, UserSession, UserSessionUpdate, UserSessionsFilter},
    ticket::{deserialize_ticket, serialize_ticket, AuthenticationTicket, DataProtector,
        ProtectionError},
};
use aes_gcm::{aead::OsRng, Aes256Gcm, KeyInit};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TicketStoreError {
    #[error("Ticket has no sub claim so it cannot be stored.")]
    MissingSubject,
    #[error("Failed to protect ticket: {0}")]
    Protection(#[from] ProtectionError),
    #[error("Session store failure: {0}")]
    Store(#[from] SessionStoreError),
}

/// Ticket-persistence seam through which the subsystem plugs into a
/// cookie-authentication pipeline: the cookie carries only the key, the
/// ticket lives server-side.
#[async_trait]
pub trait TicketStore: Send + Sync {
    /// Persist a fresh ticket and return its newly generated session key.
    async fn store(&self, ticket: &AuthenticationTicket) -> Result<String, TicketStoreError>;

    /// Look up and deserialize. A record whose ticket no longer
    /// deserializes is deleted and reported as absent.
    async fn retrieve(
        &self,
        key: &str,
    ) -> Result<Option<AuthenticationTicket>, TicketStoreError>;

    /// Update the ticket stored under `key`, creating a fresh record when
    /// the backing one was deleted concurrently.
    async fn renew(&self, key: &str, ticket: &AuthenticationTicket)
        -> Result<(), TicketStoreError>;

    async fn remove(&self, key: &str) -> Result<(), TicketStoreError>;

    /// Bulk query + deserialize. Records failing to deserialize are
    /// deleted as a side effect and excluded from the result.
    async fn get_user_tickets(
        &self,
        filter: &UserSessionsFilter,
    ) -> Result<Vec<(UserSession, AuthenticationTicket)>, TicketStoreError>;
}

/// [`TicketStore`] over any [`SessionStore`].
///
/// Consistency across concurrent requests relies on the store's unique
/// constraints plus the pre-emptive delete in [`ServerTicketStore::store`];
/// there is no in-process lock around sessions.
pub struct ServerTicketStore {
    sessions: Arc<dyn SessionStore>,
    protector: Arc<dyn DataProtector>,
    application_name: Option<String>,
}

impl ServerTicketStore {
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        protector: Arc<dyn DataProtector>,
        application_name: Option<String>,
    ) -> Self {
        Self {
            sessions,
            protector,
            application_name,
        }
    }

    /// 32 random bytes, hex encoded.
    fn generate_key() -> String {
        hex::encode(Aes256Gcm::generate_key(&mut OsRng))
    }

    fn make_session(
        &self,
        key: String,
        ticket: &AuthenticationTicket,
    ) -> Result<UserSession, TicketStoreError> {
        let subject_id = ticket
            .principal
            .subject_id()
            .ok_or(TicketStoreError::MissingSubject)?
            .to_string();
        let now = Utc::now();

        Ok(UserSession {
            key,
            subject_id,
            session_id: ticket.principal.session_id().map(|s| s.to_string()),
            application_name: self.application_name.clone(),
            created: now,
            renewed: now,
            expires: ticket.expires(),
            ticket: serialize_ticket(ticket, self.protector.as_ref())?,
        })
    }
}

#[async_trait]
impl TicketStore for ServerTicketStore {
    async fn store(&self, ticket: &AuthenticationTicket) -> Result<String, TicketStoreError> {
        let session = self.make_session(Self::generate_key(), ticket)?;

        // Upholds the subject/session-id uniqueness invariant under
        // re-authentication races: delete colliding records before insert.
        if session.session_id.is_some() {
            let filter = UserSessionsFilter::new(
                Some(session.subject_id.clone()),
                session.session_id.clone(),
            );
            self.sessions.delete_user_sessions(&filter).await?;
        }

        let key = session.key.clone();
        self.sessions.create_user_session(session).await?;
        Ok(key)
    }

    async fn retrieve(
        &self,
        key: &str,
    ) -> Result<Option<AuthenticationTicket>, TicketStoreError> {
        let session = match self.sessions.get_user_session(key).await? {
            Some(session) => session,
            None => return Ok(None),
        };

        match deserialize_ticket(&session, self.protector.as_ref()) {
            Some(ticket) => Ok(Some(ticket)),
            None => {
                // Self-healing: a corrupt session disappears instead of
                // blocking future logins.
                log::warn!("deleting session {} with unusable ticket.", key);
                self.sessions.delete_user_session(key).await?;
                Ok(None)
            }
        }
    }

    async fn renew(
        &self,
        key: &str,
        ticket: &AuthenticationTicket,
    ) -> Result<(), TicketStoreError> {
        let existing = match self.sessions.get_user_session(key).await? {
            Some(existing) => existing,
            None => {
                // Renewal raced an external deletion; recreate under the
                // same key so the cookie stays valid.
                log::debug!("session {} gone during renew, creating fresh record.", key);
                let session = self.make_session(key.to_string(), ticket)?;
                self.sessions.create_user_session(session).await?;
                return Ok(());
            }
        };

        let subject_id = ticket
            .principal
            .subject_id()
            .ok_or(TicketStoreError::MissingSubject)?
            .to_string();
        let session_id = ticket.principal.session_id().map(|s| s.to_string());

        // Session takeover: only an identity change rebinds Created.
        let identity_changed =
            existing.subject_id != subject_id || existing.session_id != session_id;
        let created = if identity_changed {
            Utc::now()
        } else {
            existing.created
        };

        let update = UserSessionUpdate {
            subject_id,
            session_id,
            created,
            renewed: Utc::now(),
            expires: ticket.expires(),
            ticket: serialize_ticket(ticket, self.protector.as_ref())?,
        };
        self.sessions.update_user_session(key, update).await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), TicketStoreError> {
        self.sessions.delete_user_session(key).await?;
        Ok(())
    }

    async fn get_user_tickets(
        &self,
        filter: &UserSessionsFilter,
    ) -> Result<Vec<(UserSession, AuthenticationTicket)>, TicketStoreError> {
        let sessions = self.sessions.get_user_sessions(filter).await?;

        let mut tickets = Vec::with_capacity(sessions.len());
        for session in sessions {
            match deserialize_ticket(&session, self.protector.as_ref()) {
                Some(ticket) => tickets.push((session, ticket)),
                None => {
                    log::warn!("deleting session {} with unusable ticket.", session.key);
                    self.sessions.delete_user_session(&session.key).await?;
                }
            }
        }
        Ok(tickets)
    }
}
