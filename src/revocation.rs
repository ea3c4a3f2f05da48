use crate::{
    session::{SessionStore, SessionStoreError, UserSessionsFilter},
    ticket::AuthenticationTicket,
    ticket_store::{TicketStore, TicketStoreError},
    token::UserToken,
};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RevocationError {
    #[error("Refresh token revocation request failed: {0}")]
    Request(String),
    #[error("No revocation endpoint is configured.")]
    NoRevocationEndpoint,
    #[error("Session store failure: {0}")]
    Store(#[from] SessionStoreError),
    #[error("Ticket store failure: {0}")]
    Ticket(#[from] TicketStoreError),
}

/// Revokes a refresh token against the identity provider's token
/// endpoint. Contacted only for revocation; fire and forget with logging
/// per ticket.
#[async_trait]
pub trait RefreshTokenRevoker: Send + Sync {
    async fn revoke(&self, refresh_token: &str) -> Result<(), RevocationError>;
}

/// Fan-out revocation of refresh tokens and session records on logout and
/// backchannel logout.
pub struct SessionRevocationService {
    tickets: Arc<dyn TicketStore>,
    sessions: Arc<dyn SessionStore>,
    revoker: Option<Arc<dyn RefreshTokenRevoker>>,
    revoke_refresh_tokens: bool,
    revoke_all_user_sessions: bool,
}

impl SessionRevocationService {
    pub fn new(
        tickets: Arc<dyn TicketStore>,
        sessions: Arc<dyn SessionStore>,
        revoker: Option<Arc<dyn RefreshTokenRevoker>>,
        revoke_refresh_tokens: bool,
        revoke_all_user_sessions: bool,
    ) -> Self {
        Self {
            tickets,
            sessions,
            revoker,
            revoke_refresh_tokens,
            revoke_all_user_sessions,
        }
    }

    pub async fn revoke_sessions(
        &self,
        mut filter: UserSessionsFilter,
    ) -> Result<(), RevocationError> {
        // Policy switch, not a filter bug: widening to every session of
        // the subject drops the session-id component before querying.
        if self.revoke_all_user_sessions && filter.subject_id.is_some() {
            filter.session_id = None;
        }
        filter.validate()?;

        if self.revoke_refresh_tokens {
            if let Some(revoker) = &self.revoker {
                let tickets = self.tickets.get_user_tickets(&filter).await?;
                for (session, ticket) in tickets {
                    let token = UserToken::from_properties(&ticket.properties);
                    let refresh_token = match token.refresh_token {
                        Some(refresh_token) => refresh_token,
                        None => continue,
                    };
                    // Best effort per ticket; one failure must not abort
                    // processing of the others.
                    if let Err(err) = revoker.revoke(&refresh_token).await {
                        log::warn!(
                            "failed to revoke refresh token for session {}: {}.",
                            session.key,
                            err
                        );
                    } else {
                        log::debug!("revoked refresh token for session {}.", session.key);
                    }
                }
            }
        }

        self.sessions.delete_user_sessions(&filter).await?;
        Ok(())
    }

    /// Best-effort revocation of a single ticket's refresh token, for
    /// sessions that carry no upstream session id and therefore cannot be
    /// addressed through a subject/session filter. Record removal stays
    /// with the caller.
    pub async fn revoke_refresh_token(&self, ticket: &AuthenticationTicket) {
        if !self.revoke_refresh_tokens {
            return;
        }
        let revoker = match &self.revoker {
            Some(revoker) => revoker,
            None => return,
        };
        let token = UserToken::from_properties(&ticket.properties);
        let refresh_token = match token.refresh_token {
            Some(refresh_token) => refresh_token,
            None => return,
        };
        if let Err(err) = revoker.revoke(&refresh_token).await {
            log::warn!("failed to revoke refresh token: {}.", err);
        } else {
            log::debug!("revoked refresh token.");
        }
    }
}
