use crate::{
    session::{SessionStore, SessionStoreError, UserSession, UserSessionUpdate, UserSessionsFilter},
    ticket::{deserialize_ticket, serialize_ticket, AuthenticationTicket, ClaimsPrincipal,
        DataProtector, ProtectionError},
};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use std::{collections::BTreeMap, sync::Arc};
use thiserror::Error;

const TOKEN_PREFIX: &str = ".Token.";
const ACCESS_TOKEN_KEY: &str = ".Token.access_token";
const TOKEN_TYPE_KEY: &str = ".Token.token_type";
const REFRESH_TOKEN_KEY: &str = ".Token.refresh_token";
const EXPIRES_AT_KEY: &str = ".Token.expires_at";
const DPOP_KEY_KEY: &str = ".Token.dpop_proof_key";
const SCOPE_KEY: &str = ".Token.scope";

const BEARER_TOKEN_TYPE: &str = "bearer";
const DPOP_TOKEN_TYPE: &str = "dpop";

/// Token material projected from a ticket's properties bag. Transient:
/// constructed on each retrieval, mutations go through the ticket-update
/// path, never directly against storage.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserToken {
    pub access_token: Option<String>,
    pub access_token_type: Option<String>,
    pub refresh_token: Option<String>,
    pub dpop_json_web_key: Option<String>,
    pub expiration: Option<DateTime<Utc>>,
    pub scope: Option<String>,
    pub error: Option<String>,
}

impl UserToken {
    pub(crate) fn with_error(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub(crate) fn from_properties(properties: &BTreeMap<String, String>) -> Self {
        Self {
            access_token: properties.get(ACCESS_TOKEN_KEY).cloned(),
            access_token_type: properties.get(TOKEN_TYPE_KEY).cloned(),
            refresh_token: properties.get(REFRESH_TOKEN_KEY).cloned(),
            dpop_json_web_key: properties.get(DPOP_KEY_KEY).cloned(),
            expiration: properties
                .get(EXPIRES_AT_KEY)
                .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
                .map(|d| d.with_timezone(&Utc)),
            scope: properties.get(SCOPE_KEY).cloned(),
            error: None,
        }
    }

    pub(crate) fn write_properties(&self, properties: &mut BTreeMap<String, String>) {
        Self::write_optional(properties, ACCESS_TOKEN_KEY, self.access_token.as_deref());
        Self::write_optional(properties, TOKEN_TYPE_KEY, self.access_token_type.as_deref());
        Self::write_optional(properties, REFRESH_TOKEN_KEY, self.refresh_token.as_deref());
        Self::write_optional(properties, DPOP_KEY_KEY, self.dpop_json_web_key.as_deref());
        Self::write_optional(properties, SCOPE_KEY, self.scope.as_deref());
        match self.expiration {
            Some(expiration) => {
                properties.insert(
                    EXPIRES_AT_KEY.to_string(),
                    expiration.to_rfc3339_opts(SecondsFormat::Secs, true),
                );
            }
            None => {
                properties.remove(EXPIRES_AT_KEY);
            }
        }
    }

    fn write_optional(
        properties: &mut BTreeMap<String, String>,
        key: &str,
        value: Option<&str>,
    ) {
        match value {
            Some(value) => {
                properties.insert(key.to_string(), value.to_string());
            }
            None => {
                properties.remove(key);
            }
        }
    }

    fn has_access_token(&self, now: DateTime<Utc>) -> bool {
        if self.error.is_some() {
            return false;
        }
        match &self.access_token {
            None => false,
            // An access token at or past its expiry counts as absent.
            Some(_) => self.expiration.map(|e| e > now).unwrap_or(true),
        }
    }
}

#[derive(Error, Debug)]
pub enum TokenStoreError {
    #[error("Principal has no sub claim.")]
    MissingSubjectClaim,
    #[error("Principal has no sid claim so it cannot be correlated to a unique session.")]
    MissingSessionIdClaim,
    // Structural invariant violation: the store's uniqueness constraints
    // make this impossible in correct operation, so fail loudly.
    #[error("Expected exactly one session for subject {subject_id} and session id {session_id}, found {found}.")]
    SessionCountMismatch {
        subject_id: String,
        session_id: String,
        found: usize,
    },
    #[error("Session store failure: {0}")]
    Store(#[from] SessionStoreError),
    #[error("Failed to protect ticket: {0}")]
    Protection(#[from] ProtectionError),
}

/// Which token to resolve when proxying to a remote API.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenType {
    User,
    Client,
    UserOrClient,
}

#[derive(Clone, Copy, Debug)]
pub struct TokenRequirement {
    pub token_type: TokenType,
    /// When set, an absent token yields [`AccessTokenResult::NoToken`]
    /// instead of an error.
    pub optional: bool,
}

impl TokenRequirement {
    pub fn required(token_type: TokenType) -> Self {
        Self {
            token_type,
            optional: false,
        }
    }

    pub fn optional(token_type: TokenType) -> Self {
        Self {
            token_type,
            optional: true,
        }
    }
}

/// Outcome of access-token resolution, disambiguated by the token's
/// declared type string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AccessTokenResult {
    Bearer { token: String },
    DPoP { token: String, proof_key: String },
    /// The requirement was optional and no token is available.
    NoToken,
    Error(String),
}

/// Source of the current user token for a principal. Seam used by
/// [`TokenRetriever`]; implemented by [`SessionTokenStore`].
#[async_trait]
pub trait UserTokenSource: Send + Sync {
    async fn user_token(&self, principal: &ClaimsPrincipal)
        -> Result<UserToken, TokenStoreError>;
}

/// Source of machine-to-machine tokens. The crate never runs a client
/// credentials flow itself; hosts plug one in through this seam.
#[async_trait]
pub trait ClientTokenProvider: Send + Sync {
    async fn client_token(&self) -> Result<UserToken, String>;
}

/// Token access layer over the session store.
///
/// Correlates a principal to its backing session via both the `sub` and
/// `sid` claims; subject alone is not unique across concurrent sessions.
/// Token mutations are read-modify-write with last-write-wins semantics:
/// there is no optimistic-concurrency guard, so concurrent refreshes of
/// the same session can lose an update. Known limitation.
pub struct SessionTokenStore {
    sessions: Arc<dyn SessionStore>,
    protector: Arc<dyn DataProtector>,
}

impl SessionTokenStore {
    pub fn new(sessions: Arc<dyn SessionStore>, protector: Arc<dyn DataProtector>) -> Self {
        Self {
            sessions,
            protector,
        }
    }

    async fn find_session(
        &self,
        principal: &ClaimsPrincipal,
    ) -> Result<UserSession, TokenStoreError> {
        let subject_id = principal
            .subject_id()
            .ok_or(TokenStoreError::MissingSubjectClaim)?
            .to_string();
        let session_id = principal
            .session_id()
            .ok_or(TokenStoreError::MissingSessionIdClaim)?
            .to_string();

        let filter =
            UserSessionsFilter::new(Some(subject_id.clone()), Some(session_id.clone()));
        let mut sessions = self.sessions.get_user_sessions(&filter).await?;

        if sessions.len() != 1 {
            return Err(TokenStoreError::SessionCountMismatch {
                subject_id,
                session_id,
                found: sessions.len(),
            });
        }
        Ok(sessions.remove(0))
    }

    pub async fn get_token(
        &self,
        principal: &ClaimsPrincipal,
    ) -> Result<UserToken, TokenStoreError> {
        let session = self.find_session(principal).await?;

        match deserialize_ticket(&session, self.protector.as_ref()) {
            Some(ticket) => Ok(UserToken::from_properties(&ticket.properties)),
            None => {
                log::warn!("deleting session {} with unusable ticket.", session.key);
                self.sessions.delete_user_session(&session.key).await?;
                Ok(UserToken::with_error("session ticket was unusable"))
            }
        }
    }

    pub async fn store_token(
        &self,
        principal: &ClaimsPrincipal,
        token: &UserToken,
    ) -> Result<(), TokenStoreError> {
        self.mutate_ticket(principal, |ticket| {
            token.write_properties(&mut ticket.properties);
        })
        .await
    }

    pub async fn clear_token(
        &self,
        principal: &ClaimsPrincipal,
    ) -> Result<(), TokenStoreError> {
        self.mutate_ticket(principal, |ticket| {
            ticket.properties.retain(|k, _| !k.starts_with(TOKEN_PREFIX));
        })
        .await
    }

    async fn mutate_ticket(
        &self,
        principal: &ClaimsPrincipal,
        mutate: impl FnOnce(&mut AuthenticationTicket),
    ) -> Result<(), TokenStoreError> {
        let session = self.find_session(principal).await?;

        let mut ticket = match deserialize_ticket(&session, self.protector.as_ref()) {
            Some(ticket) => ticket,
            None => {
                log::warn!("deleting session {} with unusable ticket.", session.key);
                self.sessions.delete_user_session(&session.key).await?;
                return Ok(());
            }
        };
        mutate(&mut ticket);

        let update = UserSessionUpdate {
            subject_id: session.subject_id,
            session_id: session.session_id,
            created: session.created,
            renewed: session.renewed,
            expires: session.expires,
            ticket: serialize_ticket(&ticket, self.protector.as_ref())?,
        };
        self.sessions.update_user_session(&session.key, update).await?;
        Ok(())
    }
}

#[async_trait]
impl UserTokenSource for SessionTokenStore {
    async fn user_token(
        &self,
        principal: &ClaimsPrincipal,
    ) -> Result<UserToken, TokenStoreError> {
        self.get_token(principal).await
    }
}

/// Resolves the access token to attach when proxying a request to a
/// remote API, with user/client/user-or-client fallback and optionality.
pub struct TokenRetriever {
    user_tokens: Arc<dyn UserTokenSource>,
    client_tokens: Option<Arc<dyn ClientTokenProvider>>,
}

impl TokenRetriever {
    pub fn new(
        user_tokens: Arc<dyn UserTokenSource>,
        client_tokens: Option<Arc<dyn ClientTokenProvider>>,
    ) -> Self {
        Self {
            user_tokens,
            client_tokens,
        }
    }

    pub async fn access_token_for(
        &self,
        principal: &ClaimsPrincipal,
        requirement: TokenRequirement,
    ) -> AccessTokenResult {
        match requirement.token_type {
            TokenType::User => {
                match self.user_access_token(principal).await {
                    Some(result) => result,
                    None => Self::absent(requirement, "no user access token available"),
                }
            }
            TokenType::Client => match self.client_access_token().await {
                Some(result) => result,
                None => Self::absent(requirement, "no client access token available"),
            },
            TokenType::UserOrClient => {
                if let Some(result) = self.user_access_token(principal).await {
                    return result;
                }
                match self.client_access_token().await {
                    Some(result) => result,
                    None => {
                        Self::absent(requirement, "no user or client access token available")
                    }
                }
            }
        }
    }

    /// None means "no token present"; the caller maps that through the
    /// requirement's fallback/optionality. A present-but-malformed token
    /// is Some(Error(..)).
    async fn user_access_token(&self, principal: &ClaimsPrincipal) -> Option<AccessTokenResult> {
        let token = match self.user_tokens.user_token(principal).await {
            Ok(token) => token,
            Err(err) => return Some(AccessTokenResult::Error(err.to_string())),
        };
        if !token.has_access_token(Utc::now()) {
            return None;
        }
        Some(Self::classify(&token))
    }

    async fn client_access_token(&self) -> Option<AccessTokenResult> {
        let provider = self.client_tokens.as_ref()?;
        let token = match provider.client_token().await {
            Ok(token) => token,
            Err(err) => return Some(AccessTokenResult::Error(err)),
        };
        if !token.has_access_token(Utc::now()) {
            return None;
        }
        Some(Self::classify(&token))
    }

    fn classify(token: &UserToken) -> AccessTokenResult {
        let access_token = match &token.access_token {
            Some(access_token) => access_token.clone(),
            None => return AccessTokenResult::Error("token has no access token".to_string()),
        };
        let token_type = token
            .access_token_type
            .as_deref()
            .unwrap_or(BEARER_TOKEN_TYPE);

        if token_type.eq_ignore_ascii_case(BEARER_TOKEN_TYPE) {
            return AccessTokenResult::Bearer {
                token: access_token,
            };
        }
        if token_type.eq_ignore_ascii_case(DPOP_TOKEN_TYPE) {
            return match &token.dpop_json_web_key {
                Some(proof_key) => AccessTokenResult::DPoP {
                    token: access_token,
                    proof_key: proof_key.clone(),
                },
                None => AccessTokenResult::Error(
                    "DPoP token without a stored proof key".to_string(),
                ),
            };
        }
        // Never silently treat an unrecognized type as Bearer.
        AccessTokenResult::Error(format!("unrecognized token type {:?}", token_type))
    }

    fn absent(requirement: TokenRequirement, detail: &str) -> AccessTokenResult {
        if requirement.optional {
            AccessTokenResult::NoToken
        } else {
            AccessTokenResult::Error(detail.to_string())
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        session::InMemorySessionStore,
        ticket::{test::make_ticket, AesGcmProtector},
        ticket_store::{ServerTicketStore, TicketStore},
    };
    use async_trait::async_trait;
    use chrono::Duration;
    use mockall::mock;

    mock! {
        pub UserTokenSourceStruct {}

        #[async_trait]
        impl UserTokenSource for UserTokenSourceStruct {
            async fn user_token(&self, principal: &ClaimsPrincipal) -> Result<UserToken, TokenStoreError>;
        }
    }

    mock! {
        pub ClientTokenProviderStruct {}

        #[async_trait]
        impl ClientTokenProvider for ClientTokenProviderStruct {
            async fn client_token(&self) -> Result<UserToken, String>;
        }
    }

    fn bearer_token(value: &str) -> UserToken {
        UserToken {
            access_token: Some(value.to_string()),
            access_token_type: Some("Bearer".to_string()),
            expiration: Some(Utc::now() + Duration::hours(1)),
            ..Default::default()
        }
    }

    fn retriever_with(
        user_token: Option<UserToken>,
        client_token: Option<UserToken>,
    ) -> TokenRetriever {
        let mut user_source = MockUserTokenSourceStruct::default();
        user_source
            .expect_user_token()
            .returning(move |_| Ok(user_token.clone().unwrap_or_default()));

        let client_provider = client_token.map(|token| {
            let mut provider = MockClientTokenProviderStruct::default();
            provider
                .expect_client_token()
                .returning(move || Ok(token.clone()));
            Arc::new(provider) as Arc<dyn ClientTokenProvider>
        });

        TokenRetriever::new(Arc::new(user_source), client_provider)
    }

    async fn store_fixture() -> (
        Arc<InMemorySessionStore>,
        SessionTokenStore,
        ClaimsPrincipal,
    ) {
        let sessions = Arc::new(InMemorySessionStore::default());
        let protector = Arc::new(AesGcmProtector::generate());
        let tickets =
            ServerTicketStore::new(sessions.clone(), protector.clone(), None);
        let ticket = make_ticket("alice", Some("s1"));
        tickets.store(&ticket).await.unwrap();
        let tokens = SessionTokenStore::new(sessions.clone(), protector);
        (sessions, tokens, ticket.principal)
    }

    // Decision table: User requirement.

    #[actix_web::test]
    async fn test_user_token_present_returns_user_token() {
        // Arrange
        let retriever = retriever_with(Some(bearer_token("user-at")), None);
        let principal = make_ticket("alice", Some("s1")).principal;

        // Act
        let result = retriever
            .access_token_for(&principal, TokenRequirement::required(TokenType::User))
            .await;

        // Assert
        assert_eq!(
            result,
            AccessTokenResult::Bearer {
                token: "user-at".to_string()
            }
        );
    }

    #[actix_web::test]
    async fn test_user_token_missing_returns_error() {
        // Arrange
        let retriever = retriever_with(None, Some(bearer_token("client-at")));
        let principal = make_ticket("alice", Some("s1")).principal;

        // Act
        let result = retriever
            .access_token_for(&principal, TokenRequirement::required(TokenType::User))
            .await;

        // Assert
        assert!(matches!(result, AccessTokenResult::Error(_)));
    }

    // Decision table: Client requirement.

    #[actix_web::test]
    async fn test_client_token_present_returns_client_token() {
        // Arrange
        let retriever = retriever_with(None, Some(bearer_token("client-at")));
        let principal = make_ticket("alice", Some("s1")).principal;

        // Act
        let result = retriever
            .access_token_for(&principal, TokenRequirement::required(TokenType::Client))
            .await;

        // Assert
        assert_eq!(
            result,
            AccessTokenResult::Bearer {
                token: "client-at".to_string()
            }
        );
    }

    #[actix_web::test]
    async fn test_client_token_without_provider_returns_error() {
        // Arrange
        let retriever = retriever_with(Some(bearer_token("user-at")), None);
        let principal = make_ticket("alice", Some("s1")).principal;

        // Act
        let result = retriever
            .access_token_for(&principal, TokenRequirement::required(TokenType::Client))
            .await;

        // Assert
        assert!(matches!(result, AccessTokenResult::Error(_)));
    }

    // Decision table: UserOrClient requirement.

    #[actix_web::test]
    async fn test_user_or_client_prefers_user_token() {
        // Arrange
        let retriever = retriever_with(
            Some(bearer_token("user-at")),
            Some(bearer_token("client-at")),
        );
        let principal = make_ticket("alice", Some("s1")).principal;

        // Act
        let result = retriever
            .access_token_for(
                &principal,
                TokenRequirement::required(TokenType::UserOrClient),
            )
            .await;

        // Assert
        assert_eq!(
            result,
            AccessTokenResult::Bearer {
                token: "user-at".to_string()
            }
        );
    }

    #[actix_web::test]
    async fn test_user_or_client_falls_back_to_client_token() {
        // Arrange
        let retriever = retriever_with(None, Some(bearer_token("client-at")));
        let principal = make_ticket("alice", Some("s1")).principal;

        // Act
        let result = retriever
            .access_token_for(
                &principal,
                TokenRequirement::required(TokenType::UserOrClient),
            )
            .await;

        // Assert
        assert_eq!(
            result,
            AccessTokenResult::Bearer {
                token: "client-at".to_string()
            }
        );
    }

    #[actix_web::test]
    async fn test_user_or_client_with_neither_returns_error() {
        // Arrange
        let retriever = retriever_with(None, None);
        let principal = make_ticket("alice", Some("s1")).principal;

        // Act
        let result = retriever
            .access_token_for(
                &principal,
                TokenRequirement::required(TokenType::UserOrClient),
            )
            .await;

        // Assert
        assert!(matches!(result, AccessTokenResult::Error(_)));
    }

    // Decision table: optional requirements.

    #[actix_web::test]
    async fn test_optional_user_token_missing_returns_no_token() {
        // Arrange
        let retriever = retriever_with(None, None);
        let principal = make_ticket("alice", Some("s1")).principal;

        // Act
        let user = retriever
            .access_token_for(&principal, TokenRequirement::optional(TokenType::User))
            .await;
        let client = retriever
            .access_token_for(&principal, TokenRequirement::optional(TokenType::Client))
            .await;
        let either = retriever
            .access_token_for(
                &principal,
                TokenRequirement::optional(TokenType::UserOrClient),
            )
            .await;

        // Assert
        assert_eq!(user, AccessTokenResult::NoToken);
        assert_eq!(client, AccessTokenResult::NoToken);
        assert_eq!(either, AccessTokenResult::NoToken);
    }

    // Token-type disambiguation.

    #[actix_web::test]
    async fn test_dpop_token_with_proof_key_returns_dpop_result() {
        // Arrange
        let mut token = bearer_token("user-at");
        token.access_token_type = Some("DPoP".to_string());
        token.dpop_json_web_key = Some("{\"kty\":\"EC\"}".to_string());
        let retriever = retriever_with(Some(token), None);
        let principal = make_ticket("alice", Some("s1")).principal;

        // Act
        let result = retriever
            .access_token_for(&principal, TokenRequirement::required(TokenType::User))
            .await;

        // Assert
        assert_eq!(
            result,
            AccessTokenResult::DPoP {
                token: "user-at".to_string(),
                proof_key: "{\"kty\":\"EC\"}".to_string()
            }
        );
    }

    #[actix_web::test]
    async fn test_dpop_token_without_proof_key_is_error() {
        // Arrange
        let mut token = bearer_token("user-at");
        token.access_token_type = Some("DPoP".to_string());
        let retriever = retriever_with(Some(token), None);
        let principal = make_ticket("alice", Some("s1")).principal;

        // Act
        let result = retriever
            .access_token_for(&principal, TokenRequirement::required(TokenType::User))
            .await;

        // Assert
        assert!(matches!(result, AccessTokenResult::Error(_)));
    }

    #[actix_web::test]
    async fn test_unrecognized_token_type_is_error_even_when_optional() {
        // Arrange
        let mut token = bearer_token("user-at");
        token.access_token_type = Some("mac".to_string());
        let retriever = retriever_with(Some(token), None);
        let principal = make_ticket("alice", Some("s1")).principal;

        // Act
        let result = retriever
            .access_token_for(&principal, TokenRequirement::optional(TokenType::User))
            .await;

        // Assert
        assert!(matches!(result, AccessTokenResult::Error(_)));
    }

    #[actix_web::test]
    async fn test_expired_access_token_counts_as_absent() {
        // Arrange
        let mut token = bearer_token("user-at");
        token.expiration = Some(Utc::now() - Duration::minutes(1));
        let retriever = retriever_with(Some(token), None);
        let principal = make_ticket("alice", Some("s1")).principal;

        // Act
        let result = retriever
            .access_token_for(&principal, TokenRequirement::optional(TokenType::User))
            .await;

        // Assert
        assert_eq!(result, AccessTokenResult::NoToken);
    }

    // Session correlation.

    #[actix_web::test]
    async fn test_principal_without_sid_is_hard_error() {
        // Arrange
        let (_, tokens, _) = store_fixture().await;
        let principal = make_ticket("alice", None).principal;

        // Act
        let result = tokens.get_token(&principal).await;

        // Assert
        assert!(matches!(
            result,
            Err(TokenStoreError::MissingSessionIdClaim)
        ));
    }

    #[actix_web::test]
    async fn test_principal_without_sub_is_hard_error() {
        // Arrange
        let (_, tokens, _) = store_fixture().await;
        let mut principal = make_ticket("alice", Some("s1")).principal;
        principal.claims.retain(|c| c.claim_type != crate::CLAIM_SUB);

        // Act
        let result = tokens.get_token(&principal).await;

        // Assert
        assert!(matches!(result, Err(TokenStoreError::MissingSubjectClaim)));
    }

    #[actix_web::test]
    async fn test_zero_matching_sessions_is_hard_error() {
        // Arrange
        let sessions = Arc::new(InMemorySessionStore::default());
        let tokens =
            SessionTokenStore::new(sessions, Arc::new(AesGcmProtector::generate()));
        let principal = make_ticket("alice", Some("s1")).principal;

        // Act
        let result = tokens.get_token(&principal).await;

        // Assert
        assert!(matches!(
            result,
            Err(TokenStoreError::SessionCountMismatch { found: 0, .. })
        ));
    }

    #[actix_web::test]
    async fn test_store_then_get_then_clear_token_scenario() {
        // Arrange
        let (_, tokens, principal) = store_fixture().await;
        let mut token = bearer_token("new-at");
        token.refresh_token = Some("rt".to_string());
        token.scope = Some("api".to_string());

        // Act
        tokens.store_token(&principal, &token).await.unwrap();
        let fetched = tokens.get_token(&principal).await.unwrap();

        // Assert
        assert_eq!(fetched.access_token, Some("new-at".to_string()));
        assert_eq!(fetched.refresh_token, Some("rt".to_string()));
        assert_eq!(fetched.scope, Some("api".to_string()));
        assert_eq!(
            fetched.expiration.map(|e| e.timestamp()),
            token.expiration.map(|e| e.timestamp())
        );

        // Act
        tokens.clear_token(&principal).await.unwrap();
        let cleared = tokens.get_token(&principal).await.unwrap();

        // Assert
        assert!(cleared.access_token.is_none());
        assert!(cleared.refresh_token.is_none());
        assert!(cleared.error.is_none());
    }

    #[actix_web::test]
    async fn test_get_token_on_corrupt_ticket_self_heals_with_typed_error() {
        // Arrange
        let (sessions, tokens, principal) = store_fixture().await;
        let stored = sessions
            .get_user_sessions(&UserSessionsFilter::for_subject("alice"))
            .await
            .unwrap()
            .remove(0);
        let corrupt = UserSessionUpdate {
            subject_id: stored.subject_id.clone(),
            session_id: stored.session_id.clone(),
            created: stored.created,
            renewed: stored.renewed,
            expires: stored.expires,
            ticket: "garbage".to_string(),
        };
        sessions
            .update_user_session(&stored.key, corrupt)
            .await
            .unwrap();

        // Act
        let token = tokens.get_token(&principal).await.unwrap();

        // Assert
        assert!(token.error.is_some());
        assert!(sessions
            .get_user_session(&stored.key)
            .await
            .unwrap()
            .is_none());
    }
}
