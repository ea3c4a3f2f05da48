use crate::{
    backchannel::LogoutTokenValidator,
    env_var,
    middleware::{
        ApiAuthenticationService, AuthenticationService, BffEndpoint, EndpointRegistry,
        RedirectAuthenticationService,
    },
    options::{BffOptions, OptionsError},
    provider::IdentityProvider,
    revocation::{RefreshTokenRevoker, SessionRevocationService},
    session::{InMemorySessionStore, SessionStore, SessionStoreCleanup},
    ticket::{AesGcmProtector, AuthenticationTicket, DataProtector, ProtectionError},
    ticket_store::{ServerTicketStore, TicketStore, TicketStoreError},
    token::{ClientTokenProvider, SessionTokenStore, TokenRetriever, UserTokenSource},
    user,
};
use actix_web::{cookie::Cookie, web, HttpRequest};
use chrono::{Duration, Utc};
use std::{
    env::{self, VarError},
    sync::Arc,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SignInError {
    #[error("Failed to store ticket: {0}")]
    Ticket(#[from] TicketStoreError),
    #[error("Failed to protect session cookie: {0}")]
    Protection(#[from] ProtectionError),
}

/// Composition root wiring the session, ticket, token, and revocation
/// components together. Register it as app data; the [`crate::middleware::Bff`]
/// middleware and the management endpoints look it up there.
pub struct BffContext {
    options: BffOptions,
    protector: Arc<dyn DataProtector>,
    sessions: Arc<dyn SessionStore>,
    cleanup: Option<Arc<dyn SessionStoreCleanup>>,
    tickets: Arc<dyn TicketStore>,
    tokens: Arc<SessionTokenStore>,
    retriever: TokenRetriever,
    revocation: SessionRevocationService,
    authentication: Arc<dyn AuthenticationService>,
    registry: EndpointRegistry,
    logout_tokens: Option<LogoutTokenValidator>,
}

impl BffContext {
    /// Environment-driven wiring: options and protection key from env,
    /// in-memory session store, identity provider via OIDC discovery
    /// (refresh-token revocation and logout-token validation).
    pub async fn setup() -> Result<web::Data<BffContext>, std::io::Error> {
        let options = BffOptions::from_env();
        let protector = AesGcmProtector::from_env()
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))?;
        let provider = Arc::new(IdentityProvider::discover().await?);

        let mut builder = BffContext::builder()
            .with_options(options)
            .with_protector(Arc::new(protector))
            .with_logout_token_validator(provider.logout_token_validator())
            .with_refresh_token_revoker(provider);

        for prefix in Self::prefixes_from_env(env::var(env_var::API_PREFIXES)) {
            builder = builder.with_api_prefix(prefix);
        }
        for prefix in Self::prefixes_from_env(env::var(env_var::UI_PREFIXES)) {
            builder = builder.with_ui_prefix(prefix);
        }

        builder
            .build()
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))
    }

    pub fn builder() -> BffContextBuilder {
        BffContextBuilder::default()
    }

    fn prefixes_from_env(value: Result<String, VarError>) -> Vec<String> {
        value
            .map(|prefixes| {
                prefixes
                    .split(',')
                    .filter(|s| !s.is_empty())
                    .map(|s| s.to_string())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn options(&self) -> &BffOptions {
        &self.options
    }

    pub(crate) fn protector(&self) -> &dyn DataProtector {
        self.protector.as_ref()
    }

    pub fn session_store(&self) -> &Arc<dyn SessionStore> {
        &self.sessions
    }

    /// The sweep-facing side of the session store, when the configured
    /// store supports expired-record cleanup. Hand it to
    /// [`crate::sweep::SessionCleanupHost`].
    pub fn session_cleanup(&self) -> Option<&Arc<dyn SessionStoreCleanup>> {
        self.cleanup.as_ref()
    }

    pub fn ticket_store(&self) -> &Arc<dyn TicketStore> {
        &self.tickets
    }

    pub fn token_store(&self) -> &SessionTokenStore {
        &self.tokens
    }

    pub fn token_retriever(&self) -> &TokenRetriever {
        &self.retriever
    }

    pub fn revocation(&self) -> &SessionRevocationService {
        &self.revocation
    }

    pub fn authentication(&self) -> &dyn AuthenticationService {
        self.authentication.as_ref()
    }

    pub(crate) fn registry(&self) -> &EndpointRegistry {
        &self.registry
    }

    pub(crate) fn logout_token_validator(&self) -> Option<&LogoutTokenValidator> {
        self.logout_tokens.as_ref()
    }

    /// Persist the ticket of a completed sign in and return the session
    /// cookie to attach to the response. Issuance and expiry items are
    /// filled in when the host's OIDC handler did not set them.
    pub async fn sign_in(
        &self,
        mut ticket: AuthenticationTicket,
    ) -> Result<Cookie<'static>, SignInError> {
        let now = Utc::now();
        if ticket.issued().is_none() {
            ticket.set_issued(now);
        }
        if ticket.expires().is_none() {
            ticket.set_expires(now + Duration::seconds(self.options.session_lifetime_seconds));
        }

        let key = self.tickets.store(&ticket).await?;
        Ok(user::build_session_cookie(
            &self.options,
            self.protector.as_ref(),
            &key,
        )?)
    }

    /// Remove the server-side session of the request, if any, and return
    /// the removal cookie to attach to the response.
    pub async fn sign_out(&self, req: &HttpRequest) -> Cookie<'static> {
        if let Some(key) =
            user::session_key_from_request(req, &self.options, self.protector.as_ref())
        {
            if let Err(err) = self.tickets.remove(&key).await {
                log::warn!("failed to remove session {} on sign out: {}.", key, err);
            }
        }
        user::removal_session_cookie(&self.options)
    }
}

/// Builder for hosts and tests that inject their own stores, providers,
/// or options instead of the environment-driven [`BffContext::setup`].
#[derive(Default)]
pub struct BffContextBuilder {
    options: Option<BffOptions>,
    protector: Option<Arc<dyn DataProtector>>,
    sessions: Option<Arc<dyn SessionStore>>,
    cleanup: Option<Arc<dyn SessionStoreCleanup>>,
    revoker: Option<Arc<dyn RefreshTokenRevoker>>,
    client_tokens: Option<Arc<dyn ClientTokenProvider>>,
    logout_tokens: Option<LogoutTokenValidator>,
    endpoints: Vec<BffEndpoint>,
}

impl BffContextBuilder {
    pub fn with_options(mut self, options: BffOptions) -> Self {
        self.options = Some(options);
        self
    }

    pub fn with_protector(mut self, protector: Arc<dyn DataProtector>) -> Self {
        self.protector = Some(protector);
        self
    }

    pub fn with_session_store(mut self, sessions: Arc<dyn SessionStore>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn with_session_cleanup(mut self, cleanup: Arc<dyn SessionStoreCleanup>) -> Self {
        self.cleanup = Some(cleanup);
        self
    }

    pub fn with_refresh_token_revoker(mut self, revoker: Arc<dyn RefreshTokenRevoker>) -> Self {
        self.revoker = Some(revoker);
        self
    }

    pub fn with_client_token_provider(mut self, provider: Arc<dyn ClientTokenProvider>) -> Self {
        self.client_tokens = Some(provider);
        self
    }

    pub fn with_logout_token_validator(mut self, validator: LogoutTokenValidator) -> Self {
        self.logout_tokens = Some(validator);
        self
    }

    pub fn with_api_prefix(self, prefix: impl Into<String>) -> Self {
        self.with_endpoint(BffEndpoint::api(prefix))
    }

    pub fn with_ui_prefix(self, prefix: impl Into<String>) -> Self {
        self.with_endpoint(BffEndpoint::ui(prefix))
    }

    pub fn with_endpoint(mut self, endpoint: BffEndpoint) -> Self {
        self.endpoints.push(endpoint);
        self
    }

    pub fn build(self) -> Result<web::Data<BffContext>, OptionsError> {
        let options = self.options.unwrap_or_default();
        options.validate()?;

        let protector = self
            .protector
            .unwrap_or_else(|| Arc::new(AesGcmProtector::generate()));
        let (sessions, cleanup): (Arc<dyn SessionStore>, Option<Arc<dyn SessionStoreCleanup>>) =
            match self.sessions {
                Some(sessions) => (sessions, self.cleanup),
                None => {
                    let store =
                        Arc::new(InMemorySessionStore::new(options.application_name.clone()));
                    let cleanup = self
                        .cleanup
                        .unwrap_or_else(|| store.clone() as Arc<dyn SessionStoreCleanup>);
                    (store, Some(cleanup))
                }
            };

        let tickets: Arc<dyn TicketStore> = Arc::new(ServerTicketStore::new(
            sessions.clone(),
            protector.clone(),
            options.application_name.clone(),
        ));
        let tokens = Arc::new(SessionTokenStore::new(sessions.clone(), protector.clone()));
        let retriever = TokenRetriever::new(
            tokens.clone() as Arc<dyn UserTokenSource>,
            self.client_tokens,
        );
        let revocation = SessionRevocationService::new(
            tickets.clone(),
            sessions.clone(),
            self.revoker,
            options.revoke_refresh_token_on_logout,
            options.backchannel_logout_all_user_sessions,
        );
        let authentication: Arc<dyn AuthenticationService> = Arc::new(
            ApiAuthenticationService::new(Arc::new(RedirectAuthenticationService::new(&options))),
        );

        let mut registry = EndpointRegistry::default();
        for endpoint in self.endpoints {
            registry.add(endpoint);
        }

        Ok(web::Data::new(BffContext {
            options,
            protector,
            sessions,
            cleanup,
            tickets,
            tokens,
            retriever,
            revocation,
            authentication,
            registry,
            logout_tokens: self.logout_tokens,
        }))
    }
}
