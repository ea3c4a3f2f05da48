use crate::env_var;
use std::env;
use thiserror::Error;

/// How `GET /bff/user` answers when no session is present.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AnonymousSessionResponse {
    /// Respond with `401 Unauthorized`.
    Unauthorized,
    /// Respond with `200 OK` and a literal `null` JSON body.
    Null,
}

#[derive(Error, Debug)]
pub enum OptionsError {
    #[error("{0} must not be empty.")]
    EmptyValue(&'static str),
    #[error("session lifetime must be positive, got {0}.")]
    NonPositiveLifetime(i64),
}

/// Configuration for the BFF session and token subsystem.
///
/// Validation happens once at composition through [`BffOptions::validate`],
/// before any request is served.
#[derive(Clone, Debug)]
pub struct BffOptions {
    /// Multi-tenant partition key stamped on every session record.
    pub application_name: Option<String>,
    /// Name of the cookie carrying the protected session key.
    pub cookie_name: String,
    pub session_lifetime_seconds: i64,
    /// When set, the session expiry slides forward on use.
    pub sliding_expiration: bool,
    pub antiforgery_header_name: String,
    pub antiforgery_header_value: String,
    /// Local path that starts the host's OIDC sign in.
    pub oidc_sign_in_path: String,
    pub access_denied_path: String,
    pub revoke_refresh_token_on_logout: bool,
    /// When set, a backchannel logout removes every session of the subject,
    /// not only the one carrying the logout token's `sid`.
    pub backchannel_logout_all_user_sessions: bool,
    pub anonymous_session_response: AnonymousSessionResponse,
    pub enable_diagnostics: bool,
}

impl Default for BffOptions {
    fn default() -> Self {
        Self {
            application_name: None,
            cookie_name: Self::DEFAULT_COOKIE_NAME.to_string(),
            session_lifetime_seconds: Self::DEFAULT_SESSION_LIFETIME_SECONDS,
            sliding_expiration: true,
            antiforgery_header_name: Self::DEFAULT_ANTIFORGERY_HEADER_NAME.to_string(),
            antiforgery_header_value: Self::DEFAULT_ANTIFORGERY_HEADER_VALUE.to_string(),
            oidc_sign_in_path: Self::DEFAULT_OIDC_SIGN_IN_PATH.to_string(),
            access_denied_path: Self::DEFAULT_ACCESS_DENIED_PATH.to_string(),
            revoke_refresh_token_on_logout: true,
            backchannel_logout_all_user_sessions: false,
            anonymous_session_response: AnonymousSessionResponse::Unauthorized,
            enable_diagnostics: false,
        }
    }
}

impl BffOptions {
    const DEFAULT_COOKIE_NAME: &'static str = "__Host-bff";
    const DEFAULT_SESSION_LIFETIME_SECONDS: i64 = 60 * 60 * 8;
    const DEFAULT_ANTIFORGERY_HEADER_NAME: &'static str = "X-CSRF";
    const DEFAULT_ANTIFORGERY_HEADER_VALUE: &'static str = "1";
    const DEFAULT_OIDC_SIGN_IN_PATH: &'static str = "/auth/login";
    const DEFAULT_ACCESS_DENIED_PATH: &'static str = "/access-denied";

    pub fn from_env() -> Self {
        let mut options = Self::default();

        if let Ok(name) = env::var(env_var::APPLICATION_NAME) {
            options.application_name = Some(name);
        }
        if let Ok(name) = env::var(env_var::SESSION_COOKIE_NAME) {
            options.cookie_name = name;
        }
        if let Some(lifetime) = env::var(env_var::SESSION_LIFETIME_SECONDS)
            .ok()
            .and_then(|e| e.parse::<i64>().ok())
        {
            options.session_lifetime_seconds = lifetime;
        }
        if let Ok(path) = env::var(env_var::OIDC_SIGN_IN_PATH) {
            options.oidc_sign_in_path = path;
        }

        options
    }

    /// One time composition-phase check. Call before serving requests.
    pub fn validate(&self) -> Result<(), OptionsError> {
        if self.cookie_name.is_empty() {
            return Err(OptionsError::EmptyValue("cookie name"));
        }
        if self.antiforgery_header_name.is_empty() {
            return Err(OptionsError::EmptyValue("antiforgery header name"));
        }
        if self.antiforgery_header_value.is_empty() {
            return Err(OptionsError::EmptyValue("antiforgery header value"));
        }
        if self.session_lifetime_seconds <= 0 {
            return Err(OptionsError::NonPositiveLifetime(
                self.session_lifetime_seconds,
            ));
        }
        Ok(())
    }
}
