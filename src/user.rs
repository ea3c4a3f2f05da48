use crate::{
    context::BffContext,
    middleware::request_url,
    options::BffOptions,
    ticket::{AuthenticationTicket, DataProtector, ProtectionError},
};
use actix_web::{
    cookie::{time::Duration as CookieDuration, Cookie, SameSite},
    dev::Payload,
    http::{header, StatusCode},
    web::Data,
    FromRequest, HttpMessage, HttpRequest, HttpResponse, ResponseError,
};
use chrono::{Duration, Utc};
use futures_util::future::LocalBoxFuture;
use std::rc::Rc;
use thiserror::Error;

/// Request-scoped view of the authenticated session. Extracting it
/// requires a valid session; failure produces the composed challenge
/// response (a redirect for UI endpoints, 401 for API endpoints through
/// the decorator). Use `Option<AuthenticatedSession>` for endpoints that
/// tolerate anonymous callers.
#[derive(Clone, Debug)]
pub struct AuthenticatedSession {
    /// The server-side session key the cookie resolves to.
    pub key: String,
    pub ticket: Rc<AuthenticationTicket>,
}

impl AuthenticatedSession {
    pub fn subject_id(&self) -> Option<&str> {
        self.ticket.principal.subject_id()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.ticket.principal.session_id()
    }
}

/// Hand-off between extraction and the response path: when sliding
/// renewal extends a session, the rebuilt cookie rides the request
/// extensions until the `Bff` middleware attaches it to the outgoing
/// response.
#[derive(Clone)]
pub(crate) struct RenewedSessionCookie(pub(crate) Cookie<'static>);

/// The session cookie stores only the protected session key; the ticket
/// itself never leaves the server.
pub(crate) fn build_session_cookie(
    options: &BffOptions,
    protector: &dyn DataProtector,
    key: &str,
) -> Result<Cookie<'static>, ProtectionError> {
    let value = protector.protect(key)?;
    Ok(Cookie::build(options.cookie_name.clone(), value)
        .http_only(true)
        .secure(true)
        .same_site(SameSite::Lax)
        .path("/")
        .max_age(CookieDuration::seconds(options.session_lifetime_seconds))
        .finish())
}

// Attributes mirror `build_session_cookie`: a `__Host-` prefixed cookie
// is only accepted for removal with Secure and Path=/.
pub(crate) fn removal_session_cookie(options: &BffOptions) -> Cookie<'static> {
    let mut cookie = Cookie::build(options.cookie_name.clone(), "")
        .http_only(true)
        .secure(true)
        .same_site(SameSite::Lax)
        .path("/")
        .finish();
    cookie.make_removal();
    cookie
}

pub(crate) fn session_key_from_request(
    req: &HttpRequest,
    options: &BffOptions,
    protector: &dyn DataProtector,
) -> Option<String> {
    let cookie = req.cookie(options.cookie_name.as_str())?;
    match protector.unprotect(cookie.value()) {
        Ok(key) => Some(key),
        Err(err) => {
            log::debug!("session cookie failed to unprotect: {}.", err);
            None
        }
    }
}

/// Resolve the request's session: cookie, ticket retrieval, expiry check
/// and sliding renewal. Cached in request extensions so repeated
/// extraction within one request hits storage once.
pub(crate) async fn load_session(
    ctx: &BffContext,
    req: &HttpRequest,
) -> Option<AuthenticatedSession> {
    if let Some(session) = req.extensions().get::<AuthenticatedSession>() {
        return Some(session.clone());
    }

    let key = session_key_from_request(req, ctx.options(), ctx.protector())?;
    let mut ticket = match ctx.ticket_store().retrieve(&key).await {
        Ok(Some(ticket)) => ticket,
        Ok(None) => return None,
        Err(err) => {
            log::warn!("failed to retrieve session {}: {}.", key, err);
            return None;
        }
    };

    let now = Utc::now();
    if let Some(expires) = ticket.expires() {
        if expires <= now {
            log::debug!("session {} expired, removing.", key);
            if let Err(err) = ctx.ticket_store().remove(&key).await {
                log::warn!("failed to remove expired session {}: {}.", key, err);
            }
            return None;
        }

        // Slide once less than half the configured lifetime remains. The
        // cookie's Max-Age must slide with the record or the browser
        // drops it at the original deadline.
        if ctx.options().sliding_expiration {
            let lifetime = Duration::seconds(ctx.options().session_lifetime_seconds);
            if expires - now < lifetime / 2 {
                ticket.set_expires(now + lifetime);
                match ctx.ticket_store().renew(&key, &ticket).await {
                    Ok(()) => match build_session_cookie(ctx.options(), ctx.protector(), &key) {
                        Ok(cookie) => {
                            req.extensions_mut().insert(RenewedSessionCookie(cookie));
                        }
                        Err(err) => {
                            log::warn!("failed to rebuild session cookie {}: {}.", key, err);
                        }
                    },
                    Err(err) => log::warn!("failed to renew session {}: {}.", key, err),
                }
            }
        }
    }

    let session = AuthenticatedSession {
        key,
        ticket: Rc::new(ticket),
    };
    req.extensions_mut().insert(session.clone());
    Some(session)
}

#[derive(Error, Debug)]
pub enum SessionResponseError {
    #[error("Bff context missing in app data. Make sure it is registered.")]
    ContextMissing,
    #[error("Authentication required.")]
    Challenge {
        status: StatusCode,
        location: Option<String>,
    },
}

impl ResponseError for SessionResponseError {
    fn status_code(&self) -> StatusCode {
        match self {
            SessionResponseError::ContextMissing => StatusCode::INTERNAL_SERVER_ERROR,
            SessionResponseError::Challenge { status, .. } => *status,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let mut builder = HttpResponse::build(self.status_code());
        if let SessionResponseError::Challenge {
            location: Some(location),
            ..
        } = self
        {
            builder.insert_header((header::LOCATION, location.clone()));
        }
        builder.finish()
    }
}

impl SessionResponseError {
    /// Fold the composed challenge response into an extractor error so
    /// actix can materialize it outside the handler.
    fn from_challenge(response: HttpResponse) -> Self {
        let location = response
            .headers()
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        SessionResponseError::Challenge {
            status: response.status(),
            location,
        }
    }
}

impl FromRequest for AuthenticatedSession {
    type Error = SessionResponseError;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        let req = req.clone();
        Box::pin(async move {
            let ctx = match req.app_data::<Data<BffContext>>() {
                Some(ctx) => ctx.clone(),
                None => return Err(SessionResponseError::ContextMissing),
            };

            if let Some(session) = load_session(&ctx, &req).await {
                return Ok(session);
            }

            let challenge = ctx.authentication().challenge(&req, &request_url(&req));
            Err(SessionResponseError::from_challenge(challenge))
        })
    }
}
