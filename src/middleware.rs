use crate::{context::BffContext, options::BffOptions, route, user::RenewedSessionCookie};
use actix_web::{
    body::EitherBody,
    dev::{forward_ready, Service, ServiceRequest, ServiceResponse, Transform},
    http::{header, StatusCode},
    web::Data,
    Error, HttpMessage, HttpRequest, HttpResponse,
};
use futures_util::future::LocalBoxFuture;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use std::{
    future::{ready, Ready},
    rc::Rc,
    sync::Arc,
};

/// Classification attached to each route prefix at registration time,
/// resolved once per request instead of per-request metadata reflection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndpointKind {
    /// Called by browser scripts; expects API semantics (status codes).
    Api,
    /// Navigated to by the browser; expects redirect semantics.
    Ui,
    /// The crate's own management endpoints under `/bff`.
    Management,
}

#[derive(Clone, Debug)]
pub struct BffEndpoint {
    pub prefix: String,
    pub kind: EndpointKind,
    pub require_antiforgery: bool,
    /// When set, the authentication decorator leaves the framework's
    /// redirect responses untouched for this endpoint.
    pub skip_response_handling: bool,
}

impl BffEndpoint {
    pub fn api(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            kind: EndpointKind::Api,
            require_antiforgery: true,
            skip_response_handling: false,
        }
    }

    pub fn ui(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            kind: EndpointKind::Ui,
            require_antiforgery: false,
            skip_response_handling: false,
        }
    }

    fn management(prefix: impl Into<String>, require_antiforgery: bool) -> Self {
        Self {
            prefix: prefix.into(),
            kind: EndpointKind::Management,
            require_antiforgery,
            skip_response_handling: false,
        }
    }

    pub fn with_antiforgery(mut self, require_antiforgery: bool) -> Self {
        self.require_antiforgery = require_antiforgery;
        self
    }

    pub fn with_skip_response_handling(mut self, skip: bool) -> Self {
        self.skip_response_handling = skip;
        self
    }
}

/// Prefix-based endpoint classification, built at composition time.
/// Longest prefix wins on resolution.
#[derive(Clone, Debug)]
pub struct EndpointRegistry {
    endpoints: Vec<BffEndpoint>,
}

impl Default for EndpointRegistry {
    fn default() -> Self {
        let mut registry = Self {
            endpoints: Vec::new(),
        };
        // The user endpoint is script-facing, so it is the only
        // management endpoint behind the antiforgery header. The
        // backchannel endpoint is called by the identity provider and the
        // rest are browser navigations.
        registry.add(BffEndpoint::management(route::USER_PATH, true));
        registry.add(BffEndpoint::management(route::LOGIN_PATH, false));
        registry.add(BffEndpoint::management(route::SILENT_LOGIN_PATH, false));
        registry.add(BffEndpoint::management(
            route::SILENT_LOGIN_CALLBACK_PATH,
            false,
        ));
        registry.add(BffEndpoint::management(route::LOGOUT_PATH, false));
        registry.add(BffEndpoint::management(route::BACKCHANNEL_PATH, false));
        registry.add(BffEndpoint::management(route::DIAGNOSTICS_PATH, false));
        registry
    }
}

impl EndpointRegistry {
    pub fn add(&mut self, endpoint: BffEndpoint) {
        self.endpoints.push(endpoint);
        self.endpoints
            .sort_by(|a, b| b.prefix.len().cmp(&a.prefix.len()));
    }

    pub fn resolve(&self, path: &str) -> Option<&BffEndpoint> {
        self.endpoints
            .iter()
            .find(|e| Self::prefix_matches(path, e.prefix.as_str()))
    }

    // A prefix only matches on a path segment boundary: "/api" covers
    // "/api" and "/api/data" but not "/apiary".
    fn prefix_matches(path: &str, prefix: &str) -> bool {
        match path.strip_prefix(prefix) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }
}

/// Request-extension marker proving the [`Bff`] middleware ran. The
/// management endpoints refuse to serve without it.
#[derive(Clone, Copy, Debug)]
pub(crate) struct BffRequestMarker;

pub(crate) fn marker_present(req: &HttpRequest) -> bool {
    req.extensions().get::<BffRequestMarker>().is_some()
}

/// Request-time middleware: marks BFF endpoints, enforces the antiforgery
/// header on them, and logs likely misuse of UI endpoints by scripts.
pub struct Bff;

impl Bff {
    pub fn new() -> Self {
        Self
    }
}

impl Default for Bff {
    fn default() -> Self {
        Self::new()
    }
}

impl<S, B> Transform<S, ServiceRequest> for Bff
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type InitError = ();
    type Transform = BffMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(BffMiddleware {
            service: Rc::new(service),
        }))
    }
}

pub struct BffMiddleware<S> {
    service: Rc<S>,
}

impl<S> BffMiddleware<S> {
    fn antiforgery_matches(req: &HttpRequest, options: &BffOptions) -> bool {
        req.headers()
            .get(options.antiforgery_header_name.as_str())
            .and_then(|v| v.to_str().ok())
            .map(|v| v == options.antiforgery_header_value)
            .unwrap_or(false)
    }

    fn looks_like_ajax(req: &HttpRequest) -> bool {
        let cors_fetch_mode = req
            .headers()
            .get("Sec-Fetch-Mode")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.eq_ignore_ascii_case("cors"))
            .unwrap_or(false);
        cors_fetch_mode || req.headers().contains_key("X-Requested-With")
    }
}

impl<S, B> Service<ServiceRequest> for BffMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = Rc::clone(&self.service);

        let ctx = match req.app_data::<Data<BffContext>>() {
            Some(ctx) => ctx.clone(),
            None => {
                return Box::pin(ready(Ok(req
                    .into_response(
                        HttpResponse::InternalServerError().body("Missing Bff configurations"),
                    )
                    .map_into_right_body())));
            }
        };

        if let Some(endpoint) = ctx.registry().resolve(req.path()).cloned() {
            req.extensions_mut().insert(BffRequestMarker);

            if endpoint.require_antiforgery
                && !Self::antiforgery_matches(req.request(), ctx.options())
            {
                log::debug!(
                    "antiforgery header missing or mismatched on {}.",
                    req.path()
                );
                return Box::pin(ready(Ok(req
                    .into_response(HttpResponse::Unauthorized().finish())
                    .map_into_right_body())));
            }

            if endpoint.kind == EndpointKind::Ui && Self::looks_like_ajax(req.request()) {
                log::warn!(
                    "UI endpoint {} received an AJAX-style request; this is likely misuse.",
                    req.path()
                );
            }

            req.extensions_mut().insert(endpoint);
        }

        Box::pin(async move {
            let mut res = service.call(req).await?;

            // Sliding renewal extends the server-side record during
            // extraction; the refreshed cookie rides the request
            // extensions until it can be attached here.
            let renewed = res
                .request()
                .extensions()
                .get::<RenewedSessionCookie>()
                .cloned();
            if let Some(RenewedSessionCookie(cookie)) = renewed {
                if let Err(err) = res.response_mut().add_cookie(&cookie) {
                    log::warn!("failed to attach renewed session cookie: {}.", err);
                }
            }

            Ok(res.map_into_left_body())
        })
    }
}

/// Full URL of the current request, used as the `returnUrl` when a
/// challenge is issued mid-request.
pub(crate) fn request_url(req: &HttpRequest) -> String {
    let connection_info = req.connection_info();
    let scheme = connection_info.scheme();
    let host = connection_info.host();

    let path = req.uri().path();
    let query = req.uri().query().unwrap_or("");

    if query.is_empty() {
        format!("{}://{}{}", scheme, host, path)
    } else {
        format!("{}://{}{}?{}", scheme, host, path, query)
    }
}

/// Challenge/forbid seam of the request pipeline. The base implementation
/// produces the framework's redirect semantics; [`ApiAuthenticationService`]
/// decorates it with API semantics for BFF API endpoints.
pub trait AuthenticationService: Send + Sync {
    /// `return_url` is where the browser lands after sign in; it is
    /// percent encoded into the redirect.
    fn challenge(&self, req: &HttpRequest, return_url: &str) -> HttpResponse;
    fn forbid(&self, req: &HttpRequest) -> HttpResponse;
}

pub struct RedirectAuthenticationService {
    oidc_sign_in_path: String,
    access_denied_path: String,
}

impl RedirectAuthenticationService {
    pub fn new(options: &BffOptions) -> Self {
        Self {
            oidc_sign_in_path: options.oidc_sign_in_path.clone(),
            access_denied_path: options.access_denied_path.clone(),
        }
    }
}

impl AuthenticationService for RedirectAuthenticationService {
    fn challenge(&self, _req: &HttpRequest, return_url: &str) -> HttpResponse {
        let encoded = utf8_percent_encode(return_url, NON_ALPHANUMERIC).to_string();
        HttpResponse::Found()
            .insert_header((
                header::LOCATION,
                format!("{}?returnUrl={}", self.oidc_sign_in_path, encoded),
            ))
            .finish()
    }

    fn forbid(&self, _req: &HttpRequest) -> HttpResponse {
        HttpResponse::Found()
            .insert_header((header::LOCATION, self.access_denied_path.clone()))
            .finish()
    }
}

/// Constructor-injected wrapper around the concrete authentication
/// service. After the inner service produces its redirect, rewrites the
/// response to 401 (challenge) or 403 (forbid) for BFF API endpoints,
/// stripping `Location` and `Set-Cookie`: script callers expect status
/// codes, not redirect-based web-page semantics.
pub struct ApiAuthenticationService {
    inner: Arc<dyn AuthenticationService>,
}

impl ApiAuthenticationService {
    pub fn new(inner: Arc<dyn AuthenticationService>) -> Self {
        Self { inner }
    }

    fn handles(req: &HttpRequest) -> bool {
        req.extensions()
            .get::<BffEndpoint>()
            .map(|e| e.kind == EndpointKind::Api && !e.skip_response_handling)
            .unwrap_or(false)
    }

    fn rewrite(req: &HttpRequest, mut response: HttpResponse, status: StatusCode) -> HttpResponse {
        if !response.status().is_redirection() || !Self::handles(req) {
            return response;
        }
        *response.status_mut() = status;
        response.headers_mut().remove(header::LOCATION);
        response.headers_mut().remove(header::SET_COOKIE);
        response
    }
}

impl AuthenticationService for ApiAuthenticationService {
    fn challenge(&self, req: &HttpRequest, return_url: &str) -> HttpResponse {
        let response = self.inner.challenge(req, return_url);
        Self::rewrite(req, response, StatusCode::UNAUTHORIZED)
    }

    fn forbid(&self, req: &HttpRequest) -> HttpResponse {
        let response = self.inner.forbid(req);
        Self::rewrite(req, response, StatusCode::FORBIDDEN)
    }
}
