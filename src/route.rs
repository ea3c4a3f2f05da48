use actix_web::{get, http::header, post, web, HttpRequest, HttpResponse, HttpResponseBuilder};
use chrono::Utc;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    context::BffContext,
    middleware::marker_present,
    options::AnonymousSessionResponse,
    session::UserSessionsFilter,
    user::load_session,
};

pub(crate) const BFF_SCOPE: &str = "/bff";
pub(crate) const LOGIN_PATH: &str = "/bff/login";
pub(crate) const SILENT_LOGIN_PATH: &str = "/bff/silent-login";
pub(crate) const SILENT_LOGIN_CALLBACK_PATH: &str = "/bff/silent-login-callback";
pub(crate) const LOGOUT_PATH: &str = "/bff/logout";
pub(crate) const USER_PATH: &str = "/bff/user";
pub(crate) const BACKCHANNEL_PATH: &str = "/bff/backchannel";
pub(crate) const DIAGNOSTICS_PATH: &str = "/bff/diagnostics";

/// Management claims overlaid on the `/bff/user` response.
const CLAIM_LOGOUT_URL: &str = "bff:logout_url";
const CLAIM_SESSION_EXPIRES_IN: &str = "bff:session_expires_in";
const CLAIM_SESSION_STATE: &str = "bff:session_state";

#[derive(Deserialize)]
pub(crate) struct LoginParams {
    #[serde(rename = "returnUrl")]
    return_url: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct LogoutParams {
    sid: Option<String>,
    #[serde(rename = "returnUrl")]
    return_url: Option<String>,
}

#[derive(Deserialize)]
pub(crate) struct BackchannelForm {
    logout_token: String,
}

#[derive(Serialize)]
struct ClaimView {
    #[serde(rename = "type")]
    claim_type: String,
    value: Value,
}

/// Registers the management endpoints under the `/bff` scope.
///
/// The [`crate::middleware::Bff`] middleware must be wrapped around the app;
/// every handler refuses to serve without it.
pub fn bff_web_configurations(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope(BFF_SCOPE)
            .service(login)
            .service(silent_login)
            .service(silent_login_callback)
            .service(logout)
            .service(user_info)
            .service(backchannel)
            .service(diagnostics),
    );
}

fn missing_middleware(req: &HttpRequest) -> Option<HttpResponse> {
    if marker_present(req) {
        None
    } else {
        Some(HttpResponse::InternalServerError().body("Missing Bff middleware registration"))
    }
}

/// A return URL is accepted only when it is a local path: one leading
/// slash, so protocol-relative `//host` URLs are rejected as well.
fn local_return_url(raw: Option<&str>) -> Option<String> {
    match raw {
        None => Some("/".to_string()),
        Some(url) if url.starts_with('/') && !url.starts_with("//") => Some(url.to_string()),
        Some(_) => None,
    }
}

fn no_cache(mut builder: HttpResponseBuilder) -> HttpResponseBuilder {
    builder.insert_header((header::CACHE_CONTROL, "no-store, no-cache, max-age=0"));
    builder.insert_header((header::PRAGMA, "no-cache"));
    builder
}

#[get("/login")]
pub(crate) async fn login(
    req: HttpRequest,
    params: web::Query<LoginParams>,
    ctx: web::Data<BffContext>,
) -> HttpResponse {
    if let Some(response) = missing_middleware(&req) {
        return response;
    }

    let return_url = match local_return_url(params.return_url.as_deref()) {
        Some(return_url) => return_url,
        None => return HttpResponse::BadRequest().body("returnUrl must be a local path."),
    };

    ctx.authentication().challenge(&req, &return_url)
}

#[get("/silent-login")]
pub(crate) async fn silent_login(req: HttpRequest, ctx: web::Data<BffContext>) -> HttpResponse {
    if let Some(response) = missing_middleware(&req) {
        return response;
    }

    let mut response = ctx
        .authentication()
        .challenge(&req, SILENT_LOGIN_CALLBACK_PATH);

    // No user interaction: the provider must answer immediately, the
    // callback page reports the outcome to the opening frame.
    let location = response
        .headers()
        .get(header::LOCATION)
        .and_then(|v| v.to_str().ok())
        .map(|location| format!("{}&prompt=none", location));
    if let Some(location) = location {
        if let Ok(value) = header::HeaderValue::from_str(&location) {
            response.headers_mut().insert(header::LOCATION, value);
        }
    }

    response
}

#[get("/silent-login-callback")]
pub(crate) async fn silent_login_callback(
    req: HttpRequest,
    ctx: web::Data<BffContext>,
) -> HttpResponse {
    if let Some(response) = missing_middleware(&req) {
        return response;
    }

    let is_logged_in = load_session(&ctx, &req).await.is_some();
    let body = format!(
        "<!DOCTYPE html>\n<html>\n<body>\n<script>\n  window.parent.postMessage({{ source: \"bff-silent-login\", isLoggedIn: {} }}, window.location.origin);\n</script>\n</body>\n</html>\n",
        is_logged_in
    );

    no_cache(HttpResponse::Ok())
        .content_type("text/html; charset=utf-8")
        .body(body)
}

#[get("/logout")]
pub(crate) async fn logout(
    req: HttpRequest,
    params: web::Query<LogoutParams>,
    ctx: web::Data<BffContext>,
) -> HttpResponse {
    if let Some(response) = missing_middleware(&req) {
        return response;
    }

    let return_url = match local_return_url(params.return_url.as_deref()) {
        Some(return_url) => return_url,
        None => return HttpResponse::BadRequest().body("returnUrl must be a local path."),
    };

    if let Some(session) = load_session(&ctx, &req).await {
        // Logout links are forgeable; a session bound to an upstream sid
        // only goes away when the caller proves it knows that sid.
        match session.session_id() {
            Some(session_sid) => {
                if params.sid.as_deref() != Some(session_sid) {
                    return HttpResponse::BadRequest().body("sid is missing or does not match.");
                }

                let filter = UserSessionsFilter::new(
                    session.subject_id().map(|s| s.to_string()),
                    Some(session_sid.to_string()),
                );
                if let Err(err) = ctx.revocation().revoke_sessions(filter).await {
                    log::warn!("session revocation on logout failed: {}.", err);
                }
            }
            None => {
                // Without a sid there is no filter that addresses only
                // this record; a subject-wide filter would log the user
                // out everywhere. Revoke this ticket's refresh token and
                // leave removal to the key-based sign out below.
                ctx.revocation().revoke_refresh_token(&session.ticket).await;
            }
        }
    }

    let removal_cookie = ctx.sign_out(&req).await;
    HttpResponse::Found()
        .cookie(removal_cookie)
        .insert_header((header::LOCATION, return_url))
        .finish()
}

#[get("/user")]
pub(crate) async fn user_info(req: HttpRequest, ctx: web::Data<BffContext>) -> HttpResponse {
    if let Some(response) = missing_middleware(&req) {
        return response;
    }

    let session = match load_session(&ctx, &req).await {
        Some(session) => session,
        None => {
            return match ctx.options().anonymous_session_response {
                AnonymousSessionResponse::Unauthorized => {
                    no_cache(HttpResponse::Unauthorized()).finish()
                }
                AnonymousSessionResponse::Null => no_cache(HttpResponse::Ok()).json(Value::Null),
            }
        }
    };

    let mut management = vec![ClaimView {
        claim_type: CLAIM_LOGOUT_URL.to_string(),
        value: Value::String(match session.session_id() {
            Some(sid) => format!(
                "{}?sid={}",
                LOGOUT_PATH,
                utf8_percent_encode(sid, NON_ALPHANUMERIC)
            ),
            None => LOGOUT_PATH.to_string(),
        }),
    }];
    if let Some(expires) = session.ticket.expires() {
        management.push(ClaimView {
            claim_type: CLAIM_SESSION_EXPIRES_IN.to_string(),
            value: Value::from((expires - Utc::now()).num_seconds()),
        });
    }
    if let Some(session_state) = session.ticket.session_state() {
        management.push(ClaimView {
            claim_type: CLAIM_SESSION_STATE.to_string(),
            value: Value::String(session_state.to_string()),
        });
    }

    let mut claims: Vec<ClaimView> = session
        .ticket
        .principal
        .claims
        .iter()
        .filter(|c| management.iter().all(|m| m.claim_type != c.claim_type))
        .map(|c| ClaimView {
            claim_type: c.claim_type.clone(),
            value: Value::String(c.value.clone()),
        })
        .collect();
    claims.extend(management);

    no_cache(HttpResponse::Ok()).json(claims)
}

#[post("/backchannel")]
pub(crate) async fn backchannel(
    req: HttpRequest,
    form: web::Form<BackchannelForm>,
    ctx: web::Data<BffContext>,
) -> HttpResponse {
    if let Some(response) = missing_middleware(&req) {
        return response;
    }

    // The identity provider is the caller; failure detail goes to logs
    // only and the body stays empty.
    let validator = match ctx.logout_token_validator() {
        Some(validator) => validator,
        None => {
            log::warn!("backchannel logout received but no logout token validator is configured.");
            return HttpResponse::BadRequest().finish();
        }
    };

    let notification = match validator.validate(&form.logout_token) {
        Ok(notification) => notification,
        Err(err) => {
            log::warn!("logout token rejected: {}.", err);
            return HttpResponse::BadRequest().finish();
        }
    };

    let filter = UserSessionsFilter::new(notification.subject_id, notification.session_id);
    if let Err(err) = ctx.revocation().revoke_sessions(filter).await {
        log::warn!("backchannel session revocation failed: {}.", err);
        return HttpResponse::BadRequest().finish();
    }

    no_cache(HttpResponse::Ok()).finish()
}

#[get("/diagnostics")]
pub(crate) async fn diagnostics(req: HttpRequest, ctx: web::Data<BffContext>) -> HttpResponse {
    if let Some(response) = missing_middleware(&req) {
        return response;
    }

    if !ctx.options().enable_diagnostics {
        return HttpResponse::NotFound().finish();
    }

    match load_session(&ctx, &req).await {
        Some(session) => no_cache(HttpResponse::Ok()).json(serde_json::json!({
            "scheme": session.ticket.scheme,
            "claims": session.ticket.principal.claims,
            "properties": session.ticket.properties,
        })),
        None => no_cache(HttpResponse::Ok()).json(Value::Null),
    }
}
