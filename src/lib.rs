#![allow(rustdoc::invalid_rust_codeblocks)]
#![doc = r#"
# actix-bff

Server-side session and token handling for a Backend For Frontend (BFF) security gateway on the [Actix web framework](https://actix.rs). Authentication tickets, access and refresh tokens never leave the server; the browser only ever holds an opaque, encrypted session cookie.

What the crate covers:

- A pluggable session store (`SessionStore`) with an in-memory implementation, keyed by a random server-side session key and queryable by subject and upstream session id.
- Encrypted, versioned ticket serialization (`AES-256-GCM`) so session records stay opaque to the storage backend.
- Token storage and retrieval per session, including Bearer/DPoP classification and optional client-credentials fallback.
- Session revocation, OIDC backchannel logout, and a periodic expiry sweep.
- The `Bff` middleware (endpoint classification, antiforgery header enforcement) and the `/bff` management endpoints (login, silent login, logout, user, backchannel, diagnostics).

# Getting started

```rust,ignore
use actix_bff::{
    context::BffContext, middleware::Bff, route, sweep::SessionCleanupHost,
    user::AuthenticatedSession,
};
use actix_web::{get, App, HttpResponse, HttpServer, Responder};
use dotenv::dotenv;
use env_logger::Env;

#[get("/api/orders")]
async fn orders(session: AuthenticatedSession) -> impl Responder {
    HttpResponse::Ok().body(format!("orders for {:?}", session.subject_id()))
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv().ok();

    env_logger::init_from_env(Env::default().default_filter_or("info"));

    // Initialize the BFF context (options, stores, identity provider).
    let bff = BffContext::setup().await?;

    // Bind the expiry sweep to the application lifetime.
    let _cleanup = bff
        .session_cleanup()
        .cloned()
        .map(|store| SessionCleanupHost::with_defaults(store).start());

    HttpServer::new(move || {
        App::new()
            // Register the context as app data such that it is available for middleware.
            .app_data(bff.clone())
            // Register the management endpoints under /bff.
            .configure(route::bff_web_configurations)
            // Classify endpoints and enforce the antiforgery header.
            .wrap(Bff::new())
            .service(orders)
    })
    .bind(("127.0.0.1", 8123))?
    .run()
    .await
}
```

## Sessions

A completed sign in is persisted with [`context::BffContext::sign_in`], which returns the session cookie to attach to the response. From then on the [`user::AuthenticatedSession`] extractor resolves the cookie back to the stored authentication ticket; unauthenticated callers are challenged with a redirect on UI endpoints and a plain `401` on API endpoints.

```rust,ignore
#[get("/api/orders")]
async fn orders(session: AuthenticatedSession) -> impl Responder {
    println!("{:?}", session.ticket.principal.claims);

    HttpResponse::Ok().body("Hey there!")
}
```

Use `Option<AuthenticatedSession>` for endpoints that tolerate anonymous callers.

## Tokens

Tokens live inside the stored ticket. [`context::BffContext::token_retriever`] answers "which access token should this outgoing request carry" as a [`token::AccessTokenResult`]: `Bearer`, `DPoP` (with the bound proof key), `NoToken`, or an error when a usable token was required but is not there.
"#]

pub mod backchannel;
pub mod context;
pub(crate) mod env_var;
pub mod middleware;
pub mod options;
pub mod provider;
pub mod revocation;
pub mod route;
pub mod session;
pub mod sweep;
pub mod ticket;
pub mod ticket_store;
pub mod token;
pub mod user;

pub(crate) const CLAIM_SUB: &str = "sub";
pub(crate) const CLAIM_SID: &str = "sid";
