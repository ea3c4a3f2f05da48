use actix_bff::{
    context::BffContext,
    middleware::Bff,
    route,
    sweep::SessionCleanupHost,
    token::{TokenRequirement, TokenType},
    user::AuthenticatedSession,
};
use actix_web::{get, web, App, HttpResponse, HttpServer, Responder};
use dotenv::dotenv;
use env_logger::Env;

#[get("/api/orders")]
async fn orders(session: AuthenticatedSession, bff: web::Data<BffContext>) -> impl Responder {
    // Which access token should an outgoing call on behalf of this
    // session carry?
    let token = bff
        .token_retriever()
        .access_token_for(
            &session.ticket.principal,
            TokenRequirement::required(TokenType::User),
        )
        .await;
    println!("{:?}", token);

    HttpResponse::Ok().body(format!("orders for {:?}", session.subject_id()))
}

#[get("/app/home")]
async fn home(session: Option<AuthenticatedSession>) -> impl Responder {
    match session {
        Some(session) => HttpResponse::Ok().body(format!("hello {:?}", session.subject_id())),
        None => HttpResponse::Ok().body("hello anonymous"),
    }
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
            // Register the context as app data, making it available for middleware.
            .app_data(bff.clone())
            // Register the management endpoints under /bff.
            .configure(route::bff_web_configurations)
            // Classify endpoints and enforce the antiforgery header.
            .wrap(Bff::new())
            .service(orders)
            .service(home)
    })
    .bind(("127.0.0.1", 8123))?
    .run()
    .await
}
