pub(crate) const ENCRYPTION_KEY: &str = "ENCRYPTION_KEY";

pub(crate) const AUTHORITY: &str = "AUTHORITY";
pub(crate) const CLIENT_ID: &str = "CLIENT_ID";
pub(crate) const CLIENT_SECRET: &str = "CLIENT_SECRET";

pub(crate) const APPLICATION_NAME: &str = "BFF_APPLICATION_NAME";
pub(crate) const SESSION_COOKIE_NAME: &str = "BFF_SESSION_COOKIE_NAME";
pub(crate) const SESSION_LIFETIME_SECONDS: &str = "BFF_SESSION_LIFETIME_SECONDS";
pub(crate) const OIDC_SIGN_IN_PATH: &str = "BFF_OIDC_SIGN_IN_PATH";

/// Comma seperated list of path prefixes treated as BFF API endpoints.
pub(crate) const API_PREFIXES: &str = "BFF_API_PREFIXES";
/// Comma seperated list of path prefixes treated as BFF UI endpoints.
pub(crate) const UI_PREFIXES: &str = "BFF_UI_PREFIXES";
