use crate::{env_var, session::UserSession, CLAIM_SID, CLAIM_SUB};
use aes_gcm::{
    aead::{Aead, OsRng},
    AeadCore, Aes256Gcm, Key, KeyInit, Nonce,
};
use chrono::{DateTime, SecondsFormat, Utc};
use hex::FromHexError;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, env, string::FromUtf8Error};
use thiserror::Error;

/// A single claim in the flat serializable principal form. The triple is
/// preserved exactly across storage round trips.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub claim_type: String,
    pub value: String,
    pub value_type: Option<String>,
}

impl Claim {
    pub fn new(claim_type: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            claim_type: claim_type.into(),
            value: value.into(),
            value_type: None,
        }
    }
}

/// Flat projection of an authenticated principal, decoupled from any
/// particular claims representation so the storage format stays stable.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimsPrincipal {
    pub authentication_type: Option<String>,
    pub name_claim_type: Option<String>,
    pub role_claim_type: Option<String>,
    pub claims: Vec<Claim>,
}

impl ClaimsPrincipal {
    pub fn find_first(&self, claim_type: &str) -> Option<&Claim> {
        self.claims.iter().find(|c| c.claim_type == claim_type)
    }

    pub fn subject_id(&self) -> Option<&str> {
        self.find_first(CLAIM_SUB).map(|c| c.value.as_str())
    }

    pub fn session_id(&self) -> Option<&str> {
        self.find_first(CLAIM_SID).map(|c| c.value.as_str())
    }

    pub fn is_authenticated(&self) -> bool {
        self.authentication_type.is_some()
    }
}

/// In-memory bundle of authenticated identity and a properties bag. Never
/// persisted directly; always passes through [`serialize_ticket`] first.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthenticationTicket {
    pub scheme: String,
    pub principal: ClaimsPrincipal,
    pub properties: BTreeMap<String, String>,
}

impl AuthenticationTicket {
    pub(crate) const ISSUED_KEY: &'static str = ".issued";
    pub(crate) const EXPIRES_KEY: &'static str = ".expires";
    pub(crate) const SESSION_STATE_KEY: &'static str = "session_state";

    pub fn new(scheme: impl Into<String>, principal: ClaimsPrincipal) -> Self {
        Self {
            scheme: scheme.into(),
            principal,
            properties: BTreeMap::new(),
        }
    }

    pub fn issued(&self) -> Option<DateTime<Utc>> {
        self.properties
            .get(Self::ISSUED_KEY)
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|d| d.with_timezone(&Utc))
    }

    pub fn set_issued(&mut self, issued: DateTime<Utc>) {
        self.properties.insert(
            Self::ISSUED_KEY.to_string(),
            issued.to_rfc3339_opts(SecondsFormat::Secs, true),
        );
    }

    pub fn expires(&self) -> Option<DateTime<Utc>> {
        self.properties
            .get(Self::EXPIRES_KEY)
            .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|d| d.with_timezone(&Utc))
    }

    pub fn set_expires(&mut self, expires: DateTime<Utc>) {
        self.properties.insert(
            Self::EXPIRES_KEY.to_string(),
            expires.to_rfc3339_opts(SecondsFormat::Secs, true),
        );
    }

    pub fn session_state(&self) -> Option<&str> {
        self.properties
            .get(Self::SESSION_STATE_KEY)
            .map(|s| s.as_str())
    }
}

#[derive(Error, Debug)]
pub enum ProtectionError {
    #[error("key length must be 64 hex chars for a 32 byte key")]
    KeyLength,
    #[error("{0}")]
    HexDecode(#[from] FromHexError),
    #[error("{0}")]
    AesGcm(String),
    #[error("{0}")]
    FromUtf8(#[from] FromUtf8Error),
    #[error("Failed to json encode ticket: {0}")]
    Json(#[from] serde_json::Error),
    #[error("protected payload too short")]
    PayloadTooShort,
}

impl From<aes_gcm::aead::Error> for ProtectionError {
    fn from(value: aes_gcm::aead::Error) -> Self {
        ProtectionError::AesGcm(value.to_string())
    }
}

/// Reversible confidentiality + tamper-detection transform applied to the
/// serialized ticket before it reaches storage.
pub trait DataProtector: Send + Sync {
    fn protect(&self, plaintext: &str) -> Result<String, ProtectionError>;
    fn unprotect(&self, protected: &str) -> Result<String, ProtectionError>;
}

/// AES-256-GCM protector, nonce prepended, hex encoded. Constructed once at
/// composition; the key is held by the instance, not a process-wide static.
pub struct AesGcmProtector {
    key: Vec<u8>,
}

impl AesGcmProtector {
    const NONCE_LEN: usize = 12;

    /// Build from a 64 char hex encoded 32 byte key.
    pub fn new(hex_key: &str) -> Result<Self, ProtectionError> {
        if hex_key.chars().count() != 64 {
            return Err(ProtectionError::KeyLength);
        }
        Ok(Self {
            key: hex::decode(hex_key)?,
        })
    }

    /// Build with a freshly generated random key. Sessions protected with
    /// it do not survive a process restart.
    pub fn generate() -> Self {
        Self {
            key: Aes256Gcm::generate_key(&mut OsRng).to_vec(),
        }
    }

    /// Build from the `ENCRYPTION_KEY` environment variable, falling back
    /// to a generated key when unset.
    pub fn from_env() -> Result<Self, ProtectionError> {
        match env::var(env_var::ENCRYPTION_KEY) {
            Ok(hex_key) => Self::new(&hex_key),
            Err(_) => Ok(Self::generate()),
        }
    }
}

impl DataProtector for AesGcmProtector {
    fn protect(&self, plaintext: &str) -> Result<String, ProtectionError> {
        let key = Key::<Aes256Gcm>::from_slice(&self.key);
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let cipher = Aes256Gcm::new(key);

        let ciphered_data = cipher.encrypt(&nonce, plaintext.as_bytes())?;

        let mut protected = nonce.to_vec();
        protected.extend_from_slice(&ciphered_data);
        Ok(hex::encode(protected))
    }

    fn unprotect(&self, protected: &str) -> Result<String, ProtectionError> {
        let key = Key::<Aes256Gcm>::from_slice(&self.key);
        let encrypted_data = hex::decode(protected)?;
        if encrypted_data.len() <= Self::NONCE_LEN {
            return Err(ProtectionError::PayloadTooShort);
        }

        let (nonce_vec, ciphered_text) = encrypted_data.split_at(Self::NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_vec);
        let cipher = Aes256Gcm::new(key);

        let plaintext = cipher.decrypt(nonce, ciphered_text)?;
        String::from_utf8(plaintext).map_err(ProtectionError::FromUtf8)
    }
}

pub(crate) const ENVELOPE_VERSION: u32 = 1;

/// Versioned wrapper around the protected payload. Unknown versions are
/// detected and rejected on read rather than guessed at.
#[derive(Serialize, Deserialize)]
struct Envelope {
    version: u32,
    payload: String,
}

#[derive(Serialize, Deserialize)]
struct TicketPayload {
    scheme: String,
    user: ClaimsPrincipal,
    items: BTreeMap<String, String>,
}

/// Project the ticket into its serializable form, protect it, and wrap it
/// in the versioned envelope.
pub fn serialize_ticket(
    ticket: &AuthenticationTicket,
    protector: &dyn DataProtector,
) -> Result<String, ProtectionError> {
    let payload = TicketPayload {
        scheme: ticket.scheme.clone(),
        user: ticket.principal.clone(),
        items: ticket.properties.clone(),
    };
    let protected = protector.protect(&serde_json::to_string(&payload)?)?;
    let envelope = Envelope {
        version: ENVELOPE_VERSION,
        payload: protected,
    };
    Ok(serde_json::to_string(&envelope)?)
}

/// Read a ticket back out of a session record.
///
/// Any envelope-version mismatch, unprotect failure, or parse failure
/// returns `None`; the caller treats the ticket as unusable, typically by
/// deleting the session record. The record's `expires` column, when set,
/// overrides whatever expiry was embedded in the protected payload so the
/// store can adjust session lifetime without re-protecting.
pub fn deserialize_ticket(
    session: &UserSession,
    protector: &dyn DataProtector,
) -> Option<AuthenticationTicket> {
    let envelope: Envelope = match serde_json::from_str(&session.ticket) {
        Ok(envelope) => envelope,
        Err(err) => {
            log::warn!("session {} has unparsable envelope: {}.", session.key, err);
            return None;
        }
    };
    if envelope.version != ENVELOPE_VERSION {
        log::warn!(
            "session {} has envelope version {}, expected {}.",
            session.key,
            envelope.version,
            ENVELOPE_VERSION
        );
        return None;
    }

    let plaintext = match protector.unprotect(&envelope.payload) {
        Ok(plaintext) => plaintext,
        Err(err) => {
            log::warn!("session {} failed to unprotect: {}.", session.key, err);
            return None;
        }
    };
    let payload: TicketPayload = match serde_json::from_str(&plaintext) {
        Ok(payload) => payload,
        Err(err) => {
            log::warn!("session {} has unparsable ticket: {}.", session.key, err);
            return None;
        }
    };

    let mut ticket = AuthenticationTicket {
        scheme: payload.scheme,
        principal: payload.user,
        properties: payload.items,
    };
    if let Some(expires) = session.expires {
        ticket.set_expires(expires);
    }
    Some(ticket)
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use chrono::Duration;

    pub(crate) fn make_ticket(subject_id: &str, session_id: Option<&str>) -> AuthenticationTicket {
        let mut claims = vec![
            Claim::new(CLAIM_SUB, subject_id),
            Claim::new("name", "Alice Example"),
        ];
        if let Some(sid) = session_id {
            claims.push(Claim::new(CLAIM_SID, sid));
        }
        let principal = ClaimsPrincipal {
            authentication_type: Some("oidc".to_string()),
            name_claim_type: Some("name".to_string()),
            role_claim_type: Some("role".to_string()),
            claims,
        };
        let mut ticket = AuthenticationTicket::new("cookie", principal);
        ticket.set_issued(Utc::now());
        ticket.set_expires(Utc::now() + Duration::hours(8));
        ticket
    }

    fn make_session_with_ticket(ticket_value: String) -> UserSession {
        let now = Utc::now();
        UserSession {
            key: "k1".to_string(),
            subject_id: "alice".to_string(),
            session_id: Some("s1".to_string()),
            application_name: None,
            created: now,
            renewed: now,
            expires: None,
            ticket: ticket_value,
        }
    }

    #[test]
    fn test_serialize_then_deserialize_round_trips_exactly() {
        // Arrange
        let protector = AesGcmProtector::generate();
        let mut ticket = make_ticket("alice", Some("s1"));
        ticket
            .properties
            .insert(".Token.access_token".to_string(), "at".to_string());
        ticket.principal.claims.push(Claim {
            claim_type: "amr".to_string(),
            value: "pwd".to_string(),
            value_type: Some("http://www.w3.org/2001/XMLSchema#string".to_string()),
        });

        // Act
        let serialized = serialize_ticket(&ticket, &protector).unwrap();
        let session = make_session_with_ticket(serialized);
        let restored = deserialize_ticket(&session, &protector);

        // Assert
        let restored = restored.expect("ticket should deserialize");
        assert_eq!(restored.scheme, ticket.scheme);
        assert_eq!(restored.principal, ticket.principal);
        assert_eq!(restored.properties, ticket.properties);
    }

    #[test]
    fn test_given_unknown_envelope_version_then_deserialize_returns_none() {
        // Arrange
        let protector = AesGcmProtector::generate();
        let ticket = make_ticket("alice", Some("s1"));
        let serialized = serialize_ticket(&ticket, &protector).unwrap();
        let mut envelope: serde_json::Value = serde_json::from_str(&serialized).unwrap();
        envelope["version"] = serde_json::json!(99);
        let session = make_session_with_ticket(envelope.to_string());

        // Act
        let restored = deserialize_ticket(&session, &protector);

        // Assert
        assert!(restored.is_none());
    }

    #[test]
    fn test_given_garbage_payload_then_deserialize_returns_none() {
        // Arrange
        let protector = AesGcmProtector::generate();
        let session = make_session_with_ticket("not an envelope".to_string());

        // Act
        let restored = deserialize_ticket(&session, &protector);

        // Assert
        assert!(restored.is_none());
    }

    #[test]
    fn test_given_wrong_key_then_deserialize_returns_none() {
        // Arrange
        let ticket = make_ticket("alice", Some("s1"));
        let serialized = serialize_ticket(&ticket, &AesGcmProtector::generate()).unwrap();
        let session = make_session_with_ticket(serialized);

        // Act
        let restored = deserialize_ticket(&session, &AesGcmProtector::generate());

        // Assert
        assert!(restored.is_none());
    }

    #[test]
    fn test_session_expiry_overrides_embedded_expiry() {
        // Arrange
        let protector = AesGcmProtector::generate();
        let ticket = make_ticket("alice", Some("s1"));
        let serialized = serialize_ticket(&ticket, &protector).unwrap();
        let mut session = make_session_with_ticket(serialized);
        let extended = Utc::now() + Duration::hours(24);
        session.expires = Some(extended);

        // Act
        let restored = deserialize_ticket(&session, &protector).unwrap();

        // Assert
        let expires = restored.expires().unwrap();
        assert_eq!(expires.timestamp(), extended.timestamp());
    }

    #[test]
    fn test_given_invalid_key_length_then_protector_creation_fails() {
        // Act
        let result = AesGcmProtector::new("abcd");

        // Assert
        assert!(matches!(result, Err(ProtectionError::KeyLength)));
    }

    #[test]
    fn test_principal_claim_lookups() {
        // Arrange
        let ticket = make_ticket("alice", Some("s1"));

        // Assert
        assert_eq!(ticket.principal.subject_id(), Some("alice"));
        assert_eq!(ticket.principal.session_id(), Some("s1"));
        assert!(ticket.principal.is_authenticated());
        assert!(ticket.principal.find_first("missing").is_none());
    }
}
