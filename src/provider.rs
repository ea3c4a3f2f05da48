use crate::{
    backchannel::LogoutTokenValidator,
    env_var,
    revocation::{RefreshTokenRevoker, RevocationError},
};
use async_trait::async_trait;
use jsonwebtoken::jwk::JwkSet;
use oauth2::{
    basic::BasicClient, AuthUrl, ClientId, ClientSecret, RefreshToken, RevocationUrl,
    StandardRevocableToken, TokenUrl,
};
use openidconnect::{
    core::{
        CoreAuthDisplay, CoreClaimName, CoreClaimType, CoreClientAuthMethod, CoreGrantType,
        CoreJsonWebKey, CoreJsonWebKeySet, CoreJsonWebKeyType, CoreJsonWebKeyUse,
        CoreJweContentEncryptionAlgorithm, CoreJweKeyManagementAlgorithm, CoreJwsSigningAlgorithm,
        CoreResponseMode, CoreResponseType, CoreSubjectIdentifierType,
    },
    reqwest::async_http_client,
    AdditionalProviderMetadata, IssuerUrl, ProviderMetadata,
};
use serde::{Deserialize, Serialize};
use std::env;

/// The discovery document fields the core metadata type drops but the
/// BFF needs: RFC 7009 token revocation.
#[derive(Clone, Debug, Deserialize, Serialize)]
struct RevocationEndpointProviderMetadata {
    revocation_endpoint: Option<String>,
}

impl AdditionalProviderMetadata for RevocationEndpointProviderMetadata {}

type RevocableProviderMetadata = ProviderMetadata<
    RevocationEndpointProviderMetadata,
    CoreAuthDisplay,
    CoreClientAuthMethod,
    CoreClaimName,
    CoreClaimType,
    CoreGrantType,
    CoreJweContentEncryptionAlgorithm,
    CoreJweKeyManagementAlgorithm,
    CoreJwsSigningAlgorithm,
    CoreJsonWebKeyType,
    CoreJsonWebKeyUse,
    CoreJsonWebKey,
    CoreResponseMode,
    CoreResponseType,
    CoreSubjectIdentifierType,
>;

/// Handle to the identity provider, built once from its discovery
/// document. Supplies the signing keys for backchannel logout tokens and
/// the revocation client for refresh tokens.
pub struct IdentityProvider {
    issuer: String,
    client_id: String,
    jwks: JwkSet,
    revocation: Option<BasicClient>,
}

impl IdentityProvider {
    pub async fn discover() -> Result<IdentityProvider, std::io::Error> {
        let authority = env::var(env_var::AUTHORITY)
            .unwrap_or_else(|_| panic!("{} must be set", env_var::AUTHORITY));
        let client_id = env::var(env_var::CLIENT_ID)
            .unwrap_or_else(|_| panic!("{} must be set", env_var::CLIENT_ID));
        let client_secret = env::var(env_var::CLIENT_SECRET).ok();

        let issuer = IssuerUrl::new(authority)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))?;

        let provider_metadata = RevocableProviderMetadata::discover_async(issuer, async_http_client)
            .await
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))?;

        let jwks = Self::convert_jwks(provider_metadata.jwks())
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))?;

        let revocation = match &provider_metadata.additional_metadata().revocation_endpoint {
            Some(endpoint) => {
                let auth_url = AuthUrl::new(provider_metadata.authorization_endpoint().to_string())
                    .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))?;
                let token_url = provider_metadata
                    .token_endpoint()
                    .map(|t| TokenUrl::new(t.to_string()))
                    .transpose()
                    .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))?;
                let revocation_url = RevocationUrl::new(endpoint.clone())
                    .map_err(|err| std::io::Error::new(std::io::ErrorKind::Other, err))?;

                Some(
                    BasicClient::new(
                        ClientId::new(client_id.clone()),
                        client_secret.map(ClientSecret::new),
                        auth_url,
                        token_url,
                    )
                    .set_revocation_uri(revocation_url),
                )
            }
            None => {
                log::warn!("identity provider advertises no revocation endpoint; refresh tokens will not be revoked.");
                None
            }
        };

        Ok(IdentityProvider {
            issuer: provider_metadata.issuer().to_string(),
            client_id,
            jwks,
            revocation,
        })
    }

    /// The discovery stack and the logout token validation stack use
    /// different JWKS representations; the wire format is the bridge.
    fn convert_jwks(jwks: &CoreJsonWebKeySet) -> Result<JwkSet, serde_json::Error> {
        serde_json::from_value(serde_json::to_value(jwks)?)
    }

    pub fn logout_token_validator(&self) -> LogoutTokenValidator {
        LogoutTokenValidator::new(self.jwks.clone(), self.issuer.clone(), self.client_id.clone())
    }
}

#[async_trait]
impl RefreshTokenRevoker for IdentityProvider {
    async fn revoke(&self, refresh_token: &str) -> Result<(), RevocationError> {
        let client = self
            .revocation
            .as_ref()
            .ok_or(RevocationError::NoRevocationEndpoint)?;

        client
            .revoke_token(StandardRevocableToken::RefreshToken(RefreshToken::new(
                refresh_token.to_string(),
            )))
            .map_err(|err| RevocationError::Request(err.to_string()))?
            .request_async(oauth2::reqwest::async_http_client)
            .await
            .map_err(|err| RevocationError::Request(err.to_string()))?;

        log::debug!("refresh token revoked at the identity provider.");
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backchannel::test::{sign_logout_token, test_jwks, valid_claims, TEST_AUDIENCE, TEST_ISSUER};
    use serde_json::json;

    // RFC 7517 appendix A.1 public RSA key.
    const RSA_N: &str = "0vx7agoebGcQSuuPiLJXZptN9nndrQmbXEps2aiAFbWhM78LhWx4cbbfAAtVT86zwu1RK7aPFFxuhDR1L6tSoc_BJECPebWKRXjBZCiFV4n3oknjhMstn64tZ_2W-5JsGY4Hc5n9yBXArwl93lqt7_RN5w6Cf0h4QyQ5v-65YGjQR0_FDW2QvzqY368QQMicAtaSqzs8KJZgnYb9c7d0zgdAZHzu6qMQvRL5hajrn1n91CbOpbISD08qNLyrdkt-bFTWhAI4vMQFh6WeZu0fM4lFd2NcRwr3XPksINHaQ-G_xBniIqbw0Ls1jF44-csFCur-kEgU8awapJzKnqDKgw";

    #[test]
    fn test_convert_jwks_preserves_keys() {
        // Arrange
        let core_jwks: CoreJsonWebKeySet = serde_json::from_value(json!({
            "keys": [{
                "kty": "RSA",
                "use": "sig",
                "alg": "RS256",
                "kid": "2011-04-29",
                "n": RSA_N,
                "e": "AQAB",
            }]
        }))
        .unwrap();

        // Act
        let jwks = IdentityProvider::convert_jwks(&core_jwks).unwrap();

        // Assert
        assert_eq!(jwks.keys.len(), 1);
        assert!(jwks.find("2011-04-29").is_some());
    }

    #[test]
    fn test_logout_token_validator_uses_provider_keys() {
        // Arrange
        let provider = IdentityProvider {
            issuer: TEST_ISSUER.to_string(),
            client_id: TEST_AUDIENCE.to_string(),
            jwks: test_jwks(),
            revocation: None,
        };
        let token = sign_logout_token(valid_claims(Some("alice"), Some("s1")));

        // Act
        let notification = provider.logout_token_validator().validate(&token).unwrap();

        // Assert
        assert_eq!(notification.subject_id, Some("alice".to_string()));
    }

    #[actix_web::test]
    async fn test_revoke_without_endpoint_fails() {
        // Arrange
        let provider = IdentityProvider {
            issuer: TEST_ISSUER.to_string(),
            client_id: TEST_AUDIENCE.to_string(),
            jwks: test_jwks(),
            revocation: None,
        };

        // Act
        let result = provider.revoke("rt-1").await;

        // Assert
        assert!(matches!(
            result,
            Err(RevocationError::NoRevocationEndpoint)
        ));
    }
}
