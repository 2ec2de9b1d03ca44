use std::{
    sync::{Arc, PoisonError, RwLock},
    time::{Duration as StdDuration, Instant},
};

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{
    decode, decode_header,
    jwk::JwkSet,
    Algorithm, DecodingKey, Validation,
};
use reqwest::{Client, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize};
use thiserror::Error;
use url::Url;

/// How long discovery metadata and signing keys are reused before refetching.
pub const DISCOVERY_TTL: StdDuration = StdDuration::from_secs(60 * 60);

/// OpenID Connect relying-party client (authorization code flow with PKCE).
#[derive(Clone)]
pub struct OidcClient {
    http: Client,
    issuer: Url,
    client_id: String,
    client_secret: String,
    cache: Arc<RwLock<Option<CachedProvider>>>,
    cache_ttl: StdDuration,
}

#[derive(Clone)]
struct CachedProvider {
    metadata: ProviderMetadata,
    jwks: Option<JwkSet>,
    fetched_at: Instant,
}

impl OidcClient {
    /// Creates a client for `issuer`. A trailing slash is added when missing so
    /// well-known paths resolve beneath the issuer.
    pub fn new(
        issuer: &str,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        http: Client,
    ) -> Result<Self, OidcError> {
        let issuer = if issuer.ends_with('/') {
            Url::parse(issuer)?
        } else {
            Url::parse(&format!("{issuer}/"))?
        };
        Ok(Self {
            http,
            issuer,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            cache: Arc::new(RwLock::new(None)),
            cache_ttl: DISCOVERY_TTL,
        })
    }

    pub fn with_cache_ttl(mut self, ttl: StdDuration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Returns the provider metadata, fetching it when the cache is cold or stale.
    pub async fn discover(&self) -> Result<ProviderMetadata, OidcError> {
        if let Some(cached) = self.cached() {
            return Ok(cached.metadata);
        }

        let url = self.issuer.join(".well-known/openid-configuration")?;
        let response = self.http.get(url).send().await?;
        let metadata: ProviderMetadata = parse_json(response).await?;

        *self.cache.write().unwrap_or_else(PoisonError::into_inner) = Some(CachedProvider {
            metadata: metadata.clone(),
            jwks: None,
            fetched_at: Instant::now(),
        });
        Ok(metadata)
    }

    /// Builds the authorization URL with PKCE and nonce parameters.
    pub async fn authorize_url(&self, params: &AuthorizeUrlParams<'_>) -> Result<Url, OidcError> {
        let metadata = self.discover().await?;
        let mut url = Url::parse(&metadata.authorization_endpoint)?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("client_id", &self.client_id);
            query.append_pair("redirect_uri", params.redirect_uri);
            query.append_pair("response_type", "code");
            query.append_pair("scope", &params.scopes.join(" "));
            query.append_pair("state", params.state);
            query.append_pair("nonce", params.nonce);
            query.append_pair("code_challenge", params.code_challenge);
            query.append_pair("code_challenge_method", "S256");
            if let Some(prompt) = params.prompt {
                query.append_pair("prompt", prompt);
            }
            if let Some(connection) = params.connection {
                query.append_pair("connection", connection);
            }
        }

        Ok(url)
    }

    /// Exchanges an authorization code for tokens.
    pub async fn exchange_code(
        &self,
        code: &str,
        code_verifier: &str,
        redirect_uri: &str,
    ) -> Result<TokenResponse, OidcError> {
        let metadata = self.discover().await?;
        let response = self
            .http
            .post(&metadata.token_endpoint)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("code", code),
                ("grant_type", "authorization_code"),
                ("redirect_uri", redirect_uri),
                ("code_verifier", code_verifier),
            ])
            .send()
            .await?;

        parse_json(response).await
    }

    /// Obtains a fresh access token using a refresh token.
    pub async fn refresh_token(&self, refresh_token: &str) -> Result<TokenResponse, OidcError> {
        let metadata = self.discover().await?;
        let response = self
            .http
            .post(&metadata.token_endpoint)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await?;

        parse_json(response).await
    }

    /// Verifies signature, issuer, audience, expiry and nonce of an ID token.
    ///
    /// HS256 tokens are checked with the client secret; RSA tokens against
    /// the provider's published key set.
    pub async fn verify_id_token(
        &self,
        id_token: &str,
        expected_nonce: &str,
    ) -> Result<IdTokenClaims, OidcError> {
        let header = decode_header(id_token)?;
        let metadata = self.discover().await?;

        let key = match header.alg {
            Algorithm::HS256 => DecodingKey::from_secret(self.client_secret.as_bytes()),
            Algorithm::RS256 | Algorithm::RS384 | Algorithm::RS512 => {
                self.decoding_key(&metadata, header.kid.as_deref()).await?
            }
            other => return Err(OidcError::UnsupportedAlgorithm(other)),
        };

        let mut validation = Validation::new(header.alg);
        validation.set_issuer(&[metadata.issuer.as_str()]);
        validation.set_audience(&[self.client_id.as_str()]);

        let claims = decode::<IdTokenClaims>(id_token, &key, &validation)?.claims;
        if claims.nonce.as_deref() != Some(expected_nonce) {
            return Err(OidcError::NonceMismatch);
        }
        Ok(claims)
    }

    /// Builds the provider logout URL that returns the browser to `return_to`.
    pub async fn end_session_url(&self, return_to: &str) -> Result<Url, OidcError> {
        let metadata = self.discover().await?;
        match metadata.end_session_endpoint {
            Some(endpoint) => {
                let mut url = Url::parse(&endpoint)?;
                url.query_pairs_mut()
                    .append_pair("client_id", &self.client_id)
                    .append_pair("post_logout_redirect_uri", return_to);
                Ok(url)
            }
            None => {
                let mut url = self.issuer.join("v2/logout")?;
                url.query_pairs_mut()
                    .append_pair("client_id", &self.client_id)
                    .append_pair("returnTo", return_to);
                Ok(url)
            }
        }
    }

    async fn decoding_key(
        &self,
        metadata: &ProviderMetadata,
        kid: Option<&str>,
    ) -> Result<DecodingKey, OidcError> {
        let cached = self.cached().and_then(|cached| cached.jwks);
        if let Some(jwks) = &cached {
            if let Some(key) = select_key(jwks, kid) {
                return Ok(key?);
            }
        }

        // Cold cache or unknown kid (the provider may have rotated keys).
        let jwks_uri = metadata.jwks_uri.as_deref().ok_or(OidcError::UnknownKey)?;
        let response = self.http.get(jwks_uri).send().await?;
        let jwks: JwkSet = parse_json(response).await?;
        {
            let mut guard = self.cache.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(entry) = guard.as_mut() {
                entry.jwks = Some(jwks.clone());
            }
        }

        match select_key(&jwks, kid) {
            Some(key) => Ok(key?),
            None => Err(OidcError::UnknownKey),
        }
    }

    fn cached(&self) -> Option<CachedProvider> {
        let guard = self.cache.read().unwrap_or_else(PoisonError::into_inner);
        guard
            .as_ref()
            .filter(|cached| cached.fetched_at.elapsed() < self.cache_ttl)
            .cloned()
    }
}

fn select_key(jwks: &JwkSet, kid: Option<&str>) -> Option<Result<DecodingKey, jsonwebtoken::errors::Error>> {
    let jwk = match kid {
        Some(kid) => jwks.find(kid),
        None => jwks.keys.first(),
    }?;
    Some(DecodingKey::from_jwk(jwk))
}

/// Parameters required to generate an authorization URL.
pub struct AuthorizeUrlParams<'a> {
    pub state: &'a str,
    pub nonce: &'a str,
    pub redirect_uri: &'a str,
    pub code_challenge: &'a str,
    pub scopes: &'a [&'a str],
    pub prompt: Option<&'a str>,
    /// Auth0 connection name, forwarded verbatim.
    pub connection: Option<&'a str>,
}

/// Subset of the discovery document the client relies on.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ProviderMetadata {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(default)]
    pub userinfo_endpoint: Option<String>,
    #[serde(default)]
    pub jwks_uri: Option<String>,
    #[serde(default)]
    pub end_session_endpoint: Option<String>,
}

/// Token endpoint response.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
    pub expires_in: u64,
    #[serde(default)]
    pub scope: Option<String>,
    pub token_type: String,
}

impl TokenResponse {
    /// Computes the expiration timestamp relative to the provided instant.
    /// Lifetimes too large to represent saturate at the latest instant.
    pub fn expires_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        i64::try_from(self.expires_in)
            .ok()
            .and_then(Duration::try_seconds)
            .and_then(|lifetime| now.checked_add_signed(lifetime))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Claims read from a verified ID token.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct IdTokenClaims {
    pub sub: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub given_name: Option<String>,
    #[serde(default)]
    pub family_name: Option<String>,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default)]
    pub picture: Option<String>,
    #[serde(default)]
    pub nonce: Option<String>,
    pub exp: u64,
}

impl IdTokenClaims {
    /// Given name, falling back to the nickname some providers send instead.
    pub fn first_name(&self) -> Option<&str> {
        self.given_name.as_deref().or(self.nickname.as_deref())
    }
}

/// Errors that can occur during OIDC interactions.
#[derive(Debug, Error)]
pub enum OidcError {
    #[error("failed to build url: {0}")]
    Url(#[from] url::ParseError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("id token rejected: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),
    #[error("id token signed with unsupported algorithm {0:?}")]
    UnsupportedAlgorithm(Algorithm),
    #[error("id token nonce does not match the login request")]
    NonceMismatch,
    #[error("token response did not include an id token")]
    MissingIdToken,
    #[error("no signing key matches the id token")]
    UnknownKey,
}

async fn parse_json<T>(response: Response) -> Result<T, OidcError>
where
    T: DeserializeOwned,
{
    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<unavailable>"));
        return Err(OidcError::Status { status, body });
    }

    Ok(response.json().await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;
    use serde_json::json;
    use std::borrow::Cow;

    #[derive(Serialize)]
    struct TestClaims<'a> {
        iss: &'a str,
        aud: &'a str,
        sub: &'a str,
        email: &'a str,
        nickname: &'a str,
        nonce: &'a str,
        exp: u64,
    }

    fn client(server: &MockServer) -> OidcClient {
        OidcClient::new(
            &server.url("/tenant"),
            "client",
            "secret",
            Client::builder().build().expect("client"),
        )
        .expect("oidc client")
    }

    fn discovery_body(server: &MockServer, end_session: bool) -> serde_json::Value {
        let mut body = json!({
            "issuer": server.url("/tenant/"),
            "authorization_endpoint": server.url("/tenant/authorize"),
            "token_endpoint": server.url("/tenant/oauth/token"),
            "jwks_uri": server.url("/tenant/.well-known/jwks.json"),
        });
        if end_session {
            body["end_session_endpoint"] = json!(server.url("/tenant/oidc/logout"));
        }
        body
    }

    async fn mock_discovery<'a>(server: &'a MockServer, end_session: bool) -> httpmock::Mock<'a> {
        let body = discovery_body(server, end_session);
        server
            .mock_async(|when, then| {
                when.method(GET).path("/tenant/.well-known/openid-configuration");
                then.status(200).json_body(body);
            })
            .await
    }

    fn signed_token(server: &MockServer, audience: &str, nonce: &str, secret: &str) -> String {
        let issuer = server.url("/tenant/");
        let exp = (Utc::now() + Duration::minutes(10)).timestamp() as u64;
        encode(
            &Header::default(),
            &TestClaims {
                iss: &issuer,
                aud: audience,
                sub: "auth0|user-1",
                email: "ada@example.com",
                nickname: "ada",
                nonce,
                exp,
            },
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .expect("encode token")
    }

    #[tokio::test]
    async fn discovery_is_cached() {
        let server = MockServer::start_async().await;
        let mock = mock_discovery(&server, false).await;
        let client = client(&server);

        let first = client.discover().await.expect("discover");
        let second = client.discover().await.expect("discover again");
        assert_eq!(first, second);
        mock.assert_hits_async(1).await;
    }

    #[tokio::test]
    async fn stale_cache_is_refetched() {
        let server = MockServer::start_async().await;
        let mock = mock_discovery(&server, false).await;
        let client = client(&server).with_cache_ttl(StdDuration::ZERO);

        client.discover().await.expect("discover");
        client.discover().await.expect("discover again");
        mock.assert_hits_async(2).await;
    }

    #[tokio::test]
    async fn authorize_url_contains_pkce_and_nonce() {
        let server = MockServer::start_async().await;
        mock_discovery(&server, false).await;
        let client = client(&server);

        let url = client
            .authorize_url(&AuthorizeUrlParams {
                state: "state-123",
                nonce: "nonce-456",
                redirect_uri: "http://localhost:5000/api/callback",
                code_challenge: "challenge",
                scopes: &["openid", "profile", "email", "offline_access"],
                prompt: Some("login"),
                connection: Some("google-oauth2"),
            })
            .await
            .expect("url");

        assert!(url.as_str().starts_with(&server.url("/tenant/authorize")));
        let query: Vec<(Cow<'_, str>, Cow<'_, str>)> = url.query_pairs().collect();
        assert!(query.contains(&(Cow::Borrowed("nonce"), Cow::Borrowed("nonce-456"))));
        assert!(query.contains(&(Cow::Borrowed("code_challenge_method"), Cow::Borrowed("S256"))));
        assert!(query.contains(&(Cow::Borrowed("prompt"), Cow::Borrowed("login"))));
        assert!(query.contains(&(Cow::Borrowed("connection"), Cow::Borrowed("google-oauth2"))));
        assert!(query
            .iter()
            .any(|(k, v)| k == "scope" && v == "openid profile email offline_access"));
    }

    #[tokio::test]
    async fn exchange_code_posts_verifier() {
        let server = MockServer::start_async().await;
        mock_discovery(&server, false).await;
        let token = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/tenant/oauth/token")
                    .body_contains("grant_type=authorization_code")
                    .body_contains("code=the-code")
                    .body_contains("code_verifier=verifier");
                then.status(200).json_body(json!({
                    "access_token": "access",
                    "refresh_token": "refresh",
                    "id_token": "header.payload.sig",
                    "expires_in": 86400,
                    "token_type": "Bearer"
                }));
            })
            .await;

        let response = client(&server)
            .exchange_code("the-code", "verifier", "http://localhost:5000/api/callback")
            .await
            .expect("exchange");
        token.assert_async().await;
        assert_eq!(response.refresh_token.as_deref(), Some("refresh"));
        assert_eq!(response.id_token.as_deref(), Some("header.payload.sig"));
        let now = Utc::now();
        assert_eq!(response.expires_at(now), now + Duration::seconds(86_400));
    }

    #[test]
    fn huge_token_lifetimes_saturate() {
        let now = Utc::now();
        for expires_in in [u64::MAX, i64::MAX as u64, 9_000_000_000_000] {
            let response = TokenResponse {
                access_token: "access".into(),
                refresh_token: None,
                id_token: None,
                expires_in,
                scope: None,
                token_type: "Bearer".into(),
            };
            assert_eq!(response.expires_at(now), DateTime::<Utc>::MAX_UTC);
        }
    }

    #[tokio::test]
    async fn refresh_failure_surfaces_status() {
        let server = MockServer::start_async().await;
        mock_discovery(&server, false).await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/tenant/oauth/token");
                then.status(403).body("invalid_grant");
            })
            .await;

        let err = client(&server).refresh_token("stale").await.unwrap_err();
        match err {
            OidcError::Status { status, body } => {
                assert_eq!(status, StatusCode::FORBIDDEN);
                assert_eq!(body, "invalid_grant");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn verifies_hs256_id_token() {
        let server = MockServer::start_async().await;
        mock_discovery(&server, false).await;
        let client = client(&server);

        let token = signed_token(&server, "client", "nonce-1", "secret");
        let claims = client.verify_id_token(&token, "nonce-1").await.expect("valid token");
        assert_eq!(claims.sub, "auth0|user-1");
        assert_eq!(claims.email.as_deref(), Some("ada@example.com"));
        assert_eq!(claims.first_name(), Some("ada"));
    }

    #[tokio::test]
    async fn rejects_wrong_nonce_audience_and_signature() {
        let server = MockServer::start_async().await;
        mock_discovery(&server, false).await;
        let client = client(&server);

        let token = signed_token(&server, "client", "nonce-1", "secret");
        let err = client.verify_id_token(&token, "other").await.unwrap_err();
        assert!(matches!(err, OidcError::NonceMismatch));

        let token = signed_token(&server, "someone-else", "nonce-1", "secret");
        let err = client.verify_id_token(&token, "nonce-1").await.unwrap_err();
        assert!(matches!(err, OidcError::Token(_)));

        let token = signed_token(&server, "client", "nonce-1", "forged");
        let err = client.verify_id_token(&token, "nonce-1").await.unwrap_err();
        assert!(matches!(err, OidcError::Token(_)));
    }

    #[tokio::test]
    async fn rsa_token_with_unknown_kid_is_rejected() {
        let server = MockServer::start_async().await;
        mock_discovery(&server, false).await;
        let jwks = server
            .mock_async(|when, then| {
                when.method(GET).path("/tenant/.well-known/jwks.json");
                then.status(200).json_body(json!({ "keys": [] }));
            })
            .await;

        // {"alg":"RS256","kid":"missing","typ":"JWT"} . {} . "sig"
        let token = "eyJhbGciOiJSUzI1NiIsImtpZCI6Im1pc3NpbmciLCJ0eXAiOiJKV1QifQ.e30.c2ln";
        let err = client(&server)
            .verify_id_token(token, "nonce")
            .await
            .unwrap_err();
        assert!(matches!(err, OidcError::UnknownKey));
        jwks.assert_async().await;
    }

    #[tokio::test]
    async fn end_session_prefers_discovered_endpoint() {
        let server = MockServer::start_async().await;
        mock_discovery(&server, true).await;

        let url = client(&server)
            .end_session_url("http://localhost:5000")
            .await
            .expect("logout url");
        assert!(url.as_str().starts_with(&server.url("/tenant/oidc/logout")));
        assert!(url
            .query_pairs()
            .any(|(k, v)| k == "post_logout_redirect_uri" && v == "http://localhost:5000"));
    }

    #[tokio::test]
    async fn end_session_falls_back_to_auth0_logout() {
        let server = MockServer::start_async().await;
        mock_discovery(&server, false).await;

        let url = client(&server)
            .end_session_url("http://localhost:5000")
            .await
            .expect("logout url");
        assert!(url.as_str().starts_with(&server.url("/tenant/v2/logout")));
        assert!(url.query_pairs().any(|(k, v)| k == "returnTo" && v == "http://localhost:5000"));
        assert!(url.query_pairs().any(|(k, v)| k == "client_id" && v == "client"));
    }
}
