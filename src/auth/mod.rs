use async_trait::async_trait;
use reqwest::{
    header::{HeaderValue, AUTHORIZATION},
    Client, Method, Request, StatusCode, Url,
};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::store::{keys, ConfigStore, StoreError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("access token is invalid and no refresh token is available")]
    MissingRefreshToken,
    #[error("{0} is not set in the store")]
    MissingSetting(&'static str),
    #[error("identity endpoint rejected the request ({status}): {body}")]
    Rejected { status: StatusCode, body: String },
    #[error("identity endpoint returned an empty access token")]
    EmptyGrant,
    #[error("identity http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("identity url error: {0}")]
    Url(String),
    #[error("identity response decode error: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AuthError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::MissingRefreshToken | Self::MissingSetting(_))
    }
}

#[async_trait]
pub trait TokenAuthority: Send + Sync {
    async fn validate(&self, access_token: &str) -> Result<bool, AuthError>;

    async fn refresh(
        &self,
        refresh_token: &str,
        client_id: &str,
        client_secret: &str,
    ) -> Result<TokenGrant, AuthError>;
}

pub struct CredentialGuard {
    store: Arc<ConfigStore>,
    authority: Arc<dyn TokenAuthority>,
    refresh_lock: Mutex<()>,
}

impl CredentialGuard {
    pub fn new(store: Arc<ConfigStore>, authority: Arc<dyn TokenAuthority>) -> Self {
        Self {
            store,
            authority,
            refresh_lock: Mutex::new(()),
        }
    }

    pub async fn current(&self) -> Credential {
        Credential {
            access_token: self
                .store
                .get_non_empty(keys::ACCESS_TOKEN)
                .await
                .unwrap_or_default(),
            refresh_token: self.store.get_non_empty(keys::REFRESH_TOKEN).await,
        }
    }

    pub async fn client_id(&self) -> Result<String, AuthError> {
        self.store
            .get_non_empty(keys::CLIENT_ID)
            .await
            .ok_or(AuthError::MissingSetting(keys::CLIENT_ID))
    }

    pub async fn ensure_valid(&self) -> Result<Credential, AuthError> {
        let credential = self.current().await;
        if !credential.access_token.is_empty()
            && self.authority.validate(&credential.access_token).await?
        {
            return Ok(credential);
        }
        tracing::warn!("access token is invalid, refreshing");
        self.refresh().await
    }

    pub async fn refresh(&self) -> Result<Credential, AuthError> {
        let _guard = self.refresh_lock.lock().await;

        let refresh_token = self
            .store
            .get_non_empty(keys::REFRESH_TOKEN)
            .await
            .ok_or(AuthError::MissingRefreshToken)?;
        let client_id = self.client_id().await?;
        let client_secret = self
            .store
            .get_non_empty(keys::CLIENT_SECRET)
            .await
            .unwrap_or_default();

        let grant = self
            .authority
            .refresh(&refresh_token, &client_id, &client_secret)
            .await?;
        if grant.access_token.trim().is_empty() {
            return Err(AuthError::EmptyGrant);
        }

        self.store
            .update(keys::ACCESS_TOKEN, &grant.access_token)
            .await?;
        let refresh_token = match grant.refresh_token.filter(|t| !t.trim().is_empty()) {
            Some(rotated) => {
                self.store.update(keys::REFRESH_TOKEN, &rotated).await?;
                rotated
            }
            None => refresh_token,
        };
        tracing::info!(expires_in = ?grant.expires_in, "access token refreshed");

        Ok(Credential {
            access_token: grant.access_token,
            refresh_token: Some(refresh_token),
        })
    }
}

#[derive(Clone, Debug)]
pub struct TwitchIdentityClient {
    http: Client,
    base_url: Url,
}

impl TwitchIdentityClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, AuthError> {
        let base_url = normalize_base(base_url)?;
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self { http, base_url })
    }

    pub fn build_validate_request(&self, access_token: &str) -> Result<Request, AuthError> {
        let url = self.endpoint("validate")?;
        let auth = HeaderValue::from_str(&format!("OAuth {}", access_token.trim()))
            .map_err(|err| AuthError::Url(err.to_string()))?;
        Ok(self
            .http
            .request(Method::GET, url)
            .header(AUTHORIZATION, auth)
            .build()?)
    }

    pub fn build_refresh_request(
        &self,
        refresh_token: &str,
        client_id: &str,
        client_secret: &str,
    ) -> Result<Request, AuthError> {
        let url = self.endpoint("token")?;
        Ok(self
            .http
            .request(Method::POST, url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", client_id),
                ("client_secret", client_secret),
            ])
            .build()?)
    }

    fn endpoint(&self, path: &str) -> Result<Url, AuthError> {
        self.base_url
            .join(path)
            .map_err(|err| AuthError::Url(err.to_string()))
    }
}

#[async_trait]
impl TokenAuthority for TwitchIdentityClient {
    async fn validate(&self, access_token: &str) -> Result<bool, AuthError> {
        let req = self.build_validate_request(access_token)?;
        let resp = self.http.execute(req).await?;
        let status = resp.status();
        let body = resp.text().await?;
        parse_validate_response(status, &body)
    }

    async fn refresh(
        &self,
        refresh_token: &str,
        client_id: &str,
        client_secret: &str,
    ) -> Result<TokenGrant, AuthError> {
        let req = self.build_refresh_request(refresh_token, client_id, client_secret)?;
        let resp = self.http.execute(req).await?;
        let status = resp.status();
        let body = resp.text().await?;
        parse_refresh_response(status, &body)
    }
}

pub fn parse_validate_response(status: StatusCode, body: &str) -> Result<bool, AuthError> {
    match status {
        s if s.is_success() => Ok(true),
        StatusCode::UNAUTHORIZED => Ok(false),
        _ => Err(AuthError::Rejected {
            status,
            body: body.to_string(),
        }),
    }
}

pub fn parse_refresh_response(status: StatusCode, body: &str) -> Result<TokenGrant, AuthError> {
    if !status.is_success() {
        return Err(AuthError::Rejected {
            status,
            body: body.to_string(),
        });
    }
    Ok(serde_json::from_str(body)?)
}

pub(crate) fn normalize_base(raw: &str) -> Result<Url, AuthError> {
    let mut parsed = Url::parse(raw.trim()).map_err(|err| AuthError::Url(err.to_string()))?;
    if !parsed.path().ends_with('/') {
        let new_path = format!("{}/", parsed.path().trim_end_matches('/'));
        parsed.set_path(&new_path);
    }
    Ok(parsed)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    // Identity provider double: a fixed set of valid tokens, and a queue of
    // grants handed out on refresh.
    #[derive(Default)]
    pub(crate) struct FakeAuthority {
        pub valid: StdMutex<Vec<String>>,
        pub grants: StdMutex<Vec<TokenGrant>>,
        pub refreshes: AtomicUsize,
    }

    impl FakeAuthority {
        pub(crate) fn accepting(token: &str) -> Self {
            let fake = Self::default();
            fake.valid.lock().unwrap().push(token.to_string());
            fake
        }

        pub(crate) fn with_grant(self, access: &str, refresh: Option<&str>) -> Self {
            self.grants.lock().unwrap().push(TokenGrant {
                access_token: access.to_string(),
                refresh_token: refresh.map(str::to_string),
                expires_in: Some(3600),
            });
            self
        }
    }

    #[async_trait]
    impl TokenAuthority for FakeAuthority {
        async fn validate(&self, access_token: &str) -> Result<bool, AuthError> {
            Ok(self.valid.lock().unwrap().iter().any(|t| t == access_token))
        }

        async fn refresh(
            &self,
            refresh_token: &str,
            _client_id: &str,
            _client_secret: &str,
        ) -> Result<TokenGrant, AuthError> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            if refresh_token == "revoked" {
                return Err(AuthError::Rejected {
                    status: StatusCode::BAD_REQUEST,
                    body: "Invalid refresh token".to_string(),
                });
            }
            let grant = self.grants.lock().unwrap().remove(0);
            self.valid.lock().unwrap().push(grant.access_token.clone());
            Ok(grant)
        }
    }

    pub(crate) fn temp_store_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("hue-eventsub-auth-{}", uuid::Uuid::new_v4()))
            .join("appsettings.json")
    }

    pub(crate) async fn seeded_store(pairs: &[(&str, &str)]) -> Arc<ConfigStore> {
        let store = Arc::new(ConfigStore::new(temp_store_path()));
        for (key, value) in pairs {
            store.update(key, value).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn valid_token_is_returned_without_refresh() {
        let store = seeded_store(&[(keys::ACCESS_TOKEN, "good"), (keys::CLIENT_ID, "cid")]).await;
        let authority = Arc::new(FakeAuthority::accepting("good"));
        let guard = CredentialGuard::new(store, authority.clone());

        let cred = guard.ensure_valid().await.unwrap();
        assert_eq!(cred.access_token, "good");
        assert_eq!(authority.refreshes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn invalid_token_is_refreshed_and_persisted() {
        let store = seeded_store(&[
            (keys::ACCESS_TOKEN, "stale"),
            (keys::REFRESH_TOKEN, "r-1"),
            (keys::CLIENT_ID, "cid"),
        ])
        .await;
        let authority = Arc::new(FakeAuthority::default().with_grant("fresh", Some("r-2")));
        let guard = CredentialGuard::new(store.clone(), authority);

        let cred = guard.ensure_valid().await.unwrap();
        assert_eq!(cred.access_token, "fresh");
        assert_eq!(cred.refresh_token.as_deref(), Some("r-2"));

        let reopened = ConfigStore::new(store.path());
        assert_eq!(reopened.get(keys::ACCESS_TOKEN).await.as_deref(), Some("fresh"));
        assert_eq!(reopened.get(keys::REFRESH_TOKEN).await.as_deref(), Some("r-2"));
    }

    #[tokio::test]
    async fn refresh_keeps_old_refresh_token_when_not_rotated() {
        let store = seeded_store(&[(keys::REFRESH_TOKEN, "r-1"), (keys::CLIENT_ID, "cid")]).await;
        let authority = Arc::new(FakeAuthority::default().with_grant("fresh", None));
        let guard = CredentialGuard::new(store.clone(), authority);

        let cred = guard.ensure_valid().await.unwrap();
        assert_eq!(cred.refresh_token.as_deref(), Some("r-1"));
        assert_eq!(store.get(keys::REFRESH_TOKEN).await.as_deref(), Some("r-1"));
    }

    #[tokio::test]
    async fn missing_refresh_token_is_fatal() {
        let store = seeded_store(&[(keys::ACCESS_TOKEN, "stale"), (keys::CLIENT_ID, "cid")]).await;
        let guard = CredentialGuard::new(store, Arc::new(FakeAuthority::default()));

        let err = guard.ensure_valid().await.unwrap_err();
        assert!(matches!(err, AuthError::MissingRefreshToken));
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn rejected_refresh_is_not_fatal() {
        let store = seeded_store(&[(keys::REFRESH_TOKEN, "revoked"), (keys::CLIENT_ID, "cid")]).await;
        let guard = CredentialGuard::new(store, Arc::new(FakeAuthority::default()));

        let err = guard.refresh().await.unwrap_err();
        assert!(matches!(err, AuthError::Rejected { .. }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn validate_request_uses_oauth_scheme() {
        let client =
            TwitchIdentityClient::new("https://id.twitch.tv/oauth2", Duration::from_secs(5)).unwrap();
        let req = client.build_validate_request("abc").unwrap();
        assert_eq!(req.method(), Method::GET);
        assert_eq!(req.url().as_str(), "https://id.twitch.tv/oauth2/validate");
        assert_eq!(
            req.headers().get(AUTHORIZATION).unwrap(),
            &HeaderValue::from_static("OAuth abc")
        );
    }

    #[test]
    fn refresh_request_is_form_encoded() {
        let client =
            TwitchIdentityClient::new("https://id.twitch.tv/oauth2/", Duration::from_secs(5)).unwrap();
        let req = client.build_refresh_request("r-1", "cid", "secret").unwrap();
        assert_eq!(req.method(), Method::POST);
        assert_eq!(req.url().as_str(), "https://id.twitch.tv/oauth2/token");

        let body = std::str::from_utf8(req.body().unwrap().as_bytes().unwrap()).unwrap();
        assert!(body.contains("grant_type=refresh_token"));
        assert!(body.contains("refresh_token=r-1"));
        assert!(body.contains("client_id=cid"));
    }

    #[test]
    fn validate_response_distinguishes_invalid_from_failure() {
        assert!(parse_validate_response(StatusCode::OK, "{}").unwrap());
        assert!(!parse_validate_response(StatusCode::UNAUTHORIZED, "").unwrap());
        assert!(parse_validate_response(StatusCode::INTERNAL_SERVER_ERROR, "").is_err());
    }
}
