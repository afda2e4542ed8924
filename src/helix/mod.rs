use async_trait::async_trait;
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE},
    Client, Method, Request, StatusCode, Url,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::auth::{normalize_base, AuthError, Credential, CredentialGuard};
use crate::model::SubscriptionRequest;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessageRequest {
    pub broadcaster_id: String,
    pub sender_id: String,
    pub message: String,
}

#[derive(Debug, Error)]
pub enum HelixError {
    #[error("helix api error {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("helix http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("helix encode error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid header value: {0}")]
    InvalidHeaderValue(#[from] reqwest::header::InvalidHeaderValue),
    #[error("helix url error: {0}")]
    Url(String),
    #[error(transparent)]
    Auth(#[from] AuthError),
}

#[async_trait]
pub trait EventSubApi: Send + Sync {
    async fn create_subscription(&self, request: &SubscriptionRequest) -> Result<(), HelixError>;

    async fn send_chat_message(&self, request: &ChatMessageRequest) -> Result<(), HelixError>;
}

#[derive(Clone)]
pub struct HelixClient {
    http: Client,
    base_url: Url,
    guard: Arc<CredentialGuard>,
}

impl HelixClient {
    pub fn new(
        base_url: &str,
        guard: Arc<CredentialGuard>,
        timeout: Duration,
    ) -> Result<Self, HelixError> {
        let base_url = normalize_base(base_url)?;
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url,
            guard,
        })
    }

    pub fn build_post_request<T: Serialize>(
        &self,
        path: &str,
        body: &T,
        client_id: &str,
        credential: &Credential,
    ) -> Result<Request, HelixError> {
        let url = self
            .base_url
            .join(path)
            .map_err(|err| HelixError::Url(err.to_string()))?;
        let body = serde_json::to_vec(body)?;
        Ok(self
            .http
            .request(Method::POST, url)
            .headers(common_headers(client_id, &credential.access_token)?)
            .body(body)
            .build()?)
    }

    // One POST, retried once after a token refresh if the first attempt is
    // answered with 401.
    async fn post<T: Serialize + Sync>(&self, path: &str, body: &T) -> Result<(), HelixError> {
        let client_id = self.guard.client_id().await?;
        let credential = self.guard.current().await;

        let req = self.build_post_request(path, body, &client_id, &credential)?;
        let resp = self.http.execute(req).await?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            let status = resp.status();
            let text = resp.text().await?;
            return parse_post_response(status, &text);
        }

        tracing::warn!(path, "helix request unauthorized, refreshing token and retrying");
        let credential = self.guard.refresh().await?;
        let req = self.build_post_request(path, body, &client_id, &credential)?;
        let resp = self.http.execute(req).await?;
        let status = resp.status();
        let text = resp.text().await?;
        parse_post_response(status, &text)
    }
}

#[async_trait]
impl EventSubApi for HelixClient {
    async fn create_subscription(&self, request: &SubscriptionRequest) -> Result<(), HelixError> {
        self.post("eventsub/subscriptions", request).await
    }

    async fn send_chat_message(&self, request: &ChatMessageRequest) -> Result<(), HelixError> {
        self.post("chat/messages", request).await
    }
}

fn common_headers(client_id: &str, access_token: &str) -> Result<HeaderMap, HelixError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        HeaderName::from_static("client-id"),
        HeaderValue::from_str(client_id.trim())?,
    );
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", access_token.trim()))?,
    );
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    Ok(headers)
}

pub fn parse_post_response(status: StatusCode, body: &str) -> Result<(), HelixError> {
    if status.is_success() {
        Ok(())
    } else {
        Err(HelixError::Api {
            status,
            body: body.to_string(),
        })
    }
}
