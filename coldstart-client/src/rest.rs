//! Thin reqwest client over the persistence API.

use std::time::Duration;

use reqwest::{Client, Response, Url};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::error::ClientError;
use crate::model::StoredMessage;

const FETCH_TIMEOUT_SECS: u64 = 10;

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

#[derive(Deserialize)]
struct MarkReadBody {
    updated: usize,
}

pub struct ChatApi {
    http: Client,
    base_url: Url,
    bearer: String,
}

impl ChatApi {
    pub fn new(base_url: &str, token: &str) -> Result<Self, ClientError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(FETCH_TIMEOUT_SECS))
            .build()?;

        let base_url = Url::parse(base_url)
            .map_err(|e| ClientError::Validation(format!("Invalid API url {}: {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(ClientError::Validation(format!("Invalid API url {}", base_url)));
        }

        Ok(Self {
            http,
            base_url,
            bearer: format!("Bearer {}", token),
        })
    }

    /// Base url plus `segments`, each percent-encoded as a single path segment.
    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    /// Store a message from the token's owner to `receiver`.
    pub async fn persist(&self, receiver: &str, content: &str) -> Result<StoredMessage, ClientError> {
        let response = self
            .http
            .post(self.endpoint(&["api", "chat"]))
            .header(reqwest::header::AUTHORIZATION, &self.bearer)
            .json(&json!({ "receiverId": receiver, "content": content }))
            .send()
            .await?;

        let message: StoredMessage = check(response).await?.json().await?;
        debug!(id = %message.id, "Message persisted");
        Ok(message)
    }

    /// Full conversation with `peer`, oldest first.
    pub async fn history(&self, peer: &str) -> Result<Vec<StoredMessage>, ClientError> {
        let response = self
            .http
            .get(self.endpoint(&["api", "chat", peer]))
            .header(reqwest::header::AUTHORIZATION, &self.bearer)
            .send()
            .await?;

        Ok(check(response).await?.json().await?)
    }

    /// Mark everything `sender` sent to the token's owner as read.
    pub async fn mark_read(&self, sender: &str) -> Result<usize, ClientError> {
        let response = self
            .http
            .put(self.endpoint(&["api", "chat", "read", sender]))
            .header(reqwest::header::AUTHORIZATION, &self.bearer)
            .send()
            .await?;

        let body: MarkReadBody = check(response).await?.json().await?;
        Ok(body.updated)
    }
}

async fn check(response: Response) -> Result<Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let message = match response.json::<ErrorBody>().await {
        Ok(body) => body.message,
        Err(_) => status.canonical_reason().unwrap_or("unknown error").to_string(),
    };
    Err(ClientError::Status {
        status: status.as_u16(),
        message,
    })
}
