//! REST access to the board service: board metadata and card short links.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;
use url::Url;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status: {status} body={body}")]
    UnexpectedStatus {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("invalid endpoint: {0}")]
    Endpoint(#[from] url::ParseError),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Member {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub full_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Board {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub members: Vec<Member>,
}

#[derive(Debug, Deserialize)]
struct FieldValue {
    #[serde(rename = "_value")]
    value: String,
}

#[async_trait]
pub trait BoardApi: Send + Sync {
    /// Board name and member roster.
    async fn board(&self, board_id: &str) -> Result<Board, ApiError>;
    /// Public short URL of a card.
    async fn card_short_link(&self, card_id: &str) -> Result<String, ApiError>;
}

pub struct RestBoardApi {
    http: Client,
    base_url: Url,
    key: String,
    token: String,
    short_links: Mutex<HashMap<String, String>>,
}

impl RestBoardApi {
    pub fn new(base_url: Url, key: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url,
            key: key.into(),
            token: token.into(),
            short_links: Mutex::new(HashMap::new()),
        }
    }

    fn endpoint(&self, path: &str, query: &[(&str, &str)]) -> Result<Url, ApiError> {
        let mut url = self.base_url.join(path)?;
        url.query_pairs_mut()
            .extend_pairs(query)
            .append_pair("key", &self.key)
            .append_pair("token", &self.token);
        Ok(url)
    }

    async fn get<T: DeserializeOwned>(&self, url: Url) -> Result<T, ApiError> {
        let res = self.http.get(url).send().await?;
        if res.status().is_success() {
            Ok(res.json::<T>().await?)
        } else {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            Err(ApiError::UnexpectedStatus { status, body })
        }
    }
}

#[async_trait]
impl BoardApi for RestBoardApi {
    async fn board(&self, board_id: &str) -> Result<Board, ApiError> {
        let url = self.endpoint(
            &format!("1/boards/{board_id}"),
            &[("fields", "name"), ("members", "all")],
        )?;
        self.get(url).await
    }

    async fn card_short_link(&self, card_id: &str) -> Result<String, ApiError> {
        let cached = self.short_links.lock().get(card_id).cloned();
        if let Some(link) = cached {
            return Ok(link);
        }
        let url = self.endpoint(&format!("1/cards/{card_id}/shortUrl"), &[])?;
        let field: FieldValue = self.get(url).await?;
        debug!(target = "api", card = card_id, url = %field.value, "resolved short link");
        self.short_links
            .lock()
            .insert(card_id.to_string(), field.value.clone());
        Ok(field.value)
    }
}
