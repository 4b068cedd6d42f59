use std::sync::Arc;

use async_trait::async_trait;
use listentogether_core::{Config, QueueSnapshot, Room, SearchResult, SongLink, User};
use log::error;
use reqwest::{Client, RequestBuilder};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

pub type ApiResult<T> = Result<T, ApiError>;
pub type BoxedApi = Arc<dyn Api>;

/// A failed api request, either at the HTTP level or reported by the server.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{message}")]
pub struct ApiError {
    pub message: String,
    /// The HTTP status of the response, if one arrived
    pub status: Option<u16>,
    /// The status reported in the response body, falling back to the HTTP status
    pub status_code: Option<u16>,
}

impl ApiError {
    pub fn new(message: impl Into<String>, status: Option<u16>) -> Self {
        Self {
            message: message.into(),
            status,
            status_code: status,
        }
    }

    /// Whether the server says the room does not exist
    pub fn is_room_not_found(&self) -> bool {
        let message = self.message.to_lowercase();

        message.contains("room not found")
            || message.contains("room does not exist")
            || self.status == Some(404)
            || self.status_code == Some(404)
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(value: reqwest::Error) -> Self {
        Self::new(value.to_string(), value.status().map(|s| s.as_u16()))
    }
}

/// The room and the user created for the caller, returned when creating or joining a room
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomSession {
    pub room: Room,
    pub user: User,
}

/// Represents a type that can talk to the listentogether REST api
#[async_trait]
pub trait Api
where
    Self: Send + Sync + 'static,
{
    async fn create_room(&self, room_name: &str, user_name: &str) -> ApiResult<RoomSession>;
    async fn join_room(&self, room_code: &str, user_name: &str) -> ApiResult<RoomSession>;

    async fn search(&self, query: &str, limit: usize) -> ApiResult<Vec<SearchResult>>;
    async fn suggestions(&self) -> ApiResult<Vec<String>>;

    async fn add_search_result(
        &self,
        room_code: &str,
        result: &SearchResult,
        added_by: &str,
    ) -> ApiResult<()>;
    async fn add_to_queue(&self, room_code: &str, link: &SongLink, added_by: &str)
        -> ApiResult<()>;
    async fn queue(&self, room_code: &str) -> ApiResult<QueueSnapshot>;
    async fn remove_from_queue(&self, room_code: &str, index: usize) -> ApiResult<()>;
}

/// The response envelope every endpoint wraps its data in
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    data: Value,
    error: Option<String>,
    status_code: Option<u16>,
}

/// [Api] over HTTP
pub struct HttpApi {
    client: Client,
    base_url: String,
}

impl HttpApi {
    pub const DEFAULT_SEARCH_LIMIT: usize = 20;

    pub fn new(config: &Config) -> Self {
        Self {
            client: Client::new(),
            base_url: config.api_url.trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.base_url, endpoint)
    }

    async fn send<T>(&self, request: RequestBuilder) -> ApiResult<T>
    where
        T: DeserializeOwned,
    {
        let result = async {
            let response = request.send().await?;
            let status = response.status();
            let body = response.text().await?;

            parse_response(status.as_u16(), status.is_success(), &body)
        }
        .await;

        if let Err(e) = &result {
            error!(
                "API request failed: {e} (status: {})",
                e.status.map(|s| s.to_string()).unwrap_or_else(|| "-".to_string())
            );
        }

        result
    }
}

/// Unwraps the envelope of a response body.
fn parse_response<T>(status: u16, ok: bool, body: &str) -> ApiResult<T>
where
    T: DeserializeOwned,
{
    let http_error = || format!("HTTP error! status: {status}");

    let envelope: Envelope =
        serde_json::from_str(body).map_err(|_| ApiError::new(http_error(), Some(status)))?;

    let status_code = Some(envelope.status_code.unwrap_or(status));

    if !ok {
        return Err(ApiError {
            message: envelope.error.unwrap_or_else(http_error),
            status: Some(status),
            status_code,
        });
    }

    if !envelope.success {
        return Err(ApiError {
            message: envelope
                .error
                .unwrap_or_else(|| "API request failed".to_string()),
            status: Some(status),
            status_code,
        });
    }

    T::deserialize(envelope.data)
        .map_err(|e| ApiError::new(format!("Unexpected response data: {e}"), Some(status)))
}

#[async_trait]
impl Api for HttpApi {
    async fn create_room(&self, _room_name: &str, user_name: &str) -> ApiResult<RoomSession> {
        // The server names rooms itself, only the creator's name is sent
        let request = self
            .client
            .post(self.url("/rooms"))
            .json(&json!({ "name": user_name }));

        self.send(request).await
    }

    async fn join_room(&self, room_code: &str, user_name: &str) -> ApiResult<RoomSession> {
        let request = self
            .client
            .post(self.url("/rooms/join"))
            .json(&json!({ "code": room_code, "name": user_name }));

        self.send(request).await
    }

    async fn search(&self, query: &str, limit: usize) -> ApiResult<Vec<SearchResult>> {
        let request = self
            .client
            .get(self.url("/search"))
            .query(&[("query", query.trim()), ("limit", &limit.to_string())]);

        self.send(request).await
    }

    async fn suggestions(&self) -> ApiResult<Vec<String>> {
        self.send(self.client.get(self.url("/search/suggestions")))
            .await
    }

    async fn add_search_result(
        &self,
        room_code: &str,
        result: &SearchResult,
        added_by: &str,
    ) -> ApiResult<()> {
        let request = self
            .client
            .post(self.url(&format!("/queue/{room_code}/add-search-result")))
            .json(&json!({ "searchResult": result, "addedBy": added_by }));

        self.send::<Value>(request).await.map(|_| ())
    }

    async fn add_to_queue(
        &self,
        room_code: &str,
        link: &SongLink,
        added_by: &str,
    ) -> ApiResult<()> {
        let request = self
            .client
            .post(self.url(&format!("/queue/{room_code}/add")))
            .json(&json!({ "songData": link, "addedBy": added_by }));

        self.send::<Value>(request).await.map(|_| ())
    }

    async fn queue(&self, room_code: &str) -> ApiResult<QueueSnapshot> {
        self.send(self.client.get(self.url(&format!("/queue/{room_code}"))))
            .await
    }

    async fn remove_from_queue(&self, room_code: &str, index: usize) -> ApiResult<()> {
        let request = self
            .client
            .delete(self.url(&format!("/queue/{room_code}/{index}")));

        self.send::<Value>(request).await.map(|_| ())
    }
}
