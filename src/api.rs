//! REST client for the case-tracking backend.
//!
//! Only the endpoints the synchronization layer needs: the kanban move behind
//! optimistic mutations, the board snapshot used for resynchronization, and the
//! notification list used as the polling fallback.

// Rust guideline compliant 2026-02

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;

use crate::constants;
use crate::error::MutationError;
use crate::kanban::{BoardCard, BoardSource, MoveRemote};
use crate::protocol::{EntityId, NotificationPayload};

/// API client for the case-tracking server.
///
/// Encapsulates HTTP client configuration and bearer authentication.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    token: String,
}

impl ApiClient {
    /// Creates a new API client with the default request timeout.
    ///
    /// # Arguments
    ///
    /// * `base_url` - Base URL of the server (e.g. `https://api.example.com`)
    /// * `token` - Bearer credential
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(constants::HTTP_REQUEST_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self::with_client(client, base_url, token))
    }

    /// Creates an API client with a pre-configured HTTP client.
    ///
    /// Useful for testing or when custom client configuration is needed.
    pub fn with_client(client: Client, base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    /// Moves a process to another kanban column.
    ///
    /// `PUT /api/processes/kanban/{id}/move?new_status={status}`; any 2xx is
    /// success.
    pub async fn move_process(&self, id: &EntityId, new_status: &str) -> Result<(), MutationError> {
        let url = format!("{}/api/processes/kanban/{}/move", self.base_url, id);

        let response = self
            .client
            .put(&url)
            .bearer_auth(&self.token)
            .query(&[("new_status", new_status)])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    MutationError::Timeout(constants::HTTP_REQUEST_TIMEOUT)
                } else {
                    MutationError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            log::debug!("[Api] Moved process {} to {}", id, new_status);
            Ok(())
        } else {
            log::warn!(
                "[Api] Move of process {} to {} rejected: {}",
                id,
                new_status,
                status
            );
            Err(MutationError::Rejected {
                status: status.as_u16(),
            })
        }
    }

    /// Fetches the full kanban board.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the response cannot be parsed.
    pub async fn fetch_kanban(&self) -> Result<Vec<BoardCard>> {
        let url = format!("{}/api/processes/kanban", self.base_url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .context("kanban request failed")?;

        if !response.status().is_success() {
            anyhow::bail!("Failed to fetch kanban board: {}", response.status());
        }
        response
            .json()
            .await
            .context("invalid kanban response body")
    }

    /// Fetches the notification list (polling fallback).
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the response cannot be parsed.
    pub async fn fetch_notifications(&self) -> Result<Vec<NotificationPayload>> {
        let url = format!("{}/api/notifications", self.base_url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .context("notifications request failed")?;

        if !response.status().is_success() {
            anyhow::bail!("Failed to fetch notifications: {}", response.status());
        }
        response
            .json()
            .await
            .context("invalid notifications response body")
    }
}

#[async_trait]
impl MoveRemote for ApiClient {
    async fn move_process(&self, id: &EntityId, new_status: &str) -> Result<(), MutationError> {
        ApiClient::move_process(self, id, new_status).await
    }
}

#[async_trait]
impl BoardSource for ApiClient {
    async fn fetch_board(&self) -> Result<Vec<BoardCard>> {
        self.fetch_kanban().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_move_process_sends_bearer_and_status() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/api/processes/kanban/42/move"))
            .and(query_param("new_status", "aprovado"))
            .and(header("authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let api = ApiClient::new(server.uri(), "tok").unwrap();
        api.move_process(&EntityId::Num(42), "aprovado").await.unwrap();
    }

    #[tokio::test]
    async fn test_move_process_non_2xx_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let api = ApiClient::new(server.uri(), "tok").unwrap();
        let err = api
            .move_process(&EntityId::Num(1), "aprovado")
            .await
            .unwrap_err();
        assert_eq!(err, MutationError::Rejected { status: 403 });
    }

    #[tokio::test]
    async fn test_move_process_unreachable_is_network_error() {
        let api = ApiClient::new("http://127.0.0.1:1", "tok").unwrap();
        let err = api
            .move_process(&EntityId::Num(1), "aprovado")
            .await
            .unwrap_err();
        assert!(matches!(err, MutationError::Network(_)));
    }

    #[tokio::test]
    async fn test_fetch_kanban_parses_cards() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/processes/kanban"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"id": 1, "status": "em_analise"},
                {"id": "p-2", "status": "aprovado"}
            ])))
            .mount(&server)
            .await;

        let api = ApiClient::new(format!("{}/", server.uri()), "tok").unwrap();
        let cards = api.fetch_kanban().await.unwrap();
        assert_eq!(cards.len(), 2);
        assert_eq!(cards[1].id, EntityId::Text("p-2".into()));
    }

    #[tokio::test]
    async fn test_fetch_notifications_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/notifications"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let api = ApiClient::new(server.uri(), "tok").unwrap();
        assert!(api.fetch_notifications().await.is_err());
    }
}
