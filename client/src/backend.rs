//! HTTP client for the backend collection service.
//!
//! Routes used:
//!   POST /sightings/                               → record one sighting
//!   GET  /achievements/users/{user_id}/collection  → the user's collection

use async_trait::async_trait;
use tracing::debug;

use birdlens_common::protocol::{CollectedBird, CollectionResponse, NewSighting, SightingReceipt};

use crate::error::ServiceError;

#[async_trait]
pub trait CollectionService: Send + Sync {
    async fn create_sighting(
        &self,
        auth_token: &str,
        sighting: &NewSighting,
    ) -> Result<SightingReceipt, ServiceError>;

    async fn fetch_collection(
        &self,
        user_id: &str,
        auth_token: &str,
    ) -> Result<Vec<CollectedBird>, ServiceError>;
}

#[derive(Debug, Clone)]
pub struct BackendClient {
    client: reqwest::Client,
    base_url: String,
}

impl BackendClient {
    pub fn new(client: reqwest::Client, base_url: &str) -> Self {
        BackendClient {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl CollectionService for BackendClient {
    async fn create_sighting(
        &self,
        auth_token: &str,
        sighting: &NewSighting,
    ) -> Result<SightingReceipt, ServiceError> {
        let url = format!("{}/sightings/", self.base_url);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(auth_token)
            .json(sighting)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(ServiceError::Status {
                url,
                status: resp.status().as_u16(),
            });
        }

        // The receipt is informational; an empty or odd body is not an error.
        let body = resp.text().await?;
        if body.trim().is_empty() {
            return Ok(SightingReceipt::default());
        }
        Ok(serde_json::from_str(&body).unwrap_or_else(|e| {
            debug!("Unreadable sighting receipt ({e}): {body}");
            SightingReceipt::default()
        }))
    }

    async fn fetch_collection(
        &self,
        user_id: &str,
        auth_token: &str,
    ) -> Result<Vec<CollectedBird>, ServiceError> {
        let url = format!(
            "{}/achievements/users/{}/collection",
            self.base_url, user_id
        );
        let resp = self
            .client
            .get(&url)
            .bearer_auth(auth_token)
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(ServiceError::Status {
                url,
                status: resp.status().as_u16(),
            });
        }

        let collection: CollectionResponse = resp.json().await?;
        Ok(collection.birds)
    }
}
