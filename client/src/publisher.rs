//! Sighting publisher – records one sighting per detection on the backend,
//! then refreshes the user's collection once.
//!
//! Best effort: a failed sighting is logged and skipped, nothing is retried,
//! and without a usable session nothing is sent at all.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};

use birdlens_common::detection::Detection;
use birdlens_common::protocol::CollectedBird;

use crate::backend::CollectionService;
use crate::error::ServiceError;

/// Credentials of the signed-in user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserSession {
    pub user_id: String,
    pub auth_token: String,
}

impl UserSession {
    pub fn new(user_id: impl Into<String>, auth_token: impl Into<String>) -> Self {
        UserSession {
            user_id: user_id.into(),
            auth_token: auth_token.into(),
        }
    }

    /// Both the user id and the token are present.
    pub fn is_valid(&self) -> bool {
        !self.user_id.trim().is_empty() && !self.auth_token.trim().is_empty()
    }
}

/// What one publish pass achieved.
#[derive(Debug, Clone, Default)]
pub struct PublishReport {
    pub created: usize,
    pub failed: usize,
    pub achievements_unlocked: Vec<Value>,
    /// The refreshed collection, when the refresh succeeded.
    pub collection: Option<Vec<CollectedBird>>,
}

pub struct SightingPublisher {
    backend: Arc<dyn CollectionService>,
}

impl SightingPublisher {
    pub fn new(backend: Arc<dyn CollectionService>) -> Self {
        SightingPublisher { backend }
    }

    /// Record `detections` for the session's user, then refresh the
    /// collection once, even when there was nothing to record.  Returns
    /// `None` when the step was skipped for lack of a valid session.
    pub async fn publish(
        &self,
        detections: &[Detection],
        session: Option<&UserSession>,
    ) -> Option<PublishReport> {
        let session = match session {
            Some(s) if s.is_valid() => s,
            _ => {
                info!(
                    "No signed-in user – keeping {} detection(s) local only",
                    detections.len()
                );
                return None;
            }
        };
        let mut report = PublishReport::default();
        for detection in detections {
            let sighting = detection.to_sighting(&session.user_id, Utc::now());
            match self
                .backend
                .create_sighting(&session.auth_token, &sighting)
                .await
            {
                Ok(receipt) => {
                    report.created += 1;
                    if !receipt.achievements_unlocked.is_empty() {
                        info!(
                            "{} achievement(s) unlocked by {}",
                            receipt.achievements_unlocked.len(),
                            sighting.common_name
                        );
                    }
                    report
                        .achievements_unlocked
                        .extend(receipt.achievements_unlocked);
                }
                Err(e) => {
                    report.failed += 1;
                    warn!("Cannot record sighting of {}: {e}", sighting.common_name);
                }
            }
        }
        info!(
            "Recorded {}/{} sighting(s) for user {}",
            report.created,
            detections.len(),
            session.user_id
        );

        match self.refresh_collection(session).await {
            Ok(birds) => report.collection = Some(birds),
            Err(e) => warn!("Collection refresh failed: {e}"),
        }
        Some(report)
    }

    /// Fetch the durable collection of the session's user.
    pub async fn refresh_collection(
        &self,
        session: &UserSession,
    ) -> Result<Vec<CollectedBird>, ServiceError> {
        if !session.is_valid() {
            return Err(ServiceError::MissingCredentials("user session"));
        }
        let birds = self
            .backend
            .fetch_collection(&session.user_id, &session.auth_token)
            .await?;
        debug!("Collection of {} has {} species", session.user_id, birds.len());
        Ok(birds)
    }
}
