//! Wire types: the duplex analysis protocol and the HTTP payloads of the
//! backend collection and taxonomy services.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::detection::{lenient_text, RawDetection};

// ── duplex link ──────────────────────────────────────────────────────────

/// Frame sent from the client to the analysis service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    AnalyzeAudio {
        /// Base64-encoded audio clip.
        audio: String,
        filename: String,
    },
}

impl ClientMessage {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Frame received from the analysis service, discriminated by `type`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Handshake sent right after the link opens.
    Connected {
        #[serde(default)]
        available_commands: Value,
    },
    AnalysisAccepted {
        #[serde(default)]
        analysis_id: Value,
    },
    AnalysisProgress {
        #[serde(default, deserialize_with = "lenient_message")]
        message: String,
    },
    AnalysisCompleted(CompletedPayload),
    Error {
        #[serde(default, deserialize_with = "lenient_message")]
        message: String,
    },
    /// Any `type` this client does not know about.
    #[serde(other)]
    Unknown,
}

impl ServerMessage {
    /// Decode one text frame.
    pub fn decode(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

/// Body of an `analysis_completed` frame.
///
/// Service versions disagree on where the detection list lives, so all
/// three known placements are accepted.  The list is kept as raw JSON so
/// one unreadable element cannot sink the whole frame.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CompletedPayload {
    #[serde(default)]
    pub result: Value,
    #[serde(default)]
    pub detections: Value,
    #[serde(default)]
    pub analysis: Value,
}

impl CompletedPayload {
    /// The detection list, from the first placement holding one.  Elements
    /// that are not detection objects are skipped.
    pub fn into_detections(self) -> Vec<RawDetection> {
        let list = [
            &self.result["detections"],
            &self.detections,
            &self.analysis["detections"],
        ]
        .into_iter()
        .find_map(Value::as_array);
        let Some(list) = list else {
            return Vec::new();
        };

        list.iter()
            .filter_map(|item| match RawDetection::deserialize(item) {
                Ok(raw) => Some(raw),
                Err(e) => {
                    warn!("Skipping unreadable detection ({e}): {item}");
                    None
                }
            })
            .collect()
    }
}

fn lenient_message<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    lenient_text(d).map(Option::unwrap_or_default)
}

/// Render a JSON scalar id (`"a1"` or `17`) as text.
pub fn id_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

// ── backend collection service ───────────────────────────────────────────

/// Body of `POST /sightings/`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewSighting {
    pub user_id: String,
    /// Scientific name.
    pub species_name: String,
    pub common_name: String,
    /// RFC 3339 observation time.
    pub timestamp: String,
}

/// Response of `POST /sightings/`.  Only the achievement list is read.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SightingReceipt {
    #[serde(default)]
    pub achievements_unlocked: Vec<Value>,
}

/// Response of `GET /achievements/users/{id}/collection`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectionResponse {
    #[serde(default)]
    pub birds: Vec<CollectedBird>,
}

/// One species in the user's durable collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectedBird {
    pub species_name: String,
    #[serde(default)]
    pub common_name: String,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub first_seen_at: Option<String>,
}

// ── taxonomy reference service ───────────────────────────────────────────

/// One element of the eBird taxonomy response list.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaxonRecord {
    pub sci_name: Option<String>,
    pub com_name: Option<String>,
}
