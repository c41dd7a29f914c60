//! Detection data model.
//!
//! A [`RawDetection`] is what the analysis service sends.  A [`Detection`]
//! is the cleaned-up, optionally enriched record the client works with, and
//! an [`IdentifiedBird`] is its session-local "new species" form.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::protocol::NewSighting;

/// One species result as it arrives on the wire.  Every field is optional
/// because service versions omit different ones; `null` or a value of the
/// wrong type reads as absent (text) or zero (numbers).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawDetection {
    #[serde(default, deserialize_with = "lenient_text")]
    pub species_name: Option<String>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub species_code: Option<String>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub confidence: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub start_time: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub end_time: f64,
}

/// String or number as text.
pub(crate) fn lenient_text<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

/// Number or numeric string; anything else is 0.
fn lenient_f64<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    })
}

/// A species recognition result for one submitted clip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Stable key (taxonomy code).
    pub species_code: String,
    /// Label exactly as reported by the analysis service.
    pub species_label: String,
    /// Always within `0.0..=1.0`.
    pub confidence: f64,
    pub start_time: f64,
    pub end_time: f64,
    pub scientific_name: Option<String>,
    pub common_name: Option<String>,
}

impl Detection {
    /// Build from a wire record.
    ///
    /// Confidence is clamped into `0.0..=1.0` and a reversed time span is
    /// swapped.  Without a species code the label doubles as the key.
    /// BirdNET-style labels (`Turdus merula_Eurasian Blackbird`) pre-fill
    /// both names; anything else is taken as a common name.
    pub fn from_raw(raw: RawDetection) -> Self {
        let label = raw.species_name.unwrap_or_default().trim().to_string();
        let species_code = raw
            .species_code
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| label.clone());

        let confidence = if raw.confidence.is_nan() {
            0.0
        } else {
            raw.confidence.clamp(0.0, 1.0)
        };
        let (start_time, end_time) = if raw.start_time <= raw.end_time {
            (raw.start_time, raw.end_time)
        } else {
            (raw.end_time, raw.start_time)
        };

        let (scientific_name, common_name) = split_label(&label);

        Detection {
            species_code,
            species_label: label,
            confidence,
            start_time,
            end_time,
            scientific_name,
            common_name,
        }
    }

    /// Best human-readable name.
    pub fn display_name(&self) -> &str {
        self.common_name
            .as_deref()
            .or(self.scientific_name.as_deref())
            .unwrap_or(&self.species_label)
    }

    /// Sighting payload for `user_id`, observed at `at`.
    pub fn to_sighting(&self, user_id: &str, at: DateTime<Utc>) -> NewSighting {
        NewSighting {
            user_id: user_id.to_string(),
            species_name: self
                .scientific_name
                .clone()
                .unwrap_or_else(|| self.species_label.clone()),
            common_name: self.display_name().to_string(),
            timestamp: at.to_rfc3339(),
        }
    }
}

impl std::fmt::Display for Detection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Detection({}, {}, {:.4}, {:.1}-{:.1}s)",
            self.species_code,
            self.display_name(),
            self.confidence,
            self.start_time,
            self.end_time
        )
    }
}

/// Split `Scientific_Common` labels.  Only exactly one underscore counts.
fn split_label(label: &str) -> (Option<String>, Option<String>) {
    if label.is_empty() {
        return (None, None);
    }
    if label.matches('_').count() == 1 {
        if let Some((sci, com)) = label.split_once('_') {
            let sci = sci.trim();
            let com = com.trim();
            if !sci.is_empty() && !com.is_empty() {
                return (Some(sci.to_string()), Some(com.to_string()));
            }
        }
    }
    (None, Some(label.to_string()))
}

/// A species recognised this session but not yet in the user's collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentifiedBird {
    pub species_code: String,
    pub scientific_name: Option<String>,
    pub common_name: String,
    pub confidence: Option<f64>,
    pub detected_at: DateTime<Utc>,
}

impl IdentifiedBird {
    pub fn from_detection(detection: &Detection, detected_at: DateTime<Utc>) -> Self {
        IdentifiedBird {
            species_code: detection.species_code.clone(),
            scientific_name: detection.scientific_name.clone(),
            common_name: detection.display_name().to_string(),
            confidence: Some(detection.confidence),
            detected_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn raw(label: &str, code: Option<&str>, confidence: f64) -> RawDetection {
        RawDetection {
            species_name: Some(label.into()),
            species_code: code.map(Into::into),
            confidence,
            start_time: 0.0,
            end_time: 3.0,
        }
    }

    #[test]
    fn test_raw_detection_tolerates_nulls_and_odd_types() {
        let r: RawDetection = serde_json::from_str(
            r#"{"species_name":null,"species_code":4021,"confidence":"0.75","start_time":null,"end_time":[1]}"#,
        )
        .unwrap();
        assert_eq!(r.species_name, None);
        assert_eq!(r.species_code.as_deref(), Some("4021"));
        assert_eq!(r.confidence, 0.75);
        assert_eq!(r.start_time, 0.0);
        assert_eq!(r.end_time, 0.0);

        let r: RawDetection = serde_json::from_str("{}").unwrap();
        assert_eq!(r, RawDetection::default());
    }

    #[test]
    fn test_birdnet_label_split() {
        let d = Detection::from_raw(raw("Turdus merula_Eurasian Blackbird", Some("eurbla"), 0.8));
        assert_eq!(d.species_code, "eurbla");
        assert_eq!(d.scientific_name.as_deref(), Some("Turdus merula"));
        assert_eq!(d.common_name.as_deref(), Some("Eurasian Blackbird"));
    }

    #[test]
    fn test_plain_label_is_common_name() {
        let d = Detection::from_raw(raw("American Robin", Some("amerob"), 0.5));
        assert_eq!(d.scientific_name, None);
        assert_eq!(d.display_name(), "American Robin");
    }

    #[test]
    fn test_missing_code_falls_back_to_label() {
        let d = Detection::from_raw(raw("House Sparrow", None, 0.5));
        assert_eq!(d.species_code, "House Sparrow");
        let d = Detection::from_raw(raw("House Sparrow", Some("  "), 0.5));
        assert_eq!(d.species_code, "House Sparrow");
    }

    #[test]
    fn test_confidence_and_span_normalised() {
        let mut r = raw("x", Some("x1"), 1.7);
        r.start_time = 6.0;
        r.end_time = 3.0;
        let d = Detection::from_raw(r);
        assert_eq!(d.confidence, 1.0);
        assert_eq!((d.start_time, d.end_time), (3.0, 6.0));

        let d = Detection::from_raw(raw("x", Some("x1"), -0.2));
        assert_eq!(d.confidence, 0.0);
        let d = Detection::from_raw(raw("x", Some("x1"), f64::NAN));
        assert_eq!(d.confidence, 0.0);
    }

    #[test]
    fn test_to_sighting_fallbacks() {
        let at = Utc.with_ymd_and_hms(2024, 6, 15, 10, 30, 0).unwrap();
        let d = Detection::from_raw(raw("American Robin", Some("amerob"), 0.5));
        let s = d.to_sighting("u1", at);
        assert_eq!(s.user_id, "u1");
        assert_eq!(s.species_name, "American Robin");
        assert_eq!(s.common_name, "American Robin");
        assert_eq!(s.timestamp, "2024-06-15T10:30:00+00:00");
    }

    #[test]
    fn test_detection_display() {
        let d = Detection::from_raw(raw("Turdus merula_Eurasian Blackbird", Some("eurbla"), 0.92));
        let s = format!("{d}");
        assert!(s.contains("eurbla"));
        assert!(s.contains("Eurasian Blackbird"));
    }
}
