//! Argus Threat Deduplication - hash, pre-filter, arbitration contract
//!
//! The decision ladder runs cheapest-first: a semantic-hash/rule pre-filter
//! against recent stored threats, then contextual arbitration by the dedup
//! model only for analyses the rules cannot settle.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::llm::strip_fences;
use crate::models::{Threat, ThreatAnalysis, ThreatLevel, ThreatLocation, ThreatType};

/// Prefix length for the cheap summary comparison.
const SUMMARY_PREFIX_CHARS: usize = 80;
/// Mutual containment only applies to prefixes at least this long.
const CONTAINMENT_MIN_CHARS: usize = 30;
/// Locations closer than this are treated as the same incident site.
const SAME_SITE_KM: f64 = 1.0;
/// At most this many stored threats are shown to the arbitration model.
const ARBITRATION_CONTEXT_LIMIT: usize = 10;
const ARBITRATION_SUMMARY_CHARS: usize = 150;

/// Field-level patch applied to an existing threat on `update_existing`.
/// Only provided fields are written.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThreatPatch {
    #[serde(default)]
    pub level: Option<ThreatLevel>,
    #[serde(default)]
    pub threat_type: Option<ThreatType>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub keywords: Option<Vec<String>>,
    #[serde(default)]
    pub locations: Option<Vec<ThreatLocation>>,
    #[serde(default)]
    pub citations: Option<Vec<String>>,
    #[serde(default)]
    pub new_information: Option<String>,
}

/// Outcome of the decision ladder for one analysis.
#[derive(Debug, Clone)]
pub enum DedupDecision {
    New {
        /// Optional model-supplied overrides merged over the analysis.
        data: Option<JsonValue>,
        confidence: f64,
        reasoning: String,
    },
    Update {
        threat_id: Uuid,
        patch: ThreatPatch,
        confidence: f64,
        reasoning: String,
    },
    Duplicate { reasoning: String },
}

/// Deterministic 16-hex-char digest over a threat's identifying fields:
/// level, type, the first 100 summary chars, keywords, and locations
/// rounded to two decimals.
pub fn semantic_hash(
    level: ThreatLevel,
    threat_type: ThreatType,
    summary: &str,
    keywords: &[String],
    locations: &[ThreatLocation],
) -> String {
    let summary_head: String = summary.chars().take(100).collect();
    let location_part: Vec<String> = locations
        .iter()
        .map(|l| format!("{:.2},{:.2}", l.lat, l.lng))
        .collect();
    let input = format!(
        "{}|{}|{}|{}|{}",
        level.as_str(),
        threat_type.as_str(),
        summary_head,
        keywords.join(","),
        location_part.join(";"),
    );
    hex::encode(Sha256::digest(input.as_bytes()))[..16].to_string()
}

/// Lowercased, whitespace-collapsed first 80 characters of a summary.
pub fn normalized_prefix(summary: &str) -> String {
    summary
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .chars()
        .take(SUMMARY_PREFIX_CHARS)
        .collect()
}

pub fn haversine_km(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    const EARTH_RADIUS_KM: f64 = 6371.0;
    let d_lat = (lat2 - lat1).to_radians();
    let d_lng = (lng2 - lng1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().atan2((1.0 - a).sqrt())
}

fn shared_keyword_count(a: &[String], b: &[String]) -> usize {
    let b_lower: Vec<String> = b.iter().map(|k| k.trim().to_lowercase()).collect();
    a.iter()
        .map(|k| k.trim().to_lowercase())
        .filter(|k| !k.is_empty() && b_lower.contains(k))
        .count()
}

/// Rule-based pre-filter. Returns the duplicate reasoning when any rule
/// matches a stored threat, otherwise the analysis goes to arbitration.
pub fn rule_based_duplicate(
    analysis: &ThreatAnalysis,
    analysis_hash: &str,
    existing: &[Threat],
) -> Option<String> {
    let analysis_prefix = normalized_prefix(&analysis.summary);

    for threat in existing {
        if threat.level == analysis.threat_level
            && threat.threat_type == analysis.threat_type
            && threat.semantic_hash == analysis_hash
        {
            return Some(format!("semantic hash matches stored threat {}", threat.id));
        }

        let stored_prefix = normalized_prefix(&threat.summary);
        let prefixes_match = analysis_prefix == stored_prefix
            || (analysis_prefix.chars().count() >= CONTAINMENT_MIN_CHARS
                && stored_prefix.chars().count() >= CONTAINMENT_MIN_CHARS
                && (analysis_prefix.contains(&stored_prefix)
                    || stored_prefix.contains(&analysis_prefix)));
        if prefixes_match {
            return Some(format!("summary prefix matches stored threat {}", threat.id));
        }

        let shared = shared_keyword_count(&analysis.keywords, &threat.keywords);
        let required = if analysis.keywords.len() < 2 || threat.keywords.len() < 2 {
            1
        } else {
            2
        };
        if shared >= required {
            return Some(format!(
                "{shared} shared keywords with stored threat {}",
                threat.id
            ));
        }

        for a in &analysis.locations {
            for b in &threat.locations {
                let distance = haversine_km(a.lat, a.lng, b.lat, b.lng);
                if distance <= SAME_SITE_KM {
                    return Some(format!(
                        "location within {distance:.2} km of stored threat {}",
                        threat.id
                    ));
                }
            }
        }
    }
    None
}

/// Slimmed context for the arbitration model: at most ten stored threats,
/// summaries truncated, citations omitted.
pub fn build_arbitration_prompts(analysis: &ThreatAnalysis, existing: &[Threat]) -> (String, String) {
    let system = "You deduplicate incident reports against stored threats. \
        Reply with strict JSON only: {\"action\": \"new_threat\" | \"update_existing\" | \"duplicate\", \
        \"threat_id\": string?, \"threat_data\": object?, \"update_data\": object?, \
        \"reasoning\": string, \"confidence\": number}. \
        new_threat requires threat_data; update_existing requires threat_id and update_data."
        .to_string();

    let context: Vec<JsonValue> = existing
        .iter()
        .take(ARBITRATION_CONTEXT_LIMIT)
        .map(|threat| {
            json!({
                "id": threat.id,
                "level": threat.level,
                "type": threat.threat_type,
                "summary": threat.summary.chars().take(ARBITRATION_SUMMARY_CHARS).collect::<String>(),
                "keywords": threat.keywords,
                "locations": threat.locations.iter()
                    .map(|l| json!({"lat": l.lat, "lng": l.lng}))
                    .collect::<Vec<_>>(),
                "update_count": threat.update_count,
            })
        })
        .collect();

    let user = json!({
        "incoming_analysis": {
            "level": analysis.threat_level,
            "type": analysis.threat_type,
            "confidence": analysis.confidence_score,
            "summary": analysis.summary,
            "keywords": analysis.keywords,
            "locations": analysis.locations.iter()
                .map(|l| json!({"lat": l.lat, "lng": l.lng}))
                .collect::<Vec<_>>(),
        },
        "existing_threats": context,
    })
    .to_string();

    (system, user)
}

#[derive(Debug, Deserialize)]
struct ArbitrationRaw {
    action: String,
    #[serde(default)]
    threat_id: Option<Uuid>,
    #[serde(default)]
    threat_data: Option<JsonValue>,
    #[serde(default)]
    update_data: Option<ThreatPatch>,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
}

/// Parse and validate the arbitration reply. Errors carry the reason; the
/// pipeline falls back to `new_threat` at confidence 0.5.
pub fn parse_arbitration(text: &str) -> Result<DedupDecision, String> {
    let raw: ArbitrationRaw = serde_json::from_str(strip_fences(text))
        .map_err(|e| format!("invalid arbitration json: {e}"))?;

    let reasoning = raw.reasoning.unwrap_or_default();
    let confidence = raw.confidence.unwrap_or(0.5).clamp(0.0, 1.0);

    match raw.action.as_str() {
        "new_threat" => {
            let data = raw
                .threat_data
                .ok_or_else(|| "new_threat without threat_data".to_string())?;
            Ok(DedupDecision::New {
                data: Some(data),
                confidence,
                reasoning,
            })
        }
        "update_existing" => {
            let threat_id = raw
                .threat_id
                .ok_or_else(|| "update_existing without threat_id".to_string())?;
            let patch = raw
                .update_data
                .ok_or_else(|| "update_existing without update_data".to_string())?;
            Ok(DedupDecision::Update {
                threat_id,
                patch,
                confidence,
                reasoning,
            })
        }
        "duplicate" => Ok(DedupDecision::Duplicate { reasoning }),
        other => Err(format!("unknown action {other:?}")),
    }
}

/// Fallback decision when arbitration output cannot be used.
pub fn arbitration_fallback(reason: String) -> DedupDecision {
    DedupDecision::New {
        data: None,
        confidence: 0.5,
        reasoning: reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn location(lat: f64, lng: f64) -> ThreatLocation {
        ThreatLocation {
            lat,
            lng,
            name: None,
            confidence: 0.8,
            source: "social".to_string(),
            radius_km: None,
            area_description: None,
        }
    }

    fn analysis(summary: &str, keywords: &[&str]) -> ThreatAnalysis {
        ThreatAnalysis {
            threat_level: ThreatLevel::High,
            threat_type: ThreatType::Violence,
            confidence_score: 0.9,
            summary: summary.to_string(),
            locations: vec![],
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            reasoning: None,
            citations: vec![],
        }
    }

    fn stored(summary: &str, keywords: &[&str]) -> Threat {
        let keywords: Vec<String> = keywords.iter().map(|k| k.to_string()).collect();
        Threat {
            id: Uuid::new_v4(),
            level: ThreatLevel::High,
            threat_type: ThreatType::Violence,
            confidence: 0.9,
            summary: summary.to_string(),
            locations: vec![],
            keywords: keywords.clone(),
            citations: vec![],
            area: "seattle".to_string(),
            semantic_hash: semantic_hash(
                ThreatLevel::High,
                ThreatType::Violence,
                summary,
                &keywords,
                &[],
            ),
            update_count: 0,
            update_history: vec![],
            status: crate::models::ThreatStatus::Pending,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_semantic_hash_deterministic_and_rounded() {
        let keywords = vec!["shooter".to_string(), "downtown".to_string()];
        let a = semantic_hash(
            ThreatLevel::High,
            ThreatType::Violence,
            "Active shooter at Pike Place",
            &keywords,
            &[location(47.60923, -122.34211)],
        );
        let b = semantic_hash(
            ThreatLevel::High,
            ThreatType::Violence,
            "Active shooter at Pike Place",
            &keywords,
            // Same site within 2-decimal rounding.
            &[location(47.6091, -122.3422)],
        );
        assert_eq!(a.len(), 16);
        assert_eq!(a, b);

        let c = semantic_hash(
            ThreatLevel::Medium,
            ThreatType::Violence,
            "Active shooter at Pike Place",
            &keywords,
            &[location(47.60923, -122.34211)],
        );
        assert_ne!(a, c);
    }

    #[test]
    fn test_hash_uses_first_100_summary_chars() {
        let long_a = format!("{}{}", "a".repeat(100), "tail one");
        let long_b = format!("{}{}", "a".repeat(100), "different tail");
        let a = semantic_hash(ThreatLevel::Low, ThreatType::Cyber, &long_a, &[], &[]);
        let b = semantic_hash(ThreatLevel::Low, ThreatType::Cyber, &long_b, &[], &[]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_prefix_rule_matches_normalized_summaries() {
        let existing = vec![stored("Active  SHOOTER at Pike\nPlace Market reported", &[])];
        let incoming = analysis("active shooter at pike place market reported", &[]);
        let hash = semantic_hash(
            incoming.threat_level,
            incoming.threat_type,
            &incoming.summary,
            &incoming.keywords,
            &incoming.locations,
        );
        assert!(rule_based_duplicate(&incoming, &hash, &existing).is_some());
    }

    #[test]
    fn test_keyword_rule_thresholds() {
        let existing = vec![stored("unrelated summary text entirely", &["fire", "harbor"])];

        // Two shared keywords out of two-plus sets.
        let incoming = analysis("completely different words", &["FIRE", "harbor", "night"]);
        assert!(rule_based_duplicate(&incoming, "0000000000000000", &existing).is_some());

        // One shared keyword is enough when a set is small.
        let existing_small = vec![stored("unrelated summary text entirely", &["fire"])];
        let incoming = analysis("completely different words", &["fire", "harbor"]);
        assert!(rule_based_duplicate(&incoming, "0000000000000000", &existing_small).is_some());

        // One shared keyword is not enough for two large sets.
        let incoming = analysis("completely different words", &["fire", "uptown"]);
        assert!(rule_based_duplicate(&incoming, "0000000000000000", &existing).is_none());
    }

    #[test]
    fn test_location_proximity_rule() {
        let mut threat = stored("north harbor cranes damaged", &[]);
        threat.locations = vec![location(47.6062, -122.3321)];
        let existing = vec![threat];

        let mut incoming = analysis("different description of events", &[]);
        // ~300m away.
        incoming.locations = vec![location(47.6089, -122.3321)];
        assert!(rule_based_duplicate(&incoming, "0000000000000000", &existing).is_some());

        // ~20km away.
        incoming.locations = vec![location(47.78, -122.3321)];
        assert!(rule_based_duplicate(&incoming, "0000000000000000", &existing).is_none());
    }

    #[test]
    fn test_arbitration_context_is_slimmed() {
        let existing: Vec<Threat> = (0..14)
            .map(|i| stored(&format!("{} {}", "s".repeat(200), i), &["k"]))
            .collect();
        let (_, user) = build_arbitration_prompts(&analysis("incoming", &[]), &existing);
        let parsed: JsonValue = serde_json::from_str(&user).unwrap();

        let context = parsed["existing_threats"].as_array().unwrap();
        assert_eq!(context.len(), 10);
        for entry in context {
            assert!(entry["summary"].as_str().unwrap().chars().count() <= 150);
            assert!(entry.get("citations").is_none());
        }
    }

    #[test]
    fn test_parse_arbitration_actions() {
        let id = Uuid::new_v4();

        let update = parse_arbitration(&format!(
            r#"{{"action":"update_existing","threat_id":"{id}","update_data":{{"summary":"new"}},"reasoning":"same incident","confidence":0.8}}"#
        ))
        .unwrap();
        match update {
            DedupDecision::Update { threat_id, patch, confidence, .. } => {
                assert_eq!(threat_id, id);
                assert_eq!(patch.summary.as_deref(), Some("new"));
                assert!((confidence - 0.8).abs() < 1e-9);
            }
            other => panic!("unexpected decision {:?}", other),
        }

        let dup = parse_arbitration(r#"{"action":"duplicate","reasoning":"same"}"#).unwrap();
        assert!(matches!(dup, DedupDecision::Duplicate { .. }));

        let fenced = parse_arbitration(
            "```json\n{\"action\":\"new_threat\",\"threat_data\":{},\"reasoning\":\"r\"}\n```",
        )
        .unwrap();
        assert!(matches!(fenced, DedupDecision::New { .. }));
    }

    #[test]
    fn test_parse_arbitration_rejects_incomplete_replies() {
        assert!(parse_arbitration(r#"{"action":"update_existing","reasoning":"r"}"#).is_err());
        assert!(parse_arbitration(r#"{"action":"new_threat"}"#).is_err());
        assert!(parse_arbitration(r#"{"action":"merge"}"#).is_err());
        assert!(parse_arbitration("not json").is_err());

        match arbitration_fallback("parse failed".to_string()) {
            DedupDecision::New { data, confidence, .. } => {
                assert!(data.is_none());
                assert!((confidence - 0.5).abs() < 1e-9);
            }
            other => panic!("unexpected fallback {:?}", other),
        }
    }
}
