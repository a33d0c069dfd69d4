//! Argus Threat Pipeline - LLM search, dedup ladder, threat commits
//!
//! One tick per monitor per interval. Provider failures never escape a
//! tick; the supervisor only sees the outcome counters.

use chrono::{Duration, Utc};
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::dedup::{
    self, arbitration_fallback, parse_arbitration, semantic_hash, DedupDecision, ThreatPatch,
};
use crate::errors::ApiError;
use crate::llm::{
    estimate_cost, InputMessage, LlmClient, LlmError, ProviderRequest, TextOptions, ToolSpec,
    DEDUP_TIMEOUT, SEARCH_TIMEOUT,
};
use crate::models::*;
use crate::storage::ArgusStorage;
use crate::sync::Broadcaster;

/// Overlap subtracted from the last search time so edge reports near the
/// boundary are not missed.
const WINDOW_OVERLAP_MINUTES: i64 = 5;
/// Window used when a monitor has never searched.
const FIRST_WINDOW_HOURS: i64 = 1;
/// The dedup fast path looks this far back for stored threats.
const DEDUP_LOOKBACK_HOURS: i64 = 24;
/// Materialized threat annotations expire this long after creation.
const ANNOTATION_TTL_HOURS: i64 = 24;
/// Materialization applies at this level and above.
const MATERIALIZE_MIN_LEVEL: ThreatLevel = ThreatLevel::Medium;

const SEARCH_SYSTEM_PROMPT: &str = "You are a tactical threat intelligence analyst. Search \
real-time social streams and news for specific, actionable incidents in the given area and \
window. Report only concrete incidents with a time and place; never general conditions, \
commentary, or forecasts. Respond with ONLY a JSON array of analyses. Each analysis has: \
threat_level (LOW|MEDIUM|HIGH|CRITICAL), threat_type (VIOLENCE|TERRORISM|NATURAL_DISASTER|\
CIVIL_UNREST|INFRASTRUCTURE|CYBER|HEALTH_EMERGENCY), confidence_score (0-1), summary, \
locations (array of {lat, lng, name?, confidence, source, radius_km?, area_description?}), \
keywords (array of strings), reasoning, citations (array of URLs). Return [] when nothing \
qualifies.";

#[derive(Debug, Default, Clone)]
pub struct TickOutcome {
    pub analyses: usize,
    pub new_threats: usize,
    pub updated: usize,
    pub duplicates: usize,
    pub error: Option<String>,
}

pub struct ThreatPipeline {
    storage: Arc<ArgusStorage>,
    llm: Arc<LlmClient>,
    broadcaster: Arc<dyn Broadcaster>,
}

impl ThreatPipeline {
    pub fn new(
        storage: Arc<ArgusStorage>,
        llm: Arc<LlmClient>,
        broadcaster: Arc<dyn Broadcaster>,
    ) -> Self {
        Self {
            storage,
            llm,
            broadcaster,
        }
    }

    /// One monitor tick. Every failure is contained here.
    pub async fn run_tick(&self, monitor: &Monitor) -> TickOutcome {
        match self.tick_inner(monitor).await {
            Ok(outcome) => outcome,
            Err(err) => {
                error!(monitor_id = %monitor.id, error = %err, "Monitor tick failed");
                TickOutcome {
                    error: Some(err.public_message()),
                    ..TickOutcome::default()
                }
            }
        }
    }

    async fn tick_inner(&self, monitor: &Monitor) -> Result<TickOutcome, ApiError> {
        let now = Utc::now();
        let since = monitor
            .last_searched_at
            .map(|at| at - Duration::minutes(WINDOW_OVERLAP_MINUTES))
            .unwrap_or_else(|| now - Duration::hours(FIRST_WINDOW_HOURS));

        let settings = self.llm.settings().await?;
        let system_prompt = SEARCH_SYSTEM_PROMPT.to_string();
        let user_prompt = build_user_prompt(monitor, since, now);

        let mut request = ProviderRequest {
            model: settings.search_model.clone(),
            input: vec![
                InputMessage::system(system_prompt.clone()),
                InputMessage::user(user_prompt.clone()),
            ],
            tools: Some(build_tools(monitor, since, now)),
            tool_choice: Some("auto".to_string()),
            text: Some(TextOptions::json_schema("threat_analyses", threat_array_schema())),
        };
        let request_payload = serde_json::to_value(&request).ok();

        let response = match self.llm.respond(&settings, &request, SEARCH_TIMEOUT).await {
            Ok(response) => response,
            // Some models reject structured output; retry once without it.
            Err(LlmError::BadRequest(body)) if request.text.is_some() => {
                debug!(monitor_id = %monitor.id, body = %body, "Structured output rejected, retrying without schema");
                request.text = None;
                self.llm.respond(&settings, &request, SEARCH_TIMEOUT).await?
            }
            Err(err) => return Err(err.into()),
        };

        let raw_text = response.message_text().unwrap_or_default();
        let model = response.model.clone().unwrap_or(settings.search_model.clone());
        let social_calls = response.social_search_calls();

        self.record_usage(
            &model,
            response.usage,
            social_calls,
            AiCallType::Search,
            Some(monitor.id),
        )
        .await;

        let mut analyses = parse_analyses(&raw_text);
        // Provider-canonical citations win over model-supplied ones.
        if let Some(citations) = response.citations.as_ref().filter(|c| !c.is_empty()) {
            for analysis in &mut analyses {
                analysis.citations = citations.clone();
            }
        }

        let mut outcome = TickOutcome {
            analyses: analyses.len(),
            ..TickOutcome::default()
        };

        let mut recent = self
            .storage
            .recent_threats_by_area(&monitor.area, DEDUP_LOOKBACK_HOURS)
            .await?;

        for analysis in analyses.iter() {
            let decision = self.decide(monitor, analysis, &recent, &settings).await;
            match self.commit_decision(monitor, analysis, decision).await {
                Ok(CommitResult::New(threat)) => {
                    outcome.new_threats += 1;
                    recent.insert(0, threat);
                }
                Ok(CommitResult::Updated(threat)) => {
                    outcome.updated += 1;
                    if let Some(existing) = recent.iter_mut().find(|t| t.id == threat.id) {
                        *existing = threat;
                    }
                }
                Ok(CommitResult::Duplicate) => outcome.duplicates += 1,
                Err(err) => {
                    warn!(monitor_id = %monitor.id, error = %err, "Threat commit failed");
                }
            }
        }

        let run_log = RunLog {
            id: Uuid::new_v4(),
            monitor_id: monitor.id,
            timestamp: now,
            system_prompt,
            user_prompt,
            raw_response: raw_text,
            threats_found: outcome.analyses as i64,
            citations: response.citations.clone(),
            request_payload,
        };
        self.storage.insert_run_log(&run_log).await?;
        self.storage.trim_run_logs(monitor.id).await?;

        self.storage.set_monitor_last_searched(monitor.id, now).await?;

        info!(
            monitor_id = %monitor.id,
            analyses = outcome.analyses,
            new = outcome.new_threats,
            updated = outcome.updated,
            duplicates = outcome.duplicates,
            "Monitor tick complete"
        );
        Ok(outcome)
    }

    /// The three-stage decision ladder.
    async fn decide(
        &self,
        monitor: &Monitor,
        analysis: &ThreatAnalysis,
        recent: &[Threat],
        settings: &crate::llm::AiSettings,
    ) -> DedupDecision {
        let hash = analysis_hash(analysis);

        // Fast path: nothing stored for the area recently.
        if recent.is_empty() {
            return DedupDecision::New {
                data: None,
                confidence: analysis.confidence_score,
                reasoning: "no recent threats in area".to_string(),
            };
        }

        if let Some(reasoning) = dedup::rule_based_duplicate(analysis, &hash, recent) {
            return DedupDecision::Duplicate { reasoning };
        }

        // Contextual arbitration by the dedup model.
        let (system, user) = dedup::build_arbitration_prompts(analysis, recent);
        let request = ProviderRequest {
            model: settings.dedup_model.clone(),
            input: vec![InputMessage::system(system), InputMessage::user(user)],
            tools: None,
            tool_choice: None,
            text: None,
        };
        match self.llm.respond(settings, &request, DEDUP_TIMEOUT).await {
            Ok(response) => {
                let model = response.model.clone().unwrap_or(settings.dedup_model.clone());
                self.record_usage(
                    &model,
                    response.usage,
                    0,
                    AiCallType::Deduplication,
                    Some(monitor.id),
                )
                .await;

                let text = response.message_text().unwrap_or_default();
                parse_arbitration(&text).unwrap_or_else(|reason| {
                    warn!(monitor_id = %monitor.id, reason = %reason, "Arbitration reply unusable");
                    arbitration_fallback(reason)
                })
            }
            Err(err) => {
                warn!(monitor_id = %monitor.id, error = %err, "Arbitration call failed");
                arbitration_fallback(format!("arbitration unavailable: {err}"))
            }
        }
    }

    pub(crate) async fn commit_decision(
        &self,
        monitor: &Monitor,
        analysis: &ThreatAnalysis,
        decision: DedupDecision,
    ) -> Result<CommitResult, ApiError> {
        match decision {
            DedupDecision::New {
                data,
                confidence,
                reasoning: _,
            } => {
                let threat = self.commit_new(monitor, analysis, data, confidence).await?;
                Ok(CommitResult::New(threat))
            }
            DedupDecision::Update {
                threat_id,
                patch,
                reasoning,
                ..
            } => match self.commit_update(threat_id, patch, reasoning).await {
                Ok(threat) => Ok(CommitResult::Updated(threat)),
                Err(ApiError::NotFound(_)) => {
                    warn!(threat_id = %threat_id, "Arbitration referenced unknown threat");
                    Ok(CommitResult::Duplicate)
                }
                Err(err) => Err(err),
            },
            DedupDecision::Duplicate { reasoning } => {
                debug!(monitor_id = %monitor.id, reasoning = %reasoning, "Analysis is a duplicate");
                Ok(CommitResult::Duplicate)
            }
        }
    }

    async fn commit_new(
        &self,
        monitor: &Monitor,
        analysis: &ThreatAnalysis,
        overrides: Option<JsonValue>,
        confidence: f64,
    ) -> Result<Threat, ApiError> {
        let mut level = analysis.threat_level;
        let mut threat_type = analysis.threat_type;
        let mut summary = analysis.summary.clone();
        let mut keywords = analysis.keywords.clone();
        let mut locations = analysis.locations.clone();
        let mut citations = analysis.citations.clone();

        // AI-returned overrides win field-by-field; omissions preserve the
        // original analysis.
        if let Some(overrides) = overrides {
            if let Ok(patch) = serde_json::from_value::<ThreatPatch>(overrides) {
                if let Some(value) = patch.level {
                    level = value;
                }
                if let Some(value) = patch.threat_type {
                    threat_type = value;
                }
                if let Some(value) = patch.summary {
                    summary = value;
                }
                if let Some(value) = patch.keywords {
                    keywords = value;
                }
                if let Some(value) = patch.locations {
                    locations = value;
                }
                if let Some(value) = patch.citations {
                    citations = value;
                }
            }
        }

        let now = Utc::now();
        let threat = Threat {
            id: Uuid::new_v4(),
            level,
            threat_type,
            confidence: confidence.clamp(0.0, 1.0),
            summary: summary.clone(),
            semantic_hash: semantic_hash(level, threat_type, &summary, &keywords, &locations),
            locations,
            keywords,
            citations,
            area: monitor.area.clone(),
            update_count: 0,
            update_history: vec![],
            status: ThreatStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        self.storage.insert_threat(&threat).await?;

        let annotation = self.materialize(&threat).await?;
        self.broadcaster
            .broadcast_to_admins(ServerEvent::AdminNewThreatDetected {
                threat: threat.clone(),
                annotation,
            })
            .await;

        info!(threat_id = %threat.id, level = level.as_str(), area = %monitor.area, "New threat committed");
        Ok(threat)
    }

    async fn commit_update(
        &self,
        threat_id: Uuid,
        patch: ThreatPatch,
        reasoning: String,
    ) -> Result<Threat, ApiError> {
        let mut threat = self.storage.get_threat(threat_id).await?;

        let mut changes = serde_json::Map::new();
        let mut identity_changed = false;

        if let Some(value) = patch.level {
            identity_changed |= value != threat.level;
            changes.insert("level".to_string(), json!(value));
            threat.level = value;
        }
        if let Some(value) = patch.threat_type {
            identity_changed |= value != threat.threat_type;
            changes.insert("threat_type".to_string(), json!(value));
            threat.threat_type = value;
        }
        if let Some(value) = patch.confidence {
            changes.insert("confidence".to_string(), json!(value));
            threat.confidence = value.clamp(0.0, 1.0);
        }
        if let Some(value) = patch.summary {
            identity_changed |= value != threat.summary;
            changes.insert("summary".to_string(), json!(value));
            threat.summary = value;
        }
        if let Some(value) = patch.keywords {
            identity_changed |= value != threat.keywords;
            changes.insert("keywords".to_string(), json!(value));
            threat.keywords = value;
        }
        if let Some(value) = patch.locations {
            changes.insert("locations".to_string(), json!(value));
            threat.locations = value;
        }
        if let Some(value) = patch.citations {
            changes.insert("citations".to_string(), json!(value));
            threat.citations = value;
        }

        let now = Utc::now();
        threat.update_history.push(ThreatUpdate {
            timestamp: now,
            reasoning,
            changes: JsonValue::Object(changes),
            new_information: patch.new_information,
        });
        threat.update_count += 1;
        threat.updated_at = now;
        if identity_changed {
            threat.semantic_hash = semantic_hash(
                threat.level,
                threat.threat_type,
                &threat.summary,
                &threat.keywords,
                &threat.locations,
            );
        }

        self.storage.update_threat(&threat).await?;

        let annotation = self.materialize(&threat).await?;
        self.broadcaster
            .broadcast_to_admins(ServerEvent::AdminThreatUpdated {
                threat: threat.clone(),
                annotation,
            })
            .await;

        info!(threat_id = %threat.id, update_count = threat.update_count, "Threat updated");
        Ok(threat)
    }

    /// Realize located MEDIUM+ threats as map entities for operators.
    async fn materialize(&self, threat: &Threat) -> Result<Option<ThreatAnnotation>, ApiError> {
        if threat.level < MATERIALIZE_MIN_LEVEL {
            return Ok(None);
        }
        let Some(location) = threat.locations.first() else {
            return Ok(None);
        };

        let now = Utc::now();
        let annotation = ThreatAnnotation {
            id: Uuid::new_v4(),
            threat_id: threat.id,
            latitude: location.lat,
            longitude: location.lng,
            level: threat.level,
            threat_type: threat.threat_type,
            title: format!("{}: {}", threat.level.as_str(), threat.threat_type.as_str()),
            description: threat.summary.clone(),
            expires_at: now + Duration::hours(ANNOTATION_TTL_HOURS),
            created_at: now,
        };
        self.storage.insert_threat_annotation(&annotation).await?;
        Ok(Some(annotation))
    }

    async fn record_usage(
        &self,
        model: &str,
        usage: crate::llm::Usage,
        social_calls: usize,
        call_type: AiCallType,
        monitor_id: Option<Uuid>,
    ) {
        let entry = AiUsageEntry {
            id: Uuid::new_v4(),
            model: model.to_string(),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            total_tokens: usage.total_tokens,
            estimated_cost_usd: estimate_cost(model, usage, social_calls),
            call_type,
            monitor_id,
            timestamp: Utc::now(),
        };
        if let Err(err) = self.storage.insert_usage(&entry).await {
            warn!(error = %err, "Failed to record AI usage");
        }
    }
}

#[derive(Debug)]
pub(crate) enum CommitResult {
    New(Threat),
    Updated(Threat),
    Duplicate,
}

pub(crate) fn analysis_hash(analysis: &ThreatAnalysis) -> String {
    semantic_hash(
        analysis.threat_level,
        analysis.threat_type,
        &analysis.summary,
        &analysis.keywords,
        &analysis.locations,
    )
}

fn build_user_prompt(monitor: &Monitor, since: chrono::DateTime<Utc>, now: chrono::DateTime<Utc>) -> String {
    let mut prompt = format!(
        "Area: {}\nSearch window: {} to {}",
        monitor.area,
        since.to_rfc3339(),
        now.to_rfc3339()
    );
    if let Some(focus) = &monitor.focus {
        prompt.push_str(&format!("\nTopical focus: {focus}"));
    }
    prompt
}

fn build_tools(monitor: &Monitor, since: chrono::DateTime<Utc>, now: chrono::DateTime<Utc>) -> Vec<ToolSpec> {
    // Search APIs filter at day granularity.
    let mut tools = vec![ToolSpec::SocialSearch {
        from_date: Some(since.date_naive().to_string()),
        to_date: Some(now.date_naive().to_string()),
    }];
    if !monitor.allowed_domains.is_empty() {
        tools.push(ToolSpec::WebSearch {
            allowed_domains: Some(monitor.allowed_domains.iter().take(5).cloned().collect()),
        });
    }
    tools
}

fn threat_array_schema() -> JsonValue {
    json!({
        "type": "array",
        "items": {
            "type": "object",
            "required": ["threat_level", "threat_type", "confidence_score", "summary"],
            "properties": {
                "threat_level": {"type": "string", "enum": ["LOW", "MEDIUM", "HIGH", "CRITICAL"]},
                "threat_type": {"type": "string", "enum": [
                    "VIOLENCE", "TERRORISM", "NATURAL_DISASTER", "CIVIL_UNREST",
                    "INFRASTRUCTURE", "CYBER", "HEALTH_EMERGENCY"
                ]},
                "confidence_score": {"type": "number", "minimum": 0, "maximum": 1},
                "summary": {"type": "string"},
                "locations": {"type": "array", "items": {
                    "type": "object",
                    "required": ["lat", "lng", "confidence", "source"],
                    "properties": {
                        "lat": {"type": "number"},
                        "lng": {"type": "number"},
                        "name": {"type": "string"},
                        "confidence": {"type": "number"},
                        "source": {"type": "string"},
                        "radius_km": {"type": "number"},
                        "area_description": {"type": "string"}
                    }
                }},
                "keywords": {"type": "array", "items": {"type": "string"}},
                "reasoning": {"type": "string"},
                "citations": {"type": "array", "items": {"type": "string"}}
            }
        }
    })
}

/// Parse the model reply into validated analyses; malformed entries are
/// dropped with a log, never fatal.
pub(crate) fn parse_analyses(raw: &str) -> Vec<ThreatAnalysis> {
    let text = strip_wrapper(raw);
    let candidates: Vec<JsonValue> = match serde_json::from_str::<JsonValue>(&text) {
        Ok(JsonValue::Array(items)) => items,
        Ok(JsonValue::Object(map)) => map
            .get("threats")
            .or_else(|| map.get("analyses"))
            .and_then(|v| v.as_array().cloned())
            .unwrap_or_default(),
        _ => Vec::new(),
    };

    let mut analyses = Vec::new();
    for candidate in candidates {
        match serde_json::from_value::<ThreatAnalysis>(candidate) {
            Ok(analysis) => match validate_analysis(&analysis) {
                Ok(()) => analyses.push(analysis),
                Err(reason) => debug!(reason = %reason, "Dropped invalid analysis"),
            },
            Err(err) => debug!(error = %err, "Dropped unparseable analysis"),
        }
    }
    analyses
}

fn strip_wrapper(raw: &str) -> String {
    crate::llm::strip_fences(raw).to_string()
}

fn validate_analysis(analysis: &ThreatAnalysis) -> Result<(), String> {
    if analysis.summary.trim().is_empty() {
        return Err("empty summary".to_string());
    }
    if !analysis.confidence_score.is_finite()
        || !(0.0..=1.0).contains(&analysis.confidence_score)
    {
        return Err("confidence out of range".to_string());
    }
    for location in &analysis.locations {
        if !location.lat.is_finite()
            || !location.lng.is_finite()
            || !(-90.0..=90.0).contains(&location.lat)
            || !(-180.0..=180.0).contains(&location.lng)
        {
            return Err("non-finite or out-of-range coordinates".to_string());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_cache::ConfigCache;
    use crate::sync::tests::RecordingBroadcaster;
    use crate::vault::CredentialVault;

    async fn pipeline_fixture() -> (ThreatPipeline, Arc<ArgusStorage>, Arc<RecordingBroadcaster>) {
        let storage = Arc::new(ArgusStorage::new_in_memory().await.unwrap());
        let config = Arc::new(ConfigCache::new(storage.clone()));
        let vault = Arc::new(CredentialVault::new(config.clone(), 24));
        let llm = Arc::new(LlmClient::new(config, vault));
        let broadcaster = Arc::new(RecordingBroadcaster::default());
        let pipeline = ThreatPipeline::new(storage.clone(), llm, broadcaster.clone());
        (pipeline, storage, broadcaster)
    }

    fn monitor(area: &str) -> Monitor {
        Monitor {
            id: Uuid::new_v4(),
            area: area.to_string(),
            focus: None,
            allowed_domains: vec![],
            interval_seconds: 60,
            active: true,
            last_searched_at: None,
            created_by: Uuid::new_v4(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn shooter_analysis() -> ThreatAnalysis {
        ThreatAnalysis {
            threat_level: ThreatLevel::High,
            threat_type: ThreatType::Violence,
            confidence_score: 0.92,
            summary: "Active shooter at Pike Place".to_string(),
            locations: vec![ThreatLocation {
                lat: 47.6097,
                lng: -122.3422,
                name: Some("Pike Place Market".to_string()),
                confidence: 0.9,
                source: "social".to_string(),
                radius_km: None,
                area_description: None,
            }],
            keywords: vec!["shooter".to_string(), "pike place".to_string()],
            reasoning: None,
            citations: vec!["https://example.com/report".to_string()],
        }
    }

    #[tokio::test]
    async fn test_fast_path_commits_new_threat_with_admin_event() {
        let (pipeline, storage, broadcaster) = pipeline_fixture().await;
        let monitor = monitor("Seattle");
        let analysis = shooter_analysis();

        let decision = DedupDecision::New {
            data: None,
            confidence: analysis.confidence_score,
            reasoning: "no recent threats in area".to_string(),
        };
        let result = pipeline
            .commit_decision(&monitor, &analysis, decision)
            .await
            .unwrap();

        let CommitResult::New(threat) = result else {
            panic!("expected new threat");
        };
        assert_eq!(threat.update_count, 0);
        assert_eq!(threat.status, ThreatStatus::Pending);
        assert_eq!(threat.semantic_hash, analysis_hash(&analysis));
        assert_eq!(storage.recent_threats_by_area("Seattle", 24).await.unwrap().len(), 1);

        let admin_events = broadcaster.admin_events.lock().await;
        assert_eq!(admin_events.len(), 1);
        match &admin_events[0] {
            ServerEvent::AdminNewThreatDetected { annotation, .. } => {
                // HIGH with a location materializes a map entity.
                let annotation = annotation.as_ref().expect("materialized annotation");
                assert_eq!(annotation.threat_id, threat.id);
                let ttl = annotation.expires_at - annotation.created_at;
                assert_eq!(ttl.num_hours(), 24);
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_duplicate_decision_writes_nothing() {
        let (pipeline, storage, broadcaster) = pipeline_fixture().await;
        let monitor = monitor("Seattle");
        let analysis = shooter_analysis();

        // Seed the stored threat, then feed a near-identical analysis
        // through the rule pre-filter.
        let first = DedupDecision::New {
            data: None,
            confidence: 0.9,
            reasoning: String::new(),
        };
        pipeline.commit_decision(&monitor, &analysis, first).await.unwrap();

        let recent = storage.recent_threats_by_area("Seattle", 24).await.unwrap();
        let mut second = shooter_analysis();
        second.summary = "ACTIVE shooter at  Pike Place".to_string();
        let reasoning = dedup::rule_based_duplicate(&second, &analysis_hash(&second), &recent)
            .expect("rule pre-filter catches the repeat");

        broadcaster.admin_events.lock().await.clear();
        let result = pipeline
            .commit_decision(&monitor, &second, DedupDecision::Duplicate { reasoning })
            .await
            .unwrap();

        assert!(matches!(result, CommitResult::Duplicate));
        assert_eq!(storage.recent_threats_by_area("Seattle", 24).await.unwrap().len(), 1);
        assert!(broadcaster.admin_events.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_update_appends_history_and_recomputes_hash() {
        let (pipeline, storage, broadcaster) = pipeline_fixture().await;
        let monitor = monitor("Seattle");
        let analysis = shooter_analysis();

        let seed = DedupDecision::New {
            data: None,
            confidence: 0.9,
            reasoning: String::new(),
        };
        let CommitResult::New(original) =
            pipeline.commit_decision(&monitor, &analysis, seed).await.unwrap()
        else {
            panic!("expected new threat");
        };

        let patch = ThreatPatch {
            level: Some(ThreatLevel::Critical),
            summary: Some("Active shooter at Pike Place, officers on scene".to_string()),
            new_information: Some("police response confirmed".to_string()),
            ..ThreatPatch::default()
        };
        let decision = DedupDecision::Update {
            threat_id: original.id,
            patch,
            confidence: 0.85,
            reasoning: "same incident, situation evolved".to_string(),
        };
        let CommitResult::Updated(updated) = pipeline
            .commit_decision(&monitor, &analysis, decision)
            .await
            .unwrap()
        else {
            panic!("expected update");
        };

        assert_eq!(updated.update_count, 1);
        assert_eq!(updated.level, ThreatLevel::Critical);
        assert_ne!(updated.semantic_hash, original.semantic_hash);
        assert_eq!(updated.update_history.len(), 1);
        let entry = &updated.update_history[0];
        assert_eq!(entry.reasoning, "same incident, situation evolved");
        assert_eq!(entry.new_information.as_deref(), Some("police response confirmed"));
        // Untouched fields survive.
        assert_eq!(updated.keywords, original.keywords);
        assert_eq!(updated.citations, original.citations);

        let stored = storage.get_threat(original.id).await.unwrap();
        assert_eq!(stored.update_count, 1);

        let admin_events = broadcaster.admin_events.lock().await;
        assert!(matches!(
            admin_events.last(),
            Some(ServerEvent::AdminThreatUpdated { .. })
        ));
    }

    #[tokio::test]
    async fn test_low_or_unlocated_threats_do_not_materialize() {
        let (pipeline, _storage, broadcaster) = pipeline_fixture().await;
        let monitor = monitor("Seattle");

        let mut low = shooter_analysis();
        low.threat_level = ThreatLevel::Low;
        let decision = DedupDecision::New {
            data: None,
            confidence: 0.9,
            reasoning: String::new(),
        };
        pipeline.commit_decision(&monitor, &low, decision).await.unwrap();

        let mut unlocated = shooter_analysis();
        unlocated.summary = "Widespread outage reported across the grid".to_string();
        unlocated.keywords = vec!["outage".to_string(), "grid".to_string()];
        unlocated.locations = vec![];
        let decision = DedupDecision::New {
            data: None,
            confidence: 0.9,
            reasoning: String::new(),
        };
        pipeline
            .commit_decision(&monitor, &unlocated, decision)
            .await
            .unwrap();

        for event in broadcaster.admin_events.lock().await.iter() {
            match event {
                ServerEvent::AdminNewThreatDetected { annotation, .. } => {
                    assert!(annotation.is_none());
                }
                other => panic!("unexpected event {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_new_threat_overrides_merge_field_by_field() {
        let (pipeline, _storage, _broadcaster) = pipeline_fixture().await;
        let monitor = monitor("Seattle");
        let analysis = shooter_analysis();

        let decision = DedupDecision::New {
            data: Some(json!({
                "level": "CRITICAL",
                "summary": "Confirmed active shooter, area locked down"
            })),
            confidence: 0.95,
            reasoning: String::new(),
        };
        let CommitResult::New(threat) = pipeline
            .commit_decision(&monitor, &analysis, decision)
            .await
            .unwrap()
        else {
            panic!("expected new threat");
        };

        assert_eq!(threat.level, ThreatLevel::Critical);
        assert_eq!(threat.summary, "Confirmed active shooter, area locked down");
        // Omitted fields keep the original analysis values.
        assert_eq!(threat.citations, analysis.citations);
        assert_eq!(threat.locations.len(), 1);
    }

    #[test]
    fn test_parse_analyses_shapes_and_validation() {
        let array = r#"[{"threat_level":"HIGH","threat_type":"VIOLENCE","confidence_score":0.9,"summary":"incident"}]"#;
        assert_eq!(parse_analyses(array).len(), 1);

        let wrapped = r#"{"threats":[{"threat_level":"LOW","threat_type":"CYBER","confidence_score":0.4,"summary":"phishing wave"}]}"#;
        assert_eq!(parse_analyses(wrapped).len(), 1);

        let fenced = format!("```json\n{array}\n```");
        assert_eq!(parse_analyses(&fenced).len(), 1);

        // Out-of-range confidence, bad enum, bad coordinates all drop.
        let invalid = r#"[
            {"threat_level":"HIGH","threat_type":"VIOLENCE","confidence_score":1.4,"summary":"x"},
            {"threat_level":"SEVERE","threat_type":"VIOLENCE","confidence_score":0.5,"summary":"x"},
            {"threat_level":"HIGH","threat_type":"VIOLENCE","confidence_score":0.5,"summary":"x",
             "locations":[{"lat":123.0,"lng":0.0,"confidence":0.5,"source":"social"}]},
            {"threat_level":"HIGH","threat_type":"VIOLENCE","confidence_score":0.5,"summary":""}
        ]"#;
        assert!(parse_analyses(invalid).is_empty());

        assert!(parse_analyses("no json here").is_empty());
        assert!(parse_analyses("[]").is_empty());
    }
}
