//! Argus Core
//!
//! Realtime collaboration and threat intelligence backend providing:
//! - Authenticated WebSocket fan-out with team-scoped rooms
//! - Location/annotation/message sync with membership enforcement
//! - Scheduled LLM threat search with multi-layer deduplication
//! - Monitor lifecycle supervision with drift recovery

use anyhow::anyhow;
use axum::async_trait;
use axum::extract::{ConnectInfo, FromRequest, FromRequestParts, Path, Query, Request, State};
use axum::http::request::Parts;
use axum::http::{HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use chrono::{Duration as ChronoDuration, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::System;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};
use uuid::Uuid;

pub mod config_cache;
pub mod dedup;
pub mod errors;
pub mod gateway;
pub mod llm;
pub mod models;
pub mod pipeline;
pub mod rate_limit;
pub mod storage;
pub mod supervisor;
pub mod sync;
pub mod vault;

use config_cache::{ConfigCache, ConfigKey};
use errors::ApiError;
use gateway::RoomRegistry;
use llm::LlmClient;
use models::*;
use pipeline::ThreatPipeline;
use rate_limit::SlidingWindowLimiter;
use storage::ArgusStorage;
use supervisor::MonitorSupervisor;
use sync::SyncCore;
use vault::{AuthClaims, CredentialVault};

/// 100 requests per 15 minutes per IP on `/api/*`.
const API_RATE_LIMIT: usize = 100;
const API_RATE_WINDOW: Duration = Duration::from_secs(15 * 60);
/// Dedicated login limiter.
const LOGIN_RATE_LIMIT: usize = 10;
const LOGIN_RATE_WINDOW: Duration = Duration::from_secs(15 * 60);

const DEFAULT_RETENTION_DAYS: i64 = 30;
const STATS_BROADCAST_SECS: u64 = 30;
const ANNOTATION_EXPIRY_SWEEP_SECS: u64 = 15 * 60;
const RETENTION_SWEEP_SECS: u64 = 60 * 60;

/// Argus Core Configuration
#[derive(Debug, Clone)]
pub struct ArgusConfig {
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Database URL
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Bearer token lifetime in hours
    pub token_ttl_hours: u64,

    /// Refresh token lifetime in days
    pub refresh_ttl_days: i64,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,

    /// CORS origin fallback when unset in the config store
    pub cors_origin: Option<String>,
}

impl Default for ArgusConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "sqlite::memory:".to_string(),
            },
            auth: AuthConfig {
                token_ttl_hours: 24,
                refresh_ttl_days: 30,
            },
            server: ServerConfig {
                port: 3000,
                cors_origin: None,
            },
        }
    }
}

impl ArgusConfig {
    /// Build configuration from the environment. `DATABASE_URL` is the only
    /// required variable.
    pub fn from_env() -> Result<Self, ApiError> {
        let url = std::env::var("DATABASE_URL")
            .map_err(|_| ApiError::Internal(anyhow!("DATABASE_URL is required")))?;
        let port = std::env::var("PORT")
            .ok()
            .and_then(|raw| raw.parse::<u16>().ok())
            .unwrap_or(3000);
        let cors_origin = std::env::var("CORS_ORIGIN").ok().filter(|v| !v.is_empty());

        Ok(Self {
            database: DatabaseConfig { url },
            auth: AuthConfig {
                token_ttl_hours: 24,
                refresh_ttl_days: 30,
            },
            server: ServerConfig { port, cors_origin },
        })
    }
}

/// Main Argus server: components wired at startup and passed around as
/// explicit dependencies.
pub struct ArgusServer {
    pub config: ArgusConfig,
    pub storage: Arc<ArgusStorage>,
    pub config_cache: Arc<ConfigCache>,
    pub vault: Arc<CredentialVault>,
    pub registry: Arc<RoomRegistry>,
    pub sync: Arc<SyncCore>,
    pub llm: Arc<LlmClient>,
    pub pipeline: Arc<ThreatPipeline>,
    pub supervisor: Arc<MonitorSupervisor>,
    pub api_limiter: SlidingWindowLimiter,
    pub login_limiter: SlidingWindowLimiter,
    started_at: Instant,
    background_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ArgusServer {
    pub async fn new(config: ArgusConfig) -> Result<Arc<Self>, ApiError> {
        info!("Initializing Argus core");

        let storage = Arc::new(ArgusStorage::new(&config.database.url).await?);
        let config_cache = Arc::new(ConfigCache::new(storage.clone()));
        let vault = Arc::new(CredentialVault::new(
            config_cache.clone(),
            config.auth.token_ttl_hours,
        ));
        let registry = Arc::new(RoomRegistry::new());
        let sync = Arc::new(SyncCore::new(storage.clone(), registry.clone()));
        let llm = Arc::new(LlmClient::new(config_cache.clone(), vault.clone()));
        let pipeline = Arc::new(ThreatPipeline::new(
            storage.clone(),
            llm.clone(),
            registry.clone(),
        ));
        let supervisor = Arc::new(MonitorSupervisor::new(storage.clone(), pipeline.clone()));

        Ok(Arc::new(Self {
            config,
            storage,
            config_cache,
            vault,
            registry,
            sync,
            llm,
            pipeline,
            supervisor,
            api_limiter: SlidingWindowLimiter::new(API_RATE_LIMIT, API_RATE_WINDOW),
            login_limiter: SlidingWindowLimiter::new(LOGIN_RATE_LIMIT, LOGIN_RATE_WINDOW),
            started_at: Instant::now(),
            background_tasks: Mutex::new(Vec::new()),
        }))
    }

    /// Start monitors, drift loops, and retention sweeps.
    pub async fn start_background_tasks(self: &Arc<Self>) {
        self.supervisor.spawn_loops();
        if let Err(err) = self.supervisor.start_all().await {
            error!(error = %err, "Failed to start active monitors");
        }

        let mut tasks = self.background_tasks.lock().await;

        let retention = {
            let server = self.clone();
            tokio::spawn(async move {
                let mut interval =
                    tokio::time::interval(Duration::from_secs(RETENTION_SWEEP_SECS));
                loop {
                    interval.tick().await;
                    server.run_retention_sweep().await;
                }
            })
        };
        tasks.push(retention);

        let annotation_expiry = {
            let server = self.clone();
            tokio::spawn(async move {
                let mut interval =
                    tokio::time::interval(Duration::from_secs(ANNOTATION_EXPIRY_SWEEP_SECS));
                loop {
                    interval.tick().await;
                    match server.storage.delete_expired_threat_annotations().await {
                        Ok(deleted) if deleted > 0 => {
                            info!(deleted, "Expired threat annotations removed")
                        }
                        Ok(_) => {}
                        Err(err) => warn!(error = %err, "Annotation expiry sweep failed"),
                    }
                }
            })
        };
        tasks.push(annotation_expiry);

        let stats_broadcast = {
            let server = self.clone();
            tokio::spawn(async move {
                let mut interval =
                    tokio::time::interval(Duration::from_secs(STATS_BROADCAST_SECS));
                loop {
                    interval.tick().await;
                    if let Ok(stats) = server.stats_snapshot().await {
                        use crate::sync::Broadcaster;
                        server
                            .registry
                            .broadcast_to_admins(ServerEvent::AdminStatsUpdate(stats))
                            .await;
                    }
                }
            })
        };
        tasks.push(stats_broadcast);

        info!("Background tasks started");
    }

    async fn run_retention_sweep(&self) {
        let retention_days = match self.config_cache.get_i64(ConfigKey::RetentionDays).await {
            Ok(days) => days.unwrap_or(DEFAULT_RETENTION_DAYS),
            Err(err) => {
                warn!(error = %err, "Retention config read failed");
                return;
            }
        };
        if let Err(err) = self.storage.delete_locations_older_than(retention_days).await {
            warn!(error = %err, "Location retention sweep failed");
        }
        if let Err(err) = self.storage.delete_expired_refresh_tokens().await {
            warn!(error = %err, "Refresh token sweep failed");
        }
        self.api_limiter.prune().await;
        self.login_limiter.prune().await;
    }

    /// Graceful shutdown: timers and loops first, storage last.
    pub async fn shutdown(&self) {
        let tasks = {
            let mut tasks = self.background_tasks.lock().await;
            std::mem::take(&mut *tasks)
        };
        for task in tasks {
            task.abort();
        }
        self.supervisor.shutdown().await;
        self.storage.close().await;
        info!("Argus core shut down");
    }

    /// Create the API router for the HTTP surface and the realtime gateway.
    pub async fn create_router(self: Arc<Self>) -> Router {
        let cors = self.cors_layer().await;

        Router::new()
            .route("/health", get(Self::health))
            .route("/metrics", get(Self::metrics))
            .route("/ws", get(gateway::ws_handler))
            .route("/api/setup/complete", post(Self::setup_complete))
            .route("/api/auth/login", post(Self::login))
            .route("/api/auth/refresh", post(Self::refresh))
            .route("/api/auth/whoami", get(Self::whoami))
            .route("/api/sync/location", post(Self::sync_location))
            .route("/api/sync/locations", get(Self::sync_locations))
            .route("/api/sync/annotation", post(Self::sync_annotation))
            .route("/api/sync/message", post(Self::sync_message))
            .route("/api/admin/stats", get(Self::admin_stats))
            .route(
                "/api/admin/config",
                get(Self::admin_get_config).put(Self::admin_put_config),
            )
            .route(
                "/api/admin/users",
                get(Self::admin_list_users).post(Self::admin_create_user),
            )
            .route(
                "/api/admin/users/:id",
                put(Self::admin_update_user).delete(Self::admin_delete_user),
            )
            .route(
                "/api/admin/teams",
                get(Self::admin_list_teams).post(Self::admin_create_team),
            )
            .route(
                "/api/admin/teams/:id",
                put(Self::admin_update_team).delete(Self::admin_delete_team),
            )
            .route(
                "/api/admin/teams/:id/members",
                get(Self::admin_list_members).post(Self::admin_add_member),
            )
            .route(
                "/api/admin/teams/:id/members/:user_id",
                delete(Self::admin_remove_member),
            )
            .route(
                "/api/social-media/monitors",
                get(Self::list_monitors).post(Self::create_monitor),
            )
            .route(
                "/api/social-media/monitors/:id",
                put(Self::update_monitor).delete(Self::delete_monitor),
            )
            .route("/api/social-media/monitors/:id/start", post(Self::start_monitor))
            .route("/api/social-media/monitors/:id/stop", post(Self::stop_monitor))
            .route("/api/social-media/threats", get(Self::list_threats))
            .route(
                "/api/social-media/threats/:id",
                get(Self::get_threat).delete(Self::delete_threat),
            )
            .route(
                "/api/social-media/threats/:id/status",
                put(Self::update_threat_status),
            )
            .route("/api/social-media/test", post(Self::test_ai_connection))
            .route(
                "/api/social-media/suggest-sources",
                post(Self::suggest_sources),
            )
            .layer(middleware::from_fn_with_state(self.clone(), setup_gate))
            .layer(middleware::from_fn_with_state(self.clone(), api_rate_limit))
            .layer(cors)
            .with_state(self)
    }

    async fn cors_layer(&self) -> CorsLayer {
        let origin = match self.config_cache.get_string(ConfigKey::CorsOrigin).await {
            Ok(Some(origin)) => Some(origin),
            _ => self.config.server.cors_origin.clone(),
        };

        match origin.as_deref() {
            Some("*") | None => CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
            Some(origin) => match origin.parse::<HeaderValue>() {
                Ok(value) => CorsLayer::new()
                    .allow_origin(value)
                    .allow_methods(Any)
                    .allow_headers(Any),
                Err(_) => {
                    warn!(origin, "Invalid CORS origin, falling back to any");
                    CorsLayer::new()
                        .allow_origin(Any)
                        .allow_methods(Any)
                        .allow_headers(Any)
                }
            },
        }
    }

    async fn setup_completed(&self) -> bool {
        self.config_cache
            .get_bool(ConfigKey::SetupCompleted)
            .await
            .unwrap_or(false)
    }

    async fn stats_snapshot(&self) -> Result<JsonValue, ApiError> {
        let db = self.storage.db_stats().await?;
        let sockets = self.registry.stats().await;
        let active_threats = self.storage.count_active_threats().await?;
        let recent_messages = self
            .storage
            .count_recent_messages(ChronoDuration::hours(24))
            .await?;

        let mut system = System::new();
        system.refresh_memory();
        let load = System::load_average();
        let (ticks_started, ticks_skipped) = self.supervisor.tick_counters();

        Ok(json!({
            "db": db,
            "sockets": sockets,
            "sync": { "status": "operational" },
            "threats": { "active": active_threats },
            "messages": { "recent": recent_messages },
            "monitors": {
                "running": self.supervisor.running_count().await,
                "ticksStarted": ticks_started,
                "ticksSkipped": ticks_skipped,
            },
            "uptime": self.started_at.elapsed().as_secs(),
            "memory": {
                "usedMb": system.used_memory() / (1024 * 1024),
                "totalMb": system.total_memory() / (1024 * 1024),
            },
            "load": [load.one, load.five, load.fifteen],
        }))
    }

    // ============ Public Endpoints ============

    async fn health(State(server): State<Arc<ArgusServer>>) -> Json<JsonValue> {
        Json(json!({
            "status": "ok",
            "timestamp": Utc::now(),
            "uptime_seconds": server.started_at.elapsed().as_secs(),
            "version": env!("CARGO_PKG_VERSION"),
        }))
    }

    /// Prometheus text exposition. Public before setup completes, admin
    /// bearer required afterwards.
    async fn metrics(
        State(server): State<Arc<ArgusServer>>,
        parts: axum::http::HeaderMap,
    ) -> Result<Response, ApiError> {
        if server.setup_completed().await {
            let token = parts
                .get("authorization")
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.strip_prefix("Bearer "))
                .ok_or(ApiError::Unauthenticated)?;
            let claims = server.vault.verify(token).await?;
            if !claims.is_admin {
                return Err(ApiError::Forbidden);
            }
        }

        let db = server.storage.db_stats().await?;
        let sockets = server.registry.stats().await;
        let active_threats = server.storage.count_active_threats().await?;
        let (ticks_started, ticks_skipped) = server.supervisor.tick_counters();

        let mut body = String::new();
        let mut gauge = |name: &str, help: &str, value: i64| {
            body.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} gauge\n{name} {value}\n"
            ));
        };
        gauge("argus_connections", "Open socket connections", sockets.total_connections as i64);
        gauge("argus_rooms", "Active team rooms", sockets.rooms.len() as i64);
        gauge("argus_users", "Registered users", db.users);
        gauge("argus_teams", "Teams", db.teams);
        gauge("argus_threats_active", "Threats active in the last 24h", active_threats);
        gauge("argus_monitors_running", "Monitors with a live timer", server.supervisor.running_count().await as i64);
        gauge("argus_ticks_started_total", "Pipeline ticks started", ticks_started as i64);
        gauge("argus_ticks_skipped_total", "Pipeline ticks skipped at the gate", ticks_skipped as i64);
        gauge("argus_uptime_seconds", "Process uptime", server.started_at.elapsed().as_secs() as i64);

        Ok((
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            body,
        )
            .into_response())
    }

    // ============ Setup & Auth ============

    async fn setup_complete(
        State(server): State<Arc<ArgusServer>>,
        ApiJson(request): ApiJson<SetupRequest>,
    ) -> Result<Json<JsonValue>, ApiError> {
        if server.setup_completed().await {
            return Err(ApiError::Conflict("Setup already completed".to_string()));
        }
        if request.admin_email.trim().is_empty() || request.admin_password.is_empty() {
            return Err(ApiError::validation("adminEmail and adminPassword are required"));
        }

        // Seed the deployment secrets before the first token is issued.
        if server
            .config_cache
            .get_string(ConfigKey::JwtSecret)
            .await?
            .is_none()
            && std::env::var("JWT_SECRET").is_err()
        {
            server
                .config_cache
                .set(ConfigKey::JwtSecret, json!(CredentialVault::generate_secret(32)))
                .await?;
        }

        let admin = User {
            id: Uuid::new_v4(),
            name: request.admin_email.trim().to_string(),
            email: Some(request.admin_email.trim().to_string()),
            password_hash: server.vault.hash_password(&request.admin_password)?,
            is_admin: true,
            created_at: Utc::now(),
        };
        server.storage.create_user(&admin).await?;

        server
            .config_cache
            .set(ConfigKey::OrgName, json!(request.org_name))
            .await?;
        if let Some(cors_origin) = request.cors_origin {
            server
                .config_cache
                .set(ConfigKey::CorsOrigin, json!(cors_origin))
                .await?;
        }
        if server
            .config_cache
            .get_i64(ConfigKey::RetentionDays)
            .await?
            .is_none()
        {
            server
                .config_cache
                .set(ConfigKey::RetentionDays, json!(DEFAULT_RETENTION_DAYS))
                .await?;
        }
        server
            .config_cache
            .set(ConfigKey::SetupCompleted, json!(true))
            .await?;

        info!(admin_id = %admin.id, "Setup completed");
        Ok(Json(json!({ "status": "ok", "adminId": admin.id })))
    }

    async fn login(
        State(server): State<Arc<ArgusServer>>,
        connect_info: Option<ConnectInfo<SocketAddr>>,
        ApiJson(request): ApiJson<LoginRequest>,
    ) -> Result<Json<LoginResponse>, ApiError> {
        let client_key = connect_info
            .map(|ConnectInfo(addr)| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        if !server.login_limiter.check(&client_key).await {
            return Err(ApiError::RateLimited);
        }

        let login = request
            .email
            .or(request.username)
            .ok_or_else(|| ApiError::validation("email or username is required"))?;

        let Some(mut user) = server.storage.find_user_by_login(login.trim()).await? else {
            return Err(ApiError::Unauthenticated);
        };
        let (ok, needs_rehash) = server
            .vault
            .verify_password(&request.password, &user.password_hash);
        if !ok {
            return Err(ApiError::Unauthenticated);
        }

        // Opportunistic rehash for legacy verifiers.
        if needs_rehash {
            if let Ok(rehashed) = server.vault.hash_password(&request.password) {
                user.password_hash = rehashed;
                if let Err(err) = server.storage.update_user(&user).await {
                    warn!(user_id = %user.id, error = %err, "Password rehash failed");
                }
            }
        }

        server.issue_tokens(&user).await.map(Json)
    }

    async fn refresh(
        State(server): State<Arc<ArgusServer>>,
        ApiJson(request): ApiJson<RefreshRequest>,
    ) -> Result<Json<LoginResponse>, ApiError> {
        let hash = CredentialVault::hash_refresh_token(&request.refresh_token);
        let Some(user_id) = server.storage.consume_refresh_token(&hash).await? else {
            return Err(ApiError::Unauthenticated);
        };
        let user = server.storage.get_user(user_id).await?;
        server.issue_tokens(&user).await.map(Json)
    }

    async fn issue_tokens(&self, user: &User) -> Result<LoginResponse, ApiError> {
        let token = self.vault.sign(user.id, user.is_admin).await?;
        let (refresh_token, refresh_hash) = self.vault.generate_refresh_token();
        self.storage
            .insert_refresh_token(
                &refresh_hash,
                user.id,
                Utc::now() + ChronoDuration::days(self.config.auth.refresh_ttl_days),
            )
            .await?;
        Ok(LoginResponse {
            token,
            refresh_token,
        })
    }

    async fn whoami(
        State(server): State<Arc<ArgusServer>>,
        AuthUser(claims): AuthUser,
    ) -> Result<Json<WhoamiResponse>, ApiError> {
        let user = server.storage.get_user(claims.user_id).await?;
        Ok(Json(WhoamiResponse {
            id: user.id,
            is_admin: user.is_admin,
            name: user.name,
        }))
    }

    // ============ Sync Endpoints ============

    async fn sync_location(
        State(server): State<Arc<ArgusServer>>,
        AuthUser(claims): AuthUser,
        ApiJson(payload): ApiJson<LocationPayload>,
    ) -> Result<Json<LocationSample>, ApiError> {
        server
            .sync
            .submit_location(claims.user_id, payload)
            .await
            .map(Json)
    }

    async fn sync_locations(
        State(server): State<Arc<ArgusServer>>,
        AuthUser(claims): AuthUser,
        Query(query): Query<LocationQuery>,
    ) -> Result<Json<Vec<LocationSample>>, ApiError> {
        server
            .sync
            .assert_membership(claims.user_id, query.team_id)
            .await?;
        let window = ChronoDuration::hours(query.hours.unwrap_or(24).clamp(1, 24 * 7));
        server
            .storage
            .recent_locations(query.team_id, window)
            .await
            .map(Json)
    }

    async fn sync_annotation(
        State(server): State<Arc<ArgusServer>>,
        AuthUser(claims): AuthUser,
        ApiJson(payload): ApiJson<AnnotationPayload>,
    ) -> Result<Json<Annotation>, ApiError> {
        server
            .sync
            .submit_annotation(claims.user_id, payload)
            .await
            .map(Json)
    }

    async fn sync_message(
        State(server): State<Arc<ArgusServer>>,
        AuthUser(claims): AuthUser,
        ApiJson(payload): ApiJson<MessagePayload>,
    ) -> Result<Json<Message>, ApiError> {
        server
            .sync
            .submit_message(claims.user_id, payload)
            .await
            .map(Json)
    }

    // ============ Admin Endpoints ============

    async fn admin_stats(
        State(server): State<Arc<ArgusServer>>,
        AdminUser(_): AdminUser,
    ) -> Result<Json<JsonValue>, ApiError> {
        server.stats_snapshot().await.map(Json)
    }

    async fn admin_get_config(
        State(server): State<Arc<ArgusServer>>,
        AdminUser(_): AdminUser,
    ) -> Result<Json<AdminConfigResponse>, ApiError> {
        Ok(Json(AdminConfigResponse {
            org_name: server.config_cache.get_string(ConfigKey::OrgName).await?,
            cors_origin: server.config_cache.get_string(ConfigKey::CorsOrigin).await?,
            retention_days: server
                .config_cache
                .get_i64(ConfigKey::RetentionDays)
                .await?
                .unwrap_or(DEFAULT_RETENTION_DAYS),
        }))
    }

    async fn admin_put_config(
        State(server): State<Arc<ArgusServer>>,
        AdminUser(_): AdminUser,
        ApiJson(request): ApiJson<UpdateAdminConfigRequest>,
    ) -> Result<Json<JsonValue>, ApiError> {
        if let Some(org_name) = request.org_name {
            server
                .config_cache
                .set(ConfigKey::OrgName, json!(org_name))
                .await?;
        }
        if let Some(cors_origin) = request.cors_origin {
            server
                .config_cache
                .set(ConfigKey::CorsOrigin, json!(cors_origin))
                .await?;
        }
        if let Some(retention_days) = request.retention_days {
            if retention_days < 0 {
                return Err(ApiError::validation("retentionDays must be >= 0"));
            }
            server
                .config_cache
                .set(ConfigKey::RetentionDays, json!(retention_days))
                .await?;
        }
        Ok(Json(json!({ "status": "ok" })))
    }

    async fn admin_list_users(
        State(server): State<Arc<ArgusServer>>,
        AdminUser(_): AdminUser,
    ) -> Result<Json<Vec<User>>, ApiError> {
        server.storage.list_users().await.map(Json)
    }

    async fn admin_create_user(
        State(server): State<Arc<ArgusServer>>,
        AdminUser(_): AdminUser,
        ApiJson(request): ApiJson<CreateUserRequest>,
    ) -> Result<Json<User>, ApiError> {
        if request.name.trim().is_empty() || request.password.is_empty() {
            return Err(ApiError::validation("name and password are required"));
        }
        let user = User {
            id: Uuid::new_v4(),
            name: request.name.trim().to_string(),
            email: request.email,
            password_hash: server.vault.hash_password(&request.password)?,
            is_admin: request.is_admin,
            created_at: Utc::now(),
        };
        server.storage.create_user(&user).await?;
        Ok(Json(user))
    }

    async fn admin_update_user(
        State(server): State<Arc<ArgusServer>>,
        AdminUser(_): AdminUser,
        Path(id): Path<Uuid>,
        ApiJson(request): ApiJson<UpdateUserRequest>,
    ) -> Result<Json<User>, ApiError> {
        let mut user = server.storage.get_user(id).await?;
        if let Some(name) = request.name {
            if name.trim().is_empty() {
                return Err(ApiError::validation("name cannot be empty"));
            }
            user.name = name.trim().to_string();
        }
        if let Some(email) = request.email {
            user.email = Some(email);
        }
        if let Some(password) = request.password {
            user.password_hash = server.vault.hash_password(&password)?;
        }
        if let Some(is_admin) = request.is_admin {
            user.is_admin = is_admin;
        }
        server.storage.update_user(&user).await?;
        Ok(Json(user))
    }

    async fn admin_delete_user(
        State(server): State<Arc<ArgusServer>>,
        AdminUser(claims): AdminUser,
        Path(id): Path<Uuid>,
    ) -> Result<Json<JsonValue>, ApiError> {
        if claims.user_id == id {
            return Err(ApiError::validation("cannot delete the requesting admin"));
        }
        server.storage.delete_user(id).await?;
        Ok(Json(json!({ "status": "ok" })))
    }

    async fn admin_list_teams(
        State(server): State<Arc<ArgusServer>>,
        AdminUser(_): AdminUser,
    ) -> Result<Json<Vec<Team>>, ApiError> {
        server.storage.list_teams().await.map(Json)
    }

    async fn admin_create_team(
        State(server): State<Arc<ArgusServer>>,
        AdminUser(_): AdminUser,
        ApiJson(request): ApiJson<CreateTeamRequest>,
    ) -> Result<Json<Team>, ApiError> {
        if request.name.trim().is_empty() {
            return Err(ApiError::validation("name is required"));
        }
        let team = Team {
            id: Uuid::new_v4(),
            name: request.name.trim().to_string(),
            created_at: Utc::now(),
        };
        server.storage.create_team(&team).await?;
        Ok(Json(team))
    }

    async fn admin_update_team(
        State(server): State<Arc<ArgusServer>>,
        AdminUser(_): AdminUser,
        Path(id): Path<Uuid>,
        ApiJson(request): ApiJson<CreateTeamRequest>,
    ) -> Result<Json<Team>, ApiError> {
        if request.name.trim().is_empty() {
            return Err(ApiError::validation("name is required"));
        }
        server.storage.update_team_name(id, request.name.trim()).await?;
        server.storage.get_team(id).await.map(Json)
    }

    async fn admin_delete_team(
        State(server): State<Arc<ArgusServer>>,
        AdminUser(_): AdminUser,
        Path(id): Path<Uuid>,
    ) -> Result<Json<JsonValue>, ApiError> {
        server.storage.delete_team(id).await?;
        Ok(Json(json!({ "status": "ok" })))
    }

    async fn admin_list_members(
        State(server): State<Arc<ArgusServer>>,
        AdminUser(_): AdminUser,
        Path(id): Path<Uuid>,
    ) -> Result<Json<Vec<User>>, ApiError> {
        server.storage.get_team(id).await?;
        server.storage.list_members(id).await.map(Json)
    }

    async fn admin_add_member(
        State(server): State<Arc<ArgusServer>>,
        AdminUser(_): AdminUser,
        Path(id): Path<Uuid>,
        ApiJson(request): ApiJson<AddMemberRequest>,
    ) -> Result<Json<JsonValue>, ApiError> {
        server.storage.get_team(id).await?;
        server.storage.get_user(request.user_id).await?;
        server.storage.add_member(request.user_id, id).await?;
        Ok(Json(json!({ "status": "ok" })))
    }

    async fn admin_remove_member(
        State(server): State<Arc<ArgusServer>>,
        AdminUser(_): AdminUser,
        Path((id, user_id)): Path<(Uuid, Uuid)>,
    ) -> Result<Json<JsonValue>, ApiError> {
        server.storage.remove_member(user_id, id).await?;
        Ok(Json(json!({ "status": "ok" })))
    }

    // ============ Monitor & Threat Endpoints ============

    async fn list_monitors(
        State(server): State<Arc<ArgusServer>>,
        AdminUser(_): AdminUser,
    ) -> Result<Json<Vec<Monitor>>, ApiError> {
        server.storage.list_monitors(false).await.map(Json)
    }

    async fn create_monitor(
        State(server): State<Arc<ArgusServer>>,
        AdminUser(claims): AdminUser,
        ApiJson(request): ApiJson<CreateMonitorRequest>,
    ) -> Result<Json<Monitor>, ApiError> {
        if request.area.trim().is_empty() {
            return Err(ApiError::validation("area is required"));
        }
        if request.interval_seconds < 60 {
            return Err(ApiError::validation("intervalSeconds must be at least 60"));
        }
        let allowed_domains = normalize_domains(&request.allowed_domains);
        if allowed_domains.len() > 5 {
            return Err(ApiError::validation("at most 5 allowed domains"));
        }

        let now = Utc::now();
        let monitor = Monitor {
            id: Uuid::new_v4(),
            area: request.area.trim().to_string(),
            focus: request.focus.filter(|f| !f.trim().is_empty()),
            allowed_domains,
            interval_seconds: request.interval_seconds,
            active: false,
            last_searched_at: None,
            created_by: claims.user_id,
            created_at: now,
            updated_at: now,
        };
        server.storage.create_monitor(&monitor).await?;
        Ok(Json(monitor))
    }

    async fn update_monitor(
        State(server): State<Arc<ArgusServer>>,
        AdminUser(_): AdminUser,
        Path(id): Path<Uuid>,
        ApiJson(request): ApiJson<UpdateMonitorRequest>,
    ) -> Result<Json<Monitor>, ApiError> {
        let mut monitor = server.storage.get_monitor(id).await?;
        if let Some(area) = request.area {
            if area.trim().is_empty() {
                return Err(ApiError::validation("area cannot be empty"));
            }
            monitor.area = area.trim().to_string();
        }
        if let Some(focus) = request.focus {
            monitor.focus = if focus.trim().is_empty() {
                None
            } else {
                Some(focus)
            };
        }
        if let Some(domains) = request.allowed_domains {
            let normalized = normalize_domains(&domains);
            if normalized.len() > 5 {
                return Err(ApiError::validation("at most 5 allowed domains"));
            }
            monitor.allowed_domains = normalized;
        }
        if let Some(interval_seconds) = request.interval_seconds {
            if interval_seconds < 60 {
                return Err(ApiError::validation("intervalSeconds must be at least 60"));
            }
            monitor.interval_seconds = interval_seconds;
        }
        server.storage.update_monitor(&monitor).await?;
        server.storage.get_monitor(id).await.map(Json)
    }

    async fn delete_monitor(
        State(server): State<Arc<ArgusServer>>,
        AdminUser(_): AdminUser,
        Path(id): Path<Uuid>,
    ) -> Result<Json<JsonValue>, ApiError> {
        server.storage.get_monitor(id).await?;
        server.supervisor.stop(id).await?;
        server.storage.delete_monitor(id).await?;
        Ok(Json(json!({ "status": "ok" })))
    }

    async fn start_monitor(
        State(server): State<Arc<ArgusServer>>,
        AdminUser(_): AdminUser,
        Path(id): Path<Uuid>,
    ) -> Result<Json<Monitor>, ApiError> {
        let monitor = server.storage.get_monitor(id).await?;
        server.supervisor.start(&monitor, None).await?;
        server.storage.get_monitor(id).await.map(Json)
    }

    async fn stop_monitor(
        State(server): State<Arc<ArgusServer>>,
        AdminUser(_): AdminUser,
        Path(id): Path<Uuid>,
    ) -> Result<Json<Monitor>, ApiError> {
        server.storage.get_monitor(id).await?;
        server.supervisor.stop(id).await?;
        server.storage.get_monitor(id).await.map(Json)
    }

    async fn list_threats(
        State(server): State<Arc<ArgusServer>>,
        AdminUser(_): AdminUser,
        Query(query): Query<ThreatListQuery>,
    ) -> Result<Json<Vec<Threat>>, ApiError> {
        match query.area {
            Some(area) => server
                .storage
                .recent_threats_by_area(&area, query.hours.unwrap_or(24))
                .await
                .map(Json),
            None => server
                .storage
                .list_threats(query.limit.unwrap_or(100).clamp(1, 500))
                .await
                .map(Json),
        }
    }

    async fn get_threat(
        State(server): State<Arc<ArgusServer>>,
        AdminUser(_): AdminUser,
        Path(id): Path<Uuid>,
    ) -> Result<Json<Threat>, ApiError> {
        server.storage.get_threat(id).await.map(Json)
    }

    async fn delete_threat(
        State(server): State<Arc<ArgusServer>>,
        AdminUser(_): AdminUser,
        Path(id): Path<Uuid>,
    ) -> Result<Json<JsonValue>, ApiError> {
        server.storage.delete_threat(id).await?;
        Ok(Json(json!({ "status": "ok" })))
    }

    async fn update_threat_status(
        State(server): State<Arc<ArgusServer>>,
        AdminUser(_): AdminUser,
        Path(id): Path<Uuid>,
        ApiJson(request): ApiJson<UpdateThreatStatusRequest>,
    ) -> Result<Json<Threat>, ApiError> {
        server.storage.update_threat_status(id, request.status).await?;
        server.storage.get_threat(id).await.map(Json)
    }

    async fn test_ai_connection(
        State(server): State<Arc<ArgusServer>>,
        AdminUser(_): AdminUser,
    ) -> Result<Json<JsonValue>, ApiError> {
        let started = Instant::now();
        let (settings, response) = server.llm.test_connection().await?;
        let model = response
            .model
            .clone()
            .unwrap_or_else(|| settings.search_model.clone());
        server
            .record_admin_usage(&model, response.usage, AiCallType::Test)
            .await;

        Ok(Json(json!({
            "status": "ok",
            "model": model,
            "latencyMs": started.elapsed().as_millis() as u64,
            "reply": response.message_text(),
        })))
    }

    async fn suggest_sources(
        State(server): State<Arc<ArgusServer>>,
        AdminUser(_): AdminUser,
        ApiJson(request): ApiJson<SuggestSourcesRequest>,
    ) -> Result<Json<JsonValue>, ApiError> {
        if request.area.trim().is_empty() {
            return Err(ApiError::validation("area is required"));
        }
        let (settings, response, domains) = server.llm.suggest_sources(&request.area).await?;
        let model = response
            .model
            .clone()
            .unwrap_or_else(|| settings.search_model.clone());
        server
            .record_admin_usage(&model, response.usage, AiCallType::SuggestSources)
            .await;

        let domains: Vec<String> = normalize_domains(&domains).into_iter().take(5).collect();
        Ok(Json(json!({ "domains": domains })))
    }

    async fn record_admin_usage(&self, model: &str, usage: llm::Usage, call_type: AiCallType) {
        let entry = AiUsageEntry {
            id: Uuid::new_v4(),
            model: model.to_string(),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            total_tokens: usage.total_tokens,
            estimated_cost_usd: llm::estimate_cost(model, usage, 0),
            call_type,
            monitor_id: None,
            timestamp: Utc::now(),
        };
        if let Err(err) = self.storage.insert_usage(&entry).await {
            warn!(error = %err, "Failed to record AI usage");
        }
    }
}

/// Normalize monitor domains: host only, lowercased, deduplicated.
pub fn normalize_domains(raw: &[String]) -> Vec<String> {
    let mut domains = Vec::new();
    for entry in raw {
        let mut host = entry.trim().to_lowercase();
        if let Some(index) = host.find("://") {
            host = host[index + 3..].to_string();
        }
        if let Some(index) = host.find('/') {
            host.truncate(index);
        }
        if let Some(index) = host.find(':') {
            host.truncate(index);
        }
        if !host.is_empty() && !domains.contains(&host) {
            domains.push(host);
        }
    }
    domains
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LocationQuery {
    team_id: Uuid,
    hours: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ThreatListQuery {
    area: Option<String>,
    hours: Option<i64>,
    limit: Option<i64>,
}

// ============ Extractors & Middleware ============

/// Bearer-authenticated caller.
pub struct AuthUser(pub AuthClaims);

#[async_trait]
impl FromRequestParts<Arc<ArgusServer>> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<ArgusServer>,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get("authorization")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or(ApiError::Unauthenticated)?;
        let claims = state.vault.verify(token).await?;
        Ok(AuthUser(claims))
    }
}

/// Bearer-authenticated caller whose token carries the admin flag.
pub struct AdminUser(pub AuthClaims);

#[async_trait]
impl FromRequestParts<Arc<ArgusServer>> for AdminUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<ArgusServer>,
    ) -> Result<Self, Self::Rejection> {
        let AuthUser(claims) = AuthUser::from_request_parts(parts, state).await?;
        if !claims.is_admin {
            return Err(ApiError::Forbidden);
        }
        Ok(AdminUser(claims))
    }
}

/// JSON extractor whose rejections use the `{error}` body shape.
pub struct ApiJson<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|rejection| ApiError::Validation(rejection.body_text()))?;
        Ok(ApiJson(value))
    }
}

/// Everything outside the setup allow-list returns 428 until setup runs.
async fn setup_gate(
    State(server): State<Arc<ArgusServer>>,
    req: Request,
    next: Next,
) -> Response {
    let path = req.uri().path();
    let allowed = path == "/health"
        || path == "/metrics"
        || path.starts_with("/setup")
        || path.starts_with("/api/setup");
    if allowed || server.setup_completed().await {
        return next.run(req).await;
    }
    ApiError::SetupRequired.into_response()
}

/// Sliding-window limiter on the HTTP boundary. The realtime gateway is
/// bounded by authentication and membership checks instead.
async fn api_rate_limit(
    State(server): State<Arc<ArgusServer>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    req: Request,
    next: Next,
) -> Response {
    let path = req.uri().path();
    if path.starts_with("/api/") {
        let client_key = connect_info
            .map(|ConnectInfo(addr)| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        if !server.api_limiter.check(&client_key).await {
            return ApiError::RateLimited.into_response();
        }
    }
    next.run(req).await
}
