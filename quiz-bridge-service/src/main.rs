// Copyright (C) 2026 StarHuntingGames
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

mod answers;
mod config;
mod dynamo_store;
mod gemini;
mod generator;
mod orchestrator;
mod store;

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use lambda_http::run as lambda_run;
use quiz_bridge_common::{
    QuizAnswerRequest, QuizAnswerResponse, QuizAnswersResponse, SessionResponse,
    TeamQuizRequest, TeamQuizResponse,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::{
    config::{ServiceConfig, StoreBackend},
    dynamo_store::DynamoSessionStore,
    gemini::{FallbackQuizModel, GeminiModel},
    generator::{QuizGenerationAdapter, QuizModel, RetryPolicy},
    orchestrator::{OrchestratorError, SessionOrchestrator, require_identifier},
    store::{InMemorySessionStore, SessionStore, StoreError},
};

#[derive(Clone)]
struct AppState {
    orchestrator: Arc<SessionOrchestrator>,
    store: Arc<dyn SessionStore>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "quiz_bridge_service=debug,tower_http=info".to_string()),
        )
        .init();

    let config = config::load_config()?;
    let state = build_state(&config).await?;
    let app = build_router(state);

    if std::env::var("AWS_LAMBDA_RUNTIME_API").is_ok() {
        info!("AWS Lambda runtime detected; running quiz-bridge-service in lambda mode");
        lambda_run(app)
            .await
            .map_err(|e| anyhow::Error::msg(format!("lambda runtime error: {e}")))?;
        return Ok(());
    }

    let bind_addr = parse_bind_addr(&config.server.bind)?;
    info!(%bind_addr, "quiz-bridge-service listening");
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn build_state(config: &ServiceConfig) -> anyhow::Result<AppState> {
    let pool = Arc::new(config.team_pool());
    info!(teams = ?pool.names().collect::<Vec<_>>(), "loaded team pool");

    let store: Arc<dyn SessionStore> = match config.store.resolved_backend() {
        StoreBackend::Dynamodb => Arc::new(DynamoSessionStore::from_settings(&config.store).await),
        StoreBackend::Memory => {
            info!("using in-memory session store");
            Arc::new(InMemorySessionStore::new())
        }
    };

    let generation = &config.generation;
    let model: Arc<dyn QuizModel> = match generation.api_key.clone() {
        Some(api_key) => {
            let client = reqwest::Client::builder()
                .build()
                .context("failed to build model http client")?;
            info!(model = %generation.model, "using Gemini quiz model");
            Arc::new(GeminiModel::new(client, api_key, generation))
        }
        None => {
            warn!("GEMINI_API_KEY not set; serving fallback quiz questions");
            Arc::new(FallbackQuizModel)
        }
    };

    let generator = Arc::new(
        QuizGenerationAdapter::new(
            model,
            pool.clone(),
            RetryPolicy::from_settings(generation),
            generation.question_count,
        )
        .with_min_request_interval(generation.min_request_interval()),
    );
    let orchestrator = SessionOrchestrator::new(
        store.clone(),
        generator,
        pool,
        config.orchestrator.clone(),
    );

    Ok(AppState {
        orchestrator: Arc::new(orchestrator),
        store,
    })
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/team_quiz", post(request_quiz_handler))
        .route("/team_quiz/{game_id}", get(get_session_handler))
        .route("/team_quiz/{game_id}/answers", get(list_answers_handler))
        .route("/quiz_answer", post(submit_answer_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

fn parse_bind_addr(value: &str) -> anyhow::Result<SocketAddr> {
    value
        .parse()
        .with_context(|| format!("invalid bind address {value}"))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"ok": true, "service": "quiz-bridge-service"}))
}

async fn request_quiz_handler(
    State(state): State<AppState>,
    Json(request): Json<TeamQuizRequest>,
) -> Result<Json<TeamQuizResponse>, ApiError> {
    let player_count = request
        .roster_size()
        .ok_or_else(|| {
            ApiError::bad_request("players, player_count or 2-4 distinct teams is required")
        })?;

    let outcome = state
        .orchestrator
        .request_quiz(&request.game_id, player_count)
        .await?;

    if let Some(client_teams) = request.teams.as_ref() {
        if client_teams != &outcome.teams {
            info!(
                game_id = %outcome.game_id,
                client_teams = ?client_teams,
                session_teams = ?outcome.teams,
                "ignoring client-proposed teams"
            );
        }
    }

    Ok(Json(outcome.into()))
}

async fn get_session_handler(
    State(state): State<AppState>,
    Path(game_id): Path<String>,
) -> Result<Json<SessionResponse>, ApiError> {
    let game_id = require_identifier("game_id", &game_id)?;
    let session = state.store.get(game_id).await?;
    Ok(Json(session.into()))
}

async fn submit_answer_handler(
    State(state): State<AppState>,
    Json(request): Json<QuizAnswerRequest>,
) -> Result<Json<QuizAnswerResponse>, ApiError> {
    let ack = answers::submit_answer(state.store.as_ref(), request).await?;
    Ok(Json(ack))
}

async fn list_answers_handler(
    State(state): State<AppState>,
    Path(game_id): Path<String>,
) -> Result<Json<QuizAnswersResponse>, ApiError> {
    let listed = answers::list_answers(state.store.as_ref(), &game_id).await?;
    Ok(Json(listed))
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "INVALID_REQUEST", message)
    }
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        let message = error.to_string();
        match error {
            StoreError::SessionNotFound { .. } => {
                Self::new(StatusCode::NOT_FOUND, "SESSION_NOT_FOUND", message)
            }
            StoreError::UnknownTeam { .. } => {
                Self::new(StatusCode::UNPROCESSABLE_ENTITY, "UNKNOWN_TEAM", message)
            }
            StoreError::InvalidState { .. }
            | StoreError::InvalidQuestions { .. }
            | StoreError::Backend(_) => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "STORE_ERROR", message)
            }
        }
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(error: OrchestratorError) -> Self {
        let message = error.to_string();
        match error {
            OrchestratorError::InvalidRequest(_) => Self::bad_request(message),
            OrchestratorError::TeamAssignment(_) => {
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, "TEAM_ASSIGNMENT", message)
            }
            OrchestratorError::GenerationFailed { .. } => {
                Self::new(StatusCode::BAD_GATEWAY, "GENERATION_FAILED", message)
            }
            OrchestratorError::GenerationTimeout { .. } => {
                Self::new(StatusCode::GATEWAY_TIMEOUT, "GENERATION_TIMEOUT", message)
            }
            OrchestratorError::Store(error) => error.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        warn!(status = %self.status, code = self.code, message = %self.message, "request failed");
        (
            self.status,
            Json(serde_json::json!({"error": self.message, "code": self.code})),
        )
            .into_response()
    }
}
