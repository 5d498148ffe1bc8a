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

use std::{str::FromStr, time::Duration};

use anyhow::Context;
use quiz_bridge_common::{TeamPool, TeamProfile, expand_env_vars};
use serde::Deserialize;
use tracing::{info, warn};

pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub server: ServerSettings,
    pub generation: GenerationSettings,
    pub orchestrator: OrchestratorSettings,
    pub store: StoreSettings,
    pub team_pool: Option<Vec<TeamProfile>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GenerationSettings {
    pub model: String,
    pub base_url: String,
    pub api_key: Option<String>,
    pub attempt_timeout_ms: u64,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub retry_invalid_response: bool,
    /// Minimum spacing between calls to the model provider, across all sessions.
    pub min_request_interval_ms: u64,
    pub question_count: usize,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub max_output_tokens: u32,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            model: "gemini-2.0-flash".to_string(),
            base_url: DEFAULT_GEMINI_BASE_URL.to_string(),
            api_key: None,
            attempt_timeout_ms: 10_000,
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 4_000,
            retry_invalid_response: false,
            min_request_interval_ms: 1_000,
            question_count: 5,
            temperature: 0.65,
            top_p: 0.9,
            top_k: 40,
            max_output_tokens: 1500,
        }
    }
}

impl GenerationSettings {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn min_request_interval(&self) -> Duration {
        Duration::from_millis(self.min_request_interval_ms)
    }

    /// Worst-case wall time of one adapter call: every attempt timing out
    /// plus every backoff at its cap.
    pub fn generation_budget(&self) -> Duration {
        let attempts = u64::from(self.max_attempts);
        Duration::from_millis(
            attempts
                .saturating_mul(self.attempt_timeout_ms)
                .saturating_add(attempts.saturating_sub(1).saturating_mul(self.max_backoff_ms)),
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorSettings {
    pub request_timeout_ms: u64,
    pub poll_interval_ms: u64,
    /// Generation attempts a session may consume: the first one plus
    /// externally triggered retries after `FAILED`.
    pub max_session_attempts: u32,
    /// A session left in `GENERATING` longer than this may be reclaimed.
    pub generation_lease_ms: u64,
    /// Tries for the terminal result or failure write.
    pub persist_attempts: u32,
    pub persist_backoff_ms: u64,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            request_timeout_ms: 15_000,
            poll_interval_ms: 100,
            max_session_attempts: 2,
            generation_lease_ms: 60_000,
            persist_attempts: 3,
            persist_backoff_ms: 200,
        }
    }
}

impl OrchestratorSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn generation_lease(&self) -> Duration {
        Duration::from_millis(self.generation_lease_ms)
    }

    pub fn persist_backoff(&self) -> Duration {
        Duration::from_millis(self.persist_backoff_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Dynamodb,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub backend: Option<StoreBackend>,
    pub sessions_table: String,
    pub answers_table: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: None,
            sessions_table: "quiz_sessions".to_string(),
            answers_table: "quiz_answers".to_string(),
        }
    }
}

impl StoreSettings {
    /// Explicit backend, else DynamoDB whenever an AWS target is configured.
    pub fn resolved_backend(&self) -> StoreBackend {
        self.backend.unwrap_or_else(|| {
            if std::env::var("DYNAMODB_ENDPOINT").is_ok() || std::env::var("AWS_REGION").is_ok() {
                StoreBackend::Dynamodb
            } else {
                StoreBackend::Memory
            }
        })
    }
}

impl ServiceConfig {
    pub fn from_yaml_str(raw: &str) -> anyhow::Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let expanded = expand_env_vars(raw);
        serde_yaml::from_str(&expanded).context("failed to parse quiz-bridge config yaml")
    }

    pub fn team_pool(&self) -> TeamPool {
        match self.team_pool.as_ref() {
            Some(profiles) => TeamPool::new(profiles.iter().cloned()),
            None => TeamPool::default(),
        }
    }

    fn apply_env(&mut self) {
        if let Some(bind) = env_string("QUIZ_BRIDGE_BIND") {
            self.server.bind = bind;
        }
        if let Some(api_key) = env_string("GEMINI_API_KEY") {
            self.generation.api_key = Some(api_key);
        }
        if let Some(model) = env_string("GEMINI_MODEL") {
            self.generation.model = model;
        }
        if let Some(base_url) = env_string("GEMINI_BASE_URL") {
            self.generation.base_url = base_url;
        }
        if let Some(value) = env_parse("GENERATION_ATTEMPT_TIMEOUT_MS") {
            self.generation.attempt_timeout_ms = value;
        }
        if let Some(value) = env_parse("GENERATION_MAX_ATTEMPTS") {
            self.generation.max_attempts = value;
        }
        if let Some(value) = env_parse("GEMINI_MIN_REQUEST_INTERVAL_MS") {
            self.generation.min_request_interval_ms = value;
        }
        if let Some(value) = env_parse("QUIZ_GENERATION_LEASE_MS") {
            self.orchestrator.generation_lease_ms = value;
        }
        if let Some(value) = env_parse("QUIZ_REQUEST_TIMEOUT_MS") {
            self.orchestrator.request_timeout_ms = value;
        }
        if let Some(table) = env_string("QUIZ_SESSIONS_TABLE") {
            self.store.sessions_table = table;
        }
        if let Some(table) = env_string("QUIZ_ANSWERS_TABLE") {
            self.store.answers_table = table;
        }
        if let Some(backend) = env_string("QUIZ_STORE_BACKEND") {
            match backend.to_ascii_lowercase().as_str() {
                "memory" => self.store.backend = Some(StoreBackend::Memory),
                "dynamodb" => self.store.backend = Some(StoreBackend::Dynamodb),
                other => warn!(backend = %other, "ignoring unknown QUIZ_STORE_BACKEND"),
            }
        }
        self.generation.api_key = self
            .generation
            .api_key
            .take()
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty());
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let generation = &self.generation;
        if generation.attempt_timeout_ms == 0 {
            anyhow::bail!("generation.attempt_timeout_ms must be positive");
        }
        if generation.max_attempts == 0 {
            anyhow::bail!("generation.max_attempts must be at least 1");
        }
        if generation.max_backoff_ms < generation.initial_backoff_ms {
            anyhow::bail!("generation.max_backoff_ms must not be below initial_backoff_ms");
        }
        if generation.question_count == 0 {
            anyhow::bail!("generation.question_count must be at least 1");
        }

        let orchestrator = &self.orchestrator;
        if orchestrator.request_timeout_ms == 0 || orchestrator.poll_interval_ms == 0 {
            anyhow::bail!("orchestrator timeouts must be positive");
        }
        if orchestrator.max_session_attempts == 0 || orchestrator.persist_attempts == 0 {
            anyhow::bail!("orchestrator attempt counts must be at least 1");
        }
        if orchestrator.generation_lease() <= generation.generation_budget() {
            anyhow::bail!(
                "orchestrator.generation_lease_ms ({}) must exceed the generation budget ({}ms)",
                orchestrator.generation_lease_ms,
                generation.generation_budget().as_millis()
            );
        }

        self.team_pool()
            .validate()
            .context("team pool cannot serve every roster size")?;
        Ok(())
    }
}

/// Reads `QUIZ_BRIDGE_CONFIG_PATH` when set, then applies env overrides and validates.
pub fn load_config() -> anyhow::Result<ServiceConfig> {
    let mut config = match env_string("QUIZ_BRIDGE_CONFIG_PATH") {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read config file {path}"))?;
            let config = ServiceConfig::from_yaml_str(&raw)?;
            info!(path = %path, "loaded quiz-bridge config file");
            config
        }
        None => ServiceConfig::default(),
    };

    config.apply_env();
    config.validate()?;
    Ok(config)
}

fn env_string(var_name: &str) -> Option<String> {
    std::env::var(var_name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parse<T: FromStr>(var_name: &str) -> Option<T> {
    let raw = env_string(var_name)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(var = %var_name, value = %raw, "ignoring unparseable env override");
            None
        }
    }
}
