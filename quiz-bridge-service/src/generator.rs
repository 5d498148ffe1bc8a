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

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use quiz_bridge_common::TeamPool;
use tokio::{sync::Mutex, time::Instant};
use tracing::{debug, info, warn};

use crate::config::GenerationSettings;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GenerationError {
    #[error("model returned an invalid quiz: {0}")]
    InvalidResponse(String),
    #[error("transient model failure: {0}")]
    Transient(String),
    #[error("model rejected the request: {0}")]
    NonTransient(String),
}

/// Produces quiz questions for a team roster.
#[async_trait]
pub trait QuizGenerator: Send + Sync {
    async fn generate(&self, teams: &[String]) -> Result<Vec<String>, GenerationError>;
}

#[derive(Debug, Clone)]
pub struct QuizPrompt {
    pub teams: Vec<String>,
    pub question_count: usize,
    pub text: String,
}

/// One call to a text model. Returns the raw model text.
#[async_trait]
pub trait QuizModel: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(&self, prompt: &QuizPrompt) -> Result<String, GenerationError>;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub attempt_timeout: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub retry_invalid_response: bool,
}

impl RetryPolicy {
    pub fn from_settings(settings: &GenerationSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            attempt_timeout: settings.attempt_timeout(),
            initial_backoff: Duration::from_millis(settings.initial_backoff_ms),
            max_backoff: Duration::from_millis(settings.max_backoff_ms),
            retry_invalid_response: settings.retry_invalid_response,
        }
    }

    /// Delay after failed attempt `attempt` (1-based): doubles each time, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1_u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    fn should_retry(&self, error: &GenerationError) -> bool {
        match error {
            GenerationError::Transient(_) => true,
            GenerationError::InvalidResponse(_) => self.retry_invalid_response,
            GenerationError::NonTransient(_) => false,
        }
    }
}

/// Keeps provider calls at least `min_interval` apart across every session
/// served by one adapter.
struct RequestThrottle {
    min_interval: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl RequestThrottle {
    fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_call: Mutex::new(None),
        }
    }

    async fn wait_turn(&self) {
        if self.min_interval.is_zero() {
            return;
        }
        let mut last_call = self.last_call.lock().await;
        if let Some(previous) = *last_call {
            let ready_at = previous + self.min_interval;
            if ready_at > Instant::now() {
                debug!(
                    wait_ms = (ready_at - Instant::now()).as_millis() as u64,
                    "throttling model request"
                );
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last_call = Some(Instant::now());
    }
}

pub struct QuizGenerationAdapter {
    model: Arc<dyn QuizModel>,
    pool: Arc<TeamPool>,
    policy: RetryPolicy,
    question_count: usize,
    throttle: RequestThrottle,
}

impl QuizGenerationAdapter {
    pub fn new(
        model: Arc<dyn QuizModel>,
        pool: Arc<TeamPool>,
        policy: RetryPolicy,
        question_count: usize,
    ) -> Self {
        Self {
            model,
            pool,
            policy,
            question_count: question_count.max(1),
            throttle: RequestThrottle::new(Duration::ZERO),
        }
    }

    pub fn with_min_request_interval(mut self, min_interval: Duration) -> Self {
        self.throttle = RequestThrottle::new(min_interval);
        self
    }

    async fn attempt(&self, prompt: &QuizPrompt) -> Result<Vec<String>, GenerationError> {
        self.throttle.wait_turn().await;
        match tokio::time::timeout(self.policy.attempt_timeout, self.model.complete(prompt)).await {
            Ok(Ok(text)) => parse_questions(&text),
            Ok(Err(error)) => Err(error),
            Err(_) => Err(GenerationError::Transient(format!(
                "{} did not answer within {}ms",
                self.model.name(),
                self.policy.attempt_timeout.as_millis()
            ))),
        }
    }
}

#[async_trait]
impl QuizGenerator for QuizGenerationAdapter {
    async fn generate(&self, teams: &[String]) -> Result<Vec<String>, GenerationError> {
        let prompt = build_prompt(&self.pool, teams, self.question_count);
        debug!(
            model = %self.model.name(),
            teams = ?teams,
            prompt_chars = prompt.text.chars().count(),
            "prepared quiz prompt"
        );

        let mut attempt = 1;
        loop {
            match self.attempt(&prompt).await {
                Ok(questions) => {
                    info!(
                        model = %self.model.name(),
                        attempt,
                        question_count = questions.len(),
                        "generated quiz questions"
                    );
                    return Ok(questions);
                }
                Err(error) if attempt < self.policy.max_attempts && self.policy.should_retry(&error) => {
                    let delay = self.policy.backoff(attempt);
                    warn!(
                        model = %self.model.name(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "quiz generation attempt failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => {
                    warn!(
                        model = %self.model.name(),
                        attempt,
                        error = %error,
                        "quiz generation failed"
                    );
                    return Err(error);
                }
            }
        }
    }
}

/// Describes each team with its traits and asks for short personality questions.
pub fn build_prompt(pool: &TeamPool, teams: &[String], question_count: usize) -> QuizPrompt {
    let team_lines: Vec<String> = teams
        .iter()
        .map(|team| match pool.profile(team) {
            Some(profile) if !profile.traits.is_empty() => {
                format!("- {} ({})", team, profile.traits.join(", "))
            }
            _ => format!("- {team}"),
        })
        .collect();

    let text = format!(
        "Generate {question_count} short, fun, personality-quiz style questions for players aged 8-18 in a Roblox game.\n\
         Every question must be answerable by picking the one of these team personalities that fits the player best:\n\
         {teams}\n\n\
         Requirements:\n\
         1. Keep questions brief, clear and age-appropriate.\n\
         2. Relate them to hobbies, school, friends and games.\n\
         3. Focus on personality traits, preferences and everyday situations.\n\
         4. Use simple language and avoid mature or abstract themes.\n\n\
         Respond with JSON of the form {{\"questions\": [\"...\"]}} containing exactly {question_count} question strings.",
        teams = team_lines.join("\n"),
    );

    QuizPrompt {
        teams: teams.to_vec(),
        question_count,
        text,
    }
}

/// Accepts `{"questions": [...]}` or a bare array. Entries are question
/// strings or objects carrying `question_text`. Anything blank or malformed
/// rejects the whole response.
pub fn parse_questions(raw: &str) -> Result<Vec<String>, GenerationError> {
    let body = strip_code_fence(raw);
    let value: serde_json::Value = serde_json::from_str(body).map_err(|error| {
        GenerationError::InvalidResponse(format!("response is not JSON: {error}"))
    })?;

    let entries = match &value {
        serde_json::Value::Array(entries) => entries,
        serde_json::Value::Object(map) => map
            .get("questions")
            .and_then(serde_json::Value::as_array)
            .ok_or_else(|| {
                GenerationError::InvalidResponse("missing \"questions\" array".to_string())
            })?,
        _ => {
            return Err(GenerationError::InvalidResponse(
                "response is neither an object nor an array".to_string(),
            ));
        }
    };

    if entries.is_empty() {
        return Err(GenerationError::InvalidResponse(
            "question list is empty".to_string(),
        ));
    }

    entries
        .iter()
        .enumerate()
        .map(|(idx, entry)| -> Result<String, GenerationError> {
            let text = match entry {
                serde_json::Value::String(text) => Some(text.as_str()),
                serde_json::Value::Object(map) => {
                    map.get("question_text").and_then(serde_json::Value::as_str)
                }
                _ => None,
            }
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .ok_or_else(|| {
                GenerationError::InvalidResponse(format!("question {idx} is blank or not a string"))
            })?;
            Ok(text.to_string())
        })
        .collect()
}

fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.trim_start_matches(|c: char| c.is_ascii_alphanumeric());
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        collections::VecDeque,
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
    };

    struct ScriptedModel {
        replies: Mutex<VecDeque<Result<String, GenerationError>>>,
        calls: AtomicUsize,
        delay: Duration,
    }

    impl ScriptedModel {
        fn new(replies: Vec<Result<String, GenerationError>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }

        fn slow(delay: Duration) -> Self {
            Self {
                delay,
                ..Self::new(Vec::new())
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl QuizModel for ScriptedModel {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, _prompt: &QuizPrompt) -> Result<String, GenerationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(r#"{"questions": ["fallback?"]}"#.to_string()))
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            attempt_timeout: Duration::from_millis(200),
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
            retry_invalid_response: false,
        }
    }

    fn adapter(model: Arc<ScriptedModel>, policy: RetryPolicy) -> QuizGenerationAdapter {
        QuizGenerationAdapter::new(model, Arc::new(TeamPool::default()), policy, 5)
    }

    fn teams() -> Vec<String> {
        vec!["EMBER".to_string(), "TERRA".to_string()]
    }

    fn transient() -> Result<String, GenerationError> {
        Err(GenerationError::Transient("503 from provider".to_string()))
    }

    #[tokio::test]
    async fn valid_response_returns_questions_in_order() {
        let model = Arc::new(ScriptedModel::new(vec![Ok(
            r#"{"questions": ["First?", " Second? "]}"#.to_string(),
        )]));
        let questions = adapter(model.clone(), fast_policy())
            .generate(&teams())
            .await
            .unwrap();

        assert_eq!(questions, vec!["First?", "Second?"]);
        assert_eq!(model.calls(), 1);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let model = Arc::new(ScriptedModel::new(vec![
            transient(),
            transient(),
            Ok(r#"["Only one?"]"#.to_string()),
        ]));
        let questions = adapter(model.clone(), fast_policy())
            .generate(&teams())
            .await
            .unwrap();

        assert_eq!(questions, vec!["Only one?"]);
        assert_eq!(model.calls(), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_transient_error() {
        let model = Arc::new(ScriptedModel::new(vec![transient(), transient(), transient()]));
        let error = adapter(model.clone(), fast_policy())
            .generate(&teams())
            .await
            .unwrap_err();

        assert!(matches!(error, GenerationError::Transient(_)));
        assert_eq!(model.calls(), 3);
    }

    #[tokio::test]
    async fn non_transient_failure_is_not_retried() {
        let model = Arc::new(ScriptedModel::new(vec![Err(GenerationError::NonTransient(
            "401 unauthorized".to_string(),
        ))]));
        let error = adapter(model.clone(), fast_policy())
            .generate(&teams())
            .await
            .unwrap_err();

        assert!(matches!(error, GenerationError::NonTransient(_)));
        assert_eq!(model.calls(), 1);
    }

    #[tokio::test]
    async fn invalid_response_fails_without_retry_by_default() {
        let model = Arc::new(ScriptedModel::new(vec![Ok(r#"{"questions": []}"#.to_string())]));
        let error = adapter(model.clone(), fast_policy())
            .generate(&teams())
            .await
            .unwrap_err();

        assert!(matches!(error, GenerationError::InvalidResponse(_)));
        assert_eq!(model.calls(), 1);
    }

    #[tokio::test]
    async fn invalid_response_can_be_retried_when_enabled() {
        let model = Arc::new(ScriptedModel::new(vec![
            Ok("not json at all".to_string()),
            Ok(r#"{"questions": ["Better?"]}"#.to_string()),
        ]));
        let policy = RetryPolicy {
            retry_invalid_response: true,
            ..fast_policy()
        };
        let questions = adapter(model.clone(), policy).generate(&teams()).await.unwrap();

        assert_eq!(questions, vec!["Better?"]);
        assert_eq!(model.calls(), 2);
    }

    #[tokio::test]
    async fn slow_model_counts_as_transient_timeout() {
        let model = Arc::new(ScriptedModel::slow(Duration::from_millis(500)));
        let policy = RetryPolicy {
            max_attempts: 2,
            attempt_timeout: Duration::from_millis(20),
            ..fast_policy()
        };
        let error = adapter(model.clone(), policy)
            .generate(&teams())
            .await
            .unwrap_err();

        assert!(matches!(error, GenerationError::Transient(_)));
        assert_eq!(model.calls(), 2);
    }

    #[tokio::test]
    async fn model_calls_are_spaced_by_min_interval() {
        let model = Arc::new(ScriptedModel::new(Vec::new()));
        let adapter = Arc::new(
            adapter(model.clone(), fast_policy())
                .with_min_request_interval(Duration::from_millis(40)),
        );

        let started = std::time::Instant::now();
        let mut handles = Vec::new();
        for _ in 0..3 {
            let adapter = adapter.clone();
            handles.push(tokio::spawn(async move {
                adapter.generate(&teams()).await.unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(model.calls(), 3);
        assert!(started.elapsed() >= Duration::from_millis(80));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_millis(1_500),
            ..fast_policy()
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(500));
        assert_eq!(policy.backoff(2), Duration::from_millis(1_000));
        assert_eq!(policy.backoff(3), Duration::from_millis(1_500));
        assert_eq!(policy.backoff(40), Duration::from_millis(1_500));
    }

    #[test]
    fn parse_rejects_partial_or_blank_lists() {
        assert!(parse_questions(r#"{"questions": ["ok?", ""]}"#).is_err());
        assert!(parse_questions(r#"{"questions": ["ok?", 3]}"#).is_err());
        assert!(parse_questions(r#"{"items": ["ok?"]}"#).is_err());
        assert!(parse_questions(r#""just a string""#).is_err());
    }

    #[test]
    fn parse_accepts_fenced_json_and_question_objects() {
        let raw = "```json\n{\"questions\": [{\"question_text\": \"Secret door?\", \"answer_choices\": []}]}\n```";
        assert_eq!(parse_questions(raw).unwrap(), vec!["Secret door?"]);
    }

    #[test]
    fn prompt_lists_teams_with_traits() {
        let prompt = build_prompt(
            &TeamPool::default(),
            &["VEIL".to_string(), "UNLISTED".to_string()],
            4,
        );
        assert!(prompt.text.contains("- VEIL (Stealthy, Scheming, Mysterious)"));
        assert!(prompt.text.contains("- UNLISTED"));
        assert!(prompt.text.contains("exactly 4 question strings"));
        assert_eq!(prompt.question_count, 4);
    }
}
