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

use std::{
    future::Future,
    sync::{Arc, Mutex},
};

use chrono::{DateTime, Utc};
use quiz_bridge_common::{
    GameSession, SessionState, TeamAssignmentError, TeamPool, TeamQuizResponse, assign_teams,
};
use rand::{SeedableRng, rngs::StdRng};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{
    config::OrchestratorSettings,
    generator::QuizGenerator,
    store::{SessionStore, StoreError},
};

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error(transparent)]
    TeamAssignment(#[from] TeamAssignmentError),
    #[error("quiz generation failed for {game_id}: {reason}")]
    GenerationFailed { game_id: String, reason: String },
    #[error("quiz for {game_id} was not ready within {waited_ms}ms")]
    GenerationTimeout { game_id: String, waited_ms: u64 },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Identifiers are opaque keys: they must be non-empty and are never trimmed,
/// so surrounding whitespace is rejected rather than silently folded.
pub fn require_identifier<'a>(field: &str, value: &'a str) -> Result<&'a str, OrchestratorError> {
    if value.is_empty() {
        return Err(OrchestratorError::InvalidRequest(format!(
            "{field} must not be empty"
        )));
    }
    if value.trim() != value {
        return Err(OrchestratorError::InvalidRequest(format!(
            "{field} must not have leading or trailing whitespace"
        )));
    }
    Ok(value)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuizOutcome {
    pub game_id: String,
    pub teams: Vec<String>,
    pub quiz_questions: Vec<String>,
}

impl From<GameSession> for QuizOutcome {
    fn from(session: GameSession) -> Self {
        Self {
            game_id: session.game_id,
            teams: session.teams,
            quiz_questions: session.quiz_questions,
        }
    }
}

impl From<QuizOutcome> for TeamQuizResponse {
    fn from(outcome: QuizOutcome) -> Self {
        Self {
            game_id: outcome.game_id,
            teams: outcome.teams,
            quiz_questions: outcome.quiz_questions,
        }
    }
}

/// Correlates game instances with their teams and quiz. All coordination
/// between concurrent requests for one game goes through the store's
/// create-if-absent and compare-and-swap operations.
pub struct SessionOrchestrator {
    store: Arc<dyn SessionStore>,
    generator: Arc<dyn QuizGenerator>,
    pool: Arc<TeamPool>,
    rng: Mutex<StdRng>,
    settings: OrchestratorSettings,
}

impl SessionOrchestrator {
    pub fn new(
        store: Arc<dyn SessionStore>,
        generator: Arc<dyn QuizGenerator>,
        pool: Arc<TeamPool>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self::with_rng(
            store,
            generator,
            pool,
            settings,
            StdRng::from_rng(&mut rand::rng()),
        )
    }

    pub fn with_rng(
        store: Arc<dyn SessionStore>,
        generator: Arc<dyn QuizGenerator>,
        pool: Arc<TeamPool>,
        settings: OrchestratorSettings,
        rng: StdRng,
    ) -> Self {
        Self {
            store,
            generator,
            pool,
            rng: Mutex::new(rng),
            settings,
        }
    }

    pub async fn request_quiz(
        &self,
        game_id: &str,
        player_count: usize,
    ) -> Result<QuizOutcome, OrchestratorError> {
        let game_id = require_identifier("game_id", game_id)?;
        let deadline = Instant::now() + self.settings.request_timeout();

        let teams = self.assign(player_count)?;
        let (session, created) = self.store.create_if_absent(game_id, &teams).await?;
        if created {
            info!(game_id = %game_id, player_count, teams = ?session.teams, "created quiz session");
        } else {
            debug!(game_id = %game_id, state = %session.state, "found existing quiz session");
        }

        self.resolve(session, deadline).await
    }

    fn assign(&self, player_count: usize) -> Result<Vec<String>, TeamAssignmentError> {
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        assign_teams(&self.pool, player_count, &mut *rng)
    }

    async fn resolve(
        &self,
        mut session: GameSession,
        deadline: Instant,
    ) -> Result<QuizOutcome, OrchestratorError> {
        // Set once this request has waited on someone else's attempt; a
        // failure of that attempt is reported, not retried.
        let mut joined = false;
        loop {
            let game_id = session.game_id.clone();
            match session.state {
                SessionState::Ready => return Ok(session.into()),
                SessionState::Failed if joined => return Err(failed(session)),
                SessionState::Failed => {
                    if session.generation_attempts >= self.settings.max_session_attempts {
                        return Err(failed(session));
                    }
                    if self
                        .store
                        .transition(&game_id, SessionState::Failed, SessionState::Generating)
                        .await?
                    {
                        info!(
                            game_id = %game_id,
                            attempt = session.generation_attempts + 1,
                            "retrying quiz generation for failed session"
                        );
                        return self.run_generation(session, deadline).await;
                    }
                }
                SessionState::PendingTeams => {
                    if self
                        .store
                        .transition(&game_id, SessionState::PendingTeams, SessionState::Generating)
                        .await?
                    {
                        return self.run_generation(session, deadline).await;
                    }
                }
                SessionState::Generating => match self.stale_cutoff(&session) {
                    Some(_) if session.generation_attempts >= self.settings.max_session_attempts => {
                        warn!(game_id = %game_id, "stalled quiz generation has no attempts left");
                        match self.store.set_failed(&game_id, "generation lease expired").await {
                            Ok(()) | Err(StoreError::InvalidState { .. }) => {}
                            Err(error) => return Err(error.into()),
                        }
                    }
                    Some(stale_before) => {
                        if self.store.reclaim_stale(&game_id, stale_before).await? {
                            warn!(
                                game_id = %game_id,
                                attempt = session.generation_attempts + 1,
                                updated_at = %session.updated_at,
                                "reclaiming stalled quiz generation"
                            );
                            return self.run_generation(session, deadline).await;
                        }
                    }
                    None => {
                        joined = true;
                        let now = Instant::now();
                        if now >= deadline {
                            return Err(self.timeout_error(game_id));
                        }
                        tokio::time::sleep(self.settings.poll_interval().min(deadline - now)).await;
                    }
                },
            }

            session = self.store.get(&game_id).await?;
        }
    }

    /// Cutoff to reclaim with when the session has outlived its lease.
    fn stale_cutoff(&self, session: &GameSession) -> Option<DateTime<Utc>> {
        let lease = chrono::Duration::from_std(self.settings.generation_lease()).ok()?;
        let cutoff = Utc::now() - lease;
        (session.updated_at < cutoff).then_some(cutoff)
    }

    /// Runs the generation on its own task so a dropped or timed-out request
    /// never leaves the session without a terminal write.
    async fn run_generation(
        &self,
        session: GameSession,
        deadline: Instant,
    ) -> Result<QuizOutcome, OrchestratorError> {
        let GameSession { game_id, teams, .. } = session;
        let task = tokio::spawn(generate_and_persist(
            self.store.clone(),
            self.generator.clone(),
            self.settings.clone(),
            game_id.clone(),
            teams,
        ));

        match tokio::time::timeout_at(deadline, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => {
                let reason = format!("generation task aborted: {join_error}");
                warn!(game_id = %game_id, error = %reason, "quiz generation task died");
                if let Err(error) = self.store.set_failed(&game_id, &reason).await {
                    warn!(game_id = %game_id, error = %error, "failed to mark session failed");
                }
                Err(OrchestratorError::GenerationFailed { game_id, reason })
            }
            Err(_) => {
                warn!(game_id = %game_id, "quiz generation still running at request deadline");
                Err(self.timeout_error(game_id))
            }
        }
    }

    fn timeout_error(&self, game_id: String) -> OrchestratorError {
        OrchestratorError::GenerationTimeout {
            game_id,
            waited_ms: self.settings.request_timeout_ms,
        }
    }
}

fn failed(session: GameSession) -> OrchestratorError {
    OrchestratorError::GenerationFailed {
        game_id: session.game_id,
        reason: session
            .failure_reason
            .unwrap_or_else(|| "generation attempts exhausted".to_string()),
    }
}

async fn generate_and_persist(
    store: Arc<dyn SessionStore>,
    generator: Arc<dyn QuizGenerator>,
    settings: OrchestratorSettings,
    game_id: String,
    teams: Vec<String>,
) -> Result<QuizOutcome, OrchestratorError> {
    let reason = match generator.generate(&teams).await {
        Ok(questions) => {
            let stored = persist_with_retry(&settings, &game_id, "quiz_result", || {
                store.set_quiz_result(&game_id, &questions)
            })
            .await;
            match stored {
                Ok(()) => {
                    info!(game_id = %game_id, question_count = questions.len(), "quiz ready");
                    return Ok(QuizOutcome {
                        game_id,
                        teams,
                        quiz_questions: questions,
                    });
                }
                // A reclaiming request finished first.
                Err(StoreError::InvalidState {
                    actual: SessionState::Ready,
                    ..
                }) => return Ok(store.get(&game_id).await?.into()),
                Err(error) => format!("failed to persist quiz: {error}"),
            }
        }
        Err(error) => error.to_string(),
    };

    warn!(game_id = %game_id, reason = %reason, "marking quiz session failed");
    if let Err(error) = persist_with_retry(&settings, &game_id, "failure", || {
        store.set_failed(&game_id, &reason)
    })
    .await
    {
        warn!(
            game_id = %game_id,
            error = %error,
            "could not record failure; session stays GENERATING until its lease expires"
        );
    }
    Err(OrchestratorError::GenerationFailed { game_id, reason })
}

/// Retries backend failures of a terminal session write with linear backoff.
/// State conflicts are returned as-is.
async fn persist_with_retry<F, Fut>(
    settings: &OrchestratorSettings,
    game_id: &str,
    write: &str,
    mut op: F,
) -> Result<(), StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), StoreError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(()) => return Ok(()),
            Err(StoreError::Backend(error)) if attempt < settings.persist_attempts => {
                let delay = settings.persist_backoff() * attempt;
                warn!(
                    game_id = %game_id,
                    write,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "session write failed; retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(error) => return Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        generator::{
            GenerationError, QuizGenerationAdapter, QuizModel, QuizPrompt, RetryPolicy,
        },
        store::InMemorySessionStore,
    };
    use async_trait::async_trait;
    use quiz_bridge_common::QuizAnswer;
    use std::{
        collections::VecDeque,
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    struct CountingGenerator {
        calls: AtomicUsize,
        delay: Duration,
        replies: Mutex<VecDeque<Result<Vec<String>, GenerationError>>>,
    }

    impl CountingGenerator {
        fn new(delay: Duration) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay,
                replies: Mutex::new(VecDeque::new()),
            }
        }

        fn scripted(replies: Vec<Result<Vec<String>, GenerationError>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                ..Self::new(Duration::ZERO)
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl QuizGenerator for CountingGenerator {
        async fn generate(&self, teams: &[String]) -> Result<Vec<String>, GenerationError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let scripted = self.replies.lock().unwrap().pop_front();
            scripted.unwrap_or_else(|| {
                Ok(vec![
                    format!("Call {call}: which of {} fits you?", teams.join("/")),
                    "Second question?".to_string(),
                ])
            })
        }
    }

    /// Fails the first `failures` terminal writes with a backend error.
    struct FlakyStore {
        inner: InMemorySessionStore,
        failures: AtomicUsize,
    }

    impl FlakyStore {
        fn new(failures: usize) -> Self {
            Self {
                inner: InMemorySessionStore::new(),
                failures: AtomicUsize::new(failures),
            }
        }

        fn trip(&self) -> Result<(), StoreError> {
            let tripped = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
            if tripped {
                return Err(anyhow::anyhow!("throttled").into());
            }
            Ok(())
        }
    }

    #[async_trait]
    impl SessionStore for FlakyStore {
        async fn create_if_absent(
            &self,
            game_id: &str,
            teams: &[String],
        ) -> Result<(GameSession, bool), StoreError> {
            self.inner.create_if_absent(game_id, teams).await
        }

        async fn transition(
            &self,
            game_id: &str,
            expected: SessionState,
            next: SessionState,
        ) -> Result<bool, StoreError> {
            self.inner.transition(game_id, expected, next).await
        }

        async fn reclaim_stale(
            &self,
            game_id: &str,
            stale_before: DateTime<Utc>,
        ) -> Result<bool, StoreError> {
            self.inner.reclaim_stale(game_id, stale_before).await
        }

        async fn set_quiz_result(
            &self,
            game_id: &str,
            questions: &[String],
        ) -> Result<(), StoreError> {
            self.trip()?;
            self.inner.set_quiz_result(game_id, questions).await
        }

        async fn set_failed(&self, game_id: &str, reason: &str) -> Result<(), StoreError> {
            self.trip()?;
            self.inner.set_failed(game_id, reason).await
        }

        async fn get(&self, game_id: &str) -> Result<GameSession, StoreError> {
            self.inner.get(game_id).await
        }

        async fn record_answer(&self, answer: &QuizAnswer) -> Result<(), StoreError> {
            self.inner.record_answer(answer).await
        }

        async fn list_answers(&self, game_id: &str) -> Result<Vec<QuizAnswer>, StoreError> {
            self.inner.list_answers(game_id).await
        }
    }

    struct ScriptedModel {
        calls: AtomicUsize,
        replies: Mutex<VecDeque<Result<String, GenerationError>>>,
    }

    #[async_trait]
    impl QuizModel for ScriptedModel {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn complete(&self, _prompt: &QuizPrompt) -> Result<String, GenerationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let scripted = self.replies.lock().unwrap().pop_front();
            scripted.unwrap_or_else(|| Ok(r#"{"questions": ["Fresh start?"]}"#.to_string()))
        }
    }

    fn settings() -> OrchestratorSettings {
        OrchestratorSettings {
            request_timeout_ms: 2_000,
            poll_interval_ms: 5,
            max_session_attempts: 2,
            generation_lease_ms: 60_000,
            persist_attempts: 3,
            persist_backoff_ms: 1,
        }
    }

    fn orchestrator(
        store: Arc<dyn SessionStore>,
        generator: Arc<dyn QuizGenerator>,
        settings: OrchestratorSettings,
    ) -> SessionOrchestrator {
        SessionOrchestrator::with_rng(
            store,
            generator,
            Arc::new(TeamPool::default()),
            settings,
            StdRng::seed_from_u64(11),
        )
    }

    #[tokio::test]
    async fn concurrent_requests_share_one_generation() {
        let store = Arc::new(InMemorySessionStore::new());
        let generator = Arc::new(CountingGenerator::new(Duration::from_millis(50)));
        let orchestrator = Arc::new(orchestrator(store.clone(), generator.clone(), settings()));

        let mut handles = Vec::new();
        for idx in 0..12 {
            let orchestrator = orchestrator.clone();
            handles.push(tokio::spawn(async move {
                orchestrator.request_quiz("g1", 6 + idx).await.unwrap()
            }));
        }

        let mut outcomes = Vec::new();
        for handle in handles {
            outcomes.push(handle.await.unwrap());
        }

        assert_eq!(generator.calls(), 1);
        assert!(outcomes.iter().all(|outcome| outcome == &outcomes[0]));
        assert!(!outcomes[0].quiz_questions.is_empty());

        let session = store.get("g1").await.unwrap();
        assert_eq!(session.state, SessionState::Ready);
        assert_eq!(session.teams, outcomes[0].teams);
        assert_eq!(session.generation_attempts, 1);
    }

    #[tokio::test]
    async fn ready_session_is_returned_unchanged() {
        let store = Arc::new(InMemorySessionStore::new());
        let generator = Arc::new(CountingGenerator::new(Duration::ZERO));
        let orchestrator = orchestrator(store.clone(), generator.clone(), settings());

        let first = orchestrator.request_quiz("g1", 8).await.unwrap();
        assert_eq!(first.teams.len(), 2);

        // A later roster size must not recompute teams for an existing game.
        let second = orchestrator.request_quiz("g1", 20).await.unwrap();
        assert_eq!(second, first);
        assert_eq!(generator.calls(), 1);
    }

    #[tokio::test]
    async fn exhausted_generation_fails_then_fresh_request_retries() {
        let store = Arc::new(InMemorySessionStore::new());
        let generator = Arc::new(CountingGenerator::scripted(vec![Err(
            GenerationError::Transient("503 after all retries".to_string()),
        )]));
        let orchestrator = orchestrator(store.clone(), generator.clone(), settings());

        let error = orchestrator.request_quiz("g1", 12).await.unwrap_err();
        assert!(matches!(error, OrchestratorError::GenerationFailed { .. }));
        let failed = store.get("g1").await.unwrap();
        assert_eq!(failed.state, SessionState::Failed);
        assert!(failed.quiz_questions.is_empty());

        let outcome = orchestrator.request_quiz("g1", 12).await.unwrap();
        assert_eq!(outcome.teams, failed.teams);
        assert_eq!(outcome.teams.len(), 3);
        assert_eq!(generator.calls(), 2);

        let session = store.get("g1").await.unwrap();
        assert_eq!(session.state, SessionState::Ready);
        assert_eq!(session.generation_attempts, 2);
        assert_eq!(session.failure_reason, None);
    }

    #[tokio::test]
    async fn adapter_retry_exhaustion_fails_session_until_next_request() {
        let model = Arc::new(ScriptedModel {
            calls: AtomicUsize::new(0),
            replies: Mutex::new(
                (0..3)
                    .map(|_| Err(GenerationError::Transient("429 from provider".to_string())))
                    .collect(),
            ),
        });
        let pool = Arc::new(TeamPool::default());
        let adapter = QuizGenerationAdapter::new(
            model.clone(),
            pool.clone(),
            RetryPolicy {
                max_attempts: 3,
                attempt_timeout: Duration::from_millis(200),
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
                retry_invalid_response: false,
            },
            5,
        );
        let store = Arc::new(InMemorySessionStore::new());
        let orchestrator = SessionOrchestrator::with_rng(
            store.clone(),
            Arc::new(adapter),
            pool,
            settings(),
            StdRng::seed_from_u64(3),
        );

        match orchestrator.request_quiz("g1", 9).await.unwrap_err() {
            OrchestratorError::GenerationFailed { reason, .. } => assert!(reason.contains("429")),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(model.calls.load(Ordering::SeqCst), 3);
        assert_eq!(store.get("g1").await.unwrap().state, SessionState::Failed);

        let outcome = orchestrator.request_quiz("g1", 9).await.unwrap();
        assert_eq!(outcome.quiz_questions, vec!["Fresh start?"]);
        assert_eq!(model.calls.load(Ordering::SeqCst), 4);
        assert_eq!(store.get("g1").await.unwrap().generation_attempts, 2);
    }

    #[tokio::test]
    async fn concurrent_requests_after_failure_share_one_retry() {
        let store = Arc::new(InMemorySessionStore::new());
        let generator = Arc::new(CountingGenerator {
            delay: Duration::from_millis(30),
            ..CountingGenerator::scripted(vec![Err(GenerationError::Transient(
                "provider down".to_string(),
            ))])
        });
        let orchestrator = Arc::new(orchestrator(store.clone(), generator.clone(), settings()));

        assert!(orchestrator.request_quiz("g1", 10).await.is_err());
        assert_eq!(generator.calls(), 1);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let orchestrator = orchestrator.clone();
            handles.push(tokio::spawn(async move {
                orchestrator.request_quiz("g1", 10).await.unwrap()
            }));
        }
        let mut outcomes = Vec::new();
        for handle in handles {
            outcomes.push(handle.await.unwrap());
        }

        assert_eq!(generator.calls(), 2);
        assert!(outcomes.iter().all(|outcome| outcome == &outcomes[0]));
        assert_eq!(store.get("g1").await.unwrap().generation_attempts, 2);
    }

    #[tokio::test]
    async fn failed_session_stops_after_attempt_cap() {
        let store = Arc::new(InMemorySessionStore::new());
        let generator = Arc::new(CountingGenerator::scripted(vec![Err(
            GenerationError::NonTransient("401 unauthorized".to_string()),
        )]));
        let capped = OrchestratorSettings {
            max_session_attempts: 1,
            ..settings()
        };
        let orchestrator = orchestrator(store.clone(), generator.clone(), capped);

        assert!(orchestrator.request_quiz("g1", 6).await.is_err());
        let error = orchestrator.request_quiz("g1", 6).await.unwrap_err();
        match error {
            OrchestratorError::GenerationFailed { reason, .. } => {
                assert!(reason.contains("401 unauthorized"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(generator.calls(), 1);
    }

    #[tokio::test]
    async fn transient_result_write_is_retried() {
        let store = Arc::new(FlakyStore::new(1));
        let generator = Arc::new(CountingGenerator::new(Duration::ZERO));
        let orchestrator = orchestrator(store.clone(), generator.clone(), settings());

        let outcome = orchestrator.request_quiz("g1", 8).await.unwrap();
        let session = store.get("g1").await.unwrap();
        assert_eq!(session.state, SessionState::Ready);
        assert_eq!(session.quiz_questions, outcome.quiz_questions);
        assert_eq!(generator.calls(), 1);
    }

    #[tokio::test]
    async fn stalled_session_is_reclaimed_after_lease() {
        // Enough failures to exhaust both the result and the failure write.
        let store = Arc::new(FlakyStore::new(6));
        let generator = Arc::new(CountingGenerator::new(Duration::ZERO));
        let leased = OrchestratorSettings {
            generation_lease_ms: 50,
            ..settings()
        };
        let orchestrator = orchestrator(store.clone(), generator.clone(), leased);

        let error = orchestrator.request_quiz("g1", 8).await.unwrap_err();
        assert!(matches!(error, OrchestratorError::GenerationFailed { .. }));
        let stuck = store.get("g1").await.unwrap();
        assert_eq!(stuck.state, SessionState::Generating);
        assert_eq!(stuck.generation_attempts, 1);

        // The next caller waits out the lease, then takes the session over.
        let outcome = orchestrator.request_quiz("g1", 8).await.unwrap();
        assert_eq!(outcome.teams, stuck.teams);
        assert_eq!(generator.calls(), 2);

        let session = store.get("g1").await.unwrap();
        assert_eq!(session.state, SessionState::Ready);
        assert_eq!(session.generation_attempts, 2);
    }

    #[tokio::test]
    async fn stalled_session_without_attempts_left_is_failed() {
        let store = Arc::new(FlakyStore::new(6));
        let generator = Arc::new(CountingGenerator::new(Duration::ZERO));
        let leased = OrchestratorSettings {
            generation_lease_ms: 30,
            max_session_attempts: 1,
            ..settings()
        };
        let orchestrator = orchestrator(store.clone(), generator.clone(), leased);

        assert!(orchestrator.request_quiz("g1", 8).await.is_err());
        match orchestrator.request_quiz("g1", 8).await.unwrap_err() {
            OrchestratorError::GenerationFailed { reason, .. } => {
                assert_eq!(reason, "generation lease expired");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(generator.calls(), 1);
        assert_eq!(store.get("g1").await.unwrap().state, SessionState::Failed);
    }

    #[tokio::test]
    async fn slow_generation_times_out_but_still_completes() {
        let store = Arc::new(InMemorySessionStore::new());
        let generator = Arc::new(CountingGenerator::new(Duration::from_millis(200)));
        let impatient = OrchestratorSettings {
            request_timeout_ms: 30,
            ..settings()
        };
        let orchestrator = orchestrator(store.clone(), generator.clone(), impatient);

        let error = orchestrator.request_quiz("g1", 10).await.unwrap_err();
        assert!(matches!(
            error,
            OrchestratorError::GenerationTimeout { waited_ms: 30, .. }
        ));

        let waiter = orchestrator.request_quiz("g1", 10).await.unwrap_err();
        assert!(matches!(waiter, OrchestratorError::GenerationTimeout { .. }));

        tokio::time::sleep(Duration::from_millis(400)).await;
        let session = store.get("g1").await.unwrap();
        assert_eq!(session.state, SessionState::Ready);
        assert_eq!(generator.calls(), 1);

        let outcome = orchestrator.request_quiz("g1", 10).await.unwrap();
        assert_eq!(outcome.quiz_questions, session.quiz_questions);
    }

    #[tokio::test]
    async fn malformed_game_ids_are_rejected_without_writes() {
        let store = Arc::new(InMemorySessionStore::new());
        let generator = Arc::new(CountingGenerator::new(Duration::ZERO));
        let orchestrator = orchestrator(store.clone(), generator.clone(), settings());

        for game_id in ["", "   ", " g1 ", "g1\n"] {
            let error = orchestrator.request_quiz(game_id, 8).await.unwrap_err();
            assert!(matches!(error, OrchestratorError::InvalidRequest(_)));
        }
        assert_eq!(generator.calls(), 0);
        assert!(matches!(
            store.get("g1").await.unwrap_err(),
            StoreError::SessionNotFound { .. }
        ));
    }

    #[tokio::test]
    async fn seeded_rng_gives_reproducible_teams() {
        let first = orchestrator(
            Arc::new(InMemorySessionStore::new()),
            Arc::new(CountingGenerator::new(Duration::ZERO)),
            settings(),
        )
        .request_quiz("g1", 16)
        .await
        .unwrap();
        let second = orchestrator(
            Arc::new(InMemorySessionStore::new()),
            Arc::new(CountingGenerator::new(Duration::ZERO)),
            settings(),
        )
        .request_quiz("g1", 16)
        .await
        .unwrap();

        assert_eq!(first.teams.len(), 4);
        assert_eq!(first.teams, second.teams);
    }
}
