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

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quiz_bridge_common::{GameSession, QuizAnswer, SessionState};
use tokio::sync::RwLock;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("session {game_id} not found")]
    SessionNotFound { game_id: String },
    #[error("team {team} is not part of session {game_id}")]
    UnknownTeam { game_id: String, team: String },
    #[error("session {game_id} is {actual}, expected {expected}")]
    InvalidState {
        game_id: String,
        expected: SessionState,
        actual: SessionState,
    },
    #[error("refusing to store an empty question list for session {game_id}")]
    InvalidQuestions { game_id: String },
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Durable session storage. `create_if_absent` and `transition` are atomic
/// per `game_id`; all cross-request coordination goes through them.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Returns the stored session and `false` when one already exists.
    async fn create_if_absent(
        &self,
        game_id: &str,
        teams: &[String],
    ) -> Result<(GameSession, bool), StoreError>;

    /// Compare-and-swap on the session state. Entering `GENERATING` bumps
    /// `generation_attempts` and clears the previous failure reason.
    async fn transition(
        &self,
        game_id: &str,
        expected: SessionState,
        next: SessionState,
    ) -> Result<bool, StoreError>;

    /// Takes over a session whose generation stopped making progress: only
    /// succeeds while it is still `GENERATING` and was last written before
    /// `stale_before`. Counts as a new generation attempt.
    async fn reclaim_stale(
        &self,
        game_id: &str,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn set_quiz_result(&self, game_id: &str, questions: &[String]) -> Result<(), StoreError>;

    async fn set_failed(&self, game_id: &str, reason: &str) -> Result<(), StoreError>;

    async fn get(&self, game_id: &str) -> Result<GameSession, StoreError>;

    async fn record_answer(&self, answer: &QuizAnswer) -> Result<(), StoreError>;

    async fn list_answers(&self, game_id: &str) -> Result<Vec<QuizAnswer>, StoreError>;
}

#[derive(Default)]
struct InMemoryTables {
    sessions: HashMap<String, GameSession>,
    answers: HashMap<String, Vec<QuizAnswer>>,
}

#[derive(Default)]
pub struct InMemorySessionStore {
    tables: RwLock<InMemoryTables>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn not_found(game_id: &str) -> StoreError {
    StoreError::SessionNotFound {
        game_id: game_id.to_string(),
    }
}

fn require_generating(session: &GameSession) -> Result<(), StoreError> {
    if session.state != SessionState::Generating {
        return Err(StoreError::InvalidState {
            game_id: session.game_id.clone(),
            expected: SessionState::Generating,
            actual: session.state,
        });
    }
    Ok(())
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create_if_absent(
        &self,
        game_id: &str,
        teams: &[String],
    ) -> Result<(GameSession, bool), StoreError> {
        let mut tables = self.tables.write().await;
        if let Some(existing) = tables.sessions.get(game_id) {
            return Ok((existing.clone(), false));
        }

        let session = GameSession::new(game_id, teams.to_vec());
        tables
            .sessions
            .insert(game_id.to_string(), session.clone());
        Ok((session, true))
    }

    async fn transition(
        &self,
        game_id: &str,
        expected: SessionState,
        next: SessionState,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.write().await;
        let session = tables
            .sessions
            .get_mut(game_id)
            .ok_or_else(|| not_found(game_id))?;

        if session.state != expected {
            return Ok(false);
        }

        session.state = next;
        session.updated_at = Utc::now();
        if next == SessionState::Generating {
            session.generation_attempts += 1;
            session.failure_reason = None;
        }
        Ok(true)
    }

    async fn reclaim_stale(
        &self,
        game_id: &str,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.write().await;
        let session = tables
            .sessions
            .get_mut(game_id)
            .ok_or_else(|| not_found(game_id))?;

        if session.state != SessionState::Generating || session.updated_at >= stale_before {
            return Ok(false);
        }

        session.generation_attempts += 1;
        session.updated_at = Utc::now();
        Ok(true)
    }

    async fn set_quiz_result(&self, game_id: &str, questions: &[String]) -> Result<(), StoreError> {
        if questions.is_empty() {
            return Err(StoreError::InvalidQuestions {
                game_id: game_id.to_string(),
            });
        }

        let mut tables = self.tables.write().await;
        let session = tables
            .sessions
            .get_mut(game_id)
            .ok_or_else(|| not_found(game_id))?;
        require_generating(session)?;

        session.quiz_questions = questions.to_vec();
        session.state = SessionState::Ready;
        session.updated_at = Utc::now();
        Ok(())
    }

    async fn set_failed(&self, game_id: &str, reason: &str) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let session = tables
            .sessions
            .get_mut(game_id)
            .ok_or_else(|| not_found(game_id))?;
        require_generating(session)?;

        session.state = SessionState::Failed;
        session.failure_reason = Some(reason.to_string());
        session.updated_at = Utc::now();
        Ok(())
    }

    async fn get(&self, game_id: &str) -> Result<GameSession, StoreError> {
        let tables = self.tables.read().await;
        tables
            .sessions
            .get(game_id)
            .cloned()
            .ok_or_else(|| not_found(game_id))
    }

    async fn record_answer(&self, answer: &QuizAnswer) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        let session = tables
            .sessions
            .get(&answer.game_id)
            .ok_or_else(|| not_found(&answer.game_id))?;

        if !session.has_team(&answer.team) {
            return Err(StoreError::UnknownTeam {
                game_id: answer.game_id.clone(),
                team: answer.team.clone(),
            });
        }

        tables
            .answers
            .entry(answer.game_id.clone())
            .or_default()
            .push(answer.clone());
        Ok(())
    }

    async fn list_answers(&self, game_id: &str) -> Result<Vec<QuizAnswer>, StoreError> {
        let tables = self.tables.read().await;
        if !tables.sessions.contains_key(game_id) {
            return Err(not_found(game_id));
        }
        Ok(tables.answers.get(game_id).cloned().unwrap_or_default())
    }
}
