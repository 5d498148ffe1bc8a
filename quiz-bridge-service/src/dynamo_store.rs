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

use anyhow::Context;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_dynamodb::{Client as DynamoClient, types::AttributeValue};
use chrono::{DateTime, SecondsFormat, Utc};
use quiz_bridge_common::{GameSession, QuizAnswer, SessionState};
use tracing::info;

use crate::{
    config::StoreSettings,
    store::{SessionStore, StoreError},
};

type Item = HashMap<String, AttributeValue>;

/// Sessions live in one table keyed by `game_id`; answers in a second table
/// keyed by (`game_id`, `answer_id`). Every state change is a conditional
/// write, so concurrent service instances agree on who generates.
#[derive(Clone)]
pub struct DynamoSessionStore {
    client: DynamoClient,
    sessions_table: String,
    answers_table: String,
}

impl DynamoSessionStore {
    pub async fn from_settings(settings: &StoreSettings) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Ok(endpoint) = std::env::var("DYNAMODB_ENDPOINT") {
            loader = loader.endpoint_url(endpoint);
        }
        let config = loader.load().await;

        info!(
            sessions_table = %settings.sessions_table,
            answers_table = %settings.answers_table,
            "DynamoDB session store enabled"
        );
        Self {
            client: DynamoClient::new(&config),
            sessions_table: settings.sessions_table.clone(),
            answers_table: settings.answers_table.clone(),
        }
    }

    async fn fetch(&self, game_id: &str) -> Result<Option<GameSession>, StoreError> {
        let output = self
            .client
            .get_item()
            .table_name(&self.sessions_table)
            .key("game_id", AttributeValue::S(game_id.to_string()))
            .consistent_read(true)
            .send()
            .await
            .context("failed to read quiz session")?;

        output.item().map(session_from_item).transpose()
    }

    async fn require(&self, game_id: &str) -> Result<GameSession, StoreError> {
        self.fetch(game_id)
            .await?
            .ok_or_else(|| StoreError::SessionNotFound {
                game_id: game_id.to_string(),
            })
    }

    /// Explains a failed `#state = :generating` condition.
    async fn generating_conflict(&self, game_id: &str) -> StoreError {
        match self.require(game_id).await {
            Ok(session) => StoreError::InvalidState {
                game_id: game_id.to_string(),
                expected: SessionState::Generating,
                actual: session.state,
            },
            Err(error) => error,
        }
    }
}

#[async_trait]
impl SessionStore for DynamoSessionStore {
    async fn create_if_absent(
        &self,
        game_id: &str,
        teams: &[String],
    ) -> Result<(GameSession, bool), StoreError> {
        let session = GameSession::new(game_id, teams.to_vec());
        let result = self
            .client
            .put_item()
            .table_name(&self.sessions_table)
            .set_item(Some(session_to_item(&session)))
            .condition_expression("attribute_not_exists(game_id)")
            .send()
            .await;

        match result {
            Ok(_) => Ok((session, true)),
            Err(error)
                if error
                    .as_service_error()
                    .is_some_and(|service| service.is_conditional_check_failed_exception()) =>
            {
                Ok((self.require(game_id).await?, false))
            }
            Err(error) => Err(anyhow::Error::new(error)
                .context("failed to create quiz session")
                .into()),
        }
    }

    async fn transition(
        &self,
        game_id: &str,
        expected: SessionState,
        next: SessionState,
    ) -> Result<bool, StoreError> {
        let mut update = self
            .client
            .update_item()
            .table_name(&self.sessions_table)
            .key("game_id", AttributeValue::S(game_id.to_string()))
            .condition_expression("attribute_exists(game_id) AND #state = :expected")
            .expression_attribute_names("#state", "session_state")
            .expression_attribute_values(":expected", AttributeValue::S(expected.to_string()))
            .expression_attribute_values(":next", AttributeValue::S(next.to_string()))
            .expression_attribute_values(":updated_at", timestamp(Utc::now()));

        update = if next == SessionState::Generating {
            update
                .update_expression(
                    "SET #state = :next, updated_at = :updated_at \
                     ADD generation_attempts :one REMOVE failure_reason",
                )
                .expression_attribute_values(":one", AttributeValue::N("1".to_string()))
        } else {
            update.update_expression("SET #state = :next, updated_at = :updated_at")
        };

        match update.send().await {
            Ok(_) => Ok(true),
            Err(error)
                if error
                    .as_service_error()
                    .is_some_and(|service| service.is_conditional_check_failed_exception()) =>
            {
                // Distinguish a lost race from a missing session.
                self.require(game_id).await?;
                Ok(false)
            }
            Err(error) => Err(anyhow::Error::new(error)
                .context("failed to transition quiz session")
                .into()),
        }
    }

    async fn reclaim_stale(
        &self,
        game_id: &str,
        stale_before: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = self
            .client
            .update_item()
            .table_name(&self.sessions_table)
            .key("game_id", AttributeValue::S(game_id.to_string()))
            .condition_expression(
                "attribute_exists(game_id) AND #state = :generating AND updated_at < :stale_before",
            )
            .update_expression("SET updated_at = :updated_at ADD generation_attempts :one")
            .expression_attribute_names("#state", "session_state")
            .expression_attribute_values(
                ":generating",
                AttributeValue::S(SessionState::Generating.to_string()),
            )
            .expression_attribute_values(":stale_before", timestamp(stale_before))
            .expression_attribute_values(":updated_at", timestamp(Utc::now()))
            .expression_attribute_values(":one", AttributeValue::N("1".to_string()))
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(error)
                if error
                    .as_service_error()
                    .is_some_and(|service| service.is_conditional_check_failed_exception()) =>
            {
                self.require(game_id).await?;
                Ok(false)
            }
            Err(error) => Err(anyhow::Error::new(error)
                .context("failed to reclaim quiz session")
                .into()),
        }
    }

    async fn set_quiz_result(&self, game_id: &str, questions: &[String]) -> Result<(), StoreError> {
        if questions.is_empty() {
            return Err(StoreError::InvalidQuestions {
                game_id: game_id.to_string(),
            });
        }

        let result = self
            .client
            .update_item()
            .table_name(&self.sessions_table)
            .key("game_id", AttributeValue::S(game_id.to_string()))
            .condition_expression("#state = :generating")
            .update_expression(
                "SET #state = :ready, quiz_questions = :questions, updated_at = :updated_at",
            )
            .expression_attribute_names("#state", "session_state")
            .expression_attribute_values(
                ":generating",
                AttributeValue::S(SessionState::Generating.to_string()),
            )
            .expression_attribute_values(":ready", AttributeValue::S(SessionState::Ready.to_string()))
            .expression_attribute_values(":questions", string_list(questions))
            .expression_attribute_values(":updated_at", timestamp(Utc::now()))
            .send()
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(error)
                if error
                    .as_service_error()
                    .is_some_and(|service| service.is_conditional_check_failed_exception()) =>
            {
                Err(self.generating_conflict(game_id).await)
            }
            Err(error) => Err(anyhow::Error::new(error)
                .context("failed to store quiz questions")
                .into()),
        }
    }

    async fn set_failed(&self, game_id: &str, reason: &str) -> Result<(), StoreError> {
        let result = self
            .client
            .update_item()
            .table_name(&self.sessions_table)
            .key("game_id", AttributeValue::S(game_id.to_string()))
            .condition_expression("#state = :generating")
            .update_expression(
                "SET #state = :failed, failure_reason = :reason, updated_at = :updated_at",
            )
            .expression_attribute_names("#state", "session_state")
            .expression_attribute_values(
                ":generating",
                AttributeValue::S(SessionState::Generating.to_string()),
            )
            .expression_attribute_values(":failed", AttributeValue::S(SessionState::Failed.to_string()))
            .expression_attribute_values(":reason", AttributeValue::S(reason.to_string()))
            .expression_attribute_values(":updated_at", timestamp(Utc::now()))
            .send()
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(error)
                if error
                    .as_service_error()
                    .is_some_and(|service| service.is_conditional_check_failed_exception()) =>
            {
                Err(self.generating_conflict(game_id).await)
            }
            Err(error) => Err(anyhow::Error::new(error)
                .context("failed to mark quiz session failed")
                .into()),
        }
    }

    async fn get(&self, game_id: &str) -> Result<GameSession, StoreError> {
        self.require(game_id).await
    }

    async fn record_answer(&self, answer: &QuizAnswer) -> Result<(), StoreError> {
        let session = self.require(&answer.game_id).await?;
        if !session.has_team(&answer.team) {
            return Err(StoreError::UnknownTeam {
                game_id: answer.game_id.clone(),
                team: answer.team.clone(),
            });
        }

        self.client
            .put_item()
            .table_name(&self.answers_table)
            .set_item(Some(answer_to_item(answer)))
            .condition_expression("attribute_not_exists(answer_id)")
            .send()
            .await
            .context("failed to store quiz answer")?;
        Ok(())
    }

    async fn list_answers(&self, game_id: &str) -> Result<Vec<QuizAnswer>, StoreError> {
        self.require(game_id).await?;

        let mut answers = Vec::new();
        let mut start_key: Option<Item> = None;
        loop {
            let output = self
                .client
                .query()
                .table_name(&self.answers_table)
                .key_condition_expression("game_id = :game_id")
                .expression_attribute_values(":game_id", AttributeValue::S(game_id.to_string()))
                .consistent_read(true)
                .set_exclusive_start_key(start_key.take())
                .send()
                .await
                .context("failed to query quiz answers")?;

            for item in output.items() {
                answers.push(answer_from_item(item)?);
            }

            match output.last_evaluated_key() {
                Some(key) if !key.is_empty() => start_key = Some(key.clone()),
                _ => break,
            }
        }

        answers.sort_by(|left, right| left.submitted_at.cmp(&right.submitted_at));
        Ok(answers)
    }
}

/// Fixed-width UTC timestamps so `updated_at` compares correctly as a string
/// inside condition expressions.
fn timestamp(value: DateTime<Utc>) -> AttributeValue {
    AttributeValue::S(value.to_rfc3339_opts(SecondsFormat::Nanos, true))
}

fn string_list(values: &[String]) -> AttributeValue {
    AttributeValue::L(
        values
            .iter()
            .map(|value| AttributeValue::S(value.clone()))
            .collect(),
    )
}

fn session_to_item(session: &GameSession) -> Item {
    let mut item = HashMap::new();
    item.insert(
        "game_id".to_string(),
        AttributeValue::S(session.game_id.clone()),
    );
    item.insert("teams".to_string(), string_list(&session.teams));
    item.insert(
        "quiz_questions".to_string(),
        string_list(&session.quiz_questions),
    );
    item.insert(
        "session_state".to_string(),
        AttributeValue::S(session.state.to_string()),
    );
    item.insert(
        "generation_attempts".to_string(),
        AttributeValue::N(session.generation_attempts.to_string()),
    );
    if let Some(reason) = session.failure_reason.as_ref() {
        item.insert(
            "failure_reason".to_string(),
            AttributeValue::S(reason.clone()),
        );
    }
    item.insert(
        "created_at".to_string(),
        timestamp(session.created_at),
    );
    item.insert(
        "updated_at".to_string(),
        timestamp(session.updated_at),
    );
    item
}

fn session_from_item(item: &Item) -> Result<GameSession, StoreError> {
    let raw_state = read_string(item, "session_state")?;
    let state = SessionState::parse(&raw_state)
        .ok_or_else(|| anyhow::anyhow!("unknown session_state {raw_state:?}"))?;

    Ok(GameSession {
        game_id: read_string(item, "game_id")?,
        teams: read_string_list(item, "teams")?,
        quiz_questions: read_string_list(item, "quiz_questions")?,
        state,
        generation_attempts: match item.get("generation_attempts") {
            Some(value) => value
                .as_n()
                .map_err(|_| anyhow::anyhow!("generation_attempts is not a number"))?
                .parse::<u32>()
                .context("invalid generation_attempts")?,
            None => 0,
        },
        failure_reason: item
            .get("failure_reason")
            .and_then(|value| value.as_s().ok())
            .cloned(),
        created_at: read_timestamp(item, "created_at")?,
        updated_at: read_timestamp(item, "updated_at")?,
    })
}

fn answer_to_item(answer: &QuizAnswer) -> Item {
    let mut item = HashMap::new();
    item.insert(
        "game_id".to_string(),
        AttributeValue::S(answer.game_id.clone()),
    );
    item.insert(
        "answer_id".to_string(),
        AttributeValue::S(answer.answer_id.clone()),
    );
    item.insert("team".to_string(), AttributeValue::S(answer.team.clone()));
    item.insert(
        "player_id".to_string(),
        AttributeValue::S(answer.player_id.clone()),
    );
    item.insert("answers".to_string(), string_list(&answer.answers));
    item.insert(
        "submitted_at".to_string(),
        timestamp(answer.submitted_at),
    );
    item
}

fn answer_from_item(item: &Item) -> Result<QuizAnswer, StoreError> {
    Ok(QuizAnswer {
        answer_id: read_string(item, "answer_id")?,
        game_id: read_string(item, "game_id")?,
        team: read_string(item, "team")?,
        player_id: read_string(item, "player_id")?,
        answers: read_string_list(item, "answers")?,
        submitted_at: read_timestamp(item, "submitted_at")?,
    })
}

fn read_string(item: &Item, key: &str) -> anyhow::Result<String> {
    item.get(key)
        .and_then(|value| value.as_s().ok())
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("item attribute {key} missing or not a string"))
}

fn read_string_list(item: &Item, key: &str) -> anyhow::Result<Vec<String>> {
    let Some(value) = item.get(key) else {
        return Ok(Vec::new());
    };
    let list = value
        .as_l()
        .map_err(|_| anyhow::anyhow!("item attribute {key} is not a list"))?;
    list.iter()
        .map(|entry| {
            entry
                .as_s()
                .cloned()
                .map_err(|_| anyhow::anyhow!("item attribute {key} holds a non-string entry"))
        })
        .collect()
}

fn read_timestamp(item: &Item, key: &str) -> anyhow::Result<DateTime<Utc>> {
    let raw = read_string(item, key)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|value| value.with_timezone(&Utc))
        .with_context(|| format!("invalid {key} timestamp {raw:?}"))
}
