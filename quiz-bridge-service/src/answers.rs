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

use quiz_bridge_common::{QuizAnswer, QuizAnswerRequest, QuizAnswerResponse, QuizAnswersResponse};
use tracing::info;

use crate::{
    orchestrator::{OrchestratorError, require_identifier},
    store::SessionStore,
};

pub async fn submit_answer(
    store: &dyn SessionStore,
    request: QuizAnswerRequest,
) -> Result<QuizAnswerResponse, OrchestratorError> {
    let game_id = require_identifier("game_id", &request.game_id)?;
    let team = require_identifier("team", &request.team)?;
    let player_id = require_identifier("player_id", &request.player_id)?;

    let answer = QuizAnswer::new(game_id, team, player_id, request.answers);
    store.record_answer(&answer).await?;
    info!(
        game_id = %answer.game_id,
        team = %answer.team,
        player_id = %answer.player_id,
        answer_count = answer.answers.len(),
        "recorded quiz answer"
    );

    Ok(QuizAnswerResponse {
        accepted: true,
        answer_id: answer.answer_id,
        game_id: answer.game_id,
        team: answer.team,
        submitted_at: answer.submitted_at,
    })
}

pub async fn list_answers(
    store: &dyn SessionStore,
    game_id: &str,
) -> Result<QuizAnswersResponse, OrchestratorError> {
    let game_id = require_identifier("game_id", game_id)?;
    let answers = store.list_answers(game_id).await?;
    Ok(QuizAnswersResponse {
        game_id: game_id.to_string(),
        answers,
    })
}
