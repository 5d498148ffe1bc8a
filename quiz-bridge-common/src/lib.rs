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

use std::{collections::HashSet, sync::LazyLock};

use chrono::{DateTime, Utc};
use rand::{Rng, seq::SliceRandom};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const MIN_TEAMS: usize = 2;
pub const MAX_TEAMS: usize = 4;

/// Team names and traits used when no pool is configured.
pub const DEFAULT_TEAM_POOL: [(&str, [&str; 3]); 8] = [
    ("EMBER", ["Fiery", "Passionate", "Unstoppable"]),
    ("TERRA", ["Grounded", "Steady", "Resilient"]),
    ("VEIL", ["Stealthy", "Scheming", "Mysterious"]),
    ("AERIAL", ["Free", "Inventive", "Adventurous"]),
    ("HALO", ["Bright", "Empathetic", "Unifying"]),
    ("FLUX", ["Adaptive", "Quick", "Resourceful"]),
    ("NOVA", ["Explosive", "Revolutionary", "Destructive"]),
    ("TEMPO", ["Methodical", "Precise", "Strategic"]),
];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    PendingTeams,
    Generating,
    Ready,
    Failed,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PendingTeams => "PENDING_TEAMS",
            Self::Generating => "GENERATING",
            Self::Ready => "READY",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING_TEAMS" => Some(Self::PendingTeams),
            "GENERATING" => Some(Self::Generating),
            "READY" => Some(Self::Ready),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GameSession {
    pub game_id: String,
    pub teams: Vec<String>,
    #[serde(default)]
    pub quiz_questions: Vec<String>,
    pub state: SessionState,
    #[serde(default)]
    pub generation_attempts: u32,
    #[serde(default)]
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl GameSession {
    pub fn new(game_id: impl Into<String>, teams: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            game_id: game_id.into(),
            teams,
            quiz_questions: Vec::new(),
            state: SessionState::PendingTeams,
            generation_attempts: 0,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_team(&self, team: &str) -> bool {
        self.teams.iter().any(|candidate| candidate == team)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuizAnswer {
    pub answer_id: String,
    pub game_id: String,
    pub team: String,
    pub player_id: String,
    pub answers: Vec<String>,
    pub submitted_at: DateTime<Utc>,
}

impl QuizAnswer {
    pub fn new(
        game_id: impl Into<String>,
        team: impl Into<String>,
        player_id: impl Into<String>,
        answers: Vec<String>,
    ) -> Self {
        Self {
            answer_id: Uuid::new_v4().to_string(),
            game_id: game_id.into(),
            team: team.into(),
            player_id: player_id.into(),
            answers,
            submitted_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TeamProfile {
    pub name: String,
    #[serde(default)]
    pub traits: Vec<String>,
}

/// Fixed catalog of candidate team names. Names are unique.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeamPool {
    teams: Vec<TeamProfile>,
}

impl TeamPool {
    /// Builds a pool, trimming names and dropping blanks and repeats.
    pub fn new(profiles: impl IntoIterator<Item = TeamProfile>) -> Self {
        let mut seen = HashSet::new();
        let mut teams = Vec::new();
        for profile in profiles {
            let name = profile.name.trim().to_string();
            if name.is_empty() || !seen.insert(name.clone()) {
                continue;
            }
            teams.push(TeamProfile {
                name,
                traits: profile.traits,
            });
        }
        Self { teams }
    }

    pub fn len(&self) -> usize {
        self.teams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.teams.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.teams.iter().map(|team| team.name.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.teams.iter().any(|team| team.name == name)
    }

    pub fn profile(&self, name: &str) -> Option<&TeamProfile> {
        self.teams.iter().find(|team| team.name == name)
    }

    /// Checks that the pool can serve the largest team count we ever assign.
    pub fn validate(&self) -> Result<(), TeamAssignmentError> {
        if self.len() < MAX_TEAMS {
            return Err(TeamAssignmentError::InsufficientPoolSize {
                required: MAX_TEAMS,
                available: self.len(),
            });
        }
        Ok(())
    }
}

impl Default for TeamPool {
    fn default() -> Self {
        Self::new(DEFAULT_TEAM_POOL.iter().map(|(name, traits)| TeamProfile {
            name: (*name).to_string(),
            traits: traits.iter().map(|value| (*value).to_string()).collect(),
        }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TeamAssignmentError {
    #[error("team pool has {available} distinct names but {required} are required")]
    InsufficientPoolSize { required: usize, available: usize },
}

/// Number of teams for a roster: 6-10 -> 2, 11-15 -> 3, 16+ -> 4, anything smaller -> 2.
pub fn team_count_for_players(player_count: usize) -> usize {
    match player_count {
        6..=10 => 2,
        11..=15 => 3,
        16.. => 4,
        _ => MIN_TEAMS,
    }
}

/// Smallest roster that [`team_count_for_players`] splits into `team_count` teams.
pub fn roster_size_for_team_count(team_count: usize) -> Option<usize> {
    match team_count {
        MIN_TEAMS => Some(0),
        3 => Some(11),
        MAX_TEAMS => Some(16),
        _ => None,
    }
}

/// Draws unique team names from the pool, uniformly and without replacement.
pub fn assign_teams<R>(
    pool: &TeamPool,
    player_count: usize,
    rng: &mut R,
) -> Result<Vec<String>, TeamAssignmentError>
where
    R: Rng + ?Sized,
{
    let required = team_count_for_players(player_count);
    if pool.len() < required {
        return Err(TeamAssignmentError::InsufficientPoolSize {
            required,
            available: pool.len(),
        });
    }

    let mut names: Vec<String> = pool.names().map(ToOwned::to_owned).collect();
    names.shuffle(rng);
    names.truncate(required);
    Ok(names)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TeamQuizRequest {
    pub game_id: String,
    #[serde(default)]
    pub players: Option<Vec<String>>,
    #[serde(default)]
    pub player_count: Option<usize>,
    /// Teams computed by the game client. Advisory only.
    #[serde(default)]
    pub teams: Option<Vec<String>>,
}

impl TeamQuizRequest {
    /// Roster size, preferring the explicit roster over a bare count. A
    /// request carrying only client-computed teams sizes the roster so the
    /// server draws the same number of teams.
    pub fn roster_size(&self) -> Option<usize> {
        self.players
            .as_ref()
            .map(Vec::len)
            .or(self.player_count)
            .or_else(|| {
                let teams = self.teams.as_ref()?;
                let distinct: HashSet<&str> = teams.iter().map(String::as_str).collect();
                roster_size_for_team_count(distinct.len())
            })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TeamQuizResponse {
    pub game_id: String,
    pub teams: Vec<String>,
    pub quiz_questions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionResponse {
    pub game_id: String,
    pub teams: Vec<String>,
    pub state: SessionState,
    pub quiz_questions: Vec<String>,
    pub generation_attempts: u32,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<GameSession> for SessionResponse {
    fn from(session: GameSession) -> Self {
        Self {
            game_id: session.game_id,
            teams: session.teams,
            state: session.state,
            quiz_questions: session.quiz_questions,
            generation_attempts: session.generation_attempts,
            failure_reason: session.failure_reason,
            created_at: session.created_at,
            updated_at: session.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuizAnswerRequest {
    pub game_id: String,
    pub team: String,
    pub player_id: String,
    #[serde(default)]
    pub answers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QuizAnswerResponse {
    pub accepted: bool,
    pub answer_id: String,
    pub game_id: String,
    pub team: String,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuizAnswersResponse {
    pub game_id: String,
    pub answers: Vec<QuizAnswer>,
}

static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("env var pattern is a valid regex")
});

/// Replace `${VAR_NAME}` patterns in a string with values from environment variables.
/// Unknown or unset variables are replaced with an empty string.
pub fn expand_env_vars(input: &str) -> String {
    ENV_VAR_PATTERN
        .replace_all(input, |caps: &regex::Captures| {
            let var_name = &caps[1];
            std::env::var(var_name).unwrap_or_default()
        })
        .into_owned()
}
