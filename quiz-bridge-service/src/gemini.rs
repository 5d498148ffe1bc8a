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

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, info};

use crate::{
    config::GenerationSettings,
    generator::{GenerationError, QuizModel, QuizPrompt},
};

const SAFETY_CATEGORIES: [&str; 4] = [
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
];

#[derive(Clone)]
pub struct GeminiModel {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: String,
    settings: GenerationSettings,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ContentPart>,
}

#[derive(Debug, Deserialize)]
struct ContentPart {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

impl GeminiModel {
    pub fn new(client: reqwest::Client, api_key: String, settings: &GenerationSettings) -> Self {
        Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            model: settings.model.trim_start_matches("models/").to_string(),
            api_key,
            settings: settings.clone(),
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/models/{}:generateContent", self.base_url, self.model)
    }

    fn request_body(&self, prompt: &QuizPrompt) -> serde_json::Value {
        let safety_settings: Vec<serde_json::Value> = SAFETY_CATEGORIES
            .iter()
            .map(|category| {
                serde_json::json!({
                    "category": category,
                    "threshold": "BLOCK_LOW_AND_ABOVE"
                })
            })
            .collect();

        serde_json::json!({
            "contents": [{
                "role": "user",
                "parts": [{"text": prompt.text}]
            }],
            "generationConfig": {
                "temperature": self.settings.temperature,
                "topP": self.settings.top_p,
                "topK": self.settings.top_k,
                "maxOutputTokens": self.settings.max_output_tokens,
                "responseMimeType": "application/json",
                "responseSchema": {
                    "type": "OBJECT",
                    "required": ["questions"],
                    "properties": {
                        "questions": {
                            "type": "ARRAY",
                            "description": "Personality quiz questions.",
                            "items": {"type": "STRING"}
                        }
                    }
                }
            },
            "safetySettings": safety_settings
        })
    }
}

#[async_trait]
impl QuizModel for GeminiModel {
    fn name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &QuizPrompt) -> Result<String, GenerationError> {
        let response = self
            .client
            .post(self.endpoint())
            .timeout(self.settings.attempt_timeout())
            .header("x-goog-api-key", &self.api_key)
            .json(&self.request_body(prompt))
            .send()
            .await
            .map_err(classify_send_error)?;

        let status = response.status();
        let body = response.text().await.map_err(|error| {
            GenerationError::Transient(format!("failed to read model response body: {error}"))
        })?;
        if !status.is_success() {
            return Err(classify_status(status, &body));
        }

        let text = extract_candidate_text(&body)?;
        debug!(model = %self.model, response_chars = text.chars().count(), "model responded");
        Ok(text)
    }
}

fn classify_send_error(error: reqwest::Error) -> GenerationError {
    if error.is_timeout() || error.is_connect() || error.is_request() {
        GenerationError::Transient(format!("model request failed: {error}"))
    } else {
        GenerationError::NonTransient(format!("model request could not be sent: {error}"))
    }
}

/// 408, 429 and 5xx are worth another attempt; other client errors are not.
fn classify_status(status: StatusCode, body: &str) -> GenerationError {
    let detail = format!("model returned {status}: {}", truncate(body, 300));
    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        GenerationError::Transient(detail)
    } else {
        GenerationError::NonTransient(detail)
    }
}

fn extract_candidate_text(body: &str) -> Result<String, GenerationError> {
    let parsed: GenerateContentResponse = serde_json::from_str(body).map_err(|error| {
        GenerationError::InvalidResponse(format!("undecodable model envelope: {error}"))
    })?;

    if let Some(reason) = parsed
        .prompt_feedback
        .and_then(|feedback| feedback.block_reason)
    {
        return Err(GenerationError::InvalidResponse(format!(
            "prompt blocked: {reason}"
        )));
    }

    let candidate = parsed.candidates.into_iter().next().ok_or_else(|| {
        GenerationError::InvalidResponse("model returned no candidates".to_string())
    })?;
    let text: String = candidate
        .content
        .map(|content| {
            content
                .parts
                .into_iter()
                .filter_map(|part| part.text)
                .collect()
        })
        .unwrap_or_default();

    if text.trim().is_empty() {
        return Err(GenerationError::InvalidResponse(format!(
            "candidate has no text (finish reason {})",
            candidate.finish_reason.as_deref().unwrap_or("unknown")
        )));
    }
    Ok(text)
}

fn truncate(value: &str, max_chars: usize) -> String {
    let mut chars = value.chars();
    let head: String = chars.by_ref().take(max_chars).collect();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}

const FALLBACK_QUESTIONS: [&str; 5] = [
    "What would you do if you found a secret door in your school?",
    "How do you approach solving a difficult puzzle?",
    "What's your strategy when playing a team game?",
    "What would you do with a day off from school?",
    "How do you react when something doesn't go as planned?",
];

/// Canned questions served when no model API key is configured.
pub struct FallbackQuizModel;

#[async_trait]
impl QuizModel for FallbackQuizModel {
    fn name(&self) -> &str {
        "fallback"
    }

    async fn complete(&self, prompt: &QuizPrompt) -> Result<String, GenerationError> {
        let count = prompt.question_count.clamp(1, FALLBACK_QUESTIONS.len());
        info!(teams = ?prompt.teams, count, "serving fallback quiz questions");
        Ok(serde_json::json!({ "questions": &FALLBACK_QUESTIONS[..count] }).to_string())
    }
}
