use reqwest::{header, Client, Url};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::models::{ChatMessage, MessageRole};

const GEMINI_ENDPOINT: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const MAX_OUTPUT_TOKENS: u32 = 2048;
const TEMPERATURE: f32 = 0.7;

const SYSTEM_PROMPT: &str = "You are EVE, an AI assistant for insurance agents. You help with:
- Analyzing insurance documents and quotes
- Comparing coverage options
- Explaining policy terms in English and Chinese (Mandarin)
- Answering questions about insurance regulations
- Helping with client communications
- Generating renewal reminders and policy summaries

Always be professional, accurate, and helpful. When discussing insurance terms, provide clear explanations. If asked in Chinese, respond in Chinese. If the user switches languages, match their language.

Important guidelines:
- Never provide specific legal or tax advice - recommend consulting professionals
- Be cautious with premium estimates - actual rates depend on many factors
- Protect client privacy - never share client information externally
- For complex claims or disputes, recommend escalating to supervisors";

#[derive(Debug, thiserror::Error)]
pub enum AssistantError {
    #[error("AI request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("AI endpoint rejected the request with status {0}")]
    Upstream(reqwest::StatusCode),
    #[error("AI response contained no text")]
    EmptyResponse,
    #[error("invalid AI endpoint: {0}")]
    Endpoint(#[from] url::ParseError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub text: String,
    pub tokens_used: Option<i32>,
}

/// Chat backend for the EVE assistant. Without an API key it answers with a
/// fixed demo reply instead of calling out.
#[derive(Clone)]
pub struct Assistant {
    client: Client,
    api_key: Option<String>,
    model: String,
}

#[derive(Serialize)]
struct Content<'a> {
    role: &'static str,
    parts: [Part<'a>; 1],
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    total_token_count: Option<i32>,
}

impl Assistant {
    pub fn new(api_key: Option<String>, model: String) -> Self {
        Self {
            client: Client::new(),
            api_key,
            model,
        }
    }

    pub fn is_demo(&self) -> bool {
        self.api_key.is_none()
    }

    /// Answers `message` given the prior conversation. `history` must already
    /// contain the stored user message as its last entry.
    pub async fn reply(
        &self,
        history: &[ChatMessage],
        message: &str,
    ) -> Result<Reply, AssistantError> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Ok(Reply {
                text: demo_reply(message),
                tokens_used: None,
            });
        };

        let url = Url::parse(&format!(
            "{GEMINI_ENDPOINT}/{}:generateContent",
            self.model
        ))?;
        let body = json!({
            "systemInstruction": { "parts": [{ "text": SYSTEM_PROMPT }] },
            "contents": build_contents(history),
            "generationConfig": {
                "maxOutputTokens": MAX_OUTPUT_TOKENS,
                "temperature": TEMPERATURE,
            },
        });

        let response = self
            .client
            .post(url)
            .header(header::USER_AGENT, "agencyhub-api")
            .header("x-goog-api-key", api_key)
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            warn!(status = %response.status(), model = %self.model, "AI request rejected");
            return Err(AssistantError::Upstream(response.status()));
        }

        let payload: GenerateResponse = response.json().await?;
        let reply = extract_reply(payload)?;
        info!(model = %self.model, tokens = ?reply.tokens_used, "AI reply generated");
        Ok(reply)
    }
}

fn build_contents(history: &[ChatMessage]) -> Vec<Content<'_>> {
    history
        .iter()
        .map(|message| Content {
            role: match message.role {
                MessageRole::User => "user",
                MessageRole::Assistant => "model",
            },
            parts: [Part {
                text: &message.content,
            }],
        })
        .collect()
}

fn extract_reply(payload: GenerateResponse) -> Result<Reply, AssistantError> {
    let text: String = payload
        .candidates
        .into_iter()
        .next()
        .and_then(|candidate| candidate.content)
        .map(|content| {
            content
                .parts
                .into_iter()
                .filter_map(|part| part.text)
                .collect()
        })
        .unwrap_or_default();
    if text.trim().is_empty() {
        return Err(AssistantError::EmptyResponse);
    }
    Ok(Reply {
        text,
        tokens_used: payload
            .usage_metadata
            .and_then(|usage| usage.total_token_count),
    })
}

fn demo_reply(message: &str) -> String {
    format!(
        "I'm EVE, your AI insurance assistant.

Currently running in demo mode (API key not configured).

In production, I can help you with:
- Analyzing insurance quotes and documents
- Comparing coverage options
- Explaining policy terms in English or Chinese
- Generating client communications

Your message: \"{message}\"

To enable full AI capabilities, add GEMINI_API_KEY to your environment variables."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn message(role: MessageRole, content: &str) -> ChatMessage {
        ChatMessage {
            id: Uuid::new_v4(),
            role,
            content: content.to_string(),
            tokens_used: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn demo_mode_echoes_the_message() {
        let assistant = Assistant::new(None, "gemini-2.5-flash".into());
        assert!(assistant.is_demo());

        let reply = assistant
            .reply(&[message(MessageRole::User, "What is a dec page?")], "What is a dec page?")
            .await
            .unwrap();
        assert!(reply.text.contains("demo mode"));
        assert!(reply.text.contains("Your message: \"What is a dec page?\""));
        assert_eq!(reply.tokens_used, None);
    }

    #[test]
    fn history_maps_assistant_turns_to_model() {
        let history = vec![
            message(MessageRole::User, "hi"),
            message(MessageRole::Assistant, "hello"),
            message(MessageRole::User, "quote?"),
        ];
        let contents = serde_json::to_value(build_contents(&history)).unwrap();
        assert_eq!(
            contents,
            json!([
                { "role": "user", "parts": [{ "text": "hi" }] },
                { "role": "model", "parts": [{ "text": "hello" }] },
                { "role": "user", "parts": [{ "text": "quote?" }] },
            ])
        );
    }

    #[test]
    fn reply_joins_parts_and_reads_usage() {
        let payload: GenerateResponse = serde_json::from_value(json!({
            "candidates": [{ "content": { "parts": [{ "text": "Umbrella " }, { "text": "coverage." }] } }],
            "usageMetadata": { "totalTokenCount": 42 }
        }))
        .unwrap();
        assert_eq!(
            extract_reply(payload).unwrap(),
            Reply {
                text: "Umbrella coverage.".into(),
                tokens_used: Some(42),
            }
        );
    }

    #[test]
    fn blank_candidates_are_an_error() {
        let payload: GenerateResponse = serde_json::from_value(json!({ "candidates": [] })).unwrap();
        assert!(matches!(
            extract_reply(payload),
            Err(AssistantError::EmptyResponse)
        ));
    }
}
