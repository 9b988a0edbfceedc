//! Gemini API client for text generation.

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

const GEMINI_API_URL: &str =
    "https://generativelanguage.googleapis.com/v1beta/models/gemini-pro:generateContent";

pub struct GeminiClient {
    api_key: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct GenerateRequest {
    contents: Vec<Content>,
}

#[derive(Serialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Serialize)]
struct Part {
    text: String,
}

#[derive(Deserialize, Debug)]
struct GenerateResponse {
    candidates: Option<Vec<Candidate>>,
    error: Option<ApiError>,
}

#[derive(Deserialize, Debug)]
struct ApiError {
    message: String,
}

#[derive(Deserialize, Debug)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize, Debug)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize, Debug)]
struct ResponsePart {
    text: Option<String>,
}

#[derive(Debug)]
pub enum GeminiError {
    Http(String),
    Api(String),
    Parse(String),
}

impl fmt::Display for GeminiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Http(e) => write!(f, "HTTP error: {e}"),
            Self::Api(e) => write!(f, "API error: {e}"),
            Self::Parse(e) => write!(f, "Parse error: {e}"),
        }
    }
}

impl std::error::Error for GeminiError {}

impl GeminiClient {
    pub fn new(api_key: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .expect("Failed to build HTTP client");

        Self { api_key, client }
    }

    /// Generate a text response for the given prompt.
    ///
    /// A well-formed response yields its candidate text verbatim. A response
    /// that parses but carries no text part (blocked or malformed upstream)
    /// degrades to the parsed response's string representation instead of
    /// failing.
    pub async fn generate(&self, prompt: &str) -> Result<String, GeminiError> {
        let request = GenerateRequest {
            contents: vec![Content {
                parts: vec![Part {
                    text: prompt.to_string(),
                }],
            }],
        };

        let url = format!("{}?key={}", GEMINI_API_URL, self.api_key);

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| GeminiError::Http(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| GeminiError::Http(format!("failed to read response: {e}")))?;

        debug!("Gemini response status: {status}");

        if !status.is_success() {
            return Err(GeminiError::Api(format!("{status}: {body}")));
        }

        extract_text(&body)
    }
}

/// Pull the candidate text out of a response body.
fn extract_text(body: &str) -> Result<String, GeminiError> {
    let parsed: GenerateResponse =
        serde_json::from_str(body).map_err(|e| GeminiError::Parse(e.to_string()))?;

    if let Some(error) = parsed.error {
        return Err(GeminiError::Api(error.message));
    }

    let text: String = parsed
        .candidates
        .iter()
        .flatten()
        .filter_map(|c| c.content.as_ref())
        .flat_map(|content| content.parts.iter())
        .filter_map(|part| part.text.as_deref())
        .collect();

    if text.is_empty() {
        // No text part: degraded fallback rather than a failure
        Ok(format!("{parsed:?}"))
    } else {
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extracts_candidate_text_verbatim() {
        let body = r#"{
            "candidates": [
                {"content": {"parts": [{"text": "Hello from Gemini"}]}}
            ]
        }"#;
        assert_eq!(extract_text(body).unwrap(), "Hello from Gemini");
    }

    #[test]
    fn test_joins_multiple_text_parts() {
        let body = r#"{
            "candidates": [
                {"content": {"parts": [{"text": "part one, "}, {"text": "part two"}]}}
            ]
        }"#;
        assert_eq!(extract_text(body).unwrap(), "part one, part two");
    }

    #[test]
    fn test_no_text_part_falls_back_to_string_coercion() {
        let body = r#"{
            "candidates": [
                {"content": {"parts": []}}
            ]
        }"#;
        let result = extract_text(body).unwrap();
        assert!(result.starts_with("GenerateResponse"));
    }

    #[test]
    fn test_blocked_response_without_candidates_falls_back() {
        // Safety-blocked responses come back with no candidates at all
        let body = r#"{"promptFeedback": {"blockReason": "SAFETY"}}"#;
        let result = extract_text(body).unwrap();
        assert!(result.starts_with("GenerateResponse"));
    }

    #[test]
    fn test_api_error_field() {
        let body = r#"{"error": {"message": "API key not valid"}}"#;
        let err = extract_text(body).unwrap_err();
        assert!(matches!(err, GeminiError::Api(_)));
        assert!(err.to_string().contains("API key not valid"));
    }

    #[test]
    fn test_invalid_json() {
        let err = extract_text("not json").unwrap_err();
        assert!(matches!(err, GeminiError::Parse(_)));
    }
}
