use std::env;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use mangapanel_contracts::errors::{Stage, WorkflowError};
use mangapanel_contracts::reply::{reply_html, GenerationResult};
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Value};

pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Image bytes attached to a text-generation request as an inline part.
#[derive(Debug, Clone)]
pub struct InlineImage {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

impl InlineImage {
    pub fn new(bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self {
            bytes,
            mime_type: mime_type.into(),
        }
    }

    pub fn to_part(&self) -> Value {
        json!({
            "inlineData": {
                "mimeType": self.mime_type,
                "data": BASE64.encode(&self.bytes),
            }
        })
    }
}

/// Client for the Gemini `generateContent` endpoint.
///
/// Two operations share one transport: `generate_parameters` expects a JSON
/// reply and `generate_caption_markup` expects an HTML fragment. Neither
/// retries; every failure maps onto the workflow taxonomy and is surfaced to
/// the caller.
pub struct GeminiClient {
    api_base: String,
    model: String,
    http: HttpClient,
    timeout: Duration,
}

impl GeminiClient {
    pub fn new(model: impl Into<String>, timeout: Duration) -> Self {
        let api_base = env::var("GEMINI_API_BASE")
            .ok()
            .map(|value| value.trim().trim_end_matches('/').to_string())
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        Self::with_api_base(api_base, model, timeout)
    }

    pub fn with_api_base(
        api_base: impl Into<String>,
        model: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            api_base: api_base.into().trim_end_matches('/').to_string(),
            model: model.into(),
            http: HttpClient::new(),
            timeout,
        }
    }

    fn endpoint(&self) -> String {
        let trimmed = self.model.trim();
        let model_path = if trimmed.starts_with("models/") {
            trimmed.to_string()
        } else {
            format!("models/{trimmed}")
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }

    /// Derive image-generation parameters from the triggering chat message,
    /// optionally grounded on a character reference image.
    pub fn generate_parameters(
        &self,
        api_key: &str,
        message: &str,
        reference_image: Option<&InlineImage>,
    ) -> Result<GenerationResult, WorkflowError> {
        let mut parts = Vec::new();
        if let Some(image) = reference_image {
            parts.push(image.to_part());
        }
        parts.push(json!({ "text": parameter_instruction(message) }));
        let text = self.generate_content(Stage::Parameters, api_key, parts)?;
        GenerationResult::from_reply_text(&text)
    }

    /// Produce caption overlay markup for a finished panel image.
    pub fn generate_caption_markup(
        &self,
        api_key: &str,
        message: &str,
        image: &InlineImage,
    ) -> Result<String, WorkflowError> {
        let parts = vec![
            json!({ "text": caption_instruction(message) }),
            image.to_part(),
        ];
        let text = self.generate_content(Stage::Caption, api_key, parts)?;
        Ok(reply_html(&text))
    }

    fn generate_content(
        &self,
        stage: Stage,
        api_key: &str,
        parts: Vec<Value>,
    ) -> Result<String, WorkflowError> {
        if api_key.trim().is_empty() {
            return Err(WorkflowError::auth(
                stage,
                "Gemini API key is not configured; set gemini_api_key in the settings",
            ));
        }

        let payload = json!({
            "contents": [{
                "role": "user",
                "parts": parts,
            }],
        });
        let response = self
            .http
            .post(self.endpoint())
            .query(&[("key", api_key)])
            .timeout(self.timeout)
            .json(&payload)
            .send()
            .map_err(|err| WorkflowError::transport(stage, err))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().unwrap_or_default();
            return Err(WorkflowError::upstream(stage, status, body));
        }

        let value: Value = response
            .json()
            .map_err(|err| WorkflowError::malformed(stage, format!("reply is not JSON: {err}")))?;
        extract_reply_text(stage, &value)
    }
}

/// Pull the reply text out of `candidates[0].content.parts[0].text`.
pub(crate) fn extract_reply_text(stage: Stage, value: &Value) -> Result<String, WorkflowError> {
    let text = value
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|candidates| candidates.first())
        .and_then(|candidate| candidate.get("content"))
        .and_then(|content| content.get("parts"))
        .and_then(Value::as_array)
        .and_then(|parts| parts.first())
        .and_then(|part| part.get("text"))
        .and_then(Value::as_str);
    match text {
        Some(text) if !text.trim().is_empty() => Ok(text.to_string()),
        _ => Err(WorkflowError::malformed(
            stage,
            "reply carries no candidates[0].content.parts[0].text",
        )),
    }
}

fn parameter_instruction(message: &str) -> String {
    format!(
        "Based on the following chat message, generate the parameters for a manga panel \
rendering workflow. The parameters needed are: positive_prompt, negative_prompt, noise_seed, \
width, and height.

Message: \"{message}\"

Return the parameters in JSON format. For example:
{{
  \"positive_prompt\": \"a beautiful manga character\",
  \"negative_prompt\": \"blurry, ugly, deformed\",
  \"noise_seed\": 123456789012345,
  \"width\": 512,
  \"height\": 768
}}"
    )
}

fn caption_instruction(message: &str) -> String {
    format!(
        "Add manga-style chat bubbles with text to the attached image, based on this \
message: \"{message}\". Return the response as an HTML snippet with absolutely positioned \
divs for the bubbles. For example: <div class='mangapanel-bubble' style='top: 10px; \
left: 20px;'>Hello!</div>"
    )
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const SHORT_TIMEOUT: Duration = Duration::from_secs(5);

    fn reply_with_text(text: &str) -> String {
        json!({
            "candidates": [{
                "content": {
                    "parts": [{ "text": text }],
                },
            }],
        })
        .to_string()
    }

    #[test]
    fn endpoint_prefixes_bare_model_names() {
        let client = GeminiClient::with_api_base("https://api.test/v1beta", "gemini-1.5-pro", SHORT_TIMEOUT);
        assert_eq!(
            client.endpoint(),
            "https://api.test/v1beta/models/gemini-1.5-pro:generateContent"
        );

        let client =
            GeminiClient::with_api_base("https://api.test/v1beta/", "models/custom", SHORT_TIMEOUT);
        assert_eq!(
            client.endpoint(),
            "https://api.test/v1beta/models/custom:generateContent"
        );
    }

    #[test]
    fn missing_api_key_fails_before_any_request() {
        // unroutable base: a network attempt would error differently
        let client = GeminiClient::with_api_base("http://127.0.0.1:1", "gemini-1.5-pro", SHORT_TIMEOUT);
        let err = client
            .generate_parameters("   ", "a hero lands", None)
            .unwrap_err();
        assert_eq!(err.code(), "auth_configuration");
        assert_eq!(err.stage(), Stage::Parameters);
    }

    #[test]
    fn generate_parameters_parses_fenced_reply() {
        let mut server = mockito::Server::new();
        let reply = reply_with_text(
            "```json\n{\"positive_prompt\": \"heroic landing, dynamic pose\", \
\"negative_prompt\": \"blurry\", \"noise_seed\": 42, \"width\": 512, \"height\": 768}\n```",
        );
        let mock = server
            .mock("POST", "/models/gemini-1.5-pro:generateContent")
            .match_query(mockito::Matcher::UrlEncoded(
                "key".to_string(),
                "test-key".to_string(),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(reply)
            .create();

        let client = GeminiClient::with_api_base(server.url(), "gemini-1.5-pro", SHORT_TIMEOUT);
        let result = client
            .generate_parameters("test-key", "a hero lands", None)
            .expect("parameters");
        assert_eq!(result.positive_prompt, "heroic landing, dynamic pose");
        assert_eq!(result.noise_seed, Some(42));
        mock.assert();
    }

    #[test]
    fn upstream_failure_is_not_retried() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/models/gemini-1.5-pro:generateContent")
            .match_query(mockito::Matcher::Any)
            .with_status(500)
            .with_body("backend exploded")
            .expect(1)
            .create();

        let client = GeminiClient::with_api_base(server.url(), "gemini-1.5-pro", SHORT_TIMEOUT);
        let err = client
            .generate_parameters("test-key", "a hero lands", None)
            .unwrap_err();
        let WorkflowError::UpstreamStatus { status, body, .. } = &err else {
            panic!("expected UpstreamStatus, got {err:?}");
        };
        assert_eq!(*status, 500);
        assert!(body.contains("backend exploded"));
        mock.assert();
    }

    #[test]
    fn reply_without_candidates_is_malformed() {
        let mut server = mockito::Server::new();
        server
            .mock("POST", "/models/gemini-1.5-pro:generateContent")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"promptFeedback": {"blockReason": "SAFETY"}}"#)
            .create();

        let client = GeminiClient::with_api_base(server.url(), "gemini-1.5-pro", SHORT_TIMEOUT);
        let err = client
            .generate_parameters("test-key", "a hero lands", None)
            .unwrap_err();
        assert_eq!(err.code(), "malformed_reply");
    }

    #[test]
    fn caption_markup_passes_html_through() {
        let markup = "<div class='mangapanel-bubble' style='top: 4px; left: 8px;'>Yo!</div>";
        let mut server = mockito::Server::new();
        server
            .mock("POST", "/models/gemini-1.5-pro:generateContent")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(reply_with_text(markup))
            .create();

        let client = GeminiClient::with_api_base(server.url(), "gemini-1.5-pro", SHORT_TIMEOUT);
        let image = InlineImage::new(vec![1, 2, 3], "image/png");
        let overlay = client
            .generate_caption_markup("test-key", "a hero lands", &image)
            .expect("caption");
        assert_eq!(overlay, markup);
    }

    #[test]
    fn inline_image_parts_are_base64_payloads() {
        let image = InlineImage::new(vec![0xde, 0xad, 0xbe, 0xef], "image/png");
        let part = image.to_part();
        assert_eq!(part["inlineData"]["mimeType"], json!("image/png"));
        assert_eq!(part["inlineData"]["data"], json!("3q2+7w=="));
    }

    #[test]
    fn extract_reply_text_rejects_empty_text() {
        let value = json!({
            "candidates": [{"content": {"parts": [{"text": "  "}]}}],
        });
        let err = extract_reply_text(Stage::Caption, &value).unwrap_err();
        assert_eq!(err.stage(), Stage::Caption);
    }

    #[test]
    fn instructions_embed_the_message() {
        let instruction = parameter_instruction("a hero lands");
        assert!(instruction.contains("\"a hero lands\""));
        assert!(instruction.contains("positive_prompt"));
        let instruction = caption_instruction("a hero lands");
        assert!(instruction.contains("\"a hero lands\""));
        assert!(instruction.contains("mangapanel-bubble"));
    }
}
