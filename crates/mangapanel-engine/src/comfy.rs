use std::time::Duration;

use mangapanel_contracts::errors::{Stage, WorkflowError};
use mangapanel_contracts::settings::NodeBindings;
use mangapanel_contracts::template::{JobTemplate, PromptOverrides};
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Value};
use uuid::Uuid;

/// Correlation key handed back by the rendering server when it accepts a
/// submission. Used exactly once, by the completion listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub job_id: String,
}

/// Address of a produced image on the rendering server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRef {
    pub url: String,
    pub filename: String,
}

/// A downloaded panel image plus what could be probed about it.
#[derive(Debug, Clone)]
pub struct PanelArtifact {
    pub reference: ArtifactRef,
    pub bytes: Vec<u8>,
    pub mime_type: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl PanelArtifact {
    /// File extension for persisting the artifact, from the probed format
    /// when available.
    pub fn extension(&self) -> &'static str {
        match image::guess_format(&self.bytes) {
            Ok(format) => format.extensions_str().first().copied().unwrap_or("png"),
            Err(_) => "png",
        }
    }
}

/// Client for a ComfyUI-style rendering server: job submission over HTTP,
/// artifact retrieval over HTTP, completion notifications over WebSocket
/// (see the listener).
pub struct ComfyClient {
    base_url: String,
    client_id: String,
    http: HttpClient,
    timeout: Duration,
}

impl ComfyClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client_id: Uuid::new_v4().to_string(),
            http: HttpClient::new(),
            timeout,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Merge the overrides into a copy of the template and submit it.
    /// Returns the server-assigned job id.
    pub fn submit_job(
        &self,
        template: &JobTemplate,
        overrides: &PromptOverrides,
        bindings: &NodeBindings,
    ) -> Result<JobHandle, WorkflowError> {
        let merged = template.merged_with(overrides, bindings);
        let payload = json!({
            "prompt": merged.to_value(),
            "client_id": self.client_id,
        });

        let response = self
            .http
            .post(format!("{}/prompt", self.base_url))
            .timeout(self.timeout)
            .json(&payload)
            .send()
            .map_err(|err| WorkflowError::transport(Stage::Submission, err))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().unwrap_or_default();
            return Err(WorkflowError::upstream(Stage::Submission, status, body));
        }

        let body = response
            .text()
            .map_err(|err| WorkflowError::transport(Stage::Submission, err))?;
        let value: Value = serde_json::from_str(&body)
            .map_err(|_| WorkflowError::missing_job_id(&body))?;
        let job_id = value
            .get("prompt_id")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|id| !id.is_empty());
        match job_id {
            Some(job_id) => Ok(JobHandle {
                job_id: job_id.to_string(),
            }),
            None => Err(WorkflowError::missing_job_id(&body)),
        }
    }

    /// Address of a produced image, `{base}/view?filename={filename}`.
    pub fn artifact_url(&self, filename: &str) -> ArtifactRef {
        let url = match reqwest::Url::parse(&format!("{}/view", self.base_url)) {
            Ok(mut url) => {
                url.query_pairs_mut().append_pair("filename", filename);
                url.to_string()
            }
            Err(_) => format!("{}/view?filename={filename}", self.base_url),
        };
        ArtifactRef {
            url,
            filename: filename.to_string(),
        }
    }

    /// Download an artifact and probe its dimensions and format.
    pub fn fetch_artifact(&self, reference: &ArtifactRef) -> Result<PanelArtifact, WorkflowError> {
        let response = self
            .http
            .get(&reference.url)
            .timeout(self.timeout)
            .send()
            .map_err(|err| WorkflowError::transport(Stage::ArtifactFetch, err))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().unwrap_or_default();
            return Err(WorkflowError::upstream(Stage::ArtifactFetch, status, body));
        }

        let mime_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let bytes = response
            .bytes()
            .map_err(|err| WorkflowError::transport(Stage::ArtifactFetch, err))?
            .to_vec();

        let (width, height) = match image::load_from_memory(&bytes) {
            Ok(decoded) => (Some(decoded.width()), Some(decoded.height())),
            Err(_) => (None, None),
        };

        Ok(PanelArtifact {
            reference: reference.clone(),
            bytes,
            mime_type,
            width,
            height,
        })
    }

    /// Notification feed address: the base with its scheme swapped to
    /// ws/wss, path `/ws`, scoped to this client id.
    pub fn ws_url(&self) -> String {
        if let Ok(mut url) = reqwest::Url::parse(&self.base_url) {
            let scheme = match url.scheme() {
                "https" => "wss",
                "http" => "ws",
                other => other,
            }
            .to_string();
            let _ = url.set_scheme(&scheme);
            url.set_path("/ws");
            url.query_pairs_mut().append_pair("clientId", &self.client_id);
            return url.to_string();
        }
        format!(
            "{}/ws?clientId={}",
            self.base_url.replacen("http", "ws", 1),
            self.client_id
        )
    }
}
