mod caption;
mod comfy;
mod gemini;
mod listener;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use mangapanel_contracts::errors::{Stage, WorkflowError};
use mangapanel_contracts::events::{payload_of, EventPayload, EventWriter};
use mangapanel_contracts::reply::GenerationResult;
use mangapanel_contracts::settings::PanelSettings;
use mangapanel_contracts::template::{JobTemplate, PromptOverrides};
use serde_json::json;
use uuid::Uuid;

pub use caption::{generate_overlay, inline_image_for};
pub use comfy::{ArtifactRef, ComfyClient, JobHandle, PanelArtifact};
pub use gemini::{GeminiClient, InlineImage, DEFAULT_API_BASE};
pub use listener::{wait_for_completion, JobCorrelator, ListenOutcome, Observation};

/// Everything a host needs to present one finished panel.
#[derive(Debug)]
pub struct PanelOutcome {
    pub workflow_id: String,
    pub parameters: GenerationResult,
    pub job_id: String,
    pub artifact: PanelArtifact,
    pub overlay: Option<String>,
    pub notices: Vec<String>,
}

/// Terminal state of one workflow run. Cancellation is not an error: the
/// wait is abandoned and nothing is presented.
#[derive(Debug)]
pub enum RunOutcome {
    Completed(Box<PanelOutcome>),
    Cancelled,
}

/// One chat-message-to-panel run.
///
/// The workflow owns a settings snapshot taken at construction; a settings
/// save while a run is in flight cannot affect it. All correlation state is
/// request-scoped. Stage results are emitted as events for whatever host is
/// watching; failures abort the run except in the captioning stage, which
/// degrades to a notice.
pub struct PanelWorkflow {
    settings: PanelSettings,
    events: Option<EventWriter>,
    cancel: Arc<AtomicBool>,
    workflow_id: String,
}

impl PanelWorkflow {
    pub fn new(settings: PanelSettings) -> Self {
        Self {
            settings,
            events: None,
            cancel: Arc::new(AtomicBool::new(false)),
            workflow_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.events = Some(events);
        self
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// Flag observed between stages and inside the listen loop. Setting it
    /// abandons the run silently.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn run(&self, message: &str, template: &JobTemplate) -> Result<RunOutcome, WorkflowError> {
        let settings = &self.settings;
        let http_timeout = Duration::from_secs(settings.http_timeout_secs);
        let gemini = GeminiClient::new(settings.gemini_model.clone(), http_timeout);
        let comfy = ComfyClient::new(settings.comfyui_url.clone(), http_timeout);
        let mut notices = Vec::new();

        self.emit(
            "workflow_started",
            payload_of([
                ("message_chars", json!(message.chars().count())),
                ("comfyui_url", json!(settings.comfyui_url)),
            ]),
        );

        let reference_image = self.load_reference_image(&mut notices);
        let parameters = self.stage(gemini.generate_parameters(
            &settings.gemini_api_key,
            message,
            reference_image.as_ref(),
        ))?;
        self.emit(
            "parameters_generated",
            payload_of([
                ("positive_prompt", json!(parameters.positive_prompt)),
                ("negative_prompt", json!(parameters.negative_prompt)),
                ("noise_seed", json!(parameters.noise_seed)),
                ("width", json!(parameters.width)),
                ("height", json!(parameters.height)),
            ]),
        );

        let overrides = PromptOverrides::from_generation(&parameters, settings.fixed_seed);
        let handle = self.stage(comfy.submit_job(template, &overrides, &settings.nodes))?;
        self.emit(
            "job_submitted",
            payload_of([
                ("job_id", json!(handle.job_id)),
                ("seed", json!(overrides.noise_seed)),
            ]),
        );

        let listen_timeout = Duration::from_secs(settings.listen_timeout_secs);
        let outcome = self.stage(wait_for_completion(
            &comfy,
            &handle,
            listen_timeout,
            &self.cancel,
        ))?;
        let reference = match outcome {
            ListenOutcome::Completed(reference) => reference,
            ListenOutcome::TimedOut => {
                return Err(self.fail(WorkflowError::NoCompletion {
                    waited_secs: settings.listen_timeout_secs,
                }))
            }
            ListenOutcome::Cancelled => {
                self.emit("workflow_cancelled", EventPayload::new());
                return Ok(RunOutcome::Cancelled);
            }
        };

        let artifact = self.stage(comfy.fetch_artifact(&reference))?;
        self.emit(
            "artifact_ready",
            payload_of([
                ("url", json!(artifact.reference.url)),
                ("filename", json!(artifact.reference.filename)),
                ("width", json!(artifact.width)),
                ("height", json!(artifact.height)),
            ]),
        );

        // Captioning is best effort: the panel is already produced, so a
        // failure here must not take it down.
        let overlay = match generate_overlay(&gemini, &settings.gemini_api_key, &artifact, message)
        {
            Ok(markup) => {
                self.emit(
                    "caption_ready",
                    payload_of([("overlay_chars", json!(markup.chars().count()))]),
                );
                Some(markup)
            }
            Err(err) => {
                self.emit(
                    "caption_skipped",
                    payload_of([("code", json!(err.code())), ("error", json!(err.to_string()))]),
                );
                push_unique_notice(&mut notices, format!("captions skipped: {err}"));
                None
            }
        };

        self.emit(
            "workflow_completed",
            payload_of([("job_id", json!(handle.job_id))]),
        );

        Ok(RunOutcome::Completed(Box::new(PanelOutcome {
            workflow_id: self.workflow_id.clone(),
            parameters,
            job_id: handle.job_id,
            artifact,
            overlay,
            notices,
        })))
    }

    /// Optional character reference for parameter generation. A fetch
    /// failure downgrades to a notice; the run continues without it.
    fn load_reference_image(&self, notices: &mut Vec<String>) -> Option<InlineImage> {
        let url = self.settings.reference_image_url.as_deref()?;
        let timeout = Duration::from_secs(self.settings.http_timeout_secs);
        match fetch_inline_image(url, timeout) {
            Ok(image) => Some(image),
            Err(err) => {
                push_unique_notice(
                    notices,
                    format!("reference image unavailable ({url}): {err}"),
                );
                None
            }
        }
    }

    fn stage<T>(&self, result: Result<T, WorkflowError>) -> Result<T, WorkflowError> {
        result.map_err(|err| self.fail(err))
    }

    fn fail(&self, err: WorkflowError) -> WorkflowError {
        self.emit(
            "workflow_failed",
            payload_of([
                ("stage", json!(err.stage().as_str())),
                ("code", json!(err.code())),
                ("error", json!(err.to_string())),
            ]),
        );
        err
    }

    fn emit(&self, event_type: &str, payload: EventPayload) {
        if let Some(events) = &self.events {
            let _ = events.emit(event_type, payload);
        }
    }
}

/// Download an image over HTTP for use as an inline attachment.
pub fn fetch_inline_image(url: &str, timeout: Duration) -> Result<InlineImage, WorkflowError> {
    let client = reqwest::blocking::Client::new();
    let response = client
        .get(url)
        .timeout(timeout)
        .send()
        .map_err(|err| WorkflowError::transport(Stage::Parameters, err))?;
    if !response.status().is_success() {
        let status = response.status().as_u16();
        let body = response.text().unwrap_or_default();
        return Err(WorkflowError::upstream(Stage::Parameters, status, body));
    }
    let mime_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .filter(|value| value.starts_with("image/"))
        .unwrap_or("image/png")
        .to_string();
    let bytes = response
        .bytes()
        .map_err(|err| WorkflowError::transport(Stage::Parameters, err))?
        .to_vec();
    Ok(InlineImage::new(bytes, mime_type))
}

pub fn push_unique_notice(notices: &mut Vec<String>, message: String) {
    if message.trim().is_empty() {
        return;
    }
    if notices.iter().any(|existing| existing == &message) {
        return;
    }
    notices.push(message);
}

#[cfg(test)]
mod tests {
    use mangapanel_contracts::settings::NodeBindings;
    use serde_json::json;

    use super::*;

    #[test]
    fn notices_do_not_repeat() {
        let mut notices = Vec::new();
        push_unique_notice(&mut notices, "captions skipped: 500".to_string());
        push_unique_notice(&mut notices, "captions skipped: 500".to_string());
        push_unique_notice(&mut notices, "   ".to_string());
        assert_eq!(notices, vec!["captions skipped: 500".to_string()]);
    }

    #[test]
    fn workflow_ids_are_unique_per_run() {
        let a = PanelWorkflow::new(PanelSettings::default());
        let b = PanelWorkflow::new(PanelSettings::default());
        assert_ne!(a.workflow_id(), b.workflow_id());
    }

    // The full "a hero lands" path, minus live sockets: parse the generated
    // parameters, resolve the seed, merge, correlate the completion and
    // build the artifact address.
    #[test]
    fn message_to_artifact_url_end_to_end() {
        let reply = "```json\n{\"positive_prompt\":\"heroic landing, dynamic pose\",\
\"negative_prompt\":\"blurry\",\"noise_seed\":42,\"width\":512,\"height\":768}\n```";
        let parameters = GenerationResult::from_reply_text(reply).expect("parameters");

        let template = JobTemplate::from_value(json!({
            "6": {"inputs": {"text": "placeholder"}},
            "25": {"inputs": {"noise_seed": 0}},
            "27": {"inputs": {"width": 64, "height": 64}},
            "42": {"inputs": {"text": "placeholder"}},
            "99": {"inputs": {"unrelated": true}},
        }))
        .expect("template");
        let overrides = PromptOverrides::from_generation(&parameters, None);
        let merged = template.merged_with(&overrides, &NodeBindings::default());
        assert_eq!(
            merged.nodes["6"]["inputs"]["text"],
            json!("heroic landing, dynamic pose")
        );
        assert_eq!(merged.nodes["42"]["inputs"]["text"], json!("blurry"));
        assert_eq!(merged.nodes["25"]["inputs"]["noise_seed"], json!(42));
        assert_eq!(merged.nodes["27"]["inputs"]["width"], json!(512));
        assert_eq!(merged.nodes["27"]["inputs"]["height"], json!(768));
        assert_eq!(merged.nodes["99"], template.nodes["99"]);

        let mut correlator = JobCorrelator::new("job-1");
        assert_eq!(
            correlator.observe(
                &json!({"type": "executed", "data": {"prompt_id": "job-2",
                    "output": {"images": [{"filename": "foreign.png"}]}}})
                .to_string()
            ),
            Observation::Ignored
        );
        let observation = correlator.observe(
            &json!({"type": "executed", "data": {"prompt_id": "job-1",
                "output": {"images": [{"filename": "out.png"}]}}})
            .to_string(),
        );
        let Observation::Completed(filenames) = observation else {
            panic!("expected completion");
        };

        let comfy = ComfyClient::new("http://127.0.0.1:8188", Duration::from_secs(5));
        let reference = comfy.artifact_url(&filenames[0]);
        assert_eq!(reference.url, "http://127.0.0.1:8188/view?filename=out.png");
    }
}
