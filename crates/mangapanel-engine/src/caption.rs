use mangapanel_contracts::errors::WorkflowError;

use crate::comfy::PanelArtifact;
use crate::gemini::{GeminiClient, InlineImage};

/// Ask the text model for caption overlay markup for a finished panel.
///
/// Captioning is best effort: the caller treats any error here as a notice
/// and keeps the already-produced artifact. This function itself stays
/// plain; the isolation policy lives in the workflow.
pub fn generate_overlay(
    gemini: &GeminiClient,
    api_key: &str,
    artifact: &PanelArtifact,
    message: &str,
) -> Result<String, WorkflowError> {
    let image = inline_image_for(artifact);
    gemini.generate_caption_markup(api_key, message, &image)
}

/// Package the artifact bytes as an inline attachment. Falls back to
/// `image/png` when the server did not declare a content type.
pub fn inline_image_for(artifact: &PanelArtifact) -> InlineImage {
    let mime_type = artifact
        .mime_type
        .clone()
        .filter(|mime| mime.starts_with("image/"))
        .unwrap_or_else(|| "image/png".to_string());
    InlineImage::new(artifact.bytes.clone(), mime_type)
}
