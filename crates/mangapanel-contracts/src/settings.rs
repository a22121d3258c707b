use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_COMFYUI_URL: &str = "http://127.0.0.1:8188";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-1.5-pro";
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_LISTEN_TIMEOUT_SECS: u64 = 300;

/// Node ids of the rendering template that the workflow overrides.
///
/// These bindings are deployment configuration, not protocol: a different
/// template wires its prompt/seed/dimension inputs to different node ids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeBindings {
    pub positive_text: String,
    pub negative_text: String,
    pub seed: String,
    pub dimensions: String,
}

impl Default for NodeBindings {
    fn default() -> Self {
        Self {
            positive_text: "6".to_string(),
            negative_text: "42".to_string(),
            seed: "25".to_string(),
            dimensions: "27".to_string(),
        }
    }
}

/// User-facing configuration for the panel pipeline.
///
/// Loaded from a JSON document; keys absent from the saved file fall back to
/// the defaults below, so older settings files keep working as fields are
/// added.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PanelSettings {
    pub comfyui_url: String,
    pub gemini_api_key: String,
    pub gemini_model: String,
    pub fixed_seed: Option<u64>,
    pub reference_image_url: Option<String>,
    pub template_path: Option<PathBuf>,
    pub http_timeout_secs: u64,
    pub listen_timeout_secs: u64,
    pub nodes: NodeBindings,
}

impl Default for PanelSettings {
    fn default() -> Self {
        Self {
            comfyui_url: DEFAULT_COMFYUI_URL.to_string(),
            gemini_api_key: String::new(),
            gemini_model: DEFAULT_GEMINI_MODEL.to_string(),
            fixed_seed: None,
            reference_image_url: None,
            template_path: None,
            http_timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
            listen_timeout_secs: DEFAULT_LISTEN_TIMEOUT_SECS,
            nodes: NodeBindings::default(),
        }
    }
}

/// Reads and writes a [`PanelSettings`] JSON file.
///
/// A missing or unreadable file yields the defaults; saving writes the whole
/// document. A workflow clones the loaded settings at start and never
/// re-reads the store mid-run, so a concurrent `save` cannot race it.
#[derive(Debug, Clone)]
pub struct SettingsStore {
    path: PathBuf,
}

impl SettingsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> PanelSettings {
        let Ok(raw) = std::fs::read_to_string(&self.path) else {
            return PanelSettings::default();
        };
        serde_json::from_str(&raw).unwrap_or_default()
    }

    pub fn save(&self, settings: &PanelSettings) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(settings)?;
        std::fs::write(&self.path, raw)
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        Ok(())
    }

    /// Apply a single `key=value` update and persist. An empty value clears
    /// optional fields.
    pub fn update(&self, key: &str, raw: &str) -> Result<PanelSettings> {
        let mut settings = self.load();
        let value = raw.trim();
        match key {
            "comfyui_url" => settings.comfyui_url = value.to_string(),
            "gemini_api_key" => settings.gemini_api_key = value.to_string(),
            "gemini_model" => settings.gemini_model = value.to_string(),
            "fixed_seed" => {
                settings.fixed_seed = if value.is_empty() {
                    None
                } else {
                    Some(
                        value
                            .parse::<u64>()
                            .with_context(|| format!("fixed_seed is not an unsigned integer: {value}"))?,
                    )
                };
            }
            "reference_image_url" => {
                settings.reference_image_url =
                    (!value.is_empty()).then(|| value.to_string());
            }
            "template_path" => {
                settings.template_path = (!value.is_empty()).then(|| PathBuf::from(value));
            }
            "http_timeout_secs" => {
                settings.http_timeout_secs = parse_secs("http_timeout_secs", value)?;
            }
            "listen_timeout_secs" => {
                settings.listen_timeout_secs = parse_secs("listen_timeout_secs", value)?;
            }
            "nodes.positive_text" => settings.nodes.positive_text = value.to_string(),
            "nodes.negative_text" => settings.nodes.negative_text = value.to_string(),
            "nodes.seed" => settings.nodes.seed = value.to_string(),
            "nodes.dimensions" => settings.nodes.dimensions = value.to_string(),
            other => bail!("unknown settings key: {other}"),
        }
        self.save(&settings)?;
        Ok(settings)
    }
}

fn parse_secs(key: &str, value: &str) -> Result<u64> {
    let parsed = value
        .parse::<u64>()
        .with_context(|| format!("{key} is not an unsigned integer: {value}"))?;
    if parsed == 0 {
        bail!("{key} must be greater than zero");
    }
    Ok(parsed)
}
