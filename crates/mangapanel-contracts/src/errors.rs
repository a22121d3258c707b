const ERROR_BODY_MAX_CHARS: usize = 512;

/// Pipeline stage a failure is attributed to. Stage names appear verbatim in
/// `workflow_failed` events and user-facing notices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Parameters,
    Submission,
    Listen,
    ArtifactFetch,
    Caption,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Parameters => "parameters",
            Stage::Submission => "submission",
            Stage::Listen => "listen",
            Stage::ArtifactFetch => "artifact_fetch",
            Stage::Caption => "caption",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure taxonomy for a panel workflow. Every stage reports through one of
/// these; nothing is retried, and only caption failures are demoted to
/// notices instead of aborting the run.
#[derive(Debug)]
pub enum WorkflowError {
    /// A required credential is missing. Raised before any network call.
    AuthConfiguration { stage: Stage, message: String },
    /// Connectivity failure (DNS, refused connection, timeout, dropped socket).
    Transport { stage: Stage, message: String },
    /// An HTTP endpoint answered with a non-success status.
    UpstreamStatus {
        stage: Stage,
        status: u16,
        body: String,
    },
    /// A reply arrived but did not carry the expected structure.
    MalformedReply { stage: Stage, message: String },
    /// The job submission response carried no `prompt_id`.
    MissingJobId { body: String },
    /// The listen deadline elapsed without a completion notification.
    NoCompletion { waited_secs: u64 },
    /// A completion notification matched but listed no produced images.
    NoArtifactProduced { job_id: String },
}

impl WorkflowError {
    pub fn auth(stage: Stage, message: impl Into<String>) -> Self {
        Self::AuthConfiguration {
            stage,
            message: message.into(),
        }
    }

    pub fn transport(stage: Stage, err: impl std::fmt::Display) -> Self {
        Self::Transport {
            stage,
            message: err.to_string(),
        }
    }

    pub fn upstream(stage: Stage, status: u16, body: impl AsRef<str>) -> Self {
        Self::UpstreamStatus {
            stage,
            status,
            body: truncate_chars(body.as_ref(), ERROR_BODY_MAX_CHARS),
        }
    }

    pub fn malformed(stage: Stage, message: impl Into<String>) -> Self {
        Self::MalformedReply {
            stage,
            message: message.into(),
        }
    }

    pub fn missing_job_id(body: impl AsRef<str>) -> Self {
        Self::MissingJobId {
            body: truncate_chars(body.as_ref(), ERROR_BODY_MAX_CHARS),
        }
    }

    pub fn stage(&self) -> Stage {
        match self {
            Self::AuthConfiguration { stage, .. }
            | Self::Transport { stage, .. }
            | Self::UpstreamStatus { stage, .. }
            | Self::MalformedReply { stage, .. } => *stage,
            Self::MissingJobId { .. } => Stage::Submission,
            Self::NoCompletion { .. } | Self::NoArtifactProduced { .. } => Stage::Listen,
        }
    }

    /// Short machine-readable code used in event payloads.
    pub fn code(&self) -> &'static str {
        match self {
            Self::AuthConfiguration { .. } => "auth_configuration",
            Self::Transport { .. } => "transport",
            Self::UpstreamStatus { .. } => "upstream_status",
            Self::MalformedReply { .. } => "malformed_reply",
            Self::MissingJobId { .. } => "missing_job_id",
            Self::NoCompletion { .. } => "no_completion",
            Self::NoArtifactProduced { .. } => "no_artifact_produced",
        }
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}

impl std::fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AuthConfiguration { message, .. } => write!(f, "{message}"),
            Self::Transport { stage, message } => {
                write!(f, "{stage} request failed: {message}")
            }
            Self::UpstreamStatus {
                stage,
                status,
                body,
            } => write!(f, "{stage} request failed ({status}): {body}"),
            Self::MalformedReply { stage, message } => {
                write!(f, "{stage} reply malformed: {message}")
            }
            Self::MissingJobId { body } => {
                write!(f, "submission response has no prompt_id: {body}")
            }
            Self::NoCompletion { waited_secs } => {
                write!(
                    f,
                    "no completion notification arrived within {waited_secs}s"
                )
            }
            Self::NoArtifactProduced { job_id } => {
                write!(f, "job {job_id} completed without producing any image")
            }
        }
    }
}

impl std::error::Error for WorkflowError {}

pub fn truncate_chars(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}
