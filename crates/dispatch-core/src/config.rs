use crate::error::{DispatchError, DispatchResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub run: RunConfig,
    #[serde(default)]
    pub shaping: Option<ShapingConfig>,
    #[serde(default)]
    pub input: InputConfig,
    pub target: TargetConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> DispatchResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| DispatchError::ConfigIo {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> DispatchResult<()> {
        self.run.validate()?;
        if let Some(shaping) = &self.shaping {
            shaping.validate()?;
        }
        self.target.validate()?;
        Ok(())
    }
}

/// What happens to in-flight work once the time budget runs out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClosurePolicy {
    /// Stop admitting, await everything already admitted.
    #[default]
    Drain,
    /// Stop admitting and return immediately, abandoning in-flight work.
    HardCutoff,
}

impl FromStr for ClosurePolicy {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "drain" => Ok(Self::Drain),
            "hard_cutoff" | "hard-cutoff" => Ok(Self::HardCutoff),
            other => Err(DispatchError::invalid(format!(
                "invalid closure policy: {other}, must be 'drain' or 'hard_cutoff'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Maximum number of simultaneously executing calls
    pub concurrency: usize,
    /// Optional wall-clock budget in milliseconds
    #[serde(default)]
    pub max_time_ms: Option<u64>,
    #[serde(default)]
    pub closure: ClosurePolicy,
    /// Per-call timeout in milliseconds
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
    /// Total number of tasks to produce by cycling the inputs
    #[serde(default)]
    pub target_total: Option<u64>,
    /// Failure samples shown per error kind
    #[serde(default = "default_report_samples")]
    pub report_samples: usize,
    /// Progress log interval in milliseconds
    #[serde(default = "default_progress_every_ms")]
    pub progress_every_ms: u64,
}

fn default_call_timeout_ms() -> u64 {
    60_000
}

fn default_report_samples() -> usize {
    10
}

fn default_progress_every_ms() -> u64 {
    1_000
}

impl RunConfig {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency,
            max_time_ms: None,
            closure: ClosurePolicy::Drain,
            call_timeout_ms: default_call_timeout_ms(),
            target_total: None,
            report_samples: default_report_samples(),
            progress_every_ms: default_progress_every_ms(),
        }
    }

    pub fn with_budget(mut self, max_time: Duration, closure: ClosurePolicy) -> Self {
        self.max_time_ms = Some(max_time.as_millis() as u64);
        self.closure = closure;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn max_time(&self) -> Option<Duration> {
        self.max_time_ms.map(Duration::from_millis)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn progress_every(&self) -> Duration {
        Duration::from_millis(self.progress_every_ms)
    }

    pub fn validate(&self) -> DispatchResult<()> {
        if self.concurrency == 0 {
            return Err(DispatchError::invalid("run.concurrency must be at least 1"));
        }
        if self.call_timeout_ms == 0 {
            return Err(DispatchError::invalid("run.call_timeout_ms must be non-zero"));
        }
        if self.max_time_ms == Some(0) {
            return Err(DispatchError::invalid(
                "run.max_time_ms must be non-zero, omit it to run without a time limit",
            ));
        }
        if self.target_total == Some(0) {
            return Err(DispatchError::invalid("run.target_total must be non-zero"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ShapingConfig {
    /// Tasks released per tick
    pub burst: u32,
    /// Tick length in milliseconds
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
}

fn default_tick_ms() -> u64 {
    1_000
}

impl ShapingConfig {
    pub fn per_second(burst: u32) -> Self {
        Self {
            burst,
            tick_ms: default_tick_ms(),
        }
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn validate(&self) -> DispatchResult<()> {
        if self.burst == 0 {
            return Err(DispatchError::invalid("shaping.burst must be at least 1"));
        }
        if self.tick_ms == 0 {
            return Err(DispatchError::invalid("shaping.tick_ms must be non-zero"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputConfig {
    /// One prompt per line; duplicates and blank lines are dropped
    #[serde(default)]
    pub questions_path: Option<PathBuf>,
    /// Single prompt repeated `run.target_total` times
    #[serde(default)]
    pub fixed_prompt: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    #[default]
    Chat,
    Image,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Full endpoint URL, e.g. https://host/v1/chat/completions
    pub url: String,
    /// Static credential attached to every call
    #[serde(default)]
    pub api_key: String,
    /// Prefix the credential with "Bearer "
    #[serde(default = "default_true")]
    pub bearer: bool,
    #[serde(default)]
    pub kind: TargetKind,
    pub model: String,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Image size, image targets only
    #[serde(default = "default_image_size")]
    pub size: String,
    /// Image quality, image targets only
    #[serde(default = "default_image_quality")]
    pub quality: String,
    /// Top-level response field whose presence marks an upstream failure
    #[serde(default = "default_error_field")]
    pub error_field: String,
    /// JSON pointer to the answer in a successful response
    #[serde(default = "default_answer_pointer")]
    pub answer_pointer: String,
}

fn default_true() -> bool {
    true
}

fn default_image_size() -> String {
    "1024x1024".to_string()
}

fn default_image_quality() -> String {
    "medium".to_string()
}

fn default_error_field() -> String {
    "error".to_string()
}

fn default_answer_pointer() -> String {
    "/choices/0/message/content".to_string()
}

impl TargetConfig {
    pub fn validate(&self) -> DispatchResult<()> {
        let url = url::Url::parse(&self.url)
            .map_err(|e| DispatchError::invalid(format!("target.url is invalid ({e}): {}", self.url)))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(DispatchError::invalid(format!(
                "target.url must be http:// or https:// (got {})",
                self.url
            )));
        }
        if !url.username().is_empty() || url.password().is_some() {
            return Err(DispatchError::invalid(
                "target.url must not include credentials, use target.api_key",
            ));
        }
        if self.model.trim().is_empty() {
            return Err(DispatchError::invalid("target.model must not be empty"));
        }
        if !self.answer_pointer.is_empty() && !self.answer_pointer.starts_with('/') {
            return Err(DispatchError::invalid(format!(
                "target.answer_pointer must be a JSON pointer starting with '/' (got {})",
                self.answer_pointer
            )));
        }
        Ok(())
    }

    /// Value of the `Authorization` header, if a credential is configured.
    pub fn authorization(&self) -> Option<String> {
        if self.api_key.is_empty() {
            None
        } else if self.bearer {
            Some(format!("Bearer {}", self.api_key))
        } else {
            Some(self.api_key.clone())
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Directory for per-response files and run reports
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,
    /// Persist every decoded response body
    #[serde(default = "default_true")]
    pub save_responses: bool,
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("responses")
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
            save_responses: true,
        }
    }
}
