use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use kiln_comfyui::client::ComfyUIClient;
use kiln_pipeline::detector::DetectorConfig;
use kiln_pipeline::orchestrator::PipelineConfig;

const DEFAULT_GRID_API_URL: &str = "https://api.aipowergrid.io/api";
const DEFAULT_COMFYUI_URL: &str = "http://127.0.0.1:8188";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{name} has an invalid value '{value}'")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Worker configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub grid_api_url: String,
    pub grid_api_key: String,
    pub worker_name: String,
    /// Models advertised on pop.
    pub models: Vec<String>,
    pub comfyui_url: String,
    pub comfyui_ws_url: String,
    /// Engine output directory for the filesystem fallback.
    pub comfyui_output_dir: Option<PathBuf>,
    pub workflow_dir: PathBuf,
    /// Model name -> template name.
    pub workflow_map: HashMap<String, String>,
    pub max_pixels: u64,
    pub max_concurrent_jobs: usize,
    pub pop_interval: Duration,
    pub job_timeout: Duration,
    pub stall_threshold: Duration,
    pub fallback_after: Duration,
    pub min_artifact_bytes: u64,
    pub log_format: LogFormat,
}

impl WorkerConfig {
    /// Load configuration from the process environment.
    ///
    /// | Env Var                | Default                            |
    /// |------------------------|------------------------------------|
    /// | `GRID_API_URL`         | `https://api.aipowergrid.io/api`   |
    /// | `GRID_API_KEY`         | required                           |
    /// | `WORKER_NAME`          | `kiln-worker`                      |
    /// | `GRID_MODELS`          | empty (comma-separated)            |
    /// | `COMFYUI_URL`          | `http://127.0.0.1:8188`            |
    /// | `COMFYUI_WS_URL`       | derived from `COMFYUI_URL`         |
    /// | `COMFYUI_OUTPUT_DIR`   | unset (fallback disabled)          |
    /// | `WORKFLOW_DIR`         | `workflows`                        |
    /// | `WORKFLOW_MAP`         | empty (`model=template,...`)       |
    /// | `MAX_PIXELS`           | `4194304`                          |
    /// | `MAX_CONCURRENT_JOBS`  | `1`                                |
    /// | `POP_INTERVAL_MS`      | `1000`                             |
    /// | `JOB_TIMEOUT_SECS`     | `600`                              |
    /// | `STALL_THRESHOLD_SECS` | `60`                               |
    /// | `FALLBACK_AFTER_SECS`  | `120`                              |
    /// | `MIN_ARTIFACT_BYTES`   | `1024`                             |
    /// | `LOG_FORMAT`           | `text` (`json` for JSON lines)     |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`, which returns a variable's
    /// value or `None` when unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let grid_api_key = get("GRID_API_KEY").ok_or(ConfigError::Missing("GRID_API_KEY"))?;
        let comfyui_url = get("COMFYUI_URL").unwrap_or_else(|| DEFAULT_COMFYUI_URL.into());
        let comfyui_ws_url = get("COMFYUI_WS_URL").unwrap_or_else(|| ComfyUIClient::ws_url_from_http(&comfyui_url));

        let log_format = match get("LOG_FORMAT").as_deref() {
            None | Some("text") => LogFormat::Text,
            Some("json") => LogFormat::Json,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    name: "LOG_FORMAT",
                    value: other.to_string(),
                })
            }
        };

        Ok(Self {
            grid_api_url: get("GRID_API_URL")
                .unwrap_or_else(|| DEFAULT_GRID_API_URL.into())
                .trim_end_matches('/')
                .to_string(),
            grid_api_key,
            worker_name: get("WORKER_NAME").unwrap_or_else(|| "kiln-worker".into()),
            models: split_list(get("GRID_MODELS").as_deref().unwrap_or_default()),
            comfyui_url,
            comfyui_ws_url,
            comfyui_output_dir: get("COMFYUI_OUTPUT_DIR").map(PathBuf::from),
            workflow_dir: PathBuf::from(get("WORKFLOW_DIR").unwrap_or_else(|| "workflows".into())),
            workflow_map: parse_workflow_map(get("WORKFLOW_MAP").as_deref().unwrap_or_default())?,
            max_pixels: parse_or(&get, "MAX_PIXELS", 4_194_304)?,
            max_concurrent_jobs: parse_or(&get, "MAX_CONCURRENT_JOBS", 1)?,
            pop_interval: Duration::from_millis(parse_or(&get, "POP_INTERVAL_MS", 1000)?),
            job_timeout: Duration::from_secs(parse_or(&get, "JOB_TIMEOUT_SECS", 600)?),
            stall_threshold: Duration::from_secs(parse_or(&get, "STALL_THRESHOLD_SECS", 60)?),
            fallback_after: Duration::from_secs(parse_or(&get, "FALLBACK_AFTER_SECS", 120)?),
            min_artifact_bytes: parse_or(&get, "MIN_ARTIFACT_BYTES", 1024)?,
            log_format,
        })
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            detector: DetectorConfig {
                timeout: self.job_timeout,
                stall_threshold: self.stall_threshold,
                fallback_after: self.fallback_after,
                min_artifact_bytes: self.min_artifact_bytes,
                output_dir: self.comfyui_output_dir.clone(),
                ..Default::default()
            },
            max_concurrent_jobs: self.max_concurrent_jobs,
            pop_interval: self.pop_interval,
            ..Default::default()
        }
    }
}

// ---- private helpers ----

fn parse_or<T: FromStr>(
    get: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match get(name) {
        None => Ok(default),
        Some(value) => value.parse().map_err(|_| ConfigError::Invalid { name, value }),
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Parse `model=template,model2=template2`.
fn parse_workflow_map(value: &str) -> Result<HashMap<String, String>, ConfigError> {
    split_list(value)
        .into_iter()
        .map(|pair| match pair.split_once('=') {
            Some((model, template)) if !model.trim().is_empty() && !template.trim().is_empty() => {
                Ok((model.trim().to_string(), template.trim().to_string()))
            }
            _ => Err(ConfigError::Invalid {
                name: "WORKFLOW_MAP",
                value: pair,
            }),
        })
        .collect()
}
