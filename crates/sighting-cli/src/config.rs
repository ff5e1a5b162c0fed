use anyhow::{Context, Result};
use serde::Deserialize;
use sighting_core::{
    SessionConfig, DEFAULT_COOLDOWN, DEFAULT_DUPLICATE_TOLERANCE, DEFAULT_MATCH_THRESHOLD,
    DEFAULT_REPORT_EVERY, DEFAULT_SESSION_BUDGET,
};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Optional TOML config file. Every key may be omitted.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    data_dir: Option<PathBuf>,
    registry_dir: Option<PathBuf>,
    events_path: Option<PathBuf>,
    profiles_path: Option<PathBuf>,
    match_threshold: Option<f32>,
    duplicate_tolerance: Option<f32>,
    cooldown_secs: Option<u64>,
    session_budget_secs: Option<u64>,
    max_frames: Option<u64>,
    report_every: Option<u64>,
}

/// CLI configuration: defaults, then the TOML file, then `SIGHTING_*`
/// environment variables. Command-line flags are applied on top by `main`.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory of `{identity}_{n}.json` reference records.
    pub registry_dir: PathBuf,
    /// Sighting log file.
    pub events_path: PathBuf,
    /// Optional profile metadata (JSON object keyed by label or image name).
    pub profiles_path: Option<PathBuf>,
    /// Euclidean distance below which a face is identified.
    pub match_threshold: f32,
    /// Euclidean distance at or below which a registration is refused.
    pub duplicate_tolerance: f32,
    /// Minimum seconds between two logged sightings of one identity.
    pub cooldown_secs: u64,
    /// Time budget for `watch`, in seconds. 0 runs until the input ends.
    pub session_budget_secs: u64,
    /// Frame budget for `watch`.
    pub max_frames: Option<u64>,
    /// Throughput report cadence, in frames.
    pub report_every: u64,
}

impl Config {
    /// Load configuration. `file` wins over `SIGHTING_CONFIG` when both are set.
    pub fn load(file: Option<&Path>) -> Result<Self> {
        let path = file
            .map(Path::to_path_buf)
            .or_else(|| std::env::var("SIGHTING_CONFIG").ok().map(PathBuf::from));

        let file_config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(&path)
                    .with_context(|| format!("reading config file {}", path.display()))?;
                let parsed: FileConfig = toml::from_str(&text)
                    .with_context(|| format!("parsing config file {}", path.display()))?;
                tracing::debug!(path = %path.display(), "config file loaded");
                parsed
            }
            None => FileConfig::default(),
        };

        Ok(Self::resolve(file_config, |key| std::env::var(key).ok()))
    }

    fn resolve(file: FileConfig, env: impl Fn(&str) -> Option<String>) -> Self {
        let env_path = |key: &str| env(key).map(PathBuf::from);
        let env_parse = |key: &str| env(key).and_then(|v| v.parse::<f64>().ok());

        let data_dir = env_path("SIGHTING_DATA_DIR")
            .or(file.data_dir)
            .unwrap_or_else(|| default_data_dir(&env));

        Self {
            registry_dir: env_path("SIGHTING_REGISTRY_DIR")
                .or(file.registry_dir)
                .unwrap_or_else(|| data_dir.join("known_faces")),
            events_path: env_path("SIGHTING_EVENTS_PATH")
                .or(file.events_path)
                .unwrap_or_else(|| data_dir.join("sightings.json")),
            profiles_path: env_path("SIGHTING_PROFILES_PATH").or(file.profiles_path),
            match_threshold: env_parse("SIGHTING_MATCH_THRESHOLD")
                .map(|v| v as f32)
                .or(file.match_threshold)
                .unwrap_or(DEFAULT_MATCH_THRESHOLD),
            duplicate_tolerance: env_parse("SIGHTING_DUPLICATE_TOLERANCE")
                .map(|v| v as f32)
                .or(file.duplicate_tolerance)
                .unwrap_or(DEFAULT_DUPLICATE_TOLERANCE),
            cooldown_secs: env_u64(&env, "SIGHTING_COOLDOWN_SECS")
                .or(file.cooldown_secs)
                .unwrap_or(DEFAULT_COOLDOWN.as_secs()),
            session_budget_secs: env_u64(&env, "SIGHTING_SESSION_BUDGET_SECS")
                .or(file.session_budget_secs)
                .unwrap_or(DEFAULT_SESSION_BUDGET.as_secs()),
            max_frames: env_u64(&env, "SIGHTING_MAX_FRAMES").or(file.max_frames),
            report_every: env_u64(&env, "SIGHTING_REPORT_EVERY")
                .or(file.report_every)
                .unwrap_or(DEFAULT_REPORT_EVERY),
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            match_threshold: self.match_threshold,
            cooldown: Duration::from_secs(self.cooldown_secs),
            max_elapsed: (self.session_budget_secs > 0)
                .then(|| Duration::from_secs(self.session_budget_secs)),
            max_frames: self.max_frames,
            report_every: self.report_every,
        }
    }
}

fn default_data_dir(env: &impl Fn(&str) -> Option<String>) -> PathBuf {
    env("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("sighting")
}

fn env_u64(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<u64> {
    env(key).and_then(|v| v.parse().ok())
}
