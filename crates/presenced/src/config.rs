use presence_core::MatchPolicy;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("reading config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("parsing config file: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Which message bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    Session,
    System,
}

impl FromStr for BusKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "session" => Ok(Self::Session),
            "system" => Ok(Self::System),
            other => Err(ConfigError::Invalid(format!("unknown bus {other:?}"))),
        }
    }
}

/// Daemon configuration.
///
/// Resolution order: defaults, then the TOML file named by
/// `PRESENCE_CONFIG` (if set), then `PRESENCE_*` environment variables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Where accepted probe photos are kept.
    pub upload_dir: PathBuf,
    /// Cosine distance below which a probe is accepted.
    pub match_threshold: f32,
    /// Minimum SCRFD score for a face detection.
    pub detector_confidence: f32,
    /// Upper bound on one embedding request, queueing included.
    pub request_timeout_secs: u64,
    /// Resolve check-in coordinates to an address via Nominatim.
    pub geocoder_enabled: bool,
    pub geocoder_url: String,
    pub geocoder_timeout_secs: u64,
    /// Mark users without a record as absent once a day.
    pub sweep_enabled: bool,
    /// Local hour (0-23) at which the absentee sweep runs.
    pub sweep_hour: u32,
    pub bus: BusKind,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = presence_core::data_dir();
        Self {
            model_dir: presence_core::default_model_dir(),
            db_path: data_dir.join("presence.db"),
            upload_dir: data_dir.join("uploads"),
            match_threshold: presence_core::matcher::DEFAULT_MATCH_THRESHOLD,
            detector_confidence: presence_core::detector::SCRFD_CONFIDENCE_THRESHOLD,
            request_timeout_secs: 10,
            geocoder_enabled: true,
            geocoder_url: "https://nominatim.openstreetmap.org/reverse".to_string(),
            geocoder_timeout_secs: 5,
            sweep_enabled: true,
            sweep_hour: 12,
            bus: BusKind::Session,
        }
    }
}

impl Config {
    /// Load configuration from the optional file and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var_os("PRESENCE_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Override fields from `PRESENCE_*` variables found through `lookup`.
    /// Unparseable numeric values are reported, not silently ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(v) = lookup("PRESENCE_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("PRESENCE_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("PRESENCE_UPLOAD_DIR") {
            self.upload_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("PRESENCE_GEOCODER_URL") {
            self.geocoder_url = v;
        }
        if let Some(v) = lookup("PRESENCE_BUS") {
            self.bus = v.parse()?;
        }
        parse_env(&lookup, "PRESENCE_MATCH_THRESHOLD", &mut self.match_threshold)?;
        parse_env(&lookup, "PRESENCE_DETECTOR_CONFIDENCE", &mut self.detector_confidence)?;
        parse_env(&lookup, "PRESENCE_REQUEST_TIMEOUT_SECS", &mut self.request_timeout_secs)?;
        parse_env(&lookup, "PRESENCE_GEOCODER_TIMEOUT_SECS", &mut self.geocoder_timeout_secs)?;
        parse_env(&lookup, "PRESENCE_SWEEP_HOUR", &mut self.sweep_hour)?;
        if let Some(v) = lookup("PRESENCE_GEOCODER_ENABLED") {
            self.geocoder_enabled = v != "0";
        }
        if let Some(v) = lookup("PRESENCE_SWEEP_ENABLED") {
            self.sweep_enabled = v != "0";
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.match_threshold > 0.0 && self.match_threshold <= 2.0) {
            return Err(ConfigError::Invalid(format!(
                "match_threshold must be in (0, 2], got {}",
                self.match_threshold
            )));
        }
        if !(0.0..1.0).contains(&self.detector_confidence) {
            return Err(ConfigError::Invalid(format!(
                "detector_confidence must be in [0, 1), got {}",
                self.detector_confidence
            )));
        }
        if self.sweep_hour > 23 {
            return Err(ConfigError::Invalid(format!(
                "sweep_hour must be 0-23, got {}",
                self.sweep_hour
            )));
        }
        if self.request_timeout_secs == 0 {
            return Err(ConfigError::Invalid("request_timeout_secs must be positive".into()));
        }
        Ok(())
    }

    pub fn match_policy(&self) -> MatchPolicy {
        MatchPolicy {
            threshold: self.match_threshold,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn geocoder_timeout(&self) -> Duration {
        Duration::from_secs(self.geocoder_timeout_secs)
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_dir
            .join("det_10g.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> String {
        self.model_dir
            .join("w600k_r50.onnx")
            .to_string_lossy()
            .into_owned()
    }
}

fn parse_env<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    target: &mut T,
) -> Result<(), ConfigError> {
    if let Some(raw) = lookup(key) {
        *target = raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("{key}={raw:?} is not a valid value")))?;
    }
    Ok(())
}
