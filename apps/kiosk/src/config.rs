use std::{collections::HashMap, fs, path::PathBuf, time::Duration};

use anyhow::{bail, Context, Result};
use kiosk_core::OrchestratorPolicy;
use tracing::warn;
use url::Url;

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub station_url: String,
    pub scanner_poll_interval_ms: u64,
    pub capture_timeout_ms: u64,
    pub verifier_timeout_ms: u64,
    pub vote_timeout_ms: u64,
    /// 0 means unlimited.
    pub max_attempts_per_factor: u32,
    /// 0 disables idle expiry.
    pub session_idle_timeout_secs: u64,
    pub face_sample_path: PathBuf,
    pub fingerprint_sample_path: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            station_url: "http://127.0.0.1:8600".into(),
            scanner_poll_interval_ms: 5_000,
            capture_timeout_ms: 10_000,
            verifier_timeout_ms: 15_000,
            vote_timeout_ms: 30_000,
            max_attempts_per_factor: 0,
            session_idle_timeout_secs: 300,
            face_sample_path: "samples/face.bin".into(),
            fingerprint_sample_path: "samples/fingerprint.bin".into(),
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        let url = Url::parse(&self.station_url)
            .with_context(|| format!("station_url '{}' is not a valid URL", self.station_url))?;
        if !matches!(url.scheme(), "http" | "https") {
            bail!("station_url must use http or https, got '{}'", url.scheme());
        }
        if self.scanner_poll_interval_ms == 0 {
            bail!("scanner_poll_interval_ms must be greater than zero");
        }
        for (key, value) in [
            ("capture_timeout_ms", self.capture_timeout_ms),
            ("verifier_timeout_ms", self.verifier_timeout_ms),
            ("vote_timeout_ms", self.vote_timeout_ms),
        ] {
            if value == 0 {
                bail!("{key} must be greater than zero");
            }
        }
        Ok(())
    }

    pub fn policy(&self) -> OrchestratorPolicy {
        OrchestratorPolicy {
            verifier_timeout: Duration::from_millis(self.verifier_timeout_ms),
            vote_timeout: Duration::from_millis(self.vote_timeout_ms),
            max_attempts_per_factor: (self.max_attempts_per_factor > 0)
                .then_some(self.max_attempts_per_factor),
            session_idle_timeout: (self.session_idle_timeout_secs > 0)
                .then(|| Duration::from_secs(self.session_idle_timeout_secs)),
        }
    }

    pub fn capture_timeout(&self) -> Duration {
        Duration::from_millis(self.capture_timeout_ms)
    }

    pub fn scanner_poll_interval(&self) -> Duration {
        Duration::from_millis(self.scanner_poll_interval_ms)
    }
}

pub fn load_settings(path: &str) -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        apply_file(&mut settings, &raw);
    }
    apply_env(&mut settings, |key| std::env::var(key).ok());

    settings
}

fn apply_file(settings: &mut Settings, raw: &str) {
    let Some(file_cfg) = read_table(raw, "kiosk config") else {
        return;
    };
    apply_pairs(settings, |key| file_cfg.get(key).cloned());
}

fn apply_env(settings: &mut Settings, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("STATION_URL") {
        settings.station_url = v;
    }
    apply_pairs(settings, |key| var(&format!("APP__{}", key.to_ascii_uppercase())));
}

fn apply_pairs(settings: &mut Settings, get: impl Fn(&str) -> Option<String>) {
    if let Some(v) = get("station_url") {
        settings.station_url = v;
    }
    if let Some(v) = get("scanner_poll_interval_ms") {
        set_number(&mut settings.scanner_poll_interval_ms, "scanner_poll_interval_ms", &v);
    }
    if let Some(v) = get("capture_timeout_ms") {
        set_number(&mut settings.capture_timeout_ms, "capture_timeout_ms", &v);
    }
    if let Some(v) = get("verifier_timeout_ms") {
        set_number(&mut settings.verifier_timeout_ms, "verifier_timeout_ms", &v);
    }
    if let Some(v) = get("vote_timeout_ms") {
        set_number(&mut settings.vote_timeout_ms, "vote_timeout_ms", &v);
    }
    if let Some(v) = get("max_attempts_per_factor") {
        set_number(&mut settings.max_attempts_per_factor, "max_attempts_per_factor", &v);
    }
    if let Some(v) = get("session_idle_timeout_secs") {
        set_number(&mut settings.session_idle_timeout_secs, "session_idle_timeout_secs", &v);
    }
    if let Some(v) = get("face_sample_path") {
        settings.face_sample_path = v.into();
    }
    if let Some(v) = get("fingerprint_sample_path") {
        settings.fingerprint_sample_path = v.into();
    }
}

/// Flattens a TOML scalar (or an array of scalars) into the string form the env overlay uses.
fn file_value(value: &toml::Value) -> Option<String> {
    match value {
        toml::Value::String(s) => Some(s.clone()),
        toml::Value::Integer(i) => Some(i.to_string()),
        toml::Value::Float(f) => Some(f.to_string()),
        toml::Value::Boolean(b) => Some(b.to_string()),
        toml::Value::Array(items) => items
            .iter()
            .map(file_value)
            .collect::<Option<Vec<_>>>()
            .map(|items| items.join(",")),
        _ => None,
    }
}

fn read_table(raw: &str, source: &str) -> Option<HashMap<String, String>> {
    let table = match raw.parse::<toml::Table>() {
        Ok(table) => table,
        Err(error) => {
            warn!(%error, source, "ignoring unreadable config file");
            return None;
        }
    };
    let mut values = HashMap::new();
    for (key, value) in &table {
        match file_value(value) {
            Some(flat) => {
                values.insert(key.clone(), flat);
            }
            None => warn!(key = %key, source, "unsupported value type; ignoring"),
        }
    }
    Some(values)
}

fn set_number<T: std::str::FromStr>(target: &mut T, key: &str, raw: &str) {
    match raw.trim().parse::<T>() {
        Ok(parsed) => *target = parsed,
        Err(_) => warn!(key, value = raw, "expected a non-negative integer; keeping default"),
    }
}
