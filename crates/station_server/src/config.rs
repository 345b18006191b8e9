use std::{collections::HashMap, fs};

use tracing::warn;

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub bind_addr: String,
    pub similarity_threshold: f64,
    pub simulated_confidence: f64,
    pub scanner_port: String,
    pub scanner_connected: bool,
    pub registered_voters: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8600".into(),
            similarity_threshold: 0.85,
            simulated_confidence: 0.92,
            scanner_port: "COM3".into(),
            scanner_connected: true,
            registered_voters: vec![
                "VOTER-001".into(),
                "VOTER-002".into(),
                "VOTER-003".into(),
            ],
        }
    }
}

pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("station.toml") {
        apply_file(&mut settings, &raw);
    }
    apply_env(&mut settings, |key| std::env::var(key).ok());

    settings
}

fn apply_file(settings: &mut Settings, raw: &str) {
    let Some(file_cfg) = read_table(raw, "station.toml") else {
        return;
    };

    if let Some(v) = file_cfg.get("bind_addr") {
        settings.bind_addr = v.clone();
    }
    if let Some(v) = file_cfg.get("similarity_threshold") {
        set_ratio(&mut settings.similarity_threshold, "similarity_threshold", v);
    }
    if let Some(v) = file_cfg.get("simulated_confidence") {
        set_ratio(&mut settings.simulated_confidence, "simulated_confidence", v);
    }
    if let Some(v) = file_cfg.get("scanner_port") {
        settings.scanner_port = v.clone();
    }
    if let Some(v) = file_cfg.get("scanner_connected") {
        set_flag(&mut settings.scanner_connected, "scanner_connected", v);
    }
    if let Some(v) = file_cfg.get("registered_voters") {
        settings.registered_voters = split_list(v);
    }
}

fn apply_env(settings: &mut Settings, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("STATION_BIND") {
        settings.bind_addr = v;
    }
    if let Some(v) = var("APP__BIND_ADDR") {
        settings.bind_addr = v;
    }

    if let Some(v) = var("APP__SIMILARITY_THRESHOLD") {
        set_ratio(&mut settings.similarity_threshold, "APP__SIMILARITY_THRESHOLD", &v);
    }
    if let Some(v) = var("APP__SIMULATED_CONFIDENCE") {
        set_ratio(&mut settings.simulated_confidence, "APP__SIMULATED_CONFIDENCE", &v);
    }

    if let Some(v) = var("SCANNER_PORT") {
        settings.scanner_port = v;
    }
    if let Some(v) = var("APP__SCANNER_PORT") {
        settings.scanner_port = v;
    }
    if let Some(v) = var("APP__SCANNER_CONNECTED") {
        set_flag(&mut settings.scanner_connected, "APP__SCANNER_CONNECTED", &v);
    }

    if let Some(v) = var("APP__REGISTERED_VOTERS") {
        settings.registered_voters = split_list(&v);
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

fn set_ratio(target: &mut f64, key: &str, raw: &str) {
    match raw.trim().parse::<f64>() {
        Ok(parsed) if (0.0..=1.0).contains(&parsed) => *target = parsed,
        _ => warn!(key, value = raw, "expected a number between 0 and 1; keeping default"),
    }
}

fn set_flag(target: &mut bool, key: &str, raw: &str) {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => *target = true,
        "0" | "false" | "no" => *target = false,
        _ => warn!(key, value = raw, "expected a boolean; keeping default"),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
