use std::{collections::HashMap, fs, time::Duration};

use engine::CorrelatorConfig;

/// `database_url` value that selects the in-memory repository.
pub const MEMORY_DATABASE: &str = "memory";

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub bind_addr: String,
    pub database_url: String,
    pub scoring_base_url: String,
    pub scoring_workers: usize,
    pub scoring_queue_capacity: usize,
    pub scoring_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".into(),
            database_url: "sqlite://./data/duel.db".into(),
            scoring_base_url: "http://localhost:8000".into(),
            scoring_workers: 4,
            scoring_queue_capacity: 100,
            scoring_timeout_secs: 30,
        }
    }
}

impl Settings {
    pub fn correlator(&self) -> CorrelatorConfig {
        CorrelatorConfig {
            worker_count: self.scoring_workers,
            queue_capacity: self.scoring_queue_capacity,
            call_timeout: Duration::from_secs(self.scoring_timeout_secs),
        }
    }

    pub fn uses_memory_database(&self) -> bool {
        self.database_url.trim() == MEMORY_DATABASE
    }
}

/// Defaults, then `server.toml` in the working directory, then the
/// environment.
pub fn load_settings() -> Settings {
    let file = fs::read_to_string("server.toml").ok();
    resolve_settings(file.as_deref(), |key| std::env::var(key).ok())
}

pub(crate) fn resolve_settings(
    file: Option<&str>,
    env: impl Fn(&str) -> Option<String>,
) -> Settings {
    let mut settings = Settings::default();

    let file_cfg = file.and_then(|raw| toml::from_str::<HashMap<String, String>>(raw).ok());
    if let Some(file_cfg) = file_cfg {
        if let Some(v) = file_cfg.get("bind_addr") {
            settings.bind_addr = v.clone();
        }
        if let Some(v) = file_cfg.get("database_url") {
            settings.database_url = v.clone();
        }
        if let Some(v) = file_cfg.get("scoring_base_url") {
            settings.scoring_base_url = v.clone();
        }
        apply_count(&mut settings.scoring_workers, file_cfg.get("scoring_workers"));
        apply_count(
            &mut settings.scoring_queue_capacity,
            file_cfg.get("scoring_queue_capacity"),
        );
        apply_count(
            &mut settings.scoring_timeout_secs,
            file_cfg.get("scoring_timeout_secs"),
        );
    }

    for key in ["SERVER_BIND", "APP__BIND_ADDR"] {
        if let Some(v) = env(key) {
            settings.bind_addr = v;
        }
    }
    for key in ["DATABASE_URL", "APP__DATABASE_URL"] {
        if let Some(v) = env(key) {
            settings.database_url = v;
        }
    }
    for key in ["SCORING_BASE_URL", "APP__SCORING_BASE_URL"] {
        if let Some(v) = env(key) {
            settings.scoring_base_url = v;
        }
    }
    apply_count(&mut settings.scoring_workers, env("APP__SCORING_WORKERS").as_ref());
    apply_count(
        &mut settings.scoring_queue_capacity,
        env("APP__SCORING_QUEUE_CAPACITY").as_ref(),
    );
    apply_count(
        &mut settings.scoring_timeout_secs,
        env("APP__SCORING_TIMEOUT_SECS").as_ref(),
    );

    settings
}

fn apply_count<T>(target: &mut T, raw: Option<&String>)
where
    T: std::str::FromStr + PartialEq + Default,
{
    if let Some(parsed) = raw.and_then(|v| v.trim().parse::<T>().ok()) {
        if parsed != T::default() {
            *target = parsed;
        }
    }
}

/// Turns a bare file path into a sqlite url; urls pass through untouched.
pub fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:") || raw_database_url.contains("://") {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        return format!("sqlite://{}", path.replace('\\', "/"));
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
