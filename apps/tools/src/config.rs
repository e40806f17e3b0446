use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use client_core::PipeOptions;
use serde::Deserialize;
use tracing::debug;

const DEFAULT_CONFIG: &str = "replay.toml";
const ENV_PREFIX: &str = "PIPE__";

/// Page settings the replay runs with, minus the fragment count which the
/// scenario declares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub page_id: Option<String>,
    pub reuse_limit: usize,
    pub asset_timeout_ms: u64,
    pub root_parent: String,
    pub loading_class: String,
    pub fragment_param: String,
    pub events_capacity: usize,
}

impl Default for Settings {
    fn default() -> Self {
        let defaults = PipeOptions::default();
        Self {
            page_id: None,
            reuse_limit: defaults.reuse_limit,
            asset_timeout_ms: defaults.asset_timeout_ms,
            root_parent: defaults.root_parent,
            loading_class: defaults.loading_class,
            fragment_param: defaults.fragment_param,
            events_capacity: defaults.events_capacity,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileSettings {
    page_id: Option<String>,
    reuse_limit: Option<usize>,
    asset_timeout_ms: Option<u64>,
    root_parent: Option<String>,
    loading_class: Option<String>,
    fragment_param: Option<String>,
    events_capacity: Option<usize>,
}

impl Settings {
    pub fn into_options(self, expected_fragments: usize) -> PipeOptions {
        let mut options = match self.page_id {
            Some(page_id) => PipeOptions::new(page_id, expected_fragments),
            None => PipeOptions::new(shared::domain::PageId::generate(), expected_fragments),
        };
        options.reuse_limit = self.reuse_limit;
        options.asset_timeout_ms = self.asset_timeout_ms;
        options.root_parent = self.root_parent;
        options.loading_class = self.loading_class;
        options.fragment_param = self.fragment_param;
        options.events_capacity = self.events_capacity;
        options
    }

    fn apply_file(&mut self, file: FileSettings) {
        if let Some(v) = file.page_id {
            self.page_id = Some(v);
        }
        if let Some(v) = file.reuse_limit {
            self.reuse_limit = v;
        }
        if let Some(v) = file.asset_timeout_ms {
            self.asset_timeout_ms = v;
        }
        if let Some(v) = file.root_parent {
            self.root_parent = v;
        }
        if let Some(v) = file.loading_class {
            self.loading_class = v;
        }
        if let Some(v) = file.fragment_param {
            self.fragment_param = v;
        }
        if let Some(v) = file.events_capacity {
            self.events_capacity = v;
        }
    }

    fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(&format!("{ENV_PREFIX}{key}"));

        if let Some(v) = var("PAGE_ID") {
            self.page_id = Some(v);
        }
        if let Some(v) = var("REUSE_LIMIT").and_then(|v| v.parse().ok()) {
            self.reuse_limit = v;
        }
        if let Some(v) = var("ASSET_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.asset_timeout_ms = v;
        }
        if let Some(v) = var("ROOT_PARENT") {
            self.root_parent = v;
        }
        if let Some(v) = var("LOADING_CLASS") {
            self.loading_class = v;
        }
        if let Some(v) = var("FRAGMENT_PARAM") {
            self.fragment_param = v;
        }
        if let Some(v) = var("EVENTS_CAPACITY").and_then(|v| v.parse().ok()) {
            self.events_capacity = v;
        }
    }
}

/// Defaults, then `replay.toml` (or the explicit `path`), then `PIPE__*`
/// environment overrides. An explicit file that cannot be read is an error;
/// a missing default file is not.
pub fn load_settings(path: Option<&Path>) -> anyhow::Result<Settings> {
    let mut settings = Settings::default();

    let (file, required) = match path {
        Some(path) => (path.to_path_buf(), true),
        None => (PathBuf::from(DEFAULT_CONFIG), false),
    };
    match fs::read_to_string(&file) {
        Ok(raw) => {
            let parsed: FileSettings = toml::from_str(&raw)
                .with_context(|| format!("invalid settings in {}", file.display()))?;
            settings.apply_file(parsed);
            debug!(file = %file.display(), "replay: settings file loaded");
        }
        Err(err) if required => {
            return Err(err).with_context(|| format!("failed to read {}", file.display()));
        }
        Err(_) => {}
    }

    settings.apply_env(|key| std::env::var(key).ok());
    Ok(settings)
}
