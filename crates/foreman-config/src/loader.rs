// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

use crate::Config;

/// Ordered list of config file locations searched from lowest to highest
/// priority. Later files override earlier ones.
fn config_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // 1. System-wide default
    paths.push(PathBuf::from("/etc/foreman/config.yaml"));
    paths.push(PathBuf::from("/etc/foreman/config.yml"));

    // 2. XDG / home
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".config/foreman/config.yaml"));
        paths.push(home.join(".config/foreman/config.yml"));
    }
    if let Some(cfg) = dirs::config_dir() {
        paths.push(cfg.join("foreman/config.yaml"));
        paths.push(cfg.join("foreman/config.yml"));
    }

    // 3. Workspace-local
    paths.push(PathBuf::from(".foreman.yaml"));
    paths.push(PathBuf::from(".foreman.yml"));
    paths.push(PathBuf::from("foreman.yaml"));
    paths.push(PathBuf::from("foreman.yml"));

    paths
}

/// Load configuration by merging all discovered YAML files, then applying
/// environment overrides. The `extra` argument may provide an explicit path
/// (e.g. a `--config` CLI flag), which wins over every discovered file.
pub fn load(extra: Option<&Path>) -> anyhow::Result<Config> {
    let mut merged = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());

    for path in config_search_paths() {
        if path.is_file() {
            debug!(path = %path.display(), "loading config layer");
            merge_yaml(&mut merged, read_layer(&path)?);
        }
    }

    if let Some(p) = extra {
        debug!(path = %p.display(), "loading explicit config");
        merge_yaml(&mut merged, read_layer(p)?);
    }

    let mut config: Config = if matches!(merged, serde_yaml::Value::Mapping(ref m) if m.is_empty())
    {
        Config::default()
    } else {
        serde_yaml::from_value(merged).unwrap_or_default()
    };

    apply_env_overrides(&mut config, |name| std::env::var(name).ok());
    Ok(config)
}

fn read_layer(path: &Path) -> anyhow::Result<serde_yaml::Value> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Deep-merge `src` into `dst`; src wins on scalar conflicts.
fn merge_yaml(dst: &mut serde_yaml::Value, src: serde_yaml::Value) {
    match (dst, src) {
        (serde_yaml::Value::Mapping(d), serde_yaml::Value::Mapping(s)) => {
            for (k, v) in s {
                let entry = d
                    .entry(k)
                    .or_insert(serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
                merge_yaml(entry, v);
            }
        }
        (dst, src) => *dst = src,
    }
}

/// Environment variables override file-sourced values. Credentials are the
/// main use case: FOREMAN_DB_PASSWORD keeps the password out of YAML files.
fn apply_env_overrides(config: &mut Config, get: impl Fn(&str) -> Option<String>) {
    if let Some(v) = get("FOREMAN_HOST_ADDR") {
        config.host.addr = v;
    }
    if let Some(v) = get("FOREMAN_HOST_PORT").and_then(|v| v.parse().ok()) {
        config.host.port = v;
    }
    if let Some(v) = get("FOREMAN_DB_HOST") {
        config.store.host = v;
    }
    if let Some(v) = get("FOREMAN_DB_PORT").and_then(|v| v.parse().ok()) {
        config.store.port = v;
    }
    if let Some(v) = get("FOREMAN_DB_NAME") {
        config.store.database = v;
    }
    if let Some(v) = get("FOREMAN_DB_USER") {
        config.store.user = v;
    }
    if let Some(v) = get("FOREMAN_DB_PASSWORD") {
        config.store.password = v;
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
