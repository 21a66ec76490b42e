// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use crate::app::types::{BackendKind, Params};

const APP_DIR_NAME: &str = "dispatchd";
const CONFIG_FILE_NAME: &str = "dispatchd.toml";
const CONFIG_ENV_VAR: &str = "DISPATCHD_CONFIG_PATH";
const DATABASE_FILE_NAME: &str = "dispatchd.sqlite";
const DEFAULT_JOB_CHECK_INTERVAL_SECS: u64 = 5;
const DEFAULT_HEARTBEAT_PORT: u16 = 9991;
const DEFAULT_HEARTBEAT_MISS_THRESHOLD: u32 = 3;
const DEFAULT_OPERATION_TIMEOUT_SECS: u64 = 3600;
const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;
const DEFAULT_POLL_MAX_INTERVAL_MS: u64 = 10_000;
const DEFAULT_POLL_DEADLINE_SECS: u64 = 600;
const DEFAULT_MAX_DISPATCH_ATTEMPTS: u32 = 2;
const DEFAULT_STALE_JOB_SECS: u64 = 86_400;
const DEFAULT_FIREWALL_RULE_NAME: &str = "dispatch-firewall";
const DEFAULT_ACCESS_TOKEN_ENV: &str = "GCP_ACCESS_TOKEN";
const DEFAULT_LOCAL_PROVIDER: &str = "local";
const REMOTE_SCRATCH_DIR: &str = "/var/lib/dispatch/scratch";
const REMOTE_STORAGE_DIR: &str = "/var/lib/dispatch/storage";
const SSH_PORT: u16 = 22;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    database_path: Option<String>,
    job_check_interval_secs: Option<u64>,
    heartbeat_port: Option<u16>,
    heartbeat_miss_threshold: Option<u32>,
    operation_timeout_secs: Option<u64>,
    poll_interval_ms: Option<u64>,
    poll_max_interval_ms: Option<u64>,
    poll_deadline_secs: Option<u64>,
    max_dispatch_attempts: Option<u32>,
    stale_job_secs: Option<u64>,
    cleanup_grace_secs: Option<u64>,
    verbose: Option<bool>,
    #[serde(default)]
    automation: FileAutomation,
    #[serde(default)]
    defaults: BTreeMap<String, Params>,
    #[serde(default)]
    providers: Vec<FileProvider>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileAutomation {
    ansible_bin: Option<String>,
    playbook_bin: Option<String>,
    roles_path: Option<String>,
    remote_user: Option<String>,
    private_key_file: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileProvider {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    project: Option<String>,
    #[serde(default)]
    zones: Vec<String>,
    access_token_env: Option<String>,
    scratch_dir: Option<String>,
    storage_dir: Option<String>,
    firewall_rule_name: Option<String>,
    required_ports: Option<Vec<u16>>,
    #[serde(default)]
    vars: Params,
}

#[derive(Debug, Clone)]
pub struct AutomationConfig {
    pub ansible_bin: String,
    pub playbook_bin: String,
    pub roles_path: Option<PathBuf>,
    pub remote_user: Option<String>,
    pub private_key_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub name: String,
    pub kind: BackendKind,
    pub project: Option<String>,
    pub zones: Vec<String>,
    pub access_token_env: String,
    pub scratch_dir: String,
    pub storage_dir: String,
    pub firewall_rule_name: String,
    pub required_ports: Vec<u16>,
    pub vars: Params,
}

#[derive(Debug)]
pub struct Config {
    pub database_path: PathBuf,
    pub job_check_interval_secs: u64,
    pub heartbeat_port: u16,
    pub heartbeat_miss_threshold: u32,
    pub operation_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub poll_max_interval_ms: u64,
    pub poll_deadline_secs: u64,
    pub max_dispatch_attempts: u32,
    pub stale_job_secs: u64,
    pub cleanup_grace_secs: u64,
    pub verbose: bool,
    pub automation: AutomationConfig,
    /// Parameter layers keyed by `all`, backend type or provider name.
    pub defaults: BTreeMap<String, Params>,
    pub providers: Vec<ProviderConfig>,
    #[allow(dead_code)]
    pub config_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    Override,
    Env,
    ConfigFile,
    Default,
}

impl ConfigSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ConfigSource::Override => "override",
            ConfigSource::Env => "env",
            ConfigSource::ConfigFile => "config",
            ConfigSource::Default => "default",
        }
    }
}

#[derive(Debug)]
pub struct ConfigValue<T> {
    pub value: T,
    pub source: ConfigSource,
}

impl<T> ConfigValue<T> {
    fn pick(override_value: Option<T>, file_value: Option<T>, default: T) -> Self {
        match (override_value, file_value) {
            (Some(value), _) => Self {
                value,
                source: ConfigSource::Override,
            },
            (None, Some(value)) => Self {
                value,
                source: ConfigSource::ConfigFile,
            },
            (None, None) => Self {
                value: default,
                source: ConfigSource::Default,
            },
        }
    }
}

#[derive(Debug)]
pub struct ConfigReport {
    pub config_path: Option<PathBuf>,
    pub config_path_source: Option<ConfigSource>,
    pub config_file_present: bool,
    pub database_path: ConfigValue<PathBuf>,
    pub job_check_interval_secs: ConfigValue<u64>,
    pub heartbeat_port: ConfigValue<u16>,
    pub heartbeat_miss_threshold: ConfigValue<u32>,
    pub operation_timeout_secs: ConfigValue<u64>,
    pub verbose: ConfigValue<bool>,
    pub providers: Vec<String>,
}

#[derive(Debug)]
pub struct LoadResult {
    pub config: Config,
    pub report: ConfigReport,
}

#[derive(Debug, Default)]
pub struct Overrides {
    pub database_path: Option<PathBuf>,
    pub job_check_interval_secs: Option<u64>,
    pub heartbeat_port: Option<u16>,
    pub verbose: Option<bool>,
}

#[allow(dead_code)]
pub fn load(config_path_override: Option<PathBuf>, overrides: Overrides) -> Result<Config> {
    Ok(load_with_report(config_path_override, overrides)?.config)
}

pub fn load_with_report(
    config_path_override: Option<PathBuf>,
    overrides: Overrides,
) -> Result<LoadResult> {
    let (config_path, config_path_source, required) = match config_path_override {
        Some(path) => (Some(expand_path(path)), Some(ConfigSource::Override), true),
        None => match config_path_from_env()? {
            Some(path) => (Some(expand_path(path)), Some(ConfigSource::Env), true),
            None => match default_config_path().ok() {
                Some(path) => (Some(path), Some(ConfigSource::Default), false),
                None => (None, None, false),
            },
        },
    };
    let config_file_present = config_path
        .as_deref()
        .map(|path| path.exists())
        .unwrap_or(false);

    let file_config = match config_path.as_deref() {
        Some(path) => read_config_file(path, required)?,
        None => FileConfig::default(),
    };
    let base_dir = config_path.as_deref().and_then(|path| path.parent());

    let database_path = match overrides.database_path {
        Some(path) => ConfigValue {
            value: expand_path(path),
            source: ConfigSource::Override,
        },
        None => match file_config.database_path.as_deref() {
            Some(raw) => ConfigValue {
                value: resolve_path(raw, base_dir),
                source: ConfigSource::ConfigFile,
            },
            None => ConfigValue {
                value: default_database_path().with_context(|| {
                    "failed to resolve default database path; specify --database-path or set database_path in the config file"
                })?,
                source: ConfigSource::Default,
            },
        },
    };

    let job_check_interval_secs = ConfigValue::pick(
        overrides.job_check_interval_secs,
        file_config.job_check_interval_secs,
        DEFAULT_JOB_CHECK_INTERVAL_SECS,
    );
    if job_check_interval_secs.value == 0 {
        anyhow::bail!("job_check_interval_secs must be greater than zero");
    }
    let heartbeat_port = ConfigValue::pick(
        overrides.heartbeat_port,
        file_config.heartbeat_port,
        DEFAULT_HEARTBEAT_PORT,
    );
    if heartbeat_port.value == 0 {
        anyhow::bail!("heartbeat_port must be between 1 and 65535");
    }
    let heartbeat_miss_threshold = ConfigValue::pick(
        None,
        file_config.heartbeat_miss_threshold,
        DEFAULT_HEARTBEAT_MISS_THRESHOLD,
    );
    let operation_timeout_secs = ConfigValue::pick(
        None,
        file_config.operation_timeout_secs,
        DEFAULT_OPERATION_TIMEOUT_SECS,
    );
    if operation_timeout_secs.value == 0 {
        anyhow::bail!("operation_timeout_secs must be greater than zero");
    }
    let verbose = ConfigValue::pick(overrides.verbose, file_config.verbose, false);

    let poll_interval_ms = file_config
        .poll_interval_ms
        .unwrap_or(DEFAULT_POLL_INTERVAL_MS);
    let poll_max_interval_ms = file_config
        .poll_max_interval_ms
        .unwrap_or(DEFAULT_POLL_MAX_INTERVAL_MS);
    if poll_interval_ms == 0 || poll_max_interval_ms < poll_interval_ms {
        anyhow::bail!("poll_interval_ms must be positive and not exceed poll_max_interval_ms");
    }
    let max_dispatch_attempts = file_config
        .max_dispatch_attempts
        .unwrap_or(DEFAULT_MAX_DISPATCH_ATTEMPTS);
    if max_dispatch_attempts == 0 {
        anyhow::bail!("max_dispatch_attempts must be at least 1");
    }

    let automation = resolve_automation(file_config.automation, base_dir);
    let providers = resolve_providers(file_config.providers, heartbeat_port.value)?;

    let config = Config {
        database_path: database_path.value.clone(),
        job_check_interval_secs: job_check_interval_secs.value,
        heartbeat_port: heartbeat_port.value,
        heartbeat_miss_threshold: heartbeat_miss_threshold.value,
        operation_timeout_secs: operation_timeout_secs.value,
        poll_interval_ms,
        poll_max_interval_ms,
        poll_deadline_secs: file_config
            .poll_deadline_secs
            .unwrap_or(DEFAULT_POLL_DEADLINE_SECS),
        max_dispatch_attempts,
        stale_job_secs: file_config.stale_job_secs.unwrap_or(DEFAULT_STALE_JOB_SECS),
        cleanup_grace_secs: file_config.cleanup_grace_secs.unwrap_or(0),
        verbose: verbose.value,
        automation,
        defaults: file_config.defaults,
        providers,
        config_path: config_path.clone(),
    };

    let report = ConfigReport {
        config_path,
        config_path_source,
        config_file_present,
        database_path,
        job_check_interval_secs,
        heartbeat_port,
        heartbeat_miss_threshold,
        operation_timeout_secs,
        verbose,
        providers: config
            .providers
            .iter()
            .map(|p| format!("{} ({})", p.name, p.kind))
            .collect(),
    };

    Ok(LoadResult { config, report })
}

fn resolve_automation(raw: FileAutomation, base_dir: Option<&Path>) -> AutomationConfig {
    AutomationConfig {
        ansible_bin: raw.ansible_bin.unwrap_or_else(|| "ansible".to_string()),
        playbook_bin: raw
            .playbook_bin
            .unwrap_or_else(|| "ansible-playbook".to_string()),
        roles_path: raw
            .roles_path
            .as_deref()
            .map(|raw| resolve_path(raw, base_dir)),
        remote_user: raw.remote_user,
        private_key_file: raw
            .private_key_file
            .as_deref()
            .map(|raw| resolve_path(raw, base_dir)),
    }
}

/// Without any `[[providers]]` entry a single local provider is configured.
fn resolve_providers(raw: Vec<FileProvider>, heartbeat_port: u16) -> Result<Vec<ProviderConfig>> {
    if raw.is_empty() {
        return Ok(vec![local_provider(DEFAULT_LOCAL_PROVIDER)?]);
    }

    let mut seen = BTreeSet::new();
    let mut providers = Vec::with_capacity(raw.len());
    for entry in raw {
        let name = entry.name.trim().to_string();
        if name.is_empty() {
            anyhow::bail!("provider name must not be empty");
        }
        if !seen.insert(name.clone()) {
            anyhow::bail!("provider '{name}' is configured more than once");
        }
        let kind = BackendKind::from_str(&entry.kind)
            .map_err(anyhow::Error::msg)
            .with_context(|| format!("invalid type for provider '{name}'"))?;

        let (scratch_dir, storage_dir) = match kind {
            BackendKind::Local => {
                let data = default_data_dir()?;
                (
                    entry
                        .scratch_dir
                        .map(|raw| shellexpand::tilde(&raw).into_owned())
                        .unwrap_or_else(|| data.join("scratch").to_string_lossy().into_owned()),
                    entry
                        .storage_dir
                        .map(|raw| shellexpand::tilde(&raw).into_owned())
                        .unwrap_or_else(|| data.join("storage").to_string_lossy().into_owned()),
                )
            }
            BackendKind::Gcp => {
                if entry.project.as_deref().is_none_or(|p| p.trim().is_empty()) {
                    anyhow::bail!("provider '{name}' needs a project");
                }
                if entry.zones.is_empty() {
                    anyhow::bail!("provider '{name}' needs at least one zone");
                }
                (
                    entry
                        .scratch_dir
                        .unwrap_or_else(|| REMOTE_SCRATCH_DIR.to_string()),
                    entry
                        .storage_dir
                        .unwrap_or_else(|| REMOTE_STORAGE_DIR.to_string()),
                )
            }
        };

        providers.push(ProviderConfig {
            name,
            kind,
            project: entry.project,
            zones: entry.zones,
            access_token_env: entry
                .access_token_env
                .unwrap_or_else(|| DEFAULT_ACCESS_TOKEN_ENV.to_string()),
            scratch_dir,
            storage_dir,
            firewall_rule_name: entry
                .firewall_rule_name
                .unwrap_or_else(|| DEFAULT_FIREWALL_RULE_NAME.to_string()),
            required_ports: entry
                .required_ports
                .unwrap_or_else(|| vec![SSH_PORT, heartbeat_port]),
            vars: entry.vars,
        });
    }
    Ok(providers)
}

fn local_provider(name: &str) -> Result<ProviderConfig> {
    let data = default_data_dir()?;
    Ok(ProviderConfig {
        name: name.to_string(),
        kind: BackendKind::Local,
        project: None,
        zones: Vec::new(),
        access_token_env: DEFAULT_ACCESS_TOKEN_ENV.to_string(),
        scratch_dir: data.join("scratch").to_string_lossy().into_owned(),
        storage_dir: data.join("storage").to_string_lossy().into_owned(),
        firewall_rule_name: DEFAULT_FIREWALL_RULE_NAME.to_string(),
        required_ports: Vec::new(),
        vars: Params::new(),
    })
}

pub fn ensure_database_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create database directory {}", parent.display()))?;
    }
    Ok(())
}

fn read_config_file(path: &Path, required: bool) -> Result<FileConfig> {
    if !path.exists() {
        if required {
            anyhow::bail!("config file not found at {}", path.display());
        }
        return Ok(FileConfig::default());
    }

    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

fn resolve_path(raw: &str, base_dir: Option<&Path>) -> PathBuf {
    let expanded = shellexpand::tilde(raw);
    let path = PathBuf::from(expanded.as_ref());
    if path.is_absolute() {
        return path;
    }
    match base_dir {
        Some(dir) => dir.join(path),
        None => path,
    }
}

fn expand_path(path: PathBuf) -> PathBuf {
    let path_string = path.to_string_lossy().to_string();
    let expanded = shellexpand::tilde(&path_string);
    PathBuf::from(expanded.as_ref())
}

fn config_path_from_env() -> Result<Option<PathBuf>> {
    match std::env::var_os(CONFIG_ENV_VAR) {
        Some(value) => {
            if value.is_empty() {
                anyhow::bail!("{CONFIG_ENV_VAR} is set but empty");
            }
            Ok(Some(PathBuf::from(value)))
        }
        None => Ok(None),
    }
}

fn default_config_path() -> Result<PathBuf> {
    let base = dirs::config_dir().context("failed to resolve config directory")?;
    Ok(base.join(APP_DIR_NAME).join(CONFIG_FILE_NAME))
}

fn default_database_path() -> Result<PathBuf> {
    Ok(default_data_dir()?.join(DATABASE_FILE_NAME))
}

fn default_data_dir() -> Result<PathBuf> {
    let base = dirs::data_dir().context("failed to resolve data directory")?;
    Ok(base.join(APP_DIR_NAME))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::ffi::OsString;
    use std::sync::Mutex;
    use tempfile::TempDir;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    struct EnvVarGuard {
        key: &'static str,
        prev: Option<OsString>,
    }

    impl EnvVarGuard {
        fn set(key: &'static str, value: &str) -> Self {
            let prev = std::env::var_os(key);
            // SAFETY: tests serialize env mutations with ENV_LOCK.
            unsafe {
                std::env::set_var(key, value);
            }
            Self { key, prev }
        }

        fn clear(key: &'static str) -> Self {
            let prev = std::env::var_os(key);
            // SAFETY: tests serialize env mutations with ENV_LOCK.
            unsafe {
                std::env::remove_var(key);
            }
            Self { key, prev }
        }
    }

    impl Drop for EnvVarGuard {
        fn drop(&mut self) {
            // SAFETY: tests serialize env mutations with ENV_LOCK.
            unsafe {
                match &self.prev {
                    Some(value) => std::env::set_var(self.key, value),
                    None => std::env::remove_var(self.key),
                }
            }
        }
    }

    fn write_config(dir: &TempDir, body: &str) -> PathBuf {
        let config_dir = dir.path().join("config");
        fs::create_dir_all(&config_dir).unwrap();
        let path = config_dir.join("dispatchd.toml");
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn missing_required_config_file_errors() {
        let dir = TempDir::new().unwrap();
        let err = read_config_file(&dir.path().join("missing.toml"), true).unwrap_err();
        assert!(err.to_string().contains("config file not found"));
        assert!(
            read_config_file(&dir.path().join("missing.toml"), false)
                .unwrap()
                .providers
                .is_empty()
        );
    }

    #[test]
    fn defaults_apply_and_single_local_provider_is_added() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "database_path = \"db/jobs.sqlite\"\n");

        let LoadResult { config, report } =
            load_with_report(Some(path.clone()), Overrides::default()).unwrap();
        let config_dir = path.parent().unwrap();
        assert_eq!(config.database_path, config_dir.join("db").join("jobs.sqlite"));
        assert_eq!(config.job_check_interval_secs, DEFAULT_JOB_CHECK_INTERVAL_SECS);
        assert_eq!(config.heartbeat_port, 9991);
        assert_eq!(config.heartbeat_miss_threshold, 3);
        assert_eq!(config.operation_timeout_secs, 3600);
        assert_eq!(config.max_dispatch_attempts, 2);
        assert_eq!(config.providers.len(), 1);
        assert_eq!(config.providers[0].name, "local");
        assert_eq!(config.providers[0].kind, BackendKind::Local);
        assert_eq!(report.heartbeat_port.source, ConfigSource::Default);
        assert_eq!(report.database_path.source, ConfigSource::ConfigFile);
    }

    #[test]
    fn providers_defaults_and_automation_are_parsed() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            r#"
database_path = "jobs.sqlite"
heartbeat_miss_threshold = 0

[automation]
roles_path = "roles"
private_key_file = "/keys/dispatch"

[defaults.all]
install = ["sync"]

[defaults.gcp]
machine-type = "n1-standard-4"
install = ["gcsfuse"]

[[providers]]
name = "gcp-main"
type = "gcp"
project = "research"
zones = ["us-east1-b", "us-east1-c"]

[[providers]]
name = "workstation"
type = "local"
scratch_dir = "/data/scratch"
vars = { ansible_python_interpreter = "/usr/bin/python3" }
"#,
        );

        let config = load(Some(path.clone()), Overrides::default()).unwrap();
        assert_eq!(config.heartbeat_miss_threshold, 0);
        assert_eq!(
            config.automation.roles_path,
            Some(path.parent().unwrap().join("roles"))
        );
        assert_eq!(
            config.automation.private_key_file,
            Some(PathBuf::from("/keys/dispatch"))
        );
        assert_eq!(config.automation.playbook_bin, "ansible-playbook");
        assert_eq!(config.defaults["gcp"]["install"], json!(["gcsfuse"]));

        let gcp = &config.providers[0];
        assert_eq!(gcp.kind, BackendKind::Gcp);
        assert_eq!(gcp.zones, vec!["us-east1-b", "us-east1-c"]);
        assert_eq!(gcp.required_ports, vec![22, 9991]);
        assert_eq!(gcp.access_token_env, DEFAULT_ACCESS_TOKEN_ENV);
        assert_eq!(gcp.scratch_dir, REMOTE_SCRATCH_DIR);

        let local = &config.providers[1];
        assert_eq!(local.scratch_dir, "/data/scratch");
        assert_eq!(
            local.vars.get("ansible_python_interpreter"),
            Some(&json!("/usr/bin/python3"))
        );
    }

    #[test]
    fn invalid_provider_entries_are_rejected() {
        let dir = TempDir::new().unwrap();
        let cases = [
            ("[[providers]]\nname = \"x\"\ntype = \"aws\"\n", "invalid type"),
            (
                "[[providers]]\nname = \"g\"\ntype = \"gcp\"\nzones = [\"z\"]\n",
                "needs a project",
            ),
            (
                "[[providers]]\nname = \"g\"\ntype = \"gcp\"\nproject = \"p\"\n",
                "at least one zone",
            ),
            (
                "[[providers]]\nname = \"a\"\ntype = \"local\"\n[[providers]]\nname = \"a\"\ntype = \"local\"\n",
                "more than once",
            ),
        ];
        for (body, expected) in cases {
            let path = write_config(&dir, &format!("database_path = \"x.sqlite\"\n{body}"));
            let err = load(Some(path), Overrides::default()).unwrap_err();
            assert!(
                format!("{err:#}").contains(expected),
                "expected '{expected}' in '{err:#}'"
            );
        }
    }

    #[test]
    fn unknown_keys_fail_parsing() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "database_path = \"x.sqlite\"\nport = 1\n");
        let err = load(Some(path), Overrides::default()).unwrap_err();
        assert!(err.to_string().contains("failed to parse config file"));
    }

    #[test]
    fn cli_overrides_take_precedence_per_field() {
        let dir = TempDir::new().unwrap();
        let path = write_config(
            &dir,
            "database_path = \"db/from_config.sqlite\"\njob_check_interval_secs = 9\nheartbeat_port = 7000\n",
        );

        let LoadResult { config, report } = load_with_report(
            Some(path.clone()),
            Overrides {
                database_path: None,
                job_check_interval_secs: Some(2),
                heartbeat_port: None,
                verbose: Some(true),
            },
        )
        .unwrap();

        assert_eq!(
            config.database_path,
            path.parent().unwrap().join("db").join("from_config.sqlite")
        );
        assert_eq!(config.job_check_interval_secs, 2);
        assert_eq!(config.heartbeat_port, 7000);
        assert!(config.verbose);
        assert_eq!(report.job_check_interval_secs.source, ConfigSource::Override);
        assert_eq!(report.heartbeat_port.source, ConfigSource::ConfigFile);
    }

    #[test]
    fn zero_intervals_are_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "database_path = \"x.sqlite\"\njob_check_interval_secs = 0\n");
        assert!(load(Some(path), Overrides::default()).is_err());

        let path = write_config(
            &dir,
            "database_path = \"x.sqlite\"\npoll_interval_ms = 500\npoll_max_interval_ms = 100\n",
        );
        assert!(load(Some(path), Overrides::default()).is_err());
    }

    #[test]
    fn ensure_database_dir_creates_parent_directory() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("nested").join("dispatchd.sqlite");
        ensure_database_dir(&db_path).unwrap();
        assert!(dir.path().join("nested").is_dir());
        ensure_database_dir(Path::new("dispatchd.sqlite")).unwrap();
    }

    #[test]
    fn env_config_path_used_when_no_override() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _env = EnvVarGuard::clear(CONFIG_ENV_VAR);
        let dir = TempDir::new().unwrap();
        let path = write_config(&dir, "database_path = \"x.sqlite\"\nheartbeat_port = 7001\n");
        let _env = EnvVarGuard::set(CONFIG_ENV_VAR, path.to_str().unwrap());

        let LoadResult { config, report } = load_with_report(None, Overrides::default()).unwrap();
        assert_eq!(config.heartbeat_port, 7001);
        assert_eq!(config.config_path, Some(path));
        assert_eq!(report.config_path_source, Some(ConfigSource::Env));
    }

    #[test]
    fn cli_config_path_takes_precedence_over_env() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _env = EnvVarGuard::clear(CONFIG_ENV_VAR);
        let dir = TempDir::new().unwrap();
        let env_path = dir.path().join("env.toml");
        let cli_path = dir.path().join("cli.toml");
        fs::write(&env_path, "database_path = \"x.sqlite\"\nheartbeat_port = 7001\n").unwrap();
        fs::write(&cli_path, "database_path = \"x.sqlite\"\nheartbeat_port = 7002\n").unwrap();
        let _env = EnvVarGuard::set(CONFIG_ENV_VAR, env_path.to_str().unwrap());

        let LoadResult { config, report } =
            load_with_report(Some(cli_path.clone()), Overrides::default()).unwrap();
        assert_eq!(config.heartbeat_port, 7002);
        assert_eq!(report.config_path_source, Some(ConfigSource::Override));
    }
}
