use crate::session::LinkOptions;
use crate::supervisor::SupervisorOptions;
use crate::window::TitleMatcher;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILE: &str = "config.toml";
const ENV_PREFIX: &str = "CALLREC_";

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct Config {
    pub obs: ObsConfig,
    pub watch: WatchConfig,
    pub reconnect: ReconnectConfig,
    pub shutdown: ShutdownConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObsConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout_ms: u64,
    pub identify_timeout_ms: u64,
    pub command_timeout_ms: u64,
    pub sync_record_status: bool,
    pub auto_detect_process: bool,
    pub process_name: String,
}

impl Default for ObsConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4455,
            connect_timeout_ms: 5000,
            identify_timeout_ms: 5000,
            command_timeout_ms: 10_000,
            sync_record_status: true,
            auto_detect_process: true,
            process_name: default_process_name().to_string(),
        }
    }
}

fn default_process_name() -> &'static str {
    if cfg!(windows) {
        "obs64.exe"
    } else {
        "obs"
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WatchConfig {
    pub app_name: String,
    pub indicators: Vec<String>,
    pub poll_interval_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            app_name: "WhatsApp".to_string(),
            indicators: vec!["call".to_string(), "end-to-end".to_string()],
            poll_interval_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub enabled: bool,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ShutdownConfig {
    pub stop_grace_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            stop_grace_ms: 2000,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self, Box<dyn std::error::Error>> {
        let mut config = Self::default();
        let config_path = active_config_path();

        if let Ok(raw) = fs::read_to_string(&config_path) {
            match toml::from_str::<Config>(&raw) {
                Ok(file_config) => config = file_config,
                Err(err) => tracing::warn!(
                    path = %config_path.display(),
                    error = %err,
                    "ignoring unreadable config file"
                ),
            }
        }

        config.apply_env_overrides();

        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| env::var(format!("{}{}", ENV_PREFIX, key)).ok());
    }

    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        // OBS connection
        if let Some(val) = lookup("OBS_HOST") {
            self.obs.host = val;
        }
        if let Some(port) = lookup("OBS_PORT").and_then(|v| v.parse().ok()) {
            self.obs.port = port;
        }
        if let Some(ms) = lookup("OBS_CONNECT_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.obs.connect_timeout_ms = ms;
        }
        if let Some(ms) = lookup("OBS_IDENTIFY_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.obs.identify_timeout_ms = ms;
        }
        if let Some(ms) = lookup("OBS_COMMAND_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            self.obs.command_timeout_ms = ms;
        }
        if let Some(val) = lookup("OBS_SYNC_RECORD_STATUS") {
            self.obs.sync_record_status = val.parse().unwrap_or(true);
        }
        if let Some(val) = lookup("OBS_AUTO_DETECT") {
            self.obs.auto_detect_process = val.parse().unwrap_or(true);
        }
        if let Some(val) = lookup("OBS_PROCESS_NAME") {
            self.obs.process_name = val;
        }

        // Window matching
        if let Some(val) = lookup("WATCH_APP_NAME") {
            self.watch.app_name = val;
        }
        if let Some(val) = lookup("WATCH_INDICATORS") {
            self.watch.indicators = val
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(ms) = lookup("POLL_INTERVAL_MS").and_then(|v| v.parse().ok()) {
            self.watch.poll_interval_ms = ms;
        }

        // Reconnect
        if let Some(val) = lookup("RECONNECT_ENABLED") {
            self.reconnect.enabled = val.parse().unwrap_or(true);
        }
        if let Some(ms) = lookup("RECONNECT_INITIAL_DELAY_MS").and_then(|v| v.parse().ok()) {
            self.reconnect.initial_delay_ms = ms;
        }
        if let Some(ms) = lookup("RECONNECT_MAX_DELAY_MS").and_then(|v| v.parse().ok()) {
            self.reconnect.max_delay_ms = ms;
        }

        if let Some(ms) = lookup("STOP_GRACE_MS").and_then(|v| v.parse().ok()) {
            self.shutdown.stop_grace_ms = ms;
        }
    }

    pub fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.obs.host.trim().is_empty() {
            return Err("obs.host must be set".into());
        }
        if self.obs.port == 0 {
            return Err("obs.port must be non-zero".into());
        }
        if self.obs.connect_timeout_ms == 0 {
            return Err("obs.connect_timeout_ms must be non-zero".into());
        }
        if self.obs.identify_timeout_ms == 0 {
            return Err("obs.identify_timeout_ms must be non-zero".into());
        }
        if self.obs.command_timeout_ms == 0 {
            return Err("obs.command_timeout_ms must be non-zero".into());
        }
        if self.obs.auto_detect_process && self.obs.process_name.trim().is_empty() {
            return Err("obs.process_name is required when obs.auto_detect_process = true".into());
        }
        if self.watch.app_name.trim().is_empty() {
            return Err("watch.app_name must be set".into());
        }
        if self.watch.indicators.iter().all(|s| s.trim().is_empty()) {
            return Err("watch.indicators must contain at least one non-empty entry".into());
        }
        if self.watch.poll_interval_ms < 100 {
            return Err("watch.poll_interval_ms must be >= 100".into());
        }
        if self.reconnect.initial_delay_ms == 0 {
            return Err("reconnect.initial_delay_ms must be non-zero".into());
        }
        if self.reconnect.initial_delay_ms > self.reconnect.max_delay_ms {
            return Err("reconnect.initial_delay_ms must not exceed reconnect.max_delay_ms".into());
        }
        Ok(())
    }

    pub fn write_default<P: AsRef<Path>>(path: P) -> Result<(), Box<dyn std::error::Error>> {
        if path.as_ref().exists() {
            return Err("config.toml already exists".into());
        }
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let data = toml::to_string_pretty(&Config::default())?;
        fs::write(path, data)?;
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        managed_config_path()
    }

    pub fn obs_url(&self) -> String {
        format!("ws://{}:{}", self.obs.host, self.obs.port)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.watch.poll_interval_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown.stop_grace_ms)
    }

    /// Upper bound on waiting for the connection task at exit. A connect
    /// attempt in flight cannot be closed early, so this outlasts it.
    pub fn shutdown_wait(&self) -> Duration {
        Duration::from_millis(self.obs.connect_timeout_ms) + Duration::from_secs(2)
    }

    pub fn link_options(&self) -> LinkOptions {
        LinkOptions {
            command_timeout: Duration::from_millis(self.obs.command_timeout_ms),
            identify_timeout: Duration::from_millis(self.obs.identify_timeout_ms),
            sync_record_status: self.obs.sync_record_status,
        }
    }

    pub fn title_matcher(&self) -> TitleMatcher {
        TitleMatcher::new(self.watch.app_name.clone(), &self.watch.indicators)
    }

    pub fn supervisor_options(&self) -> SupervisorOptions {
        SupervisorOptions {
            url: self.obs_url(),
            connect_timeout: Duration::from_millis(self.obs.connect_timeout_ms),
            reconnect: self.reconnect.enabled,
            initial_delay: Duration::from_millis(self.reconnect.initial_delay_ms),
            max_delay: Duration::from_millis(self.reconnect.max_delay_ms),
            process_name: self
                .obs
                .auto_detect_process
                .then(|| self.obs.process_name.clone()),
            process_check_interval: Duration::from_secs(2),
        }
    }
}

fn managed_config_path() -> PathBuf {
    if let Ok(path) = env::var(format!("{}CONFIG_PATH", ENV_PREFIX)) {
        return PathBuf::from(path);
    }
    let appdata = env::var("APPDATA").unwrap_or_else(|_| ".".to_string());
    Path::new(&appdata).join("CallRecorder").join(CONFIG_FILE)
}

fn active_config_path() -> PathBuf {
    let local = PathBuf::from(CONFIG_FILE);
    if local.exists() {
        local
    } else {
        managed_config_path()
    }
}
