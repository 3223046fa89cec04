use anyhow::{Context, Result, bail};
use reconcile::{RetryPolicy, RunOptions};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file name, looked up in the working directory and then `config_dir()`
pub const CONFIG_FILE: &str = "converge.toml";

/// Environment variable overriding [`Config::stack`]
pub const ENV_STACK: &str = "CONVERGE_STACK";
/// Environment variable overriding [`Config::jobs`]
pub const ENV_JOBS: &str = "CONVERGE_JOBS";
/// Environment variable overriding [`Config::state_dir`]
pub const ENV_STATE_DIR: &str = "CONVERGE_STATE_DIR";

/// Get the config directory path (~/.config/converge)
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".config").join("converge"))
}

/// Get the default state directory path (~/.local/state/converge)
pub fn default_state_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".local").join("state").join("converge"))
}

// ============================================================================
// Config
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Stack (deployment) name; also names the state file
    pub stack: String,

    /// Directory holding `<stack>.json` state files; `~` is expanded
    pub state_dir: Option<String>,

    /// Maximum provider operations in flight
    pub jobs: usize,

    /// Deadline for each provider call, in seconds; 0 disables it
    pub operation_timeout_secs: u64,

    pub retry: RetrySettings,

    /// Expand `$VAR` references in declaration string literals
    pub expand_env: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            stack: "dev".to_string(),
            state_dir: None,
            jobs: 4,
            operation_timeout_secs: 20 * 60,
            retry: RetrySettings::default(),
            expand_env: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 2_000,
            backoff_factor: 2.0,
            max_delay_ms: 60_000,
        }
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            base_delay: Duration::from_millis(settings.base_delay_ms),
            backoff_factor: settings.backoff_factor,
            max_delay: Duration::from_millis(settings.max_delay_ms),
        }
    }
}

impl Config {
    /// Load `converge.toml` from the working directory or `config_dir()`,
    /// falling back to defaults, then apply environment overrides
    pub fn load() -> Result<Self> {
        let local = PathBuf::from(CONFIG_FILE);
        let path = if local.exists() {
            Some(local)
        } else {
            let global = config_dir()?.join(CONFIG_FILE);
            global.exists().then_some(global)
        };

        let mut config = match path {
            Some(path) => Self::load_from(&path)?,
            None => {
                log::debug!("No {CONFIG_FILE} found, using defaults");
                Self::default()
            }
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config file without environment overrides
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config = Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        log::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `CONVERGE_*` overrides read through `lookup`
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(stack) = lookup(ENV_STACK) {
            self.stack = stack;
        }
        if let Some(jobs) = lookup(ENV_JOBS) {
            self.jobs = jobs
                .trim()
                .parse()
                .with_context(|| format!("{ENV_JOBS} must be a positive integer, got '{jobs}'"))?;
        }
        if let Some(dir) = lookup(ENV_STATE_DIR) {
            self.state_dir = Some(dir);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.stack.is_empty() {
            bail!("Stack name must not be empty");
        }
        if let Some(bad) = self
            .stack
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
        {
            bail!("Stack name '{}' contains invalid character '{bad}'", self.stack);
        }
        if self.jobs == 0 {
            bail!("jobs must be at least 1");
        }
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        Ok(())
    }

    /// State directory with `~` expanded
    pub fn state_dir(&self) -> Result<PathBuf> {
        match &self.state_dir {
            Some(dir) => Ok(PathBuf::from(shellexpand::tilde(dir).as_ref())),
            None => default_state_dir(),
        }
    }

    /// State file for the configured stack
    pub fn state_file(&self) -> Result<PathBuf> {
        Ok(self.state_dir()?.join(format!("{}.json", self.stack)))
    }

    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            max_concurrency: self.jobs,
            retry: RetryPolicy::from(&self.retry),
            operation_timeout: (self.operation_timeout_secs > 0)
                .then(|| Duration::from_secs(self.operation_timeout_secs)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.stack, "dev");
        assert_eq!(config.jobs, 4);
        assert!(config.expand_env);
        assert!(config.validate().is_ok());

        let options = config.run_options();
        assert_eq!(options.max_concurrency, 4);
        assert_eq!(options.retry.max_attempts, 5);
        assert_eq!(options.operation_timeout, Some(Duration::from_secs(1200)));
    }

    #[test]
    fn test_parse_partial_toml() {
        let config = Config::from_toml(
            r#"
stack = "ci"
jobs = 8
operation_timeout_secs = 0

[retry]
max_attempts = 3
base_delay_ms = 500
"#,
        )
        .unwrap();

        assert_eq!(config.stack, "ci");
        assert_eq!(config.jobs, 8);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.max_delay_ms, 60_000);

        let options = config.run_options();
        assert_eq!(options.operation_timeout, None);
        assert_eq!(options.retry.base_delay, Duration::from_millis(500));
    }

    #[test]
    fn test_env_overrides() {
        let env = HashMap::from([
            (ENV_STACK, "prod"),
            (ENV_JOBS, " 2 "),
            (ENV_STATE_DIR, "/var/lib/converge"),
        ]);
        let mut config = Config::default();
        config
            .apply_overrides(|key| env.get(key).map(ToString::to_string))
            .unwrap();

        assert_eq!(config.stack, "prod");
        assert_eq!(config.jobs, 2);
        assert_eq!(
            config.state_file().unwrap(),
            PathBuf::from("/var/lib/converge/prod.json")
        );
    }

    #[test]
    fn test_invalid_jobs_override() {
        let mut config = Config::default();
        let err = config
            .apply_overrides(|key| (key == ENV_JOBS).then(|| "many".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains(ENV_JOBS));
    }

    #[test]
    fn test_validation() {
        assert!(Config::from_toml("stack = \"a/b\"").is_err());
        assert!(Config::from_toml("stack = \"\"").is_err());
        assert!(Config::from_toml("jobs = 0").is_err());
        assert!(Config::from_toml("stack = \"ci-2024.1\"").is_ok());
    }

    #[test]
    fn test_state_dir_expands_tilde() {
        let config = Config {
            state_dir: Some("~/state".into()),
            ..Config::default()
        };
        let dir = config.state_dir().unwrap();
        assert!(!dir.to_string_lossy().contains('~'));
        assert!(dir.ends_with("state"));
    }
}
