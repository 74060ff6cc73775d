use calc_engine::platform::HostEndpoint;
use calc_engine::types::EventSet;
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const ENV_PREFIX: &str = "CALCCTL";

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    #[serde(default = "default_dev_env")]
    pub dev_env: String,

    pub engine: HostConfig,
    #[serde(default)]
    pub authoring: AuthoringConfig,
    pub calculation: CalculationDefaults,
    /// Text template for documents saved without an authoring host.
    #[serde(default)]
    pub template: Option<PathBuf>,
    pub logging: LoggingConfig,

    // Injected through the environment, never written back out
    #[serde(default, skip_serializing)]
    license_user: Option<String>,
    #[serde(default, skip_serializing)]
    license_password: Option<String>,
}

impl AppConfig {
    pub fn license_user(&self) -> Option<&str> {
        self.license_user.as_deref()
    }

    pub fn license_password(&self) -> Option<&str> {
        self.license_password.as_deref()
    }

    /// Values the log writer must never print.
    pub fn secrets(&self) -> Vec<String> {
        self.license_password
            .iter()
            .filter(|s| !s.is_empty())
            .cloned()
            .collect()
    }
}

/// Configuration safe to print: secrets stripped.
#[derive(Debug, Serialize, Deserialize)]
pub struct PublicConfig {
    pub dev_env: String,
    pub engine: HostConfig,
    pub authoring: AuthoringConfig,
    pub calculation: CalculationDefaults,
    pub template: Option<PathBuf>,
    pub license_configured: bool,
}

impl From<&AppConfig> for PublicConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            dev_env: config.dev_env.clone(),
            engine: config.engine.clone(),
            authoring: config.authoring.clone(),
            calculation: config.calculation.clone(),
            template: config.template.clone(),
            license_configured: config.license_user.is_some()
                || config.license_password.is_some(),
        }
    }
}

fn default_dev_env() -> String {
    "dev".to_string()
}

/// A host process to start, or a socket where one already listens.
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct HostConfig {
    #[serde(default)]
    pub program: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub socket: Option<PathBuf>,
}

impl HostConfig {
    /// A socket wins over a program when both are set.
    pub fn endpoint(&self) -> Option<HostEndpoint> {
        if let Some(path) = &self.socket {
            return Some(HostEndpoint::Socket { path: path.clone() });
        }
        self.program
            .as_ref()
            .filter(|p| !p.is_empty())
            .map(|program| HostEndpoint::Spawn {
                program: program.clone(),
                args: self.args.clone(),
            })
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct AuthoringConfig {
    #[serde(default)]
    pub host: HostConfig,
    #[serde(default)]
    pub visible: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum OnErrorPolicy {
    #[default]
    Ask,
    Continue,
    Abort,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CalculationDefaults {
    #[serde(default)]
    pub show_ui: bool,
    #[serde(default)]
    pub render: bool,
    #[serde(default)]
    pub events: EventSet,
    #[serde(default)]
    pub on_error: OnErrorPolicy,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    pub verbose: bool,
    pub format: LoggingFormatConfig,
    pub levels: LoggingLevelsConfig,
    #[serde(default)]
    pub redaction: RedactionConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingFormatConfig {
    pub show_time: bool,
    /// One JSON object per line instead of the human format.
    #[serde(default)]
    pub json: bool,
    pub location: LoggingLocationConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingLocationConfig {
    pub enabled: bool,
    pub show_file: bool,
    pub show_line: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingLevelsConfig {
    pub debug: bool,
    pub info: bool,
    pub warning: bool,
    pub error: bool,
    pub critical: bool,
}

#[derive(Debug, Deserialize, Serialize, Default, Clone)]
pub struct RedactionConfig {
    #[serde(default = "true_default")]
    pub enabled: bool,
    #[serde(default)]
    pub patterns: Vec<RedactionPattern>,
}

fn true_default() -> bool {
    true
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RedactionPattern {
    pub name: String,
    pub regex: String,
    pub placeholder: String,
}

/// Directory holding `global_config.yaml`: explicit, then the working
/// directory, then this crate's own directory.
fn config_dir(explicit: Option<&Path>) -> PathBuf {
    if let Some(dir) = explicit {
        return dir.to_path_buf();
    }
    if Path::new("global_config.yaml").exists() {
        return PathBuf::from(".");
    }
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
}

pub fn load_config(explicit_dir: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let dir = config_dir(explicit_dir);

    let builder = Config::builder()
        // Defaults (mandatory)
        .add_source(File::from(dir.join("global_config.yaml")).required(true))
        .add_source(File::from(dir.join("production_config.yaml")).required(false))
        // Local override, not checked in
        .add_source(File::from(dir.join(".global_config.yaml")).required(false))
        // CALCCTL__ENGINE__PROGRAM=calc-host
        .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    builder.build()?.try_deserialize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    struct EnvGuard(&'static str);

    impl EnvGuard {
        fn new(key: &'static str, val: &str) -> Self {
            env::set_var(key, val);
            Self(key)
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            env::remove_var(self.0);
        }
    }

    #[test]
    #[serial]
    fn test_load_config() {
        let config = load_config(None);
        assert!(config.is_ok(), "Failed to load config: {:?}", config.err());

        let config = config.unwrap();
        assert_eq!(config.engine.program.as_deref(), Some("calc-host"));
        assert_eq!(config.calculation.on_error, OnErrorPolicy::Ask);
        assert!(config.calculation.events.any());
        assert!(config.license_user().is_none());
    }

    #[test]
    #[serial]
    fn test_env_var_override_precedence() {
        let _guard = EnvGuard::new("CALCCTL__ENGINE__PROGRAM", "/opt/engine/host");
        let config = load_config(None).expect("Should load config");
        assert_eq!(config.engine.program.as_deref(), Some("/opt/engine/host"));
    }

    #[test]
    #[serial]
    fn test_type_coercion_boolean() {
        {
            let _guard = EnvGuard::new("CALCCTL__CALCULATION__RENDER", "true");
            let config = load_config(None).expect("Should load config");
            assert!(config.calculation.render);
        }
        {
            let _guard = EnvGuard::new("CALCCTL__CALCULATION__EVENTS__PROGRESS", "0");
            let config = load_config(None).expect("Should load config");
            assert!(!config.calculation.events.progress);
        }
    }

    #[test]
    #[serial]
    fn test_license_loaded_from_env_and_never_printed() {
        let _user = EnvGuard::new("CALCCTL__LICENSE_USER", "eng");
        let _pw = EnvGuard::new("CALCCTL__LICENSE_PASSWORD", "hunter2-licence");

        let config = load_config(None).expect("Should load config");
        assert_eq!(config.license_user(), Some("eng"));
        assert_eq!(config.secrets(), vec!["hunter2-licence".to_string()]);

        let public = serde_json::to_string(&PublicConfig::from(&config)).unwrap();
        assert!(!public.contains("hunter2-licence"));
        assert!(public.contains("\"license_configured\":true"));
        let full = serde_json::to_string(&config).unwrap();
        assert!(!full.contains("hunter2-licence"));
    }

    #[test]
    #[serial]
    fn test_on_error_policy_from_env() {
        let _guard = EnvGuard::new("CALCCTL__CALCULATION__ON_ERROR", "abort");
        let config = load_config(None).expect("Should load config");
        assert_eq!(config.calculation.on_error, OnErrorPolicy::Abort);
    }

    #[test]
    fn test_endpoint_resolution() {
        let mut host = HostConfig {
            program: Some("calc-host".into()),
            args: vec!["--stdio".into()],
            socket: None,
        };
        assert_eq!(
            host.endpoint(),
            Some(HostEndpoint::Spawn {
                program: "calc-host".into(),
                args: vec!["--stdio".into()]
            })
        );
        host.socket = Some(PathBuf::from("/run/calc.sock"));
        assert_eq!(
            host.endpoint(),
            Some(HostEndpoint::Socket {
                path: PathBuf::from("/run/calc.sock")
            })
        );
        assert_eq!(HostConfig::default().endpoint(), None);
    }
}
