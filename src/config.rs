use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Front end server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Default settings shared by every sub-application
    #[serde(default)]
    pub defaults: AppDefaults,

    /// Language-model credential handed to the children
    #[serde(default)]
    pub credentials: CredentialsConfig,

    /// Sub-applications keyed by logical name
    #[serde(default)]
    pub apps: BTreeMap<String, AppConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Listen port of the front end (default: 8000)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Maximum idle connections kept per child (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppDefaults {
    /// Executable used to launch a sub-application
    #[serde(default = "default_command")]
    pub command: String,

    /// Arguments placed between the executable and `run`
    #[serde(default)]
    pub args: Vec<String>,

    /// Pass `--server.headless true` to the child
    #[serde(default = "default_headless")]
    pub headless: bool,

    /// Overall time to wait for a child to accept connections, in seconds
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Readiness poll cadence in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Bound on a single readiness probe in milliseconds
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,

    /// Max time to wait for a child's response, in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Grace period in seconds between SIGTERM and SIGKILL
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,

    /// Optional HTTP path probed instead of a bare TCP connect
    pub health_path: Option<String>,
}

impl Default for AppDefaults {
    fn default() -> Self {
        Self {
            command: default_command(),
            args: Vec::new(),
            headless: default_headless(),
            startup_timeout_secs: default_startup_timeout(),
            poll_interval_ms: default_poll_interval(),
            probe_timeout_ms: default_probe_timeout(),
            request_timeout_secs: default_request_timeout(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
            health_path: None,
        }
    }
}

impl AppDefaults {
    /// Timing values that must be non-zero
    fn timing_fields(&self) -> [(&'static str, u64); 4] {
        [
            ("startup_timeout_secs", self.startup_timeout_secs),
            ("poll_interval_ms", self.poll_interval_ms),
            ("probe_timeout_ms", self.probe_timeout_ms),
            ("request_timeout_secs", self.request_timeout_secs),
        ]
    }

    pub fn validate(&self) -> Vec<String> {
        self.timing_fields()
            .into_iter()
            .filter(|(_, value)| *value == 0)
            .map(|(field, _)| format!("defaults: '{}' must be greater than 0", field))
            .collect()
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CredentialsConfig {
    /// Environment variable holding the language-model API key
    #[serde(default = "default_credential_env_var")]
    pub env_var: String,

    /// Refuse to start when the variable is missing (default: true)
    #[serde(default = "default_true")]
    pub required: bool,

    /// Load a `.env` file from the working directory first (default: true)
    #[serde(default = "default_true")]
    pub dotenv: bool,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            env_var: default_credential_env_var(),
            required: true,
            dotenv: true,
        }
    }
}

/// Configuration for a single sub-application
///
/// # Security Warning
///
/// `command` and `args` are executed directly. Configuration files must be
/// readable and writable only by the service user.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    /// Script handed to `<command> run`
    pub script: String,

    /// Port the child is told to listen on
    pub port: u16,

    /// Name shown on the landing page (defaults to the logical name)
    pub display_name: Option<String>,

    /// Executable (overrides default)
    pub command: Option<String>,

    /// Leading arguments (overrides default)
    pub args: Option<Vec<String>>,

    /// Headless flag (overrides default)
    pub headless: Option<bool>,

    /// Working directory for the child; relative scripts resolve against it
    pub working_dir: Option<String>,

    /// Extra environment variables for the child
    #[serde(default)]
    pub env: HashMap<String, String>,

    pub startup_timeout_secs: Option<u64>,

    pub poll_interval_ms: Option<u64>,

    pub probe_timeout_ms: Option<u64>,

    pub request_timeout_secs: Option<u64>,

    pub shutdown_grace_period_secs: Option<u64>,

    pub health_path: Option<String>,
}

impl AppConfig {
    /// Create an app config that inherits every default
    pub fn new(script: &str, port: u16) -> Self {
        Self {
            script: script.to_string(),
            port,
            display_name: None,
            command: None,
            args: None,
            headless: None,
            working_dir: None,
            env: HashMap::new(),
            startup_timeout_secs: None,
            poll_interval_ms: None,
            probe_timeout_ms: None,
            request_timeout_secs: None,
            shutdown_grace_period_secs: None,
            health_path: None,
        }
    }

    /// Set the executable and its leading arguments (builder pattern)
    pub fn with_command(mut self, command: &str, args: Vec<String>) -> Self {
        self.command = Some(command.to_string());
        self.args = Some(args);
        self
    }

    /// Set the display name (builder pattern)
    pub fn with_display_name(mut self, name: &str) -> Self {
        self.display_name = Some(name.to_string());
        self
    }

    /// Set environment variables (builder pattern)
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Set working directory (builder pattern)
    pub fn with_working_dir(mut self, dir: &str) -> Self {
        self.working_dir = Some(dir.to_string());
        self
    }

    pub fn command<'a>(&'a self, defaults: &'a AppDefaults) -> &'a str {
        self.command.as_deref().unwrap_or(&defaults.command)
    }

    pub fn startup_timeout(&self, defaults: &AppDefaults) -> Duration {
        Duration::from_secs(self.startup_timeout_secs.unwrap_or(defaults.startup_timeout_secs))
    }

    pub fn poll_interval(&self, defaults: &AppDefaults) -> Duration {
        Duration::from_millis(self.poll_interval_ms.unwrap_or(defaults.poll_interval_ms))
    }

    pub fn probe_timeout(&self, defaults: &AppDefaults) -> Duration {
        Duration::from_millis(self.probe_timeout_ms.unwrap_or(defaults.probe_timeout_ms))
    }

    pub fn request_timeout(&self, defaults: &AppDefaults) -> Duration {
        Duration::from_secs(self.request_timeout_secs.unwrap_or(defaults.request_timeout_secs))
    }

    pub fn shutdown_grace_period(&self, defaults: &AppDefaults) -> Duration {
        Duration::from_secs(
            self.shutdown_grace_period_secs
                .unwrap_or(defaults.shutdown_grace_period_secs),
        )
    }

    /// Script path as the child will see it
    pub fn script_path(&self) -> PathBuf {
        match self.working_dir {
            Some(ref dir) => Path::new(dir).join(&self.script),
            None => PathBuf::from(&self.script),
        }
    }

    /// Validate one app, returning every problem found
    pub fn validate(&self, name: &str, defaults: &AppDefaults) -> Vec<String> {
        let mut errors = Vec::new();

        if !is_valid_app_name(name) {
            errors.push(format!(
                "App '{}': name must be non-empty and use only letters, digits, '-' or '_'",
                name
            ));
        }

        if self.port == 0 {
            errors.push(format!("App '{}': 'port' must be greater than 0", name));
        }

        let overrides = [
            ("startup_timeout_secs", self.startup_timeout_secs),
            ("poll_interval_ms", self.poll_interval_ms),
            ("probe_timeout_ms", self.probe_timeout_ms),
            ("request_timeout_secs", self.request_timeout_secs),
        ];
        for (field, value) in overrides {
            if value == Some(0) {
                errors.push(format!("App '{}': '{}' must be greater than 0", name, field));
            }
        }

        if self.script.trim().is_empty() {
            errors.push(format!("App '{}': 'script' must not be empty", name));
        } else if !self.script_path().is_file() {
            errors.push(format!(
                "App '{}': script '{}' does not exist",
                name,
                self.script_path().display()
            ));
        }

        if let Some(ref dir) = self.working_dir {
            if !Path::new(dir).is_dir() {
                errors.push(format!("App '{}': working_dir '{}' is not a directory", name, dir));
            }
        }

        let command = self.command(defaults);
        if find_executable(command).is_none() {
            errors.push(format!("App '{}': command '{}' not found", name, command));
        }

        errors
    }
}

/// Immutable, fully resolved description of a sub-application.
///
/// Built once at startup from [`AppConfig`] plus [`AppDefaults`].
#[derive(Debug, Clone)]
pub struct AppDescriptor {
    pub name: String,
    pub display_name: String,
    pub command: String,
    pub args: Vec<String>,
    pub script: String,
    pub port: u16,
    pub headless: bool,
    pub working_dir: Option<PathBuf>,
    pub env: HashMap<String, String>,
    pub startup_timeout: Duration,
    pub poll_interval: Duration,
    pub probe_timeout: Duration,
    pub request_timeout: Duration,
    pub shutdown_grace_period: Duration,
    pub health_path: Option<String>,
}

impl AppDescriptor {
    pub fn resolve(name: &str, app: &AppConfig, defaults: &AppDefaults) -> Self {
        Self {
            name: name.to_string(),
            display_name: app.display_name.clone().unwrap_or_else(|| name.to_string()),
            command: app.command(defaults).to_string(),
            args: app.args.clone().unwrap_or_else(|| defaults.args.clone()),
            script: app.script.clone(),
            port: app.port,
            headless: app.headless.unwrap_or(defaults.headless),
            working_dir: app.working_dir.as_ref().map(PathBuf::from),
            env: app.env.clone(),
            startup_timeout: app.startup_timeout(defaults),
            poll_interval: app.poll_interval(defaults),
            probe_timeout: app.probe_timeout(defaults),
            request_timeout: app.request_timeout(defaults),
            shutdown_grace_period: app.shutdown_grace_period(defaults),
            health_path: app.health_path.clone().or_else(|| defaults.health_path.clone()),
        }
    }

    /// Arguments passed after the executable:
    /// `[args...] run <script> --server.port <port> [--server.headless true]`
    pub fn child_args(&self) -> Vec<String> {
        let mut argv = self.args.clone();
        argv.push("run".to_string());
        argv.push(self.script.clone());
        argv.push("--server.port".to_string());
        argv.push(self.port.to_string());
        if self.headless {
            argv.push("--server.headless".to_string());
            argv.push("true".to_string());
        }
        argv
    }
}

fn default_listen_port() -> u16 {
    8000
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_command() -> String {
    "streamlit".to_string()
}

fn default_headless() -> bool {
    true
}

fn default_startup_timeout() -> u64 {
    15
}

fn default_poll_interval() -> u64 {
    500
}

fn default_probe_timeout() -> u64 {
    1000
}

fn default_request_timeout() -> u64 {
    30
}

fn default_shutdown_grace_period() -> u64 {
    5
}

fn default_credential_env_var() -> String {
    "GROQ_API_KEY".to_string()
}

fn default_true() -> bool {
    true
}

/// Names appear in URLs (`/apps/<name>/`), so keep them path-safe
pub fn is_valid_app_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Resolve a command the way `execvp` would: paths are checked directly,
/// bare names are searched on `PATH`.
pub fn find_executable(command: &str) -> Option<PathBuf> {
    if command.is_empty() {
        return None;
    }

    let candidate = Path::new(command);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }

    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(command))
        .find(|path| path.is_file())
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.apps.is_empty() {
            errors.push("No apps configured".to_string());
        }

        errors.extend(self.defaults.validate());

        let mut ports: HashMap<u16, &str> = HashMap::new();
        for (name, app) in &self.apps {
            errors.extend(app.validate(name, &self.defaults));

            if app.port != 0 && app.port == self.server.port {
                errors.push(format!(
                    "App '{}': port {} collides with the server port",
                    name, app.port
                ));
            }
            if let Some(other) = ports.insert(app.port, name) {
                errors.push(format!(
                    "App '{}': port {} is already used by app '{}'",
                    name, app.port, other
                ));
            }
        }

        if self.credentials.env_var.trim().is_empty() {
            errors.push("credentials.env_var must not be empty".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    /// Resolve every app into its immutable descriptor
    pub fn descriptors(&self) -> Vec<AppDescriptor> {
        self.apps
            .iter()
            .map(|(name, app)| AppDescriptor::resolve(name, app, &self.defaults))
            .collect()
    }
}
