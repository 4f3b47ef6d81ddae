use hyper::Uri;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the proxy
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// The supervised backend
    pub process: ProcessConfig,

    /// Readiness polling after a (re)start
    #[serde(default)]
    pub readiness: ReadinessConfig,

    /// Output capture settings
    #[serde(default)]
    pub capture: CaptureConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// HTTP port (default: 8080)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Max time to wait for the backend to respond to a forwarded request
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Maximum idle connections to the backend (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            request_timeout_secs: default_request_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

/// Commands and address of the supervised backend
///
/// # Security Warning
///
/// `check`, `build` and `run` are handed to a shell verbatim, and `check` runs
/// on every proxied request. Configuration files must be protected with
/// appropriate file permissions.
#[derive(Debug, Deserialize, Clone)]
pub struct ProcessConfig {
    /// Freshness check. Exit 0 = fresh, 1 = rebuild, 2 = restart, anything else = fresh
    pub check: String,

    /// Build command, expected to terminate
    pub build: String,

    /// Run command, expected to be long-lived and to listen on `target`
    pub run: String,

    /// Backend URL, used as the proxy upstream and as the readiness probe address
    pub target: String,

    /// Shell used to interpret the commands (default: "bash -c")
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Working directory for all commands
    pub working_dir: Option<String>,

    /// Extra environment variables for all commands
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl ProcessConfig {
    pub fn new(check: &str, build: &str, run: &str, target: &str) -> Self {
        Self {
            check: check.to_string(),
            build: build.to_string(),
            run: run.to_string(),
            target: target.to_string(),
            shell: default_shell(),
            working_dir: None,
            env: HashMap::new(),
        }
    }

    /// Set the shell (builder pattern)
    pub fn with_shell(mut self, shell: &str) -> Self {
        self.shell = shell.to_string();
        self
    }

    /// Set working directory (builder pattern)
    pub fn with_working_dir(mut self, dir: &str) -> Self {
        self.working_dir = Some(dir.to_string());
        self
    }

    /// Set environment variables (builder pattern)
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Parse the target into a URI
    pub fn target_uri(&self) -> anyhow::Result<Uri> {
        let uri: Uri = self
            .target
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid target URL '{}': {}", self.target, e))?;

        if uri.scheme_str() != Some("http") {
            anyhow::bail!("Target URL '{}' must use the http scheme", self.target);
        }
        if uri.authority().is_none() {
            anyhow::bail!("Target URL '{}' must include a host", self.target);
        }

        Ok(uri)
    }

    /// Split the shell setting into program and leading arguments
    pub fn shell_argv(&self) -> anyhow::Result<Vec<String>> {
        let argv = shell_words::split(&self.shell)
            .map_err(|e| anyhow::anyhow!("Invalid shell '{}': {}", self.shell, e))?;
        if argv.is_empty() {
            anyhow::bail!("'shell' must not be empty");
        }
        Ok(argv)
    }

    /// Validate the process configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        for (name, value) in [("check", &self.check), ("build", &self.build), ("run", &self.run)] {
            if value.trim().is_empty() {
                errors.push(format!("process: '{}' command must not be empty", name));
            }
        }

        if let Err(e) = self.target_uri() {
            errors.push(format!("process: {}", e));
        }

        if let Err(e) = self.shell_argv() {
            errors.push(format!("process: {}", e));
        }

        errors
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReadinessConfig {
    /// Delay between readiness probes in milliseconds
    #[serde(default = "default_readiness_interval")]
    pub interval_ms: u64,

    /// Number of probes before giving up
    #[serde(default = "default_readiness_attempts")]
    pub max_attempts: u32,

    /// Timeout for a single probe in milliseconds
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,
}

impl ReadinessConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_readiness_interval(),
            max_attempts: default_readiness_attempts(),
            probe_timeout_ms: default_probe_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CaptureConfig {
    /// Upper bound on captured output per generation, in bytes
    #[serde(default = "default_capture_bytes")]
    pub max_bytes: usize,

    /// Also copy child output to our own stdout/stderr
    #[serde(default = "default_passthrough")]
    pub passthrough: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            max_bytes: default_capture_bytes(),
            passthrough: default_passthrough(),
        }
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    8080
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_shell() -> String {
    "bash -c".to_string()
}

fn default_readiness_interval() -> u64 {
    200
}

fn default_readiness_attempts() -> u32 {
    20
}

fn default_probe_timeout() -> u64 {
    1000
}

fn default_capture_bytes() -> usize {
    1024 * 1024 // 1 MiB
}

fn default_passthrough() -> bool {
    true
}

impl Config {
    /// Configuration with defaults everywhere except the process section
    pub fn with_process(process: ProcessConfig) -> Self {
        Self {
            server: ServerConfig::default(),
            process,
            readiness: ReadinessConfig::default(),
            capture: CaptureConfig::default(),
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = self.process.validate();

        if self.readiness.max_attempts == 0 {
            errors.push("readiness: 'max_attempts' must be greater than 0".to_string());
        }
        if self.readiness.probe_timeout_ms == 0 {
            errors.push("readiness: 'probe_timeout_ms' must be greater than 0".to_string());
        }
        if self.capture.max_bytes == 0 {
            errors.push("capture: 'max_bytes' must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[process]
check = "./check.sh"
build = "go build -o app ."
run = "./app"
target = "http://127.0.0.1:3000"
"#;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
port = 9090
bind = "0.0.0.0"
request_timeout_secs = 5

[process]
check = "make -q"
build = "make"
run = "./server"
target = "http://localhost:4000/api"
shell = "sh -c"
working_dir = "/srv/app"

[process.env]
APP_ENV = "dev"

[readiness]
interval_ms = 100
max_attempts = 50

[capture]
max_bytes = 4096
passthrough = false
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.request_timeout(), Duration::from_secs(5));
        assert_eq!(config.process.check, "make -q");
        assert_eq!(config.process.shell, "sh -c");
        assert_eq!(config.process.working_dir, Some("/srv/app".to_string()));
        assert_eq!(config.process.env.get("APP_ENV"), Some(&"dev".to_string()));
        assert_eq!(config.readiness.interval(), Duration::from_millis(100));
        assert_eq!(config.readiness.max_attempts, 50);
        assert_eq!(config.capture.max_bytes, 4096);
        assert!(!config.capture.passthrough);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config: Config = toml::from_str(MINIMAL).unwrap();

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.server.request_timeout_secs, 30);
        assert_eq!(config.server.pool_max_idle_per_host, 10);
        assert_eq!(config.server.pool_idle_timeout_secs, 90);
        assert_eq!(config.process.shell, "bash -c");
        assert!(config.process.working_dir.is_none());
        assert_eq!(config.readiness.interval(), Duration::from_millis(200));
        assert_eq!(config.readiness.max_attempts, 20);
        assert_eq!(config.readiness.probe_timeout(), Duration::from_secs(1));
        assert_eq!(config.capture.max_bytes, 1024 * 1024);
        assert!(config.capture.passthrough);
    }

    #[test]
    fn test_process_section_is_required() {
        let result: Result<Config, _> = toml::from_str("[server]\nport = 80\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_target_uri() {
        let process = ProcessConfig::new("true", "true", "true", "http://127.0.0.1:3000/base");
        let uri = process.target_uri().unwrap();
        assert_eq!(uri.host(), Some("127.0.0.1"));
        assert_eq!(uri.port_u16(), Some(3000));
        assert_eq!(uri.path(), "/base");
    }

    #[test]
    fn test_target_uri_rejects_bad_urls() {
        let https = ProcessConfig::new("true", "true", "true", "https://example.com");
        assert!(https.target_uri().is_err());

        let no_host = ProcessConfig::new("true", "true", "true", "/just/a/path");
        assert!(no_host.target_uri().is_err());

        let garbage = ProcessConfig::new("true", "true", "true", "http://exa mple");
        assert!(garbage.target_uri().is_err());
    }

    #[test]
    fn test_shell_argv() {
        let process = ProcessConfig::new("true", "true", "true", "http://127.0.0.1:1");
        assert_eq!(process.shell_argv().unwrap(), vec!["bash", "-c"]);

        let quoted = process.clone().with_shell("'/opt/my shell/sh' -e -c");
        assert_eq!(quoted.shell_argv().unwrap(), vec!["/opt/my shell/sh", "-e", "-c"]);

        let empty = process.with_shell("   ");
        assert!(empty.shell_argv().is_err());
    }

    #[test]
    fn test_validate_empty_commands() {
        let config = Config::with_process(ProcessConfig::new("", "make", " ", "http://127.0.0.1:3000"));
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("'check' command must not be empty"));
        assert!(err.contains("'run' command must not be empty"));
        assert!(!err.contains("'build'"));
    }

    #[test]
    fn test_validate_multiple_errors() {
        let mut config = Config::with_process(ProcessConfig::new(
            "true",
            "true",
            "true",
            "ftp://127.0.0.1:3000",
        ));
        config.readiness.max_attempts = 0;
        config.capture.max_bytes = 0;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("http scheme"));
        assert!(err.contains("'max_attempts' must be greater than 0"));
        assert!(err.contains("'max_bytes' must be greater than 0"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rebuildgate.toml");
        std::fs::write(&path, MINIMAL).unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.process.run, "./app");

        std::fs::write(&path, MINIMAL.replace("http://127.0.0.1:3000", "nope")).unwrap();
        assert!(Config::load(&path).is_err());
    }
}
