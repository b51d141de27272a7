//! Gateway configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Configured backends, in declaration order (order breaks priority ties)
    pub backends: Vec<BackendEntry>,

    /// Local endpoint autodiscovery
    pub discovery: DiscoveryConfig,

    /// Capability matcher settings
    pub matcher: MatcherConfig,

    /// Concurrent request pool
    pub pool: PoolConfig,

    /// Fuzzy-edit complexity limits
    pub fuzzy: FuzzyConfig,

    /// Parallel-agents orchestrator defaults
    pub orchestrator: OrchestratorConfig,

    /// Circuit breaker defaults (per adapter)
    pub breaker: BreakerConfig,

    /// Log level (overridden by --log-level)
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,

    /// Enable the metrics dashboard surface in health reports
    pub dashboard: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backends: default_backends(),
            discovery: DiscoveryConfig::default(),
            matcher: MatcherConfig::default(),
            pool: PoolConfig::default(),
            fuzzy: FuzzyConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            breaker: BreakerConfig::default(),
            log_level: None,
            dashboard: false,
        }
    }
}

impl Config {
    /// Load configuration with fallback chain
    ///
    /// Explicit path > project-local `.modelbridge.yml` >
    /// `~/.config/modelbridge/modelbridge.yml` > defaults. Environment
    /// overrides are applied last.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        let mut config = Self::load_unresolved(config_path)?;
        config.apply_env();
        Ok(config)
    }

    fn load_unresolved(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        let local_config = PathBuf::from(".modelbridge.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("modelbridge").join("modelbridge.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Apply recognized environment overrides
    ///
    /// `MB_LOCAL_URL` pins the local endpoint (skips discovery),
    /// `MB_<NAME>_TIMEOUT_MS` overrides one backend's request timeout,
    /// `MB_DASHBOARD` enables the dashboard surface.
    pub fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("MB_LOCAL_URL") {
            self.discovery.endpoint_override = Some(url);
        }

        if let Ok(v) = std::env::var("MB_DASHBOARD") {
            self.dashboard = v == "1" || v.eq_ignore_ascii_case("true");
        }

        for backend in &mut self.backends {
            let var = format!("MB_{}_TIMEOUT_MS", backend.name.to_uppercase().replace('-', "_"));
            if let Ok(v) = std::env::var(&var)
                && let Ok(ms) = v.parse::<u64>()
            {
                tracing::info!(backend = %backend.name, timeout_ms = ms, "Timeout overridden from {}", var);
                backend.settings.timeout_ms = ms;
            }
        }
    }

    /// Look up a backend entry by name
    pub fn backend(&self, name: &str) -> Option<&BackendEntry> {
        self.backends.iter().find(|b| b.name == name)
    }
}

/// The closed set of backend kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Local OpenAI-compatible server, autodiscovered
    Local,
    /// Remote reasoning provider with an internal secondary-model fallback
    Reasoning,
    /// Remote code-specialized provider
    Code,
    /// Remote low-latency provider
    Fast,
    /// Remote premium provider with a declared quota (rate limited)
    Premium,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Reasoning => write!(f, "reasoning"),
            Self::Code => write!(f, "code"),
            Self::Fast => write!(f, "fast"),
            Self::Premium => write!(f, "premium"),
        }
    }
}

/// One configured backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendEntry {
    /// Unique name, referenced by roles and the wire surface
    pub name: String,

    /// Adapter kind
    pub kind: BackendKind,

    /// Disabled entries keep their slot but materialize no adapter
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Lower = preferred in the fallback chain
    #[serde(default)]
    pub priority: i32,

    /// Kind-specific settings
    #[serde(default)]
    pub settings: BackendSettings,
}

/// Per-backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSettings {
    /// Primary model identifier ("" for the local adapter: chosen dynamically)
    pub model: String,

    /// Secondary model for the reasoning adapter's internal fallback
    #[serde(rename = "fallback-model")]
    pub fallback_model: Option<String>,

    /// Environment variable holding the credential (remote kinds)
    #[serde(rename = "api-key-env")]
    pub api_key_env: Option<String>,

    /// API base URL
    #[serde(rename = "base-url")]
    pub base_url: String,

    /// Default output-token budget
    #[serde(rename = "max-tokens")]
    pub max_tokens: u32,

    /// Per-request output-token ceiling
    #[serde(rename = "max-tokens-cap")]
    pub max_tokens_cap: u32,

    /// Default request timeout in milliseconds
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,

    /// Whether the provider supports streaming (descriptor fact only)
    pub streaming: bool,

    /// Declared quota, enabling the proactive rate limiter
    #[serde(rename = "rate-limit")]
    pub rate_limit: Option<RateLimitConfig>,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            model: String::new(),
            fallback_model: None,
            api_key_env: None,
            base_url: String::new(),
            max_tokens: 4096,
            max_tokens_cap: 16384,
            timeout_ms: 120_000,
            streaming: false,
            rate_limit: None,
        }
    }
}

/// Local endpoint autodiscovery settings
///
/// The strategy *order* is fixed (loopback, gateway, virtualization hosts,
/// user interfaces, container hostnames); the host lists themselves are data.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Ports probed for each candidate host
    pub ports: Vec<u16>,

    /// Host-gateway addresses as reported by default-route lookup
    #[serde(rename = "gateway-hosts")]
    pub gateway_hosts: Vec<String>,

    /// Common virtualization host IPs (empirical list, kept as data)
    #[serde(rename = "virtualization-hosts")]
    pub virtualization_hosts: Vec<String>,

    /// User-provided interface addresses
    pub interfaces: Vec<String>,

    /// Well-known container-host hostnames
    #[serde(rename = "container-hosts")]
    pub container_hosts: Vec<String>,

    /// Endpoint cache TTL in seconds
    #[serde(rename = "cache-ttl-secs")]
    pub cache_ttl_secs: u64,

    /// Pinned endpoint (skips discovery entirely); set via MB_LOCAL_URL
    #[serde(rename = "endpoint-override")]
    pub endpoint_override: Option<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            ports: vec![1234, 8080, 11434],
            gateway_hosts: vec!["172.17.0.1".to_string()],
            virtualization_hosts: vec!["10.0.2.2".to_string(), "192.168.65.2".to_string()],
            interfaces: vec![],
            container_hosts: vec!["host.docker.internal".to_string(), "host.containers.internal".to_string()],
            cache_ttl_secs: 300,
            endpoint_override: None,
        }
    }
}

/// Capability matcher settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    /// Ports that mark an endpoint as serving an orchestrator model
    #[serde(rename = "orchestrator-ports")]
    pub orchestrator_ports: Vec<u16>,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            orchestrator_ports: vec![8090, 11435],
        }
    }
}

/// Concurrent request pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum in-flight requests
    #[serde(rename = "max-concurrent")]
    pub max_concurrent: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { max_concurrent: 250 }
    }
}

/// Fuzzy-edit complexity limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FuzzyConfig {
    /// Maximum length of one find or replace string
    #[serde(rename = "max-single")]
    pub max_single: usize,

    /// Maximum newline count in one find string
    #[serde(rename = "max-lines")]
    pub max_lines: usize,

    /// Maximum characters summed over all find+replace strings
    #[serde(rename = "max-total")]
    pub max_total: usize,

    /// Matching-iteration budget handed to the editor collaborator
    #[serde(rename = "max-iterations")]
    pub max_iterations: u32,

    /// Deadline for the wrapped fuzzy worker in milliseconds
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,
}

impl Default for FuzzyConfig {
    fn default() -> Self {
        Self {
            max_single: 5000,
            max_lines: 200,
            max_total: 50_000,
            max_iterations: 10_000,
            timeout_ms: 5000,
        }
    }
}

/// Rate limiter quota (truncated-window, not sliding)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    #[serde(rename = "requests-per-minute")]
    pub requests_per_minute: u32,

    #[serde(rename = "requests-per-day")]
    pub requests_per_day: u32,

    #[serde(rename = "tokens-per-minute")]
    pub tokens_per_minute: u64,

    /// Fraction of any limit at which the guard breaker opens
    pub threshold: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 15,
            requests_per_day: 1500,
            tokens_per_minute: 1_000_000,
            threshold: 0.8,
        }
    }
}

/// Parallel-agents orchestrator defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Quality-gate iteration ceiling
    #[serde(rename = "max-iterations")]
    pub max_iterations: u32,

    /// Hard cap on per-batch parallelism
    #[serde(rename = "max-parallel-cap")]
    pub max_parallel_cap: u32,

    /// Run the quality gate at all
    pub iterate: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_iterations: 3,
            max_parallel_cap: 10,
            iterate: true,
        }
    }
}

/// Circuit breaker defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures before the breaker opens
    #[serde(rename = "failure-threshold")]
    pub failure_threshold: u32,

    /// Seconds before an open breaker admits a half-open probe
    #[serde(rename = "reset-secs")]
    pub reset_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_secs: 30,
        }
    }
}

fn default_true() -> bool {
    true
}

/// The stock backend pool: local first, then remotes by strength
fn default_backends() -> Vec<BackendEntry> {
    vec![
        BackendEntry {
            name: "local".to_string(),
            kind: BackendKind::Local,
            enabled: true,
            priority: 1,
            settings: BackendSettings {
                timeout_ms: 120_000,
                streaming: true,
                ..Default::default()
            },
        },
        BackendEntry {
            name: "reasoning".to_string(),
            kind: BackendKind::Reasoning,
            enabled: true,
            priority: 2,
            settings: BackendSettings {
                model: "deepseek-ai/deepseek-r1".to_string(),
                fallback_model: Some("qwen/qwen3-235b-a22b".to_string()),
                api_key_env: Some("NVIDIA_API_KEY".to_string()),
                base_url: "https://integrate.api.nvidia.com".to_string(),
                max_tokens: 8192,
                max_tokens_cap: 16384,
                timeout_ms: 300_000,
                ..Default::default()
            },
        },
        BackendEntry {
            name: "coder".to_string(),
            kind: BackendKind::Code,
            enabled: true,
            priority: 3,
            settings: BackendSettings {
                model: "deepseek-chat".to_string(),
                api_key_env: Some("DEEPSEEK_API_KEY".to_string()),
                base_url: "https://api.deepseek.com".to_string(),
                max_tokens: 8192,
                max_tokens_cap: 8192,
                timeout_ms: 180_000,
                ..Default::default()
            },
        },
        BackendEntry {
            name: "fast".to_string(),
            kind: BackendKind::Fast,
            enabled: true,
            priority: 4,
            settings: BackendSettings {
                model: "llama-3.3-70b-versatile".to_string(),
                api_key_env: Some("GROQ_API_KEY".to_string()),
                base_url: "https://api.groq.com/openai".to_string(),
                max_tokens: 4096,
                max_tokens_cap: 8192,
                timeout_ms: 60_000,
                ..Default::default()
            },
        },
        BackendEntry {
            name: "premium".to_string(),
            kind: BackendKind::Premium,
            enabled: true,
            priority: 5,
            settings: BackendSettings {
                model: "gemini-2.0-flash".to_string(),
                api_key_env: Some("GEMINI_API_KEY".to_string()),
                base_url: "https://generativelanguage.googleapis.com".to_string(),
                max_tokens: 8192,
                max_tokens_cap: 16384,
                timeout_ms: 120_000,
                rate_limit: Some(RateLimitConfig::default()),
                ..Default::default()
            },
        },
    ]
}
