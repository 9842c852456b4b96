use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub capabilities: CapabilitiesConfig,
}

/// Limits applied to every execution.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct SandboxConfig {
    /// Deadline used when a request does not ask for one.
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: f64,
    /// Upper bound for any requested deadline.
    #[serde(default = "default_max_timeout_secs")]
    pub max_timeout_secs: f64,
    /// Per-stream output cap used when a request does not ask for one.
    #[serde(default = "default_output_cap_bytes")]
    pub output_cap_bytes: usize,
    /// Upper bound for any requested output cap.
    #[serde(default = "default_max_output_cap_bytes")]
    pub max_output_cap_bytes: usize,
    /// How long a timed-out worker may take to stop before it is abandoned.
    #[serde(default = "default_teardown_grace_ms")]
    pub teardown_grace_ms: u64,
    /// Maximum nesting of snippet function calls.
    #[serde(default = "default_max_call_depth")]
    pub max_call_depth: usize,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct CapabilitiesConfig {
    pub web_search: Option<WebSearchConfig>,
    #[serde(default)]
    pub url_fetch: UrlFetchConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebSearchConfig {
    /// "tavily" or "perplexity"
    pub provider: String,
    /// Supports ${ENV_VAR} substitution
    pub api_key: String,
    #[serde(default = "default_max_results")]
    pub max_results: u8,
    /// Perplexity model, defaults to "sonar"
    pub model: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct UrlFetchConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for UrlFetchConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_timeout_secs(),
            max_timeout_secs: default_max_timeout_secs(),
            output_cap_bytes: default_output_cap_bytes(),
            max_output_cap_bytes: default_max_output_cap_bytes(),
            teardown_grace_ms: default_teardown_grace_ms(),
            max_call_depth: default_max_call_depth(),
        }
    }
}

fn default_timeout_secs() -> f64 {
    30.0
}

fn default_max_timeout_secs() -> f64 {
    120.0
}

fn default_output_cap_bytes() -> usize {
    64 * 1024
}

fn default_max_output_cap_bytes() -> usize {
    1024 * 1024
}

fn default_teardown_grace_ms() -> u64 {
    500
}

fn default_max_call_depth() -> usize {
    64
}

fn default_max_results() -> u8 {
    5
}

fn default_true() -> bool {
    true
}

impl SandboxConfig {
    /// Resolves the deadline of one execution: the requested timeout or the
    /// default, clamped to the configured maximum.
    pub fn deadline(&self, requested: Option<Duration>) -> Duration {
        let max = secs(self.max_timeout_secs);
        requested
            .unwrap_or_else(|| secs(self.default_timeout_secs))
            .min(max)
    }

    /// Resolves the per-stream output cap of one execution.
    pub fn output_cap(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.output_cap_bytes)
            .min(self.max_output_cap_bytes)
    }

    pub fn teardown_grace(&self) -> Duration {
        Duration::from_millis(self.teardown_grace_ms)
    }
}

/// Converts a configured number of seconds, treating garbage as zero.
fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        // Expand environment variables like ${TAVILY_API_KEY}
        let expanded = shellexpand::env(content)?;
        let config: Config = toml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        let sandbox = &self.sandbox;
        if !(sandbox.max_timeout_secs > 0.0) {
            anyhow::bail!("sandbox.max_timeout_secs must be positive");
        }
        if sandbox.default_timeout_secs > sandbox.max_timeout_secs {
            anyhow::bail!("sandbox.default_timeout_secs exceeds sandbox.max_timeout_secs");
        }
        if sandbox.output_cap_bytes > sandbox.max_output_cap_bytes {
            anyhow::bail!("sandbox.output_cap_bytes exceeds sandbox.max_output_cap_bytes");
        }
        if sandbox.max_call_depth == 0 {
            anyhow::bail!("sandbox.max_call_depth must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    // ── Loading ─────────────────────────────────────────

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.sandbox, SandboxConfig::default());
        assert!(config.capabilities.web_search.is_none());
        assert!(config.capabilities.url_fetch.enabled);
    }

    #[test]
    fn test_full_config() {
        let config = Config::parse(
            r#"
            [sandbox]
            default_timeout_secs = 5
            max_timeout_secs = 10.5
            output_cap_bytes = 100
            max_output_cap_bytes = 1000
            teardown_grace_ms = 50
            max_call_depth = 8

            [capabilities.web_search]
            provider = "perplexity"
            api_key = "k"
            model = "sonar-pro"

            [capabilities.url_fetch]
            enabled = false
            "#,
        )
        .unwrap();
        assert_eq!(config.sandbox.default_timeout_secs, 5.0);
        assert_eq!(config.sandbox.max_timeout_secs, 10.5);
        assert_eq!(config.sandbox.max_call_depth, 8);
        let ws = config.capabilities.web_search.unwrap();
        assert_eq!(ws.provider, "perplexity");
        assert_eq!(ws.max_results, 5);
        assert_eq!(ws.model.as_deref(), Some("sonar-pro"));
        assert!(!config.capabilities.url_fetch.enabled);
    }

    #[test]
    fn test_env_var_expansion() {
        std::env::set_var("FLUUX_CODEMODE_TEST_KEY", "secret-123");
        let config = Config::parse(
            r#"
            [capabilities.web_search]
            provider = "tavily"
            api_key = "${FLUUX_CODEMODE_TEST_KEY}"
            "#,
        )
        .unwrap();
        assert_eq!(config.capabilities.web_search.unwrap().api_key, "secret-123");
    }

    #[test]
    fn test_missing_env_var_is_an_error() {
        let result = Config::parse(
            r#"
            [capabilities.web_search]
            provider = "tavily"
            api_key = "${FLUUX_CODEMODE_SURELY_UNSET_VAR}"
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[sandbox]\nmax_call_depth = 3").unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.sandbox.max_call_depth, 3);
    }

    #[test]
    fn test_load_missing_file() {
        assert!(Config::load("/nonexistent/codemode.toml").is_err());
    }

    // ── Validation ──────────────────────────────────────

    #[test]
    fn test_default_above_max_rejected() {
        let err = Config::parse("[sandbox]\ndefault_timeout_secs = 200").unwrap_err();
        assert!(err.to_string().contains("default_timeout_secs"));
    }

    #[test]
    fn test_output_cap_above_max_rejected() {
        let err = Config::parse("[sandbox]\noutput_cap_bytes = 2000000").unwrap_err();
        assert!(err.to_string().contains("output_cap_bytes"));
    }

    #[test]
    fn test_zero_call_depth_rejected() {
        assert!(Config::parse("[sandbox]\nmax_call_depth = 0").is_err());
    }

    // ── Limit resolution ────────────────────────────────

    #[test]
    fn test_deadline_default_and_clamp() {
        let sandbox = SandboxConfig::default();
        assert_eq!(sandbox.deadline(None), Duration::from_secs(30));
        assert_eq!(
            sandbox.deadline(Some(Duration::from_secs(2))),
            Duration::from_secs(2)
        );
        assert_eq!(
            sandbox.deadline(Some(Duration::from_secs(3600))),
            Duration::from_secs(120)
        );
    }

    #[test]
    fn test_output_cap_default_and_clamp() {
        let sandbox = SandboxConfig::default();
        assert_eq!(sandbox.output_cap(None), 64 * 1024);
        assert_eq!(sandbox.output_cap(Some(10)), 10);
        assert_eq!(sandbox.output_cap(Some(usize::MAX)), 1024 * 1024);
    }
}
