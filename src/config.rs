//! Configuration types.
//!
//! Everything is read once at startup via [`Config::from_env`] and handed to
//! the client constructors by value. Nothing re-reads the environment mid-run.

use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

const DEFAULT_IMAP_HOST: &str = "imap.gmail.com";
const DEFAULT_IMAP_PORT: u16 = 993;
const DEFAULT_FOLDER_ROOT: &str = "AI-Priority";
const DEFAULT_LLM_BASE_URL: &str = "https://integrate.api.nvidia.com/v1";
const DEFAULT_LLM_MODEL: &str = "qwen/qwen3-next-80b-a3b-instruct";
const DEFAULT_PORT: u16 = 3000;

/// Full application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub mailbox: MailboxConfig,
    pub classifier: ClassifierConfig,
    pub pipeline: PipelineConfig,
    pub server: ServerConfig,
}

/// Mail-store connection and organization settings.
#[derive(Debug, Clone)]
pub struct MailboxConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    /// Parent folder for the per-facet folders (e.g. `AI-Priority/Needs Reply`).
    pub folder_root: String,
    /// UIDs fetched per sub-batch.
    pub fetch_batch_size: usize,
    /// Pause between fetch sub-batches.
    pub fetch_batch_pause: Duration,
    /// Socket read timeout for the IMAP connection.
    pub read_timeout: Duration,
}

impl MailboxConfig {
    pub fn new(username: impl Into<String>, password: SecretString) -> Self {
        Self {
            host: DEFAULT_IMAP_HOST.to_string(),
            port: DEFAULT_IMAP_PORT,
            username: username.into(),
            password,
            folder_root: DEFAULT_FOLDER_ROOT.to_string(),
            fetch_batch_size: 5,
            fetch_batch_pause: Duration::from_secs(1),
            read_timeout: Duration::from_secs(30),
        }
    }
}

/// Language model settings.
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    pub api_key: SecretString,
    pub base_url: String,
    pub model: String,
}

/// Run budget and pacing.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Wall-clock ceiling for one run, kept below the scheduler's hard timeout.
    pub budget: Duration,
    /// Delay between classifier calls (upstream rate limit).
    pub pacing_interval: Duration,
    /// Classifier calls in flight at once. 1 is the sequential mode.
    pub concurrency: usize,
    /// Process at most this many candidates per run (chunked invocations).
    pub max_messages: Option<usize>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            budget: Duration::from_secs(45), // 15s margin under a 60s platform limit
            pacing_interval: Duration::from_secs(2),
            concurrency: 1,
            max_messages: None,
        }
    }
}

/// HTTP entrypoint settings.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// When set, cron routes require `Authorization: Bearer <secret>`.
    pub cron_secret: Option<SecretString>,
}

impl Config {
    /// Build config from process environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    ///
    /// All missing required keys are reported together.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let required = ["GMAIL_USER", "GMAIL_APP_PASSWORD", "NVIDIA_API_KEY"];
        let missing: Vec<String> = required
            .iter()
            .filter(|key| get(key).is_none())
            .map(|key| key.to_string())
            .collect();
        if !missing.is_empty() {
            return Err(ConfigError::MissingEnvVars(missing));
        }

        let username = get("GMAIL_USER").unwrap_or_default();
        let password = SecretString::from(get("GMAIL_APP_PASSWORD").unwrap_or_default());
        let api_key = SecretString::from(get("NVIDIA_API_KEY").unwrap_or_default());

        let mut mailbox = MailboxConfig::new(username, password);
        if let Some(host) = get("IMAP_HOST") {
            mailbox.host = host;
        }
        mailbox.port = parse_or("IMAP_PORT", get("IMAP_PORT"), DEFAULT_IMAP_PORT)?;
        if let Some(root) = get("MAIL_FOLDER_ROOT") {
            mailbox.folder_root = root.trim_matches('/').to_string();
        }

        let classifier = ClassifierConfig {
            api_key,
            base_url: get("LLM_BASE_URL").unwrap_or_else(|| DEFAULT_LLM_BASE_URL.to_string()),
            model: get("LLM_MODEL").unwrap_or_else(|| DEFAULT_LLM_MODEL.to_string()),
        };

        let defaults = PipelineConfig::default();
        let budget_secs = parse_or(
            "PIPELINE_BUDGET_SECS",
            get("PIPELINE_BUDGET_SECS"),
            defaults.budget.as_secs(),
        )?;
        let pacing_ms = parse_or(
            "PIPELINE_PACING_MS",
            get("PIPELINE_PACING_MS"),
            defaults.pacing_interval.as_millis() as u64,
        )?;
        let concurrency: usize =
            parse_or("PIPELINE_CONCURRENCY", get("PIPELINE_CONCURRENCY"), 1)?;
        if concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                key: "PIPELINE_CONCURRENCY".into(),
                message: "must be at least 1".into(),
            });
        }

        let pipeline = PipelineConfig {
            budget: Duration::from_secs(budget_secs),
            pacing_interval: Duration::from_millis(pacing_ms),
            concurrency,
            max_messages: None,
        };

        let server = ServerConfig {
            port: parse_or("PORT", get("PORT"), DEFAULT_PORT)?,
            cron_secret: get("CRON_SECRET").map(SecretString::from),
        };

        Ok(Self {
            mailbox,
            classifier,
            pipeline,
            server,
        })
    }
}

fn parse_or<T>(key: &str, value: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match value {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{raw:?}: {e}"),
            }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use secrecy::ExposeSecret;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    const REQUIRED: [(&str, &str); 3] = [
        ("GMAIL_USER", "me@example.com"),
        ("GMAIL_APP_PASSWORD", "app-pass"),
        ("NVIDIA_API_KEY", "nvapi-test"),
    ];

    #[test]
    fn missing_required_vars_reported_together() {
        let err = Config::from_lookup(lookup(&[("GMAIL_USER", "me@example.com")])).unwrap_err();
        match err {
            ConfigError::MissingEnvVars(missing) => {
                assert_eq!(missing, vec!["GMAIL_APP_PASSWORD", "NVIDIA_API_KEY"]);
            }
            other => panic!("Expected MissingEnvVars, got {other:?}"),
        }
    }

    #[test]
    fn blank_values_count_as_missing() {
        let err = Config::from_lookup(lookup(&[
            ("GMAIL_USER", "me@example.com"),
            ("GMAIL_APP_PASSWORD", "  "),
            ("NVIDIA_API_KEY", "k"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVars(ref m) if m == &["GMAIL_APP_PASSWORD"]));
    }

    #[test]
    fn defaults_applied() {
        let config = Config::from_lookup(lookup(&REQUIRED)).unwrap();
        assert_eq!(config.mailbox.host, "imap.gmail.com");
        assert_eq!(config.mailbox.port, 993);
        assert_eq!(config.mailbox.folder_root, "AI-Priority");
        assert_eq!(config.mailbox.password.expose_secret(), "app-pass");
        assert_eq!(config.classifier.model, "qwen/qwen3-next-80b-a3b-instruct");
        assert_eq!(config.pipeline.budget, Duration::from_secs(45));
        assert_eq!(config.pipeline.pacing_interval, Duration::from_secs(2));
        assert_eq!(config.pipeline.concurrency, 1);
        assert!(config.server.cron_secret.is_none());
        assert_eq!(config.server.port, 3000);
    }

    #[test]
    fn overrides_applied() {
        let mut pairs = REQUIRED.to_vec();
        pairs.extend([
            ("IMAP_HOST", "imap.fastmail.com"),
            ("MAIL_FOLDER_ROOT", "/Triage/"),
            ("PIPELINE_BUDGET_SECS", "20"),
            ("PIPELINE_PACING_MS", "500"),
            ("PIPELINE_CONCURRENCY", "4"),
            ("CRON_SECRET", "s3cret"),
        ]);
        let config = Config::from_lookup(lookup(&pairs)).unwrap();
        assert_eq!(config.mailbox.host, "imap.fastmail.com");
        assert_eq!(config.mailbox.folder_root, "Triage");
        assert_eq!(config.pipeline.budget, Duration::from_secs(20));
        assert_eq!(config.pipeline.pacing_interval, Duration::from_millis(500));
        assert_eq!(config.pipeline.concurrency, 4);
        assert_eq!(
            config.server.cron_secret.as_ref().map(|s| s.expose_secret().to_string()),
            Some("s3cret".to_string())
        );
    }

    #[test]
    fn invalid_number_rejected() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("IMAP_PORT", "imaps"));
        let err = Config::from_lookup(lookup(&pairs)).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "IMAP_PORT"));
    }

    #[test]
    fn zero_concurrency_rejected() {
        let mut pairs = REQUIRED.to_vec();
        pairs.push(("PIPELINE_CONCURRENCY", "0"));
        assert!(Config::from_lookup(lookup(&pairs)).is_err());
    }
}
