//! Responsible for holding all application configuration under one place
//! for easy access and setting format for same variables

use dotenvy::from_path;
use std::path::Path;
use std::str::FromStr;
use std::env;
use anyhow::{self, Result, Context};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, fmt};
use tracing_appender::rolling::{RollingFileAppender, Rotation};

/// Represents where external model inference runs
///
/// Local mode keeps every adapter in-process with deterministic
/// placeholder outputs. Hosted mode sends adapter calls to the
/// configured inference endpoint.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum ProviderMode {
    Local,
    Hosted
}

impl FromStr for ProviderMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "local" => Ok(ProviderMode::Local),
            "hosted" => Ok(ProviderMode::Hosted),
            _ => anyhow::bail!("Invalid provider mode")
        }
    }
}

/// Represents all the configuration variables used by the application
pub struct AppConfig {
    provider_mode: ProviderMode,
    inference_url: String,
    inference_token: Option<String>,
    concurrency_cap: usize,
    deadline_secs: u64,
    adapter_timeout_secs: u64,
    detector_conf_threshold: f32
}

impl AppConfig {
    /// Creates a new instance of the configuration object
    pub fn new(local_env: bool) -> Result<Self> {
        // Load variables from local env file
        if local_env {
            AppConfig::load_env_file()?;
        }

        // Initiate app logging
        AppConfig::init_logging(local_env);

        let provider_mode: ProviderMode = env::var("INFERENCE_MODE")
            .unwrap_or("local".to_string())
            .parse()
            .context("INFERENCE_MODE must be local or hosted")?;

        let inference_url = env::var("INFERENCE_URL")
            .unwrap_or("".to_string());

        if provider_mode == ProviderMode::Hosted && inference_url.is_empty() {
            anyhow::bail!("INFERENCE_URL is required in hosted mode");
        }

        let inference_token = env::var("INFERENCE_TOKEN").ok();

        let concurrency_cap: usize = env::var("REQUEST_CONCURRENCY_CAP")
            .unwrap_or("3".to_string())
            .parse()
            .context("REQUEST_CONCURRENCY_CAP must be a positive integer")?;

        if concurrency_cap == 0 {
            anyhow::bail!("REQUEST_CONCURRENCY_CAP must be greater than zero");
        }

        let deadline_secs: u64 = env::var("PIPELINE_DEADLINE_SECS")
            .unwrap_or("600".to_string())
            .parse()
            .context("PIPELINE_DEADLINE_SECS must be a positive integer")?;

        let adapter_timeout_secs: u64 = env::var("ADAPTER_TIMEOUT_SECS")
            .unwrap_or("90".to_string())
            .parse()
            .context("ADAPTER_TIMEOUT_SECS must be a positive integer")?;

        let detector_conf_threshold: f32 = env::var("DETECTOR_CONF_THRESHOLD")
            .unwrap_or("0.35".to_string())
            .parse()
            .context("DETECTOR_CONF_THRESHOLD must be a float")?;

        if !(0.0..=1.0).contains(&detector_conf_threshold) {
            anyhow::bail!("DETECTOR_CONF_THRESHOLD must be within [0, 1]");
        }

        Ok(Self {
            provider_mode,
            inference_url,
            inference_token,
            concurrency_cap,
            deadline_secs,
            adapter_timeout_secs,
            detector_conf_threshold
        })
    }

    /// Builds a configuration for unit and integration tests without
    /// touching the process environment or the tracing registry
    pub fn for_tests() -> Self {
        Self {
            provider_mode: ProviderMode::Local,
            inference_url: "".to_string(),
            inference_token: None,
            concurrency_cap: 3,
            deadline_secs: 600,
            adapter_timeout_secs: 5,
            detector_conf_threshold: 0.35
        }
    }

    /// Loads environment variables from a local .env file
    fn load_env_file() -> Result<()> {
        // Path relative to cwd
        let env_path = Path::new("secrets/.env");

        // Load variables to environment
        from_path(env_path)
            .context("Error loading local env file")?;

        Ok(())
    }

    /// Initiates structured logging
    fn init_logging(local: bool) {
        let file_appender = RollingFileAppender::new(Rotation::NEVER, "logs", "app.log");
        let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

        // Append logging to local file
        let file_layer = if local {
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_timer(fmt::time::UtcTime::rfc_3339())
                    .with_writer(non_blocking)
            )
        } else {
            None
        };

        tracing_subscriber::registry()
            .with(EnvFilter::from_default_env())
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_timer(fmt::time::UtcTime::rfc_3339())
                    .with_writer(std::io::stdout)
            )
            .with(file_layer)
            .init();

        std::mem::forget(_guard);
    }
}

impl AppConfig {
    pub fn provider_mode(&self) -> ProviderMode {
        self.provider_mode
    }

    pub fn inference_url(&self) -> &str {
        &self.inference_url
    }

    pub fn inference_token(&self) -> Option<&str> {
        self.inference_token.as_deref()
    }

    pub fn concurrency_cap(&self) -> usize {
        self.concurrency_cap
    }

    pub fn deadline_secs(&self) -> u64 {
        self.deadline_secs
    }

    pub fn adapter_timeout_secs(&self) -> u64 {
        self.adapter_timeout_secs
    }

    pub fn detector_conf_threshold(&self) -> f32 {
        self.detector_conf_threshold
    }
}
