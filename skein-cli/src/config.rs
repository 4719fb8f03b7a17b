//! Environment-driven configuration for the reference orchestrator.

use std::env;
use std::time::Duration;

use skein::Error;

/// Runtime settings, read from `SKEIN_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Provider selection (`mock` in the reference binary).
    pub provider: String,
    /// API key for hosted providers.
    pub api_key: Option<String>,
    /// Model identifier.
    pub model: String,
    /// Agent step budget.
    pub max_steps: usize,
    /// Optional run timeout.
    pub timeout: Option<Duration>,
    /// Log filter, e.g. `info` or `skein=debug`.
    pub log: String,
    /// Port reserved for a transport front-end.
    pub port: u16,
}

impl Config {
    /// Read configuration from the environment.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for unparsable numbers or a provider
    /// selection this binary cannot satisfy.
    pub fn from_env() -> Result<Self, Error> {
        let provider = env::var("SKEIN_PROVIDER").unwrap_or_else(|_| "mock".to_owned());
        let api_key = env::var("SKEIN_API_KEY").ok();
        let model = env::var("SKEIN_MODEL").unwrap_or_else(|_| "mock-model".to_owned());

        let max_steps = parse_env("SKEIN_MAX_STEPS")?.unwrap_or(10);
        let timeout = parse_env("SKEIN_TIMEOUT_SECS")?.map(Duration::from_secs);
        let log = env::var("SKEIN_LOG").unwrap_or_else(|_| "info".to_owned());
        let port = parse_env("SKEIN_PORT")?.unwrap_or(8080);

        if provider != "mock" && api_key.is_none() {
            return Err(Error::configuration(format!(
                "provider '{provider}' requires SKEIN_API_KEY"
            )));
        }

        Ok(Self {
            provider,
            api_key,
            model,
            max_steps,
            timeout,
            log,
            port,
        })
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Result<Option<T>, Error> {
    match env::var(name) {
        Err(_) => Ok(None),
        Ok(raw) => raw.parse().map(Some).map_err(|_| {
            Error::configuration(format!("{name} has an invalid value: '{raw}'"))
        }),
    }
}
