//! Runtime settings: engine tuning plus the processors to register.
//!
//! Settings come from an optional TOML file; processor secrets may be
//! overridden from the environment (`ORDERPAY_<KEY>_SECRET`).

use crate::domain::money::Currency;
use crate::domain::processor::PaymentMethodKind;
use crate::error::{PaymentError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Per-attempt limit for any gateway call.
    #[serde(with = "humantime_serde")]
    pub gateway_timeout: Duration,
    /// Retries after the first attempt, for transient failures only.
    pub max_gateway_retries: usize,
    #[serde(with = "humantime_serde")]
    pub retry_min_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub retry_max_delay: Duration,
    /// Optimistic-concurrency attempts before giving up with `Conflict`.
    pub max_commit_attempts: usize,
    /// An in-flight gateway call older than this is reported as ambiguous.
    #[serde(with = "humantime_serde")]
    pub ambiguity_grace: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            gateway_timeout: Duration::from_secs(5),
            max_gateway_retries: 3,
            retry_min_delay: Duration::from_millis(50),
            retry_max_delay: Duration::from_secs(2),
            max_commit_attempts: 8,
            ambiguity_grace: Duration::from_secs(300),
        }
    }
}

fn default_tolerance() -> Duration {
    Duration::from_secs(300)
}

fn default_currencies() -> Vec<Currency> {
    vec![Currency::Eur, Currency::Usd, Currency::Gbp]
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessorSettings {
    pub key: String,
    pub kind: PaymentMethodKind,
    pub secret: String,
    #[serde(default = "default_currencies")]
    pub currencies: Vec<Currency>,
    /// Required for redirect processors.
    #[serde(default)]
    pub redirect_base_url: Option<String>,
    /// Maximum age of a signed callback timestamp (redirect processors).
    #[serde(default = "default_tolerance", with = "humantime_serde")]
    pub signature_tolerance: Duration,
}

impl ProcessorSettings {
    /// Name of the environment variable overriding this processor's secret.
    pub fn secret_env_var(&self) -> String {
        let key: String = self
            .key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("ORDERPAY_{key}_SECRET")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub engine: EngineSettings,
    pub processors: Vec<ProcessorSettings>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            engine: EngineSettings::default(),
            processors: vec![
                ProcessorSettings {
                    key: "gateway_a".to_string(),
                    kind: PaymentMethodKind::Card,
                    secret: "sandbox-gateway-a-secret".to_string(),
                    currencies: vec![Currency::Eur, Currency::Usd, Currency::Gbp, Currency::Jpy],
                    redirect_base_url: None,
                    signature_tolerance: default_tolerance(),
                },
                ProcessorSettings {
                    key: "gateway_b".to_string(),
                    kind: PaymentMethodKind::Redirect,
                    secret: "sandbox-gateway-b-secret".to_string(),
                    currencies: vec![Currency::Eur, Currency::Rub],
                    redirect_base_url: Some("https://pay.example.test".to_string()),
                    signature_tolerance: default_tolerance(),
                },
            ],
        }
    }
}

impl Settings {
    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| PaymentError::Config(e.to_string()))
    }

    /// Reads a settings file, or the defaults when `path` is `None`. Environment
    /// overrides are applied and the result validated either way.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(path) => {
                let contents = std::fs::read_to_string(path).map_err(|e| {
                    PaymentError::Config(format!("cannot read {}: {e}", path.display()))
                })?;
                Self::from_toml(&contents)?
            }
            None => Self::default(),
        };
        settings.apply_overrides(|name| std::env::var(name).ok());
        settings.validate()?;
        Ok(settings)
    }

    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        for processor in &mut self.processors {
            if let Some(secret) = lookup(&processor.secret_env_var()) {
                processor.secret = secret;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.engine.gateway_timeout.is_zero() {
            return Err(PaymentError::Config(
                "engine.gateway_timeout must be positive".to_string(),
            ));
        }
        if self.engine.retry_min_delay > self.engine.retry_max_delay {
            return Err(PaymentError::Config(
                "engine.retry_min_delay exceeds engine.retry_max_delay".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for processor in &self.processors {
            if processor.key.trim().is_empty() {
                return Err(PaymentError::Config("processor key is empty".to_string()));
            }
            if !seen.insert(processor.key.as_str()) {
                return Err(PaymentError::Config(format!(
                    "processor `{}` configured twice",
                    processor.key
                )));
            }
            if processor.secret.is_empty() {
                return Err(PaymentError::Config(format!(
                    "processor `{}` has no secret",
                    processor.key
                )));
            }
            if processor.currencies.is_empty() {
                return Err(PaymentError::Config(format!(
                    "processor `{}` supports no currency",
                    processor.key
                )));
            }
            if processor.kind == PaymentMethodKind::Redirect
                && processor.redirect_base_url.is_none()
            {
                return Err(PaymentError::Config(format!(
                    "redirect processor `{}` needs redirect_base_url",
                    processor.key
                )));
            }
        }
        Ok(())
    }
}
