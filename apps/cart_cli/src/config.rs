use std::{collections::HashMap, fs, io, path::Path, time::Duration};

use anyhow::{bail, Context};
use chrono::TimeDelta;
use client_core::{OrchestratorConfig, PriceBook, Pricer, RetryPolicy, SessionStoreConfig};
use shared::domain::PlanTier;

const ENV_PREFIX: &str = "CART__";

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// `None` keeps the session in process memory.
    pub database_url: Option<String>,
    pub debounce_ms: u64,
    pub retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub retry_timeout_ms: u64,
    pub session_ttl_secs: i64,
    pub store_latency_ms: u64,
    pub standard_unit_price: f64,
    pub premium_unit_price: f64,
    pub annual_discount_rate: f64,
    pub minimum_seats: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: None,
            debounce_ms: 300,
            retries: 3,
            retry_base_delay_ms: 300,
            retry_max_delay_ms: 2000,
            retry_timeout_ms: 5000,
            session_ttl_secs: 24 * 60 * 60,
            store_latency_ms: 0,
            standard_unit_price: 40.0,
            premium_unit_price: 90.0,
            annual_discount_rate: 0.16,
            minimum_seats: 1,
        }
    }
}

impl Settings {
    const KEYS: [&'static str; 12] = [
        "database_url",
        "debounce_ms",
        "retries",
        "retry_base_delay_ms",
        "retry_max_delay_ms",
        "retry_timeout_ms",
        "session_ttl_secs",
        "store_latency_ms",
        "standard_unit_price",
        "premium_unit_price",
        "annual_discount_rate",
        "minimum_seats",
    ];

    /// Defaults, overlaid by a flat `key = "value"` TOML document, overlaid
    /// by `CART__<KEY>` variables.
    pub fn from_sources(
        file: Option<&str>,
        env: impl IntoIterator<Item = (String, String)>,
    ) -> anyhow::Result<Self> {
        let mut settings = Settings::default();

        if let Some(raw) = file {
            let file_cfg = toml::from_str::<HashMap<String, String>>(raw)
                .context("config file must be a flat table of string values")?;
            for (key, value) in &file_cfg {
                settings.apply(key, value)?;
            }
        }

        let env: HashMap<String, String> = env.into_iter().collect();
        for key in Self::KEYS {
            let var = format!("{ENV_PREFIX}{}", key.to_ascii_uppercase());
            if let Some(value) = env.get(&var) {
                settings
                    .apply(key, value)
                    .with_context(|| format!("invalid value in {var}"))?;
            }
        }

        settings.validate()?;
        Ok(settings)
    }

    fn apply(&mut self, key: &str, value: &str) -> anyhow::Result<()> {
        let value = value.trim();
        match key {
            "database_url" => self.database_url = normalize_database_url(value),
            "debounce_ms" => self.debounce_ms = parse(key, value)?,
            "retries" => self.retries = parse(key, value)?,
            "retry_base_delay_ms" => self.retry_base_delay_ms = parse(key, value)?,
            "retry_max_delay_ms" => self.retry_max_delay_ms = parse(key, value)?,
            "retry_timeout_ms" => self.retry_timeout_ms = parse(key, value)?,
            "session_ttl_secs" => self.session_ttl_secs = parse(key, value)?,
            "store_latency_ms" => self.store_latency_ms = parse(key, value)?,
            "standard_unit_price" => self.standard_unit_price = parse(key, value)?,
            "premium_unit_price" => self.premium_unit_price = parse(key, value)?,
            "annual_discount_rate" => self.annual_discount_rate = parse(key, value)?,
            "minimum_seats" => self.minimum_seats = parse(key, value)?,
            other => bail!("unknown setting '{other}'"),
        }
        Ok(())
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.session_ttl_secs <= 0 {
            bail!("session_ttl_secs must be positive");
        }
        if self.retry_timeout_ms == 0 {
            bail!("retry_timeout_ms must be positive");
        }
        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            bail!("retry_max_delay_ms must not be below retry_base_delay_ms");
        }
        if !(0.0..1.0).contains(&self.annual_discount_rate) {
            bail!("annual_discount_rate must be in [0, 1)");
        }
        if self.standard_unit_price < 0.0 || self.premium_unit_price < 0.0 {
            bail!("unit prices must not be negative");
        }
        Ok(())
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            debounce: Duration::from_millis(self.debounce_ms),
            retry: RetryPolicy {
                retries: self.retries,
                base_delay: Duration::from_millis(self.retry_base_delay_ms),
                max_delay: Duration::from_millis(self.retry_max_delay_ms),
                timeout: Duration::from_millis(self.retry_timeout_ms),
            },
        }
    }

    pub fn session_store_config(&self) -> SessionStoreConfig {
        SessionStoreConfig {
            session_ttl: TimeDelta::seconds(self.session_ttl_secs),
            latency: Duration::from_millis(self.store_latency_ms),
            ..SessionStoreConfig::default()
        }
    }

    pub fn price_book(&self) -> PriceBook {
        PriceBook::new()
            .with_price(PlanTier::Standard, self.standard_unit_price)
            .with_price(PlanTier::Premium, self.premium_unit_price)
    }

    pub fn pricer(&self) -> Pricer {
        Pricer::new(std::sync::Arc::new(self.price_book()))
            .with_annual_discount_rate(self.annual_discount_rate)
            .with_minimum_seats(self.minimum_seats)
    }
}

fn parse<T>(key: &str, value: &str) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    value
        .parse()
        .with_context(|| format!("setting '{key}' has invalid value '{value}'"))
}

/// Reads `path` when it exists and applies the process environment on top.
pub fn load_settings(path: &Path) -> anyhow::Result<Settings> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => Some(raw),
        Err(err) if err.kind() == io::ErrorKind::NotFound => None,
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read '{}'", path.display()))
        }
    };
    Settings::from_sources(raw.as_deref(), std::env::vars())
        .with_context(|| format!("failed to load settings from '{}'", path.display()))
}

/// Blank means "no database". Bare paths become `sqlite://` URLs.
pub fn normalize_database_url(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if raw.contains("://") || raw.starts_with("sqlite::memory:") {
        return Some(raw.to_owned());
    }
    let file = raw.strip_prefix("sqlite:").unwrap_or(raw).replace('\\', "/");
    Some(format!("sqlite://{file}"))
}
