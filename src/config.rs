//! Configuration management for the swap coordinator
//!
//! Loads configuration from TOML files with environment variable substitution.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub coordinator: CoordinatorConfig,
    pub database: DatabaseConfig,
    pub api: ApiConfig,
    pub metrics: MetricsConfig,
    pub auction: AuctionDefaults,
    pub escrow: EscrowConfig,
    pub ledgers: HashMap<String, LedgerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoordinatorConfig {
    pub instance_id: String,
    /// Margin by which the destination timelock must precede the source
    /// timelock. Must exceed worst-case cross-ledger observation delay.
    pub safety_margin_secs: u64,
    pub sweep_interval_secs: u64,
    pub max_retries: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub health_check_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

/// Default Dutch auction parameters applied to each fill opportunity
#[derive(Debug, Clone, Deserialize)]
pub struct AuctionDefaults {
    pub start_price: u64,
    pub floor_price: u64,
    pub decay_per_second: u64,
    pub duration_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EscrowConfig {
    pub min_timelock_secs: u64,
    pub max_timelock_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    pub name: String,
    pub endpoint: String,
    pub enabled: bool,
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("LOCKBRIDGE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        // Substitute environment variables
        let config_str = substitute_env_vars(&config_str);

        let settings: Settings =
            toml::from_str(&config_str).with_context(|| "Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.enabled_ledgers().is_empty() {
            anyhow::bail!("At least one ledger must be enabled");
        }

        if self.escrow.min_timelock_secs >= self.escrow.max_timelock_secs {
            anyhow::bail!("min_timelock_secs must be below max_timelock_secs");
        }

        // The destination leg's claim window is the source window minus the
        // margin; a margin at or above the minimum timelock leaves no window.
        if self.coordinator.safety_margin_secs == 0 {
            anyhow::bail!("safety_margin_secs must be positive");
        }
        if self.coordinator.safety_margin_secs >= self.escrow.min_timelock_secs {
            anyhow::bail!("safety_margin_secs must be below min_timelock_secs");
        }

        if self.auction.floor_price > self.auction.start_price {
            anyhow::bail!("auction floor_price must not exceed start_price");
        }

        for (name, ledger) in &self.ledgers {
            if ledger.enabled && ledger.endpoint.is_empty() {
                anyhow::bail!("Ledger {} has no endpoint configured", name);
            }
        }

        Ok(())
    }

    /// Get list of enabled ledgers
    pub fn enabled_ledgers(&self) -> Vec<(&String, &LedgerConfig)> {
        self.ledgers.iter().filter(|(_, l)| l.enabled).collect()
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").unwrap();

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("TEST_VAR", "test_value");
        let input = "url = \"postgres://db/${TEST_VAR}\"";
        let result = substitute_env_vars(input);
        assert_eq!(result, "url = \"postgres://db/test_value\"");
    }

    fn base_settings() -> Settings {
        let toml_str = r#"
            [coordinator]
            instance_id = "coordinator-1"
            safety_margin_secs = 300
            sweep_interval_secs = 10
            max_retries = 5
            retry_base_delay_ms = 500
            retry_max_delay_ms = 30000
            health_check_interval_secs = 30

            [database]
            url = "postgres://localhost/lockbridge"
            max_connections = 10
            min_connections = 1

            [api]
            host = "127.0.0.1"
            port = 8080

            [metrics]
            enabled = false
            port = 9090

            [auction]
            start_price = 1000
            floor_price = 100
            decay_per_second = 10
            duration_secs = 120

            [escrow]
            min_timelock_secs = 3600
            max_timelock_secs = 172800

            [ledgers.alpha]
            name = "alpha"
            endpoint = "http://localhost:9650"
            enabled = true

            [ledgers.beta]
            name = "beta"
            endpoint = "http://localhost:9651"
            enabled = true
        "#;
        toml::from_str(toml_str).unwrap()
    }

    #[test]
    fn test_valid_settings_pass_validation() {
        assert!(base_settings().validate().is_ok());
        assert_eq!(base_settings().enabled_ledgers().len(), 2);
    }

    #[test]
    fn test_safety_margin_must_fit_in_min_timelock() {
        let mut settings = base_settings();
        settings.coordinator.safety_margin_secs = 3600;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_floor_above_start_rejected() {
        let mut settings = base_settings();
        settings.auction.floor_price = 2000;
        assert!(settings.validate().is_err());
    }
}
