use crate::core::entitlement::{FeatureCost, FeatureTable};
use crate::core::ledger::{AccountSeed, DEFAULT_HOLD_LEASE_SECS, MAX_BALANCE};
use crate::core::price::FetchOptions;
use crate::core::valuation::Holding;
use anyhow::{Context, Result, bail};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use std::{fs, path::PathBuf};
use tracing::debug;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Portfolio {
    pub id: String,
    /// Account whose credits pay for this portfolio's metrics.
    pub account: String,
    pub name: Option<String>,
    #[serde(default)]
    pub holdings: Vec<Holding>,
}

impl Portfolio {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct YahooProviderConfig {
    pub base_url: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CoinGeckoProviderConfig {
    pub base_url: String,
    #[serde(default = "default_vs_currency")]
    pub vs_currency: String,
    /// Extra symbol to coin id mappings, e.g. `WBTC: wrapped-bitcoin`.
    #[serde(default)]
    pub mappings: HashMap<String, String>,
}

fn default_vs_currency() -> String {
    "usd".to_string()
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ProvidersConfig {
    pub yahoo: Option<YahooProviderConfig>,
    pub coingecko: Option<CoinGeckoProviderConfig>,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        ProvidersConfig {
            yahoo: Some(YahooProviderConfig {
                base_url: "https://query1.finance.yahoo.com".to_string(),
            }),
            coingecko: Some(CoinGeckoProviderConfig {
                base_url: "https://api.coingecko.com/api/v3".to_string(),
                vs_currency: default_vs_currency(),
                mappings: HashMap::new(),
            }),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct FetchConfig {
    pub concurrency: usize,
    pub timeout_ms: u64,
    pub staleness_minutes: i64,
    pub cache_ttl_secs: u64,
    pub retries: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        FetchConfig {
            concurrency: 8,
            timeout_ms: 5000,
            staleness_minutes: 15,
            cache_ttl_secs: 60,
            retries: 2,
        }
    }
}

impl FetchConfig {
    pub fn options(&self) -> FetchOptions {
        FetchOptions {
            concurrency: self.concurrency.max(1),
            timeout: Duration::from_millis(self.timeout_ms),
        }
    }

    pub fn staleness(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.staleness_minutes)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct LedgerConfig {
    /// Seconds an uncommitted hold is kept before it counts as abandoned.
    pub hold_lease_secs: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        LedgerConfig {
            hold_lease_secs: DEFAULT_HOLD_LEASE_SECS,
        }
    }
}

impl LedgerConfig {
    pub fn hold_lease(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.hold_lease_secs).unwrap_or(i64::MAX))
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub accounts: Vec<AccountSeed>,
    #[serde(default)]
    pub portfolios: Vec<Portfolio>,
    #[serde(default)]
    pub providers: ProvidersConfig,
    #[serde(default)]
    pub fetch: FetchConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
    /// Replaces the built-in feature table when present.
    pub features: Option<Vec<FeatureCost>>,
    pub data_path: Option<String>,
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        debug!("Loading default config");
        let config_path = Self::default_config_path()?;
        Self::load_from_path(&config_path)
    }

    pub fn default_config_path() -> Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("dev", "creditfolio", "creditfolio")
            .context("Could not determine project directories")?;
        Ok(proj_dirs.config_dir().join("config.yaml"))
    }

    pub fn default_data_path(&self) -> Result<PathBuf> {
        if let Some(custom_path) = &self.data_path {
            return Ok(PathBuf::from(custom_path));
        }
        let proj_dirs = ProjectDirs::from("dev", "creditfolio", "creditfolio")
            .context("Could not determine project directories")?;
        Ok(proj_dirs.data_dir().to_path_buf())
    }

    pub fn load_from_path<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let config_str = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: Self = serde_yaml::from_str(&config_str)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.as_ref().display()))?;
        debug!("Successfully loaded config");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut account_ids = HashSet::new();
        for account in &self.accounts {
            if account.id.trim().is_empty() {
                bail!("Account id must not be empty");
            }
            if !account_ids.insert(account.id.as_str()) {
                bail!("Duplicate account id: {}", account.id);
            }
            if account.opening_balance > MAX_BALANCE {
                bail!("Opening balance of {} is too large", account.id);
            }
        }

        if self.ledger.hold_lease_secs == 0 {
            bail!("ledger.hold_lease_secs must be positive");
        }

        let mut portfolio_ids = HashSet::new();
        for portfolio in &self.portfolios {
            if !portfolio_ids.insert(portfolio.id.as_str()) {
                bail!("Duplicate portfolio id: {}", portfolio.id);
            }
            if !account_ids.contains(portfolio.account.as_str()) {
                bail!(
                    "Portfolio {} refers to unknown account {}",
                    portfolio.id,
                    portfolio.account
                );
            }
            for holding in &portfolio.holdings {
                if holding.symbol.trim().is_empty() {
                    bail!("Portfolio {} has a holding without a symbol", portfolio.id);
                }
                if !(holding.amount.is_finite() && holding.amount > 0.0) {
                    bail!(
                        "Holding {} in {} must have a positive amount",
                        holding.symbol,
                        portfolio.id
                    );
                }
                if !(holding.purchase_price.is_finite() && holding.purchase_price > 0.0) {
                    bail!(
                        "Holding {} in {} must have a positive purchase price",
                        holding.symbol,
                        portfolio.id
                    );
                }
            }
        }

        if let Some(features) = &self.features {
            let mut feature_ids = HashSet::new();
            for feature in features {
                if !feature_ids.insert(feature.feature_id.as_str()) {
                    bail!("Duplicate feature id: {}", feature.feature_id);
                }
            }
            let missing = FeatureTable::new(features.clone()).missing_required();
            if !missing.is_empty() {
                bail!(
                    "Feature table override must define: {}",
                    missing.join(", ")
                );
            }
        }
        Ok(())
    }

    pub fn feature_table(&self) -> FeatureTable {
        match &self.features {
            Some(rows) => FeatureTable::new(rows.clone()),
            None => FeatureTable::builtin(),
        }
    }

    pub fn portfolio(&self, id: &str) -> Option<&Portfolio> {
        self.portfolios.iter().find(|p| p.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::entitlement::Tier;

    const CONFIG: &str = r#"
accounts:
  - id: alice
    tier: pro
    monthly_allowance: 50
    opening_balance: 20
  - id: bob
    tier: free
portfolios:
  - id: main
    account: alice
    name: "Long Term"
    holdings:
      - symbol: AAPL
        amount: 2
        purchase_price: 100.0
        purchase_date: 2024-01-15
      - symbol: BTC
        amount: 0.25
        purchase_price: 42000
        purchase_date: 2023-11-02
providers:
  yahoo:
    base_url: "http://example.com/yahoo"
  coingecko:
    base_url: "http://example.com/coingecko"
    mappings:
      WBTC: wrapped-bitcoin
fetch:
  concurrency: 4
  timeout_ms: 1500
"#;

    #[test]
    fn test_config_deserialization() {
        let config: AppConfig = serde_yaml::from_str(CONFIG).expect("Failed to deserialize");
        config.validate().unwrap();

        assert_eq!(config.accounts.len(), 2);
        assert_eq!(config.accounts[0].tier, Tier::Pro);
        assert_eq!(config.accounts[0].opening_balance, 20);
        assert_eq!(config.accounts[1].monthly_allowance, 0);

        let portfolio = config.portfolio("main").unwrap();
        assert_eq!(portfolio.display_name(), "Long Term");
        assert_eq!(portfolio.holdings.len(), 2);
        assert_eq!(portfolio.holdings[1].symbol, "BTC");
        assert_eq!(portfolio.holdings[1].amount, 0.25);
        assert!(portfolio.holdings[0].current_price.is_none());

        assert_eq!(
            config.providers.yahoo.as_ref().unwrap().base_url,
            "http://example.com/yahoo"
        );
        let coingecko = config.providers.coingecko.as_ref().unwrap();
        assert_eq!(coingecko.vs_currency, "usd");
        assert_eq!(coingecko.mappings["WBTC"], "wrapped-bitcoin");

        assert_eq!(config.fetch.concurrency, 4);
        assert_eq!(config.fetch.options().timeout, Duration::from_millis(1500));
        // Unset fetch fields keep their defaults.
        assert_eq!(config.fetch.retries, 2);
        assert_eq!(config.fetch.staleness_minutes, 15);
        assert!(config.feature_table().get("ai_insight").is_some());
    }

    #[test]
    fn test_defaults_for_missing_sections() {
        let config: AppConfig = serde_yaml::from_str("accounts: []").unwrap();
        assert!(config.portfolios.is_empty());
        assert!(config.providers.yahoo.is_some());
        assert!(config.providers.coingecko.is_some());
        assert_eq!(config.fetch.concurrency, 8);
        assert_eq!(config.ledger.hold_lease(), chrono::Duration::minutes(5));
    }

    #[test]
    fn test_feature_override() {
        let yaml = r#"
features:
  - feature_id: only_feature
    required_tier: elite
    credit_cost: 3
"#;
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        let table = config.feature_table();
        assert!(table.get("ai_insight").is_none());
        assert_eq!(table.get("only_feature").unwrap().credit_cost, 3);
    }

    #[test]
    fn test_validation_rejects_bad_config() {
        let unknown_account = r#"
accounts: [{id: alice, tier: free}]
portfolios: [{id: main, account: carol}]
"#;
        let config: AppConfig = serde_yaml::from_str(unknown_account).unwrap();
        assert!(config.validate().unwrap_err().to_string().contains("unknown account"));

        let duplicate = "accounts: [{id: alice, tier: free}, {id: alice, tier: pro}]";
        let config: AppConfig = serde_yaml::from_str(duplicate).unwrap();
        assert!(config.validate().is_err());

        let negative = r#"
accounts: [{id: alice, tier: free}]
portfolios:
  - id: main
    account: alice
    holdings: [{symbol: X, amount: -1, purchase_price: 1, purchase_date: 2024-01-01}]
"#;
        let config: AppConfig = serde_yaml::from_str(negative).unwrap();
        assert!(config.validate().unwrap_err().to_string().contains("positive amount"));

        let no_lease = "ledger: {hold_lease_secs: 0}";
        let config: AppConfig = serde_yaml::from_str(no_lease).unwrap();
        assert!(config.validate().unwrap_err().to_string().contains("hold_lease_secs"));

        let huge = "accounts: [{id: alice, tier: free, opening_balance: 18446744073709551615}]";
        let config: AppConfig = serde_yaml::from_str(huge).unwrap();
        assert!(config.validate().unwrap_err().to_string().contains("too large"));
    }

    #[test]
    fn test_feature_override_must_keep_billed_features() {
        let partial = r#"
features:
  - feature_id: ai_insight
    required_tier: pro
    credit_cost: 4
  - feature_id: portfolio_metrics
    required_tier: free
    credit_cost: 1
"#;
        let config: AppConfig = serde_yaml::from_str(partial).unwrap();
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("price_alert_sweep"), "{err}");
        assert!(!err.contains("portfolio_metrics"), "{err}");

        let complete = format!(
            "{partial}  - feature_id: price_alert_sweep\n    required_tier: free\n    credit_cost: 1\n"
        );
        let config: AppConfig = serde_yaml::from_str(&complete).unwrap();
        config.validate().unwrap();
        assert_eq!(config.feature_table().get("ai_insight").unwrap().credit_cost, 4);
    }
}
