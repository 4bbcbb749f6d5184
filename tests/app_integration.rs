use creditfolio::core::alert::{AlertType, NewAlert};
use creditfolio::core::config::AppConfig;
use creditfolio::core::valuation::PriceSource;
use std::fs;
use tempfile::TempDir;
use tracing::info;

mod test_utils {
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    pub async fn create_yahoo_mock_server(prices: &[(&str, f64, f64)]) -> MockServer {
        let mock_server = MockServer::start().await;
        for (symbol, price, previous_close) in prices {
            let body = format!(
                r#"{{"chart": {{"result": [{{"meta": {{"regularMarketPrice": {price}, "chartPreviousClose": {previous_close}}}}}]}}}}"#
            );
            Mock::given(method("GET"))
                .and(path(format!("/v8/finance/chart/{symbol}")))
                .respond_with(ResponseTemplate::new(200).set_body_string(body))
                .mount(&mock_server)
                .await;
        }
        mock_server
    }

    /// Answers known coin ids and an empty object for everything else.
    pub async fn create_coingecko_mock_server(coins: &[(&str, f64, f64)]) -> MockServer {
        let mock_server = MockServer::start().await;
        for (id, price, change) in coins {
            let body = format!(r#"{{"{id}": {{"usd": {price}, "usd_24h_change": {change}}}}}"#);
            Mock::given(method("GET"))
                .and(path("/simple/price"))
                .and(query_param("ids", *id))
                .respond_with(ResponseTemplate::new(200).set_body_string(body))
                .with_priority(1)
                .mount(&mock_server)
                .await;
        }
        Mock::given(method("GET"))
            .and(path("/simple/price"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .mount(&mock_server)
            .await;
        mock_server
    }
}

struct TestEnv {
    _dir: TempDir,
    config_path: std::path::PathBuf,
}

impl TestEnv {
    fn path(&self) -> &str {
        self.config_path.to_str().unwrap()
    }

    fn config(&self) -> AppConfig {
        AppConfig::load_from_path(&self.config_path).unwrap()
    }
}

fn write_config(yahoo_url: &str, coingecko_url: &str) -> TestEnv {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let config_path = dir.path().join("config.yaml");
    let config_content = format!(
        r#"
accounts:
  - id: alice
    tier: pro
    opening_balance: 20
  - id: bob
    tier: free
    monthly_allowance: 7
    opening_balance: 10
portfolios:
  - id: main
    account: bob
    name: "Main"
    holdings:
      - symbol: AAPL
        amount: 2
        purchase_price: 100
        purchase_date: 2024-01-15
      - symbol: BTC
        amount: 0.5
        purchase_price: 40000
        purchase_date: 2023-06-01
      - symbol: NOPE
        amount: 1
        purchase_price: 10
        purchase_date: 2024-02-01
providers:
  yahoo:
    base_url: {yahoo_url}
  coingecko:
    base_url: {coingecko_url}
fetch:
  concurrency: 4
  timeout_ms: 2000
  retries: 0
data_path: {data}
"#,
        data = dir.path().join("data").display()
    );
    fs::write(&config_path, config_content).expect("Failed to write config file");
    TestEnv {
        _dir: dir,
        config_path,
    }
}

async fn mocked_env() -> (TestEnv, wiremock::MockServer, wiremock::MockServer) {
    let yahoo = test_utils::create_yahoo_mock_server(&[("AAPL", 150.0, 120.0)]).await;
    let coingecko = test_utils::create_coingecko_mock_server(&[("bitcoin", 50000.0, -2.0)]).await;
    let env = write_config(&yahoo.uri(), &coingecko.uri());
    (env, yahoo, coingecko)
}

#[test_log::test(tokio::test)]
async fn test_full_app_flow_with_mock() {
    let (env, _yahoo, _coingecko) = mocked_env().await;

    let result = creditfolio::run_command(
        creditfolio::AppCommand::Portfolio { ids: vec![] },
        Some(env.path()),
    )
    .await;
    assert!(result.is_ok(), "Portfolio command failed with: {:?}", result.err());

    let result = creditfolio::run_command(
        creditfolio::AppCommand::Ledger(creditfolio::LedgerCommand::Audit {
            account: "bob".to_string(),
        }),
        Some(env.path()),
    )
    .await;
    assert!(result.is_ok(), "Audit command failed with: {:?}", result.err());
}

#[test_log::test(tokio::test)]
async fn test_portfolio_metrics_through_provider_chain() {
    let (env, _yahoo, _coingecko) = mocked_env().await;
    let service = creditfolio::build_service(&env.config()).await.unwrap();

    let billed = service.get_portfolio_metrics("main").await.unwrap();
    let metrics = billed.value;
    info!(?metrics, "Computed metrics");

    // Free tier pays one credit for metrics.
    assert_eq!(billed.charge.cost, 1);
    assert_eq!(billed.charge.new_balance, 9);

    let by_symbol = |s: &str| metrics.holdings.iter().find(|h| h.symbol == s).unwrap();
    let aapl = by_symbol("AAPL");
    assert_eq!(aapl.price_source, PriceSource::Live);
    assert_eq!(aapl.current_value, 300.0);
    assert_eq!(aapl.pnl_percentage, 50.0);
    assert!((aapl.change_24h_percent.unwrap() - 25.0).abs() < 1e-9);

    let btc = by_symbol("BTC");
    assert_eq!(btc.current_price, 50000.0);
    assert_eq!(btc.change_24h_percent, Some(-2.0));

    // Unknown everywhere: valued at purchase price, portfolio still computed.
    let nope = by_symbol("NOPE");
    assert_eq!(nope.price_source, PriceSource::Purchase);
    assert_eq!(metrics.degraded_holdings, 1);
    assert_eq!(metrics.total_value, 300.0 + 25000.0 + 10.0);
    assert_eq!(metrics.best_performer.as_deref(), Some("AAPL"));
    assert_eq!(metrics.worst_performer.as_deref(), Some("NOPE"));

    let allocation: f64 = metrics.holdings.iter().map(|h| h.allocation_percentage).sum();
    assert!((allocation - 100.0).abs() < 1e-6);
}

#[test_log::test(tokio::test)]
async fn test_denied_feature_leaves_balance_untouched() {
    let (env, _yahoo, _coingecko) = mocked_env().await;
    let service = creditfolio::build_service(&env.config()).await.unwrap();

    let err = service
        .check_and_debit("bob", "ai_insight", false, "req-1")
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "requires Pro tier");
    assert_eq!(err.status_code(), 403);
    assert_eq!(service.ledger().account("bob").await.unwrap().credit_balance, 10);

    let outcome = service
        .check_and_debit("alice", "ai_insight", false, "req-1")
        .await
        .unwrap();
    assert_eq!(outcome.new_balance, 16);
    let replay = service
        .check_and_debit("alice", "ai_insight", false, "req-1")
        .await
        .unwrap();
    assert!(replay.replayed);
    assert_eq!(service.ledger().account("alice").await.unwrap().credit_balance, 16);
}

#[test_log::test(tokio::test)]
async fn test_concurrent_debits_never_overdraw() {
    let (env, _yahoo, _coingecko) = mocked_env().await;
    let service = creditfolio::build_service(&env.config()).await.unwrap();

    // alice has 20 credits; ten different requests at 4 credits each.
    let attempts = (0..10).map(|i| {
        let service = &service;
        async move {
            service
                .check_and_debit("alice", "ai_insight", false, &format!("req-{i}"))
                .await
        }
    });
    let results = futures::future::join_all(attempts).await;
    let successes = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(successes, 5);
    assert_eq!(service.ledger().account("alice").await.unwrap().credit_balance, 0);
    assert!(service.ledger().audit("alice").await.unwrap().is_consistent());
}

#[test_log::test(tokio::test)]
async fn test_alert_sweep_against_mock_prices() {
    let (env, _yahoo, _coingecko) = mocked_env().await;
    let service = creditfolio::build_service(&env.config()).await.unwrap();

    let above = service
        .create_alert(NewAlert {
            account_id: "alice".to_string(),
            symbol: "BTC".to_string(),
            alert_type: AlertType::PriceAbove,
            target_value: 45000.0,
        })
        .await
        .unwrap();
    service
        .create_alert(NewAlert {
            account_id: "alice".to_string(),
            symbol: "AAPL".to_string(),
            alert_type: AlertType::PercentageChange,
            target_value: 30.0,
        })
        .await
        .unwrap();

    let first = service.evaluate_alerts("alice").await.unwrap();
    let btc = first.value.iter().find(|d| d.alert_id == above.id).unwrap();
    assert!(btc.fired);
    assert_eq!(btc.message, "BTC crossed above 45000");
    // AAPL moved 25%, below the 30% threshold.
    let aapl = first.value.iter().find(|d| d.symbol == "AAPL").unwrap();
    assert!(!aapl.fired);

    // Same price again: the crossing already fired.
    let second = service.evaluate_alerts("alice").await.unwrap();
    assert!(second.value.iter().all(|d| !d.fired));
    assert_eq!(service.alert_triggers(&above.id).await.unwrap().len(), 1);
}

#[test_log::test(tokio::test)]
async fn test_release_command_returns_left_over_hold() {
    let (env, _yahoo, _coingecko) = mocked_env().await;
    {
        // A run that reserved and then died before committing.
        let service = creditfolio::build_service(&env.config()).await.unwrap();
        service
            .ledger()
            .reserve("alice", 4, "ai_insight", "crash-1")
            .await
            .unwrap();
    }

    let release = || {
        creditfolio::AppCommand::Ledger(creditfolio::LedgerCommand::Release {
            account: "alice".to_string(),
            reference: Some("crash-1".to_string()),
        })
    };
    let result = creditfolio::run_command(release(), Some(env.path())).await;
    assert!(result.is_ok(), "Release command failed with: {:?}", result.err());
    assert!(creditfolio::run_command(release(), Some(env.path())).await.is_err());

    let service = creditfolio::build_service(&env.config()).await.unwrap();
    let audit = service.ledger().audit("alice").await.unwrap();
    assert_eq!(audit.balance, 20);
    assert_eq!(audit.held, 0);
    assert!(audit.is_consistent());
}

#[test_log::test(tokio::test)]
async fn test_allowance_granted_once_per_month() {
    let (env, _yahoo, _coingecko) = mocked_env().await;
    let service = creditfolio::build_service(&env.config()).await.unwrap();
    let now = chrono::Utc::now();

    let first = service.ledger().grant_monthly_allowance("bob", now).await.unwrap();
    let second = service.ledger().grant_monthly_allowance("bob", now).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(service.ledger().account("bob").await.unwrap().credit_balance, 17);
}

#[test_log::test(tokio::test)]
async fn test_unknown_portfolio_fails() {
    let (env, _yahoo, _coingecko) = mocked_env().await;
    let result = creditfolio::run_command(
        creditfolio::AppCommand::Portfolio {
            ids: vec!["missing".to_string()],
        },
        Some(env.path()),
    )
    .await;
    assert!(result.is_err());
}

#[test_log::test(tokio::test)]
async fn test_invalid_config_is_rejected() {
    let dir = TempDir::new().unwrap();
    let config_path = dir.path().join("config.yaml");
    fs::write(
        &config_path,
        "accounts: [{id: a, tier: free}]\nportfolios: [{id: p, account: ghost}]\n",
    )
    .unwrap();

    let result = creditfolio::run_command(
        creditfolio::AppCommand::Ledger(creditfolio::LedgerCommand::History {
            account: "a".to_string(),
        }),
        Some(config_path.to_str().unwrap()),
    )
    .await;
    let err = result.unwrap_err();
    assert!(format!("{err:#}").contains("unknown account"));
}
