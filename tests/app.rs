mod common;

use common::free_port;
use sni_router::App;
use sni_router::config::AppConfig;
use sni_router::events::FleetEvent;
use sni_router::rules::{Action, Rule};
use std::time::Duration;

async fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.proxy.bind_address = "127.0.0.1".to_string();
    config.proxy.start_port = free_port().await;
    config.proxy.proxy_list = "127.0.0.1:3128".to_string();
    config.status.port = 0;
    config.status.bind_address = "127.0.0.1".to_string();
    config
}

#[tokio::test]
async fn test_app_start_and_shutdown() {
    let config = test_config().await;
    let start_port = config.proxy.start_port;

    let mut app = App::new(config);
    let status = app.start().await.unwrap().unwrap();
    assert!(status.running);
    assert_eq!(status.proxies[0].local_port, start_port);
    assert!(app.status_addr().is_some());

    let health = reqwest::Client::builder()
        .no_proxy()
        .build()
        .unwrap()
        .get(format!("http://{}/health", app.status_addr().unwrap()))
        .send()
        .await
        .unwrap();
    assert!(health.status().is_success());

    app.shutdown().await;
    assert!(!app.fleet().is_running().await);
}

#[tokio::test]
async fn test_app_without_auto_start() {
    let mut config = test_config().await;
    config.proxy.auto_start = false;
    config.status.enabled = false;

    let mut app = App::new(config);
    assert!(app.start().await.unwrap().is_none());
    assert!(!app.fleet().is_running().await);
    assert!(app.status_addr().is_none());
    app.shutdown().await;
}

#[tokio::test]
async fn test_reload_rules_keeps_listeners() {
    let mut config = test_config().await;
    config.status.enabled = false;
    let mut app = App::new(config.clone());
    app.start().await.unwrap();

    let mut reloaded = config.clone();
    reloaded.proxy.default_action = Action::Direct;
    reloaded.rules.push(Rule {
        id: "corp".to_string(),
        name: "Corp".to_string(),
        pattern: "*.corp".to_string(),
        action: Action::Proxy,
        enabled: true,
        priority: 1,
    });
    app.reload(reloaded).await.unwrap();

    let fleet = app.fleet();
    assert!(fleet.is_running().await);
    assert_eq!(fleet.router().rule_count(), 2);
    assert_eq!(fleet.router().default_action(), Action::Direct);
    assert_eq!(fleet.router().match_host("git.corp").action, Action::Proxy);
    let status = fleet.get_status().await;
    assert_eq!(status.proxies[0].local_port, config.proxy.start_port);

    app.shutdown().await;
}

#[tokio::test]
async fn test_reload_with_new_port_restarts() {
    let mut config = test_config().await;
    config.status.enabled = false;
    let mut app = App::new(config.clone());
    app.start().await.unwrap();

    let mut reloaded = config.clone();
    reloaded.proxy.start_port = free_port().await;
    let new_port = reloaded.proxy.start_port;
    app.reload(reloaded).await.unwrap();

    let status = app.fleet().get_status().await;
    assert!(status.running);
    assert_eq!(status.proxies[0].local_port, new_port);
    assert_eq!(app.config().proxy.start_port, new_port);

    app.shutdown().await;
}

#[tokio::test]
async fn test_reload_rejects_invalid_config() {
    let mut config = test_config().await;
    config.status.enabled = false;
    config.proxy.auto_start = false;
    let mut app = App::new(config.clone());
    app.start().await.unwrap();

    let mut bad = config.clone();
    bad.rules[0].pattern = "[".to_string();
    assert!(app.reload(bad).await.is_err());
    assert_eq!(app.config().rules[0].pattern, config.rules[0].pattern);
}

#[tokio::test]
async fn test_reload_tunnel_settings_restarts_fleet() {
    let mut config = test_config().await;
    config.status.enabled = false;
    let mut app = App::new(config.clone());
    app.start().await.unwrap();
    let mut events = app.fleet().subscribe();

    let mut reloaded = config.clone();
    reloaded.tunnel.sniff_timeout_ms = 50;
    reloaded.tunnel.max_sniff_bytes = 1024;
    app.reload(reloaded).await.unwrap();

    assert!(matches!(events.recv().await.unwrap(), FleetEvent::Stopped));
    assert!(matches!(events.recv().await.unwrap(), FleetEvent::Started(_)));
    let sniff = app.fleet().sniff_config().await;
    assert_eq!(sniff.timeout, Duration::from_millis(50));
    assert_eq!(sniff.max_bytes, 1024);
    assert!(app.fleet().is_running().await);

    app.shutdown().await;
}

#[tokio::test]
async fn test_reload_events_section_is_kept_without_restart() {
    let mut config = test_config().await;
    config.status.enabled = false;
    let mut app = App::new(config.clone());
    app.start().await.unwrap();
    let mut events = app.fleet().subscribe();

    let mut reloaded = config.clone();
    reloaded.events.traffic_log_capacity = 10;
    app.reload(reloaded).await.unwrap();

    assert_eq!(app.config().events.traffic_log_capacity, 10);
    assert!(app.fleet().is_running().await);
    assert!(events.try_recv().is_err());

    app.shutdown().await;
}
