mod auth;
mod automation;
mod config;
mod db;
mod decision;
mod energy;
mod error;
mod mqtt;
mod scheduler;
mod soil;
mod solar;
mod state;
mod suggestions;
mod weather;
mod web;

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::{env, sync::Arc};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use automation::update_all_farms;
use config::AutomationSettings;
use db::Db;
use weather::WeatherClient;

#[derive(Parser)]
#[command(name = "farm-hub")]
#[command(about = "Farm solar, battery and irrigation automation hub", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the web API, MQTT ingestion and the periodic updater (default)
    Serve,
    /// Update every active farm once, print the results and exit
    UpdateAll,
}

/// Process wiring read from the environment.
struct HubEnv {
    db_url: String,
    config_path: String,
    web_port: u16,
    mqtt: Option<(String, u16)>,
    update_interval_min: u64,
    weather_base_url: String,
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

impl HubEnv {
    fn from_env() -> Self {
        let mqtt = env::var("MQTT_HOST")
            .ok()
            .filter(|h| !h.is_empty())
            .map(|host| (host, env_parse("MQTT_PORT", 1883)));
        Self {
            db_url: env_or("DB_URL", "sqlite:farm-hub.db?mode=rwc"),
            config_path: env_or("CONFIG_PATH", "config.toml"),
            web_port: env_parse("WEB_PORT", 8080),
            mqtt,
            update_interval_min: env_parse("UPDATE_INTERVAL_MIN", 30),
            weather_base_url: env_or("WEATHER_BASE_URL", weather::DEFAULT_BASE_URL),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let hub_env = HubEnv::from_env();

    // ── Database + config file ──────────────────────────────────────
    let db = Db::connect(&hub_env.db_url).await?;
    db.migrate().await?;

    let cfg = config::load(&hub_env.config_path)?;
    config::apply(&cfg, &db).await?;
    let settings = Arc::new(cfg.automation_settings());

    let farms = db.load_farms().await?;
    if farms.is_empty() {
        warn!("no farms configured in the database");
    }
    info!(farms = farms.len(), config = %hub_env.config_path, "db ready");

    let weather = WeatherClient::new(hub_env.weather_base_url.clone())?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(hub_env, db, weather, settings).await,
        Command::UpdateAll => {
            let result = update_all_once(&db, &weather, &settings).await;
            db.close().await;
            result
        }
    }
}

async fn update_all_once(db: &Db, weather: &WeatherClient, settings: &AutomationSettings) -> Result<()> {
    let farms = db.active_farms().await?;
    println!("Updating {} active farms...", farms.len());

    let outcomes = update_all_farms(db, weather, settings, Utc::now()).await?;
    for outcome in &outcomes {
        println!("{outcome}");
    }

    let errors = outcomes.iter().filter(|o| o.is_error()).count();
    println!(
        "\nCompleted: {} updated, {} errors",
        outcomes.len() - errors,
        errors
    );
    Ok(())
}

async fn serve(
    hub_env: HubEnv,
    db: Db,
    weather: WeatherClient,
    settings: Arc<AutomationSettings>,
) -> Result<()> {
    // ── Shared state (ephemeral, for the events endpoint) ───────────
    let shared = state::shared();
    shared.write().await.record_system("hub started".to_string());

    // ── MQTT ingestion ──────────────────────────────────────────────
    match hub_env.mqtt {
        Some((host, port)) => {
            tokio::spawn(mqtt::run(db.clone(), Arc::clone(&shared), host, port));
        }
        None => info!("MQTT_HOST not set, telemetry ingestion disabled"),
    }

    // ── Periodic updater ────────────────────────────────────────────
    if hub_env.update_interval_min > 0 {
        tokio::spawn(scheduler::run(
            db.clone(),
            weather.clone(),
            Arc::clone(&settings),
            Arc::clone(&shared),
            hub_env.update_interval_min,
        ));
    } else {
        info!("UPDATE_INTERVAL_MIN=0, periodic updater disabled");
    }

    // ── Web server ──────────────────────────────────────────────────
    let app = web::AppState {
        db,
        shared,
        weather,
        settings,
    };
    web::serve(app, hub_env.web_port).await
}
