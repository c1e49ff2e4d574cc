//! Per-farm status update: weather → PV → soil → decision → energy → DB.

use anyhow::{Context, Result};
use chrono::{DateTime, Timelike, Utc};
use serde::Serialize;
use std::fmt;
use tracing::{error, info};

use crate::config::{AutomationConfig, AutomationSettings};
use crate::db::{Db, Farm, SystemStatus};
use crate::decision::{apply_forecast_override, decide};
use crate::energy::{forecast_battery_next_hour, simulate_energy_flow};
use crate::soil::current_soil_moisture;
use crate::solar::pv_output_kw;
use crate::weather::{weather_report, WeatherSource};

/// Run one update cycle for `farm` and persist the resulting status.
///
/// Weather and soil lookups degrade instead of failing; any other error
/// (database) is returned.
pub async fn update_farm_status<W: WeatherSource>(
    db: &Db,
    weather: &W,
    cfg: &AutomationConfig,
    farm: &Farm,
    now: DateTime<Utc>,
) -> Result<SystemStatus> {
    let status = db
        .get_or_create_status(farm, cfg.initial_battery_level, now.timestamp())
        .await?;

    let report = weather_report(weather, farm, cfg.forecast_days, now).await;
    let pv_kw = pv_output_kw(report.current.gti, farm.panel_efficiency, farm.system_size_kw);
    let soil_moisture = current_soil_moisture(db, farm.farm_id).await;

    // Can the battery climb back to the floor within the hour on sunlight
    // alone, carrying only the base domestic load?
    let outlook = report.next_hour_gti().map(|gti| {
        forecast_battery_next_hour(
            pv_output_kw(gti, farm.panel_efficiency, farm.system_size_kw),
            status.battery_level,
            farm.battery_capacity_kwh,
            cfg.domestic_load_base_kw,
            cfg,
        )
    });

    let decision = decide(
        &report.current,
        &report.tomorrow,
        status.battery_level,
        soil_moisture,
        cfg,
    );
    let decision = apply_forecast_override(decision, outlook.as_ref(), soil_moisture, cfg);

    let step = simulate_energy_flow(
        pv_kw,
        decision.irrigation,
        decision.priority,
        status.battery_level,
        farm.battery_capacity_kwh,
        now.hour(),
        cfg,
    );

    let updated = SystemStatus {
        farm_id: farm.farm_id,
        battery_level: step.battery_level,
        battery_kwh: step.battery_kwh,
        pv_output_kw: pv_kw,
        gti: report.current.gti,
        irrigation_on: decision.irrigation,
        irrigation_reason: decision.reason,
        irrigation_priority: decision.priority,
        current_load_kw: step.load.total_kw,
        domestic_load_kw: step.load.domestic_kw,
        irrigation_load_kw: step.load.irrigation_kw,
        water_treatment_load_kw: step.load.water_treatment_kw,
        current_soil_moisture: soil_moisture,
        current_temperature: Some(report.current.temperature),
        current_rain: report.current.rain,
        current_clouds: report.current.clouds,
        last_updated: now.timestamp(),
    };
    db.save_status(&updated)
        .await
        .with_context(|| format!("saving status of farm {}", farm.farm_id))?;

    info!(
        farm = farm.farm_id,
        pv_kw,
        battery = updated.battery_level,
        irrigation = updated.irrigation_on,
        priority = %updated.irrigation_priority,
        soil = ?soil_moisture,
        load_kw = format!("{:.2}", step.load.total_kw),
        "status updated"
    );

    Ok(updated)
}

/// Result of one farm within a batch update.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum FarmUpdateOutcome {
    Updated {
        farm_id: i64,
        farm_name: String,
        battery_level: f64,
        pv_output_kw: f64,
        irrigation_on: bool,
    },
    Error {
        farm_id: i64,
        farm_name: String,
        error: String,
    },
}

impl FarmUpdateOutcome {
    pub fn updated(farm: &Farm, s: &SystemStatus) -> Self {
        Self::Updated {
            farm_id: farm.farm_id,
            farm_name: farm.name.clone(),
            battery_level: s.battery_level,
            pv_output_kw: s.pv_output_kw,
            irrigation_on: s.irrigation_on,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

/// One console line per farm, as printed by `farm-hub update-all`.
impl fmt::Display for FarmUpdateOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Updated {
                farm_name,
                battery_level,
                pv_output_kw,
                irrigation_on,
                ..
            } => write!(
                f,
                "✓ {farm_name}: Battery {battery_level}%, PV {pv_output_kw}kW, Irrigation: {}",
                if *irrigation_on { "ON" } else { "OFF" }
            ),
            Self::Error {
                farm_name, error, ..
            } => write!(f, "✗ {farm_name}: Error - {error}"),
        }
    }
}

/// Update every active farm. A failing farm is recorded and the batch moves
/// on; only failing to list the farms is an error.
pub async fn update_all_farms<W: WeatherSource>(
    db: &Db,
    weather: &W,
    settings: &AutomationSettings,
    now: DateTime<Utc>,
) -> Result<Vec<FarmUpdateOutcome>> {
    let farms = db.active_farms().await?;
    let mut outcomes = Vec::with_capacity(farms.len());

    for farm in farms {
        let cfg = settings.for_farm(farm.farm_id);
        let outcome = match update_farm_status(db, weather, cfg, &farm, now).await {
            Ok(s) => FarmUpdateOutcome::updated(&farm, &s),
            Err(e) => {
                error!(farm = farm.farm_id, "status update failed: {e:#}");
                FarmUpdateOutcome::Error {
                    farm_id: farm.farm_id,
                    farm_name: farm.name,
                    error: format!("{e:#}"),
                }
            }
        };
        outcomes.push(outcome);
    }

    Ok(outcomes)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::tests::{seeded_db, soil_sensor, test_farm};
    use crate::decision::Priority;
    use crate::weather::tests::synthetic_bundle;
    use crate::weather::ForecastBundle;
    use chrono::TimeZone;

    /// Serves a fixed forecast, or fails every lookup.
    pub(crate) struct FakeWeather(pub Option<ForecastBundle>);

    impl WeatherSource for FakeWeather {
        async fn fetch_forecast(&self, _farm: &Farm, _days: u32) -> Result<ForecastBundle> {
            self.0.clone().context("weather service down")
        }
    }

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    fn sunny() -> FakeWeather {
        FakeWeather(Some(synthetic_bundle(72, |_| (500.0, 20.0, 0.0, 25.0))))
    }

    async fn add_moisture(db: &Db, farm_id: i64, value: f64) {
        let id = format!("n{farm_id}/m1");
        db.upsert_sensor(&soil_sensor(&id, farm_id)).await.unwrap();
        db.insert_reading(1, &id, value).await.unwrap();
    }

    #[tokio::test]
    async fn sunny_dry_farm_irrigates_critically() {
        let db = seeded_db().await;
        add_moisture(&db, 1, 25.0).await;
        let farm = db.get_farm(1).await.unwrap().unwrap();
        let cfg = AutomationConfig::default();

        let s = update_farm_status(&db, &sunny(), &cfg, &farm, noon()).await.unwrap();
        assert_eq!(s.pv_output_kw, 11.7);
        assert_eq!(s.gti, 500.0);
        assert!(s.irrigation_on);
        assert_eq!(s.irrigation_priority, Priority::Critical);
        assert_eq!(s.current_soil_moisture, Some(25.0));
        assert_eq!(s.current_temperature, Some(25.0));
        assert_eq!(s.domestic_load_kw, 1.0);
        assert_eq!(s.irrigation_load_kw, 2.0);
        assert_eq!(s.last_updated, noon().timestamp());

        // 70% of 1320 kWh + (11.7 - 3.0)
        assert!((s.battery_kwh - (924.0 + 8.7)).abs() < 1e-9);

        let stored = db.get_status(1).await.unwrap().unwrap();
        assert_eq!(stored, s);
    }

    #[tokio::test]
    async fn weather_outage_degrades_to_zero_weather() {
        let db = seeded_db().await;
        let farm = db.get_farm(1).await.unwrap().unwrap();
        let cfg = AutomationConfig::default();

        let s = update_farm_status(&db, &FakeWeather(None), &cfg, &farm, noon())
            .await
            .unwrap();
        assert_eq!(s.pv_output_kw, 0.0);
        assert_eq!(s.current_rain, 0.0);
        assert_eq!(s.current_clouds, 0.0);
        // No soil data, no rain, no clouds: weather heuristic says irrigate.
        assert!(s.irrigation_on);
        assert_eq!(s.irrigation_priority, Priority::Normal);
        assert!(s.battery_level < 70.0);
    }

    #[tokio::test]
    async fn repeated_runs_give_same_battery_delta() {
        let db = seeded_db().await;
        let mut farm = test_farm(1, "johnd");
        farm.battery_capacity_kwh = 100.0;
        db.upsert_farm(&farm).await.unwrap();
        add_moisture(&db, 1, 80.0).await;

        let weather = FakeWeather(Some(synthetic_bundle(72, |_| (100.0, 20.0, 0.0, 22.0))));
        let cfg = AutomationConfig::default();

        let s0 = db.get_or_create_status(&farm, 70.0, 0).await.unwrap().battery_level;
        let s1 = update_farm_status(&db, &weather, &cfg, &farm, noon()).await.unwrap();
        let s2 = update_farm_status(&db, &weather, &cfg, &farm, noon()).await.unwrap();

        assert!(!s1.irrigation_on && !s2.irrigation_on);
        let d1 = s1.battery_level - s0;
        let d2 = s2.battery_level - s1.battery_level;
        assert!((d1 - 1.34).abs() < 1e-6, "{d1}");
        assert!((d1 - d2).abs() < 1e-6, "{d1} vs {d2}");
    }

    #[tokio::test]
    async fn low_battery_uses_next_hour_forecast() {
        let db = seeded_db().await;
        let mut farm = test_farm(1, "johnd");
        farm.battery_capacity_kwh = 100.0;
        db.upsert_farm(&farm).await.unwrap();
        add_moisture(&db, 1, 40.0).await;

        // Dark now, bright next hour: 1000 W/m² → 23.4 kW.
        let weather = FakeWeather(Some(synthetic_bundle(72, |i| {
            let gti = if i == 13 { 1000.0 } else { 0.0 };
            (gti, 20.0, 0.0, 22.0)
        })));
        let cfg = AutomationConfig {
            initial_battery_level: 15.0,
            ..AutomationConfig::default()
        };

        let s = update_farm_status(&db, &weather, &cfg, &farm, noon()).await.unwrap();
        assert!(s.irrigation_on);
        assert_eq!(s.irrigation_priority, Priority::Normal);
        assert!(s.irrigation_reason.starts_with("Forecast shows battery can reach 37.4%"));
    }

    #[tokio::test]
    async fn batch_isolates_failures() {
        let db = seeded_db().await;
        db.upsert_farm(&test_farm(2, "johnd")).await.unwrap();
        let mut inactive = test_farm(3, "johnd");
        inactive.is_active = false;
        db.upsert_farm(&inactive).await.unwrap();

        let settings = AutomationSettings::default();
        let out = update_all_farms(&db, &sunny(), &settings, noon()).await.unwrap();
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|o| !o.is_error()));

        let json = serde_json::to_value(&out[0]).unwrap();
        assert_eq!(json["status"], "updated");
        assert_eq!(json["farm_id"], 1);
        assert_eq!(json["pv_output_kw"], 11.7);
    }

    #[tokio::test]
    async fn batch_reports_database_errors_per_farm() {
        let db = seeded_db().await;
        db.upsert_farm(&test_farm(2, "johnd")).await.unwrap();
        // Status writes for farm 2 are rejected.
        sqlx::query("CREATE TRIGGER fail_farm_2 BEFORE UPDATE ON system_status \
                     WHEN NEW.farm_id = 2 BEGIN SELECT RAISE(ABORT, 'disk on fire'); END")
            .execute(&db.pool)
            .await
            .unwrap();

        let settings = AutomationSettings::default();
        let out = update_all_farms(&db, &sunny(), &settings, noon()).await.unwrap();
        assert_eq!(out.len(), 2);
        assert!(!out[0].is_error());
        match &out[1] {
            FarmUpdateOutcome::Error { farm_id, error, .. } => {
                assert_eq!(*farm_id, 2);
                assert!(error.contains("disk on fire"), "{error}");
            }
            other => panic!("expected error, got {other:?}"),
        }
        let json = serde_json::to_value(&out[1]).unwrap();
        assert_eq!(json["status"], "error");
    }

    #[test]
    fn console_lines() {
        let ok = FarmUpdateOutcome::Updated {
            farm_id: 1,
            farm_name: "Kilima".into(),
            battery_level: 70.66,
            pv_output_kw: 11.7,
            irrigation_on: true,
        };
        assert_eq!(ok.to_string(), "✓ Kilima: Battery 70.66%, PV 11.7kW, Irrigation: ON");
        let err = FarmUpdateOutcome::Error {
            farm_id: 2,
            farm_name: "Mto".into(),
            error: "db locked".into(),
        };
        assert_eq!(err.to_string(), "✗ Mto: Error - db locked");
    }

    #[tokio::test]
    async fn per_farm_overrides_apply() {
        let db = seeded_db().await;
        add_moisture(&db, 1, 25.0).await;
        let mut settings = AutomationSettings::default();
        settings.per_farm.insert(
            1,
            AutomationConfig {
                soil_moisture_low: 20.0,
                ..AutomationConfig::default()
            },
        );
        update_all_farms(&db, &sunny(), &settings, noon()).await.unwrap();
        let s = db.get_status(1).await.unwrap().unwrap();
        assert_eq!(s.irrigation_priority, Priority::Normal);
    }
}
