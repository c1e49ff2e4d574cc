//! Periodic updater: runs the status update for every active farm on a
//! fixed interval and logs each outcome to the hub's event buffer.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

use crate::automation::update_all_farms;
use crate::config::AutomationSettings;
use crate::db::Db;
use crate::state::SharedState;
use crate::weather::WeatherSource;

/// Counts from one batch run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSummary {
    pub updated: usize,
    pub errors: usize,
}

/// Run the updater loop. Intended to be `tokio::spawn`-ed from main.
pub async fn run<W: WeatherSource>(
    db: Db,
    weather: W,
    settings: Arc<AutomationSettings>,
    shared: SharedState,
    interval_min: u64,
) {
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_min * 60));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(interval_min, "periodic updater started");
    shared
        .write()
        .await
        .record_scheduler(format!("periodic updater started (every {interval_min} min)"));

    loop {
        // first tick fires immediately
        ticker.tick().await;
        if let Err(e) = run_once(&db, &weather, &settings, &shared).await {
            error!("periodic update failed: {e:#}");
            shared
                .write()
                .await
                .record_error(format!("periodic update failed: {e:#}"));
        }
    }
}

/// One batch over all active farms.
pub async fn run_once<W: WeatherSource>(
    db: &Db,
    weather: &W,
    settings: &AutomationSettings,
    shared: &SharedState,
) -> Result<BatchSummary> {
    let outcomes = update_all_farms(db, weather, settings, Utc::now()).await?;

    let errors = outcomes.iter().filter(|o| o.is_error()).count();
    let summary = BatchSummary {
        updated: outcomes.len() - errors,
        errors,
    };

    info!(updated = summary.updated, errors = summary.errors, "periodic update done");

    let mut st = shared.write().await;
    for outcome in &outcomes {
        st.record_update(outcome);
    }
    st.record_scheduler(format!(
        "{} updated, {} errors",
        summary.updated, summary.errors
    ));

    Ok(summary)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automation::tests::FakeWeather;
    use crate::db::tests::{seeded_db, test_farm};
    use crate::state::{self, EventKind};
    use crate::weather::tests::synthetic_bundle;

    #[tokio::test]
    async fn batch_updates_every_active_farm() {
        let db = seeded_db().await;
        db.upsert_farm(&test_farm(2, "johnd")).await.unwrap();
        let shared = state::shared();
        let weather = FakeWeather(Some(synthetic_bundle(72, |_| (300.0, 10.0, 0.0, 22.0))));

        let summary = run_once(&db, &weather, &AutomationSettings::default(), &shared)
            .await
            .unwrap();
        assert_eq!(summary, BatchSummary { updated: 2, errors: 0 });

        assert!(db.get_status(1).await.unwrap().is_some());
        assert!(db.get_status(2).await.unwrap().is_some());

        let st = shared.read().await;
        let kinds: Vec<EventKind> = st.events.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![EventKind::Update, EventKind::Update, EventKind::Scheduler]);
        assert_eq!(st.events.back().unwrap().detail, "2 updated, 0 errors");
    }

    #[tokio::test]
    async fn weather_outage_still_updates() {
        let db = seeded_db().await;
        let shared = state::shared();

        let summary = run_once(&db, &FakeWeather(None), &AutomationSettings::default(), &shared)
            .await
            .unwrap();
        assert_eq!(summary.updated, 1);
        assert_eq!(summary.errors, 0);
    }

    #[tokio::test]
    async fn no_farms_is_not_an_error() {
        let db = seeded_db().await;
        db.delete_farm(1).await.unwrap();
        let shared = state::shared();

        let summary = run_once(&db, &FakeWeather(None), &AutomationSettings::default(), &shared)
            .await
            .unwrap();
        assert_eq!(summary, BatchSummary { updated: 0, errors: 0 });
        assert_eq!(shared.read().await.events.back().unwrap().detail, "0 updated, 0 errors");
    }
}
