//! Farm-level soil moisture from the attached sensors.

use tracing::warn;

use crate::db::Db;

/// Mean of the latest reading of every active soil-moisture sensor on the
/// farm. `None` when there are no such sensors or readings; lookup failures
/// are logged and read as no data.
pub async fn current_soil_moisture(db: &Db, farm_id: i64) -> Option<f64> {
    match db.latest_soil_moisture_values(farm_id).await {
        Ok(values) => mean(&values),
        Err(e) => {
            warn!(farm = farm_id, "soil moisture lookup failed: {e:#}");
            None
        }
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}
