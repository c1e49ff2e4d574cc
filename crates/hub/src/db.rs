use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Pool, Sqlite};
use std::str::FromStr;

use crate::auth::Role;
use crate::decision::Priority;

#[derive(Clone)]
pub struct Db {
    pub(crate) pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct User {
    pub username: String,
    pub role: Role,
    pub api_token: String,
}

/// Farm installation. Read-only for the automation engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Farm {
    pub farm_id: i64,
    pub name: String,
    pub owner: String,

    pub latitude: f64,
    pub longitude: f64,

    pub panel_efficiency: f64,
    pub system_size_kw: f64,
    pub battery_capacity_kwh: f64,

    pub tilt: i64,
    pub azimuth: i64,
    pub timezone: String,

    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct SensorType {
    pub name: String,
    pub category: String,
    pub unit: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct Sensor {
    pub sensor_id: String,
    pub farm_id: i64,
    pub sensor_type: String,
    pub name: String,
    pub location: String,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, FromRow)]
pub struct Reading {
    pub sensor_id: String,
    pub ts: i64,
    pub value: f64,
}

/// Per-farm state record, overwritten in place on every update cycle.
///
/// `battery_kwh` tracks `battery_level / 100 * capacity`; the energy
/// simulator keeps the pair consistent, the table does not.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemStatus {
    pub farm_id: i64,

    pub battery_level: f64,
    pub battery_kwh: f64,

    pub pv_output_kw: f64,
    pub gti: f64,

    pub irrigation_on: bool,
    pub irrigation_reason: String,
    pub irrigation_priority: Priority,

    pub current_load_kw: f64,
    pub domestic_load_kw: f64,
    pub irrigation_load_kw: f64,
    pub water_treatment_load_kw: f64,

    pub current_soil_moisture: Option<f64>,
    pub current_temperature: Option<f64>,
    pub current_rain: f64,
    pub current_clouds: f64,

    pub last_updated: i64, // unix seconds
}

#[derive(FromRow)]
struct StatusRow {
    farm_id: i64,
    battery_level: f64,
    battery_kwh: f64,
    pv_output_kw: f64,
    gti: f64,
    irrigation_on: bool,
    irrigation_reason: String,
    irrigation_priority: String,
    current_load_kw: f64,
    domestic_load_kw: f64,
    irrigation_load_kw: f64,
    water_treatment_load_kw: f64,
    current_soil_moisture: Option<f64>,
    current_temperature: Option<f64>,
    current_rain: f64,
    current_clouds: f64,
    last_updated: i64,
}

impl From<StatusRow> for SystemStatus {
    fn from(r: StatusRow) -> Self {
        Self {
            farm_id: r.farm_id,
            battery_level: r.battery_level,
            battery_kwh: r.battery_kwh,
            pv_output_kw: r.pv_output_kw,
            gti: r.gti,
            irrigation_on: r.irrigation_on,
            irrigation_reason: r.irrigation_reason,
            // Unknown tiers only appear after manual edits; treat as optional.
            irrigation_priority: r.irrigation_priority.parse().unwrap_or(Priority::Optional),
            current_load_kw: r.current_load_kw,
            domestic_load_kw: r.domestic_load_kw,
            irrigation_load_kw: r.irrigation_load_kw,
            water_treatment_load_kw: r.water_treatment_load_kw,
            current_soil_moisture: r.current_soil_moisture,
            current_temperature: r.current_temperature,
            current_rain: r.current_rain,
            current_clouds: r.current_clouds,
            last_updated: r.last_updated,
        }
    }
}

const FARM_COLUMNS: &str = "farm_id, name, owner, latitude, longitude, panel_efficiency, \
     system_size_kw, battery_capacity_kwh, tilt, azimuth, timezone, is_active";

const STATUS_COLUMNS: &str = "farm_id, battery_level, battery_kwh, pv_output_kw, gti, \
     irrigation_on, irrigation_reason, irrigation_priority, current_load_kw, domestic_load_kw, \
     irrigation_load_kw, water_treatment_load_kw, current_soil_moisture, current_temperature, \
     current_rain, current_clouds, last_updated";

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/farm-hub/farm-hub.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        // Every in-memory connection is its own database; keep exactly one
        // alive for the life of the pool.
        let mut pool_options = SqlitePoolOptions::new().max_connections(5);
        if db_url.contains(":memory:") {
            pool_options = pool_options
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        }

        let pool = pool_options
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ----------------------------
    // Users
    // ----------------------------

    pub async fn upsert_user(&self, u: &User) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO users (username, role, api_token)
            VALUES (?, ?, ?)
            ON CONFLICT(username) DO UPDATE SET
              role=excluded.role,
              api_token=excluded.api_token
            "#,
        )
        .bind(&u.username)
        .bind(u.role.as_str())
        .bind(&u.api_token)
        .execute(&self.pool)
        .await
        .context("upsert_user failed")?;
        Ok(())
    }

    pub async fn user_by_token(&self, token: &str) -> Result<Option<User>> {
        let row: Option<(String, String, String)> =
            sqlx::query_as("SELECT username, role, api_token FROM users WHERE api_token = ?")
                .bind(token)
                .fetch_optional(&self.pool)
                .await
                .context("user_by_token failed")?;

        row.map(|(username, role, api_token)| -> Result<User> {
            let role = role
                .parse::<Role>()
                .map_err(|e| anyhow!("user '{username}': {e}"))?;
            Ok(User {
                username,
                role,
                api_token,
            })
        })
        .transpose()
    }

    // ----------------------------
    // Farms
    // ----------------------------

    pub async fn upsert_farm(&self, f: &Farm) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO farms (
              farm_id, name, owner,
              latitude, longitude,
              panel_efficiency, system_size_kw, battery_capacity_kwh,
              tilt, azimuth, timezone, is_active
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(farm_id) DO UPDATE SET
              name=excluded.name,
              owner=excluded.owner,
              latitude=excluded.latitude,
              longitude=excluded.longitude,
              panel_efficiency=excluded.panel_efficiency,
              system_size_kw=excluded.system_size_kw,
              battery_capacity_kwh=excluded.battery_capacity_kwh,
              tilt=excluded.tilt,
              azimuth=excluded.azimuth,
              timezone=excluded.timezone,
              is_active=excluded.is_active
            "#,
        )
        .bind(f.farm_id)
        .bind(&f.name)
        .bind(&f.owner)
        .bind(f.latitude)
        .bind(f.longitude)
        .bind(f.panel_efficiency)
        .bind(f.system_size_kw)
        .bind(f.battery_capacity_kwh)
        .bind(f.tilt)
        .bind(f.azimuth)
        .bind(&f.timezone)
        .bind(f.is_active)
        .execute(&self.pool)
        .await
        .context("upsert_farm failed")?;
        Ok(())
    }

    pub async fn load_farms(&self) -> Result<Vec<Farm>> {
        sqlx::query_as::<_, Farm>(&format!(
            "SELECT {FARM_COLUMNS} FROM farms ORDER BY farm_id"
        ))
        .fetch_all(&self.pool)
        .await
        .context("load_farms failed")
    }

    pub async fn active_farms(&self) -> Result<Vec<Farm>> {
        sqlx::query_as::<_, Farm>(&format!(
            "SELECT {FARM_COLUMNS} FROM farms WHERE is_active = 1 ORDER BY farm_id"
        ))
        .fetch_all(&self.pool)
        .await
        .context("active_farms failed")
    }

    pub async fn get_farm(&self, farm_id: i64) -> Result<Option<Farm>> {
        sqlx::query_as::<_, Farm>(&format!(
            "SELECT {FARM_COLUMNS} FROM farms WHERE farm_id = ?"
        ))
        .bind(farm_id)
        .fetch_optional(&self.pool)
        .await
        .context("get_farm failed")
    }

    #[cfg(test)]
    pub async fn delete_farm(&self, farm_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM farms WHERE farm_id = ?")
            .bind(farm_id)
            .execute(&self.pool)
            .await
            .context("delete_farm failed")?;
        Ok(())
    }

    // ----------------------------
    // Sensor types + sensors
    // ----------------------------

    pub async fn upsert_sensor_type(&self, t: &SensorType) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sensor_types (name, category, unit)
            VALUES (?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
              category=excluded.category,
              unit=excluded.unit
            "#,
        )
        .bind(&t.name)
        .bind(&t.category)
        .bind(&t.unit)
        .execute(&self.pool)
        .await
        .context("upsert_sensor_type failed")?;
        Ok(())
    }

    pub async fn upsert_sensor(&self, s: &Sensor) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sensors (sensor_id, farm_id, sensor_type, name, location, is_active)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(sensor_id) DO UPDATE SET
              farm_id=excluded.farm_id,
              sensor_type=excluded.sensor_type,
              name=excluded.name,
              location=excluded.location,
              is_active=excluded.is_active
            "#,
        )
        .bind(&s.sensor_id)
        .bind(s.farm_id)
        .bind(&s.sensor_type)
        .bind(&s.name)
        .bind(&s.location)
        .bind(s.is_active)
        .execute(&self.pool)
        .await
        .context("upsert_sensor failed")?;
        Ok(())
    }

    pub async fn get_sensor(&self, sensor_id: &str) -> Result<Option<Sensor>> {
        sqlx::query_as::<_, Sensor>(
            r#"
            SELECT sensor_id, farm_id, sensor_type, name, location, is_active
            FROM sensors
            WHERE sensor_id = ?
            "#,
        )
        .bind(sensor_id)
        .fetch_optional(&self.pool)
        .await
        .context("get_sensor failed")
    }

    /// Active sensors installed on a farm.
    pub async fn sensors_for_farm(&self, farm_id: i64) -> Result<Vec<Sensor>> {
        sqlx::query_as::<_, Sensor>(
            r#"
            SELECT sensor_id, farm_id, sensor_type, name, location, is_active
            FROM sensors
            WHERE farm_id = ? AND is_active = 1
            ORDER BY sensor_type, name
            "#,
        )
        .bind(farm_id)
        .fetch_all(&self.pool)
        .await
        .context("sensors_for_farm failed")
    }

    // ----------------------------
    // Readings
    // ----------------------------

    pub async fn insert_reading(&self, ts: i64, sensor_id: &str, value: f64) -> Result<()> {
        sqlx::query("INSERT INTO sensor_readings (ts, sensor_id, value) VALUES (?, ?, ?)")
            .bind(ts)
            .bind(sensor_id)
            .bind(value)
            .execute(&self.pool)
            .await
            .context("insert_reading failed")?;
        Ok(())
    }

    /// Readings for a sensor at or after `since`, newest first.
    pub async fn readings_since(&self, sensor_id: &str, since: i64) -> Result<Vec<Reading>> {
        sqlx::query_as::<_, Reading>(
            r#"
            SELECT sensor_id, ts, value
            FROM sensor_readings
            WHERE sensor_id = ? AND ts >= ?
            ORDER BY ts DESC, id DESC
            "#,
        )
        .bind(sensor_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .context("readings_since failed")
    }

    /// Latest value of every active soil-moisture sensor on a farm, one per
    /// sensor. Sensors without any reading contribute nothing.
    pub async fn latest_soil_moisture_values(&self, farm_id: i64) -> Result<Vec<f64>> {
        let rows: Vec<(f64,)> = sqlx::query_as(
            r#"
            SELECT latest FROM (
              SELECT s.sensor_id AS sensor_id, (
                SELECT r.value
                FROM sensor_readings r
                WHERE r.sensor_id = s.sensor_id
                ORDER BY r.ts DESC, r.id DESC
                LIMIT 1
              ) AS latest
              FROM sensors s
              JOIN sensor_types t ON t.name = s.sensor_type
              WHERE s.farm_id = ?
                AND s.is_active = 1
                AND t.category = 'soil'
                AND LOWER(t.name) LIKE '%soil moisture%'
            )
            WHERE latest IS NOT NULL
            ORDER BY sensor_id
            "#,
        )
        .bind(farm_id)
        .fetch_all(&self.pool)
        .await
        .context("latest_soil_moisture_values failed")?;

        Ok(rows.into_iter().map(|(v,)| v).collect())
    }

    // ----------------------------
    // System status
    // ----------------------------

    pub async fn get_status(&self, farm_id: i64) -> Result<Option<SystemStatus>> {
        let row = sqlx::query_as::<_, StatusRow>(&format!(
            "SELECT {STATUS_COLUMNS} FROM system_status WHERE farm_id = ?"
        ))
        .bind(farm_id)
        .fetch_optional(&self.pool)
        .await
        .context("get_status failed")?;
        Ok(row.map(SystemStatus::from))
    }

    /// Fetch a farm's status, creating it at `initial_level` percent on first
    /// access.
    pub async fn get_or_create_status(
        &self,
        farm: &Farm,
        initial_level: f64,
        now_ts: i64,
    ) -> Result<SystemStatus> {
        let initial_kwh = farm.battery_capacity_kwh * initial_level / 100.0;
        sqlx::query(
            r#"
            INSERT INTO system_status (farm_id, battery_level, battery_kwh, last_updated)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(farm_id) DO NOTHING
            "#,
        )
        .bind(farm.farm_id)
        .bind(initial_level)
        .bind(initial_kwh)
        .bind(now_ts)
        .execute(&self.pool)
        .await
        .context("get_or_create_status insert failed")?;

        self.get_status(farm.farm_id)
            .await?
            .with_context(|| format!("status row missing for farm {}", farm.farm_id))
    }

    pub async fn save_status(&self, s: &SystemStatus) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE system_status SET
              battery_level = ?,
              battery_kwh = ?,
              pv_output_kw = ?,
              gti = ?,
              irrigation_on = ?,
              irrigation_reason = ?,
              irrigation_priority = ?,
              current_load_kw = ?,
              domestic_load_kw = ?,
              irrigation_load_kw = ?,
              water_treatment_load_kw = ?,
              current_soil_moisture = ?,
              current_temperature = ?,
              current_rain = ?,
              current_clouds = ?,
              last_updated = ?
            WHERE farm_id = ?
            "#,
        )
        .bind(s.battery_level)
        .bind(s.battery_kwh)
        .bind(s.pv_output_kw)
        .bind(s.gti)
        .bind(s.irrigation_on)
        .bind(&s.irrigation_reason)
        .bind(s.irrigation_priority.as_str())
        .bind(s.current_load_kw)
        .bind(s.domestic_load_kw)
        .bind(s.irrigation_load_kw)
        .bind(s.water_treatment_load_kw)
        .bind(s.current_soil_moisture)
        .bind(s.current_temperature)
        .bind(s.current_rain)
        .bind(s.current_clouds)
        .bind(s.last_updated)
        .bind(s.farm_id)
        .execute(&self.pool)
        .await
        .context("save_status failed")?;
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
