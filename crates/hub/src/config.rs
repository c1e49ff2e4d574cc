//! TOML config file loading, validation, and database seeding for users,
//! sensor types, farms and sensors, plus the automation thresholds that the
//! decision engine and energy simulator run against.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};

use crate::auth::Role;
use crate::db::{Db, Farm, Sensor, SensorType, User};

// ---------------------------------------------------------------------------
// Automation thresholds
// ---------------------------------------------------------------------------

/// Thresholds and load weights for one farm's automation run.
///
/// Percentages are 0-100, loads are kW.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AutomationConfig {
    /// Battery floor (%) below which only critical irrigation may run.
    pub min_battery: f64,
    /// Battery level (%) above which the farmer is told energy-intensive
    /// work can run.
    pub max_battery: f64,
    /// Cloud cover (%) above which tomorrow counts as "cloudy".
    pub cloud_threshold: f64,
    /// Current precipitation (mm) above which irrigation is suppressed.
    pub rain_threshold_mm: f64,
    pub soil_moisture_low: f64,
    pub soil_moisture_optimal: f64,
    /// At or above this the soil is reported as high rather than adequate.
    pub soil_moisture_high: f64,
    pub domestic_load_base_kw: f64,
    pub irrigation_load_kw: f64,
    /// Cap on the non-essential water-treatment load (surplus PV only).
    pub water_treatment_load_kw: f64,
    /// Fraction of domestic load kept when critical irrigation runs on a
    /// low battery.
    pub critical_domestic_factor: f64,
    pub water_treatment_enabled: bool,
    /// Battery level (%) for a freshly created status record.
    pub initial_battery_level: f64,
    pub forecast_days: u32,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            min_battery: 20.0,
            max_battery: 80.0,
            cloud_threshold: 60.0,
            rain_threshold_mm: 0.5,
            soil_moisture_low: 30.0,
            soil_moisture_optimal: 50.0,
            soil_moisture_high: 70.0,
            domestic_load_base_kw: 1.0,
            irrigation_load_kw: 2.0,
            water_treatment_load_kw: 1.5,
            critical_domestic_factor: 0.7,
            water_treatment_enabled: false,
            initial_battery_level: 70.0,
            forecast_days: 7,
        }
    }
}

/// Per-farm partial override of [`AutomationConfig`]. Unset fields inherit
/// the global value.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AutomationOverrides {
    pub min_battery: Option<f64>,
    pub max_battery: Option<f64>,
    pub cloud_threshold: Option<f64>,
    pub rain_threshold_mm: Option<f64>,
    pub soil_moisture_low: Option<f64>,
    pub soil_moisture_optimal: Option<f64>,
    pub soil_moisture_high: Option<f64>,
    pub domestic_load_base_kw: Option<f64>,
    pub irrigation_load_kw: Option<f64>,
    pub water_treatment_load_kw: Option<f64>,
    pub critical_domestic_factor: Option<f64>,
    pub water_treatment_enabled: Option<bool>,
    pub initial_battery_level: Option<f64>,
    pub forecast_days: Option<u32>,
}

impl AutomationOverrides {
    pub fn merge_over(&self, base: &AutomationConfig) -> AutomationConfig {
        AutomationConfig {
            min_battery: self.min_battery.unwrap_or(base.min_battery),
            max_battery: self.max_battery.unwrap_or(base.max_battery),
            cloud_threshold: self.cloud_threshold.unwrap_or(base.cloud_threshold),
            rain_threshold_mm: self.rain_threshold_mm.unwrap_or(base.rain_threshold_mm),
            soil_moisture_low: self.soil_moisture_low.unwrap_or(base.soil_moisture_low),
            soil_moisture_optimal: self
                .soil_moisture_optimal
                .unwrap_or(base.soil_moisture_optimal),
            soil_moisture_high: self.soil_moisture_high.unwrap_or(base.soil_moisture_high),
            domestic_load_base_kw: self
                .domestic_load_base_kw
                .unwrap_or(base.domestic_load_base_kw),
            irrigation_load_kw: self.irrigation_load_kw.unwrap_or(base.irrigation_load_kw),
            water_treatment_load_kw: self
                .water_treatment_load_kw
                .unwrap_or(base.water_treatment_load_kw),
            critical_domestic_factor: self
                .critical_domestic_factor
                .unwrap_or(base.critical_domestic_factor),
            water_treatment_enabled: self
                .water_treatment_enabled
                .unwrap_or(base.water_treatment_enabled),
            initial_battery_level: self
                .initial_battery_level
                .unwrap_or(base.initial_battery_level),
            forecast_days: self.forecast_days.unwrap_or(base.forecast_days),
        }
    }
}

/// Resolved automation settings: the global config plus per-farm overrides.
#[derive(Debug, Clone, Default)]
pub struct AutomationSettings {
    pub base: AutomationConfig,
    pub per_farm: HashMap<i64, AutomationConfig>,
}

impl AutomationSettings {
    pub fn for_farm(&self, farm_id: i64) -> &AutomationConfig {
        self.per_farm.get(&farm_id).unwrap_or(&self.base)
    }
}

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub automation: AutomationConfig,
    #[serde(default)]
    pub users: Vec<UserEntry>,
    #[serde(default)]
    pub sensor_types: Vec<SensorTypeEntry>,
    #[serde(default)]
    pub farms: Vec<FarmEntry>,
    #[serde(default)]
    pub sensors: Vec<SensorEntry>,
}

#[derive(Debug, Deserialize)]
pub struct UserEntry {
    pub username: String,
    pub role: Role,
    pub api_token: String,
}

#[derive(Debug, Deserialize)]
pub struct SensorTypeEntry {
    pub name: String,
    pub category: String,
    pub unit: String,
}

#[derive(Debug, Deserialize)]
pub struct FarmEntry {
    pub id: i64,
    pub name: String,
    pub owner: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default = "default_panel_efficiency")]
    pub panel_efficiency: f64,
    #[serde(default = "default_system_size_kw")]
    pub system_size_kw: f64,
    #[serde(default = "default_battery_capacity_kwh")]
    pub battery_capacity_kwh: f64,
    #[serde(default = "default_tilt")]
    pub tilt: i64,
    #[serde(default = "default_azimuth")]
    pub azimuth: i64,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub automation: Option<AutomationOverrides>,
}

#[derive(Debug, Deserialize)]
pub struct SensorEntry {
    pub sensor_id: String,
    pub farm_id: i64,
    pub sensor_type: String,
    pub name: String,
    #[serde(default)]
    pub location: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_panel_efficiency() -> f64 {
    0.18
}
fn default_system_size_kw() -> f64 {
    130.0
}
fn default_battery_capacity_kwh() -> f64 {
    1320.0
}
fn default_tilt() -> i64 {
    23
}
fn default_azimuth() -> i64 {
    180
}
fn default_timezone() -> String {
    "auto".to_string()
}
fn default_true() -> bool {
    true
}

/// Sensor types seeded when the config file names none.
const STANDARD_SENSOR_TYPES: &[(&str, &str, &str)] = &[
    ("Soil Moisture", "soil", "%"),
    ("Soil Temperature", "soil", "°C"),
    ("Soil Electrical Conductivity", "soil", "mS/cm"),
    ("Water Quality/Salinity", "water", "ppm"),
    ("Water Flow", "water", "L/min"),
    ("Air Temperature", "weather", "°C"),
    ("Air Humidity", "weather", "%"),
    ("Rain Gauge", "weather", "mm"),
    ("Photosynthetic Active Radiation", "solar", "µmol/m²/s"),
    ("Solar Irradiance", "solar", "W/m²"),
];

const SENSOR_CATEGORIES: &[&str] = &["soil", "water", "weather", "solar"];

/// Open-Meteo serves at most 16 forecast days.
const MAX_FORECAST_DAYS: u32 = 16;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        validate_automation("automation", &self.automation, &mut errors);
        self.validate_users(&mut errors);
        self.validate_sensor_types(&mut errors);
        self.validate_farms(&mut errors);
        self.validate_sensors(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    /// Sensor types to seed: the configured ones, or the standard catalogue.
    pub fn effective_sensor_types(&self) -> Vec<SensorType> {
        if self.sensor_types.is_empty() {
            STANDARD_SENSOR_TYPES
                .iter()
                .map(|(name, category, unit)| SensorType {
                    name: name.to_string(),
                    category: category.to_string(),
                    unit: unit.to_string(),
                })
                .collect()
        } else {
            self.sensor_types
                .iter()
                .map(|t| SensorType {
                    name: t.name.clone(),
                    category: t.category.clone(),
                    unit: t.unit.clone(),
                })
                .collect()
        }
    }

    pub fn automation_settings(&self) -> AutomationSettings {
        let per_farm = self
            .farms
            .iter()
            .filter_map(|f| {
                f.automation
                    .as_ref()
                    .map(|o| (f.id, o.merge_over(&self.automation)))
            })
            .collect();
        AutomationSettings {
            base: self.automation.clone(),
            per_farm,
        }
    }

    fn validate_users(&self, errors: &mut Vec<String>) {
        let mut seen_names: HashSet<&str> = HashSet::new();
        let mut seen_tokens: HashSet<&str> = HashSet::new();

        for (i, u) in self.users.iter().enumerate() {
            let ctx = || {
                if u.username.is_empty() {
                    format!("users[{i}]")
                } else {
                    format!("user '{}'", u.username)
                }
            };

            if u.username.trim().is_empty() {
                errors.push(format!("{}: username is empty", ctx()));
            } else if !seen_names.insert(&u.username) {
                errors.push(format!("{}: duplicate username", ctx()));
            }

            if u.api_token.trim().len() < 8 {
                errors.push(format!("{}: api_token must be at least 8 characters", ctx()));
            } else if !seen_tokens.insert(&u.api_token) {
                errors.push(format!("{}: api_token is already used by another user", ctx()));
            }
        }
    }

    fn validate_sensor_types(&self, errors: &mut Vec<String>) {
        let mut seen: HashSet<&str> = HashSet::new();
        for (i, t) in self.sensor_types.iter().enumerate() {
            if t.name.trim().is_empty() {
                errors.push(format!("sensor_types[{i}]: name is empty"));
            } else if !seen.insert(&t.name) {
                errors.push(format!("sensor type '{}': duplicate name", t.name));
            }
            if !SENSOR_CATEGORIES.contains(&t.category.as_str()) {
                errors.push(format!(
                    "sensor type '{}': category '{}' is not one of {}",
                    t.name,
                    t.category,
                    SENSOR_CATEGORIES.join(", ")
                ));
            }
        }
    }

    fn validate_farms(&self, errors: &mut Vec<String>) {
        let usernames: HashSet<&str> = self.users.iter().map(|u| u.username.as_str()).collect();
        let mut seen_ids: HashSet<i64> = HashSet::new();

        for f in &self.farms {
            let ctx = format!("farm {} ('{}')", f.id, f.name);

            // ── Identity ────────────────────────────────────────
            if f.id <= 0 {
                errors.push(format!("{ctx}: id must be positive"));
            } else if !seen_ids.insert(f.id) {
                errors.push(format!("{ctx}: duplicate farm id"));
            }
            if f.name.trim().is_empty() {
                errors.push(format!("{ctx}: name is empty"));
            }
            if !usernames.contains(f.owner.as_str()) {
                errors.push(format!(
                    "{ctx}: owner '{}' does not match any defined user",
                    f.owner
                ));
            }

            // ── Location ────────────────────────────────────────
            if !(-90.0..=90.0).contains(&f.latitude) {
                errors.push(format!("{ctx}: latitude {} out of range [-90, 90]", f.latitude));
            }
            if !(-180.0..=180.0).contains(&f.longitude) {
                errors.push(format!(
                    "{ctx}: longitude {} out of range [-180, 180]",
                    f.longitude
                ));
            }
            if f.timezone.trim().is_empty() {
                errors.push(format!("{ctx}: timezone is empty"));
            }

            // ── Array + storage ─────────────────────────────────
            if !(f.panel_efficiency > 0.0 && f.panel_efficiency <= 1.0) {
                errors.push(format!(
                    "{ctx}: panel_efficiency {} out of range (0.0, 1.0]",
                    f.panel_efficiency
                ));
            }
            if !(f.system_size_kw.is_finite() && f.system_size_kw >= 0.0) {
                errors.push(format!(
                    "{ctx}: system_size_kw must be a non-negative number, got {}",
                    f.system_size_kw
                ));
            }
            if !(f.battery_capacity_kwh.is_finite() && f.battery_capacity_kwh > 0.0) {
                errors.push(format!(
                    "{ctx}: battery_capacity_kwh must be a positive number, got {}",
                    f.battery_capacity_kwh
                ));
            }
            if !(0..=90).contains(&f.tilt) {
                errors.push(format!("{ctx}: tilt {} out of range [0, 90]", f.tilt));
            }
            if !(0..=360).contains(&f.azimuth) {
                errors.push(format!("{ctx}: azimuth {} out of range [0, 360]", f.azimuth));
            }

            if let Some(o) = &f.automation {
                validate_automation(&ctx, &o.merge_over(&self.automation), errors);
            }
        }
    }

    fn validate_sensors(&self, errors: &mut Vec<String>) {
        let farm_ids: HashSet<i64> = self.farms.iter().map(|f| f.id).collect();
        let type_names: HashSet<String> = self
            .effective_sensor_types()
            .into_iter()
            .map(|t| t.name)
            .collect();
        let mut seen_ids: HashSet<&str> = HashSet::new();

        for (i, s) in self.sensors.iter().enumerate() {
            let ctx = || {
                if s.sensor_id.is_empty() {
                    format!("sensors[{i}]")
                } else {
                    format!("sensor '{}'", s.sensor_id)
                }
            };

            if s.sensor_id.trim().is_empty() {
                errors.push(format!("{}: sensor_id is empty", ctx()));
            } else if !seen_ids.insert(&s.sensor_id) {
                errors.push(format!("{}: duplicate sensor_id", ctx()));
            }
            if s.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            }
            if !farm_ids.contains(&s.farm_id) {
                errors.push(format!(
                    "{}: farm_id {} does not match any defined farm",
                    ctx(),
                    s.farm_id
                ));
            }
            if !type_names.contains(&s.sensor_type) {
                errors.push(format!(
                    "{}: sensor_type '{}' does not match any defined sensor type",
                    ctx(),
                    s.sensor_type
                ));
            }
        }
    }
}

fn validate_automation(ctx: &str, a: &AutomationConfig, errors: &mut Vec<String>) {
    for (name, v) in [
        ("min_battery", a.min_battery),
        ("max_battery", a.max_battery),
        ("cloud_threshold", a.cloud_threshold),
        ("soil_moisture_low", a.soil_moisture_low),
        ("soil_moisture_optimal", a.soil_moisture_optimal),
        ("soil_moisture_high", a.soil_moisture_high),
        ("initial_battery_level", a.initial_battery_level),
    ] {
        if !(0.0..=100.0).contains(&v) {
            errors.push(format!("{ctx}: {name} {v} out of range [0, 100]"));
        }
    }

    for (name, v) in [
        ("rain_threshold_mm", a.rain_threshold_mm),
        ("domestic_load_base_kw", a.domestic_load_base_kw),
        ("irrigation_load_kw", a.irrigation_load_kw),
        ("water_treatment_load_kw", a.water_treatment_load_kw),
    ] {
        if !(v.is_finite() && v >= 0.0) {
            errors.push(format!("{ctx}: {name} must be a non-negative number, got {v}"));
        }
    }

    if a.min_battery > a.max_battery {
        errors.push(format!(
            "{ctx}: min_battery ({}) must not exceed max_battery ({})",
            a.min_battery, a.max_battery
        ));
    }
    if a.soil_moisture_low >= a.soil_moisture_optimal {
        errors.push(format!(
            "{ctx}: soil_moisture_low ({}) must be less than soil_moisture_optimal ({})",
            a.soil_moisture_low, a.soil_moisture_optimal
        ));
    }
    if a.soil_moisture_optimal > a.soil_moisture_high {
        errors.push(format!(
            "{ctx}: soil_moisture_optimal ({}) must not exceed soil_moisture_high ({})",
            a.soil_moisture_optimal, a.soil_moisture_high
        ));
    }
    if !(0.0..=1.0).contains(&a.critical_domestic_factor) {
        errors.push(format!(
            "{ctx}: critical_domestic_factor {} out of range [0.0, 1.0]",
            a.critical_domestic_factor
        ));
    }
    if !(1..=MAX_FORECAST_DAYS).contains(&a.forecast_days) {
        errors.push(format!(
            "{ctx}: forecast_days {} out of range [1, {MAX_FORECAST_DAYS}]",
            a.forecast_days
        ));
    }
}

// ---------------------------------------------------------------------------
// Load + apply
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file. A missing file yields the
/// default (empty) configuration.
pub fn load(path: &str) -> Result<Config> {
    if !std::path::Path::new(path).exists() {
        tracing::warn!(path, "config file not found, using defaults");
        return Ok(Config::default());
    }
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    parse(&contents).with_context(|| format!("invalid config: {path}"))
}

/// Parse and validate config text.
pub fn parse(contents: &str) -> Result<Config> {
    let config: Config = toml::from_str(contents).context("failed to parse config")?;
    config.validate()?;
    Ok(config)
}

/// Upsert users, sensor types, farms and sensors into the database.
pub async fn apply(config: &Config, db: &Db) -> Result<()> {
    for u in &config.users {
        db.upsert_user(&User {
            username: u.username.clone(),
            role: u.role,
            api_token: u.api_token.clone(),
        })
        .await
        .with_context(|| format!("failed to upsert user '{}'", u.username))?;
    }

    let sensor_types = config.effective_sensor_types();
    for t in &sensor_types {
        db.upsert_sensor_type(t)
            .await
            .with_context(|| format!("failed to upsert sensor type '{}'", t.name))?;
    }

    for f in &config.farms {
        db.upsert_farm(&Farm {
            farm_id: f.id,
            name: f.name.clone(),
            owner: f.owner.clone(),
            latitude: f.latitude,
            longitude: f.longitude,
            panel_efficiency: f.panel_efficiency,
            system_size_kw: f.system_size_kw,
            battery_capacity_kwh: f.battery_capacity_kwh,
            tilt: f.tilt,
            azimuth: f.azimuth,
            timezone: f.timezone.clone(),
            is_active: f.is_active,
        })
        .await
        .with_context(|| format!("failed to upsert farm {} '{}'", f.id, f.name))?;
    }

    for s in &config.sensors {
        db.upsert_sensor(&Sensor {
            sensor_id: s.sensor_id.clone(),
            farm_id: s.farm_id,
            sensor_type: s.sensor_type.clone(),
            name: s.name.clone(),
            location: s.location.clone(),
            is_active: s.is_active,
        })
        .await
        .with_context(|| format!("failed to upsert sensor '{}'", s.sensor_id))?;
    }

    tracing::info!(
        users = config.users.len(),
        sensor_types = sensor_types.len(),
        farms = config.farms.len(),
        sensors = config.sensors.len(),
        "config applied"
    );

    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -- Helper: build a valid baseline config that passes validation ------

    fn valid_user() -> UserEntry {
        UserEntry {
            username: "johnd".into(),
            role: Role::Farmer,
            api_token: "farmer-token-1".into(),
        }
    }

    fn valid_farm() -> FarmEntry {
        FarmEntry {
            id: 1,
            name: "Green Valley".into(),
            owner: "johnd".into(),
            latitude: -1.2921,
            longitude: 36.8219,
            panel_efficiency: 0.18,
            system_size_kw: 130.0,
            battery_capacity_kwh: 1320.0,
            tilt: 23,
            azimuth: 180,
            timezone: "auto".into(),
            is_active: true,
            automation: None,
        }
    }

    fn valid_sensor() -> SensorEntry {
        SensorEntry {
            sensor_id: "node-a/s1".into(),
            farm_id: 1,
            sensor_type: "Soil Moisture".into(),
            name: "Plot A moisture".into(),
            location: "Plot A, 10cm".into(),
            is_active: true,
        }
    }

    fn valid_config() -> Config {
        Config {
            automation: AutomationConfig::default(),
            users: vec![valid_user()],
            sensor_types: vec![],
            farms: vec![valid_farm()],
            sensors: vec![valid_sensor()],
        }
    }

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_full_config() {
        let toml_str = r#"
[automation]
min_battery = 25
cloud_threshold = 55

[[users]]
username = "johnd"
role = "farmer"
api_token = "farmer-token-1"

[[users]]
username = "ops"
role = "staff"
api_token = "staff-token-1"

[[farms]]
id = 1
name = "Green Valley"
owner = "johnd"
latitude = -1.29
longitude = 36.82

[farms.automation]
soil_moisture_low = 25

[[sensors]]
sensor_id = "node-a/s1"
farm_id = 1
sensor_type = "Soil Moisture"
name = "Plot A moisture"
"#;
        let config = parse(toml_str).unwrap();
        assert_eq!(config.users.len(), 2);
        assert_eq!(config.users[1].role, Role::Staff);
        assert_eq!(config.farms[0].panel_efficiency, 0.18);
        assert_eq!(config.farms[0].battery_capacity_kwh, 1320.0);
        assert_eq!(config.farms[0].timezone, "auto");
        assert!(config.farms[0].is_active);
        assert_eq!(config.automation.min_battery, 25.0);
        assert_eq!(config.automation.soil_moisture_low, 30.0);

        let settings = config.automation_settings();
        let farm = settings.for_farm(1);
        assert_eq!(farm.soil_moisture_low, 25.0);
        assert_eq!(farm.min_battery, 25.0);
        assert_eq!(farm.cloud_threshold, 55.0);
        assert_eq!(settings.for_farm(99).soil_moisture_low, 30.0);
    }

    #[test]
    fn parse_empty_config() {
        let config = parse("").unwrap();
        assert!(config.farms.is_empty());
        assert_eq!(config.automation, AutomationConfig::default());
    }

    #[test]
    fn unknown_override_field_rejected() {
        let toml_str = r#"
[[users]]
username = "johnd"
role = "farmer"
api_token = "farmer-token-1"

[[farms]]
id = 1
name = "Green Valley"
owner = "johnd"
latitude = 0.0
longitude = 0.0

[farms.automation]
min_batery = 10
"#;
        assert!(parse(toml_str).is_err());
    }

    #[test]
    fn unknown_role_rejected() {
        let toml_str = r#"
[[users]]
username = "x"
role = "superuser"
api_token = "xxxxxxxxxx"
"#;
        assert!(parse(toml_str).is_err());
    }

    // -- Validation -------------------------------------------------------

    #[test]
    fn valid_config_passes() {
        valid_config().validate().unwrap();
    }

    #[test]
    fn standard_sensor_types_seeded_when_none_configured() {
        let types = valid_config().effective_sensor_types();
        assert_eq!(types.len(), 10);
        assert!(types
            .iter()
            .any(|t| t.name == "Soil Moisture" && t.category == "soil"));
    }

    #[test]
    fn duplicate_username_rejected() {
        let mut cfg = valid_config();
        cfg.users.push(UserEntry {
            api_token: "another-token".into(),
            ..valid_user()
        });
        assert_validation_err(&cfg, "duplicate username");
    }

    #[test]
    fn shared_token_rejected() {
        let mut cfg = valid_config();
        cfg.users.push(UserEntry {
            username: "other".into(),
            ..valid_user()
        });
        assert_validation_err(&cfg, "api_token is already used");
    }

    #[test]
    fn short_token_rejected() {
        let mut cfg = valid_config();
        cfg.users[0].api_token = "abc".into();
        assert_validation_err(&cfg, "at least 8 characters");
    }

    #[test]
    fn farm_unknown_owner_rejected() {
        let mut cfg = valid_config();
        cfg.farms[0].owner = "nobody".into();
        assert_validation_err(&cfg, "does not match any defined user");
    }

    #[test]
    fn farm_duplicate_id_rejected() {
        let mut cfg = valid_config();
        cfg.farms.push(valid_farm());
        assert_validation_err(&cfg, "duplicate farm id");
    }

    #[test]
    fn farm_latitude_out_of_range() {
        let mut cfg = valid_config();
        cfg.farms[0].latitude = 91.0;
        assert_validation_err(&cfg, "latitude 91 out of range");
    }

    #[test]
    fn farm_efficiency_out_of_range() {
        let mut cfg = valid_config();
        cfg.farms[0].panel_efficiency = 0.0;
        assert_validation_err(&cfg, "panel_efficiency");
    }

    #[test]
    fn farm_capacity_must_be_positive() {
        let mut cfg = valid_config();
        cfg.farms[0].battery_capacity_kwh = 0.0;
        assert_validation_err(&cfg, "battery_capacity_kwh must be a positive number");
    }

    #[test]
    fn nan_and_infinite_quantities_rejected() {
        let toml_str = r#"
[automation]
irrigation_load_kw = nan

[[users]]
username = "johnd"
role = "farmer"
api_token = "farmer-token-1"

[[farms]]
id = 1
name = "Green Valley"
owner = "johnd"
latitude = 0.0
longitude = 0.0
system_size_kw = nan
battery_capacity_kwh = nan
"#;
        let msg = format!("{:#}", parse(toml_str).unwrap_err());
        assert!(msg.contains("system_size_kw must be a non-negative number"), "got: {msg}");
        assert!(msg.contains("battery_capacity_kwh must be a positive number"), "got: {msg}");
        assert!(msg.contains("irrigation_load_kw must be a non-negative number"), "got: {msg}");

        let mut cfg = valid_config();
        cfg.farms[0].battery_capacity_kwh = f64::INFINITY;
        assert_validation_err(&cfg, "battery_capacity_kwh must be a positive number");
    }

    #[test]
    fn farm_tilt_out_of_range() {
        let mut cfg = valid_config();
        cfg.farms[0].tilt = 95;
        assert_validation_err(&cfg, "tilt 95 out of range");
    }

    #[test]
    fn sensor_unknown_farm_rejected() {
        let mut cfg = valid_config();
        cfg.sensors[0].farm_id = 42;
        assert_validation_err(&cfg, "farm_id 42 does not match any defined farm");
    }

    #[test]
    fn sensor_unknown_type_rejected() {
        let mut cfg = valid_config();
        cfg.sensors[0].sensor_type = "Leaf Wetness".into();
        assert_validation_err(&cfg, "does not match any defined sensor type");
    }

    #[test]
    fn sensor_type_bad_category_rejected() {
        let mut cfg = valid_config();
        cfg.sensor_types.push(SensorTypeEntry {
            name: "Soil Moisture".into(),
            category: "dirt".into(),
            unit: "%".into(),
        });
        assert_validation_err(&cfg, "category 'dirt' is not one of");
    }

    #[test]
    fn moisture_thresholds_must_be_ordered() {
        let mut cfg = valid_config();
        cfg.automation.soil_moisture_low = 60.0;
        assert_validation_err(&cfg, "soil_moisture_low (60) must be less than");
    }

    #[test]
    fn critical_factor_out_of_range() {
        let mut cfg = valid_config();
        cfg.automation.critical_domestic_factor = 1.5;
        assert_validation_err(&cfg, "critical_domestic_factor");
    }

    #[test]
    fn farm_override_is_validated() {
        let mut cfg = valid_config();
        cfg.farms[0].automation = Some(AutomationOverrides {
            min_battery: Some(120.0),
            ..Default::default()
        });
        assert_validation_err(&cfg, "farm 1 ('Green Valley'): min_battery 120 out of range");
    }

    #[test]
    fn forecast_days_bounds() {
        let mut cfg = valid_config();
        cfg.automation.forecast_days = 0;
        assert_validation_err(&cfg, "forecast_days 0 out of range");
        cfg.automation.forecast_days = 17;
        assert_validation_err(&cfg, "forecast_days 17 out of range");
    }

    #[test]
    fn multiple_errors_collected() {
        let mut cfg = valid_config();
        cfg.farms[0].latitude = 200.0;
        cfg.farms[0].owner = "ghost".into();
        cfg.sensors[0].sensor_type = "Nope".into();
        let msg = format!("{:#}", cfg.validate().unwrap_err());
        assert!(msg.contains("3 errors"), "got: {msg}");
        assert!(msg.contains("latitude"));
        assert!(msg.contains("owner 'ghost'"));
        assert!(msg.contains("sensor_type 'Nope'"));
    }

    #[test]
    fn example_config_is_valid() {
        let config = parse(include_str!("../config.example.toml")).unwrap();
        assert_eq!(config.automation, AutomationConfig::default());
        assert_eq!(config.farms.len(), 2);
        let settings = config.automation_settings();
        assert_eq!(settings.for_farm(1).soil_moisture_low, 30.0);
        assert_eq!(settings.for_farm(2).soil_moisture_low, 25.0);
        assert_eq!(settings.for_farm(2).soil_moisture_optimal, 50.0);
    }

    // -- DB integration ---------------------------------------------------

    #[tokio::test]
    async fn apply_seeds_database() {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();

        let config = valid_config();
        config.validate().unwrap();

        apply(&config, &db).await.unwrap();
        // Re-applying is an idempotent upsert.
        apply(&config, &db).await.unwrap();

        let farms = db.load_farms().await.unwrap();
        assert_eq!(farms.len(), 1);
        assert_eq!(farms[0].name, "Green Valley");
        assert_eq!(farms[0].owner, "johnd");

        let sensors = db.sensors_for_farm(1).await.unwrap();
        assert_eq!(sensors.len(), 1);
        assert_eq!(sensors[0].sensor_id, "node-a/s1");

        let user = db.user_by_token("farmer-token-1").await.unwrap().unwrap();
        assert_eq!(user.username, "johnd");
        assert_eq!(user.role, Role::Farmer);
    }
}
