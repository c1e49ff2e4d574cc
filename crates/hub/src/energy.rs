//! Hour-by-hour energy balance of a farm's PV array, loads and battery.

use serde::Serialize;

use crate::config::AutomationConfig;
use crate::decision::Priority;
use crate::solar::round2;

/// Domestic load multiplier for an hour of the day (0-23).
pub fn domestic_multiplier(hour_of_day: u32) -> f64 {
    match hour_of_day {
        6..=8 => 1.5,
        9..=16 => 1.0,
        17..=21 => 1.3,
        // 22:00-06:00
        _ => 0.5,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct LoadBreakdown {
    pub total_kw: f64,
    pub domestic_kw: f64,
    pub irrigation_kw: f64,
    pub water_treatment_kw: f64,
}

impl LoadBreakdown {
    fn sum(domestic_kw: f64, irrigation_kw: f64, water_treatment_kw: f64) -> Self {
        Self {
            total_kw: domestic_kw + irrigation_kw + water_treatment_kw,
            domestic_kw,
            irrigation_kw,
            water_treatment_kw,
        }
    }
}

/// Loads drawn in a given hour. Water treatment only ever uses PV surplus
/// beyond the domestic and irrigation loads.
pub fn hourly_load(
    irrigation: bool,
    hour_of_day: u32,
    pv_kw: f64,
    cfg: &AutomationConfig,
) -> LoadBreakdown {
    let domestic = cfg.domestic_load_base_kw * domestic_multiplier(hour_of_day);
    let irrigation_kw = if irrigation { cfg.irrigation_load_kw } else { 0.0 };

    let mut water_treatment = 0.0;
    if cfg.water_treatment_enabled {
        let surplus = pv_kw - (domestic + irrigation_kw);
        if surplus > 0.0 {
            water_treatment = surplus.min(cfg.water_treatment_load_kw);
        }
    }

    LoadBreakdown::sum(domestic, irrigation_kw, water_treatment)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EnergyStep {
    pub battery_level: f64,
    pub battery_kwh: f64,
    pub load: LoadBreakdown,
}

/// Advance the battery by one hour of `pv_kw` generation against the loads
/// implied by the irrigation decision.
pub fn simulate_energy_flow(
    pv_kw: f64,
    irrigation: bool,
    priority: Priority,
    battery_level: f64,
    battery_capacity_kwh: f64,
    hour_of_day: u32,
    cfg: &AutomationConfig,
) -> EnergyStep {
    let mut load = hourly_load(irrigation, hour_of_day, pv_kw, cfg);

    // Shed part of the domestic load so a nearly empty battery can keep
    // critical irrigation running.
    if priority == Priority::Critical && battery_level < cfg.min_battery {
        load = LoadBreakdown::sum(
            load.domestic_kw * cfg.critical_domestic_factor,
            load.irrigation_kw,
            load.water_treatment_kw,
        );
    }

    // Surplus charges, deficit discharges. Peak solar hours (10-15h) are
    // handled the same way.
    let net = pv_kw - load.total_kw;
    let (battery_level, battery_kwh) = step_battery(battery_level, battery_capacity_kwh, net);

    EnergyStep {
        battery_level,
        battery_kwh,
        load,
    }
}

/// Apply `net_kwh` to a battery at `level` percent; returns the clamped
/// `(level, kwh)` pair with the level rounded to 2 decimals.
fn step_battery(level: f64, capacity_kwh: f64, net_kwh: f64) -> (f64, f64) {
    if capacity_kwh <= 0.0 {
        return (0.0, 0.0);
    }
    let kwh = (capacity_kwh * level / 100.0 + net_kwh).clamp(0.0, capacity_kwh);
    (round2(kwh / capacity_kwh * 100.0), kwh)
}

/// Whether the battery climbs back to the configured floor within the next
/// hour, given the forecast PV output and an estimated load.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BatteryOutlook {
    pub can_reach_min: bool,
    pub forecast_level: f64,
}

pub fn forecast_battery_next_hour(
    forecast_pv_kw: f64,
    battery_level: f64,
    battery_capacity_kwh: f64,
    load_kw: f64,
    cfg: &AutomationConfig,
) -> BatteryOutlook {
    let forecast_level = if battery_capacity_kwh <= 0.0 {
        0.0
    } else {
        let kwh = (battery_capacity_kwh * battery_level / 100.0 + forecast_pv_kw - load_kw)
            .clamp(0.0, battery_capacity_kwh);
        kwh / battery_capacity_kwh * 100.0
    };
    BatteryOutlook {
        can_reach_min: forecast_level >= cfg.min_battery,
        forecast_level,
    }
}

// ===========================================================================
// Tests
// ===========================================================================
