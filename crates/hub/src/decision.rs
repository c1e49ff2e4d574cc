//! Irrigation decision engine.
//!
//! A pure function of the already-resolved inputs: current weather,
//! tomorrow's forecast, battery level and (optional) soil moisture. Nothing
//! is carried between runs.
//!
//! ```text
//! rain > threshold ───────────────────────────────▶ OFF  optional
//! not needed (moist soil / wet or cloudy sky) ────▶ OFF  optional
//! needed, battery < min, critical ────────────────▶ ON   critical
//! needed, battery < min, not critical ────────────▶ OFF  normal   (awaits forecast override)
//! needed, tomorrow cloudy, critical ──────────────▶ ON   critical
//! needed, tomorrow cloudy, not critical ──────────▶ OFF  normal   (conserve)
//! needed, otherwise ──────────────────────────────▶ ON   critical | normal
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::config::AutomationConfig;
use crate::energy::BatteryOutlook;
use crate::weather::{TomorrowForecast, WeatherSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    Normal,
    Optional,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::Normal => "normal",
            Self::Optional => "optional",
        }
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "critical" => Ok(Self::Critical),
            "normal" => Ok(Self::Normal),
            "optional" => Ok(Self::Optional),
            _ => Err(format!("unknown priority '{s}'")),
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IrrigationDecision {
    pub irrigation: bool,
    pub reason: String,
    pub priority: Priority,
    /// Irrigation is wanted but held back by a low battery; a favourable
    /// one-hour battery forecast may still switch it on.
    #[serde(skip)]
    pub awaiting_forecast: bool,
}

impl IrrigationDecision {
    fn new(irrigation: bool, priority: Priority, reason: impl Into<String>) -> Self {
        Self {
            irrigation,
            reason: reason.into(),
            priority,
            awaiting_forecast: false,
        }
    }
}

/// Soil-moisture band, or the weather fallback when no sensor data exists.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Need {
    Critical,
    Needed,
    NotNeeded,
}

fn assess_need(current: &WeatherSnapshot, soil_moisture: Option<f64>, cfg: &AutomationConfig) -> Need {
    match soil_moisture {
        Some(m) if m < cfg.soil_moisture_low => Need::Critical,
        Some(m) if m < cfg.soil_moisture_optimal => Need::Needed,
        // The optimal..high band counts as moist enough too; only the
        // reason text differs above high.
        Some(_) => Need::NotNeeded,
        None => {
            if current.rain == 0.0 && current.clouds < cfg.cloud_threshold {
                Need::Needed
            } else {
                Need::NotNeeded
            }
        }
    }
}

fn fmt_moisture(soil_moisture: Option<f64>) -> String {
    match soil_moisture {
        Some(m) => format!("{m:.1}%"),
        None => "n/a".to_string(),
    }
}

/// Decide whether irrigation should run right now.
pub fn decide(
    current: &WeatherSnapshot,
    tomorrow: &TomorrowForecast,
    battery_level: f64,
    soil_moisture: Option<f64>,
    cfg: &AutomationConfig,
) -> IrrigationDecision {
    if current.rain > cfg.rain_threshold_mm {
        return IrrigationDecision::new(
            false,
            Priority::Optional,
            "Rain detected. Irrigation not needed.",
        );
    }

    let need = assess_need(current, soil_moisture, cfg);
    let critical = need == Need::Critical;
    let moisture = fmt_moisture(soil_moisture);

    if need == Need::NotNeeded {
        let reason = match soil_moisture {
            Some(m) if m >= cfg.soil_moisture_high => {
                format!("Soil moisture ({moisture}) is high. Irrigation not needed.")
            }
            Some(_) => format!("Soil moisture ({moisture}) is adequate. Irrigation not needed."),
            None => "Normal operation. No irrigation required.".to_string(),
        };
        return IrrigationDecision::new(false, Priority::Optional, reason);
    }

    if battery_level < cfg.min_battery {
        if critical {
            return IrrigationDecision::new(
                true,
                Priority::Critical,
                format!(
                    "Critical: Low soil moisture ({moisture}) and low battery ({battery_level:.1}%). \
                     Irrigation maintained as critical priority."
                ),
            );
        }
        return IrrigationDecision {
            awaiting_forecast: true,
            ..IrrigationDecision::new(
                false,
                Priority::Normal,
                format!(
                    "Battery low ({battery_level:.1}%) and soil moisture ({moisture}) acceptable. \
                     Checking forecast..."
                ),
            )
        };
    }

    if tomorrow.clouds > cfg.cloud_threshold {
        if critical {
            return IrrigationDecision::new(
                true,
                Priority::Critical,
                format!(
                    "Critical: Low soil moisture ({moisture}) requires irrigation despite cloudy forecast."
                ),
            );
        }
        return IrrigationDecision::new(
            false,
            Priority::Normal,
            "Cloudy tomorrow forecast. Conserving battery for critical needs.",
        );
    }

    if critical {
        IrrigationDecision::new(
            true,
            Priority::Critical,
            format!("Critical: Low soil moisture ({moisture}). Irrigation activated."),
        )
    } else if soil_moisture.is_some() {
        IrrigationDecision::new(
            true,
            Priority::Normal,
            format!("Soil moisture ({moisture}) below optimal. Irrigation activated."),
        )
    } else {
        IrrigationDecision::new(
            true,
            Priority::Normal,
            "No soil moisture data. Dry, clear conditions. Irrigation activated.",
        )
    }
}

/// Switch a battery-deferred decision on when the next hour's solar forecast
/// brings the battery back to the floor and the soil is below optimal.
pub fn apply_forecast_override(
    decision: IrrigationDecision,
    outlook: Option<&BatteryOutlook>,
    soil_moisture: Option<f64>,
    cfg: &AutomationConfig,
) -> IrrigationDecision {
    if decision.irrigation || !decision.awaiting_forecast {
        return decision;
    }
    let (Some(outlook), Some(moisture)) = (outlook, soil_moisture) else {
        return decision;
    };
    if outlook.can_reach_min && moisture < cfg.soil_moisture_optimal {
        IrrigationDecision::new(
            true,
            Priority::Normal,
            format!(
                "Forecast shows battery can reach {:.1}% in next hour. Irrigation activated.",
                outlook.forecast_level
            ),
        )
    } else {
        decision
    }
}

// ===========================================================================
// Tests
// ===========================================================================
