//! Farmer-facing advice derived from the forecast and the farm's status.

use serde::Serialize;

use crate::config::AutomationConfig;
use crate::db::SystemStatus;
use crate::weather::{value_at, ForecastBundle};

const HORIZON_DAYS: usize = 7;
const SCHEDULE_HOURS: usize = 48;
const SCHEDULE_MAX: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SuggestionKind {
    Warning,
    Info,
    Success,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SuggestionPriority {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Suggestion {
    #[serde(rename = "type")]
    pub kind: SuggestionKind,
    pub title: String,
    pub message: String,
    pub icon: &'static str,
    pub priority: SuggestionPriority,
}

impl Suggestion {
    fn new(
        kind: SuggestionKind,
        priority: SuggestionPriority,
        icon: &'static str,
        title: &str,
        message: String,
    ) -> Self {
        Self {
            kind,
            title: title.to_string(),
            message,
            icon,
            priority,
        }
    }
}

/// Daily samples for the horizon. Missing days stay `None` so they are
/// skipped by the weekly statistics instead of reading as zero.
fn first_days(series: &[Option<f64>]) -> Vec<Option<f64>> {
    series.iter().take(HORIZON_DAYS).copied().collect()
}

fn known(values: &[Option<f64>]) -> impl Iterator<Item = f64> + '_ {
    values.iter().flatten().copied()
}

fn max_of(values: &[Option<f64>]) -> Option<f64> {
    known(values).reduce(f64::max)
}

fn min_of(values: &[Option<f64>]) -> Option<f64> {
    known(values).reduce(f64::min)
}

/// Advice for the coming week, most urgent first.
pub fn farmer_suggestions(
    status: Option<&SystemStatus>,
    forecast: &ForecastBundle,
    cfg: &AutomationConfig,
) -> Vec<Suggestion> {
    use SuggestionKind::*;
    use SuggestionPriority::*;

    let battery_level = status.map_or(70.0, |s| s.battery_level);
    let irrigation_on = status.is_some_and(|s| s.irrigation_on);
    let current_rain = status.map_or(0.0, |s| s.current_rain);

    let daily = &forecast.daily;
    let max_temps = first_days(&daily.temperature_2m_max);
    let mean_temps = first_days(&daily.temperature_2m_mean);
    let rains = first_days(&daily.precipitation_sum);

    let mut out = Vec::new();

    // Weekly extremes. The frost check looks at the coldest daily maximum.
    if let (Some(hottest), Some(coldest)) = (max_of(&max_temps), min_of(&max_temps)) {
        if hottest > 35.0 {
            out.push(Suggestion::new(
                Warning,
                High,
                "🌡️",
                "High Temperature Alert",
                format!(
                    "Temperatures will reach up to {hottest:.1}°C this week. \
                     Consider increasing irrigation frequency to prevent crop stress."
                ),
            ));
        }
        if coldest < 5.0 {
            out.push(Suggestion::new(
                Warning,
                High,
                "❄️",
                "Frost Warning",
                format!(
                    "Temperatures may drop to {coldest:.1}°C. Protect sensitive crops from frost damage."
                ),
            ));
        }
    }

    if let Some(wettest) = max_of(&rains) {
        let total: f64 = known(&rains).sum();
        if total > 50.0 {
            out.push(Suggestion::new(
                Info,
                Medium,
                "🌧️",
                "Heavy Rainfall Expected",
                format!(
                    "Expect {total:.1}mm of rain over the next 7 days. Irrigation may not be needed."
                ),
            ));
        }
        if wettest > 20.0 {
            out.push(Suggestion::new(
                Warning,
                High,
                "⛈️",
                "Heavy Rain Day",
                format!("One day will have {wettest:.1}mm of rain. Ensure proper drainage."),
            ));
        }

        let dry_days = known(&rains).filter(|r| *r < 1.0).count();
        if dry_days >= 5 && !irrigation_on {
            out.push(Suggestion::new(
                Warning,
                High,
                "🌵",
                "Extended Dry Period",
                format!(
                    "{dry_days} days with minimal rain expected. Consider activating irrigation system."
                ),
            ));
        }
    }

    if battery_level < 30.0 {
        out.push(Suggestion::new(
            Warning,
            High,
            "🔋",
            "Low Battery",
            format!(
                "Battery is at {battery_level:.1}%. Conserve energy by reducing non-essential loads."
            ),
        ));
    } else if battery_level > cfg.max_battery {
        out.push(Suggestion::new(
            Success,
            Low,
            "⚡",
            "Battery Fully Charged",
            format!(
                "Battery is at {battery_level:.1}%. You can use more energy-intensive operations."
            ),
        ));
    }

    if current_rain > 5.0 && irrigation_on {
        out.push(Suggestion::new(
            Info,
            Medium,
            "💧",
            "Rain Detected",
            "It's currently raining. Irrigation has been automatically paused to save water."
                .to_string(),
        ));
    }

    let best_days: Vec<String> = mean_temps
        .iter()
        .zip(&rains)
        .enumerate()
        .filter(|(_, (t, r))| match (t, r) {
            (Some(t), Some(r)) => (15.0..=28.0).contains(t) && *r < 5.0,
            _ => false,
        })
        .map(|(i, _)| (i + 1).to_string())
        .collect();
    if !best_days.is_empty() {
        out.push(Suggestion::new(
            Success,
            Medium,
            "🌱",
            "Optimal Planting Window",
            format!(
                "Days {} have ideal conditions for planting (moderate temperature, low rain).",
                best_days.join(", ")
            ),
        ));
    }

    // Zero output means no reading yet (or night), not clouds.
    if let Some(pv) = status.map(|s| s.pv_output_kw).filter(|pv| *pv > 0.0) {
        if pv < 1.0 {
            out.push(Suggestion::new(
                Info,
                Medium,
                "☁️",
                "Low Solar Generation",
                format!(
                    "Current PV output is {pv:.2}kW. Cloudy conditions detected. \
                     Battery charging may be slow."
                ),
            ));
        } else if pv > 3.0 {
            out.push(Suggestion::new(
                Success,
                Low,
                "☀️",
                "Excellent Solar Conditions",
                format!("High PV output of {pv:.2}kW. Great time to run energy-intensive tasks."),
            ));
        }
    }

    if out.is_empty() {
        out.push(Suggestion::new(
            Success,
            Low,
            "✅",
            "All Systems Normal",
            "Your farm systems are operating optimally. Continue monitoring weather forecasts."
                .to_string(),
        ));
    }

    // stable: equal priorities keep rule order
    out.sort_by_key(|s| s.priority);
    out
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleEntry {
    pub time: String,
    pub recommended: bool,
    pub reason: String,
}

/// Dry, warm hours within the next two days, earliest first.
pub fn irrigation_schedule(forecast: &ForecastBundle) -> Vec<ScheduleEntry> {
    let h = &forecast.hourly;
    let hours = h
        .time
        .len()
        .min(h.precipitation.len())
        .min(h.temperature_2m.len())
        .min(SCHEDULE_HOURS);

    (0..hours)
        .filter_map(|i| {
            let rain = value_at(&h.precipitation, i);
            let temp = value_at(&h.temperature_2m, i);
            (rain < 0.5 && temp > 20.0).then(|| ScheduleEntry {
                time: h.time[i].clone(),
                recommended: true,
                reason: format!("Optimal conditions: {temp:.1}°C, no rain"),
            })
        })
        .take(SCHEDULE_MAX)
        .collect()
}

// ===========================================================================
// Tests
// ===========================================================================
