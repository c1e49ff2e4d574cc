use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

use crate::automation::FarmUpdateOutcome;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<HubState>>;

pub fn shared() -> SharedState {
    Arc::new(RwLock::new(HubState::new()))
}

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Ephemeral hub state for the events endpoint. Nothing here is persisted.
pub struct HubState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    pub nodes: HashMap<String, NodeState>,
    pub events: VecDeque<HubEvent>,
}

#[derive(Clone, Serialize)]
pub struct NodeState {
    pub last_seen: DateTime<Utc>,
    pub readings: Vec<NodeReading>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct NodeReading {
    pub sensor_id: String,
    pub value: f64,
}

#[derive(Clone, Serialize)]
pub struct HubEvent {
    pub ts: DateTime<Utc>,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Reading,
    Update,
    Error,
    System,
    Scheduler,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct EventsResponse {
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    pub nodes: HashMap<String, NodeState>,
    pub events: Vec<HubEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl HubState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            nodes: HashMap::new(),
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    /// Record a telemetry message from a node.
    pub fn record_reading(&mut self, node_id: &str, readings: Vec<NodeReading>) {
        let detail = format!(
            "{node_id}: {}",
            readings
                .iter()
                .map(|r| format!("{}={}", r.sensor_id, r.value))
                .collect::<Vec<_>>()
                .join(", ")
        );

        self.nodes.insert(
            node_id.to_string(),
            NodeState {
                last_seen: Utc::now(),
                readings,
            },
        );

        self.push_event(EventKind::Reading, detail);
    }

    /// Record the outcome of one farm's status update.
    pub fn record_update(&mut self, outcome: &FarmUpdateOutcome) {
        match outcome {
            FarmUpdateOutcome::Updated {
                farm_name,
                battery_level,
                pv_output_kw,
                irrigation_on,
                ..
            } => {
                let irrigation = if *irrigation_on { "ON" } else { "OFF" };
                self.push_event(
                    EventKind::Update,
                    format!(
                        "{farm_name}: battery {battery_level:.1}%, PV {pv_output_kw:.2} kW, irrigation {irrigation}"
                    ),
                );
            }
            FarmUpdateOutcome::Error { farm_name, error, .. } => {
                self.push_event(EventKind::Error, format!("{farm_name}: {error}"));
            }
        }
    }

    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    pub fn record_scheduler(&mut self, detail: String) {
        self.push_event(EventKind::Scheduler, detail);
    }

    /// Newest events first.
    pub fn to_response(&self) -> EventsResponse {
        EventsResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected,
            nodes: self.nodes.clone(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(HubEvent {
            ts: Utc::now(),
            kind,
            detail,
        });
    }
}

impl Default for HubState {
    fn default() -> Self {
        Self::new()
    }
}
