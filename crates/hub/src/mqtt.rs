use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde::Deserialize;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::db::Db;
use crate::state::{NodeReading, SharedState};

const CLIENT_ID: &str = "farm-hub";
const TELEMETRY_TOPIC: &str = "tele/+/reading";

// ---------------------------------------------------------------------------
// MQTT message types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub(crate) struct Reading {
    pub(crate) sensor_id: String,
    pub(crate) value: f64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ReadingMsg {
    pub(crate) ts: i64,
    pub(crate) readings: Vec<Reading>,
}

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

/// Extract node_id from "tele/<node_id>/reading".
pub(crate) fn extract_node_id(topic: &str) -> Option<&str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 3 && parts[0] == "tele" && parts[2] == "reading" && !parts[1].is_empty() {
        Some(parts[1])
    } else {
        None
    }
}

/// Node-local channel names ("s1") are only unique per node; the database
/// keys sensors by "<node_id>/<sensor_id>".
pub(crate) fn qualify(node_id: &str, sensor_id: &str) -> String {
    format!("{node_id}/{sensor_id}")
}

// ---------------------------------------------------------------------------
// Ingestion
// ---------------------------------------------------------------------------

/// Store one telemetry payload from `node_id`. Readings for sensors the
/// database does not know are skipped. Returns the number stored.
pub(crate) async fn handle_telemetry(
    db: &Db,
    shared: &SharedState,
    node_id: &str,
    payload: &[u8],
) -> usize {
    let msg = match serde_json::from_slice::<ReadingMsg>(payload) {
        Ok(m) => m,
        Err(e) => {
            warn!(node = %node_id, "bad telemetry json: {e}");
            shared
                .write()
                .await
                .record_error(format!("bad telemetry json from {node_id}: {e}"));
            return 0;
        }
    };

    debug!(node = %node_id, ts = msg.ts, readings = msg.readings.len(), "telemetry");

    let mut stored = 0;
    for r in &msg.readings {
        let qualified_id = qualify(node_id, &r.sensor_id);
        match db.get_sensor(&qualified_id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                warn!(sensor = %qualified_id, "unknown sensor, skipping db write");
                continue;
            }
            Err(e) => {
                error!(sensor = %qualified_id, "sensor lookup failed: {e:#}");
                continue;
            }
        }
        match db.insert_reading(msg.ts, &qualified_id, r.value).await {
            Ok(()) => stored += 1,
            Err(e) => error!(sensor = %qualified_id, "insert_reading failed: {e:#}"),
        }
    }

    let readings = msg
        .readings
        .into_iter()
        .map(|r| NodeReading {
            sensor_id: r.sensor_id,
            value: r.value,
        })
        .collect();
    shared.write().await.record_reading(node_id, readings);

    stored
}

/// Subscribe to node telemetry and ingest it until the process exits.
/// Reconnects after any connection error.
pub async fn run(db: Db, shared: SharedState, host: String, port: u16) {
    let mut options = MqttOptions::new(CLIENT_ID, host.clone(), port);
    options.set_keep_alive(Duration::from_secs(30));

    let (client, mut eventloop) = AsyncClient::new(options, 20);

    info!(%host, port, topic = TELEMETRY_TOPIC, "mqtt ingestion started");

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                if let Some(node_id) = extract_node_id(&p.topic) {
                    handle_telemetry(&db, &shared, node_id, &p.payload).await;
                } else {
                    debug!(topic = %p.topic, "unhandled topic");
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("mqtt connected");
                // clean session: subscriptions do not survive a reconnect
                if let Err(e) = client.try_subscribe(TELEMETRY_TOPIC, QoS::AtLeastOnce) {
                    error!("mqtt subscribe failed: {e}");
                }
                let mut st = shared.write().await;
                st.mqtt_connected = true;
                st.record_system("mqtt connected".to_string());
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("mqtt disconnected");
                let mut st = shared.write().await;
                st.mqtt_connected = false;
                st.record_system("mqtt disconnected".to_string());
            }
            Ok(_) => {}
            Err(e) => {
                error!("mqtt error: {e}. reconnecting...");
                {
                    let mut st = shared.write().await;
                    st.mqtt_connected = false;
                    st.record_error(format!("mqtt error: {e}"));
                }
                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::{seeded_db, soil_sensor};
    use crate::state::{self, EventKind};

    // -- extract_node_id ----------------------------------------------------

    #[test]
    fn extract_node_id_valid_topic() {
        assert_eq!(extract_node_id("tele/node-a/reading"), Some("node-a"));
        assert_eq!(extract_node_id("tele/greenhouse-1/reading"), Some("greenhouse-1"));
    }

    #[test]
    fn extract_node_id_rejects_other_shapes() {
        assert_eq!(extract_node_id("foo/node-a/reading"), None);
        assert_eq!(extract_node_id("tele/node-a/status"), None);
        assert_eq!(extract_node_id("tele/reading"), None);
        assert_eq!(extract_node_id("tele/node-a/sub/reading"), None);
        assert_eq!(extract_node_id("tele//reading"), None);
        assert_eq!(extract_node_id(""), None);
    }

    // -- ReadingMsg deserialization ------------------------------------------

    #[test]
    fn reading_msg_deserialize_valid() {
        let json = r#"{"ts":1700000000,"readings":[{"sensor_id":"s1","value":23.4},{"sensor_id":"s2","value":7}]}"#;
        let msg: ReadingMsg = serde_json::from_str(json).unwrap();
        assert_eq!(msg.ts, 1700000000);
        assert_eq!(msg.readings.len(), 2);
        assert_eq!(msg.readings[0].sensor_id, "s1");
        assert_eq!(msg.readings[0].value, 23.4);
        assert_eq!(msg.readings[1].value, 7.0);
    }

    #[test]
    fn reading_msg_missing_field_fails() {
        assert!(serde_json::from_str::<ReadingMsg>(r#"{"ts":1}"#).is_err());
        assert!(serde_json::from_str::<ReadingMsg>(
            r#"{"ts":1,"readings":[{"sensor_id":"s1"}]}"#
        )
        .is_err());
    }

    #[test]
    fn reading_msg_extra_fields_ignored() {
        let msg: ReadingMsg =
            serde_json::from_str(r#"{"ts":1,"readings":[],"extra":"ignored"}"#).unwrap();
        assert!(msg.readings.is_empty());
    }

    // -- handle_telemetry ---------------------------------------------------

    #[tokio::test]
    async fn stores_known_sensors_and_skips_unknown() {
        let db = seeded_db().await;
        db.upsert_sensor(&soil_sensor("node-a/s1", 1)).await.unwrap();
        let shared = state::shared();

        let payload = br#"{"ts":1000,"readings":[{"sensor_id":"s1","value":31.5},{"sensor_id":"s9","value":1}]}"#;
        let stored = handle_telemetry(&db, &shared, "node-a", payload).await;
        assert_eq!(stored, 1);

        let readings = db.readings_since("node-a/s1", 0).await.unwrap();
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].value, 31.5);
        assert_eq!(readings[0].ts, 1000);

        let st = shared.read().await;
        assert_eq!(st.nodes["node-a"].readings.len(), 2);
        assert_eq!(st.events.back().unwrap().kind, EventKind::Reading);
    }

    #[tokio::test]
    async fn malformed_payload_records_error() {
        let db = seeded_db().await;
        let shared = state::shared();

        let stored = handle_telemetry(&db, &shared, "node-a", b"not json").await;
        assert_eq!(stored, 0);

        let st = shared.read().await;
        let ev = st.events.back().unwrap();
        assert_eq!(ev.kind, EventKind::Error);
        assert!(ev.detail.starts_with("bad telemetry json from node-a"));
        assert!(st.nodes.is_empty());
    }
}
