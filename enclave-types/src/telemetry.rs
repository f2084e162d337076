//! Self-reports sent by a sandbox guest on the `telemetry` channel.

use crate::Timestamp;
use serde::{Deserialize, Serialize};

/// One telemetry message from a guest context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum TelemetryReport {
    /// Periodic sample of the guest's own resource usage.
    #[serde(rename_all = "camelCase")]
    Sample {
        /// CPU busy time over the last interval, as percent of the interval.
        cpu_percent: f64,
        /// Heap in use, in megabytes.
        heap_mb: f64,
        dom_nodes: u64,
        sampled_at: Timestamp,
    },
    /// Emitted by the wrapped network primitive for every outbound request.
    #[serde(rename_all = "camelCase")]
    NetworkRequest { url: String, method: String },
}

impl TelemetryReport {
    pub const CHANNEL: &'static str = "telemetry";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tagged_wire_format() {
        let r = TelemetryReport::NetworkRequest {
            url: "https://api.test/a".into(),
            method: "GET".into(),
        };
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["kind"], "networkRequest");
        assert_eq!(v["url"], "https://api.test/a");

        let s = TelemetryReport::Sample {
            cpu_percent: 1.5,
            heap_mb: 12.0,
            dom_nodes: 3,
            sampled_at: Timestamp::from_millis(7),
        };
        let v = serde_json::to_value(&s).unwrap();
        assert_eq!(v["kind"], "sample");
        assert_eq!(v["heapMb"], 12.0);
        assert_eq!(serde_json::from_value::<TelemetryReport>(v).unwrap(), s);
    }
}
