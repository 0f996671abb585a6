//! Label types shared by all proxy events.

use std::fmt;

use prometheus_client::encoding::EncodeLabelSet;
use serde::{Deserialize, Serialize};

/// Identity of one exposed listener as seen by observers.
///
/// The label names match the metric series exported by [`crate::ProxyMetrics`]:
/// `namespace`, `name` (backend service), `port` (service port) and
/// `exposed_as` (host port).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, EncodeLabelSet)]
pub struct ListenerLabels {
    pub namespace: String,
    pub name: String,
    pub port: String,
    pub exposed_as: String,
}

impl ListenerLabels {
    /// Build the label set for a listener.
    pub fn new(
        namespace: impl Into<String>,
        name: impl Into<String>,
        service_port: u16,
        expose_port: u16,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            port: service_port.to_string(),
            exposed_as: expose_port.to_string(),
        }
    }
}

impl fmt::Display for ListenerLabels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.namespace, self.name, self.port, self.exposed_as
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_display() {
        let labels = ListenerLabels::new("ns", "backend1", 8080, 9001);
        assert_eq!(labels.to_string(), "ns/backend1/8080/9001");
    }

    #[test]
    fn test_labels_serialize() {
        let labels = ListenerLabels::new("ns", "db", 5432, 15432);
        let json = serde_json::to_value(&labels).unwrap();
        assert_eq!(json["exposed_as"], "15432");
        assert_eq!(json["port"], "5432");
    }
}
