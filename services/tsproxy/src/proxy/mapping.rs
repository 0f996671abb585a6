//! Owner keys, mappings and listener identities.
//!
//! A [`Mapping`] is what configuration asks for; a [`ListenerKey`] is the
//! validated identity the core works with. Two mappings with the same key
//! are the same logical listener across reconciliations.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tsproxy_events::ListenerLabels;

use super::error::{ApplyError, OwnerKeyError};

/// Lowest valid port number.
pub const PORT_MIN: i32 = 1;

/// Highest valid port number.
pub const PORT_MAX: i32 = 65535;

/// Identity of one configuration group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OwnerKey {
    /// Namespace; also the DNS namespace backends are resolved in.
    pub namespace: String,
    /// Name of the group within its namespace.
    pub name: String,
}

impl OwnerKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for OwnerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for OwnerKey {
    type Err = OwnerKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Self::new(ns, name))
            }
            _ => Err(OwnerKeyError(s.to_string())),
        }
    }
}

/// One desired "expose this port, forward to that service" entry.
///
/// Field names on the wire follow the proxy resource: `name`, `port`,
/// `exposeAs`. Ports are signed so out-of-range input survives parsing and
/// is rejected by validation instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mapping {
    /// Backend service name.
    #[serde(rename = "name")]
    pub service_name: String,

    /// Port on the backend service.
    #[serde(rename = "port")]
    pub service_port: i32,

    /// Port exposed on the host.
    #[serde(rename = "exposeAs")]
    pub expose_port: i32,
}

impl Mapping {
    pub fn new(service_name: impl Into<String>, service_port: i32, expose_port: i32) -> Self {
        Self {
            service_name: service_name.into(),
            service_port,
            expose_port,
        }
    }
}

/// Validated identity of one listener.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ListenerKey {
    pub namespace: String,
    pub service_name: String,
    pub service_port: u16,
    pub expose_port: u16,
}

impl ListenerKey {
    pub fn new(
        namespace: impl Into<String>,
        service_name: impl Into<String>,
        service_port: u16,
        expose_port: u16,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            service_name: service_name.into(),
            service_port,
            expose_port,
        }
    }

    /// Metric labels for this listener.
    pub fn labels(&self) -> ListenerLabels {
        ListenerLabels::new(
            self.namespace.clone(),
            self.service_name.clone(),
            self.service_port,
            self.expose_port,
        )
    }
}

impl fmt::Display for ListenerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.namespace, self.service_name, self.service_port, self.expose_port
        )
    }
}

fn checked_port(
    owner: &OwnerKey,
    field: &str,
    service: &str,
    value: i32,
) -> Result<u16, ApplyError> {
    if !(PORT_MIN..=PORT_MAX).contains(&value) {
        return Err(ApplyError::Validation {
            owner: owner.clone(),
            reason: format!(
                "{field} {value} of service '{service}' is out of range [{PORT_MIN}, {PORT_MAX}]"
            ),
        });
    }
    u16::try_from(value).map_err(|_| ApplyError::Validation {
        owner: owner.clone(),
        reason: format!("{field} {value} of service '{service}' does not fit a port"),
    })
}

/// Validate a mapping list and derive listener keys, in input order.
///
/// Fails on the first offending mapping; nothing is partially accepted.
pub fn validate(owner: &OwnerKey, mappings: &[Mapping]) -> Result<Vec<ListenerKey>, ApplyError> {
    let mut exposed = HashSet::with_capacity(mappings.len());
    let mut keys = Vec::with_capacity(mappings.len());

    for mapping in mappings {
        if mapping.service_name.trim().is_empty() {
            return Err(ApplyError::Validation {
                owner: owner.clone(),
                reason: "service name must not be empty".to_string(),
            });
        }

        let expose_port = checked_port(owner, "exposeAs", &mapping.service_name, mapping.expose_port)?;
        let service_port = checked_port(owner, "port", &mapping.service_name, mapping.service_port)?;

        if !exposed.insert(expose_port) {
            return Err(ApplyError::Validation {
                owner: owner.clone(),
                reason: format!("exposeAs {expose_port} is listed more than once"),
            });
        }

        keys.push(ListenerKey::new(
            owner.namespace.clone(),
            mapping.service_name.clone(),
            service_port,
            expose_port,
        ));
    }

    Ok(keys)
}
