//! Service: a multicast-DNS advertisement resolved into something usable.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};

/// One advertised service instance.
///
/// Derived on demand from the record cache; never stored.  Fields that the
/// cache cannot resolve yet (no SRV or address record seen) are `None`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    /// Full instance name, e.g. `Bench A._labhost-tls._tcp.local`.
    pub name: String,
    /// The service type the instance was found under.
    pub service_type: String,
    /// Target hostname from the SRV record.
    pub hostname: Option<String>,
    /// Port from the SRV record.
    pub port: Option<u16>,
    pub ipv4: Option<Ipv4Addr>,
    pub ipv6: Option<Ipv6Addr>,
    /// `key=value` pairs from the TXT record.
    pub properties: BTreeMap<String, String>,
}

impl Service {
    /// Creates a service with only its name and type known.
    pub fn new(name: impl Into<String>, service_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            service_type: service_type.into(),
            hostname: None,
            port: None,
            ipv4: None,
            ipv6: None,
            properties: BTreeMap::new(),
        }
    }

    /// The instance label: the name with the `.<service_type>` suffix removed.
    pub fn instance(&self) -> &str {
        let suffix = format!(".{}", self.service_type);
        let split = self.name.len().saturating_sub(suffix.len());
        match (self.name.get(..split), self.name.get(split..)) {
            (Some(label), Some(tail)) if !label.is_empty() && tail.eq_ignore_ascii_case(&suffix) => label,
            _ => &self.name,
        }
    }

    /// The preferred address: IPv4 when known, otherwise IPv6.
    pub fn address(&self) -> Option<IpAddr> {
        self.ipv4.map(IpAddr::V4).or(self.ipv6.map(IpAddr::V6))
    }

    /// Looks up a TXT property.
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
