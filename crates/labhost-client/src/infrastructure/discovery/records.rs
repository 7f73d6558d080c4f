//! Multicast-DNS record cache.
//!
//! This module does no I/O.  The scanner turns each received packet into a
//! list of [`RecordUpdate`]s with [`parse_packet`] and feeds them to a
//! [`RecordCache`] together with the arrival time; the cache answers
//! "which services of type X are alive right now?" by joining its tables.
//!
//! # The five tables (for beginners)
//!
//! ```text
//! PTR   _labhost-tls._tcp.local  → Bench A._labhost-tls._tcp.local   (many per name)
//! SRV   Bench A._labhost-tls._tcp.local → bench-a.local:4567
//! TXT   Bench A._labhost-tls._tcp.local → identifier=bench-a fingerprint=...
//! A     bench-a.local → 192.168.1.20
//! AAAA  bench-a.local → fe80::1
//! ```
//!
//! Every entry expires `ttl` seconds after the packet carrying it arrived.
//! An entry is expired once `now >= expiry`, so a TTL of zero (a "goodbye"
//! announcement) removes the record immediately.

use std::collections::{BTreeMap, HashMap};
use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::{Duration, Instant};

use labhost_core::Service;
use simple_dns::rdata::RData;
use simple_dns::{Packet, SimpleDnsError};

/// Payload of one resource record the cache understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    /// Instance name the service type points to.
    Ptr(String),
    Srv { target: String, port: u16 },
    /// Parsed `key=value` properties.
    Txt(BTreeMap<String, String>),
}

/// One resource record taken from a packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordUpdate {
    pub name: String,
    pub ttl: Duration,
    pub data: RecordData,
}

/// Cache key for a DNS name: lowercase, no trailing dot.
pub fn normalize_name(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

/// Extracts every supported record from the answer and additional sections.
///
/// Record types other than A, AAAA, PTR, SRV and TXT are ignored.
pub fn parse_packet(bytes: &[u8]) -> Result<Vec<RecordUpdate>, SimpleDnsError> {
    let packet = Packet::parse(bytes)?;

    let updates = packet
        .answers
        .iter()
        .chain(packet.additional_records.iter())
        .filter_map(|record| {
            let data = match &record.rdata {
                RData::A(a) => RecordData::A(Ipv4Addr::from(a.address)),
                RData::AAAA(aaaa) => RecordData::Aaaa(Ipv6Addr::from(aaaa.address)),
                RData::PTR(ptr) => RecordData::Ptr(trim_dot(&ptr.0.to_string())),
                RData::SRV(srv) => RecordData::Srv { target: trim_dot(&srv.target.to_string()), port: srv.port },
                RData::TXT(txt) => RecordData::Txt(
                    txt.attributes()
                        .into_iter()
                        .map(|(key, value)| (key, value.unwrap_or_default()))
                        .collect(),
                ),
                _ => return None,
            };
            Some(RecordUpdate {
                name: trim_dot(&record.name.to_string()),
                ttl: Duration::from_secs(u64::from(record.ttl)),
                data,
            })
        })
        .collect();

    Ok(updates)
}

fn trim_dot(name: &str) -> String {
    name.trim_end_matches('.').to_string()
}

// ── Cache ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct Entry<T> {
    value: T,
    expires_at: Instant,
}

impl<T> Entry<T> {
    fn new(value: T, now: Instant, ttl: Duration) -> Self {
        Self { value, expires_at: now + ttl }
    }

    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

#[derive(Debug, Clone)]
struct SrvTarget {
    target: String,
    port: u16,
}

/// The five record tables, keyed by normalized name.
#[derive(Debug, Default)]
pub struct RecordCache {
    a: HashMap<String, Entry<Ipv4Addr>>,
    aaaa: HashMap<String, Entry<Ipv6Addr>>,
    /// service type → (normalized instance → instance as announced)
    ptr: HashMap<String, HashMap<String, Entry<String>>>,
    srv: HashMap<String, Entry<SrvTarget>>,
    txt: HashMap<String, Entry<BTreeMap<String, String>>>,
}

impl RecordCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores one record that arrived at `now`.
    ///
    /// PTR records add to the set of instances for their name; every other
    /// type replaces the previous value.
    pub fn insert(&mut self, update: RecordUpdate, now: Instant) {
        let key = normalize_name(&update.name);
        match update.data {
            RecordData::A(addr) => {
                self.a.insert(key, Entry::new(addr, now, update.ttl));
            }
            RecordData::Aaaa(addr) => {
                self.aaaa.insert(key, Entry::new(addr, now, update.ttl));
            }
            RecordData::Ptr(instance) => {
                self.ptr
                    .entry(key)
                    .or_default()
                    .insert(normalize_name(&instance), Entry::new(instance, now, update.ttl));
            }
            RecordData::Srv { target, port } => {
                self.srv.insert(key, Entry::new(SrvTarget { target, port }, now, update.ttl));
            }
            RecordData::Txt(properties) => {
                self.txt.insert(key, Entry::new(properties, now, update.ttl));
            }
        }
    }

    /// Drops every entry that has expired at `now`; returns how many went.
    pub fn expire(&mut self, now: Instant) -> usize {
        let before = self.len();

        self.a.retain(|_, e| e.is_live(now));
        self.aaaa.retain(|_, e| e.is_live(now));
        self.srv.retain(|_, e| e.is_live(now));
        self.txt.retain(|_, e| e.is_live(now));
        self.ptr.retain(|_, targets| {
            targets.retain(|_, e| e.is_live(now));
            !targets.is_empty()
        });

        before - self.len()
    }

    /// Total number of entries across all tables.
    pub fn len(&self) -> usize {
        self.a.len()
            + self.aaaa.len()
            + self.srv.len()
            + self.txt.len()
            + self.ptr.values().map(HashMap::len).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves every live instance of `service_type` into a [`Service`].
    ///
    /// Instances are returned sorted by name.
    pub fn services(&self, service_type: &str, now: Instant) -> Vec<Service> {
        let Some(targets) = self.ptr.get(&normalize_name(service_type)) else {
            return Vec::new();
        };

        let mut instances: Vec<&String> =
            targets.values().filter(|e| e.is_live(now)).map(|e| &e.value).collect();
        instances.sort();

        instances
            .into_iter()
            .map(|instance| self.resolve(instance, service_type, now))
            .collect()
    }

    fn resolve(&self, instance: &str, service_type: &str, now: Instant) -> Service {
        let mut service = Service::new(instance, service_type);
        let key = normalize_name(instance);

        if let Some(srv) = self.srv.get(&key).filter(|e| e.is_live(now)) {
            service.hostname = Some(srv.value.target.clone());
            service.port = Some(srv.value.port);

            let host_key = normalize_name(&srv.value.target);
            service.ipv4 = self.a.get(&host_key).filter(|e| e.is_live(now)).map(|e| e.value);
            service.ipv6 = self.aaaa.get(&host_key).filter(|e| e.is_live(now)).map(|e| e.value);
        }

        if let Some(txt) = self.txt.get(&key).filter(|e| e.is_live(now)) {
            service.properties = txt.value.clone();
        }

        service
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
