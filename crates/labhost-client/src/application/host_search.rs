//! HostSearch: builds the table of reachable hosts.
//!
//! Three sources are merged, in this order, into one map keyed by host
//! identifier:
//!
//! 1. **Saved hosts** whose bridge type is `local`.  They are listed even
//!    when nothing answers, so the shell can offer to start them.
//! 2. **mDNS advertisements** of the secure-socket and websocket service
//!    types.  The identifier, fingerprint and description come from the TXT
//!    record.
//! 3. **UNIX sockets** named `<identifier>.sock` in the socket directory,
//!    kept only when a handshake over them succeeds.
//!
//! The first source to mention an identifier creates its record; later
//! sources only append bridges.
//!
//! # Architecture
//!
//! The use case depends on two traits, [`ServiceBrowser`] and
//! [`SocketProber`].  The scanner and the UNIX-socket prober in
//! `infrastructure` implement them; tests inject doubles.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::join_all;
use labhost_core::{Bridge, HostEnvironment, HostSettings, Service};
use tokio::time;
use tracing::{debug, info, warn};

/// mDNS type of hosts reachable over TLS.
pub const SECURE_SOCKET_SERVICE_TYPE: &str = "_labhost-tls._tcp.local";
/// mDNS type of hosts reachable over a plaintext websocket.
pub const WEBSOCKET_SERVICE_TYPE: &str = "_labhost-ws._tcp.local";

/// Default bound on one UNIX-socket probe.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

const TXT_IDENTIFIER: &str = "identifier";
const TXT_FINGERPRINT: &str = "fingerprint";
const TXT_DESCRIPTION: &str = "description";

/// Source of mDNS service advertisements.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ServiceBrowser: Send + Sync {
    /// Queries for `types`, waits `query_delay`, and returns what is known.
    async fn browse(&self, types: Vec<String>, query_delay: Duration) -> Result<Vec<Service>, String>;
}

/// Finds UNIX sockets and checks whether a host answers on them.
#[async_trait]
pub trait SocketProber: Send + Sync {
    /// Every `<identifier>.sock` file in the socket directory.
    async fn candidates(&self) -> Vec<(String, PathBuf)>;

    /// Returns `true` if a host completes the handshake on `path`.
    async fn probe(&self, path: &Path) -> bool;
}

/// The aggregation use case.
pub struct HostSearch {
    browser: Arc<dyn ServiceBrowser>,
    prober: Arc<dyn SocketProber>,
    query_delay: Duration,
    probe_timeout: Duration,
}

impl HostSearch {
    pub fn new(
        browser: Arc<dyn ServiceBrowser>,
        prober: Arc<dyn SocketProber>,
        query_delay: Duration,
        probe_timeout: Duration,
    ) -> Self {
        Self { browser, prober, query_delay, probe_timeout }
    }

    /// Runs all three sources and returns the merged table.
    pub async fn search(&self, saved_hosts: &[HostSettings]) -> BTreeMap<String, HostEnvironment> {
        let mut hosts = BTreeMap::new();

        add_saved_hosts(&mut hosts, saved_hosts);
        self.add_advertised_hosts(&mut hosts).await;
        self.add_socket_hosts(&mut hosts).await;

        info!("host search found {} host(s)", hosts.len());
        hosts
    }

    async fn add_advertised_hosts(&self, hosts: &mut BTreeMap<String, HostEnvironment>) {
        let types = vec![SECURE_SOCKET_SERVICE_TYPE.to_string(), WEBSOCKET_SERVICE_TYPE.to_string()];
        match self.browser.browse(types, self.query_delay).await {
            Ok(services) => merge_services(hosts, &services),
            Err(e) => warn!("skipping mDNS hosts: {e}"),
        }
    }

    async fn add_socket_hosts(&self, hosts: &mut BTreeMap<String, HostEnvironment>) {
        let candidates = self.prober.candidates().await;
        if candidates.is_empty() {
            return;
        }

        let probes = candidates.into_iter().map(|(identifier, path)| async move {
            let live = match time::timeout(self.probe_timeout, self.prober.probe(&path)).await {
                Ok(live) => live,
                Err(_) => {
                    debug!("probe of {} timed out", path.display());
                    false
                }
            };
            (identifier, path, live)
        });

        for (identifier, path, live) in join_all(probes).await {
            if !live {
                continue;
            }
            hosts
                .entry(identifier.clone())
                .or_insert_with(|| HostEnvironment::new(identifier))
                .add_bridge(Bridge::Unix { path });
        }
    }
}

/// Adds a bridge-less record for every saved host of type `local`.
fn add_saved_hosts(hosts: &mut BTreeMap<String, HostEnvironment>, saved_hosts: &[HostSettings]) {
    for settings in saved_hosts.iter().filter(|s| s.is_local()) {
        hosts
            .entry(settings.identifier.clone())
            .or_insert_with(|| HostEnvironment::from_settings(settings.clone()));
    }
}

/// Services of one type sharing an instance label, folded together.
#[derive(Default)]
struct Advertisement {
    hostname: Option<String>,
    port: Option<u16>,
    address: Option<IpAddr>,
    properties: BTreeMap<String, String>,
}

impl Advertisement {
    fn absorb(&mut self, service: &Service) {
        self.hostname = self.hostname.take().or_else(|| service.hostname.clone());
        self.port = self.port.or(service.port);
        self.address = self.address.or(service.address());
        for (key, value) in &service.properties {
            self.properties.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }

    fn endpoint(&self) -> Option<(u16, IpAddr)> {
        Some((self.port?, self.address?))
    }
}

/// Every advertisement published under one instance label.
#[derive(Default)]
struct Instance {
    tls: Option<Advertisement>,
    websocket: Option<Advertisement>,
}

impl Instance {
    /// Looks `key` up in the TLS record first, then the websocket one.
    fn property(&self, key: &str) -> Option<String> {
        [&self.tls, &self.websocket]
            .into_iter()
            .flatten()
            .find_map(|ad| ad.properties.get(key).cloned())
    }
}

/// Groups services by instance label across both service types and turns
/// each group into one bridge per complete type, attached to the host named
/// by the group's `identifier` property.
fn merge_services(hosts: &mut BTreeMap<String, HostEnvironment>, services: &[Service]) {
    let mut groups: BTreeMap<String, Instance> = BTreeMap::new();
    for service in services {
        let group = groups.entry(service.instance().to_ascii_lowercase()).or_default();
        let slot = match service.service_type.to_ascii_lowercase().as_str() {
            SECURE_SOCKET_SERVICE_TYPE => &mut group.tls,
            WEBSOCKET_SERVICE_TYPE => &mut group.websocket,
            other => {
                debug!("ignoring service of unexpected type {other:?}");
                continue;
            }
        };
        slot.get_or_insert_with(Advertisement::default).absorb(service);
    }

    for (instance, group) in groups {
        let Some(identifier) = group.property(TXT_IDENTIFIER) else {
            debug!("advertisement {instance:?} has no identifier");
            continue;
        };

        let mut bridges = Vec::new();
        if let Some(ad) = group.tls.as_ref() {
            match ad.endpoint() {
                Some((port, address)) => bridges.push(Bridge::Tls {
                    hostname: ad.hostname.clone(),
                    address,
                    port,
                    fingerprint: ad.properties.get(TXT_FINGERPRINT).cloned(),
                }),
                None => debug!("tls advertisement {instance:?} is missing its port or address"),
            }
        }
        if let Some(ad) = group.websocket.as_ref() {
            match ad.endpoint() {
                Some((port, address)) => {
                    bridges.push(Bridge::WebSocket { hostname: ad.hostname.clone(), address, port })
                }
                None => debug!("websocket advertisement {instance:?} is missing its port or address"),
            }
        }
        if bridges.is_empty() {
            continue;
        }

        let env = hosts.entry(identifier.clone()).or_insert_with(|| {
            let mut env = HostEnvironment::new(identifier);
            env.label = group.property(TXT_DESCRIPTION);
            env
        });
        for bridge in bridges {
            env.add_bridge(bridge);
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use labhost_core::BridgeSettings;
    use std::collections::HashSet;
    use std::net::Ipv4Addr;
    use std::sync::Mutex;

    // ── Test doubles ──────────────────────────────────────────────────────────

    /// Serves a fixed socket list; `live` decides which probes succeed.
    #[derive(Default)]
    struct StubProber {
        sockets: Vec<(String, PathBuf)>,
        live: HashSet<PathBuf>,
        hang: HashSet<PathBuf>,
        probed: Mutex<Vec<PathBuf>>,
    }

    #[async_trait]
    impl SocketProber for StubProber {
        async fn candidates(&self) -> Vec<(String, PathBuf)> {
            self.sockets.clone()
        }

        async fn probe(&self, path: &Path) -> bool {
            self.probed.lock().unwrap().push(path.to_path_buf());
            if self.hang.contains(path) {
                std::future::pending::<()>().await;
            }
            self.live.contains(path)
        }
    }

    fn tls_service(instance: &str, identifier: &str, port: u16) -> Service {
        let mut svc = Service::new(format!("{instance}.{SECURE_SOCKET_SERVICE_TYPE}"), SECURE_SOCKET_SERVICE_TYPE);
        svc.hostname = Some(format!("{identifier}.local"));
        svc.port = Some(port);
        svc.ipv4 = Some(Ipv4Addr::new(192, 168, 1, 20));
        svc.properties.insert("identifier".into(), identifier.into());
        svc.properties.insert("fingerprint".into(), "ab".repeat(32));
        svc.properties.insert("description".into(), format!("{instance} bench"));
        svc
    }

    fn browser_returning(result: Result<Vec<Service>, String>) -> MockServiceBrowser {
        let mut browser = MockServiceBrowser::new();
        browser.expect_browse().times(1).return_once(move |_, _| result);
        browser
    }

    fn search_with(browser: MockServiceBrowser, prober: StubProber) -> HostSearch {
        HostSearch::new(Arc::new(browser), Arc::new(prober), Duration::ZERO, DEFAULT_PROBE_TIMEOUT)
    }

    fn local_settings(identifier: &str) -> HostSettings {
        HostSettings {
            identifier: identifier.to_string(),
            label: Some("My bench".to_string()),
            bridge: BridgeSettings::Local,
        }
    }

    // ── Saved hosts ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_saved_local_hosts_are_listed_without_bridges() {
        // Arrange
        let search = search_with(browser_returning(Ok(vec![])), StubProber::default());
        let remote = HostSettings {
            identifier: "remote".to_string(),
            label: None,
            bridge: BridgeSettings::Tcp { hostname: "10.0.0.5".into(), port: 4567, fingerprint: None },
        };

        // Act
        let hosts = search.search(&[local_settings("bench-1"), remote]).await;

        // Assert
        assert_eq!(hosts.len(), 1);
        let env = &hosts["bench-1"];
        assert!(env.bridges.is_empty());
        assert_eq!(env.label.as_deref(), Some("My bench"));
        assert!(env.host_settings.is_some());
    }

    // ── mDNS ──────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_browser_is_asked_for_both_service_types() {
        let mut browser = MockServiceBrowser::new();
        browser
            .expect_browse()
            .withf(|types, delay| {
                types == &[SECURE_SOCKET_SERVICE_TYPE.to_string(), WEBSOCKET_SERVICE_TYPE.to_string()]
                    && *delay == Duration::from_millis(800)
            })
            .times(1)
            .returning(|_, _| Ok(vec![]));
        let search =
            HostSearch::new(Arc::new(browser), Arc::new(StubProber::default()), Duration::from_millis(800), DEFAULT_PROBE_TIMEOUT);

        assert!(search.search(&[]).await.is_empty());
    }

    #[tokio::test]
    async fn test_tls_advertisement_becomes_pinned_bridge() {
        // Arrange
        let search = search_with(browser_returning(Ok(vec![tls_service("A", "bench-a", 4567)])), StubProber::default());

        // Act
        let hosts = search.search(&[]).await;

        // Assert
        let env = &hosts["bench-a"];
        assert_eq!(env.label.as_deref(), Some("A bench"));
        assert_eq!(
            env.bridges,
            vec![Bridge::Tls {
                hostname: Some("bench-a.local".into()),
                address: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)),
                port: 4567,
                fingerprint: Some("ab".repeat(32)),
            }]
        );
    }

    #[tokio::test]
    async fn test_websocket_advertisement_joins_existing_saved_host() {
        // Arrange
        let mut ws = Service::new(format!("Bench.{WEBSOCKET_SERVICE_TYPE}"), WEBSOCKET_SERVICE_TYPE);
        ws.port = Some(8080);
        ws.ipv4 = Some(Ipv4Addr::new(10, 0, 0, 9));
        ws.properties.insert("identifier".into(), "bench-1".into());
        ws.properties.insert("description".into(), "ignored".into());
        let search = search_with(browser_returning(Ok(vec![ws])), StubProber::default());

        // Act
        let hosts = search.search(&[local_settings("bench-1")]).await;

        // Assert – the saved record keeps its label and gains the bridge
        let env = &hosts["bench-1"];
        assert_eq!(env.label.as_deref(), Some("My bench"));
        assert_eq!(env.bridges.len(), 1);
        assert_eq!(env.bridges[0].kind(), "websocket");
    }

    #[tokio::test]
    async fn test_websocket_bridge_borrows_identifier_from_tls_record() {
        // Arrange – only the TLS TXT record names the host
        let tls = tls_service("Bench", "bench-1", 4567);
        let mut ws = Service::new(format!("Bench.{WEBSOCKET_SERVICE_TYPE}"), WEBSOCKET_SERVICE_TYPE);
        ws.port = Some(8080);
        ws.ipv4 = Some(Ipv4Addr::new(192, 168, 1, 20));
        let search = search_with(browser_returning(Ok(vec![ws, tls])), StubProber::default());

        // Act
        let hosts = search.search(&[]).await;

        // Assert
        assert_eq!(hosts.len(), 1);
        let env = &hosts["bench-1"];
        let kinds: Vec<_> = env.bridges.iter().map(Bridge::kind).collect();
        assert_eq!(kinds, vec!["tls", "websocket"]);
        assert_eq!(env.label.as_deref(), Some("Bench bench"));
        assert_eq!(
            env.bridges[1],
            Bridge::WebSocket { hostname: None, address: IpAddr::V4(Ipv4Addr::new(192, 168, 1, 20)), port: 8080 }
        );
    }

    #[tokio::test]
    async fn test_incomplete_advertisements_are_skipped() {
        let mut no_address = tls_service("A", "bench-a", 4567);
        no_address.ipv4 = None;
        let mut no_identifier = tls_service("B", "bench-b", 4567);
        no_identifier.properties.remove("identifier");
        let search = search_with(browser_returning(Ok(vec![no_address, no_identifier])), StubProber::default());

        assert!(search.search(&[]).await.is_empty());
    }

    #[tokio::test]
    async fn test_services_with_same_label_are_folded() {
        // Arrange – one record carries the port, the other the address
        let mut first = tls_service("A", "bench-a", 4567);
        first.ipv4 = None;
        let mut second = Service::new(format!("A.{SECURE_SOCKET_SERVICE_TYPE}"), SECURE_SOCKET_SERVICE_TYPE);
        second.ipv6 = Some("fe80::1".parse().unwrap());
        let search = search_with(browser_returning(Ok(vec![first, second])), StubProber::default());

        // Act
        let hosts = search.search(&[]).await;

        // Assert
        assert_eq!(hosts["bench-a"].bridges.len(), 1);
    }

    #[tokio::test]
    async fn test_browser_failure_skips_mdns_only() {
        // Arrange
        let path = PathBuf::from("/run/labhost/bench-2.sock");
        let prober = StubProber {
            sockets: vec![("bench-2".into(), path.clone())],
            live: HashSet::from([path.clone()]),
            ..Default::default()
        };
        let search = search_with(browser_returning(Err("socket closed".into())), prober);

        // Act
        let hosts = search.search(&[local_settings("bench-1")]).await;

        // Assert
        assert_eq!(hosts.keys().collect::<Vec<_>>(), vec!["bench-1", "bench-2"]);
        assert_eq!(hosts["bench-2"].bridges, vec![Bridge::Unix { path }]);
    }

    // ── UNIX sockets ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn test_only_live_sockets_add_bridges() {
        // Arrange
        let live = PathBuf::from("/tmp/labhost/bench-a.sock");
        let dead = PathBuf::from("/tmp/labhost/stale.sock");
        let prober = StubProber {
            sockets: vec![("bench-a".into(), live.clone()), ("stale".into(), dead)],
            live: HashSet::from([live.clone()]),
            ..Default::default()
        };
        let search = search_with(browser_returning(Ok(vec![tls_service("A", "bench-a", 4567)])), prober);

        // Act
        let hosts = search.search(&[]).await;

        // Assert – mDNS record created first, socket bridge appended
        assert_eq!(hosts.len(), 1);
        let kinds: Vec<_> = hosts["bench-a"].bridges.iter().map(Bridge::kind).collect();
        assert_eq!(kinds, vec!["tls", "unix"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_probe_times_out_without_blocking_others() {
        // Arrange
        let slow = PathBuf::from("/tmp/labhost/slow.sock");
        let fast = PathBuf::from("/tmp/labhost/fast.sock");
        let prober = Arc::new(StubProber {
            sockets: vec![("slow".into(), slow.clone()), ("fast".into(), fast.clone())],
            live: HashSet::from([slow.clone(), fast.clone()]),
            hang: HashSet::from([slow]),
            ..Default::default()
        });
        let search = HostSearch::new(
            Arc::new(browser_returning(Ok(vec![]))),
            Arc::clone(&prober) as Arc<dyn SocketProber>,
            Duration::ZERO,
            DEFAULT_PROBE_TIMEOUT,
        );

        // Act
        let hosts = search.search(&[]).await;

        // Assert
        assert_eq!(hosts.keys().collect::<Vec<_>>(), vec!["fast"]);
        assert_eq!(prober.probed.lock().unwrap().len(), 2);
    }
}
