//! DNS zone synchronization for committed leases.
//!
//! The zone store itself is an external collaborator behind the
//! [`ZoneStore`] trait; this module owns the policy: which records a
//! lease produces, how new zones are bootstrapped, and when records are
//! torn down. [`MemoryZoneStore`] backs tests and deployments without a
//! real zone backend.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::debug;

use crate::lease::Lease;
use crate::scope::ScopeConfig;

const SOA_REFRESH: u32 = 28800;
const SOA_RETRY: u32 = 7200;
const SOA_EXPIRE: u32 = 604800;
const SOA_MINIMUM: u32 = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    A,
    Ptr,
    Soa,
    Ns,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordData {
    A(Ipv4Addr),
    Ptr(String),
    Ns(String),
    Soa {
        primary: String,
        serial: u32,
        refresh: u32,
        retry: u32,
        expire: u32,
        minimum: u32,
    },
}

impl RecordData {
    pub fn kind(&self) -> RecordKind {
        match self {
            Self::A(_) => RecordKind::A,
            Self::Ptr(_) => RecordKind::Ptr,
            Self::Ns(_) => RecordKind::Ns,
            Self::Soa { .. } => RecordKind::Soa,
        }
    }
}

/// The authoritative zone backend.
///
/// Implementations must be internally synchronized; the updater calls
/// in from concurrent handler tasks.
pub trait ZoneStore: Send + Sync {
    /// The DNS server's own host name, used in bootstrap NS records.
    fn server_name(&self) -> String;

    fn zone_exists(&self, zone: &str) -> bool;

    /// Upserts the records under `name`, creating the zone when absent.
    fn set_records(&self, zone: &str, name: &str, ttl: u32, data: RecordData);

    fn delete_records(&self, zone: &str, name: &str, kind: RecordKind);

    /// Hides the zone from zone transfers and public listing.
    fn make_zone_internal(&self, zone: &str);
}

#[derive(Debug, Default)]
struct MemoryZone {
    internal: bool,
    records: HashMap<(String, RecordKind), (u32, RecordData)>,
}

/// In-memory [`ZoneStore`].
#[derive(Default)]
pub struct MemoryZoneStore {
    server_name: String,
    zones: Mutex<HashMap<String, MemoryZone>>,
}

impl MemoryZoneStore {
    pub fn new(server_name: impl Into<String>) -> Self {
        Self {
            server_name: server_name.into(),
            zones: Mutex::new(HashMap::new()),
        }
    }

    pub fn record(&self, zone: &str, name: &str, kind: RecordKind) -> Option<RecordData> {
        let zones = self.zones.lock().expect("zone map poisoned");
        zones
            .get(zone)?
            .records
            .get(&(name.to_string(), kind))
            .map(|(_, data)| data.clone())
    }

    pub fn is_internal(&self, zone: &str) -> bool {
        let zones = self.zones.lock().expect("zone map poisoned");
        zones.get(zone).is_some_and(|zone| zone.internal)
    }
}

impl ZoneStore for MemoryZoneStore {
    fn server_name(&self) -> String {
        self.server_name.clone()
    }

    fn zone_exists(&self, zone: &str) -> bool {
        let zones = self.zones.lock().expect("zone map poisoned");
        zones.contains_key(zone)
    }

    fn set_records(&self, zone: &str, name: &str, ttl: u32, data: RecordData) {
        let mut zones = self.zones.lock().expect("zone map poisoned");
        zones
            .entry(zone.to_string())
            .or_default()
            .records
            .insert((name.to_string(), data.kind()), (ttl, data));
    }

    fn delete_records(&self, zone: &str, name: &str, kind: RecordKind) {
        let mut zones = self.zones.lock().expect("zone map poisoned");
        if let Some(zone) = zones.get_mut(zone) {
            zone.records.remove(&(name.to_string(), kind));
        }
    }

    fn make_zone_internal(&self, zone: &str) {
        let mut zones = self.zones.lock().expect("zone map poisoned");
        zones.entry(zone.to_string()).or_default().internal = true;
    }
}

/// The `/32` reverse name for an address.
fn reverse_name(address: Ipv4Addr) -> String {
    let octets = address.octets();
    format!(
        "{}.{}.{}.{}.in-addr.arpa",
        octets[3], octets[2], octets[1], octets[0]
    )
}

/// SOA serial in `YYYYMMDDHH` decimal.
fn soa_serial() -> u32 {
    Utc::now()
        .format("%Y%m%d%H")
        .to_string()
        .parse()
        .unwrap_or(1)
}

/// Qualifies a lease host name under the scope domain.
fn qualified_name(hostname: &str, domain: &str) -> String {
    let hostname = hostname.trim_end_matches('.');
    if hostname.ends_with(&format!(".{}", domain)) || hostname == domain {
        hostname.to_string()
    } else {
        format!("{}.{}", hostname, domain)
    }
}

/// Applies lease events to the authoritative zones.
///
/// With no store configured every operation is a no-op.
#[derive(Clone, Default)]
pub struct DnsUpdater {
    store: Option<Arc<dyn ZoneStore>>,
}

impl DnsUpdater {
    pub fn new(store: Option<Arc<dyn ZoneStore>>) -> Self {
        Self { store }
    }

    fn ensure_zone(&self, store: &Arc<dyn ZoneStore>, zone: &str) {
        if store.zone_exists(zone) {
            return;
        }
        let primary = store.server_name();
        store.set_records(
            zone,
            zone,
            SOA_MINIMUM,
            RecordData::Soa {
                primary: primary.clone(),
                serial: soa_serial(),
                refresh: SOA_REFRESH,
                retry: SOA_RETRY,
                expire: SOA_EXPIRE,
                minimum: SOA_MINIMUM,
            },
        );
        store.set_records(zone, zone, SOA_MINIMUM, RecordData::Ns(primary));
        store.make_zone_internal(zone);
    }

    /// Upserts the records for a committed lease: the reverse PTR
    /// always, the forward A only when `update_forward` (a client that
    /// cleared the FQDN `S` bit registers its own A record).
    pub fn lease_committed(&self, config: &ScopeConfig, lease: &Lease, update_forward: bool) {
        let Some(store) = &self.store else {
            return;
        };
        let Some(domain) = &config.domain_name else {
            return;
        };
        let Some(hostname) = &lease.hostname else {
            return;
        };

        let name = qualified_name(hostname, domain);

        if update_forward {
            self.ensure_zone(store, domain);
            store.set_records(domain, &name, config.dns_ttl, RecordData::A(lease.address));
        }

        let reverse_zone = config.reverse_zone();
        self.ensure_zone(store, &reverse_zone);
        store.set_records(
            &reverse_zone,
            &reverse_name(lease.address),
            config.dns_ttl,
            RecordData::Ptr(name.clone()),
        );

        debug!("DNS add: {} <-> {}", name, lease.address);
    }

    /// Deletes the records a committed lease produced.
    pub fn lease_removed(&self, config: &ScopeConfig, lease: &Lease) {
        let Some(store) = &self.store else {
            return;
        };
        let Some(domain) = &config.domain_name else {
            return;
        };
        let Some(hostname) = &lease.hostname else {
            return;
        };

        let name = qualified_name(hostname, domain);
        store.delete_records(domain, &name, RecordKind::A);
        store.delete_records(
            &config.reverse_zone(),
            &reverse_name(lease.address),
            RecordKind::Ptr,
        );

        debug!("DNS remove: {} <-> {}", name, lease.address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease::{ClientId, HardwareAddress, LeaseKind};
    use chrono::TimeDelta;

    fn test_config() -> ScopeConfig {
        ScopeConfig {
            interface_address: Ipv4Addr::new(10, 0, 0, 1),
            start: Ipv4Addr::new(10, 0, 0, 100),
            end: Ipv4Addr::new(10, 0, 0, 200),
            subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
            router: None,
            dns_servers: vec![],
            ntp_servers: vec![],
            domain_name: Some("example.lan".to_string()),
            dns_ttl: 900,
            lease_time_secs: 3600,
            offer_delay_ms: 0,
            ping_timeout_ms: 0,
            exclusions: vec![],
            reservations: HashMap::new(),
            allowed_vendor_classes: vec![],
        }
    }

    fn test_lease(hostname: Option<&str>) -> Lease {
        let now = Utc::now();
        Lease {
            client_id: ClientId::from_hardware(1, &[0, 0x11, 0x22, 0x33, 0x44, 0x55]),
            hardware: HardwareAddress::new(1, vec![0, 0x11, 0x22, 0x33, 0x44, 0x55]),
            address: Ipv4Addr::new(10, 0, 0, 100),
            hostname: hostname.map(str::to_string),
            obtained_at: now,
            expires_at: now + TimeDelta::seconds(3600),
            kind: LeaseKind::Dynamic,
        }
    }

    #[test]
    fn test_reverse_name() {
        assert_eq!(
            reverse_name(Ipv4Addr::new(10, 0, 0, 100)),
            "100.0.0.10.in-addr.arpa"
        );
    }

    #[test]
    fn test_qualified_name() {
        assert_eq!(qualified_name("printer", "example.lan"), "printer.example.lan");
        assert_eq!(
            qualified_name("printer.example.lan", "example.lan"),
            "printer.example.lan"
        );
    }

    #[test]
    fn test_soa_serial_shape() {
        let serial = soa_serial();
        // YYYYMMDDHH: ten decimal digits starting with the year.
        assert!(serial >= 2_000_00_00_00);
    }

    #[test]
    fn test_commit_creates_zones_and_records() {
        let store = Arc::new(MemoryZoneStore::new("ns.example.lan"));
        let updater = DnsUpdater::new(Some(store.clone() as Arc<dyn ZoneStore>));
        let config = test_config();
        let lease = test_lease(Some("laptop-7.example.lan"));

        updater.lease_committed(&config, &lease, true);

        assert!(store.zone_exists("example.lan"));
        assert!(store.is_internal("example.lan"));
        assert!(matches!(
            store.record("example.lan", "example.lan", RecordKind::Soa),
            Some(RecordData::Soa { refresh: 28800, retry: 7200, expire: 604800, minimum: 600, .. })
        ));
        assert_eq!(
            store.record("example.lan", "example.lan", RecordKind::Ns),
            Some(RecordData::Ns("ns.example.lan".to_string()))
        );
        assert_eq!(
            store.record("example.lan", "laptop-7.example.lan", RecordKind::A),
            Some(RecordData::A(Ipv4Addr::new(10, 0, 0, 100)))
        );

        assert!(store.zone_exists("0.0.10.in-addr.arpa"));
        assert_eq!(
            store.record(
                "0.0.10.in-addr.arpa",
                "100.0.0.10.in-addr.arpa",
                RecordKind::Ptr
            ),
            Some(RecordData::Ptr("laptop-7.example.lan".to_string()))
        );
    }

    #[test]
    fn test_remove_deletes_both_records() {
        let store = Arc::new(MemoryZoneStore::new("ns.example.lan"));
        let updater = DnsUpdater::new(Some(store.clone() as Arc<dyn ZoneStore>));
        let config = test_config();
        let lease = test_lease(Some("laptop-7.example.lan"));

        updater.lease_committed(&config, &lease, true);
        updater.lease_removed(&config, &lease);

        assert!(store
            .record("example.lan", "laptop-7.example.lan", RecordKind::A)
            .is_none());
        assert!(store
            .record(
                "0.0.10.in-addr.arpa",
                "100.0.0.10.in-addr.arpa",
                RecordKind::Ptr
            )
            .is_none());

        // Zone bootstrap records stay.
        assert!(store
            .record("example.lan", "example.lan", RecordKind::Soa)
            .is_some());
    }

    #[test]
    fn test_client_managed_forward_record() {
        let store = Arc::new(MemoryZoneStore::new("ns.example.lan"));
        let updater = DnsUpdater::new(Some(store.clone() as Arc<dyn ZoneStore>));
        let config = test_config();
        let lease = test_lease(Some("laptop-7.example.lan"));

        // The client registers its own A record; only the PTR is ours.
        updater.lease_committed(&config, &lease, false);

        assert!(!store.zone_exists("example.lan"));
        assert_eq!(
            store.record(
                "0.0.10.in-addr.arpa",
                "100.0.0.10.in-addr.arpa",
                RecordKind::Ptr
            ),
            Some(RecordData::Ptr("laptop-7.example.lan".to_string()))
        );
    }

    #[test]
    fn test_noop_without_domain_or_hostname() {
        let store = Arc::new(MemoryZoneStore::new("ns.example.lan"));
        let updater = DnsUpdater::new(Some(store.clone() as Arc<dyn ZoneStore>));

        let mut config = test_config();
        config.domain_name = None;
        updater.lease_committed(&config, &test_lease(Some("laptop")), true);
        assert!(!store.zone_exists("example.lan"));

        let config = test_config();
        updater.lease_committed(&config, &test_lease(None), true);
        assert!(!store.zone_exists("example.lan"));
    }

    #[test]
    fn test_noop_without_store() {
        let updater = DnsUpdater::new(None);
        updater.lease_committed(&test_config(), &test_lease(Some("laptop")), true);
        updater.lease_removed(&test_config(), &test_lease(Some("laptop")));
    }
}
