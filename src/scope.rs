//! Address scopes: the pool, reservation, offer, and lease manager.
//!
//! A scope is an administrative partition bound to one local interface.
//! It owns the offer and lease maps for its range and is the only place
//! allocation decisions are made. Operations on a single scope are
//! serialized behind one [`RwLock`]; distinct scopes are independent.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use crate::config::sanitize_hostname;
use crate::error::{Error, Result};
use crate::lease::{ClientId, HardwareAddress, Lease, LeaseKind, OFFER_TIMEOUT_SECONDS};
use crate::message::DhcpMessage;
use crate::options::{ClientFqdn, DhcpOption, OptionCode};
use crate::probe;

/// A fixed address assignment for one client identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub address: Ipv4Addr,
    pub hostname: Option<String>,
}

/// Scope settings fixed at load time.
///
/// `(interface_address, start, end, subnet_mask)` is the scope's range
/// identity; two scopes with equal tuples are the same range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeConfig {
    pub interface_address: Ipv4Addr,
    pub start: Ipv4Addr,
    pub end: Ipv4Addr,
    pub subnet_mask: Ipv4Addr,
    pub router: Option<Ipv4Addr>,
    pub dns_servers: Vec<Ipv4Addr>,
    pub ntp_servers: Vec<Ipv4Addr>,
    pub domain_name: Option<String>,
    pub dns_ttl: u32,
    pub lease_time_secs: u32,
    pub offer_delay_ms: u32,
    pub ping_timeout_ms: u16,
    pub exclusions: Vec<(Ipv4Addr, Ipv4Addr)>,
    pub reservations: HashMap<ClientId, Reservation>,
    pub allowed_vendor_classes: Vec<String>,
}

impl ScopeConfig {
    pub fn validate(&self) -> Result<()> {
        let start = u32::from(self.start);
        let end = u32::from(self.end);

        if start > end {
            return Err(Error::InvalidScope(
                "range start must not exceed range end".to_string(),
            ));
        }

        if !Self::is_valid_subnet_mask(self.subnet_mask) {
            return Err(Error::InvalidScope(format!(
                "invalid subnet mask: {} (must be contiguous)",
                self.subnet_mask
            )));
        }

        if self.network_of(self.start) != self.network_of(self.end) {
            return Err(Error::InvalidScope(
                "range start and end lie in different subnets".to_string(),
            ));
        }

        if self.lease_time_secs == 0 {
            return Err(Error::InvalidScope(
                "lease time must be greater than 0".to_string(),
            ));
        }

        for (from, to) in &self.exclusions {
            if u32::from(*from) > u32::from(*to) {
                return Err(Error::InvalidScope(format!(
                    "exclusion range {}-{} is inverted",
                    from, to
                )));
            }
        }

        Ok(())
    }

    fn is_valid_subnet_mask(mask: Ipv4Addr) -> bool {
        let mask_bits = u32::from(mask);
        if mask_bits == 0 {
            return false;
        }
        let inverted = !mask_bits;
        inverted.count_ones() == inverted.trailing_ones()
    }

    fn network_of(&self, ip: Ipv4Addr) -> u32 {
        u32::from(ip) & u32::from(self.subnet_mask)
    }

    pub fn network_address(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.network_of(self.start))
    }

    pub fn broadcast_address(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.network_of(self.start) | !u32::from(self.subnet_mask))
    }

    /// Subnet membership under `subnet_mask`, not pool membership.
    ///
    /// Relay and renewal candidates (giaddr, ciaddr, the interface
    /// address itself) are routinely outside `[start..end]` but inside
    /// the scope's subnet.
    pub fn is_address_in_range(&self, ip: Ipv4Addr) -> bool {
        self.network_of(ip) == self.network_of(self.start)
    }

    pub fn is_in_pool(&self, ip: Ipv4Addr) -> bool {
        let addr = u32::from(ip);
        addr >= u32::from(self.start) && addr <= u32::from(self.end)
    }

    fn is_excluded(&self, ip: Ipv4Addr) -> bool {
        let addr = u32::from(ip);
        self.exclusions
            .iter()
            .any(|(from, to)| addr >= u32::from(*from) && addr <= u32::from(*to))
    }

    /// The in-addr.arpa zone covering the pool's subnet.
    pub fn reverse_zone(&self) -> String {
        let octets = self.network_address().octets();
        let full_octets = (u32::from(self.subnet_mask).count_ones() as usize / 8).clamp(1, 3);
        let mut labels: Vec<String> = octets[..full_octets]
            .iter()
            .map(|octet| octet.to_string())
            .collect();
        labels.reverse();
        format!("{}.in-addr.arpa", labels.join("."))
    }

    /// Range identity equality used for duplicate detection on load.
    pub fn same_range(&self, other: &ScopeConfig) -> bool {
        self.interface_address == other.interface_address
            && self.start == other.start
            && self.end == other.end
            && self.subnet_mask == other.subnet_mask
    }
}

#[derive(Debug)]
struct ScopeState {
    name: String,
    enabled: bool,
    offers: HashMap<ClientId, Lease>,
    leases: HashMap<ClientId, Lease>,
    /// Addresses declined by clients; skipped for the rest of the uptime.
    declined: HashSet<Ipv4Addr>,
    last_modified: DateTime<Utc>,
}

/// One address scope with its offer/lease state.
#[derive(Debug)]
pub struct Scope {
    config: ScopeConfig,
    state: RwLock<ScopeState>,
}

impl Scope {
    pub fn new(name: String, config: ScopeConfig, enabled: bool) -> Self {
        Self {
            config,
            state: RwLock::new(ScopeState {
                name,
                enabled,
                offers: HashMap::new(),
                leases: HashMap::new(),
                declined: HashSet::new(),
                last_modified: Utc::now(),
            }),
        }
    }

    /// Rebuilds a scope from persisted state.
    pub fn from_persisted(
        name: String,
        config: ScopeConfig,
        enabled: bool,
        leases: Vec<Lease>,
    ) -> Self {
        let leases = leases
            .into_iter()
            .map(|lease| (lease.client_id.clone(), lease))
            .collect();
        Self {
            config,
            state: RwLock::new(ScopeState {
                name,
                enabled,
                offers: HashMap::new(),
                leases,
                declined: HashSet::new(),
                last_modified: Utc::now(),
            }),
        }
    }

    pub fn config(&self) -> &ScopeConfig {
        &self.config
    }

    pub async fn name(&self) -> String {
        self.state.read().await.name.clone()
    }

    pub async fn set_name(&self, name: String) {
        let mut state = self.state.write().await;
        state.name = name;
        state.last_modified = Utc::now();
    }

    pub async fn is_enabled(&self) -> bool {
        self.state.read().await.enabled
    }

    pub async fn set_enabled(&self, enabled: bool) {
        let mut state = self.state.write().await;
        if state.enabled != enabled {
            state.enabled = enabled;
            state.last_modified = Utc::now();
        }
    }

    pub async fn last_modified(&self) -> DateTime<Utc> {
        self.state.read().await.last_modified
    }

    pub async fn lease_snapshot(&self) -> Vec<Lease> {
        self.state.read().await.leases.values().cloned().collect()
    }

    /// Resolves the lease host name for a request.
    ///
    /// The FQDN option wins; otherwise HostName joined with the scope
    /// domain, lower-cased. A bare HostName is kept as-is.
    pub fn resolve_host_name(&self, request: &DhcpMessage) -> Option<String> {
        if let Some(fqdn) = request.client_fqdn()
            && !fqdn.name.is_empty()
        {
            return Some(self.qualify(sanitize_hostname(&fqdn.name.to_lowercase())));
        }
        let host = request.host_name()?;
        let host = sanitize_hostname(host);
        if host.is_empty() {
            return None;
        }
        Some(self.qualify(host.to_lowercase()))
    }

    fn qualify(&self, host: String) -> String {
        match &self.config.domain_name {
            Some(domain) if !host.contains('.') => format!("{}.{}", host, domain).to_lowercase(),
            _ => host,
        }
    }

    /// Finds or creates an offer for the client.
    ///
    /// Selection order: reservation, then existing lease or unexpired
    /// offer, then the first free pool address in ascending order.
    pub async fn find_offer(
        &self,
        client_id: &ClientId,
        hardware: &HardwareAddress,
        hostname: Option<String>,
    ) -> Result<Lease> {
        let mut state = self.state.write().await;

        if let Some(reservation) = self.config.reservations.get(client_id) {
            // A reloaded scope file can hold another client's lease on
            // the freshly reserved address; honoring the reservation
            // then would put two entries on one address.
            let held_by_other = state
                .leases
                .values()
                .any(|lease| lease.address == reservation.address && lease.client_id != *client_id)
                || state.offers.values().any(|offer| {
                    offer.address == reservation.address
                        && offer.client_id != *client_id
                        && !offer.is_expired()
                });
            if held_by_other {
                return Err(Error::AddressUnavailable(state.name.clone()));
            }

            let lease = Lease::offered(
                client_id.clone(),
                hardware.clone(),
                reservation.address,
                reservation.hostname.clone().or(hostname),
                LeaseKind::Reserved,
            );
            state.offers.insert(client_id.clone(), lease.clone());
            return Ok(lease);
        }

        if let Some(lease) = state.leases.get(client_id) {
            return Ok(lease.clone());
        }

        if let Some(offer) = state.offers.get_mut(client_id)
            && !offer.is_expired()
        {
            offer.renew(OFFER_TIMEOUT_SECONDS);
            return Ok(offer.clone());
        }

        let start = u32::from(self.config.start);
        let end = u32::from(self.config.end);
        for candidate in start..=end {
            let address = Ipv4Addr::from(candidate);
            if !self.is_allocatable(&state, address) {
                continue;
            }

            if self.config.ping_timeout_ms > 0
                && probe::address_responds(address, self.config.ping_timeout_ms).await
            {
                debug!("Skipping {}: address answered echo probe", address);
                continue;
            }

            let lease = Lease::offered(
                client_id.clone(),
                hardware.clone(),
                address,
                hostname,
                LeaseKind::Dynamic,
            );
            state.offers.insert(client_id.clone(), lease.clone());
            return Ok(lease);
        }

        Err(Error::AddressUnavailable(state.name.clone()))
    }

    fn is_allocatable(&self, state: &ScopeState, address: Ipv4Addr) -> bool {
        if address == self.config.interface_address
            || Some(address) == self.config.router
            || address == self.config.network_address()
            || address == self.config.broadcast_address()
        {
            return false;
        }
        if self.config.is_excluded(address) || state.declined.contains(&address) {
            return false;
        }
        if self
            .config
            .reservations
            .values()
            .any(|reservation| reservation.address == address)
        {
            return false;
        }
        if state.leases.values().any(|lease| lease.address == address) {
            return false;
        }
        !state
            .offers
            .values()
            .any(|offer| offer.address == address && !offer.is_expired())
    }

    /// Lookup by client identity only; never allocates.
    pub async fn existing_lease_or_offer(&self, client_id: &ClientId) -> Option<Lease> {
        let state = self.state.read().await;
        if let Some(lease) = state.leases.get(client_id) {
            return Some(lease.clone());
        }
        state
            .offers
            .get(client_id)
            .filter(|offer| !offer.is_expired())
            .cloned()
    }

    /// Promotes an offer (or renews a lease) into a committed lease.
    ///
    /// The requested lease time is honored when positive and shorter
    /// than the scope default.
    pub async fn commit_lease(
        &self,
        lease: &Lease,
        requested_secs: Option<u32>,
        hostname: Option<String>,
    ) -> Result<Lease> {
        let mut state = self.state.write().await;

        let duration = match requested_secs {
            Some(secs) if secs > 0 && secs < self.config.lease_time_secs => secs,
            _ => self.config.lease_time_secs,
        };

        state.offers.remove(&lease.client_id);

        let mut committed = lease.clone();
        if let Some(existing) = state.leases.get(&lease.client_id) {
            committed.obtained_at = existing.obtained_at;
        }
        if let Some(hostname) = hostname {
            committed.hostname = Some(hostname);
        }
        committed.renew(duration);

        state
            .leases
            .insert(committed.client_id.clone(), committed.clone());
        state.last_modified = Utc::now();

        Ok(committed)
    }

    /// Removes the client's lease and any offer.
    ///
    /// With `declined`, the address enters the bad set and is skipped
    /// by the allocator until restart.
    pub async fn release_lease(&self, client_id: &ClientId, declined: bool) -> Option<Lease> {
        let mut state = self.state.write().await;

        let removed = state.leases.remove(client_id);
        state.offers.remove(client_id);

        if let Some(lease) = &removed {
            if declined {
                state.declined.insert(lease.address);
            }
            state.last_modified = Utc::now();
        }

        removed
    }

    pub async fn remove_expired_offers(&self) {
        let mut state = self.state.write().await;
        state.offers.retain(|_, offer| !offer.is_expired());
    }

    /// Purges expired leases; the returned list feeds DNS teardown.
    pub async fn remove_expired_leases(&self) -> Vec<Lease> {
        let mut state = self.state.write().await;

        let expired: Vec<ClientId> = state
            .leases
            .iter()
            .filter(|(_, lease)| lease.is_expired())
            .map(|(client, _)| client.clone())
            .collect();

        let mut removed = Vec::with_capacity(expired.len());
        for client in expired {
            if let Some(lease) = state.leases.remove(&client) {
                removed.push(lease);
            }
        }

        if !removed.is_empty() {
            state.last_modified = Utc::now();
        }

        removed
    }

    /// Builds the reply option set from scope configuration and the
    /// client's parameter request list, in requested order, followed by
    /// the mandatory options.
    ///
    /// Returns `None` when the vendor-class policy rejects the client;
    /// the caller drops the request silently.
    pub fn get_options(
        &self,
        request: &DhcpMessage,
        interface_address: Ipv4Addr,
    ) -> Option<Vec<DhcpOption>> {
        if !self.vendor_class_accepted(request) {
            return None;
        }

        let mut options: Vec<DhcpOption> = Vec::new();
        let push_unique = |options: &mut Vec<DhcpOption>, option: Option<DhcpOption>| {
            if let Some(option) = option
                && !options.iter().any(|seen| seen.code() == option.code())
            {
                options.push(option);
            }
        };

        if let Some(requested) = request.parameter_request_list() {
            for code in requested {
                push_unique(&mut options, self.option_for_code(*code, interface_address));
            }
        }

        for code in [
            OptionCode::ServerIdentifier as u8,
            OptionCode::LeaseTime as u8,
            OptionCode::SubnetMask as u8,
            OptionCode::BroadcastAddress as u8,
        ] {
            push_unique(&mut options, self.option_for_code(code, interface_address));
        }

        if let Some(fqdn) = request.client_fqdn() {
            let name = self
                .resolve_host_name(request)
                .unwrap_or_else(|| fqdn.name.to_lowercase());
            let flags = (fqdn.flags & !ClientFqdn::FLAG_SERVER_UPDATE) | ClientFqdn::FLAG_OVERRIDE;
            push_unique(
                &mut options,
                Some(DhcpOption::ClientFqdn(ClientFqdn {
                    flags,
                    rcode1: 0,
                    rcode2: 0,
                    name,
                })),
            );
        }

        Some(options)
    }

    fn option_for_code(&self, code: u8, interface_address: Ipv4Addr) -> Option<DhcpOption> {
        match OptionCode::try_from(code) {
            Ok(OptionCode::SubnetMask) => Some(DhcpOption::SubnetMask(self.config.subnet_mask)),
            Ok(OptionCode::Router) => self.config.router.map(|router| DhcpOption::Router(vec![router])),
            Ok(OptionCode::DnsServer) => (!self.config.dns_servers.is_empty())
                .then(|| DhcpOption::DnsServer(self.config.dns_servers.clone())),
            Ok(OptionCode::DomainName) => self
                .config
                .domain_name
                .clone()
                .map(DhcpOption::DomainName),
            Ok(OptionCode::BroadcastAddress) => {
                Some(DhcpOption::BroadcastAddress(self.config.broadcast_address()))
            }
            Ok(OptionCode::NtpServers) => (!self.config.ntp_servers.is_empty())
                .then(|| DhcpOption::NtpServers(self.config.ntp_servers.clone())),
            Ok(OptionCode::LeaseTime) => Some(DhcpOption::LeaseTime(self.config.lease_time_secs)),
            Ok(OptionCode::ServerIdentifier) => {
                Some(DhcpOption::ServerIdentifier(interface_address))
            }
            _ => None,
        }
    }

    fn vendor_class_accepted(&self, request: &DhcpMessage) -> bool {
        if self.config.allowed_vendor_classes.is_empty() {
            return true;
        }
        let Some(vendor) = request.vendor_class() else {
            return false;
        };
        let vendor = String::from_utf8_lossy(vendor);
        self.config
            .allowed_vendor_classes
            .iter()
            .any(|allowed| vendor.starts_with(allowed.as_str()))
    }

    /// Active lease view for the address-to-client map.
    pub async fn address_client_pairs(&self) -> Vec<(Ipv4Addr, String)> {
        let state = self.state.read().await;
        state
            .leases
            .values()
            .filter(|lease| !lease.is_expired())
            .map(|lease| {
                (
                    lease.address,
                    lease
                        .hostname
                        .clone()
                        .unwrap_or_else(|| lease.client_id.to_string()),
                )
            })
            .collect()
    }
}
