//! The DHCP protocol state machine.
//!
//! One entry point: a decoded request plus its remote and interface
//! endpoints in, an optional reply plus destination out. The engine
//! never touches sockets, which keeps the RFC 2131 §4 tables testable
//! without binding port 67.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::dns::DnsUpdater;
use crate::error::{Error, Result};
use crate::lease::Lease;
use crate::message::{BOOTREQUEST, DhcpMessage};
use crate::options::{DhcpOption, MessageType};
use crate::scope::Scope;
use crate::server::ScopeRegistry;

pub const DHCP_SERVER_PORT: u16 = 67;
pub const DHCP_CLIENT_PORT: u16 = 68;

/// A synthesized reply and where to send it.
#[derive(Debug)]
pub struct Reply {
    pub message: DhcpMessage,
    pub destination: SocketAddrV4,
}

pub struct Engine {
    scopes: Arc<ScopeRegistry>,
    dns: DnsUpdater,
}

impl Engine {
    pub fn new(scopes: Arc<ScopeRegistry>, dns: DnsUpdater) -> Self {
        Self { scopes, dns }
    }

    /// Dispatches one request. `Ok(None)` means "no reply": either the
    /// message type calls for silence or the request was dropped.
    pub async fn handle(
        &self,
        request: &DhcpMessage,
        remote: SocketAddr,
        interface: Ipv4Addr,
    ) -> Result<Option<Reply>> {
        if request.op != BOOTREQUEST {
            debug!("Ignoring non-request message (op {})", request.op);
            return Ok(None);
        }

        let IpAddr::V4(remote_addr) = remote.ip() else {
            return Ok(None);
        };

        let Some(message_type) = request.message_type() else {
            debug!("Dropping request without a message type option");
            return Ok(None);
        };

        match message_type {
            MessageType::Discover => self.handle_discover(request, remote_addr, interface).await,
            MessageType::Request => self.handle_request(request, remote_addr, interface).await,
            MessageType::Decline => self.handle_decline(request, remote_addr, interface).await,
            MessageType::Release => self.handle_release(request, remote_addr, interface).await,
            MessageType::Inform => self.handle_inform(request, remote_addr, interface).await,
            other => {
                debug!("Ignoring {} message", other);
                Ok(None)
            }
        }
    }

    /// Scope resolution per RFC 2131 relay rules: the candidate address
    /// is giaddr for relayed requests, ciaddr for renewals, and the
    /// arrival interface for broadcast requests.
    async fn find_scope(
        &self,
        request: &DhcpMessage,
        remote_addr: Ipv4Addr,
        interface: Ipv4Addr,
    ) -> Result<Arc<Scope>> {
        let candidate = if request.giaddr.is_unspecified() {
            if request.ciaddr.is_unspecified() {
                interface
            } else {
                if remote_addr != request.ciaddr {
                    return Err(Error::ScopeNotFound);
                }
                request.ciaddr
            }
        } else {
            if remote_addr != request.giaddr {
                return Err(Error::ScopeNotFound);
            }
            request.giaddr
        };

        for scope in self.scopes.snapshot().await {
            let config = scope.config();
            let interface_matches = config.interface_address == interface
                || config.interface_address.is_unspecified();
            if interface_matches
                && config.is_address_in_range(candidate)
                && scope.is_enabled().await
            {
                return Ok(scope);
            }
        }

        Err(Error::ScopeNotFound)
    }

    async fn handle_discover(
        &self,
        request: &DhcpMessage,
        remote_addr: Ipv4Addr,
        interface: Ipv4Addr,
    ) -> Result<Option<Reply>> {
        let scope = self.find_scope(request, remote_addr, interface).await?;

        let delay = scope.config().offer_delay_ms;
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        }

        let hostname = scope.resolve_host_name(request);
        let lease = scope
            .find_offer(&request.client_id(), &request.hardware_address(), hostname)
            .await?;

        let options = scope
            .get_options(request, interface)
            .ok_or(Error::PolicyReject)?;

        info!(
            "OFFER {} to {} (scope {})",
            lease.address,
            request.client_id(),
            scope.name().await
        );

        let message =
            DhcpMessage::create_reply(request, MessageType::Offer, lease.address, interface, options);
        Ok(Some(Reply {
            destination: reply_destination(request),
            message,
        }))
    }

    async fn handle_request(
        &self,
        request: &DhcpMessage,
        remote_addr: Ipv4Addr,
        interface: Ipv4Addr,
    ) -> Result<Option<Reply>> {
        match (request.server_identifier(), request.requested_ip()) {
            // SELECTING: the client is answering an offer.
            (Some(server_id), requested) => {
                let Some(requested) = requested else {
                    debug!("SELECTING request without a requested address");
                    return Ok(None);
                };
                if server_id != interface {
                    debug!(
                        "Client {} chose another server ({})",
                        request.client_id(),
                        server_id
                    );
                    return Ok(None);
                }

                let scope = match self.find_scope(request, remote_addr, interface).await {
                    Ok(scope) => scope,
                    Err(Error::ScopeNotFound) => return Ok(Some(self.nak(request, interface))),
                    Err(error) => return Err(error),
                };

                match scope.existing_lease_or_offer(&request.client_id()).await {
                    Some(lease) if lease.address == requested => {
                        self.commit_and_ack(&scope, request, lease, interface).await
                    }
                    _ => Ok(Some(self.nak(request, interface))),
                }
            }
            // INIT-REBOOT: verifying a remembered address.
            (None, Some(requested)) => {
                let scope = self.find_scope(request, remote_addr, interface).await?;
                match scope.existing_lease_or_offer(&request.client_id()).await {
                    Some(lease) if lease.address == requested => {
                        self.commit_and_ack(&scope, request, lease, interface).await
                    }
                    _ => Ok(Some(self.nak(request, interface))),
                }
            }
            // RENEWING / REBINDING: extending an address in use.
            (None, None) => {
                if request.ciaddr.is_unspecified() {
                    debug!("Renewal request without ciaddr");
                    return Ok(None);
                }
                let scope = self.find_scope(request, remote_addr, interface).await?;
                match scope.existing_lease_or_offer(&request.client_id()).await {
                    Some(lease) if lease.address == request.ciaddr => {
                        self.commit_and_ack(&scope, request, lease, interface).await
                    }
                    _ => Ok(Some(self.nak(request, interface))),
                }
            }
        }
    }

    async fn commit_and_ack(
        &self,
        scope: &Arc<Scope>,
        request: &DhcpMessage,
        lease: Lease,
        interface: Ipv4Addr,
    ) -> Result<Option<Reply>> {
        let hostname = scope.resolve_host_name(request);
        let committed = scope
            .commit_lease(&lease, request.requested_lease_time(), hostname)
            .await?;

        let mut options = scope
            .get_options(request, interface)
            .ok_or(Error::PolicyReject)?;

        // The lease-time option reflects the committed duration, which
        // may be shorter than the scope default.
        let committed_secs = committed.remaining_seconds() as u32;
        for option in &mut options {
            if let DhcpOption::LeaseTime(secs) = option {
                *secs = committed_secs;
            }
        }

        // A client that sent the FQDN option without the S bit set
        // registers its own forward record; we still own the PTR.
        let update_forward = request
            .client_fqdn()
            .is_none_or(|fqdn| fqdn.server_should_update());
        self.dns
            .lease_committed(scope.config(), &committed, update_forward);

        info!(
            "ACK {} to {} (lease {} seconds)",
            committed.address,
            committed.client_id,
            committed_secs
        );

        let message = DhcpMessage::create_reply(
            request,
            MessageType::Ack,
            committed.address,
            interface,
            options,
        );
        Ok(Some(Reply {
            destination: reply_destination(request),
            message,
        }))
    }

    async fn handle_decline(
        &self,
        request: &DhcpMessage,
        remote_addr: Ipv4Addr,
        interface: Ipv4Addr,
    ) -> Result<Option<Reply>> {
        let (Some(server_id), Some(declined)) =
            (request.server_identifier(), request.requested_ip())
        else {
            debug!("DECLINE missing server identifier or requested address");
            return Ok(None);
        };
        if server_id != interface {
            return Ok(None);
        }

        let scope = self.find_scope(request, remote_addr, interface).await?;
        let client_id = request.client_id();

        match scope.existing_lease_or_offer(&client_id).await {
            Some(lease) if lease.address == declined => {
                if let Some(removed) = scope.release_lease(&client_id, true).await {
                    self.dns.lease_removed(scope.config(), &removed);
                }
                info!(
                    "DECLINE of {} by {}; address withheld",
                    declined, client_id
                );
            }
            _ => debug!("DECLINE of {} did not match a lease", declined),
        }

        Ok(None)
    }

    async fn handle_release(
        &self,
        request: &DhcpMessage,
        remote_addr: Ipv4Addr,
        interface: Ipv4Addr,
    ) -> Result<Option<Reply>> {
        if request.server_identifier() != Some(interface) {
            return Ok(None);
        }

        let scope = self.find_scope(request, remote_addr, interface).await?;
        let client_id = request.client_id();

        match scope.existing_lease_or_offer(&client_id).await {
            Some(lease) if lease.address == request.ciaddr => {
                if let Some(removed) = scope.release_lease(&client_id, false).await {
                    self.dns.lease_removed(scope.config(), &removed);
                }
                info!("RELEASE of {} by {}", request.ciaddr, client_id);
            }
            _ => debug!("RELEASE of {} did not match a lease", request.ciaddr),
        }

        Ok(None)
    }

    async fn handle_inform(
        &self,
        request: &DhcpMessage,
        remote_addr: Ipv4Addr,
        interface: Ipv4Addr,
    ) -> Result<Option<Reply>> {
        let scope = self.find_scope(request, remote_addr, interface).await?;

        let options = scope
            .get_options(request, interface)
            .ok_or(Error::PolicyReject)?;

        info!("INFORM response to {}", request.client_id());

        let message = DhcpMessage::create_reply(
            request,
            MessageType::Ack,
            Ipv4Addr::UNSPECIFIED,
            interface,
            options,
        );
        Ok(Some(Reply {
            destination: reply_destination(request),
            message,
        }))
    }

    fn nak(&self, request: &DhcpMessage, interface: Ipv4Addr) -> Reply {
        let message = DhcpMessage::create_reply(
            request,
            MessageType::Nak,
            Ipv4Addr::UNSPECIFIED,
            interface,
            vec![DhcpOption::ServerIdentifier(interface)],
        );

        // NAKs are broadcast unless a relay carried the request.
        let destination = if request.giaddr.is_unspecified() {
            SocketAddrV4::new(Ipv4Addr::BROADCAST, DHCP_CLIENT_PORT)
        } else {
            SocketAddrV4::new(request.giaddr, DHCP_SERVER_PORT)
        };

        info!("NAK to {}", request.client_id());
        Reply {
            message,
            destination,
        }
    }
}

/// RFC 2131 §4.1 reply routing for OFFER and ACK.
fn reply_destination(request: &DhcpMessage) -> SocketAddrV4 {
    if !request.giaddr.is_unspecified() {
        SocketAddrV4::new(request.giaddr, DHCP_SERVER_PORT)
    } else if !request.ciaddr.is_unspecified() {
        SocketAddrV4::new(request.ciaddr, DHCP_CLIENT_PORT)
    } else {
        SocketAddrV4::new(Ipv4Addr::BROADCAST, DHCP_CLIENT_PORT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dns::{MemoryZoneStore, RecordKind};
    use crate::message::{HLEN_ETHERNET, HTYPE_ETHERNET};
    use crate::scope::{Reservation, Scope, ScopeConfig};
    use std::collections::HashMap;

    fn lab_config() -> ScopeConfig {
        ScopeConfig {
            interface_address: Ipv4Addr::new(10, 0, 0, 1),
            start: Ipv4Addr::new(10, 0, 0, 100),
            end: Ipv4Addr::new(10, 0, 0, 200),
            subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
            router: Some(Ipv4Addr::new(10, 0, 0, 1)),
            dns_servers: vec![Ipv4Addr::new(10, 0, 0, 53)],
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

    async fn engine_with(
        configs: Vec<(&str, ScopeConfig)>,
    ) -> (Engine, Arc<ScopeRegistry>, Arc<MemoryZoneStore>) {
        let registry = Arc::new(ScopeRegistry::default());
        for (name, config) in configs {
            registry
                .insert(Arc::new(Scope::new(name.to_string(), config, true)))
                .await
                .unwrap();
        }
        let store = Arc::new(MemoryZoneStore::new("ns.example.lan"));
        let zone_store: Arc<dyn crate::dns::ZoneStore> = store.clone();
        let engine = Engine::new(registry.clone(), DnsUpdater::new(Some(zone_store)));
        (engine, registry, store)
    }

    fn base_request(message_type: MessageType, mac_last: u8) -> DhcpMessage {
        let mut chaddr = [0u8; 16];
        chaddr[..6].copy_from_slice(&[0x00, 0x11, 0x22, 0x33, 0x44, mac_last]);
        DhcpMessage {
            op: BOOTREQUEST,
            htype: HTYPE_ETHERNET,
            hlen: HLEN_ETHERNET,
            hops: 0,
            xid: 0xAABBCCDD,
            secs: 0,
            flags: 0x8000,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr,
            sname: [0u8; 64],
            file: [0u8; 128],
            options: vec![DhcpOption::MessageType(message_type)],
        }
    }

    fn client_endpoint() -> SocketAddr {
        "0.0.0.0:68".parse().unwrap()
    }

    const INTERFACE: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

    #[tokio::test]
    async fn test_discover_offers_first_free_address() {
        let (engine, _, _) = engine_with(vec![("lab", lab_config())]).await;
        let discover = base_request(MessageType::Discover, 0x55);

        let reply = engine
            .handle(&discover, client_endpoint(), INTERFACE)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(reply.message.message_type(), Some(MessageType::Offer));
        assert_eq!(reply.message.yiaddr, Ipv4Addr::new(10, 0, 0, 100));
        assert_eq!(reply.message.xid, 0xAABBCCDD);
        assert_eq!(reply.message.server_identifier(), Some(INTERFACE));
        assert_eq!(reply.message.requested_lease_time(), Some(3600));
        assert_eq!(
            reply.destination,
            SocketAddrV4::new(Ipv4Addr::BROADCAST, DHCP_CLIENT_PORT)
        );
    }

    #[tokio::test]
    async fn test_selecting_request_commits_lease() {
        let (engine, registry, _) = engine_with(vec![("lab", lab_config())]).await;

        let discover = base_request(MessageType::Discover, 0x55);
        engine
            .handle(&discover, client_endpoint(), INTERFACE)
            .await
            .unwrap();

        let mut request = base_request(MessageType::Request, 0x55);
        request
            .options
            .push(DhcpOption::ServerIdentifier(INTERFACE));
        request
            .options
            .push(DhcpOption::RequestedIpAddress(Ipv4Addr::new(10, 0, 0, 100)));

        let reply = engine
            .handle(&request, client_endpoint(), INTERFACE)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(reply.message.message_type(), Some(MessageType::Ack));
        assert_eq!(reply.message.yiaddr, Ipv4Addr::new(10, 0, 0, 100));

        let scope = registry.get("lab").await.unwrap();
        let lease = scope
            .existing_lease_or_offer(&request.client_id())
            .await
            .unwrap();
        assert!(lease.remaining_seconds() > 3500);
    }

    #[tokio::test]
    async fn test_selecting_other_server_is_dropped() {
        let (engine, registry, _) = engine_with(vec![("lab", lab_config())]).await;

        let discover = base_request(MessageType::Discover, 0x55);
        engine
            .handle(&discover, client_endpoint(), INTERFACE)
            .await
            .unwrap();

        let mut request = base_request(MessageType::Request, 0x55);
        request
            .options
            .push(DhcpOption::ServerIdentifier(Ipv4Addr::new(10, 0, 0, 2)));
        request
            .options
            .push(DhcpOption::RequestedIpAddress(Ipv4Addr::new(10, 0, 0, 100)));

        let reply = engine
            .handle(&request, client_endpoint(), INTERFACE)
            .await
            .unwrap();
        assert!(reply.is_none());

        // The offer stays until it ages out on its own.
        let scope = registry.get("lab").await.unwrap();
        assert!(scope
            .existing_lease_or_offer(&request.client_id())
            .await
            .is_some());
    }

    #[tokio::test]
    async fn test_init_reboot_with_stale_address_gets_nak() {
        let (engine, _, _) = engine_with(vec![("lab", lab_config())]).await;

        let mut request = base_request(MessageType::Request, 0x77);
        request
            .options
            .push(DhcpOption::RequestedIpAddress(Ipv4Addr::new(10, 0, 0, 250)));

        let reply = engine
            .handle(&request, client_endpoint(), INTERFACE)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(reply.message.message_type(), Some(MessageType::Nak));
        assert_eq!(reply.message.yiaddr, Ipv4Addr::UNSPECIFIED);
        assert_eq!(
            reply.destination,
            SocketAddrV4::new(Ipv4Addr::BROADCAST, DHCP_CLIENT_PORT)
        );
        // NAK carries exactly the message type and server identifier.
        assert_eq!(reply.message.options.len(), 2);
    }

    #[tokio::test]
    async fn test_renewal_acks_to_ciaddr() {
        let (engine, _, _) = engine_with(vec![("lab", lab_config())]).await;

        let discover = base_request(MessageType::Discover, 0x55);
        engine
            .handle(&discover, client_endpoint(), INTERFACE)
            .await
            .unwrap();

        let mut selecting = base_request(MessageType::Request, 0x55);
        selecting
            .options
            .push(DhcpOption::ServerIdentifier(INTERFACE));
        selecting
            .options
            .push(DhcpOption::RequestedIpAddress(Ipv4Addr::new(10, 0, 0, 100)));
        engine
            .handle(&selecting, client_endpoint(), INTERFACE)
            .await
            .unwrap();

        let mut renewal = base_request(MessageType::Request, 0x55);
        renewal.ciaddr = Ipv4Addr::new(10, 0, 0, 100);
        renewal.flags = 0;

        let remote: SocketAddr = "10.0.0.100:68".parse().unwrap();
        let reply = engine.handle(&renewal, remote, INTERFACE).await.unwrap().unwrap();

        assert_eq!(reply.message.message_type(), Some(MessageType::Ack));
        assert_eq!(
            reply.destination,
            SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 100), DHCP_CLIENT_PORT)
        );
    }

    #[tokio::test]
    async fn test_renewal_of_unknown_client_gets_nak() {
        let (engine, _, _) = engine_with(vec![("lab", lab_config())]).await;

        let mut renewal = base_request(MessageType::Request, 0x99);
        renewal.ciaddr = Ipv4Addr::new(10, 0, 0, 140);

        let remote: SocketAddr = "10.0.0.140:68".parse().unwrap();
        let reply = engine.handle(&renewal, remote, INTERFACE).await.unwrap().unwrap();
        assert_eq!(reply.message.message_type(), Some(MessageType::Nak));
    }

    #[tokio::test]
    async fn test_relayed_discover_unicasts_to_relay() {
        let relay_config = ScopeConfig {
            interface_address: Ipv4Addr::new(192, 168, 5, 1),
            start: Ipv4Addr::new(192, 168, 5, 100),
            end: Ipv4Addr::new(192, 168, 5, 200),
            router: Some(Ipv4Addr::new(192, 168, 5, 1)),
            ..lab_config()
        };
        let (engine, _, _) = engine_with(vec![("branch", relay_config)]).await;

        let mut discover = base_request(MessageType::Discover, 0x55);
        discover.giaddr = Ipv4Addr::new(192, 168, 5, 1);

        let remote: SocketAddr = "192.168.5.1:67".parse().unwrap();
        let interface = Ipv4Addr::new(192, 168, 5, 1);
        let reply = engine.handle(&discover, remote, interface).await.unwrap().unwrap();

        assert_eq!(reply.message.message_type(), Some(MessageType::Offer));
        assert_eq!(reply.message.yiaddr, Ipv4Addr::new(192, 168, 5, 100));
        assert_eq!(
            reply.destination,
            SocketAddrV4::new(Ipv4Addr::new(192, 168, 5, 1), DHCP_SERVER_PORT)
        );
    }

    #[tokio::test]
    async fn test_decline_withholds_address_and_clears_dns() {
        let (engine, registry, store) = engine_with(vec![("lab", lab_config())]).await;

        let mut discover = base_request(MessageType::Discover, 0x55);
        discover
            .options
            .push(DhcpOption::HostName("laptop-7".to_string()));
        engine
            .handle(&discover, client_endpoint(), INTERFACE)
            .await
            .unwrap();

        let mut request = base_request(MessageType::Request, 0x55);
        request
            .options
            .push(DhcpOption::ServerIdentifier(INTERFACE));
        request
            .options
            .push(DhcpOption::RequestedIpAddress(Ipv4Addr::new(10, 0, 0, 100)));
        request
            .options
            .push(DhcpOption::HostName("laptop-7".to_string()));
        engine
            .handle(&request, client_endpoint(), INTERFACE)
            .await
            .unwrap();

        assert!(store
            .record("example.lan", "laptop-7.example.lan", RecordKind::A)
            .is_some());

        let mut decline = base_request(MessageType::Decline, 0x55);
        decline
            .options
            .push(DhcpOption::ServerIdentifier(INTERFACE));
        decline
            .options
            .push(DhcpOption::RequestedIpAddress(Ipv4Addr::new(10, 0, 0, 100)));

        let reply = engine
            .handle(&decline, client_endpoint(), INTERFACE)
            .await
            .unwrap();
        assert!(reply.is_none());

        let scope = registry.get("lab").await.unwrap();
        assert!(scope
            .existing_lease_or_offer(&decline.client_id())
            .await
            .is_none());
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

        // A new client skips the declined address.
        let next_discover = base_request(MessageType::Discover, 0x66);
        let reply = engine
            .handle(&next_discover, client_endpoint(), INTERFACE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.message.yiaddr, Ipv4Addr::new(10, 0, 0, 101));
    }

    #[tokio::test]
    async fn test_release_frees_lease() {
        let (engine, registry, _) = engine_with(vec![("lab", lab_config())]).await;

        let discover = base_request(MessageType::Discover, 0x55);
        engine
            .handle(&discover, client_endpoint(), INTERFACE)
            .await
            .unwrap();

        let mut request = base_request(MessageType::Request, 0x55);
        request
            .options
            .push(DhcpOption::ServerIdentifier(INTERFACE));
        request
            .options
            .push(DhcpOption::RequestedIpAddress(Ipv4Addr::new(10, 0, 0, 100)));
        engine
            .handle(&request, client_endpoint(), INTERFACE)
            .await
            .unwrap();

        let mut release = base_request(MessageType::Release, 0x55);
        release.ciaddr = Ipv4Addr::new(10, 0, 0, 100);
        release
            .options
            .push(DhcpOption::ServerIdentifier(INTERFACE));

        let remote: SocketAddr = "10.0.0.100:68".parse().unwrap();
        let reply = engine.handle(&release, remote, INTERFACE).await.unwrap();
        assert!(reply.is_none());

        let scope = registry.get("lab").await.unwrap();
        assert!(scope
            .existing_lease_or_offer(&release.client_id())
            .await
            .is_none());

        // Released (not declined) addresses return to the pool.
        let next = base_request(MessageType::Discover, 0x66);
        let reply = engine
            .handle(&next, client_endpoint(), INTERFACE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.message.yiaddr, Ipv4Addr::new(10, 0, 0, 100));
    }

    #[tokio::test]
    async fn test_inform_acks_without_address() {
        let (engine, _, _) = engine_with(vec![("lab", lab_config())]).await;

        let mut inform = base_request(MessageType::Inform, 0x55);
        inform.ciaddr = Ipv4Addr::new(10, 0, 0, 30);
        inform.flags = 0;

        let remote: SocketAddr = "10.0.0.30:68".parse().unwrap();
        let reply = engine.handle(&inform, remote, INTERFACE).await.unwrap().unwrap();

        assert_eq!(reply.message.message_type(), Some(MessageType::Ack));
        assert_eq!(reply.message.yiaddr, Ipv4Addr::UNSPECIFIED);
        assert_eq!(
            reply.destination,
            SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 30), DHCP_CLIENT_PORT)
        );
    }

    #[tokio::test]
    async fn test_reservation_offered_to_its_client() {
        let mut config = lab_config();
        let mut chaddr = [0u8; 16];
        chaddr[..6].copy_from_slice(&[0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
        let client = crate::lease::ClientId::from_hardware(1, &chaddr[..6]);
        config.reservations.insert(
            client,
            Reservation {
                address: Ipv4Addr::new(10, 0, 0, 180),
                hostname: None,
            },
        );
        let (engine, _, _) = engine_with(vec![("lab", config)]).await;

        let discover = base_request(MessageType::Discover, 0x55);
        let reply = engine
            .handle(&discover, client_endpoint(), INTERFACE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.message.yiaddr, Ipv4Addr::new(10, 0, 0, 180));
    }

    #[tokio::test]
    async fn test_no_matching_scope_drops_discover() {
        let (engine, _, _) = engine_with(vec![("lab", lab_config())]).await;

        let discover = base_request(MessageType::Discover, 0x55);
        let result = engine
            .handle(&discover, client_endpoint(), Ipv4Addr::new(172, 16, 0, 1))
            .await;
        assert!(matches!(result, Err(Error::ScopeNotFound)));
    }

    #[tokio::test]
    async fn test_non_request_op_ignored() {
        let (engine, _, _) = engine_with(vec![("lab", lab_config())]).await;

        let mut bogus = base_request(MessageType::Discover, 0x55);
        bogus.op = 2;
        let reply = engine
            .handle(&bogus, client_endpoint(), INTERFACE)
            .await
            .unwrap();
        assert!(reply.is_none());
    }
}
