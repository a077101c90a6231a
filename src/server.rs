//! The server façade: scope registry, listeners, and maintenance.
//!
//! Scope lifecycle (add, enable, disable, rename, delete) and the
//! listener sockets live here. Each distinct interface address gets one
//! reference-counted UDP socket; the refcount shares the mutex with the
//! socket handles, so activation and deactivation cannot race it.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::dns::{DnsUpdater, ZoneStore};
use crate::engine::{DHCP_CLIENT_PORT, DHCP_SERVER_PORT, Engine};
use crate::error::{Error, Result};
use crate::message::DhcpMessage;
use crate::scope::{Scope, ScopeConfig};
use crate::scopefile;

/// Inbound datagrams never legitimately exceed this.
const RECV_BUFFER_SIZE: usize = 576;

const MAINTENANCE_PERIOD_SECS: u64 = 10;

const RATE_LIMIT_WINDOW_SECS: u64 = 1;
const RATE_LIMIT_MAX_REQUESTS: usize = 10;
const RATE_LIMIT_CLEANUP_THRESHOLD: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum ServerState {
    Stopped = 0,
    Starting = 1,
    Running = 2,
    Stopping = 3,
}

/// Name-keyed scope map with atomic insert-if-absent and snapshot
/// iteration.
#[derive(Default)]
pub struct ScopeRegistry {
    scopes: RwLock<HashMap<String, Arc<Scope>>>,
}

impl ScopeRegistry {
    /// Rejects duplicates by name and by range identity.
    pub async fn insert(&self, scope: Arc<Scope>) -> Result<()> {
        let name = scope.name().await;
        let mut scopes = self.scopes.write().await;

        if scopes.contains_key(&name) {
            return Err(Error::DuplicateScope(name));
        }
        for existing in scopes.values() {
            if existing.config().same_range(scope.config()) {
                return Err(Error::DuplicateScope(name));
            }
        }

        scopes.insert(name, scope);
        Ok(())
    }

    pub async fn get(&self, name: &str) -> Option<Arc<Scope>> {
        self.scopes.read().await.get(name).cloned()
    }

    pub async fn remove(&self, name: &str) -> Option<Arc<Scope>> {
        self.scopes.write().await.remove(name)
    }

    /// Errors when the source is missing; conflicts when the target
    /// already exists.
    pub async fn rename(&self, name: &str, new_name: &str) -> Result<Arc<Scope>> {
        let mut scopes = self.scopes.write().await;

        if scopes.contains_key(new_name) {
            return Err(Error::DuplicateScope(new_name.to_string()));
        }
        let scope = scopes
            .remove(name)
            .ok_or_else(|| Error::UnknownScope(name.to_string()))?;

        scope.set_name(new_name.to_string()).await;
        scopes.insert(new_name.to_string(), scope.clone());
        Ok(scope)
    }

    pub async fn snapshot(&self) -> Vec<Arc<Scope>> {
        self.scopes.read().await.values().cloned().collect()
    }

    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.scopes.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

struct Listener {
    refcount: usize,
    task: JoinHandle<()>,
}

type RateLimiter = Arc<Mutex<HashMap<String, Vec<Instant>>>>;

pub struct DhcpServer {
    config: ServerConfig,
    scopes: Arc<ScopeRegistry>,
    engine: Arc<Engine>,
    dns: DnsUpdater,
    listeners: Mutex<HashMap<Ipv4Addr, Listener>>,
    state: Arc<AtomicU8>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
    save_watermark: Arc<Mutex<DateTime<Utc>>>,
    rate_limiter: RateLimiter,
}

impl DhcpServer {
    /// Creates the config directory when absent and loads every
    /// persisted scope from it.
    pub async fn new(
        config: ServerConfig,
        zone_store: Option<Arc<dyn ZoneStore>>,
    ) -> Result<Self> {
        tokio::fs::create_dir_all(&config.config_dir).await?;

        let scopes = Arc::new(ScopeRegistry::default());
        for file in scopefile::load_dir(&config.config_dir).await? {
            let name = file.name.clone();
            scopes.insert(Arc::new(file.into_scope())).await?;
            debug!("Loaded scope {}", name);
        }

        let dns = DnsUpdater::new(if config.dns_updates_enabled {
            zone_store
        } else {
            None
        });
        let engine = Arc::new(Engine::new(scopes.clone(), dns.clone()));

        Ok(Self {
            config,
            scopes,
            engine,
            dns,
            listeners: Mutex::new(HashMap::new()),
            state: Arc::new(AtomicU8::new(ServerState::Stopped as u8)),
            maintenance: Mutex::new(None),
            save_watermark: Arc::new(Mutex::new(Utc::now())),
            rate_limiter: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn scopes(&self) -> &Arc<ScopeRegistry> {
        &self.scopes
    }

    fn is_running(&self) -> bool {
        self.state.load(Ordering::SeqCst) == ServerState::Running as u8
    }

    /// Binds a listener for every enabled scope and starts maintenance.
    pub async fn start(&self) -> Result<()> {
        self.state
            .compare_exchange(
                ServerState::Stopped as u8,
                ServerState::Starting as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map_err(|_| Error::ServerState("server is already running".to_string()))?;

        let mut activated = Vec::new();
        for scope in self.scopes.snapshot().await {
            if scope.is_enabled().await {
                if let Err(error) = self.activate_scope(&scope).await {
                    for scope in &activated {
                        self.deactivate_scope(scope).await;
                    }
                    self.state
                        .store(ServerState::Stopped as u8, Ordering::SeqCst);
                    return Err(error);
                }
                activated.push(scope);
            }
        }

        let mut maintenance = self.maintenance.lock().await;
        *maintenance = Some(self.spawn_maintenance());

        self.state
            .store(ServerState::Running as u8, Ordering::SeqCst);
        info!("DHCP server running with {} scope(s)", activated.len());
        Ok(())
    }

    /// Halts maintenance, tears down listeners, and saves dirty scopes.
    pub async fn stop(&self) -> Result<()> {
        self.state
            .compare_exchange(
                ServerState::Running as u8,
                ServerState::Stopping as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map_err(|_| Error::ServerState("server is not running".to_string()))?;

        if let Some(task) = self.maintenance.lock().await.take() {
            task.abort();
        }

        let mut listeners = self.listeners.lock().await;
        for (address, listener) in listeners.drain() {
            listener.task.abort();
            debug!("Listener on {} closed", address);
        }
        drop(listeners);

        self.save_modified().await;

        self.state
            .store(ServerState::Stopped as u8, Ordering::SeqCst);
        info!("DHCP server stopped");
        Ok(())
    }

    pub async fn add_scope(
        &self,
        name: &str,
        scope_config: ScopeConfig,
        enabled: bool,
    ) -> Result<()> {
        scope_config.validate()?;

        let scope = Arc::new(Scope::new(name.to_string(), scope_config, enabled));
        self.scopes.insert(scope.clone()).await?;
        scopefile::save_scope(&self.config.config_dir, &scope).await?;

        if enabled && self.is_running() {
            self.activate_scope(&scope).await?;
        }

        info!("Scope {} added", name);
        Ok(())
    }

    pub async fn get_scope(&self, name: &str) -> Option<Arc<Scope>> {
        self.scopes.get(name).await
    }

    pub async fn rename_scope(&self, name: &str, new_name: &str) -> Result<()> {
        let scope = self.scopes.rename(name, new_name).await?;
        scopefile::save_scope(&self.config.config_dir, &scope).await?;
        scopefile::delete_scope_file(&self.config.config_dir, name).await?;
        info!("Scope {} renamed to {}", name, new_name);
        Ok(())
    }

    pub async fn delete_scope(&self, name: &str) -> Result<()> {
        let scope = self
            .scopes
            .get(name)
            .await
            .ok_or_else(|| Error::UnknownScope(name.to_string()))?;

        if scope.is_enabled().await && self.is_running() {
            self.deactivate_scope(&scope).await;
        }

        self.scopes.remove(name).await;
        scopefile::delete_scope_file(&self.config.config_dir, name).await?;
        info!("Scope {} deleted", name);
        Ok(())
    }

    /// Activates then persists.
    pub async fn enable_scope(&self, name: &str) -> Result<()> {
        let scope = self
            .scopes
            .get(name)
            .await
            .ok_or_else(|| Error::UnknownScope(name.to_string()))?;

        if !scope.is_enabled().await {
            scope.set_enabled(true).await;
            if self.is_running() {
                self.activate_scope(&scope).await?;
            }
        }
        scopefile::save_scope(&self.config.config_dir, &scope).await
    }

    /// Deactivates then persists.
    pub async fn disable_scope(&self, name: &str) -> Result<()> {
        let scope = self
            .scopes
            .get(name)
            .await
            .ok_or_else(|| Error::UnknownScope(name.to_string()))?;

        if scope.is_enabled().await {
            if self.is_running() {
                self.deactivate_scope(&scope).await;
            }
            scope.set_enabled(false).await;
        }
        scopefile::save_scope(&self.config.config_dir, &scope).await
    }

    /// Active address-to-hostname view across every scope.
    pub async fn get_address_client_map(&self) -> HashMap<String, String> {
        let mut map = HashMap::new();
        for scope in self.scopes.snapshot().await {
            for (address, client) in scope.address_client_pairs().await {
                map.insert(address.to_string(), client);
            }
        }
        map
    }

    async fn activate_scope(&self, scope: &Arc<Scope>) -> Result<()> {
        let address = scope.config().interface_address;
        let mut listeners = self.listeners.lock().await;

        if let Some(listener) = listeners.get_mut(&address) {
            listener.refcount += 1;
            return Ok(());
        }

        let socket = Arc::new(create_socket(address)?);
        let task = tokio::spawn(receive_loop(
            socket,
            address,
            self.engine.clone(),
            self.state.clone(),
            self.rate_limiter.clone(),
        ));

        listeners.insert(address, Listener { refcount: 1, task });
        info!("Listening on {}:{}", address, DHCP_SERVER_PORT);
        Ok(())
    }

    async fn deactivate_scope(&self, scope: &Arc<Scope>) {
        let address = scope.config().interface_address;
        let mut listeners = self.listeners.lock().await;

        match listeners.get_mut(&address) {
            Some(listener) if listener.refcount > 1 => listener.refcount -= 1,
            Some(_) => {
                if let Some(listener) = listeners.remove(&address) {
                    listener.task.abort();
                    info!("Listener on {} closed", address);
                }
            }
            None => {}
        }
    }

    fn spawn_maintenance(&self) -> JoinHandle<()> {
        let scopes = self.scopes.clone();
        let dns = self.dns.clone();
        let config_dir = self.config.config_dir.clone();
        let watermark = self.save_watermark.clone();

        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(MAINTENANCE_PERIOD_SECS));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                maintenance_tick(&scopes, &dns, &config_dir, &watermark).await;
            }
        })
    }

    /// Removes expired offers and leases across every scope, tearing
    /// down their DNS records, then persists the modified scopes.
    ///
    /// The maintenance loop does the same on its own tick; this is the
    /// administrator-driven variant.
    pub async fn cleanup_expired_leases(&self) -> usize {
        let mut count = 0;
        for scope in self.scopes.snapshot().await {
            scope.remove_expired_offers().await;
            for lease in scope.remove_expired_leases().await {
                self.dns.lease_removed(scope.config(), &lease);
                count += 1;
            }
        }
        self.save_modified().await;
        count
    }

    /// Persists every scope modified since the last save watermark.
    pub async fn save_modified(&self) {
        maintenance_persist(
            &self.scopes,
            &self.config.config_dir,
            &self.save_watermark,
        )
        .await;
    }
}

async fn maintenance_tick(
    scopes: &Arc<ScopeRegistry>,
    dns: &DnsUpdater,
    config_dir: &std::path::Path,
    watermark: &Arc<Mutex<DateTime<Utc>>>,
) {
    for scope in scopes.snapshot().await {
        scope.remove_expired_offers().await;
        for lease in scope.remove_expired_leases().await {
            info!(
                "Lease for {} ({}) expired",
                lease.client_id, lease.address
            );
            dns.lease_removed(scope.config(), &lease);
        }
    }

    maintenance_persist(scopes, config_dir, watermark).await;
}

async fn maintenance_persist(
    scopes: &Arc<ScopeRegistry>,
    config_dir: &std::path::Path,
    watermark: &Arc<Mutex<DateTime<Utc>>>,
) {
    let scan_start = Utc::now();
    let mut watermark = watermark.lock().await;
    let mut all_saved = true;

    for scope in scopes.snapshot().await {
        if scope.last_modified().await <= *watermark {
            continue;
        }
        if let Err(error) = scopefile::save_scope(config_dir, &scope).await {
            // The scope stays dirty and is retried next tick.
            warn!(
                "Failed to persist scope {}: {}",
                scope.name().await,
                error
            );
            all_saved = false;
        }
    }

    if all_saved {
        *watermark = scan_start;
    }
}

/// Broadcast-capable UDP socket bound to `(address, 67)`.
fn create_socket(address: Ipv4Addr) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|error| Error::Socket(format!("Failed to create socket: {}", error)))?;

    socket
        .set_reuse_address(true)
        .map_err(|error| Error::Socket(format!("Failed to set SO_REUSEADDR: {}", error)))?;

    socket
        .set_broadcast(true)
        .map_err(|error| Error::Socket(format!("Failed to set SO_BROADCAST: {}", error)))?;

    socket
        .set_nonblocking(true)
        .map_err(|error| Error::Socket(format!("Failed to set non-blocking: {}", error)))?;

    let bind_addr = SocketAddrV4::new(address, DHCP_SERVER_PORT);
    socket
        .bind(&bind_addr.into())
        .map_err(|error| Error::Socket(format!("Failed to bind to {}: {}", bind_addr, error)))?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket)
        .map_err(|error| Error::Socket(format!("Failed to convert to tokio socket: {}", error)))
}

/// True for receive errors a DHCP listener should shrug off, including
/// ICMP port-unreachable feedback surfaced as connection resets.
fn is_transient(error: &std::io::Error) -> bool {
    matches!(
        error.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::HostUnreachable
            | std::io::ErrorKind::WouldBlock
    )
}

async fn receive_loop(
    socket: Arc<UdpSocket>,
    interface: Ipv4Addr,
    engine: Arc<Engine>,
    state: Arc<AtomicU8>,
    rate_limiter: RateLimiter,
) {
    let mut buffer = [0u8; RECV_BUFFER_SIZE];

    loop {
        match socket.recv_from(&mut buffer).await {
            Ok((size, source)) => {
                if state.load(Ordering::SeqCst) != ServerState::Running as u8
                    && state.load(Ordering::SeqCst) != ServerState::Starting as u8
                {
                    break;
                }

                if source.port() != DHCP_SERVER_PORT && source.port() != DHCP_CLIENT_PORT {
                    debug!("Ignoring datagram from unexpected port {}", source);
                    continue;
                }

                let data = buffer[..size].to_vec();
                let socket = socket.clone();
                let engine = engine.clone();
                let rate_limiter = rate_limiter.clone();

                tokio::spawn(async move {
                    handle_datagram(&engine, &socket, &data, source, interface, &rate_limiter)
                        .await;
                });
            }
            Err(error) if is_transient(&error) => {
                debug!("Transient receive error on {}: {}", interface, error);
            }
            Err(error) => {
                error!("Receive failed on {}: {}", interface, error);
                break;
            }
        }
    }
}

async fn is_rate_limited(rate_limiter: &RateLimiter, key: &str) -> bool {
    let mut limiter = rate_limiter.lock().await;
    let now = Instant::now();
    let window = Duration::from_secs(RATE_LIMIT_WINDOW_SECS);

    if limiter.len() > RATE_LIMIT_CLEANUP_THRESHOLD {
        limiter.retain(|_, timestamps| {
            timestamps.retain(|t| now.duration_since(*t) < window);
            !timestamps.is_empty()
        });
    }

    let timestamps = limiter.entry(key.to_string()).or_default();
    timestamps.retain(|t| now.duration_since(*t) < window);

    if timestamps.len() >= RATE_LIMIT_MAX_REQUESTS {
        return true;
    }

    timestamps.push(now);
    false
}

async fn handle_datagram(
    engine: &Engine,
    socket: &UdpSocket,
    data: &[u8],
    source: SocketAddr,
    interface: Ipv4Addr,
    rate_limiter: &RateLimiter,
) {
    let request = match DhcpMessage::parse(data) {
        Ok(request) => request,
        Err(error) => {
            debug!("Dropping datagram from {}: {}", source, error);
            return;
        }
    };

    let client_id = request.client_id();
    if is_rate_limited(rate_limiter, &client_id.to_string()).await {
        warn!("Rate limited: {} from {}", client_id, source);
        return;
    }

    match engine.handle(&request, source, interface).await {
        Ok(Some(reply)) => {
            let encoded = reply.message.encode();
            if let Err(error) = socket
                .send_to(&encoded, SocketAddr::V4(reply.destination))
                .await
            {
                warn!("Failed to send reply to {}: {}", reply.destination, error);
            }
        }
        Ok(None) => {}
        Err(Error::ScopeNotFound) => {
            debug!("No scope for request from {} on {}", source, interface);
        }
        Err(Error::PolicyReject) => {
            debug!("Policy rejected client {} on {}", client_id, interface);
        }
        Err(Error::AddressUnavailable(scope)) => {
            warn!("Scope {} exhausted; no offer for {}", scope, client_id);
        }
        Err(error) => {
            warn!("Error handling request from {}: {}", source, error);
        }
    }
}
