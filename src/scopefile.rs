//! Binary scope persistence.
//!
//! Each scope lives in `<config_dir>/<name>.scope`, a little-endian
//! blob whose field order is fixed so existing deployments round-trip
//! without loss. The declined bad set and pending offers are runtime
//! state and are never written.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone, Utc};
use tokio::fs;

use crate::error::{Error, Result};
use crate::lease::{ClientId, HardwareAddress, Lease, LeaseKind};
use crate::scope::{Reservation, Scope, ScopeConfig};

pub const SCOPE_FILE_EXTENSION: &str = "scope";

/// Flat persisted form of a scope.
#[derive(Debug, Clone)]
pub struct ScopeFile {
    pub name: String,
    pub enabled: bool,
    pub config: ScopeConfig,
    pub leases: Vec<Lease>,
}

impl ScopeFile {
    pub async fn from_scope(scope: &Scope) -> Self {
        Self {
            name: scope.name().await,
            enabled: scope.is_enabled().await,
            config: scope.config().clone(),
            leases: scope.lease_snapshot().await,
        }
    }

    pub fn into_scope(self) -> Scope {
        Scope::from_persisted(self.name, self.config, self.enabled, self.leases)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(256);

        write_string(&mut out, &self.name);
        out.push(self.enabled as u8);

        out.extend_from_slice(&self.config.start.octets());
        out.extend_from_slice(&self.config.end.octets());
        out.extend_from_slice(&self.config.subnet_mask.octets());
        out.extend_from_slice(
            &self
                .config
                .router
                .unwrap_or(Ipv4Addr::UNSPECIFIED)
                .octets(),
        );
        out.extend_from_slice(&self.config.interface_address.octets());

        out.extend_from_slice(&self.config.lease_time_secs.to_le_bytes());
        out.extend_from_slice(&self.config.offer_delay_ms.to_le_bytes());
        out.push((self.config.ping_timeout_ms > 0) as u8);
        out.extend_from_slice(&self.config.ping_timeout_ms.to_le_bytes());

        write_string(&mut out, self.config.domain_name.as_deref().unwrap_or(""));
        out.extend_from_slice(&self.config.dns_ttl.to_le_bytes());

        write_addr_list(&mut out, &self.config.dns_servers);
        write_addr_list(&mut out, &self.config.ntp_servers);

        out.extend_from_slice(&(self.config.exclusions.len() as u32).to_le_bytes());
        for (from, to) in &self.config.exclusions {
            out.extend_from_slice(&from.octets());
            out.extend_from_slice(&to.octets());
        }

        out.extend_from_slice(&(self.config.reservations.len() as u32).to_le_bytes());
        let mut reservations: Vec<_> = self.config.reservations.iter().collect();
        reservations.sort_by(|(a, _), (b, _)| a.cmp(b));
        for (client_id, reservation) in reservations {
            write_bytes(&mut out, client_id.as_bytes());
            out.extend_from_slice(&reservation.address.octets());
            write_optional_string(&mut out, reservation.hostname.as_deref());
        }

        out.extend_from_slice(&(self.leases.len() as u32).to_le_bytes());
        for lease in &self.leases {
            write_bytes(&mut out, lease.client_id.as_bytes());
            out.push(lease.hardware.htype);
            write_bytes(&mut out, &lease.hardware.bytes);
            out.extend_from_slice(&lease.address.octets());
            write_optional_string(&mut out, lease.hostname.as_deref());
            out.extend_from_slice(&lease.obtained_at.timestamp().to_le_bytes());
            out.extend_from_slice(&lease.expires_at.timestamp().to_le_bytes());
            out.push(lease.kind as u8);
        }

        out
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);

        let name = reader.take_string()?;
        let enabled = reader.take_u8()? != 0;

        let start = reader.take_addr()?;
        let end = reader.take_addr()?;
        let subnet_mask = reader.take_addr()?;
        let router = reader.take_addr()?;
        let interface_address = reader.take_addr()?;

        let lease_time_secs = reader.take_u32()?;
        let offer_delay_ms = reader.take_u32()?;
        let ping_enabled = reader.take_u8()? != 0;
        let ping_timeout_ms = reader.take_u16()?;

        let domain = reader.take_string()?;
        let dns_ttl = reader.take_u32()?;

        let dns_servers = reader.take_addr_list()?;
        let ntp_servers = reader.take_addr_list()?;

        let exclusion_count = reader.take_u32()?;
        let mut exclusions = Vec::with_capacity(exclusion_count as usize);
        for _ in 0..exclusion_count {
            let from = reader.take_addr()?;
            let to = reader.take_addr()?;
            exclusions.push((from, to));
        }

        let reservation_count = reader.take_u32()?;
        let mut reservations = std::collections::HashMap::new();
        for _ in 0..reservation_count {
            let client_id = ClientId::from_option(reader.take_bytes()?);
            let address = reader.take_addr()?;
            let hostname = reader.take_optional_string()?;
            reservations.insert(client_id, Reservation { address, hostname });
        }

        let lease_count = reader.take_u32()?;
        let mut leases = Vec::with_capacity(lease_count as usize);
        for _ in 0..lease_count {
            let client_id = ClientId::from_option(reader.take_bytes()?);
            let htype = reader.take_u8()?;
            let hardware_bytes = reader.take_bytes()?;
            let address = reader.take_addr()?;
            let hostname = reader.take_optional_string()?;
            let obtained_at = reader.take_timestamp()?;
            let expires_at = reader.take_timestamp()?;
            let kind = LeaseKind::try_from(reader.take_u8()?)
                .map_err(|value| Error::Persistence(format!("unknown lease kind {}", value)))?;

            leases.push(Lease {
                client_id,
                hardware: HardwareAddress::new(htype, hardware_bytes),
                address,
                hostname,
                obtained_at,
                expires_at,
                kind,
            });
        }

        Ok(Self {
            name,
            enabled,
            config: ScopeConfig {
                interface_address,
                start,
                end,
                subnet_mask,
                router: (router != Ipv4Addr::UNSPECIFIED).then_some(router),
                dns_servers,
                ntp_servers,
                domain_name: (!domain.is_empty()).then_some(domain),
                dns_ttl,
                lease_time_secs,
                offer_delay_ms,
                ping_timeout_ms: if ping_enabled { ping_timeout_ms } else { 0 },
                exclusions,
                reservations,
                allowed_vendor_classes: Vec::new(),
            },
            leases,
        })
    }
}

fn write_string(out: &mut Vec<u8>, value: &str) {
    let bytes = value.as_bytes();
    out.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
    out.extend_from_slice(bytes);
}

fn write_optional_string(out: &mut Vec<u8>, value: Option<&str>) {
    match value {
        Some(value) => {
            out.push(1);
            write_string(out, value);
        }
        None => out.push(0),
    }
}

fn write_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.push(bytes.len() as u8);
    out.extend_from_slice(bytes);
}

fn write_addr_list(out: &mut Vec<u8>, addrs: &[Ipv4Addr]) {
    out.push(addrs.len() as u8);
    for addr in addrs {
        out.extend_from_slice(&addr.octets());
    }
}

struct Reader<'a> {
    data: &'a [u8],
    index: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, index: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.index + len > self.data.len() {
            return Err(Error::Persistence("scope file truncated".to_string()));
        }
        let slice = &self.data[self.index..self.index + len];
        self.index += len;
        Ok(slice)
    }

    fn take_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn take_u16(&mut self) -> Result<u16> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn take_u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn take_i64(&mut self) -> Result<i64> {
        let bytes = self.take(8)?;
        let mut buffer = [0u8; 8];
        buffer.copy_from_slice(bytes);
        Ok(i64::from_le_bytes(buffer))
    }

    fn take_addr(&mut self) -> Result<Ipv4Addr> {
        let bytes = self.take(4)?;
        Ok(Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]))
    }

    fn take_string(&mut self) -> Result<String> {
        let len = self.take_u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::Persistence("scope file string is not UTF-8".to_string()))
    }

    fn take_optional_string(&mut self) -> Result<Option<String>> {
        if self.take_u8()? != 0 {
            Ok(Some(self.take_string()?))
        } else {
            Ok(None)
        }
    }

    fn take_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.take_u8()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn take_addr_list(&mut self) -> Result<Vec<Ipv4Addr>> {
        let count = self.take_u8()? as usize;
        let mut addrs = Vec::with_capacity(count);
        for _ in 0..count {
            addrs.push(self.take_addr()?);
        }
        Ok(addrs)
    }

    fn take_timestamp(&mut self) -> Result<DateTime<Utc>> {
        let secs = self.take_i64()?;
        Utc.timestamp_opt(secs, 0)
            .single()
            .ok_or_else(|| Error::Persistence(format!("invalid timestamp {}", secs)))
    }
}

pub fn scope_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}.{}", name, SCOPE_FILE_EXTENSION))
}

/// Writes the scope file via a temporary neighbor so a crashed save
/// never leaves a half-written scope behind.
pub async fn save_scope(dir: &Path, scope: &Scope) -> Result<()> {
    let file = ScopeFile::from_scope(scope).await;
    let path = scope_path(dir, &file.name);
    let tmp = dir.join(format!("{}.{}.tmp", file.name, SCOPE_FILE_EXTENSION));

    fs::write(&tmp, file.encode()).await?;
    fs::rename(&tmp, &path).await?;
    Ok(())
}

pub async fn delete_scope_file(dir: &Path, name: &str) -> Result<()> {
    let path = scope_path(dir, name);
    match fs::remove_file(&path).await {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(error.into()),
    }
}

/// Loads every `*.scope` file under `dir`.
pub async fn load_dir(dir: &Path) -> Result<Vec<ScopeFile>> {
    let mut files = Vec::new();
    let mut entries = fs::read_dir(dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some(SCOPE_FILE_EXTENSION) {
            continue;
        }
        let data = fs::read(&path).await?;
        let file = ScopeFile::decode(&data).map_err(|error| {
            Error::Persistence(format!("{}: {}", path.display(), error))
        })?;
        files.push(file);
    }

    files.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;
    use std::collections::HashMap;

    fn test_file() -> ScopeFile {
        let client = ClientId::from_hardware(1, &[0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
        let reserved_client = ClientId::from_hardware(1, &[0x00, 0x11, 0x22, 0x33, 0x44, 0x66]);

        let now = Utc.timestamp_opt(1_750_000_000, 0).unwrap();
        let lease = Lease {
            client_id: client.clone(),
            hardware: HardwareAddress::new(1, vec![0x00, 0x11, 0x22, 0x33, 0x44, 0x55]),
            address: Ipv4Addr::new(10, 0, 0, 100),
            hostname: Some("laptop-7.example.lan".to_string()),
            obtained_at: now,
            expires_at: now + TimeDelta::seconds(3600),
            kind: LeaseKind::Dynamic,
        };

        let mut reservations = HashMap::new();
        reservations.insert(
            reserved_client,
            Reservation {
                address: Ipv4Addr::new(10, 0, 0, 150),
                hostname: Some("printer".to_string()),
            },
        );

        ScopeFile {
            name: "lab".to_string(),
            enabled: true,
            config: ScopeConfig {
                interface_address: Ipv4Addr::new(10, 0, 0, 1),
                start: Ipv4Addr::new(10, 0, 0, 100),
                end: Ipv4Addr::new(10, 0, 0, 200),
                subnet_mask: Ipv4Addr::new(255, 255, 255, 0),
                router: Some(Ipv4Addr::new(10, 0, 0, 1)),
                dns_servers: vec![Ipv4Addr::new(10, 0, 0, 53)],
                ntp_servers: vec![Ipv4Addr::new(10, 0, 0, 123)],
                domain_name: Some("example.lan".to_string()),
                dns_ttl: 900,
                lease_time_secs: 3600,
                offer_delay_ms: 0,
                ping_timeout_ms: 300,
                exclusions: vec![(Ipv4Addr::new(10, 0, 0, 110), Ipv4Addr::new(10, 0, 0, 119))],
                reservations,
                allowed_vendor_classes: Vec::new(),
            },
            leases: vec![lease],
        }
    }

    #[test]
    fn test_roundtrip() {
        let original = test_file();
        let decoded = ScopeFile::decode(&original.encode()).unwrap();

        assert_eq!(decoded.name, original.name);
        assert_eq!(decoded.enabled, original.enabled);
        assert_eq!(decoded.config, original.config);
        assert_eq!(decoded.leases, original.leases);
    }

    #[test]
    fn test_roundtrip_minimal() {
        let mut file = test_file();
        file.config.router = None;
        file.config.domain_name = None;
        file.config.ping_timeout_ms = 0;
        file.config.dns_servers.clear();
        file.config.ntp_servers.clear();
        file.config.exclusions.clear();
        file.config.reservations.clear();
        file.leases.clear();

        let decoded = ScopeFile::decode(&file.encode()).unwrap();
        assert_eq!(decoded.config, file.config);
        assert!(decoded.config.router.is_none());
        assert!(decoded.config.domain_name.is_none());
    }

    #[test]
    fn test_truncated_rejected() {
        let data = test_file().encode();
        for len in [0, 1, 10, data.len() / 2, data.len() - 1] {
            assert!(
                ScopeFile::decode(&data[..len]).is_err(),
                "decode succeeded at {} bytes",
                len
            );
        }
    }

    #[test]
    fn test_bad_lease_kind_rejected() {
        let mut data = test_file().encode();
        let last = data.len() - 1;
        data[last] = 9;
        assert!(ScopeFile::decode(&data).is_err());
    }

    #[tokio::test]
    async fn test_save_load_delete() {
        let dir = std::env::temp_dir().join("dhcpscope_test_scopefile");
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();

        let scope = test_file().into_scope();
        save_scope(&dir, &scope).await.unwrap();

        let loaded = load_dir(&dir).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "lab");
        assert_eq!(loaded[0].leases.len(), 1);

        delete_scope_file(&dir, "lab").await.unwrap();
        assert!(load_dir(&dir).await.unwrap().is_empty());

        // Deleting twice is fine.
        delete_scope_file(&dir, "lab").await.unwrap();

        let _ = std::fs::remove_dir_all(&dir);
    }
}
