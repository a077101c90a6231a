use std::net::Ipv4Addr;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OptionCode {
    Pad = 0,
    SubnetMask = 1,
    Router = 3,
    DnsServer = 6,
    HostName = 12,
    DomainName = 15,
    BroadcastAddress = 28,
    NtpServers = 42,
    RequestedIpAddress = 50,
    LeaseTime = 51,
    OptionOverload = 52,
    MessageType = 53,
    ServerIdentifier = 54,
    ParameterRequestList = 55,
    MaxMessageSize = 57,
    RenewalTime = 58,
    RebindingTime = 59,
    VendorClassIdentifier = 60,
    ClientIdentifier = 61,
    ClientFqdn = 81,
    End = 255,
}

impl TryFrom<u8> for OptionCode {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Pad),
            1 => Ok(Self::SubnetMask),
            3 => Ok(Self::Router),
            6 => Ok(Self::DnsServer),
            12 => Ok(Self::HostName),
            15 => Ok(Self::DomainName),
            28 => Ok(Self::BroadcastAddress),
            42 => Ok(Self::NtpServers),
            50 => Ok(Self::RequestedIpAddress),
            51 => Ok(Self::LeaseTime),
            52 => Ok(Self::OptionOverload),
            53 => Ok(Self::MessageType),
            54 => Ok(Self::ServerIdentifier),
            55 => Ok(Self::ParameterRequestList),
            57 => Ok(Self::MaxMessageSize),
            58 => Ok(Self::RenewalTime),
            59 => Ok(Self::RebindingTime),
            60 => Ok(Self::VendorClassIdentifier),
            61 => Ok(Self::ClientIdentifier),
            81 => Ok(Self::ClientFqdn),
            255 => Ok(Self::End),
            other => Err(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Discover = 1,
    Offer = 2,
    Request = 3,
    Decline = 4,
    Ack = 5,
    Nak = 6,
    Release = 7,
    Inform = 8,
}

impl TryFrom<u8> for MessageType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Discover),
            2 => Ok(Self::Offer),
            3 => Ok(Self::Request),
            4 => Ok(Self::Decline),
            5 => Ok(Self::Ack),
            6 => Ok(Self::Nak),
            7 => Ok(Self::Release),
            8 => Ok(Self::Inform),
            other => Err(other),
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Discover => write!(f, "DISCOVER"),
            Self::Offer => write!(f, "OFFER"),
            Self::Request => write!(f, "REQUEST"),
            Self::Decline => write!(f, "DECLINE"),
            Self::Ack => write!(f, "ACK"),
            Self::Nak => write!(f, "NAK"),
            Self::Release => write!(f, "RELEASE"),
            Self::Inform => write!(f, "INFORM"),
        }
    }
}

/// Client FQDN option payload (RFC 4702).
///
/// The server reply clears the `S` bit, sets `O`, and echoes the domain
/// it actually registered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientFqdn {
    pub flags: u8,
    pub rcode1: u8,
    pub rcode2: u8,
    pub name: String,
}

impl ClientFqdn {
    pub const FLAG_SERVER_UPDATE: u8 = 0x01;
    pub const FLAG_OVERRIDE: u8 = 0x02;
    pub const FLAG_ENCODED: u8 = 0x04;
    pub const FLAG_NO_UPDATE: u8 = 0x08;

    /// True when the client asked the server to perform the A update.
    pub fn server_should_update(&self) -> bool {
        self.flags & Self::FLAG_SERVER_UPDATE != 0
    }

    fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 3 {
            return Err(Error::MalformedMessage(
                "Client FQDN option too short".to_string(),
            ));
        }
        let flags = data[0];
        let name_bytes = &data[3..];
        let name = if flags & Self::FLAG_ENCODED != 0 {
            decode_dns_name(name_bytes)?
        } else {
            String::from_utf8_lossy(name_bytes)
                .trim_end_matches('.')
                .to_string()
        };
        Ok(Self {
            flags,
            rcode1: data[1],
            rcode2: data[2],
            name,
        })
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        out.push(self.flags);
        out.push(self.rcode1);
        out.push(self.rcode2);
        if self.flags & Self::FLAG_ENCODED != 0 {
            encode_dns_name(&self.name, out);
        } else {
            out.extend_from_slice(self.name.as_bytes());
        }
    }
}

/// Decodes an uncompressed DNS wire-format name into dotted notation.
fn decode_dns_name(data: &[u8]) -> Result<String> {
    let mut labels = Vec::new();
    let mut index = 0;
    while index < data.len() {
        let len = data[index] as usize;
        if len == 0 {
            break;
        }
        if len > 63 || index + 1 + len > data.len() {
            return Err(Error::MalformedMessage("Invalid FQDN label".to_string()));
        }
        labels.push(String::from_utf8_lossy(&data[index + 1..index + 1 + len]).to_string());
        index += 1 + len;
    }
    Ok(labels.join("."))
}

fn encode_dns_name(name: &str, out: &mut Vec<u8>) {
    for label in name.split('.').filter(|label| !label.is_empty()) {
        let bytes = label.as_bytes();
        out.push(bytes.len().min(63) as u8);
        out.extend_from_slice(&bytes[..bytes.len().min(63)]);
    }
    out.push(0);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhcpOption {
    SubnetMask(Ipv4Addr),
    Router(Vec<Ipv4Addr>),
    DnsServer(Vec<Ipv4Addr>),
    HostName(String),
    DomainName(String),
    BroadcastAddress(Ipv4Addr),
    NtpServers(Vec<Ipv4Addr>),
    RequestedIpAddress(Ipv4Addr),
    LeaseTime(u32),
    OptionOverload(u8),
    MessageType(MessageType),
    ServerIdentifier(Ipv4Addr),
    ParameterRequestList(Vec<u8>),
    MaxMessageSize(u16),
    RenewalTime(u32),
    RebindingTime(u32),
    VendorClassIdentifier(Vec<u8>),
    ClientIdentifier(Vec<u8>),
    ClientFqdn(ClientFqdn),
    Unknown(u8, Vec<u8>),
}

fn parse_addr_list(data: &[u8], what: &str) -> Result<Vec<Ipv4Addr>> {
    if data.len() % 4 != 0 || data.is_empty() {
        return Err(Error::MalformedMessage(format!(
            "Invalid {} option length",
            what
        )));
    }
    Ok(data
        .chunks_exact(4)
        .map(|chunk| Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]))
        .collect())
}

fn parse_addr(data: &[u8], what: &str) -> Result<Ipv4Addr> {
    if data.len() != 4 {
        return Err(Error::MalformedMessage(format!(
            "Invalid {} option length",
            what
        )));
    }
    Ok(Ipv4Addr::new(data[0], data[1], data[2], data[3]))
}

fn parse_u32(data: &[u8], what: &str) -> Result<u32> {
    if data.len() != 4 {
        return Err(Error::MalformedMessage(format!(
            "Invalid {} option length",
            what
        )));
    }
    Ok(u32::from_be_bytes([data[0], data[1], data[2], data[3]]))
}

impl DhcpOption {
    pub fn code(&self) -> u8 {
        match self {
            Self::SubnetMask(_) => OptionCode::SubnetMask as u8,
            Self::Router(_) => OptionCode::Router as u8,
            Self::DnsServer(_) => OptionCode::DnsServer as u8,
            Self::HostName(_) => OptionCode::HostName as u8,
            Self::DomainName(_) => OptionCode::DomainName as u8,
            Self::BroadcastAddress(_) => OptionCode::BroadcastAddress as u8,
            Self::NtpServers(_) => OptionCode::NtpServers as u8,
            Self::RequestedIpAddress(_) => OptionCode::RequestedIpAddress as u8,
            Self::LeaseTime(_) => OptionCode::LeaseTime as u8,
            Self::OptionOverload(_) => OptionCode::OptionOverload as u8,
            Self::MessageType(_) => OptionCode::MessageType as u8,
            Self::ServerIdentifier(_) => OptionCode::ServerIdentifier as u8,
            Self::ParameterRequestList(_) => OptionCode::ParameterRequestList as u8,
            Self::MaxMessageSize(_) => OptionCode::MaxMessageSize as u8,
            Self::RenewalTime(_) => OptionCode::RenewalTime as u8,
            Self::RebindingTime(_) => OptionCode::RebindingTime as u8,
            Self::VendorClassIdentifier(_) => OptionCode::VendorClassIdentifier as u8,
            Self::ClientIdentifier(_) => OptionCode::ClientIdentifier as u8,
            Self::ClientFqdn(_) => OptionCode::ClientFqdn as u8,
            Self::Unknown(code, _) => *code,
        }
    }

    pub fn parse(code: u8, data: &[u8]) -> Result<Self> {
        match OptionCode::try_from(code) {
            Ok(OptionCode::SubnetMask) => Ok(Self::SubnetMask(parse_addr(data, "subnet mask")?)),
            Ok(OptionCode::Router) => Ok(Self::Router(parse_addr_list(data, "router")?)),
            Ok(OptionCode::DnsServer) => Ok(Self::DnsServer(parse_addr_list(data, "DNS server")?)),
            Ok(OptionCode::HostName) => {
                Ok(Self::HostName(String::from_utf8_lossy(data).to_string()))
            }
            Ok(OptionCode::DomainName) => {
                Ok(Self::DomainName(String::from_utf8_lossy(data).to_string()))
            }
            Ok(OptionCode::BroadcastAddress) => {
                Ok(Self::BroadcastAddress(parse_addr(data, "broadcast")?))
            }
            Ok(OptionCode::NtpServers) => {
                Ok(Self::NtpServers(parse_addr_list(data, "NTP server")?))
            }
            Ok(OptionCode::RequestedIpAddress) => {
                Ok(Self::RequestedIpAddress(parse_addr(data, "requested IP")?))
            }
            Ok(OptionCode::LeaseTime) => Ok(Self::LeaseTime(parse_u32(data, "lease time")?)),
            Ok(OptionCode::OptionOverload) => {
                if data.len() != 1 {
                    return Err(Error::MalformedMessage(
                        "Invalid option overload length".to_string(),
                    ));
                }
                Ok(Self::OptionOverload(data[0]))
            }
            Ok(OptionCode::MessageType) => {
                if data.len() != 1 {
                    return Err(Error::MalformedMessage(
                        "Invalid message type length".to_string(),
                    ));
                }
                let msg_type = MessageType::try_from(data[0]).map_err(|value| {
                    Error::MalformedMessage(format!("Unknown message type: {}", value))
                })?;
                Ok(Self::MessageType(msg_type))
            }
            Ok(OptionCode::ServerIdentifier) => {
                Ok(Self::ServerIdentifier(parse_addr(data, "server id")?))
            }
            Ok(OptionCode::ParameterRequestList) => Ok(Self::ParameterRequestList(data.to_vec())),
            Ok(OptionCode::MaxMessageSize) => {
                if data.len() != 2 {
                    return Err(Error::MalformedMessage(
                        "Invalid max message size length".to_string(),
                    ));
                }
                Ok(Self::MaxMessageSize(u16::from_be_bytes([data[0], data[1]])))
            }
            Ok(OptionCode::RenewalTime) => Ok(Self::RenewalTime(parse_u32(data, "renewal")?)),
            Ok(OptionCode::RebindingTime) => Ok(Self::RebindingTime(parse_u32(data, "rebinding")?)),
            Ok(OptionCode::VendorClassIdentifier) => {
                Ok(Self::VendorClassIdentifier(data.to_vec()))
            }
            Ok(OptionCode::ClientIdentifier) => Ok(Self::ClientIdentifier(data.to_vec())),
            Ok(OptionCode::ClientFqdn) => Ok(Self::ClientFqdn(ClientFqdn::parse(data)?)),
            Ok(OptionCode::Pad) | Ok(OptionCode::End) => Err(Error::MalformedMessage(
                "Pad/End should not be parsed as options".to_string(),
            )),
            Err(unknown_code) => Ok(Self::Unknown(unknown_code, data.to_vec())),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::new();
        match self {
            Self::SubnetMask(addr)
            | Self::BroadcastAddress(addr)
            | Self::RequestedIpAddress(addr)
            | Self::ServerIdentifier(addr) => payload.extend_from_slice(&addr.octets()),
            Self::Router(addrs) | Self::DnsServer(addrs) | Self::NtpServers(addrs) => {
                for addr in addrs {
                    payload.extend_from_slice(&addr.octets());
                }
            }
            Self::HostName(name) | Self::DomainName(name) => {
                payload.extend_from_slice(name.as_bytes());
            }
            Self::LeaseTime(value) | Self::RenewalTime(value) | Self::RebindingTime(value) => {
                payload.extend_from_slice(&value.to_be_bytes());
            }
            Self::OptionOverload(flag) => payload.push(*flag),
            Self::MessageType(msg_type) => payload.push(*msg_type as u8),
            Self::ParameterRequestList(params) => payload.extend_from_slice(params),
            Self::MaxMessageSize(size) => payload.extend_from_slice(&size.to_be_bytes()),
            Self::VendorClassIdentifier(data) | Self::ClientIdentifier(data) => {
                payload.extend_from_slice(data);
            }
            Self::ClientFqdn(fqdn) => fqdn.encode_into(&mut payload),
            Self::Unknown(_, data) => payload.extend_from_slice(data),
        }

        let mut result = vec![self.code(), payload.len() as u8];
        result.extend_from_slice(&payload);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_roundtrip() {
        for value in 1..=8u8 {
            let msg_type = MessageType::try_from(value).unwrap();
            assert_eq!(msg_type as u8, value);
        }
    }

    #[test]
    fn test_option_encode_decode() {
        let original = DhcpOption::SubnetMask(Ipv4Addr::new(255, 255, 255, 0));
        let encoded = original.encode();
        assert_eq!(encoded, vec![1, 4, 255, 255, 255, 0]);

        let decoded = DhcpOption::parse(1, &[255, 255, 255, 0]).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn test_lease_time_encoding() {
        let option = DhcpOption::LeaseTime(86400);
        let encoded = option.encode();
        assert_eq!(encoded.len(), 6);
        assert_eq!(encoded[0], 51);
        assert_eq!(encoded[1], 4);

        let decoded = DhcpOption::parse(51, &encoded[2..]).unwrap();
        assert_eq!(decoded, DhcpOption::LeaseTime(86400));
    }

    #[test]
    fn test_hostname_option() {
        let option = DhcpOption::HostName("printer-3".to_string());
        let encoded = option.encode();
        assert_eq!(encoded[0], 12);
        assert_eq!(encoded[1], 9);

        let decoded = DhcpOption::parse(12, &encoded[2..]).unwrap();
        assert_eq!(decoded, option);
    }

    #[test]
    fn test_ntp_servers_option() {
        let servers = vec![
            Ipv4Addr::new(10, 0, 0, 10),
            Ipv4Addr::new(10, 0, 0, 11),
        ];
        let option = DhcpOption::NtpServers(servers);
        let encoded = option.encode();
        assert_eq!(encoded[0], 42);
        assert_eq!(encoded[1], 8);

        let decoded = DhcpOption::parse(42, &encoded[2..]).unwrap();
        assert_eq!(decoded, option);
    }

    #[test]
    fn test_fqdn_ascii_roundtrip() {
        let fqdn = ClientFqdn {
            flags: ClientFqdn::FLAG_SERVER_UPDATE,
            rcode1: 0,
            rcode2: 0,
            name: "host.example.lan".to_string(),
        };
        assert!(fqdn.server_should_update());

        let encoded = DhcpOption::ClientFqdn(fqdn.clone()).encode();
        let decoded = DhcpOption::parse(81, &encoded[2..]).unwrap();
        assert_eq!(decoded, DhcpOption::ClientFqdn(fqdn));
    }

    #[test]
    fn test_fqdn_wire_encoded_name() {
        let mut data = vec![ClientFqdn::FLAG_ENCODED, 0, 0];
        data.extend_from_slice(&[4, b'h', b'o', b's', b't', 3, b'l', b'a', b'n', 0]);

        let decoded = DhcpOption::parse(81, &data).unwrap();
        if let DhcpOption::ClientFqdn(fqdn) = decoded {
            assert_eq!(fqdn.name, "host.lan");
        } else {
            panic!("Expected ClientFqdn");
        }
    }

    #[test]
    fn test_fqdn_too_short() {
        assert!(DhcpOption::parse(81, &[0x01]).is_err());
    }

    #[test]
    fn test_bad_label_rejected() {
        let data = vec![ClientFqdn::FLAG_ENCODED, 0, 0, 70, b'x'];
        assert!(DhcpOption::parse(81, &data).is_err());
    }
}
