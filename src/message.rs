use std::net::Ipv4Addr;

use crate::error::{Error, Result};
use crate::lease::{ClientId, HardwareAddress};
use crate::options::{ClientFqdn, DhcpOption, MessageType, OptionCode};

const DHCP_MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];
pub const BOOTREQUEST: u8 = 1;
pub const BOOTREPLY: u8 = 2;
pub const HTYPE_ETHERNET: u8 = 1;
pub const HLEN_ETHERNET: u8 = 6;

/// Relay hop limit; anything above this is a forwarding loop.
const MAX_HOPS: u8 = 16;

/// Minimum encoded reply size. BOOTP clients reject shorter datagrams.
const MIN_MESSAGE_SIZE: usize = 300;

/// Overload flag bits (option 52): options continue in `file` / `sname`.
const OVERLOAD_FILE: u8 = 1;
const OVERLOAD_SNAME: u8 = 2;

/// An RFC 2131 message: fixed header plus the decoded option list.
///
/// Options split across multiple instances of the same code are
/// concatenated on decode (RFC 3396) in order of first appearance.
#[derive(Debug, Clone)]
pub struct DhcpMessage {
    pub op: u8,
    pub htype: u8,
    pub hlen: u8,
    pub hops: u8,
    pub xid: u32,
    pub secs: u16,
    pub flags: u16,
    pub ciaddr: Ipv4Addr,
    pub yiaddr: Ipv4Addr,
    pub siaddr: Ipv4Addr,
    pub giaddr: Ipv4Addr,
    pub chaddr: [u8; 16],
    pub sname: [u8; 64],
    pub file: [u8; 128],
    pub options: Vec<DhcpOption>,
}

impl DhcpMessage {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 240 {
            return Err(Error::MalformedMessage(format!(
                "Message too short: {} bytes (minimum 240)",
                data.len()
            )));
        }

        let magic_cookie = &data[236..240];
        if magic_cookie != DHCP_MAGIC_COOKIE {
            return Err(Error::MalformedMessage("Invalid magic cookie".to_string()));
        }

        let op = data[0];
        let htype = data[1];
        let hlen = data[2];
        let hops = data[3];

        if hops > MAX_HOPS {
            return Err(Error::MalformedMessage(format!(
                "Excessive relay hops: {}",
                hops
            )));
        }

        let xid = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let secs = u16::from_be_bytes([data[8], data[9]]);
        let flags = u16::from_be_bytes([data[10], data[11]]);

        let ciaddr = Ipv4Addr::new(data[12], data[13], data[14], data[15]);
        let yiaddr = Ipv4Addr::new(data[16], data[17], data[18], data[19]);
        let siaddr = Ipv4Addr::new(data[20], data[21], data[22], data[23]);
        let giaddr = Ipv4Addr::new(data[24], data[25], data[26], data[27]);

        let mut chaddr = [0u8; 16];
        chaddr.copy_from_slice(&data[28..44]);

        let mut sname = [0u8; 64];
        sname.copy_from_slice(&data[44..108]);

        let mut file = [0u8; 128];
        file.copy_from_slice(&data[108..236]);

        let mut raw = Vec::new();
        let overload = Self::collect_raw_options(&data[240..], &mut raw)?;

        // Option overload: the file and sname fields carry more options.
        if let Some(flag) = overload {
            if flag & OVERLOAD_FILE != 0 {
                Self::collect_raw_options(&file, &mut raw)?;
            }
            if flag & OVERLOAD_SNAME != 0 {
                Self::collect_raw_options(&sname, &mut raw)?;
            }
        }

        let mut options = Vec::with_capacity(raw.len());
        for (code, payload) in raw {
            options.push(DhcpOption::parse(code, &payload)?);
        }

        Ok(Self {
            op,
            htype,
            hlen,
            hops,
            xid,
            secs,
            flags,
            ciaddr,
            yiaddr,
            siaddr,
            giaddr,
            chaddr,
            sname,
            file,
            options,
        })
    }

    /// Walks one option region, concatenating repeated codes per RFC 3396.
    ///
    /// Returns the overload flag if option 52 was seen in this region.
    fn collect_raw_options(data: &[u8], raw: &mut Vec<(u8, Vec<u8>)>) -> Result<Option<u8>> {
        let mut overload = None;
        let mut index = 0;

        while index < data.len() {
            let code = data[index];

            if code == OptionCode::Pad as u8 {
                index += 1;
                continue;
            }

            if code == OptionCode::End as u8 {
                break;
            }

            if index + 1 >= data.len() {
                return Err(Error::MalformedMessage("Option length missing".to_string()));
            }

            let length = data[index + 1] as usize;

            if index + 2 + length > data.len() {
                return Err(Error::MalformedMessage("Option data truncated".to_string()));
            }

            let payload = &data[index + 2..index + 2 + length];

            if code == OptionCode::OptionOverload as u8 && length == 1 {
                overload = Some(payload[0]);
            } else if let Some((_, existing)) = raw.iter_mut().find(|(seen, _)| *seen == code) {
                existing.extend_from_slice(payload);
            } else {
                raw.push((code, payload.to_vec()));
            }

            index += 2 + length;
        }

        Ok(overload)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut message = Vec::with_capacity(576);

        message.push(self.op);
        message.push(self.htype);
        message.push(self.hlen);
        message.push(self.hops);

        message.extend_from_slice(&self.xid.to_be_bytes());
        message.extend_from_slice(&self.secs.to_be_bytes());
        message.extend_from_slice(&self.flags.to_be_bytes());

        message.extend_from_slice(&self.ciaddr.octets());
        message.extend_from_slice(&self.yiaddr.octets());
        message.extend_from_slice(&self.siaddr.octets());
        message.extend_from_slice(&self.giaddr.octets());

        message.extend_from_slice(&self.chaddr);
        message.extend_from_slice(&self.sname);
        message.extend_from_slice(&self.file);

        message.extend_from_slice(&DHCP_MAGIC_COOKIE);

        for option in &self.options {
            message.extend_from_slice(&option.encode());
        }

        message.push(OptionCode::End as u8);

        while message.len() < MIN_MESSAGE_SIZE {
            message.push(0);
        }

        message
    }

    pub fn message_type(&self) -> Option<MessageType> {
        self.options.iter().find_map(|option| match option {
            DhcpOption::MessageType(msg_type) => Some(*msg_type),
            _ => None,
        })
    }

    pub fn requested_ip(&self) -> Option<Ipv4Addr> {
        self.options.iter().find_map(|option| match option {
            DhcpOption::RequestedIpAddress(ip) => Some(*ip),
            _ => None,
        })
    }

    pub fn server_identifier(&self) -> Option<Ipv4Addr> {
        self.options.iter().find_map(|option| match option {
            DhcpOption::ServerIdentifier(ip) => Some(*ip),
            _ => None,
        })
    }

    pub fn requested_lease_time(&self) -> Option<u32> {
        self.options.iter().find_map(|option| match option {
            DhcpOption::LeaseTime(secs) => Some(*secs),
            _ => None,
        })
    }

    pub fn parameter_request_list(&self) -> Option<&[u8]> {
        self.options.iter().find_map(|option| match option {
            DhcpOption::ParameterRequestList(params) => Some(params.as_slice()),
            _ => None,
        })
    }

    pub fn host_name(&self) -> Option<&str> {
        self.options.iter().find_map(|option| match option {
            DhcpOption::HostName(name) => Some(name.as_str()),
            _ => None,
        })
    }

    pub fn vendor_class(&self) -> Option<&[u8]> {
        self.options.iter().find_map(|option| match option {
            DhcpOption::VendorClassIdentifier(data) => Some(data.as_slice()),
            _ => None,
        })
    }

    pub fn client_fqdn(&self) -> Option<&ClientFqdn> {
        self.options.iter().find_map(|option| match option {
            DhcpOption::ClientFqdn(fqdn) => Some(fqdn),
            _ => None,
        })
    }

    /// Hardware address from the fixed header, truncated to `hlen`.
    pub fn hardware_address(&self) -> HardwareAddress {
        let len = (self.hlen as usize).min(self.chaddr.len());
        HardwareAddress::new(self.htype, self.chaddr[..len].to_vec())
    }

    /// Canonical identity: option 61 if the client sent one, else the
    /// hardware type plus address.
    pub fn client_id(&self) -> ClientId {
        let explicit = self.options.iter().find_map(|option| match option {
            DhcpOption::ClientIdentifier(data) => Some(data.clone()),
            _ => None,
        });
        match explicit {
            Some(data) if !data.is_empty() => ClientId::from_option(data),
            _ => {
                let hardware = self.hardware_address();
                ClientId::from_hardware(hardware.htype, &hardware.bytes)
            }
        }
    }

    pub fn is_broadcast(&self) -> bool {
        (self.flags & 0x8000) != 0
    }

    pub fn create_reply(
        request: &DhcpMessage,
        message_type: MessageType,
        your_ip: Ipv4Addr,
        server_ip: Ipv4Addr,
        options: Vec<DhcpOption>,
    ) -> Self {
        let mut all_options = vec![DhcpOption::MessageType(message_type)];
        all_options.extend(options);

        Self {
            op: BOOTREPLY,
            htype: request.htype,
            hlen: request.hlen,
            hops: 0,
            xid: request.xid,
            secs: 0,
            flags: request.flags,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: your_ip,
            siaddr: server_ip,
            giaddr: request.giaddr,
            chaddr: request.chaddr,
            sname: [0u8; 64],
            file: [0u8; 128],
            options: all_options,
        }
    }
}
