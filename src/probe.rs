//! ICMP echo conflict probe.
//!
//! Before offering an address, a scope with ping checking enabled sends
//! one echo request and treats any reply within the timeout as "address
//! in use". Platforms that refuse the unprivileged ICMP socket simply
//! see no reply, so allocation proceeds.

use std::mem::MaybeUninit;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::debug;

const ECHO_REQUEST: u8 = 8;
const PROBE_IDENTIFIER: u16 = 0x5c07;

/// True when `address` answered an echo request within `timeout_ms`.
pub async fn address_responds(address: Ipv4Addr, timeout_ms: u16) -> bool {
    let timeout = Duration::from_millis(timeout_ms as u64);
    tokio::task::spawn_blocking(move || match echo(address, timeout) {
        Ok(replied) => replied,
        Err(error) => {
            debug!("Echo probe for {} unavailable: {}", address, error);
            false
        }
    })
    .await
    .unwrap_or(false)
}

fn echo(address: Ipv4Addr, timeout: Duration) -> std::io::Result<bool> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::ICMPV4))?;
    socket.set_read_timeout(Some(timeout))?;

    let dest = SocketAddr::V4(SocketAddrV4::new(address, 0));
    let request = echo_request(PROBE_IDENTIFIER, 1);
    socket.send_to(&request, &dest.into())?;

    let mut buffer = [MaybeUninit::<u8>::uninit(); 64];
    match socket.recv_from(&mut buffer) {
        Ok((len, _)) => Ok(len >= 8),
        Err(error)
            if matches!(
                error.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            ) =>
        {
            Ok(false)
        }
        Err(error) => Err(error),
    }
}

fn echo_request(identifier: u16, sequence: u16) -> [u8; 16] {
    let mut packet = [0u8; 16];
    packet[0] = ECHO_REQUEST;
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());
    let checksum = icmp_checksum(&packet);
    packet[2..4].copy_from_slice(&checksum.to_be_bytes());
    packet
}

/// RFC 1071 ones-complement sum over the packet.
fn icmp_checksum(data: &[u8]) -> u16 {
    let mut sum = 0u32;
    for chunk in data.chunks(2) {
        let word = if chunk.len() == 2 {
            u16::from_be_bytes([chunk[0], chunk[1]])
        } else {
            u16::from_be_bytes([chunk[0], 0])
        };
        sum = sum.wrapping_add(word as u32);
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}
