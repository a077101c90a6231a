pub mod config;
pub mod dns;
pub mod engine;
pub mod error;
pub mod lease;
pub mod message;
pub mod options;
pub mod probe;
pub mod scope;
pub mod scopefile;
pub mod server;

pub use config::ServerConfig;
pub use dns::{DnsUpdater, MemoryZoneStore, ZoneStore};
pub use engine::Engine;
pub use error::{Error, Result};
pub use lease::{ClientId, HardwareAddress, Lease, LeaseKind};
pub use message::DhcpMessage;
pub use options::{DhcpOption, MessageType};
pub use scope::{Reservation, Scope, ScopeConfig};
pub use server::{DhcpServer, ScopeRegistry};
