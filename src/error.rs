use std::net::Ipv4Addr;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Malformed DHCP message: {0}")]
    MalformedMessage(String),

    #[error("No scope matches the request")]
    ScopeNotFound,

    #[error("No address available in scope {0}")]
    AddressUnavailable(String),

    #[error("Client rejected by scope policy")]
    PolicyReject,

    #[error("Address {0} does not match the client's lease or offer")]
    LeaseMismatch(Ipv4Addr),

    #[error("Scope {0} already exists")]
    DuplicateScope(String),

    #[error("Scope {0} does not exist")]
    UnknownScope(String),

    #[error("Invalid scope definition: {0}")]
    InvalidScope(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Scope file error: {0}")]
    Persistence(String),

    #[error("Socket error: {0}")]
    Socket(String),

    #[error("Server state error: {0}")]
    ServerState(String),
}

pub type Result<T> = std::result::Result<T, Error>;
