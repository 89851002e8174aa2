#[derive(Debug, thiserror::Error, PartialEq, Eq, Clone)]
pub enum Error {
    #[error("IPv4 address does not belong to the pool: {0}")]
    AddressOutsidePool(std::net::Ipv4Addr),
    #[error("IPv4 address is already bound: {0}")]
    AddressInUse(std::net::Ipv4Addr),
    #[error("IPv4 pool exhausted. All {0} addresses leased")]
    PoolExhausted(usize),
}
