pub mod dns_probe;
pub mod service;
pub mod ssl;

pub use dns_probe::DnsProbe;
pub use service::DomainService;
pub use ssl::SslProvider;
