//! MITM transport and upstream fetch.

pub mod server;
pub mod upstream;

pub use server::ProxyServer;
pub use upstream::UpstreamClient;
