pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod modifier;
pub mod request;
pub mod router;
pub mod server;
pub mod upstream;
pub mod ws_proxy;

pub use config::Config;
pub use error::ProxyError;
pub use router::Router;
