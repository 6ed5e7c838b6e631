pub mod address;
pub mod bypass;
pub mod cache;
pub mod config;
pub mod dialer;
pub mod dns;
pub mod error;
pub mod fakeip;
pub mod hosts;
pub mod matcher;
pub mod proto_utils;
pub mod router;
pub mod server;
pub mod watcher;

pub use address::{AddrContext, Address, Host, Network};
pub use config::{Mode, ResolveStrategy, Setting};
pub use error::{DnsError, RouteError};
pub use router::Shunt;
