pub mod api;
pub mod config;
pub mod error;
pub mod options;
pub mod packet;
pub mod pool;
pub mod server;
pub mod store;
pub mod subnet;
pub mod tracker;

pub use config::Config;
pub use error::{Error, Result};
pub use packet::DhcpPacket;
pub use pool::PoolBitmap;
pub use server::DhcpServer;
pub use store::{FileStore, MemoryStore, Snapshot, Store};
pub use subnet::{Binding, Lease, Subnet, SubnetDto};
pub use tracker::DataTracker;
