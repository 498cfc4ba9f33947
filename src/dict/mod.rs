//! Dictionary lifecycle: on-disk metadata, the shared compiled-handle
//! pool, and the copy-on-write routing table.

pub mod meta;
pub mod pool;
pub mod table;

pub use meta::{DictMeta, DEFAULT_NS};
pub use pool::DictPool;
pub use table::{NamespaceEntry, RoutingTable};
