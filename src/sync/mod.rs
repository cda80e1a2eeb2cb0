//! Chain synchronization
//!
//! [`engine`] decides, [`driver`] does. The engine is synchronous and fully
//! testable without sockets; the driver is the tokio task that wires it to
//! peers, the wallet queue and disk.

pub mod driver;
pub mod engine;
pub mod state;

pub use driver::{Control, Driver, DriverConfig, DriverContext};
pub use engine::{ChainSyncEngine, Command};
pub use state::{SyncPhase, SyncState};
