//! Durable local store for tillsync.
//!
//! One SQLite database holds everything that must survive a process
//! restart: the command queue, the read-through TTL cache, the offline
//! auth cache, the append-only sync audit log, and the offline-ID
//! remap table. The rest of the application only ever sees the
//! [`StoreHandle`] contract — never raw storage access.

mod error;
mod handle;
mod store;

pub use error::{StoreError, StoreResult};
pub use handle::StoreHandle;
pub use store::{CommandStore, StoreStats, DEFAULT_RETENTION};
