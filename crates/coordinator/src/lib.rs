/**
 * Durable ledger of (job, target, host) bindings.
 * One row per binding; the count of live mounted rows
 *  for a (target, host) is the reference count.
 */
pub mod database;
/**
 * Host-scoped advisory file lock serializing all
 *  mount/unmount decisions on a node.
 */
pub mod lock;

mod coordinator;

pub use coordinator::{CoordinatorError, MountCoordinator, UnmountOutcome};
pub use database::models::LedgerEntry;
pub use database::Database;
pub use lock::{HostLock, HostLockGuard, LockError};
