//! Distributed lock on top of the shared document store.
//!
//! ## Design
//!
//! - **Acquire** = create-if-absent of a lease document whose id is the
//!   resource key; a duplicate-key conflict means "held", so the caller polls
//!   until its timeout budget is spent
//! - **Renew** = conditional heartbeat patch on the lease's opacity token,
//!   scheduled at half the TTL; a stale token or a missing lease stops renewal
//!   for good (fencing)
//! - **Release** = point delete when the handle is released or dropped
//! - **TTL** = `max(60s, 1.5 × timeout)`, a safety net for holders that crash
//!
//! ## Components
//!
//! - `DistributedLockExecutor`: `acquire_lock`, `invoke`, `try_invoke`
//! - `LockHandle`: owns one live lease and its renewal thread
//! - `LeaseState`: explicit renewal/release state of a handle

pub mod error;
pub mod executor;
pub mod handle;

pub use error::{LockError, LockResult};
pub use executor::{DistributedLockExecutor, lease_ttl_secs};
pub use handle::{LeaseState, LockHandle};
