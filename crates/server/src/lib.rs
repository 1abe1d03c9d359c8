//! Demo host: several in-process servers sharing one document store.
//!
//! Each server runs the periodic components and a worker that pushes jobs
//! through their lifecycle with write-only transactions, so leases change
//! hands between servers the way they would between processes.

pub mod demo;
