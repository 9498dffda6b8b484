//! API types shared between the hub cluster and the member agent.
//!
//! The hub side authors [`work::Work`] objects in a per-member namespace and
//! the override snapshots consumed by the override engine. The member side
//! owns one [`applied_work::AppliedWork`] per Work, recording everything the
//! Work produced on that cluster.

pub mod applied_work;
pub mod condition;
pub mod constants;
pub mod overrides;
pub mod strategy;
pub mod work;

// External re-exports
pub use k8s_openapi;
pub use kube;
