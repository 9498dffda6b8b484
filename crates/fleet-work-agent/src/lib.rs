//! The member agent: takes Work bundles authored on the hub and owns their
//! full lifecycle on one member cluster.
//!
//! Three cooperating components:
//! - [`override_engine`] transforms each manifest for this cluster before it
//!   is applied,
//! - [`applier`] runs the per-Work reconciliation pipeline,
//! - [`tracker`] records what a Work owns and drives garbage collection.

pub mod applier;
pub mod cli;
pub mod controller;
pub mod discovery;
pub mod member;
pub mod override_engine;
pub mod tracker;
