//! Fund Reconciliation Backend Library
//!
//! Exposes core modules for use by the binary and integration tests.
//! The reconciliation core lives under `recon`; the source adapters and
//! stores are the external seams around it.

pub mod amount;
pub mod cache;
pub mod models;
pub mod recon;
pub mod report;
pub mod snapshot;
pub mod sources;

pub use recon::ReconEngine;
