//! Types shared between the atek network runtime and its integrators.
//!
//! - [`identity`]: ed25519 keypairs and base-32 peer addressing
//! - [`protocol`]: protocol tokens used by connection dispatch
//! - [`config`]: transport configuration

pub mod config;
pub mod identity;
pub mod protocol;
