//! Resource generation module.
//!
//! Builders for the Kubernetes objects the controllers materialize on the
//! two clusters.
//!
//! | Resource | Purpose |
//! |----------|---------|
//! | rsync configmaps/secrets | rsync daemon + stunnel configuration and credentials |
//! | transfer/client pods | move PVC data between clusters |
//! | service + route | expose the TLS tunnel on the destination |
//! | stage pods | hold PVC attachments for the BR engine's volume sidecar |
//! | hook job + configmap | run user hooks at the four hook points |

pub mod common;
pub mod hook_job;
pub mod rsync;
pub mod stage_pod;

pub use common::owner_reference;
