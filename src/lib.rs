//! Kiln - plugin discovery, shadow-copy deployment and registry
//!
//! This library finds plugin packages on disk, checks them against the host
//! version, copies their binaries into a working directory before loading
//! them, and publishes the loaded set through a reader/writer-locked registry.
//!
//! # Modules
//!
//! - [`config`]: Configuration management and serialization
//! - [`plugins`]: Descriptor discovery, installation state, resolution,
//!   shadow-copy deployment, module loading and the plugin registry

pub mod config;
pub mod plugins;
