//! `adalight` drives an Adalight LED strip from hot-swappable animation scripts.
//!
//! # Structure
//!
//! * [device]: double-buffered frame pipeline and the writer streaming frames to the strip
//! * [scripts]: script providers, parameter introspection and the per-script runtime
//! * [catalog]: scripts found in a watched directory, reloaded as files change
//! * [controller]: serialized script switching and state publication
//! * [servers]: JSON-lines RPC access to the controller

#[macro_use]
extern crate tracing;

pub mod catalog;
pub mod color;
pub mod controller;
pub mod device;
pub mod models;
pub mod scripts;
pub mod serde;
pub mod servers;
