//! Shared types for the lumen controller mesh.
//!
//! Identity (`ControllerId`, `GroupId`), the closed role tag carried in
//! announcement TXT records, DNS-SD service type validation, and the
//! on-disk data directory layout.

pub mod paths;
pub mod types;
