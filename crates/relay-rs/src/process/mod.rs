//! Process supervision for long-running background commands.

pub mod sidecar;

pub use sidecar::{SidecarManager, SidecarOutput, SidecarSpec};
