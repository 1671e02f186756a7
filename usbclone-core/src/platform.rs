//! Operating-system specific device discovery and privileges.
//!
//! Each submodule exposes the same public API: an `lsblk`-style
//! [`crate::device::DeviceResolver`], removable-drive discovery, block
//! device sizing and the root check. Only Linux is implemented, since the
//! block-copy tools the engine drives are Linux tools.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use self::linux::*;
