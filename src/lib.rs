//! crabefi-chainload - chainloading of EFI applications
//!
//! This library loads a secondary EFI application from the boot medium and
//! starts it, the way a boot menu's `chainloader` command does. With secure
//! boot off the image goes to the firmware loader; with secure boot on it is
//! verified by the shim lock protocol, then laid out, relocated and entered
//! directly.
//!
//! The crate is `no_std` + `alloc`. The host loader supplies the firmware
//! (see [`firmware::efi::EfiFirmware`]), a global allocator and a panic
//! handler.
//!
//! ```ignore
//! let fw = unsafe { EfiFirmware::new(image_handle, system_table) };
//! let volume = fw.boot_volume().ok_or(Error::NotARootDevice)?;
//! let mut loader = Chainloader::new(&fw, ChainloadConfig::default());
//! loader.prepare(&volume, &["/EFI/BOOT/grubx64.efi", "quiet"])?.boot()?;
//! ```

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod chainload;
pub mod config;
pub mod device_path;
pub mod error;
pub mod firmware;
pub mod logger;
pub mod pe;

pub use chainload::{Chainloader, PendingChainload};
pub use config::ChainloadConfig;
pub use error::{Error, ErrorKind, Result};
