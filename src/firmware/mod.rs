//! Firmware interfaces
//!
//! The chainloader talks to the firmware through a handful of narrow
//! traits so the loading logic can run against real UEFI boot services
//! ([`efi::EfiFirmware`]) or an in-memory double in tests.
//!
//! # Seams
//!
//! - [`BootServices`] - pool and page allocation, the firmware image loader
//! - [`ActiveImage`] - the loaded-image record of the running loader, which
//!   the validated path borrows while the chained image runs
//! - [`TrustRoot`] - signature verification and header parsing (shim lock)
//! - [`BootMedia`] / [`ImageFile`] - the boot device and the file on it
//!
//! Allocations are wrapped in [`PoolBuffer`] and [`PageRange`], which give
//! the memory back when dropped.

pub mod efi;
#[cfg(test)]
pub mod mock;

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::ptr::NonNull;

use r_efi::efi::{Handle, Status};

use crate::error::{Error, Result};
use crate::pe::{header, ImageContext};

/// Size of a firmware page
pub const PAGE_SIZE: usize = 4096;

/// Number of pages needed to hold `size` bytes
pub const fn pages_for(size: usize) -> usize {
    size.div_ceil(PAGE_SIZE)
}

/// Memory types the chainloader allocates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MemoryType {
    LoaderCode = 1,
    LoaderData = 2,
}

impl MemoryType {
    /// EFI memory type value
    pub fn as_efi(self) -> r_efi::efi::MemoryType {
        match self {
            MemoryType::LoaderCode => r_efi::efi::LOADER_CODE,
            MemoryType::LoaderData => r_efi::efi::LOADER_DATA,
        }
    }
}

/// What a started image handed back
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageExit {
    /// Exit status
    pub status: Status,
    /// Exit data (UCS-2, without the terminating NUL), already copied out of
    /// firmware memory
    pub exit_data: Option<Vec<u16>>,
}

/// Boot services used by the chainloader
pub trait BootServices {
    /// Allocate `size` bytes from the pool
    fn allocate_pool(
        &self,
        memory_type: MemoryType,
        size: usize,
    ) -> core::result::Result<NonNull<u8>, Status>;

    /// Return a pool allocation
    ///
    /// # Safety
    /// `buffer` must come from [`allocate_pool`](Self::allocate_pool) on this
    /// object and must not be used afterwards.
    unsafe fn free_pool(&self, buffer: NonNull<u8>) -> Status;

    /// Allocate `pages` pages anywhere in memory
    fn allocate_pages(
        &self,
        memory_type: MemoryType,
        pages: usize,
    ) -> core::result::Result<u64, Status>;

    /// Return a page allocation
    ///
    /// # Safety
    /// `address` and `pages` must describe one allocation made by
    /// [`allocate_pages`](Self::allocate_pages) on this object.
    unsafe fn free_pages(&self, address: u64, pages: usize) -> Status;

    /// Hand an image in memory to the firmware loader
    fn load_image(&self, file_path: &[u8], image: &[u8]) -> core::result::Result<Handle, Status>;

    /// Set the device handle and load options of an image loaded with
    /// [`load_image`](Self::load_image)
    ///
    /// The firmware does not set a device handle for images loaded from
    /// memory.
    ///
    /// # Safety
    /// The firmware keeps a pointer to `options`; it must stay alive until
    /// the image is unloaded.
    unsafe fn configure_image(
        &self,
        image: Handle,
        device: Handle,
        options: Option<&[u16]>,
    ) -> core::result::Result<(), Status>;

    /// Start a loaded image and wait for it to return
    fn start_image(&self, image: Handle) -> ImageExit;

    /// Unload a loaded image
    fn unload_image(&self, image: Handle) -> Status;

    /// Call the entry point of a self-relocated image
    ///
    /// # Safety
    /// `entry` must point at the entry point of a fully laid-out and
    /// relocated image for this CPU.
    unsafe fn call_entry(&self, entry: u64) -> Status;
}

/// The fields of a loaded-image record the validated path rewrites
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageState {
    pub image_base: u64,
    pub image_size: u64,
    pub load_options: *const u16,
    pub load_options_size: u32,
    pub file_path: *const u8,
    pub device_handle: Handle,
}

/// The loaded-image record of the running loader
pub trait ActiveImage {
    /// Read the current record, `None` if the loader has none
    fn snapshot(&self) -> Option<ImageState>;

    /// Overwrite the record
    ///
    /// # Safety
    /// The pointers in `state` must stay valid until the record is restored.
    unsafe fn install(&self, state: &ImageState);

    /// Put back a record returned by [`snapshot`](Self::snapshot)
    fn restore(&self, saved: ImageState);
}

/// Signature verification and header parsing on the loader's behalf
pub trait TrustRoot {
    /// Check the signature of `data`
    fn verify(&self, data: &[u8]) -> core::result::Result<(), Status>;

    /// Parse the headers of `data`
    fn context(&self, data: &[u8]) -> Result<ImageContext> {
        header::parse_context(data)
    }
}

/// Platform secure boot state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecureBootMode {
    /// The variables could not be read
    Unknown,
    Disabled,
    /// Keys are not enrolled (`SetupMode=1`)
    Setup,
    Enabled,
}

impl SecureBootMode {
    /// Decode the `SecureBoot` and `SetupMode` variables
    pub fn from_variables(secure_boot: Option<u8>, setup_mode: Option<u8>) -> Self {
        match (secure_boot, setup_mode) {
            (None, _) => SecureBootMode::Unknown,
            (Some(1), Some(0)) => SecureBootMode::Enabled,
            (_, Some(1)) => SecureBootMode::Setup,
            _ => SecureBootMode::Disabled,
        }
    }
}

/// Everything the chainloader needs from the firmware
pub trait Firmware: BootServices + ActiveImage {
    /// Current secure boot state
    fn secure_boot_mode(&self) -> SecureBootMode;

    /// The installed trust root, if any
    fn trust_root(&self) -> Option<&dyn TrustRoot>;
}

/// Errors reported by a boot medium
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileError {
    NotFound,
    /// Fewer bytes than requested were available
    ShortRead,
    Io(Status),
}

impl From<FileError> for Error {
    fn from(err: FileError) -> Self {
        match err {
            FileError::NotFound => Error::FileNotFound,
            FileError::ShortRead => Error::PrematureEndOfFile,
            FileError::Io(status) => Error::Io(status),
        }
    }
}

/// An open file; closed when dropped
pub trait ImageFile {
    /// File size in bytes
    fn size(&self) -> u64;

    /// Fill `buffer` from the current position
    fn read_exact(&mut self, buffer: &mut [u8]) -> core::result::Result<(), FileError>;
}

/// The device the loader was started from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootDevice {
    pub handle: Handle,
    /// Device path of `handle`, `None` if it has none
    pub device_path: Option<Vec<u8>>,
}

/// File access on the boot device
pub trait BootMedia {
    /// Open `path` for reading
    fn open(&self, path: &str) -> core::result::Result<Box<dyn ImageFile + '_>, FileError>;

    /// The root device, if one was found
    fn root_device(&self) -> Option<RootDevice>;
}

/// A zeroed pool allocation, freed on drop
pub struct PoolBuffer<'fw> {
    bs: &'fw dyn BootServices,
    ptr: NonNull<u8>,
    size: usize,
}

impl<'fw> PoolBuffer<'fw> {
    /// Allocate and zero `size` bytes
    pub fn allocate(
        bs: &'fw dyn BootServices,
        memory_type: MemoryType,
        size: usize,
    ) -> Result<Self> {
        let ptr = bs.allocate_pool(memory_type, size).map_err(|status| {
            log::error!("Chainload: Pool allocation of {} bytes failed: {:?}", size, status);
            Error::OutOfMemory
        })?;

        // SAFETY: the pool just handed us `size` writable bytes at `ptr`
        unsafe { core::ptr::write_bytes(ptr.as_ptr(), 0, size) };

        Ok(Self { bs, ptr, size })
    }

    /// Address of the first byte
    pub fn address(&self) -> u64 {
        self.ptr.as_ptr() as u64
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the allocation is live and `size` bytes long while self exists
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.size) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` makes the borrow unique
        unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size) }
    }
}

impl Drop for PoolBuffer<'_> {
    fn drop(&mut self) {
        // SAFETY: `ptr` came from allocate_pool on `bs` and is not used again
        let status = unsafe { self.bs.free_pool(self.ptr) };
        if status != Status::SUCCESS {
            log::warn!("Chainload: free_pool({:#x}) failed: {:?}", self.address(), status);
        }
    }
}

/// A page allocation holding at least `size` bytes, freed on drop
pub struct PageRange<'fw> {
    bs: &'fw dyn BootServices,
    address: u64,
    pages: usize,
    size: usize,
}

impl<'fw> PageRange<'fw> {
    /// Allocate enough whole pages for `size` bytes
    pub fn allocate(
        bs: &'fw dyn BootServices,
        memory_type: MemoryType,
        size: usize,
    ) -> Result<Self> {
        let pages = pages_for(size);
        let address = bs.allocate_pages(memory_type, pages).map_err(|status| {
            log::error!("Chainload: Failed to allocate {} pages: {:?}", pages, status);
            Error::OutOfMemory
        })?;

        // Owned from here on, so the pages go back on every error path
        let range = Self {
            bs,
            address,
            pages,
            size,
        };
        if address == 0 {
            log::error!("Chainload: Page allocation returned address 0");
            return Err(Error::OutOfMemory);
        }
        Ok(range)
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn pages(&self) -> usize {
        self.pages
    }

    /// The first `size` bytes of the range
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the range is live and at least `size` bytes long
        unsafe { core::slice::from_raw_parts(self.address as *const u8, self.size) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` makes the borrow unique
        unsafe { core::slice::from_raw_parts_mut(self.address as *mut u8, self.size) }
    }
}

impl Drop for PageRange<'_> {
    fn drop(&mut self) {
        // SAFETY: address/pages describe the allocation made in `allocate`
        let status = unsafe { self.bs.free_pages(self.address, self.pages) };
        if status != Status::SUCCESS {
            log::warn!(
                "Chainload: free_pages({:#x}, {}) failed: {:?}",
                self.address,
                self.pages,
                status
            );
        }
    }
}
