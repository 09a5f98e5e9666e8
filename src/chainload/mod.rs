//! Chainloading of EFI applications
//!
//! [`Chainloader::prepare`] reads an image from the boot medium, builds its
//! device path and either hands it to the firmware loader or, when secure
//! boot is on, has the trust root verify it so it can be laid out and
//! relocated here instead. The result is a [`PendingChainload`], which the
//! boot menu later starts with [`PendingChainload::boot`] or drops.
//!
//! # Lifecycle
//!
//! ```text
//! prepare: open file -> device path -> allocate pages -> read
//!          -> verify (validated) | firmware load_image (firmware)
//! boot:    validated: parse -> lay out -> relocate -> swap active image
//!                     -> call entry -> restore active image
//!          firmware:  start_image -> unload_image
//! ```
//!
//! Everything acquired along the way is owned by a guard, so a failure at
//! any step releases what came before it. Only one chainload can be pending
//! at a time: the pending value borrows the chainloader mutably.

pub mod options;

use alloc::vec::Vec;
use core::ops::Range;

use r_efi::efi::{Handle, Status};

use crate::config::ChainloadConfig;
use crate::device_path;
use crate::error::{Error, Result};
use crate::firmware::{
    ActiveImage, BootMedia, BootServices, Firmware, ImageState, MemoryType, PageRange,
    SecureBootMode,
};
use crate::logger;
use crate::pe::{self, header, universal};

/// Loads secondary EFI images through one firmware
pub struct Chainloader<'fw, F: Firmware> {
    fw: &'fw F,
    config: ChainloadConfig,
}

/// How a prepared image will be started
enum Dispatch {
    /// Loaded by the firmware; the handle is unloaded when the chainload ends
    Firmware(Option<Handle>),
    /// Verified by the trust root (or forced); laid out by us at boot
    Validated,
}

/// A prepared chainload, waiting for the boot menu to start or drop it
pub struct PendingChainload<'c, 'fw, F: Firmware> {
    fw: &'fw F,
    _loader: &'c mut Chainloader<'fw, F>,
    file: PageRange<'fw>,
    image: Range<usize>,
    file_path: Vec<u8>,
    options: Option<Vec<u16>>,
    device: Handle,
    dispatch: Dispatch,
}

/// Restores the active image record when dropped
struct ActiveImageGuard<'a> {
    image: &'a dyn ActiveImage,
    saved: ImageState,
}

impl<'a> ActiveImageGuard<'a> {
    /// Save the current record and install `state`
    ///
    /// # Safety
    /// The pointers in `state` must outlive the guard.
    unsafe fn install(image: &'a dyn ActiveImage, state: &ImageState) -> Result<Self> {
        let saved = image.snapshot().ok_or_else(|| {
            log::error!("Chainload: No loaded image protocol for the running loader");
            Error::NoLoadedImage
        })?;
        // SAFETY: forwarded to the caller
        unsafe { image.install(state) };
        Ok(Self { image, saved })
    }
}

impl Drop for ActiveImageGuard<'_> {
    fn drop(&mut self) {
        self.image.restore(self.saved);
    }
}

impl<'fw, F: Firmware> Chainloader<'fw, F> {
    pub fn new(fw: &'fw F, config: ChainloadConfig) -> Self {
        logger::raise_level(config.log_level);
        Self { fw, config }
    }

    fn boot_services(&self) -> &'fw dyn BootServices {
        self.fw
    }

    /// Read and prepare an image for booting
    ///
    /// # Arguments
    /// * `media` - The boot medium holding the file
    /// * `args` - File name followed by the image's arguments
    ///
    /// # Returns
    /// A pending chainload. Dropping it without booting unloads the image.
    pub fn prepare<'c>(
        &'c mut self,
        media: &dyn BootMedia,
        args: &[&str],
    ) -> Result<PendingChainload<'c, 'fw, F>> {
        let Some((&filename, image_args)) = args.split_first() else {
            log::error!("Chainload: No filename given");
            return Err(Error::FilenameExpected);
        };

        let options = options::encode(image_args)?;

        let mut file = media.open(filename).map_err(|err| {
            log::error!("Chainload: Cannot open {}: {:?}", filename, err);
            Error::from(err)
        })?;

        let root = media.root_device();
        let device = root.as_ref().map_or(core::ptr::null_mut(), |r| r.handle);
        let Some(device_path) = root.and_then(|r| r.device_path) else {
            log::error!("Chainload: Root device has no device path");
            return Err(Error::NotARootDevice);
        };

        let file_path = device_path::make_file_path(&device_path, filename)?;
        if let Ok(components) = device_path::file_path_components(&file_path) {
            log::info!("Chainload: file path: {}", components.join("\\"));
        }

        let size = file.size();
        if size == 0 {
            log::error!("Chainload: {} is empty", filename);
            return Err(Error::PrematureEndOfFile);
        }
        if size > self.config.max_image_size {
            log::error!(
                "Chainload: {} is {} bytes, limit is {}",
                filename,
                size,
                self.config.max_image_size
            );
            return Err(Error::ImageTooLarge { size });
        }
        let size = usize::try_from(size).map_err(|_| Error::ImageTooLarge { size })?;

        let mut pages = PageRange::allocate(self.boot_services(), MemoryType::LoaderCode, size)?;
        file.read_exact(pages.as_mut_slice()).map_err(|err| {
            log::error!("Chainload: Reading {} failed: {:?}", filename, err);
            Error::from(err)
        })?;
        drop(file);

        let image = self.select_image(pages.as_slice())?;
        let dispatch = self.dispatch(&pages.as_slice()[image.clone()], &file_path)?;

        let mut pending = PendingChainload {
            fw: self.fw,
            _loader: self,
            file: pages,
            image,
            file_path,
            options,
            device,
            dispatch,
        };
        pending.configure_firmware_image()?;

        log::info!(
            "Chainload: Prepared {} ({} bytes, {})",
            filename,
            pending.image.len(),
            if pending.is_validated() {
                "validated"
            } else {
                "firmware"
            }
        );

        Ok(pending)
    }

    /// The range of the file that holds the image
    fn select_image(&self, data: &[u8]) -> Result<Range<usize>> {
        if self.config.universal_binaries {
            if let Some(cpu_type) = universal::HOST_CPU_TYPE {
                if let Some(range) = universal::select_slice(data, cpu_type)? {
                    return Ok(range);
                }
            }
        }
        Ok(0..data.len())
    }

    /// Decide how the image will be started
    fn dispatch(&self, image: &[u8], file_path: &[u8]) -> Result<Dispatch> {
        if self.config.debug_secure_boot {
            log::warn!("Chainload: Secure boot debugging on, skipping verification");
            return Ok(Dispatch::Validated);
        }

        if self.fw.secure_boot_mode() == SecureBootMode::Enabled {
            let Some(trust_root) = self.fw.trust_root() else {
                log::error!("Chainload: Secure boot is on but no shim lock protocol is installed");
                return Err(Error::NoShimLock);
            };
            return match trust_root.verify(image) {
                Ok(()) => {
                    log::debug!("Chainload: Image verified");
                    Ok(Dispatch::Validated)
                }
                Err(status) => {
                    log::error!("Chainload: Verification failed: {:?}", status);
                    Err(Error::VerifyFailed)
                }
            };
        }

        let handle = self.fw.load_image(file_path, image).map_err(|status| {
            log::error!("Chainload: Firmware LoadImage failed: {:?}", status);
            if status == Status::OUT_OF_RESOURCES {
                Error::OutOfResources
            } else {
                Error::CannotLoadImage(status)
            }
        })?;
        Ok(Dispatch::Firmware(Some(handle)))
    }
}

impl<'c, 'fw, F: Firmware> PendingChainload<'c, 'fw, F> {
    /// Whether the image will be laid out and started by us
    pub fn is_validated(&self) -> bool {
        matches!(self.dispatch, Dispatch::Validated)
    }

    /// The device path built for the image
    pub fn file_path(&self) -> &[u8] {
        &self.file_path
    }

    /// The image bytes (after universal binary slicing)
    pub fn image(&self) -> &[u8] {
        &self.file.as_slice()[self.image.clone()]
    }

    /// Set device handle and load options on a firmware-loaded image
    fn configure_firmware_image(&mut self) -> Result<()> {
        let Dispatch::Firmware(Some(handle)) = self.dispatch else {
            return Ok(());
        };
        // SAFETY: `options` lives in self until the image is unloaded
        unsafe {
            self.fw
                .configure_image(handle, self.device, self.options.as_deref())
        }
        .map_err(|status| {
            log::error!("Chainload: Cannot configure loaded image: {:?}", status);
            Error::NoLoadedImage
        })
    }

    /// Start the image
    ///
    /// Returns when the image exits. A failure status from the image is
    /// returned as [`Error::ImageFailed`].
    pub fn boot(mut self) -> Result<()> {
        match &mut self.dispatch {
            Dispatch::Firmware(handle) => {
                let Some(handle) = handle.take() else {
                    return Err(Error::NoLoadedImage);
                };
                self.boot_firmware(handle)
            }
            Dispatch::Validated => self.boot_validated(),
        }
    }

    fn boot_firmware(&self, handle: Handle) -> Result<()> {
        log::info!("Chainload: Starting image");
        let exit = self.fw.start_image(handle);

        let status = self.fw.unload_image(handle);
        if status != Status::SUCCESS {
            log::warn!("Chainload: UnloadImage failed: {:?}", status);
        }

        if exit.status == Status::SUCCESS {
            return Ok(());
        }

        let message = exit
            .exit_data
            .as_deref()
            .map(options::exit_message)
            .unwrap_or_default();
        log::error!(
            "Chainload: Image returned {:?}: {}",
            exit.status,
            if message.is_empty() {
                "unknown error"
            } else {
                message.as_str()
            }
        );
        Err(Error::ImageFailed {
            status: exit.status,
            message,
        })
    }

    fn boot_validated(&self) -> Result<()> {
        let data = self.image();

        let context = match self.fw.trust_root() {
            Some(trust_root) => trust_root.context(data)?,
            None => header::parse_context(data)?,
        };

        let loaded = pe::load_image(self.fw as &dyn BootServices, data, &context)?;

        let offset = device_path::media_file_path(&self.file_path)?.ok_or_else(|| {
            log::error!("Chainload: No file path node in the built device path");
            Error::NoMatchingFilePath
        })?;

        let (load_options, load_options_size) = match &self.options {
            Some(options) => (options.as_ptr(), options::size_in_bytes(options)),
            None => (core::ptr::null(), 0),
        };

        let state = ImageState {
            image_base: loaded.image_base(),
            image_size: loaded.image_size(),
            load_options,
            load_options_size,
            file_path: self.file_path[offset..].as_ptr(),
            device_handle: self.device,
        };

        // SAFETY: `loaded`, `options` and `file_path` outlive the guard
        let guard = unsafe { ActiveImageGuard::install(self.fw, &state)? };

        log::info!(
            "Chainload: Calling entry point {:#x} (image at {:#x})",
            loaded.entry_point(),
            loaded.image_base()
        );
        // SAFETY: the image was laid out and relocated by pe::load_image
        let status = unsafe { self.fw.call_entry(loaded.entry_point()) };

        drop(guard);
        drop(loaded);

        if status != Status::SUCCESS {
            log::error!("Chainload: Image returned {:?}", status);
            return Err(Error::ImageFailed {
                status,
                message: heapless::String::new(),
            });
        }
        Ok(())
    }

    /// Drop the prepared image without starting it
    pub fn unload(self) {
        log::debug!("Chainload: Unloading prepared image");
    }
}

impl<F: Firmware> Drop for PendingChainload<'_, '_, F> {
    fn drop(&mut self) {
        if let Dispatch::Firmware(Some(handle)) = self.dispatch {
            let status = self.fw.unload_image(handle);
            if status != Status::SUCCESS {
                log::warn!("Chainload: UnloadImage failed: {:?}", status);
            }
        }
    }
}
