//! UEFI boot services backend
//!
//! Implements the firmware traits on top of a real EFI system table, as
//! handed to the host loader's entry point. Every call goes through the
//! raw r-efi function tables.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::ffi::c_void;
use core::ptr::NonNull;

use r_efi::efi::{self, Boolean, Char16, Guid, Handle, Status, SystemTable};
use r_efi::protocols::{device_path, file, loaded_image, simple_file_system, simple_text_output};
use zerocopy::FromBytes;

use super::{
    ActiveImage, BootMedia, BootServices, FileError, Firmware, ImageExit, ImageFile, ImageState,
    MemoryType, RootDevice, SecureBootMode, TrustRoot,
};
use crate::error::{Error, Result};
use crate::logger::LogSink;
use crate::pe::{DataDirectory, ImageContext};

/// EFI Global Variable GUID
pub const EFI_GLOBAL_VARIABLE_GUID: Guid = Guid::from_fields(
    0x8BE4DF61,
    0x93CA,
    0x11D2,
    0xAA,
    0x0D,
    &[0x00, 0xE0, 0x98, 0x03, 0x2B, 0x8C],
);

/// Shim lock protocol GUID
/// {605DAB50-E046-4300-ABB6-3DD810DD8B23}
pub const SHIM_LOCK_GUID: Guid = Guid::from_fields(
    0x605DAB50,
    0xE046,
    0x4300,
    0xAB,
    0xB6,
    &[0x3D, 0xD8, 0x10, 0xDD, 0x8B, 0x23],
);

/// "SecureBoot" in UCS-2
static SECURE_BOOT_NAME: [Char16; 11] = [
    b'S' as u16,
    b'e' as u16,
    b'c' as u16,
    b'u' as u16,
    b'r' as u16,
    b'e' as u16,
    b'B' as u16,
    b'o' as u16,
    b'o' as u16,
    b't' as u16,
    0,
];

/// "SetupMode" in UCS-2
static SETUP_MODE_NAME: [Char16; 10] = [
    b'S' as u16,
    b'e' as u16,
    b't' as u16,
    b'u' as u16,
    b'p' as u16,
    b'M' as u16,
    b'o' as u16,
    b'd' as u16,
    b'e' as u16,
    0,
];

/// Longest device path we copy out of firmware memory
const MAX_DEVICE_PATH: usize = 4096;

/// Image context as filled in by the shim lock protocol
#[repr(C)]
#[allow(dead_code)]
struct PeCoffLoaderImageContext {
    image_address: u64,
    image_size: u64,
    entry_point: u64,
    size_of_headers: usize,
    image_type: u16,
    number_of_sections: u16,
    first_section: *const u8,
    reloc_dir: *const u8,
    sec_dir: *const u8,
    number_of_rva_and_sizes: u64,
    pe_hdr: *const u8,
}

/// Shim lock protocol
#[repr(C)]
#[allow(dead_code)]
struct ShimLockProtocol {
    verify: extern "efiapi" fn(buffer: *mut c_void, size: u32) -> Status,
    hash: extern "efiapi" fn(
        data: *mut c_void,
        size: i32,
        context: *mut PeCoffLoaderImageContext,
        sha256: *mut u8,
        sha1: *mut u8,
    ) -> Status,
    context: extern "efiapi" fn(
        data: *mut c_void,
        size: u32,
        context: *mut PeCoffLoaderImageContext,
    ) -> Status,
}

/// The shim lock protocol as a trust root
pub struct ShimLock {
    protocol: *mut ShimLockProtocol,
}

/// Offset of `ptr` inside `data`, if it points into it
fn offset_in(data: &[u8], ptr: *const u8) -> Option<u64> {
    let start = data.as_ptr() as usize;
    let at = (ptr as usize).checked_sub(start)?;
    (at < data.len()).then_some(at as u64)
}

impl TrustRoot for ShimLock {
    fn verify(&self, data: &[u8]) -> core::result::Result<(), Status> {
        let size = u32::try_from(data.len()).map_err(|_| Status::BAD_BUFFER_SIZE)?;
        // SAFETY: the protocol was located at startup and shim never uninstalls it
        let status = unsafe { ((*self.protocol).verify)(data.as_ptr() as *mut c_void, size) };
        if status == Status::SUCCESS {
            Ok(())
        } else {
            Err(status)
        }
    }

    fn context(&self, data: &[u8]) -> Result<ImageContext> {
        let size = u32::try_from(data.len()).map_err(|_| Error::ContextInvalidParameter)?;
        let mut raw = PeCoffLoaderImageContext {
            image_address: 0,
            image_size: 0,
            entry_point: 0,
            size_of_headers: 0,
            image_type: 0,
            number_of_sections: 0,
            first_section: core::ptr::null(),
            reloc_dir: core::ptr::null(),
            sec_dir: core::ptr::null(),
            number_of_rva_and_sizes: 0,
            pe_hdr: core::ptr::null(),
        };

        // SAFETY: as in verify; `raw` is a valid out parameter
        let status =
            unsafe { ((*self.protocol).context)(data.as_ptr() as *mut c_void, size, &mut raw) };
        if status != Status::SUCCESS {
            log::error!("ShimLock: Context failed: {:?}", status);
            return Err(if status == Status::UNSUPPORTED {
                Error::ContextUnsupported
            } else if status == Status::INVALID_PARAMETER {
                Error::ContextInvalidParameter
            } else {
                Error::ContextError(status)
            });
        }

        // Shim hands back pointers into `data`; turn them back into offsets
        let section_table_offset = offset_in(data, raw.first_section)
            .ok_or(Error::InvalidHeader("section table"))?;
        let reloc_dir = match offset_in(data, raw.reloc_dir) {
            Some(offset) => data
                .get(offset as usize..)
                .and_then(|rest| DataDirectory::read_from_prefix(rest).ok())
                .map(|(dir, _)| dir)
                .ok_or(Error::InvalidHeader("data directory"))?,
            None => DataDirectory::default(),
        };

        // SectionAlignment sits 32 bytes into the optional header, which
        // follows the 4-byte signature and the 20-byte COFF header
        let pe_offset =
            offset_in(data, raw.pe_hdr).ok_or(Error::InvalidHeader("PE signature"))? as usize;
        let section_alignment = data
            .get(pe_offset + 56..pe_offset + 60)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .ok_or(Error::InvalidHeader("optional header too small"))?;
        if !section_alignment.is_power_of_two() {
            return Err(Error::InvalidSectionAlignment(section_alignment));
        }

        Ok(ImageContext {
            image_address: raw.image_address,
            image_size: raw.image_size,
            entry_point: raw.entry_point,
            size_of_headers: raw.size_of_headers as u64,
            number_of_sections: raw.number_of_sections,
            section_table_offset,
            reloc_dir,
            number_of_rva_and_sizes: raw.number_of_rva_and_sizes,
            section_alignment,
        })
    }
}

/// Firmware services of the running EFI environment
pub struct EfiFirmware {
    image_handle: Handle,
    system_table: *mut SystemTable,
    shim_lock: Option<ShimLock>,
}

impl EfiFirmware {
    /// Wrap the image handle and system table passed to the loader's entry
    ///
    /// # Safety
    /// Both must be the values the firmware passed in, and boot services
    /// must not have been exited.
    pub unsafe fn new(image_handle: Handle, system_table: *mut SystemTable) -> Self {
        let mut fw = Self {
            image_handle,
            system_table,
            shim_lock: None,
        };

        let mut guid = SHIM_LOCK_GUID;
        let mut interface: *mut c_void = core::ptr::null_mut();
        let status =
            (fw.bs().locate_protocol)(&mut guid, core::ptr::null_mut(), &mut interface);
        if status == Status::SUCCESS && !interface.is_null() {
            log::info!("EFI: Shim lock protocol found");
            fw.shim_lock = Some(ShimLock {
                protocol: interface as *mut ShimLockProtocol,
            });
        }

        fw
    }

    fn bs(&self) -> &efi::BootServices {
        // SAFETY: checked by the caller of `new`
        unsafe { &*(*self.system_table).boot_services }
    }

    fn rt(&self) -> &efi::RuntimeServices {
        // SAFETY: checked by the caller of `new`
        unsafe { &*(*self.system_table).runtime_services }
    }

    /// Open `guid` on `handle`
    fn handle_protocol(&self, handle: Handle, guid: &Guid) -> Option<*mut c_void> {
        let mut guid = *guid;
        let mut interface: *mut c_void = core::ptr::null_mut();
        let status = (self.bs().handle_protocol)(handle, &mut guid, &mut interface);
        (status == Status::SUCCESS && !interface.is_null()).then_some(interface)
    }

    fn loaded_image(&self) -> Option<*mut loaded_image::Protocol> {
        self.handle_protocol(self.image_handle, &loaded_image::PROTOCOL_GUID)
            .map(|p| p as *mut loaded_image::Protocol)
    }

    /// Read a one-byte global variable
    fn read_flag(&self, name: &[Char16]) -> Option<u8> {
        let mut guid = EFI_GLOBAL_VARIABLE_GUID;
        let mut attributes: u32 = 0;
        let mut value = [0u8; 1];
        let mut size = value.len();
        let status = (self.rt().get_variable)(
            name.as_ptr() as *mut Char16,
            &mut guid,
            &mut attributes,
            &mut size,
            value.as_mut_ptr() as *mut c_void,
        );
        (status == Status::SUCCESS && size == 1).then_some(value[0])
    }

    /// Copy a device path out of firmware memory, up to and including its
    /// end node
    ///
    /// # Safety
    /// `ptr` must point at a readable device path.
    unsafe fn copy_device_path(ptr: *const u8) -> Option<Vec<u8>> {
        let mut length = 0usize;
        loop {
            // SAFETY: every node has at least a 4-byte header
            let header = unsafe { core::slice::from_raw_parts(ptr.add(length), 4) };
            let node = u16::from_le_bytes([header[2], header[3]]) as usize;
            if node < 4 || length + node > MAX_DEVICE_PATH {
                log::warn!("EFI: Bad device path node of length {}", node);
                return None;
            }
            length += node;
            if header[0] == device_path::TYPE_END && header[1] == device_path::End::SUBTYPE_ENTIRE {
                break;
            }
        }
        // SAFETY: the walk above stayed inside the path
        Some(unsafe { core::slice::from_raw_parts(ptr, length) }.to_vec())
    }

    /// The loader's own boot volume
    pub fn boot_volume(&self) -> Option<EfiVolume<'_>> {
        let li = self.loaded_image()?;
        // SAFETY: the protocol belongs to our own image and outlives us
        let device = unsafe { (*li).device_handle };
        if device.is_null() {
            log::warn!("EFI: Loader has no device handle");
            return None;
        }
        let fs = self.handle_protocol(device, &simple_file_system::PROTOCOL_GUID)?;
        Some(EfiVolume {
            fw: self,
            device,
            fs: fs as *mut simple_file_system::Protocol,
        })
    }
}

impl BootServices for EfiFirmware {
    fn allocate_pool(
        &self,
        memory_type: MemoryType,
        size: usize,
    ) -> core::result::Result<NonNull<u8>, Status> {
        let mut buffer: *mut c_void = core::ptr::null_mut();
        let status = (self.bs().allocate_pool)(memory_type.as_efi(), size, &mut buffer);
        if status != Status::SUCCESS {
            return Err(status);
        }
        NonNull::new(buffer as *mut u8).ok_or(Status::OUT_OF_RESOURCES)
    }

    unsafe fn free_pool(&self, buffer: NonNull<u8>) -> Status {
        (self.bs().free_pool)(buffer.as_ptr() as *mut c_void)
    }

    fn allocate_pages(
        &self,
        memory_type: MemoryType,
        pages: usize,
    ) -> core::result::Result<u64, Status> {
        let mut address: efi::PhysicalAddress = 0;
        let status = (self.bs().allocate_pages)(
            efi::ALLOCATE_ANY_PAGES,
            memory_type.as_efi(),
            pages,
            &mut address,
        );
        if status == Status::SUCCESS {
            Ok(address)
        } else {
            Err(status)
        }
    }

    unsafe fn free_pages(&self, address: u64, pages: usize) -> Status {
        (self.bs().free_pages)(address, pages)
    }

    fn load_image(&self, file_path: &[u8], image: &[u8]) -> core::result::Result<Handle, Status> {
        let mut handle: Handle = core::ptr::null_mut();
        let status = (self.bs().load_image)(
            Boolean::FALSE,
            self.image_handle,
            file_path.as_ptr() as *mut device_path::Protocol,
            image.as_ptr() as *mut c_void,
            image.len(),
            &mut handle,
        );
        if status == Status::SUCCESS {
            Ok(handle)
        } else {
            Err(status)
        }
    }

    unsafe fn configure_image(
        &self,
        image: Handle,
        device: Handle,
        options: Option<&[u16]>,
    ) -> core::result::Result<(), Status> {
        let li = self
            .handle_protocol(image, &loaded_image::PROTOCOL_GUID)
            .ok_or(Status::NOT_FOUND)? as *mut loaded_image::Protocol;

        // SAFETY: the firmware just created this protocol for `image`
        unsafe {
            (*li).device_handle = device;
            match options {
                Some(options) => {
                    (*li).load_options = options.as_ptr() as *mut c_void;
                    (*li).load_options_size = (options.len() * 2) as u32;
                }
                None => {
                    (*li).load_options = core::ptr::null_mut();
                    (*li).load_options_size = 0;
                }
            }
        }
        Ok(())
    }

    fn start_image(&self, image: Handle) -> ImageExit {
        let mut exit_data_size: usize = 0;
        let mut exit_data: *mut Char16 = core::ptr::null_mut();
        let status = (self.bs().start_image)(image, &mut exit_data_size, &mut exit_data);

        let data = NonNull::new(exit_data as *mut u8).map(|ptr| {
            let units = exit_data_size / 2;
            // SAFETY: the image handed us `exit_data_size` bytes of pool memory
            let copy: Vec<u16> = unsafe { core::slice::from_raw_parts(exit_data, units) }
                .iter()
                .copied()
                .take_while(|&unit| unit != 0)
                .collect();
            // SAFETY: exit data is pool memory owned by the caller of StartImage
            unsafe { self.free_pool(ptr) };
            copy
        });

        ImageExit {
            status,
            exit_data: data,
        }
    }

    fn unload_image(&self, image: Handle) -> Status {
        (self.bs().unload_image)(image)
    }

    unsafe fn call_entry(&self, entry: u64) -> Status {
        // SAFETY: forwarded to the caller; EFI entry points use this ABI
        let entry: extern "efiapi" fn(Handle, *mut SystemTable) -> Status =
            unsafe { core::mem::transmute(entry as usize) };
        entry(self.image_handle, self.system_table)
    }
}

impl ActiveImage for EfiFirmware {
    fn snapshot(&self) -> Option<ImageState> {
        let li = self.loaded_image()?;
        // SAFETY: our own loaded image protocol
        let li = unsafe { &*li };
        Some(ImageState {
            image_base: li.image_base as u64,
            image_size: li.image_size,
            load_options: li.load_options as *const u16,
            load_options_size: li.load_options_size,
            file_path: li.file_path as *const u8,
            device_handle: li.device_handle,
        })
    }

    unsafe fn install(&self, state: &ImageState) {
        let Some(li) = self.loaded_image() else {
            return;
        };
        // SAFETY: our own loaded image protocol; pointer lifetimes are the
        // caller's contract
        unsafe {
            (*li).image_base = state.image_base as *mut c_void;
            (*li).image_size = state.image_size;
            (*li).load_options = state.load_options as *mut c_void;
            (*li).load_options_size = state.load_options_size;
            (*li).file_path = state.file_path as *mut device_path::Protocol;
            (*li).device_handle = state.device_handle;
        }
    }

    fn restore(&self, saved: ImageState) {
        // SAFETY: `saved` came from snapshot, so its pointers are the
        // firmware's own
        unsafe { self.install(&saved) };
    }
}

impl Firmware for EfiFirmware {
    fn secure_boot_mode(&self) -> SecureBootMode {
        let mode = SecureBootMode::from_variables(
            self.read_flag(&SECURE_BOOT_NAME),
            self.read_flag(&SETUP_MODE_NAME),
        );
        log::debug!("EFI: Secure boot mode {:?}", mode);
        mode
    }

    fn trust_root(&self) -> Option<&dyn TrustRoot> {
        self.shim_lock.as_ref().map(|s| s as &dyn TrustRoot)
    }
}

/// A FAT volume reached through the simple file system protocol
pub struct EfiVolume<'fw> {
    fw: &'fw EfiFirmware,
    device: Handle,
    fs: *mut simple_file_system::Protocol,
}

/// An open file on an [`EfiVolume`]
struct EfiFile {
    file: *mut file::Protocol,
    size: u64,
}

impl Drop for EfiFile {
    fn drop(&mut self) {
        // SAFETY: opened by EfiVolume::open and not closed elsewhere
        unsafe { ((*self.file).close)(self.file) };
    }
}

impl ImageFile for EfiFile {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_exact(&mut self, buffer: &mut [u8]) -> core::result::Result<(), FileError> {
        let mut done = 0;
        while done < buffer.len() {
            let mut chunk = buffer.len() - done;
            // SAFETY: open file, and the destination is the rest of `buffer`
            let status = unsafe {
                ((*self.file).read)(
                    self.file,
                    &mut chunk,
                    buffer[done..].as_mut_ptr() as *mut c_void,
                )
            };
            if status != Status::SUCCESS {
                return Err(FileError::Io(status));
            }
            if chunk == 0 {
                return Err(FileError::ShortRead);
            }
            done += chunk;
        }
        Ok(())
    }
}

/// Map a file protocol status
fn file_status(status: Status) -> core::result::Result<(), FileError> {
    if status == Status::SUCCESS {
        Ok(())
    } else {
        Err(FileError::Io(status))
    }
}

/// UCS-2 form of a textual path: device name stripped, `\` separated,
/// NUL terminated
fn volume_path(path: &str) -> Vec<Char16> {
    let path = path.find(')').map_or(path, |end| &path[end + 1..]);
    path.encode_utf16()
        .map(|unit| if unit == u16::from(b'/') { u16::from(b'\\') } else { unit })
        .chain(core::iter::once(0))
        .collect()
}

impl BootMedia for EfiVolume<'_> {
    fn open(&self, path: &str) -> core::result::Result<Box<dyn ImageFile + '_>, FileError> {
        let mut name = volume_path(path);

        let mut root: *mut file::Protocol = core::ptr::null_mut();
        // SAFETY: the protocol was looked up on a live handle
        file_status(unsafe { ((*self.fs).open_volume)(self.fs, &mut root) })?;

        let mut handle: *mut file::Protocol = core::ptr::null_mut();
        // SAFETY: `root` was just opened; `name` is NUL terminated
        let status = unsafe {
            let status = ((*root).open)(root, &mut handle, name.as_mut_ptr(), file::MODE_READ, 0);
            ((*root).close)(root);
            status
        };
        if status == Status::NOT_FOUND {
            return Err(FileError::NotFound);
        }
        if status != Status::SUCCESS {
            return Err(FileError::Io(status));
        }

        let mut file = EfiFile {
            file: handle,
            size: 0,
        };
        // Seeking to the end reports the size
        // SAFETY: `handle` is open
        unsafe {
            file_status(((*handle).set_position)(handle, u64::MAX))?;
            file_status(((*handle).get_position)(handle, &mut file.size))?;
            file_status(((*handle).set_position)(handle, 0))?;
        }

        Ok(Box::new(file))
    }

    fn root_device(&self) -> Option<RootDevice> {
        let device_path = self
            .fw
            .handle_protocol(self.device, &device_path::PROTOCOL_GUID)
            // SAFETY: the firmware installed a device path on the handle
            .and_then(|path| unsafe { EfiFirmware::copy_device_path(path as *const u8) });
        Some(RootDevice {
            handle: self.device,
            device_path,
        })
    }
}

/// Log sink writing to the firmware text console
pub struct ConOutSink {
    con_out: *mut simple_text_output::Protocol,
}

// SAFETY: boot services run on a single CPU; the console is only touched
// from the logger, which serializes writes
unsafe impl Sync for ConOutSink {}
unsafe impl Send for ConOutSink {}

impl ConOutSink {
    /// # Safety
    /// `system_table` must be valid for as long as the sink is used.
    pub unsafe fn new(system_table: *mut SystemTable) -> Self {
        Self {
            con_out: unsafe { (*system_table).con_out },
        }
    }
}

impl LogSink for ConOutSink {
    fn write_str(&self, s: &str) {
        if self.con_out.is_null() {
            return;
        }
        let mut buffer = [0 as Char16; 65];
        let mut len = 0;
        let flush = |buffer: &mut [Char16; 65], len: &mut usize| {
            buffer[*len] = 0;
            // SAFETY: valid console protocol, NUL terminated buffer
            unsafe { ((*self.con_out).output_string)(self.con_out, buffer.as_mut_ptr()) };
            *len = 0;
        };
        for unit in s.encode_utf16() {
            buffer[len] = unit;
            len += 1;
            if len == buffer.len() - 1 {
                flush(&mut buffer, &mut len);
            }
        }
        if len > 0 {
            flush(&mut buffer, &mut len);
        }
    }
}
