//! In-memory firmware for tests
//!
//! `MockFirmware` hands out real heap memory for pool and page allocations
//! (so loaded images can be inspected byte for byte) and records every call
//! the chainloader makes. `MemoryMedia` serves files from a map.

use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;
use core::cell::{Cell, RefCell};
use core::ffi::c_void;
use core::ptr::NonNull;

use r_efi::efi::{Handle, Status};

use super::{
    ActiveImage, BootMedia, BootServices, FileError, Firmware, ImageExit, ImageFile, ImageState,
    MemoryType, RootDevice, SecureBootMode, TrustRoot, PAGE_SIZE,
};
use crate::error::Result;
use crate::pe::ImageContext;

/// Handle returned by the mock `load_image`
pub const MOCK_IMAGE_HANDLE: usize = 0x1ae0;

/// Device handle of the mock root device
pub const MOCK_DEVICE_HANDLE: usize = 0xde7;

pub fn handle(value: usize) -> Handle {
    value as *mut c_void
}

/// Trust root with canned answers
#[derive(Default)]
pub struct MockTrustRoot {
    /// Status `verify` fails with, `None` to pass
    pub reject: Option<Status>,
    /// Context to return instead of parsing the image
    pub context: Option<ImageContext>,
}

impl TrustRoot for MockTrustRoot {
    fn verify(&self, _data: &[u8]) -> core::result::Result<(), Status> {
        match self.reject {
            Some(status) => Err(status),
            None => Ok(()),
        }
    }

    fn context(&self, data: &[u8]) -> Result<ImageContext> {
        match &self.context {
            Some(context) => Ok(context.clone()),
            None => crate::pe::header::parse_context(data),
        }
    }
}

/// What the mock saw when an entry point was called
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryCall {
    pub entry: u64,
    /// Active image record at the time of the call
    pub state: Option<ImageState>,
    /// Copy of the load options the record pointed at
    pub options: Vec<u16>,
    /// Copy of the file path the record pointed at (up to its end node)
    pub file_path: Vec<u8>,
}

/// An image handed to the mock firmware loader
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadCall {
    pub file_path: Vec<u8>,
    pub image: Vec<u8>,
}

pub struct MockFirmware {
    allocations: RefCell<BTreeMap<u64, Layout>>,
    fail_allocations: Cell<bool>,
    /// Report page allocations as succeeding at address 0
    pub zero_page_address: Cell<bool>,
    pub freed_pages: RefCell<Vec<(u64, usize)>>,
    pub secure_boot: Cell<SecureBootMode>,
    pub trust_root: Option<MockTrustRoot>,
    pub load_status: Cell<Status>,
    pub exit: RefCell<ImageExit>,
    pub entry_status: Cell<Status>,
    pub loads: RefCell<Vec<LoadCall>>,
    pub configured: RefCell<Vec<(Handle, Option<Vec<u16>>)>>,
    pub unloads: RefCell<Vec<Handle>>,
    pub entry_calls: RefCell<Vec<EntryCall>>,
    active: RefCell<Option<ImageState>>,
}

impl MockFirmware {
    pub fn new() -> Self {
        Self {
            allocations: RefCell::new(BTreeMap::new()),
            fail_allocations: Cell::new(false),
            zero_page_address: Cell::new(false),
            freed_pages: RefCell::new(Vec::new()),
            secure_boot: Cell::new(SecureBootMode::Disabled),
            trust_root: None,
            load_status: Cell::new(Status::SUCCESS),
            exit: RefCell::new(ImageExit {
                status: Status::SUCCESS,
                exit_data: None,
            }),
            entry_status: Cell::new(Status::SUCCESS),
            loads: RefCell::new(Vec::new()),
            configured: RefCell::new(Vec::new()),
            unloads: RefCell::new(Vec::new()),
            entry_calls: RefCell::new(Vec::new()),
            active: RefCell::new(Some(Self::loader_image())),
        }
    }

    /// Firmware with secure boot on and a trust root installed
    pub fn secure(trust_root: MockTrustRoot) -> Self {
        let mut fw = Self::new();
        fw.trust_root = Some(trust_root);
        fw.secure_boot.set(SecureBootMode::Enabled);
        fw
    }

    /// The record the mock starts with
    pub fn loader_image() -> ImageState {
        ImageState {
            image_base: 0x7f00_0000,
            image_size: 0x4_0000,
            load_options: core::ptr::null(),
            load_options_size: 0,
            file_path: core::ptr::null(),
            device_handle: handle(0x5a5a),
        }
    }

    pub fn fail_allocations(&self, fail: bool) {
        self.fail_allocations.set(fail);
    }

    pub fn live_allocations(&self) -> usize {
        self.allocations.borrow().len()
    }

    pub fn active_image(&self) -> Option<ImageState> {
        *self.active.borrow()
    }

    pub fn clear_active_image(&self) {
        *self.active.borrow_mut() = None;
    }

    fn allocate(&self, layout: Layout) -> core::result::Result<NonNull<u8>, Status> {
        if self.fail_allocations.get() {
            return Err(Status::OUT_OF_RESOURCES);
        }
        // SAFETY: layout has a nonzero size
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or(Status::OUT_OF_RESOURCES)?;
        self.allocations
            .borrow_mut()
            .insert(ptr.as_ptr() as u64, layout);
        Ok(ptr)
    }

    fn release(&self, address: u64) -> Status {
        match self.allocations.borrow_mut().remove(&address) {
            Some(layout) => {
                // SAFETY: the address was returned by `allocate` with this layout
                unsafe { dealloc(address as *mut u8, layout) };
                Status::SUCCESS
            }
            None => Status::INVALID_PARAMETER,
        }
    }
}

impl Drop for MockFirmware {
    fn drop(&mut self) {
        let live: Vec<u64> = self.allocations.borrow().keys().copied().collect();
        for address in live {
            self.release(address);
        }
    }
}

impl BootServices for MockFirmware {
    fn allocate_pool(
        &self,
        _memory_type: MemoryType,
        size: usize,
    ) -> core::result::Result<NonNull<u8>, Status> {
        let layout =
            Layout::from_size_align(size.max(1), 8).map_err(|_| Status::INVALID_PARAMETER)?;
        self.allocate(layout)
    }

    unsafe fn free_pool(&self, buffer: NonNull<u8>) -> Status {
        self.release(buffer.as_ptr() as u64)
    }

    fn allocate_pages(
        &self,
        _memory_type: MemoryType,
        pages: usize,
    ) -> core::result::Result<u64, Status> {
        if self.zero_page_address.get() {
            return Ok(0);
        }
        let layout = Layout::from_size_align(pages.max(1) * PAGE_SIZE, PAGE_SIZE)
            .map_err(|_| Status::INVALID_PARAMETER)?;
        self.allocate(layout).map(|ptr| ptr.as_ptr() as u64)
    }

    unsafe fn free_pages(&self, address: u64, pages: usize) -> Status {
        self.freed_pages.borrow_mut().push((address, pages));
        if address == 0 {
            return Status::SUCCESS;
        }
        self.release(address)
    }

    fn load_image(&self, file_path: &[u8], image: &[u8]) -> core::result::Result<Handle, Status> {
        self.loads.borrow_mut().push(LoadCall {
            file_path: file_path.to_vec(),
            image: image.to_vec(),
        });
        let status = self.load_status.get();
        if status == Status::SUCCESS {
            Ok(handle(MOCK_IMAGE_HANDLE))
        } else {
            Err(status)
        }
    }

    unsafe fn configure_image(
        &self,
        _image: Handle,
        device: Handle,
        options: Option<&[u16]>,
    ) -> core::result::Result<(), Status> {
        self.configured
            .borrow_mut()
            .push((device, options.map(|o| o.to_vec())));
        Ok(())
    }

    fn start_image(&self, _image: Handle) -> ImageExit {
        self.exit.borrow().clone()
    }

    fn unload_image(&self, image: Handle) -> Status {
        self.unloads.borrow_mut().push(image);
        Status::SUCCESS
    }

    unsafe fn call_entry(&self, entry: u64) -> Status {
        let state = self.active_image();
        let mut options = Vec::new();
        let mut file_path = Vec::new();
        if let Some(state) = state {
            if !state.load_options.is_null() {
                let units = state.load_options_size as usize / 2;
                // SAFETY: install() callers keep the options alive across the call
                options =
                    unsafe { core::slice::from_raw_parts(state.load_options, units) }.to_vec();
            }
            if !state.file_path.is_null() {
                // SAFETY: the path is a well-formed device path ending in an end node
                file_path = unsafe { read_device_path(state.file_path) };
            }
        }
        self.entry_calls.borrow_mut().push(EntryCall {
            entry,
            state,
            options,
            file_path,
        });
        self.entry_status.get()
    }
}

/// Copy a device path up to and including its end node
unsafe fn read_device_path(mut ptr: *const u8) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        // SAFETY: caller guarantees a terminated path
        let header = unsafe { core::slice::from_raw_parts(ptr, 4) };
        let len = u16::from_le_bytes([header[2], header[3]]) as usize;
        let node = unsafe { core::slice::from_raw_parts(ptr, len.max(4)) };
        out.extend_from_slice(node);
        if header[0] == 0x7f && header[1] == 0xff {
            return out;
        }
        ptr = unsafe { ptr.add(len.max(4)) };
    }
}

impl ActiveImage for MockFirmware {
    fn snapshot(&self) -> Option<ImageState> {
        self.active_image()
    }

    unsafe fn install(&self, state: &ImageState) {
        *self.active.borrow_mut() = Some(*state);
    }

    fn restore(&self, saved: ImageState) {
        *self.active.borrow_mut() = Some(saved);
    }
}

impl Firmware for MockFirmware {
    fn secure_boot_mode(&self) -> SecureBootMode {
        self.secure_boot.get()
    }

    fn trust_root(&self) -> Option<&dyn TrustRoot> {
        self.trust_root.as_ref().map(|t| t as &dyn TrustRoot)
    }
}

/// Boot medium backed by a map of paths to file contents
pub struct MemoryMedia {
    files: BTreeMap<String, Vec<u8>>,
    root: Option<RootDevice>,
    /// Report this size instead of the real one
    pub claimed_size: Option<u64>,
}

impl MemoryMedia {
    /// A medium whose root device has a one-node device path
    pub fn new() -> Self {
        Self {
            files: BTreeMap::new(),
            root: Some(RootDevice {
                handle: handle(MOCK_DEVICE_HANDLE),
                device_path: Some(Self::device_path()),
            }),
            claimed_size: None,
        }
    }

    /// Hardware/PCI node followed by an end node
    pub fn device_path() -> Vec<u8> {
        alloc::vec![0x01, 0x01, 0x06, 0x00, 0x00, 0x1f, 0x7f, 0xff, 0x04, 0x00]
    }

    pub fn with_file(mut self, path: &str, data: Vec<u8>) -> Self {
        self.files.insert(String::from(path), data);
        self
    }

    pub fn with_root(mut self, root: Option<RootDevice>) -> Self {
        self.root = root;
        self
    }
}

struct MemoryFile<'a> {
    data: &'a [u8],
    position: usize,
    size: u64,
}

impl ImageFile for MemoryFile<'_> {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_exact(&mut self, buffer: &mut [u8]) -> core::result::Result<(), FileError> {
        let end = self.position + buffer.len();
        let src = self.data.get(self.position..end).ok_or(FileError::ShortRead)?;
        buffer.copy_from_slice(src);
        self.position = end;
        Ok(())
    }
}

impl BootMedia for MemoryMedia {
    fn open(&self, path: &str) -> core::result::Result<Box<dyn ImageFile + '_>, FileError> {
        let data = self.files.get(path).ok_or(FileError::NotFound)?;
        Ok(Box::new(MemoryFile {
            data,
            position: 0,
            size: self.claimed_size.unwrap_or(data.len() as u64),
        }))
    }

    fn root_device(&self) -> Option<RootDevice> {
        self.root.clone()
    }
}
