//! PE32+ image loading
//!
//! This module lays out and relocates a PE32+ executable (an EFI
//! application) in a fresh pool buffer so it can be started directly,
//! without handing it to the firmware's own loader. It is used on the
//! validated path, where the trust root has already checked the image
//! signature and produced an [`ImageContext`].
//!
//! The pieces run in this order:
//!
//! 1. [`header`] - parse the headers into an [`ImageContext`] (or take the
//!    one the trust root produced)
//! 2. [`section`] - allocate the aligned buffer, copy headers and sections
//! 3. [`reloc`] - apply base relocations for the actual load address
//! 4. [`load_image`] - translate the entry point and return a [`LoadedImage`]
//!
//! Every image-relative offset goes through [`bounds`].

pub mod bounds;
pub mod header;
pub mod reloc;
pub mod section;
pub mod universal;

#[cfg(test)]
pub(crate) mod testutil;

use zerocopy::{FromBytes, Immutable, KnownLayout, Unaligned};

use crate::error::{Error, Result};
use crate::firmware::{BootServices, PoolBuffer};

/// DOS header magic "MZ"
pub const DOS_MAGIC: u16 = 0x5A4D;

/// PE signature "PE\0\0"
pub const PE_SIGNATURE: u32 = 0x0000_4550;

/// PE32+ magic
pub const PE32_PLUS_MAGIC: u16 = 0x020B;

/// Machine type: AMD64
pub const IMAGE_FILE_MACHINE_AMD64: u16 = 0x8664;

/// Machine type: ARM64
pub const IMAGE_FILE_MACHINE_ARM64: u16 = 0xAA64;

/// Index of the base relocation table in the data directory
pub const IMAGE_DIRECTORY_ENTRY_BASERELOC: usize = 5;

/// DOS Header
#[repr(C, packed)]
#[derive(FromBytes, Immutable, KnownLayout, Unaligned, Debug, Clone, Copy)]
pub struct DosHeader {
    pub e_magic: u16,
    pub e_cblp: u16,
    pub e_cp: u16,
    pub e_crlc: u16,
    pub e_cparhdr: u16,
    pub e_minalloc: u16,
    pub e_maxalloc: u16,
    pub e_ss: u16,
    pub e_sp: u16,
    pub e_csum: u16,
    pub e_ip: u16,
    pub e_cs: u16,
    pub e_lfarlc: u16,
    pub e_ovno: u16,
    pub e_res: [u16; 4],
    pub e_oemid: u16,
    pub e_oeminfo: u16,
    pub e_res2: [u16; 10],
    pub e_lfanew: u32,
}

/// COFF File Header
#[repr(C, packed)]
#[derive(FromBytes, Immutable, KnownLayout, Unaligned, Debug, Clone, Copy)]
pub struct CoffHeader {
    pub machine: u16,
    pub number_of_sections: u16,
    pub time_date_stamp: u32,
    pub pointer_to_symbol_table: u32,
    pub number_of_symbols: u32,
    pub size_of_optional_header: u16,
    pub characteristics: u16,
}

/// Optional Header (PE32+), without the data directories that follow it
#[repr(C, packed)]
#[derive(FromBytes, Immutable, KnownLayout, Unaligned, Debug, Clone, Copy)]
pub struct OptionalHeader64 {
    pub magic: u16,
    pub major_linker_version: u8,
    pub minor_linker_version: u8,
    pub size_of_code: u32,
    pub size_of_initialized_data: u32,
    pub size_of_uninitialized_data: u32,
    pub address_of_entry_point: u32,
    pub base_of_code: u32,
    pub image_base: u64,
    pub section_alignment: u32,
    pub file_alignment: u32,
    pub major_os_version: u16,
    pub minor_os_version: u16,
    pub major_image_version: u16,
    pub minor_image_version: u16,
    pub major_subsystem_version: u16,
    pub minor_subsystem_version: u16,
    pub win32_version_value: u32,
    pub size_of_image: u32,
    pub size_of_headers: u32,
    pub checksum: u32,
    pub subsystem: u16,
    pub dll_characteristics: u16,
    pub size_of_stack_reserve: u64,
    pub size_of_stack_commit: u64,
    pub size_of_heap_reserve: u64,
    pub size_of_heap_commit: u64,
    pub loader_flags: u32,
    pub number_of_rva_and_sizes: u32,
}

/// Data Directory entry
#[repr(C, packed)]
#[derive(FromBytes, Immutable, KnownLayout, Unaligned, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DataDirectory {
    pub virtual_address: u32,
    pub size: u32,
}

/// Section Header
#[repr(C, packed)]
#[derive(FromBytes, Immutable, KnownLayout, Unaligned, Debug, Clone, Copy)]
pub struct SectionHeader {
    pub name: [u8; 8],
    pub virtual_size: u32,
    pub virtual_address: u32,
    pub size_of_raw_data: u32,
    pub pointer_to_raw_data: u32,
    pub pointer_to_relocations: u32,
    pub pointer_to_linenumbers: u32,
    pub number_of_relocations: u16,
    pub number_of_linenumbers: u16,
    pub characteristics: u32,
}

/// Size of a section header in bytes
pub const SECTION_HEADER_SIZE: usize = core::mem::size_of::<SectionHeader>();

/// Base Relocation Block header, followed by 16-bit type/offset entries
#[repr(C, packed)]
#[derive(FromBytes, Immutable, KnownLayout, Unaligned, Debug, Clone, Copy)]
pub struct BaseRelocation {
    pub virtual_address: u32,
    pub size_of_block: u32,
}

/// Size of a relocation block header in bytes
pub const BASE_RELOCATION_SIZE: usize = core::mem::size_of::<BaseRelocation>();

/// Normalized view of an executable's loadable layout
///
/// Produced by the trust root (or [`header::parse_context`]) and consumed by
/// the section loader and the relocation engine. Offsets named `*_offset`
/// are relative to the source file; everything else that is an address is
/// relative to the loaded image. None of these values are trusted: every
/// use goes through [`bounds`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageContext {
    /// Preferred load address (`ImageBase`)
    pub image_address: u64,
    /// Size of the loaded image (`SizeOfImage`)
    pub image_size: u64,
    /// Entry point RVA
    pub entry_point: u64,
    /// Size of all headers (`SizeOfHeaders`)
    pub size_of_headers: u64,
    /// Number of section headers
    pub number_of_sections: u16,
    /// File offset of the first section header
    pub section_table_offset: u64,
    /// Base relocation directory entry
    pub reloc_dir: DataDirectory,
    /// Number of data directory entries
    pub number_of_rva_and_sizes: u64,
    /// Section alignment, a power of two
    pub section_alignment: u32,
}

/// One section of the image, as the loader sees it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionRecord {
    /// Section name (NUL padded)
    pub name: [u8; 8],
    /// Offset of the section in the loaded image
    pub virtual_address: u32,
    /// Size of the section in memory
    pub virtual_size: u32,
    /// Offset of the section data in the file
    pub raw_offset: u32,
    /// Size of the section data in the file
    pub raw_size: u32,
}

impl SectionRecord {
    /// Section name as a string, trimmed at the first NUL
    pub fn name_str(&self) -> &str {
        let len = self.name.iter().position(|&c| c == 0).unwrap_or(8);
        core::str::from_utf8(&self.name[..len]).unwrap_or("<invalid>")
    }

    /// Number of bytes copied from the file
    pub fn copy_size(&self) -> u32 {
        self.virtual_size.min(self.raw_size)
    }
}

impl From<&SectionHeader> for SectionRecord {
    fn from(header: &SectionHeader) -> Self {
        Self {
            name: header.name,
            virtual_address: header.virtual_address,
            virtual_size: header.virtual_size,
            raw_offset: header.pointer_to_raw_data,
            raw_size: header.size_of_raw_data,
        }
    }
}

/// Base relocation fixup kinds (upper 4 bits of an entry)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RelocationKind {
    /// Padding, nothing to do
    Absolute = 0,
    /// Add the high 16 bits of the delta to a 16-bit value
    High = 1,
    /// Add the low 16 bits of the delta to a 16-bit value
    Low = 2,
    /// Add the low 32 bits of the delta to a 32-bit value
    HighLow = 3,
    /// Add the full delta to a 64-bit value
    Dir64 = 10,
}

impl RelocationKind {
    /// Decode a 4-bit relocation type
    pub fn from_raw(kind: u8) -> Option<Self> {
        match kind {
            0 => Some(Self::Absolute),
            1 => Some(Self::High),
            2 => Some(Self::Low),
            3 => Some(Self::HighLow),
            10 => Some(Self::Dir64),
            _ => None,
        }
    }

    /// Size of the patched value in bytes
    pub fn width(self) -> u64 {
        match self {
            Self::Absolute => 0,
            Self::High | Self::Low => 2,
            Self::HighLow => 4,
            Self::Dir64 => 8,
        }
    }
}

/// An image laid out and relocated in its own pool buffer
pub struct LoadedImage<'fw> {
    buffer: PoolBuffer<'fw>,
    image_offset: usize,
    image_size: usize,
    entry_point: u64,
}

impl<'fw> LoadedImage<'fw> {
    /// Address of the first byte of the image (the aligned base)
    pub fn image_base(&self) -> u64 {
        self.buffer.address() + self.image_offset as u64
    }

    /// Size of the image in bytes
    pub fn image_size(&self) -> u64 {
        self.image_size as u64
    }

    /// Absolute address of the entry point
    pub fn entry_point(&self) -> u64 {
        self.entry_point
    }

    /// The laid-out image bytes
    pub fn bytes(&self) -> &[u8] {
        &self.buffer.as_slice()[self.image_offset..self.image_offset + self.image_size]
    }
}

/// Lay out, relocate and locate the entry point of a PE32+ image
///
/// # Arguments
/// * `bs` - Boot services used to allocate the image buffer
/// * `data` - Raw PE file data
/// * `context` - Parsed layout of `data`
///
/// # Returns
/// The loaded image; its buffer is freed when it is dropped.
pub fn load_image<'fw>(
    bs: &'fw dyn BootServices,
    data: &[u8],
    context: &ImageContext,
) -> Result<LoadedImage<'fw>> {
    let mut image = section::allocate_image(bs, context)?;
    let image_offset = image.image_offset();
    let image_size = image.image_size();

    section::copy_headers(data, context, image.bytes_mut())?;
    section::load_sections(data, context, image.bytes_mut())?;

    let address = image.image_base();
    let entry_point = {
        let mut region =
            bounds::ImageRegion::new(image.bytes_mut(), address).ok_or(Error::OutOfMemory)?;
        reloc::relocate(context, &mut region)?;

        let entry = region.translate(context.entry_point).ok_or_else(|| {
            log::error!("PE: Entry point {:#x} outside image", context.entry_point);
            Error::InvalidEntryPoint
        })?;
        region.absolute(&entry)
    };

    log::info!(
        "PE: Loaded image at {:#x}, entry point at {:#x}",
        address,
        entry_point
    );

    Ok(LoadedImage {
        buffer: image.into_buffer(),
        image_offset,
        image_size,
        entry_point,
    })
}
