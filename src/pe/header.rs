//! PE32+ header parsing
//!
//! Builds an [`ImageContext`] from the raw bytes of an EFI application. The
//! trust root normally does this on the loader's behalf; this parser backs
//! [`TrustRoot::context`](crate::firmware::TrustRoot::context) when the
//! trust root does not provide its own.
//!
//! Only the fields the loader needs are checked here. Section and
//! relocation offsets are left for the section loader and relocation
//! engine, which check them against the image they write to.

use zerocopy::FromBytes;

use super::bounds;
use super::{
    CoffHeader, DataDirectory, DosHeader, ImageContext, OptionalHeader64, DOS_MAGIC,
    IMAGE_DIRECTORY_ENTRY_BASERELOC, IMAGE_FILE_MACHINE_AMD64, IMAGE_FILE_MACHINE_ARM64,
    PE32_PLUS_MAGIC, PE_SIGNATURE, SECTION_HEADER_SIZE,
};
use crate::error::{Error, Result};

const COFF_HEADER_SIZE: u64 = core::mem::size_of::<CoffHeader>() as u64;
const OPTIONAL_HEADER_SIZE: u64 = core::mem::size_of::<OptionalHeader64>() as u64;
const DATA_DIRECTORY_SIZE: u64 = core::mem::size_of::<DataDirectory>() as u64;

/// Borrow `len` bytes at `offset` of the file
fn file_bytes<'a>(data: &'a [u8], offset: u64, len: u64, what: &'static str) -> Result<&'a [u8]> {
    bounds::translate_span(data.len(), offset, len)
        .and_then(|span| span.of(data))
        .ok_or_else(|| {
            log::error!("PE: {} outside file ({:#x} +{:#x})", what, offset, len);
            Error::InvalidHeader(what)
        })
}

/// Parse the headers of a PE32+ image
pub fn parse_context(data: &[u8]) -> Result<ImageContext> {
    let Ok((dos_header, _)) = DosHeader::read_from_prefix(data) else {
        log::error!("PE: Data too small for DOS header");
        return Err(Error::InvalidHeader("file too small"));
    };

    let dos_magic = dos_header.e_magic;
    if dos_magic != DOS_MAGIC {
        log::error!("PE: Invalid DOS magic: {:#x}", dos_magic);
        return Err(Error::InvalidHeader("bad DOS magic"));
    }

    let pe_offset = dos_header.e_lfanew as u64;
    let signature = file_bytes(data, pe_offset, 4, "PE signature")?;
    let signature = u32::from_le_bytes([signature[0], signature[1], signature[2], signature[3]]);
    if signature != PE_SIGNATURE {
        log::error!("PE: Invalid PE signature: {:#x}", signature);
        return Err(Error::InvalidHeader("bad PE signature"));
    }

    let coff_offset = pe_offset + 4;
    let coff_bytes = file_bytes(data, coff_offset, COFF_HEADER_SIZE, "COFF header")?;
    let coff = CoffHeader::read_from_bytes(coff_bytes)
        .map_err(|_| Error::InvalidHeader("COFF header"))?;

    let machine = coff.machine;
    if machine != IMAGE_FILE_MACHINE_AMD64 && machine != IMAGE_FILE_MACHINE_ARM64 {
        log::error!("PE: Unsupported machine type: {:#x}", machine);
        return Err(Error::UnsupportedMachine(machine));
    }

    let opt_offset = coff_offset + COFF_HEADER_SIZE;
    let opt_size = coff.size_of_optional_header as u64;
    if opt_size < OPTIONAL_HEADER_SIZE {
        log::error!("PE: Optional header too small ({} bytes)", opt_size);
        return Err(Error::InvalidHeader("optional header too small"));
    }
    let opt_bytes = file_bytes(data, opt_offset, opt_size, "optional header")?;
    let Ok((opt, _)) = OptionalHeader64::read_from_prefix(opt_bytes) else {
        return Err(Error::InvalidHeader("optional header too small"));
    };

    let magic = opt.magic;
    if magic != PE32_PLUS_MAGIC {
        log::error!("PE: Not a PE32+ image: {:#x}", magic);
        return Err(Error::InvalidHeader("not a PE32+ image"));
    }

    let image_size = opt.size_of_image as u64;
    let size_of_headers = opt.size_of_headers as u64;
    let section_alignment = opt.section_alignment;

    if image_size == 0 {
        log::error!("PE: Image size is zero");
        return Err(Error::InvalidHeader("image size is zero"));
    }
    if size_of_headers > image_size {
        log::error!(
            "PE: Headers ({:#x}) larger than image ({:#x})",
            size_of_headers,
            image_size
        );
        return Err(Error::InvalidHeader("headers larger than image"));
    }
    if !section_alignment.is_power_of_two() {
        log::error!("PE: Invalid section alignment {:#x}", section_alignment);
        return Err(Error::InvalidSectionAlignment(section_alignment));
    }

    // Only the directories that fit inside the optional header count
    let declared_dirs = opt.number_of_rva_and_sizes as u64;
    let room_for_dirs = (opt_size - OPTIONAL_HEADER_SIZE) / DATA_DIRECTORY_SIZE;
    let number_of_rva_and_sizes = declared_dirs.min(room_for_dirs);

    let reloc_dir = if number_of_rva_and_sizes > IMAGE_DIRECTORY_ENTRY_BASERELOC as u64 {
        let dir_offset = opt_offset
            + OPTIONAL_HEADER_SIZE
            + IMAGE_DIRECTORY_ENTRY_BASERELOC as u64 * DATA_DIRECTORY_SIZE;
        let dir_bytes = file_bytes(data, dir_offset, DATA_DIRECTORY_SIZE, "data directory")?;
        DataDirectory::read_from_bytes(dir_bytes)
            .map_err(|_| Error::InvalidHeader("data directory"))?
    } else {
        DataDirectory::default()
    };

    let number_of_sections = coff.number_of_sections;
    let section_table_offset = opt_offset + opt_size;
    file_bytes(
        data,
        section_table_offset,
        number_of_sections as u64 * SECTION_HEADER_SIZE as u64,
        "section table",
    )?;

    let context = ImageContext {
        image_address: opt.image_base,
        image_size,
        entry_point: opt.address_of_entry_point as u64,
        size_of_headers,
        number_of_sections,
        section_table_offset,
        reloc_dir,
        number_of_rva_and_sizes,
        section_alignment,
    };

    log::debug!(
        "PE: image_base={:#x}, size={:#x}, entry_rva={:#x}, sections={}",
        context.image_address,
        context.image_size,
        context.entry_point,
        context.number_of_sections
    );

    Ok(context)
}
