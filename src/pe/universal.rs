//! Universal (fat) EFI binaries
//!
//! Some Apple firmware images bundle several EFI applications in one file:
//! a header with magic `0x0ef1fab9`, an array of per-CPU entries, then the
//! slices themselves. The loader picks the slice for the running CPU and
//! treats it as the whole file from then on.

use core::ops::Range;

use zerocopy::{FromBytes, Immutable, KnownLayout, Unaligned};

use super::bounds;
use crate::error::{Error, Result};

/// Fat EFI container magic
pub const FAT_EFI_MAGIC: u32 = 0x0ef1_fab9;

/// Mach-O CPU type for x86_64
pub const CPU_TYPE_X86_64: u32 = 0x0100_0007;

/// Mach-O CPU type for i386
pub const CPU_TYPE_I386: u32 = 0x0000_0007;

/// CPU type of the slice this build can run, if the platform has one
pub const HOST_CPU_TYPE: Option<u32> = if cfg!(target_arch = "x86_64") {
    Some(CPU_TYPE_X86_64)
} else if cfg!(target_arch = "x86") {
    Some(CPU_TYPE_I386)
} else {
    None
};

/// Fat container header
#[repr(C, packed)]
#[derive(FromBytes, Immutable, KnownLayout, Unaligned, Debug, Clone, Copy)]
pub struct FatHeader {
    pub magic: u32,
    pub nfat_arch: u32,
}

/// One slice of a fat container
#[repr(C, packed)]
#[derive(FromBytes, Immutable, KnownLayout, Unaligned, Debug, Clone, Copy)]
pub struct FatArch {
    pub cpu_type: u32,
    pub cpu_subtype: u32,
    pub offset: u32,
    pub size: u32,
    pub align: u32,
}

const FAT_HEADER_SIZE: u64 = core::mem::size_of::<FatHeader>() as u64;
const FAT_ARCH_SIZE: u64 = core::mem::size_of::<FatArch>() as u64;

/// Select the slice of a fat container built for `cpu_type`
///
/// Returns `Ok(None)` when `data` is not a fat container, so callers can
/// use the file as is. Otherwise returns the byte range of the slice.
pub fn select_slice(data: &[u8], cpu_type: u32) -> Result<Option<Range<usize>>> {
    let Ok((header, _)) = FatHeader::read_from_prefix(data) else {
        return Ok(None);
    };
    let magic = header.magic;
    if magic != FAT_EFI_MAGIC {
        return Ok(None);
    }

    let count = header.nfat_arch;
    log::debug!("PE: Universal binary with {} slices", count);

    for index in 0..count as u64 {
        let offset = FAT_HEADER_SIZE + index * FAT_ARCH_SIZE;
        let Some(entry) = bounds::translate_span(data.len(), offset, FAT_ARCH_SIZE)
            .and_then(|span| span.of(data))
        else {
            log::error!("PE: Universal binary slice table truncated at entry {}", index);
            return Err(Error::PrematureEndOfFile);
        };
        let arch = FatArch::read_from_bytes(entry).map_err(|_| Error::PrematureEndOfFile)?;

        let arch_cpu = arch.cpu_type;
        if arch_cpu != cpu_type {
            continue;
        }

        let (slice_offset, slice_size) = (arch.offset as u64, arch.size as u64);
        let slice = bounds::translate_span(data.len(), slice_offset, slice_size);
        return match slice {
            Some(span) => {
                log::debug!(
                    "PE: Using slice {} at {:#x} ({} bytes)",
                    index,
                    slice_offset,
                    slice_size
                );
                Ok(Some(span.offset()..span.offset() + span.len()))
            }
            None => {
                log::error!(
                    "PE: Slice at {:#x} (+{:#x}) past end of {}-byte file",
                    slice_offset,
                    slice_size,
                    data.len()
                );
                Err(Error::PrematureEndOfFile)
            }
        };
    }

    log::error!("PE: No slice for CPU type {:#x}", cpu_type);
    Err(Error::NoCompatibleArch)
}
