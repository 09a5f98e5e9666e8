//! Section loading
//!
//! Allocates the destination buffer for an image and copies the headers and
//! each section into it. A section occupies `virtual_size` bytes in memory;
//! the first `min(virtual_size, raw_size)` come from the file and the rest
//! are zero filled (uninitialized data such as `.bss`).

use zerocopy::FromBytes;

use super::bounds;
use super::{ImageContext, SectionHeader, SectionRecord, SECTION_HEADER_SIZE};
use crate::error::{Error, Result};
use crate::firmware::{BootServices, MemoryType, PoolBuffer};

/// A pool buffer with an aligned image window inside it
pub struct ImageBuffer<'fw> {
    buffer: PoolBuffer<'fw>,
    offset: usize,
    size: usize,
}

impl<'fw> ImageBuffer<'fw> {
    /// Offset of the aligned image inside the pool buffer
    pub fn image_offset(&self) -> usize {
        self.offset
    }

    /// Size of the image window
    pub fn image_size(&self) -> usize {
        self.size
    }

    /// Address of the aligned image
    pub fn image_base(&self) -> u64 {
        self.buffer.address() + self.offset as u64
    }

    /// The image window
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        let (offset, size) = (self.offset, self.size);
        &mut self.buffer.as_mut_slice()[offset..offset + size]
    }

    /// Give up the window and keep the underlying allocation
    pub fn into_buffer(self) -> PoolBuffer<'fw> {
        self.buffer
    }
}

/// Allocate the destination buffer for an image
///
/// The buffer holds `image_size + section_alignment` bytes so an aligned
/// window of `image_size` bytes always fits inside it.
pub fn allocate_image<'fw>(
    bs: &'fw dyn BootServices,
    context: &ImageContext,
) -> Result<ImageBuffer<'fw>> {
    if context.image_size == 0 {
        log::error!("PE: Image size is zero");
        return Err(Error::InvalidHeader("image size is zero"));
    }

    let alignment = context.section_alignment;
    if !alignment.is_power_of_two() {
        log::error!("PE: Invalid section alignment {:#x}", alignment);
        return Err(Error::InvalidSectionAlignment(alignment));
    }

    let image_size =
        usize::try_from(context.image_size).map_err(|_| Error::InvalidHeader("image too large"))?;
    let buffer_size = image_size
        .checked_add(alignment as usize)
        .ok_or(Error::InvalidHeader("image too large"))?;

    let buffer = PoolBuffer::allocate(bs, MemoryType::LoaderData, buffer_size)?;

    let address = buffer.address();
    let mask = alignment as u64 - 1;
    let aligned = address
        .checked_add(mask)
        .map(|a| a & !mask)
        .ok_or(Error::OutOfMemory)?;
    let offset = (aligned - address) as usize;

    log::debug!(
        "PE: Image buffer {:#x} ({} bytes), aligned base {:#x}",
        address,
        buffer_size,
        aligned
    );

    Ok(ImageBuffer {
        buffer,
        offset,
        size: image_size,
    })
}

/// Copy `size_of_headers` bytes from the file to the start of the image
pub fn copy_headers(data: &[u8], context: &ImageContext, dest: &mut [u8]) -> Result<()> {
    let headers = context.size_of_headers;
    let src = bounds::translate_span(data.len(), 0, headers);
    let dst = bounds::translate_span(dest.len(), 0, headers);

    let (Some(src), Some(dst)) = (src, dst) else {
        log::error!("PE: Headers ({:#x} bytes) exceed file or image", headers);
        return Err(Error::InvalidHeader("headers exceed image"));
    };

    let src = src.of(data).ok_or(Error::InvalidHeader("headers exceed image"))?;
    dst.of_mut(dest)
        .ok_or(Error::InvalidHeader("headers exceed image"))?
        .copy_from_slice(src);
    Ok(())
}

/// Read the `index`th section header from the file
pub fn section_record(data: &[u8], context: &ImageContext, index: u16) -> Result<SectionRecord> {
    let offset = (index as u64)
        .checked_mul(SECTION_HEADER_SIZE as u64)
        .and_then(|o| o.checked_add(context.section_table_offset))
        .ok_or(Error::InvalidHeader("section table outside file"))?;

    let bytes = bounds::translate_span(data.len(), offset, SECTION_HEADER_SIZE as u64)
        .and_then(|span| span.of(data))
        .ok_or(Error::InvalidHeader("section table outside file"))?;

    let header = SectionHeader::read_from_bytes(bytes)
        .map_err(|_| Error::InvalidHeader("section table outside file"))?;
    Ok(SectionRecord::from(&header))
}

/// Copy one section into the image and zero fill its tail
pub fn load_section(data: &[u8], section: &SectionRecord, dest: &mut [u8]) -> Result<()> {
    let copy_size = section.copy_size() as usize;

    let Some(dst) = bounds::translate_span(
        dest.len(),
        section.virtual_address as u64,
        section.virtual_size as u64,
    ) else {
        log::error!(
            "PE: Section {} at {:#x} (+{:#x}) outside image of {:#x} bytes",
            section.name_str(),
            section.virtual_address,
            section.virtual_size,
            dest.len()
        );
        return Err(Error::InvalidSectionSize);
    };

    let dst = dst.of_mut(dest).ok_or(Error::InvalidSectionSize)?;

    if copy_size > 0 {
        let src = bounds::translate_span(data.len(), section.raw_offset as u64, copy_size as u64)
            .and_then(|span| span.of(data));
        let Some(src) = src else {
            log::error!(
                "PE: Section {} data at {:#x} (+{:#x}) outside file",
                section.name_str(),
                section.raw_offset,
                copy_size
            );
            return Err(Error::InvalidSectionSize);
        };
        dst[..copy_size].copy_from_slice(src);
    }

    dst[copy_size..].fill(0);
    Ok(())
}

/// Copy every section declared by `context` into the image
pub fn load_sections(data: &[u8], context: &ImageContext, dest: &mut [u8]) -> Result<()> {
    for index in 0..context.number_of_sections {
        let section = section_record(data, context, index)?;
        load_section(data, &section, dest)?;
        log::debug!(
            "PE: Copied section {} ({:#x} of {:#x} bytes at {:#x})",
            section.name_str(),
            section.copy_size(),
            section.virtual_size,
            section.virtual_address
        );
    }
    Ok(())
}
