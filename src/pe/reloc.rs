//! Base relocation
//!
//! Walks the base relocation directory of a laid-out image and adds the
//! difference between the actual and preferred load address to every
//! fixup. The directory, each block and each fixup target are translated
//! through the image region before anything is read or written; the first
//! failure aborts the whole walk.

use zerocopy::FromBytes;

use super::bounds::ImageRegion;
use super::{
    BaseRelocation, ImageContext, RelocationKind, BASE_RELOCATION_SIZE,
    IMAGE_DIRECTORY_ENTRY_BASERELOC,
};
use crate::error::{Error, Result};

/// Apply the base relocations of `context` to `region`
///
/// The delta is `region.address() - context.image_address` (wrapping). An
/// image without a relocation directory, or with an empty one, is left
/// untouched.
pub fn relocate(context: &ImageContext, region: &mut ImageRegion<'_>) -> Result<()> {
    let dir = context.reloc_dir;
    let dir_rva = dir.virtual_address as u64;
    let dir_size = dir.size as u64;

    if context.number_of_rva_and_sizes <= IMAGE_DIRECTORY_ENTRY_BASERELOC as u64 || dir_size == 0 {
        log::debug!("PE: No relocations to apply");
        return Ok(());
    }

    // The whole directory must lie inside the image
    if region.span(dir_rva, dir_size).is_none() {
        log::error!(
            "PE: Relocation directory {:#x} (+{:#x}) outside image of {:#x} bytes",
            dir_rva,
            dir_size,
            region.size()
        );
        return Err(Error::RelocationOverflow);
    }
    let dir_end = dir_rva + dir_size;

    let delta = region.address().wrapping_sub(context.image_address);
    log::debug!(
        "PE: Relocating from {:#x} to {:#x} (delta {:#x})",
        context.image_address,
        region.address(),
        delta
    );

    let mut block_offset = dir_rva;
    let mut fixups = 0usize;

    while block_offset < dir_end {
        let header = region
            .span(block_offset, BASE_RELOCATION_SIZE as u64)
            .and_then(|span| region.read::<8>(&span))
            .ok_or_else(|| {
                log::error!("PE: Relocation block header at {:#x} outside image", block_offset);
                Error::RelocationOverflow
            })?;

        let header =
            BaseRelocation::read_from_bytes(&header).map_err(|_| Error::RelocationOverflow)?;
        let (page, block_size) = (header.virtual_address, header.size_of_block);

        if (block_size as usize) < BASE_RELOCATION_SIZE {
            log::error!("PE: Relocation block at {:#x} has size {}", block_offset, block_size);
            return Err(Error::InvalidRelocationBlock { size: block_size });
        }

        let block_end = block_offset + block_size as u64;
        if region.translate_end(block_end).is_none() {
            log::error!(
                "PE: Relocation block at {:#x} (+{:#x}) overflows image",
                block_offset,
                block_size
            );
            return Err(Error::RelocationOverflow);
        }

        let fixup_base = region.translate(page as u64).ok_or_else(|| {
            log::error!("PE: Relocation page {:#x} outside image", page);
            Error::InvalidFixupBase
        })?;
        let fixup_base = fixup_base.offset() as u64;

        let entries = (block_size as usize - BASE_RELOCATION_SIZE) / 2;
        for index in 0..entries {
            let entry_offset = block_offset + BASE_RELOCATION_SIZE as u64 + 2 * index as u64;
            let entry = region
                .span(entry_offset, 2)
                .and_then(|span| region.read::<2>(&span))
                .map(u16::from_le_bytes)
                .ok_or(Error::RelocationOverflow)?;

            let raw_kind = (entry >> 12) as u8;
            let Some(kind) = RelocationKind::from_raw(raw_kind) else {
                log::error!(
                    "PE: Unknown relocation type {} in block at {:#x}",
                    raw_kind,
                    block_offset
                );
                return Err(Error::UnknownRelocation(raw_kind));
            };

            if kind == RelocationKind::Absolute {
                continue;
            }

            let target = fixup_base + (entry & 0x0FFF) as u64;
            apply_fixup(region, kind, target, delta)?;
            fixups += 1;
        }

        block_offset = block_end;
    }

    log::debug!("PE: Applied {} relocations", fixups);
    Ok(())
}

/// Add `delta` to the value of `kind` at `target`
fn apply_fixup(
    region: &mut ImageRegion<'_>,
    kind: RelocationKind,
    target: u64,
    delta: u64,
) -> Result<()> {
    let Some(span) = region.span(target, kind.width()) else {
        log::error!("PE: Fixup at {:#x} outside image", target);
        return Err(Error::RelocationOverflow);
    };

    let written = match kind {
        RelocationKind::Absolute => Some(()),
        RelocationKind::High => region.read::<2>(&span).and_then(|value| {
            let value = u16::from_le_bytes(value).wrapping_add(((delta as u32) >> 16) as u16);
            region.write(&span, value.to_le_bytes())
        }),
        RelocationKind::Low => region.read::<2>(&span).and_then(|value| {
            let value = u16::from_le_bytes(value).wrapping_add(delta as u16);
            region.write(&span, value.to_le_bytes())
        }),
        RelocationKind::HighLow => region.read::<4>(&span).and_then(|value| {
            let value = u32::from_le_bytes(value).wrapping_add(delta as u32);
            region.write(&span, value.to_le_bytes())
        }),
        RelocationKind::Dir64 => region.read::<8>(&span).and_then(|value| {
            let value = u64::from_le_bytes(value).wrapping_add(delta);
            region.write(&span, value.to_le_bytes())
        }),
    };

    written.ok_or(Error::RelocationOverflow)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pe::DataDirectory;
    use alloc::vec;
    use alloc::vec::Vec;

    const PREFERRED: u64 = 0x1_0000_0000;

    fn context(image_size: u64, rva: u32, size: u32) -> ImageContext {
        ImageContext {
            image_address: PREFERRED,
            image_size,
            entry_point: 0,
            size_of_headers: 0,
            number_of_sections: 0,
            section_table_offset: 0,
            reloc_dir: DataDirectory {
                virtual_address: rva,
                size,
            },
            number_of_rva_and_sizes: 16,
            section_alignment: 0x1000,
        }
    }

    fn put_block(image: &mut [u8], at: usize, page: u32, entries: &[u16]) -> u32 {
        let size = (8 + 2 * entries.len()) as u32;
        image[at..at + 4].copy_from_slice(&page.to_le_bytes());
        image[at + 4..at + 8].copy_from_slice(&size.to_le_bytes());
        for (i, entry) in entries.iter().enumerate() {
            let off = at + 8 + 2 * i;
            image[off..off + 2].copy_from_slice(&entry.to_le_bytes());
        }
        size
    }

    fn run(image: &mut [u8], ctx: &ImageContext, delta: u64) -> Result<()> {
        let mut region = ImageRegion::new(image, PREFERRED.wrapping_add(delta)).unwrap();
        relocate(ctx, &mut region)
    }

    #[test]
    fn test_dir64_and_highlow() {
        let mut image = vec![0u8; 0x1000];
        image[0x100..0x108].copy_from_slice(&(PREFERRED + 0x200).to_le_bytes());
        image[0x108..0x10c].copy_from_slice(&0x1234_0000u32.to_le_bytes());
        let size = put_block(&mut image, 0x800, 0x100, &[0xA000, 0x3008, 0x0000]);

        let ctx = context(0x1000, 0x800, size);
        run(&mut image, &ctx, 0x1000).unwrap();

        assert_eq!(
            u64::from_le_bytes(image[0x100..0x108].try_into().unwrap()),
            PREFERRED + 0x1200
        );
        assert_eq!(
            u32::from_le_bytes(image[0x108..0x10c].try_into().unwrap()),
            0x1234_1000
        );
    }

    #[test]
    fn test_high_and_low() {
        let mut image = vec![0u8; 0x1000];
        image[0x10..0x12].copy_from_slice(&0x0001u16.to_le_bytes());
        image[0x12..0x14].copy_from_slice(&0xfff0u16.to_le_bytes());
        let size = put_block(&mut image, 0x800, 0, &[0x1010, 0x2012]);

        let ctx = context(0x1000, 0x800, size);
        run(&mut image, &ctx, 0x0002_0020).unwrap();

        assert_eq!(u16::from_le_bytes([image[0x10], image[0x11]]), 0x0003);
        assert_eq!(u16::from_le_bytes([image[0x12], image[0x13]]), 0x0010);
    }

    #[test]
    fn test_zero_delta_leaves_image_unchanged() {
        let mut image: Vec<u8> = (0..0x1000).map(|i| i as u8).collect();
        let size = put_block(&mut image, 0x800, 0x100, &[0xA000, 0x3010]);
        let before = image.clone();

        let ctx = context(0x1000, 0x800, size);
        run(&mut image, &ctx, 0).unwrap();
        let first = image.clone();
        run(&mut image, &ctx, 0).unwrap();

        assert_eq!(first, before);
        assert_eq!(image, first);
    }

    #[test]
    fn test_negative_delta_wraps() {
        let mut image = vec![0u8; 0x1000];
        image[0x20..0x28].copy_from_slice(&(PREFERRED + 0x40).to_le_bytes());
        let size = put_block(&mut image, 0x800, 0, &[0xA020]);

        run(&mut image, &context(0x1000, 0x800, size), 0u64.wrapping_sub(0x1000)).unwrap();
        assert_eq!(
            u64::from_le_bytes(image[0x20..0x28].try_into().unwrap()),
            PREFERRED + 0x40 - 0x1000
        );
    }

    #[test]
    fn test_block_larger_than_image_is_rejected() {
        let mut image = vec![0u8; 4096];
        image[100..104].copy_from_slice(&0u32.to_le_bytes());
        image[104..108].copy_from_slice(&8192u32.to_le_bytes());
        let before = image.clone();

        let ctx = context(4096, 100, 16);
        assert_eq!(run(&mut image, &ctx, 0x1000), Err(Error::RelocationOverflow));
        assert_eq!(image, before);
    }

    #[test]
    fn test_directory_past_image_is_rejected() {
        let mut image = vec![0u8; 4096];
        let ctx = context(4096, 4090, 16);
        assert_eq!(run(&mut image, &ctx, 0x1000), Err(Error::RelocationOverflow));

        let ctx = context(4096, u32::MAX, u32::MAX);
        assert_eq!(run(&mut image, &ctx, 0x1000), Err(Error::RelocationOverflow));
    }

    #[test]
    fn test_no_relocation_directory() {
        let mut image = vec![0xA5u8; 0x1000];
        put_block(&mut image, 0x800, 0, &[0xA000]);

        let mut ctx = context(0x1000, 0x800, 10);
        ctx.number_of_rva_and_sizes = 5;
        run(&mut image, &ctx, 0x1000).unwrap();

        let mut ctx = context(0x1000, 0x800, 0);
        ctx.number_of_rva_and_sizes = 16;
        run(&mut image, &ctx, 0x1000).unwrap();

        assert!(image[..0x800].iter().all(|&b| b == 0xA5));
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let mut image = vec![0u8; 0x1000];
        let size = put_block(&mut image, 0x800, 0, &[0x5000]);
        assert_eq!(
            run(&mut image, &context(0x1000, 0x800, size), 0x1000),
            Err(Error::UnknownRelocation(5))
        );
    }

    #[test]
    fn test_undersized_block_is_rejected() {
        let mut image = vec![0u8; 0x1000];
        image[0x804..0x808].copy_from_slice(&4u32.to_le_bytes());
        assert_eq!(
            run(&mut image, &context(0x1000, 0x800, 16), 0x1000),
            Err(Error::InvalidRelocationBlock { size: 4 })
        );
    }

    #[test]
    fn test_fixup_base_outside_image() {
        let mut image = vec![0u8; 0x1000];
        let size = put_block(&mut image, 0x800, 0x2000, &[0xA000]);
        assert_eq!(
            run(&mut image, &context(0x1000, 0x800, size), 0x1000),
            Err(Error::InvalidFixupBase)
        );
    }

    #[test]
    fn test_fixup_straddling_image_end() {
        let mut image = vec![0u8; 0x1000];
        let size = put_block(&mut image, 0x800, 0xF00, &[0xA0FC]);
        assert_eq!(
            run(&mut image, &context(0x1000, 0x800, size), 0x1000),
            Err(Error::RelocationOverflow)
        );
    }
}
