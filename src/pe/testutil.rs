//! Synthetic PE32+ images for tests

use alloc::vec::Vec;

use super::{DataDirectory, RelocationKind, IMAGE_FILE_MACHINE_AMD64};

const PE_OFFSET: usize = 0x40;
const OPTIONAL_HEADER_OFFSET: usize = PE_OFFSET + 4 + 20;
const OPTIONAL_HEADER_SIZE: usize = 112 + 16 * 8;
const SECTION_TABLE_OFFSET: usize = OPTIONAL_HEADER_OFFSET + OPTIONAL_HEADER_SIZE;
const FILE_ALIGNMENT: usize = 0x200;

struct Section {
    name: &'static str,
    virtual_address: u32,
    virtual_size: u32,
    data: Vec<u8>,
}

/// A built test image
pub struct BuiltImage {
    pub bytes: Vec<u8>,
    pub image_size: u32,
    pub reloc_dir: DataDirectory,
    pub section_table_offset: usize,
    /// File offset of each section's raw data, in declaration order
    pub raw_offsets: Vec<usize>,
}

/// Builder for small PE32+ images
pub struct ImageBuilder {
    machine: u16,
    image_base: u64,
    section_alignment: u32,
    entry_point: u32,
    sections: Vec<Section>,
    relocs: Vec<(RelocationKind, u32)>,
}

fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

fn put(bytes: &mut [u8], at: usize, value: &[u8]) {
    bytes[at..at + value.len()].copy_from_slice(value);
}

impl ImageBuilder {
    pub fn new() -> Self {
        Self {
            machine: IMAGE_FILE_MACHINE_AMD64,
            image_base: 0x1_4000_0000,
            section_alignment: 0x1000,
            entry_point: 0x1000,
            sections: Vec::new(),
            relocs: Vec::new(),
        }
    }

    pub fn machine(mut self, machine: u16) -> Self {
        self.machine = machine;
        self
    }

    pub fn image_base(mut self, base: u64) -> Self {
        self.image_base = base;
        self
    }

    pub fn entry_point(mut self, rva: u32) -> Self {
        self.entry_point = rva;
        self
    }

    pub fn section(mut self, name: &'static str, va: u32, vsize: u32, data: Vec<u8>) -> Self {
        self.sections.push(Section {
            name,
            virtual_address: va,
            virtual_size: vsize,
            data,
        });
        self
    }

    pub fn dir64(mut self, rva: u32) -> Self {
        self.relocs.push((RelocationKind::Dir64, rva));
        self
    }

    pub fn highlow(mut self, rva: u32) -> Self {
        self.relocs.push((RelocationKind::HighLow, rva));
        self
    }

    /// Encode the relocations as blocks, one per 4 KiB page
    fn reloc_blocks(&self) -> Vec<u8> {
        let mut pages: Vec<u32> = self.relocs.iter().map(|&(_, rva)| rva & !0xFFF).collect();
        pages.sort_unstable();
        pages.dedup();

        let mut out = Vec::new();
        for page in pages {
            let mut entries: Vec<u16> = self
                .relocs
                .iter()
                .filter(|&&(_, rva)| rva & !0xFFF == page)
                .map(|&(kind, rva)| ((kind as u16) << 12) | (rva & 0xFFF) as u16)
                .collect();
            if entries.len() % 2 == 1 {
                entries.push(0);
            }
            let size = 8 + 2 * entries.len() as u32;
            out.extend_from_slice(&page.to_le_bytes());
            out.extend_from_slice(&size.to_le_bytes());
            for entry in entries {
                out.extend_from_slice(&entry.to_le_bytes());
            }
        }
        out
    }

    pub fn build(self) -> BuiltImage {
        let align = self.section_alignment as usize;
        let reloc_data = self.reloc_blocks();

        let mut sections: Vec<(&'static str, u32, u32, &[u8])> = self
            .sections
            .iter()
            .map(|s| (s.name, s.virtual_address, s.virtual_size, s.data.as_slice()))
            .collect();

        let mut image_end = self
            .sections
            .iter()
            .map(|s| (s.virtual_address + s.virtual_size) as usize)
            .max()
            .unwrap_or(0);

        let mut reloc_dir = DataDirectory::default();
        if !reloc_data.is_empty() {
            let va = align_up(image_end.max(align), align) as u32;
            reloc_dir = DataDirectory {
                virtual_address: va,
                size: reloc_data.len() as u32,
            };
            sections.push((".reloc", va, reloc_data.len() as u32, reloc_data.as_slice()));
            image_end = va as usize + reloc_data.len();
        }

        let headers_end = SECTION_TABLE_OFFSET + 40 * sections.len();
        let size_of_headers = align_up(headers_end, FILE_ALIGNMENT);
        let image_size = align_up(image_end.max(size_of_headers), align);

        let mut raw_offsets = Vec::new();
        let mut file_end = size_of_headers;
        for &(_, _, _, data) in &sections {
            if data.is_empty() {
                raw_offsets.push(0);
            } else {
                raw_offsets.push(file_end);
                file_end += align_up(data.len(), FILE_ALIGNMENT);
            }
        }

        let mut bytes = alloc::vec![0u8; file_end];

        // DOS header
        put(&mut bytes, 0, b"MZ");
        put(&mut bytes, 0x3c, &(PE_OFFSET as u32).to_le_bytes());

        // COFF header
        put(&mut bytes, PE_OFFSET, b"PE\0\0");
        let coff = PE_OFFSET + 4;
        put(&mut bytes, coff, &self.machine.to_le_bytes());
        put(&mut bytes, coff + 2, &(sections.len() as u16).to_le_bytes());
        put(&mut bytes, coff + 16, &(OPTIONAL_HEADER_SIZE as u16).to_le_bytes());
        put(&mut bytes, coff + 18, &0x0022u16.to_le_bytes());

        // Optional header
        let opt = OPTIONAL_HEADER_OFFSET;
        put(&mut bytes, opt, &0x020Bu16.to_le_bytes());
        put(&mut bytes, opt + 16, &self.entry_point.to_le_bytes());
        put(&mut bytes, opt + 24, &self.image_base.to_le_bytes());
        put(&mut bytes, opt + 32, &self.section_alignment.to_le_bytes());
        put(&mut bytes, opt + 36, &(FILE_ALIGNMENT as u32).to_le_bytes());
        put(&mut bytes, opt + 56, &(image_size as u32).to_le_bytes());
        put(&mut bytes, opt + 60, &(size_of_headers as u32).to_le_bytes());
        put(&mut bytes, opt + 68, &10u16.to_le_bytes());
        put(&mut bytes, opt + 108, &16u32.to_le_bytes());
        let dir5 = opt + 112 + 5 * 8;
        let (reloc_rva, reloc_size) = (reloc_dir.virtual_address, reloc_dir.size);
        put(&mut bytes, dir5, &reloc_rva.to_le_bytes());
        put(&mut bytes, dir5 + 4, &reloc_size.to_le_bytes());

        // Section table and raw data
        for (index, &(name, va, vsize, data)) in sections.iter().enumerate() {
            let header = SECTION_TABLE_OFFSET + 40 * index;
            let mut raw_name = [0u8; 8];
            let len = name.len().min(8);
            raw_name[..len].copy_from_slice(&name.as_bytes()[..len]);
            put(&mut bytes, header, &raw_name);
            put(&mut bytes, header + 8, &vsize.to_le_bytes());
            put(&mut bytes, header + 12, &va.to_le_bytes());
            put(&mut bytes, header + 16, &(data.len() as u32).to_le_bytes());
            put(&mut bytes, header + 20, &(raw_offsets[index] as u32).to_le_bytes());
            if !data.is_empty() {
                put(&mut bytes, raw_offsets[index], data);
            }
        }

        BuiltImage {
            bytes,
            image_size: image_size as u32,
            reloc_dir,
            section_table_offset: SECTION_TABLE_OFFSET,
            raw_offsets,
        }
    }
}
