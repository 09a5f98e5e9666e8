//! Device path construction
//!
//! A device path is a sequence of nodes `{type, subtype, length, payload}`
//! terminated by an End node. The chainloader appends two media file-path
//! nodes (directory and file name) to the device path of the boot device,
//! so the chained image can find the file it was loaded from.
//!
//! All lengths are little-endian and include the 4-byte node header.
//! Device paths handed to us are walked with their declared lengths checked
//! against the buffer, never trusted.

use alloc::string::String;
use alloc::vec::Vec;

use r_efi::protocols::device_path::{End, Media, TYPE_END, TYPE_MEDIA};

use crate::error::{Error, Result};

/// Size of a node header (and of an End node)
pub const NODE_HEADER_SIZE: usize = 4;

/// End of entire device path node
pub const END_ENTIRE: [u8; 4] = [TYPE_END, End::SUBTYPE_ENTIRE, 0x04, 0x00];

/// One node of a device path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Node<'a> {
    pub node_type: u8,
    pub sub_type: u8,
    /// Offset of the node header in the path
    pub offset: usize,
    /// Node payload, without the header
    pub data: &'a [u8],
}

impl Node<'_> {
    /// Total node length including the header
    pub fn size(&self) -> usize {
        NODE_HEADER_SIZE + self.data.len()
    }

    pub fn is_file_path(&self) -> bool {
        self.node_type == TYPE_MEDIA && self.sub_type == Media::SUBTYPE_FILE_PATH
    }
}

/// Iterator over the nodes of a device path, stopping at the End node
pub struct Nodes<'a> {
    bytes: &'a [u8],
    offset: usize,
    done: bool,
}

/// Walk the nodes of `bytes`
///
/// Yields every node before the End-of-entire-path node. A node shorter
/// than its header or running past `bytes` yields an error and ends the
/// walk.
pub fn nodes(bytes: &[u8]) -> Nodes<'_> {
    Nodes {
        bytes,
        offset: 0,
        done: false,
    }
}

impl<'a> Iterator for Nodes<'a> {
    type Item = Result<Node<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let Some(header) = self.bytes.get(self.offset..self.offset + NODE_HEADER_SIZE) else {
            self.done = true;
            log::error!("DevicePath: No end node within {} bytes", self.bytes.len());
            return Some(Err(Error::UnterminatedDevicePath));
        };

        let length = u16::from_le_bytes([header[2], header[3]]) as usize;
        if length < NODE_HEADER_SIZE {
            self.done = true;
            log::error!(
                "DevicePath: Malformed node at {:#x} has length={}",
                self.offset,
                length
            );
            return Some(Err(Error::MalformedDevicePathNode { length }));
        }

        let (node_type, sub_type) = (header[0], header[1]);
        if node_type == TYPE_END && sub_type == End::SUBTYPE_ENTIRE {
            self.done = true;
            return None;
        }

        let Some(data) = self
            .bytes
            .get(self.offset + NODE_HEADER_SIZE..self.offset + length)
        else {
            self.done = true;
            log::error!(
                "DevicePath: Node at {:#x} (length {}) runs past {} bytes",
                self.offset,
                length,
                self.bytes.len()
            );
            return Some(Err(Error::UnterminatedDevicePath));
        };

        let node = Node {
            node_type,
            sub_type,
            offset: self.offset,
            data,
        };
        self.offset += length;
        Some(Ok(node))
    }
}

/// Size of a device path up to, but not including, its End node
pub fn prefix_len(bytes: &[u8]) -> Result<usize> {
    let mut len = 0;
    for node in nodes(bytes) {
        len += node?.size();
    }
    Ok(len)
}

/// Split a textual path into directory and file name
///
/// Anything up to the first `)` is a device name and is dropped. The rest
/// is split at the last `/`; a path without one is rejected.
pub fn split_path(path: &str) -> Result<(&str, &str)> {
    let path = match path.find(')') {
        Some(end) => &path[end + 1..],
        None => path,
    };

    let Some(separator) = path.rfind('/') else {
        log::error!("DevicePath: No directory in {:?}", path);
        return Err(Error::InvalidFilePath);
    };

    Ok((&path[..separator], &path[separator + 1..]))
}

/// Append a media file-path node for `component`
///
/// `/` becomes `\`, and the UTF-16 name is NUL terminated.
fn push_file_path_node(out: &mut Vec<u8>, component: &str) -> Result<()> {
    let units = component.encode_utf16().count() + 1;
    let length = units
        .checked_mul(2)
        .and_then(|n| n.checked_add(NODE_HEADER_SIZE))
        .and_then(|n| u16::try_from(n).ok())
        .ok_or_else(|| {
            log::error!("DevicePath: Component of {} units too long", units);
            Error::PathComponentTooLong
        })?;

    out.push(TYPE_MEDIA);
    out.push(Media::SUBTYPE_FILE_PATH);
    out.extend_from_slice(&length.to_le_bytes());
    for unit in component.encode_utf16() {
        let unit = if unit == u16::from(b'/') {
            u16::from(b'\\')
        } else {
            unit
        };
        out.extend_from_slice(&unit.to_le_bytes());
    }
    out.extend_from_slice(&0u16.to_le_bytes());
    Ok(())
}

/// Build the device path of a file on the device described by `device`
///
/// The result is `device` (without its End node), a file-path node for
/// the directory, a file-path node for the file name and an End node.
///
/// # Arguments
/// * `device` - Device path of the boot device, terminated by an End node
/// * `path` - Textual path such as `(hd0,gpt1)/EFI/BOOT/BOOTX64.EFI`
pub fn make_file_path(device: &[u8], path: &str) -> Result<Vec<u8>> {
    let (directory, file) = split_path(path)?;
    let prefix = prefix_len(device)?;

    // Each UTF-8 byte is at most one UTF-16 unit; two NULs and two headers
    let worst_case = prefix
        + (directory.len() + file.len() + 2) * 2
        + 2 * NODE_HEADER_SIZE
        + END_ENTIRE.len();

    let mut out = Vec::new();
    out.try_reserve_exact(worst_case).map_err(|_| {
        log::error!("DevicePath: Failed to allocate {} bytes", worst_case);
        Error::OutOfMemory
    })?;

    out.extend_from_slice(&device[..prefix]);
    push_file_path_node(&mut out, directory)?;
    push_file_path_node(&mut out, file)?;
    out.extend_from_slice(&END_ENTIRE);

    log::debug!(
        "DevicePath: Built file path {:?} + {:?} ({} bytes)",
        directory,
        file,
        out.len()
    );

    Ok(out)
}

/// Offset of the first media file-path node in `path`, if any
pub fn media_file_path(path: &[u8]) -> Result<Option<usize>> {
    for node in nodes(path) {
        let node = node?;
        if node.is_file_path() {
            return Ok(Some(node.offset));
        }
    }
    Ok(None)
}

/// Decode the names of all media file-path nodes in `path`
pub fn file_path_components(path: &[u8]) -> Result<Vec<String>> {
    let mut components = Vec::new();
    for node in nodes(path) {
        let node = node?;
        if !node.is_file_path() {
            continue;
        }
        let units = node
            .data
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .take_while(|&unit| unit != 0);
        let name: String = char::decode_utf16(units)
            .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER))
            .collect();
        components.push(name);
    }
    Ok(components)
}
