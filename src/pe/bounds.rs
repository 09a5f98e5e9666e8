//! Bounded address translation
//!
//! Every image-relative offset that comes from an executable (section
//! addresses, relocation blocks, fixup targets, the entry point) is turned
//! into a position inside a buffer here and nowhere else. The translated
//! values are not `Copy` and can only be built by the functions in this
//! module, so code holding an [`ImageAddr`] or [`ImageSpan`] knows the
//! offset was checked against the buffer it came from.
//!
//! All comparisons are done in `u64` with checked arithmetic, so offsets
//! near `u64::MAX` are rejected rather than wrapped.

/// An offset known to lie inside a buffer
#[derive(Debug, PartialEq, Eq)]
pub struct ImageAddr {
    offset: usize,
}

impl ImageAddr {
    /// Offset from the start of the buffer
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }
}

/// A byte range known to lie inside a buffer
#[derive(Debug, PartialEq, Eq)]
pub struct ImageSpan {
    offset: usize,
    len: usize,
}

impl ImageSpan {
    /// Offset of the first byte
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Number of bytes in the span
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the span is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Borrow the span from `bytes`
    ///
    /// Returns `None` if `bytes` is shorter than the buffer the span was
    /// translated against.
    #[inline]
    pub fn of<'a>(&self, bytes: &'a [u8]) -> Option<&'a [u8]> {
        bytes.get(self.offset..self.offset + self.len)
    }

    /// Mutably borrow the span from `bytes`
    #[inline]
    pub fn of_mut<'a>(&self, bytes: &'a mut [u8]) -> Option<&'a mut [u8]> {
        bytes.get_mut(self.offset..self.offset + self.len)
    }
}

/// Translate `offset` into a buffer of `size` bytes
///
/// Accepts `offset < size` only.
#[inline]
pub fn translate(size: usize, offset: u64) -> Option<ImageAddr> {
    if offset >= size as u64 {
        return None;
    }
    Some(ImageAddr {
        offset: offset as usize,
    })
}

/// Translate an end marker into a buffer of `size` bytes
///
/// Like [`translate`] but also accepts `offset == size`, for callers that
/// need the one-past-the-end position of a range.
#[inline]
pub fn translate_end(size: usize, offset: u64) -> Option<ImageAddr> {
    if offset > size as u64 {
        return None;
    }
    Some(ImageAddr {
        offset: offset as usize,
    })
}

/// Translate the range `[offset, offset + len)` into a buffer of `size` bytes
///
/// Both the first and the last byte go through [`translate`]. An empty range
/// only needs its start to be a valid end marker.
pub fn translate_span(size: usize, offset: u64, len: u64) -> Option<ImageSpan> {
    if len == 0 {
        let start = translate_end(size, offset)?;
        return Some(ImageSpan {
            offset: start.offset,
            len: 0,
        });
    }

    let start = translate(size, offset)?;
    let last = offset.checked_add(len - 1)?;
    translate(size, last)?;

    Some(ImageSpan {
        offset: start.offset,
        len: len as usize,
    })
}

/// A loaded image buffer together with the address it lives at
///
/// The relocation engine and the entry-point lookup use this to turn
/// image-relative offsets into absolute addresses and to patch fixups.
pub struct ImageRegion<'a> {
    bytes: &'a mut [u8],
    address: u64,
}

impl<'a> ImageRegion<'a> {
    /// Wrap `bytes`, which live at `address`
    ///
    /// Returns `None` if the region would extend past the top of the
    /// address space.
    pub fn new(bytes: &'a mut [u8], address: u64) -> Option<Self> {
        address.checked_add(bytes.len() as u64)?;
        Some(Self { bytes, address })
    }

    /// Size of the region in bytes
    #[inline]
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    /// Address of the first byte
    #[inline]
    pub fn address(&self) -> u64 {
        self.address
    }

    /// Translate an offset into this region
    #[inline]
    pub fn translate(&self, offset: u64) -> Option<ImageAddr> {
        translate(self.size(), offset)
    }

    /// Translate an end marker into this region
    #[inline]
    pub fn translate_end(&self, offset: u64) -> Option<ImageAddr> {
        translate_end(self.size(), offset)
    }

    /// Translate a byte range into this region
    #[inline]
    pub fn span(&self, offset: u64, len: u64) -> Option<ImageSpan> {
        translate_span(self.size(), offset, len)
    }

    /// Absolute address of a translated offset
    #[inline]
    pub fn absolute(&self, at: &ImageAddr) -> u64 {
        // `new` guarantees address + size fits, and at.offset <= size
        self.address + at.offset as u64
    }

    /// Read-only view of the whole region
    #[inline]
    pub fn bytes(&self) -> &[u8] {
        self.bytes
    }

    /// Read `N` bytes at a translated span
    pub fn read<const N: usize>(&self, span: &ImageSpan) -> Option<[u8; N]> {
        if span.len() != N {
            return None;
        }
        span.of(self.bytes)?.try_into().ok()
    }

    /// Write `N` bytes at a translated span
    pub fn write<const N: usize>(&mut self, span: &ImageSpan, value: [u8; N]) -> Option<()> {
        if span.len() != N {
            return None;
        }
        span.of_mut(self.bytes)?.copy_from_slice(&value);
        Some(())
    }
}
