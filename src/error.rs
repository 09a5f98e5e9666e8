//! Chainloader error type
//!
//! Every component returns [`Error`]. Each variant belongs to one
//! [`ErrorKind`], which is what the boot menu reports to the user, and maps
//! onto an EFI status for callers on the firmware side of the boundary.

use core::fmt;

use r_efi::efi::Status;

/// Maximum length of an exit-data message we keep from a failed image
pub const MAX_EXIT_MESSAGE: usize = 128;

/// Coarse error classes surfaced to the boot menu
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing filename, malformed path, failed verification
    BadArgument,
    /// Any allocation failure
    OutOfMemory,
    /// No usable boot device
    BadDevice,
    /// No file-path node to hand to the loaded image
    UnknownDevice,
    /// Malformed or unsupported executable
    BadFileType,
    /// Short file, firmware loader rejection, image reported failure
    BadOs,
    /// Malformed node or section length
    OutOfRange,
}

/// Errors produced while loading or starting a chained image
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Chainload invoked without a filename
    FilenameExpected,
    /// The path has no `/` separating directory and file
    InvalidFilePath,
    /// A device-path node declares a length below the node header size
    MalformedDevicePathNode {
        /// Declared node length
        length: usize,
    },
    /// A device path ran past its buffer without an end node
    UnterminatedDevicePath,
    /// An encoded path component does not fit a 16-bit node length
    PathComponentTooLong,
    /// The root device has no device path
    NotARootDevice,
    /// The built path contains no media file-path node
    NoMatchingFilePath,
    /// Pool or page allocation failed
    OutOfMemory,
    /// The firmware loader ran out of resources
    OutOfResources,
    /// The file could not be opened
    FileNotFound,
    /// The boot medium failed while reading
    Io(Status),
    /// The file was empty or shorter than its reported size
    PrematureEndOfFile,
    /// The file is larger than the configured limit
    ImageTooLarge {
        /// File size in bytes
        size: u64,
    },
    /// A universal binary has no slice for this CPU
    NoCompatibleArch,
    /// The firmware refused to load the image
    CannotLoadImage(Status),
    /// The loaded-image protocol could not be found
    NoLoadedImage,
    /// The started image returned an error
    ImageFailed {
        /// Status returned by the image
        status: Status,
        /// Exit data reported by the image, if any
        message: heapless::String<MAX_EXIT_MESSAGE>,
    },
    /// The executable header is malformed
    InvalidHeader(&'static str),
    /// The executable targets another machine
    UnsupportedMachine(u16),
    /// Section alignment is zero or not a power of two
    InvalidSectionAlignment(u32),
    /// No trust-root protocol is installed
    NoShimLock,
    /// The trust root rejected the image signature
    VerifyFailed,
    /// The trust root cannot parse this image format
    ContextUnsupported,
    /// The trust root rejected the image header
    ContextInvalidParameter,
    /// The trust root failed with another status
    ContextError(Status),
    /// A section lies outside the declared image
    InvalidSectionSize,
    /// The relocation directory or a block extends past the image
    RelocationOverflow,
    /// A relocation block is smaller than its own header
    InvalidRelocationBlock {
        /// Declared block size
        size: u32,
    },
    /// A relocation block's page lies outside the image
    InvalidFixupBase,
    /// A fixup kind this loader does not implement
    UnknownRelocation(u8),
    /// The entry point lies outside the image
    InvalidEntryPoint,
}

/// Result type for chainloader operations
pub type Result<T> = core::result::Result<T, Error>;

impl Error {
    /// Error class for this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::FilenameExpected
            | Error::InvalidFilePath
            | Error::NoShimLock
            | Error::VerifyFailed
            | Error::ContextUnsupported
            | Error::ContextInvalidParameter
            | Error::ContextError(_) => ErrorKind::BadArgument,
            Error::OutOfMemory | Error::OutOfResources => ErrorKind::OutOfMemory,
            Error::NotARootDevice | Error::Io(_) => ErrorKind::BadDevice,
            Error::NoMatchingFilePath | Error::FileNotFound => ErrorKind::UnknownDevice,
            Error::MalformedDevicePathNode { .. }
            | Error::UnterminatedDevicePath
            | Error::PathComponentTooLong
            | Error::InvalidSectionSize => ErrorKind::OutOfRange,
            Error::PrematureEndOfFile
            | Error::ImageTooLarge { .. }
            | Error::NoCompatibleArch
            | Error::CannotLoadImage(_)
            | Error::NoLoadedImage
            | Error::ImageFailed { .. } => ErrorKind::BadOs,
            Error::InvalidHeader(_)
            | Error::UnsupportedMachine(_)
            | Error::InvalidSectionAlignment(_)
            | Error::RelocationOverflow
            | Error::InvalidRelocationBlock { .. }
            | Error::InvalidFixupBase
            | Error::UnknownRelocation(_)
            | Error::InvalidEntryPoint => ErrorKind::BadFileType,
        }
    }

    /// EFI status equivalent, for reporting across the firmware boundary
    pub fn status(&self) -> Status {
        match self {
            Error::VerifyFailed => Status::SECURITY_VIOLATION,
            Error::ContextUnsupported | Error::UnsupportedMachine(_) => Status::UNSUPPORTED,
            Error::CannotLoadImage(status)
            | Error::ContextError(status)
            | Error::ImageFailed { status, .. }
            | Error::Io(status) => *status,
            Error::NoShimLock => Status::NOT_FOUND,
            _ => match self.kind() {
                ErrorKind::BadArgument => Status::INVALID_PARAMETER,
                ErrorKind::OutOfMemory => Status::OUT_OF_RESOURCES,
                ErrorKind::BadDevice | ErrorKind::UnknownDevice => Status::NOT_FOUND,
                ErrorKind::BadFileType | ErrorKind::BadOs => Status::LOAD_ERROR,
                ErrorKind::OutOfRange => Status::BAD_BUFFER_SIZE,
            },
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::FilenameExpected => write!(f, "filename expected"),
            Error::InvalidFilePath => write!(f, "invalid file path"),
            Error::MalformedDevicePathNode { length } => {
                write!(f, "malformed device path node has length={}", length)
            }
            Error::UnterminatedDevicePath => write!(f, "device path has no end node"),
            Error::PathComponentTooLong => write!(f, "file path component too long"),
            Error::NotARootDevice => write!(f, "not a valid root device"),
            Error::NoMatchingFilePath => write!(f, "no matching file path found"),
            Error::OutOfMemory => write!(f, "out of memory"),
            Error::OutOfResources => write!(f, "out of resources"),
            Error::FileNotFound => write!(f, "file not found"),
            Error::Io(status) => write!(f, "read error ({:#x})", status.as_usize()),
            Error::PrematureEndOfFile => write!(f, "premature end of file"),
            Error::ImageTooLarge { size } => write!(f, "image too large ({} bytes)", size),
            Error::NoCompatibleArch => write!(f, "no compatible arch found"),
            Error::CannotLoadImage(_) => write!(f, "cannot load image"),
            Error::NoLoadedImage => write!(f, "no loaded image available"),
            Error::ImageFailed { message, .. } => {
                if message.is_empty() {
                    write!(f, "unknown error")
                } else {
                    write!(f, "{}", message)
                }
            }
            Error::InvalidHeader(reason) => write!(f, "invalid PE header: {}", reason),
            Error::UnsupportedMachine(machine) => {
                write!(f, "unsupported machine type {:#06x}", machine)
            }
            Error::InvalidSectionAlignment(align) => {
                write!(f, "invalid section alignment {:#x}", align)
            }
            Error::NoShimLock => write!(f, "no shim lock protocol"),
            Error::VerifyFailed => write!(f, "verify failed"),
            Error::ContextUnsupported => write!(f, "context error unsupported"),
            Error::ContextInvalidParameter => write!(f, "context error invalid parameter"),
            Error::ContextError(_) => write!(f, "context error code"),
            Error::InvalidSectionSize => write!(f, "invalid section size"),
            Error::RelocationOverflow => write!(f, "relocation table overflows binary"),
            Error::InvalidRelocationBlock { size } => {
                write!(f, "invalid relocation block size {}", size)
            }
            Error::InvalidFixupBase => write!(f, "invalid fixup base"),
            Error::UnknownRelocation(kind) => write!(f, "unknown relocation type {}", kind),
            Error::InvalidEntryPoint => write!(f, "invalid entry point"),
        }
    }
}
