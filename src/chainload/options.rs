//! Load options and exit data
//!
//! The arguments after the file name become the chained image's load
//! options: joined by single spaces, UTF-16, NUL terminated. Exit data
//! coming back from a failed image is UTF-16 too and is turned into a
//! bounded message.

use alloc::vec::Vec;

use crate::error::{Error, Result, MAX_EXIT_MESSAGE};

/// Encode `args` as a load-options buffer
///
/// Returns `None` when there are no arguments.
pub fn encode(args: &[&str]) -> Result<Option<Vec<u16>>> {
    if args.is_empty() {
        return Ok(None);
    }

    let units: usize = args.iter().map(|arg| arg.encode_utf16().count() + 1).sum();

    let mut options = Vec::new();
    options.try_reserve_exact(units).map_err(|_| {
        log::error!("Chainload: Failed to allocate {} bytes of load options", units * 2);
        Error::OutOfMemory
    })?;

    for (index, arg) in args.iter().enumerate() {
        if index > 0 {
            options.push(u16::from(b' '));
        }
        options.extend(arg.encode_utf16());
    }
    options.push(0);

    Ok(Some(options))
}

/// Size of a load-options buffer in bytes, including the NUL
pub fn size_in_bytes(options: &[u16]) -> u32 {
    (options.len() * 2) as u32
}

/// Turn exit data into a message, stopping at the first NUL
///
/// Unpaired surrogates become U+FFFD. The message is cut at
/// [`MAX_EXIT_MESSAGE`] bytes.
pub fn exit_message(data: &[u16]) -> heapless::String<MAX_EXIT_MESSAGE> {
    let mut message = heapless::String::new();
    let units = data.iter().copied().take_while(|&unit| unit != 0);
    for c in char::decode_utf16(units) {
        if message
            .push(c.unwrap_or(char::REPLACEMENT_CHARACTER))
            .is_err()
        {
            break;
        }
    }
    message
}
