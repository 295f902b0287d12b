use scroll::{Pread, LE};

use super::Error;

/// Bytes searched for when scanning target RAM for the control block.
pub const RTT_SIGNATURE: &[u8] = b"SEGGER RTT";

// Control blocks must follow this data layout in target memory in order to be compatible with
// the official RTT implementation.
//
// struct ControlBlock {
//     char id[16]; // "SEGGER RTT", NUL padded
//     int max_up_channels;
//     int max_down_channels;
//     Buffer up[max_up_channels];
//     Buffer down[max_down_channels];
// }
//
// struct Buffer {
//     const char *name;
//     char *buffer;
//     unsigned int size; // The actual capacity is one byte less.
//     unsigned int write; // Advanced by the target only.
//     unsigned int read; // Advanced by the host only.
//     unsigned int flags;
// }

/// Size of the control block header in bytes.
pub const HEADER_SIZE: usize = 24;

const O_MAX_UP: usize = 16;
const O_MAX_DOWN: usize = 20;

/// The fixed part of the control block.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ControlBlockHeader {
    pub max_up_channels: u32,
    pub max_down_channels: u32,
}

impl ControlBlockHeader {
    /// Parses the header. `mem` starts at the control block address.
    pub fn parse(mem: &[u8]) -> Result<Self, Error> {
        let field = |offset: usize| -> Result<u32, Error> {
            mem.pread_with(offset, LE).map_err(|_| {
                Error::ControlBlockCorrupted(format!("header truncated at offset {offset}"))
            })
        };

        if !mem.starts_with(RTT_SIGNATURE) {
            return Err(Error::ControlBlockCorrupted(
                "signature no longer present".to_string(),
            ));
        }

        Ok(Self {
            max_up_channels: field(O_MAX_UP)?,
            max_down_channels: field(O_MAX_DOWN)?,
        })
    }
}

/// A ring buffer descriptor as found in target memory.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BufferDescriptor {
    pub name_ptr: u32,
    pub buffer_ptr: u32,
    pub size: u32,
    pub write: u32,
    pub read: u32,
    pub flags: u32,
}

impl BufferDescriptor {
    /// Size of a descriptor in target memory in bytes.
    pub const SIZE: usize = 24;

    const O_NAME: usize = 0;
    const O_BUFFER_PTR: usize = 4;
    const O_SIZE: usize = 8;
    pub const O_WRITE: usize = 12;
    pub const O_READ: usize = 16;
    const O_FLAGS: usize = 20;

    pub fn parse(mem: &[u8]) -> Result<Self, Error> {
        let field = |offset: usize| -> Result<u32, Error> {
            mem.pread_with(offset, LE).map_err(|_| {
                Error::ControlBlockCorrupted(format!("descriptor truncated at offset {offset}"))
            })
        };

        Ok(Self {
            name_ptr: field(Self::O_NAME)?,
            buffer_ptr: field(Self::O_BUFFER_PTR)?,
            size: field(Self::O_SIZE)?,
            write: field(Self::O_WRITE)?,
            read: field(Self::O_READ)?,
            flags: field(Self::O_FLAGS)?,
        })
    }

    /// Address of the first up channel descriptor of the control block at `control_block`.
    pub fn up_channel_address(control_block: u32) -> u32 {
        control_block.wrapping_add(HEADER_SIZE as u32)
    }
}
