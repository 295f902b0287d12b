//! RTT implemented on plain memory access.
//!
//! The decoder finds the control block by scanning a RAM window for its signature, caches the
//! location of up channel 0 and then drains that ring buffer by reading the live offsets, copying
//! the pending bytes and writing the new read offset back.

use std::cmp::min;

use super::descriptor::{BufferDescriptor, ControlBlockHeader, HEADER_SIZE, RTT_SIGNATURE};
use super::{Error, ScanWindow};
use crate::probe::MemoryInterface;

/// Buffers larger than this are most likely a misparsed descriptor.
const SUSPICIOUS_BUFFER_SIZE: u32 = 0x10_0000;

/// Up to this many channels per direction are plausible.
const MAX_CHANNELS: u32 = 255;

/// Software decoder for up channel 0.
#[derive(Debug)]
pub struct SoftRtt {
    window: ScanWindow,
    max_read: usize,
    control_block: Option<u32>,
    up: Option<BufferDescriptor>,
}

impl SoftRtt {
    /// Creates a decoder that searches `window` and takes at most `max_read` bytes per poll.
    pub fn new(window: ScanWindow, max_read: usize) -> Self {
        Self {
            window,
            max_read: max_read.max(1),
            control_block: None,
            up: None,
        }
    }

    /// Address of the control block found by the last successful [`SoftRtt::initialize`].
    pub fn control_block(&self) -> Option<u32> {
        self.control_block
    }

    /// The up channel descriptor as it was read during initialization.
    pub fn descriptor(&self) -> Option<&BufferDescriptor> {
        self.up.as_ref()
    }

    pub fn is_initialized(&self) -> bool {
        self.up.is_some()
    }

    /// Scans the window for the control block signature and returns its address.
    ///
    /// Each chunk is searched together with the last bytes of the chunk before it, so a signature
    /// that crosses a chunk border is found as well. Chunks that cannot be read are skipped, which
    /// also covers windows that extend past the end of the target's RAM.
    pub fn find_control_block<M>(&self, memory: &mut M) -> Result<u32, Error>
    where
        M: MemoryInterface + ?Sized,
    {
        let end = self.window.end();
        let chunk_size = u64::from(self.window.chunk_size).max(RTT_SIGNATURE.len() as u64);
        let overlap = RTT_SIGNATURE.len() - 1;

        tracing::debug!(
            "Scanning {:#010x}..{:#010x} for the RTT control block",
            self.window.base,
            end
        );

        let mut chunk = Vec::new();
        // Tail of the previous chunk followed by the current one.
        let mut haystack = Vec::new();
        let mut start = u64::from(self.window.base);
        while start < end {
            let Ok(address) = u32::try_from(start) else {
                break;
            };
            chunk.resize(min(chunk_size, end - start) as usize, 0);

            match memory.read(address, &mut chunk) {
                Ok(()) => {
                    let carried = haystack.len();
                    haystack.extend_from_slice(&chunk);

                    if let Some(offset) = haystack
                        .windows(RTT_SIGNATURE.len())
                        .position(|window| window == RTT_SIGNATURE)
                    {
                        let found = address
                            .wrapping_sub(carried as u32)
                            .wrapping_add(offset as u32);
                        tracing::info!("Found RTT control block at {found:#010x}");
                        return Ok(found);
                    }

                    let keep = min(overlap, haystack.len());
                    haystack.drain(..haystack.len() - keep);
                }
                Err(error) => {
                    tracing::trace!("Skipping unreadable chunk at {address:#010x}: {error}");
                    haystack.clear();
                }
            }

            start += chunk_size;
        }

        Err(Error::ControlBlockNotFound {
            start: self.window.base,
            end,
        })
    }

    /// Locates the control block and reads the descriptor of up channel 0.
    pub fn initialize<M>(&mut self, memory: &mut M) -> Result<(), Error>
    where
        M: MemoryInterface + ?Sized,
    {
        self.invalidate();

        let control_block = self.find_control_block(memory)?;

        let mut mem = [0u8; HEADER_SIZE + BufferDescriptor::SIZE];
        memory.read(control_block, &mut mem)?;

        let header = ControlBlockHeader::parse(&mem)?;
        if header.max_up_channels > MAX_CHANNELS || header.max_down_channels > MAX_CHANNELS {
            return Err(Error::ControlBlockCorrupted(format!(
                "Unexpected array sizes at {control_block:#010x}: max_up_channels={} max_down_channels={}",
                header.max_up_channels, header.max_down_channels
            )));
        }
        if header.max_up_channels == 0 {
            return Err(Error::ChannelNotInitialized { control_block });
        }

        let up = BufferDescriptor::parse(&mem[HEADER_SIZE..])?;
        if up.buffer_ptr == 0 || up.size == 0 {
            return Err(Error::ChannelNotInitialized { control_block });
        }

        if up.buffer_ptr < self.window.base || up.size > SUSPICIOUS_BUFFER_SIZE {
            tracing::warn!(
                "Up channel 0 looks suspicious: buffer at {:#010x} with {} bytes",
                up.buffer_ptr,
                up.size
            );
        }

        tracing::debug!(
            "Up channel 0: buffer {:#010x}, size {}, write {}, read {}",
            up.buffer_ptr,
            up.size,
            up.write,
            up.read
        );

        self.control_block = Some(control_block);
        self.up = Some(up);
        Ok(())
    }

    /// Drops the cached control block so the next [`SoftRtt::initialize`] scans again.
    pub fn invalidate(&mut self) {
        self.control_block = None;
        self.up = None;
    }

    /// Scans again, for a target that was reset or moved its control block.
    pub fn reinitialize<M>(&mut self, memory: &mut M) -> Result<(), Error>
    where
        M: MemoryInterface + ?Sized,
    {
        tracing::debug!("Re-initializing software RTT");
        self.initialize(memory)
    }

    /// Takes the pending bytes out of the up buffer.
    ///
    /// Returns `None` when the buffer is empty. Offsets outside the buffer are reported as
    /// [`Error::OffsetsOutOfBounds`] before anything in the data region is read.
    pub fn poll<M>(&mut self, memory: &mut M) -> Result<Option<Vec<u8>>, Error>
    where
        M: MemoryInterface + ?Sized,
    {
        let (Some(control_block), Some(up)) = (self.control_block, self.up) else {
            return Err(Error::NotInitialized);
        };
        let descriptor = BufferDescriptor::up_channel_address(control_block);

        // The target moves the write offset all the time, so both offsets are read live.
        let mut offsets = [0u8; 8];
        memory.read(
            descriptor.wrapping_add(BufferDescriptor::O_WRITE as u32),
            &mut offsets,
        )?;
        let write = u32::from_le_bytes([offsets[0], offsets[1], offsets[2], offsets[3]]);
        let read = u32::from_le_bytes([offsets[4], offsets[5], offsets[6], offsets[7]]);
        let size = up.size;

        if write >= size || read >= size {
            return Err(Error::OffsetsOutOfBounds { write, read, size });
        }
        if write == read {
            return Ok(None);
        }

        let pending = if write > read {
            write - read
        } else {
            size - read + write
        };
        let take = min(pending as usize, self.max_read) as u32;
        if take < pending {
            tracing::debug!("Capping RTT read at {take} of {pending} pending bytes");
        }

        let mut data = vec![0u8; take as usize];
        let tail = min(take, size - read);
        memory.read(
            up.buffer_ptr.wrapping_add(read),
            &mut data[..tail as usize],
        )?;
        if tail < take {
            memory.read(up.buffer_ptr, &mut data[tail as usize..])?;
        }

        let new_read = (read + take) % size;
        if let Err(error) = memory.write_word_32(
            descriptor.wrapping_add(BufferDescriptor::O_READ as u32),
            new_read,
        ) {
            tracing::warn!("Could not write back the RTT read offset {new_read}: {error}");
        }

        tracing::trace!("RTT: read {take} bytes, read offset {read} -> {new_read}");
        Ok(Some(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{Access, FakeProbe};
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    const RAM: u32 = 0x2000_0000;
    const RAM_SIZE: usize = 0x1_0000;
    const CB: u32 = 0x2000_1000;
    const BUFFER: u32 = 0x2000_2000;

    fn control_block(buffer: u32, size: u32, write: u32, read: u32) -> Vec<u8> {
        let mut mem = vec![0u8; HEADER_SIZE];
        mem[..RTT_SIGNATURE.len()].copy_from_slice(RTT_SIGNATURE);
        mem[16..20].copy_from_slice(&1u32.to_le_bytes());
        mem[20..24].copy_from_slice(&1u32.to_le_bytes());
        for word in [0, buffer, size, write, read, 0] {
            mem.extend_from_slice(&word.to_le_bytes());
        }
        mem
    }

    fn target(size: u32, write: u32, read: u32) -> (FakeProbe, SoftRtt) {
        let probe = FakeProbe::new().with_ram(RAM, RAM_SIZE);
        probe.load(CB, &control_block(BUFFER, size, write, read));

        let mut probe_handle = probe.clone();
        let mut rtt = SoftRtt::new(ScanWindow::default(), 32 * 1024);
        rtt.initialize(&mut probe_handle).unwrap();
        probe.clear_accesses();
        (probe, rtt)
    }

    fn read_offset(probe: &FakeProbe) -> u32 {
        let bytes = probe.memory(CB + HEADER_SIZE as u32 + 16, 4);
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    #[test_case(0; "window start")]
    #[test_case(0x7ff0; "middle")]
    #[test_case(0x800 * 31; "final chunk boundary")]
    #[test_case(0x800 - 4; "straddling two chunks")]
    #[test_case(0x1_0000 - 10; "window end")]
    fn finds_signature(offset: u32) {
        let mut probe = FakeProbe::new().with_ram(RAM, RAM_SIZE);
        probe.load(RAM + offset, RTT_SIGNATURE);

        let rtt = SoftRtt::new(ScanWindow::default(), 1024);

        assert_eq!(rtt.find_control_block(&mut probe).unwrap(), RAM + offset);
    }

    #[test_case(0x5000, 0x4900; "last chunk of small ram")]
    #[test_case(0x5000, 0x5000 - 10; "end of small ram")]
    #[test_case(0x5000, 0x4800 - 4; "straddling into the last chunk of small ram")]
    fn finds_signature_in_ram_smaller_than_window(ram_size: usize, offset: u32) {
        let mut probe = FakeProbe::new().with_ram(RAM, ram_size);
        probe.load(RAM + offset, RTT_SIGNATURE);

        let rtt = SoftRtt::new(ScanWindow::default(), 1024);

        assert_eq!(rtt.find_control_block(&mut probe).unwrap(), RAM + offset);
    }

    #[test]
    fn signature_split_by_unreadable_chunk_is_not_stitched() {
        // Two readable regions with a gap: the halves of a signature must not be joined across it.
        let mut probe = FakeProbe::new()
            .with_ram(RAM, 0x800)
            .with_ram(RAM + 0x1000, 0x800);
        probe.load(RAM + 0x800 - 4, &RTT_SIGNATURE[..4]);
        probe.load(RAM + 0x1000, &RTT_SIGNATURE[4..]);

        let rtt = SoftRtt::new(ScanWindow::default(), 1024);

        assert!(matches!(
            rtt.find_control_block(&mut probe),
            Err(Error::ControlBlockNotFound { .. })
        ));
    }

    #[test]
    fn missing_signature() {
        let mut probe = FakeProbe::new().with_ram(RAM, RAM_SIZE);
        let mut rtt = SoftRtt::new(ScanWindow::default(), 1024);

        assert!(matches!(
            rtt.initialize(&mut probe),
            Err(Error::ControlBlockNotFound { start: RAM, .. })
        ));
        assert!(!rtt.is_initialized());
    }

    #[test]
    fn unreadable_chunks_are_skipped() {
        // Only the second half of the window is backed by memory.
        let mut probe = FakeProbe::new().with_ram(RAM + 0x8000, 0x8000);
        probe.load(CB + 0x8000, &control_block(BUFFER + 0x8000, 64, 0, 0));

        let mut rtt = SoftRtt::new(ScanWindow::default(), 1024);
        rtt.initialize(&mut probe).unwrap();

        assert_eq!(rtt.control_block(), Some(CB + 0x8000));
        assert_eq!(rtt.descriptor().unwrap().size, 64);
    }

    #[test]
    fn unused_channel_is_not_initialized() {
        let mut probe = FakeProbe::new().with_ram(RAM, RAM_SIZE);
        probe.load(CB, &control_block(0, 0, 0, 0));
        let mut rtt = SoftRtt::new(ScanWindow::default(), 1024);

        assert!(matches!(
            rtt.initialize(&mut probe),
            Err(Error::ChannelNotInitialized { control_block: CB })
        ));
    }

    #[test]
    fn wraparound_read() {
        let size = 64;
        let (mut probe, mut rtt) = target(size, 2, size - 3);
        probe.load(BUFFER + size - 3, b"ABC");
        probe.load(BUFFER, b"DE");

        let data = rtt.poll(&mut probe).unwrap().unwrap();

        assert_eq!(data, b"ABCDE");
        assert_eq!(read_offset(&probe), 2);
    }

    #[test]
    fn contiguous_read() {
        let (mut probe, mut rtt) = target(64, 13, 8);
        probe.load(BUFFER + 8, b"hello");

        assert_eq!(rtt.poll(&mut probe).unwrap().unwrap(), b"hello");
        assert_eq!(read_offset(&probe), 13);
        assert_eq!(rtt.poll(&mut probe).unwrap(), None);
    }

    #[test]
    fn equal_offsets_mean_no_data() {
        let (mut probe, mut rtt) = target(64, 5, 5);

        assert_eq!(rtt.poll(&mut probe).unwrap(), None);
        assert_eq!(probe.accesses().len(), 1);
    }

    #[test]
    fn read_is_capped() {
        let size = 256;
        let probe = FakeProbe::new().with_ram(RAM, RAM_SIZE);
        probe.load(CB, &control_block(BUFFER, size, 200, 10));
        let mut handle = probe.clone();
        let mut rtt = SoftRtt::new(ScanWindow::default(), 100);
        rtt.initialize(&mut handle).unwrap();

        let data = rtt.poll(&mut handle).unwrap().unwrap();
        assert_eq!(data.len(), 100);
        assert_eq!(read_offset(&probe), 110);

        let data = rtt.poll(&mut handle).unwrap().unwrap();
        assert_eq!(data.len(), 90);
        assert_eq!(read_offset(&probe), 200);
    }

    #[test]
    fn capped_read_wraps_modulo_size() {
        let size = 64;
        let probe = FakeProbe::new().with_ram(RAM, RAM_SIZE);
        probe.load(CB, &control_block(BUFFER, size, 30, 40));
        let mut handle = probe.clone();
        let mut rtt = SoftRtt::new(ScanWindow::default(), 32);
        rtt.initialize(&mut handle).unwrap();

        let data = rtt.poll(&mut handle).unwrap().unwrap();

        assert_eq!(data.len(), 32);
        assert_eq!(read_offset(&probe), (40 + 32) % size);
    }

    #[test_case(64, 0, 64; "write equals size")]
    #[test_case(64, 70, 0; "write beyond size")]
    #[test_case(64, 3, 64; "read equals size")]
    #[test_case(64, 1, 0xffff_ffff; "read far out")]
    fn invalid_offsets_are_corruption(size: u32, write: u32, read: u32) {
        let (mut probe, mut rtt) = target(size, 0, 0);
        let descriptor = CB + HEADER_SIZE as u32;
        probe.load(descriptor + 12, &write.to_le_bytes());
        probe.load(descriptor + 16, &read.to_le_bytes());

        let result = rtt.poll(&mut probe);

        assert!(matches!(
            result,
            Err(Error::OffsetsOutOfBounds { size: s, .. }) if s == size
        ));
        // Only the offsets were read, nothing from the data region.
        assert_eq!(
            probe.accesses(),
            vec![Access::Read {
                address: descriptor + 12,
                len: 8
            }]
        );
    }

    #[test]
    fn failed_write_back_still_returns_data() {
        let (mut probe, mut rtt) = target(64, 4, 0);
        probe.load(BUFFER, b"ping");
        probe.set_writes_failing(true);

        assert_eq!(rtt.poll(&mut probe).unwrap().unwrap(), b"ping");
        assert_eq!(read_offset(&probe), 0);
    }

    #[test]
    fn poll_before_initialize() {
        let mut probe = FakeProbe::new().with_ram(RAM, RAM_SIZE);
        let mut rtt = SoftRtt::new(ScanWindow::default(), 1024);

        assert!(matches!(rtt.poll(&mut probe), Err(Error::NotInitialized)));
    }
}
