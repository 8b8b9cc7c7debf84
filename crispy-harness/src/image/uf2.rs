//! UF2 block encoding for mask-ROM mass-storage programming.
//!
//! A UF2 file is a sequence of self-describing 512-byte blocks. The RP2040
//! boot ROM reprograms flash from any such file copied to its `RPI-RP2`
//! volume and reboots once the last block has been written.
//!
//! ## Block Layout
//!
//! ```text
//! offset  size  field
//! ------  ----  -----------------------------------------
//!      0     4  magic start 0 (0x0A324655, "UF2\n")
//!      4     4  magic start 1 (0x9E5D5157)
//!      8     4  flags (0x00002000: family id present)
//!     12     4  target address
//!     16     4  payload size
//!     20     4  block index
//!     24     4  block count
//!     28     4  family id
//!     32   476  payload, zero-padded
//!    508     4  magic end (0x0AB16F30)
//! ```
//!
//! All integers are little-endian.

use crate::error::{Error, Result};
use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use log::debug;
use std::fs::{self, File};
use std::io::{BufWriter, Cursor, Write};
use std::path::Path;

/// First start magic ("UF2\n").
pub const UF2_MAGIC_START0: u32 = 0x0A32_4655;

/// Second start magic.
pub const UF2_MAGIC_START1: u32 = 0x9E5D_5157;

/// End magic, last word of every block.
pub const UF2_MAGIC_END: u32 = 0x0AB1_6F30;

/// Flag: the family id field is valid.
pub const UF2_FLAG_FAMILY_ID_PRESENT: u32 = 0x0000_2000;

/// RP2040 family id.
pub const RP2040_FAMILY_ID: u32 = 0xE48B_FF56;

/// Size of every block on disk.
pub const BLOCK_SIZE: usize = 512;

/// Header size (eight 32-bit words).
pub const HEADER_SIZE: usize = 32;

/// Trailer size (one 32-bit word).
pub const FOOTER_SIZE: usize = 4;

/// Largest payload a block can carry.
pub const MAX_PAYLOAD_SIZE: usize = BLOCK_SIZE - HEADER_SIZE - FOOTER_SIZE;

/// Payload size written by the RP2040 tooling (one flash page).
pub const DEFAULT_PAYLOAD_SIZE: usize = 256;

/// A raw binary image and the address it is linked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    data: Vec<u8>,
    base_address: u32,
}

impl FirmwareImage {
    /// Wrap raw bytes destined for `base_address`.
    pub fn new(data: Vec<u8>, base_address: u32) -> Self {
        Self { data, base_address }
    }

    /// Load a raw binary file.
    pub fn from_file<P: AsRef<Path>>(path: P, base_address: u32) -> Result<Self> {
        Ok(Self::new(fs::read(path)?, base_address))
    }

    /// Image bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Target base address.
    pub fn base_address(&self) -> u32 {
        self.base_address
    }

    /// Whether the image has no bytes.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// A single UF2 block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uf2Block {
    /// Block flags.
    pub flags: u32,
    /// Absolute flash address of the payload.
    pub target_addr: u32,
    /// Number of payload bytes the device programs.
    pub payload_size: u32,
    /// Zero-based index within the file.
    pub block_no: u32,
    /// Total number of blocks in the file.
    pub num_blocks: u32,
    /// Family id (or file size when the family flag is clear).
    pub family_id: u32,
    data: [u8; MAX_PAYLOAD_SIZE],
}

impl Uf2Block {
    /// The `payload_size` bytes carried by this block.
    pub fn payload(&self) -> &[u8] {
        let len = (self.payload_size as usize).min(MAX_PAYLOAD_SIZE);
        &self.data[..len]
    }

    /// Serialize to the 512-byte on-disk frame.
    pub fn to_bytes(&self) -> [u8; BLOCK_SIZE] {
        let header = [
            UF2_MAGIC_START0,
            UF2_MAGIC_START1,
            self.flags,
            self.target_addr,
            self.payload_size,
            self.block_no,
            self.num_blocks,
            self.family_id,
        ];
        let mut out = [0u8; BLOCK_SIZE];
        LittleEndian::write_u32_into(&header, &mut out[..HEADER_SIZE]);
        out[HEADER_SIZE..HEADER_SIZE + MAX_PAYLOAD_SIZE].copy_from_slice(&self.data);
        LittleEndian::write_u32(&mut out[BLOCK_SIZE - FOOTER_SIZE..], UF2_MAGIC_END);
        out
    }

    /// Parse and validate one 512-byte frame.
    pub fn parse(frame: &[u8]) -> Result<Self> {
        if frame.len() != BLOCK_SIZE {
            return Err(Error::InvalidImage(format!(
                "block is {} bytes, expected {BLOCK_SIZE}",
                frame.len()
            )));
        }

        let mut reader = Cursor::new(frame);
        let magic0 = reader.read_u32::<LittleEndian>()?;
        let magic1 = reader.read_u32::<LittleEndian>()?;
        if magic0 != UF2_MAGIC_START0 || magic1 != UF2_MAGIC_START1 {
            return Err(Error::InvalidImage(format!(
                "bad start magic {magic0:#010x} {magic1:#010x}"
            )));
        }
        let flags = reader.read_u32::<LittleEndian>()?;
        let target_addr = reader.read_u32::<LittleEndian>()?;
        let payload_size = reader.read_u32::<LittleEndian>()?;
        let block_no = reader.read_u32::<LittleEndian>()?;
        let num_blocks = reader.read_u32::<LittleEndian>()?;
        let family_id = reader.read_u32::<LittleEndian>()?;

        let mut end = &frame[BLOCK_SIZE - FOOTER_SIZE..];
        let magic_end = end.read_u32::<LittleEndian>()?;
        if magic_end != UF2_MAGIC_END {
            return Err(Error::InvalidImage(format!(
                "bad end magic {magic_end:#010x} in block {block_no}"
            )));
        }
        if payload_size as usize > MAX_PAYLOAD_SIZE {
            return Err(Error::InvalidImage(format!(
                "payload size {payload_size} exceeds {MAX_PAYLOAD_SIZE}"
            )));
        }

        let mut data = [0u8; MAX_PAYLOAD_SIZE];
        data.copy_from_slice(&frame[HEADER_SIZE..HEADER_SIZE + MAX_PAYLOAD_SIZE]);

        Ok(Self {
            flags,
            target_addr,
            payload_size,
            block_no,
            num_blocks,
            family_id,
            data,
        })
    }

    /// Whether the family id field is meaningful.
    pub fn has_family_id(&self) -> bool {
        self.flags & UF2_FLAG_FAMILY_ID_PRESENT != 0
    }
}

/// Splits raw images into UF2 blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Uf2Encoder {
    family_id: u32,
    payload_size: usize,
}

impl Default for Uf2Encoder {
    fn default() -> Self {
        Self::new(RP2040_FAMILY_ID)
    }
}

impl Uf2Encoder {
    /// Encoder for `family_id` with the default 256-byte payload.
    pub fn new(family_id: u32) -> Self {
        Self {
            family_id,
            payload_size: DEFAULT_PAYLOAD_SIZE,
        }
    }

    /// Use a different payload size.
    pub fn with_payload_size(mut self, payload_size: usize) -> Result<Self> {
        if payload_size == 0 || payload_size > MAX_PAYLOAD_SIZE {
            return Err(Error::InvalidImage(format!(
                "payload size must be 1..={MAX_PAYLOAD_SIZE}, got {payload_size}"
            )));
        }
        self.payload_size = payload_size;
        Ok(self)
    }

    /// Family id stamped into every block.
    pub fn family_id(&self) -> u32 {
        self.family_id
    }

    /// Payload bytes per block.
    pub fn payload_size(&self) -> usize {
        self.payload_size
    }

    /// Number of blocks `len` bytes encode to.
    pub fn block_count(&self, len: usize) -> usize {
        len.div_ceil(self.payload_size)
    }

    /// Encode an image. An empty image yields no blocks.
    pub fn encode(&self, image: &FirmwareImage) -> Vec<Uf2Block> {
        let num_blocks = self.block_count(image.data.len()) as u32;

        image
            .data
            .chunks(self.payload_size)
            .enumerate()
            .map(|(index, chunk)| {
                let mut data = [0u8; MAX_PAYLOAD_SIZE];
                data[..chunk.len()].copy_from_slice(chunk);
                let offset = (index * self.payload_size) as u32;
                Uf2Block {
                    flags: UF2_FLAG_FAMILY_ID_PRESENT,
                    target_addr: image.base_address.wrapping_add(offset),
                    payload_size: self.payload_size as u32,
                    block_no: index as u32,
                    num_blocks,
                    family_id: self.family_id,
                    data,
                }
            })
            .collect()
    }

    /// Encode an image straight into `writer`, returning the block count.
    pub fn write_to<W: Write>(&self, image: &FirmwareImage, mut writer: W) -> Result<usize> {
        let blocks = self.encode(image);
        for block in &blocks {
            writer.write_all(&block.to_bytes())?;
        }
        writer.flush()?;
        Ok(blocks.len())
    }

    /// Convert a raw binary file into a UF2 file.
    ///
    /// Empty input is rejected before `output` is created: a UF2 file with
    /// no blocks is not valid.
    pub fn encode_file(&self, input: &Path, output: &Path, base_address: u32) -> Result<usize> {
        let image = FirmwareImage::from_file(input, base_address)?;
        if image.is_empty() {
            return Err(Error::InvalidImage(format!(
                "{} is empty, refusing to write a UF2 with no blocks",
                input.display()
            )));
        }

        let file = File::create(output)?;
        let count = self.write_to(&image, BufWriter::new(file))?;
        debug!(
            "Encoded {} ({} bytes) into {} blocks at {:#010x}",
            input.display(),
            image.data.len(),
            count,
            base_address
        );
        Ok(count)
    }
}

/// Consistency summary of an encoded UF2 file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uf2Summary {
    /// Number of blocks in the file.
    pub blocks: usize,
    /// Family id shared by all blocks.
    pub family_id: u32,
    /// Lowest target address.
    pub start_addr: u32,
    /// One past the highest programmed byte.
    pub end_addr: u32,
    /// Sum of payload sizes.
    pub payload_bytes: usize,
}

impl Uf2Summary {
    /// Parse every block and check the sequence invariants.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() || bytes.len() % BLOCK_SIZE != 0 {
            return Err(Error::InvalidImage(format!(
                "file size {} is not a positive multiple of {BLOCK_SIZE}",
                bytes.len()
            )));
        }

        let blocks = bytes
            .chunks_exact(BLOCK_SIZE)
            .map(Uf2Block::parse)
            .collect::<Result<Vec<_>>>()?;

        let first = &blocks[0];
        let mut start_addr = u32::MAX;
        let mut end_addr = 0u32;
        let mut payload_bytes = 0usize;

        for (index, block) in blocks.iter().enumerate() {
            if block.block_no as usize != index {
                return Err(Error::InvalidImage(format!(
                    "block {index} has index {}",
                    block.block_no
                )));
            }
            if block.num_blocks as usize != blocks.len() {
                return Err(Error::InvalidImage(format!(
                    "block {index} claims {} blocks, file has {}",
                    block.num_blocks,
                    blocks.len()
                )));
            }
            if block.family_id != first.family_id {
                return Err(Error::InvalidImage(format!(
                    "block {index} family {:#010x} differs from {:#010x}",
                    block.family_id, first.family_id
                )));
            }
            start_addr = start_addr.min(block.target_addr);
            end_addr = end_addr.max(block.target_addr.saturating_add(block.payload_size));
            payload_bytes += block.payload_size as usize;
        }

        Ok(Self {
            blocks: blocks.len(),
            family_id: first.family_id,
            start_addr,
            end_addr,
            payload_bytes,
        })
    }

    /// Read and summarize a UF2 file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_bytes(&fs::read(path)?)
    }
}
