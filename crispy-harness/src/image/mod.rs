//! Firmware image formats.

pub mod uf2;

pub use uf2::{FirmwareImage, Uf2Block, Uf2Encoder, Uf2Summary};
