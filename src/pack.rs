//! Byte-order boundary
//!
//! Every multi-byte integer and float in a container is little-endian on
//! disk. Entry field accessors and the block codec both go through the
//! helpers in this module, so it is the only place byte order is handled.
//!
//! Pixel buffers handed to callers are in native order. Block payloads are
//! converted with [`block_to_native`] after reading and [`block_to_disk`]
//! before writing; on little-endian hosts both are no-ops.

use serde::{Deserialize, Serialize};

/// Pixel (and basedata item) types, numbered as stored on disk
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelType {
    U1 = 0,
    U2 = 1,
    U4 = 2,
    U8 = 3,
    S8 = 4,
    U16 = 5,
    S16 = 6,
    U32 = 7,
    S32 = 8,
    F32 = 9,
    F64 = 10,
    C64 = 11,
    C128 = 12,
}

const ALL_TYPES: [PixelType; 13] = [
    PixelType::U1,
    PixelType::U2,
    PixelType::U4,
    PixelType::U8,
    PixelType::S8,
    PixelType::U16,
    PixelType::S16,
    PixelType::U32,
    PixelType::S32,
    PixelType::F32,
    PixelType::F64,
    PixelType::C64,
    PixelType::C128,
];

impl PixelType {
    /// Parse the on-disk type code
    ///
    /// Unknown codes return `None`; bands with such a type are invalid.
    pub fn from_code(code: i64) -> Option<Self> {
        usize::try_from(code)
            .ok()
            .and_then(|i| ALL_TYPES.get(i).copied())
    }

    /// Look a type up by its enumeration label (`"u8"`, `"f32"`, ...)
    pub fn from_name(name: &str) -> Option<Self> {
        ALL_TYPES
            .iter()
            .copied()
            .find(|t| t.name().eq_ignore_ascii_case(name))
    }

    pub fn code(self) -> i64 {
        self as i64
    }

    /// Enumeration label used by `Eimg_Layer.pixelType`
    pub fn name(self) -> &'static str {
        match self {
            PixelType::U1 => "u1",
            PixelType::U2 => "u2",
            PixelType::U4 => "u4",
            PixelType::U8 => "u8",
            PixelType::S8 => "s8",
            PixelType::U16 => "u16",
            PixelType::S16 => "s16",
            PixelType::U32 => "u32",
            PixelType::S32 => "s32",
            PixelType::F32 => "f32",
            PixelType::F64 => "f64",
            PixelType::C64 => "c64",
            PixelType::C128 => "c128",
        }
    }

    /// Bits per pixel
    pub fn bits(self) -> usize {
        match self {
            PixelType::U1 => 1,
            PixelType::U2 => 2,
            PixelType::U4 => 4,
            PixelType::U8 | PixelType::S8 => 8,
            PixelType::U16 | PixelType::S16 => 16,
            PixelType::U32 | PixelType::S32 | PixelType::F32 => 32,
            PixelType::F64 | PixelType::C64 => 64,
            PixelType::C128 => 128,
        }
    }

    /// Size of the unit that is byte-swapped between disk and native order
    ///
    /// Complex types swap each component separately.
    pub fn word_size(self) -> usize {
        match self {
            PixelType::U16 | PixelType::S16 => 2,
            PixelType::U32 | PixelType::S32 | PixelType::F32 | PixelType::C64 => 4,
            PixelType::F64 | PixelType::C128 => 8,
            _ => 1,
        }
    }

    /// Bytes needed to hold `pixels` pixels of this type, rounded up to whole bytes
    pub fn bytes_for(self, pixels: usize) -> Option<usize> {
        pixels
            .checked_mul(self.bits())
            .and_then(|b| b.checked_add(7))
            .map(|b| b / 8)
    }

    /// Item code used in per-layer dictionary snippets (`{4096:cdata,}`)
    pub(crate) fn item_code(self) -> char {
        match self {
            PixelType::U1 => '1',
            PixelType::U2 => '2',
            PixelType::U4 => '4',
            PixelType::U8 => 'c',
            PixelType::S8 => 'C',
            PixelType::U16 => 's',
            PixelType::S16 => 'S',
            PixelType::U32 | PixelType::S32 => 'L',
            PixelType::F32 => 'f',
            PixelType::F64 => 'd',
            PixelType::C64 => 'm',
            PixelType::C128 => 'M',
        }
    }
}

fn array<const N: usize>(buf: &[u8], offset: usize) -> Option<[u8; N]> {
    let end = offset.checked_add(N)?;
    buf.get(offset..end)?.try_into().ok()
}

fn place(buf: &mut [u8], offset: usize, bytes: &[u8]) -> Option<()> {
    let end = offset.checked_add(bytes.len())?;
    buf.get_mut(offset..end)?.copy_from_slice(bytes);
    Some(())
}

pub fn get_u8(buf: &[u8], offset: usize) -> Option<u8> {
    buf.get(offset).copied()
}

pub fn get_u16(buf: &[u8], offset: usize) -> Option<u16> {
    array(buf, offset).map(u16::from_le_bytes)
}

pub fn get_i16(buf: &[u8], offset: usize) -> Option<i16> {
    array(buf, offset).map(i16::from_le_bytes)
}

pub fn get_u32(buf: &[u8], offset: usize) -> Option<u32> {
    array(buf, offset).map(u32::from_le_bytes)
}

pub fn get_i32(buf: &[u8], offset: usize) -> Option<i32> {
    array(buf, offset).map(i32::from_le_bytes)
}

pub fn get_f32(buf: &[u8], offset: usize) -> Option<f32> {
    array(buf, offset).map(f32::from_le_bytes)
}

pub fn get_f64(buf: &[u8], offset: usize) -> Option<f64> {
    array(buf, offset).map(f64::from_le_bytes)
}

/// Big-endian 16-bit read, used by compressed block values
pub fn get_be_u16(buf: &[u8], offset: usize) -> Option<u16> {
    array(buf, offset).map(u16::from_be_bytes)
}

/// Big-endian 32-bit read, used by compressed block values
pub fn get_be_u32(buf: &[u8], offset: usize) -> Option<u32> {
    array(buf, offset).map(u32::from_be_bytes)
}

pub fn put_u8(buf: &mut [u8], offset: usize, value: u8) -> Option<()> {
    *buf.get_mut(offset)? = value;
    Some(())
}

pub fn put_u16(buf: &mut [u8], offset: usize, value: u16) -> Option<()> {
    place(buf, offset, &value.to_le_bytes())
}

pub fn put_i16(buf: &mut [u8], offset: usize, value: i16) -> Option<()> {
    place(buf, offset, &value.to_le_bytes())
}

pub fn put_u32(buf: &mut [u8], offset: usize, value: u32) -> Option<()> {
    place(buf, offset, &value.to_le_bytes())
}

pub fn put_i32(buf: &mut [u8], offset: usize, value: i32) -> Option<()> {
    place(buf, offset, &value.to_le_bytes())
}

pub fn put_f32(buf: &mut [u8], offset: usize, value: f32) -> Option<()> {
    place(buf, offset, &value.to_le_bytes())
}

pub fn put_f64(buf: &mut [u8], offset: usize, value: f64) -> Option<()> {
    place(buf, offset, &value.to_le_bytes())
}

pub fn put_be_u16(buf: &mut [u8], offset: usize, value: u16) -> Option<()> {
    place(buf, offset, &value.to_be_bytes())
}

pub fn put_be_u32(buf: &mut [u8], offset: usize, value: u32) -> Option<()> {
    place(buf, offset, &value.to_be_bytes())
}

fn swap_words(buf: &mut [u8], word: usize) {
    if word > 1 {
        for chunk in buf.chunks_exact_mut(word) {
            chunk.reverse();
        }
    }
}

/// Convert a block read from disk into native byte order
pub fn block_to_native(pixel_type: PixelType, buf: &mut [u8]) {
    if cfg!(target_endian = "big") {
        swap_words(buf, pixel_type.word_size());
    }
}

/// Convert a native-order block into disk byte order
pub fn block_to_disk(pixel_type: PixelType, buf: &mut [u8]) {
    if cfg!(target_endian = "big") {
        swap_words(buf, pixel_type.word_size());
    }
}
