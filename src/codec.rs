//! Block compression
//!
//! Compressed blocks start with a 13-byte header:
//!
//! | offset | size | field                                      |
//! |--------|------|--------------------------------------------|
//! | 0      | 4    | minimum value (LE)                          |
//! | 4      | 4    | run count, or -1 for plain bit packing (LE) |
//! | 8      | 4    | offset of the value array (LE)              |
//! | 12     | 1    | bits per value: 0, 1, 2, 4, 8, 16 or 32     |
//!
//! Run-length blocks store the repeat counts from byte 13, each taking
//! 1-4 big-endian bytes selected by the top two bits of its first byte,
//! followed by one value per run. Bit-packed blocks store one value per
//! pixel from byte 13. Values are offsets from the minimum; 16 and 32-bit
//! values are big-endian, narrower values fill each byte from the low bit
//! up.
//!
//! Buffers passed in and out are in disk byte order. Pixels wider than 32
//! bits are treated as runs of 32-bit words.

use crate::error::{HfaError, Result};
use crate::pack::{self, PixelType};

pub const HEADER_LEN: usize = 13;

/// Longest run a single count can express
const MAX_RUN: u32 = 0x3fff_ffff;

const BIT_WIDTHS: [u8; 7] = [0, 1, 2, 4, 8, 16, 32];

/// How decoded values are placed in the output buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Store {
    Bit1,
    Bit2,
    Bit4,
    Byte,
    Word16,
    Word32,
}

/// Storage unit of a pixel type and the number of units per pixel
fn store_for(pixel_type: PixelType) -> (Store, usize) {
    match pixel_type {
        PixelType::U1 => (Store::Bit1, 1),
        PixelType::U2 => (Store::Bit2, 1),
        PixelType::U4 => (Store::Bit4, 1),
        PixelType::U8 | PixelType::S8 => (Store::Byte, 1),
        PixelType::U16 | PixelType::S16 => (Store::Word16, 1),
        PixelType::U32 | PixelType::S32 | PixelType::F32 => (Store::Word32, 1),
        PixelType::F64 | PixelType::C64 => (Store::Word32, 2),
        PixelType::C128 => (Store::Word32, 4),
    }
}

fn corrupt(reason: impl Into<String>) -> HfaError {
    HfaError::Corrupt(reason.into())
}

fn packed_len(bits: usize, count: usize) -> Option<usize> {
    bits.checked_mul(count)?.checked_add(7).map(|b| b / 8)
}

fn read_value(src: &[u8], base: usize, index: usize, bits: u8) -> Option<u32> {
    match bits {
        0 => Some(0),
        1 | 2 | 4 => {
            let bit = index.checked_mul(bits as usize)?;
            let byte = src.get(base.checked_add(bit / 8)?)?;
            Some(u32::from(byte >> (bit % 8)) & ((1u32 << bits) - 1))
        }
        8 => src.get(base.checked_add(index)?).map(|&b| b.into()),
        16 => pack::get_be_u16(src, base.checked_add(index.checked_mul(2)?)?).map(u32::from),
        _ => pack::get_be_u32(src, base.checked_add(index.checked_mul(4)?)?),
    }
}

fn write_value(dst: &mut [u8], base: usize, index: usize, bits: u8, value: u32) {
    match bits {
        0 => {}
        1 | 2 | 4 => {
            let bit = index * bits as usize;
            dst[base + bit / 8] |= (value as u8) << (bit % 8);
        }
        8 => dst[base + index] = value as u8,
        16 => dst[base + index * 2..base + index * 2 + 2].copy_from_slice(&(value as u16).to_be_bytes()),
        _ => dst[base + index * 4..base + index * 4 + 4].copy_from_slice(&value.to_be_bytes()),
    }
}

fn set_bits(out: &mut [u8], byte: usize, shift: usize, mask: u8, value: u32) -> Option<()> {
    let slot = out.get_mut(byte)?;
    *slot = (*slot & !(mask << shift)) | (((value as u8) & mask) << shift);
    Some(())
}

fn store(out: &mut [u8], kind: Store, index: usize, value: u32) -> Option<()> {
    match kind {
        Store::Bit1 => set_bits(out, index / 8, index % 8, 0x1, value),
        Store::Bit2 => set_bits(out, index / 4, (index % 4) * 2, 0x3, value),
        Store::Bit4 => set_bits(out, index / 2, (index % 2) * 4, 0xf, value),
        Store::Byte => pack::put_u8(out, index, value as u8),
        Store::Word16 => pack::put_u16(out, index.checked_mul(2)?, value as u16),
        Store::Word32 => pack::put_u32(out, index.checked_mul(4)?, value),
    }
}

fn load(data: &[u8], kind: Store, index: usize) -> Option<u32> {
    match kind {
        Store::Bit1 => Some(u32::from(data.get(index / 8)? >> (index % 8)) & 0x1),
        Store::Bit2 => Some(u32::from(data.get(index / 4)? >> ((index % 4) * 2)) & 0x3),
        Store::Bit4 => Some(u32::from(data.get(index / 2)? >> ((index % 2) * 4)) & 0xf),
        Store::Byte => data.get(index).map(|&b| b.into()),
        Store::Word16 => pack::get_u16(data, index.checked_mul(2)?).map(u32::from),
        Store::Word32 => pack::get_u32(data, index.checked_mul(4)?),
    }
}

/// Decode a compressed block holding up to `pixels` pixels
///
/// Every read is bounds-checked against `src`; sizes that would overflow
/// fail as corruption.
pub fn decompress(src: &[u8], pixel_type: PixelType, pixels: usize) -> Result<Vec<u8>> {
    let (kind, per_pixel) = store_for(pixel_type);
    let max_units = pixels
        .checked_mul(per_pixel)
        .ok_or_else(|| corrupt("block pixel count overflows"))?;
    let out_len = pixel_type
        .bytes_for(pixels)
        .ok_or_else(|| corrupt("block byte size overflows"))?;

    if src.len() < HEADER_LEN {
        return Err(corrupt(format!(
            "compressed block of {} bytes is shorter than its header",
            src.len()
        )));
    }
    let min = pack::get_u32(src, 0).unwrap_or(0);
    let runs = pack::get_i32(src, 4).unwrap_or(0);
    let data_offset = pack::get_i32(src, 8).unwrap_or(0);
    let bits = src[12];
    if !BIT_WIDTHS.contains(&bits) {
        return Err(corrupt(format!("unsupported value width of {} bits", bits)));
    }

    let mut out = vec![0u8; out_len];
    let short = || corrupt("compressed block is truncated");

    if runs == -1 {
        let needed = packed_len(bits.into(), max_units)
            .and_then(|n| n.checked_add(HEADER_LEN))
            .ok_or_else(|| corrupt("bit-packed size overflows"))?;
        if needed > src.len() {
            return Err(short());
        }
        for i in 0..max_units {
            let raw = read_value(src, HEADER_LEN, i, bits).ok_or_else(short)?;
            store(&mut out, kind, i, min.wrapping_add(raw)).ok_or_else(short)?;
        }
        return Ok(out);
    }

    if runs < 0 || data_offset < 0 {
        return Err(corrupt(format!(
            "invalid run count {} or value offset {}",
            runs, data_offset
        )));
    }
    let runs = runs as usize;
    let data_offset = data_offset as usize;
    let values_end = packed_len(bits.into(), runs)
        .and_then(|n| n.checked_add(data_offset))
        .ok_or_else(|| corrupt("run value size overflows"))?;
    if values_end > src.len() {
        return Err(short());
    }

    let mut count_pos = HEADER_LEN;
    let mut produced = 0usize;
    for run in 0..runs {
        if produced >= max_units {
            break;
        }
        let first = *src.get(count_pos).ok_or_else(short)?;
        let extra = usize::from(first >> 6);
        let mut repeat = u32::from(first & 0x3f);
        for k in 1..=extra {
            let byte = *src.get(count_pos + k).ok_or_else(short)?;
            repeat = (repeat << 8) | u32::from(byte);
        }
        count_pos += 1 + extra;

        let value = min.wrapping_add(read_value(src, data_offset, run, bits).ok_or_else(short)?);
        let repeat = (repeat as usize).min(max_units - produced);
        for _ in 0..repeat {
            store(&mut out, kind, produced, value).ok_or_else(short)?;
            produced += 1;
        }
    }
    Ok(out)
}

fn push_count(out: &mut Vec<u8>, n: u32) {
    if n < 0x40 {
        out.push(n as u8);
    } else if n < 0x4000 {
        out.extend_from_slice(&((n as u16) | 0x4000).to_be_bytes());
    } else if n < 0x40_0000 {
        out.extend_from_slice(&(n | 0x80_0000).to_be_bytes()[1..]);
    } else {
        out.extend_from_slice(&(n | 0xc000_0000).to_be_bytes());
    }
}

/// Encode a block, or `None` when the result would not be smaller
///
/// The smallest value width covering the block's value range is used,
/// with run-length or plain bit-packed layout, whichever is shorter.
pub fn compress(data: &[u8], pixel_type: PixelType, pixels: usize) -> Option<Vec<u8>> {
    let (kind, per_pixel) = store_for(pixel_type);
    let units = pixels.checked_mul(per_pixel)?;
    if units == 0 {
        return None;
    }
    let values = (0..units)
        .map(|i| load(data, kind, i))
        .collect::<Option<Vec<u32>>>()?;

    let min = values.iter().copied().min()?;
    let max = values.iter().copied().max()?;
    let range = u64::from(max - min);
    let bits = BIT_WIDTHS
        .iter()
        .copied()
        .find(|&b| range < (1u64 << b))
        .unwrap_or(32);

    let mut runs: Vec<(u32, u32)> = Vec::new();
    for &v in &values {
        match runs.last_mut() {
            Some((count, value)) if *value == v && *count < MAX_RUN => *count += 1,
            _ => runs.push((1, v)),
        }
    }

    let mut counts = Vec::new();
    for &(count, _) in &runs {
        push_count(&mut counts, count);
    }
    let rle_len = HEADER_LEN + counts.len() + packed_len(bits.into(), runs.len())?;
    let packed = HEADER_LEN + packed_len(bits.into(), units)?;
    let use_rle = rle_len < packed;
    let total = if use_rle { rle_len } else { packed };
    if total >= data.len() {
        return None;
    }

    let mut out = vec![0u8; total];
    out[0..4].copy_from_slice(&min.to_le_bytes());
    if use_rle {
        let data_offset = HEADER_LEN + counts.len();
        out[4..8].copy_from_slice(&i32::try_from(runs.len()).ok()?.to_le_bytes());
        out[8..12].copy_from_slice(&i32::try_from(data_offset).ok()?.to_le_bytes());
        out[12] = bits;
        out[HEADER_LEN..data_offset].copy_from_slice(&counts);
        for (i, &(_, value)) in runs.iter().enumerate() {
            write_value(&mut out, data_offset, i, bits, value - min);
        }
    } else {
        out[4..8].copy_from_slice(&(-1i32).to_le_bytes());
        out[8..12].copy_from_slice(&(HEADER_LEN as i32).to_le_bytes());
        out[12] = bits;
        for (i, &value) in values.iter().enumerate() {
            write_value(&mut out, HEADER_LEN, i, bits, value - min);
        }
    }
    Some(out)
}

/// Contents of a block that was never written, in disk byte order
///
/// Zero when there is no nodata value, otherwise every pixel holds the
/// nodata value at the pixel type's width.
pub fn null_block(pixel_type: PixelType, pixels: usize, nodata: Option<f64>) -> Result<Vec<u8>> {
    let len = pixel_type
        .bytes_for(pixels)
        .ok_or_else(|| HfaError::Overflow(format!("block of {} pixels", pixels)))?;
    let Some(nd) = nodata else {
        return Ok(vec![0u8; len]);
    };

    let pattern: Vec<u8> = match pixel_type {
        PixelType::U1 => vec![if nd != 0.0 { 0xff } else { 0x00 }],
        PixelType::U2 => {
            let v = (nd as i64 & 0x3) as u8;
            vec![v | (v << 2) | (v << 4) | (v << 6)]
        }
        PixelType::U4 => {
            let v = nd.clamp(0.0, 15.0) as u8;
            vec![v | (v << 4)]
        }
        PixelType::U8 => vec![nd.clamp(0.0, 255.0) as u8],
        PixelType::S8 => vec![nd.clamp(-128.0, 127.0) as i8 as u8],
        PixelType::U16 => (nd as u16).to_le_bytes().to_vec(),
        PixelType::S16 => (nd as i16).to_le_bytes().to_vec(),
        PixelType::U32 => (nd as u32).to_le_bytes().to_vec(),
        PixelType::S32 => (nd as i32).to_le_bytes().to_vec(),
        PixelType::F32 => (nd as f32).to_le_bytes().to_vec(),
        PixelType::F64 => nd.to_le_bytes().to_vec(),
        PixelType::C64 => [(nd as f32).to_le_bytes(), 0f32.to_le_bytes()].concat(),
        PixelType::C128 => [nd.to_le_bytes(), 0f64.to_le_bytes()].concat(),
    };
    Ok(pattern.iter().copied().cycle().take(len).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    const ALL: [PixelType; 13] = [
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

    fn round_trip(data: &[u8], pixel_type: PixelType, pixels: usize) {
        if let Some(packed) = compress(data, pixel_type, pixels) {
            assert!(packed.len() < data.len());
            let restored = decompress(&packed, pixel_type, pixels).unwrap();
            assert_eq!(restored, data, "{:?}", pixel_type);
        }
    }

    #[test]
    fn test_round_trip_every_type() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        for pixel_type in ALL {
            let pixels = 64 * 64;
            let len = pixel_type.bytes_for(pixels).unwrap();

            round_trip(&vec![0u8; len], pixel_type, pixels);
            round_trip(&vec![0xa5u8; len], pixel_type, pixels);

            // Few distinct values in long runs
            let mut data = vec![0u8; len];
            for (i, b) in data.iter_mut().enumerate() {
                *b = ((i / 97) % 3) as u8;
            }
            round_trip(&data, pixel_type, pixels);

            let noise: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
            round_trip(&noise, pixel_type, pixels);
        }
    }

    #[test]
    fn test_constant_block_is_tiny() {
        let data = vec![9u8; 4096];
        let packed = compress(&data, PixelType::U8, 4096).unwrap();
        assert_eq!(packed.len(), HEADER_LEN);
        assert_eq!(packed[12], 0);
        assert_eq!(decompress(&packed, PixelType::U8, 4096).unwrap(), data);
    }

    #[test]
    fn test_no_repeats_falls_back_to_bit_packing() {
        let data: Vec<u8> = (0..1024u32).flat_map(|v| v.to_le_bytes()).collect();
        let packed = compress(&data, PixelType::U32, 1024).unwrap();
        assert_eq!(pack::get_i32(&packed, 4), Some(-1));
        assert_eq!(packed[12], 16);
        assert_eq!(packed.len(), HEADER_LEN + 2048);
        assert_eq!(decompress(&packed, PixelType::U32, 1024).unwrap(), data);

        // Full-range 16-bit values cannot shrink
        let data: Vec<u8> = (0..4096u16).flat_map(|v| (v * 16).to_le_bytes()).collect();
        assert!(compress(&data, PixelType::U16, 4096).is_none());
    }

    #[test]
    fn test_long_runs_use_wide_counts() {
        let mut data = vec![1u8; 70_000];
        data.extend(vec![2u8; 20]);
        let packed = compress(&data, PixelType::U8, data.len()).unwrap();
        assert_eq!(pack::get_i32(&packed, 4), Some(2));
        // 3-byte count then 1-byte count
        assert_eq!(packed[HEADER_LEN] >> 6, 2);
        assert_eq!(decompress(&packed, PixelType::U8, data.len()).unwrap(), data);
    }

    fn header(min: u32, runs: i32, offset: i32, bits: u8) -> Vec<u8> {
        let mut h = Vec::new();
        h.extend_from_slice(&min.to_le_bytes());
        h.extend_from_slice(&runs.to_le_bytes());
        h.extend_from_slice(&offset.to_le_bytes());
        h.push(bits);
        h
    }

    #[test]
    fn test_two_bit_block_not_byte_aligned() {
        // Three 2-bit pixels; the fourth slot of the source byte is garbage
        let mut src = header(0, -1, 13, 2);
        src.push(0b1111_1001);
        let out = decompress(&src, PixelType::U2, 3).unwrap();
        assert_eq!(out, vec![0b0011_1001]);

        let packed = compress(&[0b0011_1001], PixelType::U2, 3);
        assert!(packed.is_none(), "one byte cannot shrink");
    }

    #[test]
    fn test_runs_are_clipped() {
        let mut src = header(10, 1, 14, 8);
        src.push(50);
        src.push(5);
        let out = decompress(&src, PixelType::U8, 4).unwrap();
        assert_eq!(out, vec![15; 4]);
    }

    #[test]
    fn test_sixteen_bit_values_big_endian() {
        let mut src = header(1, -1, 13, 16);
        src.extend_from_slice(&[0x01, 0x00, 0x00, 0x02]);
        let out = decompress(&src, PixelType::U16, 2).unwrap();
        assert_eq!(pack::get_u16(&out, 0), Some(257));
        assert_eq!(pack::get_u16(&out, 2), Some(3));
    }

    #[test]
    fn test_corrupt_blocks_rejected() {
        let corrupt = |src: &[u8], pixels: usize| {
            matches!(
                decompress(src, PixelType::U8, pixels),
                Err(HfaError::Corrupt(_))
            )
        };
        assert!(corrupt(&[0u8; 5], 4));
        assert!(corrupt(&header(0, -1, 13, 3), 4));
        assert!(corrupt(&header(0, -1, 13, 8), 4));
        assert!(corrupt(&header(0, -2, 13, 8), 4));
        assert!(corrupt(&header(0, 1, -5, 8), 4));
        assert!(corrupt(&header(0, 1, 1000, 8), 4));
        assert!(corrupt(&header(0, i32::MAX, 13, 32), 4));
        // Count byte claims three more bytes that are missing
        let mut src = header(0, 1, 13, 0);
        src.push(0xc0);
        assert!(corrupt(&src, 4));
        // Pixel counts whose byte size overflows
        assert!(matches!(
            decompress(&header(0, -1, 13, 32), PixelType::C128, usize::MAX / 4),
            Err(HfaError::Corrupt(_))
        ));
    }

    #[test]
    fn test_null_block_patterns() {
        assert_eq!(null_block(PixelType::U8, 4, None).unwrap(), vec![0; 4]);
        assert_eq!(null_block(PixelType::U8, 4, Some(5.0)).unwrap(), vec![5; 4]);
        assert_eq!(null_block(PixelType::U2, 8, Some(2.0)).unwrap(), vec![0xaa; 2]);
        assert_eq!(null_block(PixelType::U2, 4, Some(3.0)).unwrap(), vec![0xff]);
        // Out of range values keep their low two bits
        assert_eq!(null_block(PixelType::U2, 4, Some(6.0)).unwrap(), vec![0xaa]);
        assert_eq!(null_block(PixelType::U2, 4, Some(5.0)).unwrap(), vec![0x55]);
        assert_eq!(null_block(PixelType::U4, 2, Some(3.0)).unwrap(), vec![0x33]);
        assert_eq!(null_block(PixelType::U1, 9, Some(1.0)).unwrap(), vec![0xff; 2]);
        assert_eq!(null_block(PixelType::S8, 1, Some(-300.0)).unwrap(), vec![0x80]);
        assert_eq!(
            null_block(PixelType::S16, 2, Some(-2.0)).unwrap(),
            vec![0xfe, 0xff, 0xfe, 0xff]
        );
        let c64 = null_block(PixelType::C64, 2, Some(1.5)).unwrap();
        assert_eq!(c64.len(), 16);
        assert_eq!(pack::get_f32(&c64, 8), Some(1.5));
        assert_eq!(pack::get_f32(&c64, 12), Some(0.0));
    }

    #[test]
    fn test_count_encoding_widths() {
        for (n, len) in [(1u32, 1usize), (0x3f, 1), (0x40, 2), (0x3fff, 2), (0x4000, 3), (0x40_0000, 4)] {
            let mut out = Vec::new();
            push_count(&mut out, n);
            assert_eq!(out.len(), len, "count {}", n);
        }
    }
}
