//! External spill files
//!
//! Bands too large for the main container keep their blocks in a companion
//! file. One spill file holds any number of layer stacks; each stack is
//! laid out as
//!
//! ```text
//! preamble    u8 1, i32 layers, i32 width, i32 height, i32 block, i32 block, u8 3, u8 0
//! per layer   i32 1, i32 0, i32 blocks per column, i32 blocks per row, i32 0x30000,
//!             validity bitmap (one bit per block, rows padded to whole bytes)
//! data        block-interleaved: block k of layer i at
//!             data + block_bytes * (k * layers + i)
//! ```
//!
//! Spill blocks are never compressed.

use crate::band::BlockGrid;
use crate::error::{HfaError, Result};
use crate::io::{Access, HfaFile};
use crate::pack::PixelType;
use std::path::{Path, PathBuf};

/// Leading bytes of every spill file
pub const SPILL_MAGIC: &[u8; 26] = b"ERDAS_IMG_EXTERNAL_RASTER\0";

/// Bytes checked when a spill file is opened
const SPILL_HEADER_LEN: usize = 49;

/// Per-layer header preceding each validity bitmap
const LAYER_HEADER_LEN: u64 = 20;

/// Where a freshly created stack keeps its bitmaps and its blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpillLayout {
    pub valid_flags_offset: u64,
    pub data_offset: u64,
}

/// Spill file belonging to a container: `.rde` for `.rrd`, `.axe` for `.aux`, `.ige` otherwise
pub fn spill_file_name(path: &Path) -> PathBuf {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    let spill_ext = match ext.as_deref() {
        Some("rrd") => "rde",
        Some("aux") => "axe",
        _ => "ige",
    };
    path.with_extension(spill_ext)
}

fn bitmap_row_bytes(grid: &BlockGrid) -> usize {
    grid.blocks_per_row.div_ceil(8)
}

fn bitmap_len(grid: &BlockGrid) -> usize {
    bitmap_row_bytes(grid) * grid.blocks_per_column
}

fn i32_field(value: usize, what: &str) -> Result<[u8; 4]> {
    i32::try_from(value)
        .map(i32::to_le_bytes)
        .map_err(|_| HfaError::InvalidArgument(format!("{} {} does not fit the spill preamble", what, value)))
}

/// Append a stack of `layers` layers to the spill file at `path`
///
/// The file is created with its magic if it does not exist yet. Every
/// block starts out valid, and the data area is reserved in one step by
/// extending the file.
pub fn create_spill_stack(
    path: &Path,
    grid: &BlockGrid,
    layers: usize,
    pixel_type: PixelType,
) -> Result<SpillLayout> {
    if grid.block_width == 0 || grid.block_height == 0 {
        return Err(HfaError::InvalidArgument("spill block size must be positive".to_string()));
    }

    let mut file = if path.exists() {
        HfaFile::open(path, Access::Update)?
    } else {
        let mut file = HfaFile::create(path)?;
        file.write_at(0, SPILL_MAGIC)?;
        file
    };

    let mut preamble = vec![1u8];
    preamble.extend_from_slice(&i32_field(layers, "layer count")?);
    preamble.extend_from_slice(&i32_field(grid.width, "width")?);
    preamble.extend_from_slice(&i32_field(grid.height, "height")?);
    preamble.extend_from_slice(&i32_field(grid.block_width, "block width")?);
    preamble.extend_from_slice(&i32_field(grid.block_height, "block height")?);
    preamble.extend_from_slice(&[3, 0]);

    let mut pos = file.len()?;
    file.write_at(pos, &preamble)?;
    pos += preamble.len() as u64;
    let valid_flags_offset = pos;

    let row_bytes = bitmap_row_bytes(grid);
    let mut bitmap = vec![0xffu8; bitmap_len(grid)];
    let remainder = grid.blocks_per_row % 8;
    if remainder != 0 {
        for row in bitmap.chunks_exact_mut(row_bytes) {
            if let Some(last) = row.last_mut() {
                *last = (1u8 << remainder) - 1;
            }
        }
    }

    let mut layer = Vec::with_capacity(LAYER_HEADER_LEN as usize + bitmap.len());
    layer.extend_from_slice(&1i32.to_le_bytes());
    layer.extend_from_slice(&0i32.to_le_bytes());
    layer.extend_from_slice(&i32_field(grid.blocks_per_column, "blocks per column")?);
    layer.extend_from_slice(&i32_field(grid.blocks_per_row, "blocks per row")?);
    layer.extend_from_slice(&0x30000i32.to_le_bytes());
    layer.extend_from_slice(&bitmap);
    for _ in 0..layers {
        file.write_at(pos, &layer)?;
        pos += layer.len() as u64;
    }

    let data_offset = pos;
    let data_len = grid
        .block_bytes(pixel_type)
        .and_then(|b| (b as u64).checked_mul(grid.block_count() as u64))
        .and_then(|b| b.checked_mul(layers as u64))
        .ok_or_else(|| HfaError::Overflow("spill data area".to_string()))?;
    file.set_len(data_offset + data_len)?;
    file.sync()?;

    tracing::debug!(
        "Created spill stack of {} layers in {} (flags at {}, data at {})",
        layers,
        path.display(),
        valid_flags_offset,
        data_offset
    );
    Ok(SpillLayout {
        valid_flags_offset,
        data_offset,
    })
}

/// One layer of a spill stack, opened for block I/O
#[derive(Debug)]
pub struct SpillStack {
    file: HfaFile,
    grid: BlockGrid,
    /// Start of this layer's bitmap, past its 20-byte layer header
    bitmap_offset: u64,
    data_offset: u64,
    layers: u64,
    index: u64,
    block_bytes: u64,
    valid: Vec<bool>,
}

impl SpillStack {
    /// Open layer `index` of a stack described by an external raster record
    ///
    /// Layer `i` keeps its bitmap `i` records after the stack's first one.
    pub fn open(
        path: &Path,
        access: Access,
        layout: SpillLayout,
        layers: usize,
        index: usize,
        grid: BlockGrid,
        pixel_type: PixelType,
    ) -> Result<Self> {
        if index >= layers {
            return Err(HfaError::Corrupt(format!(
                "spill layer {} of a {}-layer stack",
                index, layers
            )));
        }
        let mut file = HfaFile::open(path, access)?;
        let header = file.read_up_to(0, SPILL_HEADER_LEN)?;
        if header.len() < SPILL_HEADER_LEN || !header.starts_with(&SPILL_MAGIC[..SPILL_MAGIC.len() - 1]) {
            return Err(HfaError::Corrupt(format!(
                "spill file {} has no external raster magic",
                path.display()
            )));
        }

        let map_len = bitmap_len(&grid);
        let record = LAYER_HEADER_LEN + map_len as u64;
        let layer_offset = (index as u64)
            .checked_mul(record)
            .and_then(|o| o.checked_add(layout.valid_flags_offset))
            .ok_or_else(|| HfaError::Overflow("spill bitmap offset".to_string()))?;
        let bitmap = file.read_vec(layer_offset + LAYER_HEADER_LEN, map_len)?;

        let row_bytes = bitmap_row_bytes(&grid);
        let valid = (0..grid.block_count())
            .map(|block| {
                let (row, col) = (block / grid.blocks_per_row, block % grid.blocks_per_row);
                let byte = bitmap[row * row_bytes + col / 8];
                (byte >> (col % 8)) & 1 == 1
            })
            .collect();

        let block_bytes = grid
            .block_bytes(pixel_type)
            .ok_or_else(|| HfaError::Overflow("spill block size".to_string()))? as u64;

        Ok(SpillStack {
            file,
            grid,
            bitmap_offset: layer_offset + LAYER_HEADER_LEN,
            data_offset: layout.data_offset,
            layers: layers as u64,
            index: index as u64,
            block_bytes,
            valid,
        })
    }

    /// File offset of block `block` of this layer
    pub fn block_offset(&self, block: usize) -> Result<u64> {
        (block as u64)
            .checked_mul(self.layers)
            .and_then(|k| k.checked_add(self.index))
            .and_then(|slot| slot.checked_mul(self.block_bytes))
            .and_then(|off| off.checked_add(self.data_offset))
            .ok_or_else(|| HfaError::Overflow(format!("offset of spill block {}", block)))
    }

    pub fn block_bytes(&self) -> usize {
        self.block_bytes as usize
    }

    pub fn is_valid(&self, block: usize) -> bool {
        self.valid.get(block).copied().unwrap_or(false)
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Raw block bytes in disk order
    ///
    /// A block past the end of the file reads as zeros.
    pub fn read_block(&mut self, block: usize) -> Result<Vec<u8>> {
        let offset = self.block_offset(block)?;
        let mut data = self.file.read_up_to(offset, self.block_bytes as usize)?;
        if data.len() < self.block_bytes as usize {
            tracing::debug!("Short read of spill block {} at {}", block, offset);
            data.resize(self.block_bytes as usize, 0);
        }
        Ok(data)
    }

    /// Write raw block bytes and mark the block valid on disk
    pub fn write_block(&mut self, block: usize, data: &[u8]) -> Result<()> {
        if data.len() != self.block_bytes as usize {
            return Err(HfaError::InvalidArgument(format!(
                "spill block needs {} bytes, got {}",
                self.block_bytes,
                data.len()
            )));
        }
        let offset = self.block_offset(block)?;
        self.file.write_at(offset, data)?;

        if !self.is_valid(block) {
            let (row, col) = (block / self.grid.blocks_per_row, block % self.grid.blocks_per_row);
            let at = self.bitmap_offset + (row * bitmap_row_bytes(&self.grid) + col / 8) as u64;
            let mut byte = [0u8; 1];
            self.file.read_at(at, &mut byte)?;
            byte[0] |= 1 << (col % 8);
            self.file.write_at(at, &byte)?;
            if let Some(flag) = self.valid.get_mut(block) {
                *flag = true;
            }
        }
        Ok(())
    }

    pub fn sync(&mut self) -> Result<()> {
        self.file.sync()
    }
}
