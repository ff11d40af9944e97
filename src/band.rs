//! Raster bands and their block storage
//!
//! A band is an `Eimg_Layer` (or `Eimg_Layer_SubSample` for overviews)
//! entry. Its pixels are cut into fixed-size blocks addressed row-major.
//! Blocks either live in the container itself, listed in the band's
//! `RasterDMS` table with an offset, a size and valid/compressed flags, or
//! in a spill file, where their position is computed from the block index.

use crate::codec;
use crate::entry::{EntryId, EntryTree};
use crate::error::{HfaError, Result};
use crate::io::Access;
use crate::pack::{self, PixelType};
use crate::spill::{self, SpillLayout, SpillStack};
use std::path::{Path, PathBuf};

const BLOCK_VALID: u8 = 1;
const BLOCK_COMPRESSED: u8 = 2;

/// Offset of the block list inside a freshly built `Edms_State` payload
const DMS_BLOCKINFO_OFFSET: usize = 22;
/// Size of one `Edms_VirtualBlockInfo` record
const DMS_BLOCKINFO_LEN: usize = 14;
/// Fixed fields around the block list (counters, free list, timestamp)
const DMS_FIXED_LEN: usize = 38;

/// Block layout of a band
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockGrid {
    pub width: usize,
    pub height: usize,
    pub block_width: usize,
    pub block_height: usize,
    pub blocks_per_row: usize,
    pub blocks_per_column: usize,
}

impl BlockGrid {
    pub fn new(width: usize, height: usize, block_width: usize, block_height: usize) -> Result<Self> {
        if width == 0 || height == 0 || block_width == 0 || block_height == 0 {
            return Err(HfaError::InvalidArgument(format!(
                "raster {}x{} with {}x{} blocks",
                width, height, block_width, block_height
            )));
        }
        let grid = BlockGrid {
            width,
            height,
            block_width,
            block_height,
            blocks_per_row: width.div_ceil(block_width),
            blocks_per_column: height.div_ceil(block_height),
        };
        let fits = grid
            .blocks_per_row
            .checked_mul(grid.blocks_per_column)
            .zip(block_width.checked_mul(block_height))
            .is_some_and(|(blocks, pixels)| blocks <= i32::MAX as usize && pixels <= i32::MAX as usize);
        if !fits {
            return Err(HfaError::Overflow(format!(
                "too many blocks for {}x{} raster with {}x{} blocks",
                width, height, block_width, block_height
            )));
        }
        Ok(grid)
    }

    pub fn block_count(&self) -> usize {
        self.blocks_per_row * self.blocks_per_column
    }

    pub fn block_pixels(&self) -> usize {
        self.block_width * self.block_height
    }

    pub fn block_bytes(&self, pixel_type: PixelType) -> Option<usize> {
        pixel_type.bytes_for(self.block_pixels())
    }

    /// Row-major index of block (`x`, `y`)
    pub fn block_index(&self, x: usize, y: usize) -> Option<usize> {
        (x < self.blocks_per_row && y < self.blocks_per_column).then(|| x + y * self.blocks_per_row)
    }
}

/// Which file of a container a band's entry lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BandSource {
    Primary,
    Dependent,
}

/// Where a new layer keeps its blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerStorage<'a> {
    /// Block table in a `RasterDMS` entry
    Internal { compressed: bool },
    /// Layer `index` of a stack in the named spill file
    External {
        file_name: &'a str,
        layout: SpillLayout,
        layers: usize,
        index: usize,
    },
    /// Placeholder naming a layer of the primary file; holds no blocks
    Dependent,
}

/// Parameters of a layer to create
#[derive(Debug, Clone, Copy)]
pub struct LayerSpec<'a> {
    pub name: &'a str,
    pub overview: bool,
    pub width: usize,
    pub height: usize,
    pub block_size: usize,
    pub pixel_type: PixelType,
    pub storage: LayerStorage<'a>,
}

/// Create a layer entry under `parent`, returning it
///
/// Internal layers get their block table immediately. Uncompressed blocks
/// are given space at the end of the file right away; compressed blocks get
/// space the first time they are written.
pub fn create_layer(tree: &mut EntryTree, parent: EntryId, spec: &LayerSpec<'_>) -> Result<EntryId> {
    let grid = BlockGrid::new(spec.width, spec.height, spec.block_size, spec.block_size)?;
    let block_bytes = grid
        .block_bytes(spec.pixel_type)
        .ok_or_else(|| HfaError::Overflow("block size".to_string()))?;
    let block_bytes_u32 = u32::try_from(block_bytes)
        .map_err(|_| HfaError::Overflow(format!("block of {} bytes", block_bytes)))?;
    let blocks = grid.block_count();

    let layer_type = if spec.overview { "Eimg_Layer_SubSample" } else { "Eimg_Layer" };
    let layer = tree.new_child(parent, spec.name, layer_type)?;
    tree.set_field(layer, "width", spec.width)?;
    tree.set_field(layer, "height", spec.height)?;
    tree.set_field(layer, "layerType", "athematic")?;
    tree.set_field(layer, "pixelType", spec.pixel_type.code())?;
    tree.set_field(layer, "blockWidth", spec.block_size)?;
    tree.set_field(layer, "blockHeight", spec.block_size)?;

    match spec.storage {
        LayerStorage::Internal { compressed } => {
            let dms = tree.new_child(layer, "RasterDMS", "Edms_State")?;
            let size = blocks
                .checked_mul(DMS_BLOCKINFO_LEN)
                .and_then(|n| n.checked_add(DMS_FIXED_LEN))
                .ok_or_else(|| HfaError::Overflow("block table size".to_string()))?;
            tree.make_data(dms, size)?;
            let pixels = grid.block_pixels();
            tree.set_field(dms, "numvirtualblocks", blocks)?;
            tree.set_field(dms, "numobjectsperblock", pixels)?;
            tree.set_field(dms, "nextobjectnum", pixels.saturating_mul(blocks))?;
            tree.set_field(
                dms,
                "compressionType",
                if compressed { "RLC compression" } else { "no compression" },
            )?;
            tree.set_position(dms)?;

            let offsets = (0..blocks)
                .map(|_| {
                    if compressed {
                        Ok(0)
                    } else {
                        tree.allocator_mut().allocate(block_bytes_u32)
                    }
                })
                .collect::<Result<Vec<u32>>>()?;

            let data_pos = tree.data_pos(dms);
            let data = tree.data_mut(dms)?;
            let put = |data: &mut [u8], at: usize, bytes: &[u8]| -> Result<()> {
                data.get_mut(at..at + bytes.len())
                    .ok_or_else(|| HfaError::Corrupt("block table payload too short".to_string()))?
                    .copy_from_slice(bytes);
                Ok(())
            };
            put(data, 14, &(blocks as u32).to_le_bytes())?;
            put(data, 18, &(data_pos + DMS_BLOCKINFO_OFFSET as u32).to_le_bytes())?;
            for (i, offset) in offsets.iter().enumerate() {
                let at = DMS_BLOCKINFO_OFFSET + DMS_BLOCKINFO_LEN * i;
                let size = if compressed { 0 } else { block_bytes_u32 };
                put(data, at, &0i16.to_le_bytes())?;
                put(data, at + 2, &offset.to_le_bytes())?;
                put(data, at + 6, &size.to_le_bytes())?;
                put(data, at + 10, &0i16.to_le_bytes())?;
                put(data, at + 12, &i16::from(compressed).to_le_bytes())?;
            }
        }
        LayerStorage::External {
            file_name,
            layout,
            layers,
            index,
        } => {
            let dms = tree.new_child(layer, "ExternalRasterDMS", "ImgExternalRaster")?;
            tree.make_data(dms, 8 + file_name.len() + 1 + 6 * 4)?;
            tree.set_field(dms, "fileName.string", file_name)?;
            let halves = |v: u64| ((v & 0xffff_ffff) as u32, (v >> 32) as u32);
            let (lo, hi) = halves(layout.valid_flags_offset);
            tree.set_field(dms, "layerStackValidFlagsOffset[0]", lo)?;
            tree.set_field(dms, "layerStackValidFlagsOffset[1]", hi)?;
            let (lo, hi) = halves(layout.data_offset);
            tree.set_field(dms, "layerStackDataOffset[0]", lo)?;
            tree.set_field(dms, "layerStackDataOffset[1]", hi)?;
            tree.set_field(dms, "layerStackCount", layers)?;
            tree.set_field(dms, "layerStackIndex", index)?;
        }
        LayerStorage::Dependent => {
            let dep = tree.new_child(layer, "DependentLayerName", "Eimg_DependentLayerName")?;
            tree.make_data(dep, 8 + spec.name.len() + 2)?;
            tree.set_field(dep, "ImageLayerName.string", spec.name)?;
        }
    }

    // Per-layer dictionary describing one block's worth of items
    let layer_dict = format!(
        "{{{}:{}data,}}RasterDMS,.",
        grid.block_pixels(),
        spec.pixel_type.item_code()
    );
    let ehfa = tree.new_child(layer, "Ehfa_Layer", "Ehfa_Layer")?;
    tree.make_data(ehfa, 0)?;
    tree.set_position(ehfa)?;
    let mut text = layer_dict.into_bytes();
    text.push(0);
    let dict_pos = tree.allocator_mut().allocate_len(text.len())?;
    tree.set_field(ehfa, "type", "raster")?;
    tree.set_field(ehfa, "dictionaryPtr", dict_pos)?;
    tree.file_mut().write_at(dict_pos.into(), &text)?;

    tracing::debug!(
        "Created layer {} ({}x{} {} blocks of {})",
        spec.name,
        spec.width,
        spec.height,
        blocks,
        spec.pixel_type.name()
    );
    Ok(layer)
}

#[derive(Debug, Default)]
struct BlockTable {
    offsets: Vec<u32>,
    sizes: Vec<u32>,
    flags: Vec<u8>,
}

#[derive(Debug)]
enum Storage {
    Unloaded,
    Internal(BlockTable),
    External(SpillStack),
}

/// One raster layer
#[derive(Debug)]
pub struct Band {
    node: EntryId,
    source: BandSource,
    grid: BlockGrid,
    pixel_type: PixelType,
    valid: bool,
    nodata: Option<f64>,
    storage: Storage,
    pub(crate) overviews: Vec<Band>,
    pub(crate) overviews_loaded: bool,
}

impl Band {
    /// Describe the layer at `node`
    ///
    /// A layer with non-positive sizes or an unknown pixel type loads as an
    /// invalid, zero-sized band that refuses block I/O.
    pub fn load(tree: &mut EntryTree, node: EntryId, source: BandSource) -> Result<Self> {
        let width = tree.get_int(node, "width")?;
        let height = tree.get_int(node, "height")?;
        let block_width = tree.get_int(node, "blockWidth")?;
        let block_height = tree.get_int(node, "blockHeight")?;
        let type_code = tree.get_int(node, "pixelType")?;

        let dims = [width, height, block_width, block_height].map(|v| usize::try_from(v).unwrap_or(0));
        let grid = BlockGrid::new(dims[0], dims[1], dims[2], dims[3]);
        let pixel_type = PixelType::from_code(type_code);

        let (grid, pixel_type, valid) = match (grid, pixel_type) {
            (Ok(grid), Some(pt)) => (grid, pt, true),
            (grid, pt) => {
                tracing::warn!(
                    "Layer {} is unusable: {}x{} pixels, {}x{} blocks, pixel type {}{}",
                    tree.name(node),
                    width,
                    height,
                    block_width,
                    block_height,
                    type_code,
                    grid.err().map(|e| format!(" ({})", e)).unwrap_or_default()
                );
                (BlockGrid::default(), pt.unwrap_or(PixelType::U8), false)
            }
        };

        let nodata = match tree.named_child(node, "Eimg_NonInitializedValue")? {
            Some(nd) => match tree.get_double(nd, "valueBD") {
                Ok(v) => Some(v),
                Err(e) => {
                    tracing::warn!("Ignoring unreadable nodata value of {}: {}", tree.name(node), e);
                    None
                }
            },
            None => None,
        };

        Ok(Band {
            node,
            source,
            grid,
            pixel_type,
            valid,
            nodata,
            storage: Storage::Unloaded,
            overviews: Vec::new(),
            overviews_loaded: false,
        })
    }

    pub fn node(&self) -> EntryId {
        self.node
    }

    pub fn source(&self) -> BandSource {
        self.source
    }

    pub fn grid(&self) -> &BlockGrid {
        &self.grid
    }

    pub fn width(&self) -> usize {
        self.grid.width
    }

    pub fn height(&self) -> usize {
        self.grid.height
    }

    pub fn block_size(&self) -> (usize, usize) {
        (self.grid.block_width, self.grid.block_height)
    }

    pub fn pixel_type(&self) -> PixelType {
        self.pixel_type
    }

    pub fn nodata(&self) -> Option<f64> {
        self.nodata
    }

    /// False for layers whose sizes or pixel type could not be used
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Whether blocks live in a spill file; loads block info
    pub fn is_spilled(&mut self, tree: &mut EntryTree) -> Result<bool> {
        self.load_block_info(tree)?;
        Ok(matches!(self.storage, Storage::External(_)))
    }

    /// Whether the band's block table asks for compression
    pub fn is_compressed(&self, tree: &mut EntryTree) -> Result<bool> {
        match tree.named_child(self.node, "RasterDMS")? {
            Some(dms) => Ok(tree.get_int(dms, "compressionType")? != 0),
            None => Ok(false),
        }
    }

    /// Bytes per uncompressed block
    pub fn block_bytes(&self) -> Result<usize> {
        self.grid
            .block_bytes(self.pixel_type)
            .ok_or_else(|| HfaError::Overflow("block size".to_string()))
    }

    fn check_usable(&self) -> Result<()> {
        if self.valid {
            Ok(())
        } else {
            Err(HfaError::Corrupt("band has invalid dimensions or pixel type".to_string()))
        }
    }

    fn block_index(&self, x: usize, y: usize) -> Result<usize> {
        self.grid.block_index(x, y).ok_or_else(|| {
            HfaError::InvalidArgument(format!(
                "block ({}, {}) outside {}x{} block grid",
                x, y, self.grid.blocks_per_row, self.grid.blocks_per_column
            ))
        })
    }

    /// Read the block table on first use
    pub fn load_block_info(&mut self, tree: &mut EntryTree) -> Result<()> {
        if !matches!(self.storage, Storage::Unloaded) {
            return Ok(());
        }
        self.check_usable()?;

        if let Some(dms) = tree.named_child(self.node, "RasterDMS")? {
            let table = read_block_table(tree, dms, self.grid.block_count())?;
            self.storage = Storage::Internal(table);
            return Ok(());
        }
        if let Some(ext) = tree.named_child(self.node, "ExternalRasterDMS")? {
            let stack = self.open_spill(tree, ext)?;
            self.storage = Storage::External(stack);
            return Ok(());
        }
        Err(HfaError::EntryNotFound(format!(
            "{} has neither RasterDMS nor ExternalRasterDMS",
            tree.name(self.node)
        )))
    }

    fn open_spill(&self, tree: &mut EntryTree, ext: EntryId) -> Result<SpillStack> {
        let wide = |tree: &mut EntryTree, name: &str| -> Result<u64> {
            let lo = tree.get_int(ext, &format!("{}[0]", name))? as u32;
            let hi = tree.get_int(ext, &format!("{}[1]", name))? as u32;
            Ok(u64::from(lo) | (u64::from(hi) << 32))
        };
        let layout = SpillLayout {
            valid_flags_offset: wide(tree, "layerStackValidFlagsOffset")?,
            data_offset: wide(tree, "layerStackDataOffset")?,
        };
        let count = tree.get_int(ext, "layerStackCount")?;
        let index = tree.get_int(ext, "layerStackIndex")?;
        let (count, index) = match (usize::try_from(count), usize::try_from(index)) {
            (Ok(c), Ok(i)) => (c, i),
            _ => {
                return Err(HfaError::Corrupt(format!(
                    "spill layer {} of {} in {}",
                    index,
                    count,
                    tree.name(self.node)
                )))
            }
        };
        let file_name = tree.get_string(ext, "fileName.string")?;
        let path = resolve_spill_path(tree.file().path(), &file_name);
        SpillStack::open(
            &path,
            tree.file().access(),
            layout,
            count,
            index,
            self.grid,
            self.pixel_type,
        )
    }

    /// Read block (`x`, `y`) in native byte order
    ///
    /// Blocks never written read as the nodata value, or zero.
    pub fn read_block(&mut self, tree: &mut EntryTree, x: usize, y: usize) -> Result<Vec<u8>> {
        self.load_block_info(tree)?;
        let block = self.block_index(x, y)?;
        let pixels = self.grid.block_pixels();
        let block_bytes = self.block_bytes()?;
        let update = tree.file().access() == Access::Update;

        let mut data = match &mut self.storage {
            Storage::External(stack) => {
                if stack.is_valid(block) {
                    stack.read_block(block)?
                } else {
                    codec::null_block(self.pixel_type, pixels, self.nodata)?
                }
            }
            Storage::Internal(table) => {
                let flags = table.flags[block];
                let (offset, size) = (table.offsets[block], table.sizes[block] as usize);
                if flags & BLOCK_VALID == 0 {
                    codec::null_block(self.pixel_type, pixels, self.nodata)?
                } else if flags & BLOCK_COMPRESSED != 0 {
                    let raw = tree.file_mut().read_up_to(offset.into(), size)?;
                    if raw.len() < size && update {
                        // Space allocated but not written yet
                        vec![0u8; block_bytes]
                    } else {
                        codec::decompress(&raw, self.pixel_type, pixels).map_err(|e| {
                            HfaError::CorruptBlock {
                                block,
                                reason: e.to_string(),
                            }
                        })?
                    }
                } else {
                    if size > block_bytes {
                        return Err(HfaError::CorruptBlock {
                            block,
                            reason: format!("raw size {} exceeds block size {}", size, block_bytes),
                        });
                    }
                    let mut raw = tree.file_mut().read_up_to(offset.into(), size)?;
                    if raw.len() < size {
                        tracing::debug!("Short read of block {} at {}", block, offset);
                        raw.clear();
                    }
                    raw.resize(block_bytes, 0);
                    raw
                }
            }
            Storage::Unloaded => return Err(not_loaded()),
        };
        data.resize(block_bytes, 0);
        pack::block_to_native(self.pixel_type, &mut data);
        Ok(data)
    }

    /// Write block (`x`, `y`) from native byte order
    ///
    /// Compressed blocks are re-encoded and moved to the end of the file
    /// when they no longer fit; a block that does not compress is switched
    /// to raw storage. Blocks that are invalid, raw and without space
    /// cannot be written.
    pub fn write_block(&mut self, tree: &mut EntryTree, x: usize, y: usize, data: &[u8]) -> Result<()> {
        if tree.file().access() == Access::ReadOnly {
            return Err(HfaError::ReadOnly);
        }
        self.load_block_info(tree)?;
        let block = self.block_index(x, y)?;
        let block_bytes = self.block_bytes()?;
        if data.len() != block_bytes {
            return Err(HfaError::InvalidArgument(format!(
                "block needs {} bytes, got {}",
                block_bytes,
                data.len()
            )));
        }
        let mut disk = data.to_vec();
        pack::block_to_disk(self.pixel_type, &mut disk);

        let node = self.node;
        let pixel_type = self.pixel_type;
        let pixels = self.grid.block_pixels();
        let table = match &mut self.storage {
            Storage::External(stack) => return stack.write_block(block, &disk),
            Storage::Internal(table) => table,
            Storage::Unloaded => return Err(not_loaded()),
        };

        let flags = table.flags[block];
        if flags & (BLOCK_VALID | BLOCK_COMPRESSED) == 0 && table.offsets[block] == 0 {
            return Err(HfaError::NotSupported(format!(
                "writing block {} ({}, {}) that has no space allocated",
                block, x, y
            )));
        }
        let dms = tree
            .named_child(node, "RasterDMS")?
            .ok_or_else(|| HfaError::EntryNotFound("RasterDMS".to_string()))?;

        if flags & BLOCK_COMPRESSED != 0 {
            match codec::compress(&disk, pixel_type, pixels) {
                Some(packed) => {
                    reallocate(tree, dms, table, block, packed.len())?;
                    tree.file_mut().write_at(table.offsets[block].into(), &packed)?;
                    tracing::debug!("Block {} compressed to {} bytes", block, packed.len());
                }
                None => {
                    table.flags[block] &= !BLOCK_COMPRESSED;
                    reallocate(tree, dms, table, block, block_bytes)?;
                    tree.set_field(dms, &format!("blockinfo[{}].compressionType", block), 0)?;
                    tracing::debug!("Block {} does not compress, storing it raw", block);
                }
            }
        }

        if table.flags[block] & BLOCK_COMPRESSED == 0 {
            let size = (table.sizes[block] as usize).min(disk.len());
            tree.file_mut().write_at(table.offsets[block].into(), &disk[..size])?;
        }

        if table.flags[block] & BLOCK_VALID == 0 {
            tree.set_field(dms, &format!("blockinfo[{}].logvalid", block), "true")?;
            table.flags[block] |= BLOCK_VALID;
        }
        Ok(())
    }

    /// Record a nodata value in an `Eimg_NonInitializedValue` child
    pub fn set_nodata(&mut self, tree: &mut EntryTree, value: f64) -> Result<()> {
        if tree.file().access() == Access::ReadOnly {
            return Err(HfaError::ReadOnly);
        }
        let nd = match tree.named_child(self.node, "Eimg_NonInitializedValue")? {
            Some(nd) => nd,
            None => tree.new_child(self.node, "Eimg_NonInitializedValue", "Eimg_NonInitializedValue")?,
        };
        tree.make_data(nd, 8 + 12 + 8)?;
        tree.set_position(nd)?;
        tree.set_field(nd, "valueBD[-3]", PixelType::F64.code())?;
        tree.set_field(nd, "valueBD[-2]", 1)?;
        tree.set_field(nd, "valueBD[-1]", 1)?;
        tree.set_field(nd, "valueBD[0]", value)?;
        self.nodata = Some(value);
        Ok(())
    }

    /// Overviews discovered or created so far, largest first
    pub fn overviews(&self) -> &[Band] {
        &self.overviews
    }

    pub(crate) fn sort_overviews(&mut self) {
        self.overviews.sort_by(|a, b| b.width().cmp(&a.width()));
    }

    pub fn sync(&mut self) -> Result<()> {
        if let Storage::External(stack) = &mut self.storage {
            stack.sync()?;
        }
        for overview in &mut self.overviews {
            overview.sync()?;
        }
        Ok(())
    }
}

fn not_loaded() -> HfaError {
    HfaError::Corrupt("block table is not loaded".to_string())
}

fn read_block_table(tree: &mut EntryTree, dms: EntryId, blocks: usize) -> Result<BlockTable> {
    let listed = tree.field_count(dms, "blockinfo")?;
    if listed < blocks {
        return Err(HfaError::Corrupt(format!(
            "block table lists {} of {} blocks",
            listed, blocks
        )));
    }

    let mut table = BlockTable {
        offsets: Vec::with_capacity(blocks),
        sizes: Vec::with_capacity(blocks),
        flags: Vec::with_capacity(blocks),
    };
    for i in 0..blocks {
        let offset = tree.get_int(dms, &format!("blockinfo[{}].offset", i))?;
        let size = tree.get_int(dms, &format!("blockinfo[{}].size", i))?;
        let size = u32::try_from(size)
            .map_err(|_| HfaError::CorruptBlock {
                block: i,
                reason: format!("invalid size {}", size),
            })?;
        let logvalid = tree.get_int(dms, &format!("blockinfo[{}].logvalid", i))?;
        let compression = tree.get_int(dms, &format!("blockinfo[{}].compressionType", i))?;

        let mut flags = 0;
        if logvalid != 0 {
            flags |= BLOCK_VALID;
        }
        if compression != 0 {
            flags |= BLOCK_COMPRESSED;
        }
        table.offsets.push(offset as u32);
        table.sizes.push(size);
        table.flags.push(flags);
    }
    Ok(table)
}

/// Make room for `size` bytes of block data, reusing the current slot when it fits
fn reallocate(
    tree: &mut EntryTree,
    dms: EntryId,
    table: &mut BlockTable,
    block: usize,
    size: usize,
) -> Result<()> {
    let size = u32::try_from(size)
        .map_err(|_| HfaError::OutOfSpace(format!("block of {} bytes", size)))?;
    if table.offsets[block] == 0 || size > table.sizes[block] {
        table.offsets[block] = tree.allocator_mut().allocate(size)?;
        tree.set_field(dms, &format!("blockinfo[{}].offset", block), table.offsets[block])?;
    }
    table.sizes[block] = size;
    tree.set_field(dms, &format!("blockinfo[{}].size", block), size)?;
    Ok(())
}

/// Spill file named by a layer, next to the container
///
/// Falls back to the conventional name when the recorded one is missing.
pub(crate) fn resolve_spill_path(container: &Path, file_name: &str) -> PathBuf {
    let dir = container.parent().unwrap_or_else(|| Path::new(""));
    let recorded = Path::new(file_name)
        .file_name()
        .map(|name| dir.join(name))
        .unwrap_or_else(|| dir.join(file_name));
    if recorded.exists() {
        return recorded;
    }
    let fallback = spill::spill_file_name(container);
    if fallback.exists() {
        tracing::debug!(
            "Spill file {} not found, using {}",
            recorded.display(),
            fallback.display()
        );
        return fallback;
    }
    recorded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::SpaceAllocator;
    use crate::dictionary::TypeDictionary;
    use crate::header::ENTRY_HEADER_LEN;
    use crate::io::HfaFile;
    use tempfile::{NamedTempFile, TempDir};

    fn new_tree(path: &Path) -> EntryTree {
        EntryTree::create(
            HfaFile::create(path).unwrap(),
            SpaceAllocator::new(64),
            TypeDictionary::with_defaults().unwrap(),
            ENTRY_HEADER_LEN,
        )
    }

    fn spec(name: &str, size: usize, pixel_type: PixelType, compressed: bool) -> LayerSpec<'_> {
        LayerSpec {
            name,
            overview: false,
            width: size,
            height: size,
            block_size: 64,
            pixel_type,
            storage: LayerStorage::Internal { compressed },
        }
    }

    #[test]
    fn test_block_grid() {
        let grid = BlockGrid::new(100, 65, 64, 32).unwrap();
        assert_eq!((grid.blocks_per_row, grid.blocks_per_column), (2, 3));
        assert_eq!(grid.block_count(), 6);
        assert_eq!(grid.block_index(1, 2), Some(5));
        assert_eq!(grid.block_index(2, 0), None);
        assert_eq!(grid.block_bytes(PixelType::U4), Some(1024));
        assert!(BlockGrid::new(0, 10, 64, 64).is_err());
    }

    #[test]
    fn test_all_zero_block_round_trip() {
        let temp = NamedTempFile::new().unwrap();
        let mut tree = new_tree(temp.path());
        let root = tree.root();
        let layer = create_layer(&mut tree, root, &spec("Layer_1", 256, PixelType::U8, false)).unwrap();

        let mut band = Band::load(&mut tree, layer, BandSource::Primary).unwrap();
        assert!(band.is_valid());
        assert_eq!(band.grid().block_count(), 16);

        band.write_block(&mut tree, 1, 1, &[0u8; 4096]).unwrap();
        assert_eq!(band.read_block(&mut tree, 1, 1).unwrap(), vec![0u8; 4096]);
    }

    #[test]
    fn test_unwritten_block_reads_nodata() {
        let temp = NamedTempFile::new().unwrap();
        let mut tree = new_tree(temp.path());
        let root = tree.root();
        let layer = create_layer(&mut tree, root, &spec("Layer_1", 256, PixelType::U8, false)).unwrap();

        let mut band = Band::load(&mut tree, layer, BandSource::Primary).unwrap();
        assert_eq!(band.read_block(&mut tree, 0, 0).unwrap(), vec![0u8; 4096]);
        band.set_nodata(&mut tree, 5.0).unwrap();
        assert_eq!(band.read_block(&mut tree, 3, 3).unwrap(), vec![5u8; 4096]);

        let reloaded = Band::load(&mut tree, layer, BandSource::Primary).unwrap();
        assert_eq!(reloaded.nodata(), Some(5.0));
    }

    #[test]
    fn test_compressed_blocks_persist() {
        let temp = NamedTempFile::new().unwrap();
        let root_pos = {
            let mut tree = new_tree(temp.path());
            let root = tree.root();
            let layer =
                create_layer(&mut tree, root, &spec("Layer_1", 128, PixelType::U16, true)).unwrap();
            let mut band = Band::load(&mut tree, layer, BandSource::Primary).unwrap();
            assert!(band.is_compressed(&mut tree).unwrap());

            let constant: Vec<u8> = std::iter::repeat(700u16.to_ne_bytes()).take(4096).flatten().collect();
            band.write_block(&mut tree, 0, 0, &constant).unwrap();

            // Noise does not compress and flips the block to raw storage
            let mut state = 0x2545_f491u32;
            let noise: Vec<u8> = (0..8192)
                .map(|_| {
                    state ^= state << 13;
                    state ^= state >> 17;
                    state ^= state << 5;
                    state as u8
                })
                .collect();
            band.write_block(&mut tree, 1, 0, &noise).unwrap();
            assert_eq!(band.read_block(&mut tree, 1, 0).unwrap(), noise);
            tree.flush().unwrap();
            tree.file_pos(root)
        };

        let file = HfaFile::open(temp.path(), Access::ReadOnly).unwrap();
        let alloc = SpaceAllocator::from_file_len(file.len().unwrap()).unwrap();
        let mut tree =
            EntryTree::open(file, alloc, TypeDictionary::with_defaults().unwrap(), ENTRY_HEADER_LEN, root_pos)
                .unwrap();
        let root = tree.root();
        let layer = tree.named_child(root, "Layer_1").unwrap().unwrap();
        let dms = tree.named_child(layer, "RasterDMS").unwrap().unwrap();
        assert_eq!(tree.get_int(dms, "blockinfo[0].compressionType").unwrap(), 1);
        assert_eq!(tree.get_int(dms, "blockinfo[1].compressionType").unwrap(), 0);
        assert_eq!(tree.get_string(dms, "blockinfo[0].logvalid").unwrap(), "true");
        assert_eq!(tree.get_int(dms, "blockinfo[0].size").unwrap(), 13);

        let mut band = Band::load(&mut tree, layer, BandSource::Primary).unwrap();
        let block = band.read_block(&mut tree, 0, 0).unwrap();
        assert!(block.chunks_exact(2).all(|p| u16::from_ne_bytes([p[0], p[1]]) == 700));
        assert!(band.read_block(&mut tree, 1, 1).unwrap().iter().all(|&b| b == 0));
        assert!(matches!(
            band.write_block(&mut tree, 0, 0, &block),
            Err(HfaError::ReadOnly)
        ));
    }

    #[test]
    fn test_write_to_unallocated_raw_block_fails() {
        let temp = NamedTempFile::new().unwrap();
        let mut tree = new_tree(temp.path());
        let root = tree.root();
        let layer = create_layer(&mut tree, root, &spec("Layer_1", 64, PixelType::U8, false)).unwrap();
        let dms = tree.named_child(layer, "RasterDMS").unwrap().unwrap();
        tree.set_field(dms, "blockinfo[0].offset", 0).unwrap();

        let mut band = Band::load(&mut tree, layer, BandSource::Primary).unwrap();
        assert!(matches!(
            band.write_block(&mut tree, 0, 0, &[1u8; 4096]),
            Err(HfaError::NotSupported(_))
        ));
        assert!(matches!(
            band.write_block(&mut tree, 0, 0, &[1u8; 10]),
            Err(HfaError::InvalidArgument(_))
        ));
        assert!(matches!(
            band.read_block(&mut tree, 1, 0),
            Err(HfaError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_invalid_layer_refuses_io() {
        let temp = NamedTempFile::new().unwrap();
        let mut tree = new_tree(temp.path());
        let root = tree.root();
        let layer = tree.new_child(root, "Broken", "Eimg_Layer").unwrap();
        tree.set_field(layer, "width", 0).unwrap();
        tree.set_field(layer, "height", 10).unwrap();
        tree.set_field(layer, "blockWidth", 64).unwrap();
        tree.set_field(layer, "blockHeight", 64).unwrap();

        let mut band = Band::load(&mut tree, layer, BandSource::Primary).unwrap();
        assert!(!band.is_valid());
        assert_eq!(band.width(), 0);
        assert!(matches!(band.read_block(&mut tree, 0, 0), Err(HfaError::Corrupt(_))));
    }

    #[test]
    fn test_short_block_table_rejected() {
        let temp = NamedTempFile::new().unwrap();
        let mut tree = new_tree(temp.path());
        let root = tree.root();
        let layer = create_layer(&mut tree, root, &spec("Layer_1", 64, PixelType::U8, false)).unwrap();
        tree.set_field(layer, "width", 128).unwrap();

        let mut band = Band::load(&mut tree, layer, BandSource::Primary).unwrap();
        assert!(matches!(band.read_block(&mut tree, 0, 0), Err(HfaError::Corrupt(_))));
    }

    #[test]
    fn test_spill_backed_layers() {
        let dir = TempDir::new().unwrap();
        let img = dir.path().join("big.img");
        let mut tree = new_tree(&img);
        let root = tree.root();
        let grid = BlockGrid::new(256, 256, 64, 64).unwrap();
        let spill_path = spill::spill_file_name(&img);
        let layout = spill::create_spill_stack(&spill_path, &grid, 3, PixelType::U16).unwrap();

        let mut bands = Vec::new();
        for index in 0..3 {
            let name = format!("Layer_{}", index + 1);
            let layer = create_layer(
                &mut tree,
                root,
                &LayerSpec {
                    name: &name,
                    overview: false,
                    width: 256,
                    height: 256,
                    block_size: 64,
                    pixel_type: PixelType::U16,
                    storage: LayerStorage::External {
                        file_name: "big.ige",
                        layout,
                        layers: 3,
                        index,
                    },
                },
            )
            .unwrap();
            bands.push(Band::load(&mut tree, layer, BandSource::Primary).unwrap());
        }

        for (i, band) in bands.iter_mut().enumerate() {
            assert!(band.is_spilled(&mut tree).unwrap());
            band.write_block(&mut tree, 2, 1, &vec![i as u8 + 10; 8192]).unwrap();
        }
        for (i, band) in bands.iter_mut().enumerate() {
            assert_eq!(band.read_block(&mut tree, 2, 1).unwrap(), vec![i as u8 + 10; 8192]);
        }

        let raw = std::fs::read(&spill_path).unwrap();
        let k = 6u64;
        for i in 0..3u64 {
            let at = (layout.data_offset + 8192 * k * 3 + i * 8192) as usize;
            assert_eq!(raw[at], i as u8 + 10);
        }
    }
}
