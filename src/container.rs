//! Container lifecycle and the band-level API
//!
//! A [`Container`] owns the open file, its entry tree and the bands found
//! under the root. Overviews live in `overview.rs` and companion-file
//! handling in `companion.rs`; both extend this type.

use crate::allocator::SpaceAllocator;
use crate::band::{self, Band, BandSource, BlockGrid, LayerSpec, LayerStorage};
use crate::config::{CreateOptions, HfaConfig};
use crate::dictionary::TypeDictionary;
use crate::entry::{EntryId, EntryTree};
use crate::error::{HfaError, Result};
use crate::header::{FileHeader, DICTIONARY_POS, DICTIONARY_PTR_OFFSET, ENTRY_HEADER_LEN, RECORD_LEN, ROOT_PTR_OFFSET, TAG_LEN};
use crate::io::{Access, HfaFile, IoStats};
use crate::metadata::{self, ColorTable, LayerType};
use crate::pack::PixelType;
use crate::projection::{self, Datum, MapInfo, ProParameters};
use crate::spill;
use crate::transform::{self, GeoTransform, TransformStack};
use std::path::{Path, PathBuf};

/// Bytes read per step while scanning for the end of the dictionary
const DICTIONARY_CHUNK: usize = 4096;

/// An open HFA container
///
/// Changes to the entry tree stay in memory until [`Container::flush`] or
/// [`Container::close`]. Block writes go straight to disk.
#[derive(Debug)]
pub struct Container {
    pub(crate) tree: EntryTree,
    pub(crate) header: FileHeader,
    pub(crate) width: usize,
    pub(crate) height: usize,
    pub(crate) bands: Vec<Band>,
    /// The one dependent (`.rrd`) container opened on behalf of this one
    pub(crate) dependent: Option<Box<Container>>,
    pub(crate) config: HfaConfig,
}

impl Container {
    /// Open an existing container
    pub fn open<P: AsRef<Path>>(path: P, access: Access) -> Result<Self> {
        Self::open_with(path, access, HfaConfig::default())
    }

    pub fn open_with<P: AsRef<Path>>(path: P, access: Access, config: HfaConfig) -> Result<Self> {
        let path = path.as_ref();
        let mut file = HfaFile::open(path, access)?;

        let tag = file.read_up_to(0, TAG_LEN)?;
        let header_pos = FileHeader::read_tag(&tag)?;
        let record = file.read_up_to(header_pos.into(), RECORD_LEN)?;
        let header = FileHeader::from_record(header_pos, &record)?;

        let alloc = SpaceAllocator::from_file_len(file.len()?)?;
        let text = read_dictionary_text(&mut file, header.dictionary_pos)?;
        let dict = TypeDictionary::from_file_text(&text);
        let tree = EntryTree::open(file, alloc, dict, header.entry_header_length, header.root_pos)?;

        let mut container = Container {
            tree,
            header,
            width: 0,
            height: 0,
            bands: Vec::new(),
            dependent: None,
            config,
        };
        container.parse_bands()?;

        tracing::info!(
            "Opened {} ({}x{}, {} bands, {:?})",
            path.display(),
            container.width,
            container.height,
            container.bands.len(),
            access
        );
        Ok(container)
    }

    /// Create a container with `band_count` layers named `Layer_1`, `Layer_2`, ...
    ///
    /// Rasters too large for the 32-bit offsets of the container (or all of
    /// them with `use_spill`) get their pixels in an `.ige` spill file, and
    /// are never compressed.
    pub fn create<P: AsRef<Path>>(
        path: P,
        width: usize,
        height: usize,
        band_count: usize,
        pixel_type: PixelType,
        options: &CreateOptions,
    ) -> Result<Self> {
        let path = path.as_ref();
        let block_size = options.effective_block_size();
        let grid = BlockGrid::new(width, height, block_size, block_size)?;
        let block_bytes = grid
            .block_bytes(pixel_type)
            .ok_or_else(|| HfaError::Overflow("block size".to_string()))?;

        let mut container = Self::create_empty(path, HfaConfig::default())?;
        remove_stale_companions(path);

        let root = container.tree.root();
        if let Some(dependent) = &options.dependent_file {
            write_dependent_file(&mut container.tree, dependent)?;
        }

        let raster_bytes = (block_bytes as u64)
            .saturating_mul(grid.block_count() as u64)
            .saturating_mul(band_count as u64);
        let use_spill = options.use_spill || raster_bytes > options.spill_threshold;
        let compressed = options.compressed && !use_spill;
        tracing::debug!(
            "{} blocks per row, {} per column, {} bytes per block{}",
            grid.blocks_per_row,
            grid.blocks_per_column,
            block_bytes,
            if use_spill { ", spilled" } else { "" }
        );

        let format_info = container.tree.new_child(root, "IMGFormatInfo", "ImgFormatInfo831")?;
        container.tree.make_data(format_info, 0)?;
        let space_used = if use_spill { 0 } else { u32::try_from(raster_bytes).unwrap_or(u32::MAX) };
        container.tree.set_field(format_info, "spaceUsedForRasterData", space_used)?;

        let spill_path = spill::spill_file_name(path);
        let spill_name = spill_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let layout = if use_spill && band_count > 0 {
            Some(spill::create_spill_stack(&spill_path, &grid, band_count, pixel_type)?)
        } else {
            None
        };

        for index in 0..band_count {
            let name = format!("Layer_{}", index + 1);
            let storage = match layout {
                Some(layout) => LayerStorage::External {
                    file_name: &spill_name,
                    layout,
                    layers: band_count,
                    index,
                },
                None => LayerStorage::Internal { compressed },
            };
            let spec = LayerSpec {
                name: &name,
                overview: false,
                width,
                height,
                block_size,
                pixel_type,
                storage,
            };
            band::create_layer(&mut container.tree, root, &spec)?;
        }
        container.parse_bands()?;

        tracing::info!(
            "Created {} ({}x{}, {} bands of {})",
            path.display(),
            width,
            height,
            band_count,
            pixel_type.name()
        );
        Ok(container)
    }

    /// Header, dictionary and an empty root; used for new files and dependents
    pub(crate) fn create_empty(path: &Path, config: HfaConfig) -> Result<Self> {
        let mut file = HfaFile::create(path)?;
        let header = FileHeader::new();
        file.write_at(0, &header.to_bytes())?;

        let dict = TypeDictionary::with_defaults()?;
        let mut text = dict.text().as_bytes().to_vec();
        text.push(0);
        file.write_at(DICTIONARY_POS.into(), &text)?;
        let end = u32::try_from(text.len())
            .ok()
            .and_then(|n| n.checked_add(DICTIONARY_POS))
            .ok_or_else(|| HfaError::OutOfSpace("dictionary".to_string()))?;

        let tree = EntryTree::create(file, SpaceAllocator::new(end), dict, ENTRY_HEADER_LEN);
        Ok(Container {
            tree,
            header,
            width: 0,
            height: 0,
            bands: Vec::new(),
            dependent: None,
            config,
        })
    }

    /// Collect the root's layers as bands
    ///
    /// Every band must match the size of the first; a layer of another
    /// size or an unusable one ends the scan.
    pub(crate) fn parse_bands(&mut self) -> Result<()> {
        self.bands.clear();
        let root = self.tree.root();
        for node in self.tree.children(root)? {
            if !self.tree.type_name(node).eq_ignore_ascii_case("Eimg_Layer") {
                continue;
            }
            let size = self
                .tree
                .get_int(node, "width")
                .and_then(|w| Ok((w, self.tree.get_int(node, "height")?)));
            let (w, h) = match size {
                Ok((w, h)) if w > 0 && h > 0 => (w as usize, h as usize),
                Ok(_) => continue,
                Err(e) => {
                    tracing::warn!("Skipping layer {}: {}", self.tree.name(node), e);
                    continue;
                }
            };

            if self.bands.is_empty() {
                self.width = w;
                self.height = h;
            } else if (w, h) != (self.width, self.height) {
                tracing::warn!(
                    "Layer {} is {}x{}, expected {}x{}; ignoring it and later layers",
                    self.tree.name(node),
                    w,
                    h,
                    self.width,
                    self.height
                );
                break;
            }

            let band = Band::load(&mut self.tree, node, BandSource::Primary)?;
            if !band.is_valid() {
                break;
            }
            self.bands.push(band);
        }
        Ok(())
    }

    /// Write the dirty entries, the dictionary if it grew, and the header pointers
    ///
    /// Does nothing, and touches no byte, when nothing changed.
    pub fn flush(&mut self) -> Result<()> {
        if let Some(dependent) = &mut self.dependent {
            dependent.flush()?;
        }
        if self.access() == Access::ReadOnly {
            return Ok(());
        }
        let dictionary_dirty = self.tree.dictionary().is_text_dirty();
        if !self.tree.is_tree_dirty() && !dictionary_dirty {
            return Ok(());
        }

        self.tree.flush()?;

        let mut dictionary_pos = self.header.dictionary_pos;
        if dictionary_dirty {
            let mut text = self.tree.dictionary().text().as_bytes().to_vec();
            text.push(0);
            dictionary_pos = self.tree.allocator_mut().allocate_len(text.len())?;
            self.tree.file_mut().write_at(dictionary_pos.into(), &text)?;
            self.tree.dictionary_mut().mark_text_clean();
            tracing::debug!("Rewrote dictionary at {}", dictionary_pos);
        }

        let root_pos = self.tree.file_pos(self.tree.root());
        if root_pos != self.header.root_pos || dictionary_pos != self.header.dictionary_pos {
            let header_pos = u64::from(self.header.header_pos);
            let file = self.tree.file_mut();
            file.write_at(header_pos + u64::from(ROOT_PTR_OFFSET), &root_pos.to_le_bytes())?;
            file.write_at(header_pos + u64::from(DICTIONARY_PTR_OFFSET), &dictionary_pos.to_le_bytes())?;
            self.header.root_pos = root_pos;
            self.header.dictionary_pos = dictionary_pos;
        }

        tracing::info!("Flushed {}", self.path().display());
        Ok(())
    }

    /// Flush and release the container and its dependent
    pub fn close(mut self) -> Result<()> {
        self.flush()?;
        for band in &mut self.bands {
            band.sync()?;
        }
        if self.access() == Access::Update {
            self.tree.file_mut().sync()?;
        }
        if let Some(dependent) = self.dependent.take() {
            dependent.close()?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        self.tree.file().path()
    }

    /// File name without its directory
    pub fn file_name(&self) -> String {
        self.path()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub(crate) fn directory(&self) -> PathBuf {
        self.path().parent().map(Path::to_path_buf).unwrap_or_default()
    }

    pub fn access(&self) -> Access {
        self.tree.file().access()
    }

    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    pub fn config(&self) -> &HfaConfig {
        &self.config
    }

    pub fn set_config(&mut self, config: HfaConfig) {
        self.config = config;
    }

    /// Reads and writes issued on the container file so far
    pub fn io_stats(&self) -> IoStats {
        self.tree.file().stats()
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn band_count(&self) -> usize {
        self.bands.len()
    }

    pub fn band(&self, band: usize) -> Result<&Band> {
        self.bands.get(band).ok_or(HfaError::BandIndex(band))
    }

    /// The entry tree, for direct access to entries and fields
    pub fn tree(&mut self) -> &mut EntryTree {
        &mut self.tree
    }

    pub(crate) fn ensure_update(&self) -> Result<()> {
        match self.access() {
            Access::Update => Ok(()),
            Access::ReadOnly => Err(HfaError::ReadOnly),
        }
    }

    pub(crate) fn band_node(&self, band: usize) -> Result<EntryId> {
        Ok(self.band(band)?.node())
    }

    fn band_nodes(&self) -> Vec<EntryId> {
        self.bands.iter().map(Band::node).collect()
    }

    /// Name of a band; unnamed layers report `Layer_<n>`
    pub fn band_name(&self, band: usize) -> Result<String> {
        let node = self.band_node(band)?;
        let name = self.tree.name(node);
        if name.is_empty() {
            Ok(format!("Layer_{}", band + 1))
        } else {
            Ok(name.to_string())
        }
    }

    pub fn set_band_name(&mut self, band: usize, name: &str) -> Result<()> {
        self.ensure_update()?;
        let node = self.band_node(band)?;
        self.tree.rename(node, name);
        Ok(())
    }

    pub fn pixel_type(&self, band: usize) -> Result<PixelType> {
        Ok(self.band(band)?.pixel_type())
    }

    pub fn block_size(&self, band: usize) -> Result<(usize, usize)> {
        Ok(self.band(band)?.block_size())
    }

    pub fn is_compressed(&mut self, band: usize) -> Result<bool> {
        let Container { tree, bands, .. } = self;
        bands.get(band).ok_or(HfaError::BandIndex(band))?.is_compressed(tree)
    }

    pub fn nodata(&self, band: usize) -> Result<Option<f64>> {
        Ok(self.band(band)?.nodata())
    }

    pub fn set_nodata(&mut self, band: usize, value: f64) -> Result<()> {
        let Container { tree, bands, .. } = self;
        bands
            .get_mut(band)
            .ok_or(HfaError::BandIndex(band))?
            .set_nodata(tree, value)
    }

    /// Read one block in native byte order
    pub fn read_block(&mut self, band: usize, x: usize, y: usize) -> Result<Vec<u8>> {
        let Container { tree, bands, .. } = self;
        bands
            .get_mut(band)
            .ok_or(HfaError::BandIndex(band))?
            .read_block(tree, x, y)
    }

    /// Write one block given in native byte order
    pub fn write_block(&mut self, band: usize, x: usize, y: usize, data: &[u8]) -> Result<()> {
        let Container { tree, bands, .. } = self;
        bands
            .get_mut(band)
            .ok_or(HfaError::BandIndex(band))?
            .write_block(tree, x, y, data)
    }

    pub fn layer_type(&mut self, band: usize) -> Result<Option<LayerType>> {
        let node = self.band_node(band)?;
        metadata::layer_type(&mut self.tree, node)
    }

    pub fn set_layer_type(&mut self, band: usize, layer_type: LayerType) -> Result<()> {
        self.ensure_update()?;
        let node = self.band_node(band)?;
        metadata::set_layer_type(&mut self.tree, node, layer_type)
    }

    pub fn color_table(&mut self, band: usize) -> Result<Option<ColorTable>> {
        let node = self.band_node(band)?;
        metadata::color_table(&mut self.tree, node)
    }

    pub fn set_color_table(&mut self, band: usize, table: &ColorTable) -> Result<()> {
        self.ensure_update()?;
        let node = self.band_node(band)?;
        metadata::set_color_table(&mut self.tree, node, table)
    }

    pub fn data_range(&mut self, band: usize) -> Result<Option<(f64, f64)>> {
        let node = self.band_node(band)?;
        metadata::data_range(&mut self.tree, node)
    }

    fn metadata_node(&self, band: Option<usize>) -> Result<EntryId> {
        match band {
            Some(band) => self.band_node(band),
            None => Ok(self.tree.root()),
        }
    }

    /// String metadata of a band, or of the container with `None`
    pub fn metadata(&mut self, band: Option<usize>) -> Result<Vec<(String, String)>> {
        let node = self.metadata_node(band)?;
        metadata::read_metadata(&mut self.tree, node)
    }

    pub fn set_metadata(&mut self, band: Option<usize>, items: &[(String, String)]) -> Result<()> {
        self.ensure_update()?;
        let node = self.metadata_node(band)?;
        metadata::write_metadata(&mut self.tree, node, items)
    }

    pub fn map_info(&mut self) -> Result<Option<MapInfo>> {
        match self.bands.first().map(Band::node) {
            Some(node) => projection::read_map_info(&mut self.tree, node),
            None => Ok(None),
        }
    }

    /// Store a MapInfo on every band
    pub fn set_map_info(&mut self, info: &MapInfo) -> Result<()> {
        self.ensure_update()?;
        for node in self.band_nodes() {
            projection::write_map_info(&mut self.tree, node, info)?;
        }
        Ok(())
    }

    /// Projection name and units recorded with a geo-transform
    pub fn map_information(&mut self) -> Result<Option<(String, String)>> {
        match self.bands.first().map(Band::node) {
            Some(node) => projection::read_map_information(&mut self.tree, node),
            None => Ok(None),
        }
    }

    /// Pixel-corner geo-transform, if the container is georeferenced
    ///
    /// A MapInfo wins; otherwise a single affine map-to-pixel step of the
    /// first band is inverted.
    pub fn geo_transform(&mut self) -> Result<Option<GeoTransform>> {
        if let Some(info) = self.map_info()? {
            return Ok(Some(transform::from_corners(
                (info.upper_left.x, info.upper_left.y),
                (info.lower_right.x, info.lower_right.y),
                (info.pixel_width, info.pixel_height),
                &info.units,
            )));
        }

        let Some(band) = self.bands.first().map(Band::node) else {
            return Ok(None);
        };
        let Some(step) = self.tree.named_child(band, "MapToPixelXForm.XForm0")? else {
            return Ok(None);
        };
        if self.tree.named_child(band, "MapToPixelXForm.XForm1")?.is_some() {
            return Ok(None);
        }
        match transform::read_polynomial(&mut self.tree, step, "")? {
            Some(poly) if poly.order == 1 => Ok(transform::from_map_to_pixel(&poly)),
            _ => Ok(None),
        }
    }

    /// Georeference every band with a `MapInformation` entry and an affine transform step
    pub fn set_geo_transform(&mut self, projection_name: &str, units: &str, gt: &GeoTransform) -> Result<()> {
        self.ensure_update()?;
        let forward = transform::to_map_to_pixel(gt);
        let stack = TransformStack {
            reverse: forward.inverse().into_iter().collect(),
            forward: vec![forward],
        };
        for node in self.band_nodes() {
            projection::write_map_information(&mut self.tree, node, projection_name, units)?;
            transform::write_stack(&mut self.tree, node, &stack)?;
        }
        Ok(())
    }

    pub fn transform_stack(&mut self) -> Result<TransformStack> {
        match self.bands.first().map(Band::node) {
            Some(node) => transform::read_stack(&mut self.tree, node),
            None => Ok(TransformStack::default()),
        }
    }

    pub fn set_transform_stack(&mut self, stack: &TransformStack) -> Result<()> {
        self.ensure_update()?;
        for node in self.band_nodes() {
            transform::write_stack(&mut self.tree, node, stack)?;
        }
        Ok(())
    }

    pub fn pro_parameters(&mut self) -> Result<Option<ProParameters>> {
        match self.bands.first().map(Band::node) {
            Some(node) => projection::read_pro_parameters(&mut self.tree, node),
            None => Ok(None),
        }
    }

    pub fn set_pro_parameters(&mut self, pro: &ProParameters) -> Result<()> {
        self.ensure_update()?;
        for node in self.band_nodes() {
            projection::write_pro_parameters(&mut self.tree, node, pro)?;
        }
        Ok(())
    }

    pub fn datum(&mut self) -> Result<Option<Datum>> {
        match self.bands.first().map(Band::node) {
            Some(node) => projection::read_datum(&mut self.tree, node),
            None => Ok(None),
        }
    }

    pub fn set_datum(&mut self, datum: &Datum) -> Result<()> {
        self.ensure_update()?;
        for node in self.band_nodes() {
            projection::write_datum(&mut self.tree, node, datum)?;
        }
        Ok(())
    }

    /// ESRI PE coordinate system string of the first band
    pub fn pe_string(&mut self) -> Result<Option<String>> {
        match self.bands.first().map(Band::node) {
            Some(node) => projection::read_pe_string(&mut self.tree, node),
            None => Ok(None),
        }
    }

    pub fn set_pe_string(&mut self, pe: &str) -> Result<()> {
        self.ensure_update()?;
        for node in self.band_nodes() {
            projection::write_pe_string(&mut self.tree, node, pe)?;
        }
        Ok(())
    }

    /// Indented listing of every entry
    pub fn dump_tree(&mut self) -> Result<String> {
        self.tree.dump()
    }

    /// Dictionary text as stored (or to be stored) in the file
    pub fn dictionary_text(&self) -> &str {
        self.tree.dictionary().text()
    }
}

/// Read dictionary text up to a NUL or through the first `,.`
fn read_dictionary_text(file: &mut HfaFile, pos: u32) -> Result<String> {
    let mut text = Vec::new();
    let mut offset = u64::from(pos);
    'scan: loop {
        let chunk = file.read_up_to(offset, DICTIONARY_CHUNK)?;
        if chunk.is_empty() {
            break;
        }
        for &byte in &chunk {
            if byte == 0 {
                break 'scan;
            }
            text.push(byte);
            if text.ends_with(b",.") {
                break 'scan;
            }
        }
        offset += chunk.len() as u64;
    }
    Ok(String::from_utf8_lossy(&text).into_owned())
}

/// Record the primary file a dependent belongs to
pub(crate) fn write_dependent_file(tree: &mut EntryTree, name: &str) -> Result<()> {
    let root = tree.root();
    let node = tree.new_child(root, "DependentFile", "Eimg_DependentFile")?;
    tree.make_data(node, name.len() + 50)?;
    tree.set_position(node)?;
    tree.set_field(node, "dependent.string", name)
}

/// Remove `.rrd` and `.ige` files left over from an earlier file of the same name
fn remove_stale_companions(path: &Path) {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase());
    if matches!(ext.as_deref(), Some("rrd") | Some("aux")) {
        return;
    }
    for companion in ["rrd", "ige"] {
        let stale = path.with_extension(companion);
        if stale.is_file() {
            match std::fs::remove_file(&stale) {
                Ok(()) => tracing::debug!("Removed stale {}", stale.display()),
                Err(e) => tracing::warn!("Could not remove stale {}: {}", stale.display(), e),
            }
        }
    }
}
