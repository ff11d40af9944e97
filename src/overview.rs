//! Reduced-resolution overviews
//!
//! Overviews are listed by name in a band's `RRDNamesList` as
//! `file(:band:layer)` and may live in the container itself or in its
//! dependent `.rrd`. Older files keep them as `Eimg_Layer_SubSample`
//! children of the band instead.

use crate::band::{self, Band, BandSource, BlockGrid, LayerSpec, LayerStorage};
use crate::config::DEFAULT_BLOCK_SIZE;
use crate::container::Container;
use crate::entry::{EntryId, EntryTree};
use crate::error::{HfaError, Result};
use crate::spill;

/// Payload reserved for a new overview name list, on top of its fixed part
const NAME_LIST_RESERVE: usize = 3000;

const RESAMPLING_ALGORITHM: &str = "IMAGINE 2X2 Resampling";

/// Tree an entry of `source` lives in
fn source_tree<'a>(
    tree: &'a mut EntryTree,
    dependent: &'a mut Option<Box<Container>>,
    source: BandSource,
) -> Result<&'a mut EntryTree> {
    match source {
        BandSource::Primary => Ok(tree),
        BandSource::Dependent => dependent
            .as_deref_mut()
            .map(|d| &mut d.tree)
            .ok_or_else(|| HfaError::EntryNotFound("dependent file".to_string())),
    }
}

/// Split `file(:band:layer)` into the file name and a dotted entry path
fn split_overview_name(name: &str) -> Option<(&str, String)> {
    let (file, rest) = name.split_once("(:")?;
    let path = rest.strip_suffix(')').unwrap_or(rest).replace(':', ".");
    Some((file, path))
}

impl Container {
    /// Discover the overviews of `band` once, largest first
    pub(crate) fn load_overviews(&mut self, band: usize) -> Result<()> {
        let node = self.band_node(band)?;
        if self.bands[band].overviews_loaded {
            return Ok(());
        }
        self.bands[band].overviews_loaded = true;

        let mut found = Vec::new();
        if let Some(list) = self.tree.named_child(node, "RRDNamesList")? {
            for i in 0..self.config.max_overview_names {
                let Ok(name) = self.tree.get_string(list, &format!("nameList[{}].string", i)) else {
                    break;
                };
                match self.load_named_overview(&name)? {
                    Some(overview) => found.push(overview),
                    None => {
                        tracing::warn!("Unusable overview {} of band {}; ignoring the rest", name, band + 1);
                        break;
                    }
                }
            }
        }

        if found.is_empty() && self.is_aux() {
            found = self.load_proxy_overviews(band)?;
        }

        if found.is_empty() {
            for child in self.tree.children(node)? {
                if !self.tree.type_name(child).eq_ignore_ascii_case("Eimg_Layer_SubSample") {
                    continue;
                }
                let overview = Band::load(&mut self.tree, child, BandSource::Primary)?;
                if !overview.is_valid() {
                    break;
                }
                found.push(overview);
            }
        }

        tracing::debug!("Band {} has {} overviews", band + 1, found.len());
        let band = &mut self.bands[band];
        band.overviews = found;
        band.sort_overviews();
        Ok(())
    }

    fn is_aux(&self) -> bool {
        self.path()
            .extension()
            .is_some_and(|e| e.eq_ignore_ascii_case("aux"))
    }

    /// Load the overview an `RRDNamesList` entry points at
    fn load_named_overview(&mut self, name: &str) -> Result<Option<Band>> {
        let Some((file, path)) = split_overview_name(name) else {
            return Ok(None);
        };

        let mut source = self.resolve_dependent(file)?;
        if source.is_none() {
            // Files renamed without updating their references
            let fallback = self
                .dependent_path()
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            tracing::debug!("Overview file {} not found, trying {}", file, fallback);
            source = self.resolve_dependent(&fallback)?;
        }
        let Some(source) = source else {
            return Ok(None);
        };

        let tree = source_tree(&mut self.tree, &mut self.dependent, source)?;
        let root = tree.root();
        let Some(node) = tree.named_child(root, &path)? else {
            return Ok(None);
        };
        let overview = Band::load(tree, node, source)?;
        Ok(overview.is_valid().then_some(overview))
    }

    /// Overviews under the layer of the same name in `<stem>.rrd`, for `.aux` files
    fn load_proxy_overviews(&mut self, band: usize) -> Result<Vec<Band>> {
        let band_name = self.band_name(band)?;
        let rrd = self
            .dependent_path()
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if self.resolve_dependent(&rrd)? != Some(BandSource::Dependent) {
            return Ok(Vec::new());
        }

        let tree = source_tree(&mut self.tree, &mut self.dependent, BandSource::Dependent)?;
        let root = tree.root();
        let Some(proxy) = tree.named_child(root, &band_name)? else {
            return Ok(Vec::new());
        };
        let mut found = Vec::new();
        for child in tree.children(proxy)? {
            if !tree.type_name(child).eq_ignore_ascii_case("Eimg_Layer_SubSample") {
                continue;
            }
            let overview = Band::load(tree, child, BandSource::Dependent)?;
            if !overview.is_valid() {
                break;
            }
            found.push(overview);
        }
        Ok(found)
    }

    pub fn overview_count(&mut self, band: usize) -> Result<usize> {
        self.load_overviews(band)?;
        Ok(self.bands[band].overviews.len())
    }

    /// Overview `overview` of `band`, largest first
    pub fn overview(&mut self, band: usize, overview: usize) -> Result<&Band> {
        self.load_overviews(band)?;
        self.bands[band]
            .overviews
            .get(overview)
            .ok_or(HfaError::OverviewIndex { band, overview })
    }

    fn overview_parts(
        &mut self,
        band: usize,
        overview: usize,
    ) -> Result<(&mut Band, &mut EntryTree)> {
        self.load_overviews(band)?;
        let Container {
            tree,
            bands,
            dependent,
            ..
        } = self;
        let ov = bands[band]
            .overviews
            .get_mut(overview)
            .ok_or(HfaError::OverviewIndex { band, overview })?;
        let tree = source_tree(tree, dependent, ov.source())?;
        Ok((ov, tree))
    }

    pub fn read_overview_block(&mut self, band: usize, overview: usize, x: usize, y: usize) -> Result<Vec<u8>> {
        let (ov, tree) = self.overview_parts(band, overview)?;
        ov.read_block(tree, x, y)
    }

    pub fn write_overview_block(
        &mut self,
        band: usize,
        overview: usize,
        x: usize,
        y: usize,
        data: &[u8],
    ) -> Result<()> {
        let (ov, tree) = self.overview_parts(band, overview)?;
        ov.write_block(tree, x, y, data)
    }

    /// Add an empty overview reduced by `level`, returning its index
    ///
    /// The overview goes into the dependent `.rrd` when `use_rrd` is set,
    /// and into a spill file when the target file would grow too large.
    /// Its pixels are left for the caller to fill.
    pub fn create_overview(&mut self, band: usize, level: usize) -> Result<usize> {
        self.ensure_update()?;
        if level == 0 {
            return Err(HfaError::InvalidArgument("overview level must be at least 1".to_string()));
        }
        self.load_overviews(band)?;

        let band_node = self.band_node(band)?;
        let band_name = self.band_name(band)?;
        let parent_band = &self.bands[band];
        let pixel_type = parent_band.pixel_type();
        let nodata = parent_band.nodata();
        let (width, height) = (parent_band.width(), parent_band.height());
        let compressed = parent_band.is_compressed(&mut self.tree)?;
        let (ox, oy) = (width.div_ceil(level), height.div_ceil(level));
        let layer_name = format!("_ss_{}_", level);

        let source = if self.config.use_rrd {
            let dependent = self.create_dependent()?;
            let root = dependent.tree.root();
            if dependent.tree.named_child(root, &band_name)?.is_none() {
                let spec = LayerSpec {
                    name: &band_name,
                    overview: false,
                    width,
                    height,
                    block_size: DEFAULT_BLOCK_SIZE,
                    pixel_type,
                    storage: LayerStorage::Dependent,
                };
                band::create_layer(&mut dependent.tree, root, &spec)?;
            }
            BandSource::Dependent
        } else {
            BandSource::Primary
        };

        let use_spill = self.config.use_spill;
        let threshold = self.config.overview_spill_threshold;
        let tree = source_tree(&mut self.tree, &mut self.dependent, source)?;
        let parent = match source {
            BandSource::Primary => band_node,
            BandSource::Dependent => {
                let root = tree.root();
                tree.named_child(root, &band_name)?
                    .ok_or_else(|| HfaError::EntryNotFound(band_name.clone()))?
            }
        };
        let target_path = tree.file().path().to_path_buf();
        let target_name = target_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let projected = (ox as u64)
            .saturating_mul(oy as u64)
            .saturating_mul(pixel_type.bits() as u64)
            / 8;
        let spilled = use_spill || u64::from(tree.end_of_file()).saturating_add(projected) > threshold;

        let spill_path = spill::spill_file_name(&target_path);
        let spill_name = spill_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let storage = if spilled {
            let grid = BlockGrid::new(ox, oy, DEFAULT_BLOCK_SIZE, DEFAULT_BLOCK_SIZE)?;
            let layout = spill::create_spill_stack(&spill_path, &grid, 1, pixel_type)?;
            LayerStorage::External {
                file_name: &spill_name,
                layout,
                layers: 1,
                index: 0,
            }
        } else {
            LayerStorage::Internal { compressed }
        };
        let spec = LayerSpec {
            name: &layer_name,
            overview: true,
            width: ox,
            height: oy,
            block_size: DEFAULT_BLOCK_SIZE,
            pixel_type,
            storage,
        };
        let node = band::create_layer(tree, parent, &spec)?;
        let mut overview = Band::load(tree, node, source)?;
        if let Some(value) = nodata {
            overview.set_nodata(tree, value)?;
        }

        let reference = format!("{}(:{}:{})", target_name, band_name, layer_name);
        append_overview_name(&mut self.tree, band_node, &reference)?;

        tracing::info!(
            "Created overview {} ({}x{}{}) of band {}",
            reference,
            ox,
            oy,
            if spilled { ", spilled" } else { "" },
            band + 1
        );

        let band = &mut self.bands[band];
        band.overviews.push(overview);
        band.sort_overviews();
        Ok(band
            .overviews
            .iter()
            .position(|o| o.node() == node && o.source() == source)
            .unwrap_or(band.overviews.len() - 1))
    }
}

/// Append `reference` to the band's `RRDNamesList`, creating or growing it
fn append_overview_name(tree: &mut EntryTree, band: EntryId, reference: &str) -> Result<()> {
    let list = match tree.named_child(band, "RRDNamesList")? {
        Some(list) => list,
        None => {
            let list = tree.new_child(band, "RRDNamesList", "Eimg_RRDNamesList")?;
            tree.make_data(list, 23 + 16 + 8 + NAME_LIST_RESERVE)?;
            tree.set_position(list)?;
            tree.set_field(list, "algorithm.string", RESAMPLING_ALGORITHM)?;
            list
        }
    };

    let index = tree.field_count(list, "nameList")?;
    let path = format!("nameList[{}].string", index);
    match tree.set_field(list, &path, reference) {
        Err(HfaError::NotSupported(_)) => {
            let size = tree.data_size(list) as usize + NAME_LIST_RESERVE;
            tree.make_data(list, size)?;
            tree.set_field(list, &path, reference)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CreateOptions, HfaConfig};
    use crate::io::Access;
    use crate::pack::PixelType;
    use tempfile::TempDir;

    fn scene(dir: &TempDir) -> Container {
        Container::create(
            dir.path().join("scene.img"),
            200,
            100,
            1,
            PixelType::U8,
            &CreateOptions::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_split_overview_name() {
        assert_eq!(
            split_overview_name("scene.rrd(:Layer_1:_ss_2_)"),
            Some(("scene.rrd", "Layer_1._ss_2_".to_string()))
        );
        assert_eq!(split_overview_name("no reference"), None);
    }

    #[test]
    fn test_no_overviews() {
        let dir = TempDir::new().unwrap();
        let mut container = scene(&dir);
        assert_eq!(container.overview_count(0).unwrap(), 0);
        assert!(matches!(
            container.overview(0, 0),
            Err(HfaError::OverviewIndex { band: 0, overview: 0 })
        ));
    }

    #[test]
    fn test_create_internal_overviews_sorted() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("scene.img");
        let mut container = scene(&dir);

        assert_eq!(container.create_overview(0, 4).unwrap(), 0);
        assert_eq!(container.create_overview(0, 2).unwrap(), 0);
        assert_eq!(container.overview(0, 0).unwrap().width(), 100);
        assert_eq!(container.overview(0, 1).unwrap().width(), 50);

        let block = vec![9u8; 64 * 64];
        container.write_overview_block(0, 1, 0, 0, &block).unwrap();
        container.close().unwrap();

        let mut container = Container::open(&path, Access::ReadOnly).unwrap();
        assert_eq!(container.overview_count(0).unwrap(), 2);
        let sizes: Vec<_> = (0..2)
            .map(|i| {
                let ov = container.overview(0, i).unwrap();
                (ov.width(), ov.height())
            })
            .collect();
        assert_eq!(sizes, vec![(100, 50), (50, 25)]);
        assert_eq!(container.read_overview_block(0, 1, 0, 0).unwrap(), block);
    }

    #[test]
    fn test_create_overview_in_rrd() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("scene.img");
        let mut container = scene(&dir);
        container.set_config(HfaConfig {
            use_rrd: true,
            ..HfaConfig::default()
        });
        container.set_nodata(0, 7.0).unwrap();

        let index = container.create_overview(0, 2).unwrap();
        let ov = container.overview(0, index).unwrap();
        assert_eq!(ov.source(), BandSource::Dependent);
        assert_eq!(ov.nodata(), Some(7.0));
        container.close().unwrap();
        assert!(dir.path().join("scene.rrd").is_file());

        let mut container = Container::open(&path, Access::ReadOnly).unwrap();
        assert_eq!(container.overview_count(0).unwrap(), 1);
        let ov = container.overview(0, 0).unwrap();
        assert_eq!((ov.width(), ov.height()), (100, 50));
        assert_eq!(ov.source(), BandSource::Dependent);
        assert_eq!(container.read_overview_block(0, 0, 0, 0).unwrap(), vec![7u8; 64 * 64]);
    }

    #[test]
    fn test_spilled_overview() {
        let dir = TempDir::new().unwrap();
        let mut container = scene(&dir);
        container.set_config(HfaConfig {
            use_spill: true,
            ..HfaConfig::default()
        });
        let index = container.create_overview(0, 2).unwrap();
        assert!(dir.path().join("scene.ige").is_file());

        let block = vec![3u8; 64 * 64];
        container.write_overview_block(0, index, 1, 0, &block).unwrap();
        assert_eq!(container.read_overview_block(0, index, 1, 0).unwrap(), block);
    }

    #[test]
    fn test_create_overview_rejects_level_zero() {
        let dir = TempDir::new().unwrap();
        let mut container = scene(&dir);
        assert!(matches!(
            container.create_overview(0, 0),
            Err(HfaError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_name_list_grows() {
        let dir = TempDir::new().unwrap();
        let mut container = scene(&dir);
        let band = container.band_node(0).unwrap();
        let long = format!("{}(:Layer_1:_ss_2_)", "x".repeat(2000));
        append_overview_name(&mut container.tree, band, &long).unwrap();
        append_overview_name(&mut container.tree, band, &long).unwrap();

        let list = container.tree.named_child(band, "RRDNamesList").unwrap().unwrap();
        assert_eq!(container.tree.field_count(list, "nameList").unwrap(), 2);
        assert_eq!(container.tree.get_string(list, "nameList[1].string").unwrap(), long);
        assert_eq!(
            container.tree.get_string(list, "algorithm.string").unwrap(),
            RESAMPLING_ALGORITHM
        );
    }
}
