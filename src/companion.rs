//! Dependent `.rrd` files, spill file lookup and renaming support

use crate::band::{self, BandSource};
use crate::container::{self, Container};
use crate::entry::{EntryId, EntryTree};
use crate::error::{HfaError, Result};
use crate::io::Access;
use crate::projection::reset_payload;
use std::path::{Path, PathBuf};

impl Container {
    /// Open or create the `<stem>.rrd` dependent of this container
    ///
    /// An existing file is reused. The dependent records which primary it
    /// belongs to in a `DependentFile` entry.
    pub fn create_dependent(&mut self) -> Result<&mut Container> {
        self.ensure_update()?;
        let path = self.dependent_path();
        let cached = self
            .dependent
            .as_ref()
            .is_some_and(|d| d.path() == path.as_path());

        if !cached {
            let mut dependent = if path.is_file() {
                tracing::debug!("Reusing dependent {}", path.display());
                Container::open_with(&path, Access::Update, self.config.clone())?
            } else {
                tracing::info!("Creating dependent {}", path.display());
                Container::create_empty(&path, self.config.clone())?
            };

            let dep_root = dependent.tree.root();
            if dependent.tree.named_child(dep_root, "DependentFile")?.is_none() {
                let primary = self.primary_file_name()?;
                container::write_dependent_file(&mut dependent.tree, &primary)?;
            }
            if let Some(old) = self.dependent.replace(Box::new(dependent)) {
                old.close()?;
            }
        }

        self.dependent
            .as_deref_mut()
            .ok_or_else(|| HfaError::EntryNotFound(path.display().to_string()))
    }

    /// The container holding entries for `name`: this one, its cached
    /// dependent, or a file of that name next to this one
    ///
    /// A file that cannot be opened is reported and treated as absent.
    pub fn dependent(&mut self, name: &str) -> Result<Option<&mut Container>> {
        if self.file_name().eq_ignore_ascii_case(name) {
            return Ok(Some(self));
        }
        let cached = self
            .dependent
            .as_ref()
            .is_some_and(|d| d.file_name().eq_ignore_ascii_case(name));

        if !cached {
            let path = self.directory().join(name);
            if !path.is_file() {
                tracing::debug!("No dependent file {}", path.display());
                return Ok(None);
            }
            match Container::open_with(&path, self.access(), self.config.clone()) {
                Ok(dependent) => {
                    if let Some(old) = self.dependent.replace(Box::new(dependent)) {
                        old.close()?;
                    }
                }
                Err(e) => {
                    tracing::warn!("Could not open dependent {}: {}", path.display(), e);
                    return Ok(None);
                }
            }
        }
        Ok(self.dependent.as_deref_mut())
    }

    /// Which tree entries of file `name` live in, opening it if needed
    pub(crate) fn resolve_dependent(&mut self, name: &str) -> Result<Option<BandSource>> {
        if self.file_name().eq_ignore_ascii_case(name) {
            return Ok(Some(BandSource::Primary));
        }
        Ok(self.dependent(name)?.map(|_| BandSource::Dependent))
    }

    pub(crate) fn dependent_path(&self) -> PathBuf {
        self.path().with_extension("rrd")
    }

    /// Name recorded as the primary of a new dependent
    ///
    /// A container that is itself a dependent passes on its own primary.
    fn primary_file_name(&mut self) -> Result<String> {
        let root = self.tree.root();
        if let Some(node) = self.tree.named_child(root, "DependentFile")? {
            if let Ok(name) = self.tree.get_string(node, "dependent.string") {
                if !name.is_empty() {
                    return Ok(name);
                }
            }
        }
        Ok(self.file_name())
    }

    /// Path of the spill file holding this container's pixels, if any
    pub fn spill_file_path(&mut self) -> Result<Option<PathBuf>> {
        let root = self.tree.root();
        let Some(&ext) = self
            .tree
            .find_children(root, None, Some("ImgExternalRaster"))?
            .first()
        else {
            return Ok(None);
        };
        let name = self.tree.get_string(ext, "fileName.string")?;
        Ok(Some(band::resolve_spill_path(self.path(), &name)))
    }

    /// Point references to `old_base` files at `new_base` after a rename
    ///
    /// Overview names, spill file names and dependent back-references are
    /// rewritten in this container and in its cached dependent.
    pub fn rename_references(&mut self, new_base: &str, old_base: &str) -> Result<()> {
        self.ensure_update()?;
        rename_in_tree(&mut self.tree, new_base, old_base)?;
        if let Some(dependent) = self.dependent.as_deref_mut() {
            rename_in_tree(&mut dependent.tree, new_base, old_base)?;
        }
        tracing::info!("Renamed references from {} to {}", old_base, new_base);
        Ok(())
    }

    /// Delete a container together with its spill file
    pub fn delete<P: AsRef<Path>>(path: P) -> Result<()> {
        let path = path.as_ref();
        let spill = match Container::open(path, Access::ReadOnly) {
            Ok(mut container) => container.first_layer_spill()?,
            Err(e) => {
                tracing::debug!("Deleting {} without inspecting it: {}", path.display(), e);
                None
            }
        };
        if let Some(spill) = spill.filter(|p| p.is_file()) {
            std::fs::remove_file(&spill)?;
            tracing::debug!("Deleted spill file {}", spill.display());
        }
        std::fs::remove_file(path)?;
        Ok(())
    }

    /// Spill file named by the first layer, next to the container
    fn first_layer_spill(&mut self) -> Result<Option<PathBuf>> {
        let root = self.tree.root();
        let Some(&layer) = self
            .tree
            .find_children(root, None, Some("Eimg_Layer"))?
            .first()
        else {
            return Ok(None);
        };
        let Some(ext) = self.tree.named_child(layer, "ExternalRasterDMS")? else {
            return Ok(None);
        };
        let name = self.tree.get_string(ext, "fileName.string")?;
        Ok(Some(self.directory().join(name)))
    }
}

fn replace_base(value: &str, new_base: &str, old_base: &str) -> Option<String> {
    value
        .strip_prefix(old_base)
        .map(|rest| format!("{}{}", new_base, rest))
}

fn rename_in_tree(tree: &mut EntryTree, new_base: &str, old_base: &str) -> Result<()> {
    let growth = new_base.len().saturating_sub(old_base.len());
    let root = tree.root();

    for list in tree.find_children(root, Some("RRDNamesList"), None)? {
        rename_overview_list(tree, list, new_base, old_base, growth)?;
    }
    for ext in tree.find_children(root, Some("ExternalRasterDMS"), None)? {
        rename_spill_reference(tree, ext, new_base, old_base, growth)?;
    }
    for dep in tree.find_children(root, Some("DependentFile"), None)? {
        let Ok(name) = tree.get_string(dep, "dependent.string") else { continue };
        let Some(renamed) = replace_base(&name, new_base, old_base) else { continue };
        let size = tree.data_size(dep) as usize + growth;
        reset_payload(tree, dep, size)?;
        tree.set_field(dep, "dependent.string", renamed.as_str())?;
    }
    Ok(())
}

fn rename_overview_list(
    tree: &mut EntryTree,
    list: EntryId,
    new_base: &str,
    old_base: &str,
    growth: usize,
) -> Result<()> {
    let count = tree.field_count(list, "nameList")?;
    let algorithm = tree.get_string(list, "algorithm.string")?;
    let names = (0..count)
        .map(|i| tree.get_string(list, &format!("nameList[{}].string", i)))
        .collect::<Result<Vec<_>>>()?;
    if !names.iter().any(|n| n.starts_with(old_base)) {
        return Ok(());
    }

    let size = tree.data_size(list) as usize + count * growth;
    reset_payload(tree, list, size)?;
    tree.set_field(list, "algorithm.string", algorithm.as_str())?;
    for (i, name) in names.iter().enumerate() {
        let renamed = replace_base(name, new_base, old_base).unwrap_or_else(|| name.clone());
        tree.set_field(list, &format!("nameList[{}].string", i), renamed)?;
    }
    Ok(())
}

fn rename_spill_reference(
    tree: &mut EntryTree,
    ext: EntryId,
    new_base: &str,
    old_base: &str,
    growth: usize,
) -> Result<()> {
    let name = tree.get_string(ext, "fileName.string")?;
    let Some(renamed) = replace_base(&name, new_base, old_base) else {
        return Ok(());
    };

    let mut words = Vec::with_capacity(6);
    for field in [
        "layerStackValidFlagsOffset[0]",
        "layerStackValidFlagsOffset[1]",
        "layerStackDataOffset[0]",
        "layerStackDataOffset[1]",
        "layerStackCount",
        "layerStackIndex",
    ] {
        words.push((field, tree.get_int(ext, field)?));
    }

    let size = tree.data_size(ext) as usize + growth;
    reset_payload(tree, ext, size)?;
    tree.set_field(ext, "fileName.string", renamed)?;
    for (field, value) in words {
        tree.set_field(ext, field, value)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CreateOptions;
    use crate::pack::PixelType;
    use tempfile::TempDir;

    #[test]
    fn test_create_dependent_records_primary() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("scene.img");
        let mut container =
            Container::create(&path, 64, 64, 1, PixelType::U8, &CreateOptions::default()).unwrap();
        container.create_dependent().unwrap();
        container.close().unwrap();

        let rrd = dir.path().join("scene.rrd");
        let mut dependent = Container::open(&rrd, Access::ReadOnly).unwrap();
        let root = dependent.tree.root();
        let node = dependent.tree.named_child(root, "DependentFile").unwrap().unwrap();
        assert_eq!(
            dependent.tree.get_string(node, "dependent.string").unwrap(),
            "scene.img"
        );
        assert_eq!(dependent.band_count(), 0);
    }

    #[test]
    fn test_dependent_lookup() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("scene.img");
        let mut container =
            Container::create(&path, 64, 64, 1, PixelType::U8, &CreateOptions::default()).unwrap();

        assert_eq!(
            container.resolve_dependent("SCENE.IMG").unwrap(),
            Some(BandSource::Primary)
        );
        assert_eq!(container.resolve_dependent("scene.rrd").unwrap(), None);

        container.create_dependent().unwrap();
        container.flush().unwrap();
        assert_eq!(
            container.resolve_dependent("scene.rrd").unwrap(),
            Some(BandSource::Dependent)
        );
        assert!(container.dependent("missing.rrd").unwrap().is_none());
    }

    #[test]
    fn test_spill_file_path_and_delete() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("big.img");
        let options = CreateOptions {
            use_spill: true,
            ..CreateOptions::default()
        };
        let mut container = Container::create(&path, 64, 64, 1, PixelType::U8, &options).unwrap();
        let spill = container.spill_file_path().unwrap().unwrap();
        assert_eq!(spill, dir.path().join("big.ige"));
        container.close().unwrap();

        Container::delete(&path).unwrap();
        assert!(!path.exists());
        assert!(!spill.exists());
    }

    #[test]
    fn test_rename_references() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("old.img");
        let options = CreateOptions {
            use_spill: true,
            ..CreateOptions::default()
        };
        let mut container = Container::create(&path, 64, 64, 1, PixelType::U8, &options).unwrap();
        container.rename_references("renamed", "old").unwrap();
        container.close().unwrap();

        let mut container = Container::open(&path, Access::ReadOnly).unwrap();
        let root = container.tree.root();
        let ext = container
            .tree
            .find_children(root, Some("ExternalRasterDMS"), None)
            .unwrap()[0];
        assert_eq!(
            container.tree.get_string(ext, "fileName.string").unwrap(),
            "renamed.ige"
        );
        assert_eq!(container.tree.get_int(ext, "layerStackCount").unwrap(), 1);
        assert_eq!(container.tree.get_int(ext, "layerStackIndex").unwrap(), 0);
    }

    #[test]
    fn test_replace_base() {
        assert_eq!(replace_base("a.rrd(:Layer_1:_ss_2_)", "b", "a").as_deref(), Some("b.rrd(:Layer_1:_ss_2_)"));
        assert_eq!(replace_base("c.ige", "b", "a"), None);
    }
}
