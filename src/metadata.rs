//! Descriptor tables: free-form metadata, color tables and statistics
//!
//! Both metadata and color tables are `Edsc_Table` entries whose
//! `Edsc_Column` children point at column data stored elsewhere in the
//! file. Metadata lives in a one-row `GDAL_MetaData` table, one string
//! column per key. A color table is the `Descriptor_Table` of a band with
//! `Red`, `Green`, `Blue` and `Opacity` real columns.

use crate::entry::{EntryId, EntryTree};
use crate::error::{HfaError, Result};
use crate::pack;

pub const METADATA_TABLE: &str = "GDAL_MetaData";
pub const DESCRIPTOR_TABLE: &str = "Descriptor_Table";
const BIN_FUNCTION: &str = "#Bin_Function#";
const COLOR_COLUMNS: [&str; 4] = ["Red", "Green", "Blue", "Opacity"];

/// Largest color table accepted on read
pub const MAX_COLORS: usize = 65536;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerType {
    Thematic,
    Athematic,
    Fft,
}

impl LayerType {
    pub fn label(&self) -> &'static str {
        match self {
            LayerType::Thematic => "thematic",
            LayerType::Athematic => "athematic",
            LayerType::Fft => "fft of real-valued data",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        [LayerType::Thematic, LayerType::Athematic, LayerType::Fft]
            .into_iter()
            .find(|t| t.label().eq_ignore_ascii_case(label))
    }
}

pub fn layer_type(tree: &mut EntryTree, band: EntryId) -> Result<Option<LayerType>> {
    let label = tree.get_string(band, "layerType")?;
    Ok(LayerType::from_label(&label))
}

pub fn set_layer_type(tree: &mut EntryTree, band: EntryId, layer_type: LayerType) -> Result<()> {
    tree.set_field(band, "layerType", layer_type.label())
}

/// Color components in the 0..=1 range, one entry per pixel value
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColorTable {
    pub red: Vec<f64>,
    pub green: Vec<f64>,
    pub blue: Vec<f64>,
    pub alpha: Vec<f64>,
}

impl ColorTable {
    pub fn len(&self) -> usize {
        self.red.len()
    }

    pub fn is_empty(&self) -> bool {
        self.red.is_empty()
    }

    fn columns(&self) -> [&[f64]; 4] {
        [&self.red, &self.green, &self.blue, &self.alpha]
    }
}

/// Read a band's color table, if it has one
///
/// A missing component column reads as all ones.
pub fn color_table(tree: &mut EntryTree, band: EntryId) -> Result<Option<ColorTable>> {
    let Some(red) = tree.named_child(band, "Descriptor_Table.Red")? else {
        return Ok(None);
    };
    let rows = tree.get_int(red, "numRows")?;
    let colors = match usize::try_from(rows) {
        Ok(n) if n <= MAX_COLORS => n,
        _ => return Err(HfaError::Corrupt(format!("invalid number of colors: {}", rows))),
    };
    if colors == 0 {
        return Ok(None);
    }

    let mut components: [Vec<f64>; 4] = Default::default();
    for (name, values) in COLOR_COLUMNS.iter().zip(components.iter_mut()) {
        let path = format!("{}.{}", DESCRIPTOR_TABLE, name);
        *values = match tree.named_child(band, &path)? {
            Some(column) => read_real_column(tree, column, colors)?,
            None => vec![1.0; colors],
        };
    }
    let [red, green, blue, alpha] = components;
    Ok(Some(ColorTable { red, green, blue, alpha }))
}

fn read_real_column(tree: &mut EntryTree, column: EntryId, rows: usize) -> Result<Vec<f64>> {
    let ptr = tree.get_int(column, "columnDataPtr")?;
    let ptr = u64::try_from(ptr)
        .map_err(|_| HfaError::Corrupt(format!("column data pointer {}", ptr)))?;
    let bytes = tree.file_mut().read_vec(ptr, rows * 8)?;
    (0..rows)
        .map(|i| {
            pack::get_f64(&bytes, i * 8)
                .ok_or_else(|| HfaError::Corrupt("short color column".to_string()))
        })
        .collect()
}

/// Store a color table, or remove the color columns when `table` is empty
///
/// Storing a table marks the layer thematic.
pub fn set_color_table(tree: &mut EntryTree, band: EntryId, table: &ColorTable) -> Result<()> {
    if table.is_empty() {
        if let Some(descriptor) = tree.named_child(band, DESCRIPTOR_TABLE)? {
            for name in COLOR_COLUMNS {
                if let Some(column) = tree.named_child(descriptor, name)? {
                    tree.remove(column)?;
                }
            }
        }
        return Ok(());
    }

    let colors = table.len();
    if table.columns().iter().any(|c| c.len() != colors) {
        return Err(HfaError::InvalidArgument(
            "color table components differ in length".to_string(),
        ));
    }

    let descriptor = typed_child(tree, band, DESCRIPTOR_TABLE, "Edsc_Table")?;
    tree.set_field(descriptor, "numrows", colors)?;
    write_bin_function(tree, descriptor, colors, colors as f64 - 1.0)?;

    for (name, values) in COLOR_COLUMNS.iter().zip(table.columns()) {
        let column = typed_child(tree, descriptor, name, "Edsc_Column")?;
        tree.set_field(column, "numRows", colors)?;
        tree.set_field(column, "dataType", "real")?;
        tree.set_field(column, "maxNumChars", 0)?;

        let mut bytes = vec![0u8; colors * 8];
        for (i, value) in values.iter().enumerate() {
            pack::put_f64(&mut bytes, i * 8, *value)
                .ok_or_else(|| HfaError::Overflow("color column".to_string()))?;
        }
        let ptr = tree.allocator_mut().allocate_len(bytes.len())?;
        tree.set_field(column, "columnDataPtr", ptr)?;
        tree.file_mut().write_at(ptr.into(), &bytes)?;
    }

    set_layer_type(tree, band, LayerType::Thematic)
}

/// Minimum and maximum from a band's statistics, when they form a range
pub fn data_range(tree: &mut EntryTree, band: EntryId) -> Result<Option<(f64, f64)>> {
    let Some(stats) = tree.named_child(band, "Statistics")? else {
        return Ok(None);
    };
    let min = tree.get_double(stats, "minimum")?;
    let max = tree.get_double(stats, "maximum")?;
    Ok((max > min).then_some((min, max)))
}

/// Key/value metadata stored under `node`, in column order
pub fn read_metadata(tree: &mut EntryTree, node: EntryId) -> Result<Vec<(String, String)>> {
    let table = tree
        .children(node)?
        .into_iter()
        .find(|&child| tree.name(child).eq_ignore_ascii_case(METADATA_TABLE));
    let Some(table) = table else {
        return Ok(Vec::new());
    };
    if !tree.type_name(table).eq_ignore_ascii_case("Edsc_Table") {
        return Ok(Vec::new());
    }
    let rows = tree.get_int(table, "numrows")?;
    if rows != 1 {
        tracing::debug!("{}.numrows = {}, expected 1", METADATA_TABLE, rows);
        return Ok(Vec::new());
    }

    let mut items = Vec::new();
    for column in tree.children(table)? {
        let key = tree.name(column).to_string();
        if key.starts_with('#') {
            continue;
        }
        if !tree.get_string(column, "dataType")?.eq_ignore_ascii_case("string") {
            continue;
        }
        let ptr = tree.get_int(column, "columnDataPtr")?;
        if ptr <= 0 {
            continue;
        }
        let max_chars = tree.get_int(column, "maxNumChars")?;
        if max_chars <= 0 {
            items.push((key, String::new()));
            continue;
        }

        let bytes = tree.file_mut().read_up_to(ptr as u64, max_chars as usize)?;
        if bytes.is_empty() {
            continue;
        }
        let limit = bytes.len().min(max_chars as usize - 1);
        let end = bytes[..limit].iter().position(|&b| b == 0).unwrap_or(limit);
        items.push((key, String::from_utf8_lossy(&bytes[..end]).into_owned()));
    }
    Ok(items)
}

/// Store key/value metadata under `node`, one column per key
///
/// Existing columns with the same key are reused; their old text stays
/// where it was and new text is written at the end of the file.
pub fn write_metadata(tree: &mut EntryTree, node: EntryId, items: &[(String, String)]) -> Result<()> {
    if items.is_empty() {
        return Ok(());
    }
    let table = typed_child(tree, node, METADATA_TABLE, "Edsc_Table")?;
    tree.set_field(table, "numrows", 1)?;
    write_bin_function(tree, table, 1, 0.0)?;

    for (key, value) in items {
        let column = typed_child(tree, table, key, "Edsc_Column")?;
        let mut text = value.clone().into_bytes();
        text.push(0);
        tree.set_field(column, "numRows", 1)?;
        tree.set_field(column, "dataType", "string")?;
        tree.set_field(column, "maxNumChars", text.len())?;

        let ptr = tree.allocator_mut().allocate_len(text.len())?;
        tree.set_field(column, "columnDataPtr", ptr)?;
        tree.file_mut().write_at(ptr.into(), &text)?;
    }
    Ok(())
}

/// Child `name` of `parent` if it has `type_name`, otherwise a new one
fn typed_child(tree: &mut EntryTree, parent: EntryId, name: &str, type_name: &str) -> Result<EntryId> {
    match tree.named_child(parent, name)? {
        Some(node) if tree.type_name(node).eq_ignore_ascii_case(type_name) => Ok(node),
        _ => tree.new_child(parent, name, type_name),
    }
}

fn write_bin_function(tree: &mut EntryTree, table: EntryId, bins: usize, max_limit: f64) -> Result<()> {
    let bin = typed_child(tree, table, BIN_FUNCTION, "Edsc_BinFunction")?;
    // Fixed fields plus an empty basedata header
    tree.make_data(bin, 30)?;
    tree.set_field(bin, "numBins", bins)?;
    tree.set_field(bin, "binFunctionType", "direct")?;
    tree.set_field(bin, "minLimit", 0.0)?;
    tree.set_field(bin, "maxLimit", max_limit)?;
    Ok(())
}
