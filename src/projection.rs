//! Georeferencing records attached to a band
//!
//! `Map_Info` (`Eprj_MapInfo`) places the raster in map space,
//! `Projection` (`Eprj_ProParameters`) describes the projection and its
//! spheroid, and `Projection.Datum` (`Eprj_Datum`) the datum. An ESRI PE
//! string may also ride along in `ProjectionX` (`Eprj_MapProjection842`).
//! Writers rebuild the payload from zeros every time.

use crate::entry::{EntryId, EntryTree};
use crate::error::{HfaError, Result};

/// Number of projection parameters stored with every projection
pub const PROJECTION_PARAMS: usize = 15;

/// Number of datum parameters
pub const DATUM_PARAMS: usize = 7;

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Coordinate {
    pub x: f64,
    pub y: f64,
}

/// Placement of the raster in map space
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MapInfo {
    pub projection: String,
    /// Center of the upper-left pixel
    pub upper_left: Coordinate,
    /// Center of the lower-right pixel
    pub lower_right: Coordinate,
    pub pixel_width: f64,
    pub pixel_height: f64,
    pub units: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProjectionKind {
    #[default]
    Internal,
    External,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Spheroid {
    pub name: String,
    pub a: f64,
    pub b: f64,
    pub e_squared: f64,
    pub radius: f64,
}

/// Projection definition
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProParameters {
    pub kind: ProjectionKind,
    pub number: i64,
    /// Executable implementing an external projection
    pub exe_name: Option<String>,
    pub name: String,
    pub zone: i64,
    pub params: [f64; PROJECTION_PARAMS],
    pub spheroid: Spheroid,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DatumKind {
    Parametric,
    Grid,
    Regression,
    #[default]
    None,
}

impl DatumKind {
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => DatumKind::Parametric,
            1 => DatumKind::Grid,
            2 => DatumKind::Regression,
            _ => DatumKind::None,
        }
    }

    pub fn code(&self) -> i64 {
        match self {
            DatumKind::Parametric => 0,
            DatumKind::Grid => 1,
            DatumKind::Regression => 2,
            DatumKind::None => 3,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Datum {
    pub name: String,
    pub kind: DatumKind,
    pub params: [f64; DATUM_PARAMS],
    pub grid_name: Option<String>,
}

fn map_info_node(tree: &mut EntryTree, band: EntryId) -> Result<Option<EntryId>> {
    if let Some(node) = tree.named_child(band, "Map_Info")? {
        return Ok(Some(node));
    }
    // Some writers use another name for the record
    Ok(tree
        .children(band)?
        .into_iter()
        .find(|&child| tree.type_name(child).eq_ignore_ascii_case("Eprj_MapInfo")))
}

/// Read a band's MapInfo, if it has one
pub fn read_map_info(tree: &mut EntryTree, band: EntryId) -> Result<Option<MapInfo>> {
    let Some(node) = map_info_node(tree, band)? else {
        return Ok(None);
    };

    let (pixel_width, pixel_height) = match (
        tree.get_double(node, "pixelSize.width"),
        tree.get_double(node, "pixelSize.height"),
    ) {
        (Ok(w), Ok(h)) => (w, h),
        _ => (
            tree.get_double(node, "pixelSize.x")?,
            tree.get_double(node, "pixelSize.y")?,
        ),
    };

    Ok(Some(MapInfo {
        projection: tree.get_string(node, "proName")?,
        upper_left: Coordinate {
            x: tree.get_double(node, "upperLeftCenter.x")?,
            y: tree.get_double(node, "upperLeftCenter.y")?,
        },
        lower_right: Coordinate {
            x: tree.get_double(node, "lowerRightCenter.x")?,
            y: tree.get_double(node, "lowerRightCenter.y")?,
        },
        pixel_width,
        pixel_height,
        units: tree.get_string(node, "units")?,
    }))
}

/// Store a MapInfo on a band, creating the `Map_Info` entry if needed
pub fn write_map_info(tree: &mut EntryTree, band: EntryId, info: &MapInfo) -> Result<()> {
    let node = child_or_new(tree, band, "Map_Info", "Eprj_MapInfo")?;
    let size = 48 + 40 + info.projection.len() + 1 + info.units.len() + 1;
    reset_payload(tree, node, size)?;

    tree.set_field(node, "proName", info.projection.as_str())?;
    tree.set_field(node, "upperLeftCenter.x", info.upper_left.x)?;
    tree.set_field(node, "upperLeftCenter.y", info.upper_left.y)?;
    tree.set_field(node, "lowerRightCenter.x", info.lower_right.x)?;
    tree.set_field(node, "lowerRightCenter.y", info.lower_right.y)?;
    tree.set_field(node, "pixelSize.width", info.pixel_width)?;
    tree.set_field(node, "pixelSize.height", info.pixel_height)?;
    tree.set_field(node, "units", info.units.as_str())?;
    Ok(())
}

/// Projection name and units from a band's `MapInformation` entry
pub fn read_map_information(tree: &mut EntryTree, band: EntryId) -> Result<Option<(String, String)>> {
    let Some(node) = tree.named_child(band, "MapInformation")? else {
        return Ok(None);
    };
    Ok(Some((
        tree.get_string(node, "projection.string")?,
        tree.get_string(node, "units.string")?,
    )))
}

pub fn write_map_information(tree: &mut EntryTree, band: EntryId, projection: &str, units: &str) -> Result<()> {
    let node = child_or_new(tree, band, "MapInformation", "Eimg_MapInformation")?;
    reset_payload(tree, node, 18 + projection.len() + units.len())?;
    tree.set_field(node, "projection.string", projection)?;
    tree.set_field(node, "units.string", units)?;
    Ok(())
}

/// Read a band's projection parameters, if present
pub fn read_pro_parameters(tree: &mut EntryTree, band: EntryId) -> Result<Option<ProParameters>> {
    let Some(node) = tree.named_child(band, "Projection")? else {
        return Ok(None);
    };

    let kind = match tree.get_int(node, "proType")? {
        1 => ProjectionKind::External,
        _ => ProjectionKind::Internal,
    };
    let exe_name = tree.get_string(node, "proExeName")?;
    let stored = tree.field_count(node, "proParams")?;
    let mut params = [0.0; PROJECTION_PARAMS];
    for (i, param) in params.iter_mut().enumerate().take(stored) {
        *param = tree.get_double(node, &format!("proParams[{}]", i))?;
    }

    Ok(Some(ProParameters {
        kind,
        number: tree.get_int(node, "proNumber")?,
        exe_name: (!exe_name.is_empty()).then_some(exe_name),
        name: tree.get_string(node, "proName")?,
        zone: tree.get_int(node, "proZone")?,
        params,
        spheroid: Spheroid {
            name: tree.get_string(node, "proSpheroid.sphereName")?,
            a: tree.get_double(node, "proSpheroid.a")?,
            b: tree.get_double(node, "proSpheroid.b")?,
            e_squared: tree.get_double(node, "proSpheroid.eSquared")?,
            radius: tree.get_double(node, "proSpheroid.radius")?,
        },
    }))
}

pub fn write_pro_parameters(tree: &mut EntryTree, band: EntryId, pro: &ProParameters) -> Result<()> {
    let node = child_or_new(tree, band, "Projection", "Eprj_ProParameters")?;
    let mut size = 34 + PROJECTION_PARAMS * 8 + 8 + pro.name.len() + 1 + 32 + 8 + pro.spheroid.name.len() + 1;
    if let Some(exe) = &pro.exe_name {
        size += exe.len() + 1;
    }
    reset_payload(tree, node, size)?;

    let kind = match pro.kind {
        ProjectionKind::Internal => 0,
        ProjectionKind::External => 1,
    };
    tree.set_field(node, "proType", kind)?;
    tree.set_field(node, "proNumber", pro.number)?;
    tree.set_field(node, "proExeName", pro.exe_name.as_deref().unwrap_or(""))?;
    tree.set_field(node, "proName", pro.name.as_str())?;
    tree.set_field(node, "proZone", pro.zone)?;
    for (i, param) in pro.params.iter().enumerate() {
        tree.set_field(node, &format!("proParams[{}]", i), *param)?;
    }
    tree.set_field(node, "proSpheroid.sphereName", pro.spheroid.name.as_str())?;
    tree.set_field(node, "proSpheroid.a", pro.spheroid.a)?;
    tree.set_field(node, "proSpheroid.b", pro.spheroid.b)?;
    tree.set_field(node, "proSpheroid.eSquared", pro.spheroid.e_squared)?;
    tree.set_field(node, "proSpheroid.radius", pro.spheroid.radius)?;
    Ok(())
}

/// Read the datum stored under a band's projection
pub fn read_datum(tree: &mut EntryTree, band: EntryId) -> Result<Option<Datum>> {
    let Some(node) = tree.named_child(band, "Projection.Datum")? else {
        return Ok(None);
    };

    let code = tree.get_int(node, "type")?;
    let kind = DatumKind::from_code(code);
    if kind == DatumKind::None && code != DatumKind::None.code() {
        tracing::debug!("Invalid datum type {}", code);
    }
    let stored = tree.field_count(node, "params")?;
    let mut params = [0.0; DATUM_PARAMS];
    for (i, param) in params.iter_mut().enumerate().take(stored) {
        *param = tree.get_double(node, &format!("params[{}]", i))?;
    }
    let grid_name = tree.get_string(node, "gridname")?;

    Ok(Some(Datum {
        name: tree.get_string(node, "datumname")?,
        kind,
        params,
        grid_name: (!grid_name.is_empty()).then_some(grid_name),
    }))
}

/// Store a datum; the band must already carry projection parameters
pub fn write_datum(tree: &mut EntryTree, band: EntryId, datum: &Datum) -> Result<()> {
    let projection = tree.named_child(band, "Projection")?.ok_or_else(|| {
        HfaError::InvalidArgument("a datum requires projection parameters".to_string())
    })?;
    let node = child_or_new(tree, projection, "Datum", "Eprj_Datum")?;
    let mut size = 26 + datum.name.len() + 1 + DATUM_PARAMS * 8;
    if let Some(grid) = &datum.grid_name {
        size += grid.len() + 1;
    }
    reset_payload(tree, node, size)?;

    tree.set_field(node, "datumname", datum.name.as_str())?;
    tree.set_field(node, "type", datum.kind.code())?;
    for (i, param) in datum.params.iter().enumerate() {
        tree.set_field(node, &format!("params[{}]", i), *param)?;
    }
    tree.set_field(node, "gridname", datum.grid_name.as_deref().unwrap_or(""))?;
    Ok(())
}

const PE_NODE: &str = "ProjectionX";
const PE_COORDSYS: &str = "PE_COORDSYS";
const PE_MARKER: &[u8] = b"PE_COORDSYS,.";
const PE_DICTIONARY: &str =
    "{0:pcstring,}Emif_String,{1:x{0:pcstring,}Emif_String,coordSys,}PE_COORDSYS,.";
/// Marker and its NUL, then the object and string pointers
const PE_TEXT_SKIP: usize = PE_MARKER.len() + 1 + 16;

/// ESRI PE coordinate system string from a band's `ProjectionX` entry
///
/// The string lives in a MIF object whose layout is described by the
/// dictionary embedded just before it, so it is found by scanning for the
/// end of that dictionary.
pub fn read_pe_string(tree: &mut EntryTree, band: EntryId) -> Result<Option<String>> {
    let Some(node) = tree.named_child(band, PE_NODE)? else {
        return Ok(None);
    };
    match tree.get_string(node, "projection.type.string") {
        Ok(kind) if kind.eq_ignore_ascii_case(PE_COORDSYS) => {}
        _ => return Ok(None),
    }

    let data = tree.data(node)?;
    let Some(start) = data
        .windows(PE_MARKER.len())
        .position(|w| w.eq_ignore_ascii_case(PE_MARKER))
    else {
        return Ok(None);
    };
    let Some(text) = data.get(start + PE_TEXT_SKIP..).filter(|t| !t.is_empty()) else {
        return Ok(None);
    };
    let end = text.iter().position(|&b| b == 0).unwrap_or(text.len());
    Ok(Some(String::from_utf8_lossy(&text[..end]).into_owned()))
}

/// Store an ESRI PE coordinate system string as `ProjectionX`
///
/// An empty string leaves a band without the entry untouched.
pub fn write_pe_string(tree: &mut EntryTree, band: EntryId, pe: &str) -> Result<()> {
    let node = match tree.named_child(band, PE_NODE)? {
        Some(node) => node,
        None if pe.is_empty() => return Ok(()),
        None => tree.new_child(band, PE_NODE, "Eprj_MapProjection842")?,
    };
    let size = pe_payload(0, pe)?.len();
    reset_payload(tree, node, size)?;
    let payload = pe_payload(tree.data_pos(node), pe)?;
    tree.data_mut(node)?[..size].copy_from_slice(&payload);
    Ok(())
}

/// `Eprj_MapProjection842` payload placed at file offset `base`
fn pe_payload(base: u32, pe: &str) -> Result<Vec<u8>> {
    let text_len = u32::try_from(pe.len() + 1).map_err(|_| HfaError::Overflow("PE string".to_string()))?;
    // The object holds one Emif_String whose offset is relative to the object
    let mut object = Vec::with_capacity(pe.len() + 9);
    object.extend_from_slice(&text_len.to_le_bytes());
    object.extend_from_slice(&8u32.to_le_bytes());
    object.extend_from_slice(pe.as_bytes());
    object.push(0);

    let mut payload = Vec::new();
    push_pointer(&mut payload, base, &nul_terminated(PE_COORDSYS))?;
    push_pointer(&mut payload, base, &nul_terminated(PE_DICTIONARY))?;
    push_pointer(&mut payload, base, &object)?;
    push_pointer(&mut payload, base, &nul_terminated("PE"))?;
    Ok(payload)
}

fn nul_terminated(text: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(text.len() + 1);
    bytes.extend_from_slice(text.as_bytes());
    bytes.push(0);
    bytes
}

/// Append a variable field: item count, absolute offset of the items, items
fn push_pointer(payload: &mut Vec<u8>, base: u32, items: &[u8]) -> Result<()> {
    let overflow = || HfaError::Overflow("PE string".to_string());
    let count = u32::try_from(items.len()).map_err(|_| overflow())?;
    let offset = u32::try_from(payload.len() + 8)
        .ok()
        .and_then(|o| base.checked_add(o))
        .ok_or_else(overflow)?;
    payload.extend_from_slice(&count.to_le_bytes());
    payload.extend_from_slice(&offset.to_le_bytes());
    payload.extend_from_slice(items);
    Ok(())
}

pub(crate) fn child_or_new(tree: &mut EntryTree, parent: EntryId, name: &str, type_name: &str) -> Result<EntryId> {
    match tree.named_child(parent, name)? {
        Some(node) => Ok(node),
        None => tree.new_child(parent, name, type_name),
    }
}

/// Size the payload, give it a place and clear it
pub(crate) fn reset_payload(tree: &mut EntryTree, node: EntryId, size: usize) -> Result<()> {
    tree.make_data(node, size)?;
    tree.set_position(node)?;
    tree.data_mut(node)?.fill(0);
    Ok(())
}
