//! Type dictionary
//!
//! A container describes the layout of every entry payload with a small
//! textual schema language embedded in the file. Each definition looks like
//!
//! ```text
//! {1:lwidth,1:lheight,1:e2:raster,vector,type,0:pcname,}TypeName,
//! ```
//!
//! and the whole dictionary is a run of such definitions ended by a lone
//! `.`. A field spec is `count:` followed by an optional `p`/`*` marking a
//! variable-length array (stored as a count/offset pair in the payload),
//! a one-character item code, then a kind-specific tail and the field name.
//!
//! Built-in definitions for the types this crate writes are merged into
//! every dictionary at construction, so no global table is mutated at run
//! time.

use crate::error::{HfaError, Result};
use std::collections::{HashMap, HashSet};

/// Complete dictionary written into new containers
pub const DEFAULT_DICTIONARY: &str = concat!(
    "{1:lversion,1:LfreeList,1:LrootEntryPtr,1:sentryHeaderLength,1:LdictionaryPtr,}Ehfa_File,",
    "{1:Lnext,1:Lprev,1:Lparent,1:Lchild,1:Ldata,1:ldataSize,64:cname,32:ctype,1:tmodTime,}Ehfa_Entry,",
    "{16:clabel,1:LheaderPtr,}Ehfa_HeaderTag,",
    "{1:LfreeList,1:lfreeSize,}Ehfa_FreeListNode,",
    "{1:lsize,1:Lptr,}Ehfa_Data,",
    "{1:lwidth,1:lheight,1:e3:thematic,athematic,fft of real-valued data,layerType,",
    "1:e13:u1,u2,u4,u8,s8,u16,s16,u32,s32,f32,f64,c64,c128,pixelType,1:lblockWidth,1:lblockHeight,}Eimg_Layer,",
    "{1:lwidth,1:lheight,1:e3:thematic,athematic,fft of real-valued data,layerType,",
    "1:e13:u1,u2,u4,u8,s8,u16,s16,u32,s32,f32,f64,c64,c128,pixelType,1:lblockWidth,1:lblockHeight,}Eimg_Layer_SubSample,",
    "{1:e2:raster,vector,type,1:LdictionaryPtr,}Ehfa_Layer,",
    "{1:LspaceUsedForRasterData,}ImgFormatInfo831,",
    "{1:sfileCode,1:Loffset,1:lsize,1:e2:false,true,logvalid,",
    "1:e2:no compression,ESRI GRID compression,compressionType,}Edms_VirtualBlockInfo,",
    "{1:lmin,1:lmax,}Edms_FreeIDList,",
    "{1:lnumvirtualblocks,1:lnumobjectsperblock,1:lnextobjectnum,1:e2:no compression,RLC compression,compressionType,",
    "0:poEdms_VirtualBlockInfo,blockinfo,0:poEdms_FreeIDList,freelist,1:tmodTime,}Edms_State,",
    "{0:pcstring,}Emif_String,",
    "{1:oEmif_String,fileName,2:LlayerStackValidFlagsOffset,2:LlayerStackDataOffset,",
    "1:LlayerStackCount,1:LlayerStackIndex,}ImgExternalRaster,",
    "{1:oEmif_String,algorithm,0:poEmif_String,nameList,}Eimg_RRDNamesList,",
    "{1:oEmif_String,projection,1:oEmif_String,units,}Eimg_MapInformation,",
    "{1:oEmif_String,dependent,}Eimg_DependentFile,",
    "{1:oEmif_String,ImageLayerName,}Eimg_DependentLayerName,",
    "{1:lnumrows,1:lnumcolumns,1:e13:EGDA_TYPE_U1,EGDA_TYPE_U2,EGDA_TYPE_U4,EGDA_TYPE_U8,EGDA_TYPE_S8,",
    "EGDA_TYPE_U16,EGDA_TYPE_S16,EGDA_TYPE_U32,EGDA_TYPE_S32,EGDA_TYPE_F32,EGDA_TYPE_F64,EGDA_TYPE_C64,",
    "EGDA_TYPE_C128,datatype,1:e4:EGDA_SCALAR_OBJECT,EGDA_TABLE_OBJECT,EGDA_MATRIX_OBJECT,EGDA_RASTER_OBJECT,",
    "objecttype,}Egda_BaseData,",
    "{1:*bvalueBD,}Eimg_NonInitializedValue,",
    "{1:dx,1:dy,}Eprj_Coordinate,",
    "{1:dwidth,1:dheight,}Eprj_Size,",
    "{0:pcproName,1:*oEprj_Coordinate,upperLeftCenter,1:*oEprj_Coordinate,lowerRightCenter,",
    "1:*oEprj_Size,pixelSize,0:pcunits,}Eprj_MapInfo,",
    "{0:pcdatumname,1:e3:EPRJ_DATUM_PARAMETRIC,EPRJ_DATUM_GRID,EPRJ_DATUM_REGRESSION,type,0:pdparams,",
    "0:pcgridname,}Eprj_Datum,",
    "{0:pcsphereName,1:da,1:db,1:deSquared,1:dradius,}Eprj_Spheroid,",
    "{1:e2:EPRJ_INTERNAL,EPRJ_EXTERNAL,proType,1:lproNumber,0:pcproExeName,0:pcproName,1:lproZone,",
    "0:pdproParams,1:*oEprj_Spheroid,proSpheroid,}Eprj_ProParameters,",
    "{1:dminimum,1:dmaximum,1:dmean,1:dmedian,1:dmode,1:dstddev,}Esta_Statistics,",
    "{1:lnumBins,1:e4:direct,linear,logarithmic,explicit,binFunctionType,1:dminLimit,1:dmaxLimit,",
    "1:*bbinLimits,}Edsc_BinFunction,",
    "{0:poEmif_String,LayerNames,1:*bExcludedValues,1:oEmif_String,AOIname,",
    "1:lSkipFactorX,1:lSkipFactorY,1:*oEdsc_BinFunction,BinFunction,}Eimg_StatisticsParameters830,",
    "{1:lnumrows,}Edsc_Table,",
    "{1:lnumRows,1:LcolumnDataPtr,1:e4:integer,real,complex,string,dataType,1:lmaxNumChars,}Edsc_Column,",
    "{1:lposition,0:pcname,1:e2:EMSC_FALSE,EMSC_TRUE,editable,1:e3:LEFT,CENTER,RIGHT,alignment,",
    "0:pcformat,1:e3:DEFAULT,APPLY,AUTO-APPLY,formulamode,0:pcformula,1:dcolumnwidth,0:pcunits,",
    "1:e5:NO_COLOR,RED,GREEN,BLUE,COLOR,colorflag,0:pcgreenname,0:pcbluename,}Eded_ColumnAttributes_1,",
    "{1:lversion,1:lnumobjects,1:e2:EAOI_UNION,EAOI_INTERSECTION,operation,}Eaoi_AreaOfInterest,",
    "{1:x{0:pcstring,}Emif_String,type,1:x{0:pcstring,}Emif_String,MIFDictionary,0:pCMIFObject,}Emif_MIFObject,",
    "{1:x{1:x{0:pcstring,}Emif_String,type,1:x{0:pcstring,}Emif_String,MIFDictionary,0:pCMIFObject,}",
    "Emif_MIFObject,projection,1:x{0:pcstring,}Emif_String,title,}Eprj_MapProjection842,",
    "{0:poEmif_String,titleList,}Exfr_GenericXFormHeader,",
    "{1:lorder,1:lnumdimtransform,1:lnumdimpolynomial,1:ltermcount,0:plexponentlist,",
    "1:*bpolycoefmtx,1:*bpolycoefvector,}Efga_Polynomial,",
    "."
);

/// Index of a type inside its dictionary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(usize);

/// Item kind of a field
#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    U1,
    U2,
    U4,
    U8,
    S8,
    U16,
    S16,
    U32,
    S32,
    F32,
    F64,
    C64,
    C128,
    /// 32-bit timestamp
    Time,
    /// Self-describing matrix: rows, columns and item type precede the values
    BaseData,
    /// 16-bit index into an ordered list of labels
    Enum(Vec<String>),
    /// Nested record of the named type
    Object(String),
}

impl FieldKind {
    /// Parse a scalar or basedata item code
    pub fn from_code(code: char) -> Option<Self> {
        let kind = match code {
            '1' => FieldKind::U1,
            '2' => FieldKind::U2,
            '4' => FieldKind::U4,
            'c' => FieldKind::U8,
            'C' => FieldKind::S8,
            's' => FieldKind::U16,
            'S' => FieldKind::S16,
            'l' => FieldKind::S32,
            'L' => FieldKind::U32,
            'f' => FieldKind::F32,
            'd' => FieldKind::F64,
            'm' => FieldKind::C64,
            'M' => FieldKind::C128,
            't' => FieldKind::Time,
            'b' => FieldKind::BaseData,
            _ => return None,
        };
        Some(kind)
    }

    pub fn code(&self) -> char {
        match self {
            FieldKind::U1 => '1',
            FieldKind::U2 => '2',
            FieldKind::U4 => '4',
            FieldKind::U8 => 'c',
            FieldKind::S8 => 'C',
            FieldKind::U16 => 's',
            FieldKind::S16 => 'S',
            FieldKind::S32 => 'l',
            FieldKind::U32 => 'L',
            FieldKind::F32 => 'f',
            FieldKind::F64 => 'd',
            FieldKind::C64 => 'm',
            FieldKind::C128 => 'M',
            FieldKind::Time => 't',
            FieldKind::BaseData => 'b',
            FieldKind::Enum(_) => 'e',
            FieldKind::Object(_) => 'o',
        }
    }

    /// Bytes per item, or `None` for kinds whose size depends on the payload
    pub fn item_size(&self) -> Option<usize> {
        match self {
            FieldKind::U1 | FieldKind::U2 | FieldKind::U4 | FieldKind::U8 | FieldKind::S8 => Some(1),
            FieldKind::Enum(_) | FieldKind::U16 | FieldKind::S16 => Some(2),
            FieldKind::Time | FieldKind::S32 | FieldKind::U32 | FieldKind::F32 => Some(4),
            FieldKind::F64 | FieldKind::C64 => Some(8),
            FieldKind::C128 => Some(16),
            FieldKind::BaseData | FieldKind::Object(_) => None,
        }
    }

    pub fn is_text(&self) -> bool {
        matches!(self, FieldKind::U8 | FieldKind::S8)
    }
}

/// How a variable-length field refers to its items
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Indirection {
    /// `p`: array of any length
    Pointer,
    /// `*`: optional single item
    Reference,
}

/// One field of a composite type
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub name: String,
    /// Declared item count; ignored for variable fields
    pub count: u32,
    pub indirect: Option<Indirection>,
    pub kind: FieldKind,
    inline: Option<Box<CompositeType>>,
    object_type: Option<TypeId>,
}

impl FieldSpec {
    /// Variable fields start with a count/offset pair in the payload
    pub fn is_variable(&self) -> bool {
        self.indirect.is_some()
    }

    /// Resolved type of an object field
    pub fn object_type(&self) -> Option<TypeId> {
        self.object_type
    }

    fn parse(input: &str) -> Result<(Self, &str)> {
        let (count_text, rest) = take_until(input, ':')?;
        let count: u32 = count_text.trim().parse().map_err(|_| {
            HfaError::MalformedType(format!("bad item count `{}`", count_text.trim()))
        })?;

        let (mut code, mut rest) = next_char(rest)?;
        let indirect = match code {
            'p' => Some(Indirection::Pointer),
            '*' => Some(Indirection::Reference),
            _ => None,
        };
        if indirect.is_some() {
            (code, rest) = next_char(rest)?;
        }

        let mut inline = None;
        let kind = match code {
            'o' => {
                let (name, r) = take_until(rest, ',')?;
                rest = r;
                FieldKind::Object(name.to_string())
            }
            'x' => {
                if rest.starts_with('{') {
                    let (ty, r) = CompositeType::parse(rest)?;
                    rest = r;
                    let name = ty.name.clone();
                    inline = Some(Box::new(ty));
                    FieldKind::Object(name)
                } else {
                    let (name, r) = take_until(rest, ',')?;
                    rest = r;
                    FieldKind::Object(name.to_string())
                }
            }
            'e' => {
                let (n_text, r) = take_until(rest, ':')?;
                let n: usize = n_text.trim().parse().map_err(|_| {
                    HfaError::MalformedType(format!("bad enumeration count `{}`", n_text))
                })?;
                rest = r;
                let mut labels = Vec::with_capacity(n.min(256));
                for _ in 0..n {
                    let (label, r) = take_until(rest, ',')?;
                    labels.push(label.to_string());
                    rest = r;
                }
                FieldKind::Enum(labels)
            }
            other => FieldKind::from_code(other).ok_or_else(|| {
                HfaError::MalformedType(format!("unknown item type code `{}`", other))
            })?,
        };

        let (name, rest) = take_until(rest, ',')?;
        if name.is_empty() {
            return Err(HfaError::MalformedType("field without a name".to_string()));
        }

        Ok((
            FieldSpec {
                name: name.to_string(),
                count,
                indirect,
                kind,
                inline,
                object_type: None,
            },
            rest,
        ))
    }
}

/// Named record layout
#[derive(Debug, Clone, PartialEq)]
pub struct CompositeType {
    pub name: String,
    pub fields: Vec<FieldSpec>,
    fixed_size: Option<usize>,
}

impl CompositeType {
    /// Parse one `{...}Name,` definition, returning the unparsed remainder
    pub fn parse(input: &str) -> Result<(Self, &str)> {
        let input = input.trim_start();
        let mut rest = input.strip_prefix('{').ok_or_else(|| {
            HfaError::MalformedType(format!("expected `{{` at `{}`", preview(input)))
        })?;

        let mut fields = Vec::new();
        loop {
            rest = rest.trim_start();
            if let Some(r) = rest.strip_prefix('}') {
                rest = r;
                break;
            }
            if rest.is_empty() {
                return Err(HfaError::MalformedType("unterminated type definition".to_string()));
            }
            let (field, r) = FieldSpec::parse(rest)?;
            fields.push(field);
            rest = r;
        }

        let (name, rest) = take_until(rest, ',')?;
        let name = name.trim();
        if name.is_empty() {
            return Err(HfaError::MalformedType("type without a name".to_string()));
        }

        Ok((
            CompositeType {
                name: name.to_string(),
                fields,
                fixed_size: None,
            },
            rest,
        ))
    }

    /// Payload size when every field has a fixed size
    pub fn fixed_size(&self) -> Option<usize> {
        self.fixed_size
    }

    /// Case-insensitive field lookup
    pub fn field(&self, name: &str) -> Option<(usize, &FieldSpec)> {
        self.fields
            .iter()
            .enumerate()
            .find(|(_, f)| f.name.eq_ignore_ascii_case(name))
    }
}

fn preview(text: &str) -> &str {
    let end = text
        .char_indices()
        .nth(24)
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    &text[..end]
}

fn take_until(input: &str, delim: char) -> Result<(&str, &str)> {
    let idx = input.find(delim).ok_or_else(|| {
        HfaError::MalformedType(format!("missing `{}` in `{}`", delim, preview(input)))
    })?;
    Ok((&input[..idx], &input[idx + delim.len_utf8()..]))
}

fn next_char(input: &str) -> Result<(char, &str)> {
    let c = input
        .chars()
        .next()
        .ok_or_else(|| HfaError::MalformedType("truncated field definition".to_string()))?;
    Ok((c, &input[c.len_utf8()..]))
}

/// Split dictionary text into definitions, each paired with its source text
fn definitions(text: &str) -> impl Iterator<Item = Result<(CompositeType, &str)>> {
    let mut rest = text;
    let mut failed = false;
    std::iter::from_fn(move || {
        if failed {
            return None;
        }
        rest = rest.trim_start();
        if rest.is_empty() || rest.starts_with('.') {
            return None;
        }
        match CompositeType::parse(rest) {
            Ok((ty, r)) => {
                let source = &rest[..rest.len() - r.len()];
                rest = r;
                Some(Ok((ty, source.trim_start())))
            }
            Err(e) => {
                failed = true;
                Some(Err(e))
            }
        }
    })
}

#[derive(Clone, Copy)]
enum SizeState {
    Unvisited,
    Visiting,
    Done(Option<usize>),
}

/// Parsed set of composite types owned by one container
#[derive(Debug, Clone)]
pub struct TypeDictionary {
    types: Vec<CompositeType>,
    by_name: HashMap<String, TypeId>,
    /// Built-in types merged in but not yet present in `text`
    pending: HashMap<TypeId, &'static str>,
    text: String,
    text_dirty: bool,
}

impl TypeDictionary {
    fn empty(text: &str) -> Self {
        TypeDictionary {
            types: Vec::new(),
            by_name: HashMap::new(),
            pending: HashMap::new(),
            text: text.to_string(),
            text_dirty: false,
        }
    }

    /// Parse dictionary text, failing on the first malformed definition
    pub fn parse(text: &str) -> Result<Self> {
        let mut dict = Self::empty(text);
        for def in definitions(text) {
            let (ty, _) = def?;
            dict.register(ty);
        }
        dict.complete();
        Ok(dict)
    }

    /// Dictionary for a new container
    pub fn with_defaults() -> Result<Self> {
        Self::parse(DEFAULT_DICTIONARY)
    }

    /// Build from text read out of a file
    ///
    /// A malformed definition ends parsing with a warning; the types read
    /// before it are kept. Built-in types the text does not define are
    /// merged in afterwards.
    pub fn from_file_text(text: &str) -> Self {
        let mut dict = Self::empty(text);
        for def in definitions(text) {
            match def {
                Ok((ty, _)) => {
                    dict.register(ty);
                }
                Err(e) => {
                    tracing::warn!("Ignoring dictionary text after malformed definition: {}", e);
                    break;
                }
            }
        }

        for def in definitions(DEFAULT_DICTIONARY) {
            let Ok((ty, source)) = def else { break };
            if dict.by_name.contains_key(&ty.name) {
                continue;
            }
            tracing::debug!("Merging built-in definition of {}", ty.name);
            if let Some(id) = dict.register(ty) {
                dict.pending.insert(id, source);
            }
        }

        dict.complete();
        dict
    }

    /// Byte size of one item of a scalar kind code, `None` for variable kinds
    pub fn item_size(code: char) -> Option<usize> {
        match code {
            'e' => Some(2),
            other => FieldKind::from_code(other).and_then(|k| k.item_size()),
        }
    }

    /// Exact-match lookup
    pub fn find(&self, name: &str) -> Option<TypeId> {
        self.by_name.get(name).copied()
    }

    pub fn find_type(&self, name: &str) -> Option<&CompositeType> {
        self.find(name).map(|id| self.get(id))
    }

    pub fn get(&self, id: TypeId) -> &CompositeType {
        &self.types[id.0]
    }

    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.by_name.keys().map(String::as_str)
    }

    /// Raw dictionary text as it should be stored in the file
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_text_dirty(&self) -> bool {
        self.text_dirty
    }

    pub(crate) fn mark_text_clean(&mut self) {
        self.text_dirty = false;
    }

    /// Make sure the stored text defines `name`
    ///
    /// Types merged from the built-in set are appended to the text the
    /// first time an entry of that type is written, together with the
    /// merged types they reference. Returns true if text was appended.
    pub fn ensure_embedded(&mut self, name: &str) -> bool {
        let Some(root) = self.find(name) else {
            return false;
        };
        let mut appended = false;
        let mut stack = vec![root];
        let mut seen = HashSet::new();
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            if let Some(source) = self.pending.remove(&id) {
                let trimmed = self.text.trim_end_matches(['.', '\0', ' ', '\n', '\r']).len();
                self.text.truncate(trimmed);
                if !self.text.is_empty() && !self.text.ends_with(',') {
                    self.text.push(',');
                }
                self.text.push_str(source);
                self.text.push('.');
                self.text_dirty = true;
                appended = true;
                tracing::debug!("Embedding built-in definition of {}", self.types[id.0].name);
            }
            for field in &self.types[id.0].fields {
                if let Some(child) = field.object_type {
                    stack.push(child);
                }
            }
        }
        appended
    }

    /// Add a type and its inline sub-types; named duplicates are ignored
    fn register(&mut self, mut ty: CompositeType) -> Option<TypeId> {
        if self.by_name.contains_key(&ty.name) {
            tracing::debug!("Ignoring duplicate definition of {}", ty.name);
            return None;
        }
        let id = self.register_anonymous(&mut ty);
        self.by_name.insert(self.types[id.0].name.clone(), id);
        Some(id)
    }

    fn register_anonymous(&mut self, ty: &mut CompositeType) -> TypeId {
        for field in &mut ty.fields {
            if let Some(mut inline) = field.inline.take() {
                field.object_type = Some(self.register_anonymous(&mut inline));
            }
        }
        let id = TypeId(self.types.len());
        self.types.push(ty.clone());
        id
    }

    /// Resolve object references by name and compute fixed sizes
    fn complete(&mut self) {
        for i in 0..self.types.len() {
            for j in 0..self.types[i].fields.len() {
                let field = &self.types[i].fields[j];
                if field.object_type.is_some() {
                    continue;
                }
                if let FieldKind::Object(name) = &field.kind {
                    let resolved = self.by_name.get(name).copied();
                    if resolved.is_none() {
                        tracing::debug!(
                            "Type {} references undefined type {}",
                            self.types[i].name,
                            name
                        );
                    }
                    self.types[i].fields[j].object_type = resolved;
                }
            }
        }

        let mut state = vec![SizeState::Unvisited; self.types.len()];
        for i in 0..self.types.len() {
            let size = self.compute_size(i, &mut state);
            self.types[i].fixed_size = size;
        }
    }

    fn compute_size(&self, index: usize, state: &mut [SizeState]) -> Option<usize> {
        match state[index] {
            SizeState::Done(size) => return size,
            SizeState::Visiting => return None,
            SizeState::Unvisited => {}
        }
        state[index] = SizeState::Visiting;

        let mut total = Some(0usize);
        for field in &self.types[index].fields {
            let field_size = if field.is_variable() {
                None
            } else {
                let count = field.count as usize;
                match &field.kind {
                    FieldKind::Object(_) => field
                        .object_type
                        .and_then(|t| self.compute_size(t.0, state))
                        .and_then(|s| s.checked_mul(count)),
                    kind => kind.item_size().and_then(|s| s.checked_mul(count)),
                }
            };
            total = match (total, field_size) {
                (Some(t), Some(f)) => t.checked_add(f),
                _ => None,
            };
        }

        state[index] = SizeState::Done(total);
        total
    }
}
