//! Field interpreter
//!
//! Reads and writes individual values inside an entry payload, using the
//! layout of the payload's composite type. Paths look like `name`,
//! `name[3]`, `a.b` or `a[1].b`. Basedata fields also accept the special
//! indices `-3` (item type), `-2` (rows) and `-1` (columns).
//!
//! Variable-length fields are stored as a count and an absolute file
//! offset followed by the items, so writers pass the file position of the
//! payload along with its bytes.

use crate::dictionary::{FieldKind, FieldSpec, TypeDictionary, TypeId};
use crate::error::{HfaError, Result};
use crate::header::c_string;
use crate::pack::{self, PixelType};

/// Value read from or written to a field
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Int(i64),
    Double(f64),
    Text(String),
}

impl FieldValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Int(v) => Some(*v),
            FieldValue::Double(v) => Some(*v as i64),
            FieldValue::Text(s) => s.trim().parse().ok(),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Int(v) => Some(*v as f64),
            FieldValue::Double(v) => Some(*v),
            FieldValue::Text(s) => s.trim().parse().ok(),
        }
    }

    pub fn as_text(&self) -> String {
        match self {
            FieldValue::Int(v) => v.to_string(),
            FieldValue::Double(v) => v.to_string(),
            FieldValue::Text(s) => s.clone(),
        }
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        FieldValue::Int(v.into())
    }
}

impl From<u32> for FieldValue {
    fn from(v: u32) -> Self {
        FieldValue::Int(v.into())
    }
}

impl From<usize> for FieldValue {
    fn from(v: usize) -> Self {
        FieldValue::Int(v as i64)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::Double(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Text(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Text(v)
    }
}

/// Requested representation of a read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Want {
    Int,
    Double,
    Text,
}

#[derive(Debug, Clone, Copy)]
enum Num {
    I(i64),
    F(f64),
}

impl Num {
    fn into_value(self, want: Want) -> FieldValue {
        match (self, want) {
            (Num::I(v), Want::Int) => FieldValue::Int(v),
            (Num::I(v), Want::Double) => FieldValue::Double(v as f64),
            (Num::I(v), Want::Text) => FieldValue::Text(v.to_string()),
            (Num::F(v), Want::Int) => FieldValue::Int(v as i64),
            (Num::F(v), Want::Double) => FieldValue::Double(v),
            (Num::F(v), Want::Text) => FieldValue::Text(v.to_string()),
        }
    }

    fn as_i64(self) -> i64 {
        match self {
            Num::I(v) => v,
            Num::F(v) => v as i64,
        }
    }

    fn as_f64(self) -> f64 {
        match self {
            Num::I(v) => v as f64,
            Num::F(v) => v,
        }
    }
}

struct Step<'a> {
    name: &'a str,
    index: i64,
    rest: Option<&'a str>,
}

fn parse_step(path: &str) -> Result<Step<'_>> {
    let (head, rest) = match path.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    };
    match head.split_once('[') {
        Some((name, tail)) => {
            let bad = || HfaError::InvalidArgument(format!("bad field path `{}`", path));
            let index = tail
                .strip_suffix(']')
                .ok_or_else(bad)?
                .trim()
                .parse()
                .map_err(|_| bad())?;
            Ok(Step { name, index, rest })
        }
        None => Ok(Step {
            name: head,
            index: 0,
            rest,
        }),
    }
}

fn truncated(name: &str) -> HfaError {
    HfaError::Corrupt(format!("payload too short for field {}", name))
}

fn overflow(name: &str) -> HfaError {
    HfaError::Overflow(format!("size of field {}", name))
}

fn out_of_range(name: &str, index: i64) -> HfaError {
    HfaError::FieldNotFound(format!("{}[{}] is out of range", name, index))
}

fn past_end(name: &str) -> HfaError {
    HfaError::NotSupported(format!("cannot extend field {} past end of payload", name))
}

fn object_type(field: &FieldSpec) -> Result<TypeId> {
    field.object_type().ok_or_else(|| match &field.kind {
        FieldKind::Object(name) => HfaError::UnknownType(name.clone()),
        _ => HfaError::UnknownType(field.name.clone()),
    })
}

/// Bytes used by one instance of a type at the start of `data`
pub fn type_bytes(dict: &TypeDictionary, id: TypeId, data: &[u8]) -> Result<usize> {
    let ty = dict.get(id);
    if let Some(size) = ty.fixed_size() {
        return Ok(size);
    }
    let mut offset = 0usize;
    for field in &ty.fields {
        let rest = data.get(offset..).ok_or_else(|| truncated(&field.name))?;
        offset = offset
            .checked_add(field_bytes(dict, field, rest)?)
            .ok_or_else(|| overflow(&field.name))?;
    }
    Ok(offset)
}

/// Bytes used by one field instance at the start of `data`
pub fn field_bytes(dict: &TypeDictionary, field: &FieldSpec, data: &[u8]) -> Result<usize> {
    if field.is_variable() {
        let count = pack::get_u32(data, 0).ok_or_else(|| truncated(&field.name))? as usize;
        let items = data.get(8..).unwrap_or(&[]);
        let size = match &field.kind {
            FieldKind::BaseData if count == 0 => 0,
            FieldKind::BaseData => basedata_bytes(field, items)?,
            FieldKind::Object(_) => objects_bytes(dict, field, items, count)?,
            kind => kind
                .item_size()
                .and_then(|s| s.checked_mul(count))
                .ok_or_else(|| overflow(&field.name))?,
        };
        return size.checked_add(8).ok_or_else(|| overflow(&field.name));
    }

    let count = field.count as usize;
    match &field.kind {
        FieldKind::BaseData => basedata_bytes(field, data),
        FieldKind::Object(_) => objects_bytes(dict, field, data, count),
        kind => kind
            .item_size()
            .and_then(|s| s.checked_mul(count))
            .ok_or_else(|| overflow(&field.name)),
    }
}

fn basedata_bytes(field: &FieldSpec, data: &[u8]) -> Result<usize> {
    let (pixel_type, cells) = basedata_shape(field, data)?;
    pixel_type
        .bytes_for(cells)
        .and_then(|b| b.checked_add(12))
        .ok_or_else(|| overflow(&field.name))
}

fn basedata_shape(field: &FieldSpec, data: &[u8]) -> Result<(PixelType, usize)> {
    let rows = pack::get_i32(data, 0).ok_or_else(|| truncated(&field.name))?;
    let cols = pack::get_i32(data, 4).ok_or_else(|| truncated(&field.name))?;
    let code = pack::get_i16(data, 8).ok_or_else(|| truncated(&field.name))?;
    if rows < 0 || cols < 0 {
        return Err(HfaError::Corrupt(format!(
            "basedata {} has negative shape {}x{}",
            field.name, rows, cols
        )));
    }
    let pixel_type = PixelType::from_code(code.into()).ok_or_else(|| {
        HfaError::Corrupt(format!("basedata {} has unknown item type {}", field.name, code))
    })?;
    let cells = (rows as usize)
        .checked_mul(cols as usize)
        .ok_or_else(|| overflow(&field.name))?;
    Ok((pixel_type, cells))
}

fn objects_bytes(
    dict: &TypeDictionary,
    field: &FieldSpec,
    data: &[u8],
    count: usize,
) -> Result<usize> {
    let id = object_type(field)?;
    if let Some(size) = dict.get(id).fixed_size() {
        return size.checked_mul(count).ok_or_else(|| overflow(&field.name));
    }
    item_offset(dict, id, data, count)
}

/// Offset of item `index` in a run of instances of `id`
fn item_offset(dict: &TypeDictionary, id: TypeId, data: &[u8], index: usize) -> Result<usize> {
    if let Some(size) = dict.get(id).fixed_size() {
        return size
            .checked_mul(index)
            .ok_or_else(|| overflow(&dict.get(id).name));
    }
    let mut offset = 0usize;
    for _ in 0..index {
        let rest = data
            .get(offset..)
            .ok_or_else(|| truncated(&dict.get(id).name))?;
        offset = offset
            .checked_add(type_bytes(dict, id, rest)?)
            .ok_or_else(|| overflow(&dict.get(id).name))?;
    }
    Ok(offset)
}

/// Find a field by case-insensitive name, returning its payload offset
fn locate<'d>(
    dict: &'d TypeDictionary,
    id: TypeId,
    data: &[u8],
    name: &str,
) -> Result<(usize, &'d FieldSpec)> {
    let ty = dict.get(id);
    let mut offset = 0usize;
    for field in &ty.fields {
        if field.name.eq_ignore_ascii_case(name) {
            return Ok((offset, field));
        }
        let rest = data.get(offset..).ok_or_else(|| truncated(&field.name))?;
        offset = offset
            .checked_add(field_bytes(dict, field, rest)?)
            .ok_or_else(|| overflow(&field.name))?;
    }
    Err(HfaError::FieldNotFound(format!("{}.{}", ty.name, name)))
}

/// Items of a field and how many there are
fn items_of<'b>(field: &FieldSpec, data: &'b [u8]) -> Result<(&'b [u8], usize)> {
    if field.is_variable() {
        let count = pack::get_u32(data, 0).ok_or_else(|| truncated(&field.name))?;
        Ok((data.get(8..).unwrap_or(&[]), count as usize))
    } else {
        Ok((data, field.count as usize))
    }
}

fn checked_index(field: &FieldSpec, index: i64, count: usize) -> Result<usize> {
    usize::try_from(index)
        .ok()
        .filter(|&i| i < count)
        .ok_or_else(|| out_of_range(&field.name, index))
}

/// Read the value at `path` from a payload of type `id`
pub fn extract(
    dict: &TypeDictionary,
    id: TypeId,
    data: &[u8],
    path: &str,
    want: Want,
) -> Result<FieldValue> {
    let step = parse_step(path)?;
    let (offset, field) = locate(dict, id, data, step.name)?;
    let data = data.get(offset..).ok_or_else(|| truncated(&field.name))?;

    match &field.kind {
        FieldKind::Object(_) => {
            let (items, count) = items_of(field, data)?;
            let index = checked_index(field, step.index, count)?;
            let id = object_type(field)?;
            let rest = step.rest.ok_or_else(|| {
                HfaError::FieldNotFound(format!("{} is an object, name one of its fields", field.name))
            })?;
            let off = item_offset(dict, id, items, index)?;
            let item = items.get(off..).ok_or_else(|| truncated(&field.name))?;
            extract(dict, id, item, rest, want)
        }
        FieldKind::BaseData => {
            let body = if field.is_variable() {
                let (body, count) = items_of(field, data)?;
                if count == 0 {
                    return Err(HfaError::FieldNotFound(format!("{} is empty", field.name)));
                }
                body
            } else {
                data
            };
            read_basedata(field, body, step.index, want)
        }
        kind if kind.is_text() && want == Want::Text => {
            let bytes = if field.is_variable() {
                let (items, count) = items_of(field, data)?;
                &items[..count.min(items.len())]
            } else {
                &data[..(field.count as usize).min(data.len())]
            };
            Ok(FieldValue::Text(c_string(bytes)))
        }
        kind => {
            let (items, count) = items_of(field, data)?;
            let index = checked_index(field, step.index, count)?;
            let size = kind.item_size().ok_or_else(|| overflow(&field.name))?;
            let pos = index.checked_mul(size).ok_or_else(|| overflow(&field.name))?;
            let num = read_scalar(kind, items, pos).ok_or_else(|| truncated(&field.name))?;
            if let (FieldKind::Enum(labels), Want::Text) = (kind, want) {
                let label = usize::try_from(num.as_i64())
                    .ok()
                    .and_then(|i| labels.get(i));
                return Ok(match label {
                    Some(label) => FieldValue::Text(label.clone()),
                    None => num.into_value(Want::Text),
                });
            }
            Ok(num.into_value(want))
        }
    }
}

/// Number of items held by the field at `path`
pub fn count(dict: &TypeDictionary, id: TypeId, data: &[u8], path: &str) -> Result<usize> {
    let step = parse_step(path)?;
    let (offset, field) = locate(dict, id, data, step.name)?;
    let data = data.get(offset..).ok_or_else(|| truncated(&field.name))?;

    match (&field.kind, step.rest) {
        (FieldKind::Object(_), Some(rest)) => {
            let (items, count) = items_of(field, data)?;
            let index = checked_index(field, step.index, count)?;
            let id = object_type(field)?;
            let off = item_offset(dict, id, items, index)?;
            let item = items.get(off..).ok_or_else(|| truncated(&field.name))?;
            self::count(dict, id, item, rest)
        }
        (FieldKind::BaseData, _) => {
            let (body, count) = items_of(field, data)?;
            if field.is_variable() && count == 0 {
                return Ok(0);
            }
            Ok(basedata_shape(field, body)?.1)
        }
        _ => Ok(items_of(field, data)?.1),
    }
}

fn read_basedata(field: &FieldSpec, body: &[u8], index: i64, want: Want) -> Result<FieldValue> {
    let header = |off: usize| -> Result<i64> {
        let v = if off == 8 {
            pack::get_i16(body, off).map(i64::from)
        } else {
            pack::get_i32(body, off).map(i64::from)
        };
        v.ok_or_else(|| truncated(&field.name))
    };
    match index {
        -3 => return Ok(Num::I(header(8)?).into_value(want)),
        -2 => return Ok(Num::I(header(0)?).into_value(want)),
        -1 => return Ok(Num::I(header(4)?).into_value(want)),
        _ => {}
    }
    let (pixel_type, cells) = basedata_shape(field, body)?;
    let index = checked_index(field, index, cells)?;
    read_cell(pixel_type, body.get(12..).unwrap_or(&[]), index)
        .map(|n| n.into_value(want))
        .ok_or_else(|| truncated(&field.name))
}

fn read_scalar(kind: &FieldKind, buf: &[u8], pos: usize) -> Option<Num> {
    let num = match kind {
        FieldKind::U1 | FieldKind::U2 | FieldKind::U4 | FieldKind::U8 => {
            Num::I(pack::get_u8(buf, pos)?.into())
        }
        FieldKind::S8 => Num::I((pack::get_u8(buf, pos)? as i8).into()),
        FieldKind::U16 | FieldKind::Enum(_) => Num::I(pack::get_u16(buf, pos)?.into()),
        FieldKind::S16 => Num::I(pack::get_i16(buf, pos)?.into()),
        FieldKind::U32 | FieldKind::Time => Num::I(pack::get_u32(buf, pos)?.into()),
        FieldKind::S32 => Num::I(pack::get_i32(buf, pos)?.into()),
        FieldKind::F32 | FieldKind::C64 => Num::F(pack::get_f32(buf, pos)?.into()),
        FieldKind::F64 | FieldKind::C128 => Num::F(pack::get_f64(buf, pos)?),
        FieldKind::BaseData | FieldKind::Object(_) => return None,
    };
    Some(num)
}

fn write_scalar(kind: &FieldKind, buf: &mut [u8], pos: usize, num: Num) -> Option<()> {
    match kind {
        FieldKind::U1 | FieldKind::U2 | FieldKind::U4 | FieldKind::U8 | FieldKind::S8 => {
            pack::put_u8(buf, pos, num.as_i64() as u8)
        }
        FieldKind::U16 | FieldKind::Enum(_) => pack::put_u16(buf, pos, num.as_i64() as u16),
        FieldKind::S16 => pack::put_i16(buf, pos, num.as_i64() as i16),
        FieldKind::U32 | FieldKind::Time => pack::put_u32(buf, pos, num.as_i64() as u32),
        FieldKind::S32 => pack::put_i32(buf, pos, num.as_i64() as i32),
        FieldKind::F32 => pack::put_f32(buf, pos, num.as_f64() as f32),
        FieldKind::F64 => pack::put_f64(buf, pos, num.as_f64()),
        FieldKind::C64 => {
            pack::put_f32(buf, pos, num.as_f64() as f32)?;
            pack::put_f32(buf, pos.checked_add(4)?, 0.0)
        }
        FieldKind::C128 => {
            pack::put_f64(buf, pos, num.as_f64())?;
            pack::put_f64(buf, pos.checked_add(8)?, 0.0)
        }
        FieldKind::BaseData | FieldKind::Object(_) => None,
    }
}

fn read_cell(pixel_type: PixelType, buf: &[u8], index: usize) -> Option<Num> {
    let num = match pixel_type {
        PixelType::U1 => Num::I(((pack::get_u8(buf, index / 8)? >> (index % 8)) & 0x1).into()),
        PixelType::U2 => {
            Num::I(((pack::get_u8(buf, index / 4)? >> ((index % 4) * 2)) & 0x3).into())
        }
        PixelType::U4 => {
            Num::I(((pack::get_u8(buf, index / 2)? >> ((index % 2) * 4)) & 0xf).into())
        }
        PixelType::U8 => Num::I(pack::get_u8(buf, index)?.into()),
        PixelType::S8 => Num::I((pack::get_u8(buf, index)? as i8).into()),
        PixelType::U16 => Num::I(pack::get_u16(buf, index.checked_mul(2)?)?.into()),
        PixelType::S16 => Num::I(pack::get_i16(buf, index.checked_mul(2)?)?.into()),
        PixelType::U32 => Num::I(pack::get_u32(buf, index.checked_mul(4)?)?.into()),
        PixelType::S32 => Num::I(pack::get_i32(buf, index.checked_mul(4)?)?.into()),
        PixelType::F32 => Num::F(pack::get_f32(buf, index.checked_mul(4)?)?.into()),
        PixelType::F64 => Num::F(pack::get_f64(buf, index.checked_mul(8)?)?),
        PixelType::C64 => Num::F(pack::get_f32(buf, index.checked_mul(8)?)?.into()),
        PixelType::C128 => Num::F(pack::get_f64(buf, index.checked_mul(16)?)?),
    };
    Some(num)
}

fn write_cell(pixel_type: PixelType, buf: &mut [u8], index: usize, num: Num) -> Option<()> {
    let sub_byte = |buf: &mut [u8], byte: usize, shift: usize, mask: u8| -> Option<()> {
        let old = pack::get_u8(buf, byte)?;
        let value = (num.as_i64() as u8) & mask;
        pack::put_u8(buf, byte, (old & !(mask << shift)) | (value << shift))
    };
    match pixel_type {
        PixelType::U1 => sub_byte(buf, index / 8, index % 8, 0x1),
        PixelType::U2 => sub_byte(buf, index / 4, (index % 4) * 2, 0x3),
        PixelType::U4 => sub_byte(buf, index / 2, (index % 2) * 4, 0xf),
        PixelType::U8 | PixelType::S8 => pack::put_u8(buf, index, num.as_i64() as u8),
        PixelType::U16 => pack::put_u16(buf, index.checked_mul(2)?, num.as_i64() as u16),
        PixelType::S16 => pack::put_i16(buf, index.checked_mul(2)?, num.as_i64() as i16),
        PixelType::U32 => pack::put_u32(buf, index.checked_mul(4)?, num.as_i64() as u32),
        PixelType::S32 => pack::put_i32(buf, index.checked_mul(4)?, num.as_i64() as i32),
        PixelType::F32 => pack::put_f32(buf, index.checked_mul(4)?, num.as_f64() as f32),
        PixelType::F64 => pack::put_f64(buf, index.checked_mul(8)?, num.as_f64()),
        PixelType::C64 => {
            let pos = index.checked_mul(8)?;
            pack::put_f32(buf, pos, num.as_f64() as f32)?;
            pack::put_f32(buf, pos + 4, 0.0)
        }
        PixelType::C128 => {
            let pos = index.checked_mul(16)?;
            pack::put_f64(buf, pos, num.as_f64())?;
            pack::put_f64(buf, pos + 8, 0.0)
        }
    }
}

fn to_num(field: &FieldSpec, value: &FieldValue) -> Result<Num> {
    let invalid = || {
        HfaError::InvalidArgument(format!("{:?} is not a valid value for {}", value, field.name))
    };
    match (&field.kind, value) {
        (FieldKind::Enum(labels), FieldValue::Text(text)) => labels
            .iter()
            .position(|l| l.eq_ignore_ascii_case(text))
            .map(|i| Num::I(i as i64))
            .ok_or_else(invalid),
        (FieldKind::F32 | FieldKind::F64 | FieldKind::C64 | FieldKind::C128, v) => {
            v.as_f64().map(Num::F).ok_or_else(invalid)
        }
        (_, FieldValue::Double(v)) => Ok(Num::F(*v)),
        (_, v) => v.as_i64().map(Num::I).ok_or_else(invalid),
    }
}

fn ensure_room(data: &[u8], needed: Option<usize>, field: &FieldSpec) -> Result<()> {
    match needed {
        Some(n) if n <= data.len() => Ok(()),
        _ => Err(past_end(&field.name)),
    }
}

/// Update the count/offset header of a variable field so it holds at least `count` items
fn claim_items(data: &mut [u8], abs: u32, count: u32, grow_only: bool, field: &FieldSpec) -> Result<()> {
    let existing = pack::get_u32(data, 0).ok_or_else(|| past_end(&field.name))?;
    let count = if grow_only { existing.max(count) } else { count };
    pack::put_u32(data, 0, count).ok_or_else(|| past_end(&field.name))?;
    pack::put_u32(data, 4, abs.wrapping_add(8)).ok_or_else(|| past_end(&field.name))
}

/// Write `value` at `path` into a payload of type `id` stored at file offset `data_pos`
pub fn set(
    dict: &TypeDictionary,
    id: TypeId,
    data: &mut [u8],
    data_pos: u32,
    path: &str,
    value: &FieldValue,
) -> Result<()> {
    let step = parse_step(path)?;
    let (offset, field) = locate(dict, id, data, step.name)?;
    let abs = data_pos.wrapping_add(offset as u32);
    let data = data
        .get_mut(offset..)
        .ok_or_else(|| past_end(&field.name))?;

    if let (true, FieldValue::Text(text), None) = (field.kind.is_text(), value, step.rest) {
        let bytes = text.as_bytes();
        if field.is_variable() {
            ensure_room(data, bytes.len().checked_add(9), field)?;
            claim_items(data, abs, bytes.len() as u32 + 1, false, field)?;
            data[8..8 + bytes.len()].copy_from_slice(bytes);
            data[8 + bytes.len()] = 0;
        } else {
            let cap = field.count as usize;
            ensure_room(data, Some(cap), field)?;
            let n = bytes.len().min(cap.saturating_sub(1));
            data[..cap].fill(0);
            data[..n].copy_from_slice(&bytes[..n]);
        }
        return Ok(());
    }

    if step.index < 0 && field.kind != FieldKind::BaseData {
        return Err(out_of_range(&field.name, step.index));
    }

    match &field.kind {
        FieldKind::Object(_) => {
            let id = object_type(field)?;
            let index = step.index as usize;
            let base = if field.is_variable() {
                let wanted = u32::try_from(index + 1).map_err(|_| overflow(&field.name))?;
                claim_items(data, abs, wanted, true, field)?;
                8
            } else {
                checked_index(field, step.index, field.count as usize)?;
                0
            };
            let rest = step.rest.ok_or_else(|| {
                HfaError::FieldNotFound(format!("{} is an object, name one of its fields", field.name))
            })?;
            let off = base + item_offset(dict, id, &data[base..], index)?;
            let item = data.get_mut(off..).ok_or_else(|| past_end(&field.name))?;
            set(dict, id, item, abs.wrapping_add(off as u32), rest, value)
        }
        FieldKind::BaseData => {
            let base = if field.is_variable() {
                claim_items(data, abs, 1, true, field)?;
                8
            } else {
                0
            };
            let body = &mut data[base..];
            let num = to_num(field, value)?;
            let stored = match step.index {
                -3 => pack::put_i16(body, 8, num.as_i64() as i16),
                -2 => pack::put_i32(body, 0, num.as_i64() as i32),
                -1 => pack::put_i32(body, 4, num.as_i64() as i32),
                index => {
                    let (pixel_type, cells) = basedata_shape(field, body)?;
                    let index = checked_index(field, index, cells)?;
                    let cells = body.get_mut(12..).ok_or_else(|| past_end(&field.name))?;
                    write_cell(pixel_type, cells, index, num)
                }
            };
            stored.ok_or_else(|| past_end(&field.name))
        }
        kind => {
            let size = kind.item_size().ok_or_else(|| overflow(&field.name))?;
            let index = step.index as usize;
            let base = if field.is_variable() {
                let existing = pack::get_u32(data, 0).ok_or_else(|| past_end(&field.name))? as usize;
                let needed = existing
                    .max(index + 1)
                    .checked_mul(size)
                    .and_then(|n| n.checked_add(8));
                ensure_room(data, needed, field)?;
                let wanted = u32::try_from(index + 1).map_err(|_| overflow(&field.name))?;
                claim_items(data, abs, wanted, true, field)?;
                8
            } else {
                checked_index(field, step.index, field.count as usize)?;
                0
            };
            let num = to_num(field, value)?;
            let pos = index
                .checked_mul(size)
                .and_then(|p| p.checked_add(base))
                .ok_or_else(|| overflow(&field.name))?;
            write_scalar(kind, data, pos, num).ok_or_else(|| past_end(&field.name))
        }
    }
}

/// Rewrite the absolute offsets of every non-empty variable field
///
/// Payloads that move when they grow would otherwise point at their old
/// location.
pub fn relocate_pointers(
    dict: &TypeDictionary,
    id: TypeId,
    data: &mut [u8],
    data_pos: u32,
) -> Result<()> {
    let ty = dict.get(id);
    if ty.fixed_size().is_some() {
        return Ok(());
    }
    let mut offset = 0usize;
    for field in &ty.fields {
        let chunk = match data.get_mut(offset..) {
            Some(chunk) if !chunk.is_empty() => chunk,
            _ => break,
        };
        let size = field_bytes(dict, field, chunk)?;
        let abs = data_pos.wrapping_add(offset as u32);
        let chunk_len = chunk.len();
        relocate_field(dict, field, &mut chunk[..size.min(chunk_len)], abs)?;
        offset = offset.checked_add(size).ok_or_else(|| overflow(&field.name))?;
    }
    Ok(())
}

fn relocate_field(dict: &TypeDictionary, field: &FieldSpec, chunk: &mut [u8], abs: u32) -> Result<()> {
    let (items, items_pos, count) = if field.is_variable() {
        let count = pack::get_u32(chunk, 0).unwrap_or(0);
        if count > 0 {
            pack::put_u32(chunk, 4, abs.wrapping_add(8)).ok_or_else(|| truncated(&field.name))?;
        }
        match chunk.get_mut(8..) {
            Some(items) => (items, abs.wrapping_add(8), count as usize),
            None => return Ok(()),
        }
    } else {
        (chunk, abs, field.count as usize)
    };

    let FieldKind::Object(_) = field.kind else {
        return Ok(());
    };
    let id = object_type(field)?;
    if dict.get(id).fixed_size().is_some() {
        return Ok(());
    }
    let mut offset = 0usize;
    for _ in 0..count {
        let item = match items.get_mut(offset..) {
            Some(item) if !item.is_empty() => item,
            _ => break,
        };
        let size = type_bytes(dict, id, item)?;
        relocate_pointers(dict, id, item, items_pos.wrapping_add(offset as u32))?;
        offset = offset.checked_add(size).ok_or_else(|| overflow(&field.name))?;
    }
    Ok(())
}
