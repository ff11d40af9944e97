//! Entry tree
//!
//! The container is a tree of typed records. Nodes live in an arena and
//! refer to each other by [`EntryId`]; on-disk links are file offsets that
//! are followed lazily the first time a traversal needs them. A node's
//! payload is only read when one of its fields is accessed.
//!
//! Changes are write-back: edits mark nodes dirty, and [`EntryTree::flush`]
//! first gives every unpositioned node space at the end of the file, then
//! rewrites the header (and loaded payload) of each dirty node.

use crate::allocator::SpaceAllocator;
use crate::dictionary::{TypeDictionary, TypeId};
use crate::error::{HfaError, Result};
use crate::field::{self, FieldValue, Want};
use crate::header::{EntryHeader, ENTRY_HEADER_USED, NAME_LEN, TYPE_LEN};
use crate::io::HfaFile;
use std::collections::HashMap;
use std::fmt::Write as _;

/// Handle of a node in an [`EntryTree`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(usize);

#[derive(Debug)]
struct Node {
    /// Offset of the header, 0 until the node has been given space
    file_pos: u32,
    data_pos: u32,
    data_size: u32,
    name: String,
    type_name: String,
    mod_time: u32,
    ty: Option<TypeId>,

    parent: Option<EntryId>,
    prev: Option<EntryId>,
    next: Option<EntryId>,
    child: Option<EntryId>,
    /// On-disk links, meaningful while `next`/`child` are not loaded
    next_pos: u32,
    child_pos: u32,

    data: Option<Vec<u8>>,
    dirty: bool,
    removed: bool,
}

fn truncated_name(name: &str, len: usize) -> String {
    let mut end = name.len().min(len - 1);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_string()
}

/// Arena of entries plus the file, allocator and dictionary they live in
#[derive(Debug)]
pub struct EntryTree {
    nodes: Vec<Node>,
    root: EntryId,
    header_len: u32,
    /// Positioned, loaded nodes by file offset
    positions: HashMap<u32, EntryId>,
    dirty: bool,
    file: HfaFile,
    alloc: SpaceAllocator,
    dict: TypeDictionary,
}

impl EntryTree {
    /// Tree for a new file: an unpositioned, dirty root
    pub fn create(
        file: HfaFile,
        alloc: SpaceAllocator,
        dict: TypeDictionary,
        header_len: u16,
    ) -> Self {
        let ty = dict.find("root");
        let root = Node {
            file_pos: 0,
            data_pos: 0,
            data_size: 0,
            name: "root".to_string(),
            type_name: "root".to_string(),
            mod_time: 0,
            ty,
            parent: None,
            prev: None,
            next: None,
            child: None,
            next_pos: 0,
            child_pos: 0,
            data: Some(Vec::new()),
            dirty: true,
            removed: false,
        };
        EntryTree {
            nodes: vec![root],
            root: EntryId(0),
            header_len: header_len.into(),
            positions: HashMap::new(),
            dirty: true,
            file,
            alloc,
            dict,
        }
    }

    /// Tree of an existing file; an unreadable root is fatal
    pub fn open(
        file: HfaFile,
        alloc: SpaceAllocator,
        dict: TypeDictionary,
        header_len: u16,
        root_pos: u32,
    ) -> Result<Self> {
        let mut tree = EntryTree {
            nodes: Vec::new(),
            root: EntryId(0),
            header_len: header_len.into(),
            positions: HashMap::new(),
            dirty: false,
            file,
            alloc,
            dict,
        };
        let root = tree.read_node(root_pos, None, None)?;
        tree.root = tree.push(root);
        Ok(tree)
    }

    pub fn root(&self) -> EntryId {
        self.root
    }

    pub fn name(&self, id: EntryId) -> &str {
        &self.nodes[id.0].name
    }

    pub fn type_name(&self, id: EntryId) -> &str {
        &self.nodes[id.0].type_name
    }

    pub fn file_pos(&self, id: EntryId) -> u32 {
        self.nodes[id.0].file_pos
    }

    pub fn data_pos(&self, id: EntryId) -> u32 {
        self.nodes[id.0].data_pos
    }

    pub fn data_size(&self, id: EntryId) -> u32 {
        self.nodes[id.0].data_size
    }

    pub fn is_dirty(&self, id: EntryId) -> bool {
        self.nodes[id.0].dirty
    }

    pub fn is_removed(&self, id: EntryId) -> bool {
        self.nodes[id.0].removed
    }

    /// True when any node needs to be written
    pub fn is_tree_dirty(&self) -> bool {
        self.dirty
    }

    pub fn parent(&self, id: EntryId) -> Option<EntryId> {
        self.nodes[id.0].parent
    }

    /// Resolved type of the node's payload
    pub fn type_id(&self, id: EntryId) -> Option<TypeId> {
        self.nodes[id.0].ty
    }

    pub fn dictionary(&self) -> &TypeDictionary {
        &self.dict
    }

    pub fn dictionary_mut(&mut self) -> &mut TypeDictionary {
        &mut self.dict
    }

    pub fn file(&self) -> &HfaFile {
        &self.file
    }

    pub fn file_mut(&mut self) -> &mut HfaFile {
        &mut self.file
    }

    pub fn allocator_mut(&mut self) -> &mut SpaceAllocator {
        &mut self.alloc
    }

    pub fn end_of_file(&self) -> u32 {
        self.alloc.end_of_file()
    }

    pub fn mark_dirty(&mut self, id: EntryId) {
        self.nodes[id.0].dirty = true;
        self.dirty = true;
    }

    fn push(&mut self, node: Node) -> EntryId {
        let id = EntryId(self.nodes.len());
        if node.file_pos != 0 {
            self.positions.insert(node.file_pos, id);
        }
        self.nodes.push(node);
        id
    }

    fn read_node(&mut self, pos: u32, parent: Option<EntryId>, prev: Option<EntryId>) -> Result<Node> {
        let eof = u64::from(self.alloc.end_of_file());
        if pos == 0 || u64::from(pos) + ENTRY_HEADER_USED as u64 > eof {
            return Err(HfaError::Corrupt(format!(
                "entry header at {} lies outside the file",
                pos
            )));
        }
        let bytes = self.file.read_vec(pos.into(), ENTRY_HEADER_USED)?;
        let header = EntryHeader::from_bytes(&bytes)?;
        if header.data_size > 0
            && u64::from(header.data_pos) + u64::from(header.data_size) > eof
        {
            return Err(HfaError::Corrupt(format!(
                "entry {} payload {}+{} lies outside the file",
                header.name, header.data_pos, header.data_size
            )));
        }

        let ty = self.dict.find(&header.type_name);
        Ok(Node {
            file_pos: pos,
            data_pos: header.data_pos,
            data_size: header.data_size,
            name: header.name,
            type_name: header.type_name,
            mod_time: header.mod_time,
            ty,
            parent,
            prev,
            next: None,
            child: None,
            next_pos: header.next,
            child_pos: header.child,
            data: None,
            dirty: false,
            removed: false,
        })
    }

    /// Load the node at `pos` unless it is already part of the tree
    ///
    /// A link to an already loaded node would make traversal loop, and a
    /// header that cannot be read would poison it; both cut the link.
    fn follow(&mut self, from: EntryId, pos: u32, as_child: bool) -> Result<Option<EntryId>> {
        if let Some(&seen) = self.positions.get(&pos) {
            tracing::warn!(
                "Corrupt entry tree: {} link of {} at {} points back to {} at {}, cutting it",
                if as_child { "child" } else { "sibling" },
                self.nodes[from.0].name,
                self.nodes[from.0].file_pos,
                self.nodes[seen.0].name,
                pos
            );
            self.sever(from, as_child);
            return Ok(None);
        }

        let (parent, prev) = if as_child {
            (Some(from), None)
        } else {
            (self.nodes[from.0].parent, Some(from))
        };
        match self.read_node(pos, parent, prev) {
            Ok(node) => {
                let id = self.push(node);
                if as_child {
                    self.nodes[from.0].child = Some(id);
                } else {
                    self.nodes[from.0].next = Some(id);
                }
                Ok(Some(id))
            }
            Err(HfaError::Io(e)) => Err(HfaError::Io(e)),
            Err(e) => {
                tracing::warn!(
                    "Dropping unreadable entry at {} linked from {}: {}",
                    pos,
                    self.nodes[from.0].name,
                    e
                );
                self.sever(from, as_child);
                Ok(None)
            }
        }
    }

    fn sever(&mut self, id: EntryId, child: bool) {
        if child {
            self.nodes[id.0].child_pos = 0;
        } else {
            self.nodes[id.0].next_pos = 0;
        }
    }

    pub fn first_child(&mut self, id: EntryId) -> Result<Option<EntryId>> {
        let node = &self.nodes[id.0];
        if node.child.is_some() || node.child_pos == 0 {
            return Ok(node.child);
        }
        let pos = node.child_pos;
        self.follow(id, pos, true)
    }

    pub fn next_sibling(&mut self, id: EntryId) -> Result<Option<EntryId>> {
        let node = &self.nodes[id.0];
        if node.next.is_some() || node.next_pos == 0 {
            return Ok(node.next);
        }
        let pos = node.next_pos;
        self.follow(id, pos, false)
    }

    pub fn children(&mut self, id: EntryId) -> Result<Vec<EntryId>> {
        let mut out = Vec::new();
        let mut cur = self.first_child(id)?;
        while let Some(child) = cur {
            out.push(child);
            cur = self.next_sibling(child)?;
        }
        Ok(out)
    }

    /// Find a descendant by a dotted path such as `Projection.Datum`
    ///
    /// Names compare case-insensitively. A `:` ends the path, so field
    /// paths like `Statistics:minimum` can be passed through.
    pub fn named_child(&mut self, id: EntryId, path: &str) -> Result<Option<EntryId>> {
        let end = path.find(['.', ':']).unwrap_or(path.len());
        let head = &path[..end];
        let rest = path[end..].strip_prefix('.');

        for child in self.children(id)? {
            if !self.nodes[child.0].name.eq_ignore_ascii_case(head) {
                continue;
            }
            match rest {
                Some(rest) => {
                    if let Some(found) = self.named_child(child, rest)? {
                        return Ok(Some(found));
                    }
                }
                None => return Ok(Some(child)),
            }
        }
        Ok(None)
    }

    /// All descendants matching an optional name and an optional type
    pub fn find_children(
        &mut self,
        id: EntryId,
        name: Option<&str>,
        type_name: Option<&str>,
    ) -> Result<Vec<EntryId>> {
        let mut out = Vec::new();
        let mut stack = self.children(id)?;
        stack.reverse();
        while let Some(child) = stack.pop() {
            let node = &self.nodes[child.0];
            let name_ok = name.map_or(true, |n| node.name.eq_ignore_ascii_case(n));
            let type_ok = type_name.map_or(true, |t| node.type_name.eq_ignore_ascii_case(t));
            if name_ok && type_ok {
                out.push(child);
            }
            let mut grandchildren = self.children(child)?;
            grandchildren.reverse();
            stack.extend(grandchildren);
        }
        Ok(out)
    }

    /// Append a new node as the last child of `parent`
    pub fn new_child(&mut self, parent: EntryId, name: &str, type_name: &str) -> Result<EntryId> {
        let last = self.children(parent)?.last().copied();
        let node = Node {
            file_pos: 0,
            data_pos: 0,
            data_size: 0,
            name: truncated_name(name, NAME_LEN),
            type_name: truncated_name(type_name, TYPE_LEN),
            mod_time: 0,
            ty: self.dict.find(type_name),
            parent: Some(parent),
            prev: last,
            next: None,
            child: None,
            next_pos: 0,
            child_pos: 0,
            data: Some(Vec::new()),
            dirty: true,
            removed: false,
        };
        let id = self.push(node);
        match last {
            Some(last) => {
                self.nodes[last.0].next = Some(id);
                self.mark_dirty(last);
            }
            None => {
                self.nodes[parent.0].child = Some(id);
                self.mark_dirty(parent);
            }
        }
        self.mark_dirty(id);
        self.dict.ensure_embedded(type_name);
        tracing::debug!("Created entry {}({})", name, type_name);
        Ok(id)
    }

    /// Detach a node from the tree and discard its subtree
    pub fn remove(&mut self, id: EntryId) -> Result<()> {
        if id == self.root {
            return Err(HfaError::InvalidArgument("cannot remove the root entry".to_string()));
        }
        let next = self.next_sibling(id)?;
        let node = &self.nodes[id.0];
        let (prev, parent) = (node.prev, node.parent);

        match prev {
            Some(prev) => {
                self.nodes[prev.0].next = next;
                self.nodes[prev.0].next_pos = 0;
                self.mark_dirty(prev);
            }
            None => {
                if let Some(parent) = parent {
                    if self.nodes[parent.0].child == Some(id) {
                        self.nodes[parent.0].child = next;
                        self.nodes[parent.0].child_pos = 0;
                        self.mark_dirty(parent);
                    }
                }
            }
        }
        if let Some(next) = next {
            self.nodes[next.0].prev = prev;
            self.mark_dirty(next);
        }

        // Only loaded descendants occupy the arena
        let mut stack = vec![id];
        while let Some(cur) = stack.pop() {
            let node = &mut self.nodes[cur.0];
            node.removed = true;
            node.data = None;
            node.dirty = false;
            let pos = node.file_pos;
            let mut child = node.child;
            if pos != 0 {
                self.positions.remove(&pos);
            }
            while let Some(c) = child {
                stack.push(c);
                child = self.nodes[c.0].next;
            }
        }
        self.nodes[id.0].next = None;
        self.nodes[id.0].prev = None;
        Ok(())
    }

    pub fn rename(&mut self, id: EntryId, name: &str) {
        self.nodes[id.0].name = truncated_name(name, NAME_LEN);
        self.mark_dirty(id);
    }

    /// Read the payload if it is not in memory yet
    pub fn load_data(&mut self, id: EntryId) -> Result<()> {
        let node = &self.nodes[id.0];
        if node.data.is_some() {
            return Ok(());
        }
        let data = if node.data_size == 0 || node.data_pos == 0 {
            Vec::new()
        } else {
            self.file
                .read_vec(node.data_pos.into(), node.data_size as usize)?
        };
        self.nodes[id.0].data = Some(data);
        Ok(())
    }

    /// Payload bytes, loading them if needed
    pub fn data(&mut self, id: EntryId) -> Result<&[u8]> {
        self.load_data(id)?;
        Ok(self.nodes[id.0].data.as_deref().unwrap_or(&[]))
    }

    /// Mutable payload bytes; the node is marked dirty
    pub fn data_mut(&mut self, id: EntryId) -> Result<&mut [u8]> {
        self.load_data(id)?;
        self.mark_dirty(id);
        Ok(self.nodes[id.0].data.as_deref_mut().unwrap_or(&mut []))
    }

    /// Make sure the payload holds at least `size` bytes
    ///
    /// `size == 0` means the fixed size of the node's type. Growing a
    /// payload that already has a place in the file moves the node to new
    /// space at the next flush, so its neighbours must rewrite their links.
    pub fn make_data(&mut self, id: EntryId, size: usize) -> Result<()> {
        let size = if size == 0 {
            self.fixed_size(id)?
        } else {
            size
        };
        self.load_data(id)?;

        let current = self.nodes[id.0].data.as_ref().map_or(0, Vec::len);
        if current >= size {
            return Ok(());
        }
        let size_u32 = u32::try_from(size)
            .map_err(|_| HfaError::OutOfSpace(format!("payload of {} bytes", size)))?;

        if self.nodes[id.0].file_pos != 0 {
            let child = self.first_child(id)?;
            let next = self.next_sibling(id)?;
            let node = &mut self.nodes[id.0];
            let old_pos = node.file_pos;
            node.file_pos = 0;
            node.data_pos = 0;
            self.positions.remove(&old_pos);
            let (prev, parent) = (node.prev, node.parent);
            for neighbour in [prev, next, child, parent].into_iter().flatten() {
                self.mark_dirty(neighbour);
            }
            tracing::debug!(
                "Entry {} grows to {} bytes and moves from {}",
                self.nodes[id.0].name,
                size,
                old_pos
            );
        }

        let node = &mut self.nodes[id.0];
        if let Some(data) = node.data.as_mut() {
            data.resize(size, 0);
        }
        node.data_size = size_u32;
        self.mark_dirty(id);
        Ok(())
    }

    fn fixed_size(&self, id: EntryId) -> Result<usize> {
        let node = &self.nodes[id.0];
        let ty = node
            .ty
            .ok_or_else(|| HfaError::UnknownType(node.type_name.clone()))?;
        self.dict.get(ty).fixed_size().ok_or_else(|| {
            HfaError::InvalidArgument(format!(
                "type {} has no fixed size, an explicit payload size is required",
                node.type_name
            ))
        })
    }

    /// Give `id` and its loaded descendants file space, parents first
    pub fn set_position(&mut self, id: EntryId) -> Result<()> {
        let mut stack = vec![id];
        while let Some(cur) = stack.pop() {
            if self.nodes[cur.0].file_pos == 0 {
                let size = self
                    .header_len
                    .checked_add(self.nodes[cur.0].data_size)
                    .ok_or_else(|| HfaError::OutOfSpace("entry too large".to_string()))?;
                let pos = self.alloc.allocate(size)?;
                let header_len = self.header_len;
                let node = &mut self.nodes[cur.0];
                node.file_pos = pos;
                node.data_pos = if node.data_size > 0 { pos + header_len } else { 0 };
                self.positions.insert(pos, cur);
                self.mark_dirty(cur);
            }

            let mut children = Vec::new();
            let mut child = self.nodes[cur.0].child;
            while let Some(c) = child {
                children.push(c);
                child = self.nodes[c.0].next;
            }
            stack.extend(children.into_iter().rev());
        }
        Ok(())
    }

    /// Write every dirty node
    pub fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        self.set_position(self.root)?;

        let mut written = 0usize;
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            if self.nodes[id.0].dirty {
                self.write_node(id)?;
                written += 1;
            }
            let node = &self.nodes[id.0];
            // Children before later siblings
            if let Some(next) = node.next {
                stack.push(next);
            }
            if let Some(child) = node.child {
                stack.push(child);
            }
        }
        self.dirty = false;
        tracing::debug!("Flushed {} entries", written);
        Ok(())
    }

    fn link_pos(&self, link: Option<EntryId>, fallback: u32) -> u32 {
        link.map_or(fallback, |l| self.nodes[l.0].file_pos)
    }

    fn write_node(&mut self, id: EntryId) -> Result<()> {
        let node = &self.nodes[id.0];
        let next = self.link_pos(node.next, node.next_pos);
        let child = self.link_pos(node.child, node.child_pos);
        let header = EntryHeader {
            next,
            prev: self.link_pos(node.prev, 0),
            parent: self.link_pos(node.parent, 0),
            child,
            data_pos: node.data_pos,
            data_size: node.data_size,
            name: node.name.clone(),
            type_name: node.type_name.clone(),
            mod_time: node.mod_time,
        };
        let (file_pos, data_pos, ty) = (node.file_pos, node.data_pos, node.ty);
        self.file
            .write_at(file_pos.into(), &header.to_bytes(self.header_len as usize))?;

        let dict = &self.dict;
        let node = &mut self.nodes[id.0];
        if let (Some(data), true) = (node.data.as_mut(), node.data_size > 0) {
            if let Some(ty) = ty {
                if let Err(e) = field::relocate_pointers(dict, ty, data, data_pos) {
                    tracing::debug!("Cannot relocate pointers of {}: {}", node.name, e);
                }
            }
            self.file.write_at(data_pos.into(), data)?;
        }
        let node = &mut self.nodes[id.0];
        node.next_pos = next;
        node.child_pos = child;
        node.dirty = false;
        Ok(())
    }

    fn resolve<'p>(&mut self, id: EntryId, path: &'p str) -> Result<(EntryId, &'p str)> {
        match path.split_once(':') {
            Some((child, rest)) => {
                let target = self
                    .named_child(id, child)?
                    .ok_or_else(|| HfaError::EntryNotFound(child.to_string()))?;
                Ok((target, rest))
            }
            None => Ok((id, path)),
        }
    }

    fn payload_type(&self, id: EntryId) -> Result<TypeId> {
        let node = &self.nodes[id.0];
        node.ty
            .ok_or_else(|| HfaError::UnknownType(node.type_name.clone()))
    }

    /// Read a field; `path` may start with `child.path:` to reach a descendant
    pub fn field(&mut self, id: EntryId, path: &str, want: Want) -> Result<FieldValue> {
        let (id, path) = self.resolve(id, path)?;
        self.load_data(id)?;
        let ty = self.payload_type(id)?;
        let data = self.nodes[id.0].data.as_deref().unwrap_or(&[]);
        field::extract(&self.dict, ty, data, path, want)
    }

    pub fn get_int(&mut self, id: EntryId, path: &str) -> Result<i64> {
        match self.field(id, path, Want::Int)? {
            FieldValue::Int(v) => Ok(v),
            other => other
                .as_i64()
                .ok_or_else(|| HfaError::InvalidArgument(format!("{} is not numeric", path))),
        }
    }

    pub fn get_double(&mut self, id: EntryId, path: &str) -> Result<f64> {
        match self.field(id, path, Want::Double)? {
            FieldValue::Double(v) => Ok(v),
            other => other
                .as_f64()
                .ok_or_else(|| HfaError::InvalidArgument(format!("{} is not numeric", path))),
        }
    }

    pub fn get_string(&mut self, id: EntryId, path: &str) -> Result<String> {
        Ok(self.field(id, path, Want::Text)?.as_text())
    }

    /// Number of items held by a field
    pub fn field_count(&mut self, id: EntryId, path: &str) -> Result<usize> {
        let (id, path) = self.resolve(id, path)?;
        self.load_data(id)?;
        let ty = self.payload_type(id)?;
        let data = self.nodes[id.0].data.as_deref().unwrap_or(&[]);
        field::count(&self.dict, ty, data, path)
    }

    /// Write a field, materializing a fixed-size payload if needed
    pub fn set_field(
        &mut self,
        id: EntryId,
        path: &str,
        value: impl Into<FieldValue>,
    ) -> Result<()> {
        let value = value.into();
        let (id, path) = self.resolve(id, path)?;
        let ty = self.payload_type(id)?;
        self.load_data(id)?;
        if let Some(size) = self.dict.get(ty).fixed_size() {
            self.make_data(id, size)?;
        }

        let dict = &self.dict;
        let node = &mut self.nodes[id.0];
        let data_pos = node.data_pos;
        let data = node.data.as_deref_mut().unwrap_or(&mut []);
        field::set(dict, ty, data, data_pos, path, &value)?;

        let type_name = node.type_name.clone();
        self.mark_dirty(id);
        self.dict.ensure_embedded(&type_name);
        Ok(())
    }

    /// Indented listing of the loaded tree, loading every node
    pub fn dump(&mut self) -> Result<String> {
        let mut out = String::new();
        let mut stack = vec![(self.root, 0usize)];
        while let Some((id, depth)) = stack.pop() {
            let node = &self.nodes[id.0];
            let _ = writeln!(
                out,
                "{:indent$}{}({}) @ {} + {} @ {}",
                "",
                node.name,
                node.type_name,
                node.file_pos,
                node.data_size,
                node.data_pos,
                indent = depth * 2
            );
            let children = self.children(id)?;
            stack.extend(children.into_iter().rev().map(|c| (c, depth + 1)));
        }
        Ok(out)
    }
}
