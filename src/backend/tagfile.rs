//! Tag/reference container.
//!
//! A file is a header followed by a flat sequence of records, each
//! `u16 tag, u16 ref, u32 length, payload`. Groups, datasets and attributes
//! are separate tags; attributes point at their owner by `(tag, ref)` with
//! `(0, 0)` meaning the file root. The whole file is decoded on open, edited
//! in memory and written back on close.

use super::attr::AttrValue;
use super::store::{join_path, split_path, Store, VarShape};
use crate::error::{AccessMode, IoError, Result};
use crate::slab::{self, Region};
use crate::types::TypeTag;
use std::fs;
use std::path::{Path, PathBuf};

const MAGIC: [u8; 4] = [0x0e, 0x03, 0x13, 0x01];
const VERSION: u16 = 1;
const LITTLE_ENDIAN: u8 = 1;
const BIG_ENDIAN: u8 = 2;

const TAG_DATASET: u16 = 702;
const TAG_ATTRIBUTE: u16 = 1962;
const TAG_GROUP: u16 = 1965;

fn native_order() -> u8 {
    if cfg!(target_endian = "little") {
        LITTLE_ENDIAN
    } else {
        BIG_ENDIAN
    }
}

type AttrList = Vec<(String, AttrValue)>;

fn set_attr(attrs: &mut AttrList, name: &str, value: &AttrValue) {
    match attrs.iter_mut().find(|(n, _)| n == name) {
        Some((_, existing)) => *existing = value.clone(),
        None => attrs.push((name.to_string(), value.clone())),
    }
}

fn get_attr(attrs: &AttrList, name: &str) -> Option<AttrValue> {
    attrs
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v.clone())
}

#[derive(Debug)]
struct GroupEntry {
    path: String,
    attrs: AttrList,
}

#[derive(Debug)]
struct Dataset {
    group: String,
    name: String,
    data_type: TypeTag,
    dims: Vec<usize>,
    data: Vec<u8>,
    attrs: AttrList,
}

impl Dataset {
    fn path(&self) -> String {
        join_path(&self.group, &self.name)
    }

    fn matches(&self, path: &str) -> bool {
        let (group, name) = split_path(path);
        self.group == group && self.name == name
    }
}

/// Which object an attribute hangs off.
#[derive(Debug, Clone, Copy)]
enum Owner {
    Root,
    Group(usize),
    Dataset(usize),
}

/// In-memory image of a tag container file.
#[derive(Debug)]
pub(crate) struct TagStore {
    path: PathBuf,
    writable: bool,
    root_attrs: AttrList,
    groups: Vec<GroupEntry>,
    datasets: Vec<Dataset>,
}

impl TagStore {
    fn empty(path: &Path, writable: bool) -> Self {
        Self {
            path: path.to_path_buf(),
            writable,
            root_attrs: Vec::new(),
            groups: Vec::new(),
            datasets: Vec::new(),
        }
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.writable {
            Ok(())
        } else {
            Err(IoError::NotOpen {
                mode: AccessMode::Write,
            })
        }
    }

    fn group_index(&self, group: &str) -> Option<usize> {
        self.groups.iter().position(|g| g.path == group)
    }

    fn dataset_index(&self, path: &str) -> Option<usize> {
        self.datasets.iter().position(|d| d.matches(path))
    }

    fn dataset(&self, path: &str) -> Result<&Dataset> {
        self.datasets
            .iter()
            .find(|d| d.matches(path))
            .ok_or_else(|| IoError::variable_not_found(path))
    }

    fn owner(&self, path: &str) -> Option<Owner> {
        let path = path.trim_matches('/');
        if path.is_empty() {
            return Some(Owner::Root);
        }
        if let Some(index) = self.dataset_index(path) {
            return Some(Owner::Dataset(index));
        }
        self.group_index(path).map(Owner::Group)
    }

    fn attrs(&self, owner: Owner) -> &AttrList {
        match owner {
            Owner::Root => &self.root_attrs,
            Owner::Group(i) => &self.groups[i].attrs,
            Owner::Dataset(i) => &self.datasets[i].attrs,
        }
    }

    fn attrs_mut(&mut self, owner: Owner) -> &mut AttrList {
        match owner {
            Owner::Root => &mut self.root_attrs,
            Owner::Group(i) => &mut self.groups[i].attrs,
            Owner::Dataset(i) => &mut self.datasets[i].attrs,
        }
    }

    /// Serialize the container.
    fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        out.extend_from_slice(&MAGIC);
        out.extend_from_slice(&VERSION.to_le_bytes());
        out.push(native_order());

        let mut writer = RecordWriter {
            out: &mut out,
            path: &self.path,
        };

        for (index, group) in self.groups.iter().enumerate() {
            let mut payload = Vec::new();
            put_str(&mut payload, &group.path)?;
            writer.record(TAG_GROUP, to_ref(index)?, &payload)?;
        }

        for (index, dataset) in self.datasets.iter().enumerate() {
            let group_ref = match dataset.group.as_str() {
                "" => 0,
                group => self
                    .group_index(group)
                    .map(to_ref)
                    .transpose()?
                    .ok_or_else(|| IoError::group_not_found(group))?,
            };
            let mut payload = Vec::with_capacity(dataset.data.len() + 64);
            payload.extend_from_slice(&group_ref.to_le_bytes());
            put_str(&mut payload, &dataset.name)?;
            payload.extend_from_slice(&dataset.data_type.code().to_le_bytes());
            payload.push(dataset.dims.len() as u8);
            for dim in &dataset.dims {
                payload.extend_from_slice(&(*dim as u64).to_le_bytes());
            }
            payload.extend_from_slice(&dataset.data);
            writer.record(TAG_DATASET, to_ref(index)?, &payload)?;
        }

        let mut owners = vec![(0u16, 0u16, &self.root_attrs)];
        for (index, group) in self.groups.iter().enumerate() {
            owners.push((TAG_GROUP, to_ref(index)?, &group.attrs));
        }
        for (index, dataset) in self.datasets.iter().enumerate() {
            owners.push((TAG_DATASET, to_ref(index)?, &dataset.attrs));
        }
        let mut attr_ref = 0usize;
        for (owner_tag, owner_ref, attrs) in owners {
            for (name, value) in attrs {
                let mut payload = Vec::new();
                payload.extend_from_slice(&owner_tag.to_le_bytes());
                payload.extend_from_slice(&owner_ref.to_le_bytes());
                put_str(&mut payload, name)?;
                value.encode(&mut payload);
                writer.record(TAG_ATTRIBUTE, to_ref(attr_ref)?, &payload)?;
                attr_ref += 1;
            }
        }
        Ok(out)
    }

    /// Parse a serialized container.
    fn decode(path: &Path, bytes: &[u8]) -> Result<Self> {
        let corrupt = |reason: String| IoError::corrupt(path, reason);
        let mut cursor = Cursor::new(bytes);

        if cursor.take(4).map_err(&corrupt)? != MAGIC {
            return Err(corrupt("not a tag container".into()));
        }
        let version = cursor.u16().map_err(&corrupt)?;
        if version != VERSION {
            return Err(corrupt(format!("unsupported version {version}")));
        }
        let order = cursor.take(1).map_err(&corrupt)?[0];
        if order != native_order() {
            return Err(corrupt(format!("byte order {order} differs from this host")));
        }

        let mut store = Self::empty(path, false);
        let mut pending_attrs = Vec::new();

        while !cursor.is_done() {
            let tag = cursor.u16().map_err(&corrupt)?;
            let _ref = cursor.u16().map_err(&corrupt)?;
            let len = cursor.u32().map_err(&corrupt)? as usize;
            let mut payload = Cursor::new(cursor.take(len).map_err(&corrupt)?);
            match tag {
                TAG_GROUP => {
                    let group = payload.string().map_err(&corrupt)?;
                    store.groups.push(GroupEntry {
                        path: group,
                        attrs: Vec::new(),
                    });
                }
                TAG_DATASET => {
                    let group_ref = payload.u16().map_err(&corrupt)?;
                    let group = match group_ref {
                        0 => String::new(),
                        r => store
                            .groups
                            .get(usize::from(r) - 1)
                            .map(|g| g.path.clone())
                            .ok_or_else(|| corrupt(format!("dataset in unknown group {r}")))?,
                    };
                    let name = payload.string().map_err(&corrupt)?;
                    let code = payload.i32().map_err(&corrupt)?;
                    let data_type = TypeTag::from_code(code)
                        .filter(|t| t.is_fixed_width())
                        .ok_or_else(|| corrupt(format!("dataset {name} has type code {code}")))?;
                    let rank = usize::from(payload.take(1).map_err(&corrupt)?[0]);
                    let mut dims = Vec::with_capacity(rank);
                    for _ in 0..rank {
                        dims.push(payload.u64().map_err(&corrupt)? as usize);
                    }
                    let data = payload.rest().to_vec();
                    let expected = dims.iter().product::<usize>() * data_type.size_of();
                    if data.len() != expected {
                        return Err(corrupt(format!(
                            "dataset {name} holds {} bytes, expected {expected}",
                            data.len()
                        )));
                    }
                    store.datasets.push(Dataset {
                        group,
                        name,
                        data_type,
                        dims,
                        data,
                        attrs: Vec::new(),
                    });
                }
                TAG_ATTRIBUTE => {
                    let owner_tag = payload.u16().map_err(&corrupt)?;
                    let owner_ref = payload.u16().map_err(&corrupt)?;
                    let name = payload.string().map_err(&corrupt)?;
                    let (value, _) = AttrValue::decode(payload.rest()).map_err(&corrupt)?;
                    pending_attrs.push((owner_tag, owner_ref, name, value));
                }
                other => {
                    tracing::debug!("Skipping unknown tag {} in {}", other, path.display());
                }
            }
        }

        for (owner_tag, owner_ref, name, value) in pending_attrs {
            let index = usize::from(owner_ref).wrapping_sub(1);
            let owner = match owner_tag {
                0 => Owner::Root,
                TAG_GROUP if index < store.groups.len() => Owner::Group(index),
                TAG_DATASET if index < store.datasets.len() => Owner::Dataset(index),
                _ => {
                    return Err(corrupt(format!(
                        "attribute {name} owned by unknown object ({owner_tag}, {owner_ref})"
                    )))
                }
            };
            store.attrs_mut(owner).push((name, value));
        }
        Ok(store)
    }
}

impl Store for TagStore {
    const ENABLED: bool = true;

    fn create(path: &Path) -> Result<Self> {
        let store = Self::empty(path, true);
        let image = store.encode()?;
        fs::write(path, image).map_err(|e| IoError::file_open(path, AccessMode::Write, e))?;
        Ok(store)
    }

    fn open(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).map_err(|e| IoError::file_open(path, AccessMode::Read, e))?;
        Self::decode(path, &bytes)
    }

    fn close(self) -> Result<()> {
        if self.writable {
            let image = self.encode()?;
            fs::write(&self.path, image)?;
            tracing::debug!(
                "Wrote {} datasets, {} groups to {}",
                self.datasets.len(),
                self.groups.len(),
                self.path.display()
            );
        }
        Ok(())
    }

    fn has_group(&self, group: &str) -> bool {
        let group = group.trim_matches('/');
        group.is_empty() || self.group_index(group).is_some()
    }

    fn create_group(&mut self, group: &str) -> Result<()> {
        self.ensure_writable()?;
        let group = group.trim_matches('/');
        let mut prefix = String::new();
        for part in group.split('/').filter(|p| !p.is_empty()) {
            prefix = join_path(&prefix, part);
            if self.group_index(&prefix).is_none() {
                self.groups.push(GroupEntry {
                    path: prefix.clone(),
                    attrs: Vec::new(),
                });
            }
        }
        Ok(())
    }

    fn define_variable(
        &mut self,
        group: &str,
        name: &str,
        tag: TypeTag,
        dims: &[usize],
    ) -> Result<()> {
        self.ensure_writable()?;
        if !tag.is_fixed_width() {
            return Err(IoError::unmappable(tag, join_path(group, name)));
        }
        let path = join_path(group, name);
        if self.dataset_index(&path).is_some() {
            return Err(IoError::VariableExists { path });
        }
        self.create_group(group)?;
        let len = dims.iter().product::<usize>() * tag.size_of();
        self.datasets.push(Dataset {
            group: group.trim_matches('/').to_string(),
            name: name.to_string(),
            data_type: tag,
            dims: dims.to_vec(),
            data: vec![0; len],
            attrs: Vec::new(),
        });
        Ok(())
    }

    fn write_slab(
        &mut self,
        path: &str,
        start: &[usize],
        count: &[usize],
        data: &[u8],
    ) -> Result<()> {
        self.ensure_writable()?;
        let index = self
            .dataset_index(path)
            .ok_or_else(|| IoError::variable_not_found(path))?;
        let dataset = &mut self.datasets[index];
        let region = Region::new(start.to_vec(), count.to_vec());
        let elem = dataset.data_type.size_of();
        if data.len() != region.len() * elem {
            return Err(IoError::BufferSize {
                path: path.to_string(),
                expected: region.len() * elem,
                actual: data.len(),
            });
        }
        slab::place(&mut dataset.data, &dataset.dims, &region, data, elem)
    }

    fn read_slab(&self, path: &str, start: &[usize], count: &[usize], out: &mut [u8]) -> Result<()> {
        let dataset = self.dataset(path)?;
        let elem = dataset.data_type.size_of();
        let expected = count.iter().product::<usize>() * elem;
        if out.len() != expected {
            return Err(IoError::BufferSize {
                path: path.to_string(),
                expected,
                actual: out.len(),
            });
        }
        slab::copy_region(
            &dataset.data,
            &dataset.dims,
            start,
            out,
            count,
            &vec![0; count.len()],
            count,
            elem,
        )
    }

    fn variable_shape(&self, path: &str) -> Result<Option<VarShape>> {
        Ok(self.datasets.iter().find(|d| d.matches(path)).map(|d| VarShape {
            dims: d.dims.clone(),
            data_type: d.data_type,
            n_attr: d.attrs.len(),
        }))
    }

    fn attribute(&self, owner: &str, name: &str) -> Result<Option<AttrValue>> {
        let owner = self
            .owner(owner)
            .ok_or_else(|| IoError::group_not_found(owner))?;
        Ok(get_attr(self.attrs(owner), name))
    }

    fn put_attribute(&mut self, owner: &str, name: &str, value: &AttrValue) -> Result<()> {
        self.ensure_writable()?;
        let resolved = match self.owner(owner) {
            Some(resolved) => resolved,
            None => {
                self.create_group(owner)?;
                self.owner(owner)
                    .ok_or_else(|| IoError::group_not_found(owner))?
            }
        };
        set_attr(self.attrs_mut(resolved), name, value);
        Ok(())
    }

    fn variable_paths(&self) -> Result<Vec<String>> {
        Ok(self.datasets.iter().map(Dataset::path).collect())
    }

    fn root_attribute_names(&self) -> Result<Vec<String>> {
        Ok(self.root_attrs.iter().map(|(n, _)| n.clone()).collect())
    }
}

fn to_ref(index: usize) -> Result<u16> {
    u16::try_from(index + 1)
        .map_err(|_| IoError::InvalidShape(format!("more than {} objects of one kind", u16::MAX)))
}

fn put_str(out: &mut Vec<u8>, value: &str) -> Result<()> {
    let len = u16::try_from(value.len())
        .map_err(|_| IoError::InvalidShape(format!("name of {} bytes", value.len())))?;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(value.as_bytes());
    Ok(())
}

struct RecordWriter<'a> {
    out: &'a mut Vec<u8>,
    path: &'a Path,
}

impl RecordWriter<'_> {
    fn record(&mut self, tag: u16, reference: u16, payload: &[u8]) -> Result<()> {
        let len = u32::try_from(payload.len()).map_err(|_| {
            IoError::corrupt(
                self.path,
                format!("record of {} bytes exceeds the container limit", payload.len()),
            )
        })?;
        self.out.extend_from_slice(&tag.to_le_bytes());
        self.out.extend_from_slice(&reference.to_le_bytes());
        self.out.extend_from_slice(&len.to_le_bytes());
        self.out.extend_from_slice(payload);
        Ok(())
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn is_done(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn take(&mut self, len: usize) -> std::result::Result<&'a [u8], String> {
        let end = self.pos + len;
        let slice = self
            .bytes
            .get(self.pos..end)
            .ok_or_else(|| format!("truncated at byte {} (wanted {len})", self.pos))?;
        self.pos = end;
        Ok(slice)
    }

    fn rest(&mut self) -> &'a [u8] {
        let slice = &self.bytes[self.pos.min(self.bytes.len())..];
        self.pos = self.bytes.len();
        slice
    }

    fn u16(&mut self) -> std::result::Result<u16, String> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> std::result::Result<u32, String> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i32(&mut self) -> std::result::Result<i32, String> {
        self.u32().map(|v| v as i32)
    }

    fn u64(&mut self) -> std::result::Result<u64, String> {
        let b = self.take(8)?;
        let mut word = [0u8; 8];
        word.copy_from_slice(b);
        Ok(u64::from_le_bytes(word))
    }

    fn string(&mut self) -> std::result::Result<String, String> {
        let len = usize::from(self.u16()?);
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|e| format!("name is not UTF-8: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn floats(values: &[f32]) -> Vec<u8> {
        bytemuck::cast_slice(values).to_vec()
    }

    #[test]
    fn contents_survive_close_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run_0.hdf4");

        let mut store = TagStore::create(&path).unwrap();
        store.put_attribute("", "superSize", &AttrValue::from(1i32)).unwrap();
        store
            .define_variable("testData", "testVar", TypeTag::Float, &[2, 3])
            .unwrap();
        store
            .write_slab("testData/testVar", &[0, 0], &[2, 3], &floats(&[1., 2., 3., 4., 5., 6.]))
            .unwrap();
        store
            .put_attribute("testData/testVar", "units", &AttrValue::from("megaTests"))
            .unwrap();
        store.close().unwrap();

        let store = TagStore::open(&path).unwrap();
        assert!(store.has_group("testData"));
        assert_eq!(store.variable_paths().unwrap(), vec!["testData/testVar"]);
        assert_eq!(store.root_attribute_names().unwrap(), vec!["superSize"]);
        let shape = store.variable_shape("testData/testVar").unwrap().unwrap();
        assert_eq!(shape.dims, vec![2, 3]);
        assert_eq!(shape.data_type, TypeTag::Float);
        assert_eq!(shape.n_attr, 1);

        let mut out = vec![0u8; 8];
        store
            .read_slab("testData/testVar", &[1, 1], &[1, 2], &mut out)
            .unwrap();
        assert_eq!(out, floats(&[5., 6.]));
        assert_eq!(
            store.attribute("testData/testVar", "units").unwrap(),
            Some(AttrValue::from("megaTests"))
        );
    }

    #[test]
    fn nested_groups_are_created_with_parents() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = TagStore::create(&dir.path().join("g.hdf")).unwrap();
        store
            .put_attribute("a/b/c", "note", &AttrValue::from("x"))
            .unwrap();
        assert!(store.has_group("a"));
        assert!(store.has_group("a/b"));
        assert!(store.has_group("a/b/c"));
        assert!(matches!(
            store.attribute("a/missing", "note"),
            Err(IoError::GroupNotFound { .. })
        ));
    }

    #[test]
    fn variables_are_created_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = TagStore::create(&dir.path().join("v.hdf")).unwrap();
        store.define_variable("", "x", TypeTag::Int, &[4]).unwrap();
        assert!(matches!(
            store.define_variable("", "x", TypeTag::Int, &[4]),
            Err(IoError::VariableExists { .. })
        ));
        assert!(matches!(
            store.define_variable("", "s", TypeTag::String, &[4]),
            Err(IoError::UnmappableType { .. })
        ));
    }

    #[test]
    fn rejects_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.hdf");
        fs::write(&path, b"not a container").unwrap();
        assert!(matches!(TagStore::open(&path), Err(IoError::Corrupt { .. })));
    }

    #[test]
    fn read_only_stores_refuse_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ro.hdf");
        TagStore::create(&path).unwrap().close().unwrap();
        let mut store = TagStore::open(&path).unwrap();
        assert!(store.create_group("g").is_err());
    }

    #[test]
    fn object_refs_stop_at_the_u16_range() {
        assert_eq!(to_ref(0).unwrap(), 1);
        assert_eq!(to_ref(usize::from(u16::MAX) - 1).unwrap(), u16::MAX);
        assert!(matches!(
            to_ref(usize::from(u16::MAX)),
            Err(IoError::InvalidShape(_))
        ));
    }

    #[test]
    fn attributes_find_their_owners_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("owners.hdf");

        let mut store = TagStore::create(&path).unwrap();
        store.create_group("a").unwrap();
        store.create_group("b").unwrap();
        store.define_variable("b", "x", TypeTag::Byte, &[1]).unwrap();
        store.define_variable("a", "y", TypeTag::Byte, &[1]).unwrap();
        store.put_attribute("b", "tag", &AttrValue::from("group b")).unwrap();
        store.put_attribute("a/y", "tag", &AttrValue::from("dataset y")).unwrap();
        store.close().unwrap();

        let store = TagStore::open(&path).unwrap();
        assert_eq!(
            store.attribute("b", "tag").unwrap(),
            Some(AttrValue::from("group b"))
        );
        assert_eq!(store.attribute("a", "tag").unwrap(), None);
        assert_eq!(
            store.attribute("a/y", "tag").unwrap(),
            Some(AttrValue::from("dataset y"))
        );
        assert_eq!(store.attribute("b/x", "tag").unwrap(), None);
    }
}
