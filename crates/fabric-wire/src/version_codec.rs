//! Version maps on the wire.
//!
//! ```text
//! MAP body
//!   branch u64 | txn u64 (0 = none) | interception u64 (0 = none) | count u32
//!   count x version
//!     flags u8 | object u64
//!     [TOBJECT]  class i32 | generic count u8 | generics i32.. | length u32
//!     kind u8 (0 indexed, 1 keyed)
//!     indexed    count u32 | count x (index u32 | value)
//!     keyed      cleared u8 | count u32 | count x (op u8 | key | [value])
//! ```
//!
//! The object header travels with the first version of each object sent
//! over a connection; later versions carry only the id.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use fabric_bits::{Bits, EntryValue, KeyedTable};
use fabric_error::{FabricError, Result};
use fabric_mvcc::{Payload, Site, TObject, Version, VersionMap};
use fabric_types::{BranchId, ClassId, ConnectionId, InterceptionId, ObjectId, TxnId, Value};

use crate::buf::{InBuf, OutBuf, Progress};
use crate::command::FrameFlags;
use crate::config::WireConfig;
use crate::scalar::{ScalarReader, ScalarWriter};
use crate::value_codec::{ValueReader, stage_value};

pub const KIND_INDEXED: u8 = 0;
pub const KIND_KEYED: u8 = 1;

const OP_PUT: u8 = 0;
const OP_REMOVE: u8 = 1;

fn protocol(detail: impl Into<String>) -> FabricError {
    FabricError::Protocol {
        detail: detail.into(),
    }
}

// ---------------------------------------------------------------------------
// Object headers
// ---------------------------------------------------------------------------

/// Class and shape of an object, enough for the receiver to instantiate it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectHeader {
    pub id: ObjectId,
    pub class: ClassId,
    pub generics: Vec<ClassId>,
    pub length: u32,
    pub immutable: bool,
}

impl ObjectHeader {
    #[must_use]
    pub fn of(object: &TObject) -> Self {
        Self {
            id: object.id(),
            class: object.class_id(),
            generics: object.class().element().into_iter().collect(),
            length: object.length(),
            immutable: object.class().is_immutable(),
        }
    }
}

/// Object lookup for the codec.
pub trait ObjectResolver {
    fn resolve(&self, id: ObjectId) -> Option<Arc<TObject>>;

    /// Register an object described by a peer.
    fn import(&self, header: &ObjectHeader) -> Result<Arc<TObject>>;
}

impl ObjectResolver for Site {
    fn resolve(&self, id: ObjectId) -> Option<Arc<TObject>> {
        self.object(id)
    }

    fn import(&self, header: &ObjectHeader) -> Result<Arc<TObject>> {
        self.import_object(header.id, header.class, &header.generics, header.length)
    }
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Item {
    Field(u32, Value),
    Put(Value, Value),
    Remove(Value),
}

/// Written entries of a version: kind, cleared marker, items.
fn items_of(version: &Version) -> (u8, bool, Vec<Item>) {
    match version.payload() {
        Payload::Indexed(indexed) => {
            let items = indexed
                .writes()
                .indices()
                .into_iter()
                .map(|i| Item::Field(i, indexed.value(i).clone()))
                .collect();
            (KIND_INDEXED, false, items)
        }
        Payload::Keyed(keyed) => {
            let table = keyed.table();
            let items = table
                .entries()
                .filter_map(|entry| {
                    let key = (*entry.key()?).clone();
                    match entry.value() {
                        EntryValue::Value(_) => {
                            entry.current().map(|v| Item::Put(key, (*v).clone()))
                        }
                        EntryValue::Removal => Some(Item::Remove(key)),
                        EntryValue::Read => None,
                    }
                })
                .collect();
            (KIND_KEYED, table.is_cleared(), items)
        }
    }
}

fn wire_len(n: usize, what: &str) -> Result<u32> {
    u32::try_from(n).map_err(|_| protocol(format!("{n} {what} do not fit a frame")))
}

#[derive(Debug, Clone, Copy)]
enum WriteStep {
    Header,
    Version(usize),
    Item { version: usize, next: usize },
    Done,
}

/// Resumable encoder for one version map.
#[derive(Debug)]
pub struct MapWriter {
    map: Arc<VersionMap>,
    objects: Vec<ObjectId>,
    items: Vec<Item>,
    step: WriteStep,
}

impl MapWriter {
    /// Only versions with writes are sent.
    #[must_use]
    pub fn new(map: Arc<VersionMap>) -> Self {
        let objects = map
            .versions()
            .filter(|v| v.has_writes())
            .map(Version::object)
            .collect();
        Self {
            map,
            objects,
            items: Vec::new(),
            step: WriteStep::Header,
        }
    }

    #[must_use]
    pub fn map(&self) -> &Arc<VersionMap> {
        &self.map
    }

    /// Continue encoding into `out`. `known` holds the objects whose header
    /// the peer already has.
    pub fn write(
        &mut self,
        scalar: &mut ScalarWriter,
        out: &mut OutBuf,
        known: &mut HashSet<ObjectId>,
        resolver: &dyn ObjectResolver,
    ) -> Result<Progress> {
        loop {
            if !scalar.drain_into(out) {
                return Ok(Progress::Suspended);
            }
            match self.step {
                WriteStep::Header => {
                    scalar.put_u64(self.map.branch().get());
                    scalar.put_u64(self.map.txn().map_or(0, TxnId::get));
                    scalar.put_u64(self.map.interception().map_or(0, InterceptionId::get));
                    scalar.put_u32(wire_len(self.objects.len(), "versions")?);
                    self.step = WriteStep::Version(0);
                }
                WriteStep::Version(at) => {
                    let Some(&object) = self.objects.get(at) else {
                        self.step = WriteStep::Done;
                        continue;
                    };
                    let map = Arc::clone(&self.map);
                    let version = map.get(object).ok_or_else(|| {
                        FabricError::internal(format!("{object} vanished from its map"))
                    })?;
                    self.stage_version_head(scalar, version, known, resolver)?;
                    self.step = WriteStep::Item {
                        version: at,
                        next: 0,
                    };
                }
                WriteStep::Item { version, next } => {
                    let Some(item) = self.items.get(next) else {
                        self.step = WriteStep::Version(version + 1);
                        continue;
                    };
                    match item {
                        Item::Field(index, value) => {
                            scalar.put_u32(*index);
                            stage_value(scalar, value)?;
                        }
                        Item::Put(key, value) => {
                            scalar.put_u8(OP_PUT);
                            stage_value(scalar, key)?;
                            stage_value(scalar, value)?;
                        }
                        Item::Remove(key) => {
                            scalar.put_u8(OP_REMOVE);
                            stage_value(scalar, key)?;
                        }
                    }
                    self.step = WriteStep::Item {
                        version,
                        next: next + 1,
                    };
                }
                WriteStep::Done => return Ok(Progress::Complete),
            }
        }
    }

    fn stage_version_head(
        &mut self,
        scalar: &mut ScalarWriter,
        version: &Version,
        known: &mut HashSet<ObjectId>,
        resolver: &dyn ObjectResolver,
    ) -> Result<()> {
        let object = version.object();
        let header = if known.contains(&object) {
            None
        } else {
            let handle = resolver
                .resolve(object)
                .ok_or_else(|| FabricError::internal(format!("{object} is not registered")))?;
            known.insert(object);
            Some(ObjectHeader::of(&handle))
        };

        let mut flags = FrameFlags::empty();
        if let Some(header) = &header {
            flags |= FrameFlags::TOBJECT;
            flags.set(FrameFlags::IMMUTABLE, header.immutable);
        }
        scalar.put_u8(flags.bits());
        scalar.put_u64(object.get());
        if let Some(header) = header {
            scalar.put_i32(header.class.get());
            let generics = u8::try_from(header.generics.len())
                .map_err(|_| protocol(format!("{object} has too many generic parameters")))?;
            scalar.put_u8(generics);
            for generic in &header.generics {
                scalar.put_i32(generic.get());
            }
            scalar.put_u32(header.length);
        }

        let (kind, cleared, items) = items_of(version);
        scalar.put_u8(kind);
        if kind == KIND_KEYED {
            scalar.put_u8(u8::from(cleared));
        }
        scalar.put_u32(wire_len(items.len(), "entries")?);
        self.items = items;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadStep {
    Branch,
    Txn,
    Interception,
    Count,
    Flags,
    Object,
    Class,
    GenericCount,
    Generic,
    Length,
    Kind,
    Cleared,
    ItemCount,
    FieldIndex,
    FieldValue,
    Op,
    Key,
    EntryValue,
}

#[derive(Debug)]
enum Body {
    Indexed {
        writes: Bits,
        values: BTreeMap<u32, Value>,
    },
    Keyed { table: KeyedTable<Value, Value> },
}

/// Version being decoded.
#[derive(Debug)]
struct Current {
    flags: FrameFlags,
    object: Option<ObjectId>,
    class: ClassId,
    generics: Vec<ClassId>,
    generics_left: u8,
    target: Option<Arc<TObject>>,
    body: Option<Body>,
    items_left: u32,
    index: u32,
    op: u8,
    key: Option<Value>,
}

impl Current {
    fn new(flags: FrameFlags) -> Self {
        Self {
            flags,
            object: None,
            class: ClassId::new(0),
            generics: Vec::new(),
            generics_left: 0,
            target: None,
            body: None,
            items_left: 0,
            index: 0,
            op: OP_PUT,
            key: None,
        }
    }
}

macro_rules! want {
    ($e:expr) => {
        match $e {
            Some(v) => v,
            None => return Ok(None),
        }
    };
}

/// Resumable decoder for one version map.
#[derive(Debug)]
pub struct MapReader {
    source: ConnectionId,
    max_versions: u32,
    max_array_len: u32,
    step: ReadStep,
    scalar: ScalarReader,
    value: ValueReader,
    branch: Option<BranchId>,
    txn: Option<TxnId>,
    interception: Option<InterceptionId>,
    versions_left: u32,
    versions: Vec<Version>,
    current: Option<Current>,
}

impl MapReader {
    /// Decoded maps are tagged with `source`; sizes are bounded by
    /// `config`.
    #[must_use]
    pub fn new(source: ConnectionId, config: &WireConfig) -> Self {
        Self {
            source,
            max_versions: config.max_frame_versions,
            max_array_len: config.max_array_len,
            step: ReadStep::Branch,
            scalar: ScalarReader::new(),
            value: ValueReader::new(config.max_string_len),
            branch: None,
            txn: None,
            interception: None,
            versions_left: 0,
            versions: Vec::new(),
            current: None,
        }
    }

    fn current(&mut self) -> Result<&mut Current> {
        self.current
            .as_mut()
            .ok_or_else(|| FabricError::internal("map reader lost its version"))
    }

    /// Continue decoding; `Ok(None)` when more input is needed. Objects
    /// whose header was received are added to `known`.
    #[allow(clippy::too_many_lines)]
    pub fn read(
        &mut self,
        input: &mut InBuf,
        resolver: &dyn ObjectResolver,
        known: &mut HashSet<ObjectId>,
    ) -> Result<Option<VersionMap>> {
        loop {
            match self.step {
                ReadStep::Branch => {
                    let raw = want!(self.scalar.u64(input));
                    self.branch =
                        Some(BranchId::new(raw).ok_or_else(|| protocol("map for branch 0"))?);
                    self.step = ReadStep::Txn;
                }
                ReadStep::Txn => {
                    self.txn = TxnId::new(want!(self.scalar.u64(input)));
                    self.step = ReadStep::Interception;
                }
                ReadStep::Interception => {
                    self.interception = InterceptionId::new(want!(self.scalar.u64(input)));
                    self.step = ReadStep::Count;
                }
                ReadStep::Count => {
                    let count = want!(self.scalar.u32(input));
                    if count > self.max_versions {
                        return Err(protocol(format!(
                            "map of {count} versions exceeds limit {}",
                            self.max_versions
                        )));
                    }
                    if count == 0 {
                        return self.finish_map().map(Some);
                    }
                    self.versions_left = count;
                    self.versions.reserve(count.min(1024) as usize);
                    self.step = ReadStep::Flags;
                }
                ReadStep::Flags => {
                    let raw = want!(self.scalar.u8(input));
                    let flags = FrameFlags::from_bits(raw)
                        .filter(|f| !f.contains(FrameFlags::EOF))
                        .ok_or_else(|| protocol(format!("bad version flags {raw:#04x}")))?;
                    self.current = Some(Current::new(flags));
                    self.step = ReadStep::Object;
                }
                ReadStep::Object => {
                    let raw = want!(self.scalar.u64(input));
                    let id = ObjectId::new(raw).ok_or_else(|| protocol("version for object 0"))?;
                    let current = self.current()?;
                    current.object = Some(id);
                    if current.flags.contains(FrameFlags::TOBJECT) {
                        self.step = ReadStep::Class;
                    } else {
                        let target = resolver.resolve(id).ok_or_else(|| {
                            protocol(format!("{id} arrived without its object header"))
                        })?;
                        self.current()?.target = Some(target);
                        self.step = ReadStep::Kind;
                    }
                }
                ReadStep::Class => {
                    let class = ClassId::new(want!(self.scalar.i32(input)));
                    self.current()?.class = class;
                    self.step = ReadStep::GenericCount;
                }
                ReadStep::GenericCount => {
                    let count = want!(self.scalar.u8(input));
                    self.current()?.generics_left = count;
                    self.step = if count == 0 {
                        ReadStep::Length
                    } else {
                        ReadStep::Generic
                    };
                }
                ReadStep::Generic => {
                    let generic = ClassId::new(want!(self.scalar.i32(input)));
                    let current = self.current()?;
                    current.generics.push(generic);
                    current.generics_left -= 1;
                    if current.generics_left == 0 {
                        self.step = ReadStep::Length;
                    }
                }
                ReadStep::Length => {
                    let length = want!(self.scalar.u32(input));
                    if length > self.max_array_len {
                        return Err(protocol(format!(
                            "object length {length} exceeds limit {}",
                            self.max_array_len
                        )));
                    }
                    let current = self.current()?;
                    let id = current
                        .object
                        .ok_or_else(|| FabricError::internal("object header without id"))?;
                    let header = ObjectHeader {
                        id,
                        class: current.class,
                        generics: std::mem::take(&mut current.generics),
                        length,
                        immutable: current.flags.contains(FrameFlags::IMMUTABLE),
                    };
                    let target = resolver.import(&header)?;
                    if target.class().is_immutable() != header.immutable {
                        return Err(protocol(format!(
                            "{id}: peer and local class disagree on immutability"
                        )));
                    }
                    known.insert(id);
                    self.current()?.target = Some(target);
                    self.step = ReadStep::Kind;
                }
                ReadStep::Kind => {
                    let kind = want!(self.scalar.u8(input));
                    let current = self.current()?;
                    let target = current
                        .target
                        .as_ref()
                        .ok_or_else(|| FabricError::internal("version without target"))?;
                    match (kind, target.is_keyed()) {
                        (KIND_INDEXED, false) => {
                            current.body = Some(Body::Indexed {
                                writes: Bits::for_fields(target.length()),
                                values: BTreeMap::new(),
                            });
                            self.step = ReadStep::ItemCount;
                        }
                        (KIND_KEYED, true) => {
                            current.body = Some(Body::Keyed {
                                table: KeyedTable::new(),
                            });
                            self.step = ReadStep::Cleared;
                        }
                        (KIND_INDEXED | KIND_KEYED, _) => {
                            return Err(protocol(format!(
                                "{} sent with the wrong version kind",
                                target.id()
                            )));
                        }
                        (other, _) => {
                            return Err(protocol(format!("unknown version kind {other}")));
                        }
                    }
                }
                ReadStep::Cleared => {
                    let cleared = want!(self.scalar.u8(input));
                    if cleared > 1 {
                        return Err(protocol(format!("bad cleared marker {cleared}")));
                    }
                    if cleared == 1 {
                        if let Some(Body::Keyed { table }) = &mut self.current()?.body {
                            table.clear();
                        }
                    }
                    self.step = ReadStep::ItemCount;
                }
                ReadStep::ItemCount => {
                    let count = want!(self.scalar.u32(input));
                    let current = self.current()?;
                    current.items_left = count;
                    if count == 0 {
                        if let Some(map) = self.finish_version()? {
                            return Ok(Some(map));
                        }
                        continue;
                    }
                    self.step = match current.body {
                        Some(Body::Indexed { .. }) => ReadStep::FieldIndex,
                        _ => ReadStep::Op,
                    };
                }
                ReadStep::FieldIndex => {
                    let index = want!(self.scalar.u32(input));
                    let current = self.current()?;
                    if let Some(target) = &current.target {
                        target.check_index(index)?;
                    }
                    current.index = index;
                    self.step = ReadStep::FieldValue;
                }
                ReadStep::FieldValue => {
                    let value = want!(self.value.read(input)?);
                    let current = self.current()?;
                    let index = current.index;
                    if let Some(Body::Indexed { writes, values }) = &mut current.body {
                        values.insert(index, value);
                        writes.set(index);
                    }
                    if let Some(map) = self.next_item(ReadStep::FieldIndex)? {
                        return Ok(Some(map));
                    }
                }
                ReadStep::Op => {
                    let op = want!(self.scalar.u8(input));
                    if op != OP_PUT && op != OP_REMOVE {
                        return Err(protocol(format!("unknown entry op {op}")));
                    }
                    self.current()?.op = op;
                    self.step = ReadStep::Key;
                }
                ReadStep::Key => {
                    let key = want!(self.value.read(input)?);
                    let current = self.current()?;
                    if current.op == OP_REMOVE {
                        if let Some(Body::Keyed { table }) = &mut current.body {
                            table.put_removal(key)?;
                        }
                        if let Some(map) = self.next_item(ReadStep::Op)? {
                            return Ok(Some(map));
                        }
                    } else {
                        current.key = Some(key);
                        self.step = ReadStep::EntryValue;
                    }
                }
                ReadStep::EntryValue => {
                    let value = want!(self.value.read(input)?);
                    let current = self.current()?;
                    let key = current
                        .key
                        .take()
                        .ok_or_else(|| FabricError::internal("entry value without key"))?;
                    if let Some(Body::Keyed { table }) = &mut current.body {
                        table.put(key, value)?;
                    }
                    if let Some(map) = self.next_item(ReadStep::Op)? {
                        return Ok(Some(map));
                    }
                }
            }
        }
    }

    /// One item consumed; continue with `again` or finish the version.
    fn next_item(&mut self, again: ReadStep) -> Result<Option<VersionMap>> {
        let current = self.current()?;
        current.items_left -= 1;
        if current.items_left > 0 {
            self.step = again;
            return Ok(None);
        }
        self.finish_version()
    }

    fn finish_version(&mut self) -> Result<Option<VersionMap>> {
        let current = self
            .current
            .take()
            .ok_or_else(|| FabricError::internal("no version to finish"))?;
        let object = current
            .object
            .ok_or_else(|| FabricError::internal("version without object"))?;
        let version = match current.body {
            Some(Body::Indexed { writes, values }) => Version::indexed_delta(object, writes, values),
            Some(Body::Keyed { table }) => Version::keyed_delta(object, table),
            None => return Err(FabricError::internal("version without body")),
        };
        self.versions.push(version);
        self.versions_left -= 1;
        if self.versions_left > 0 {
            self.step = ReadStep::Flags;
            return Ok(None);
        }
        self.finish_map().map(Some)
    }

    fn finish_map(&mut self) -> Result<VersionMap> {
        let branch = self
            .branch
            .ok_or_else(|| FabricError::internal("map without branch"))?;
        let mut map = VersionMap::from_source(branch, self.source).with_position(
            0,
            self.txn,
            self.interception,
        );
        for version in self.versions.drain(..) {
            let object = version.object();
            if map.insert(version).is_some() {
                return Err(protocol(format!("{object} appears twice in one map")));
            }
        }
        self.step = ReadStep::Branch;
        Ok(map)
    }
}
