// SPDX-License-Identifier: Apache-2.0
// Copyright Authors of bpfforge

//! Map lifecycle and per-flavor typed helpers.
//!
//! [`MapHandle`] owns the kernel fd and speaks raw byte buffers sized to
//! the map's key/value widths. The typed layer ([`TypedMap`], [`Stack`],
//! [`Queue`], [`LpmTrie`], [`FdMap`]) converts domain values through
//! [`Codec`]s and enforces the per-flavor contracts.

use std::{os::fd::RawFd, path::Path, sync::Arc};

use log::{debug, info};

use crate::{
    arena::SyscallArena,
    bytes,
    errors::{BpfForgeError, KernelError, KernelErrorKind, ParseError},
    syscall::{self, BpfCmd, Syscall, layout::BATCH_COUNT},
    utils,
};

/// Kernel map type numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MapType {
    Unspec = 0,
    Hash = 1,
    Array = 2,
    ProgArray = 3,
    PerfEventArray = 4,
    PercpuHash = 5,
    PercpuArray = 6,
    StackTrace = 7,
    CgroupArray = 8,
    LruHash = 9,
    LruPercpuHash = 10,
    LpmTrie = 11,
    ArrayOfMaps = 12,
    HashOfMaps = 13,
    DevMap = 14,
    SockMap = 15,
    CpuMap = 16,
    XskMap = 17,
    SockHash = 18,
    Queue = 22,
    Stack = 23,
    DevMapHash = 25,
    RingBuf = 27,
}

impl MapType {
    pub fn is_per_cpu(self) -> bool {
        matches!(
            self,
            MapType::PercpuHash | MapType::PercpuArray | MapType::LruPercpuHash
        )
    }

    /// Maps whose values are descriptors consumed by `bpf_redirect_map`.
    pub fn is_fd_map(self) -> bool {
        matches!(
            self,
            MapType::DevMap | MapType::SockMap | MapType::CpuMap | MapType::XskMap
        )
    }
}

impl TryFrom<u32> for MapType {
    type Error = ParseError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => MapType::Unspec,
            1 => MapType::Hash,
            2 => MapType::Array,
            3 => MapType::ProgArray,
            4 => MapType::PerfEventArray,
            5 => MapType::PercpuHash,
            6 => MapType::PercpuArray,
            7 => MapType::StackTrace,
            8 => MapType::CgroupArray,
            9 => MapType::LruHash,
            10 => MapType::LruPercpuHash,
            11 => MapType::LpmTrie,
            12 => MapType::ArrayOfMaps,
            13 => MapType::HashOfMaps,
            14 => MapType::DevMap,
            15 => MapType::SockMap,
            16 => MapType::CpuMap,
            17 => MapType::XskMap,
            18 => MapType::SockHash,
            22 => MapType::Queue,
            23 => MapType::Stack,
            25 => MapType::DevMapHash,
            27 => MapType::RingBuf,
            other => {
                return Err(ParseError::InvalidMapType {
                    map: other.to_string(),
                });
            }
        })
    }
}

/// `BPF_F_NO_PREALLOC`; required for LPM tries.
pub const BPF_F_NO_PREALLOC: u32 = 1;

/// Element-update flags forwarded to the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u64)]
pub enum UpdateFlag {
    #[default]
    Any = 0,
    NoExist = 1,
    Exist = 2,
    /// Take the kernel-side per-element spinlock for the update.
    Lock = 4,
}

/// Everything the kernel needs to create a map, plus the name recorded on
/// the descriptor.
#[derive(Debug, Clone)]
pub struct MapSpec {
    pub map_type: MapType,
    pub key_size: u32,
    pub value_size: u32,
    pub max_entries: u32,
    pub flags: u32,
    pub name: String,
}

impl MapSpec {
    pub fn new(
        map_type: MapType,
        name: impl Into<String>,
        key_size: u32,
        value_size: u32,
        max_entries: u32,
    ) -> Self {
        MapSpec {
            map_type,
            key_size,
            value_size,
            max_entries,
            flags: 0,
            name: name.into(),
        }
    }

    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    pub fn hash(name: impl Into<String>, key_size: u32, value_size: u32, max_entries: u32) -> Self {
        Self::new(MapType::Hash, name, key_size, value_size, max_entries)
    }

    pub fn lru_hash(
        name: impl Into<String>,
        key_size: u32,
        value_size: u32,
        max_entries: u32,
    ) -> Self {
        Self::new(MapType::LruHash, name, key_size, value_size, max_entries)
    }

    pub fn array(name: impl Into<String>, value_size: u32, max_entries: u32) -> Self {
        Self::new(MapType::Array, name, 4, value_size, max_entries)
    }

    pub fn percpu_hash(
        name: impl Into<String>,
        key_size: u32,
        value_size: u32,
        max_entries: u32,
    ) -> Self {
        Self::new(MapType::PercpuHash, name, key_size, value_size, max_entries)
    }

    pub fn percpu_array(name: impl Into<String>, value_size: u32, max_entries: u32) -> Self {
        Self::new(MapType::PercpuArray, name, 4, value_size, max_entries)
    }

    pub fn stack(name: impl Into<String>, value_size: u32, max_entries: u32) -> Self {
        Self::new(MapType::Stack, name, 0, value_size, max_entries)
    }

    pub fn queue(name: impl Into<String>, value_size: u32, max_entries: u32) -> Self {
        Self::new(MapType::Queue, name, 0, value_size, max_entries)
    }

    /// `data_len` is the address width in bytes; the stored key carries a
    /// 32-bit little-endian prefix length in front of it.
    pub fn lpm_trie(
        name: impl Into<String>,
        data_len: u32,
        value_size: u32,
        max_entries: u32,
    ) -> Self {
        Self::new(MapType::LpmTrie, name, 4 + data_len, value_size, max_entries)
            .with_flags(BPF_F_NO_PREALLOC)
    }

    /// `capacity` must be a page-aligned power of two.
    pub fn ring_buffer(name: impl Into<String>, capacity: u32) -> Self {
        Self::new(MapType::RingBuf, name, 0, 0, capacity)
    }

    pub fn dev_map(name: impl Into<String>, max_entries: u32) -> Self {
        Self::new(MapType::DevMap, name, 4, 4, max_entries)
    }

    pub fn sock_map(name: impl Into<String>, max_entries: u32) -> Self {
        Self::new(MapType::SockMap, name, 4, 4, max_entries)
    }

    pub fn cpu_map(name: impl Into<String>, max_entries: u32) -> Self {
        Self::new(MapType::CpuMap, name, 4, 4, max_entries)
    }

    pub fn xsk_map(name: impl Into<String>, max_entries: u32) -> Self {
        Self::new(MapType::XskMap, name, 4, 4, max_entries)
    }
}

fn is_not_found(err: &BpfForgeError) -> bool {
    matches!(
        err,
        BpfForgeError::Kernel(KernelError {
            kind: KernelErrorKind::NotFound,
            ..
        })
    )
}

fn is_not_supported(err: &BpfForgeError) -> bool {
    matches!(
        err,
        BpfForgeError::Kernel(KernelError {
            kind: KernelErrorKind::NotSupported,
            ..
        }) | BpfForgeError::NotSupported(_)
    )
}

/// An owned kernel map descriptor speaking raw byte buffers.
#[derive(Debug)]
pub struct MapHandle {
    fd: RawFd,
    spec: MapSpec,
    nr_cpus: usize,
    sys: Arc<dyn Syscall>,
    closed: bool,
}

impl MapHandle {
    pub(crate) fn create(sys: Arc<dyn Syscall>, spec: MapSpec) -> Result<Self, BpfForgeError> {
        let mut spec = spec;
        match spec.map_type {
            MapType::RingBuf => {
                let page = utils::page_size() as u32;
                if spec.key_size != 0 || spec.value_size != 0 {
                    return Err(BpfForgeError::InvalidMapOperation(
                        "ring buffers take no key or value size".to_string(),
                    ));
                }
                if !spec.max_entries.is_power_of_two() || spec.max_entries % page != 0 {
                    return Err(BpfForgeError::InvalidMapOperation(format!(
                        "ring capacity {} is not a page-aligned power of two",
                        spec.max_entries
                    )));
                }
            }
            MapType::LpmTrie => {
                // The kernel rejects preallocated tries.
                spec.flags |= BPF_F_NO_PREALLOC;
                if spec.key_size < 5 {
                    return Err(BpfForgeError::InvalidMapOperation(
                        "LPM trie keys need a prefix length and at least one data byte"
                            .to_string(),
                    ));
                }
            }
            MapType::Stack | MapType::Queue => {
                if spec.key_size != 0 {
                    return Err(BpfForgeError::InvalidMapOperation(
                        "stacks and queues are keyless".to_string(),
                    ));
                }
            }
            _ => {}
        }

        let mut attr = syscall::pack_map_create(
            spec.map_type as u32,
            spec.key_size,
            spec.value_size,
            spec.max_entries,
            spec.flags,
            &spec.name,
        );
        let fd = sys.bpf(BpfCmd::MapCreate, attr.as_mut_slice())? as RawFd;
        info!(
            "created {:?} map {:?} with fd {fd}",
            spec.map_type, spec.name
        );
        Ok(MapHandle {
            fd,
            spec,
            nr_cpus: utils::nr_possible_cpus(),
            sys,
            closed: false,
        })
    }

    /// Recover a pinned map from bpffs. The kernel does not expose the
    /// spec through this path, so the caller restates it.
    pub(crate) fn from_pin(
        sys: Arc<dyn Syscall>,
        path: &Path,
        spec: MapSpec,
    ) -> Result<Self, BpfForgeError> {
        let mut arena = SyscallArena::new();
        let path_slot = arena.alloc_cstr(&utils::path_to_string(path)?);
        let mut attr = syscall::pack_obj_get(arena.addr(path_slot));
        let fd = sys.bpf(BpfCmd::ObjGet, attr.as_mut_slice())? as RawFd;
        Ok(MapHandle {
            fd,
            spec,
            nr_cpus: utils::nr_possible_cpus(),
            sys,
            closed: false,
        })
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn spec(&self) -> &MapSpec {
        &self.spec
    }

    /// Size of the buffer a lookup fills: per-CPU maps return one stride
    /// per possible CPU, 8-byte aligned.
    pub fn lookup_value_len(&self) -> usize {
        if self.spec.map_type.is_per_cpu() {
            utils::roundup8(self.spec.value_size as usize) * self.nr_cpus
        } else {
            self.spec.value_size as usize
        }
    }

    pub(crate) fn nr_cpus(&self) -> usize {
        self.nr_cpus
    }

    fn check_key(&self, key: &[u8]) -> Result<(), BpfForgeError> {
        if key.len() != self.spec.key_size as usize {
            return Err(BpfForgeError::InvalidMapOperation(format!(
                "key is {} bytes, map {:?} takes {}",
                key.len(),
                self.spec.name,
                self.spec.key_size
            )));
        }
        Ok(())
    }

    fn check_value(&self, value: &[u8]) -> Result<(), BpfForgeError> {
        if value.len() != self.lookup_value_len() {
            return Err(BpfForgeError::InvalidMapOperation(format!(
                "value is {} bytes, map {:?} takes {}",
                value.len(),
                self.spec.name,
                self.lookup_value_len()
            )));
        }
        Ok(())
    }

    pub fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>, BpfForgeError> {
        self.check_key(key)?;
        let mut arena = SyscallArena::new();
        let key_slot = arena.alloc_from(key);
        let value_slot = arena.alloc_zeroed(self.lookup_value_len());
        let mut attr = syscall::pack_map_elem(
            self.fd,
            arena.addr(key_slot),
            arena.addr(value_slot),
            0,
        );
        match self.sys.bpf(BpfCmd::MapLookupElem, attr.as_mut_slice()) {
            Ok(_) => Ok(Some(arena.bytes(value_slot).to_vec())),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn update(
        &self,
        key: &[u8],
        value: &[u8],
        flag: UpdateFlag,
    ) -> Result<(), BpfForgeError> {
        self.check_key(key)?;
        self.check_value(value)?;
        let mut arena = SyscallArena::new();
        let key_slot = arena.alloc_from(key);
        let value_slot = arena.alloc_from(value);
        let mut attr = syscall::pack_map_elem(
            self.fd,
            arena.addr(key_slot),
            arena.addr(value_slot),
            flag as u64,
        );
        self.sys.bpf(BpfCmd::MapUpdateElem, attr.as_mut_slice())?;
        Ok(())
    }

    pub fn delete(&self, key: &[u8]) -> Result<(), BpfForgeError> {
        self.check_key(key)?;
        let mut arena = SyscallArena::new();
        let key_slot = arena.alloc_from(key);
        let mut attr = syscall::pack_map_elem(self.fd, arena.addr(key_slot), 0, 0);
        self.sys.bpf(BpfCmd::MapDeleteElem, attr.as_mut_slice())?;
        Ok(())
    }

    /// `None` for `key` starts iteration; `Ok(None)` means the end was
    /// reached.
    pub fn next_key(&self, key: Option<&[u8]>) -> Result<Option<Vec<u8>>, BpfForgeError> {
        if let Some(key) = key {
            self.check_key(key)?;
        }
        let mut arena = SyscallArena::new();
        let key_addr = match key {
            Some(key) => {
                let slot = arena.alloc_from(key);
                arena.addr(slot)
            }
            None => 0,
        };
        let next_slot = arena.alloc_zeroed(self.spec.key_size as usize);
        let mut attr =
            syscall::pack_map_elem(self.fd, key_addr, arena.addr(next_slot), 0);
        match self.sys.bpf(BpfCmd::MapGetNextKey, attr.as_mut_slice()) {
            Ok(_) => Ok(Some(arena.bytes(next_slot).to_vec())),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Combined read-and-remove; the pop primitive for stacks and queues.
    pub fn lookup_and_delete(&self, key: &[u8]) -> Result<Option<Vec<u8>>, BpfForgeError> {
        self.check_key(key)?;
        let mut arena = SyscallArena::new();
        let key_slot = arena.alloc_from(key);
        let value_slot = arena.alloc_zeroed(self.lookup_value_len());
        let mut attr = syscall::pack_map_elem(
            self.fd,
            arena.addr(key_slot),
            arena.addr(value_slot),
            0,
        );
        match self
            .sys
            .bpf(BpfCmd::MapLookupAndDeleteElem, attr.as_mut_slice())
        {
            Ok(_) => Ok(Some(arena.bytes(value_slot).to_vec())),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn keys(&self) -> Keys<'_> {
        Keys {
            map: self,
            last: None,
            done: false,
        }
    }

    pub fn lookup_batch(
        &self,
        cursor: Option<BatchCursor>,
        max_count: u32,
    ) -> Result<MapBatch, BpfForgeError> {
        self.batch_read(BpfCmd::MapLookupBatch, cursor, max_count)
    }

    pub fn lookup_and_delete_batch(
        &self,
        cursor: Option<BatchCursor>,
        max_count: u32,
    ) -> Result<MapBatch, BpfForgeError> {
        self.batch_read(BpfCmd::MapLookupAndDeleteBatch, cursor, max_count)
    }

    fn batch_read(
        &self,
        cmd: BpfCmd,
        cursor: Option<BatchCursor>,
        max_count: u32,
    ) -> Result<MapBatch, BpfForgeError> {
        if let Some(BatchCursor {
            fallback: true,
            token,
        }) = &cursor
        {
            return self.batch_read_fallback(cmd, Some(token.clone()), max_count);
        }

        let key_size = self.spec.key_size as usize;
        let value_size = self.lookup_value_len();
        // Batch tokens are opaque to us: hash maps use a bucket index,
        // array-like maps use a key. Size for either.
        let token_size = key_size.max(8);

        let mut arena = SyscallArena::new();
        let in_addr = match &cursor {
            Some(cursor) => {
                let slot = arena.alloc_from(&cursor.token);
                arena.addr(slot)
            }
            None => 0,
        };
        let out_slot = arena.alloc_zeroed(token_size);
        let keys_slot = arena.alloc_zeroed(key_size * max_count as usize);
        let values_slot = arena.alloc_zeroed(value_size * max_count as usize);
        let mut attr = syscall::pack_map_batch(
            self.fd,
            in_addr,
            arena.addr(out_slot),
            arena.addr(keys_slot),
            arena.addr(values_slot),
            max_count,
            0,
        );

        let (count, exhausted) = match self.sys.bpf(cmd, attr.as_mut_slice()) {
            Ok(_) => (attr.u32_at(BATCH_COUNT), false),
            Err(e) if is_not_found(&e) => (attr.u32_at(BATCH_COUNT), true),
            Err(e) if is_not_supported(&e) => {
                debug!("{} unsupported, falling back to element ops", cmd.name());
                return self.batch_read_fallback(cmd, None, max_count);
            }
            Err(e) => return Err(e),
        };

        let count = count as usize;
        let keys = arena.bytes(keys_slot)[..count * key_size]
            .chunks_exact(key_size.max(1))
            .take(count)
            .map(<[u8]>::to_vec)
            .collect();
        let values = arena.bytes(values_slot)[..count * value_size]
            .chunks_exact(value_size.max(1))
            .take(count)
            .map(<[u8]>::to_vec)
            .collect();
        let cursor = if exhausted {
            None
        } else {
            Some(BatchCursor {
                token: arena.bytes(out_slot).to_vec(),
                fallback: false,
            })
        };
        Ok(MapBatch {
            keys,
            values,
            cursor,
        })
    }

    // Per-element emulation of the batch read commands, preserving the
    // cursor contract: the fallback token is the last key handed out.
    fn batch_read_fallback(
        &self,
        cmd: BpfCmd,
        after: Option<Vec<u8>>,
        max_count: u32,
    ) -> Result<MapBatch, BpfForgeError> {
        let delete = cmd == BpfCmd::MapLookupAndDeleteBatch;
        let mut keys = Vec::new();
        let mut values = Vec::new();
        let mut last = after;
        while keys.len() < max_count as usize {
            let next = match self.next_key(last.as_deref())? {
                Some(next) => next,
                None => {
                    return Ok(MapBatch {
                        keys,
                        values,
                        cursor: None,
                    });
                }
            };
            if let Some(value) = self.lookup(&next)? {
                if delete {
                    self.delete(&next)?;
                }
                keys.push(next.clone());
                values.push(value);
            }
            last = Some(next);
        }
        let cursor = last.map(|token| BatchCursor {
            token,
            fallback: true,
        });
        Ok(MapBatch {
            keys,
            values,
            cursor,
        })
    }

    pub fn update_batch(
        &self,
        keys: &[Vec<u8>],
        values: &[Vec<u8>],
        flag: UpdateFlag,
    ) -> Result<u32, BpfForgeError> {
        if keys.len() != values.len() {
            return Err(BpfForgeError::InvalidMapOperation(format!(
                "{} keys with {} values",
                keys.len(),
                values.len()
            )));
        }
        for (key, value) in keys.iter().zip(values) {
            self.check_key(key)?;
            self.check_value(value)?;
        }

        let mut arena = SyscallArena::new();
        let keys_slot = arena.alloc_from(&keys.concat());
        let values_slot = arena.alloc_from(&values.concat());
        let mut attr = syscall::pack_map_batch(
            self.fd,
            0,
            0,
            arena.addr(keys_slot),
            arena.addr(values_slot),
            keys.len() as u32,
            flag as u64,
        );
        match self.sys.bpf(BpfCmd::MapUpdateBatch, attr.as_mut_slice()) {
            Ok(_) => Ok(attr.u32_at(BATCH_COUNT)),
            Err(e) if is_not_supported(&e) => {
                debug!("BPF_MAP_UPDATE_BATCH unsupported, falling back");
                for (key, value) in keys.iter().zip(values) {
                    self.update(key, value, flag)?;
                }
                Ok(keys.len() as u32)
            }
            Err(e) => Err(e),
        }
    }

    pub fn delete_batch(&self, keys: &[Vec<u8>]) -> Result<u32, BpfForgeError> {
        for key in keys {
            self.check_key(key)?;
        }
        let mut arena = SyscallArena::new();
        let keys_slot = arena.alloc_from(&keys.concat());
        let mut attr = syscall::pack_map_batch(
            self.fd,
            0,
            0,
            arena.addr(keys_slot),
            0,
            keys.len() as u32,
            0,
        );
        match self.sys.bpf(BpfCmd::MapDeleteBatch, attr.as_mut_slice()) {
            Ok(_) => Ok(attr.u32_at(BATCH_COUNT)),
            Err(e) if is_not_supported(&e) => {
                debug!("BPF_MAP_DELETE_BATCH unsupported, falling back");
                for key in keys {
                    self.delete(key)?;
                }
                Ok(keys.len() as u32)
            }
            Err(e) => Err(e),
        }
    }

    pub fn pin(&self, path: &Path) -> Result<(), BpfForgeError> {
        let mut arena = SyscallArena::new();
        let path_slot = arena.alloc_cstr(&utils::path_to_string(path)?);
        let mut attr = syscall::pack_obj_pin(arena.addr(path_slot), self.fd);
        self.sys.bpf(BpfCmd::ObjPin, attr.as_mut_slice())?;
        info!("pinned map {:?} at {}", self.spec.name, path.display());
        Ok(())
    }

    /// Close the owned fd. Safe to call more than once; only the first
    /// call reaches the kernel.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.sys.close(self.fd);
        }
    }
}

impl Drop for MapHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Opaque batch-iteration cursor; feed the cursor from one call into the
/// next to continue the walk.
#[derive(Debug, Clone)]
pub struct BatchCursor {
    token: Vec<u8>,
    fallback: bool,
}

#[derive(Debug)]
pub struct MapBatch {
    pub keys: Vec<Vec<u8>>,
    pub values: Vec<Vec<u8>>,
    /// `None` once the map is exhausted.
    pub cursor: Option<BatchCursor>,
}

/// Raw key iterator over [`MapHandle::next_key`].
pub struct Keys<'a> {
    map: &'a MapHandle,
    last: Option<Vec<u8>>,
    done: bool,
}

impl Iterator for Keys<'_> {
    type Item = Result<Vec<u8>, BpfForgeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.map.next_key(self.last.as_deref()) {
            Ok(Some(key)) => {
                self.last = Some(key.clone());
                Some(Ok(key))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Conversion between a domain value and the exact-size byte buffer the
/// kernel exchanges.
pub trait Codec {
    type Item;

    fn size(&self) -> u32;
    fn encode(&self, item: &Self::Item) -> Vec<u8>;
    fn decode(&self, raw: &[u8]) -> Result<Self::Item, BpfForgeError>;
}

fn short_buffer<T>(want: u32, got: usize) -> Result<T, BpfForgeError> {
    Err(BpfForgeError::InvalidMapOperation(format!(
        "expected {want} bytes, got {got}"
    )))
}

macro_rules! int_codec {
    ($name:ident, $ty:ty) => {
        #[derive(Debug, Clone, Copy, Default)]
        pub struct $name;

        impl Codec for $name {
            type Item = $ty;

            fn size(&self) -> u32 {
                size_of::<$ty>() as u32
            }

            fn encode(&self, item: &$ty) -> Vec<u8> {
                item.to_le_bytes().to_vec()
            }

            fn decode(&self, raw: &[u8]) -> Result<$ty, BpfForgeError> {
                match raw.try_into() {
                    Ok(raw) => Ok(<$ty>::from_le_bytes(raw)),
                    Err(_) => short_buffer(self.size(), raw.len()),
                }
            }
        }
    };
}

int_codec!(U32Codec, u32);
int_codec!(U64Codec, u64);
int_codec!(I32Codec, i32);
int_codec!(I64Codec, i64);

/// Identity codec for fixed-size opaque values.
#[derive(Debug, Clone, Copy)]
pub struct BytesCodec {
    pub len: u32,
}

impl Codec for BytesCodec {
    type Item = Vec<u8>;

    fn size(&self) -> u32 {
        self.len
    }

    fn encode(&self, item: &Vec<u8>) -> Vec<u8> {
        item.clone()
    }

    fn decode(&self, raw: &[u8]) -> Result<Vec<u8>, BpfForgeError> {
        if raw.len() == self.len as usize {
            Ok(raw.to_vec())
        } else {
            short_buffer(self.len, raw.len())
        }
    }
}

/// Typed view over hash, LRU-hash, array and per-CPU maps.
#[derive(Debug)]
pub struct TypedMap<KC: Codec, VC: Codec> {
    map: MapHandle,
    key_codec: KC,
    value_codec: VC,
}

impl<KC: Codec, VC: Codec> TypedMap<KC, VC> {
    pub fn new(map: MapHandle, key_codec: KC, value_codec: VC) -> Result<Self, BpfForgeError> {
        if key_codec.size() != map.spec().key_size {
            return Err(BpfForgeError::InvalidMapOperation(format!(
                "key codec is {} bytes, map takes {}",
                key_codec.size(),
                map.spec().key_size
            )));
        }
        if value_codec.size() != map.spec().value_size {
            return Err(BpfForgeError::InvalidMapOperation(format!(
                "value codec is {} bytes, map takes {}",
                value_codec.size(),
                map.spec().value_size
            )));
        }
        Ok(TypedMap {
            map,
            key_codec,
            value_codec,
        })
    }

    pub fn inner(&self) -> &MapHandle {
        &self.map
    }

    pub fn into_inner(self) -> MapHandle {
        self.map
    }

    fn reject_per_cpu(&self) -> Result<(), BpfForgeError> {
        if self.map.spec().map_type.is_per_cpu() {
            return Err(BpfForgeError::InvalidMapOperation(
                "per-CPU map: use the per-CPU accessors".to_string(),
            ));
        }
        Ok(())
    }

    pub fn get(&self, key: &KC::Item) -> Result<Option<VC::Item>, BpfForgeError> {
        self.reject_per_cpu()?;
        self.map
            .lookup(&self.key_codec.encode(key))?
            .map(|raw| self.value_codec.decode(&raw))
            .transpose()
    }

    /// Per-CPU lookup: one decoded value per possible CPU.
    pub fn get_per_cpu(&self, key: &KC::Item) -> Result<Option<Vec<VC::Item>>, BpfForgeError> {
        let raw = match self.map.lookup(&self.key_codec.encode(key))? {
            Some(raw) => raw,
            None => return Ok(None),
        };
        let stride = utils::roundup8(self.map.spec().value_size as usize);
        let width = self.map.spec().value_size as usize;
        let mut values = Vec::with_capacity(self.map.nr_cpus());
        for cpu in 0..self.map.nr_cpus() {
            let at = cpu * stride;
            values.push(self.value_codec.decode(&raw[at..at + width])?);
        }
        Ok(Some(values))
    }

    pub fn insert(
        &self,
        key: &KC::Item,
        value: &VC::Item,
        flag: UpdateFlag,
    ) -> Result<(), BpfForgeError> {
        self.reject_per_cpu()?;
        self.map.update(
            &self.key_codec.encode(key),
            &self.value_codec.encode(value),
            flag,
        )
    }

    /// Per-CPU update; `values` must hold one entry per possible CPU.
    pub fn insert_per_cpu(
        &self,
        key: &KC::Item,
        values: &[VC::Item],
        flag: UpdateFlag,
    ) -> Result<(), BpfForgeError> {
        if values.len() != self.map.nr_cpus() {
            return Err(BpfForgeError::InvalidMapOperation(format!(
                "{} values for {} possible CPUs",
                values.len(),
                self.map.nr_cpus()
            )));
        }
        let stride = utils::roundup8(self.map.spec().value_size as usize);
        let mut raw = vec![0u8; self.map.lookup_value_len()];
        for (cpu, value) in values.iter().enumerate() {
            let encoded = self.value_codec.encode(value);
            raw[cpu * stride..cpu * stride + encoded.len()].copy_from_slice(&encoded);
        }
        self.map.update(&self.key_codec.encode(key), &raw, flag)
    }

    pub fn remove(&self, key: &KC::Item) -> Result<(), BpfForgeError> {
        self.map.delete(&self.key_codec.encode(key))
    }

    pub fn keys(&self) -> impl Iterator<Item = Result<KC::Item, BpfForgeError>> + '_ {
        self.map
            .keys()
            .map(|key| key.and_then(|raw| self.key_codec.decode(&raw)))
    }

    pub fn iter(
        &self,
    ) -> impl Iterator<Item = Result<(KC::Item, VC::Item), BpfForgeError>> + '_ {
        self.map.keys().filter_map(move |key| {
            let raw_key = match key {
                Ok(raw) => raw,
                Err(e) => return Some(Err(e)),
            };
            match self.map.lookup(&raw_key) {
                // Racing deletes drop the entry from the walk.
                Ok(None) => None,
                Ok(Some(raw_value)) => Some(
                    self.key_codec
                        .decode(&raw_key)
                        .and_then(|k| Ok((k, self.value_codec.decode(&raw_value)?))),
                ),
                Err(e) => Some(Err(e)),
            }
        })
    }
}

/// LIFO map: push/pop/peek, absence is `None`, never an error.
#[derive(Debug)]
pub struct Stack<VC: Codec> {
    map: MapHandle,
    codec: VC,
}

/// FIFO map with the same surface as [`Stack`].
#[derive(Debug)]
pub struct Queue<VC: Codec> {
    map: MapHandle,
    codec: VC,
}

macro_rules! keyless_ops {
    ($name:ident, $want:expr) => {
        impl<VC: Codec> $name<VC> {
            pub fn new(map: MapHandle, codec: VC) -> Result<Self, BpfForgeError> {
                if map.spec().map_type != $want {
                    return Err(BpfForgeError::InvalidMapOperation(format!(
                        "{:?} is not a {:?} map",
                        map.spec().map_type,
                        $want
                    )));
                }
                if codec.size() != map.spec().value_size {
                    return Err(BpfForgeError::InvalidMapOperation(format!(
                        "value codec is {} bytes, map takes {}",
                        codec.size(),
                        map.spec().value_size
                    )));
                }
                Ok(Self { map, codec })
            }

            pub fn inner(&self) -> &MapHandle {
                &self.map
            }

            /// Fails with the kernel's too-big error when full.
            pub fn push(&self, value: &VC::Item) -> Result<(), BpfForgeError> {
                self.map.update(&[], &self.codec.encode(value), UpdateFlag::Any)
            }

            /// Replaces the oldest element instead of failing when full.
            pub fn force_push(&self, value: &VC::Item) -> Result<(), BpfForgeError> {
                self.map
                    .update(&[], &self.codec.encode(value), UpdateFlag::Exist)
            }

            pub fn pop(&self) -> Result<Option<VC::Item>, BpfForgeError> {
                self.map
                    .lookup_and_delete(&[])?
                    .map(|raw| self.codec.decode(&raw))
                    .transpose()
            }

            pub fn peek(&self) -> Result<Option<VC::Item>, BpfForgeError> {
                self.map
                    .lookup(&[])?
                    .map(|raw| self.codec.decode(&raw))
                    .transpose()
            }
        }
    };
}

keyless_ops!(Stack, MapType::Stack);
keyless_ops!(Queue, MapType::Queue);

/// Longest-prefix-match trie. Keys are `[prefix_len_le32 | address]`.
#[derive(Debug)]
pub struct LpmTrie<VC: Codec> {
    map: MapHandle,
    codec: VC,
    data_len: usize,
}

impl<VC: Codec> LpmTrie<VC> {
    pub fn new(map: MapHandle, codec: VC) -> Result<Self, BpfForgeError> {
        if map.spec().map_type != MapType::LpmTrie {
            return Err(BpfForgeError::InvalidMapOperation(format!(
                "{:?} is not an LPM trie",
                map.spec().map_type
            )));
        }
        if codec.size() != map.spec().value_size {
            return Err(BpfForgeError::InvalidMapOperation(format!(
                "value codec is {} bytes, map takes {}",
                codec.size(),
                map.spec().value_size
            )));
        }
        let data_len = map.spec().key_size as usize - 4;
        Ok(LpmTrie {
            map,
            codec,
            data_len,
        })
    }

    pub fn inner(&self) -> &MapHandle {
        &self.map
    }

    fn key(&self, prefix_len: u32, addr: &[u8]) -> Result<Vec<u8>, BpfForgeError> {
        if addr.len() != self.data_len {
            return Err(BpfForgeError::InvalidMapOperation(format!(
                "address is {} bytes, trie stores {}",
                addr.len(),
                self.data_len
            )));
        }
        if prefix_len as usize > self.data_len * 8 {
            return Err(BpfForgeError::InvalidMapOperation(format!(
                "prefix length {prefix_len} exceeds {} bits",
                self.data_len * 8
            )));
        }
        let mut key = Vec::with_capacity(4 + self.data_len);
        key.extend_from_slice(&prefix_len.to_le_bytes());
        key.extend_from_slice(addr);
        Ok(key)
    }

    pub fn insert(
        &self,
        prefix_len: u32,
        addr: &[u8],
        value: &VC::Item,
    ) -> Result<(), BpfForgeError> {
        self.map.update(
            &self.key(prefix_len, addr)?,
            &self.codec.encode(value),
            UpdateFlag::Any,
        )
    }

    pub fn remove(&self, prefix_len: u32, addr: &[u8]) -> Result<(), BpfForgeError> {
        self.map.delete(&self.key(prefix_len, addr)?)
    }

    /// Value of the longest stored prefix covering `addr`, if any.
    pub fn lookup(&self, addr: &[u8]) -> Result<Option<VC::Item>, BpfForgeError> {
        let key = self.key(self.data_len as u32 * 8, addr)?;
        self.map
            .lookup(&key)?
            .map(|raw| self.codec.decode(&raw))
            .transpose()
    }
}

/// Integer-indexed fd maps (sockmap, devmap, cpumap, xskmap) feeding
/// `bpf_redirect_map`.
#[derive(Debug)]
pub struct FdMap {
    map: MapHandle,
}

impl FdMap {
    pub fn new(map: MapHandle) -> Result<Self, BpfForgeError> {
        if !map.spec().map_type.is_fd_map() {
            return Err(BpfForgeError::InvalidMapOperation(format!(
                "{:?} does not hold descriptors",
                map.spec().map_type
            )));
        }
        Ok(FdMap { map })
    }

    pub fn inner(&self) -> &MapHandle {
        &self.map
    }

    pub fn set(&self, index: u32, fd: RawFd) -> Result<(), BpfForgeError> {
        self.map.update(
            &index.to_le_bytes(),
            &(fd as u32).to_le_bytes(),
            UpdateFlag::Any,
        )
    }

    pub fn clear(&self, index: u32) -> Result<(), BpfForgeError> {
        self.map.delete(&index.to_le_bytes())
    }

    pub fn get(&self, index: u32) -> Result<Option<u32>, BpfForgeError> {
        Ok(self
            .map
            .lookup(&index.to_le_bytes())?
            .and_then(|raw| bytes::get_u32(&raw, 0)))
    }
}
