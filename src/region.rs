//! Region lifecycle: mapping providers, the fixed header, attach validation
//!
//! A region is a named byte range obtained from a [`RegionProvider`] and
//! laid out as a 48-byte header followed by `slot_count` slots. The header
//! is written once at creation; attaching processes validate magic, format
//! version, geometry and schema hash before touching any slot. Only the
//! producer mutates `write_idx`; `read_hint` is advisory.
//!
//! ```text
//! 0   magic            u32
//! 4   version          u16 (major.minor, equal-major required)
//! 6   reserved         u16
//! 8   slot_count       u32
//! 12  slot_size        u32
//! 16  schema_hash      u64
//! 24  write_idx        u64 (atomic)
//! 32  read_hint        u64 (atomic, advisory)
//! 40  producer_alive   u8
//! 41  reserved         7 bytes
//! 48  slot[0] .. slot[slot_count-1]
//! ```

use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicU8};
use std::sync::{Arc, Mutex};

use memmap2::{MmapMut, MmapOptions};
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{shm_open, shm_unlink};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;
use tracing::debug;

use crate::error::{Result, ShmError};
use crate::schema::Layout;
use crate::slot::SlotRef;

/// Region magic: "FSM1", native endian
pub const REGION_MAGIC: u32 = 0x4653_4D31;

/// On-disk format version, major in the high byte
pub const FORMAT_VERSION: u16 = 0x0100;

/// Fixed region header size preceding the slot array
pub const REGION_HEADER_SIZE: usize = 48;

const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 4;
const OFF_SLOT_COUNT: usize = 8;
const OFF_SLOT_SIZE: usize = 12;
const OFF_SCHEMA_HASH: usize = 16;
const OFF_WRITE_IDX: usize = 24;
const OFF_READ_HINT: usize = 32;
const OFF_PRODUCER_ALIVE: usize = 40;

/// A mapped byte range handed out by a provider
#[derive(Debug)]
pub struct MappedRegion {
    backing: Backing,
    len: usize,
}

#[derive(Debug)]
enum Backing {
    Mmap { map: MmapMut, _file: File },
    Heap(Arc<HeapBuf>),
}

impl MappedRegion {
    fn from_mmap(map: MmapMut, file: File) -> Self {
        let len = map.len();
        Self {
            backing: Backing::Mmap { map, _file: file },
            len,
        }
    }

    fn from_heap(buf: Arc<HeapBuf>) -> Self {
        let len = buf.len;
        Self {
            backing: Backing::Heap(buf),
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Base pointer of the mapping
    ///
    /// # Safety
    ///
    /// Callers coordinate all mutation through the slot protocol; the
    /// pointer is valid while the `MappedRegion` lives.
    pub(crate) unsafe fn as_mut_ptr_unsafe(&self) -> *mut u8 {
        match &self.backing {
            Backing::Mmap { map, .. } => map.as_ptr() as *mut u8,
            Backing::Heap(buf) => (*buf.data.get()).as_mut_ptr(),
        }
    }
}

/// Heap-allocated backing for the in-process test double
#[derive(Debug)]
pub struct HeapBuf {
    data: UnsafeCell<Box<[u8]>>,
    len: usize,
}

unsafe impl Send for HeapBuf {}
unsafe impl Sync for HeapBuf {}

/// Capability set the region manager needs from the host OS
///
/// Implementations map a name to a byte region and remove the name on
/// unlink. The default is POSIX shared memory ([`ShmProvider`]); a plain
/// file-backed provider and an in-process heap double exist for tests and
/// for hosts without `/dev/shm`.
pub trait RegionProvider: Send + Sync + std::fmt::Debug {
    /// Create a fresh region of exactly `size` bytes, failing if the name
    /// is taken
    fn create(&self, name: &str, size: usize) -> Result<MappedRegion>;

    /// Map an existing region in full
    fn open(&self, name: &str) -> Result<MappedRegion>;

    /// Remove the name from the system
    fn unlink(&self, name: &str) -> Result<()>;
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(ShmError::schema("region name cannot be empty"));
    }
    if name.len() > 200 {
        return Err(ShmError::schema(format!(
            "region name too long: {} characters",
            name.len()
        )));
    }
    if name.contains('/') || name.contains('\0') {
        return Err(ShmError::schema(format!(
            "region name '{}' must not contain '/' or NUL",
            name.escape_default()
        )));
    }
    Ok(())
}

/// POSIX shared memory provider (`shm_open` / `shm_unlink`)
#[derive(Debug, Default)]
pub struct ShmProvider;

impl ShmProvider {
    fn shm_path(name: &str) -> String {
        format!("/{}", name)
    }
}

impl RegionProvider for ShmProvider {
    fn create(&self, name: &str, size: usize) -> Result<MappedRegion> {
        validate_name(name)?;
        let path = Self::shm_path(name);
        let fd = shm_open(
            path.as_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::from_bits_truncate(0o600),
        )
        .map_err(|errno| match errno {
            Errno::EEXIST => ShmError::NameInUse {
                name: name.to_string(),
            },
            e => ShmError::provider(format!("shm_open('{}') failed: {}", path, e)),
        })?;

        ftruncate(&fd, size as i64)
            .map_err(|e| ShmError::provider(format!("ftruncate('{}') failed: {}", path, e)))?;

        let file = File::from(fd);
        let map = unsafe { MmapOptions::new().len(size).map_mut(&file) }
            .map_err(|e| ShmError::provider_io(e, "failed to map shared memory"))?;
        Ok(MappedRegion::from_mmap(map, file))
    }

    fn open(&self, name: &str) -> Result<MappedRegion> {
        validate_name(name)?;
        let path = Self::shm_path(name);
        let fd = shm_open(path.as_str(), OFlag::O_RDWR, Mode::empty()).map_err(|errno| {
            match errno {
                Errno::ENOENT => ShmError::NotFound {
                    name: name.to_string(),
                },
                e => ShmError::provider(format!("shm_open('{}') failed: {}", path, e)),
            }
        })?;

        let file = File::from(fd);
        let size = file
            .metadata()
            .map_err(|e| ShmError::provider_io(e, "failed to stat shared memory"))?
            .len() as usize;
        let map = unsafe { MmapOptions::new().len(size).map_mut(&file) }
            .map_err(|e| ShmError::provider_io(e, "failed to map shared memory"))?;
        Ok(MappedRegion::from_mmap(map, file))
    }

    fn unlink(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        let path = Self::shm_path(name);
        shm_unlink(path.as_str()).map_err(|errno| match errno {
            Errno::ENOENT => ShmError::NotFound {
                name: name.to_string(),
            },
            e => ShmError::provider(format!("shm_unlink('{}') failed: {}", path, e)),
        })
    }
}

/// File-backed provider rooted at a directory
///
/// Useful on hosts without POSIX shm and for tests that want a
/// `TempDir`-scoped namespace.
#[derive(Debug)]
pub struct FileProvider {
    dir: PathBuf,
}

impl FileProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

impl Default for FileProvider {
    fn default() -> Self {
        Self::new(std::env::temp_dir())
    }
}

impl RegionProvider for FileProvider {
    fn create(&self, name: &str, size: usize) -> Result<MappedRegion> {
        validate_name(name)?;
        let path = self.path_for(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    ShmError::NameInUse {
                        name: name.to_string(),
                    }
                } else {
                    ShmError::provider_io(e, "failed to create region file")
                }
            })?;
        file.set_len(size as u64)
            .map_err(|e| ShmError::provider_io(e, "failed to size region file"))?;
        let map = unsafe { MmapOptions::new().len(size).map_mut(&file) }
            .map_err(|e| ShmError::provider_io(e, "failed to map region file"))?;
        Ok(MappedRegion::from_mmap(map, file))
    }

    fn open(&self, name: &str) -> Result<MappedRegion> {
        validate_name(name)?;
        let path = self.path_for(name);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    ShmError::NotFound {
                        name: name.to_string(),
                    }
                } else {
                    ShmError::provider_io(e, "failed to open region file")
                }
            })?;
        let size = file
            .metadata()
            .map_err(|e| ShmError::provider_io(e, "failed to stat region file"))?
            .len() as usize;
        let map = unsafe { MmapOptions::new().len(size).map_mut(&file) }
            .map_err(|e| ShmError::provider_io(e, "failed to map region file"))?;
        Ok(MappedRegion::from_mmap(map, file))
    }

    fn unlink(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        std::fs::remove_file(self.path_for(name)).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ShmError::NotFound {
                    name: name.to_string(),
                }
            } else {
                ShmError::provider_io(e, "failed to unlink region file")
            }
        })
    }
}

/// In-process test double backed by heap allocations
///
/// Regions created and opened through the same provider instance share
/// one allocation, which is enough to exercise the full protocol across
/// threads.
#[derive(Debug, Default)]
pub struct HeapProvider {
    regions: Mutex<HashMap<String, Arc<HeapBuf>>>,
}

impl RegionProvider for HeapProvider {
    fn create(&self, name: &str, size: usize) -> Result<MappedRegion> {
        validate_name(name)?;
        let mut regions = self.regions.lock().unwrap();
        if regions.contains_key(name) {
            return Err(ShmError::NameInUse {
                name: name.to_string(),
            });
        }
        let buf = Arc::new(HeapBuf {
            data: UnsafeCell::new(vec![0u8; size].into_boxed_slice()),
            len: size,
        });
        regions.insert(name.to_string(), Arc::clone(&buf));
        Ok(MappedRegion::from_heap(buf))
    }

    fn open(&self, name: &str) -> Result<MappedRegion> {
        validate_name(name)?;
        let regions = self.regions.lock().unwrap();
        regions
            .get(name)
            .cloned()
            .map(MappedRegion::from_heap)
            .ok_or_else(|| ShmError::NotFound {
                name: name.to_string(),
            })
    }

    fn unlink(&self, name: &str) -> Result<()> {
        validate_name(name)?;
        let mut regions = self.regions.lock().unwrap();
        regions
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| ShmError::NotFound {
                name: name.to_string(),
            })
    }
}

/// Host page size
pub(crate) fn page_size() -> usize {
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz <= 0 {
        4096
    } else {
        sz as usize
    }
}

/// Exact region size: header plus slots, rounded up to the page size
pub(crate) fn required_region_size(slot_size: usize, slot_count: u32) -> usize {
    let raw = REGION_HEADER_SIZE + slot_size * slot_count as usize;
    let page = page_size();
    raw.div_ceil(page) * page
}

/// A mapped region with its header interpreted
#[derive(Debug)]
pub(crate) struct Region {
    map: MappedRegion,
    slot_size: usize,
    slot_count: u32,
}

impl Region {
    /// Initialize a freshly created mapping: header plus unwritten slots
    pub(crate) fn create(map: MappedRegion, layout: &Layout, slot_count: u32) -> Result<Self> {
        let needed = REGION_HEADER_SIZE + layout.slot_size() * slot_count as usize;
        if map.len() < needed {
            return Err(ShmError::provider(format!(
                "mapping too small: {} bytes for {} required",
                map.len(),
                needed
            )));
        }

        let base = unsafe { map.as_mut_ptr_unsafe() };
        unsafe {
            write_u32(base, OFF_MAGIC, REGION_MAGIC);
            write_u16(base, OFF_VERSION, FORMAT_VERSION);
            write_u16(base, OFF_VERSION + 2, 0);
            write_u32(base, OFF_SLOT_COUNT, slot_count);
            write_u32(base, OFF_SLOT_SIZE, layout.slot_size() as u32);
            write_u64(base, OFF_SCHEMA_HASH, layout.schema_hash());
            write_u64(base, OFF_WRITE_IDX, 0);
            write_u64(base, OFF_READ_HINT, 0);
            base.add(OFF_PRODUCER_ALIVE).write(0);
        }

        let region = Self {
            map,
            slot_size: layout.slot_size(),
            slot_count,
        };
        for i in 0..slot_count {
            region.slot(i as u64).initialize(layout.field_count());
        }
        debug!(
            slot_count,
            slot_size = layout.slot_size(),
            schema_hash = layout.schema_hash(),
            "region initialized"
        );
        Ok(region)
    }

    /// Interpret an existing mapping, validating every header field
    pub(crate) fn attach(map: MappedRegion, layout: &Layout, slot_count: u32) -> Result<Self> {
        if map.len() < REGION_HEADER_SIZE {
            return Err(ShmError::provider(format!(
                "mapping too small for region header: {} bytes",
                map.len()
            )));
        }
        let base = unsafe { map.as_mut_ptr_unsafe() };

        let magic = unsafe { read_u32(base, OFF_MAGIC) };
        if magic != REGION_MAGIC {
            return Err(ShmError::mismatch("magic", REGION_MAGIC as u64, magic as u64));
        }

        let version = unsafe { read_u16(base, OFF_VERSION) };
        if version >> 8 != FORMAT_VERSION >> 8 {
            return Err(ShmError::mismatch(
                "format version",
                FORMAT_VERSION as u64,
                version as u64,
            ));
        }

        let stored_count = unsafe { read_u32(base, OFF_SLOT_COUNT) };
        if stored_count != slot_count {
            return Err(ShmError::mismatch(
                "slot count",
                slot_count as u64,
                stored_count as u64,
            ));
        }

        let stored_size = unsafe { read_u32(base, OFF_SLOT_SIZE) };
        if stored_size as usize != layout.slot_size() {
            return Err(ShmError::mismatch(
                "slot size",
                layout.slot_size() as u64,
                stored_size as u64,
            ));
        }

        let stored_hash = unsafe { read_u64(base, OFF_SCHEMA_HASH) };
        if stored_hash != layout.schema_hash() {
            return Err(ShmError::mismatch(
                "schema hash",
                layout.schema_hash(),
                stored_hash,
            ));
        }

        let needed = REGION_HEADER_SIZE + layout.slot_size() * slot_count as usize;
        if map.len() < needed {
            return Err(ShmError::provider(format!(
                "mapping too small: {} bytes for {} required",
                map.len(),
                needed
            )));
        }

        debug!(slot_count, slot_size = layout.slot_size(), "region attached");
        Ok(Self {
            map,
            slot_size: layout.slot_size(),
            slot_count,
        })
    }

    pub(crate) fn slot_count(&self) -> u32 {
        self.slot_count
    }

    fn base(&self) -> *mut u8 {
        unsafe { self.map.as_mut_ptr_unsafe() }
    }

    /// Monotonic index of the next slot the producer will claim
    pub(crate) fn write_idx(&self) -> &AtomicU64 {
        unsafe { &*(self.base().add(OFF_WRITE_IDX) as *const AtomicU64) }
    }

    /// Advisory cursor of the most recent successful FIFO reader
    pub(crate) fn read_hint(&self) -> &AtomicU64 {
        unsafe { &*(self.base().add(OFF_READ_HINT) as *const AtomicU64) }
    }

    pub(crate) fn producer_alive(&self) -> &AtomicU8 {
        unsafe { &*(self.base().add(OFF_PRODUCER_ALIVE) as *const AtomicU8) }
    }

    /// View of slot `index` (caller supplies an already-wrapped index)
    pub(crate) fn slot(&self, index: u64) -> SlotRef {
        debug_assert!(index < self.slot_count as u64);
        let offset = REGION_HEADER_SIZE + self.slot_size * index as usize;
        unsafe { SlotRef::new(self.base().add(offset), self.slot_size) }
    }
}

unsafe fn write_u16(base: *mut u8, offset: usize, value: u16) {
    std::ptr::copy_nonoverlapping(value.to_ne_bytes().as_ptr(), base.add(offset), 2);
}

unsafe fn write_u32(base: *mut u8, offset: usize, value: u32) {
    std::ptr::copy_nonoverlapping(value.to_ne_bytes().as_ptr(), base.add(offset), 4);
}

unsafe fn write_u64(base: *mut u8, offset: usize, value: u64) {
    std::ptr::copy_nonoverlapping(value.to_ne_bytes().as_ptr(), base.add(offset), 8);
}

unsafe fn read_u16(base: *const u8, offset: usize) -> u16 {
    let mut buf = [0u8; 2];
    std::ptr::copy_nonoverlapping(base.add(offset), buf.as_mut_ptr(), 2);
    u16::from_ne_bytes(buf)
}

unsafe fn read_u32(base: *const u8, offset: usize) -> u32 {
    let mut buf = [0u8; 4];
    std::ptr::copy_nonoverlapping(base.add(offset), buf.as_mut_ptr(), 4);
    u32::from_ne_bytes(buf)
}

unsafe fn read_u64(base: *const u8, offset: usize) -> u64 {
    let mut buf = [0u8; 8];
    std::ptr::copy_nonoverlapping(base.add(offset), buf.as_mut_ptr(), 8);
    u64::from_ne_bytes(buf)
}
