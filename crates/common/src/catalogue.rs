//! Shared-memory instrument catalogue.
//!
//! A named 32 MB region (`/dev/shm/qamddata`) enumerates the tradable
//! instruments known to the trading stack. Layout: a 64-byte header (magic,
//! version, entry count) followed by fixed 32-byte NUL-padded instrument
//! ids. The region is normally populated by an external writer and consumed
//! read-only at startup; if it does not exist we create an empty one. None
//! of this is on the quote hot path.

use crate::error::CatalogueError;
use memmap2::{Mmap, MmapMut};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const CATALOGUE_NAME: &str = "qamddata";
const REGION_SIZE: usize = 32 * 1024 * 1024;
const HEADER_SIZE: usize = 64;
const ENTRY_SIZE: usize = 32;
const MAGIC: u32 = 0x5141_4d44; // "QAMD"
const VERSION: u32 = 1;

const MAGIC_OFFSET: usize = 0;
const VERSION_OFFSET: usize = 4;
const COUNT_OFFSET: usize = 8;

fn shm_path(name: &str) -> PathBuf {
    Path::new("/dev/shm").join(name)
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn validate_header(buf: &[u8]) -> Result<(), CatalogueError> {
    if buf.len() < HEADER_SIZE {
        return Err(CatalogueError::Invalid(format!(
            "region too small: {} bytes",
            buf.len()
        )));
    }
    if read_u32(buf, MAGIC_OFFSET) != MAGIC {
        return Err(CatalogueError::Invalid("magic mismatch".into()));
    }
    if read_u32(buf, VERSION_OFFSET) != VERSION {
        return Err(CatalogueError::Invalid(format!(
            "unsupported version {}",
            read_u32(buf, VERSION_OFFSET)
        )));
    }
    Ok(())
}

enum Region {
    ReadOnly(Mmap),
    Writable(MmapMut),
}

impl Region {
    fn bytes(&self) -> &[u8] {
        match self {
            Region::ReadOnly(map) => map,
            Region::Writable(map) => map,
        }
    }
}

/// Handle to the instrument catalogue region.
pub struct Catalogue {
    region: Region,
}

impl Catalogue {
    /// Map an existing catalogue read-only.
    pub fn open() -> Result<Self, CatalogueError> {
        Self::open_path(&shm_path(CATALOGUE_NAME))
    }

    pub fn open_path(path: &Path) -> Result<Self, CatalogueError> {
        let file = OpenOptions::new().read(true).open(path)?;
        let map = unsafe { Mmap::map(&file)? };
        validate_header(&map)?;
        Ok(Self {
            region: Region::ReadOnly(map),
        })
    }

    /// Create a fresh, empty catalogue region.
    pub fn create() -> Result<Self, CatalogueError> {
        Self::create_path(&shm_path(CATALOGUE_NAME))
    }

    pub fn create_path(path: &Path) -> Result<Self, CatalogueError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(REGION_SIZE as u64)?;
        let mut map = unsafe { MmapMut::map_mut(&file)? };
        write_u32(&mut map, MAGIC_OFFSET, MAGIC);
        write_u32(&mut map, VERSION_OFFSET, VERSION);
        write_u32(&mut map, COUNT_OFFSET, 0);
        Ok(Self {
            region: Region::Writable(map),
        })
    }

    /// Open the named region, creating it when absent. A missing or
    /// malformed catalogue never aborts startup.
    pub fn open_or_create() -> Result<Self, CatalogueError> {
        match Self::open() {
            Ok(catalogue) => {
                info!(
                    instruments = catalogue.len(),
                    "connected to existing instrument catalogue"
                );
                Ok(catalogue)
            }
            Err(err) => {
                warn!(%err, "no usable instrument catalogue, creating a new one");
                Self::create()
            }
        }
    }

    pub fn capacity(&self) -> usize {
        (self.region.bytes().len() - HEADER_SIZE) / ENTRY_SIZE
    }

    pub fn len(&self) -> usize {
        read_u32(self.region.bytes(), COUNT_OFFSET) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entry(&self, index: usize) -> &str {
        let start = HEADER_SIZE + index * ENTRY_SIZE;
        let raw = &self.region.bytes()[start..start + ENTRY_SIZE];
        let end = raw.iter().position(|&b| b == 0).unwrap_or(ENTRY_SIZE);
        std::str::from_utf8(&raw[..end]).unwrap_or("")
    }

    /// Enumerate all non-empty instrument ids.
    pub fn all_instruments(&self) -> Vec<String> {
        (0..self.len().min(self.capacity()))
            .map(|i| self.entry(i))
            .filter(|id| !id.is_empty())
            .map(str::to_owned)
            .collect()
    }

    /// Case-insensitive substring search over the catalogue.
    pub fn search(&self, pattern: &str) -> Vec<String> {
        let needle = pattern.to_ascii_lowercase();
        self.all_instruments()
            .into_iter()
            .filter(|id| id.to_ascii_lowercase().contains(&needle))
            .collect()
    }

    /// Append an instrument id. Only valid on a writable handle; ids longer
    /// than an entry are truncated at the entry boundary.
    pub fn push(&mut self, raw_id: &str) -> Result<(), CatalogueError> {
        let capacity = self.capacity();
        let count = self.len();
        let map = match &mut self.region {
            Region::Writable(map) => map,
            Region::ReadOnly(_) => {
                return Err(CatalogueError::Invalid("catalogue opened read-only".into()))
            }
        };
        if count >= capacity {
            return Err(CatalogueError::Full { capacity });
        }
        let start = HEADER_SIZE + count * ENTRY_SIZE;
        let bytes = raw_id.as_bytes();
        let n = bytes.len().min(ENTRY_SIZE);
        map[start..start + n].copy_from_slice(&bytes[..n]);
        map[start + n..start + ENTRY_SIZE].fill(0);
        write_u32(map, COUNT_OFFSET, (count + 1) as u32);
        Ok(())
    }
}
