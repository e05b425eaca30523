//! The indexed payload store.
//!
//! A shared memory segment holding serialized call records, addressed
//! by call id. Layout:
//!
//! ```text
//! [StoreHeader][SlotEntry; SLOT_CAP][data area .................]
//! ```
//!
//! The directory maps ids to extents in the data area; allocation is a
//! first-fit scan over the gaps between live extents. The directory is
//! the single source of truth, so a process that crashes mid-write
//! leaves at worst an unreferenced extent, never a dangling entry.
//!
//! All access must happen under the transport lock; the store performs
//! no synchronization of its own.

use crate::error::{IpcError, Result};
use crate::shm::{ShmMode, ShmSegment};

const MAGIC: u64 = 0x53544f_4b455231; // "STOKER1"
const LAYOUT_VERSION: u32 = 1;

/// Number of directory entries, bounding concurrently stored records.
pub const SLOT_CAP: usize = 512;

/// Id marking a free directory entry.
const FREE: u64 = 0;

/// The reserved slot id holding the transport header record.
pub const RESERVED_SLOT: u64 = 1;

/// First id usable for call payloads.
pub const FIRST_CALL_SLOT: u64 = 2;

#[repr(C)]
struct StoreHeader {
    magic: u64,
    version: u32,
    slot_cap: u32,
    total_len: u64,
    data_off: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct SlotEntry {
    id: u64,
    off: u64,
    len: u64,
}

/// An attached payload store.
pub struct PayloadStore {
    seg: ShmSegment,
    data_off: usize,
    data_len: usize,
}

impl PayloadStore {
    /// Attaches to (creating if necessary) the store named `name` with
    /// `size` total bytes.
    ///
    /// # Errors
    /// Rejects sizes too small to hold the directory, propagates
    /// segment failures, and reports an identity error when an existing
    /// segment carries a foreign or mismatched layout.
    pub fn attach(name: &str, size: usize) -> Result<Self> {
        let dir_bytes = std::mem::size_of::<StoreHeader>()
            + SLOT_CAP * std::mem::size_of::<SlotEntry>();
        if size < dir_bytes + 4096 {
            return Err(IpcError::Invalid(format!(
                "store size {size} below minimum {}",
                dir_bytes + 4096
            )));
        }

        let seg = ShmSegment::acquire(name, size, ShmMode::CreateOrOpen)?;
        let store = Self {
            seg,
            data_off: dir_bytes,
            data_len: size - dir_bytes,
        };

        if store.seg.created() {
            let header = store.header_mut();
            header.magic = MAGIC;
            header.version = LAYOUT_VERSION;
            header.slot_cap = SLOT_CAP as u32;
            header.total_len = size as u64;
            header.data_off = dir_bytes as u64;
            // Segment arrives zero-filled, so every entry is already FREE.
        } else {
            let header = store.header();
            if header.magic != MAGIC || header.version != LAYOUT_VERSION {
                return Err(IpcError::Identity(format!(
                    "store {name} carries an unknown layout"
                )));
            }
            if header.total_len != size as u64 {
                return Err(IpcError::Invalid(format!(
                    "store {name} is {} bytes, caller expected {size}",
                    header.total_len
                )));
            }
        }
        Ok(store)
    }

    /// Writes `bytes` at slot `id`, replacing any previous record.
    ///
    /// # Errors
    /// `StoreFull` when no contiguous extent fits, `DirectoryFull` when
    /// all entries are taken, `Invalid` for the free-marker id.
    pub fn write(&mut self, id: u64, bytes: &[u8]) -> Result<()> {
        if id == FREE {
            return Err(IpcError::Invalid("slot id 0 is reserved".into()));
        }
        self.remove(id);

        let off = self.allocate(bytes.len())?;
        unsafe {
            self.seg
                .as_mut_ptr()
                .add(off)
                .copy_from_nonoverlapping(bytes.as_ptr(), bytes.len());
        }

        let entries = self.entries_mut();
        let Some(entry) = entries.iter_mut().find(|e| e.id == FREE) else {
            return Err(IpcError::DirectoryFull(SLOT_CAP));
        };
        entry.off = off as u64;
        entry.len = bytes.len() as u64;
        entry.id = id;
        Ok(())
    }

    /// Reads the record at slot `id`, if present.
    #[must_use]
    pub fn read(&self, id: u64) -> Option<Vec<u8>> {
        let entry = *self.entries().iter().find(|e| e.id == id)?;
        let mut out = vec![0u8; entry.len as usize];
        unsafe {
            self.seg
                .as_ptr()
                .add(entry.off as usize)
                .copy_to_nonoverlapping(out.as_mut_ptr(), entry.len as usize);
        }
        Some(out)
    }

    /// Releases slot `id`; true when an entry existed.
    pub fn remove(&mut self, id: u64) -> bool {
        for entry in self.entries_mut() {
            if entry.id == id {
                entry.id = FREE;
                entry.off = 0;
                entry.len = 0;
                return true;
            }
        }
        false
    }

    /// Drops every entry (the reserved header slot included).
    pub fn clear(&mut self) {
        for entry in self.entries_mut() {
            entry.id = FREE;
            entry.off = 0;
            entry.len = 0;
        }
    }

    /// Number of live records.
    #[must_use]
    pub fn occupancy(&self) -> usize {
        self.entries().iter().filter(|e| e.id != FREE).count()
    }

    /// Bytes held by live records.
    #[must_use]
    pub fn used_bytes(&self) -> usize {
        self.entries()
            .iter()
            .filter(|e| e.id != FREE)
            .map(|e| e.len as usize)
            .sum()
    }

    /// Capacity of the data area in bytes.
    #[must_use]
    pub const fn data_len(&self) -> usize {
        self.data_len
    }

    /// Removes the kernel object backing the store named `name`.
    pub fn unlink_by_name(name: &str) {
        ShmSegment::unlink_by_name(name);
    }

    fn allocate(&self, need: usize) -> Result<usize> {
        if need == 0 {
            return Ok(self.data_off);
        }
        let mut extents: Vec<(usize, usize)> = self
            .entries()
            .iter()
            .filter(|e| e.id != FREE && e.len > 0)
            .map(|e| (e.off as usize, e.len as usize))
            .collect();
        extents.sort_unstable();

        let end = self.data_off + self.data_len;
        let mut cursor = self.data_off;
        let mut largest = 0usize;
        for (off, len) in extents {
            let gap = off.saturating_sub(cursor);
            if gap >= need {
                return Ok(cursor);
            }
            largest = largest.max(gap);
            cursor = cursor.max(off + len);
        }
        let tail = end.saturating_sub(cursor);
        if tail >= need {
            return Ok(cursor);
        }
        Err(IpcError::StoreFull {
            need,
            free: largest.max(tail),
        })
    }

    fn header(&self) -> &StoreHeader {
        unsafe { &*self.seg.as_ptr().cast::<StoreHeader>() }
    }

    #[allow(clippy::mut_from_ref)]
    fn header_mut(&self) -> &mut StoreHeader {
        unsafe { &mut *self.seg.as_mut_ptr().cast::<StoreHeader>() }
    }

    fn entries(&self) -> &[SlotEntry] {
        unsafe {
            std::slice::from_raw_parts(
                self.seg
                    .as_ptr()
                    .add(std::mem::size_of::<StoreHeader>())
                    .cast::<SlotEntry>(),
                SLOT_CAP,
            )
        }
    }

    fn entries_mut(&mut self) -> &mut [SlotEntry] {
        unsafe {
            std::slice::from_raw_parts_mut(
                self.seg
                    .as_mut_ptr()
                    .add(std::mem::size_of::<StoreHeader>())
                    .cast::<SlotEntry>(),
                SLOT_CAP,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIZE: usize = 64 * 1024;

    fn unique_name(tag: &str) -> String {
        format!("/stoker_storetest_{}_{}", tag, std::process::id())
    }

    #[test]
    fn write_read_remove() {
        let name = unique_name("wrr");
        let mut store = PayloadStore::attach(&name, SIZE).unwrap();
        store.write(2, b"hello").unwrap();
        store.write(3, b"world!").unwrap();

        assert_eq!(store.read(2).as_deref(), Some(&b"hello"[..]));
        assert_eq!(store.read(3).as_deref(), Some(&b"world!"[..]));
        assert_eq!(store.occupancy(), 2);
        assert_eq!(store.used_bytes(), 11);

        assert!(store.remove(2));
        assert!(!store.remove(2));
        assert!(store.read(2).is_none());

        ShmSegment::unlink_by_name(&name);
    }

    #[test]
    fn rewrite_replaces_record() {
        let name = unique_name("rewrite");
        let mut store = PayloadStore::attach(&name, SIZE).unwrap();
        store.write(5, b"short").unwrap();
        store.write(5, b"a considerably longer record").unwrap();
        assert_eq!(
            store.read(5).as_deref(),
            Some(&b"a considerably longer record"[..])
        );
        assert_eq!(store.occupancy(), 1);
        ShmSegment::unlink_by_name(&name);
    }

    #[test]
    fn freed_extents_are_reused() {
        let name = unique_name("reuse");
        let mut store = PayloadStore::attach(&name, SIZE).unwrap();
        let blob = vec![7u8; store.data_len() / 2];
        store.write(2, &blob).unwrap();
        // A second blob of the same size cannot fit alongside the first.
        assert!(matches!(
            store.write(3, &blob),
            Err(IpcError::StoreFull { .. })
        ));
        store.remove(2);
        store.write(3, &blob).unwrap();
        ShmSegment::unlink_by_name(&name);
    }

    #[test]
    fn second_attach_sees_records() {
        let name = unique_name("shared");
        let mut store = PayloadStore::attach(&name, SIZE).unwrap();
        store.write(9, b"persist").unwrap();

        let other = PayloadStore::attach(&name, SIZE).unwrap();
        assert_eq!(other.read(9).as_deref(), Some(&b"persist"[..]));
        ShmSegment::unlink_by_name(&name);
    }

    #[test]
    fn size_mismatch_rejected() {
        let name = unique_name("mismatch");
        let _store = PayloadStore::attach(&name, SIZE).unwrap();
        assert!(PayloadStore::attach(&name, SIZE * 2).is_err());
        ShmSegment::unlink_by_name(&name);
    }

    #[test]
    fn tiny_size_rejected() {
        assert!(PayloadStore::attach("/stoker_storetest_tiny", 128).is_err());
    }
}
