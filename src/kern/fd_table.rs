//! Per-process file descriptor table
//!
//! A descriptor is a slot holding a shared [`OpenFileDescription`] plus its
//! own close-on-exec flag. Descriptions are shared by `dup`, `dup2` and fork,
//! so the offset and access mode travel with them.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::error::{KernResult, KernelError};
use crate::kern::pipe::Pipe;
use crate::kern::scheduler::Scheduler;

// ============================================================================
// Open flags
// ============================================================================

/// Access mode and descriptor flags passed when opening
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenFlags(u32);

impl OpenFlags {
    pub const READ: Self = Self(0x1);
    pub const WRITE: Self = Self(0x2);
    pub const READ_WRITE: Self = Self(0x3);
    /// Close the descriptor on exec
    pub const CLOEXEC: Self = Self(0x10);

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    const fn access(self) -> Self {
        Self(self.0 & Self::READ_WRITE.0)
    }
}

// ============================================================================
// Open file description
// ============================================================================

/// What a description refers to
pub enum FileObject {
    PipeRead(Arc<Pipe>),
    PipeWrite(Arc<Pipe>),
    /// File opened through the filesystem layer, I/O is not handled here
    Path(String),
}

/// State shared by every descriptor that refers to one open
pub struct OpenFileDescription {
    object: FileObject,
    access: OpenFlags,
    offset: AtomicU64,
}

impl OpenFileDescription {
    fn new(object: FileObject, access: OpenFlags) -> Self {
        Self {
            object,
            access: access.access(),
            offset: AtomicU64::new(0),
        }
    }

    pub fn object(&self) -> &FileObject {
        &self.object
    }

    pub fn access(&self) -> OpenFlags {
        self.access
    }

    pub fn offset(&self) -> u64 {
        self.offset.load(Ordering::Relaxed)
    }

    fn pipe_writer(&self) -> Option<&Arc<Pipe>> {
        match &self.object {
            FileObject::PipeWrite(pipe) => Some(pipe),
            _ => None,
        }
    }

    pub fn read(&self, scheduler: &Scheduler, buf: &mut [u8]) -> KernResult<usize> {
        if !self.access.contains(OpenFlags::READ) {
            return Err(KernelError::BadFileDescriptor);
        }
        match &self.object {
            FileObject::PipeRead(pipe) => pipe.read(scheduler, buf),
            _ => Err(KernelError::NotSupported),
        }
    }

    pub fn write(&self, scheduler: &Scheduler, data: &[u8]) -> KernResult<usize> {
        if !self.access.contains(OpenFlags::WRITE) {
            return Err(KernelError::BadFileDescriptor);
        }
        match &self.object {
            FileObject::PipeWrite(pipe) => pipe.write(scheduler, data),
            _ => Err(KernelError::NotSupported),
        }
    }
}

// ============================================================================
// Descriptor table
// ============================================================================

#[derive(Clone)]
struct Descriptor {
    description: Arc<OpenFileDescription>,
    cloexec: bool,
}

impl Descriptor {
    /// Every descriptor of a pipe's write end counts as one writer
    fn opened(self) -> Self {
        if let Some(pipe) = self.description.pipe_writer() {
            pipe.add_writer();
        }
        self
    }

    fn closed(self, scheduler: &Scheduler) {
        if let Some(pipe) = self.description.pipe_writer() {
            pipe.close_writing(scheduler);
        }
    }
}

pub struct FdTable {
    slots: Vec<Option<Descriptor>>,
}

impl FdTable {
    /// Empty table with `max_open_files` slots
    pub fn new(max_open_files: usize) -> KernResult<FdTable> {
        let mut slots = Vec::new();
        slots.try_reserve_exact(max_open_files)?;
        slots.resize(max_open_files, None);
        Ok(FdTable { slots })
    }

    fn slot(&self, fd: i32) -> KernResult<&Descriptor> {
        usize::try_from(fd)
            .ok()
            .and_then(|index| self.slots.get(index))
            .and_then(Option::as_ref)
            .ok_or(KernelError::BadFileDescriptor)
    }

    fn slot_mut(&mut self, fd: i32) -> KernResult<&mut Descriptor> {
        usize::try_from(fd)
            .ok()
            .and_then(|index| self.slots.get_mut(index))
            .and_then(Option::as_mut)
            .ok_or(KernelError::BadFileDescriptor)
    }

    /// The `N` lowest free slots
    fn free_slots<const N: usize>(&self) -> KernResult<[usize; N]> {
        let mut found = [0usize; N];
        let mut free = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_none())
            .map(|(index, _)| index);
        for entry in found.iter_mut() {
            *entry = free.next().ok_or(KernelError::TooManyOpenFiles)?;
        }
        Ok(found)
    }

    fn place(&mut self, index: usize, descriptor: Descriptor) -> i32 {
        debug_assert!(self.slots[index].is_none());
        self.slots[index] = Some(descriptor.opened());
        index as i32
    }

    /// Install an already open description in the lowest free slot
    pub fn install(&mut self, description: Arc<OpenFileDescription>, cloexec: bool) -> KernResult<i32> {
        let [index] = self.free_slots::<1>()?;
        Ok(self.place(index, Descriptor { description, cloexec }))
    }

    /// Install a description for a filesystem path
    pub fn install_path(&mut self, path: &str, flags: OpenFlags) -> KernResult<i32> {
        let mut owned = String::new();
        owned.try_reserve_exact(path.len())?;
        owned.push_str(path);
        let description = Arc::new(OpenFileDescription::new(FileObject::Path(owned), flags));
        self.install(description, flags.contains(OpenFlags::CLOEXEC))
    }

    /// New pipe; returns `[read_fd, write_fd]`
    pub fn pipe(&mut self) -> KernResult<[i32; 2]> {
        let [read_index, write_index] = self.free_slots::<2>()?;
        let pipe = Arc::new(Pipe::new());
        let read_end = OpenFileDescription::new(FileObject::PipeRead(pipe.clone()), OpenFlags::READ);
        let write_end = OpenFileDescription::new(FileObject::PipeWrite(pipe), OpenFlags::WRITE);
        let read_fd = self.place(
            read_index,
            Descriptor {
                description: Arc::new(read_end),
                cloexec: false,
            },
        );
        let write_fd = self.place(
            write_index,
            Descriptor {
                description: Arc::new(write_end),
                cloexec: false,
            },
        );
        Ok([read_fd, write_fd])
    }

    pub fn description(&self, fd: i32) -> KernResult<Arc<OpenFileDescription>> {
        self.slot(fd).map(|descriptor| descriptor.description.clone())
    }

    /// Copy `fd` into the lowest free slot; the copy starts without
    /// close-on-exec
    pub fn dup(&mut self, fd: i32) -> KernResult<i32> {
        let description = self.slot(fd)?.description.clone();
        self.install(description, false)
    }

    /// Make `new_fd` refer to what `old_fd` refers to, closing it first if
    /// open; returns `new_fd`
    pub fn dup2(&mut self, scheduler: &Scheduler, old_fd: i32, new_fd: i32) -> KernResult<i32> {
        let description = self.slot(old_fd)?.description.clone();
        let index = usize::try_from(new_fd)
            .ok()
            .filter(|&index| index < self.slots.len())
            .ok_or(KernelError::BadFileDescriptor)?;
        if old_fd == new_fd {
            return Ok(new_fd);
        }
        if let Some(previous) = self.slots[index].take() {
            previous.closed(scheduler);
        }
        Ok(self.place(
            index,
            Descriptor {
                description,
                cloexec: false,
            },
        ))
    }

    pub fn close(&mut self, scheduler: &Scheduler, fd: i32) -> KernResult<()> {
        self.slot(fd)?;
        if let Some(descriptor) = self.slots[fd as usize].take() {
            descriptor.closed(scheduler);
        }
        Ok(())
    }

    pub fn close_all(&mut self, scheduler: &Scheduler) {
        for slot in self.slots.iter_mut() {
            if let Some(descriptor) = slot.take() {
                descriptor.closed(scheduler);
            }
        }
    }

    /// Exec: close every descriptor marked close-on-exec
    pub fn close_cloexec(&mut self, scheduler: &Scheduler) {
        for slot in self.slots.iter_mut() {
            if slot.as_ref().is_some_and(|descriptor| descriptor.cloexec) {
                if let Some(descriptor) = slot.take() {
                    descriptor.closed(scheduler);
                }
            }
        }
    }

    pub fn set_cloexec(&mut self, fd: i32, cloexec: bool) -> KernResult<()> {
        self.slot_mut(fd)?.cloexec = cloexec;
        Ok(())
    }

    pub fn get_cloexec(&self, fd: i32) -> KernResult<bool> {
        self.slot(fd).map(|descriptor| descriptor.cloexec)
    }

    /// Seek a description to the absolute offset `offset`
    pub fn seek(&self, fd: i32, offset: u64) -> KernResult<u64> {
        let descriptor = self.slot(fd)?;
        match descriptor.description.object {
            FileObject::Path(_) => {
                descriptor.description.offset.store(offset, Ordering::Relaxed);
                Ok(offset)
            }
            _ => Err(KernelError::InvalidArgument),
        }
    }

    /// Fork copy: same descriptions, same flags
    pub fn try_clone(&self) -> KernResult<FdTable> {
        let mut slots = Vec::new();
        slots.try_reserve_exact(self.slots.len())?;
        slots.extend(
            self.slots
                .iter()
                .map(|slot| slot.clone().map(Descriptor::opened)),
        );
        Ok(FdTable { slots })
    }

    pub fn open_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    fn pipe_of(table: &FdTable, fd: i32) -> Arc<Pipe> {
        match table.description(fd).unwrap().object() {
            FileObject::PipeRead(pipe) | FileObject::PipeWrite(pipe) => pipe.clone(),
            FileObject::Path(_) => panic!("not a pipe"),
        }
    }

    #[test]
    fn test_lowest_free_slot() {
        let kernel = testing::boot();
        let mut table = FdTable::new(8).unwrap();
        assert_eq!(table.install_path("/a", OpenFlags::READ).unwrap(), 0);
        assert_eq!(table.install_path("/b", OpenFlags::READ).unwrap(), 1);
        assert_eq!(table.install_path("/c", OpenFlags::READ).unwrap(), 2);
        table.close(&kernel.scheduler, 1).unwrap();
        assert_eq!(table.install_path("/d", OpenFlags::READ).unwrap(), 1);
        assert_eq!(table.open_count(), 3);
    }

    #[test]
    fn test_table_full() {
        let mut table = FdTable::new(2).unwrap();
        table.install_path("/a", OpenFlags::READ).unwrap();
        assert_eq!(table.pipe().unwrap_err(), KernelError::TooManyOpenFiles);
        // A failed pipe leaves nothing behind
        assert_eq!(table.open_count(), 1);
        table.install_path("/b", OpenFlags::READ).unwrap();
        assert_eq!(
            table.install_path("/c", OpenFlags::READ).unwrap_err(),
            KernelError::TooManyOpenFiles
        );
    }

    #[test]
    fn test_bad_descriptors() {
        let kernel = testing::boot();
        let mut table = FdTable::new(4).unwrap();
        assert_eq!(table.close(&kernel.scheduler, 0).unwrap_err(), KernelError::BadFileDescriptor);
        assert_eq!(table.close(&kernel.scheduler, -1).unwrap_err(), KernelError::BadFileDescriptor);
        assert_eq!(table.dup(7).unwrap_err(), KernelError::BadFileDescriptor);
        let fd = table.install_path("/a", OpenFlags::READ).unwrap();
        assert_eq!(
            table.dup2(&kernel.scheduler, fd, 4).unwrap_err(),
            KernelError::BadFileDescriptor
        );
    }

    #[test]
    fn test_pipe_writer_accounting() {
        let kernel = testing::boot();
        let mut table = FdTable::new(8).unwrap();
        let [read_fd, write_fd] = table.pipe().unwrap();
        let pipe = pipe_of(&table, read_fd);
        assert_eq!(pipe.writers(), 1);

        let copy = table.dup(write_fd).unwrap();
        assert_eq!(pipe.writers(), 2);

        let mut forked = table.try_clone().unwrap();
        assert_eq!(pipe.writers(), 4);

        forked.close_all(&kernel.scheduler);
        assert_eq!(pipe.writers(), 2);
        table.close(&kernel.scheduler, copy).unwrap();
        table.close(&kernel.scheduler, write_fd).unwrap();
        assert_eq!(pipe.writers(), 0);
    }

    #[test]
    fn test_dup2_replaces_and_clears_cloexec() {
        let kernel = testing::boot();
        let mut table = FdTable::new(8).unwrap();
        let a = table.install_path("/a", OpenFlags::READ.union(OpenFlags::CLOEXEC)).unwrap();
        let b = table.install_path("/b", OpenFlags::READ).unwrap();
        assert!(table.get_cloexec(a).unwrap());

        assert_eq!(table.dup2(&kernel.scheduler, a, b).unwrap(), b);
        assert!(!table.get_cloexec(b).unwrap());
        assert!(Arc::ptr_eq(
            &table.description(a).unwrap(),
            &table.description(b).unwrap()
        ));
        // Same descriptor: nothing changes
        assert_eq!(table.dup2(&kernel.scheduler, a, a).unwrap(), a);
        assert!(table.get_cloexec(a).unwrap());

        // Past the end of the table is not a descriptor
        assert_eq!(
            table.dup2(&kernel.scheduler, a, 64).unwrap_err(),
            KernelError::BadFileDescriptor
        );
    }

    #[test]
    fn test_close_cloexec() {
        let kernel = testing::boot();
        let mut table = FdTable::new(8).unwrap();
        let [read_fd, write_fd] = table.pipe().unwrap();
        let pipe = pipe_of(&table, read_fd);
        table.set_cloexec(write_fd, true).unwrap();
        let kept = table.install_path("/kept", OpenFlags::READ).unwrap();

        table.close_cloexec(&kernel.scheduler);
        assert_eq!(table.description(write_fd).err(), Some(KernelError::BadFileDescriptor));
        assert!(table.description(read_fd).is_ok());
        assert!(table.description(kept).is_ok());
        assert_eq!(pipe.writers(), 0);
    }

    #[test]
    fn test_shared_offset_after_dup() {
        let mut table = FdTable::new(4).unwrap();
        let fd = table.install_path("/file", OpenFlags::READ_WRITE).unwrap();
        let copy = table.dup(fd).unwrap();
        table.seek(fd, 42).unwrap();
        assert_eq!(table.description(copy).unwrap().offset(), 42);

        let [read_fd, _] = table.pipe().unwrap();
        assert_eq!(table.seek(read_fd, 1).unwrap_err(), KernelError::InvalidArgument);
    }

    #[test]
    fn test_access_mode_checked() {
        let kernel = testing::boot();
        let mut table = FdTable::new(4).unwrap();
        let [read_fd, write_fd] = table.pipe().unwrap();
        let read_end = table.description(read_fd).unwrap();
        let write_end = table.description(write_fd).unwrap();
        assert_eq!(
            read_end.write(&kernel.scheduler, b"x").unwrap_err(),
            KernelError::BadFileDescriptor
        );
        let mut buf = [0u8; 1];
        assert_eq!(
            write_end.read(&kernel.scheduler, &mut buf).unwrap_err(),
            KernelError::BadFileDescriptor
        );

        let file = table.install_path("/file", OpenFlags::READ_WRITE).unwrap();
        assert_eq!(
            table.description(file).unwrap().read(&kernel.scheduler, &mut buf).unwrap_err(),
            KernelError::NotSupported
        );
    }
}
