//! Shared-memory allocator. One operation: allocate an anonymous,
//! fd-shareable memory segment the compositor can mmap alongside us.

use std::os::fd::OwnedFd;

use rustix::fs::MemfdFlags;
use rustix::io::Errno;

use crate::error::{CoreError, CoreResult};

/// Allocates an anonymous memory segment of `size` bytes and returns an fd
/// that can be handed to the compositor and mmap-ed by both sides. The
/// fd is sealed against shrinking so the compositor can safely mmap the
/// size it was told about.
pub fn allocate(size: usize) -> CoreResult<OwnedFd> {
    let fd = rustix::fs::memfd_create("wlrvnc-shm", MemfdFlags::CLOEXEC | MemfdFlags::ALLOW_SEALING)
        .map_err(|e| CoreError::AllocationFailure(format!("memfd_create: {e}")))?;

    rustix::fs::ftruncate(&fd, size as u64)
        .map_err(|e| CoreError::AllocationFailure(format!("ftruncate({size}): {e}")))?;

    seal_size(&fd).map_err(|e| CoreError::AllocationFailure(format!("seal: {e}")))?;

    Ok(fd)
}

fn seal_size(fd: &OwnedFd) -> Result<(), Errno> {
    use rustix::fs::SealFlags;
    rustix::fs::fcntl_add_seals(fd, SealFlags::SHRINK | SealFlags::GROW)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom, Write};

    #[test]
    fn allocated_segment_is_writable_and_sized() {
        let fd = allocate(4096).expect("allocate");
        let mut file = std::fs::File::from(fd);
        file.write_all(&[0xAA; 4096]).unwrap();
        file.seek(SeekFrom::Start(0)).unwrap();
        let mut buf = vec![0u8; 4096];
        file.read_exact(&mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn zero_size_segment_allocates_without_error() {
        allocate(0).expect("zero-size allocation should still succeed");
    }
}
