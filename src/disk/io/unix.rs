//! Vectored, positioned file IO (`pwritev`/`preadv`), the disk layer's only
//! platform-specific surface (component K). Loops until every iovec is
//! fully transferred, since neither syscall guarantees a full transfer in
//! one call.

use std::fs::File;
use std::io::{self, IoSlice, IoSliceMut};

use nix::sys::uio::{preadv, pwritev};

pub fn pwritev_all(file: &File, mut bufs: &mut [IoSlice<'_>], mut offset: u64) -> io::Result<()> {
  while !bufs.is_empty() {
    match pwritev(file, bufs, offset as i64) {
      Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "pwritev wrote 0 bytes")),
      Ok(n) => {
        offset += n as u64;
        IoSlice::advance_slices(&mut bufs, n);
      }
      Err(nix::errno::Errno::EINTR) => continue,
      Err(e) => return Err(io::Error::from(e)),
    }
  }
  Ok(())
}

/// Reads until `bufs` is exhausted or the file hits EOF, returning the
/// total number of bytes actually transferred (short of `bufs`' total
/// length at EOF).
pub fn preadv_all(file: &File, mut bufs: &mut [IoSliceMut<'_>], mut offset: u64) -> io::Result<u64> {
  let mut total = 0u64;
  while !bufs.is_empty() {
    match preadv(file, bufs, offset as i64) {
      Ok(0) => break,
      Ok(n) => {
        offset += n as u64;
        total += n as u64;
        IoSliceMut::advance_slices(&mut bufs, n);
      }
      Err(nix::errno::Errno::EINTR) => continue,
      Err(e) => return Err(io::Error::from(e)),
    }
  }
  Ok(total)
}
