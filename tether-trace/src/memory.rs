/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use core::mem;
use std::io;

use nix::errno::Errno;
use nix::sys::ptrace;

use super::Error;
use super::Stopped;

const WORD: usize = mem::size_of::<u64>();

impl Stopped {
    /// Reads a single word from the tracee.
    fn peek(&self, addr: u64) -> Result<u64, Error> {
        ptrace::read(self.pid(), addr as ptrace::AddressType)
            .map(|word| word as u64)
            .map_err(|err| self.map_err(err))
    }

    /// Writes a single word to the tracee. Goes through ptrace rather than
    /// `process_vm_writev` so that write-protected text pages can be
    /// patched.
    fn poke(&mut self, addr: u64, word: u64) -> Result<(), Error> {
        unsafe {
            ptrace::write(
                self.pid(),
                addr as ptrace::AddressType,
                word as *mut libc::c_void,
            )
        }
        .map_err(|err| self.map_err(err))
    }

    /// Fills `buf` from the tracee's address space starting at `addr`.
    ///
    /// Word-sized and smaller reads go through `PTRACE_PEEKDATA`, which is
    /// faster than `process_vm_readv` for small transfers; everything else
    /// is read in bulk.
    pub fn read_memory(&self, addr: u64, buf: &mut [u8]) -> Result<(), Error> {
        if buf.is_empty() {
            return Ok(());
        }

        if buf.len() <= WORD {
            let word = self.peek(addr)?;
            buf.copy_from_slice(&word.to_le_bytes()[..buf.len()]);
            return Ok(());
        }

        let mut done = 0;
        while done < buf.len() {
            let local = [io::IoSliceMut::new(&mut buf[done..])];
            let remote = [libc::iovec {
                iov_base: (addr + done as u64) as *mut libc::c_void,
                iov_len: local[0].len(),
            }];

            let n = Errno::result(unsafe {
                libc::process_vm_readv(
                    self.pid().as_raw(),
                    local.as_ptr() as *const libc::iovec,
                    1,
                    remote.as_ptr(),
                    1,
                    0,
                )
            })
            .map_err(|err| self.map_err(err))?;

            if n == 0 {
                return Err(Error::Errno(Errno::EFAULT));
            }
            done += n as usize;
        }

        Ok(())
    }

    /// Writes `data` into the tracee's address space starting at `addr`.
    ///
    /// All writes are word read-modify-write cycles through ptrace: partial
    /// words must not clobber their neighbors (a breakpoint patch is a
    /// single byte inside an instruction stream), and `process_vm_writev`
    /// cannot write to read-only text pages at all.
    pub fn write_memory(&mut self, addr: u64, data: &[u8]) -> Result<(), Error> {
        let mut done = 0;

        while done < data.len() {
            let chunk_addr = addr + done as u64;
            let remaining = &data[done..];

            if remaining.len() >= WORD {
                let mut word = [0u8; WORD];
                word.copy_from_slice(&remaining[..WORD]);
                self.poke(chunk_addr, u64::from_le_bytes(word))?;
                done += WORD;
            } else {
                let mut word = self.peek(chunk_addr)?.to_le_bytes();
                word[..remaining.len()].copy_from_slice(remaining);
                self.poke(chunk_addr, u64::from_le_bytes(word))?;
                done += remaining.len();
            }
        }

        Ok(())
    }
}
