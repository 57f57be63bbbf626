/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

#![cfg(target_arch = "x86_64")]

use std::mem::offset_of;

use nix::errno::Errno;

use super::Error;
use super::Stopped;

/// The general purpose register file.
pub use libc::user_regs_struct as Regs;

/// Number of hardware breakpoint slots (DR0..DR3).
pub const HW_BREAKPOINT_SLOTS: usize = 4;

/// Byte offset of debug register `n` in the `user` area.
fn debugreg_offset(n: usize) -> u64 {
    (offset_of!(libc::user, u_debugreg) + n * 8) as u64
}

impl Stopped {
    // nix deliberately leaves PTRACE_PEEKUSER/POKEUSER unwrapped, so the
    // `user`-area accesses go through raw ptrace.

    fn read_user(&self, offset: u64) -> Result<u64, Error> {
        // A PEEK request returns the word in-band, so -1 is ambiguous;
        // errno disambiguates.
        Errno::clear();
        let word = unsafe {
            libc::ptrace(
                libc::PTRACE_PEEKUSER,
                self.pid().as_raw(),
                offset,
                0u64,
            )
        };
        if word == -1 {
            let errno = Errno::last();
            if errno != Errno::UnknownErrno {
                return Err(self.map_err(errno));
            }
        }
        Ok(word as u64)
    }

    fn write_user(&self, offset: u64, word: u64) -> Result<(), Error> {
        Errno::result(unsafe {
            libc::ptrace(libc::PTRACE_POKEUSER, self.pid().as_raw(), offset, word)
        })
        .map(drop)
        .map_err(|err| self.map_err(err))
    }

    /// Arms debug register `slot` (0..=3) as an execute breakpoint at
    /// `addr` for this thread.
    ///
    /// DR7 holds, per slot, a local-enable bit at `2 * slot` and a 4-bit
    /// condition/length field at `16 + 4 * slot`; an instruction breakpoint
    /// requires both condition and length to be zero.
    pub fn set_hw_breakpoint(&self, slot: usize, addr: u64) -> Result<(), Error> {
        assert!(slot < HW_BREAKPOINT_SLOTS, "invalid debug register {slot}");

        self.write_user(debugreg_offset(slot), addr)?;

        let mut dr7 = self.read_user(debugreg_offset(7))?;
        dr7 &= !(0b1111 << (16 + 4 * slot));
        dr7 |= 1 << (2 * slot);
        self.write_user(debugreg_offset(7), dr7)
    }

    /// Disarms debug register `slot` for this thread.
    pub fn clear_hw_breakpoint(&self, slot: usize) -> Result<(), Error> {
        assert!(slot < HW_BREAKPOINT_SLOTS, "invalid debug register {slot}");

        let mut dr7 = self.read_user(debugreg_offset(7))?;
        dr7 &= !(1 << (2 * slot));
        self.write_user(debugreg_offset(7), dr7)?;
        self.write_user(debugreg_offset(slot), 0)
    }
}
