/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Goroutine inspection.
//!
//! The runtime publishes every goroutine through the `runtime.allg` array;
//! its length lives in `runtime.allglen`. Each slot is a pointer to a
//! `runtime.g`, whose field offsets come from the DWARF collaborator. The
//! walk is all-or-nothing: a failed read aborts it rather than returning a
//! partial list.

use std::path::PathBuf;

use tether_trace::Pid;

use crate::error::Error;
use crate::session::Session;
use crate::target::RegisterFile;
use crate::target::Target;

const RUNTIME_ALLG: &str = "runtime.allg";
const RUNTIME_ALLG_LEN: &str = "runtime.allglen";
const RUNTIME_GETG: &str = "runtime.getg";

// Wait reasons are short static runtime strings; anything longer than this
// is a corrupt header.
const MAX_WAIT_REASON: u64 = 256;

/// A read-only snapshot of one goroutine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Goroutine {
    /// The runtime-assigned goroutine id.
    pub id: i64,
    /// The scheduler-saved program counter.
    pub pc: u64,
    /// The scheduler-saved stack pointer.
    pub sp: u64,
    /// The program counter the goroutine was started with.
    pub go_pc: u64,
    /// Source file of the saved program counter.
    pub file: PathBuf,
    /// Source line of the saved program counter.
    pub line: u64,
    /// Why the goroutine is not runnable (e.g. "chan receive"), empty when
    /// runnable.
    pub wait_reason: String,
}

impl<T: Target> Session<T> {
    /// Enumerates every goroutine the runtime knows about.
    pub fn goroutines(&mut self) -> Result<Vec<Goroutine>, Error> {
        let tid = self.current_thread();
        let ptr = self.debug.runtime.pointer_size() as u64;

        let len_addr = self.debug.runtime.symbol_address(RUNTIME_ALLG_LEN)?;
        let len = self.read_word(tid, len_addr, ptr as usize)?;

        let base_addr = self.debug.runtime.symbol_address(RUNTIME_ALLG)?;
        let base = self.read_word(tid, base_addr, ptr as usize)?;

        let mut all = Vec::with_capacity(len as usize);
        for i in 0..len {
            all.push(self.parse_goroutine(tid, base + i * ptr)?);
        }
        Ok(all)
    }

    /// The goroutine currently scheduled on the given thread, obtained by
    /// calling `runtime.getg` in the target.
    pub fn current_goroutine(&mut self, tid: Pid) -> Result<Goroutine, Error> {
        self.call_fn(tid, RUNTIME_GETG, |session| {
            let sp = session.thread_registers(tid)?.sp();
            let ptr = session.debug.runtime.pointer_size() as u64;
            session.parse_goroutine(tid, sp + ptr)
        })
    }

    /// Parses the `runtime.g` a slot points at. `slot` holds a `*g`.
    pub(crate) fn parse_goroutine(&mut self, tid: Pid, slot: u64) -> Result<Goroutine, Error> {
        let ptr = self.debug.runtime.pointer_size() as usize;
        let layout = self.debug.runtime.goroutine_layout()?;

        let g = self.read_word(tid, slot, ptr)?;
        let id = self.read_word(tid, g + layout.goid, 8)? as i64;
        let pc = self.read_word(tid, g + layout.sched_pc, ptr)?;
        let sp = self.read_word(tid, g + layout.sched_sp, ptr)?;
        let go_pc = self.read_word(tid, g + layout.go_pc, ptr)?;
        let wait_reason = self.read_go_string(tid, g + layout.wait_reason)?;

        let (file, line) = self
            .debug
            .symbols
            .pc_to_line(pc)
            .map(|pos| (pos.file, pos.line))
            .unwrap_or_default();

        Ok(Goroutine {
            id,
            pc,
            sp,
            go_pc,
            file,
            line,
            wait_reason,
        })
    }

    /// Reads a little-endian unsigned word of `size` bytes.
    pub(crate) fn read_word(&mut self, tid: Pid, addr: u64, size: usize) -> Result<u64, Error> {
        let mut buf = [0u8; 8];
        self.read_memory(tid, addr, &mut buf[..size])?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Reads a Go string: a pointer-and-length header followed by bytes.
    pub(crate) fn read_go_string(&mut self, tid: Pid, addr: u64) -> Result<String, Error> {
        let ptr = self.debug.runtime.pointer_size() as usize;
        let data = self.read_word(tid, addr, ptr)?;
        let len = self.read_word(tid, addr + ptr as u64, ptr)?;

        if data == 0 || len == 0 {
            return Ok(String::new());
        }
        let len = len.min(MAX_WAIT_REASON);

        let mut buf = vec![0u8; len as usize];
        self.read_memory(tid, data, &mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}
