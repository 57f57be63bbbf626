/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Per-OS-thread operations.
//!
//! A [`ThreadContext`] is plain bookkeeping owned by the session; every
//! operation that needs more than that state is a [`Session`] method taking
//! the thread id, which keeps ownership one-directional.

use std::path::Path;

use tether_trace::Pid;
use tracing::warn;

use crate::breakpoint::Breakpoint;
use crate::debuginfo::FrameEntry;
use crate::error::Error;
use crate::session::Session;
use crate::target::RegisterFile;
use crate::target::Target;

/// Functions a goroutine parks in while waiting for the runtime; a thread
/// sitting in one of these will not make user-code progress when resumed.
const BLOCKED_FUNCS: &[&str] = &["runtime.futex", "runtime.usleep"];

/// The runtime function a finished goroutine returns into.
pub(crate) const RUNTIME_GOEXIT: &str = "runtime.goexit";

/// The last observed stop of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopEvent {
    /// Stopped by a breakpoint or single-step trap.
    Trap,
    /// Stopped by delivery of a signal.
    Signal(tether_trace::Signal),
}

/// One OS thread of the traced process.
#[derive(Debug)]
pub struct ThreadContext {
    /// The OS thread id.
    pub id: Pid,
    /// The last wait result observed for this thread.
    pub status: Option<StopEvent>,
    /// Whether the thread has been resumed and not yet seen to stop.
    pub running: bool,
}

impl ThreadContext {
    pub(crate) fn new(id: Pid) -> Self {
        ThreadContext {
            id,
            status: None,
            running: false,
        }
    }
}

impl<T: Target> Session<T> {
    /// Reads the register file of a thread.
    pub fn thread_registers(&mut self, tid: Pid) -> Result<T::Regs, Error> {
        self.ensure_thread(tid)?;
        self.target.registers(tid)
    }

    /// Reads the program counter of a thread.
    pub fn thread_pc(&mut self, tid: Pid) -> Result<u64, Error> {
        Ok(self.thread_registers(tid)?.pc())
    }

    /// Writes the program counter of a thread.
    pub fn set_pc(&mut self, tid: Pid, pc: u64) -> Result<(), Error> {
        self.ensure_thread(tid)?;
        self.target.set_pc(tid, pc)
    }

    /// Reads `buf.len()` bytes of target memory through a thread.
    pub fn read_memory(&mut self, tid: Pid, addr: u64, buf: &mut [u8]) -> Result<(), Error> {
        self.ensure_thread(tid)?;
        self.target.read_memory(tid, addr, buf)
    }

    /// Writes `data` to target memory through a thread.
    pub fn write_memory(&mut self, tid: Pid, addr: u64, data: &[u8]) -> Result<(), Error> {
        self.ensure_thread(tid)?;
        self.target.write_memory(tid, addr, data)
    }

    /// Resumes a thread. If it is stopped exactly past a software
    /// breakpoint's trap byte, the breakpoint is stepped over first so the
    /// patched-out instruction executes.
    pub fn continue_thread(&mut self, tid: Pid) -> Result<(), Error> {
        let pc = self.thread_pc(tid)?;
        if self.breakpoints.software_at(pc.wrapping_sub(1)).is_some() {
            self.step_thread(tid)?;
        }
        self.mark_running(tid);
        self.target.cont(tid)
    }

    /// Single-steps a thread one instruction. Stepping off a software
    /// breakpoint clears it, rewinds the program counter to the restored
    /// instruction, steps, and re-installs the breakpoint with its `temp`
    /// flag preserved.
    pub fn step_thread(&mut self, tid: Pid) -> Result<(), Error> {
        let pc = self.thread_pc(tid)?;
        let on_breakpoint = self
            .breakpoints
            .software_at(pc.wrapping_sub(1))
            .map(|bp| (bp.addr, bp.temp, bp.origin.clone()));

        if let Some((addr, temp, origin)) = on_breakpoint {
            self.clear_breakpoint_on(tid, addr)?;
            self.set_pc(tid, addr)?;
            self.single_step(tid)?;
            self.set_breakpoint_on(tid, addr, temp, origin)?;
        } else {
            self.single_step(tid)?;
        }
        Ok(())
    }

    fn single_step(&mut self, tid: Pid) -> Result<(), Error> {
        self.target.step(tid)?;
        self.record_stop(tid, StopEvent::Trap);
        Ok(())
    }

    /// Derives the frame's return address from a frame-descriptor rule:
    /// reads 8 little-endian bytes at `sp + offset`.
    pub fn return_address_from_offset(&mut self, tid: Pid, offset: i64) -> Result<u64, Error> {
        let sp = self.thread_registers(tid)?.sp();
        let mut buf = [0u8; 8];
        let addr = sp.wrapping_add_signed(offset);
        self.read_memory(tid, addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// If a temp breakpoint exists at `pc`, clears it and rewinds the
    /// program counter so the restored instruction executes next.
    pub fn clear_temp_breakpoint(&mut self, tid: Pid, pc: u64) -> Result<(), Error> {
        let is_temp = self.breakpoints.find(pc).is_some_and(|bp| bp.temp);
        if is_temp {
            self.clear_breakpoint_on(tid, pc)?;
            self.set_pc(tid, pc)?;
        }
        Ok(())
    }

    /// Whether the thread is parked in the runtime's wait primitives and
    /// will not make user-code progress when continued.
    pub fn thread_blocked(&mut self, tid: Pid) -> Result<bool, Error> {
        let pc = self.thread_pc(tid)?;
        Ok(self
            .debug
            .symbols
            .func_for_pc(pc)
            .is_some_and(|f| BLOCKED_FUNCS.contains(&f.name.as_str())))
    }

    /// Advances a thread to the next source line: installs temp
    /// breakpoints at every candidate successor and resumes the thread.
    /// The session-level [`Session::next`] drives the wait loop.
    pub(crate) fn next_thread(&mut self, tid: Pid) -> Result<(), Error> {
        let mut pc = self.thread_pc(tid)?;

        // If we are stopped just past a trap byte, candidate search must
        // use the address of the real instruction.
        if let Some(bp) = self.breakpoints.software_at(pc.wrapping_sub(1)) {
            pc = bp.addr;
        }

        let fde = self
            .debug
            .frames
            .fde_for_pc(pc)
            .ok_or(Error::FrameNotFound { pc })?;

        if let Some(position) = self.debug.symbols.pc_to_line(pc) {
            if position.file.extension() == Some(std::ffi::OsStr::new("go")) {
                let file = position.file.clone();
                self.next_go(tid, pc, fde.as_ref(), &file, position.line)?;
            } else {
                self.next_foreign(tid, pc)?;
            }
        }

        self.continue_thread(tid)
    }

    fn next_go(
        &mut self,
        tid: Pid,
        curpc: u64,
        fde: &dyn FrameEntry,
        file: &Path,
        line: u64,
    ) -> Result<(), Error> {
        let lines = self.debug.source.next_lines(file, line)?;

        if lines.is_empty() {
            // Nothing reachable within the function body; the only way
            // forward is the caller. A return into `runtime.goexit` means
            // the goroutine itself is finished.
            let ret = self.return_address_from_offset(tid, fde.return_address_offset(curpc))?;
            if let Some(func) = self.debug.symbols.func_for_pc(ret) {
                if func.name == RUNTIME_GOEXIT {
                    let g = self.current_goroutine(tid)?;
                    return Err(Error::GoroutineExiting(g.id));
                }
            }
            return Ok(());
        }

        tracing::debug!(thread = %tid, ?lines, "next-line candidates");

        for candidate in lines {
            let pcs = self.debug.lines.all_pcs_for_file_line(file, candidate);
            for mut pc in pcs {
                if pc == curpc {
                    continue;
                }
                // A candidate outside the current frame means we would be
                // stepping out of the function; aim for the return address
                // instead.
                if !fde.cover(pc) {
                    pc = self
                        .return_address_from_offset(tid, fde.return_address_offset(curpc))?;
                }
                match self.set_breakpoint_on(tid, pc, true, format!("{}:{candidate}", file.display()))
                {
                    Ok(_) | Err(Error::BreakpointExists { .. }) => {}
                    Err(err) => return Err(err),
                }
            }
        }
        Ok(())
    }

    /// Next-line through a frame with no Go source: there is no AST to
    /// enumerate candidates from, so no breakpoints are installed and the
    /// thread simply resumes.
    fn next_foreign(&mut self, _tid: Pid, _curpc: u64) -> Result<(), Error> {
        Ok(())
    }

    /// Calls the function `name` in the target on the given thread, then
    /// invokes `f` to harvest results while the target sits at the
    /// function's final instruction. Registers are restored and the
    /// breakpoint removed before returning.
    ///
    /// This is *not* safe with respect to the rest of the process: other
    /// goroutines may observe inconsistent runtime state while the call
    /// runs.
    pub fn call_fn<R>(
        &mut self,
        tid: Pid,
        name: &str,
        f: impl FnOnce(&mut Self) -> Result<R, Error>,
    ) -> Result<R, Error> {
        let func = self
            .debug
            .symbols
            .lookup_func(name)
            .ok_or_else(|| Error::SymbolNotFound(name.to_string()))?;

        // Stop just before the function returns so its results are still
        // in registers and on the stack.
        let bp = self.set_breakpoint_on(tid, func.end - 2, false, name.to_string())?;
        let saved = self.thread_registers(tid)?;
        self.set_pc(tid, func.entry)?;

        let result = self.drive_call(tid, f);

        let restore = self.target.set_registers(tid, &saved);
        let clear = self.clear_breakpoint_on(tid, bp.addr);
        match result {
            Ok(value) => {
                restore?;
                clear?;
                Ok(value)
            }
            Err(err) => {
                if let Err(cleanup) = restore.and(clear.map(drop)) {
                    warn!(thread = %tid, error = %cleanup, "call_fn cleanup failed");
                }
                Err(err)
            }
        }
    }

    fn drive_call<R>(
        &mut self,
        tid: Pid,
        f: impl FnOnce(&mut Self) -> Result<R, Error>,
    ) -> Result<R, Error> {
        self.continue_thread(tid)?;
        self.trap_wait()?;
        f(self)
    }

    pub(crate) fn set_breakpoint_on(
        &mut self,
        tid: Pid,
        addr: u64,
        temp: bool,
        origin: String,
    ) -> Result<Breakpoint, Error> {
        self.breakpoints.set(&mut self.target, tid, addr, temp, origin)
    }

    pub(crate) fn clear_breakpoint_on(&mut self, tid: Pid, addr: u64) -> Result<Breakpoint, Error> {
        self.breakpoints.clear(&mut self.target, tid, addr)
    }
}
