/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The OS tracing seam. A [`Target`] is the engine's only way of touching
//! the traced process: registers, memory, resumption and trap delivery all
//! go through it. The production implementation is
//! [`LinuxTarget`](crate::LinuxTarget); tests drive the engine with
//! [`MockTarget`](crate::testing::MockTarget).

use tether_trace::Pid;
use tether_trace::Signal;

use crate::error::Error;

/// The arch-neutral capability set over a saved register file: read the
/// program counter and the stack pointer. The concrete type is an opaque
/// payload that can be saved and restored wholesale, which is how
/// `call_fn` unwinds after forcing a call in the target.
pub trait RegisterFile: Clone {
    /// The program counter.
    fn pc(&self) -> u64;

    /// The stack pointer.
    fn sp(&self) -> u64;
}

/// A trace event surfaced by [`Target::wait_any`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceEvent {
    /// A thread stopped with a breakpoint or single-step trap.
    Trap(Pid),

    /// A thread stopped with a non-trap signal.
    Stopped(Pid, Signal),

    /// A new thread was cloned into the traced process. The thread is in a
    /// ptrace-stop and must be resumed explicitly.
    NewThread(Pid),

    /// A single thread exited; the process lives on.
    ThreadExited(Pid),

    /// The whole process exited with the given status.
    ProcessExited(Pid, i32),
}

/// OS-level tracing primitives for one traced process.
///
/// Every call that touches a thread requires that thread to be in a
/// ptrace-stop; the engine serializes all access and maintains that
/// invariant, so implementations may treat a violation as a programmer
/// error.
pub trait Target {
    /// The concrete saved register file.
    type Regs: RegisterFile;

    /// Attaches to a running process and stops every thread it currently
    /// has.
    fn attach(&mut self, pid: Pid) -> Result<(), Error>;

    /// Spawns `argv` under trace, stopped before the first user
    /// instruction. Returns the new process id.
    fn launch(&mut self, argv: &[String]) -> Result<Pid, Error>;

    /// Enumerates the OS threads of the traced process.
    fn threads(&mut self, pid: Pid) -> Result<Vec<Pid>, Error>;

    /// Whether debug-register breakpoints are available.
    fn supports_hw_breakpoints(&self) -> bool;

    /// Reads the register file of a stopped thread.
    fn registers(&mut self, tid: Pid) -> Result<Self::Regs, Error>;

    /// Writes a previously saved register file back.
    fn set_registers(&mut self, tid: Pid, regs: &Self::Regs) -> Result<(), Error>;

    /// Writes the program counter of a stopped thread.
    fn set_pc(&mut self, tid: Pid, pc: u64) -> Result<(), Error>;

    /// Fills `buf` from target memory at `addr`, using `tid` for the access.
    fn read_memory(&mut self, tid: Pid, addr: u64, buf: &mut [u8]) -> Result<(), Error>;

    /// Writes `data` to target memory at `addr`, using `tid` for the access.
    fn write_memory(&mut self, tid: Pid, addr: u64, data: &[u8]) -> Result<(), Error>;

    /// Resumes a stopped thread. Does not wait; stops are collected through
    /// [`Target::wait_any`].
    fn cont(&mut self, tid: Pid) -> Result<(), Error>;

    /// Single-steps a stopped thread one instruction and waits for the
    /// resulting trap, leaving the thread stopped again.
    fn step(&mut self, tid: Pid) -> Result<(), Error>;

    /// Arms debug-register `slot` (0..=3) as an execute breakpoint at
    /// `addr` on the given thread.
    fn set_hw_breakpoint(&mut self, tid: Pid, slot: usize, addr: u64) -> Result<(), Error>;

    /// Disarms debug-register `slot` on the given thread.
    fn clear_hw_breakpoint(&mut self, tid: Pid, slot: usize) -> Result<(), Error>;

    /// Blocks until any thread of the traced process delivers a trace
    /// event. Never returns spuriously.
    fn wait_any(&mut self) -> Result<TraceEvent, Error>;

    /// Sends a stop signal to one thread. The stop is observed by a later
    /// [`Target::wait_any`].
    fn interrupt(&mut self, tid: Pid) -> Result<(), Error>;
}
