/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

use tether_trace::Pid;
use thiserror::Error;

/// An engine error.
///
/// `ManualStop` and `GoroutineExiting` are signals rather than failures:
/// callers branch on them explicitly. Everything else aborts the operation
/// that produced it.
#[derive(Error, Debug)]
pub enum Error {
    /// Attaching to the given process failed.
    #[error("could not attach to process {pid}")]
    AttachFailed {
        /// The process we tried to attach to.
        pid: Pid,
        #[source]
        /// The underlying trace failure.
        source: tether_trace::Error,
    },

    /// Spawning the target under trace failed.
    #[error("could not launch {program:?}")]
    LaunchFailed {
        /// The program we tried to spawn.
        program: String,
        #[source]
        /// The underlying trace failure.
        source: tether_trace::Error,
    },

    /// The target process has exited. Once observed, most operations fail
    /// immediately with this error.
    #[error("process {pid} has exited with status {status}")]
    ProcessExited {
        /// The traced process.
        pid: Pid,
        /// Its exit status.
        status: i32,
    },

    /// The given thread id is not part of the traced process.
    #[error("thread {0} does not exist")]
    ThreadNotFound(Pid),

    /// A breakpoint is already installed at the address.
    #[error("breakpoint already exists at {addr:#x}")]
    BreakpointExists {
        /// The contested address.
        addr: u64,
    },

    /// No breakpoint is installed at the address.
    #[error("no breakpoint at {addr:#x}")]
    BreakpointNotFound {
        /// The queried address.
        addr: u64,
    },

    /// All four debug-register slots are occupied.
    #[error("no free hardware breakpoint slot")]
    NoFreeHardwareSlot,

    /// A location string could not be resolved to an address.
    #[error("unable to find location for {0:?}")]
    LocationNotFound(String),

    /// A symbol name is unknown to the debug information.
    #[error("could not find symbol {0:?}")]
    SymbolNotFound(String),

    /// No frame description entry covers the program counter.
    #[error("could not find FDE for pc {pc:#x}")]
    FrameNotFound {
        /// The uncovered program counter.
        pc: u64,
    },

    /// Reading or writing target memory failed.
    #[error("thread {tid}: memory access at {addr:#x} failed")]
    Memory {
        /// The thread used for the access.
        tid: Pid,
        /// The target virtual address.
        addr: u64,
        #[source]
        /// The underlying trace failure.
        source: tether_trace::Error,
    },

    /// Reading or writing target registers failed.
    #[error("thread {tid}: register access failed")]
    Register {
        /// The thread whose registers were accessed.
        tid: Pid,
        #[source]
        /// The underlying trace failure.
        source: tether_trace::Error,
    },

    /// A low-level trace operation on a thread failed.
    #[error("thread {tid}: trace operation failed")]
    Trace {
        /// The thread the operation targeted.
        tid: Pid,
        #[source]
        /// The underlying trace failure.
        source: tether_trace::Error,
    },

    /// A thread trapped at a program counter the engine cannot explain.
    #[error("unrecognized breakpoint {pc:#x}")]
    UnrecognizedTrap {
        /// The program counter at the stop.
        pc: u64,
    },

    /// Loading the debug information failed.
    #[error("could not load debug information: {0}")]
    LoadFailed(String),

    /// Signal: the goroutine that was asked to step is running down
    /// `runtime.goexit` and will not reach another line.
    #[error("goroutine {0} is exiting")]
    GoroutineExiting(i64),

    /// Signal: a manual stop was requested while the target was running.
    #[error("manual stop requested")]
    ManualStop,
}
