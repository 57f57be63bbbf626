/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

//! A source-level debugging engine for binaries produced by the Go
//! toolchain.
//!
//! The engine attaches to a running process (or launches one under trace),
//! reads its memory and registers, installs hardware and software
//! breakpoints, single-steps OS threads, advances execution to the next
//! source line while staying on the issuing goroutine, and enumerates live
//! goroutines.
//!
//! Two scheduling models compose here: the OS schedules threads, and the Go
//! runtime multiplexes goroutines onto them. A [`Session`] drives both
//! through a [`Target`] (the OS tracing seam) and a set of debug-info
//! collaborators ([`DebugData`]) that it never parses itself.
//!
//! The engine is a single controller: no session operation is reentrant,
//! and the only internal parallelism is the attach-time debug-info load.

mod breakpoint;
mod debuginfo;
mod error;
mod goroutine;
#[cfg(target_os = "linux")]
mod linux;
mod session;
mod target;
pub mod testing;
mod thread;

pub use breakpoint::Breakpoint;
pub use breakpoint::BreakpointKind;
pub use breakpoint::BreakpointTable;
pub use breakpoint::HW_SLOTS;
pub use breakpoint::TRAP_INSTRUCTION;
pub use debuginfo::DebugData;
pub use debuginfo::DebugDataSource;
pub use debuginfo::FrameEntry;
pub use debuginfo::FrameTable;
pub use debuginfo::Function;
pub use debuginfo::GoroutineLayout;
pub use debuginfo::LineTable;
pub use debuginfo::Position;
pub use debuginfo::RuntimeInfo;
pub use debuginfo::SourceIndex;
pub use debuginfo::SymbolTable;
pub use debuginfo::Variable;
pub use debuginfo::VariableDef;
pub use debuginfo::VariableKind;
pub use error::Error;
pub use goroutine::Goroutine;
#[cfg(target_os = "linux")]
pub use linux::LinuxRegs;
#[cfg(target_os = "linux")]
pub use linux::LinuxTarget;
pub use session::Session;
pub use target::RegisterFile;
pub use target::Target;
pub use target::TraceEvent;
pub use thread::StopEvent;
pub use thread::ThreadContext;

// Pid and Signal appear throughout the public API; re-export them so
// embedders don't need a direct tether-trace dependency.
pub use tether_trace::Pid;
pub use tether_trace::Signal;
