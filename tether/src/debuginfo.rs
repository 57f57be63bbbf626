/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Interfaces to the debug-information collaborators.
//!
//! The engine does not parse DWARF, the Go symbol table, line programs or
//! source files itself. Each of those lives behind one of the traits below,
//! and [`DebugData`] bundles the loaded set. [`DebugData::load`] runs all
//! five loads concurrently and fails if any one of them fails.

use std::path::Path;
use std::path::PathBuf;
use std::thread;

use crate::error::Error;

/// A source position resolved from a program counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Position {
    /// Absolute path of the source file.
    pub file: PathBuf,
    /// 1-based line number.
    pub line: u64,
    /// Enclosing function name, when known.
    pub function: Option<String>,
}

/// A function known to the symbol table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Function {
    /// Fully qualified name, e.g. `main.main`.
    pub name: String,
    /// Entry program counter.
    pub entry: u64,
    /// First program counter past the function.
    pub end: u64,
}

/// The Go symbol table.
pub trait SymbolTable: Send + Sync {
    /// Resolves a program counter to its source position.
    fn pc_to_line(&self, pc: u64) -> Option<Position>;

    /// Resolves a file and line to the program counter of its statement.
    fn line_to_pc(&self, file: &Path, line: u64) -> Option<u64>;

    /// Looks up a function by name.
    fn lookup_func(&self, name: &str) -> Option<Function>;

    /// Finds the function containing a program counter.
    fn func_for_pc(&self, pc: u64) -> Option<Function>;

    /// All source files the binary was built from.
    fn files(&self) -> Vec<PathBuf>;

    /// All functions in the binary.
    fn funcs(&self) -> Vec<Function>;
}

/// One DWARF frame description entry: how to unwind a single function's
/// frame at a given program counter.
pub trait FrameEntry {
    /// Whether this entry covers `pc`.
    fn cover(&self, pc: u64) -> bool;

    /// Offset from the stack pointer at `pc` to the frame's saved return
    /// address.
    fn return_address_offset(&self, pc: u64) -> i64;

    /// Size of the frame established at `pc`.
    fn frame_offset(&self, pc: u64) -> i64;
}

/// The `.debug_frame` section.
pub trait FrameTable: Send + Sync {
    /// Finds the frame description entry covering `pc`.
    fn fde_for_pc(&self, pc: u64) -> Option<Box<dyn FrameEntry>>;
}

/// The `.debug_line` section.
pub trait LineTable: Send + Sync {
    /// Every program counter the line program maps to `file:line`.
    fn all_pcs_for_file_line(&self, file: &Path, line: u64) -> Vec<u64>;
}

/// The source AST index.
pub trait SourceIndex: Send + Sync {
    /// The syntactic next-line set: every line the program could execute
    /// immediately after the statement at `file:line` completes, without
    /// leaving the enclosing function.
    fn next_lines(&self, file: &Path, line: u64) -> Result<Vec<u64>, Error>;
}

/// What kind of value a package-level variable holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableKind {
    /// Signed integer of the definition's size.
    Int,
    /// Unsigned integer of the definition's size.
    Uint,
    /// Boolean.
    Bool,
    /// Raw pointer.
    Pointer,
    /// Go string (pointer + length header).
    String,
}

/// Location and shape of a package-level variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableDef {
    /// Address of the variable in the target.
    pub addr: u64,
    /// Size in bytes (integers and bools; ignored for strings).
    pub size: usize,
    /// Value kind.
    pub kind: VariableKind,
    /// Type name for display.
    pub typ: String,
}

/// An evaluated variable, rendered for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variable {
    /// The symbol name.
    pub name: String,
    /// The rendered value.
    pub value: String,
    /// The type name.
    pub typ: String,
}

/// Byte offsets of the fields the engine reads out of `runtime.g`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GoroutineLayout {
    /// Offset of the goroutine id.
    pub goid: u64,
    /// Offset of the scheduler-saved program counter.
    pub sched_pc: u64,
    /// Offset of the scheduler-saved stack pointer.
    pub sched_sp: u64,
    /// Offset of the goroutine's entry program counter.
    pub go_pc: u64,
    /// Offset of the wait-reason string header.
    pub wait_reason: u64,
}

/// The DWARF view of the runtime: named symbols and type layout.
pub trait RuntimeInfo: Send + Sync {
    /// Address of a runtime symbol, e.g. `runtime.allg`.
    fn symbol_address(&self, name: &str) -> Result<u64, Error>;

    /// Pointer width of the target, in bytes.
    fn pointer_size(&self) -> usize;

    /// Location and shape of a package-level variable.
    fn variable(&self, name: &str) -> Result<VariableDef, Error>;

    /// Field offsets inside `runtime.g`.
    fn goroutine_layout(&self) -> Result<GoroutineLayout, Error>;
}

/// The loaded debug information for one binary.
pub struct DebugData {
    /// The Go symbol table.
    pub symbols: Box<dyn SymbolTable>,
    /// The frame description entries.
    pub frames: Box<dyn FrameTable>,
    /// The line program.
    pub lines: Box<dyn LineTable>,
    /// The source AST index.
    pub source: Box<dyn SourceIndex>,
    /// The DWARF runtime view.
    pub runtime: Box<dyn RuntimeInfo>,
}

/// Produces the individual collaborators, typically by parsing sections of
/// the target executable. Each method is called at most once per load, on
/// its own thread.
pub trait DebugDataSource: Sync {
    /// Parses the symbol table.
    fn load_symbols(&self) -> Result<Box<dyn SymbolTable>, Error>;

    /// Parses the frame description entries.
    fn load_frames(&self) -> Result<Box<dyn FrameTable>, Error>;

    /// Parses the line program.
    fn load_lines(&self) -> Result<Box<dyn LineTable>, Error>;

    /// Builds the source AST index.
    fn load_source_index(&self) -> Result<Box<dyn SourceIndex>, Error>;

    /// Parses the DWARF runtime view.
    fn load_runtime(&self) -> Result<Box<dyn RuntimeInfo>, Error>;
}

impl DebugData {
    /// Loads all five collaborators concurrently, joining before return.
    /// The first failure fails the whole load.
    pub fn load(source: &dyn DebugDataSource) -> Result<Self, Error> {
        thread::scope(|scope| {
            let symbols = scope.spawn(|| source.load_symbols());
            let frames = scope.spawn(|| source.load_frames());
            let lines = scope.spawn(|| source.load_lines());
            let index = scope.spawn(|| source.load_source_index());
            let runtime = scope.spawn(|| source.load_runtime());

            Ok(DebugData {
                symbols: join_load(symbols)?,
                frames: join_load(frames)?,
                lines: join_load(lines)?,
                source: join_load(index)?,
                runtime: join_load(runtime)?,
            })
        })
    }
}

fn join_load<T>(handle: thread::ScopedJoinHandle<'_, Result<T, Error>>) -> Result<T, Error> {
    handle
        .join()
        .unwrap_or_else(|_| Err(Error::LoadFailed("loader panicked".into())))
}
