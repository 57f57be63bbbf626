/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Utilities that support constructing tests for the engine without a live
//! traced process: a scriptable [`MockTarget`] and an in-memory
//! [`MockDebugData`] implementing all collaborator traits.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::path::Path;
use std::path::PathBuf;

use tether_trace::Errno;
use tether_trace::Pid;

use crate::debuginfo::DebugDataSource;
use crate::debuginfo::FrameEntry;
use crate::debuginfo::FrameTable;
use crate::debuginfo::Function;
use crate::debuginfo::GoroutineLayout;
use crate::debuginfo::LineTable;
use crate::debuginfo::Position;
use crate::debuginfo::RuntimeInfo;
use crate::debuginfo::SourceIndex;
use crate::debuginfo::SymbolTable;
use crate::debuginfo::VariableDef;
use crate::error::Error;
use crate::target::RegisterFile;
use crate::target::Target;
use crate::target::TraceEvent;

/// Mock register file: just the capability set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MockRegs {
    /// Program counter.
    pub pc: u64,
    /// Stack pointer.
    pub sp: u64,
}

impl RegisterFile for MockRegs {
    fn pc(&self) -> u64 {
        self.pc
    }

    fn sp(&self) -> u64 {
        self.sp
    }
}

/// A scriptable target. Stop events are served from a queue, one per
/// [`Target::wait_any`] call; each may reposition a thread's program
/// counter at delivery, emulating where the CPU stopped.
#[derive(Default)]
pub struct MockTarget {
    /// Whether debug registers are available.
    pub supports_hw: bool,
    /// Per-thread register files.
    pub regs: HashMap<Pid, MockRegs>,
    /// Sparse target memory. Reads of unmapped bytes fail like an EFAULT.
    pub memory: HashMap<u64, u8>,
    /// Armed debug-register slots per thread.
    pub hw: HashMap<(Pid, usize), u64>,
    /// Scripted stop events, delivered in order.
    pub events: VecDeque<(TraceEvent, Option<(Pid, u64)>)>,
    /// Every thread passed to [`Target::cont`], in order.
    pub resumed: Vec<Pid>,
    /// Every thread passed to [`Target::step`], in order.
    pub stepped: Vec<Pid>,
    /// Every thread passed to [`Target::interrupt`], in order.
    pub interrupted: Vec<Pid>,
    /// Every memory write performed, in order.
    pub writes: Vec<(u64, Vec<u8>)>,
    threads: Vec<Pid>,
}

impl MockTarget {
    /// Creates a mock with the given OS threads, hardware breakpoints
    /// enabled.
    pub fn new(threads: &[Pid]) -> Self {
        MockTarget {
            supports_hw: true,
            threads: threads.to_vec(),
            ..Default::default()
        }
    }

    /// Seeds target memory at `addr`.
    pub fn mem_set(&mut self, addr: u64, bytes: &[u8]) {
        for (i, byte) in bytes.iter().enumerate() {
            self.memory.insert(addr + i as u64, *byte);
        }
    }

    /// Reads one seeded byte back.
    pub fn mem_get(&self, addr: u64) -> Option<u8> {
        self.memory.get(&addr).copied()
    }

    /// Seeds a little-endian word.
    pub fn mem_set_word(&mut self, addr: u64, value: u64) {
        self.mem_set(addr, &value.to_le_bytes());
    }

    /// Sets a thread's registers.
    pub fn set_regs(&mut self, tid: Pid, pc: u64, sp: u64) {
        self.regs.insert(tid, MockRegs { pc, sp });
    }

    /// Adds an OS thread to the enumeration.
    pub fn add_thread(&mut self, tid: Pid) {
        if !self.threads.contains(&tid) {
            self.threads.push(tid);
        }
    }

    /// Appends a scripted stop. `reposition` moves a thread's program
    /// counter when the event is delivered.
    pub fn push_stop(&mut self, event: TraceEvent, reposition: Option<(Pid, u64)>) {
        self.events.push_back((event, reposition));
    }

    fn regs_mut(&mut self, tid: Pid) -> Result<&mut MockRegs, Error> {
        self.regs.get_mut(&tid).ok_or(Error::ThreadNotFound(tid))
    }
}

impl Target for MockTarget {
    type Regs = MockRegs;

    fn attach(&mut self, _pid: Pid) -> Result<(), Error> {
        Ok(())
    }

    fn launch(&mut self, _argv: &[String]) -> Result<Pid, Error> {
        self.threads
            .first()
            .copied()
            .ok_or_else(|| Error::ThreadNotFound(Pid::from_raw(0)))
    }

    fn threads(&mut self, _pid: Pid) -> Result<Vec<Pid>, Error> {
        Ok(self.threads.clone())
    }

    fn supports_hw_breakpoints(&self) -> bool {
        self.supports_hw
    }

    fn registers(&mut self, tid: Pid) -> Result<Self::Regs, Error> {
        self.regs
            .get(&tid)
            .copied()
            .ok_or(Error::ThreadNotFound(tid))
    }

    fn set_registers(&mut self, tid: Pid, regs: &Self::Regs) -> Result<(), Error> {
        *self.regs_mut(tid)? = *regs;
        Ok(())
    }

    fn set_pc(&mut self, tid: Pid, pc: u64) -> Result<(), Error> {
        self.regs_mut(tid)?.pc = pc;
        Ok(())
    }

    fn read_memory(&mut self, tid: Pid, addr: u64, buf: &mut [u8]) -> Result<(), Error> {
        for (i, slot) in buf.iter_mut().enumerate() {
            *slot = self
                .memory
                .get(&(addr + i as u64))
                .copied()
                .ok_or(Error::Memory {
                    tid,
                    addr: addr + i as u64,
                    source: tether_trace::Error::Errno(Errno::EFAULT),
                })?;
        }
        Ok(())
    }

    fn write_memory(&mut self, _tid: Pid, addr: u64, data: &[u8]) -> Result<(), Error> {
        self.writes.push((addr, data.to_vec()));
        self.mem_set(addr, data);
        Ok(())
    }

    fn cont(&mut self, tid: Pid) -> Result<(), Error> {
        self.resumed.push(tid);
        Ok(())
    }

    fn step(&mut self, tid: Pid) -> Result<(), Error> {
        self.stepped.push(tid);
        self.regs_mut(tid)?.pc += 1;
        Ok(())
    }

    fn set_hw_breakpoint(&mut self, tid: Pid, slot: usize, addr: u64) -> Result<(), Error> {
        assert!(slot < 4, "invalid debug register {slot}");
        self.hw.insert((tid, slot), addr);
        Ok(())
    }

    fn clear_hw_breakpoint(&mut self, tid: Pid, slot: usize) -> Result<(), Error> {
        assert!(slot < 4, "invalid debug register {slot}");
        self.hw.remove(&(tid, slot));
        Ok(())
    }

    fn wait_any(&mut self) -> Result<TraceEvent, Error> {
        let (event, reposition) = self
            .events
            .pop_front()
            .expect("mock target: wait_any called with no scripted stop events left");
        if let Some((tid, pc)) = reposition {
            self.regs_mut(tid)?.pc = pc;
        }
        Ok(event)
    }

    fn interrupt(&mut self, tid: Pid) -> Result<(), Error> {
        self.interrupted.push(tid);
        Ok(())
    }
}

/// In-memory debug information implementing every collaborator trait.
///
/// Cloned wholesale by its [`DebugDataSource`] implementation, so one value
/// seeds all five collaborators.
#[derive(Debug, Clone, Default)]
pub struct MockDebugData {
    /// Functions, looked up by name and by containing pc.
    pub functions: Vec<Function>,
    /// pc -> source line mapping; `pc_to_line` picks the nearest mapping at
    /// or below the probe that still falls inside a function.
    pub pc_lines: Vec<(u64, PathBuf, u64)>,
    /// (file, line) -> every pc the line program maps there.
    pub line_pcs: HashMap<(PathBuf, u64), Vec<u64>>,
    /// (file, line) -> syntactic next-line set.
    pub next_lines: HashMap<(PathBuf, u64), Vec<u64>>,
    /// Frame description entries as (range, return-address offset, frame
    /// offset).
    pub fdes: Vec<(std::ops::Range<u64>, i64, i64)>,
    /// Runtime symbol addresses.
    pub symbols: HashMap<String, u64>,
    /// Package-level variables.
    pub variables: HashMap<String, VariableDef>,
    /// Field offsets inside `runtime.g`.
    pub layout: GoroutineLayout,
}

impl MockDebugData {
    /// Registers a function.
    pub fn add_function(&mut self, name: &str, entry: u64, end: u64) {
        self.functions.push(Function {
            name: name.to_string(),
            entry,
            end,
        });
    }

    /// Registers a line-table entry both ways: `pc` maps to `file:line`,
    /// and `file:line` maps back to `pc`.
    pub fn add_line(&mut self, file: &Path, line: u64, pc: u64) {
        self.pc_lines.push((pc, file.to_path_buf(), line));
        self.line_pcs
            .entry((file.to_path_buf(), line))
            .or_default()
            .push(pc);
    }

    /// Registers the syntactic next-line set for `file:line`.
    pub fn add_next_lines(&mut self, file: &Path, line: u64, next: &[u64]) {
        self.next_lines
            .insert((file.to_path_buf(), line), next.to_vec());
    }

    /// Registers a frame description entry.
    pub fn add_fde(&mut self, range: std::ops::Range<u64>, ret_offset: i64, frame_offset: i64) {
        self.fdes.push((range, ret_offset, frame_offset));
    }
}

struct MockFde {
    range: std::ops::Range<u64>,
    ret_offset: i64,
    frame_offset: i64,
}

impl FrameEntry for MockFde {
    fn cover(&self, pc: u64) -> bool {
        self.range.contains(&pc)
    }

    fn return_address_offset(&self, _pc: u64) -> i64 {
        self.ret_offset
    }

    fn frame_offset(&self, _pc: u64) -> i64 {
        self.frame_offset
    }
}

impl SymbolTable for MockDebugData {
    fn pc_to_line(&self, pc: u64) -> Option<Position> {
        let func = self.func_for_pc(pc)?;
        self.pc_lines
            .iter()
            .filter(|(mapped, _, _)| *mapped <= pc && *mapped >= func.entry)
            .max_by_key(|(mapped, _, _)| *mapped)
            .map(|(_, file, line)| Position {
                file: file.clone(),
                line: *line,
                function: Some(func.name.clone()),
            })
    }

    fn line_to_pc(&self, file: &Path, line: u64) -> Option<u64> {
        self.line_pcs
            .get(&(file.to_path_buf(), line))
            .and_then(|pcs| pcs.first())
            .copied()
    }

    fn lookup_func(&self, name: &str) -> Option<Function> {
        self.functions.iter().find(|f| f.name == name).cloned()
    }

    fn func_for_pc(&self, pc: u64) -> Option<Function> {
        self.functions
            .iter()
            .find(|f| f.entry <= pc && pc < f.end)
            .cloned()
    }

    fn files(&self) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = self
            .pc_lines
            .iter()
            .map(|(_, file, _)| file.clone())
            .collect();
        files.sort();
        files.dedup();
        files
    }

    fn funcs(&self) -> Vec<Function> {
        self.functions.clone()
    }
}

impl FrameTable for MockDebugData {
    fn fde_for_pc(&self, pc: u64) -> Option<Box<dyn FrameEntry>> {
        self.fdes
            .iter()
            .find(|(range, _, _)| range.contains(&pc))
            .map(|(range, ret, frame)| {
                Box::new(MockFde {
                    range: range.clone(),
                    ret_offset: *ret,
                    frame_offset: *frame,
                }) as Box<dyn FrameEntry>
            })
    }
}

impl LineTable for MockDebugData {
    fn all_pcs_for_file_line(&self, file: &Path, line: u64) -> Vec<u64> {
        self.line_pcs
            .get(&(file.to_path_buf(), line))
            .cloned()
            .unwrap_or_default()
    }
}

impl SourceIndex for MockDebugData {
    fn next_lines(&self, file: &Path, line: u64) -> Result<Vec<u64>, Error> {
        Ok(self
            .next_lines
            .get(&(file.to_path_buf(), line))
            .cloned()
            .unwrap_or_default())
    }
}

impl RuntimeInfo for MockDebugData {
    fn symbol_address(&self, name: &str) -> Result<u64, Error> {
        self.symbols
            .get(name)
            .copied()
            .ok_or_else(|| Error::SymbolNotFound(name.to_string()))
    }

    fn pointer_size(&self) -> usize {
        8
    }

    fn variable(&self, name: &str) -> Result<VariableDef, Error> {
        self.variables
            .get(name)
            .cloned()
            .ok_or_else(|| Error::SymbolNotFound(name.to_string()))
    }

    fn goroutine_layout(&self) -> Result<GoroutineLayout, Error> {
        Ok(self.layout)
    }
}

impl DebugDataSource for MockDebugData {
    fn load_symbols(&self) -> Result<Box<dyn SymbolTable>, Error> {
        Ok(Box::new(self.clone()))
    }

    fn load_frames(&self) -> Result<Box<dyn FrameTable>, Error> {
        Ok(Box::new(self.clone()))
    }

    fn load_lines(&self) -> Result<Box<dyn LineTable>, Error> {
        Ok(Box::new(self.clone()))
    }

    fn load_source_index(&self) -> Result<Box<dyn SourceIndex>, Error> {
        Ok(Box::new(self.clone()))
    }

    fn load_runtime(&self) -> Result<Box<dyn RuntimeInfo>, Error> {
        Ok(Box::new(self.clone()))
    }
}
