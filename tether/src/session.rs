/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The debug session: owns the traced process, the breakpoint table, every
//! thread context and the current-thread/current-breakpoint foci.
//!
//! The session is a single controller. All public operations are called
//! from one context; the only parallelism anywhere is the attach-time
//! debug-info load. Nothing here takes a lock.

use std::collections::HashMap;
use std::path::PathBuf;

use tether_trace::Pid;
use tether_trace::Signal;
use tracing::debug;
use tracing::info;

use crate::breakpoint::Breakpoint;
use crate::breakpoint::BreakpointTable;
use crate::debuginfo::DebugData;
use crate::debuginfo::DebugDataSource;
use crate::debuginfo::Function;
use crate::debuginfo::Position;
use crate::debuginfo::Variable;
use crate::debuginfo::VariableKind;
use crate::error::Error;
use crate::target::Target;
use crate::target::TraceEvent;
use crate::thread::StopEvent;
use crate::thread::ThreadContext;

/// The runtime function behind the user-visible `runtime.Breakpoint()`.
const RUNTIME_BREAKPOINT: &str = "runtime.breakpoint";

/// A debug session over one traced process.
pub struct Session<T: Target> {
    pub(crate) pid: Pid,
    pub(crate) target: T,
    pub(crate) breakpoints: BreakpointTable,
    pub(crate) threads: HashMap<Pid, ThreadContext>,
    pub(crate) current_thread: Pid,
    pub(crate) current_breakpoint: Option<Breakpoint>,
    pub(crate) debug: DebugData,
    pub(crate) running: bool,
    pub(crate) halt_requested: bool,
    pub(crate) exited: Option<i32>,
}

impl<T: Target> Session<T> {
    /// Attaches to the running process `pid` and loads its debug
    /// information.
    pub fn attach_with(
        mut target: T,
        pid: Pid,
        source: &dyn DebugDataSource,
    ) -> Result<Self, Error> {
        target.attach(pid)?;
        let session = Self::bootstrap(target, pid, source)?;
        info!(%pid, "attached");
        Ok(session)
    }

    /// Spawns `argv` under trace, stopped before the first user
    /// instruction, and loads its debug information.
    pub fn launch_with(
        mut target: T,
        argv: &[String],
        source: &dyn DebugDataSource,
    ) -> Result<Self, Error> {
        let pid = target.launch(argv)?;
        let session = Self::bootstrap(target, pid, source)?;
        info!(%pid, "launched");
        Ok(session)
    }

    fn bootstrap(target: T, pid: Pid, source: &dyn DebugDataSource) -> Result<Self, Error> {
        let debug = DebugData::load(source)?;
        let mut session = Session {
            pid,
            target,
            breakpoints: BreakpointTable::new(),
            threads: HashMap::new(),
            current_thread: pid,
            current_breakpoint: None,
            debug,
            running: false,
            halt_requested: false,
            exited: None,
        };
        session.update_thread_list()?;
        Ok(session)
    }

    /// The process id of the traced process.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Whether the traced process has exited.
    pub fn exited(&self) -> bool {
        self.exited.is_some()
    }

    /// Whether the engine believes the target is currently executing.
    pub fn running(&self) -> bool {
        self.running
    }

    /// The thread operations act on by default.
    pub fn current_thread(&self) -> Pid {
        self.current_thread
    }

    /// The breakpoint most recently hit and not yet consumed.
    pub fn current_breakpoint(&self) -> Option<&Breakpoint> {
        self.current_breakpoint.as_ref()
    }

    /// The last stop observed on the current thread.
    pub fn status(&self) -> Option<StopEvent> {
        self.threads
            .get(&self.current_thread)
            .and_then(|ctx| ctx.status)
    }

    /// The known OS threads.
    pub fn threads(&self) -> impl Iterator<Item = &ThreadContext> {
        self.threads.values()
    }

    /// The underlying target, e.g. for embedder-specific inspection.
    pub fn target(&self) -> &T {
        &self.target
    }

    /// Mutable access to the underlying target.
    pub fn target_mut(&mut self) -> &mut T {
        &mut self.target
    }

    /// Synchronizes the thread-context arena with the OS thread list.
    pub fn update_thread_list(&mut self) -> Result<(), Error> {
        let tids = self.target.threads(self.pid)?;
        for tid in &tids {
            self.add_thread(*tid);
        }
        self.threads.retain(|tid, _| tids.contains(tid));
        if !self.threads.contains_key(&self.current_thread) {
            self.current_thread = self.pid;
        }
        Ok(())
    }

    pub(crate) fn add_thread(&mut self, tid: Pid) {
        self.threads
            .entry(tid)
            .or_insert_with(|| ThreadContext::new(tid));
    }

    pub(crate) fn ensure_thread(&self, tid: Pid) -> Result<(), Error> {
        if self.threads.contains_key(&tid) {
            Ok(())
        } else {
            Err(Error::ThreadNotFound(tid))
        }
    }

    pub(crate) fn mark_running(&mut self, tid: Pid) {
        if let Some(ctx) = self.threads.get_mut(&tid) {
            ctx.running = true;
        }
    }

    pub(crate) fn record_stop(&mut self, tid: Pid, event: StopEvent) {
        if let Some(ctx) = self.threads.get_mut(&tid) {
            ctx.running = false;
            ctx.status = Some(event);
        }
    }

    /// Thread ids in a stable order.
    pub fn thread_ids(&self) -> Vec<Pid> {
        let mut tids: Vec<Pid> = self.threads.keys().copied().collect();
        tids.sort_unstable();
        tids
    }

    /// Changes the current thread.
    pub fn switch_thread(&mut self, tid: Pid) -> Result<(), Error> {
        self.ensure_thread(tid)?;
        info!(from = %self.current_thread, to = %tid, "thread context changed");
        self.current_thread = tid;
        Ok(())
    }

    /// Installs a breakpoint at `addr` using the current thread.
    pub fn set_breakpoint(&mut self, addr: u64) -> Result<Breakpoint, Error> {
        let origin = self.origin_for(addr);
        self.set_breakpoint_on(self.current_thread, addr, false, origin)
    }

    /// Installs a breakpoint at a location string (`file:line`, function
    /// name, breakpoint id or raw address).
    pub fn set_breakpoint_at(&mut self, loc: &str) -> Result<Breakpoint, Error> {
        let addr = self.find_location(loc)?;
        self.set_breakpoint_on(self.current_thread, addr, false, loc.to_string())
    }

    /// Removes the breakpoint at `addr` using the current thread.
    pub fn clear_breakpoint(&mut self, addr: u64) -> Result<Breakpoint, Error> {
        self.clear_breakpoint_on(self.current_thread, addr)
    }

    /// Removes a breakpoint by location string.
    pub fn clear_breakpoint_at(&mut self, loc: &str) -> Result<Breakpoint, Error> {
        let addr = self.find_location(loc)?;
        self.clear_breakpoint(addr)
    }

    /// Finds the breakpoint whose address is exactly `pc`.
    pub fn find_breakpoint(&self, pc: u64) -> Option<&Breakpoint> {
        self.breakpoints.find(pc)
    }

    /// Removes every temp breakpoint.
    pub fn clear_temp_breakpoints(&mut self) -> Result<(), Error> {
        self.breakpoints
            .clear_temp(&mut self.target, self.current_thread)
    }

    fn origin_for(&self, addr: u64) -> String {
        match self.debug.symbols.pc_to_line(addr) {
            Some(pos) => format!("{}:{}", pos.file.display(), pos.line),
            None => format!("{addr:#x}"),
        }
    }

    /// Resolves a location string to a target address.
    ///
    /// `file:line` goes through the symbol table; a bare name is tried as a
    /// function; a number (decimal, `0x` hex or `0`-prefixed octal) is
    /// matched against breakpoint ids and finally taken as a raw address.
    pub fn find_location(&self, loc: &str) -> Result<u64, Error> {
        if let Some((file, line)) = loc.split_once(':') {
            let line: u64 = line
                .parse()
                .map_err(|_| Error::LocationNotFound(loc.to_string()))?;
            let path = std::path::absolute(file)
                .map_err(|_| Error::LocationNotFound(loc.to_string()))?;
            return self
                .debug
                .symbols
                .line_to_pc(&path, line)
                .ok_or_else(|| Error::LocationNotFound(loc.to_string()));
        }

        if let Some(func) = self.debug.symbols.lookup_func(loc) {
            return Ok(func.entry);
        }

        let number =
            parse_prefixed_uint(loc).ok_or_else(|| Error::LocationNotFound(loc.to_string()))?;

        if let Ok(id) = u32::try_from(number) {
            if let Some(bp) = self.breakpoints.by_id(id) {
                return Ok(bp.addr);
            }
        }

        // Last resort: a raw target address.
        Ok(number)
    }

    /// Resumes the whole process and blocks until something halts it.
    pub fn cont(&mut self) -> Result<(), Error> {
        for tid in self.thread_ids() {
            self.continue_thread(tid)?;
        }
        self.run(Self::resume_wait)
    }

    fn resume_wait(&mut self) -> Result<(), Error> {
        let tid = self.trap_wait()?;
        if self.current_thread != tid {
            self.switch_thread(tid)?;
        }
        let pc = self.thread_pc(tid)?;

        if matches!(&self.current_breakpoint, Some(bp) if !bp.temp) {
            return self.halt();
        }

        // A trap out of `runtime.breakpoint` is the program asking for the
        // debugger; two single steps put the thread back in user code.
        if let Some(func) = self.debug.symbols.func_for_pc(pc) {
            if func.name == RUNTIME_BREAKPOINT {
                for _ in 0..2 {
                    self.step_thread(tid)?;
                }
                return self.halt();
            }
        }

        Err(Error::UnrecognizedTrap { pc })
    }

    /// Single-steps every non-blocked thread one instruction.
    pub fn step(&mut self) -> Result<(), Error> {
        self.run(|session| {
            for tid in session.thread_ids() {
                if session.thread_blocked(tid)? {
                    continue;
                }
                session.step_thread(tid)?;
            }
            Ok(())
        })
    }

    /// Steps the current goroutine to the next source line, stepping over
    /// function calls and across OS threads if the scheduler migrates it.
    pub fn next(&mut self) -> Result<(), Error> {
        self.run(|session| {
            let result = session.next_inner();
            // Temp breakpoints never outlive the operation that installed
            // them, success or not.
            let cleanup = session.clear_temp_breakpoints();
            result.and(cleanup)
        })
    }

    fn next_inner(&mut self) -> Result<(), Error> {
        let issuing_thread = self.current_thread;
        let goroutine = self.current_goroutine(issuing_thread)?;

        for tid in self.thread_ids() {
            if self.thread_blocked(tid)? {
                // Threads not running Go code just get resumed.
                self.continue_thread(tid)?;
                continue;
            }
            match self.next_thread(tid) {
                Err(Error::GoroutineExiting(id)) if tid != issuing_thread => {
                    debug!(goroutine = id, thread = %tid, "goroutine exiting, skipping thread");
                    continue;
                }
                result => result?,
            }
        }

        loop {
            let tid = self.trap_wait()?;
            if let Some(bp) = self.current_breakpoint.clone() {
                self.clear_temp_breakpoint(tid, bp.addr)?;
            }
            // Only a stop on the goroutine that issued the next counts as
            // arrival; any other goroutine tripping a temp breakpoint just
            // resumes the wait.
            let stopped = self.current_goroutine(tid)?;
            if stopped.id == goroutine.id {
                if self.current_thread != tid {
                    self.switch_thread(tid)?;
                }
                break;
            }
        }

        self.halt()
    }

    /// Stops every thread of the target.
    pub fn halt(&mut self) -> Result<(), Error> {
        for tid in self.thread_ids() {
            self.target.interrupt(tid)?;
        }
        Ok(())
    }

    /// Asks the in-flight operation to stop: every thread is sent a stop
    /// signal, and the wait loop converts the resulting stop into a
    /// `ManualStop` signal that [`Session::run`]'s wrapper swallows.
    pub fn request_manual_stop(&mut self) -> Result<(), Error> {
        self.halt_requested = true;
        for tid in self.thread_ids() {
            self.target.interrupt(tid)?;
        }
        self.running = false;
        Ok(())
    }

    /// Runs a blocking operation with the session bookkeeping around it.
    pub(crate) fn run(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<(), Error>,
    ) -> Result<(), Error> {
        if let Some(status) = self.exited {
            return Err(Error::ProcessExited {
                pid: self.pid,
                status,
            });
        }
        self.running = true;
        self.halt_requested = false;
        self.current_breakpoint = None;

        let result = f(self);
        self.running = false;

        match result {
            Err(Error::ManualStop) => Ok(()),
            other => other,
        }
    }

    /// Blocks until any thread traps, servicing thread lifecycle events on
    /// the way. Returns the stopped thread with [`Session::current_breakpoint`]
    /// updated to the breakpoint it hit, if any.
    pub(crate) fn trap_wait(&mut self) -> Result<Pid, Error> {
        loop {
            match self.target.wait_any()? {
                TraceEvent::ProcessExited(pid, status) if pid == self.pid => {
                    self.exited = Some(status);
                    return Err(Error::ProcessExited { pid, status });
                }
                TraceEvent::ProcessExited(..) => continue,
                TraceEvent::NewThread(tid) => {
                    debug!(thread = %tid, "new thread");
                    self.add_thread(tid);
                    self.target.cont(tid)?;
                    self.mark_running(tid);
                }
                TraceEvent::ThreadExited(tid) => {
                    debug!(thread = %tid, "thread exited");
                    self.threads.remove(&tid);
                    if self.current_thread == tid {
                        self.current_thread = self.pid;
                    }
                }
                TraceEvent::Trap(tid) => {
                    self.record_stop(tid, StopEvent::Trap);
                    self.handle_breakpoint_on_thread(tid)?;
                    return Ok(tid);
                }
                TraceEvent::Stopped(tid, sig) => {
                    self.record_stop(tid, StopEvent::Signal(sig));
                    if sig == Signal::SIGSTOP && self.halt_requested {
                        return Err(Error::ManualStop);
                    }
                }
            }
        }
    }

    /// Classifies the stop of a trapped thread against the breakpoint
    /// table. Hardware stops report the armed address exactly; software
    /// stops report the instruction after the trap byte, hence the `pc - 1`
    /// probe.
    fn handle_breakpoint_on_thread(&mut self, tid: Pid) -> Result<(), Error> {
        let pc = self.thread_pc(tid)?;
        if let Some(bp) = self.breakpoints.hardware_at(pc) {
            self.current_breakpoint = Some(bp.clone());
        } else if let Some(bp) = self.breakpoints.software_at(pc.wrapping_sub(1)) {
            self.current_breakpoint = Some(bp.clone());
        }
        Ok(())
    }

    /// Register values of the current thread.
    pub fn registers(&mut self) -> Result<T::Regs, Error> {
        self.thread_registers(self.current_thread)
    }

    /// Program counter of the current thread.
    pub fn current_pc(&mut self) -> Result<u64, Error> {
        self.thread_pc(self.current_thread)
    }

    /// Resolves a program counter to its source position.
    pub fn pc_to_line(&self, pc: u64) -> Option<Position> {
        self.debug.symbols.pc_to_line(pc)
    }

    /// Source files the target binary was built from.
    pub fn sources(&self) -> Vec<PathBuf> {
        self.debug.symbols.files()
    }

    /// Functions in the target binary.
    pub fn funcs(&self) -> Vec<Function> {
        self.debug.symbols.funcs()
    }

    /// Evaluates a package-level variable by name and renders its value.
    pub fn eval_symbol(&mut self, name: &str) -> Result<Variable, Error> {
        let def = self.debug.runtime.variable(name)?;
        let tid = self.current_thread;

        let value = match def.kind {
            VariableKind::Int => {
                let raw = self.read_word(tid, def.addr, def.size)?;
                sign_extend(raw, def.size).to_string()
            }
            VariableKind::Uint => self.read_word(tid, def.addr, def.size)?.to_string(),
            VariableKind::Bool => {
                let raw = self.read_word(tid, def.addr, 1)?;
                (raw != 0).to_string()
            }
            VariableKind::Pointer => {
                let size = self.debug.runtime.pointer_size();
                format!("{:#x}", self.read_word(tid, def.addr, size)?)
            }
            VariableKind::String => self.read_go_string(tid, def.addr)?,
        };

        Ok(Variable {
            name: name.to_string(),
            value,
            typ: def.typ,
        })
    }
}

/// Parses an unsigned integer the way Go's `strconv.ParseUint(s, 0, 64)`
/// does: `0x` prefix for hex, a leading `0` for octal, decimal otherwise.
fn parse_prefixed_uint(s: &str) -> Option<u64> {
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else if s.len() > 1 && s.starts_with('0') {
        u64::from_str_radix(&s[1..], 8).ok()
    } else {
        s.parse().ok()
    }
}

fn sign_extend(raw: u64, size: usize) -> i64 {
    let shift = 64 - 8 * size.clamp(1, 8) as u32;
    ((raw << shift) as i64) >> shift
}
