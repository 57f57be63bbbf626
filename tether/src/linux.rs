/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The Linux [`Target`]: ptrace through `tether-trace`.
//!
//! Each traced thread is tracked as either stopped or running; the
//! type-state API underneath makes it impossible to issue a ptrace request
//! against a thread in the wrong state, so a state mismatch here surfaces
//! as [`Error::ThreadNotFound`] instead of a raced ptrace failure.

use std::collections::HashMap;

use tether_trace as trace;
use tether_trace::Errno;
use tether_trace::ExitStatus;
use tether_trace::Options;
use tether_trace::Pid;
use tether_trace::Signal;

use crate::debuginfo::DebugDataSource;
use crate::error::Error;
use crate::session::Session;
use crate::target::RegisterFile;
use crate::target::Target;
use crate::target::TraceEvent;

/// Saved x86-64 register file.
#[derive(Clone, Copy)]
pub struct LinuxRegs(
    /// The raw register set, opaque to the engine.
    pub trace::Regs,
);

impl RegisterFile for LinuxRegs {
    fn pc(&self) -> u64 {
        self.0.rip
    }

    fn sp(&self) -> u64 {
        self.0.rsp
    }
}

enum Handle {
    Stopped(trace::Stopped),
    Running(trace::Running),
}

/// Ptrace-backed target for Linux x86-64.
#[derive(Default)]
pub struct LinuxTarget {
    pid: Option<Pid>,
    threads: HashMap<Pid, Handle>,
}

impl LinuxTarget {
    /// Creates a target not yet bound to a process.
    pub fn new() -> Self {
        Self::default()
    }

    fn pid(&self) -> Pid {
        // The session always attaches or launches before anything else.
        self.pid.unwrap_or_else(|| Pid::from_raw(0))
    }

    fn stopped(&self, tid: Pid) -> Result<&trace::Stopped, Error> {
        match self.threads.get(&tid) {
            Some(Handle::Stopped(stopped)) => Ok(stopped),
            _ => Err(Error::ThreadNotFound(tid)),
        }
    }

    fn stopped_mut(&mut self, tid: Pid) -> Result<&mut trace::Stopped, Error> {
        match self.threads.get_mut(&tid) {
            Some(Handle::Stopped(stopped)) => Ok(stopped),
            _ => Err(Error::ThreadNotFound(tid)),
        }
    }

    /// Consumes signal stops until the initial attach SIGSTOP arrives.
    fn wait_attach_stop(mut running: trace::Running) -> Result<trace::Stopped, trace::Error> {
        loop {
            match running.wait()? {
                trace::Wait::Stopped(stopped, trace::Event::Signal(Signal::SIGSTOP)) => {
                    return Ok(stopped);
                }
                trace::Wait::Stopped(stopped, trace::Event::Signal(sig)) => {
                    running = stopped.resume(sig)?;
                }
                trace::Wait::Stopped(stopped, _) => {
                    running = stopped.resume(None)?;
                }
                trace::Wait::Exited(pid, _) => {
                    return Err(trace::Error::Died(pid));
                }
            }
        }
    }

    fn attach_thread(&mut self, tid: Pid) -> Result<(), trace::Error> {
        let running = trace::Running::attach(tid)?;
        let stopped = Self::wait_attach_stop(running)?;
        stopped.setoptions(Options::PTRACE_O_TRACECLONE)?;
        self.threads.insert(tid, Handle::Stopped(stopped));
        Ok(())
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    match status {
        ExitStatus::Exited(code) => code,
        ExitStatus::Signaled(sig, _) => 128 + sig as i32,
    }
}

fn io_errno(err: &std::io::Error) -> Errno {
    Errno::from_i32(err.raw_os_error().unwrap_or(Errno::EIO as i32))
}

/// Enumerates the thread ids of a process from procfs.
fn proc_thread_ids(pid: Pid) -> Result<Vec<Pid>, trace::Error> {
    let dir = format!("/proc/{pid}/task");
    let entries = std::fs::read_dir(dir).map_err(|err| trace::Error::Errno(io_errno(&err)))?;

    let mut tids = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| trace::Error::Errno(io_errno(&err)))?;
        if let Some(tid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<i32>().ok())
        {
            tids.push(Pid::from_raw(tid));
        }
    }
    Ok(tids)
}

impl Target for LinuxTarget {
    type Regs = LinuxRegs;

    fn attach(&mut self, pid: Pid) -> Result<(), Error> {
        let attach_all = |target: &mut Self| -> Result<(), trace::Error> {
            let running = trace::Running::attach(pid)?;
            let stopped = Self::wait_attach_stop(running)?;
            stopped.setoptions(Options::PTRACE_O_TRACECLONE)?;
            target.threads.insert(pid, Handle::Stopped(stopped));

            // Threads that already exist never produce a clone event; pick
            // them up from procfs.
            for tid in proc_thread_ids(pid)? {
                if tid != pid {
                    target.attach_thread(tid)?;
                }
            }
            Ok(())
        };

        self.pid = Some(pid);
        attach_all(self).map_err(|source| Error::AttachFailed { pid, source })
    }

    fn launch(&mut self, argv: &[String]) -> Result<Pid, Error> {
        let program = argv.first().cloned().unwrap_or_default();
        let failed = |source| Error::LaunchFailed {
            program: program.clone(),
            source,
        };

        let running = trace::spawn_traced(argv).map_err(&failed)?;
        let pid = running.pid();

        // The child stops with SIGTRAP on return from execve.
        match running.wait().map_err(&failed)? {
            trace::Wait::Stopped(stopped, _) => {
                stopped
                    .setoptions(Options::PTRACE_O_TRACECLONE)
                    .map_err(&failed)?;
                self.threads.insert(pid, Handle::Stopped(stopped));
            }
            trace::Wait::Exited(pid, status) => {
                return Err(Error::ProcessExited {
                    pid,
                    status: exit_code(status),
                });
            }
        }

        self.pid = Some(pid);
        Ok(pid)
    }

    fn threads(&mut self, _pid: Pid) -> Result<Vec<Pid>, Error> {
        Ok(self.threads.keys().copied().collect())
    }

    fn supports_hw_breakpoints(&self) -> bool {
        true
    }

    fn registers(&mut self, tid: Pid) -> Result<Self::Regs, Error> {
        let regs = self
            .stopped(tid)?
            .getregs()
            .map_err(|source| Error::Register { tid, source })?;
        Ok(LinuxRegs(regs))
    }

    fn set_registers(&mut self, tid: Pid, regs: &Self::Regs) -> Result<(), Error> {
        self.stopped(tid)?
            .setregs(&regs.0)
            .map_err(|source| Error::Register { tid, source })
    }

    fn set_pc(&mut self, tid: Pid, pc: u64) -> Result<(), Error> {
        let stopped = self.stopped(tid)?;
        let mut regs = stopped
            .getregs()
            .map_err(|source| Error::Register { tid, source })?;
        regs.rip = pc;
        stopped
            .setregs(&regs)
            .map_err(|source| Error::Register { tid, source })
    }

    fn read_memory(&mut self, tid: Pid, addr: u64, buf: &mut [u8]) -> Result<(), Error> {
        self.stopped(tid)?
            .read_memory(addr, buf)
            .map_err(|source| Error::Memory { tid, addr, source })
    }

    fn write_memory(&mut self, tid: Pid, addr: u64, data: &[u8]) -> Result<(), Error> {
        self.stopped_mut(tid)?
            .write_memory(addr, data)
            .map_err(|source| Error::Memory { tid, addr, source })
    }

    fn cont(&mut self, tid: Pid) -> Result<(), Error> {
        match self.threads.remove(&tid) {
            Some(Handle::Stopped(stopped)) => match stopped.resume(None) {
                Ok(running) => {
                    self.threads.insert(tid, Handle::Running(running));
                    Ok(())
                }
                Err(source) => Err(Error::Trace { tid, source }),
            },
            Some(running @ Handle::Running(_)) => {
                self.threads.insert(tid, running);
                Err(Error::ThreadNotFound(tid))
            }
            None => Err(Error::ThreadNotFound(tid)),
        }
    }

    fn step(&mut self, tid: Pid) -> Result<(), Error> {
        let stopped = match self.threads.remove(&tid) {
            Some(Handle::Stopped(stopped)) => stopped,
            Some(running @ Handle::Running(_)) => {
                self.threads.insert(tid, running);
                return Err(Error::ThreadNotFound(tid));
            }
            None => return Err(Error::ThreadNotFound(tid)),
        };

        let running = stopped
            .step(None)
            .map_err(|source| Error::Trace { tid, source })?;
        match running.wait().map_err(|source| Error::Trace { tid, source })? {
            trace::Wait::Stopped(stopped, _) => {
                self.threads.insert(tid, Handle::Stopped(stopped));
                Ok(())
            }
            trace::Wait::Exited(pid, status) => Err(Error::ProcessExited {
                pid,
                status: exit_code(status),
            }),
        }
    }

    fn set_hw_breakpoint(&mut self, tid: Pid, slot: usize, addr: u64) -> Result<(), Error> {
        self.stopped(tid)?
            .set_hw_breakpoint(slot, addr)
            .map_err(|source| Error::Register { tid, source })
    }

    fn clear_hw_breakpoint(&mut self, tid: Pid, slot: usize) -> Result<(), Error> {
        self.stopped(tid)?
            .clear_hw_breakpoint(slot)
            .map_err(|source| Error::Register { tid, source })
    }

    fn wait_any(&mut self) -> Result<TraceEvent, Error> {
        let pid = self.pid();
        let wait = trace::wait_all().map_err(|source| Error::Trace { tid: pid, source })?;

        match wait {
            None => Ok(TraceEvent::ProcessExited(pid, 0)),
            Some(trace::Wait::Exited(tid, status)) => {
                self.threads.remove(&tid);
                if tid == pid {
                    Ok(TraceEvent::ProcessExited(tid, exit_code(status)))
                } else {
                    Ok(TraceEvent::ThreadExited(tid))
                }
            }
            Some(trace::Wait::Stopped(stopped, event)) => {
                let tid = stopped.pid();
                match event {
                    trace::Event::Signal(Signal::SIGTRAP) => {
                        self.threads.insert(tid, Handle::Stopped(stopped));
                        Ok(TraceEvent::Trap(tid))
                    }
                    trace::Event::Signal(sig) => {
                        self.threads.insert(tid, Handle::Stopped(stopped));
                        Ok(TraceEvent::Stopped(tid, sig))
                    }
                    trace::Event::Stop => {
                        self.threads.insert(tid, Handle::Stopped(stopped));
                        Ok(TraceEvent::Stopped(tid, Signal::SIGSTOP))
                    }
                    trace::Event::NewChild(child) => {
                        self.threads.insert(tid, Handle::Stopped(stopped));
                        let child_tid = child.pid();
                        // The clone arrives stopped as well; consume its
                        // initial stop so the engine can resume it directly.
                        match child.wait().map_err(|source| Error::Trace {
                            tid: child_tid,
                            source,
                        })? {
                            trace::Wait::Stopped(child_stopped, _) => {
                                self.threads.insert(child_tid, Handle::Stopped(child_stopped));
                                Ok(TraceEvent::NewThread(child_tid))
                            }
                            trace::Wait::Exited(..) => Ok(TraceEvent::ThreadExited(child_tid)),
                        }
                    }
                }
            }
        }
    }

    fn interrupt(&mut self, tid: Pid) -> Result<(), Error> {
        trace::stop_thread(self.pid(), tid).map_err(|errno| Error::Trace {
            tid,
            source: trace::Error::Errno(errno),
        })
    }
}

impl Session<LinuxTarget> {
    /// Attaches to a running process.
    pub fn attach(pid: Pid, source: &dyn DebugDataSource) -> Result<Self, Error> {
        Session::attach_with(LinuxTarget::new(), pid, source)
    }

    /// Launches `argv` under trace.
    pub fn launch(argv: &[String], source: &dyn DebugDataSource) -> Result<Self, Error> {
        Session::launch_with(LinuxTarget::new(), argv, source)
    }
}
