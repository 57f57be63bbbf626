/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![cfg(target_os = "linux")]

//! A safe ptrace API. This API forces correct usage of ptrace in that it is
//! not possible to issue a ptrace request against a process that is not in a
//! ptrace-stop: requests only exist on [`Stopped`], and resuming a tracee
//! consumes the `Stopped` value and hands back a [`Running`] one.

mod memory;
mod regs;

use nix::sys::ptrace;
// Re-exports so that nothing else needs to depend on `nix`.
pub use nix::errno::Errno;
pub use nix::sys::ptrace::Options;
pub use nix::sys::signal::Signal;
use nix::sys::wait::waitpid;
use nix::sys::wait::WaitPidFlag;
use nix::sys::wait::WaitStatus;
pub use nix::unistd::Pid;
use thiserror::Error;

pub use crate::regs::Regs;
pub use crate::regs::HW_BREAKPOINT_SLOTS;

/// An error that occurred during tracing.
#[derive(Error, Debug, Eq, PartialEq)]
pub enum Error {
    /// A low-level errno.
    #[error(transparent)]
    Errno(#[from] Errno),

    /// The tracee died unexpectedly while we believed it to be in a stopped
    /// state. This should be handled gracefully by reaping the zombie.
    #[error("tracee {0} is a zombie")]
    Died(Pid),
}

/// How a process finished.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ExitStatus {
    /// The process exited normally with the given exit code.
    Exited(i32),
    /// The process was killed by a signal. The flag is set if a core dump was
    /// produced.
    Signaled(Signal, bool),
}

/// A stop event. Documentation is from `ptrace(2)`.
#[derive(Debug, Eq, PartialEq)]
pub enum Event {
    /// The tracee was stopped by delivery of a signal.
    Signal(Signal),

    /// Stop before return from `clone(2)`. The payload is the new thread,
    /// which is in a running state until it is waited on.
    NewChild(Running),

    /// Stop induced by a group-stop or `PTRACE_INTERRUPT`.
    Stop,
}

impl Event {
    /// Converts a raw ptrace event code and gets any associated data. There
    /// is no danger in calling ptrace here because the process is guaranteed
    /// to be in a ptrace-stop when this function is called.
    fn from_ptrace_event(task: &Stopped, event: i32) -> Result<Self, Error> {
        match event {
            libc::PTRACE_EVENT_CLONE => {
                let child = Pid::from_raw(task.getevent()? as i32);
                Ok(Self::NewChild(Running(child)))
            }
            libc::PTRACE_EVENT_STOP => Ok(Self::Stop),
            _ => unreachable!("unknown ptrace event {:#x}", event),
        }
    }
}

/// The result of a blocking wait. A process in this state is guaranteed to
/// not be in a running state.
///
/// Both `Clone` and `Copy` are intentionally not implemented. This is to
/// enforce type safety.
#[derive(Debug, Eq, PartialEq)]
pub enum Wait {
    /// The process is in a stopped state and thus only operations that can
    /// be done during a stopped state are allowed (i.e., ptrace operations).
    Stopped(Stopped, Event),

    /// The process has exited with an exit status.
    Exited(Pid, ExitStatus),
}

impl Wait {
    /// Returns the PID for this state.
    pub fn pid(&self) -> Pid {
        match self {
            Self::Stopped(Stopped(pid), _) => *pid,
            Self::Exited(pid, _) => *pid,
        }
    }

    fn from_wait_status(status: WaitStatus) -> Result<Self, Error> {
        Ok(match status {
            WaitStatus::Exited(pid, code) => Self::Exited(pid, ExitStatus::Exited(code)),
            WaitStatus::Signaled(pid, sig, coredump) => {
                Self::Exited(pid, ExitStatus::Signaled(sig, coredump))
            }
            WaitStatus::Stopped(pid, sig) => Self::Stopped(Stopped(pid), Event::Signal(sig)),
            WaitStatus::PtraceEvent(pid, _sig, event) => {
                let task = Stopped(pid);
                let event = Event::from_ptrace_event(&task, event)?;
                Self::Stopped(task, event)
            }
            WaitStatus::PtraceSyscall(_) => {
                // Not possible because we never trace with TRACESYSGOOD.
                unreachable!("unexpected WaitStatus::PtraceSyscall");
            }
            WaitStatus::Continued(_) => {
                // Not possible because we never wait with WCONTINUED.
                unreachable!("unexpected WaitStatus::Continued");
            }
            WaitStatus::StillAlive => {
                // Not possible without WNOHANG.
                unreachable!("unexpected WaitStatus::StillAlive");
            }
        })
    }
}

/// Helper for waiting. Restarts the wait when interrupted by a signal.
fn wait(pid: Option<Pid>, flags: WaitPidFlag) -> Result<WaitStatus, Errno> {
    loop {
        match waitpid(pid, Some(flags)) {
            Err(Errno::EINTR) => continue,
            result => return result,
        }
    }
}

/// Waits for a state change in any thread of any traced process, blocking
/// until the next event. Returns `None` when there are no children left to
/// wait for.
pub fn wait_all() -> Result<Option<Wait>, Error> {
    match wait(Some(Pid::from_raw(-1)), WaitPidFlag::__WALL) {
        Ok(status) => Wait::from_wait_status(status).map(Some),
        Err(Errno::ECHILD) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// A process that is in a stopped state and allows ptrace operations to be
/// performed.
#[derive(Debug, Hash, Eq, PartialEq)]
pub struct Stopped(Pid);

impl Stopped {
    /// Helper for converting from the Errno type.
    ///
    /// According to ptrace(2), any ptrace operation may return ESRCH for a
    /// process that is (a) dead, (b) not traced by the caller, or (c) not
    /// stopped. Since this API makes (b) and (c) unrepresentable, ESRCH here
    /// means the tracee died while in a stopped state.
    fn map_err(&self, err: Errno) -> Error {
        if err == Errno::ESRCH {
            Error::Died(self.0)
        } else {
            Error::Errno(err)
        }
    }

    /// Creates a new stopped state. This is useful when we know the process
    /// is in a stopped state already.
    ///
    /// Using this method is unsound when the pid is not actually in a
    /// ptrace-stop. It is better to arrive at a stopped state via
    /// [`Running::wait`].
    pub fn new_unchecked(pid: Pid) -> Self {
        Stopped(pid)
    }

    /// Returns the process ID of the tracee.
    pub fn pid(&self) -> Pid {
        self.0
    }

    /// Sets the ptracer options.
    pub fn setoptions(&self, options: Options) -> Result<(), Error> {
        ptrace::setoptions(self.0, options).map_err(|err| self.map_err(err))
    }

    /// Gets the current state of the general purpose registers.
    pub fn getregs(&self) -> Result<Regs, Error> {
        ptrace::getregs(self.0).map_err(|err| self.map_err(err))
    }

    /// Sets the general purpose registers.
    pub fn setregs(&self, regs: &Regs) -> Result<(), Error> {
        ptrace::setregs(self.0, *regs).map_err(|err| self.map_err(err))
    }

    /// Retrieves a message about the ptrace event that just happened.
    pub fn getevent(&self) -> Result<i64, Error> {
        ptrace::getevent(self.0).map_err(|err| self.map_err(err))
    }

    /// Resumes the process and transitions it back to a running state.
    pub fn resume<T: Into<Option<Signal>>>(self, sig: T) -> Result<Running, Error> {
        ptrace::cont(self.0, sig.into()).map_err(|err| self.map_err(err))?;
        Ok(Running(self.0))
    }

    /// Advances the execution of the process by a single instruction,
    /// optionally delivering the signal specified by `sig`.
    pub fn step<T: Into<Option<Signal>>>(self, sig: T) -> Result<Running, Error> {
        ptrace::step(self.0, sig.into()).map_err(|err| self.map_err(err))?;
        Ok(Running(self.0))
    }

    /// Detaches from and then resumes the stopped tracee.
    pub fn detach(self) -> Result<(), Error> {
        ptrace::detach(self.0, None).map_err(|err| self.map_err(err))
    }
}

/// A running tracee. The only thing that can be done with it is to wait for
/// its next state change.
#[derive(Debug, Hash, Eq, PartialEq)]
pub struct Running(Pid);

impl Running {
    /// Creates a new running process. This is the entry point for a thread
    /// we have been told about (e.g. via a clone event) but have not waited
    /// on yet.
    pub fn new(pid: Pid) -> Self {
        Running(pid)
    }

    /// Attaches to a running process. The process becomes a tracee and a
    /// SIGSTOP is sent to it. By the time this function returns the tracee
    /// may not yet have stopped; it must be waited on to observe the stop.
    pub fn attach(pid: Pid) -> Result<Self, Errno> {
        ptrace::attach(pid)?;
        Ok(Running(pid))
    }

    /// Returns the pid of the running process.
    pub fn pid(&self) -> Pid {
        self.0
    }

    /// Blocks until a state change occurs. This transitions the process to
    /// either a stopped state or an exited state, never a running state.
    pub fn wait(self) -> Result<Wait, Error> {
        let status = wait(Some(self.0), WaitPidFlag::__WALL).map_err(Error::from)?;
        Wait::from_wait_status(status)
    }
}

/// Sends a group-stop to a single thread of a traced process via
/// `tgkill(2)`. The stop is observed by a subsequent wait.
pub fn stop_thread(tgid: Pid, tid: Pid) -> Result<(), Errno> {
    Errno::result(unsafe {
        libc::syscall(
            libc::SYS_tgkill,
            tgid.as_raw(),
            tid.as_raw(),
            Signal::SIGSTOP as libc::c_int,
        )
    })
    .map(drop)
}

/// Spawns `argv` as a traced child. The child enables tracing on itself
/// before calling `execvp(3)`, so the parent observes the post-execve
/// SIGTRAP stop before the first user instruction runs.
pub fn spawn_traced(argv: &[String]) -> Result<Running, Error> {
    use std::ffi::CString;

    if argv.is_empty() {
        return Err(Error::Errno(Errno::EINVAL));
    }

    let args = argv
        .iter()
        .map(|arg| CString::new(arg.as_str()).map_err(|_| Errno::EINVAL))
        .collect::<Result<Vec<_>, Errno>>()?;

    match unsafe { nix::unistd::fork() }.map_err(Error::from)? {
        nix::unistd::ForkResult::Parent { child } => Ok(Running(child)),
        nix::unistd::ForkResult::Child => {
            // In the child: nothing here may allocate or lock. Failures exit
            // with 127, which the parent observes as an early process exit.
            if ptrace::traceme().is_err() {
                unsafe { libc::_exit(127) };
            }
            let _ = nix::unistd::execvp(args[0].as_c_str(), &args);
            unsafe { libc::_exit(127) };
        }
    }
}

#[cfg(test)]
mod test {
    use nix::sys::signal;
    use nix::unistd::fork;
    use nix::unistd::ForkResult;

    use super::*;

    // Traces a closure in a forked child. The child stops itself so the
    // parent can set things up before any of the closure runs.
    fn trace<F>(f: F) -> Result<(Pid, Stopped), Error>
    where
        F: FnOnce() -> i32,
    {
        match unsafe { fork() }? {
            ForkResult::Parent { child, .. } => {
                let running = Running::new(child);
                match running.wait()? {
                    Wait::Stopped(stopped, Event::Signal(Signal::SIGSTOP)) => {
                        Ok((child, stopped))
                    }
                    wait => panic!("got unexpected initial state: {:?}", wait),
                }
            }
            ForkResult::Child => {
                ptrace::traceme().unwrap();
                signal::raise(Signal::SIGSTOP).unwrap();

                let exit_code = f();

                // Skip atexit handlers since `execve` was never called.
                unsafe { libc::_exit(exit_code) };
            }
        }
    }

    #[test]
    fn resume_until_exit() -> Result<(), Error> {
        let (pid, tracee) = trace(|| 42)?;
        assert_eq!(
            tracee.resume(None)?.wait()?,
            Wait::Exited(pid, ExitStatus::Exited(42))
        );
        Ok(())
    }

    #[test]
    fn single_step_advances_pc() -> Result<(), Error> {
        let (_pid, tracee) = trace(|| 0)?;

        let before = tracee.getregs()?.rip;
        let (tracee, event) = match tracee.step(None)?.wait()? {
            Wait::Stopped(stopped, event) => (stopped, event),
            wait => panic!("expected a stop, got {:?}", wait),
        };
        assert_eq!(event, Event::Signal(Signal::SIGTRAP));
        assert_ne!(tracee.getregs()?.rip, before);

        tracee.resume(None)?.wait()?;
        Ok(())
    }

    #[test]
    fn set_pc_round_trips() -> Result<(), Error> {
        let (_pid, tracee) = trace(|| 0)?;

        let mut regs = tracee.getregs()?;
        let original = regs.rip;
        regs.rip = original.wrapping_add(32);
        tracee.setregs(&regs)?;
        assert_eq!(tracee.getregs()?.rip, original.wrapping_add(32));

        // Put things back so the child can exit cleanly.
        regs.rip = original;
        tracee.setregs(&regs)?;
        tracee.resume(None)?.wait()?;
        Ok(())
    }

    // A few instructions for the tracee to run through; used as a patch
    // target for the breakpoint tests below. The child shares our image, so
    // the parent can compute its address directly.
    #[inline(never)]
    fn patch_target() -> u64 {
        std::hint::black_box(7u64).wrapping_mul(6)
    }

    #[test]
    fn software_breakpoint_fires_past_trap_byte() -> Result<(), Error> {
        let (_pid, mut tracee) = trace(|| {
            patch_target();
            0
        })?;

        let addr = patch_target as usize as u64;

        // Patch a trap byte over the function entry, remembering the
        // original instruction byte.
        let mut original = [0u8; 1];
        tracee.read_memory(addr, &mut original)?;
        tracee.write_memory(addr, &[0xcc])?;

        let (stopped, event) = match tracee.resume(None)?.wait()? {
            Wait::Stopped(stopped, event) => (stopped, event),
            wait => panic!("expected a breakpoint stop, got {:?}", wait),
        };
        assert_eq!(event, Event::Signal(Signal::SIGTRAP));
        tracee = stopped;

        // The CPU reports the instruction after the trap byte.
        let mut regs = tracee.getregs()?;
        assert_eq!(regs.rip, addr + 1);

        // Restore the instruction and rewind so the child can finish.
        tracee.write_memory(addr, &original)?;
        regs.rip = addr;
        tracee.setregs(&regs)?;

        assert!(matches!(
            tracee.resume(None)?.wait()?,
            Wait::Exited(_, ExitStatus::Exited(0))
        ));
        Ok(())
    }

    #[test]
    fn hardware_breakpoint_fires_at_address() -> Result<(), Error> {
        let (_pid, tracee) = trace(|| {
            patch_target();
            0
        })?;

        let addr = patch_target as usize as u64;
        tracee.set_hw_breakpoint(0, addr)?;

        let (stopped, event) = match tracee.resume(None)?.wait()? {
            Wait::Stopped(stopped, event) => (stopped, event),
            wait => panic!("expected a breakpoint stop, got {:?}", wait),
        };
        assert_eq!(event, Event::Signal(Signal::SIGTRAP));

        // Unlike a software trap, the PC is exactly the armed address.
        assert_eq!(stopped.getregs()?.rip, addr);

        stopped.clear_hw_breakpoint(0)?;
        assert!(matches!(
            stopped.resume(None)?.wait()?,
            Wait::Exited(_, ExitStatus::Exited(0))
        ));
        Ok(())
    }

    #[test]
    fn remote_memory_round_trips() -> Result<(), Error> {
        let payload: Vec<u8> = (0..=255).cycle().take(5000).collect();

        let (_pid, mut tracee) = trace(|| 0)?;

        // The child shares this stack frame's image of `payload`.
        let addr = payload.as_ptr() as u64;

        let mut readback = vec![0u8; payload.len()];
        tracee.read_memory(addr, &mut readback)?;
        assert_eq!(readback, payload);

        let reversed: Vec<u8> = payload.iter().rev().copied().collect();
        tracee.write_memory(addr, &reversed)?;
        tracee.read_memory(addr, &mut readback)?;
        assert_eq!(readback, reversed);

        tracee.resume(None)?.wait()?;
        Ok(())
    }
}
