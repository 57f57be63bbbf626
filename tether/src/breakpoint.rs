/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The breakpoint table: the authoritative mapping from target address to
//! breakpoint record.
//!
//! A breakpoint is either *hardware* (one of the four debug-register slots)
//! or *software* (a trap byte patched over the first byte of the
//! instruction at its address). Hardware is strictly preferred while a slot
//! is free; once installed, a breakpoint never migrates between kinds.

use std::collections::HashMap;

use tether_trace::Pid;
use tracing::debug;

use crate::error::Error;
use crate::target::Target;

/// The single-byte instruction that raises a breakpoint exception (`int3`).
pub const TRAP_INSTRUCTION: u8 = 0xcc;

/// Number of debug-register slots.
pub const HW_SLOTS: usize = 4;

/// How a breakpoint is physically realized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakpointKind {
    /// Armed in a fixed debug-register slot (0..=3).
    Hardware {
        /// The debug-register index.
        slot: usize,
    },
    /// A trap byte patched over the instruction stream.
    Software {
        /// The byte that was overwritten, restored on clear.
        original: u8,
    },
}

/// A stop point installed in the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Breakpoint {
    /// Session-unique, strictly monotone id (first id is 1).
    pub id: u32,
    /// Target address of the patched or armed instruction.
    pub addr: u64,
    /// Physical realization.
    pub kind: BreakpointKind,
    /// Set for breakpoints installed to implement a higher-level operation
    /// (e.g. next-line); cleared in bulk when that operation completes.
    pub temp: bool,
    /// The location the user asked for, purely informational.
    pub origin: String,
}

impl Breakpoint {
    /// Whether this breakpoint occupies a debug-register slot.
    pub fn is_hardware(&self) -> bool {
        matches!(self.kind, BreakpointKind::Hardware { .. })
    }
}

/// The process-wide breakpoint store, both kinds.
#[derive(Default)]
pub struct BreakpointTable {
    hardware: [Option<Breakpoint>; HW_SLOTS],
    software: HashMap<u64, Breakpoint>,
    next_id: u32,
}

impl BreakpointTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a breakpoint at `addr`, arming debug registers or patching
    /// memory through `tid`. Hardware is tried first; when no slot is free
    /// the breakpoint degrades to software.
    pub fn set<T: Target>(
        &mut self,
        target: &mut T,
        tid: Pid,
        addr: u64,
        temp: bool,
        origin: String,
    ) -> Result<Breakpoint, Error> {
        if self.find(addr).is_some() {
            return Err(Error::BreakpointExists { addr });
        }

        let id = self.next_id + 1;
        let bp = if target.supports_hw_breakpoints() {
            match self.set_hardware(target, tid, addr, id, temp, &origin) {
                Err(Error::NoFreeHardwareSlot) => {
                    self.set_software(target, tid, addr, id, temp, &origin)?
                }
                result => result?,
            }
        } else {
            self.set_software(target, tid, addr, id, temp, &origin)?
        };
        self.next_id = id;

        debug!(
            id,
            addr = %format_args!("{addr:#x}"),
            hardware = bp.is_hardware(),
            temp,
            "installed breakpoint"
        );
        Ok(bp)
    }

    fn set_hardware<T: Target>(
        &mut self,
        target: &mut T,
        tid: Pid,
        addr: u64,
        id: u32,
        temp: bool,
        origin: &str,
    ) -> Result<Breakpoint, Error> {
        let slot = self
            .hardware
            .iter()
            .position(Option::is_none)
            .ok_or(Error::NoFreeHardwareSlot)?;
        target.set_hw_breakpoint(tid, slot, addr)?;

        let bp = Breakpoint {
            id,
            addr,
            kind: BreakpointKind::Hardware { slot },
            temp,
            origin: origin.to_string(),
        };
        self.hardware[slot] = Some(bp.clone());
        Ok(bp)
    }

    fn set_software<T: Target>(
        &mut self,
        target: &mut T,
        tid: Pid,
        addr: u64,
        id: u32,
        temp: bool,
        origin: &str,
    ) -> Result<Breakpoint, Error> {
        let mut original = [0u8; 1];
        target.read_memory(tid, addr, &mut original)?;
        target.write_memory(tid, addr, &[TRAP_INSTRUCTION])?;

        let bp = Breakpoint {
            id,
            addr,
            kind: BreakpointKind::Software {
                original: original[0],
            },
            temp,
            origin: origin.to_string(),
        };
        self.software.insert(addr, bp.clone());
        Ok(bp)
    }

    /// Removes the breakpoint at `addr`, disarming its debug register or
    /// restoring its original byte. Hardware slots are checked first.
    pub fn clear<T: Target>(
        &mut self,
        target: &mut T,
        tid: Pid,
        addr: u64,
    ) -> Result<Breakpoint, Error> {
        for slot in 0..HW_SLOTS {
            let hit = self.hardware[slot]
                .as_ref()
                .is_some_and(|bp| bp.addr == addr);
            if hit {
                target.clear_hw_breakpoint(tid, slot)?;
                if let Some(bp) = self.hardware[slot].take() {
                    debug!(id = bp.id, addr = %format_args!("{addr:#x}"), "cleared breakpoint");
                    return Ok(bp);
                }
            }
        }

        if let Some(bp) = self.software.remove(&addr) {
            if let BreakpointKind::Software { original } = bp.kind {
                if let Err(err) = target.write_memory(tid, addr, &[original]) {
                    self.software.insert(addr, bp);
                    return Err(err);
                }
            }
            debug!(id = bp.id, addr = %format_args!("{addr:#x}"), "cleared breakpoint");
            return Ok(bp);
        }

        Err(Error::BreakpointNotFound { addr })
    }

    /// Removes every breakpoint whose `temp` flag is set, restoring bytes
    /// and slots as in [`BreakpointTable::clear`]. The first failure aborts.
    pub fn clear_temp<T: Target>(&mut self, target: &mut T, tid: Pid) -> Result<(), Error> {
        let temps: Vec<u64> = self.iter().filter(|bp| bp.temp).map(|bp| bp.addr).collect();
        for addr in temps {
            self.clear(target, tid, addr)?;
        }
        Ok(())
    }

    /// Finds the breakpoint whose address is exactly `pc`, either kind.
    pub fn find(&self, pc: u64) -> Option<&Breakpoint> {
        self.hardware_at(pc).or_else(|| self.software_at(pc))
    }

    /// Finds a hardware breakpoint armed at exactly `pc`.
    pub fn hardware_at(&self, pc: u64) -> Option<&Breakpoint> {
        self.hardware
            .iter()
            .flatten()
            .find(|bp| bp.addr == pc)
    }

    /// Finds a software breakpoint patched at exactly `addr`. Trap handling
    /// queries this with `pc - 1`: the CPU reports the instruction after
    /// the single trap byte.
    pub fn software_at(&self, addr: u64) -> Option<&Breakpoint> {
        self.software.get(&addr)
    }

    /// Finds a breakpoint by its id.
    pub fn by_id(&self, id: u32) -> Option<&Breakpoint> {
        self.iter().find(|bp| bp.id == id)
    }

    /// Iterates over all installed breakpoints, hardware slots first.
    pub fn iter(&self) -> impl Iterator<Item = &Breakpoint> {
        self.hardware.iter().flatten().chain(self.software.values())
    }
}
