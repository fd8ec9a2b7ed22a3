
//! Full-system instruction set simulator for MIPS32 (R1, 4Kc-class) cores.
//!
//! The simulated machine is a little-endian single-core MIPS32 system: a CPU with
//! coprocessor 0, a 64-entry software TLB, and a physical address bus populated
//! with memory-mapped devices. Guest code is interpreted one instruction at a
//! time; two direct-mapped caches keep the interpreter fast without changing
//! observable behavior:
//!
//! - a **soft-MMU cache** ([`mmu`]) that short-circuits address translation and
//!   device lookup for host-mapped RAM pages, and
//! - a **decode cache** ([`decode`]) that memoizes classified instructions by
//!   program counter.
//!
//! Both caches are invalidated wholesale whenever translation state can change
//! (TLB writes, `CACHE`, EntryHi writes, Status.ERL flips, `ERET`).
//!
//! # Usage
//!
//! Build a [`Machine`], register devices on its bus, then run:
//!
//! ```no_run
//! use mips32_sim::bus::{Ram, BRAM_BASE, BRAM_SIZE};
//! use mips32_sim::Machine;
//!
//! let mut m = Machine::new(0xBFC0_0000);
//! m.bus.register("bram", BRAM_BASE, BRAM_BASE + BRAM_SIZE, Box::new(Ram::new(BRAM_SIZE as usize))).unwrap();
//! m.bus.load(0x1FC0_0000, &[0x00, 0x00, 0x00, 0x00]).unwrap(); // nop
//! m.run(1).unwrap();
//! ```
//!
//! Architectural exceptions (TLB refill, overflow, syscall, ...) are guest
//! semantics and never surface as Rust errors; the exception engine vectors the
//! guest instead. Host-level problems (an access that hits no device, a
//! malformed image) are [`Fatal`] errors returned from [`Machine::run`].

use thiserror::Error;

use crate::bus::Bus;
use crate::cpu::{Cpu, State};

macro_rules! raw_reg {
    ($kind:ident) => {
        impl From<u32> for $kind {
            fn from(value: u32) -> Self {
                Self(value)
            }
        }
        impl From<$kind> for u32 {
            fn from(value: $kind) -> Self {
                value.0
            }
        }
    };
}

pub mod bus;
pub mod cp0;
pub mod cpu;
pub mod decode;
mod exec;
pub mod mmu;
pub mod tlb;

/// A problem in the host setup or the guest image, as opposed to an
/// architectural exception. These terminate the run; none is ever visible to
/// the guest.
#[derive(Debug, Error)]
pub enum Fatal {
    #[error("bad physical address {paddr:#010x} (pc {pc:#010x})")]
    BadAddr { paddr: u32, pc: u32 },
    #[error("device {name} does not support {op} at {paddr:#010x} (pc {pc:#010x})")]
    NoCapability {
        name: &'static str,
        op: &'static str,
        paddr: u32,
        pc: u32,
    },
    #[error("device {name} [{start:#010x}, {end:#010x}) overlaps an existing mapping")]
    Overlap {
        name: &'static str,
        start: u32,
        end: u32,
    },
    #[error("tlb index {index} out of range (pc {pc:#010x})")]
    TlbIndex { index: u32, pc: u32 },
    #[error("image of {len} bytes does not fit in mapped memory at {paddr:#010x}")]
    BadImage { paddr: u32, len: usize },
}

/// The whole simulated machine: one CPU plus the physical bus it is wired to.
///
/// The CPU and bus are public; a monitor builds the bus before the first fetch
/// and may inspect any guest-visible state between runs.
pub struct Machine {
    pub cpu: Cpu,
    pub bus: Bus,
}

impl Machine {
    /// Creates a machine in the 4Kc reset profile with an empty bus, ready to
    /// start fetching at `entry`.
    pub fn new(entry: u32) -> Self {
        Self {
            cpu: Cpu::new(entry),
            bus: Bus::new(),
        }
    }

    /// Runs at most `n` instructions; returns earlier if the run state leaves
    /// [`State::Running`].
    pub fn run(&mut self, n: u64) -> Result<State, Fatal> {
        self.cpu.exec(&mut self.bus, n)
    }
}
