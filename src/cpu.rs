//! CPU state, the exception engine and the fetch-execute loop.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use log::{debug, error, info, log_enabled, trace, Level};

use crate::bus::{Bus, PAGE_MASK};
use crate::cp0::{Cp0, ExceptionCode, IP_HW_MASK, IP_TIMER};
use crate::decode::{decode, DecodeCache};
use crate::mmu::{host_read, host_write, AccessKind, SoftMmu};
use crate::tlb::Tlb;
use crate::Fatal;

/// ABI names of the general-purpose registers, for traces and diagnostics.
pub const GPR_NAMES: [&str; 32] = [
    "zero", "at", "v0", "v1", "a0", "a1", "a2", "a3", //
    "t0", "t1", "t2", "t3", "t4", "t5", "t6", "t7", //
    "s0", "s1", "s2", "s3", "s4", "s5", "s6", "s7", //
    "t8", "t9", "k0", "k1", "gp", "sp", "fp", "ra",
];

/// Run state of the machine. Anything other than `Running` makes the main
/// loop return at the next instruction boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Stop,
    Running,
    End,
}

/// Lock-free funnel for interrupt lines raised outside the interpreter
/// (device threads, host timers). The CPU folds pending raise/ack masks into
/// Cause.IP once per instruction; producers never touch CPU state directly.
#[derive(Default)]
pub struct IrqLine {
    raise: AtomicU8,
    ack: AtomicU8,
}

impl IrqLine {
    /// Asserts hardware interrupt lines (Cause.IP bits; IP0/IP1 are reserved
    /// for guest software and are ignored here).
    pub fn raise(&self, lines: u8) {
        self.raise.fetch_or(lines & IP_HW_MASK, Ordering::Release);
    }

    /// Deasserts hardware interrupt lines.
    pub fn ack(&self, lines: u8) {
        self.ack.fetch_or(lines & IP_HW_MASK, Ordering::Release);
    }

    fn drain(&self) -> (u8, u8) {
        (
            self.raise.swap(0, Ordering::Acquire),
            self.ack.swap(0, Ordering::Acquire),
        )
    }
}

#[derive(Clone, Copy, Default, PartialEq, Eq)]
enum FrameKind {
    #[default]
    None,
    Call,
    Ret,
}

#[derive(Clone, Copy, Default)]
struct Frame {
    kind: FrameKind,
    pc: u32,
    target: u32,
}

const NR_FRAMES: usize = 400;

/// Ring of the most recent guest calls and returns, kept for fatal
/// diagnostics.
pub(crate) struct FrameRing {
    frames: Box<[Frame]>,
    head: usize,
}

impl FrameRing {
    fn new() -> Self {
        Self {
            frames: vec![Frame::default(); NR_FRAMES].into_boxed_slice(),
            head: 0,
        }
    }

    fn push(&mut self, kind: FrameKind, pc: u32, target: u32) {
        self.frames[self.head] = Frame { kind, pc, target };
        self.head = (self.head + 1) % NR_FRAMES;
    }

    pub(crate) fn push_call(&mut self, pc: u32, target: u32) {
        self.push(FrameKind::Call, pc, target);
    }

    pub(crate) fn push_ret(&mut self, pc: u32, target: u32) {
        self.push(FrameKind::Ret, pc, target);
    }

    /// Reconstructs the call stack from the recorded ring, oldest frame
    /// first.
    pub(crate) fn backtrace(&self) -> Vec<u32> {
        let mut stack = Vec::new();
        for i in 0..NR_FRAMES {
            let f = &self.frames[(self.head + i) % NR_FRAMES];
            match f.kind {
                FrameKind::Call => stack.push(f.target),
                FrameKind::Ret => {
                    stack.pop();
                }
                FrameKind::None => {}
            }
        }
        stack
    }
}

/// The virtual CPU: GPRs, HI/LO, PC, CP0, TLB and the two interpreter
/// caches.
pub struct Cpu {
    pub gpr: [u32; 32],
    pub hi: u32,
    pub lo: u32,
    pub pc: u32,
    /// Pending control-transfer destination, consumed when a delay slot
    /// retires or an exception is applied.
    pub br_target: u32,
    /// The instruction currently executing sits in a branch delay slot.
    pub is_delayslot: bool,
    /// The current instruction raised an exception; the PC is replaced by
    /// `br_target` when it retires.
    pub has_exception: bool,
    /// User-segment base, added to mapped addresses in segment mode.
    pub base: u32,
    pub segment_mode: bool,
    pub cp0: Cp0,
    pub tlb: Tlb,
    pub state: State,
    pub irq: Arc<IrqLine>,
    pub(crate) softmmu: SoftMmu,
    pub(crate) decode_cache: DecodeCache,
    pub(crate) frames: FrameRing,
    ninstr: u64,
}

impl Cpu {
    /// A CPU in the cold-reset profile, ready to fetch at `entry`.
    pub fn new(entry: u32) -> Self {
        Self {
            gpr: [0; 32],
            hi: 0,
            lo: 0,
            pc: entry,
            br_target: 0,
            is_delayslot: false,
            has_exception: false,
            base: 0,
            segment_mode: false,
            cp0: Cp0::new(),
            tlb: Tlb::new(),
            state: State::Stop,
            irq: Arc::new(IrqLine::default()),
            softmmu: SoftMmu::new(),
            decode_cache: DecodeCache::new(),
            frames: FrameRing::new(),
            ninstr: 0,
        }
    }

    /// Runs at most `n` instructions, returning early when the run state
    /// leaves [`State::Running`].
    pub fn exec(&mut self, bus: &mut Bus, n: u64) -> Result<State, Fatal> {
        if self.state == State::End {
            info!("program execution has ended; create a new machine to run again");
            return Ok(State::End);
        }
        self.state = State::Running;

        for _ in 0..n {
            self.step(bus)?;
            if self.state != State::Running {
                return Ok(self.state);
            }
        }

        if self.state == State::Running {
            self.state = State::Stop;
        }
        Ok(self.state)
    }

    fn step(&mut self, bus: &mut Bus) -> Result<(), Fatal> {
        self.update_cp0_timer();
        self.fold_irq_lines();
        self.gpr[0] = 0; // $zero is hardwired

        if self.pc & 0x3 != 0 {
            self.cp0.badvaddr = self.pc;
            self.signal_exception(ExceptionCode::AddressErrorLoad);
        } else if let Some(d) = self.decode_cache.lookup(self.pc) {
            let d = *d;
            self.dispatch(bus, &d)?;
            if log_enabled!(Level::Trace) {
                self.trace_registers(d.raw);
            }
        } else {
            let word = self.load_kind(bus, self.pc, 4, AccessKind::Fetch)?;
            if !self.has_exception {
                let d = decode(word);
                self.decode_cache.fill(self.pc, d);
                self.dispatch(bus, &d)?;
                if log_enabled!(Level::Trace) {
                    self.trace_registers(word);
                }
            }
        }

        self.check_interrupts();
        if self.has_exception {
            self.has_exception = false;
            self.pc = self.br_target;
        }
        self.gpr[0] = 0;
        Ok(())
    }

    /// Enters the exception vector for `code`: records EPC/BD, sets EXL and
    /// the cause code, and schedules the PC rewrite. Devices may call this
    /// between instructions to inject an exception at the current PC.
    pub fn signal_exception(&mut self, code: ExceptionCode) {
        if code == ExceptionCode::Trap {
            // no supported guest raises trap conditions in normal operation
            error!("hit bad trap at pc {:#010x}", self.pc);
            for target in self.frames.backtrace() {
                error!(">> {target:#010x}");
            }
            self.state = State::End;
            return;
        }

        if self.is_delayslot {
            self.cp0.epc = self.pc.wrapping_sub(4);
            self.cp0.cause.set_bd(!self.cp0.status.exl());
            self.is_delayslot = false;
        } else {
            self.cp0.epc = self.pc;
            self.cp0.cause.set_bd(false);
        }

        let base: u32 = if self.cp0.status.bev() {
            0xBFC0_0000
        } else {
            0x8000_0000
        };
        let offset = match code {
            ExceptionCode::Interrupt => {
                if self.cp0.cause.iv() {
                    0x200
                } else {
                    0x180
                }
            }
            ExceptionCode::TlbModified | ExceptionCode::TlbLoad | ExceptionCode::TlbStore
                if !self.cp0.status.exl() =>
            {
                0x000
            }
            _ => 0x180,
        };
        self.br_target = base + offset;
        self.has_exception = true;

        if self.segment_mode {
            // the kernel runs with a zero segment base; translation changed
            self.base = 0;
            self.invalidate_caches();
        }
        self.cp0.status.set_exl(true);
        self.cp0.cause.set_exc_code(code.into());
        trace!(
            "exception {:?} at pc {:#010x}, vector {:#010x}",
            code,
            self.pc,
            self.br_target
        );
    }

    fn check_interrupts(&mut self) {
        let st = self.cp0.status;
        let ie = !st.erl() && !st.exl() && st.ie();
        if ie && (st.im() & self.cp0.cause.ip()) != 0 {
            self.signal_exception(ExceptionCode::Interrupt);
        }
    }

    /// One virtual clock tick per retired instruction: advance Count, latch
    /// the timer interrupt on Count == Compare, step the Random index.
    fn update_cp0_timer(&mut self) {
        self.cp0.count = self.cp0.count.wrapping_add(1);
        if self.cp0.compare != 0 && self.cp0.count as u32 == self.cp0.compare {
            debug!("timer interrupt pending at pc {:#010x}", self.pc);
            self.cp0.cause.set_ip(self.cp0.cause.ip() | IP_TIMER);
        }
        let r = self.cp0.random.random();
        self.cp0.random.set_random(if r <= 1 { 63 } else { r - 1 });
    }

    fn fold_irq_lines(&mut self) {
        let (raise, ack) = self.irq.drain();
        if raise != 0 || ack != 0 {
            let ip = (self.cp0.cause.ip() | raise) & !ack;
            self.cp0.cause.set_ip(ip);
        }
    }

    pub(crate) fn invalidate_caches(&mut self) {
        self.softmmu.invalidate_all();
        self.decode_cache.invalidate_all();
    }

    /// Guest load of `len` (1 to 4) bytes. A TLB fault is signalled and 0
    /// returned; only host-level problems become errors.
    pub(crate) fn load_mem(&mut self, bus: &mut Bus, vaddr: u32, len: usize) -> Result<u32, Fatal> {
        self.load_kind(bus, vaddr, len, AccessKind::Load)
    }

    fn load_kind(
        &mut self,
        bus: &mut Bus,
        vaddr: u32,
        len: usize,
        kind: AccessKind,
    ) -> Result<u32, Fatal> {
        if let Some(page) = self.softmmu.lookup(vaddr) {
            // SAFETY: a soft-MMU hit guarantees `page` covers the whole live
            // 4 KiB host page, and aligned accesses of len <= 4 stay inside it.
            return Ok(unsafe { host_read(page, (vaddr & PAGE_MASK) as usize, len) });
        }

        let paddr = match self.translate(vaddr, kind) {
            Ok(paddr) => paddr,
            Err(code) => {
                self.signal_exception(code);
                return Ok(0);
            }
        };
        let Some(m) = bus.find(paddr) else {
            return Err(Fatal::BadAddr { paddr, pc: self.pc });
        };
        let name = m.name;
        let page_ptr = m.dev.map((paddr & !PAGE_MASK).wrapping_sub(m.start));
        let data = m
            .dev
            .read(paddr - m.start, len)
            .ok_or(Fatal::NoCapability {
                name,
                op: "read",
                paddr,
                pc: self.pc,
            })?;
        if let Some(ptr) = page_ptr {
            self.softmmu.fill(vaddr, ptr);
        }
        Ok(data)
    }

    /// Guest store of the low `len` bytes of `data`; same contract as
    /// [`Cpu::load_mem`].
    pub(crate) fn store_mem(
        &mut self,
        bus: &mut Bus,
        vaddr: u32,
        len: usize,
        data: u32,
    ) -> Result<(), Fatal> {
        if let Some(page) = self.softmmu.lookup(vaddr) {
            // SAFETY: as in load_kind; the page is writable host RAM.
            unsafe { host_write(page, (vaddr & PAGE_MASK) as usize, len, data) };
            return Ok(());
        }

        let paddr = match self.translate(vaddr, AccessKind::Store) {
            Ok(paddr) => paddr,
            Err(code) => {
                self.signal_exception(code);
                return Ok(());
            }
        };
        let Some(m) = bus.find(paddr) else {
            return Err(Fatal::BadAddr { paddr, pc: self.pc });
        };
        let name = m.name;
        let page_ptr = m.dev.map((paddr & !PAGE_MASK).wrapping_sub(m.start));
        if !m.dev.write(paddr - m.start, len, data) {
            return Err(Fatal::NoCapability {
                name,
                op: "write",
                paddr,
                pc: self.pc,
            });
        }
        if let Some(ptr) = page_ptr {
            self.softmmu.fill(vaddr, ptr);
        }
        Ok(())
    }

    fn trace_registers(&mut self, word: u32) {
        trace!(
            "$pc: {:#010x}   $hi: {:#010x}   $lo: {:#010x}",
            self.pc,
            self.hi,
            self.lo
        );
        trace!("$ninstr: {:08} $instr: {word:08x}", self.ninstr);
        for row in self.gpr.chunks(4).enumerate() {
            let (i, regs) = row;
            trace!(
                "${}:{:#010x} ${}:{:#010x} ${}:{:#010x} ${}:{:#010x}",
                GPR_NAMES[i * 4],
                regs[0],
                GPR_NAMES[i * 4 + 1],
                regs[1],
                GPR_NAMES[i * 4 + 2],
                regs[2],
                GPR_NAMES[i * 4 + 3],
                regs[3]
            );
        }
        self.ninstr += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cp0::ExceptionCode;

    #[test]
    fn exception_vectors_follow_bev_and_exl() {
        let mut cpu = Cpu::new(0xBFC0_0100);

        // reset profile: BEV=1, EXL=0 -> TLB refill family at the ROM base
        cpu.signal_exception(ExceptionCode::TlbLoad);
        assert_eq!(cpu.br_target, 0xBFC0_0000);
        assert!(cpu.cp0.status.exl());
        assert_eq!(cpu.cp0.cause.exc_code(), u8::from(ExceptionCode::TlbLoad));
        assert_eq!(cpu.cp0.epc, 0xBFC0_0100);
        assert!(!cpu.cp0.cause.bd());

        // nested TLB fault goes to the general vector
        cpu.has_exception = false;
        cpu.signal_exception(ExceptionCode::TlbStore);
        assert_eq!(cpu.br_target, 0xBFC0_0180);

        // RAM vectors once BEV is clear
        cpu.cp0.status.set_bev(false);
        cpu.cp0.status.set_exl(false);
        cpu.has_exception = false;
        cpu.signal_exception(ExceptionCode::Syscall);
        assert_eq!(cpu.br_target, 0x8000_0180);
    }

    #[test]
    fn interrupt_vector_honors_iv() {
        let mut cpu = Cpu::new(0xBFC0_0000);
        cpu.signal_exception(ExceptionCode::Interrupt);
        assert_eq!(cpu.br_target, 0xBFC0_0180);

        cpu.cp0.status.set_exl(false);
        cpu.has_exception = false;
        cpu.cp0.cause.set_iv(true);
        cpu.signal_exception(ExceptionCode::Interrupt);
        assert_eq!(cpu.br_target, 0xBFC0_0200);
    }

    #[test]
    fn delay_slot_exception_rewinds_epc() {
        let mut cpu = Cpu::new(0xBFC0_0104);
        cpu.is_delayslot = true;
        cpu.signal_exception(ExceptionCode::Overflow);
        assert_eq!(cpu.cp0.epc, 0xBFC0_0100);
        assert!(cpu.cp0.cause.bd());
        assert!(!cpu.is_delayslot);
    }

    #[test]
    fn trap_is_a_host_fatal() {
        let mut cpu = Cpu::new(0xBFC0_0000);
        cpu.signal_exception(ExceptionCode::Trap);
        assert_eq!(cpu.state, State::End);
        assert!(!cpu.has_exception, "trap never vectors the guest");
    }

    #[test]
    fn irq_lines_fold_into_cause_ip() {
        let mut cpu = Cpu::new(0xBFC0_0000);
        let irq = cpu.irq.clone();
        irq.raise(0x04 | 0x03); // the software bits are filtered out
        cpu.fold_irq_lines();
        assert_eq!(cpu.cp0.cause.ip(), 0x04);

        irq.ack(0x04);
        irq.raise(0x40);
        cpu.fold_irq_lines();
        assert_eq!(cpu.cp0.cause.ip(), 0x40);
    }

    #[test]
    fn frame_ring_reconstructs_call_stack() {
        let mut ring = FrameRing::new();
        ring.push_call(0x100, 0x1000);
        ring.push_call(0x1008, 0x2000);
        ring.push_ret(0x2010, 0x1010);
        ring.push_call(0x1020, 0x3000);
        assert_eq!(ring.backtrace(), vec![0x1000, 0x3000]);
    }

    #[test]
    fn random_free_runs_above_zero() {
        let mut cpu = Cpu::new(0xBFC0_0000);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            cpu.update_cp0_timer();
            let r = cpu.cp0.random.random();
            assert!((1..=63).contains(&r));
            seen.insert(r);
        }
        assert_eq!(seen.len(), 63);
    }
}
