//! Coprocessor 0 — the privileged register file of the simulated 4Kc core.
//!
//! Registers are plain fields wrapped in bitfield types; `mfc0`/`mtc0` go
//! through [`Cp0::read`] and [`Cp0::write`], which apply the per-register
//! write masks. A [`Cp0::write`] that changes address translation state
//! (Status.ERL, EntryHi) reports it so the caller can drop the soft-MMU and
//! decode caches.

use log::debug;
use num_enum::{FromPrimitive, IntoPrimitive};
use proc_bitfield::bitfield;

/// CP0 register numbers (the `rd` field of `mfc0`/`mtc0`).
pub const INDEX: u8 = 0;
pub const RANDOM: u8 = 1;
pub const ENTRY_LO0: u8 = 2;
pub const ENTRY_LO1: u8 = 3;
pub const CONTEXT: u8 = 4;
pub const PAGEMASK: u8 = 5;
pub const WIRED: u8 = 6;
pub const BADVADDR: u8 = 8;
pub const COUNT: u8 = 9;
pub const ENTRY_HI: u8 = 10;
pub const COMPARE: u8 = 11;
pub const STATUS: u8 = 12;
pub const CAUSE: u8 = 13;
pub const EPC: u8 = 14;
pub const PRID: u8 = 15;
pub const CONFIG: u8 = 16;
/// Implementation scratch register; sel 0 holds the user-segment base when
/// segment mode is enabled.
pub const SEGBASE: u8 = 22;
pub const ERROR_EPC: u8 = 30;

/// Timer interrupt line in Cause.IP (IP7).
pub const IP_TIMER: u8 = 0x80;
/// Cause.IP bits owned by hardware lines; the low two are software interrupts
/// and stay writable by the guest.
pub const IP_HW_MASK: u8 = 0xFC;

/// PRId of the modeled core (MIPS32 4Kc).
pub const PRID_4KC: u32 = 0x0001_8000;

bitfield! {
    #[derive(Copy, Clone, PartialEq, Eq, Default)]
    pub struct IndexReg(pub u32): Debug {
        pub idx: u32 @ 0..=30,
        pub probe: bool @ 31,
    }
}
raw_reg!(IndexReg);

bitfield! {
    #[derive(Copy, Clone, PartialEq, Eq, Default)]
    pub struct RandomReg(pub u32): Debug {
        pub random: u8 @ 0..=5,
    }
}
raw_reg!(RandomReg);

bitfield! {
    /// Page frame number and per-page attribute bits of one TLB entry half.
    ///
    /// EntryLo0 covers even virtual pages, EntryLo1 odd ones; the layout is
    /// shared.
    #[derive(Copy, Clone, PartialEq, Eq, Default)]
    pub struct EntryLoReg(pub u32): Debug {
        pub g: bool @ 0,
        pub v: bool @ 1,
        pub d: bool @ 2,
        pub c: u8 @ 3..=5,
        pub pfn: u32 @ 6..=29,
    }
}
raw_reg!(EntryLoReg);

bitfield! {
    #[derive(Copy, Clone, PartialEq, Eq, Default)]
    pub struct ContextReg(pub u32): Debug {
        /// Virtual page-pair number of the faulting address.
        pub bad_vpn2: u32 @ 4..=22,
        /// Base address of the OS page table.
        pub pte_base: u32 @ 23..=31,
    }
}
raw_reg!(ContextReg);

bitfield! {
    #[derive(Copy, Clone, PartialEq, Eq, Default)]
    pub struct PageMaskReg(pub u32): Debug {
        pub mask: u16 @ 13..=24,
    }
}
raw_reg!(PageMaskReg);

bitfield! {
    #[derive(Copy, Clone, PartialEq, Eq, Default)]
    pub struct EntryHiReg(pub u32): Debug {
        /// Address space identifier of the running process.
        pub asid: u8 @ 0..=7,
        /// Virtual page-pair number (vaddr >> 13).
        pub vpn2: u32 @ 13..=31,
    }
}
raw_reg!(EntryHiReg);

bitfield! {
    #[derive(Copy, Clone, PartialEq, Eq, Default)]
    pub struct StatusReg(pub u32): Debug {
        /// Global interrupt enable.
        pub ie: bool @ 0,
        /// Exception level; set on exception entry, cleared by `eret`.
        pub exl: bool @ 1,
        /// Error level; set at reset, cleared by `eret`.
        pub erl: bool @ 2,
        /// User mode when set (with EXL and ERL clear).
        pub um: bool @ 4,
        /// Interrupt mask, one bit per Cause.IP line.
        pub im: u8 @ 8..=15,
        pub nmi: bool @ 19,
        pub sr: bool @ 20,
        pub ts: bool @ 21,
        /// Bootstrap exception vectors: ROM (kseg1) instead of RAM vectors.
        pub bev: bool @ 22,
        pub re: bool @ 25,
        pub rp: bool @ 27,
        /// Coprocessor enable bits; only CU0 is meaningful here.
        pub cu: u8 @ 28..=31,
    }
}
raw_reg!(StatusReg);

bitfield! {
    #[derive(Copy, Clone, PartialEq, Eq, Default)]
    pub struct CauseReg(pub u32): Debug {
        /// Code of the most recent exception.
        pub exc_code: u8 @ 2..=6,
        /// Pending interrupt lines; IP0/IP1 are software interrupts.
        pub ip: u8 @ 8..=15,
        pub wp: bool @ 22,
        /// Use the special interrupt vector (+0x200) instead of the general one.
        pub iv: bool @ 23,
        pub ce: u8 @ 28..=29,
        /// The exception was taken in a branch delay slot.
        pub bd: bool @ 31,
    }
}
raw_reg!(CauseReg);

bitfield! {
    #[derive(Copy, Clone, PartialEq, Eq, Default)]
    pub struct ConfigReg(pub u32): Debug {
        /// kseg0 cacheability; tracked but semantically ignored.
        pub k0: u8 @ 0..=2,
        /// MMU type (1 = standard TLB).
        pub mt: u8 @ 7..=9,
        /// Big-endian when set; this machine is always little-endian.
        pub be: bool @ 15,
        /// Config1 register present.
        pub m: bool @ 31,
    }
}
raw_reg!(ConfigReg);

bitfield! {
    #[derive(Copy, Clone, PartialEq, Eq, Default)]
    pub struct Config1Reg(pub u32): Debug {
        pub fp: bool @ 0,
        pub ep: bool @ 1,
        pub ca: bool @ 2,
        pub pc: bool @ 4,
        pub wr: bool @ 5,
        pub sr: bool @ 6,
        pub da: u8 @ 7..=9,
        pub dl: u8 @ 10..=12,
        pub ds: u8 @ 13..=15,
        pub ia: u8 @ 16..=18,
        pub il: u8 @ 19..=21,
        pub is: u8 @ 22..=24,
        /// Number of TLB entries minus one.
        pub mmu_size: u8 @ 25..=30,
        pub m: bool @ 31,
    }
}
raw_reg!(Config1Reg);

/// Architectural exception codes as stored in Cause.ExcCode.
#[derive(IntoPrimitive, FromPrimitive, Copy, Clone, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum ExceptionCode {
    Interrupt = 0,
    TlbModified = 1,
    TlbLoad = 2,
    TlbStore = 3,
    AddressErrorLoad = 4,
    AddressErrorStore = 5,
    InstructionBusError = 6,
    DataBusError = 7,
    Syscall = 8,
    Breakpoint = 9,
    ReservedInstruction = 10,
    CoprocessorUnusable = 11,
    Overflow = 12,
    Trap = 13,
    #[default]
    Reserved = 14,
}

/// The coprocessor-0 state block.
///
/// `count` is kept as a 64-bit accumulator; the guest sees its low half as the
/// architectural Count register (sel 0) and the high half through sel 1.
#[derive(Clone, Debug, Default)]
pub struct Cp0 {
    pub index: IndexReg,
    pub random: RandomReg,
    pub entry_lo0: EntryLoReg,
    pub entry_lo1: EntryLoReg,
    pub context: ContextReg,
    pub pagemask: PageMaskReg,
    pub badvaddr: u32,
    pub count: u64,
    pub entry_hi: EntryHiReg,
    pub compare: u32,
    pub status: StatusReg,
    pub cause: CauseReg,
    pub epc: u32,
    pub prid: u32,
    pub config: ConfigReg,
    pub config1: Config1Reg,
    pub error_epc: u32,
    pub seg_base: u32,
}

impl Cp0 {
    /// CP0 in the 4Kc cold-reset profile: kernel mode via ERL, ROM vectors,
    /// all interrupts masked, timer far away.
    pub fn new() -> Self {
        let mut cp0 = Self::default();

        cp0.compare = 0xFFFF_FFFF;
        cp0.prid = PRID_4KC;
        cp0.random.set_random(63);

        cp0.status.set_cu(1); // CU0
        cp0.status.set_erl(true);
        cp0.status.set_bev(true);
        cp0.status.set_im(0);

        cp0.config.set_m(true);
        cp0.config.set_mt(1); // standard TLB
        cp0.config.set_be(false);

        // 4-way, 256-set, 4-byte-line caches on both sides; 64 TLB entries
        cp0.config1.set_da(3);
        cp0.config1.set_dl(1);
        cp0.config1.set_ds(2);
        cp0.config1.set_ia(3);
        cp0.config1.set_il(1);
        cp0.config1.set_is(2);
        cp0.config1.set_mmu_size(63);

        cp0
    }

    /// `mfc0`: read register `rd`, select `sel`.
    pub fn read(&self, rd: u8, sel: u8) -> u32 {
        match (rd, sel) {
            (INDEX, 0) => self.index.into(),
            (RANDOM, 0) => self.random.into(),
            (ENTRY_LO0, 0) => self.entry_lo0.into(),
            (ENTRY_LO1, 0) => self.entry_lo1.into(),
            (CONTEXT, 0) => self.context.into(),
            (PAGEMASK, 0) => self.pagemask.into(),
            (BADVADDR, 0) => self.badvaddr,
            (COUNT, 0) => self.count as u32,
            (COUNT, 1) => (self.count >> 32) as u32,
            (ENTRY_HI, 0) => self.entry_hi.into(),
            (COMPARE, 0) => self.compare,
            (STATUS, 0) => self.status.into(),
            (CAUSE, 0) => self.cause.into(),
            (EPC, 0) => self.epc,
            (PRID, 0) => self.prid,
            (CONFIG, 0) => self.config.into(),
            (CONFIG, 1) => self.config1.into(),
            (SEGBASE, 0) => self.seg_base,
            (ERROR_EPC, 0) => self.error_epc,
            _ => {
                debug!("mfc0 from unmodeled register ${rd}.{sel}");
                0
            }
        }
    }

    /// `mtc0`: write register `rd`, select `sel`, taking only the writable
    /// fields of `value`. Returns `true` when the write may change address
    /// translation, in which case the caller must invalidate the soft-MMU and
    /// decode caches.
    pub fn write(&mut self, rd: u8, sel: u8, value: u32) -> bool {
        match (rd, sel) {
            (INDEX, 0) => self.index.set_idx(IndexReg::from(value).idx()),
            (RANDOM, 0) => {} // read-only, free-running
            (ENTRY_LO0, 0) => self.entry_lo0 = masked_entry_lo(value),
            (ENTRY_LO1, 0) => self.entry_lo1 = masked_entry_lo(value),
            (CONTEXT, 0) => {
                let new = ContextReg::from(value);
                self.context.set_pte_base(new.pte_base());
            }
            (PAGEMASK, 0) => {
                let new = PageMaskReg::from(value);
                self.pagemask.set_mask(new.mask());
            }
            (BADVADDR, 0) => {} // read-only
            (COUNT, 0) => self.count = (self.count & !0xFFFF_FFFF) | u64::from(value),
            (ENTRY_HI, 0) => {
                let new = EntryHiReg::from(value);
                self.entry_hi.set_asid(new.asid());
                self.entry_hi.set_vpn2(new.vpn2());
                return true;
            }
            (COMPARE, 0) => {
                self.compare = value;
                self.cause.set_ip(self.cause.ip() & !IP_TIMER);
            }
            (STATUS, 0) => {
                let new = StatusReg::from(value);
                let erl_flip = self.status.erl() != new.erl();
                self.status.set_cu(new.cu());
                self.status.set_rp(new.rp());
                self.status.set_re(new.re());
                self.status.set_bev(new.bev());
                self.status.set_ts(new.ts());
                self.status.set_sr(new.sr());
                self.status.set_nmi(new.nmi());
                self.status.set_im(new.im());
                self.status.set_um(new.um());
                self.status.set_erl(new.erl());
                self.status.set_exl(new.exl());
                self.status.set_ie(new.ie());
                return erl_flip;
            }
            (CAUSE, 0) => {
                let new = CauseReg::from(value);
                self.cause.set_iv(new.iv());
                self.cause.set_wp(new.wp());
                // only the software interrupt bits are writable
                let sw_mask = !IP_HW_MASK;
                self.cause
                    .set_ip((new.ip() & sw_mask) | (self.cause.ip() & !sw_mask));
            }
            (CONFIG, 0) => {
                let new = ConfigReg::from(value);
                self.config.set_k0(new.k0());
            }
            (EPC, 0) => self.epc = value,
            (SEGBASE, 0) => self.seg_base = value,
            (ERROR_EPC, 0) => self.error_epc = value,
            _ => debug!("mtc0 {value:#010x} to unmodeled register ${rd}.{sel}"),
        }
        false
    }
}

fn masked_entry_lo(value: u32) -> EntryLoReg {
    let new = EntryLoReg::from(value);
    let mut lo = EntryLoReg::default();
    lo.set_g(new.g());
    lo.set_v(new.v());
    lo.set_d(new.d());
    lo.set_c(new.c());
    lo.set_pfn(new.pfn());
    lo
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_profile() {
        let cp0 = Cp0::new();
        assert!(cp0.status.erl());
        assert!(cp0.status.bev());
        assert!(!cp0.status.exl());
        assert_eq!(cp0.status.im(), 0);
        assert_eq!(cp0.prid, PRID_4KC);
        assert_eq!(cp0.compare, 0xFFFF_FFFF);
        assert_eq!(cp0.config1.mmu_size(), 63);
        assert!(cp0.config.m());
    }

    #[test]
    fn status_write_is_field_masked() {
        let mut cp0 = Cp0::new();
        // all ones: reserved bits must not stick
        let inv = cp0.write(STATUS, 0, 0xFFFF_FFFF);
        assert!(!inv, "ERL stays set, no flip");
        assert!(cp0.status.ie() && cp0.status.exl() && cp0.status.erl());
        assert_eq!(cp0.status.im(), 0xFF);
        // bit 3 (reserved between UM and ERL) must read back clear
        assert_eq!(u32::from(cp0.status) & (1 << 3), 0);
    }

    #[test]
    fn erl_flip_requests_invalidation() {
        let mut cp0 = Cp0::new();
        let v = u32::from(cp0.status) & !(1 << 2);
        assert!(cp0.write(STATUS, 0, v));
        assert!(!cp0.status.erl());
        // same value again: no flip
        assert!(!cp0.write(STATUS, 0, v));
    }

    #[test]
    fn compare_write_acks_timer() {
        let mut cp0 = Cp0::new();
        cp0.cause.set_ip(IP_TIMER | 0x01);
        cp0.write(COMPARE, 0, 1000);
        assert_eq!(cp0.compare, 1000);
        assert_eq!(cp0.cause.ip(), 0x01);
    }

    #[test]
    fn cause_write_touches_sw_bits_only() {
        let mut cp0 = Cp0::new();
        cp0.cause.set_ip(0xA0);
        cp0.write(CAUSE, 0, 0x0000_FF00);
        assert_eq!(cp0.cause.ip(), 0xA0 | 0x03);
    }

    #[test]
    fn entry_hi_write_requests_invalidation() {
        let mut cp0 = Cp0::new();
        assert!(cp0.write(ENTRY_HI, 0, 0x0040_0055));
        assert_eq!(cp0.entry_hi.asid(), 0x55);
        assert_eq!(cp0.entry_hi.vpn2(), 0x0040_0000 >> 13);
    }

    #[test]
    fn count_reads_split_the_accumulator() {
        let mut cp0 = Cp0::new();
        cp0.count = 0x1_2345_6789;
        assert_eq!(cp0.read(COUNT, 0), 0x2345_6789);
        assert_eq!(cp0.read(COUNT, 1), 1);
    }
}
