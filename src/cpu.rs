//! The RISC-V hart core, which handles instruction fetching, decoding,
//! execution, and trap delivery.
#![allow(clippy::unreadable_literal)]
#![allow(clippy::cast_possible_wrap)]

use crate::csr::Csr;
use crate::csr::CsRegs;
use crate::csr::MIP_MEIP;
use crate::csr::MIP_MSIP;
use crate::csr::MIP_MTIP;
use crate::csr::MSTATUS_MIE;
use crate::csr::MSTATUS_MPIE;
use crate::csr::MSTATUS_MPP;
use crate::csr::MSTATUS_MPP_SHIFT;
use crate::iregs::IntRegs;
use crate::iregs::Reg;
use crate::iregs::X0_SINK;
use crate::memory::Memory;
use crate::riscv::MemoryAccessType;
use crate::riscv::MemoryAccessType::Read;
use crate::riscv::MemoryAccessType::Write;
use crate::riscv::PrivMode;
use crate::riscv::Trap;
use crate::riscv::Xlen;
use crate::rvc;
use num_traits::FromPrimitive;
use std::fmt::Write as _;
use std::io;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;

/// The decoded instruction, convenient for execution.
#[derive(Debug, PartialEq, Eq)]
pub struct Uop {
    /// Destination register (x0 remapped to the write sink)
    pub rd: Reg,
    /// Source register 1
    pub rs1: Reg,
    /// Source register 2
    pub rs2: Reg,
    /// Immediate field (imm, csr number, shift amount, or an absolute
    /// branch/jump target)
    pub imm: i64,
}

/// Source operand values read before execution.
#[derive(Debug, PartialEq, Eq)]
pub struct Operands {
    pub s1: i64,
    pub s2: i64,
}

#[derive(Debug, PartialEq, Eq)]
pub struct Exception {
    pub trap: Trap,
    pub tval: i64,
}

type ExecResult = Result<Option<i64>, Exception>;

struct InsnSpec {
    name: &'static str,
    mask: u32,
    bits: u32,
    decode: fn(addr: i64, word: u32) -> Uop,
    disassemble: fn(s: &mut String, addr: i64, word: u32),
    execute: fn(hart: &mut Hart, uop: &Uop, ops: Operands) -> ExecResult,
}

struct FormatB {
    rs1: Reg,
    rs2: Reg,
    imm: i64,
}

struct FormatCsr {
    csr: u16,
    rs1: Reg,
    rd: Reg,
}

struct FormatI {
    rd: Reg,
    rs1: Reg,
    imm: i64,
}

struct FormatJ {
    rd: Reg,
    imm: i64,
}

struct FormatR {
    rd: Reg,
    rs1: Reg,
    rs2: Reg,
}

struct FormatRShift {
    rd: Reg,
    rs1: Reg,
    imm: u8,
}

struct FormatS {
    rs1: Reg,
    rs2: Reg,
    imm: i64,
}

struct FormatU {
    rd: Reg,
    imm: i64,
}

const ZEROREG: Reg = Reg::new(0);
const X0DEST: Reg = Reg::new(X0_SINK as u32);
const INSTRUCTION_NUM: usize = 76;
const OPCODE_BUCKETS: usize = 32;

impl Default for Uop {
    fn default() -> Self {
        Self {
            rd: X0DEST,
            rs1: ZEROREG,
            rs2: ZEROREG,
            imm: 0,
        }
    }
}

/// Why the run loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The program counter reached the stop address, or the
    /// instruction at the until-address retired.
    StopAddress,
    /// A store hit the tohost address.
    ToHost,
    /// The environment requested termination.
    Terminated,
}

/// A single RISC-V hart: architectural state plus the
/// fetch-decode-execute engine.
pub struct Hart {
    hart_id: u64,
    xlen: Xlen,
    memory: Memory,
    iregs: IntRegs,
    csregs: CsRegs,

    pc: i64,
    curr_pc: i64,
    retired: u64,
    cycle: u64,
    prv: PrivMode,

    stop_addr: Option<u64>,
    tohost_addr: Option<u64>,
    strict_align: bool,

    // Per-instruction scratch: the raw fetched code, its length, and
    // what the instruction wrote. Feeds trap values and the trace.
    insn: u32,
    insn_len: i64,
    last_rd: Option<(Reg, i64)>,
    last_store: Option<(u64, u64, u32)>,
    tohost_hit: bool,

    // Asynchronous inputs, polled at instruction boundaries.
    intr_req: Arc<AtomicBool>,
    term_req: Arc<AtomicBool>,

    // Decode candidates per major opcode (word bits [6:2]).
    dispatch: [Vec<u16>; OPCODE_BUCKETS],
}

impl Hart {
    /// Creates a hart with `memory_size` bytes of memory. Registers
    /// and the program counter start at zero, privilege at machine
    /// mode.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn new(hart_id: u64, xlen: Xlen, memory_size: usize) -> Self {
        let mut dispatch: [Vec<u16>; OPCODE_BUCKETS] = std::array::from_fn(|_| Vec::new());
        for (i, insn) in INSTRUCTIONS.iter().enumerate() {
            debug_assert_eq!(insn.mask & 0x7f, 0x7f, "{} must pin its opcode", insn.name);
            dispatch[(insn.bits >> 2 & 0x1f) as usize].push(i as u16);
        }

        Self {
            hart_id,
            xlen,
            memory: Memory::new(memory_size),
            iregs: IntRegs::new(),
            csregs: CsRegs::new(xlen, hart_id),
            pc: 0,
            curr_pc: 0,
            retired: 0,
            cycle: 0,
            prv: PrivMode::M,
            stop_addr: None,
            tohost_addr: None,
            strict_align: false,
            insn: 0,
            insn_len: 4,
            last_rd: None,
            last_store: None,
            tohost_hit: false,
            intr_req: Arc::new(AtomicBool::new(false)),
            term_req: Arc::new(AtomicBool::new(false)),
            dispatch,
        }
    }

    /// Returns registers, counters, CSRs, and privilege to their reset
    /// values. Memory is left as loaded.
    pub fn reset(&mut self) {
        self.iregs.reset();
        self.csregs = CsRegs::new(self.xlen, self.hart_id);
        self.pc = 0;
        self.curr_pc = 0;
        self.retired = 0;
        self.cycle = 0;
        self.prv = PrivMode::M;
        self.last_rd = None;
        self.last_store = None;
        self.tohost_hit = false;
    }

    #[must_use]
    pub const fn xlen(&self) -> Xlen {
        self.xlen
    }

    #[must_use]
    pub const fn hart_id(&self) -> u64 {
        self.hart_id
    }

    #[must_use]
    pub const fn priv_mode(&self) -> PrivMode {
        self.prv
    }

    #[must_use]
    pub fn memory_size(&self) -> usize {
        self.memory.size()
    }

    /// Normalize a value to the architectural register width.
    const fn sext(&self, v: i64) -> i64 {
        match self.xlen {
            Xlen::Rv32 => v as i32 as i64,
            Xlen::Rv64 => v,
        }
    }

    /// Truncate a raw value to W bits.
    const fn mask_arch(&self, v: u64) -> u64 {
        match self.xlen {
            Xlen::Rv32 => v & 0xffff_ffff,
            Xlen::Rv64 => v,
        }
    }

    /// The W-bit architectural image of an internal value.
    #[allow(clippy::cast_sign_loss)]
    const fn to_arch(&self, v: i64) -> u64 {
        self.mask_arch(v as u64)
    }

    /// The internal (sign extended) image of a W-bit value.
    #[allow(clippy::cast_possible_truncation)]
    const fn from_arch(&self, v: u64) -> i64 {
        match self.xlen {
            Xlen::Rv32 => v as u32 as i32 as i64,
            Xlen::Rv64 => v as i64,
        }
    }

    #[allow(clippy::inline_always)]
    #[inline(always)]
    fn read_x(&self, r: Reg) -> i64 {
        self.iregs.read(r)
    }

    // ---- Run control -------------------------------------------------

    /// Run the fetch-decode-execute loop until the program counter
    /// reaches the stop address, a store hits the tohost address, or
    /// the environment requests termination. When `trace` is given,
    /// one record per retired instruction is written to it.
    pub fn run(&mut self, trace: Option<&mut dyn io::Write>) -> RunOutcome {
        self.run_internal(None, trace)
    }

    /// Same loop, but additionally halt after the instruction at
    /// `address` has retired (that instruction executes).
    pub fn run_until_address(
        &mut self,
        address: u64,
        trace: Option<&mut dyn io::Write>,
    ) -> RunOutcome {
        self.run_internal(Some(address), trace)
    }

    fn run_internal(
        &mut self,
        until: Option<u64>,
        mut trace: Option<&mut dyn io::Write>,
    ) -> RunOutcome {
        loop {
            if self.term_req.load(Ordering::Relaxed) {
                return RunOutcome::Terminated;
            }
            if self.stop_addr == Some(self.to_arch(self.pc)) {
                return RunOutcome::StopAddress;
            }
            if self.poll_interrupts() {
                // Delivery redirected control; neither counter moves.
                continue;
            }

            self.cycle = self.cycle.wrapping_add(1);
            match self.step() {
                Ok(()) => {
                    self.retired = self.retired.wrapping_add(1);
                    if let Some(out) = trace.as_deref_mut() {
                        let _ = self.trace_inst(out);
                    }
                    if until == Some(self.to_arch(self.curr_pc)) {
                        return RunOutcome::StopAddress;
                    }
                }
                Err(exc) => self.handle_exception(&exc),
            }

            if self.tohost_hit {
                self.tohost_hit = false;
                return RunOutcome::ToHost;
            }
        }
    }

    // This is where it all happens: one fetch-decode-execute round.
    fn step(&mut self) -> Result<(), Exception> {
        self.last_rd = None;
        self.last_store = None;
        self.curr_pc = self.pc;

        let addr = self.to_arch(self.pc);
        let Some(half) = self.memory.read_u16(addr) else {
            return Err(Exception {
                trap: Trap::InstructionAccessFault,
                tval: self.pc,
            });
        };

        let word = if half & 3 == 3 {
            let Some(word) = self.memory.read_u32(addr) else {
                return Err(Exception {
                    trap: Trap::InstructionAccessFault,
                    tval: self.pc,
                });
            };
            self.insn = word;
            self.insn_len = 4;
            word
        } else {
            self.insn = u32::from(half);
            self.insn_len = 2;
            match rvc::expand(half, self.xlen) {
                Some(word) => word,
                None => {
                    return Err(Exception {
                        trap: Trap::IllegalInstruction,
                        tval: i64::from(half),
                    });
                }
            }
        };

        // The pc is advanced before the handler runs; control-flow
        // handlers overwrite it.
        self.pc = self.sext(self.curr_pc.wrapping_add(self.insn_len));

        let Some(decoded) = self.decode(word) else {
            return Err(Exception {
                trap: Trap::IllegalInstruction,
                tval: i64::from(self.insn),
            });
        };

        let uop = (decoded.decode)(self.curr_pc, word);
        let ops = Operands {
            s1: self.read_x(uop.rs1),
            s2: self.read_x(uop.rs2),
        };
        if let Some(res) = (decoded.execute)(self, &uop, ops)? {
            let res = self.sext(res);
            self.iregs.write(uop.rd, res);
            if !uop.rd.is_x0_dest() {
                self.last_rd = Some((uop.rd, res));
            }
        } else {
            debug_assert_eq!(uop.rd.get(), X0_SINK);
        }
        Ok(())
    }

    fn decode(&self, word: u32) -> Option<&'static InsnSpec> {
        for &i in &self.dispatch[(word >> 2 & 0x1f) as usize] {
            let insn = &INSTRUCTIONS[usize::from(i)];
            if word & insn.mask == insn.bits {
                return Some(insn);
            }
        }
        None
    }

    // ---- Traps and interrupts ----------------------------------------

    /// Latch the external interrupt request into mip, then deliver the
    /// highest-priority enabled machine interrupt, if any.
    fn poll_interrupts(&mut self) -> bool {
        if self.intr_req.swap(false, Ordering::Relaxed) {
            let mip = self.csregs.peek(Csr::Mip as u16).unwrap_or(0);
            self.csregs.poke(Csr::Mip as u16, mip | MIP_MEIP);
        }

        if self.read_csr_raw(Csr::Mstatus as u16) & MSTATUS_MIE == 0 {
            return false;
        }
        let pending = self.read_csr_raw(Csr::Mip as u16) & self.read_csr_raw(Csr::Mie as u16);
        if pending == 0 {
            return false;
        }

        for (bit, trap) in [
            (MIP_MEIP, Trap::MachineExternalInterrupt),
            (MIP_MSIP, Trap::MachineSoftwareInterrupt),
            (MIP_MTIP, Trap::MachineTimerInterrupt),
        ] {
            if pending & bit != 0 {
                // The saved pc is the instruction that would have
                // executed next.
                self.initiate_trap(trap, self.pc, 0);
                return true;
            }
        }
        false
    }

    fn handle_exception(&mut self, exc: &Exception) {
        if exc.trap == Trap::IllegalInstruction {
            log::info!(
                "illegal instruction {:x} at {:x}",
                exc.tval,
                self.to_arch(self.curr_pc)
            );
        }
        self.initiate_trap(exc.trap, self.curr_pc, exc.tval);
    }

    /// Change machine state and program counter in reaction to an
    /// exception or an interrupt. `pc_to_save` lands in mepc, `info`
    /// in mtval.
    fn initiate_trap(&mut self, trap: Trap, pc_to_save: i64, info: i64) {
        let cause = u64::from(trap.cause());
        let mcause = if trap.is_interrupt() {
            self.xlen.interrupt_bit() | cause
        } else {
            cause
        };
        self.csregs.poke(Csr::Mcause as u16, mcause);
        self.csregs
            .poke(Csr::Mepc as u16, self.to_arch(pc_to_save) & !1);
        self.csregs.poke(Csr::Mtval as u16, self.to_arch(info));

        let status = self.read_csr_raw(Csr::Mstatus as u16);
        let mie = status >> 3 & 1;
        // MPIE <- MIE, MIE <- 0, MPP <- current privilege.
        let status = (status & !(MSTATUS_MIE | MSTATUS_MPIE | MSTATUS_MPP))
            | mie << 7
            | u64::from(self.prv) << MSTATUS_MPP_SHIFT;
        self.csregs.poke(Csr::Mstatus as u16, status);
        self.prv = PrivMode::M;

        let mtvec = self.read_csr_raw(Csr::Mtvec as u16);
        let base = mtvec & !3;
        let target = if trap.is_interrupt() && mtvec & 3 == 1 {
            base + 4 * cause
        } else {
            base
        };
        self.pc = self.from_arch(target);
    }

    fn illegal_insn(&self) -> Exception {
        Exception {
            trap: Trap::IllegalInstruction,
            tval: i64::from(self.insn),
        }
    }

    fn require_rv64(&self) -> Result<(), Exception> {
        match self.xlen {
            Xlen::Rv64 => Ok(()),
            Xlen::Rv32 => Err(self.illegal_insn()),
        }
    }

    // ---- CSR access --------------------------------------------------

    /// CSR read on behalf of the executing instruction. Denied access
    /// raises illegal-instruction with the instruction word as the
    /// trap value.
    fn read_csr(&self, csrno: u16) -> Result<i64, Exception> {
        if !self.csregs.permits(csrno, self.prv, false) {
            log::warn!(
                "denied csr read {csrno:03x} at {:x}",
                self.to_arch(self.curr_pc)
            );
            return Err(self.illegal_insn());
        }
        Ok(self.from_arch(self.read_csr_raw(csrno)))
    }

    fn write_csr(&mut self, csrno: u16, v: i64) -> Result<(), Exception> {
        if !self.csregs.permits(csrno, self.prv, true) {
            log::warn!(
                "denied csr write {csrno:03x} at {:x}",
                self.to_arch(self.curr_pc)
            );
            return Err(self.illegal_insn());
        }
        self.write_csr_raw(csrno, self.to_arch(v));
        Ok(())
    }

    /// Raw CSR read. The counter CSRs reflect the live counters;
    /// everything else comes from the descriptor table.
    fn read_csr_raw(&self, csrno: u16) -> u64 {
        match FromPrimitive::from_u16(csrno) {
            Some(Csr::Cycle | Csr::Mcycle | Csr::Time) => self.mask_arch(self.cycle),
            Some(Csr::Instret | Csr::Minstret) => self.mask_arch(self.retired),
            Some(Csr::Cycleh | Csr::Mcycleh | Csr::Timeh) => self.cycle >> 32,
            Some(Csr::Instreth | Csr::Minstreth) => self.retired >> 32,
            _ => self.csregs.read(csrno, PrivMode::M).unwrap_or(0),
        }
    }

    fn write_csr_raw(&mut self, csrno: u16, value: u64) {
        match FromPrimitive::from_u16(csrno) {
            Some(Csr::Mcycle) => self.cycle = self.splice_low(self.cycle, value),
            Some(Csr::Minstret) => self.retired = self.splice_low(self.retired, value),
            Some(Csr::Mcycleh) => self.cycle = self.cycle & 0xffff_ffff | value << 32,
            Some(Csr::Minstreth) => self.retired = self.retired & 0xffff_ffff | value << 32,
            _ => {
                self.csregs.write(csrno, value, PrivMode::M);
            }
        }
    }

    /// Replace the architectural (low) part of a live counter.
    const fn splice_low(&self, counter: u64, v: u64) -> u64 {
        match self.xlen {
            Xlen::Rv32 => counter & !0xffff_ffff | v & 0xffff_ffff,
            Xlen::Rv64 => v,
        }
    }

    // ---- Data memory -------------------------------------------------

    /// Load or store `size` bytes at `base + offset`. Out-of-bounds
    /// accesses raise the access fault matching `access`; misaligned
    /// accesses are silent unless strict alignment is enabled.
    fn memop(
        &mut self,
        access: MemoryAccessType,
        base: i64,
        offset: i64,
        v: i64,
        size: u32,
    ) -> Result<i64, Exception> {
        let va = self.sext(base.wrapping_add(offset));
        let addr = self.to_arch(va);

        if self.strict_align && addr & u64::from(size - 1) != 0 {
            let trap = match access {
                Read => Trap::LoadAddressMisaligned,
                Write => Trap::StoreAddressMisaligned,
                MemoryAccessType::Execute => Trap::InstructionAddressMisaligned,
            };
            return Err(Exception { trap, tval: va });
        }

        match access {
            Write => {
                #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
                let ok = match size {
                    1 => self.memory.write_u8(addr, v as u8),
                    2 => self.memory.write_u16(addr, v as u16),
                    4 => self.memory.write_u32(addr, v as u32),
                    8 => self.memory.write_u64(addr, v as u64),
                    _ => unreachable!(),
                };
                if !ok {
                    return Err(Exception {
                        trap: Trap::StoreAccessFault,
                        tval: va,
                    });
                }
                #[allow(clippy::cast_sign_loss)]
                let stored = if size == 8 {
                    v as u64
                } else {
                    v as u64 & ((1 << (8 * size)) - 1)
                };
                self.last_store = Some((addr, stored, size));
                if self.tohost_addr == Some(addr) && size <= 4 {
                    // The store itself completes; the loop halts after
                    // the instruction retires.
                    self.tohost_hit = true;
                }
                Ok(0)
            }
            Read | MemoryAccessType::Execute => {
                let v = match size {
                    1 => self.memory.read_u8(addr).map(u64::from),
                    2 => self.memory.read_u16(addr).map(u64::from),
                    4 => self.memory.read_u32(addr).map(u64::from),
                    8 => self.memory.read_u64(addr),
                    _ => unreachable!(),
                };
                let Some(v) = v else {
                    let trap = match access {
                        Read => Trap::LoadAccessFault,
                        _ => Trap::InstructionAccessFault,
                    };
                    return Err(Exception { trap, tval: va });
                };
                // Unsigned; sign extension is the consumer's job.
                Ok(v as i64)
            }
        }
    }

    // ---- External interface ------------------------------------------

    #[must_use]
    pub fn peek_pc(&self) -> u64 {
        self.to_arch(self.pc)
    }

    pub fn poke_pc(&mut self, address: u64) {
        self.pc = self.from_arch(address) & !1;
    }

    #[must_use]
    pub fn peek_int_reg(&self, index: usize) -> Option<u64> {
        self.iregs.peek(index).map(|v| self.mask_arch(v))
    }

    #[allow(clippy::cast_sign_loss)]
    pub fn poke_int_reg(&mut self, index: usize, value: u64) -> bool {
        self.iregs.poke(index, self.from_arch(value) as u64)
    }

    #[must_use]
    pub fn peek_csr(&self, csrno: u16) -> Option<u64> {
        if !self.csregs.contains(csrno) {
            return None;
        }
        Some(self.read_csr_raw(csrno))
    }

    pub fn poke_csr(&mut self, csrno: u16, value: u64) -> bool {
        if !self.csregs.contains(csrno) {
            return false;
        }
        match FromPrimitive::from_u16(csrno) {
            Some(Csr::Mcycle | Csr::Cycle | Csr::Time) => {
                self.cycle = self.splice_low(self.cycle, value);
            }
            Some(Csr::Instret | Csr::Minstret) => {
                self.retired = self.splice_low(self.retired, value);
            }
            Some(Csr::Mcycleh | Csr::Cycleh | Csr::Timeh) => {
                self.cycle = self.cycle & 0xffff_ffff | value << 32;
            }
            Some(Csr::Instreth | Csr::Minstreth) => {
                self.retired = self.retired & 0xffff_ffff | value << 32;
            }
            _ => {
                self.csregs.poke(csrno, self.mask_arch(value));
            }
        }
        true
    }

    #[must_use]
    pub fn peek_memory_u8(&self, address: u64) -> Option<u8> {
        self.memory.read_u8(address)
    }

    #[must_use]
    pub fn peek_memory_u16(&self, address: u64) -> Option<u16> {
        self.memory.read_u16(address)
    }

    #[must_use]
    pub fn peek_memory_u32(&self, address: u64) -> Option<u32> {
        self.memory.read_u32(address)
    }

    #[must_use]
    pub fn peek_memory_u64(&self, address: u64) -> Option<u64> {
        self.memory.read_u64(address)
    }

    pub fn poke_memory_u8(&mut self, address: u64, v: u8) -> bool {
        self.memory.write_u8(address, v)
    }

    pub fn poke_memory_u16(&mut self, address: u64, v: u16) -> bool {
        self.memory.write_u16(address, v)
    }

    pub fn poke_memory_u32(&mut self, address: u64, v: u32) -> bool {
        self.memory.write_u32(address, v)
    }

    pub fn poke_memory_u64(&mut self, address: u64, v: u64) -> bool {
        self.memory.write_u64(address, v)
    }

    /// Name to register number, accepting `xN` and ABI names.
    #[must_use]
    pub fn find_int_reg(&self, name: &str) -> Option<usize> {
        IntRegs::find(name)
    }

    /// Name to CSR number.
    #[must_use]
    pub fn find_csr(&self, name: &str) -> Option<u16> {
        self.csregs.find(name)
    }

    pub fn set_stop_address(&mut self, address: u64) {
        self.stop_addr = Some(address);
    }

    pub fn clear_stop_address(&mut self) {
        self.stop_addr = None;
    }

    pub fn set_tohost_address(&mut self, address: u64) {
        self.tohost_addr = Some(address);
    }

    pub fn clear_tohost_address(&mut self) {
        self.tohost_addr = None;
    }

    /// When enabled, misaligned data accesses raise address-misaligned
    /// traps instead of completing silently.
    pub fn set_strict_align(&mut self, on: bool) {
        self.strict_align = on;
    }

    /// Shared flag the environment sets to request an external
    /// (machine external) interrupt.
    #[must_use]
    pub fn interrupt_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.intr_req)
    }

    /// Shared flag the environment sets to make the run loop return at
    /// the next instruction boundary.
    #[must_use]
    pub fn terminate_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.term_req)
    }

    /// Expand a compressed instruction to its 32-bit equivalent.
    #[must_use]
    pub fn expand_inst(&self, code16: u16) -> Option<u32> {
        rvc::expand(code16, self.xlen)
    }

    #[must_use]
    pub const fn retired_insts(&self) -> u64 {
        self.retired
    }

    // ---- Disassembly and tracing -------------------------------------

    /// Disassemble a 32-bit or compressed instruction.
    #[must_use]
    pub fn disassemble_inst(&self, inst: u32) -> String {
        let mut s = String::new();
        self.disassemble_into(&mut s, self.curr_pc, inst);
        s
    }

    #[allow(clippy::cast_possible_truncation)]
    fn disassemble_into(&self, s: &mut String, addr: i64, inst: u32) {
        let word = if inst & 3 == 3 {
            inst
        } else {
            match rvc::expand(inst as u16, self.xlen) {
                Some(word) => word,
                None => {
                    s.push_str("illegal");
                    return;
                }
            }
        };
        match self.decode(word) {
            Some(decoded) => {
                let _ = write!(s, "{:7} ", decoded.name.to_lowercase());
                (decoded.disassemble)(s, addr, word);
                while s.ends_with(' ') {
                    s.pop();
                }
            }
            None => s.push_str("illegal"),
        }
    }

    /// Write one trace record for the instruction that just retired.
    /// The tag is the retired-instruction count after retirement.
    fn trace_inst(&self, out: &mut dyn io::Write) -> io::Result<()> {
        let mut line = String::new();
        let _ = write!(line, "#{} {} ", self.retired, self.prv);
        let pc = self.to_arch(self.curr_pc);
        match self.xlen {
            Xlen::Rv32 => {
                let _ = write!(line, "{pc:08x} ");
            }
            Xlen::Rv64 => {
                let _ = write!(line, "{pc:016x} ");
            }
        }
        if self.insn_len == 2 {
            let _ = write!(line, "    {:04x} ", self.insn);
        } else {
            let _ = write!(line, "{:08x} ", self.insn);
        }
        self.disassemble_into(&mut line, self.curr_pc, self.insn);
        if let Some((rd, v)) = self.last_rd {
            let _ = write!(line, " {}={:x}", reg_name(rd), self.to_arch(v));
        } else if let Some((addr, v, _size)) = self.last_store {
            let _ = write!(line, " [{addr:x}]={v:x}");
        }
        writeln!(out, "{line}")
    }

    // ---- Self test ---------------------------------------------------

    /// Destructive self check: x0 hard-wiring, expander/decoder
    /// agreement over the full 16-bit space, and the division edge
    /// cases. Neither register nor memory state is preserved.
    pub fn self_test(&mut self) -> bool {
        if !self.poke_int_reg(0, 0x1234) || self.peek_int_reg(0) != Some(0) {
            return false;
        }

        for code in 0..=u16::MAX {
            if let Some(word) = rvc::expand(code, self.xlen) {
                if self.decode(word).is_none() {
                    log::warn!("compressed {code:04x} expands to undecodable {word:08x}");
                    return false;
                }
            }
        }

        // div x3, x1, x2; rem x4, x1, x2 with a zero divisor.
        self.poke_int_reg(1, 7);
        self.poke_int_reg(2, 0);
        if !self.poke_memory_u32(0, 0x0220c1b3) || !self.poke_memory_u32(4, 0x0220e233) {
            return false;
        }
        self.poke_pc(0);
        self.run_until_address(4, None);
        self.peek_int_reg(3) == Some(self.mask_arch(u64::MAX)) && self.peek_int_reg(4) == Some(7)
    }
}

/// Register name used in disassembly; the x0 write sink reads back as
/// the zero register.
const fn reg_name(r: Reg) -> &'static str {
    if r.get() == X0_SINK {
        "zero"
    } else {
        crate::iregs::NAMES[r.get() as usize]
    }
}

/// Generate a source integer `Reg`
/// # Panics
/// Trying to name a register > 31
#[must_use]
pub fn x(r: u32) -> Reg {
    assert!(r < 32);
    Reg::new(r)
}

/// Generate a destination integer `Reg`. x0 is remapped to the dummy
/// sink slot, which turns the write-back into branch-free code.
/// # Panics
/// Trying to name a register > 31
#[must_use]
pub fn xd(r: u32) -> Reg {
    assert!(r < 32);
    Reg::new(((r + 31) & 31) + 1)
}

// ---- Format parsers, decoders, and disassemblers ---------------------

#[allow(clippy::cast_lossless)]
fn parse_format_b(word: u32) -> FormatB {
    let iword = word as i32;
    FormatB {
        rs1: x(word >> 15 & 0x1f), // [19:15]
        rs2: x(word >> 20 & 0x1f), // [24:20]
        imm: (iword >> 31 << 12 | // imm[31:12] = [31]
            ((iword << 4) & 0x0000_0800) | // imm[11] = [7]
            ((iword >> 20) & 0x0000_07e0) | // imm[10:5] = [30:25]
            ((iword >> 7) & 0x0000_001e)) as i64, // imm[4:1] = [11:8]
    }
}

fn decode_b(addr: i64, word: u32) -> Uop {
    let f = parse_format_b(word);
    Uop {
        rs1: f.rs1,
        rs2: f.rs2,
        // Absolute target.
        imm: addr.wrapping_add(f.imm),
        ..Uop::default()
    }
}

fn disassemble_b(s: &mut String, addr: i64, word: u32) {
    let f = parse_format_b(word);
    let _ = write!(
        s,
        "{}, {}, {:x}",
        reg_name(f.rs1),
        reg_name(f.rs2),
        addr.wrapping_add(f.imm)
    );
}

#[allow(clippy::cast_possible_truncation)]
fn parse_format_csr(word: u32) -> FormatCsr {
    FormatCsr {
        csr: (word >> 20 & 0xfff) as u16, // [31:20]
        rs1: x(word >> 15 & 0x1f),        // [19:15], also uimm
        rd: xd(word >> 7 & 0x1f),         // [11:7]
    }
}

fn decode_csr(_addr: i64, word: u32) -> Uop {
    let f = parse_format_csr(word);
    Uop {
        rd: f.rd,
        rs1: f.rs1,
        imm: i64::from(f.csr),
        ..Uop::default()
    }
}

/// The uimm variants name no source register; the rs1 field carries
/// the zero-extended immediate instead and must not be read.
fn decode_csri(_addr: i64, word: u32) -> Uop {
    let f = parse_format_csr(word);
    Uop {
        rd: f.rd,
        rs1: f.rs1,
        imm: i64::from(f.csr),
        ..Uop::default()
    }
}

fn csr_display(csrno: u16) -> String {
    let csr: Option<Csr> = FromPrimitive::from_u16(csrno);
    match csr {
        Some(csr) => format!("{csr}"),
        None => format!("csr{csrno:03x}"),
    }
}

fn disassemble_csr(s: &mut String, _addr: i64, word: u32) {
    let f = parse_format_csr(word);
    let _ = write!(
        s,
        "{}, {}, {}",
        reg_name(f.rd),
        csr_display(f.csr),
        reg_name(f.rs1)
    );
}

fn disassemble_csri(s: &mut String, _addr: i64, word: u32) {
    let f = parse_format_csr(word);
    let _ = write!(
        s,
        "{}, {}, {}",
        reg_name(f.rd),
        csr_display(f.csr),
        f.rs1.get()
    );
}

#[allow(clippy::cast_lossless)]
fn parse_format_i(word: u32) -> FormatI {
    FormatI {
        rd: xd(word >> 7 & 0x1f),          // [11:7]
        rs1: x(word >> 15 & 0x1f),         // [19:15]
        imm: ((word as i32) >> 20) as i64, // [31:20]
    }
}

fn decode_i(_addr: i64, word: u32) -> Uop {
    let f = parse_format_i(word);
    Uop {
        rd: f.rd,
        rs1: f.rs1,
        imm: f.imm,
        ..Uop::default()
    }
}

fn disassemble_i(s: &mut String, _addr: i64, word: u32) {
    let f = parse_format_i(word);
    let _ = write!(s, "{}, {}, {}", reg_name(f.rd), reg_name(f.rs1), f.imm);
}

fn disassemble_i_mem(s: &mut String, _addr: i64, word: u32) {
    let f = parse_format_i(word);
    let _ = write!(s, "{}, {}({})", reg_name(f.rd), f.imm, reg_name(f.rs1));
}

#[allow(clippy::cast_lossless)]
fn parse_format_j(word: u32) -> FormatJ {
    let iword = word as i32;
    FormatJ {
        rd: xd(word >> 7 & 0x1f), // [11:7]
        imm: (iword >> 31 << 20 | // imm[31:20] = [31]
             (iword & 0x000f_f000) | // imm[19:12] = [19:12]
             ((iword & 0x0010_0000) >> 9) | // imm[11] = [20]
             ((iword & 0x7fe0_0000) >> 20)) as i64, // imm[10:1] = [30:21]
    }
}

fn decode_j(addr: i64, word: u32) -> Uop {
    let f = parse_format_j(word);
    Uop {
        rd: f.rd,
        imm: addr.wrapping_add(f.imm),
        ..Uop::default()
    }
}

fn disassemble_j(s: &mut String, addr: i64, word: u32) {
    let f = parse_format_j(word);
    let _ = write!(s, "{}, {:x}", reg_name(f.rd), addr.wrapping_add(f.imm));
}

fn parse_format_r(word: u32) -> FormatR {
    FormatR {
        rd: xd(word >> 7 & 0x1f),  // [11:7]
        rs1: x(word >> 15 & 0x1f), // [19:15]
        rs2: x(word >> 20 & 0x1f), // [24:20]
    }
}

fn decode_r(_addr: i64, word: u32) -> Uop {
    let f = parse_format_r(word);
    Uop {
        rd: f.rd,
        rs1: f.rs1,
        rs2: f.rs2,
        ..Uop::default()
    }
}

fn disassemble_r(s: &mut String, _addr: i64, word: u32) {
    let f = parse_format_r(word);
    let _ = write!(
        s,
        "{}, {}, {}",
        reg_name(f.rd),
        reg_name(f.rs1),
        reg_name(f.rs2)
    );
}

#[allow(clippy::cast_possible_truncation)]
fn parse_format_r_shift(word: u32) -> FormatRShift {
    FormatRShift {
        rd: xd(word >> 7 & 0x1f),       // [11:7]
        rs1: x(word >> 15 & 0x1f),      // [19:15]
        imm: (word >> 20) as u8 & 0x3f, // [25:20]
    }
}

fn decode_r_shift(_addr: i64, word: u32) -> Uop {
    let f = parse_format_r_shift(word);
    Uop {
        rd: f.rd,
        rs1: f.rs1,
        imm: i64::from(f.imm),
        ..Uop::default()
    }
}

fn disassemble_r_shift(s: &mut String, _addr: i64, word: u32) {
    let f = parse_format_r_shift(word);
    let _ = write!(s, "{}, {}, {}", reg_name(f.rd), reg_name(f.rs1), f.imm);
}

#[allow(clippy::cast_lossless)]
fn parse_format_s(word: u32) -> FormatS {
    let iword = word as i32;
    FormatS {
        rs1: x(word >> 15 & 0x1f), // [19:15]
        rs2: x(word >> 20 & 0x1f), // [24:20]
        imm: (iword >> 31 << 11 | // imm[31:11] = [31]
            ((iword >> 20) & 0x7e0) | // imm[10:5] = [30:25]
            ((iword >> 7) & 0x1f)) as i64, // imm[4:0] = [11:7]
    }
}

fn decode_s(_addr: i64, word: u32) -> Uop {
    let f = parse_format_s(word);
    Uop {
        rs1: f.rs1,
        rs2: f.rs2,
        imm: f.imm,
        ..Uop::default()
    }
}

fn disassemble_s(s: &mut String, _addr: i64, word: u32) {
    let f = parse_format_s(word);
    let _ = write!(s, "{}, {}({})", reg_name(f.rs2), f.imm, reg_name(f.rs1));
}

#[allow(clippy::cast_lossless)]
fn parse_format_u(word: u32) -> FormatU {
    FormatU {
        rd: xd(word >> 7 & 0x1f),
        imm: (word & 0xffff_f000) as i32 as i64,
    }
}

fn decode_u(_addr: i64, word: u32) -> Uop {
    let f = parse_format_u(word);
    Uop {
        rd: f.rd,
        imm: f.imm,
        ..Uop::default()
    }
}

fn decode_auipc(addr: i64, word: u32) -> Uop {
    let f = parse_format_u(word);
    Uop {
        rd: f.rd,
        imm: addr.wrapping_add(f.imm),
        ..Uop::default()
    }
}

fn disassemble_u(s: &mut String, _addr: i64, word: u32) {
    let f = parse_format_u(word);
    let _ = write!(s, "{}, {:#x}", reg_name(f.rd), f.imm >> 12 & 0xfffff);
}

fn disassemble_jalr(s: &mut String, _addr: i64, word: u32) {
    let f = parse_format_i(word);
    let _ = write!(s, "{}, {}({})", reg_name(f.rd), f.imm, reg_name(f.rs1));
}

fn decode_empty(_addr: i64, _word: u32) -> Uop {
    Uop::default()
}

#[allow(clippy::ptr_arg)] // The function type fixes the signature
const fn disassemble_empty(_s: &mut String, _addr: i64, _word: u32) {}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_lossless)]
const INSTRUCTIONS: [InsnSpec; INSTRUCTION_NUM] = [
    // RV32I
    InsnSpec {
        name: "LUI",
        mask: 0x0000007f,
        bits: 0x00000037,
        decode: decode_u,
        disassemble: disassemble_u,
        execute: |_hart, uop, _ops| Ok(Some(uop.imm)),
    },
    InsnSpec {
        name: "AUIPC",
        mask: 0x0000007f,
        bits: 0x00000017,
        decode: decode_auipc,
        disassemble: disassemble_u,
        execute: |_hart, uop, _ops| Ok(Some(uop.imm)),
    },
    InsnSpec {
        name: "JAL",
        mask: 0x0000007f,
        bits: 0x0000006f,
        decode: decode_j,
        disassemble: disassemble_j,
        execute: |hart, uop, _ops| {
            if uop.imm & 1 != 0 {
                return Err(Exception {
                    trap: Trap::InstructionAddressMisaligned,
                    tval: uop.imm,
                });
            }
            let link = hart.pc;
            hart.pc = hart.sext(uop.imm);
            Ok(Some(link))
        },
    },
    InsnSpec {
        name: "JALR",
        mask: 0x0000707f,
        bits: 0x00000067,
        decode: decode_i,
        disassemble: disassemble_jalr,
        execute: |hart, uop, ops| {
            let link = hart.pc;
            hart.pc = hart.sext(ops.s1.wrapping_add(uop.imm) & !1);
            Ok(Some(link))
        },
    },
    InsnSpec {
        name: "BEQ",
        mask: 0x0000707f,
        bits: 0x00000063,
        decode: decode_b,
        disassemble: disassemble_b,
        execute: |hart, uop, ops| {
            if ops.s1 == ops.s2 {
                hart.branch_to(uop.imm)?;
            }
            Ok(None)
        },
    },
    InsnSpec {
        name: "BNE",
        mask: 0x0000707f,
        bits: 0x00001063,
        decode: decode_b,
        disassemble: disassemble_b,
        execute: |hart, uop, ops| {
            if ops.s1 != ops.s2 {
                hart.branch_to(uop.imm)?;
            }
            Ok(None)
        },
    },
    InsnSpec {
        name: "BLT",
        mask: 0x0000707f,
        bits: 0x00004063,
        decode: decode_b,
        disassemble: disassemble_b,
        execute: |hart, uop, ops| {
            if ops.s1 < ops.s2 {
                hart.branch_to(uop.imm)?;
            }
            Ok(None)
        },
    },
    InsnSpec {
        name: "BGE",
        mask: 0x0000707f,
        bits: 0x00005063,
        decode: decode_b,
        disassemble: disassemble_b,
        execute: |hart, uop, ops| {
            if ops.s1 >= ops.s2 {
                hart.branch_to(uop.imm)?;
            }
            Ok(None)
        },
    },
    InsnSpec {
        name: "BLTU",
        mask: 0x0000707f,
        bits: 0x00006063,
        decode: decode_b,
        disassemble: disassemble_b,
        execute: |hart, uop, ops| {
            if (ops.s1 as u64) < (ops.s2 as u64) {
                hart.branch_to(uop.imm)?;
            }
            Ok(None)
        },
    },
    InsnSpec {
        name: "BGEU",
        mask: 0x0000707f,
        bits: 0x00007063,
        decode: decode_b,
        disassemble: disassemble_b,
        execute: |hart, uop, ops| {
            if (ops.s1 as u64) >= (ops.s2 as u64) {
                hart.branch_to(uop.imm)?;
            }
            Ok(None)
        },
    },
    InsnSpec {
        name: "LB",
        mask: 0x0000707f,
        bits: 0x00000003,
        decode: decode_i,
        disassemble: disassemble_i_mem,
        execute: |hart, uop, ops| {
            let v = hart.memop(Read, ops.s1, uop.imm, 0, 1)? as i8 as i64;
            Ok(Some(v))
        },
    },
    InsnSpec {
        name: "LH",
        mask: 0x0000707f,
        bits: 0x00001003,
        decode: decode_i,
        disassemble: disassemble_i_mem,
        execute: |hart, uop, ops| {
            let v = hart.memop(Read, ops.s1, uop.imm, 0, 2)? as i16 as i64;
            Ok(Some(v))
        },
    },
    InsnSpec {
        name: "LW",
        mask: 0x0000707f,
        bits: 0x00002003,
        decode: decode_i,
        disassemble: disassemble_i_mem,
        execute: |hart, uop, ops| {
            let v = hart.memop(Read, ops.s1, uop.imm, 0, 4)?;
            Ok(Some(v as i32 as i64))
        },
    },
    InsnSpec {
        name: "LBU",
        mask: 0x0000707f,
        bits: 0x00004003,
        decode: decode_i,
        disassemble: disassemble_i_mem,
        execute: |hart, uop, ops| {
            let v = hart.memop(Read, ops.s1, uop.imm, 0, 1)?;
            Ok(Some(v))
        },
    },
    InsnSpec {
        name: "LHU",
        mask: 0x0000707f,
        bits: 0x00005003,
        decode: decode_i,
        disassemble: disassemble_i_mem,
        execute: |hart, uop, ops| {
            let v = hart.memop(Read, ops.s1, uop.imm, 0, 2)?;
            Ok(Some(v))
        },
    },
    InsnSpec {
        name: "SB",
        mask: 0x0000707f,
        bits: 0x00000023,
        decode: decode_s,
        disassemble: disassemble_s,
        execute: |hart, uop, ops| {
            let _ = hart.memop(Write, ops.s1, uop.imm, ops.s2, 1)?;
            Ok(None)
        },
    },
    InsnSpec {
        name: "SH",
        mask: 0x0000707f,
        bits: 0x00001023,
        decode: decode_s,
        disassemble: disassemble_s,
        execute: |hart, uop, ops| {
            let _ = hart.memop(Write, ops.s1, uop.imm, ops.s2, 2)?;
            Ok(None)
        },
    },
    InsnSpec {
        name: "SW",
        mask: 0x0000707f,
        bits: 0x00002023,
        decode: decode_s,
        disassemble: disassemble_s,
        execute: |hart, uop, ops| {
            let _ = hart.memop(Write, ops.s1, uop.imm, ops.s2, 4)?;
            Ok(None)
        },
    },
    InsnSpec {
        name: "ADDI",
        mask: 0x0000707f,
        bits: 0x00000013,
        decode: decode_i,
        disassemble: disassemble_i,
        execute: |_hart, uop, ops| Ok(Some(ops.s1.wrapping_add(uop.imm))),
    },
    InsnSpec {
        name: "SLTI",
        mask: 0x0000707f,
        bits: 0x00002013,
        decode: decode_i,
        disassemble: disassemble_i,
        execute: |_hart, uop, ops| Ok(Some(i64::from(ops.s1 < uop.imm))),
    },
    InsnSpec {
        name: "SLTIU",
        mask: 0x0000707f,
        bits: 0x00003013,
        decode: decode_i,
        disassemble: disassemble_i,
        execute: |_hart, uop, ops| Ok(Some(i64::from((ops.s1 as u64) < (uop.imm as u64)))),
    },
    InsnSpec {
        name: "XORI",
        mask: 0x0000707f,
        bits: 0x00004013,
        decode: decode_i,
        disassemble: disassemble_i,
        execute: |_hart, uop, ops| Ok(Some(ops.s1 ^ uop.imm)),
    },
    InsnSpec {
        name: "ORI",
        mask: 0x0000707f,
        bits: 0x00006013,
        decode: decode_i,
        disassemble: disassemble_i,
        execute: |_hart, uop, ops| Ok(Some(ops.s1 | uop.imm)),
    },
    InsnSpec {
        name: "ANDI",
        mask: 0x0000707f,
        bits: 0x00007013,
        decode: decode_i,
        disassemble: disassemble_i,
        execute: |_hart, uop, ops| Ok(Some(ops.s1 & uop.imm)),
    },
    // The RV32I shift-immediate forms are subsumed by the RV64I
    // encodings; shamt bit 5 is rejected at execution on RV32.
    InsnSpec {
        name: "SLLI",
        mask: 0xfc00707f,
        bits: 0x00001013,
        decode: decode_r_shift,
        disassemble: disassemble_r_shift,
        execute: |hart, uop, ops| {
            hart.check_shamt(uop.imm)?;
            Ok(Some(ops.s1.wrapping_shl(uop.imm as u32)))
        },
    },
    InsnSpec {
        name: "SRLI",
        mask: 0xfc00707f,
        bits: 0x00005013,
        decode: decode_r_shift,
        disassemble: disassemble_r_shift,
        execute: |hart, uop, ops| {
            hart.check_shamt(uop.imm)?;
            Ok(Some(match hart.xlen {
                Xlen::Rv32 => i64::from(((ops.s1 as u32) >> uop.imm) as i32),
                Xlen::Rv64 => ((ops.s1 as u64) >> uop.imm) as i64,
            }))
        },
    },
    InsnSpec {
        name: "SRAI",
        mask: 0xfc00707f,
        bits: 0x40005013,
        decode: decode_r_shift,
        disassemble: disassemble_r_shift,
        execute: |hart, uop, ops| {
            hart.check_shamt(uop.imm)?;
            Ok(Some(match hart.xlen {
                Xlen::Rv32 => i64::from((ops.s1 as i32) >> uop.imm),
                Xlen::Rv64 => ops.s1 >> uop.imm,
            }))
        },
    },
    InsnSpec {
        name: "ADD",
        mask: 0xfe00707f,
        bits: 0x00000033,
        decode: decode_r,
        disassemble: disassemble_r,
        execute: |_hart, _uop, ops| Ok(Some(ops.s1.wrapping_add(ops.s2))),
    },
    InsnSpec {
        name: "SUB",
        mask: 0xfe00707f,
        bits: 0x40000033,
        decode: decode_r,
        disassemble: disassemble_r,
        execute: |_hart, _uop, ops| Ok(Some(ops.s1.wrapping_sub(ops.s2))),
    },
    InsnSpec {
        name: "SLL",
        mask: 0xfe00707f,
        bits: 0x00001033,
        decode: decode_r,
        disassemble: disassemble_r,
        execute: |hart, _uop, ops| {
            let amount = (ops.s2 & hart.xlen.shamt_mask()) as u32;
            Ok(Some(ops.s1.wrapping_shl(amount)))
        },
    },
    InsnSpec {
        name: "SLT",
        mask: 0xfe00707f,
        bits: 0x00002033,
        decode: decode_r,
        disassemble: disassemble_r,
        execute: |_hart, _uop, ops| Ok(Some(i64::from(ops.s1 < ops.s2))),
    },
    InsnSpec {
        name: "SLTU",
        mask: 0xfe00707f,
        bits: 0x00003033,
        decode: decode_r,
        disassemble: disassemble_r,
        execute: |_hart, _uop, ops| Ok(Some(i64::from((ops.s1 as u64) < (ops.s2 as u64)))),
    },
    InsnSpec {
        name: "XOR",
        mask: 0xfe00707f,
        bits: 0x00004033,
        decode: decode_r,
        disassemble: disassemble_r,
        execute: |_hart, _uop, ops| Ok(Some(ops.s1 ^ ops.s2)),
    },
    InsnSpec {
        name: "SRL",
        mask: 0xfe00707f,
        bits: 0x00005033,
        decode: decode_r,
        disassemble: disassemble_r,
        execute: |hart, _uop, ops| {
            let amount = (ops.s2 & hart.xlen.shamt_mask()) as u32;
            Ok(Some(match hart.xlen {
                Xlen::Rv32 => i64::from(((ops.s1 as u32) >> amount) as i32),
                Xlen::Rv64 => ((ops.s1 as u64) >> amount) as i64,
            }))
        },
    },
    InsnSpec {
        name: "SRA",
        mask: 0xfe00707f,
        bits: 0x40005033,
        decode: decode_r,
        disassemble: disassemble_r,
        execute: |hart, _uop, ops| {
            let amount = (ops.s2 & hart.xlen.shamt_mask()) as u32;
            Ok(Some(match hart.xlen {
                Xlen::Rv32 => i64::from((ops.s1 as i32) >> amount),
                Xlen::Rv64 => ops.s1 >> amount,
            }))
        },
    },
    InsnSpec {
        name: "OR",
        mask: 0xfe00707f,
        bits: 0x00006033,
        decode: decode_r,
        disassemble: disassemble_r,
        execute: |_hart, _uop, ops| Ok(Some(ops.s1 | ops.s2)),
    },
    InsnSpec {
        name: "AND",
        mask: 0xfe00707f,
        bits: 0x00007033,
        decode: decode_r,
        disassemble: disassemble_r,
        execute: |_hart, _uop, ops| Ok(Some(ops.s1 & ops.s2)),
    },
    // No caches and a single hart: fences have nothing to order.
    InsnSpec {
        name: "FENCE",
        mask: 0x0000707f,
        bits: 0x0000000f,
        decode: decode_empty,
        disassemble: disassemble_empty,
        execute: |_hart, _uop, _ops| Ok(None),
    },
    InsnSpec {
        name: "FENCE.I",
        mask: 0x0000707f,
        bits: 0x0000100f,
        decode: decode_empty,
        disassemble: disassemble_empty,
        execute: |_hart, _uop, _ops| Ok(None),
    },
    InsnSpec {
        name: "ECALL",
        mask: 0xffffffff,
        bits: 0x00000073,
        decode: decode_empty,
        disassemble: disassemble_empty,
        execute: |hart, _uop, _ops| {
            let trap = match hart.prv {
                PrivMode::U => Trap::EnvironmentCallFromUMode,
                PrivMode::S => Trap::EnvironmentCallFromSMode,
                PrivMode::M => Trap::EnvironmentCallFromMMode,
            };
            Err(Exception { trap, tval: 0 })
        },
    },
    InsnSpec {
        name: "EBREAK",
        mask: 0xffffffff,
        bits: 0x00100073,
        decode: decode_empty,
        disassemble: disassemble_empty,
        execute: |_hart, _uop, _ops| {
            Err(Exception {
                trap: Trap::Breakpoint,
                tval: 0,
            })
        },
    },
    // RV64I
    InsnSpec {
        name: "LWU",
        mask: 0x0000707f,
        bits: 0x00006003,
        decode: decode_i,
        disassemble: disassemble_i_mem,
        execute: |hart, uop, ops| {
            hart.require_rv64()?;
            let v = hart.memop(Read, ops.s1, uop.imm, 0, 4)?;
            Ok(Some(v))
        },
    },
    InsnSpec {
        name: "LD",
        mask: 0x0000707f,
        bits: 0x00003003,
        decode: decode_i,
        disassemble: disassemble_i_mem,
        execute: |hart, uop, ops| {
            hart.require_rv64()?;
            let v = hart.memop(Read, ops.s1, uop.imm, 0, 8)?;
            Ok(Some(v))
        },
    },
    InsnSpec {
        name: "SD",
        mask: 0x0000707f,
        bits: 0x00003023,
        decode: decode_s,
        disassemble: disassemble_s,
        execute: |hart, uop, ops| {
            hart.require_rv64()?;
            let _ = hart.memop(Write, ops.s1, uop.imm, ops.s2, 8)?;
            Ok(None)
        },
    },
    InsnSpec {
        name: "ADDIW",
        mask: 0x0000707f,
        bits: 0x0000001b,
        decode: decode_i,
        disassemble: disassemble_i,
        execute: |hart, uop, ops| {
            hart.require_rv64()?;
            Ok(Some(i64::from(ops.s1.wrapping_add(uop.imm) as i32)))
        },
    },
    InsnSpec {
        name: "SLLIW",
        mask: 0xfe00707f,
        bits: 0x0000101b,
        decode: decode_r_shift,
        disassemble: disassemble_r_shift,
        execute: |hart, uop, ops| {
            hart.require_rv64()?;
            Ok(Some(i64::from((ops.s1 as i32) << (uop.imm & 31))))
        },
    },
    InsnSpec {
        name: "SRLIW",
        mask: 0xfe00707f,
        bits: 0x0000501b,
        decode: decode_r_shift,
        disassemble: disassemble_r_shift,
        execute: |hart, uop, ops| {
            hart.require_rv64()?;
            Ok(Some(i64::from(((ops.s1 as u32) >> (uop.imm & 31)) as i32)))
        },
    },
    InsnSpec {
        name: "SRAIW",
        mask: 0xfe00707f,
        bits: 0x4000501b,
        decode: decode_r_shift,
        disassemble: disassemble_r_shift,
        execute: |hart, uop, ops| {
            hart.require_rv64()?;
            Ok(Some(i64::from((ops.s1 as i32) >> (uop.imm & 31))))
        },
    },
    InsnSpec {
        name: "ADDW",
        mask: 0xfe00707f,
        bits: 0x0000003b,
        decode: decode_r,
        disassemble: disassemble_r,
        execute: |hart, _uop, ops| {
            hart.require_rv64()?;
            Ok(Some(i64::from(ops.s1.wrapping_add(ops.s2) as i32)))
        },
    },
    InsnSpec {
        name: "SUBW",
        mask: 0xfe00707f,
        bits: 0x4000003b,
        decode: decode_r,
        disassemble: disassemble_r,
        execute: |hart, _uop, ops| {
            hart.require_rv64()?;
            Ok(Some(i64::from(ops.s1.wrapping_sub(ops.s2) as i32)))
        },
    },
    InsnSpec {
        name: "SLLW",
        mask: 0xfe00707f,
        bits: 0x0000103b,
        decode: decode_r,
        disassemble: disassemble_r,
        execute: |hart, _uop, ops| {
            hart.require_rv64()?;
            Ok(Some(i64::from(
                (ops.s1 as u32).wrapping_shl(ops.s2 as u32) as i32
            )))
        },
    },
    InsnSpec {
        name: "SRLW",
        mask: 0xfe00707f,
        bits: 0x0000503b,
        decode: decode_r,
        disassemble: disassemble_r,
        execute: |hart, _uop, ops| {
            hart.require_rv64()?;
            Ok(Some(i64::from(
                (ops.s1 as u32).wrapping_shr(ops.s2 as u32) as i32
            )))
        },
    },
    InsnSpec {
        name: "SRAW",
        mask: 0xfe00707f,
        bits: 0x4000503b,
        decode: decode_r,
        disassemble: disassemble_r,
        execute: |hart, _uop, ops| {
            hart.require_rv64()?;
            Ok(Some(i64::from(
                (ops.s1 as i32).wrapping_shr(ops.s2 as u32 & 31)
            )))
        },
    },
    // RV32/RV64 Zicsr
    InsnSpec {
        name: "CSRRW",
        mask: 0x0000707f,
        bits: 0x00001073,
        decode: decode_csr,
        disassemble: disassemble_csr,
        execute: |hart, uop, ops| {
            let csrno = uop.imm as u16;
            let res = if uop.rd.is_x0_dest() {
                hart.write_csr(csrno, ops.s1)?;
                0
            } else {
                let v = hart.read_csr(csrno)?;
                hart.write_csr(csrno, ops.s1)?;
                v
            };
            Ok(Some(res))
        },
    },
    InsnSpec {
        name: "CSRRS",
        mask: 0x0000707f,
        bits: 0x00002073,
        decode: decode_csr,
        disassemble: disassemble_csr,
        execute: |hart, uop, ops| {
            let csrno = uop.imm as u16;
            let data = hart.read_csr(csrno)?;
            if uop.rs1.get() != 0 {
                hart.write_csr(csrno, data | ops.s1)?;
            }
            Ok(Some(data))
        },
    },
    InsnSpec {
        name: "CSRRC",
        mask: 0x0000707f,
        bits: 0x00003073,
        decode: decode_csr,
        disassemble: disassemble_csr,
        execute: |hart, uop, ops| {
            let csrno = uop.imm as u16;
            let data = hart.read_csr(csrno)?;
            if uop.rs1.get() != 0 {
                hart.write_csr(csrno, data & !ops.s1)?;
            }
            Ok(Some(data))
        },
    },
    InsnSpec {
        name: "CSRRWI",
        mask: 0x0000707f,
        bits: 0x00005073,
        decode: decode_csri,
        disassemble: disassemble_csri,
        execute: |hart, uop, _ops| {
            let csrno = uop.imm as u16;
            let uimm = i64::from(uop.rs1.get());
            let res = if uop.rd.is_x0_dest() {
                hart.write_csr(csrno, uimm)?;
                0
            } else {
                let v = hart.read_csr(csrno)?;
                hart.write_csr(csrno, uimm)?;
                v
            };
            Ok(Some(res))
        },
    },
    InsnSpec {
        name: "CSRRSI",
        mask: 0x0000707f,
        bits: 0x00006073,
        decode: decode_csri,
        disassemble: disassemble_csri,
        execute: |hart, uop, _ops| {
            let csrno = uop.imm as u16;
            let data = hart.read_csr(csrno)?;
            if uop.rs1.get() != 0 {
                hart.write_csr(csrno, data | i64::from(uop.rs1.get()))?;
            }
            Ok(Some(data))
        },
    },
    InsnSpec {
        name: "CSRRCI",
        mask: 0x0000707f,
        bits: 0x00007073,
        decode: decode_csri,
        disassemble: disassemble_csri,
        execute: |hart, uop, _ops| {
            let csrno = uop.imm as u16;
            let data = hart.read_csr(csrno)?;
            if uop.rs1.get() != 0 {
                hart.write_csr(csrno, data & !i64::from(uop.rs1.get()))?;
            }
            Ok(Some(data))
        },
    },
    // RV32M
    InsnSpec {
        name: "MUL",
        mask: 0xfe00707f,
        bits: 0x02000033,
        decode: decode_r,
        disassemble: disassemble_r,
        execute: |_hart, _uop, ops| Ok(Some(ops.s1.wrapping_mul(ops.s2))),
    },
    InsnSpec {
        name: "MULH",
        mask: 0xfe00707f,
        bits: 0x02001033,
        decode: decode_r,
        disassemble: disassemble_r,
        execute: |hart, _uop, ops| {
            Ok(Some(match hart.xlen {
                Xlen::Rv32 => ops.s1.wrapping_mul(ops.s2) >> 32,
                Xlen::Rv64 => ((i128::from(ops.s1) * i128::from(ops.s2)) >> 64) as i64,
            }))
        },
    },
    InsnSpec {
        name: "MULHSU",
        mask: 0xfe00707f,
        bits: 0x02002033,
        decode: decode_r,
        disassemble: disassemble_r,
        execute: |hart, _uop, ops| {
            Ok(Some(match hart.xlen {
                Xlen::Rv32 => ops.s1.wrapping_mul(i64::from(ops.s2 as u32)) >> 32,
                Xlen::Rv64 => {
                    ((ops.s1 as u128).wrapping_mul(u128::from(ops.s2 as u64)) >> 64) as i64
                }
            }))
        },
    },
    InsnSpec {
        name: "MULHU",
        mask: 0xfe00707f,
        bits: 0x02003033,
        decode: decode_r,
        disassemble: disassemble_r,
        execute: |hart, _uop, ops| {
            Ok(Some(match hart.xlen {
                Xlen::Rv32 => {
                    (u64::from(ops.s1 as u32).wrapping_mul(u64::from(ops.s2 as u32)) >> 32) as i64
                }
                Xlen::Rv64 => {
                    (u128::from(ops.s1 as u64).wrapping_mul(u128::from(ops.s2 as u64)) >> 64) as i64
                }
            }))
        },
    },
    InsnSpec {
        name: "DIV",
        mask: 0xfe00707f,
        bits: 0x02004033,
        decode: decode_r,
        disassemble: disassemble_r,
        execute: |hart, _uop, ops| {
            Ok(Some(match hart.xlen {
                Xlen::Rv32 => {
                    let (s1, s2) = (ops.s1 as i32, ops.s2 as i32);
                    if s2 == 0 {
                        -1
                    } else if s1 == i32::MIN && s2 == -1 {
                        i64::from(s1)
                    } else {
                        i64::from(s1.wrapping_div(s2))
                    }
                }
                Xlen::Rv64 => {
                    if ops.s2 == 0 {
                        -1
                    } else if ops.s1 == i64::MIN && ops.s2 == -1 {
                        ops.s1
                    } else {
                        ops.s1.wrapping_div(ops.s2)
                    }
                }
            }))
        },
    },
    InsnSpec {
        name: "DIVU",
        mask: 0xfe00707f,
        bits: 0x02005033,
        decode: decode_r,
        disassemble: disassemble_r,
        execute: |hart, _uop, ops| {
            Ok(Some(match hart.xlen {
                Xlen::Rv32 => {
                    let (s1, s2) = (ops.s1 as u32, ops.s2 as u32);
                    if s2 == 0 {
                        -1
                    } else {
                        i64::from(s1.wrapping_div(s2) as i32)
                    }
                }
                Xlen::Rv64 => {
                    if ops.s2 == 0 {
                        -1
                    } else {
                        (ops.s1 as u64).wrapping_div(ops.s2 as u64) as i64
                    }
                }
            }))
        },
    },
    InsnSpec {
        name: "REM",
        mask: 0xfe00707f,
        bits: 0x02006033,
        decode: decode_r,
        disassemble: disassemble_r,
        execute: |hart, _uop, ops| {
            Ok(Some(match hart.xlen {
                Xlen::Rv32 => {
                    let (s1, s2) = (ops.s1 as i32, ops.s2 as i32);
                    if s2 == 0 {
                        i64::from(s1)
                    } else if s1 == i32::MIN && s2 == -1 {
                        0
                    } else {
                        i64::from(s1.wrapping_rem(s2))
                    }
                }
                Xlen::Rv64 => {
                    if ops.s2 == 0 {
                        ops.s1
                    } else if ops.s1 == i64::MIN && ops.s2 == -1 {
                        0
                    } else {
                        ops.s1.wrapping_rem(ops.s2)
                    }
                }
            }))
        },
    },
    InsnSpec {
        name: "REMU",
        mask: 0xfe00707f,
        bits: 0x02007033,
        decode: decode_r,
        disassemble: disassemble_r,
        execute: |hart, _uop, ops| {
            Ok(Some(match hart.xlen {
                Xlen::Rv32 => {
                    let (s1, s2) = (ops.s1 as u32, ops.s2 as u32);
                    match s2 {
                        0 => i64::from(s1 as i32),
                        _ => i64::from(s1.wrapping_rem(s2) as i32),
                    }
                }
                Xlen::Rv64 => match ops.s2 as u64 {
                    0 => ops.s1,
                    _ => (ops.s1 as u64).wrapping_rem(ops.s2 as u64) as i64,
                },
            }))
        },
    },
    // RV64M
    InsnSpec {
        name: "MULW",
        mask: 0xfe00707f,
        bits: 0x0200003b,
        decode: decode_r,
        disassemble: disassemble_r,
        execute: |hart, _uop, ops| {
            hart.require_rv64()?;
            Ok(Some(i64::from((ops.s1 as i32).wrapping_mul(ops.s2 as i32))))
        },
    },
    InsnSpec {
        name: "DIVW",
        mask: 0xfe00707f,
        bits: 0x0200403b,
        decode: decode_r,
        disassemble: disassemble_r,
        execute: |hart, _uop, ops| {
            hart.require_rv64()?;
            let (s1, s2) = (ops.s1 as i32, ops.s2 as i32);
            Ok(Some(if s2 == 0 {
                -1
            } else if s1 == i32::MIN && s2 == -1 {
                i64::from(s1)
            } else {
                i64::from(s1.wrapping_div(s2))
            }))
        },
    },
    InsnSpec {
        name: "DIVUW",
        mask: 0xfe00707f,
        bits: 0x0200503b,
        decode: decode_r,
        disassemble: disassemble_r,
        execute: |hart, _uop, ops| {
            hart.require_rv64()?;
            let (s1, s2) = (ops.s1 as u32, ops.s2 as u32);
            Ok(Some(if s2 == 0 {
                -1
            } else {
                i64::from(s1.wrapping_div(s2) as i32)
            }))
        },
    },
    InsnSpec {
        name: "REMW",
        mask: 0xfe00707f,
        bits: 0x0200603b,
        decode: decode_r,
        disassemble: disassemble_r,
        execute: |hart, _uop, ops| {
            hart.require_rv64()?;
            let (s1, s2) = (ops.s1 as i32, ops.s2 as i32);
            Ok(Some(if s2 == 0 {
                i64::from(s1)
            } else if s1 == i32::MIN && s2 == -1 {
                0
            } else {
                i64::from(s1.wrapping_rem(s2))
            }))
        },
    },
    InsnSpec {
        name: "REMUW",
        mask: 0xfe00707f,
        bits: 0x0200703b,
        decode: decode_r,
        disassemble: disassemble_r,
        execute: |hart, _uop, ops| {
            hart.require_rv64()?;
            let (s1, s2) = (ops.s1 as u32, ops.s2 as u32);
            Ok(Some(match s2 {
                0 => i64::from(s1 as i32),
                _ => i64::from(s1.wrapping_rem(s2) as i32),
            }))
        },
    },
    // Privileged
    InsnSpec {
        name: "MRET",
        mask: 0xffffffff,
        bits: 0x30200073,
        decode: decode_empty,
        disassemble: disassemble_empty,
        execute: |hart, _uop, _ops| {
            if hart.prv != PrivMode::M {
                return Err(hart.illegal_insn());
            }
            let status = hart.read_csr_raw(Csr::Mstatus as u16);
            let mpie = status >> 7 & 1;
            let mpp = status >> 11 & 3;
            // MIE <- MPIE, MPIE <- 1, MPP <- U.
            let status = (status & !(MSTATUS_MIE | MSTATUS_MPIE | MSTATUS_MPP))
                | mpie << 3
                | MSTATUS_MPIE;
            hart.csregs.poke(Csr::Mstatus as u16, status);
            hart.prv = PrivMode::try_from(mpp).unwrap_or(PrivMode::U);
            hart.pc = hart.from_arch(hart.read_csr_raw(Csr::Mepc as u16));
            Ok(None)
        },
    },
    // Neither supervisor nor user trap handling is implemented, so
    // both return forms are illegal.
    InsnSpec {
        name: "SRET",
        mask: 0xffffffff,
        bits: 0x10200073,
        decode: decode_empty,
        disassemble: disassemble_empty,
        execute: |hart, _uop, _ops| Err(hart.illegal_insn()),
    },
    InsnSpec {
        name: "URET",
        mask: 0xffffffff,
        bits: 0x00200073,
        decode: decode_empty,
        disassemble: disassemble_empty,
        execute: |hart, _uop, _ops| Err(hart.illegal_insn()),
    },
    // An idle hint; there is nothing to wait for.
    InsnSpec {
        name: "WFI",
        mask: 0xffffffff,
        bits: 0x10500073,
        decode: decode_empty,
        disassemble: disassemble_empty,
        execute: |_hart, _uop, _ops| Ok(None),
    },
];

impl Hart {
    /// Taken-branch helper: alignment check, then redirect.
    fn branch_to(&mut self, target: i64) -> Result<(), Exception> {
        if target & 1 != 0 {
            return Err(Exception {
                trap: Trap::InstructionAddressMisaligned,
                tval: target,
            });
        }
        self.pc = self.sext(target);
        Ok(())
    }

    /// Shift amounts of 32..63 are only encodable on RV64.
    fn check_shamt(&self, shamt: i64) -> Result<(), Exception> {
        if self.xlen == Xlen::Rv32 && shamt & 0x20 != 0 {
            return Err(self.illegal_insn());
        }
        Ok(())
    }
}

#[cfg(test)]
mod test_hart {
    use super::*;

    const MEM_SIZE: usize = 0x10000;
    const HANDLER: u64 = 0x500;

    fn hart() -> Hart {
        Hart::new(0, Xlen::Rv64, MEM_SIZE)
    }

    fn hart32() -> Hart {
        Hart::new(0, Xlen::Rv32, MEM_SIZE)
    }

    fn put(h: &mut Hart, addr: u64, word: u32) {
        assert!(h.poke_memory_u32(addr, word));
    }

    /// Execute the single instruction at `addr`.
    fn step_at(h: &mut Hart, addr: u64) {
        h.poke_pc(addr);
        assert_eq!(h.run_until_address(addr, None), RunOutcome::StopAddress);
    }

    /// Run from `addr` with a trap handler registered as the stop
    /// address, so the test halts when the trap is taken.
    fn run_into_trap(h: &mut Hart, addr: u64) {
        assert!(h.poke_csr(Csr::Mtvec as u16, HANDLER));
        h.set_stop_address(HANDLER);
        h.poke_pc(addr);
        assert_eq!(h.run(None), RunOutcome::StopAddress);
    }

    #[test]
    fn simple_arithmetic() {
        let mut h = hart();
        put(&mut h, 0, 0x002081b3); // add x3, x1, x2
        assert!(h.poke_int_reg(1, 5));
        assert!(h.poke_int_reg(2, 7));
        step_at(&mut h, 0);
        assert_eq!(h.peek_int_reg(3), Some(12));
        assert_eq!(h.peek_pc(), 4);
    }

    #[test]
    fn branch_taken() {
        let mut h = hart();
        put(&mut h, 0x100, 0x00208863); // beq x1, x2, +16
        assert!(h.poke_int_reg(1, 1));
        assert!(h.poke_int_reg(2, 1));
        step_at(&mut h, 0x100);
        assert_eq!(h.peek_pc(), 0x110);
    }

    #[test]
    fn branch_not_taken() {
        let mut h = hart();
        put(&mut h, 0x100, 0x00208863); // beq x1, x2, +16
        assert!(h.poke_int_reg(1, 1));
        assert!(h.poke_int_reg(2, 2));
        step_at(&mut h, 0x100);
        assert_eq!(h.peek_pc(), 0x104);
    }

    #[test]
    fn division_by_zero() {
        let mut h = hart32();
        put(&mut h, 0, 0x0220c1b3); // div x3, x1, x2
        assert!(h.poke_int_reg(1, 0xdeadbeef));
        assert!(h.poke_int_reg(2, 0));
        step_at(&mut h, 0);
        assert_eq!(h.peek_int_reg(3), Some(0xffff_ffff));
        // No trap was taken.
        assert_eq!(h.peek_csr(Csr::Mcause as u16), Some(0));

        let mut h = hart();
        put(&mut h, 0, 0x0220c1b3);
        assert!(h.poke_int_reg(1, 0xdeadbeef));
        step_at(&mut h, 0);
        assert_eq!(h.peek_int_reg(3), Some(u64::MAX));
    }

    #[test]
    fn illegal_instruction() {
        let mut h = hart();
        // Memory is zeroed; the all-zero halfword is reserved.
        run_into_trap(&mut h, 0);
        assert_eq!(h.peek_csr(Csr::Mcause as u16), Some(2));
        assert_eq!(h.peek_csr(Csr::Mepc as u16), Some(0));
        assert_eq!(h.peek_csr(Csr::Mtval as u16), Some(0));
        assert_eq!(h.peek_pc(), HANDLER);
        assert_eq!(h.priv_mode(), PrivMode::M);
        // The failed dispatch retired nothing.
        assert_eq!(h.retired_insts(), 0);
    }

    #[test]
    fn ecall_from_machine_mode() {
        let mut h = hart();
        put(&mut h, 0, 0x00000073); // ecall
        run_into_trap(&mut h, 0);
        assert_eq!(h.peek_csr(Csr::Mcause as u16), Some(11));
        assert_eq!(h.peek_csr(Csr::Mepc as u16), Some(0));
        assert_eq!(h.peek_pc(), HANDLER);
    }

    #[test]
    fn compressed_expansion_equivalence() {
        // c.addi x8, 1 and its expansion addi x8, x8, 1 must produce
        // the same state delta, modulo the pc increment.
        let mut h = hart();
        assert!(h.poke_memory_u16(0, 0x0405));
        assert!(h.poke_int_reg(8, 10));
        step_at(&mut h, 0);
        assert_eq!(h.peek_int_reg(8), Some(11));
        assert_eq!(h.peek_pc(), 2);

        let mut h = hart();
        put(&mut h, 0, 0x00140413);
        assert!(h.poke_int_reg(8, 10));
        step_at(&mut h, 0);
        assert_eq!(h.peek_int_reg(8), Some(11));
        assert_eq!(h.peek_pc(), 4);
    }

    #[test]
    fn compressed_equivalence_sweep() {
        // Register-register compressed forms against their expansions.
        for code in [0x0085u16, 0x852e, 0x952e, 0x8d0d, 0x8d2d, 0x8d6d] {
            let mut a = hart();
            let word = a.expand_inst(code).unwrap();
            assert!(a.poke_memory_u16(0, code));
            let mut b = hart();
            put(&mut b, 0, word);
            for h in [&mut a, &mut b] {
                for i in 1..32 {
                    assert!(h.poke_int_reg(i, 0x1234_5678_9abc_def0 + i as u64));
                }
            }
            step_at(&mut a, 0);
            step_at(&mut b, 0);
            for i in 0..32 {
                assert_eq!(a.peek_int_reg(i), b.peek_int_reg(i), "code {code:04x} reg {i}");
            }
            assert_eq!(a.peek_pc(), 2);
            assert_eq!(b.peek_pc(), 4);
        }
    }

    #[test]
    fn reserved_compressed_form_traps() {
        let mut h = hart();
        assert!(h.poke_memory_u16(0, 0x8002)); // c.jr x0 is reserved
        run_into_trap(&mut h, 0);
        assert_eq!(h.peek_csr(Csr::Mcause as u16), Some(2));
        assert_eq!(h.peek_csr(Csr::Mtval as u16), Some(0x8002));
    }

    #[test]
    fn shift_amount_masking() {
        let mut h = hart();
        put(&mut h, 0, 0x002091b3); // sll x3, x1, x2
        assert!(h.poke_int_reg(1, 1));
        assert!(h.poke_int_reg(2, 65)); // masked to 1
        step_at(&mut h, 0);
        assert_eq!(h.peek_int_reg(3), Some(2));

        let mut h = hart32();
        put(&mut h, 0, 0x002091b3);
        assert!(h.poke_int_reg(1, 1));
        assert!(h.poke_int_reg(2, 33)); // masked to 1
        step_at(&mut h, 0);
        assert_eq!(h.peek_int_reg(3), Some(2));
    }

    #[test]
    fn rv32_rejects_large_shift_immediates() {
        let mut h = hart32();
        put(&mut h, 0, 0x02809193); // slli x3, x1, 40
        run_into_trap(&mut h, 0);
        assert_eq!(h.peek_csr(Csr::Mcause as u16), Some(2));
    }

    #[test]
    fn division_boundaries() {
        // div INT_MIN / -1 leaves INT_MIN, rem leaves 0.
        let mut h = hart();
        put(&mut h, 0, 0x0220c1b3); // div x3, x1, x2
        put(&mut h, 4, 0x0220e233); // rem x4, x1, x2
        assert!(h.poke_int_reg(1, i64::MIN as u64));
        assert!(h.poke_int_reg(2, -1i64 as u64));
        h.poke_pc(0);
        h.run_until_address(4, None);
        assert_eq!(h.peek_int_reg(3), Some(i64::MIN as u64));
        assert_eq!(h.peek_int_reg(4), Some(0));

        let mut h = hart32();
        put(&mut h, 0, 0x0220c1b3);
        put(&mut h, 4, 0x0220e233);
        assert!(h.poke_int_reg(1, 0x8000_0000));
        assert!(h.poke_int_reg(2, 0xffff_ffff));
        h.poke_pc(0);
        h.run_until_address(4, None);
        assert_eq!(h.peek_int_reg(3), Some(0x8000_0000));
        assert_eq!(h.peek_int_reg(4), Some(0));
    }

    #[test]
    fn remainder_of_zero_divisor_is_dividend() {
        let mut h = hart();
        put(&mut h, 0, 0x0220e233); // rem x4, x1, x2
        put(&mut h, 4, 0x0220f233); // remu x4, x1, x2
        assert!(h.poke_int_reg(1, 12345));
        assert!(h.poke_int_reg(2, 0));
        step_at(&mut h, 0);
        assert_eq!(h.peek_int_reg(4), Some(12345));
        step_at(&mut h, 4);
        assert_eq!(h.peek_int_reg(4), Some(12345));
    }

    #[test]
    fn sltiu_is_seqz() {
        let mut h = hart();
        put(&mut h, 0, 0x0010b193); // sltiu x3, x1, 1
        assert!(h.poke_int_reg(1, 0));
        step_at(&mut h, 0);
        assert_eq!(h.peek_int_reg(3), Some(1));
        assert!(h.poke_int_reg(1, 5));
        step_at(&mut h, 0);
        assert_eq!(h.peek_int_reg(3), Some(0));
    }

    #[test]
    fn x0_writes_are_discarded() {
        let mut h = hart();
        put(&mut h, 0, 0x00100013); // addi x0, x0, 1
        step_at(&mut h, 0);
        assert_eq!(h.peek_int_reg(0), Some(0));
    }

    #[test]
    fn jal_and_jalr_link() {
        let mut h = hart();
        put(&mut h, 0, 0x008000ef); // jal x1, +8
        step_at(&mut h, 0);
        assert_eq!(h.peek_int_reg(1), Some(4));
        assert_eq!(h.peek_pc(), 8);

        // The jalr target drops its low bit.
        put(&mut h, 8, 0x003100e7); // jalr x1, 3(x2)
        assert!(h.poke_int_reg(2, 0x200));
        step_at(&mut h, 8);
        assert_eq!(h.peek_int_reg(1), Some(12));
        assert_eq!(h.peek_pc(), 0x202);
    }

    #[test]
    fn csr_read_only_write_traps() {
        let mut h = hart();
        put(&mut h, 0, 0xf1429073); // csrrw x0, mhartid, x5
        run_into_trap(&mut h, 0);
        assert_eq!(h.peek_csr(Csr::Mcause as u16), Some(2));
        assert_eq!(h.peek_csr(Csr::Mtval as u16), Some(0xf1429073));
    }

    #[test]
    fn unknown_csr_leaves_rd_unmodified() {
        let mut h = hart();
        put(&mut h, 0, 0x123012f3); // csrrw x5, 0x123, x0
        assert!(h.poke_int_reg(5, 0x55));
        run_into_trap(&mut h, 0);
        assert_eq!(h.peek_csr(Csr::Mcause as u16), Some(2));
        assert_eq!(h.peek_int_reg(5), Some(0x55));
    }

    #[test]
    fn csrrs_with_x0_suppresses_the_write() {
        let mut h = hart();
        assert!(h.poke_csr(Csr::Mscratch as u16, 0xabc));
        put(&mut h, 0, 0x340022f3); // csrrs x5, mscratch, x0
        step_at(&mut h, 0);
        assert_eq!(h.peek_int_reg(5), Some(0xabc));
        assert_eq!(h.peek_csr(Csr::Mscratch as u16), Some(0xabc));
    }

    #[test]
    fn csrrw_swaps() {
        let mut h = hart();
        assert!(h.poke_csr(Csr::Mscratch as u16, 0xabc));
        assert!(h.poke_int_reg(6, 0x123));
        put(&mut h, 0, 0x340312f3); // csrrw x5, mscratch, x6
        step_at(&mut h, 0);
        assert_eq!(h.peek_int_reg(5), Some(0xabc));
        assert_eq!(h.peek_csr(Csr::Mscratch as u16), Some(0x123));
    }

    #[test]
    fn csrrwi_uses_the_immediate() {
        let mut h = hart();
        put(&mut h, 0, 0x3404d2f3); // csrrwi x5, mscratch, 9
        step_at(&mut h, 0);
        assert_eq!(h.peek_csr(Csr::Mscratch as u16), Some(9));
    }

    #[test]
    fn counters_track_retirement() {
        let mut h = hart();
        put(&mut h, 0, 0x00108093); // addi x1, x1, 1
        put(&mut h, 4, 0x00108093);
        h.poke_pc(0);
        h.run_until_address(4, None);
        assert_eq!(h.retired_insts(), 2);
        assert_eq!(h.peek_csr(Csr::Minstret as u16), Some(2));
        assert!(h.peek_csr(Csr::Mcycle as u16).unwrap() >= 2);

        // A trapping dispatch bumps the cycle counter only.
        put(&mut h, 8, 0x00000073); // ecall
        run_into_trap(&mut h, 8);
        assert_eq!(h.peek_csr(Csr::Minstret as u16), Some(2));
    }

    #[test]
    fn instret_reads_through_csr_instructions() {
        let mut h = hart();
        put(&mut h, 0, 0x00108093); // addi x1, x1, 1
        put(&mut h, 4, 0xc02022f3); // csrrs x5, instret, x0
        h.poke_pc(0);
        h.run_until_address(4, None);
        // The read happens before this instruction retires.
        assert_eq!(h.peek_int_reg(5), Some(1));
    }

    #[test]
    fn trap_then_mret_resumes() {
        let mut h = hart();
        put(&mut h, 4, 0x00000073); // ecall
        put(&mut h, HANDLER, 0x30200073); // mret
        run_into_trap(&mut h, 4);
        assert_eq!(h.peek_csr(Csr::Mepc as u16), Some(4));
        assert_eq!(h.peek_csr(Csr::Mcause as u16), Some(11));

        // Skip over the ecall and return.
        assert!(h.poke_csr(Csr::Mepc as u16, 8));
        h.clear_stop_address();
        h.run_until_address(HANDLER, None);
        assert_eq!(h.peek_pc(), 8);
        // MPP was machine, and is reset to user by the return.
        assert_eq!(h.priv_mode(), PrivMode::M);
        let mstatus = h.peek_csr(Csr::Mstatus as u16).unwrap();
        assert_eq!(mstatus & MSTATUS_MPP, 0);
        assert_ne!(mstatus & MSTATUS_MPIE, 0);
    }

    #[test]
    fn mret_pops_to_user_and_ecall_reports_user() {
        let mut h = hart();
        // With MPP already zero, mret drops to user mode.
        put(&mut h, 0, 0x30200073); // mret
        assert!(h.poke_csr(Csr::Mstatus as u16, 0));
        assert!(h.poke_csr(Csr::Mepc as u16, 0x10));
        step_at(&mut h, 0);
        assert_eq!(h.priv_mode(), PrivMode::U);
        assert_eq!(h.peek_pc(), 0x10);

        put(&mut h, 0x10, 0x00000073); // ecall, now from U
        run_into_trap(&mut h, 0x10);
        assert_eq!(h.peek_csr(Csr::Mcause as u16), Some(8));
        assert_eq!(h.priv_mode(), PrivMode::M);
    }

    #[test]
    fn sret_and_uret_are_illegal() {
        for word in [0x10200073u32, 0x00200073] {
            let mut h = hart();
            put(&mut h, 0, word);
            run_into_trap(&mut h, 0);
            assert_eq!(h.peek_csr(Csr::Mcause as u16), Some(2));
            assert_eq!(h.peek_csr(Csr::Mtval as u16), Some(u64::from(word)));
        }
    }

    #[test]
    fn wfi_and_fences_are_no_ops() {
        let mut h = hart();
        put(&mut h, 0, 0x10500073); // wfi
        put(&mut h, 4, 0x0000000f); // fence
        put(&mut h, 8, 0x0000100f); // fence.i
        h.poke_pc(0);
        h.run_until_address(8, None);
        assert_eq!(h.peek_pc(), 12);
        assert_eq!(h.retired_insts(), 3);
    }

    #[test]
    fn external_interrupt_delivery() {
        let mut h = hart();
        put(&mut h, 0, 0x00108093); // addi x1, x1, 1
        assert!(h.poke_csr(Csr::Mie as u16, MIP_MEIP));
        assert!(h.poke_csr(Csr::Mstatus as u16, MSTATUS_MIE | MSTATUS_MPP));
        assert!(h.poke_csr(Csr::Mtvec as u16, 0x200));
        h.interrupt_flag().store(true, Ordering::Relaxed);
        h.set_stop_address(0x200);
        h.poke_pc(0);
        assert_eq!(h.run(None), RunOutcome::StopAddress);
        assert_eq!(
            h.peek_csr(Csr::Mcause as u16),
            Some(Xlen::Rv64.interrupt_bit() | 11)
        );
        // The pc of the instruction that would have run next.
        assert_eq!(h.peek_csr(Csr::Mepc as u16), Some(0));
        // Delivery retires nothing; the addi never ran.
        assert_eq!(h.retired_insts(), 0);
        assert_eq!(h.peek_int_reg(1), Some(0));
        // MIE was pushed into MPIE and cleared.
        let mstatus = h.peek_csr(Csr::Mstatus as u16).unwrap();
        assert_eq!(mstatus & MSTATUS_MIE, 0);
        assert_ne!(mstatus & MSTATUS_MPIE, 0);
    }

    #[test]
    fn masked_interrupt_stays_pending() {
        let mut h = hart();
        put(&mut h, 0, 0x00108093); // addi x1, x1, 1
        // mstatus.MIE is clear, so nothing is delivered.
        assert!(h.poke_csr(Csr::Mie as u16, MIP_MEIP));
        h.interrupt_flag().store(true, Ordering::Relaxed);
        step_at(&mut h, 0);
        assert_eq!(h.peek_int_reg(1), Some(1));
        assert_ne!(h.peek_csr(Csr::Mip as u16).unwrap() & MIP_MEIP, 0);
    }

    #[test]
    fn vectored_interrupts_index_by_cause() {
        let mut h = hart();
        assert!(h.poke_csr(Csr::Mie as u16, MIP_MTIP));
        assert!(h.poke_csr(Csr::Mip as u16, MIP_MTIP));
        assert!(h.poke_csr(Csr::Mstatus as u16, MSTATUS_MIE));
        assert!(h.poke_csr(Csr::Mtvec as u16, 0x200 | 1));
        // Machine timer interrupt: cause 7, vectored to base + 28.
        h.set_stop_address(0x200 + 4 * 7);
        h.poke_pc(0);
        assert_eq!(h.run(None), RunOutcome::StopAddress);
        assert_eq!(
            h.peek_csr(Csr::Mcause as u16),
            Some(Xlen::Rv64.interrupt_bit() | 7)
        );
    }

    #[test]
    fn tohost_store_halts() {
        let mut h = hart();
        put(&mut h, 0, 0x0020a023); // sw x2, 0(x1)
        assert!(h.poke_int_reg(1, 0x800));
        assert!(h.poke_int_reg(2, 42));
        h.set_tohost_address(0x800);
        h.poke_pc(0);
        assert_eq!(h.run(None), RunOutcome::ToHost);
        // The store completed before the halt.
        assert_eq!(h.peek_memory_u32(0x800), Some(42));
        assert_eq!(h.retired_insts(), 1);
    }

    #[test]
    fn doubleword_store_does_not_hit_tohost() {
        let mut h = hart();
        put(&mut h, 0, 0x0020b023); // sd x2, 0(x1)
        put(&mut h, 4, 0x0020a023); // sw x2, 0(x1)
        assert!(h.poke_int_reg(1, 0x800));
        assert!(h.poke_int_reg(2, 42));
        h.set_tohost_address(0x800);
        h.poke_pc(0);
        assert_eq!(h.run(None), RunOutcome::ToHost);
        // Only the word-sized store triggered the halt.
        assert_eq!(h.retired_insts(), 2);
    }

    #[test]
    fn terminate_flag_stops_the_loop() {
        let mut h = hart();
        put(&mut h, 0, 0x0000006f); // jal x0, 0 (spin)
        h.terminate_flag().store(true, Ordering::Relaxed);
        h.poke_pc(0);
        assert_eq!(h.run(None), RunOutcome::Terminated);
    }

    #[test]
    fn stop_address_halts_before_execution() {
        let mut h = hart();
        put(&mut h, 0, 0x00108093); // addi x1, x1, 1
        put(&mut h, 4, 0x00108093);
        h.set_stop_address(4);
        h.poke_pc(0);
        assert_eq!(h.run(None), RunOutcome::StopAddress);
        assert_eq!(h.peek_int_reg(1), Some(1));
        assert_eq!(h.peek_pc(), 4);
    }

    #[test]
    fn run_until_address_is_inclusive() {
        let mut h = hart();
        put(&mut h, 0, 0x00108093); // addi x1, x1, 1
        put(&mut h, 4, 0x00108093);
        h.poke_pc(0);
        assert_eq!(h.run_until_address(4, None), RunOutcome::StopAddress);
        assert_eq!(h.peek_int_reg(1), Some(2));
        assert_eq!(h.peek_pc(), 8);
    }

    #[test]
    fn fetch_past_memory_faults() {
        let mut h = hart();
        assert!(h.poke_csr(Csr::Mtvec as u16, HANDLER));
        h.set_stop_address(HANDLER);
        h.poke_pc(MEM_SIZE as u64 + 0x100);
        assert_eq!(h.run(None), RunOutcome::StopAddress);
        assert_eq!(h.peek_csr(Csr::Mcause as u16), Some(1));
        assert_eq!(h.peek_csr(Csr::Mtval as u16), Some(MEM_SIZE as u64 + 0x100));
    }

    #[test]
    fn load_past_memory_faults() {
        let mut h = hart();
        put(&mut h, 0, 0x0000a183); // lw x3, 0(x1)
        assert!(h.poke_int_reg(1, MEM_SIZE as u64));
        run_into_trap(&mut h, 0);
        assert_eq!(h.peek_csr(Csr::Mcause as u16), Some(5));
        assert_eq!(h.peek_csr(Csr::Mtval as u16), Some(MEM_SIZE as u64));
    }

    #[test]
    fn rv32_rejects_rv64_instructions() {
        for word in [0x0000b183u32, 0x0000e183, 0x0020b023, 0x002081bb, 0x0010819b] {
            let mut h = hart32();
            put(&mut h, 0, word);
            run_into_trap(&mut h, 0);
            assert_eq!(h.peek_csr(Csr::Mcause as u16), Some(2), "word {word:08x}");
        }
    }

    #[test]
    fn rv32_wraps_at_32_bits() {
        let mut h = hart32();
        put(&mut h, 0, 0x002081b3); // add x3, x1, x2
        assert!(h.poke_int_reg(1, 0xffff_ffff));
        assert!(h.poke_int_reg(2, 1));
        step_at(&mut h, 0);
        assert_eq!(h.peek_int_reg(3), Some(0));
    }

    #[test]
    fn misaligned_loads_are_silent_by_default() {
        let mut h = hart();
        put(&mut h, 0, 0x0000a183); // lw x3, 0(x1)
        assert!(h.poke_memory_u32(0x101, 0x11223344));
        assert!(h.poke_int_reg(1, 0x101));
        step_at(&mut h, 0);
        assert_eq!(h.peek_int_reg(3), Some(0x11223344));
    }

    #[test]
    fn strict_alignment_traps_misaligned_loads() {
        let mut h = hart();
        h.set_strict_align(true);
        put(&mut h, 0, 0x0000a183); // lw x3, 0(x1)
        assert!(h.poke_int_reg(1, 0x101));
        run_into_trap(&mut h, 0);
        assert_eq!(h.peek_csr(Csr::Mcause as u16), Some(4));
        assert_eq!(h.peek_csr(Csr::Mtval as u16), Some(0x101));
    }

    #[test]
    fn loads_sign_and_zero_extend() {
        let mut h = hart();
        assert!(h.poke_memory_u32(0x100, 0xffff_ff80));
        put(&mut h, 0, 0x00008183); // lb x3, 0(x1)
        put(&mut h, 4, 0x0000c183); // lbu x3, 0(x1)
        assert!(h.poke_int_reg(1, 0x100));
        step_at(&mut h, 0);
        assert_eq!(h.peek_int_reg(3), Some(0xffff_ffff_ffff_ff80));
        step_at(&mut h, 4);
        assert_eq!(h.peek_int_reg(3), Some(0x80));
    }

    #[test]
    fn mulh_variants() {
        let mut h = hart();
        put(&mut h, 0, 0x022091b3); // mulh x3, x1, x2
        assert!(h.poke_int_reg(1, -1i64 as u64));
        assert!(h.poke_int_reg(2, -1i64 as u64));
        step_at(&mut h, 0);
        assert_eq!(h.peek_int_reg(3), Some(0)); // (-1 * -1) >> 64

        put(&mut h, 4, 0x0220b1b3); // mulhu x3, x1, x2
        step_at(&mut h, 4);
        assert_eq!(h.peek_int_reg(3), Some(0xffff_ffff_ffff_fffe));

        let mut h = hart32();
        put(&mut h, 0, 0x0220b1b3); // mulhu
        assert!(h.poke_int_reg(1, 0xffff_ffff));
        assert!(h.poke_int_reg(2, 0xffff_ffff));
        step_at(&mut h, 0);
        assert_eq!(h.peek_int_reg(3), Some(0xffff_fffe));
    }

    #[test]
    fn disassembly() {
        let h = hart();
        assert_eq!(h.disassemble_inst(0x002081b3), "add     gp, ra, sp");
        assert_eq!(h.disassemble_inst(0x00108093), "addi    ra, ra, 1");
        assert_eq!(h.disassemble_inst(0x0000a183), "lw      gp, 0(ra)");
        assert_eq!(h.disassemble_inst(0x123450b7), "lui     ra, 0x12345");
        assert_eq!(h.disassemble_inst(0x340022f3), "csrrs   t0, mscratch, zero");
        assert_eq!(h.disassemble_inst(0x00000073), "ecall");
        assert_eq!(h.disassemble_inst(0x00000000), "illegal");
        // Compressed forms disassemble through their expansion.
        assert_eq!(h.disassemble_inst(0x0405), "addi    s0, s0, 1");
    }

    #[test]
    fn trace_records() {
        let mut h = hart();
        put(&mut h, 0, 0x00108093); // addi x1, x1, 1
        put(&mut h, 4, 0x0020a023); // sw x2, 0(x1)
        assert!(h.poke_int_reg(2, 0xbeef));
        let mut sink = Vec::new();
        h.poke_pc(0);
        h.run_until_address(4, Some(&mut sink));
        let text = String::from_utf8(sink).unwrap();
        let mut lines = text.lines();
        let first = lines.next().unwrap();
        assert_eq!(
            first,
            "#1 M 0000000000000000 00108093 addi    ra, ra, 1 ra=1"
        );
        let second = lines.next().unwrap();
        assert_eq!(
            second,
            "#2 M 0000000000000004 0020a023 sw      sp, 0(ra) [1]=beef"
        );
    }

    #[test]
    fn register_and_csr_lookup() {
        let h = hart();
        assert_eq!(h.find_int_reg("a0"), Some(10));
        assert_eq!(h.find_int_reg("x17"), Some(17));
        assert_eq!(h.find_csr("mtvec"), Some(Csr::Mtvec as u16));
        assert_eq!(h.find_csr("nope"), None);
    }

    #[test]
    fn rv32_counter_halves() {
        let mut h = hart32();
        assert!(h.poke_csr(Csr::Minstret as u16, 0xffff_ffff));
        assert!(h.poke_csr(Csr::Minstreth as u16, 1));
        put(&mut h, 0, 0x00108093); // addi x1, x1, 1
        step_at(&mut h, 0);
        assert_eq!(h.peek_csr(Csr::Minstret as u16), Some(0));
        assert_eq!(h.peek_csr(Csr::Minstreth as u16), Some(2));
    }

    #[test]
    fn self_test_passes() {
        assert!(hart().self_test());
        assert!(hart32().self_test());
    }
}

