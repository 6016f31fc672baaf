//! A functional simulator for a single RISC-V hart, supporting the
//! RV32IMC and RV64IMC instruction sets with machine-mode traps and
//! interrupts.
//!
//! Sample code to run a program to completion:
//! ```ignore
//! let mut sim = Simulator::new(Xlen::Rv64, 64 * 1024 * 1024);
//! let info = sim.load_elf_file("prog.elf")?;
//! if let Some(tohost) = info.tohost {
//!     sim.hart.set_tohost_address(tohost);
//! }
//! sim.hart.poke_pc(info.entry);
//! sim.hart.run(None);
//! ```
#![allow(clippy::unreadable_literal)]

pub mod cpu;
pub mod csr;
pub mod iregs;
pub mod memory;
pub mod riscv;
pub mod rvc;

use crate::cpu::Hart;
use anyhow::Context as _;
use anyhow::anyhow;
use anyhow::bail;
use fnv::FnvHashMap;
use std::fs;
use std::path::Path;
use xmas_elf::sections::SectionData;
use xmas_elf::symbol_table::Entry;

pub use cpu::RunOutcome;
pub use riscv::PrivMode;
pub use riscv::Xlen;

/// What a successful program load reported back.
#[derive(Debug, Clone, Copy)]
pub struct LoadInfo {
    /// Execution entry point.
    pub entry: u64,
    /// Address of the `_finish`/`finish` symbol, if the image has one;
    /// useful as a stop address.
    pub exit: Option<u64>,
    /// Address of the `tohost` symbol, if the image has one.
    pub tohost: Option<u64>,
}

/// A hart plus the loader-facing state around it: the symbol table of
/// the loaded image and the file-format front doors.
pub struct Simulator {
    pub hart: Hart,

    /// Maps symbol names of the loaded image to their addresses.
    pub symbols: FnvHashMap<String, u64>,
}

impl Simulator {
    #[must_use]
    pub fn new(xlen: Xlen, memory_size: usize) -> Self {
        Self {
            hart: Hart::new(0, xlen, memory_size),
            symbols: FnvHashMap::default(),
        }
    }

    /// Address of a symbol in the loaded image.
    #[must_use]
    pub fn symbol(&self, name: &str) -> Option<u64> {
        self.symbols.get(name).copied()
    }

    /// Load an ELF executable into memory.
    ///
    /// The ELF class must match the hart width (ELF32 for RV32, ELF64
    /// for RV64). Only loadable segments are copied. All named symbols
    /// are collected; `tohost` and `_finish` are reported back for
    /// run-control wiring.
    ///
    /// # Errors
    /// Malformed images, a class mismatch, and segments outside memory
    /// are reported as errors; memory may be partially written.
    pub fn load_elf_file<P: AsRef<Path>>(&mut self, path: P) -> anyhow::Result<LoadInfo> {
        let path = path.as_ref();
        let buf = fs::read(path).with_context(|| path.display().to_string())?;
        self.load_elf(&path.display().to_string(), &buf)
    }

    /// Load an ELF image already sitting in a byte buffer. See
    /// [`load_elf_file`](Self::load_elf_file).
    ///
    /// # Errors
    /// As for [`load_elf_file`](Self::load_elf_file).
    pub fn load_elf(&mut self, name: &str, buf: &[u8]) -> anyhow::Result<LoadInfo> {
        let elf = xmas_elf::ElfFile::new(buf).map_err(|e| anyhow!("{name}: {e}"))?;
        xmas_elf::header::sanity_check(&elf).map_err(|e| anyhow!("{name}: {e}"))?;

        let class = elf.header.pt1.class();
        let expected = match self.hart.xlen() {
            Xlen::Rv32 => xmas_elf::header::Class::ThirtyTwo,
            Xlen::Rv64 => xmas_elf::header::Class::SixtyFour,
        };
        if class != expected {
            bail!("{name}: ELF class does not match the hart width");
        }

        for sect in elf.program_iter() {
            if !matches!(sect.get_type(), Ok(xmas_elf::program::Type::Load)) {
                log::trace!("skipping {sect}");
                continue;
            }
            let addr = sect.physical_addr();
            let xmas_elf::program::SegmentData::Undefined(data) =
                sect.get_data(&elf).map_err(|e| anyhow!("{name}: {e}"))?
            else {
                bail!("{name}: unsupported segment data");
            };
            log::info!(
                "loading segment [{addr:x}, {:x}) (mem size {})",
                addr + data.len() as u64,
                sect.mem_size()
            );
            for (i, b) in data.iter().enumerate() {
                if !self.hart.poke_memory_u8(addr + i as u64, *b) {
                    bail!(
                        "{name}: segment does not fit in memory at {:#x}",
                        addr + i as u64
                    );
                }
            }
        }

        for sect in elf.section_iter().skip(1) {
            match sect.get_data(&elf) {
                Ok(SectionData::SymbolTable32(data)) => {
                    for datum in data {
                        let sym = datum.get_name(&elf).map_err(|e| anyhow!("{name}: {e}"))?;
                        if !sym.is_empty() {
                            self.symbols.insert(sym.to_string(), datum.value());
                        }
                    }
                }
                Ok(SectionData::SymbolTable64(data)) => {
                    for datum in data {
                        let sym = datum.get_name(&elf).map_err(|e| anyhow!("{name}: {e}"))?;
                        if !sym.is_empty() {
                            self.symbols.insert(sym.to_string(), datum.value());
                        }
                    }
                }
                _ => {}
            }
        }

        Ok(LoadInfo {
            entry: elf.header.pt2.entry_point(),
            exit: self.symbol("_finish").or_else(|| self.symbol("finish")),
            tohost: self.symbol("tohost"),
        })
    }

    /// Load a hex image: a token starting with `@` sets the current
    /// address (hexadecimal), every other token is one two-digit hex
    /// byte stored at the current address, which then advances.
    ///
    /// # Errors
    /// Malformed tokens and addresses outside memory are reported as
    /// errors; memory may be partially written.
    pub fn load_hex_file<P: AsRef<Path>>(&mut self, path: P) -> anyhow::Result<()> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).with_context(|| path.display().to_string())?;
        self.load_hex(&path.display().to_string(), &text)
    }

    /// Load hex-format text. See [`load_hex_file`](Self::load_hex_file).
    ///
    /// # Errors
    /// As for [`load_hex_file`](Self::load_hex_file).
    pub fn load_hex(&mut self, name: &str, text: &str) -> anyhow::Result<()> {
        let mut addr: u64 = 0;
        for (lineno, line) in text.lines().enumerate() {
            for token in line.split_whitespace() {
                if let Some(hex) = token.strip_prefix('@') {
                    addr = u64::from_str_radix(hex, 16)
                        .map_err(|_| anyhow!("{name}:{}: bad address @{hex}", lineno + 1))?;
                } else {
                    let byte = u8::from_str_radix(token, 16)
                        .map_err(|_| anyhow!("{name}:{}: bad byte {token}", lineno + 1))?;
                    if !self.hart.poke_memory_u8(addr, byte) {
                        bail!("{name}:{}: address {addr:#x} is outside memory", lineno + 1);
                    }
                    addr += 1;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hex_loading() {
        let mut sim = Simulator::new(Xlen::Rv64, 0x1000);
        sim.load_hex("t", "@100 93 80 10 00\n@200 01\n02 03")
            .unwrap();
        assert_eq!(sim.hart.peek_memory_u32(0x100), Some(0x00108093));
        assert_eq!(sim.hart.peek_memory_u8(0x200), Some(1));
        assert_eq!(sim.hart.peek_memory_u8(0x201), Some(2));
        assert_eq!(sim.hart.peek_memory_u8(0x202), Some(3));
    }

    #[test]
    fn hex_runs() {
        let mut sim = Simulator::new(Xlen::Rv64, 0x1000);
        // addi x1, x1, 1 at address 0.
        sim.load_hex("t", "93 80 10 00").unwrap();
        sim.hart.set_stop_address(4);
        assert_eq!(sim.hart.run(None), RunOutcome::StopAddress);
        assert_eq!(sim.hart.peek_int_reg(1), Some(1));
    }

    #[test]
    fn malformed_hex_is_an_error() {
        let mut sim = Simulator::new(Xlen::Rv64, 0x1000);
        assert!(sim.load_hex("t", "zz").is_err());
        assert!(sim.load_hex("t", "@nope 00").is_err());
        // A byte outside memory fails rather than wrapping.
        assert!(sim.load_hex("t", "@1000 00").is_err());
    }

    #[test]
    fn elf_class_mismatch_is_an_error() {
        // A minimal ELF64 header; the RV32 simulator must reject it.
        let mut header = vec![0u8; 64];
        header[..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        header[4] = 2; // ELFCLASS64
        header[5] = 1; // little endian
        header[6] = 1; // version
        let mut sim = Simulator::new(Xlen::Rv32, 0x1000);
        assert!(sim.load_elf("t", &header).is_err());
    }

    #[test]
    fn not_an_elf_is_an_error() {
        let mut sim = Simulator::new(Xlen::Rv64, 0x1000);
        assert!(sim.load_elf("t", b"not an elf").is_err());
    }
}
