use num_derive::FromPrimitive;
use std::convert::TryFrom;
use std::fmt;

/// Discriminant bias separating interrupt variants from exception
/// variants in [`Trap`].
const INTERRUPT_BASE: u32 = 100;

/// Everything that can be delivered through mtvec. Exception variants
/// carry their mcause number as the discriminant. Interrupt variants
/// are stored biased by [`INTERRUPT_BASE`] so one enum covers both
/// families; [`Trap::cause`] strips the bias again. The gaps (10, 14,
/// and the supervisor/user slots this core never raises) are the
/// cause numbers the architecture reserves or that a machine-only
/// hart has no source for.
#[derive(Clone, Copy, Debug, FromPrimitive, PartialEq, Eq)]
pub enum Trap {
    InstructionAddressMisaligned = 0,
    InstructionAccessFault = 1,
    IllegalInstruction = 2,
    Breakpoint = 3,
    LoadAddressMisaligned = 4,
    LoadAccessFault = 5,
    StoreAddressMisaligned = 6,
    StoreAccessFault = 7,
    EnvironmentCallFromUMode = 8,
    EnvironmentCallFromSMode = 9,
    EnvironmentCallFromMMode = 11,
    // The page-fault causes are listed so the taxonomy is complete;
    // with no address translation, nothing here ever raises them.
    InstructionPageFault = 12,
    LoadPageFault = 13,
    StorePageFault = 15,

    UserSoftwareInterrupt = 100,
    SupervisorSoftwareInterrupt = 101,
    MachineSoftwareInterrupt = 103,
    UserTimerInterrupt = 104,
    SupervisorTimerInterrupt = 105,
    MachineTimerInterrupt = 107,
    UserExternalInterrupt = 108,
    SupervisorExternalInterrupt = 109,
    MachineExternalInterrupt = 111,
}

impl Trap {
    #[must_use]
    pub fn is_interrupt(self) -> bool {
        self as u32 >= INTERRUPT_BASE
    }

    /// The architectural cause number, without the interrupt bit.
    #[must_use]
    pub fn cause(self) -> u32 {
        if self.is_interrupt() {
            self as u32 - INTERRUPT_BASE
        } else {
            self as u32
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum PrivMode {
    U,
    S,
    M,
}

impl TryFrom<u64> for PrivMode {
    type Error = ();
    fn try_from(x: u64) -> Result<Self, Self::Error> {
        match x {
            0 => Ok(Self::U),
            1 => Ok(Self::S),
            3 => Ok(Self::M),
            _ => Err(()),
        }
    }
}

impl From<PrivMode> for u64 {
    fn from(x: PrivMode) -> Self {
        match x {
            PrivMode::U => 0,
            PrivMode::S => 1,
            PrivMode::M => 3,
        }
    }
}

impl fmt::Display for PrivMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::U => "U",
            Self::S => "S",
            Self::M => "M",
        })
    }
}

/// Returns `PrivMode` from encoded privilege mode bits
/// # Panics
/// On the reserved encoding 2
#[must_use]
pub fn priv_mode_from(encoding: u64) -> PrivMode {
    assert_ne!(encoding, 2);
    let Ok(m) = PrivMode::try_from(encoding) else {
        unreachable!();
    };
    m
}

/// Architectural register width, fixed when the hart is constructed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Xlen {
    Rv32,
    Rv64,
}

impl Xlen {
    #[must_use]
    pub const fn bits(self) -> u32 {
        match self {
            Self::Rv32 => 32,
            Self::Rv64 => 64,
        }
    }

    /// Mask applied to shift amounts (low 5 bits on RV32, 6 on RV64).
    #[must_use]
    pub const fn shamt_mask(self) -> i64 {
        match self {
            Self::Rv32 => 0x1f,
            Self::Rv64 => 0x3f,
        }
    }

    /// The mcause interrupt bit (bit W-1).
    #[must_use]
    pub const fn interrupt_bit(self) -> u64 {
        match self {
            Self::Rv32 => 1 << 31,
            Self::Rv64 => 1 << 63,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum MemoryAccessType {
    Execute,
    Read,
    Write,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn trap_causes() {
        assert_eq!(Trap::IllegalInstruction.cause(), 2);
        assert!(!Trap::IllegalInstruction.is_interrupt());
        assert_eq!(Trap::MachineExternalInterrupt.cause(), 11);
        assert!(Trap::MachineExternalInterrupt.is_interrupt());
        assert_eq!(Trap::MachineTimerInterrupt.cause(), 7);
        assert_eq!(Trap::EnvironmentCallFromMMode.cause(), 11);
    }

    #[test]
    fn priv_encodings() {
        assert_eq!(priv_mode_from(0), PrivMode::U);
        assert_eq!(priv_mode_from(3), PrivMode::M);
        assert_eq!(u64::from(PrivMode::S), 1);
    }
}
