use std::fmt;

use dhcp::MacAddr;

/// Client CPU architecture, as self-reported in option 93.
///
/// Untrusted input: it routes the client to a bootloader build and nothing
/// more.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    Ia32,
    X64,
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Architecture::Ia32 => write!(f, "IA32"),
            Architecture::X64 => write!(f, "X64"),
        }
    }
}

/// The firmware stage asking to boot. Selects which bootloader comes next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Firmware {
    /// Legacy BIOS PXE ROM.
    X86Pc,
    /// 32-bit EFI application environment.
    Efi32,
    /// 64-bit EFI, reporting the generic byte-code arch.
    EfiBc,
    /// 64-bit EFI.
    Efi64,
    /// A foreign iPXE build we did not serve.
    X86Ipxe,
    /// The iPXE we chainloaded ourselves; it gets the menu script.
    OwnIpxe,
}

/// A booting client, reconstructed per request. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Machine {
    pub mac: MacAddr,
    pub arch: Architecture,
}

/// Map an RFC 4578 architecture value to (architecture, firmware).
///
/// Values outside the set PXE firmware actually sends are unsupported.
pub fn decode_arch(value: u16) -> Option<(Architecture, Firmware)> {
    match value {
        0 => Some((Architecture::Ia32, Firmware::X86Pc)),
        6 => Some((Architecture::Ia32, Firmware::Efi32)),
        7 => Some((Architecture::X64, Firmware::EfiBc)),
        9 => Some((Architecture::X64, Firmware::Efi64)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_arch_values() {
        assert_eq!(decode_arch(0), Some((Architecture::Ia32, Firmware::X86Pc)));
        assert_eq!(decode_arch(7), Some((Architecture::X64, Firmware::EfiBc)));
        assert_eq!(decode_arch(9), Some((Architecture::X64, Firmware::Efi64)));
        assert_eq!(decode_arch(2), None);
    }
}
