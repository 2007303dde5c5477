//! Target environment: architecture, platform, and derived calling
//! convention.
//!
//! The environment is an explicit value injected into holders and
//! assemblers; nothing in this crate consults process-global state.

use std::fmt;
use target_lexicon::{Architecture, OperatingSystem, Triple};

/// A supported target architecture.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Arch {
    /// x86-64.
    X64,
    /// AArch64.
    Aarch64,
}

impl Arch {
    /// Minimum instruction alignment, in bytes.
    pub fn insn_align(self) -> u32 {
        match self {
            Self::X64 => 1,
            Self::Aarch64 => 4,
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::X64 => write!(f, "x86_64"),
            Self::Aarch64 => write!(f, "aarch64"),
        }
    }
}

/// The operating system, as far as calling conventions care.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Platform {
    /// Microsoft Windows.
    Windows,
    /// Linux and other System V platforms.
    Linux,
    /// macOS / Darwin.
    MacOs,
    /// Anything else; treated as System V-like.
    Other,
}

/// Function calling conventions supported by the frame builder.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CallConv {
    /// System V AMD64 ABI (Linux, macOS, BSD on x86-64).
    SystemV,
    /// Windows x64 "fastcall".
    WindowsFastcall,
    /// The AArch64 procedure-call standard, including Apple's variant.
    Aapcs64,
}

impl CallConv {
    /// The default convention for an architecture/platform pair.
    pub fn default_for(arch: Arch, platform: Platform) -> Self {
        match arch {
            Arch::X64 => match platform {
                Platform::Windows => Self::WindowsFastcall,
                _ => Self::SystemV,
            },
            Arch::Aarch64 => Self::Aapcs64,
        }
    }
}

impl fmt::Display for CallConv {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::SystemV => write!(f, "system_v"),
            Self::WindowsFastcall => write!(f, "windows_fastcall"),
            Self::Aapcs64 => write!(f, "aapcs64"),
        }
    }
}

/// A target description: architecture, platform, and what follows from them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Environment {
    /// Target architecture.
    pub arch: Arch,
    /// Target platform.
    pub platform: Platform,
    /// Default calling convention for functions built in this environment.
    pub call_conv: CallConv,
}

impl Environment {
    /// Build an environment from explicit parts.
    pub fn new(arch: Arch, platform: Platform) -> Self {
        Self {
            arch,
            platform,
            call_conv: CallConv::default_for(arch, platform),
        }
    }

    /// Describe the host this library is compiled for.
    pub fn host() -> Self {
        Self::from_triple(&Triple::host()).expect("host is a supported target")
    }

    /// Build an environment from a target triple, if the architecture is
    /// supported.
    pub fn from_triple(triple: &Triple) -> Option<Self> {
        let arch = match triple.architecture {
            Architecture::X86_64 => Arch::X64,
            Architecture::Aarch64(_) => Arch::Aarch64,
            _ => return None,
        };
        let platform = match triple.operating_system {
            OperatingSystem::Windows => Platform::Windows,
            OperatingSystem::Linux => Platform::Linux,
            OperatingSystem::Darwin | OperatingSystem::MacOSX { .. } => Platform::MacOs,
            _ => Platform::Other,
        };
        Some(Self::new(arch, platform))
    }

    /// Pointer size in bytes. Both supported targets are 64-bit.
    pub fn pointer_bytes(&self) -> u8 {
        8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_conv_follows_platform() {
        let win = Environment::new(Arch::X64, Platform::Windows);
        assert_eq!(win.call_conv, CallConv::WindowsFastcall);
        let linux = Environment::new(Arch::X64, Platform::Linux);
        assert_eq!(linux.call_conv, CallConv::SystemV);
        let mac_arm = Environment::new(Arch::Aarch64, Platform::MacOs);
        assert_eq!(mac_arm.call_conv, CallConv::Aapcs64);
    }

    #[test]
    fn triple_roundtrip() {
        let triple: Triple = "x86_64-unknown-linux-gnu".parse().unwrap();
        let env = Environment::from_triple(&triple).unwrap();
        assert_eq!(env.arch, Arch::X64);
        assert_eq!(env.platform, Platform::Linux);
    }
}
