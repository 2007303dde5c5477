//! CPU feature sets consumed by the encoders.
//!
//! Detection is the embedder's job; this crate only validates that an
//! emitted instruction is legal for the advertised set. The set is a plain
//! value so that tests can fabricate any combination.

use crate::env::Arch;

/// One instruction-set extension.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum CpuFeature {
    /// SSE2; baseline on x86-64.
    Sse2 = 0,
    Sse3,
    Ssse3,
    Sse41,
    Sse42,
    Avx,
    Avx2,
    Fma,
    Bmi1,
    Bmi2,
    Aes,
    Sha,
    Avx512f,
    Avx512vl,
    Avx512dq,
    Avx512bw,
    /// NEON; baseline on AArch64.
    Neon,
    Crc32,
    /// AArch64 AES/SHA crypto extensions.
    Crypto,
}

impl CpuFeature {
    /// Name used in diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            Self::Sse2 => "sse2",
            Self::Sse3 => "sse3",
            Self::Ssse3 => "ssse3",
            Self::Sse41 => "sse4.1",
            Self::Sse42 => "sse4.2",
            Self::Avx => "avx",
            Self::Avx2 => "avx2",
            Self::Fma => "fma",
            Self::Bmi1 => "bmi1",
            Self::Bmi2 => "bmi2",
            Self::Aes => "aes",
            Self::Sha => "sha",
            Self::Avx512f => "avx512f",
            Self::Avx512vl => "avx512vl",
            Self::Avx512dq => "avx512dq",
            Self::Avx512bw => "avx512bw",
            Self::Neon => "neon",
            Self::Crc32 => "crc32",
            Self::Crypto => "crypto",
        }
    }
}

/// A set of [`CpuFeature`]s.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CpuFeatures(u32);

impl CpuFeatures {
    /// The empty set.
    pub fn none() -> Self {
        Self(0)
    }

    /// The guaranteed baseline for `arch`: SSE2 on x86-64, NEON on AArch64.
    pub fn baseline(arch: Arch) -> Self {
        match arch {
            Arch::X64 => Self::none().with(CpuFeature::Sse2),
            Arch::Aarch64 => Self::none().with(CpuFeature::Neon),
        }
    }

    /// Every feature this crate can gate on, for tests.
    pub fn all() -> Self {
        Self(!0)
    }

    /// Add a feature, builder-style.
    pub fn with(mut self, feature: CpuFeature) -> Self {
        self.insert(feature);
        self
    }

    /// Add a feature in place.
    pub fn insert(&mut self, feature: CpuFeature) {
        self.0 |= 1 << feature as u32;
    }

    /// Whether the set contains `feature`.
    pub fn contains(&self, feature: CpuFeature) -> bool {
        self.0 & (1 << feature as u32) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn baseline_contains_expected_features() {
        assert!(CpuFeatures::baseline(Arch::X64).contains(CpuFeature::Sse2));
        assert!(!CpuFeatures::baseline(Arch::X64).contains(CpuFeature::Avx));
        assert!(CpuFeatures::baseline(Arch::Aarch64).contains(CpuFeature::Neon));
    }
}
