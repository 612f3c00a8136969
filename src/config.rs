//! Process-level knobs for kernel generation.
//!
//! Kernel shapes always arrive as call arguments. The settings here only
//! decide which ISA may be used and whether generated code is dumped for
//! inspection. They are read from the environment once:
//!
//! - `QUANTJIT_MAX_ISA`: `avx512`, `avx2` or `scalar`; caps ISA selection.
//! - `QUANTJIT_DUMP_DIR`: directory receiving `<kernel-name>.bin` files.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;

use crate::isa::{CpuFeatures, Isa};

/// Upper bound on the instruction set a dispatcher may select.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum IsaLimit {
    /// Always use the reference implementation.
    Scalar,
    Avx2,
    #[default]
    Avx512,
}

impl IsaLimit {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "scalar" | "none" | "ref" => Some(IsaLimit::Scalar),
            "avx2" => Some(IsaLimit::Avx2),
            "avx512" | "avx-512" => Some(IsaLimit::Avx512),
            _ => None,
        }
    }

    fn allows(self, isa: Isa) -> bool {
        match isa {
            Isa::Avx2 => self >= IsaLimit::Avx2,
            Isa::Avx512 => self >= IsaLimit::Avx512,
        }
    }
}

/// Generation settings shared by the dispatchers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JitConfig {
    /// Widest ISA the dispatchers may pick.
    pub max_isa: IsaLimit,
    /// When set, every generated kernel is written here as raw machine code.
    pub dump_dir: Option<PathBuf>,
}

static ENV_CONFIG: Lazy<JitConfig> = Lazy::new(JitConfig::from_env);

impl JitConfig {
    /// Reads `QUANTJIT_MAX_ISA` and `QUANTJIT_DUMP_DIR`.
    pub fn from_env() -> Self {
        let max_isa = match std::env::var("QUANTJIT_MAX_ISA") {
            Ok(value) => IsaLimit::parse(&value).unwrap_or_else(|| {
                log::warn!("ignoring unrecognised QUANTJIT_MAX_ISA={value:?}");
                IsaLimit::default()
            }),
            Err(_) => IsaLimit::default(),
        };
        let dump_dir = std::env::var_os("QUANTJIT_DUMP_DIR").map(PathBuf::from);
        JitConfig { max_isa, dump_dir }
    }

    /// Configuration captured from the environment on first access.
    pub fn global() -> &'static JitConfig {
        &ENV_CONFIG
    }

    /// Same settings with a different ISA cap.
    pub fn with_max_isa(mut self, max_isa: IsaLimit) -> Self {
        self.max_isa = max_isa;
        self
    }

    /// Same settings with code dumping into `dir`.
    pub fn with_dump_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.dump_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Widest ISA both supported by `cpu` and allowed by this config.
    pub fn select_isa(&self, cpu: &CpuFeatures) -> Option<Isa> {
        [Isa::Avx512, Isa::Avx2]
            .into_iter()
            .find(|&isa| cpu.supports(isa) && self.max_isa.allows(isa))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_limits() {
        assert_eq!(IsaLimit::parse("AVX2"), Some(IsaLimit::Avx2));
        assert_eq!(IsaLimit::parse(" avx512 "), Some(IsaLimit::Avx512));
        assert_eq!(IsaLimit::parse("scalar"), Some(IsaLimit::Scalar));
        assert_eq!(IsaLimit::parse("sse4"), None);
    }

    #[test]
    fn test_select_isa_respects_cap() {
        let cpu = CpuFeatures {
            avx2: true,
            fma: true,
            avx512f: true,
            avx512bw: true,
            avx512dq: true,
            avx512vl: true,
        };
        let config = JitConfig::default();
        assert_eq!(config.select_isa(&cpu), Some(Isa::Avx512));

        let capped = config.clone().with_max_isa(IsaLimit::Avx2);
        assert_eq!(capped.select_isa(&cpu), Some(Isa::Avx2));

        let scalar = config.with_max_isa(IsaLimit::Scalar);
        assert_eq!(scalar.select_isa(&cpu), None);
    }
}
