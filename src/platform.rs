//! Host platform/arch identification, injected into each package's script
//! environment as `ENVY_PLATFORM`, `ENVY_ARCH`, `ENVY_PLATFORM_ARCH`, and
//! `ENVY_EXE_EXT` (spec §6 "Environment").

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Darwin,
    Linux,
    Windows,
}

impl Platform {
    pub fn detect() -> Self {
        if cfg!(target_os = "macos") {
            Platform::Darwin
        } else if cfg!(target_os = "windows") {
            Platform::Windows
        } else {
            Platform::Linux
        }
    }

    pub fn exe_ext(&self) -> &'static str {
        match self {
            Platform::Windows => ".exe",
            _ => "",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Platform::Darwin => "darwin",
            Platform::Linux => "linux",
            Platform::Windows => "windows",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    Arm64,
    Aarch64,
    X86_64,
}

impl Arch {
    pub fn detect() -> Self {
        if cfg!(target_arch = "aarch64") {
            Arch::Aarch64
        } else {
            Arch::X86_64
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Arch::Arm64 => "arm64",
            Arch::Aarch64 => "aarch64",
            Arch::X86_64 => "x86_64",
        };
        f.write_str(s)
    }
}

/// `ENVY_PLATFORM`, `ENVY_ARCH`, `ENVY_PLATFORM_ARCH`, `ENVY_EXE_EXT` pairs
/// ready to merge into a script's or shell's environment.
pub fn env_vars(platform: Platform, arch: Arch) -> Vec<(String, String)> {
    vec![
        ("ENVY_PLATFORM".to_string(), platform.to_string()),
        ("ENVY_ARCH".to_string(), arch.to_string()),
        (
            "ENVY_PLATFORM_ARCH".to_string(),
            format!("{platform}-{arch}"),
        ),
        ("ENVY_EXE_EXT".to_string(), platform.exe_ext().to_string()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_vars_match_spellings() {
        let vars = env_vars(Platform::Linux, Arch::X86_64);
        assert!(vars.contains(&("ENVY_PLATFORM".to_string(), "linux".to_string())));
        assert!(vars.contains(&("ENVY_ARCH".to_string(), "x86_64".to_string())));
        assert!(vars.contains(&("ENVY_PLATFORM_ARCH".to_string(), "linux-x86_64".to_string())));
        assert!(vars.contains(&("ENVY_EXE_EXT".to_string(), String::new())));
    }

    #[test]
    fn windows_exe_ext() {
        assert_eq!(Platform::Windows.exe_ext(), ".exe");
    }
}
