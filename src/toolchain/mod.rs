//! Toolchain families and their resolved descriptors.
//!
//! Each supported compiler family is one variant of [`ToolchainKind`]; the
//! resolver dispatches over the closed enum exactly once per session and
//! produces an immutable [`ToolchainDescriptor`].

pub mod acquire;
pub mod resolver;

pub use resolver::{apply_compat_rename, resolve, Resolved};

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::ToolchainError;
use crate::models::Arch;
use crate::paths::Layout;

/// The eight supported compiler families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolchainKind {
    /// Vendor AOSP clang + LLVM bundle (archive-distributed by tag).
    AospClang,
    /// Vendor AOSP GCC 4.9 bundle (archive-distributed by tag).
    AospGcc,
    /// Community clang bundle with LLVM binutils.
    Proton,
    /// Community clang bundle with LLVM binutils.
    Neutron,
    /// Community bare-metal GCC bundle.
    Eva,
    /// Community bare-metal GCC bundle.
    Arter,
    /// Proton clang paired with Eva GCC binutils.
    ProtonEva,
    /// Compiler already installed on the host.
    Host,
}

impl ToolchainKind {
    pub const ALL: [ToolchainKind; 8] = [
        ToolchainKind::AospClang,
        ToolchainKind::AospGcc,
        ToolchainKind::Proton,
        ToolchainKind::Neutron,
        ToolchainKind::Eva,
        ToolchainKind::Arter,
        ToolchainKind::ProtonEva,
        ToolchainKind::Host,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ToolchainKind::AospClang => "aosp-clang",
            ToolchainKind::AospGcc => "aosp-gcc",
            ToolchainKind::Proton => "proton",
            ToolchainKind::Neutron => "neutron",
            ToolchainKind::Eva => "eva",
            ToolchainKind::Arter => "arter",
            ToolchainKind::ProtonEva => "proton-eva",
            ToolchainKind::Host => "host",
        }
    }

    /// Clang families are subject to the 32-bit cross option rename on
    /// recent kernels.
    pub fn is_clang(&self) -> bool {
        matches!(
            self,
            ToolchainKind::AospClang
                | ToolchainKind::Proton
                | ToolchainKind::Neutron
                | ToolchainKind::ProtonEva
        )
    }

    /// The installable components this family is made of. The host
    /// compiler has none.
    pub fn components(&self) -> Vec<Component> {
        match self {
            ToolchainKind::AospClang => vec![Component {
                dir_name: "aosp-clang",
                source: AcquireSource::AospArchive {
                    repo_url: "https://android.googlesource.com/platform/prebuilts/clang/host/linux-x86",
                },
                linker_check: Some("bin/clang"),
            }],
            ToolchainKind::AospGcc => vec![Component {
                dir_name: "aosp-gcc",
                source: AcquireSource::AospArchive {
                    repo_url: "https://android.googlesource.com/platform/prebuilts/gcc/linux-x86/aarch64/aarch64-linux-android-4.9",
                },
                linker_check: Some("bin/aarch64-linux-android-gcc"),
            }],
            ToolchainKind::Proton => vec![proton_component()],
            ToolchainKind::Neutron => vec![Component {
                dir_name: "neutron",
                source: AcquireSource::GitBranch {
                    url: "https://github.com/Neutron-Toolchains/clang",
                    branch: "main",
                },
                linker_check: Some("bin/clang"),
            }],
            ToolchainKind::Eva => vec![eva_component()],
            ToolchainKind::Arter => vec![Component {
                dir_name: "arter",
                source: AcquireSource::GitBranch {
                    url: "https://github.com/arter97/arm64-gcc",
                    branch: "master",
                },
                linker_check: Some("bin/aarch64-elf-gcc"),
            }],
            ToolchainKind::ProtonEva => vec![proton_component(), eva_component()],
            ToolchainKind::Host => vec![],
        }
    }

    /// Family-specific rule for extracting the human-readable version.
    pub fn version_rule(&self) -> VersionRule {
        match self {
            // Archive-distributed bundles carry a version marker file.
            ToolchainKind::AospClang => VersionRule::MarkerFile {
                component: "aosp-clang",
                file: "AndroidVersion.txt",
            },
            ToolchainKind::AospGcc => VersionRule::MarkerFile {
                component: "aosp-gcc",
                file: acquire::TAG_MARKER,
            },
            // Git-cloned bundles: first line of the project readme.
            ToolchainKind::Proton | ToolchainKind::ProtonEva => VersionRule::FirstLine {
                component: "proton",
                file: "README.md",
            },
            ToolchainKind::Neutron => VersionRule::FirstLine {
                component: "neutron",
                file: "README.md",
            },
            ToolchainKind::Eva => VersionRule::FirstLine {
                component: "eva",
                file: "README.md",
            },
            ToolchainKind::Arter => VersionRule::FirstLine {
                component: "arter",
                file: "README.md",
            },
            ToolchainKind::Host => VersionRule::HostCompiler,
        }
    }

    /// Ordered make-invocation option strings for this family.
    pub fn make_options(&self, arch: Arch) -> Vec<String> {
        let opts: &[&str] = match self {
            ToolchainKind::AospClang => &[
                "CC=clang",
                "CLANG_TRIPLE=aarch64-linux-gnu-",
                "CROSS_COMPILE=aarch64-linux-android-",
                "CROSS_COMPILE_ARM32=arm-linux-androideabi-",
                "LD=ld.lld",
                "AR=llvm-ar",
                "NM=llvm-nm",
                "OBJCOPY=llvm-objcopy",
                "STRIP=llvm-strip",
            ],
            ToolchainKind::AospGcc => &[
                "CROSS_COMPILE=aarch64-linux-android-",
                "CROSS_COMPILE_ARM32=arm-linux-androideabi-",
            ],
            ToolchainKind::Proton | ToolchainKind::Neutron => &[
                "CC=clang",
                "CLANG_TRIPLE=aarch64-linux-gnu-",
                "CROSS_COMPILE=aarch64-linux-gnu-",
                "CROSS_COMPILE_ARM32=arm-linux-gnueabi-",
                "LD=ld.lld",
                "AR=llvm-ar",
                "NM=llvm-nm",
                "OBJCOPY=llvm-objcopy",
                "STRIP=llvm-strip",
            ],
            ToolchainKind::Eva | ToolchainKind::Arter => &[
                "CROSS_COMPILE=aarch64-elf-",
                "CROSS_COMPILE_ARM32=arm-eabi-",
            ],
            ToolchainKind::ProtonEva => &[
                "CC=clang",
                "CLANG_TRIPLE=aarch64-linux-gnu-",
                "CROSS_COMPILE=aarch64-elf-",
                "CROSS_COMPILE_ARM32=arm-eabi-",
                "LD=ld.lld",
            ],
            ToolchainKind::Host => &["CC=cc", "HOSTCC=cc"],
        };
        let _ = arch;
        opts.iter().map(|s| s.to_string()).collect()
    }
}

fn proton_component() -> Component {
    Component {
        dir_name: "proton",
        source: AcquireSource::GitBranch {
            url: "https://github.com/kdrag0n/proton-clang",
            branch: "master",
        },
        linker_check: Some("bin/clang"),
    }
}

fn eva_component() -> Component {
    Component {
        dir_name: "eva",
        source: AcquireSource::GitBranch {
            url: "https://github.com/mvaisakh/gcc-arm64",
            branch: "gcc-master",
        },
        linker_check: Some("bin/aarch64-elf-gcc"),
    }
}

impl fmt::Display for ToolchainKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ToolchainKind {
    type Err = ToolchainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ToolchainKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| ToolchainError::Unsupported(s.to_string()))
    }
}

/// One installable piece of a toolchain family.
#[derive(Debug, Clone)]
pub struct Component {
    pub dir_name: &'static str,
    pub source: AcquireSource,
    /// Relative path of the binary whose linker ABI must match the host.
    pub linker_check: Option<&'static str>,
}

impl Component {
    pub fn install_dir(&self, layout: &Layout) -> PathBuf {
        layout.toolchain_dir(self.dir_name)
    }
}

/// How a missing component is acquired.
#[derive(Debug, Clone)]
pub enum AcquireSource {
    /// Shallow clone of one branch.
    GitBranch {
        url: &'static str,
        branch: &'static str,
    },
    /// Latest published tag via the remote refs listing, then
    /// download-and-extract of the matching archive.
    AospArchive { repo_url: &'static str },
}

/// Family-specific version-extraction rule.
#[derive(Debug, Clone)]
pub enum VersionRule {
    /// Read an entire version marker file (trimmed).
    MarkerFile {
        component: &'static str,
        file: &'static str,
    },
    /// Read the first line of a marker file.
    FirstLine {
        component: &'static str,
        file: &'static str,
    },
    /// Invoke the host compiler with a version flag.
    HostCompiler,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trip() {
        for kind in ToolchainKind::ALL {
            assert_eq!(kind.as_str().parse::<ToolchainKind>().unwrap(), kind);
        }
        assert!("tcc".parse::<ToolchainKind>().is_err());
    }

    #[test]
    fn test_clang_families() {
        assert!(ToolchainKind::AospClang.is_clang());
        assert!(ToolchainKind::Proton.is_clang());
        assert!(!ToolchainKind::Eva.is_clang());
        assert!(!ToolchainKind::AospGcc.is_clang());
        assert!(!ToolchainKind::Host.is_clang());
    }

    #[test]
    fn test_pairing_has_two_components() {
        assert_eq!(ToolchainKind::ProtonEva.components().len(), 2);
        assert_eq!(ToolchainKind::Proton.components().len(), 1);
        assert!(ToolchainKind::Host.components().is_empty());
    }

    #[test]
    fn test_clang_options_carry_arm32_key() {
        let opts = ToolchainKind::Proton.make_options(Arch::Arm64);
        assert!(opts.iter().any(|o| o.starts_with("CROSS_COMPILE_ARM32=")));
        assert!(opts.iter().any(|o| o == "CC=clang"));
    }

    #[test]
    fn test_host_options_have_no_cross_prefix() {
        let opts = ToolchainKind::Host.make_options(Arch::Arm64);
        assert!(opts.iter().all(|o| !o.starts_with("CROSS_COMPILE")));
    }
}
