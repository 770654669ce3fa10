//! Discrete pipeline stages and their strict forward ordering.

/// Stages of one build session, in order. Optional stages may be skipped;
/// there are no backward transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Init,
    CodenameSelected,
    DirsCreated,
    ToolchainResolved,
    KernelVersionRead,
    Cleaned,
    Configured,
    MenuReconfigured,
    BuildConfirmed,
    Building,
    BuildVerified,
    Packaged,
    Signed,
    Distributed,
    Done,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Init => "init",
            Stage::CodenameSelected => "codename-selected",
            Stage::DirsCreated => "dirs-created",
            Stage::ToolchainResolved => "toolchain-resolved",
            Stage::KernelVersionRead => "kernel-version-read",
            Stage::Cleaned => "cleaned",
            Stage::Configured => "configured",
            Stage::MenuReconfigured => "menu-reconfigured",
            Stage::BuildConfirmed => "build-confirmed",
            Stage::Building => "building",
            Stage::BuildVerified => "build-verified",
            Stage::Packaged => "packaged",
            Stage::Signed => "signed",
            Stage::Distributed => "distributed",
            Stage::Done => "done",
        }
    }

    /// Valid transitions FROM this stage. Optional stages appear alongside
    /// their skip target.
    pub fn valid_next(&self) -> &'static [Stage] {
        match self {
            Stage::Init => &[Stage::CodenameSelected],
            Stage::CodenameSelected => &[Stage::DirsCreated],
            Stage::DirsCreated => &[Stage::ToolchainResolved],
            Stage::ToolchainResolved => &[Stage::KernelVersionRead],
            // Clean is optional.
            Stage::KernelVersionRead => &[Stage::Cleaned, Stage::Configured],
            Stage::Cleaned => &[Stage::Configured],
            // Interactive reconfiguration is optional.
            Stage::Configured => &[Stage::MenuReconfigured, Stage::BuildConfirmed],
            Stage::MenuReconfigured => &[Stage::BuildConfirmed],
            Stage::BuildConfirmed => &[Stage::Building],
            Stage::Building => &[Stage::BuildVerified],
            // Packaging and signing are optional on the way out.
            Stage::BuildVerified => &[Stage::Packaged, Stage::Distributed],
            Stage::Packaged => &[Stage::Signed, Stage::Distributed],
            Stage::Signed => &[Stage::Distributed],
            Stage::Distributed => &[Stage::Done],
            Stage::Done => &[],
        }
    }

    pub fn can_advance_to(&self, next: Stage) -> bool {
        self.valid_next().contains(&next)
    }
}
