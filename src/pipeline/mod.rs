//! Build pipeline state machine.
//!
//! Owns a single build session from codename selection to the packaged,
//! signed, and distributed archive. Stages run in strict order; the
//! optional ones (clean, menu reconfiguration, packaging) are decided by
//! the operator. Every external invocation goes through the supervised
//! executor, and every exit path funnels through the unified teardown.

pub mod stage;
pub mod teardown;

pub use stage::Stage;
pub use teardown::{teardown, TeardownGuard, TeardownReason};

use chrono::Local;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::BuilderConfig;
use crate::error::{PackageError, PipelineError, SessionError};
use crate::exec::{self, CommandSpec, Executor};
use crate::models::{BuildEnvironment, BuildOptions};
use crate::notify::Notifier;
use crate::package::{self, PackageFields};
use crate::paths::Layout;
use crate::prompt::Prompt;
use crate::session::{
    valid_codename, BuildSession, EnvSnapshot, InstanceLock, SessionLog, DEFAULT_DENYLIST,
};
use crate::toolchain::{resolver, ToolchainKind};

/// Name stamped into packaged archives and build banners.
pub const TOOL_NAME: &str = "kforge";

/// Build-metadata file whose freshness proves the build actually ran.
const BUILD_METADATA: &str = "include/generated/compile.h";

#[derive(Default)]
struct RunState {
    target: Option<String>,
    log: Option<SessionLog>,
}

/// Entry point for the `build` mode: run one complete build session.
pub fn run_build(
    config: &BuilderConfig,
    layout: &Layout,
    prompt: &mut dyn Prompt,
    notifier: &Notifier,
    opts: BuildOptions,
) -> Result<(), PipelineError> {
    exec::install_cancel_handler();
    let _lock = InstanceLock::acquire(&layout.lock_path())?;
    let before = EnvSnapshot::capture();
    let executor = Executor::new(opts.debug);

    let mut state = RunState::default();
    let mut guard = TeardownGuard::new(layout, notifier);

    let result = build_stages(
        config, layout, prompt, notifier, &executor, &before, &opts, &mut state,
    );

    if let Some(target) = &state.target {
        guard.set_target(target);
    }
    guard.disarm();

    let reason = match &result {
        Ok(()) => TeardownReason::Success,
        Err(e) if e.is_clean_abort() => TeardownReason::Success,
        Err(PipelineError::Cancelled) => TeardownReason::UserCancel,
        Err(_) => TeardownReason::Fatal,
    };
    teardown(
        reason,
        layout,
        state.target.as_deref(),
        state.log.as_mut().map(|log| (log, &before)),
        notifier,
    );
    result
}

#[allow(clippy::too_many_arguments)]
fn build_stages(
    config: &BuilderConfig,
    layout: &Layout,
    prompt: &mut dyn Prompt,
    notifier: &Notifier,
    executor: &Executor,
    before: &EnvSnapshot,
    opts: &BuildOptions,
    state: &mut RunState,
) -> Result<(), PipelineError> {
    let mut stage = Stage::Init;

    let codename = select_codename(opts.codename.as_deref(), prompt);
    advance(&mut stage, Stage::CodenameSelected);
    state.target = Some(codename.clone());

    let mut session = BuildSession::new(
        codename,
        config.kernel_dir.clone(),
        config.arch,
        config.tag.clone(),
        layout,
    )?;
    layout.create_target_dirs(&session.codename)?;
    advance(&mut stage, Stage::DirsCreated);

    let kind = select_toolchain(config.toolchain.as_deref(), prompt);
    let mut resolved = resolver::resolve(kind, layout, config.arch, prompt, executor)?;
    advance(&mut stage, Stage::ToolchainResolved);

    session.kernel_version = read_kernel_version(config, &session.kernel_dir, executor)?;
    advance(&mut stage, Stage::KernelVersionRead);

    // One-time option rename for clang families on recent kernels.
    resolver::apply_compat_rename(
        &mut resolved.make_options,
        &session.kernel_version,
        resolved.kind.is_clang(),
    );

    // Selected before the log exists so the banner names the defconfig.
    session.defconfig = select_defconfig(
        &config.arch.configs_dir(&session.kernel_dir),
        config.defconfig.as_deref(),
        prompt,
    );

    state.log = Some(SessionLog::create(
        &session.logs_dir,
        &session.kernel_name(),
        session.banner(),
    )?);
    let log = match state.log.as_mut() {
        Some(log) => log,
        None => return Err(PipelineError::IoError(std::io::Error::other("log unavailable"))),
    };
    log.note(&format!(
        "toolchain {} ({})",
        resolved.kind, resolved.version
    ))?;

    let mut env = resolved.build_environment();
    env.verify_path().map_err(PipelineError::Toolchain)?;
    env.vars
        .insert("KBUILD_BUILD_USER".to_string(), config.builder.clone());
    env.vars
        .insert("KBUILD_BUILD_HOST".to_string(), TOOL_NAME.to_string());

    if prompt.confirm("Run a clean before building?", false) {
        for target in ["clean", "mrproper"] {
            let spec = CommandSpec::new(
                config.make.clone(),
                vec![format!("O={}", session.out_dir.display()), target.to_string()],
                "clean",
            )
            .cwd(session.kernel_dir.clone());
            exec::run_with_retry(executor, &spec, &env, log, before, prompt, None)
                .map_err(command_failed)?;
        }
        if session.out_dir.exists() {
            fs::remove_dir_all(&session.out_dir)?;
        }
        advance(&mut stage, Stage::Cleaned);
    }

    let spec = CommandSpec::new(
        config.make.clone(),
        vec![
            format!("O={}", session.out_dir.display()),
            format!("ARCH={}", session.arch),
            session.defconfig.clone(),
        ],
        "configure",
    )
    .cwd(session.kernel_dir.clone());
    exec::run_with_retry(executor, &spec, &env, log, before, prompt, None)
        .map_err(command_failed)?;
    advance(&mut stage, Stage::Configured);

    if prompt.confirm("Adjust the configuration with menuconfig?", false) {
        menu_reconfigure(config, &session, &env, executor, prompt, log, before)?;
        advance(&mut stage, Stage::MenuReconfigured);
    }

    session.cores = select_cores(prompt);

    if !prompt.confirm("Start the build now?", true) {
        return Err(PipelineError::Aborted);
    }
    advance(&mut stage, Stage::BuildConfirmed);

    let kernel_name = session.kernel_name();
    notifier.send_message(&format!(
        "Build started: {kernel_name} ({} on {})",
        session.defconfig, resolved.version
    ));
    log.note("build started")?;
    advance(&mut stage, Stage::Building);

    let mut args = vec![
        format!("-j{}", session.cores),
        format!("O={}", session.out_dir.display()),
        format!("ARCH={}", session.arch),
    ];
    args.extend(resolved.make_options.iter().cloned());
    let spec = CommandSpec::new(config.make.clone(), args, "building")
        .cwd(session.kernel_dir.clone());

    let restart_message = format!("Build restarting: {kernel_name}");
    let mut restart = |log: &mut SessionLog| {
        notifier.send_message(&restart_message);
        let _ = log.reinit();
    };
    exec::run_with_retry(
        executor,
        &spec,
        &env,
        log,
        before,
        prompt,
        Some(&mut restart),
    )
    .map_err(command_failed)?;

    verify_fresh_build(&session)?;
    advance(&mut stage, Stage::BuildVerified);

    let elapsed = session.elapsed_fmt();
    log.note(&format!("build completed in {elapsed}"))?;
    notifier.send_message(&format!("Build finished: {kernel_name} in {elapsed}"));

    let boot_dir = session.arch.boot_dir(&session.out_dir);
    let image = package::find_kernel_image(&boot_dir)
        .ok_or_else(|| PackageError::ImageMissing(boot_dir.clone()))?;
    let fields = package_fields(config, &session);
    let archive = package::assemble(
        &image,
        &layout.template_dir(),
        &session.builds_dir,
        &session.zip_name(),
        &fields,
    )?;
    log.note(&format!("packaged {}", archive.display()))?;
    advance(&mut stage, Stage::Packaged);

    if let Some(signed) = package::sign(
        &archive,
        &layout.root().join("zipsigner.jar"),
        executor,
        Some(&mut *log),
    )? {
        log.note(&format!("signed {}", signed.display()))?;
        advance(&mut stage, Stage::Signed);
    }

    notifier.send_file(&archive, &format!("{kernel_name} | {elapsed}"));
    advance(&mut stage, Stage::Distributed);

    log.capture(before, DEFAULT_DENYLIST)?;
    advance(&mut stage, Stage::Done);
    Ok(())
}

fn advance(stage: &mut Stage, next: Stage) {
    debug_assert!(
        stage.can_advance_to(next),
        "invalid transition {stage:?} -> {next:?}"
    );
    log::debug!("stage {} -> {}", stage.as_str(), next.as_str());
    *stage = next;
}

fn command_failed(failure: crate::exec::CommandFailure) -> PipelineError {
    if failure.cancelled {
        PipelineError::Cancelled
    } else {
        PipelineError::CommandFailed {
            stage: failure.stage.clone(),
            argv: failure.argv_string(),
        }
    }
}

/// Blocking, retry-indefinitely codename selection.
fn select_codename(preset: Option<&str>, prompt: &mut dyn Prompt) -> String {
    if let Some(name) = preset {
        if valid_codename(name) {
            return name.to_string();
        }
        log::warn!("Invalid codename '{name}', falling back to prompt");
    }
    loop {
        let input = prompt.read_line("Target codename");
        if valid_codename(&input) {
            return input;
        }
        log::warn!("Invalid codename '{input}': 3-20 chars, alnum/dash/underscore");
    }
}

fn select_toolchain(preset: Option<&str>, prompt: &mut dyn Prompt) -> ToolchainKind {
    if let Some(name) = preset {
        match name.parse() {
            Ok(kind) => return kind,
            Err(_) => log::warn!("Unknown toolchain '{name}', falling back to prompt"),
        }
    }
    let choices = ToolchainKind::ALL
        .iter()
        .map(|k| k.as_str())
        .collect::<Vec<_>>()
        .join(", ");
    loop {
        let input = prompt.read_line(&format!("Toolchain ({choices})"));
        match input.parse() {
            Ok(kind) => return kind,
            Err(_) => log::warn!("Unknown toolchain '{input}'"),
        }
    }
}

fn select_defconfig(
    configs_dir: &Path,
    default: Option<&str>,
    prompt: &mut dyn Prompt,
) -> String {
    loop {
        let question = match default {
            Some(d) => format!("Defconfig [{d}]"),
            None => "Defconfig".to_string(),
        };
        let input = prompt.read_line(&question);
        let name = if input.is_empty() {
            default.unwrap_or("").to_string()
        } else {
            input
        };
        if !name.is_empty() && configs_dir.join(&name).exists() {
            return name;
        }
        log::warn!("Defconfig '{name}' not found in {}", configs_dir.display());
    }
}

/// Core count bounded by the available cores; empty input takes them all.
fn select_cores(prompt: &mut dyn Prompt) -> usize {
    let max = num_cpus::get();
    loop {
        let input = prompt.read_line(&format!("Core count (1-{max})"));
        if input.is_empty() {
            return max;
        }
        match input.parse::<usize>() {
            Ok(n) if (1..=max).contains(&n) => return n,
            _ => log::warn!("Core count must be between 1 and {max}"),
        }
    }
}

fn read_kernel_version(
    config: &BuilderConfig,
    kernel_dir: &Path,
    executor: &Executor,
) -> Result<String, PipelineError> {
    let spec = CommandSpec::new(
        config.make.clone(),
        vec!["-s".to_string(), "kernelversion".to_string()],
        "kernel-version",
    )
    .cwd(kernel_dir.to_path_buf());
    let output = executor
        .run_capture(&spec, &BuildEnvironment::default())
        .map_err(command_failed)?;
    let version = output.trim().to_string();
    if version.is_empty() {
        return Err(PipelineError::KernelVersionUnknown);
    }
    Ok(version)
}

#[allow(clippy::too_many_arguments)]
fn menu_reconfigure(
    config: &BuilderConfig,
    session: &BuildSession,
    env: &BuildEnvironment,
    executor: &Executor,
    prompt: &mut dyn Prompt,
    log: &mut SessionLog,
    before: &EnvSnapshot,
) -> Result<(), PipelineError> {
    let spec = CommandSpec::new(
        config.make.clone(),
        vec![
            format!("O={}", session.out_dir.display()),
            format!("ARCH={}", session.arch),
            "menuconfig".to_string(),
        ],
        "menuconfig",
    )
    .cwd(session.kernel_dir.clone())
    .interactive();
    exec::run_with_retry(executor, &spec, env, log, before, prompt, None)
        .map_err(command_failed)?;

    if prompt.confirm("Save the reconfigured defconfig into the source tree?", false) {
        let configs_dir = session.arch.configs_dir(&session.kernel_dir);
        let target = configs_dir.join(&session.defconfig);
        if target.exists() {
            let backup = configs_dir.join(format!("{}_bak", session.defconfig));
            fs::rename(&target, backup)?;
        }
        fs::copy(session.out_dir.join(".config"), &target)?;
        log.note(&format!("saved reconfigured {}", session.defconfig))?;
    } else if !prompt.confirm("Continue with the original configuration?", true) {
        // Declining both is a clean abort, not an error.
        return Err(PipelineError::Aborted);
    }
    Ok(())
}

/// Success is a conjunction: the build tool reported success AND the build
/// metadata file is fresh. A stale artifact from an earlier build must not
/// satisfy a falsely-successful status.
///
/// Known edge case: filesystems with coarse timestamp resolution can
/// false-negative on very fast builds; >= keeps that window as small as
/// the filesystem allows.
fn verify_fresh_build(session: &BuildSession) -> Result<(), PipelineError> {
    let metadata_file = session.out_dir.join(BUILD_METADATA);
    let fresh = metadata_file
        .metadata()
        .and_then(|m| m.modified())
        .map(|mtime| mtime >= session.started)
        .unwrap_or(false);
    if !fresh {
        return Err(PipelineError::StaleBuild);
    }
    Ok(())
}

fn package_fields(config: &BuilderConfig, session: &BuildSession) -> PackageFields {
    PackageFields {
        codename: session.codename.clone(),
        tag: session.tag.clone(),
        variant: config.variant.clone(),
        builder: config.builder.clone(),
        kernel_version: session.kernel_version.clone(),
        build_date: Local::now().format("%Y%m%d").to_string(),
        tool_name: TOOL_NAME.to_string(),
        arch: session.arch.as_str().to_string(),
    }
}

/// `zip` mode: package an externally supplied kernel image without a build.
pub fn zip_from_image(
    config: &BuilderConfig,
    layout: &Layout,
    codename: &str,
    image: &Path,
) -> Result<PathBuf, PipelineError> {
    if !valid_codename(codename) {
        return Err(SessionError::InvalidCodename(codename.to_string()).into());
    }
    let fields = PackageFields {
        codename: codename.to_string(),
        tag: config.tag.clone(),
        variant: config.variant.clone(),
        builder: config.builder.clone(),
        kernel_version: "external".to_string(),
        build_date: Local::now().format("%Y%m%d").to_string(),
        tool_name: TOOL_NAME.to_string(),
        arch: config.arch.as_str().to_string(),
    };
    let zip_name = format!(
        "{}-{}_{}.zip",
        config.tag,
        codename,
        Local::now().format("%Y%m%d")
    );
    let dest = layout.builds_dir(codename);
    let archive = package::assemble(image, &layout.template_dir(), &dest, &zip_name, &fields)?;
    Ok(archive)
}

/// `builds` mode: archives produced so far for one codename.
pub fn list_builds(layout: &Layout, codename: &str) -> Result<Vec<String>, PipelineError> {
    let dir = layout.builds_dir(codename);
    let mut names = Vec::new();
    if dir.is_dir() {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
    }
    names.sort();
    Ok(names)
}

/// `latest-tag` mode: newest stable release published upstream.
pub fn latest_kernel_tag() -> Result<String, PipelineError> {
    let value: serde_json::Value = reqwest::blocking::get("https://www.kernel.org/releases.json")
        .and_then(|r| r.error_for_status())
        .and_then(|r| r.json())
        .map_err(|e| PipelineError::Upstream(e.to_string()))?;
    value
        .pointer("/latest_stable/version")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| PipelineError::Upstream("missing latest_stable version".to_string()))
}

/// `patch` mode: apply or revert a patch file against the kernel tree.
pub fn apply_patch(
    config: &BuilderConfig,
    patch_file: &Path,
    revert: bool,
) -> Result<(), PipelineError> {
    let mode = if revert { "-Rsp1" } else { "-sp1" };
    let spec = CommandSpec::new(
        "patch",
        vec![
            mode.to_string(),
            "-i".to_string(),
            patch_file.display().to_string(),
        ],
        "patch",
    )
    .cwd(config.kernel_dir.clone());
    Executor::default()
        .run(&spec, &BuildEnvironment::default(), None)
        .map_err(command_failed)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::ScriptedPrompt;

    #[test]
    fn test_select_codename_reprompts_until_valid() {
        let mut prompt = ScriptedPrompt::new(["ab", "has space", "pixel3"]);
        assert_eq!(select_codename(None, &mut prompt), "pixel3");
    }

    #[test]
    fn test_select_codename_preset_short_circuits() {
        let mut prompt = ScriptedPrompt::default();
        assert_eq!(select_codename(Some("pixel3"), &mut prompt), "pixel3");
    }

    #[test]
    fn test_select_cores_bounds() {
        let max = num_cpus::get();
        let mut prompt = ScriptedPrompt::new(["0", "99999", "1"]);
        assert_eq!(select_cores(&mut prompt), 1);
        let mut prompt = ScriptedPrompt::new([""]);
        assert_eq!(select_cores(&mut prompt), max);
    }

    #[test]
    fn test_select_defconfig_validates_existence() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::write(temp.path().join("pixel3_defconfig"), "").expect("defconfig");
        let mut prompt = ScriptedPrompt::new(["missing_defconfig", "pixel3_defconfig"]);
        assert_eq!(
            select_defconfig(temp.path(), None, &mut prompt),
            "pixel3_defconfig"
        );
    }

    #[test]
    fn test_select_defconfig_empty_takes_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::write(temp.path().join("pixel3_defconfig"), "").expect("defconfig");
        let mut prompt = ScriptedPrompt::new([""]);
        assert_eq!(
            select_defconfig(temp.path(), Some("pixel3_defconfig"), &mut prompt),
            "pixel3_defconfig"
        );
    }

    #[test]
    fn test_verify_fresh_build_missing_metadata_is_stale() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(temp.path().join("arch/arm64/configs")).expect("dirs");
        std::fs::write(temp.path().join("Makefile"), "").expect("makefile");
        let layout = Layout::new(temp.path().to_path_buf());
        let session = BuildSession::new(
            "pixel3".to_string(),
            temp.path().to_path_buf(),
            crate::models::Arch::Arm64,
            "KF".to_string(),
            &layout,
        )
        .expect("session");

        let err = verify_fresh_build(&session).unwrap_err();
        assert!(matches!(err, PipelineError::StaleBuild));
    }

    #[test]
    fn test_verify_fresh_build_accepts_new_metadata() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(temp.path().join("arch/arm64/configs")).expect("dirs");
        std::fs::write(temp.path().join("Makefile"), "").expect("makefile");
        let layout = Layout::new(temp.path().to_path_buf());
        let session = BuildSession::new(
            "pixel3".to_string(),
            temp.path().to_path_buf(),
            crate::models::Arch::Arm64,
            "KF".to_string(),
            &layout,
        )
        .expect("session");

        let metadata = session.out_dir.join(BUILD_METADATA);
        std::fs::create_dir_all(metadata.parent().expect("parent")).expect("dirs");
        std::fs::write(&metadata, "#define UTS_VERSION ...").expect("metadata");
        // Coarse filesystem clocks can stamp the file slightly before
        // `session.started`; pin the mtime after it so the fixture reliably
        // models a post-start write.
        let file = std::fs::File::options()
            .write(true)
            .open(&metadata)
            .expect("open metadata");
        file.set_modified(session.started + std::time::Duration::from_secs(1))
            .expect("set mtime");
        assert!(verify_fresh_build(&session).is_ok());
    }

    #[test]
    fn test_zip_from_image_rejects_bad_codename() {
        let temp = tempfile::tempdir().expect("tempdir");
        let layout = Layout::new(temp.path().to_path_buf());
        let config = BuilderConfig::default();
        let err = zip_from_image(&config, &layout, "x", Path::new("/nonexistent")).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Session(SessionError::InvalidCodename(_))
        ));
    }

    #[test]
    fn test_list_builds_empty_when_absent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let layout = Layout::new(temp.path().to_path_buf());
        assert!(list_builds(&layout, "pixel3").expect("list").is_empty());
    }
}
