//! Clean-abort behavior: declining the final confirmation ends the session
//! without an error, prunes empty target directories, and still records
//! the settings block into the attempt log.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use kforge::config::BuilderConfig;
use kforge::models::BuildOptions;
use kforge::notify::Notifier;
use kforge::paths::Layout;
use kforge::pipeline;
use kforge::prompt::ScriptedPrompt;

fn write_executable(path: &Path, content: &str) {
    fs::write(path, content).expect("script");
    let mut perms = fs::metadata(path).expect("meta").permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms).expect("chmod");
}

fn make_kernel_tree(root: &Path) {
    fs::create_dir_all(root.join("arch/arm64/configs")).expect("configs dir");
    fs::write(root.join("arch/arm64/configs/stub_defconfig"), "").expect("defconfig");
    fs::write(root.join("Makefile"), "VERSION = 4\n").expect("Makefile");
}

fn stub_build_tool(dir: &Path) -> PathBuf {
    let script = dir.join("stub-make");
    write_executable(
        &script,
        "#!/bin/sh\n[ \"$1\" = \"-s\" ] && echo 4.14.180\nexit 0\n",
    );
    script
}

#[test]
fn test_declined_build_confirmation_is_clean_abort() {
    let temp = tempfile::tempdir().expect("tempdir");
    let workspace = temp.path().join("work");
    fs::create_dir_all(&workspace).expect("workspace");
    let kernel = temp.path().join("kernel");
    make_kernel_tree(&kernel);

    let layout = Layout::new(workspace);
    let make = stub_build_tool(temp.path());
    let mut config = BuilderConfig::default();
    config.kernel_dir = kernel;
    config.make = make.display().to_string();
    config.toolchain = Some("host".to_string());
    config.defconfig = Some("stub_defconfig".to_string());
    let notifier = Notifier::disabled();

    // defconfig default; clean? no; menuconfig? no; one core; build? NO.
    let mut prompt = ScriptedPrompt::new(["", "n", "n", "1", "n"]);
    let err = pipeline::run_build(
        &config,
        &layout,
        &mut prompt,
        &notifier,
        BuildOptions {
            codename: Some("pixel3".to_string()),
            debug: false,
        },
    )
    .unwrap_err();

    assert!(err.is_clean_abort());
    assert_eq!(err.exit_code().as_i32(), 0);

    // Empty target dirs are pruned; the log dir holds the attempt log.
    assert!(!layout.builds_dir("pixel3").exists());
    assert!(!layout.out_dir("pixel3").exists());
    let logs: Vec<_> = fs::read_dir(layout.logs_dir("pixel3"))
        .expect("logs dir")
        .flatten()
        .collect();
    assert_eq!(logs.len(), 1);

    // Teardown captured the settings block before any cleanup.
    let content = fs::read_to_string(logs[0].path()).expect("log content");
    assert_eq!(content.matches("### SETTINGS ###").count(), 1);
}
