//! Packaging and signing: turn a built kernel image plus the templated
//! boot-ramdisk project into a flashable archive.
//!
//! The template project lives in the workspace (`anykernel/`). Its control
//! script is generated from `anykernel.sh.in` by rewriting the templated
//! metadata markers; staged images and the generated script are removed
//! again by [`clean_template`], which is safe to call at any time.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::error::PackageError;
use crate::exec::{CommandSpec, Executor};
use crate::models::BuildEnvironment;
use crate::session::SessionLog;

/// Control script template and its generated counterpart.
const CONTROL_TEMPLATE: &str = "anykernel.sh.in";
const CONTROL_SCRIPT: &str = "anykernel.sh";

/// Subfolder for staged device-tree companions.
const DTB_SUBDIR: &str = "dtbs";

/// Image names recognized in the build output, in preference order.
const IMAGE_CANDIDATES: &[&str] = &["Image.gz-dtb", "Image.gz", "Image", "zImage"];

/// The eight templated metadata fields of the control script.
#[derive(Debug, Clone)]
pub struct PackageFields {
    pub codename: String,
    pub tag: String,
    pub variant: String,
    pub builder: String,
    pub kernel_version: String,
    pub build_date: String,
    pub tool_name: String,
    pub arch: String,
}

impl PackageFields {
    fn markers(&self) -> [(&'static str, &str); 8] {
        [
            ("@CODENAME@", &self.codename),
            ("@TAG@", &self.tag),
            ("@VARIANT@", &self.variant),
            ("@BUILDER@", &self.builder),
            ("@KERNEL_VERSION@", &self.kernel_version),
            ("@BUILD_DATE@", &self.build_date),
            ("@TOOL_NAME@", &self.tool_name),
            ("@ARCH@", &self.arch),
        ]
    }
}

/// Locate the kernel image in the build tool's boot directory.
pub fn find_kernel_image(boot_dir: &Path) -> Option<PathBuf> {
    IMAGE_CANDIDATES
        .iter()
        .map(|name| boot_dir.join(name))
        .find(|path| path.exists())
}

/// Populate the template project with a kernel image, rewrite its control
/// script, compress it into `dest_dir/<zip_name>`, and restore the
/// template to its pristine state.
///
/// Works for externally supplied images too: no build output other than
/// the image itself is required.
pub fn assemble(
    image: &Path,
    template: &Path,
    dest_dir: &Path,
    zip_name: &str,
    fields: &PackageFields,
) -> Result<PathBuf, PackageError> {
    if !template.is_dir() {
        return Err(PackageError::TemplateMissing(template.to_path_buf()));
    }
    if !image.exists() {
        return Err(PackageError::ImageMissing(image.to_path_buf()));
    }

    // Start from a known-clean template even if a previous run crashed.
    clean_template(template)?;

    stage_image(image, template)?;
    rewrite_control_script(template, fields)?;

    fs::create_dir_all(dest_dir)?;
    let staging_zip = template.join(zip_name);
    write_zip(template, &staging_zip)?;

    let final_path = dest_dir.join(zip_name);
    move_file(&staging_zip, &final_path)?;

    clean_template(template)?;
    Ok(final_path)
}

fn stage_image(image: &Path, template: &Path) -> Result<(), PackageError> {
    let name = image
        .file_name()
        .ok_or_else(|| PackageError::ImageMissing(image.to_path_buf()))?;
    fs::copy(image, template.join(name))?;

    // Companion device-tree blobs next to the image go into their own
    // subfolder.
    if let Some(parent) = image.parent() {
        let mut dtbs = Vec::new();
        for entry in fs::read_dir(parent)? {
            let entry = entry?;
            let path = entry.path();
            let ext = path.extension().and_then(|e| e.to_str());
            if matches!(ext, Some("dtb") | Some("dtbo")) {
                dtbs.push(path);
            }
        }
        if !dtbs.is_empty() {
            let dtb_dir = template.join(DTB_SUBDIR);
            fs::create_dir_all(&dtb_dir)?;
            for dtb in dtbs {
                if let Some(name) = dtb.file_name() {
                    fs::copy(&dtb, dtb_dir.join(name))?;
                }
            }
        }
    }
    Ok(())
}

/// Generate the control script from its template, substituting the eight
/// metadata markers. A marker absent from the template simply leaves that
/// field out; this is not an error.
fn rewrite_control_script(template: &Path, fields: &PackageFields) -> Result<(), PackageError> {
    let source = template.join(CONTROL_TEMPLATE);
    if !source.exists() {
        return Ok(());
    }
    let mut content = fs::read_to_string(&source)?;
    for (marker, value) in fields.markers() {
        content = content.replace(marker, value);
    }
    fs::write(template.join(CONTROL_SCRIPT), content)?;
    Ok(())
}

/// Compress the populated template, excluding version-control metadata,
/// the script template, placeholder files, and any archives.
fn write_zip(template: &Path, zip_path: &Path) -> Result<(), PackageError> {
    let file = File::create(zip_path)?;
    let mut writer = ZipWriter::new(file);
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(0o755);

    for entry in WalkDir::new(template).min_depth(1) {
        let entry = entry.map_err(|e| {
            PackageError::IoError(std::io::Error::other(e.to_string()))
        })?;
        let path = entry.path();
        let rel = path
            .strip_prefix(template)
            .map_err(|e| PackageError::IoError(std::io::Error::other(e.to_string())))?;
        let rel_str = rel.to_string_lossy().replace('\\', "/");
        if excluded_from_zip(&rel_str) {
            continue;
        }
        if entry.file_type().is_dir() {
            writer.add_directory(format!("{rel_str}/"), options)?;
        } else if entry.file_type().is_file() {
            writer.start_file(rel_str, options)?;
            let mut source = File::open(path)?;
            let mut buffer = Vec::new();
            source.read_to_end(&mut buffer)?;
            writer.write_all(&buffer)?;
        }
    }
    writer.finish()?;
    Ok(())
}

fn excluded_from_zip(rel: &str) -> bool {
    rel.starts_with(".git")
        || rel.ends_with(".in")
        || rel.ends_with(".zip")
        || rel.ends_with("placeholder")
}

/// Remove staged build products from the template project: the staged
/// image, device-tree subfolder, generated control script, and any
/// leftover archives. Idempotent; invoking it on an already-clean
/// template performs no destructive action.
pub fn clean_template(template: &Path) -> Result<(), PackageError> {
    if !template.is_dir() {
        return Ok(());
    }
    for name in IMAGE_CANDIDATES {
        let staged = template.join(name);
        if staged.exists() {
            fs::remove_file(staged)?;
        }
    }
    let generated = template.join(CONTROL_SCRIPT);
    if generated.exists() && template.join(CONTROL_TEMPLATE).exists() {
        fs::remove_file(generated)?;
    }
    let dtb_dir = template.join(DTB_SUBDIR);
    if dtb_dir.is_dir() {
        fs::remove_dir_all(dtb_dir)?;
    }
    for entry in fs::read_dir(template)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) == Some("zip") {
            fs::remove_file(path)?;
        }
    }
    Ok(())
}

/// Produce a signed sibling archive next to the unsigned one.
///
/// Best-effort: when the signing tool or a Java runtime is unavailable the
/// pipeline continues with a warning and only the unsigned archive.
pub fn sign(
    zip_path: &Path,
    signer_jar: &Path,
    executor: &Executor,
    mut log: Option<&mut SessionLog>,
) -> Result<Option<PathBuf>, PackageError> {
    let Ok(java) = which::which("java") else {
        log::warn!("Signing skipped: no Java runtime on this host");
        return Ok(None);
    };
    if !signer_jar.exists() {
        log::warn!(
            "Signing skipped: signer not found at {}",
            signer_jar.display()
        );
        return Ok(None);
    }
    let signed = zip_path.with_extension("signed.zip");
    let spec = CommandSpec::new(
        java.display().to_string(),
        vec![
            "-jar".to_string(),
            signer_jar.display().to_string(),
            zip_path.display().to_string(),
            signed.display().to_string(),
        ],
        "signing",
    );
    if let Some(log) = log.as_deref_mut() {
        let _ = log.transcript_header(&spec.argv_string());
    }
    match executor.run(&spec, &BuildEnvironment::default(), log) {
        Ok(_) => Ok(Some(signed)),
        Err(failure) => {
            log::warn!("{failure}; keeping unsigned archive");
            Ok(None)
        }
    }
}

fn move_file(from: &Path, to: &Path) -> Result<(), PackageError> {
    if fs::rename(from, to).is_err() {
        // Cross-device fallback.
        fs::copy(from, to)?;
        fs::remove_file(from)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn make_template(dir: &Path) {
        fs::create_dir_all(dir).expect("template dir");
        fs::write(
            dir.join(CONTROL_TEMPLATE),
            "kernel.string=@TAG@ for @CODENAME@ by @BUILDER@\n\
             kernel.version=@KERNEL_VERSION@\n\
             build.date=@BUILD_DATE@\n\
             tool=@TOOL_NAME@ arch=@ARCH@ variant=@VARIANT@\n",
        )
        .expect("control template");
        fs::write(dir.join("placeholder"), "").expect("placeholder");
    }

    fn fields() -> PackageFields {
        PackageFields {
            codename: "pixel3".to_string(),
            tag: "KF".to_string(),
            variant: "stable".to_string(),
            builder: "jane".to_string(),
            kernel_version: "4.14.180".to_string(),
            build_date: "20260826".to_string(),
            tool_name: "kforge".to_string(),
            arch: "arm64".to_string(),
        }
    }

    #[test]
    fn test_assemble_produces_archive_and_cleans_up() {
        let temp = tempdir().expect("tempdir");
        let template = temp.path().join("anykernel");
        make_template(&template);
        let image = temp.path().join("Image.gz-dtb");
        fs::write(&image, b"kernel").expect("image");
        let dest = temp.path().join("builds");

        let zip_path = assemble(&image, &template, &dest, "KF-pixel3.zip", &fields())
            .expect("assemble");

        assert_eq!(zip_path, dest.join("KF-pixel3.zip"));
        assert!(zip_path.exists());
        // Template restored to pristine state.
        assert!(!template.join("Image.gz-dtb").exists());
        assert!(!template.join(CONTROL_SCRIPT).exists());
        assert!(template.join(CONTROL_TEMPLATE).exists());
    }

    #[test]
    fn test_archive_contents_and_exclusions() {
        let temp = tempdir().expect("tempdir");
        let template = temp.path().join("anykernel");
        make_template(&template);
        let image = temp.path().join("Image.gz-dtb");
        fs::write(&image, b"kernel").expect("image");
        let dest = temp.path().join("builds");

        let zip_path = assemble(&image, &template, &dest, "out.zip", &fields())
            .expect("assemble");

        let file = File::open(zip_path).expect("open zip");
        let mut archive = zip::ZipArchive::new(file).expect("read zip");
        let names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).expect("entry").name().to_string())
            .collect();
        assert!(names.contains(&"anykernel.sh".to_string()));
        assert!(names.contains(&"Image.gz-dtb".to_string()));
        assert!(!names.iter().any(|n| n.ends_with(".in")));
        assert!(!names.iter().any(|n| n.ends_with("placeholder")));

        let mut script = String::new();
        archive
            .by_name("anykernel.sh")
            .expect("script")
            .read_to_string(&mut script)
            .expect("read script");
        assert!(script.contains("KF for pixel3 by jane"));
        assert!(script.contains("kernel.version=4.14.180"));
        assert!(!script.contains('@'));
    }

    #[test]
    fn test_missing_marker_leaves_field_unchanged() {
        let temp = tempdir().expect("tempdir");
        let template = temp.path().join("anykernel");
        fs::create_dir_all(&template).expect("dir");
        // Template without the builder marker.
        fs::write(template.join(CONTROL_TEMPLATE), "kernel.string=@TAG@\n").expect("tpl");
        let image = temp.path().join("Image");
        fs::write(&image, b"kernel").expect("image");
        let dest = temp.path().join("builds");

        assemble(&image, &template, &dest, "out.zip", &fields()).expect("assemble");
        // No error; the absent markers are simply not substituted.
    }

    #[test]
    fn test_clean_template_is_idempotent() {
        let temp = tempdir().expect("tempdir");
        let template = temp.path().join("anykernel");
        make_template(&template);

        clean_template(&template).expect("first clean");
        clean_template(&template).expect("second clean");
        assert!(template.join(CONTROL_TEMPLATE).exists());
        assert!(template.join("placeholder").exists());
    }

    #[test]
    fn test_clean_template_tolerates_missing_dir() {
        let temp = tempdir().expect("tempdir");
        clean_template(&temp.path().join("nope")).expect("clean missing");
    }

    #[test]
    fn test_find_kernel_image_preference_order() {
        let temp = tempdir().expect("tempdir");
        fs::write(temp.path().join("Image"), b"x").expect("w");
        fs::write(temp.path().join("Image.gz"), b"x").expect("w");
        let found = find_kernel_image(temp.path()).expect("found");
        assert!(found.ends_with("Image.gz"));
    }

    #[test]
    fn test_sign_is_best_effort_when_signer_missing() {
        let temp = tempdir().expect("tempdir");
        let zip_path = temp.path().join("out.zip");
        fs::write(&zip_path, b"zip").expect("zip");
        let signed = sign(
            &zip_path,
            &temp.path().join("missing.jar"),
            &Executor::default(),
            None,
        )
        .expect("sign");
        assert!(signed.is_none());
    }

    #[test]
    fn test_sign_failure_keeps_unsigned_and_logs_invocation() {
        // A corrupt signer fails the tool; the pipeline keeps the unsigned
        // archive and the invocation is visible in the session log.
        let temp = tempdir().expect("tempdir");
        let zip_path = temp.path().join("out.zip");
        fs::write(&zip_path, b"zip").expect("zip");
        let jar = temp.path().join("signer.jar");
        fs::write(&jar, b"not a jar").expect("jar");

        if which::which("java").is_err() {
            // No runtime on this host: the skip branch applies instead.
            let signed = sign(&zip_path, &jar, &Executor::default(), None).expect("sign");
            assert!(signed.is_none());
            return;
        }

        let mut log = SessionLog::create(temp.path(), "KF-test-0", "== test ==".to_string())
            .expect("log");
        let signed =
            sign(&zip_path, &jar, &Executor::default(), Some(&mut log)).expect("sign");
        assert!(signed.is_none());
        let content = fs::read_to_string(log.path()).expect("read");
        assert!(content.contains("-jar"));
    }

    #[test]
    fn test_assemble_missing_template_errors() {
        let temp = tempdir().expect("tempdir");
        let image = temp.path().join("Image");
        fs::write(&image, b"kernel").expect("image");
        let err = assemble(
            &image,
            &temp.path().join("nope"),
            temp.path(),
            "out.zip",
            &fields(),
        )
        .unwrap_err();
        assert!(matches!(err, PackageError::TemplateMissing(_)));
    }
}
