//! Toolchain acquisition and updating.
//!
//! Community bundles arrive as shallow git clones of one branch. The two
//! vendor bundles are archive-distributed: the latest published tag is
//! looked up via the remote refs listing, the matching archive downloaded
//! and extracted, and the tag persisted to a local marker file.

use flate2::read::GzDecoder;
use git2::build::{CheckoutBuilder, RepoBuilder};
use git2::{FetchOptions, Repository};
use std::fs;
use std::path::Path;

use super::{AcquireSource, Component};
use crate::error::ToolchainError;
use crate::paths::Layout;
use crate::prompt::Prompt;

/// Marker file recording the installed vendor-archive tag.
pub const TAG_MARKER: &str = ".tag";

/// Make sure a component is present locally, offering to acquire it when
/// missing. Declining the offer is a fatal precondition error.
pub fn ensure_component(
    component: &Component,
    layout: &Layout,
    prompt: &mut dyn Prompt,
) -> Result<(), ToolchainError> {
    let dir = component.install_dir(layout);
    if dir.join("bin").is_dir() {
        return Ok(());
    }
    let question = format!(
        "Toolchain '{}' is not installed at {}. Acquire it now?",
        component.dir_name,
        dir.display()
    );
    if !prompt.confirm(&question, true) {
        return Err(ToolchainError::NotInstalled(dir));
    }
    install_component(component, layout)
}

/// Acquire one component unconditionally.
pub fn install_component(component: &Component, layout: &Layout) -> Result<(), ToolchainError> {
    let dir = component.install_dir(layout);
    match &component.source {
        AcquireSource::GitBranch { url, branch } => {
            log::info!("Cloning {url} ({branch}) into {}", dir.display());
            clone_branch(url, branch, &dir)?;
        }
        AcquireSource::AospArchive { repo_url } => {
            let tag = latest_remote_tag(repo_url)?;
            log::info!("Installing {} tag {tag}", component.dir_name);
            install_archive_tag(repo_url, &tag, &dir)?;
        }
    }
    Ok(())
}

/// Shallow clone of a single branch.
pub fn clone_branch(url: &str, branch: &str, dest: &Path) -> Result<(), ToolchainError> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut fetch = FetchOptions::new();
    fetch.depth(1);
    RepoBuilder::new()
        .branch(branch)
        .fetch_options(fetch)
        .clone(url, dest)?;
    Ok(())
}

/// Look up the latest published tag via the remote refs listing.
///
/// The gitiles endpoint returns a JSON object keyed by tag name, prefixed
/// with an XSSI guard line that must be stripped before parsing.
pub fn latest_remote_tag(repo_url: &str) -> Result<String, ToolchainError> {
    let url = format!("{repo_url}/+refs/tags?format=JSON");
    let body = reqwest::blocking::get(&url)?.text()?;
    parse_latest_tag(&body)
}

pub(crate) fn parse_latest_tag(body: &str) -> Result<String, ToolchainError> {
    let json = body.strip_prefix(")]}'").unwrap_or(body).trim_start();
    let value: serde_json::Value = serde_json::from_str(json)
        .map_err(|e| ToolchainError::AcquireFailed(format!("bad refs listing: {e}")))?;
    let tags = value
        .as_object()
        .ok_or_else(|| ToolchainError::AcquireFailed("refs listing is not an object".into()))?;
    // Keys are held sorted; the greatest tag name is the newest release.
    tags.keys()
        .last()
        .cloned()
        .ok_or_else(|| ToolchainError::AcquireFailed("no tags published".into()))
}

/// Download the archive for one tag, extract it, and persist the tag
/// string to the marker file.
pub fn install_archive_tag(repo_url: &str, tag: &str, dest: &Path) -> Result<(), ToolchainError> {
    let url = format!("{repo_url}/+archive/refs/tags/{tag}.tar.gz");
    let response = reqwest::blocking::get(&url)?;
    if !response.status().is_success() {
        return Err(ToolchainError::AcquireFailed(format!(
            "archive download returned {} for {url}",
            response.status()
        )));
    }
    fs::create_dir_all(dest)?;
    let decoder = GzDecoder::new(response);
    let mut archive = tar::Archive::new(decoder);
    archive
        .unpack(dest)
        .map_err(|e| ToolchainError::AcquireFailed(format!("extract failed: {e}")))?;
    fs::write(dest.join(TAG_MARKER), tag)?;
    Ok(())
}

/// Bring an already-cloned component up to date (fetch + fast-forward);
/// re-download a vendor archive when a newer tag has been published.
pub fn update_component(component: &Component, layout: &Layout) -> Result<(), ToolchainError> {
    let dir = component.install_dir(layout);
    if !dir.exists() {
        return Ok(());
    }
    match &component.source {
        AcquireSource::GitBranch { branch, .. } => {
            log::info!("Updating {}", component.dir_name);
            fast_forward(&dir, branch)
        }
        AcquireSource::AospArchive { repo_url } => {
            let latest = latest_remote_tag(repo_url)?;
            let installed = fs::read_to_string(dir.join(TAG_MARKER)).unwrap_or_default();
            if installed.trim() == latest {
                log::info!("{} already at {latest}", component.dir_name);
                return Ok(());
            }
            log::info!("Updating {} {} -> {latest}", component.dir_name, installed.trim());
            fs::remove_dir_all(&dir)?;
            install_archive_tag(repo_url, &latest, &dir)
        }
    }
}

/// Fetch the branch and fast-forward the local checkout to it.
pub fn fast_forward(dir: &Path, branch: &str) -> Result<(), ToolchainError> {
    let repo = Repository::open(dir)?;
    repo.find_remote("origin")?.fetch(&[branch], None, None)?;
    let fetch_head = repo.find_reference("FETCH_HEAD")?;
    let commit = repo.reference_to_annotated_commit(&fetch_head)?;
    let (analysis, _) = repo.merge_analysis(&[&commit])?;
    if analysis.is_up_to_date() {
        return Ok(());
    }
    if !analysis.is_fast_forward() {
        return Err(ToolchainError::AcquireFailed(format!(
            "{} has diverged from upstream; refusing non-fast-forward update",
            dir.display()
        )));
    }
    let refname = format!("refs/heads/{branch}");
    let mut reference = repo.find_reference(&refname)?;
    reference.set_target(commit.id(), "fast-forward")?;
    repo.set_head(&refname)?;
    repo.checkout_head(Some(CheckoutBuilder::default().force()))?;
    Ok(())
}

/// Update the tool's own checkout (when running from a git worktree) and
/// every installed toolchain.
pub fn update_all(layout: &Layout) -> Result<(), ToolchainError> {
    if Repository::open(layout.root()).is_ok() {
        log::info!("Updating kforge checkout");
        // Default branch name mirrors the hosting convention.
        if let Err(e) = fast_forward(layout.root(), "main") {
            log::warn!("Self-update skipped: {e}");
        }
    }
    for kind in super::ToolchainKind::ALL {
        for component in kind.components() {
            update_component(&component, layout)?;
        }
    }
    Ok(())
}
