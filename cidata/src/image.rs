//! Boot-data image output: an ISO9660 volume mastered by an external
//! tool, or a plain directory for backends that read cidata from a
//! shared folder.

use crate::render::Entry;
use crate::CidataError;
use std::path::{Path, PathBuf};
use std::process::Command;

pub const VOLUME_LABEL: &str = "cidata";

/// Mastering tools in probe order. hdiutil ships with macOS; the rest
/// are interchangeable mkisofs lineage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsoTool {
    Hdiutil,
    Genisoimage,
    Mkisofs,
    Xorriso,
}

impl IsoTool {
    fn binary(self) -> &'static str {
        match self {
            IsoTool::Hdiutil => "hdiutil",
            IsoTool::Genisoimage => "genisoimage",
            IsoTool::Mkisofs => "mkisofs",
            IsoTool::Xorriso => "xorriso",
        }
    }

    fn candidates() -> &'static [IsoTool] {
        if cfg!(target_os = "macos") {
            &[IsoTool::Hdiutil]
        } else {
            &[IsoTool::Genisoimage, IsoTool::Mkisofs, IsoTool::Xorriso]
        }
    }

    fn args(self, staged: &Path, iso: &Path) -> Vec<String> {
        let staged = staged.display().to_string();
        let iso = iso.display().to_string();
        match self {
            IsoTool::Hdiutil => vec![
                "makehybrid".to_string(),
                "-iso".to_string(),
                "-joliet".to_string(),
                "-default-volume-name".to_string(),
                VOLUME_LABEL.to_string(),
                "-o".to_string(),
                iso,
                staged,
            ],
            IsoTool::Genisoimage | IsoTool::Mkisofs => vec![
                "-output".to_string(),
                iso,
                "-volid".to_string(),
                VOLUME_LABEL.to_string(),
                "-joliet".to_string(),
                "-rock".to_string(),
                staged,
            ],
            IsoTool::Xorriso => {
                let mut args = vec!["-as".to_string(), "mkisofs".to_string()];
                args.extend(IsoTool::Genisoimage.args(Path::new(&staged), Path::new(&iso)));
                args
            }
        }
    }
}

fn find_tool() -> Option<IsoTool> {
    IsoTool::candidates()
        .iter()
        .copied()
        .find(|tool| find_in_path(tool.binary()).is_some())
}

fn find_in_path(bin: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(bin))
        .find(|p| p.is_file())
}

/// Master `entries` into an ISO9660 image at `iso_path`. Entries are
/// staged into a temp dir first so the external tool sees a plain tree.
pub fn write_iso(entries: &[Entry], iso_path: &Path) -> Result<(), CidataError> {
    let tool = find_tool().ok_or(CidataError::NoImageTool)?;
    let staging = tempfile::tempdir()?;
    stage(entries, staging.path())?;

    if let Some(parent) = iso_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    // Mastering tools refuse to overwrite in place.
    match std::fs::remove_file(iso_path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    tracing::debug!(tool = tool.binary(), iso = %iso_path.display(), "mastering boot-data image");
    let output = Command::new(tool.binary())
        .args(tool.args(staging.path(), iso_path))
        .output()?;
    if !output.status.success() {
        return Err(CidataError::ImageTool {
            tool: tool.binary().to_string(),
            detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(())
}

/// Write `entries` as a plain directory tree. The target is recreated
/// from scratch and gains a synthetic `ssh_authorized_keys` entry that
/// directory-consuming backends expect.
pub fn write_dir(
    entries: &[Entry],
    ssh_keys: &[String],
    target: &Path,
) -> Result<(), CidataError> {
    match std::fs::remove_dir_all(target) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    std::fs::create_dir_all(target)?;

    let mut ordered: Vec<&Entry> = entries.iter().collect();
    ordered.sort_by_key(|e| e.path.to_lowercase());
    for entry in ordered {
        write_entry(target, &entry.path, &entry.content)?;
    }

    let mut keys = ssh_keys.join("\n");
    keys.push('\n');
    write_entry(target, "ssh_authorized_keys", keys.as_bytes())?;
    Ok(())
}

fn stage(entries: &[Entry], dir: &Path) -> Result<(), CidataError> {
    for entry in entries {
        write_entry(dir, &entry.path, &entry.content)?;
    }
    Ok(())
}

fn write_entry(root: &Path, rel: &str, content: &[u8]) -> Result<(), CidataError> {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content)?;
    Ok(())
}
