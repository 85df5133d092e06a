//! Boot-data assembly: rendered templates plus the non-template entries
//! the guest consumes directly.

use crate::args::TemplateArgs;
use crate::render::{Entry, TemplateSource, render};
use crate::CidataError;
use flate2::read::GzDecoder;
use skiff_config::{Provision, ProvisionMode};
use std::io::Read;
use std::path::{Path, PathBuf};

/// Name of the guest agent entry inside the image.
pub const GUEST_AGENT_NAME: &str = "skiff-guestagent";
/// Kept short for ISO9660 level-2 name limits.
pub const CONTAINERD_ARCHIVE_NAME: &str = "nerdctl-full.tgz";

#[derive(Debug, Clone, Default)]
pub struct AssembleParams {
    /// Host path of the guest agent binary; a `.gz` suffix means the
    /// stream is decompressed on ingestion.
    pub guest_agent: Option<PathBuf>,
    /// Container runtime bundle, added only when containerd is enabled.
    pub nerdctl_archive: Option<PathBuf>,
}

/// Produce the complete entry list for one boot-data generation.
pub fn generate(
    source: &TemplateSource,
    args: &TemplateArgs,
    provision: &[Provision],
    params: &AssembleParams,
) -> Result<Vec<Entry>, CidataError> {
    let mut entries = render(source, args)?;
    entries.extend(provision_entries(provision));

    if let Some(agent) = &params.guest_agent {
        entries.push(Entry {
            path: GUEST_AGENT_NAME.to_string(),
            content: read_maybe_gz(agent)?,
        });
    }
    if args.containerd {
        if let Some(archive) = &params.nerdctl_archive {
            entries.push(Entry {
                path: CONTAINERD_ARCHIVE_NAME.to_string(),
                content: std::fs::read(archive)?,
            });
        }
    }
    Ok(entries)
}

/// One entry per system/user/dependency/data provision, indexed per mode
/// in config order. boot entries become inline boot commands and ansible
/// entries are consumed by an external playbook runner, so neither lands
/// here.
fn provision_entries(provision: &[Provision]) -> Vec<Entry> {
    let mut counters = [0usize; 4];
    let mut entries = Vec::new();
    for p in provision {
        let (slot, content) = match p.mode {
            ProvisionMode::System => (0, p.script.clone()),
            ProvisionMode::User => (1, p.script.clone()),
            ProvisionMode::Dependency => (2, p.script.clone()),
            ProvisionMode::Data => (3, p.content.clone()),
            ProvisionMode::Boot | ProvisionMode::Ansible => continue,
        };
        let index = counters[slot];
        counters[slot] += 1;
        entries.push(Entry {
            path: format!("provision.{}/{:08}", p.mode, index),
            content: content.unwrap_or_default().into_bytes(),
        });
    }
    entries
}

fn read_maybe_gz(path: &Path) -> Result<Vec<u8>, CidataError> {
    let raw = std::fs::read(path)?;
    if path.extension().is_some_and(|ext| ext == "gz") {
        let mut out = Vec::new();
        GzDecoder::new(raw.as_slice()).read_to_end(&mut out)?;
        Ok(out)
    } else {
        Ok(raw)
    }
}
