//! Template rendering and cloud-config synthesis.
//!
//! Script-like files use a fixed `{{key}}` placeholder grammar; the
//! cloud-config document is assembled structurally so section presence
//! rules hold exactly instead of depending on template whitespace.

use crate::args::TemplateArgs;
use crate::CidataError;
use serde::Serialize;
use skiff_config::MountType;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// One boot-data entry, ready for the image writer.
#[derive(Debug, Clone)]
pub struct Entry {
    pub path: String,
    pub content: Vec<u8>,
}

/// The machine-config variant optionally piped through the external
/// transcoder.
pub const MACHINE_CONFIG_NAME: &str = "skiff.env";
const TRANSCODER_BIN: &str = "cfgconv";

const EMBEDDED: &[(&str, &str)] = &[
    ("boot.sh", include_str!("../templates/boot.sh")),
    (
        "boot/05-wait-for-network.sh",
        include_str!("../templates/boot/05-wait-for-network.sh"),
    ),
    (
        "boot/10-install-data-files.sh",
        include_str!("../templates/boot/10-install-data-files.sh"),
    ),
    ("meta-data", include_str!("../templates/meta-data")),
    (MACHINE_CONFIG_NAME, include_str!("../templates/skiff.env")),
];

/// Ordered enumeration of (relative path, template text).
#[derive(Debug, Clone)]
pub enum TemplateSource {
    /// Compiled-in template table, in lexicographic path order.
    Embedded,
    /// On-disk template tree, walked in lexicographic order. Bundles must
    /// be pure: any non-regular file fails the whole walk.
    Dir(PathBuf),
}

impl TemplateSource {
    pub fn entries(&self) -> Result<Vec<(String, String)>, CidataError> {
        match self {
            TemplateSource::Embedded => Ok(EMBEDDED
                .iter()
                .map(|(path, text)| (path.to_string(), text.to_string()))
                .collect()),
            TemplateSource::Dir(root) => {
                let mut out = Vec::new();
                walk_dir(root, root, &mut out)?;
                out.sort_by(|a, b| a.0.cmp(&b.0));
                Ok(out)
            }
        }
    }
}

fn walk_dir(
    root: &Path,
    dir: &Path,
    out: &mut Vec<(String, String)>,
) -> Result<(), CidataError> {
    let mut children: Vec<PathBuf> = std::fs::read_dir(dir)?
        .map(|e| e.map(|e| e.path()))
        .collect::<Result<_, _>>()?;
    children.sort();
    for child in children {
        let meta = std::fs::symlink_metadata(&child)?;
        if meta.is_dir() {
            walk_dir(root, &child, out)?;
        } else if meta.is_file() {
            let rel = child
                .strip_prefix(root)
                .map_err(|_| CidataError::UnexpectedFileType(child.clone()))?;
            out.push((
                rel.to_string_lossy().into_owned(),
                std::fs::read_to_string(&child)?,
            ));
        } else {
            // Symlinks and devices have no business in a template bundle.
            return Err(CidataError::UnexpectedFileType(child));
        }
    }
    Ok(())
}

/// Render the whole boot-data file set: the structural cloud-config plus
/// every template, with the machine-config variant run through the
/// transcoder when one is installed.
pub fn render(source: &TemplateSource, args: &TemplateArgs) -> Result<Vec<Entry>, CidataError> {
    args.validate()?;
    let map = placeholder_map(args);

    let mut entries = vec![Entry {
        path: "user-data".to_string(),
        content: cloud_config(args, true)?.into_bytes(),
    }];
    for (path, text) in source.entries()? {
        let rendered = render_text(&path, &text, &map)?;
        let content = if path == MACHINE_CONFIG_NAME {
            transcode(&path, rendered.into_bytes())?
        } else {
            rendered.into_bytes()
        };
        entries.push(Entry { path, content });
    }
    Ok(entries)
}

/// Cloud-config alone, for previewing: no mounts, no DNS, no transcoder.
pub fn render_cloud_config_only(args: &TemplateArgs) -> Result<String, CidataError> {
    args.validate()?;
    cloud_config(args, false)
}

fn render_text(
    file: &str,
    text: &str,
    map: &BTreeMap<&'static str, String>,
) -> Result<String, CidataError> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find("}}").ok_or_else(|| CidataError::TemplateExecution {
            file: file.to_string(),
            reason: "unterminated placeholder".to_string(),
        })?;
        let key = after[..end].trim();
        let value = map.get(key).ok_or_else(|| CidataError::TemplateExecution {
            file: file.to_string(),
            reason: format!("undefined placeholder {:?}", key),
        })?;
        out.push_str(value);
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

fn placeholder_map(args: &TemplateArgs) -> BTreeMap<&'static str, String> {
    let mut map = BTreeMap::new();
    map.insert("name", args.name.clone());
    map.insert("hostname", args.hostname.clone());
    map.insert("instance_id", args.instance_id.clone());
    map.insert("user", args.user.name.clone());
    map.insert("uid", args.user.uid.to_string());
    map.insert("home", args.user.home.clone());
    map.insert("shell", args.user.shell.clone());
    map.insert("gateway", args.gateway.to_string());
    map.insert(
        "dns",
        args.dns
            .iter()
            .map(|a| a.to_string())
            .collect::<Vec<_>>()
            .join(","),
    );
    map.insert("vsock_port", args.vsock_port.to_string());
    map.insert("mount_type", mount_type_str(args.mount_type).to_string());
    map.insert("containerd", args.containerd.to_string());
    map.insert(
        "skip_default_dependency_resolution",
        args.skip_default_dependency_resolution.to_string(),
    );
    map.insert("data_file_manifest", data_file_manifest(args));
    map
}

fn mount_type_str(mount_type: MountType) -> &'static str {
    match mount_type {
        MountType::ReverseSshfs => "reverse-sshfs",
        MountType::NineP => "9p",
        MountType::Virtiofs => "virtiofs",
    }
}

/// Tab-separated, one line per data file: index, path, owner,
/// permissions, overwrite. Indexes match the provision.data entry names.
fn data_file_manifest(args: &TemplateArgs) -> String {
    args.data_files
        .iter()
        .enumerate()
        .map(|(i, f)| {
            format!(
                "{:08}\t{}\t{}\t{}\t{}",
                i, f.path, f.owner, f.permissions, f.overwrite
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Serialize)]
struct CloudUser<'a> {
    name: &'a str,
    uid: u32,
    #[serde(skip_serializing_if = "str::is_empty")]
    gecos: &'a str,
    homedir: &'a str,
    shell: &'a str,
    sudo: &'static str,
    lock_passwd: bool,
    ssh_authorized_keys: &'a [String],
}

#[derive(Serialize)]
struct Growpart {
    mode: &'static str,
    devices: Vec<&'static str>,
}

#[derive(Serialize)]
struct ResolvConf {
    nameservers: Vec<String>,
}

#[derive(Serialize)]
struct CaCertsSection {
    remove_defaults: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    trusted: Vec<String>,
}

#[derive(Serialize)]
struct WriteFile {
    path: &'static str,
    content: String,
    permissions: &'static str,
}

#[derive(Serialize)]
struct CloudConfig<'a> {
    hostname: &'a str,
    users: Vec<CloudUser<'a>>,
    ssh_pwauth: bool,
    growpart: Growpart,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    bootcmd: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    write_files: Vec<WriteFile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mounts: Option<Vec<[String; 4]>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    manage_resolv_conf: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    resolv_conf: Option<ResolvConf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ca_certs: Option<CaCertsSection>,
}

fn cloud_config(args: &TemplateArgs, boot: bool) -> Result<String, CidataError> {
    // reverse-sshfs mounts happen at runtime over ssh, not at boot, so
    // the rendered document must not carry a mounts key at all.
    let mounts = if boot && args.mount_type != MountType::ReverseSshfs && !args.mounts.is_empty() {
        Some(
            args.mounts
                .iter()
                .map(|m| {
                    [
                        m.tag.clone(),
                        m.mount_point.clone(),
                        m.fs_type.clone(),
                        if m.options.is_empty() {
                            "defaults".to_string()
                        } else {
                            m.options.join(",")
                        },
                    ]
                })
                .collect(),
        )
    } else {
        None
    };

    let (manage_resolv_conf, resolv_conf) = if boot && !args.dns.is_empty() {
        (
            Some(true),
            Some(ResolvConf {
                nameservers: args.dns.iter().map(|a| a.to_string()).collect(),
            }),
        )
    } else {
        (None, None)
    };

    let ca_certs = if args.ca.remove_defaults || !args.ca.certs.is_empty() {
        Some(CaCertsSection {
            remove_defaults: args.ca.remove_defaults,
            trusted: args.ca.certs.iter().map(|lines| lines.join("\n")).collect(),
        })
    } else {
        None
    };

    let mut write_files = Vec::new();
    if !args.env.is_empty() {
        let content = args
            .env
            .iter()
            .map(|(k, v)| format!("{}={:?}\n", k, v))
            .collect::<String>();
        write_files.push(WriteFile {
            path: "/etc/environment",
            content,
            permissions: "0644",
        });
    }

    let doc = CloudConfig {
        hostname: &args.hostname,
        users: vec![CloudUser {
            name: &args.user.name,
            uid: args.user.uid,
            gecos: &args.user.comment,
            homedir: &args.user.home,
            shell: &args.user.shell,
            sudo: "ALL=(ALL) NOPASSWD:ALL",
            lock_passwd: true,
            ssh_authorized_keys: &args.ssh_keys,
        }],
        ssh_pwauth: false,
        growpart: Growpart {
            mode: "auto",
            devices: vec!["/"],
        },
        bootcmd: if boot {
            args.boot_cmds.iter().flatten().cloned().collect()
        } else {
            Vec::new()
        },
        write_files,
        mounts,
        manage_resolv_conf,
        resolv_conf,
        ca_certs,
    };
    Ok(format!("#cloud-config\n{}", serde_yaml::to_string(&doc)?))
}

const KNOWN_TOP_LEVEL_KEYS: &[&str] = &[
    "hostname",
    "users",
    "ssh_pwauth",
    "growpart",
    "bootcmd",
    "runcmd",
    "write_files",
    "mounts",
    "manage_resolv_conf",
    "resolv_conf",
    "ca_certs",
    "packages",
    "timezone",
];

/// Pre-flight structural check for a cloud-config document: marker line,
/// YAML mapping, known top-level keys. Callers run this on inputs they
/// are about to trust, not on their own rendered output.
pub fn validate_cloud_config(text: &str) -> Result<(), CidataError> {
    let fail = |reason: String| CidataError::TemplateExecution {
        file: "user-data".to_string(),
        reason,
    };
    if text.lines().next().map(str::trim) != Some("#cloud-config") {
        return Err(fail("missing #cloud-config marker line".to_string()));
    }
    let value: serde_yaml::Value = serde_yaml::from_str(text)?;
    let mapping = value
        .as_mapping()
        .ok_or_else(|| fail("document is not a mapping".to_string()))?;
    for key in mapping.keys() {
        let key = key
            .as_str()
            .ok_or_else(|| fail("non-string top-level key".to_string()))?;
        if !KNOWN_TOP_LEVEL_KEYS.contains(&key) {
            return Err(fail(format!("unknown top-level key {:?}", key)));
        }
    }
    Ok(())
}

/// Pipe the machine-config variant through the external transcoder, when
/// one is on PATH. Absent binary is a silent skip; a failing one fails
/// the render.
fn transcode(file: &str, content: Vec<u8>) -> Result<Vec<u8>, CidataError> {
    let Some(bin) = find_in_path(TRANSCODER_BIN) else {
        tracing::debug!(bin = TRANSCODER_BIN, "transcoder not installed, skipping");
        return Ok(content);
    };
    let mut child = Command::new(&bin)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    if let Some(stdin) = child.stdin.take() {
        let mut stdin = stdin;
        stdin.write_all(&content)?;
    }
    let output = child.wait_with_output()?;
    if !output.status.success() {
        return Err(CidataError::TemplateExecution {
            file: file.to_string(),
            reason: format!(
                "{} failed: {}",
                TRANSCODER_BIN,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
        });
    }
    Ok(output.stdout)
}

fn find_in_path(bin: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(bin))
        .find(|p| p.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::tests::{build, fixture};
    use skiff_config::InstanceConfig;

    fn sample_args() -> TemplateArgs {
        let f = fixture();
        build(&InstanceConfig::default(), &f).unwrap()
    }

    #[test]
    fn placeholder_substitution() {
        let map = placeholder_map(&sample_args());
        let out = render_text("t", "id={{instance_id}} host={{ hostname }}", &map).unwrap();
        assert!(out.starts_with("id=iid-"));
        assert!(out.contains("host=skiff-default"));
    }

    #[test]
    fn unknown_placeholder_names_the_file() {
        let map = placeholder_map(&sample_args());
        let err = render_text("boot.sh", "{{nope}}", &map).unwrap_err();
        match err {
            CidataError::TemplateExecution { file, reason } => {
                assert_eq!(file, "boot.sh");
                assert!(reason.contains("nope"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unterminated_placeholder_is_an_error() {
        let map = placeholder_map(&sample_args());
        assert!(render_text("t", "{{name", &map).is_err());
    }

    #[test]
    fn embedded_templates_render_cleanly() {
        let args = sample_args();
        let entries = render(&TemplateSource::Embedded, &args).unwrap();
        assert_eq!(entries[0].path, "user-data");
        let paths: Vec<_> = entries.iter().map(|e| e.path.as_str()).collect();
        assert!(paths.contains(&"meta-data"));
        assert!(paths.contains(&MACHINE_CONFIG_NAME));
        assert!(paths.contains(&"boot.sh"));
    }

    #[test]
    fn dir_source_walks_lexicographically() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("boot")).unwrap();
        std::fs::write(dir.path().join("zz"), "z").unwrap();
        std::fs::write(dir.path().join("boot/a.sh"), "a").unwrap();
        std::fs::write(dir.path().join("meta-data"), "m").unwrap();
        let entries = TemplateSource::Dir(dir.path().to_path_buf())
            .entries()
            .unwrap();
        let paths: Vec<_> = entries.iter().map(|(p, _)| p.as_str()).collect();
        assert_eq!(paths, vec!["boot/a.sh", "meta-data", "zz"]);
    }

    #[cfg(unix)]
    #[test]
    fn dir_source_rejects_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("real"), "x").unwrap();
        std::os::unix::fs::symlink(dir.path().join("real"), dir.path().join("link")).unwrap();
        let err = TemplateSource::Dir(dir.path().to_path_buf())
            .entries()
            .unwrap_err();
        assert!(matches!(err, CidataError::UnexpectedFileType(_)));
    }

    #[test]
    fn reverse_sshfs_omits_mounts_key() {
        let f = fixture();
        let config = InstanceConfig::parse("mounts:\n  - location: /tmp/shared\n").unwrap();
        let args = build(&config, &f).unwrap();
        let text = cloud_config(&args, true).unwrap();
        assert!(!text.contains("mounts:"));

        let config =
            InstanceConfig::parse("mount_type: 9p\nmounts:\n  - location: /tmp/shared\n").unwrap();
        let args = build(&config, &f).unwrap();
        let text = cloud_config(&args, true).unwrap();
        assert!(text.contains("mounts:"));
        assert!(text.contains("trans=virtio"));
    }

    #[test]
    fn preview_has_no_mounts_or_dns() {
        let f = fixture();
        let config = InstanceConfig::parse(
            "mount_type: 9p\nmounts:\n  - location: /tmp/shared\ndns:\n  - 8.8.8.8\n",
        )
        .unwrap();
        let args = build(&config, &f).unwrap();
        let text = render_cloud_config_only(&args).unwrap();
        assert!(text.starts_with("#cloud-config\n"));
        assert!(!text.contains("mounts:"));
        assert!(!text.contains("resolv_conf"));
        assert!(text.contains("ssh_authorized_keys"));
    }

    #[test]
    fn ca_section_only_when_requested() {
        let args = sample_args();
        let text = cloud_config(&args, true).unwrap();
        assert!(!text.contains("ca_certs"));

        let f = fixture();
        let config =
            InstanceConfig::parse("ca_certificates:\n  certs:\n    - |\n      -----BEGIN-----\n      AAAA\n      -----END-----\n")
                .unwrap();
        let args = build(&config, &f).unwrap();
        let text = cloud_config(&args, true).unwrap();
        assert!(text.contains("ca_certs"));
        assert!(text.contains("-----BEGIN-----"));
    }

    #[test]
    fn rendered_cloud_config_passes_validation() {
        let args = sample_args();
        validate_cloud_config(&cloud_config(&args, true).unwrap()).unwrap();
        validate_cloud_config(&render_cloud_config_only(&args).unwrap()).unwrap();
    }

    #[test]
    fn validation_rejects_bad_documents() {
        assert!(validate_cloud_config("users: []\n").is_err());
        assert!(validate_cloud_config("#cloud-config\nfrobnicate: 1\n").is_err());
        validate_cloud_config("#cloud-config\nhostname: x\n").unwrap();
    }
}
