use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;

use super::{DockerRoot, RecoveryError};
use crate::recovery::ident::normalize;

/// Candidate locations of the Docker data directory relative to the mount
/// point of a forensic copy. The `[root]` variant is how FTK Imager and
/// friends expose the filesystem root.
const ROOT_CANDIDATES: &[&[&str]] = &[
    &["var", "lib", "docker"],
    &["[root]", "var", "lib", "docker"],
    &["Docker"],
    &["ProgramData", "Docker"],
];

/// A recovered image configuration: the full identifier, the exact bytes to
/// embed in the output archive, and the pieces of the parsed document the
/// extraction needs.
#[derive(Debug, Clone)]
pub struct ImageMetadata {
    pub id: String,
    pub raw: Vec<u8>,
    pub diff_ids: Vec<String>,
    pub container: ContainerConfig,
}

/// The `config` sub-object of an image configuration, consumed only by the
/// Dockerfile generator.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContainerConfig {
    #[serde(rename = "Env", default)]
    pub env: Vec<String>,
    #[serde(rename = "Entrypoint")]
    pub entrypoint: Option<Vec<String>>,
    #[serde(rename = "Cmd")]
    pub cmd: Option<Vec<String>>,
    #[serde(rename = "ExposedPorts")]
    pub exposed_ports: Option<BTreeMap<String, Value>>,
    #[serde(rename = "Volumes")]
    pub volumes: Option<BTreeMap<String, Value>>,
    #[serde(rename = "WorkingDir")]
    pub working_dir: Option<String>,
    #[serde(rename = "User")]
    pub user: Option<String>,
}

#[derive(Deserialize)]
struct ImageConfigDoc {
    rootfs: Option<Rootfs>,
    config: Option<ContainerConfig>,
}

#[derive(Deserialize)]
struct Rootfs {
    #[serde(default)]
    diff_ids: Vec<String>,
}

/// Find the Docker data directory under a mounted filesystem by probing the
/// usual locations, accepting the mount path itself when it already is one.
/// A candidate counts only if it has an `overlay2/` child.
pub fn find_docker_root(mount_path: &Path) -> Result<DockerRoot> {
    for parts in ROOT_CANDIDATES {
        let mut candidate = mount_path.to_path_buf();
        for part in *parts {
            candidate.push(part);
        }
        if candidate.join("overlay2").is_dir() {
            return Ok(DockerRoot::new(candidate));
        }
    }

    if mount_path.join("overlay2").is_dir() {
        return Ok(DockerRoot::new(mount_path.to_path_buf()));
    }

    Err(RecoveryError::RootNotFound(mount_path.to_path_buf()).into())
}

/// Load the image configuration matching `image_id` exactly, or by prefix
/// when there is no exact entry. Two or more prefix matches are an error
/// rather than a silent pick.
pub fn load_image_config(root: &DockerRoot, image_id: &str) -> Result<ImageMetadata> {
    let id = normalize(image_id);
    if id.is_empty() {
        return Err(RecoveryError::ImageNotFound(image_id.to_string()).into());
    }

    let full_id = match_image_entry(root, &id)?;
    let path = root.imagedb().join(&full_id);
    let raw = fs::read(&path)
        .with_context(|| format!("Failed to read image configuration {}", path.display()))?;

    let (doc, raw) = parse_config_bytes(&raw)?;

    let diff_ids = doc
        .rootfs
        .map(|r| r.diff_ids)
        .filter(|ids| !ids.is_empty())
        .ok_or_else(|| {
            RecoveryError::InvalidConfig("missing rootfs.diff_ids layer list".to_string())
        })?;

    Ok(ImageMetadata {
        id: full_id,
        raw,
        diff_ids,
        container: doc.config.unwrap_or_default(),
    })
}

fn match_image_entry(root: &DockerRoot, id: &str) -> Result<String> {
    let imagedb = root.imagedb();
    let entries = fs::read_dir(&imagedb)
        .map_err(|_| RecoveryError::ImageNotFound(id.to_string()))?;

    let mut matches: Vec<String> = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if name == id {
            return Ok(name);
        }
        if name.starts_with(id) {
            matches.push(name);
        }
    }

    match matches.len() {
        0 => Err(RecoveryError::ImageNotFound(id.to_string()).into()),
        1 => Ok(matches.remove(0)),
        _ => {
            matches.sort_unstable();
            Err(RecoveryError::AmbiguousImageId {
                prefix: id.to_string(),
                candidates: matches,
            }
            .into())
        }
    }
}

/// Parse configuration bytes, falling back to a cleaned copy when the carve
/// has trailing garbage. Returns the parsed document and the bytes to embed
/// in the archive: the untouched original when it parsed as-is, otherwise a
/// re-serialization of the cleaned document.
fn parse_config_bytes(raw: &[u8]) -> Result<(ImageConfigDoc, Vec<u8>)> {
    if let Ok(doc) = serde_json::from_slice::<ImageConfigDoc>(raw) {
        return Ok((doc, raw.to_vec()));
    }

    let cleaned = clean_json_bytes(raw);
    let value: Value = serde_json::from_slice(&cleaned)
        .map_err(|e| RecoveryError::InvalidConfig(format!("unparseable JSON: {e}")))?;
    let doc: ImageConfigDoc = serde_json::from_value(value.clone())
        .map_err(|e| RecoveryError::InvalidConfig(e.to_string()))?;
    let bytes = serde_json::to_vec_pretty(&value)?;
    Ok((doc, bytes))
}

/// Best-effort repair of a carved JSON document: keep the span from the
/// first `{` to the last `}` and drop NUL / stray control bytes.
fn clean_json_bytes(raw: &[u8]) -> Vec<u8> {
    let start = raw.iter().position(|&b| b == b'{').unwrap_or(0);
    let end = raw
        .iter()
        .rposition(|&b| b == b'}')
        .map(|p| p + 1)
        .unwrap_or(raw.len());
    raw[start.min(end)..end]
        .iter()
        .copied()
        .filter(|&b| b >= 0x20 || b == b'\n' || b == b'\r' || b == b'\t')
        .collect()
}

/// Render a best-effort Dockerfile from the recovered container
/// configuration. Build args and intermediate stages are not recoverable
/// from an image, so the result documents the final stage only.
pub fn generate_dockerfile(config: &ContainerConfig) -> String {
    let mut out = String::from("# Reconstructed from a recovered image configuration.\n");
    out.push_str("FROM scratch\n");

    for env in &config.env {
        out.push_str(&format!("ENV {env}\n"));
    }
    if let Some(dir) = &config.working_dir {
        if !dir.is_empty() {
            out.push_str(&format!("WORKDIR {dir}\n"));
        }
    }
    if let Some(user) = &config.user {
        if !user.is_empty() {
            out.push_str(&format!("USER {user}\n"));
        }
    }
    if let Some(ports) = &config.exposed_ports {
        for port in ports.keys() {
            out.push_str(&format!("EXPOSE {port}\n"));
        }
    }
    if let Some(volumes) = &config.volumes {
        for volume in volumes.keys() {
            out.push_str(&format!("VOLUME {volume}\n"));
        }
    }
    if let Some(entrypoint) = &config.entrypoint {
        out.push_str(&format!(
            "ENTRYPOINT {}\n",
            serde_json::to_string(entrypoint).unwrap_or_default()
        ));
    }
    if let Some(cmd) = &config.cmd {
        out.push_str(&format!(
            "CMD {}\n",
            serde_json::to_string(cmd).unwrap_or_default()
        ));
    }

    out
}
