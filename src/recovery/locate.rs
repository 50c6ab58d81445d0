use std::fs;
use std::path::{Component, Path, PathBuf};

use super::{DockerRoot, LayerRecord, Namespace};
use crate::recovery::ident::normalize;

/// Length of the shortened identifiers used by the `overlay2/l` link table.
const SHORT_ID_LEN: usize = 12;

/// Resolve a normalized layer identifier to its content directory by trying
/// each identifier namespace in fixed priority order, short-circuiting on the
/// first hit. Which namespaces still work depends on how intact the forensic
/// copy is, so every strategy must be independently sufficient.
///
/// Never fails: scan errors on individual entries are skipped, and `None`
/// means the identifier is unresolvable through every namespace. No results
/// are cached between calls.
pub fn locate(root: &DockerRoot, id: &str, allow_prefix: bool) -> Option<LayerRecord> {
    if id.is_empty() {
        return None;
    }

    let strategies: [&dyn LookupStrategy; 4] = [
        &DiffIdScan,
        &DirectCachePath,
        &ShortLinkTable { allow_prefix },
        &MountIdFallback,
    ];

    for strategy in strategies {
        if let Some(content_dir) = strategy.resolve(root, id) {
            return Some(LayerRecord {
                id: id.to_string(),
                content_dir,
                namespace: strategy.namespace(),
            });
        }
    }

    None
}

/// One identifier namespace's way of turning an id into a content directory.
trait LookupStrategy {
    fn namespace(&self) -> Namespace;
    fn resolve(&self, root: &DockerRoot, id: &str) -> Option<PathBuf>;
}

/// Scan every layerdb entry and compare its recorded `diff` identifier with
/// the requested id; on a match, follow the entry's `cache-id` into overlay2.
struct DiffIdScan;

impl LookupStrategy for DiffIdScan {
    fn namespace(&self) -> Namespace {
        Namespace::DiffId
    }

    fn resolve(&self, root: &DockerRoot, id: &str) -> Option<PathBuf> {
        let entries = fs::read_dir(root.layerdb()).ok()?;
        for entry in entries.flatten() {
            let db_dir = entry.path();
            let Some(diff_id) = read_id_file(&db_dir.join("diff")) else {
                continue;
            };
            if diff_id != id {
                continue;
            }
            let cache_id = read_id_file(&db_dir.join("cache-id"))?;
            return content_dir_for(&root.overlay2().join(cache_id));
        }
        None
    }
}

/// The requested id may already be a cache id (or a directory name on a
/// degraded copy): check `overlay2/<id>` directly.
struct DirectCachePath;

impl LookupStrategy for DirectCachePath {
    fn namespace(&self) -> Namespace {
        Namespace::CacheId
    }

    fn resolve(&self, root: &DockerRoot, id: &str) -> Option<PathBuf> {
        content_dir_for(&root.overlay2().join(id))
    }
}

/// Match against the `overlay2/l/` table of 12-character short-id symlinks.
struct ShortLinkTable {
    allow_prefix: bool,
}

impl LookupStrategy for ShortLinkTable {
    fn namespace(&self) -> Namespace {
        Namespace::ShortLink
    }

    fn resolve(&self, root: &DockerRoot, id: &str) -> Option<PathBuf> {
        let entries = fs::read_dir(root.short_links()).ok()?;
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            let link = entry.path();
            let Some(target) = resolve_link(root, &link) else {
                continue;
            };
            // A link matches by its own short name, or when the requested id
            // starts with the cache id the link points into.
            let name_match = short_id_matches(&name, id, self.allow_prefix);
            let target_match = cache_component(&target)
                .is_some_and(|cache| !cache.is_empty() && id.starts_with(cache));
            if !name_match && !target_match {
                continue;
            }
            // The link conventionally points at a diff directory; on degraded
            // copies it may point one level up.
            if target.file_name().is_some_and(|n| n == "diff") && target.is_dir() {
                return Some(target);
            }
            let diff = target.join("diff");
            if diff.is_dir() {
                return Some(diff);
            }
        }
        None
    }
}

/// Last resort: the layerdb entry's recorded `mount-id`, which often
/// coincides with the cache id.
struct MountIdFallback;

impl LookupStrategy for MountIdFallback {
    fn namespace(&self) -> Namespace {
        Namespace::MountId
    }

    fn resolve(&self, root: &DockerRoot, id: &str) -> Option<PathBuf> {
        let mount_id = read_id_file(&root.layerdb().join(id).join("mount-id"))?;
        content_dir_for(&root.overlay2().join(mount_id))
    }
}

/// Read a single-value layerdb file (`diff`, `cache-id`, `chain-id`,
/// `mount-id`, `parent`) and normalize its contents. Absent or unreadable
/// files yield `None`.
pub(crate) fn read_id_file(path: &Path) -> Option<String> {
    let raw = fs::read_to_string(path).ok()?;
    let id = normalize(&raw);
    if id.is_empty() { None } else { Some(id) }
}

/// Pick the content directory for an overlay2 layer directory: the `diff`
/// subdirectory when present, the directory itself on degraded copies.
fn content_dir_for(layer_dir: &Path) -> Option<PathBuf> {
    let diff = layer_dir.join("diff");
    if diff.is_dir() {
        return Some(diff);
    }
    if layer_dir.is_dir() {
        return Some(layer_dir.to_path_buf());
    }
    None
}

/// The cache-id component of a resolved short-link target: the directory
/// name above `diff`, or the final component when the link points at the
/// layer directory itself.
fn cache_component(target: &Path) -> Option<&str> {
    let name = target.file_name()?.to_str()?;
    if name == "diff" {
        target.parent()?.file_name()?.to_str()
    } else {
        Some(name)
    }
}

fn short_id_matches(link_name: &str, id: &str, allow_prefix: bool) -> bool {
    if link_name == id {
        return true;
    }
    if allow_prefix {
        let n = SHORT_ID_LEN.min(link_name.len()).min(id.len());
        if n > 0 && link_name.as_bytes()[..n] == id.as_bytes()[..n] {
            return true;
        }
    }
    false
}

/// Resolve a short-link symlink to an absolute path under `overlay2/`,
/// refusing self-referential links and targets that escape the storage root.
fn resolve_link(root: &DockerRoot, link: &Path) -> Option<PathBuf> {
    let target = fs::read_link(link).ok()?;
    let resolved = if target.is_absolute() {
        lexical_normalize(&target)
    } else {
        // Relative targets (the usual `../<cache-id>/diff` shape) resolve
        // against the directory they live in.
        lexical_normalize(&link.parent()?.join(target))
    };

    if resolved == link {
        return None;
    }
    if !resolved.starts_with(root.overlay2()) {
        return None;
    }
    if !resolved.exists() {
        return None;
    }
    Some(resolved)
}

/// Normalize `..` and `.` components without touching the filesystem, so
/// broken intermediate links in a forensic copy cannot derail resolution.
fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other),
        }
    }
    out
}
