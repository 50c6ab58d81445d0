use std::collections::HashSet;
use std::fs;
use std::path::Path;

use super::{DockerRoot, LayerRecord};
use crate::recovery::ident::normalize;
use crate::recovery::locate::{locate, read_id_file};

/// Reconstruct the ancestor chain of a layer by repeatedly resolving
/// "parent of" links, starting from `start_id`. Returns the chain base layer
/// first, the order a layered filesystem is applied in.
///
/// A missing parent or an unresolvable link terminates the walk; the partial
/// chain accumulated so far is returned, not an error. The caller decides
/// whether a short chain is acceptable. Corrupted linkage in a forensic copy
/// can loop, so every visited identifier is tracked and revisiting one stops
/// the walk.
pub fn walk(root: &DockerRoot, start_id: &str) -> Vec<LayerRecord> {
    let mut visited: HashSet<String> = HashSet::new();
    let mut chain: Vec<LayerRecord> = Vec::new();
    let mut current = normalize(start_id);

    while !current.is_empty() && visited.insert(current.clone()) {
        let Some(record) = locate(root, &current, true) else {
            break;
        };

        let parent = parent_of(root, &current, &record.content_dir);
        chain.push(record);

        match parent {
            Some(id) => current = id,
            None => break,
        }
    }

    chain.reverse();
    chain
}

/// Determine the parent identifier of a layer, trying each linkage mechanism
/// a forensic copy may still have intact:
/// 1. the explicit `parent` file in the layerdb entry;
/// 2. a sibling layerdb entry sharing the same `chain-id` value;
/// 3. the first entry of the overlay2 `lower` file next to (or inside) the
///    content directory.
fn parent_of(root: &DockerRoot, id: &str, content_dir: &Path) -> Option<String> {
    let db_dir = root.layerdb().join(id);

    if let Some(parent) = read_id_file(&db_dir.join("parent")) {
        return Some(parent);
    }

    if let Some(parent) = chain_sibling(root, id, &db_dir) {
        return Some(parent);
    }

    lower_parent(content_dir)
}

/// Scan the layerdb for another entry recording the same `chain-id` value
/// under a different own identifier; that sibling is the parent.
fn chain_sibling(root: &DockerRoot, id: &str, db_dir: &Path) -> Option<String> {
    let chain_id = read_id_file(&db_dir.join("chain-id"))?;
    let entries = fs::read_dir(root.layerdb()).ok()?;
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if name == id {
            continue;
        }
        if read_id_file(&entry.path().join("chain-id")).as_deref() == Some(chain_id.as_str()) {
            return Some(normalize(&name));
        }
    }
    None
}

/// The `lower` file holds a colon-separated list of short-link names
/// (`l/XXXXXXXXXXXX:...`), immediate parent first. It lives beside the
/// `diff` directory, so check the content directory's parent as well as the
/// content directory itself (degraded copies may present either shape).
fn lower_parent(content_dir: &Path) -> Option<String> {
    let candidates = [
        content_dir.parent().map(|p| p.join("lower")),
        Some(content_dir.join("lower")),
    ];

    for path in candidates.into_iter().flatten() {
        let Ok(raw) = fs::read_to_string(&path) else {
            continue;
        };
        let first = raw.split(':').next().unwrap_or("").trim();
        let short = first.strip_prefix("l/").unwrap_or(first);
        let id = normalize(short);
        if !id.is_empty() {
            return Some(id);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::os::unix::fs::symlink;

    use tempfile::TempDir;

    use super::*;

    fn layer_id(n: usize) -> String {
        format!("{n:0>64x}")
    }

    fn empty_root() -> (TempDir, DockerRoot) {
        let tmp = TempDir::new().unwrap();
        let root = DockerRoot::new(tmp.path().to_path_buf());
        fs::create_dir_all(root.overlay2()).unwrap();
        fs::create_dir_all(root.layerdb()).unwrap();
        (tmp, root)
    }

    /// One layer with intact layerdb + overlay2 state. `parent` controls the
    /// explicit parent file.
    fn add_layer(root: &DockerRoot, n: usize, parent: Option<usize>) {
        let id = layer_id(n);
        let cache = format!("cache{n:0>59}");
        let db = root.layerdb().join(&id);
        fs::create_dir_all(&db).unwrap();
        fs::write(db.join("diff"), format!("sha256:{id}")).unwrap();
        fs::write(db.join("cache-id"), &cache).unwrap();
        if let Some(p) = parent {
            fs::write(db.join("parent"), format!("sha256:{}", layer_id(p))).unwrap();
        }
        let diff = root.overlay2().join(&cache).join("diff");
        fs::create_dir_all(&diff).unwrap();
        fs::write(diff.join(format!("file{n}")), b"x").unwrap();
    }

    #[test]
    fn walks_parent_files_base_first() {
        let (_tmp, root) = empty_root();
        add_layer(&root, 0, None);
        add_layer(&root, 1, Some(0));
        add_layer(&root, 2, Some(1));

        let chain = walk(&root, &format!("sha256:{}", layer_id(2)));
        assert_eq!(chain.len(), 3);
        assert_eq!(chain[0].id, layer_id(0));
        assert_eq!(chain[1].id, layer_id(1));
        assert_eq!(chain[2].id, layer_id(2));
    }

    #[test]
    fn visited_ids_are_unique() {
        let (_tmp, root) = empty_root();
        add_layer(&root, 0, None);
        add_layer(&root, 1, Some(0));

        let chain = walk(&root, &layer_id(1));
        let mut ids: Vec<&str> = chain.iter().map(|r| r.id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), chain.len());
    }

    #[test]
    fn cycle_terminates_with_short_chain() {
        let (_tmp, root) = empty_root();
        // 1 -> 0 -> 1: corrupted linkage loops back.
        add_layer(&root, 0, Some(1));
        add_layer(&root, 1, Some(0));

        let chain = walk(&root, &layer_id(1));
        assert_eq!(chain.len(), 2);
    }

    #[test]
    fn self_referential_parent_terminates() {
        let (_tmp, root) = empty_root();
        add_layer(&root, 0, Some(0));

        let chain = walk(&root, &layer_id(0));
        assert_eq!(chain.len(), 1);
    }

    #[test]
    fn missing_parent_yields_partial_chain() {
        let (_tmp, root) = empty_root();
        // Layer 2's parent is declared but its layerdb and overlay2 state is
        // absent from the copy.
        add_layer(&root, 2, Some(1));

        let chain = walk(&root, &layer_id(2));
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].id, layer_id(2));
    }

    #[test]
    fn walks_chain_id_siblings() {
        let (_tmp, root) = empty_root();
        add_layer(&root, 0, None);
        add_layer(&root, 1, None);
        // No parent files; both entries record the same chain-id value.
        let shared = format!("sha256:{}", layer_id(9));
        fs::write(root.layerdb().join(layer_id(1)).join("chain-id"), &shared).unwrap();
        fs::write(root.layerdb().join(layer_id(0)).join("chain-id"), &shared).unwrap();

        let chain = walk(&root, &layer_id(1));
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[0].id, layer_id(0));
        assert_eq!(chain[1].id, layer_id(1));
    }

    #[test]
    fn walks_lower_references() {
        let (_tmp, root) = empty_root();
        add_layer(&root, 0, None);
        add_layer(&root, 1, None);

        // Short link for layer 0's cache dir, referenced from layer 1's
        // `lower` file.
        let cache0 = format!("cache{:0>59}", 0);
        let cache1 = format!("cache{:0>59}", 1);
        fs::create_dir_all(root.short_links()).unwrap();
        let short = &layer_id(0)[..12];
        symlink(format!("../{cache0}/diff"), root.short_links().join(short)).unwrap();
        fs::write(
            root.overlay2().join(&cache1).join("lower"),
            format!("l/{short}"),
        )
        .unwrap();

        let chain = walk(&root, &layer_id(1));
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[1].id, layer_id(1));
        assert_eq!(
            chain[0].content_dir,
            root.overlay2().join(&cache0).join("diff")
        );
    }
}
