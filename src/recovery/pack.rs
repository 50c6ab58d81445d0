use std::fs::{self, File};
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tar::{Builder, EntryType, Header};
use walkdir::WalkDir;

/// A single entry that could not be serialized. Collected, never raised:
/// forensic copies routinely have unreadable files and the rest of the layer
/// is still worth recovering.
#[derive(Debug, Clone, Serialize)]
pub struct PackEntryError {
    pub path: PathBuf,
    pub error: String,
}

/// Outcome of packing one layer's content directory.
#[derive(Debug, Clone, Serialize)]
pub struct PackReport {
    pub entries_written: usize,
    pub errors: Vec<PackEntryError>,
}

/// Serialize a layer content directory into a tar stream.
///
/// Entry rules: symlinks keep their target verbatim with mode 0777, empty
/// directories are emitted with mode 0755, non-empty directories are implied
/// by their contents and omitted, regular files carry their real bytes and
/// mode, and empty files are emitted with mode 0644. Entries are visited in
/// sorted order so the output is deterministic.
///
/// Fails only when zero entries could be written: an empty tar is not a
/// valid layer.
pub fn pack<W: Write>(content_dir: &Path, out: W) -> Result<PackReport> {
    let mut builder = Builder::new(out);
    let mut report = PackReport {
        entries_written: 0,
        errors: Vec::new(),
    };

    let walker = WalkDir::new(content_dir)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name();

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                report.errors.push(PackEntryError {
                    path: e.path().map(Path::to_path_buf).unwrap_or_default(),
                    error: e.to_string(),
                });
                continue;
            }
        };

        let rel = match entry.path().strip_prefix(content_dir) {
            Ok(r) => r.to_path_buf(),
            Err(e) => {
                report.errors.push(PackEntryError {
                    path: entry.path().to_path_buf(),
                    error: e.to_string(),
                });
                continue;
            }
        };

        match append_entry(&mut builder, entry.path(), &rel) {
            Ok(true) => report.entries_written += 1,
            Ok(false) => {}
            Err(e) => report.errors.push(PackEntryError {
                path: entry.path().to_path_buf(),
                error: e.to_string(),
            }),
        }
    }

    builder.finish().context("Failed to finalize layer tar")?;

    if report.entries_written == 0 {
        anyhow::bail!(
            "no entries could be packed from {} ({} errors)",
            content_dir.display(),
            report.errors.len()
        );
    }

    Ok(report)
}

/// Append one filesystem entry. Returns `Ok(false)` for entries that produce
/// no tar record (non-empty directories, unsupported node types are errors).
fn append_entry<W: Write>(builder: &mut Builder<W>, path: &Path, rel: &Path) -> io::Result<bool> {
    // symlink_metadata: a link to a directory must stay a link.
    let meta = fs::symlink_metadata(path)?;
    let ftype = meta.file_type();

    if ftype.is_symlink() {
        let target = fs::read_link(path)?;
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Symlink);
        header.set_mode(0o777);
        header.set_size(0);
        header.set_mtime(0);
        builder.append_link(&mut header, rel, &target)?;
        return Ok(true);
    }

    if ftype.is_dir() {
        if fs::read_dir(path)?.next().is_some() {
            // Implied by its contents.
            return Ok(false);
        }
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Directory);
        header.set_mode(0o755);
        header.set_size(0);
        header.set_mtime(0);
        builder.append_data(&mut header, rel, io::empty())?;
        return Ok(true);
    }

    if ftype.is_file() {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_mtime(0);
        if meta.len() == 0 {
            header.set_mode(0o644);
            header.set_size(0);
            builder.append_data(&mut header, rel, io::empty())?;
        } else {
            header.set_mode(meta.permissions().mode() & 0o7777);
            header.set_size(meta.len());
            let file = File::open(path)?;
            builder.append_data(&mut header, rel, file)?;
        }
        return Ok(true);
    }

    Err(io::Error::other(format!(
        "unsupported entry type at {}",
        path.display()
    )))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Read;
    use std::os::unix::fs::symlink;

    use tempfile::TempDir;

    use super::*;

    fn pack_to_vec(dir: &Path) -> (Vec<u8>, PackReport) {
        let mut buf = Vec::new();
        let report = pack(dir, &mut buf).unwrap();
        (buf, report)
    }

    fn entries_by_path(data: &[u8]) -> HashMap<String, (EntryType, u32, u64, Option<String>)> {
        let mut archive = tar::Archive::new(data);
        let mut out = HashMap::new();
        for entry in archive.entries().unwrap() {
            let entry = entry.unwrap();
            let path = entry.path().unwrap().to_string_lossy().trim_end_matches('/').to_string();
            let link = entry
                .link_name()
                .unwrap()
                .map(|l| l.to_string_lossy().to_string());
            out.insert(
                path,
                (
                    entry.header().entry_type(),
                    entry.header().mode().unwrap(),
                    entry.header().size().unwrap(),
                    link,
                ),
            );
        }
        out
    }

    #[test]
    fn classifies_the_four_entry_kinds() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir(tmp.path().join("empty_dir")).unwrap();
        fs::write(tmp.path().join("empty.txt"), b"").unwrap();
        fs::write(tmp.path().join("data.txt"), b"hello").unwrap();
        fs::set_permissions(
            tmp.path().join("data.txt"),
            fs::Permissions::from_mode(0o640),
        )
        .unwrap();
        symlink("data.txt", tmp.path().join("link")).unwrap();

        let (buf, report) = pack_to_vec(tmp.path());
        assert_eq!(report.entries_written, 4);
        assert!(report.errors.is_empty());

        let entries = entries_by_path(&buf);
        assert_eq!(entries.len(), 4);

        let (t, mode, size, _) = &entries["empty_dir"];
        assert_eq!(*t, EntryType::Directory);
        assert_eq!(*mode, 0o755);
        assert_eq!(*size, 0);

        let (t, mode, size, _) = &entries["empty.txt"];
        assert_eq!(*t, EntryType::Regular);
        assert_eq!(*mode, 0o644);
        assert_eq!(*size, 0);

        let (t, mode, size, _) = &entries["data.txt"];
        assert_eq!(*t, EntryType::Regular);
        assert_eq!(*mode, 0o640);
        assert_eq!(*size, 5);

        let (t, mode, _, link) = &entries["link"];
        assert_eq!(*t, EntryType::Symlink);
        assert_eq!(*mode, 0o777);
        assert_eq!(link.as_deref(), Some("data.txt"));
    }

    #[test]
    fn nonempty_directories_are_implied_not_emitted() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir(tmp.path().join("sub")).unwrap();
        fs::write(tmp.path().join("sub/file.txt"), b"x").unwrap();

        let (buf, report) = pack_to_vec(tmp.path());
        assert_eq!(report.entries_written, 1);

        let entries = entries_by_path(&buf);
        assert!(entries.contains_key("sub/file.txt"));
        assert!(!entries.contains_key("sub"));
    }

    #[test]
    fn dangling_symlink_is_packed_verbatim() {
        let tmp = TempDir::new().unwrap();
        symlink("../does/not/exist", tmp.path().join("broken")).unwrap();

        let (buf, report) = pack_to_vec(tmp.path());
        assert_eq!(report.entries_written, 1);
        assert!(report.errors.is_empty());

        let entries = entries_by_path(&buf);
        let (t, _, _, link) = &entries["broken"];
        assert_eq!(*t, EntryType::Symlink);
        assert_eq!(link.as_deref(), Some("../does/not/exist"));
    }

    #[test]
    fn failed_entry_is_collected_and_packing_continues() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("data.txt"), b"hello").unwrap();
        symlink("data.txt", tmp.path().join("link")).unwrap();
        // A FIFO has no tar representation here and must fail as one entry.
        let status = std::process::Command::new("mkfifo")
            .arg(tmp.path().join("pipe"))
            .status()
            .unwrap();
        assert!(status.success());

        let (buf, report) = pack_to_vec(tmp.path());
        assert_eq!(report.entries_written, 2);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].path.ends_with("pipe"));

        let entries = entries_by_path(&buf);
        assert!(entries.contains_key("data.txt"));
        assert!(entries.contains_key("link"));
    }

    #[test]
    fn round_trip_reproduces_the_tree() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("etc/nested")).unwrap();
        fs::create_dir(tmp.path().join("var")).unwrap();
        fs::write(tmp.path().join("etc/nested/conf"), b"key=value\n").unwrap();
        fs::write(tmp.path().join("hello"), b"world").unwrap();
        symlink("hello", tmp.path().join("alias")).unwrap();

        let (buf, _) = pack_to_vec(tmp.path());

        let dest = TempDir::new().unwrap();
        let mut archive = tar::Archive::new(buf.as_slice());
        archive.unpack(dest.path()).unwrap();

        assert_eq!(
            fs::read(dest.path().join("etc/nested/conf")).unwrap(),
            b"key=value\n"
        );
        assert_eq!(fs::read(dest.path().join("hello")).unwrap(), b"world");
        assert!(dest.path().join("var").is_dir());
        assert_eq!(
            fs::read_link(dest.path().join("alias")).unwrap(),
            PathBuf::from("hello")
        );
    }

    #[test]
    fn empty_content_dir_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let mut buf = Vec::new();
        assert!(pack(tmp.path(), &mut buf).is_err());
    }

    #[test]
    fn file_bytes_survive_packing() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("blob"), vec![0xAB; 4096]).unwrap();

        let (buf, _) = pack_to_vec(tmp.path());
        let mut archive = tar::Archive::new(buf.as_slice());
        let mut entry = archive.entries().unwrap().next().unwrap().unwrap();
        let mut data = Vec::new();
        entry.read_to_end(&mut data).unwrap();
        assert_eq!(data, vec![0xAB; 4096]);
    }
}
