use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use flate2::Compression;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};

use super::{DockerRoot, LayerRecord, Namespace, RecoveryError};
use crate::recovery::chain::walk;
use crate::recovery::ident::normalize;
use crate::recovery::locate::locate;
use crate::recovery::metadata::{self, ImageMetadata};
use crate::recovery::pack::{self, PackEntryError};

/// How far an extraction run got before finishing or failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Init,
    RootResolved,
    ConfigLoaded,
    LayersResolved,
    Packed,
    ArchiveWritten,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Init => "init",
            Stage::RootResolved => "root-resolved",
            Stage::ConfigLoaded => "config-loaded",
            Stage::LayersResolved => "layers-resolved",
            Stage::Packed => "packed",
            Stage::ArchiveWritten => "archive-written",
        };
        write!(f, "{name}")
    }
}

/// Per-declared-layer outcome, in the order the image configuration lists
/// its diff_ids.
#[derive(Debug, Clone, Serialize)]
pub struct LayerOutcome {
    pub index: usize,
    pub diff_id: String,
    /// Manifest-relative path of the packed tar, absent when the layer could
    /// not be extracted.
    pub archive_path: Option<String>,
    /// Namespace the layer resolved through.
    pub namespace: Option<Namespace>,
    /// Identifier the layer actually resolved under; differs from `diff_id`
    /// when the record came from a chain walk over cache ids.
    pub resolved_id: Option<String>,
    /// Set when this declared index repeats an earlier diff_id and reuses
    /// its packed tar instead of packing again.
    pub shared_with: Option<usize>,
    pub error: Option<String>,
    pub pack_errors: Vec<PackEntryError>,
}

/// Final report of one extraction run.
#[derive(Debug, Serialize)]
pub struct ExtractionReport {
    pub image_id: String,
    pub repo_tag: String,
    pub docker_root: PathBuf,
    pub stage: Stage,
    pub declared_layers: usize,
    pub extracted_layers: usize,
    pub layers: Vec<LayerOutcome>,
    pub output_dir: PathBuf,
    pub archive: Option<PathBuf>,
}

#[derive(Serialize, Deserialize)]
struct ManifestEntry {
    #[serde(rename = "Config")]
    config: String,
    #[serde(rename = "RepoTags")]
    repo_tags: Vec<String>,
    #[serde(rename = "Layers")]
    layers: Vec<String>,
}

pub struct AssembleOptions {
    pub repo_tag: String,
    pub gzip: bool,
}

impl Default for AssembleOptions {
    fn default() -> Self {
        Self {
            repo_tag: "forensic/recovered:latest".to_string(),
            gzip: false,
        }
    }
}

/// Optional callback invoked before each declared layer is processed, with
/// its 1-based position and the declared total.
pub type OnLayer = Box<dyn FnMut(usize, usize)>;

/// Recover one image from a mounted forensic copy and assemble it into a
/// `docker load`-able archive under `output_dir`.
///
/// Individual layer failures are recorded in the report and skipped; the run
/// itself fails only when the root or configuration cannot be found, the
/// configuration lacks a layer list, or no layer at all could be extracted.
pub fn extract_image(
    image_id: &str,
    mount_path: &Path,
    output_dir: &Path,
    opts: &AssembleOptions,
    on_layer: &mut Option<OnLayer>,
) -> Result<ExtractionReport> {
    let root = metadata::find_docker_root(mount_path)
        .with_context(|| format!("extraction stopped at stage {}", Stage::Init))?;
    let meta = metadata::load_image_config(&root, image_id)
        .with_context(|| format!("extraction stopped at stage {}", Stage::RootResolved))?;

    let image_out = output_dir.join(format!("image_{}", meta.id));
    fs::create_dir_all(&image_out)
        .with_context(|| format!("Failed to create {}", image_out.display()))?;

    fs::write(image_out.join("image_metadata.json"), &meta.raw)
        .context("Failed to save image metadata")?;
    fs::write(
        image_out.join("Dockerfile"),
        metadata::generate_dockerfile(&meta.container),
    )
    .context("Failed to write Dockerfile")?;

    let mut report = ExtractionReport {
        image_id: meta.id.clone(),
        repo_tag: opts.repo_tag.clone(),
        docker_root: root.path().to_path_buf(),
        stage: Stage::ConfigLoaded,
        declared_layers: meta.diff_ids.len(),
        extracted_layers: 0,
        layers: Vec::new(),
        output_dir: image_out.clone(),
        archive: None,
    };

    let records = resolve_layers(&root, &meta.diff_ids);
    report.stage = Stage::LayersResolved;

    pack_layers(&meta, records, &image_out, &mut report, on_layer);

    if report.extracted_layers == 0 {
        return Err(RecoveryError::NoLayersExtracted.into());
    }
    report.stage = Stage::Packed;

    let manifest = ManifestEntry {
        config: format!("{}.json", meta.id),
        repo_tags: vec![opts.repo_tag.clone()],
        layers: report
            .layers
            .iter()
            .filter_map(|o| o.archive_path.clone())
            .collect(),
    };
    let manifest_json = serde_json::to_vec_pretty(&[&manifest])?;
    fs::write(image_out.join("manifest.json"), &manifest_json)
        .context("Failed to write manifest.json")?;

    let archive_path = write_archive(&image_out, &meta, &manifest, &manifest_json, opts.gzip)?;
    report.stage = Stage::ArchiveWritten;
    report.archive = Some(archive_path);

    Ok(report)
}

/// Resolve every declared diff_id through the locator; when some remain
/// unresolved, walk the parent chain from the last declared layer and, if
/// the recovered chain covers the whole declared list, fill the gaps by
/// position.
fn resolve_layers(root: &DockerRoot, diff_ids: &[String]) -> Vec<Option<LayerRecord>> {
    let mut records: Vec<Option<LayerRecord>> = diff_ids
        .iter()
        .map(|raw| {
            let id = normalize(raw);
            if id.is_empty() {
                None
            } else {
                locate(root, &id, false)
            }
        })
        .collect();

    if records.iter().all(Option::is_some) {
        return records;
    }

    if let Some(top) = diff_ids.last() {
        let chain = walk(root, top);
        if chain.len() == diff_ids.len() {
            for (slot, recovered) in records.iter_mut().zip(chain) {
                if slot.is_none() {
                    *slot = Some(recovered);
                }
            }
        }
    }

    records
}

/// Pack each resolved layer into `layer_<index>/layer.tar`, reusing the
/// earlier tar when a diff_id legitimately repeats in the declared list.
fn pack_layers(
    meta: &ImageMetadata,
    records: Vec<Option<LayerRecord>>,
    image_out: &Path,
    report: &mut ExtractionReport,
    on_layer: &mut Option<OnLayer>,
) {
    let total = meta.diff_ids.len();
    let mut packed: HashMap<String, (usize, String)> = HashMap::new();

    for (index, (raw_id, record)) in meta.diff_ids.iter().zip(records).enumerate() {
        if let Some(cb) = on_layer {
            cb(index + 1, total);
        }

        let diff_id = normalize(raw_id);
        let mut outcome = LayerOutcome {
            index,
            diff_id: diff_id.clone(),
            archive_path: None,
            namespace: None,
            resolved_id: None,
            shared_with: None,
            error: None,
            pack_errors: Vec::new(),
        };

        if let Some((earlier, path)) = packed.get(&diff_id) {
            outcome.archive_path = Some(path.clone());
            outcome.shared_with = Some(*earlier);
            report.extracted_layers += 1;
            report.layers.push(outcome);
            continue;
        }

        let Some(record) = record else {
            outcome.error = Some(format!("could not resolve layer {diff_id}"));
            report.layers.push(outcome);
            continue;
        };
        outcome.namespace = Some(record.namespace);
        outcome.resolved_id = Some(record.id.clone());

        match pack_one(&record, index, image_out) {
            Ok((path, errors)) => {
                packed.insert(diff_id, (index, path.clone()));
                outcome.archive_path = Some(path);
                outcome.pack_errors = errors;
                report.extracted_layers += 1;
            }
            Err(e) => outcome.error = Some(format!("{e:#}")),
        }

        report.layers.push(outcome);
    }
}

fn pack_one(
    record: &LayerRecord,
    index: usize,
    image_out: &Path,
) -> Result<(String, Vec<PackEntryError>)> {
    let rel = format!("layer_{index:03}/layer.tar");
    let layer_dir = image_out.join(format!("layer_{index:03}"));
    fs::create_dir_all(&layer_dir)
        .with_context(|| format!("Failed to create {}", layer_dir.display()))?;

    let tar_path = layer_dir.join("layer.tar");
    let file = File::create(&tar_path)
        .with_context(|| format!("Failed to create {}", tar_path.display()))?;
    let pack_report = pack::pack(&record.content_dir, file)
        .with_context(|| format!("Failed to pack {}", record.content_dir.display()))?;

    Ok((rel, pack_report.errors))
}

/// Write the composite archive: manifest first, then the image configuration
/// under the exact name the manifest references, then each layer tar at its
/// manifest path. Consumers read the manifest first, so entry order matters.
fn write_archive(
    image_out: &Path,
    meta: &ImageMetadata,
    manifest: &ManifestEntry,
    manifest_json: &[u8],
    gzip: bool,
) -> Result<PathBuf> {
    // Carved identifiers may not be clean ASCII; never slice mid-character.
    let short = meta.id.get(..12).unwrap_or(&meta.id);
    let name = if gzip {
        format!("image_{short}.tar.gz")
    } else {
        format!("image_{short}.tar")
    };
    let path = image_out.join(&name);
    let file =
        File::create(&path).with_context(|| format!("Failed to create {}", path.display()))?;

    if gzip {
        let encoder = GzEncoder::new(file, Compression::default());
        let encoder = append_archive_entries(encoder, image_out, meta, manifest, manifest_json)?;
        encoder.finish().context("Failed to finish gzip stream")?;
    } else {
        append_archive_entries(file, image_out, meta, manifest, manifest_json)?;
    }

    Ok(path)
}

fn append_archive_entries<W: Write>(
    out: W,
    image_out: &Path,
    meta: &ImageMetadata,
    manifest: &ManifestEntry,
    manifest_json: &[u8],
) -> Result<W> {
    let mut builder = tar::Builder::new(out);

    append_bytes(&mut builder, "manifest.json", manifest_json)?;
    append_bytes(&mut builder, &manifest.config, &meta.raw)?;

    // A repeated manifest path means a shared layer; the tar carries it once.
    let mut seen: Vec<&str> = Vec::new();
    for layer_path in &manifest.layers {
        if seen.contains(&layer_path.as_str()) {
            continue;
        }
        seen.push(layer_path);

        let disk_path = image_out.join(layer_path);
        let mut file = File::open(&disk_path)
            .with_context(|| format!("Failed to open {}", disk_path.display()))?;
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(file.metadata()?.len());
        header.set_mode(0o644);
        header.set_mtime(0);
        builder.append_data(&mut header, layer_path, &mut file)?;
    }

    builder.finish().context("Failed to finalize image archive")?;
    Ok(builder.into_inner()?)
}

fn append_bytes<W: Write>(builder: &mut tar::Builder<W>, path: &str, data: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(0);
    builder.append_data(&mut header, path, data)?;
    Ok(())
}
