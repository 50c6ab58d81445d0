use std::fs;
use std::io::{self, Write};
use std::path::Path;

use anyhow::{Context, Result};
use crossterm::style::{self, Stylize};

use crate::progress::Spinner;
use crate::recovery::assemble::{self, AssembleOptions, ExtractionReport, OnLayer};

pub fn run(
    image_id: &str,
    mount_path: &Path,
    output_dir: &Path,
    repo_tag: &str,
    gzip: bool,
    json: Option<&str>,
) -> Result<()> {
    fs::create_dir_all(output_dir)
        .with_context(|| format!("Failed to create {}", output_dir.display()))?;

    let spinner = Spinner::new(format!("Locating image {image_id}..."));

    let bar = spinner.clone_bar();
    let mut on_layer: Option<OnLayer> = Some(Box::new(move |i, total| {
        bar.set_message(format!("Extracting layer {i}/{total} ..."));
    }));

    let opts = AssembleOptions {
        repo_tag: repo_tag.to_string(),
        gzip,
    };

    let report = match assemble::extract_image(image_id, mount_path, output_dir, &opts, &mut on_layer)
    {
        Ok(report) => report,
        Err(e) => {
            spinner.clear();
            return Err(e);
        }
    };

    spinner.finish(format!(
        "Extracted {} of {} layers",
        report.extracted_layers, report.declared_layers
    ));
    print_summary(&report);

    if let Some(dest) = json {
        let output = serde_json::to_string_pretty(&report)?;
        if dest == "-" {
            println!("{output}");
        } else {
            fs::write(dest, &output)
                .with_context(|| format!("Failed to write JSON to {dest}"))?;
            eprintln!("{} Wrote {dest}", "✔".green());
        }
    }

    Ok(())
}

fn print_summary(report: &ExtractionReport) {
    let mut stderr = io::stderr();

    for outcome in &report.layers {
        let short = outcome.diff_id.get(..12).unwrap_or(&outcome.diff_id);
        let line = if let Some(path) = &outcome.archive_path {
            let via = match (outcome.shared_with, outcome.namespace) {
                (Some(earlier), _) => format!("shared with layer {earlier}"),
                (None, Some(ns)) => format!("via {ns}"),
                (None, None) => String::new(),
            };
            format!(
                "{} layer {:03} {} {} ({})",
                "✔".green(),
                outcome.index,
                style::style(short).dim(),
                path,
                via
            )
        } else {
            format!(
                "{} layer {:03} {} {}",
                "!".yellow().bold(),
                outcome.index,
                style::style(short).dim(),
                outcome.error.as_deref().unwrap_or("skipped")
            )
        };
        let _ = writeln!(stderr, "{line}");

        for pe in &outcome.pack_errors {
            let _ = writeln!(
                stderr,
                "  {} {}: {}",
                "!".yellow(),
                pe.path.display(),
                pe.error
            );
        }
    }

    let _ = writeln!(stderr);
    if let Some(archive) = &report.archive {
        let _ = writeln!(
            stderr,
            "{} Wrote {}",
            "✔".green(),
            style::style(archive.display()).cyan()
        );
        if let Some(name) = archive.file_name() {
            let _ = writeln!(
                stderr,
                "{} Import with: docker load -i {}",
                "→".dim(),
                name.to_string_lossy()
            );
        }
    }
}
