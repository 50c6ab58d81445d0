mod cmd;
mod progress;
mod recovery;

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

#[derive(Parser)]
#[command(name = "exhume")]
#[command(about = "Recover Docker images from forensic copies of a host filesystem")]
#[command(version)]
struct Cli {
    /// Image ID: full sha256, a unique prefix, or with the sha256: scheme
    image_id: String,

    /// Root of the mounted forensic filesystem copy
    mount_path: PathBuf,

    /// Directory to write the recovered image data into
    output_dir: PathBuf,

    /// Tag recorded in the archive manifest's RepoTags
    #[arg(long, default_value = "forensic/recovered:latest")]
    repo_tag: String,

    /// Gzip-compress the final image archive
    #[arg(long)]
    gzip: bool,

    /// Output the extraction report as JSON (optionally to a file)
    #[arg(long, num_args = 0..=1, default_missing_value = "-")]
    json: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    cmd::extract::run(
        &cli.image_id,
        &cli.mount_path,
        &cli.output_dir,
        &cli.repo_tag,
        cli.gzip,
        cli.json.as_deref(),
    )
}
