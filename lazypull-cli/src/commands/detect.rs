use std::path::PathBuf;

use anyhow::Context;
use clap::Args;

#[derive(Args, Debug)]
pub struct DetectArgs {
    /// Manifest, index or schema1 JSON file
    pub file: PathBuf,
}

pub fn execute(args: DetectArgs) -> anyhow::Result<()> {
    let data = std::fs::read(&args.file)
        .with_context(|| format!("failed to read {}", args.file.display()))?;
    let media_type = lazypull::images::detect_manifest_media_type(&data)?;
    println!("{media_type}");
    Ok(())
}
