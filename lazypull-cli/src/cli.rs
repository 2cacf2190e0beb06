use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::commands::detect::DetectArgs;
use crate::commands::manifests::ManifestsArgs;

#[derive(Parser, Debug)]
#[command(
    name = "lazypull",
    author,
    version,
    about = "Pull OCI image metadata now, layers on demand"
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalFlags,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug)]
pub struct GlobalFlags {
    /// Verbose logging (RUST_LOG takes precedence)
    #[arg(long, global = true)]
    pub debug: bool,

    /// Pull options file (JSON)
    #[arg(long, global = true, env = "LAZYPULL_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Resolve an image and list its manifests, config and layers
    Manifests(ManifestsArgs),

    /// Print the media type of a manifest file
    Detect(DetectArgs),
}
