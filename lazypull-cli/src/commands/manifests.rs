use std::sync::Arc;

use anyhow::Context;
use clap::Args;
use comfy_table::Table;
use comfy_table::presets::NOTHING;
use oci_client::Reference;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use lazypull::images::Descriptor;
use lazypull::{MemoryStore, PullOptions, PulledManifests, Puller, RegistryResolver};
use lazypull_shared::constants::annotations::UNCOMPRESSED;

#[derive(Args, Debug)]
pub struct ManifestsArgs {
    /// Image reference (e.g. docker.io/library/alpine:3)
    pub reference: String,

    /// Target platform as os/arch[/variant] (defaults to the host)
    #[arg(long)]
    pub platform: Option<String>,

    /// Print JSON instead of a table
    #[arg(long)]
    pub json: bool,
}

#[derive(Serialize)]
struct Output<'a> {
    reference: &'a str,
    main_manifest: &'a Descriptor,
    config: &'a Descriptor,
    nonlayers: &'a [Descriptor],
    layers: &'a [Descriptor],
}

pub async fn execute(args: ManifestsArgs, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let options = match &global.config {
        Some(path) => PullOptions::load(path)?,
        None => PullOptions::default(),
    };
    let mut options = options.with_env(|key| std::env::var(key).ok())?;
    if let Some(platform) = args.platform {
        options.platform = Some(platform);
    }

    let reference: Reference = args
        .reference
        .parse()
        .with_context(|| format!("invalid image reference '{}'", args.reference))?;

    let store = Arc::new(MemoryStore::new());
    let resolver = Arc::new(RegistryResolver::new(&options));
    let puller = Arc::new(Puller::from_options(store, resolver, reference, options)?);

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling pull");
            on_interrupt.cancel();
        }
    });

    let pulled = puller.pull_manifests(&cancel).await?;
    if args.json {
        print_json(&pulled)?;
    } else {
        print_table(&pulled);
    }
    Ok(())
}

fn print_json(pulled: &PulledManifests) -> anyhow::Result<()> {
    let output = Output {
        reference: &pulled.reference,
        main_manifest: &pulled.main_manifest,
        config: &pulled.config,
        nonlayers: &pulled.nonlayers,
        layers: &pulled.remote.descriptors,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn print_table(pulled: &PulledManifests) {
    println!("{}", pulled.reference);

    let mut table = Table::new();
    table.load_preset(NOTHING);
    table.set_header(vec!["KIND", "MEDIA TYPE", "DIGEST", "SIZE", "UNCOMPRESSED"]);

    for desc in &pulled.nonlayers {
        let kind = if desc.digest == pulled.main_manifest.digest {
            "root"
        } else if desc.digest == pulled.config.digest {
            "config"
        } else {
            "manifest"
        };
        table.add_row(vec![
            kind.to_string(),
            desc.media_type.clone(),
            desc.digest.clone(),
            desc.size.to_string(),
            String::new(),
        ]);
    }
    for desc in &pulled.remote.descriptors {
        table.add_row(vec![
            "layer".to_string(),
            desc.media_type.clone(),
            desc.digest.clone(),
            desc.size.to_string(),
            desc.annotation(UNCOMPRESSED).unwrap_or_default().to_string(),
        ]);
    }
    println!("{table}");
}
