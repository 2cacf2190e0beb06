//! Pairing manifest layers with the diff IDs from the image config.

use crate::content::Provider;
use crate::images::{Descriptor, config_diff_ids, manifest};
use crate::platforms::PlatformMatcher;
use lazypull_shared::constants::annotations::UNCOMPRESSED;
use lazypull_shared::{LazypullError, LazypullResult};

/// Layers of the manifest selected from `root`, each annotated with its
/// uncompressed digest.
pub async fn get_layers<P>(
    provider: &P,
    root: &Descriptor,
    matcher: &dyn PlatformMatcher,
) -> LazypullResult<Vec<Descriptor>>
where
    P: Provider + ?Sized,
{
    let manifest = manifest(provider, root, matcher).await?;
    let diff_ids = config_diff_ids(provider, &manifest.config).await?;
    annotate_layers(&manifest.layers, &diff_ids)
}

/// Set `containerd.io/uncompressed` on the i-th layer to the i-th diff ID.
///
/// Fails if the counts differ. Already annotated layers are overwritten, so
/// applying this twice yields the same result.
pub fn annotate_layers(
    layers: &[Descriptor],
    diff_ids: &[String],
) -> LazypullResult<Vec<Descriptor>> {
    if layers.len() != diff_ids.len() {
        return Err(LazypullError::LayerCountMismatch {
            diff_id_count: diff_ids.len(),
            layer_count: layers.len(),
            diff_ids: diff_ids.to_vec(),
            layers: layers.iter().map(|l| l.digest.clone()).collect(),
        });
    }

    Ok(layers
        .iter()
        .zip(diff_ids)
        .map(|(layer, diff_id)| {
            let mut layer = layer.clone();
            layer.set_annotation(UNCOMPRESSED, diff_id.clone());
            layer
        })
        .collect())
}
