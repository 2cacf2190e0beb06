//! [`Resolver`] and [`Fetcher`] over an OCI distribution registry.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use oci_client::client::{ClientConfig, ClientProtocol};
use oci_client::manifest::OciDescriptor;
use oci_client::secrets::RegistryAuth;
use oci_client::{Client, Reference, RegistryOperation};

use super::{BlobStream, Fetcher, Resolver};
use crate::images::{Descriptor, detect_manifest_media_type, media_types};
use crate::options::PullOptions;
use lazypull_shared::constants::media_types::{
    DOCKER_MANIFEST, DOCKER_MANIFEST_LIST, DOCKER_SCHEMA1_MANIFEST,
    DOCKER_SCHEMA1_MANIFEST_UNSIGNED, OCI_INDEX, OCI_MANIFEST,
};
use lazypull_shared::{LazypullError, LazypullResult};

/// Manifest types offered in the Accept header, preferred first.
const ACCEPTED_MANIFESTS: &[&str] = &[
    OCI_INDEX,
    DOCKER_MANIFEST_LIST,
    OCI_MANIFEST,
    DOCKER_MANIFEST,
    DOCKER_SCHEMA1_MANIFEST,
    DOCKER_SCHEMA1_MANIFEST_UNSIGNED,
];

#[derive(Clone)]
struct Credentials {
    username: Option<String>,
    password: Option<String>,
}

impl Credentials {
    fn auth(&self) -> RegistryAuth {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => {
                RegistryAuth::Basic(username.clone(), password.clone())
            }
            _ => RegistryAuth::Anonymous,
        }
    }
}

fn parse_reference(reference: &str) -> LazypullResult<Reference> {
    reference
        .parse()
        .map_err(|e: oci_client::ParseError| LazypullError::InvalidReference {
            reference: reference.to_string(),
            reason: e.to_string(),
        })
}

/// Resolves references against their registry with `oci-client`.
pub struct RegistryResolver {
    client: Arc<Client>,
    credentials: Credentials,
}

impl std::fmt::Debug for RegistryResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryResolver").finish()
    }
}

impl RegistryResolver {
    pub fn new(options: &PullOptions) -> Self {
        let protocol = if options.insecure_registries.is_empty() {
            ClientProtocol::Https
        } else {
            ClientProtocol::HttpsExcept(options.insecure_registries.clone())
        };
        Self {
            client: Arc::new(Client::new(ClientConfig {
                protocol,
                ..Default::default()
            })),
            credentials: Credentials {
                username: options.username.clone(),
                password: options.password.clone(),
            },
        }
    }
}

#[async_trait]
impl Resolver for RegistryResolver {
    async fn resolve(&self, reference: &str) -> LazypullResult<(String, Descriptor)> {
        let parsed = parse_reference(reference)?;
        tracing::info!(reference = %parsed.whole(), "Resolving image from registry");

        let (data, digest) = self
            .client
            .pull_manifest_raw(&parsed, &self.credentials.auth(), ACCEPTED_MANIFESTS)
            .await
            .map_err(|e| LazypullError::Resolve {
                reference: reference.to_string(),
                reason: e.to_string(),
            })?;
        let media_type = detect_manifest_media_type(&data)?;

        tracing::debug!(
            reference = %parsed.whole(),
            digest = %digest,
            media_type = %media_type,
            "Resolved reference"
        );
        Ok((parsed.whole(), Descriptor::new(media_type, digest, data.len() as i64)))
    }

    async fn fetcher(&self, reference: &str) -> LazypullResult<Arc<dyn Fetcher>> {
        Ok(Arc::new(RegistryFetcher {
            client: Arc::clone(&self.client),
            credentials: self.credentials.clone(),
            reference: parse_reference(reference)?,
        }))
    }
}

/// Fetches blobs of one repository.
pub struct RegistryFetcher {
    client: Arc<Client>,
    credentials: Credentials,
    reference: Reference,
}

impl RegistryFetcher {
    fn fetch_error(desc: &Descriptor, reason: impl std::fmt::Display) -> LazypullError {
        LazypullError::Fetch {
            digest: desc.digest.clone(),
            reason: reason.to_string(),
        }
    }
}

#[async_trait]
impl Fetcher for RegistryFetcher {
    async fn fetch(&self, desc: &Descriptor) -> LazypullResult<BlobStream> {
        let auth = self.credentials.auth();

        // Manifests live under /manifests, not /blobs.
        if media_types::is_manifest_like(&desc.media_type) {
            let pinned = Reference::with_digest(
                self.reference.registry().to_string(),
                self.reference.repository().to_string(),
                desc.digest.clone(),
            );
            let (data, _) = self
                .client
                .pull_manifest_raw(&pinned, &auth, ACCEPTED_MANIFESTS)
                .await
                .map_err(|e| Self::fetch_error(desc, e))?;
            let chunk: LazypullResult<Bytes> = Ok(Bytes::from(data));
            return Ok(futures::stream::iter([chunk]).boxed());
        }

        self.client
            .auth(&self.reference, &auth, RegistryOperation::Pull)
            .await
            .map_err(|e| Self::fetch_error(desc, e))?;

        let layer = OciDescriptor {
            media_type: desc.media_type.clone(),
            digest: desc.digest.clone(),
            size: desc.size,
            urls: desc.urls.clone(),
            annotations: None,
        };
        let stream = self
            .client
            .pull_blob_stream(&self.reference, &layer)
            .await
            .map_err(|e| Self::fetch_error(desc, e))?;

        let digest = desc.digest.clone();
        Ok(stream
            .map_err(move |e| LazypullError::Fetch {
                digest: digest.clone(),
                reason: e.to_string(),
            })
            .boxed())
    }
}
