//! LazyPull: pull an OCI image's metadata now, its layers later.
//!
//! A [`Puller`] resolves a reference, copies the index, manifest and config
//! blobs into a [`ContentStore`], and returns the layer descriptors together
//! with a [`Provider`] that streams layer content from the registry only
//! when someone reads it.
//!
//! ```ignore
//! let store = Arc::new(MemoryStore::new());
//! let resolver = Arc::new(RegistryResolver::new(&options));
//! let puller = Arc::new(Puller::from_options(store, resolver, reference, options)?);
//!
//! let pulled = puller.pull_manifests(&CancellationToken::new()).await?;
//! for layer in &pulled.remote.descriptors {
//!     let reader = pulled.remote.provider.reader_at(layer).await?;
//! }
//! ```

pub mod content;
pub mod images;
pub mod options;
pub mod platforms;
pub mod pull;
pub mod remotes;

pub use content::{ContentStore, MemoryStore, Provider, ReaderAt};
pub use images::Descriptor;
pub use options::PullOptions;
pub use platforms::{Only, Platform, PlatformMatcher};
pub use pull::{PulledManifests, Puller, Remote};
pub use remotes::{Fetcher, RegistryResolver, Resolver};

pub use lazypull_shared::{LazypullError, LazypullResult};
