//! Concurrent walk of the content graph.
//!
//! Siblings are visited concurrently. A visit holds a limiter permit only
//! while its handler runs, so deep graphs cannot starve the limiter. Each
//! digest is visited at most once per walk.

use std::collections::HashSet;

use futures::future::{BoxFuture, try_join_all};
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use super::descriptor::Descriptor;
use super::handlers::{Handler, Step};
use lazypull_shared::{LazypullError, LazypullResult};

/// Walk the graph below `roots`, calling `handler` once per distinct node.
///
/// The first handler error aborts the walk and is returned. Cancelling
/// `cancel` stops the walk with [`LazypullError::Cancelled`].
pub async fn dispatch<H>(
    handler: &H,
    limiter: Option<&Semaphore>,
    cancel: &CancellationToken,
    roots: Vec<Descriptor>,
) -> LazypullResult<()>
where
    H: Handler + ?Sized,
{
    let visited = Mutex::new(HashSet::new());
    let walk = Walk {
        handler,
        limiter,
        cancel,
        visited: &visited,
    };
    walk.visit_all(roots).await
}

struct Walk<'a, H: ?Sized> {
    handler: &'a H,
    limiter: Option<&'a Semaphore>,
    cancel: &'a CancellationToken,
    visited: &'a Mutex<HashSet<String>>,
}

impl<'a, H: Handler + ?Sized> Walk<'a, H> {
    fn visit_all(&'a self, descs: Vec<Descriptor>) -> BoxFuture<'a, LazypullResult<()>> {
        Box::pin(async move {
            let fresh: Vec<Descriptor> = descs
                .into_iter()
                .filter(|d| self.visited.lock().insert(d.digest.clone()))
                .collect();
            try_join_all(fresh.into_iter().map(|d| self.visit(d))).await?;
            Ok(())
        })
    }

    async fn visit(&'a self, desc: Descriptor) -> LazypullResult<()> {
        if self.cancel.is_cancelled() {
            return Err(LazypullError::Cancelled);
        }

        let step = {
            let _permit = match self.limiter {
                Some(limiter) => Some(tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Err(LazypullError::Cancelled),
                    permit = limiter.acquire() => permit.map_err(|_| {
                        LazypullError::Internal("dispatch limiter closed".into())
                    })?,
                }),
                None => None,
            };

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(LazypullError::Cancelled),
                step = self.handler.handle(&desc) => step?,
            }
        };

        match step {
            Step::Skip => Ok(()),
            Step::Children(children) if children.is_empty() => Ok(()),
            Step::Children(children) => {
                tracing::trace!(
                    digest = %desc.digest,
                    children = children.len(),
                    "Descending into children"
                );
                self.visit_all(children).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::images::descriptor::sha256_digest;
    use lazypull_shared::constants::media_types::*;

    /// Serves a fixed graph and counts visits per digest.
    struct Graph {
        edges: HashMap<String, Vec<Descriptor>>,
        visits: Mutex<HashMap<String, usize>>,
        active: AtomicUsize,
        peak: AtomicUsize,
        delay: Duration,
    }

    impl Graph {
        fn new(edges: HashMap<String, Vec<Descriptor>>) -> Self {
            Self {
                edges,
                visits: Mutex::new(HashMap::new()),
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                delay: Duration::from_millis(0),
            }
        }
    }

    #[async_trait]
    impl Handler for Graph {
        async fn handle(&self, desc: &Descriptor) -> LazypullResult<Step> {
            *self.visits.lock().entry(desc.digest.clone()).or_default() += 1;
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            if desc.media_type == "fail" {
                return Err(LazypullError::Fetch {
                    digest: desc.digest.clone(),
                    reason: "boom".into(),
                });
            }
            Ok(Step::Children(
                self.edges.get(&desc.digest).cloned().unwrap_or_default(),
            ))
        }
    }

    fn node(media_type: &str, name: &str) -> Descriptor {
        Descriptor::new(media_type, sha256_digest(name.as_bytes()), 1)
    }

    #[tokio::test]
    async fn test_shared_children_visited_once() {
        let root = node(OCI_INDEX, "root");
        let a = node(OCI_MANIFEST, "a");
        let b = node(OCI_MANIFEST, "b");
        let shared = node(OCI_CONFIG, "shared");

        let mut edges = HashMap::new();
        edges.insert(root.digest.clone(), vec![a.clone(), b.clone()]);
        edges.insert(a.digest.clone(), vec![shared.clone()]);
        edges.insert(b.digest.clone(), vec![shared.clone()]);
        let graph = Graph::new(edges);

        dispatch(&graph, None, &CancellationToken::new(), vec![root])
            .await
            .unwrap();

        let visits = graph.visits.lock();
        assert_eq!(visits.len(), 4);
        assert!(visits.values().all(|&n| n == 1));
    }

    #[tokio::test]
    async fn test_limiter_bounds_concurrency() {
        let root = node(OCI_MANIFEST, "root");
        let leaves: Vec<Descriptor> = (0..8).map(|i| node(OCI_CONFIG, &format!("leaf{i}"))).collect();
        let mut edges = HashMap::new();
        edges.insert(root.digest.clone(), leaves);
        let mut graph = Graph::new(edges);
        graph.delay = Duration::from_millis(10);

        let limiter = Semaphore::new(2);
        dispatch(&graph, Some(&limiter), &CancellationToken::new(), vec![root])
            .await
            .unwrap();

        assert!(graph.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(graph.visits.lock().len(), 9);
    }

    #[tokio::test]
    async fn test_handler_error_aborts_walk() {
        let root = node(OCI_MANIFEST, "root");
        let mut edges = HashMap::new();
        edges.insert(root.digest.clone(), vec![node("fail", "bad")]);
        let graph = Graph::new(edges);

        let err = dispatch(&graph, None, &CancellationToken::new(), vec![root])
            .await
            .unwrap_err();
        assert!(matches!(err, LazypullError::Fetch { .. }));
    }

    #[tokio::test]
    async fn test_cancelled_walk_stops() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let graph = Arc::new(Graph::new(HashMap::new()));

        let err = dispatch(graph.as_ref(), None, &cancel, vec![node(OCI_MANIFEST, "root")])
            .await
            .unwrap_err();
        assert_eq!(err, LazypullError::Cancelled);
        assert!(graph.visits.lock().is_empty());
    }
}
