//! # Iterative lookup
//!
//! A bounded-parallelism, narrowing search over the overlay: seeded from
//! the local routing table, it repeatedly queries the closest unvisited
//! candidates for "hosts near the target, no farther than my current
//! worst result", merging anything closer into the candidate queue.
//!
//! The search terminates when the queue is exhausted, the exact target
//! id turns up, a caller-supplied [`LookupFilter`] reports `Done`, or
//! the lookup is canceled. Waiters block on [`LookupHandle::wait`],
//! optionally with a timeout.
//!
//! The remote side of a query lives behind [`LookupNetwork`]; the node
//! implements it with a real connect-and-ask, tests with an in-process
//! registry.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tokio::time::Duration;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::identity::{distance_cmp, NodeId};
use crate::peers::Host;

/// Default bounded result set size (N).
pub const DEFAULT_RESULT_COUNT: usize = 20;

/// Default worker parallelism (P).
pub const DEFAULT_PARALLELISM: usize = 3;

/// Ceiling on narrowing rounds; a healthy search converges long before.
const MAX_ROUNDS: usize = 32;

/// Verdict from a [`LookupFilter`] about one candidate peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterVerdict {
    /// Query the peer and keep narrowing.
    Continue,
    /// Ignore this peer entirely; keep narrowing without it.
    Skip,
    /// The search is satisfied; stop and surface this peer first.
    Done,
}

/// Extension hook invoked for every candidate before it is queried.
/// Lets callers express conditions like "does this peer host chunk X"
/// as a stopping rule.
#[async_trait]
pub trait LookupFilter: Send + Sync + 'static {
    async fn inspect(&self, id: &NodeId, host: &Host) -> FilterVerdict;
}

/// Remote query surface the lookup drives. Implementations establish a
/// session with the host first (handshake, NAT relay if flagged).
#[async_trait]
pub trait LookupNetwork: Send + Sync + 'static {
    async fn query(
        &self,
        host: &Host,
        target: NodeId,
        n: u32,
        limit: Option<NodeId>,
    ) -> Result<Vec<Host>>;
}

#[derive(Clone)]
pub struct LookupOptions {
    pub result_count: usize,
    pub parallelism: usize,
    pub per_query_timeout: Duration,
    pub filter: Option<Arc<dyn LookupFilter>>,
}

impl Default for LookupOptions {
    fn default() -> Self {
        Self {
            result_count: DEFAULT_RESULT_COUNT,
            parallelism: DEFAULT_PARALLELISM,
            per_query_timeout: Duration::from_secs(3),
            filter: None,
        }
    }
}

/// Handle on a running lookup.
pub struct LookupHandle {
    done_rx: oneshot::Receiver<Result<Vec<Host>>>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

impl LookupHandle {
    /// Start a lookup over `network`, seeded with the local table's
    /// nearest known hosts.
    pub fn spawn<N: LookupNetwork>(
        network: Arc<N>,
        self_id: NodeId,
        target: NodeId,
        seeds: Vec<Host>,
        options: LookupOptions,
    ) -> Self {
        let (done_tx, done_rx) = oneshot::channel();
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        tokio::spawn(async move {
            let result = tokio::select! {
                result = run_lookup(network, self_id, target, seeds, options) => result,
                _ = cancel_rx => {
                    debug!(%target, "lookup canceled");
                    Err(Error::Canceled)
                }
            };
            let _ = done_tx.send(result);
        });
        Self {
            done_rx,
            cancel_tx: Some(cancel_tx),
        }
    }

    /// Halt outstanding workers without waiting for in-flight queries.
    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel_tx.take() {
            let _ = cancel.send(());
        }
    }

    /// Block until the search finishes.
    pub async fn wait(self) -> Result<Vec<Host>> {
        self.done_rx.await.map_err(|_| Error::Canceled)?
    }

    /// Block until the search finishes or `timeout` elapses. The search
    /// itself keeps running on timeout; cancel it explicitly if the
    /// result is no longer wanted.
    pub async fn wait_timeout(self, timeout: Duration) -> Result<Vec<Host>> {
        match tokio::time::timeout(timeout, self.done_rx).await {
            Ok(result) => result.map_err(|_| Error::Canceled)?,
            Err(_) => Err(Error::LookupTimeout),
        }
    }
}

enum WorkerOutcome {
    Found { host: Host, neighbors: Vec<Host> },
    Satisfied(Host),
    Skipped(NodeId),
    DeadEnd(NodeId),
}

async fn run_lookup<N: LookupNetwork>(
    network: Arc<N>,
    self_id: NodeId,
    target: NodeId,
    seeds: Vec<Host>,
    options: LookupOptions,
) -> Result<Vec<Host>> {
    let n = options.result_count.max(1);
    let parallelism = options.parallelism.max(1);

    let mut shortlist: Vec<Host> = Vec::new();
    let mut seen: HashSet<NodeId> = HashSet::new();
    let mut queried: HashSet<NodeId> = HashSet::new();
    for host in seeds {
        if host.id != self_id && seen.insert(host.id) {
            shortlist.push(host);
        }
    }
    sort_by_distance(&mut shortlist, &target);

    for round in 0..MAX_ROUNDS {
        if let Some(found) = shortlist.iter().position(|h| h.id == target) {
            // Exact target known: surface it first and stop.
            let host = shortlist.remove(found);
            shortlist.insert(0, host);
            shortlist.truncate(n);
            trace!(%target, round, "exact target found");
            return Ok(shortlist);
        }

        let batch: Vec<Host> = shortlist
            .iter()
            .filter(|h| !queried.contains(&h.id))
            .take(parallelism)
            .cloned()
            .collect();
        if batch.is_empty() {
            break;
        }
        for host in &batch {
            queried.insert(host.id);
        }

        // Ask for nothing farther than our current worst result.
        let limit = if shortlist.len() >= n {
            shortlist.get(n - 1).map(|h| h.id)
        } else {
            None
        };

        let mut workers = JoinSet::new();
        for host in batch {
            let network = network.clone();
            let filter = options.filter.clone();
            let per_query_timeout = options.per_query_timeout;
            workers.spawn(async move {
                if let Some(filter) = &filter {
                    match filter.inspect(&host.id, &host).await {
                        FilterVerdict::Continue => {}
                        FilterVerdict::Skip => return WorkerOutcome::Skipped(host.id),
                        FilterVerdict::Done => return WorkerOutcome::Satisfied(host),
                    }
                }
                let query = network.query(&host, target, n as u32, limit);
                match tokio::time::timeout(per_query_timeout, query).await {
                    Ok(Ok(neighbors)) => WorkerOutcome::Found { host, neighbors },
                    Ok(Err(_)) | Err(_) => WorkerOutcome::DeadEnd(host.id),
                }
            });
        }

        let mut satisfied = None;
        while let Some(joined) = workers.join_next().await {
            let Ok(outcome) = joined else { continue };
            match outcome {
                WorkerOutcome::Found { host: _, neighbors } => {
                    for neighbor in neighbors {
                        if neighbor.id != self_id && seen.insert(neighbor.id) {
                            shortlist.push(neighbor);
                        }
                    }
                }
                WorkerOutcome::Satisfied(host) => satisfied = Some(host),
                WorkerOutcome::Skipped(id) | WorkerOutcome::DeadEnd(id) => {
                    shortlist.retain(|h| h.id != id);
                }
            }
        }

        if let Some(host) = satisfied {
            shortlist.retain(|h| h.id != host.id);
            shortlist.insert(0, host);
            shortlist.truncate(n);
            trace!(%target, round, "filter satisfied the search");
            return Ok(shortlist);
        }

        sort_by_distance(&mut shortlist, &target);
        // The queue is bounded: anything beyond the worst of N results
        // plus the unvisited frontier is never queried, so trim to keep
        // memory flat. Unqueried entries past N are still dead ends.
        if shortlist.len() > n {
            let keep_from_tail: Vec<Host> = shortlist[n..]
                .iter()
                .filter(|h| !queried.contains(&h.id))
                .take(n)
                .cloned()
                .collect();
            shortlist.truncate(n);
            shortlist.extend(keep_from_tail);
        }
    }

    sort_by_distance(&mut shortlist, &target);
    shortlist.truncate(n);
    debug!(%target, results = shortlist.len(), queried = queried.len(), "lookup finished");
    Ok(shortlist)
}

fn sort_by_distance(hosts: &mut [Host], target: &NodeId) {
    hosts.sort_by(|a, b| {
        let da = a.id.xor_distance(target);
        let db = b.id.xor_distance(target);
        distance_cmp(&da, &db)
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::test_util::make_identity;
    use std::collections::HashMap;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    fn host(index: u32) -> Host {
        let id = make_identity(index).id();
        let addr: SocketAddr = format!("10.0.0.{}:9000", (index % 250) + 1).parse().unwrap();
        Host::new(id, addr)
    }

    /// In-process network: every node knows a fixed neighbor list and
    /// answers queries with its `n` closest, honoring the limit.
    #[derive(Default)]
    struct TestNetwork {
        nodes: Mutex<HashMap<NodeId, Vec<Host>>>,
        failures: Mutex<HashSet<NodeId>>,
        delay: Option<Duration>,
        queries: AtomicUsize,
    }

    impl TestNetwork {
        async fn add_node(&self, node: Host, neighbors: Vec<Host>) {
            self.nodes.lock().await.insert(node.id, neighbors);
        }

        async fn fail(&self, id: NodeId) {
            self.failures.lock().await.insert(id);
        }
    }

    #[async_trait]
    impl LookupNetwork for TestNetwork {
        async fn query(
            &self,
            host: &Host,
            target: NodeId,
            n: u32,
            limit: Option<NodeId>,
        ) -> Result<Vec<Host>> {
            self.queries.fetch_add(1, Ordering::Relaxed);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.failures.lock().await.contains(&host.id) {
                return Err(Error::NoSuchConnection);
            }
            let nodes = self.nodes.lock().await;
            let Some(neighbors) = nodes.get(&host.id) else {
                return Err(Error::NoSuchConnection);
            };
            let mut result = neighbors.clone();
            sort_by_distance(&mut result, &target);
            if let Some(limit) = limit {
                let limit_dist = limit.xor_distance(&target);
                result.retain(|h| {
                    distance_cmp(&h.id.xor_distance(&target), &limit_dist)
                        != std::cmp::Ordering::Greater
                });
            }
            result.truncate(n as usize);
            Ok(result)
        }
    }

    fn options(n: usize, p: usize) -> LookupOptions {
        LookupOptions {
            result_count: n,
            parallelism: p,
            per_query_timeout: Duration::from_millis(500),
            filter: None,
        }
    }

    /// A host with a hand-picked id so distances to the target are
    /// strictly decreasing along the chain.
    fn host_with_low_byte(byte: u8, port: u16) -> Host {
        let mut id = [0u8; crate::identity::ID_LEN];
        id[crate::identity::ID_LEN - 1] = byte;
        Host::new(
            NodeId::from_bytes(id),
            format!("10.0.1.1:{port}").parse().unwrap(),
        )
    }

    #[tokio::test]
    async fn single_worker_finds_exact_target_through_a_chain() {
        // self -> h1 -> h2 -> target: each hop only known to the
        // previous one, each strictly closer to the target.
        let network = Arc::new(TestNetwork::default());
        let target_host = host_with_low_byte(0x01, 9003);
        let h2 = host_with_low_byte(0x03, 9002); // distance 2
        let h1 = host_with_low_byte(0x07, 9001); // distance 6
        network.add_node(h1.clone(), vec![h2.clone()]).await;
        network.add_node(h2.clone(), vec![target_host.clone()]).await;
        network.add_node(target_host.clone(), vec![]).await;

        let self_id = make_identity(0).id();
        let handle = LookupHandle::spawn(
            network,
            self_id,
            target_host.id,
            vec![h1.clone()],
            options(1, 1),
        );
        let results = handle.wait().await.expect("lookup completes");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, target_host.id);
    }

    #[tokio::test]
    async fn small_network_terminates_with_every_reachable_node() {
        // 8 nodes that all know each other; the initiator only knows two.
        let network = Arc::new(TestNetwork::default());
        let hosts: Vec<Host> = (1..=8).map(host).collect();
        for h in &hosts {
            let neighbors: Vec<Host> = hosts.iter().filter(|o| o.id != h.id).cloned().collect();
            network.add_node(h.clone(), neighbors).await;
        }

        let self_id = make_identity(0).id();
        let target = make_identity(99).id();
        let handle = LookupHandle::spawn(
            network,
            self_id,
            target,
            hosts[..2].to_vec(),
            options(20, 3),
        );
        let results = tokio::time::timeout(Duration::from_secs(5), handle.wait())
            .await
            .expect("terminates on a small network")
            .expect("lookup completes");
        assert_eq!(results.len(), 8);
    }

    #[tokio::test]
    async fn dead_candidates_are_dead_ends_not_errors() {
        let network = Arc::new(TestNetwork::default());
        let hosts: Vec<Host> = (1..=4).map(host).collect();
        for h in &hosts {
            let neighbors: Vec<Host> = hosts.iter().filter(|o| o.id != h.id).cloned().collect();
            network.add_node(h.clone(), neighbors).await;
        }
        network.fail(hosts[0].id).await;

        let self_id = make_identity(0).id();
        let target = make_identity(50).id();
        let handle = LookupHandle::spawn(
            network,
            self_id,
            target,
            hosts.to_vec(),
            options(20, 2),
        );
        let results = handle.wait().await.expect("lookup completes");
        // The dead node is dropped; the rest are returned.
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|h| h.id != hosts[0].id));
    }

    #[tokio::test]
    async fn filter_done_stops_the_search_with_that_host_first() {
        let network = Arc::new(TestNetwork::default());
        let hosts: Vec<Host> = (1..=6).map(host).collect();
        for h in &hosts {
            let neighbors: Vec<Host> = hosts.iter().filter(|o| o.id != h.id).cloned().collect();
            network.add_node(h.clone(), neighbors).await;
        }

        struct WantOne(NodeId);
        #[async_trait]
        impl LookupFilter for WantOne {
            async fn inspect(&self, id: &NodeId, _host: &Host) -> FilterVerdict {
                if *id == self.0 {
                    FilterVerdict::Done
                } else {
                    FilterVerdict::Continue
                }
            }
        }

        let wanted = hosts[3].id;
        let mut opts = options(20, 2);
        opts.filter = Some(Arc::new(WantOne(wanted)));

        let self_id = make_identity(0).id();
        let target = make_identity(77).id();
        let handle = LookupHandle::spawn(network, self_id, target, hosts.to_vec(), opts);
        let results = handle.wait().await.expect("lookup completes");
        assert_eq!(results[0].id, wanted);
    }

    #[tokio::test]
    async fn cancel_halts_a_slow_search() {
        let mut network = TestNetwork::default();
        network.delay = Some(Duration::from_secs(30));
        let network = Arc::new(network);
        let h = host(1);
        network.add_node(h.clone(), vec![]).await;

        let self_id = make_identity(0).id();
        let target = make_identity(9).id();
        let mut handle =
            LookupHandle::spawn(network, self_id, target, vec![h], options(1, 1));
        handle.cancel();
        let result = tokio::time::timeout(Duration::from_secs(1), handle.wait())
            .await
            .expect("cancel is prompt");
        assert!(matches!(result, Err(Error::Canceled)));
    }

    #[tokio::test]
    async fn wait_timeout_reports_without_killing_the_search() {
        let mut network = TestNetwork::default();
        network.delay = Some(Duration::from_millis(400));
        let network = Arc::new(network);
        let h = host(1);
        network.add_node(h.clone(), vec![]).await;

        let self_id = make_identity(0).id();
        let target = make_identity(9).id();
        let handle = LookupHandle::spawn(network, self_id, target, vec![h], options(1, 1));
        let result = handle.wait_timeout(Duration::from_millis(50)).await;
        assert!(matches!(result, Err(Error::LookupTimeout)));
    }
}
