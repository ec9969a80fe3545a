//! # Iterative Lookups
//!
//! Node and value lookups converge on the k nodes closest to a target by
//! querying at most `alpha` new nodes per round and merging every answer
//! into a distance-ordered [`Shortlist`].
//!
//! ## Termination
//!
//! - Node lookup: once a round brings no node closer than the best one
//!   known before it, one final round queries every node in the best-k
//!   view not yet contacted, then the lookup ends.
//! - Value lookup: ends on the first round in which any node answers with
//!   the value, or when the whole best-k view has been contacted.
//! - Both are bounded by `max_lookup_rounds`.
//!
//! Nodes that fail to answer are dropped from the shortlist and never
//! re-added during the same lookup.

use std::collections::HashSet;

use anyhow::Result;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::dht::DhtNode;
use crate::identity::{Contact, Distance, Key, NodeId, distance_cmp};
use crate::protocols::{DhtNodeRpc, FindValueResult};

#[derive(Clone, Debug)]
struct Candidate {
    contact: Contact,
    distance: Distance,
    /// Arrival order; breaks distance ties in favor of earlier-seen nodes.
    seq: u64,
}

/// Candidates of one lookup, ordered by distance to the target.
///
/// All candidates are kept, but only the nearest `capacity` form the view
/// that is queried and returned.
#[derive(Debug)]
pub(crate) struct Shortlist {
    target: NodeId,
    local_id: NodeId,
    capacity: usize,
    entries: Vec<Candidate>,
    contacted: HashSet<NodeId>,
    failed: HashSet<NodeId>,
    next_seq: u64,
}

impl Shortlist {
    pub(crate) fn new(target: NodeId, local_id: NodeId, capacity: usize) -> Self {
        Self {
            target,
            local_id,
            capacity: capacity.max(1),
            entries: Vec::new(),
            contacted: HashSet::new(),
            failed: HashSet::new(),
            next_seq: 0,
        }
    }

    pub(crate) fn push(&mut self, contacts: impl IntoIterator<Item = Contact>) {
        for contact in contacts {
            if contact.id == self.local_id
                || self.failed.contains(&contact.id)
                || self.entries.iter().any(|c| c.contact.id == contact.id)
            {
                continue;
            }
            let candidate = Candidate {
                distance: contact.distance_to(&self.target),
                contact,
                seq: self.next_seq,
            };
            self.next_seq += 1;
            let pos = self.entries.partition_point(|existing| {
                distance_cmp(&existing.distance, &candidate.distance)
                    .then(existing.seq.cmp(&candidate.seq))
                    .is_lt()
            });
            self.entries.insert(pos, candidate);
        }
    }

    fn view(&self) -> impl Iterator<Item = &Candidate> {
        self.entries.iter().take(self.capacity)
    }

    /// Up to `count` uncontacted nodes of the view, nearest first.
    pub(crate) fn uncontacted(&self, count: usize) -> Vec<Contact> {
        self.view()
            .filter(|c| !self.contacted.contains(&c.contact.id))
            .take(count)
            .map(|c| c.contact)
            .collect()
    }

    pub(crate) fn mark_contacted(&mut self, contact: &Contact) {
        self.contacted.insert(contact.id);
    }

    /// Forget a node that failed to answer.
    pub(crate) fn remove(&mut self, id: &NodeId) {
        self.failed.insert(*id);
        self.entries.retain(|c| c.contact.id != *id);
    }

    pub(crate) fn closest_distance(&self) -> Option<Distance> {
        self.entries.first().map(|c| c.distance)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The view, nearest first.
    pub(crate) fn contacts(&self) -> Vec<Contact> {
        self.view().map(|c| c.contact).collect()
    }
}

fn improved(before: Option<Distance>, after: Option<Distance>) -> bool {
    match (before, after) {
        (None, Some(_)) => true,
        (Some(before), Some(after)) => distance_cmp(&after, &before).is_lt(),
        _ => false,
    }
}

async fn seed_shortlist<N: DhtNodeRpc>(
    node: &DhtNode<N>,
    target: NodeId,
    seeds: Vec<Contact>,
) -> Shortlist {
    let k = node.config().k;
    let mut shortlist = Shortlist::new(target, node.id(), k);
    shortlist.push(node.find_neighbors(target, k).await);
    shortlist.push(seeds);
    shortlist
}

/// Query `batch` in parallel, returning results in batch order.
async fn fan_out<N, T, F, Fut>(node: &DhtNode<N>, batch: &[Contact], call: F) -> Vec<(Contact, Result<T>)>
where
    N: DhtNodeRpc,
    T: Send + 'static,
    F: Fn(DhtNode<N>, Contact) -> Fut,
    Fut: std::future::Future<Output = Result<T>> + Send + 'static,
{
    let mut join_set = JoinSet::new();
    for (idx, contact) in batch.iter().copied().enumerate() {
        let fut = call(node.clone(), contact);
        join_set.spawn(async move { (idx, fut.await) });
    }

    let mut results: Vec<Option<Result<T>>> = Vec::with_capacity(batch.len());
    results.resize_with(batch.len(), || None);
    while let Some(joined) = join_set.join_next().await {
        if let Ok((idx, result)) = joined {
            results[idx] = Some(result);
        }
    }

    batch
        .iter()
        .copied()
        .zip(results)
        .filter_map(|(contact, result)| result.map(|r| (contact, r)))
        .collect()
}

/// Converge on the k closest live nodes to `target`.
pub(crate) async fn find_node<N: DhtNodeRpc>(
    node: &DhtNode<N>,
    target: NodeId,
    seeds: Vec<Contact>,
) -> Result<Vec<Contact>> {
    let alpha = node.config().alpha;
    let max_rounds = node.config().max_lookup_rounds;
    let mut shortlist = seed_shortlist(node, target, seeds).await;
    if shortlist.is_empty() {
        debug!(
            target = ?hex::encode(&target.as_bytes()[..8]),
            "node lookup has no starting contacts"
        );
        return Ok(Vec::new());
    }

    let mut final_sweep = false;
    let mut rounds = 0;
    loop {
        if rounds >= max_rounds {
            warn!(
                target = ?hex::encode(&target.as_bytes()[..8]),
                rounds,
                "node lookup exceeded max rounds"
            );
            break;
        }

        let count = if final_sweep { usize::MAX } else { alpha };
        let batch = shortlist.uncontacted(count);
        if batch.is_empty() {
            break;
        }
        rounds += 1;
        for contact in &batch {
            shortlist.mark_contacted(contact);
        }

        let before = shortlist.closest_distance();
        let results = fan_out(node, &batch, |this, contact| async move {
            this.rpc_find_node(&contact, target).await
        })
        .await;

        for (contact, result) in results {
            match result {
                Ok(nodes) => shortlist.push(nodes),
                Err(_) => shortlist.remove(&contact.id),
            }
        }

        if final_sweep {
            break;
        }
        if !improved(before, shortlist.closest_distance()) {
            final_sweep = true;
        }
    }

    let closest = shortlist.contacts();
    debug!(
        target = ?hex::encode(&target.as_bytes()[..8]),
        rounds,
        found = closest.len(),
        "node lookup complete"
    );
    Ok(closest)
}

/// Locate the value stored under `key`.
///
/// On success the value is also stored on the closest queried node that
/// did not have it.
pub(crate) async fn find_value<N: DhtNodeRpc>(
    node: &DhtNode<N>,
    key: Key,
) -> Result<Option<Vec<u8>>> {
    let target = NodeId::from(key);
    let alpha = node.config().alpha;
    let max_rounds = node.config().max_lookup_rounds;
    let mut shortlist = seed_shortlist(node, target, Vec::new()).await;

    let mut nearest_without_value: Option<Contact> = None;
    let mut rounds = 0;
    loop {
        if rounds >= max_rounds {
            warn!(
                key = hex::encode(&key[..8]),
                rounds,
                "value lookup exceeded max rounds"
            );
            return Ok(None);
        }

        let batch = shortlist.uncontacted(alpha);
        if batch.is_empty() {
            break;
        }
        rounds += 1;
        for contact in &batch {
            shortlist.mark_contacted(contact);
        }

        let results = fan_out(node, &batch, |this, contact| async move {
            this.rpc_find_value(&contact, key).await
        })
        .await;

        let mut found: Vec<Vec<u8>> = Vec::new();
        for (contact, result) in results {
            match result {
                Ok(FindValueResult::Value(value)) => found.push(value),
                Ok(FindValueResult::Nodes(nodes)) => {
                    let closer = nearest_without_value.is_none_or(|current| {
                        distance_cmp(&contact.distance_to(&target), &current.distance_to(&target))
                            .is_lt()
                    });
                    if closer {
                        nearest_without_value = Some(contact);
                    }
                    shortlist.push(nodes);
                }
                Err(_) => shortlist.remove(&contact.id),
            }
        }

        if !found.is_empty() {
            let value = most_common(&key, found);
            if let Some(peer) = nearest_without_value
                && let Err(e) = node.rpc_store(&peer, key, value.clone()).await
            {
                debug!(
                    key = hex::encode(&key[..8]),
                    peer = ?hex::encode(&peer.id.as_bytes()[..8]),
                    error = %e,
                    "cache-on-path store failed"
                );
            }
            debug!(key = hex::encode(&key[..8]), rounds, "value lookup hit");
            return Ok(Some(value));
        }
    }

    debug!(key = hex::encode(&key[..8]), rounds, "value not found");
    Ok(None)
}

/// The most frequent value; ties keep the one seen first.
fn most_common(key: &Key, values: Vec<Vec<u8>>) -> Vec<u8> {
    let mut tally: Vec<(Vec<u8>, usize)> = Vec::new();
    for value in values {
        match tally.iter_mut().find(|(seen, _)| *seen == value) {
            Some((_, count)) => *count += 1,
            None => tally.push((value, 1)),
        }
    }

    if tally.len() > 1 {
        warn!(
            key = hex::encode(&key[..8]),
            variants = tally.len(),
            "lookup returned conflicting values"
        );
    }

    let mut best: Option<(Vec<u8>, usize)> = None;
    for (value, count) in tally {
        if best.as_ref().is_none_or(|(_, best_count)| count > *best_count) {
            best = Some((value, count));
        }
    }
    best.map(|(value, _)| value).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddr};
    use std::sync::Arc;

    use crate::config::DhtConfig;
    use crate::test_support::{NetworkRegistry, TestNode, test_config};

    fn contact(first_byte: u8, port: u16) -> Contact {
        let mut bytes = [0u8; 20];
        bytes[0] = first_byte;
        Contact::new(
            NodeId::from_bytes(bytes),
            SocketAddr::from((Ipv4Addr::LOCALHOST, port)),
        )
    }

    fn sorted_by_distance(mut contacts: Vec<Contact>, target: &NodeId) -> Vec<Contact> {
        contacts.sort_by(|a, b| distance_cmp(&a.distance_to(target), &b.distance_to(target)));
        contacts
    }

    #[test]
    fn shortlist_orders_dedups_and_bounds_view() {
        let target = NodeId::from_bytes([0u8; 20]);
        let local = NodeId::from_bytes([0xFF; 20]);
        let mut list = Shortlist::new(target, local, 2);

        let far = contact(0x80, 1);
        let near = contact(0x01, 2);
        let mid = contact(0x10, 3);
        list.push([far, near, near, mid, Contact::new(local, far.addr)]);

        assert_eq!(list.contacts(), vec![near, mid]);
        assert_eq!(list.uncontacted(5), vec![near, mid]);

        list.mark_contacted(&near);
        assert_eq!(list.uncontacted(5), vec![mid]);

        list.remove(&mid.id);
        list.push([mid]);
        assert_eq!(list.contacts(), vec![near, far]);
        assert_eq!(list.closest_distance(), Some(near.distance_to(&target)));
    }

    #[test]
    fn duplicate_ids_keep_first_arrival() {
        let target = NodeId::from_bytes([0u8; 20]);
        let mut list = Shortlist::new(target, NodeId::random(), 4);
        let first = contact(0x20, 1);
        // Same id, different address: deduplicated by id.
        let duplicate = contact(0x20, 2);
        let second = contact(0x21, 3);
        list.push([second, first, duplicate]);
        assert_eq!(list.contacts(), vec![first, second]);
    }

    #[test]
    fn most_common_value_wins_with_first_seen_tiebreak() {
        let key = [0u8; 20];
        assert_eq!(
            most_common(&key, vec![b"b".to_vec(), b"a".to_vec(), b"a".to_vec()]),
            b"a".to_vec()
        );
        assert_eq!(
            most_common(&key, vec![b"x".to_vec(), b"y".to_vec()]),
            b"x".to_vec()
        );
    }

    #[tokio::test]
    async fn node_lookup_finds_all_peers_in_small_network() {
        let registry = Arc::new(NetworkRegistry::default());
        let nodes = TestNode::mesh(registry.clone(), 12, test_config()).await;
        let searcher = &nodes[11];
        let target = NodeId::random();

        let found = searcher.node.iterative_find_node(target).await.unwrap();
        let expected = sorted_by_distance(
            nodes[..11].iter().map(TestNode::contact).collect(),
            &target,
        );
        assert_eq!(found, expected);
    }

    #[tokio::test]
    async fn node_lookup_returns_at_most_k_sorted() {
        let registry = Arc::new(NetworkRegistry::default());
        let config = DhtConfig { k: 4, ..test_config() };
        let nodes = TestNode::mesh(registry.clone(), 10, config).await;
        let target = NodeId::random();

        let found = nodes[0].node.iterative_find_node(target).await.unwrap();
        assert_eq!(found.len(), 4);
        assert_eq!(found, sorted_by_distance(found.clone(), &target));
    }

    #[tokio::test]
    async fn node_lookup_drops_unresponsive_nodes() {
        let registry = Arc::new(NetworkRegistry::default());
        let nodes = TestNode::mesh(registry.clone(), 8, test_config()).await;
        let searcher = &nodes[0];
        let dead = nodes[3].contact();
        searcher.network.set_failure(dead.addr, true).await;

        let found = searcher.node.iterative_find_node(dead.id).await.unwrap();
        assert!(!found.contains(&dead));
        assert_eq!(found.len(), 6);
    }

    #[tokio::test]
    async fn lookup_without_contacts_is_empty() {
        let registry = Arc::new(NetworkRegistry::default());
        let lonely = TestNode::new(registry.clone(), 1, test_config()).await;
        assert!(lonely.node.iterative_find_node(NodeId::random()).await.unwrap().is_empty());
        assert_eq!(lonely.node.iterative_find_value([1u8; 20]).await.unwrap(), None);
    }

    #[tokio::test]
    async fn value_lookup_caches_on_closest_node_without_value() {
        let registry = Arc::new(NetworkRegistry::default());
        let nodes = TestNode::mesh(registry.clone(), 8, test_config()).await;
        let searcher = &nodes[0];
        let holder = &nodes[4];
        let key = *holder.contact().id.as_bytes();
        holder.node.store_local(key, b"payload".to_vec()).await;

        let value = searcher.node.iterative_find_value(key).await.unwrap();
        assert_eq!(value, Some(b"payload".to_vec()));

        let target = NodeId::from(key);
        let others = sorted_by_distance(
            nodes[1..]
                .iter()
                .map(TestNode::contact)
                .filter(|c| c.id != holder.contact().id)
                .collect(),
            &target,
        );
        let stores = searcher.network.store_calls().await;
        assert_eq!(stores.len(), 1);
        assert_eq!(stores[0].0, others[0]);
        assert_eq!(stores[0].1, key);
    }

    #[tokio::test]
    async fn value_lookup_prefers_majority_value() {
        let registry = Arc::new(NetworkRegistry::default());
        let nodes = TestNode::mesh(registry.clone(), 8, test_config()).await;
        let searcher = &nodes[0];
        let key = [0x42u8; 20];
        let target = NodeId::from(key);

        let mut holders: Vec<&TestNode> = nodes[1..].iter().collect();
        holders.sort_by(|a, b| {
            distance_cmp(&a.contact().distance_to(&target), &b.contact().distance_to(&target))
        });
        holders[0].node.store_local(key, b"minority".to_vec()).await;
        holders[1].node.store_local(key, b"majority".to_vec()).await;
        holders[2].node.store_local(key, b"majority".to_vec()).await;

        let value = searcher.node.iterative_find_value(key).await.unwrap();
        assert_eq!(value, Some(b"majority".to_vec()));
    }

    #[tokio::test]
    async fn missing_value_returns_none() {
        let registry = Arc::new(NetworkRegistry::default());
        let nodes = TestNode::mesh(registry.clone(), 5, test_config()).await;
        assert_eq!(nodes[2].node.iterative_find_value([7u8; 20]).await.unwrap(), None);
    }
}
