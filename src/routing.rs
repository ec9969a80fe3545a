//! # Routing Table
//!
//! An ordered sequence of k-buckets whose ranges partition the whole
//! 160-bit id space. Each bucket covers the ids sharing a common bit
//! prefix, which is the same as a contiguous `[low, high]` slice; splitting
//! a bucket at the midpoint of its range extends the prefix by one bit.
//!
//! ## Buckets
//!
//! A bucket keeps two lists:
//! - `contacts`: at most `k` live contacts, least-recently-seen at the front
//! - `replacements`: at most `k` candidates seen while the bucket was full,
//!   most-recently-seen at the back
//!
//! Replacement entries are only promoted when a contact is removed.
//!
//! ## Splitting
//!
//! A full bucket splits if it covers the local id, or if the depth of its
//! contacts is not a multiple of 5. Buckets far from the local id stop
//! splitting at [`RoutingTable::max_depth`]. When a full bucket cannot
//! split, the caller is told to ping its head ([`InsertOutcome::Full`]).
//!
//! The table performs no I/O. All liveness decisions are made by the DHT
//! actor, which owns the table exclusively.

use std::collections::VecDeque;

use tokio::time::{Duration, Instant};

use crate::identity::{Contact, ID_BITS, ID_LEN, NodeId, distance_cmp};

/// Default Kademlia bucket size / replication factor.
pub const DEFAULT_K: usize = 20;

/// A full bucket whose contacts share this many bits modulo 5 may still
/// split even when it does not cover the local id.
const DEPTH_SPLIT_MODULUS: usize = 5;

// ============================================================================
// K-Bucket
// ============================================================================

#[derive(Debug, Clone)]
pub struct KBucket {
    /// Low end of the range: the shared prefix followed by zero bits.
    prefix: NodeId,
    prefix_len: usize,
    k: usize,
    contacts: VecDeque<Contact>,
    replacements: VecDeque<Contact>,
    last_updated: Instant,
}

impl KBucket {
    fn new(prefix: NodeId, prefix_len: usize, k: usize) -> Self {
        Self {
            prefix,
            prefix_len,
            k,
            contacts: VecDeque::with_capacity(k),
            replacements: VecDeque::new(),
            last_updated: Instant::now(),
        }
    }

    /// Inclusive `(low, high)` bounds of this bucket's range.
    pub fn range(&self) -> (NodeId, NodeId) {
        let low = *self.prefix.as_bytes();
        let mut high = low;
        for bit in self.prefix_len..ID_BITS {
            high[bit / 8] |= 0x80 >> (bit % 8);
        }
        (NodeId::from_bytes(low), NodeId::from_bytes(high))
    }

    pub fn prefix_len(&self) -> usize {
        self.prefix_len
    }

    pub fn has_in_range(&self, id: &NodeId) -> bool {
        id.shared_prefix_len(&self.prefix) >= self.prefix_len
    }

    pub fn len(&self) -> usize {
        self.contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.contacts.len() >= self.k
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.contacts.iter().any(|c| c.id == *id)
    }

    /// Contacts ordered least-recently-seen first.
    pub fn get_nodes(&self) -> Vec<Contact> {
        self.contacts.iter().copied().collect()
    }

    pub fn replacement_nodes(&self) -> Vec<Contact> {
        self.replacements.iter().copied().collect()
    }

    /// Least-recently-seen contact.
    pub fn head(&self) -> Option<&Contact> {
        self.contacts.front()
    }

    pub fn last_updated(&self) -> Instant {
        self.last_updated
    }

    fn touch_last_updated(&mut self) {
        self.last_updated = Instant::now();
    }

    /// Number of leading bits shared by every contact in the bucket.
    pub fn depth(&self) -> usize {
        let mut iter = self.contacts.iter();
        let Some(first) = iter.next() else {
            return 0;
        };
        iter.map(|c| first.id.shared_prefix_len(&c.id))
            .min()
            .unwrap_or(ID_BITS)
    }

    /// Add or refresh a contact.
    ///
    /// Returns `false` when the bucket is full; the contact is then kept in
    /// the replacement cache instead.
    pub fn add_contact(&mut self, contact: Contact) -> bool {
        if let Some(pos) = self.contacts.iter().position(|c| c.id == contact.id) {
            self.contacts.remove(pos);
            self.contacts.push_back(contact);
            self.touch_last_updated();
            return true;
        }

        if self.contacts.len() < self.k {
            self.remove_replacement(&contact.id);
            self.contacts.push_back(contact);
            self.touch_last_updated();
            return true;
        }

        self.remove_replacement(&contact.id);
        self.replacements.push_back(contact);
        while self.replacements.len() > self.k {
            self.replacements.pop_front();
        }
        false
    }

    /// Remove a contact, promoting the most recent replacement into its slot.
    ///
    /// Returns `true` if a live contact was removed. Removing an id that is
    /// only cached drops it from the cache; unknown ids are ignored.
    pub fn remove_contact(&mut self, id: &NodeId) -> bool {
        if let Some(pos) = self.contacts.iter().position(|c| c.id == *id) {
            self.contacts.remove(pos);
            if let Some(promoted) = self.replacements.pop_back() {
                self.contacts.push_back(promoted);
            }
            return true;
        }
        self.remove_replacement(id);
        false
    }

    fn remove_replacement(&mut self, id: &NodeId) -> bool {
        if let Some(pos) = self.replacements.iter().position(|c| c.id == *id) {
            self.replacements.remove(pos);
            true
        } else {
            false
        }
    }

    /// Move a live contact to the most-recently-seen position.
    fn refresh(&mut self, id: &NodeId) -> bool {
        if let Some(pos) = self.contacts.iter().position(|c| c.id == *id)
            && let Some(existing) = self.contacts.remove(pos)
        {
            self.contacts.push_back(existing);
            self.touch_last_updated();
            true
        } else {
            false
        }
    }

    /// Replace `failed` by `candidate` taken from the replacement cache.
    fn replace(&mut self, failed: &NodeId, candidate: &Contact) -> bool {
        let Some(pos) = self.contacts.iter().position(|c| c.id == *failed) else {
            return false;
        };
        if !self.remove_replacement(&candidate.id) {
            return false;
        }
        self.contacts.remove(pos);
        self.contacts.push_back(*candidate);
        self.touch_last_updated();
        true
    }

    /// Split at the midpoint of the range, redistributing both lists.
    fn split(self) -> (KBucket, KBucket) {
        let child_len = self.prefix_len + 1;
        let mut high_prefix = *self.prefix.as_bytes();
        high_prefix[self.prefix_len / 8] |= 0x80 >> (self.prefix_len % 8);

        let mut low = KBucket::new(self.prefix, child_len, self.k);
        let mut high = KBucket::new(NodeId::from_bytes(high_prefix), child_len, self.k);
        low.last_updated = self.last_updated;
        high.last_updated = self.last_updated;

        for contact in self.contacts {
            if contact.id.bit(self.prefix_len) {
                high.contacts.push_back(contact);
            } else {
                low.contacts.push_back(contact);
            }
        }
        for contact in self.replacements {
            if contact.id.bit(self.prefix_len) {
                high.replacements.push_back(contact);
            } else {
                low.replacements.push_back(contact);
            }
        }
        (low, high)
    }

    /// A uniformly random id inside this bucket's range.
    pub fn random_id(&self) -> NodeId {
        let mut bytes: [u8; ID_LEN] = rand::random();
        let prefix = self.prefix.as_bytes();
        for bit in 0..self.prefix_len {
            let mask = 0x80u8 >> (bit % 8);
            bytes[bit / 8] = (bytes[bit / 8] & !mask) | (prefix[bit / 8] & mask);
        }
        NodeId::from_bytes(bytes)
    }
}

// ============================================================================
// Routing Table
// ============================================================================

/// Result of [`RoutingTable::add_contact`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    /// New contact stored in a bucket.
    Added,
    /// Known contact moved to most-recently-seen.
    Updated,
    /// Bucket full and not splittable; the contact went to the replacement
    /// cache and `head` should be pinged.
    Full { head: Contact },
    /// The local id is never stored.
    Ignored,
}

#[derive(Debug)]
pub struct RoutingTable {
    local_id: NodeId,
    max_depth: usize,
    buckets: Vec<KBucket>,
}

impl RoutingTable {
    pub fn new(local_id: NodeId, k: usize) -> Self {
        let k = k.max(1);
        Self {
            local_id,
            max_depth: max_split_depth(k),
            buckets: vec![KBucket::new(NodeId::from_bytes([0u8; ID_LEN]), 0, k)],
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    /// Deepest prefix a bucket not covering the local id may reach.
    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn buckets(&self) -> &[KBucket] {
        &self.buckets
    }

    /// Total number of live contacts.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(KBucket::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(KBucket::is_empty)
    }

    pub fn find_bucket_for(&self, id: &NodeId) -> usize {
        self.buckets
            .iter()
            .position(|bucket| bucket.has_in_range(id))
            .unwrap_or(self.buckets.len() - 1)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.buckets[self.find_bucket_for(id)].contains(id)
    }

    /// True if `id` is not a live contact.
    pub fn is_new_node(&self, id: &NodeId) -> bool {
        *id != self.local_id && !self.contains(id)
    }

    pub fn add_contact(&mut self, contact: Contact) -> InsertOutcome {
        if contact.id == self.local_id {
            return InsertOutcome::Ignored;
        }

        loop {
            let idx = self.find_bucket_for(&contact.id);
            let bucket = &mut self.buckets[idx];
            let known = bucket.contains(&contact.id);
            if bucket.add_contact(contact) {
                return if known {
                    InsertOutcome::Updated
                } else {
                    InsertOutcome::Added
                };
            }

            if self.can_split(idx) {
                self.split_bucket(idx);
                continue;
            }

            return match self.buckets[idx].head() {
                Some(head) => InsertOutcome::Full { head: *head },
                None => InsertOutcome::Ignored,
            };
        }
    }

    fn can_split(&self, idx: usize) -> bool {
        let bucket = &self.buckets[idx];
        if bucket.prefix_len >= ID_BITS {
            return false;
        }
        if bucket.has_in_range(&self.local_id) {
            return true;
        }
        bucket.prefix_len < self.max_depth && bucket.depth() % DEPTH_SPLIT_MODULUS != 0
    }

    fn split_bucket(&mut self, idx: usize) {
        let bucket = self.buckets.remove(idx);
        let (low, high) = bucket.split();
        self.buckets.insert(idx, high);
        self.buckets.insert(idx, low);
    }

    /// Remove a contact (promoting a replacement). Unknown ids are a no-op.
    pub fn remove_contact(&mut self, id: &NodeId) -> bool {
        let idx = self.find_bucket_for(id);
        self.buckets[idx].remove_contact(id)
    }

    /// Mark a live contact as just seen.
    pub fn refresh_contact(&mut self, id: &NodeId) -> bool {
        let idx = self.find_bucket_for(id);
        self.buckets[idx].refresh(id)
    }

    /// Oldest replacement candidate for a contact currently holding a slot.
    pub fn replacement_candidate(&self, id: &NodeId) -> Option<Contact> {
        let bucket = &self.buckets[self.find_bucket_for(id)];
        if !bucket.contains(id) {
            return None;
        }
        bucket.replacements.front().copied()
    }

    /// Swap a failed contact for a replacement that proved alive.
    pub fn replace_contact(&mut self, failed: &NodeId, candidate: &Contact) -> bool {
        let idx = self.find_bucket_for(failed);
        let bucket = &mut self.buckets[idx];
        if bucket.has_in_range(&candidate.id) && bucket.replace(failed, candidate) {
            return true;
        }
        bucket.remove_contact(failed)
    }

    /// Forget a cached candidate that failed its liveness check.
    pub fn drop_replacement(&mut self, id: &NodeId) {
        let idx = self.find_bucket_for(id);
        self.buckets[idx].remove_replacement(id);
    }

    /// Up to `count` contacts closest to `target`, nearest first.
    ///
    /// Starts at the bucket covering `target` and walks outward, alternating
    /// left and right, until enough candidates are gathered. Contacts that
    /// share `exclude`'s id or address are skipped.
    pub fn find_neighbors(
        &self,
        target: &NodeId,
        exclude: Option<&Contact>,
        count: usize,
    ) -> Vec<Contact> {
        if count == 0 {
            return Vec::new();
        }

        let start = self.find_bucket_for(target);
        let mut left = start;
        let mut right = start + 1;
        let mut take_left = true;
        let mut order = vec![start];
        while left > 0 || right < self.buckets.len() {
            if (take_left && left > 0) || right >= self.buckets.len() {
                left -= 1;
                order.push(left);
            } else {
                order.push(right);
                right += 1;
            }
            take_left = !take_left;
        }

        let mut found: Vec<Contact> = Vec::with_capacity(count);
        for idx in order {
            for contact in self.buckets[idx].contacts.iter().rev() {
                let excluded = exclude
                    .is_some_and(|ex| ex.id == contact.id || ex.same_home_as(contact));
                if !excluded {
                    found.push(*contact);
                }
            }
            if found.len() >= count {
                break;
            }
        }

        found.sort_by(|a, b| distance_cmp(&a.distance_to(target), &b.distance_to(target)));
        found.truncate(count);
        found
    }

    /// Random ids to look up, one per bucket untouched for `stale_after`.
    pub fn refresh_list(&self, stale_after: Duration, force: bool) -> Vec<NodeId> {
        self.buckets
            .iter()
            .filter(|bucket| force || bucket.last_updated.elapsed() >= stale_after)
            .map(KBucket::random_id)
            .collect()
    }

    pub fn mark_bucket_refreshed(&mut self, id: &NodeId) {
        let idx = self.find_bucket_for(id);
        self.buckets[idx].touch_last_updated();
    }
}

/// `ID_BITS - ceil(log2 k)`: below this depth a far bucket may still split.
fn max_split_depth(k: usize) -> usize {
    let log2_k = if k <= 1 {
        0
    } else {
        (k - 1).ilog2() as usize + 1
    };
    ID_BITS - log2_k
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Ordering;
    use std::net::{Ipv4Addr, SocketAddr};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, port))
    }

    fn contact_with(bytes: [u8; ID_LEN], port: u16) -> Contact {
        Contact::new(NodeId::from_bytes(bytes), addr(port))
    }

    fn prefixed_id(first: u8, second: u8) -> NodeId {
        let mut bytes: [u8; ID_LEN] = rand::random();
        bytes[0] = first;
        bytes[1] = second;
        NodeId::from_bytes(bytes)
    }

    /// Next id in numeric order, `None` after the maximum.
    fn successor(id: &NodeId) -> Option<NodeId> {
        let mut bytes = *id.as_bytes();
        for byte in bytes.iter_mut().rev() {
            if *byte == 0xff {
                *byte = 0;
            } else {
                *byte += 1;
                return Some(NodeId::from_bytes(bytes));
            }
        }
        None
    }

    fn assert_full_coverage(table: &RoutingTable) {
        let buckets = table.buckets();
        assert!(!buckets.is_empty());
        assert_eq!(buckets[0].range().0, NodeId::from_bytes([0u8; ID_LEN]));
        for pair in buckets.windows(2) {
            let (_, prev_high) = pair[0].range();
            let (next_low, _) = pair[1].range();
            assert_eq!(successor(&prev_high), Some(next_low), "gap or overlap between buckets");
        }
        let (_, last_high) = buckets[buckets.len() - 1].range();
        assert_eq!(last_high, NodeId::from_bytes([0xff; ID_LEN]));
    }

    #[test]
    fn bucket_moves_known_contact_to_tail() {
        let mut bucket = KBucket::new(NodeId::from_bytes([0u8; ID_LEN]), 0, 3);
        let a = contact_with([1u8; ID_LEN], 1);
        let b = contact_with([2u8; ID_LEN], 2);
        assert!(bucket.add_contact(a));
        assert!(bucket.add_contact(b));
        assert!(bucket.add_contact(a));
        let ids: Vec<_> = bucket.get_nodes().iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![b.id, a.id]);
        assert_eq!(bucket.head().map(|c| c.id), Some(b.id));
    }

    #[test]
    fn full_bucket_caches_and_promotes_most_recent_replacement() {
        let mut bucket = KBucket::new(NodeId::from_bytes([0u8; ID_LEN]), 0, 2);
        let a = contact_with([1u8; ID_LEN], 1);
        let b = contact_with([2u8; ID_LEN], 2);
        let c = contact_with([3u8; ID_LEN], 3);
        let d = contact_with([4u8; ID_LEN], 4);
        assert!(bucket.add_contact(a));
        assert!(bucket.add_contact(b));
        assert!(!bucket.add_contact(c));
        assert!(!bucket.add_contact(d));
        assert_eq!(bucket.len(), 2);
        assert_eq!(bucket.replacement_nodes().len(), 2);

        assert!(bucket.remove_contact(&a.id));
        let ids: Vec<_> = bucket.get_nodes().iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![b.id, d.id]);
        assert_eq!(bucket.replacement_nodes(), vec![c]);

        // Cached-only removal drops from the cache; unknown ids are a no-op.
        assert!(!bucket.remove_contact(&c.id));
        assert!(bucket.replacement_nodes().is_empty());
        assert!(!bucket.remove_contact(&NodeId::from_bytes([9u8; ID_LEN])));
        assert_eq!(bucket.len(), 2);
    }

    #[test]
    fn replacement_cache_is_bounded_by_k() {
        let mut bucket = KBucket::new(NodeId::from_bytes([0u8; ID_LEN]), 0, 2);
        for i in 0..10u8 {
            bucket.add_contact(contact_with([i + 1; ID_LEN], u16::from(i) + 1));
        }
        assert_eq!(bucket.len(), 2);
        assert_eq!(bucket.replacement_nodes().len(), 2);
        // Oldest cached entries were dropped first.
        let cached: Vec<_> = bucket.replacement_nodes().iter().map(|c| c.id.as_bytes()[0]).collect();
        assert_eq!(cached, vec![9, 10]);
    }

    #[test]
    fn depth_is_shared_prefix_of_contacts() {
        let mut bucket = KBucket::new(NodeId::from_bytes([0u8; ID_LEN]), 0, 4);
        assert_eq!(bucket.depth(), 0);
        let mut a = [0u8; ID_LEN];
        a[0] = 0b1100_0000;
        let mut b = [0u8; ID_LEN];
        b[0] = 0b1101_0000;
        bucket.add_contact(contact_with(a, 1));
        assert_eq!(bucket.depth(), ID_BITS);
        bucket.add_contact(contact_with(b, 2));
        assert_eq!(bucket.depth(), 3);
    }

    #[test]
    fn clustered_inserts_split_own_bucket_in_half() {
        let local = prefixed_id(0x00, 0x00);
        let mut table = RoutingTable::new(local, 4);

        for i in 0..4u16 {
            let outcome = table.add_contact(Contact::new(prefixed_id(0x01, i as u8), addr(1000 + i)));
            assert_eq!(outcome, InsertOutcome::Added);
        }
        assert_eq!(table.buckets().len(), 1);

        let outcome = table.add_contact(Contact::new(prefixed_id(0x80, 0x00), addr(2000)));
        assert_eq!(outcome, InsertOutcome::Added);
        assert!(table.buckets().len() >= 2);

        let first = &table.buckets()[0];
        let second = &table.buckets()[1];
        assert_eq!(first.prefix_len(), 1);
        assert_eq!(second.prefix_len(), 1);
        assert_eq!(first.range().1.as_bytes()[0], 0x7f);
        assert_eq!(second.range().0.as_bytes()[0], 0x80);
        assert!(first.get_nodes().iter().all(|c| first.has_in_range(&c.id)));
        assert!(second.get_nodes().iter().all(|c| second.has_in_range(&c.id)));
        assert_eq!(table.len(), 5);
        assert_full_coverage(&table);
    }

    fn first_byte(b: u8) -> [u8; ID_LEN] {
        let mut bytes = [0u8; ID_LEN];
        bytes[0] = b;
        bytes
    }

    #[test]
    fn far_bucket_at_depth_multiple_of_five_asks_for_ping() {
        let local = NodeId::from_bytes([0u8; ID_LEN]);
        let mut table = RoutingTable::new(local, 2);

        let a = contact_with(first_byte(0b1000_0000), 1);
        let b = contact_with(first_byte(0b1100_0000), 2);
        let c = contact_with(first_byte(0b1000_0100), 3);
        assert_eq!(table.add_contact(a), InsertOutcome::Added);
        assert_eq!(table.add_contact(b), InsertOutcome::Added);
        // Splits the own bucket, then the far half (depth 1).
        assert_eq!(table.add_contact(c), InsertOutcome::Added);

        // `a` and `c` share exactly five bits: no further split.
        let d = contact_with(first_byte(0b1000_1000), 4);
        assert_eq!(table.add_contact(d), InsertOutcome::Full { head: a });
        assert!(!table.contains(&d.id));
        assert_eq!(table.replacement_candidate(&a.id), Some(d));
        assert_full_coverage(&table);

        let f = contact_with(first_byte(0b1000_1100), 5);
        assert_eq!(table.add_contact(f), InsertOutcome::Full { head: a });
        table.drop_replacement(&f.id);
        assert_eq!(table.replacement_candidate(&a.id), Some(d));

        assert!(table.replace_contact(&a.id, &d));
        assert!(!table.contains(&a.id));
        assert!(table.contains(&d.id));
        assert!(table.contains(&c.id));
        assert_eq!(table.replacement_candidate(&c.id), None);
    }

    fn populated_table(k: usize, contacts: u16) -> RoutingTable {
        let mut table = RoutingTable::new(NodeId::random(), k);
        for port in 0..contacts {
            let _ = table.add_contact(Contact::new(NodeId::random(), addr(1000 + port)));
        }
        table
    }

    fn assert_nearest_first(target: &NodeId, found: &[Contact]) {
        for pair in found.windows(2) {
            assert_ne!(
                distance_cmp(&pair[0].distance_to(target), &pair[1].distance_to(target)),
                Ordering::Greater,
                "neighbors out of order"
            );
        }
    }

    #[test]
    fn find_neighbors_is_sorted_across_buckets() {
        let table = populated_table(3, 200);
        assert!(table.buckets().len() > 1);

        for _ in 0..50 {
            let target = NodeId::random();
            for count in [1, 3, 8, 1000] {
                let found = table.find_neighbors(&target, None, count);
                assert_eq!(found.len(), count.min(table.len()));
                assert_nearest_first(&target, &found);
            }
        }
    }

    #[test]
    fn find_neighbors_returns_whole_table_when_asked() {
        let table = populated_table(3, 200);
        let target = NodeId::random();

        let found = table.find_neighbors(&target, None, usize::MAX);
        let mut expected: Vec<Contact> = table
            .buckets()
            .iter()
            .flat_map(KBucket::get_nodes)
            .collect();
        expected.sort_by(|a, b| distance_cmp(&a.distance_to(&target), &b.distance_to(&target)));
        assert_eq!(found, expected);
    }

    #[test]
    fn find_neighbors_skips_excluded_id_and_address() {
        let table = populated_table(3, 200);
        let target = NodeId::random();
        let all = table.find_neighbors(&target, None, usize::MAX);
        let nearest = all[0];

        let found = table.find_neighbors(&target, Some(&nearest), usize::MAX);
        assert_eq!(found.len(), all.len() - 1);
        assert!(!found.contains(&nearest));

        // A different id at the same address is the same peer.
        let same_home = Contact::new(NodeId::random(), nearest.addr);
        let found = table.find_neighbors(&target, Some(&same_home), 5);
        assert!(found.iter().all(|c| c.addr != nearest.addr));
        assert_eq!(found.len(), 5.min(all.len() - 1));
        assert_nearest_first(&target, &found);
    }

    #[test]
    fn find_neighbors_with_zero_count_is_empty() {
        let table = populated_table(3, 20);
        assert!(table.find_neighbors(&NodeId::random(), None, 0).is_empty());
    }

    #[test]
    fn refresh_contact_moves_head_to_tail() {
        let local = NodeId::from_bytes([0u8; ID_LEN]);
        let mut table = RoutingTable::new(local, 2);
        let a = contact_with(first_byte(0b1000_0000), 1);
        let b = contact_with(first_byte(0b1100_0000), 2);
        let c = contact_with(first_byte(0b1000_0100), 3);
        for contact in [a, b, c] {
            table.add_contact(contact);
        }
        assert!(table.refresh_contact(&a.id));
        let d = contact_with(first_byte(0b1000_1000), 4);
        assert_eq!(table.add_contact(d), InsertOutcome::Full { head: c });
        assert!(!table.refresh_contact(&d.id));
    }

    #[test]
    fn refresh_list_covers_every_bucket_range() {
        let local = NodeId::random();
        let mut table = RoutingTable::new(local, 2);
        for i in 0..40u16 {
            table.add_contact(Contact::new(NodeId::random(), addr(i)));
        }
        let ids = table.refresh_list(Duration::from_secs(3600), true);
        assert_eq!(ids.len(), table.buckets().len());
        for (id, bucket) in ids.iter().zip(table.buckets()) {
            assert!(bucket.has_in_range(id));
        }
        assert!(table.refresh_list(Duration::from_secs(3600), false).is_empty());
    }

    #[test]
    fn max_depth_tracks_bucket_size() {
        assert_eq!(max_split_depth(20), ID_BITS - 5);
        assert_eq!(max_split_depth(16), ID_BITS - 4);
        assert_eq!(max_split_depth(1), ID_BITS);
    }
}
