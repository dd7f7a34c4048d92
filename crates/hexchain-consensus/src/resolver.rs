//! Multi-parent state reconciliation.
//!
//! # Merge Order
//!
//! Parents are ordered by `(distance from origin, hash)`. The first parent's
//! state is the base; every other parent contributes its delta against the
//! nearest common ancestor, applied in order. The order is a pure function
//! of the parent set, so every node computes the same merge.
//!
//! # Conflicts
//!
//! Two deltas writing different values to the same key conflict. The
//! [`ConflictPolicy`] picks the winner (lowest parent hash by default) and
//! each resolution is recorded in the [`ConflictLog`].
//!
//! ```text
//!        A (ancestor)
//!       / \
//!      P1  P2        P1: k = x    P2: k = y
//!       \ /
//!        C           k = value of min(hash(P1), hash(P2))
//! ```

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use hexchain_core::{ChainReader, ConflictPolicy, Hash, HexHeader, WorldState};
use tracing::{debug, info};

use crate::error::StateError;

/// One resolved write-write conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictRecord {
    pub key: Vec<u8>,
    pub winner: Hash,
    pub loser: Hash,
    /// `None` means the parent deleted the key.
    pub winning_value: Option<Vec<u8>>,
    pub losing_value: Option<Vec<u8>>,
}

/// Every conflict settled while merging one block, in resolution order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConflictLog {
    records: Vec<ConflictRecord>,
}

impl ConflictLog {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConflictRecord> {
        self.records.iter()
    }

    fn push(&mut self, record: ConflictRecord) {
        info!(
            key = %hex::encode(&record.key),
            winner = %record.winner,
            loser = %record.loser,
            "resolved state conflict"
        );
        self.records.push(record);
    }
}

/// The merged pre-execution state of a block.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub state: WorldState,
    pub root: Hash,
    /// Parent hashes in merge order.
    pub merge_order: Vec<Hash>,
    /// Nearest common ancestor, for blocks with two or more parents.
    pub ancestor: Option<Hash>,
    pub conflicts: ConflictLog,
}

/// Merges parent states using the ledger's stored post-states.
pub struct StateResolver {
    chain: Arc<dyn ChainReader>,
}

impl StateResolver {
    pub fn new(chain: Arc<dyn ChainReader>) -> Self {
        Self { chain }
    }

    /// Merge the parents of `header` and check the result against its
    /// `mesh_root`.
    pub fn resolve(&self, header: &HexHeader) -> Result<MergeOutcome, StateError> {
        let outcome = self.merge_parents(header)?;
        if !header.is_genesis() && outcome.root != header.mesh_root {
            return Err(StateError::RootMismatch {
                computed: outcome.root,
                declared: header.mesh_root,
            });
        }
        debug!(
            parents = outcome.merge_order.len(),
            conflicts = outcome.conflicts.len(),
            root = %outcome.root,
            "merged parent states"
        );
        Ok(outcome)
    }

    /// Merge the parents of `header` without checking the declared root.
    /// Block producers use this to compute the `mesh_root` they declare.
    pub fn merge_parents(&self, header: &HexHeader) -> Result<MergeOutcome, StateError> {
        let mut parents = Vec::with_capacity(header.parent_slot_count());
        for (_, hash) in header.parents() {
            let parent = self
                .chain
                .header_by_hash(&hash)
                .ok_or(StateError::MissingParent { hash })?;
            parents.push((parent.position.ring(), hash));
        }

        if parents.is_empty() {
            return Ok(self.initial_state(header));
        }

        parents.sort();
        let order: Vec<Hash> = parents.into_iter().map(|(_, h)| h).collect();

        if order.len() == 1 {
            let state = self.state(&order[0])?;
            return Ok(MergeOutcome {
                root: state.root(),
                state: (*state).clone(),
                merge_order: order,
                ancestor: None,
                conflicts: ConflictLog::default(),
            });
        }
        self.merge(order)
    }

    /// Genesis has no parents: its state is whatever the ledger recorded for
    /// it, or empty.
    fn initial_state(&self, header: &HexHeader) -> MergeOutcome {
        let state = self
            .chain
            .state_of(&header.hash())
            .map(|s| (*s).clone())
            .unwrap_or_default();
        MergeOutcome {
            root: state.root(),
            state,
            merge_order: Vec::new(),
            ancestor: None,
            conflicts: ConflictLog::default(),
        }
    }

    fn merge(&self, order: Vec<Hash>) -> Result<MergeOutcome, StateError> {
        let policy = self.chain.config().conflict_policy;
        let ancestor = self.nearest_common_ancestor(&order)?;
        let ancestor_state = self.state(&ancestor)?;

        let base = self.state(&order[0])?;
        let mut merged = (*base).clone();
        let mut conflicts = ConflictLog::default();

        // Current owner of every key written so far: (parent, value). Under
        // `LowestHashWins` the owner is always the lowest-hash writer seen.
        let mut claims: BTreeMap<Vec<u8>, (Hash, Option<Vec<u8>>)> = BTreeMap::new();
        for (key, value) in base.diff(&ancestor_state).iter() {
            claims.insert(key.to_vec(), (order[0], value.map(<[u8]>::to_vec)));
        }

        for parent in &order[1..] {
            let state = self.state(parent)?;
            let delta = state.diff(&ancestor_state);
            for (key, value) in delta.iter() {
                let value = value.map(<[u8]>::to_vec);
                match claims.get_mut(key) {
                    None => {
                        merged.apply_write(key, value.as_deref());
                        claims.insert(key.to_vec(), (*parent, value));
                    }
                    Some((owner, held)) if *held == value => {
                        if policy == ConflictPolicy::LowestHashWins && *parent < *owner {
                            *owner = *parent;
                        }
                    }
                    Some((owner, held)) => {
                        let challenger_wins = match policy {
                            ConflictPolicy::LowestHashWins => *parent < *owner,
                            ConflictPolicy::MergeOrderWins => false,
                        };
                        if challenger_wins {
                            conflicts.push(ConflictRecord {
                                key: key.to_vec(),
                                winner: *parent,
                                loser: *owner,
                                winning_value: value.clone(),
                                losing_value: held.clone(),
                            });
                            merged.apply_write(key, value.as_deref());
                            *owner = *parent;
                            *held = value;
                        } else {
                            conflicts.push(ConflictRecord {
                                key: key.to_vec(),
                                winner: *owner,
                                loser: *parent,
                                winning_value: held.clone(),
                                losing_value: value,
                            });
                        }
                    }
                }
            }
        }

        Ok(MergeOutcome {
            root: merged.root(),
            state: merged,
            merge_order: order,
            ancestor: Some(ancestor),
            conflicts,
        })
    }

    /// Highest block reachable from every parent (parents included), lowest
    /// hash on ties. Each parent's ancestry walk is bounded by the chain's
    /// `ancestor_search_limit`.
    pub fn nearest_common_ancestor(&self, parents: &[Hash]) -> Result<Hash, StateError> {
        let limit = self.chain.config().ancestor_search_limit;
        let mut common: Option<HashMap<Hash, u64>> = None;

        for parent in parents {
            let reachable = self.ancestry(parent, limit);
            common = Some(match common {
                None => reachable,
                Some(mut acc) => {
                    acc.retain(|h, _| reachable.contains_key(h));
                    acc
                }
            });
        }

        common
            .unwrap_or_default()
            .into_iter()
            .max_by(|(ha, na), (hb, nb)| na.cmp(nb).then_with(|| hb.cmp(ha)))
            .map(|(h, _)| h)
            .ok_or(StateError::NoCommonAncestor { searched: limit })
    }

    /// Breadth-first walk from `start` over parent links.
    fn ancestry(&self, start: &Hash, limit: usize) -> HashMap<Hash, u64> {
        let mut found = HashMap::new();
        let mut queued = HashSet::from([*start]);
        let mut queue = VecDeque::from([*start]);

        while let Some(hash) = queue.pop_front() {
            if found.len() >= limit {
                break;
            }
            let Some(header) = self.chain.header_by_hash(&hash) else {
                continue;
            };
            found.insert(hash, header.number);
            for (_, parent) in header.parents() {
                if queued.insert(parent) {
                    queue.push_back(parent);
                }
            }
        }
        found
    }

    fn state(&self, hash: &Hash) -> Result<Arc<WorldState>, StateError> {
        self.chain
            .state_of(hash)
            .ok_or(StateError::MissingState { hash: *hash })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorCategory, ValidationError};
    use crate::fixtures::MeshFixture;
    use hexchain_core::{ChainConfig, HexBlock, HexCoordinate};

    const EAST: HexCoordinate = HexCoordinate::new(1, 0);
    const SOUTH_EAST: HexCoordinate = HexCoordinate::new(0, 1);
    const BETWEEN: HexCoordinate = HexCoordinate::new(1, 1);

    fn base_state() -> WorldState {
        [(b"shared".to_vec(), b"base".to_vec()), (b"keep".to_vec(), b"k".to_vec())]
            .into_iter()
            .collect()
    }

    fn with(base: &WorldState, writes: &[(&str, Option<&str>)]) -> WorldState {
        let mut s = base.clone();
        for (k, v) in writes {
            s.apply_write(k.as_bytes(), v.map(str::as_bytes));
        }
        s
    }

    /// Genesis plus two siblings writing `a` and `b` to the same key.
    fn forked(config: ChainConfig, a: Option<&str>, b: Option<&str>) -> (MeshFixture, Hash, Hash) {
        let fx = MeshFixture::with_genesis_state(config, base_state());
        let base = base_state();
        let pa = fx.commit_with_state(
            fx.signed_child(EAST, &[fx.genesis]),
            with(&base, &[("shared", a), ("only-a", Some("1"))]),
        );
        let pb = fx.commit_with_state(
            fx.signed_child(SOUTH_EAST, &[fx.genesis]),
            with(&base, &[("shared", b), ("only-b", Some("2"))]),
        );
        (fx, pa, pb)
    }

    /// Cells for three siblings of genesis: one on ring 1, two on ring 2.
    const MIXED_RINGS: [HexCoordinate; 3] = [
        EAST,
        HexCoordinate::new(2, 0),
        HexCoordinate::new(0, 2),
    ];

    /// Genesis plus three siblings on mixed rings, each writing `values[i]`
    /// to `shared`. Header hashes do not depend on the written values.
    fn three_way(values: [Option<&str>; 3]) -> (MeshFixture, [Hash; 3]) {
        let fx = MeshFixture::with_genesis_state(ChainConfig::default(), base_state());
        let base = base_state();
        let hashes = std::array::from_fn(|i| {
            fx.commit_with_state(
                fx.signed_child(MIXED_RINGS[i], &[fx.genesis]),
                with(&base, &[("shared", values[i])]),
            )
        });
        (fx, hashes)
    }

    #[test]
    fn lowest_hash_writer_wins_across_three_parents() {
        // Learn the hashes first, then have the ring-1 parent and the lower
        // ring-2 parent agree while the higher ring-2 parent disagrees.
        let (_, [_, x, y]) = three_way([None, None, None]);
        let high = if x < y { 2 } else { 1 };
        let mut values = [Some("two"); 3];
        values[high] = Some("one");

        let (fx, parents) = three_way(values);
        let lowest = *parents.iter().min().unwrap();
        let expected = values[parents.iter().position(|h| *h == lowest).unwrap()];

        for slots in [[0, 1, 2], [2, 1, 0], [1, 2, 0]] {
            let ordered: Vec<Hash> = slots.iter().map(|i| parents[*i]).collect();
            let outcome = fx.resolver().merge_parents(&fx.child(BETWEEN, &ordered)).unwrap();
            assert_eq!(outcome.merge_order[0], parents[0], "ring 1 merges first");
            assert_eq!(
                outcome.state.get(b"shared"),
                expected.map(str::as_bytes),
                "slots {slots:?}"
            );
            assert!(outcome.conflicts.iter().all(|c| c.loser != lowest));
        }
        assert_eq!(expected, Some("two"));
    }

    #[test]
    fn lowest_hash_parent_wins() {
        let (fx, pa, pb) = forked(ChainConfig::default(), Some("a"), Some("b"));
        let child = fx.child(BETWEEN, &[pa, pb]);
        let outcome = fx.resolver().resolve(&child).unwrap();

        let (winner, loser, value) = if pa < pb { (pa, pb, "a") } else { (pb, pa, "b") };
        assert_eq!(outcome.state.get(b"shared"), Some(value.as_bytes()));
        assert_eq!(outcome.state.get(b"only-a"), Some(&b"1"[..]));
        assert_eq!(outcome.state.get(b"only-b"), Some(&b"2"[..]));
        assert_eq!(outcome.state.get(b"keep"), Some(&b"k"[..]));
        assert_eq!(outcome.ancestor, Some(fx.genesis));
        // Both parents sit on ring 1, so the hash breaks the tie.
        assert_eq!(outcome.merge_order, vec![winner, loser]);

        let records: Vec<_> = outcome.conflicts.iter().collect();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key, b"shared");
        assert_eq!(records[0].winner, winner);
        assert_eq!(records[0].loser, loser);
    }

    #[test]
    fn merge_is_independent_of_slot_order_and_process() {
        let (fx, pa, pb) = forked(ChainConfig::default(), Some("a"), Some("b"));
        let forward = fx.resolver().merge_parents(&fx.child(BETWEEN, &[pa, pb])).unwrap();
        let backward = fx.resolver().merge_parents(&fx.child(BETWEEN, &[pb, pa])).unwrap();
        assert_eq!(forward.root, backward.root);
        assert_eq!(forward.merge_order, backward.merge_order);

        // A second ledger built from the same inputs derives identical
        // hashes and therefore the same merged root.
        let (again, qa, qb) = forked(ChainConfig::default(), Some("a"), Some("b"));
        assert_eq!((qa, qb), (pa, pb));
        let replayed = again.resolver().merge_parents(&again.child(BETWEEN, &[qa, qb])).unwrap();
        assert_eq!(replayed.root, forward.root);
        assert_eq!(replayed.conflicts, forward.conflicts);
    }

    #[test]
    fn merge_order_policy_keeps_first_parent() {
        let config = ChainConfig {
            conflict_policy: ConflictPolicy::MergeOrderWins,
            ..Default::default()
        };
        let (fx, pa, pb) = forked(config, Some("a"), Some("b"));
        let outcome = fx.resolver().resolve(&fx.child(BETWEEN, &[pa, pb])).unwrap();
        let first = outcome.merge_order[0];
        let expected = if first == pa { "a" } else { "b" };
        assert_eq!(outcome.state.get(b"shared"), Some(expected.as_bytes()));
        assert_eq!(outcome.conflicts.iter().next().map(|r| r.winner), Some(first));
    }

    #[test]
    fn deletion_conflicts_with_a_write() {
        let (fx, pa, pb) = forked(ChainConfig::default(), None, Some("b"));
        let outcome = fx.resolver().resolve(&fx.child(BETWEEN, &[pa, pb])).unwrap();
        let record = outcome.conflicts.iter().next().unwrap();
        if pa < pb {
            assert_eq!(outcome.state.get(b"shared"), None);
            assert_eq!(record.winning_value, None);
        } else {
            assert_eq!(outcome.state.get(b"shared"), Some(&b"b"[..]));
            assert_eq!(record.losing_value, None);
        }
    }

    #[test]
    fn identical_writes_do_not_conflict() {
        let (fx, pa, pb) = forked(ChainConfig::default(), Some("same"), Some("same"));
        let outcome = fx.resolver().resolve(&fx.child(BETWEEN, &[pa, pb])).unwrap();
        assert!(outcome.conflicts.is_empty());
        assert_eq!(outcome.state.get(b"shared"), Some(&b"same"[..]));
    }

    #[test]
    fn single_parent_passes_through() {
        let (fx, pa, _) = forked(ChainConfig::default(), Some("a"), Some("b"));
        let child = fx.child(HexCoordinate::new(2, 0), &[pa]);
        let outcome = fx.resolver().resolve(&child).unwrap();
        assert_eq!(outcome.root, fx.chain.state_of(&pa).unwrap().root());
        assert_eq!(outcome.merge_order, vec![pa]);
        assert_eq!(outcome.ancestor, None);
        assert!(outcome.conflicts.is_empty());
    }

    #[test]
    fn genesis_resolves_to_its_initial_state() {
        let fx = MeshFixture::with_genesis_state(ChainConfig::default(), base_state());
        let outcome = fx.resolver().resolve(&fx.header(&fx.genesis)).unwrap();
        assert_eq!(outcome.root, base_state().root());
        assert!(outcome.merge_order.is_empty());
    }

    #[test]
    fn declared_root_must_match() {
        let (fx, pa, pb) = forked(ChainConfig::default(), Some("a"), Some("b"));
        let mut child = fx.child(BETWEEN, &[pa, pb]);
        let computed = child.mesh_root;
        child.mesh_root = base_state().root();

        let err = fx.resolver().resolve(&child).unwrap_err();
        assert_eq!(
            err,
            StateError::RootMismatch {
                computed,
                declared: base_state().root(),
            }
        );
        assert_eq!(ValidationError::from(err).category(), ErrorCategory::StateConflict);
    }

    #[test]
    fn missing_parent_state_is_retryable() {
        let fx = MeshFixture::new();
        let header = fx.signed_child(EAST, &[fx.genesis]);
        let stateless = fx.chain.insert_block(HexBlock::new(header, vec![], None));

        let err = fx
            .resolver()
            .merge_parents(&fx.child(HexCoordinate::new(2, 0), &[stateless]))
            .unwrap_err();
        assert_eq!(err, StateError::MissingState { hash: stateless });
        assert!(ValidationError::from(err).is_retryable());
    }

    #[test]
    fn nearest_common_ancestor_prefers_the_youngest() {
        let fx = MeshFixture::new();
        let a1 = fx.extend(EAST, &[fx.genesis]);
        let a2 = fx.extend(HexCoordinate::new(2, 0), &[a1]);
        let b1 = fx.extend(SOUTH_EAST, &[fx.genesis]);
        let resolver = fx.resolver();

        assert_eq!(resolver.nearest_common_ancestor(&[a2, b1]), Ok(fx.genesis));
        assert_eq!(resolver.nearest_common_ancestor(&[a2, a1]), Ok(a1));

        let joined = fx.extend(BETWEEN, &[a1, b1]);
        assert_eq!(resolver.nearest_common_ancestor(&[joined, a2]), Ok(a1));
    }

    #[test]
    fn ancestor_search_is_bounded() {
        let fx = MeshFixture::with_config(ChainConfig {
            ancestor_search_limit: 2,
            ..Default::default()
        });
        let mut tip = fx.genesis;
        for q in 1..=3 {
            tip = fx.extend(HexCoordinate::new(q, 0), &[tip]);
        }
        let other = fx.extend(SOUTH_EAST, &[fx.genesis]);
        assert_eq!(
            fx.resolver().nearest_common_ancestor(&[tip, other]),
            Err(StateError::NoCommonAncestor { searched: 2 })
        );
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn value() -> impl Strategy<Value = Option<String>> {
            // Three letters at most, so never the ancestor's "base".
            proptest::option::of("[a-z]{1,3}")
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(32))]

            #[test]
            fn lower_hash_value_survives_either_slot_order(a in value(), b in value()) {
                let (fx, pa, pb) = forked(ChainConfig::default(), a.as_deref(), b.as_deref());
                let forward = fx.resolver().merge_parents(&fx.child(BETWEEN, &[pa, pb])).unwrap();
                let backward = fx.resolver().merge_parents(&fx.child(BETWEEN, &[pb, pa])).unwrap();

                let expected = if pa < pb { &a } else { &b };
                prop_assert_eq!(forward.state.get(b"shared"), expected.as_deref().map(str::as_bytes));
                prop_assert_eq!(forward.root, backward.root);
                prop_assert_eq!(forward.conflicts.len(), usize::from(a != b));
            }

            #[test]
            fn lowest_hash_writer_wins_on_mixed_rings(
                a in value(),
                b in value(),
                c in value(),
            ) {
                let values = [a.as_deref(), b.as_deref(), c.as_deref()];
                let (fx, parents) = three_way(values);
                let lowest = (0..3).min_by_key(|i| parents[*i]).unwrap();
                let outcome = fx.resolver().merge_parents(&fx.child(BETWEEN, &parents)).unwrap();
                prop_assert_eq!(outcome.state.get(b"shared"), values[lowest].map(str::as_bytes));
            }
        }
    }
}
