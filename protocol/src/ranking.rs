//! # Ranking Merger
//!
//! Joins live, fork-compatible contact records with the current stake
//! snapshot into a deterministic ranking:
//!
//! 1. stake, descending (no stake entry means zero)
//! 2. identity, ascending, to break ties
//!
//! Ranking is a read-only pass over the directory and the snapshot. It takes
//! no lock that gossip receipt or stake fetching would wait on for longer
//! than one shard or one pointer copy.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::ENTRY_TIMEOUT;
use crate::crypto::NodeIdentity;
use crate::gossip::crds::ContactInfo;
use crate::gossip::directory::{ContactDirectory, LiveContact};
use crate::shred::{Compatibility, ShredVersionFilter};
use crate::stake::StakeSnapshot;

/// What to do with nodes that hold stake but were not seen live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnreachablePolicy {
    /// Rank reachable nodes only.
    #[default]
    Exclude,
    /// Append staked nodes with no live contact record after the reachable
    /// ones, marked unreachable.
    IncludeMarked,
}

impl std::str::FromStr for UnreachablePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exclude" => Ok(Self::Exclude),
            "include-marked" => Ok(Self::IncludeMarked),
            other => Err(format!(
                "unknown unreachable policy '{other}' (expected exclude or include-marked)"
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RankingConfig {
    /// Contact records older than this are not live.
    pub max_age: Duration,
    pub unreachable: UnreachablePolicy,
    /// Only rank nodes whose gossip address answered a ping.
    pub require_verified: bool,
    /// Left out of the ranking. Normally the local node.
    pub exclude: Option<NodeIdentity>,
}

impl Default for RankingConfig {
    fn default() -> Self {
        Self {
            max_age: ENTRY_TIMEOUT,
            unreachable: UnreachablePolicy::default(),
            require_verified: false,
            exclude: None,
        }
    }
}

/// One line of the ranking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankedNode {
    pub identity: NodeIdentity,
    /// `None` only for unreachable nodes.
    pub contact_info: Option<ContactInfo>,
    pub stake: u64,
    /// 1-based position.
    pub rank: usize,
    pub reachable: bool,
}

/// Ranks the live, compatible nodes of `directory` by `snapshot` stake.
pub fn rank(
    directory: &ContactDirectory,
    filter: &ShredVersionFilter,
    snapshot: &StakeSnapshot,
    config: &RankingConfig,
    now: u64,
) -> Vec<RankedNode> {
    let mut seen: HashSet<NodeIdentity> = HashSet::new();
    let mut reachable: Vec<(NodeIdentity, Option<ContactInfo>, u64)> = Vec::new();

    for live in directory.live_entries(config.max_age, now) {
        let identity = live.info.identity;
        if config.exclude == Some(identity) {
            continue;
        }
        seen.insert(identity);
        if config.require_verified && !live.verified {
            continue;
        }
        if filter.classify(&live.info) != Compatibility::Compatible {
            continue;
        }
        reachable.push((identity, Some(live.info), snapshot.stake_of(&identity)));
    }
    sort_by_stake(&mut reachable);

    let mut unreachable = Vec::new();
    if config.unreachable == UnreachablePolicy::IncludeMarked {
        unreachable = snapshot
            .iter()
            .filter(|(identity, stake)| {
                **stake > 0 && !seen.contains(*identity) && config.exclude != Some(**identity)
            })
            .map(|(identity, stake)| (*identity, None, *stake))
            .collect();
        sort_by_stake(&mut unreachable);
    }

    let num_reachable = reachable.len();
    reachable
        .into_iter()
        .chain(unreachable)
        .enumerate()
        .map(|(i, (identity, contact_info, stake))| RankedNode {
            identity,
            contact_info,
            stake,
            rank: i + 1,
            reachable: i < num_reachable,
        })
        .collect()
}

fn sort_by_stake(nodes: &mut [(NodeIdentity, Option<ContactInfo>, u64)]) {
    nodes.sort_unstable_by(|a, b| b.2.cmp(&a.2).then_with(|| a.0.cmp(&b.0)));
}

/// Live entries the filter classifies foreign, by identity. Diagnostics
/// only: they never appear in [`rank`] output.
pub fn foreign_entries(
    directory: &ContactDirectory,
    filter: &ShredVersionFilter,
    max_age: Duration,
    now: u64,
) -> Vec<LiveContact> {
    let mut foreign: Vec<LiveContact> = directory
        .live_entries(max_age, now)
        .filter(|live| filter.classify(&live.info) == Compatibility::Foreign)
        .collect();
    foreign.sort_unstable_by(|a, b| a.info.identity.cmp(&b.info.identity));
    foreign
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::NodeKeypair;
    use crate::gossip::crds::{CrdsData, CrdsValue};
    use crate::shred::ShredVersionPolicy;
    use proptest::prelude::*;
    use std::collections::HashMap;
    use std::net::SocketAddr;

    const NOW: u64 = 1_700_000_000_000;

    fn publish(dir: &ContactDirectory, kp: &NodeKeypair, shred: u16, at: u64) {
        let addr = SocketAddr::from(([10, 9, kp.identity().as_bytes()[0], 1], 8001));
        let mut info = ContactInfo::new(kp.identity(), addr, at);
        info.shred_version = shred;
        let value = CrdsValue::new_signed(CrdsData::ContactInfo(info), kp).unwrap();
        dir.upsert(value, at).unwrap();
    }

    fn canonical(shred: u16) -> ShredVersionFilter {
        ShredVersionFilter::new(ShredVersionPolicy::OverrideOnly, Some(shred))
    }

    fn snapshot(stakes: &[(&NodeKeypair, u64)]) -> StakeSnapshot {
        StakeSnapshot::new(
            1,
            NOW,
            stakes.iter().map(|(kp, s)| (kp.identity(), *s)).collect::<HashMap<_, _>>(),
        )
    }

    fn identities(ranked: &[RankedNode]) -> Vec<NodeIdentity> {
        ranked.iter().map(|r| r.identity).collect()
    }

    #[test]
    fn ranks_compatible_nodes_by_stake() {
        let dir = ContactDirectory::default();
        let a = NodeKeypair::generate();
        let b = NodeKeypair::generate();
        let c = NodeKeypair::generate();
        publish(&dir, &a, 1, NOW);
        publish(&dir, &b, 1, NOW);
        publish(&dir, &c, 2, NOW);
        let stakes = snapshot(&[(&a, 100), (&b, 50), (&c, 200)]);

        let ranked = rank(&dir, &canonical(1), &stakes, &RankingConfig::default(), NOW);
        assert_eq!(identities(&ranked), vec![a.identity(), b.identity()]);
        assert_eq!(ranked[0].rank, 1);
        assert_eq!(ranked[0].stake, 100);
        assert_eq!(ranked[1].rank, 2);
        assert!(ranked.iter().all(|r| r.reachable && r.contact_info.is_some()));

        // C is still in the directory, just not ranked.
        assert!(dir.get_contact(&c.identity()).is_some());
        let foreign = foreign_entries(&dir, &canonical(1), ENTRY_TIMEOUT, NOW);
        assert_eq!(foreign.len(), 1);
        assert_eq!(foreign[0].info.identity, c.identity());
    }

    #[test]
    fn equal_stake_breaks_ties_by_identity() {
        let dir = ContactDirectory::default();
        let kps: Vec<NodeKeypair> = (0..5).map(|_| NodeKeypair::generate()).collect();
        for kp in &kps {
            publish(&dir, kp, 1, NOW);
        }
        let stakes = snapshot(&kps.iter().map(|kp| (kp, 10)).collect::<Vec<_>>());

        let ranked = rank(&dir, &canonical(1), &stakes, &RankingConfig::default(), NOW);
        let mut expected: Vec<NodeIdentity> = kps.iter().map(|kp| kp.identity()).collect();
        expected.sort();
        assert_eq!(identities(&ranked), expected);
    }

    #[test]
    fn missing_stake_counts_as_zero() {
        let dir = ContactDirectory::default();
        let (a, b) = (NodeKeypair::generate(), NodeKeypair::generate());
        publish(&dir, &a, 1, NOW);
        publish(&dir, &b, 1, NOW);

        let stakes = snapshot(&[(&b, 1)]);
        let ranked = rank(&dir, &canonical(1), &stakes, &RankingConfig::default(), NOW);
        assert_eq!(identities(&ranked), vec![b.identity(), a.identity()]);
        assert_eq!(ranked[1].stake, 0);

        // Before any fetch: everyone at zero, still ranked.
        let empty = StakeSnapshot::default();
        assert_eq!(rank(&dir, &canonical(1), &empty, &RankingConfig::default(), NOW).len(), 2);
    }

    #[test]
    fn staked_but_unseen_nodes_follow_the_policy() {
        let dir = ContactDirectory::default();
        let (live, ghost, foreign) =
            (NodeKeypair::generate(), NodeKeypair::generate(), NodeKeypair::generate());
        publish(&dir, &live, 1, NOW);
        publish(&dir, &foreign, 2, NOW);
        let stakes = snapshot(&[(&live, 1), (&ghost, 1_000), (&foreign, 500)]);

        let ranked = rank(&dir, &canonical(1), &stakes, &RankingConfig::default(), NOW);
        assert_eq!(identities(&ranked), vec![live.identity()]);

        let config = RankingConfig {
            unreachable: UnreachablePolicy::IncludeMarked,
            ..RankingConfig::default()
        };
        let ranked = rank(&dir, &canonical(1), &stakes, &config, NOW);
        assert_eq!(identities(&ranked), vec![live.identity(), ghost.identity()]);
        assert!(!ranked[1].reachable);
        assert!(ranked[1].contact_info.is_none());
        assert_eq!(ranked[1].rank, 2);
    }

    #[test]
    fn stale_entries_are_not_live() {
        let dir = ContactDirectory::default();
        let (fresh, stale) = (NodeKeypair::generate(), NodeKeypair::generate());
        publish(&dir, &fresh, 1, NOW);
        publish(&dir, &stale, 1, NOW - 120_000);
        let config = RankingConfig::default();

        let ranked = rank(&dir, &canonical(1), &StakeSnapshot::default(), &config, NOW);
        assert_eq!(identities(&ranked), vec![fresh.identity()]);
    }

    #[test]
    fn verification_and_exclusion() {
        let dir = ContactDirectory::default();
        let (me, peer) = (NodeKeypair::generate(), NodeKeypair::generate());
        publish(&dir, &me, 1, NOW);
        publish(&dir, &peer, 1, NOW);
        let stakes = snapshot(&[(&me, 5), (&peer, 5)]);

        let config = RankingConfig {
            require_verified: true,
            exclude: Some(me.identity()),
            ..RankingConfig::default()
        };
        assert!(rank(&dir, &canonical(1), &stakes, &config, NOW).is_empty());

        let gossip = dir.get_contact(&peer.identity()).unwrap().gossip;
        assert!(dir.promote(&peer.identity(), gossip, NOW));
        let ranked = rank(&dir, &canonical(1), &stakes, &config, NOW);
        assert_eq!(identities(&ranked), vec![peer.identity()]);
    }

    #[test]
    fn verified_only_ranking_drops_peers_that_stop_answering_pings() {
        let dir = ContactDirectory::default();
        let peer = NodeKeypair::generate();
        publish(&dir, &peer, 1, NOW);
        let gossip = dir.get_contact(&peer.identity()).unwrap().gossip;
        dir.promote(&peer.identity(), gossip, NOW);
        let stakes = snapshot(&[(&peer, 5)]);
        let config = RankingConfig {
            require_verified: true,
            ..RankingConfig::default()
        };

        // Still gossiping from the same address, but no pong for a full TTL.
        let later = NOW + crate::config::PING_TTL.as_millis() as u64;
        publish(&dir, &peer, 1, later);
        assert!(rank(&dir, &canonical(1), &stakes, &config, later).is_empty());

        dir.promote(&peer.identity(), gossip, later);
        let ranked = rank(&dir, &canonical(1), &stakes, &config, later);
        assert_eq!(identities(&ranked), vec![peer.identity()]);
    }

    #[test]
    fn unknown_canonical_ranks_nothing() {
        let dir = ContactDirectory::default();
        let a = NodeKeypair::generate();
        publish(&dir, &a, 1, NOW);
        let ranked = rank(
            &dir,
            &ShredVersionFilter::default(),
            &snapshot(&[(&a, 1)]),
            &RankingConfig::default(),
            NOW,
        );
        assert!(ranked.is_empty());
    }

    #[test]
    fn policy_parses_from_cli_spelling() {
        assert_eq!(
            "include-marked".parse::<UnreachablePolicy>(),
            Ok(UnreachablePolicy::IncludeMarked)
        );
        assert!("maybe".parse::<UnreachablePolicy>().is_err());
    }

    proptest! {
        #[test]
        fn ranking_is_a_total_order(stakes in proptest::collection::vec(0u64..4, 1..12)) {
            let dir = ContactDirectory::default();
            let kps: Vec<NodeKeypair> = stakes
                .iter()
                .enumerate()
                .map(|(i, _)| NodeKeypair::from_seed(&[i as u8 + 1; 32]))
                .collect();
            for kp in &kps {
                publish(&dir, kp, 1, NOW);
            }
            let pairs: Vec<(&NodeKeypair, u64)> =
                kps.iter().zip(&stakes).map(|(kp, s)| (kp, *s)).collect();
            let snap = snapshot(&pairs);

            let ranked = rank(&dir, &canonical(1), &snap, &RankingConfig::default(), NOW);
            prop_assert_eq!(ranked.len(), kps.len());
            for pair in ranked.windows(2) {
                let ordered = pair[0].stake > pair[1].stake
                    || (pair[0].stake == pair[1].stake && pair[0].identity < pair[1].identity);
                prop_assert!(ordered);
                prop_assert_eq!(pair[0].rank + 1, pair[1].rank);
            }
        }
    }
}
