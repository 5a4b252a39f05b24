//! Consensus property tests: simulation-based verification of main-chain
//! selection, stability and committee resolution.
//!
//! These tests drive the public `Ledger` API with hand-shaped DAGs and check
//! the properties every node must agree on:
//! - **Determinism**: the same DAG gives the same stable main chain and balls,
//!   whatever the arrival order
//! - **Monotonicity**: the stable point never retreats and stable data never changes
//! - **Contiguity**: every stable index holds at least one unit, ordered by (level, hash)
//! - **Witness majority**: nothing becomes stable without 7 distinct witnesses
//! - **Proof chains**: chains built by one node verify against the genesis ball alone
//! - **Scenarios**: deep confirmation through `mark_stable_by_later_units`,
//!   competing branches at one index, and a committee change at index 1000

use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use keel::config::dev_witness;
use keel::consensus::dag::{Address, Ball, Unit, UnitId, UnitMessage};
use keel::consensus::skiplist::{verify_proof_chain, ProofError};
use keel::consensus::witnessed_level::walk_witnesses;
use keel::consensus::witnesses::Committee;
use keel::consensus::ConsensusError;
use keel::node::ConsensusNode;
use keel::state::{Ledger, StabilityAdvance};
use keel::storage::{SledStorage, Storage};

// ── Helpers ─────────────────────────────────────────────────────────────

fn witness(n: u8) -> Address {
    dev_witness(n)
}

fn committee() -> Committee {
    Committee::new((0..12).map(witness).collect()).unwrap()
}

fn open_ledger() -> Ledger<SledStorage> {
    Ledger::open(SledStorage::open_temporary().unwrap(), "properties", committee()).unwrap()
}

fn data(nonce: u64) -> UnitMessage {
    UnitMessage::Data(nonce.to_le_bytes().to_vec())
}

/// Add a unit that keeps genesis as its last ball. Does not advance stability.
fn push_on_genesis(ledger: &mut Ledger<SledStorage>, parents: &[UnitId], author: Address, nonce: u64) -> UnitId {
    let genesis = *ledger.dag().genesis();
    let mut parents = parents.to_vec();
    parents.sort();
    ledger
        .add_unit(Unit::new(parents, vec![author], Some(genesis), 0, vec![data(nonce)]))
        .unwrap()
}

/// Grow a linear chain with `compose_unit`, advancing after every unit.
/// Returns the units in order.
fn grow(ledger: &mut Ledger<SledStorage>, count: u64, author: impl Fn(u64) -> Address) -> Vec<Unit> {
    let mut units = Vec::new();
    for _ in 0..count {
        let level = ledger.get_unit(&ledger.best_tip().unwrap()).unwrap().level + 1;
        let unit = ledger.compose_unit(vec![author(level)], vec![data(level)]);
        ledger.add_unit(unit.clone()).unwrap();
        ledger.advance_stability().unwrap();
        units.push(unit);
    }
    units
}

fn rotating(level: u64) -> Address {
    witness((level % 12) as u8)
}

/// Build `rounds` layers of `width` units; every unit of round `r` references
/// all units of round `r - 1` and is authored by `witness(r % 12)`.
fn build_layered(ledger: &mut Ledger<SledStorage>, rounds: u64, width: u64) -> Vec<Vec<Unit>> {
    let mut layers = Vec::new();
    let mut previous = vec![*ledger.dag().genesis()];
    for round in 1..=rounds {
        let (last_ball_unit, last_ball_mci) = ledger.last_ball();
        let mut parents = previous.clone();
        parents.sort();
        let units: Vec<Unit> = (0..width)
            .map(|i| {
                Unit::new(
                    parents.clone(),
                    vec![rotating(round)],
                    Some(last_ball_unit),
                    last_ball_mci,
                    vec![data(round * 1_000 + i)],
                )
            })
            .collect();
        for unit in &units {
            ledger.add_unit(unit.clone()).unwrap();
            ledger.advance_stability().unwrap();
        }
        previous = units.iter().map(|u| u.id).collect();
        layers.push(units);
    }
    layers
}

fn ball_of(ledger: &Ledger<SledStorage>, id: &UnitId) -> Ball {
    ledger.get_unit(id).unwrap().ball.unwrap()
}

/// Every stable index with its units and their balls.
fn stable_snapshot(ledger: &Ledger<SledStorage>) -> Vec<Vec<(UnitId, Ball)>> {
    (0..=ledger.stable_point())
        .map(|mci| {
            ledger
                .units_at_mci(mci)
                .iter()
                .map(|id| (*id, ball_of(ledger, id)))
                .collect()
        })
        .collect()
}

// ── Determinism ─────────────────────────────────────────────────────────

#[test]
fn same_dag_in_any_order_gives_same_stable_chain() {
    let mut original = open_ledger();
    let layers = build_layered(&mut original, 60, 3);
    assert_eq!(original.stable_point(), 47);

    for seed in [1u64, 2, 3] {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut replica = open_ledger();
        for layer in &layers {
            let mut layer = layer.clone();
            layer.shuffle(&mut rng);
            for unit in layer {
                replica.add_unit(unit).unwrap();
                replica.advance_stability().unwrap();
            }
        }
        assert_eq!(replica.stable_point(), original.stable_point(), "seed {seed}");
        assert_eq!(replica.best_tip().unwrap(), original.best_tip().unwrap());
        assert_eq!(stable_snapshot(&replica), stable_snapshot(&original), "seed {seed}");
    }
}

#[test]
fn batching_does_not_change_the_outcome() {
    let mut eager = open_ledger();
    let mut lazy = open_ledger();
    let genesis = *eager.dag().genesis();
    let mut tip = genesis;
    for level in 1..=40u64 {
        let id = push_on_genesis(&mut eager, &[tip], rotating(level), level);
        assert_eq!(push_on_genesis(&mut lazy, &[tip], rotating(level), level), id);
        eager.advance_stability().unwrap();
        tip = id;
    }
    // one big batch against forty small ones
    let advance = lazy.advance_stability().unwrap().unwrap();
    assert_eq!(advance, StabilityAdvance { old_mci: 0, new_mci: 27 });
    assert_eq!(eager.stable_point(), 27);
    assert_eq!(stable_snapshot(&lazy), stable_snapshot(&eager));
}

// ── Monotonicity ────────────────────────────────────────────────────────

#[test]
fn stable_point_and_stable_data_never_change() {
    let mut original = open_ledger();
    let layers = build_layered(&mut original, 45, 2);

    let mut replica = open_ledger();
    let mut rng = StdRng::seed_from_u64(99);
    let mut last_point = 0;
    let mut seen: HashMap<UnitId, (u64, Ball)> = HashMap::new();
    for layer in &layers {
        let mut layer = layer.clone();
        layer.shuffle(&mut rng);
        for unit in layer {
            replica.add_unit(unit).unwrap();
            if let Some(advance) = replica.advance_stability().unwrap() {
                assert_eq!(advance.old_mci, last_point);
                assert!(advance.new_mci > advance.old_mci);
            }
            let point = replica.stable_point();
            assert!(point >= last_point);
            for mci in last_point + 1..=point {
                for id in replica.units_at_mci(mci) {
                    seen.insert(*id, (mci, ball_of(&replica, id)));
                }
            }
            last_point = point;
        }
    }

    assert!(!seen.is_empty());
    for (id, (mci, ball)) in &seen {
        let record = replica.get_unit(id).unwrap();
        assert!(record.is_stable);
        assert_eq!(record.main_chain_index, Some(*mci));
        assert_eq!(record.ball, Some(*ball));
    }
}

// ── Contiguity ──────────────────────────────────────────────────────────

#[test]
fn every_stable_index_has_ordered_units() {
    let mut ledger = open_ledger();
    build_layered(&mut ledger, 40, 3);
    let stable_point = ledger.stable_point();
    assert_eq!(stable_point, 27);

    let mut counted = 0;
    for mci in 0..=stable_point {
        let stored = ledger.storage().get_units_at_mci(mci).unwrap();
        assert!(!stored.is_empty(), "index {mci} is empty");
        assert_eq!(stored.iter().filter(|r| r.is_on_main_chain).count(), 1);
        for pair in stored.windows(2) {
            assert!((pair[0].level, pair[0].id()) < (pair[1].level, pair[1].id()));
        }
        assert_eq!(
            stored.iter().map(|r| r.id()).collect::<Vec<_>>(),
            ledger.units_at_mci(mci)
        );
        counted += stored.len();
    }
    let stable_units = ledger
        .storage()
        .get_all_units()
        .unwrap()
        .into_iter()
        .filter(|r| r.is_stable)
        .count();
    assert_eq!(counted, stable_units);
    // index m holds the main chain unit of round m and the two side units
    // of round m - 1; index 1 has no side units below it
    assert_eq!(counted, 1 + 1 + 26 * 3);
    assert_eq!(ledger.units_at_mci(1).len(), 1);
    assert_eq!(ledger.units_at_mci(27).len(), 3);
}

// ── Witness majority ────────────────────────────────────────────────────

#[test]
fn six_witnesses_cannot_stabilize_anything() {
    let mut ledger = open_ledger();
    grow(&mut ledger, 60, |level| witness((level % 6) as u8));
    assert_eq!(ledger.stable_point(), 0);

    let walk = walk_witnesses(ledger.dag(), &ledger.best_tip().unwrap(), &committee()).unwrap();
    // only genesis completes the majority
    assert_eq!(walk.steps, 61);

    // a seventh witness joins the rotation
    grow(&mut ledger, 40, |level| witness((level % 7) as u8));
    assert_eq!(ledger.stable_point(), 87);
    let walk = walk_witnesses(ledger.dag(), &ledger.best_tip().unwrap(), &committee()).unwrap();
    assert_eq!(walk.witnesses.len(), 7);
    assert_eq!(walk.steps, 7);
}

#[test]
fn non_committee_authors_never_count() {
    let mut ledger = open_ledger();
    grow(&mut ledger, 50, |level| Address(keel::hash_domain(b"keel.test.outsider", &level.to_le_bytes())));
    assert_eq!(ledger.stable_point(), 0);
}

// ── Proof chains ────────────────────────────────────────────────────────

#[test]
fn proof_chains_verify_against_genesis_only() {
    let mut ledger = open_ledger();
    build_layered(&mut ledger, 80, 2);
    let stable_point = ledger.stable_point();
    assert_eq!(stable_point, 67);

    // an independent node only needs the genesis ball
    let verifier = open_ledger();
    let genesis_ball = verifier.genesis_ball().unwrap();
    assert_eq!(genesis_ball, ledger.genesis_ball().unwrap());

    for (low, high) in [(0, stable_point), (0, 64), (3, 61), (17, 18), (40, 40), (1, stable_point)] {
        let chain = ledger.build_proof_chain(low, high).unwrap();
        assert_eq!(chain.links.first().unwrap().mci, high);
        assert_eq!(chain.links.last().unwrap().mci, low);
        verify_proof_chain(&chain, &genesis_ball).unwrap();
        let range = (high - low).max(1);
        assert!(chain.len() <= 2 * (64 - range.leading_zeros()) as usize + 2);

        // every link is the main chain unit at its index, with its stored ball
        let path = ledger.main_chain_path(low, high).unwrap();
        for link in &chain.links {
            assert_eq!(link.unit, path[(link.mci - low) as usize]);
            assert_eq!(link.ball, ball_of(&ledger, &link.unit));
            assert_eq!(ledger.get_unit(&link.unit).unwrap().main_chain_index, Some(link.mci));
        }
    }

    // 64 jumps straight to genesis through the last skiplist entry
    let chain = ledger.build_proof_chain(0, 64).unwrap();
    assert_eq!(chain.links.iter().map(|l| l.mci).collect::<Vec<_>>(), vec![64, 0]);
    let mut tampered = chain.clone();
    tampered.links[0].skiplist_balls[5] = ball_of(&ledger, &ledger.main_chain_path(1, 1).unwrap()[0]);
    assert_eq!(
        verify_proof_chain(&tampered, &genesis_ball),
        Err(ProofError::BallMismatch { mci: 64 })
    );
    let top = &mut tampered.links[0];
    top.ball = Ball::compute(&top.unit, &top.parent_balls, &top.skiplist_balls);
    assert_eq!(
        verify_proof_chain(&tampered, &genesis_ball),
        Err(ProofError::BrokenSkiplistLink { mci: 64, hop: 64 })
    );

    let mut forged = ledger.build_proof_chain(0, 32).unwrap();
    forged.links[1].parent_balls.reverse();
    forged.links[1].parent_balls.push(genesis_ball);
    assert_eq!(
        verify_proof_chain(&forged, &genesis_ball),
        Err(ProofError::BallMismatch { mci: forged.links[1].mci })
    );

    assert!(matches!(
        ledger.build_proof_chain(10, 5),
        Err(ConsensusError::InvalidRange { low: 10, high: 5 })
    ));
    let err = ledger.build_proof_chain(0, stable_point + 1).unwrap_err();
    assert!(err.is_retryable());
}

// ── Scenario A: deep confirmation by a later unit ───────────────────────

/// Levels 41..=49 cycle through six witnesses and level 40 brings a seventh,
/// so a unit at level 50 has witnessed level 40.
fn scenario_a_author(level: u64) -> Address {
    match level {
        40 => witness(6),
        41..=49 => witness((level % 6) as u8),
        _ => rotating(level),
    }
}

#[test]
fn later_unit_confirms_an_old_unit_without_gaps() {
    let mut ledger = open_ledger();
    let genesis = *ledger.dag().genesis();
    let mut chain = vec![genesis];
    for level in 1..=200u64 {
        let tip = *chain.last().unwrap();
        chain.push(push_on_genesis(&mut ledger, &[tip], scenario_a_author(level), level));
    }
    let u = chain[50];
    assert_eq!(ledger.get_unit(&u).unwrap().witnessed_level, Some(40));
    assert_eq!(ledger.stable_point(), 0);

    assert!(!ledger.determine_if_stable_in_later_units(&u, &[chain[62]]).unwrap());
    assert!(ledger.determine_if_stable_in_later_units(&u, &[chain[63]]).unwrap());
    assert!(ledger.determine_if_stable_in_later_units(&u, &[chain[10], chain[200]]).unwrap());
    assert_eq!(ledger.stable_point(), 0, "queries do not stabilize");

    let advance = ledger.mark_stable_by_later_units(&u, &[chain[200]]).unwrap();
    assert_eq!(advance, Some(StabilityAdvance { old_mci: 0, new_mci: 50 }));
    assert!(ledger.is_stable(&u));
    assert_eq!(ledger.storage().stable_point().unwrap(), Some(50));
    for mci in 0..=50u64 {
        assert_eq!(ledger.units_at_mci(mci), &[chain[mci as usize]]);
        assert_eq!(ledger.storage().get_units_at_mci(mci).unwrap().len(), 1);
    }
    assert!(!ledger.is_stable(&chain[51]));

    // already stable: nothing more to do
    assert_eq!(ledger.mark_stable_by_later_units(&u, &[chain[200]]).unwrap(), None);
    let advance = ledger.advance_stability().unwrap();
    assert_eq!(advance, Some(StabilityAdvance { old_mci: 50, new_mci: 187 }));
}

// ── Scenario B: competing branches at one index ─────────────────────────

#[test]
fn competing_branches_resolve_by_hash_in_any_order() {
    let genesis = *open_ledger().dag().genesis();
    let a = Unit::new(vec![genesis], vec![witness(1)], Some(genesis), 0, vec![data(0xa)]);
    let b = Unit::new(vec![genesis], vec![witness(2)], Some(genesis), 0, vec![data(0xb)]);
    let mut merge_parents = vec![a.id, b.id];
    merge_parents.sort();
    let c = Unit::new(merge_parents, vec![witness(3)], Some(genesis), 0, vec![data(0xc)]);
    let winner = a.id.min(b.id);
    let loser = a.id.max(b.id);

    let build = |first: &Unit, second: &Unit, eager: bool| {
        let mut ledger = open_ledger();
        for unit in [first, second, &c] {
            ledger.add_unit(unit.clone()).unwrap();
            if eager {
                ledger.advance_stability().unwrap();
            }
        }
        let mut tip = c.id;
        for level in 3..=22u64 {
            tip = push_on_genesis(&mut ledger, &[tip], rotating(level), level);
            if eager {
                ledger.advance_stability().unwrap();
            }
        }
        ledger.advance_stability().unwrap();
        ledger
    };

    let ab = build(&a, &b, false);
    let ba = build(&b, &a, true);
    for ledger in [&ab, &ba] {
        assert_eq!(ledger.get_unit(&c.id).unwrap().best_parent, Some(winner));
        assert_eq!(ledger.stable_point(), 9);
        assert_eq!(ledger.units_at_mci(1), &[winner]);
        assert_eq!(ledger.units_at_mci(2), &[loser, c.id]);
        assert!(!ledger.get_unit(&loser).unwrap().is_on_main_chain);
    }
    assert_eq!(stable_snapshot(&ab), stable_snapshot(&ba));
}

// ── Scenario C: committee change at index 1000 ──────────────────────────

#[tokio::test]
async fn committee_change_has_no_race_window() {
    let mut ledger = open_ledger();
    let mut replaced: Vec<Address> = (0..11).map(witness).collect();
    replaced.push(witness(12));
    let next = Committee::new(replaced).unwrap();

    let mut units = grow(&mut ledger, 999, rotating);
    let proposal = ledger.compose_unit(
        vec![rotating(1000)],
        vec![data(1000), UnitMessage::CommitteeProposal(next.addresses().to_vec())],
    );
    ledger.add_unit(proposal.clone()).unwrap();
    ledger.advance_stability().unwrap();
    units.push(proposal.clone());
    units.extend(grow(&mut ledger, 12, rotating));

    // tip at level 1012: the proposal's index is not stable yet
    assert_eq!(ledger.stable_point(), 999);
    assert!(matches!(
        ledger.resolve_committee(1000),
        Err(ConsensusError::NotYetStable { requested: 1000, stable_point: 999 })
    ));
    assert_eq!(ledger.resolve_committee(999).unwrap(), &committee());

    units.extend(grow(&mut ledger, 1, rotating));
    assert_eq!(ledger.stable_point(), 1000);
    assert_eq!(ledger.units_at_mci(1000), &[proposal.id]);
    assert_eq!(ledger.resolve_committee(1000).unwrap(), &next);
    assert_eq!(ledger.resolve_committee(999).unwrap(), &committee());
    assert_eq!(ledger.pending_committee_change(999).unwrap().map(|e| e.mci), Some(1000));

    // witness(12) takes over the slot of witness(11) once units can cite index 1000
    units.extend(grow(&mut ledger, 30, |level| {
        if level > 1013 && level % 12 == 11 {
            witness(12)
        } else {
            rotating(level)
        }
    }));
    assert_eq!(ledger.stable_point(), 1030);
    let tip_walk = walk_witnesses(ledger.dag(), &ledger.best_tip().unwrap(), &next).unwrap();
    assert!(tip_walk.witnesses.contains(&witness(12)));

    // units built on index 1000 are judged with the new committee, earlier ones with the old
    let mut judged_differently = 0;
    for unit in &units {
        let record = ledger.get_unit(&unit.id).unwrap();
        let best_parent = record.best_parent.unwrap();
        let old_level = walk_witnesses(ledger.dag(), &best_parent, &committee())
            .unwrap()
            .witnessed_level
            .as_option();
        if unit.last_ball_mci >= 1000 {
            let new_level = walk_witnesses(ledger.dag(), &best_parent, &next)
                .unwrap()
                .witnessed_level
                .as_option();
            assert_eq!(record.witnessed_level, new_level);
            if new_level != old_level {
                judged_differently += 1;
            }
        } else {
            assert_eq!(record.witnessed_level, old_level);
        }
    }
    assert!(judged_differently > 0);
    let first_on_new = units
        .iter()
        .find(|u| u.last_ball_mci == 1000)
        .map(|u| u.id)
        .unwrap();

    // a second node receives every pair of units swapped
    let replica = ConsensusNode::new(open_ledger(), 16, 64);
    for pair in units.chunks(2) {
        for unit in pair.iter().rev() {
            let _ = replica.ingest(unit.clone()).await;
        }
    }
    assert_eq!(replica.pending_len().await, 0);
    assert_eq!(replica.stable_point().await, ledger.stable_point());
    assert_eq!(replica.resolve_committee(1000).await.unwrap(), next);
    assert_eq!(replica.resolve_committee(999).await.unwrap(), committee());

    let handle = replica.ledger();
    let replica_ledger = handle.read().await;
    for unit in &units {
        assert_eq!(
            replica_ledger.get_unit(&unit.id).unwrap().witnessed_level,
            ledger.get_unit(&unit.id).unwrap().witnessed_level
        );
    }
    assert!(replica_ledger.get_unit(&first_on_new).is_some());
    assert_eq!(stable_snapshot(&replica_ledger), stable_snapshot(&ledger));
}
