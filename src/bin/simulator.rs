//! Keel DAG Simulator
//!
//! Spins up a consensus node on a temporary sled database, lets randomly
//! chosen witnesses post rounds of concurrent units, replaces a witness
//! a third of the way through, and then replays the whole DAG into a second node in
//! shuffled order to check that both agree on every stable ball.
//!
//! Usage: cargo run --bin simulator -- --rounds 200 --seed 7

use std::sync::Arc;

use clap::Parser;
use colored::Colorize;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{RngExt, SeedableRng};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use keel::config::{dev_witness, KeelConfig};
use keel::consensus::dag::{Unit, UnitMessage};
use keel::consensus::skiplist::verify_proof_chain;
use keel::consensus::witnesses::Committee;
use keel::node::ConsensusNode;
use keel::state::{Ledger, StabilityAdvance};
use keel::storage::SledStorage;

#[derive(Parser, Debug)]
#[command(name = "simulator", version, about = "Keel witnessed-DAG simulator")]
struct Cli {
    /// Number of rounds of concurrent units.
    #[arg(long, default_value_t = 120)]
    rounds: u64,

    /// Units posted per round, each by a different witness.
    #[arg(long, default_value_t = 3)]
    authors_per_round: usize,

    /// RNG seed; random if omitted.
    #[arg(long)]
    seed: Option<u64>,

    /// Skip the witness replacement.
    #[arg(long)]
    no_committee_change: bool,
}

/// Result of a single check.
struct TestResult {
    name: String,
    passed: bool,
    detail: String,
}

impl TestResult {
    fn pass(name: &str, detail: &str) -> Self {
        Self {
            name: name.to_string(),
            passed: true,
            detail: detail.to_string(),
        }
    }
    fn fail(name: &str, detail: &str) -> Self {
        Self {
            name: name.to_string(),
            passed: false,
            detail: detail.to_string(),
        }
    }
    fn check(name: &str, ok: bool, detail: String) -> Self {
        if ok {
            Self::pass(name, &detail)
        } else {
            Self::fail(name, &detail)
        }
    }
}

type SimNode = ConsensusNode<SledStorage>;

fn new_node(config: &KeelConfig) -> Result<SimNode, String> {
    let committee = config.parse_genesis_committee().map_err(|e| e.to_string())?;
    let storage = SledStorage::open_temporary().map_err(|e| e.to_string())?;
    let ledger = Ledger::open(storage, &config.consensus.network, committee).map_err(|e| e.to_string())?;
    Ok(ConsensusNode::new(
        ledger,
        config.consensus.event_channel_capacity,
        config.consensus.max_pending_units,
    ))
}

/// The committee with its last witness swapped for a fresh address.
fn replacement_committee(current: &Committee) -> Result<Committee, String> {
    let mut addresses = current.addresses().to_vec();
    addresses.pop();
    addresses.push(dev_witness(keel::constants::COMMITTEE_SIZE as u8));
    Committee::new(addresses).map_err(|e| e.to_string())
}

/// Compose one round of units against the same snapshot of free units.
async fn compose_round(
    node: &SimNode,
    rng: &mut StdRng,
    round: u64,
    authors_per_round: usize,
    proposal: Option<&Committee>,
) -> Result<Vec<Unit>, String> {
    let handle = node.ledger();
    let ledger = handle.read().await;
    let committee = ledger
        .resolve_committee(ledger.stable_point())
        .map_err(|e| e.to_string())?;
    let mut authors = committee.addresses().to_vec();
    authors.shuffle(rng);
    let count = authors_per_round.clamp(1, authors.len());
    Ok(authors
        .into_iter()
        .take(count)
        .enumerate()
        .map(|(i, author)| {
            let mut messages = vec![UnitMessage::Data(format!("round {round} unit {i}").into_bytes())];
            if i == 0 {
                if let Some(next) = proposal {
                    messages.push(UnitMessage::CommitteeProposal(next.addresses().to_vec()));
                }
            }
            ledger.compose_unit(vec![author], messages)
        })
        .collect())
}

fn drain_events(rx: &mut tokio::sync::broadcast::Receiver<StabilityAdvance>, log: &mut Vec<StabilityAdvance>) {
    while let Ok(event) = rx.try_recv() {
        log.push(event);
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let seed = cli.seed.unwrap_or_else(|| rand::rng().random_range(0..u64::MAX));

    println!("\n{}", "========================================".bright_cyan());
    println!("{}", "        KEEL DAG SIMULATOR".bright_cyan().bold());
    println!("{}\n", "========================================".bright_cyan());
    println!(
        "  rounds={} authors_per_round={} seed={}",
        cli.rounds, cli.authors_per_round, seed
    );

    let mut results: Vec<TestResult> = Vec::new();
    match simulate(&cli, seed, &mut results).await {
        Ok(()) => {}
        Err(e) => {
            println!("  {} {}", "FAIL".red().bold(), e);
            results.push(TestResult::fail("Simulation", &e));
        }
    }

    print_summary(&results);
    let all_passed = results.iter().all(|r| r.passed);
    std::process::exit(if all_passed { 0 } else { 1 });
}

async fn simulate(cli: &Cli, seed: u64, results: &mut Vec<TestResult>) -> Result<(), String> {
    let config = KeelConfig::default();
    let mut rng = StdRng::seed_from_u64(seed);

    // ── Phase 1: Concurrent rounds ──
    println!("\n{}", "[Phase 1] Witnesses posting concurrent rounds...".yellow());

    let node = new_node(&config)?;
    let mut events_rx = node.subscribe();
    let mut events = Vec::new();
    let mut all_units: Vec<Unit> = Vec::new();
    let genesis_committee = config.parse_genesis_committee().map_err(|e| e.to_string())?;
    let next_committee = replacement_committee(&genesis_committee)?;
    let change_round = (!cli.no_committee_change).then_some(cli.rounds / 3);

    for round in 0..cli.rounds {
        let proposal = (change_round == Some(round)).then_some(&next_committee);
        let mut units = compose_round(&node, &mut rng, round, cli.authors_per_round, proposal).await?;
        units.shuffle(&mut rng);
        for unit in units {
            node.ingest(unit.clone()).await.map_err(|e| e.to_string())?;
            all_units.push(unit);
        }
        drain_events(&mut events_rx, &mut events);
        if round % 20 == 19 {
            println!(
                "  round {:>4}: stable point {}",
                round + 1,
                node.stable_point().await
            );
        }
    }

    let stable_point = node.stable_point().await;
    let contiguous = events
        .windows(2)
        .all(|pair| pair[0].new_mci == pair[1].old_mci && pair[1].new_mci > pair[1].old_mci);
    results.push(TestResult::check(
        "Stability Advances",
        stable_point > 0 && contiguous,
        format!("stable point {stable_point} after {} batches", events.len()),
    ));
    println!(
        "  {} {} units, stable point {}",
        "OK".green().bold(),
        all_units.len(),
        stable_point
    );

    // ── Phase 2: Proof chain ──
    println!("\n{}", "[Phase 2] Building a proof chain to genesis...".yellow());

    let chain = node
        .build_proof_chain(0, stable_point)
        .await
        .map_err(|e| e.to_string())?;
    let genesis_ball = node.genesis_ball().await.map_err(|e| e.to_string())?;
    let verified = verify_proof_chain(&chain, &genesis_ball);
    results.push(TestResult::check(
        "Proof Chain",
        verified.is_ok(),
        match &verified {
            Ok(()) => format!("{} links cover {} indices", chain.len(), stable_point + 1),
            Err(e) => e.to_string(),
        },
    ));

    // ── Phase 3: Committee change ──
    if change_round.is_some() {
        println!("\n{}", "[Phase 3] Checking the witness replacement...".yellow());
        let current = node
            .resolve_committee(stable_point)
            .await
            .map_err(|e| e.to_string())?;
        let genesis_view = node.resolve_committee(0).await.map_err(|e| e.to_string())?;
        results.push(TestResult::check(
            "Committee Change",
            current == next_committee && genesis_view == genesis_committee,
            format!(
                "index {stable_point} resolves {} the new witness",
                if current.contains(&dev_witness(keel::constants::COMMITTEE_SIZE as u8)) { "with" } else { "without" }
            ),
        ));
    }

    // ── Phase 4: Shuffled replay ──
    println!("\n{}", "[Phase 4] Replaying the DAG in shuffled order...".yellow());

    let replica = Arc::new(new_node(&config)?);
    let (tx, rx) = mpsc::channel(keel::constants::INGEST_CHANNEL_CAPACITY);
    let shutdown = CancellationToken::new();
    let runner = {
        let replica = Arc::clone(&replica);
        let shutdown = shutdown.clone();
        tokio::spawn(async move { replica.run(rx, shutdown).await })
    };
    let mut replay = all_units.clone();
    replay.shuffle(&mut rng);
    for unit in replay {
        tx.send(unit).await.map_err(|e| e.to_string())?;
    }
    drop(tx);
    runner.await.map_err(|e| e.to_string())?;

    let replica_point = replica.stable_point().await;
    let common = replica_point.min(stable_point);
    let mut mismatches = 0;
    for mci in 0..=common {
        let ours = node.build_proof_chain(mci, mci).await.map_err(|e| e.to_string())?;
        let theirs = replica.build_proof_chain(mci, mci).await.map_err(|e| e.to_string())?;
        if ours.balls() != theirs.balls() {
            mismatches += 1;
        }
    }
    results.push(TestResult::check(
        "Shuffled Replay",
        mismatches == 0 && replica.pending_len().await == 0,
        format!("replica stable point {replica_point}, {mismatches} ball mismatches up to {common}"),
    ));
    shutdown.cancel();

    for r in results.iter() {
        let status = if r.passed {
            "OK".green().bold()
        } else {
            "FAIL".red().bold()
        };
        println!("  {} {} - {}", status, r.name, r.detail);
    }
    Ok(())
}

// ── Summary ──

fn print_summary(results: &[TestResult]) {
    println!("\n{}", "========================================".bright_cyan());
    println!("{}", "          SIMULATION RESULTS".bright_cyan().bold());
    println!("{}\n", "========================================".bright_cyan());

    let passed = results.iter().filter(|r| r.passed).count();
    let failed = results.iter().filter(|r| !r.passed).count();
    let total = results.len();

    for r in results {
        let icon = if r.passed {
            "PASS".green().bold()
        } else {
            "FAIL".red().bold()
        };
        let detail = if r.passed {
            r.detail.dimmed().to_string()
        } else {
            r.detail.red().to_string()
        };
        println!("  [{}] {} - {}", icon, r.name, detail);
    }

    println!();
    if failed == 0 {
        println!("  {} {}/{} checks passed", "ALL PASSED".green().bold(), passed, total);
    } else {
        println!(
            "  {} {}/{} passed, {} failed",
            "SOME FAILED".red().bold(),
            passed,
            total,
            failed
        );
    }
    println!();
}
