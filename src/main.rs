//! pvcs scenario runner.
//!
//! This binary drives the staging engine end-to-end over the in-process
//! peer fabric: create/commit, transact/abort, fork/diverge/conflict,
//! and merge resolution.

use pvcs_meta::{RepoId, Transaction};
use pvcs_stage::{MapEvaluator, Stage};
use pvcs_wire::{LocalPeer, SubSpec};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let rt = tokio::runtime::Runtime::new().expect("tokio runtime");

    let args: Vec<String> = std::env::args().collect();
    let scenario = args.get(1).map(String::as_str).unwrap_or("basic");

    let result = match scenario {
        "basic" => rt.block_on(run_basic()),
        "abort" => rt.block_on(run_abort()),
        "conflict" => rt.block_on(run_conflict()),
        "merge" => rt.block_on(run_merge()),
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            println!("Unknown scenario: {}", other);
            print_usage();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("scenario failed: {}", e);
        std::process::exit(1);
    }
}

fn print_usage() {
    println!("Usage: pvcs [scenario]");
    println!();
    println!("Available scenarios:");
    println!("  basic     - create a repo, transact, commit (default)");
    println!("  abort     - a remote commit invalidates a staged transaction");
    println!("  conflict  - two sessions diverge and observe the conflict");
    println!("  merge     - resolve a divergence with a merge commit");
}

async fn session(peer: &LocalPeer, user: &str) -> Result<Stage, pvcs_stage::StageError> {
    Stage::create(
        user,
        peer.store(),
        MapEvaluator::with_defaults("demo-eval").shared(),
        |id| peer.connect_stage(id),
    )
    .await
}

fn spec_for(user: &str, repo: &RepoId, branch: &str) -> SubSpec {
    SubSpec::from([(
        user.to_string(),
        BTreeMap::from([(repo.clone(), BTreeSet::from([branch.to_string()]))]),
    )])
}

fn show(label: &str, stage: &Stage, user: &str, repo: &RepoId, branch: &str) {
    let value = stage.current_value();
    match value.get(user, repo, branch) {
        Some(view) => println!("{label}: {view:?}"),
        None => println!("{label}: <no value>"),
    }
}

async fn run_basic() -> Result<(), pvcs_stage::StageError> {
    println!("== basic: create, transact, commit ==");
    let peer = LocalPeer::new("hub");
    let stage = session(&peer, "john").await?;

    let repo = stage
        .create_repo("demo repo", json!({"init": 43}), "master")
        .await?;
    show("after create", &stage, "john", &repo, "master");

    stage
        .transact(
            "john",
            &repo,
            "master",
            vec![Transaction::new(json!({"b": 2}), "merge")],
        )
        .await?;
    show("after transact", &stage, "john", &repo, "master");

    stage
        .commit(&[("john".to_string(), repo.clone(), "master".to_string())])
        .await?;
    show("after commit", &stage, "john", &repo, "master");

    Ok(())
}

async fn run_abort() -> Result<(), pvcs_stage::StageError> {
    println!("== abort: a remote commit invalidates a staged transaction ==");
    let peer = LocalPeer::new("hub");
    let writer = session(&peer, "john").await?;
    let device = session(&peer, "john").await?;

    let repo = writer
        .create_repo("demo repo", json!({"init": 43}), "master")
        .await?;
    device
        .subscribe_repos(spec_for("john", &repo, "master"))
        .await?;

    writer
        .transact(
            "john",
            &repo,
            "master",
            vec![Transaction::new(json!({"b": 2}), "merge")],
        )
        .await?;
    show("staged on writer", &writer, "john", &repo, "master");

    device
        .transact(
            "john",
            &repo,
            "master",
            vec![Transaction::new(json!({"c": 3}), "merge")],
        )
        .await?;
    device
        .commit(&[("john".to_string(), repo.clone(), "master".to_string())])
        .await?;

    wait_for_view(&writer, &repo, |view| view.abort().is_some()).await;
    show("after remote commit", &writer, "john", &repo, "master");

    Ok(())
}

async fn diverge(peer: &LocalPeer) -> Result<(Stage, Stage, RepoId), pvcs_stage::StageError> {
    let first = session(peer, "john").await?;
    let second = session(peer, "john").await?;

    let repo = first
        .create_repo("demo repo", json!({"init": 43}), "master")
        .await?;

    second
        .subscribe_repos(spec_for("john", &repo, "master"))
        .await?;
    second
        .transact(
            "john",
            &repo,
            "master",
            vec![Transaction::new(json!({"b": 2}), "merge")],
        )
        .await?;
    second.subscribe_repos(SubSpec::new()).await?;

    first
        .transact(
            "john",
            &repo,
            "master",
            vec![Transaction::new(json!({"a": 1}), "merge")],
        )
        .await?;
    first
        .commit(&[("john".to_string(), repo.clone(), "master".to_string())])
        .await?;
    second
        .commit(&[("john".to_string(), repo.clone(), "master".to_string())])
        .await?;

    wait_for_view(&first, &repo, |view| view.conflict().is_some()).await;
    Ok((first, second, repo))
}

async fn run_conflict() -> Result<(), pvcs_stage::StageError> {
    println!("== conflict: two sessions diverge ==");
    let peer = LocalPeer::new("hub");
    let (first, _second, repo) = diverge(&peer).await?;
    show("conflicted", &first, "john", &repo, "master");
    Ok(())
}

async fn run_merge() -> Result<(), pvcs_stage::StageError> {
    println!("== merge: resolve a divergence ==");
    let peer = LocalPeer::new("hub");
    let (first, _second, repo) = diverge(&peer).await?;
    show("conflicted", &first, "john", &repo, "master");

    let meta = first.state_snapshot().repos["john"][&repo].meta.clone();
    let heads: Vec<_> = meta
        .heads("master")
        .expect("branch exists")
        .iter()
        .copied()
        .collect();
    let merged = first.merge("john", &repo, "master", &heads, true).await?;
    println!("merge applied: {merged}");
    show("after merge", &first, "john", &repo, "master");

    Ok(())
}

async fn wait_for_view(
    stage: &Stage,
    repo: &RepoId,
    pred: impl Fn(&pvcs_stage::BranchView) -> bool,
) {
    let mut values = stage.value_stream();
    let result = tokio::time::timeout(
        Duration::from_secs(10),
        values.wait_for(|v| v.get("john", repo, "master").map(&pred).unwrap_or(false)),
    )
    .await;
    if result.is_err() {
        eprintln!("timed out waiting for the expected view");
    }
}
