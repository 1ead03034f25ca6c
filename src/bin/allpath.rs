//! The proof driver CLI.
//!
//! Subcommands:
//! - `prove <spec.json> --definition DIR --server ADDR` runs the selected
//!   claims (all by default), dependencies first, and report per-proof
//!   verdicts.
//! - `show <proof-id> --save-directory DIR` prints one saved proof.
//! - `list --save-directory DIR` enumerates saved proofs and verdicts.
//! - `clean --save-directory DIR` deletes saved proof state.
//!
//! Exit codes: 0 all proofs passed, 1 one or more failed, 2 proofs still
//! pending (bounds hit or implications undecided), 3 usage or internal
//! error.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::info;

use allpath::claim::ClaimSet;
use allpath::client::SymbolicClient;
use allpath::definition::Definition;
use allpath::proof::{ProofStatus, ReachProof};
use allpath::prover::ProverOpts;
use allpath::report::BugReport;
use allpath::rpc::{transcript_handle, BackendProcess, JsonRpcClient, Transport};
use allpath::schedule::ProofSchedule;
use allpath::semantics::DefaultSemantics;
use allpath::utils::hash_str;

#[derive(Parser)]
#[command(name = "allpath", version, about = "All-path reachability proof driver")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Prove the claims in a spec file against an execution server.
    Prove {
        /// Claims file (JSON).
        spec_file: PathBuf,
        /// Compiled definition directory.
        #[arg(long)]
        definition: PathBuf,
        /// Claim labels to prove (default: all claims in the file).
        #[arg(long = "claim")]
        claims: Vec<String>,
        /// Stop each proof after this many prover iterations.
        #[arg(long)]
        max_iterations: Option<u64>,
        /// Maximum rewrite steps per execute call.
        #[arg(long)]
        execute_depth: Option<u64>,
        /// Rule labels the backend must stop and report on.
        #[arg(long = "cut-point")]
        cut_points: Vec<String>,
        /// Rule labels the backend must treat as halting.
        #[arg(long = "terminal")]
        terminals: Vec<String>,
        /// Loop-unrolling bound for bounded model checking.
        #[arg(long)]
        bmc_depth: Option<u64>,
        /// Backend connections to run in parallel.
        #[arg(long, default_value_t = 1)]
        workers: usize,
        /// Checkpoint proofs into this directory.
        #[arg(long)]
        save_directory: Option<PathBuf>,
        /// Additionally store proofs one file per node.
        #[arg(long)]
        save_nodes: bool,
        /// Execution server address (host:port, or a URL with --http).
        #[arg(long)]
        server: Option<String>,
        /// Spawn this server command and own its lifetime.
        #[arg(long)]
        server_cmd: Option<String>,
        /// Use HTTP POST instead of the TCP socket transport.
        #[arg(long)]
        http: bool,
        /// Simplify init and target states before exploring.
        #[arg(long)]
        simplify_init: bool,
        /// Per-call timeout, seconds.
        #[arg(long, default_value_t = 120)]
        timeout: u64,
        /// Transport retries per call.
        #[arg(long, default_value_t = 3)]
        max_retries: u32,
        /// Write a reproduction archive (.tar.gz) here.
        #[arg(long)]
        bug_report: Option<PathBuf>,
    },
    /// Print one saved proof.
    Show {
        proof_id: String,
        #[arg(long)]
        save_directory: PathBuf,
        /// Print the full node listing, not just the summary.
        #[arg(long)]
        nodes: bool,
        /// Lift edges and splits before printing.
        #[arg(long)]
        minimize: bool,
    },
    /// Interactive proof viewer (not provided by this driver).
    View { proof_id: String },
    /// Enumerate saved proofs and their verdicts.
    List {
        #[arg(long)]
        save_directory: PathBuf,
    },
    /// Delete saved proof state.
    Clean {
        #[arg(long)]
        save_directory: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "allpath=info".into()),
        )
        .with_target(false)
        .compact()
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            // clap would exit 2, which belongs to "pending" here
            let _ = err.print();
            return ExitCode::from(3);
        }
    };

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(3)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    match cli.command {
        Command::Prove {
            spec_file,
            definition,
            claims,
            max_iterations,
            execute_depth,
            cut_points,
            terminals,
            bmc_depth,
            workers,
            save_directory,
            save_nodes,
            server,
            server_cmd,
            http,
            simplify_init,
            timeout,
            max_retries,
            bug_report,
        } => {
            let defn = Definition::load(&definition)
                .with_context(|| format!("loading definition from {}", definition.display()))?;
            let claim_set = ClaimSet::load(&spec_file)
                .with_context(|| format!("loading claims from {}", spec_file.display()))?;

            let selected = if claims.is_empty() { None } else { Some(claims.as_slice()) };
            let mut schedule = ProofSchedule::from_claims(&claim_set, selected, bmc_depth)?;

            let _server_process = match &server_cmd {
                Some(cmd) => {
                    info!(command = %cmd, "spawning execution server");
                    Some(BackendProcess::spawn(cmd).context("spawning execution server")?)
                }
                None => None,
            };
            let Some(server) = server else {
                bail!("no execution server: pass --server ADDR (and optionally --server-cmd)");
            };
            let transport = if http {
                Transport::Http { url: server }
            } else {
                Transport::Tcp { addr: server }
            };

            let transcript = bug_report.as_ref().map(|_| transcript_handle());
            let lattice = Arc::new(defn.subsorts().clone());
            let make_backend = || {
                let mut rpc =
                    JsonRpcClient::new(transport.clone(), Duration::from_secs(timeout), max_retries);
                if let Some(handle) = &transcript {
                    rpc.record_transcript(handle.clone());
                }
                SymbolicClient::new(rpc, lattice.clone())
            };

            let opts = ProverOpts {
                max_iterations,
                execute_depth,
                cut_point_rules: cut_points,
                terminal_rules: terminals,
                dependencies_module: None,
                circularities_module: None,
                save_directory: save_directory.clone(),
                simplify_init,
            };

            let status = schedule
                .run(Arc::new(DefaultSemantics), &opts, workers, make_backend)
                .await?;

            for proof in schedule.proofs() {
                for line in proof.summary() {
                    println!("{line}");
                }
                if let Some(dir) = &save_directory {
                    proof.write_proof(dir)?;
                    if save_nodes {
                        proof.write_proof_data(dir)?;
                    }
                }
            }

            if let Some(report_path) = bug_report {
                let recorded = transcript
                    .as_ref()
                    .and_then(|handle| handle.lock().ok().map(|t| t.clone()));
                let report = BugReport {
                    definition_dir: Some(&definition),
                    claims_file: Some(&spec_file),
                    transcript: recorded.as_ref(),
                    proofs: schedule.proofs().collect(),
                };
                let written = report.write(&report_path)?;
                info!(path = %written.display(), "wrote bug report");
            }

            println!("{status}");
            Ok(match status {
                ProofStatus::Passed => ExitCode::SUCCESS,
                ProofStatus::Failed => ExitCode::from(1),
                ProofStatus::Pending => ExitCode::from(2),
            })
        }

        Command::Show { proof_id, save_directory, nodes, minimize } => {
            let mut proof = ReachProof::read_proof(&proof_id, &save_directory)
                .or_else(|_| ReachProof::read_proof_data(&proof_id, &save_directory))
                .with_context(|| format!("reading proof `{proof_id}`"))?;
            if minimize {
                proof.cfg.minimize();
            }
            for line in proof.summary() {
                println!("{line}");
            }
            if nodes {
                println!();
                for node in proof.cfg.nodes() {
                    println!("{}", proof.cfg.node_short_info(&node.id));
                    for succ in proof.cfg.successors(&node.id) {
                        let targets: Vec<String> =
                            succ.target_ids().iter().map(|t| t.shortened()).collect();
                        println!("  -> {}", targets.join(" | "));
                    }
                }
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::View { proof_id } => {
            bail!("the interactive viewer is not part of this driver; use `allpath show {proof_id} --nodes`")
        }

        Command::List { save_directory } => {
            for id in ReachProof::list_proofs(&save_directory)? {
                match ReachProof::read_proof(&id, &save_directory) {
                    Ok(proof) => println!("{id}: {}", proof.status()),
                    Err(err) => println!("{id}: unreadable ({err})"),
                }
            }
            Ok(ExitCode::SUCCESS)
        }

        Command::Clean { save_directory } => {
            let mut removed = 0usize;
            for id in ReachProof::list_proofs(&save_directory)? {
                let file = ReachProof::proof_path(&id, &save_directory);
                if file.is_file() {
                    std::fs::remove_file(&file)?;
                    removed += 1;
                }
                let node_dir = save_directory.join(hash_str(&id));
                if node_dir.is_dir() {
                    std::fs::remove_dir_all(&node_dir)?;
                }
            }
            println!("removed {removed} proofs");
            Ok(ExitCode::SUCCESS)
        }
    }
}
