use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};

use objex::analysis::make_analysis_db;
use objex::capture::heap::MemHeap;
use objex::capture::{dump_graph, CaptureOptions};
use objex::error::ObjexError;
use objex::observability::init_logging;
use objex::query::paths::Termination;
use objex::query::QueryEngine;

#[derive(Parser)]
#[command(name = "objex")]
#[command(about = "Heap snapshot capture and retention exploration", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture a raw snapshot (of the built-in demo heap; real deployments
    /// embed the capture entry point in the target process)
    Capture {
        /// Destination path; must not exist
        dest: PathBuf,

        /// Seconds to wait before capturing
        #[arg(long, default_value_t = 0)]
        delay: u64,

        /// Hold off until this process's RSS reaches the threshold (MiB)
        #[arg(long)]
        min_rss_mb: Option<i64>,

        /// Record the capturing thread's own frames
        #[arg(long)]
        include_own_frames: bool,

        /// Preview cap for string-like objects (bytes)
        #[arg(long, default_value_t = 256)]
        max_string_preview: usize,

        /// Preview cap for user-class instances (bytes)
        #[arg(long, default_value_t = 128)]
        max_instance_preview: usize,

        /// Skip the generic referent enumeration for opaque objects
        #[arg(long)]
        no_generic_referents: bool,
    },

    /// Build the analysis artifact from a raw snapshot
    Analyze {
        /// Raw snapshot produced by `capture`
        raw: PathBuf,
        /// Output path for the analysis artifact; must not exist
        analysis: PathBuf,
    },

    /// Inspect an analysis artifact
    Explore {
        /// Analysis artifact produced by `analyze`
        artifact: PathBuf,

        /// Look up one node and print its edges
        #[arg(long)]
        node: Option<i64>,

        /// Print retention paths for a node
        #[arg(long)]
        paths: Option<i64>,

        /// Maximum number of retention paths
        #[arg(long, default_value_t = 5)]
        k: usize,

        /// Jump to a random non-root node
        #[arg(long)]
        random: bool,

        /// Rows in the top-N reports
        #[arg(long, default_value_t = 10)]
        top: usize,
    },
}

fn main() -> ExitCode {
    init_logging();
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("objex: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> objex::error::Result<()> {
    match cli.command {
        Commands::Capture {
            dest,
            delay,
            min_rss_mb,
            include_own_frames,
            max_string_preview,
            max_instance_preview,
            no_generic_referents,
        } => {
            if delay > 0 {
                tracing::info!(delay, "waiting before capture");
                std::thread::sleep(Duration::from_secs(delay));
            }
            if let Some(threshold) = min_rss_mb {
                wait_for_rss(threshold);
            }
            let options = CaptureOptions {
                include_own_frames,
                max_string_preview,
                max_instance_preview,
                generic_referents: !no_generic_referents,
            };
            let heap = demo_heap();
            let stats = dump_graph(&dest, &heap, &options)?;
            println!(
                "captured {} objects, {} references into {}",
                stats.objects,
                stats.references,
                dest.display()
            );
            Ok(())
        }

        Commands::Analyze { raw, analysis } => {
            make_analysis_db(&raw, &analysis)?;
            println!("analysis artifact ready at {}", analysis.display());
            Ok(())
        }

        Commands::Explore {
            artifact,
            node,
            paths,
            k,
            random,
            top,
        } => explore(&artifact, node, paths, k, random, top),
    }
}

fn explore(
    artifact: &Path,
    node: Option<i64>,
    paths: Option<i64>,
    k: usize,
    random: bool,
    top: usize,
) -> objex::error::Result<()> {
    let engine = match QueryEngine::open(artifact) {
        Ok(engine) => engine,
        Err(ObjexError::SnapshotIncomplete(_)) => {
            eprintln!("warning: snapshot is incomplete, results may be partial");
            QueryEngine::open_degraded(artifact)?
        }
        Err(e) => return Err(e),
    };

    if let Some(id) = node {
        let record = engine.lookup(id)?;
        println!("{}", serde_json::to_string_pretty(&record.summary)?);
        println!("{} objects refer to {}", record.inbound_count, record.summary);
        for edge in engine.inbound(id)? {
            println!("  {}{}", edge.summary, edge.label);
        }
        println!("{} refers to {} objects", record.summary, record.outbound.len());
        for edge in &record.outbound {
            println!("  {}: {}", edge.label, edge.summary);
        }
        return Ok(());
    }

    if let Some(id) = paths {
        let result = engine.paths_to_roots(id, k)?;
        match result.termination {
            Termination::ModuleReachable => println!("reachable from a module:"),
            Termination::FrameOnly => println!("reachable only from a frame:"),
            Termination::NoRootReachable => println!("no root reachable"),
            Termination::BudgetExhausted => println!("no root reachable within budget"),
        }
        for path in &result.paths {
            println!("  {path}");
        }
        return Ok(());
    }

    if random {
        match engine.random()? {
            Some(id) => println!("{}", engine.summary(id)?),
            None => println!("snapshot has no non-root nodes"),
        }
        return Ok(());
    }

    // Default: stats plus the top-N reports.
    let stats = engine.stats()?;
    println!("{}", serde_json::to_string_pretty(&stats)?);
    println!("top {top} types by memory:");
    for cost in engine.cost_by_type(top)? {
        println!(
            "  {:40} {:8} instances {:10} bytes ({:.1}%)",
            cost.name, cost.instances, cost.bytes, cost.percent
        );
    }
    println!("top {top} most referenced:");
    for (count, summary) in engine.most_referenced(top)? {
        println!("  {summary} ({count})");
    }
    Ok(())
}

/// Poll the process's RSS until it crosses `threshold_mb`.
fn wait_for_rss(threshold_mb: i64) {
    loop {
        let rss = current_rss_mb();
        if rss >= threshold_mb {
            return;
        }
        tracing::info!(rss, threshold_mb, "below RSS threshold, waiting");
        std::thread::sleep(Duration::from_secs(1));
    }
}

fn current_rss_mb() -> i64 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(statm) = std::fs::read_to_string("/proc/self/statm") {
            if let Some(pages) = statm.split_whitespace().nth(1) {
                if let Ok(pages) = pages.parse::<i64>() {
                    return pages * 4096 / (1024 * 1024);
                }
            }
        }
    }
    0
}

/// A small self-describing heap so the capture → analyze → explore loop can
/// be exercised without embedding objex in a target process.
fn demo_heap() -> MemHeap {
    let mut heap = MemHeap::new();

    let main_mod = heap.add_module("__main__");
    let config = heap.add_module("app.config");

    let greeting = heap.add_str("hello from the demo heap");
    heap.set_attr(main_mod, "greeting", greeting);

    let settings = heap.add_dict();
    let host = heap.add_str("localhost");
    let port = heap.add_int(8080);
    heap.dict_insert(settings, "host", host);
    heap.dict_insert(settings, "port", port);
    heap.set_attr(config, "settings", settings);

    let cls = heap.add_class("Session");
    let mut sessions = Vec::new();
    for i in 0..5 {
        let session = heap.add_instance(cls, &format!("Session(id={i})"));
        let token = heap.add_str(&format!("token-{i}"));
        heap.set_attr(session, "token", token);
        sessions.push(session);
    }
    let registry = heap.add_list(sessions);
    heap.set_attr(main_mod, "sessions", registry);

    let code = heap.add_code("serve_forever");
    let serve = heap.add_function("serve_forever", Some(code));
    heap.set_attr(main_mod, "serve_forever", serve);

    let frame = heap.add_frame("serve_forever", None);
    heap.frame_local(frame, "pending", registry);
    heap.frame_context(frame, None, Some(code));
    heap.add_thread(1, frame);

    heap
}
