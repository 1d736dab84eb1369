// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! hdaq-bnet - in-process event building cluster
//!
//! Runs generators, combiners, transports and builders of a whole cluster
//! over the loopback fabric, or prints the transfer schedule of a pattern.

use clap::{Parser, Subcommand};
use hdaq::{CommandResult, RuntimeConfig, RuntimeContext};
use hdaq_bnet::{BnetConfig, Cluster, ClusterOptions, GeneratorConfig, Pattern, Schedule, TransportStats};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// HDAQ event building cluster
#[derive(Parser, Debug)]
#[command(name = "hdaq-bnet")]
#[command(version)]
#[command(about = "Run an in-process event building cluster")]
struct Args {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Build events on a loopback cluster
    Run {
        /// TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Number of nodes (overrides the file)
        #[arg(short, long)]
        nodes: Option<usize>,

        /// Node 0 only controls the run
        #[arg(long)]
        controller: bool,

        /// Schedule pattern number (0-5, 7 for a file)
        #[arg(short, long)]
        pattern: Option<u32>,

        /// Run duration in seconds
        #[arg(short, long, default_value = "10")]
        duration: u64,

        /// Events per generator, unlimited when absent
        #[arg(short, long)]
        events: Option<u32>,

        /// Nodes started without modules
        #[arg(long, value_delimiter = ',')]
        dead: Vec<usize>,
    },

    /// Print the schedule of a pattern
    Schedule {
        /// Schedule pattern number (0-5)
        #[arg(short, long, default_value = "0")]
        pattern: u32,

        /// Number of nodes
        #[arg(short, long, default_value = "4")]
        nodes: usize,

        /// Transport channels
        #[arg(short, long, default_value = "1")]
        channels: usize,

        /// Slot duration in microseconds
        #[arg(long, default_value = "2000")]
        slot_us: u64,

        /// Write the schedule to this file
        #[arg(short, long)]
        save: Option<PathBuf>,
    },
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    if let Err(e) = run(&args) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    match &args.mode {
        Mode::Run {
            config,
            nodes,
            controller,
            pattern,
            duration,
            events,
            dead,
        } => {
            let mut cfg = match config {
                Some(path) => BnetConfig::from_file(path)?,
                None => BnetConfig::default(),
            };
            if let Some(n) = nodes {
                cfg.nodes = *n;
            }
            if let Some(p) = pattern {
                cfg.pattern = *p;
            }
            cfg.controller |= *controller;
            run_cluster(&cfg, Duration::from_secs(*duration), *events, dead.clone())
        }
        Mode::Schedule {
            pattern,
            nodes,
            channels,
            slot_us,
            save,
        } => print_schedule(*pattern, *nodes, *channels, *slot_us, save.as_ref()),
    }
}

fn run_cluster(
    cfg: &BnetConfig,
    duration: Duration,
    events: Option<u32>,
    dead_nodes: Vec<usize>,
) -> Result<(), Box<dyn std::error::Error>> {
    println!("=== HDAQ event building: {} nodes ===\n", cfg.nodes);
    println!("  Pattern:    {}", cfg.schedule_pattern().name());
    println!("  Controller: {}", if cfg.controller { "node 0" } else { "none" });
    if !dead_nodes.is_empty() {
        println!("  Dead nodes: {:?}", dead_nodes);
    }

    let prepared = match &cfg.schedule_file {
        Some(path) if cfg.schedule_pattern() == Pattern::File => Some(Schedule::read_from_file(path)?),
        _ => None,
    };
    let options = ClusterOptions {
        generator: GeneratorConfig {
            total_events: events,
            ..GeneratorConfig::default()
        },
        dead_nodes,
    };

    let ctx = RuntimeContext::new(RuntimeConfig::default())?;
    let cluster = Cluster::deploy(&ctx, cfg, &options, prepared)?;
    println!("  Builders:   {:?}\n", cluster.builders());

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || r.store(false, Ordering::SeqCst))?;

    ctx.start_all()?;
    log::info!("[hdaq-bnet] cluster of {} nodes started", cfg.nodes);
    let start = Instant::now();
    let expected = events.map(u64::from);
    let mut last_report = Instant::now();

    while running.load(Ordering::SeqCst) && start.elapsed() < duration && !ctx.is_exit_requested() {
        std::thread::sleep(Duration::from_millis(50));
        let built = cluster.built_events();
        if last_report.elapsed() >= Duration::from_secs(1) {
            let rate = built as f64 / start.elapsed().as_secs_f64();
            println!("  [{:>5.1}s] built {} events ({:.0} ev/s)", start.elapsed().as_secs_f64(), built, rate);
            last_report = Instant::now();
        }
        if expected.is_some_and(|n| built >= n) {
            break;
        }
    }
    let elapsed = start.elapsed();

    println!("\n=== Results ===");
    println!("  Duration:      {:.2?}", elapsed);
    println!("  Built events:  {}", cluster.built_events());
    print_stats("Transport (local)", &cluster.transport_totals());

    if cfg.controller {
        let reply = cluster.collect_results(&ctx, Duration::from_secs(5));
        match (reply.result, reply.command) {
            (CommandResult::True, Some(cmd)) => {
                println!("  Collected from {} nodes", cmd.get_uint("nodes", 0));
                print_stats("Transport (collected)", &TransportStats::from_command(&cmd));
            }
            (result, _) => println!("  Collecting results failed: {:?}", result),
        }
    }

    let fatal = ctx.fatal_error();
    ctx.shutdown();
    if let Some(err) = fatal {
        return Err(err.to_string().into());
    }
    Ok(())
}

fn print_stats(title: &str, stats: &TransportStats) {
    println!("  {}:", title);
    println!("    Packets:     {} sent, {} received", stats.sent_packets, stats.recv_packets);
    println!("    Bytes:       {} sent, {} received", stats.sent_bytes, stats.recv_bytes);
    println!("    Bundles:     {} complete, {} incomplete", stats.bundles, stats.incomplete);
    println!("    Lost:        {}, skipped {}", stats.lost, stats.skipped);
    println!("    Latency:     {:.1} us", stats.mean_latency_us());
}

fn print_schedule(
    pattern: u32,
    nodes: usize,
    channels: usize,
    slot_us: u64,
    save: Option<&PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    let pattern = Pattern::from_number(pattern)
        .filter(|p| *p != Pattern::File)
        .ok_or_else(|| format!("unknown pattern {}", pattern))?;
    if nodes == 0 {
        return Err("at least one node is required".into());
    }
    let step = Duration::from_micros(slot_us).as_secs_f64();
    let schedule = Schedule::for_pattern(pattern, nodes, channels, step, None);
    // only round-robin covers every pair
    if pattern == Pattern::RoundRobin {
        schedule.prove(None)?;
    }

    println!("# {} for {} nodes", pattern.name(), nodes);
    print!("{}", schedule.to_text());
    if let Some(path) = save {
        schedule.save_to_file(path)?;
        println!("# saved to {}", path.display());
    }
    Ok(())
}
