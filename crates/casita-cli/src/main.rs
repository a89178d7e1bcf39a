//! casita — offline performance analyzer for HPC execution traces.
//!
//! Reads a trace, reconstructs the causal event graph across all streams,
//! classifies wait states, computes the program-wide critical path, and
//! optionally writes an annotated trace.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::thread;

use casita_analysis::{AnalysisEngine, Statistics};
use casita_critical::{CriticalPathSection, compute_critical_path};
use casita_replay::LocalRouter;
use casita_trace::{
    AnnotatedEvent, Definition, TraceEvent, TraceSink, deliver, read_records, write_annotated,
};
use casita_types::RecordKind;

// ── Options ─────────────────────────────────────────────────────

struct ProgramOptions {
    input: String,
    output: Option<String>,
    create_otf: bool,
    print_critical_path: bool,
    merge_activities: bool,
    no_errors: bool,
    verbose: u32,
    mem_limit_mb: Option<u64>,
}

fn usage() -> String {
    "usage: casita [options] --input <trace>\n\
     \n\
     options:\n\
     \x20 --input <trace>          trace file to analyze (also accepted positionally)\n\
     \x20 --output <path>          path for the annotated trace\n\
     \x20 --create-otf             write the annotated trace\n\
     \x20 --print-critical-path    print the critical-path sections\n\
     \x20 --merge-activities       print per-region activity totals\n\
     \x20 --no-errors              treat malformed trace records as fatal\n\
     \x20 --verbose <n>            log verbosity (0..3)\n\
     \x20 --mem-limit <MB>         abort when the trace exceeds this estimate"
        .to_string()
}

fn parse_args(args: Vec<String>) -> Result<ProgramOptions, String> {
    let mut options = ProgramOptions {
        input: String::new(),
        output: None,
        create_otf: false,
        print_critical_path: false,
        merge_activities: false,
        no_errors: false,
        verbose: 0,
        mem_limit_mb: None,
    };
    let mut i = 0usize;
    while i < args.len() {
        match args[i].as_str() {
            "--input" => {
                i += 1;
                let Some(value) = args.get(i) else {
                    return Err("missing value for --input".to_string());
                };
                options.input = value.clone();
            }
            "--output" => {
                i += 1;
                let Some(value) = args.get(i) else {
                    return Err("missing value for --output".to_string());
                };
                options.output = Some(value.clone());
            }
            "--create-otf" => options.create_otf = true,
            "--print-critical-path" => options.print_critical_path = true,
            "--merge-activities" => options.merge_activities = true,
            "--no-errors" => options.no_errors = true,
            "--verbose" => {
                i += 1;
                let Some(value) = args.get(i) else {
                    return Err("missing value for --verbose".to_string());
                };
                options.verbose = value
                    .parse()
                    .map_err(|e| format!("invalid --verbose: {e}"))?;
            }
            "--mem-limit" => {
                i += 1;
                let Some(value) = args.get(i) else {
                    return Err("missing value for --mem-limit".to_string());
                };
                options.mem_limit_mb = Some(
                    value
                        .parse()
                        .map_err(|e| format!("invalid --mem-limit: {e}"))?,
                );
            }
            "--help" | "-h" => {
                println!("{}", usage());
                std::process::exit(0);
            }
            other if !other.starts_with('-') && options.input.is_empty() => {
                options.input = other.to_string();
            }
            other => return Err(format!("unknown option: {other}\n\n{}", usage())),
        }
        i += 1;
    }
    if options.input.is_empty() {
        return Err(format!("no input trace given\n\n{}", usage()));
    }
    Ok(options)
}

fn init_tracing(verbose: u32) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

// ── Per-rank results ────────────────────────────────────────────

struct RankOutput {
    annotated: Vec<AnnotatedEvent>,
    sections: Vec<CriticalPathSection>,
    global_length: u64,
    reduced_stats: Statistics,
    region_totals: HashMap<String, (u64, u64)>,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("casita: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let options = parse_args(std::env::args().skip(1).collect())?;
    init_tracing(options.verbose);

    let file =
        File::open(&options.input).map_err(|e| format!("cannot open {}: {e}", options.input))?;
    let records =
        read_records(BufReader::new(file)).map_err(|e| format!("{}: {e}", options.input))?;

    if let Some(limit) = options.mem_limit_mb {
        // coarse per-record footprint estimate
        let estimated_mb = (records.len() as u64 * 256) / (1024 * 1024);
        if estimated_mb > limit {
            return Err(format!(
                "trace needs an estimated {estimated_mb} MB, above the {limit} MB limit"
            ));
        }
    }

    let mut partition = TracePartition::default();
    deliver(&records, &mut partition);

    let definitions = partition.definitions;
    let rank_count = partition
        .location_ranks
        .values()
        .copied()
        .max()
        .map_or(1, |r| r + 1);

    // rule replay relies on trace order per rank
    let mut events = partition.events;
    events.sort_by_key(|e| (e.time, e.location));

    let mut per_rank: Vec<Vec<TraceEvent>> = vec![Vec::new(); rank_count as usize];
    for event in events {
        if let Some(rank) = partition.location_ranks.get(&event.location.0) {
            per_rank[*rank as usize].push(event);
        } else {
            tracing::warn!(location = event.location.0, "event for undefined location");
        }
    }

    let outputs = run_ranks(&definitions, per_rank, options.no_errors)?;

    report(&options, &definitions, outputs)
}

/// Reader sink that splits a trace into definitions and events and learns
/// the location→rank mapping on the way.
#[derive(Default)]
struct TracePartition {
    definitions: Vec<Definition>,
    events: Vec<TraceEvent>,
    location_ranks: HashMap<u64, u32>,
}

impl TraceSink for TracePartition {
    fn definition(&mut self, definition: &Definition) {
        if let Definition::Location { id, rank, .. } = definition {
            self.location_ranks.insert(id.0, *rank);
        }
        self.definitions.push(definition.clone());
    }

    fn event(&mut self, event: &TraceEvent) {
        self.events.push(event.clone());
    }
}

/// One analysis thread per rank over a shared in-process router.
fn run_ranks(
    definitions: &[Definition],
    per_rank: Vec<Vec<TraceEvent>>,
    strict: bool,
) -> Result<Vec<RankOutput>, String> {
    let router = LocalRouter::new(per_rank.len() as u32);
    let handles: Vec<_> = per_rank
        .into_iter()
        .enumerate()
        .map(|(rank, events)| {
            let comm = router.comm(rank as u32);
            let definitions = definitions.to_vec();
            thread::spawn(move || -> Result<RankOutput, String> {
                let mut engine = AnalysisEngine::new(Box::new(comm), strict);
                for definition in &definitions {
                    engine.handle_definition(definition);
                }
                for event in &events {
                    engine
                        .process_event(event)
                        .map_err(|e| format!("rank {rank}: {e}"))?;
                }
                let critical_path =
                    compute_critical_path(&mut engine).map_err(|e| format!("rank {rank}: {e}"))?;
                engine.finalize();
                let reduced_stats = engine
                    .reduce_statistics()
                    .map_err(|e| format!("rank {rank}: {e}"))?;
                Ok(RankOutput {
                    annotated: engine.annotated_events(),
                    sections: critical_path.sections,
                    global_length: critical_path.global_length,
                    reduced_stats,
                    region_totals: region_totals(&engine),
                })
            })
        })
        .collect();

    let mut outputs = Vec::new();
    for handle in handles {
        outputs.push(handle.join().map_err(|_| "analysis thread panicked")??);
    }
    Ok(outputs)
}

/// Per-region (count, total duration) over all paired regions of one rank.
fn region_totals(engine: &AnalysisEngine) -> HashMap<String, (u64, u64)> {
    let mut totals: HashMap<String, (u64, u64)> = HashMap::new();
    let graph = engine.graph();
    for (_, node) in graph.graph.nodes() {
        if node.kind != RecordKind::Leave {
            continue;
        }
        let Some(enter) = node.partner() else {
            continue;
        };
        let duration = node.time - graph.node(enter).time;
        let entry = totals.entry(node.name.to_string()).or_insert((0, 0));
        entry.0 += 1;
        entry.1 += duration;
    }
    totals
}

fn report(
    options: &ProgramOptions,
    definitions: &[Definition],
    outputs: Vec<RankOutput>,
) -> Result<(), String> {
    let global_length = outputs.first().map_or(0, |o| o.global_length);

    if options.print_critical_path {
        println!("critical path length: {global_length}");
        for output in &outputs {
            for section in &output.sections {
                println!(
                    "  rank {} stream {} [{} .. {}]",
                    section.rank, section.end.stream, section.start.time, section.end.time
                );
            }
        }
    }

    if let Some(first) = outputs.first() {
        println!("inefficiency summary:");
        for (name, count, time) in first.reduced_stats.metric_rows() {
            if count > 0 {
                println!("  {name:<28} {count:>8} {time:>12}");
            }
        }
        println!("activity counts:");
        for (name, count) in first.reduced_stats.activity_rows() {
            if count > 0 {
                println!("  {name:<28} {count:>8}");
            }
        }
    }

    if options.merge_activities {
        let mut merged: HashMap<String, (u64, u64)> = HashMap::new();
        for output in &outputs {
            for (name, (count, time)) in &output.region_totals {
                let entry = merged.entry(name.clone()).or_insert((0, 0));
                entry.0 += count;
                entry.1 += time;
            }
        }
        let mut rows: Vec<_> = merged.into_iter().collect();
        rows.sort_by_key(|(_, (_, time))| std::cmp::Reverse(*time));
        println!("region totals:");
        for (name, (count, time)) in rows {
            println!("  {name:<28} {count:>8} {time:>12}");
        }
    }

    if options.create_otf || options.output.is_some() {
        let path = options
            .output
            .clone()
            .unwrap_or_else(|| format!("{}.annotated.jsonl", options.input));
        let mut annotated: Vec<AnnotatedEvent> = outputs
            .into_iter()
            .flat_map(|o| o.annotated)
            .collect();
        annotated.sort_by_key(|e| (e.time, e.location));
        let file = File::create(&path).map_err(|e| format!("cannot create {path}: {e}"))?;
        write_annotated(BufWriter::new(file), definitions, &annotated)
            .map_err(|e| format!("{path}: {e}"))?;
        println!("annotated trace written to {path}");
    }
    Ok(())
}
