extern crate clap;
extern crate pbr;

use cutplane::engine::run_local_group;
use cutplane::error::{EngineError, ExitCode};
use cutplane::example::{random_instance, two_scenario_example, ExpansionInstance};
use cutplane::util::BendersOptions;
use pbr::ProgressBar;
use std::time::Instant;

/// run options shared by every subcommand
fn add_tuning_args<'a>(command: clap::Command<'a>) -> clap::Command<'a> {
    command
        .arg(clap::Arg::new("workers").long("workers").takes_value(true).default_value("1")
            .help("number of ranks of the process group (simulated in-process)"))
        .arg(clap::Arg::new("by_batch").long("by-batch")
            .help("use the batched separation loop instead of full sweeps"))
        .arg(clap::Arg::new("batch_size").long("batch-size").takes_value(true)
            .help("subproblems per batch; 0 puts everything in one batch"))
        .arg(clap::Arg::new("absolute_gap").long("absolute-gap").takes_value(true))
        .arg(clap::Arg::new("relative_gap").long("relative-gap").takes_value(true))
        .arg(clap::Arg::new("time_limit").long("time-limit").takes_value(true)
            .help("wall-time limit in seconds"))
        .arg(clap::Arg::new("max_iterations").long("max-iterations").takes_value(true))
        .arg(clap::Arg::new("separation_param").long("separation-param").takes_value(true)
            .help("in/out stabilization weight of the candidate point"))
        .arg(clap::Arg::new("initial_relaxation").long("initial-relaxation")
            .help("start with integrality constraints deactivated"))
        .arg(clap::Arg::new("seed").long("seed").takes_value(true)
            .help("seed of the batch permutation generator"))
}

fn create_clap_parser<'a>(color_choice: clap::ColorChoice) -> clap::Command<'a> {
    clap::Command::new("Cutplane")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Distributed generalized Benders decomposition with batched cut separation")
        .color(color_choice)
        .propagate_version(true)
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(add_tuning_args(clap::Command::new("solve"))
            .about("solve an expansion instance")
            .arg(clap::Arg::new("instance").long("instance").takes_value(true)
                .help("instance file (JSON); the built-in two-scenario example when omitted"))
            .arg(clap::Arg::new("trace").long("trace").takes_value(true)
                .help("write per-iteration JSON records to this file")))
        .subcommand(add_tuning_args(clap::Command::new("bench"))
            .about("time the engine on random instances")
            .arg(clap::Arg::new("rounds").long("rounds").takes_value(true).default_value("10"))
            .arg(clap::Arg::new("candidates").long("candidates").takes_value(true).default_value("3"))
            .arg(clap::Arg::new("scenarios").long("scenarios").takes_value(true).default_value("20"))
            .arg(clap::Arg::new("steps").long("steps").takes_value(true).default_value("8")))
}

fn parse_or_exit<T: std::str::FromStr>(matches: &clap::ArgMatches, name: &str) -> Option<T> {
    matches.value_of(name).map(|value| {
        value.parse().unwrap_or_else(|_| {
            eprintln!("invalid value for --{}: {}", name.replace('_', "-"), value);
            std::process::exit(ExitCode::ConfigFailure as i32);
        })
    })
}

fn options_from_matches(matches: &clap::ArgMatches) -> BendersOptions {
    let mut options = BendersOptions::default();
    if let Some(batch_size) = parse_or_exit(matches, "batch_size") {
        options.batch_size = batch_size;
    }
    if let Some(absolute_gap) = parse_or_exit(matches, "absolute_gap") {
        options.absolute_gap = absolute_gap;
    }
    if let Some(relative_gap) = parse_or_exit(matches, "relative_gap") {
        options.relative_gap = relative_gap;
    }
    if let Some(time_limit) = parse_or_exit(matches, "time_limit") {
        options.time_limit = time_limit;
    }
    if let Some(max_iterations) = parse_or_exit(matches, "max_iterations") {
        options.max_iterations = max_iterations;
    }
    if let Some(separation_param) = parse_or_exit(matches, "separation_param") {
        options.separation_param = separation_param;
    }
    if let Some(seed) = parse_or_exit(matches, "seed") {
        options.shuffle_seed = seed;
    }
    if matches.is_present("initial_relaxation") {
        options.initial_relaxation = true;
    }
    options
}

fn exit_with(error: EngineError) -> ! {
    eprintln!("{error}");
    std::process::exit(ExitCode::from_engine_error(&error) as i32);
}

pub fn main() {
    env_logger::init();

    let matches = create_clap_parser(clap::ColorChoice::Auto).get_matches();

    match matches.subcommand() {
        Some(("solve", matches)) => {
            let instance = match matches.value_of("instance") {
                Some(path) => {
                    let content = std::fs::read_to_string(path).unwrap_or_else(|error| {
                        eprintln!("cannot read instance `{path}`: {error}");
                        std::process::exit(ExitCode::ConfigFailure as i32);
                    });
                    match ExpansionInstance::from_json(&content) {
                        Ok(instance) => instance,
                        Err(error) => {
                            eprintln!("cannot parse instance `{path}`: {error}");
                            std::process::exit(ExitCode::ConfigFailure as i32);
                        }
                    }
                }
                None => {
                    println!("no instance given, solving the built-in two-scenario example");
                    two_scenario_example()
                }
            };
            let workers: usize = parse_or_exit(matches, "workers").unwrap_or(1);
            let by_batch = matches.is_present("by_batch");
            let options = options_from_matches(matches);
            let trace_path = matches.value_of("trace");
            match run_local_group(&instance, &options, workers, by_batch, trace_path) {
                Ok(summary) => {
                    println!("stopped: {:?} after {} iterations", summary.stopping_criterion, summary.iterations);
                    println!("lb: {:.6}, best ub: {:.6} (iteration {})", summary.lb, summary.best_ub, summary.best_it);
                    for (name, value) in summary.best_point.iter() {
                        println!("  {name} = {value:.6}");
                    }
                }
                Err(error) => exit_with(error),
            }
        }
        Some(("bench", matches)) => {
            let rounds: usize = parse_or_exit(matches, "rounds").unwrap_or(10);
            let candidates: usize = parse_or_exit(matches, "candidates").unwrap_or(3);
            let scenarios: usize = parse_or_exit(matches, "scenarios").unwrap_or(20);
            let steps: usize = parse_or_exit(matches, "steps").unwrap_or(8);
            let workers: usize = parse_or_exit(matches, "workers").unwrap_or(1);
            let by_batch = matches.is_present("by_batch");
            let options = options_from_matches(matches);
            let mut pb = ProgressBar::on(std::io::stderr(), rounds as u64);
            pb.message("bench ");
            let mut total_time = 0.;
            let mut total_iterations = 0;
            for round in 0..rounds {
                pb.set(round as u64);
                let instance = random_instance(round as u64, candidates, scenarios, steps);
                let timer = Instant::now();
                match run_local_group(&instance, &options, workers, by_batch, None) {
                    Ok(summary) => {
                        total_time += timer.elapsed().as_secs_f64();
                        total_iterations += summary.iterations;
                    }
                    Err(error) => exit_with(error),
                }
            }
            pb.finish();
            println!();
            println!(
                "rounds: {rounds}, avg time: {:.3e}s, avg iterations: {:.1}",
                total_time / rounds as f64,
                total_iterations as f64 / rounds as f64
            );
        }
        _ => unreachable!()
    }
}
