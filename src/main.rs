//! Grid market simulator entry point: CLI wiring and scenario loading.

use std::fs;
use std::path::Path;
use std::process;

use gridmarket_sim::config::{ScenarioConfig, ScheduledEventConfig};
use gridmarket_sim::io::export::export_csv;
use gridmarket_sim::market::MarketType;
use gridmarket_sim::sim::kpi::KpiReport;
use gridmarket_sim::sim::scheduler::Scheduler;
use tracing::Level;

/// Parsed CLI arguments.
struct CliArgs {
    scenario_path: Option<String>,
    preset: Option<String>,
    seed_override: Option<u64>,
    market_type: Option<MarketType>,
    trades_out: Option<String>,
    events_path: Option<String>,
    log_level: Level,
    #[cfg(feature = "api")]
    serve: bool,
    #[cfg(feature = "api")]
    port: u16,
}

fn print_help() {
    eprintln!("gridmarket-sim: hierarchical electricity market simulator");
    eprintln!();
    eprintln!("Usage: gridmarket-sim [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --scenario <path>        Load scenario from TOML config file");
    eprintln!(
        "  --preset <name>          Use a built-in preset ({})",
        ScenarioConfig::PRESETS.join(", ")
    );
    eprintln!("  --seed <u64>             Override random seed");
    eprintln!("  --market-type <type>     one_sided, pay_as_bid or pay_as_clear");
    eprintln!("  --trades-out <path>      Export the trade ledger to CSV");
    eprintln!("  --events <path>          JSON array of {{slot, tick, event}} to inject");
    eprintln!("  --log-level <level>      error, warn, info, debug or trace (default: info)");
    #[cfg(feature = "api")]
    {
        eprintln!("  --serve                  Serve the REST API while the simulation runs");
        eprintln!("  --port <u16>             API server port (default: 3000)");
    }
    eprintln!("  --help                   Show this help message");
    eprintln!();
    eprintln!("If no --scenario or --preset is given, the baseline preset is used.");
}

fn value_of(args: &[String], i: usize, flag: &str, what: &str) -> String {
    match args.get(i) {
        Some(v) => v.clone(),
        None => {
            eprintln!("error: {flag} requires {what} argument");
            process::exit(1);
        }
    }
}

fn parse_args() -> CliArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut cli = CliArgs {
        scenario_path: None,
        preset: None,
        seed_override: None,
        market_type: None,
        trades_out: None,
        events_path: None,
        log_level: Level::INFO,
        #[cfg(feature = "api")]
        serve: false,
        #[cfg(feature = "api")]
        port: 3000,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--help" | "-h" => {
                print_help();
                process::exit(0);
            }
            "--scenario" => {
                i += 1;
                cli.scenario_path = Some(value_of(&args, i, "--scenario", "a path"));
            }
            "--preset" => {
                i += 1;
                cli.preset = Some(value_of(&args, i, "--preset", "a name"));
            }
            "--seed" => {
                i += 1;
                let v = value_of(&args, i, "--seed", "a u64");
                if let Ok(s) = v.parse::<u64>() {
                    cli.seed_override = Some(s);
                } else {
                    eprintln!("error: --seed value \"{v}\" is not a valid u64");
                    process::exit(1);
                }
            }
            "--market-type" => {
                i += 1;
                let v = value_of(&args, i, "--market-type", "a type");
                match v.parse::<MarketType>() {
                    Ok(t) => cli.market_type = Some(t),
                    Err(e) => {
                        eprintln!("error: {e}");
                        process::exit(1);
                    }
                }
            }
            "--trades-out" => {
                i += 1;
                cli.trades_out = Some(value_of(&args, i, "--trades-out", "a path"));
            }
            "--events" => {
                i += 1;
                cli.events_path = Some(value_of(&args, i, "--events", "a path"));
            }
            "--log-level" => {
                i += 1;
                let v = value_of(&args, i, "--log-level", "a level");
                if let Ok(level) = v.parse::<Level>() {
                    cli.log_level = level;
                } else {
                    eprintln!("error: --log-level value \"{v}\" is not a valid level");
                    process::exit(1);
                }
            }
            #[cfg(feature = "api")]
            "--serve" => {
                cli.serve = true;
            }
            #[cfg(feature = "api")]
            "--port" => {
                i += 1;
                let v = value_of(&args, i, "--port", "a u16");
                if let Ok(p) = v.parse::<u16>() {
                    cli.port = p;
                } else {
                    eprintln!("error: --port value \"{v}\" is not a valid u16");
                    process::exit(1);
                }
            }
            other => {
                eprintln!("error: unknown argument \"{other}\"");
                print_help();
                process::exit(1);
            }
        }
        i += 1;
    }

    if cli.scenario_path.is_some() && cli.preset.is_some() {
        eprintln!("error: --scenario and --preset are mutually exclusive");
        process::exit(1);
    }

    cli
}

fn load_events(path: &str) -> Vec<ScheduledEventConfig> {
    let parsed = fs::read_to_string(path)
        .map_err(|e| e.to_string())
        .and_then(|text| serde_json::from_str(&text).map_err(|e| e.to_string()));
    match parsed {
        Ok(events) => events,
        Err(e) => {
            eprintln!("error: cannot load events from \"{path}\": {e}");
            process::exit(1);
        }
    }
}

fn write_outputs(scheduler: &Scheduler, trades_out: Option<&str>) {
    let kpi = KpiReport::from_summaries(&scheduler.slot_summaries());
    println!("{}", scheduler.root());
    println!("{kpi}");

    if let Some(path) = trades_out {
        if let Err(e) = export_csv(&scheduler.trade_ledger(), Path::new(path)) {
            eprintln!("error: failed to write CSV: {e}");
            process::exit(1);
        }
        eprintln!("Trades written to {path}");
    }
}

fn main() {
    let cli = parse_args();

    tracing_subscriber::fmt()
        .with_max_level(cli.log_level)
        .with_writer(std::io::stderr)
        .init();

    // --scenario takes priority, then --preset, then baseline default
    let mut scenario = if let Some(ref path) = cli.scenario_path {
        match ScenarioConfig::from_toml_file(Path::new(path)) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("{e}");
                process::exit(1);
            }
        }
    } else if let Some(ref name) = cli.preset {
        match ScenarioConfig::from_preset(name) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("{e}");
                process::exit(1);
            }
        }
    } else {
        ScenarioConfig::baseline()
    };

    if let Some(seed) = cli.seed_override {
        scenario.simulation.seed = seed;
    }
    if let Some(market_type) = cli.market_type {
        scenario.simulation.market_type = market_type;
    }
    if let Some(ref path) = cli.events_path {
        scenario.events.extend(load_events(path));
    }

    let mut scheduler = match Scheduler::from_scenario(&scenario) {
        Ok(s) => s,
        Err(errors) => {
            for e in &errors {
                eprintln!("{e}");
            }
            process::exit(1);
        }
    };

    #[cfg(feature = "api")]
    if cli.serve {
        serve(scheduler, cli.port, cli.trades_out);
        return;
    }

    let report = scheduler.run();
    eprintln!(
        "Ran {} ticks over {} slots ({} live events applied, {} failed)",
        report.ticks_run, report.slots_completed, report.events_applied, report.events_failed
    );
    write_outputs(&scheduler, cli.trades_out.as_deref());
}

/// Steps the simulation on a worker thread, publishing a fresh view after
/// every tick, while the API serves on the main runtime.
#[cfg(feature = "api")]
fn serve(mut scheduler: Scheduler, port: u16, trades_out: Option<String>) {
    use std::net::SocketAddr;
    use std::sync::Arc;

    use gridmarket_sim::api::{AppState, RunView};

    let state = Arc::new(AppState::from_scheduler(&scheduler));
    let publisher = Arc::clone(&state);
    std::thread::spawn(move || {
        while scheduler.step().is_some() {
            publisher.publish(RunView::capture(&scheduler));
        }
        write_outputs(&scheduler, trades_out.as_deref());
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let rt = tokio::runtime::Runtime::new().unwrap_or_else(|e| {
        eprintln!("error: failed to create tokio runtime: {e}");
        process::exit(1);
    });
    if let Err(e) = rt.block_on(gridmarket_sim::api::serve(state, addr)) {
        eprintln!("error: API server failed: {e}");
        process::exit(1);
    }
}
