mod common;

use std::process::Command;

use gridmarket_sim::config::ScenarioConfig;
use gridmarket_sim::sim::kpi::KpiReport;
use gridmarket_sim::sim::scheduler::Scheduler;

#[derive(Debug)]
struct Kpis {
    trades: f64,
    traded_energy_kwh: f64,
}

#[test]
fn scenario_files_run_via_cli_and_trade() {
    let houses = run_and_parse_kpis(&["--scenario", "scenarios/two_houses.toml"]);
    let district = run_and_parse_kpis(&["--scenario", "scenarios/district_storage.toml"]);

    for (name, kpis) in [("two_houses", &houses), ("district_storage", &district)] {
        assert!(kpis.trades > 0.0, "expected trades in {name}: {kpis:?}");
        assert!(kpis.traded_energy_kwh > 0.0, "expected energy in {name}: {kpis:?}");
    }
    assert!(
        (houses.traded_energy_kwh - district.traded_energy_kwh).abs() > 0.1,
        "expected distinct dynamics: two_houses={:.3}, district_storage={:.3}",
        houses.traded_energy_kwh,
        district.traded_energy_kwh
    );
}

#[test]
fn cli_overrides_and_trade_export() {
    let out = std::env::temp_dir().join(format!("gridmarket-trades-{}.csv", std::process::id()));
    let out_arg = out.to_string_lossy().to_string();
    let kpis = run_and_parse_kpis(&[
        "--preset",
        "baseline",
        "--seed",
        "3",
        "--market-type",
        "pay-as-clear",
        "--trades-out",
        &out_arg,
        "--log-level",
        "warn",
    ]);

    let csv = std::fs::read_to_string(&out).expect("trade CSV should be written");
    let rows = csv.lines().count() - 1;
    assert_eq!(rows as f64, kpis.trades);
    assert!(csv.starts_with("area,time_slot,trade_id"));
    std::fs::remove_file(&out).ok();
}

#[test]
fn cli_rejects_unknown_preset() {
    let output = Command::new(env!("CARGO_BIN_EXE_gridmarket-sim"))
        .args(["--preset", "no_such_preset"])
        .output()
        .expect("gridmarket-sim process should run");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("unknown preset"), "stderr: {stderr}");
}

#[test]
fn every_preset_runs_to_completion() {
    for name in ScenarioConfig::PRESETS {
        let mut scheduler = Scheduler::from_scenario(&common::hourly_preset(name, 24)).unwrap();
        let report = scheduler.run();
        assert_eq!(report.ticks_run, 96, "preset {name}");
        assert_eq!(report.slots_completed, 24, "preset {name}");

        let kpi = KpiReport::from_summaries(&scheduler.slot_summaries());
        assert_eq!(kpi.trade_count, report.trade_count, "preset {name}");
        assert!(kpi.trade_count > 0, "preset {name} should trade");
    }
}

#[test]
fn scenario_files_parse_and_validate() {
    for path in ["scenarios/two_houses.toml", "scenarios/district_storage.toml"] {
        let cfg = ScenarioConfig::from_toml_file(std::path::Path::new(path))
            .unwrap_or_else(|e| panic!("{path}: {e}"));
        let errors = cfg.validate();
        assert!(errors.is_empty(), "{path} should be valid: {errors:?}");
    }
}

fn run_and_parse_kpis(args: &[&str]) -> Kpis {
    let output = Command::new(env!("CARGO_BIN_EXE_gridmarket-sim"))
        .args(args)
        .output()
        .expect("gridmarket-sim process should run");

    assert!(
        output.status.success(),
        "run failed for {args:?}: stderr={} ",
        String::from_utf8_lossy(&output.stderr)
    );

    let stdout = String::from_utf8(output.stdout).expect("stdout should be valid UTF-8");
    Kpis {
        trades: parse_metric(&stdout, "Trades:", ""),
        traded_energy_kwh: parse_metric(&stdout, "Traded energy:", "kWh"),
    }
}

fn parse_metric(stdout: &str, label: &str, unit: &str) -> f64 {
    let line = stdout
        .lines()
        .find(|line| line.trim_start().starts_with(label))
        .unwrap_or_else(|| panic!("missing KPI line `{label}` in output: {stdout}"));

    let raw = line
        .split_once(':')
        .map(|(_, right)| right.trim())
        .unwrap_or_else(|| panic!("invalid KPI format for line `{line}`"));
    let value = raw.strip_suffix(unit).unwrap_or(raw).trim();

    value
        .parse::<f64>()
        .unwrap_or_else(|_| panic!("failed to parse `{value}` from `{line}`"))
}

#[test]
fn one_sided_preset_buys_across_the_grid_boundary() {
    let mut scheduler = Scheduler::from_scenario(&common::hourly_preset("one_sided", 24)).unwrap();
    scheduler.run();
    let ledger = scheduler.trade_ledger();

    let maker_sales: Vec<_> = ledger
        .iter()
        .filter(|e| e.area == "Grid" && e.trade.seller == "Market Maker")
        .collect();
    assert!(!maker_sales.is_empty());
    assert!(maker_sales.iter().all(|e| e.trade.buyer.starts_with("IAA House")));
    // the maker is paid its own rate, the fee is charged one level down
    assert!(maker_sales.iter().all(|e| (e.trade.traded_price - 30.0).abs() < 1e-9));
    assert!(maker_sales.iter().all(|e| (e.trade.fee_price - 1.0).abs() < 1e-9));

    let house_purchases: Vec<_> = ledger
        .iter()
        .filter(|e| e.area == "House 1" && e.trade.seller == "IAA House 1")
        .collect();
    assert!(!house_purchases.is_empty());
    assert!(house_purchases.iter().any(|e| (e.trade.traded_price - 31.0).abs() < 1e-9));
}
