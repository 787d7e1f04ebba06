//! TOML-based scenario configuration and preset definitions.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::market::MarketType;
use crate::sim::types::SimConfig;
use crate::strategy::{
    InfiniteBusConfig, LoadHoursConfig, MarketMakerConfig, PvConfig, StorageConfig, StrategyConfig,
};

/// Top-level scenario configuration parsed from TOML.
///
/// All sections have defaults matching the baseline scenario. Load from
/// TOML with [`ScenarioConfig::from_toml_file`] or use
/// [`ScenarioConfig::baseline`] for the built-in default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScenarioConfig {
    /// Simulation timing and global parameters.
    #[serde(default)]
    pub simulation: SimulationConfig,
    /// Root of the area tree.
    #[serde(default = "baseline_grid")]
    pub grid: AreaConfig,
    /// Live events injected at fixed points of the run.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<ScheduledEventConfig>,
}

/// Simulation timing and global parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SimulationConfig {
    /// Market slot length in minutes (must be > 0).
    pub slot_length_minutes: u64,
    /// Tick length in seconds; must divide the slot length.
    pub tick_length_seconds: u64,
    /// Simulated duration in hours.
    pub duration_hours: u64,
    /// Master random seed.
    pub seed: u64,
    /// Matching policy: `one_sided`, `pay_as_bid` or `pay_as_clear`.
    pub market_type: MarketType,
    /// Wall-clock milliseconds per tick; absent runs as fast as possible.
    pub realtime_tick_ms: Option<u64>,
    /// Closed markets retained per area; absent keeps all.
    pub keep_past_markets: Option<usize>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            slot_length_minutes: 15,
            tick_length_seconds: 60,
            duration_hours: 24,
            seed: 42,
            market_type: MarketType::PayAsBid,
            realtime_tick_ms: None,
            keep_past_markets: None,
        }
    }
}

impl SimulationConfig {
    /// Builds the runtime configuration. Call [`ScenarioConfig::validate`] first.
    pub fn to_sim_config(&self) -> SimConfig {
        let mut config = SimConfig::new(
            self.slot_length_minutes,
            self.tick_length_seconds,
            self.duration_hours,
            self.market_type,
            self.seed,
        );
        config.realtime_tick_ms = self.realtime_tick_ms;
        config.keep_past_markets = self.keep_past_markets;
        config
    }
}

/// One node of the area tree: a strategy (leaf) or children (branch).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AreaConfig {
    /// Unique area name; also the trading identity of a leaf.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<StrategyConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<AreaConfig>,
    /// Flat fee added to energy forwarded into this area's market.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grid_fee_constant: Option<f64>,
    /// Percentage fee on energy forwarded into this area's market.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grid_fee_percentage: Option<f64>,
    #[serde(
        default,
        alias = "import_capacity_kVA",
        skip_serializing_if = "Option::is_none"
    )]
    pub import_capacity_kva: Option<f64>,
    #[serde(
        default,
        alias = "export_capacity_kVA",
        skip_serializing_if = "Option::is_none"
    )]
    pub export_capacity_kva: Option<f64>,
    #[serde(
        default,
        alias = "baseline_peak_energy_import_kWh",
        skip_serializing_if = "Option::is_none"
    )]
    pub baseline_peak_energy_import_kwh: Option<f64>,
    #[serde(
        default,
        alias = "baseline_peak_energy_export_kWh",
        skip_serializing_if = "Option::is_none"
    )]
    pub baseline_peak_energy_export_kwh: Option<f64>,
}

impl AreaConfig {
    fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            strategy: None,
            children: Vec::new(),
            grid_fee_constant: None,
            grid_fee_percentage: None,
            import_capacity_kva: None,
            export_capacity_kva: None,
            baseline_peak_energy_import_kwh: None,
            baseline_peak_energy_export_kwh: None,
        }
    }

    /// A leaf area running `strategy`.
    pub fn leaf(name: impl Into<String>, strategy: StrategyConfig) -> Self {
        Self {
            strategy: Some(strategy),
            ..Self::named(name)
        }
    }

    /// A branch area owning `children`.
    pub fn branch(name: impl Into<String>, children: Vec<AreaConfig>) -> Self {
        Self {
            children,
            ..Self::named(name)
        }
    }

    pub(crate) fn validate_into(&self, path: &str, names: &mut HashSet<String>, errors: &mut Vec<ConfigError>) {
        if self.name.trim().is_empty() {
            errors.push(ConfigError {
                field: format!("{path}.name"),
                message: "must not be empty".into(),
            });
        } else if !names.insert(self.name.clone()) {
            errors.push(ConfigError {
                field: format!("{path}.name"),
                message: format!("duplicate area name \"{}\"", self.name),
            });
        }
        match (&self.strategy, self.children.is_empty()) {
            (Some(strategy), true) => errors.extend(strategy.validate(&format!("{path}.strategy"))),
            (None, false) => {}
            (Some(_), false) => errors.push(ConfigError {
                field: path.to_string(),
                message: "an area cannot have both a strategy and children".into(),
            }),
            (None, true) => errors.push(ConfigError {
                field: path.to_string(),
                message: "an area needs a strategy or at least one child".into(),
            }),
        }
        for (field, value) in [
            ("grid_fee_constant", self.grid_fee_constant),
            ("grid_fee_percentage", self.grid_fee_percentage),
            ("import_capacity_kva", self.import_capacity_kva),
            ("export_capacity_kva", self.export_capacity_kva),
            (
                "baseline_peak_energy_import_kwh",
                self.baseline_peak_energy_import_kwh,
            ),
            (
                "baseline_peak_energy_export_kwh",
                self.baseline_peak_energy_export_kwh,
            ),
        ] {
            if value.is_some_and(|v| v.is_nan() || v < 0.0) {
                errors.push(ConfigError {
                    field: format!("{path}.{field}"),
                    message: "must be >= 0".into(),
                });
            }
        }
        if self.grid_fee_constant.is_some() && self.grid_fee_percentage.is_some() {
            errors.push(ConfigError {
                field: format!("{path}.grid_fee_constant"),
                message: "set either grid_fee_constant or grid_fee_percentage, not both".into(),
            });
        }
        for (i, child) in self.children.iter().enumerate() {
            child.validate_into(&format!("{path}.children[{i}]"), names, errors);
        }
    }
}

/// A live event injected when the clock reaches `slot`/`tick`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScheduledEventConfig {
    pub slot: u64,
    #[serde(default)]
    pub tick: u64,
    /// Event in wire form (`eventType`, `area_uuid`/`parent_uuid`, ...).
    pub event: Value,
}

/// Configuration error with field path and constraint description.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigError {
    /// Dotted field path (e.g., `"simulation.slot_length_minutes"`).
    pub field: String,
    /// Human-readable constraint description.
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "config error: {}: {}", self.field, self.message)
    }
}

fn baseline_grid() -> AreaConfig {
    let house = |n: u32, load_w: f64, pv_panels: u32| {
        AreaConfig::branch(
            format!("House {n}"),
            vec![
                AreaConfig::leaf(
                    format!("H{n} General Load"),
                    StrategyConfig::LoadHours(LoadHoursConfig {
                        avg_power_w: load_w,
                        hrs_of_day: (6..23).collect(),
                        ..LoadHoursConfig::default()
                    }),
                ),
                AreaConfig::leaf(
                    format!("H{n} PV"),
                    StrategyConfig::Pv(PvConfig {
                        panel_count: pv_panels,
                        ..PvConfig::default()
                    }),
                ),
            ],
        )
    };
    let mut grid = AreaConfig::branch(
        "Grid",
        vec![
            house(1, 400.0, 4),
            house(2, 250.0, 2),
            AreaConfig::leaf(
                "Market Maker",
                StrategyConfig::MarketMaker(MarketMakerConfig { energy_rate: 30.0 }),
            ),
        ],
    );
    grid.grid_fee_constant = Some(1.0);
    grid
}

impl ScenarioConfig {
    /// Returns the baseline scenario: two houses with load and PV, and a
    /// market maker in the grid market.
    pub fn baseline() -> Self {
        Self {
            simulation: SimulationConfig::default(),
            grid: baseline_grid(),
            events: Vec::new(),
        }
    }

    /// Returns the community-storage preset: pay-as-clear, a shared battery
    /// and an infinite bus buying surplus at a feed-in tariff.
    pub fn community_storage() -> Self {
        let mut grid = baseline_grid();
        grid.children.retain(|c| c.name != "Market Maker");
        grid.children.push(AreaConfig::leaf(
            "Community Battery",
            StrategyConfig::Storage(StorageConfig {
                battery_capacity_kwh: 20.0,
                initial_soc: 50.0,
                max_abs_battery_power_kw: 5.0,
                ..StorageConfig::default()
            }),
        ));
        grid.children.push(AreaConfig::leaf(
            "Infinite Bus",
            StrategyConfig::InfiniteBus(InfiniteBusConfig {
                energy_rate: 30.0,
                energy_buy_rate: 5.0,
            }),
        ));
        grid.grid_fee_constant = None;
        grid.grid_fee_percentage = Some(5.0);
        Self {
            simulation: SimulationConfig {
                market_type: MarketType::PayAsClear,
                ..SimulationConfig::default()
            },
            grid,
            events: Vec::new(),
        }
    }

    /// Returns the one-sided preset: loads buy directly from offers.
    pub fn one_sided() -> Self {
        Self {
            simulation: SimulationConfig {
                market_type: MarketType::OneSided,
                ..SimulationConfig::default()
            },
            ..Self::baseline()
        }
    }

    /// Available preset names.
    pub const PRESETS: &[&str] = &["baseline", "community_storage", "one_sided"];

    /// Loads a scenario from a named preset.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the preset name is unknown.
    pub fn from_preset(name: &str) -> Result<Self, ConfigError> {
        match name {
            "baseline" => Ok(Self::baseline()),
            "community_storage" => Ok(Self::community_storage()),
            "one_sided" => Ok(Self::one_sided()),
            _ => Err(ConfigError {
                field: "preset".to_string(),
                message: format!(
                    "unknown preset \"{name}\", available: {}",
                    Self::PRESETS.join(", ")
                ),
            }),
        }
    }

    /// Parses a scenario from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the file cannot be read or the TOML is invalid.
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError {
            field: "scenario".to_string(),
            message: format!("cannot read \"{}\": {e}", path.display()),
        })?;
        Self::from_toml_str(&content)
    }

    /// Parses a scenario from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the TOML is invalid or contains unknown fields.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        toml::from_str(s).map_err(|e| ConfigError {
            field: "toml".to_string(),
            message: e.to_string(),
        })
    }

    /// Validates all fields and returns a list of errors.
    ///
    /// Returns an empty vector if configuration is valid.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();
        let s = &self.simulation;

        if s.slot_length_minutes == 0 {
            errors.push(ConfigError {
                field: "simulation.slot_length_minutes".into(),
                message: "must be > 0".into(),
            });
        }
        if s.tick_length_seconds == 0 {
            errors.push(ConfigError {
                field: "simulation.tick_length_seconds".into(),
                message: "must be > 0".into(),
            });
        } else if s.slot_length_minutes > 0 && (s.slot_length_minutes * 60) % s.tick_length_seconds != 0 {
            errors.push(ConfigError {
                field: "simulation.tick_length_seconds".into(),
                message: "must divide the slot length evenly".into(),
            });
        }
        if s.duration_hours * 60 < s.slot_length_minutes || s.duration_hours == 0 {
            errors.push(ConfigError {
                field: "simulation.duration_hours".into(),
                message: "must cover at least one slot".into(),
            });
        }

        if self.grid.children.is_empty() {
            errors.push(ConfigError {
                field: "grid".into(),
                message: "the root area must have children".into(),
            });
        }
        let mut names = HashSet::new();
        self.grid.validate_into("grid", &mut names, &mut errors);

        for (i, event) in self.events.iter().enumerate() {
            if !event.event.is_object() {
                errors.push(ConfigError {
                    field: format!("events[{i}].event"),
                    message: "must be a table".into(),
                });
            }
        }

        errors
    }
}
