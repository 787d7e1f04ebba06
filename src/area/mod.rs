//! Hierarchical area tree.
//!
//! Every area is either a *branch* that owns child areas and a market per
//! slot, or a *leaf* that owns a trading strategy and trades in its parent's
//! current market. Parents own their children; a child only remembers its
//! parent's uuid.

pub mod propagation;

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{AreaConfig, ConfigError};
use crate::error::{Result, SimError};
use crate::market::{FLOATING_POINT_TOLERANCE, Market, MarketSummary, OrderId};
use crate::sim::types::SimConfig;
use crate::strategy::{Strategy, StrategyContext, StrategyKind};

/// Lifecycle of an area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AreaState {
    Inactive,
    Active,
    Terminated,
}

/// What an area holds: children or a strategy, never both.
#[derive(Debug, Clone)]
pub enum AreaKind {
    Branch(Vec<Area>),
    Leaf(StrategyKind),
}

/// Fee charged on energy crossing into an area's market from a child.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum GridFee {
    #[default]
    None,
    /// Flat rate added to forwarded offers and taken off forwarded bids.
    Constant(f64),
    /// Percentage of the forwarded rate.
    Percentage(f64),
}

impl GridFee {
    /// Builds a fee from the scenario fields; a constant fee takes precedence.
    pub fn from_parts(constant: Option<f64>, percentage: Option<f64>) -> Self {
        match (constant, percentage) {
            (Some(c), _) if c > 0.0 => Self::Constant(c),
            (_, Some(p)) if p > 0.0 => Self::Percentage(p),
            _ => Self::None,
        }
    }

    /// Rate of a child offer as posted into this market.
    pub fn offer_upward(&self, rate: f64) -> f64 {
        match *self {
            Self::None => rate,
            Self::Constant(c) => rate + c,
            Self::Percentage(p) => rate * (1.0 + p / 100.0),
        }
    }

    /// Rate of a child bid as posted into this market.
    pub fn bid_upward(&self, rate: f64) -> f64 {
        match *self {
            Self::None => rate,
            Self::Constant(c) => (rate - c).max(0.0),
            Self::Percentage(p) => rate / (1.0 + p / 100.0),
        }
    }

    /// Rate the child seller receives when its forwarded offer trades at `rate`.
    pub fn revert_offer(&self, rate: f64) -> f64 {
        match *self {
            Self::None => rate,
            Self::Constant(c) => (rate - c).max(0.0),
            Self::Percentage(p) => rate / (1.0 + p / 100.0),
        }
    }

    /// Rate the child buyer pays when its forwarded bid trades at `rate`.
    pub fn revert_bid(&self, rate: f64) -> f64 {
        match *self {
            Self::None => rate,
            Self::Constant(c) => rate + c,
            Self::Percentage(p) => rate * (1.0 + p / 100.0),
        }
    }
}

/// Connection limits of a branch area towards its parent.
///
/// Capacities are apparent power (kVA) and turn into an energy limit per slot
/// as `kVA * slot_hours`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Throughput {
    pub import_capacity_kva: Option<f64>,
    pub export_capacity_kva: Option<f64>,
    pub baseline_peak_energy_import_kwh: Option<f64>,
    pub baseline_peak_energy_export_kwh: Option<f64>,
}

impl Throughput {
    pub fn import_limit_kwh(&self, slot_hours: f64) -> f64 {
        self.import_capacity_kva
            .map_or(f64::INFINITY, |kva| kva * slot_hours)
    }

    pub fn export_limit_kwh(&self, slot_hours: f64) -> f64 {
        self.export_capacity_kva
            .map_or(f64::INFINITY, |kva| kva * slot_hours)
    }

    /// Returns `true` when both flows are within the capacity limits.
    pub fn within_limits(&self, import_kwh: f64, export_kwh: f64, slot_hours: f64) -> bool {
        import_kwh <= self.import_limit_kwh(slot_hours) + FLOATING_POINT_TOLERANCE
            && export_kwh <= self.export_limit_kwh(slot_hours) + FLOATING_POINT_TOLERANCE
    }
}

/// What a branch area recorded when one of its markets closed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SlotSummary {
    pub area: String,
    pub market: MarketSummary,
    /// Energy bought from the parent market (kWh).
    pub import_kwh: f64,
    /// Energy sold into the parent market (kWh).
    pub export_kwh: f64,
    pub within_capacity: bool,
    /// Import above the baseline peak, if a baseline is configured (kWh).
    pub peak_import_above_baseline_kwh: Option<f64>,
    /// Export above the baseline peak, if a baseline is configured (kWh).
    pub peak_export_above_baseline_kwh: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MirrorSide {
    Offer,
    Bid,
}

/// A copy of one of this area's market orders living in the parent market.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Mirror {
    /// Order in this area's market the mirror stands for (may be stale; resolve it).
    pub original: OrderId,
    pub side: MirrorSide,
}

/// Node of the area tree.
#[derive(Debug, Clone)]
pub struct Area {
    uuid: Uuid,
    name: String,
    parent: Option<Uuid>,
    pub(crate) kind: AreaKind,
    state: AreaState,
    pub(crate) grid_fee: GridFee,
    throughput: Throughput,
    pub(crate) markets: BTreeMap<u64, Market>,
    current_slot: Option<u64>,
    summaries: Vec<SlotSummary>,
    /// Mirrors of this area's orders in the parent's market, by mirror id.
    pub(crate) mirrors: HashMap<OrderId, Mirror>,
    /// Trades of the current market already pushed down to children.
    pub(crate) pushed: usize,
    /// Copies of parent-market offers in this area's market (one-sided
    /// markets only): mirror id here to original id in the parent.
    pub(crate) inbound: HashMap<OrderId, OrderId>,
    /// Trades of the current market already settled with the parent.
    pub(crate) pulled: usize,
}

impl Area {
    fn with_kind(name: impl Into<String>, kind: AreaKind) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            name: name.into(),
            parent: None,
            kind,
            state: AreaState::Inactive,
            grid_fee: GridFee::None,
            throughput: Throughput::default(),
            markets: BTreeMap::new(),
            current_slot: None,
            summaries: Vec::new(),
            mirrors: HashMap::new(),
            pushed: 0,
            inbound: HashMap::new(),
            pulled: 0,
        }
    }

    /// Creates a leaf area trading with `strategy`.
    pub fn leaf(name: impl Into<String>, strategy: StrategyKind) -> Self {
        Self::with_kind(name, AreaKind::Leaf(strategy))
    }

    /// Creates a branch area owning `children`.
    ///
    /// # Errors
    ///
    /// `InvalidParent` if `children` is empty.
    pub fn branch(name: impl Into<String>, children: Vec<Area>) -> Result<Self> {
        let name = name.into();
        if children.is_empty() {
            return Err(SimError::InvalidParent {
                parent: name,
                reason: "a branch area needs at least one child".into(),
            });
        }
        let mut area = Self::with_kind(name, AreaKind::Branch(children));
        let uuid = area.uuid;
        if let AreaKind::Branch(children) = &mut area.kind {
            for child in children {
                child.parent = Some(uuid);
            }
        }
        Ok(area)
    }

    /// Builds a subtree from scenario configuration.
    ///
    /// # Arguments
    ///
    /// * `config` - Area description (strategy or children)
    /// * `seed` - Seed handed to the next stochastic strategy; advanced per leaf
    ///
    /// # Errors
    ///
    /// Every configuration problem found in the subtree.
    pub fn from_config(config: &AreaConfig, seed: &mut u64) -> std::result::Result<Self, Vec<ConfigError>> {
        let area = match (&config.strategy, config.children.is_empty()) {
            (Some(strategy), true) => {
                let strategy = StrategyKind::from_config(strategy, *seed).map_err(|errors| {
                    errors
                        .into_iter()
                        .map(|e| ConfigError {
                            field: format!("{}.{}", config.name, e.field),
                            message: e.message,
                        })
                        .collect::<Vec<_>>()
                })?;
                *seed = seed.wrapping_add(1);
                Self::leaf(&config.name, strategy)
            }
            (None, false) => {
                let mut children = Vec::with_capacity(config.children.len());
                let mut errors = Vec::new();
                for child in &config.children {
                    match Self::from_config(child, seed) {
                        Ok(area) => children.push(area),
                        Err(mut e) => errors.append(&mut e),
                    }
                }
                if !errors.is_empty() {
                    return Err(errors);
                }
                Self::branch(&config.name, children).map_err(|e| {
                    vec![ConfigError {
                        field: config.name.clone(),
                        message: e.to_string(),
                    }]
                })?
            }
            _ => {
                return Err(vec![ConfigError {
                    field: config.name.clone(),
                    message: "an area needs either a strategy or children, not both".into(),
                }]);
            }
        };
        Ok(area
            .with_grid_fee(GridFee::from_parts(
                config.grid_fee_constant,
                config.grid_fee_percentage,
            ))
            .with_throughput(Throughput {
                import_capacity_kva: config.import_capacity_kva,
                export_capacity_kva: config.export_capacity_kva,
                baseline_peak_energy_import_kwh: config.baseline_peak_energy_import_kwh,
                baseline_peak_energy_export_kwh: config.baseline_peak_energy_export_kwh,
            }))
    }

    pub fn with_grid_fee(mut self, fee: GridFee) -> Self {
        self.grid_fee = fee;
        self
    }

    pub fn with_throughput(mut self, throughput: Throughput) -> Self {
        self.throughput = throughput;
        self
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<Uuid> {
        self.parent
    }

    pub fn kind(&self) -> &AreaKind {
        &self.kind
    }

    pub fn state(&self) -> AreaState {
        self.state
    }

    pub fn grid_fee(&self) -> GridFee {
        self.grid_fee
    }

    pub fn throughput(&self) -> Throughput {
        self.throughput
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, AreaKind::Leaf(_))
    }

    /// Identity under which this area trades in its parent's market.
    pub fn agent_name(&self) -> String {
        format!("IAA {}", self.name)
    }

    pub fn children(&self) -> &[Area] {
        match &self.kind {
            AreaKind::Branch(children) => children,
            AreaKind::Leaf(_) => &[],
        }
    }

    pub fn strategy(&self) -> Option<&StrategyKind> {
        match &self.kind {
            AreaKind::Leaf(strategy) => Some(strategy),
            AreaKind::Branch(_) => None,
        }
    }

    pub fn current_slot(&self) -> Option<u64> {
        self.current_slot
    }

    /// The market of the current slot (branches only).
    pub fn current_market(&self) -> Option<&Market> {
        self.current_slot.and_then(|slot| self.markets.get(&slot))
    }

    pub fn market(&self, slot: u64) -> Option<&Market> {
        self.markets.get(&slot)
    }

    /// All retained markets, oldest first.
    pub fn markets(&self) -> impl Iterator<Item = &Market> {
        self.markets.values()
    }

    /// Retained markets whose slot has closed, oldest first.
    pub fn past_markets(&self) -> impl Iterator<Item = &Market> {
        self.markets.values().filter(|m| m.is_readonly())
    }

    pub fn summaries(&self) -> &[SlotSummary] {
        &self.summaries
    }

    /// Finds an area in this subtree by uuid.
    pub fn find(&self, uuid: Uuid) -> Option<&Area> {
        if self.uuid == uuid {
            return Some(self);
        }
        self.children().iter().find_map(|c| c.find(uuid))
    }

    pub fn find_mut(&mut self, uuid: Uuid) -> Option<&mut Area> {
        if self.uuid == uuid {
            return Some(self);
        }
        match &mut self.kind {
            AreaKind::Branch(children) => children.iter_mut().find_map(|c| c.find_mut(uuid)),
            AreaKind::Leaf(_) => None,
        }
    }

    pub fn find_by_name(&self, name: &str) -> Option<&Area> {
        if self.name == name {
            return Some(self);
        }
        self.children().iter().find_map(|c| c.find_by_name(name))
    }

    /// Visits every area of the subtree, parents before children.
    pub fn walk<'a>(&'a self, f: &mut impl FnMut(&'a Area)) {
        f(self);
        for child in self.children() {
            child.walk(f);
        }
    }

    pub fn area_count(&self) -> usize {
        let mut count = 0;
        self.walk(&mut |_| count += 1);
        count
    }

    /// Attaches `child` to this branch.
    ///
    /// # Errors
    ///
    /// `InvalidParent` if this area holds a strategy.
    pub fn add_child(&mut self, mut child: Area) -> Result<()> {
        match &mut self.kind {
            AreaKind::Branch(children) => {
                child.parent = Some(self.uuid);
                children.push(child);
                Ok(())
            }
            AreaKind::Leaf(_) => Err(SimError::InvalidParent {
                parent: self.uuid.to_string(),
                reason: format!("area `{}` holds a strategy", self.name),
            }),
        }
    }

    /// Detaches the direct child `uuid`, withdrawing its orders from this
    /// area's current market.
    ///
    /// # Errors
    ///
    /// `NotFound` if `uuid` is not a direct child; `InvalidEvent` if it is
    /// the last child (a branch may not become empty).
    pub fn remove_child(&mut self, uuid: Uuid) -> Result<Area> {
        let AreaKind::Branch(children) = &mut self.kind else {
            return Err(SimError::NotFound(format!("child {uuid}")));
        };
        let Some(index) = children.iter().position(|c| c.uuid == uuid) else {
            return Err(SimError::NotFound(format!("child {uuid}")));
        };
        if children.len() == 1 {
            return Err(SimError::InvalidEvent(format!(
                "cannot delete the last child of `{}`",
                self.name
            )));
        }
        let child = children.remove(index);
        let owner = if child.is_leaf() {
            child.name.clone()
        } else {
            child.agent_name()
        };
        self.withdraw_orders(&owner);
        Ok(child)
    }

    /// Deletes every open order of `owner` from the current market.
    pub(crate) fn withdraw_orders(&mut self, owner: &str) -> usize {
        let Some(market) = self
            .current_slot
            .and_then(|slot| self.markets.get_mut(&slot))
            .filter(|m| !m.is_readonly())
        else {
            return 0;
        };
        match market.delete_owned_by(owner) {
            Ok(removed) => {
                debug!(area = %self.name, owner, removed, "withdrew orders");
                removed
            }
            Err(e) => {
                warn!(area = %self.name, owner, error = %e, "failed to withdraw orders");
                0
            }
        }
    }

    /// Swaps the strategy of a leaf in place; returns the previous one.
    pub(crate) fn replace_strategy(&mut self, strategy: StrategyKind) -> Option<StrategyKind> {
        match &mut self.kind {
            AreaKind::Leaf(current) => Some(std::mem::replace(current, strategy)),
            AreaKind::Branch(_) => None,
        }
    }

    pub(crate) fn strategy_mut(&mut self) -> Option<&mut StrategyKind> {
        match &mut self.kind {
            AreaKind::Leaf(strategy) => Some(strategy),
            AreaKind::Branch(_) => None,
        }
    }

    /// Transitions Inactive → Active, children first, then opens this
    /// area's first market (branches) or primes the strategy (leaves).
    /// Has no effect on an area that is already active.
    pub fn activate(&mut self, slot: u64, config: &SimConfig) {
        if self.state != AreaState::Inactive {
            return;
        }
        self.state = AreaState::Active;
        if let AreaKind::Branch(children) = &mut self.kind {
            for child in children.iter_mut() {
                child.activate(slot, config);
            }
        }
        if let AreaKind::Leaf(strategy) = &mut self.kind {
            let ctx = StrategyContext {
                owner: &self.name,
                config,
                slot,
                tick: 0,
            };
            strategy.on_activate(&ctx);
        } else {
            self.open_market(slot, config);
        }
        info!(area = %self.name, uuid = %self.uuid, slot, "area activated");
    }

    pub(crate) fn open_market(&mut self, slot: u64, config: &SimConfig) {
        self.markets
            .insert(slot, Market::new(slot, config.market_type));
        self.current_slot = Some(slot);
        self.pushed = 0;
        self.pulled = 0;
        if let Some(keep) = config.keep_past_markets {
            let past: Vec<u64> = self
                .markets
                .iter()
                .filter(|(_, m)| m.is_readonly())
                .map(|(s, _)| *s)
                .collect();
            let excess = past.len().saturating_sub(keep);
            for s in past.into_iter().take(excess) {
                self.markets.remove(&s);
            }
        }
    }

    /// Closes the market of `slot` and records its summary.
    pub(crate) fn close_market(&mut self, slot: u64, config: &SimConfig) {
        let agent = self.agent_name();
        let Some(market) = self.markets.get_mut(&slot) else {
            return;
        };
        if market.is_readonly() {
            return;
        }
        market.close();
        let slot_hours = config.slot_hours();
        let trades = market.trades();
        let import_kwh: f64 = trades
            .iter()
            .filter(|t| t.seller == agent)
            .map(|t| t.traded_energy)
            .sum();
        let export_kwh: f64 = trades
            .iter()
            .filter(|t| t.buyer == agent)
            .map(|t| t.traded_energy)
            .sum();
        let t = self.throughput;
        self.summaries.push(SlotSummary {
            area: self.name.clone(),
            market: market.summary(),
            import_kwh,
            export_kwh,
            within_capacity: t.within_limits(import_kwh, export_kwh, slot_hours),
            peak_import_above_baseline_kwh: t
                .baseline_peak_energy_import_kwh
                .map(|b| (import_kwh - b).max(0.0)),
            peak_export_above_baseline_kwh: t
                .baseline_peak_energy_export_kwh
                .map(|b| (export_kwh - b).max(0.0)),
        });
    }

    /// Closes every open market in the subtree and marks it terminated.
    pub(crate) fn terminate(&mut self) {
        for market in self.markets.values_mut() {
            market.close();
        }
        self.state = AreaState::Terminated;
        if let AreaKind::Branch(children) = &mut self.kind {
            for child in children {
                child.terminate();
            }
        }
    }

    /// Applies the area-level settings in `fields` (grid fee, capacity,
    /// baseline) all at once; nothing changes unless every value is valid.
    ///
    /// # Returns
    ///
    /// The keys applied and the keys ignored because they are not area
    /// settings.
    ///
    /// # Errors
    ///
    /// `InvalidEvent` if a setting's value is not a non-negative number.
    pub(crate) fn apply_settings(&mut self, fields: &Map<String, Value>) -> Result<SettingsUpdate> {
        let mut grid_fee = self.grid_fee;
        let mut throughput = self.throughput;
        let mut update = SettingsUpdate::default();
        for (key, value) in fields {
            if stage_setting(&mut grid_fee, &mut throughput, key, value)? {
                update.applied.push(key.clone());
            } else {
                update.ignored.push(key.clone());
            }
        }
        self.grid_fee = grid_fee;
        self.throughput = throughput;
        Ok(update)
    }
}

/// Keys touched by [`Area::apply_settings`].
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct SettingsUpdate {
    pub applied: Vec<String>,
    pub ignored: Vec<String>,
}

/// Writes one setting into the staged values; `Ok(false)` if `key` is not
/// an area setting.
fn stage_setting(grid_fee: &mut GridFee, throughput: &mut Throughput, key: &str, value: &Value) -> Result<bool> {
    let key = key.to_ascii_lowercase();
    if !AREA_SETTINGS.contains(&key.as_str()) {
        return Ok(false);
    }
    let number = value
        .as_f64()
        .filter(|v| *v >= 0.0)
        .ok_or_else(|| SimError::InvalidEvent(format!("`{key}` must be a non-negative number")))?;
    match key.as_str() {
        "grid_fee_constant" => *grid_fee = GridFee::from_parts(Some(number), None),
        "grid_fee_percentage" => *grid_fee = GridFee::from_parts(None, Some(number)),
        "import_capacity_kva" => throughput.import_capacity_kva = Some(number),
        "export_capacity_kva" => throughput.export_capacity_kva = Some(number),
        "baseline_peak_energy_import_kwh" => throughput.baseline_peak_energy_import_kwh = Some(number),
        _ => throughput.baseline_peak_energy_export_kwh = Some(number),
    }
    Ok(true)
}

/// Area-level settings accepted by live updates (compared lowercase).
pub(crate) const AREA_SETTINGS: &[&str] = &[
    "grid_fee_constant",
    "grid_fee_percentage",
    "import_capacity_kva",
    "export_capacity_kva",
    "baseline_peak_energy_import_kwh",
    "baseline_peak_energy_export_kwh",
];

impl fmt::Display for Area {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn render(area: &Area, depth: usize, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let what = match area.strategy() {
                Some(strategy) => strategy.type_name().to_string(),
                None => format!("{} children", area.children().len()),
            };
            writeln!(f, "{:indent$}{} ({what})", "", area.name, indent = depth * 2)?;
            for child in area.children() {
                render(child, depth + 1, f)?;
            }
            Ok(())
        }
        render(self, 0, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::{MarketType, OrderRequest};
    use crate::strategy::{LoadHoursConfig, PvConfig, StrategyConfig};

    fn load(name: &str) -> Area {
        let config = StrategyConfig::LoadHours(LoadHoursConfig::default());
        Area::leaf(name, StrategyKind::from_config(&config, 0).unwrap())
    }

    fn pv(name: &str) -> Area {
        let config = StrategyConfig::Pv(PvConfig::default());
        Area::leaf(name, StrategyKind::from_config(&config, 0).unwrap())
    }

    fn sim() -> SimConfig {
        SimConfig::new(15, 60, 1, MarketType::PayAsBid, 0)
    }

    #[test]
    fn grid_fee_round_trips_rates() {
        let fee = GridFee::Constant(2.0);
        assert_eq!(fee.offer_upward(10.0), 12.0);
        assert_eq!(fee.bid_upward(10.0), 8.0);
        assert_eq!(fee.bid_upward(1.0), 0.0);
        assert_eq!(fee.revert_offer(12.0), 10.0);
        assert_eq!(fee.revert_bid(8.0), 10.0);

        let fee = GridFee::Percentage(25.0);
        assert_eq!(fee.offer_upward(8.0), 10.0);
        assert_eq!(fee.revert_offer(10.0), 8.0);
        assert_eq!(GridFee::from_parts(Some(0.0), None), GridFee::None);
    }

    #[test]
    fn throughput_limits_scale_with_slot() {
        let t = Throughput {
            import_capacity_kva: Some(4.0),
            ..Throughput::default()
        };
        assert_eq!(t.import_limit_kwh(0.25), 1.0);
        assert!(t.within_limits(1.0, 50.0, 0.25));
        assert!(!t.within_limits(1.5, 0.0, 0.25));
    }

    #[test]
    fn branch_requires_children_and_sets_parent() {
        assert!(Area::branch("Empty", Vec::new()).is_err());
        let house = Area::branch("House", vec![load("Load"), pv("PV")]).unwrap();
        assert!(house.children().iter().all(|c| c.parent() == Some(house.uuid())));
        assert_eq!(house.area_count(), 3);
        assert!(house.find_by_name("PV").is_some());
    }

    #[test]
    fn leaf_cannot_take_children() {
        let mut leaf = load("Load");
        assert!(matches!(
            leaf.add_child(pv("PV")),
            Err(SimError::InvalidParent { .. })
        ));
    }

    #[test]
    fn activation_opens_branch_markets_only() {
        let sim = sim();
        let house = Area::branch("House", vec![load("Load")]).unwrap();
        let mut grid = Area::branch("Grid", vec![house, pv("PV")]).unwrap();
        grid.activate(0, &sim);
        assert_eq!(grid.state(), AreaState::Active);
        assert!(grid.current_market().is_some());
        let house = grid.find_by_name("House").unwrap();
        assert_eq!(house.state(), AreaState::Active);
        assert!(house.current_market().is_some());
        assert!(grid.find_by_name("PV").unwrap().current_market().is_none());
    }

    #[test]
    fn remove_child_withdraws_orders_and_keeps_last() {
        let sim = sim();
        let mut house = Area::branch("House", vec![load("Load"), pv("PV")]).unwrap();
        house.activate(0, &sim);
        let pv_uuid = house.find_by_name("PV").unwrap().uuid();
        house
            .markets
            .get_mut(&0)
            .unwrap()
            .post_offer(OrderRequest::new(1.0, 5.0, "PV"))
            .unwrap();

        let removed = house.remove_child(pv_uuid).unwrap();
        assert_eq!(removed.name(), "PV");
        assert!(house.current_market().unwrap().offers().is_empty());

        let load_uuid = house.children()[0].uuid();
        assert!(matches!(
            house.remove_child(load_uuid),
            Err(SimError::InvalidEvent(_))
        ));
    }

    #[test]
    fn keep_past_markets_prunes_history() {
        let sim = sim().with_keep_past_markets(1);
        let mut house = Area::branch("House", vec![load("Load")]).unwrap();
        house.activate(0, &sim);
        for slot in 0..3 {
            house.close_market(slot, &sim);
            house.open_market(slot + 1, &sim);
        }
        assert_eq!(house.past_markets().count(), 1);
        assert_eq!(house.summaries().len(), 3);
        assert_eq!(house.current_slot(), Some(3));
    }

    #[test]
    fn apply_settings_handles_units_and_unknowns() {
        let mut house = Area::branch("House", vec![load("Load")]).unwrap();
        let fields = serde_json::json!({"import_capacity_kVA": 20.0, "colour": 1});
        let update = house.apply_settings(fields.as_object().unwrap()).unwrap();
        assert_eq!(update.applied, vec!["import_capacity_kVA".to_string()]);
        assert_eq!(update.ignored, vec!["colour".to_string()]);
        assert_eq!(house.throughput().import_capacity_kva, Some(20.0));
    }

    #[test]
    fn apply_settings_is_all_or_nothing() {
        let mut house = Area::branch("House", vec![load("Load")]).unwrap();
        let fields = serde_json::json!({
            "grid_fee_constant": 12,
            "import_capacity_kVA": "big"
        });
        assert!(matches!(
            house.apply_settings(fields.as_object().unwrap()),
            Err(SimError::InvalidEvent(_))
        ));
        assert_eq!(house.grid_fee(), GridFee::None);
        assert_eq!(house.throughput(), Throughput::default());
    }
}
