//! Live events: structural and parameter changes applied between ticks.
//!
//! Events arrive as JSON (`eventType`, `area_uuid` / `parent_uuid`,
//! `area_representation`), are queued, and are applied only by
//! [`LiveEventQueue::handle_all_events`], which the scheduler calls at the
//! inter-tick barrier. Every failure is soft: it is logged, counted and
//! skipped.

use std::collections::{HashSet, VecDeque};
use std::sync::mpsc;

use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::area::{AREA_SETTINGS, Area, AreaState};
use crate::config::AreaConfig;
use crate::error::{Result, SimError};
use crate::sim::clock::SimTime;
use crate::sim::types::SimConfig;
use crate::strategy::{Strategy, StrategyConfig, StrategyContext, StrategyKind, join_errors, normalize_key};

/// A structural or parameter change to the area tree.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveEvent {
    /// Adds the area described by `representation` under `parent_uuid`.
    CreateArea {
        parent_uuid: Uuid,
        representation: Map<String, Value>,
    },
    /// Removes an area and its subtree.
    DeleteArea { area_uuid: Uuid },
    /// Changes parameters of an area or switches its strategy type.
    UpdateArea {
        area_uuid: Uuid,
        representation: Map<String, Value>,
    },
}

impl LiveEvent {
    /// Parses an event from its JSON wire form.
    ///
    /// # Errors
    ///
    /// `InvalidEvent` if the text is not JSON or not a valid event.
    ///
    /// # Examples
    ///
    /// ```
    /// use gridmarket_sim::events::LiveEvent;
    ///
    /// let event = LiveEvent::from_json(
    ///     r#"{"eventType": "delete_area", "area_uuid": "67e55044-10b1-426f-9247-bb680e5fe0c8"}"#,
    /// )
    /// .unwrap();
    /// assert_eq!(event.kind(), "delete_area");
    /// ```
    pub fn from_json(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| SimError::InvalidEvent(format!("not JSON: {e}")))?;
        Self::from_value(&value)
    }

    /// Parses an event from an already-decoded JSON value.
    ///
    /// # Errors
    ///
    /// `InvalidEvent` on an unknown `eventType`, a missing or malformed uuid,
    /// or a missing `area_representation`.
    pub fn from_value(value: &Value) -> Result<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| SimError::InvalidEvent("event must be a JSON object".into()))?;
        let kind = object
            .get("eventType")
            .and_then(Value::as_str)
            .ok_or_else(|| SimError::InvalidEvent("missing `eventType`".into()))?;
        match kind {
            "create_area" => Ok(Self::CreateArea {
                parent_uuid: uuid_field(object, "parent_uuid")?,
                representation: representation(object)?,
            }),
            "delete_area" => Ok(Self::DeleteArea {
                area_uuid: uuid_field(object, "area_uuid")?,
            }),
            "update_area" => Ok(Self::UpdateArea {
                area_uuid: uuid_field(object, "area_uuid")?,
                representation: representation(object)?,
            }),
            other => Err(SimError::InvalidEvent(format!("unknown eventType `{other}`"))),
        }
    }

    /// The wire name of the event type.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CreateArea { .. } => "create_area",
            Self::DeleteArea { .. } => "delete_area",
            Self::UpdateArea { .. } => "update_area",
        }
    }

    /// The event in wire form.
    pub fn to_value(&self) -> Value {
        let mut object = Map::new();
        object.insert("eventType".into(), Value::from(self.kind()));
        match self {
            Self::CreateArea {
                parent_uuid,
                representation,
            } => {
                object.insert("parent_uuid".into(), Value::from(parent_uuid.to_string()));
                object.insert(
                    "area_representation".into(),
                    Value::Object(representation.clone()),
                );
            }
            Self::DeleteArea { area_uuid } => {
                object.insert("area_uuid".into(), Value::from(area_uuid.to_string()));
            }
            Self::UpdateArea {
                area_uuid,
                representation,
            } => {
                object.insert("area_uuid".into(), Value::from(area_uuid.to_string()));
                object.insert(
                    "area_representation".into(),
                    Value::Object(representation.clone()),
                );
            }
        }
        Value::Object(object)
    }
}

fn uuid_field(object: &Map<String, Value>, key: &str) -> Result<Uuid> {
    let text = object
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| SimError::InvalidEvent(format!("missing `{key}`")))?;
    Uuid::parse_str(text).map_err(|e| SimError::InvalidEvent(format!("bad `{key}`: {e}")))
}

fn representation(object: &Map<String, Value>) -> Result<Map<String, Value>> {
    object
        .get("area_representation")
        .and_then(Value::as_object)
        .cloned()
        .ok_or_else(|| SimError::InvalidEvent("missing `area_representation`".into()))
}

/// Clonable handle for enqueueing events from other threads.
#[derive(Debug, Clone)]
pub struct LiveEventSender {
    tx: mpsc::Sender<LiveEvent>,
}

impl LiveEventSender {
    /// Queues `event` for the next barrier.
    ///
    /// # Errors
    ///
    /// `InvalidEvent` if the queue has been dropped (the run is over).
    pub fn send(&self, event: LiveEvent) -> Result<()> {
        self.tx
            .send(event)
            .map_err(|_| SimError::InvalidEvent("live event queue is closed".into()))
    }
}

#[derive(Debug, Clone)]
enum Pending {
    Raw(Value),
    Parsed(LiveEvent),
}

/// What one drain did.
#[derive(Debug, Default)]
pub struct DrainReport {
    pub applied: usize,
    pub failed: usize,
    /// Areas removed by `delete_area`, with their closed markets.
    pub retired: Vec<Area>,
}

/// Runtime context the handlers need.
pub struct EventContext<'a> {
    pub config: &'a SimConfig,
    /// Current slot; new areas open their first market here.
    pub slot: u64,
    /// Seed for the next stochastic strategy; advanced as areas are built.
    pub seed: &'a mut u64,
}

/// FIFO of pending live events.
#[derive(Debug)]
pub struct LiveEventQueue {
    pending: VecDeque<Pending>,
    scheduled: Vec<(SimTime, Value)>,
    tx: mpsc::Sender<LiveEvent>,
    rx: mpsc::Receiver<LiveEvent>,
}

impl Default for LiveEventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl LiveEventQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            pending: VecDeque::new(),
            scheduled: Vec::new(),
            tx,
            rx,
        }
    }

    /// Enqueues a parsed event.
    pub fn add_event(&mut self, event: LiveEvent) {
        self.pending.push_back(Pending::Parsed(event));
    }

    /// Enqueues an event in wire form; it is parsed when drained.
    pub fn add_raw(&mut self, value: Value) {
        self.pending.push_back(Pending::Raw(value));
    }

    /// Holds `value` back until the clock reaches `slot`/`tick`.
    pub fn schedule(&mut self, slot: u64, tick: u64, value: Value) {
        self.scheduled.push((
            SimTime {
                slot,
                tick,
                index: 0,
            },
            value,
        ));
    }

    pub fn sender(&self) -> LiveEventSender {
        LiveEventSender {
            tx: self.tx.clone(),
        }
    }

    /// Number of events waiting for the next drain (scheduled ones excluded).
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Moves everything sent through a [`LiveEventSender`] and every scheduled
    /// event due at or before `now` into the pending queue.
    pub fn collect(&mut self, now: SimTime) {
        while let Ok(event) = self.rx.try_recv() {
            self.pending.push_back(Pending::Parsed(event));
        }
        let (due, later): (Vec<_>, Vec<_>) = std::mem::take(&mut self.scheduled)
            .into_iter()
            .partition(|(at, _)| (at.slot, at.tick) <= (now.slot, now.tick));
        self.scheduled = later;
        for (_, value) in due {
            self.pending.push_back(Pending::Raw(value));
        }
    }

    /// Applies every pending event to the tree rooted at `root`, in order.
    pub fn handle_all_events(&mut self, root: &mut Area, ctx: &mut EventContext<'_>) -> DrainReport {
        let mut report = DrainReport::default();
        while let Some(pending) = self.pending.pop_front() {
            let event = match pending {
                Pending::Parsed(event) => Ok(event),
                Pending::Raw(value) => LiveEvent::from_value(&value),
            };
            let kind = event.as_ref().map_or("unparsed", LiveEvent::kind);
            match event.and_then(|e| apply(root, e, ctx, &mut report)) {
                Ok(()) => report.applied += 1,
                Err(e) => {
                    warn!(event = kind, error = %e, "live event failed");
                    report.failed += 1;
                }
            }
        }
        report
    }
}

fn apply(root: &mut Area, event: LiveEvent, ctx: &mut EventContext<'_>, report: &mut DrainReport) -> Result<()> {
    match event {
        LiveEvent::CreateArea {
            parent_uuid,
            representation,
        } => create_area(root, parent_uuid, &representation, ctx),
        LiveEvent::DeleteArea { area_uuid } => {
            let area = delete_area(root, area_uuid)?;
            report.retired.push(area);
            Ok(())
        }
        LiveEvent::UpdateArea {
            area_uuid,
            representation,
        } => update_area(root, area_uuid, &representation, ctx),
    }
}

fn create_area(
    root: &mut Area,
    parent_uuid: Uuid,
    representation: &Map<String, Value>,
    ctx: &mut EventContext<'_>,
) -> Result<()> {
    let parent = root
        .find(parent_uuid)
        .ok_or_else(|| SimError::InvalidParent {
            parent: parent_uuid.to_string(),
            reason: "no such area".into(),
        })?;
    if parent.is_leaf() {
        return Err(SimError::InvalidParent {
            parent: parent_uuid.to_string(),
            reason: format!("area `{}` holds a strategy", parent.name()),
        });
    }
    let parent_active = parent.state() == AreaState::Active;

    let config = area_config(representation)?;
    let mut names = HashSet::new();
    root.walk(&mut |a| {
        names.insert(a.name().to_string());
    });
    let mut errors = Vec::new();
    config.validate_into("area_representation", &mut names, &mut errors);
    if !errors.is_empty() {
        return Err(SimError::InvalidEvent(join_errors(&errors)));
    }
    let mut area = Area::from_config(&config, ctx.seed)
        .map_err(|errors| SimError::InvalidEvent(join_errors(&errors)))?;
    if parent_active {
        area.activate(ctx.slot, ctx.config);
    }
    let name = area.name().to_string();
    let uuid = area.uuid();
    root.find_mut(parent_uuid)
        .ok_or_else(|| SimError::NotFound(format!("area {parent_uuid}")))?
        .add_child(area)?;
    info!(area = %name, %uuid, parent = %parent_uuid, "area created");
    Ok(())
}

/// Converts a wire representation (`name`, `type` plus strategy fields, or
/// `children`) into scenario configuration.
fn area_config(representation: &Map<String, Value>) -> Result<AreaConfig> {
    let name = representation
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| SimError::InvalidEvent("area representation has no `name`".into()))?;

    let mut strategy_fields = Map::new();
    let mut area_fields = Map::new();
    for (key, value) in representation {
        let normalized = normalize_key(key);
        if normalized == "name" || normalized == "children" {
            continue;
        }
        if AREA_SETTINGS.contains(&normalized.as_str()) {
            area_fields.insert(normalized, value.clone());
        } else {
            strategy_fields.insert(key.clone(), value.clone());
        }
    }

    let children = match representation.get("children") {
        None => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_object()
                    .ok_or_else(|| SimError::InvalidEvent("children must be objects".into()))
                    .and_then(area_config)
            })
            .collect::<Result<Vec<_>>>()?,
        Some(_) => return Err(SimError::InvalidEvent("`children` must be an array".into())),
    };
    let strategy = if strategy_fields.contains_key("type") {
        Some(StrategyConfig::from_fields(&strategy_fields)?)
    } else {
        None
    };

    let mut config = AreaConfig {
        strategy,
        ..AreaConfig::branch(name, children)
    };
    let number = |key: &str| area_fields.get(key).and_then(Value::as_f64);
    config.grid_fee_constant = number("grid_fee_constant");
    config.grid_fee_percentage = number("grid_fee_percentage");
    config.import_capacity_kva = number("import_capacity_kva");
    config.export_capacity_kva = number("export_capacity_kva");
    config.baseline_peak_energy_import_kwh = number("baseline_peak_energy_import_kwh");
    config.baseline_peak_energy_export_kwh = number("baseline_peak_energy_export_kwh");
    Ok(config)
}

fn delete_area(root: &mut Area, area_uuid: Uuid) -> Result<Area> {
    if root.uuid() == area_uuid {
        return Err(SimError::InvalidEvent("cannot delete the root area".into()));
    }
    let parent_uuid = root
        .find(area_uuid)
        .ok_or_else(|| SimError::NotFound(format!("area {area_uuid}")))?
        .parent()
        .ok_or_else(|| SimError::NotFound(format!("parent of area {area_uuid}")))?;
    let parent = root
        .find_mut(parent_uuid)
        .ok_or_else(|| SimError::NotFound(format!("area {parent_uuid}")))?;
    let mut area = parent.remove_child(area_uuid)?;
    area.terminate();
    info!(area = %area.name(), uuid = %area_uuid, "area deleted");
    Ok(area)
}

fn update_area(
    root: &mut Area,
    area_uuid: Uuid,
    representation: &Map<String, Value>,
    ctx: &mut EventContext<'_>,
) -> Result<()> {
    let area = root
        .find(area_uuid)
        .ok_or_else(|| SimError::NotFound(format!("area {area_uuid}")))?;
    if !area.is_leaf() {
        return update_branch(root, area_uuid, representation);
    }
    let name = area.name().to_string();
    let parent_uuid = area.parent();
    let current = area.strategy().map(StrategyKind::type_name);

    let requested = representation
        .iter()
        .find(|(k, _)| normalize_key(k) == "type")
        .map(|(_, v)| strategy_type(v))
        .transpose()?;

    if let Some(requested) = requested.filter(|t| Some(*t) != current) {
        let fields: Map<String, Value> = representation
            .iter()
            .filter(|(k, _)| normalize_key(k) != "name")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let config = StrategyConfig::from_fields(&fields)?;
        let mut strategy = StrategyKind::from_config(&config, *ctx.seed)
            .map_err(|errors| SimError::InvalidEvent(join_errors(&errors)))?;
        *ctx.seed = ctx.seed.wrapping_add(1);
        if let Some(parent) = parent_uuid.and_then(|p| root.find_mut(p)) {
            parent.withdraw_orders(&name);
        }
        let area = root
            .find_mut(area_uuid)
            .ok_or_else(|| SimError::NotFound(format!("area {area_uuid}")))?;
        if area.state() == AreaState::Active {
            strategy.on_activate(&StrategyContext {
                owner: &name,
                config: ctx.config,
                slot: ctx.slot,
                tick: 0,
            });
        }
        area.replace_strategy(strategy);
        info!(area = %name, from = ?current, to = requested, "strategy switched");
        return Ok(());
    }

    let fields: Map<String, Value> = representation
        .iter()
        .filter(|(k, _)| !matches!(normalize_key(k).as_str(), "name" | "type"))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let area = root
        .find_mut(area_uuid)
        .ok_or_else(|| SimError::NotFound(format!("area {area_uuid}")))?;
    let strategy = area
        .strategy_mut()
        .ok_or_else(|| SimError::InvalidEvent(format!("area `{name}` has no strategy")))?;
    let update = strategy.update_fields(&fields)?;
    info!(area = %name, applied = ?update.applied, ignored = ?update.ignored, "strategy updated");
    Ok(())
}

fn update_branch(root: &mut Area, area_uuid: Uuid, representation: &Map<String, Value>) -> Result<()> {
    let area = root
        .find_mut(area_uuid)
        .ok_or_else(|| SimError::NotFound(format!("area {area_uuid}")))?;
    let update = area.apply_settings(representation)?;
    if !update.ignored.is_empty() {
        debug!(area = %area.name(), ignored = ?update.ignored, "ignoring fields a branch area does not have");
    }
    info!(area = %area.name(), applied = ?update.applied, "area updated");
    Ok(())
}

/// Canonical strategy type name for a `type` value (aliases accepted).
fn strategy_type(value: &Value) -> Result<&'static str> {
    let mut tagged = Map::new();
    tagged.insert("type".into(), value.clone());
    serde_json::from_value::<StrategyConfig>(Value::Object(tagged))
        .map(|c| c.type_name())
        .map_err(|_| {
            SimError::InvalidEvent(format!(
                "unknown strategy type {value}, expected one of {}",
                StrategyConfig::TYPES.join(", ")
            ))
        })
}
