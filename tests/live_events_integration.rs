mod common;

use gridmarket_sim::area::{Area, AreaKind};
use gridmarket_sim::events::LiveEvent;
use gridmarket_sim::market::MarketType;
use gridmarket_sim::sim::scheduler::Scheduler;
use gridmarket_sim::strategy::{PvConfig, StrategyConfig};
use serde_json::json;

fn baseline() -> Scheduler {
    Scheduler::from_scenario(&common::hourly_preset("baseline", 6)).unwrap()
}

fn uuid_of(scheduler: &Scheduler, name: &str) -> String {
    scheduler.root().find_by_name(name).unwrap().uuid().to_string()
}

fn assert_leaf_branch_invariant(area: &Area) {
    match area.kind() {
        AreaKind::Leaf(_) => assert!(area.children().is_empty()),
        AreaKind::Branch(children) => {
            assert!(!children.is_empty(), "branch {} has no children", area.name());
            assert!(area.strategy().is_none());
            for child in children {
                assert_eq!(child.parent(), Some(area.uuid()));
                assert_leaf_branch_invariant(child);
            }
        }
    }
}

#[test]
fn event_sent_during_a_tick_lands_on_the_next_one() {
    let mut scheduler = baseline();
    let house = uuid_of(&scheduler, "House 1");
    scheduler.step().unwrap();

    let event = LiveEvent::from_value(&json!({
        "eventType": "create_area",
        "parent_uuid": house,
        "area_representation": {"name": "H1 Night Load", "type": "LoadHours", "avg_power_W": 500}
    }))
    .unwrap();
    scheduler.event_sender().send(event).unwrap();

    // nothing changes until the next tick runs
    assert!(scheduler.root().find_by_name("H1 Night Load").is_none());
    let market = scheduler.root().find_by_name("House 1").unwrap().current_market().unwrap();
    assert!(market.bids().iter().all(|b| b.buyer != "H1 Night Load"));

    let time = scheduler.step().unwrap();
    assert_eq!(time.index, 1);
    let created = scheduler.root().find_by_name("H1 Night Load").unwrap();
    assert!(created.is_leaf());
    let market = scheduler.root().find_by_name("House 1").unwrap().current_market().unwrap();
    assert!(market.bids().iter().any(|b| b.buyer == "H1 Night Load"));
}

#[test]
fn scheduled_update_applies_at_its_tick() {
    let mut scheduler = baseline();
    let load = scheduler.root().find_by_name("H1 General Load").unwrap().uuid();
    scheduler.events_mut().schedule(
        1,
        0,
        json!({
            "eventType": "update_area",
            "area_uuid": load.to_string(),
            "area_representation": {"avg_power_W": 1200, "hrs_of_day": [0, 1, 2, 3, 4, 5]}
        }),
    );

    let power = |s: &Scheduler| match s.root().find(load).and_then(|a| a.strategy()).map(|st| st.config()) {
        Some(StrategyConfig::LoadHours(c)) => c.avg_power_w,
        _ => f64::NAN,
    };
    for _ in 0..4 {
        scheduler.step();
    }
    assert_eq!(power(&scheduler), 400.0);
    scheduler.step();
    assert_eq!(power(&scheduler), 1200.0);
}

#[test]
fn structural_events_keep_the_tree_well_formed() {
    let mut scheduler = baseline();
    let grid = scheduler.root().uuid().to_string();
    let house2 = uuid_of(&scheduler, "House 2");
    let pv = uuid_of(&scheduler, "H1 PV");
    let load2 = uuid_of(&scheduler, "H2 General Load");
    let pv2 = uuid_of(&scheduler, "H2 PV");
    scheduler.step();

    let events = vec![
        // a new house with two devices
        json!({"eventType": "create_area", "parent_uuid": grid, "area_representation": {
            "name": "House 3",
            "grid_fee_constant": 0.5,
            "children": [
                {"name": "H3 Load", "type": "LoadHours", "avg_power_W": 300},
                {"name": "H3 PV", "type": "PV", "panel_count": 2}
            ]
        }}),
        // duplicate name
        json!({"eventType": "create_area", "parent_uuid": grid, "area_representation": {
            "name": "House 3", "type": "LoadHours"
        }}),
        // a leaf cannot hold children
        json!({"eventType": "create_area", "parent_uuid": pv, "area_representation": {
            "name": "Under PV", "type": "LoadHours"
        }}),
        // type switch
        json!({"eventType": "update_area", "area_uuid": pv, "area_representation": {
            "type": "Storage", "battery_capacity_kWh": 5.0
        }}),
        // type on a branch is ignored, settings apply
        json!({"eventType": "update_area", "area_uuid": house2, "area_representation": {
            "type": "PV", "grid_fee_constant": 3.0
        }}),
        json!({"eventType": "delete_area", "area_uuid": load2}),
        // last child of House 2
        json!({"eventType": "delete_area", "area_uuid": pv2}),
        json!({"eventType": "delete_area", "area_uuid": grid}),
        json!({"eventType": "explode_area"}),
    ];
    for event in events {
        scheduler.events_mut().add_raw(event);
    }
    let report = scheduler.run();

    assert_eq!(report.events_applied, 4);
    assert_eq!(report.events_failed, 5);
    assert_leaf_branch_invariant(scheduler.root());

    let root = scheduler.root();
    assert!(root.find_by_name("H3 PV").is_some());
    assert!(root.find_by_name("H2 General Load").is_none());
    assert!(root.find_by_name("H2 PV").is_some());
    assert_eq!(
        root.find_by_name("H1 PV").and_then(|a| a.strategy()).map(|s| s.type_name()),
        Some("Storage")
    );
    let house2 = root.find_by_name("House 2").unwrap();
    assert!(!house2.is_leaf());
    assert_eq!(house2.grid_fee(), gridmarket_sim::area::GridFee::Constant(3.0));

    assert_eq!(scheduler.archive().len(), 1);
    assert_eq!(scheduler.archive()[0].name(), "H2 General Load");
}

#[test]
fn deleted_seller_cannot_be_bought_through_its_parent() {
    let pv = common::leaf(
        "PV",
        StrategyConfig::Pv(PvConfig {
            sunrise_hour: 0.0,
            sunset_hour: 24.0,
            noise_std: 0.0,
            panel_count: 100,
            initial_selling_rate: 10.0,
            final_selling_rate: 10.0,
            ..PvConfig::default()
        }),
    );
    let house = Area::branch("House", vec![pv, common::flat_load("Idle", 0.0, 0.0)]).unwrap();
    let grid = Area::branch("Grid", vec![house, common::flat_load("GLoad", 1000.0, 35.0)]).unwrap();
    let mut scheduler = Scheduler::new(common::hourly_config(MarketType::OneSided), grid);
    scheduler.step().unwrap();
    let grid_offers = scheduler.root().current_market().unwrap().offers();
    assert!(grid_offers.iter().any(|o| o.seller == "IAA House"));

    let pv = uuid_of(&scheduler, "PV");
    scheduler
        .events_mut()
        .add_raw(json!({"eventType": "delete_area", "area_uuid": pv}));
    scheduler.step().unwrap();

    assert!(scheduler.root().find_by_name("PV").is_none());
    let grid_market = scheduler.root().current_market().unwrap();
    assert!(grid_market.trades().iter().all(|t| t.seller != "IAA House"));
    assert!(grid_market.offers().iter().all(|o| o.seller != "IAA House"));
    let house = scheduler.root().find_by_name("House").unwrap();
    assert!(house.current_market().unwrap().trades().is_empty());
}

#[test]
fn rejected_branch_update_keeps_every_setting() {
    let mut scheduler = baseline();
    let house = uuid_of(&scheduler, "House 1");
    let before = scheduler.root().find_by_name("House 1").unwrap();
    let (fee, throughput) = (before.grid_fee(), before.throughput());

    scheduler.events_mut().add_raw(json!({
        "eventType": "update_area",
        "area_uuid": house,
        "area_representation": {"grid_fee_constant": 12, "import_capacity_kVA": "big"}
    }));
    let report = scheduler.run();

    assert_eq!(report.events_applied, 0);
    assert_eq!(report.events_failed, 1);
    let after = scheduler.root().find_by_name("House 1").unwrap();
    assert_eq!(after.grid_fee(), fee);
    assert_eq!(after.throughput(), throughput);
}
