//! Presence detection and the upward cascade.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use backplane_core::{
    DiscreteStates, EventDisposition, ScanState, Sensor, UpdateKind,
};
use backplane_records::{DirRecord, EntityKey, RecordKind};
use common::{registry, MockFruSource, MockMc, MockResolver, MockSensor};

fn present_states() -> DiscreteStates {
    DiscreteStates::default().with_bit(0)
}

fn scanning_states() -> DiscreteStates {
    DiscreteStates { scanning_enabled: true, ..Default::default() }
}

#[tokio::test]
async fn parent_aggregates_children_without_flicker() {
    let reg = registry();
    let parent = reg.add(EntityKey::system(0x17, 1));
    let child_a = reg.add(EntityKey::system(0x0a, 1));
    let child_b = reg.add(EntityKey::system(0x0a, 2));
    parent.add_child(&child_a);
    parent.add_child(&child_b);

    // Record every presence transition the parent reports.
    let transitions = Arc::new(Mutex::new(Vec::new()));
    let t = transitions.clone();
    parent.add_presence_handler(Arc::new(move |_, present, _| {
        t.lock().unwrap().push(present);
        EventDisposition::NotHandled
    }));

    let sensor_a = MockSensor::presence("sens-a");
    let sensor_b = MockSensor::presence("sens-b");
    let dyn_a: Arc<dyn Sensor> = sensor_a.clone();
    let dyn_b: Arc<dyn Sensor> = sensor_b.clone();
    child_a.add_sensor(dyn_a).await;
    child_b.add_sensor(dyn_b).await;

    // Child A present, child B absent: the parent is present.
    sensor_a.set_states(present_states());
    child_a.detect_presence(true).await;
    child_b.detect_presence(true).await;
    assert!(child_a.present());
    assert!(!child_b.present());
    assert!(parent.present(), "one present child is enough");

    // Both children absent: exactly one false transition, no flicker.
    sensor_a.set_states(DiscreteStates::default());
    child_a.detect_presence(true).await;
    child_b.detect_presence(true).await;
    assert!(!parent.present());
    assert_eq!(*transitions.lock().unwrap(), vec![true, false]);
}

#[tokio::test]
async fn parent_with_own_sensors_ignores_children() {
    let reg = registry();
    let parent = reg.add(EntityKey::system(0x17, 1));
    let child = reg.add(EntityKey::system(0x0a, 1));
    parent.add_child(&child);

    // The parent has a (non-presence) sensor of its own, so child
    // aggregation must not apply to it.
    let parent_sensor = MockSensor::plain("parent-sens");
    let dyn_parent: Arc<dyn Sensor> = parent_sensor.clone();
    parent.add_sensor(dyn_parent).await;

    let child_sensor = MockSensor::presence("child-sens");
    let dyn_child: Arc<dyn Sensor> = child_sensor.clone();
    child.add_sensor(dyn_child).await;

    child_sensor.set_states(present_states());
    child.detect_presence(true).await;
    assert!(child.present());
    assert!(!parent.present(), "a parent with sensors does not aggregate children");
}

#[tokio::test]
async fn attached_sensor_scanning_means_present() {
    let reg = registry();
    let ent = reg.add(EntityKey::system(0x07, 1));
    let quiet = MockSensor::plain("quiet");
    let busy = MockSensor::plain("busy");
    let dyn_quiet: Arc<dyn Sensor> = quiet.clone();
    let dyn_busy: Arc<dyn Sensor> = busy.clone();
    ent.add_sensor(dyn_quiet).await;
    ent.add_sensor(dyn_busy).await;

    busy.set_states(scanning_states());
    ent.detect_presence(true).await;
    assert!(ent.present(), "any scanning sensor implies presence");

    busy.set_states(DiscreteStates::default());
    ent.detect_presence(true).await;
    assert!(!ent.present(), "no scanning sensor and no children means absent");
}

#[tokio::test]
async fn presence_sensor_event_updates_presence() {
    let reg = registry();
    let ent = reg.add(EntityKey::system(0x0a, 1));
    let sensor = MockSensor::presence("sens");
    let dyn_sensor: Arc<dyn Sensor> = sensor.clone();
    ent.add_sensor(dyn_sensor.clone()).await;

    // Assertion of the "present" offset.
    ent.sensor_event(&dyn_sensor, backplane_core::EventDir::Assertion, 0, None).await;
    assert!(ent.present());
    // Assertion of the "absent" offset.
    ent.sensor_event(&dyn_sensor, backplane_core::EventDir::Assertion, 1, None).await;
    assert!(!ent.present());

    let count = ent.presence_event_count();
    // Re-reporting the same state still counts as a re-evaluation.
    ent.sensor_event(&dyn_sensor, backplane_core::EventDir::Assertion, 1, None).await;
    assert!(!ent.present());
    assert_eq!(ent.presence_event_count(), count + 1);
}

#[tokio::test]
async fn controller_liveness_drives_presence() {
    let reg = registry();
    let resolver = MockResolver::new();
    let mc = MockMc::new(0, 0x30, false);
    resolver.insert(mc.clone());
    reg.set_mc_resolver(resolver);

    let mut state = ScanState::new();
    let mut rec = DirRecord {
        kind: RecordKind::Mc,
        entity_id: 0x06,
        entity_instance: 1,
        slave_address: 0x30,
        access_address: 0x30,
        is_logical_fru: true,
        ..Default::default()
    };
    rec.mc.fru_inventory_device = true;
    reg.reconcile_directory(&mut state, vec![rec.clone()]).await;

    let ent = reg.find(rec.key()).unwrap();
    ent.detect_presence(true).await;
    assert!(!ent.present(), "inactive controller, no other signal");

    mc.set_active(true);
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(ent.present(), "controller liveness transition must force detection");

    mc.set_active(false);
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!ent.present());
}

#[tokio::test]
async fn fru_data_follows_presence() {
    let reg = registry();
    let fru_source = MockFruSource::new();
    reg.set_fru_source(fru_source.clone());

    let mut state = ScanState::new();
    let rec = DirRecord {
        kind: RecordKind::Fru,
        entity_id: 0x0a,
        entity_instance: 1,
        access_address: 0x50,
        fru_device_id: 3,
        is_logical_fru: true,
        ..Default::default()
    };
    reg.reconcile_directory(&mut state, vec![rec.clone()]).await;
    let ent = reg.find(rec.key()).unwrap();

    let fru_events = Arc::new(Mutex::new(Vec::new()));
    let fe = fru_events.clone();
    ent.add_fru_handler(Arc::new(move |_, kind| {
        fe.lock().unwrap().push(kind);
    }));

    let sensor = MockSensor::presence("sens");
    let dyn_sensor: Arc<dyn Sensor> = sensor.clone();
    ent.add_sensor(dyn_sensor).await;

    sensor.set_states(present_states());
    ent.detect_presence(true).await;
    tokio::time::sleep(Duration::from_millis(30)).await;

    assert_eq!(fru_source.fetch_count(), 1);
    let data = ent.fru_data().expect("FRU data fetched on becoming present");
    assert_eq!(data.product.as_deref(), Some("fru-3"));

    sensor.set_states(DiscreteStates::default());
    ent.detect_presence(true).await;
    assert!(ent.fru_data().is_none(), "FRU data discarded on becoming absent");
    assert_eq!(*fru_events.lock().unwrap(), vec![UpdateKind::Added, UpdateKind::Deleted]);
}

#[tokio::test]
async fn unclaimed_presence_event_reaches_the_sink() {
    let reg = registry();
    let unhandled = Arc::new(AtomicUsize::new(0));
    let u = unhandled.clone();
    reg.set_unhandled_event_sink(Arc::new(move |_| {
        u.fetch_add(1, Ordering::Relaxed);
    }));

    let ent = reg.add(EntityKey::system(0x0a, 1));
    let sensor = MockSensor::presence("sens");
    let dyn_sensor: Arc<dyn Sensor> = sensor.clone();
    ent.add_sensor(dyn_sensor.clone()).await;

    let event = backplane_core::PlatformEvent::new(
        backplane_records::DeviceNum::new(0, 0x20),
        vec![0x01],
    );
    ent.sensor_event(&dyn_sensor, backplane_core::EventDir::Assertion, 0, Some(event)).await;
    assert_eq!(unhandled.load(Ordering::Relaxed), 1, "no handler claimed the event");

    // A claiming handler keeps the next event out of the sink.
    ent.add_presence_handler(Arc::new(|_, _, _| EventDisposition::Handled));
    let event = backplane_core::PlatformEvent::new(
        backplane_records::DeviceNum::new(0, 0x20),
        vec![0x02],
    );
    ent.sensor_event(&dyn_sensor, backplane_core::EventDir::Assertion, 1, Some(event)).await;
    assert_eq!(unhandled.load(Ordering::Relaxed), 1);
}
