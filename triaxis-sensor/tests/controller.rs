//! End-to-end controller tests over the simulated bus

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use triaxis_bus::registers::{bits, reg};
use triaxis_bus::{RegisterBus, SimBus};
use triaxis_sensor::{
    ClientId, FieldId, MemoryStore, Mode, PropertyKey, PropertyStore, PropertyValue, SensorConfig,
    SensorController, SensorError, SensorEvent, SensorState,
};

fn controller_over(bus: &Arc<SimBus>) -> SensorController {
    controller_with_store(bus, Arc::new(MemoryStore::new()))
}

fn controller_with_store(bus: &Arc<SimBus>, store: Arc<dyn PropertyStore>) -> SensorController {
    SensorController::new(
        Arc::clone(bus) as Arc<dyn RegisterBus>,
        SensorConfig::default(),
        store,
    )
}

async fn next_event(
    rx: &mut tokio::sync::broadcast::Receiver<SensorEvent>,
) -> SensorEvent {
    timeout(Duration::from_millis(500), rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

#[tokio::test(flavor = "multi_thread")]
async fn test_start_programs_startup_table() {
    let bus = Arc::new(SimBus::new());
    let sensor = controller_over(&bus);

    sensor.start().await.unwrap();

    // Standby, full-res ±16 g, no FIFO, default rate and threshold
    assert_eq!(bus.register(reg::POWER_CTL), bits::POWER_CTL_STANDBY);
    assert_eq!(
        bus.register(reg::DATA_FORMAT),
        bits::DATA_FORMAT_FULL_RES | bits::DATA_FORMAT_RANGE_16G
    );
    assert_eq!(bus.register(reg::BW_RATE), 0x07);
    assert_eq!(bus.register(reg::THRESH_ACT), 1);
    // Interrupts stay off until a client brings the device into eventing
    assert_eq!(bus.register(reg::INT_ENABLE), 0);
    assert_eq!(sensor.mode().await, Mode::Off);

    sensor.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_first_connect_enters_polling_and_primes_cache() {
    let bus = Arc::new(SimBus::new());
    bus.set_sample(0.0, 0.0, 1.0);
    let sensor = controller_over(&bus);

    sensor.start().await.unwrap();
    bus.clear_write_log();
    sensor.connect(ClientId(1)).await.unwrap();

    assert_eq!(sensor.mode().await, Mode::Polling);
    assert_eq!(bus.register(reg::POWER_CTL), bits::POWER_CTL_MEASURE);
    assert_eq!(bus.register(reg::INT_ENABLE), 0);
    // The transition actually wrote the measure command
    assert!(bus
        .write_log()
        .contains(&(reg::POWER_CTL, bits::POWER_CTL_MEASURE)));

    // The initial poll landed in the cache
    assert_eq!(sensor.state(), SensorState::Ready);
    let fields = sensor
        .get_data_fields(&[FieldId::AccelerationZ])
        .await
        .unwrap();
    assert_eq!(
        fields.get(&FieldId::AccelerationZ),
        Some(&Ok(PropertyValue::Double(1.0)))
    );

    sensor.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_subscribe_toggles_eventing() {
    let bus = Arc::new(SimBus::new());
    let sensor = controller_over(&bus);

    sensor.start().await.unwrap();
    sensor.connect(ClientId(1)).await.unwrap();

    sensor.subscribe(ClientId(1)).await.unwrap();
    assert_eq!(sensor.mode().await, Mode::Eventing);
    assert_eq!(bus.register(reg::INT_ENABLE), bits::INT_ACTIVITY);
    assert_eq!(bus.register(reg::POWER_CTL), bits::POWER_CTL_MEASURE);

    sensor.unsubscribe(ClientId(1)).await.unwrap();
    assert_eq!(sensor.mode().await, Mode::Polling);
    assert_eq!(bus.register(reg::INT_ENABLE), 0);

    sensor.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_explicit_interval_enters_eventing_without_subscription() {
    let bus = Arc::new(SimBus::new());
    let sensor = controller_over(&bus);

    sensor.start().await.unwrap();
    sensor.connect(ClientId(1)).await.unwrap();

    let mut entries = BTreeMap::new();
    entries.insert(
        PropertyKey::CurrentReportInterval,
        PropertyValue::Unsigned(200),
    );
    let results = sensor.set_properties(ClientId(1), &entries).await.unwrap();
    assert!(results.status().is_ok());

    assert_eq!(sensor.mode().await, Mode::Eventing);
    // 200 ms maps to the 160 ms (6.25 Hz) hardware rate
    assert_eq!(bus.register(reg::BW_RATE), 0x06);

    // Clearing the interval drops back to polling
    let mut entries = BTreeMap::new();
    entries.insert(
        PropertyKey::CurrentReportInterval,
        PropertyValue::Unsigned(0),
    );
    sensor.set_properties(ClientId(1), &entries).await.unwrap();
    assert_eq!(sensor.mode().await, Mode::Polling);

    sensor.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_last_disconnect_turns_device_off() {
    let bus = Arc::new(SimBus::new());
    let sensor = controller_over(&bus);

    sensor.start().await.unwrap();
    sensor.connect(ClientId(1)).await.unwrap();
    sensor.connect(ClientId(2)).await.unwrap();

    sensor.disconnect(ClientId(1)).await.unwrap();
    assert_eq!(sensor.mode().await, Mode::Polling);

    sensor.disconnect(ClientId(2)).await.unwrap();
    assert_eq!(sensor.mode().await, Mode::Off);
    assert_eq!(bus.register(reg::POWER_CTL), bits::POWER_CTL_STANDBY);
    assert_eq!(sensor.state(), SensorState::NoData);

    sensor.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_get_data_fields_polls_fresh_in_polling_mode() {
    let bus = Arc::new(SimBus::new());
    bus.set_sample(0.0, 0.0, 1.0);
    let sensor = controller_over(&bus);

    sensor.start().await.unwrap();
    sensor.connect(ClientId(1)).await.unwrap();

    // Data changes between reads; polling mode must not serve the old value
    bus.set_sample(0.5, 0.0, 1.0);
    let fields = sensor
        .get_data_fields(&[FieldId::AccelerationX])
        .await
        .unwrap();
    assert_eq!(
        fields.get(&FieldId::AccelerationX),
        Some(&Ok(PropertyValue::Double(0.5)))
    );

    sensor.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_get_data_fields_requires_start_and_client() {
    let bus = Arc::new(SimBus::new());
    let sensor = controller_over(&bus);

    assert!(matches!(
        sensor.get_data_fields(&[FieldId::Timestamp]).await,
        Err(SensorError::InvalidState(_))
    ));

    sensor.start().await.unwrap();
    assert!(matches!(
        sensor.get_data_fields(&[FieldId::Timestamp]).await,
        Err(SensorError::InvalidState(_))
    ));

    sensor.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_set_properties_partial_failure() {
    let bus = Arc::new(SimBus::new());
    let sensor = controller_over(&bus);

    sensor.start().await.unwrap();
    sensor.connect(ClientId(1)).await.unwrap();

    let mut sensitivity = BTreeMap::new();
    sensitivity.insert(FieldId::AccelerationX, PropertyValue::Double(0.5));
    sensitivity.insert(FieldId::AccelerationY, PropertyValue::Double(-1.0));

    let mut entries = BTreeMap::new();
    entries.insert(
        PropertyKey::CurrentReportInterval,
        PropertyValue::Unsigned(200),
    );
    entries.insert(
        PropertyKey::Manufacturer,
        PropertyValue::Text("someone else".into()),
    );
    entries.insert(
        PropertyKey::ChangeSensitivity,
        PropertyValue::FieldMap(sensitivity),
    );

    let results = sensor.set_properties(ClientId(1), &entries).await.unwrap();

    assert!(results
        .get(&PropertyKey::CurrentReportInterval)
        .unwrap()
        .is_ok());
    assert!(matches!(
        results.get(&PropertyKey::Manufacturer),
        Some(Err(SensorError::NotSupported(_)))
    ));
    assert!(matches!(
        results.get(&PropertyKey::ChangeSensitivity),
        Some(Err(SensorError::PartialFailure))
    ));
    assert!(matches!(results.status(), Err(SensorError::PartialFailure)));

    // The valid entries still reached the hardware
    assert_eq!(bus.register(reg::BW_RATE), 0x06);
    // The threshold takes the minimum across all axes; Y and Z keep the
    // 0.0625 g default (one step), which dominates the 0.5 g set on X
    assert_eq!(bus.register(reg::THRESH_ACT), 1);

    sensor.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_apply_failure_leaves_mode_unchanged() {
    let bus = Arc::new(SimBus::new());
    let sensor = controller_over(&bus);

    sensor.start().await.unwrap();
    sensor.connect(ClientId(1)).await.unwrap();
    assert_eq!(sensor.mode().await, Mode::Polling);

    bus.fail_next_writes(1);
    let err = sensor.subscribe(ClientId(1)).await.unwrap_err();
    assert!(matches!(err, SensorError::Hardware(_)));
    assert_eq!(sensor.mode().await, Mode::Polling);

    sensor.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_eventing_delivers_state_then_data() {
    let bus = Arc::new(SimBus::new());
    bus.set_sample(0.0, 0.0, 1.0);
    let sensor = controller_over(&bus);
    let mut events = sensor.subscribe_events();

    sensor.start().await.unwrap();
    sensor.connect(ClientId(1)).await.unwrap();
    sensor.subscribe(ClientId(1)).await.unwrap();

    bus.set_sample(0.25, 0.0, 1.0);
    bus.raise_activity();
    sensor.sample_ready();

    // The NoData -> Ready transition precedes the data it announced
    match next_event(&mut events).await {
        SensorEvent::StateChanged(state) => assert_eq!(state, SensorState::Ready),
        other => panic!("expected a state change first, got {other:?}"),
    }
    match next_event(&mut events).await {
        SensorEvent::Data(fields) => {
            assert_eq!(
                fields.get(&FieldId::AccelerationX),
                Some(&PropertyValue::Double(0.25))
            );
            assert!(fields.contains_key(&FieldId::Timestamp));
        }
        other => panic!("expected a data event, got {other:?}"),
    }

    sensor.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_rapid_samples_throttled_to_one_report() {
    let bus = Arc::new(SimBus::new());
    bus.set_sample(0.0, 0.0, 1.0);
    let sensor = controller_over(&bus);
    let mut events = sensor.subscribe_events();

    sensor.start().await.unwrap();
    sensor.connect(ClientId(1)).await.unwrap();
    sensor.subscribe(ClientId(1)).await.unwrap();

    // Two interrupts well inside one 100 ms report interval
    bus.raise_activity();
    sensor.sample_ready();
    tokio::time::sleep(Duration::from_millis(20)).await;
    bus.raise_activity();
    sensor.sample_ready();

    // First report: state change plus data, released immediately
    assert!(matches!(
        next_event(&mut events).await,
        SensorEvent::StateChanged(SensorState::Ready)
    ));
    assert!(matches!(next_event(&mut events).await, SensorEvent::Data(_)));

    // The second sample is held back for the rest of the interval
    let early = timeout(Duration::from_millis(40), events.recv()).await;
    assert!(early.is_err(), "report released before the interval elapsed");

    // And released afterwards, with no second state change
    assert!(matches!(next_event(&mut events).await, SensorEvent::Data(_)));

    sensor.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unrecognized_interrupt_ignored() {
    let bus = Arc::new(SimBus::new());
    bus.set_sample(0.0, 0.0, 1.0);
    let sensor = controller_over(&bus);
    let mut events = sensor.subscribe_events();

    sensor.start().await.unwrap();
    sensor.connect(ClientId(1)).await.unwrap();
    sensor.subscribe(ClientId(1)).await.unwrap();

    // Interrupt signal without any pending source bit
    sensor.sample_ready();

    let outcome = timeout(Duration::from_millis(100), events.recv()).await;
    assert!(outcome.is_err(), "spurious interrupt produced a report");

    sensor.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_out_of_range_axis_reported_as_field_error() {
    let bus = Arc::new(SimBus::new());
    // x decodes to 128 g, far outside the ±16 g range; y and z are valid
    bus.set_sample_raw(0x7FFF, 256, 512);
    let sensor = controller_over(&bus);

    sensor.start().await.unwrap();
    sensor.connect(ClientId(1)).await.unwrap();

    let fields = sensor
        .get_data_fields(&[
            FieldId::AccelerationX,
            FieldId::AccelerationY,
            FieldId::AccelerationZ,
        ])
        .await
        .unwrap();

    // The rejected axis comes back as an error, not an empty success
    assert!(matches!(
        fields.get(&FieldId::AccelerationX),
        Some(Err(SensorError::InvalidArgument(_)))
    ));
    assert_eq!(
        fields.get(&FieldId::AccelerationY),
        Some(&Ok(PropertyValue::Double(1.0)))
    );
    assert_eq!(
        fields.get(&FieldId::AccelerationZ),
        Some(&Ok(PropertyValue::Double(2.0)))
    );
    assert!(fields.status().is_err());

    // Once the axis reads in range again the error clears
    bus.set_sample_raw(0, 256, 512);
    let fields = sensor
        .get_data_fields(&[FieldId::AccelerationX])
        .await
        .unwrap();
    assert_eq!(
        fields.get(&FieldId::AccelerationX),
        Some(&Ok(PropertyValue::Double(0.0)))
    );

    sensor.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_identity_properties_seeded() {
    let bus = Arc::new(SimBus::new());
    let sensor = controller_over(&bus);

    let results = sensor.get_properties(&[
        PropertyKey::Manufacturer,
        PropertyKey::Model,
        PropertyKey::MinReportInterval,
        PropertyKey::CurrentReportInterval,
        PropertyKey::RangeMaximum,
    ]);

    assert_eq!(
        results.get(&PropertyKey::Manufacturer),
        Some(&Ok(PropertyValue::Text("Analog Devices".into())))
    );
    assert_eq!(
        results.get(&PropertyKey::Model),
        Some(&Ok(PropertyValue::Text("ADXL345".into())))
    );
    assert_eq!(
        results.get(&PropertyKey::MinReportInterval),
        Some(&Ok(PropertyValue::Unsigned(10)))
    );
    // No client connected: the default interval is in effect
    assert_eq!(
        results.get(&PropertyKey::CurrentReportInterval),
        Some(&Ok(PropertyValue::Unsigned(100)))
    );
    match results.get(&PropertyKey::RangeMaximum) {
        Some(Ok(PropertyValue::FieldMap(map))) => {
            assert_eq!(
                map.get(&FieldId::AccelerationZ),
                Some(&PropertyValue::Double(16.0))
            );
        }
        other => panic!("expected a per-axis range map, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_persistent_unique_id_survives_restart() {
    let bus = Arc::new(SimBus::new());
    let store: Arc<dyn PropertyStore> = Arc::new(MemoryStore::new());

    let first = controller_with_store(&bus, Arc::clone(&store));
    let id_a = first
        .get_properties(&[PropertyKey::PersistentUniqueId])
        .get(&PropertyKey::PersistentUniqueId)
        .cloned()
        .unwrap()
        .unwrap();

    let second = controller_with_store(&bus, store);
    let id_b = second
        .get_properties(&[PropertyKey::PersistentUniqueId])
        .get(&PropertyKey::PersistentUniqueId)
        .cloned()
        .unwrap()
        .unwrap();

    assert!(matches!(id_a, PropertyValue::Guid(_)));
    assert_eq!(id_a, id_b);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_connect_before_start_applied_on_start() {
    let bus = Arc::new(SimBus::new());
    bus.set_sample(0.0, 0.0, 1.0);
    let sensor = controller_over(&bus);

    // Hardware is untouched until start
    sensor.connect(ClientId(1)).await.unwrap();
    assert!(bus.write_log().is_empty());

    sensor.start().await.unwrap();
    assert_eq!(sensor.mode().await, Mode::Polling);
    assert_eq!(sensor.state(), SensorState::Ready);

    sensor.stop().await.unwrap();
}
