//! Hot-swap state machine: activation cycle, timers, indicator.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use backplane_core::{
    DiscreteStates, DomainConfig, EntityError, EntityRef, EntityRegistry, EventDir,
    HotSwapConfig, HotSwapOps, HotSwapState, IndicatorSpec, Sensor, SwapTimeout,
};
use backplane_records::EntityKey;
use common::{init_tracing, registry, MockControl, MockSensor};

const IND: IndicatorSpec =
    IndicatorSpec { req_activate: 1, active: 2, req_deactivate: 3, inactive: 0 };

struct Rig {
    ent: EntityRef,
    presence: Arc<MockSensor>,
    requester: Arc<MockSensor>,
    requester_dyn: Arc<dyn Sensor>,
    power: Arc<MockControl>,
    indicator: Arc<MockControl>,
    transitions: Arc<Mutex<Vec<(HotSwapState, HotSwapState)>>>,
}

/// Entity with a requester sensor (offset 3), a power control, an
/// indicator, and a presence sensor: the full hot-swap complement.
async fn rig_with_config(config: DomainConfig) -> Rig {
    init_tracing();
    let reg = EntityRegistry::new(config);
    let ent = reg.add(EntityKey::system(0x0a, 1));

    let requester = MockSensor::requester("req", 3);
    let requester_dyn: Arc<dyn Sensor> = requester.clone();
    ent.add_sensor(requester_dyn.clone()).await;

    let power = MockControl::power("pwr");
    let power_dyn: Arc<dyn backplane_core::Control> = power.clone();
    ent.add_control(power_dyn).await;

    let indicator = MockControl::indicator("ind", IND);
    let indicator_dyn: Arc<dyn backplane_core::Control> = indicator.clone();
    ent.add_control(indicator_dyn).await;

    let presence = MockSensor::presence("pres");
    let presence_dyn: Arc<dyn Sensor> = presence.clone();
    ent.add_sensor(presence_dyn.clone()).await;

    let transitions = Arc::new(Mutex::new(Vec::new()));
    let t = transitions.clone();
    ent.add_hot_swap_handler(Arc::new(move |_, old, new, _| {
        t.lock().unwrap().push((old, new));
        backplane_core::EventDisposition::NotHandled
    }));

    Rig { ent, presence, requester, requester_dyn, power, indicator, transitions }
}

async fn rig() -> Rig {
    rig_with_config(DomainConfig::default()).await
}

#[tokio::test]
async fn activation_cycle_with_power_control() {
    let rig = rig().await;
    assert_eq!(rig.ent.hot_swap_state().await.unwrap(), HotSwapState::NotPresent);

    // Presence arrives with power off: the machine queries power and lands
    // on Inactive, and the deasserted requester immediately requests
    // activation.
    rig.presence.set_states(DiscreteStates::default().with_bit(0));
    rig.ent.detect_presence(true).await;
    assert_eq!(rig.ent.hot_swap_state().await.unwrap(), HotSwapState::ActivationRequested);
    {
        let transitions = rig.transitions.lock().unwrap();
        assert_eq!(
            *transitions,
            vec![
                (HotSwapState::NotPresent, HotSwapState::Inactive),
                (HotSwapState::Inactive, HotSwapState::ActivationRequested),
            ]
        );
    }

    // User-driven activation: power on, then Active.
    rig.ent.activate().await.unwrap();
    assert_eq!(rig.ent.hot_swap_state().await.unwrap(), HotSwapState::Active);
    assert_eq!(*rig.power.sets.lock().unwrap(), vec![1]);
    {
        let transitions = rig.transitions.lock().unwrap();
        assert_eq!(
            transitions[2..],
            [
                (HotSwapState::ActivationRequested, HotSwapState::ActivationInProgress),
                (HotSwapState::ActivationInProgress, HotSwapState::Active),
            ]
        );
    }

    // The indicator tracked every state that drives it.
    assert_eq!(*rig.indicator.sets.lock().unwrap(), vec![0, 0, 1, 2, 2]);
}

#[tokio::test]
async fn requester_drives_deactivation() {
    let rig = rig().await;
    rig.presence.set_states(DiscreteStates::default().with_bit(0));
    rig.ent.detect_presence(true).await;
    rig.ent.activate().await.unwrap();
    assert_eq!(rig.ent.hot_swap_state().await.unwrap(), HotSwapState::Active);

    // Requester asserts: deactivation requested.
    rig.requester.set_states(DiscreteStates::default().with_bit(3));
    rig.ent.sensor_event(&rig.requester_dyn, EventDir::Assertion, 3, None).await;
    assert_eq!(rig.ent.hot_swap_state().await.unwrap(), HotSwapState::DeactivationRequested);
    assert!(rig.ent.hot_swap_requester().await.unwrap());

    // Requester deasserts again: back to Active.
    rig.requester.set_states(DiscreteStates::default());
    rig.ent.sensor_event(&rig.requester_dyn, EventDir::Deassertion, 3, None).await;
    assert_eq!(rig.ent.hot_swap_state().await.unwrap(), HotSwapState::Active);

    // Assert once more and deactivate: power off, then Inactive.
    rig.requester.set_states(DiscreteStates::default().with_bit(3));
    rig.ent.sensor_event(&rig.requester_dyn, EventDir::Assertion, 3, None).await;
    rig.ent.deactivate().await.unwrap();
    assert_eq!(rig.ent.hot_swap_state().await.unwrap(), HotSwapState::Inactive);
    assert_eq!(*rig.power.sets.lock().unwrap(), vec![1, 0]);
}

#[tokio::test]
async fn requester_event_in_requested_state_cancels_to_inactive() {
    let rig = rig().await;
    rig.presence.set_states(DiscreteStates::default().with_bit(0));
    rig.ent.detect_presence(true).await;
    assert_eq!(rig.ent.hot_swap_state().await.unwrap(), HotSwapState::ActivationRequested);

    rig.requester.set_states(DiscreteStates::default().with_bit(3));
    rig.ent.sensor_event(&rig.requester_dyn, EventDir::Assertion, 3, None).await;
    assert_eq!(rig.ent.hot_swap_state().await.unwrap(), HotSwapState::Inactive);
}

#[tokio::test]
async fn presence_loss_lands_on_not_present_from_any_state() {
    let rig = rig().await;
    rig.presence.set_states(DiscreteStates::default().with_bit(0));
    rig.ent.detect_presence(true).await;
    rig.ent.activate().await.unwrap();

    rig.presence.set_states(DiscreteStates::default());
    rig.ent.detect_presence(true).await;
    assert_eq!(rig.ent.hot_swap_state().await.unwrap(), HotSwapState::NotPresent);
}

#[tokio::test]
async fn activate_outside_requested_state_is_rejected() {
    let rig = rig().await;
    let err = rig.ent.activate().await.unwrap_err();
    assert!(matches!(err, EntityError::InvalidState(HotSwapState::NotPresent)));
    assert_eq!(rig.power.set_count(), 0);
}

#[tokio::test]
async fn auto_activate_timer_retries_the_activation() {
    let config = DomainConfig {
        hot_swap: HotSwapConfig { auto_activate_ms: Some(40), auto_deactivate_ms: None },
        ..Default::default()
    };
    let rig = rig_with_config(config).await;
    rig.presence.set_states(DiscreteStates::default().with_bit(0));
    rig.ent.detect_presence(true).await;
    assert_eq!(rig.ent.hot_swap_state().await.unwrap(), HotSwapState::ActivationRequested);

    // No user action; the timer drives the activation.
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(rig.ent.hot_swap_state().await.unwrap(), HotSwapState::Active);
    assert_eq!(*rig.power.sets.lock().unwrap(), vec![1]);
}

#[tokio::test]
async fn stale_timer_fire_after_user_activation_is_a_noop() {
    let config = DomainConfig {
        hot_swap: HotSwapConfig { auto_activate_ms: Some(60), auto_deactivate_ms: None },
        ..Default::default()
    };
    let rig = rig_with_config(config).await;
    rig.presence.set_states(DiscreteStates::default().with_bit(0));
    rig.ent.detect_presence(true).await;

    // The user beats the timer.
    rig.ent.activate().await.unwrap();
    assert_eq!(rig.ent.hot_swap_state().await.unwrap(), HotSwapState::Active);
    assert_eq!(rig.power.set_count(), 1);

    // The armed timer still fires, sees the state moved on, and does
    // nothing: no second power write, no state change.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(rig.ent.hot_swap_state().await.unwrap(), HotSwapState::Active);
    assert_eq!(rig.power.set_count(), 1);
}

#[tokio::test]
async fn indicator_failures_are_not_fatal() {
    let rig = rig().await;
    rig.indicator.set_fail_sets(true);
    rig.presence.set_states(DiscreteStates::default().with_bit(0));
    rig.ent.detect_presence(true).await;
    // The machine still advances even though every indicator write failed.
    assert_eq!(rig.ent.hot_swap_state().await.unwrap(), HotSwapState::ActivationRequested);
}

#[tokio::test]
async fn hot_swap_operations_need_the_capability() {
    let reg = registry();
    let ent = reg.add(EntityKey::system(0x07, 1));
    assert!(matches!(ent.activate().await, Err(EntityError::Unsupported)));
    assert!(matches!(ent.hot_swap_state().await, Err(EntityError::Unsupported)));
    assert!(matches!(ent.set_auto_activate(SwapTimeout::Now), Err(EntityError::Unsupported)));
}

#[tokio::test]
async fn auto_activate_time_is_settable_with_a_power_control() {
    let rig = rig().await;
    assert_eq!(rig.ent.auto_activate().unwrap(), SwapTimeout::Never);
    rig.ent.set_auto_activate(SwapTimeout::After(Duration::from_secs(2))).unwrap();
    assert_eq!(rig.ent.auto_activate().unwrap(), SwapTimeout::After(Duration::from_secs(2)));
}

struct PinnedOps;

#[async_trait]
impl HotSwapOps for PinnedOps {
    async fn state(&self, _ent: &EntityRef) -> Result<HotSwapState, EntityError> {
        Ok(HotSwapState::OutOfCon)
    }

    fn set_auto_activate(&self, _: &EntityRef, _: SwapTimeout) -> Result<(), EntityError> {
        Err(EntityError::Unsupported)
    }

    fn auto_activate(&self, _: &EntityRef) -> Result<SwapTimeout, EntityError> {
        Err(EntityError::Unsupported)
    }

    fn set_auto_deactivate(&self, _: &EntityRef, _: SwapTimeout) -> Result<(), EntityError> {
        Err(EntityError::Unsupported)
    }

    fn auto_deactivate(&self, _: &EntityRef) -> Result<SwapTimeout, EntityError> {
        Err(EntityError::Unsupported)
    }

    async fn activate(&self, _: &EntityRef) -> Result<(), EntityError> {
        Ok(())
    }

    async fn deactivate(&self, _: &EntityRef) -> Result<(), EntityError> {
        Ok(())
    }

    async fn indicator(&self, _: &EntityRef) -> Result<i32, EntityError> {
        Err(EntityError::Unsupported)
    }

    async fn set_indicator(&self, _: &EntityRef, _: i32) -> Result<(), EntityError> {
        Err(EntityError::Unsupported)
    }

    async fn requester(&self, _: &EntityRef) -> Result<bool, EntityError> {
        Ok(false)
    }

    async fn check_state(&self, _: &EntityRef) -> Result<(), EntityError> {
        Ok(())
    }
}

#[tokio::test]
async fn external_ops_table_displaces_the_builtin() {
    let reg = registry();
    let ent = reg.add(EntityKey::system(0x0a, 1));
    ent.set_hot_swappable(true);
    ent.set_hot_swap_ops(Arc::new(PinnedOps));

    // Attaching a presence sensor must not re-install the built-in table.
    let sensor = MockSensor::presence("pres");
    let dyn_sensor: Arc<dyn Sensor> = sensor.clone();
    ent.add_sensor(dyn_sensor).await;

    sensor.set_states(DiscreteStates::default().with_bit(0));
    ent.detect_presence(true).await;
    assert!(ent.present());
    assert_eq!(
        ent.hot_swap_state().await.unwrap(),
        HotSwapState::OutOfCon,
        "the external table answers, the built-in machine stays out"
    );
}
