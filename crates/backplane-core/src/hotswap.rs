//! Hot-swap state machine
//!
//! Layered on presence, a requester sensor, a power control, and an
//! indicator control. The built-in machine installs itself the first time a
//! presence/presence-bit sensor or a hot-swap requester/power/indicator is
//! attached; callers may replace it wholesale with their own
//! [`HotSwapOps`] table.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::control::IndicatorSpec;
use crate::error::EntityError;
use crate::event::{EventDisposition, PlatformEvent, UpdateKind};
use crate::registry::EntityRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HotSwapState {
    NotPresent,
    Inactive,
    ActivationRequested,
    ActivationInProgress,
    Active,
    DeactivationRequested,
    DeactivationInProgress,
    /// Degenerate state entered only by external tables, never a target of
    /// the built-in machine.
    OutOfCon,
}

impl std::fmt::Display for HotSwapState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            HotSwapState::NotPresent => "not present",
            HotSwapState::Inactive => "inactive",
            HotSwapState::ActivationRequested => "activation requested",
            HotSwapState::ActivationInProgress => "activation in progress",
            HotSwapState::Active => "active",
            HotSwapState::DeactivationRequested => "deactivation requested",
            HotSwapState::DeactivationInProgress => "deactivation in progress",
            HotSwapState::OutOfCon => "out of connection",
        };
        write!(f, "{name}")
    }
}

/// Auto-activate/deactivate timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapTimeout {
    /// Wait forever for an explicit activate/deactivate.
    Never,
    /// Act immediately, skipping the requested state's delay.
    Now,
    After(Duration),
}

/// A pluggable hot-swap control table. The built-in implementation drives
/// the power/indicator controls and requester sensor; external tables may
/// do anything.
#[async_trait]
pub trait HotSwapOps: Send + Sync {
    async fn state(&self, ent: &EntityRef) -> Result<HotSwapState, EntityError>;

    fn set_auto_activate(&self, ent: &EntityRef, t: SwapTimeout) -> Result<(), EntityError>;
    fn auto_activate(&self, ent: &EntityRef) -> Result<SwapTimeout, EntityError>;
    fn set_auto_deactivate(&self, ent: &EntityRef, t: SwapTimeout) -> Result<(), EntityError>;
    fn auto_deactivate(&self, ent: &EntityRef) -> Result<SwapTimeout, EntityError>;

    async fn activate(&self, ent: &EntityRef) -> Result<(), EntityError>;
    async fn deactivate(&self, ent: &EntityRef) -> Result<(), EntityError>;

    async fn indicator(&self, ent: &EntityRef) -> Result<i32, EntityError>;
    async fn set_indicator(&self, ent: &EntityRef, val: i32) -> Result<(), EntityError>;

    /// Whether the requester sensor currently reports a removal request.
    async fn requester(&self, ent: &EntityRef) -> Result<bool, EntityError>;

    /// Re-derive the machine state from the live power/requester inputs.
    async fn check_state(&self, ent: &EntityRef) -> Result<(), EntityError>;
}

impl EntityRef {
    fn swap_ops(&self) -> Result<Arc<dyn HotSwapOps>, EntityError> {
        let sw = self.entity().swap.lock().unwrap();
        if !sw.hot_swappable {
            return Err(EntityError::Unsupported);
        }
        sw.ops.clone().ok_or(EntityError::Unsupported)
    }

    pub(crate) fn swap_state(&self) -> HotSwapState {
        self.entity().swap.lock().unwrap().state
    }

    pub async fn hot_swap_state(&self) -> Result<HotSwapState, EntityError> {
        self.swap_ops()?.state(self).await
    }

    /// Drive the activation the entity is waiting for. Valid only in
    /// `ActivationRequested`.
    pub async fn activate(&self) -> Result<(), EntityError> {
        self.swap_ops()?.activate(self).await
    }

    /// Drive the deactivation the entity is waiting for. Valid only in
    /// `DeactivationRequested`.
    pub async fn deactivate(&self) -> Result<(), EntityError> {
        self.swap_ops()?.deactivate(self).await
    }

    pub fn set_auto_activate(&self, t: SwapTimeout) -> Result<(), EntityError> {
        self.swap_ops()?.set_auto_activate(self, t)
    }

    pub fn auto_activate(&self) -> Result<SwapTimeout, EntityError> {
        self.swap_ops()?.auto_activate(self)
    }

    pub fn set_auto_deactivate(&self, t: SwapTimeout) -> Result<(), EntityError> {
        self.swap_ops()?.set_auto_deactivate(self, t)
    }

    pub fn auto_deactivate(&self) -> Result<SwapTimeout, EntityError> {
        self.swap_ops()?.auto_deactivate(self)
    }

    pub async fn hot_swap_indicator(&self) -> Result<i32, EntityError> {
        self.swap_ops()?.indicator(self).await
    }

    pub async fn set_hot_swap_indicator(&self, val: i32) -> Result<(), EntityError> {
        self.swap_ops()?.set_indicator(self, val).await
    }

    pub async fn hot_swap_requester(&self) -> Result<bool, EntityError> {
        self.swap_ops()?.requester(self).await
    }

    pub async fn check_hot_swap_state(&self) -> Result<(), EntityError> {
        self.swap_ops()?.check_state(self).await
    }

    pub fn set_hot_swappable(&self, val: bool) {
        {
            let mut sw = self.entity().swap.lock().unwrap();
            if sw.hot_swappable == val {
                return;
            }
            sw.hot_swappable = val;
        }
        self.shared.fire_update(UpdateKind::Changed, self.entity());
    }

    /// Replace the hot-swap machine with an external control table.
    pub fn set_hot_swap_ops(&self, ops: Arc<dyn HotSwapOps>) {
        let mut sw = self.entity().swap.lock().unwrap();
        sw.ops = Some(ops);
        sw.ops_is_builtin = false;
    }
}

/// Install the built-in machine if no table is installed yet, marking the
/// entity hot-swap capable.
pub(crate) fn ensure_builtin(ent: &EntityRef) {
    let installed = {
        let mut sw = ent.entity().swap.lock().unwrap();
        if sw.ops.is_none() {
            sw.ops = Some(Arc::new(BuiltInHotSwap));
            sw.ops_is_builtin = true;
            sw.hot_swappable = true;
            true
        } else {
            false
        }
    };
    if installed {
        ent.shared.fire_update(UpdateKind::Changed, ent.entity());
    }
}

/// Whether presence changes should be routed through the built-in machine.
pub(crate) fn uses_builtin(ent: &EntityRef) -> bool {
    let sw = ent.entity().swap.lock().unwrap();
    sw.hot_swappable && sw.ops_is_builtin
}

/// Indicator value for a machine state, if that state drives the indicator.
pub(crate) fn indicator_value_for(state: HotSwapState, spec: &IndicatorSpec) -> i32 {
    indicator_value(state, spec).unwrap_or(spec.inactive)
}

fn indicator_value(state: HotSwapState, spec: &IndicatorSpec) -> Option<i32> {
    match state {
        HotSwapState::Inactive => Some(spec.inactive),
        HotSwapState::ActivationRequested => Some(spec.req_activate),
        HotSwapState::ActivationInProgress | HotSwapState::Active => Some(spec.active),
        HotSwapState::DeactivationRequested | HotSwapState::DeactivationInProgress => {
            Some(spec.req_deactivate)
        }
        HotSwapState::NotPresent | HotSwapState::OutOfCon => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SwapAction {
    Activate,
    Deactivate,
}

/// Move the machine to `state`. Arms the auto timers when entering a
/// requested state with a finite timeout, reflects the state on the
/// indicator (failures logged, never fatal), and runs the hot-swap handler
/// chain when the state actually changed.
pub(crate) async fn set_state(
    ent: &EntityRef,
    state: HotSwapState,
    event: Option<&PlatformEvent>,
) -> EventDisposition {
    let (old, arm_act, arm_deact) = {
        let sw = ent.entity().swap.lock().unwrap();
        let arm_act = (state == HotSwapState::ActivationRequested
            && sw.act_timeout != SwapTimeout::Never)
            .then_some(sw.act_timeout);
        let arm_deact = (state == HotSwapState::DeactivationRequested
            && sw.deact_timeout != SwapTimeout::Never)
            .then_some(sw.deact_timeout);
        (sw.state, arm_act, arm_deact)
    };
    if let Some(t) = arm_act {
        arm_timer(ent, SwapAction::Activate, t);
    }
    if let Some(t) = arm_deact {
        arm_timer(ent, SwapAction::Deactivate, t);
    }

    let mut handled = EventDisposition::NotHandled;
    if old != state {
        ent.entity().swap.lock().unwrap().state = state;
        debug!(entity = %ent.name(), from = %old, to = %state, "hot-swap state change");
        let mut ev = event;
        for h in ent.entity().handlers.hot_swap.snapshot() {
            if h(ent.entity(), old, state, ev) == EventDisposition::Handled {
                handled = EventDisposition::Handled;
                ev = None;
            }
        }
    }

    let indicator = ent.entity().roles.lock().unwrap().indicator.clone();
    if let Some((control, spec)) = indicator {
        if let Some(val) = indicator_value(state, &spec) {
            if let Err(e) = control.set_value(val).await {
                warn!(
                    entity = %ent.name(),
                    control = control.id(),
                    error = %e,
                    "unable to set hot-swap indicator"
                );
            }
        }
    }

    handled
}

fn arm_timer(ent: &EntityRef, action: SwapAction, timeout: SwapTimeout) {
    let timer = match action {
        SwapAction::Activate => &ent.entity().act_timer,
        SwapAction::Deactivate => &ent.entity().deact_timer,
    };
    if timer.armed.swap(true, Ordering::AcqRel) {
        return;
    }
    let delay = match timeout {
        SwapTimeout::Never => {
            timer.armed.store(false, Ordering::Release);
            return;
        }
        SwapTimeout::Now => Duration::ZERO,
        SwapTimeout::After(d) => d,
    };
    let task_ent = ent.clone();
    let handle = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let timer = match action {
            SwapAction::Activate => &task_ent.entity().act_timer,
            SwapAction::Deactivate => &task_ent.entity().deact_timer,
        };
        timer.armed.store(false, Ordering::Release);
        if task_ent.entity().destroyed.load(Ordering::Acquire) {
            return;
        }
        // Re-attempt the pending action. If the machine already left the
        // requested state this fires as a harmless no-op.
        let result = match action {
            SwapAction::Activate => builtin_activate(&task_ent).await,
            SwapAction::Deactivate => builtin_deactivate(&task_ent).await,
        };
        match result {
            Ok(()) | Err(EntityError::InvalidState(_)) => {}
            Err(e) => {
                warn!(entity = %task_ent.name(), error = %e, "hot-swap auto action failed")
            }
        }
    });
    ent.entity().track_task(handle);
}

/// Presence routing for the built-in machine: becoming present lands on
/// `Active` directly (no power control or immediate timeout) or via a power
/// query; becoming absent always lands on `NotPresent`.
pub(crate) async fn handle_presence(
    ent: &EntityRef,
    present: bool,
    event: Option<&PlatformEvent>,
) -> EventDisposition {
    if !present {
        return set_state(ent, HotSwapState::NotPresent, event).await;
    }
    let power = ent.entity().roles.lock().unwrap().power.clone();
    let act_timeout = ent.entity().swap.lock().unwrap().act_timeout;
    let Some(power) = power else {
        return set_state(ent, HotSwapState::Active, event).await;
    };
    if act_timeout == SwapTimeout::Now {
        return set_state(ent, HotSwapState::Active, event).await;
    }
    match power.get_value().await {
        Ok(val) => power_checked(ent, val != 0).await,
        Err(e) => warn!(
            entity = %ent.name(),
            control = power.id(),
            error = %e,
            "unable to read hot-swap power state"
        ),
    }
    EventDisposition::NotHandled
}

/// Apply an observed power value: on → `Active`, off → `Inactive`, then let
/// the requester refine the result.
pub(crate) async fn power_checked(ent: &EntityRef, on: bool) {
    let state = if on { HotSwapState::Active } else { HotSwapState::Inactive };
    set_state(ent, state, None).await;
    refresh_requester(ent).await;
}

/// Query the requester sensor and nudge `Active`/`Inactive` into the
/// matching requested state.
pub(crate) async fn refresh_requester(ent: &EntityRef) {
    let requester = ent.entity().roles.lock().unwrap().requester.clone();
    let Some((sensor, spec)) = requester else {
        return;
    };
    match sensor.read_states().await {
        Ok(states) => {
            let requesting = states.is_set(spec.offset) == spec.requesting_val;
            let state = ent.swap_state();
            if requesting && state == HotSwapState::Active {
                set_state(ent, HotSwapState::DeactivationRequested, None).await;
            } else if !requesting && state == HotSwapState::Inactive {
                set_state(ent, HotSwapState::ActivationRequested, None).await;
            }
        }
        Err(e) => warn!(
            entity = %ent.name(),
            sensor = sensor.id(),
            error = %e,
            "unable to read hot-swap requester"
        ),
    }
}

/// A requester sensor edge: `requesting` means removal was requested.
pub(crate) async fn requester_event(
    ent: &EntityRef,
    requesting: bool,
    event: Option<PlatformEvent>,
) {
    let state = ent.swap_state();
    let target = if requesting {
        match state {
            HotSwapState::Active => Some(HotSwapState::DeactivationRequested),
            HotSwapState::ActivationRequested => Some(HotSwapState::Inactive),
            HotSwapState::ActivationInProgress => Some(HotSwapState::DeactivationInProgress),
            _ => None,
        }
    } else {
        match state {
            HotSwapState::DeactivationRequested => Some(HotSwapState::Active),
            HotSwapState::Inactive => Some(HotSwapState::ActivationRequested),
            _ => None,
        }
    };
    let Some(target) = target else {
        if let Some(ev) = event {
            ent.shared.forward_unhandled(ev);
        }
        return;
    };
    let handled = set_state(ent, target, event.as_ref()).await;
    if handled == EventDisposition::NotHandled {
        if let Some(ev) = event {
            ent.shared.forward_unhandled(ev);
        }
    }
}

async fn builtin_activate(ent: &EntityRef) -> Result<(), EntityError> {
    {
        let sw = ent.entity().swap.lock().unwrap();
        if sw.state != HotSwapState::ActivationRequested {
            return Err(EntityError::InvalidState(sw.state));
        }
    }
    let power = ent
        .entity()
        .roles
        .lock()
        .unwrap()
        .power
        .clone()
        .ok_or(EntityError::Unsupported)?;
    set_state(ent, HotSwapState::ActivationInProgress, None).await;
    match power.set_value(1).await {
        Ok(()) => {
            set_state(ent, HotSwapState::Active, None).await;
            Ok(())
        }
        Err(e) => {
            warn!(
                entity = %ent.name(),
                control = power.id(),
                error = %e,
                "unable to set hot-swap power"
            );
            Err(EntityError::Collaborator(e))
        }
    }
}

async fn builtin_deactivate(ent: &EntityRef) -> Result<(), EntityError> {
    {
        let sw = ent.entity().swap.lock().unwrap();
        if sw.state != HotSwapState::DeactivationRequested {
            return Err(EntityError::InvalidState(sw.state));
        }
    }
    let power = ent
        .entity()
        .roles
        .lock()
        .unwrap()
        .power
        .clone()
        .ok_or(EntityError::Unsupported)?;
    set_state(ent, HotSwapState::DeactivationInProgress, None).await;
    match power.set_value(0).await {
        Ok(()) => {
            set_state(ent, HotSwapState::Inactive, None).await;
            Ok(())
        }
        Err(e) => {
            warn!(
                entity = %ent.name(),
                control = power.id(),
                error = %e,
                "unable to set hot-swap power"
            );
            Err(EntityError::Collaborator(e))
        }
    }
}

pub(crate) struct BuiltInHotSwap;

#[async_trait]
impl HotSwapOps for BuiltInHotSwap {
    async fn state(&self, ent: &EntityRef) -> Result<HotSwapState, EntityError> {
        Ok(ent.swap_state())
    }

    fn set_auto_activate(&self, ent: &EntityRef, t: SwapTimeout) -> Result<(), EntityError> {
        ent.entity().roles.lock().unwrap().power.as_ref().ok_or(EntityError::Unsupported)?;
        ent.entity().swap.lock().unwrap().act_timeout = t;
        Ok(())
    }

    fn auto_activate(&self, ent: &EntityRef) -> Result<SwapTimeout, EntityError> {
        ent.entity().roles.lock().unwrap().power.as_ref().ok_or(EntityError::Unsupported)?;
        Ok(ent.entity().swap.lock().unwrap().act_timeout)
    }

    fn set_auto_deactivate(&self, ent: &EntityRef, t: SwapTimeout) -> Result<(), EntityError> {
        ent.entity().roles.lock().unwrap().power.as_ref().ok_or(EntityError::Unsupported)?;
        ent.entity().swap.lock().unwrap().deact_timeout = t;
        Ok(())
    }

    fn auto_deactivate(&self, ent: &EntityRef) -> Result<SwapTimeout, EntityError> {
        ent.entity().roles.lock().unwrap().power.as_ref().ok_or(EntityError::Unsupported)?;
        Ok(ent.entity().swap.lock().unwrap().deact_timeout)
    }

    async fn activate(&self, ent: &EntityRef) -> Result<(), EntityError> {
        builtin_activate(ent).await
    }

    async fn deactivate(&self, ent: &EntityRef) -> Result<(), EntityError> {
        builtin_deactivate(ent).await
    }

    async fn indicator(&self, ent: &EntityRef) -> Result<i32, EntityError> {
        let indicator = ent.entity().roles.lock().unwrap().indicator.clone();
        let (control, _) = indicator.ok_or(EntityError::Unsupported)?;
        control.get_value().await.map_err(EntityError::Collaborator)
    }

    async fn set_indicator(&self, ent: &EntityRef, val: i32) -> Result<(), EntityError> {
        let indicator = ent.entity().roles.lock().unwrap().indicator.clone();
        let (control, _) = indicator.ok_or(EntityError::Unsupported)?;
        control.set_value(val).await.map_err(EntityError::Collaborator)
    }

    async fn requester(&self, ent: &EntityRef) -> Result<bool, EntityError> {
        let requester = ent.entity().roles.lock().unwrap().requester.clone();
        let (sensor, spec) = requester.ok_or(EntityError::Unsupported)?;
        let states = sensor.read_states().await.map_err(EntityError::Collaborator)?;
        Ok(states.is_set(spec.offset) == spec.requesting_val)
    }

    async fn check_state(&self, ent: &EntityRef) -> Result<(), EntityError> {
        let (power, requester) = {
            let roles = ent.entity().roles.lock().unwrap();
            (roles.power.clone(), roles.requester.clone())
        };
        // Power is assumed on when there is no power control.
        let power_on = match &power {
            Some(control) => match control.get_value().await {
                Ok(val) => val != 0,
                Err(e) => {
                    warn!(
                        entity = %ent.name(),
                        control = control.id(),
                        error = %e,
                        "unable to read hot-swap power state"
                    );
                    return Ok(());
                }
            },
            None => true,
        };
        match requester {
            Some((sensor, spec)) => match sensor.read_states().await {
                Ok(states) => {
                    let requesting = states.is_set(spec.offset) == spec.requesting_val;
                    let target = match (requesting, power_on) {
                        (true, true) => HotSwapState::DeactivationRequested,
                        (true, false) => HotSwapState::Inactive,
                        (false, true) => HotSwapState::Active,
                        (false, false) => HotSwapState::ActivationRequested,
                    };
                    set_state(ent, target, None).await;
                }
                Err(e) => warn!(
                    entity = %ent.name(),
                    sensor = sensor.id(),
                    error = %e,
                    "unable to read hot-swap requester"
                ),
            },
            None => {
                if power.is_some() {
                    let target =
                        if power_on { HotSwapState::Active } else { HotSwapState::Inactive };
                    set_state(ent, target, None).await;
                }
            }
        }
        Ok(())
    }
}
