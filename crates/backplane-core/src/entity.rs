//! Entities and their sensor/control attachments
//!
//! An entity is one managed hardware or logical component. The registry
//! owns every entity; callers hold them only through pinned [`EntityRef`]s
//! or re-resolvable [`EntityHandle`]s. Graph shape (children, parents,
//! attached sensors/controls, reference counts) lives under the registry's
//! structural lock; everything else on the entity is touched only while
//! pinned.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use backplane_records::{entity_id_name, DeviceText, DirRecord, EntityKey, RecordKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::control::{self, Control, IndicatorSpec};
use crate::error::EntityError;
use crate::event::{EventDir, EventDisposition, PlatformEvent, UpdateKind};
use crate::fru::FruData;
use crate::hotswap::{self, HotSwapOps, HotSwapState, SwapTimeout};
use crate::mc::{ManagementController, McMessage, McResponse};
use crate::observer::{HandlerId, HandlerList};
use crate::opqueue::OpQueue;
use crate::presence;
use crate::registry::EntityRef;
use crate::sensor::{self, EventMask, EventSupport, RequesterSpec, Sensor};

/// Identifies one management domain (one registry).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DomainId(Uuid);

impl DomainId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for DomainId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An opaque, comparable reference to an entity that survives asynchronous
/// boundaries. Resolving it through the registry yields the live entity or
/// fails with `NotFound`/`StaleHandle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityHandle {
    pub domain: DomainId,
    pub key: EntityKey,
    pub seq: u64,
}

pub type UpdateHandler = dyn Fn(UpdateKind, &Entity) + Send + Sync;
pub type PresenceHandler =
    dyn Fn(&Entity, bool, Option<&PlatformEvent>) -> EventDisposition + Send + Sync;
pub type HotSwapHandler = dyn Fn(&Entity, HotSwapState, HotSwapState, Option<&PlatformEvent>) -> EventDisposition
    + Send
    + Sync;
pub type SensorHandler = dyn Fn(UpdateKind, &Entity, &Arc<dyn Sensor>) + Send + Sync;
pub type ControlHandler = dyn Fn(UpdateKind, &Entity, &Arc<dyn Control>) + Send + Sync;
pub type FruHandler = dyn Fn(&Entity, UpdateKind) + Send + Sync;

pub(crate) struct PresenceState {
    pub present: bool,
    pub possibly_changed: bool,
    pub frudev_active: bool,
    pub frudev_mc: Option<Arc<dyn ManagementController>>,
}

/// Designated sensor/control roles, each installed at most once.
pub(crate) struct Roles {
    pub presence_sensor: Option<Arc<dyn Sensor>>,
    pub presence_bit_sensor: Option<(Arc<dyn Sensor>, u8)>,
    pub requester: Option<(Arc<dyn Sensor>, RequesterSpec)>,
    pub power: Option<Arc<dyn Control>>,
    pub indicator: Option<(Arc<dyn Control>, IndicatorSpec)>,
}

pub(crate) struct SwapState {
    pub hot_swappable: bool,
    pub state: HotSwapState,
    pub act_timeout: SwapTimeout,
    pub deact_timeout: SwapTimeout,
    pub ops: Option<Arc<dyn HotSwapOps>>,
    pub ops_is_builtin: bool,
}

pub(crate) struct SwapTimer {
    pub armed: AtomicBool,
}

pub(crate) struct EntityHandlers {
    pub presence: HandlerList<PresenceHandler>,
    pub sensor: HandlerList<SensorHandler>,
    pub control: HandlerList<ControlHandler>,
    pub fru: HandlerList<FruHandler>,
    pub hot_swap: HandlerList<HotSwapHandler>,
}

pub struct Entity {
    key: EntityKey,
    seq: u64,
    domain: DomainId,
    name: String,
    created_at: DateTime<Utc>,

    pub(crate) record: Mutex<DirRecord>,
    pub(crate) presence: Mutex<PresenceState>,
    pub(crate) presence_event_count: AtomicU32,
    pub(crate) roles: Mutex<Roles>,
    pub(crate) swap: Mutex<SwapState>,
    pub(crate) act_timer: SwapTimer,
    pub(crate) deact_timer: SwapTimer,
    pub(crate) fru: Mutex<Option<Arc<FruData>>>,
    oem_info: Mutex<Option<Arc<dyn std::any::Any + Send + Sync>>>,
    pub(crate) opq: OpQueue,
    pub(crate) handlers: EntityHandlers,
    pub(crate) tasks: Mutex<Vec<JoinHandle<()>>>,
    pub(crate) destroyed: AtomicBool,
}

impl Entity {
    pub(crate) fn new(
        domain: DomainId,
        domain_name: &str,
        key: EntityKey,
        seq: u64,
        act_timeout: SwapTimeout,
        deact_timeout: SwapTimeout,
    ) -> Self {
        let record = DirRecord {
            kind: RecordKind::Unknown,
            entity_id: key.entity_id,
            entity_instance: key.entity_instance,
            device_num: key.device_num,
            ..Default::default()
        };
        Self {
            key,
            seq,
            domain,
            name: format!("({domain_name}.{key})"),
            created_at: Utc::now(),
            record: Mutex::new(record),
            presence: Mutex::new(PresenceState {
                present: false,
                possibly_changed: true,
                frudev_active: false,
                frudev_mc: None,
            }),
            presence_event_count: AtomicU32::new(0),
            roles: Mutex::new(Roles {
                presence_sensor: None,
                presence_bit_sensor: None,
                requester: None,
                power: None,
                indicator: None,
            }),
            swap: Mutex::new(SwapState {
                hot_swappable: false,
                state: HotSwapState::NotPresent,
                act_timeout,
                deact_timeout,
                ops: None,
                ops_is_builtin: false,
            }),
            act_timer: SwapTimer { armed: AtomicBool::new(false) },
            deact_timer: SwapTimer { armed: AtomicBool::new(false) },
            fru: Mutex::new(None),
            oem_info: Mutex::new(None),
            opq: OpQueue::new(),
            handlers: EntityHandlers {
                presence: HandlerList::new(),
                sensor: HandlerList::new(),
                control: HandlerList::new(),
                fru: HandlerList::new(),
                hot_swap: HandlerList::new(),
            },
            tasks: Mutex::new(Vec::new()),
            destroyed: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> EntityKey {
        self.key
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn domain(&self) -> DomainId {
        self.domain
    }

    /// Name used in reports and log lines, e.g. `(rack12.10.1)`.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entity_id_string(&self) -> &'static str {
        entity_id_name(self.key.entity_id)
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn handle(&self) -> EntityHandle {
        EntityHandle { domain: self.domain, key: self.key, seq: self.seq }
    }

    /// Snapshot of the canonical directory-record payload.
    pub fn record(&self) -> DirRecord {
        self.record.lock().unwrap().clone()
    }

    /// Whether this entity carries FRU inventory data.
    pub fn is_fru_bearing(&self) -> bool {
        self.record.lock().unwrap().is_fru_bearing()
    }

    pub fn present(&self) -> bool {
        self.presence.lock().unwrap().present
    }

    /// Incremented on every presence re-evaluation, including no-ops.
    pub fn presence_event_count(&self) -> u32 {
        self.presence_event_count.load(Ordering::Acquire)
    }

    pub fn hot_swappable(&self) -> bool {
        self.swap.lock().unwrap().hot_swappable
    }

    pub fn fru_data(&self) -> Option<Arc<FruData>> {
        self.fru.lock().unwrap().clone()
    }

    /// Attach plugin-owned data to this entity. Whatever was attached
    /// before is dropped, as is the value at entity destruction.
    pub fn set_oem_info(&self, info: Arc<dyn std::any::Any + Send + Sync>) {
        *self.oem_info.lock().unwrap() = Some(info);
    }

    pub fn oem_info(&self) -> Option<Arc<dyn std::any::Any + Send + Sync>> {
        self.oem_info.lock().unwrap().clone()
    }

    /// Set the textual id if the payload does not carry one yet.
    pub(crate) fn set_id_if_empty(&self, id: DeviceText) {
        let mut record = self.record.lock().unwrap();
        if record.id.is_empty() {
            record.id = id;
        }
    }

    pub fn add_presence_handler(&self, handler: Arc<PresenceHandler>) -> HandlerId {
        self.handlers.presence.add(handler)
    }

    pub fn remove_presence_handler(&self, id: HandlerId) -> bool {
        self.handlers.presence.remove(id)
    }

    pub fn add_hot_swap_handler(&self, handler: Arc<HotSwapHandler>) -> HandlerId {
        self.handlers.hot_swap.add(handler)
    }

    pub fn remove_hot_swap_handler(&self, id: HandlerId) -> bool {
        self.handlers.hot_swap.remove(id)
    }

    pub fn add_sensor_handler(&self, handler: Arc<SensorHandler>) -> HandlerId {
        self.handlers.sensor.add(handler)
    }

    pub fn remove_sensor_handler(&self, id: HandlerId) -> bool {
        self.handlers.sensor.remove(id)
    }

    pub fn add_control_handler(&self, handler: Arc<ControlHandler>) -> HandlerId {
        self.handlers.control.add(handler)
    }

    pub fn remove_control_handler(&self, id: HandlerId) -> bool {
        self.handlers.control.remove(id)
    }

    pub fn add_fru_handler(&self, handler: Arc<FruHandler>) -> HandlerId {
        self.handlers.fru.add(handler)
    }

    pub fn remove_fru_handler(&self, id: HandlerId) -> bool {
        self.handlers.fru.remove(id)
    }

    pub(crate) fn track_task(&self, handle: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap();
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }

    /// Tear down everything the entity owns. Queued operations get their
    /// `Canceled` notice; background tasks are aborted.
    pub(crate) fn finalize(&self) {
        self.opq.close();
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        self.presence.lock().unwrap().frudev_mc = None;
        *self.fru.lock().unwrap() = None;
        *self.oem_info.lock().unwrap() = None;
    }
}

impl std::fmt::Debug for Entity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entity")
            .field("key", &self.key)
            .field("seq", &self.seq)
            .field("name", &self.name)
            .finish()
    }
}

impl EntityRef {
    /// Attach a sensor. Classification decides whether it becomes the
    /// presence sensor (displacing any presence-bit sensor), a presence-bit
    /// sensor, or the hot-swap requester; installing any of those arms the
    /// built-in hot-swap machine if no table is installed yet.
    pub async fn add_sensor(&self, sensor: Arc<dyn Sensor>) {
        let mut became_presence = false;
        let mut presence_bit = None;
        let mut new_requester = None;
        {
            let mut roles = self.entity().roles.lock().unwrap();
            if roles.presence_sensor.is_none() && sensor::is_presence_sensor(sensor.as_ref()) {
                if roles.presence_bit_sensor.take().is_some() {
                    debug!(
                        entity = %self.name(),
                        sensor = sensor.id(),
                        "presence sensor displaces presence-bit sensor"
                    );
                }
                roles.presence_sensor = Some(sensor.clone());
                became_presence = true;
            } else if roles.presence_sensor.is_none() && roles.presence_bit_sensor.is_none() {
                if let Some(bit) = sensor::presence_bit_for(sensor.as_ref()) {
                    roles.presence_bit_sensor = Some((sensor.clone(), bit));
                    presence_bit = Some(bit);
                }
            }
            if roles.requester.is_none() {
                if let Some(spec) = sensor::requester_spec_for(sensor.as_ref()) {
                    roles.requester = Some((sensor.clone(), spec));
                    new_requester = Some(spec);
                }
            }
        }
        self.push_sensor_link(&sensor);
        self.entity().presence.lock().unwrap().possibly_changed = true;

        if became_presence || presence_bit.is_some() || new_requester.is_some() {
            hotswap::ensure_builtin(self);
        }
        if became_presence {
            enable_role_events(&sensor, EventMask::for_offset(0).merged(EventMask::for_offset(1)))
                .await;
        } else if let Some(bit) = presence_bit {
            enable_role_events(&sensor, EventMask::for_offset(bit)).await;
        }
        if let Some(spec) = new_requester {
            enable_role_events(&sensor, EventMask::for_offset(spec.offset)).await;
            if self.hot_swappable() {
                hotswap::refresh_requester(self).await;
            }
        }
        for h in self.entity().handlers.sensor.snapshot() {
            h(UpdateKind::Added, self.entity(), &sensor);
        }
    }

    /// Detach a sensor. If it held the presence or presence-bit role, the
    /// remaining sensors are rescanned for a replacement.
    pub async fn remove_sensor(&self, sensor: &Arc<dyn Sensor>) {
        let mut need_rescan = false;
        {
            let mut roles = self.entity().roles.lock().unwrap();
            if roles.presence_sensor.as_ref().is_some_and(|s| Arc::ptr_eq(s, sensor)) {
                roles.presence_sensor = None;
                need_rescan = true;
            } else if roles
                .presence_bit_sensor
                .as_ref()
                .is_some_and(|(s, _)| Arc::ptr_eq(s, sensor))
            {
                roles.presence_bit_sensor = None;
                need_rescan = true;
            }
            if roles.requester.as_ref().is_some_and(|(s, _)| Arc::ptr_eq(s, sensor)) {
                roles.requester = None;
            }
        }
        if !self.remove_sensor_link(sensor) {
            warn!(
                entity = %self.name(),
                sensor = sensor.id(),
                "removal of a sensor that was not attached"
            );
            return;
        }
        self.entity().presence.lock().unwrap().possibly_changed = true;
        if need_rescan {
            self.rescan_presence_roles().await;
        }
        for h in self.entity().handlers.sensor.snapshot() {
            h(UpdateKind::Deleted, self.entity(), sensor);
        }
    }

    /// Attach a control. Hot-swap power and indicator controls take their
    /// roles if free; installing either arms the built-in machine.
    pub async fn add_control(&self, control: Arc<dyn Control>) {
        let mut became_power = false;
        let mut indicator = None;
        {
            let mut roles = self.entity().roles.lock().unwrap();
            if roles.power.is_none() && control::is_power_control(control.as_ref()) {
                roles.power = Some(control.clone());
                became_power = true;
            }
            if roles.indicator.is_none() {
                if let Some(spec) = control::indicator_spec_for(control.as_ref()) {
                    roles.indicator = Some((control.clone(), spec));
                    indicator = Some(spec);
                }
            }
        }
        self.push_control_link(&control);

        if became_power || indicator.is_some() {
            hotswap::ensure_builtin(self);
        }
        if became_power && self.hot_swappable() && self.present() {
            match control.get_value().await {
                Ok(val) => hotswap::power_checked(self, val != 0).await,
                Err(e) => warn!(
                    entity = %self.name(),
                    control = control.id(),
                    error = %e,
                    "unable to read hot-swap power state"
                ),
            }
        }
        if let Some(spec) = indicator {
            let val = hotswap::indicator_value_for(self.swap_state(), &spec);
            if let Err(e) = control.set_value(val).await {
                warn!(
                    entity = %self.name(),
                    control = control.id(),
                    error = %e,
                    "unable to initialize hot-swap indicator"
                );
            }
        }
        for h in self.entity().handlers.control.snapshot() {
            h(UpdateKind::Added, self.entity(), &control);
        }
    }

    pub fn remove_control(&self, control: &Arc<dyn Control>) {
        {
            let mut roles = self.entity().roles.lock().unwrap();
            if roles.power.as_ref().is_some_and(|c| Arc::ptr_eq(c, control)) {
                roles.power = None;
            }
            if roles.indicator.as_ref().is_some_and(|(c, _)| Arc::ptr_eq(c, control)) {
                roles.indicator = None;
            }
        }
        if !self.remove_control_link(control) {
            warn!(
                entity = %self.name(),
                control = control.id(),
                "removal of a control that was not attached"
            );
            return;
        }
        for h in self.entity().handlers.control.snapshot() {
            h(UpdateKind::Deleted, self.entity(), control);
        }
    }

    /// Route an incoming discrete sensor event. Events from the installed
    /// presence, presence-bit, or requester sensor drive presence and the
    /// hot-swap machine; anything else is ignored here (plain sensors only
    /// influence presence through `detect_presence`).
    pub async fn sensor_event(
        &self,
        sensor: &Arc<dyn Sensor>,
        dir: EventDir,
        offset: u8,
        event: Option<PlatformEvent>,
    ) {
        enum Route {
            Presence,
            PresenceBit(u8),
            Requester(RequesterSpec),
            None,
        }
        let route = {
            let roles = self.entity().roles.lock().unwrap();
            let bit_match = roles
                .presence_bit_sensor
                .as_ref()
                .filter(|(s, _)| Arc::ptr_eq(s, sensor))
                .map(|(_, bit)| *bit);
            let requester_match = roles
                .requester
                .as_ref()
                .filter(|(s, _)| Arc::ptr_eq(s, sensor))
                .map(|(_, spec)| *spec);
            if roles.presence_sensor.as_ref().is_some_and(|s| Arc::ptr_eq(s, sensor)) {
                Route::Presence
            } else if let Some(bit) = bit_match {
                Route::PresenceBit(bit)
            } else if let Some(spec) = requester_match {
                Route::Requester(spec)
            } else {
                Route::None
            }
        };
        match route {
            Route::Presence => {
                // Offset zero is the "present" state; the others mean absent
                // or disabled, coupled with the event direction.
                let present = match dir {
                    EventDir::Assertion => offset == 0,
                    EventDir::Deassertion => offset != 0,
                };
                presence::presence_changed(self, present, event).await;
            }
            Route::PresenceBit(bit) => {
                if offset == bit {
                    presence::presence_changed(self, dir == EventDir::Assertion, event).await;
                }
            }
            Route::Requester(spec) => {
                if offset == spec.offset {
                    let requesting = (dir == EventDir::Assertion) == spec.requesting_val;
                    hotswap::requester_event(self, requesting, event).await;
                }
            }
            Route::None => {}
        }
    }

    /// Send a raw command on behalf of this entity. Commands run through
    /// the entity's op queue (one in flight at a time, the rest in FIFO
    /// order) and fail with `Canceled` if the entity is destroyed first.
    pub async fn send_command(
        &self,
        mc: &Arc<dyn ManagementController>,
        lun: u8,
        msg: McMessage,
    ) -> Result<McResponse, EntityError> {
        let mc = mc.clone();
        self.entity()
            .opq
            .run(async move { mc.send_command(lun, msg).await.map_err(EntityError::Collaborator) })
            .await
    }

    /// Route a value-change event from the hot-swap power control.
    pub async fn power_value_changed(&self, control: &Arc<dyn Control>, value: i32) {
        let is_power = {
            let roles = self.entity().roles.lock().unwrap();
            roles.power.as_ref().is_some_and(|c| Arc::ptr_eq(c, control))
        };
        if is_power && self.present() {
            hotswap::power_checked(self, value != 0).await;
        }
    }

    async fn rescan_presence_roles(&self) {
        let remaining = self.sensors();
        let mut became_presence = None;
        let mut became_bit = None;
        {
            let mut roles = self.entity().roles.lock().unwrap();
            if roles.presence_sensor.is_none() && roles.presence_bit_sensor.is_none() {
                if let Some(s) =
                    remaining.iter().find(|s| sensor::is_presence_sensor(s.as_ref()))
                {
                    roles.presence_sensor = Some(s.clone());
                    became_presence = Some(s.clone());
                } else if let Some((s, bit)) = remaining
                    .iter()
                    .find_map(|s| sensor::presence_bit_for(s.as_ref()).map(|b| (s.clone(), b)))
                {
                    roles.presence_bit_sensor = Some((s.clone(), bit));
                    became_bit = Some((s, bit));
                }
            }
        }
        if let Some(s) = became_presence {
            hotswap::ensure_builtin(self);
            enable_role_events(&s, EventMask::for_offset(0).merged(EventMask::for_offset(1)))
                .await;
        } else if let Some((s, bit)) = became_bit {
            hotswap::ensure_builtin(self);
            enable_role_events(&s, EventMask::for_offset(bit)).await;
        }
    }
}

async fn enable_role_events(sensor: &Arc<dyn Sensor>, mask: EventMask) {
    match sensor.event_support() {
        EventSupport::GlobalEnable | EventSupport::None => {}
        EventSupport::PerState | EventSupport::EntireSensor => {
            if let Err(e) = sensor.enable_events(mask).await {
                debug!(sensor = sensor.id(), error = %e, "failed to enable sensor events");
            }
        }
    }
}
