//! Entity registry and lifecycle
//!
//! One registry owns all entities for a management domain. A single
//! structural lock guards the entity map and every entity's graph shape:
//! child/parent edges, attached sensors/controls, the structural reference
//! count, and the pin count that drives deferred destruction.
//!
//! Destruction is deferred and race safe: timers, queued operations, and
//! liveness watchers each hold a pin, so an entity is destroyed exactly when
//! the last pin drops while it has no structural references, no graph edges,
//! and no attachments. The destruction check runs under the structural lock
//! and is always the last observable effect of the unpin that triggers it.

use std::collections::{BTreeSet, HashMap};
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use backplane_records::{DeviceText, EntityKey};
use tracing::debug;

use crate::config::DomainConfig;
use crate::control::Control;
use crate::entity::{DomainId, Entity, EntityHandle, UpdateHandler};
use crate::error::EntityError;
use crate::event::{PlatformEvent, UpdateKind};
use crate::fru::FruSource;
use crate::mc::McResolver;
use crate::observer::{HandlerId, HandlerList};
use crate::sensor::Sensor;

pub type UnhandledEventSink = dyn Fn(PlatformEvent) + Send + Sync;

pub(crate) struct Links {
    pub usecount: u32,
    /// Structural references held by non-association directory records.
    pub ref_count: u32,
    pub children: BTreeSet<EntityKey>,
    pub parents: BTreeSet<EntityKey>,
    pub sensors: Vec<Arc<dyn Sensor>>,
    pub controls: Vec<Arc<dyn Control>>,
}

impl Links {
    fn new() -> Self {
        Self {
            usecount: 1,
            ref_count: 0,
            children: BTreeSet::new(),
            parents: BTreeSet::new(),
            sensors: Vec::new(),
            controls: Vec::new(),
        }
    }

    /// The destruction-eligibility predicate: all structural holds gone.
    fn eligible_for_destroy(&self) -> bool {
        self.ref_count == 0
            && self.children.is_empty()
            && self.parents.is_empty()
            && self.sensors.is_empty()
            && self.controls.is_empty()
    }
}

pub(crate) struct EntityNode {
    pub ent: Arc<Entity>,
    pub links: Links,
}

pub(crate) struct Structural {
    pub entities: HashMap<EntityKey, EntityNode>,
}

pub(crate) struct Shared {
    pub domain: DomainId,
    pub config: DomainConfig,
    pub structural: Mutex<Structural>,
    pub update_handlers: HandlerList<UpdateHandler>,
    pub next_seq: AtomicU64,
    pub fru_source: Mutex<Option<Arc<dyn FruSource>>>,
    pub mc_resolver: Mutex<Option<Arc<dyn McResolver>>>,
    pub unhandled_events: Mutex<Option<Arc<UnhandledEventSink>>>,
}

impl Shared {
    pub(crate) fn fire_update(&self, kind: UpdateKind, ent: &Entity) {
        for h in self.update_handlers.snapshot() {
            h(kind, ent);
        }
    }

    pub(crate) fn forward_unhandled(&self, event: PlatformEvent) {
        let sink = self.unhandled_events.lock().unwrap().clone();
        if let Some(sink) = sink {
            sink(event);
        }
    }

    /// Pin an existing entity by key, if it is live.
    pub(crate) fn pin_existing(self: &Arc<Self>, key: EntityKey) -> Option<EntityRef> {
        let mut st = self.structural.lock().unwrap();
        let node = st.entities.get_mut(&key)?;
        node.links.usecount += 1;
        Some(EntityRef { ent: node.ent.clone(), shared: self.clone() })
    }

    /// Drop one pin. When this was the last pin and the eligibility
    /// predicate holds, the entity is removed, `Deleted` is fired, and the
    /// entity is finalized.
    fn unpin(self: &Arc<Self>, ent: &Arc<Entity>) {
        let node = {
            let mut st = self.structural.lock().unwrap();
            let Some(node) = st.entities.get_mut(&ent.key()) else {
                // Already torn down by registry destroy.
                return;
            };
            if node.links.usecount == 1
                && node.links.eligible_for_destroy()
                && ent.opq.pending() == 0
            {
                st.entities.remove(&ent.key())
            } else {
                node.links.usecount -= 1;
                None
            }
        };
        if let Some(node) = node {
            node.ent.destroyed.store(true, Ordering::Release);
            debug!(entity = %node.ent.name(), "destroying entity");
            self.fire_update(UpdateKind::Deleted, &node.ent);
            node.ent.finalize();
        }
    }
}

/// A pinned reference to a live entity. Cloning pins again; dropping the
/// last pin runs the deferred-destruction check.
pub struct EntityRef {
    pub(crate) ent: Arc<Entity>,
    pub(crate) shared: Arc<Shared>,
}

impl EntityRef {
    pub(crate) fn entity(&self) -> &Entity {
        &self.ent
    }

    pub fn registry(&self) -> EntityRegistry {
        EntityRegistry { shared: self.shared.clone() }
    }

    /// Add `child` under this entity. Both sides are already pinned by the
    /// caller; the edge is recorded under the structural lock and `Changed`
    /// fires for both entities afterwards.
    pub fn add_child(&self, child: &EntityRef) {
        {
            let mut st = self.shared.structural.lock().unwrap();
            link_child_edge(&mut st, self.ent.key(), child.ent.key());
        }
        self.ent.presence.lock().unwrap().possibly_changed = true;
        self.shared.fire_update(UpdateKind::Changed, &self.ent);
        self.shared.fire_update(UpdateKind::Changed, &child.ent);
    }

    pub fn remove_child(&self, child: &EntityRef) -> Result<(), EntityError> {
        {
            let mut st = self.shared.structural.lock().unwrap();
            if !unlink_child_edge(&mut st, self.ent.key(), child.ent.key()) {
                return Err(EntityError::NotFound);
            }
        }
        self.ent.presence.lock().unwrap().possibly_changed = true;
        self.shared.fire_update(UpdateKind::Changed, &self.ent);
        self.shared.fire_update(UpdateKind::Changed, &child.ent);
        Ok(())
    }

    /// Pinned references to the current children.
    pub fn children(&self) -> Vec<EntityRef> {
        let keys: Vec<EntityKey> = {
            let st = self.shared.structural.lock().unwrap();
            match st.entities.get(&self.ent.key()) {
                Some(node) => node.links.children.iter().copied().collect(),
                None => Vec::new(),
            }
        };
        keys.into_iter().filter_map(|k| self.shared.pin_existing(k)).collect()
    }

    /// Pinned references to the current parents.
    pub fn parents(&self) -> Vec<EntityRef> {
        let keys: Vec<EntityKey> = {
            let st = self.shared.structural.lock().unwrap();
            match st.entities.get(&self.ent.key()) {
                Some(node) => node.links.parents.iter().copied().collect(),
                None => Vec::new(),
            }
        };
        keys.into_iter().filter_map(|k| self.shared.pin_existing(k)).collect()
    }

    pub fn sensors(&self) -> Vec<Arc<dyn Sensor>> {
        let st = self.shared.structural.lock().unwrap();
        match st.entities.get(&self.ent.key()) {
            Some(node) => node.links.sensors.clone(),
            None => Vec::new(),
        }
    }

    pub fn controls(&self) -> Vec<Arc<dyn Control>> {
        let st = self.shared.structural.lock().unwrap();
        match st.entities.get(&self.ent.key()) {
            Some(node) => node.links.controls.clone(),
            None => Vec::new(),
        }
    }

    /// Structural reference count from non-association directory records.
    pub fn ref_count(&self) -> u32 {
        let st = self.shared.structural.lock().unwrap();
        st.entities.get(&self.ent.key()).map(|n| n.links.ref_count).unwrap_or(0)
    }

    pub(crate) fn push_sensor_link(&self, sensor: &Arc<dyn Sensor>) {
        let mut st = self.shared.structural.lock().unwrap();
        if let Some(node) = st.entities.get_mut(&self.ent.key()) {
            node.links.sensors.push(sensor.clone());
        }
    }

    pub(crate) fn remove_sensor_link(&self, sensor: &Arc<dyn Sensor>) -> bool {
        let mut st = self.shared.structural.lock().unwrap();
        let Some(node) = st.entities.get_mut(&self.ent.key()) else {
            return false;
        };
        let before = node.links.sensors.len();
        node.links.sensors.retain(|s| !Arc::ptr_eq(s, sensor));
        node.links.sensors.len() != before
    }

    pub(crate) fn push_control_link(&self, control: &Arc<dyn Control>) {
        let mut st = self.shared.structural.lock().unwrap();
        if let Some(node) = st.entities.get_mut(&self.ent.key()) {
            node.links.controls.push(control.clone());
        }
    }

    pub(crate) fn remove_control_link(&self, control: &Arc<dyn Control>) -> bool {
        let mut st = self.shared.structural.lock().unwrap();
        let Some(node) = st.entities.get_mut(&self.ent.key()) else {
            return false;
        };
        let before = node.links.controls.len();
        node.links.controls.retain(|c| !Arc::ptr_eq(c, control));
        node.links.controls.len() != before
    }
}

impl Deref for EntityRef {
    type Target = Entity;

    fn deref(&self) -> &Entity {
        &self.ent
    }
}

impl Clone for EntityRef {
    fn clone(&self) -> Self {
        let mut st = self.shared.structural.lock().unwrap();
        if let Some(node) = st.entities.get_mut(&self.ent.key()) {
            node.links.usecount += 1;
        }
        Self { ent: self.ent.clone(), shared: self.shared.clone() }
    }
}

impl Drop for EntityRef {
    fn drop(&mut self) {
        let shared = self.shared.clone();
        shared.unpin(&self.ent);
    }
}

impl std::fmt::Debug for EntityRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EntityRef({})", self.ent.name())
    }
}

pub(crate) fn link_child_edge(st: &mut Structural, parent: EntityKey, child: EntityKey) {
    if let Some(node) = st.entities.get_mut(&parent) {
        node.links.children.insert(child);
    }
    if let Some(node) = st.entities.get_mut(&child) {
        node.links.parents.insert(parent);
    }
}

pub(crate) fn unlink_child_edge(st: &mut Structural, parent: EntityKey, child: EntityKey) -> bool {
    let removed = match st.entities.get_mut(&parent) {
        Some(node) => node.links.children.remove(&child),
        None => false,
    };
    if let Some(node) = st.entities.get_mut(&child) {
        node.links.parents.remove(&parent);
    }
    removed
}

/// Registry of all entities in one management domain.
#[derive(Clone)]
pub struct EntityRegistry {
    pub(crate) shared: Arc<Shared>,
}

impl EntityRegistry {
    pub fn new(config: DomainConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                domain: DomainId::new(),
                config,
                structural: Mutex::new(Structural { entities: HashMap::new() }),
                update_handlers: HandlerList::new(),
                next_seq: AtomicU64::new(1),
                fru_source: Mutex::new(None),
                mc_resolver: Mutex::new(None),
                unhandled_events: Mutex::new(None),
            }),
        }
    }

    pub fn domain(&self) -> DomainId {
        self.shared.domain
    }

    pub fn config(&self) -> &DomainConfig {
        &self.shared.config
    }

    pub fn set_fru_source(&self, source: Arc<dyn FruSource>) {
        *self.shared.fru_source.lock().unwrap() = Some(source);
    }

    pub fn set_mc_resolver(&self, resolver: Arc<dyn McResolver>) {
        *self.shared.mc_resolver.lock().unwrap() = Some(resolver);
    }

    /// Install the sink that receives events no handler claimed.
    pub fn set_unhandled_event_sink(&self, sink: Arc<UnhandledEventSink>) {
        *self.shared.unhandled_events.lock().unwrap() = Some(sink);
    }

    pub fn len(&self) -> usize {
        self.shared.structural.lock().unwrap().entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up a live entity by key, pinning it on success.
    pub fn find(&self, key: EntityKey) -> Result<EntityRef, EntityError> {
        self.shared.pin_existing(key).ok_or(EntityError::NotFound)
    }

    /// Resolve a handle back to its live entity, checking the sequence
    /// number to detect handles to a destroyed-and-recreated entity.
    pub fn resolve(&self, handle: &EntityHandle) -> Result<EntityRef, EntityError> {
        if handle.domain != self.shared.domain {
            return Err(EntityError::NotFound);
        }
        let ent = self.find(handle.key)?;
        if ent.seq() != handle.seq {
            return Err(EntityError::StaleHandle);
        }
        Ok(ent)
    }

    /// Find or create the entity for `key`. Creation assigns the next
    /// sequence number, fires `Added` to update handlers, and returns the
    /// new entity pinned.
    pub fn add(&self, key: EntityKey) -> EntityRef {
        let (ent, created) = {
            let mut st = self.shared.structural.lock().unwrap();
            if let Some(node) = st.entities.get_mut(&key) {
                node.links.usecount += 1;
                (node.ent.clone(), false)
            } else {
                let seq = self.shared.next_seq.fetch_add(1, Ordering::Relaxed);
                let ent = Arc::new(Entity::new(
                    self.shared.domain,
                    &self.shared.config.name,
                    key,
                    seq,
                    self.shared.config.hot_swap.auto_activate(),
                    self.shared.config.hot_swap.auto_deactivate(),
                ));
                st.entities.insert(key, EntityNode { ent: ent.clone(), links: Links::new() });
                (ent, true)
            }
        };
        if created {
            debug!(entity = %ent.name(), "entity added");
            self.shared.fire_update(UpdateKind::Added, &ent);
        }
        EntityRef { ent, shared: self.shared.clone() }
    }

    /// Find or create, also seeding the textual id when the payload has
    /// none yet.
    pub fn add_named(&self, key: EntityKey, id: DeviceText) -> EntityRef {
        let ent = self.add(key);
        ent.set_id_if_empty(id);
        ent
    }

    /// Walk the live entities, pinning each around the callback. The
    /// structural lock is released during the callback, so it may mutate
    /// the graph freely; entities removed mid-walk are skipped and entities
    /// added mid-walk may or may not be visited.
    pub fn iterate(&self, mut f: impl FnMut(&EntityRef)) {
        let mut keys: Vec<EntityKey> = {
            let st = self.shared.structural.lock().unwrap();
            st.entities.keys().copied().collect()
        };
        keys.sort();
        for key in keys {
            if let Some(ent) = self.shared.pin_existing(key) {
                f(&ent);
            }
        }
    }

    pub fn add_update_handler(&self, handler: Arc<UpdateHandler>) -> HandlerId {
        self.shared.update_handlers.add(handler)
    }

    pub fn remove_update_handler(&self, id: HandlerId) -> bool {
        self.shared.update_handlers.remove(id)
    }

    /// Unconditional teardown of every entity, outstanding references or
    /// not. Used only at domain teardown; no `Deleted` notifications fire.
    pub fn destroy(&self) {
        self.shared.update_handlers.clear();
        let nodes: Vec<EntityNode> = {
            let mut st = self.shared.structural.lock().unwrap();
            st.entities.drain().map(|(_, node)| node).collect()
        };
        for node in nodes {
            node.ent.destroyed.store(true, Ordering::Release);
            node.ent.finalize();
        }
    }
}
