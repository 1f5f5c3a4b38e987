//! Presence detection and the upward presence cascade
//!
//! Presence is derived from the best available signal, in strict priority
//! order: a dedicated presence sensor, a presence-bit sensor, the liveness
//! of the controller hosting the entity's FRU device, any attached sensor
//! reporting itself scanning, and finally the aggregated presence of the
//! entity's children. A presence change re-evaluates every parent that has
//! no sensors of its own, guarded against stale "absent" results racing a
//! newer "present" signal.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::EntityError;
use crate::event::{EventDisposition, PlatformEvent, UpdateKind};
use crate::fru::FruAddress;
use crate::hotswap;
use crate::mc::ManagementController;
use crate::registry::{EntityRef, EntityRegistry};

impl EntityRegistry {
    /// Re-evaluate presence for every entity whose presence may have
    /// changed (or all of them, with `force`).
    pub async fn detect_presence_changes(&self, force: bool) {
        let mut ents = Vec::new();
        self.iterate(|ent| ents.push(ent.clone()));
        for ent in ents {
            ent.detect_presence(force).await;
        }
    }
}

impl EntityRef {
    /// Recompute this entity's presence on demand. A no-op unless `force`
    /// or something marked the presence possibly changed.
    pub async fn detect_presence(&self, force: bool) {
        {
            let mut p = self.entity().presence.lock().unwrap();
            if !force && !p.possibly_changed {
                return;
            }
            p.possibly_changed = false;
        }
        if self.hot_swappable() && self.present() {
            if let Err(e) = self.check_hot_swap_state().await {
                debug!(entity = %self.name(), error = %e, "hot-swap state check failed");
            }
        }

        let (presence_sensor, bit_sensor) = {
            let roles = self.entity().roles.lock().unwrap();
            (roles.presence_sensor.clone(), roles.presence_bit_sensor.clone())
        };

        // A presence sensor overrides everything.
        if let Some(sensor) = presence_sensor {
            match sensor.read_states().await {
                Ok(states) => {
                    let present = if sensor.state_readable(0) {
                        states.is_set(0)
                    } else {
                        // No present bit; fall back to the absent bit.
                        !states.is_set(1)
                    };
                    presence_changed(self, present, None).await;
                }
                Err(e) => debug!(
                    entity = %self.name(),
                    sensor = sensor.id(),
                    error = %e,
                    "presence sensor read failed"
                ),
            }
            return;
        }

        // A presence-bit sensor overrides everything but a presence sensor.
        if let Some((sensor, bit)) = bit_sensor {
            match sensor.read_states().await {
                Ok(states) => presence_changed(self, states.is_set(bit), None).await,
                Err(e) => debug!(
                    entity = %self.name(),
                    sensor = sensor.id(),
                    error = %e,
                    "presence-bit sensor read failed"
                ),
            }
            return;
        }

        // An active FRU-device monitor is the cheapest remaining signal.
        let frudev_active = {
            let p = self.entity().presence.lock().unwrap();
            p.frudev_mc.is_some() && p.frudev_active
        };
        if frudev_active {
            presence_changed(self, true, None).await;
            return;
        }

        // Ask every attached sensor in parallel; any one reporting itself
        // scanning means the entity is there.
        let sensors = self.sensors();
        if !sensors.is_empty() {
            let started_at = self.presence_event_count();
            let mut queries = JoinSet::new();
            for sensor in sensors {
                queries.spawn(async move { sensor.read_states().await });
            }
            let mut any_answered = false;
            let mut present = false;
            while let Some(res) = queries.join_next().await {
                if let Ok(Ok(states)) = res {
                    any_answered = true;
                    if states.scanning_enabled {
                        present = true;
                    }
                }
            }
            if present {
                presence_changed(self, true, None).await;
            } else {
                // No sensor answered "present"; the children are the last
                // resort. Guard against a presence signal that landed while
                // the queries were outstanding.
                let guard = any_answered.then_some(started_at);
                evaluate_from_children(self, guard).await;
            }
            return;
        }

        // No usable local signal at all.
        evaluate_from_children(self, None).await;
    }
}

/// Rule (e): an entity with no signal of its own is present exactly when
/// any child is. A stale "absent" recomputation never overwrites a newer
/// "present" signal: if the event count moved since `started_at`, the
/// update is suppressed. The asymmetry is intentional: a false negative is
/// possible, a false positive from stale data is not.
pub(crate) async fn evaluate_from_children(ent: &EntityRef, started_at: Option<u32>) {
    let present = ent.children().iter().any(|child| child.present());
    if !present {
        if let Some(start) = started_at {
            if ent.presence_event_count() != start {
                return;
            }
        }
    }
    presence_changed(ent, present, None).await;
}

/// Record a presence observation. Always counts as a re-evaluation; when
/// the value actually changed this routes through the built-in hot-swap
/// machine, maintains FRU data, runs the presence handler chain, and
/// cascades to sensorless parents.
pub(crate) fn presence_changed<'a>(
    ent: &'a EntityRef,
    present: bool,
    event: Option<PlatformEvent>,
) -> Pin<Box<dyn Future<Output = ()> + Send + 'a>> {
    Box::pin(async move {
        ent.entity().presence_event_count.fetch_add(1, Ordering::AcqRel);
        let changed = {
            let mut p = ent.entity().presence.lock().unwrap();
            if p.present != present {
                p.present = present;
                true
            } else {
                false
            }
        };
        let mut event = event;
        let mut handled = EventDisposition::NotHandled;
        if changed {
            info!(entity = %ent.name(), present, "presence changed");

            if hotswap::uses_builtin(ent)
                && hotswap::handle_presence(ent, present, event.as_ref()).await
                    == EventDisposition::Handled
            {
                handled = EventDisposition::Handled;
                event = None;
            }

            // Becoming present fetches FRU data; becoming absent discards it.
            if ent.is_fru_bearing() {
                if present {
                    start_fru_fetch(ent);
                } else if ent.entity().fru.lock().unwrap().take().is_some() {
                    for h in ent.entity().handlers.fru.snapshot() {
                        h(ent.entity(), UpdateKind::Deleted);
                    }
                }
            }

            for h in ent.entity().handlers.presence.snapshot() {
                if h(ent.entity(), present, event.as_ref()) == EventDisposition::Handled {
                    handled = EventDisposition::Handled;
                    event = None;
                }
            }

            // Our presence can affect parents, unless they have sensors of
            // their own.
            for parent in ent.parents() {
                if !parent.sensors().is_empty() {
                    continue;
                }
                let started_at = parent.presence_event_count();
                evaluate_from_children(&parent, Some(started_at)).await;
            }
        }

        if handled == EventDisposition::NotHandled {
            if let Some(ev) = event {
                ent.shared.forward_unhandled(ev);
            }
        }
    })
}

/// Kick off an asynchronous FRU fetch through the entity's op queue.
pub(crate) fn start_fru_fetch(ent: &EntityRef) {
    let source = ent.shared.fru_source.lock().unwrap().clone();
    let Some(source) = source else {
        return;
    };
    let addr = FruAddress::from_record(&ent.record());
    let task_ent = ent.clone();
    let handle = tokio::spawn(async move {
        let result = task_ent
            .entity()
            .opq
            .run(async { source.fetch(&addr).await.map_err(EntityError::Collaborator) })
            .await;
        match result {
            Ok(data) => {
                let kind = {
                    let mut fru = task_ent.entity().fru.lock().unwrap();
                    if fru.replace(Arc::new(data)).is_some() {
                        UpdateKind::Changed
                    } else {
                        UpdateKind::Added
                    }
                };
                debug!(entity = %task_ent.name(), "FRU data fetched");
                for h in task_ent.entity().handlers.fru.snapshot() {
                    h(task_ent.entity(), kind);
                }
            }
            Err(EntityError::Canceled) => {}
            Err(e) => warn!(entity = %task_ent.name(), error = %e, "FRU fetch failed"),
        }
    });
    ent.track_task(handle);
}

/// Watch the liveness of the controller hosting this entity's FRU device
/// and feed transitions into presence detection. Only installed once; a
/// second record naming a different controller keeps the first.
pub(crate) fn install_frudev_monitor(ent: &EntityRef, mc: Arc<dyn ManagementController>) {
    {
        let mut p = ent.entity().presence.lock().unwrap();
        if let Some(existing) = &p.frudev_mc {
            if existing.address() != mc.address() {
                warn!(
                    entity = %ent.name(),
                    "entity named by two different controllers, keeping the first for presence"
                );
            }
            return;
        }
        p.frudev_mc = Some(mc.clone());
        p.frudev_active = mc.is_active();
    }
    // The watcher resolves the entity by handle on every transition rather
    // than pinning it, so it never keeps the entity alive by itself.
    let mut rx = mc.active_watch();
    let shared = Arc::downgrade(&ent.shared);
    let handle = ent.handle();
    let task = tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let active = *rx.borrow();
            let Some(shared) = shared.upgrade() else {
                break;
            };
            let reg = EntityRegistry { shared };
            let Ok(ent) = reg.resolve(&handle) else {
                break;
            };
            let moved = {
                let mut p = ent.entity().presence.lock().unwrap();
                if p.frudev_active != active {
                    p.frudev_active = active;
                    true
                } else {
                    false
                }
            };
            if !moved {
                continue;
            }
            // Presence and presence-bit sensors take strict priority over
            // the monitor.
            let overridden = {
                let roles = ent.entity().roles.lock().unwrap();
                roles.presence_sensor.is_some() || roles.presence_bit_sensor.is_some()
            };
            if !overridden {
                ent.detect_presence(true).await;
            }
        }
    });
    ent.track_task(task);
}

/// Drop the FRU-device monitor, if one is installed.
pub(crate) fn remove_frudev_monitor(ent: &EntityRef) {
    let mut p = ent.entity().presence.lock().unwrap();
    p.frudev_mc = None;
    p.frudev_active = false;
}
