//! Directory reconciliation
//!
//! One reconciliation merges a freshly decoded directory scan against the
//! previous scan for the same controller. Both sides are sorted and
//! merge-joined, so only records that actually changed touch the registry.
//! Resolution (creating entities, expanding association ranges) happens
//! first and mutates nothing but the entity set; the graph diff then
//! commits under the structural lock in one infallible pass, so no
//! concurrent `find`/`iterate` caller ever observes a half-applied scan.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use backplane_records::{DirRecord, EntityKey, RecordKind};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::event::UpdateKind;
use crate::presence;
use crate::registry::{link_child_edge, unlink_child_edge, EntityRef, EntityRegistry};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ScanEntry {
    record: DirRecord,
    /// Child keys an association record resolved to, ranges expanded.
    children: Vec<EntityKey>,
}

/// The remembered result of the previous successful directory scan for one
/// controller. Keeping it is what makes the next reconciliation
/// incremental.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanState {
    entries: Vec<ScanEntry>,
}

impl ScanState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// What one reconciliation did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Records in the new scan.
    pub total: usize,
    /// Records unchanged since the previous scan.
    pub unchanged: usize,
    /// New records applied.
    pub added: usize,
    /// Old records undone.
    pub removed: usize,
}

struct Resolved {
    ent: EntityRef,
    children: Vec<EntityRef>,
}

impl EntityRegistry {
    /// Merge a decoded directory scan against `state`, committing entity
    /// and association changes and replacing the remembered scan.
    pub async fn reconcile_directory(
        &self,
        state: &mut ScanState,
        mut records: Vec<DirRecord>,
    ) -> ScanReport {
        records.sort();

        let mut new_matched = vec![false; records.len()];
        let mut old_matched = vec![false; state.entries.len()];
        let (mut i, mut j) = (0, 0);
        while i < records.len() && j < state.entries.len() {
            match records[i].cmp(&state.entries[j].record) {
                Ordering::Equal => {
                    new_matched[i] = true;
                    old_matched[j] = true;
                    i += 1;
                    j += 1;
                }
                Ordering::Less => i += 1,
                Ordering::Greater => j += 1,
            }
        }

        // Resolve every entity the diff touches, creating missing ones and
        // expanding association ranges. No graph mutation happens here.
        let mut new_resolved: Vec<Option<Resolved>> = Vec::with_capacity(records.len());
        for (idx, rec) in records.iter().enumerate() {
            // A null entity id marks a record to ignore.
            if new_matched[idx] || rec.entity_id == 0 {
                new_resolved.push(None);
                continue;
            }
            let ent = self.add(rec.key());
            let children = if rec.is_association() {
                rec.contained_keys().into_iter().map(|k| self.add(k)).collect()
            } else {
                Vec::new()
            };
            new_resolved.push(Some(Resolved { ent, children }));
        }
        let mut old_resolved: Vec<Option<Resolved>> = Vec::with_capacity(state.entries.len());
        for (idx, entry) in state.entries.iter().enumerate() {
            if old_matched[idx] || entry.record.entity_id == 0 {
                old_resolved.push(None);
                continue;
            }
            // Entities from the previous scan may already be gone.
            let Ok(ent) = self.find(entry.record.key()) else {
                old_resolved.push(None);
                continue;
            };
            let children =
                entry.children.iter().filter_map(|k| self.find(*k).ok()).collect();
            old_resolved.push(Some(Resolved { ent, children }));
        }

        // Commit the whole diff under the structural lock in one pass.
        {
            let mut st = self.shared.structural.lock().unwrap();
            for (idx, entry) in state.entries.iter().enumerate() {
                let Some(res) = &old_resolved[idx] else { continue };
                if entry.record.is_association() {
                    for child in &res.children {
                        unlink_child_edge(&mut st, res.ent.key(), child.key());
                    }
                } else if let Some(node) = st.entities.get_mut(&res.ent.key()) {
                    node.links.ref_count = node.links.ref_count.saturating_sub(1);
                }
            }
            for (idx, rec) in records.iter().enumerate() {
                let Some(res) = &new_resolved[idx] else { continue };
                if rec.is_association() {
                    for child in &res.children {
                        link_child_edge(&mut st, res.ent.key(), child.key());
                    }
                } else if let Some(node) = st.entities.get_mut(&res.ent.key()) {
                    node.links.ref_count += 1;
                }
            }
        }

        // Payload updates and monitor registration, after the lock.
        for (idx, entry) in state.entries.iter().enumerate() {
            let Some(res) = &old_resolved[idx] else { continue };
            if entry.record.is_association() {
                res.ent.entity().presence.lock().unwrap().possibly_changed = true;
            } else {
                // The locator is gone; clear the payload, keeping identity.
                let key = res.ent.key();
                let mut record = res.ent.entity().record.lock().unwrap();
                *record = DirRecord {
                    entity_id: key.entity_id,
                    entity_instance: key.entity_instance,
                    device_num: key.device_num,
                    ..Default::default()
                };
            }
        }
        for (idx, rec) in records.iter().enumerate() {
            let Some(res) = &new_resolved[idx] else { continue };
            if rec.is_association() {
                res.ent.entity().presence.lock().unwrap().possibly_changed = true;
            } else {
                self.apply_locator_payload(&res.ent, rec);
            }
        }

        // Changed notifications for every entity an unmatched record
        // touched, children included, each at most once.
        let mut notified = BTreeSet::new();
        for res in new_resolved.iter().chain(old_resolved.iter()).flatten() {
            if notified.insert(res.ent.key()) {
                self.shared.fire_update(UpdateKind::Changed, res.ent.entity());
            }
            for child in &res.children {
                if notified.insert(child.key()) {
                    self.shared.fire_update(UpdateKind::Changed, child.entity());
                }
            }
        }

        let report = ScanReport {
            total: records.len(),
            unchanged: new_matched.iter().filter(|m| **m).count(),
            added: new_resolved.iter().flatten().count(),
            removed: old_resolved.iter().flatten().count(),
        };
        info!(
            total = report.total,
            unchanged = report.unchanged,
            added = report.added,
            removed = report.removed,
            "directory reconciled"
        );

        state.entries = records
            .into_iter()
            .map(|record| {
                let children =
                    if record.is_association() { record.contained_keys() } else { Vec::new() };
                ScanEntry { record, children }
            })
            .collect();

        // Dropping the resolved pins runs deferred destruction for any
        // entity whose last contribution this scan removed.
        report
    }

    fn apply_locator_payload(&self, ent: &EntityRef, rec: &DirRecord) {
        // A controller that is not a FRU inventory device never overwrites
        // a FRU-bearing payload for the same key; it triggers a controller
        // scan instead, since the record still proves a controller is there.
        let mut scan_instead = false;
        {
            let mut record = ent.entity().record.lock().unwrap();
            if rec.kind == RecordKind::Mc && !rec.mc.fru_inventory_device {
                if !record.mc.fru_inventory_device {
                    *record = rec.clone();
                }
                scan_instead = true;
            } else {
                *record = rec.clone();
            }
        }
        let resolver = self.shared.mc_resolver.lock().unwrap().clone();
        if scan_instead {
            if let Some(resolver) = &resolver {
                if let Some(mc) = resolver.resolve(rec.channel, rec.slave_address) {
                    tokio::spawn(async move {
                        if let Err(e) = mc.start_scan().await {
                            warn!(error = %e, "controller scan request failed");
                        }
                    });
                }
            }
        }
        // When the record puts the entity's FRU device behind a specific
        // controller, watch that controller's liveness for presence.
        if matches!(rec.kind, RecordKind::Fru | RecordKind::Mc) && rec.entity_id != 0 {
            let address = if rec.kind == RecordKind::Mc {
                rec.slave_address
            } else {
                rec.access_address
            };
            if address != 0 {
                if let Some(resolver) = &resolver {
                    match resolver.resolve(rec.channel, address) {
                        Some(mc) => presence::install_frudev_monitor(ent, mc),
                        None => warn!(
                            entity = %ent.name(),
                            channel = rec.channel,
                            address,
                            "no controller available for FRU-device monitor"
                        ),
                    }
                }
            }
        }
        ent.entity().presence.lock().unwrap().possibly_changed = true;
    }

    /// Undo everything a remembered scan contributed, as when its
    /// controller disappears: every record is treated as unmatched-old.
    /// Entities that are already gone are tolerated.
    pub fn retire_scan(&self, state: ScanState) {
        let mut touched: Vec<EntityRef> = Vec::new();
        for entry in &state.entries {
            let Ok(ent) = self.find(entry.record.key()) else {
                continue;
            };
            if entry.record.is_association() {
                let children: Vec<EntityRef> =
                    entry.children.iter().filter_map(|k| self.find(*k).ok()).collect();
                {
                    let mut st = self.shared.structural.lock().unwrap();
                    for child in &children {
                        unlink_child_edge(&mut st, ent.key(), child.key());
                    }
                }
                ent.entity().presence.lock().unwrap().possibly_changed = true;
                touched.extend(children);
            } else {
                presence::remove_frudev_monitor(&ent);
                let mut st = self.shared.structural.lock().unwrap();
                if let Some(node) = st.entities.get_mut(&ent.key()) {
                    node.links.ref_count = node.links.ref_count.saturating_sub(1);
                }
            }
            touched.push(ent);
        }
        let mut notified = BTreeSet::new();
        for ent in &touched {
            if notified.insert(ent.key()) {
                self.shared.fire_update(UpdateKind::Changed, ent.entity());
            }
        }
    }
}
