//! Optimistic state overlay.
//!
//! Enqueued mutations become locally visible before server confirmation by
//! layering each action's merge patch over the last server-confirmed
//! snapshot of its entity. The base snapshot is only ever written from
//! authoritative server responses, so a rollback is simply "drop the patch":
//! the view falls back to confirmed state. On confirmation the server body
//! wins over the optimistic guess (server-computed totals, concurrent edits
//! by other clients).

use std::collections::HashMap;

use serde_json::{Map, Value};

use fablink_core::ActionId;

use crate::action::{EntityKey, PendingAction};

#[derive(Debug, Clone)]
struct OverlayPatch {
    action_id: ActionId,
    entity: EntityKey,
    patch: Value,
}

/// Read-model overlay applying pending mutations ahead of confirmation.
#[derive(Debug, Default)]
pub struct OptimisticOverlay {
    enabled: bool,
    base: HashMap<EntityKey, Value>,
    patches: Vec<OverlayPatch>,
}

impl OptimisticOverlay {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            base: HashMap::new(),
            patches: Vec::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Prime the server-confirmed snapshot for an entity (e.g. from a fetch).
    pub fn seed(&mut self, entity: EntityKey, body: Value) {
        self.base.insert(entity, body);
    }

    /// Apply an action's optimistic effect. A second apply for the same
    /// action (signature dedup) replaces its previous patch in place; a
    /// replacement without a patch drops the stale one.
    pub fn apply(&mut self, action: &PendingAction) {
        if !self.enabled {
            return;
        }
        let Some(patch) = action.optimistic.clone() else {
            self.patches.retain(|p| p.action_id != action.id);
            return;
        };

        if let Some(existing) = self
            .patches
            .iter_mut()
            .find(|p| p.action_id == action.id)
        {
            existing.patch = patch;
        } else {
            self.patches.push(OverlayPatch {
                action_id: action.id,
                entity: action.entity.clone(),
                patch,
            });
        }
    }

    /// Reconcile with the authoritative server response after a confirmed
    /// success. The server body, when present, replaces the base snapshot.
    pub fn confirm(&mut self, action_id: ActionId, entity: &EntityKey, server_body: Option<Value>) {
        self.patches.retain(|p| p.action_id != action_id);
        if let Some(body) = server_body {
            self.base.insert(entity.clone(), body);
        }
    }

    /// Drop an action's effect, reverting its entity to the last confirmed
    /// state. Returns whether a patch was actually removed.
    pub fn rollback(&mut self, action_id: ActionId) -> bool {
        let before = self.patches.len();
        self.patches.retain(|p| p.action_id != action_id);
        self.patches.len() != before
    }

    /// Drop every pending effect (discard-offline-changes path). Confirmed
    /// base snapshots are kept.
    pub fn clear_pending(&mut self) {
        self.patches.clear();
    }

    /// Current view of an entity: confirmed base plus pending patches in
    /// enqueue order.
    pub fn view(&self, entity: &EntityKey) -> Option<Value> {
        let mut doc = self.base.get(entity).cloned();
        for entry in self.patches.iter().filter(|p| &p.entity == entity) {
            let target = doc.get_or_insert(Value::Null);
            merge_patch(target, &entry.patch);
        }
        doc
    }
}

/// RFC 7396-style JSON merge patch.
///
/// Objects merge recursively, `null` removes a member, everything else
/// replaces the target wholesale.
pub(crate) fn merge_patch(target: &mut Value, patch: &Value) {
    match patch {
        Value::Object(entries) => {
            if !target.is_object() {
                *target = Value::Object(Map::new());
            }
            if let Some(map) = target.as_object_mut() {
                for (key, value) in entries {
                    if value.is_null() {
                        map.remove(key);
                    } else {
                        merge_patch(map.entry(key.clone()).or_insert(Value::Null), value);
                    }
                }
            }
        }
        _ => *target = patch.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionKind;
    use serde_json::json;

    fn order_action(patch: Value) -> PendingAction {
        PendingAction::new(
            ActionKind::UpdateOrder,
            EntityKey::custom("order", "5"),
            json!({}),
        )
        .with_optimistic(patch)
    }

    #[test]
    fn merge_patch_follows_rfc_semantics() {
        let mut doc = json!({"title": "old", "qty": 2, "meta": {"a": 1, "b": 2}});
        merge_patch(
            &mut doc,
            &json!({"title": "new", "qty": null, "meta": {"b": 3}}),
        );
        assert_eq!(doc, json!({"title": "new", "meta": {"a": 1, "b": 3}}));
    }

    #[test]
    fn view_layers_patches_over_base_in_order() {
        let mut overlay = OptimisticOverlay::new(true);
        let entity = EntityKey::custom("order", "5");
        overlay.seed(entity.clone(), json!({"title": "X", "status": "draft"}));

        let a1 = order_action(json!({"title": "Y"}));
        let a2 = order_action(json!({"status": "submitted"}));
        overlay.apply(&a1);
        overlay.apply(&a2);

        assert_eq!(
            overlay.view(&entity),
            Some(json!({"title": "Y", "status": "submitted"}))
        );
    }

    #[test]
    fn rollback_reverts_to_confirmed_state() {
        let mut overlay = OptimisticOverlay::new(true);
        let entity = EntityKey::custom("order", "5");
        overlay.seed(entity.clone(), json!({"status": "draft"}));

        let action = order_action(json!({"status": "accepted"}));
        overlay.apply(&action);
        assert_eq!(overlay.view(&entity), Some(json!({"status": "accepted"})));

        assert!(overlay.rollback(action.id));
        assert_eq!(overlay.view(&entity), Some(json!({"status": "draft"})));
        assert!(!overlay.rollback(action.id));
    }

    #[test]
    fn server_body_wins_on_confirm() {
        let mut overlay = OptimisticOverlay::new(true);
        let entity = EntityKey::custom("order", "5");
        overlay.seed(entity.clone(), json!({"total": 100}));

        // Optimistic guess says 110, the server computed 115.
        let action = order_action(json!({"total": 110}));
        overlay.apply(&action);
        overlay.confirm(action.id, &entity, Some(json!({"total": 115})));

        assert_eq!(overlay.view(&entity), Some(json!({"total": 115})));
    }

    #[test]
    fn view_without_base_builds_from_patches() {
        let mut overlay = OptimisticOverlay::new(true);
        let action = order_action(json!({"status": "accepted"}));
        overlay.apply(&action);

        assert_eq!(
            overlay.view(&EntityKey::custom("order", "5")),
            Some(json!({"status": "accepted"}))
        );
        assert_eq!(overlay.view(&EntityKey::custom("order", "6")), None);
    }

    #[test]
    fn disabled_overlay_is_inert() {
        let mut overlay = OptimisticOverlay::new(false);
        let action = order_action(json!({"status": "accepted"}));
        overlay.apply(&action);
        assert_eq!(overlay.view(&EntityKey::custom("order", "5")), None);
    }

    #[test]
    fn reapply_for_same_action_replaces_the_patch() {
        let mut overlay = OptimisticOverlay::new(true);
        let entity = EntityKey::custom("order", "5");

        let mut action = order_action(json!({"title": "draft one"}));
        overlay.apply(&action);
        action.optimistic = Some(json!({"title": "draft two"}));
        overlay.apply(&action);

        assert_eq!(overlay.view(&entity), Some(json!({"title": "draft two"})));
    }
}
