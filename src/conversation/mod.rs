//! Conversation state threaded through each turn.
//!
//! The state is an opaque JSON document owned by the turn controller. Each turn
//! sends the full prior state to the generation service and replaces it with
//! whatever comes back. The only client-side logic is the non-blank field merge
//! used by personas that collect structured fields (lead forms and the like),
//! which keeps the model from erasing values it already gathered.

pub mod persona;
pub mod records;

pub use persona::{builtin_personas, find_persona, MergePolicy, Persona, ReplyFormat};
pub use records::{InteractionRecord, RecordError, RecordStore};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Placeholder models emit for a field they could not fill.
pub const UNKNOWN_SENTINEL: &str = "unknown";

/// Domain state carried across turns (lead record, cart, game state, vitals).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationState(Value);

impl ConversationState {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// An empty object, the starting point for most personas.
    pub fn empty() -> Self {
        Self(Value::Object(Map::new()))
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    pub fn as_object(&self) -> Option<&Map<String, Value>> {
        self.0.as_object()
    }

    pub fn is_null(&self) -> bool {
        self.0.is_null()
    }

    /// Field-level merge: a proposed field overwrites the prior one only when it
    /// carries a real value (see [`is_filled`]). Fields the proposal omits are
    /// kept. Each field is decided independently, so the result does not depend
    /// on iteration order.
    pub fn merge_non_blank(&self, proposed: &ConversationState) -> ConversationState {
        let Some(update) = proposed.as_object() else {
            // Nothing field-shaped to merge; only accept a filled scalar.
            return if is_filled(&proposed.0) {
                proposed.clone()
            } else {
                self.clone()
            };
        };

        let mut merged = self.as_object().cloned().unwrap_or_default();
        for (key, value) in update {
            if is_filled(value) {
                merged.insert(key.clone(), value.clone());
            }
        }
        ConversationState(Value::Object(merged))
    }

    /// Apply a model-proposed state according to the persona's merge policy.
    pub fn apply(&self, proposed: ConversationState, policy: MergePolicy) -> ConversationState {
        match policy {
            MergePolicy::Replace => proposed,
            MergePolicy::NonBlankFields => self.merge_non_blank(&proposed),
        }
    }
}

impl From<Value> for ConversationState {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

/// A value counts as filled when it is not null, not a blank string and not the
/// `"unknown"` sentinel. Numbers, booleans, arrays and objects always count.
pub fn is_filled(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => {
            let trimmed = s.trim();
            !trimmed.is_empty() && trimmed != UNKNOWN_SENTINEL
        }
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state(v: Value) -> ConversationState {
        ConversationState::new(v)
    }

    #[test]
    fn merge_prefers_filled_proposals_and_keeps_prior_otherwise() {
        let prior = state(json!({ "name": "", "role": "CTO" }));
        let proposed = state(json!({ "name": "Alex", "role": "unknown" }));

        let merged = prior.merge_non_blank(&proposed);
        assert_eq!(merged, state(json!({ "name": "Alex", "role": "CTO" })));
    }

    #[test]
    fn merge_ignores_blank_whitespace_and_null_values() {
        let prior = state(json!({ "company": "Acme", "timeline": "Q3", "team_size": "12" }));
        let proposed = state(json!({ "company": "   ", "timeline": null, "team_size": "" }));

        assert_eq!(prior.merge_non_blank(&proposed), prior);
    }

    #[test]
    fn merge_keeps_fields_missing_from_the_proposal() {
        let prior = state(json!({ "name": "Sam", "use_case": "API testing" }));
        let proposed = state(json!({ "timeline": "next month" }));

        let merged = prior.merge_non_blank(&proposed);
        assert_eq!(
            merged,
            state(json!({ "name": "Sam", "use_case": "API testing", "timeline": "next month" }))
        );
    }

    #[test]
    fn merge_is_independent_of_field_order() {
        let prior = state(json!({ "a": "1", "b": "2", "c": "3" }));
        let forward = state(json!({ "a": "x", "b": "", "c": "z" }));
        let reversed = state(json!({ "c": "z", "b": "", "a": "x" }));

        assert_eq!(prior.merge_non_blank(&forward), prior.merge_non_blank(&reversed));
    }

    #[test]
    fn merge_accepts_non_string_values() {
        let prior = state(json!({ "hp": 100, "inventory": ["Sword"] }));
        let proposed = state(json!({ "hp": 80, "inventory": [] }));

        assert_eq!(
            prior.merge_non_blank(&proposed),
            state(json!({ "hp": 80, "inventory": [] }))
        );
    }

    #[test]
    fn merge_onto_null_prior_starts_from_empty_object() {
        let prior = ConversationState::default();
        let proposed = state(json!({ "drinkType": "Latte", "size": "unknown" }));

        assert_eq!(
            prior.merge_non_blank(&proposed),
            state(json!({ "drinkType": "Latte" }))
        );
    }

    #[test]
    fn echoed_state_round_trips_unchanged() {
        let prior = state(json!({
            "player": { "hp": 90, "gold": 12 },
            "location": { "name": "Crypt" },
            "game_log": ["You wake up."]
        }));

        assert_eq!(prior.merge_non_blank(&prior.clone()), prior);
        assert_eq!(prior.apply(prior.clone(), MergePolicy::Replace), prior);
    }

    #[test]
    fn replace_policy_takes_the_proposal_wholesale() {
        let prior = state(json!({ "cart": ["milk"] }));
        let proposed = state(json!({ "cart": [] }));

        assert_eq!(prior.apply(proposed.clone(), MergePolicy::Replace), proposed);
    }

    #[test]
    fn unknown_sentinel_is_trimmed_before_comparison() {
        assert!(!is_filled(&json!(" unknown ")));
        assert!(is_filled(&json!("Unknown Soldier")));
        assert!(is_filled(&json!(false)));
    }
}
