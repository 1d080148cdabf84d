//! Personas: the per-demo configuration of the generation leg.
//!
//! A persona is everything that differed between the day-by-day demos: the
//! prompt template, which JSON keys carry speech, state and the completion
//! flag, how state updates are applied, the fallback line used when the model
//! output cannot be parsed, the voice, and where completed conversations are
//! recorded. The turn controller itself never looks inside any of it.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// How the model formats its reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ReplyFormat {
    /// The whole completion is the spoken reply; no state is exchanged.
    Text,
    /// The completion is a JSON object with speech, state and completion keys.
    #[default]
    Json,
}

/// How a model-proposed state is folded into the retained state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// The proposal is the new state.
    #[default]
    Replace,
    /// Only filled fields of the proposal overwrite the prior state.
    NonBlankFields,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Persona {
    /// Short identifier used on the command line and in settings.
    pub name: String,
    pub title: String,
    /// Line shown when a session starts.
    pub greeting: Option<String>,
    /// Prompt template. `{text}`, `{state}` and `{knowledge}` are substituted.
    pub prompt: String,
    pub reply_format: ReplyFormat,
    /// Key of the spoken reply in the model JSON.
    pub speech_key: String,
    /// Key the client uses for the prior state in `/api/generate` requests.
    pub request_key: Option<String>,
    /// Key of the updated state in the model JSON and in `/api/generate` responses.
    pub response_key: Option<String>,
    /// Key of the boolean that marks the conversation as finished.
    pub completion_key: Option<String>,
    pub merge: MergePolicy,
    /// Spoken when the model output is unparsable. The state is carried forward.
    pub fallback_line: String,
    pub voice_id: String,
    /// Key the model may use to pick a different voice for one reply.
    pub voice_key: Option<String>,
    /// Knowledge file (relative to the data directory) inlined as `{knowledge}`.
    pub knowledge_file: Option<String>,
    /// JSON array file (relative to the data directory) completed conversations are appended to.
    pub records_file: Option<String>,
    pub record_prefix: String,
    pub initial_state: Value,
}

impl Default for Persona {
    fn default() -> Self {
        Self {
            name: "custom".to_string(),
            title: "Custom persona".to_string(),
            greeting: None,
            prompt: "User said: \"{text}\"".to_string(),
            reply_format: ReplyFormat::Text,
            speech_key: "speech".to_string(),
            request_key: None,
            response_key: None,
            completion_key: None,
            merge: MergePolicy::Replace,
            fallback_line: "Could you repeat that?".to_string(),
            voice_id: "en-US-matthew".to_string(),
            voice_key: None,
            knowledge_file: None,
            records_file: None,
            record_prefix: "REC".to_string(),
            initial_state: Value::Null,
        }
    }
}

impl Persona {
    /// Render the prompt for one turn.
    pub fn render_prompt(&self, text: &str, state: &Value, knowledge: &str) -> String {
        let state_json = serde_json::to_string(state).unwrap_or_else(|_| "null".to_string());
        self.prompt
            .replace("{state}", &state_json)
            .replace("{knowledge}", knowledge)
            .replace("{text}", text)
    }

    /// Whether turns of this persona exchange structured state.
    pub fn is_stateful(&self) -> bool {
        self.reply_format == ReplyFormat::Json && self.response_key.is_some()
    }
}

/// Look up a persona by name among the built-ins and any extra definitions.
pub fn find_persona(name: &str, extra: &[Persona]) -> Option<Persona> {
    extra
        .iter()
        .find(|p| p.name == name)
        .cloned()
        .or_else(|| builtin_personas().into_iter().find(|p| p.name == name))
}

/// Personas recovered from the demo series.
pub fn builtin_personas() -> Vec<Persona> {
    vec![
        Persona {
            name: "companion".to_string(),
            title: "Friendly companion".to_string(),
            greeting: Some("Hey! Good to hear from you. What's up?".to_string()),
            prompt: "You are Nexus, a warm and casual AI companion talking with your friend. \
                     Answer in one or two short, conversational sentences.\n\n\
                     Your friend said: \"{text}\""
                .to_string(),
            reply_format: ReplyFormat::Text,
            fallback_line: "I couldn't think of a reply.".to_string(),
            ..Persona::default()
        },
        Persona {
            name: "barista".to_string(),
            title: "Coffee shop order taker".to_string(),
            greeting: Some("Welcome to Neon Brews. What are we drinking today?".to_string()),
            prompt: r#"You are Nexus, a barista at "Neon Brews" with a playful cyberpunk style.
Fill in this order: {"drinkType": string, "size": string, "milk": string, "extras": [string], "name": string}.

Current order: {state}
Customer said: "{text}"

Update the order from what the customer said. Ask for missing fields one at a time,
in the order drink, size, milk, name. When every field is filled, confirm the order.

Return ONLY a JSON object:
{"speech": "what you say", "order": { ...updated order... }, "isComplete": boolean}"#
                .to_string(),
            reply_format: ReplyFormat::Json,
            request_key: Some("currentOrder".to_string()),
            response_key: Some("order".to_string()),
            completion_key: Some("isComplete".to_string()),
            fallback_line: "System glitch. Say that again?".to_string(),
            records_file: Some("orders.json".to_string()),
            record_prefix: "ORDER".to_string(),
            initial_state: json!({ "drinkType": "", "size": "", "milk": "", "extras": [], "name": "" }),
            ..Persona::default()
        },
        Persona {
            name: "wellness".to_string(),
            title: "Daily wellness check-in".to_string(),
            greeting: Some("Morning check-in. How are you feeling today?".to_string()),
            prompt: r#"You are a calm wellness companion running a short daily check-in.
Collect: {"mood": string, "energy": string, "goals": [string]}.

Check-in so far: {state}
User said: "{text}"

Ask about whatever is still missing, one question at a time. When all fields are
filled, give a one-sentence encouraging recap and finish.

Return ONLY a JSON object:
{"speech": "what you say", "vitals": { ...updated check-in... }, "isComplete": boolean}"#
                .to_string(),
            reply_format: ReplyFormat::Json,
            request_key: Some("currentVitals".to_string()),
            response_key: Some("vitals".to_string()),
            completion_key: Some("isComplete".to_string()),
            merge: MergePolicy::NonBlankFields,
            fallback_line: "Data packet corrupted. Please repeat.".to_string(),
            records_file: Some("wellness_log.json".to_string()),
            record_prefix: "CHECKIN".to_string(),
            initial_state: json!({ "mood": "", "energy": "", "goals": [] }),
            ..Persona::default()
        },
        Persona {
            name: "tutor".to_string(),
            title: "Active recall tutor".to_string(),
            greeting: Some("Pick a mode: learn, quiz, or teach back.".to_string()),
            prompt: r#"You are a tutor with three modes: "learn" (explain a concept), "quiz" (ask a
question) and "teach_back" (the student explains, you give feedback). Use only this material:
{knowledge}

Session context: {state}
Student said: "{text}"

Switch mode when the student asks. Use voice "en-US-matthew" for learn, "en-US-alicia" for
quiz and "en-US-ken" for teach_back.

Return ONLY a JSON object:
{"speech": "what you say", "context": {"mode": string, "topic": string}, "voiceId": string}"#
                .to_string(),
            reply_format: ReplyFormat::Json,
            request_key: Some("currentContext".to_string()),
            response_key: Some("context".to_string()),
            fallback_line: "Sorry, could you say that again?".to_string(),
            voice_key: Some("voiceId".to_string()),
            knowledge_file: Some("tutor_content.json".to_string()),
            initial_state: json!({ "mode": "", "topic": "" }),
            ..Persona::default()
        },
        Persona {
            name: "sdr".to_string(),
            title: "Sales development rep (lead qualification)".to_string(),
            greeting: Some("Hello! I'm Alex. What brings you here today?".to_string()),
            prompt: r#"You are Alex, a sales development rep. Answer product questions from the
knowledge base and qualify the lead.

KNOWLEDGE BASE:
{knowledge}

Lead so far: {state}
User said: "{text}"

Ask, in order: use case, role, company, team size, timeline, name. Update the lead with every
answer. If the user is done, or every field is filled, set isComplete to true.

Return ONLY a JSON object:
{"speech": "what you say", "lead": {"name": string, "role": string, "company": string,
"team_size": string, "use_case": string, "timeline": string}, "isComplete": boolean}"#
                .to_string(),
            reply_format: ReplyFormat::Json,
            request_key: Some("currentLead".to_string()),
            response_key: Some("lead".to_string()),
            completion_key: Some("isComplete".to_string()),
            merge: MergePolicy::NonBlankFields,
            fallback_line: "Could you repeat that? I missed a detail.".to_string(),
            knowledge_file: Some("company_data.json".to_string()),
            records_file: Some("leads.json".to_string()),
            record_prefix: "LEAD".to_string(),
            initial_state: json!({
                "name": "", "role": "", "company": "",
                "team_size": "", "use_case": "", "timeline": ""
            }),
            ..Persona::default()
        },
        Persona {
            name: "game-master".to_string(),
            title: "Dark fantasy game master".to_string(),
            greeting: Some(
                "You awaken in the Whispering Crypt. A dark corridor lies ahead. What do you do?"
                    .to_string(),
            ),
            prompt: r#"You are the game master of a dark fantasy adventure.

Current game state: {state}
Player action: "{text}"

Update hit points, gold, inventory and location from the action. Narrate the result in at
most two vivid sentences. Tag the turn with an event: DAMAGE, HEAL, LOOT, MAGIC or NONE.
If the player dies, set gameOver to true.

Return ONLY a JSON object:
{"speech": "narration", "updatedState": { ...full state... }, "event": string, "gameOver": boolean}"#
                .to_string(),
            reply_format: ReplyFormat::Json,
            request_key: Some("gameState".to_string()),
            response_key: Some("updatedState".to_string()),
            completion_key: Some("gameOver".to_string()),
            fallback_line: "The mists swirl and your action is lost. Try again.".to_string(),
            voice_id: "en-US-ken".to_string(),
            initial_state: json!({
                "player": { "name": "Traveler", "hp": 100, "max_hp": 100, "gold": 10,
                            "inventory": ["Rusty Sword", "Potion"] },
                "location": { "name": "Whispering Crypt", "description": "A cold, stone chamber." },
                "game_log": []
            }),
            ..Persona::default()
        },
        Persona {
            name: "shopper".to_string(),
            title: "Voice shopping assistant".to_string(),
            greeting: Some("Hi! What can I find for you today?".to_string()),
            prompt: r#"You are a shopping assistant for an online store. Only offer products from
this catalog:
{knowledge}

Current cart: {state}
Customer said: "{text}"

Add, remove or change cart items as asked. When the customer wants to check out, place the
order by setting isOrderPlaced to true.

Return ONLY a JSON object:
{"speech": "what you say", "cart": [ {"id": string, "name": string, "qty": number} ],
"isOrderPlaced": boolean}"#
                .to_string(),
            reply_format: ReplyFormat::Json,
            request_key: Some("cart".to_string()),
            response_key: Some("cart".to_string()),
            completion_key: Some("isOrderPlaced".to_string()),
            fallback_line: "I didn't catch that. Could you repeat?".to_string(),
            knowledge_file: Some("products.json".to_string()),
            records_file: Some("orders.json".to_string()),
            record_prefix: "ORDER".to_string(),
            initial_state: json!([]),
            ..Persona::default()
        },
        Persona {
            name: "fraud-alert".to_string(),
            title: "Bank fraud alert call".to_string(),
            greeting: Some(
                "This is Agent Carter from Sentinel Trust Bank, calling about a suspicious \
                 transaction on your card. Am I speaking with the cardholder?"
                    .to_string(),
            ),
            prompt: r#"You are Agent Carter, a fraud prevention specialist at Sentinel Trust Bank.
Work on the first case below whose status is PENDING_REVIEW.

CASES:
{knowledge}

Call state: {state}
Customer said: "{text}"

Follow the steps strictly:
- GREETING: once the customer confirms who they are, ask their security question and move to VERIFYING.
- VERIFYING: if the answer matches (loosely), describe the flagged transaction and move to DECISION.
  If it is wrong, end the call with status VERIFICATION_FAILED.
- DECISION: if the customer made the purchase, status CONFIRMED_SAFE; otherwise CONFIRMED_FRAUD
  and tell them the card is blocked. Either way the call ends.
Set shouldHangUp to true whenever the call ends, with a short summary of the outcome.

Return ONLY a JSON object:
{"speech": "what you say", "updatedState": {"step": "GREETING" | "VERIFYING" | "DECISION" | "COMPLETED",
"status": "PENDING_REVIEW" | "CONFIRMED_SAFE" | "CONFIRMED_FRAUD" | "VERIFICATION_FAILED",
"summary": string}, "shouldHangUp": boolean}"#
                .to_string(),
            reply_format: ReplyFormat::Json,
            request_key: Some("currentCase".to_string()),
            response_key: Some("updatedState".to_string()),
            completion_key: Some("shouldHangUp".to_string()),
            knowledge_file: Some("fraud_cases.json".to_string()),
            records_file: Some("fraud_outcomes.json".to_string()),
            record_prefix: "CASE".to_string(),
            initial_state: json!({ "step": "GREETING", "status": "PENDING_REVIEW" }),
            ..Persona::default()
        },
        Persona {
            name: "food".to_string(),
            title: "Food and grocery ordering".to_string(),
            greeting: Some("Welcome to GourmetGo! What are you craving?".to_string()),
            prompt: r#"You are Chef Neo, the ordering assistant for GourmetGo. Prices are in rupees.

CATALOG:
{knowledge}

Current cart: {state}
Customer said: "{text}"

Add requested items from the catalog. When the customer names a dish to cook, add its
ingredients. Remove items or lower quantities when asked, and always confirm what changed.
When the customer says checkout, that's all, or place order, set isComplete to true.

Return ONLY a JSON object:
{"speech": "what you say", "cart": [ {"id": string, "name": string, "price": number, "qty": number} ],
"isComplete": boolean}"#
                .to_string(),
            reply_format: ReplyFormat::Json,
            request_key: Some("currentCart".to_string()),
            response_key: Some("cart".to_string()),
            completion_key: Some("isComplete".to_string()),
            fallback_line: "Recipe unclear. Could you repeat that?".to_string(),
            knowledge_file: Some("food_catalog.json".to_string()),
            records_file: Some("food_orders.json".to_string()),
            record_prefix: "ORD".to_string(),
            initial_state: json!([]),
            ..Persona::default()
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_names_are_unique() {
        let personas = builtin_personas();
        let mut names: Vec<_> = personas.iter().map(|p| p.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), personas.len());
    }

    #[test]
    fn render_prompt_substitutes_all_placeholders() {
        let persona = find_persona("sdr", &[]).unwrap();
        let prompt = persona.render_prompt(
            "we build payment APIs",
            &json!({ "name": "Alex" }),
            "KB-CONTENT",
        );

        assert!(prompt.contains("we build payment APIs"));
        assert!(prompt.contains(r#"{"name":"Alex"}"#));
        assert!(prompt.contains("KB-CONTENT"));
        assert!(!prompt.contains("{text}"));
        assert!(!prompt.contains("{knowledge}"));
    }

    #[test]
    fn user_text_is_substituted_last() {
        let persona = Persona {
            prompt: "S={state} T={text}".to_string(),
            ..Persona::default()
        };
        // Placeholders typed by the user must not be expanded.
        let prompt = persona.render_prompt("{state}", &json!({ "k": 1 }), "");
        assert_eq!(prompt, r#"S={"k":1} T={state}"#);
    }

    #[test]
    fn extra_personas_shadow_builtins() {
        let custom = Persona {
            name: "sdr".to_string(),
            title: "Overridden".to_string(),
            ..Persona::default()
        };
        let found = find_persona("sdr", &[custom]).unwrap();
        assert_eq!(found.title, "Overridden");
    }

    #[test]
    fn companion_is_stateless_and_sdr_is_stateful() {
        assert!(!find_persona("companion", &[]).unwrap().is_stateful());
        assert!(find_persona("sdr", &[]).unwrap().is_stateful());
    }

    #[test]
    fn fraud_alert_exchanges_the_call_state() {
        let persona = find_persona("fraud-alert", &[]).unwrap();
        assert_eq!(persona.request_key.as_deref(), Some("currentCase"));
        assert_eq!(persona.response_key.as_deref(), Some("updatedState"));
        assert_eq!(persona.completion_key.as_deref(), Some("shouldHangUp"));
        assert_eq!(persona.initial_state["step"], "GREETING");

        let prompt = persona.render_prompt("yes, this is John", &persona.initial_state, "[CASES]");
        assert!(prompt.contains("[CASES]"));
        assert!(prompt.contains(r#""step":"GREETING""#));
    }

    #[test]
    fn food_ordering_starts_with_an_empty_cart_and_a_greeting() {
        let persona = find_persona("food", &[]).unwrap();
        assert_eq!(persona.initial_state, json!([]));
        assert_eq!(persona.request_key.as_deref(), Some("currentCart"));
        assert_eq!(persona.completion_key.as_deref(), Some("isComplete"));
        assert_eq!(
            persona.greeting.as_deref(),
            Some("Welcome to GourmetGo! What are you craving?")
        );
        assert!(persona.is_stateful());
    }

    #[test]
    fn persona_deserializes_with_defaults() {
        let persona: Persona = serde_json::from_str(r#"{ "name": "pirate" }"#).unwrap();
        assert_eq!(persona.name, "pirate");
        assert_eq!(persona.reply_format, ReplyFormat::Text);
        assert_eq!(persona.voice_id, "en-US-matthew");
    }
}
