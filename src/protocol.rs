//! Tolerant decoding of the tagged planning protocol emitted by the model.
//!
//! Nothing in here fails: a missing, unterminated or malformed block simply
//! decodes to `None`.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

use crate::conversation::{SubGoal, SubGoalStatus};

static COMPLETE_GOAL_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)<complete-goal\s+success="(true|false)"\s*>([\s\S]*?)</complete-goal>"#)
        .expect("complete-goal regex")
});

static SUB_GOAL_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)<sub-goal\s+index="(\d+)"\s+status="(pending|finished)"(?:\s*/>|>([\s\S]*?)</sub-goal>)"#,
    )
    .expect("sub-goal regex")
});

static MARK_DONE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)<sub-goal\s+index="(\d+)"\s+status="finished"\s*/>"#)
        .expect("mark-done regex")
});

/// Action as named by the model: a type tag plus whatever parameters it sent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActionDescriptor {
    #[serde(rename = "type")]
    pub kind: String,
    /// `None` when the parameter block was missing or was not a JSON object.
    pub param: Option<Map<String, Value>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub success: bool,
    pub message: String,
}

/// Everything decoded from one model turn. Every field is independently
/// optional; `Some(empty)` and `None` mean different things.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub thought: Option<String>,
    pub log: Option<String>,
    pub error: Option<String>,
    pub action: Option<ActionDescriptor>,
    pub completion: Option<Completion>,
    pub sub_goals: Option<Vec<SubGoal>>,
    pub finished_indexes: Option<BTreeSet<u32>>,
    pub memory: Option<String>,
}

impl Decision {
    /// Completion wins over any action given in the same turn.
    pub fn next_action(&self) -> Option<&ActionDescriptor> {
        if self.completion.is_some() {
            None
        } else {
            self.action.as_ref()
        }
    }
}

/// Returns the trimmed body of the last `<tag>...</tag>` block in `text`.
///
/// The closing tag is located first and the nearest opening tag before it is
/// paired with it, so a restated block later in the response wins.
pub fn extract_tag(text: &str, tag: &str) -> Option<String> {
    let haystack = text.to_ascii_lowercase();
    let tag = tag.to_ascii_lowercase();
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");

    let close_at = haystack.rfind(&close)?;
    let open_at = haystack[..close_at].rfind(&open)?;
    // ASCII lowercasing keeps byte offsets identical to the original text.
    let body = &text[open_at + open.len()..close_at];
    Some(body.trim().to_string())
}

/// Decodes one raw model turn.
pub fn decode_response(raw: &str) -> Decision {
    let completion = COMPLETE_GOAL_REGEX
        .captures_iter(raw)
        .last()
        .map(|caps| Completion {
            success: caps[1].eq_ignore_ascii_case("true"),
            message: caps.get(2).map(|m| m.as_str().trim().to_string()).unwrap_or_default(),
        });

    let action = extract_tag(raw, "action-type")
        .filter(|kind| !kind.is_empty() && !kind.eq_ignore_ascii_case("null"))
        .map(|kind| ActionDescriptor {
            kind,
            param: extract_tag(raw, "action-param-json").and_then(|body| parse_param(&body)),
        });

    Decision {
        thought: extract_tag(raw, "thought"),
        log: extract_tag(raw, "log"),
        error: extract_tag(raw, "error"),
        action,
        completion,
        sub_goals: extract_tag(raw, "update-plan-content").map(|body| parse_sub_goals(&body)),
        finished_indexes: extract_tag(raw, "mark-sub-goal-done")
            .map(|body| parse_finished_indexes(&body)),
        memory: extract_tag(raw, "memory"),
    }
}

fn parse_param(body: &str) -> Option<Map<String, Value>> {
    match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}

/// Collects well-formed `<sub-goal index=".." status="..">` entries; anything
/// else in the block is skipped.
pub fn parse_sub_goals(body: &str) -> Vec<SubGoal> {
    SUB_GOAL_REGEX
        .captures_iter(body)
        .filter_map(|caps| {
            let index = caps[1].parse::<u32>().ok()?;
            let status = if caps[2].eq_ignore_ascii_case("finished") {
                SubGoalStatus::Finished
            } else {
                SubGoalStatus::Pending
            };
            let description = caps
                .get(3)
                .map(|m| m.as_str().trim().to_string())
                .unwrap_or_default();
            Some(SubGoal { index, description, status })
        })
        .collect()
}

fn parse_finished_indexes(body: &str) -> BTreeSet<u32> {
    MARK_DONE_REGEX
        .captures_iter(body)
        .filter_map(|caps| caps[1].parse::<u32>().ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_tag_prefers_last_block() {
        let text = "<log>first</log> noise <log> second </log>";
        assert_eq!(extract_tag(text, "log").as_deref(), Some("second"));
    }

    #[test]
    fn test_extract_tag_is_case_insensitive() {
        let text = "<THOUGHT>Look at the Form</Thought>";
        assert_eq!(extract_tag(text, "thought").as_deref(), Some("Look at the Form"));
    }

    #[test]
    fn test_extract_tag_unterminated_is_absent() {
        assert_eq!(extract_tag("<log>never closed", "log"), None);
        assert_eq!(extract_tag("closed only</log>", "log"), None);
        assert_eq!(extract_tag("", "log"), None);
    }

    #[test]
    fn test_extract_tag_keeps_non_ascii_content() {
        let text = "<memory>价格: 42 €</memory>";
        assert_eq!(extract_tag(text, "memory").as_deref(), Some("价格: 42 €"));
    }

    #[test]
    fn test_decode_full_turn() {
        let raw = r#"
<thought>The search box is visible.</thought>
<update-plan-content>
  <sub-goal index="1" status="pending">Open the site</sub-goal>
  <sub-goal index="2" status="pending">Search for shoes</sub-goal>
</update-plan-content>
<memory>Cart has 2 items</memory>
<log>Tap the search box</log>
<action-type>Tap</action-type>
<action-param-json>
{ "locate": { "bbox": [10, 20, 30, 40] } }
</action-param-json>
"#;
        let decision = decode_response(raw);
        assert_eq!(decision.thought.as_deref(), Some("The search box is visible."));
        assert_eq!(decision.log.as_deref(), Some("Tap the search box"));
        assert_eq!(decision.memory.as_deref(), Some("Cart has 2 items"));
        assert!(decision.completion.is_none());

        let goals = decision.sub_goals.expect("plan");
        assert_eq!(goals.len(), 2);
        assert_eq!(goals[1].index, 2);
        assert_eq!(goals[1].description, "Search for shoes");
        assert_eq!(goals[1].status, SubGoalStatus::Pending);

        let action = decision.action.expect("action");
        assert_eq!(action.kind, "Tap");
        let param = action.param.expect("param");
        assert_eq!(param["locate"]["bbox"][3], 40);
    }

    #[test]
    fn test_decode_bad_json_keeps_action_type() {
        let raw = "<action-type>Scroll</action-type><action-param-json>{ direction: down</action-param-json>";
        let action = decode_response(raw).action.expect("action");
        assert_eq!(action.kind, "Scroll");
        assert!(action.param.is_none());
    }

    #[test]
    fn test_decode_non_object_param_is_absent() {
        let raw = "<action-type>Sleep</action-type><action-param-json>[1, 2]</action-param-json>";
        assert!(decode_response(raw).action.expect("action").param.is_none());
    }

    #[test]
    fn test_decode_null_action_type() {
        let raw = "<thought>waiting</thought><action-type> NULL </action-type>";
        let decision = decode_response(raw);
        assert!(decision.action.is_none());
        assert_eq!(decision.thought.as_deref(), Some("waiting"));
    }

    #[test]
    fn test_decode_missing_fields_are_absent() {
        let decision = decode_response("just prose, <thought>unterminated");
        assert_eq!(decision, Decision::default());
    }

    #[test]
    fn test_completion_overrides_action() {
        let raw = r#"<complete-goal success="TRUE"> john@example.com </complete-goal>
<action-type>Tap</action-type><action-param-json>{}</action-param-json>"#;
        let decision = decode_response(raw);
        let completion = decision.completion.clone().expect("completion");
        assert!(completion.success);
        assert_eq!(completion.message, "john@example.com");
        assert!(decision.action.is_some());
        assert!(decision.next_action().is_none());
    }

    #[test]
    fn test_completion_failure_flag() {
        let raw = r#"<complete-goal success="false">Login button missing</complete-goal>"#;
        let completion = decode_response(raw).completion.expect("completion");
        assert!(!completion.success);
        assert_eq!(completion.message, "Login button missing");
    }

    #[test]
    fn test_malformed_sub_goals_are_skipped() {
        let body = r#"
  <sub-goal index="1" status="pending">Keep me</sub-goal>
  <sub-goal index="x" status="pending">Bad index</sub-goal>
  <sub-goal index="2" status="running">Bad status</sub-goal>
  <sub-goal index="3" status="finished" />
"#;
        let goals = parse_sub_goals(body);
        assert_eq!(goals.len(), 2);
        assert_eq!(goals[0].description, "Keep me");
        assert_eq!(goals[1].index, 3);
        assert_eq!(goals[1].status, SubGoalStatus::Finished);
        assert!(goals[1].description.is_empty());
    }

    #[test]
    fn test_mark_done_indexes() {
        let raw = r#"<mark-sub-goal-done>
  <sub-goal index="2" status="finished" />
  <sub-goal index="3" status="finished"/>
  <sub-goal index="4" status="pending" />
</mark-sub-goal-done>"#;
        let indexes = decode_response(raw).finished_indexes.expect("indexes");
        assert_eq!(indexes.into_iter().collect::<Vec<_>>(), vec![2, 3]);
    }

    #[test]
    fn test_empty_plan_block_is_present_but_empty() {
        let decision = decode_response("<update-plan-content></update-plan-content>");
        assert_eq!(decision.sub_goals, Some(Vec::new()));
    }
}
