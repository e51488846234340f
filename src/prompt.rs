//! Instruction text sent as the system turn. The tag vocabulary described
//! here is exactly what [`crate::protocol::decode_response`] reads.

#[derive(Clone, Copy, Debug)]
pub struct PromptOptions {
    pub include_sub_goals: bool,
    pub include_thought: bool,
}

impl Default for PromptOptions {
    fn default() -> Self {
        Self { include_sub_goals: false, include_thought: true }
    }
}

const LOCATE_DESC: &str =
    "{ bbox: [number, number, number, number] } // bbox: [ymin, xmin, ymax, xmax], each 0-1000";

pub fn action_descriptions() -> Vec<String> {
    vec![
        "- Launch, open a URL in the current page\n  - param:\n    - url: string".to_string(),
        format!("- Tap, tap the element\n  - param:\n    - locate: {LOCATE_DESC}"),
        format!(
            "- Input, enter text into the element\n  - param:\n    - value: string // final text for replace/append, empty for clear\n    - locate: {LOCATE_DESC} (optional)\n    - mode: \"replace\" | \"clear\" | \"typeOnly\" | \"append\" (default: \"replace\")"
        ),
        format!(
            "- Scroll, scroll the page or an element\n  - param:\n    - scrollType: \"singleAction\" | \"scrollToBottom\" | \"scrollToTop\" | \"scrollToRight\" | \"scrollToLeft\" (default: \"singleAction\")\n    - direction: \"down\" | \"up\" | \"right\" | \"left\" // only used by singleAction (default: \"down\")\n    - distance: number // pixels, optional\n    - locate: {LOCATE_DESC} (optional) // the scrollable area"
        ),
        "- Sleep, wait before continuing\n  - param:\n    - timeMs: number (default: 1000)".to_string(),
    ]
}

const SUB_GOAL_SECTION: &str = r#"
* <update-plan-content> tag

Give or update your plan with this structure:

<update-plan-content>
  <sub-goal index="1" status="finished|pending">sub goal description</sub-goal>
  <sub-goal index="2" status="finished|pending">sub goal description</sub-goal>
</update-plan-content>

You may refresh statuses only, keeping earlier descriptions:

<update-plan-content>
  <sub-goal index="1" status="finished" />
  <sub-goal index="2" status="pending" />
</update-plan-content>

* <mark-sub-goal-done> tag

Mark sub-goals as done with this structure:

<mark-sub-goal-done>
  <sub-goal index="1" status="finished" />
</mark-sub-goal-done>

Only mark a sub-goal finished after the screenshot confirms it is achieved, never in anticipation of the next action.
"#;

const MEMORY_SECTION: &str = r#"
## Step 2: Memory (related tags: <memory>)

The current screenshot will not be available in later steps. If it shows information needed later (extracted data, element states, text to reuse), record it in <memory>...</memory>. Skip the tag when there is nothing to keep.
"#;

pub fn system_prompt(opts: PromptOptions) -> String {
    let PromptOptions { include_sub_goals, include_thought } = opts;
    let check_step = if include_sub_goals { 3 } else { 2 };
    let action_step = check_step + 1;

    let mut s = String::from(
        "Target: You are an expert at operating a UI to accomplish the user's instruction. The user gives you an instruction, screenshots and logs of what has been done. Work out the path to the goal and give the next action to execute.\n\n",
    );

    if include_sub_goals {
        s.push_str("## Step 1: Observe and Plan (related tags: <thought>, <update-plan-content>, <mark-sub-goal-done>)\n\n");
        s.push_str("Observe the current screenshot and previous logs, break the instruction into high-level sub-goals, and update their status from what you see.\n");
    } else {
        s.push_str("## Step 1: Observe (related tags: <thought>)\n\n");
        s.push_str("Observe the current screenshot and previous logs to understand the current state.\n");
    }
    if include_thought {
        s.push_str("\n* <thought> tag (REQUIRED)\n\nAlways output <thought>. Describe the current state, ");
        if include_sub_goals {
            s.push_str("whether the sub-goals are complete, ");
        }
        s.push_str("and what the next action should be. When the user gives explicit steps, do exactly those steps and nothing more.\n");
    }
    if include_sub_goals {
        s.push_str(SUB_GOAL_SECTION);
        s.push_str(MEMORY_SECTION);
    }

    s.push_str(&format!(
        "\n## Step {check_step}: Check if Goal is Accomplished (related tags: <complete-goal>)\n\n\
The user's instruction defines the exact scope of the task. When it is accomplished, or cannot be accomplished, output\n\
<complete-goal success=\"true|false\">message for the user</complete-goal>\n\
and do NOT output <action-type> or <action-param-json> in the same response. If the task is not complete, continue to Step {action_step}.\n"
    ));

    s.push_str(&format!(
        "\n## Step {action_step}: Determine Next Action (related tags: <log>, <action-type>, <action-param-json>, <error>)\n\n\
Give just the next ONE action. Check that previous actions succeeded and recover if they did not. If an error persists after several attempts, report it in <error>...</error>.\n\n\
### Supporting actions list\n\n{}\n\n\
Use <log> for a one-sentence note to the user about what you are about to do.\n\n\
Example:\n\
<log>Tap the login button</log>\n\
<action-type>Tap</action-type>\n\
<action-param-json>\n{{\n  \"locate\": {{ \"bbox\": [345, 442, 458, 483] }}\n}}\n</action-param-json>\n\n\
If there is no action to do, omit <action-type> and <action-param-json>.\n",
        action_descriptions().join("\n")
    ));

    s.push_str("\n## Return Format\n\n");
    if include_thought {
        s.push_str("<thought>...</thought>\n");
    }
    if include_sub_goals {
        s.push_str("<update-plan-content>...</update-plan-content> (required until a plan exists)\n");
        s.push_str("<mark-sub-goal-done>...</mark-sub-goal-done> (when sub-goals finish)\n");
        s.push_str("<memory>...</memory> (optional)\n");
    }
    s.push_str("\nThen either\n<complete-goal success=\"true|false\">...</complete-goal>\nor\n<log>...</log>\n<action-type>...</action-type>\n<action-param-json>...</action-param-json>\nor\n<error>...</error>\n");
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_with_sub_goals_describes_plan_tags() {
        let prompt = system_prompt(PromptOptions { include_sub_goals: true, include_thought: true });
        assert!(prompt.contains("<update-plan-content>"));
        assert!(prompt.contains("<mark-sub-goal-done>"));
        assert!(prompt.contains("<memory>"));
        assert!(prompt.contains("## Step 3: Check if Goal is Accomplished"));
        assert!(prompt.contains("## Step 4: Determine Next Action"));
    }

    #[test]
    fn test_prompt_without_sub_goals() {
        let prompt = system_prompt(PromptOptions::default());
        assert!(!prompt.contains("<update-plan-content>"));
        assert!(!prompt.contains("<memory>"));
        assert!(prompt.contains("## Step 2: Check if Goal is Accomplished"));
        assert!(prompt.contains("<thought>"));
        assert!(prompt.contains("<complete-goal success=\"true|false\">"));
    }

    #[test]
    fn test_action_list_covers_supported_types() {
        let list = action_descriptions().join("\n");
        for kind in ["Launch", "Tap", "Input", "Scroll", "Sleep"] {
            assert!(list.contains(&format!("- {kind},")), "missing {kind}");
        }
    }
}
