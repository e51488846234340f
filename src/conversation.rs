use serde::{Deserialize, Serialize};
use std::fmt;

// ========================= Sub-goals =========================

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubGoalStatus {
    Pending,
    Running,
    Finished,
}

impl fmt::Display for SubGoalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SubGoalStatus::Pending => "pending",
            SubGoalStatus::Running => "running",
            SubGoalStatus::Finished => "finished",
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubGoal {
    pub index: u32,
    pub description: String,
    pub status: SubGoalStatus,
}

impl SubGoal {
    pub fn new(index: u32, description: impl Into<String>, status: SubGoalStatus) -> Self {
        Self { index, description: description.into(), status }
    }
}

/// Targeted change for [`SubGoalTracker::update`].
#[derive(Clone, Debug, Default)]
pub struct SubGoalPatch {
    pub description: Option<String>,
    pub status: Option<SubGoalStatus>,
}

/// Ordered plan with at most one `running` entry. Statuses only advance
/// (`pending -> running -> finished`) unless the whole list is replaced.
#[derive(Clone, Debug, Default)]
pub struct SubGoalTracker {
    goals: Vec<SubGoal>,
}

impl SubGoalTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn goals(&self) -> &[SubGoal] {
        &self.goals
    }

    pub fn is_empty(&self) -> bool {
        self.goals.is_empty()
    }

    pub fn current(&self) -> Option<&SubGoal> {
        self.goals.iter().find(|g| g.status == SubGoalStatus::Running)
    }

    /// Installs a new plan. Entries without a description keep the one
    /// already known for their index.
    pub fn replace(&mut self, goals: &[SubGoal]) {
        let mut next = goals.to_vec();
        for goal in next.iter_mut().filter(|g| g.description.is_empty()) {
            if let Some(prev) = self.goals.iter().find(|p| p.index == goal.index) {
                goal.description = prev.description.clone();
            }
        }
        let mut seen_running = false;
        for goal in next.iter_mut().filter(|g| g.status == SubGoalStatus::Running) {
            if seen_running {
                goal.status = SubGoalStatus::Pending;
            }
            seen_running = true;
        }
        self.goals = next;
        self.promote();
    }

    /// Unknown indexes are ignored; the model may refer to a stale plan.
    pub fn mark_finished<I>(&mut self, indexes: I)
    where
        I: IntoIterator<Item = u32>,
    {
        for index in indexes {
            if let Some(goal) = self.goals.iter_mut().find(|g| g.index == index) {
                goal.status = SubGoalStatus::Finished;
            }
        }
        self.promote();
    }

    pub fn mark_all_finished(&mut self) {
        for goal in &mut self.goals {
            goal.status = SubGoalStatus::Finished;
        }
    }

    /// Returns `false` when no sub-goal has `index`. Status changes that would
    /// move backwards or start a second running sub-goal are dropped.
    pub fn update(&mut self, index: u32, patch: SubGoalPatch) -> bool {
        let another_running = self
            .goals
            .iter()
            .any(|g| g.index != index && g.status == SubGoalStatus::Running);
        let Some(goal) = self.goals.iter_mut().find(|g| g.index == index) else {
            return false;
        };
        if let Some(description) = patch.description {
            goal.description = description;
        }
        if let Some(status) = patch.status {
            let blocked = status == SubGoalStatus::Running && another_running;
            if status >= goal.status && !blocked {
                goal.status = status;
            }
        }
        self.promote();
        true
    }

    fn promote(&mut self) {
        if self.current().is_some() {
            return;
        }
        if let Some(goal) = self.goals.iter_mut().find(|g| g.status == SubGoalStatus::Pending) {
            goal.status = SubGoalStatus::Running;
        }
    }

    pub fn render_text(&self) -> String {
        if self.goals.is_empty() {
            return String::new();
        }
        let mut s = String::from("Sub-goals:");
        for goal in &self.goals {
            s.push_str(&format!("\n{}. {} ({})", goal.index, goal.description, goal.status));
        }
        if let Some(current) = self.current() {
            s.push_str("\nCurrent sub-goal is: ");
            s.push_str(&current.description);
        }
        s
    }
}

// ========================= Transcript =========================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    Image { data_base64: String, mime_type: String },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        ContentPart::Text { text: text.into() }
    }

    pub fn image(data_base64: impl Into<String>, mime_type: impl Into<String>) -> Self {
        ContentPart::Image { data_base64: data_base64.into(), mime_type: mime_type.into() }
    }

    pub fn is_image(&self) -> bool {
        matches!(self, ContentPart::Image { .. })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TurnContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl TurnContent {
    pub fn has_image(&self) -> bool {
        match self {
            TurnContent::Text(_) => false,
            TurnContent::Parts(parts) => parts.iter().any(ContentPart::is_image),
        }
    }

    /// Concatenated text of the turn, images skipped.
    pub fn text(&self) -> String {
        match self {
            TurnContent::Text(text) => text.clone(),
            TurnContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::Image { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: TurnContent,
}

/// Transcript of one task plus its plan and memory log.
///
/// The system turn is inserted by [`Conversation::new`] and never touched
/// afterwards, except that [`Conversation::compress`] may drop it when the
/// caller keeps too few turns.
#[derive(Clone, Debug)]
pub struct Conversation {
    turns: Vec<Turn>,
    sub_goals: SubGoalTracker,
    memories: Vec<String>,
}

impl Conversation {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            turns: vec![Turn {
                role: Role::System,
                content: TurnContent::Text(system_prompt.into()),
            }],
            sub_goals: SubGoalTracker::new(),
            memories: Vec::new(),
        }
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    pub fn append_user(&mut self, parts: Vec<ContentPart>) {
        self.turns.push(Turn { role: Role::User, content: TurnContent::Parts(parts) });
    }

    pub fn append_assistant(&mut self, text: impl Into<String>) {
        self.turns.push(Turn { role: Role::Assistant, content: TurnContent::Text(text.into()) });
    }

    /// Adds `image` to the most recent user turn unless it already carries
    /// one. When the transcript does not end with a user turn a new one is
    /// opened for the image. Returns whether the image was added.
    pub fn attach_image(&mut self, image: ContentPart) -> bool {
        match self.turns.last_mut() {
            Some(Turn { role: Role::User, content }) => {
                if content.has_image() {
                    return false;
                }
                match content {
                    TurnContent::Parts(parts) => parts.push(image),
                    TurnContent::Text(text) => {
                        let text = std::mem::take(text);
                        *content = TurnContent::Parts(vec![ContentPart::text(text), image]);
                    }
                }
                true
            }
            _ => {
                self.append_user(vec![image]);
                true
            }
        }
    }

    pub fn sub_goals(&self) -> &SubGoalTracker {
        &self.sub_goals
    }

    pub fn sub_goals_mut(&mut self) -> &mut SubGoalTracker {
        &mut self.sub_goals
    }

    pub fn memories(&self) -> &[String] {
        &self.memories
    }

    pub fn attach_memory(&mut self, memory: Option<&str>) {
        match memory {
            Some(m) if !m.is_empty() => self.memories.push(m.to_string()),
            _ => {}
        }
    }

    pub fn render_memory_text(&self) -> String {
        if self.memories.is_empty() {
            return String::new();
        }
        format!("Memories from previous steps:\n---\n{}\n", self.memories.join("\n---\n"))
    }

    /// Memory and plan block appended to follow-up user turns; empty when
    /// there is nothing to report.
    pub fn render_context(&self) -> String {
        let body = format!("{}{}", self.render_memory_text(), self.sub_goals.render_text());
        if body.is_empty() {
            body
        } else {
            format!("\n\n{body}")
        }
    }

    /// Replaces all but the `keep_recent` newest turns with one placeholder
    /// user turn once the transcript grows past `threshold`. The system turn
    /// is only kept if it falls inside `keep_recent`.
    pub fn compress(&mut self, threshold: usize, keep_recent: usize) -> bool {
        if self.turns.len() <= threshold || keep_recent >= self.turns.len() {
            return false;
        }
        let omitted = self.turns.len() - keep_recent;
        let kept = self.turns.split_off(omitted);
        self.turns = Vec::with_capacity(kept.len() + 1);
        self.turns.push(Turn {
            role: Role::User,
            content: TurnContent::Parts(vec![ContentPart::text(format!(
                "{omitted} previous conversation messages have been omitted."
            ))]),
        });
        self.turns.extend(kept);
        true
    }

    /// Independent copy of the transcript.
    pub fn snapshot(&self) -> Vec<Turn> {
        self.turns.clone()
    }

    pub fn export_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(&self.turns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(index: u32, description: &str) -> SubGoal {
        SubGoal::new(index, description, SubGoalStatus::Pending)
    }

    fn statuses(tracker: &SubGoalTracker) -> Vec<SubGoalStatus> {
        tracker.goals().iter().map(|g| g.status).collect()
    }

    #[test]
    fn test_replace_promotes_first_pending() {
        let mut tracker = SubGoalTracker::new();
        tracker.replace(&[pending(1, "Log in"), pending(2, "Open inbox")]);
        assert_eq!(statuses(&tracker), vec![SubGoalStatus::Running, SubGoalStatus::Pending]);
        assert_eq!(tracker.current().map(|g| g.index), Some(1));
    }

    #[test]
    fn test_mark_finished_advances_to_next() {
        let mut tracker = SubGoalTracker::new();
        tracker.replace(&[pending(1, "Log in"), pending(2, "Open inbox")]);
        tracker.mark_finished([1]);
        assert_eq!(statuses(&tracker), vec![SubGoalStatus::Finished, SubGoalStatus::Running]);
    }

    #[test]
    fn test_mark_finished_unknown_index_is_noop() {
        let mut tracker = SubGoalTracker::new();
        tracker.replace(&[pending(1, "Log in"), pending(2, "Open inbox")]);
        let before = tracker.goals().to_vec();
        tracker.mark_finished([42]);
        assert_eq!(tracker.goals(), before.as_slice());
    }

    #[test]
    fn test_replace_copies_input() {
        let mut source = vec![pending(1, "Log in")];
        let mut tracker = SubGoalTracker::new();
        tracker.replace(&source);
        source[0].description = "mutated".into();
        assert_eq!(tracker.goals()[0].description, "Log in");
    }

    #[test]
    fn test_replace_keeps_descriptions_for_status_refresh() {
        let mut tracker = SubGoalTracker::new();
        tracker.replace(&[pending(1, "Log in"), pending(2, "Open inbox")]);
        tracker.replace(&[
            SubGoal::new(1, "", SubGoalStatus::Finished),
            SubGoal::new(2, "", SubGoalStatus::Pending),
        ]);
        assert_eq!(tracker.goals()[0].description, "Log in");
        assert_eq!(tracker.goals()[1].description, "Open inbox");
        assert_eq!(tracker.current().map(|g| g.index), Some(2));
    }

    #[test]
    fn test_replace_allows_single_running() {
        let mut tracker = SubGoalTracker::new();
        tracker.replace(&[
            SubGoal::new(1, "a", SubGoalStatus::Running),
            SubGoal::new(2, "b", SubGoalStatus::Running),
        ]);
        assert_eq!(statuses(&tracker), vec![SubGoalStatus::Running, SubGoalStatus::Pending]);
    }

    #[test]
    fn test_mark_all_finished() {
        let mut tracker = SubGoalTracker::new();
        tracker.replace(&[pending(1, "a"), pending(2, "b"), pending(3, "c")]);
        tracker.mark_all_finished();
        assert!(tracker.goals().iter().all(|g| g.status == SubGoalStatus::Finished));
        assert!(tracker.current().is_none());
    }

    #[test]
    fn test_update_never_moves_backwards() {
        let mut tracker = SubGoalTracker::new();
        tracker.replace(&[pending(1, "a"), pending(2, "b")]);
        tracker.mark_finished([1]);

        let found = tracker.update(
            1,
            SubGoalPatch { description: Some("renamed".into()), status: Some(SubGoalStatus::Pending) },
        );
        assert!(found);
        assert_eq!(tracker.goals()[0].description, "renamed");
        assert_eq!(tracker.goals()[0].status, SubGoalStatus::Finished);

        assert!(!tracker.update(9, SubGoalPatch::default()));
    }

    #[test]
    fn test_update_finishing_current_promotes_next() {
        let mut tracker = SubGoalTracker::new();
        tracker.replace(&[pending(1, "a"), pending(2, "b")]);
        tracker.update(2, SubGoalPatch { status: Some(SubGoalStatus::Running), ..Default::default() });
        assert_eq!(tracker.goals()[1].status, SubGoalStatus::Pending);

        tracker.update(1, SubGoalPatch { status: Some(SubGoalStatus::Finished), ..Default::default() });
        assert_eq!(statuses(&tracker), vec![SubGoalStatus::Finished, SubGoalStatus::Running]);
    }

    #[test]
    fn test_render_text() {
        let mut tracker = SubGoalTracker::new();
        assert_eq!(tracker.render_text(), "");
        tracker.replace(&[pending(1, "Fill name"), pending(2, "Fill email")]);
        assert_eq!(
            tracker.render_text(),
            "Sub-goals:\n1. Fill name (running)\n2. Fill email (pending)\nCurrent sub-goal is: Fill name"
        );
    }

    #[test]
    fn test_memory_log() {
        let mut convo = Conversation::new("sys");
        assert_eq!(convo.render_memory_text(), "");
        convo.attach_memory(None);
        convo.attach_memory(Some(""));
        convo.attach_memory(Some("name is John"));
        convo.attach_memory(Some("email is john@example.com"));
        assert_eq!(convo.memories().len(), 2);
        assert_eq!(
            convo.render_memory_text(),
            "Memories from previous steps:\n---\nname is John\n---\nemail is john@example.com\n"
        );
    }

    #[test]
    fn test_render_context_empty_without_state() {
        let convo = Conversation::new("sys");
        assert_eq!(convo.render_context(), "");
    }

    #[test]
    fn test_attach_image_once_per_turn() {
        let mut convo = Conversation::new("sys");
        convo.append_user(vec![ContentPart::text("hello")]);
        assert!(convo.attach_image(ContentPart::image("AAAA", "image/jpeg")));
        assert!(!convo.attach_image(ContentPart::image("BBBB", "image/jpeg")));
        match &convo.last().expect("turn").content {
            TurnContent::Parts(parts) => assert_eq!(parts.len(), 2),
            other => panic!("unexpected content {other:?}"),
        }
    }

    #[test]
    fn test_attach_image_opens_user_turn_after_assistant() {
        let mut convo = Conversation::new("sys");
        convo.append_assistant("ok");
        assert!(convo.attach_image(ContentPart::image("AAAA", "image/jpeg")));
        assert_eq!(convo.len(), 3);
        assert_eq!(convo.last().expect("turn").role, Role::User);
    }

    #[test]
    fn test_compress_keeps_recent_turns() {
        let mut convo = Conversation::new("sys");
        for i in 0..20 {
            if i % 2 == 0 {
                convo.append_user(vec![ContentPart::text(format!("u{i}"))]);
            } else {
                convo.append_assistant(format!("a{i}"));
            }
        }
        assert_eq!(convo.len(), 21);
        let last_five = convo.turns()[16..].to_vec();

        assert!(convo.compress(20, 5));
        assert_eq!(convo.len(), 6);
        assert_eq!(convo.turns()[0].role, Role::User);
        assert!(convo.turns()[0]
            .content
            .text()
            .contains("16 previous conversation messages have been omitted"));
        assert_eq!(&convo.turns()[1..], last_five.as_slice());
    }

    #[test]
    fn test_compress_below_threshold_is_noop() {
        let mut convo = Conversation::new("sys");
        convo.append_user(vec![ContentPart::text("hi")]);
        assert!(!convo.compress(2, 1));
        assert_eq!(convo.len(), 2);
    }

    #[test]
    fn test_snapshot_is_independent() {
        let mut convo = Conversation::new("sys");
        convo.append_user(vec![ContentPart::text("hi")]);
        let mut copy = convo.snapshot();
        copy.clear();
        assert_eq!(convo.len(), 2);
        let json = convo.export_json().expect("json");
        assert!(json.contains("\"role\": \"system\""));
    }
}
