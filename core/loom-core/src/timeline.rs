//! Timeline entries and path-addressed tool lookup.
//!
//! A tool entry may own a nested `sub_timeline` holding subagent activity.
//! Tools are addressed by a [`ToolPath`]: the index at the top level followed by
//! the index inside each nested sub-timeline. Lookups resolve a path once and
//! then mutate through it, so a parent is found and updated in one step.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use ulid::Ulid;

/// Index path from the top-level timeline down to one tool entry.
pub type ToolPath = Vec<usize>;

/// Tool name whose failure means "waiting on the human", not a real error.
pub const ASK_USER_TOOL: &str = "AskUserQuestion";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Running,
    Success,
    Error,
    AwaitingAnswer,
    PermissionPending,
    PermissionDenied,
}

impl ToolStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ToolStatus::Success | ToolStatus::Error)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolState {
    pub name: String,
    #[serde(default)]
    pub input: Value,
    pub status: ToolStatus,
    #[serde(default)]
    pub output: Value,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub permission_request_id: Option<String>,
    #[serde(default)]
    pub permission_suggestions: Option<Value>,
    /// Raw `partial_json` fragments received so far.
    #[serde(default)]
    pub input_buffer: Option<String>,
}

impl ToolState {
    pub fn new(name: impl Into<String>, input: Value) -> Self {
        Self {
            name: name.into(),
            input,
            status: ToolStatus::Running,
            output: Value::Null,
            duration_ms: None,
            permission_request_id: None,
            permission_suggestions: None,
            input_buffer: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserEntry {
    pub id: String,
    pub timestamp: String,
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<String>,
    /// Local echo inserted before the agent confirmed the message.
    #[serde(default)]
    pub optimistic: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantEntry {
    pub id: String,
    pub timestamp: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub thinking: Option<String>,
    /// Placeholder for a subagent's in-progress stream; replaced on completion.
    #[serde(default)]
    pub synthetic: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolEntry {
    /// The upstream tool-use id.
    pub id: String,
    pub timestamp: String,
    pub tool: ToolState,
    #[serde(default)]
    pub sub_timeline: Vec<TimelineEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeparatorEntry {
    pub id: String,
    pub timestamp: String,
    #[serde(default)]
    pub trigger: String,
    #[serde(default)]
    pub pre_tokens: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandOutputEntry {
    pub id: String,
    pub timestamp: String,
    pub command: String,
    #[serde(default)]
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TimelineEntry {
    User(UserEntry),
    Assistant(AssistantEntry),
    Tool(ToolEntry),
    Separator(SeparatorEntry),
    CommandOutput(CommandOutputEntry),
}

impl TimelineEntry {
    pub fn id(&self) -> &str {
        match self {
            TimelineEntry::User(entry) => &entry.id,
            TimelineEntry::Assistant(entry) => &entry.id,
            TimelineEntry::Tool(entry) => &entry.id,
            TimelineEntry::Separator(entry) => &entry.id,
            TimelineEntry::CommandOutput(entry) => &entry.id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TimelineEntry::User(_) => "user",
            TimelineEntry::Assistant(_) => "assistant",
            TimelineEntry::Tool(_) => "tool",
            TimelineEntry::Separator(_) => "separator",
            TimelineEntry::CommandOutput(_) => "command_output",
        }
    }

    pub fn as_tool(&self) -> Option<&ToolEntry> {
        match self {
            TimelineEntry::Tool(tool) => Some(tool),
            _ => None,
        }
    }
}

pub fn new_entry_id(prefix: &str) -> String {
    format!("{}-{}", prefix, Ulid::new().to_string().to_lowercase())
}

/// Id of the synthetic streaming placeholder inside `parent_tool_use_id`'s sub-timeline.
pub fn placeholder_id(parent_tool_use_id: &str) -> String {
    format!("stream-{}", parent_tool_use_id)
}

/// Finds a tool by id: this level first, then every nested sub-timeline depth-first.
pub fn find_tool_path(timeline: &[TimelineEntry], tool_use_id: &str) -> Option<ToolPath> {
    find_tool_path_by(timeline, &|tool: &ToolEntry| tool.id == tool_use_id)
}

pub fn find_tool_path_by(
    timeline: &[TimelineEntry],
    predicate: &dyn Fn(&ToolEntry) -> bool,
) -> Option<ToolPath> {
    if let Some(index) = timeline
        .iter()
        .position(|entry| entry.as_tool().map(predicate).unwrap_or(false))
    {
        return Some(vec![index]);
    }

    for (index, entry) in timeline.iter().enumerate() {
        if let TimelineEntry::Tool(tool) = entry {
            if let Some(mut nested) = find_tool_path_by(&tool.sub_timeline, predicate) {
                nested.insert(0, index);
                return Some(nested);
            }
        }
    }

    None
}

/// Resolves a tool using the parent hint first, falling back to a full search.
///
/// The protocol sometimes omits or misstates the parent reference, so a miss
/// under the hinted parent is not final.
pub fn locate_tool(
    timeline: &[TimelineEntry],
    tool_use_id: &str,
    parent_hint: Option<&str>,
) -> Option<ToolPath> {
    if let Some(parent_id) = parent_hint {
        if let Some(parent_path) = find_tool_path(timeline, parent_id) {
            if let Some(parent) = tool_at(timeline, &parent_path) {
                if let Some(index) = parent
                    .sub_timeline
                    .iter()
                    .position(|entry| entry.as_tool().map(|t| t.id == tool_use_id).unwrap_or(false))
                {
                    let mut path = parent_path;
                    path.push(index);
                    return Some(path);
                }
            }
        }
    }

    find_tool_path(timeline, tool_use_id)
}

pub fn tool_at<'a>(timeline: &'a [TimelineEntry], path: &[usize]) -> Option<&'a ToolEntry> {
    let (first, rest) = path.split_first()?;
    match timeline.get(*first)? {
        TimelineEntry::Tool(tool) if rest.is_empty() => Some(tool),
        TimelineEntry::Tool(tool) => tool_at(&tool.sub_timeline, rest),
        _ => None,
    }
}

pub fn tool_at_mut<'a>(
    timeline: &'a mut [TimelineEntry],
    path: &[usize],
) -> Option<&'a mut ToolEntry> {
    let (first, rest) = path.split_first()?;
    match timeline.get_mut(*first)? {
        TimelineEntry::Tool(tool) => {
            if rest.is_empty() {
                Some(tool)
            } else {
                tool_at_mut(&mut tool.sub_timeline, rest)
            }
        }
        _ => None,
    }
}

/// Visits every tool entry at every depth.
pub fn walk_tools_mut(timeline: &mut [TimelineEntry], visit: &mut dyn FnMut(&mut ToolEntry)) {
    for entry in timeline.iter_mut() {
        if let TimelineEntry::Tool(tool) = entry {
            visit(tool);
            walk_tools_mut(&mut tool.sub_timeline, visit);
        }
    }
}

pub fn contains_tool(timeline: &[TimelineEntry], tool_use_id: &str) -> bool {
    find_tool_path(timeline, tool_use_id).is_some()
}

pub fn count_user_entries(timeline: &[TimelineEntry]) -> usize {
    timeline
        .iter()
        .filter(|entry| matches!(entry, TimelineEntry::User(_)))
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool(id: &str, children: Vec<TimelineEntry>) -> TimelineEntry {
        TimelineEntry::Tool(ToolEntry {
            id: id.to_string(),
            timestamp: "2026-02-01T00:00:00Z".to_string(),
            tool: ToolState::new("Task", json!({})),
            sub_timeline: children,
        })
    }

    fn user(text: &str) -> TimelineEntry {
        TimelineEntry::User(UserEntry {
            id: new_entry_id("user"),
            timestamp: "2026-02-01T00:00:00Z".to_string(),
            text: text.to_string(),
            attachments: Vec::new(),
            optimistic: false,
        })
    }

    #[test]
    fn finds_top_level_before_nested() {
        let timeline = vec![tool("a", vec![tool("b", Vec::new())]), tool("b", Vec::new())];
        assert_eq!(find_tool_path(&timeline, "b"), Some(vec![1]));
    }

    #[test]
    fn finds_deeply_nested_tool() {
        let timeline = vec![
            user("hi"),
            tool("a", vec![tool("b", vec![tool("c", Vec::new())])]),
        ];
        assert_eq!(find_tool_path(&timeline, "c"), Some(vec![1, 0, 0]));
        let entry = tool_at(&timeline, &[1, 0, 0]).expect("tool c");
        assert_eq!(entry.id, "c");
    }

    #[test]
    fn locate_falls_back_when_hint_is_wrong() {
        let timeline = vec![tool("a", Vec::new()), tool("x", vec![tool("b", Vec::new())])];
        assert_eq!(locate_tool(&timeline, "b", Some("a")), Some(vec![1, 0]));
        assert_eq!(locate_tool(&timeline, "b", Some("x")), Some(vec![1, 0]));
        assert_eq!(locate_tool(&timeline, "missing", Some("x")), None);
    }

    #[test]
    fn mutates_through_path() {
        let mut timeline = vec![tool("a", vec![tool("b", Vec::new())])];
        let path = find_tool_path(&timeline, "b").expect("path");
        tool_at_mut(&mut timeline, &path)
            .expect("tool b")
            .tool
            .status = ToolStatus::Success;
        assert_eq!(
            tool_at(&timeline, &path).expect("tool b").tool.status,
            ToolStatus::Success
        );
    }

    #[test]
    fn walk_visits_every_depth() {
        let mut timeline = vec![tool("a", vec![tool("b", vec![tool("c", Vec::new())])])];
        let mut seen = Vec::new();
        walk_tools_mut(&mut timeline, &mut |tool: &mut ToolEntry| {
            seen.push(tool.id.clone())
        });
        assert_eq!(seen, vec!["a", "b", "c"]);
    }

    #[test]
    fn entries_serialize_with_kind_tag() {
        let value = serde_json::to_value(user("hello")).expect("serialize");
        assert_eq!(value["kind"], "user");
        assert_eq!(value["text"], "hello");
    }
}
