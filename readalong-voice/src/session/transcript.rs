use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    User,
    Agent,
}

/// One line of the conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub text: String,
    pub speaker: Speaker,
    pub timestamp: DateTime<Utc>,
}

/// Agent text gathered for one conversation item
#[derive(Debug, Default)]
struct AgentItem {
    buffer: String,
    /// Index of the entry this item was committed to
    entry: Option<usize>,
    finalized: bool,
}

#[derive(Debug, Default)]
struct LogState {
    entries: Vec<TranscriptEntry>,
    items: HashMap<String, AgentItem>,
    /// Item ids in arrival order, for commits at response end
    order: Vec<String>,
}

/// Transcript of a session
///
/// User transcripts arrive whole. Agent transcripts are keyed by item id:
/// deltas accumulate per item and the final transcript for an item is
/// authoritative, replacing whatever the deltas produced. An item committed
/// at response end keeps its entry, so a late final transcript corrects the
/// text in place instead of appending a second line. Deltas arriving after
/// the final transcript are ignored.
#[derive(Debug, Default)]
pub struct TranscriptLog {
    state: Mutex<LogState>,
}

impl TranscriptLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_user(&self, text: &str) {
        let mut state = self.lock();
        push_entry(&mut state.entries, text, Speaker::User);
    }

    /// Incremental agent text for `item_id`
    pub fn agent_delta(&self, item_id: &str, delta: &str) {
        let mut state = self.lock();
        let state = &mut *state;
        let item = item_entry(&mut state.items, &mut state.order, item_id);
        if item.finalized {
            return;
        }
        item.buffer.push_str(delta);
        if let Some(index) = item.entry {
            let text = item.buffer.trim();
            if let (Some(entry), false) = (state.entries.get_mut(index), text.is_empty()) {
                entry.text = text.to_string();
            }
        }
    }

    /// Final agent text for `item_id`
    pub fn agent_done(&self, item_id: &str, transcript: &str) {
        let mut state = self.lock();
        let state = &mut *state;
        let item = item_entry(&mut state.items, &mut state.order, item_id);
        item.finalized = true;
        item.buffer = transcript.to_string();

        let text = transcript.trim();
        match item.entry {
            Some(index) if !text.is_empty() => {
                if let Some(entry) = state.entries.get_mut(index) {
                    entry.text = text.to_string();
                }
            }
            Some(_) => {}
            None => item.entry = push_entry(&mut state.entries, text, Speaker::Agent),
        }
    }

    /// Commit agent text still buffered at response end
    pub fn commit_agent(&self) {
        let mut state = self.lock();
        let state = &mut *state;
        for item_id in &state.order {
            if let Some(item) = state.items.get_mut(item_id) {
                if item.entry.is_none() {
                    item.entry = push_entry(&mut state.entries, &item.buffer, Speaker::Agent);
                }
            }
        }
    }

    pub fn entries(&self) -> Vec<TranscriptEntry> {
        self.lock().entries.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, LogState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn item_entry<'a>(
    items: &'a mut HashMap<String, AgentItem>,
    order: &mut Vec<String>,
    item_id: &str,
) -> &'a mut AgentItem {
    if !items.contains_key(item_id) {
        order.push(item_id.to_string());
    }
    items.entry(item_id.to_string()).or_default()
}

/// Appends trimmed, non-blank text and returns its index
fn push_entry(entries: &mut Vec<TranscriptEntry>, text: &str, speaker: Speaker) -> Option<usize> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    entries.push(TranscriptEntry {
        text: trimmed.to_string(),
        speaker,
        timestamp: Utc::now(),
    });
    Some(entries.len() - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texts(log: &TranscriptLog) -> Vec<String> {
        log.entries().into_iter().map(|e| e.text).collect()
    }

    #[test]
    fn test_agent_deltas_commit_once() {
        let log = TranscriptLog::new();
        log.agent_delta("item_1", "Let's ");
        log.agent_delta("item_1", "read!");
        log.agent_done("item_1", "Let's read!");
        log.commit_agent();

        let entries = log.entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].text, "Let's read!");
        assert_eq!(entries[0].speaker, Speaker::Agent);
    }

    #[test]
    fn test_done_without_deltas_commits_immediately() {
        let log = TranscriptLog::new();
        log.record_user("the cat sat");
        log.agent_done("item_1", "Great job!");
        log.commit_agent();

        let speakers: Vec<Speaker> = log.entries().iter().map(|e| e.speaker).collect();
        assert_eq!(speakers, vec![Speaker::User, Speaker::Agent]);
    }

    #[test]
    fn test_full_text_after_response_end_is_not_duplicated() {
        let log = TranscriptLog::new();
        log.agent_delta("item_1", "Great ");
        log.agent_delta("item_1", "reading!");
        log.commit_agent();
        log.agent_done("item_1", "Great reading!");
        log.commit_agent();
        assert_eq!(texts(&log), vec!["Great reading!"]);

        log.agent_done("item_2", "Again?");
        log.commit_agent();
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn test_late_delta_after_commit_then_done_keeps_one_entry() {
        let log = TranscriptLog::new();
        log.agent_delta("item_1", "Hola");
        log.commit_agent();
        log.agent_delta("item_1", " amigo");
        assert_eq!(texts(&log), vec!["Hola amigo"]);

        log.agent_done("item_1", "Hola amigo");
        log.commit_agent();
        assert_eq!(texts(&log), vec!["Hola amigo"]);
    }

    #[test]
    fn test_done_text_differing_in_whitespace_replaces_deltas() {
        let log = TranscriptLog::new();
        log.agent_delta("item_1", "Hola");
        log.agent_delta("item_1", "amigo");
        log.commit_agent();
        log.agent_done("item_1", "Hola amigo");

        assert_eq!(texts(&log), vec!["Hola amigo"]);
    }

    #[test]
    fn test_deltas_after_done_are_ignored() {
        let log = TranscriptLog::new();
        log.agent_done("item_1", "¡Muy bien!");
        log.agent_delta("item_1", " extra");
        log.commit_agent();

        assert_eq!(texts(&log), vec!["¡Muy bien!"]);
    }

    #[test]
    fn test_items_keep_arrival_order() {
        let log = TranscriptLog::new();
        log.agent_delta("item_a", "First.");
        log.record_user("ok");
        log.agent_delta("item_b", "Second.");
        log.commit_agent();

        assert_eq!(texts(&log), vec!["ok", "First.", "Second."]);
    }

    #[test]
    fn test_blank_text_is_skipped() {
        let log = TranscriptLog::new();
        log.record_user("  ");
        log.agent_delta("item_1", " ");
        log.commit_agent();
        assert!(log.is_empty());
    }
}
