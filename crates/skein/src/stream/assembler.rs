//! Per-session streaming state machine.
//!
//! States: `Idle -> Streaming -> Done`. Completion is terminal per run; a
//! chunk arriving after `done` starts a fresh run with an empty buffer. The
//! assembler owns the only open (non-done) assistant message for its session.

use serde_json::Value;
use tracing::debug;
use uuid::Uuid;

use skein_protocol::{CanonMessage, StreamEvent};

/// Phase of the current run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamPhase {
    #[default]
    Idle,
    Streaming,
    Done,
}

/// Mutable per-session buffer exposed to the merger.
#[derive(Debug, Clone, Default)]
pub struct StreamingState {
    pub phase: StreamPhase,
    /// Accumulated assistant text for the current run.
    pub text: String,
    /// Accumulated thinking text for the current run.
    pub thinking: String,
    /// Identifier of the current run, assigned when the run starts.
    pub run_id: Option<String>,
    /// Names of tool calls seen during the current run.
    pub open_tools: Vec<String>,
    /// Rough token count, `ceil(chunk_len / 4)` per appended chunk.
    pub token_estimate: u64,
    /// Monotonically increasing event counter. Lets the merger detect change
    /// without deep content comparison.
    pub last_event_at: u64,
    /// Completion label once the run is done.
    pub done_label: Option<String>,
}

/// Side output of applying one event.
#[derive(Debug, Clone)]
pub enum AssemblerOutput {
    /// A standalone tool-call message to append to the transcript.
    ToolCall(CanonMessage),
    /// The run completed. `message` is the finalized assistant message, if
    /// any text was accumulated; `state` is `error`/`aborted`/None.
    Finalized {
        message: Option<CanonMessage>,
        state: Option<String>,
    },
}

/// Folds `chunk` / `tool` / `done` events into the streaming buffer.
#[derive(Debug)]
pub struct StreamAssembler {
    state: StreamingState,
    args_truncate: usize,
}

impl StreamAssembler {
    pub fn new(args_truncate: usize) -> Self {
        Self {
            state: StreamingState::default(),
            args_truncate,
        }
    }

    pub fn state(&self) -> &StreamingState {
        &self.state
    }

    pub fn phase(&self) -> StreamPhase {
        self.state.phase
    }

    /// The current in-progress assistant message, if the run has produced
    /// text and is not finalized yet.
    pub fn open_message(&self) -> Option<CanonMessage> {
        if self.state.phase != StreamPhase::Streaming || self.state.text.is_empty() {
            return None;
        }
        Some(CanonMessage::assistant(self.state.text.clone()))
    }

    /// Drop all buffered state and return to `Idle`.
    pub fn clear(&mut self) {
        let last_event_at = self.state.last_event_at;
        self.state = StreamingState {
            last_event_at,
            ..StreamingState::default()
        };
    }

    /// End the current run after a transport drop. The partial buffer is
    /// discarded; the snapshot is the authority on what the run actually
    /// produced. No-op unless a run is in progress.
    pub fn interrupt(&mut self) {
        if self.state.phase != StreamPhase::Streaming {
            return;
        }
        debug!(run = ?self.state.run_id, "run interrupted, discarding partial buffer");
        self.clear();
        self.state.last_event_at += 1;
        self.state.phase = StreamPhase::Done;
        self.state.done_label = Some("Interrupted".to_string());
    }

    /// Apply one stream event. `user_message` / `message` frames are not the
    /// assembler's concern and are ignored here.
    pub fn apply(&mut self, event: &StreamEvent) -> Option<AssemblerOutput> {
        match event {
            StreamEvent::Chunk {
                text,
                full_replace,
                thinking,
                ..
            } => {
                self.begin_run_if_needed();
                self.state.last_event_at += 1;
                if *thinking {
                    if *full_replace {
                        self.state.thinking = text.clone();
                    } else {
                        self.state.thinking.push_str(text);
                    }
                } else if *full_replace {
                    // Full replacement does not double-count tokens.
                    self.state.text = text.clone();
                } else {
                    self.state.text.push_str(text);
                    self.state.token_estimate += text.len().div_ceil(4) as u64;
                }
                None
            }
            StreamEvent::Tool { name, args, .. } => {
                self.begin_run_if_needed();
                self.state.last_event_at += 1;
                self.state.open_tools.push(name.clone());
                Some(AssemblerOutput::ToolCall(self.tool_message(name, args)))
            }
            StreamEvent::Done {
                state,
                error_message,
                ..
            } => {
                self.state.last_event_at += 1;
                let label = completion_label(state.as_deref(), error_message.as_deref());
                debug!(run = ?self.state.run_id, label = %label, "run finalized");

                let message = if self.state.text.is_empty() {
                    None
                } else {
                    let mut msg = CanonMessage::assistant(self.state.text.clone());
                    msg.done = true;
                    Some(msg)
                };

                self.state.phase = StreamPhase::Done;
                self.state.done_label = Some(label);
                Some(AssemblerOutput::Finalized {
                    message,
                    state: state.clone(),
                })
            }
            StreamEvent::UserMessage { .. } | StreamEvent::Message { .. } => None,
        }
    }

    fn begin_run_if_needed(&mut self) {
        match self.state.phase {
            StreamPhase::Streaming => {}
            StreamPhase::Idle => {
                self.state.phase = StreamPhase::Streaming;
                self.state.run_id = Some(Uuid::new_v4().simple().to_string());
            }
            StreamPhase::Done => {
                // Completion is terminal per run; a new event starts over.
                self.clear();
                self.state.phase = StreamPhase::Streaming;
                self.state.run_id = Some(Uuid::new_v4().simple().to_string());
            }
        }
    }

    /// Render a tool call as `name(truncated_args)`. Unserializable args
    /// degrade to `name()`.
    fn tool_message(&self, name: &str, args: &Option<Value>) -> CanonMessage {
        let rendered_args = args
            .as_ref()
            .filter(|v| !v.is_null())
            .and_then(|v| serde_json::to_string(v).ok())
            .map(|s| truncate(&s, self.args_truncate))
            .unwrap_or_default();

        CanonMessage {
            role: skein_protocol::MessageRole::Tool,
            text: format!("{name}({rendered_args})"),
            client_id: None,
            optimistic_id: None,
            attachments: Vec::new(),
            timestamp_ms: None,
            done: true,
        }
    }
}

fn completion_label(state: Option<&str>, error_message: Option<&str>) -> String {
    match state {
        Some("error") => match error_message {
            Some(msg) => format!("Error: {msg}"),
            None => "Error".to_string(),
        },
        Some("aborted") => "Aborted".to_string(),
        _ => "Done".to_string(),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{cut}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chunk(text: &str, full_replace: bool) -> StreamEvent {
        StreamEvent::Chunk {
            session_key: None,
            text: text.to_string(),
            full_replace,
            thinking: false,
        }
    }

    fn thinking(text: &str) -> StreamEvent {
        StreamEvent::Chunk {
            session_key: None,
            text: text.to_string(),
            full_replace: false,
            thinking: true,
        }
    }

    #[test]
    fn test_append_then_full_replace() {
        let mut asm = StreamAssembler::new(120);
        asm.apply(&chunk("He", false));
        asm.apply(&chunk("llo", false));
        asm.apply(&chunk(" world", false));
        assert_eq!(asm.state().text, "Hello world");
        assert_eq!(asm.phase(), StreamPhase::Streaming);

        asm.apply(&chunk("Restarted", true));
        assert_eq!(asm.state().text, "Restarted");
    }

    #[test]
    fn test_thinking_accumulates_separately() {
        let mut asm = StreamAssembler::new(120);
        asm.apply(&thinking("considering "));
        asm.apply(&thinking("the options"));
        asm.apply(&chunk("The answer", false));

        assert_eq!(asm.state().thinking, "considering the options");
        assert_eq!(asm.state().text, "The answer");
        // Thinking deltas do not count toward the visible-text estimate.
        assert_eq!(asm.state().token_estimate, 3);
        // And never surface as the open message.
        assert_eq!(asm.open_message().unwrap().text, "The answer");
    }

    #[test]
    fn test_token_estimate_append_only() {
        let mut asm = StreamAssembler::new(120);
        asm.apply(&chunk("abcd", false)); // ceil(4/4) = 1
        asm.apply(&chunk("efghi", false)); // ceil(5/4) = 2
        assert_eq!(asm.state().token_estimate, 3);

        // Full replace must not double-count.
        asm.apply(&chunk("whole new text", true));
        assert_eq!(asm.state().token_estimate, 3);
    }

    #[test]
    fn test_last_event_at_is_monotonic() {
        let mut asm = StreamAssembler::new(120);
        let before = asm.state().last_event_at;
        asm.apply(&chunk("a", false));
        asm.apply(&chunk("b", false));
        assert_eq!(asm.state().last_event_at, before + 2);
    }

    #[test]
    fn test_done_finalizes_and_new_run_restarts() {
        let mut asm = StreamAssembler::new(120);
        asm.apply(&chunk("answer", false));

        let output = asm.apply(&StreamEvent::Done {
            session_key: None,
            state: None,
            error_message: None,
        });
        match output {
            Some(AssemblerOutput::Finalized { message, state }) => {
                let msg = message.unwrap();
                assert_eq!(msg.text, "answer");
                assert!(msg.done);
                assert!(state.is_none());
            }
            other => panic!("Expected finalized, got {:?}", other),
        }
        assert_eq!(asm.phase(), StreamPhase::Done);
        assert_eq!(asm.state().done_label.as_deref(), Some("Done"));

        // A chunk after done starts a fresh run with an empty buffer.
        let old_run = asm.state().run_id.clone();
        asm.apply(&chunk("next", false));
        assert_eq!(asm.phase(), StreamPhase::Streaming);
        assert_eq!(asm.state().text, "next");
        assert_ne!(asm.state().run_id, old_run);
    }

    #[test]
    fn test_done_labels() {
        assert_eq!(completion_label(Some("error"), Some("boom")), "Error: boom");
        assert_eq!(completion_label(Some("error"), None), "Error");
        assert_eq!(completion_label(Some("aborted"), None), "Aborted");
        assert_eq!(completion_label(None, None), "Done");
        assert_eq!(completion_label(Some("finished"), None), "Done");
    }

    #[test]
    fn test_tool_call_rendering_and_truncation() {
        let mut asm = StreamAssembler::new(10);
        let output = asm.apply(&StreamEvent::Tool {
            session_key: None,
            name: "search".to_string(),
            args: Some(json!({"query": "a very long query string"})),
        });
        match output {
            Some(AssemblerOutput::ToolCall(msg)) => {
                assert!(msg.text.starts_with("search({\"query\""));
                assert!(msg.text.contains("..."));
            }
            other => panic!("Expected tool call, got {:?}", other),
        }
        assert_eq!(asm.state().open_tools, vec!["search".to_string()]);

        // Null args degrade to name().
        let output = asm.apply(&StreamEvent::Tool {
            session_key: None,
            name: "ls".to_string(),
            args: None,
        });
        match output {
            Some(AssemblerOutput::ToolCall(msg)) => assert_eq!(msg.text, "ls()"),
            other => panic!("Expected tool call, got {:?}", other),
        }
    }

    #[test]
    fn test_interrupt_ends_run_and_discards_partial() {
        let mut asm = StreamAssembler::new(120);
        asm.apply(&chunk("half an ans", false));
        assert_eq!(asm.phase(), StreamPhase::Streaming);

        asm.interrupt();
        assert_eq!(asm.phase(), StreamPhase::Done);
        assert_eq!(asm.state().done_label.as_deref(), Some("Interrupted"));
        assert!(asm.open_message().is_none());
        assert!(asm.state().text.is_empty());

        // Reconnecting starts a clean run.
        asm.apply(&chunk("fresh", false));
        assert_eq!(asm.phase(), StreamPhase::Streaming);
        assert_eq!(asm.state().text, "fresh");

        // Outside a run it does nothing.
        let mut idle = StreamAssembler::new(120);
        idle.interrupt();
        assert_eq!(idle.phase(), StreamPhase::Idle);
    }

    #[test]
    fn test_open_message_only_while_streaming() {
        let mut asm = StreamAssembler::new(120);
        assert!(asm.open_message().is_none());

        asm.apply(&chunk("partial", false));
        assert_eq!(asm.open_message().unwrap().text, "partial");

        asm.apply(&StreamEvent::Done {
            session_key: None,
            state: None,
            error_message: None,
        });
        assert!(asm.open_message().is_none());
    }
}
