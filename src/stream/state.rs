//! Per-connection state shared by every upstream transcoder.
//!
//! The state owns block numbering and the termination sequence so each
//! protocol variant only decides *what* happened upstream. Every method
//! appends to a caller-provided event buffer, in emission order.

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::protocol::canonical::{
    BlockDelta, BlockStart, CanonicalStreamEvent, StopReason, ToolCallMapping, Usage,
};
use crate::transform::trace::{TransformErrorKind, TransformTrace};
use crate::util::{generate_tool_use_id, next_message_id};

/// Metadata key set when the upstream closed without its completion marker.
pub const MISSING_UPSTREAM_COMPLETED: &str = "missingUpstreamCompleted";

/// How the upstream identifies a tool call across chunks.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ToolKey {
    /// Small integer slot (Chat Completions `tool_calls[].index`).
    Index(u32),
    /// Opaque identifier (Responses `item_id`, Gemini call id).
    Id(String),
}

#[derive(Debug, Default)]
struct ToolSlot {
    block_index: Option<usize>,
    id: Option<String>,
    name: Option<String>,
    arguments: String,
    emitted_len: usize,
    closed: bool,
}

/// Mutable transcoding state for one streaming response.
#[derive(Debug)]
pub struct TranscoderState {
    message_id: String,
    model: String,
    message_started: bool,
    text_open: bool,
    next_index: usize,
    tools: FxHashMap<ToolKey, ToolSlot>,
    /// Tool blocks started and not yet stopped, in index order.
    open_tools: SmallVec<[ToolKey; 4]>,
    stop_reason: Option<StopReason>,
    usage: Usage,
    saw_tool_call: bool,
    terminal: bool,
    tool_calls: ToolCallMapping,
}

impl TranscoderState {
    #[must_use]
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            message_id: next_message_id(),
            model: model.into(),
            message_started: false,
            text_open: false,
            next_index: 0,
            tools: FxHashMap::default(),
            open_tools: SmallVec::new(),
            stop_reason: None,
            usage: Usage::default(),
            saw_tool_call: false,
            terminal: false,
            tool_calls: ToolCallMapping::new(),
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    #[must_use]
    pub fn is_started(&self) -> bool {
        self.message_started
    }

    #[must_use]
    pub fn saw_tool_call(&self) -> bool {
        self.saw_tool_call
    }

    #[must_use]
    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stop_reason
    }

    #[must_use]
    pub fn usage(&self) -> &Usage {
        &self.usage
    }

    /// Calls recorded as their blocks closed.
    #[must_use]
    pub fn tool_calls(&self) -> &ToolCallMapping {
        &self.tool_calls
    }

    /// Accumulated arguments of a known call.
    #[must_use]
    pub fn tool_arguments(&self, key: &ToolKey) -> Option<&str> {
        self.tools.get(key).map(|slot| slot.arguments.as_str())
    }

    /// Client block index of a started call.
    #[must_use]
    pub fn tool_block_index(&self, key: &ToolKey) -> Option<usize> {
        self.tools.get(key).and_then(|slot| slot.block_index)
    }

    /// Whether `key` names a call whose block is still open or buffering.
    #[must_use]
    pub fn is_tool_pending(&self, key: &ToolKey) -> bool {
        self.tools.get(key).is_some_and(|slot| !slot.closed)
    }

    pub fn set_stop_reason(&mut self, stop: StopReason) {
        self.stop_reason = Some(stop);
    }

    pub fn set_model(&mut self, model: &str) {
        if !self.message_started && !model.is_empty() {
            self.model = model.to_string();
        }
    }

    pub fn merge_usage(&mut self, usage: &Usage) {
        self.usage.merge(usage);
    }

    /// Emit `message_start` and open text block 0, once.
    pub fn ensure_started(&mut self, out: &mut Vec<CanonicalStreamEvent>) {
        if self.message_started || self.terminal {
            return;
        }
        self.message_started = true;
        out.push(CanonicalStreamEvent::MessageStart {
            id: self.message_id.clone(),
            model: self.model.clone(),
            usage: self.usage,
        });
        out.push(CanonicalStreamEvent::ContentBlockStart {
            index: 0,
            block: BlockStart::Text,
        });
        self.text_open = true;
        self.next_index = 1;
    }

    pub fn push_text(&mut self, text: &str, out: &mut Vec<CanonicalStreamEvent>) {
        if self.terminal {
            return;
        }
        self.ensure_started(out);
        if text.is_empty() || !self.text_open {
            return;
        }
        out.push(CanonicalStreamEvent::ContentBlockDelta {
            index: 0,
            delta: BlockDelta::Text(text.to_string()),
        });
    }

    /// Apply one piece of an incrementally described tool call.
    ///
    /// The block start is held back until both `id` and `name` are known;
    /// argument fragments are appended verbatim and only the not yet
    /// emitted suffix is forwarded. A different `id` on a slot that already
    /// has one starts a new call on that slot after closing the old one.
    pub fn tool_fragment(
        &mut self,
        key: ToolKey,
        id: Option<&str>,
        name: Option<&str>,
        arguments: &str,
        trace: &mut TransformTrace,
        out: &mut Vec<CanonicalStreamEvent>,
    ) {
        if self.terminal {
            return;
        }
        self.ensure_started(out);

        let id = id.filter(|id| !id.is_empty());
        let name = name.filter(|name| !name.is_empty());
        let superseded = match (self.tools.get(&key), id) {
            (Some(slot), Some(new_id)) => slot.id.as_deref().is_some_and(|old| old != new_id),
            _ => false,
        };
        if superseded {
            self.close_tool(&key, true, trace, out);
            self.tools.remove(&key);
        }

        let slot = self.tools.entry(key.clone()).or_default();
        if slot.closed {
            tracing::debug!(?key, "dropping fragment for a closed tool call");
            return;
        }
        if slot.id.is_none() {
            slot.id = id.map(str::to_string);
        }
        if slot.name.is_none() {
            slot.name = name.map(str::to_string);
        }
        slot.arguments.push_str(arguments);
        self.flush_tool(&key, trace, out);
    }

    /// Replace a call's arguments with a complete JSON document and emit
    /// it whole as the next `partial_json` delta.
    pub fn tool_snapshot(
        &mut self,
        key: ToolKey,
        id: &str,
        name: &str,
        arguments_json: String,
        trace: &mut TransformTrace,
        out: &mut Vec<CanonicalStreamEvent>,
    ) {
        if self.terminal {
            return;
        }
        self.ensure_started(out);
        let slot = self.tools.entry(key.clone()).or_default();
        if slot.closed {
            return;
        }
        if slot.id.is_none() {
            slot.id = Some(id.to_string());
        }
        if slot.name.is_none() {
            slot.name = Some(name.to_string());
        }
        slot.arguments.clear();
        slot.emitted_len = 0;
        slot.arguments.push_str(&arguments_json);
        self.flush_tool(&key, trace, out);
    }

    /// Swap a call's buffered arguments for the complete `arguments`.
    ///
    /// Fragments already forwarded cannot be withdrawn, so the complete
    /// document is sent again as the next `partial_json` delta and the
    /// divergence is recorded in the trace.
    pub fn replace_tool_arguments(
        &mut self,
        key: &ToolKey,
        arguments: &str,
        trace: &mut TransformTrace,
        out: &mut Vec<CanonicalStreamEvent>,
    ) {
        if self.terminal {
            return;
        }
        let Some(slot) = self.tools.get_mut(key) else {
            return;
        };
        if slot.closed || slot.arguments == arguments {
            return;
        }
        let forwarded = slot.emitted_len;
        slot.arguments.clear();
        slot.arguments.push_str(arguments);
        slot.emitted_len = 0;
        if forwarded > 0 {
            trace.warn(format!(
                "Tool call arguments diverged after {forwarded} streamed bytes; resent complete arguments"
            ));
            trace.bump_metadata("toolArgumentsDiverged", 1);
            tracing::warn!(
                ?key,
                forwarded,
                complete = arguments.len(),
                "final tool arguments do not extend the streamed fragments"
            );
        }
        self.flush_tool(key, trace, out);
    }

    /// Start the block if it became startable, then forward unsent arguments.
    fn flush_tool(
        &mut self,
        key: &ToolKey,
        trace: &mut TransformTrace,
        out: &mut Vec<CanonicalStreamEvent>,
    ) {
        let Some(slot) = self.tools.get_mut(key) else {
            return;
        };
        if slot.block_index.is_none() {
            let (Some(id), Some(name)) = (slot.id.as_deref(), slot.name.as_deref()) else {
                return;
            };
            let index = self.next_index;
            self.next_index += 1;
            slot.block_index = Some(index);
            out.push(CanonicalStreamEvent::ContentBlockStart {
                index,
                block: BlockStart::ToolUse {
                    id: id.to_string(),
                    name: name.to_string(),
                },
            });
            self.open_tools.push(key.clone());
            self.saw_tool_call = true;
            trace.bump_metadata("toolCallCount", 1);
        }
        if let Some(index) = slot.block_index {
            if slot.arguments.len() > slot.emitted_len {
                out.push(CanonicalStreamEvent::ContentBlockDelta {
                    index,
                    delta: BlockDelta::PartialJson(slot.arguments[slot.emitted_len..].to_string()),
                });
                slot.emitted_len = slot.arguments.len();
            }
        }
    }

    /// Stop a tool block.
    ///
    /// With `boundary`, a `message_delta` carrying `tool_use` follows the
    /// stop. A call that never received an id gets a generated one; a call
    /// that never received a name is dropped with a warning.
    pub fn close_tool(
        &mut self,
        key: &ToolKey,
        boundary: bool,
        trace: &mut TransformTrace,
        out: &mut Vec<CanonicalStreamEvent>,
    ) {
        let Some(slot) = self.tools.get_mut(key) else {
            return;
        };
        if slot.closed {
            return;
        }
        if slot.block_index.is_none() {
            if slot.name.is_none() {
                slot.closed = true;
                trace.warn("Dropped tool call without a function name");
                tracing::warn!(?key, "dropping tool call that never received a name");
                return;
            }
            if slot.id.is_none() {
                slot.id = Some(generate_tool_use_id());
            }
        }
        self.flush_tool(key, trace, out);

        let Some(slot) = self.tools.get_mut(key) else {
            return;
        };
        slot.closed = true;
        if let Some(index) = slot.block_index {
            out.push(CanonicalStreamEvent::ContentBlockStop { index });
            if let (Some(id), Some(name)) = (slot.id.as_deref(), slot.name.as_deref()) {
                self.tool_calls.record_digest(id, name, slot.arguments.clone());
            }
        }
        self.open_tools.retain(|open| open != key);
        if boundary {
            out.push(CanonicalStreamEvent::MessageDelta {
                stop_reason: StopReason::ToolUse,
                usage: Some(self.usage),
            });
        }
    }

    /// Close any call still buffering or open, in start order.
    fn close_all_tools(&mut self, trace: &mut TransformTrace, out: &mut Vec<CanonicalStreamEvent>) {
        let open: SmallVec<[ToolKey; 4]> = self.open_tools.iter().cloned().collect();
        for key in &open {
            self.close_tool(key, false, trace, out);
        }
        let mut buffering: Vec<ToolKey> = self
            .tools
            .iter()
            .filter(|(_, slot)| !slot.closed)
            .map(|(key, _)| key.clone())
            .collect();
        buffering.sort_unstable();
        for key in &buffering {
            self.close_tool(key, false, trace, out);
        }
    }

    fn stop_text(&mut self, out: &mut Vec<CanonicalStreamEvent>) {
        if self.text_open {
            self.text_open = false;
            out.push(CanonicalStreamEvent::ContentBlockStop { index: 0 });
        }
    }

    /// Final stop reason: the recorded one, else `tool_use` when a call was seen.
    #[must_use]
    pub fn final_stop_reason(&self) -> StopReason {
        self.stop_reason.unwrap_or(if self.saw_tool_call {
            StopReason::ToolUse
        } else {
            StopReason::EndTurn
        })
    }

    /// Emit the terminating sequence.
    ///
    /// `completed` is whether the upstream sent its explicit completion
    /// marker; without it the stream still terminates but the trace records
    /// [`MISSING_UPSTREAM_COMPLETED`]. No-op once terminal.
    pub fn finish(
        &mut self,
        completed: bool,
        trace: &mut TransformTrace,
        out: &mut Vec<CanonicalStreamEvent>,
    ) {
        if self.terminal {
            return;
        }
        if !completed {
            trace.warn(MISSING_UPSTREAM_COMPLETED);
            trace.set_metadata(MISSING_UPSTREAM_COMPLETED, true);
            tracing::warn!(
                supplier = %trace.supplier_id,
                "upstream stream ended without a completion marker"
            );
        }
        self.ensure_started(out);
        self.close_all_tools(trace, out);
        self.stop_text(out);
        out.push(CanonicalStreamEvent::MessageDelta {
            stop_reason: self.final_stop_reason(),
            usage: Some(self.usage),
        });
        out.push(CanonicalStreamEvent::MessageStop);
        self.terminal = true;
    }

    /// Emit an `error` event and force termination without a final `message_delta`.
    pub fn fail(
        &mut self,
        message: &str,
        trace: &mut TransformTrace,
        out: &mut Vec<CanonicalStreamEvent>,
    ) {
        if self.terminal {
            return;
        }
        trace.error(TransformErrorKind::SseError, "transcode", message, None);
        tracing::warn!(supplier = %trace.supplier_id, error = message, "upstream stream failed");
        out.push(CanonicalStreamEvent::Error {
            message: message.to_string(),
        });
        if self.message_started {
            self.close_all_tools(trace, out);
            self.stop_text(out);
        }
        out.push(CanonicalStreamEvent::MessageStop);
        self.terminal = true;
    }
}
