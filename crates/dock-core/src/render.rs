//! Incremental terminal output of one agent reply.

use dock_protocol::MessageStatus;

use crate::dock::DockSnapshot;

/// What changed in the reply since the previous snapshot.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Progress {
    /// Newly revealed text.
    pub text: Option<String>,
    /// A tool started running.
    pub tool: Option<String>,
    /// The reply reached a terminal status.
    pub finished: Option<MessageStatus>,
}

/// Follows the reply at a fixed transcript position. Content only ever
/// grows by appending, so a byte offset is enough to know what is new.
pub struct ReplyPrinter {
    index: usize,
    printed: usize,
    tool: Option<String>,
}

impl ReplyPrinter {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            printed: 0,
            tool: None,
        }
    }

    pub fn update(&mut self, snapshot: &DockSnapshot) -> Progress {
        let mut progress = Progress::default();
        let Some(reply) = snapshot.transcript.get(self.index) else {
            return progress;
        };

        if let Some(new) = reply.content.get(self.printed..).filter(|s| !s.is_empty()) {
            progress.text = Some(new.to_string());
            self.printed = reply.content.len();
        }

        if snapshot.active_tool != self.tool {
            self.tool = snapshot.active_tool.clone();
            progress.tool = self.tool.clone();
        }

        progress.finished = reply.status.filter(|s| s.is_terminal());
        progress
    }
}
