use std::collections::VecDeque;

use heron_common::error::HeronResult;

use crate::codec::{BackendMessage, FrontendMessage};
use crate::messenger::Messenger;

/// In-memory messenger: records what is sent, replays a fixed inbox.
#[derive(Default)]
pub struct Capture {
    pub sent: Vec<BackendMessage>,
    pub inbox: VecDeque<FrontendMessage>,
    pub flushes: usize,
}

impl Capture {
    pub fn with_inbox(inbox: Vec<FrontendMessage>) -> Self {
        Self {
            inbox: inbox.into(),
            ..Self::default()
        }
    }
}

impl Messenger for Capture {
    fn send(&mut self, msg: &BackendMessage) -> HeronResult<()> {
        self.sent.push(msg.clone());
        Ok(())
    }

    fn flush(&mut self) -> HeronResult<()> {
        self.flushes += 1;
        Ok(())
    }

    fn recv(&mut self) -> HeronResult<Option<FrontendMessage>> {
        Ok(self.inbox.pop_front())
    }
}
