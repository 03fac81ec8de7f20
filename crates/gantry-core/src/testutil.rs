use std::sync::Mutex;

use crate::host::{HostMessenger, MessageLevel};

/// Recording stand-in for the host engine's job-message callback.
pub struct RecordingMessenger {
    messages: Mutex<Vec<(MessageLevel, String)>>,
}

impl RecordingMessenger {
    pub fn new() -> Self {
        Self {
            messages: Mutex::new(Vec::new()),
        }
    }

    pub fn messages(&self) -> Vec<(MessageLevel, String)> {
        self.messages.lock().unwrap().clone()
    }
}

impl HostMessenger for RecordingMessenger {
    fn job_message(&self, level: MessageLevel, text: &str) {
        self.messages
            .lock()
            .unwrap()
            .push((level, text.to_string()));
    }
}
