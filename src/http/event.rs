//! Server-Sent Events.
//!
//! [`EventParser`] turns decoded `text/event-stream` body bytes into
//! [`Event`] records. Lines end in `\n`, `\r\n` or `\r`; blocks end on a blank
//! line. The last event id and the retry interval outlive individual blocks
//! and reconnects, so a resumed stream can send `Last-Event-Id`.

use std::collections::VecDeque;

/// One dispatched event block.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct Event {
    pub id: String,
    pub name: String,
    pub data: String,
}

#[derive(Debug, Default)]
pub struct EventParser {
    line: Vec<u8>,
    after_cr: bool,
    name: String,
    data: String,
    has_data: bool,
    leid: String,
    retry: Option<u64>,
    events: VecDeque<Event>,
}

impl EventParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last event id seen; empty when none.
    pub fn leid(&self) -> &str {
        &self.leid
    }

    /// Reconnect interval in milliseconds, once the stream has sent one.
    pub fn retry(&self) -> Option<u64> {
        self.retry
    }

    /// Drops any half-received block. The last event id and retry interval
    /// are kept.
    pub fn reset_block(&mut self) {
        self.line.clear();
        self.after_cr = false;
        self.name.clear();
        self.data.clear();
        self.has_data = false;
    }

    /// Feeds decoded body bytes.
    pub fn feed(&mut self, bytes: &[u8]) {
        for &b in bytes {
            match b {
                b'\n' if self.after_cr => self.after_cr = false,
                b'\n' => self.end_line(),
                b'\r' => {
                    self.end_line();
                    self.after_cr = true;
                }
                _ => {
                    self.after_cr = false;
                    self.line.push(b);
                }
            }
        }
    }

    pub fn has_events(&self) -> bool {
        !self.events.is_empty()
    }

    /// Takes every dispatched event, oldest first.
    pub fn drain(&mut self) -> impl Iterator<Item = Event> + '_ {
        self.events.drain(..)
    }

    fn end_line(&mut self) {
        let line = std::mem::take(&mut self.line);
        if line.is_empty() {
            self.dispatch();
            return;
        }
        if line[0] == b':' {
            return;
        }

        let line = String::from_utf8_lossy(&line);
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line.as_ref(), ""),
        };

        match field {
            "data" => {
                if self.has_data {
                    self.data.push('\n');
                }
                self.data.push_str(value);
                self.has_data = true;
            }
            "event" => self.name = value.to_string(),
            "id" => {
                if !value.contains('\0') {
                    self.leid = value.to_string();
                }
            }
            "retry" => {
                if let Ok(retry) = value.parse::<u64>() {
                    self.retry = Some(retry);
                }
            }
            _ => {}
        }
    }

    fn dispatch(&mut self) {
        if self.has_data {
            self.events.push_back(Event {
                id: self.leid.clone(),
                name: std::mem::take(&mut self.name),
                data: std::mem::take(&mut self.data),
            });
        }
        self.name.clear();
        self.data.clear();
        self.has_data = false;
    }
}
