//! Accumulates raw lines into complete messages.
//!
//! Single-line messages complete on the line that carries them. Room maps (`M:`) may be split
//! into numbered parts whose base64 payloads are concatenated before decoding. Any error leaves
//! the processor in an unspecified state; callers `reset()` and keep reading.

use crate::protocol::message::{Message, MetadataMessage, UnprocessableMessage, split_metadata_header, split_tag};
use log::debug;

#[derive(Debug)]
struct PendingParts {
    tag: char,
    count: usize,
    parts: Vec<String>,
}

#[derive(Debug, Default)]
pub struct MessageProcessor {
    pending: Option<PendingParts>,
    ready: Option<Message>,
}

impl MessageProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_line(&mut self, raw: &str) -> Result<(), UnprocessableMessage> {
        let line = raw.trim_end();
        let (tag, body) = split_tag(line).ok_or_else(|| UnprocessableMessage::UnrecognisedLine(line.to_string()))?;

        if let Some(pending) = &self.pending
            && pending.tag != tag
        {
            debug!(
                "Dropping incomplete {}: message ({} of {} parts); '{}' arrived first",
                pending.tag,
                pending.parts.len(),
                pending.count,
                line
            );
            self.pending = None;
        }

        if tag == 'M' {
            return self.add_metadata_part(body);
        }
        self.ready = Some(Message::parse(tag, body)?);
        Ok(())
    }

    fn add_metadata_part(&mut self, body: &str) -> Result<(), UnprocessableMessage> {
        let (index, count, data) = split_metadata_header(body)?;
        let pending = self.pending.get_or_insert_with(|| PendingParts {
            tag: 'M',
            count,
            parts: Vec::with_capacity(count),
        });
        if index != pending.parts.len() || count != pending.count {
            return Err(UnprocessableMessage::Malformed {
                tag: 'M',
                reason: format!(
                    "got part {} of {}, expected part {} of {}",
                    index,
                    count,
                    pending.parts.len(),
                    pending.count
                ),
            });
        }
        pending.parts.push(data.trim().to_string());

        if pending.parts.len() == pending.count {
            let joined = pending.parts.concat();
            self.pending = None;
            self.ready = Some(Message::Metadata(MetadataMessage::decode_base64(&joined)?));
        }
        Ok(())
    }

    pub fn is_message_available(&self) -> bool {
        self.ready.is_some()
    }

    pub fn pull(&mut self) -> Option<Message> {
        self.ready.take()
    }

    pub fn reset(&mut self) {
        self.pending = None;
        self.ready = None;
    }
}
