//! Framing of generated text as a server-sent event stream.
//!
//! Output is released one whitespace-delimited segment at a time. Each
//! segment keeps the whitespace that follows it, so concatenating every
//! streamed segment reproduces the non-streamed text byte for byte. Every
//! stream ends with exactly one `[DONE]` event.

use axum::response::sse::Event;
use serde::Serialize;
use serde_json::json;

use crate::error::ServiceError;
use crate::protocol::{ChatCompletionChunk, ChatDelta, ChunkChoice, TextChunk};

pub const DONE_SENTINEL: &str = "[DONE]";

/// Splits text into whitespace-delimited segments, whitespace preserved.
pub fn segments(text: &str) -> Segments<'_> {
    Segments { rest: text }
}

pub struct Segments<'a> {
    rest: &'a str,
}

impl<'a> Iterator for Segments<'a> {
    type Item = &'a str;

    fn next(&mut self) -> Option<&'a str> {
        if self.rest.is_empty() {
            return None;
        }
        let len = self.rest.len();
        let word_start = self
            .rest
            .find(|c: char| !c.is_whitespace())
            .unwrap_or(len);
        let word_end = self.rest[word_start..]
            .find(char::is_whitespace)
            .map_or(len, |i| word_start + i);
        let end = self.rest[word_end..]
            .find(|c: char| !c.is_whitespace())
            .map_or(len, |i| word_end + i);

        let (segment, rest) = self.rest.split_at(end);
        self.rest = rest;
        Some(segment)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Chunk(String),
    Error(String),
    Done,
}

impl StreamEvent {
    pub fn data(&self) -> &str {
        match self {
            StreamEvent::Chunk(payload) | StreamEvent::Error(payload) => payload,
            StreamEvent::Done => DONE_SENTINEL,
        }
    }
}

impl From<StreamEvent> for Event {
    fn from(event: StreamEvent) -> Self {
        Event::default().data(event.data())
    }
}

/// Envelope shape of the chunk events.
#[derive(Debug, Clone)]
pub enum Framing {
    /// `{"text": <segment>}` for `/v1/generate`.
    Text,
    /// `chat.completion.chunk` objects for `/v1/chat/completions`.
    ChatDelta {
        id: String,
        created: i64,
        model: String,
    },
}

pub struct StreamEncoder {
    framing: Framing,
    role_sent: bool,
}

impl StreamEncoder {
    pub fn new(framing: Framing) -> Self {
        Self {
            framing,
            role_sent: false,
        }
    }

    pub fn chunk(&mut self, segment: &str) -> StreamEvent {
        let event = match &self.framing {
            Framing::Text => encode(&TextChunk {
                text: segment.to_string(),
            }),
            Framing::ChatDelta { id, created, model } => encode(&ChatCompletionChunk {
                id,
                object: "chat.completion.chunk",
                created: *created,
                model,
                choices: [ChunkChoice {
                    index: 0,
                    delta: ChatDelta {
                        role: (!self.role_sent).then_some("assistant"),
                        content: segment,
                    },
                    finish_reason: None,
                }],
            }),
        };
        self.role_sent = true;
        event
    }

    pub fn error(&self, err: &ServiceError) -> StreamEvent {
        StreamEvent::Error(err.body().to_string())
    }

    pub fn finish(&self) -> StreamEvent {
        StreamEvent::Done
    }
}

fn encode<T: Serialize>(payload: &T) -> StreamEvent {
    match serde_json::to_string(payload) {
        Ok(json) => StreamEvent::Chunk(json),
        Err(err) => StreamEvent::Error(
            json!({ "error": { "message": err.to_string(), "type": "encoding", "param": null } })
                .to_string(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;

    fn encode_all<'a>(
        mut encoder: StreamEncoder,
        segments: impl IntoIterator<Item = &'a str>,
    ) -> Vec<StreamEvent> {
        let mut events: Vec<StreamEvent> =
            segments.into_iter().map(|s| encoder.chunk(s)).collect();
        events.push(encoder.finish());
        events
    }

    fn frame(event: &StreamEvent) -> String {
        format!("data: {}\n\n", event.data())
    }

    fn chat_framing() -> Framing {
        Framing::ChatDelta {
            id: "chatcmpl-test".into(),
            created: 1_700_000_000,
            model: "tiny".into(),
        }
    }

    #[test]
    fn segments_keep_trailing_whitespace() {
        let parts: Vec<_> = segments("This is  a mock\nresponse.").collect();
        assert_eq!(parts, vec!["This ", "is  ", "a ", "mock\n", "response."]);
        assert_eq!(parts.concat(), "This is  a mock\nresponse.");
    }

    #[test]
    fn leading_whitespace_joins_first_segment() {
        let parts: Vec<_> = segments("  fn main() {}").collect();
        assert_eq!(parts, vec!["  fn ", "main() ", "{}"]);
    }

    #[test]
    fn empty_and_blank_text() {
        assert_eq!(segments("").count(), 0);
        assert_eq!(segments(" \n ").collect::<Vec<_>>(), vec![" \n "]);
    }

    #[test]
    fn empty_stream_is_only_the_sentinel() {
        let events = encode_all(StreamEncoder::new(Framing::Text), segments(""));
        assert_eq!(events, vec![StreamEvent::Done]);
        assert_eq!(frame(&events[0]), "data: [DONE]\n\n");
    }

    #[test]
    fn text_framing_one_event_per_segment() {
        let events = encode_all(StreamEncoder::new(Framing::Text), segments("a b c"));
        assert_eq!(events.len(), 4);
        assert_eq!(frame(&events[0]), "data: {\"text\":\"a \"}\n\n");
        let terminal = events.iter().filter(|e| **e == StreamEvent::Done).count();
        assert_eq!(terminal, 1);
        assert_eq!(events.last(), Some(&StreamEvent::Done));
    }

    #[test]
    fn chat_framing_announces_role_once() {
        let events = encode_all(StreamEncoder::new(chat_framing()), segments("Hi there"));
        let first: Value = serde_json::from_str(events[0].data()).unwrap();
        let second: Value = serde_json::from_str(events[1].data()).unwrap();

        assert_eq!(first["object"], "chat.completion.chunk");
        assert_eq!(first["id"], "chatcmpl-test");
        assert_eq!(first["choices"][0]["delta"]["role"], "assistant");
        assert_eq!(first["choices"][0]["delta"]["content"], "Hi ");
        assert!(first["choices"][0]["finish_reason"].is_null());
        assert!(second["choices"][0]["delta"].get("role").is_none());
        assert_eq!(second["choices"][0]["delta"]["content"], "there");
        assert_eq!(events[2], StreamEvent::Done);
    }

    #[test]
    fn each_chat_stream_announces_its_own_role() {
        let mut first = StreamEncoder::new(chat_framing());
        for word in ["a ", "b ", "c"] {
            first.chunk(word);
        }
        let later: Value = serde_json::from_str(first.chunk("d").data()).unwrap();
        assert!(later["choices"][0]["delta"].get("role").is_none());

        let mut second = StreamEncoder::new(chat_framing());
        let opening: Value = serde_json::from_str(second.chunk("x").data()).unwrap();
        assert_eq!(opening["choices"][0]["delta"]["role"], "assistant");
    }
}
