use bytes::{BufMut, BytesMut};

/// A parsed server-sent event. Only the fields the gateway cares about are
/// retained; comments and ids are dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
	pub event: Option<String>,
	pub data: String,
}

impl SseEvent {
	pub fn is_done(&self) -> bool {
		self.data.trim() == "[DONE]"
	}
}

/// Incremental SSE scanner. ext_proc delivers response bodies at arbitrary
/// chunk boundaries, so a partial line must survive until the next frame.
#[derive(Debug, Default)]
pub struct SseParser {
	buf: BytesMut,
	event: Option<String>,
	data: Vec<String>,
}

impl SseParser {
	pub fn new() -> Self {
		Self::default()
	}

	/// Feeds one body chunk and returns every event completed by it.
	pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
		self.buf.put_slice(chunk);
		let mut events = Vec::new();
		while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
			let line = self.buf.split_to(pos + 1);
			let line = trim_line(&line);
			if line.is_empty() {
				if let Some(ev) = self.flush() {
					events.push(ev);
				}
				continue;
			}
			if let Some(rest) = strip_field(line, "data:") {
				self.data.push(rest.to_string());
			} else if let Some(rest) = strip_field(line, "event:") {
				self.event = Some(rest.to_string());
			}
			// id: and comment lines are ignored
		}
		events
	}

	/// Completes any event still pending at end of stream (a final event not
	/// followed by a blank line).
	pub fn finish(&mut self) -> Option<SseEvent> {
		let tail = self.buf.split();
		let line = trim_line(&tail);
		if let Some(rest) = strip_field(line, "data:") {
			self.data.push(rest.to_string());
		} else if let Some(rest) = strip_field(line, "event:") {
			self.event = Some(rest.to_string());
		}
		self.flush()
	}

	fn flush(&mut self) -> Option<SseEvent> {
		if self.data.is_empty() && self.event.is_none() {
			return None;
		}
		let data = std::mem::take(&mut self.data).join("\n");
		Some(SseEvent {
			event: self.event.take(),
			data,
		})
	}
}

fn trim_line(line: &[u8]) -> &str {
	let s = std::str::from_utf8(line).unwrap_or("");
	s.trim_end_matches(['\n', '\r'])
}

fn strip_field<'a>(line: &'a str, field: &str) -> Option<&'a str> {
	line.strip_prefix(field).map(|rest| rest.strip_prefix(' ').unwrap_or(rest))
}

/// Frames a payload as a `data:` event.
pub fn data_frame(payload: &[u8]) -> Vec<u8> {
	let mut out = Vec::with_capacity(payload.len() + 8);
	out.extend_from_slice(b"data: ");
	out.extend_from_slice(payload);
	out.extend_from_slice(b"\n\n");
	out
}

/// The terminal sentinel for OpenAI-style streams.
pub fn done_frame() -> Vec<u8> {
	b"data: [DONE]\n\n".to_vec()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn split_across_chunks() {
		let mut p = SseParser::new();
		assert!(p.feed(b"data: {\"a\":").is_empty());
		let events = p.feed(b"1}\n\n");
		assert_eq!(events.len(), 1);
		assert_eq!(events[0].data, "{\"a\":1}");
	}

	#[test]
	fn named_events() {
		let mut p = SseParser::new();
		let events = p.feed(b"event: message_start\ndata: {}\n\n");
		assert_eq!(events[0].event.as_deref(), Some("message_start"));
		assert_eq!(events[0].data, "{}");
	}

	#[test]
	fn multi_line_data_joined() {
		let mut p = SseParser::new();
		let events = p.feed(b"data: a\ndata: b\n\n");
		assert_eq!(events[0].data, "a\nb");
	}

	#[test]
	fn done_sentinel() {
		let mut p = SseParser::new();
		let events = p.feed(b"data: [DONE]\n\n");
		assert!(events[0].is_done());
	}

	#[test]
	fn crlf_lines() {
		let mut p = SseParser::new();
		let events = p.feed(b"data: x\r\n\r\n");
		assert_eq!(events[0].data, "x");
	}

	#[test]
	fn finish_flushes_trailing_event() {
		let mut p = SseParser::new();
		assert!(p.feed(b"data: tail").is_empty());
		let ev = p.finish().unwrap();
		assert_eq!(ev.data, "tail");
	}
}
