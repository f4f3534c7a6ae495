use aws_smithy_eventstream::frame::{DecodedFrame, MessageFrameDecoder};
use bytes::{BufMut, Bytes, BytesMut};

/// A decoded AWS event-stream message with the routing headers pulled out.
#[derive(Debug, Clone)]
pub struct Message {
	pub event_type: Option<String>,
	pub message_type: Option<String>,
	pub exception_type: Option<String>,
	pub payload: Bytes,
}

#[derive(Debug, thiserror::Error)]
#[error("event stream decode: {0}")]
pub struct Error(String);

/// Incremental decoder for `application/vnd.amazon.eventstream` bodies.
/// Frames may span ext_proc body chunks; undecoded bytes are retained.
#[derive(Default)]
pub struct EventStreamDecoder {
	inner: MessageFrameDecoder,
	buf: BytesMut,
}

impl EventStreamDecoder {
	pub fn new() -> Self {
		Self::default()
	}

	/// Feeds one body chunk and returns every message completed by it.
	pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Message>, Error> {
		self.buf.put_slice(chunk);
		let mut out = Vec::new();
		loop {
			match self.inner.decode_frame(&mut self.buf) {
				Ok(DecodedFrame::Complete(message)) => {
					let get = |name: &str| -> Option<String> {
						message
							.headers()
							.iter()
							.find(|h| h.name().as_str() == name)
							.and_then(|h| h.value().as_string().ok())
							.map(|s| s.as_str().to_owned())
					};
					out.push(Message {
						event_type: get(":event-type"),
						message_type: get(":message-type"),
						exception_type: get(":exception-type"),
						payload: Bytes::copy_from_slice(&message.payload()[..]),
					});
				},
				Ok(DecodedFrame::Incomplete) => return Ok(out),
				Err(e) => return Err(Error(e.to_string())),
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use aws_smithy_types::event_stream::{Header, HeaderValue, Message as SmithyMessage};
	use aws_smithy_types::str_bytes::StrBytes;

	use super::*;

	fn encode(msg: &SmithyMessage) -> Vec<u8> {
		let mut buf = Vec::new();
		aws_smithy_eventstream::frame::write_message_to(msg, &mut buf).unwrap();
		buf
	}

	fn event(event_type: &str, payload: &str) -> SmithyMessage {
		SmithyMessage::new(Bytes::copy_from_slice(payload.as_bytes()))
			.add_header(Header::new(
				":message-type",
				HeaderValue::String(StrBytes::from("event")),
			))
			.add_header(Header::new(
				":event-type",
				HeaderValue::String(StrBytes::from(event_type.to_string())),
			))
	}

	#[test]
	fn decodes_whole_frame() {
		let wire = encode(&event("messageStart", r#"{"role":"assistant"}"#));
		let mut dec = EventStreamDecoder::new();
		let msgs = dec.feed(&wire).unwrap();
		assert_eq!(msgs.len(), 1);
		assert_eq!(msgs[0].event_type.as_deref(), Some("messageStart"));
		assert_eq!(msgs[0].payload.as_ref(), br#"{"role":"assistant"}"#);
	}

	#[test]
	fn decodes_frame_split_across_chunks() {
		let wire = encode(&event("contentBlockDelta", r#"{"delta":{"text":"x"},"contentBlockIndex":0}"#));
		let mut dec = EventStreamDecoder::new();
		let (a, b) = wire.split_at(wire.len() / 2);
		assert!(dec.feed(a).unwrap().is_empty());
		let msgs = dec.feed(b).unwrap();
		assert_eq!(msgs.len(), 1);
		assert_eq!(msgs[0].event_type.as_deref(), Some("contentBlockDelta"));
	}

	#[test]
	fn decodes_multiple_frames_in_one_chunk() {
		let mut wire = encode(&event("messageStart", "{}"));
		wire.extend(encode(&event("messageStop", "{}")));
		let mut dec = EventStreamDecoder::new();
		let msgs = dec.feed(&wire).unwrap();
		assert_eq!(msgs.len(), 2);
	}

	#[test]
	fn exception_headers_surface() {
		let msg = SmithyMessage::new(Bytes::from_static(b"boom"))
			.add_header(Header::new(
				":message-type",
				HeaderValue::String(StrBytes::from("exception")),
			))
			.add_header(Header::new(
				":exception-type",
				HeaderValue::String(StrBytes::from("throttlingException")),
			));
		let wire = encode(&msg);
		let mut dec = EventStreamDecoder::new();
		let msgs = dec.feed(&wire).unwrap();
		assert_eq!(msgs[0].message_type.as_deref(), Some("exception"));
		assert_eq!(msgs[0].exception_type.as_deref(), Some("throttlingException"));
	}
}
