//! SSE decoding for providers that stream `text/event-stream`.
//!
//! [`SseDecoder`] absorbs raw body chunks and yields one payload per
//! complete event (the `data:` lines of a block, joined). The parser
//! closure handed to [`sse_event_stream`] is `FnMut` because tool-call
//! assembly needs mutable state across payloads.

use futures_util::StreamExt;

use chorus_domain::{Error, Result};

use crate::traits::{BoxStream, ProviderEvent};

/// Incremental decoder over an SSE byte stream.
///
/// Events are `\n\n`-delimited blocks; a block may mix `event:`,
/// `id:`, `retry:`, and `data:` lines, of which only the data lines
/// matter here. Partial trailing input is held until a later chunk
/// (or [`SseDecoder::finish`]) completes it.
pub(crate) struct SseDecoder {
    pending: String,
}

impl SseDecoder {
    pub(crate) fn new() -> Self {
        Self {
            pending: String::new(),
        }
    }

    /// Absorb one body chunk; returns the payload of every event the
    /// chunk completed, in order.
    pub(crate) fn feed(&mut self, chunk: &str) -> Vec<String> {
        self.pending.push_str(chunk);

        let mut payloads = Vec::new();
        while let Some(end) = self.pending.find("\n\n") {
            let event: String = self.pending.drain(..end + 2).collect();
            if let Some(payload) = event_payload(&event) {
                payloads.push(payload);
            }
        }
        payloads
    }

    /// Decode whatever is still pending (the body closed mid-event).
    pub(crate) fn finish(&mut self) -> Option<String> {
        let event = std::mem::take(&mut self.pending);
        event_payload(&event)
    }
}

/// Join the `data:` lines of one event block. `None` for blocks that
/// carry no data (comments, ids, keep-alives).
fn event_payload(event: &str) -> Option<String> {
    let mut payload = String::new();
    for line in event.lines() {
        let Some(rest) = line.trim_start().strip_prefix("data:") else {
            continue;
        };
        let rest = rest.trim();
        if rest.is_empty() {
            continue;
        }
        if !payload.is_empty() {
            payload.push('\n');
        }
        payload.push_str(rest);
    }
    (!payload.is_empty()).then_some(payload)
}

/// Build a normalized event stream from an SSE response body and a
/// parser closure.
///
/// The stream decodes complete events as chunks arrive, flushes any
/// partial trailing event at body close, and guarantees a terminal
/// [`ProviderEvent::Done`] even when the provider never sent one.
pub(crate) fn sse_event_stream<F>(
    response: reqwest::Response,
    mut parse_data: F,
) -> BoxStream<'static, Result<ProviderEvent>>
where
    F: FnMut(&str) -> Vec<Result<ProviderEvent>> + Send + 'static,
{
    let stream = async_stream::stream! {
        let mut body = response.bytes_stream();
        let mut decoder = SseDecoder::new();
        let mut done_emitted = false;

        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(bytes) => {
                    for payload in decoder.feed(&String::from_utf8_lossy(&bytes)) {
                        for event in parse_data(&payload) {
                            if matches!(&event, Ok(ProviderEvent::Done)) {
                                done_emitted = true;
                            }
                            yield event;
                        }
                    }
                }
                Err(e) => {
                    yield Err(Error::Http(e.to_string()));
                    return;
                }
            }
        }

        if let Some(payload) = decoder.finish() {
            for event in parse_data(&payload) {
                if matches!(&event, Ok(ProviderEvent::Done)) {
                    done_emitted = true;
                }
                yield event;
            }
        }

        if !done_emitted {
            yield Ok(ProviderEvent::Done);
        }
    };

    Box::pin(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_yields_one_payload_per_complete_event() {
        let mut dec = SseDecoder::new();
        let payloads = dec.feed("event: message\ndata: {\"k\":1}\n\ndata: second\n\n");
        assert_eq!(payloads, vec!["{\"k\":1}", "second"]);
        assert!(dec.finish().is_none());
    }

    #[test]
    fn partial_event_waits_for_its_delimiter() {
        let mut dec = SseDecoder::new();
        assert!(dec.feed("data: chu").is_empty());
        assert!(dec.feed("nk1").is_empty());
        assert_eq!(dec.feed("\n\ndata: chunk2\n\n"), vec!["chunk1", "chunk2"]);
    }

    #[test]
    fn non_data_lines_are_skipped() {
        let mut dec = SseDecoder::new();
        let payloads = dec.feed("event: ping\nid: 9\nretry: 5000\ndata: payload\n\n");
        assert_eq!(payloads, vec!["payload"]);
    }

    #[test]
    fn dataless_block_yields_nothing() {
        let mut dec = SseDecoder::new();
        assert!(dec.feed(": keep-alive\n\ndata: \n\n").is_empty());
    }

    #[test]
    fn multi_line_data_joins_with_newline() {
        let mut dec = SseDecoder::new();
        let payloads = dec.feed("data: first\ndata: second\n\n");
        assert_eq!(payloads, vec!["first\nsecond"]);
    }

    #[test]
    fn finish_decodes_an_unterminated_event() {
        let mut dec = SseDecoder::new();
        assert!(dec.feed("data: tail").is_empty());
        assert_eq!(dec.finish().as_deref(), Some("tail"));
        assert!(dec.finish().is_none());
    }

    #[test]
    fn done_sentinel_passes_through_verbatim() {
        let mut dec = SseDecoder::new();
        assert_eq!(dec.feed("data: [DONE]\n\n"), vec!["[DONE]"]);
    }
}
