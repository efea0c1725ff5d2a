//! Shared SSE plumbing for streaming completions.
//!
//! The adapter hands a `reqwest::Response` plus a payload parser to
//! [`event_stream`]; this module buffers chunks, splits on the `\n\n` event
//! delimiter, pulls out `data:` payloads, and guarantees a trailing `Done`
//! even when the upstream closes without one.

use sp_domain::error::Result;
use sp_domain::stream::{BoxStream, StreamEvent};

/// Pull complete `data:` payloads out of an SSE buffer, in place.
///
/// Consumed bytes are drained; a trailing partial event stays in the buffer
/// for the next chunk. `event:`/`id:`/`retry:` lines are ignored.
pub(crate) fn drain_data_payloads(buffer: &mut String) -> Vec<String> {
    let mut payloads = Vec::new();

    while let Some(pos) = buffer.find("\n\n") {
        let block: String = buffer.drain(..pos).collect();
        buffer.drain(..2);

        for line in block.lines() {
            if let Some(data) = line.trim().strip_prefix("data:") {
                let data = data.trim();
                if !data.is_empty() {
                    payloads.push(data.to_string());
                }
            }
        }
    }

    payloads
}

/// Build a [`BoxStream`] of [`StreamEvent`]s from a streaming HTTP response.
///
/// `parse` maps one `data:` payload to zero or more events; it is `FnMut`
/// so parsers can keep assembly state across payloads. A `Done` event is
/// synthesized if the body ends without one.
pub(crate) fn event_stream<F>(
    response: reqwest::Response,
    mut parse: F,
    on_transport_error: impl Fn(reqwest::Error) -> sp_domain::Error + Send + 'static,
) -> BoxStream<'static, Result<StreamEvent>>
where
    F: FnMut(&str) -> Vec<Result<StreamEvent>> + Send + 'static,
{
    let stream = async_stream::stream! {
        let mut response = response;
        let mut buffer = String::new();
        let mut done_seen = false;

        loop {
            match response.chunk().await {
                Ok(Some(bytes)) => {
                    buffer.push_str(&String::from_utf8_lossy(&bytes));
                    for payload in drain_data_payloads(&mut buffer) {
                        for event in parse(&payload) {
                            done_seen |= matches!(&event, Ok(StreamEvent::Done { .. }));
                            yield event;
                        }
                    }
                }
                Ok(None) => {
                    // Body closed; flush a possible final unterminated event.
                    if !buffer.trim().is_empty() {
                        buffer.push_str("\n\n");
                        for payload in drain_data_payloads(&mut buffer) {
                            for event in parse(&payload) {
                                done_seen |= matches!(&event, Ok(StreamEvent::Done { .. }));
                                yield event;
                            }
                        }
                    }
                    break;
                }
                Err(e) => {
                    yield Err(on_transport_error(e));
                    break;
                }
            }
        }

        if !done_seen {
            yield Ok(StreamEvent::Done { usage: None, finish_reason: Some("stop".into()) });
        }
    };

    Box::pin(stream)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_event_is_drained() {
        let mut buf = String::from("event: message\ndata: {\"a\":1}\n\n");
        assert_eq!(drain_data_payloads(&mut buf), vec!["{\"a\":1}"]);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_event_waits_for_more_bytes() {
        let mut buf = String::from("data: whole\n\ndata: par");
        assert_eq!(drain_data_payloads(&mut buf), vec!["whole"]);
        assert_eq!(buf, "data: par");

        buf.push_str("tial\n\n");
        assert_eq!(drain_data_payloads(&mut buf), vec!["partial"]);
    }

    #[test]
    fn non_data_lines_are_skipped() {
        let mut buf = String::from("id: 9\nretry: 100\ndata: x\n\ndata: \n\n");
        assert_eq!(drain_data_payloads(&mut buf), vec!["x"]);
    }

    #[test]
    fn done_sentinel_passes_through() {
        let mut buf = String::from("data: [DONE]\n\n");
        assert_eq!(drain_data_payloads(&mut buf), vec!["[DONE]"]);
    }
}
