//! Bounded Server-Sent-Events reader.
//!
//! Yields the `data` payload of each event from an upstream byte stream.
//! Multi-line `data:` fields are joined with `\n` per the SSE spec; other
//! fields (`event:`, `id:`, comments) are ignored because the relay only
//! forwards data frames. The event size cap guards against upstreams that
//! ship very large frames (base64 image payloads) without buffering them
//! unbounded.

use futures_util::stream::{self, BoxStream};
use futures_util::TryStreamExt;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio_util::io::StreamReader;

#[derive(Debug, Error)]
pub enum SseReadError {
    #[error("failed to read stream event: {0}")]
    Io(#[from] std::io::Error),
    #[error("SSE event exceeds {limit} bytes")]
    Oversize { limit: usize },
}

/// Read one line into `out`, bounded by the remaining event budget.
/// Returns false on a clean end of stream with nothing read.
async fn read_line_bounded<R>(
    reader: &mut R,
    out: &mut Vec<u8>,
    limit: usize,
) -> Result<bool, SseReadError>
where
    R: AsyncBufRead + Unpin,
{
    out.clear();
    loop {
        let buf = reader.fill_buf().await?;
        if buf.is_empty() {
            return Ok(!out.is_empty());
        }

        let newline = buf.iter().position(|b| *b == b'\n');
        let take = newline.map(|pos| pos + 1).unwrap_or(buf.len());
        if out.len().saturating_add(take) > limit {
            return Err(SseReadError::Oversize { limit });
        }

        out.extend_from_slice(&buf[..take]);
        reader.consume(take);
        if newline.is_some() {
            return Ok(true);
        }
    }
}

/// Read the next complete event's data payload, or None at end of stream.
async fn next_event_data<R>(
    reader: &mut R,
    line: &mut Vec<u8>,
    event: &mut String,
    max_event_bytes: usize,
) -> Result<Option<String>, SseReadError>
where
    R: AsyncBufRead + Unpin,
{
    event.clear();
    // Per-line budget leaves room for the field prefix and CRLF on a
    // payload that is exactly at the event cap.
    let line_budget = max_event_bytes.saturating_add(16);
    loop {
        let has_line = read_line_bounded(reader, line, line_budget)
            .await
            .map_err(|err| match err {
                SseReadError::Oversize { .. } => SseReadError::Oversize {
                    limit: max_event_bytes,
                },
                other => other,
            })?;
        if !has_line {
            if event.is_empty() {
                return Ok(None);
            }
            return Ok(Some(std::mem::take(event)));
        }

        let text = std::str::from_utf8(line)
            .map_err(|err| SseReadError::Io(std::io::Error::other(err)))?;
        let text = text.trim_end_matches(['\r', '\n']);

        if text.is_empty() {
            if event.is_empty() {
                continue;
            }
            return Ok(Some(std::mem::take(event)));
        }

        if let Some(rest) = text.strip_prefix("data:") {
            let rest = rest.strip_prefix(' ').unwrap_or(rest);
            let separator = usize::from(!event.is_empty());
            if event
                .len()
                .saturating_add(separator)
                .saturating_add(rest.len())
                > max_event_bytes
            {
                return Err(SseReadError::Oversize {
                    limit: max_event_bytes,
                });
            }
            if separator == 1 {
                event.push('\n');
            }
            event.push_str(rest);
        }
    }
}

pub fn sse_data_stream<R>(
    reader: R,
    max_event_bytes: usize,
) -> BoxStream<'static, Result<String, SseReadError>>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    Box::pin(stream::try_unfold(
        (reader, Vec::new(), String::new()),
        move |(mut reader, mut line, mut event)| async move {
            match next_event_data(&mut reader, &mut line, &mut event, max_event_bytes).await? {
                Some(data) => Ok(Some((data, (reader, line, event)))),
                None => Ok(None),
            }
        },
    ))
}

pub fn sse_data_stream_from_response(
    response: reqwest::Response,
    max_event_bytes: usize,
) -> BoxStream<'static, Result<String, SseReadError>> {
    let bytes = response.bytes_stream().map_err(std::io::Error::other);
    let reader = tokio::io::BufReader::new(StreamReader::new(bytes));
    sse_data_stream(reader, max_event_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures_util::{stream, StreamExt};

    fn reader_over(chunks: &[&str]) -> impl AsyncBufRead + Unpin + Send + 'static {
        let owned: Vec<Result<Bytes, std::io::Error>> = chunks
            .iter()
            .map(|chunk| Ok(Bytes::from(chunk.to_string())))
            .collect();
        tokio::io::BufReader::new(StreamReader::new(stream::iter(owned)))
    }

    #[tokio::test]
    async fn yields_data_frames_in_order() {
        let reader = reader_over(&[
            "event: message\ndata: {\"a\":1}\n\n",
            "data: line1\ndata: line2\n\n",
            "data: [DONE]\n\n",
        ]);
        let mut events = sse_data_stream(reader, 1024);

        assert_eq!(events.next().await.unwrap().unwrap(), "{\"a\":1}");
        assert_eq!(events.next().await.unwrap().unwrap(), "line1\nline2");
        assert_eq!(events.next().await.unwrap().unwrap(), "[DONE]");
        assert!(events.next().await.is_none());
    }

    #[tokio::test]
    async fn event_split_across_chunks_is_reassembled() {
        let reader = reader_over(&["data: hel", "lo world\n", "\n"]);
        let mut events = sse_data_stream(reader, 1024);
        assert_eq!(events.next().await.unwrap().unwrap(), "hello world");
    }

    #[tokio::test]
    async fn unterminated_final_event_is_flushed() {
        let reader = reader_over(&["data: tail"]);
        let mut events = sse_data_stream(reader, 1024);
        assert_eq!(events.next().await.unwrap().unwrap(), "tail");
        assert!(events.next().await.is_none());
    }

    #[tokio::test]
    async fn comments_and_bare_blank_lines_are_ignored() {
        let reader = reader_over(&[": keepalive\n\n\ndata: x\n\n"]);
        let mut events = sse_data_stream(reader, 1024);
        assert_eq!(events.next().await.unwrap().unwrap(), "x");
    }

    #[tokio::test]
    async fn oversize_event_is_rejected() {
        let big = format!("data: {}\n\n", "x".repeat(64));
        let reader = reader_over(&[big.as_str()]);
        let mut events = sse_data_stream(reader, 32);
        let err = events.next().await.unwrap().unwrap_err();
        assert!(matches!(err, SseReadError::Oversize { limit: 32 }));
    }

    #[tokio::test]
    async fn event_exactly_at_cap_is_accepted() {
        let reader = reader_over(&["data: abcde\n\n"]);
        let mut events = sse_data_stream(reader, 5);
        assert_eq!(events.next().await.unwrap().unwrap(), "abcde");
    }
}
