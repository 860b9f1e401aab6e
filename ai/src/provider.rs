//! OpenAI-compatible chat-completions client with SSE streaming.

use std::sync::OnceLock;
use std::time::Duration;

use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::{AiError, Result};

/// Connection timeout for provider requests.
const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Longest single SSE line accepted (1 MiB). A delta payload is orders of
/// magnitude smaller; anything past this is a misbehaving server.
const MAX_SSE_LINE_BYTES: usize = 1024 * 1024;

/// Largest `data` payload accepted for one event (4 MiB).
const MAX_SSE_EVENT_BYTES: usize = 4 * 1024 * 1024;

/// How much of an error response body is kept for the error message.
const MAX_ERROR_SNIPPET_BYTES: usize = 32 * 1024;

/// Provider endpoint and credentials.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ProviderConfig {
    /// Base URL up to but excluding `/chat/completions`.
    pub base_url: String,
    pub api_key: String,
    pub model: String,
}

/// Shared client for streaming requests: connect timeout only, since an SSE
/// stream may legitimately run for minutes.
pub(crate) fn http_client() -> &'static reqwest::Client {
    static CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
    CLIENT.get_or_init(|| {
        reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .expect("build provider HTTP client")
    })
}

/// Incremental server-sent-events reader.
///
/// Network chunks go in, completed `data` payloads come out. Parsing is
/// line oriented: bytes accumulate until a newline, `data:` lines append to
/// the event under construction, and a blank line seals it. CRLF endings,
/// comment lines and non-`data` fields fall out of the line handling with
/// no buffer scanning.
struct SseReader {
    line: Vec<u8>,
    event_data: String,
    in_event: bool,
}

impl SseReader {
    fn new() -> Self {
        Self {
            line: Vec::new(),
            event_data: String::new(),
            in_event: false,
        }
    }

    /// Consume one network chunk, pushing each payload completed by it onto
    /// `out`.
    fn feed(&mut self, chunk: &[u8], out: &mut Vec<String>) -> Result<()> {
        for &byte in chunk {
            if byte != b'\n' {
                if self.line.len() >= MAX_SSE_LINE_BYTES {
                    return Err(AiError::Transport("SSE line too long".to_string()));
                }
                self.line.push(byte);
                continue;
            }
            self.take_line(out)?;
        }
        Ok(())
    }

    fn take_line(&mut self, out: &mut Vec<String>) -> Result<()> {
        let mut line = std::mem::take(&mut self.line);
        if line.last() == Some(&b'\r') {
            line.pop();
        }

        // Blank line: the event under construction is complete.
        if line.is_empty() {
            if self.in_event {
                out.push(std::mem::take(&mut self.event_data));
                self.in_event = false;
            }
            return Ok(());
        }

        let line = String::from_utf8(line)
            .map_err(|_| AiError::Transport("invalid UTF-8 in SSE stream".to_string()))?;
        let Some(value) = line.strip_prefix("data:") else {
            // Comments and fields like `event:`/`id:` carry nothing we use.
            return Ok(());
        };
        let value = value.strip_prefix(' ').unwrap_or(value);

        if self.event_data.len() + value.len() > MAX_SSE_EVENT_BYTES {
            return Err(AiError::Transport("SSE event too large".to_string()));
        }
        if self.in_event {
            self.event_data.push('\n');
        }
        self.event_data.push_str(value);
        self.in_event = true;
        Ok(())
    }
}

#[derive(Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Deserialize, Default)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Stream one chat completion, feeding text deltas to `on_delta` as they
/// arrive. Returns once the stream finishes cleanly.
pub(crate) async fn stream_chat(
    config: &ProviderConfig,
    system_prompt: &str,
    user_content: &str,
    cancel: &CancellationToken,
    mut on_delta: impl FnMut(String),
) -> Result<()> {
    let url = format!("{}/chat/completions", config.base_url.trim_end_matches('/'));
    let body = json!({
        "model": config.model,
        "stream": true,
        "messages": [
            {"role": "system", "content": system_prompt},
            {"role": "user", "content": user_content},
        ],
    });

    let send = http_client()
        .post(&url)
        .header("authorization", format!("Bearer {}", config.api_key))
        .header("content-type", "application/json")
        .json(&body)
        .send();
    let response = tokio::select! {
        _ = cancel.cancelled() => return Err(AiError::Cancelled),
        response = send => response?,
    };

    if !response.status().is_success() {
        let status = response.status().as_u16();
        let message = error_snippet(response).await;
        return Err(AiError::Api { status, message });
    }

    let mut stream = response.bytes_stream();
    let mut reader = SseReader::new();
    let mut payloads = Vec::new();

    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => return Err(AiError::Cancelled),
            chunk = stream.next() => chunk,
        };
        let Some(chunk) = chunk else {
            // Upstream closed without [DONE]; everything delivered so far is
            // already with the caller, but the aggregate must not persist.
            return Err(AiError::UnexpectedEof);
        };
        reader.feed(&chunk?, &mut payloads)?;

        for payload in payloads.drain(..) {
            if payload == "[DONE]" {
                return Ok(());
            }
            match serde_json::from_str::<ChatChunk>(&payload) {
                Ok(parsed) => {
                    for choice in parsed.choices {
                        if let Some(content) = choice.delta.content
                            && !content.is_empty()
                        {
                            on_delta(content);
                        }
                    }
                }
                Err(err) => {
                    tracing::debug!(error = %err, "skipping unparseable SSE chunk");
                }
            }
        }
    }
}

/// First bytes of an error body, as text. Stops reading at the cap so a
/// large error page cannot spike memory, marking the cut.
async fn error_snippet(response: reqwest::Response) -> String {
    let mut snippet: Vec<u8> = Vec::new();
    let mut clipped = false;

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let Ok(chunk) = chunk else { break };
        let room = MAX_ERROR_SNIPPET_BYTES - snippet.len();
        if chunk.len() > room {
            snippet.extend_from_slice(&chunk[..room]);
            clipped = true;
            break;
        }
        snippet.extend_from_slice(&chunk);
    }

    let mut text = String::from_utf8_lossy(&snippet).into_owned();
    if clipped {
        text.push('…');
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(reader: &mut SseReader, input: &[u8]) -> Vec<String> {
        let mut out = Vec::new();
        reader.feed(input, &mut out).unwrap();
        out
    }

    #[test]
    fn reader_completes_events_on_blank_lines() {
        let mut reader = SseReader::new();
        let payloads = feed_all(&mut reader, b"data: a\n\ndata: b\r\n\r\n");
        assert_eq!(payloads, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn reader_handles_payloads_split_across_chunks() {
        let mut reader = SseReader::new();
        assert!(feed_all(&mut reader, b"data: hel").is_empty());
        assert!(feed_all(&mut reader, b"lo\n").is_empty());
        let payloads = feed_all(&mut reader, b"\n");
        assert_eq!(payloads, vec!["hello".to_string()]);
    }

    #[test]
    fn reader_joins_multiple_data_lines() {
        let mut reader = SseReader::new();
        let payloads = feed_all(&mut reader, b"data: first\ndata: second\n\n");
        assert_eq!(payloads, vec!["first\nsecond".to_string()]);
    }

    #[test]
    fn reader_ignores_comments_and_other_fields() {
        let mut reader = SseReader::new();
        let payloads = feed_all(&mut reader, b": keep-alive\nevent: message\ndata:[DONE]\n\n");
        assert_eq!(payloads, vec!["[DONE]".to_string()]);
    }

    #[test]
    fn reader_rejects_invalid_utf8() {
        let mut reader = SseReader::new();
        let mut out = Vec::new();
        assert!(matches!(
            reader.feed(b"data: \xff\xfe\n", &mut out),
            Err(AiError::Transport(_))
        ));
    }

    #[test]
    fn chunk_parsing_reads_delta_content() {
        let chunk: ChatChunk = serde_json::from_str(
            r#"{"choices":[{"delta":{"content":"hello"}}]}"#,
        )
        .unwrap();
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("hello"));

        let done: ChatChunk =
            serde_json::from_str(r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#).unwrap();
        assert_eq!(done.choices[0].delta.content, None);
    }
}
