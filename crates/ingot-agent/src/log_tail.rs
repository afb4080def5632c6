use std::{
    collections::VecDeque,
    io::{self, SeekFrom},
    path::{Path, PathBuf},
    time::Duration,
};

use futures_util::Stream;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::settings::TailSettings;

pub const ROTATION_MARKER: &str = "[ingot] log file was rotated or truncated; reading from the start";

#[cfg(unix)]
fn file_identity(meta: &std::fs::Metadata) -> Option<(u64, u64)> {
    use std::os::unix::fs::MetadataExt;
    Some((meta.dev(), meta.ino()))
}

#[cfg(not(unix))]
fn file_identity(_meta: &std::fs::Metadata) -> Option<(u64, u64)> {
    None
}

/// Keeps a logical line on one physical line for line-framed consumers.
fn escape_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    let text = String::from_utf8_lossy(raw);
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\r' => out.push_str("\\r"),
            '\u{0085}' => out.push_str("\\u0085"),
            '\u{2028}' => out.push_str("\\u2028"),
            '\u{2029}' => out.push_str("\\u2029"),
            c => out.push(c),
        }
    }
    out
}

#[derive(Debug)]
pub enum PollOutcome {
    Lines(Vec<String>),
    Missing,
}

/// Position of one subscriber inside one log file.
#[derive(Debug, Default, Clone)]
pub struct LogCursor {
    identity: Option<(u64, u64)>,
    offset: u64,
    initial_sent: bool,
    skip_partial: bool,
}

impl LogCursor {
    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn reset(&mut self) {
        *self = Self::default();
    }

    /// One read cycle. Only complete lines are returned; a trailing partial
    /// line stays in the file until its newline arrives.
    pub async fn poll(&mut self, path: &Path, tail: &TailSettings) -> io::Result<PollOutcome> {
        let meta = match tokio::fs::metadata(path).await {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.reset();
                return Ok(PollOutcome::Missing);
            }
            Err(e) => return Err(e),
        };

        let mut out = Vec::new();
        let identity = file_identity(&meta);
        let len = meta.len();
        let replaced = self.identity.is_some() && identity != self.identity;
        if self.initial_sent && (replaced || len < self.offset) {
            out.push(ROTATION_MARKER.to_string());
            self.offset = 0;
            self.initial_sent = false;
            self.skip_partial = false;
        }
        self.identity = identity;

        if !self.initial_sent {
            let start = len.saturating_sub(tail.window_bytes);
            // Start one byte early: if that byte is a newline, the window
            // begins on a line boundary and the skip below drops only it.
            self.offset = start.saturating_sub(1);
            self.skip_partial = start > 0;
            self.initial_sent = true;
        }

        if len <= self.offset {
            return Ok(PollOutcome::Lines(out));
        }

        let want = (len - self.offset).min(tail.max_read_bytes);
        let mut f = tokio::fs::File::open(path).await?;
        f.seek(SeekFrom::Start(self.offset)).await?;
        let mut buf = Vec::with_capacity(want as usize);
        (&mut f).take(want).read_to_end(&mut buf).await?;

        let mut consumed = 0usize;
        if self.skip_partial {
            match buf.iter().position(|b| *b == b'\n') {
                Some(i) => {
                    consumed = i + 1;
                    self.skip_partial = false;
                }
                None => {
                    self.offset += buf.len() as u64;
                    return Ok(PollOutcome::Lines(out));
                }
            }
        }

        let rest = &buf[consumed..];
        let complete = match rest.iter().rposition(|b| *b == b'\n') {
            Some(last) => &rest[..=last],
            // A line longer than one read cycle is cut: this chunk is emitted
            // and the remainder up to its newline is skipped.
            None if consumed == 0 && buf.len() as u64 >= tail.max_read_bytes => {
                self.skip_partial = true;
                rest
            }
            None => &rest[..0],
        };

        if !complete.is_empty() {
            let body = complete.strip_suffix(b"\n").unwrap_or(complete);
            out.extend(body.split(|b| *b == b'\n').map(escape_line));
        }

        self.offset += (consumed + complete.len()) as u64;
        Ok(PollOutcome::Lines(out))
    }
}

struct TailState {
    path: PathBuf,
    tail: TailSettings,
    cursor: LogCursor,
    pending: VecDeque<String>,
    next_delay: Option<Duration>,
    missing_reported: bool,
}

/// Endless line stream for one subscriber. Dropping the stream stops it.
pub fn tail_lines(path: PathBuf, tail: TailSettings) -> impl Stream<Item = String> + Send + 'static {
    let state = TailState {
        path,
        tail,
        cursor: LogCursor::default(),
        pending: VecDeque::new(),
        next_delay: None,
        missing_reported: false,
    };

    futures_util::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(line) = st.pending.pop_front() {
                return Some((line, st));
            }
            if let Some(d) = st.next_delay.take() {
                tokio::time::sleep(d).await;
            }

            match st.cursor.poll(&st.path, &st.tail).await {
                Ok(PollOutcome::Lines(lines)) => {
                    st.missing_reported = false;
                    st.pending.extend(lines);
                    st.next_delay = Some(st.tail.poll_interval);
                }
                Ok(PollOutcome::Missing) => {
                    if !st.missing_reported {
                        st.pending
                            .push_back(format!("[ingot] waiting for log file {}", st.path.display()));
                        st.missing_reported = true;
                    }
                    st.next_delay = Some(st.tail.missing_backoff);
                }
                Err(e) => {
                    tracing::debug!(path = %st.path.display(), error = %e, "log tail read failed");
                    st.pending.push_back(format!("[ingot] log read error: {e}"));
                    st.next_delay = Some(st.tail.error_backoff);
                }
            }
        }
    })
}

/// Last `n` lines of a log file, reading at most `max_bytes` from its end.
pub async fn read_last_lines(path: &Path, n: usize, max_bytes: u64) -> io::Result<Vec<String>> {
    let mut f = tokio::fs::File::open(path).await?;
    let len = f.metadata().await?.len();
    let start = len.saturating_sub(max_bytes);
    // One byte early, so a window that starts on a line boundary keeps its first line.
    f.seek(SeekFrom::Start(start.saturating_sub(1))).await?;
    let mut buf = Vec::new();
    f.read_to_end(&mut buf).await?;

    let mut body: &[u8] = &buf;
    if start > 0 {
        body = match body.iter().position(|b| *b == b'\n') {
            Some(i) => &body[i + 1..],
            None => &[],
        };
    }
    let body = body.strip_suffix(b"\n").unwrap_or(body);
    if body.is_empty() {
        return Ok(Vec::new());
    }

    let lines: Vec<String> = body.split(|b| *b == b'\n').map(escape_line).collect();
    let skip = lines.len().saturating_sub(n);
    Ok(lines.into_iter().skip(skip).collect())
}
