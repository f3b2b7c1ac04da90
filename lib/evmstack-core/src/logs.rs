//! Log line streams.
//!
//! Container logs arrive in chunks that split lines arbitrarily, and the node writes its log to a file on the host
//! instead of to its container output. Both are turned into the same [`LogLines`] stream.

use std::{
    io::SeekFrom,
    path::PathBuf,
    sync::LazyLock,
    time::Duration,
};

use async_stream::stream;
use bytes::{Bytes, BytesMut};
use futures::{stream::BoxStream, Stream, StreamExt as _};
use regex::Regex;
use tokio::io::{AsyncReadExt as _, AsyncSeekExt as _};
use tokio_util::codec::{Decoder as _, LinesCodec};
use tracing::{debug, trace};

use crate::runtime::RuntimeError;

/// A stream of decoded log lines, without line terminators.
pub type LogLines = BoxStream<'static, Result<String, RuntimeError>>;

const MAX_LINE_LENGTH: usize = 64 * 1024;

/// How often a followed log file is checked for appended data.
pub const FILE_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Decodes a stream of arbitrarily split chunks into lines.
///
/// A partial line at the end of a chunk is held until the rest of it arrives. A final unterminated line is yielded
/// when the chunk stream ends. Lines that are not valid UTF-8 or exceed 64 KiB are skipped.
pub fn decode_lines<S>(chunks: S) -> LogLines
where
    S: Stream<Item = Result<Bytes, RuntimeError>> + Send + 'static,
{
    stream! {
        let mut codec = LinesCodec::new_with_max_length(MAX_LINE_LENGTH);
        let mut buf = BytesMut::new();

        futures::pin_mut!(chunks);
        while let Some(chunk) = chunks.next().await {
            match chunk {
                Ok(chunk) => buf.extend_from_slice(&chunk),
                Err(e) => {
                    yield Err(e);
                    return;
                }
            }

            loop {
                match codec.decode(&mut buf) {
                    Ok(Some(line)) => yield Ok(line),
                    Ok(None) => break,
                    Err(e) => trace!(error = %e, "Skipping undecodable log line."),
                }
            }
        }

        if let Ok(Some(line)) = codec.decode_eof(&mut buf) {
            if !line.is_empty() {
                yield Ok(line);
            }
        }
    }
    .boxed()
}

/// Follows a log file on the host.
///
/// The last `tail` complete lines already in the file when the stream starts are yielded first (all of them when
/// `None`), then data appended afterwards as it shows up. The file does not have to exist yet. If the file shrinks, it is assumed to have been
/// rotated and is read again from the start. The stream never ends on its own.
pub fn follow_file(path: PathBuf, tail: Option<usize>, poll_interval: Duration) -> LogLines {
    stream! {
        let mut codec = LinesCodec::new_with_max_length(MAX_LINE_LENGTH);
        let mut buf = BytesMut::new();
        let mut offset = 0u64;
        let mut first_read = true;

        loop {
            let len = match tokio::fs::metadata(&path).await {
                Ok(metadata) => metadata.len(),
                Err(_) => {
                    // Created after the stream started: nothing to skip.
                    first_read = false;
                    tokio::time::sleep(poll_interval).await;
                    continue;
                }
            };

            if len < offset {
                debug!(file_path = %path.display(), "Log file shrank. Reading from the start.");
                offset = 0;
                buf.clear();
            }

            if len > offset {
                let mut file = match tokio::fs::File::open(&path).await {
                    Ok(file) => file,
                    Err(e) => {
                        yield Err(RuntimeError::Other { message: format!("failed to open '{}': {}", path.display(), e) });
                        return;
                    }
                };

                let mut appended = Vec::new();
                let read = async {
                    file.seek(SeekFrom::Start(offset)).await?;
                    (&mut file).take(len - offset).read_to_end(&mut appended).await
                };
                if let Err(e) = read.await {
                    yield Err(RuntimeError::Other { message: format!("failed to read '{}': {}", path.display(), e) });
                    return;
                }
                offset += appended.len() as u64;
                buf.extend_from_slice(&appended);

                let mut lines = Vec::new();
                loop {
                    match codec.decode(&mut buf) {
                        Ok(Some(line)) => lines.push(line),
                        Ok(None) => break,
                        Err(e) => trace!(error = %e, "Skipping undecodable log line."),
                    }
                }

                if first_read {
                    if let Some(tail) = tail {
                        let skip = lines.len().saturating_sub(tail);
                        lines.drain(..skip);
                    }
                }
                for line in lines {
                    yield Ok(line);
                }
            }

            first_read = false;
            tokio::time::sleep(poll_interval).await;
        }
    }
    .boxed()
}

static NODE_LOG_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"^\S+\s+\S+\s+(.*)$").unwrap()
});

/// Cleans up a raw node log line.
///
/// Returns `None` for periodic housekeeping noise, or lines too short to carry a message. Otherwise, the leading level
/// and timestamp columns are stripped.
pub fn clean_node_line(line: &str) -> Option<String> {
    if line.contains("clear_expired_input_") {
        return None;
    }

    NODE_LOG_PREFIX
        .captures(line)
        .and_then(|captures| captures.get(1))
        .map(|message| message.as_str().to_string())
}

/// Applies [`clean_node_line`] to a stream of raw node log lines.
pub fn node_lines(raw: LogLines) -> LogLines {
    raw.filter_map(|line| async move {
        match line {
            Ok(line) => clean_node_line(&line).map(Ok),
            Err(e) => Some(Err(e)),
        }
    })
    .boxed()
}
