use std::io::{ErrorKind, SeekFrom};
use std::path::Path;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::Result;

/// Read at most `max_bytes` from the end of `path` and split into lines,
/// oldest first.
///
/// When the window starts mid-line the partial first line is dropped. A
/// missing file reads as empty.
pub async fn read_tail(path: &Path, max_bytes: u64) -> Result<Vec<String>> {
    let mut file = match File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let len = file.metadata().await?.len();
    let start = len.saturating_sub(max_bytes);

    let at_line_start = if start == 0 {
        true
    } else {
        file.seek(SeekFrom::Start(start - 1)).await?;
        let mut prev = [0u8; 1];
        file.read_exact(&mut prev).await?;
        prev[0] == b'\n'
    };

    file.seek(SeekFrom::Start(start)).await?;
    let mut buf = Vec::with_capacity((len - start) as usize);
    file.take(max_bytes).read_to_end(&mut buf).await?;

    Ok(split_window(&buf, at_line_start))
}

fn split_window(buf: &[u8], at_line_start: bool) -> Vec<String> {
    if buf.is_empty() {
        return Vec::new();
    }

    let mut lines: Vec<&[u8]> = buf.split(|b| *b == b'\n').collect();

    if buf.ends_with(b"\n") {
        lines.pop();
    }
    if !at_line_start && !lines.is_empty() {
        lines.remove(0);
    }

    lines
        .into_iter()
        .map(|l| decode_valid(l.strip_suffix(b"\r").unwrap_or(l)))
        .collect()
}

/// Keep the valid UTF-8 runs of `bytes` and drop the rest, so decoding never
/// grows a line past the bytes read.
fn decode_valid(bytes: &[u8]) -> String {
    bytes.utf8_chunks().map(|chunk| chunk.valid()).collect()
}
