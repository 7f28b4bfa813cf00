//! Line-oriented record I/O.
//!
//! Used wherever records cross a byte boundary: stdin/stdout of the stage
//! commands, the output of the depot command, and cached record streams.

use crate::error::SyncError;
use crate::record::{is_comment, FstatRecord};
use crate::streaming::channel::{Entry, EntryReceiver, EntrySender};
use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};

/// Reads records one line at a time.
pub struct RecordReader<R> {
    inner: BufReader<R>,
    line: String,
    line_no: u64,
}

impl<R: AsyncRead + Unpin> RecordReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            inner: BufReader::new(reader),
            line: String::new(),
            line_no: 0,
        }
    }

    /// Next record, or `None` at a clean end of input. Comment lines are
    /// skipped; anything else that does not decode is fatal.
    pub async fn next_record(&mut self) -> Result<Option<FstatRecord>> {
        loop {
            self.line.clear();
            let n = self.inner.read_line(&mut self.line).await?;
            if n == 0 {
                return Ok(None);
            }
            self.line_no += 1;

            let line = self.line.strip_suffix('\n').unwrap_or(&self.line);
            if is_comment(line) {
                continue;
            }
            return Ok(Some(FstatRecord::decode_line(line, self.line_no)?));
        }
    }

    pub fn lines_read(&self) -> u64 {
        self.line_no
    }
}

/// Writes records one line at a time.
pub struct RecordWriter<W: AsyncWrite + Unpin> {
    inner: BufWriter<W>,
}

impl<W: AsyncWrite + Unpin> RecordWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            inner: BufWriter::new(writer),
        }
    }

    pub async fn write_record(&mut self, record: &FstatRecord) -> Result<()> {
        let line = record.encode_line()?;
        self.inner.write_all(line.as_bytes()).await?;
        self.inner.write_all(b"\n").await?;
        Ok(())
    }

    pub async fn write_comment(&mut self, comment: &str) -> Result<()> {
        if !is_comment(comment) || comment.contains('\n') {
            return Err(SyncError::Protocol(format!("not a comment line: {:?}", comment)).into());
        }
        self.inner.write_all(comment.as_bytes()).await?;
        self.inner.write_all(b"\n").await?;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.inner.flush().await?;
        Ok(())
    }
}

/// Decode a whole in-memory record stream.
pub fn decode_all(text: &str) -> crate::error::Result<Vec<FstatRecord>> {
    let mut records = Vec::new();
    for (i, line) in text.lines().enumerate() {
        if is_comment(line) {
            continue;
        }
        records.push(FstatRecord::decode_line(line, i as u64 + 1)?);
    }
    Ok(records)
}

/// Encode records into an in-memory stream, optionally with a header line.
pub fn encode_all<'a>(
    records: impl IntoIterator<Item = &'a FstatRecord>,
    header: Option<&str>,
) -> crate::error::Result<String> {
    let mut out = String::new();
    if let Some(header) = header {
        out.push_str(header);
        out.push('\n');
    }
    for record in records {
        out.push_str(&record.encode_line()?);
        out.push('\n');
    }
    Ok(out)
}

/// Feed decoded records from `reader` into a pipeline channel.
/// Returns the number of records read.
pub async fn read_into<R: AsyncRead + Unpin>(reader: R, tx: EntrySender) -> Result<u64> {
    let mut reader = RecordReader::new(reader);
    let mut count = 0u64;
    while let Some(record) = reader.next_record().await? {
        tx.send(Entry::new(record))
            .await
            .map_err(|_| anyhow::anyhow!("Pipeline closed while reading records"))?;
        count += 1;
    }
    Ok(count)
}

/// Drain a pipeline channel into `writer`. Returns the number of records written.
pub async fn write_from<W: AsyncWrite + Unpin>(mut rx: EntryReceiver, writer: W) -> Result<u64> {
    let mut writer = RecordWriter::new(writer);
    let mut count = 0u64;
    while let Some(entry) = rx.recv().await {
        writer
            .write_record(&entry.record)
            .await
            .with_context(|| format!("Failed to write record for {}", entry.record.path))?;
        count += 1;
    }
    writer.flush().await?;
    Ok(count)
}
