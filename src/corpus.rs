//! Text sources for activation extraction
//!
//! A [`TextStream`] is a pull-based source with an explicit end signal
//! (`Ok(None)`). [`TextAdapter`] owns one and hands out all-or-nothing
//! ingestion batches.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{BufferError, Result};

/// Pull-based text source
pub trait TextStream {
    /// Next text item, `Ok(None)` once the source is exhausted
    fn next_text(&mut self) -> Result<Option<String>>;

    /// Release whatever resource backs the stream
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Text stream over any in-memory iterator of strings
pub struct IterTextStream<I> {
    inner: Option<I>,
}

impl<I: Iterator<Item = String>> IterTextStream<I> {
    pub fn new(inner: I) -> Self {
        Self { inner: Some(inner) }
    }
}

impl<I: Iterator<Item = String>> TextStream for IterTextStream<I> {
    fn next_text(&mut self) -> Result<Option<String>> {
        match self.inner.as_mut() {
            Some(iter) => Ok(iter.next()),
            None => Err(BufferError::Closed),
        }
    }

    fn close(&mut self) -> Result<()> {
        self.inner = None;
        Ok(())
    }
}

/// One record of a JSON-lines corpus; extra fields are ignored
#[derive(Debug, Deserialize)]
struct TextRecord {
    text: String,
}

/// Streams the `"text"` field of every line of a JSONL file
pub struct JsonlTextStream {
    path: PathBuf,
    reader: Option<BufReader<File>>,
    line_no: usize,
}

impl JsonlTextStream {
    /// Open a JSONL corpus for streaming
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        debug!("Opened text corpus {}", path.display());
        Ok(Self {
            path,
            reader: Some(BufReader::new(file)),
            line_no: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TextStream for JsonlTextStream {
    fn next_text(&mut self) -> Result<Option<String>> {
        let reader = self.reader.as_mut().ok_or(BufferError::Closed)?;
        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line)? == 0 {
                return Ok(None);
            }
            self.line_no += 1;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let record: TextRecord = serde_json::from_str(trimmed)?;
            return Ok(Some(record.text));
        }
    }

    fn close(&mut self) -> Result<()> {
        // Dropping the reader closes the file handle
        if self.reader.take().is_some() {
            debug!(
                "Closed text corpus {} after {} lines",
                self.path.display(),
                self.line_no
            );
        }
        Ok(())
    }
}

/// Owns the text stream and batches it for ingestion
pub struct TextAdapter {
    stream: Box<dyn TextStream>,
    closed: bool,
}

impl TextAdapter {
    pub fn new(stream: impl TextStream + 'static) -> Self {
        Self::from_boxed(Box::new(stream))
    }

    pub fn from_boxed(stream: Box<dyn TextStream>) -> Self {
        Self {
            stream,
            closed: false,
        }
    }

    /// Pull exactly `n` texts.
    ///
    /// Fails with [`BufferError::Exhausted`] if the stream ends first. Texts
    /// read before the end was hit are not returned.
    pub fn text_batch(&mut self, n: usize) -> Result<Vec<String>> {
        if self.closed {
            return Err(BufferError::Closed);
        }
        let mut texts = Vec::with_capacity(n);
        while texts.len() < n {
            match self.stream.next_text()? {
                Some(text) => texts.push(text),
                None => {
                    warn!(
                        "Text stream exhausted: wanted {}, got {}",
                        n,
                        texts.len()
                    );
                    return Err(BufferError::exhausted(n, texts.len()));
                }
            }
        }
        Ok(texts)
    }

    /// Close the underlying stream. Safe to call more than once.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.stream.close()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}
