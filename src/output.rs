use std::{
    fs,
    io::{self, Write},
    path::Path,
};

use serde::Serialize;

use crate::error::Result;

/// Writes one JSON object per line.
pub struct JsonLinesWriter<W: Write> {
    out: io::BufWriter<W>,
    written: u64,
}

impl JsonLinesWriter<fs::File> {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(dir) = path.as_ref().parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        let file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self::new(file))
    }
}

impl JsonLinesWriter<io::Sink> {
    /// Serializes records without storing them, for measuring the pipeline without disk I/O.
    pub fn discard() -> Self {
        Self::new(io::sink())
    }
}

impl<W: Write> JsonLinesWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            out: io::BufWriter::new(inner),
            written: 0,
        }
    }

    pub fn write<T: Serialize>(&mut self, record: &T) -> Result<()> {
        serde_json::to_writer(&mut self.out, record)?;
        self.out.write_all(b"\n")?;
        self.written += 1;
        Ok(())
    }

    #[inline]
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Flushes and hands back the underlying writer.
    pub fn finish(self) -> Result<W> {
        self.out.into_inner().map_err(|e| e.into_error().into())
    }
}
