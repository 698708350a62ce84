//! File-backed tables: one CSV file per table, first line is the header.
//!
//! There is no locking here. Callers that mutate a table own a mutex around
//! their read-modify-write cycle (see the directories and the click ledger).

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use csv::{ReaderBuilder, StringRecord, Terminator, WriterBuilder};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tokio::sync::OnceCell;

use crate::codec::{self, Record, Row};
use crate::error::{Result, StoreError};

/// Header plus undecoded records of one table file.
#[derive(Debug, Clone)]
pub struct RawTable {
    pub headers: StringRecord,
    pub records: Vec<StringRecord>,
}

impl RawTable {
    /// Rows viewed through the file's own header.
    pub fn rows(&self) -> impl Iterator<Item = Row<'_>> + '_ {
        self.records
            .iter()
            .map(move |values| Row::new(&self.headers, values))
    }

    /// Decode every row as `R`.
    pub fn decode<R: Record>(&self) -> Vec<R> {
        self.rows().map(|row| R::from_row(&row)).collect()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.headers.iter().any(|h| h == name)
    }
}

/// Directory of CSV tables.
#[derive(Debug)]
pub struct TableStore {
    dir: PathBuf,
    ready: OnceCell<()>,
}

impl TableStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ready: OnceCell::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, file: &str) -> PathBuf {
        self.dir.join(file)
    }

    /// Create the data directory once per store.
    async fn ensure_dir(&self) -> Result<()> {
        self.ready
            .get_or_try_init(|| async {
                fs::create_dir_all(&self.dir).await.map_err(|e| {
                    StoreError::storage(
                        format!("creating data directory {}", self.dir.display()),
                        e,
                    )
                })
            })
            .await?;
        Ok(())
    }

    /// Create `file` holding only the header line if it does not exist yet.
    pub async fn ensure_file_exists(&self, file: &str, headers: &[&str]) -> Result<()> {
        self.ensure_dir().await?;
        let path = self.path(file);

        let created = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await;

        match created {
            Ok(mut handle) => {
                let line = header_line(file, headers)?;
                handle
                    .write_all(line.as_bytes())
                    .await
                    .map_err(|e| StoreError::storage(format!("writing header of {file}"), e))?;
                handle
                    .flush()
                    .await
                    .map_err(|e| StoreError::storage(format!("writing header of {file}"), e))?;
                tracing::debug!("Created table {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(StoreError::storage(format!("creating {file}"), e)),
        }
    }

    /// Read header and records. `None` when the file is absent or blank.
    pub async fn read_raw(&self, file: &str) -> Result<Option<RawTable>> {
        self.ensure_dir().await?;
        let path = self.path(file);

        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::storage(format!("reading {file}"), e)),
        };
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }

        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(bytes.as_slice());
        let headers = reader
            .headers()
            .map_err(|e| StoreError::csv(file, e))?
            .clone();
        let records = reader
            .records()
            .collect::<csv::Result<Vec<_>>>()
            .map_err(|e| StoreError::csv(file, e))?;

        Ok(Some(RawTable { headers, records }))
    }

    /// Header row of `file`, read from its first line only.
    pub async fn read_headers(&self, file: &str) -> Result<Option<StringRecord>> {
        let path = self.path(file);
        let handle = match fs::File::open(&path).await {
            Ok(handle) => handle,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::storage(format!("opening {file}"), e)),
        };

        let mut lines = BufReader::new(handle).lines();
        let first = lines
            .next_line()
            .await
            .map_err(|e| StoreError::storage(format!("reading header of {file}"), e))?;

        match first {
            Some(line) if !line.trim().is_empty() => {
                let headers = codec::decode_line(line.trim_end_matches('\r'))
                    .map_err(|e| StoreError::csv(file, e))?;
                Ok(Some(headers))
            }
            _ => Ok(None),
        }
    }

    /// Every row of `file` decoded as `R`, using the file's header for column
    /// order. Absent, empty and header-only files yield an empty list.
    pub async fn read_all<R: Record>(&self, file: &str) -> Result<Vec<R>> {
        Ok(self
            .read_raw(file)
            .await?
            .map(|raw| raw.decode())
            .unwrap_or_default())
    }

    /// Replace the whole file with `headers` plus `rows`.
    ///
    /// Content goes to a sibling temp file first and is renamed into place, so
    /// a reader sees either the old table or the new one.
    pub async fn write_all<R: Record>(&self, file: &str, rows: &[R], headers: &[&str]) -> Result<()> {
        self.ensure_dir().await?;
        let header_rec = codec::header_record(headers);

        let mut writer = WriterBuilder::new()
            .has_headers(false)
            .terminator(Terminator::Any(b'\n'))
            .from_writer(Vec::new());
        writer
            .write_record(&header_rec)
            .map_err(|e| StoreError::csv(file, e))?;
        for row in rows {
            writer
                .write_record(codec::ordered_values(row, &header_rec))
                .map_err(|e| StoreError::csv(file, e))?;
        }
        let content = writer
            .into_inner()
            .map_err(|e| StoreError::storage(format!("encoding {file}"), e.into_error()))?;

        let path = self.path(file);
        let tmp = self.path(&format!(".{file}.tmp"));
        fs::write(&tmp, &content)
            .await
            .map_err(|e| StoreError::storage(format!("writing {}", tmp.display()), e))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| StoreError::storage(format!("replacing {file}"), e))?;

        tracing::debug!("Rewrote {} with {} row(s)", file, rows.len());
        Ok(())
    }

    /// Append one row, creating the file and header first if needed.
    pub async fn append<R: Record>(&self, file: &str, row: &R, headers: &[&str]) -> Result<()> {
        self.ensure_file_exists(file, headers).await?;

        let file_headers = match self.read_headers(file).await? {
            Some(existing) => existing,
            None => {
                // Present but empty: put the header back before the row.
                let line = header_line(file, headers)?;
                fs::write(self.path(file), line)
                    .await
                    .map_err(|e| StoreError::storage(format!("writing header of {file}"), e))?;
                codec::header_record(headers)
            }
        };

        let mut line = codec::encode(row, &file_headers).map_err(|e| StoreError::csv(file, e))?;
        line.push('\n');

        let mut handle = OpenOptions::new()
            .read(true)
            .append(true)
            .open(self.path(file))
            .await
            .map_err(|e| StoreError::storage(format!("opening {file} for append"), e))?;

        if !ends_with_newline(&mut handle)
            .await
            .map_err(|e| StoreError::storage(format!("inspecting {file}"), e))?
        {
            line.insert(0, '\n');
        }

        handle
            .write_all(line.as_bytes())
            .await
            .map_err(|e| StoreError::storage(format!("appending to {file}"), e))?;
        handle
            .flush()
            .await
            .map_err(|e| StoreError::storage(format!("appending to {file}"), e))?;
        Ok(())
    }
}

fn header_line(file: &str, headers: &[&str]) -> Result<String> {
    let mut line = codec::encode_line(headers).map_err(|e| StoreError::csv(file, e))?;
    line.push('\n');
    Ok(line)
}

/// `true` for empty files or files whose last byte is `\n`.
async fn ends_with_newline(handle: &mut fs::File) -> std::io::Result<bool> {
    let len = handle.metadata().await?.len();
    if len == 0 {
        return Ok(true);
    }
    handle.seek(SeekFrom::End(-1)).await?;
    let mut last = [0u8; 1];
    handle.read_exact(&mut last).await?;
    Ok(last[0] == b'\n')
}
