//! Per-room message history as an append-only JSON array.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock, Weak};

use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::Result;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
/// Bytes inspected at the end of the file to find the closing bracket.
const TAIL_WINDOW: u64 = 64;

/// One append lock per history file, shared by every writer in the process.
static FILE_LOCKS: LazyLock<parking_lot::Mutex<FxHashMap<PathBuf, Weak<Mutex<()>>>>> =
    LazyLock::new(Default::default);

fn file_lock(path: &Path) -> Arc<Mutex<()>> {
    let key = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let mut locks = FILE_LOCKS.lock();
    if let Some(lock) = locks.get(&key).and_then(Weak::upgrade) {
        return lock;
    }
    locks.retain(|_, lock| lock.strong_count() > 0);
    let lock = Arc::new(Mutex::new(()));
    locks.insert(key, Arc::downgrade(&lock));
    lock
}

/// Appends raw notifications to `<dir>/<room_id>.json`.
///
/// The file stays a valid JSON array after every append; existing records are
/// never rewritten unless the tail of the file is damaged. Writers for the
/// same file within one process take turns.
#[derive(Debug)]
pub struct HistoryWriter {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl HistoryWriter {
    pub fn new(dir: impl AsRef<Path>, room_id: u64) -> Self {
        let path = dir.as_ref().join(format!("{room_id}.json"));
        let lock = file_lock(&path);
        Self { path, lock }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `message` tagged with the local `add_time`.
    pub async fn append(&self, message: &Value) -> Result<()> {
        let record = serde_json::to_string(&stamp(message))?;
        let _guard = self.lock.lock().await;

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .await?;

        let len = file.metadata().await?.len();
        if len == 0 {
            file.write_all(format!("[\n{record}\n]\n").as_bytes()).await?;
            return Ok(file.flush().await?);
        }

        let start = len.saturating_sub(TAIL_WINDOW);
        file.seek(SeekFrom::Start(start)).await?;
        let mut tail = Vec::with_capacity((len - start) as usize);
        file.read_to_end(&mut tail).await?;

        match closing_bracket(&tail) {
            Some((pos, empty)) => {
                let separator = if empty { "\n" } else { ",\n" };
                file.seek(SeekFrom::Start(start + pos as u64)).await?;
                file.write_all(format!("{separator}{record}\n]\n").as_bytes())
                    .await?;
                file.flush().await?;
                Ok(())
            }
            None => {
                drop(file);
                self.rewrite(record).await
            }
        }
    }

    /// Slow path for a file whose tail isn't `]`: parse it whole, or move it
    /// aside when it isn't a JSON array at all.
    async fn rewrite(&self, record: String) -> Result<()> {
        let content = fs::read(&self.path).await?;
        let mut records: Vec<Value> = match serde_json::from_slice(&content) {
            Ok(records) => records,
            Err(e) => {
                let aside = self.path.with_extension("json.corrupt");
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "History file is not a JSON array, moving it to {}",
                    aside.display()
                );
                fs::rename(&self.path, &aside).await?;
                Vec::new()
            }
        };
        records.push(serde_json::from_str(&record)?);

        let mut out = String::from("[\n");
        for (i, value) in records.iter().enumerate() {
            if i > 0 {
                out.push_str(",\n");
            }
            out.push_str(&serde_json::to_string(value)?);
        }
        out.push_str("\n]\n");
        fs::write(&self.path, out).await?;
        Ok(())
    }
}

fn stamp(message: &Value) -> Value {
    let add_time = Value::String(chrono::Local::now().format(TIME_FORMAT).to_string());
    match message {
        Value::Object(map) => {
            let mut map = map.clone();
            map.insert("add_time".to_string(), add_time);
            Value::Object(map)
        }
        other => serde_json::json!({ "data": other, "add_time": add_time }),
    }
}

/// Where the next record goes in `tail` (just past the last element, or past
/// `[` for an empty array) and whether the array is empty.
fn closing_bracket(tail: &[u8]) -> Option<(usize, bool)> {
    let end = tail.iter().rposition(|b| !b.is_ascii_whitespace())?;
    if tail[end] != b']' {
        return None;
    }
    let before = tail[..end].iter().rposition(|b| !b.is_ascii_whitespace())?;
    Some((before + 1, tail[before] == b'['))
}
