use std::io::{self, Write};
use std::path::{Path, PathBuf};

use futures::future::BoxFuture;
use tempfile::NamedTempFile;

use super::{MarkerError, MarkerStore};

/// Marker store keeping one file per key under `<root>/<namespace>/`.
///
/// Writes go to a temp file in the same directory, are fsynced, then renamed
/// over the previous value, so a reader never observes a half-written marker.
#[derive(Debug, Clone)]
pub struct FileMarkerStore {
    root: PathBuf,
}

impl FileMarkerStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, namespace: &str, key: &str) -> PathBuf {
        self.root.join(encode_component(namespace)).join(encode_component(key))
    }
}

/// Percent-encodes everything outside `[A-Za-z0-9._-]` so keys like
/// `queue/group` map to a single file name.
fn encode_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' => out.push(byte as char),
            b'.' if !out.is_empty() => out.push('.'),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

fn write_atomically(path: &Path, value: &[u8]) -> io::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "marker path has no parent"))?;
    std::fs::create_dir_all(dir)?;

    let mut temp = NamedTempFile::new_in(dir)?;
    temp.write_all(value)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|err| err.error)?;
    Ok(())
}

impl MarkerStore for FileMarkerStore {
    fn get<'a>(
        &'a self,
        namespace: &'a str,
        key: &'a str,
    ) -> BoxFuture<'a, Result<Option<Vec<u8>>, MarkerError>> {
        let path = self.path_for(namespace, key);
        Box::pin(async move {
            match tokio::fs::read(&path).await {
                Ok(bytes) => Ok(Some(bytes)),
                Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
                Err(err) => Err(MarkerError::Io(err)),
            }
        })
    }

    fn put<'a>(
        &'a self,
        namespace: &'a str,
        key: &'a str,
        value: &'a [u8],
    ) -> BoxFuture<'a, Result<(), MarkerError>> {
        let path = self.path_for(namespace, key);
        let value = value.to_vec();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || write_atomically(&path, &value)).await??;
            Ok(())
        })
    }
}
