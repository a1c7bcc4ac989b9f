use async_trait::async_trait;
use std::io::{ErrorKind, Write};
use std::path::PathBuf;
use wopi_core::store::{KvStore, Result};

/// `KvStore` backed by a directory, intended to sit on storage shared
/// between bridge instances. Single-key write atomicity for `set_if_absent`
/// comes from link(2): the value is staged in a temp file and linked to the
/// key path, so exactly one racing instance publishes, and the key file is
/// fully written the moment it becomes visible to readers.
pub struct FileKv {
    dir: PathBuf,
}

impl FileKv {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn key_path(&self, key: &str) -> PathBuf {
        // Keys are constrained to file-name-safe characters.
        let sanitized: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(sanitized)
    }
}

#[async_trait]
impl KvStore for FileKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.key_path(key)).await {
            Ok(data) => Ok(Some(data)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn set_if_absent(&self, key: &str, value: &[u8]) -> Result<bool> {
        tokio::fs::create_dir_all(&self.dir).await?;

        // Stage the full value first; a created-but-not-yet-written key file
        // must never be observable, or a concurrent reader converges on a
        // torn value. link(2) fails if the key path already exists, which is
        // the set-if-absent semantics.
        let staged = tempfile::NamedTempFile::new_in(&self.dir)?;
        let mut file = staged.as_file();
        file.write_all(value)?;
        file.sync_all()?;

        match tokio::fs::hard_link(staged.path(), self.key_path(key)).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wopi_core::store::ensure_once;

    #[tokio::test]
    async fn get_returns_none_for_absent_key() {
        let dir = tempfile::tempdir().unwrap();
        let kv = FileKv::new(dir.path());
        assert!(kv.get("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn set_if_absent_stores_once() {
        let dir = tempfile::tempdir().unwrap();
        let kv = FileKv::new(dir.path());

        assert!(kv.set_if_absent("secret", b"first").await.unwrap());
        assert!(!kv.set_if_absent("secret", b"second").await.unwrap());
        assert_eq!(kv.get("secret").await.unwrap().unwrap(), b"first");
    }

    #[tokio::test]
    async fn keys_are_sanitized_to_file_names() {
        let dir = tempfile::tempdir().unwrap();
        let kv = FileKv::new(dir.path());

        assert!(kv.set_if_absent("a/b:c", b"value").await.unwrap());
        assert_eq!(kv.get("a/b:c").await.unwrap().unwrap(), b"value");
        assert!(dir.path().join("a_b_c").exists());
    }

    #[tokio::test]
    async fn reader_never_observes_a_partially_written_value() {
        // A reader polling while another instance publishes must see either
        // nothing or the complete value, never a created-but-empty key file.
        for _ in 0..32 {
            let dir = tempfile::tempdir().unwrap();
            let writer = FileKv::new(dir.path());
            let reader = FileKv::new(dir.path());

            let (wrote, observed) = tokio::join!(
                writer.set_if_absent("secret", b"twenty-char-secret-x"),
                async {
                    loop {
                        if let Some(value) = reader.get("secret").await.unwrap() {
                            return value;
                        }
                        tokio::task::yield_now().await;
                    }
                },
            );
            assert!(wrote.unwrap());
            assert_eq!(observed, b"twenty-char-secret-x");
        }
    }

    #[tokio::test]
    async fn set_if_absent_leaves_no_staging_files_behind() {
        let dir = tempfile::tempdir().unwrap();
        let kv = FileKv::new(dir.path());

        assert!(kv.set_if_absent("secret", b"value").await.unwrap());
        assert!(!kv.set_if_absent("secret", b"other").await.unwrap());

        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec!["secret"]);
    }

    #[tokio::test]
    async fn ensure_once_converges_over_file_kv() {
        let dir = tempfile::tempdir().unwrap();
        let a = FileKv::new(dir.path());
        let b = FileKv::new(dir.path());

        let (va, vb) = tokio::join!(
            ensure_once(&a, "secret", b"instance-a"),
            ensure_once(&b, "secret", b"instance-b"),
        );
        let va = va.unwrap();
        let vb = vb.unwrap();
        assert_eq!(va, vb);
        assert!(va == b"instance-a" || va == b"instance-b");
    }
}
