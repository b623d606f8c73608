use chrono::Utc;
use convo_core::sha256_hex;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Advisory per-conversation file lock. Released when dropped.
#[derive(Debug)]
pub struct ConversationLock {
    file: File,
    path: PathBuf,
}

impl ConversationLock {
    /// Returns `Ok(None)` when another holder already owns the lock.
    pub fn try_acquire(
        lock_dir: &Path,
        conversation_id: &str,
    ) -> Result<Option<Self>, std::io::Error> {
        std::fs::create_dir_all(lock_dir)?;
        let path = lock_dir.join(lock_file_name(conversation_id));

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        if file.try_lock_exclusive().is_err() {
            return Ok(None);
        }

        let metadata = format!(
            "conversation_id={conversation_id}\nowner_pid={}\nacquired_at={}\n",
            std::process::id(),
            Utc::now().to_rfc3339(),
        );
        file.set_len(0)?;
        file.write_all(metadata.as_bytes())?;
        file.flush()?;

        Ok(Some(Self { file, path }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ConversationLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

fn lock_file_name(conversation_id: &str) -> String {
    let readable: String = conversation_id
        .chars()
        .take(48)
        .map(|ch| if ch.is_ascii_alphanumeric() { ch } else { '_' })
        .collect();
    let digest = sha256_hex(conversation_id.as_bytes());
    format!("{readable}-{}.lock", &digest[..12])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn second_holder_is_refused_until_release() {
        let dir = tempdir().expect("temp dir");

        let first = ConversationLock::try_acquire(dir.path(), "chat/-100123")
            .expect("lock io")
            .expect("first acquires");
        assert!(ConversationLock::try_acquire(dir.path(), "chat/-100123")
            .expect("lock io")
            .is_none());
        assert!(ConversationLock::try_acquire(dir.path(), "other")
            .expect("lock io")
            .is_some());

        drop(first);
        assert!(ConversationLock::try_acquire(dir.path(), "chat/-100123")
            .expect("lock io")
            .is_some());
    }

    #[test]
    fn lock_names_are_filesystem_safe_and_distinct() {
        let left = lock_file_name("a/b");
        let right = lock_file_name("a_b");
        assert!(left.starts_with("a_b-"));
        assert_ne!(left, right);
    }
}
