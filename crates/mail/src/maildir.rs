//! Maildir delivery, as specified in <http://cr.yp.to/proto/maildir.html>.
//!
//! Messages are written to `tmp/` and renamed into `new/` so readers never
//! observe a partial file. Keys follow the
//! `<unix-seconds>.<pid>_<counter>.<hostname>` grammar; the counter is
//! process-wide and incremented atomically for every delivery.

use anyhow::{Context, Result, bail};
use std::fs;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::message::ParsedMessage;

const CUR: &str = "cur";
const TMP: &str = "tmp";
const NEW: &str = "new";

static COUNTER: AtomicU64 = AtomicU64::new(0);

fn hostname() -> &'static str {
    static HOSTNAME: OnceLock<String> = OnceLock::new();
    HOSTNAME.get_or_init(|| {
        let host = gethostname::gethostname().to_string_lossy().into_owned();
        // '/' and ':' cannot appear in a maildir filename; the maildir spec
        // substitutes their octal escapes.
        host.replace('/', "\\057").replace(':', "\\072")
    })
}

fn next_key() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
    format!("{}.{}_{}.{}", secs, std::process::id(), n, hostname())
}

/// Key of a delivered maildir message: the filename without any `cur/`
/// flag suffix.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key(pub String);

impl Key {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A single maildir directory.
#[derive(Debug, Clone)]
pub struct Maildir {
    dir: PathBuf,
}

impl Maildir {
    /// Create a maildir rooted at `dir`, making `tmp/`, `new/` and `cur/`
    /// (mode 0766) as needed.
    pub fn create(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        for sub in [CUR, TMP, NEW] {
            let path = dir.join(sub);
            if !path.is_dir() {
                fs::DirBuilder::new()
                    .recursive(true)
                    .mode(0o766)
                    .create(&path)
                    .with_context(|| format!("failed to create {}", path.display()))?;
            }
        }
        Ok(Self { dir })
    }

    /// Atomically deliver `msg` into `new/`, returning its key.
    pub fn deliver(&self, msg: &ParsedMessage) -> Result<Key> {
        let key = next_key();
        let tmp = self.dir.join(TMP).join(&key);
        let mut file = fs::File::create(&tmp)
            .with_context(|| format!("failed to create {}", tmp.display()))?;
        msg.write_to(&mut file)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        let dest = self.dir.join(NEW).join(&key);
        fs::rename(&tmp, &dest)
            .with_context(|| format!("failed to rename into {}", dest.display()))?;
        Ok(Key(key))
    }

    /// Resolve a key to its file: `new/<key>`, or any `cur/` entry named
    /// `<key>:<flags>` (clients append `:2,S`-style flag suffixes when they
    /// move a message to `cur/`).
    pub fn path_of(&self, key: &Key) -> Result<PathBuf> {
        let fresh = self.dir.join(NEW).join(key.as_str());
        if fresh.exists() {
            return Ok(fresh);
        }
        let cur = self.dir.join(CUR);
        let prefix = format!("{}:", key.as_str());
        for entry in
            fs::read_dir(&cur).with_context(|| format!("failed to read {}", cur.display()))?
        {
            let entry = entry?;
            if entry.file_name().to_string_lossy().starts_with(&prefix) {
                return Ok(entry.path());
            }
        }
        bail!("no message with key {} in {}", key.as_str(), self.dir.display())
    }

    /// Read and parse the message stored under `key`.
    pub fn message(&self, key: &Key) -> Result<ParsedMessage> {
        let path = self.path_of(key)?;
        let raw = fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
        ParsedMessage::parse(&raw)
            .with_context(|| format!("failed to parse maildir file {}", path.display()))
    }

    /// Remove the message stored under `key` from `new/` or `cur/`.
    pub fn delete(&self, key: &Key) -> Result<()> {
        let path = self.path_of(key)?;
        fs::remove_file(&path).with_context(|| format!("failed to remove {}", path.display()))
    }

    /// The maildir root.
    pub fn path(&self) -> &Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample() -> ParsedMessage {
        ParsedMessage::parse(b"Subject: hi\n\nbody").unwrap()
    }

    #[test]
    fn test_create_makes_subdirectories() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("box");
        Maildir::create(&root).unwrap();
        for sub in ["tmp", "new", "cur"] {
            assert!(root.join(sub).is_dir());
        }
    }

    #[test]
    fn test_deliver_lands_in_new() {
        let dir = tempdir().unwrap();
        let md = Maildir::create(dir.path()).unwrap();
        let key = md.deliver(&sample()).unwrap();

        let path = md.path_of(&key).unwrap();
        assert_eq!(path.parent().unwrap().file_name().unwrap(), "new");
        assert!(fs::read_dir(dir.path().join("tmp")).unwrap().next().is_none());

        let msg = md.message(&key).unwrap();
        assert_eq!(msg.header("Subject"), Some("hi"));
    }

    #[test]
    fn test_keys_are_unique() {
        let dir = tempdir().unwrap();
        let md = Maildir::create(dir.path()).unwrap();
        let a = md.deliver(&sample()).unwrap();
        let b = md.deliver(&sample()).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_resolves_cur_with_flag_suffix() {
        let dir = tempdir().unwrap();
        let md = Maildir::create(dir.path()).unwrap();
        let key = md.deliver(&sample()).unwrap();

        // Simulate a client marking the message seen.
        let src = dir.path().join("new").join(key.as_str());
        let dst = dir.path().join("cur").join(format!("{}:2,S", key.as_str()));
        fs::rename(&src, &dst).unwrap();

        assert_eq!(md.path_of(&key).unwrap(), dst);
        md.delete(&key).unwrap();
        assert!(md.path_of(&key).is_err());
    }

    #[test]
    fn test_delete_removes_from_new() {
        let dir = tempdir().unwrap();
        let md = Maildir::create(dir.path()).unwrap();
        let key = md.deliver(&sample()).unwrap();
        md.delete(&key).unwrap();
        assert!(fs::read_dir(dir.path().join("new")).unwrap().next().is_none());
    }
}
