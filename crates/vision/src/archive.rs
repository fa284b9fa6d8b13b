//! Directory of annotated frames, newest listed first.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{DateTime, Local};

pub const RECENT_FILE_LIMIT: usize = 20;

#[derive(Debug)]
pub struct ImageArchive {
    dir: PathBuf,
}

impl ImageArchive {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create archive directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write an annotated JPEG and return its file name.
    pub fn save(&self, jpeg: &[u8], captured_at: DateTime<Local>) -> io::Result<String> {
        let name = format!("classified_{}.jpg", captured_at.format("%Y%m%d_%H%M%S_%3f"));
        fs::write(self.dir.join(&name), jpeg)?;
        Ok(name)
    }

    /// Image file names, newest first.
    pub fn recent(&self, limit: usize) -> Vec<String> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| is_image_name(name))
            .collect();
        names.sort_unstable_by(|a, b| b.cmp(a));
        names.truncate(limit);
        names
    }

    /// Map a client-supplied name to a file inside the archive. Anything that
    /// could escape the directory is refused.
    pub fn resolve(&self, name: &str) -> Option<PathBuf> {
        if name.is_empty()
            || name.starts_with('.')
            || name.contains(['/', '\\'])
            || !is_image_name(name)
        {
            return None;
        }
        let path = self.dir.join(name);
        path.is_file().then_some(path)
    }
}

fn is_image_name(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.ends_with(".jpg") || lower.ends_with(".jpeg") || lower.ends_with(".png")
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    #[test]
    fn recent_lists_newest_first_and_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let archive = ImageArchive::open(dir.path()).unwrap();
        for second in 0..25 {
            let at = Local.with_ymd_and_hms(2024, 5, 1, 12, 0, second).unwrap();
            archive.save(b"jpeg", at).unwrap();
        }
        fs::write(dir.path().join("notes.txt"), b"x").unwrap();

        let recent = archive.recent(RECENT_FILE_LIMIT);
        assert_eq!(recent.len(), RECENT_FILE_LIMIT);
        assert_eq!(recent[0], "classified_20240501_120024_000.jpg");
        assert!(recent.iter().all(|name| name.ends_with(".jpg")));
    }

    #[test]
    fn resolve_refuses_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let archive = ImageArchive::open(dir.path().join("classified")).unwrap();
        let at = Local.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let name = archive.save(b"jpeg", at).unwrap();

        assert!(archive.resolve(&name).is_some());
        assert!(archive.resolve("../secret.jpg").is_none());
        assert!(archive.resolve("..").is_none());
        assert!(archive.resolve("missing.jpg").is_none());
        assert!(archive.resolve("log.txt").is_none());
    }
}
