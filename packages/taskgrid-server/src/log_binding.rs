/// File-backed implementation of the log-binding contract the core depends
/// on only through `taskgrid_core::worker::LogBinding`. This is the "simple
/// file-backed store" the control plane owns; the core never reads or
/// writes it directly.
use std::path::PathBuf;

use async_trait::async_trait;
use taskgrid_core::model::{Mode, QueueId};
use taskgrid_core::worker::LogBinding;

pub struct FileLogBinding {
    base_dir: PathBuf,
}

impl FileLogBinding {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    fn path_for(&self, mode: Mode, config_index: u32, queue_id: QueueId, process_index: u32) -> PathBuf {
        self.base_dir
            .join(format!("{mode:?}").to_lowercase())
            .join(config_index.to_string())
            .join(queue_id.to_string())
            .join(format!("{process_index}.log"))
    }
}

#[async_trait]
impl LogBinding for FileLogBinding {
    async fn resolve(&self, mode: Mode, config_index: u32, queue_id: QueueId, process_index: u32) -> Option<PathBuf> {
        let path = self.path_for(mode, config_index, queue_id, process_index);
        if let Some(parent) = path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        Some(path)
    }
}

/// Plain external operation: read the last `n` lines of a bound log file.
/// Not scheduling logic, so it lives beside the binding rather than in
/// `taskgrid-core`.
pub async fn tail_lines(path: &std::path::Path, n: usize) -> std::io::Result<String> {
    let contents = tokio::fs::read_to_string(path).await?;
    let lines: Vec<&str> = contents.lines().collect();
    let start = lines.len().saturating_sub(n);
    Ok(lines[start..].join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_creates_parent_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let binding = FileLogBinding::new(tmp.path().to_path_buf());
        let path = binding.resolve(Mode::Single, 0, 3, 1).await.unwrap();
        assert!(path.parent().unwrap().is_dir());
        assert_eq!(path.file_name().unwrap(), "1.log");
    }

    #[tokio::test]
    async fn tail_lines_returns_last_n_lines_only() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("out.log");
        tokio::fs::write(&file, "a\nb\nc\nd\n").await.unwrap();
        let tail = tail_lines(&file, 2).await.unwrap();
        assert_eq!(tail, "c\nd");
    }
}
