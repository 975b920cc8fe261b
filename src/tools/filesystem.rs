//! 沙箱文件系统工具
//!
//! SafeFs 绑定 root_dir，所有路径经 resolve 校验必须在 root 下（禁止 ../ 逃逸）；
//! ReadFileTool / WriteFileTool / ListFilesTool 基于 SafeFs 提供读、写、列目录能力。

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use walkdir::WalkDir;

use crate::tools::grammar::Literal;
use crate::tools::registry::{expect_arity, string_arg};
use crate::tools::Tool;

const LIST_MAX_DEPTH: usize = 2;
const LIST_MAX_ENTRIES: usize = 200;
const READ_MAX_BYTES: usize = 64 * 1024;

/// 沙箱文件系统：绑定根目录，resolve 校验路径在根下，防止路径逃逸
#[derive(Debug, Clone)]
pub struct SafeFs {
    root_dir: PathBuf,
}

impl SafeFs {
    pub fn new(root_dir: impl AsRef<Path>) -> Self {
        let root = root_dir.as_ref().to_path_buf();
        let root_dir = root.canonicalize().unwrap_or(root);
        Self { root_dir }
    }

    pub fn root(&self) -> &Path {
        &self.root_dir
    }

    /// 解析已存在的路径，校验在沙箱内
    pub fn resolve(&self, path: &str) -> Result<PathBuf, String> {
        let rel = path.trim().trim_start_matches("./");
        let full = self.root_dir.join(rel);
        let canonical = full
            .canonicalize()
            .map_err(|_| format!("Path not found: {}", path))?;
        if canonical.starts_with(&self.root_dir) {
            Ok(canonical)
        } else {
            Err(format!("Path escapes sandbox: {}", path)) // 如 ../../etc/passwd
        }
    }

    /// 解析写入目标（文件可不存在）：拒绝绝对路径与 `..`，父目录必须落在沙箱内
    pub fn resolve_for_write(&self, path: &str) -> Result<PathBuf, String> {
        let rel = Path::new(path.trim());
        if rel.as_os_str().is_empty() {
            return Err("Empty path".to_string());
        }
        for component in rel.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => return Err(format!("Path escapes sandbox: {}", path)),
            }
        }
        let full = self.root_dir.join(rel);
        // 已存在的最深祖先必须仍在根下（防止符号链接逃逸）
        let mut ancestor = full.parent();
        while let Some(dir) = ancestor {
            if dir.exists() {
                let canonical = dir
                    .canonicalize()
                    .map_err(|e| format!("Resolve failed: {}", e))?;
                if !canonical.starts_with(&self.root_dir) {
                    return Err(format!("Path escapes sandbox: {}", path));
                }
                break;
            }
            ancestor = dir.parent();
        }
        Ok(full)
    }

    pub async fn read_file(&self, path: &str) -> Result<String, String> {
        let resolved = self.resolve(path)?;
        let content = tokio::fs::read_to_string(&resolved)
            .await
            .map_err(|e| format!("Read failed: {}", e))?;
        if content.len() > READ_MAX_BYTES {
            let mut cut = READ_MAX_BYTES;
            while !content.is_char_boundary(cut) {
                cut -= 1;
            }
            return Ok(format!("{}\n...(truncated, {} bytes total)", &content[..cut], content.len()));
        }
        Ok(content)
    }

    pub async fn write_file(&self, path: &str, content: &str) -> Result<usize, String> {
        let target = self.resolve_for_write(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| format!("Create dir failed: {}", e))?;
        }
        // 目标本身是符号链接时写入会落到链接指向处，可能在沙箱外
        if let Ok(meta) = tokio::fs::symlink_metadata(&target).await {
            if meta.file_type().is_symlink() {
                return Err(format!("Refusing to write through symlink: {}", path));
            }
        }
        tokio::fs::write(&target, content)
            .await
            .map_err(|e| format!("Write failed: {}", e))?;
        Ok(content.len())
    }

    /// 列出目录（深度 2，跳过隐藏项），目录以 `/` 结尾
    pub fn list_dir(&self, path: &str) -> Result<Vec<String>, String> {
        let base = if path.trim().is_empty() || path.trim() == "." {
            self.root_dir.clone()
        } else {
            self.resolve(path)?
        };
        if !base.is_dir() {
            return Err(format!("Not a directory: {}", path));
        }
        let mut entries = Vec::new();
        let walker = WalkDir::new(&base)
            .min_depth(1)
            .max_depth(LIST_MAX_DEPTH)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !e.file_name().to_string_lossy().starts_with('.'));
        for entry in walker {
            let entry = entry.map_err(|e| format!("List failed: {}", e))?;
            let rel = entry
                .path()
                .strip_prefix(&base)
                .unwrap_or(entry.path())
                .to_string_lossy()
                .replace('\\', "/");
            let suffix = if entry.file_type().is_dir() { "/" } else { "" };
            entries.push(format!("{}{}", rel, suffix));
            if entries.len() >= LIST_MAX_ENTRIES {
                entries.push("...".to_string());
                break;
            }
        }
        Ok(entries)
    }
}

/// 读取沙箱内文件
pub struct ReadFileTool {
    fs: SafeFs,
}

impl ReadFileTool {
    pub fn new(fs: SafeFs) -> Self {
        Self { fs }
    }
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &str {
        "read_file"
    }

    fn description(&self) -> &str {
        "Read a text file from the workspace"
    }

    fn signature(&self) -> String {
        "read_file(path)".to_string()
    }

    async fn execute(&self, args: &[Literal]) -> Result<String, String> {
        expect_arity(self.name(), args, 1)?;
        let path = string_arg(self.name(), args, 0)?;
        tracing::info!(path = %path, "read_file tool execute");
        self.fs.read_file(path).await
    }
}

/// 写入沙箱内文件（覆盖）
pub struct WriteFileTool {
    fs: SafeFs,
}

impl WriteFileTool {
    pub fn new(fs: SafeFs) -> Self {
        Self { fs }
    }
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &str {
        "write_file"
    }

    fn description(&self) -> &str {
        "Write text to a file in the workspace, replacing existing content"
    }

    fn signature(&self) -> String {
        "write_file(path, content)".to_string()
    }

    async fn execute(&self, args: &[Literal]) -> Result<String, String> {
        expect_arity(self.name(), args, 2)?;
        let path = string_arg(self.name(), args, 0)?;
        let content = string_arg(self.name(), args, 1)?;
        tracing::info!(path = %path, bytes = content.len(), "write_file tool execute");
        let written = self.fs.write_file(path, content).await?;
        Ok(format!("Wrote {} bytes to {}", written, path))
    }
}

/// 列出沙箱内目录
pub struct ListFilesTool {
    fs: SafeFs,
}

impl ListFilesTool {
    pub fn new(fs: SafeFs) -> Self {
        Self { fs }
    }
}

#[async_trait]
impl Tool for ListFilesTool {
    fn name(&self) -> &str {
        "list_files"
    }

    fn description(&self) -> &str {
        "List files in a workspace directory (two levels deep); use \".\" for the root"
    }

    fn signature(&self) -> String {
        "list_files(path)".to_string()
    }

    async fn execute(&self, args: &[Literal]) -> Result<String, String> {
        let path = match args.len() {
            0 => ".",
            _ => string_arg(self.name(), args, 0)?,
        };
        tracing::info!(path = %path, "list_files tool execute");
        let fs = self.fs.clone();
        let path = path.to_string();
        let entries = tokio::task::spawn_blocking(move || fs.list_dir(&path))
            .await
            .map_err(|e| format!("List failed: {}", e))??;
        if entries.is_empty() {
            Ok("(empty)".to_string())
        } else {
            Ok(entries.join("\n"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s(v: &str) -> Literal {
        Literal::Str(v.to_string())
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let fs = SafeFs::new(dir.path());
        let write = WriteFileTool::new(fs.clone());
        let read = ReadFileTool::new(fs);
        let out = write
            .execute(&[s("notes/today.txt"), s("feeling fine")])
            .await
            .unwrap();
        assert!(out.contains("12 bytes"));
        assert_eq!(read.execute(&[s("notes/today.txt")]).await.unwrap(), "feeling fine");
    }

    #[tokio::test]
    async fn test_escape_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let fs = SafeFs::new(dir.path());
        let write = WriteFileTool::new(fs.clone());
        let read = ReadFileTool::new(fs);
        assert!(write
            .execute(&[s("../outside.txt"), s("x")])
            .await
            .unwrap_err()
            .contains("escapes"));
        assert!(write.execute(&[s("/etc/passwd"), s("x")]).await.is_err());
        assert!(read.execute(&[s("../../etc/passwd")]).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_write_through_symlink_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let victim = outside.path().join("victim.txt");
        std::fs::write(&victim, "original").unwrap();
        std::os::unix::fs::symlink(&victim, dir.path().join("link.txt")).unwrap();

        let write = WriteFileTool::new(SafeFs::new(dir.path()));
        let err = write.execute(&[s("link.txt"), s("overwritten")]).await.unwrap_err();
        assert!(err.contains("symlink"));
        assert_eq!(std::fs::read_to_string(&victim).unwrap(), "original");
    }

    #[tokio::test]
    async fn test_list_files_depth_and_hidden() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("a/b/c")).unwrap();
        std::fs::write(dir.path().join("top.txt"), "1").unwrap();
        std::fs::write(dir.path().join(".secret"), "1").unwrap();
        std::fs::write(dir.path().join("a/b/c/deep.txt"), "1").unwrap();
        let tool = ListFilesTool::new(SafeFs::new(dir.path()));
        let out = tool.execute(&[s(".")]).await.unwrap();
        assert!(out.contains("top.txt"));
        assert!(out.contains("a/"));
        assert!(out.contains("a/b/"));
        assert!(!out.contains("deep.txt"));
        assert!(!out.contains(".secret"));
    }

    #[tokio::test]
    async fn test_wrong_argument_types() {
        let dir = tempfile::tempdir().unwrap();
        let read = ReadFileTool::new(SafeFs::new(dir.path()));
        assert!(read.execute(&[Literal::Int(3)]).await.is_err());
        assert!(read.execute(&[]).await.is_err());
    }
}
