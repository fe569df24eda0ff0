//! Blocking filesystem helpers behind the dashboard's file browser.

use std::cmp::Ordering;
use std::path::Path;

use clickup_orchestrator_core::api::{FileContent, FileNode};
use thiserror::Error;

pub const TREE_DEPTH: usize = 3;
pub const MAX_FILE_BYTES: u64 = 5 * 1024 * 1024;

const SKIP_DIRS: &[&str] = &[
    "node_modules",
    "target",
    "dist",
    "build",
    "__pycache__",
    "venv",
    "worktrees",
];

#[derive(Debug, Error)]
pub enum FileError {
    #[error("Path does not exist")]
    NotFound,
    #[error("Path is not a directory")]
    NotADirectory,
    #[error("Path is a directory")]
    IsADirectory,
    #[error("Path already exists")]
    AlreadyExists,
    #[error("File is too large to open (max 5MB)")]
    TooLarge,
    #[error("File is not valid UTF-8 text")]
    NotText,
    #[error("Failed to {action}: {source}")]
    Io {
        action: &'static str,
        #[source]
        source: std::io::Error,
    },
}

fn io(action: &'static str) -> impl FnOnce(std::io::Error) -> FileError {
    move |source| FileError::Io { action, source }
}

pub fn tree(root: &Path) -> Result<Vec<FileNode>, FileError> {
    if !root.exists() {
        return Err(FileError::NotFound);
    }
    if !root.is_dir() {
        return Err(FileError::NotADirectory);
    }
    build_tree(root, 0).map_err(io("read directory"))
}

fn build_tree(dir: &Path, depth: usize) -> std::io::Result<Vec<FileNode>> {
    let mut entries: Vec<(String, bool, std::path::PathBuf)> = std::fs::read_dir(dir)?
        .filter_map(Result::ok)
        .map(|e| {
            let path = e.path();
            (e.file_name().to_string_lossy().into_owned(), path.is_dir(), path)
        })
        .filter(|(name, is_dir, _)| !name.starts_with('.') && !(*is_dir && SKIP_DIRS.contains(&name.as_str())))
        .collect();

    entries.sort_by(|a, b| match (a.1, b.1) {
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        _ => a.0.to_lowercase().cmp(&b.0.to_lowercase()),
    });

    Ok(entries
        .into_iter()
        .map(|(name, is_dir, path)| {
            let children = match (is_dir, depth < TREE_DEPTH) {
                (true, true) => Some(build_tree(&path, depth + 1).unwrap_or_default()),
                (true, false) => Some(Vec::new()),
                (false, _) => None,
            };
            FileNode {
                name,
                path: path.to_string_lossy().into_owned(),
                is_directory: is_dir,
                children,
            }
        })
        .collect())
}

pub fn read(path: &Path) -> Result<FileContent, FileError> {
    let meta = match std::fs::metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(FileError::NotFound),
        Err(e) => return Err(io("read file")(e)),
    };
    if meta.is_dir() {
        return Err(FileError::IsADirectory);
    }
    if meta.len() > MAX_FILE_BYTES {
        return Err(FileError::TooLarge);
    }
    let bytes = std::fs::read(path).map_err(io("read file"))?;
    let content = String::from_utf8(bytes).map_err(|_| FileError::NotText)?;
    Ok(FileContent {
        content,
        language: language_for(path).to_string(),
        encoding: "utf-8".to_string(),
    })
}

/// Overwrites an existing file.
pub fn save(path: &Path, content: &str) -> Result<(), FileError> {
    if !path.is_file() {
        return Err(FileError::NotFound);
    }
    std::fs::write(path, content).map_err(io("write file"))
}

pub fn create(path: &Path, is_directory: bool) -> Result<(), FileError> {
    if path.exists() {
        return Err(FileError::AlreadyExists);
    }
    if is_directory {
        return std::fs::create_dir_all(path).map_err(io("create directory"));
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io("create directory"))?;
    }
    std::fs::File::create_new(path)
        .map(|_| ())
        .map_err(io("create file"))
}

pub fn rename(from: &Path, to: &Path) -> Result<(), FileError> {
    if !from.exists() {
        return Err(FileError::NotFound);
    }
    if to.exists() {
        return Err(FileError::AlreadyExists);
    }
    std::fs::rename(from, to).map_err(io("rename"))
}

pub fn delete(path: &Path) -> Result<(), FileError> {
    let meta = std::fs::symlink_metadata(path).map_err(|_| FileError::NotFound)?;
    if meta.is_dir() {
        std::fs::remove_dir_all(path).map_err(io("delete directory"))
    } else {
        std::fs::remove_file(path).map_err(io("delete file"))
    }
}

/// Editor language id for syntax highlighting.
pub fn language_for(path: &Path) -> &'static str {
    if path.file_name().and_then(|n| n.to_str()) == Some("Dockerfile") {
        return "dockerfile";
    }
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "rs" => "rust",
        "ts" | "tsx" => "typescript",
        "js" | "jsx" | "mjs" | "cjs" => "javascript",
        "svelte" => "svelte",
        "vue" => "vue",
        "py" => "python",
        "go" => "go",
        "java" => "java",
        "kt" => "kotlin",
        "rb" => "ruby",
        "php" => "php",
        "c" | "h" => "c",
        "cpp" | "cc" | "hpp" => "cpp",
        "cs" => "csharp",
        "swift" => "swift",
        "json" => "json",
        "toml" => "toml",
        "yaml" | "yml" => "yaml",
        "xml" => "xml",
        "html" | "htm" => "html",
        "css" => "css",
        "scss" => "scss",
        "md" | "markdown" => "markdown",
        "sql" => "sql",
        "sh" | "bash" | "zsh" => "shell",
        _ => "plaintext",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tree_lists_directories_first_and_skips_noise() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::write(root.join("b.txt"), "b").unwrap();
        std::fs::write(root.join("A.md"), "a").unwrap();
        std::fs::write(root.join(".env"), "x").unwrap();
        std::fs::create_dir_all(root.join("src/deep/deeper/deepest/bottom")).unwrap();
        std::fs::create_dir_all(root.join("node_modules/x")).unwrap();

        let nodes = tree(root).unwrap();
        let names: Vec<_> = nodes.iter().map(|n| n.name.as_str()).collect();
        assert_eq!(names, vec!["src", "A.md", "b.txt"]);
        assert_eq!(nodes[1].children, None);

        // src(0) > deep(1) > deeper(2) > deepest(3) is listed but not expanded.
        let deepest = &nodes[0].children.as_ref().unwrap()[0].children.as_ref().unwrap()[0]
            .children
            .as_ref()
            .unwrap()[0];
        assert_eq!(deepest.name, "deepest");
        assert_eq!(deepest.children, Some(Vec::new()));
    }

    #[test]
    fn read_reports_language_and_rejects_binary() {
        let dir = tempfile::tempdir().unwrap();
        let rs = dir.path().join("main.rs");
        std::fs::write(&rs, "fn main() {}").unwrap();
        let content = read(&rs).unwrap();
        assert_eq!(content.language, "rust");
        assert_eq!(content.encoding, "utf-8");

        let bin = dir.path().join("blob.bin");
        std::fs::write(&bin, [0xff, 0xfe, 0x00]).unwrap();
        assert!(matches!(read(&bin), Err(FileError::NotText)));
        assert!(matches!(read(&dir.path().join("nope")), Err(FileError::NotFound)));
    }

    #[test]
    fn create_rename_delete() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("new/inner.txt");
        create(&file, false).unwrap();
        assert!(matches!(create(&file, false), Err(FileError::AlreadyExists)));
        save(&file, "hello").unwrap();

        let moved = dir.path().join("moved.txt");
        rename(&file, &moved).unwrap();
        assert_eq!(std::fs::read_to_string(&moved).unwrap(), "hello");

        delete(&dir.path().join("new")).unwrap();
        delete(&moved).unwrap();
        assert!(matches!(delete(&moved), Err(FileError::NotFound)));
    }
}
