//! `Groups.Group` 到文件组树
//!
//! 组的 `GroupOption.CommonProperty.IncludeInBuild == 0` 时整个组被排除，
//! 排除状态在构建时就传递给每个源文件。

use std::path::{Path, PathBuf};

use crate::debug_println;
use crate::utils::get_clean_absolute_path;
use crate::xml::{XmlValue, as_list};

/// 一个源文件或头文件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    pub path: PathBuf,
    pub enabled: bool,
    /// 从依赖文件中发现的头文件，每次刷新整体替换
    pub children: Vec<Source>,
}

impl Source {
    pub fn new(path: PathBuf, enabled: bool) -> Self {
        Self {
            path,
            enabled,
            children: Vec::new(),
        }
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn icon(&self) -> &'static str {
        if self.enabled { "FileItem" } else { "FileExclude" }
    }
}

/// 工程中的一个文件组
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileGroup {
    pub name: String,
    pub disabled: bool,
    pub sources: Vec<Source>,
}

impl FileGroup {
    /// 图标只由排除状态决定
    pub fn icon(&self) -> &'static str {
        if self.disabled {
            "FolderExclude"
        } else {
            "Folder"
        }
    }
}

/// 构建结果：文件组、源文件所在目录（用于头文件路径）以及被跳过条目的提示
#[derive(Debug, Clone, Default)]
pub struct GroupTree {
    pub groups: Vec<FileGroup>,
    pub source_dirs: Vec<PathBuf>,
    pub warnings: Vec<String>,
}

fn include_in_build(node: &XmlValue, option: &str) -> bool {
    node.at(&[option, "CommonProperty", "IncludeInBuild"])
        .and_then(XmlValue::as_i64)
        != Some(0)
}

/// 从目标的 `Groups.Group` 节点构建文件组；相对路径以工程目录为基准
pub fn build_groups(groups: Option<&XmlValue>, project_dir: &Path) -> GroupTree {
    let mut tree = GroupTree::default();

    for group in as_list(groups) {
        let name = group.text_at(&["GroupName"]).unwrap_or_default();
        let file_lists = as_list(group.get("Files"));
        if file_lists.is_empty() {
            tree.warnings
                .push(format!("[Warn] Skipping group without files: '{}'", name));
            continue;
        }

        let disabled = !include_in_build(group, "GroupOption");
        let mut sources = Vec::new();

        // Files 可能是单个对象，也可能是多个 { File: [...] } 组成的数组
        for files in file_lists {
            for file in as_list(files.get("File")) {
                let raw = file.text_at(&["FilePath"]).unwrap_or_default();
                if raw.trim().is_empty() {
                    tree.warnings.push(format!(
                        "[Warn] Skipping file without path in group '{}'",
                        name
                    ));
                    continue;
                }

                let path = get_clean_absolute_path(project_dir, raw.trim());
                let enabled = !disabled && include_in_build(file, "FileOption");
                if let Some(dir) = path.parent() {
                    if !tree.source_dirs.iter().any(|d| d == dir) {
                        tree.source_dirs.push(dir.to_path_buf());
                    }
                }
                sources.push(Source::new(path, enabled));
            }
        }

        debug_println!(
            "[DEBUG groups] Group '{}' ({} files, disabled: {})",
            name,
            sources.len(),
            disabled
        );
        tree.groups.push(FileGroup {
            name,
            disabled,
            sources,
        });
    }
    tree
}
