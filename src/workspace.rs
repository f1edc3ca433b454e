//! 工作区中的工程发现：优先 `.uvmpw` 多工程工作区，其次递归查找 `.uvproj[x]`

use std::path::{Path, PathBuf};
use std::sync::Arc;

use walkdir::WalkDir;

use crate::config::KeilSettings;
use crate::debug_println;
use crate::error::KeilError;
use crate::project::{KeilProject, ProjectLoadReport};
use crate::prober::MacroProber;
use crate::utils::{clean_path, get_clean_absolute_path};
use crate::xml::{ParseOptions, as_list, load_xml_file};

const WORKSPACE_EXTENSIONS: [&str; 1] = ["uvmpw"];
const PROJECT_EXTENSIONS: [&str; 2] = ["uvproj", "uvprojx"];

fn extension_of(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default()
}

/// 在 `dir` 中查找扩展名匹配且未被排除的文件，子目录最多深入 `depth` 层
pub fn search_files(
    dir: &Path,
    extensions: &[&str],
    depth: usize,
    exclude_list: &[String],
) -> Vec<PathBuf> {
    // WalkDir 的 0 层是 `dir` 本身
    let walker = WalkDir::new(dir)
        .max_depth(depth.saturating_add(1))
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0
                || entry.file_type().is_dir()
                || (extensions.contains(&extension_of(entry.path()).as_str())
                    && !is_excluded(entry.path(), exclude_list))
        });

    let mut found = Vec::new();
    for entry in walker {
        match entry {
            Ok(entry) if entry.file_type().is_file() => found.push(entry.into_path()),
            Ok(_) => {}
            Err(e) => {
                debug_println!("[DEBUG workspace] Skipping unreadable entry: {}", e);
            }
        }
    }
    found
}

/// 读取 `.uvmpw` 中列出的工程，路径相对 `.uvmpw` 所在目录
pub fn parse_uvmpw(path: &Path) -> Result<Vec<PathBuf>, KeilError> {
    let doc = load_xml_file(path, &ParseOptions::default())?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    let projects = as_list(doc.at(&["ProjectWorkspace", "project"]))
        .into_iter()
        .filter_map(|p| p.text_at(&["PathAndName"]))
        .filter(|p| !p.trim().is_empty())
        .map(|p| get_clean_absolute_path(base, &p))
        .collect();
    Ok(projects)
}

/// 排除列表项可以是完整文件名，也可以是扩展名（`.uvproj` 或 `uvproj`）
fn is_excluded(path: &Path, exclude_list: &[String]) -> bool {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    let ext = extension_of(path);
    exclude_list.iter().any(|item| {
        let item = item.trim().to_ascii_lowercase();
        !item.is_empty() && (item == file_name || item.trim_start_matches('.') == ext)
    })
}

/// 工作区中需要打开的所有工程文件
pub fn find_projects(workspace_dir: &Path, settings: &KeilSettings) -> Vec<PathBuf> {
    let depth = settings.find_max_depth;
    let mut projects = Vec::new();

    for uvmpw in search_files(workspace_dir, &WORKSPACE_EXTENSIONS, depth, &settings.exclude_list) {
        match parse_uvmpw(&uvmpw) {
            Ok(list) => projects.extend(list),
            Err(e) => eprintln!("Warning: Error parsing .uvmpw file {}: {}", uvmpw.display(), e),
        }
    }

    if projects.is_empty() {
        projects = search_files(workspace_dir, &PROJECT_EXTENSIONS, depth, &settings.exclude_list);
    }

    for extra in &settings.file_location_list {
        projects.push(get_clean_absolute_path(workspace_dir, extra));
    }

    let mut unique: Vec<PathBuf> = Vec::new();
    for path in projects.into_iter().map(|p| clean_path(&p)) {
        if is_excluded(&path, &settings.exclude_list) {
            debug_println!("[DEBUG workspace] Excluded {}", path.display());
            continue;
        }
        if !unique.contains(&path) {
            unique.push(path);
        }
    }
    debug_println!("[DEBUG workspace] Found {} projects", unique.len());
    unique
}

/// 打开工作区中的所有工程；单个工程失败不影响其它工程
pub struct Workspace {
    dir: PathBuf,
    settings: KeilSettings,
    prober: Arc<MacroProber>,
    multi_project: bool,
    projects: Vec<KeilProject>,
    failures: Vec<(PathBuf, KeilError)>,
}

impl Workspace {
    pub fn open(workspace_dir: &Path, settings: KeilSettings) -> Self {
        let files = find_projects(workspace_dir, &settings);
        Self::open_files(workspace_dir, settings, &files)
    }

    /// 打开指定的工程文件列表，多于一个时配置名带工程名
    pub fn open_files(workspace_dir: &Path, settings: KeilSettings, files: &[PathBuf]) -> Self {
        let prober = Arc::new(MacroProber::new(settings.probe_timeout()));
        let multi_project = files.len() > 1;
        let mut workspace = Self {
            dir: workspace_dir.to_path_buf(),
            settings,
            prober,
            multi_project,
            projects: Vec::new(),
            failures: Vec::new(),
        };

        for file in files {
            match workspace.open_project(file, multi_project) {
                Ok(report) => {
                    for (target, e) in &report.failures {
                        debug_println!("[DEBUG workspace] Target '{}' skipped: {}", target, e);
                    }
                }
                Err(e) => {
                    eprintln!("Warning: Failed to open project '{}': {}", file.display(), e);
                    workspace.failures.push((file.clone(), e));
                }
            }
        }
        workspace
    }

    fn open_project(&mut self, file: &Path, multi_project: bool) -> Result<ProjectLoadReport, KeilError> {
        let (project, report) = KeilProject::open(
            file,
            &self.dir,
            &self.settings,
            Arc::clone(&self.prober),
            multi_project,
        )?;
        self.projects.push(project);
        Ok(report)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn settings(&self) -> &KeilSettings {
        &self.settings
    }

    pub fn is_multi_project(&self) -> bool {
        self.multi_project
    }

    pub fn projects(&self) -> &[KeilProject] {
        &self.projects
    }

    pub fn projects_mut(&mut self) -> &mut [KeilProject] {
        &mut self.projects
    }

    pub fn project(&self, id: &str) -> Option<&KeilProject> {
        self.projects.iter().find(|p| p.id() == id)
    }

    /// 无法打开的工程及原因
    pub fn failures(&self) -> &[(PathBuf, KeilError)] {
        &self.failures
    }

    /// 按目标名找到第一个包含它的工程
    pub fn find_target_project(&self, target: &str) -> Option<&KeilProject> {
        self.projects.iter().find(|p| p.target(target).is_some())
    }

    pub fn close(&self) {
        for project in &self.projects {
            project.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exclude_by_name_or_extension() {
        let exclude = vec![".uvproj".to_string(), "Old.uvprojx".to_string()];
        assert!(is_excluded(Path::new("/w/a.UVPROJ"), &exclude));
        assert!(is_excluded(Path::new("/w/old.uvprojx"), &exclude));
        assert!(!is_excluded(Path::new("/w/new.uvprojx"), &exclude));
    }

    #[test]
    fn test_search_depth() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(dir.path().join("top.uvprojx"), "").unwrap();
        std::fs::write(dir.path().join("a").join("mid.uvproj"), "").unwrap();
        std::fs::write(nested.join("deep.uvprojx"), "").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "").unwrap();

        let names = |depth| -> Vec<String> {
            search_files(dir.path(), &PROJECT_EXTENSIONS, depth, &[])
                .iter()
                .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
                .collect()
        };
        assert_eq!(names(0), vec!["top.uvprojx"]);
        assert_eq!(names(1), vec!["mid.uvproj", "top.uvprojx"]);
        assert_eq!(names(2).len(), 3);
    }

    #[test]
    fn test_search_skips_excluded_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("legacy")).unwrap();
        std::fs::write(dir.path().join("app.uvprojx"), "").unwrap();
        std::fs::write(dir.path().join("Template.uvprojx"), "").unwrap();
        std::fs::write(dir.path().join("legacy").join("old.uvproj"), "").unwrap();

        let exclude = vec!["template.uvprojx".to_string(), "uvproj".to_string()];
        let found = search_files(dir.path(), &PROJECT_EXTENSIONS, 1, &exclude);
        assert_eq!(found, vec![dir.path().join("app.uvprojx")]);
    }

    #[test]
    fn test_uvmpw_takes_precedence() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("loose.uvprojx"), "").unwrap();
        std::fs::write(
            dir.path().join("all.uvmpw"),
            r#"<?xml version="1.0" encoding="UTF-8"?>
<ProjectWorkspace>
  <SchemaVersion>1.1</SchemaVersion>
  <project><PathAndName>.\boot\boot.uvprojx</PathAndName></project>
  <project><PathAndName>.\app\app.uvprojx</PathAndName></project>
</ProjectWorkspace>"#,
        )
        .unwrap();

        let found = find_projects(dir.path(), &KeilSettings::default());
        assert_eq!(
            found,
            vec![
                clean_path(&dir.path().join("boot").join("boot.uvprojx")),
                clean_path(&dir.path().join("app").join("app.uvprojx")),
            ]
        );
    }
}
