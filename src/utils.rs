use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

// 全局调试控制标志，默认关闭
static DEBUG_MODE: AtomicBool = AtomicBool::new(false);

/// 设置调试模式
pub fn set_debug_mode(enabled: bool) {
    DEBUG_MODE.store(enabled, Ordering::Relaxed);
}

/// 获取当前调试模式状态
pub fn is_debug_mode() -> bool {
    DEBUG_MODE.load(Ordering::Relaxed)
}

/// 创建一个条件打印宏，只有在调试模式下才会打印
#[macro_export]
macro_rules! debug_println {
    ($($arg:tt)*) => {
        if $crate::is_debug_mode() {
            println!($($arg)*);
        }
    };
}

/// 将路径中的反斜杠统一替换为正斜杠
pub fn to_slash(path: &str) -> String {
    path.replace('\\', "/")
}

/// 判断是否为带盘符的 Windows 绝对路径（如 `C:/Keil_v5`）
pub fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// 逻辑上计算绝对路径（不解析符号链接或映射驱动器，保留盘符）
/// 替代 std::fs::canonicalize，避免将 Z: 解析为 UNC 路径
pub fn compute_absolute_path(path: &Path) -> std::io::Result<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    Ok(clean_path(&absolute))
}

/// 逻辑消除 "." 与 ".."，不访问文件系统
pub fn clean_path(path: &Path) -> PathBuf {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                // 已经到达根目录时忽略多余的 ".."
                if matches!(clean.components().next_back(), Some(Component::Normal(_))) {
                    clean.pop();
                } else if !clean.has_root() {
                    clean.push("..");
                }
            }
            Component::Normal(c) => clean.push(c),
            Component::RootDir => clean.push(Component::RootDir.as_os_str()),
            Component::Prefix(prefix) => clean.push(prefix.as_os_str()),
            Component::CurDir => {}
        }
    }

    if clean.as_os_str().is_empty() {
        PathBuf::from(".")
    } else {
        clean
    }
}

/// 辅助函数：逻辑上解析绝对路径（不依赖文件系统存在性，仅处理路径组件）
/// 用于解决 project_dir + ../../file.c 的路径计算；uVision 中的路径可能使用反斜杠
pub fn get_clean_absolute_path(base: &Path, rel: &str) -> PathBuf {
    let rel = to_slash(rel.trim());
    if has_drive_prefix(&rel) || Path::new(&rel).is_absolute() {
        clean_path(Path::new(&rel))
    } else {
        clean_path(&base.join(rel))
    }
}

/// 取文件所在目录（统一正斜杠）；没有斜杠时返回空串
pub fn dir_of(file_path: &str) -> String {
    let normalized = to_slash(file_path);
    match normalized.rfind('/') {
        None => String::new(),
        Some(0) => "/".to_string(),
        Some(pos) => normalized[..pos].to_string(),
    }
}

/// 将 Path 转为正斜杠字符串
pub fn path_to_slash(path: &Path) -> String {
    to_slash(&path.to_string_lossy())
}

/// 包含路径规范化：所有 include 条目都经过这一个函数，
/// 位于工作区下的目录改写为相对工作区的路径，其余保留绝对路径
#[derive(Debug, Clone)]
pub struct PathNormalizer {
    workspace_dir: PathBuf,
}

impl PathNormalizer {
    pub fn new(workspace_dir: &Path) -> Self {
        Self {
            workspace_dir: clean_path(workspace_dir),
        }
    }

    pub fn workspace_dir(&self) -> &Path {
        &self.workspace_dir
    }

    /// trim、统一分隔符、消除 `.`/`..`，再相对工作区
    pub fn normalize(&self, base: &Path, raw: &str) -> Option<String> {
        let raw = raw.trim();
        if raw.is_empty() {
            return None;
        }
        let absolute = get_clean_absolute_path(base, raw);
        Some(self.relativize(&absolute))
    }

    /// 已经是绝对路径时直接相对化
    pub fn relativize(&self, absolute: &Path) -> String {
        match absolute.strip_prefix(&self.workspace_dir) {
            Ok(rel) if rel.as_os_str().is_empty() => ".".to_string(),
            Ok(rel) => path_to_slash(rel),
            Err(_) => path_to_slash(absolute),
        }
    }

    /// 把相对工作区的 include 还原为绝对路径
    pub fn to_absolute(&self, entry: &str) -> PathBuf {
        get_clean_absolute_path(&self.workspace_dir, entry)
    }
}

/// 保持插入顺序的去重集合，保证输出稳定
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UniqueList {
    items: Vec<String>,
    seen: HashSet<String>,
}

impl UniqueList {
    pub fn new() -> Self {
        Self::default()
    }

    /// 返回是否为新插入的条目
    pub fn insert(&mut self, item: impl Into<String>) -> bool {
        let item = item.into();
        if self.seen.contains(&item) {
            return false;
        }
        self.seen.insert(item.clone());
        self.items.push(item);
        true
    }

    pub fn extend<I, S>(&mut self, items: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for item in items {
            self.insert(item);
        }
    }

    pub fn contains(&self, item: &str) -> bool {
        self.seen.contains(item)
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.seen.clear();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, String> {
        self.items.iter()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.items
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.items.clone()
    }

    pub fn into_vec(self) -> Vec<String> {
        self.items
    }
}

impl<S: Into<String>> FromIterator<S> for UniqueList {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        let mut list = UniqueList::new();
        list.extend(iter);
        list
    }
}

/// 将路径转换为Windows 8.3短文件名格式
/// 如果路径不包含空格或转换失败，则返回原始路径
#[cfg(windows)]
pub fn get_short_path(path: &str) -> String {
    use std::ffi::{OsStr, OsString};
    use std::os::windows::ffi::{OsStrExt, OsStringExt};
    use windows_sys::Win32::Foundation::GetLastError;
    use windows_sys::Win32::Storage::FileSystem::GetShortPathNameW;

    // Windows MAX_PATH常量定义
    const MAX_PATH: u32 = 260;

    if !path.contains(' ') {
        return path.to_string();
    }
    debug_println!("[DEBUG utils] Path contains spaces, need to get short path: {}", path);

    let wide_chars: Vec<u16> = OsStr::new(path).encode_wide().chain(Some(0)).collect();
    let mut buffer: Vec<u16> = vec![0; MAX_PATH as usize];

    let mut result =
        unsafe { GetShortPathNameW(wide_chars.as_ptr(), buffer.as_mut_ptr(), buffer.len() as u32) };

    // 如果结果大于缓冲区大小，需要更大的缓冲区
    if result as usize > buffer.len() {
        buffer.resize(result as usize, 0);
        result =
            unsafe { GetShortPathNameW(wide_chars.as_ptr(), buffer.as_mut_ptr(), buffer.len() as u32) };
    }

    if result == 0 || result as usize > buffer.len() {
        let error = unsafe { GetLastError() };
        debug_println!("[DEBUG utils] GetShortPathNameW failed: Win32 error {}", error);
        return path.to_string();
    }

    let short = OsString::from_wide(&buffer[..result as usize]);
    to_slash(&short.to_string_lossy())
}

/// 非 Windows 平台没有 8.3 短文件名，原样返回
#[cfg(not(windows))]
pub fn get_short_path(path: &str) -> String {
    path.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_mode_toggle() {
        set_debug_mode(true);
        assert!(is_debug_mode());

        set_debug_mode(false);
        assert!(!is_debug_mode());
    }

    #[test]
    fn test_compute_absolute_path() {
        let p = Path::new("test/../src/main.rs");
        let abs = compute_absolute_path(p).unwrap();
        assert!(abs.is_absolute());
        // 验证逻辑消除是否生效 (字符串中不应包含 ..)
        assert!(!abs.to_string_lossy().contains(".."));
    }

    #[test]
    fn test_clean_absolute_path_with_backslashes() {
        let base = Path::new("/work/app/MDK-ARM");
        let path = get_clean_absolute_path(base, "..\\Core\\Inc");
        assert_eq!(path_to_slash(&path), "/work/app/Core/Inc");
    }

    #[test]
    fn test_drive_paths_are_not_joined() {
        let base = Path::new("/work/app");
        let path = get_clean_absolute_path(base, "C:\\Keil_v5\\ARM\\..\\C51\\INC");
        assert_eq!(path_to_slash(&path), "C:/Keil_v5/C51/INC");
    }

    #[test]
    fn test_dir_of() {
        assert_eq!(dir_of("Drivers\\CMSIS\\Include\\core_cm4.h"), "Drivers/CMSIS/Include");
        assert_eq!(dir_of("/main.c"), "/");
        assert_eq!(dir_of("main.c"), "");
    }

    #[test]
    fn test_normalizer_collapses_equivalent_routes() {
        let normalizer = PathNormalizer::new(Path::new("/work/app"));
        let project_dir = Path::new("/work/app/MDK-ARM");

        let a = normalizer.normalize(project_dir, "../Core/Inc").unwrap();
        let b = normalizer.normalize(project_dir, "/work/app/Core/./Inc/").unwrap();
        let c = normalizer.normalize(project_dir, " .\\..\\Core\\Inc ").unwrap();
        assert_eq!(a, "Core/Inc");
        assert_eq!(a, b);
        assert_eq!(a, c);

        assert_eq!(normalizer.normalize(project_dir, "..").unwrap(), ".");
        assert_eq!(normalizer.normalize(project_dir, "/opt/keil/inc").unwrap(), "/opt/keil/inc");
        assert!(normalizer.normalize(project_dir, "   ").is_none());
    }

    #[test]
    fn test_unique_list_keeps_first_insertion_order() {
        let mut list = UniqueList::new();
        assert!(list.insert("b"));
        assert!(list.insert("a"));
        assert!(!list.insert("b"));
        assert_eq!(list.to_vec(), vec!["b", "a"]);
        list.clear();
        assert!(list.is_empty());
    }
}
