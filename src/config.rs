use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::debug_println;
use crate::error::KeilError;

const DEFAULT_KEIL_ROOT: &str = "C:\\Keil_v5";

/// Keil 安装类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    Mdk,
    C51,
    C251,
}

impl Platform {
    pub fn key(&self) -> &'static str {
        match self {
            Platform::Mdk => "MDK",
            Platform::C51 => "C51",
            Platform::C251 => "C251",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// 编译器
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolName {
    ArmClang,
    ArmCc,
    C51,
    C251,
}

impl ToolName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolName::ArmClang => "ARMCLANG",
            ToolName::ArmCc => "ARMCC",
            ToolName::C51 => "C51",
            ToolName::C251 => "C251",
        }
    }
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 外部提供的配置；显式传入解析器，不使用全局单例
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct KeilSettings {
    /// 平台（MDK/C51/C251）到安装根目录
    pub keil_home: BTreeMap<String, String>,
    /// 忽略的工程文件（文件名或扩展名）
    pub exclude_list: Vec<String>,
    /// 额外打开的工程文件
    pub file_location_list: Vec<String>,
    /// 合并到每个目标的额外头文件路径
    pub custom_include_paths: Vec<String>,
    pub find_max_depth: usize,
    pub lock_retry_delay_ms: u64,
    pub lock_retry_limit: u32,
    pub reload_debounce_ms: u64,
    pub probe_timeout_ms: u64,
    /// 构建日志的轮询间隔
    pub task_poll_interval_ms: u64,
}

impl Default for KeilSettings {
    fn default() -> Self {
        Self {
            keil_home: BTreeMap::new(),
            exclude_list: Vec::new(),
            file_location_list: Vec::new(),
            custom_include_paths: Vec::new(),
            find_max_depth: 1,
            lock_retry_delay_ms: 500,
            lock_retry_limit: 10,
            reload_debounce_ms: 2000,
            probe_timeout_ms: 10_000,
            task_poll_interval_ms: 1000,
        }
    }
}

impl KeilSettings {
    /// 从 JSON 文件加载
    pub fn from_file(path: &Path) -> Result<Self, KeilError> {
        debug_println!("[DEBUG config] Loading settings from {}", path.display());
        let content = std::fs::read_to_string(path).map_err(|e| KeilError::io(path, e))?;
        Ok(serde_json::from_str(&content)?)
    }

    /// 工作区下的 `.vscode/keil_assistant.json` 存在时加载，否则使用默认值
    pub fn discover(workspace_dir: &Path) -> Result<Self, KeilError> {
        let path = workspace_dir.join(".vscode").join("keil_assistant.json");
        if path.is_file() {
            Self::from_file(&path)
        } else {
            debug_println!("[DEBUG config] No settings file, using defaults");
            Ok(Self::default())
        }
    }

    /// 平台安装目录；未配置时回退到 MDK，再回退到默认目录
    pub fn keil_root_dir(&self, platform: Platform) -> PathBuf {
        let root = self
            .keil_home
            .get(platform.key())
            .or_else(|| self.keil_home.get(Platform::Mdk.key()))
            .map(String::as_str)
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(DEFAULT_KEIL_ROOT);
        PathBuf::from(crate::utils::to_slash(root))
    }

    pub fn toolchain(&self, platform: Platform) -> Toolchain {
        Toolchain::new(platform, self.keil_root_dir(platform))
    }

    pub fn lock_retry_delay(&self) -> Duration {
        Duration::from_millis(self.lock_retry_delay_ms)
    }

    pub fn reload_debounce(&self) -> Duration {
        Duration::from_millis(self.reload_debounce_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn task_poll_interval(&self) -> Duration {
        Duration::from_millis(self.task_poll_interval_ms.max(1))
    }
}

/// 某个 Keil 安装下的工具路径
#[derive(Debug, Clone)]
pub struct Toolchain {
    pub platform: Platform,
    pub root: PathBuf,
}

impl Toolchain {
    pub fn new(platform: Platform, root: PathBuf) -> Self {
        Self { platform, root }
    }

    fn exe(&self, parts: &[&str]) -> PathBuf {
        let mut path = self.root.clone();
        for part in parts {
            path.push(part);
        }
        let file = path
            .file_name()
            .map(|f| format!("{}{}", f.to_string_lossy(), std::env::consts::EXE_SUFFIX))
            .unwrap_or_default();
        path.set_file_name(file);
        path
    }

    pub fn compiler_path(&self, tool: ToolName) -> PathBuf {
        let path = match tool {
            ToolName::ArmClang => self.exe(&["ARM", "ARMCLANG", "bin", "armclang"]),
            ToolName::ArmCc => self.exe(&["ARM", "ARMCC", "bin", "armcc"]),
            ToolName::C51 => self.exe(&["C51", "BIN", "C51"]),
            ToolName::C251 => self.exe(&["C251", "BIN", "C251"]),
        };
        debug_println!("[DEBUG config] Compiler path for {}: {}", tool, path.display());
        path
    }

    /// 编译器自带头文件根目录
    pub fn include_root(&self, tool: ToolName) -> PathBuf {
        match tool {
            ToolName::ArmClang => self.root.join("ARM").join("ARMCLANG").join("include"),
            ToolName::ArmCc => self.root.join("ARM").join("ARMCC").join("include"),
            ToolName::C51 => self.root.join("C51").join("INC"),
            ToolName::C251 => self.root.join("C251").join("INC"),
        }
    }

    pub fn packs_dir(&self) -> PathBuf {
        self.root.join("ARM").join("Packs")
    }

    pub fn uv4_path(&self) -> PathBuf {
        self.exe(&["UV4", "UV4"])
    }

    /// 检查安装目录是否存在
    pub fn is_installed(&self) -> bool {
        let available = self.root.is_dir();
        debug_println!(
            "[DEBUG config] Keil root {} available: {}",
            self.root.display(),
            available
        );
        available
    }
}
