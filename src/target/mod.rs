//! 单个构建目标的配置解析
//!
//! `Target::load` 负责通用的编排：头文件路径、宏、文件组、IntelliSense 配置、
//! 依赖文件。工程格式在不同工具链之间的差异由 [`TargetFamily`] 的各个实现描述。

mod arm;
mod c51;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

pub use arm::{ArmFamily, CpuInfo};
pub use c51::C5xFamily;

use crate::config::{KeilSettings, Platform, ToolName, Toolchain};
use crate::debug_println;
use crate::deps::DependencyCache;
use crate::error::KeilError;
use crate::generator::{generate_compile_commands, update_compile_commands, update_cpp_properties};
use crate::groups::{FileGroup, Source, build_groups};
use crate::models::CppProperty;
use crate::pack::PackResolution;
use crate::prober::MacroProber;
use crate::task::{ProcessLauncher, TaskHandle, TaskKind, TaskOutput, TaskSpec, spawn_task};
use crate::utils::{PathNormalizer, UniqueList, get_clean_absolute_path, path_to_slash};
use crate::xml::{XmlValue, as_list};

/// family 钩子可用的外部信息
pub struct FamilyContext<'a> {
    pub toolchain: &'a Toolchain,
    pub prober: &'a MacroProber,
    pub project_dir: &'a Path,
    pub target_name: &'a str,
    pub normalizer: &'a PathNormalizer,
}

/// 工具链差异（ARM / C51 / C251）
pub trait TargetFamily: fmt::Debug + Send + Sync {
    /// Keil 安装类型，决定使用哪个安装目录
    fn keil_platform(&self) -> Platform;

    /// 目标 XML 结构是否与本工具链相符
    fn check_project(&self, target: &XmlValue) -> Result<(), String>;

    fn get_tool_name(&self, target: &XmlValue) -> ToolName;

    /// 工程中声明的头文件路径，`;` 分隔
    fn get_inc_string(&self, target: &XmlValue) -> String;

    /// 工程中声明的宏，`,` 或空白分隔
    fn get_define_string(&self, target: &XmlValue) -> String;

    fn get_sys_defines(&self, ctx: &FamilyContext<'_>, target: &XmlValue) -> Vec<String>;

    /// 存在任何 RTE 组件或 API 声明时定义 `_RTE_`
    fn get_rte_defines(&self, rte: Option<&XmlValue>) -> Vec<String> {
        let Some(rte) = rte else {
            return Vec::new();
        };
        let has_components = !as_list(rte.at(&["components", "component"])).is_empty();
        let has_apis = !as_list(rte.at(&["apis", "api"])).is_empty();
        if has_components || has_apis {
            vec!["_RTE_".to_string()]
        } else {
            Vec::new()
        }
    }

    fn get_groups<'d>(&self, target: &'d XmlValue) -> Option<&'d XmlValue> {
        target.at(&["Groups", "Group"])
    }

    fn get_system_includes(&self, ctx: &FamilyContext<'_>, target: &XmlValue) -> Vec<PathBuf>;

    fn get_rte_includes(
        &self,
        _ctx: &FamilyContext<'_>,
        _target: &XmlValue,
        _rte: &XmlValue,
    ) -> PackResolution {
        PackResolution::default()
    }

    /// 编译输出目录（`.d` 文件所在处），相对工程目录
    fn get_output_folder(&self, _target: &XmlValue) -> Option<String> {
        None
    }

    fn parse_ref_lines(&self, _target: &XmlValue, _lines: &[&str]) -> Vec<String> {
        Vec::new()
    }

    fn get_c_standard(&self, target: &XmlValue) -> String;

    fn get_cpp_standard(&self, target: &XmlValue) -> String;

    fn get_intellisense_mode(&self, target: &XmlValue) -> String;
}

/// 根据工程文件扩展名与目标结构选择工具链：
/// `.uvproj` 中有 `Target51` 为 C51，有 `Target251` 为 C251，其余为 ARM；`.uvprojx` 总是 ARM
pub fn select_family(project_file: &Path, target: &XmlValue) -> Box<dyn TargetFamily> {
    let is_legacy = project_file
        .extension()
        .map(|ext| ext.to_string_lossy().eq_ignore_ascii_case("uvproj"))
        .unwrap_or(false);

    if is_legacy {
        if target.at(&["TargetOption", "Target51"]).is_some() {
            return Box::new(C5xFamily::c51());
        }
        if target.at(&["TargetOption", "Target251"]).is_some() {
            return Box::new(C5xFamily::c251());
        }
    }
    Box::new(ArmFamily)
}

/// 目标所在工程的路径信息
#[derive(Debug, Clone)]
pub struct TargetPaths {
    pub project_file: PathBuf,
    pub project_dir: PathBuf,
    pub workspace_dir: PathBuf,
}

impl TargetPaths {
    pub fn new(project_file: &Path, workspace_dir: &Path) -> Self {
        let project_dir = project_file
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            project_file: project_file.to_path_buf(),
            project_dir,
            workspace_dir: workspace_dir.to_path_buf(),
        }
    }

    pub fn vscode_dir(&self) -> PathBuf {
        self.workspace_dir.join(".vscode")
    }
}

/// load 所需的共享资源
pub struct LoadEnv<'a> {
    pub settings: &'a KeilSettings,
    pub prober: &'a MacroProber,
}

/// 一次 load 的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub cpp_properties_written: bool,
    pub compile_commands_written: bool,
    pub warnings: Vec<String>,
}

/// 一个构建目标
///
/// `task_running` 由所属工程按目标名持有，重新加载后仍是同一个标记
pub struct Target {
    name: String,
    config_name: String,
    family: Box<dyn TargetFamily>,
    dom: XmlValue,
    rte: Option<XmlValue>,
    paths: TargetPaths,
    normalizer: PathNormalizer,

    includes: UniqueList,
    defines: UniqueList,
    groups: Vec<FileGroup>,
    c_standard: String,
    cpp_standard: String,
    intellisense_mode: String,
    tool: Option<ToolName>,
    compiler_path: Option<PathBuf>,
    loaded: bool,

    dep_cache: DependencyCache,
    task_running: Arc<AtomicBool>,
}

impl fmt::Debug for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Target")
            .field("name", &self.name)
            .field("config_name", &self.config_name)
            .field("family", &self.family)
            .field("loaded", &self.loaded)
            .finish()
    }
}

impl Target {
    pub fn new(
        family: Box<dyn TargetFamily>,
        dom: XmlValue,
        rte: Option<XmlValue>,
        paths: TargetPaths,
        config_name: String,
        task_running: Arc<AtomicBool>,
    ) -> Self {
        let name = dom.text_at(&["TargetName"]).unwrap_or_default();
        let normalizer = PathNormalizer::new(&paths.workspace_dir);
        Self {
            name,
            config_name,
            family,
            dom,
            rte,
            paths,
            normalizer,
            includes: UniqueList::new(),
            defines: UniqueList::new(),
            groups: Vec::new(),
            c_standard: String::new(),
            cpp_standard: String::new(),
            intellisense_mode: String::new(),
            tool: None,
            compiler_path: None,
            loaded: false,
            dep_cache: DependencyCache::new(),
            task_running,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// c_cpp_properties.json 中的配置名
    pub fn config_name(&self) -> &str {
        &self.config_name
    }

    pub fn family(&self) -> &dyn TargetFamily {
        self.family.as_ref()
    }

    pub fn platform(&self) -> Platform {
        self.family.keil_platform()
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded
    }

    pub fn includes(&self) -> &[String] {
        self.includes.as_slice()
    }

    pub fn defines(&self) -> &[String] {
        self.defines.as_slice()
    }

    pub fn groups(&self) -> &[FileGroup] {
        &self.groups
    }

    pub fn c_standard(&self) -> &str {
        &self.c_standard
    }

    pub fn cpp_standard(&self) -> &str {
        &self.cpp_standard
    }

    pub fn intellisense_mode(&self) -> &str {
        &self.intellisense_mode
    }

    pub fn tool_name(&self) -> Option<ToolName> {
        self.tool
    }

    pub fn compiler_path(&self) -> Option<&Path> {
        self.compiler_path.as_deref()
    }

    pub fn is_task_running(&self) -> bool {
        self.task_running.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// 完整重新计算目标配置并写出 IntelliSense 文件
    ///
    /// 结构校验失败时直接返回错误，之前 load 的结果保持不变
    pub fn load(&mut self, env: &LoadEnv<'_>) -> Result<LoadReport, KeilError> {
        debug_println!("[DEBUG target] Loading target '{}'", self.name);

        self.family
            .check_project(&self.dom)
            .map_err(|message| KeilError::StructuralValidation {
                target: self.name.clone(),
                message,
            })?;

        let toolchain = env.settings.toolchain(self.family.keil_platform());
        let mut report = LoadReport::default();
        if !toolchain.is_installed() {
            report.warnings.push(format!(
                "[Warn] Keil {} not found at '{}', system includes and defines may be incomplete",
                toolchain.platform.key(),
                toolchain.root.display()
            ));
        }
        let ctx = FamilyContext {
            toolchain: &toolchain,
            prober: env.prober,
            project_dir: &self.paths.project_dir,
            target_name: &self.name,
            normalizer: &self.normalizer,
        };

        let tool = self.family.get_tool_name(&self.dom);
        let c_standard = self.family.get_c_standard(&self.dom);
        let cpp_standard = self.family.get_cpp_standard(&self.dom);
        let intellisense_mode = self.family.get_intellisense_mode(&self.dom).replace('\\', "/");

        // 头文件路径：系统目录 → RTE/pack → 工程声明 → 额外配置 → 源文件目录
        let mut includes = UniqueList::new();
        for dir in self.family.get_system_includes(&ctx, &self.dom) {
            includes.insert(self.normalizer.relativize(&dir));
        }

        let mut rte_macros = Vec::new();
        if let Some(rte) = &self.rte {
            let resolution = self.family.get_rte_includes(&ctx, &self.dom, rte);
            includes.extend(resolution.includes);
            rte_macros = resolution.defines;
        }

        for entry in self.family.get_inc_string(&self.dom).split(';') {
            if let Some(normalized) = self.normalizer.normalize(&self.paths.project_dir, entry) {
                includes.insert(normalized);
            }
        }

        for entry in &env.settings.custom_include_paths {
            if let Some(normalized) = self.normalizer.normalize(&self.paths.workspace_dir, entry) {
                includes.insert(normalized);
            }
        }

        let tree = build_groups(self.family.get_groups(&self.dom), &self.paths.project_dir);
        for dir in &tree.source_dirs {
            includes.insert(self.normalizer.relativize(dir));
        }
        report.warnings.extend(tree.warnings);

        // 宏：工程声明 → RTE → 工具链
        let mut defines = UniqueList::new();
        defines.extend(
            self.family
                .get_define_string(&self.dom)
                .split(|c: char| c == ',' || c.is_whitespace())
                .filter(|d| !d.trim().is_empty())
                .map(str::to_string),
        );
        defines.extend(self.family.get_rte_defines(self.rte.as_ref()));
        defines.extend(rte_macros);
        defines.extend(self.family.get_sys_defines(&ctx, &self.dom));

        let compiler_path = toolchain.compiler_path(tool);

        // 全部计算完成后一次性替换，不存在中间状态
        self.includes = includes;
        self.defines = defines;
        self.groups = tree.groups;
        self.c_standard = c_standard;
        self.cpp_standard = cpp_standard;
        self.intellisense_mode = intellisense_mode;
        self.tool = Some(tool);
        self.compiler_path = Some(compiler_path);
        self.dep_cache.clear();
        self.loaded = true;

        debug_println!(
            "[DEBUG target] '{}': {} includes, {} defines, {} groups",
            self.name,
            self.includes.len(),
            self.defines.len(),
            self.groups.len()
        );

        report.cpp_properties_written = self.update_cpp_properties()?;
        report.compile_commands_written = self.update_compile_commands()?;
        self.update_source_refs();

        Ok(report)
    }

    /// 当前配置对应的 IntelliSense 条目
    pub fn cpp_property(&self) -> CppProperty {
        let is_arm = self.family.keil_platform() == Platform::Mdk;
        let compiler_args = match self.tool {
            Some(ToolName::ArmClang) => Some(vec!["--target=arm-arm-none-eabi".to_string()]),
            _ => None,
        };
        CppProperty {
            name: self.config_name.clone(),
            c_standard: self.c_standard.clone(),
            cpp_standard: self.cpp_standard.clone(),
            compiler_path: if is_arm {
                self.compiler_path.as_deref().map(path_to_slash)
            } else {
                None
            },
            compiler_args,
            include_path: self.includes.to_vec(),
            defines: self.defines.to_vec(),
            intelli_sense_mode: self.intellisense_mode.clone(),
        }
    }

    fn update_cpp_properties(&self) -> Result<bool, KeilError> {
        let path = self.paths.vscode_dir().join("c_cpp_properties.json");
        update_cpp_properties(&path, &self.cpp_property())
    }

    /// 仅 MDK 目标生成 compile_commands.json
    fn update_compile_commands(&self) -> Result<bool, KeilError> {
        if self.family.keil_platform() != Platform::Mdk {
            return Ok(false);
        }
        let Some(compiler) = &self.compiler_path else {
            return Ok(false);
        };

        let absolute_includes: Vec<String> = self
            .includes
            .iter()
            .map(|inc| path_to_slash(&self.normalizer.to_absolute(inc)))
            .collect();
        let entries = generate_compile_commands(
            &self.config_name,
            compiler,
            &self.c_standard,
            &self.cpp_standard,
            self.defines.as_slice(),
            &absolute_includes,
            &self.groups,
        );
        let path = self.paths.workspace_dir.join("compile_commands.json");
        update_compile_commands(&path, &self.config_name, &entries)
    }

    /// 用 `.d` 依赖文件为启用的源文件挂上引用的头文件
    pub fn update_source_refs(&mut self) {
        let Some(out_dir) = self.family.get_output_folder(&self.dom) else {
            return;
        };
        let out_path = get_clean_absolute_path(&self.paths.project_dir, &out_dir);
        let project_dir = &self.paths.project_dir;
        let family = &self.family;
        let dom = &self.dom;
        let cache = &mut self.dep_cache;

        for group in &mut self.groups {
            for source in group.sources.iter_mut().filter(|s| s.enabled) {
                let Some(stem) = source.path.file_stem().map(|s| s.to_string_lossy().into_owned())
                else {
                    continue;
                };
                let refs = cache.refs_for(&out_path, &stem, |lines| family.parse_ref_lines(dom, lines));
                source.children = refs
                    .iter()
                    .map(|r| Source::new(get_clean_absolute_path(project_dir, r), true))
                    .collect();
            }
        }
    }

    pub fn build(
        &self,
        settings: &KeilSettings,
        launcher: Arc<dyn ProcessLauncher>,
        output: Arc<dyn TaskOutput>,
    ) -> Result<TaskHandle, KeilError> {
        self.run_task(TaskKind::Build, settings, launcher, output)
    }

    pub fn rebuild(
        &self,
        settings: &KeilSettings,
        launcher: Arc<dyn ProcessLauncher>,
        output: Arc<dyn TaskOutput>,
    ) -> Result<TaskHandle, KeilError> {
        self.run_task(TaskKind::Rebuild, settings, launcher, output)
    }

    pub fn download(
        &self,
        settings: &KeilSettings,
        launcher: Arc<dyn ProcessLauncher>,
        output: Arc<dyn TaskOutput>,
    ) -> Result<TaskHandle, KeilError> {
        self.run_task(TaskKind::Download, settings, launcher, output)
    }

    pub fn run_task(
        &self,
        kind: TaskKind,
        settings: &KeilSettings,
        launcher: Arc<dyn ProcessLauncher>,
        output: Arc<dyn TaskOutput>,
    ) -> Result<TaskHandle, KeilError> {
        let toolchain = settings.toolchain(self.family.keil_platform());
        let spec = TaskSpec {
            kind,
            uv4: toolchain.uv4_path(),
            project_file: self.paths.project_file.clone(),
            project_dir: self.paths.project_dir.clone(),
            target_name: self.name.clone(),
            log_file: self
                .paths
                .vscode_dir()
                .join(format!("{}_uv4.log", self.name)),
            poll_interval: settings.task_poll_interval(),
        };
        spawn_task(&self.task_running, spec, launcher, output)
    }
}
