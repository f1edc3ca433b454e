//! CMSIS-Pack 解析
//!
//! 根据工程 RTE 节点中声明的组件，找到 `<Packs>/<vendor>/<name>/<version>` 下的
//! `.pdsc` 描述文件，匹配组件后收集其头文件目录与预包含宏。
//! 所有候选目录都必须在磁盘上存在，否则静默丢弃（pack 安装不完整是常见情况）。

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::config::ToolName;
use crate::debug_println;
use crate::macros::extract_defines;
use crate::utils::{PathNormalizer, UniqueList, dir_of, get_clean_absolute_path};
use crate::xml::{ParseOptions, XmlValue, as_list, load_xml_file};

/// 组件身份，用于在 .pdsc 中查找工程声明的组件
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PackComponentKey {
    pub class: String,
    pub group: String,
    pub subclass: Option<String>,
    pub vendor: Option<String>,
    pub version: Option<String>,
    pub condition: Option<String>,
    pub bundle: Option<String>,
}

impl PackComponentKey {
    /// 从 `<component Cclass=.. Cgroup=.. ...>` 节点读取
    pub fn from_node(node: &XmlValue) -> Option<Self> {
        Some(Self {
            class: node.attr("Cclass")?,
            group: node.attr("Cgroup")?,
            subclass: node.attr("Csub"),
            vendor: node.attr("Cvendor"),
            version: node.attr("Cversion"),
            condition: node.attr("condition"),
            bundle: node.attr("Cbundle"),
        })
    }

    /// class/group/version/condition 必须相同；双方都有 Csub 时 Csub 也要相同
    pub fn matches(&self, candidate: &PackComponentKey) -> bool {
        let sub_eq = match (&self.subclass, &candidate.subclass) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        };
        self.class == candidate.class
            && self.group == candidate.group
            && self.version == candidate.version
            && self.condition == candidate.condition
            && sub_eq
    }
}

/// 工程组件引用的 pack（`<package name= vendor= version=>`）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageRef {
    pub name: String,
    pub vendor: String,
    pub version: String,
}

impl PackageRef {
    pub fn from_node(node: &XmlValue) -> Option<Self> {
        let package = node.get("package")?;
        Some(Self {
            name: package.attr("name")?,
            vendor: package.attr("vendor")?,
            version: package.attr("version")?,
        })
    }

    /// `<packsRoot>/<vendor>/<name>/<version>`
    pub fn root_dir(&self, packs_dir: &Path) -> PathBuf {
        packs_dir.join(&self.vendor).join(&self.name).join(&self.version)
    }
}

/// 根据 CPU 类型、FPU 代码与编译器推导 RTOS 库文件使用的条件名，
/// 例如 `("Cortex-M4", Some("2"), ARMCLANG)` → `CM4_FP_ARMCC6`。
/// 这是根据厂商工具行为推断的规则，未知 CPU 返回 None。
pub fn rots_condition(cpu: &str, fpu: Option<&str>, tool: ToolName) -> Option<String> {
    let (core, fp_capable) = match cpu.trim().trim_matches('"') {
        "Cortex-M0" | "Cortex-M0+" | "Cortex-M1" | "SC000" => ("CM0", false),
        "Cortex-M3" | "SC300" => ("CM3", false),
        "Cortex-M4" => ("CM4", true),
        "Cortex-M7" => ("CM7", true),
        "Cortex-M23" | "ARMV8MBL" => ("ARMv8MBL", false),
        "Cortex-M33" | "Cortex-M35P" | "ARMV8MML" => ("ARMv8MML", true),
        "Cortex-M55" | "Cortex-M85" | "ARMV81MML" => ("ARMv81MML", true),
        _ => return None,
    };
    let compiler = match tool {
        ToolName::ArmClang => "ARMCC6",
        ToolName::ArmCc => "ARMCC5",
        ToolName::C51 | ToolName::C251 => return None,
    };
    let has_fp = fp_capable && matches!(fpu.map(str::trim), Some("2") | Some("3"));

    Some(if has_fp {
        format!("{core}_FP_{compiler}")
    } else {
        format!("{core}_{compiler}")
    })
}

/// 解析所需的目标信息
#[derive(Debug, Clone)]
pub struct PackContext<'a> {
    pub packs_dir: &'a Path,
    pub project_dir: &'a Path,
    pub target_name: &'a str,
    pub rots_condition: Option<String>,
    /// 目标中的文件组名；`::` 开头的是 uVision 生成的 RTE 组
    pub group_names: Vec<String>,
    pub normalizer: &'a PathNormalizer,
}

/// 解析结果：头文件目录和 RTE 相关宏
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackResolution {
    pub includes: Vec<String>,
    pub defines: Vec<String>,
}

/// 只有这些 API 类的头文件目录无条件加入
const RTOS_APIS: [(&str, &str); 2] = [("CMSIS", "RTOS2"), ("Device", "OS Tick")];

/// 一次解析的状态；.pdsc 缓存只在本次调用内有效，
/// 两次解析之间 pack 可能被更新
pub struct PackResolver<'a> {
    ctx: PackContext<'a>,
    options: ParseOptions,
    pdsc_cache: HashMap<PathBuf, Option<XmlValue>>,
    includes: UniqueList,
    defines: UniqueList,
}

/// 解析 RTE 节点，返回头文件目录与宏
pub fn resolve_includes_and_macros(ctx: PackContext<'_>, rte: &XmlValue) -> PackResolution {
    PackResolver::new(ctx).resolve(rte)
}

impl<'a> PackResolver<'a> {
    pub fn new(ctx: PackContext<'a>) -> Self {
        Self {
            ctx,
            options: ParseOptions::pack_descriptor(),
            pdsc_cache: HashMap::new(),
            includes: UniqueList::new(),
            defines: UniqueList::new(),
        }
    }

    pub fn resolve(mut self, rte: &XmlValue) -> PackResolution {
        for component in as_list(rte.at(&["components", "component"])) {
            self.resolve_component(component);
        }

        for api in as_list(rte.at(&["apis", "api"])) {
            self.resolve_api(api);
        }

        for file in as_list(rte.at(&["files", "file"])) {
            self.resolve_config_file(file);
        }

        if self.ctx.group_names.iter().any(|name| name.starts_with("::")) {
            self.resolve_generated_rte_dir();
        }

        debug_println!(
            "[DEBUG pack] Resolved {} include dirs, {} macros",
            self.includes.len(),
            self.defines.len()
        );
        PackResolution {
            includes: self.includes.into_vec(),
            defines: self.defines.into_vec(),
        }
    }

    fn resolve_component(&mut self, component: &XmlValue) {
        let Some(key) = PackComponentKey::from_node(component) else {
            debug_println!("[DEBUG pack] Component without Cclass/Cgroup, skipped");
            return;
        };
        let Some(package) = PackageRef::from_node(component) else {
            debug_println!("[DEBUG pack] Component {}:{} has no package", key.class, key.group);
            return;
        };

        let root = package.root_dir(self.ctx.packs_dir);
        let Some(pdsc_path) = self.descriptor_path(&root, &package, key.vendor.as_deref()) else {
            return;
        };
        let Some(pdsc) = self.load_descriptor(&pdsc_path) else {
            return;
        };

        let matched: Vec<XmlValue> = find_components(&pdsc, &key).into_iter().cloned().collect();
        for pdsc_component in &matched {
            self.collect_component_files(&root, pdsc_component);
        }
    }

    fn resolve_api(&mut self, api: &XmlValue) {
        let (Some(class), Some(group)) = (api.attr("Cclass"), api.attr("Cgroup")) else {
            return;
        };
        if !RTOS_APIS.iter().any(|(c, g)| *c == class && *g == group) {
            return;
        }
        let Some(package) = PackageRef::from_node(api) else {
            return;
        };

        let root = package.root_dir(self.ctx.packs_dir);
        let Some(pdsc_path) = self.descriptor_path(&root, &package, api.attr("Cvendor").as_deref())
        else {
            return;
        };
        let Some(pdsc) = self.load_descriptor(&pdsc_path) else {
            return;
        };

        let dirs: Vec<PathBuf> = as_list(pdsc.at(&["package", "apis", "api"]))
            .into_iter()
            .filter(|p| p.attr("Cclass").as_deref() == Some(class.as_str()))
            .filter(|p| p.attr("Cgroup").as_deref() == Some(group.as_str()))
            .flat_map(|p| as_list(p.at(&["files", "file"])))
            .filter_map(|file| {
                let name = file.attr("name")?;
                match file.attr("category").as_deref() {
                    Some("include") => Some(get_clean_absolute_path(&root, &name)),
                    Some("header") => Some(get_clean_absolute_path(&root, &dir_of(&name))),
                    _ => None,
                }
            })
            .collect();

        for dir in dirs {
            self.add_existing(&dir);
        }
    }

    /// 工程自己的 RTE 配置文件（attr="config"），路径相对工程目录
    fn resolve_config_file(&mut self, file: &XmlValue) {
        if file.attr("attr").as_deref() != Some("config") {
            return;
        }
        if !matches!(
            file.attr("category").as_deref(),
            Some("header") | Some("preIncludeGlobal")
        ) {
            return;
        }

        let target_infos = as_list(file.at(&["targetInfos", "targetInfo"]));
        if !target_infos.is_empty()
            && !target_infos
                .iter()
                .any(|info| info.attr("name").as_deref() == Some(self.ctx.target_name))
        {
            return;
        }

        let dirs: Vec<PathBuf> = as_list(file.get("instance"))
            .into_iter()
            .filter_map(XmlValue::text)
            .map(|instance| get_clean_absolute_path(self.ctx.project_dir, &dir_of(&instance)))
            .collect();
        for dir in dirs {
            self.add_existing(&dir);
        }
    }

    /// `RTE/_<target>` 目录，以及其中生成的头文件里的宏
    fn resolve_generated_rte_dir(&mut self) {
        let dir = self
            .ctx
            .project_dir
            .join("RTE")
            .join(format!("_{}", self.ctx.target_name.replace(' ', "_")));
        self.add_existing(&dir);

        let Ok(entries) = std::fs::read_dir(&dir) else {
            return;
        };
        let mut files: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .collect();
        files.sort();

        for file in files {
            match std::fs::read(&file) {
                Ok(bytes) => {
                    let content = String::from_utf8_lossy(&bytes);
                    self.defines.extend(extract_defines(&content));
                }
                Err(e) => {
                    debug_println!("[DEBUG pack] Cannot read {}: {}", file.display(), e);
                }
            }
        }
    }

    fn collect_component_files(&mut self, root: &Path, component: &XmlValue) {
        let mut pre_include_done = false;

        for file in as_list(component.at(&["files", "file"])) {
            if file.attr("attr").as_deref() == Some("config") {
                continue;
            }
            if let Some(condition) = file.attr("condition") {
                if self.ctx.rots_condition.as_deref() != Some(condition.as_str()) {
                    continue;
                }
            }
            let Some(name) = file.attr("name") else {
                continue;
            };

            match file.attr("category").as_deref() {
                Some("include") => {
                    self.add_existing(&get_clean_absolute_path(root, &name));
                }
                Some("header") => {
                    self.add_existing(&get_clean_absolute_path(root, &dir_of(&name)));
                }
                Some("preIncludeGlobal") if is_header(&name) => {
                    self.add_existing(&get_clean_absolute_path(root, &dir_of(&name)));
                    if !pre_include_done {
                        pre_include_done = true;
                        if let Some(text) = component.text_at(&["Pre_Include_Global_h"]) {
                            self.defines.extend(extract_defines(&text));
                        }
                    }
                }
                _ => {}
            }
        }
    }

    /// 描述文件名使用 pack 厂商；不存在时再尝试组件厂商
    fn descriptor_path(
        &self,
        root: &Path,
        package: &PackageRef,
        component_vendor: Option<&str>,
    ) -> Option<PathBuf> {
        let mut candidates = vec![root.join(format!("{}.{}.pdsc", package.vendor, package.name))];
        if let Some(vendor) = component_vendor {
            if vendor != package.vendor {
                candidates.push(root.join(format!("{}.{}.pdsc", vendor, package.name)));
            }
        }
        let found = candidates.into_iter().find(|p| p.is_file());
        if found.is_none() {
            debug_println!("[DEBUG pack] No descriptor under {}", root.display());
        }
        found
    }

    /// 每个路径只解析一次；解析失败记为 None，该 pack 的组件被跳过
    fn load_descriptor(&mut self, path: &Path) -> Option<XmlValue> {
        if let Some(cached) = self.pdsc_cache.get(path) {
            return cached.clone();
        }
        let parsed = match load_xml_file(path, &self.options) {
            Ok(doc) => Some(doc),
            Err(e) => {
                debug_println!("[DEBUG pack] Skipping broken descriptor: {}", e);
                None
            }
        };
        self.pdsc_cache.insert(path.to_path_buf(), parsed.clone());
        parsed
    }

    fn add_existing(&mut self, dir: &Path) {
        if dir.exists() {
            self.includes.insert(self.ctx.normalizer.relativize(dir));
        } else {
            debug_println!("[DEBUG pack] Missing path dropped: {}", dir.display());
        }
    }
}

fn is_header(name: &str) -> bool {
    let lower = name.to_ascii_lowercase();
    lower.ends_with(".h") || lower.ends_with(".hpp")
}

/// 在描述文件中查找匹配的组件；带 Cbundle 的声明在同名 bundle 内查找，
/// bundle 内组件缺省继承 bundle 的 Cclass/Cversion
pub fn find_components<'d>(pdsc: &'d XmlValue, key: &PackComponentKey) -> Vec<&'d XmlValue> {
    let components = pdsc.at(&["package", "components"]);

    match &key.bundle {
        Some(bundle_name) => as_list(components.and_then(|c| c.get("bundle")))
            .into_iter()
            .filter(|bundle| bundle.attr("Cbundle").as_deref() == Some(bundle_name.as_str()))
            .flat_map(|bundle| {
                as_list(bundle.get("component"))
                    .into_iter()
                    .filter(move |component| {
                        let candidate = PackComponentKey {
                            class: component
                                .attr("Cclass")
                                .or_else(|| bundle.attr("Cclass"))
                                .unwrap_or_default(),
                            group: component.attr("Cgroup").unwrap_or_default(),
                            subclass: component.attr("Csub"),
                            vendor: None,
                            version: component.attr("Cversion").or_else(|| bundle.attr("Cversion")),
                            condition: component.attr("condition"),
                            bundle: Some(bundle_name.clone()),
                        };
                        key.matches(&candidate)
                    })
            })
            .collect(),
        None => as_list(components.and_then(|c| c.get("component")))
            .into_iter()
            .filter(|component| {
                PackComponentKey::from_node(component)
                    .map(|candidate| key.matches(&candidate))
                    .unwrap_or(false)
            })
            .collect(),
    }
}
