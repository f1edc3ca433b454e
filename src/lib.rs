// 公共API暴露
mod cli;
mod config;
mod deps;
mod error;
mod generator;
mod groups;
mod macros;
mod models;
mod pack;
mod project;
mod prober;
mod target;
mod task;
mod utils;
mod workspace;
mod xml;

pub use cli::{CliArgs, parse_args, parse_from};
pub use config::{KeilSettings, Platform, ToolName, Toolchain};
pub use deps::{DepDialect, DependencyCache, parse_armcc_ref_lines, parse_gnu_ref_lines};
pub use error::KeilError;
pub use generator::{
    generate_compile_commands, merge_compile_commands, merge_cpp_properties, update_compile_commands,
    update_cpp_properties,
};
pub use groups::{FileGroup, GroupTree, Source, build_groups};
pub use macros::{MacroHandler, extract_defines};
pub use models::{CompileCommand, CppProperty, ProjectEntry, ProjectProperties};
pub use pack::{
    PackComponentKey, PackContext, PackResolution, PackResolver, resolve_includes_and_macros,
    rots_condition,
};
pub use project::{KeilProject, ObserverId, ProjectEvent, ProjectLoadReport, ReloadGate, retry_locked};
pub use prober::{FALLBACK_MACROS, MacroProber, arm_cpu_flag, parse_macro_dump};
pub use target::{
    ArmFamily, C5xFamily, CpuInfo, FamilyContext, LoadEnv, LoadReport, Target, TargetFamily,
    TargetPaths, select_family,
};
pub use task::{
    ConsoleOutput, LogTail, ProcessLauncher, SystemLauncher, TaskHandle, TaskKind, TaskOutput,
    TaskSpec, rewrite_source_refs, spawn_task,
};
pub use utils::{
    PathNormalizer, UniqueList, compute_absolute_path, get_clean_absolute_path, is_debug_mode,
    set_debug_mode,
};
pub use workspace::{Workspace, find_projects, parse_uvmpw, search_files};
pub use xml::{ParseOptions, XmlValue, as_list, load_xml_file, parse_xml};
