//! uVision 工程：读取工程文件、按工具链创建目标、保存活动目标、
//! 重新加载（防抖 + 文件占用重试）以及变更通知

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::config::KeilSettings;
use crate::debug_println;
use crate::error::KeilError;
use crate::generator::to_pretty_json;
use crate::models::{ProjectEntry, ProjectProperties};
use crate::prober::MacroProber;
use crate::target::{LoadEnv, Target, TargetPaths, select_family};
use crate::task::{ProcessLauncher, TaskHandle, TaskKind, TaskOutput};
use crate::xml::{ParseOptions, XmlValue, as_list, decode_text, parse_xml};

const PROPERTIES_FILE: &str = "keil_project_properties.json";
const LOG_FILE: &str = "keil-assistant.log";

/// 通知给订阅者的事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectEvent {
    /// 目标配置、文件组或活动目标发生变化
    DataChanged,
}

pub type ObserverId = usize;

type Observer = Box<dyn Fn(&ProjectEvent) + Send + Sync>;

#[derive(Default)]
struct Observers {
    next_id: ObserverId,
    list: Vec<(ObserverId, Observer)>,
}

impl Observers {
    fn subscribe(&mut self, observer: Observer) -> ObserverId {
        let id = self.next_id;
        self.next_id += 1;
        self.list.push((id, observer));
        id
    }

    fn unsubscribe(&mut self, id: ObserverId) -> bool {
        let before = self.list.len();
        self.list.retain(|(other, _)| *other != id);
        self.list.len() != before
    }

    fn notify(&self, event: &ProjectEvent) {
        for (_, observer) in &self.list {
            observer(event);
        }
    }
}

/// 工程日志 `.vscode/keil-assistant.log`，只追加
#[derive(Debug, Clone)]
pub struct ProjectLog {
    path: PathBuf,
}

impl ProjectLog {
    pub fn new(vscode_dir: &Path) -> Self {
        Self {
            path: vscode_dir.join(LOG_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn info(&self, message: &str) {
        self.append("[info]", message);
    }

    pub fn warn(&self, message: &str) {
        self.append("[Warn]", message);
    }

    /// 日志写失败不影响工程加载
    fn append(&self, level: &str, message: &str) {
        let message = message.strip_prefix(level).map(str::trim_start).unwrap_or(message);
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| writeln!(file, "{} {}", level, message));
        if let Err(e) = result {
            debug_println!("[DEBUG project] Cannot write {}: {}", self.path.display(), e);
        }
    }
}

/// 重新加载的准入控制：两次开始之间至少间隔 `debounce`，且同时只允许一个在进行
#[derive(Debug)]
pub struct ReloadGate {
    debounce: Duration,
    last_start: Mutex<Option<Instant>>,
    in_flight: AtomicBool,
}

/// 持有期间表示一次重新加载正在进行
#[derive(Debug)]
pub struct ReloadTicket {
    gate: Arc<ReloadGate>,
}

impl Drop for ReloadTicket {
    fn drop(&mut self) {
        self.gate.in_flight.store(false, Ordering::SeqCst);
    }
}

impl ReloadGate {
    pub fn new(debounce: Duration) -> Self {
        Self {
            debounce,
            last_start: Mutex::new(None),
            in_flight: AtomicBool::new(false),
        }
    }

    /// 被拒绝（进行中或距离上次开始太近）时返回 None
    pub fn try_begin(self: &Arc<Self>) -> Option<ReloadTicket> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug_println!("[DEBUG project] Reload rejected: already in flight");
            return None;
        }

        let Ok(mut last) = self.last_start.lock() else {
            self.in_flight.store(false, Ordering::SeqCst);
            return None;
        };
        if let Some(prev) = *last {
            if prev.elapsed() < self.debounce {
                debug_println!("[DEBUG project] Reload rejected: debounced");
                self.in_flight.store(false, Ordering::SeqCst);
                return None;
            }
        }
        *last = Some(Instant::now());

        Some(ReloadTicket {
            gate: Arc::clone(self),
        })
    }
}

/// uVision 正在写工程文件时读取会失败
fn is_locked(err: &io::Error) -> bool {
    if err.kind() == io::ErrorKind::ResourceBusy {
        return true;
    }
    #[cfg(windows)]
    {
        // ERROR_SHARING_VIOLATION / ERROR_LOCK_VIOLATION
        if let Some(code) = err.raw_os_error() {
            return code == 32 || code == 33;
        }
    }
    false
}

/// 文件被占用时按固定间隔重试，最多 `limit` 次
pub fn retry_locked<T, F>(
    path: &Path,
    delay: Duration,
    limit: u32,
    log: Option<&ProjectLog>,
    mut op: F,
) -> Result<T, KeilError>
where
    F: FnMut() -> io::Result<T>,
{
    let limit = limit.max(1);
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if is_locked(&e) => {
                if attempt >= limit {
                    return Err(KeilError::FileLocked {
                        path: path.to_path_buf(),
                        attempts: attempt,
                    });
                }
                let message = format!(
                    "uVision project file '{}' is locked, retry in {} ms",
                    path.display(),
                    delay.as_millis()
                );
                debug_println!("[DEBUG project] {}", message);
                if let Some(log) = log {
                    log.warn(&message);
                }
                thread::sleep(delay);
                attempt += 1;
            }
            Err(e) => return Err(KeilError::io(path, e)),
        }
    }
}

/// 一次工程加载的结果
#[derive(Debug, Default)]
pub struct ProjectLoadReport {
    pub loaded_targets: Vec<String>,
    /// (目标名, 错误)
    pub failures: Vec<(String, KeilError)>,
    pub files_written: usize,
}

/// 一个 uVision 工程（`.uvproj` / `.uvprojx`）
pub struct KeilProject {
    id: String,
    label: String,
    project_file: PathBuf,
    workspace_dir: PathBuf,
    vscode_dir: PathBuf,
    multi_project: bool,
    schema_version: Option<String>,

    targets: Vec<Target>,
    active_target: Option<String>,
    /// 按目标名保存的任务运行标记，跨 load 保留
    task_flags: HashMap<String, Arc<AtomicBool>>,

    settings: KeilSettings,
    prober: Arc<MacroProber>,
    log: ProjectLog,
    gate: Arc<ReloadGate>,
    observers: Observers,
}

impl std::fmt::Debug for KeilProject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeilProject")
            .field("id", &self.id)
            .field("targets", &self.targets)
            .field("active_target", &self.active_target)
            .finish()
    }
}

impl KeilProject {
    /// 打开并加载工程；`multi_project` 为 true 时配置名带上工程名
    pub fn open(
        project_file: &Path,
        workspace_dir: &Path,
        settings: &KeilSettings,
        prober: Arc<MacroProber>,
        multi_project: bool,
    ) -> Result<(Self, ProjectLoadReport), KeilError> {
        let vscode_dir = workspace_dir.join(".vscode");
        let label = project_file
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let log = ProjectLog::new(&vscode_dir);
        log.info(&format!("Open project: {}", project_file.display()));

        let mut project = Self {
            id: crate::utils::path_to_slash(project_file),
            label,
            project_file: project_file.to_path_buf(),
            workspace_dir: workspace_dir.to_path_buf(),
            vscode_dir,
            multi_project,
            schema_version: None,
            targets: Vec::new(),
            active_target: None,
            task_flags: HashMap::new(),
            settings: settings.clone(),
            prober,
            log,
            gate: Arc::new(ReloadGate::new(settings.reload_debounce())),
            observers: Observers::default(),
        };
        let report = project.load()?;
        Ok((project, report))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn project_file(&self) -> &Path {
        &self.project_file
    }

    pub fn project_dir(&self) -> &Path {
        self.project_file.parent().unwrap_or_else(|| Path::new("."))
    }

    pub fn workspace_dir(&self) -> &Path {
        &self.workspace_dir
    }

    pub fn schema_version(&self) -> Option<&str> {
        self.schema_version.as_deref()
    }

    pub fn is_multi_project(&self) -> bool {
        self.multi_project
    }

    pub fn log(&self) -> &ProjectLog {
        &self.log
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    pub fn target(&self, name: &str) -> Option<&Target> {
        self.targets.iter().find(|t| t.name() == name)
    }

    fn target_mut(&mut self, name: &str) -> Option<&mut Target> {
        self.targets.iter_mut().find(|t| t.name() == name)
    }

    /// 活动目标；未设置时为第一个目标
    pub fn active_target(&self) -> Option<&Target> {
        self.active_target
            .as_deref()
            .and_then(|name| self.target(name))
            .or_else(|| self.targets.first())
    }

    /// 切换活动目标并保存；目标变化时通知订阅者
    pub fn set_active_target(&mut self, name: &str) -> Result<(), KeilError> {
        if self.target(name).is_none() {
            return Err(KeilError::TargetNotFound(name.to_string()));
        }
        if self.active_target.as_deref() != Some(name) {
            self.active_target = Some(name.to_string());
            self.save_properties()?;
            self.observers.notify(&ProjectEvent::DataChanged);
        }
        Ok(())
    }

    pub fn subscribe<F>(&mut self, observer: F) -> ObserverId
    where
        F: Fn(&ProjectEvent) + Send + Sync + 'static,
    {
        self.observers.subscribe(Box::new(observer))
    }

    pub fn unsubscribe(&mut self, id: ObserverId) -> bool {
        self.observers.unsubscribe(id)
    }

    fn config_name(&self, target_name: &str) -> String {
        if self.multi_project {
            format!("{} for {}", target_name, self.label)
        } else {
            target_name.to_string()
        }
    }

    fn read_document(&self) -> Result<XmlValue, KeilError> {
        let bytes = retry_locked(
            &self.project_file,
            self.settings.lock_retry_delay(),
            self.settings.lock_retry_limit,
            Some(&self.log),
            || std::fs::read(&self.project_file),
        )?;
        parse_xml(&decode_text(bytes), &ParseOptions::default()).map_err(|e| {
            eprintln!("Warning: Failed to parse {}: {}", self.project_file.display(), e);
            KeilError::parse(&self.project_file, e.to_string())
        })
    }

    /// 完整加载：解析工程文件，重新创建并加载所有目标
    ///
    /// 单个目标失败只记录并跳过；工程文件本身无法读取或解析时整体失败，之前的目标保持不变
    pub fn load(&mut self) -> Result<ProjectLoadReport, KeilError> {
        let doc = self.read_document()?;
        let Some(project) = doc.get("Project") else {
            return Err(KeilError::parse(&self.project_file, "missing 'Project' root element"));
        };
        let target_nodes = as_list(project.at(&["Targets", "Target"]));
        if target_nodes.is_empty() {
            return Err(KeilError::parse(&self.project_file, "no target found in project"));
        }
        let rte = project.get("RTE").filter(|r| !r.is_empty()).cloned();
        let schema_version = project.text_at(&["SchemaVersion"]);
        debug_println!(
            "[DEBUG project] {} (schema {:?}): {} targets",
            self.project_file.display(),
            schema_version,
            target_nodes.len()
        );

        let paths = TargetPaths::new(&self.project_file, &self.workspace_dir);
        let env = LoadEnv {
            settings: &self.settings,
            prober: &self.prober,
        };
        let mut report = ProjectLoadReport::default();
        let mut targets = Vec::new();

        for node in target_nodes {
            let family = select_family(&self.project_file, node);
            let name = node.text_at(&["TargetName"]).unwrap_or_default();
            let task_running = Arc::clone(
                self.task_flags
                    .entry(name.clone())
                    .or_insert_with(|| Arc::new(AtomicBool::new(false))),
            );
            let mut target = Target::new(
                family,
                node.clone(),
                rte.clone(),
                paths.clone(),
                self.config_name(&name),
                task_running,
            );

            match target.load(&env) {
                Ok(target_report) => {
                    for warning in &target_report.warnings {
                        self.log.warn(warning);
                    }
                    report.files_written += usize::from(target_report.cpp_properties_written)
                        + usize::from(target_report.compile_commands_written);
                    report.loaded_targets.push(name);
                    targets.push(target);
                }
                Err(e) => {
                    eprintln!("Warning: Skipping target '{}': {}", name, e);
                    self.log.warn(&format!("load target '{}' failed: {}", name, e));
                    report.failures.push((name, e));
                }
            }
        }

        self.schema_version = schema_version;
        self.targets = targets;
        self.restore_active_target()?;
        Ok(report)
    }

    /// 受防抖与进行中检查约束的重新加载；被拒绝时返回 Ok(None)
    pub fn reload(&mut self) -> Result<Option<ProjectLoadReport>, KeilError> {
        let Some(_ticket) = self.gate.try_begin() else {
            return Ok(None);
        };
        self.log.info(&format!("Reload project: {}", self.label));
        let report = self.load()?;
        self.observers.notify(&ProjectEvent::DataChanged);
        Ok(Some(report))
    }

    /// 重新读取所有目标的依赖文件
    pub fn refresh_source_refs(&mut self) {
        for target in &mut self.targets {
            target.update_source_refs();
        }
        self.observers.notify(&ProjectEvent::DataChanged);
    }

    fn properties_path(&self) -> PathBuf {
        self.vscode_dir.join(PROPERTIES_FILE)
    }

    fn read_properties(&self) -> ProjectProperties {
        let path = self.properties_path();
        let Ok(content) = std::fs::read_to_string(&path) else {
            return ProjectProperties::default();
        };
        serde_json::from_str(&content).unwrap_or_else(|e| {
            self.log
                .warn(&format!("{} parse failed: {}", PROPERTIES_FILE, e));
            ProjectProperties::default()
        })
    }

    fn save_properties(&self) -> Result<(), KeilError> {
        let properties = ProjectProperties {
            project: ProjectEntry {
                name: self.id.clone(),
                active_target_name: self.active_target.clone(),
            },
        };
        let path = self.properties_path();
        std::fs::create_dir_all(&self.vscode_dir).map_err(|e| KeilError::io(&self.vscode_dir, e))?;
        std::fs::write(&path, to_pretty_json(&properties)?).map_err(|e| KeilError::io(&path, e))
    }

    /// 保存的活动目标属于本工程且仍然存在时沿用，否则取第一个目标并保存
    fn restore_active_target(&mut self) -> Result<(), KeilError> {
        let saved = self.read_properties().project;
        let restored = saved
            .active_target_name
            .filter(|_| saved.name == self.id)
            .filter(|name| self.target(name).is_some());

        match restored {
            Some(name) => self.active_target = Some(name),
            None => {
                self.active_target = self.targets.first().map(|t| t.name().to_string());
                if self.active_target.is_some() {
                    self.save_properties()?;
                }
            }
        }
        Ok(())
    }

    pub fn build(
        &self,
        target: &str,
        launcher: Arc<dyn ProcessLauncher>,
        output: Arc<dyn TaskOutput>,
    ) -> Result<TaskHandle, KeilError> {
        self.run_task(TaskKind::Build, target, launcher, output)
    }

    pub fn rebuild(
        &self,
        target: &str,
        launcher: Arc<dyn ProcessLauncher>,
        output: Arc<dyn TaskOutput>,
    ) -> Result<TaskHandle, KeilError> {
        self.run_task(TaskKind::Rebuild, target, launcher, output)
    }

    pub fn download(
        &self,
        target: &str,
        launcher: Arc<dyn ProcessLauncher>,
        output: Arc<dyn TaskOutput>,
    ) -> Result<TaskHandle, KeilError> {
        self.run_task(TaskKind::Download, target, launcher, output)
    }

    pub fn run_task(
        &self,
        kind: TaskKind,
        target: &str,
        launcher: Arc<dyn ProcessLauncher>,
        output: Arc<dyn TaskOutput>,
    ) -> Result<TaskHandle, KeilError> {
        let target = self
            .target(target)
            .ok_or_else(|| KeilError::TargetNotFound(target.to_string()))?;
        target.run_task(kind, &self.settings, launcher, output)
    }

    /// 只刷新单个目标的依赖引用（构建结束后调用）
    pub fn refresh_target_refs(&mut self, name: &str) -> Result<(), KeilError> {
        let target = self
            .target_mut(name)
            .ok_or_else(|| KeilError::TargetNotFound(name.to_string()))?;
        target.update_source_refs();
        self.observers.notify(&ProjectEvent::DataChanged);
        Ok(())
    }

    pub fn close(&self) {
        self.log.info(&format!("project closed: {}", self.label));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_reload_gate_debounce_and_in_flight() {
        let gate = Arc::new(ReloadGate::new(Duration::from_millis(50)));
        let ticket = gate.try_begin().expect("first reload allowed");
        assert!(gate.try_begin().is_none());
        drop(ticket);

        // 距离上次开始不足 debounce
        assert!(gate.try_begin().is_none());
        thread::sleep(Duration::from_millis(80));
        assert!(gate.try_begin().is_some());
    }

    #[test]
    fn test_retry_locked_then_succeeds() {
        let log_dir = tempfile::tempdir().unwrap();
        let log = ProjectLog::new(log_dir.path());
        let calls = Cell::new(0);
        let value = retry_locked(Path::new("a.uvprojx"), Duration::from_millis(1), 5, Some(&log), || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(io::Error::from(io::ErrorKind::ResourceBusy))
            } else {
                Ok(42)
            }
        })
        .unwrap();
        assert_eq!(value, 42);
        assert_eq!(calls.get(), 3);

        let logged = std::fs::read_to_string(log.path()).unwrap();
        assert_eq!(logged.lines().count(), 2);
        assert!(logged.starts_with("[Warn] "));
    }

    #[test]
    fn test_retry_locked_exhausted() {
        let result: Result<(), _> = retry_locked(Path::new("a.uvprojx"), Duration::from_millis(1), 3, None, || {
            Err(io::Error::from(io::ErrorKind::ResourceBusy))
        });
        match result {
            Err(KeilError::FileLocked { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("unexpected: {:?}", other),
        }

        let missing: Result<(), _> = retry_locked(Path::new("a.uvprojx"), Duration::from_millis(1), 3, None, || {
            Err(io::Error::from(io::ErrorKind::NotFound))
        });
        assert!(matches!(missing, Err(KeilError::Io { .. })));
    }

    #[test]
    fn test_observers_unsubscribe() {
        let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut observers = Observers::default();
        let counter = Arc::clone(&hits);
        let id = observers.subscribe(Box::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        observers.notify(&ProjectEvent::DataChanged);
        assert!(observers.unsubscribe(id));
        assert!(!observers.unsubscribe(id));
        observers.notify(&ProjectEvent::DataChanged);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
