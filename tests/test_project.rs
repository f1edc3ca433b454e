use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};

use serde_json::Value;
use uvprj2cpp::{
    KeilError, KeilProject, KeilSettings, MacroProber, Platform, ProcessLauncher, TaskOutput,
    Workspace,
};

fn arm_target(name: &str, ac6: bool) -> String {
    format!(
        r#"
    <Target>
      <TargetName>{name}</TargetName>
      <ToolsetNumber>0x4</ToolsetNumber>
      <uAC6>{ac6}</uAC6>
      <TargetOption>
        <TargetCommonOption>
          <Device>STM32F407VGTx</Device>
          <Vendor>STMicroelectronics</Vendor>
          <Cpu>IRAM(0x20000000,0x00020000) IROM(0x08000000,0x00100000) CPUTYPE("Cortex-M4") FPU2 CLOCK(12000000) ELITTLE</Cpu>
          <OutputDirectory>.\Objects\</OutputDirectory>
        </TargetCommonOption>
        <TargetArmAds>
          <ArmAdsMisc><AdsCpuType>"Cortex-M4"</AdsCpuType></ArmAdsMisc>
          <Cads>
            <uC99>1</uC99>
            <v6Lang>3</v6Lang>
            <v6Langp>3</v6Langp>
            <VariousControls>
              <Define>USE_HAL,STM32F4</Define>
              <IncludePath>.\inc;..\shared</IncludePath>
            </VariousControls>
          </Cads>
        </TargetArmAds>
      </TargetOption>
      <Groups>
        <Group>
          <GroupName>App</GroupName>
          <Files>
            <File><FileName>main.c</FileName><FileType>1</FileType><FilePath>.\src\main.c</FilePath></File>
          </Files>
        </Group>
        <Group><GroupName>::CMSIS</GroupName></Group>
      </Groups>
    </Target>"#,
        ac6 = if ac6 { 1 } else { 0 }
    )
}

fn uvprojx(targets: &[String]) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="no" ?>
<Project xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" xsi:noNamespaceSchemaLocation="project_projx.xsd">
  <SchemaVersion>2.1</SchemaVersion>
  <Header>### uVision Project, (C) Keil Software</Header>
  <Targets>{}</Targets>
</Project>"#,
        targets.concat()
    )
}

const C51_PROJECT: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="no" ?>
<Project xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" xsi:noNamespaceSchemaLocation="project_proj.xsd">
  <SchemaVersion>1.1</SchemaVersion>
  <Targets>
    <Target>
      <TargetName>Target 1</TargetName>
      <ToolsetNumber>0x0</ToolsetNumber>
      <TargetOption>
        <TargetCommonOption><Device>AT89C52</Device><Vendor>Atmel</Vendor></TargetCommonOption>
        <Target51>
          <C51><VariousControls><Define>F_CPU=11059200</Define><IncludePath>.\inc</IncludePath></VariousControls></C51>
        </Target51>
      </TargetOption>
      <Groups>
        <Group><GroupName>Source Group 1</GroupName><Files><File><FileName>main.c</FileName><FilePath>.\main.c</FilePath></File></Files></Group>
      </Groups>
    </Target>
    <Target>
      <TargetName>Broken</TargetName>
      <TargetOption><Target51></Target51></TargetOption>
    </Target>
  </Targets>
</Project>"#;

/// 测试用的 Keil 安装目录与工作区
struct Fixture {
    keil: tempfile::TempDir,
    ws: tempfile::TempDir,
}

impl Fixture {
    fn new() -> Self {
        let keil = tempfile::tempdir().unwrap();
        fs::create_dir_all(keil.path().join("ARM/ARMCC/include/rw")).unwrap();
        fs::create_dir_all(keil.path().join("C51/INC/Atmel")).unwrap();
        Self {
            keil,
            ws: tempfile::tempdir().unwrap(),
        }
    }

    fn settings(&self) -> KeilSettings {
        let mut settings = KeilSettings::default();
        let root = self.keil.path().to_string_lossy().into_owned();
        settings.keil_home.insert("MDK".into(), root.clone());
        settings.keil_home.insert("C51".into(), root);
        settings
    }

    fn write(&self, rel: &str, content: &str) -> PathBuf {
        let path = self.ws.path().join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
        path
    }

    fn open(&self, project: &Path) -> Result<(KeilProject, uvprj2cpp::ProjectLoadReport), KeilError> {
        KeilProject::open(
            project,
            self.ws.path(),
            &self.settings(),
            Arc::new(MacroProber::default()),
            false,
        )
    }

    fn slash(&self, path: &Path) -> String {
        path.to_string_lossy().replace('\\', "/")
    }

    fn read_json(&self, rel: &str) -> Value {
        serde_json::from_str(&fs::read_to_string(self.ws.path().join(rel)).unwrap()).unwrap()
    }
}

#[test]
fn test_arm_target_load() {
    let fx = Fixture::new();
    fx.write(
        "prj/Objects/main.d",
        ".\\objects\\main.o: src\\main.c\n.\\objects\\main.o: inc\\board.h\n",
    );
    let prj = fx.write("prj/demo.uvprojx", &uvprojx(&[arm_target("Debug", false)]));

    let (project, report) = fx.open(&prj).unwrap();
    assert_eq!(report.loaded_targets, vec!["Debug"]);
    assert_eq!(project.schema_version(), Some("2.1"));

    let target = project.target("Debug").unwrap();
    assert_eq!(target.platform(), Platform::Mdk);
    assert_eq!(target.c_standard(), "c99");
    assert_eq!(target.cpp_standard(), "c++11");
    assert_eq!(target.intellisense_mode(), "gcc-arm");

    let keil_inc = fx.keil.path().join("ARM/ARMCC/include");
    assert_eq!(
        target.includes(),
        &[
            fx.slash(&keil_inc),
            fx.slash(&keil_inc.join("rw")),
            "prj/inc".to_string(),
            "shared".to_string(),
            "prj/src".to_string(),
        ]
    );
    assert_eq!(&target.defines()[..2], &["USE_HAL", "STM32F4"]);
    assert!(target.defines().contains(&"__CC_ARM".to_string()));
    assert!(!target.defines().contains(&"_RTE_".to_string()));

    // "::CMSIS" 组没有文件，被跳过
    assert_eq!(target.groups().len(), 1);
    let main = &target.groups()[0].sources[0];
    assert_eq!(main.path, fx.ws.path().join("prj/src/main.c"));
    assert_eq!(main.children.len(), 1);
    assert_eq!(main.children[0].path, fx.ws.path().join("prj/inc/board.h"));

    let props = fx.read_json(".vscode/c_cpp_properties.json");
    let conf = &props["configurations"][0];
    assert_eq!(conf["name"], "Debug");
    assert_eq!(conf["intelliSenseMode"], "gcc-arm");
    assert!(conf["compilerPath"].as_str().unwrap().contains("ARM/ARMCC/bin/armcc"));
    assert!(conf.get("compilerArgs").is_none());
    assert_eq!(props["version"], 4);

    let commands = fx.read_json("compile_commands.json");
    let entry = &commands[0];
    assert_eq!(entry["configuration"], "Debug");
    assert_eq!(entry["file"], format!("{}/*.c", fx.slash(&fx.ws.path().join("prj/src"))));
}

#[test]
fn test_reload_without_changes_writes_nothing() {
    let fx = Fixture::new();
    let prj = fx.write("prj/demo.uvprojx", &uvprojx(&[arm_target("Debug", false)]));

    let (mut project, first) = fx.open(&prj).unwrap();
    assert_eq!(first.files_written, 2);

    let before = project.target("Debug").unwrap().includes().to_vec();
    let second = project.load().unwrap();
    assert_eq!(second.files_written, 0);
    assert_eq!(project.target("Debug").unwrap().includes(), before.as_slice());
}

#[test]
fn test_armclang_target_uses_fallback_macros() {
    let fx = Fixture::new();
    let prj = fx.write("prj/demo.uvprojx", &uvprojx(&[arm_target("Debug", true)]));

    let (project, _) = fx.open(&prj).unwrap();
    let target = project.target("Debug").unwrap();
    assert_eq!(target.intellisense_mode(), "clang-arm");
    // armclang 不存在，探测失败后使用基础宏
    assert!(target.defines().contains(&"__GNUC__=4".to_string()));

    let props = fx.read_json(".vscode/c_cpp_properties.json");
    assert_eq!(
        props["configurations"][0]["compilerArgs"],
        serde_json::json!(["--target=arm-arm-none-eabi"])
    );
}

#[test]
fn test_c51_project_and_failing_target() {
    let fx = Fixture::new();
    let prj = fx.write("demo.uvproj", C51_PROJECT);

    let (project, report) = fx.open(&prj).unwrap();
    assert_eq!(report.loaded_targets, vec!["Target 1"]);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].0, "Broken");
    assert!(matches!(
        report.failures[0].1,
        KeilError::StructuralValidation { .. }
    ));

    let target = project.target("Target 1").unwrap();
    assert_eq!(target.platform(), Platform::C51);
    assert_eq!(target.c_standard(), "c89");
    let c51_inc = fx.keil.path().join("C51/INC");
    assert_eq!(
        target.includes(),
        &[
            fx.slash(&c51_inc),
            fx.slash(&c51_inc.join("Atmel")),
            "inc".to_string(),
            ".".to_string(),
        ]
    );
    assert_eq!(target.defines()[0], "F_CPU=11059200");
    assert_eq!(target.defines()[1], "__C51__");

    let props = fx.read_json(".vscode/c_cpp_properties.json");
    assert!(props["configurations"][0].get("compilerPath").is_none());
    assert_eq!(props["configurations"][0]["intelliSenseMode"], "${default}");
    assert!(!fx.ws.path().join("compile_commands.json").exists());

    let log = fs::read_to_string(fx.ws.path().join(".vscode/keil-assistant.log")).unwrap();
    assert!(log.contains("[Warn] load target 'Broken' failed"));
}

#[test]
fn test_missing_keil_root_is_reported() {
    let fx = Fixture::new();
    let prj = fx.write("prj/demo.uvprojx", &uvprojx(&[arm_target("Debug", false)]));
    let missing = fx.keil.path().join("not-installed");
    let mut settings = fx.settings();
    settings
        .keil_home
        .insert("MDK".into(), missing.to_string_lossy().into_owned());

    let (project, report) = KeilProject::open(
        &prj,
        fx.ws.path(),
        &settings,
        Arc::new(MacroProber::default()),
        false,
    )
    .unwrap();
    assert_eq!(report.loaded_targets, vec!["Debug"]);
    assert!(
        project
            .target("Debug")
            .unwrap()
            .includes()
            .iter()
            .all(|inc| !inc.contains("not-installed"))
    );

    let log = fs::read_to_string(fx.ws.path().join(".vscode/keil-assistant.log")).unwrap();
    assert!(log.contains("[Warn] Keil MDK not found at"));
}

#[test]
fn test_invalid_project_file() {
    let fx = Fixture::new();
    let prj = fx.write("bad.uvprojx", "<Project><Targets>");
    assert!(matches!(fx.open(&prj), Err(KeilError::Parse { .. })));
}

#[test]
fn test_active_target_persistence() {
    let fx = Fixture::new();
    let prj = fx.write(
        "prj/demo.uvprojx",
        &uvprojx(&[arm_target("Debug", false), arm_target("Release", false)]),
    );

    let (mut project, _) = fx.open(&prj).unwrap();
    assert_eq!(project.active_target().unwrap().name(), "Debug");

    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    project.subscribe(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    project.set_active_target("Release").unwrap();
    project.set_active_target("Release").unwrap();
    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert!(matches!(
        project.set_active_target("Nope"),
        Err(KeilError::TargetNotFound(_))
    ));

    let props = fx.read_json(".vscode/keil_project_properties.json");
    assert_eq!(props["project"]["activeTargetName"], "Release");

    let (reopened, _) = fx.open(&prj).unwrap();
    assert_eq!(reopened.active_target().unwrap().name(), "Release");
}

#[test]
fn test_reload_is_debounced() {
    let fx = Fixture::new();
    let prj = fx.write("prj/demo.uvprojx", &uvprojx(&[arm_target("Debug", false)]));
    let (mut project, _) = fx.open(&prj).unwrap();

    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    let id = project.subscribe(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    assert!(project.reload().unwrap().is_some());
    assert!(project.reload().unwrap().is_none());
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    assert!(project.unsubscribe(id));
    project.refresh_source_refs();
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn test_multi_project_configuration_names() {
    let fx = Fixture::new();
    let a = fx.write("a/a.uvprojx", &uvprojx(&[arm_target("Debug", false)]));
    let b = fx.write("b/b.uvprojx", &uvprojx(&[arm_target("Debug", false)]));

    let workspace = Workspace::open_files(fx.ws.path(), fx.settings(), &[a, b]);
    assert!(workspace.is_multi_project());
    assert_eq!(workspace.projects().len(), 2);
    assert_eq!(
        workspace.projects()[0].target("Debug").unwrap().config_name(),
        "Debug for a"
    );

    let props = fx.read_json(".vscode/c_cpp_properties.json");
    let names: Vec<&str> = props["configurations"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["Debug for a", "Debug for b"]);

    let commands = fx.read_json("compile_commands.json");
    assert_eq!(commands.as_array().unwrap().len(), 2);
}

/// UV4 一直运行，直到收到信号
struct HeldLauncher {
    release: Mutex<Receiver<()>>,
}

impl ProcessLauncher for HeldLauncher {
    fn run(&self, _program: &Path, _args: &[String], _cwd: &Path) -> io::Result<Option<i32>> {
        let _ = self.release.lock().unwrap().recv();
        Ok(Some(0))
    }
}

struct Silent;

impl TaskOutput for Silent {
    fn append_line(&self, _line: &str) {}
}

#[test]
fn test_running_task_survives_reload() {
    let fx = Fixture::new();
    let prj = fx.write(
        "prj/demo.uvprojx",
        &uvprojx(&[arm_target("Debug", false), arm_target("Release", false)]),
    );
    let (mut project, _) = fx.open(&prj).unwrap();

    let (tx, rx) = mpsc::channel();
    let launcher = Arc::new(HeldLauncher {
        release: Mutex::new(rx),
    });
    let output = Arc::new(Silent);

    let first = project.build("Debug", launcher.clone(), output.clone()).unwrap();
    assert!(matches!(
        project.rebuild("Debug", launcher.clone(), output.clone()),
        Err(KeilError::TaskRunning { .. })
    ));

    // 重新加载会重建目标，但运行标记必须沿用
    project.load().unwrap();
    assert!(project.target("Debug").unwrap().is_task_running());
    assert!(matches!(
        project.build("Debug", launcher.clone(), output.clone()),
        Err(KeilError::TaskRunning { .. })
    ));
    assert!(!project.target("Release").unwrap().is_task_running());

    tx.send(()).unwrap();
    assert_eq!(first.wait().unwrap(), Some(0));
    assert!(!project.target("Debug").unwrap().is_task_running());

    let again = project.build("Debug", launcher, output).unwrap();
    tx.send(()).unwrap();
    assert!(again.wait().is_ok());
}
