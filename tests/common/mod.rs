#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

pub struct CmdResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub log_path: PathBuf,
}

impl CmdResult {
    /// Last stdout line parsed as JSON.
    pub fn json(&self) -> serde_json::Value {
        let line = self.stdout.lines().rfind(|l| !l.trim().is_empty()).unwrap_or_else(|| {
            panic!("no stdout; log: {}", self.log_path.display())
        });
        serde_json::from_str(line).unwrap_or_else(|err| {
            panic!("stdout is not JSON ({err}); log: {}", self.log_path.display())
        })
    }
}

fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis())
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

fn resolve_bin_path() -> PathBuf {
    if let Ok(path) = std::env::var("CARGO_BIN_EXE_fus") {
        return PathBuf::from(path);
    }

    let exe_name = if cfg!(windows) { "fus.exe" } else { "fus" };
    let fallback = std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(PathBuf::from))
        .and_then(|deps| deps.parent().map(PathBuf::from))
        .map(|debug_dir| debug_dir.join(exe_name));

    match fallback {
        Some(path) if path.exists() => path,
        _ => panic!("unable to resolve fus binary path for integration test"),
    }
}

pub fn run_cli_case(case_name: &str, args: &[&str]) -> CmdResult {
    run_cli_case_in(case_name, args, None)
}

/// Run `fus` with `home` as HOME so config and activity log stay inside the
/// test sandbox. Stdin is closed, so any prompt sees end of input.
pub fn run_cli_case_in(case_name: &str, args: &[&str], home: Option<&Path>) -> CmdResult {
    run_cli_case_env(case_name, args, home, &[])
}

/// Like [`run_cli_case_in`] with extra environment variables.
pub fn run_cli_case_env(
    case_name: &str,
    args: &[&str],
    home: Option<&Path>,
    envs: &[(&str, &str)],
) -> CmdResult {
    let root = std::env::temp_dir().join("fus-test-logs");
    fs::create_dir_all(&root).expect("create temp test log dir");

    let log_path = root.join(format!("{}-{}.log", sanitize(case_name), now_millis()));
    let bin_path = resolve_bin_path();

    let mut command = Command::new(&bin_path);
    command
        .args(args)
        .stdin(Stdio::null())
        .env("RUST_BACKTRACE", "1")
        .env("FUS_SNAPSHOT_ENABLED", "false")
        .env_remove("FUS_OUTPUT_FORMAT");
    if let Some(home) = home {
        command.env("HOME", home);
    }
    command.envs(envs.iter().copied());
    let output = command.output().expect("execute fus command");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    let mut log_content = String::new();
    log_content.push_str(&format!("case={case_name}\n"));
    log_content.push_str(&format!("bin={}\n", bin_path.display()));
    log_content.push_str(&format!("args={args:?}\n"));
    log_content.push_str(&format!("status={}\n", output.status));
    log_content.push_str("----- stdout -----\n");
    log_content.push_str(&stdout);
    log_content.push('\n');
    log_content.push_str("----- stderr -----\n");
    log_content.push_str(&stderr);
    log_content.push('\n');
    fs::write(&log_path, log_content).expect("write test log");

    CmdResult {
        status: output.status,
        stdout,
        stderr,
        log_path,
    }
}

/// Minimal application bundle: Info.plist naming an executable that exists.
pub fn make_bundle(parent: &Path, file_name: &str, payload_bytes: usize) -> PathBuf {
    let bundle = parent.join(file_name);
    let exe_name = file_name.trim_end_matches(".app");
    let macos = bundle.join("Contents").join("MacOS");
    fs::create_dir_all(&macos).expect("create bundle dirs");
    let plist = format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<plist version=\"1.0\">\n<dict>\n  <key>CFBundleExecutable</key>\n  <string>{exe_name}</string>\n  <key>CFBundleIdentifier</key>\n  <string>test.{exe_name}</string>\n</dict>\n</plist>\n"
    );
    fs::write(bundle.join("Contents").join("Info.plist"), plist).expect("write plist");
    fs::write(macos.join(exe_name), vec![0u8; payload_bytes]).expect("write executable");
    bundle
}

/// Sandbox layout: HOME, an applications dir, and a volumes dir.
pub struct Sandbox {
    pub dir: tempfile::TempDir,
}

impl Sandbox {
    pub fn new() -> Self {
        let dir = tempfile::TempDir::new().expect("create sandbox");
        for sub in ["home", "Applications", "Volumes"] {
            fs::create_dir_all(dir.path().join(sub)).expect("create sandbox dir");
        }
        Self { dir }
    }

    pub fn home(&self) -> PathBuf {
        self.dir.path().join("home")
    }

    pub fn applications(&self) -> PathBuf {
        self.dir.path().join("Applications")
    }

    pub fn volumes(&self) -> PathBuf {
        self.dir.path().join("Volumes")
    }

    pub fn volume(&self, name: &str) -> PathBuf {
        let path = self.volumes().join(name);
        fs::create_dir_all(&path).expect("create volume");
        path
    }

    pub fn activity_log(&self) -> PathBuf {
        self.home().join(".local/share/fus/activity.jsonl")
    }

    pub fn str(path: &Path) -> &str {
        path.to_str().expect("utf-8 sandbox path")
    }
}
