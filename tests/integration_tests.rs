//! Integration tests: CLI smoke tests and end-to-end relocate/restore runs
//! against sandboxed applications and volume directories.

mod common;

use std::fs;

use common::{Sandbox, make_bundle, run_cli_case, run_cli_case_env, run_cli_case_in};
use free_up_space::platform::running_as_root;

#[test]
fn help_command_prints_usage() {
    let result = run_cli_case("help_command_prints_usage", &["--help"]);
    assert!(
        result.status.success(),
        "expected success; log: {}",
        result.log_path.display()
    );
    assert!(
        result.stdout.contains("Usage: fus [OPTIONS] [COMMAND]"),
        "missing help banner; log: {}",
        result.log_path.display()
    );
    for flag in [
        "--target-free-gb",
        "--restore",
        "--list-backups",
        "--check-time-machine-status",
        "--restore-from-time-machine",
        "--use-external-drive",
        "--fix-permissions-choose",
    ] {
        assert!(
            result.stdout.contains(flag),
            "help is missing {flag}; log: {}",
            result.log_path.display()
        );
    }
}

#[test]
fn version_command_prints_version() {
    let result = run_cli_case("version_command_prints_version", &["--version"]);
    assert!(
        result.status.success(),
        "expected success; log: {}",
        result.log_path.display()
    );
    assert!(
        result.stdout.contains("fus"),
        "missing version output; log: {}",
        result.log_path.display()
    );
}

#[test]
fn completions_command_generates_shell_script() {
    let result = run_cli_case(
        "completions_command_generates_shell_script",
        &["completions", "bash"],
    );
    assert!(
        result.status.success(),
        "expected success; log: {}",
        result.log_path.display()
    );
    assert!(
        result.stdout.contains("fus"),
        "expected completion script contents; log: {}",
        result.log_path.display()
    );
}

#[test]
fn conflicting_modes_are_rejected() {
    let result = run_cli_case(
        "conflicting_modes_are_rejected",
        &["--restore", "--fix-permissions"],
    );
    assert_eq!(
        result.status.code(),
        Some(2),
        "clap usage errors exit 2; log: {}",
        result.log_path.display()
    );
}

#[test]
fn negative_target_is_rejected_before_anything_moves() {
    let sandbox = Sandbox::new();
    let app = make_bundle(&sandbox.applications(), "Keep.app", 1024);
    let volume = sandbox.volume("Archive");
    let result = run_cli_case_in(
        "negative_target_is_rejected",
        &[
            "--target-free-gb=-5",
            "--yes",
            "--use-external-drive",
            "--applications-dir",
            Sandbox::str(&sandbox.applications()),
            "--volume",
            Sandbox::str(&volume),
        ],
        Some(&sandbox.home()),
    );
    assert_eq!(
        result.status.code(),
        Some(1),
        "expected user error; log: {}",
        result.log_path.display()
    );
    assert!(result.stderr.contains("FUS-1201"), "log: {}", result.log_path.display());
    assert!(app.exists());
}

#[test]
fn negative_target_as_separate_value_reaches_validation() {
    let sandbox = Sandbox::new();
    let result = run_cli_case_in(
        "negative_target_separate_value",
        &[
            "--yes",
            "--target-free-gb",
            "-5",
            "--applications-dir",
            Sandbox::str(&sandbox.applications()),
        ],
        Some(&sandbox.home()),
    );
    assert_eq!(result.status.code(), Some(1), "log: {}", result.log_path.display());
    assert!(result.stderr.contains("FUS-1201"), "log: {}", result.log_path.display());
}

#[test]
fn blank_restore_path_starts_interactive_selection() {
    let sandbox = Sandbox::new();
    for (case, value) in [("blank_restore_empty", ""), ("blank_restore_spaces", "   ")] {
        let result = run_cli_case_in(
            case,
            &[
                "--applications-dir",
                Sandbox::str(&sandbox.applications()),
                "--volumes-dir",
                Sandbox::str(&sandbox.volumes()),
                "--restore",
                value,
            ],
            Some(&sandbox.home()),
        );
        // Interactive selection runs and finds no volumes; not a usage error.
        assert_eq!(result.status.code(), Some(1), "log: {}", result.log_path.display());
        assert!(
            result.stderr.contains("no removable volumes"),
            "log: {}",
            result.log_path.display()
        );
    }
}

#[test]
fn require_root_refuses_before_moving() {
    if running_as_root() {
        return;
    }
    let sandbox = Sandbox::new();
    let app = make_bundle(&sandbox.applications(), "Keep.app", 1024);
    let volume = sandbox.volume("Archive");
    let result = run_cli_case_env(
        "require_root_refuses",
        &[
            "--yes",
            "--use-external-drive",
            "--target-free-gb",
            "1000000",
            "--applications-dir",
            Sandbox::str(&sandbox.applications()),
            "--volume",
            Sandbox::str(&volume),
        ],
        Some(&sandbox.home()),
        &[("FUS_REQUIRE_ROOT", "true")],
    );
    assert_eq!(result.status.code(), Some(1), "log: {}", result.log_path.display());
    assert!(result.stderr.contains("FUS-1102"), "log: {}", result.log_path.display());
    assert!(app.exists());
    assert_eq!(fs::read_dir(&volume).expect("read volume").count(), 0);
}

#[cfg(unix)]
#[test]
fn failed_move_prints_diagnosis_and_manual_steps() {
    use std::os::unix::fs::PermissionsExt;

    if running_as_root() {
        return;
    }
    let sandbox = Sandbox::new();
    let apps = sandbox.applications();
    let app = make_bundle(&apps, "Stuck.app", 1024);
    let volume = sandbox.volume("Archive");
    fs::set_permissions(&apps, fs::Permissions::from_mode(0o555)).expect("lock apps dir");

    let result = run_cli_case_in(
        "failed_move_manual_steps",
        &[
            "--json",
            "--yes",
            "--use-external-drive",
            "--target-free-gb",
            "1000000",
            "--applications-dir",
            Sandbox::str(&apps),
            "--volume",
            Sandbox::str(&volume),
        ],
        Some(&sandbox.home()),
    );
    fs::set_permissions(&apps, fs::Permissions::from_mode(0o755)).expect("unlock apps dir");

    assert_eq!(result.status.code(), Some(4), "log: {}", result.log_path.display());
    assert!(result.stderr.contains("moves may fail"), "log: {}", result.log_path.display());
    assert!(result.stderr.contains("sudo mv"), "log: {}", result.log_path.display());
    let payload = result.json();
    assert_eq!(payload["summary"], "0/1 succeeded");
    let diagnoses = payload["diagnoses"].as_array().expect("diagnoses");
    assert_eq!(diagnoses.len(), 1);
    assert!(diagnoses[0]["mode"].is_string());
    assert!(app.is_dir());
}

#[test]
fn dry_run_relocation_touches_nothing() {
    let sandbox = Sandbox::new();
    let big = make_bundle(&sandbox.applications(), "Big.app", 8192);
    let small = make_bundle(&sandbox.applications(), "Small.app", 16);
    let volume = sandbox.volume("Archive");

    let result = run_cli_case_in(
        "dry_run_relocation_touches_nothing",
        &[
            "--json",
            "--yes",
            "--dry-run",
            "--use-external-drive",
            "--target-free-gb",
            "1000000",
            "--applications-dir",
            Sandbox::str(&sandbox.applications()),
            "--volume",
            Sandbox::str(&volume),
        ],
        Some(&sandbox.home()),
    );
    assert!(
        result.status.success(),
        "expected success; log: {}",
        result.log_path.display()
    );

    let payload = result.json();
    assert_eq!(payload["command"], "relocate");
    assert_eq!(payload["strategy"], "volume");
    assert_eq!(payload["selection"]["target_reachable"], false);
    let items = payload["report"]["items"].as_array().expect("items");
    assert_eq!(items.len(), 2);
    assert_eq!(items[0]["app"]["name"], "Big");
    assert!(items.iter().all(|i| i["status"] == "would_move"));

    assert!(big.exists());
    assert!(small.exists());
    assert_eq!(fs::read_dir(&volume).expect("read volume").count(), 0);
}

#[test]
fn relocate_list_and_restore_round_trip() {
    let sandbox = Sandbox::new();
    make_bundle(&sandbox.applications(), "Editor.app", 4096);
    make_bundle(&sandbox.applications(), "Viewer.app", 512);
    let volume = sandbox.volume("Archive");
    let apps = Sandbox::str(&sandbox.applications()).to_string();

    // Relocate everything: the target cannot be met on any real disk.
    let moved = run_cli_case_in(
        "round_trip_relocate",
        &[
            "--json",
            "--yes",
            "--use-external-drive",
            "--target-free-gb",
            "1000000",
            "--applications-dir",
            &apps,
            "--volume",
            Sandbox::str(&volume),
        ],
        Some(&sandbox.home()),
    );
    assert!(moved.status.success(), "log: {}", moved.log_path.display());
    let payload = moved.json();
    assert_eq!(payload["summary"], "2/2 succeeded");
    let folder = payload["report"]["folder"]
        .as_str()
        .expect("folder path")
        .to_string();
    assert!(!sandbox.applications().join("Editor.app").exists());
    assert!(std::path::Path::new(&folder).join("Editor.app").is_dir());

    // The backup folder is listed with its applications.
    let listed = run_cli_case_in(
        "round_trip_list",
        &["--json", "--list-backups", Sandbox::str(&volume)],
        Some(&sandbox.home()),
    );
    assert!(listed.status.success(), "log: {}", listed.log_path.display());
    let listing = listed.json();
    let folders = listing["volumes"][0]["folders"].as_array().expect("folders");
    assert_eq!(folders.len(), 1);
    assert_eq!(folders[0]["applications"].as_array().map(Vec::len), Some(2));

    // Restore puts both back.
    let restored = run_cli_case_in(
        "round_trip_restore",
        &["--json", "--yes", "--applications-dir", &apps, "--restore", &folder],
        Some(&sandbox.home()),
    );
    assert!(restored.status.success(), "log: {}", restored.log_path.display());
    assert_eq!(restored.json()["folders"][0]["summary"], "2/2 restored");
    assert!(sandbox.applications().join("Editor.app/Contents/Info.plist").is_file());
    assert!(sandbox.applications().join("Viewer.app").is_dir());

    // A second restore finds the folder empty.
    let again = run_cli_case_in(
        "round_trip_restore_again",
        &["--json", "--yes", "--applications-dir", &apps, "--restore", &folder],
        Some(&sandbox.home()),
    );
    assert!(again.status.success(), "log: {}", again.log_path.display());
    assert_eq!(again.json()["folders"][0]["summary"], "nothing to restore");

    let log = fs::read_to_string(sandbox.activity_log()).expect("activity log");
    assert!(log.lines().any(|l| l.contains("\"app_moved\"")));
    assert!(log.lines().any(|l| l.contains("\"app_restored\"")));
}

#[test]
fn restore_of_missing_folder_fails_with_code() {
    let sandbox = Sandbox::new();
    let missing = sandbox.volume("Archive").join("AppBackup_20260101_000000");
    let result = run_cli_case_in(
        "restore_of_missing_folder",
        &[
            "--yes",
            "--applications-dir",
            Sandbox::str(&sandbox.applications()),
            "--restore",
            Sandbox::str(&missing),
        ],
        Some(&sandbox.home()),
    );
    assert_eq!(result.status.code(), Some(1), "log: {}", result.log_path.display());
    assert!(result.stderr.contains("FUS-2201"), "log: {}", result.log_path.display());
}

#[test]
fn list_backups_across_volumes() {
    let sandbox = Sandbox::new();
    let first = sandbox.volume("First");
    make_bundle(&first.join("AppBackup_20261001_101500"), "One.app", 8);
    sandbox.volume("Second");

    let result = run_cli_case_in(
        "list_backups_across_volumes",
        &[
            "--json",
            "--list-backups",
            "--volumes-dir",
            Sandbox::str(&sandbox.volumes()),
        ],
        Some(&sandbox.home()),
    );
    assert!(result.status.success(), "log: {}", result.log_path.display());
    let payload = result.json();
    let volumes = payload["volumes"].as_array().expect("volumes");
    assert_eq!(volumes.len(), 2);
    assert_eq!(volumes[0]["folders"][0]["name"], "AppBackup_20261001_101500");
    assert_eq!(volumes[1]["folders"].as_array().map(Vec::len), Some(0));
}

#[cfg(unix)]
#[test]
fn fix_permissions_restores_execute_bits() {
    use std::os::unix::fs::PermissionsExt;

    let sandbox = Sandbox::new();
    let bundle = make_bundle(&sandbox.applications(), "Copied.app", 64);
    let exe = bundle.join("Contents/MacOS/Copied");
    fs::set_permissions(&exe, fs::Permissions::from_mode(0o600)).expect("chmod");

    let result = run_cli_case_in(
        "fix_permissions_restores_execute_bits",
        &[
            "--json",
            "--yes",
            "--fix-permissions",
            "--applications-dir",
            Sandbox::str(&sandbox.applications()),
        ],
        Some(&sandbox.home()),
    );
    assert!(result.status.success(), "log: {}", result.log_path.display());
    let payload = result.json();
    assert_eq!(payload["summary"], "1/1 fixed");
    assert_eq!(payload["outcomes"][0]["status"], "fixed");

    let mode = fs::metadata(&exe).expect("stat").permissions().mode();
    assert_eq!(mode & 0o555, 0o555, "mode was {mode:o}");
}

#[test]
fn time_machine_status_reports_unsupported_when_disabled() {
    let sandbox = Sandbox::new();
    let result = run_cli_case_in(
        "time_machine_status_disabled",
        &["--json", "--check-time-machine-status"],
        Some(&sandbox.home()),
    );
    assert!(result.status.success(), "log: {}", result.log_path.display());
    assert_eq!(result.json()["status"]["state"], "unsupported");
}
