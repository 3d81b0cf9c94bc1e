//! Integration tests for the download, verify and install pipeline

mod support;

use std::fs;
use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;

use stagehand_core::archive::ArchiveError;
use stagehand_core::prelude::*;

use support::{FakeRepository, FakeRunner, TarEntry, host, tar_gz};

const AGENT_REPO_PATH: &str = "agent/linux/stable/agent.tar.gz";
const ORBIT_REPO_PATH: &str = "orbit/linux/stable/orbit";

// =========================================================================
// Helper Functions
// =========================================================================

fn options(root: &Path) -> Options {
    Options::new(root, Arc::new(MemoryLocalStore::new()))
        .with_target(
            "agent",
            TargetInfo::new("linux", "stable", "agent.tar.gz")
                .with_exec_sub_path(["agent", "agent"]),
        )
        .with_target("orbit", TargetInfo::new("linux", "stable", "orbit"))
}

fn updater(root: &Path, repo: &FakeRepository, runner: &FakeRunner) -> Updater {
    updater_on(repo, runner, HostOs::Linux, options(root))
}

fn updater_on(repo: &FakeRepository, runner: &FakeRunner, os: HostOs, opt: Options) -> Updater {
    Updater::new(opt, repo.client())
        .unwrap()
        .with_host(host(os))
        .with_runner(Arc::new(runner.clone()))
}

fn agent_archive(contents: &[u8]) -> Vec<u8> {
    tar_gz(&[TarEntry::Dir("agent"), TarEntry::File("agent/agent", contents)])
}

// =========================================================================
// Archive Targets
// =========================================================================

#[test]
fn get_downloads_verifies_installs_and_extracts_archive() {
    let temp = TempDir::new().unwrap();
    let root = temp.path();
    let repo = FakeRepository::new();
    repo.publish(AGENT_REPO_PATH, agent_archive(b"#!/bin/sh\necho v1\n"));
    let runner = FakeRunner::new();
    let mut updater = updater(root, &repo, &runner);

    let local = updater.get("agent").unwrap();

    assert_eq!(local.path, root.join("bin/agent.tar.gz"));
    assert_eq!(local.dir_path, Some(root.join("bin/agent")));
    assert_eq!(local.exec_path, root.join("bin/agent/agent"));
    assert_eq!(fs::read(&local.exec_path).unwrap(), b"#!/bin/sh\necho v1\n");
    assert!(local.path.is_file());

    // Smoke test ran against the extraction in staging, which is gone now.
    let calls = runner.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].program, root.join("staging/agent/agent"));
    assert_eq!(calls[0].args, vec!["--help"]);
    assert!(calls[0].existed);
    assert!(!root.join("staging/agent").exists());
    assert!(!root.join("staging/agent.tar.gz").exists());

    assert_eq!(repo.downloads(), vec![AGENT_REPO_PATH]);
}

#[test]
fn get_is_idempotent() {
    let temp = TempDir::new().unwrap();
    let repo = FakeRepository::new();
    repo.publish(AGENT_REPO_PATH, agent_archive(b"v1"));
    let runner = FakeRunner::new();
    let mut updater = updater(temp.path(), &repo, &runner);

    let first = updater.get("agent").unwrap();
    let second = updater.get("agent").unwrap();

    assert_eq!(first, second);
    assert_eq!(repo.download_count(), 1);
    assert_eq!(runner.calls().len(), 1);
    assert_eq!(repo.lookups(), vec![AGENT_REPO_PATH]);
}

#[test]
fn get_re_extracts_missing_executable_without_download() {
    let temp = TempDir::new().unwrap();
    let repo = FakeRepository::new();
    repo.publish(AGENT_REPO_PATH, agent_archive(b"v1"));
    let runner = FakeRunner::new();
    let mut updater = updater(temp.path(), &repo, &runner);

    let local = updater.get("agent").unwrap();
    fs::remove_dir_all(local.dir_path.as_ref().unwrap()).unwrap();

    let local = updater.get("agent").unwrap();
    assert_eq!(fs::read(&local.exec_path).unwrap(), b"v1");
    assert_eq!(repo.download_count(), 1);
}

#[test]
fn hash_mismatch_downloads_once_and_discards_stale_extraction() {
    let temp = TempDir::new().unwrap();
    let root = temp.path();
    let repo = FakeRepository::new();
    repo.publish(AGENT_REPO_PATH, agent_archive(b"v1"));
    let runner = FakeRunner::new();
    let mut updater = updater(root, &repo, &runner);

    updater.get("agent").unwrap();
    let stale_marker = root.join("bin/agent/left-over-from-v1");
    fs::write(&stale_marker, b"stale").unwrap();

    repo.publish(AGENT_REPO_PATH, agent_archive(b"v2"));
    let local = updater.get("agent").unwrap();

    assert_eq!(repo.download_count(), 2);
    assert_eq!(fs::read(&local.exec_path).unwrap(), b"v2");
    assert!(!stale_marker.exists());
}

fn staging_entries(root: &Path) -> Vec<String> {
    fs::read_dir(root.join("staging"))
        .unwrap()
        .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
        .collect()
}

#[test]
fn top_level_executable_is_replaced_on_update() {
    let temp = TempDir::new().unwrap();
    let root = temp.path();
    let repo = FakeRepository::new();
    let runner = FakeRunner::new();
    // The executable sits at the top of the bundle, so the extraction
    // "directory" is the executable itself.
    let opt = Options::new(root, Arc::new(MemoryLocalStore::new())).with_target(
        "agent",
        TargetInfo::new("linux", "stable", "agent.tar.gz").with_exec_sub_path(["agent"]),
    );
    let mut updater = updater_on(&repo, &runner, HostOs::Linux, opt);

    repo.publish(AGENT_REPO_PATH, tar_gz(&[TarEntry::File("agent", b"v1")]));
    let local = updater.get("agent").unwrap();

    assert_eq!(local.exec_path, root.join("bin/agent"));
    assert_eq!(local.dir_path, Some(root.join("bin/agent")));
    assert_eq!(fs::read(&local.exec_path).unwrap(), b"v1");
    assert_eq!(runner.calls()[0].program, root.join("staging/agent"));
    assert!(staging_entries(root).is_empty());

    repo.publish(AGENT_REPO_PATH, tar_gz(&[TarEntry::File("agent", b"v2")]));
    let local = updater.get("agent").unwrap();
    assert_eq!(fs::read(&local.exec_path).unwrap(), b"v2");
    assert!(staging_entries(root).is_empty());

    let local = updater.get("agent").unwrap();
    assert_eq!(fs::read(&local.exec_path).unwrap(), b"v2");
    assert_eq!(repo.download_count(), 2);
}

#[test]
fn archive_with_traversal_is_rejected_before_install() {
    let temp = TempDir::new().unwrap();
    let root = temp.path();
    let repo = FakeRepository::new();
    repo.publish(
        AGENT_REPO_PATH,
        tar_gz(&[
            TarEntry::File("agent/agent", b"ok"),
            TarEntry::Raw("../../escaped", b"pwned"),
        ]),
    );
    let runner = FakeRunner::new();
    let mut updater = updater(root, &repo, &runner);

    let err = updater.get("agent").unwrap_err();

    assert!(matches!(
        err,
        UpdateError::Extraction {
            source: ArchiveError::PathTraversal(_),
            ..
        }
    ));
    assert!(!root.join("bin/agent.tar.gz").exists());
    assert!(!root.join("staging/agent.tar.gz").exists());
    assert!(!temp.path().parent().unwrap().join("escaped").exists());
    assert!(runner.calls().is_empty());
}

#[test]
fn archive_without_executable_is_corrupt() {
    let temp = TempDir::new().unwrap();
    let repo = FakeRepository::new();
    // The executable path is a directory inside the bundle.
    repo.publish(
        AGENT_REPO_PATH,
        tar_gz(&[TarEntry::Dir("agent"), TarEntry::Dir("agent/agent")]),
    );
    let runner = FakeRunner::new();
    let mut updater = updater(temp.path(), &repo, &runner);

    let err = updater.get("agent").unwrap_err();
    assert!(matches!(err, UpdateError::CorruptArtifact(path) if path.ends_with("bin/agent/agent")));
}

// =========================================================================
// Plain Targets
// =========================================================================

#[test]
fn get_installs_plain_executable() {
    let temp = TempDir::new().unwrap();
    let root = temp.path();
    let repo = FakeRepository::new();
    repo.publish(ORBIT_REPO_PATH, b"orbit v1".to_vec());
    let runner = FakeRunner::new();
    let mut updater = updater(root, &repo, &runner);

    let local = updater.get("orbit").unwrap();

    assert_eq!(local.exec_path, root.join("bin/orbit"));
    assert_eq!(local.dir_path, None);
    assert_eq!(fs::read(&local.exec_path).unwrap(), b"orbit v1");
    assert_eq!(runner.calls()[0].program, root.join("staging/orbit"));

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(&local.exec_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }
}

#[test]
fn failed_exec_check_keeps_previous_version() {
    let temp = TempDir::new().unwrap();
    let root = temp.path();
    let repo = FakeRepository::new();
    repo.publish(ORBIT_REPO_PATH, b"orbit v1".to_vec());
    let runner = FakeRunner::new();
    let mut updater = updater(root, &repo, &runner);
    updater.get("orbit").unwrap();

    repo.publish(ORBIT_REPO_PATH, b"orbit v2, wrong arch".to_vec());
    runner.fail_with("cannot execute binary file: Exec format error");
    let err = updater.get("orbit").unwrap_err();

    match err {
        UpdateError::ExecVerification { path, output } => {
            assert_eq!(path, root.join("staging/orbit"));
            assert!(output.contains("Exec format error"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(fs::read(root.join("bin/orbit")).unwrap(), b"orbit v1");
    assert!(!root.join("staging/orbit").exists());
}

#[test]
fn failed_verification_discards_download() {
    let temp = TempDir::new().unwrap();
    let root = temp.path();
    let repo = FakeRepository::new();
    repo.publish(ORBIT_REPO_PATH, b"orbit v1".to_vec());
    repo.set_tamper(true);
    let runner = FakeRunner::new();
    let mut updater = updater(root, &repo, &runner);

    let err = updater.get("orbit").unwrap_err();

    assert!(matches!(
        err,
        UpdateError::Download {
            ref repo_path,
            source: MetadataError::WrongHash(_),
        } if repo_path == ORBIT_REPO_PATH
    ));
    assert!(!root.join("bin/orbit").exists());
    assert!(!root.join("staging/orbit").exists());
    assert!(runner.calls().is_empty());
}

#[test]
fn cancellation_aborts_transfer_and_keeps_live_artifact() {
    let temp = TempDir::new().unwrap();
    let root = temp.path();
    let repo = FakeRepository::new();
    repo.publish(ORBIT_REPO_PATH, b"orbit v1".to_vec());
    let runner = FakeRunner::new();
    let mut updater = updater(root, &repo, &runner);
    updater.get("orbit").unwrap();

    repo.publish(ORBIT_REPO_PATH, b"orbit v2 with a longer body".to_vec());
    repo.cancel_mid_transfer(updater.cancel_token());
    let err = updater.get("orbit").unwrap_err();

    assert!(matches!(err, UpdateError::Cancelled(path) if path == ORBIT_REPO_PATH));
    assert_eq!(fs::read(root.join("bin/orbit")).unwrap(), b"orbit v1");
    assert!(!root.join("staging/orbit").exists());
    assert_eq!(runner.calls().len(), 1);
}

#[test]
fn windows_keeps_previous_executable_as_old() {
    let temp = TempDir::new().unwrap();
    let root = temp.path();
    let repo = FakeRepository::new();
    let repo_path = "orbit/windows/stable/orbit.exe";
    repo.publish(repo_path, b"orbit.exe v1".to_vec());
    let runner = FakeRunner::new();
    let opt = Options::new(root, Arc::new(MemoryLocalStore::new()))
        .with_target("orbit", TargetInfo::new("windows", "stable", "orbit.exe"));
    let mut updater = updater_on(&repo, &runner, HostOs::Windows, opt);

    updater.get("orbit").unwrap();
    assert!(!root.join("bin/orbit.exe.old").exists());

    repo.publish(repo_path, b"orbit.exe v2".to_vec());
    let local = updater.get("orbit").unwrap();

    assert_eq!(fs::read(&local.path).unwrap(), b"orbit.exe v2");
    assert_eq!(fs::read(root.join("bin/orbit.exe.old")).unwrap(), b"orbit.exe v1");

    // The previous `.old` is cleared before the next rename.
    repo.publish(repo_path, b"orbit.exe v3".to_vec());
    let local = updater.get("orbit").unwrap();

    assert_eq!(fs::read(&local.path).unwrap(), b"orbit.exe v3");
    assert_eq!(fs::read(root.join("bin/orbit.exe.old")).unwrap(), b"orbit.exe v2");
}

#[test]
fn cross_platform_target_skips_exec_check() {
    let temp = TempDir::new().unwrap();
    let root = temp.path();
    let repo = FakeRepository::new();
    repo.publish("orbit/windows/stable/orbit.exe", b"MZ".to_vec());
    let runner = FakeRunner::new();
    let opt = Options::new(root, Arc::new(MemoryLocalStore::new()))
        .with_target("orbit", TargetInfo::new("windows", "stable", "orbit.exe"));
    let mut updater = updater_on(&repo, &runner, HostOs::MacOs, opt);

    updater.get("orbit").unwrap();
    assert!(runner.calls().is_empty());
    assert!(root.join("bin/orbit.exe").is_file());
}

// =========================================================================
// Error Cases
// =========================================================================

#[test]
fn unknown_target_performs_no_io() {
    let temp = TempDir::new().unwrap();
    let root = temp.path();
    let repo = FakeRepository::new();
    let runner = FakeRunner::new();
    let mut updater = updater(root, &repo, &runner);

    let err = updater.get("nonexistent").unwrap_err();

    assert!(matches!(err, UpdateError::UnknownTarget(name) if name == "nonexistent"));
    assert!(repo.lookups().is_empty());
    assert_eq!(repo.download_count(), 0);
    assert!(!root.join("staging").exists());
}

#[test]
fn directory_at_install_path_is_a_conflict() {
    let temp = TempDir::new().unwrap();
    let root = temp.path();
    let repo = FakeRepository::new();
    repo.publish(ORBIT_REPO_PATH, b"orbit".to_vec());
    let runner = FakeRunner::new();
    let mut updater = updater(root, &repo, &runner);
    fs::create_dir_all(root.join("bin/orbit")).unwrap();

    let err = updater.get("orbit").unwrap_err();

    assert!(matches!(err, UpdateError::LocalPathConflict(path) if path == root.join("bin/orbit")));
    assert_eq!(repo.download_count(), 0);
}

#[test]
fn missing_remote_target_fails_lookup() {
    let temp = TempDir::new().unwrap();
    let root = temp.path();
    let repo = FakeRepository::new();
    let runner = FakeRunner::new();
    let mut updater = updater(root, &repo, &runner);
    fs::write(root.join("bin/orbit"), b"installed").unwrap();

    let err = updater.get("orbit").unwrap_err();
    assert!(matches!(
        err,
        UpdateError::Lookup {
            source: MetadataError::NotFound(_),
            ..
        }
    ));
    assert_eq!(fs::read(root.join("bin/orbit")).unwrap(), b"installed");
}

// =========================================================================
// Channels and Dev Builds
// =========================================================================

#[test]
fn channel_switch_changes_download_path() {
    let temp = TempDir::new().unwrap();
    let repo = FakeRepository::new();
    repo.publish("orbit/linux/edge/orbit", b"edge build".to_vec());
    let runner = FakeRunner::new();
    let mut updater = updater(temp.path(), &repo, &runner);

    updater.set_target_channel("orbit", "edge").unwrap();
    let local = updater.get("orbit").unwrap();

    assert_eq!(local.info.channel(), "edge");
    assert_eq!(repo.downloads(), vec!["orbit/linux/edge/orbit"]);
    assert_eq!(fs::read(&local.exec_path).unwrap(), b"edge build");
}

#[test]
fn copy_dev_build_replaces_executable() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("root");
    let dev_build = temp.path().join("target/debug/agent");
    fs::create_dir_all(dev_build.parent().unwrap()).unwrap();
    fs::write(&dev_build, b"dev build").unwrap();

    let mut updater = Updater::new_disabled(options(&root)).unwrap();
    let local = updater.copy_dev_build("agent", &dev_build).unwrap();

    assert_eq!(local.exec_path, root.join("bin/agent/agent"));
    assert_eq!(fs::read(&local.exec_path).unwrap(), b"dev build");

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(&local.exec_path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }
}

#[test]
fn copy_dev_build_missing_source_is_an_error() {
    let temp = TempDir::new().unwrap();
    let mut updater = Updater::new_disabled(options(temp.path())).unwrap();

    let err = updater
        .copy_dev_build("orbit", &temp.path().join("nope"))
        .unwrap_err();
    assert!(matches!(err, UpdateError::Io { context: "open dev build", .. }));
}
