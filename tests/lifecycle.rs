//! End-to-end lifecycle scenarios against fake external tools.
//!
//! The hypervisor, disk tool and share daemon are `sh -c` scripts, so these
//! tests exercise the real locking, persistence and process handling without
//! QEMU installed.

use localvm::lifecycle::{AutoConfirm, Controller, CreateSpec, StartOptions, VmState};
use localvm::process::StopOutcome;
use localvm::record::{Protocol, ShareTransport};
use localvm::{Error, ErrorKind, Settings};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

const HEADLESS: StartOptions = StartOptions { headless: true };

/// qemu-img stand-in that remembers the image size (in MiB) inside the image file.
const DISK_TOOL: &str = r#"
case "$1" in
  create) printf '%s\n' "${5%M}" > "$4" ;;
  resize) printf '%s\n' "${3%M}" > "$2" ;;
  info) mib=$(cat "$3"); echo "{\"virtual-size\": $((mib * 1048576)), \"actual-size\": 4096}" ;;
  *) echo "unknown subcommand $1" >&2; exit 1 ;;
esac
"#;

/// virtiofsd stand-in: creates its socket file, then idles.
const SHARE_DAEMON: &str = r#"
for a in "$@"; do
  case "$a" in --socket-path=*) : > "${a#--socket-path=}" ;; esac
done
exec sleep 30
"#;

fn sh(script: &str, argv0: &str) -> Vec<String> {
    vec!["sh".into(), "-c".into(), script.into(), argv0.into()]
}

fn settings(tmp: &TempDir) -> Settings {
    Settings {
        vm_dir: tmp.path().join("vms"),
        hypervisor: sh("exec sleep 30", "qemu"),
        disk_tool: sh(DISK_TOOL, "qemu-img"),
        share_daemon: sh(SHARE_DAEMON, "virtiofsd"),
        usb_sysfs: tmp.path().join("sys"),
        lock_timeout: Duration::from_secs(2),
        stop_timeout: Duration::from_secs(5),
        launch_check: Duration::from_millis(300),
        monitor_timeout: Duration::from_millis(500),
        check_host_ports: false,
        ..Settings::default()
    }
}

fn controller(settings: Settings) -> Controller {
    Controller::new(settings).with_confirm(AutoConfirm(true))
}

fn spec(cores: u32, memory_mib: u64) -> CreateSpec {
    CreateSpec {
        cores: Some(cores),
        memory_mib: Some(memory_mib),
        disk_mib: Some(4096),
        ..CreateSpec::default()
    }
}

fn names(ctl: &Controller) -> Vec<String> {
    ctl.list().unwrap().into_iter().map(|v| v.name).collect()
}

#[test]
fn create_then_status_round_trips() {
    let tmp = TempDir::new().unwrap();
    let ctl = controller(settings(&tmp));

    ctl.create("web", &spec(4, 4096)).unwrap();
    let status = ctl.status("web").unwrap();
    assert_eq!(status.state, VmState::Stopped);
    assert_eq!(status.record.cores, 4);
    assert_eq!(status.record.memory_mib, 4096);
    assert_eq!(status.record.disk_mib, Some(4096));
    assert_eq!(status.disk.unwrap().virtual_size, 4096 * 1024 * 1024);
    assert_eq!(status.pid, None);
    assert_eq!(ctl.resolve("1").unwrap(), "web");
}

#[test]
fn invalid_name_leaves_nothing_behind() {
    let tmp = TempDir::new().unwrap();
    let ctl = controller(settings(&tmp));

    for bad in ["bad name", "../escape", "-dash", "trailing-", "a--b", ""] {
        let err = ctl.create(bad, &spec(1, 512)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation, "{}", bad);
    }
    assert!(names(&ctl).is_empty());
    assert!(!tmp.path().join("escape").exists());
}

#[test]
fn duplicate_create_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let ctl = controller(settings(&tmp));

    ctl.create("web", &spec(1, 512)).unwrap();
    assert!(matches!(
        ctl.create("web", &spec(2, 1024)),
        Err(Error::VmExists { .. })
    ));
    assert_eq!(ctl.status("web").unwrap().record.cores, 1);
}

#[test]
fn delete_then_recreate() {
    let tmp = TempDir::new().unwrap();
    let ctl = controller(settings(&tmp));

    ctl.create("web", &spec(1, 512)).unwrap();
    ctl.delete("web", false).unwrap();
    assert!(!tmp.path().join("vms/web").exists());
    assert!(names(&ctl).is_empty());

    ctl.create("web", &spec(2, 1024)).unwrap();
    assert_eq!(ctl.status("web").unwrap().record.cores, 2);
}

#[test]
fn declined_delete_keeps_the_vm() {
    let tmp = TempDir::new().unwrap();
    let ctl = Controller::new(settings(&tmp)).with_confirm(AutoConfirm(false));

    ctl.create("web", &spec(1, 512)).unwrap();
    let err = ctl.delete("web", false).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert!(tmp.path().join("vms/web/vm.conf").exists());
}

#[test]
fn port_add_is_idempotent_and_conflicts_name_the_owner() {
    let tmp = TempDir::new().unwrap();
    let ctl = controller(settings(&tmp));
    ctl.create("v1", &spec(1, 512)).unwrap();
    ctl.create("v2", &spec(1, 512)).unwrap();

    assert!(ctl.port_add("v1", "8080:80/tcp".parse().unwrap()).unwrap());
    assert!(!ctl.port_add("v1", "8080:80/tcp".parse().unwrap()).unwrap());
    assert_eq!(ctl.port_list(Some("v1")).unwrap().len(), 1);

    let err = ctl.port_add("v2", "8080:8000/tcp".parse().unwrap()).unwrap_err();
    assert!(matches!(err, Error::PortConflict { .. }));
    assert!(err.to_string().contains("'v1'"), "{}", err);

    // Same port, other protocol, is a different key.
    assert!(ctl.port_add("v2", "8080:8000/udp".parse().unwrap()).unwrap());
    assert_eq!(ctl.port_list(None).unwrap().len(), 2);

    ctl.port_remove("v1", 8080, Protocol::Tcp).unwrap();
    assert!(!ctl.status("v1").unwrap().record.port_forwarding);
    assert!(ctl.port_add("v2", "8080:8000/tcp".parse().unwrap()).unwrap());
}

#[test]
fn port_add_rejects_ports_busy_on_the_host() {
    let tmp = TempDir::new().unwrap();
    let mut s = settings(&tmp);
    s.check_host_ports = true;
    let ctl = controller(s);
    ctl.create("web", &spec(1, 512)).unwrap();

    let listener = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let rule = format!("{}:80/tcp", port).parse().unwrap();
    assert!(matches!(
        ctl.port_add("web", rule),
        Err(Error::PortInUse { .. })
    ));
    assert!(ctl.port_list(Some("web")).unwrap().is_empty());
}

#[test]
fn locked_vm_rejects_mutation_until_unlocked() {
    let tmp = TempDir::new().unwrap();
    let ctl = controller(settings(&tmp));
    ctl.create("web", &spec(1, 512)).unwrap();
    ctl.port_add("web", "2222:22".parse().unwrap()).unwrap();
    ctl.lock("web").unwrap();

    assert!(matches!(ctl.delete("web", false), Err(Error::VmLocked { .. })));
    assert!(matches!(ctl.resize("web", 8192, false), Err(Error::VmLocked { .. })));
    assert!(matches!(
        ctl.port_add("web", "8080:80".parse().unwrap()),
        Err(Error::VmLocked { .. })
    ));
    assert!(matches!(
        ctl.port_remove("web", 2222, Protocol::Tcp),
        Err(Error::VmLocked { .. })
    ));
    assert!(matches!(
        ctl.share_add("web", tmp.path(), None, ShareTransport::NineP),
        Err(Error::VmLocked { .. })
    ));

    ctl.unlock("web").unwrap();
    ctl.port_add("web", "8080:80".parse().unwrap()).unwrap();
    ctl.resize("web", 8192, false).unwrap();
    ctl.delete("web", false).unwrap();
    assert!(names(&ctl).is_empty());
}

#[test]
fn resize_only_grows() {
    let tmp = TempDir::new().unwrap();
    let ctl = controller(settings(&tmp));
    ctl.create("web", &spec(1, 512)).unwrap();

    let err = ctl.resize("web", 2048, false).unwrap_err();
    assert!(err.to_string().contains("shrinking"), "{}", err);
    assert!(ctl.resize("web", 4096, false).is_err());

    let record = ctl.resize("web", 8192, false).unwrap();
    assert_eq!(record.disk_mib, Some(8192));
    let status = ctl.status("web").unwrap();
    assert_eq!(status.disk.unwrap().virtual_size, 8192 * 1024 * 1024);
}

#[test]
fn create_rolls_back_when_the_disk_tool_fails() {
    let tmp = TempDir::new().unwrap();
    let mut s = settings(&tmp);
    s.disk_tool = sh("echo 'qemu-img: permission denied' >&2; exit 1", "qemu-img");
    let ctl = controller(s);

    let err = ctl.create("web", &spec(1, 512)).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::External);
    assert!(err.to_string().contains("permission denied"), "{}", err);
    assert!(!tmp.path().join("vms/web").exists());
    assert!(names(&ctl).is_empty());
}

#[test]
fn vm_count_is_capped() {
    let tmp = TempDir::new().unwrap();
    let mut s = settings(&tmp);
    s.max_vms = 2;
    let ctl = controller(s);

    ctl.create("a", &spec(1, 512)).unwrap();
    ctl.create("b", &spec(1, 512)).unwrap();
    assert!(matches!(
        ctl.create("c", &spec(1, 512)),
        Err(Error::VmLimit { max: 2 })
    ));
    assert!(!tmp.path().join("vms/c").exists());
}

#[test]
fn end_to_end_v1_v2_scenario() {
    let tmp = TempDir::new().unwrap();
    let ctl = controller(settings(&tmp));

    ctl.create("v1", &spec(4, 4096)).unwrap();
    let status = ctl.status("v1").unwrap();
    assert_eq!((status.record.memory_mib, status.record.cores), (4096, 4));
    assert_eq!(status.state, VmState::Stopped);

    let run = ctl.start("v1", &HEADLESS).unwrap();
    let status = ctl.status("v1").unwrap();
    assert_eq!(status.state, VmState::Running);
    assert_eq!(status.pid, Some(run.pid));
    assert!(matches!(
        ctl.start("v1", &HEADLESS),
        Err(Error::VmRunning { .. })
    ));

    let err = ctl.port_add("v1", "8080:80/tcp".parse().unwrap()).unwrap_err();
    assert!(matches!(err, Error::VmRunning { .. }), "{}", err);

    assert_eq!(ctl.stop("v1", false).unwrap(), StopOutcome::Exited);
    assert_eq!(ctl.status("v1").unwrap().state, VmState::Stopped);
    assert!(!tmp.path().join("vms/v1/run.state").exists());

    ctl.port_add("v1", "8080:80/tcp".parse().unwrap()).unwrap();
    let listed = ctl.port_list(None).unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].vm, "v1");

    ctl.create("v2", &spec(1, 512)).unwrap();
    let err = ctl.port_add("v2", "8080:8080/tcp".parse().unwrap()).unwrap_err();
    assert!(err.to_string().contains("v1"), "{}", err);

    ctl.delete("v1", true).unwrap();
    assert!(!tmp.path().join("vms/v1").exists());
    assert_eq!(names(&ctl), vec!["v2"]);
}

#[test]
fn stop_on_a_stopped_vm_is_a_no_op() {
    let tmp = TempDir::new().unwrap();
    let ctl = controller(settings(&tmp));
    ctl.create("web", &spec(1, 512)).unwrap();
    assert_eq!(ctl.stop("web", false).unwrap(), StopOutcome::NotRunning);
    assert!(matches!(ctl.stop("ghost", false), Err(Error::VmNotFound { .. })));
}

#[test]
fn stop_escalates_to_kill_after_timeout() {
    let tmp = TempDir::new().unwrap();
    let mut s = settings(&tmp);
    s.hypervisor = sh("trap '' TERM; while :; do sleep 1; done", "qemu");
    s.stop_timeout = Duration::from_millis(500);
    let ctl = controller(s);

    ctl.create("web", &spec(1, 512)).unwrap();
    ctl.start("web", &HEADLESS).unwrap();
    assert_eq!(ctl.stop("web", false).unwrap(), StopOutcome::Killed);
    assert_eq!(ctl.status("web").unwrap().state, VmState::Stopped);
}

#[test]
fn force_stop_kills_immediately() {
    let tmp = TempDir::new().unwrap();
    let ctl = controller(settings(&tmp));
    ctl.create("web", &spec(1, 512)).unwrap();
    ctl.start("web", &HEADLESS).unwrap();
    assert_eq!(ctl.stop("web", true).unwrap(), StopOutcome::Killed);
}

#[test]
fn hypervisor_exiting_at_launch_is_reported_with_its_log() {
    let tmp = TempDir::new().unwrap();
    let mut s = settings(&tmp);
    s.hypervisor = sh("echo 'qemu: could not load kernel' >&2; exit 1", "qemu");
    let ctl = controller(s);

    ctl.create("web", &spec(1, 512)).unwrap();
    let err = ctl.start("web", &HEADLESS).unwrap_err();
    assert!(matches!(err, Error::LaunchFailed { .. }), "{}", err);
    assert!(err.to_string().contains("could not load kernel"), "{}", err);
    assert_eq!(ctl.status("web").unwrap().state, VmState::Stopped);
    assert!(!tmp.path().join("vms/web/run.state").exists());
}

#[test]
fn missing_disk_fails_before_launch() {
    let tmp = TempDir::new().unwrap();
    let ctl = controller(settings(&tmp));
    ctl.create("web", &spec(1, 512)).unwrap();
    fs::remove_file(tmp.path().join("vms/web/disk.qcow2")).unwrap();

    assert!(matches!(
        ctl.start("web", &HEADLESS),
        Err(Error::DiskNotFound { .. })
    ));
    assert!(!tmp.path().join("vms/web/run.state").exists());
}

#[test]
fn shared_folder_daemons_follow_the_vm() {
    let tmp = TempDir::new().unwrap();
    let ctl = controller(settings(&tmp));
    let shared = tmp.path().join("projects");
    fs::create_dir_all(&shared).unwrap();

    ctl.create("web", &spec(1, 512)).unwrap();
    let folder = ctl
        .share_add("web", &shared, Some("src"), ShareTransport::Virtiofs)
        .unwrap();
    assert_eq!(folder.host_path, fs::canonicalize(&shared).unwrap());
    assert!(matches!(
        ctl.share_add("web", &shared, Some("other"), ShareTransport::Virtiofs),
        Err(Error::Duplicate { .. })
    ));

    let run = ctl.start("web", &HEADLESS).unwrap();
    assert_eq!(run.daemons.len(), 1);
    let socket = tmp.path().join("vms/web/fs-src.sock");
    assert!(socket.exists());
    assert_eq!(ctl.status("web").unwrap().daemons.len(), 1);

    ctl.stop("web", false).unwrap();
    assert!(!socket.exists());
    assert!(!is_running(run.daemons[0].pid));

    ctl.share_remove("web", "src").unwrap();
    assert!(ctl.share_list("web").unwrap().is_empty());
}

#[test]
fn force_delete_stops_a_running_vm() {
    let tmp = TempDir::new().unwrap();
    let ctl = controller(settings(&tmp));
    ctl.create("web", &spec(1, 512)).unwrap();
    let run = ctl.start("web", &HEADLESS).unwrap();

    assert!(matches!(ctl.delete("web", false), Err(Error::VmRunning { .. })));
    ctl.delete("web", true).unwrap();
    assert!(!is_running(run.pid));
    assert!(!tmp.path().join("vms/web").exists());
}

#[test]
fn hand_edited_record_without_id_gets_one() {
    let tmp = TempDir::new().unwrap();
    let ctl = controller(settings(&tmp));
    ctl.create("web", &spec(1, 512)).unwrap();

    let conf = tmp.path().join("vms/web/vm.conf");
    let text = fs::read_to_string(&conf).unwrap();
    let stripped: String = text
        .lines()
        .filter(|l| !l.starts_with("ID="))
        .map(|l| format!("{}\n", l))
        .collect();
    write_private(&conf, &stripped);

    ctl.create("db", &spec(1, 512)).unwrap();
    let listed = ctl.list().unwrap();
    assert_eq!(listed.len(), 2);
    assert_ne!(listed[0].id, listed[1].id);

    // The id handed out on the fly was written back and no longer moves.
    assert!(fs::read_to_string(&conf).unwrap().contains("ID=1\n"));
    ctl.delete("db", true).unwrap();
    ctl.create("cache", &spec(1, 512)).unwrap();
    assert_eq!(ctl.resolve("1").unwrap(), "web");
    assert_eq!(ctl.resolve("2").unwrap(), "cache");
}

#[test]
fn unreadable_record_keeps_its_id_ports_and_slot() {
    let tmp = TempDir::new().unwrap();
    let mut settings = settings(&tmp);
    settings.max_vms = 2;
    let ctl = controller(settings);
    ctl.create("v1", &spec(1, 512)).unwrap();
    ctl.port_add("v1", "8080:80".parse().unwrap()).unwrap();
    make_insecure(&tmp.path().join("vms/v1/vm.conf"));

    let v2 = ctl.create("v2", &spec(1, 512)).unwrap();
    assert_eq!(v2.id, Some(2));
    match ctl.port_add("v2", "8080:80".parse().unwrap()) {
        Err(Error::PortConflict { owner, .. }) => assert_eq!(owner, "v1"),
        other => panic!("expected a port conflict with v1, got {:?}", other),
    }
    assert!(matches!(
        ctl.create("v3", &spec(1, 512)),
        Err(Error::VmLimit { max: 2 })
    ));
}

#[test]
fn unreadable_vm_can_be_resolved_and_force_deleted() {
    let tmp = TempDir::new().unwrap();
    let ctl = controller(settings(&tmp));
    ctl.create("v1", &spec(1, 512)).unwrap();
    make_insecure(&tmp.path().join("vms/v1/vm.conf"));

    assert_eq!(ctl.resolve("v1").unwrap(), "v1");
    assert_eq!(ctl.resolve("1").unwrap(), "v1");
    assert_eq!(ctl.status("v1").unwrap_err().kind(), ErrorKind::Corruption);
    assert_eq!(ctl.delete("v1", false).unwrap_err().kind(), ErrorKind::Corruption);

    let name = ctl.resolve("v1").unwrap();
    ctl.delete(&name, true).unwrap();
    assert!(!tmp.path().join("vms/v1").exists());
    assert!(matches!(ctl.resolve("v1"), Err(Error::VmNotFound { .. })));
}

fn is_running(pid: i32) -> bool {
    localvm::process::is_alive(pid)
}

fn make_insecure(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o644)).unwrap();
}

fn write_private(path: &Path, contents: &str) {
    use std::os::unix::fs::PermissionsExt;
    fs::write(path, contents).unwrap();
    fs::set_permissions(path, fs::Permissions::from_mode(0o600)).unwrap();
}
