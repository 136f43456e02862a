use ptyd::config::ServerConfig;
use ptyd::daemon::{connect_legacy, ExitStatus, LaunchRequest, LegacyExit, LegacyServer, SocketPaths};
use ptyd::error::ClientError;
use std::fs::File;
use std::io::{Read, Write};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

fn request(script: &str) -> LaunchRequest {
    LaunchRequest {
        path: "/bin/sh".to_string(),
        argv: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
        envp: vec!["PATH=/usr/bin:/bin".to_string()],
        columns: 80,
        rows: 24,
        ..LaunchRequest::default()
    }
}

fn start(script: &str) -> (TempDir, SocketPaths, i32, i32, thread::JoinHandle<anyhow::Result<LegacyExit>>) {
    let dir = TempDir::new().unwrap();
    let paths = SocketPaths::new(dir.path());
    let mut server = LegacyServer::launch(&paths, &request(script), &ServerConfig::default()).unwrap();
    let server_pid = nix::unistd::getpid().as_raw();
    let child_pid = server.child_pid();
    let handle = thread::spawn(move || server.run());
    (dir, paths, server_pid, child_pid, handle)
}

fn read_until(file: &mut File, needle: &str) -> String {
    let mut out = Vec::new();
    let mut buf = [0u8; 256];
    while !String::from_utf8_lossy(&out).contains(needle) {
        match file.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => out.extend_from_slice(&buf[..n]),
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[test]
fn test_client_receives_master_and_pid() {
    let (_dir, paths, server_pid, child_pid, handle) = start("read line; echo got $line; sleep 30");

    let attachment = connect_legacy(&paths, server_pid).unwrap();
    assert_eq!(attachment.child_pid, child_pid);

    let mut master = File::from(attachment.master.try_clone().unwrap());
    master.write_all(b"hello\n").unwrap();
    assert!(read_until(&mut master, "got hello").contains("got hello"));

    drop(master);
    drop(attachment);
    assert_eq!(handle.join().unwrap().unwrap(), LegacyExit::ClientDisconnected);

    let _ = nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(child_pid),
        nix::sys::signal::Signal::SIGKILL,
    );
}

#[test]
fn test_child_exit_ends_server() {
    let (_dir, paths, server_pid, _child_pid, handle) = start("read line; exit 5");

    let attachment = connect_legacy(&paths, server_pid).unwrap();
    let mut master = File::from(attachment.master.try_clone().unwrap());
    master.write_all(b"go\n").unwrap();

    assert_eq!(
        handle.join().unwrap().unwrap(),
        LegacyExit::ChildExited(ExitStatus::Exited(5))
    );
}

#[test]
fn test_only_one_client_is_served() {
    let (_dir, paths, server_pid, child_pid, handle) = start("sleep 30");
    let socket = paths.path_for(server_pid);

    let attachment = connect_legacy(&paths, server_pid).unwrap();
    for _ in 0..100 {
        if !socket.exists() {
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }
    assert!(!socket.exists(), "socket removed once the client is served");
    assert!(matches!(
        connect_legacy(&paths, server_pid),
        Err(ClientError::Connect { .. })
    ));

    drop(attachment);
    assert_eq!(handle.join().unwrap().unwrap(), LegacyExit::ClientDisconnected);

    let _ = nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(child_pid),
        nix::sys::signal::Signal::SIGKILL,
    );
}
