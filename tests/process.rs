#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use docquery::completion::{CompletionGate, ProcessCompleter};
use docquery::config::CompletionConfig;
use docquery::error::ProcessError;
use docquery::process::run_process;

fn sh_completer(gate: CompletionGate) -> ProcessCompleter {
    ProcessCompleter::with_gate(
        CompletionConfig {
            binary: PathBuf::from("sh"),
            model: PathBuf::from("/models/unused.gguf"),
            args: Vec::new(),
            timeout_secs: 30,
        },
        gate,
    )
}

fn script(body: &str) -> Vec<String> {
    vec!["-c".to_string(), body.to_string()]
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn completions_never_overlap() {
    let dir = TempDir::new().unwrap();
    let log = dir.path().join("windows.log");
    let body = format!(
        "echo start >> '{0}'; sleep 0.3; echo end >> '{0}'",
        log.display()
    );

    let gate = CompletionGate::isolated();
    let first = sh_completer(gate.clone());
    let second = sh_completer(gate);
    let token = CancellationToken::new();

    let script_a = script(&body);
    let script_b = script(&body);
    let started = Instant::now();
    let (a, b) = tokio::join!(
        first.run(&token, &script_a),
        second.run(&token, &script_b)
    );
    a.unwrap();
    b.unwrap();

    assert!(started.elapsed() >= Duration::from_millis(600));
    let lines: Vec<String> = std::fs::read_to_string(&log)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect();
    assert_eq!(lines, vec!["start", "end", "start", "end"]);
}

#[tokio::test]
async fn cancel_kills_the_running_child() {
    let dir = TempDir::new().unwrap();
    let pidfile = dir.path().join("child.pid");
    let body = format!("echo $$ > '{}'; exec sleep 30", pidfile.display());

    let token = CancellationToken::new();
    let canceller = token.clone();
    let watched = pidfile.clone();
    tokio::spawn(async move {
        for _ in 0..200 {
            if watched.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        canceller.cancel();
    });

    let started = Instant::now();
    let result = run_process(
        &token,
        Path::new("sh"),
        &script(&body),
        Duration::from_secs(60),
    )
    .await;
    assert!(matches!(result, Err(ProcessError::Cancelled)));
    assert!(started.elapsed() < Duration::from_secs(10));

    let pid = std::fs::read_to_string(&pidfile).unwrap();
    let alive = std::process::Command::new("kill")
        .args(["-0", pid.trim()])
        .stderr(std::process::Stdio::null())
        .status()
        .unwrap()
        .success();
    assert!(!alive, "child {} survived cancellation", pid.trim());
}

#[tokio::test]
async fn cancelled_completion_releases_the_gate() {
    let gate = CompletionGate::isolated();
    let slow = sh_completer(gate.clone());
    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel();
    });

    let err = slow.run(&token, &script("sleep 30")).await.unwrap_err();
    assert!(docquery::error::is_cancellation(&err));

    let next = sh_completer(gate);
    let out = tokio::time::timeout(
        Duration::from_secs(5),
        next.run(&CancellationToken::new(), &script("echo ok")),
    )
    .await
    .expect("gate was not released")
    .unwrap();
    assert_eq!(String::from_utf8_lossy(&out).trim(), "ok");
}

/// True once `pid` has exited. A zombie awaiting its new parent counts.
fn is_gone(pid: &str) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid.trim())) {
        Ok(stat) => stat
            .rsplit_once(')')
            .map(|(_, rest)| rest.trim_start().starts_with('Z'))
            .unwrap_or(false),
        Err(_) => true,
    }
}

#[tokio::test]
async fn cancel_is_honoured_while_a_grandchild_holds_the_pipes() {
    let dir = TempDir::new().unwrap();
    let pidfile = dir.path().join("grandchild.pid");
    let body = format!("sleep 8 & echo $! > '{}'; echo hi", pidfile.display());

    let token = CancellationToken::new();
    let canceller = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        canceller.cancel();
    });

    let started = Instant::now();
    let result = run_process(&token, Path::new("sh"), &script(&body), Duration::from_secs(30)).await;
    assert!(matches!(result, Err(ProcessError::Cancelled)), "{:?}", result);
    assert!(started.elapsed() < Duration::from_secs(3));

    if cfg!(target_os = "linux") {
        let pid = std::fs::read_to_string(&pidfile).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(is_gone(&pid), "grandchild {} survived cancellation", pid.trim());
    }
}

#[tokio::test]
async fn timeout_is_honoured_while_a_grandchild_holds_the_pipes() {
    let token = CancellationToken::new();
    let started = Instant::now();
    let result = run_process(
        &token,
        Path::new("sh"),
        &script("sleep 8 & echo hi"),
        Duration::from_millis(500),
    )
    .await;
    assert!(matches!(result, Err(ProcessError::TimedOut { .. })), "{:?}", result);
    assert!(started.elapsed() < Duration::from_secs(3));
}

#[tokio::test]
async fn cancel_kills_background_children_too() {
    let dir = TempDir::new().unwrap();
    let pidfile = dir.path().join("grandchild.pid");
    let body = format!(
        "sleep 30 > /dev/null 2>&1 & echo $! > '{0}.tmp'; mv '{0}.tmp' '{0}'; wait",
        pidfile.display()
    );

    let token = CancellationToken::new();
    let canceller = token.clone();
    let watched = pidfile.clone();
    tokio::spawn(async move {
        for _ in 0..200 {
            if watched.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        canceller.cancel();
    });

    let result = run_process(&token, Path::new("sh"), &script(&body), Duration::from_secs(60)).await;
    assert!(matches!(result, Err(ProcessError::Cancelled)));

    if cfg!(target_os = "linux") {
        let pid = std::fs::read_to_string(&pidfile).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(is_gone(&pid), "background child {} survived cancellation", pid.trim());
    }
}
