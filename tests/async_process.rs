//! Task-model persistent process tests.

#![cfg(unix)]

mod common;

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};

use claude_duplex::process::AsyncPersistentProcess;
use claude_duplex::Error;

use common::{bulky_payload, init_tracing, sh};

const READ: Duration = Duration::from_secs(5);

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn echo_round_trip_preserves_payload() {
    init_tracing();
    let process = AsyncPersistentProcess::new();
    process.start_command(&sh("cat")).await.unwrap();

    let payload = bulky_payload();
    process.write_request(&payload).await.unwrap();

    let mut lines = process.read_lines(READ).await.unwrap();
    let line = lines.next().await.unwrap().unwrap();
    let echoed: Value = serde_json::from_slice(&line).unwrap();
    assert_eq!(echoed, payload);
    drop(lines);

    process.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn requests_come_back_in_write_order() {
    let process = AsyncPersistentProcess::new();
    process.start_command(&sh("cat")).await.unwrap();

    for n in 0..500u64 {
        process.write_request(&json!({ "n": n })).await.unwrap();
    }

    let numbers: Vec<u64> = process
        .read_lines(READ)
        .await
        .unwrap()
        .into_stream()
        .take(500)
        .map(|line| {
            let value: Value = serde_json::from_slice(&line.unwrap()).unwrap();
            value["n"].as_u64().unwrap()
        })
        .collect()
        .await;
    assert_eq!(numbers, (0..500).collect::<Vec<u64>>());
    process.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn start_while_running_is_rejected() {
    let process = AsyncPersistentProcess::new();
    process.start_command(&sh("cat")).await.unwrap();
    assert!(matches!(
        process.start_command(&sh("cat")).await,
        Err(Error::AlreadyRunning)
    ));
    process.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_is_idempotent_and_manager_is_reusable() {
    let process = AsyncPersistentProcess::new();
    process.start_command(&sh("cat")).await.unwrap();
    assert!(process.is_alive().await);

    process.stop().await;
    process.stop().await;
    assert!(!process.is_alive().await);
    assert!(process.pid().is_none());

    process.start_command(&sh("cat")).await.unwrap();
    assert!(process.is_alive().await);
    process.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_start_and_stop_leave_nothing_running() {
    let process = Arc::new(AsyncPersistentProcess::new());

    let starter = {
        let process = Arc::clone(&process);
        tokio::spawn(async move {
            for _ in 0..20 {
                match process.start_command(&sh("cat")).await {
                    Ok(()) | Err(Error::AlreadyRunning) => {}
                    Err(e) => panic!("unexpected start failure: {e}"),
                }
            }
        })
    };
    for _ in 0..20 {
        process.stop().await;
    }
    starter.await.unwrap();

    process.stop().await;
    assert!(!process.is_alive().await);
    assert!(process.pid().is_none());
    assert!(matches!(
        process.write_request(&json!({})).await,
        Err(Error::NotRunning)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn self_exit_is_noticed_and_the_stream_ends_empty() {
    let process = AsyncPersistentProcess::new();
    process.start_command(&sh("exit 0")).await.unwrap();

    tokio::time::timeout(READ, async {
        while process.is_alive().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("child exit should be noticed");

    let mut lines = process.read_lines(READ).await.unwrap();
    assert!(lines.next().await.is_none());
    drop(lines);
    process.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn clean_exit_ends_the_stream() {
    let process = AsyncPersistentProcess::new();
    process
        .start_command(&sh("printf 'one\\ntwo\\n'; exit 0"))
        .await
        .unwrap();

    let lines: Vec<Vec<u8>> = process
        .read_lines(READ)
        .await
        .unwrap()
        .into_stream()
        .map(|line| line.expect("clean exit is not an error"))
        .collect()
        .await;
    assert_eq!(lines, vec![b"one".to_vec(), b"two".to_vec()]);
    process.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn non_zero_exit_surfaces_exit_code_and_stderr() {
    let process = AsyncPersistentProcess::new();
    process
        .start_command(&sh("echo oops >&2; (sleep 5) & exit 3"))
        .await
        .unwrap();

    let mut lines = process
        .read_lines(Duration::from_millis(200))
        .await
        .unwrap();
    match lines.next().await {
        Some(Err(Error::UnexpectedExit { exit_code, stderr })) => {
            assert_eq!(exit_code, Some(3));
            assert!(stderr.contains("oops"), "stderr was {stderr:?}");
        }
        other => panic!("expected UnexpectedExit, got {other:?}"),
    }
    assert!(lines.next().await.is_none());
    drop(lines);
    process.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn abandoned_stream_keeps_end_marker() {
    let process = AsyncPersistentProcess::new();
    process
        .start_command(&sh("printf 'a\\nb\\nc\\n'; exit 0"))
        .await
        .unwrap();

    let mut first = process.read_lines(READ).await.unwrap();
    assert_eq!(first.next().await.unwrap().unwrap(), b"a");
    // let the reader queue the remaining lines and the end marker
    tokio::time::sleep(Duration::from_millis(200)).await;
    drop(first);

    let mut second = process.read_lines(READ).await.unwrap();
    assert!(second.next().await.is_none());
    drop(second);
    process.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stderr_is_captured_and_trimmed() {
    let process = AsyncPersistentProcess::new();
    process
        .start_command(&sh("printf '  warn  \\n\\n' >&2; sleep 5"))
        .await
        .unwrap();

    let mut stderr = Vec::new();
    for _ in 0..100 {
        stderr = process.get_stderr().await;
        if !stderr.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(stderr, vec!["warn".to_string()]);
    process.stop().await;
}
