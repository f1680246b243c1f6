//! One-shot execution and query tests.

#![cfg(unix)]

mod common;

use futures::StreamExt;
use pretty_assertions::assert_eq;

use claude_duplex::process::{execute, SpawnOptions};
use claude_duplex::{async_query_command, query, query_command, ClientConfig, Error, Message};

use common::{init_tracing, sh, ScenarioBuilder};

#[test]
fn query_command_stops_at_the_result() {
    init_tracing();
    let cli = ScenarioBuilder::new()
        .system_init()
        .assistant_text("4")
        .success_result("4")
        .raw("trailing noise after the result")
        .oneshot();

    let messages: Vec<Message> = query_command(&cli)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[1].as_assistant().unwrap().text(), "4");
    let result = messages[2].as_result().unwrap();
    assert!(result.is_success());
    assert_eq!(result.total_cost_usd, Some(0.001));
}

#[test]
fn error_results_are_still_yielded() {
    let cli = ScenarioBuilder::new()
        .error_result("max turns reached")
        .oneshot();

    let messages: Vec<Message> = query_command(&cli)
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    let result = messages[0].as_result().unwrap();
    assert!(result.is_error);
    assert!(!result.is_success());
    assert_eq!(result.result.as_deref(), Some("max turns reached"));
}

#[test]
fn cli_failure_carries_code_and_stderr() {
    let cli = sh("echo 'Error: not logged in' >&2; exit 2");
    let err = query_command(&cli)
        .unwrap()
        .find_map(|message| message.err())
        .expect("exit should surface as an error");

    assert!(matches!(err, Error::CliExit { .. }));
    assert_eq!(err.exit_code(), Some(2));
    assert_eq!(err.stderr(), Some("Error: not logged in"));
    assert!(!err.to_string().is_empty());
}

#[test]
fn missing_cli_is_reported_before_spawning() {
    let config = ClientConfig::builder()
        .cli_path("/nonexistent/bin/claude")
        .build()
        .unwrap();
    assert!(matches!(
        query("hi", &config),
        Err(Error::CliNotFound { searched }) if searched.contains("/nonexistent/bin/claude")
    ));
}

#[test]
fn execute_applies_spawn_options() {
    let dir = tempfile::tempdir().unwrap();
    let options = SpawnOptions {
        working_dir: Some(dir.path().to_path_buf()),
        env: [("DUPLEX_MARKER".to_string(), "oneshot".to_string())]
            .into_iter()
            .collect(),
    };
    let argv = [
        "sh".to_string(),
        "-c".to_string(),
        "echo \"$DUPLEX_MARKER\"; pwd".to_string(),
    ];

    let lines: Vec<String> = execute(&argv, &options)
        .unwrap()
        .map(|line| String::from_utf8(line.unwrap()).unwrap())
        .collect();
    assert_eq!(lines[0], "oneshot");
    assert_eq!(
        std::fs::canonicalize(&lines[1]).unwrap(),
        std::fs::canonicalize(dir.path()).unwrap()
    );
}

#[test]
fn dropping_early_terminates_the_run() {
    let mut lines = execute(
        &["sh".to_string(), "-c".to_string(), "echo first; exec sleep 30".to_string()],
        &SpawnOptions::default(),
    )
    .unwrap();
    assert_eq!(lines.next().unwrap().unwrap(), b"first");

    let started = std::time::Instant::now();
    drop(lines);
    assert!(started.elapsed() < std::time::Duration::from_secs(5));
}

#[tokio::test]
async fn async_query_streams_messages() {
    let cli = ScenarioBuilder::new()
        .assistant_text("Hello")
        .assistant_text(", world")
        .success_result("Hello, world")
        .oneshot();

    let text: String = async_query_command(&cli)
        .await
        .unwrap()
        .into_stream()
        .filter_map(|message| async move {
            message.ok()?.as_assistant().map(|assistant| assistant.text())
        })
        .collect()
        .await;
    assert_eq!(text, "Hello, world");
}
