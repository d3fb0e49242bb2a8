use memoexec::error::Code;
use memoexec::fake::{FakeResult, TestEnv};
use memoexec::remote_exec::Status;
use memoexec::{ExecutionOptions, InputSpec, MemoExecError, OutputRef, ResultStatus};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn whole_root() -> InputSpec {
    InputSpec {
        inputs: vec![".".to_string()],
        ..Default::default()
    }
}

#[tokio::test]
async fn test_echo_success_and_fetch_stdout() {
    let _ = tracing_subscriber::fmt::try_init();
    let env = TestEnv::new().unwrap();
    env.write_file("src/main.c", "int main() { return 0; }").unwrap();

    let cmd = env.command(&["echo", "hi"]);
    let spec = whole_root();
    let options = ExecutionOptions::default();
    let (_, action_digest) = env
        .set(&cmd, &spec, &options, FakeResult::success(0).stdout("hi\n"))
        .unwrap();

    let result = env.client.execute(&cmd, &spec, &options).await.unwrap();
    assert_eq!(result.status, ResultStatus::Success);
    assert_eq!(result.exit_code, 0);
    assert_eq!(result.action_digest.as_ref(), Some(&action_digest));
    assert_eq!(env.server.exec.last_action(), Some(action_digest.clone()));

    let stdout = env.client.fetch_output(&result, &OutputRef::Stdout).await.unwrap();
    assert_eq!(stdout, b"hi\n");
    let stderr = env.client.fetch_output(&result, &OutputRef::Stderr).await.unwrap();
    assert!(stderr.is_empty());

    // Successful results are written back to the action cache.
    assert!(env.server.action_cache.contains(&action_digest));
    let metrics = env.client.metrics();
    assert_eq!(metrics.executions, 1);
    assert_eq!(metrics.successes, 1);
    assert!(metrics.bytes_uploaded > 0);
}

#[tokio::test]
async fn test_inline_output_is_preferred() {
    let env = TestEnv::new().unwrap();
    let cmd = env.command(&["printf", "x"]);
    let spec = InputSpec::default();
    let options = ExecutionOptions::default();
    env.set(&cmd, &spec, &options, FakeResult::success(0).stdout_raw("x").stderr_raw("warn"))
        .unwrap();

    let result = env.client.execute(&cmd, &spec, &options).await.unwrap();
    assert_eq!(env.client.fetch_output(&result, &OutputRef::Stdout).await.unwrap(), b"x");
    assert_eq!(env.client.fetch_output(&result, &OutputRef::Stderr).await.unwrap(), b"warn");
}

#[tokio::test]
async fn test_nonzero_exit_is_success_but_not_cached() {
    let env = TestEnv::new().unwrap();
    let cmd = env.command(&["false"]);
    let spec = InputSpec::default();
    let options = ExecutionOptions::default();
    let (_, action_digest) = env.set(&cmd, &spec, &options, FakeResult::success(1)).unwrap();

    let result = env.client.execute(&cmd, &spec, &options).await.unwrap();
    assert_eq!(result.status, ResultStatus::Success);
    assert_eq!(result.exit_code, 1);
    assert!(!env.server.action_cache.contains(&action_digest));
}

#[tokio::test]
async fn test_second_run_is_cache_hit_unless_forced() {
    let env = TestEnv::new().unwrap();
    env.write_file("input.txt", "data").unwrap();
    let cmd = env.command(&["cat", "input.txt"]);
    let spec = whole_root();
    let options = ExecutionOptions::default();
    env.set(&cmd, &spec, &options, FakeResult::success(0).stdout("data")).unwrap();

    let first = env.client.execute(&cmd, &spec, &options).await.unwrap();
    assert_eq!(first.status, ResultStatus::Success);
    assert_eq!(env.server.exec.execution_count(), 1);

    let second = env.client.execute(&cmd, &spec, &options).await.unwrap();
    assert_eq!(second.status, ResultStatus::CacheHit);
    assert_eq!(second.action_digest, first.action_digest);
    assert_eq!(env.server.exec.execution_count(), 1);
    assert_eq!(
        env.client.fetch_output(&second, &OutputRef::Stdout).await.unwrap(),
        b"data"
    );

    let forced = env
        .client
        .execute(&cmd, &spec, &ExecutionOptions::force_remote())
        .await
        .unwrap();
    assert_eq!(forced.status, ResultStatus::Success);
    assert_eq!(env.server.exec.execution_count(), 2);

    let metrics = env.client.metrics();
    assert_eq!(metrics.cache_hits, 1);
    assert_eq!(metrics.executions, 3);
}

#[tokio::test]
async fn test_seeded_action_cache_skips_upload_and_execution() {
    let env = TestEnv::new().unwrap();
    env.write_file("a.txt", "a").unwrap();
    let cmd = env.command(&["cat", "a.txt"]);
    let spec = whole_root();
    let options = ExecutionOptions::default();
    env.set(&cmd, &spec, &options, FakeResult::new(ResultStatus::CacheHit, 0))
        .unwrap();

    let result = env.client.execute(&cmd, &spec, &options).await.unwrap();
    assert_eq!(result.status, ResultStatus::CacheHit);
    assert_eq!(env.server.exec.execution_count(), 0);
    assert_eq!(env.server.cas.stats().batch_update_requests, 0);
}

#[tokio::test]
async fn test_execution_service_cache_hit() {
    let env = TestEnv::new().unwrap();
    let cmd = env.command(&["true"]);
    let spec = InputSpec::default();
    let options = ExecutionOptions::default();
    let (_, action_digest) = env
        .set(
            &cmd,
            &spec,
            &options,
            FakeResult::new(ResultStatus::CacheHit, 0).execution_cache_hit(true),
        )
        .unwrap();

    let result = env.client.execute(&cmd, &spec, &options).await.unwrap();
    assert_eq!(result.status, ResultStatus::CacheHit);
    assert_eq!(env.server.exec.execution_count(), 1);
    // Only fresh successes are written back.
    assert_eq!(env.server.action_cache.write_count(), 0);
    assert!(!env.server.action_cache.contains(&action_digest));
}

#[tokio::test]
async fn test_do_not_cache_neither_reads_nor_writes() {
    let env = TestEnv::new().unwrap();
    let cmd = env.command(&["date"]);
    let spec = InputSpec::default();
    let options = ExecutionOptions {
        do_not_cache: true,
        ..Default::default()
    };
    let (_, action_digest) = env.set(&cmd, &spec, &options, FakeResult::success(0)).unwrap();

    let result = env.client.execute(&cmd, &spec, &options).await.unwrap();
    assert_eq!(result.status, ResultStatus::Success);
    assert_eq!(env.server.action_cache.read_count(), 0);
    assert_eq!(env.server.action_cache.write_count(), 0);
    assert!(!env.server.action_cache.contains(&action_digest));
}

#[tokio::test]
async fn test_remote_deadline_is_timeout_and_not_cached() {
    let env = TestEnv::new().unwrap();
    let cmd = env.command(&["sleep", "100"]);
    let spec = InputSpec::default();
    let options = ExecutionOptions::default();
    let (_, action_digest) = env
        .set(&cmd, &spec, &options, FakeResult::new(ResultStatus::TimeoutError, 0))
        .unwrap();

    let result = env.client.execute(&cmd, &spec, &options).await.unwrap();
    assert_eq!(result.status, ResultStatus::TimeoutError);
    assert!(!env.server.action_cache.contains(&action_digest));
    assert_eq!(env.client.metrics().timeouts, 1);
}

#[tokio::test]
async fn test_client_side_timeout_cancels_operation() {
    let env = TestEnv::new().unwrap();
    let mut cmd = env.command(&["sleep", "100"]);
    cmd.timeout = Some(Duration::from_millis(50));
    let spec = InputSpec::default();
    let options = ExecutionOptions::default();
    env.set(&cmd, &spec, &options, FakeResult::success(0)).unwrap();
    env.server.exec.set_latency(Duration::from_secs(5));

    let result = env.client.execute(&cmd, &spec, &options).await.unwrap();
    assert_eq!(result.status, ResultStatus::TimeoutError);
    assert!(result.action_result.is_none());

    // The cancel request is sent in the background.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(env.server.exec.cancelled_operations().len(), 1);
}

#[tokio::test]
async fn test_remote_error_carries_status_message() {
    let env = TestEnv::new().unwrap();
    let cmd = env.command(&["make"]);
    let spec = InputSpec::default();
    let options = ExecutionOptions::default();
    env.set(
        &cmd,
        &spec,
        &options,
        FakeResult::new(ResultStatus::RemoteError, 0)
            .remote_status(Status::new(Code::Internal, "worker died")),
    )
    .unwrap();

    let result = env.client.execute(&cmd, &spec, &options).await.unwrap();
    assert_eq!(result.status, ResultStatus::RemoteError);
    assert!(result.error.unwrap().contains("worker died"));
    assert_eq!(env.client.metrics().remote_errors, 1);
}

#[tokio::test]
async fn test_cancel_while_waiting_is_interrupted() {
    let env = TestEnv::new().unwrap();
    let cmd = env.command(&["sleep", "100"]);
    let spec = InputSpec::default();
    let options = ExecutionOptions::default();
    env.set(&cmd, &spec, &options, FakeResult::success(0)).unwrap();
    env.server.exec.set_latency(Duration::from_secs(5));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let result = env
        .client
        .execute_with_cancel(&cmd, &spec, &options, &cancel)
        .await
        .unwrap();
    assert_eq!(result.status, ResultStatus::Interrupted);
    assert_eq!(env.client.metrics().interrupted, 1);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(env.server.exec.cancelled_operations().len(), 1);
}

#[tokio::test]
async fn test_cancel_before_start_is_an_error() {
    let env = TestEnv::new().unwrap();
    env.write_file("a.txt", "a").unwrap();
    let cmd = env.command(&["cat", "a.txt"]);
    let spec = whole_root();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = env
        .client
        .execute_with_cancel(&cmd, &spec, &ExecutionOptions::default(), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, MemoExecError::Cancelled));
    assert_eq!(env.server.exec.execution_count(), 0);
}

#[tokio::test]
async fn test_download_outputs_writes_files() {
    let env = TestEnv::new().unwrap();
    env.write_file("hello.c", "int main;").unwrap();
    let mut cmd = env.command(&["cc", "hello.c", "-o", "out/hello"]);
    cmd.output_files = vec!["out/hello".to_string(), "out/hello.map".to_string()];
    let spec = whole_root();
    let options = ExecutionOptions {
        download_outputs: true,
        ..Default::default()
    };
    env.set(
        &cmd,
        &spec,
        &options,
        FakeResult::success(0)
            .executable_output_file("out/hello", "\x7fELF")
            .output_file("out/hello.map", "symbols"),
    )
    .unwrap();

    let result = env.client.execute(&cmd, &spec, &options).await.unwrap();
    assert_eq!(result.status, ResultStatus::Success);
    let binary = env.exec_root().join("out/hello");
    assert_eq!(std::fs::read(&binary).unwrap(), b"\x7fELF");
    assert_eq!(
        std::fs::read_to_string(env.exec_root().join("out/hello.map")).unwrap(),
        "symbols"
    );

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&binary).unwrap().permissions().mode();
        assert_ne!(mode & 0o111, 0);
    }

    let fetched = env
        .client
        .fetch_output(&result, &OutputRef::File("out/hello.map".into()))
        .await
        .unwrap();
    assert_eq!(fetched, b"symbols");
}

#[tokio::test]
async fn test_outputs_not_downloaded_unless_requested() {
    let env = TestEnv::new().unwrap();
    let mut cmd = env.command(&["touch", "stamp"]);
    cmd.output_files = vec!["stamp".to_string()];
    let spec = InputSpec::default();
    let options = ExecutionOptions::default();
    env.set(&cmd, &spec, &options, FakeResult::success(0).output_file("stamp", ""))
        .unwrap();

    let result = env.client.execute(&cmd, &spec, &options).await.unwrap();
    assert_eq!(result.output_files().len(), 1);
    assert!(!env.exec_root().join("stamp").exists());

    let dest = tempfile::tempdir().unwrap();
    let written = env.client.download_outputs(&result, dest.path()).await.unwrap();
    assert_eq!(written, vec![dest.path().join("stamp")]);
    assert_eq!(std::fs::read(dest.path().join("stamp")).unwrap(), b"");
}

#[tokio::test]
async fn test_missing_input_fails_before_submission() {
    let env = TestEnv::new().unwrap();
    let cmd = env.command(&["cat", "missing.txt"]);
    let spec = InputSpec {
        inputs: vec!["missing.txt".to_string()],
        ..Default::default()
    };

    let err = env
        .client
        .execute(&cmd, &spec, &ExecutionOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, MemoExecError::Filesystem { .. }));
    assert_eq!(err.result_status(), ResultStatus::LocalError);
    assert_eq!(env.server.exec.execution_count(), 0);
    assert_eq!(env.client.metrics().local_errors, 1);
}

#[tokio::test]
async fn test_rejected_input_fails_upload() {
    let env = TestEnv::new().unwrap();
    env.write_file("bad.txt", "refused").unwrap();
    let cmd = env.command(&["cat", "bad.txt"]);
    let spec = whole_root();
    env.server.cas.reject(
        memoexec::Digest::of_bytes(b"refused"),
        Code::PermissionDenied,
    );

    let err = env
        .client
        .execute(&cmd, &spec, &ExecutionOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, MemoExecError::IncompleteUpload { failed: 1, .. }));
    assert_eq!(env.server.exec.execution_count(), 0);
}

#[tokio::test]
async fn test_invalid_working_dir_is_rejected() {
    let env = TestEnv::new().unwrap();
    let mut cmd = env.command(&["ls"]);
    cmd.working_dir = "../outside".to_string();

    let err = env
        .client
        .execute(&cmd, &InputSpec::default(), &ExecutionOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, MemoExecError::Local(_)));
}
