#![cfg(unix)]

use child_pool::{CommandSpawner, Pool, PoolError, PoolOptions, Scheduler};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, timeout};

// A tiny worker: prints a banner, reads the module spec, then echoes every
// task back as `data`. A few payloads trigger failure modes.
const ECHO_WORKER: &str = r#"
echo "booting"
read spec
while read line; do
  case "$line" in
    '"crash"') kill -s SEGV $$ ;;
    '"fatal"') echo '{"err":"fatal requested","fatal":true}' ;;
    '"fail"') echo '{"err":"task failed","stack":"echo.sh:1"}' ;;
    '"tag"') echo "{\"data\": \"$CHILD_POOL_WORKER_TAG\"}" ;;
    '"spec"') echo "{\"data\": $spec}" ;;
    *) echo "{\"data\": $line}" ;;
  esac
done
"#;

fn setup_tracing_for_test() {
  use std::sync::Once;
  use tracing_subscriber::{fmt, EnvFilter};
  static TRACING_INIT: Once = Once::new();

  TRACING_INIT.call_once(|| {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,child_pool=debug"));
    fmt::Subscriber::builder()
      .with_env_filter(filter)
      .with_test_writer()
      .try_init()
      .ok();
  });
}

fn echo_pool(options: PoolOptions) -> Arc<Pool> {
  Pool::new(
    Arc::new(Scheduler::new(4)),
    Arc::new(CommandSpawner::new("/bin/sh").args(["-c", ECHO_WORKER])),
    json!("echo-module"),
    options,
    tokio::runtime::Handle::current(),
  )
}

async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
  for _ in 0..400 {
    if condition() {
      return;
    }
    sleep(Duration::from_millis(5)).await;
  }
  panic!("Timed out waiting for: {}", what);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_real_worker_round_trip() {
  setup_tracing_for_test();
  let pool = echo_pool(PoolOptions::default().workers(1));

  let first = pool.submit(json!(5));
  let second = pool.submit(json!({"a": [1, 2]}));
  let spec = pool.submit(json!("spec"));

  assert_eq!(timeout(Duration::from_secs(5), first.await_result()).await.unwrap(), Ok(json!(5)));
  assert_eq!(
    timeout(Duration::from_secs(5), second.await_result()).await.unwrap(),
    Ok(json!({"a": [1, 2]}))
  );
  assert_eq!(
    timeout(Duration::from_secs(5), spec.await_result()).await.unwrap(),
    Ok(json!("echo-module"))
  );
  assert_eq!(pool.worker_count(), 1);
  assert_eq!(pool.scheduler().active_task_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_real_worker_task_error() {
  setup_tracing_for_test();
  let pool = echo_pool(PoolOptions::default().workers(1));

  let result = timeout(Duration::from_secs(5), pool.submit(json!("fail")).await_result())
    .await
    .unwrap();
  assert_eq!(
    result,
    Err(PoolError::TaskFailed {
      message: "task failed".to_string(),
      stack: Some("echo.sh:1".to_string()),
      fatal: false,
    })
  );
  assert_eq!(pool.worker_count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_real_worker_crash_is_reported_and_evicted() {
  setup_tracing_for_test();
  let pool = echo_pool(PoolOptions::default().workers(1));

  let result = timeout(Duration::from_secs(5), pool.submit(json!("crash")).await_result())
    .await
    .unwrap();
  let error = result.unwrap_err();
  assert_eq!(error.to_string(), "Worker exited unexpectedly, signal SIGSEGV");
  wait_until("worker evicted", || pool.worker_count() == 0).await;
  assert_eq!(pool.scheduler().active_task_count(), 0);

  let result = timeout(Duration::from_secs(5), pool.submit(json!(7)).await_result())
    .await
    .unwrap();
  assert_eq!(result, Ok(json!(7)));
  assert_eq!(pool.workers_created(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_real_worker_fatal_reply_kills_process() {
  setup_tracing_for_test();
  let pool = echo_pool(PoolOptions::default().workers(1));

  let result = timeout(Duration::from_secs(5), pool.submit(json!("fatal")).await_result())
    .await
    .unwrap();
  assert!(result.unwrap_err().is_fatal());
  assert_eq!(pool.worker_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_real_worker_stdout_and_tag() {
  setup_tracing_for_test();
  let lines = Arc::new(Mutex::new(Vec::<String>::new()));
  let sink = lines.clone();
  let pool = echo_pool(
    PoolOptions::default()
      .workers(1)
      .log_id("it")
      .stdout(move |line| sink.lock().unwrap().push(line.to_string())),
  );

  let result = timeout(Duration::from_secs(5), pool.submit(json!("tag")).await_result())
    .await
    .unwrap();
  assert_eq!(result, Ok(json!("it.1")));
  assert_eq!(*lines.lock().unwrap(), vec!["booting".to_string()]);
}

#[tokio::test]
async fn test_missing_program_fails_the_task() {
  setup_tracing_for_test();
  let pool = Pool::new(
    Arc::new(Scheduler::new(2)),
    Arc::new(CommandSpawner::new("/nonexistent/child-pool-worker")),
    json!("missing"),
    PoolOptions::default().workers(1),
    tokio::runtime::Handle::current(),
  );

  let result = timeout(Duration::from_secs(5), pool.submit(json!(1)).await_result())
    .await
    .unwrap();
  assert!(matches!(result, Err(PoolError::Spawn(_))), "got {:?}", result);
  assert_eq!(pool.worker_count(), 0);
  assert_eq!(pool.scheduler().active_task_count(), 0);
}
