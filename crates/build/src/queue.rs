//! Lane-based execution queue for command bodies.
//!
//! A fixed pool of worker threads (lanes) drains a shared FIFO of jobs.
//! With one lane the queue degenerates to strictly serial execution, which
//! `--serial` relies on. Cancellation is cooperative: jobs still dequeue
//! after `cancel()`, but are expected to observe the flag and bail out.

use std::collections::VecDeque;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use tracing::{debug, error};

/// Context handed to a running job.
pub struct QueueJobContext<'a> {
  lane: usize,
  cancelled: &'a AtomicBool,
}

impl QueueJobContext<'_> {
  pub fn lane(&self) -> usize {
    self.lane
  }

  pub fn is_cancelled(&self) -> bool {
    self.cancelled.load(Ordering::Relaxed)
  }

  /// Run `argv` to completion; true iff it exited successfully. The child
  /// gets a null stdin and inherits stdout/stderr.
  pub fn execute_process(&self, argv: &[String]) -> bool {
    let Some((program, args)) = argv.split_first() else {
      error!("refusing to execute empty command line");
      return false;
    };
    match Command::new(program).args(args).stdin(Stdio::null()).status() {
      Ok(status) => status.success(),
      Err(err) => {
        error!(command = %program, %err, "unable to spawn process");
        false
      }
    }
  }

  /// Run a command line through `/bin/sh -c`.
  pub fn execute_shell_command(&self, command: &str) -> bool {
    self.execute_process(&[
      "/bin/sh".to_string(),
      "-c".to_string(),
      command.to_string(),
    ])
  }
}

/// A unit of work: an owner label (for logging) and the closure to run.
pub struct QueueJob {
  owner: String,
  work: Box<dyn FnOnce(&QueueJobContext<'_>) + Send>,
}

impl QueueJob {
  pub fn new(owner: impl Into<String>, work: impl FnOnce(&QueueJobContext<'_>) + Send + 'static) -> QueueJob {
    QueueJob {
      owner: owner.into(),
      work: Box::new(work),
    }
  }
}

#[derive(Default)]
struct QueueInner {
  jobs: VecDeque<QueueJob>,
  active: usize,
  shutting_down: bool,
}

struct QueueState {
  inner: Mutex<QueueInner>,
  work_available: Condvar,
  all_idle: Condvar,
}

/// The shared FIFO plus its worker lanes.
pub struct ExecutionQueue {
  state: Arc<QueueState>,
  cancelled: Arc<AtomicBool>,
  lanes: Vec<JoinHandle<()>>,
}

impl ExecutionQueue {
  pub fn new(lane_count: usize) -> ExecutionQueue {
    Self::with_cancel_flag(lane_count, Arc::new(AtomicBool::new(false)))
  }

  /// Build a queue whose jobs observe an externally owned cancellation flag.
  pub fn with_cancel_flag(lane_count: usize, cancelled: Arc<AtomicBool>) -> ExecutionQueue {
    assert!(lane_count >= 1, "the queue needs at least one lane");
    let state = Arc::new(QueueState {
      inner: Mutex::new(QueueInner::default()),
      work_available: Condvar::new(),
      all_idle: Condvar::new(),
    });

    let lanes = (0..lane_count)
      .map(|lane| {
        let state = state.clone();
        let cancelled = cancelled.clone();
        thread::spawn(move || run_lane(lane, &state, &cancelled))
      })
      .collect();

    ExecutionQueue {
      state,
      cancelled,
      lanes,
    }
  }

  pub fn lane_count(&self) -> usize {
    self.lanes.len()
  }

  /// Enqueue a job; returns immediately. Jobs run exactly once, in FIFO
  /// dequeue order.
  pub fn add_job(&self, job: QueueJob) {
    let mut inner = self.state.inner.lock().unwrap();
    debug_assert!(!inner.shutting_down, "job added to a queue being dropped");
    inner.jobs.push_back(job);
    self.state.work_available.notify_one();
  }

  /// Cooperatively cancel: jobs still run but should exit early.
  pub fn cancel(&self) {
    self.cancelled.store(true, Ordering::Relaxed);
  }

  /// Block until the FIFO is empty and no lane is running a job.
  pub fn wait_idle(&self) {
    let mut inner = self.state.inner.lock().unwrap();
    while !inner.jobs.is_empty() || inner.active > 0 {
      inner = self.state.all_idle.wait(inner).unwrap();
    }
  }
}

impl Drop for ExecutionQueue {
  fn drop(&mut self) {
    {
      let mut inner = self.state.inner.lock().unwrap();
      inner.shutting_down = true;
    }
    self.state.work_available.notify_all();
    for lane in self.lanes.drain(..) {
      let _ = lane.join();
    }
  }
}

fn run_lane(lane: usize, state: &QueueState, cancelled: &AtomicBool) {
  loop {
    let job = {
      let mut inner = state.inner.lock().unwrap();
      loop {
        if let Some(job) = inner.jobs.pop_front() {
          inner.active += 1;
          break job;
        }
        if inner.shutting_down {
          return;
        }
        inner = state.work_available.wait(inner).unwrap();
      }
    };

    debug!(lane, owner = %job.owner, "running job");
    (job.work)(&QueueJobContext { lane, cancelled });

    let mut inner = state.inner.lock().unwrap();
    inner.active -= 1;
    if inner.jobs.is_empty() && inner.active == 0 {
      state.all_idle.notify_all();
    }
  }
}

/// The default lane count: a couple more lanes than cores (commands block on
/// I/O), capped by the configured maximum.
pub fn default_lane_count(configured_max: usize) -> usize {
  let cores = thread::available_parallelism().map(|p| p.get()).unwrap_or(4);
  (cores + 2).min(configured_max).max(1)
}

#[cfg(test)]
mod tests {
  use std::sync::mpsc;
  use std::sync::Mutex as StdMutex;

  use super::*;

  #[test]
  fn serial_queue_preserves_fifo_order() {
    let order = Arc::new(StdMutex::new(Vec::new()));
    let queue = ExecutionQueue::new(1);
    for i in 0..16 {
      let order = order.clone();
      queue.add_job(QueueJob::new(format!("job-{i}"), move |_| {
        order.lock().unwrap().push(i);
      }));
    }
    queue.wait_idle();
    assert_eq!(*order.lock().unwrap(), (0..16).collect::<Vec<_>>());
  }

  #[test]
  fn parallel_lanes_drain_every_job_exactly_once() {
    let (tx, rx) = mpsc::channel();
    let queue = ExecutionQueue::new(4);
    for i in 0..64 {
      let tx = tx.clone();
      queue.add_job(QueueJob::new("count", move |_| {
        tx.send(i).unwrap();
      }));
    }
    queue.wait_idle();
    drop(tx);
    let mut seen: Vec<i32> = rx.iter().collect();
    seen.sort_unstable();
    assert_eq!(seen, (0..64).collect::<Vec<_>>());
  }

  #[test]
  fn jobs_observe_cancellation() {
    let queue = ExecutionQueue::new(2);
    queue.cancel();
    let (tx, rx) = mpsc::channel();
    queue.add_job(QueueJob::new("cancelled", move |ctx| {
      tx.send(ctx.is_cancelled()).unwrap();
    }));
    queue.wait_idle();
    assert_eq!(rx.recv().unwrap(), true);
  }

  #[test]
  fn lane_ids_stay_in_range() {
    let queue = ExecutionQueue::new(3);
    let (tx, rx) = mpsc::channel();
    for _ in 0..12 {
      let tx = tx.clone();
      queue.add_job(QueueJob::new("lane", move |ctx| {
        tx.send(ctx.lane()).unwrap();
      }));
    }
    queue.wait_idle();
    drop(tx);
    assert!(rx.iter().all(|lane| lane < 3));
  }

  #[test]
  fn shell_commands_report_exit_status() {
    let queue = ExecutionQueue::new(1);
    let (tx, rx) = mpsc::channel();
    queue.add_job(QueueJob::new("sh", move |ctx| {
      tx.send((
        ctx.execute_shell_command("true"),
        ctx.execute_shell_command("exit 3"),
      ))
      .unwrap();
    }));
    queue.wait_idle();
    assert_eq!(rx.recv().unwrap(), (true, false));
  }

  #[test]
  fn default_lane_count_respects_the_cap() {
    assert_eq!(default_lane_count(1), 1);
    assert!(default_lane_count(usize::MAX) >= 3);
  }
}
