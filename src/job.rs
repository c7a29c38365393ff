//! Cooperative background jobs.
//!
//! Jobs are CPU-bound work items sliced between event-loop iterations. The
//! loop calls [`JobQueue::tick`] once per iteration; only the head job runs,
//! for at most the configured tick budget, and nothing preempts it. A job
//! that never reports `finished` therefore blocks every job behind it until
//! it is removed.

use std::collections::VecDeque;
use std::fmt;
use std::time::SystemTime;

/// Progress reported by one [`Job::run`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JobProgress {
    /// Ticks of work performed (informational).
    pub consumed: u32,
    /// The job is complete and can be destroyed.
    pub finished: bool,
}

impl JobProgress {
    /// More work remains.
    pub fn pending(consumed: u32) -> Self {
        Self {
            consumed,
            finished: false,
        }
    }

    /// The job is done.
    pub fn done(consumed: u32) -> Self {
        Self {
            consumed,
            finished: true,
        }
    }
}

/// A unit of background work.
pub trait Job {
    /// Perform up to `budget` ticks of work.
    fn run(&mut self, budget: u32) -> JobProgress;

    /// Human-readable progress, shown in job listings.
    fn status(&self) -> String;

    /// Release external resources. Called exactly once, when the job
    /// finishes or is removed, before it is dropped.
    fn destroy(&mut self) {}
}

/// Identifies a queued job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(u32);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job#{}", self.0)
    }
}

/// Scheduling metadata supplied when a job is queued.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct JobSpec {
    /// Higher runs first.
    pub priority: i32,
    /// Owning contest (0 = none).
    pub contest_id: i32,
    /// Title shown in listings.
    pub title: String,
}

/// A snapshot of a queued job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobInfo {
    /// Job id.
    pub id: JobId,
    /// Priority.
    pub priority: i32,
    /// Owning contest.
    pub contest_id: i32,
    /// When the job was queued.
    pub start_time: SystemTime,
    /// Title.
    pub title: String,
    /// Ticks consumed so far.
    pub ticks: u64,
    /// [`Job::status`] at the time of the snapshot.
    pub status: String,
}

struct Entry {
    id: JobId,
    priority: i32,
    contest_id: i32,
    start_time: SystemTime,
    title: String,
    ticks: u64,
    job: Box<dyn Job>,
}

impl Entry {
    fn info(&self) -> JobInfo {
        JobInfo {
            id: self.id,
            priority: self.priority,
            contest_id: self.contest_id,
            start_time: self.start_time,
            title: self.title.clone(),
            ticks: self.ticks,
            status: self.job.status(),
        }
    }

    fn destroy(mut self) {
        self.job.destroy();
    }
}

/// Jobs in run order: descending priority, FIFO within a priority.
pub struct JobQueue {
    entries: VecDeque<Entry>,
    next_id: u32,
}

impl fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobQueue")
            .field("len", &self.entries.len())
            .field("next_id", &self.next_id)
            .finish()
    }
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue {
    /// Empty queue.
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            next_id: 1,
        }
    }

    /// Queue `job` behind every job of equal or higher priority.
    pub fn add(&mut self, spec: JobSpec, job: Box<dyn Job>) -> JobId {
        let id = JobId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1).max(1);
        let pos = self
            .entries
            .iter()
            .position(|e| e.priority < spec.priority)
            .unwrap_or(self.entries.len());
        log::debug!(
            "[jobs] queued {} \"{}\" priority {} at position {}",
            id,
            spec.title,
            spec.priority,
            pos
        );
        self.entries.insert(
            pos,
            Entry {
                id,
                priority: spec.priority,
                contest_id: spec.contest_id,
                start_time: SystemTime::now(),
                title: spec.title,
                ticks: 0,
                job,
            },
        );
        id
    }

    /// Remove and destroy a job. Unknown ids are ignored.
    pub fn remove(&mut self, id: JobId) -> bool {
        let Some(pos) = self.entries.iter().position(|e| e.id == id) else {
            return false;
        };
        if let Some(entry) = self.entries.remove(pos) {
            log::debug!("[jobs] removed {} \"{}\"", entry.id, entry.title);
            entry.destroy();
        }
        true
    }

    /// Remove and destroy every job owned by `contest_id`. Returns how many
    /// were removed.
    pub fn cancel_contest(&mut self, contest_id: i32) -> usize {
        let before = self.entries.len();
        let (cancelled, kept): (VecDeque<_>, VecDeque<_>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|e| e.contest_id == contest_id);
        self.entries = kept;
        for entry in cancelled {
            log::debug!("[jobs] cancelled {} for contest {}", entry.id, contest_id);
            entry.destroy();
        }
        before - self.entries.len()
    }

    /// The job that runs next.
    pub fn first(&self) -> Option<JobInfo> {
        self.entries.front().map(Entry::info)
    }

    /// Number of queued jobs.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Snapshots of every job, in run order.
    pub fn iter(&self) -> impl Iterator<Item = JobInfo> + '_ {
        self.entries.iter().map(Entry::info)
    }

    /// Give the head job one slice of `budget` ticks. A finished job is
    /// destroyed and removed. Returns `false` when the queue was empty.
    pub fn tick(&mut self, budget: u32) -> bool {
        let Some(head) = self.entries.front_mut() else {
            return false;
        };
        let progress = head.job.run(budget);
        head.ticks += u64::from(progress.consumed);
        if progress.finished {
            if let Some(entry) = self.entries.pop_front() {
                log::debug!(
                    "[jobs] {} \"{}\" finished after {} ticks",
                    entry.id,
                    entry.title,
                    entry.ticks
                );
                entry.destroy();
            }
        }
        true
    }
}

impl Drop for JobQueue {
    fn drop(&mut self) {
        for entry in self.entries.drain(..) {
            entry.destroy();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct Log {
        runs: Vec<&'static str>,
        destroyed: Vec<&'static str>,
    }

    struct Counted {
        name: &'static str,
        remaining: u32,
        log: Rc<RefCell<Log>>,
    }

    impl Job for Counted {
        fn run(&mut self, budget: u32) -> JobProgress {
            self.log.borrow_mut().runs.push(self.name);
            let step = budget.min(self.remaining);
            self.remaining -= step;
            JobProgress {
                consumed: step,
                finished: self.remaining == 0,
            }
        }

        fn status(&self) -> String {
            format!("{} left", self.remaining)
        }

        fn destroy(&mut self) {
            self.log.borrow_mut().destroyed.push(self.name);
        }
    }

    fn job(name: &'static str, remaining: u32, log: &Rc<RefCell<Log>>) -> Box<dyn Job> {
        Box::new(Counted {
            name,
            remaining,
            log: Rc::clone(log),
        })
    }

    fn spec(priority: i32, contest_id: i32) -> JobSpec {
        JobSpec {
            priority,
            contest_id,
            title: String::new(),
        }
    }

    #[test]
    fn priority_then_fifo_order() {
        let log = Rc::new(RefCell::new(Log::default()));
        let mut q = JobQueue::new();
        let a = q.add(spec(0, 0), job("a", 1, &log));
        let b = q.add(spec(5, 0), job("b", 1, &log));
        let c = q.add(spec(0, 0), job("c", 1, &log));
        let d = q.add(spec(5, 0), job("d", 1, &log));
        let order: Vec<_> = q.iter().map(|i| i.id).collect();
        assert_eq!(order, vec![b, d, a, c]);
    }

    #[test]
    fn unfinished_head_blocks_the_rest() {
        let log = Rc::new(RefCell::new(Log::default()));
        let mut q = JobQueue::new();
        let first = q.add(spec(0, 0), job("first", u32::MAX, &log));
        q.add(spec(0, 0), job("second", 1, &log));
        for _ in 0..10 {
            q.tick(100);
        }
        assert!(log.borrow().runs.iter().all(|n| *n == "first"));

        assert!(q.remove(first));
        q.tick(100);
        assert_eq!(log.borrow().runs.last(), Some(&"second"));
        assert!(q.is_empty());
    }

    #[test]
    fn finished_job_destroyed_once() {
        let log = Rc::new(RefCell::new(Log::default()));
        let mut q = JobQueue::new();
        q.add(spec(0, 0), job("x", 150, &log));
        q.tick(100);
        assert_eq!(q.first().unwrap().ticks, 100);
        assert_eq!(q.first().unwrap().status, "50 left");
        q.tick(100);
        assert!(q.is_empty());
        assert_eq!(log.borrow().destroyed, vec!["x"]);
    }

    #[test]
    fn removed_job_never_runs_again() {
        let log = Rc::new(RefCell::new(Log::default()));
        let mut q = JobQueue::new();
        let id = q.add(spec(0, 0), job("x", 1000, &log));
        q.tick(1);
        assert!(q.remove(id));
        assert!(!q.remove(id));
        q.tick(1);
        assert_eq!(log.borrow().runs, vec!["x"]);
        assert_eq!(log.borrow().destroyed, vec!["x"]);
    }

    #[test]
    fn cancel_contest_destroys_without_running() {
        let log = Rc::new(RefCell::new(Log::default()));
        let mut q = JobQueue::new();
        q.add(spec(0, 7), job("a", 5, &log));
        q.add(spec(0, 8), job("b", 5, &log));
        q.add(spec(0, 7), job("c", 5, &log));
        assert_eq!(q.cancel_contest(7), 2);
        assert_eq!(q.len(), 1);
        assert!(log.borrow().runs.is_empty());
        assert_eq!(log.borrow().destroyed, vec!["a", "c"]);
    }

    #[test]
    fn dropping_queue_destroys_pending_jobs() {
        let log = Rc::new(RefCell::new(Log::default()));
        {
            let mut q = JobQueue::new();
            q.add(spec(0, 0), job("a", 5, &log));
        }
        assert_eq!(log.borrow().destroyed, vec!["a"]);
    }

    #[test]
    fn tick_on_empty_queue() {
        assert!(!JobQueue::new().tick(10));
    }
}
