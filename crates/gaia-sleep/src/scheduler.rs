//! Priority-based scheduler for sleep-time maintenance tasks.
//!
//! Registered tasks run one at a time in priority order (lowest number
//! first), with least-recently-run selection among equals; tasks that
//! have never run are always preferred. Handler failures are contained
//! here: they are logged and stored on the task, never propagated.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gaia_observe::SharedMetrics;
use gaia_timeline::{TimelineStore, event};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

/// A sleep task's work. Implementations honor cancellation themselves;
/// the loop treats execution as synchronous.
#[async_trait]
pub trait SleepTaskHandler: Send + Sync {
    async fn run(&self) -> Result<()>;
}

/// A registered sleep-time task.
pub struct SleepTask {
    pub task_id: String,
    pub task_type: String,
    /// 1 = highest.
    pub priority: u8,
    pub interruptible: bool,
    pub estimated_duration_secs: u64,
    pub handler: Arc<dyn SleepTaskHandler>,
    pub last_run: Option<DateTime<Utc>>,
    pub run_count: u32,
    pub last_error: Option<String>,
}

impl SleepTask {
    pub fn new(
        task_id: &str,
        task_type: &str,
        priority: u8,
        interruptible: bool,
        estimated_duration_secs: u64,
        handler: Arc<dyn SleepTaskHandler>,
    ) -> Self {
        Self {
            task_id: task_id.to_string(),
            task_type: task_type.to_string(),
            priority,
            interruptible,
            estimated_duration_secs,
            handler,
            last_run: None,
            run_count: 0,
            last_error: None,
        }
    }
}

/// Selection result handed to the loop: enough to register the current
/// task with the sleep/wake manager and call back for execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NextTask {
    pub task_id: String,
    pub task_type: String,
    pub interruptible: bool,
}

/// Status view of one registered task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatusView {
    pub task_id: String,
    pub task_type: String,
    pub priority: u8,
    pub interruptible: bool,
    pub run_count: u32,
    pub last_run: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

pub struct SleepTaskScheduler {
    tasks: Vec<SleepTask>,
    timeline: Arc<TimelineStore>,
    metrics: SharedMetrics,
}

impl SleepTaskScheduler {
    pub fn new(timeline: Arc<TimelineStore>, metrics: SharedMetrics) -> Self {
        Self {
            tasks: Vec::new(),
            timeline,
            metrics,
        }
    }

    pub fn register_task(&mut self, task: SleepTask) {
        info!(task_id = %task.task_id, priority = task.priority, "registered sleep task");
        self.tasks.push(task);
    }

    /// Register the built-in maintenance tasks with the handlers the
    /// embedding service provides.
    pub fn register_defaults(
        &mut self,
        conversation_curation: Arc<dyn SleepTaskHandler>,
        thought_seed_review: Arc<dyn SleepTaskHandler>,
        initiative_cycle: Arc<dyn SleepTaskHandler>,
    ) {
        self.register_task(SleepTask::new(
            "conversation_curation",
            "conversation_curation",
            1,
            true,
            60,
            conversation_curation,
        ));
        self.register_task(SleepTask::new(
            "thought_seed_review",
            "thought_seed_review",
            1,
            true,
            120,
            thought_seed_review,
        ));
        self.register_task(SleepTask::new(
            "initiative_cycle",
            "initiative_cycle",
            2,
            true,
            180,
            initiative_cycle,
        ));
    }

    /// The highest-priority, least-recently-run task; never-run tasks
    /// sort before any task that has run.
    pub fn get_next_task(&self) -> Option<NextTask> {
        self.tasks
            .iter()
            .min_by_key(|t| (t.priority, t.last_run.unwrap_or(DateTime::<Utc>::MIN_UTC)))
            .map(|t| NextTask {
                task_id: t.task_id.clone(),
                task_type: t.task_type.clone(),
                interruptible: t.interruptible,
            })
    }

    /// Execute a task by id. Returns true on success. A failing handler
    /// never kills the scheduler; its message lands in `last_error`.
    pub async fn execute_task(&mut self, task_id: &str) -> bool {
        let Some(index) = self.tasks.iter().position(|t| t.task_id == task_id) else {
            error!(task_id, "execute_task: unknown task");
            return false;
        };

        info!(task_id, "starting sleep task");
        self.timeline.append(
            event::TASK_EXEC,
            json!({"task_id": task_id, "status": "started"}),
        );
        self.metrics.sleep_tasks_total.inc();

        let handler = self.tasks[index].handler.clone();
        let start = Instant::now();
        let result = handler.run().await;
        let elapsed = start.elapsed().as_secs_f64();

        let task = &mut self.tasks[index];
        task.last_run = Some(Utc::now());
        match result {
            Ok(()) => {
                task.run_count += 1;
                task.last_error = None;
                info!(
                    task_id,
                    elapsed_s = elapsed,
                    run_count = task.run_count,
                    "completed sleep task"
                );
                self.timeline.append(
                    event::TASK_EXEC,
                    json!({"task_id": task_id, "status": "completed", "elapsed_s": elapsed}),
                );
                true
            }
            Err(e) => {
                task.last_error = Some(e.to_string());
                self.metrics.sleep_task_errors.inc();
                error!(
                    task_id,
                    elapsed_s = elapsed,
                    error = %e,
                    "sleep task failed"
                );
                self.timeline.append(
                    event::TASK_EXEC,
                    json!({"task_id": task_id, "status": "failed", "error": e.to_string()}),
                );
                false
            }
        }
    }

    pub fn get_status(&self) -> Vec<TaskStatusView> {
        self.tasks
            .iter()
            .map(|t| TaskStatusView {
                task_id: t.task_id.clone(),
                task_type: t.task_type.clone(),
                priority: t.priority,
                interruptible: t.interruptible,
                run_count: t.run_count,
                last_run: t.last_run,
                last_error: t.last_error.clone(),
            })
            .collect()
    }
}
