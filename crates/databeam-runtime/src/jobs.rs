//! Controller-tracked jobs.
//!
//! A single background worker drains the job queue and talks to the
//! controller: first submit assigns the id, later updates reference it.
//! Log jobs are one-shot and pooled in a free list so a chatty module does
//! not allocate per message.

use databeam_bus::{Bus, DEFAULT_QUERY_TIMEOUT};
use databeam_core::messages::{JobEnvelope, JobSubmitReply};
use databeam_core::TimeSource;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

const KIND_READY: &str = "ready";
const KIND_LOG: &str = "log";

#[derive(Debug, Clone)]
enum JobData {
    Ready {
        module_name: String,
        ready: bool,
    },
    Log {
        name: String,
        message: String,
        time_str: String,
    },
}

#[derive(Debug)]
struct JobState {
    id: i64,
    done: bool,
    queued: bool,
    data: JobData,
}

pub struct Job {
    kind: &'static str,
    state: Mutex<JobState>,
}

impl Job {
    /// The long-lived readiness toggle of a module.
    pub fn ready(module_name: &str) -> Arc<Job> {
        Arc::new(Job {
            kind: KIND_READY,
            state: Mutex::new(JobState {
                id: -1,
                done: false,
                queued: false,
                data: JobData::Ready {
                    module_name: module_name.to_string(),
                    ready: false,
                },
            }),
        })
    }

    fn log() -> Arc<Job> {
        Arc::new(Job {
            kind: KIND_LOG,
            state: Mutex::new(JobState {
                id: -1,
                done: true,
                queued: false,
                data: JobData::Log {
                    name: String::new(),
                    message: String::new(),
                    time_str: String::new(),
                },
            }),
        })
    }

    pub fn ready_state(&self) -> bool {
        match &self.state.lock().data {
            JobData::Ready { ready, .. } => *ready,
            _ => false,
        }
    }

    pub fn set_ready(&self, ready_value: bool) {
        if let JobData::Ready { ready, .. } = &mut self.state.lock().data {
            *ready = ready_value;
        }
    }

    pub fn set_done(&self, done: bool) {
        self.state.lock().done = done;
    }

    fn envelope(&self) -> JobEnvelope {
        let st = self.state.lock();
        let data = match &st.data {
            JobData::Ready { module_name, ready } => {
                json!({ "module_name": module_name, "ready": ready })
            }
            JobData::Log {
                name,
                message,
                time_str,
            } => json!({ "name": name, "message": message, "time_str": time_str }),
        };
        JobEnvelope {
            id: st.id,
            kind: self.kind.to_string(),
            done: st.done,
            data,
        }
    }
}

pub struct JobManager {
    bus: Arc<dyn Bus>,
    controller: String,
    tx: mpsc::UnboundedSender<Option<Arc<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    free_log_jobs: Mutex<Vec<Arc<Job>>>,
}

impl JobManager {
    pub fn new(bus: Arc<dyn Bus>, db_id: &str) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            bus,
            controller: format!("{db_id}/c"),
            tx,
            worker: Mutex::new(None),
            free_log_jobs: Mutex::new(Vec::new()),
        });
        let handle = tokio::spawn(Self::worker(manager.clone(), rx));
        *manager.worker.lock() = Some(handle);
        manager
    }

    /// Queue a job for (re)transmission. Jobs already in the queue are not
    /// queued twice; the worker picks up their latest state anyway.
    pub fn update(&self, job: &Arc<Job>) {
        let mut st = job.state.lock();
        if !st.queued {
            st.queued = true;
            let _ = self.tx.send(Some(job.clone()));
        }
    }

    /// Send a one-shot log entry to the controller UI, reusing a pooled
    /// job when one is free.
    pub fn log_gui(&self, name: &str, message: &str) {
        let job = self
            .free_log_jobs
            .lock()
            .pop()
            .unwrap_or_else(Job::log);
        {
            let mut st = job.state.lock();
            st.done = true;
            st.data = JobData::Log {
                name: name.to_string(),
                message: message.to_string(),
                time_str: TimeSource::now_time_only_str(),
            };
        }
        self.update(&job);
    }

    async fn worker(manager: Arc<JobManager>, mut rx: mpsc::UnboundedReceiver<Option<Arc<Job>>>) {
        debug!("job worker started");
        while let Some(Some(job)) = rx.recv().await {
            manager.process(job).await;
        }
        debug!("job worker shutdown");
    }

    async fn process(&self, job: Arc<Job>) {
        let (payload, submit, done) = {
            let envelope = job.envelope();
            let st = job.state.lock();
            (
                serde_json::to_string(&envelope).unwrap_or_else(|_| "{}".to_string()),
                st.id == -1,
                st.done,
            )
        };

        let topic = if submit { "job_submit" } else { "job_update" };
        let reply = self
            .bus
            .query(&self.controller, topic, &payload, DEFAULT_QUERY_TIMEOUT)
            .await;

        if submit {
            if reply.is_empty() {
                debug!("job submit: no reply from controller");
            } else {
                match serde_json::from_str::<JobSubmitReply>(&reply) {
                    Ok(assigned) => job.state.lock().id = assigned.id,
                    Err(_) => debug!("job submit: no id in reply"),
                }
            }
        } else if reply.is_empty() {
            debug!("job update: no reply from controller");
        }

        let recycle = {
            let mut st = job.state.lock();
            // a done job is cleared by the controller, forget its id
            if done {
                st.id = -1;
            }
            st.queued = false;
            done && job.kind == KIND_LOG
        };
        if recycle {
            self.free_log_jobs.lock().push(job);
        }
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(None);
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        debug!("job worker joined");
    }

    #[cfg(test)]
    pub(crate) fn free_log_job_count(&self) -> usize {
        self.free_log_jobs.lock().len()
    }
}
