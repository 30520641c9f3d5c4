//! Task lifecycle state, progress, and resource metadata

use std::collections::VecDeque;
use std::time::{Duration, Instant, SystemTime};

use serde::{Deserialize, Serialize};

/// Lifecycle phase of a download task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    /// Record exists but the task has never run
    Created,
    /// A worker is driving the transfer
    Running,
    /// Transfer suspended; byte offset preserved for resume
    Paused,
    /// Transfer completed successfully (terminal)
    Finished,
    /// Transfer failed after bounded retries (terminal)
    Errored,
    /// Halted by request (terminal)
    Halted,
}

impl TaskState {
    /// Terminal states can only be reactivated by reconstituting a
    /// brand-new task from the stored record.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Finished | TaskState::Errored | TaskState::Halted
        )
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// States from which `start` transitions to Running.
    pub fn can_start(&self) -> bool {
        matches!(
            self,
            TaskState::Created | TaskState::Paused | TaskState::Errored
        )
    }

    pub fn can_pause(&self) -> bool {
        matches!(self, TaskState::Running)
    }
}

/// Serialize `SystemTime` as Unix milliseconds
pub(crate) mod time_millis {
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(t: &SystemTime, s: S) -> Result<S::Ok, S::Error> {
        let millis = t
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        s.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<SystemTime, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(UNIX_EPOCH + Duration::from_millis(millis))
    }
}

/// Serialize `Option<SystemTime>` as Unix milliseconds
pub(crate) mod opt_time_millis {
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(t: &Option<SystemTime>, s: S) -> Result<S::Ok, S::Error> {
        match t {
            Some(t) => {
                let millis = t
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or(0);
                s.serialize_some(&millis)
            }
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> Result<Option<SystemTime>, D::Error> {
        let opt: Option<u64> = Option::deserialize(d)?;
        Ok(opt.map(|millis| UNIX_EPOCH + Duration::from_millis(millis)))
    }
}

/// Mutable metadata about the remote resource, populated once the engine
/// has probed it. Mirrored into the persistence store while the task runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInfo {
    /// Source URL
    pub url: String,
    /// Resource title, if known
    pub title: Option<String>,
    /// Content type reported by the remote server
    pub content_type: Option<String>,
    /// Total size in bytes, if known
    pub total_bytes: Option<u64>,
    /// Destination file name
    pub file_name: Option<String>,
}

impl TaskInfo {
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        let file_name = file_name_from_url(&url);
        Self {
            url,
            title: None,
            content_type: None,
            total_bytes: None,
            file_name,
        }
    }
}

/// Best-effort file name from the last URL path segment.
fn file_name_from_url(url: &str) -> Option<String> {
    let trimmed = url.split(['?', '#']).next().unwrap_or(url);
    let segment = trimmed.trim_end_matches('/').rsplit('/').next()?;
    if segment.is_empty() || segment.contains(':') {
        return None;
    }
    Some(segment.to_string())
}

/// Lifecycle phase and transfer progress of a task.
///
/// Updated only by the task that owns the identifier while active; readable
/// by anyone through the persistence store when inactive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatus {
    pub state: TaskState,

    /// Bytes transferred so far; doubles as the resume offset when paused
    pub downloaded_bytes: u64,

    /// Total size in bytes (None if unknown)
    pub total_bytes: Option<u64>,

    /// Smoothed transfer speed in bytes per second
    pub speed_bytes_per_sec: Option<u64>,

    /// Error detail when state is Errored
    pub error: Option<String>,

    #[serde(with = "time_millis")]
    pub created_at: SystemTime,

    #[serde(with = "opt_time_millis", default)]
    pub started_at: Option<SystemTime>,

    #[serde(with = "opt_time_millis", default)]
    pub paused_at: Option<SystemTime>,

    #[serde(with = "opt_time_millis", default)]
    pub finished_at: Option<SystemTime>,
}

impl TaskStatus {
    pub fn new() -> Self {
        Self {
            state: TaskState::Created,
            downloaded_bytes: 0,
            total_bytes: None,
            speed_bytes_per_sec: None,
            error: None,
            created_at: SystemTime::now(),
            started_at: None,
            paused_at: None,
            finished_at: None,
        }
    }

    pub fn mark_started(&mut self) {
        self.state = TaskState::Running;
        self.started_at = Some(SystemTime::now());
        self.paused_at = None;
        self.error = None;
    }

    pub fn mark_paused(&mut self) {
        self.state = TaskState::Paused;
        self.paused_at = Some(SystemTime::now());
        self.speed_bytes_per_sec = None;
    }

    pub fn mark_finished(&mut self) {
        self.state = TaskState::Finished;
        self.finished_at = Some(SystemTime::now());
        self.speed_bytes_per_sec = None;
        if self.total_bytes.is_none() {
            self.total_bytes = Some(self.downloaded_bytes);
        }
    }

    pub fn mark_errored(&mut self, error: impl Into<String>) {
        self.state = TaskState::Errored;
        self.error = Some(error.into());
        self.finished_at = Some(SystemTime::now());
        self.speed_bytes_per_sec = None;
    }

    pub fn mark_halted(&mut self) {
        self.state = TaskState::Halted;
        self.finished_at = Some(SystemTime::now());
        self.speed_bytes_per_sec = None;
    }

    /// Make a stored terminal status startable again, preserving progress.
    /// Used when a caller explicitly bypasses a terminal record.
    pub fn revive(&mut self) {
        self.state = if self.downloaded_bytes > 0 {
            TaskState::Paused
        } else {
            TaskState::Created
        };
        self.error = None;
        self.finished_at = None;
    }

    pub fn update_progress(
        &mut self,
        downloaded_bytes: u64,
        total_bytes: Option<u64>,
        speed_bytes_per_sec: Option<u64>,
    ) {
        self.downloaded_bytes = downloaded_bytes;
        if total_bytes.is_some() {
            self.total_bytes = total_bytes;
        }
        self.speed_bytes_per_sec = speed_bytes_per_sec;
    }

    /// Byte offset to resume from on the next start.
    pub fn resume_offset(&self) -> u64 {
        self.downloaded_bytes
    }
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// Sliding-window transfer speed estimator.
///
/// Averages over a short window so the reported speed does not jump around
/// with individual chunk timings.
#[derive(Debug)]
pub struct SpeedCalculator {
    samples: VecDeque<(Instant, u64)>,
    window: Duration,
    max_samples: usize,
}

impl SpeedCalculator {
    pub fn new(window: Duration) -> Self {
        Self {
            samples: VecDeque::with_capacity(64),
            window,
            max_samples: 64,
        }
    }

    /// 5-second window default
    pub fn default_window() -> Self {
        Self::new(Duration::from_secs(5))
    }

    pub fn record(&mut self, downloaded_bytes: u64) {
        let now = Instant::now();
        while let Some((t, _)) = self.samples.front() {
            if now.duration_since(*t) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
        self.samples.push_back((now, downloaded_bytes));
        while self.samples.len() > self.max_samples {
            self.samples.pop_front();
        }
    }

    pub fn speed_bytes_per_sec(&self) -> Option<u64> {
        if self.samples.len() < 2 {
            return None;
        }
        let (first_t, first_b) = self.samples.front()?;
        let (last_t, last_b) = self.samples.back()?;
        let secs = last_t.duration_since(*first_t).as_secs_f64().max(0.001);
        Some((last_b.saturating_sub(*first_b) as f64 / secs) as u64)
    }
}
