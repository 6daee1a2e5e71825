//! Canonical Redis keys and pub/sub channels for a queue.
//!
//! Every key is `bull:<queue>:<kind>` and every channel is derived from the same
//! string. The literal `bull:` prefix is part of the wire contract with peer
//! implementations of the protocol, so none of these strings are configurable.

/// Key and channel namer for a single queue.
#[derive(Debug, Clone)]
pub struct Keys {
    name: String,
    prefix: String,
}

impl Keys {
    pub fn new(queue_name: impl Into<String>) -> Self {
        let name = queue_name.into();
        let prefix = format!("bull:{}", name);
        Self { name, prefix }
    }

    /// Name of the queue this namer belongs to.
    pub fn queue_name(&self) -> &str {
        &self.name
    }

    /// Counter used to allocate monotonically increasing job ids.
    pub fn id(&self) -> String {
        self.kind("id")
    }

    /// List of ready-to-run job ids.
    pub fn wait(&self) -> String {
        self.kind("wait")
    }

    /// List of job ids currently owned by some worker.
    pub fn active(&self) -> String {
        self.kind("active")
    }

    /// List holding the contents of `wait` while the queue is paused.
    pub fn paused(&self) -> String {
        self.kind("paused")
    }

    /// Sorted set of delayed job ids, scored by earliest-run-at (unix ms).
    pub fn delayed(&self) -> String {
        self.kind("delayed")
    }

    /// Set of job ids that settled successfully.
    pub fn completed(&self) -> String {
        self.kind("completed")
    }

    /// Set of job ids that settled with a failure.
    pub fn failed(&self) -> String {
        self.kind("failed")
    }

    /// Marker key that exists iff the queue is paused.
    pub fn meta_paused(&self) -> String {
        self.kind("meta-paused")
    }

    /// Hash holding a single job's fields.
    pub fn job(&self, job_id: u64) -> String {
        format!("{}:{}", self.prefix, job_id)
    }

    /// String key holding the lock token of the worker that owns a job.
    pub fn lock(&self, job_id: u64) -> String {
        format!("{}:{}:lock", self.prefix, job_id)
    }

    /// Prefix a job id is appended to in order to form a job hash key.
    ///
    /// Passed to Lua scripts that need to address job hashes by id.
    pub fn job_prefix(&self) -> String {
        format!("{}:", self.prefix)
    }

    /// Channel for new-job notifications. Payload is the job id as a decimal
    /// string; the sentinel `-1` probes subscriber count and carries no job.
    pub fn jobs_channel(&self) -> String {
        self.kind("jobs")
    }

    /// Channel for delay-wake notifications. Payload is a unix-ms timestamp.
    pub fn delayed_channel(&self) -> String {
        self.kind("delayed")
    }

    /// Channel for pause/resume broadcasts. Payload is `paused` or `resumed`.
    pub fn paused_channel(&self) -> String {
        self.kind("paused")
    }

    fn kind(&self, kind: &str) -> String {
        format!("{}:{}", self.prefix, kind)
    }
}
