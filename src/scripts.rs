//! Lua scripts for the atomic multi-key operations.
//!
//! Each script is loaded once and invoked by SHA afterwards (`redis::Script`
//! caches the hash and falls back to a full load on a flushed server). The
//! script bodies are part of the wire contract and must not change without a
//! compatibility plan.

use redis::Script;

pub(crate) struct Scripts {
    /// Compare-and-delete of a job lock.
    pub release_lock: Script,
    /// Full eviction of a job id plus deletion of its hash.
    pub remove_job: Script,
    /// wait/paused rename + meta-paused flip + broadcasts.
    pub pause_resume: Script,
    /// Delay-poll: promote the earliest due delayed job back onto wait.
    pub promote_delayed: Script,
}

impl Scripts {
    pub fn new() -> Self {
        Self {
            release_lock: Script::new(include_str!("lua/release_lock.lua")),
            remove_job: Script::new(include_str!("lua/remove_job.lua")),
            pause_resume: Script::new(include_str!("lua/pause_resume.lua")),
            promote_delayed: Script::new(include_str!("lua/promote_delayed.lua")),
        }
    }
}
