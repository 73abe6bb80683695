//! The soft resource-limit stage.

use anyhow::{anyhow, Result};
use envmod_linux::{self as linux, Resource};
use slog::{debug, Logger};

/// Requested soft limits, one optional value per resource. A negative value
/// clamps the soft limit to zero; a value above the hard limit clamps to the
/// hard limit. Hard limits are never touched.
#[derive(Clone, Copy, Debug, Default)]
pub struct Limits {
    pub data: Option<i64>,
    pub stack: Option<i64>,
    pub memlock: Option<i64>,
    pub address_space: Option<i64>,
    pub open_files: Option<i64>,
    pub processes: Option<i64>,
    pub file_size: Option<i64>,
    pub core: Option<i64>,
    pub rss: Option<i64>,
    pub cpu: Option<i64>,
}

impl Limits {
    pub fn apply(&self, log: &Logger) -> Result<()> {
        apply_one(Resource::DATA, "data segment", self.data, log)?;
        apply_one(Resource::STACK, "stack segment", self.stack, log)?;
        apply_one(Resource::MEMLOCK, "locked memory", self.memlock, log)?;
        apply_one(Resource::AS, "address space", self.address_space, log)?;
        apply_one(Resource::NOFILE, "open files", self.open_files, log)?;
        apply_one(Resource::NPROC, "processes", self.processes, log)?;
        apply_one(Resource::FSIZE, "file size", self.file_size, log)?;
        apply_one(Resource::CORE, "core size", self.core, log)?;
        apply_one(Resource::RSS, "resident set size", self.rss, log)?;
        apply_one(Resource::CPU, "cpu time", self.cpu, log)?;
        Ok(())
    }
}

fn apply_one(
    resource: Resource,
    what: &str,
    value: Option<i64>,
    log: &Logger,
) -> Result<()> {
    let Some(value) = value else {
        return Ok(());
    };
    let mut rlimit = linux::getrlimit(resource)
        .map_err(|err| anyhow!("unable to get {what} limit: {err}"))?;
    rlimit.cur = clamp_soft(value, rlimit.max);
    debug!(log, "setting resource limit"; "resource" => what, "soft" => rlimit.cur);
    linux::setrlimit(resource, rlimit)
        .map_err(|err| anyhow!("unable to set {what} limit: {err}"))?;
    Ok(())
}

fn clamp_soft(value: i64, hard: u64) -> u64 {
    if value < 0 {
        0
    } else if value as u64 > hard {
        hard
    } else {
        value as u64
    }
}
