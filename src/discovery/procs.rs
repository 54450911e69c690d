//! Process-table introspection for activity detection.
//!
//! One `ps` call captures the whole table; one `lsof` call resolves the
//! working directories of every candidate pid at once.

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::process;

/// Interpreters that launch agents as scripts (`node /usr/bin/claude`).
const SCRIPT_HOSTS: &[&str] = &["node", "bun", "deno", "python", "python3"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    pub start_time: Option<DateTime<Utc>>,
    pub command: String,
}

impl ProcessEntry {
    /// Basenames that identify what the process is running: argv[0], plus
    /// argv[1] when argv[0] is a script host.
    pub fn program_names(&self) -> Vec<&str> {
        let mut args = self.command.split_whitespace();
        let Some(first) = args.next().map(basename) else {
            return Vec::new();
        };
        let mut names = vec![first];
        if SCRIPT_HOSTS.contains(&first) {
            if let Some(script) = args.next() {
                names.push(basename(script));
            }
        }
        names
    }

    pub fn runs(&self, signature: &Regex) -> bool {
        self.program_names().iter().any(|name| signature.is_match(name))
    }

    /// Arguments that look like absolute paths.
    pub fn path_args(&self) -> impl Iterator<Item = &Path> {
        self.command
            .split_whitespace()
            .skip(1)
            .filter(|arg| arg.starts_with('/'))
            .map(Path::new)
    }
}

fn basename(arg: &str) -> &str {
    arg.rsplit('/').next().unwrap_or(arg)
}

/// Snapshot of the process table.
#[derive(Debug, Clone, Default)]
pub struct ProcessTable {
    entries: Vec<ProcessEntry>,
}

impl ProcessTable {
    /// Capture every process on the host. An empty table is returned if
    /// `ps` fails.
    pub async fn snapshot(timeout: Duration) -> Self {
        // Pin the locale so lstart parses
        let stdout = process::capture_stdout(
            "env",
            ["LC_ALL=C", "ps", "-axo", "pid=,lstart=,command="],
            None,
            timeout,
        )
        .await
        .unwrap_or_default();

        let mut table = Self::parse(&stdout);
        let own_pid = std::process::id();
        table.entries.retain(|entry| entry.pid != own_pid);
        table
    }

    /// Parse `ps -o pid=,lstart=,command=` output.
    pub fn parse(output: &str) -> Self {
        let entries = output.lines().filter_map(parse_ps_line).collect();
        Self { entries }
    }

    pub fn entries(&self) -> &[ProcessEntry] {
        &self.entries
    }

    pub fn matching<'a>(&'a self, signature: &'a Regex) -> impl Iterator<Item = &'a ProcessEntry> {
        self.entries.iter().filter(move |entry| entry.runs(signature))
    }

    pub fn get(&self, pid: u32) -> Option<&ProcessEntry> {
        self.entries.iter().find(|entry| entry.pid == pid)
    }
}

fn parse_ps_line(line: &str) -> Option<ProcessEntry> {
    let mut fields = line.split_whitespace();
    let pid = fields.next()?.parse::<u32>().ok()?;
    // lstart is always five fields: "Mon Jan  2 15:04:05 2006"
    let lstart: Vec<&str> = fields.by_ref().take(5).collect();
    if lstart.len() != 5 {
        return None;
    }
    let command = fields.collect::<Vec<_>>().join(" ");
    if command.is_empty() {
        return None;
    }

    Some(ProcessEntry {
        pid,
        start_time: parse_lstart(&lstart.join(" ")),
        command,
    })
}

/// Parse a `ps` lstart value, which is in local time.
fn parse_lstart(value: &str) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(value, "%a %b %d %H:%M:%S %Y").ok()?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .map(|local| local.with_timezone(&Utc))
}

/// Parse `lsof -F pn` output into pid -> path.
///
/// Field lines are tagged by their first byte: `p<pid>` opens a process
/// set and `n<name>` carries the path of its selected file descriptor.
pub fn parse_lsof_fields(output: &str) -> HashMap<u32, PathBuf> {
    let mut result = HashMap::new();
    let mut current: Option<u32> = None;

    for line in output.lines() {
        if let Some(pid) = line.strip_prefix('p') {
            current = pid.trim().parse().ok();
        } else if let Some(name) = line.strip_prefix('n') {
            if let Some(pid) = current {
                result.entry(pid).or_insert_with(|| PathBuf::from(name));
            }
        }
    }

    result
}

/// Resolve the working directory of every pid.
///
/// Uses a single batched `lsof`; only if that call yields nothing usable
/// does it fall back to resolving each pid on its own.
pub async fn resolve_cwds(pids: &[u32], timeout: Duration) -> HashMap<u32, PathBuf> {
    if pids.is_empty() {
        return HashMap::new();
    }

    let pid_list = pids
        .iter()
        .map(u32::to_string)
        .collect::<Vec<_>>()
        .join(",");

    match process::run_capture(
        "lsof",
        ["-a", "-d", "cwd", "-p", pid_list.as_str(), "-F", "pn"],
        None,
        timeout,
    )
    .await
    {
        Ok(stdout) => return parse_lsof_fields(&stdout),
        // lsof exits 1 when any pid has vanished but still reports the rest
        Err(e) => {
            if let Some(partial) = e.partial_stdout() {
                return parse_lsof_fields(partial);
            }
            debug!(error = %e, count = pids.len(), "batched cwd lookup failed, resolving per pid");
        }
    }

    let lookups = pids.iter().map(|pid| async move { (*pid, cwd_of(*pid, timeout).await) });
    futures::future::join_all(lookups)
        .await
        .into_iter()
        .filter_map(|(pid, cwd)| cwd.map(|cwd| (pid, cwd)))
        .collect()
}

/// Working directory of a single process.
pub async fn cwd_of(pid: u32, timeout: Duration) -> Option<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        if let Ok(cwd) = tokio::fs::read_link(format!("/proc/{}/cwd", pid)).await {
            return Some(cwd);
        }
    }

    let pid_arg = pid.to_string();
    let stdout = process::capture_stdout(
        "lsof",
        ["-a", "-d", "cwd", "-p", pid_arg.as_str(), "-F", "pn"],
        None,
        timeout,
    )
    .await?;
    parse_lsof_fields(&stdout).remove(&pid)
}
