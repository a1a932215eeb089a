use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// How many workers to run and, optionally, which CPUs to pin them to.
#[derive(Clone, Debug)]
pub struct WorkerPlan {
    pub worker_count: usize,
    pub assigned_cpus: Vec<Option<usize>>,
    pub allowed_cpus: Vec<usize>,
    pub cgroup_cpuset_cores: Option<usize>,
    pub cgroup_quota_cores: Option<usize>,
}

#[derive(Clone, Debug)]
pub struct WorkerPlanRequest {
    /// 0 = one worker per allowed CPU.
    pub requested_workers: usize,
    pub enforce_cgroups: bool,
    pub pin_workers: bool,
    pub requested_core_ids: Option<Vec<usize>>,
}

fn read_trimmed(path: &Path) -> Option<String> {
    let text = std::fs::read_to_string(path).ok()?;
    let trimmed = text.trim().to_string();
    if trimmed.is_empty() { None } else { Some(trimmed) }
}

fn read_first(paths: &[PathBuf]) -> Option<String> {
    paths.iter().find_map(|path| read_trimmed(path))
}

fn cgroup_v2_relative_path() -> Option<String> {
    let content = std::fs::read_to_string("/proc/self/cgroup").ok()?;
    for line in content.lines() {
        let mut parts = line.splitn(3, ':');
        let hierarchy = parts.next()?;
        let controllers = parts.next()?;
        let path = parts.next()?;
        if hierarchy == "0" && controllers.is_empty() {
            return Some(path.to_string());
        }
    }
    None
}

fn cgroup_candidates(file: &str) -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Some(relative) = cgroup_v2_relative_path() {
        let rel = relative.trim_start_matches('/');
        out.push(PathBuf::from("/sys/fs/cgroup").join(rel).join(file));
    }
    out.push(PathBuf::from("/sys/fs/cgroup").join(file));
    out
}

/// Parse a Linux-style cpu list, e.g. "0-3,8,10-11".
pub fn parse_cpu_list(raw: &str) -> Result<Vec<usize>> {
    let mut cpus = BTreeSet::new();
    for segment in raw.split(',') {
        let segment = segment.trim();
        if segment.is_empty() {
            continue;
        }
        if let Some((start_raw, end_raw)) = segment.split_once('-') {
            let start: usize = start_raw
                .trim()
                .parse()
                .with_context(|| format!("invalid cpu id '{}'", start_raw.trim()))?;
            let end: usize = end_raw
                .trim()
                .parse()
                .with_context(|| format!("invalid cpu id '{}'", end_raw.trim()))?;
            if end < start {
                anyhow::bail!("invalid cpu range '{segment}': end < start");
            }
            cpus.extend(start..=end);
        } else {
            let cpu: usize = segment
                .parse()
                .with_context(|| format!("invalid cpu id '{segment}'"))?;
            cpus.insert(cpu);
        }
    }
    if cpus.is_empty() {
        anyhow::bail!("cpu list is empty");
    }
    Ok(cpus.into_iter().collect())
}

fn cgroup_cpuset() -> Option<Vec<usize>> {
    let mut candidates = cgroup_candidates("cpuset.cpus.effective");
    candidates.extend(cgroup_candidates("cpuset.cpus"));
    candidates.push(PathBuf::from("/sys/fs/cgroup/cpuset/cpuset.cpus"));
    parse_cpu_list(&read_first(&candidates)?).ok()
}

fn cgroup_quota_cores() -> Option<usize> {
    if let Some(raw) = read_first(&cgroup_candidates("cpu.max")) {
        let mut parts = raw.split_whitespace();
        let quota_raw = parts.next()?;
        let period_raw = parts.next()?;
        if quota_raw == "max" {
            return None;
        }
        let quota: u64 = quota_raw.parse().ok()?;
        let period: u64 = period_raw.parse().ok()?;
        if period == 0 {
            return None;
        }
        return Some(((quota / period) as usize).max(1));
    }
    None
}

/// Memory ceiling imposed by the enclosing cgroup, if any.
pub fn cgroup_memory_max_bytes() -> Option<u64> {
    let mut candidates = cgroup_candidates("memory.max");
    candidates.push(PathBuf::from("/sys/fs/cgroup/memory/memory.limit_in_bytes"));
    let raw = read_first(&candidates)?;
    if raw == "max" {
        return None;
    }
    let value: u64 = raw.parse().ok()?;
    if value == 0 { None } else { Some(value) }
}

pub fn build_worker_plan(req: WorkerPlanRequest) -> WorkerPlan {
    let host_cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or_else(|_| num_cpus::get())
        .max(1);

    let mut allowed_cpus = req
        .requested_core_ids
        .clone()
        .or_else(cgroup_cpuset)
        .unwrap_or_else(|| (0..host_cpus).collect());
    allowed_cpus.sort_unstable();
    allowed_cpus.dedup();

    let cpuset_limit = cgroup_cpuset().map(|cpus| cpus.len()).filter(|n| *n > 0);
    let quota_limit = cgroup_quota_cores();

    if req.enforce_cgroups
        && req.requested_core_ids.is_some()
        && let Some(cpuset) = cgroup_cpuset()
    {
        let cpuset: BTreeSet<usize> = cpuset.into_iter().collect();
        allowed_cpus.retain(|cpu| cpuset.contains(cpu));
    }
    if allowed_cpus.is_empty() {
        allowed_cpus = (0..host_cpus).collect();
    }

    if req.enforce_cgroups
        && let Some(quota) = quota_limit
        && quota < allowed_cpus.len()
    {
        allowed_cpus.truncate(quota.max(1));
    }

    let requested = if req.requested_workers == 0 {
        allowed_cpus.len()
    } else {
        req.requested_workers
    };
    let worker_count = requested.min(allowed_cpus.len().max(1)).max(1);

    let assigned_cpus = if req.pin_workers {
        allowed_cpus
            .iter()
            .cycle()
            .take(worker_count)
            .map(|cpu| Some(*cpu))
            .collect()
    } else {
        vec![None; worker_count]
    };

    WorkerPlan {
        worker_count,
        assigned_cpus,
        allowed_cpus,
        cgroup_cpuset_cores: cpuset_limit,
        cgroup_quota_cores: quota_limit,
    }
}

#[cfg(target_os = "linux")]
pub fn pin_current_thread_to_cpu(cpu: usize) -> Result<()> {
    // SAFETY: cpu_set_t is zero-initialized before use and passed with its
    // exact size.
    unsafe {
        let mut cpuset: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut cpuset);
        libc::CPU_SET(cpu, &mut cpuset);
        let rc = libc::sched_setaffinity(
            0,
            std::mem::size_of::<libc::cpu_set_t>(),
            &cpuset as *const libc::cpu_set_t,
        );
        if rc != 0 {
            return Err(std::io::Error::last_os_error())
                .with_context(|| format!("failed to set cpu affinity to core {cpu}"));
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn pin_current_thread_to_cpu(_cpu: usize) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{WorkerPlanRequest, build_worker_plan, parse_cpu_list};

    #[test]
    fn parses_cpu_ranges() {
        let cpus = parse_cpu_list("0-3,8,10-11").expect("cpu list should parse");
        assert_eq!(cpus, vec![0, 1, 2, 3, 8, 10, 11]);
    }

    #[test]
    fn rejects_reversed_ranges() {
        assert!(parse_cpu_list("5-2").is_err());
        assert!(parse_cpu_list("").is_err());
    }

    #[test]
    fn plan_respects_requested_worker_count() {
        let plan = build_worker_plan(WorkerPlanRequest {
            requested_workers: 2,
            enforce_cgroups: false,
            pin_workers: false,
            requested_core_ids: Some(vec![0, 1, 2, 3]),
        });
        assert_eq!(plan.worker_count, 2);
        assert_eq!(plan.assigned_cpus, vec![None, None]);
    }

    #[test]
    fn pinned_plan_assigns_cpus_round_robin() {
        let plan = build_worker_plan(WorkerPlanRequest {
            requested_workers: 3,
            enforce_cgroups: false,
            pin_workers: true,
            requested_core_ids: Some(vec![4, 5]),
        });
        assert_eq!(plan.worker_count, 2);
        assert_eq!(plan.assigned_cpus, vec![Some(4), Some(5)]);
    }
}
