//! ZFS adapter
//!
//! Implements [`SnapshotApi`] and [`DatasetApi`] with the `zfs` command line
//! tool. Commands run on the blocking pool; output is parsed from the
//! scripted (`-H`, tab-separated) format.

use crate::domain::ports::{DatasetApi, LockedDataset, RollbackOptions, SnapshotApi, SnapshotInfo};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::process::Command;
use tracing::debug;

/// `zfs` CLI wrapper
#[derive(Debug, Clone)]
pub struct ZfsCli {
    binary: String,
}

impl Default for ZfsCli {
    fn default() -> Self {
        Self {
            binary: "zfs".to_string(),
        }
    }
}

impl ZfsCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Run `zfs <args>` and return stdout
    async fn run(&self, args: Vec<String>) -> Result<String> {
        let binary = self.binary.clone();
        let command = args.first().cloned().unwrap_or_default();
        debug!("zfs {}", args.join(" "));

        let output = tokio::task::spawn_blocking(move || Command::new(&binary).args(&args).output())
            .await
            .map_err(|e| Error::Internal(format!("zfs task failed: {}", e)))?
            .map_err(|e| tool_error(&command, e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(tool_error(&command, stderr.trim().to_string()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Every filesystem and volume at or below `dataset`
    async fn tree(&self, dataset: &str) -> Result<Vec<String>> {
        let out = self
            .run(args(&["list", "-H", "-o", "name", "-r", "-t", "filesystem,volume", dataset]))
            .await?;
        Ok(parse_names(&out))
    }
}

fn tool_error(command: &str, reason: String) -> Error {
    Error::ExternalTool {
        tool: "zfs".into(),
        command: command.into(),
        reason,
    }
}

fn args(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

fn is_missing(err: &Error) -> bool {
    matches!(err, Error::ExternalTool { reason, .. } if reason.contains("does not exist"))
}

// =============================================================================
// Output Parsing
// =============================================================================

fn parse_names(out: &str) -> Vec<String> {
    out.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse `name<TAB>creation` lines with creation in epoch seconds (`-p`)
pub fn parse_snapshots(out: &str) -> Result<Vec<SnapshotInfo>> {
    let mut snapshots = Vec::new();
    for line in out.lines().filter(|l| !l.trim().is_empty()) {
        let (name, creation) = line
            .split_once('\t')
            .ok_or_else(|| tool_error("list", format!("unexpected snapshot line {line:?}")))?;
        let secs: i64 = creation
            .trim()
            .parse()
            .map_err(|_| tool_error("list", format!("bad creation time {creation:?}")))?;
        let created_on: DateTime<Utc> = Utc
            .timestamp_opt(secs, 0)
            .single()
            .ok_or_else(|| tool_error("list", format!("creation time {secs} out of range")))?;
        snapshots.push(SnapshotInfo {
            name: name.to_string(),
            created_on,
        });
    }
    Ok(snapshots)
}

/// Parse `name<TAB>keystatus<TAB>mountpoint` lines, keeping unavailable keys
pub fn parse_locked(out: &str) -> Vec<LockedDataset> {
    out.lines()
        .filter_map(|line| {
            let mut fields = line.split('\t');
            let name = fields.next()?;
            let keystatus = fields.next()?;
            let mountpoint = fields.next().unwrap_or("-");
            (keystatus == "unavailable").then(|| LockedDataset {
                id: name.to_string(),
                mountpoint: match mountpoint {
                    "-" | "none" | "legacy" => None,
                    path => Some(path.to_string()),
                },
            })
        })
        .collect()
}

/// Datasets of `tree` that are not excluded and not below an excluded one
pub fn snapshot_targets(tree: &[String], exclude: &BTreeSet<String>) -> Vec<String> {
    tree.iter()
        .filter(|name| {
            !exclude
                .iter()
                .any(|ex| *name == ex || name.starts_with(&format!("{ex}/")))
        })
        .cloned()
        .collect()
}

// =============================================================================
// Snapshot Port
// =============================================================================

#[async_trait]
impl SnapshotApi for ZfsCli {
    async fn create(&self, dataset: &str, name: &str, exclude: &BTreeSet<String>) -> Result<()> {
        let targets = snapshot_targets(&self.tree(dataset).await?, exclude);
        // A single invocation keeps the snapshot atomic across datasets
        let mut cmd = args(&["snapshot"]);
        cmd.extend(targets.iter().map(|ds| format!("{ds}@{name}")));
        self.run(cmd).await?;
        Ok(())
    }

    async fn rollback(&self, snapshot: &str, options: RollbackOptions) -> Result<()> {
        let (dataset, snap) = snapshot
            .split_once('@')
            .ok_or_else(|| Error::Validation(format!("{snapshot:?} is not a snapshot name")))?;

        let targets = if options.recursive_rollback {
            let out = self
                .run(args(&["list", "-H", "-o", "name", "-r", "-t", "snapshot", dataset]))
                .await?;
            let suffix = format!("@{snap}");
            parse_names(&out)
                .into_iter()
                .filter(|name| name.ends_with(&suffix))
                .collect()
        } else {
            vec![snapshot.to_string()]
        };

        for target in targets {
            let mut cmd = args(&["rollback"]);
            if options.recursive {
                cmd.push("-r".into());
            }
            if options.recursive_clones {
                cmd.push("-R".into());
            }
            if options.force {
                cmd.push("-f".into());
            }
            cmd.push(target);
            self.run(cmd).await?;
        }
        Ok(())
    }

    async fn delete(&self, snapshot: &str, recursive: bool) -> Result<()> {
        let mut cmd = args(&["destroy"]);
        if recursive {
            cmd.push("-r".into());
        }
        cmd.push(snapshot.to_string());
        self.run(cmd).await?;
        Ok(())
    }

    async fn query(&self, prefix: &str) -> Result<Vec<SnapshotInfo>> {
        let dataset = prefix.split('@').next().unwrap_or(prefix);
        let out = match self
            .run(args(&["list", "-H", "-p", "-o", "name,creation", "-t", "snapshot", "-r", dataset]))
            .await
        {
            Ok(out) => out,
            Err(e) if is_missing(&e) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        Ok(parse_snapshots(&out)?
            .into_iter()
            .filter(|s| s.name.starts_with(prefix))
            .collect())
    }
}

// =============================================================================
// Dataset Port
// =============================================================================

#[async_trait]
impl DatasetApi for ZfsCli {
    async fn exists(&self, name: &str) -> Result<bool> {
        match self.run(args(&["list", "-H", "-o", "name", name])).await {
            Ok(_) => Ok(true),
            Err(e) if is_missing(&e) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn create(&self, name: &str, properties: &BTreeMap<String, String>) -> Result<()> {
        let mut cmd = args(&["create"]);
        for (key, value) in properties {
            cmd.push("-o".into());
            cmd.push(format!("{key}={value}"));
        }
        cmd.push(name.to_string());
        self.run(cmd).await?;
        Ok(())
    }

    async fn delete(&self, name: &str, recursive: bool, force: bool) -> Result<()> {
        let mut cmd = args(&["destroy"]);
        if recursive {
            cmd.push("-r".into());
        }
        if force {
            cmd.push("-f".into());
        }
        cmd.push(name.to_string());
        self.run(cmd).await?;
        Ok(())
    }

    async fn mount(&self, name: &str) -> Result<()> {
        match self.run(args(&["mount", name])).await {
            Err(Error::ExternalTool { reason, .. }) if reason.contains("already mounted") => Ok(()),
            other => other.map(|_| ()),
        }
    }

    async fn children(&self, name: &str) -> Result<Vec<String>> {
        let out = self
            .run(args(&["list", "-H", "-o", "name", "-d", "1", "-t", "filesystem,volume", name]))
            .await?;
        let prefix = format!("{name}/");
        Ok(parse_names(&out)
            .into_iter()
            .filter_map(|child| child.strip_prefix(&prefix).map(str::to_string))
            .collect())
    }

    async fn descendants(&self, name: &str) -> Result<Vec<String>> {
        Ok(self
            .tree(name)
            .await?
            .into_iter()
            .filter(|ds| ds != name)
            .collect())
    }

    async fn locked(&self) -> Result<Vec<LockedDataset>> {
        let out = self
            .run(args(&["list", "-H", "-o", "name,keystatus,mountpoint", "-t", "filesystem,volume"]))
            .await?;
        Ok(parse_locked(&out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_snapshots() {
        let out = "tank/ix-applications@ix-applications-backup-a\t1704067200\n\
                   tank/ix-applications/releases@ix-applications-backup-a\t1704067201\n";
        let snapshots = parse_snapshots(out).unwrap();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].created_on.to_rfc3339(), "2024-01-01T00:00:00+00:00");

        assert!(parse_snapshots("tank@a\tyesterday\n").is_err());
        assert!(parse_snapshots("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_locked() {
        let out = "tank\tnone\t/mnt/tank\n\
                   tank/enc\tunavailable\t/mnt/tank/enc\n\
                   tank/vol\tunavailable\t-\n";
        let locked = parse_locked(out);
        assert_eq!(
            locked,
            vec![
                LockedDataset {
                    id: "tank/enc".into(),
                    mountpoint: Some("/mnt/tank/enc".into()),
                },
                LockedDataset {
                    id: "tank/vol".into(),
                    mountpoint: None,
                },
            ]
        );
    }

    #[test]
    fn test_snapshot_targets_skip_excluded_subtrees() {
        let tree: Vec<String> = [
            "tank/ix-applications",
            "tank/ix-applications/k3s",
            "tank/ix-applications/k3s/kubelet",
            "tank/ix-applications/k3s-old",
            "tank/ix-applications/releases",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        let exclude = BTreeSet::from(["tank/ix-applications/k3s".to_string()]);

        assert_eq!(
            snapshot_targets(&tree, &exclude),
            vec![
                "tank/ix-applications",
                "tank/ix-applications/k3s-old",
                "tank/ix-applications/releases",
            ]
        );
    }
}
