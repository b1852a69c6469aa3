// ABOUTME: Unique identifiers for externally executing operations
// ABOUTME: Remote processes use host:pid@start_time, sub-tasks use their task id

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::error::OperationError;
use super::fields::Timestamp;

/// Prefix marking a sub-task id in the persisted form.
const TASK_PREFIX: &str = "task/";

/// Identity shared by an operation and every signal about it.
///
/// `Display` and `FromStr` use the bare signal-key form. Serialization tags
/// task ids with `task/` so a task id shaped like `host:pid@start` comes back
/// as a task id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum OperationId {
    Remote {
        host: String,
        pid: u32,
        started_at: Timestamp,
    },
    Task(String),
}

impl OperationId {
    pub fn remote(host: impl Into<String>, pid: u32, started_at: Timestamp) -> Self {
        OperationId::Remote {
            host: host.into(),
            pid,
            started_at,
        }
    }

    pub fn task(task_id: impl Into<String>) -> Self {
        OperationId::Task(task_id.into())
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, OperationId::Remote { .. })
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationId::Remote {
                host,
                pid,
                started_at,
            } => write!(f, "{}:{}@{}", host, pid, started_at),
            OperationId::Task(task_id) => write!(f, "{}", task_id),
        }
    }
}

impl FromStr for OperationId {
    type Err = OperationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(OperationError::invalid("id", "operation id cannot be empty"));
        }

        // IPv6 hosts contain ':' so split from the right
        let remote = s.rsplit_once('@').and_then(|(head, start)| {
            let (host, pid) = head.rsplit_once(':')?;
            if host.is_empty() {
                return None;
            }
            Some((host, pid.parse::<u32>().ok()?, start.parse::<Timestamp>().ok()?))
        });

        match remote {
            Some((host, pid, started_at)) => Ok(OperationId::remote(host, pid, started_at)),
            None => Ok(OperationId::Task(s.to_string())),
        }
    }
}

impl TryFrom<String> for OperationId {
    type Error = OperationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.strip_prefix(TASK_PREFIX) {
            Some(task_id) if !task_id.is_empty() => Ok(OperationId::task(task_id)),
            _ => value.parse(),
        }
    }
}

impl From<OperationId> for String {
    fn from(id: OperationId) -> Self {
        match id {
            OperationId::Task(task_id) => format!("{}{}", TASK_PREFIX, task_id),
            remote => remote.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_id_round_trip() {
        let id: OperationId = "server1:42@1000".parse().unwrap();
        assert_eq!(id, OperationId::remote("server1", 42, 1000));
        assert_eq!(id.to_string(), "server1:42@1000");
        assert!(id.is_remote());
    }

    #[test]
    fn test_ipv6_host() {
        let id: OperationId = "::1:7@5".parse().unwrap();
        assert_eq!(id, OperationId::remote("::1", 7, 5));
    }

    #[test]
    fn test_task_id_fallback() {
        let id: OperationId = "task-8812".parse().unwrap();
        assert_eq!(id, OperationId::task("task-8812"));

        // Not a valid pid, so this is a task id too
        let id: OperationId = "host:abc@12".parse().unwrap();
        assert!(!id.is_remote());
    }

    #[test]
    fn test_empty_id_rejected() {
        assert!("  ".parse::<OperationId>().is_err());
    }

    #[test]
    fn test_serde_uses_string_form() {
        let id = OperationId::remote("web-3", 9, 77);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"web-3:9@77\"");
        let back: OperationId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_remote_shaped_task_id_survives_serde() {
        let id = OperationId::task("deploy:42@1700");
        assert_eq!(id.to_string(), "deploy:42@1700");

        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"task/deploy:42@1700\"");
        let back: OperationId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
        assert!(!back.is_remote());
    }

    #[test]
    fn test_untagged_task_id_still_deserializes() {
        let back: OperationId = serde_json::from_str("\"task-8812\"").unwrap();
        assert_eq!(back, OperationId::task("task-8812"));
    }
}
