use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use chrono::Utc;
use serde_json::{json, Map, Value};
use tracing::warn;

use crate::types::RequestGroup;

/// How fetch bodies are written to the message log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageLogMode {
    /// Every body in full.
    Full,
    /// First body per group and zone in full, then only changed paths.
    Diffed,
}

/// NDJSON traffic log of login, fetch and set exchanges.
pub(crate) struct MessageLogger {
    mode: MessageLogMode,
    file: File,
    previous: HashMap<(RequestGroup, u8), Value>,
}

impl MessageLogger {
    pub fn new(mode: MessageLogMode, path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            mode,
            file,
            previous: HashMap::new(),
        })
    }

    /// Credentials are never written.
    pub fn log_login(&mut self, final_url: &str, status: u16, plant: Option<&str>) {
        let entry = json!({
            "ts": Utc::now().to_rfc3339(),
            "dir": "login",
            "url": final_url,
            "status": status,
            "plant": plant,
        });
        self.write_line(&entry);
    }

    pub fn log_fetch(&mut self, group: RequestGroup, zone: u8, status: u16, body: &Value) {
        let ts = Utc::now().to_rfc3339();
        let entry = match self.mode {
            MessageLogMode::Full => json!({
                "ts": ts,
                "dir": "fetch",
                "group": group,
                "zone": zone,
                "status": status,
                "body": body,
            }),
            MessageLogMode::Diffed => match self.previous.insert((group, zone), body.clone()) {
                None => json!({
                    "ts": ts,
                    "dir": "fetch",
                    "group": group,
                    "zone": zone,
                    "status": status,
                    "full": true,
                    "body": body,
                }),
                Some(prev) => {
                    let mut changes = Vec::new();
                    json_diff(&prev, body, "", &mut changes);
                    let changes: Vec<Value> = changes
                        .into_iter()
                        .map(|(path, old, new)| json!({ "path": path, "old": old, "new": new }))
                        .collect();
                    json!({
                        "ts": ts,
                        "dir": "fetch",
                        "group": group,
                        "zone": zone,
                        "status": status,
                        "changes": changes,
                    })
                }
            },
        };
        self.write_line(&entry);
    }

    pub fn log_set(&mut self, group: RequestGroup, url: &str, status: Option<u16>, body: &Value) {
        let entry = json!({
            "ts": Utc::now().to_rfc3339(),
            "dir": "set",
            "group": group,
            "url": url,
            "status": status,
            "body": body,
        });
        self.write_line(&entry);
    }

    /// Forget diff baselines, e.g. after the cached device state was purged.
    pub fn reset(&mut self) {
        self.previous.clear();
    }

    fn write_line(&mut self, entry: &Value) {
        if let Ok(line) = serde_json::to_string(entry)
            && let Err(e) = writeln!(self.file, "{line}")
        {
            warn!("failed to write log entry: {e}");
        }
    }
}

fn json_diff(previous: &Value, current: &Value, prefix: &str, changes: &mut Vec<(String, Value, Value)>) {
    let join = |key: &str| {
        if prefix.is_empty() {
            key.to_string()
        } else {
            format!("{prefix}.{key}")
        }
    };
    match (previous, current) {
        (Value::Object(prev), Value::Object(curr)) => {
            for (key, curr_val) in curr {
                let path = join(key);
                match prev.get(key) {
                    Some(prev_val) => json_diff(prev_val, curr_val, &path, changes),
                    None if curr_val.is_object() => {
                        json_diff(&Value::Object(Map::new()), curr_val, &path, changes)
                    }
                    None => changes.push((path, Value::Null, curr_val.clone())),
                }
            }
            for (key, prev_val) in prev {
                if !curr.contains_key(key) {
                    changes.push((join(key), prev_val.clone(), Value::Null));
                }
            }
        }
        (Value::Array(prev), Value::Array(curr)) if prev.len() == curr.len() => {
            for (i, (p, c)) in prev.iter().zip(curr).enumerate() {
                json_diff(p, c, &join(&i.to_string()), changes);
            }
        }
        (prev, curr) if prev != curr => {
            changes.push((prefix.to_string(), prev.clone(), curr.clone()));
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn lines(tmp: &NamedTempFile) -> Vec<Value> {
        std::fs::read_to_string(tmp.path())
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn login_entry_has_no_credentials() {
        let tmp = NamedTempFile::new().unwrap();
        let mut logger = MessageLogger::new(MessageLogMode::Full, tmp.path()).unwrap();
        logger.log_login("https://h/R2/Plant/Index/PL123", 200, Some("PL123"));

        let lines = lines(&tmp);
        assert_eq!(lines[0]["dir"], "login");
        assert_eq!(lines[0]["plant"], "PL123");
        assert!(lines[0].get("password").is_none());
        assert!(lines[0]["ts"].as_str().is_some());
    }

    #[test]
    fn diffed_mode_logs_full_first_then_changes() {
        let tmp = NamedTempFile::new().unwrap();
        let mut logger = MessageLogger::new(MessageLogMode::Diffed, tmp.path()).unwrap();

        logger.log_fetch(RequestGroup::Main, 1, 200, &json!({"zone": {"roomTemp": 20.5}}));
        logger.log_fetch(RequestGroup::Main, 1, 200, &json!({"zone": {"roomTemp": 21.0}}));

        let lines = lines(&tmp);
        assert_eq!(lines[0]["full"], true);
        assert_eq!(lines[0]["group"], "Main");
        let changes = lines[1]["changes"].as_array().unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0]["path"], "zone.roomTemp");
        assert_eq!(changes[0]["old"], 20.5);
        assert_eq!(changes[0]["new"], 21.0);
    }

    #[test]
    fn diffed_baselines_are_per_group_and_zone() {
        let tmp = NamedTempFile::new().unwrap();
        let mut logger = MessageLogger::new(MessageLogMode::Diffed, tmp.path()).unwrap();
        let body = json!({"a": 1});
        logger.log_fetch(RequestGroup::Main, 1, 200, &body);
        logger.log_fetch(RequestGroup::Main, 2, 200, &body);
        logger.log_fetch(RequestGroup::Usage, 1, 200, &body);
        logger.log_fetch(RequestGroup::Main, 1, 200, &body);

        let lines = lines(&tmp);
        assert_eq!(lines[0]["full"], true);
        assert_eq!(lines[1]["full"], true);
        assert_eq!(lines[2]["full"], true);
        assert_eq!(lines[3]["changes"].as_array().unwrap().len(), 0);
    }

    #[test]
    fn reset_forgets_baselines() {
        let tmp = NamedTempFile::new().unwrap();
        let mut logger = MessageLogger::new(MessageLogMode::Diffed, tmp.path()).unwrap();
        logger.log_fetch(RequestGroup::Main, 1, 200, &json!({"a": 1}));
        logger.reset();
        logger.log_fetch(RequestGroup::Main, 1, 200, &json!({"a": 1}));
        assert_eq!(lines(&tmp)[1]["full"], true);
    }

    #[test]
    fn set_entry_records_group_and_status() {
        let tmp = NamedTempFile::new().unwrap();
        let mut logger = MessageLogger::new(MessageLogMode::Full, tmp.path()).unwrap();
        logger.log_set(RequestGroup::OtherParams, "https://h/R2/PlantMenu/Submit/PL1", None, &json!([]));

        let line = &lines(&tmp)[0];
        assert_eq!(line["dir"], "set");
        assert_eq!(line["group"], "OtherParams");
        assert!(line["status"].is_null());
    }

    #[test]
    fn json_diff_reports_removed_and_array_changes() {
        let mut changes = Vec::new();
        json_diff(
            &json!({"gone": 1, "list": [1, 2]}),
            &json!({"list": [1, 3]}),
            "",
            &mut changes,
        );
        assert!(changes.contains(&("list.1".to_string(), json!(2), json!(3))));
        assert!(changes.contains(&("gone".to_string(), json!(1), Value::Null)));
    }
}
