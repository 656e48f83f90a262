//! Start-document metadata for fly scans.
//!
//! Proposal bookkeeping (`year`, `cycle`, `PROPOSAL`, ...) lives in the
//! [`MetadataStore`]; everything else comes from the scan request.

use chrono::Datelike;
use qas_core::context::MetadataStore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Keys copied from the metadata store when present.
pub const PROPOSAL_KEYS: [&str; 5] = ["year", "cycle", "PROPOSAL", "SAF", "PI"];

/// Description of one fly scan request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanInfo {
    /// Scan name given by the user
    pub name: String,
    /// Free-form comment
    pub comment: String,
    /// Plan name recorded in the start document
    pub plan_name: String,
    /// Experiment label
    pub experiment: String,
    /// Auxiliary detector model, for flyers that carry one
    pub aux_detector: Option<String>,
}

impl ScanInfo {
    /// Streaming box only.
    pub fn apb(name: &str, comment: &str) -> Self {
        Self {
            name: name.to_string(),
            comment: comment.to_string(),
            plan_name: "execute_trajectory_apb".to_string(),
            experiment: "fly_energy_scan_apb".to_string(),
            aux_detector: None,
        }
    }

    /// Streaming box plus pulse output.
    pub fn apb_trigger(name: &str, comment: &str) -> Self {
        Self {
            plan_name: "execute_trajectory_apb_trigger".to_string(),
            experiment: "fly_energy_scan_apb_trigger".to_string(),
            ..Self::apb(name, comment)
        }
    }

    /// Xspress3 fluorescence scan.
    pub fn xs(name: &str, comment: &str) -> Self {
        Self {
            plan_name: "execute_trajectory_xs".to_string(),
            experiment: "fly_energy_scan_xs3".to_string(),
            aux_detector: Some("XSpress3".to_string()),
            ..Self::apb(name, comment)
        }
    }

    /// Pilatus diffraction scan.
    pub fn pilatus(name: &str, comment: &str) -> Self {
        Self {
            plan_name: "execute_trajectory_pilatus".to_string(),
            experiment: "fly_energy_scan_pilatus3".to_string(),
            aux_detector: Some("pilatus900k".to_string()),
            ..Self::apb(name, comment)
        }
    }
}

/// Metadata for the start documents of `info`.
///
/// `year` falls back to the current year when the store has none.
pub fn scan_metadata(store: &dyn MetadataStore, info: &ScanInfo) -> BTreeMap<String, Value> {
    let mut md = BTreeMap::new();
    for key in PROPOSAL_KEYS {
        if let Some(value) = store.get(key) {
            md.insert(key.to_string(), value);
        }
    }
    md.entry("year".to_string())
        .or_insert_with(|| Value::from(chrono::Local::now().year().to_string()));

    md.insert("plan_name".to_string(), Value::from(info.plan_name.as_str()));
    md.insert("experiment".to_string(), Value::from(info.experiment.as_str()));
    md.insert("name".to_string(), Value::from(info.name.as_str()));
    md.insert("comment".to_string(), Value::from(info.comment.as_str()));
    if let Some(aux) = &info.aux_detector {
        md.insert("aux_detector".to_string(), Value::from(aux.as_str()));
    }
    md
}

/// Where the processed (interpolated) file of run `name` will be written:
/// `<root>/<user_subdir>/<year>/<cycle>/<PROPOSAL>/<name>.raw`, leaving out
/// the components the metadata lacks.
///
/// An existing file is never reused; a `-2`, `-3`, ... suffix is appended
/// until the path is free.
pub fn interp_filename(
    root: &Path,
    user_subdir: &str,
    md: &BTreeMap<String, Value>,
    name: &str,
) -> PathBuf {
    let dir = ["year", "cycle", "PROPOSAL"]
        .iter()
        .filter_map(|key| md.get(*key).map(text))
        .fold(root.join(user_subdir), |dir, part| dir.join(part));
    let mut path = dir.join(format!("{name}.raw"));
    let mut n = 2;
    while path.exists() {
        path = dir.join(format!("{name}-{n}.raw"));
        n += 1;
    }
    path
}

fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qas_core::context::MemoryStore;
    use serde_json::json;

    #[test]
    fn proposal_keys_come_from_the_store() {
        let store = MemoryStore::new();
        store.set("year", json!("2024")).unwrap();
        store.set("cycle", json!("2")).unwrap();
        store.set("PROPOSAL", json!(312345)).unwrap();
        store.set("unrelated", json!(true)).unwrap();

        let md = scan_metadata(&store, &ScanInfo::xs("Fe foil", "ref"));
        assert_eq!(md["year"], json!("2024"));
        assert_eq!(md["PROPOSAL"], json!(312345));
        assert_eq!(md["plan_name"], json!("execute_trajectory_xs"));
        assert_eq!(md["experiment"], json!("fly_energy_scan_xs3"));
        assert_eq!(md["aux_detector"], json!("XSpress3"));
        assert!(!md.contains_key("unrelated"));
        assert!(!md.contains_key("SAF"));
    }

    #[test]
    fn missing_year_defaults_to_now_and_plain_scans_have_no_aux() {
        let md = scan_metadata(&MemoryStore::new(), &ScanInfo::apb("scan", ""));
        let year = chrono::Local::now().year().to_string();
        assert_eq!(md["year"], json!(year));
        assert!(!md.contains_key("aux_detector"));
        assert_eq!(md["experiment"], json!("fly_energy_scan_apb"));
    }

    #[test]
    fn interp_filename_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let md = BTreeMap::from([
            ("year".to_string(), json!("2024")),
            ("cycle".to_string(), json!(1)),
            ("PROPOSAL".to_string(), json!(300001)),
        ]);
        let first = interp_filename(dir.path(), "users", &md, "Cu 0001");
        assert!(first.ends_with("users/2024/1/300001/Cu 0001.raw"));

        std::fs::create_dir_all(first.parent().unwrap()).unwrap();
        std::fs::write(&first, "").unwrap();
        let second = interp_filename(dir.path(), "users", &md, "Cu 0001");
        assert!(second.ends_with("Cu 0001-2.raw"));
    }
}
