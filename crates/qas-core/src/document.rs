//! Document model for fly-scan data.
//!
//! Two families of documents flow out of a fly scan:
//!
//! - **Asset documents** ([`Resource`], [`Datum`]) reference data that lives in
//!   files written by the hardware. Devices queue them in an [`AssetQueue`]
//!   and hand them out through `collect_asset_docs()`.
//! - **Run documents** ([`StartDoc`], [`DescriptorDoc`], [`EventDoc`],
//!   [`StopDoc`]) describe the run itself and are emitted by the run engine.
//!
//! # Document Flow
//!
//! ```text
//! StartDoc (1)
//!    │
//!    ├── Resource (1 per staged file)
//!    │       └── Datum (N, one per chunk/frame/column)
//!    │
//!    ├── DescriptorDoc (1 per collect stream)
//!    │       └── EventDoc (N, each referencing datum ids)
//!    │
//! StopDoc (1)
//! ```

use parking_lot::Mutex;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, VecDeque};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Generate a new unique document ID
pub fn new_uid() -> String {
    Uuid::new_v4().to_string()
}

/// Current timestamp in nanoseconds since Unix epoch
pub fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Current timestamp in seconds since Unix epoch
pub fn now_secs() -> f64 {
    now_ns() as f64 * 1e-9
}

/// Keyword arguments attached to resources and datums.
pub type Kwargs = Map<String, Value>;

/// One output file registered by a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// Handler tag, e.g. `APB` or `PIZZABOX_ENC_FILE_TXT`
    pub spec: String,
    /// Root the resource path is relative to
    pub root: String,
    /// Path of the file below `root`
    pub resource_path: String,
    /// Handler parameters
    pub resource_kwargs: Kwargs,
    /// `posix` or `windows`
    pub path_semantics: String,
    /// Unique ID
    pub uid: String,
    /// Run the resource belongs to, filled in by the run engine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_start: Option<String>,
}

impl Resource {
    /// New resource with a fresh uid.
    pub fn new(
        spec: impl Into<String>,
        root: impl Into<String>,
        resource_path: impl Into<String>,
        resource_kwargs: Kwargs,
    ) -> Self {
        Self {
            spec: spec.into(),
            root: root.into(),
            resource_path: resource_path.into(),
            resource_kwargs,
            path_semantics: "posix".to_string(),
            uid: new_uid(),
            run_start: None,
        }
    }
}

/// Reference to one slice of a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Datum {
    /// Resource uid
    pub resource: String,
    /// `{resource_uid}/{sequence}` or `{resource_uid}/{key}`
    pub datum_id: String,
    /// How to locate the slice
    pub datum_kwargs: Kwargs,
}

impl Datum {
    /// Datum numbered by a sequence counter.
    pub fn numbered(resource: &Resource, sequence: u64, datum_kwargs: Kwargs) -> Self {
        Self::keyed(resource, &sequence.to_string(), datum_kwargs)
    }

    /// Datum identified by a string key.
    pub fn keyed(resource: &Resource, key: &str, datum_kwargs: Kwargs) -> Self {
        Self {
            resource: resource.uid.clone(),
            datum_id: format!("{}/{}", resource.uid, key),
            datum_kwargs,
        }
    }
}

/// A queued asset document, `("resource", {...})` or `("datum", {...})`.
///
/// Serialises as that two-element array.
#[derive(Debug, Clone, PartialEq)]
pub enum AssetDoc {
    /// File registration
    Resource(Resource),
    /// Slice reference
    Datum(Datum),
}

impl AssetDoc {
    /// `"resource"` or `"datum"`.
    pub fn kind(&self) -> &'static str {
        match self {
            AssetDoc::Resource(_) => "resource",
            AssetDoc::Datum(_) => "datum",
        }
    }
}

impl Serialize for AssetDoc {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            AssetDoc::Resource(resource) => (self.kind(), resource).serialize(serializer),
            AssetDoc::Datum(datum) => (self.kind(), datum).serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for AssetDoc {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let (name, doc) = <(String, Value)>::deserialize(deserializer)?;
        let parsed = match name.as_str() {
            "resource" => serde_json::from_value(doc).map(AssetDoc::Resource),
            "datum" => serde_json::from_value(doc).map(AssetDoc::Datum),
            other => return Err(de::Error::unknown_variant(other, &["resource", "datum"])),
        };
        parsed.map_err(de::Error::custom)
    }
}

/// FIFO of asset documents waiting to be drained.
#[derive(Debug, Default)]
pub struct AssetQueue {
    docs: Mutex<VecDeque<AssetDoc>>,
}

impl AssetQueue {
    /// Empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a document.
    pub fn push(&self, doc: AssetDoc) {
        self.docs.lock().push_back(doc);
    }

    /// Take every queued document; a second drain returns nothing.
    pub fn drain(&self) -> Vec<AssetDoc> {
        self.docs.lock().drain(..).collect()
    }

    /// Number of queued documents.
    pub fn len(&self) -> usize {
        self.docs.lock().len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.docs.lock().is_empty()
    }

    /// Drop everything that was not drained.
    pub fn clear(&self) {
        self.docs.lock().clear();
    }
}

/// One point produced by `collect()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectPoint {
    /// Field -> value (datum id for external data)
    pub data: BTreeMap<String, Value>,
    /// Field -> timestamp
    pub timestamps: BTreeMap<String, f64>,
    /// Event time
    pub time: f64,
    /// Field -> whether the value is already filled in
    pub filled: BTreeMap<String, bool>,
}

impl CollectPoint {
    /// Point referencing external data through `datum_id`.
    pub fn reference(field: &str, datum_id: &str, time: f64) -> Self {
        let mut point = Self::empty(time);
        point.add_reference(field, datum_id);
        point
    }

    /// Point without fields.
    pub fn empty(time: f64) -> Self {
        Self {
            data: BTreeMap::new(),
            timestamps: BTreeMap::new(),
            time,
            filled: BTreeMap::new(),
        }
    }

    /// Add an unfilled external field.
    pub fn add_reference(&mut self, field: &str, datum_id: &str) {
        self.data
            .insert(field.to_string(), Value::String(datum_id.to_string()));
        self.timestamps.insert(field.to_string(), self.time);
        self.filled.insert(field.to_string(), false);
    }
}

/// Schema of one collected field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataKey {
    /// Data source tag
    pub source: String,
    /// Data type
    pub dtype: String,
    /// Shape, `-1` for unknown extents
    pub shape: Vec<i64>,
    /// `FILESTORE:` for data held in files
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external: Option<String>,
    /// Device-specific extras (filenames, device names)
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl DataKey {
    /// Array field stored in a file.
    pub fn external_array(source: impl Into<String>, shape: Vec<i64>) -> Self {
        Self {
            source: source.into(),
            dtype: "array".to_string(),
            shape,
            external: Some("FILESTORE:".to_string()),
            extra: BTreeMap::new(),
        }
    }

    /// Attach an extra entry.
    pub fn with_extra(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }
}

/// `stream -> field -> DataKey`
pub type DescribeCollect = BTreeMap<String, BTreeMap<String, DataKey>>;

/// Describe a single-field stream named after the field.
pub fn describe_single(name: &str, key: DataKey) -> DescribeCollect {
    let mut fields = BTreeMap::new();
    fields.insert(name.to_string(), key);
    let mut streams = DescribeCollect::new();
    streams.insert(name.to_string(), fields);
    streams
}

/// Merge `from` into `into`, unioning fields of streams with the same name.
pub fn merge_describe(into: &mut DescribeCollect, from: DescribeCollect) {
    for (stream, fields) in from {
        into.entry(stream).or_default().extend(fields);
    }
}

/// Stream of `describe` whose fields contain every field of `point`.
pub fn stream_for<'a>(describe: &'a DescribeCollect, point: &CollectPoint) -> Option<&'a str> {
    describe
        .iter()
        .find(|(_, fields)| point.data.keys().all(|k| fields.contains_key(k)))
        .map(|(stream, _)| stream.as_str())
}

// =============================================================================
// Run documents
// =============================================================================

/// Document types for a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Document {
    /// Run start - intent and metadata
    Start(StartDoc),
    /// Stream schema
    Descriptor(DescriptorDoc),
    /// Collected point
    Event(EventDoc),
    /// Run stop - completion status
    Stop(StopDoc),
    /// File registration
    Resource(Resource),
    /// Slice reference
    Datum(Datum),
}

impl Document {
    /// Wrap an asset document for a run.
    pub fn from_asset(run_uid: &str, doc: AssetDoc) -> Self {
        match doc {
            AssetDoc::Resource(mut resource) => {
                resource.run_start = Some(run_uid.to_string());
                Document::Resource(resource)
            }
            AssetDoc::Datum(datum) => Document::Datum(datum),
        }
    }

    /// Document type name.
    pub fn kind(&self) -> &'static str {
        match self {
            Document::Start(_) => "start",
            Document::Descriptor(_) => "descriptor",
            Document::Event(_) => "event",
            Document::Stop(_) => "stop",
            Document::Resource(_) => "resource",
            Document::Datum(_) => "datum",
        }
    }
}

/// Run start document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartDoc {
    /// Run uid
    pub uid: String,
    /// Start time (ns)
    pub time_ns: u64,
    /// Plan type, e.g. `fly_scan`
    pub plan_type: String,
    /// Plan name, e.g. `fly_scan_with_apb`
    pub plan_name: String,
    /// Plan arguments
    pub plan_args: BTreeMap<String, String>,
    /// Scan metadata
    pub metadata: BTreeMap<String, Value>,
}

impl StartDoc {
    /// New start document with a fresh uid.
    pub fn new(plan_type: &str, plan_name: &str) -> Self {
        Self {
            uid: new_uid(),
            time_ns: now_ns(),
            plan_type: plan_type.to_string(),
            plan_name: plan_name.to_string(),
            plan_args: BTreeMap::new(),
            metadata: BTreeMap::new(),
        }
    }
}

/// Stream descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DescriptorDoc {
    /// Descriptor uid
    pub uid: String,
    /// Run uid
    pub run_uid: String,
    /// Stream name
    pub name: String,
    /// Field schemas
    pub data_keys: BTreeMap<String, DataKey>,
    /// Creation time (ns)
    pub time_ns: u64,
}

impl DescriptorDoc {
    /// New descriptor for `stream`.
    pub fn new(run_uid: &str, stream: &str, data_keys: BTreeMap<String, DataKey>) -> Self {
        Self {
            uid: new_uid(),
            run_uid: run_uid.to_string(),
            name: stream.to_string(),
            data_keys,
            time_ns: now_ns(),
        }
    }
}

/// One event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventDoc {
    /// Event uid
    pub uid: String,
    /// Run uid
    pub run_uid: String,
    /// Descriptor uid
    pub descriptor_uid: String,
    /// Sequence number within the stream, starting at 1
    pub seq_num: u32,
    /// Event time (s)
    pub time: f64,
    /// Field values
    pub data: BTreeMap<String, Value>,
    /// Field timestamps
    pub timestamps: BTreeMap<String, f64>,
    /// Whether external fields are filled
    pub filled: BTreeMap<String, bool>,
}

impl EventDoc {
    /// Event from a collected point.
    pub fn from_point(
        run_uid: &str,
        descriptor_uid: &str,
        seq_num: u32,
        point: CollectPoint,
    ) -> Self {
        Self {
            uid: new_uid(),
            run_uid: run_uid.to_string(),
            descriptor_uid: descriptor_uid.to_string(),
            seq_num,
            time: point.time,
            data: point.data,
            timestamps: point.timestamps,
            filled: point.filled,
        }
    }
}

/// Run stop document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopDoc {
    /// Stop uid
    pub uid: String,
    /// Run uid
    pub run_uid: String,
    /// `success`, `abort` or `fail`
    pub exit_status: String,
    /// Reason for abort/fail
    pub reason: String,
    /// Events emitted during the run
    pub num_events: u32,
    /// Stop time (ns)
    pub time_ns: u64,
}

impl StopDoc {
    fn with_status(run_uid: &str, exit_status: &str, reason: &str, num_events: u32) -> Self {
        Self {
            uid: new_uid(),
            run_uid: run_uid.to_string(),
            exit_status: exit_status.to_string(),
            reason: reason.to_string(),
            num_events,
            time_ns: now_ns(),
        }
    }

    /// Successful run
    pub fn success(run_uid: &str, num_events: u32) -> Self {
        Self::with_status(run_uid, "success", "", num_events)
    }

    /// Aborted run
    pub fn abort(run_uid: &str, reason: &str, num_events: u32) -> Self {
        Self::with_status(run_uid, "abort", reason, num_events)
    }

    /// Failed run
    pub fn fail(run_uid: &str, reason: &str, num_events: u32) -> Self {
        Self::with_status(run_uid, "fail", reason, num_events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datum_ids_are_resource_scoped() {
        let resource = Resource::new("APB", "/data", "/data/raw/apb/x.bin", Kwargs::new());
        let datum = Datum::numbered(&resource, 3, Kwargs::new());
        assert_eq!(datum.datum_id, format!("{}/3", resource.uid));
        assert_eq!(datum.resource, resource.uid);
    }

    #[test]
    fn asset_queue_drains_once() {
        let queue = AssetQueue::new();
        let resource = Resource::new("APB", "/", "a.bin", Kwargs::new());
        queue.push(AssetDoc::Datum(Datum::numbered(&resource, 0, Kwargs::new())));
        queue.push(AssetDoc::Resource(resource));
        let first = queue.drain();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].kind(), "datum");
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn asset_docs_serialise_as_named_pairs() {
        let resource = Resource::new("APB", "/", "a.bin", Kwargs::new());
        let doc = AssetDoc::Resource(resource);
        let json = serde_json::to_value(&doc).unwrap();
        assert!(json.is_array());
        assert_eq!(json.as_array().map(Vec::len), Some(2));
        assert_eq!(json[0], "resource");
        assert_eq!(json[1]["spec"], "APB");
        assert!(json[1].get("run_start").is_none());
        assert_eq!(serde_json::from_value::<AssetDoc>(json).unwrap(), doc);

        let bad = serde_json::json!(["event", {}]);
        assert!(serde_json::from_value::<AssetDoc>(bad).is_err());
    }

    #[test]
    fn points_are_routed_to_the_stream_that_describes_them() {
        let mut describe = describe_single(
            "apb_stream",
            DataKey::external_array("APB", vec![-1, -1]),
        );
        merge_describe(
            &mut describe,
            describe_single("pb9_enc1", DataKey::external_array("pizzabox-enc-file", vec![1024, 5])),
        );
        let point = CollectPoint::reference("pb9_enc1", "abc/0", 1.0);
        assert_eq!(stream_for(&describe, &point), Some("pb9_enc1"));
        let data_key = &describe["apb_stream"]["apb_stream"];
        assert_eq!(data_key.external.as_deref(), Some("FILESTORE:"));
    }
}
