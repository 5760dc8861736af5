//! Task definitions as loosely-typed nested documents.
//!
//! A task definition is an arbitrary JSON object (model settings, dataset settings
//! with named segments, record settings). Key order is preserved through storage
//! so that path-based key and filter functions see what was submitted.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::ids::TaskFingerprint;
use super::segment::Segment;
use crate::error::{CoreError, Result};

/// Path of the named dataset segments inside a task definition.
pub const SEGMENTS_PATH: &str = "dataset.kwargs.segments";

/// Path of the data handler's end date inside a task definition.
pub const HANDLER_END_PATH: &str = "dataset.kwargs.handler.kwargs.end_time";

/// Path of the model class name inside a task definition.
pub const MODEL_CLASS_PATH: &str = "model.class";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct TaskDefinition(Value);

impl TaskDefinition {
    pub fn new(value: Value) -> Result<Self> {
        if !value.is_object() {
            return Err(CoreError::Validation(
                "task definition must be a JSON object".to_string(),
            ));
        }
        Ok(Self(value))
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    /// Look up a dot-separated path. Numeric components index into arrays.
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        path.split('.')
            .filter(|part| !part.is_empty())
            .try_fold(&self.0, |current, part| match current {
                Value::Object(map) => map.get(part),
                Value::Array(items) => part.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            })
    }

    pub fn lookup_str(&self, path: &str) -> Option<&str> {
        self.lookup(path).and_then(Value::as_str)
    }

    /// Set a value at a dot-separated path, creating intermediate objects.
    pub fn set(&mut self, path: &str, value: Value) -> Result<()> {
        let parts: Vec<&str> = path.split('.').filter(|p| !p.is_empty()).collect();
        let Some((last, parents)) = parts.split_last() else {
            return Err(CoreError::Validation("empty path".to_string()));
        };

        let mut current = &mut self.0;
        for part in parents {
            let map = current.as_object_mut().ok_or_else(|| {
                CoreError::Validation(format!("'{}' in path '{}' is not an object", part, path))
            })?;
            current = map
                .entry(part.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
        }

        let map = current.as_object_mut().ok_or_else(|| {
            CoreError::Validation(format!("parent of '{}' in path '{}' is not an object", last, path))
        })?;
        map.insert(last.to_string(), value);
        Ok(())
    }

    /// Read a named dataset segment such as `train`, `valid` or `test`.
    pub fn segment(&self, name: &str) -> Result<Option<Segment>> {
        match self.lookup(&format!("{}.{}", SEGMENTS_PATH, name)) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value.clone()).map(Some).map_err(|e| {
                CoreError::Validation(format!("segment '{}' is malformed: {}", name, e))
            }),
        }
    }

    pub fn set_segment(&mut self, name: &str, segment: Segment) -> Result<()> {
        self.set(
            &format!("{}.{}", SEGMENTS_PATH, name),
            serde_json::to_value(segment)?,
        )
    }

    /// Segment names in document order.
    pub fn segment_names(&self) -> Vec<String> {
        match self.lookup(SEGMENTS_PATH) {
            Some(Value::Object(map)) => map.keys().cloned().collect(),
            _ => Vec::new(),
        }
    }

    pub fn model_class(&self) -> Option<&str> {
        self.lookup_str(MODEL_CLASS_PATH)
    }

    /// Stable content identity of this definition, independent of key order.
    pub fn fingerprint(&self) -> TaskFingerprint {
        let mut buf = Vec::new();
        write_canonical(&self.0, &mut buf);
        TaskFingerprint::from_bytes(&buf)
    }
}

impl TryFrom<Value> for TaskDefinition {
    type Error = CoreError;

    fn try_from(value: Value) -> Result<Self> {
        Self::new(value)
    }
}

impl From<TaskDefinition> for Value {
    fn from(definition: TaskDefinition) -> Self {
        definition.0
    }
}

/// Compact JSON with object keys sorted recursively.
fn write_canonical(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push(b'{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_scalar(&Value::String(key.clone()), out);
                out.push(b':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push(b'}');
        }
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_canonical(item, out);
            }
            out.push(b']');
        }
        scalar => write_scalar(scalar, out),
    }
}

fn write_scalar(value: &Value, out: &mut Vec<u8>) {
    // serializing a scalar Value cannot fail
    if let Ok(bytes) = serde_json::to_vec(value) {
        out.extend_from_slice(&bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn sample() -> TaskDefinition {
        TaskDefinition::new(json!({
            "model": {"class": "LGBModel", "module_path": "models.gbdt"},
            "dataset": {
                "class": "DatasetH",
                "kwargs": {
                    "handler": {"kwargs": {"end_time": "2020-08-01"}},
                    "segments": {
                        "train": ["2008-01-01", "2014-12-31"],
                        "valid": ["2015-01-01", "2016-12-31"],
                        "test": ["2017-01-01", "2020-08-01"]
                    }
                }
            },
            "record": [{"class": "SignalRecord"}]
        }))
        .unwrap()
    }

    #[test]
    fn test_rejects_non_object_root() {
        assert!(TaskDefinition::new(json!([1, 2, 3])).is_err());
        assert!(TaskDefinition::new(json!("model")).is_err());
    }

    #[test]
    fn test_lookup_paths() {
        let task = sample();
        assert_eq!(task.model_class(), Some("LGBModel"));
        assert_eq!(task.lookup_str("record.0.class"), Some("SignalRecord"));
        assert!(task.lookup("record.7.class").is_none());
        assert!(task.lookup("model.class.deeper").is_none());
        assert!(task.lookup("missing.path").is_none());
    }

    #[test]
    fn test_segments_read_and_write() {
        let mut task = sample();
        assert_eq!(task.segment_names(), vec!["train", "valid", "test"]);
        assert_eq!(
            task.segment("test").unwrap(),
            Some(Segment::parse("2017-01-01", "2020-08-01").unwrap())
        );
        assert_eq!(task.segment("holdout").unwrap(), None);

        let new_test = Segment::parse("2017-01-01", "2017-03-31").unwrap();
        task.set_segment("test", new_test).unwrap();
        assert_eq!(task.segment("test").unwrap(), Some(new_test));
        // order of existing keys is kept on overwrite
        assert_eq!(task.segment_names(), vec!["train", "valid", "test"]);
    }

    #[test]
    fn test_malformed_segment_is_an_error() {
        let mut task = sample();
        task.set("dataset.kwargs.segments.test", json!("2017")).unwrap();
        assert!(task.segment("test").is_err());
    }

    #[test]
    fn test_set_through_scalar_fails() {
        let mut task = sample();
        assert!(task.set("model.class.inner", json!(1)).is_err());
        task.set("extra.nested.flag", json!(true)).unwrap();
        assert_eq!(task.lookup("extra.nested.flag"), Some(&json!(true)));
    }

    #[test]
    fn test_fingerprint_ignores_key_order() {
        let a = TaskDefinition::new(json!({"a": 1, "b": {"x": [1, 2], "y": "z"}})).unwrap();
        let b = TaskDefinition::new(json!({"b": {"y": "z", "x": [1, 2]}, "a": 1})).unwrap();
        let c = TaskDefinition::new(json!({"a": 1, "b": {"x": [2, 1], "y": "z"}})).unwrap();

        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn test_round_trip_preserves_key_order() {
        let task = sample();
        let text = serde_json::to_string(&task).unwrap();
        let back: TaskDefinition = serde_json::from_str(&text).unwrap();
        assert_eq!(serde_json::to_string(&back).unwrap(), text);
        assert!(text.find("\"model\"").unwrap() < text.find("\"dataset\"").unwrap());
    }
}
