//! Execution protocol: request/response messages and the context-variable mapping.
//!
//! Wire shapes (one JSON object each):
//! - request: `{ "id", "code", "packages"?: [string], ...contextVariables }`
//! - response: `{ "id", "result"?, "stdout"?, "stderr"?, "files"? }`

use std::fmt;
use std::hash::{Hash, Hasher};

use base64::Engine as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::error::ProtocolError;

pub mod capture;
pub mod python;

pub use capture::{OutputCapture, Stream};

/// Keys owned by the protocol itself; context variables may not use them.
pub const RESERVED_KEYS: &[&str] = &["id", "code", "packages"];

/// Opaque correlation token, echoed back unmodified.
///
/// Any JSON value except `null` is accepted: strings, integers of any size,
/// floats, booleans, even arrays or objects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct RequestId(Value);

impl RequestId {
    pub fn generate() -> Self {
        Self(Value::String(uuid::Uuid::new_v4().to_string()))
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }
}

impl<'de> Deserialize<'de> for RequestId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Value::deserialize(deserializer)? {
            Value::Null => Err(serde::de::Error::custom("request id must not be null")),
            value => Ok(Self(value)),
        }
    }
}

// `Value` has no `Hash`; its serialization is canonical (sorted object keys),
// so equal ids hash equally.
impl Hash for RequestId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.to_string().hash(state);
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Value::String(s) => f.write_str(s),
            other => write!(f, "{}", other),
        }
    }
}

impl From<i32> for RequestId {
    fn from(n: i32) -> Self {
        Self(Value::from(n))
    }
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self(Value::from(n))
    }
}

impl From<u64> for RequestId {
    fn from(n: u64) -> Self {
        Self(Value::from(n))
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(Value::String(s.to_string()))
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self(Value::String(s))
    }
}

/// Host-supplied values bound into the runtime's globals for one execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextVars(Map<String, Value>);

impl ContextVars {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `name` to `value`, replacing any earlier binding of the same name.
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        value: impl Into<Value>,
    ) -> Result<Option<Value>, ProtocolError> {
        let name = name.into();
        if RESERVED_KEYS.contains(&name.as_str()) {
            return Err(ProtocolError::ReservedKey(name));
        }
        Ok(self.0.insert(name, value.into()))
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }
}

impl TryFrom<Map<String, Value>> for ContextVars {
    type Error = ProtocolError;

    fn try_from(map: Map<String, Value>) -> Result<Self, Self::Error> {
        let mut vars = Self::new();
        for (name, value) in map {
            vars.insert(name, value)?;
        }
        Ok(vars)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub id: RequestId,
    pub code: String,
    /// Installed in order before the code runs.
    #[serde(
        default,
        deserialize_with = "null_as_empty",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub packages: Vec<String>,
    // Reserved keys are consumed by the named fields above, so whatever lands
    // here on deserialization is already a valid context mapping.
    #[serde(flatten)]
    context: ContextVars,
}

impl ExecutionRequest {
    pub fn new(id: impl Into<RequestId>, code: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            code: code.into(),
            packages: Vec::new(),
            context: ContextVars::new(),
        }
    }

    pub fn with_packages<I, S>(mut self, packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.packages = packages.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_var(
        mut self,
        name: impl Into<String>,
        value: impl Into<Value>,
    ) -> Result<Self, ProtocolError> {
        self.context.insert(name, value)?;
        Ok(self)
    }

    pub fn context(&self) -> &ContextVars {
        &self.context
    }

    pub fn into_parts(self) -> (RequestId, String, Vec<String>, ContextVars) {
        (self.id, self.code, self.packages, self.context)
    }

    /// Parse one request message.
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)?;
        if !value.is_object() {
            return Err(ProtocolError::NotAnObject);
        }
        Ok(serde_json::from_value(value)?)
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

/// A file the executed code left in the runtime's data directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFile {
    pub name: String,
    /// Base64 (standard alphabet) file content.
    pub data: String,
    pub size: u64,
}

impl OutputFile {
    pub fn from_bytes(name: impl Into<String>, bytes: &[u8]) -> Self {
        Self {
            name: name.into(),
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
            size: bytes.len() as u64,
        }
    }

    pub fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
        base64::engine::general_purpose::STANDARD.decode(&self.data)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub id: RequestId,
    /// Value of the final expression, if the code ended with one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<OutputFile>>,
}

impl ExecutionResult {
    pub fn failed(id: RequestId, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            stdout: None,
            stderr: Some(message.into()),
            files: None,
        }
    }

    /// A present `stderr` marks partial or total failure.
    pub fn is_success(&self) -> bool {
        self.stderr.is_none()
    }

    pub fn to_json(&self) -> String {
        // Only string keys and JSON values inside; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| String::from("{}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn context_variables_are_flattened_beside_reserved_fields() {
        let req = ExecutionRequest::from_json(
            r#"{"id":"a1","code":"x + 1","packages":["numpy"],"x":5,"label":"hi"}"#,
        )
        .unwrap();
        assert_eq!(req.id, RequestId::from("a1"));
        assert_eq!(req.packages, vec!["numpy".to_string()]);
        assert_eq!(req.context().len(), 2);
        assert_eq!(req.context().get("x"), Some(&json!(5)));
        assert!(req.context().get("code").is_none());
    }

    #[test]
    fn numeric_ids_round_trip_unchanged() {
        let req = ExecutionRequest::from_json(r#"{"id":42,"code":"pass"}"#).unwrap();
        assert_eq!(req.id, RequestId::from(42));
        let out = ExecutionResult::failed(req.id.clone(), "boom").to_json();
        let back: Value = serde_json::from_str(&out).unwrap();
        assert_eq!(back["id"], json!(42));
    }

    #[test]
    fn any_non_null_id_is_echoed_verbatim() {
        for raw in ["18446744073709551615", "1.5", "true", "-7", "[1,\"a\"]"] {
            let text = format!(r#"{{"id":{},"code":"1"}}"#, raw);
            let req = ExecutionRequest::from_json(&text).unwrap();
            let expected: Value = serde_json::from_str(raw).unwrap();
            assert_eq!(req.id.as_value(), &expected);

            let out: Value = serde_json::from_str(&ExecutionResult::failed(req.id, "x").to_json()).unwrap();
            assert_eq!(out["id"], expected);
        }
        assert_eq!(ExecutionRequest::from_json(r#"{"id":18446744073709551615,"code":"1"}"#).unwrap().id, RequestId::from(u64::MAX));
    }

    #[test]
    fn null_id_is_rejected() {
        let err = ExecutionRequest::from_json(r#"{"id":null,"code":"1"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn ids_of_different_json_types_are_distinct() {
        use std::collections::HashSet;
        let ids: HashSet<RequestId> = ["1", "\"1\"", "1.0", "true"]
            .iter()
            .map(|raw| serde_json::from_str(raw).unwrap())
            .collect();
        assert_eq!(ids.len(), 4);
    }

    #[test]
    fn null_packages_mean_none() {
        let req = ExecutionRequest::from_json(r#"{"id":"x","code":"","packages":null}"#).unwrap();
        assert!(req.packages.is_empty());
    }

    #[test]
    fn missing_code_is_rejected() {
        let err = ExecutionRequest::from_json(r#"{"id":"x"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
        let err = ExecutionRequest::from_json("[1,2]").unwrap_err();
        assert!(matches!(err, ProtocolError::NotAnObject));
    }

    #[test]
    fn reserved_keys_cannot_be_injected() {
        for key in RESERVED_KEYS {
            let err = ExecutionRequest::new("r", "pass").with_var(*key, 1).unwrap_err();
            assert!(matches!(err, ProtocolError::ReservedKey(ref k) if k == key));
        }
        let mut map = Map::new();
        map.insert("code".into(), json!("print(1)"));
        assert!(ContextVars::try_from(map).is_err());
    }

    #[test]
    fn later_binding_overwrites_earlier() {
        let mut vars = ContextVars::new();
        assert_eq!(vars.insert("x", 1).unwrap(), None);
        assert_eq!(vars.insert("x", 2).unwrap(), Some(json!(1)));
        assert_eq!(vars.get("x"), Some(&json!(2)));
    }

    #[test]
    fn absent_fields_are_omitted_from_responses() {
        let result = ExecutionResult {
            id: RequestId::from("r"),
            result: None,
            stdout: Some("hi".into()),
            stderr: None,
            files: None,
        };
        let value: Value = serde_json::from_str(&result.to_json()).unwrap();
        assert_eq!(value, json!({"id": "r", "stdout": "hi"}));
    }

    #[test]
    fn output_files_carry_base64_content() {
        let file = OutputFile::from_bytes("plot.csv", b"a,b\n1,2\n");
        assert_eq!(file.size, 8);
        assert_eq!(file.decode().unwrap(), b"a,b\n1,2\n");
    }
}
