use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{JsonObject, ProgressToken};

pub const META_KEY: &str = "_meta";

/// The `params._meta` subtree.
///
/// The session splices this out of inbound params and into outbound params;
/// handlers see the rest of `params` untouched. Members this crate does not
/// interpret are preserved verbatim in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    #[serde(
        rename = "progressToken",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub progress_token: Option<ProgressToken>,
    #[serde(rename = "traceparent", default, skip_serializing_if = "Option::is_none")]
    pub trace_parent: Option<String>,
    #[serde(rename = "tracestate", default, skip_serializing_if = "Option::is_none")]
    pub trace_state: Option<String>,
    #[serde(flatten)]
    pub extra: JsonObject,
}

impl Meta {
    pub fn is_empty(&self) -> bool {
        self.progress_token.is_none()
            && self.trace_parent.is_none()
            && self.trace_state.is_none()
            && self.extra.is_empty()
    }

    /// Remove `_meta` from a params value and parse it.
    ///
    /// A malformed `_meta` member is dropped rather than failing the whole
    /// message.
    pub fn extract(params: &mut Option<Value>) -> Meta {
        let Some(Value::Object(map)) = params.as_mut() else {
            return Meta::default();
        };
        let Some(meta_value) = map.remove(META_KEY) else {
            return Meta::default();
        };
        match serde_json::from_value(meta_value) {
            Ok(meta) => meta,
            Err(error) => {
                tracing::debug!(%error, "discarding malformed _meta");
                Meta::default()
            }
        }
    }

    /// Write this meta into a params value, creating the object if needed.
    ///
    /// An empty meta leaves `params` untouched, so messages without meta
    /// serialize without an `_meta` member.
    pub fn inject(&self, params: &mut Option<Value>) {
        if self.is_empty() {
            return;
        }
        let meta_value = match serde_json::to_value(self) {
            Ok(value) => value,
            Err(error) => {
                tracing::debug!(%error, "failed to serialize _meta");
                return;
            }
        };
        match params {
            Some(Value::Object(map)) => {
                map.insert(META_KEY.to_string(), meta_value);
            }
            Some(_) => {
                // params is a non-object value, nowhere to put _meta
                tracing::debug!("cannot inject _meta into non-object params");
            }
            None => {
                let mut map = JsonObject::new();
                map.insert(META_KEY.to_string(), meta_value);
                *params = Some(Value::Object(map));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::model::NumberOrString;

    #[test]
    fn test_extract_removes_meta_from_params() {
        let mut params = Some(json!({
            "name": "echo",
            "_meta": {"progressToken": "tok-1", "traceparent": "00-abc-def-01"}
        }));
        let meta = Meta::extract(&mut params);
        assert_eq!(
            meta.progress_token,
            Some(ProgressToken(NumberOrString::String("tok-1".into())))
        );
        assert_eq!(meta.trace_parent.as_deref(), Some("00-abc-def-01"));
        assert_eq!(params, Some(json!({"name": "echo"})));
    }

    #[test]
    fn test_extract_without_meta() {
        let mut params = Some(json!({"name": "echo"}));
        let meta = Meta::extract(&mut params);
        assert!(meta.is_empty());
        assert_eq!(params, Some(json!({"name": "echo"})));
    }

    #[test]
    fn test_inject_creates_params_object() {
        let meta = Meta {
            progress_token: Some(ProgressToken(NumberOrString::Number(3))),
            ..Default::default()
        };
        let mut params = None;
        meta.inject(&mut params);
        assert_eq!(params, Some(json!({"_meta": {"progressToken": 3}})));
    }

    #[test]
    fn test_inject_empty_meta_is_a_no_op() {
        let mut params = Some(json!({"name": "echo"}));
        Meta::default().inject(&mut params);
        assert_eq!(params, Some(json!({"name": "echo"})));
    }

    #[test]
    fn test_unknown_meta_members_round_trip() {
        let mut params = Some(json!({"_meta": {"custom": {"a": 1}, "progressToken": 5}}));
        let meta = Meta::extract(&mut params);
        assert_eq!(meta.extra.get("custom"), Some(&json!({"a": 1})));

        let mut out = None;
        meta.inject(&mut out);
        assert_eq!(
            out,
            Some(json!({"_meta": {"progressToken": 5, "custom": {"a": 1}}}))
        );
    }
}
