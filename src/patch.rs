// JSON patch construction for the pod's node selector

use std::collections::BTreeMap;
use std::fmt::Display;
use std::str::FromStr;

use json_patch::{AddOperation, PatchOperation, ReplaceOperation};
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::policy::NodeSelector;

const NODE_SELECTOR_PATH: &str = "/spec/nodeSelector";

/// Builds the single operation that pins a pod to `selector`.
///
/// Returns no operations when the pod already carries the selector.
pub fn build(
    selector: &NodeSelector,
    existing: Option<&BTreeMap<String, String>>,
) -> Result<Vec<PatchOperation>> {
    let existing = existing.filter(|selectors| !selectors.is_empty());
    let key_path = format!("{NODE_SELECTOR_PATH}/{}", escape(&selector.key));
    let value = Value::String(selector.value.clone());

    let operation = match existing.map(|selectors| selectors.get(&selector.key)) {
        None => {
            let mut selectors = Map::new();
            selectors.insert(selector.key.clone(), value);
            PatchOperation::Add(AddOperation {
                path: pointer(NODE_SELECTOR_PATH)?,
                value: Value::Object(selectors),
            })
        }
        Some(None) => PatchOperation::Add(AddOperation {
            path: pointer(&key_path)?,
            value,
        }),
        Some(Some(current)) if *current == selector.value => return Ok(Vec::new()),
        Some(Some(_)) => PatchOperation::Replace(ReplaceOperation {
            path: pointer(&key_path)?,
            value,
        }),
    };

    Ok(vec![operation])
}

fn escape(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

fn pointer<P>(path: &str) -> Result<P>
where
    P: FromStr,
    P::Err: Display,
{
    path.parse()
        .map_err(|error| Error::PatchError(format!("{path}: {error}")))
}
