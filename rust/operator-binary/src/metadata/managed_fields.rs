//! Decodes `metadata.managedFields` to find out which Secret fields a field manager owns.

use std::collections::BTreeSet;

use serde_json::{Map, Value};
use snafu::{OptionExt as _, ResultExt as _, Snafu};
use stackable_operator::k8s_openapi::api::core::v1::Secret;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("managed fields entry for {manager:?} has unsupported type {fields_type:?}"))]
    UnsupportedFieldsType {
        manager: String,
        fields_type: String,
    },

    #[snafu(display("managed fields entry for {manager:?} is not an object at {path}"))]
    NotAnObject { manager: String, path: String },

    #[snafu(display("managed fields entry for {manager:?} has malformed key {key:?}"))]
    MalformedKey { manager: String, key: String },

    #[snafu(display("managed fields entry for {manager:?} has malformed owner reference key {key:?}"))]
    MalformedOwnerReference {
        source: serde_json::Error,
        manager: String,
        key: String,
    },
}
type Result<T, E = Error> = std::result::Result<T, E>;

/// The Secret fields owned by a single field manager, merged across all of its entries.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ManagedFields {
    pub labels: BTreeSet<String>,
    pub annotations: BTreeSet<String>,
    /// UIDs of the owned `metadata.ownerReferences` entries.
    pub owner_reference_uids: BTreeSet<String>,
    pub data: BTreeSet<String>,
}

impl ManagedFields {
    pub fn for_manager(secret: &Secret, manager: &str) -> Result<Self> {
        let mut managed = Self::default();
        for entry in secret
            .metadata
            .managed_fields
            .iter()
            .flatten()
            .filter(|entry| entry.manager.as_deref() == Some(manager))
        {
            if let Some(fields_type) = entry
                .fields_type
                .as_deref()
                .filter(|fields_type| *fields_type != "FieldsV1")
            {
                return UnsupportedFieldsTypeSnafu {
                    manager,
                    fields_type,
                }
                .fail();
            }
            let Some(fields) = &entry.fields_v1 else {
                continue;
            };
            managed.merge(manager, &fields.0)?;
        }
        Ok(managed)
    }

    fn merge(&mut self, manager: &str, fields: &Value) -> Result<()> {
        let root = as_object(manager, fields, "")?;
        if let Some(metadata) = root.get("f:metadata") {
            let metadata = as_object(manager, metadata, "f:metadata")?;
            if let Some(labels) = metadata.get("f:labels") {
                self.labels
                    .extend(field_names(manager, labels, "f:metadata.f:labels")?);
            }
            if let Some(annotations) = metadata.get("f:annotations") {
                self.annotations.extend(field_names(
                    manager,
                    annotations,
                    "f:metadata.f:annotations",
                )?);
            }
            if let Some(owner_refs) = metadata.get("f:ownerReferences") {
                let owner_refs = as_object(manager, owner_refs, "f:metadata.f:ownerReferences")?;
                for key in owner_refs.keys().filter(|key| *key != ".") {
                    let selector = key
                        .strip_prefix("k:")
                        .context(MalformedKeySnafu { manager, key })?;
                    let selector: Map<String, Value> = serde_json::from_str(selector)
                        .context(MalformedOwnerReferenceSnafu { manager, key })?;
                    let uid = selector
                        .get("uid")
                        .and_then(Value::as_str)
                        .context(MalformedKeySnafu { manager, key })?;
                    self.owner_reference_uids.insert(uid.to_string());
                }
            }
        }
        if let Some(data) = root.get("f:data") {
            self.data.extend(field_names(manager, data, "f:data")?);
        }
        Ok(())
    }
}

fn as_object<'a>(manager: &str, value: &'a Value, path: &str) -> Result<&'a Map<String, Value>> {
    value.as_object().context(NotAnObjectSnafu { manager, path })
}

/// The names of the `f:<name>` children of a map field.
fn field_names(manager: &str, value: &Value, path: &str) -> Result<Vec<String>> {
    as_object(manager, value, path)?
        .keys()
        .filter(|key| *key != ".")
        .map(|key| {
            key.strip_prefix("f:")
                .map(str::to_string)
                .context(MalformedKeySnafu { manager, key })
        })
        .collect()
}
