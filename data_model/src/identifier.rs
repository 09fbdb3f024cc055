//! Deterministic container identity.
//!
//! An identifier is derived from everything that makes two step containers
//! interchangeable: the scope they run in, the step name, the purpose and a
//! hash of the step configuration. The configuration is treated as a mapping,
//! so its hash does not depend on key order.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::{ContainerIdentifier, ContainerPurpose, ContainerScope};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IdentifierError {
    #[error("invalid scope for {purpose} container: {reason}")]
    InvalidScope {
        purpose: ContainerPurpose,
        reason: String,
    },
}

/// Derives the identifier a step with `config` runs under.
///
/// Non-finite floats in `config` become `null` when converted to JSON, so a
/// NaN or infinite value hashes the same as an explicit `null`.
pub fn derive<C>(
    scope: &ContainerScope,
    step_name: &str,
    purpose: ContainerPurpose,
    config: &C,
) -> Result<ContainerIdentifier, IdentifierError>
where
    C: Serialize + ?Sized,
{
    validate_scope(scope, step_name, purpose)?;
    let config = serde_json::to_value(config).map_err(|e| IdentifierError::InvalidScope {
        purpose,
        reason: format!("config is not representable as json: {}", e),
    })?;
    Ok(ContainerIdentifier {
        scope: scope.clone(),
        step_name: step_name.to_string(),
        purpose,
        config_hash: config_hash(&config),
    })
}

fn validate_scope(
    scope: &ContainerScope,
    step_name: &str,
    purpose: ContainerPurpose,
) -> Result<(), IdentifierError> {
    let invalid = |reason: &str| IdentifierError::InvalidScope {
        purpose,
        reason: reason.to_string(),
    };
    if step_name.is_empty() {
        return Err(invalid("step name is empty"));
    }
    match purpose {
        ContainerPurpose::Check => {
            if scope.resource_id.is_none() {
                return Err(invalid("resource id is required"));
            }
        }
        ContainerPurpose::Get | ContainerPurpose::Put | ContainerPurpose::Task => {
            if scope.build_id.is_none() {
                return Err(invalid("build id is required"));
            }
            if scope.plan_id.as_deref().is_none_or(str::is_empty) {
                return Err(invalid("plan id is required"));
            }
        }
    }
    Ok(())
}

pub fn config_hash(config: &Value) -> String {
    let mut canonical = Vec::new();
    write_canonical(config, &mut canonical);
    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    hex::encode(hasher.finalize())
}

// Objects are written with keys sorted, regardless of how the map was built.
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
    // Scalars have exactly one json rendering.
    out.extend_from_slice(value.to_string().as_bytes());
}

impl ContainerIdentifier {
    /// Storage key: hex sha256 over a length-prefixed encoding of every
    /// field, so no two distinct identifiers share a key.
    pub fn key(&self) -> String {
        let mut hasher = Sha256::new();
        let mut field = |bytes: &[u8]| {
            hasher.update((bytes.len() as u64).to_be_bytes());
            hasher.update(bytes);
        };
        field(&self.scope.pipeline_id.to_be_bytes());
        optional_u64(&mut field, self.scope.resource_id);
        optional_u64(&mut field, self.scope.build_id);
        match &self.scope.plan_id {
            Some(plan_id) => {
                field(&[1u8]);
                field(plan_id.as_bytes());
            }
            None => field(&[0u8]),
        }
        field(self.step_name.as_bytes());
        field(self.purpose.as_ref().as_bytes());
        field(self.config_hash.as_bytes());
        hex::encode(hasher.finalize())
    }
}

fn optional_u64(field: &mut impl FnMut(&[u8]), value: Option<u64>) {
    match value {
        Some(v) => {
            field(&[1u8]);
            field(&v.to_be_bytes());
        }
        None => field(&[0u8]),
    }
}
