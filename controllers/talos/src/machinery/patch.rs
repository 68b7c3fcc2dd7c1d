//! Config patches
//!
//! Patches are YAML documents merged onto a machine configuration with JSON
//! merge patch semantics (RFC 7396): mappings merge recursively, `null`
//! removes a key, everything else replaces.

use serde_yaml::{Mapping, Value};

use crate::error::ControllerError;

/// Merge `patch` into `target`
pub fn merge(target: &mut Value, patch: &Value) {
    let Value::Mapping(patch_map) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_mapping() {
        *target = Value::Mapping(Mapping::new());
    }
    if let Value::Mapping(target_map) = target {
        for (key, value) in patch_map {
            if value.is_null() {
                target_map.remove(key);
            } else {
                let slot = target_map.entry(key.clone()).or_insert(Value::Null);
                merge(slot, value);
            }
        }
    }
}

/// Apply every patch, in order, to a YAML document
///
/// Returns the document unchanged when there are no patches.
pub fn apply_patches(document: &str, patches: &[String]) -> Result<String, ControllerError> {
    if patches.iter().all(|p| p.trim().is_empty()) {
        return Ok(document.to_string());
    }

    let mut value: Value = serde_yaml::from_str(document)?;
    for (index, raw) in patches.iter().enumerate() {
        if raw.trim().is_empty() {
            continue;
        }
        let patch: Value = serde_yaml::from_str(raw)
            .map_err(|e| ControllerError::Render(format!("config patch {index} is not valid YAML: {e}")))?;
        if !patch.is_mapping() {
            return Err(ControllerError::Render(format!("config patch {index} must be a mapping")));
        }
        merge(&mut value, &patch);
    }
    Ok(serde_yaml::to_string(&value)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yaml(text: &str) -> Value {
        serde_yaml::from_str(text).unwrap()
    }

    #[test]
    fn test_merge_recurses_and_removes() {
        let mut target = yaml("machine:\n  install:\n    disk: /dev/sda\n    wipe: false\n  network: {}\n");
        merge(
            &mut target,
            &yaml("machine:\n  install:\n    disk: /dev/nvme0n1\n    wipe: null\n  network:\n    hostname: cp-1\n"),
        );
        assert_eq!(
            target,
            yaml("machine:\n  install:\n    disk: /dev/nvme0n1\n  network:\n    hostname: cp-1\n")
        );
    }

    #[test]
    fn test_merge_replaces_sequences() {
        let mut target = yaml("cluster:\n  network:\n    podSubnets: [10.244.0.0/16]\n");
        merge(&mut target, &yaml("cluster:\n  network:\n    podSubnets: [10.32.0.0/12, fd00::/48]\n"));
        assert_eq!(target["cluster"]["network"]["podSubnets"].as_sequence().map(Vec::len), Some(2));
    }

    #[test]
    fn test_apply_patches_in_order() {
        let document = "machine:\n  type: worker\n";
        let patches = vec![
            "machine:\n  network:\n    hostname: first\n".to_string(),
            "machine:\n  network:\n    hostname: second\n".to_string(),
        ];
        let patched = apply_patches(document, &patches).unwrap();
        assert!(patched.contains("hostname: second"));
        assert!(patched.contains("type: worker"));
        assert_eq!(apply_patches(document, &[]).unwrap(), document);
    }

    #[test]
    fn test_apply_patches_rejects_bad_patch() {
        let err = apply_patches("machine: {}\n", &["- not\n- a mapping\n".to_string()]).unwrap_err();
        assert!(matches!(err, ControllerError::Render(_)));
        let err = apply_patches("machine: {}\n", &["machine: [unclosed\n".to_string()]).unwrap_err();
        assert!(matches!(err, ControllerError::Render(_)));
    }
}
