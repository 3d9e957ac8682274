use std::collections::{HashMap, HashSet};

use log::debug;

use oxiformer_module::sharding::{builtin_axis_rules, global_mesh_resource};
use oxiformer_module::{LogicalAxisRule, LogicalRules, MeshAxes, MeshResource, ShardingError, ShardingResult};

/// Append the library's built-in logical axis rules to user `rules`,
/// resolved against the global mesh resource.
///
/// The given rules come first and keep their order. A built-in axis the user
/// already maps must be mapped once, to the same mesh axes.
pub fn extend_logical_axis_rules(rules: &[LogicalAxisRule]) -> ShardingResult<LogicalRules> {
    extend_logical_axis_rules_with(rules, &global_mesh_resource())
}

/// [`extend_logical_axis_rules`] against an explicit mesh resource.
pub fn extend_logical_axis_rules_with(
    rules: &[LogicalAxisRule],
    resource: &MeshResource,
) -> ShardingResult<LogicalRules> {
    let mut given: HashMap<&str, Vec<MeshAxes>> = HashMap::new();
    for rule in rules {
        if let MeshAxes::Axes(_) = rule.mesh {
            return Err(ShardingError::InvalidRule {
                logical: rule.logical.clone(),
                mesh: rule.mesh.clone(),
            });
        }
        given
            .entry(rule.logical.as_str())
            .or_default()
            .push(rule.mesh.clone());
    }

    let builtin = builtin_axis_rules(resource);
    let mut extended = rules.to_vec();
    let mut appended: HashSet<&str> = HashSet::new();
    for rule in &builtin {
        match given.get(rule.logical.as_str()) {
            Some(meshes) => {
                if meshes.len() != 1 || meshes[0] != rule.mesh {
                    return Err(ShardingError::DivergedRule {
                        axis: rule.logical.clone(),
                        given: meshes.clone(),
                        builtin: rule.mesh.clone(),
                    });
                }
            }
            None => {
                if appended.insert(rule.logical.as_str()) {
                    extended.push(rule.clone());
                }
            }
        }
    }

    debug!(
        "extended {} logical axis rules to {}",
        rules.len(),
        extended.len()
    );
    Ok(extended)
}

#[cfg(test)]
mod tests {
    use super::*;
    use oxiformer_module::sharding::{BATCH_AXES, HEAD_AXES, HIDDEN_AXES, W_TP_AXES};

    fn tp_mesh() -> MeshResource {
        MeshResource {
            dp_resource: Some("data".to_string()),
            tp_resource: Some("model".to_string()),
            ..MeshResource::default()
        }
    }

    #[test]
    fn test_user_rules_first_then_builtins() {
        let rules: LogicalRules = vec![("embed", Some("data")).into(), ("mlp", None).into()];
        let extended = extend_logical_axis_rules_with(&rules, &tp_mesh()).unwrap();
        assert_eq!(&extended[..2], rules.as_slice());
        assert_eq!(extended.len(), 2 + 12);
        let head = extended.iter().find(|r| r.logical == HEAD_AXES).unwrap();
        assert_eq!(head.mesh, MeshAxes::Axis("model".to_string()));
    }

    #[test]
    fn test_empty_rules_are_builtins() {
        let extended = extend_logical_axis_rules_with(&[], &MeshResource::default()).unwrap();
        assert_eq!(extended, builtin_axis_rules(&MeshResource::default()));
    }

    #[test]
    fn test_matching_builtin_override_is_kept_once() {
        let rules: LogicalRules = vec![(HIDDEN_AXES, None).into(), (W_TP_AXES, Some("model")).into()];
        let extended = extend_logical_axis_rules_with(&rules, &tp_mesh()).unwrap();
        assert_eq!(extended.len(), 12);
        assert_eq!(extended.iter().filter(|r| r.logical == HIDDEN_AXES).count(), 1);
        assert_eq!(extended[0].logical, HIDDEN_AXES);
    }

    #[test]
    fn test_diverging_rule_is_rejected() {
        let rules: LogicalRules = vec![(BATCH_AXES, Some("model")).into()];
        let err = extend_logical_axis_rules_with(&rules, &tp_mesh()).unwrap_err();
        assert!(matches!(err, ShardingError::DivergedRule { ref axis, .. } if axis == BATCH_AXES));

        let twice: LogicalRules = vec![(HEAD_AXES, Some("model")).into(), (HEAD_AXES, Some("model")).into()];
        assert!(extend_logical_axis_rules_with(&twice, &tp_mesh()).is_err());
    }

    #[test]
    fn test_multi_axis_rule_is_invalid() {
        let rules = vec![LogicalAxisRule::new(
            "embed",
            MeshAxes::Axes(vec!["data".to_string(), "model".to_string()]),
        )];
        assert!(matches!(
            extend_logical_axis_rules_with(&rules, &tp_mesh()),
            Err(ShardingError::InvalidRule { .. })
        ));
    }

    #[test]
    fn test_idempotent_on_own_output() {
        let rules: LogicalRules = vec![("embed", Some("data")).into()];
        let once = extend_logical_axis_rules_with(&rules, &tp_mesh()).unwrap();
        let twice = extend_logical_axis_rules_with(&once, &tp_mesh()).unwrap();
        assert_eq!(once, twice);
    }
}
