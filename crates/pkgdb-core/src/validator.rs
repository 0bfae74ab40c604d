//! Manifest validation

use crate::manifest::{GlobalManifest, Manifest};
use crate::resolver::GroupingStrategy;
use crate::types::is_supported_system;
use crate::PkgdbError;
use std::collections::{BTreeMap, BTreeSet};

/// Validation errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// A system outside the supported set
    UnsupportedSystem(String),
    /// A descriptor targets a system the environment does not declare
    UndeclaredSystem { install_id: String, system: String },
    /// A descriptor forces an input the registry does not have
    UnknownInput { install_id: String, input: String },
    /// Members of one group force different inputs
    ConflictingGroupInputs { group: String, inputs: Vec<String> },
    /// `options.package-grouping-strategy` is not recognised
    UnknownGroupingStrategy(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::UnsupportedSystem(system) => {
                write!(f, "Unsupported system: {}", system)
            }
            ValidationError::UndeclaredSystem { install_id, system } => write!(
                f,
                "'install.{}' uses system '{}' which is not listed in 'options.systems'",
                install_id, system
            ),
            ValidationError::UnknownInput { install_id, input } => write!(
                f,
                "'install.{}' requires input '{}' which is not in the registry",
                install_id, input
            ),
            ValidationError::ConflictingGroupInputs { group, inputs } => write!(
                f,
                "group '{}' requires conflicting inputs: {}",
                group,
                inputs.join(", ")
            ),
            ValidationError::UnknownGroupingStrategy(strategy) => {
                write!(f, "Unknown package grouping strategy: {}", strategy)
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Manifest validator
pub struct Validator;

impl Validator {
    /// Validate `manifest` in the context of `global`
    pub fn validate(
        manifest: &Manifest,
        global: &GlobalManifest,
    ) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        let options = global.options().merged(&manifest.options());
        errors.extend(Self::validate_systems(manifest, options.systems.as_deref()));

        if let Some(strategy) = &options.package_grouping_strategy {
            if strategy.parse::<GroupingStrategy>().is_err() {
                errors.push(ValidationError::UnknownGroupingStrategy(strategy.clone()));
            }
        }

        let mut registry = global.registry();
        registry.merge(&manifest.registry(""));
        for (iid, descriptor) in manifest.descriptors() {
            if let Some(input) = &descriptor.input {
                if registry.get(input).is_none() {
                    errors.push(ValidationError::UnknownInput {
                        install_id: iid.clone(),
                        input: input.clone(),
                    });
                }
            }
        }

        errors.extend(Self::validate_group_inputs(manifest));

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Validate and fold every error into one `InvalidManifest`
    pub fn check(manifest: &Manifest, global: &GlobalManifest) -> crate::Result<()> {
        Self::validate(manifest, global).map_err(|errors| {
            let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            PkgdbError::InvalidManifest(messages.join("; "))
        })
    }

    fn validate_systems(manifest: &Manifest, declared: Option<&[String]>) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        for system in declared.unwrap_or_default() {
            if !is_supported_system(system) {
                errors.push(ValidationError::UnsupportedSystem(system.clone()));
            }
        }

        for (iid, descriptor) in manifest.descriptors() {
            for system in descriptor.systems.iter().flatten() {
                let known = match declared {
                    Some(declared) => declared.contains(system),
                    None => is_supported_system(system),
                };
                if !known {
                    errors.push(ValidationError::UndeclaredSystem {
                        install_id: iid.clone(),
                        system: system.clone(),
                    });
                }
            }
        }

        errors
    }

    fn validate_group_inputs(manifest: &Manifest) -> Vec<ValidationError> {
        let mut forced: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
        for descriptor in manifest.descriptors().values() {
            if let (Some(group), Some(input)) = (&descriptor.group, &descriptor.input) {
                forced.entry(group).or_default().insert(input);
            }
        }
        forced
            .into_iter()
            .filter(|(_, inputs)| inputs.len() > 1)
            .map(|(group, inputs)| ValidationError::ConflictingGroupInputs {
                group: group.to_string(),
                inputs: inputs.into_iter().map(str::to_string).collect(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::ManifestRaw;
    use pretty_assertions::assert_eq;

    fn manifest(json: &str) -> Manifest {
        Manifest::from_raw(ManifestRaw::from_str(json).unwrap()).unwrap()
    }

    #[test]
    fn test_valid_manifest() {
        let manifest = manifest(
            r#"{
                "options": { "systems": ["x86_64-linux"] },
                "install": { "hello": { "systems": ["x86_64-linux"] } }
            }"#,
        );
        Validator::validate(&manifest, &GlobalManifest::default()).unwrap();
    }

    #[test]
    fn test_undeclared_descriptor_system() {
        let manifest = manifest(
            r#"{
                "options": { "systems": ["x86_64-linux"] },
                "install": { "hello": { "systems": ["aarch64-darwin"] } }
            }"#,
        );
        let errors = Validator::validate(&manifest, &GlobalManifest::default()).unwrap_err();
        assert_eq!(
            errors,
            vec![ValidationError::UndeclaredSystem {
                install_id: "hello".to_string(),
                system: "aarch64-darwin".to_string(),
            }]
        );
    }

    #[test]
    fn test_global_systems_are_inherited() {
        let manifest = manifest(r#"{ "install": { "hello": { "systems": ["aarch64-darwin"] } } }"#);
        let global = GlobalManifest::from_str(r#"{ "options": { "systems": ["x86_64-linux"] } }"#)
            .unwrap();
        assert!(Validator::validate(&manifest, &global).is_err());
    }

    #[test]
    fn test_unknown_forced_input() {
        let manifest = manifest(r#"{ "install": { "hello": { "package-repository": "nope" } } }"#);
        let errors = Validator::validate(&manifest, &GlobalManifest::default()).unwrap_err();
        assert!(errors[0].to_string().contains("'nope'"));
    }

    #[test]
    fn test_conflicting_group_inputs() {
        let manifest = manifest(
            r#"{
                "registry": { "inputs": {
                    "a": { "from": "github:acme/a" },
                    "b": { "from": "github:acme/b" }
                } },
                "install": {
                    "hello": { "package-group": "g", "package-repository": "a" },
                    "world": { "package-group": "g", "package-repository": "b" }
                }
            }"#,
        );
        let errors = Validator::validate(&manifest, &GlobalManifest::default()).unwrap_err();
        assert_eq!(
            errors,
            vec![ValidationError::ConflictingGroupInputs {
                group: "g".to_string(),
                inputs: vec!["a".to_string(), "b".to_string()],
            }]
        );
    }

    #[test]
    fn test_unknown_grouping_strategy() {
        let manifest = manifest(r#"{ "options": { "package-grouping-strategy": "one-big-group" } }"#);
        assert!(matches!(
            Validator::check(&manifest, &GlobalManifest::default()),
            Err(PkgdbError::InvalidManifest(_))
        ));
    }
}
