//! Export Resolver - 必要なパラメータ名を依存ユニットの export に解決する
//!
//! # アルゴリズム
//! 1. 予約名（self reference, 既定 `component`）は消費側ユニット自身に解決する
//! 2. override を宣言した依存のうち、その名前を override に含み、かつ export しているもの
//!    - 1 件ならそれを採用、複数なら衝突
//! 3. 2 で見つからなければ、override を宣言していない依存の export 全体を検索
//!    - 1 件なら採用、複数なら衝突、0 件なら未解決
//!
//! 依存は宣言順に調べる。まだ BUILT でない依存は export を持たない。

use std::collections::BTreeMap;

use crate::app::registry::Registry;
use crate::domain::{ComponentRecord, Injection, SpindleError, UnitId};

pub struct ExportResolver<'a> {
    registry: &'a Registry,
    self_reference: &'a str,
}

impl<'a> ExportResolver<'a> {
    pub fn new(registry: &'a Registry, self_reference: &'a str) -> Self {
        Self {
            registry,
            self_reference,
        }
    }

    /// Resolve a single parameter name for `consumer`.
    pub fn resolve(
        &self,
        consumer: &UnitId,
        name: &str,
        dependencies: &[UnitId],
        overrides: &BTreeMap<UnitId, Vec<String>>,
    ) -> Result<Injection, SpindleError> {
        if name == self.self_reference {
            return Ok(Injection::Component(consumer.clone()));
        }

        let explicit: Vec<&UnitId> = dependencies
            .iter()
            .filter(|dep| {
                overrides
                    .get(*dep)
                    .is_some_and(|names| names.iter().any(|n| n == name))
            })
            .filter(|dep| self.exports_name(dep, name))
            .collect();

        let matches = if explicit.is_empty() {
            dependencies
                .iter()
                .filter(|dep| !overrides.contains_key(*dep))
                .filter(|dep| self.exports_name(dep, name))
                .collect()
        } else {
            explicit
        };

        match matches.as_slice() {
            [] => Err(SpindleError::Unresolved {
                unit: consumer.clone(),
                name: name.to_string(),
            }),
            [provider] => {
                let value = self
                    .registry
                    .get(provider)
                    .and_then(|r| r.exports().get(name))
                    .cloned()
                    .unwrap_or_default();
                Ok(Injection::Export {
                    provider: (*provider).clone(),
                    value,
                })
            }
            providers => Err(SpindleError::Collision {
                unit: consumer.clone(),
                name: name.to_string(),
                providers: providers.iter().map(|p| (*p).clone()).collect(),
            }),
        }
    }

    /// Resolve every name the record requires. Fails on the first unresolvable name.
    pub fn resolve_all(
        &self,
        record: &ComponentRecord,
    ) -> Result<BTreeMap<String, Injection>, SpindleError> {
        record
            .requires()
            .iter()
            .map(|name| -> Result<(String, Injection), SpindleError> {
                let injection = self.resolve(
                    record.id(),
                    name,
                    record.dependency_slice(),
                    record.overrides(),
                )?;
                Ok((name.clone(), injection))
            })
            .collect()
    }

    fn exports_name(&self, dependency: &UnitId, name: &str) -> bool {
        self.registry
            .get(dependency)
            .is_some_and(|r| r.exports().contains(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Exports, logic_fn};
    use serde_json::json;

    fn id(s: &str) -> UnitId {
        UnitId::parse(s).unwrap()
    }

    /// Registry with BUILT units exporting the given names.
    fn registry_with(units: &[(&str, &[(&str, serde_json::Value)])]) -> Registry {
        let mut registry = Registry::new();
        for (name, exports) in units {
            let unit = id(name);
            let cx = registry.open_context(unit.clone());
            registry.declare(&cx).unwrap().run(logic_fn(|_| Ok(()))).unwrap();
            registry.close_context(&cx);

            registry.grant_build(&unit);
            registry.begin_build(&unit).unwrap();
            registry.revoke_build();
            let exports: Exports = exports
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect();
            registry
                .get_mut(&unit)
                .unwrap()
                .mark_built(exports, BTreeMap::new())
                .unwrap();
        }
        registry
    }

    #[test]
    fn self_reference_resolves_to_consumer() {
        let registry = Registry::new();
        let resolver = ExportResolver::new(&registry, "component");

        let injection = resolver
            .resolve(&id("app"), "component", &[], &BTreeMap::new())
            .unwrap();
        assert_eq!(injection, Injection::Component(id("app")));
    }

    #[test]
    fn single_provider_resolves() {
        let registry = registry_with(&[("lib", &[("Parser", json!("p"))]), ("util", &[])]);
        let resolver = ExportResolver::new(&registry, "component");

        let injection = resolver
            .resolve(&id("app"), "Parser", &[id("util"), id("lib")], &BTreeMap::new())
            .unwrap();
        assert_eq!(
            injection,
            Injection::Export {
                provider: id("lib"),
                value: json!("p"),
            }
        );
    }

    #[test]
    fn missing_name_is_unresolved() {
        let registry = registry_with(&[("lib", &[("Parser", json!(1))])]);
        let resolver = ExportResolver::new(&registry, "component");

        let err = resolver
            .resolve(&id("app"), "Lexer", &[id("lib")], &BTreeMap::new())
            .unwrap_err();
        assert_eq!(
            err,
            SpindleError::Unresolved {
                unit: id("app"),
                name: "Lexer".to_string(),
            }
        );
    }

    #[test]
    fn same_name_in_two_dependencies_collides() {
        let registry = registry_with(&[
            ("a", &[("Parser", json!("a"))]),
            ("b", &[("Parser", json!("b"))]),
        ]);
        let resolver = ExportResolver::new(&registry, "component");

        let err = resolver
            .resolve(&id("app"), "Parser", &[id("a"), id("b")], &BTreeMap::new())
            .unwrap_err();
        assert_eq!(
            err,
            SpindleError::Collision {
                unit: id("app"),
                name: "Parser".to_string(),
                providers: vec![id("a"), id("b")],
            }
        );
    }

    #[test]
    fn override_selects_provider() {
        let registry = registry_with(&[
            ("a", &[("Parser", json!("a"))]),
            ("b", &[("Parser", json!("b"))]),
        ]);
        let resolver = ExportResolver::new(&registry, "component");
        let mut overrides = BTreeMap::new();
        overrides.insert(id("b"), vec!["Parser".to_string()]);

        let injection = resolver
            .resolve(&id("app"), "Parser", &[id("a"), id("b")], &overrides)
            .unwrap();
        assert_eq!(injection.provider(), &id("b"));
        assert_eq!(injection.value(), Some(&json!("b")));
    }

    #[test]
    fn override_narrows_dependency_exports() {
        // "b" only exposes what its override lists.
        let registry = registry_with(&[("b", &[("Parser", json!(1)), ("Lexer", json!(2))])]);
        let resolver = ExportResolver::new(&registry, "component");
        let mut overrides = BTreeMap::new();
        overrides.insert(id("b"), vec!["Parser".to_string()]);

        assert!(resolver.resolve(&id("app"), "Parser", &[id("b")], &overrides).is_ok());
        assert!(matches!(
            resolver.resolve(&id("app"), "Lexer", &[id("b")], &overrides),
            Err(SpindleError::Unresolved { .. })
        ));
    }

    #[test]
    fn unbuilt_dependency_has_no_exports() {
        let mut registry = Registry::new();
        let cx = registry.open_context(id("lib"));
        registry.declare(&cx).unwrap().run(logic_fn(|_| Ok(()))).unwrap();
        registry.close_context(&cx);
        let resolver = ExportResolver::new(&registry, "component");

        assert!(matches!(
            resolver.resolve(&id("app"), "Parser", &[id("lib")], &BTreeMap::new()),
            Err(SpindleError::Unresolved { .. })
        ));
    }
}
