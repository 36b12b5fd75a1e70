//! FsUnitLoader - ディスク上の JSON マニフェストからユニットを宣言する
//!
//! ID `a/b` は `<root>/a/b.json` に対応する。マニフェストの形:
//!
//! ```json
//! {
//!   "imports": ["lib/core", { "id": "lib/parser", "overrides": ["Parser"] }],
//!   "hooks": ["reset"],
//!   "emits": ["compiled"],
//!   "requires": ["component"],
//!   "exports": { "version": 2 },
//!   "reexports": ["Parser"]
//! }
//! ```
//!
//! - `exports`: ビルド時にそのまま export する固定値
//! - `reexports`: 依存から解決した値を同じ名前で export し直す（自動的に requires に入る）
//! - `hooks`: ビルド後、受け取ったペイロードをログに出すだけの handler を登録する

use std::collections::BTreeMap;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::app::registry::Declarer;
use crate::domain::{LogicError, SpindleError, UnitId, logic_fn};
use crate::ports::{LoadError, UnitLoader, UnitScript};

/// One entry of `imports`: either a bare id or an id with override names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ImportSpec {
    Id(String),
    WithOverrides {
        id: String,
        #[serde(default)]
        overrides: Vec<String>,
    },
}

impl ImportSpec {
    pub fn id(&self) -> &str {
        match self {
            ImportSpec::Id(id) | ImportSpec::WithOverrides { id, .. } => id,
        }
    }

    pub fn overrides(&self) -> &[String] {
        match self {
            ImportSpec::Id(_) => &[],
            ImportSpec::WithOverrides { overrides, .. } => overrides,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UnitManifest {
    pub imports: Vec<ImportSpec>,
    pub hooks: Vec<String>,
    pub emits: Vec<String>,
    pub requires: Vec<String>,
    pub exports: BTreeMap<String, serde_json::Value>,
    pub reexports: Vec<String>,
}

impl UnitManifest {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Run the declarations described by the manifest.
    pub fn declare(self, declarer: &mut Declarer<'_>) -> Result<(), SpindleError> {
        let unit = declarer.unit().clone();
        let component = declarer.component()?;

        for import in &self.imports {
            let overrides: Vec<&str> = import.overrides().iter().map(String::as_str).collect();
            component.import(import.id(), &overrides)?;
        }
        for event in &self.hooks {
            component.hook(event)?;
        }
        for event in &self.emits {
            component.emit(event)?;
        }
        for name in self.requires.iter().chain(&self.reexports) {
            component.require(name)?;
        }

        let UnitManifest {
            hooks,
            exports,
            reexports,
            ..
        } = self;
        component.run(logic_fn(move |cx| {
            for (name, value) in &exports {
                cx.export(name.clone(), value)?;
            }
            for name in &reexports {
                let value = cx
                    .value(name)
                    .cloned()
                    .ok_or_else(|| LogicError::msg(format!("'{name}' is not an export")))?;
                cx.export(name.clone(), value)?;
            }
            for event in &hooks {
                let unit = unit.clone();
                let event_name = event.clone();
                cx.on(event, move |payload: &serde_json::Value| {
                    info!(unit = %unit, event = %event_name, payload = %payload, "event received");
                    Ok::<(), LogicError>(())
                })?;
            }
            Ok(())
        }))?;
        Ok(())
    }
}

/// Loads units from `<root>/<id>.json`.
#[derive(Debug, Clone)]
pub struct FsUnitLoader {
    root: PathBuf,
}

impl FsUnitLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Manifest path for `id`. Segments that would leave the root are rejected.
    pub fn path_for(&self, id: &UnitId) -> Result<PathBuf, LoadError> {
        let segments: Vec<&str> = id.segments().collect();
        if segments.iter().any(|s| *s == "." || *s == "..") {
            return Err(LoadError::Failed(format!("{id} points outside the unit root")));
        }
        let mut path = self.root.clone();
        if let Some((file, dirs)) = segments.split_last() {
            path.extend(dirs);
            // not set_extension: ids may contain dots (`ui/text-box.v2`)
            path.push(format!("{file}.json"));
        }
        Ok(path)
    }
}

#[async_trait]
impl UnitLoader for FsUnitLoader {
    async fn load(&self, id: &UnitId) -> Result<Box<dyn UnitScript>, LoadError> {
        let path = self.path_for(id)?;
        debug!(unit = %id, path = %path.display(), "reading manifest");

        let json = match tokio::fs::read_to_string(&path).await {
            Ok(json) => json,
            Err(e) if e.kind() == IoErrorKind::NotFound => {
                return Err(LoadError::NotFound(id.clone()));
            }
            Err(e) => return Err(LoadError::Io(e)),
        };
        let manifest = UnitManifest::from_json(&json)?;

        let script: Box<dyn UnitScript> =
            Box::new(move |declarer: &mut Declarer<'_>| manifest.declare(declarer));
        Ok(script)
    }
}
