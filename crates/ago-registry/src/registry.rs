use crate::template::{Template, TEMPLATE_EXTENSION};
use ago_core::{AgoError, AgoResult, TemplateSummary};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A template discovery layer, in the order the config may name them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    /// `<cwd>/*.agt` — project-local templates.
    Local,
    /// `$AGO_HOME/registry/templates/pulled/*.agt` — remote pulls.
    Pulled,
    /// `$AGO_HOME/registry/templates/builtin/*.agt` — installed with ago.
    Builtin,
}

impl Layer {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "local" => Some(Layer::Local),
            "pulled" => Some(Layer::Pulled),
            "builtin" => Some(Layer::Builtin),
            _ => None,
        }
    }
}

impl std::fmt::Display for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Layer::Local => write!(f, "local"),
            Layer::Pulled => write!(f, "pulled"),
            Layer::Builtin => write!(f, "builtin"),
        }
    }
}

/// Where each layer lives on disk.
#[derive(Debug, Clone)]
pub struct LayerPaths {
    pub local: PathBuf,
    pub pulled: PathBuf,
    pub builtin: PathBuf,
}

/// Resolves and enumerates templates across the configured layers.
/// Templates are resolved by exact name only; a missing layer directory
/// is an empty layer, never an error.
pub struct TemplateRegistry {
    paths: LayerPaths,
    order: Vec<Layer>,
}

impl TemplateRegistry {
    pub fn new(paths: LayerPaths, order_names: &[String]) -> Self {
        let mut order = Vec::with_capacity(order_names.len());
        for name in order_names {
            match Layer::from_name(name) {
                Some(layer) if !order.contains(&layer) => order.push(layer),
                Some(_) => {}
                None => warn!(layer = %name, "unknown template layer in resolution order"),
            }
        }
        if order.is_empty() {
            order = vec![Layer::Local, Layer::Pulled, Layer::Builtin];
        }
        Self { paths, order }
    }

    pub fn layer_dir(&self, layer: Layer) -> &Path {
        match layer {
            Layer::Local => &self.paths.local,
            Layer::Pulled => &self.paths.pulled,
            Layer::Builtin => &self.paths.builtin,
        }
    }

    /// Find `name` by walking the layers in configured order. First hit
    /// wins; the winning layer is returned alongside the template.
    pub fn resolve(&self, name: &str) -> AgoResult<(Template, Layer)> {
        for layer in &self.order {
            let candidate = self
                .layer_dir(*layer)
                .join(format!("{name}.{TEMPLATE_EXTENSION}"));
            if !candidate.is_file() {
                continue;
            }
            debug!(template = %name, layer = %layer, "resolved template");
            let template = Template::load(&candidate)?;
            if template.name != name {
                return Err(AgoError::BadTemplate {
                    name: name.to_string(),
                    field: "name".to_string(),
                    problem: format!("file {} declares name '{}'", candidate.display(), template.name),
                });
            }
            return Ok((template, *layer));
        }
        Err(AgoError::NoSuchTemplate(name.to_string()))
    }

    /// Enumerate all layers, deduplicating by name: the copy from the
    /// highest-precedence layer wins and is annotated with its source.
    pub fn list(&self) -> Vec<TemplateSummary> {
        let mut summaries: Vec<TemplateSummary> = Vec::new();
        for layer in &self.order {
            for (path, template) in scan_layer(self.layer_dir(*layer)) {
                if summaries.iter().any(|s| s.name == template.name) {
                    debug!(
                        template = %template.name,
                        shadowed = %path.display(),
                        "template shadowed by higher-precedence layer"
                    );
                    continue;
                }
                summaries.push(TemplateSummary {
                    name: template.name,
                    version: template.version,
                    description: template.description,
                    model: template.model.unwrap_or_default(),
                    layer: layer.to_string(),
                });
            }
        }
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        summaries
    }

    /// Validate raw template text and write it into the pulled layer.
    /// Returns the installed path.
    pub fn install_pulled(&self, content: &str, name_hint: &str) -> AgoResult<PathBuf> {
        let template = Template::parse(content, name_hint)?;
        let dir = &self.paths.pulled;
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.{TEMPLATE_EXTENSION}", template.name));
        std::fs::write(&path, content)?;
        Ok(path)
    }
}

fn scan_layer(dir: &Path) -> Vec<(PathBuf, Template)> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        // Missing layer directory is an empty layer.
        Err(_) => return Vec::new(),
    };

    let mut found = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(TEMPLATE_EXTENSION) {
            continue;
        }
        match Template::load(&path) {
            Ok(template) => found.push((path, template)),
            Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable template"),
        }
    }
    found.sort_by(|a, b| a.0.cmp(&b.0));
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn template_body(name: &str, description: &str) -> String {
        format!("name: {name}\ndescription: {description}\nprompt: |\n  You are {name}.\n")
    }

    fn fixture() -> (TemplateRegistry, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let paths = LayerPaths {
            local: tmp.path().join("cwd"),
            pulled: tmp.path().join("pulled"),
            builtin: tmp.path().join("builtin"),
        };
        for dir in [&paths.local, &paths.pulled, &paths.builtin] {
            fs::create_dir_all(dir).unwrap();
        }
        let registry = TemplateRegistry::new(
            paths,
            &["local".to_string(), "pulled".to_string(), "builtin".to_string()],
        );
        (registry, tmp)
    }

    #[test]
    fn test_resolve_walks_layers_in_order() {
        let (registry, _tmp) = fixture();
        fs::write(
            registry.layer_dir(Layer::Builtin).join("writer.agt"),
            template_body("writer", "BUILTIN"),
        )
        .unwrap();
        fs::write(
            registry.layer_dir(Layer::Local).join("writer.agt"),
            template_body("writer", "LOCAL"),
        )
        .unwrap();

        let (template, layer) = registry.resolve("writer").unwrap();
        assert_eq!(template.description, "LOCAL");
        assert_eq!(layer, Layer::Local);
    }

    #[test]
    fn test_resolve_respects_configured_order() {
        let (registry, tmp) = fixture();
        fs::write(
            registry.layer_dir(Layer::Builtin).join("writer.agt"),
            template_body("writer", "BUILTIN"),
        )
        .unwrap();
        fs::write(
            registry.layer_dir(Layer::Local).join("writer.agt"),
            template_body("writer", "LOCAL"),
        )
        .unwrap();

        // builtin listed first wins.
        let paths = LayerPaths {
            local: tmp.path().join("cwd"),
            pulled: tmp.path().join("pulled"),
            builtin: tmp.path().join("builtin"),
        };
        let reversed =
            TemplateRegistry::new(paths, &["builtin".to_string(), "local".to_string()]);
        let (template, layer) = reversed.resolve("writer").unwrap();
        assert_eq!(template.description, "BUILTIN");
        assert_eq!(layer, Layer::Builtin);
    }

    #[test]
    fn test_resolve_unknown_is_no_such_template() {
        let (registry, _tmp) = fixture();
        let err = registry.resolve("ghost").unwrap_err();
        assert_eq!(err.kind(), "NoSuchTemplate");
    }

    #[test]
    fn test_missing_layer_dir_is_empty_not_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = LayerPaths {
            local: tmp.path().join("nope"),
            pulled: tmp.path().join("also-nope"),
            builtin: tmp.path().join("missing"),
        };
        let registry = TemplateRegistry::new(paths, &["local".to_string(), "builtin".to_string()]);
        assert!(registry.list().is_empty());
        assert_eq!(registry.resolve("writer").unwrap_err().kind(), "NoSuchTemplate");
    }

    #[test]
    fn test_list_dedupes_keeping_highest_precedence() {
        let (registry, _tmp) = fixture();
        fs::write(
            registry.layer_dir(Layer::Builtin).join("writer.agt"),
            template_body("writer", "BUILTIN"),
        )
        .unwrap();
        fs::write(
            registry.layer_dir(Layer::Local).join("writer.agt"),
            template_body("writer", "LOCAL"),
        )
        .unwrap();
        fs::write(
            registry.layer_dir(Layer::Pulled).join("helper.agt"),
            template_body("helper", "PULLED"),
        )
        .unwrap();

        let listing = registry.list();
        assert_eq!(listing.len(), 2);
        let writer = listing.iter().find(|s| s.name == "writer").unwrap();
        assert_eq!(writer.description, "LOCAL");
        assert_eq!(writer.layer, "local");
        let helper = listing.iter().find(|s| s.name == "helper").unwrap();
        assert_eq!(helper.layer, "pulled");
    }

    #[test]
    fn test_list_skips_malformed_files() {
        let (registry, _tmp) = fixture();
        fs::write(registry.layer_dir(Layer::Local).join("bad.agt"), "prompt: no name\n").unwrap();
        fs::write(
            registry.layer_dir(Layer::Local).join("good.agt"),
            template_body("good", "ok"),
        )
        .unwrap();
        let listing = registry.list();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].name, "good");
    }

    #[test]
    fn test_resolve_rejects_name_mismatch() {
        let (registry, _tmp) = fixture();
        fs::write(
            registry.layer_dir(Layer::Local).join("alias.agt"),
            template_body("other", "x"),
        )
        .unwrap();
        let err = registry.resolve("alias").unwrap_err();
        assert_eq!(err.kind(), "BadTemplate");
    }

    #[test]
    fn test_install_pulled_then_resolve() {
        let (registry, _tmp) = fixture();
        let body = template_body("fetched", "from afar");
        let path = registry.install_pulled(&body, "fetched").unwrap();
        assert!(path.ends_with("fetched.agt"));

        let (template, layer) = registry.resolve("fetched").unwrap();
        assert_eq!(template.description, "from afar");
        assert_eq!(layer, Layer::Pulled);
    }
}
