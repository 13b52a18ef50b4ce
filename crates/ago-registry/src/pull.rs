use crate::registry::TemplateRegistry;
use crate::template::TEMPLATE_EXTENSION;
use ago_config::{RegistryEntry, RegistryKind};
use ago_core::{AgoError, AgoResult};
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::info;

/// Fetches raw template text from a configured registry. The daemon only
/// ever consumes the returned text; forge APIs, pagination and auth
/// schemes stay behind this seam.
#[async_trait]
pub trait TemplateFetcher: Send + Sync {
    async fn fetch(&self, registry: &RegistryEntry, template: &str) -> AgoResult<String>;
}

/// Raw-file HTTP fetcher covering `http`, `github` and `gitlab`
/// registry kinds.
pub struct HttpTemplateFetcher {
    http: reqwest::Client,
}

impl HttpTemplateFetcher {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    fn raw_url(registry: &RegistryEntry, template: &str) -> AgoResult<String> {
        let file = format!("{template}.{TEMPLATE_EXTENSION}");
        match registry.kind {
            RegistryKind::Http => {
                let base = registry.url.trim_end_matches('/');
                Ok(format!("{base}/{file}"))
            }
            RegistryKind::Github => {
                let repo = registry
                    .url
                    .trim_end_matches('/')
                    .strip_prefix("https://github.com/")
                    .ok_or_else(|| {
                        AgoError::ConfigInvalid(format!(
                            "registry '{}' url must look like https://github.com/owner/repo",
                            registry.name
                        ))
                    })?;
                Ok(format!(
                    "https://raw.githubusercontent.com/{repo}/main/{file}"
                ))
            }
            RegistryKind::Gitlab => {
                let base = registry.url.trim_end_matches('/');
                Ok(format!("{base}/-/raw/main/{file}"))
            }
            RegistryKind::Builtin => Err(AgoError::ConfigInvalid(format!(
                "registry '{}' is builtin and cannot be pulled from",
                registry.name
            ))),
        }
    }
}

impl Default for HttpTemplateFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TemplateFetcher for HttpTemplateFetcher {
    async fn fetch(&self, registry: &RegistryEntry, template: &str) -> AgoResult<String> {
        let url = Self::raw_url(registry, template)?;
        info!(registry = %registry.name, url = %url, "fetching template");

        let mut request = self.http.get(&url);
        if let Some(token) = &registry.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AgoError::Http(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(AgoError::NoSuchTemplate(template.to_string()));
        }
        if !response.status().is_success() {
            return Err(AgoError::Http(format!(
                "registry '{}' returned {} for {url}",
                registry.name,
                response.status()
            )));
        }

        response
            .text()
            .await
            .map_err(|e| AgoError::Http(e.to_string()))
    }
}

/// Materialise `registry:template` into the pulled layer. Returns the
/// template name and installed path.
pub async fn pull_template(
    registries: &[RegistryEntry],
    fetcher: &dyn TemplateFetcher,
    templates: &TemplateRegistry,
    reference: &str,
) -> AgoResult<(String, PathBuf)> {
    let (registry_name, template_name) = reference.split_once(':').ok_or_else(|| {
        AgoError::ConfigInvalid(format!(
            "pull reference '{reference}' must be registry:template"
        ))
    })?;

    let registry = registries
        .iter()
        .find(|r| r.name == registry_name)
        .ok_or_else(|| {
            AgoError::ConfigInvalid(format!("no registry named '{registry_name}' is configured"))
        })?;

    let content = fetcher.fetch(registry, template_name).await?;
    let path = templates.install_pulled(&content, template_name)?;
    info!(template = %template_name, path = %path.display(), "template pulled");
    Ok((template_name.to_string(), path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::LayerPaths;

    fn entry(name: &str, kind: RegistryKind, url: &str) -> RegistryEntry {
        RegistryEntry {
            name: name.into(),
            url: url.into(),
            kind,
            token: None,
            priority: 10,
            enabled: true,
        }
    }

    struct FakeFetcher {
        body: String,
    }

    #[async_trait]
    impl TemplateFetcher for FakeFetcher {
        async fn fetch(&self, _registry: &RegistryEntry, _template: &str) -> AgoResult<String> {
            Ok(self.body.clone())
        }
    }

    #[test]
    fn test_raw_url_shapes() {
        let http = entry("hub", RegistryKind::Http, "https://example.com/templates/");
        assert_eq!(
            HttpTemplateFetcher::raw_url(&http, "writer").unwrap(),
            "https://example.com/templates/writer.agt"
        );

        let gh = entry("gh", RegistryKind::Github, "https://github.com/acme/agents");
        assert_eq!(
            HttpTemplateFetcher::raw_url(&gh, "writer").unwrap(),
            "https://raw.githubusercontent.com/acme/agents/main/writer.agt"
        );

        let gl = entry("gl", RegistryKind::Gitlab, "https://gitlab.com/acme/agents");
        assert_eq!(
            HttpTemplateFetcher::raw_url(&gl, "writer").unwrap(),
            "https://gitlab.com/acme/agents/-/raw/main/writer.agt"
        );
    }

    #[test]
    fn test_builtin_registry_cannot_be_pulled() {
        let builtin = entry("ago_builtin", RegistryKind::Builtin, "");
        let err = HttpTemplateFetcher::raw_url(&builtin, "writer").unwrap_err();
        assert_eq!(err.kind(), "ConfigInvalid");
    }

    #[test]
    fn test_bad_github_url_is_config_invalid() {
        let gh = entry("gh", RegistryKind::Github, "https://example.org/acme/agents");
        let err = HttpTemplateFetcher::raw_url(&gh, "writer").unwrap_err();
        assert_eq!(err.kind(), "ConfigInvalid");
    }

    #[tokio::test]
    async fn test_pull_installs_into_pulled_layer() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = LayerPaths {
            local: tmp.path().join("cwd"),
            pulled: tmp.path().join("pulled"),
            builtin: tmp.path().join("builtin"),
        };
        let templates = TemplateRegistry::new(paths, &["pulled".to_string()]);
        let fetcher = FakeFetcher {
            body: "name: writer\nprompt: |\n  You write.\n".to_string(),
        };
        let registries = vec![entry("hub", RegistryKind::Http, "https://example.com/t")];

        let (name, path) = pull_template(&registries, &fetcher, &templates, "hub:writer")
            .await
            .unwrap();
        assert_eq!(name, "writer");
        assert!(path.is_file());

        let listing = templates.list();
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].layer, "pulled");
    }

    #[tokio::test]
    async fn test_pull_rejects_invalid_payload() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = LayerPaths {
            local: tmp.path().join("cwd"),
            pulled: tmp.path().join("pulled"),
            builtin: tmp.path().join("builtin"),
        };
        let templates = TemplateRegistry::new(paths, &["pulled".to_string()]);
        let fetcher = FakeFetcher {
            body: "prompt: but no name\n".to_string(),
        };
        let registries = vec![entry("hub", RegistryKind::Http, "https://example.com/t")];

        let err = pull_template(&registries, &fetcher, &templates, "hub:writer")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "BadTemplate");
    }

    #[tokio::test]
    async fn test_pull_requires_registry_template_format() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = LayerPaths {
            local: tmp.path().join("cwd"),
            pulled: tmp.path().join("pulled"),
            builtin: tmp.path().join("builtin"),
        };
        let templates = TemplateRegistry::new(paths, &["pulled".to_string()]);
        let fetcher = FakeFetcher { body: String::new() };

        let err = pull_template(&[], &fetcher, &templates, "just-a-name")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "ConfigInvalid");
    }
}
