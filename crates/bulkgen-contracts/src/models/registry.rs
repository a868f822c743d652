use indexmap::IndexMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub name: String,
    pub provider: String,
    pub description: String,
    /// Alternate spellings accepted on the command line.
    pub aliases: Vec<String>,
}

impl ModelSpec {
    pub fn matches(&self, requested: &str) -> bool {
        let wanted = requested.trim().trim_start_matches("models/");
        self.name.eq_ignore_ascii_case(wanted)
            || self
                .aliases
                .iter()
                .any(|alias| alias.eq_ignore_ascii_case(wanted))
    }
}

/// Ordered model table; the first entry is the default.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: IndexMap<String, ModelSpec>,
}

impl ModelRegistry {
    pub fn new(models: Option<IndexMap<String, ModelSpec>>) -> Self {
        Self {
            models: models.unwrap_or_else(default_models),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ModelSpec> {
        self.models
            .get(name)
            .or_else(|| self.models.values().find(|model| model.matches(name)))
    }

    pub fn list(&self) -> impl Iterator<Item = &ModelSpec> {
        self.models.values()
    }

    pub fn default_model(&self) -> Option<&ModelSpec> {
        self.models.values().next()
    }

    pub fn by_provider(&self, provider: &str) -> Vec<ModelSpec> {
        self.models
            .values()
            .filter(|model| model.provider == provider)
            .cloned()
            .collect()
    }
}

fn default_models() -> IndexMap<String, ModelSpec> {
    let mut map = IndexMap::new();

    let mut insert = |name: &str, provider: &str, description: &str, aliases: &[&str]| {
        map.insert(
            name.to_string(),
            ModelSpec {
                name: name.to_string(),
                provider: provider.to_string(),
                description: description.to_string(),
                aliases: aliases.iter().map(|item| (*item).to_string()).collect(),
            },
        );
    };

    insert(
        "imagen-4.0-generate-001",
        "imagen",
        "Imagen 4 standard",
        &["imagen-4", "imagen-4.0"],
    );
    insert(
        "imagen-4.0-ultra-generate-001",
        "imagen",
        "Imagen 4 ultra",
        &["imagen-4-ultra", "imagen-4.0-ultra"],
    );
    insert(
        "imagen-4.0-fast-generate-001",
        "imagen",
        "Imagen 4 fast",
        &["imagen-4-fast", "imagen-4.0-fast"],
    );
    insert(
        "imagen-3.0-generate-002",
        "imagen",
        "Imagen 3",
        &["imagen-3", "imagen-3.0"],
    );
    insert(
        "dryrun-image-1",
        "dryrun",
        "Offline solid-colour placeholder images",
        &["dryrun"],
    );

    map
}

#[cfg(test)]
mod tests {
    use super::ModelRegistry;

    #[test]
    fn default_registry_starts_with_imagen_4() {
        let registry = ModelRegistry::new(None);
        let default = registry.default_model().unwrap();
        assert_eq!(default.name, "imagen-4.0-generate-001");
        assert_eq!(default.provider, "imagen");
    }

    #[test]
    fn lookup_accepts_aliases_and_model_prefix() {
        let registry = ModelRegistry::new(None);
        assert_eq!(
            registry.get("models/imagen-4-ultra").map(|m| m.name.as_str()),
            Some("imagen-4.0-ultra-generate-001")
        );
        assert_eq!(
            registry.get("DRYRUN").map(|m| m.provider.as_str()),
            Some("dryrun")
        );
        assert!(registry.get("gpt-image-1").is_none());
    }

    #[test]
    fn by_provider_preserves_registration_order() {
        let registry = ModelRegistry::new(None);
        let names: Vec<String> = registry
            .by_provider("imagen")
            .into_iter()
            .map(|model| model.name)
            .collect();
        assert_eq!(
            names,
            vec![
                "imagen-4.0-generate-001",
                "imagen-4.0-ultra-generate-001",
                "imagen-4.0-fast-generate-001",
                "imagen-3.0-generate-002",
            ]
        );
    }
}
