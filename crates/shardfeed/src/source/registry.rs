use super::{GeneratorSource, OpenSkySource, SourceAdapter, SourceError};
use serde_yaml::Value as YamlValue;
use shardfeed_types::SourceSpec;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Builds an adapter from its configuration section.
pub type SourceFactory = fn(&YamlValue) -> Result<Arc<dyn SourceAdapter>, SourceError>;

fn opensky(config: &YamlValue) -> Result<Arc<dyn SourceAdapter>, SourceError> {
    Ok(Arc::new(OpenSkySource::from_config(config)?))
}

fn generator(config: &YamlValue) -> Result<Arc<dyn SourceAdapter>, SourceError> {
    Ok(Arc::new(GeneratorSource::from_config(config)?))
}

/// Source adapters available to this process, by name.
///
/// The registry is built once at startup and handed to whoever needs to
/// instantiate an adapter; there is no process-wide registry.
#[derive(Clone, Default)]
pub struct SourceRegistry {
    factories: BTreeMap<String, SourceFactory>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry containing every adapter shipped with this crate.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(OpenSkySource::NAME, opensky);
        registry.register(GeneratorSource::NAME, generator);
        registry
    }

    /// Registers `factory` under `name`, replacing any previous entry.
    pub fn register(&mut self, name: &str, factory: SourceFactory) {
        if self.factories.insert(name.to_string(), factory).is_some() {
            tracing::debug!("source adapter '{name}' re-registered");
        }
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Instantiates the adapter selected by `spec`.
    pub fn create(&self, spec: &SourceSpec) -> Result<Arc<dyn SourceAdapter>, SourceError> {
        let factory = self
            .factories
            .get(&spec.name)
            .ok_or_else(|| SourceError::UnknownSource(spec.name.clone()))?;
        let source = factory(&spec.config)?;
        tracing::info!("using source adapter '{}'", spec.name);
        Ok(source)
    }
}

impl std::fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceRegistry")
            .field("names", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::SourceRegistry;
    use crate::source::{GeneratorSource, SourceAdapter, SourceError};
    use shardfeed_types::SourceSpec;
    use std::sync::Arc;

    fn spec(name: &str, config: &str) -> SourceSpec {
        SourceSpec {
            name: name.to_string(),
            config: serde_yaml::from_str(config).unwrap(),
        }
    }

    #[test]
    fn builtin_names() {
        assert_eq!(
            SourceRegistry::with_builtin().names(),
            vec!["generator", "opensky"]
        );
    }

    #[test]
    fn unknown_source() {
        let err = SourceRegistry::with_builtin()
            .create(&spec("carrier-pigeon", "{}"))
            .err()
            .unwrap();
        assert!(matches!(err, SourceError::UnknownSource(name) if name == "carrier-pigeon"));
    }

    #[test]
    fn create_generator() {
        let source = SourceRegistry::with_builtin()
            .create(&spec("generator", "records_per_batch: 3\ninterval: 7"))
            .unwrap();
        assert_eq!(source.name(), "generator");
        assert_eq!(source.poll_interval_secs().unwrap(), 7);
    }

    #[test]
    fn register_replaces_existing_entry() {
        fn tiny(_: &serde_yaml::Value) -> Result<Arc<dyn SourceAdapter>, SourceError> {
            Ok(Arc::new(GeneratorSource::new(1, 1)))
        }

        let mut registry = SourceRegistry::new();
        registry.register("opensky", tiny);
        let source = registry.create(&spec("opensky", "{}")).unwrap();
        assert_eq!(source.name(), "generator");
    }

    #[test]
    fn invalid_adapter_config() {
        let err = SourceRegistry::with_builtin()
            .create(&spec("opensky", "interval: 10"))
            .err()
            .unwrap();
        assert!(matches!(err, SourceError::InvalidConfig { .. }), "{err}");
    }
}
