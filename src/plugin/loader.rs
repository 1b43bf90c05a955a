use super::dylib::{LibraryPlugin, LoadedLibrary, PluginRegistrar};
use super::{MessageContext, Plugin, PluginDescriptor, PluginFactory, PluginInstance, PluginSpec};
use crate::bus::{MessageBus, NameResolver};
use crate::error::LoadError;
use crate::state::Metrics;
use std::collections::HashMap;
use std::env::consts::{DLL_PREFIX, DLL_SUFFIX};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Identifiers under this prefix are resolved child-first.
pub const PLUGIN_NAMESPACE: &str = "pipeline.plugin.";

/// Plugin types compiled into the host process.
#[derive(Clone, Default)]
pub struct FactoryRegistry {
    factories: HashMap<String, PluginFactory>,
}

impl FactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        super::builtin::register_builtins(&mut registry);
        registry
    }

    pub fn register(&mut self, type_name: impl Into<String>, factory: PluginFactory) {
        self.factories.insert(type_name.into(), factory);
    }

    pub fn get(&self, type_name: &str) -> Option<PluginFactory> {
        self.factories.get(type_name).copied()
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.factories.contains_key(type_name)
    }

    pub fn type_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

impl PluginRegistrar for FactoryRegistry {
    fn register_plugin(&mut self, type_name: &str, factory: PluginFactory) {
        self.register(type_name, factory);
    }
}

/// One place a plugin type may be found, in the order they are tried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodeSource {
    /// Plugin directory, searched for a library named after the type.
    Directory(PathBuf),
    /// Explicit library named by the control message.
    Library(PathBuf),
    /// Factories compiled into the host.
    Host,
}

/// `pipeline.plugin.XmlTransform` -> `libxml_transform.so` (platform naming).
pub fn library_file_name(type_name: &str) -> String {
    let last = type_name.rsplit('.').next().unwrap_or(type_name);
    let mut stem = String::with_capacity(last.len() + 4);
    for (i, c) in last.chars().enumerate() {
        if c.is_uppercase() {
            if i > 0 {
                stem.push('_');
            }
            stem.extend(c.to_lowercase());
        } else {
            stem.push(c);
        }
    }
    format!("{DLL_PREFIX}{stem}{DLL_SUFFIX}")
}

fn archive_path(location: &str) -> Result<PathBuf, LoadError> {
    let malformed = |reason: String| LoadError::MalformedArchive {
        location: location.to_string(),
        reason,
    };

    if !location.contains("://") {
        return Ok(PathBuf::from(location));
    }
    let url = url::Url::parse(location).map_err(|e| malformed(e.to_string()))?;
    if url.scheme() != "file" {
        return Err(malformed(format!("unsupported scheme '{}'", url.scheme())));
    }
    url.to_file_path()
        .map_err(|_| malformed("not a local file path".to_string()))
}

/// Locates and instantiates plugin code.
///
/// Every load opens libraries afresh, so a type replaced on disk is picked up
/// by the next `new` or `update` without restarting the host.
pub struct TransformLoader {
    plugin_dir: PathBuf,
    scratch_dir: PathBuf,
    host: FactoryRegistry,
    bus: Arc<dyn MessageBus>,
    resolver: Arc<dyn NameResolver>,
    context: Arc<MessageContext>,
    metrics: Option<Arc<Metrics>>,
}

impl TransformLoader {
    pub fn new(
        plugin_dir: impl Into<PathBuf>,
        scratch_dir: impl Into<PathBuf>,
        host: FactoryRegistry,
        bus: Arc<dyn MessageBus>,
        resolver: Arc<dyn NameResolver>,
        context: Arc<MessageContext>,
    ) -> Self {
        Self {
            plugin_dir: plugin_dir.into(),
            scratch_dir: scratch_dir.into(),
            host,
            bus,
            resolver,
            context,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn plugin_dir(&self) -> &Path {
        &self.plugin_dir
    }

    pub fn host_types(&self) -> Vec<String> {
        self.host.type_names()
    }

    /// Sources tried for a `pipeline.plugin.*` type, given the optional archive hint.
    pub fn search_order(&self, archive: Option<&str>) -> Result<Vec<CodeSource>, LoadError> {
        let mut order = vec![CodeSource::Directory(self.plugin_dir.clone())];
        if let Some(location) = archive.map(str::trim).filter(|a| !a.is_empty()) {
            order.push(CodeSource::Library(archive_path(location)?));
        }
        order.push(CodeSource::Host);
        Ok(order)
    }

    /// Build an unstarted instance for `descriptor`.
    pub fn load(&self, descriptor: &PluginDescriptor) -> Result<PluginInstance, LoadError> {
        let spec = PluginSpec::resolve(descriptor, self.resolver.as_ref())?;
        let plugin = self.construct(&spec, descriptor.archive.as_deref())?;

        let instance = PluginInstance::new(
            descriptor.clone(),
            spec,
            plugin,
            self.bus.clone(),
            self.context.clone(),
        );
        Ok(match &self.metrics {
            Some(metrics) => instance.with_metrics(metrics.clone()),
            None => instance,
        })
    }

    fn construct(
        &self,
        spec: &PluginSpec,
        archive: Option<&str>,
    ) -> Result<Box<dyn Plugin>, LoadError> {
        let type_name = spec.type_name.trim();

        if !type_name.starts_with(PLUGIN_NAMESPACE) {
            return match self.host.get(type_name) {
                Some(factory) => build(factory, spec),
                None => Err(LoadError::TypeNotFound {
                    type_name: type_name.to_string(),
                }),
            };
        }

        for source in self.search_order(archive)? {
            match source {
                CodeSource::Directory(dir) => {
                    let candidate = dir.join(library_file_name(type_name));
                    if candidate.is_file() {
                        if let Some(plugin) = self.from_library(&candidate, spec)? {
                            return Ok(plugin);
                        }
                    }
                }
                CodeSource::Library(path) => {
                    if let Some(plugin) = self.from_library(&path, spec)? {
                        return Ok(plugin);
                    }
                }
                CodeSource::Host => {
                    if let Some(factory) = self.host.get(type_name) {
                        tracing::debug!(plugin_type = %type_name, "Resolved from host");
                        return build(factory, spec);
                    }
                }
            }
        }

        Err(LoadError::TypeNotFound {
            type_name: type_name.to_string(),
        })
    }

    fn from_library(
        &self,
        path: &Path,
        spec: &PluginSpec,
    ) -> Result<Option<Box<dyn Plugin>>, LoadError> {
        let library = Arc::new(LoadedLibrary::open(path, &self.scratch_dir)?);
        let Some(factory) = library.factory(spec.type_name.trim()) else {
            tracing::debug!(
                library = %path.display(),
                plugin_type = %spec.type_name,
                provided = ?library.type_names(),
                "Library does not provide type"
            );
            return Ok(None);
        };

        tracing::info!(plugin_type = %spec.type_name, library = %path.display(), "Resolved from library");
        let inner = build(factory, spec)?;
        Ok(Some(Box::new(LibraryPlugin::new(inner, library))))
    }
}

fn build(factory: PluginFactory, spec: &PluginSpec) -> Result<Box<dyn Plugin>, LoadError> {
    factory(spec).map_err(|source| LoadError::Construction {
        type_name: spec.type_name.clone(),
        source,
    })
}
