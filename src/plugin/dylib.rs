//! Shared-library plugins.
//!
//! A plugin library is a `cdylib` that links against this crate and exports a
//! [`PluginDeclaration`] named `pipeline_plugin_declaration`, normally through
//! [`declare_plugin!`](crate::declare_plugin). The host never opens the file in
//! the plugin directory directly: every load copies it to a fresh shadow path
//! first, so replacing the library on disk and loading again yields new code
//! even while an older copy is still mapped.

use super::{MessageContext, Plugin, PluginFactory};
use crate::bus::BusMessage;
use crate::error::{LoadError, PluginError};
use async_trait::async_trait;
use libloading::Library;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Bumped whenever [`PluginDeclaration`] or [`PluginRegistrar`] change shape.
pub const ABI_VERSION: u32 = 1;

/// Host crate version a library must have been built against.
pub const HOST_VERSION: &str = env!("CARGO_PKG_VERSION");

const DECLARATION_SYMBOL: &[u8] = b"pipeline_plugin_declaration\0";

/// Receives the plugin types a library (or the host) provides.
pub trait PluginRegistrar {
    fn register_plugin(&mut self, type_name: &str, factory: PluginFactory);
}

#[derive(Clone, Copy)]
pub struct PluginDeclaration {
    pub abi_version: u32,
    pub host_version: &'static str,
    pub register: fn(&mut dyn PluginRegistrar),
}

/// Export the declaration for a plugin library.
///
/// ```ignore
/// fn register(registrar: &mut dyn PluginRegistrar) {
///     registrar.register_plugin("pipeline.plugin.Fake", Fake::create);
/// }
///
/// plugin_pipeline::declare_plugin!(register);
/// ```
#[macro_export]
macro_rules! declare_plugin {
    ($register:expr) => {
        #[doc(hidden)]
        #[no_mangle]
        #[allow(non_upper_case_globals)]
        pub static pipeline_plugin_declaration: $crate::plugin::PluginDeclaration =
            $crate::plugin::PluginDeclaration {
                abi_version: $crate::plugin::ABI_VERSION,
                host_version: $crate::plugin::HOST_VERSION,
                register: $register,
            };
    };
}

#[derive(Default)]
struct CollectedFactories(HashMap<String, PluginFactory>);

impl PluginRegistrar for CollectedFactories {
    fn register_plugin(&mut self, type_name: &str, factory: PluginFactory) {
        self.0.insert(type_name.to_string(), factory);
    }
}

/// An opened shadow copy of a plugin library. Unloaded and deleted on drop.
pub struct LoadedLibrary {
    library: Option<Library>,
    source: PathBuf,
    shadow: PathBuf,
    factories: HashMap<String, PluginFactory>,
}

impl LoadedLibrary {
    pub fn open(source: &Path, scratch_dir: &Path) -> Result<Self, LoadError> {
        let library_error = |reason: String| LoadError::Library {
            path: source.display().to_string(),
            reason,
        };

        let file_name = source
            .file_name()
            .ok_or_else(|| library_error("not a file".to_string()))?
            .to_string_lossy();
        std::fs::create_dir_all(scratch_dir).map_err(|e| library_error(e.to_string()))?;
        let shadow = scratch_dir.join(format!("{}-{}", uuid::Uuid::new_v4(), file_name));
        std::fs::copy(source, &shadow).map_err(|e| library_error(e.to_string()))?;

        // SAFETY: plugin libraries are trusted code placed by the operator.
        let library = match unsafe { Library::new(&shadow) } {
            Ok(library) => library,
            Err(e) => {
                let _ = std::fs::remove_file(&shadow);
                return Err(library_error(e.to_string()));
            }
        };

        let mut loaded = Self {
            library: Some(library),
            source: source.to_path_buf(),
            shadow,
            factories: HashMap::new(),
        };
        let declaration = loaded.declaration()?;
        let mut collected = CollectedFactories::default();
        (declaration.register)(&mut collected);
        loaded.factories = collected.0;

        tracing::debug!(
            library = %loaded.source.display(),
            shadow = %loaded.shadow.display(),
            types = loaded.factories.len(),
            "Plugin library loaded"
        );
        Ok(loaded)
    }

    fn declaration(&self) -> Result<PluginDeclaration, LoadError> {
        let path = self.source.display().to_string();
        let library = self.library.as_ref().ok_or_else(|| LoadError::Library {
            path: path.clone(),
            reason: "library already unloaded".to_string(),
        })?;

        // SAFETY: the symbol is a `PluginDeclaration` static emitted by `declare_plugin!`;
        // the versions are checked before any other field is used.
        let declaration = unsafe {
            library
                .get::<*mut PluginDeclaration>(DECLARATION_SYMBOL)
                .map_err(|_| LoadError::MissingEntryPoint { path: path.clone() })?
                .read()
        };

        if declaration.abi_version != ABI_VERSION || declaration.host_version != HOST_VERSION {
            return Err(LoadError::AbiMismatch {
                path,
                expected_abi: ABI_VERSION,
                actual_abi: declaration.abi_version,
                expected_host: HOST_VERSION.to_string(),
                actual_host: declaration.host_version.to_string(),
            });
        }
        Ok(declaration)
    }

    pub fn factory(&self, type_name: &str) -> Option<PluginFactory> {
        self.factories.get(type_name).copied()
    }

    pub fn type_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn source(&self) -> &Path {
        &self.source
    }
}

impl Drop for LoadedLibrary {
    fn drop(&mut self) {
        self.factories.clear();
        drop(self.library.take());
        if let Err(e) = std::fs::remove_file(&self.shadow) {
            tracing::debug!(shadow = %self.shadow.display(), error = %e, "Failed to remove library shadow copy");
        }
    }
}

/// A transform built by library code. Keeps the library mapped for as long as
/// the transform exists.
pub struct LibraryPlugin {
    // Field order matters: the transform must drop before its library.
    inner: Box<dyn Plugin>,
    _library: Arc<LoadedLibrary>,
}

impl LibraryPlugin {
    pub fn new(inner: Box<dyn Plugin>, library: Arc<LoadedLibrary>) -> Self {
        Self {
            inner,
            _library: library,
        }
    }
}

#[async_trait]
impl Plugin for LibraryPlugin {
    async fn on_message(
        &self,
        message: &BusMessage,
        context: &MessageContext,
    ) -> Result<Option<String>, PluginError> {
        self.inner.on_message(message, context).await
    }

    async fn shutdown(&self) {
        self.inner.shutdown().await;
    }
}
