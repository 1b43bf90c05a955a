use crate::config::Config;
use crate::control::{ControlMessage, DescriptorStore};
use crate::error::{ConfigError, PipelineError, Result};
use crate::plugin::FactoryRegistry;
use crate::PROTOCOL_VERSION;
use tracing::{error, info, warn};

/// Validate the configuration and every persisted descriptor without starting anything.
pub async fn run_config_check(config: Config) -> Result<()> {
    info!("Checking configuration...");

    crate::config::validate(&config)?;
    info!("✓ Configuration is valid");
    info!("  Control destination: {}", config.engine.control_destination);
    info!("  Startup directory: {}", config.engine.startup_dir.display());
    info!("  Plugin directory: {}", config.engine.plugin_dir.display());

    if !config.engine.plugin_dir.is_dir() {
        warn!("  ! Plugin directory does not exist yet; it is created on start");
    }

    let host = FactoryRegistry::with_builtins();
    let store = DescriptorStore::new(config.engine.startup_dir.clone());
    let descriptors = store.load_all().await?;
    info!("Checking {} persisted descriptor(s)...", descriptors.len());

    let mut all_ok = true;
    for descriptor in &descriptors {
        let parsed = ControlMessage::parse(&descriptor.contents, config.engine.validated)
            .and_then(|message| message.check_version(PROTOCOL_VERSION).map(|_| message));
        match parsed {
            Ok(message) => {
                info!(
                    "  ✓ {} ({}) would be replayed as '{}'",
                    message.name(),
                    message.descriptor.type_name,
                    message.action
                );
                let type_name = &message.descriptor.type_name;
                if !type_name.starts_with(crate::plugin::PLUGIN_NAMESPACE)
                    && !host.contains(type_name)
                {
                    warn!("  ! {} is not a host plugin type", type_name);
                }
            }
            Err(e) => {
                error!("  ✗ {}: {}", descriptor.path.display(), e);
                all_ok = false;
            }
        }
    }

    if all_ok {
        info!("✓ All checks passed");
        Ok(())
    } else {
        Err(PipelineError::Config(ConfigError::Validation(
            "One or more persisted descriptors are invalid".to_string(),
        )))
    }
}
