use super::schema::Config;
use crate::error::{ConfigError, Result};
use figment::{
    providers::{Env, Format, Json, Toml, Yaml},
    Figment,
};
use std::path::{Path, PathBuf};

pub async fn load_from_env_or_file() -> Result<Config> {
    let config: Config = Figment::new()
        .merge(Toml::file("pipeline.toml"))
        .merge(Json::file("pipeline.json"))
        .merge(Yaml::file("pipeline.yaml"))
        .merge(Yaml::file("pipeline.yml"))
        .merge(Env::prefixed("PIPELINE_").split("__"))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    finish(config)
}

pub async fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();

    let figment = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => Figment::new().merge(Toml::file(path)),
        Some("json") => Figment::new().merge(Json::file(path)),
        Some("yaml") | Some("yml") => Figment::new().merge(Yaml::file(path)),
        _ => {
            return Err(ConfigError::Parse(
                "Unsupported config file format. Use .toml, .json, .yaml, or .yml".into(),
            )
            .into())
        }
    };

    let config: Config = figment
        .merge(Env::prefixed("PIPELINE_").split("__"))
        .extract()
        .map_err(|e| ConfigError::Parse(e.to_string()))?;

    finish(config)
}

fn finish(config: Config) -> Result<Config> {
    let config = apply_env_substitutions(config)?;
    validate(&config)?;
    Ok(resolve_relative_dirs(config))
}

pub fn validate(config: &Config) -> Result<()> {
    let engine = &config.engine;

    if engine.control_destination.trim().is_empty() {
        return Err(ConfigError::Validation("Control destination must not be empty".into()).into());
    }

    if engine.ready_poll_interval_ms == 0 {
        return Err(
            ConfigError::Validation("Ready poll interval must be greater than 0".into()).into(),
        );
    }

    if engine.ready_poll_interval_ms > engine.ready_timeout_ms {
        return Err(ConfigError::Validation(format!(
            "Ready poll interval ({}ms) exceeds ready timeout ({}ms)",
            engine.ready_poll_interval_ms, engine.ready_timeout_ms
        ))
        .into());
    }

    if engine.startup_dir == engine.plugin_dir {
        return Err(ConfigError::Validation(format!(
            "Startup and plugin directories must differ: {}",
            engine.startup_dir.display()
        ))
        .into());
    }

    for (logical, address) in &config.destinations {
        if address.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "Destination '{}' maps to an empty address",
                logical
            ))
            .into());
        }
    }

    Ok(())
}

fn apply_env_substitutions(mut config: Config) -> Result<Config> {
    config.engine.startup_dir = substitute_path(&config.engine.startup_dir)?;
    config.engine.plugin_dir = substitute_path(&config.engine.plugin_dir)?;
    if let Some(scratch) = &config.engine.scratch_dir {
        config.engine.scratch_dir = Some(substitute_path(scratch)?);
    }

    for (_, address) in config.destinations.iter_mut() {
        *address = substitute_env_vars(address)?;
    }

    Ok(config)
}

fn resolve_relative_dirs(mut config: Config) -> Config {
    if let Ok(cwd) = std::env::current_dir() {
        let absolute = |p: &PathBuf| if p.is_relative() { cwd.join(p) } else { p.clone() };
        config.engine.startup_dir = absolute(&config.engine.startup_dir);
        config.engine.plugin_dir = absolute(&config.engine.plugin_dir);
        config.engine.scratch_dir = config.engine.scratch_dir.as_ref().map(absolute);
    }
    config
}

fn substitute_path(path: &Path) -> Result<PathBuf> {
    Ok(PathBuf::from(substitute_env_vars(&path.to_string_lossy())?))
}

fn substitute_env_vars(input: &str) -> Result<String> {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| ConfigError::Parse(format!("Invalid substitution pattern: {e}")))?;

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        // ${VAR:-default}
        if let Some((name, default)) = var_name.split_once(":-") {
            match std::env::var(name) {
                Ok(value) => result = result.replace(&cap[0], &value),
                Err(_) => result = result.replace(&cap[0], default),
            }
            continue;
        }
        match std::env::var(var_name) {
            Ok(value) => result = result.replace(&cap[0], &value),
            Err(_) => {
                return Err(ConfigError::EnvVar(format!(
                    "Environment variable '{}' not found",
                    var_name
                ))
                .into());
            }
        }
    }

    Ok(result)
}
