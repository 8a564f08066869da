use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use vkrt_scene::BuildSettings;

/// Read from the working directory when no path is given.
pub const DEFAULT_CONFIG_PATH: &str = "vkrt.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Enables the Khronos validation layer.
    pub validation: bool,
    pub application_name: String,
    pub build: BuildSettings,
    pub scene: SceneConfig,
    /// SPIR-V files of the ray tracing pipeline. The shader binding table is
    /// only baked when these are given.
    pub shaders: Option<ShaderPaths>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            validation: false,
            application_name: "vkrt".to_string(),
            build: BuildSettings::default(),
            scene: SceneConfig::default(),
            shaders: None,
        }
    }
}

/// Layout of the procedural scene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SceneConfig {
    pub cube_count: u32,
    pub cube_size: f32,
    /// Distance between cube centers.
    pub spacing: f32,
    pub ground_size: f32,
    pub window: bool,
}

impl Default for SceneConfig {
    fn default() -> Self {
        Self {
            cube_count: 4,
            cube_size: 1.0,
            spacing: 3.0,
            ground_size: 20.0,
            window: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShaderPaths {
    pub raygen: PathBuf,
    pub closest_hit: PathBuf,
    #[serde(default)]
    pub any_hit: Option<PathBuf>,
    /// One miss group per entry.
    pub miss: Vec<PathBuf>,
    #[serde(default = "default_max_recursion_depth")]
    pub max_recursion_depth: u32,
}

fn default_max_recursion_depth() -> u32 {
    1
}

impl Config {
    pub fn from_toml(source: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(source)
    }

    /// Loads `path`, or [`DEFAULT_CONFIG_PATH`] when `None`. Only a missing
    /// default file falls back to [`Config::default`].
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::load_file(path),
            None => Self::load_or_default(Path::new(DEFAULT_CONFIG_PATH)),
        }
    }

    pub fn load_file(path: &Path) -> anyhow::Result<Self> {
        let source = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config = Self::from_toml(&source)
            .with_context(|| format!("parsing config {}", path.display()))?;
        tracing::info!(path = %path.display(), "loaded config");
        Ok(config)
    }

    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }
        Self::load_file(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            validation = true

            [build]
            non_opaque_name_pattern = "Glass"

            [scene]
            cube_count = 9
            "#,
        )
        .unwrap();
        assert!(config.validation);
        assert_eq!(config.build.non_opaque_name_pattern, "Glass");
        assert_eq!(config.build.opaque_mask, 0x01);
        assert_eq!(config.scene.cube_count, 9);
        assert_eq!(config.scene.spacing, 3.0);
        assert!(config.shaders.is_none());
    }

    #[test]
    fn test_shader_paths() {
        let config = Config::from_toml(
            r#"
            [shaders]
            raygen = "shaders/raygen.spv"
            closest_hit = "shaders/hit.spv"
            miss = ["shaders/miss.spv", "shaders/shadow.spv"]
            "#,
        )
        .unwrap();
        let shaders = config.shaders.unwrap();
        assert_eq!(shaders.miss.len(), 2);
        assert_eq!(shaders.any_hit, None);
        assert_eq!(shaders.max_recursion_depth, 1);
    }

    #[test]
    fn test_missing_files() {
        let missing = Path::new("does/not/exist/vkrt.toml");
        assert_eq!(Config::load_or_default(missing).unwrap(), Config::default());
        assert!(Config::load_file(missing).is_err());
    }

    #[test]
    fn test_rejects_unknown_types() {
        assert!(Config::from_toml("validation = \"yes\"").is_err());
    }
}
