//! Runtime configuration.
//!
//! Defaults can be overridden through `GISANDBOX_*` environment variables,
//! e.g. `GISANDBOX_ASYNC_COMPUTE=0 GISANDBOX_LPV_ITERATIONS=16`.

use std::path::PathBuf;
use std::str::FromStr;

use crate::descriptor::HeapCapacities;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}={value:?} is not a valid {expected}")]
    Parse {
        var: &'static str,
        value: String,
        expected: &'static str,
    },

    #[error("back buffer count must be 2 or 3, got {0}")]
    BackBufferCount(u32),

    #[error("window size must be non-zero, got {width}x{height}")]
    ZeroSize { width: u32, height: u32 },

    #[error("{0} heap capacity must be non-zero")]
    ZeroCapacity(&'static str),

    #[error("LPV propagation needs 1..=64 iterations, got {0}")]
    LpvIterations(u32),
}

/// Which global illumination techniques run, and how.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GiSettings {
    pub shadows: bool,
    pub rsm: bool,
    pub lpv: bool,
    pub vct: bool,
    pub reflections: bool,
    pub async_compute: bool,
    pub lpv_bundle: bool,
    pub lpv_iterations: u32,
}

impl Default for GiSettings {
    fn default() -> Self {
        Self {
            shadows: true,
            rsm: true,
            lpv: true,
            vct: false,
            reflections: true,
            async_compute: true,
            lpv_bundle: true,
            lpv_iterations: 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub back_buffer_count: u32,
    pub vsync: bool,
    pub gi: GiSettings,
    pub heaps: HeapCapacities,
    pub shader_dir: PathBuf,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            title: "GI Sandbox".to_owned(),
            width: 1280,
            height: 720,
            back_buffer_count: 2,
            vsync: true,
            gi: GiSettings::default(),
            heaps: HeapCapacities::default(),
            shader_dir: PathBuf::from("shaders"),
        }
    }
}

fn parse<T: FromStr>(var: &'static str, value: &str, expected: &'static str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Parse {
        var,
        value: value.to_owned(),
        expected,
    })
}

fn parse_bool(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        _ => Err(ConfigError::Parse {
            var,
            value: value.to_owned(),
            expected: "boolean",
        }),
    }
}

impl SandboxConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_overrides(|name| std::env::var(name).ok())
    }

    /// Applies overrides looked up by variable name, then validates.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        macro_rules! apply {
            ($var:literal, $field:expr, bool) => {
                if let Some(v) = lookup($var) {
                    $field = parse_bool($var, &v)?;
                }
            };
            ($var:literal, $field:expr, $expected:literal) => {
                if let Some(v) = lookup($var) {
                    $field = parse($var, &v, $expected)?;
                }
            };
        }

        apply!("GISANDBOX_WIDTH", self.width, "width");
        apply!("GISANDBOX_HEIGHT", self.height, "height");
        apply!("GISANDBOX_BACK_BUFFERS", self.back_buffer_count, "back buffer count");
        apply!("GISANDBOX_VSYNC", self.vsync, bool);
        apply!("GISANDBOX_ASYNC_COMPUTE", self.gi.async_compute, bool);
        apply!("GISANDBOX_LPV_BUNDLE", self.gi.lpv_bundle, bool);
        apply!("GISANDBOX_LPV_ITERATIONS", self.gi.lpv_iterations, "iteration count");
        apply!("GISANDBOX_DXR", self.gi.reflections, bool);
        if let Some(dir) = lookup("GISANDBOX_SHADER_DIR") {
            self.shader_dir = PathBuf::from(dir);
        }

        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(2..=3).contains(&self.back_buffer_count) {
            return Err(ConfigError::BackBufferCount(self.back_buffer_count));
        }
        if self.width == 0 || self.height == 0 {
            return Err(ConfigError::ZeroSize {
                width: self.width,
                height: self.height,
            });
        }
        if !(1..=64).contains(&self.gi.lpv_iterations) {
            return Err(ConfigError::LpvIterations(self.gi.lpv_iterations));
        }
        let heaps = [
            ("CBV/SRV/UAV", self.heaps.cbv_srv_uav),
            ("RTV", self.heaps.rtv),
            ("DSV", self.heaps.dsv),
            ("sampler", self.heaps.sampler),
            ("frame CBV/SRV/UAV", self.heaps.frame_cbv_srv_uav),
            ("frame sampler", self.heaps.frame_sampler),
        ];
        if let Some(&(name, _)) = heaps.iter().find(|(_, capacity)| *capacity == 0) {
            return Err(ConfigError::ZeroCapacity(name));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn with(vars: &[(&str, &str)]) -> Result<SandboxConfig, ConfigError> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        SandboxConfig::default().with_overrides(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_are_valid() {
        SandboxConfig::default().validate().unwrap();
        assert_eq!(with(&[]).unwrap(), SandboxConfig::default());
    }

    #[test]
    fn overrides_are_applied() {
        let config = with(&[
            ("GISANDBOX_WIDTH", "1920"),
            ("GISANDBOX_HEIGHT", " 1080 "),
            ("GISANDBOX_BACK_BUFFERS", "3"),
            ("GISANDBOX_VSYNC", "off"),
            ("GISANDBOX_ASYNC_COMPUTE", "0"),
            ("GISANDBOX_LPV_BUNDLE", "false"),
            ("GISANDBOX_LPV_ITERATIONS", "16"),
            ("GISANDBOX_DXR", "no"),
            ("GISANDBOX_SHADER_DIR", "assets/hlsl"),
        ])
        .unwrap();

        assert_eq!((config.width, config.height), (1920, 1080));
        assert_eq!(config.back_buffer_count, 3);
        assert!(!config.vsync);
        assert!(!config.gi.async_compute);
        assert!(!config.gi.lpv_bundle);
        assert_eq!(config.gi.lpv_iterations, 16);
        assert!(!config.gi.reflections);
        assert_eq!(config.shader_dir, PathBuf::from("assets/hlsl"));
    }

    #[test]
    fn malformed_values_name_the_variable() {
        let err = with(&[("GISANDBOX_VSYNC", "sometimes")]).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { var: "GISANDBOX_VSYNC", .. }));
        assert!(err.to_string().contains("GISANDBOX_VSYNC"));

        assert!(matches!(
            with(&[("GISANDBOX_WIDTH", "-5")]),
            Err(ConfigError::Parse { var: "GISANDBOX_WIDTH", .. })
        ));
    }

    #[test]
    fn validation_rejects_out_of_range_values() {
        assert_eq!(with(&[("GISANDBOX_BACK_BUFFERS", "1")]), Err(ConfigError::BackBufferCount(1)));
        assert_eq!(with(&[("GISANDBOX_BACK_BUFFERS", "4")]), Err(ConfigError::BackBufferCount(4)));
        assert_eq!(
            with(&[("GISANDBOX_HEIGHT", "0")]),
            Err(ConfigError::ZeroSize { width: 1280, height: 0 })
        );
        assert_eq!(with(&[("GISANDBOX_LPV_ITERATIONS", "0")]), Err(ConfigError::LpvIterations(0)));

        let mut config = SandboxConfig::default();
        config.heaps.dsv = 0;
        assert_eq!(config.validate(), Err(ConfigError::ZeroCapacity("DSV")));
    }
}
