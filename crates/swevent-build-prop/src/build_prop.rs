use log::{debug, error};
use std::collections::HashMap;
use std::fs;
use std::io::{Error, ErrorKind};
use std::path::PathBuf;
use swevent_core::target::{TargetDetector, TargetId};

/// Location of the system properties on Android.
pub const DEFAULT_BUILD_PROP: &str = "/system/build.prop";

const MODEL_KEY: &str = "ro.product.model";
const BUILD_ID_KEY: &str = "ro.build.display.id";

/// Detector reading `ro.product.model` and `ro.build.display.id` from a properties file.
#[derive(Clone, Debug)]
pub struct BuildProp {
    path: PathBuf,
}

impl Default for BuildProp {
    fn default() -> Self {
        BuildProp::new(DEFAULT_BUILD_PROP)
    }
}

impl BuildProp {
    /// Creates a detector reading the properties file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        BuildProp { path: path.into() }
    }
}

/// Parses `key=value` lines. Blank lines and `#` comments are skipped, later keys win.
pub fn parse_props(contents: &str) -> HashMap<String, String> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

fn require(props: &HashMap<String, String>, key: &str) -> std::io::Result<String> {
    props
        .get(key)
        .cloned()
        .ok_or_else(|| Error::new(ErrorKind::InvalidData, format!("{} not set", key)))
}

impl TargetDetector for BuildProp {
    fn detect(&self) -> std::io::Result<TargetId> {
        let contents = fs::read_to_string(&self.path)?;
        let props = parse_props(&contents);
        let id = TargetId::new(require(&props, MODEL_KEY)?, require(&props, BUILD_ID_KEY)?);
        debug!("Detected {} from {}", id, self.path.display());
        Ok(id)
    }

    fn report_unsupported(&self, id: &TargetId) {
        error!("{}=\"{}\"", MODEL_KEY, id.model);
        error!("{}=\"{}\"", BUILD_ID_KEY, id.build_id);
        error!("This device is not supported. Please report the two lines above.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROPS: &str = "
# begin build properties
ro.build.id=JRO03C
ro.build.display.id=JRO03C
ro.product.model=HTL21
ro.product.brand = htc
malformed line

ro.build.display.id=JRO03C
";

    #[test]
    fn test_parse_props() {
        let props = parse_props(PROPS);
        assert_eq!(props.get("ro.product.model").map(String::as_str), Some("HTL21"));
        assert_eq!(props.get("ro.product.brand").map(String::as_str), Some("htc"));
        assert!(!props.contains_key("malformed line"));
        assert_eq!(props.len(), 4);
    }

    #[test]
    fn test_detect() -> std::io::Result<()> {
        let path = std::env::temp_dir().join(format!("swevent-build-{}.prop", std::process::id()));
        fs::write(&path, PROPS)?;
        let id = BuildProp::new(&path).detect()?;
        assert_eq!(id, TargetId::new("HTL21", "JRO03C"));
        fs::remove_file(&path)?;
        Ok(())
    }

    #[test]
    fn test_detect_missing_key() -> std::io::Result<()> {
        let path = std::env::temp_dir().join(format!("swevent-nomodel-{}.prop", std::process::id()));
        fs::write(&path, "ro.build.display.id=JRO03C\n")?;
        let err = BuildProp::new(&path).detect().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
        fs::remove_file(&path)?;
        Ok(())
    }

    #[test]
    fn test_detect_missing_file() {
        let err = BuildProp::new("/nonexistent/build.prop").detect().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
