//! Runtime configuration for ray-traced still renders.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Encoding of a rendered still.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// 8-bit tone-mapped PNG.
    #[default]
    Png,
    /// 32-bit float Radiance HDR.
    Hdr,
}

impl OutputFormat {
    /// Infer the format from a file extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "png" => Some(Self::Png),
            "hdr" => Some(Self::Hdr),
            _ => None,
        }
    }

    pub const fn extension(self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Hdr => "hdr",
        }
    }
}

/// Sample count, bounce depth, resolution and output target of a render.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderSettings {
    pub samples: u32,
    pub max_depth: u32,
    pub width: u32,
    pub height: u32,
    pub output: PathBuf,
    pub format: OutputFormat,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            samples: 64,
            max_depth: 4,
            width: 1024,
            height: 1024,
            output: PathBuf::from("render.png"),
            format: OutputFormat::Png,
        }
    }
}

impl RenderSettings {
    #[must_use]
    pub const fn with_samples(mut self, samples: u32) -> Self {
        self.samples = samples;
        self
    }

    #[must_use]
    pub const fn with_max_depth(mut self, max_depth: u32) -> Self {
        self.max_depth = max_depth;
        self
    }

    #[must_use]
    pub const fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    /// Set the output path, adopting its extension's format when recognised.
    #[must_use]
    pub fn with_output(mut self, output: impl Into<PathBuf>) -> Self {
        self.output = output.into();
        if let Some(format) = OutputFormat::from_path(&self.output) {
            self.format = format;
        }
        self
    }

    #[must_use]
    pub const fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Reject settings that cannot produce an image.
    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(Error::OutOfRange(format!(
                "resolution {}x{} must be non-zero",
                self.width, self.height
            )));
        }
        if self.output.as_os_str().is_empty() {
            return Err(Error::InvalidData("output path is empty".to_string()));
        }
        Ok(())
    }

    /// Parse flags from command line arguments.
    ///
    /// Recognizes:
    /// - `--samples <N>`
    /// - `--max-depth <N>`
    /// - `--width <N>` / `--height <N>`
    /// - `-o` or `--output <PATH>` (format follows the extension)
    /// - `--format <png|hdr>`
    pub fn parse_args(mut self, args: &[String]) -> Result<Self> {
        let mut i = 1;
        while i < args.len() {
            let value = args.get(i + 1);
            let mut consumed = true;
            match args[i].as_str() {
                "--samples" => self.samples = parse_number(args[i].as_str(), value)?,
                "--max-depth" => self.max_depth = parse_number(args[i].as_str(), value)?,
                "--width" => self.width = parse_number(args[i].as_str(), value)?,
                "--height" => self.height = parse_number(args[i].as_str(), value)?,
                "-o" | "--output" => {
                    let path = value.ok_or_else(|| missing(args[i].as_str()))?;
                    self = self.with_output(path);
                }
                "--format" => {
                    let name = value.ok_or_else(|| missing(args[i].as_str()))?;
                    self.format = match name.to_ascii_lowercase().as_str() {
                        "png" => OutputFormat::Png,
                        "hdr" => OutputFormat::Hdr,
                        other => {
                            return Err(Error::InvalidData(format!("unknown format '{other}'")))
                        }
                    };
                }
                _ => consumed = false,
            }
            i += if consumed { 2 } else { 1 };
        }
        Ok(self)
    }
}

fn missing(flag: &str) -> Error {
    Error::InvalidData(format!("{flag} expects a value"))
}

fn parse_number(flag: &str, value: Option<&String>) -> Result<u32> {
    let value = value.ok_or_else(|| missing(flag))?;
    value
        .parse()
        .map_err(|_| Error::InvalidData(format!("{flag}: '{value}' is not a number")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("prism")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn output_extension_selects_format() {
        let settings = RenderSettings::default().with_output("out/still.HDR");
        assert_eq!(settings.format, OutputFormat::Hdr);
        let settings = settings.with_output("still.exr");
        assert_eq!(settings.format, OutputFormat::Hdr);
    }

    #[test]
    fn parse_full_flag_set() {
        let settings = RenderSettings::default()
            .parse_args(&args(&[
                "--samples", "256", "--max-depth", "8", "--width", "1024", "--height", "512",
                "-o", "scene.hdr",
            ]))
            .unwrap();
        assert_eq!(settings.samples, 256);
        assert_eq!(settings.max_depth, 8);
        assert_eq!((settings.width, settings.height), (1024, 512));
        assert_eq!(settings.format, OutputFormat::Hdr);
    }

    #[test]
    fn parse_rejects_bad_number() {
        let result = RenderSettings::default().parse_args(&args(&["--samples", "lots"]));
        assert!(result.is_err());
    }

    #[test]
    fn parse_ignores_unknown_flags() {
        let settings = RenderSettings::default()
            .parse_args(&args(&["--verbose", "--samples", "0"]))
            .unwrap();
        assert_eq!(settings.samples, 0);
    }

    #[test]
    fn zero_resolution_is_invalid() {
        assert!(RenderSettings::default()
            .with_resolution(0, 10)
            .validate()
            .is_err());
        assert!(RenderSettings::default().with_samples(0).validate().is_ok());
    }

    #[test]
    fn explicit_format_overrides_extension() {
        let settings = RenderSettings::default()
            .parse_args(&args(&["-o", "still.png", "--format", "hdr"]))
            .unwrap();
        assert_eq!(settings.format, OutputFormat::Hdr);
        assert_eq!(settings.format.extension(), "hdr");
    }
}
