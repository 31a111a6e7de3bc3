//! Command-line entry parsing.

use std::path::PathBuf;

use anyhow::{anyhow, bail, Result};

use crate::engine::config::CameraConfig;

const USAGE: &str = "Usage: visibility-cam <config.json> \
[--rtsp-url <uri>] [--output-dir <path>] [--name <camera-name>] [--print-config]";

/// Parsed invocation: a config file plus optional overrides.
#[derive(Debug)]
pub struct RunOptions {
    pub config_path: PathBuf,
    pub rtsp_url: Option<String>,
    pub output_dir: Option<PathBuf>,
    pub name: Option<String>,
    pub print_config: bool,
}

impl RunOptions {
    pub fn from_args(args: &[String]) -> Result<Self> {
        let config_path = match args.get(1) {
            Some(path) if !path.starts_with("--") => PathBuf::from(path),
            _ => bail!("{USAGE}"),
        };

        let mut options = Self {
            config_path,
            rtsp_url: None,
            output_dir: None,
            name: None,
            print_config: false,
        };

        let mut idx = 2;
        while idx < args.len() {
            match args[idx].as_str() {
                "--rtsp-url" => {
                    idx += 1;
                    let value = args
                        .get(idx)
                        .ok_or_else(|| anyhow!("--rtsp-url requires a value"))?;
                    options.rtsp_url = Some(value.clone());
                    idx += 1;
                }
                "--output-dir" => {
                    idx += 1;
                    let value = args
                        .get(idx)
                        .ok_or_else(|| anyhow!("--output-dir requires a value"))?;
                    options.output_dir = Some(PathBuf::from(value));
                    idx += 1;
                }
                "--name" => {
                    idx += 1;
                    let value = args
                        .get(idx)
                        .ok_or_else(|| anyhow!("--name requires a value"))?;
                    if value.trim().is_empty() {
                        bail!("--name must not be empty");
                    }
                    options.name = Some(value.clone());
                    idx += 1;
                }
                "--print-config" => {
                    options.print_config = true;
                    idx += 1;
                }
                other => bail!("Unrecognised flag: {other}\n{USAGE}"),
            }
        }

        Ok(options)
    }

    /// Load the config file and apply command-line overrides.
    pub fn load_config(&self) -> Result<CameraConfig> {
        let mut config = CameraConfig::load(&self.config_path)?;
        if let Some(rtsp_url) = &self.rtsp_url {
            config.rtsp_url = rtsp_url.clone();
        }
        if let Some(output_dir) = &self.output_dir {
            config.output_dir = output_dir.clone();
        }
        if let Some(name) = &self.name {
            config.name = name.clone();
        }
        config.validate()?;
        Ok(config)
    }
}
