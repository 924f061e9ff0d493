use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, anyhow, bail};
use clap::Parser;
use frame_bus::{BusConfig, CloseMode, FrameRequest, PixelFormat};
use serde::Deserialize;

const DEFAULT_INPUT: &str = "synthetic://1280x720@30";
const DEFAULT_BUFFER: usize = 5;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// JSON file with input, buffer, consumers and bus settings
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// File path, URL, or synthetic://WIDTHxHEIGHT@RATE locator
    #[arg(long)]
    pub input: Option<String>,
    /// Decoded frames kept in the ring
    #[arg(long)]
    pub buffer: Option<usize>,
    /// NAME:FORMAT[:INDEX[:WxH]], repeatable
    #[arg(long = "consumer")]
    pub consumers: Vec<ConsumerConfig>,
    /// Stop after every consumer has read this many frames
    #[arg(long)]
    pub frames: Option<u64>,
    #[arg(long)]
    pub hard_close: bool,
    #[arg(long)]
    pub log_level: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
pub struct ConsumerConfig {
    pub name: String,
    pub format: PixelFormat,
    #[serde(default)]
    pub index: i32,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
    /// Append every served frame to this file.
    #[serde(default)]
    pub dump: Option<PathBuf>,
}

impl ConsumerConfig {
    pub fn request(&self) -> FrameRequest {
        FrameRequest::new(self.index, self.format).with_size(self.width, self.height)
    }
}

impl FromStr for ConsumerConfig {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let mut parts = s.split(':');
        let name = parts
            .next()
            .filter(|name| !name.is_empty())
            .ok_or_else(|| anyhow!("consumer needs a name: {:?}", s))?;
        let format = parts
            .next()
            .ok_or_else(|| anyhow!("consumer {} needs a format", name))?
            .parse()?;

        let mut consumer = ConsumerConfig {
            name: name.to_string(),
            format,
            index: 0,
            width: 0,
            height: 0,
            dump: None,
        };
        if let Some(index) = parts.next() {
            consumer.index = index.parse().with_context(|| format!("index of {}", name))?;
        }
        if let Some(size) = parts.next() {
            let (width, height) = size
                .split_once('x')
                .ok_or_else(|| anyhow!("size of {} must be WIDTHxHEIGHT", name))?;
            consumer.width = width.parse().with_context(|| format!("width of {}", name))?;
            consumer.height = height.parse().with_context(|| format!("height of {}", name))?;
        }
        if parts.next().is_some() {
            bail!("too many fields in consumer {:?}", s);
        }
        Ok(consumer)
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub input: String,
    pub buffer: usize,
    pub consumers: Vec<ConsumerConfig>,
    pub frames: Option<u64>,
    pub hard_close: bool,
    pub log_level: String,
    pub bus: BusConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            input: DEFAULT_INPUT.to_string(),
            buffer: DEFAULT_BUFFER,
            consumers: Vec::new(),
            frames: None,
            hard_close: false,
            log_level: "info".to_string(),
            bus: BusConfig::default(),
        }
    }
}

impl AppConfig {
    /// Config file (if any) with command-line overrides applied on top.
    pub fn load(cli: Cli) -> anyhow::Result<Self> {
        let mut config = match &cli.config {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply(cli);
        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parse config {}", path.display()))
    }

    fn apply(&mut self, cli: Cli) {
        if let Some(input) = cli.input {
            self.input = input;
        }
        if let Some(buffer) = cli.buffer {
            self.buffer = buffer;
        }
        if !cli.consumers.is_empty() {
            self.consumers = cli.consumers;
        }
        if cli.frames.is_some() {
            self.frames = cli.frames;
        }
        if cli.hard_close {
            self.hard_close = true;
        }
        if let Some(level) = cli.log_level {
            self.log_level = level;
        }
    }

    pub fn log_level(&self) -> anyhow::Result<log::LevelFilter> {
        self.log_level
            .parse()
            .with_context(|| format!("invalid log level {:?}", self.log_level))
    }

    pub fn close_mode(&self) -> CloseMode {
        if self.hard_close {
            CloseMode::Hard
        } else {
            CloseMode::Soft
        }
    }
}
