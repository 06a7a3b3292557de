/*
 * Copyright (c) 2024 Yunshan Networks
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::flow_generator::flow_config::{
    TIMEOUT_TCP, TIMEOUT_TCP_FIN, TIMEOUT_TCP_RST, TIMEOUT_UDP,
};
use crate::source::SourceFormat;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("sampling-rate must be within (0, 100], got {0}")]
    SamplingRateInvalid(f64),
    #[error("output-dir is empty")]
    OutputDirEmpty,
}

#[derive(Debug, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    pub log_file: String,
    pub log_level: String,

    pub source_format: SourceFormat,
    pub output_dir: PathBuf,

    /// Packet sampling percentage at fingerprint granularity, (0, 100].
    pub sampling_rate: f64,
    /// Denominator attached to each exported record.
    pub metric_sampling_rate: i64,
    pub compute_request_response: bool,
    pub export_buffer_size: usize,

    pub tcp_filter: Vec<u16>,
    pub udp_filter: Vec<u16>,
    pub drop_incomplete_tcp: bool,

    #[serde(with = "humantime_serde")]
    pub tcp_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub tcp_fin_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub tcp_rst_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub udp_timeout: Duration,

    pub reorder_buffer_size: usize,
    pub decoder_workers: usize,
    pub decoder_channels: usize,

    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,
    /// 0 means no limit.
    pub packet_limit: u64,
}

impl Config {
    pub fn load_from_file<T: AsRef<Path>>(path: T) -> Result<Config, io::Error> {
        let contents = fs::read_to_string(path)?;
        Self::load(&contents)
    }

    pub fn load(contents: &str) -> Result<Config, io::Error> {
        let mut c: Config = serde_yaml::from_str(contents)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;

        if c.export_buffer_size < 1 << 10 {
            c.export_buffer_size = 1 << 10;
        }
        if c.reorder_buffer_size < 1 << 10 {
            c.reorder_buffer_size = 1 << 10;
        }
        if c.decoder_workers < 1 {
            c.decoder_workers = 1;
        }
        if c.decoder_channels < 1 || c.decoder_channels > c.decoder_workers {
            c.decoder_channels = c.decoder_workers;
        }
        if c.flush_interval < Duration::from_millis(1) {
            c.flush_interval = Duration::from_secs(10);
        }

        if let Err(e) = c.validate() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, e.to_string()));
        }
        Ok(c)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.sampling_rate <= 0.0 || self.sampling_rate > 100.0 {
            return Err(ConfigError::SamplingRateInvalid(self.sampling_rate));
        }
        if self.output_dir.as_os_str().is_empty() {
            return Err(ConfigError::OutputDirEmpty);
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_file: "".into(),
            log_level: "info".into(),
            source_format: SourceFormat::Auto,
            output_dir: PathBuf::from("."),
            sampling_rate: 100.0,
            metric_sampling_rate: 1000,
            compute_request_response: false,
            export_buffer_size: 1 << 16,
            tcp_filter: vec![],
            udp_filter: vec![],
            drop_incomplete_tcp: false,
            tcp_timeout: TIMEOUT_TCP,
            tcp_fin_timeout: TIMEOUT_TCP_FIN,
            tcp_rst_timeout: TIMEOUT_TCP_RST,
            udp_timeout: TIMEOUT_UDP,
            reorder_buffer_size: 1 << 17,
            decoder_workers: 8,
            decoder_channels: 4,
            flush_interval: Duration::from_secs(10),
            packet_limit: 0,
        }
    }
}
