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

use std::panic;
use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use flexi_logger::{FileSpec, Logger};
use log::error;

use flowmeter::source;
use flowmeter::{Analyzer, Config};

#[derive(Parser)]
#[clap(version, about = "Offline packet-trace flow analyzer")]
struct Opts {
    /// Specify config file location
    #[clap(short = 'f', long, default_value = "/etc/flowmeter.yaml")]
    config_file: String,

    /// Capture file to analyze (pcap, pcapng or ERF framed)
    trace_file: String,

    /// Override the configured output directory
    #[clap(short, long)]
    output_dir: Option<String>,
}

fn main() -> Result<()> {
    panic::set_hook(Box::new(|panic_info| {
        error!("{}", panic_info.to_string());
        eprintln!("{}", panic_info);
        std::process::exit(1);
    }));

    let opts = Opts::parse();
    let mut config = if Path::new(&opts.config_file).exists() {
        Config::load_from_file(&opts.config_file)
            .with_context(|| format!("loading config {}", opts.config_file))?
    } else {
        Config::load("{}").unwrap()
    };
    if let Some(output_dir) = opts.output_dir {
        config.output_dir = output_dir.into();
    }

    let logger = Logger::try_with_str(&config.log_level)?;
    if config.log_file.is_empty() {
        logger.start()?;
    } else {
        logger
            .log_to_file(FileSpec::try_from(Path::new(&config.log_file))?)
            .start()?;
    }

    let packet_source = source::open_source(Path::new(&opts.trace_file), config.source_format)
        .with_context(|| format!("opening {}", opts.trace_file))?;

    let mut analyzer = Analyzer::new(config);
    let summary = analyzer.run(packet_source)?;
    log::info!(
        "done: {} packets between {} and {}",
        summary.packets,
        summary.first_packet_timestamp,
        summary.last_packet_timestamp
    );
    Ok(())
}
