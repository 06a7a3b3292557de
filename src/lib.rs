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

pub mod analyzer;
pub mod common;
pub mod config;
pub mod decoder;
pub mod error;
pub mod flow_generator;
pub mod metric;
pub mod sender;
pub mod source;
pub mod utils;

pub use analyzer::{Analyzer, RunSummary};
pub use config::Config;
