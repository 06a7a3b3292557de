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

use std::fs::File;
use std::path::Path;

use log::warn;
use pcap_parser::traits::PcapReaderIterator;
use pcap_parser::{Block, LegacyPcapReader, PcapBlockOwned, PcapError, PcapNGReader};
use serde::Deserialize;
use thiserror::Error;

use crate::common::consts::{
    ERF_FLAGS_IFACE_MASK, ERF_FLAGS_OFFSET, ERF_HEADER_SIZE, ERF_TYPE_ETH, ERF_TYPE_OFFSET,
};

const READER_BUFFER_SIZE: usize = 1 << 20;

const PCAP_MAGIC_NSEC: u32 = 0xA1B2_3C4D;
const PCAP_MAGIC_NSEC_SWAPPED: u32 = 0x4D3C_B2A1;

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot open capture: {0}")]
    Open(String),
    #[error("malformed capture: {0}")]
    Malformed(String),
    #[error("packet read failed: {0}")]
    Read(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    // read errors are counted and skipped, everything else aborts the run
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Read(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceFormat {
    Auto,
    Pcap,
    Pcapng,
    Erf,
}

impl Default for SourceFormat {
    fn default() -> Self {
        SourceFormat::Auto
    }
}

#[derive(Debug, Clone)]
pub struct RawCapture {
    pub data: Vec<u8>,
    pub timestamp: i64,
    pub interface: u8,
}

/// Anything that can hand over "the next captured packet". `Ok(None)`
/// signals end of stream; recoverable errors (`Error::is_recoverable`)
/// may be skipped by the caller.
pub trait PacketSource: Send {
    fn read_packet(&mut self) -> Result<Option<RawCapture>>;
}

pub fn open_source(path: &Path, format: SourceFormat) -> Result<Box<dyn PacketSource>> {
    let by_name = || {
        if path.to_string_lossy().contains(".pcapng") {
            SourceFormat::Pcapng
        } else {
            SourceFormat::Pcap
        }
    };
    match format {
        SourceFormat::Pcap => Ok(Box::new(PcapSource::open(path)?)),
        SourceFormat::Pcapng => Ok(Box::new(PcapNgSource::open(path)?)),
        SourceFormat::Erf => {
            let inner: Box<dyn PacketSource> = match by_name() {
                SourceFormat::Pcapng => Box::new(PcapNgSource::open(path)?),
                _ => Box::new(PcapSource::open(path)?),
            };
            Ok(Box::new(ErfSource::new(inner)))
        }
        SourceFormat::Auto => match by_name() {
            SourceFormat::Pcapng => Ok(Box::new(PcapNgSource::open(path)?)),
            _ => Ok(Box::new(PcapSource::open(path)?)),
        },
    }
}

/// Legacy pcap file reader. Timestamps are converted to nanoseconds,
/// honoring the nanosecond-precision magic.
pub struct PcapSource {
    reader: LegacyPcapReader<File>,
    subsec_multiplier: i64,
}

impl PcapSource {
    pub fn open(path: &Path) -> Result<Self> {
        let file =
            File::open(path).map_err(|e| Error::Open(format!("{}: {}", path.display(), e)))?;
        let reader = LegacyPcapReader::new(READER_BUFFER_SIZE, file)
            .map_err(|e| Error::Malformed(e.to_string()))?;
        Ok(PcapSource {
            reader,
            subsec_multiplier: 1_000,
        })
    }
}

impl PacketSource for PcapSource {
    fn read_packet(&mut self) -> Result<Option<RawCapture>> {
        loop {
            match self.reader.next() {
                Ok((offset, block)) => {
                    let capture = match block {
                        PcapBlockOwned::LegacyHeader(header) => {
                            if header.magic_number == PCAP_MAGIC_NSEC
                                || header.magic_number == PCAP_MAGIC_NSEC_SWAPPED
                            {
                                self.subsec_multiplier = 1;
                            }
                            None
                        }
                        PcapBlockOwned::Legacy(packet) => Some(RawCapture {
                            data: packet.data.to_vec(),
                            timestamp: packet.ts_sec as i64 * 1_000_000_000
                                + packet.ts_usec as i64 * self.subsec_multiplier,
                            interface: 0,
                        }),
                        PcapBlockOwned::NG(_) => None,
                    };
                    self.reader.consume(offset);
                    if let Some(capture) = capture {
                        return Ok(Some(capture));
                    }
                }
                Err(PcapError::Eof) => return Ok(None),
                Err(PcapError::Incomplete) => {
                    self.reader
                        .refill()
                        .map_err(|e| Error::Read(e.to_string()))?;
                }
                Err(e) => return Err(Error::Read(e.to_string())),
            }
        }
    }
}

/// Next-generation capture reader. Interface timestamp resolutions are
/// tracked per interface description block.
pub struct PcapNgSource {
    reader: PcapNGReader<File>,
    if_tsresol: Vec<u8>,
}

impl PcapNgSource {
    pub fn open(path: &Path) -> Result<Self> {
        let file =
            File::open(path).map_err(|e| Error::Open(format!("{}: {}", path.display(), e)))?;
        let reader = PcapNGReader::new(READER_BUFFER_SIZE, file)
            .map_err(|e| Error::Malformed(e.to_string()))?;
        Ok(PcapNgSource {
            reader,
            if_tsresol: vec![],
        })
    }

    fn timestamp_ns(&self, if_id: u32, ts_high: u32, ts_low: u32) -> i64 {
        let resol = self
            .if_tsresol
            .get(if_id as usize)
            .copied()
            .unwrap_or(6);
        let ticks_per_sec: u64 = if resol & 0x80 == 0 {
            10u64.saturating_pow(resol as u32)
        } else {
            1u64 << (resol & 0x7F)
        };
        let ticks = ((ts_high as u64) << 32) | ts_low as u64;
        let secs = ticks / ticks_per_sec;
        let frac = ticks % ticks_per_sec;
        (secs * 1_000_000_000 + frac * 1_000_000_000 / ticks_per_sec) as i64
    }
}

impl PacketSource for PcapNgSource {
    fn read_packet(&mut self) -> Result<Option<RawCapture>> {
        loop {
            match self.reader.next() {
                Ok((offset, block)) => {
                    let capture = match block {
                        PcapBlockOwned::NG(Block::SectionHeader(_)) => {
                            self.if_tsresol.clear();
                            None
                        }
                        PcapBlockOwned::NG(Block::InterfaceDescription(idb)) => {
                            self.if_tsresol.push(idb.if_tsresol);
                            None
                        }
                        PcapBlockOwned::NG(Block::EnhancedPacket(epb)) => {
                            let caplen = (epb.caplen as usize).min(epb.data.len());
                            Some((
                                epb.data[..caplen].to_vec(),
                                epb.if_id,
                                epb.ts_high,
                                epb.ts_low,
                            ))
                        }
                        _ => None,
                    };
                    self.reader.consume(offset);
                    if let Some((data, if_id, ts_high, ts_low)) = capture {
                        return Ok(Some(RawCapture {
                            data,
                            timestamp: self.timestamp_ns(if_id, ts_high, ts_low),
                            interface: 0,
                        }));
                    }
                }
                Err(PcapError::Eof) => return Ok(None),
                Err(PcapError::Incomplete) => {
                    self.reader
                        .refill()
                        .map_err(|e| Error::Read(e.to_string()))?;
                }
                Err(e) => return Err(Error::Read(e.to_string())),
            }
        }
    }
}

/// Wraps any packet source whose frames carry an 18 byte ERF record
/// header. The header is stripped before decoding; byte 8 must name the
/// Ethernet record type and bits 0-1 of byte 9 carry the capture
/// interface. Frames of any other record type are skipped with a warning.
pub struct ErfSource {
    inner: Box<dyn PacketSource>,
    skipped: u64,
}

impl ErfSource {
    pub fn new(inner: Box<dyn PacketSource>) -> Self {
        ErfSource { inner, skipped: 0 }
    }
}

impl PacketSource for ErfSource {
    fn read_packet(&mut self) -> Result<Option<RawCapture>> {
        loop {
            let mut raw = match self.inner.read_packet()? {
                Some(raw) => raw,
                None => return Ok(None),
            };
            if raw.data.len() < ERF_HEADER_SIZE || raw.data[ERF_TYPE_OFFSET] != ERF_TYPE_ETH {
                self.skipped += 1;
                warn!(
                    "skipping non-ethernet ERF frame ({} skipped so far)",
                    self.skipped
                );
                continue;
            }
            let interface = raw.data[ERF_FLAGS_OFFSET] & ERF_FLAGS_IFACE_MASK;
            let data = raw.data.split_off(ERF_HEADER_SIZE);
            return Ok(Some(RawCapture {
                data,
                timestamp: raw.timestamp,
                interface,
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubSource {
        frames: Vec<RawCapture>,
    }

    impl PacketSource for StubSource {
        fn read_packet(&mut self) -> Result<Option<RawCapture>> {
            if self.frames.is_empty() {
                Ok(None)
            } else {
                Ok(Some(self.frames.remove(0)))
            }
        }
    }

    fn erf_frame(record_type: u8, iface: u8, payload: &[u8]) -> RawCapture {
        let mut data = vec![0u8; ERF_HEADER_SIZE];
        data[ERF_TYPE_OFFSET] = record_type;
        data[ERF_FLAGS_OFFSET] = iface;
        data.extend_from_slice(payload);
        RawCapture {
            data,
            timestamp: 42,
            interface: 0,
        }
    }

    #[test]
    fn erf_header_is_stripped() {
        let stub = StubSource {
            frames: vec![erf_frame(ERF_TYPE_ETH, 0x01, &[0xde, 0xad])],
        };
        let mut source = ErfSource::new(Box::new(stub));
        let capture = source.read_packet().unwrap().unwrap();
        assert_eq!(capture.data, vec![0xde, 0xad]);
        assert_eq!(capture.interface, 1);
        assert_eq!(capture.timestamp, 42);
        assert!(source.read_packet().unwrap().is_none());
    }

    #[test]
    fn erf_skips_foreign_record_types() {
        let stub = StubSource {
            frames: vec![
                erf_frame(0x01, 0, &[1]),
                erf_frame(ERF_TYPE_ETH, 0x02, &[2]),
            ],
        };
        let mut source = ErfSource::new(Box::new(stub));
        let capture = source.read_packet().unwrap().unwrap();
        assert_eq!(capture.data, vec![2]);
        assert_eq!(capture.interface, 2);
    }

    #[test]
    fn erf_interface_masks_high_bits() {
        let stub = StubSource {
            frames: vec![erf_frame(ERF_TYPE_ETH, 0xFE, &[9])],
        };
        let mut source = ErfSource::new(Box::new(stub));
        let capture = source.read_packet().unwrap().unwrap();
        assert_eq!(capture.interface, 2);
    }

    #[test]
    fn legacy_pcap_from_bytes() {
        use std::io::Write;

        // one-packet little endian legacy pcap, microsecond precision
        let mut bytes: Vec<u8> = vec![];
        bytes.extend(0xA1B2_C3D4u32.to_le_bytes()); // magic
        bytes.extend(2u16.to_le_bytes()); // major
        bytes.extend(4u16.to_le_bytes()); // minor
        bytes.extend(0i32.to_le_bytes()); // thiszone
        bytes.extend(0u32.to_le_bytes()); // sigfigs
        bytes.extend(65535u32.to_le_bytes()); // snaplen
        bytes.extend(1u32.to_le_bytes()); // linktype ethernet
        let payload = [0u8; 60];
        bytes.extend(3u32.to_le_bytes()); // ts_sec
        bytes.extend(7u32.to_le_bytes()); // ts_usec
        bytes.extend((payload.len() as u32).to_le_bytes());
        bytes.extend((payload.len() as u32).to_le_bytes());
        bytes.extend(payload);

        let dir = std::env::temp_dir();
        let path = dir.join(format!("flowmeter-src-{}.pcap", std::process::id()));
        let mut file = File::create(&path).unwrap();
        file.write_all(&bytes).unwrap();
        drop(file);

        let mut source = PcapSource::open(&path).unwrap();
        let capture = source.read_packet().unwrap().unwrap();
        assert_eq!(capture.data.len(), 60);
        assert_eq!(capture.timestamp, 3 * 1_000_000_000 + 7 * 1_000);
        assert!(source.read_packet().unwrap().is_none());
        let _ = std::fs::remove_file(&path);
    }
}
