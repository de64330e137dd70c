// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Body encoding for the five DTU message shapes.
//!
//! The real device encodes these bodies against a compiled schema shared
//! with its vendor cloud; nothing about that schema is available here, so
//! this module carries its own small tag/length/varint encoder (field
//! number + wire type, LEB128 varints, length-delimited submessages —
//! the same shape protobuf uses) local to exactly the fields the core
//! needs. It is self-consistent and round-trips; it is not wire-compatible
//! with the vendor's compiled schema.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

const WIRE_VARINT: u8 = 0;
const WIRE_LEN: u8 = 2;

fn put_tag(buf: &mut BytesMut, field: u32, wire: u8) {
    put_varint(buf, ((field << 3) | wire as u32) as u64);
}

fn put_varint(buf: &mut BytesMut, mut v: u64) {
    loop {
        let byte = (v & 0x7F) as u8;
        v >>= 7;
        if v == 0 {
            buf.put_u8(byte);
            break;
        }
        buf.put_u8(byte | 0x80);
    }
}

fn put_zigzag(buf: &mut BytesMut, field: u32, v: i32) {
    put_tag(buf, field, WIRE_VARINT);
    let zz = ((v << 1) ^ (v >> 31)) as u32;
    put_varint(buf, zz as u64);
}

fn put_uvarint_field(buf: &mut BytesMut, field: u32, v: u64) {
    put_tag(buf, field, WIRE_VARINT);
    put_varint(buf, v);
}

fn put_bytes_field(buf: &mut BytesMut, field: u32, bytes: &[u8]) {
    put_tag(buf, field, WIRE_LEN);
    put_varint(buf, bytes.len() as u64);
    buf.put_slice(bytes);
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn eof(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn read_varint(&mut self) -> Result<u64, ProtocolError> {
        let mut result: u64 = 0;
        let mut shift = 0;
        loop {
            let byte = *self.buf.get(self.pos).ok_or_else(|| ProtocolError::MessageDecode {
                reason: "truncated varint".into(),
            })?;
            self.pos += 1;
            result |= ((byte & 0x7F) as u64) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
            if shift >= 64 {
                return Err(ProtocolError::MessageDecode {
                    reason: "varint too long".into(),
                });
            }
        }
        Ok(result)
    }

    fn read_tag(&mut self) -> Result<(u32, u8), ProtocolError> {
        let v = self.read_varint()?;
        Ok(((v >> 3) as u32, (v & 0x7) as u8))
    }

    fn read_zigzag(&mut self) -> Result<i32, ProtocolError> {
        let v = self.read_varint()? as u32;
        Ok(((v >> 1) as i32) ^ -((v & 1) as i32))
    }

    fn read_bytes(&mut self) -> Result<&'a [u8], ProtocolError> {
        let len = self.read_varint()? as usize;
        let end = self.pos.checked_add(len).ok_or_else(|| ProtocolError::MessageDecode {
            reason: "length overflow".into(),
        })?;
        let slice = self.buf.get(self.pos..end).ok_or_else(|| ProtocolError::MessageDecode {
            reason: "truncated length-delimited field".into(),
        })?;
        self.pos = end;
        Ok(slice)
    }

    /// Skips a field's value once its wire type is known, used for
    /// forward-compatible decoding of fields this core does not read.
    fn skip(&mut self, wire: u8) -> Result<(), ProtocolError> {
        match wire {
            WIRE_VARINT => {
                self.read_varint()?;
            },
            WIRE_LEN => {
                self.read_bytes()?;
            },
            other => {
                return Err(ProtocolError::MessageDecode {
                    reason: format!("unsupported wire type: {other}"),
                });
            },
        }
        Ok(())
    }
}

/// Time-zone offset (seconds) the core attaches to every outbound request,
/// matching the source device's fixed local-time offset field.
pub const DTU_TIME_OFFSET: i32 = 0;

pub mod scale {
    //! Integer-to-physical-unit scaling applied after decode.
    pub const CURRENT_DIVIDER: f64 = 100.0;
    pub const FREQUENCY_DIVIDER: f64 = 100.0;
    pub const ENERGY_DIVIDER: f64 = 1000.0;
}

// ---------------------------------------------------------------------
// RealDataNew

#[derive(Debug, Clone, Copy, Default)]
pub struct RealDataNewRequest {
    pub offset: i32,
    pub time: u32,
}

impl RealDataNewRequest {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_zigzag(&mut buf, 1, self.offset);
        put_uvarint_field(&mut buf, 2, self.time as u64);
        buf.freeze()
    }
}

/// Raw (unscaled) grid record as reported by the peer.
#[derive(Debug, Clone, Copy, Default)]
pub struct SgsRaw {
    pub current: i32,
    pub voltage: i32,
    pub active_power: i32,
    pub temperature: i32,
}

impl SgsRaw {
    fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(buf);
        let mut out = Self::default();
        while !r.eof() {
            let (field, wire) = r.read_tag()?;
            match field {
                1 => out.current = r.read_zigzag()?,
                2 => out.voltage = r.read_zigzag()?,
                3 => out.active_power = r.read_zigzag()?,
                4 => out.temperature = r.read_zigzag()?,
                _ => r.skip(wire)?,
            }
        }
        Ok(out)
    }

    fn encode(&self, buf: &mut BytesMut) {
        put_zigzag(buf, 1, self.current);
        put_zigzag(buf, 2, self.voltage);
        put_zigzag(buf, 3, self.active_power);
        put_zigzag(buf, 4, self.temperature);
    }
}

/// Raw (unscaled) per-panel record as reported by the peer.
#[derive(Debug, Clone, Copy, Default)]
pub struct PvRaw {
    pub current: i32,
    pub voltage: i32,
    pub power: i32,
    pub energy_daily: i32,
    pub energy_total: i32,
}

impl PvRaw {
    fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(buf);
        let mut out = Self::default();
        while !r.eof() {
            let (field, wire) = r.read_tag()?;
            match field {
                1 => out.current = r.read_zigzag()?,
                2 => out.voltage = r.read_zigzag()?,
                3 => out.power = r.read_zigzag()?,
                4 => out.energy_daily = r.read_zigzag()?,
                5 => out.energy_total = r.read_zigzag()?,
                _ => r.skip(wire)?,
            }
        }
        Ok(out)
    }

    fn encode(&self, buf: &mut BytesMut) {
        put_zigzag(buf, 1, self.current);
        put_zigzag(buf, 2, self.voltage);
        put_zigzag(buf, 3, self.power);
        put_zigzag(buf, 4, self.energy_daily);
        put_zigzag(buf, 5, self.energy_total);
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RealDataNewResponse {
    pub timestamp: u32,
    pub grid: SgsRaw,
    pub pv: [PvRaw; 2],
}

impl RealDataNewResponse {
    pub fn decode(body: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(body);
        let mut out = Self::default();
        let mut pv_idx = 0usize;
        while !r.eof() {
            let (field, wire) = r.read_tag()?;
            match field {
                1 => out.timestamp = r.read_varint()? as u32,
                2 => out.grid = SgsRaw::decode(r.read_bytes()?)?,
                3 => {
                    let raw = PvRaw::decode(r.read_bytes()?)?;
                    if pv_idx < out.pv.len() {
                        out.pv[pv_idx] = raw;
                        pv_idx += 1;
                    }
                },
                _ => r.skip(wire)?,
            }
        }
        Ok(out)
    }

    /// Used to build fixtures for tests; the real peer is the encoder for
    /// this direction.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_uvarint_field(&mut buf, 1, self.timestamp as u64);
        let mut grid_buf = BytesMut::new();
        self.grid.encode(&mut grid_buf);
        put_bytes_field(&mut buf, 2, &grid_buf);
        for pv in &self.pv {
            let mut pv_buf = BytesMut::new();
            pv.encode(&mut pv_buf);
            put_bytes_field(&mut buf, 3, &pv_buf);
        }
        buf.freeze()
    }
}

// ---------------------------------------------------------------------
// GetConfig

#[derive(Debug, Clone, Copy, Default)]
pub struct GetConfigRequest {
    pub offset: i32,
    pub time: u32,
}

impl GetConfigRequest {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_zigzag(&mut buf, 1, self.offset);
        put_uvarint_field(&mut buf, 2, self.time as u64);
        buf.freeze()
    }
}

/// Sentinel the peer reports for `limit_power_mypower` when it has no
/// opinion on the configured power limit yet.
pub const POWER_LIMIT_UNKNOWN: i32 = 254;

#[derive(Debug, Clone, Copy, Default)]
pub struct GetConfigResponse {
    pub request_time: u32,
    pub wifi_rssi: i32,
    pub limit_power_mypower: i32,
}

impl GetConfigResponse {
    pub fn decode(body: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(body);
        let mut out = Self::default();
        while !r.eof() {
            let (field, wire) = r.read_tag()?;
            match field {
                1 => out.request_time = r.read_varint()? as u32,
                2 => out.wifi_rssi = r.read_zigzag()?,
                3 => out.limit_power_mypower = r.read_zigzag()?,
                _ => r.skip(wire)?,
            }
        }
        Ok(out)
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_uvarint_field(&mut buf, 1, self.request_time as u64);
        put_zigzag(&mut buf, 2, self.wifi_rssi);
        put_zigzag(&mut buf, 3, self.limit_power_mypower);
        buf.freeze()
    }
}

// ---------------------------------------------------------------------
// Command (power-limit / restart-device)

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandAction {
    LimitPower = 1,
    DtuReboot = 2,
}

#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub time: u32,
    pub action: CommandAction,
    pub package_nub: i32,
    pub tid: u32,
    pub data: Option<String>,
}

impl CommandRequest {
    /// Clamp applied to a user-requested percent before it is encoded, per
    /// the source device's `limit_power` bounds.
    pub fn clamp_power_tenths(percent: i32) -> i32 {
        (percent * 10).clamp(20, 1000)
    }

    pub fn limit_power(now: u32, percent: i32) -> Self {
        let tenths = Self::clamp_power_tenths(percent);
        Self {
            time: now,
            action: CommandAction::LimitPower,
            package_nub: 1,
            tid: now,
            data: Some(format!("A:{tenths},B:0,C:0\r")),
        }
    }

    pub fn restart_device(now: u32) -> Self {
        Self {
            time: now,
            action: CommandAction::DtuReboot,
            package_nub: 1,
            tid: now,
            data: None,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_uvarint_field(&mut buf, 1, self.time as u64);
        put_uvarint_field(&mut buf, 2, self.action as u64);
        put_zigzag(&mut buf, 3, self.package_nub);
        put_uvarint_field(&mut buf, 4, self.tid as u64);
        if let Some(data) = &self.data {
            put_bytes_field(&mut buf, 5, data.as_bytes());
        }
        buf.freeze()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CommandResponse {
    pub time: u32,
    pub action: i32,
    pub err_code: i32,
    pub tid: u32,
}

impl CommandResponse {
    pub fn decode(body: &[u8]) -> Result<Self, ProtocolError> {
        let mut r = Reader::new(body);
        let mut out = Self::default();
        while !r.eof() {
            let (field, wire) = r.read_tag()?;
            match field {
                1 => out.time = r.read_varint()? as u32,
                2 => out.action = r.read_zigzag()?,
                3 => out.err_code = r.read_zigzag()?,
                4 => out.tid = r.read_varint()? as u32,
                _ => r.skip(wire)?,
            }
        }
        Ok(out)
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_uvarint_field(&mut buf, 1, self.time as u64);
        put_zigzag(&mut buf, 2, self.action);
        put_zigzag(&mut buf, 3, self.err_code);
        put_uvarint_field(&mut buf, 4, self.tid as u64);
        buf.freeze()
    }
}

// ---------------------------------------------------------------------
// AppGetHistPower (unused end-to-end, codec carried for completeness)

#[derive(Debug, Clone, Copy, Default)]
pub struct AppGetHistPowerRequest {
    pub offset: i32,
    pub time: u32,
}

impl AppGetHistPowerRequest {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_zigzag(&mut buf, 1, self.offset);
        put_uvarint_field(&mut buf, 2, self.time as u64);
        buf.freeze()
    }
}
