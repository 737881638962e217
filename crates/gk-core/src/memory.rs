// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Guest memory accessors consumed by syscall marshalling

use crate::error::{Errno, FsResult};

/// Fixed-width little-endian access to guest addresses
pub trait GuestMemory {
    fn read_u8(&self, addr: u32) -> FsResult<u8>;
    fn read_u16(&self, addr: u32) -> FsResult<u16>;
    fn read_u32(&self, addr: u32) -> FsResult<u32>;
    fn write_u8(&mut self, addr: u32, value: u8) -> FsResult<()>;
    fn write_u16(&mut self, addr: u32, value: u16) -> FsResult<()>;
    fn write_u32(&mut self, addr: u32, value: u32) -> FsResult<()>;
    fn zero(&mut self, addr: u32, len: u32) -> FsResult<()>;
}

/// Flat memory starting at guest address `base`
#[derive(Clone, Debug)]
pub struct VecMemory {
    base: u32,
    bytes: Vec<u8>,
}

impl VecMemory {
    pub fn new(base: u32, len: usize) -> Self {
        Self {
            base,
            bytes: vec![0; len],
        }
    }

    fn range(&self, addr: u32, len: u32) -> FsResult<std::ops::Range<usize>> {
        let start = addr.checked_sub(self.base).ok_or(Errno::Fault)? as usize;
        let end = start.checked_add(len as usize).ok_or(Errno::Fault)?;
        if end > self.bytes.len() {
            return Err(Errno::Fault);
        }
        Ok(start..end)
    }

    pub fn bytes(&self, addr: u32, len: u32) -> FsResult<&[u8]> {
        let range = self.range(addr, len)?;
        Ok(&self.bytes[range])
    }

    pub fn write_bytes(&mut self, addr: u32, data: &[u8]) -> FsResult<()> {
        let range = self.range(addr, data.len() as u32)?;
        self.bytes[range].copy_from_slice(data);
        Ok(())
    }
}

impl GuestMemory for VecMemory {
    fn read_u8(&self, addr: u32) -> FsResult<u8> {
        Ok(self.bytes(addr, 1)?[0])
    }

    fn read_u16(&self, addr: u32) -> FsResult<u16> {
        let b = self.bytes(addr, 2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn read_u32(&self, addr: u32) -> FsResult<u32> {
        let b = self.bytes(addr, 4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn write_u8(&mut self, addr: u32, value: u8) -> FsResult<()> {
        self.write_bytes(addr, &[value])
    }

    fn write_u16(&mut self, addr: u32, value: u16) -> FsResult<()> {
        self.write_bytes(addr, &value.to_le_bytes())
    }

    fn write_u32(&mut self, addr: u32, value: u32) -> FsResult<()> {
        self.write_bytes(addr, &value.to_le_bytes())
    }

    fn zero(&mut self, addr: u32, len: u32) -> FsResult<()> {
        let range = self.range(addr, len)?;
        self.bytes[range].fill(0);
        Ok(())
    }
}
