//! Modbus PDU buffer
//!
//! Fixed-size stack array sized to the protocol maximum, so building a
//! response never allocates.

use tracing::trace;

use super::constants::{function_code_name, EXCEPTION_FLAG, MAX_PDU_SIZE};
use crate::error::{ExceptionCode, FrameError};

/// PDU with a stack-allocated fixed array
#[derive(Clone)]
pub struct ModbusPdu {
    data: [u8; MAX_PDU_SIZE],
    len: usize,
}

impl std::fmt::Debug for ModbusPdu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModbusPdu")
            .field("data", &self.as_slice())
            .finish()
    }
}

impl PartialEq for ModbusPdu {
    fn eq(&self, other: &Self) -> bool {
        self.as_slice() == other.as_slice()
    }
}

impl Eq for ModbusPdu {}

impl ModbusPdu {
    /// Create an empty PDU
    #[inline]
    pub fn new() -> Self {
        Self {
            data: [0; MAX_PDU_SIZE],
            len: 0,
        }
    }

    /// Copy a PDU out of a received frame
    pub fn from_slice(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() > MAX_PDU_SIZE {
            return Err(FrameError::PduTooLarge(data.len()));
        }
        let mut pdu = Self::new();
        pdu.data[..data.len()].copy_from_slice(data);
        pdu.len = data.len();
        Ok(pdu)
    }

    /// Exception response for `function_code`
    ///
    /// A request code that already has the exception flag set (`>= 0x80`)
    /// is echoed as is, so the reply is `[fc, code]` with that same byte.
    pub fn exception(function_code: u8, code: ExceptionCode) -> Self {
        let mut pdu = Self::new();
        pdu.data[0] = function_code | EXCEPTION_FLAG;
        pdu.data[1] = code.code();
        pdu.len = 2;
        pdu
    }

    /// Push a single byte
    #[inline]
    pub fn push(&mut self, byte: u8) -> Result<(), FrameError> {
        if self.len >= MAX_PDU_SIZE {
            return Err(FrameError::PduTooLarge(self.len + 1));
        }
        self.data[self.len] = byte;
        self.len += 1;
        Ok(())
    }

    /// Push u16 in big-endian
    #[inline]
    pub fn push_u16(&mut self, value: u16) -> Result<(), FrameError> {
        self.extend(&value.to_be_bytes())
    }

    /// Extend with a byte slice
    #[inline]
    pub fn extend(&mut self, data: &[u8]) -> Result<(), FrameError> {
        if self.len + data.len() > MAX_PDU_SIZE {
            return Err(FrameError::PduTooLarge(self.len + data.len()));
        }
        self.data[self.len..self.len + data.len()].copy_from_slice(data);
        self.len += data.len();
        Ok(())
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Function code (first byte)
    #[inline]
    pub fn function_code(&self) -> Option<u8> {
        (self.len > 0).then(|| self.data[0])
    }

    /// Bytes after the function code
    #[inline]
    pub fn payload(&self) -> &[u8] {
        if self.len > 0 {
            &self.data[1..self.len]
        } else {
            &[]
        }
    }

    /// Whether the function code carries the exception flag
    #[inline]
    pub fn is_exception(&self) -> bool {
        self.function_code()
            .map(|fc| fc & EXCEPTION_FLAG != 0)
            .unwrap_or(false)
    }
}

impl Default for ModbusPdu {
    fn default() -> Self {
        Self::new()
    }
}

/// PDU builder - fluent API for responses
pub struct PduBuilder {
    pdu: ModbusPdu,
}

impl Default for PduBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PduBuilder {
    #[inline]
    pub fn new() -> Self {
        Self {
            pdu: ModbusPdu::new(),
        }
    }

    #[inline]
    pub fn function_code(mut self, fc: u8) -> Result<Self, FrameError> {
        self.pdu.push(fc)?;
        Ok(self)
    }

    #[inline]
    pub fn address(mut self, addr: u16) -> Result<Self, FrameError> {
        self.pdu.push_u16(addr)?;
        Ok(self)
    }

    #[inline]
    pub fn quantity(mut self, qty: u16) -> Result<Self, FrameError> {
        self.pdu.push_u16(qty)?;
        Ok(self)
    }

    /// Byte count followed by big-endian register words
    pub fn registers(mut self, values: &[u16]) -> Result<Self, FrameError> {
        self.pdu.push((values.len() * 2) as u8)?;
        for &value in values {
            self.pdu.push_u16(value)?;
        }
        Ok(self)
    }

    /// Byte count followed by LSB-first packed bits
    pub fn bits(mut self, values: &[u16]) -> Result<Self, FrameError> {
        self.pdu.push(values.len().div_ceil(8) as u8)?;
        for chunk in values.chunks(8) {
            let byte = chunk
                .iter()
                .enumerate()
                .fold(0u8, |acc, (i, &v)| if v != 0 { acc | (1 << i) } else { acc });
            self.pdu.push(byte)?;
        }
        Ok(self)
    }

    pub fn build(self) -> ModbusPdu {
        if let Some(fc) = self.pdu.function_code() {
            trace!(
                "PDU built: FC={:02X} ({}), total_len={}",
                fc,
                function_code_name(fc),
                self.pdu.len()
            );
        }
        self.pdu
    }
}

/// Unpack `count` LSB-first bits from packed bytes
pub fn unpack_bits(bytes: &[u8], count: usize) -> Vec<u16> {
    (0..count)
        .map(|i| u16::from((bytes[i / 8] >> (i % 8)) & 1))
        .collect()
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;

    #[test]
    fn test_pdu_basic_operations() {
        let mut pdu = ModbusPdu::new();
        assert!(pdu.is_empty());
        assert_eq!(pdu.function_code(), None);
        assert!(pdu.payload().is_empty());

        pdu.push(0x03).unwrap();
        pdu.push_u16(0x0100).unwrap();
        pdu.push_u16(0x000A).unwrap();

        assert_eq!(pdu.len(), 5);
        assert_eq!(pdu.as_slice(), &[0x03, 0x01, 0x00, 0x00, 0x0A]);
        assert_eq!(pdu.payload(), &[0x01, 0x00, 0x00, 0x0A]);
        assert!(!pdu.is_exception());
    }

    #[test]
    fn test_exception_pdu() {
        let pdu = ModbusPdu::exception(0x03, ExceptionCode::IllegalDataAddress);
        assert_eq!(pdu.as_slice(), &[0x83, 0x02]);
        assert!(pdu.is_exception());
        assert_eq!(pdu.payload(), &[0x02]);

        let pdu = ModbusPdu::exception(0x85, ExceptionCode::IllegalFunction);
        assert_eq!(pdu.as_slice(), &[0x85, 0x01]);
    }

    #[test]
    fn test_builder_registers() {
        let pdu = PduBuilder::new()
            .function_code(0x03)
            .unwrap()
            .registers(&[0x1234, 0x0001])
            .unwrap()
            .build();
        assert_eq!(pdu.as_slice(), &[0x03, 0x04, 0x12, 0x34, 0x00, 0x01]);
    }

    #[test]
    fn test_builder_bits_packing() {
        // 10 bits: 1,0,1,1,0,0,0,0 | 1,1
        let pdu = PduBuilder::new()
            .function_code(0x01)
            .unwrap()
            .bits(&[1, 0, 1, 1, 0, 0, 0, 0, 1, 1])
            .unwrap()
            .build();
        assert_eq!(pdu.as_slice(), &[0x01, 0x02, 0b0000_1101, 0b0000_0011]);
    }

    #[test]
    fn test_unpack_bits() {
        assert_eq!(
            unpack_bits(&[0b0000_1101, 0b0000_0011], 10),
            vec![1, 0, 1, 1, 0, 0, 0, 0, 1, 1]
        );
    }

    #[test]
    fn test_pdu_overflow() {
        let mut pdu = ModbusPdu::new();
        assert!(pdu.extend(&[0xFF; MAX_PDU_SIZE + 1]).is_err());
        pdu.extend(&[0x01; MAX_PDU_SIZE]).unwrap();
        assert!(matches!(pdu.push(0), Err(FrameError::PduTooLarge(_))));
        assert!(ModbusPdu::from_slice(&[0u8; MAX_PDU_SIZE + 1]).is_err());
    }
}
