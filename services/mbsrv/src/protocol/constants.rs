//! Modbus TCP protocol constants
//!
//! Limits follow the Modbus application protocol: the PDU is capped at 253
//! bytes (RS485 ADU of 256 minus address and CRC) and quantity limits are
//! derived from what fits into that PDU.

// ============================================================================
// Frame Size Constants
// ============================================================================

/// Bytes before the length field's payload starts:
/// Transaction ID(2) + Protocol ID(2) + Length(2)
pub const MBAP_PREFIX_LEN: usize = 6;

/// Full MBAP header including the unit id
pub const MBAP_HEADER_LEN: usize = MBAP_PREFIX_LEN + 1;

/// Smallest frame that carries a function code
pub const MIN_FRAME_LEN: usize = MBAP_HEADER_LEN + 1;

/// Maximum PDU (function code + data)
pub const MAX_PDU_SIZE: usize = 253;

/// Length field bounds: unit id + at least a function code, at most a full PDU
pub const MIN_MBAP_LENGTH: u16 = 2;
pub const MAX_MBAP_LENGTH: u16 = 1 + MAX_PDU_SIZE as u16;

/// Modbus TCP protocol identifier
pub const MODBUS_PROTOCOL_ID: u16 = 0;

/// Bit set on the function code of an exception response
pub const EXCEPTION_FLAG: u8 = 0x80;

// ============================================================================
// Function Codes
// ============================================================================

pub const FC_READ_COILS: u8 = 0x01;
pub const FC_READ_DISCRETE_INPUTS: u8 = 0x02;
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;
pub const FC_READ_INPUT_REGISTERS: u8 = 0x04;
pub const FC_WRITE_SINGLE_COIL: u8 = 0x05;
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;
pub const FC_WRITE_MULTIPLE_COILS: u8 = 0x0F;
pub const FC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

/// FC05 payload for ON
pub const COIL_ON: u16 = 0xFF00;
/// FC05 payload for OFF
pub const COIL_OFF: u16 = 0x0000;

// ============================================================================
// Quantity Limits
// ============================================================================

/// FC03/FC04: 1 + 1 + N×2 ≤ 253 → N ≤ 125
pub const MAX_READ_REGISTERS: usize = 125;

/// FC16: 1 + 2 + 2 + 1 + N×2 ≤ 253 → N ≤ 123
pub const MAX_WRITE_REGISTERS: usize = 123;

/// FC01/FC02: 1 + 1 + ceil(N/8) ≤ 253, rounded down to 2000
pub const MAX_READ_BITS: usize = 2000;

/// FC15: 1 + 2 + 2 + 1 + ceil(N/8) ≤ 253, conservative 0x7B0
pub const MAX_WRITE_COILS: usize = 1968;

/// Human-readable function code name for logs
pub fn function_code_name(fc: u8) -> &'static str {
    match fc & !EXCEPTION_FLAG {
        FC_READ_COILS => "Read Coils",
        FC_READ_DISCRETE_INPUTS => "Read Discrete Inputs",
        FC_READ_HOLDING_REGISTERS => "Read Holding Registers",
        FC_READ_INPUT_REGISTERS => "Read Input Registers",
        FC_WRITE_SINGLE_COIL => "Write Single Coil",
        FC_WRITE_SINGLE_REGISTER => "Write Single Register",
        FC_WRITE_MULTIPLE_COILS => "Write Multiple Coils",
        FC_WRITE_MULTIPLE_REGISTERS => "Write Multiple Registers",
        _ => "Unknown Function",
    }
}
