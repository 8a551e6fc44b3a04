//! Transaction handler
//!
//! Runs one decoded request through `Received → Validated → Executed →
//! Responded` (or `Received → Rejected → Responded`) against the shared
//! register store. Invalid content never closes the connection; it becomes
//! an exception response.

use std::sync::Arc;

use tracing::debug;

use crate::error::ExceptionCode;
use crate::protocol::constants::*;
use crate::protocol::pdu::unpack_bits;
use crate::protocol::{ModbusPdu, PduBuilder, RequestAdu, ResponseAdu};
use crate::store::{RegisterStore, Table};

/// What a transaction did to the store, for per-client statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    Rejected(ExceptionCode),
}

/// A request that passed validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    ReadBits {
        table: Table,
        start: u16,
        count: usize,
    },
    ReadRegisters {
        table: Table,
        start: u16,
        count: usize,
    },
    WriteSingleCoil {
        address: u16,
        raw: u16,
    },
    WriteSingleRegister {
        address: u16,
        value: u16,
    },
    WriteMultipleCoils {
        start: u16,
        values: Vec<u16>,
    },
    WriteMultipleRegisters {
        start: u16,
        values: Vec<u16>,
    },
}

impl Request {
    fn access(&self) -> Access {
        match self {
            Request::ReadBits { .. } | Request::ReadRegisters { .. } => Access::Read,
            _ => Access::Write,
        }
    }
}

/// Pipeline stages of one transaction
#[derive(Debug)]
pub enum Transaction {
    Received(RequestAdu),
    Validated {
        adu: RequestAdu,
        request: Request,
    },
    Executed {
        adu: RequestAdu,
        pdu: ModbusPdu,
        access: Access,
    },
    Rejected {
        adu: RequestAdu,
        code: ExceptionCode,
    },
    Responded {
        response: ResponseAdu,
        access: Access,
    },
}

impl Transaction {
    fn stage(&self) -> &'static str {
        match self {
            Transaction::Received(_) => "received",
            Transaction::Validated { .. } => "validated",
            Transaction::Executed { .. } => "executed",
            Transaction::Rejected { .. } => "rejected",
            Transaction::Responded { .. } => "responded",
        }
    }
}

/// Result of handling one request
#[derive(Debug, Clone)]
pub struct Handled {
    pub response: ResponseAdu,
    pub access: Access,
}

/// Stateless executor shared by every connection
#[derive(Debug, Clone)]
pub struct TransactionHandler {
    store: Arc<RegisterStore>,
}

impl TransactionHandler {
    pub fn new(store: Arc<RegisterStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<RegisterStore> {
        &self.store
    }

    /// Drive a request through the pipeline to its response
    pub fn handle(&self, adu: RequestAdu) -> Handled {
        let mut tx = Transaction::Received(adu);
        loop {
            tx = match tx {
                Transaction::Received(adu) => match self.validate(&adu) {
                    Ok(request) => Transaction::Validated { adu, request },
                    Err(code) => Transaction::Rejected { adu, code },
                },
                Transaction::Validated { adu, request } => {
                    let access = request.access();
                    match self.execute(&adu, request) {
                        Ok(pdu) => Transaction::Executed { adu, pdu, access },
                        Err(code) => Transaction::Rejected { adu, code },
                    }
                },
                Transaction::Executed { adu, pdu, access } => Transaction::Responded {
                    response: ResponseAdu::reply_to(&adu.header, pdu),
                    access,
                },
                Transaction::Rejected { adu, code } => {
                    let fc = adu.pdu.function_code().unwrap_or(0);
                    debug!(
                        "tid={} fc={:02X} ({}) rejected: {}",
                        adu.header.transaction_id,
                        fc,
                        function_code_name(fc),
                        code
                    );
                    Transaction::Responded {
                        response: ResponseAdu::reply_to(
                            &adu.header,
                            ModbusPdu::exception(fc, code),
                        ),
                        access: Access::Rejected(code),
                    }
                },
                Transaction::Responded { response, access } => {
                    return Handled { response, access };
                },
            };
            debug_assert!(!matches!(tx, Transaction::Received(_)));
            tracing::trace!("transaction -> {}", tx.stage());
        }
    }

    /// Checks in order: function code, address range, table writability,
    /// then payload (quantity limits, coil value, declared byte count).
    /// A payload too short to hold its address fields is rejected up front.
    pub fn validate(&self, adu: &RequestAdu) -> Result<Request, ExceptionCode> {
        let fc = adu.pdu.function_code().ok_or(ExceptionCode::IllegalFunction)?;
        // 0x80..=0xFF are exception codes, never requests
        if adu.pdu.is_exception() {
            return Err(ExceptionCode::IllegalFunction);
        }
        let payload = adu.pdu.payload();

        match fc {
            FC_READ_COILS | FC_READ_DISCRETE_INPUTS => {
                let table = if fc == FC_READ_COILS {
                    Table::Coils
                } else {
                    Table::DiscreteInputs
                };
                let (start, count) = exact_pair(payload)?;
                let count = usize::from(count);
                self.check_range(table, start, count)?;
                check_quantity(count, MAX_READ_BITS)?;
                Ok(Request::ReadBits {
                    table,
                    start,
                    count,
                })
            },
            FC_READ_HOLDING_REGISTERS | FC_READ_INPUT_REGISTERS => {
                let table = if fc == FC_READ_HOLDING_REGISTERS {
                    Table::HoldingRegisters
                } else {
                    Table::InputRegisters
                };
                let (start, count) = exact_pair(payload)?;
                let count = usize::from(count);
                self.check_range(table, start, count)?;
                check_quantity(count, MAX_READ_REGISTERS)?;
                Ok(Request::ReadRegisters {
                    table,
                    start,
                    count,
                })
            },
            FC_WRITE_SINGLE_COIL => {
                let (address, raw) = exact_pair(payload)?;
                self.check_write(Table::Coils, address, 1)?;
                if raw != COIL_ON && raw != COIL_OFF {
                    return Err(ExceptionCode::IllegalDataValue);
                }
                Ok(Request::WriteSingleCoil { address, raw })
            },
            FC_WRITE_SINGLE_REGISTER => {
                let (address, value) = exact_pair(payload)?;
                self.check_write(Table::HoldingRegisters, address, 1)?;
                Ok(Request::WriteSingleRegister { address, value })
            },
            FC_WRITE_MULTIPLE_COILS => {
                let (start, count) = write_header(payload)?;
                self.check_write(Table::Coils, start, count)?;
                check_quantity(count, MAX_WRITE_COILS)?;
                let data = byte_counted(payload, count.div_ceil(8))?;
                Ok(Request::WriteMultipleCoils {
                    start,
                    values: unpack_bits(data, count),
                })
            },
            FC_WRITE_MULTIPLE_REGISTERS => {
                let (start, count) = write_header(payload)?;
                self.check_write(Table::HoldingRegisters, start, count)?;
                check_quantity(count, MAX_WRITE_REGISTERS)?;
                let data = byte_counted(payload, count * 2)?;
                Ok(Request::WriteMultipleRegisters {
                    start,
                    values: data
                        .chunks_exact(2)
                        .map(|w| u16::from_be_bytes([w[0], w[1]]))
                        .collect(),
                })
            },
            _ => Err(ExceptionCode::IllegalFunction),
        }
    }

    fn check_range(&self, table: Table, start: u16, count: usize) -> Result<(), ExceptionCode> {
        if usize::from(start) + count > self.store.size(table) {
            return Err(ExceptionCode::IllegalDataAddress);
        }
        Ok(())
    }

    fn check_write(&self, table: Table, start: u16, count: usize) -> Result<(), ExceptionCode> {
        self.check_range(table, start, count)?;
        if !table.is_writable() {
            return Err(ExceptionCode::IllegalFunction);
        }
        Ok(())
    }

    /// Apply a validated request and build the normal response PDU
    pub fn execute(&self, adu: &RequestAdu, request: Request) -> Result<ModbusPdu, ExceptionCode> {
        let fc = adu.pdu.function_code().unwrap_or(0);
        // Quantities were bounded during validation, so the PDU always fits
        let built = |b: Result<PduBuilder, _>| {
            b.map(PduBuilder::build)
                .map_err(|_| ExceptionCode::IllegalDataValue)
        };

        match request {
            Request::ReadBits {
                table,
                start,
                count,
            } => {
                let values = self.store.read(table, start, count)?;
                built(PduBuilder::new().function_code(fc).and_then(|b| b.bits(&values)))
            },
            Request::ReadRegisters {
                table,
                start,
                count,
            } => {
                let values = self.store.read(table, start, count)?;
                built(
                    PduBuilder::new()
                        .function_code(fc)
                        .and_then(|b| b.registers(&values)),
                )
            },
            Request::WriteSingleCoil { address, raw } => {
                self.store
                    .write(Table::Coils, address, &[u16::from(raw == COIL_ON)])?;
                Ok(adu.pdu.clone())
            },
            Request::WriteSingleRegister { address, value } => {
                self.store
                    .write(Table::HoldingRegisters, address, &[value])?;
                Ok(adu.pdu.clone())
            },
            Request::WriteMultipleCoils { start, values } => {
                self.store.write(Table::Coils, start, &values)?;
                built(
                    PduBuilder::new()
                        .function_code(fc)
                        .and_then(|b| b.address(start))
                        .and_then(|b| b.quantity(values.len() as u16)),
                )
            },
            Request::WriteMultipleRegisters { start, values } => {
                self.store.write(Table::HoldingRegisters, start, &values)?;
                built(
                    PduBuilder::new()
                        .function_code(fc)
                        .and_then(|b| b.address(start))
                        .and_then(|b| b.quantity(values.len() as u16)),
                )
            },
        }
    }
}

/// Exactly address + u16 (FC05/FC06)
fn exact_pair(payload: &[u8]) -> Result<(u16, u16), ExceptionCode> {
    if payload.len() != 4 {
        return Err(ExceptionCode::IllegalDataValue);
    }
    Ok((
        u16::from_be_bytes([payload[0], payload[1]]),
        u16::from_be_bytes([payload[2], payload[3]]),
    ))
}

/// Quantity in `1..=max`
fn check_quantity(count: usize, max: usize) -> Result<(), ExceptionCode> {
    if count == 0 || count > max {
        return Err(ExceptionCode::IllegalDataValue);
    }
    Ok(())
}

/// Address + quantity of a multiple write; the byte count must follow
fn write_header(payload: &[u8]) -> Result<(u16, usize), ExceptionCode> {
    if payload.len() < 5 {
        return Err(ExceptionCode::IllegalDataValue);
    }
    let (start, qty) = exact_pair(&payload[..4])?;
    Ok((start, usize::from(qty)))
}

/// Data bytes of a multiple write, checked against the declared byte count
fn byte_counted(payload: &[u8], expected: usize) -> Result<&[u8], ExceptionCode> {
    let byte_count = usize::from(payload[4]);
    let data = &payload[5..];
    if byte_count != expected || data.len() != expected {
        return Err(ExceptionCode::IllegalDataValue);
    }
    Ok(data)
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Test code - unwrap is acceptable
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use crate::protocol::MbapHeader;

    fn handler(size: usize) -> TransactionHandler {
        TransactionHandler::new(Arc::new(RegisterStore::new(&MemoryConfig {
            coils: size,
            discrete_inputs: size,
            input_registers: size,
            holding_registers: size,
            default_value: 0,
        })))
    }

    fn adu(pdu: &[u8]) -> RequestAdu {
        RequestAdu {
            header: MbapHeader {
                transaction_id: 0x0102,
                protocol_id: 0,
                length: (pdu.len() + 1) as u16,
                unit_id: 9,
            },
            pdu: ModbusPdu::from_slice(pdu).unwrap(),
        }
    }

    fn run(h: &TransactionHandler, pdu: &[u8]) -> Handled {
        h.handle(adu(pdu))
    }

    #[test]
    fn test_write_and_read_holding() {
        let h = handler(10);
        // FC16 write [5,6,7] at 2
        let out = run(
            &h,
            &[0x10, 0x00, 0x02, 0x00, 0x03, 0x06, 0, 5, 0, 6, 0, 7],
        );
        assert_eq!(out.access, Access::Write);
        assert_eq!(out.response.pdu.as_slice(), &[0x10, 0x00, 0x02, 0x00, 0x03]);
        assert_eq!(out.response.transaction_id, 0x0102);
        assert_eq!(out.response.unit_id, 9);

        // FC03 read 0..10
        let out = run(&h, &[0x03, 0x00, 0x00, 0x00, 0x0A]);
        assert_eq!(out.access, Access::Read);
        let pdu = out.response.pdu.as_slice();
        assert_eq!(pdu[..2], [0x03, 20]);
        let values: Vec<u16> = pdu[2..]
            .chunks(2)
            .map(|w| u16::from_be_bytes([w[0], w[1]]))
            .collect();
        assert_eq!(values, vec![0, 0, 5, 6, 7, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_single_writes_echo_request() {
        let h = handler(10);
        let req = [0x06, 0x00, 0x04, 0x12, 0x34];
        let out = run(&h, &req);
        assert_eq!(out.response.pdu.as_slice(), &req);
        assert_eq!(
            h.store().read(Table::HoldingRegisters, 4, 1).unwrap(),
            vec![0x1234]
        );

        let req = [0x05, 0x00, 0x01, 0xFF, 0x00];
        let out = run(&h, &req);
        assert_eq!(out.response.pdu.as_slice(), &req);
        assert_eq!(h.store().read(Table::Coils, 1, 1).unwrap(), vec![1]);
    }

    #[test]
    fn test_coil_round_trip() {
        let h = handler(16);
        // FC15: 10 coils at 0, bits 1011_0000 11
        run(&h, &[0x0F, 0x00, 0x00, 0x00, 0x0A, 0x02, 0x0D, 0x03]);
        let out = run(&h, &[0x01, 0x00, 0x00, 0x00, 0x0A]);
        assert_eq!(out.response.pdu.as_slice(), &[0x01, 0x02, 0x0D, 0x03]);
    }

    #[test]
    fn test_read_inputs() {
        let h = handler(8);
        h.store().load(Table::InputRegisters, 0, &[11, 22]).unwrap();
        h.store().load(Table::DiscreteInputs, 0, &[1]).unwrap();
        let out = run(&h, &[0x04, 0x00, 0x00, 0x00, 0x02]);
        assert_eq!(out.response.pdu.as_slice(), &[0x04, 0x04, 0, 11, 0, 22]);
        let out = run(&h, &[0x02, 0x00, 0x00, 0x00, 0x01]);
        assert_eq!(out.response.pdu.as_slice(), &[0x02, 0x01, 0x01]);
    }

    fn assert_exceptions(h: &TransactionHandler, cases: &[(&[u8], u8)]) {
        for (pdu, code) in cases {
            let out = run(h, pdu);
            let fc = pdu[0];
            assert_eq!(
                out.response.pdu.as_slice(),
                &[fc | 0x80, *code],
                "request {:02X?}",
                pdu
            );
            assert!(matches!(out.access, Access::Rejected(_)));
        }
    }

    #[test]
    fn test_exceptions() {
        let h = handler(10);
        assert_exceptions(
            &h,
            &[
                // unsupported function code
                (&[0x2B, 0x0E, 0x01], 0x01),
                // short payload
                (&[0x03, 0x00], 0x03),
                (&[0x10, 0x00, 0x00, 0x00], 0x03),
                // quantity zero
                (&[0x03, 0x00, 0x00, 0x00, 0x00], 0x03),
                // address range beyond table size
                (&[0x03, 0x00, 0x09, 0x00, 0x02], 0x02),
                (&[0x06, 0x00, 0x0A, 0x00, 0x01], 0x02),
                // FC05 with an invalid value
                (&[0x05, 0x00, 0x00, 0x12, 0x34], 0x03),
                // byte count does not match the quantity
                (&[0x10, 0x00, 0x00, 0x00, 0x02, 0x02, 0x00, 0x01], 0x03),
                (&[0x0F, 0x00, 0x00, 0x00, 0x09, 0x01, 0xFF], 0x03),
            ],
        );
        // Nothing was written by any rejected request
        assert_eq!(
            h.store().read(Table::HoldingRegisters, 0, 10).unwrap(),
            vec![0; 10]
        );
    }

    #[test]
    fn test_address_checked_before_payload() {
        let h = handler(10);
        assert_exceptions(
            &h,
            &[
                // out of range and an invalid coil value
                (&[0x05, 0x00, 0x0A, 0x12, 0x34], 0x02),
                // out of range and above the read limit
                (&[0x03, 0x00, 0x09, 0x00, 0x7E], 0x02),
                // out of range, above the write limit, no data
                (&[0x10, 0x00, 0x09, 0x00, 0xC8, 0x00], 0x02),
                // out of range with a wrong byte count
                (&[0x0F, 0x00, 0x09, 0x00, 0x09, 0x01, 0xFF], 0x02),
            ],
        );
    }

    #[test]
    fn test_exception_flagged_request_code() {
        let h = handler(10);
        for fc in [0x83u8, 0x90, 0xFF] {
            let out = run(&h, &[fc, 0x00, 0x00, 0x00, 0x01]);
            assert_eq!(out.response.pdu.as_slice(), &[fc, 0x01]);
            assert_eq!(
                out.access,
                Access::Rejected(ExceptionCode::IllegalFunction)
            );
        }
    }

    #[test]
    fn test_quantity_limits() {
        let h = handler(4000);
        assert_exceptions(
            &h,
            &[
                (&[0x03, 0x00, 0x00, 0x00, 0x7E], 0x03),
                (&[0x04, 0x00, 0x00, 0x00, 0x7E], 0x03),
                (&[0x01, 0x00, 0x00, 0x07, 0xD1], 0x03),
                (&[0x10, 0x00, 0x00, 0x00, 0x7C, 0xF8], 0x03),
                (&[0x0F, 0x00, 0x00, 0x07, 0xB1, 0xF7], 0x03),
            ],
        );
        // At the limit
        let out = run(&h, &[0x03, 0x00, 0x00, 0x00, 0x7D]);
        assert_eq!(out.response.pdu.as_slice()[..2], [0x03, 250]);
    }

    #[test]
    fn test_rejects_partial_overflow_write_atomically() {
        let h = handler(10);
        let out = run(
            &h,
            &[0x10, 0x00, 0x08, 0x00, 0x03, 0x06, 0, 1, 0, 2, 0, 3],
        );
        assert_eq!(out.response.pdu.as_slice(), &[0x90, 0x02]);
        assert_eq!(
            h.store().read(Table::HoldingRegisters, 8, 2).unwrap(),
            vec![0, 0]
        );
    }

    #[test]
    fn test_validate_builds_typed_request() {
        let h = handler(10);
        assert_eq!(
            h.validate(&adu(&[0x01, 0x00, 0x02, 0x00, 0x03])).unwrap(),
            Request::ReadBits {
                table: Table::Coils,
                start: 2,
                count: 3
            }
        );
        assert_eq!(
            h.validate(&adu(&[0x06, 0x00, 0x01, 0x00, 0x05])).unwrap(),
            Request::WriteSingleRegister {
                address: 1,
                value: 5
            }
        );
    }

    #[test]
    fn test_execute_maps_store_errors() {
        let h = handler(4);
        let request = Request::ReadRegisters {
            table: Table::HoldingRegisters,
            start: 3,
            count: 5,
        };
        assert_eq!(
            h.execute(&adu(&[0x03, 0x00, 0x03, 0x00, 0x05]), request),
            Err(ExceptionCode::IllegalDataAddress)
        );
    }
}
