//! CRC-16 used to validate packets.
//!
//! The checksum is CRC-16/CCITT-FALSE (polynomial `0x1021`, initial value
//! `0xFFFF`, no reflection, no final XOR), computed over the packet header and
//! payload as they appear on the wire.

use crc::{CRC_16_IBM_3740, Crc};

/// Byte size of the CRC trailer.
pub const CRC_SIZE: usize = 2;

const PACKET_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// Calculate the packet CRC over `bytes`.
pub fn crc16(bytes: &[u8]) -> u16 {
    PACKET_CRC.checksum(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_value() {
        assert_eq!(crc16(b"123456789"), 0x29B1);
    }

    #[test]
    fn test_empty_input_is_initial_value() {
        assert_eq!(crc16(&[]), 0xFFFF);
    }

    #[test]
    fn test_single_bit_flip_changes_crc() {
        let a = crc16(&[0x10, 0x20, 0x30]);
        let b = crc16(&[0x10, 0x21, 0x30]);
        assert_ne!(a, b);
    }
}
