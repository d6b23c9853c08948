//! Command/response protocol carried over the IPC channel
//!
//! The typed messages here are what the host and firmware exchange. How they
//! are packed into IPC words is a firmware contract, so packing sits behind
//! the [`PacketCodec`] trait. [`WordCodec`] is the framing spoken by the
//! software firmware; a hardware variant supplies its own codec.

use crate::error::{NpuError, Result};
use std::fmt::Debug;

/// Firmware status code for success
pub const STATUS_OK: u32 = 0;

/// Command category; one completion channel exists per category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    /// Network load
    Load,
    /// Network execution
    Exec,
    /// Network unload
    Unload,
}

impl OpKind {
    /// All categories, in slot order
    pub const ALL: [Self; 3] = [Self::Load, Self::Exec, Self::Unload];

    /// Dense index for per-category tables
    pub const fn slot(self) -> usize {
        match self {
            Self::Load => 0,
            Self::Exec => 1,
            Self::Unload => 2,
        }
    }
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Load => write!(f, "load"),
            Self::Exec => write!(f, "exec"),
            Self::Unload => write!(f, "unload"),
        }
    }
}

/// A device-visible memory range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferSpan {
    /// Host buffer handle (as passed to `map_buf`)
    pub handle: i32,
    /// Device address of the first byte
    pub physical_address: u64,
    /// Length in bytes
    pub size: u32,
}

/// Command sent host → firmware
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCommand {
    /// Load a network image
    Load {
        /// Correlator
        trans_id: u32,
        /// Host network id (informational for firmware logs)
        network_id: u64,
        /// Image location
        image: BufferSpan,
        /// Size of the first block the firmware fetches
        first_block_size: u32,
    },
    /// Execute a loaded network
    Exec {
        /// Correlator
        trans_id: u32,
        /// Firmware handle returned by load
        firmware_handle: u32,
        /// Input buffer
        input: BufferSpan,
        /// Output buffer
        output: BufferSpan,
        /// Execution flags, passed through
        flags: u32,
    },
    /// Unload a network
    Unload {
        /// Correlator
        trans_id: u32,
        /// Firmware handle returned by load
        firmware_handle: u32,
    },
}

impl HostCommand {
    /// Category of this command
    pub const fn kind(&self) -> OpKind {
        match self {
            Self::Load { .. } => OpKind::Load,
            Self::Exec { .. } => OpKind::Exec,
            Self::Unload { .. } => OpKind::Unload,
        }
    }

    /// Correlator of this command
    pub const fn trans_id(&self) -> u32 {
        match self {
            Self::Load { trans_id, .. }
            | Self::Exec { trans_id, .. }
            | Self::Unload { trans_id, .. } => *trans_id,
        }
    }
}

/// Response sent firmware → host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareResponse {
    /// Load finished
    Load {
        /// Correlator
        trans_id: u32,
        /// `STATUS_OK` or firmware error code
        status: u32,
        /// Firmware handle of the new network (valid only on success)
        firmware_handle: u32,
    },
    /// Exec finished
    Exec {
        /// Correlator
        trans_id: u32,
        /// `STATUS_OK` or firmware error code
        status: u32,
        /// Firmware-reported execution status
        exec_status: u32,
    },
    /// Unload finished
    Unload {
        /// Correlator
        trans_id: u32,
        /// `STATUS_OK` or firmware error code
        status: u32,
    },
}

impl FirmwareResponse {
    /// Category of this response
    pub const fn kind(&self) -> OpKind {
        match self {
            Self::Load { .. } => OpKind::Load,
            Self::Exec { .. } => OpKind::Exec,
            Self::Unload { .. } => OpKind::Unload,
        }
    }

    /// Correlator of this response
    pub const fn trans_id(&self) -> u32 {
        match self {
            Self::Load { trans_id, .. }
            | Self::Exec { trans_id, .. }
            | Self::Unload { trans_id, .. } => *trans_id,
        }
    }

    /// Firmware status code
    pub const fn status(&self) -> u32 {
        match self {
            Self::Load { status, .. } | Self::Exec { status, .. } | Self::Unload { status, .. } => {
                *status
            }
        }
    }
}

/// Packs protocol messages into IPC words and back
pub trait PacketCodec: Debug + Send + Sync {
    /// Encode a host command
    fn encode_command(&self, command: &HostCommand) -> Vec<u32>;

    /// Decode a host command (firmware side)
    ///
    /// # Errors
    ///
    /// Returns a protocol error for truncated or unknown packets.
    fn decode_command(&self, words: &[u32]) -> Result<HostCommand>;

    /// Encode a firmware response (firmware side)
    fn encode_response(&self, response: &FirmwareResponse) -> Vec<u32>;

    /// Decode a firmware response
    ///
    /// # Errors
    ///
    /// Returns a protocol error for truncated or unknown packets.
    fn decode_response(&self, words: &[u32]) -> Result<FirmwareResponse>;
}

/// Word framing: `[opcode, trans_id, payload...]`
#[derive(Debug, Clone, Copy, Default)]
pub struct WordCodec;

mod opcode {
    pub const CMD_LOAD: u32 = 0x0001;
    pub const CMD_EXEC: u32 = 0x0002;
    pub const CMD_UNLOAD: u32 = 0x0003;
    pub const RSP_LOAD: u32 = 0x0101;
    pub const RSP_EXEC: u32 = 0x0102;
    pub const RSP_UNLOAD: u32 = 0x0103;
}

#[allow(clippy::cast_possible_truncation)]
const fn split(value: u64) -> [u32; 2] {
    [value as u32, (value >> 32) as u32]
}

const fn join(lo: u32, hi: u32) -> u64 {
    ((hi as u64) << 32) | lo as u64
}

#[allow(clippy::cast_sign_loss)]
fn push_span(words: &mut Vec<u32>, span: &BufferSpan) {
    words.push(span.handle as u32);
    words.extend(split(span.physical_address));
    words.push(span.size);
}

#[allow(clippy::cast_possible_wrap)]
fn read_span(words: &[u32]) -> BufferSpan {
    BufferSpan {
        handle: words[0] as i32,
        physical_address: join(words[1], words[2]),
        size: words[3],
    }
}

fn expect_len(words: &[u32], len: usize, what: &str) -> Result<()> {
    if words.len() == len {
        Ok(())
    } else {
        Err(NpuError::protocol(format!(
            "{what}: expected {len} words, got {}",
            words.len()
        )))
    }
}

impl PacketCodec for WordCodec {
    fn encode_command(&self, command: &HostCommand) -> Vec<u32> {
        let mut words = Vec::with_capacity(12);
        match command {
            HostCommand::Load {
                trans_id,
                network_id,
                image,
                first_block_size,
            } => {
                words.extend([opcode::CMD_LOAD, *trans_id]);
                words.extend(split(*network_id));
                push_span(&mut words, image);
                words.push(*first_block_size);
            }
            HostCommand::Exec {
                trans_id,
                firmware_handle,
                input,
                output,
                flags,
            } => {
                words.extend([opcode::CMD_EXEC, *trans_id, *firmware_handle]);
                push_span(&mut words, input);
                push_span(&mut words, output);
                words.push(*flags);
            }
            HostCommand::Unload {
                trans_id,
                firmware_handle,
            } => {
                words.extend([opcode::CMD_UNLOAD, *trans_id, *firmware_handle]);
            }
        }
        words
    }

    fn decode_command(&self, words: &[u32]) -> Result<HostCommand> {
        let (&op, rest) = words
            .split_first()
            .ok_or_else(|| NpuError::protocol("empty command packet"))?;

        match op {
            opcode::CMD_LOAD => {
                expect_len(rest, 8, "load command")?;
                Ok(HostCommand::Load {
                    trans_id: rest[0],
                    network_id: join(rest[1], rest[2]),
                    image: read_span(&rest[3..7]),
                    first_block_size: rest[7],
                })
            }
            opcode::CMD_EXEC => {
                expect_len(rest, 11, "exec command")?;
                Ok(HostCommand::Exec {
                    trans_id: rest[0],
                    firmware_handle: rest[1],
                    input: read_span(&rest[2..6]),
                    output: read_span(&rest[6..10]),
                    flags: rest[10],
                })
            }
            opcode::CMD_UNLOAD => {
                expect_len(rest, 2, "unload command")?;
                Ok(HostCommand::Unload {
                    trans_id: rest[0],
                    firmware_handle: rest[1],
                })
            }
            other => Err(NpuError::protocol(format!(
                "unknown command opcode {other:#06x}"
            ))),
        }
    }

    fn encode_response(&self, response: &FirmwareResponse) -> Vec<u32> {
        match *response {
            FirmwareResponse::Load {
                trans_id,
                status,
                firmware_handle,
            } => vec![opcode::RSP_LOAD, trans_id, status, firmware_handle],
            FirmwareResponse::Exec {
                trans_id,
                status,
                exec_status,
            } => vec![opcode::RSP_EXEC, trans_id, status, exec_status],
            FirmwareResponse::Unload { trans_id, status } => {
                vec![opcode::RSP_UNLOAD, trans_id, status]
            }
        }
    }

    fn decode_response(&self, words: &[u32]) -> Result<FirmwareResponse> {
        let (&op, rest) = words
            .split_first()
            .ok_or_else(|| NpuError::protocol("empty response packet"))?;

        match op {
            opcode::RSP_LOAD => {
                expect_len(rest, 3, "load response")?;
                Ok(FirmwareResponse::Load {
                    trans_id: rest[0],
                    status: rest[1],
                    firmware_handle: rest[2],
                })
            }
            opcode::RSP_EXEC => {
                expect_len(rest, 3, "exec response")?;
                Ok(FirmwareResponse::Exec {
                    trans_id: rest[0],
                    status: rest[1],
                    exec_status: rest[2],
                })
            }
            opcode::RSP_UNLOAD => {
                expect_len(rest, 2, "unload response")?;
                Ok(FirmwareResponse::Unload {
                    trans_id: rest[0],
                    status: rest[1],
                })
            }
            other => Err(NpuError::protocol(format!(
                "unknown response opcode {other:#06x}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_command_preserves_descriptor() {
        let cmd = HostCommand::Load {
            trans_id: 7,
            network_id: 0x1_0000_0002,
            image: BufferSpan {
                handle: -3,
                physical_address: 0xdead_beef_0000,
                size: 6144,
            },
            first_block_size: 1024,
        };

        let words = WordCodec.encode_command(&cmd);
        assert_eq!(WordCodec.decode_command(&words).unwrap(), cmd);
        assert_eq!(cmd.kind(), OpKind::Load);
    }

    #[test]
    fn test_exec_response_decode() {
        let words = WordCodec.encode_response(&FirmwareResponse::Exec {
            trans_id: 42,
            status: STATUS_OK,
            exec_status: 0x55,
        });
        let rsp = WordCodec.decode_response(&words).unwrap();
        assert_eq!(rsp.kind(), OpKind::Exec);
        assert_eq!(rsp.trans_id(), 42);
        assert_eq!(rsp.status(), STATUS_OK);
    }

    #[test]
    fn test_malformed_packets_rejected() {
        assert!(WordCodec.decode_response(&[]).is_err());
        assert!(WordCodec.decode_response(&[opcode::RSP_LOAD, 1]).is_err());
        assert!(WordCodec.decode_response(&[0xffff, 1, 2, 3]).is_err());
        assert!(WordCodec.decode_command(&[opcode::CMD_UNLOAD]).is_err());
    }
}
