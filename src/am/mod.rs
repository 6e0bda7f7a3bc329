//! Active message protocol
//!
//! Requests are a tagged union over eight opcodes, exchanged byte-exact:
//! every variant leads with the opcode byte, the initiator node id, and
//! the optional remote pointer to the initiator's done byte (zero when
//! nonblocking), followed by variant fields in a fixed order with no
//! implicit padding. All nodes run the same layout.
//!
//! `ExecOn` inlines its payload up to [`MAX_EXECON_INLINE`]; larger bodies
//! travel as `ExecOnLarge`, a header naming the initiator-side payload
//! which the handler pulls over RMA before running the body.

pub mod handler;

use std::sync::atomic::{AtomicU8, Ordering};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{CommError, CommResult};
use crate::types::{AmoOp, AmoType, NodeId};

/// Largest payload an `ExecOn` carries inline.
pub const MAX_EXECON_INLINE: usize = 1024;

/// Opcode byte + initiator id + done pointer.
const HEADER_SIZE: usize = 1 + 4 + 8;

/// Upper bound on any encoded request; the receive endpoints size their
/// multi-receive threshold from this.
pub const MAX_REQ_WIRE_SIZE: usize = HEADER_SIZE + 4 + 1 + 4 + MAX_EXECON_INLINE;

const OP_EXEC_ON: u8 = 0;
const OP_EXEC_ON_LARGE: u8 = 1;
const OP_GET: u8 = 2;
const OP_PUT: u8 = 3;
const OP_AMO: u8 = 4;
const OP_FREE: u8 = 5;
const OP_NOP: u8 = 6;
const OP_SHUTDOWN: u8 = 7;

/// Which nodes an outgoing request must fence before transmission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FenceScope {
    /// Everything in the task's put bitmap (requests that may read state).
    All,
    /// Only the target node.
    Target,
    None,
}

/// One active message request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum AmRequest {
    ExecOn {
        initiator: NodeId,
        done: u64,
        fid: u32,
        fast: bool,
        payload: Vec<u8>,
    },
    ExecOnLarge {
        initiator: NodeId,
        done: u64,
        fid: u32,
        payload_addr: u64,
        payload_len: u64,
        needs_free: bool,
    },
    /// "GET from me": the target reads `len` bytes at `remote_src` on the
    /// initiator into its own `local_dst` (the inverse of a PUT the
    /// initiator could not do natively).
    Get {
        initiator: NodeId,
        done: u64,
        remote_src: u64,
        local_dst: u64,
        len: u64,
    },
    /// "PUT to me": the target writes its `local_src` into `remote_dst`
    /// on the initiator.
    Put {
        initiator: NodeId,
        done: u64,
        local_src: u64,
        remote_dst: u64,
        len: u64,
    },
    Amo {
        initiator: NodeId,
        done: u64,
        obj: u64,
        op: AmoOp,
        ty: AmoType,
        opnd: u64,
        cmpr: u64,
        /// Initiator-side destination for the fetched value; zero if none.
        result_addr: u64,
    },
    /// Releases the payload copy a nonblocking large execute-on left
    /// behind on the initiator.
    Free {
        initiator: NodeId,
        addr: u64,
        len: u64,
    },
    /// Liveness probe; signals done if asked to.
    Nop {
        initiator: NodeId,
        done: u64,
        nonce: u64,
    },
    Shutdown {
        initiator: NodeId,
    },
}

impl AmRequest {
    pub(crate) fn opcode(&self) -> u8 {
        match self {
            AmRequest::ExecOn { .. } => OP_EXEC_ON,
            AmRequest::ExecOnLarge { .. } => OP_EXEC_ON_LARGE,
            AmRequest::Get { .. } => OP_GET,
            AmRequest::Put { .. } => OP_PUT,
            AmRequest::Amo { .. } => OP_AMO,
            AmRequest::Free { .. } => OP_FREE,
            AmRequest::Nop { .. } => OP_NOP,
            AmRequest::Shutdown { .. } => OP_SHUTDOWN,
        }
    }

    pub(crate) fn done(&self) -> u64 {
        match self {
            AmRequest::ExecOn { done, .. }
            | AmRequest::ExecOnLarge { done, .. }
            | AmRequest::Get { done, .. }
            | AmRequest::Put { done, .. }
            | AmRequest::Amo { done, .. }
            | AmRequest::Nop { done, .. } => *done,
            AmRequest::Free { .. } | AmRequest::Shutdown { .. } => 0,
        }
    }

    pub(crate) fn set_done(&mut self, value: u64) {
        match self {
            AmRequest::ExecOn { done, .. }
            | AmRequest::ExecOnLarge { done, .. }
            | AmRequest::Get { done, .. }
            | AmRequest::Put { done, .. }
            | AmRequest::Amo { done, .. }
            | AmRequest::Nop { done, .. } => *done = value,
            AmRequest::Free { .. } | AmRequest::Shutdown { .. } => {}
        }
    }

    /// The visibility fence this request requires before it is sent.
    pub(crate) fn fence_scope(&self) -> FenceScope {
        match self {
            // Execute-on bodies and write AMOs may read state at the
            // target, so everything outstanding must land first.
            AmRequest::ExecOn { .. } | AmRequest::ExecOnLarge { .. } => FenceScope::All,
            AmRequest::Amo { op, .. } if op.is_write() => FenceScope::All,
            AmRequest::Get { .. } | AmRequest::Put { .. } => FenceScope::Target,
            _ => FenceScope::None,
        }
    }

    pub(crate) fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(MAX_REQ_WIRE_SIZE);
        buf.put_u8(self.opcode());
        let initiator = match self {
            AmRequest::ExecOn { initiator, .. }
            | AmRequest::ExecOnLarge { initiator, .. }
            | AmRequest::Get { initiator, .. }
            | AmRequest::Put { initiator, .. }
            | AmRequest::Amo { initiator, .. }
            | AmRequest::Free { initiator, .. }
            | AmRequest::Nop { initiator, .. }
            | AmRequest::Shutdown { initiator } => *initiator,
        };
        buf.put_u32_le(u32::from(initiator));
        buf.put_u64_le(self.done());
        match self {
            AmRequest::ExecOn {
                fid, fast, payload, ..
            } => {
                debug_assert!(payload.len() <= MAX_EXECON_INLINE);
                buf.put_u32_le(*fid);
                buf.put_u8(u8::from(*fast));
                buf.put_u32_le(payload.len() as u32);
                buf.put_slice(payload);
            }
            AmRequest::ExecOnLarge {
                fid,
                payload_addr,
                payload_len,
                needs_free,
                ..
            } => {
                buf.put_u32_le(*fid);
                buf.put_u64_le(*payload_addr);
                buf.put_u64_le(*payload_len);
                buf.put_u8(u8::from(*needs_free));
            }
            AmRequest::Get {
                remote_src,
                local_dst,
                len,
                ..
            } => {
                buf.put_u64_le(*remote_src);
                buf.put_u64_le(*local_dst);
                buf.put_u64_le(*len);
            }
            AmRequest::Put {
                local_src,
                remote_dst,
                len,
                ..
            } => {
                buf.put_u64_le(*local_src);
                buf.put_u64_le(*remote_dst);
                buf.put_u64_le(*len);
            }
            AmRequest::Amo {
                obj,
                op,
                ty,
                opnd,
                cmpr,
                result_addr,
                ..
            } => {
                buf.put_u64_le(*obj);
                buf.put_u8(*op as u8);
                buf.put_u8(*ty as u8);
                buf.put_u64_le(*opnd);
                buf.put_u64_le(*cmpr);
                buf.put_u64_le(*result_addr);
            }
            AmRequest::Free { addr, len, .. } => {
                buf.put_u64_le(*addr);
                buf.put_u64_le(*len);
            }
            AmRequest::Nop { nonce, .. } => {
                buf.put_u64_le(*nonce);
            }
            AmRequest::Shutdown { .. } => {}
        }
        buf.freeze()
    }

    pub(crate) fn decode(raw: &[u8]) -> CommResult<Self> {
        if raw.len() < HEADER_SIZE {
            return Err(CommError::BadState(format!(
                "am request of {} bytes is shorter than its header",
                raw.len()
            )));
        }
        let mut buf = raw;
        let opcode = buf.get_u8();
        let initiator = NodeId::new(buf.get_u32_le());
        let done = buf.get_u64_le();
        let req = match opcode {
            OP_EXEC_ON => {
                let fid = buf.get_u32_le();
                let fast = buf.get_u8() != 0;
                let len = buf.get_u32_le() as usize;
                let payload = buf[..len].to_vec();
                AmRequest::ExecOn {
                    initiator,
                    done,
                    fid,
                    fast,
                    payload,
                }
            }
            OP_EXEC_ON_LARGE => AmRequest::ExecOnLarge {
                initiator,
                done,
                fid: buf.get_u32_le(),
                payload_addr: buf.get_u64_le(),
                payload_len: buf.get_u64_le(),
                needs_free: buf.get_u8() != 0,
            },
            OP_GET => AmRequest::Get {
                initiator,
                done,
                remote_src: buf.get_u64_le(),
                local_dst: buf.get_u64_le(),
                len: buf.get_u64_le(),
            },
            OP_PUT => AmRequest::Put {
                initiator,
                done,
                local_src: buf.get_u64_le(),
                remote_dst: buf.get_u64_le(),
                len: buf.get_u64_le(),
            },
            OP_AMO => {
                let obj = buf.get_u64_le();
                let op_raw = buf.get_u8();
                let ty_raw = buf.get_u8();
                AmRequest::Amo {
                    initiator,
                    done,
                    obj,
                    op: AmoOp::from_wire(op_raw).ok_or_else(|| {
                        CommError::BadState(format!("bad amo op tag {op_raw}"))
                    })?,
                    ty: AmoType::from_wire(ty_raw).ok_or_else(|| {
                        CommError::BadState(format!("bad amo type tag {ty_raw}"))
                    })?,
                    opnd: buf.get_u64_le(),
                    cmpr: buf.get_u64_le(),
                    result_addr: buf.get_u64_le(),
                }
            }
            OP_FREE => AmRequest::Free {
                initiator,
                addr: buf.get_u64_le(),
                len: buf.get_u64_le(),
            },
            OP_NOP => AmRequest::Nop {
                initiator,
                done,
                nonce: buf.get_u64_le(),
            },
            OP_SHUTDOWN => AmRequest::Shutdown { initiator },
            other => {
                return Err(CommError::BadState(format!("unknown am opcode {other}")));
            }
        };
        Ok(req)
    }
}

/// A one-byte completion flag in registered memory, written remotely by
/// the handler and spun on locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DoneByte {
    pub addr: usize,
}

impl DoneByte {
    fn cell(&self) -> &AtomicU8 {
        // SAFETY: the byte lives in the registered heap arena for the
        // lifetime of the job and is only ever accessed atomically.
        unsafe { AtomicU8::from_ptr(self.addr as *mut u8) }
    }

    pub(crate) fn reset(&self) {
        self.cell().store(0, Ordering::Release);
    }

    pub(crate) fn is_set(&self) -> bool {
        self.cell().load(Ordering::Acquire) != 0
    }
}

/// Executes the bodies named by `ExecOn` requests. Supplied by the layer
/// above at init; the bundle-call dispatch itself is not this crate's
/// business.
pub trait AmDispatch: Send + Sync {
    /// Runs function `fid` with `payload`.
    fn execute(&self, fid: u32, payload: &[u8]);
}

/// Dispatch that ignores every body; useful for jobs that only do RMA and
/// atomics, and for tests.
pub struct NopDispatch;

impl AmDispatch for NopDispatch {
    fn execute(&self, _fid: u32, _payload: &[u8]) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_on_codec_keeps_payload_and_flags() {
        let req = AmRequest::ExecOn {
            initiator: NodeId::new(3),
            done: 0xDEAD_0000,
            fid: 17,
            fast: true,
            payload: vec![1, 2, 3, 4, 5],
        };
        let wire = req.encode();
        assert_eq!(wire[0], OP_EXEC_ON);
        assert_eq!(AmRequest::decode(&wire).unwrap(), req);
    }

    #[test]
    fn header_layout_is_fixed() {
        let req = AmRequest::Nop {
            initiator: NodeId::new(0x0102_0304),
            done: 0x1112_1314_1516_1718,
            nonce: 9,
        };
        let wire = req.encode();
        // opcode, then little-endian initiator, then the done pointer.
        assert_eq!(wire[0], OP_NOP);
        assert_eq!(&wire[1..5], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(
            &wire[5..13],
            &[0x18, 0x17, 0x16, 0x15, 0x14, 0x13, 0x12, 0x11]
        );
    }

    #[test]
    fn amo_codec_rejects_bad_tags() {
        let req = AmRequest::Amo {
            initiator: NodeId::new(1),
            done: 0,
            obj: 0x1000,
            op: AmoOp::Cswap,
            ty: AmoType::U64,
            opnd: 9,
            cmpr: 5,
            result_addr: 0x2000,
        };
        let mut wire = req.encode().to_vec();
        assert_eq!(AmRequest::decode(&wire).unwrap(), req);
        // Corrupt the op tag.
        wire[HEADER_SIZE + 8] = 0xFF;
        assert!(AmRequest::decode(&wire).is_err());
    }

    #[test]
    fn fence_scopes_follow_request_semantics() {
        let on = AmRequest::ExecOn {
            initiator: NodeId::new(0),
            done: 0,
            fid: 0,
            fast: false,
            payload: Vec::new(),
        };
        assert_eq!(on.fence_scope(), FenceScope::All);

        let get = AmRequest::Get {
            initiator: NodeId::new(0),
            done: 1,
            remote_src: 0,
            local_dst: 0,
            len: 0,
        };
        assert_eq!(get.fence_scope(), FenceScope::Target);

        let read_amo = AmRequest::Amo {
            initiator: NodeId::new(0),
            done: 0,
            obj: 0,
            op: AmoOp::Read,
            ty: AmoType::U32,
            opnd: 0,
            cmpr: 0,
            result_addr: 0,
        };
        assert_eq!(read_amo.fence_scope(), FenceScope::None);

        assert_eq!(
            AmRequest::Shutdown {
                initiator: NodeId::new(0)
            }
            .fence_scope(),
            FenceScope::None
        );
    }

    #[test]
    fn wire_size_bound_holds_for_the_largest_request() {
        let req = AmRequest::ExecOn {
            initiator: NodeId::new(0),
            done: u64::MAX,
            fid: u32::MAX,
            fast: false,
            payload: vec![0xAB; MAX_EXECON_INLINE],
        };
        assert_eq!(req.encode().len(), MAX_REQ_WIRE_SIZE);
    }
}
