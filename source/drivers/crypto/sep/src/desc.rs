// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: SeP software descriptor codec (8 x u32 wire words <-> typed descriptors)
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable (wire format)
//! TEST_COVERAGE: 8 unit tests
//!
//! WIRE FORMAT:
//!   - word[0] bits[3:0]: descriptor type tag
//!   - word[1..=5]: per-type payload (see the `Field` table below)
//!   - word[6]: return code, written by the SeP on completion
//!   - word[7]: cookie, written by the host and never touched by the SeP
//!   - ring memory stores every word little-endian, whatever the host CPU is
//!
//! All bit offsets live in this module. Nothing else in the driver shifts or
//! masks descriptor words.

use core::fmt;

use thiserror::Error;

/// Number of 32-bit words in one hardware descriptor.
pub const DESC_WORDS: usize = 8;
/// Size of one hardware descriptor in bytes.
pub const DESC_SIZE_BYTES: usize = DESC_WORDS * 4;
/// Number of contexts one LOAD_OP descriptor can bring into the SeP cache.
pub const LOAD_OP_MAX_CTX: usize = 3;
/// Number of free-form words carried by a DEBUG descriptor.
pub const DEBUG_PAYLOAD_WORDS: usize = 5;

const RET_CODE_WORD: usize = 6;
const COOKIE_WORD: usize = 7;

/// A bit range inside one descriptor word.
#[derive(Clone, Copy)]
struct Field {
    word: usize,
    shift: u32,
    bits: u32,
}

impl Field {
    const fn new(word: usize, shift: u32, bits: u32) -> Self {
        Self { word, shift, bits }
    }

    const fn mask(self) -> u32 {
        if self.bits >= 32 {
            u32::MAX
        } else {
            (1u32 << self.bits) - 1
        }
    }

    fn get(self, desc: &HwDesc) -> u32 {
        (desc.words[self.word] >> self.shift) & self.mask()
    }

    fn set(self, desc: &mut HwDesc, value: u32) {
        let mask = self.mask() << self.shift;
        let word = &mut desc.words[self.word];
        *word = (*word & !mask) | ((value << self.shift) & mask);
    }

    fn get_bool(self, desc: &HwDesc) -> bool {
        self.get(desc) != 0
    }

    fn set_bool(self, desc: &mut HwDesc, value: bool) {
        self.set(desc, value as u32);
    }
}

const TYPE: Field = Field::new(0, 0, 4);

const CRYPTO_PROC_MODE: Field = Field::new(0, 4, 2);
const CRYPTO_FW_CACHE_IDX: Field = Field::new(0, 16, 8);
const CRYPTO_LOAD: Field = Field::new(0, 30, 1);
const CRYPTO_INIT: Field = Field::new(0, 31, 1);
const CRYPTO_HCB_ADDR: Field = Field::new(1, 0, 32);

// Shared by CRYPTO_OP and COMBINED_OP.
const IFT_ADDR: Field = Field::new(2, 0, 32);
const IFT_SIZE: Field = Field::new(3, 0, 16);
const IFT_NUM: Field = Field::new(3, 16, 16);
const OFT_ADDR: Field = Field::new(4, 0, 32);
const OFT_SIZE: Field = Field::new(5, 0, 16);
const OFT_NUM: Field = Field::new(5, 16, 16);

const COMBINED_PROC_MODE: Field = Field::new(0, 4, 2);
const COMBINED_CONFIG: Field = Field::new(1, 0, 32);

const RPC_AGENT_ID: Field = Field::new(0, 8, 8);
const RPC_FUNC_ID: Field = Field::new(0, 16, 16);
const RPC_HMB_ADDR: Field = Field::new(1, 0, 32);
const RPC_HMB_SIZE: Field = Field::new(2, 0, 32);

const APP_REQ_TYPE: Field = Field::new(0, 4, 2);
const APP_SESSION_ID: Field = Field::new(0, 16, 16);
const APP_COMMAND_ID: Field = Field::new(1, 0, 32);
const APP_PARAMS_ADDR: Field = Field::new(2, 0, 32);

const fn load_cache_idx(i: usize) -> Field {
    Field::new(0, 4 + 8 * i as u32, 8)
}

// HCB addresses are at least 4-byte aligned; bit 0 carries the init flag.
const fn load_hcb_addr(i: usize) -> Field {
    Field::new(1 + i, 1, 31)
}

const fn load_init(i: usize) -> Field {
    Field::new(1 + i, 0, 1)
}

/// Errors produced while decoding a hardware descriptor.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum DescError {
    /// The type tag does not name a known descriptor kind.
    #[error("unknown descriptor type {0:#x}")]
    UnknownType(u32),
    /// A field holds a value outside its enumeration.
    #[error("{kind:?} descriptor has invalid {field} value {value:#x}")]
    BadField { kind: DescType, field: &'static str, value: u32 },
}

/// Descriptor type tag (word[0] bits[3:0]).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DescType {
    Null = 0,
    CryptoOp = 1,
    RpcMsg = 2,
    AppReq = 3,
    LoadOp = 4,
    CombinedOp = 5,
    SleepReq = 6,
    Debug = 0xF,
}

impl TryFrom<u32> for DescType {
    type Error = DescError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Null,
            1 => Self::CryptoOp,
            2 => Self::RpcMsg,
            3 => Self::AppReq,
            4 => Self::LoadOp,
            5 => Self::CombinedOp,
            6 => Self::SleepReq,
            0xF => Self::Debug,
            other => return Err(DescError::UnknownType(other)),
        })
    }
}

/// Processing mode of a crypto or combined operation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[repr(u8)]
pub enum ProcMode {
    #[default]
    Nop = 0,
    /// Process a block of text (payload data).
    ProcessText = 1,
    /// Finalize: process the last block and emit the result.
    Finalize = 2,
    /// Process associated data (AEAD).
    ProcessAdata = 3,
}

impl ProcMode {
    fn from_bits(bits: u32) -> Self {
        match bits & 0x3 {
            1 => Self::ProcessText,
            2 => Self::Finalize,
            3 => Self::ProcessAdata,
            _ => Self::Nop,
        }
    }
}

/// Kind of Applet request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum AppReqType {
    OpenSession = 0,
    CloseSession = 1,
    CommandInvoke = 2,
}

/// Pointer to an MLLI table as carried inside a descriptor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TableRef {
    /// DMA address of the first table.
    pub addr: u32,
    /// Size in bytes of the first table.
    pub size: u16,
    /// Number of tables in the chain.
    pub num: u16,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CryptoOp {
    pub proc_mode: ProcMode,
    /// Initialize the context before processing.
    pub init: bool,
    /// Fetch the context from host memory into the SeP cache first.
    pub load: bool,
    /// Slot of the context in the SeP context cache.
    pub fw_cache_idx: u8,
    /// DMA address of the host context block.
    pub hcb_addr: u32,
    pub ift: TableRef,
    pub oft: TableRef,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CombinedOp {
    pub proc_mode: ProcMode,
    /// Engine chaining configuration.
    pub config_scheme: u32,
    pub ift: TableRef,
    pub oft: TableRef,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RpcMsg {
    pub agent_id: u8,
    pub func_id: u16,
    /// DMA address of the host message buffer.
    pub hmb_addr: u32,
    pub hmb_size: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AppReq {
    pub req_type: AppReqType,
    pub session_id: u16,
    pub command_id: u32,
    /// DMA address of the parameter block.
    pub params_addr: u32,
}

/// One context to load into the SeP cache.
///
/// The wire form stores `hcb_addr >> 1` and uses 0 for an unused entry, so an
/// entry whose address is 0 or 1 decodes as absent. Callers check
/// `encodable_hcb_addr` first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LoadEntry {
    pub cache_idx: u8,
    /// DMA address of the host context block; bit 0 is dropped on encode.
    pub hcb_addr: u32,
    pub init: bool,
}

impl LoadEntry {
    /// True when `addr` still names an entry after encoding.
    pub const fn encodable_hcb_addr(addr: u32) -> bool {
        addr >> 1 != 0
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoadOp {
    pub entries: [Option<LoadEntry>; LOAD_OP_MAX_CTX],
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DebugMsg {
    pub payload: [u32; DEBUG_PAYLOAD_WORDS],
}

/// Typed view of a hardware descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Descriptor {
    Null,
    Crypto(CryptoOp),
    Rpc(RpcMsg),
    AppReq(AppReq),
    Load(LoadOp),
    Combined(CombinedOp),
    Sleep,
    Debug(DebugMsg),
}

impl Descriptor {
    pub fn desc_type(&self) -> DescType {
        match self {
            Self::Null => DescType::Null,
            Self::Crypto(_) => DescType::CryptoOp,
            Self::Rpc(_) => DescType::RpcMsg,
            Self::AppReq(_) => DescType::AppReq,
            Self::Load(_) => DescType::LoadOp,
            Self::Combined(_) => DescType::CombinedOp,
            Self::Sleep => DescType::SleepReq,
            Self::Debug(_) => DescType::Debug,
        }
    }

    /// Packs the descriptor into wire words. Return code and cookie words are left zero.
    pub fn encode(&self) -> HwDesc {
        let mut hw = HwDesc::zeroed();
        TYPE.set(&mut hw, self.desc_type() as u32);
        match self {
            Self::Null | Self::Sleep => {}
            Self::Crypto(op) => {
                CRYPTO_PROC_MODE.set(&mut hw, op.proc_mode as u32);
                CRYPTO_FW_CACHE_IDX.set(&mut hw, op.fw_cache_idx as u32);
                CRYPTO_LOAD.set_bool(&mut hw, op.load);
                CRYPTO_INIT.set_bool(&mut hw, op.init);
                CRYPTO_HCB_ADDR.set(&mut hw, op.hcb_addr);
                put_tables(&mut hw, &op.ift, &op.oft);
            }
            Self::Combined(op) => {
                COMBINED_PROC_MODE.set(&mut hw, op.proc_mode as u32);
                COMBINED_CONFIG.set(&mut hw, op.config_scheme);
                put_tables(&mut hw, &op.ift, &op.oft);
            }
            Self::Rpc(msg) => {
                RPC_AGENT_ID.set(&mut hw, msg.agent_id as u32);
                RPC_FUNC_ID.set(&mut hw, msg.func_id as u32);
                RPC_HMB_ADDR.set(&mut hw, msg.hmb_addr);
                RPC_HMB_SIZE.set(&mut hw, msg.hmb_size);
            }
            Self::AppReq(req) => {
                APP_REQ_TYPE.set(&mut hw, req.req_type as u32);
                APP_SESSION_ID.set(&mut hw, req.session_id as u32);
                APP_COMMAND_ID.set(&mut hw, req.command_id);
                APP_PARAMS_ADDR.set(&mut hw, req.params_addr);
            }
            Self::Load(op) => {
                for (i, entry) in op.entries.iter().enumerate() {
                    if let Some(entry) = entry {
                        load_cache_idx(i).set(&mut hw, entry.cache_idx as u32);
                        load_hcb_addr(i).set(&mut hw, entry.hcb_addr >> 1);
                        load_init(i).set_bool(&mut hw, entry.init);
                    }
                }
            }
            Self::Debug(msg) => {
                hw.words[1..=DEBUG_PAYLOAD_WORDS].copy_from_slice(&msg.payload);
            }
        }
        hw
    }

    /// Parses wire words back into a typed descriptor.
    pub fn decode(hw: &HwDesc) -> Result<Self, DescError> {
        Ok(match hw.desc_type()? {
            DescType::Null => Self::Null,
            DescType::SleepReq => Self::Sleep,
            DescType::CryptoOp => {
                let (ift, oft) = get_tables(hw);
                Self::Crypto(CryptoOp {
                    proc_mode: ProcMode::from_bits(CRYPTO_PROC_MODE.get(hw)),
                    init: CRYPTO_INIT.get_bool(hw),
                    load: CRYPTO_LOAD.get_bool(hw),
                    fw_cache_idx: CRYPTO_FW_CACHE_IDX.get(hw) as u8,
                    hcb_addr: CRYPTO_HCB_ADDR.get(hw),
                    ift,
                    oft,
                })
            }
            DescType::CombinedOp => {
                let (ift, oft) = get_tables(hw);
                Self::Combined(CombinedOp {
                    proc_mode: ProcMode::from_bits(COMBINED_PROC_MODE.get(hw)),
                    config_scheme: COMBINED_CONFIG.get(hw),
                    ift,
                    oft,
                })
            }
            DescType::RpcMsg => Self::Rpc(RpcMsg {
                agent_id: RPC_AGENT_ID.get(hw) as u8,
                func_id: RPC_FUNC_ID.get(hw) as u16,
                hmb_addr: RPC_HMB_ADDR.get(hw),
                hmb_size: RPC_HMB_SIZE.get(hw),
            }),
            DescType::AppReq => {
                let raw = APP_REQ_TYPE.get(hw);
                let req_type = match raw {
                    0 => AppReqType::OpenSession,
                    1 => AppReqType::CloseSession,
                    2 => AppReqType::CommandInvoke,
                    value => {
                        return Err(DescError::BadField {
                            kind: DescType::AppReq,
                            field: "req_type",
                            value,
                        })
                    }
                };
                Self::AppReq(AppReq {
                    req_type,
                    session_id: APP_SESSION_ID.get(hw) as u16,
                    command_id: APP_COMMAND_ID.get(hw),
                    params_addr: APP_PARAMS_ADDR.get(hw),
                })
            }
            DescType::LoadOp => {
                let mut op = LoadOp::default();
                for (i, slot) in op.entries.iter_mut().enumerate() {
                    let hcb_addr = load_hcb_addr(i).get(hw) << 1;
                    if hcb_addr == 0 {
                        continue;
                    }
                    *slot = Some(LoadEntry {
                        cache_idx: load_cache_idx(i).get(hw) as u8,
                        hcb_addr,
                        init: load_init(i).get_bool(hw),
                    });
                }
                Self::Load(op)
            }
            DescType::Debug => {
                let mut payload = [0u32; DEBUG_PAYLOAD_WORDS];
                payload.copy_from_slice(&hw.words[1..=DEBUG_PAYLOAD_WORDS]);
                Self::Debug(DebugMsg { payload })
            }
        })
    }
}

fn put_tables(hw: &mut HwDesc, ift: &TableRef, oft: &TableRef) {
    IFT_ADDR.set(hw, ift.addr);
    IFT_SIZE.set(hw, ift.size as u32);
    IFT_NUM.set(hw, ift.num as u32);
    OFT_ADDR.set(hw, oft.addr);
    OFT_SIZE.set(hw, oft.size as u32);
    OFT_NUM.set(hw, oft.num as u32);
}

fn get_tables(hw: &HwDesc) -> (TableRef, TableRef) {
    (
        TableRef { addr: IFT_ADDR.get(hw), size: IFT_SIZE.get(hw) as u16, num: IFT_NUM.get(hw) as u16 },
        TableRef { addr: OFT_ADDR.get(hw), size: OFT_SIZE.get(hw) as u16, num: OFT_NUM.get(hw) as u16 },
    )
}

/// Raw hardware descriptor in host word order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct HwDesc {
    words: [u32; DESC_WORDS],
}

impl HwDesc {
    pub const fn zeroed() -> Self {
        Self { words: [0; DESC_WORDS] }
    }

    pub const fn from_words(words: [u32; DESC_WORDS]) -> Self {
        Self { words }
    }

    pub const fn words(&self) -> &[u32; DESC_WORDS] {
        &self.words
    }

    pub fn desc_type(&self) -> Result<DescType, DescError> {
        DescType::try_from(TYPE.get(self))
    }

    pub const fn ret_code(&self) -> u32 {
        self.words[RET_CODE_WORD]
    }

    pub fn set_ret_code(&mut self, rc: u32) {
        self.words[RET_CODE_WORD] = rc;
    }

    pub const fn cookie(&self) -> u32 {
        self.words[COOKIE_WORD]
    }

    pub fn set_cookie(&mut self, cookie: u32) {
        self.words[COOKIE_WORD] = cookie;
    }

    /// Serializes to the little-endian wire layout.
    pub fn to_le_bytes(&self) -> [u8; DESC_SIZE_BYTES] {
        let mut out = [0u8; DESC_SIZE_BYTES];
        for (chunk, word) in out.chunks_exact_mut(4).zip(self.words.iter()) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        out
    }

    pub fn from_le_bytes(bytes: &[u8; DESC_SIZE_BYTES]) -> Self {
        let mut words = [0u32; DESC_WORDS];
        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(4)) {
            *word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
        Self { words }
    }
}

impl fmt::Display for HwDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, word) in self.words.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{word:08x}")?;
        }
        Ok(())
    }
}
