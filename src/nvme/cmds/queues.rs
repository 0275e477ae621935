// ============================================================================
// src/nvme/cmds/queues.rs - I/O Queue Management Commands
// ============================================================================
//!
//! Create I/O CQ (0x05) / Create I/O SQ (0x01) / Delete I/O CQ (0x04) /
//! Delete I/O SQ (0x00)
//!
//! CDW10: QID (15:0) | QSIZE (31:16, 0始まり)
//! CDW11 (CQ): PC (0) | IEN (1) | IV (31:16)
//! CDW11 (SQ): PC (0) | QPRIO (2:1) | CQID (31:16)
//!
//! キューメモリはドライバが確保したものを読み取り専用で参照する。

use crate::error::{ConformanceError, Result};
use crate::nvme::command::{Cmd, NvmeCmd};
use crate::nvme::defs::{AdminOpcode, PAGE_SIZE, cmd_layout};
use crate::nvme::prp::{DataDir, PrpBitmask, RoRegion, page_addresses};

const DW10: usize = cmd_layout::DW_CDW10;
const DW11: usize = cmd_layout::DW_CDW11;

const PC_MASK: u8 = 0x01;
const IEN_MASK: u8 = 0x02;
const QPRIO_MASK: u8 = 0x06;

/// キュー作成コマンドが許可するPRP配置
const QUEUE_PRP_ALLOWED: PrpBitmask = PrpBitmask::PRP1_PAGE.union(PrpBitmask::PRP1_LIST);

/// キューメモリを関連付け、PCビットを合わせる
///
/// 1ページに収まる領域はPRP1直接指定（PC=1）、
/// 複数ページにまたがる領域はPRPリスト（PC=0）で記述する。
/// キューの先頭はページ境界に揃っていなければならない。
fn attach_queue_region(cmd: &mut Cmd, region: RoRegion) -> Result<()> {
    if region.host_addr() % PAGE_SIZE != 0 {
        return Err(ConformanceError::InvalidBuffer(
            "queue memory must start on a page boundary",
        ));
    }
    let pages = page_addresses(region.host_addr() as u64, region.len(), PAGE_SIZE).len();
    let (fields, contiguous) = if pages == 1 {
        (PrpBitmask::PRP1_PAGE, true)
    } else {
        (PrpBitmask::PRP1_LIST, false)
    };
    cmd.set_prp_buffer_ro(fields, region)?;
    cmd.set_bits(contiguous as u8, PC_MASK, DW11, 0)
}

/// Submission Queue の優先度
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePriority {
    Urgent = 0,
    High = 1,
    Medium = 2,
    Low = 3,
}

// ============================================================================
// Create I/O Completion Queue
// ============================================================================

/// Create I/O Completion Queue コマンド
#[derive(Debug, Clone)]
pub struct CreateIoCq {
    cmd: Cmd,
}

impl CreateIoCq {
    /// オペコード
    pub const OPCODE: u8 = AdminOpcode::CreateIOCQ as u8;

    pub fn new() -> Self {
        Self {
            cmd: Cmd::new(Self::OPCODE, DataDir::ToDevice, QUEUE_PRP_ALLOWED),
        }
    }

    /// Queue Identifier
    pub fn set_qid(&mut self, qid: u16) -> Result<()> {
        self.cmd.set_word(qid, DW10, 0)
    }

    /// Queue Size（0始まり）
    pub fn set_qsize(&mut self, qsize: u16) -> Result<()> {
        self.cmd.set_word(qsize, DW10, 2)
    }

    /// Physically Contiguous
    pub fn set_pc(&mut self, pc: bool) -> Result<()> {
        self.cmd.set_bits(pc as u8, PC_MASK, DW11, 0)
    }

    /// Interrupts Enabled
    pub fn set_ien(&mut self, ien: bool) -> Result<()> {
        self.cmd.set_bits(if ien { IEN_MASK } else { 0 }, IEN_MASK, DW11, 0)
    }

    /// Interrupt Vector
    pub fn set_iv(&mut self, iv: u16) -> Result<()> {
        self.cmd.set_word(iv, DW11, 2)
    }

    /// ドライバ所有のCQメモリを関連付ける
    ///
    /// 読み取り専用の関連付けはキュー作成コマンドだけに許される。
    /// 他のコマンドからは使えない:
    ///
    /// ```compile_fail
    /// use nvme_conformance::nvme::{GetFeatures, NvmeCmd, PrpBitmask, RoRegion};
    ///
    /// static MEM: [u8; 64] = [0; 64];
    /// let mut get = GetFeatures::new();
    /// let _ = get
    ///     .cmd_mut()
    ///     .set_prp_buffer_ro(PrpBitmask::PRP1_PAGE, RoRegion::from_static(&MEM));
    /// ```
    pub fn attach_queue_memory(&mut self, region: RoRegion) -> Result<()> {
        attach_queue_region(&mut self.cmd, region)
    }
}

impl Default for CreateIoCq {
    fn default() -> Self {
        Self::new()
    }
}

impl NvmeCmd for CreateIoCq {
    fn cmd(&self) -> &Cmd {
        &self.cmd
    }

    fn cmd_mut(&mut self) -> &mut Cmd {
        &mut self.cmd
    }

    fn name(&self) -> &'static str {
        "CreateIoCq"
    }
}

// ============================================================================
// Create I/O Submission Queue
// ============================================================================

/// Create I/O Submission Queue コマンド
#[derive(Debug, Clone)]
pub struct CreateIoSq {
    cmd: Cmd,
}

impl CreateIoSq {
    /// オペコード
    pub const OPCODE: u8 = AdminOpcode::CreateIOSQ as u8;

    pub fn new() -> Self {
        Self {
            cmd: Cmd::new(Self::OPCODE, DataDir::ToDevice, QUEUE_PRP_ALLOWED),
        }
    }

    /// Queue Identifier
    pub fn set_qid(&mut self, qid: u16) -> Result<()> {
        self.cmd.set_word(qid, DW10, 0)
    }

    /// Queue Size（0始まり）
    pub fn set_qsize(&mut self, qsize: u16) -> Result<()> {
        self.cmd.set_word(qsize, DW10, 2)
    }

    /// Physically Contiguous
    pub fn set_pc(&mut self, pc: bool) -> Result<()> {
        self.cmd.set_bits(pc as u8, PC_MASK, DW11, 0)
    }

    /// Queue Priority
    pub fn set_qprio(&mut self, prio: QueuePriority) -> Result<()> {
        self.cmd.set_bits((prio as u8) << 1, QPRIO_MASK, DW11, 0)
    }

    /// 関連付けるCompletion Queue
    pub fn set_cqid(&mut self, cqid: u16) -> Result<()> {
        self.cmd.set_word(cqid, DW11, 2)
    }

    /// ドライバ所有のSQメモリを関連付ける
    pub fn attach_queue_memory(&mut self, region: RoRegion) -> Result<()> {
        attach_queue_region(&mut self.cmd, region)
    }
}

impl Default for CreateIoSq {
    fn default() -> Self {
        Self::new()
    }
}

impl NvmeCmd for CreateIoSq {
    fn cmd(&self) -> &Cmd {
        &self.cmd
    }

    fn cmd_mut(&mut self) -> &mut Cmd {
        &mut self.cmd
    }

    fn name(&self) -> &'static str {
        "CreateIoSq"
    }
}

// ============================================================================
// Delete I/O Queues
// ============================================================================

/// Delete I/O Completion Queue コマンド
#[derive(Debug, Clone)]
pub struct DeleteIoCq {
    cmd: Cmd,
}

impl DeleteIoCq {
    /// オペコード
    pub const OPCODE: u8 = AdminOpcode::DeleteIOCQ as u8;

    pub fn new() -> Self {
        Self {
            cmd: Cmd::new(Self::OPCODE, DataDir::None, PrpBitmask::empty()),
        }
    }

    /// Queue Identifier
    pub fn set_qid(&mut self, qid: u16) -> Result<()> {
        self.cmd.set_word(qid, DW10, 0)
    }
}

impl Default for DeleteIoCq {
    fn default() -> Self {
        Self::new()
    }
}

impl NvmeCmd for DeleteIoCq {
    fn cmd(&self) -> &Cmd {
        &self.cmd
    }

    fn cmd_mut(&mut self) -> &mut Cmd {
        &mut self.cmd
    }

    fn name(&self) -> &'static str {
        "DeleteIoCq"
    }
}

/// Delete I/O Submission Queue コマンド
#[derive(Debug, Clone)]
pub struct DeleteIoSq {
    cmd: Cmd,
}

impl DeleteIoSq {
    /// オペコード
    pub const OPCODE: u8 = AdminOpcode::DeleteIOSQ as u8;

    pub fn new() -> Self {
        Self {
            cmd: Cmd::new(Self::OPCODE, DataDir::None, PrpBitmask::empty()),
        }
    }

    /// Queue Identifier
    pub fn set_qid(&mut self, qid: u16) -> Result<()> {
        self.cmd.set_word(qid, DW10, 0)
    }
}

impl Default for DeleteIoSq {
    fn default() -> Self {
        Self::new()
    }
}

impl NvmeCmd for DeleteIoSq {
    fn cmd(&self) -> &Cmd {
        &self.cmd
    }

    fn cmd_mut(&mut self) -> &mut Cmd {
        &mut self.cmd
    }

    fn name(&self) -> &'static str {
        "DeleteIoSq"
    }
}
