// ============================================================================
// src/nvme/defs.rs - NVMe Common Definitions
// ============================================================================
//!
//! NVMe共通定数定義
//!
//! NVMe Base Specification 1.0b（適合試験の対象リビジョン）に基づく
//! ワイヤ定数・オペコード・Feature ID・ステータスコード。

// ============================================================================
// NVMe Constants
// ============================================================================

/// Submission Queueエントリサイズ（64バイト）
pub const SQE_SIZE: usize = 64;

/// Completion Queueエントリサイズ（16バイト）
pub const CQE_SIZE: usize = 16;

/// コマンド構造体のDWORD数
pub const CMD_DWORDS: usize = SQE_SIZE / 4;

/// 完了エントリのDWORD数
pub const CQE_DWORDS: usize = CQE_SIZE / 4;

/// ページサイズ（4KB, CC.MPS = 0）
pub const PAGE_SIZE: usize = 4096;

/// 1ページに収まるPRPエントリ数
pub const PRP_ENTRIES_PER_PAGE: usize = PAGE_SIZE / 8;

/// 最大キュー深度（リングは depth + 1 スロットを u16 で数える）
pub const MAX_QUEUE_DEPTH: u16 = 65534;

/// Admin Queueデフォルト深度
pub const ADMIN_QUEUE_DEPTH: u16 = 32;

/// 既定のポーリング間隔（マイクロ秒, StdClock用）
pub const DEFAULT_POLL_INTERVAL_US: u64 = 50;

/// 予約済みCID（エラーログで「該当なし」を表す）
pub const RESERVED_CID: u16 = 0xFFFF;

// ============================================================================
// Command Dword Layout
// ============================================================================

/// コマンド構造体内のフィールド位置
pub mod cmd_layout {
    /// DW0: opcode[7:0], fused[9:8], psdt[15:14], cid[31:16]
    pub const DW_CDW0: usize = 0;
    /// Namespace ID
    pub const DW_NSID: usize = 1;
    /// PRP Entry 1 (DW6-7)
    pub const DW_PRP1: usize = 6;
    /// PRP Entry 2 (DW8-9)
    pub const DW_PRP2: usize = 8;
    /// Command Dword 10
    pub const DW_CDW10: usize = 10;
    /// Command Dword 11
    pub const DW_CDW11: usize = 11;
}

/// 完了エントリ内のフィールド位置
pub mod cqe_layout {
    /// Command Specific (DW0)
    pub const DW_RESULT0: usize = 0;
    /// Command Specific (DW1)
    pub const DW_RESULT1: usize = 1;
    /// SQ Head (15:0) | SQ Identifier (31:16)
    pub const DW_SQ: usize = 2;
    /// CID (15:0) | Phase (16) | Status (31:17)
    pub const DW_STATUS: usize = 3;
    /// Phaseビット位置
    pub const PHASE_BIT: u32 = 16;
    /// Statusフィールド開始ビット
    pub const STATUS_SHIFT: u32 = 17;
}

// ============================================================================
// NVMe Admin Opcodes
// ============================================================================

/// NVMe Admin Command Opcodes
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AdminOpcode {
    DeleteIOSQ = 0x00,
    CreateIOSQ = 0x01,
    GetLogPage = 0x02,
    DeleteIOCQ = 0x04,
    CreateIOCQ = 0x05,
    Identify = 0x06,
    Abort = 0x08,
    SetFeatures = 0x09,
    GetFeatures = 0x0A,
    AsyncEventRequest = 0x0C,
    FirmwareCommit = 0x10,
    FirmwareImageDownload = 0x11,
}

impl AdminOpcode {
    /// 生のオペコードから変換
    pub fn from_raw(opcode: u8) -> Option<Self> {
        Some(match opcode {
            0x00 => AdminOpcode::DeleteIOSQ,
            0x01 => AdminOpcode::CreateIOSQ,
            0x02 => AdminOpcode::GetLogPage,
            0x04 => AdminOpcode::DeleteIOCQ,
            0x05 => AdminOpcode::CreateIOCQ,
            0x06 => AdminOpcode::Identify,
            0x08 => AdminOpcode::Abort,
            0x09 => AdminOpcode::SetFeatures,
            0x0A => AdminOpcode::GetFeatures,
            0x0C => AdminOpcode::AsyncEventRequest,
            0x10 => AdminOpcode::FirmwareCommit,
            0x11 => AdminOpcode::FirmwareImageDownload,
            _ => return None,
        })
    }
}

// ============================================================================
// Feature IDs
// ============================================================================

/// NVMe Feature IDs
pub mod feature_ids {
    pub const ARBITRATION: u8 = 0x01;
    pub const POWER_MGMT: u8 = 0x02;
    pub const TEMP_THRESHOLD: u8 = 0x04;
    pub const ERROR_RECOVERY: u8 = 0x05;
    pub const VOLATILE_WC: u8 = 0x06;
    pub const NUM_QUEUES: u8 = 0x07;
    pub const IRQ_COALESCING: u8 = 0x08;
    pub const IRQ_CONFIG: u8 = 0x09;
    pub const WRITE_ATOMICITY: u8 = 0x0A;
    pub const ASYNC_EVENT_CONFIG: u8 = 0x0B;
}

// ============================================================================
// NVMe Status Codes
// ============================================================================

/// Status Code Type
pub mod status_type {
    /// Generic Command Status
    pub const GENERIC: u8 = 0x0;
    /// Command Specific Status
    pub const COMMAND_SPECIFIC: u8 = 0x1;
}

/// NVMe Generic Status Codes (SCT = 0)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NvmeStatus {
    /// 成功
    Success = 0x00,
    /// 無効なコマンドオペコード
    InvalidCommandOpcode = 0x01,
    /// コマンドフィールドが無効
    InvalidFieldInCommand = 0x02,
    /// コマンドID競合
    CommandIdConflict = 0x03,
    /// データ転送エラー
    DataTransferError = 0x04,
    /// 電源喪失によるコマンド中止
    CommandsAbortedPowerLoss = 0x05,
    /// 内部エラー
    InternalError = 0x06,
    /// コマンド中止要求
    CommandAbortRequested = 0x07,
    /// SQ削除によるコマンド中止
    CommandAbortedSqDeletion = 0x08,
    /// Fused操作失敗
    CommandAbortedFailedFuse = 0x09,
    /// Fused操作欠落
    CommandAbortedMissingFuse = 0x0A,
    /// 無効なネームスペースまたはフォーマット
    InvalidNamespaceOrFormat = 0x0B,
    /// コマンドシーケンスエラー
    CommandSequenceError = 0x0C,
    /// Generic以外、または未定義のコード
    Unknown = 0xFF,
}

impl NvmeStatus {
    /// SCT/SCの組から変換
    pub fn from_parts(sct: u8, sc: u8) -> Self {
        if sct != status_type::GENERIC {
            return NvmeStatus::Unknown;
        }
        match sc {
            0x00 => NvmeStatus::Success,
            0x01 => NvmeStatus::InvalidCommandOpcode,
            0x02 => NvmeStatus::InvalidFieldInCommand,
            0x03 => NvmeStatus::CommandIdConflict,
            0x04 => NvmeStatus::DataTransferError,
            0x05 => NvmeStatus::CommandsAbortedPowerLoss,
            0x06 => NvmeStatus::InternalError,
            0x07 => NvmeStatus::CommandAbortRequested,
            0x08 => NvmeStatus::CommandAbortedSqDeletion,
            0x09 => NvmeStatus::CommandAbortedFailedFuse,
            0x0A => NvmeStatus::CommandAbortedMissingFuse,
            0x0B => NvmeStatus::InvalidNamespaceOrFormat,
            0x0C => NvmeStatus::CommandSequenceError,
            _ => NvmeStatus::Unknown,
        }
    }

    /// 成功かどうか
    pub fn is_success(&self) -> bool {
        matches!(self, NvmeStatus::Success)
    }
}
