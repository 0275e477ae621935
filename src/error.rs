//! 統一エラーハンドリングモジュール
//!
//! ハーネス全体で使用される統一エラー型を定義し、
//! 各サブシステムのエラーから変換を提供します。
//!
//! ここで定義されるエラーはすべて「テストステップにとって致命的」であり、
//! このクレート内部でリトライや回復は行いません。リトライ方針は
//! 呼び出し側のテストロジックが決定します。

use core::fmt;

use crate::nvme::completion::StatusField;
use crate::nvme::driver::DriverError;
use crate::nvme::prp::PrpBitmask;
use crate::nvme::queue::QueueState;
use crate::time::Nanoseconds;

/// ハーネス全体の統一Result型
pub type Result<T> = core::result::Result<T, ConformanceError>;

/// ハーネス全体の統一エラー型
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConformanceError {
    /// コマンド構造体の範囲外アクセス（常に呼び出し側のバグ）
    ProtocolLayout(LayoutViolation),
    /// コマンドが許可していないPRP配置を要求した
    IllegalLayout {
        requested: PrpBitmask,
        allowed: PrpBitmask,
    },
    /// 選択したPRP配置ではバッファ全体を記述できない
    UndescribedBuffer { len: usize, mask: PrpBitmask },
    /// 未完了コマンド数がキュー深度に達している
    QueueFull { qid: u16, depth: u16 },
    /// Active以外の状態でキュー操作を行った
    QueueNotActive { qid: u16, state: QueueState },
    /// 許可されていないキュー状態遷移
    InvalidStateTransition {
        qid: u16,
        from: QueueState,
        to: QueueState,
    },
    /// キュー構成が不正
    InvalidQueueConfig(&'static str),
    /// データバッファの構成が不正
    InvalidBuffer(&'static str),
    /// 同一CIDのコマンドが既に未完了
    DuplicateCommandId { qid: u16, cid: u16 },
    /// 期限内に対応する完了エントリが得られなかった
    CommandTimeout {
        qid: u16,
        cid: u16,
        waited: Nanoseconds,
        timeout: Nanoseconds,
    },
    /// 完了ステータスが成功ではない（検証要求時のみ）
    StatusError {
        qid: u16,
        cid: u16,
        status: StatusField,
    },
    /// 完了エントリの事後検証に失敗
    CompletionMismatch {
        cid: u16,
        field: &'static str,
        expected: u32,
        actual: u32,
    },
    /// ドライバ呼び出しの失敗
    Driver(DriverError),
}

/// フィールドアクセス違反の詳細
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutViolation {
    /// 要素（DWORD）インデックス
    pub dword: usize,
    /// 要素内バイトオフセット
    pub byte_offset: usize,
    /// アクセス幅（バイト）
    pub width: usize,
    /// 構造体の要素数
    pub len: usize,
}

// ===== Display implementations =====

impl fmt::Display for ConformanceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConformanceError::ProtocolLayout(v) => write!(f, "protocol layout error: {}", v),
            ConformanceError::IllegalLayout { requested, allowed } => write!(
                f,
                "illegal PRP layout: requested {:#06x}, allowed {:#06x}",
                requested.bits(),
                allowed.bits()
            ),
            ConformanceError::UndescribedBuffer { len, mask } => write!(
                f,
                "PRP layout {:#06x} cannot describe a {} byte buffer",
                mask.bits(),
                len
            ),
            ConformanceError::QueueFull { qid, depth } => {
                write!(f, "queue {} full: {} commands outstanding", qid, depth)
            }
            ConformanceError::QueueNotActive { qid, state } => {
                write!(f, "queue {} not active (state {:?})", qid, state)
            }
            ConformanceError::InvalidStateTransition { qid, from, to } => {
                write!(f, "queue {}: invalid transition {:?} -> {:?}", qid, from, to)
            }
            ConformanceError::InvalidQueueConfig(reason) => {
                write!(f, "invalid queue config: {}", reason)
            }
            ConformanceError::InvalidBuffer(reason) => write!(f, "invalid buffer: {}", reason),
            ConformanceError::DuplicateCommandId { qid, cid } => {
                write!(f, "queue {}: CID {:#06x} already outstanding", qid, cid)
            }
            ConformanceError::CommandTimeout {
                qid,
                cid,
                waited,
                timeout,
            } => write!(
                f,
                "queue {}: CID {:#06x} timed out after {} ns (bound {} ns)",
                qid, cid, waited, timeout
            ),
            ConformanceError::StatusError { qid, cid, status } => write!(
                f,
                "queue {}: CID {:#06x} failed: SCT={:#x}, SC={:#04x}",
                qid,
                cid,
                status.sct(),
                status.sc()
            ),
            ConformanceError::CompletionMismatch {
                cid,
                field,
                expected,
                actual,
            } => write!(
                f,
                "CID {:#06x}: completion field {} mismatch (expected {:#x}, got {:#x})",
                cid, field, expected, actual
            ),
            ConformanceError::Driver(e) => write!(f, "driver error: {}", e),
        }
    }
}

impl fmt::Display for LayoutViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} byte access at DW{} offset {} outside {} dword structure",
            self.width, self.dword, self.byte_offset, self.len
        )
    }
}

impl core::error::Error for ConformanceError {}

// ===== From implementations for sub-errors =====

impl From<LayoutViolation> for ConformanceError {
    fn from(v: LayoutViolation) -> Self {
        ConformanceError::ProtocolLayout(v)
    }
}

impl From<DriverError> for ConformanceError {
    fn from(e: DriverError) -> Self {
        ConformanceError::Driver(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn test_layout_violation_display() {
        let err: ConformanceError = LayoutViolation {
            dword: 16,
            byte_offset: 0,
            width: 4,
            len: 16,
        }
        .into();
        assert_eq!(
            err.to_string(),
            "protocol layout error: 4 byte access at DW16 offset 0 outside 16 dword structure"
        );
    }

    #[test]
    fn test_driver_error_conversion() {
        let err: ConformanceError = DriverError::DoorbellRejected.into();
        assert_eq!(err, ConformanceError::Driver(DriverError::DoorbellRejected));
    }
}
