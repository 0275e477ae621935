// ============================================================================
// src/nvme/driver.rs - Privileged Driver Channel
// ============================================================================
//!
//! 特権ドライバとの境界
//!
//! キューペアはドアベル書き込み・完了待機・バスアドレス変換を
//! すべて `DriverChannel` 越しに行う。実機ではカーネルドライバへの
//! ioctl、テストでは `LoopbackDevice` が実装する。

use core::fmt;
use core::time::Duration;

/// ドアベルの種類（値はキューID）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Doorbell {
    /// SQ Tail Doorbell
    SubmissionTail(u16),
    /// CQ Head Doorbell
    CompletionHead(u16),
}

impl Doorbell {
    /// 対象のキューID
    pub fn qid(&self) -> u16 {
        match self {
            Doorbell::SubmissionTail(qid) | Doorbell::CompletionHead(qid) => *qid,
        }
    }
}

/// 完了待機の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// 新しい完了エントリが届いた可能性がある
    Notified,
    /// 待機時間を使い切った
    TimedOut,
    /// ドライバが待機をサポートしない（呼び出し側でポーリングする）
    Unsupported,
}

/// ドライバエラー
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverError {
    /// ドアベル書き込みが拒否された
    DoorbellRejected,
    /// ドライバがキューを知らない
    UnknownQueue(u16),
    /// ドアベル値がキューの範囲外
    DoorbellOutOfRange { qid: u16, value: u16 },
    /// デバイスが応答しない
    DeviceUnavailable,
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverError::DoorbellRejected => write!(f, "doorbell write rejected"),
            DriverError::UnknownQueue(qid) => write!(f, "unknown queue {}", qid),
            DriverError::DoorbellOutOfRange { qid, value } => {
                write!(f, "doorbell value {} out of range for queue {}", value, qid)
            }
            DriverError::DeviceUnavailable => write!(f, "device unavailable"),
        }
    }
}

/// 特権ドライバへのチャネル
pub trait DriverChannel: Send + Sync {
    /// ドアベルに `value`（新しいtail/head）を書き込む
    fn ring_doorbell(&self, doorbell: Doorbell, value: u16) -> Result<(), DriverError>;

    /// `qid` のCQに新しいエントリが届くまで最大 `budget` 待つ
    fn wait_for_completion(&self, qid: u16, budget: Duration) -> WaitOutcome;

    /// ホスト仮想アドレスをデバイスから見たバスアドレスに変換
    fn bus_address(&self, host_addr: usize) -> u64 {
        host_addr as u64
    }
}
