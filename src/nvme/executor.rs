// ============================================================================
// src/nvme/executor.rs - Command Executor
// ============================================================================
//!
//! 投入 → 通知 → 待機 → 回収 の1サイクルを期限付きで実行する
//!
//! リトライは一切行わない。期限切れのコマンドは未完了のまま残り、
//! コントローラのリセット（Active -> Created）で破棄される。

use core::time::Duration;
use log::{debug, error};

use crate::error::{ConformanceError, Result};
use crate::nvme::command::NvmeCmd;
use crate::nvme::completion::CompletionEntry;
use crate::nvme::queue::{QueuePair, Reaped};
use crate::time::{Deadline, duration_to_nanos};

/// コマンドを1つ実行し、対応する完了エントリをそのまま返す
///
/// 完了ステータスは検査しない。
pub fn execute<C: NvmeCmd + ?Sized>(
    qp: &mut QueuePair,
    cmd: &C,
    timeout: Duration,
) -> Result<CompletionEntry> {
    let token = qp.submit(cmd)?;
    qp.notify()?;

    let deadline = Deadline::after(&**qp.clock(), timeout);
    match qp.poll_completion(token.cid, deadline)? {
        Reaped::Completed(ce) => Ok(ce),
        Reaped::TimedOut { waited } => Err(ConformanceError::CommandTimeout {
            qid: token.qid,
            cid: token.cid,
            waited,
            timeout: duration_to_nanos(timeout),
        }),
    }
}

/// コマンドを実行し、完了エントリを事後検証する
///
/// - 完了エントリのSQ IdentifierはこのキューのIDと一致すること
/// - `verify_status` が真なら、ステータスが成功であること
pub fn send_and_reap<C: NvmeCmd + ?Sized>(
    qp: &mut QueuePair,
    cmd: &C,
    timeout: Duration,
    verify_status: bool,
) -> Result<CompletionEntry> {
    let ce = execute(qp, cmd, timeout)?;

    if ce.sq_id() != qp.qid() {
        error!(
            "Queue {}: {} CID {:#06x} completed with SQID {}",
            qp.qid(),
            cmd.name(),
            ce.command_identifier(),
            ce.sq_id()
        );
        return Err(ConformanceError::CompletionMismatch {
            cid: ce.command_identifier(),
            field: "sq_id",
            expected: qp.qid() as u32,
            actual: ce.sq_id() as u32,
        });
    }

    if verify_status && !ce.is_success() {
        error!(
            "Queue {}: {} CID {:#06x} failed: {:?}",
            qp.qid(),
            cmd.name(),
            ce.command_identifier(),
            ce.status()
        );
        return Err(ConformanceError::StatusError {
            qid: qp.qid(),
            cid: ce.command_identifier(),
            status: ce.status(),
        });
    }

    debug!(
        "Queue {}: {} CID {:#06x} done, DW0={:#010x}",
        qp.qid(),
        cmd.name(),
        ce.command_identifier(),
        ce.result_field(0)?
    );
    Ok(ce)
}
