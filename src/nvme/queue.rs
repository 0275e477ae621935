// ============================================================================
// src/nvme/queue.rs - NVMe Queue Pair
// ============================================================================
//!
//! SQ/CQペアとその状態機械
//!
//! キューペアは1つの協調的な呼び出し元から `&mut self` で操作される。
//! デバイス側にはドアベルとリングメモリを通してのみ触れる。
//!
//! ## 不変条件
//! - 未完了コマンド（投入済みで呼び出し元にまだ返していないもの）は
//!   常に `depth` 以下
//! - 完了エントリはCIDのみで対応付け、位置では対応付けない
//! - 各リングは `depth + 1` スロット以上（満杯と空を区別するため1つ空ける）
//!
//! ## 状態遷移
//! ```text
//! Uninitialized -> Created -> Active -> Destroyed
//!                     |  ^       |
//!                     |  +-------+  (コントローラ無効化: 位置と未完了をリセット)
//!                     +-> Destroyed
//! ```

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use hashbrown::{HashMap, HashSet};
use log::{debug, info, warn};

use crate::error::{ConformanceError, Result};
use crate::nvme::command::NvmeCmd;
use crate::nvme::completion::CompletionEntry;
use crate::nvme::defs::{
    ADMIN_QUEUE_DEPTH, CMD_DWORDS, CQE_SIZE, MAX_QUEUE_DEPTH, PAGE_SIZE, SQE_SIZE, cmd_layout,
};
use crate::nvme::driver::{Doorbell, DriverChannel, WaitOutcome};
use crate::nvme::field::FieldPacked;
use crate::nvme::prp::{PrpList, RoRegion, plan_prp};
use crate::nvme::ring::{RingCursor, RingMemory};
use crate::time::{Clock, Deadline, Nanoseconds};

// ============================================================================
// Queue State / Config
// ============================================================================

/// キューのライフサイクル
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueState {
    /// 未作成
    Uninitialized,
    /// デバイス上に作成済み（コントローラ無効）
    Created,
    /// 使用可能
    Active,
    /// 削除済み
    Destroyed,
}

/// キュー構成
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    /// キューID（0 = Admin）
    pub qid: u16,
    /// 最大未完了コマンド数
    pub depth: u16,
}

impl QueueConfig {
    pub const fn new(qid: u16, depth: u16) -> Self {
        Self { qid, depth }
    }

    /// Admin Queue の既定構成
    pub const fn admin() -> Self {
        Self::new(0, ADMIN_QUEUE_DEPTH)
    }

    /// 必要なリングのスロット数
    pub const fn ring_entries(&self) -> u32 {
        self.depth as u32 + 1
    }
}

// ============================================================================
// Submit / Poll results
// ============================================================================

/// 投入されたコマンドの位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotToken {
    pub qid: u16,
    pub slot: u16,
    pub cid: u16,
}

/// `poll_completion` の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reaped {
    /// 対応する完了エントリ
    Completed(CompletionEntry),
    /// 期限切れ（コマンドは未完了のまま残る）
    TimedOut { waited: Nanoseconds },
}

/// キューの統計情報
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueMetrics {
    pub qid: u16,
    pub depth: u16,
    pub state: QueueState,
    /// SQ Tail
    pub sq_tail: u16,
    /// CQ Head
    pub cq_head: u16,
    /// CQ Headで期待するフェーズ
    pub expected_phase: bool,
    /// 未完了コマンド数
    pub outstanding: usize,
    /// 回収済みで呼び出し元に未返却の完了エントリ数
    pub unclaimed: usize,
    /// 未完了コマンドに対応しない完了エントリ数
    pub stray_completions: u64,
    /// 同一CIDの重複完了エントリ数
    pub duplicate_completions: u64,
}

// ============================================================================
// Queue Pair
// ============================================================================

/// SQ/CQペア
pub struct QueuePair {
    config: QueueConfig,
    state: QueueState,
    sq: Arc<dyn RingMemory>,
    cq: Arc<dyn RingMemory>,
    driver: Arc<dyn DriverChannel>,
    clock: Arc<dyn Clock>,
    sq_tail: RingCursor,
    cq_head: RingCursor,
    /// 未完了CID
    outstanding: HashSet<u16>,
    /// 回収済み・未返却の完了エントリ
    reaped: HashMap<u16, CompletionEntry>,
    /// SQスロットごとのPRPリスト（スロット再利用まで保持）
    prp_lists: Vec<Option<Box<PrpList>>>,
    stray_completions: u64,
    duplicate_completions: u64,
}

impl QueuePair {
    /// 構成を検証してキューペアを作成（状態は `Uninitialized`）
    pub fn new(
        config: QueueConfig,
        sq: Arc<dyn RingMemory>,
        cq: Arc<dyn RingMemory>,
        driver: Arc<dyn DriverChannel>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        if config.depth == 0 {
            return Err(ConformanceError::InvalidQueueConfig("depth must be non-zero"));
        }
        if config.depth > MAX_QUEUE_DEPTH {
            return Err(ConformanceError::InvalidQueueConfig("depth exceeds MAX_QUEUE_DEPTH"));
        }
        if (sq.entries() as u32) < config.ring_entries() {
            return Err(ConformanceError::InvalidQueueConfig(
                "submission ring needs depth + 1 slots",
            ));
        }
        if (cq.entries() as u32) < config.ring_entries() {
            return Err(ConformanceError::InvalidQueueConfig(
                "completion ring needs depth + 1 slots",
            ));
        }
        if sq.entry_size() != SQE_SIZE {
            return Err(ConformanceError::InvalidQueueConfig("SQ entries must be 64 bytes"));
        }
        if cq.entry_size() != CQE_SIZE {
            return Err(ConformanceError::InvalidQueueConfig("CQ entries must be 16 bytes"));
        }

        let mut prp_lists = Vec::with_capacity(sq.entries() as usize);
        prp_lists.resize_with(sq.entries() as usize, || None);

        Ok(Self {
            sq_tail: RingCursor::new(sq.entries()),
            cq_head: RingCursor::new(cq.entries()),
            config,
            state: QueueState::Uninitialized,
            sq,
            cq,
            driver,
            clock,
            outstanding: HashSet::new(),
            reaped: HashMap::new(),
            prp_lists,
            stray_completions: 0,
            duplicate_completions: 0,
        })
    }

    // ========================================
    // Accessors
    // ========================================

    pub fn qid(&self) -> u16 {
        self.config.qid
    }

    pub fn depth(&self) -> u16 {
        self.config.depth
    }

    pub fn config(&self) -> QueueConfig {
        self.config
    }

    pub fn state(&self) -> QueueState {
        self.state
    }

    /// 時刻源
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// 未完了コマンド数
    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }

    /// `cid` が未完了か
    pub fn is_outstanding(&self, cid: u16) -> bool {
        self.outstanding.contains(&cid)
    }

    /// SQメモリの読み取り専用ビュー（Create I/O SQ用）
    ///
    /// ビューはリングを保持するため、キューペアより長く生きてよい。
    pub fn sq_memory(&self) -> RoRegion {
        RoRegion::from_ring(self.sq.clone())
    }

    /// CQメモリの読み取り専用ビュー（Create I/O CQ用）
    pub fn cq_memory(&self) -> RoRegion {
        RoRegion::from_ring(self.cq.clone())
    }

    /// 統計情報
    pub fn metrics(&self) -> QueueMetrics {
        QueueMetrics {
            qid: self.config.qid,
            depth: self.config.depth,
            state: self.state,
            sq_tail: self.sq_tail.slot(),
            cq_head: self.cq_head.slot(),
            expected_phase: self.cq_head.expected_phase(),
            outstanding: self.outstanding.len(),
            unclaimed: self.reaped.len(),
            stray_completions: self.stray_completions,
            duplicate_completions: self.duplicate_completions,
        }
    }

    /// CQスロットの生の内容（デバッグ用, フェーズは検査しない）
    pub fn peek_ce(&self, slot: u16) -> Option<CompletionEntry> {
        if slot >= self.cq.entries() {
            return None;
        }
        let mut raw = [0u8; CQE_SIZE];
        self.cq.read_entry(slot, &mut raw);
        Some(CompletionEntry::from_le_bytes(&raw))
    }

    // ========================================
    // Lifecycle
    // ========================================

    /// 状態遷移
    ///
    /// Active -> Created はコントローラ無効化を表し、リング位置と
    /// 未完了コマンドを破棄してリングメモリをゼロクリアする。
    pub fn transition(&mut self, to: QueueState) -> Result<()> {
        use QueueState::*;
        let from = self.state;
        let allowed = matches!(
            (from, to),
            (Uninitialized, Created)
                | (Created, Active)
                | (Active, Destroyed)
                | (Created, Destroyed)
                | (Active, Created)
        );
        if !allowed {
            return Err(ConformanceError::InvalidStateTransition {
                qid: self.config.qid,
                from,
                to,
            });
        }
        if (from, to) == (Active, Created) {
            self.reset();
        }
        info!("Queue {}: {:?} -> {:?}", self.config.qid, from, to);
        self.state = to;
        Ok(())
    }

    fn reset(&mut self) {
        if !self.outstanding.is_empty() {
            warn!(
                "Queue {}: abandoning {} outstanding commands",
                self.config.qid,
                self.outstanding.len()
            );
        }
        self.outstanding.clear();
        self.reaped.clear();
        self.sq_tail.reset();
        self.cq_head.reset();

        let zero_sq = [0u8; SQE_SIZE];
        for slot in 0..self.sq.entries() {
            self.sq.write_entry(slot, &zero_sq);
        }
        let zero_cq = [0u8; CQE_SIZE];
        for slot in 0..self.cq.entries() {
            self.cq.write_entry(slot, &zero_cq);
        }
    }

    fn ensure_active(&self) -> Result<()> {
        if self.state != QueueState::Active {
            return Err(ConformanceError::QueueNotActive {
                qid: self.config.qid,
                state: self.state,
            });
        }
        Ok(())
    }

    // ========================================
    // Submission
    // ========================================

    /// コマンドをSQのtailスロットへ書き込む
    ///
    /// デバイスからは `notify` まで見えない。
    pub fn submit<C: NvmeCmd + ?Sized>(&mut self, cmd: &C) -> Result<SlotToken> {
        self.ensure_active()?;
        if self.outstanding.len() >= self.config.depth as usize {
            return Err(ConformanceError::QueueFull {
                qid: self.config.qid,
                depth: self.config.depth,
            });
        }
        let cid = cmd.cid();
        if self.outstanding.contains(&cid) {
            return Err(ConformanceError::DuplicateCommandId {
                qid: self.config.qid,
                cid,
            });
        }

        let slot = self.sq_tail.slot();
        let fields = self.serialize_prp(cmd, slot)?;
        let mut raw = [0u8; SQE_SIZE];
        fields.write_le_bytes(&mut raw);
        self.sq.write_entry(slot, &raw);

        self.outstanding.insert(cid);
        self.sq_tail.advance();
        debug!(
            "Queue {}: submitted {} (opcode {:#04x}, CID {:#06x}) at slot {}",
            self.config.qid,
            cmd.name(),
            cmd.opcode(),
            cid,
            slot
        );
        Ok(SlotToken {
            qid: self.config.qid,
            slot,
            cid,
        })
    }

    /// ワイヤ構造体を複製し、PRPビットマスクが空でなければDW6..9を埋める
    fn serialize_prp<C: NvmeCmd + ?Sized>(
        &mut self,
        cmd: &C,
        slot: u16,
    ) -> Result<FieldPacked<CMD_DWORDS>> {
        let mut fields = *cmd.cmd().fields();
        let prp = cmd.cmd().prp();
        let mask = prp.prp_bitmask();
        let Some(host_addr) = prp.host_addr().filter(|_| !mask.is_empty()) else {
            return Ok(fields);
        };

        let base = self.driver.bus_address(host_addr);
        let plan = plan_prp(mask, base, prp.buffer_size(), PAGE_SIZE)?;
        let mut list_bus = 0;
        if let Some((_, entries)) = &plan.list {
            let list = self.prp_lists[slot as usize].get_or_insert_with(|| Box::new(PrpList::new()));
            if !list.load(entries) {
                return Err(ConformanceError::UndescribedBuffer {
                    len: prp.buffer_size(),
                    mask,
                });
            }
            list_bus = self.driver.bus_address(list.host_addr());
        }
        let (prp1, prp2) = plan.resolve(list_bus);
        fields.set_qword(prp1, cmd_layout::DW_PRP1)?;
        fields.set_qword(prp2, cmd_layout::DW_PRP2)?;

        #[cfg(feature = "verbose_logging")]
        log::trace!(
            "CID {:#06x}: PRP1={:#x} PRP2={:#x} list={:?}",
            cmd.cid(),
            prp1,
            prp2,
            plan.list.as_ref().map(|(field, e)| (*field, e.len()))
        );
        Ok(fields)
    }

    /// SQ Tail Doorbell を鳴らす
    pub fn notify(&mut self) -> Result<()> {
        self.ensure_active()?;
        let tail = self.sq_tail.slot();
        self.driver
            .ring_doorbell(Doorbell::SubmissionTail(self.config.qid), tail)?;
        debug!("Queue {}: SQ tail doorbell <- {}", self.config.qid, tail);
        Ok(())
    }

    // ========================================
    // Completion
    // ========================================

    /// `cid` の完了エントリを期限まで待つ
    ///
    /// 途中で見つかった他のCIDの完了エントリは回収表に保持され、
    /// 後の `poll_completion` で返される。
    pub fn poll_completion(&mut self, cid: u16, deadline: Deadline) -> Result<Reaped> {
        self.ensure_active()?;
        loop {
            self.drain()?;
            if let Some(ce) = self.reaped.remove(&cid) {
                self.outstanding.remove(&cid);
                debug!("Queue {}: reaped CID {:#06x}", self.config.qid, cid);
                return Ok(Reaped::Completed(ce));
            }

            let now = self.clock.uptime_nanos();
            if deadline.is_expired(now) {
                let waited = deadline.elapsed(now);
                warn!(
                    "Queue {}: CID {:#06x} not completed after {} ns",
                    self.config.qid, cid, waited
                );
                return Ok(Reaped::TimedOut { waited });
            }
            // 待機が打ち切られた場合も時計を進めないと期限に届かない
            match self
                .driver
                .wait_for_completion(self.config.qid, deadline.remaining(now))
            {
                WaitOutcome::Unsupported | WaitOutcome::TimedOut => self.clock.relax(),
                WaitOutcome::Notified => {}
            }
        }
    }

    /// フェーズが有効な完了エントリをすべて回収表へ移す
    ///
    /// 1回の呼び出しで最大1周分。回収があればCQ Head Doorbellを1回鳴らす。
    fn drain(&mut self) -> Result<()> {
        let mut drained = 0u32;
        for _ in 0..self.cq.entries() {
            let mut raw = [0u8; CQE_SIZE];
            self.cq.read_entry(self.cq_head.slot(), &mut raw);
            let ce = CompletionEntry::from_le_bytes(&raw);
            if ce.phase() != self.cq_head.expected_phase() {
                break;
            }
            self.cq_head.advance();
            drained += 1;

            let cid = ce.command_identifier();
            if !self.outstanding.contains(&cid) {
                self.stray_completions += 1;
                warn!(
                    "Queue {}: stray completion for CID {:#06x}",
                    self.config.qid, cid
                );
                continue;
            }
            if self.reaped.contains_key(&cid) {
                self.duplicate_completions += 1;
                warn!(
                    "Queue {}: duplicate completion for CID {:#06x}",
                    self.config.qid, cid
                );
                continue;
            }
            self.reaped.insert(cid, ce);
        }

        if drained > 0 {
            let head = self.cq_head.slot();
            self.driver
                .ring_doorbell(Doorbell::CompletionHead(self.config.qid), head)?;
            debug!(
                "Queue {}: drained {} entries, CQ head doorbell <- {}",
                self.config.qid, drained, head
            );
        }
        Ok(())
    }
}
