// ============================================================================
// src/nvme/loopback.rs - In-Process Controller Model
// ============================================================================
//!
//! ループバックデバイス
//!
//! `DriverChannel` をプロセス内で実装する簡易コントローラ。
//! SQ Tail Doorbellでエントリを取り込み、Adminコマンドを解釈して
//! 完了エントリをCQへ書き込む。ハードウェアなしで投入から回収までの
//! サイクル全体を検証するために使う。
//!
//! ## 完了モード
//! - `Immediate`: 取り込んだ直後に完了
//! - `Delayed(ns)`: 取り込みから指定時間後、次の待機呼び出しで完了
//! - `Manual`: `complete` が呼ばれるまで完了しない（任意の順序で完了できる）
//!
//! CQ Head Doorbellで解放されていないCQスロットは上書きしない。
//! データ転送（Identifyデータ等）は行わない。

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::time::Duration;
use hashbrown::HashMap;
use log::trace;
use spin::Mutex;

use crate::error::Result;
use crate::nvme::cmds::FeatureSelect;
use crate::nvme::cmds::identify::cns;
use crate::nvme::completion::{CompletionEntry, StatusField};
use crate::nvme::defs::{
    AdminOpcode, CMD_DWORDS, CQE_SIZE, NvmeStatus, SQE_SIZE, cmd_layout, feature_ids, status_type,
};
use crate::nvme::driver::{Doorbell, DriverChannel, DriverError, WaitOutcome};
use crate::nvme::field::FieldPacked;
use crate::nvme::queue::{QueueConfig, QueuePair};
use crate::nvme::ring::{HeapRing, RingCursor, RingMemory};
use crate::time::{Clock, Nanoseconds, duration_to_nanos};

/// 完了モード
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionMode {
    Immediate,
    Delayed(Nanoseconds),
    Manual,
}

/// デバイスが取り込んだコマンド
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchedCommand {
    pub qid: u16,
    pub slot: u16,
    pub fields: FieldPacked<CMD_DWORDS>,
}

impl FetchedCommand {
    pub fn opcode(&self) -> u8 {
        self.fields.dwords()[cmd_layout::DW_CDW0] as u8
    }

    pub fn cid(&self) -> u16 {
        (self.fields.dwords()[cmd_layout::DW_CDW0] >> 16) as u16
    }

    pub fn prp1(&self) -> u64 {
        self.qword(cmd_layout::DW_PRP1)
    }

    pub fn prp2(&self) -> u64 {
        self.qword(cmd_layout::DW_PRP2)
    }

    fn qword(&self, dw: usize) -> u64 {
        let d = self.fields.dwords();
        (d[dw] as u64) | ((d[dw + 1] as u64) << 32)
    }
}

// ============================================================================
// Internal state
// ============================================================================

/// Feature値（現在値 / 既定値 / 保存値）
#[derive(Debug, Clone, Copy)]
struct FeatureValue {
    current: u32,
    default: u32,
    saved: u32,
}

impl FeatureValue {
    const fn new(default: u32) -> Self {
        Self {
            current: default,
            default,
            saved: default,
        }
    }
}

/// 完了待ちのコマンド
#[derive(Debug, Clone, Copy)]
struct Pending {
    cid: u16,
    status: StatusField,
    result: u32,
    /// 取り込み後のSQ Head
    sq_head: u16,
    /// 完了可能になる時刻（`None` は手動完了待ち）
    due: Option<Nanoseconds>,
}

struct QueueModel {
    sq: Arc<HeapRing>,
    cq: Arc<HeapRing>,
    sq_head: RingCursor,
    sq_tail: u16,
    cq_tail: RingCursor,
    cq_head: u16,
    pending: Vec<Pending>,
}

impl QueueModel {
    fn new(sq: Arc<HeapRing>, cq: Arc<HeapRing>) -> Self {
        Self {
            sq_head: RingCursor::new(sq.entries()),
            cq_tail: RingCursor::new(cq.entries()),
            sq,
            cq,
            sq_tail: 0,
            cq_head: 0,
            pending: Vec::new(),
        }
    }

    fn cq_full(&self) -> bool {
        (self.cq_tail.slot() + 1) % self.cq.entries() == self.cq_head
    }

    fn reset(&mut self) {
        self.sq_head.reset();
        self.cq_tail.reset();
        self.sq_tail = 0;
        self.cq_head = 0;
        self.pending.clear();
    }
}

struct DeviceState {
    mode: CompletionMode,
    queues: HashMap<u16, QueueModel>,
    features: HashMap<u8, FeatureValue>,
    /// Interrupt Vector ConfigurationのCDビット（ベクタごと）
    iv_coalescing_disable: HashMap<u16, bool>,
    fetched: Vec<FetchedCommand>,
    sqid_override: Option<u16>,
}

/// コマンド解釈の結果
struct Outcome {
    status: StatusField,
    result: u32,
}

impl Outcome {
    const fn ok(result: u32) -> Self {
        Self {
            status: StatusField::SUCCESS,
            result,
        }
    }

    const fn generic(status: NvmeStatus) -> Self {
        Self {
            status: StatusField::new(status_type::GENERIC, status as u8),
            result: 0,
        }
    }

    const fn invalid_queue_id() -> Self {
        Self {
            status: StatusField::new(status_type::COMMAND_SPECIFIC, 0x01),
            result: 0,
        }
    }
}

/// Feature Capabilities: 保存可能 | 変更可能
const FEATURE_CAPS: u32 = 0b101;

/// 許可するI/Oキュー数の上限（0始まり）
const MAX_IO_QUEUES: u32 = 63;

fn default_features() -> HashMap<u8, FeatureValue> {
    let mut features = HashMap::new();
    for (fid, default) in [
        (feature_ids::ARBITRATION, 0),
        (feature_ids::POWER_MGMT, 0),
        (feature_ids::TEMP_THRESHOLD, 0x0157),
        (feature_ids::ERROR_RECOVERY, 0),
        (feature_ids::VOLATILE_WC, 1),
        (feature_ids::NUM_QUEUES, (MAX_IO_QUEUES << 16) | MAX_IO_QUEUES),
        (feature_ids::IRQ_COALESCING, 0),
        (feature_ids::WRITE_ATOMICITY, 0),
        (feature_ids::ASYNC_EVENT_CONFIG, 0),
    ] {
        features.insert(fid, FeatureValue::new(default));
    }
    features
}

impl DeviceState {
    fn execute(&mut self, fields: &FieldPacked<CMD_DWORDS>) -> Outcome {
        let d = fields.dwords();
        let dw10 = d[cmd_layout::DW_CDW10];
        let dw11 = d[cmd_layout::DW_CDW11];
        let Some(opcode) = AdminOpcode::from_raw(d[cmd_layout::DW_CDW0] as u8) else {
            return Outcome::generic(NvmeStatus::InvalidCommandOpcode);
        };
        match opcode {
            AdminOpcode::GetFeatures => self.get_feature(dw10, dw11),
            AdminOpcode::SetFeatures => self.set_feature(dw10, dw11),
            AdminOpcode::Identify => match dw10 as u8 {
                cns::NAMESPACE | cns::CONTROLLER | cns::ACTIVE_NS_LIST => Outcome::ok(0),
                _ => Outcome::generic(NvmeStatus::InvalidFieldInCommand),
            },
            AdminOpcode::CreateIOCQ
            | AdminOpcode::CreateIOSQ
            | AdminOpcode::DeleteIOCQ
            | AdminOpcode::DeleteIOSQ => {
                if dw10 as u16 == 0 {
                    Outcome::invalid_queue_id()
                } else {
                    Outcome::ok(0)
                }
            }
            _ => Outcome::generic(NvmeStatus::InvalidCommandOpcode),
        }
    }

    fn get_feature(&self, dw10: u32, dw11: u32) -> Outcome {
        let fid = dw10 as u8;
        let Some(sel) = FeatureSelect::from_raw((dw10 >> 8) as u8) else {
            return Outcome::generic(NvmeStatus::InvalidFieldInCommand);
        };
        if fid == feature_ids::IRQ_CONFIG {
            let iv = dw11 as u16;
            let cd = self.iv_coalescing_disable.get(&iv).copied().unwrap_or(false);
            return match sel {
                FeatureSelect::Capabilities => Outcome::ok(FEATURE_CAPS),
                _ => Outcome::ok(iv as u32 | ((cd as u32) << 16)),
            };
        }
        let Some(value) = self.features.get(&fid) else {
            return Outcome::generic(NvmeStatus::InvalidFieldInCommand);
        };
        Outcome::ok(match sel {
            FeatureSelect::Current => value.current,
            FeatureSelect::Default => value.default,
            FeatureSelect::Saved => value.saved,
            FeatureSelect::Capabilities => FEATURE_CAPS,
        })
    }

    fn set_feature(&mut self, dw10: u32, dw11: u32) -> Outcome {
        let fid = dw10 as u8;
        let save = dw10 & (1 << 31) != 0;
        if fid == feature_ids::IRQ_CONFIG {
            self.iv_coalescing_disable
                .insert(dw11 as u16, dw11 & (1 << 16) != 0);
            return Outcome::ok(0);
        }
        let Some(value) = self.features.get_mut(&fid) else {
            return Outcome::generic(NvmeStatus::InvalidFieldInCommand);
        };
        let (stored, result) = match fid {
            feature_ids::TEMP_THRESHOLD => (dw11 & 0xFFFF, 0),
            feature_ids::NUM_QUEUES => {
                let nsq = (dw11 & 0xFFFF).min(MAX_IO_QUEUES);
                let ncq = (dw11 >> 16).min(MAX_IO_QUEUES);
                let allocated = (ncq << 16) | nsq;
                (allocated, allocated)
            }
            feature_ids::WRITE_ATOMICITY | feature_ids::VOLATILE_WC => (dw11 & 0x1, 0),
            _ => (dw11, 0),
        };
        value.current = stored;
        if save {
            value.saved = stored;
        }
        Outcome::ok(result)
    }
}

// ============================================================================
// Loopback Device
// ============================================================================

/// プロセス内のコントローラモデル
pub struct LoopbackDevice {
    state: Mutex<DeviceState>,
    clock: Arc<dyn Clock>,
}

impl LoopbackDevice {
    /// `Immediate` モードのデバイスを作成
    pub fn new(clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(DeviceState {
                mode: CompletionMode::Immediate,
                queues: HashMap::new(),
                features: default_features(),
                iv_coalescing_disable: HashMap::new(),
                fetched: Vec::new(),
                sqid_override: None,
            }),
            clock,
        })
    }

    /// 完了モードを変更（以後に取り込むコマンドから適用）
    pub fn set_mode(&self, mode: CompletionMode) {
        self.state.lock().mode = mode;
    }

    /// 完了エントリに書くSQ Identifierを上書き（フォールトインジェクション用）
    pub fn set_sqid_override(&self, sqid: Option<u16>) {
        self.state.lock().sqid_override = sqid;
    }

    /// リングを確保してデバイスに登録し、このデバイスにつながった
    /// キューペアを作成する（状態は `Uninitialized`）
    pub fn queue_pair(self: &Arc<Self>, config: QueueConfig) -> Result<QueuePair> {
        let entries = u16::try_from(config.ring_entries()).map_err(|_| {
            crate::error::ConformanceError::InvalidQueueConfig("depth too large for ring")
        })?;
        let sq = HeapRing::new(entries, SQE_SIZE);
        let cq = HeapRing::new(entries, CQE_SIZE);
        let qp = QueuePair::new(config, sq.clone(), cq.clone(), self.clone(), self.clock.clone())?;
        self.state
            .lock()
            .queues
            .insert(config.qid, QueueModel::new(sq, cq));
        Ok(qp)
    }

    /// コントローラリセット: キュー位置と完了待ちを破棄し、
    /// Feature現在値を保存値に戻す
    pub fn reset(&self) {
        let mut state = self.state.lock();
        for queue in state.queues.values_mut() {
            queue.reset();
        }
        for value in state.features.values_mut() {
            value.current = value.saved;
        }
        state.iv_coalescing_disable.clear();
    }

    /// `Manual` モードで保留中のコマンドを完了させる
    ///
    /// 該当するコマンドが無ければ `false`。CQに空きが無い場合は
    /// 解放されるまで保留される。
    pub fn complete(&self, qid: u16, cid: u16, status: StatusField, dw0: u32) -> bool {
        let now = self.clock.uptime_nanos();
        let mut state = self.state.lock();
        let sqid = state.sqid_override;
        let Some(queue) = state.queues.get_mut(&qid) else {
            return false;
        };
        let Some(pending) = queue
            .pending
            .iter_mut()
            .find(|p| p.cid == cid && p.due.is_none())
        else {
            return false;
        };
        pending.status = status;
        pending.result = dw0;
        pending.due = Some(now);
        Self::post_due(qid, queue, now, sqid);
        true
    }

    /// 取り込んだコマンドの履歴
    pub fn fetched_commands(&self) -> Vec<FetchedCommand> {
        self.state.lock().fetched.clone()
    }

    /// `qid` で完了待ちのコマンド数
    pub fn pending(&self, qid: u16) -> usize {
        self.state
            .lock()
            .queues
            .get(&qid)
            .map_or(0, |q| q.pending.len())
    }

    /// SQ Tailまでのエントリを取り込んで解釈する
    fn fetch(state: &mut DeviceState, qid: u16, now: Nanoseconds) {
        let mode = state.mode;
        let Some(mut queue) = state.queues.remove(&qid) else {
            return;
        };
        while queue.sq_head.slot() != queue.sq_tail {
            let slot = queue.sq_head.slot();
            let mut raw = [0u8; SQE_SIZE];
            queue.sq.read_entry(slot, &mut raw);
            let fields = FieldPacked::<CMD_DWORDS>::from_le_bytes(&raw);
            queue.sq_head.advance();

            let fetched = FetchedCommand { qid, slot, fields };
            trace!(
                "loopback: queue {} fetched opcode {:#04x} CID {:#06x}",
                qid,
                fetched.opcode(),
                fetched.cid()
            );
            let outcome = state.execute(&fields);
            queue.pending.push(Pending {
                cid: fetched.cid(),
                status: outcome.status,
                result: outcome.result,
                sq_head: queue.sq_head.slot(),
                due: match mode {
                    CompletionMode::Immediate => Some(now),
                    CompletionMode::Delayed(delay) => Some(now.saturating_add(delay)),
                    CompletionMode::Manual => None,
                },
            });
            state.fetched.push(fetched);
        }
        state.queues.insert(qid, queue);
    }

    /// 期限到来分をCQへ書き込み、書き込んだ件数を返す
    fn post_due(qid: u16, queue: &mut QueueModel, now: Nanoseconds, sqid: Option<u16>) -> usize {
        let mut posted = 0;
        while !queue.cq_full() {
            let Some(index) = queue
                .pending
                .iter()
                .position(|p| p.due.is_some_and(|due| due <= now))
            else {
                break;
            };
            let p = queue.pending.remove(index);
            let ce = CompletionEntry::new(
                p.cid,
                queue.cq_tail.expected_phase(),
                p.status,
                p.sq_head,
                sqid.unwrap_or(qid),
                [p.result, 0],
            );
            let mut raw = [0u8; CQE_SIZE];
            ce.write_le_bytes(&mut raw);
            queue.cq.write_entry(queue.cq_tail.slot(), &raw);
            trace!(
                "loopback: queue {} posted CID {:#06x} at slot {}",
                qid,
                p.cid,
                queue.cq_tail.slot()
            );
            queue.cq_tail.advance();
            posted += 1;
        }
        posted
    }
}

impl DriverChannel for LoopbackDevice {
    fn ring_doorbell(&self, doorbell: Doorbell, value: u16) -> core::result::Result<(), DriverError> {
        let now = self.clock.uptime_nanos();
        let mut state = self.state.lock();
        let qid = doorbell.qid();
        let sqid = state.sqid_override;
        let entries = match state.queues.get(&qid) {
            Some(queue) => match doorbell {
                Doorbell::SubmissionTail(_) => queue.sq.entries(),
                Doorbell::CompletionHead(_) => queue.cq.entries(),
            },
            None => return Err(DriverError::UnknownQueue(qid)),
        };
        if value >= entries {
            return Err(DriverError::DoorbellOutOfRange { qid, value });
        }

        match doorbell {
            Doorbell::SubmissionTail(_) => {
                if let Some(queue) = state.queues.get_mut(&qid) {
                    queue.sq_tail = value;
                }
                Self::fetch(&mut state, qid, now);
            }
            Doorbell::CompletionHead(_) => {
                if let Some(queue) = state.queues.get_mut(&qid) {
                    queue.cq_head = value;
                }
            }
        }
        if let Some(queue) = state.queues.get_mut(&qid) {
            Self::post_due(qid, queue, now, sqid);
        }
        Ok(())
    }

    fn wait_for_completion(&self, qid: u16, _budget: Duration) -> WaitOutcome {
        let now = self.clock.uptime_nanos();
        let mut state = self.state.lock();
        let sqid = state.sqid_override;
        let posted = match state.queues.get_mut(&qid) {
            Some(queue) => Self::post_due(qid, queue, now, sqid),
            None => 0,
        };
        if posted > 0 {
            WaitOutcome::Notified
        } else {
            // 実際の待機は呼び出し側の時計に任せる
            WaitOutcome::Unsupported
        }
    }
}

/// `Delayed` モード用の変換
impl From<Duration> for CompletionMode {
    fn from(delay: Duration) -> Self {
        CompletionMode::Delayed(duration_to_nanos(delay))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nvme::cmds::{GetFeatures, SetFeatures};
    use crate::nvme::command::NvmeCmd;
    use crate::nvme::queue::{QueueState, Reaped};
    use crate::time::{Deadline, ManualClock};

    fn active_pair(device: &Arc<LoopbackDevice>, depth: u16) -> QueuePair {
        let mut qp = device.queue_pair(QueueConfig::new(0, depth)).unwrap();
        qp.transition(QueueState::Created).unwrap();
        qp.transition(QueueState::Active).unwrap();
        qp
    }

    fn reap(qp: &mut QueuePair, cid: u16) -> Reaped {
        let deadline = Deadline::after(&**qp.clock(), Duration::from_millis(1));
        qp.poll_completion(cid, deadline).unwrap()
    }

    #[test]
    fn test_doorbell_validation() {
        let clock = Arc::new(ManualClock::new());
        let device = LoopbackDevice::new(clock);
        let _qp = device.queue_pair(QueueConfig::new(0, 2)).unwrap();
        assert_eq!(
            device.ring_doorbell(Doorbell::SubmissionTail(5), 0),
            Err(DriverError::UnknownQueue(5))
        );
        assert_eq!(
            device.ring_doorbell(Doorbell::CompletionHead(0), 3),
            Err(DriverError::DoorbellOutOfRange { qid: 0, value: 3 })
        );
    }

    #[test]
    fn test_set_then_get_feature() {
        let clock = Arc::new(ManualClock::with_relax_step(1_000));
        let device = LoopbackDevice::new(clock);
        let mut qp = active_pair(&device, 4);

        let mut set = SetFeatures::new();
        set.set_fid(feature_ids::TEMP_THRESHOLD).unwrap();
        set.set_temp_threshold_tmpth(300).unwrap();
        qp.submit(&set).unwrap();
        qp.notify().unwrap();
        assert!(matches!(reap(&mut qp, set.cid()), Reaped::Completed(ce) if ce.is_success()));

        let mut get = GetFeatures::new();
        get.set_fid(feature_ids::TEMP_THRESHOLD).unwrap();
        qp.submit(&get).unwrap();
        qp.notify().unwrap();
        match reap(&mut qp, get.cid()) {
            Reaped::Completed(ce) => assert_eq!(ce.result_field(0).unwrap(), 300),
            other => panic!("unexpected {:?}", other),
        }

        get.set_sel(FeatureSelect::Default as u8).unwrap();
        qp.submit(&get).unwrap();
        qp.notify().unwrap();
        match reap(&mut qp, get.cid()) {
            Reaped::Completed(ce) => assert_eq!(ce.result_field(0).unwrap(), 0x0157),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_feature_and_opcode() {
        let clock = Arc::new(ManualClock::new());
        let device = LoopbackDevice::new(clock);
        let mut qp = active_pair(&device, 4);

        let mut get = GetFeatures::new();
        get.set_fid(0x7E).unwrap();
        qp.submit(&get).unwrap();
        let mut bogus = crate::nvme::command::Cmd::new(0x7F, crate::nvme::prp::DataDir::None, Default::default());
        bogus.set_nsid(1);
        qp.submit(&bogus).unwrap();
        qp.notify().unwrap();

        match reap(&mut qp, get.cid()) {
            Reaped::Completed(ce) => assert_eq!(ce.status_kind(), NvmeStatus::InvalidFieldInCommand),
            other => panic!("unexpected {:?}", other),
        }
        match reap(&mut qp, bogus.cid()) {
            Reaped::Completed(ce) => assert_eq!(ce.status_kind(), NvmeStatus::InvalidCommandOpcode),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_manual_completion_and_cq_backpressure() {
        let clock = Arc::new(ManualClock::with_relax_step(1_000));
        let device = LoopbackDevice::new(clock);
        device.set_mode(CompletionMode::Manual);
        let mut qp = active_pair(&device, 1);

        let get = GetFeatures::new();
        qp.submit(&get).unwrap();
        qp.notify().unwrap();
        assert_eq!(device.pending(0), 1);
        assert!(!device.complete(0, get.cid().wrapping_add(1), StatusField::SUCCESS, 0));
        assert!(device.complete(0, get.cid(), StatusField::SUCCESS, 0xAB));
        assert_eq!(device.pending(0), 0);
        match reap(&mut qp, get.cid()) {
            Reaped::Completed(ce) => assert_eq!(ce.result_field(0).unwrap(), 0xAB),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_reset_restores_saved_features() {
        let clock = Arc::new(ManualClock::new());
        let device = LoopbackDevice::new(clock);
        let mut qp = active_pair(&device, 2);

        let mut set = SetFeatures::new();
        set.set_fid(feature_ids::ERROR_RECOVERY).unwrap();
        set.set_error_recovery_tler(7).unwrap();
        qp.submit(&set).unwrap();
        qp.notify().unwrap();
        assert!(matches!(reap(&mut qp, set.cid()), Reaped::Completed(_)));

        qp.transition(QueueState::Created).unwrap();
        device.reset();
        qp.transition(QueueState::Active).unwrap();

        let mut get = GetFeatures::new();
        get.set_fid(feature_ids::ERROR_RECOVERY).unwrap();
        qp.submit(&get).unwrap();
        qp.notify().unwrap();
        match reap(&mut qp, get.cid()) {
            Reaped::Completed(ce) => assert_eq!(ce.result_field(0).unwrap(), 0),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_delayed_mode_from_duration() {
        assert_eq!(
            CompletionMode::from(Duration::from_micros(3)),
            CompletionMode::Delayed(3_000)
        );
    }
}
