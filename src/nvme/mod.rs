// ============================================================================
// src/nvme/mod.rs - NVMe Protocol Core
// ============================================================================
//!
//! # NVMe適合試験プロトコル層
//!
//! ## モジュール構成
//! - `defs`: ワイヤ定数・オペコード・ステータス
//! - `field`: DWORD配列のワイヤ構造体
//! - `mem_buffer`: テスト所有のデータバッファ
//! - `prp`: PRPディスクリプタとPRP計画
//! - `command`: コマンド基底型と能力トレイト
//! - `cmds`: 具体的なAdminコマンド
//! - `completion`: 完了エントリのビュー
//! - `ring`: リング位置計算とリングメモリ
//! - `driver`: 特権ドライバとの境界
//! - `queue`: SQ/CQペア
//! - `executor`: 投入から回収までの1サイクル
//! - `loopback`: プロセス内コントローラモデル

pub mod cmds;
pub mod command;
pub mod completion;
pub mod defs;
pub mod driver;
pub mod executor;
pub mod field;
pub mod loopback;
pub mod mem_buffer;
pub mod prp;
pub mod queue;
pub mod ring;

// ============================================================================
// Re-exports
// ============================================================================

pub use cmds::{
    AdminCmd, CreateIoCq, CreateIoSq, DeleteIoCq, DeleteIoSq, FeatureSelect, GetFeatures,
    Identify, QueuePriority, SetFeatures,
};
pub use command::{Cmd, NvmeCmd};
pub use completion::{CompletionEntry, StatusField};
pub use defs::{AdminOpcode, NvmeStatus, feature_ids};
pub use driver::{Doorbell, DriverChannel, DriverError, WaitOutcome};
pub use executor::{execute, send_and_reap};
pub use field::FieldPacked;
pub use loopback::{CompletionMode, FetchedCommand, LoopbackDevice};
pub use mem_buffer::{DataPattern, MemBuffer, SharedMemBuffer};
pub use prp::{DataDir, PrpBitmask, PrpData, PrpView, RoRegion};
pub use queue::{QueueConfig, QueueMetrics, QueuePair, QueueState, Reaped, SlotToken};
pub use ring::{DmaRing, HeapRing, RingCursor, RingMemory};
