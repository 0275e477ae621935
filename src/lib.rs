// ============================================================================
// src/lib.rs - NVMe Conformance Harness Core
// ============================================================================
//!
//! # nvme_conformance
//!
//! NVMeコントローラ適合試験ハーネスのプロトコル層。
//!
//! - ビット単位で正確なコマンド構築（`nvme::field`, `nvme::command`, `nvme::cmds`）
//! - PRPバッファディスクリプタ（`nvme::prp`）
//! - ドアベルで特権ドライバと同期するSQ/CQペア（`nvme::queue`）
//! - 期限付きの投入 → 通知 → 待機 → 回収 → 検証（`nvme::executor`）
//!
//! ハードウェアとドライバへのアクセスはすべてトレイト
//! （`DriverChannel`, `RingMemory`, `Clock`）で注入する。
//! `std` フィーチャーを外すと `no_std` + `alloc` でビルドできる。

#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub mod error;
pub mod nvme;
pub mod time;

pub use error::{ConformanceError, LayoutViolation, Result};
pub use time::{Clock, Deadline, ManualClock, Nanoseconds};

#[cfg(feature = "std")]
pub use time::StdClock;
