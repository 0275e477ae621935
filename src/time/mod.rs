//! 時間管理サブシステム
//!
//! 完了待ちの期限管理に使う時計の抽象化。
//! 実時間の `StdClock`（std フィーチャー）と、テスト用に手動で進める
//! `ManualClock` を提供する。タイムアウト値のスケーリングは呼び出し側の
//! 責務で、このモジュールは解決済みの期限（`Deadline`）のみを扱う。

use core::sync::atomic::{AtomicU64, Ordering};
use core::time::Duration;

/// ナノ秒単位の時間
pub type Nanoseconds = u64;

/// 1秒のナノ秒数
pub const NANOS_PER_SEC: u64 = 1_000_000_000;

/// 1ミリ秒のナノ秒数
pub const NANOS_PER_MILLI: u64 = 1_000_000;

/// 1マイクロ秒のナノ秒数
pub const NANOS_PER_MICRO: u64 = 1_000;

/// `Duration` をナノ秒に変換（u64に収まらない場合は飽和）
pub fn duration_to_nanos(duration: Duration) -> Nanoseconds {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

// ============================================================================
// Clock
// ============================================================================

/// 単調増加する時計
///
/// キューペアは完了ポーリングの期限判定にのみ使用する。
pub trait Clock: Send + Sync {
    /// 任意の起点からの経過時間（ナノ秒）
    fn uptime_nanos(&self) -> Nanoseconds;

    /// ポーリングループ1回分の休止
    ///
    /// ドライバが待機プリミティブを提供しない場合に呼ばれる。
    fn relax(&self) {
        core::hint::spin_loop();
    }
}

/// 絶対期限
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline {
    /// 開始時刻
    start: Nanoseconds,
    /// 期限時刻
    at: Nanoseconds,
}

impl Deadline {
    /// 現在時刻から `timeout` 後の期限を作成
    pub fn after(clock: &dyn Clock, timeout: Duration) -> Self {
        let start = clock.uptime_nanos();
        Self {
            start,
            at: start.saturating_add(duration_to_nanos(timeout)),
        }
    }

    /// 絶対時刻から期限を作成
    pub const fn at(start: Nanoseconds, at: Nanoseconds) -> Self {
        Self { start, at }
    }

    /// 期限時刻
    pub const fn instant(&self) -> Nanoseconds {
        self.at
    }

    /// 期限までの許容時間
    pub const fn bound(&self) -> Nanoseconds {
        self.at.saturating_sub(self.start)
    }

    /// 開始からの経過時間
    pub const fn elapsed(&self, now: Nanoseconds) -> Nanoseconds {
        now.saturating_sub(self.start)
    }

    /// 残り時間
    pub fn remaining(&self, now: Nanoseconds) -> Duration {
        Duration::from_nanos(self.at.saturating_sub(now))
    }

    /// 期限切れか
    pub const fn is_expired(&self, now: Nanoseconds) -> bool {
        now >= self.at
    }
}

// ============================================================================
// ManualClock
// ============================================================================

/// 手動で進める時計
///
/// `relax` のたびに `relax_step` だけ進むため、実時間に依存しない
/// 決定的なタイムアウト試験ができる。
pub struct ManualClock {
    /// 経過ナノ秒
    uptime_nanos: AtomicU64,
    /// relax 1回あたりの自動前進量
    relax_step: AtomicU64,
}

impl ManualClock {
    /// 新しい時計を作成（relaxでは進まない）
    ///
    /// 期限付きの待機に使う場合は、別スレッドから `tick` で進めるか
    /// `set_relax_step` で自動前進量を設定すること。どちらもなければ
    /// 完了しないコマンドの `poll_completion` は戻らない。
    pub const fn new() -> Self {
        Self {
            uptime_nanos: AtomicU64::new(0),
            relax_step: AtomicU64::new(0),
        }
    }

    /// relax 1回ごとに `step` 進む時計を作成
    pub const fn with_relax_step(step: Nanoseconds) -> Self {
        Self {
            uptime_nanos: AtomicU64::new(0),
            relax_step: AtomicU64::new(step),
        }
    }

    /// 時計を進める
    pub fn tick(&self, delta_nanos: Nanoseconds) {
        self.uptime_nanos.fetch_add(delta_nanos, Ordering::Relaxed);
    }

    /// 自動前進量を変更
    pub fn set_relax_step(&self, step: Nanoseconds) {
        self.relax_step.store(step, Ordering::Relaxed);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn uptime_nanos(&self) -> Nanoseconds {
        self.uptime_nanos.load(Ordering::Relaxed)
    }

    fn relax(&self) {
        let step = self.relax_step.load(Ordering::Relaxed);
        self.tick(step);
    }
}

// ============================================================================
// StdClock
// ============================================================================

/// `std::time::Instant` ベースの実時間時計
#[cfg(feature = "std")]
pub struct StdClock {
    origin: std::time::Instant,
    poll_interval: Duration,
}

#[cfg(feature = "std")]
impl StdClock {
    /// 既定のポーリング間隔で作成
    pub fn new() -> Self {
        Self::with_poll_interval(Duration::from_micros(
            crate::nvme::defs::DEFAULT_POLL_INTERVAL_US,
        ))
    }

    /// ポーリング間隔を指定して作成
    pub fn with_poll_interval(poll_interval: Duration) -> Self {
        Self {
            origin: std::time::Instant::now(),
            poll_interval,
        }
    }
}

#[cfg(feature = "std")]
impl Default for StdClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "std")]
impl Clock for StdClock {
    fn uptime_nanos(&self) -> Nanoseconds {
        duration_to_nanos(self.origin.elapsed())
    }

    fn relax(&self) {
        if self.poll_interval.is_zero() {
            std::thread::yield_now();
        } else {
            std::thread::sleep(self.poll_interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_relax_step() {
        let clock = ManualClock::with_relax_step(5 * NANOS_PER_MILLI);
        assert_eq!(clock.uptime_nanos(), 0);
        clock.relax();
        clock.relax();
        assert_eq!(clock.uptime_nanos(), 10 * NANOS_PER_MILLI);
        clock.tick(1);
        assert_eq!(clock.uptime_nanos(), 10 * NANOS_PER_MILLI + 1);
    }

    #[test]
    fn test_deadline_arithmetic() {
        let clock = ManualClock::new();
        clock.tick(100);
        let deadline = Deadline::after(&clock, Duration::from_nanos(50));
        assert_eq!(deadline.instant(), 150);
        assert_eq!(deadline.bound(), 50);
        assert!(!deadline.is_expired(149));
        assert!(deadline.is_expired(150));
        assert_eq!(deadline.remaining(120), Duration::from_nanos(30));
        assert_eq!(deadline.remaining(200), Duration::ZERO);
        assert_eq!(deadline.elapsed(130), 30);
    }

    #[test]
    fn test_deadline_saturates() {
        let clock = ManualClock::new();
        clock.tick(10);
        let deadline = Deadline::after(&clock, Duration::MAX);
        assert_eq!(deadline.instant(), u64::MAX);
    }
}
