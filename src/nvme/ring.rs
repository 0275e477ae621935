// ============================================================================
// src/nvme/ring.rs - Ring Arithmetic and Queue Memory
// ============================================================================
//!
//! SQ/CQリングの位置計算とリングメモリへのアクセス
//!
//! リングは固定長配列で、位置は `RingCursor { slot, wraps }` で表す。
//! CQの期待フェーズは周回数だけから決まる純粋関数で、
//! 初回の周回ではフェーズ1を期待する。
//!
//! リングメモリの確保はドライバの責務であり、このモジュールは
//! 確保済み領域へのハンドル（`RingMemory`）だけを扱う。

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use core::ptr::{self, NonNull};
use spin::Mutex;

use crate::nvme::defs::PAGE_SIZE;

// ============================================================================
// Ring Cursor
// ============================================================================

/// 周回数 `wraps` のときに期待するフェーズ
pub const fn expected_phase(wraps: u32) -> bool {
    wraps % 2 == 0
}

/// リング上の位置（スロット + 周回数）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingCursor {
    slot: u16,
    wraps: u32,
    entries: u16,
}

impl RingCursor {
    /// スロット0・周回0の位置
    pub const fn new(entries: u16) -> Self {
        Self {
            slot: 0,
            wraps: 0,
            entries,
        }
    }

    /// 現在のスロット
    pub const fn slot(&self) -> u16 {
        self.slot
    }

    /// 周回数
    pub const fn wraps(&self) -> u32 {
        self.wraps
    }

    /// リングのスロット数
    pub const fn entries(&self) -> u16 {
        self.entries
    }

    /// 現在の周回で期待するフェーズ
    pub const fn expected_phase(&self) -> bool {
        expected_phase(self.wraps)
    }

    /// 1スロット進める（末尾でラップし周回数を増やす）
    pub fn advance(&mut self) {
        self.slot += 1;
        if self.slot >= self.entries {
            self.slot = 0;
            self.wraps = self.wraps.wrapping_add(1);
        }
    }

    /// 初期位置に戻す
    pub fn reset(&mut self) {
        self.slot = 0;
        self.wraps = 0;
    }
}

// ============================================================================
// Ring Memory
// ============================================================================

/// 確保済みリングメモリへのハンドル
///
/// `slot` は常に `entries()` 未満で呼ばれる。範囲外の呼び出しは無視される。
pub trait RingMemory: Send + Sync {
    /// スロット数
    fn entries(&self) -> u16;

    /// 1エントリのバイト数
    fn entry_size(&self) -> usize;

    /// スロットの内容を `out` にコピー
    fn read_entry(&self, slot: u16, out: &mut [u8]);

    /// スロットに `src` を書き込む
    fn write_entry(&self, slot: u16, src: &[u8]);

    /// リング先頭のホスト仮想アドレス
    fn host_addr(&self) -> usize;
}

/// スロットのバイト範囲（範囲外は `None`）
fn slot_range(slot: u16, entries: u16, entry_size: usize) -> Option<core::ops::Range<usize>> {
    if slot >= entries {
        return None;
    }
    let start = slot as usize * entry_size;
    Some(start..start + entry_size)
}

// ============================================================================
// Heap Ring
// ============================================================================

/// リング確保の単位（ページ境界に揃える）
#[repr(C, align(4096))]
#[derive(Clone, Copy)]
struct RingPage([u8; PAGE_SIZE]);

fn page_bytes(pages: &[RingPage]) -> &[u8] {
    // Safety: RingPage はパディングのない u8 配列
    unsafe { core::slice::from_raw_parts(pages.as_ptr().cast::<u8>(), pages.len() * PAGE_SIZE) }
}

fn page_bytes_mut(pages: &mut [RingPage]) -> &mut [u8] {
    // Safety: 同上
    unsafe {
        core::slice::from_raw_parts_mut(pages.as_mut_ptr().cast::<u8>(), pages.len() * PAGE_SIZE)
    }
}

/// ヒープ上のリング（ループバックデバイスやテスト用）
///
/// 先頭はページ境界に揃う（キュー作成コマンドのPRP1はオフセット0が必須）。
pub struct HeapRing {
    entries: u16,
    entry_size: usize,
    addr: usize,
    pages: Mutex<Box<[RingPage]>>,
}

impl HeapRing {
    /// ゼロ初期化されたリングを確保
    pub fn new(entries: u16, entry_size: usize) -> Arc<Self> {
        let len = entries as usize * entry_size;
        let pages = vec![RingPage([0; PAGE_SIZE]); len.div_ceil(PAGE_SIZE)].into_boxed_slice();
        Arc::new(Self {
            entries,
            entry_size,
            addr: pages.as_ptr() as usize,
            pages: Mutex::new(pages),
        })
    }
}

impl RingMemory for HeapRing {
    fn entries(&self) -> u16 {
        self.entries
    }

    fn entry_size(&self) -> usize {
        self.entry_size
    }

    fn read_entry(&self, slot: u16, out: &mut [u8]) {
        if let Some(range) = slot_range(slot, self.entries, self.entry_size) {
            let pages = self.pages.lock();
            let n = out.len().min(self.entry_size);
            out[..n].copy_from_slice(&page_bytes(&pages)[range][..n]);
        }
    }

    fn write_entry(&self, slot: u16, src: &[u8]) {
        if let Some(range) = slot_range(slot, self.entries, self.entry_size) {
            let mut pages = self.pages.lock();
            let n = src.len().min(self.entry_size);
            page_bytes_mut(&mut pages)[range][..n].copy_from_slice(&src[..n]);
        }
    }

    fn host_addr(&self) -> usize {
        self.addr
    }
}

// ============================================================================
// DMA Ring
// ============================================================================

/// ドライバがマップしたDMAメモリ上のリング
///
/// デバイスと共有されるため、アクセスはすべてvolatile。
pub struct DmaRing {
    base: NonNull<u8>,
    entries: u16,
    entry_size: usize,
}

// Safety: DmaRing は生ポインタへのvolatileアクセスのみ行い、
// 同一スロットへの同時書き込みはキューペアの単一呼び出し元が防ぐ
unsafe impl Send for DmaRing {}
unsafe impl Sync for DmaRing {}

impl DmaRing {
    /// マップ済みメモリからリングを作成
    ///
    /// # Safety
    /// - `base` から `entries * entry_size` バイトが、このリングが
    ///   使われる間ずっと読み書き可能であること
    pub unsafe fn new(base: NonNull<u8>, entries: u16, entry_size: usize) -> Self {
        Self {
            base,
            entries,
            entry_size,
        }
    }
}

impl RingMemory for DmaRing {
    fn entries(&self) -> u16 {
        self.entries
    }

    fn entry_size(&self) -> usize {
        self.entry_size
    }

    fn read_entry(&self, slot: u16, out: &mut [u8]) {
        if let Some(range) = slot_range(slot, self.entries, self.entry_size) {
            let n = out.len().min(self.entry_size);
            for (i, b) in out[..n].iter_mut().enumerate() {
                // Safety: range.start + i < entries * entry_size（new の契約）
                *b = unsafe { ptr::read_volatile(self.base.as_ptr().add(range.start + i)) };
            }
        }
    }

    fn write_entry(&self, slot: u16, src: &[u8]) {
        if let Some(range) = slot_range(slot, self.entries, self.entry_size) {
            let n = src.len().min(self.entry_size);
            for (i, b) in src[..n].iter().enumerate() {
                // Safety: 同上
                unsafe { ptr::write_volatile(self.base.as_ptr().add(range.start + i), *b) };
            }
        }
    }

    fn host_addr(&self) -> usize {
        self.base.as_ptr() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nvme::prp::RoRegion;
    use alloc::vec::Vec;

    #[test]
    fn test_first_pass_expects_phase_one() {
        let mut cur = RingCursor::new(3);
        assert!(cur.expected_phase());
        cur.advance();
        cur.advance();
        assert!(cur.expected_phase());
        cur.advance();
        assert_eq!((cur.slot(), cur.wraps()), (0, 1));
        assert!(!cur.expected_phase());
        for _ in 0..3 {
            cur.advance();
        }
        assert!(cur.expected_phase());
        cur.reset();
        assert_eq!((cur.slot(), cur.wraps()), (0, 0));
    }

    #[test]
    fn test_heap_ring_slots() {
        let ring = HeapRing::new(4, 16);
        ring.write_entry(2, &[0xAB; 16]);
        let mut out = [0u8; 16];
        ring.read_entry(2, &mut out);
        assert_eq!(out, [0xAB; 16]);
        ring.read_entry(1, &mut out);
        assert_eq!(out, [0; 16]);

        let region = RoRegion::from_ring(ring.clone());
        assert_eq!(region.len(), 64);
        assert_eq!(region.to_vec()[32..48], [0xAB; 16]);
        let mut partial = [0u8; 20];
        assert_eq!(region.read_at(30, &mut partial), 20);
        assert_eq!(partial[..2], [0, 0]);
        assert_eq!(partial[2..18], [0xAB; 16]);
    }

    #[test]
    fn test_heap_ring_is_page_aligned() {
        for entries in [1u16, 4, 65, 300] {
            let ring = HeapRing::new(entries, 64);
            assert_eq!(ring.host_addr() % PAGE_SIZE, 0);
        }
    }

    #[test]
    fn test_region_keeps_ring_alive() {
        let ring = HeapRing::new(2, 16);
        ring.write_entry(1, &[0x3C; 16]);
        let region = RoRegion::from_ring(ring);
        let noise: Vec<Vec<u8>> = (0..16).map(|_| alloc::vec![0xEE; 32]).collect();
        assert_eq!(region.to_vec()[..16], [0; 16]);
        assert_eq!(region.to_vec()[16..], [0x3C; 16]);
        drop(noise);
    }

    #[test]
    fn test_out_of_range_slots_are_ignored() {
        let ring = HeapRing::new(2, 4);
        ring.write_entry(2, &[1, 2, 3, 4]);
        assert!(RoRegion::from_ring(ring.clone()).to_vec().iter().all(|&b| b == 0));
        let mut out = [7u8; 4];
        ring.read_entry(5, &mut out);
        assert_eq!(out, [7; 4]);
    }

    #[test]
    fn test_dma_ring_volatile_access() {
        let mut backing: Vec<u8> = alloc::vec![0; 2 * 64];
        let base = NonNull::new(backing.as_mut_ptr()).unwrap();
        let ring = unsafe { DmaRing::new(base, 2, 64) };
        ring.write_entry(1, &[0x5A; 64]);
        let mut out = [0u8; 64];
        ring.read_entry(1, &mut out);
        assert_eq!(out, [0x5A; 64]);
        assert_eq!(ring.host_addr(), backing.as_ptr() as usize);
        drop(ring);
        assert_eq!(backing[64], 0x5A);
    }
}
