// ============================================================================
// src/nvme/mem_buffer.rs - Test-Owned Data Buffers
// ============================================================================
//!
//! コマンドのユーザーデータバッファ
//!
//! テスト側のリソース管理が確保し、`Arc` で共有する読み書き可能なバッファ。
//! PRPディスクリプタは参照とサイズを保持するだけで、所有権は取らない。
//! 先頭ページ内オフセットを指定でき、PRP1がページ境界にない場合の試験に使う。

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use spin::RwLock;

use crate::error::{ConformanceError, Result};
use crate::nvme::defs::PAGE_SIZE;

/// 共有データバッファ
pub type SharedMemBuffer = Arc<MemBuffer>;

/// データパターン
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataPattern {
    /// 8ビット定数
    Const8(u8),
    /// 16ビット定数（リトルエンディアン）
    Const16(u16),
    /// 32ビット定数（リトルエンディアン）
    Const32(u32),
    /// 8ビット単位で開始値から増加
    Inc8(u8),
    /// 16ビット単位で開始値から増加
    Inc16(u16),
    /// 32ビット単位で開始値から増加
    Inc32(u32),
}

/// 読み書き可能なデータバッファ
pub struct MemBuffer {
    /// 裏付けメモリ（確保後はサイズ変更しない）
    backing: RwLock<Vec<u8>>,
    /// backing内の先頭インデックス
    start: usize,
    /// 有効バイト数
    len: usize,
    /// 先頭のホスト仮想アドレス
    addr: usize,
}

impl MemBuffer {
    /// ページ境界から始まるゼロ初期化バッファを作成
    pub fn new(len: usize) -> SharedMemBuffer {
        Arc::new(Self::allocate(len, 0))
    }

    /// 先頭ページ内オフセットを指定してバッファを作成
    ///
    /// オフセットはPRPの制約によりDWORDアラインかつページ未満。
    pub fn with_first_page_offset(len: usize, offset: usize) -> Result<SharedMemBuffer> {
        if offset >= PAGE_SIZE || offset % 4 != 0 {
            return Err(ConformanceError::InvalidBuffer(
                "first page offset must be dword aligned and below page size",
            ));
        }
        Ok(Arc::new(Self::allocate(len, offset)))
    }

    fn allocate(len: usize, offset: usize) -> Self {
        let backing = vec![0u8; len + PAGE_SIZE];
        let base = backing.as_ptr() as usize;
        let aligned = (base + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        let start = aligned - base + offset;
        // ページ内オフセットがPAGE_SIZE-1を超えると余白に収まらない
        let start = if start + len > backing.len() {
            start - PAGE_SIZE
        } else {
            start
        };
        Self {
            addr: base + start,
            backing: RwLock::new(backing),
            start,
            len,
        }
    }

    /// 有効バイト数
    pub fn len(&self) -> usize {
        self.len
    }

    /// 空か
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// 先頭のホスト仮想アドレス
    pub fn host_addr(&self) -> usize {
        self.addr
    }

    /// 先頭ページ内オフセット
    pub fn first_page_offset(&self) -> usize {
        self.addr % PAGE_SIZE
    }

    /// 読み取り専用でアクセス
    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let guard = self.backing.read();
        f(&guard[self.start..self.start + self.len])
    }

    /// 書き込み可能でアクセス
    pub fn with_data_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut guard = self.backing.write();
        f(&mut guard[self.start..self.start + self.len])
    }

    /// 内容をコピー
    pub fn to_vec(&self) -> Vec<u8> {
        self.with_data(|d| d.to_vec())
    }

    /// `offset` から `out` へ読み出し、読み出したバイト数を返す
    pub fn read_at(&self, offset: usize, out: &mut [u8]) -> usize {
        self.with_data(|d| {
            let n = d.len().saturating_sub(offset).min(out.len());
            if n == 0 {
                return 0;
            }
            out[..n].copy_from_slice(&d[offset..offset + n]);
            n
        })
    }

    /// `offset` へ書き込み、書き込んだバイト数を返す
    pub fn write_at(&self, offset: usize, src: &[u8]) -> usize {
        self.with_data_mut(|d| {
            let n = d.len().saturating_sub(offset).min(src.len());
            if n == 0 {
                return 0;
            }
            d[offset..offset + n].copy_from_slice(&src[..n]);
            n
        })
    }

    /// データパターンで埋める
    pub fn fill(&self, pattern: DataPattern) {
        self.with_data_mut(|d| match pattern {
            DataPattern::Const8(v) => d.fill(v),
            DataPattern::Const16(v) => fill_units(d, |_| v.to_le_bytes()),
            DataPattern::Const32(v) => fill_units(d, |_| v.to_le_bytes()),
            DataPattern::Inc8(start) => {
                for (i, b) in d.iter_mut().enumerate() {
                    *b = start.wrapping_add(i as u8);
                }
            }
            DataPattern::Inc16(start) => {
                fill_units(d, |i| start.wrapping_add(i as u16).to_le_bytes())
            }
            DataPattern::Inc32(start) => {
                fill_units(d, |i| start.wrapping_add(i as u32).to_le_bytes())
            }
        });
    }
}

/// 固定幅の値でバッファを埋める（末尾の端数は切り詰め）
fn fill_units<const W: usize>(data: &mut [u8], unit: impl Fn(usize) -> [u8; W]) {
    for (i, chunk) in data.chunks_mut(W).enumerate() {
        let bytes = unit(i);
        chunk.copy_from_slice(&bytes[..chunk.len()]);
    }
}
