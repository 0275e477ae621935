// ============================================================================
// src/nvme/field.rs - Field-Packed Structures
// ============================================================================
//!
//! DWORD配列として表現される固定長ワイヤ構造体
//!
//! コマンド（16 DWORD）と完了エントリ（4 DWORD）の共通基盤。
//! すべてのアクセスは (DWORDインデックス, DWORD内バイトオフセット) で
//! 指定され、DWORD境界をまたぐアクセスは `LayoutViolation` として拒否される。
//! 書き込みは対象バイトのみを変更し、他のビットには触れない。
//! バイトオフセット0はDWORDの最下位バイト（リトルエンディアン）。

use core::fmt;

use crate::error::{LayoutViolation, Result};

/// DWORD配列のワイヤ構造体
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct FieldPacked<const N: usize> {
    dwords: [u32; N],
}

impl<const N: usize> FieldPacked<N> {
    /// ワイヤ上のバイト数
    pub const BYTES: usize = N * 4;

    /// ゼロ初期化された構造体を作成
    pub const fn new() -> Self {
        Self { dwords: [0; N] }
    }

    /// DWORD配列から作成
    pub const fn from_dwords(dwords: [u32; N]) -> Self {
        Self { dwords }
    }

    /// リトルエンディアンのバイト列から作成
    ///
    /// 足りない部分はゼロ、余分なバイトは無視する。
    pub fn from_le_bytes(bytes: &[u8]) -> Self {
        let mut dwords = [0u32; N];
        for (dw, chunk) in dwords.iter_mut().zip(bytes.chunks(4)) {
            let mut raw = [0u8; 4];
            raw[..chunk.len()].copy_from_slice(chunk);
            *dw = u32::from_le_bytes(raw);
        }
        Self { dwords }
    }

    /// リトルエンディアンのバイト列に書き出す
    ///
    /// 書き出したバイト数を返す（`out` が短い場合は切り詰め）。
    pub fn write_le_bytes(&self, out: &mut [u8]) -> usize {
        let mut written = 0;
        for (dw, chunk) in self.dwords.iter().zip(out.chunks_mut(4)) {
            let raw = dw.to_le_bytes();
            chunk.copy_from_slice(&raw[..chunk.len()]);
            written += chunk.len();
        }
        written
    }

    /// DWORD配列への参照
    pub const fn dwords(&self) -> &[u32; N] {
        &self.dwords
    }

    /// DWORD配列への可変参照（範囲がコンパイル時に決まるフィールド用）
    pub(crate) fn dwords_mut(&mut self) -> &mut [u32; N] {
        &mut self.dwords
    }

    /// 要素数
    pub const fn len(&self) -> usize {
        N
    }

    /// 要素数がゼロか
    pub const fn is_empty(&self) -> bool {
        N == 0
    }

    /// アクセス範囲の検証
    fn check(dword: usize, byte_offset: usize, width: usize) -> core::result::Result<(), LayoutViolation> {
        if dword >= N || byte_offset + width > 4 {
            return Err(LayoutViolation {
                dword,
                byte_offset,
                width,
                len: N,
            });
        }
        Ok(())
    }

    // ========================================
    // Byte accessors
    // ========================================

    /// 1バイト書き込み
    pub fn set_byte(&mut self, value: u8, dword: usize, byte_offset: usize) -> Result<()> {
        Self::check(dword, byte_offset, 1)?;
        let shift = byte_offset * 8;
        let dw = &mut self.dwords[dword];
        *dw = (*dw & !(0xFF << shift)) | ((value as u32) << shift);
        Ok(())
    }

    /// 1バイト読み取り
    pub fn get_byte(&self, dword: usize, byte_offset: usize) -> Result<u8> {
        Self::check(dword, byte_offset, 1)?;
        Ok((self.dwords[dword] >> (byte_offset * 8)) as u8)
    }

    // ========================================
    // Word accessors
    // ========================================

    /// 2バイト書き込み（オフセットは0..=2）
    pub fn set_word(&mut self, value: u16, dword: usize, byte_offset: usize) -> Result<()> {
        Self::check(dword, byte_offset, 2)?;
        let shift = byte_offset * 8;
        let dw = &mut self.dwords[dword];
        *dw = (*dw & !(0xFFFF << shift)) | ((value as u32) << shift);
        Ok(())
    }

    /// 2バイト読み取り
    pub fn get_word(&self, dword: usize, byte_offset: usize) -> Result<u16> {
        Self::check(dword, byte_offset, 2)?;
        Ok((self.dwords[dword] >> (byte_offset * 8)) as u16)
    }

    // ========================================
    // Dword accessors
    // ========================================

    /// 4バイト書き込み
    pub fn set_dword(&mut self, value: u32, dword: usize) -> Result<()> {
        Self::check(dword, 0, 4)?;
        self.dwords[dword] = value;
        Ok(())
    }

    /// 4バイト読み取り
    pub fn get_dword(&self, dword: usize) -> Result<u32> {
        Self::check(dword, 0, 4)?;
        Ok(self.dwords[dword])
    }

    /// 連続する2 DWORDへの64ビット書き込み（下位DWORDが先）
    ///
    /// PRP/MPTRなど仕様上2 DWORDで1フィールドとなるもの専用。
    /// 両DWORDとも範囲内であることを先に確認するため部分書き込みは起きない。
    pub fn set_qword(&mut self, value: u64, dword: usize) -> Result<()> {
        Self::check(dword, 0, 4)?;
        Self::check(dword + 1, 0, 4)?;
        self.dwords[dword] = value as u32;
        self.dwords[dword + 1] = (value >> 32) as u32;
        Ok(())
    }

    /// 連続する2 DWORDからの64ビット読み取り
    pub fn get_qword(&self, dword: usize) -> Result<u64> {
        Self::check(dword, 0, 4)?;
        Self::check(dword + 1, 0, 4)?;
        Ok((self.dwords[dword] as u64) | ((self.dwords[dword + 1] as u64) << 32))
    }
}

impl<const N: usize> Default for FieldPacked<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> fmt::Debug for FieldPacked<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, dw) in self.dwords.iter().enumerate() {
            if i != 0 {
                write!(f, " ")?;
            }
            write!(f, "DW{}={:#010x}", i, dw)?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConformanceError;

    #[test]
    fn test_set_get_all_valid_positions() {
        let mut s = FieldPacked::<16>::new();
        for dw in 0..16 {
            for off in 0..4 {
                let v = (dw * 4 + off) as u8 ^ 0xA5;
                s.set_byte(v, dw, off).unwrap();
                assert_eq!(s.get_byte(dw, off).unwrap(), v);
            }
            for off in 0..3 {
                let v = 0xBEEF ^ (dw as u16) << 4 ^ off as u16;
                s.set_word(v, dw, off).unwrap();
                assert_eq!(s.get_word(dw, off).unwrap(), v);
            }
            s.set_dword(0xDEAD_0000 | dw as u32, dw).unwrap();
            assert_eq!(s.get_dword(dw).unwrap(), 0xDEAD_0000 | dw as u32);
        }
    }

    #[test]
    fn test_writes_touch_only_target_bytes() {
        let mut s = FieldPacked::<4>::from_dwords([0x1122_3344; 4]);
        s.set_byte(0xAA, 1, 2).unwrap();
        assert_eq!(s.get_dword(1).unwrap(), 0x11AA_3344);
        s.set_word(0xBBCC, 2, 1).unwrap();
        assert_eq!(s.get_dword(2).unwrap(), 0x11BB_CC44);
        assert_eq!(s.get_dword(0).unwrap(), 0x1122_3344);
        assert_eq!(s.get_dword(3).unwrap(), 0x1122_3344);
    }

    #[test]
    fn test_invalid_positions_fail_without_partial_write() {
        let mut s = FieldPacked::<16>::from_dwords([0x5555_5555; 16]);
        let before = s;

        let err = s.set_word(0xFFFF, 0, 3).unwrap_err();
        assert_eq!(
            err,
            ConformanceError::ProtocolLayout(LayoutViolation {
                dword: 0,
                byte_offset: 3,
                width: 2,
                len: 16
            })
        );
        assert!(s.set_byte(0xFF, 16, 0).is_err());
        assert!(s.set_byte(0xFF, 0, 4).is_err());
        assert!(s.set_dword(0xFFFF_FFFF, 16).is_err());
        assert!(s.set_qword(u64::MAX, 15).is_err());
        assert!(s.get_word(2, 3).is_err());
        assert_eq!(s, before);
    }

    #[test]
    fn test_qword_is_low_dword_first() {
        let mut s = FieldPacked::<16>::new();
        s.set_qword(0x0123_4567_89AB_CDEF, 6).unwrap();
        assert_eq!(s.get_dword(6).unwrap(), 0x89AB_CDEF);
        assert_eq!(s.get_dword(7).unwrap(), 0x0123_4567);
        assert_eq!(s.get_qword(6).unwrap(), 0x0123_4567_89AB_CDEF);
    }

    #[test]
    fn test_le_bytes() {
        let s = FieldPacked::<2>::from_dwords([0x0403_0201, 0x0807_0605]);
        let mut out = [0u8; 8];
        assert_eq!(s.write_le_bytes(&mut out), 8);
        assert_eq!(out, [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(FieldPacked::<2>::from_le_bytes(&out), s);
    }
}
