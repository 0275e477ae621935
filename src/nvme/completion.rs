// ============================================================================
// src/nvme/completion.rs - Completion Queue Entry View
// ============================================================================
//!
//! 完了エントリ（16バイト, 4 DWORD）の読み取りビュー
//!
//! DW3のレイアウト:
//! - bits 15:0  CID
//! - bit  16    Phase Tag
//! - bits 31:17 Status Field (SC 8 / SCT 3 / CRD 2 / More / DNR)

use core::fmt;

use crate::error::{ConformanceError, LayoutViolation, Result};
use crate::nvme::defs::{CQE_DWORDS, NvmeStatus, cqe_layout};
use crate::nvme::field::FieldPacked;

// ============================================================================
// Status Field
// ============================================================================

/// 完了エントリのステータスフィールド（15ビット）
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct StatusField(u16);

impl StatusField {
    /// 成功
    pub const SUCCESS: Self = Self(0);

    /// 生の15ビット値から作成
    pub const fn from_raw(raw: u16) -> Self {
        Self(raw & 0x7FFF)
    }

    /// SCT/SCから作成
    pub const fn new(sct: u8, sc: u8) -> Self {
        Self((((sct as u16) & 0x7) << 8) | sc as u16)
    }

    /// DNRビットを設定したコピー
    pub const fn with_dnr(self) -> Self {
        Self(self.0 | (1 << 14))
    }

    /// 生の15ビット値
    pub const fn raw(&self) -> u16 {
        self.0
    }

    /// Status Code
    pub const fn sc(&self) -> u8 {
        self.0 as u8
    }

    /// Status Code Type
    pub const fn sct(&self) -> u8 {
        ((self.0 >> 8) & 0x7) as u8
    }

    /// Command Retry Delay
    pub const fn crd(&self) -> u8 {
        ((self.0 >> 11) & 0x3) as u8
    }

    /// More
    pub const fn more(&self) -> bool {
        self.0 & (1 << 13) != 0
    }

    /// Do Not Retry
    pub const fn dnr(&self) -> bool {
        self.0 & (1 << 14) != 0
    }

    /// SCT=0 かつ SC=0
    pub const fn is_success(&self) -> bool {
        self.sct() == 0 && self.sc() == 0
    }

    /// Generic Command Status としての分類
    pub fn kind(&self) -> NvmeStatus {
        NvmeStatus::from_parts(self.sct(), self.sc())
    }
}

impl fmt::Debug for StatusField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "StatusField {{ sct: {:#x}, sc: {:#04x}, crd: {}, more: {}, dnr: {} }}",
            self.sct(),
            self.sc(),
            self.crd(),
            self.more(),
            self.dnr()
        )
    }
}

// ============================================================================
// Completion Entry
// ============================================================================

/// 完了エントリ
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct CompletionEntry(FieldPacked<CQE_DWORDS>);

impl CompletionEntry {
    /// ワイヤ上のバイト数
    pub const BYTES: usize = FieldPacked::<CQE_DWORDS>::BYTES;

    /// フィールドを指定して作成（デバイスモデル用）
    pub fn new(
        cid: u16,
        phase: bool,
        status: StatusField,
        sq_head: u16,
        sq_id: u16,
        result: [u32; 2],
    ) -> Self {
        let dw3 = (cid as u32)
            | ((phase as u32) << cqe_layout::PHASE_BIT)
            | ((status.raw() as u32) << cqe_layout::STATUS_SHIFT);
        Self(FieldPacked::from_dwords([
            result[0],
            result[1],
            (sq_head as u32) | ((sq_id as u32) << 16),
            dw3,
        ]))
    }

    /// リトルエンディアンのバイト列から作成
    pub fn from_le_bytes(bytes: &[u8]) -> Self {
        Self(FieldPacked::from_le_bytes(bytes))
    }

    /// リトルエンディアンのバイト列に書き出す
    pub fn write_le_bytes(&self, out: &mut [u8]) -> usize {
        self.0.write_le_bytes(out)
    }

    /// 生のワイヤ構造体
    pub fn fields(&self) -> &FieldPacked<CQE_DWORDS> {
        &self.0
    }

    fn dw(&self, index: usize) -> u32 {
        self.0.dwords()[index]
    }

    /// コマンドID
    pub fn command_identifier(&self) -> u16 {
        self.dw(cqe_layout::DW_STATUS) as u16
    }

    /// Phase Tag
    pub fn phase(&self) -> bool {
        self.dw(cqe_layout::DW_STATUS) & (1 << cqe_layout::PHASE_BIT) != 0
    }

    /// ステータスフィールド
    pub fn status(&self) -> StatusField {
        StatusField::from_raw((self.dw(cqe_layout::DW_STATUS) >> cqe_layout::STATUS_SHIFT) as u16)
    }

    /// 成功したか
    pub fn is_success(&self) -> bool {
        self.status().is_success()
    }

    /// Status Code
    pub fn status_code(&self) -> u8 {
        self.status().sc()
    }

    /// Generic Command Status としての分類
    pub fn status_kind(&self) -> NvmeStatus {
        self.status().kind()
    }

    /// SQ Head Pointer
    pub fn sq_head(&self) -> u16 {
        self.dw(cqe_layout::DW_SQ) as u16
    }

    /// SQ Identifier
    pub fn sq_id(&self) -> u16 {
        (self.dw(cqe_layout::DW_SQ) >> 16) as u16
    }

    /// コマンド固有の結果（DW0 または DW1）
    pub fn result_field(&self, index: usize) -> Result<u32> {
        match index {
            0 => Ok(self.dw(cqe_layout::DW_RESULT0)),
            1 => Ok(self.dw(cqe_layout::DW_RESULT1)),
            _ => Err(ConformanceError::ProtocolLayout(LayoutViolation {
                dword: index,
                byte_offset: 0,
                width: 4,
                len: 2,
            })),
        }
    }
}

impl fmt::Debug for CompletionEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionEntry")
            .field("cid", &self.command_identifier())
            .field("phase", &self.phase())
            .field("status", &self.status())
            .field("sq_head", &self.sq_head())
            .field("sq_id", &self.sq_id())
            .field("dw0", &self.dw(cqe_layout::DW_RESULT0))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nvme::defs::status_type;

    #[test]
    fn test_decode_wire_bytes() {
        // DW0=0x11, DW1=0, DW2 = SQID 3 / head 7, DW3 = CID 0x42 / phase 1 / SC 0x02
        let bytes = [
            0x11, 0, 0, 0, //
            0, 0, 0, 0, //
            0x07, 0x00, 0x03, 0x00, //
            0x42, 0x00, 0x05, 0x00,
        ];
        let ce = CompletionEntry::from_le_bytes(&bytes);
        assert_eq!(ce.command_identifier(), 0x42);
        assert!(ce.phase());
        assert_eq!(ce.status_code(), 0x02);
        assert_eq!(ce.status().sct(), status_type::GENERIC);
        assert!(!ce.is_success());
        assert_eq!(ce.status_kind(), NvmeStatus::InvalidFieldInCommand);
        assert_eq!(ce.sq_head(), 7);
        assert_eq!(ce.sq_id(), 3);
        assert_eq!(ce.result_field(0).unwrap(), 0x11);
    }

    #[test]
    fn test_builder_matches_decoder() {
        let status = StatusField::new(status_type::COMMAND_SPECIFIC, 0x0D).with_dnr();
        let ce = CompletionEntry::new(0xBEEF, false, status, 12, 1, [0xAA, 0xBB]);
        assert_eq!(ce.command_identifier(), 0xBEEF);
        assert!(!ce.phase());
        assert_eq!(ce.status(), status);
        assert!(ce.status().dnr());
        assert!(!ce.status().more());
        assert_eq!(ce.status_kind(), NvmeStatus::Unknown);
        assert_eq!(ce.result_field(1).unwrap(), 0xBB);

        let mut wire = [0u8; CompletionEntry::BYTES];
        assert_eq!(ce.write_le_bytes(&mut wire), 16);
        assert_eq!(CompletionEntry::from_le_bytes(&wire), ce);
    }

    #[test]
    fn test_result_field_out_of_range() {
        let ce = CompletionEntry::default();
        assert!(matches!(
            ce.result_field(2),
            Err(ConformanceError::ProtocolLayout(_))
        ));
        assert!(ce.is_success());
    }
}
